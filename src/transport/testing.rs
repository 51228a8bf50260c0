//! In-memory agent for tests.
//!
//! [`MockLauncher`] wires the supervisor to an agent task over
//! `tokio::io::duplex` pipes. The task decodes each request and hands it to a
//! scripted responder.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{oneshot, watch};

use super::protocol::{ReceivedRequest, ResponseEnvelope};
use super::stdio_pipe::{AgentChild, AgentIo, AgentLauncher, BoxedReader, CommandOutput, LaunchSpec};
use super::{recv_message, send_message};

/// What the mock agent does with one request.
pub enum Reply {
    Respond(ResponseEnvelope),
    /// Respond after a delay without blocking later requests.
    Later(Duration, ResponseEnvelope),
    /// Never answer.
    Silent,
    /// Write raw bytes instead of a frame.
    Raw(Vec<u8>),
    /// Exit with the given code.
    Exit(i32),
}

type Responder = dyn Fn(&ReceivedRequest) -> Reply + Send + Sync;

pub struct MockLauncher {
    responder: Arc<Responder>,
    stderr_banner: Option<String>,
    fail_spawn: bool,
    launch_delay: Option<Duration>,
    hold_on_eof: bool,
    launches: AtomicUsize,
    live: Arc<AtomicUsize>,
    peak_live: Arc<AtomicUsize>,
    runs: Mutex<Vec<LaunchSpec>>,
    specs: Mutex<Vec<LaunchSpec>>,
}

impl MockLauncher {
    pub fn new(responder: impl Fn(&ReceivedRequest) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            responder: Arc::new(responder),
            stderr_banner: None,
            fail_spawn: false,
            launch_delay: None,
            hold_on_eof: false,
            launches: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            peak_live: Arc::new(AtomicUsize::new(0)),
            runs: Mutex::new(Vec::new()),
            specs: Mutex::new(Vec::new()),
        }
    }

    /// Agent that echoes the cookie with `{"pong": true}`.
    pub fn pong() -> Self {
        Self::new(|rq| Reply::Respond(ResponseEnvelope::reply(&rq.cookie, serde_json::json!({"pong": true}))))
    }

    pub fn silent() -> Self {
        Self::new(|_| Reply::Silent)
    }

    pub fn failing() -> Self {
        let mut l = Self::silent();
        l.fail_spawn = true;
        l
    }

    #[must_use]
    pub fn with_stderr(mut self, banner: &str) -> Self {
        self.stderr_banner = Some(banner.to_string());
        self
    }

    /// Delay each launch, keeping the generation in `Starting`.
    #[must_use]
    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = Some(delay);
        self
    }

    /// Keep running after stdin closes, until killed.
    #[must_use]
    pub fn ignoring_stdin_close(mut self) -> Self {
        self.hold_on_eof = true;
        self
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Most agents ever running at the same time.
    pub fn peak_live(&self) -> usize {
        self.peak_live.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> Vec<LaunchSpec> {
        self.runs.lock().clone()
    }

    pub fn specs(&self) -> Vec<LaunchSpec> {
        self.specs.lock().clone()
    }
}

#[async_trait]
impl AgentLauncher for MockLauncher {
    async fn run(&self, spec: &LaunchSpec) -> Result<CommandOutput> {
        self.runs.lock().push(spec.clone());
        Ok(CommandOutput {
            success: true,
            stdout: String::new(),
            stderr: "installed\n".into(),
        })
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<AgentIo> {
        self.specs.lock().push(spec.clone());
        if let Some(delay) = self.launch_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_spawn {
            anyhow::bail!("Failed to spawn agent: {}: No such file or directory", spec.program);
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_live.fetch_max(live, Ordering::SeqCst);

        let (client_stdin, agent_stdin) = tokio::io::duplex(64 * 1024);
        let (agent_stdout, client_stdout) = tokio::io::duplex(64 * 1024);
        let (mut agent_stderr, client_stderr) = tokio::io::duplex(4 * 1024);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = watch::channel(false);

        if let Some(banner) = &self.stderr_banner {
            agent_stderr.write_all(banner.as_bytes()).await?;
        }

        let responder = Arc::clone(&self.responder);
        let hold_on_eof = self.hold_on_eof;
        let live = Arc::clone(&self.live);
        tokio::spawn(async move {
            let code = serve(responder, agent_stdin, agent_stdout, kill_rx, hold_on_eof).await;
            live.fetch_sub(1, Ordering::SeqCst);
            drop(agent_stderr);
            let _ = exit_tx.send(code);
        });

        Ok(AgentIo {
            stdin: Box::new(client_stdin),
            stdout: Box::new(client_stdout),
            stderr: Some(Box::new(client_stderr) as BoxedReader),
            child: Box::new(MockChild {
                exit: Some(exit_rx),
                kill: kill_tx,
            }),
        })
    }
}

async fn serve(
    responder: Arc<Responder>,
    mut input: DuplexStream,
    output: DuplexStream,
    mut kill: watch::Receiver<bool>,
    hold_on_eof: bool,
) -> i32 {
    let output = Arc::new(tokio::sync::Mutex::new(output));
    loop {
        let received = tokio::select! {
            r = recv_message(&mut input) => Some(r),
            _ = kill.changed() => None,
        };
        let bytes = match received {
            Some(Ok(b)) => b,
            Some(Err(_)) if hold_on_eof => {
                let _ = kill.changed().await;
                return -9;
            }
            Some(Err(_)) => return 0,
            None => return -9,
        };
        let Ok(rq) = serde_json::from_slice::<ReceivedRequest>(&bytes) else {
            return 2;
        };

        match (responder.as_ref())(&rq) {
            Reply::Respond(rs) => {
                let payload = serde_json::to_vec(&rs).unwrap_or_default();
                let mut out = output.lock().await;
                if send_message(&mut *out, &payload).await.is_err() {
                    return 0;
                }
            }
            Reply::Later(delay, rs) => {
                let output = Arc::clone(&output);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let payload = serde_json::to_vec(&rs).unwrap_or_default();
                    let mut out = output.lock().await;
                    let _ = send_message(&mut *out, &payload).await;
                });
            }
            Reply::Silent => {}
            Reply::Raw(raw) => {
                let mut out = output.lock().await;
                let _ = out.write_all(&raw).await;
                let _ = out.flush().await;
            }
            Reply::Exit(code) => return code,
        }
    }
}

struct MockChild {
    exit: Option<oneshot::Receiver<i32>>,
    kill: watch::Sender<bool>,
}

#[async_trait]
impl AgentChild for MockChild {
    async fn wait(&mut self) -> Result<Option<i32>> {
        match self.exit.as_mut() {
            Some(rx) => {
                let code = rx.await.ok();
                self.exit = None;
                Ok(code)
            }
            None => Ok(None),
        }
    }

    async fn terminate(&mut self, grace: Duration) -> Result<()> {
        if let Some(rx) = self.exit.as_mut() {
            if tokio::time::timeout(grace, &mut *rx).await.is_err() {
                self.kill.send_replace(true);
                let _ = rx.await;
            }
        }
        self.exit = None;
        Ok(())
    }

    fn id(&self) -> Option<u32> {
        None
    }
}
