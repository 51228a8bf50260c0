//! One agent process generation.
//!
//! A [`Supervisor`] owns a single spawn of the agent, from install step to
//! exit. It moves through `Starting → Running → Stopping → Stopped` exactly
//! once and is never reused; a restart builds a fresh one.
//!
//! Four tasks serve a running generation:
//! - *writer* drains the outbound channel into the agent's stdin
//! - *reader* decodes response frames and resolves pending requests
//! - *logger* copies the agent's stderr into the output log
//! - *waiter* watches for process exit and terminates the process on stop

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chan::Chan;
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::output::OutputLogger;
use crate::registry::Registry;
use crate::request::{PendingRequest, RequestContext, Response, ResponseCallback};
use crate::token::TokenCounter;
use crate::transport::protocol::{actions_summary, Action, ResponseEnvelope};
use crate::transport::stdio_pipe::{BoxedReader, BoxedWriter};
use crate::transport::{
    decode_response, encode_request, recv_message, send_message, AgentChild, AgentIo,
    AgentLauncher, FrameError, LaunchSpec, RequestEnvelope,
};

/// Lifecycle of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl Phase {
    pub const fn is_stopping(self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped)
    }
}

/// Lifecycle hooks for whoever owns a generation.
pub trait GenerationObserver: Send + Sync {
    fn on_starting(&self, _generation: u64) {}

    /// The first response arrived.
    fn on_ready(&self, _generation: u64) {}

    fn on_stopped(&self, _generation: u64) {}

    /// Called for every decoded response. Returning `false` marks the
    /// generation as stale and it stops itself.
    fn on_response(&self, _generation: u64, _rs: &Response) -> bool {
        true
    }
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoObserver;

impl GenerationObserver for NoObserver {}

pub struct Supervisor {
    generation: u64,
    config: Arc<AgentConfig>,
    launcher: Arc<dyn AgentLauncher>,
    observer: Arc<dyn GenerationObserver>,
    out: Arc<OutputLogger>,
    cookies: TokenCounter,
    registry: Registry,
    outbound: Chan<Arc<PendingRequest>>,
    phase: watch::Sender<Phase>,
    startup_error: Mutex<Option<String>>,
    ready: AtomicBool,
    tag_warned: AtomicBool,
    shutdown: Notify,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    /// Flips to `true` once no process of this generation is left running.
    reaped: watch::Sender<bool>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("domain", &self.domain())
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Create generation `generation`, logging as `domain` under `parent`.
    ///
    /// Nothing runs until [`start`](Self::start).
    pub fn new(
        generation: u64,
        domain: &str,
        config: Arc<AgentConfig>,
        launcher: Arc<dyn AgentLauncher>,
        observer: Arc<dyn GenerationObserver>,
        parent: &Arc<OutputLogger>,
    ) -> Arc<Self> {
        let (phase, _) = watch::channel(Phase::Starting);
        Arc::new(Self {
            generation,
            cookies: TokenCounter::new(format!("{domain},request")),
            out: parent.child(domain),
            config,
            launcher,
            observer,
            registry: Registry::new(),
            outbound: Chan::new(),
            phase,
            startup_error: Mutex::new(None),
            ready: AtomicBool::new(false),
            tag_warned: AtomicBool::new(false),
            shutdown: Notify::new(),
            pumps: Mutex::new(Vec::new()),
            reaped: watch::channel(false).0,
        })
    }

    pub const fn generation(&self) -> u64 {
        self.generation
    }

    pub fn domain(&self) -> &str {
        self.out.domain()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Whether `cookie` is still waiting for a response.
    pub fn is_pending(&self, cookie: &str) -> bool {
        self.registry.contains(cookie)
    }

    pub fn pending_count(&self) -> usize {
        self.registry.len()
    }

    /// Install (if needed), spawn and attach the pumps in the background.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.start_after(None)
    }

    /// Like [`start`](Self::start), but nothing is installed or spawned
    /// before `previous` (see [`reaped`](Self::reaped)) reports its process gone.
    pub fn start_after(self: &Arc<Self>, previous: Option<watch::Receiver<bool>>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(previous))
    }

    /// Reports `true` once this generation has no process left running.
    pub fn reaped(&self) -> watch::Receiver<bool> {
        self.reaped.subscribe()
    }

    async fn run(self: Arc<Self>, previous: Option<watch::Receiver<bool>>) {
        self.observer.on_starting(self.generation);
        self.out.println("starting");

        if let Some(mut previous) = previous {
            debug!(domain = %self.domain(), "Waiting for the previous agent to exit");
            let dropped = previous.wait_for(|reaped| *reaped).await.is_err();
            if dropped {
                debug!(domain = %self.domain(), "Previous generation dropped");
            }
        }

        let base: Vec<(String, String)> = std::env::vars().collect();
        if !self.phase().is_stopping() {
            if let Some(spec) = self.config.install_spec(base.clone()) {
                self.install(&spec).await;
            }
        }
        if self.phase().is_stopping() {
            self.reaped.send_replace(true);
            return;
        }

        let spec = self.config.launch_spec(base);
        match self.launcher.launch(&spec).await {
            Ok(io) => self.attach(io),
            Err(e) => {
                let msg = format!("{e:#}");
                self.out.println(format!("Cannot start agent: {msg}"));
                *self.startup_error.lock() = Some(msg);
                self.stop();
                self.reaped.send_replace(true);
            }
        }
    }

    async fn install(&self, spec: &LaunchSpec) {
        self.out.println(format!("install: {spec}"));
        match self.launcher.run(spec).await {
            Ok(output) => {
                for text in [&output.stdout, &output.stderr] {
                    let text = text.trim();
                    if !text.is_empty() {
                        self.out.println(format!("install output:\n{text}"));
                    }
                }
                if !output.success {
                    self.out.println("install failed");
                } else if let Err(e) = self.config.write_install_stamp() {
                    warn!(error = %e, "Failed to record agent install");
                }
            }
            Err(e) => self.out.println(format!("install failed: {e:#}")),
        }
    }

    fn attach(self: &Arc<Self>, io: AgentIo) {
        let AgentIo {
            stdin,
            stdout,
            stderr,
            child,
        } = io;
        info!(domain = %self.domain(), pid = ?child.id(), "Agent spawned");

        {
            let mut pumps = self.pumps.lock();
            if self.phase().is_stopping() {
                debug!(domain = %self.domain(), "Stopped while spawning, not attaching");
            } else {
                pumps.push(tokio::spawn(Arc::clone(self).write_loop(stdin)));
                pumps.push(tokio::spawn(Arc::clone(self).read_loop(stdout)));
                if let Some(stderr) = stderr {
                    pumps.push(tokio::spawn(Arc::clone(self).log_loop(stderr)));
                }
                self.phase.send_if_modified(|p| {
                    if *p == Phase::Starting {
                        *p = Phase::Running;
                        true
                    } else {
                        false
                    }
                });
            }
        }

        // Not tracked with the pumps: it must outlive `stop()` to reap the child.
        tokio::spawn(Arc::clone(self).wait_loop(child));
    }

    /// Send `actions` to this generation.
    ///
    /// Waits at most the start timeout for a starting agent. Failures are
    /// reported through the returned request, never as an `Err`.
    pub async fn send(
        &self,
        actions: Vec<Action>,
        context: RequestContext,
        callback: Option<ResponseCallback>,
    ) -> Arc<PendingRequest> {
        let (_, token) = self.cookies.next();
        let cookie = format!("actions({}),{token}", actions_summary(&actions));
        let rq = Arc::new(PendingRequest::new(
            cookie,
            actions,
            context,
            self.generation,
            callback,
        ));

        let limit = self.config.timeouts.start();
        match self.wait_started(limit).await {
            Phase::Running => {}
            Phase::Starting => {
                let ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                self.fail(&rq, AgentError::NotReadyTimeout(ms));
                return rq;
            }
            Phase::Stopping | Phase::Stopped => {
                let err = self
                    .startup_error
                    .lock()
                    .clone()
                    .map_or(AgentError::AgentStopping, AgentError::StartupFailure);
                self.fail(&rq, err);
                return rq;
            }
        }

        self.registry.register(Arc::clone(&rq));
        if !self.outbound.put(Arc::clone(&rq)) || self.phase().is_stopping() {
            // Raced with stop(): the drain may already have run.
            if let Some(rq) = self.registry.pop(rq.cookie()) {
                self.fail(&rq, AgentError::AgentStopping);
            }
        }
        rq
    }

    /// Wait up to `limit` for the generation to leave `Starting`.
    pub async fn wait_started(&self, limit: Duration) -> Phase {
        let mut rx = self.phase.subscribe();
        let started = tokio::time::timeout(limit, rx.wait_for(|p| *p != Phase::Starting)).await;
        if started.is_err() {
            debug!(domain = %self.domain(), "Agent not started in time");
        }
        self.phase()
    }

    /// Wait up to `limit` for the generation to reach `Stopped`.
    pub async fn wait_stopped(&self, limit: Duration) -> bool {
        let mut rx = self.phase.subscribe();
        let stopped = tokio::time::timeout(limit, rx.wait_for(|p| *p == Phase::Stopped))
            .await
            .is_ok();
        stopped
    }

    fn fail(&self, rq: &PendingRequest, err: AgentError) {
        rq.resolve(Response::failed(rq.cookie(), self.generation, err));
    }

    /// Tear the generation down. Idempotent.
    ///
    /// Every request still pending is resolved with `AgentStopping`. The
    /// process itself is reaped in the background after the grace period.
    pub fn stop(&self) {
        let stopping = self.phase.send_if_modified(|p| {
            if p.is_stopping() {
                false
            } else {
                *p = Phase::Stopping;
                true
            }
        });
        if !stopping {
            return;
        }

        self.out.println("stopping");
        self.outbound.close();
        self.shutdown.notify_one();
        for pump in self.pumps.lock().drain(..) {
            pump.abort();
        }

        let drained = self.registry.drain_all();
        if !drained.is_empty() {
            debug!(
                domain = %self.domain(),
                count = drained.len(),
                unsent = self.outbound.len(),
                "Aborting pending requests"
            );
        }
        for rq in drained {
            self.fail(&rq, AgentError::AgentStopping);
        }

        self.observer.on_stopped(self.generation);
        self.phase.send_replace(Phase::Stopped);
    }

    async fn write_loop(self: Arc<Self>, mut stdin: BoxedWriter) {
        while let Some(rq) = self.outbound.get().await {
            if rq.is_done() {
                continue;
            }

            let envelope = RequestEnvelope::new(rq.cookie(), rq.context(), rq.actions());
            let sent = match encode_request(&envelope) {
                Ok(payload) => send_message(&mut stdin, &payload).await,
                Err(e) => Err(e),
            };
            let Err(e) = sent else {
                continue;
            };

            let msg = format!("{e:#}");
            self.out.println(format!("ipc: send: {msg}"));
            let err = AgentError::TransportFailure(msg);
            let fatal = err.is_fatal();
            if let Some(rq) = self.registry.pop(rq.cookie()) {
                self.fail(&rq, err);
            }
            if fatal {
                self.stop();
                return;
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut stdout: BoxedReader) {
        loop {
            let payload = match recv_message(&mut stdout).await {
                Ok(p) => p,
                Err(FrameError::EndOfStream) => {
                    debug!(domain = %self.domain(), "Agent closed stdout");
                    break;
                }
                Err(e) => {
                    self.out.println(format!("ipc: recv: {e}"));
                    break;
                }
            };

            match decode_response(&payload) {
                Ok(env) => {
                    if !self.handle_response(env) {
                        break;
                    }
                }
                Err(e) => {
                    self.out.println(format!("ipc: recv: {e:#}"));
                    break;
                }
            }
        }
        self.stop();
    }

    /// Returns `false` once this generation turns out to be stale.
    fn handle_response(&self, mut env: ResponseEnvelope) -> bool {
        if !self.ready.swap(true, Ordering::SeqCst) {
            self.observer.on_ready(self.generation);
        }

        env.expand_sentinels();
        self.check_tag(&env.tag);
        let rs = Response::from_envelope(env, self.generation);

        match self.registry.pop(&rs.cookie) {
            Some(rq) => {
                rq.resolve(rs.clone());
            }
            None if rs.cookie.is_empty() => {}
            None => self.out.println(format!("unexpected response: {}", rs.cookie)),
        }

        if self.observer.on_response(self.generation, &rs) {
            return true;
        }
        debug!(
            domain = %self.domain(),
            error = %AgentError::StaleGeneration(self.generation),
            "Stopping stale agent"
        );
        false
    }

    fn check_tag(&self, received: &str) {
        let Some(expected) = self.config.tag.as_deref() else {
            return;
        };
        if received.is_empty() || received == expected {
            return;
        }
        if !self.tag_warned.swap(true, Ordering::SeqCst) {
            let err = AgentError::ProtocolTagMismatch {
                received: received.to_string(),
                expected: expected.to_string(),
            };
            warn!(domain = %self.domain(), "{err}");
            self.out.println(format!("{err}. Please restart the editor"));
        }
    }

    async fn log_loop(self: Arc<Self>, stderr: BoxedReader) {
        let mut reader = BufReader::new(stderr);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    let text = text.trim_end();
                    if !text.is_empty() {
                        self.out.println(format!("log: {text}"));
                    }
                }
                Err(e) => {
                    debug!(domain = %self.domain(), error = %e, "Agent stderr closed");
                    break;
                }
            }
        }
    }

    async fn wait_loop(self: Arc<Self>, mut child: Box<dyn AgentChild>) {
        let exited = tokio::select! {
            status = child.wait() => Some(status),
            () = self.shutdown.notified() => None,
        };

        match exited {
            Some(Ok(Some(0) | None)) => self.out.println("exited"),
            Some(Ok(Some(code))) => self.out.println(format!("exited with status {code}")),
            Some(Err(e)) => self.out.println(format!("wait: {e:#}")),
            None => {
                if let Err(e) = child.terminate(self.config.timeouts.stop_grace()).await {
                    warn!(domain = %self.domain(), error = %e, "Failed to terminate agent");
                }
                debug!(domain = %self.domain(), "Agent terminated");
            }
        }
        self.reaped.send_replace(true);
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;
    use crate::output::MemorySink;
    use crate::transport::protocol::ReceivedRequest;
    use crate::transport::testing::{MockLauncher, Reply};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        stale: AtomicBool,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    impl GenerationObserver for Recorder {
        fn on_starting(&self, generation: u64) {
            self.events.lock().push(format!("starting {generation}"));
        }

        fn on_ready(&self, generation: u64) {
            self.events.lock().push(format!("ready {generation}"));
        }

        fn on_stopped(&self, generation: u64) {
            self.events.lock().push(format!("stopped {generation}"));
        }

        fn on_response(&self, _generation: u64, _rs: &Response) -> bool {
            !self.stale.load(Ordering::SeqCst)
        }
    }

    struct Harness {
        sv: Arc<Supervisor>,
        launcher: Arc<MockLauncher>,
        sink: Arc<MemorySink>,
        observer: Arc<Recorder>,
    }

    fn harness(launcher: MockLauncher, config: AgentConfig) -> Harness {
        let launcher = Arc::new(launcher);
        let sink = Arc::new(MemorySink::new());
        let observer = Arc::new(Recorder::default());
        let root = OutputLogger::root("margo", Arc::clone(&sink) as _);
        let sv = Supervisor::new(
            7,
            "agent#007",
            Arc::new(config),
            Arc::clone(&launcher) as _,
            Arc::clone(&observer) as _,
            &root,
        );
        sv.start();
        Harness {
            sv,
            launcher,
            sink,
            observer,
        }
    }

    fn ping() -> Vec<Action> {
        vec![Action::new("Ping")]
    }

    #[tokio::test]
    async fn ping_round_trip() {
        let h = harness(MockLauncher::pong(), AgentConfig::default());

        let rq = h.sv.send(ping(), RequestContext::default(), None).await;
        assert_eq!(rq.cookie(), "actions(Ping),agent#007,request#1");

        let rs = rq.wait(Duration::from_millis(100)).await.expect("response");
        assert_eq!(rs.error, "");
        assert_eq!(rs.data, json!({"pong": true}));
        assert_eq!(rs.generation, 7);
        assert!(!h.sv.is_pending(rq.cookie()));
        assert_eq!(h.sv.phase(), Phase::Running);
        assert_eq!(h.observer.events(), vec!["starting 7", "ready 7"]);

        h.sv.stop();
        assert_eq!(h.sv.phase(), Phase::Stopped);
    }

    #[tokio::test]
    async fn responses_match_by_cookie_not_order() {
        let h = harness(
            MockLauncher::new(|rq| {
                let delay = if rq.actions[0].name == "Slow" { 60 } else { 5 };
                Reply::Later(
                    Duration::from_millis(delay),
                    ResponseEnvelope::reply(&rq.cookie, json!({"name": rq.actions[0].name})),
                )
            }),
            AgentConfig::default(),
        );

        let slow = h.sv.send(vec![Action::new("Slow")], RequestContext::default(), None).await;
        let fast = h.sv.send(vec![Action::new("Fast")], RequestContext::default(), None).await;

        let fast_rs = fast.wait(Duration::from_millis(500)).await.unwrap();
        assert!(!slow.is_done());
        let slow_rs = slow.wait(Duration::from_millis(500)).await.unwrap();
        assert_eq!(fast_rs.data["name"], "Fast");
        assert_eq!(slow_rs.data["name"], "Slow");
        h.sv.stop();
    }

    #[tokio::test]
    async fn timeout_keeps_request_registered_until_stop() {
        let h = harness(MockLauncher::silent(), AgentConfig::default());

        let rq = h.sv.send(ping(), RequestContext::default(), None).await;
        assert!(rq.wait(Duration::from_millis(50)).await.is_none());
        assert!(h.sv.is_pending(rq.cookie()));

        h.sv.stop();
        assert!(!h.sv.is_pending(rq.cookie()));
        let rs = rq.result().unwrap();
        assert_eq!(rs.failure.map(|f| f.kind()), Some(ErrorKind::AgentStopping));
        assert_eq!(rs.error, "agent stopping. request aborted");
    }

    #[tokio::test]
    async fn stop_resolves_each_pending_request_once() {
        let h = harness(MockLauncher::silent(), AgentConfig::default());
        let stopped = Arc::new(AtomicUsize::new(0));

        let mut requests = Vec::new();
        for _ in 0..16 {
            let counter = Arc::clone(&stopped);
            let cb: ResponseCallback = Box::new(move |rs| {
                if rs.failure.as_ref().map(AgentError::kind) == Some(ErrorKind::AgentStopping) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            });
            requests.push(h.sv.send(ping(), RequestContext::default(), Some(cb)).await);
        }
        assert_eq!(h.sv.pending_count(), 16);

        h.sv.stop();
        h.sv.stop();
        assert_eq!(stopped.load(Ordering::SeqCst), 16);
        assert!(requests.iter().all(|rq| rq.is_done()));
        assert_eq!(h.sv.pending_count(), 0);
        assert_eq!(
            h.observer.events().iter().filter(|e| e.starts_with("stopped")).count(),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_are_each_aborted_once() {
        let h = harness(MockLauncher::silent(), AgentConfig::default());
        let stopped = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let sv = Arc::clone(&h.sv);
                let counter = Arc::clone(&stopped);
                tokio::spawn(async move {
                    let cb: ResponseCallback = Box::new(move |rs| {
                        if rs.failure.as_ref().map(AgentError::kind) == Some(ErrorKind::AgentStopping) {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }
                    });
                    sv.send(ping(), RequestContext::default(), Some(cb)).await
                })
            })
            .collect();
        let mut requests = Vec::new();
        for task in tasks {
            requests.push(task.await.unwrap());
        }

        let cookies: std::collections::HashSet<_> = requests.iter().map(|rq| rq.cookie().to_string()).collect();
        assert_eq!(cookies.len(), 32);
        assert_eq!(h.sv.pending_count(), 32);

        h.sv.stop();
        assert_eq!(stopped.load(Ordering::SeqCst), 32);
        assert!(requests.iter().all(|rq| rq.is_done()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sends_racing_stop_resolve_exactly_once() {
        let h = harness(MockLauncher::silent(), AgentConfig::default());
        assert_eq!(h.sv.wait_started(Duration::from_millis(200)).await, Phase::Running);
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let sv = Arc::clone(&h.sv);
                let counter = Arc::clone(&calls);
                tokio::spawn(async move {
                    let cb: ResponseCallback = Box::new(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                    sv.send(ping(), RequestContext::default(), Some(cb)).await
                })
            })
            .collect();
        h.sv.stop();

        for task in tasks {
            let rq = task.await.unwrap();
            let rs = rq.result().unwrap();
            assert_eq!(rs.failure.map(|f| f.kind()), Some(ErrorKind::AgentStopping));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 32);
        assert_eq!(h.sv.pending_count(), 0);
    }

    #[tokio::test]
    async fn reaped_only_after_process_exits() {
        let mut config = AgentConfig::default();
        config.timeouts.stop_grace_ms = 100;
        let h = harness(MockLauncher::pong().ignoring_stdin_close(), config);
        let rq = h.sv.send(ping(), RequestContext::default(), None).await;
        rq.wait(Duration::from_millis(100)).await.unwrap();

        let mut reaped = h.sv.reaped();
        h.sv.stop();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!*reaped.borrow(), "reaped before the grace period ran out");

        let done = tokio::time::timeout(Duration::from_millis(500), reaped.wait_for(|r| *r)).await;
        assert!(done.is_ok());
    }

    #[tokio::test]
    async fn successor_spawns_after_predecessor_is_reaped() {
        let mut config = AgentConfig::default();
        config.timeouts.stop_grace_ms = 100;
        config.timeouts.start_ms = 1000;
        let h = harness(MockLauncher::pong().ignoring_stdin_close(), config.clone());
        let rq = h.sv.send(ping(), RequestContext::default(), None).await;
        rq.wait(Duration::from_millis(100)).await.unwrap();

        let root = OutputLogger::root("margo", Arc::clone(&h.sink) as _);
        let next = Supervisor::new(
            8,
            "agent#008",
            Arc::new(config),
            Arc::clone(&h.launcher) as _,
            Arc::new(NoObserver),
            &root,
        );
        h.sv.stop();
        next.start_after(Some(h.sv.reaped()));

        let rq = next.send(ping(), RequestContext::default(), None).await;
        assert!(rq.wait(Duration::from_millis(500)).await.unwrap().is_ok());
        assert_eq!(h.launcher.launches(), 2);
        assert_eq!(h.launcher.peak_live(), 1);
        next.stop();
    }

    #[tokio::test]
    async fn failed_spawn_counts_as_reaped() {
        let h = harness(MockLauncher::failing(), AgentConfig::default());
        let mut reaped = h.sv.reaped();
        let done = tokio::time::timeout(Duration::from_millis(200), reaped.wait_for(|r| *r)).await;
        assert!(done.is_ok());
    }

    #[tokio::test]
    async fn spawn_failure_fails_fast() {
        let h = harness(MockLauncher::failing(), AgentConfig::default());

        let rq = h.sv.send(ping(), RequestContext::default(), None).await;
        let rs = rq.result().expect("resolved immediately");
        assert_eq!(rs.failure.map(|f| f.kind()), Some(ErrorKind::StartupFailure));
        assert!(rs.error.contains("Failed to spawn agent"));
        assert!(h.sink.contains("agent#007: Cannot start agent"));
        assert_eq!(h.sv.phase(), Phase::Stopped);
    }

    #[tokio::test]
    async fn slow_start_reports_not_ready() {
        let mut config = AgentConfig::default();
        config.timeouts.start_ms = 20;
        let h = harness(
            MockLauncher::pong().with_launch_delay(Duration::from_millis(150)),
            config,
        );

        let rq = h.sv.send(ping(), RequestContext::default(), None).await;
        let rs = rq.result().expect("resolved immediately");
        assert_eq!(rs.failure, Some(AgentError::NotReadyTimeout(20)));
        assert_eq!(h.sv.phase(), Phase::Starting);

        // The generation survives and serves later calls.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let rq = h.sv.send(ping(), RequestContext::default(), None).await;
        assert!(rq.wait(Duration::from_millis(100)).await.unwrap().is_ok());
        h.sv.stop();
    }

    #[tokio::test]
    async fn malformed_frame_stops_generation() {
        let h = harness(
            MockLauncher::new(|_| Reply::Raw(b"garbage!".to_vec())),
            AgentConfig::default(),
        );

        let rq = h.sv.send(ping(), RequestContext::default(), None).await;
        let rs = rq.wait(Duration::from_millis(500)).await.unwrap();
        assert_eq!(rs.failure.map(|f| f.kind()), Some(ErrorKind::AgentStopping));
        assert!(h.sv.wait_stopped(Duration::from_millis(500)).await);
        assert!(h.sink.contains("ipc: recv: malformed frame"));
    }

    #[tokio::test]
    async fn undecodable_payload_stops_generation() {
        let h = harness(
            MockLauncher::new(|rq| match rq.actions[0].name.as_str() {
                "Bad" => Reply::Raw({
                    let mut frame = 4u32.to_be_bytes().to_vec();
                    frame.extend_from_slice(b"nope");
                    frame
                }),
                _ => Reply::Silent,
            }),
            AgentConfig::default(),
        );

        let slow = h.sv.send(ping(), RequestContext::default(), None).await;
        let bad = h.sv.send(vec![Action::new("Bad")], RequestContext::default(), None).await;
        assert!(h.sv.wait_stopped(Duration::from_millis(500)).await);
        assert!(h.sink.contains("Failed to decode response"));

        for rq in [slow, bad] {
            let rs = rq.wait(Duration::from_millis(100)).await.unwrap();
            assert_eq!(rs.failure.map(|f| f.kind()), Some(ErrorKind::AgentStopping));
        }
    }

    #[tokio::test]
    async fn agent_exit_stops_generation() {
        let h = harness(MockLauncher::new(|_| Reply::Exit(1)), AgentConfig::default());

        let rq = h.sv.send(ping(), RequestContext::default(), None).await;
        let rs = rq.wait(Duration::from_millis(500)).await.unwrap();
        assert_eq!(rs.failure.map(|f| f.kind()), Some(ErrorKind::AgentStopping));
        assert!(h.sv.wait_stopped(Duration::from_millis(500)).await);
        assert_eq!(h.launcher.launches(), 1);
    }

    #[tokio::test]
    async fn stderr_goes_to_output_log() {
        let h = harness(
            MockLauncher::pong().with_stderr("margo started\nlistening\n"),
            AgentConfig::default(),
        );
        let rq = h.sv.send(ping(), RequestContext::default(), None).await;
        rq.wait(Duration::from_millis(100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(h.sink.contains("margo: agent#007: log: margo started"));
        assert!(h.sink.contains("agent#007: log: listening"));
        h.sv.stop();
    }

    #[tokio::test]
    async fn tag_mismatch_warns_once_and_delivers() {
        let config = AgentConfig {
            tag: Some("r2".into()),
            ..AgentConfig::default()
        };
        let h = harness(
            MockLauncher::new(|rq| {
                let mut rs = ResponseEnvelope::reply(&rq.cookie, json!({"ok": 1}));
                rs.tag = "r1".into();
                Reply::Respond(rs)
            }),
            config,
        );

        for _ in 0..3 {
            let rq = h.sv.send(ping(), RequestContext::default(), None).await;
            let rs = rq.wait(Duration::from_millis(100)).await.unwrap();
            assert_eq!(rs.data, json!({"ok": 1}));
            assert_eq!(rs.tag, "r1");
        }
        let warnings = h
            .sink
            .lines()
            .iter()
            .filter(|l| l.contains("expected tag `r2'"))
            .count();
        assert_eq!(warnings, 1);
        h.sv.stop();
    }

    #[tokio::test]
    async fn base64_sentinels_are_expanded() {
        let h = harness(
            MockLauncher::new(|rq| {
                Reply::Respond(ResponseEnvelope::reply(
                    &rq.cookie,
                    json!({"Src": "base64:aGVsbG8=", "Bad": "base64:!!"}),
                ))
            }),
            AgentConfig::default(),
        );
        let rq = h.sv.send(ping(), RequestContext::default(), None).await;
        let rs = rq.wait(Duration::from_millis(100)).await.unwrap();
        assert_eq!(rs.data, json!({"Src": "hello", "Bad": ""}));
        h.sv.stop();
    }

    #[tokio::test]
    async fn stale_generation_stops_itself() {
        let h = harness(MockLauncher::pong(), AgentConfig::default());
        h.observer.stale.store(true, Ordering::SeqCst);

        let rq = h.sv.send(ping(), RequestContext::default(), None).await;
        rq.wait(Duration::from_millis(100)).await.unwrap();
        assert!(h.sv.wait_stopped(Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn install_step_runs_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            data_dir: dir.path().join("data"),
            install: Some(crate::config::InstallConfig {
                command: vec!["go".into(), "install".into(), "margo.sh".into()],
                bin_dir: dir.path().join("bin"),
            }),
            tag: Some("r1".into()),
            ..AgentConfig::default()
        };
        let h = harness(MockLauncher::pong(), config);

        let rq = h.sv.send(ping(), RequestContext::default(), None).await;
        assert!(rq.wait(Duration::from_millis(100)).await.unwrap().is_ok());

        let runs = h.launcher.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].program, "go");
        assert_eq!(runs[0].env["GO111MODULE"], "off");
        assert!(h.sink.contains("install output:"));
        assert!(dir.path().join("data").join("agent.tag").is_file());

        let spawned = h.launcher.specs();
        assert_eq!(spawned[0].program, "margo.sh");
        assert_eq!(spawned[0].args, vec!["start", "margo.sublime", "-codec", "json"]);
        assert!(spawned[0].env.contains_key("MARGO_DATA_DIR"));
        h.sv.stop();
    }

    #[tokio::test]
    async fn request_envelope_reaches_agent() {
        let seen: Arc<Mutex<Vec<ReceivedRequest>>> = Arc::default();
        let log = Arc::clone(&seen);
        let h = harness(
            MockLauncher::new(move |rq| {
                log.lock().push(rq.clone());
                Reply::Respond(ResponseEnvelope::reply(&rq.cookie, json!({})))
            }),
            AgentConfig::default(),
        );

        let mut ctx = RequestContext::default();
        ctx.view.path = "/src/main.go".into();
        let acts = vec![Action::new("QueryCompletions"), Action::with_data("Fmt", json!({"x": 1}))];
        let rq = h.sv.send(acts.clone(), ctx.clone(), None).await;
        rq.wait(Duration::from_millis(100)).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].actions, acts);
        assert_eq!(seen[0].props.view.path, "/src/main.go");
        assert!(seen[0].cookie.starts_with("actions(QueryCompletions ~> Fmt),agent#007"));
        drop(seen);
        h.sv.stop();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn real_process_echo() {
        use crate::transport::ProcessLauncher;

        let config = AgentConfig {
            agent_path: "cat".into(),
            agent_args: Vec::new(),
            ..AgentConfig::default()
        };
        let sink = Arc::new(MemorySink::new());
        let root = OutputLogger::root("margo", Arc::clone(&sink) as _);
        let sv = Supervisor::new(
            1,
            "agent#001",
            Arc::new(config),
            Arc::new(ProcessLauncher::new()),
            Arc::new(NoObserver),
            &root,
        );
        sv.start();

        // `cat` echoes the request frame, which decodes as a reply to itself.
        let rq = sv.send(ping(), RequestContext::default(), None).await;
        let rs = rq.wait(Duration::from_secs(2)).await.expect("echo");
        assert!(rs.is_ok());
        assert_eq!(rs.cookie, rq.cookie());

        sv.stop();
        assert!(sv.wait_stopped(Duration::from_secs(2)).await);
    }
}
