//! Stdin/stdout pipe transport for the agent process.
//!
//! [`AgentLauncher`] turns a [`LaunchSpec`] into a running child with its
//! stdio handles split out, so the supervisor can give each handle to its own
//! pump. [`ProcessLauncher`] is the real implementation; the child runs in its
//! own process group so termination reaches anything it spawned.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

#[cfg(unix)]
use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// What to run and with which environment.
///
/// `env` is the complete environment; nothing is inherited implicitly.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub current_dir: Option<PathBuf>,
}

impl fmt::Display for LaunchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for a in &self.args {
            write!(f, " {a}")?;
        }
        Ok(())
    }
}

/// Captured result of a command run to completion.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// A spawned agent with its stdio split out.
pub struct AgentIo {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    pub child: Box<dyn AgentChild>,
}

/// Handle on a running agent process.
#[async_trait]
pub trait AgentChild: Send {
    /// Wait for exit. Returns the exit code if there is one.
    async fn wait(&mut self) -> Result<Option<i32>>;

    /// Give the process `grace` to exit on its own, then escalate.
    async fn terminate(&mut self, grace: Duration) -> Result<()>;

    fn id(&self) -> Option<u32>;
}

/// Starts agent processes.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// Run a helper command (the install step) to completion.
    async fn run(&self, spec: &LaunchSpec) -> Result<CommandOutput>;

    /// Spawn the agent with piped stdio.
    async fn launch(&self, spec: &LaunchSpec) -> Result<AgentIo>;
}

/// Launches real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub const fn new() -> Self {
        Self
    }

    fn command(spec: &LaunchSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).env_clear().envs(&spec.env);
        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl AgentLauncher for ProcessLauncher {
    async fn run(&self, spec: &LaunchSpec) -> Result<CommandOutput> {
        debug!(cmd = %spec, "Running command");

        let output = Self::command(spec)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run: {spec}"))?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<AgentIo> {
        debug!(cmd = %spec, "Spawning agent process");

        let mut cmd = Self::command(spec);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn agent: {}", spec.program))?;

        let stdin = child.stdin.take().context("Failed to take agent stdin")?;
        let stdout = child.stdout.take().context("Failed to take agent stdout")?;
        let stderr = child.stderr.take();

        Ok(AgentIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as BoxedReader),
            child: Box::new(ProcessChild { child }),
        })
    }
}

struct ProcessChild {
    child: Child,
}

impl ProcessChild {
    #[cfg(unix)]
    fn signal_group(&self, signal: Signal) {
        let Some(pid) = self.child.id().and_then(|id| i32::try_from(id).ok()) else {
            return;
        };
        if let Err(e) = killpg(Pid::from_raw(pid), signal) {
            debug!(pid, ?signal, error = %e, "Failed to signal agent process group");
        }
    }
}

#[async_trait]
impl AgentChild for ProcessChild {
    async fn wait(&mut self) -> Result<Option<i32>> {
        let status = self
            .child
            .wait()
            .await
            .context("Failed to wait for agent")?;
        Ok(status.code())
    }

    async fn terminate(&mut self, grace: Duration) -> Result<()> {
        // stdin is already closed at this point; a well-behaved agent exits on its own.
        if timeout(grace, self.child.wait()).await.is_ok() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            self.signal_group(Signal::SIGTERM);
            if timeout(grace, self.child.wait()).await.is_ok() {
                return Ok(());
            }
            warn!("Agent ignored SIGTERM, killing it");
            self.signal_group(Signal::SIGKILL);
        }

        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "Failed to kill agent");
        }
        self.child.wait().await.context("Failed to reap agent")?;
        Ok(())
    }

    fn id(&self) -> Option<u32> {
        self.child.id()
    }
}
