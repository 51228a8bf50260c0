//! Client configuration.
//!
//! Loaded as JSON from the `MARGO_AGENT_CONFIG` environment variable or from a
//! file; every field has a default so an empty object is a valid config.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::transport::protocol::EditorProps;
use crate::transport::LaunchSpec;

/// Environment variable holding the JSON config.
pub const CONFIG_ENV: &str = "MARGO_AGENT_CONFIG";

/// Name of the install stamp inside the data directory.
const INSTALL_STAMP: &str = "agent.tag";

/// Top-level configuration for the agent client.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Agent executable, resolved against the install bin dir first.
    #[serde(default = "default_agent_path")]
    pub agent_path: String,

    #[serde(default = "default_agent_args")]
    pub agent_args: Vec<String>,

    /// Agent scratch directory, exported as `MARGO_DATA_DIR`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// User search path (`GOPATH`). A change restarts the agent.
    #[serde(default = "default_search_path")]
    pub search_path: Option<String>,

    /// Tool roots; each `<root>/bin` is prepended to `PATH`.
    #[serde(default)]
    pub tool_roots: Vec<PathBuf>,

    /// Extra environment overrides for the agent.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Module resolution mode for building the agent.
    #[serde(default = "default_module_mode")]
    pub module_mode: String,

    /// Optional build/install step run before each spawn.
    #[serde(default)]
    pub install: Option<InstallConfig>,

    /// Expected protocol tag. Responses stamped differently trigger a warning.
    #[serde(default)]
    pub tag: Option<String>,

    #[serde(default)]
    pub editor: EditorProps,

    #[serde(default)]
    pub timeouts: Timeouts,

    /// Idle window for debounced actions.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

/// Build/install step for the agent binary.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallConfig {
    /// Command line, e.g. `["go", "install", "-v", "margo.sh"]`.
    pub command: Vec<String>,

    /// Where the installed binary lands (`GOBIN`).
    pub bin_dir: PathBuf,
}

/// Bounded waits, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct Timeouts {
    /// How long `send` waits for a starting agent.
    #[serde(default = "default_start_ms")]
    pub start_ms: u64,

    /// Grace period before a stopping agent is signalled.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    #[serde(default = "default_completion_ms")]
    pub completion_ms: u64,

    #[serde(default = "default_format_ms")]
    pub format_ms: u64,

    #[serde(default = "default_save_ms")]
    pub save_ms: u64,
}

/// Kinds of foreground calls, each with its own wait bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Completion,
    Format,
    Save,
}

impl Timeouts {
    pub const fn start(&self) -> Duration {
        Duration::from_millis(self.start_ms)
    }

    pub const fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub const fn for_call(&self, kind: CallKind) -> Duration {
        Duration::from_millis(match kind {
            CallKind::Completion => self.completion_ms,
            CallKind::Format => self.format_ms,
            CallKind::Save => self.save_ms,
        })
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            start_ms: default_start_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            completion_ms: default_completion_ms(),
            format_ms: default_format_ms(),
            save_ms: default_save_ms(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_path: default_agent_path(),
            agent_args: default_agent_args(),
            data_dir: default_data_dir(),
            search_path: default_search_path(),
            tool_roots: Vec::new(),
            env: HashMap::new(),
            module_mode: default_module_mode(),
            install: None,
            tag: None,
            editor: EditorProps::default(),
            timeouts: Timeouts::default(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from `MARGO_AGENT_CONFIG`, or defaults when unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(json) => Self::from_json(&json).with_context(|| format!("Failed to parse {CONFIG_ENV}")),
            Err(_) => {
                debug!("{CONFIG_ENV} not set, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Tool roots joined with the platform path separator (`MARGO_AGENT_GOPATH`).
    pub fn agent_search_path(&self) -> String {
        join_paths(self.tool_roots.iter().map(PathBuf::as_path))
    }

    fn bin_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self.tool_roots.iter().map(|r| r.join("bin")).collect();
        if let Some(install) = &self.install {
            dirs.insert(0, install.bin_dir.clone());
        }
        dirs
    }

    /// Environment for the agent process.
    ///
    /// `base` < fixed protocol keys < `env` overrides < `PATH` with tool bin
    /// dirs prepended.
    pub fn spawn_env(&self, base: impl IntoIterator<Item = (String, String)>) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = base.into_iter().collect();
        env.insert("MARGO_DATA_DIR".into(), self.data_dir.display().to_string());
        env.insert("MARGO_AGENT_GO111MODULE".into(), self.module_mode.clone());
        env.insert("MARGO_AGENT_GOPATH".into(), self.agent_search_path());
        if let Some(sp) = &self.search_path {
            env.insert("GOPATH".into(), sp.clone());
        }
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let existing = env.get("PATH").cloned().unwrap_or_default();
        env.insert("PATH".into(), prepend_path(&self.bin_dirs(), &existing));
        env
    }

    /// Environment for the install step.
    pub fn install_env(&self, base: impl IntoIterator<Item = (String, String)>) -> HashMap<String, String> {
        let mut env = self.spawn_env(base);
        env.insert("GOPATH".into(), self.agent_search_path());
        env.insert("GO111MODULE".into(), self.module_mode.clone());
        if let Some(install) = &self.install {
            env.insert("GOBIN".into(), install.bin_dir.display().to_string());
        }
        env
    }

    /// Agent executable: the installed copy if present, else `agent_path` as given.
    pub fn agent_program(&self) -> String {
        if let Some(install) = &self.install {
            let installed = install.bin_dir.join(&self.agent_path);
            if installed.is_file() {
                return installed.display().to_string();
            }
        }
        self.agent_path.clone()
    }

    pub fn launch_spec(&self, base: impl IntoIterator<Item = (String, String)>) -> LaunchSpec {
        LaunchSpec {
            program: self.agent_program(),
            args: self.agent_args.clone(),
            env: self.spawn_env(base),
            current_dir: None,
        }
    }

    /// The install step, if one must run.
    ///
    /// Skipped when the installed binary exists and the stamp in the data dir
    /// matches the expected tag.
    pub fn install_spec(&self, base: impl IntoIterator<Item = (String, String)>) -> Option<LaunchSpec> {
        let install = self.install.as_ref()?;
        let (program, args) = install.command.split_first()?;
        if self.install_is_current() {
            debug!("Agent install is current, skipping");
            return None;
        }
        Some(LaunchSpec {
            program: program.clone(),
            args: args.to_vec(),
            env: self.install_env(base),
            current_dir: None,
        })
    }

    fn stamp_path(&self) -> PathBuf {
        self.data_dir.join(INSTALL_STAMP)
    }

    fn install_is_current(&self) -> bool {
        let (Some(install), Some(tag)) = (&self.install, &self.tag) else {
            return false;
        };
        if !install.bin_dir.join(&self.agent_path).is_file() {
            return false;
        }
        std::fs::read_to_string(self.stamp_path()).is_ok_and(|s| s.trim() == tag)
    }

    /// Record a successful install for the expected tag.
    pub fn write_install_stamp(&self) -> Result<()> {
        let Some(tag) = &self.tag else {
            return Ok(());
        };
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("Failed to create {}", self.data_dir.display()))?;
        std::fs::write(self.stamp_path(), tag).context("Failed to write install stamp")?;
        Ok(())
    }
}

#[cfg(windows)]
const PATH_SEP: &str = ";";
#[cfg(not(windows))]
const PATH_SEP: &str = ":";

fn join_paths<'a>(parts: impl Iterator<Item = &'a Path>) -> String {
    parts
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(PATH_SEP)
}

fn prepend_path(dirs: &[PathBuf], existing: &str) -> String {
    let mut path = join_paths(dirs.iter().map(PathBuf::as_path));
    if !existing.is_empty() {
        if !path.is_empty() {
            path.push_str(PATH_SEP);
        }
        path.push_str(existing);
    }
    path
}

fn default_agent_path() -> String {
    "margo.sh".into()
}

fn default_agent_args() -> Vec<String> {
    ["start", "margo.sublime", "-codec", "json"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_data_dir() -> PathBuf {
    std::env::temp_dir().join("margo.data")
}

fn default_search_path() -> Option<String> {
    std::env::var("GOPATH").ok().filter(|s| !s.is_empty())
}

fn default_module_mode() -> String {
    "off".into()
}

const fn default_start_ms() -> u64 {
    200
}

const fn default_stop_grace_ms() -> u64 {
    500
}

const fn default_completion_ms() -> u64 {
    500
}

const fn default_format_ms() -> u64 {
    5000
}

const fn default_save_ms() -> u64 {
    2000
}

const fn default_debounce_ms() -> u64 {
    600
}
