//! margo-client
//!
//! Starts the MarGo agent, sends one request and prints the response as JSON.
//! Agent configuration is read from `--config` or the `MARGO_AGENT_CONFIG`
//! env var.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use margo_client::output::TracingSink;
use margo_client::transport::ProcessLauncher;
use margo_client::{Action, AgentConfig, Margo, RequestContext, ViewProps};

#[derive(Parser, Debug)]
#[command(name = "margo-client")]
#[command(about = "Send an action to the MarGo agent and print the response")]
struct Args {
    /// Action name, e.g. `QueryCompletions`
    #[arg(long)]
    action: String,

    /// JSON data for the action
    #[arg(long)]
    data: Option<String>,

    /// File the action applies to
    #[arg(long)]
    path: Option<PathBuf>,

    /// How long to wait for the response
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// How long to wait for the agent to start, install step included
    #[arg(long, default_value_t = 60_000)]
    start_timeout_ms: u64,

    /// JSON config file (overrides MARGO_AGENT_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn view_for(path: &Path) -> Result<ViewProps> {
    let path = std::fs::canonicalize(path)
        .with_context(|| format!("Failed to resolve {}", path.display()))?;
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    Ok(ViewProps {
        id: path.display().to_string(),
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        wd: path
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        lang: ext.trim_start_matches('.').to_string(),
        ext,
        path: path.display().to_string(),
        ..ViewProps::default()
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for the response)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => AgentConfig::from_file(path),
        None => AgentConfig::from_env(),
    }
    .context("Failed to load configuration")?;

    info!(agent = %config.agent_path, args = ?config.agent_args, "Loaded configuration");

    let data: Value = match &args.data {
        Some(raw) => serde_json::from_str(raw).context("--data is not valid JSON")?,
        None => Value::Null,
    };
    let view = match &args.path {
        Some(path) => view_for(path)?,
        None => ViewProps::default(),
    };

    let margo = Margo::new(config.clone(), Arc::new(ProcessLauncher::new()), Arc::new(TracingSink));
    if !margo
        .wait_started(Duration::from_millis(args.start_timeout_ms))
        .await
    {
        warn!(timeout_ms = args.start_timeout_ms, "Agent is not running, sending anyway");
    }

    let context = RequestContext::capture(config.editor.clone(), view);
    let rq = margo
        .send(vec![Action::with_data(&args.action, data)], context, None)
        .await;
    let rs = rq.wait(Duration::from_millis(args.timeout_ms)).await;
    margo.shutdown();

    let Some(rs) = rs else {
        anyhow::bail!("No response within {}ms", args.timeout_ms);
    };

    let out = json!({
        "Cookie": rs.cookie,
        "Tag": rs.tag,
        "Error": rs.error,
        "Data": rs.data,
        "State": rs.state,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);

    if !rs.is_ok() {
        std::process::exit(1);
    }
    Ok(())
}
