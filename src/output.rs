//! User-facing output log.
//!
//! Loggers form a chain: a child prefixes its domain and hands the line to its
//! parent, so agent stderr ends up as `margo: agent#007: log: <line>`. The root
//! stamps the time and writes to a [`LineSink`].

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Destination for rendered output lines.
pub trait LineSink: Send + Sync {
    fn write_line(&self, line: &str);
}

/// Emits every line as a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LineSink for TracingSink {
    fn write_line(&self, line: &str) {
        tracing::info!(target: "margo_client::output", "{line}");
    }
}

/// Keeps rendered lines in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|l| l.contains(needle))
    }
}

impl LineSink for MemorySink {
    fn write_line(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

enum Target {
    Root(Arc<dyn LineSink>),
    Parent(Arc<OutputLogger>),
}

/// Domain-prefixed logger.
pub struct OutputLogger {
    domain: String,
    target: Target,
}

impl fmt::Debug for OutputLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputLogger")
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

impl OutputLogger {
    pub fn root(domain: impl Into<String>, sink: Arc<dyn LineSink>) -> Arc<Self> {
        Arc::new(Self {
            domain: domain.into(),
            target: Target::Root(sink),
        })
    }

    pub fn child(self: &Arc<Self>, domain: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            domain: domain.into(),
            target: Target::Parent(Arc::clone(self)),
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn println(&self, msg: impl fmt::Display) {
        let s = format!("{}: {}", self.domain, msg);
        match &self.target {
            Target::Parent(parent) => parent.println(s),
            Target::Root(sink) => {
                let mut lines = s.split('\n');
                let first = lines.next().unwrap_or_default();
                let rest: Vec<&str> = lines.collect();
                if rest.is_empty() {
                    let prefix = chrono::Local::now().format("[%H:%M:%S]");
                    sink.write_line(&format!("{prefix} {first}"));
                    return;
                }

                for ln in std::iter::once(first).chain(rest) {
                    sink.write_line(&format!("  {}", ln.trim()));
                }
            }
        }
    }
}
