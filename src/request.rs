//! In-flight requests and their responses.
//!
//! A [`PendingRequest`] is resolved exactly once, by whichever comes first:
//! the agent's response, the generation stopping, or a local failure. Later
//! resolutions are ignored.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::error::AgentError;
use crate::transport::protocol::{actions_summary, Action, EditorProps, ResponseEnvelope, State, ViewProps};

/// Point-in-time snapshot of the calling environment. Sent as `Props`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestContext {
    #[serde(default)]
    pub editor: EditorProps,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub view: ViewProps,
}

impl RequestContext {
    /// Capture the current process environment along with `view`.
    pub fn capture(editor: EditorProps, view: ViewProps) -> Self {
        Self {
            editor,
            env: std::env::vars().collect(),
            view,
        }
    }

    /// Debounce target this context belongs to.
    pub fn target(&self) -> &str {
        &self.view.id
    }
}

/// Outcome of a request.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub cookie: String,
    pub tag: String,
    pub data: Value,
    pub state: State,
    /// Empty on success.
    pub error: String,
    /// Set when the failure was produced locally rather than by the agent.
    pub failure: Option<AgentError>,
    /// Generation that produced (or aborted) this response.
    pub generation: u64,
}

impl Response {
    pub fn from_envelope(env: ResponseEnvelope, generation: u64) -> Self {
        Self {
            cookie: env.cookie,
            tag: env.tag,
            data: env.data,
            state: env.state,
            error: env.error,
            failure: None,
            generation,
        }
    }

    pub fn failed(cookie: impl Into<String>, generation: u64, err: AgentError) -> Self {
        Self {
            cookie: cookie.into(),
            error: err.to_string(),
            failure: Some(err),
            data: Value::Object(serde_json::Map::new()),
            generation,
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }
}

/// Invoked once with the response that resolved a request.
pub type ResponseCallback = Box<dyn FnOnce(&Response) + Send + 'static>;

struct Slot {
    result: Option<Response>,
    callback: Option<ResponseCallback>,
}

/// A request registered with a generation, waiting for its response.
pub struct PendingRequest {
    cookie: String,
    actions: Vec<Action>,
    actions_str: String,
    context: RequestContext,
    generation: u64,
    sent_at: Instant,
    slot: Mutex<Slot>,
    done: watch::Sender<bool>,
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("cookie", &self.cookie)
            .field("generation", &self.generation)
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

impl PendingRequest {
    pub fn new(
        cookie: String,
        actions: Vec<Action>,
        context: RequestContext,
        generation: u64,
        callback: Option<ResponseCallback>,
    ) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            actions_str: actions_summary(&actions),
            cookie,
            actions,
            context,
            generation,
            sent_at: Instant::now(),
            slot: Mutex::new(Slot {
                result: None,
                callback,
            }),
            done,
        }
    }

    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub const fn generation(&self) -> u64 {
        self.generation
    }

    pub fn elapsed(&self) -> Duration {
        self.sent_at.elapsed()
    }

    /// Store `rs` and fire the callback. Returns `false` if already resolved.
    ///
    /// Errors are prefixed with the request's action names, except the
    /// abort issued when the generation stops.
    pub fn resolve(&self, mut rs: Response) -> bool {
        if !rs.error.is_empty() && !matches!(rs.failure, Some(AgentError::AgentStopping)) {
            rs.error = format!("actions: {}, error: {}", self.actions_str, rs.error);
        }

        let callback = {
            let mut slot = self.slot.lock();
            if slot.result.is_some() {
                return false;
            }
            slot.result = Some(rs.clone());
            slot.callback.take()
        };
        self.done.send_replace(true);

        debug!(
            cookie = %self.cookie,
            elapsed_ms = self.elapsed().as_millis(),
            error = %rs.error,
            "request resolved"
        );

        if let Some(cb) = callback {
            if catch_unwind(AssertUnwindSafe(|| cb(&rs))).is_err() {
                error!(cookie = %self.cookie, "response callback panicked");
            }
        }
        true
    }

    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    pub fn result(&self) -> Option<Response> {
        self.slot.lock().result.clone()
    }

    /// Wait up to `timeout` for resolution. `None` on timeout; the request
    /// stays registered and a late response still reaches the callback.
    pub async fn wait(&self, timeout: Duration) -> Option<Response> {
        let mut rx = self.done.subscribe();
        if tokio::time::timeout(timeout, rx.wait_for(|done| *done))
            .await
            .is_err()
        {
            return None;
        }
        self.result()
    }
}
