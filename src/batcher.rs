//! Debounced action queue.
//!
//! Editors fire an event per keystroke or cursor move. [`Batcher`] collects the
//! resulting `(action, target)` pairs and flushes them as one request once the
//! queue has been quiet for the idle window. A flush always binds to whatever
//! target is active at that moment.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::chan::Chan;
use crate::request::RequestContext;
use crate::transport::protocol::Action;

/// Where flushed actions go.
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Context of the focused target, if any.
    fn active_context(&self) -> Option<RequestContext>;

    async fn dispatch(&self, actions: Vec<Action>, context: RequestContext);
}

#[derive(Debug)]
pub struct Batcher {
    pending: Mutex<Vec<(Action, String)>>,
    ticks: Chan<Duration>,
    default_delay: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Batcher {
    pub fn new(default_delay: Duration) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            ticks: Chan::new(),
            default_delay,
            worker: Mutex::new(None),
        }
    }

    /// Queue `actions` for `target` and (re)schedule the flush.
    ///
    /// A repeated pair moves to the back instead of being duplicated. `None`
    /// uses the default idle window; a zero delay flushes as soon as possible.
    pub fn queue(&self, actions: Vec<Action>, target: &str, delay: Option<Duration>) {
        {
            let mut pending = self.pending.lock();
            for act in actions {
                pending.retain(|(a, t)| !(a == &act && t == target));
                pending.push((act, target.to_string()));
            }
        }
        if !self.ticks.put(delay.unwrap_or(self.default_delay)) {
            debug!("Batcher closed, actions will only ride along with the next send");
        }
    }

    /// Return everything queued for `target`, oldest first, and empty the
    /// queue. Actions queued for other targets are dropped.
    pub fn take_for(&self, target: &str) -> Vec<Action> {
        let queued = std::mem::take(&mut *self.pending.lock());
        let dropped = queued.iter().filter(|(_, t)| t != target).count();
        if dropped > 0 {
            debug!(target = %target, dropped, "Dropping actions queued for inactive targets");
        }
        queued
            .into_iter()
            .filter_map(|(a, t)| (t == target).then_some(a))
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Flush the active target's actions now.
    pub async fn flush(&self, dispatch: &dyn Dispatch) {
        let Some(context) = dispatch.active_context() else {
            debug!(pending = self.pending_len(), "No active target, nothing to flush");
            return;
        };
        let actions = self.take_for(context.target());
        if actions.is_empty() {
            return;
        }
        debug!(target = %context.target(), count = actions.len(), "Flushing queued actions");
        dispatch.dispatch(actions, context).await;
    }

    /// Start the flush timer on `runtime`. Flushes stop once `dispatch` is gone.
    pub fn spawn(self: &Arc<Self>, runtime: &Handle, dispatch: Weak<dyn Dispatch>) {
        let handle = runtime.spawn(Arc::clone(self).run(dispatch));
        if let Some(old) = self.worker.lock().replace(handle) {
            old.abort();
        }
    }

    async fn run(self: Arc<Self>, dispatch: Weak<dyn Dispatch>) {
        while let Some(delay) = self.ticks.get().await {
            if !delay.is_zero() && !self.wait_idle(delay).await {
                return;
            }

            let Some(dispatch) = dispatch.upgrade() else {
                return;
            };
            self.flush(dispatch.as_ref()).await;
        }
    }

    /// Sleep until `delay` passes without another tick. A zero tick ends the
    /// wait at once. Returns `false` once the batcher is closed.
    async fn wait_idle(&self, delay: Duration) -> bool {
        let mut deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => return true,
                tick = self.ticks.get() => match tick {
                    Some(delay) if delay.is_zero() => return true,
                    Some(delay) => deadline = Instant::now() + delay,
                    None => return false,
                },
            }
        }
    }

    /// Stop the flush timer. Queued actions stay available to `take_for`.
    pub fn close(&self) {
        self.ticks.close();
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}
