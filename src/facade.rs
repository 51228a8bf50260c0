//! Process-wide entry point for talking to the agent.
//!
//! [`Margo`] owns at most one live [`Supervisor`] generation and keeps the
//! same API across restarts. Generations start lazily on the first `send`
//! and are never run side by side: `restart` fully stops generation N before
//! N+1 is built, and N+1 spawns nothing until N's process is reaped. Lifecycle hooks and responses from a generation that is no
//! longer current are dropped.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::batcher::{Batcher, Dispatch};
use crate::config::{AgentConfig, CallKind};
use crate::error::AgentError;
use crate::output::{LineSink, OutputLogger};
use crate::request::{PendingRequest, RequestContext, Response, ResponseCallback};
use crate::supervisor::{GenerationObserver, Phase, Supervisor};
use crate::token::TokenCounter;
use crate::transport::protocol::{Action, ClientConfig};
use crate::transport::AgentLauncher;

const STARTING_STATUS: &str = "starting margo";

/// Supplies the context of the focused view for debounced flushes.
pub trait ContextProvider: Send + Sync {
    fn active_context(&self) -> Option<RequestContext>;
}

impl<F> ContextProvider for F
where
    F: Fn() -> Option<RequestContext> + Send + Sync,
{
    fn active_context(&self) -> Option<RequestContext> {
        self()
    }
}

/// Provider for hosts without a notion of focus.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoActiveContext;

impl ContextProvider for NoActiveContext {
    fn active_context(&self) -> Option<RequestContext> {
        None
    }
}

/// Receives every response of the current generation, e.g. to render its state.
pub trait ResponseListener: Send + Sync {
    fn on_response(&self, rs: &Response);
}

impl<F> ResponseListener for F
where
    F: Fn(&Response) + Send + Sync,
{
    fn on_response(&self, rs: &Response) {
        self(rs);
    }
}

/// Handle on the agent. Cheap to clone; clones share one agent.
#[derive(Clone)]
pub struct Margo {
    inner: Arc<MargoInner>,
}

struct MargoInner {
    this: Weak<MargoInner>,
    runtime: Handle,
    config: RwLock<Arc<AgentConfig>>,
    launcher: Arc<dyn AgentLauncher>,
    out: Arc<OutputLogger>,
    agent_tokens: TokenCounter,
    current: Mutex<Option<Arc<Supervisor>>>,
    /// Reap signal of the newest generation; its successor waits on it.
    last_reaped: Mutex<Option<watch::Receiver<bool>>>,
    /// Serializes generation switches. Reentrant: stopping a generation runs
    /// callbacks that may send again.
    lifecycle: ReentrantMutex<()>,
    batcher: Arc<Batcher>,
    client_config: RwLock<ClientConfig>,
    status: Mutex<String>,
    search_path: Mutex<Option<String>>,
    contexts: RwLock<Arc<dyn ContextProvider>>,
    listener: RwLock<Option<Arc<dyn ResponseListener>>>,
}

impl std::fmt::Debug for Margo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Margo")
            .field("generation", &self.generation())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Margo {
    /// Create the facade. No agent is started until the first `send`.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(config: AgentConfig, launcher: Arc<dyn AgentLauncher>, sink: Arc<dyn LineSink>) -> Self {
        let runtime = Handle::current();
        let batcher = Arc::new(Batcher::new(config.debounce()));
        let search_path = config.search_path.clone();

        let inner = Arc::new_cyclic(|this: &Weak<MargoInner>| MargoInner {
            this: this.clone(),
            runtime: runtime.clone(),
            config: RwLock::new(Arc::new(config)),
            launcher,
            out: OutputLogger::root("margo", sink),
            agent_tokens: TokenCounter::with_format("agent", 3, 6),
            current: Mutex::new(None),
            last_reaped: Mutex::new(None),
            lifecycle: ReentrantMutex::new(()),
            batcher: Arc::clone(&batcher),
            client_config: RwLock::new(ClientConfig::default()),
            status: Mutex::new(String::new()),
            search_path: Mutex::new(search_path),
            contexts: RwLock::new(Arc::new(NoActiveContext)),
            listener: RwLock::new(None),
        });

        let weak: Weak<MargoInner> = Arc::downgrade(&inner);
        let dispatch: Weak<dyn Dispatch> = weak;
        batcher.spawn(&runtime, dispatch);
        Self { inner }
    }

    pub fn set_context_provider(&self, provider: Arc<dyn ContextProvider>) {
        *self.inner.contexts.write() = provider;
    }

    pub fn set_listener(&self, listener: Arc<dyn ResponseListener>) {
        *self.inner.listener.write() = Some(listener);
    }

    /// Send `actions` in `context`, starting an agent if none is running.
    ///
    /// Actions still queued for the same target are sent first; the rest of
    /// the queue is dropped.
    pub async fn send(
        &self,
        actions: Vec<Action>,
        context: RequestContext,
        callback: Option<ResponseCallback>,
    ) -> Arc<PendingRequest> {
        self.inner.send(actions, context, callback).await
    }

    /// Start an agent if none is running and wait up to `limit` for it to
    /// come up, install step included. Returns whether it is running.
    pub async fn wait_started(&self, limit: Duration) -> bool {
        let sv = self.inner.agent();
        sv.wait_started(limit).await == Phase::Running
    }

    /// Send and wait for the response within the bound for `kind`.
    ///
    /// `None` on timeout; the request stays in flight.
    pub async fn call(&self, kind: CallKind, actions: Vec<Action>, context: RequestContext) -> Option<Response> {
        let limit = self.inner.config().timeouts.for_call(kind);
        let rq = self.send(actions, context, None).await;
        rq.wait(limit).await
    }

    /// Queue `actions` for the debounced flush. `None` uses the default delay.
    pub fn queue(&self, actions: Vec<Action>, context: &RequestContext, delay: Option<Duration>) {
        self.inner.batcher.queue(actions, context.target(), delay);
    }

    /// Flush queued actions for the active target now.
    pub async fn flush(&self) {
        self.inner.batcher.flush(self.inner.as_ref()).await;
    }

    /// Stop the current generation (if any) and start a fresh one.
    pub fn restart(&self) {
        self.inner.restart();
    }

    /// Stop the current generation. The next `send` starts a new one.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Stop the agent and the debounce timer.
    pub fn shutdown(&self) {
        self.inner.batcher.close();
        self.inner.stop();
    }

    /// Apply a changed search path, restarting a live agent once per distinct value.
    ///
    /// Returns whether a restart happened.
    pub fn sync_settings(&self, search_path: &str) -> bool {
        self.inner.sync_settings(search_path)
    }

    pub fn enabled_for_lang(&self, lang: &str) -> bool {
        self.inner.client_config.read().enabled_for(lang)
    }

    pub fn client_config(&self) -> ClientConfig {
        self.inner.client_config.read().clone()
    }

    pub fn status(&self) -> String {
        self.inner.status.lock().clone()
    }

    /// Generation number of the live agent.
    pub fn generation(&self) -> Option<u64> {
        self.inner.live_agent().map(|sv| sv.generation())
    }

    pub fn config(&self) -> Arc<AgentConfig> {
        self.inner.config()
    }
}

impl MargoInner {
    fn config(&self) -> Arc<AgentConfig> {
        Arc::clone(&self.config.read())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|sv| sv.generation() == generation)
    }

    fn live_agent(&self) -> Option<Arc<Supervisor>> {
        self.current
            .lock()
            .as_ref()
            .filter(|sv| !sv.phase().is_stopping())
            .cloned()
    }

    /// The live agent, starting one if needed.
    fn agent(&self) -> Arc<Supervisor> {
        if let Some(sv) = self.live_agent() {
            return sv;
        }
        let _lifecycle = self.lifecycle.lock();
        if let Some(sv) = self.live_agent() {
            return sv;
        }
        self.replace_agent()
    }

    fn restart(&self) {
        let _lifecycle = self.lifecycle.lock();
        self.replace_agent();
    }

    /// Must hold `lifecycle`.
    fn replace_agent(&self) -> Arc<Supervisor> {
        let old = self.current.lock().take();
        if let Some(old) = old {
            old.stop();
        }

        let (generation, domain) = self.agent_tokens.next();
        let observer: Arc<dyn GenerationObserver> = Arc::new(Hooks(self.this.clone()));
        let sv = Supervisor::new(
            generation,
            &domain,
            self.config(),
            Arc::clone(&self.launcher),
            observer,
            &self.out,
        );
        let displaced = self.current.lock().replace(Arc::clone(&sv));
        if let Some(displaced) = displaced {
            displaced.stop();
        }

        let previous = self.last_reaped.lock().replace(sv.reaped());
        let _runtime = self.runtime.enter();
        sv.start_after(previous);
        sv
    }

    fn stop(&self) {
        let _lifecycle = self.lifecycle.lock();
        let old = self.current.lock().take();
        if let Some(old) = old {
            old.stop();
        }
    }

    async fn send(
        &self,
        actions: Vec<Action>,
        context: RequestContext,
        callback: Option<ResponseCallback>,
    ) -> Arc<PendingRequest> {
        let mut all = self.batcher.take_for(context.target());
        all.extend(actions);
        self.agent().send(all, context, callback).await
    }

    fn sync_settings(&self, search_path: &str) -> bool {
        if search_path.is_empty() {
            return false;
        }
        {
            let mut last = self.search_path.lock();
            if last.as_deref() == Some(search_path) {
                return false;
            }
            *last = Some(search_path.to_string());
        }

        {
            let mut config = self.config.write();
            let mut updated = AgentConfig::clone(&config);
            updated.search_path = Some(search_path.to_string());
            *config = Arc::new(updated);
        }

        if self.live_agent().is_none() {
            return false;
        }
        self.out.println(format!("search path changed to {search_path}, restarting"));
        self.restart();
        true
    }

    fn set_status(&self, status: &str) {
        *self.status.lock() = status.to_string();
    }

    fn on_starting(&self, generation: u64) {
        if self.is_current(generation) {
            self.set_status(STARTING_STATUS);
        }
    }

    fn on_ready(&self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        let mut status = self.status.lock();
        if *status == STARTING_STATUS {
            status.clear();
        }
        drop(status);
        info!(generation, "Agent ready");
    }

    fn on_stopped(&self, generation: u64) {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|sv| sv.generation() == generation) {
            *current = None;
        }
    }

    fn on_response(&self, generation: u64, rs: &Response) -> bool {
        if !self.is_current(generation) {
            debug!(error = %AgentError::StaleGeneration(generation), cookie = %rs.cookie, "Dropping response");
            return false;
        }

        for err in &rs.state.errors {
            self.out.println(format!("error: {err}"));
        }
        if let Some(config) = &rs.state.config {
            *self.client_config.write() = config.clone();
        }
        for act in &rs.state.client_actions {
            self.client_action(&act.name);
        }

        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.on_response(rs);
        }
        true
    }

    fn client_action(&self, name: &str) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        match name {
            "Restart" => {
                self.out.println("restart requested by agent");
                self.runtime.spawn(async move { this.restart() });
            }
            "Shutdown" => {
                self.out.println("shutdown requested by agent");
                self.runtime.spawn(async move { this.stop() });
            }
            other => debug!(action = other, "Ignoring client action"),
        }
    }
}

#[async_trait]
impl Dispatch for MargoInner {
    fn active_context(&self) -> Option<RequestContext> {
        let provider = Arc::clone(&self.contexts.read());
        provider.active_context()
    }

    async fn dispatch(&self, actions: Vec<Action>, context: RequestContext) {
        let rq = self.send(actions, context, None).await;
        if let Some(rs) = rq.result().filter(|rs| !rs.is_ok()) {
            self.out.println(&rs.error);
        }
    }
}

/// Routes a generation's hooks back to the facade.
struct Hooks(Weak<MargoInner>);

impl GenerationObserver for Hooks {
    fn on_starting(&self, generation: u64) {
        if let Some(inner) = self.0.upgrade() {
            inner.on_starting(generation);
        }
    }

    fn on_ready(&self, generation: u64) {
        if let Some(inner) = self.0.upgrade() {
            inner.on_ready(generation);
        }
    }

    fn on_stopped(&self, generation: u64) {
        if let Some(inner) = self.0.upgrade() {
            inner.on_stopped(generation);
        }
    }

    fn on_response(&self, generation: u64, rs: &Response) -> bool {
        self.0
            .upgrade()
            .is_some_and(|inner| inner.on_response(generation, rs))
    }
}
