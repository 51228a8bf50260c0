//! margo-client library
//!
//! Editor-side client for the MarGo agent process:
//! - Framed JSON transport over the agent's stdin/stdout
//! - Per-generation supervision of the agent process
//! - Cookie-correlated requests with bounded waits
//! - Debounced batching of editor events
//! - The [`Margo`] facade that survives agent restarts

pub mod batcher;
pub mod chan;
pub mod config;
pub mod error;
pub mod facade;
pub mod output;
pub mod registry;
pub mod request;
pub mod supervisor;
pub mod token;
pub mod transport;

pub use config::{AgentConfig, CallKind};
pub use error::{AgentError, ErrorKind};
pub use facade::{ContextProvider, Margo, ResponseListener};
pub use request::{PendingRequest, RequestContext, Response};
pub use transport::protocol::{Action, ViewProps};
