//! Error taxonomy for agent requests.
//!
//! Caller-facing failures are never thrown across the `send`/`queue` API; they
//! are stored on the [`Response`](crate::request::Response) that resolves a
//! request. Internal plumbing uses `anyhow` and is mapped onto these variants
//! at the point where a request is resolved.

use thiserror::Error;

/// Failure classes a request can be resolved with.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// Binary missing, install step failed, or spawn failed.
    #[error("cannot start agent: {0}")]
    StartupFailure(String),

    /// The generation exists but did not finish starting within the bounded wait.
    #[error("agent has not started after {0}ms")]
    NotReadyTimeout(u64),

    /// Frame encode/decode failure or broken pipe.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// Synthetic resolution for requests still pending when a generation stops.
    #[error("agent stopping. request aborted")]
    AgentStopping,

    /// A response or callback from a generation that is no longer current.
    #[error("stale agent generation {0}")]
    StaleGeneration(u64),

    /// Response claims a different protocol tag than expected.
    #[error("received tag `{received}', expected tag `{expected}'")]
    ProtocolTagMismatch { received: String, expected: String },
}

/// Payload-free discriminant of [`AgentError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    StartupFailure,
    NotReadyTimeout,
    TransportFailure,
    AgentStopping,
    StaleGeneration,
    ProtocolTagMismatch,
}

impl AgentError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::StartupFailure(_) => ErrorKind::StartupFailure,
            Self::NotReadyTimeout(_) => ErrorKind::NotReadyTimeout,
            Self::TransportFailure(_) => ErrorKind::TransportFailure,
            Self::AgentStopping => ErrorKind::AgentStopping,
            Self::StaleGeneration(_) => ErrorKind::StaleGeneration,
            Self::ProtocolTagMismatch { .. } => ErrorKind::ProtocolTagMismatch,
        }
    }

    /// Whether the owning generation must be torn down after this error.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::TransportFailure(_))
    }
}
