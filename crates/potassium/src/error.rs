//! Error types for the serving core.
//!
//! This module defines the central `Error` enum, which captures every failure
//! the dispatcher, worker pool, mailbox and status tracker can report. Each
//! variant maps onto an HTTP status through [`Error::status_code`], so callers
//! only ever observe ordinary status codes and never the channel or queue
//! mechanics behind them.
//!
//! ## Error Cases
//! - `WorkerInit`: A worker's init function failed; fatal at startup.
//! - `RouteAlreadyInUse`: Two endpoints normalize to the same route.
//! - `MalformedRequest`: The request body could not be decoded.
//! - `RouteNotFound`: No endpoint is registered for the route.
//! - `InvalidStatusEvent`: An unknown status event tag reached the tracker.
//! - `StreamCarried`: A streaming handler failed mid-sequence.
//! - `ChannelError`: An internal communication failure between tasks or
//!   workers.
//! - `Busy`: The reject-when-busy admission policy turned the request away.
//! - `ServiceShutdown`: A request arrived while the service was shutting down.
//! - `InvalidConfig`: The serving configuration is unusable.

use axum::http::StatusCode;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the serving core.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// A worker's init function returned an error or panicked.
    #[error("Worker {index} failed to initialize: {reason}")]
    WorkerInit { index: usize, reason: String },

    /// The route (after normalization) is already registered.
    #[error("Route already in use: {route}")]
    RouteAlreadyInUse { route: String },

    /// The request body could not be decoded.
    #[error("Malformed request: {reason}")]
    MalformedRequest { reason: String },

    /// No endpoint is registered for the route.
    #[error("Route not found: {route}")]
    RouteNotFound { route: String },

    /// The status tracker was handed an event it does not understand.
    #[error("Invalid status event: {event}")]
    InvalidStatusEvent { event: String },

    /// A streaming body terminated with an error instead of end-of-stream.
    #[error("Stream failed: {message}")]
    StreamCarried { message: String },

    /// Internal channel send/receive failure (e.g., closed channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// Every worker is occupied and the admission policy rejects instead of
    /// queueing.
    #[error("Potassium is busy, all workers are occupied")]
    Busy,

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,

    /// The serving configuration failed validation.
    #[error("Invalid config: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    /// The HTTP status a caller observes for this failure.
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedRequest { .. } => StatusCode::BAD_REQUEST,
            Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::Busy => StatusCode::LOCKED,
            Self::ServiceShutdown => StatusCode::SERVICE_UNAVAILABLE,
            Self::WorkerInit { .. }
            | Self::RouteAlreadyInUse { .. }
            | Self::InvalidStatusEvent { .. }
            | Self::StreamCarried { .. }
            | Self::ChannelError { .. }
            | Self::InvalidConfig { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
