//! Error types for the scheduler, transports and listeners.

use thiserror::Error;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors raised by a transport implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The socket could not be opened.
    #[error("Failed to connect to {url}: {message}")]
    ConnectFailed { url: String, message: String },

    /// Writing a frame failed.
    #[error("Failed to send frame: {0}")]
    SendFailed(String),

    /// Reading from the socket failed.
    #[error("Failed to receive frame: {0}")]
    ReceiveFailed(String),

    /// The peer closed the connection.
    #[error("Connection closed")]
    Closed,
}

/// Error reported by the backend for one request (`ERROR` state tag).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ResponseError {
    pub request_id: String,
    pub message: String,
    pub code: Option<i64>,
    /// Full response frame in application casing.
    pub data: serde_json::Value,
}

/// Errors surfaced by the message scheduler.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The backend rejected the request.
    #[error("Backend error for request {}: {}", .0.request_id, .0.message)]
    Response(ResponseError),

    /// A caller-supplied request id is already in flight.
    #[error("Request id already in flight: {0}")]
    DuplicateRequestId(String),

    /// The pending record went away without an answer.
    #[error("Request {0} was abandoned before completion")]
    Abandoned(String),

    /// The base URL cannot be turned into a socket endpoint.
    #[error("Invalid endpoint {url}: {message}")]
    InvalidEndpoint { url: String, message: String },

    /// The request description is unusable.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Encoding or decoding a frame failed.
    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

/// Errors from awaiting a [`Listener`](crate::listener::Listener).
#[derive(Debug, Clone, Error)]
pub enum ListenerError {
    /// An error-typed event arrived.
    #[error("Listener rejected: {}", .0.message)]
    Rejected(Box<crate::dispatch::DispatchEvent>),

    /// Every sender went away before a terminal event.
    #[error("Listener closed before a terminal event")]
    Closed,
}
