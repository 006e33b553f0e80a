//! # Error Handling
//!
//! This module defines the two error families used by the relay:
//!
//! - [`AppError`]: errors returned from HTTP handlers, converted into JSON responses
//! - [`RelayError`]: errors that end (or prevent) a single relay session
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Enums for Error Types
//! - **Variants**: Each enum variant represents a different kind of failure
//! - **Data**: Variants carry the detail needed to log or classify the failure
//! - **Pattern matching**: Callers `match` on the variant to decide what to do
//!
//! ### Traits for Error Conversion
//! - **From trait**: Lets `?` convert library errors into ours automatically
//! - **ResponseError trait**: Turns an `AppError` into an HTTP response
//! - **Display trait**: Defines how errors are formatted in logs
//!
//! ## Containment:
//! A `RelayError` never leaves its session. The WebSocket handler logs it and
//! closes that client's socket; other sessions keep running.

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait
use std::time::Duration;

/// Errors returned by HTTP handlers.
///
/// ## Error Categories:
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Forbidden**: Origin rejected by the configured policy (403 errors)
/// - **Unavailable**: Session capacity reached (503 errors)
///
/// ## Usage Example:
/// ```rust
/// return Err(AppError::Forbidden("origin not allowed".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Client sent invalid or malformed data
    BadRequest(String),

    /// User input failed validation rules
    ValidationError(String),

    /// Request origin is not allowed to open a relay session
    Forbidden(String),

    /// The server cannot take another relay session right now
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Converts an `AppError` into an HTTP response.
///
/// ## JSON Response Format:
/// All errors return JSON with a consistent structure:
/// ```json
/// {
///   "error": {
///     "type": "forbidden",
///     "message": "origin https://evil.example is not allowed",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Automatic conversion from anyhow::Error to AppError.
///
/// ## Usage:
/// Config updates return `anyhow::Result`; `?` in a handler turns a failed
/// validation into a 400 instead of a 500, since the bad value came from the client.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::ValidationError(err.to_string())
    }
}

/// Automatic conversion from JSON parsing errors to AppError.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

/// Errors that end a relay session.
///
/// ## Classification:
/// - **MissingApiKey**: configuration problem, fatal at startup
/// - **Connect**: upstream dial or handshake failed (session never started)
/// - **TaskStartTimeout / TaskNotStarted**: upstream never acknowledged `run-task`
/// - **UpstreamTransport / DownstreamClosed / Downstream**: a socket or file failed mid-session
/// - **Codec**: an outbound envelope could not be serialized
#[derive(Debug)]
pub enum RelayError {
    /// No API key was configured for the upstream service
    MissingApiKey,

    /// Dialing the upstream WebSocket failed
    Connect(String),

    /// Reading from or writing to the upstream WebSocket failed
    UpstreamTransport(String),

    /// The local client went away (socket closed or errored)
    DownstreamClosed,

    /// The local audio input failed for another reason (e.g. file read error)
    Downstream(String),

    /// `task-started` did not arrive within the allowed window
    TaskStartTimeout(Duration),

    /// Upstream closed the connection before sending `task-started`
    TaskNotStarted,

    /// An outbound envelope could not be encoded
    Codec(String),
}

impl RelayError {
    /// True for failures caused by upstream never starting the task in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RelayError::TaskStartTimeout(_))
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::MissingApiKey => write!(f, "upstream API key is not configured"),
            RelayError::Connect(msg) => write!(f, "failed to connect upstream: {}", msg),
            RelayError::UpstreamTransport(msg) => write!(f, "upstream transport error: {}", msg),
            RelayError::DownstreamClosed => write!(f, "downstream connection closed"),
            RelayError::Downstream(msg) => write!(f, "downstream error: {}", msg),
            RelayError::TaskStartTimeout(after) => {
                write!(f, "timed out after {}s waiting for task-started", after.as_secs())
            }
            RelayError::TaskNotStarted => {
                write!(f, "upstream closed before the task started")
            }
            RelayError::Codec(msg) => write!(f, "failed to encode event: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Codec(err.to_string())
    }
}
