//! # Error Handling
//!
//! This module defines the error type shared by the channel controllers, the session
//! status machine, the interrupt client and the loopback gateway.
//!
//! ## Error Taxonomy:
//!
//! ### Transport errors
//! - A connection failed to open or closed abnormally
//! - Always terminal for the affected channel, never retried automatically
//!
//! ### Protocol violations
//! - Malformed frame, binary frame without pending metadata, unknown message shape
//! - Non-fatal: the channel stays open and the violation is only logged
//!
//! ### Data-integrity errors
//! - Audio slot count mismatch when a chunk set is finalized
//! - Terminal for that turn's audio, the text result is preserved
//!
//! ### Backend-reported errors
//! - Explicit error frame or error response body, passed through verbatim
//!
//! ## Rust Concepts:
//! - **Display trait**: Defines how errors are formatted as strings
//! - **From trait**: Lets `?` convert library errors into `AppError` automatically
//! - **ResponseError trait**: Converts errors to HTTP responses for the loopback gateway

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait

/// Custom error types for the crate.
///
/// ## Error Categories:
/// - **Transport**: Socket or HTTP connection problems (terminal for the channel)
/// - **Protocol**: The peer sent something that breaks the framing rules
/// - **DataIncomplete**: Audio reassembly found missing slots
/// - **Backend**: The backend reported an error explicitly
/// - **ConfigError**: Configuration problems
/// - **ValidationError**: Caller input failed validation (e.g. empty text)
/// - **Internal**: Anything else
///
/// ## Usage Example:
/// ```rust
/// use turnlink::error::AppError;
/// let err = AppError::ValidationError("text content is empty".to_string());
/// assert_eq!(err.to_string(), "Validation error: text content is empty");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Connection failed to open, dropped, or an HTTP call could not complete
    Transport(String),

    /// The peer violated the framing protocol
    Protocol(String),

    /// Reassembly could not be completed because chunks were missing
    DataIncomplete(String),

    /// Error reported by the backend (message passed through verbatim)
    Backend(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// Unexpected internal failures
    Internal(String),
}

impl AppError {
    /// The message without the category prefix.
    ///
    /// This is what ends up in `Session::last_error`, so backend messages reach the
    /// UI exactly as the backend wrote them.
    pub fn message(&self) -> &str {
        match self {
            AppError::Transport(msg)
            | AppError::Protocol(msg)
            | AppError::DataIncomplete(msg)
            | AppError::Backend(msg)
            | AppError::ConfigError(msg)
            | AppError::ValidationError(msg)
            | AppError::Internal(msg) => msg,
        }
    }

    /// Whether this error ends the channel it happened on.
    ///
    /// Protocol violations are the only non-terminal category.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AppError::Protocol(_))
    }
}

/// Implementation of the Display trait for AppError.
///
/// ## Rust Concepts:
/// - **match**: Pattern matching to handle each error variant
/// - **write!**: Macro for formatting strings
impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Transport(msg) => write!(f, "Transport error: {}", msg),
            AppError::Protocol(msg) => write!(f, "Protocol violation: {}", msg),
            AppError::DataIncomplete(msg) => write!(f, "Data incomplete: {}", msg),
            AppError::Backend(msg) => write!(f, "Backend error: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Implementation of the ResponseError trait for AppError.
///
/// ## Purpose:
/// The loopback gateway handlers return `AppResult`, and this converts failures into
/// JSON HTTP responses.
///
/// ## HTTP Status Code Mapping:
/// - ValidationError/Protocol → 400 (Bad Request)
/// - Backend → 404 (unknown session ids are the only backend error the gateway raises)
/// - Transport → 502 (Bad Gateway)
/// - Everything else → 500 (Internal Server Error)
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        // Map each error type to HTTP status code, error type, and message
        let (status, error_type) = match self {
            AppError::ValidationError(_) => (
                actix_web::http::StatusCode::BAD_REQUEST,  // 400
                "validation_error",
            ),
            AppError::Protocol(_) => (
                actix_web::http::StatusCode::BAD_REQUEST,  // 400
                "protocol_error",
            ),
            AppError::Backend(_) => (
                actix_web::http::StatusCode::NOT_FOUND,  // 404
                "not_found",
            ),
            AppError::Transport(_) => (
                actix_web::http::StatusCode::BAD_GATEWAY,  // 502
                "transport_error",
            ),
            AppError::DataIncomplete(_) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,  // 500
                "data_incomplete",
            ),
            AppError::ConfigError(_) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,  // 500
                "config_error",
            ),
            AppError::Internal(_) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,  // 500
                "internal_error",
            ),
        };

        // Build the HTTP response with JSON body
        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,           // Machine-readable error type
                "message": self.message(),    // Human-readable error message
                "timestamp": chrono::Utc::now().to_rfc3339()  // When the error occurred
            }
        }))
    }
}

/// Automatic conversion from anyhow::Error to AppError.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Automatic conversion from JSON errors.
///
/// ## Why Protocol:
/// JSON failures in this crate come from frames a peer sent us, so they are
/// protocol violations rather than internal bugs.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Protocol(format!("JSON parsing error: {}", err))
    }
}

/// Automatic conversion from configuration errors to AppError.
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// WebSocket failures always end the channel.
impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::Transport(err.to_string())
    }
}

/// HTTP client failures (the interrupt call) are transport errors.
impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Transport(err.to_string())
    }
}

/// Type alias for Results that use our custom error type.
///
/// ## Usage Example:
/// ```rust
/// use turnlink::error::{AppError, AppResult};
/// fn check(content: &str) -> AppResult<()> {
///     if content.is_empty() {
///         return Err(AppError::ValidationError("empty".to_string()));
///     }
///     Ok(())
/// }
/// assert!(check("").is_err());
/// ```
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_strips_category() {
        let err = AppError::Backend("tts provider unavailable".to_string());
        assert_eq!(err.message(), "tts provider unavailable");
        assert_eq!(err.to_string(), "Backend error: tts provider unavailable");
    }

    #[test]
    fn test_only_protocol_violations_are_non_terminal() {
        assert!(!AppError::Protocol("unknown shape".to_string()).is_terminal());
        assert!(AppError::Transport("closed".to_string()).is_terminal());
        assert!(AppError::DataIncomplete("1/2".to_string()).is_terminal());
    }

    #[test]
    fn test_json_error_becomes_protocol_violation() {
        let err: AppError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, AppError::Protocol(_)));
    }
}
