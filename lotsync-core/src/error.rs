//! Error types for lotsync
//!
//! Two types live here:
//!
//! - **Error**: the application-level error every lotsync operation returns
//! - **RemoteError**: the error object the hosted backend sends back
//!   (HTTP-like status, database code, message)
//!
//! # Classification
//!
//! Every error maps onto an [`ErrorClass`], which is what the retry executor
//! and the feed stores act on:
//!
//! | class        | examples                                    | retried |
//! |--------------|---------------------------------------------|---------|
//! | `Transient`  | network failure, 5xx, unknown failure       | yes     |
//! | `Timeout`    | an operation exceeded its time budget       | yes     |
//! | `Auth`       | 401, expired JWT, no session                | no      |
//! | `Rejected`   | 403, 404, other client-side statuses        | no      |
//! | `Validation` | input rejected before any network call      | no      |
//!
//! # Examples
//!
//! ```rust
//! use lotsync_core::{Error, ErrorClass, RemoteError};
//!
//! let error: Error = RemoteError::unauthorized("JWT expired").into();
//! assert_eq!(error.class(), ErrorClass::Auth);
//! assert!(!error.is_retryable());
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for lotsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Application-level error type for lotsync operations
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The backend answered with an error object
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The request never reached the backend or the response was lost
    #[error("Network error: {0}")]
    Network(String),

    /// The device is known to be offline
    #[error("No internet connection")]
    Offline,

    /// An operation exceeded its time budget
    #[error("Operation timed out: {label}")]
    Timeout {
        /// Name of the operation that timed out
        label: String,
    },

    /// No valid session, or the session could not be renewed
    #[error("Session error: {0}")]
    Session(String),

    /// Input rejected locally, before any network call
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A realtime channel could not be opened or was closed by the backend
    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure classes driving retry and user-facing handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Transient,
    Timeout,
    Auth,
    Rejected,
    Validation,
}

impl Error {
    /// Convenience constructor for timeouts
    pub fn timeout(label: impl Into<String>) -> Self {
        Error::Timeout {
            label: label.into(),
        }
    }

    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Remote(remote) => remote.class(),
            Error::Network(_) | Error::Offline | Error::Subscription(_) | Error::Internal(_) => {
                ErrorClass::Transient
            }
            Error::Timeout { .. } => ErrorClass::Timeout,
            Error::Session(_) => ErrorClass::Auth,
            Error::Validation(_) => ErrorClass::Validation,
            Error::Serialization(_) => ErrorClass::Rejected,
        }
    }

    /// Whether another attempt could succeed
    ///
    /// `Offline` is transient but never retried: the executor waits for the
    /// connectivity monitor to report the network back instead.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Offline)
            && matches!(self.class(), ErrorClass::Transient | ErrorClass::Timeout)
    }

    /// Whether this error means the session is gone
    pub fn is_auth(&self) -> bool {
        self.class() == ErrorClass::Auth
    }

    /// Text suitable for showing to the user
    pub fn user_message(&self) -> String {
        match self {
            Error::Remote(remote) => remote.user_message(),
            Error::Network(_) | Error::Subscription(_) => {
                "Network error. Please check your internet connection and try again.".to_string()
            }
            Error::Offline => {
                "No internet connection. Please check your network and try again.".to_string()
            }
            Error::Timeout { .. } => {
                "The request timed out. Please check your internet connection and try again."
                    .to_string()
            }
            Error::Session(_) => "Your session has expired. Please sign in again.".to_string(),
            Error::Validation(msg) => msg.clone(),
            Error::Serialization(_) | Error::Internal(_) => {
                "An unexpected error occurred".to_string()
            }
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Error object returned by the hosted backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    /// HTTP-like status, when the backend reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Database or gateway error code (`23505`, `PGRST116`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl RemoteError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: None,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(Some(400), msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(Some(401), msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(Some(403), msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(Some(404), msg)
    }

    /// Unique-constraint violation on insert
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(Some(409), msg).with_code("23505")
    }

    pub fn server_error(msg: impl Into<String>) -> Self {
        Self::new(Some(500), msg)
    }

    pub fn class(&self) -> ErrorClass {
        if self.message.contains("JWT") {
            return ErrorClass::Auth;
        }
        match self.status {
            Some(401) => ErrorClass::Auth,
            // request timeout and rate limiting clear up on their own
            Some(408) => ErrorClass::Timeout,
            Some(429) => ErrorClass::Transient,
            Some(status) if (400..500).contains(&status) => ErrorClass::Rejected,
            _ => ErrorClass::Transient,
        }
    }

    pub fn user_message(&self) -> String {
        match self.code.as_deref() {
            Some("23505") => return "A record with this information already exists".to_string(),
            Some("23503") => {
                return "This operation would violate referential integrity".to_string()
            }
            Some("42P01") => return "The requested resource does not exist".to_string(),
            Some("PGRST116") => return "Invalid query parameter format".to_string(),
            _ => {}
        }
        if self.message.contains("JWT") {
            return "Your session has expired. Please refresh the page to continue.".to_string();
        }
        match self.status {
            Some(400) => "Invalid request. Please check your input and try again.".to_string(),
            Some(401) => "Your session has expired. Please sign in again.".to_string(),
            Some(403) => "You do not have permission to perform this action.".to_string(),
            Some(404) => "The requested resource was not found.".to_string(),
            Some(status) if status >= 500 => {
                "A server error occurred. Please try again later.".to_string()
            }
            _ if self.message.is_empty() => "An error occurred".to_string(),
            _ => self.message.clone(),
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.status, &self.code) {
            (Some(status), Some(code)) => write!(f, "[{} {}] {}", status, code, self.message),
            (Some(status), None) => write!(f, "[{}] {}", status, self.message),
            (None, Some(code)) => write!(f, "[{}] {}", code, self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for RemoteError {}
