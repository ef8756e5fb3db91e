// MIT License - Copyright (c) 2026 Peter Wright
// LEAP bridge

use crate::protocol::StatusCode;

/// All errors that can occur in the leap-bridge library.
#[derive(Debug, thiserror::Error)]
pub enum LeapError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Handshake or transport failure while establishing the connection.
    #[error("Connection failed: {reason}")]
    ConnectionError { reason: String },

    #[error("Request timeout: {url}")]
    RequestTimeout { url: String },

    /// The connection dropped while the request was outstanding.
    #[error("Connection lost")]
    ConnectionLost,

    #[error("Reconfiguration gave up after {attempts} connection attempts")]
    ReconfigurationExhausted { attempts: u32 },

    #[error("Reconfiguration already in progress for controller {controller_id}")]
    ReconfigurationInProgress { controller_id: String },

    #[error("Failed to read {href}: {reason}")]
    TopologyRead { href: String, reason: String },

    #[error("Unsupported project type: {product_type}")]
    UnsupportedProjectType { product_type: String },

    /// The controller answered with an `ExceptionResponse` or an error status.
    #[error("Controller error {status}: {message}")]
    Exception { status: StatusCode, message: String },

    #[error("Invalid response: {details}")]
    InvalidResponse { details: String },

    #[error("Bad credentials: {reason}")]
    Credentials { reason: String },
}

impl LeapError {
    /// Whether this error is transient and the operation may succeed on a fresh connection.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LeapError::Io(_)
                | LeapError::ConnectionError { .. }
                | LeapError::RequestTimeout { .. }
                | LeapError::ConnectionLost
        )
    }

    pub(crate) fn topology(href: &str, err: &LeapError) -> Self {
        LeapError::TopologyRead {
            href: href.to_string(),
            reason: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LeapError>;
