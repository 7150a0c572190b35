//! Error types for wa-crm-bridge
//!
//! This module defines all error types used throughout the connector.
//! Uses `thiserror` for ergonomic error handling with automatic `Display` and
//! `Error` trait implementations.

use std::fmt;
use thiserror::Error;

// ============================================================================
// Session Error Classification
// ============================================================================

/// Structured classification of failures reported by the WhatsApp session.
///
/// Lets the lifecycle decide between an automatic reconnect and a full
/// credential wipe without string matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Transport dropped (socket closed, DNS, TLS)
    Network(String),
    /// Request to the session did not answer in time
    Timeout(String),
    /// Account was logged out from the phone; credentials are invalid
    LoggedOut(String),
    /// Another client took over this session
    Replaced(String),
    /// Session refused the operation (bad recipient, unsupported payload)
    Rejected(String),
    /// Catch-all for unrecognized errors
    Unknown(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Network(msg) => write!(f, "Network error: {}", msg),
            SessionError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            SessionError::LoggedOut(msg) => write!(f, "Logged out: {}", msg),
            SessionError::Replaced(msg) => write!(f, "Session replaced: {}", msg),
            SessionError::Rejected(msg) => write!(f, "Rejected: {}", msg),
            SessionError::Unknown(msg) => write!(f, "Unknown session error: {}", msg),
        }
    }
}

impl SessionError {
    /// Returns `true` if the session can be brought back without a new QR scan.
    ///
    /// Only an explicit logout is terminal.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SessionError::LoggedOut(_))
    }

    /// Returns `true` if a send that failed with this error is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::Network(_) | SessionError::Timeout(_) | SessionError::Unknown(_)
        )
    }
}

impl From<SessionError> for ConnectorError {
    fn from(err: SessionError) -> Self {
        ConnectorError::Session(err)
    }
}

// ============================================================================
// Primary Error Type
// ============================================================================

/// The primary error type for connector operations.
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// Configuration-related errors (invalid config, missing required fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Structured session error with classification for reconnect decisions.
    #[error("Session error: {0}")]
    Session(SessionError),

    /// The tenant has no live, authenticated WhatsApp session
    #[error("Tenant {0} is not connected")]
    NotConnected(String),

    /// Another tenant already holds a connected session for this phone number
    #[error("Phone {phone} is already connected on tenant {holder}")]
    PhoneAlreadyConnected { phone: String, holder: String },

    /// CRM API failures (auth, bad response, unknown location, etc.)
    #[error("CRM error: {0}")]
    Crm(String),

    /// Persistence failures (snapshot write, corrupted file, etc.)
    #[error("Store error: {0}")]
    Store(String),

    /// Caller supplied a value the connector cannot act on
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found (tenants, messages, etc.)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ConnectorError {
    /// Stable machine-readable code, used in webhook payloads.
    pub fn code(&self) -> &'static str {
        match self {
            ConnectorError::Config(_) => "config_error",
            ConnectorError::Session(SessionError::LoggedOut(_)) => "logged_out",
            ConnectorError::Session(_) => "session_error",
            ConnectorError::NotConnected(_) => "not_connected",
            ConnectorError::PhoneAlreadyConnected { .. } => "phone_already_connected",
            ConnectorError::Crm(_) => "crm_error",
            ConnectorError::Store(_) => "store_error",
            ConnectorError::InvalidInput(_) => "invalid_input",
            ConnectorError::NotFound(_) => "not_found",
            ConnectorError::Io(_) => "io_error",
            ConnectorError::Json(_) => "json_error",
            ConnectorError::Http(_) => "http_error",
        }
    }

    /// Returns `true` if repeating the operation later may succeed.
    ///
    /// A tenant that is not connected yet can come back; a rejected
    /// recipient or a malformed request cannot.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConnectorError::Session(e) => e.is_retryable(),
            ConnectorError::NotConnected(_)
            | ConnectorError::Store(_)
            | ConnectorError::Io(_)
            | ConnectorError::Http(_) => true,
            ConnectorError::Config(_)
            | ConnectorError::PhoneAlreadyConnected { .. }
            | ConnectorError::Crm(_)
            | ConnectorError::InvalidInput(_)
            | ConnectorError::NotFound(_)
            | ConnectorError::Json(_) => false,
        }
    }
}

/// A specialized `Result` type for connector operations.
pub type Result<T> = std::result::Result<T, ConnectorError>;
