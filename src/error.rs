//! Error types for the RTVI client.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use rtvi_client::{Result, RtviClient};
//!
//! async fn example(client: &RtviClient) -> Result<()> {
//!     client.connect(None).await?;
//!     client.send_client_message("set-language", serde_json::json!({ "lang": "en" }))?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Session | [`Error::ConnectionTimeout`], [`Error::StartBot`], [`Error::TransportStart`], [`Error::BotNotReady`], [`Error::InvalidState`], [`Error::Cancelled`] |
//! | Capability | [`Error::UnsupportedFeature`] |
//! | Protocol | [`Error::MessageTooLarge`], [`Error::InvalidArgument`], [`Error::Protocol`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionClosed`] |
//! | Execution | [`Error::Timeout`], [`Error::RequestTimeout`] |
//! | External | [`Error::Json`], [`Error::Http`], [`Error::WebSocket`], [`Error::ChannelClosed`] |

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::MessageId;
use crate::transport::TransportState;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when client configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Session Errors
    // ========================================================================
    /// The bot did not reach the ready state in time.
    #[error("Bot did not enter ready state within {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Fetching connection parameters from the start endpoint failed.
    ///
    /// Carries the upstream HTTP status when one was received.
    #[error("Failed to start bot: {message}")]
    StartBot {
        /// Description of the failure.
        message: String,
        /// Upstream HTTP status code, if any.
        status: Option<u16>,
    },

    /// The transport could not establish its connection.
    #[error("Unable to connect to transport: {message}")]
    TransportStart {
        /// Description of the failure.
        message: String,
    },

    /// An action requiring the `ready` state was invoked too early.
    #[error("Attempt to call {action} when transport is not ready (state: {state})")]
    BotNotReady {
        /// The attempted action.
        action: String,
        /// State at the time of the call.
        state: TransportState,
    },

    /// An action is not permitted in the current state.
    #[error("Cannot {action} while {state}")]
    InvalidState {
        /// The attempted action.
        action: String,
        /// State at the time of the call.
        state: TransportState,
    },

    /// An in-flight operation was aborted by a disconnect.
    #[error("Operation cancelled: {operation}")]
    Cancelled {
        /// The aborted operation.
        operation: String,
    },

    // ========================================================================
    // Capability Errors
    // ========================================================================
    /// Capability absent on the current transport.
    #[error("{source_name} does not support {feature}")]
    UnsupportedFeature {
        /// Feature name.
        feature: String,
        /// Transport (or component) lacking the feature.
        source_name: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Outbound message exceeds the configured byte ceiling.
    #[error("Message data too large. Max size is {max_size} bytes, message is {size} bytes")]
    MessageTooLarge {
        /// Serialized size of the rejected message.
        size: usize,
        /// Configured ceiling.
        max_size: usize,
    },

    /// Invalid argument supplied by the caller.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    /// Malformed or unroutable protocol message.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Transport-level connection failure.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Connection closed while an operation was pending.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Execution Errors
    // ========================================================================
    /// Operation timeout.
    #[error("Timed out after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// No response to a client request in time.
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// The request ID that timed out.
        request_id: MessageId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a start bot error.
    #[inline]
    pub fn start_bot(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::StartBot {
            message: message.into(),
            status,
        }
    }

    /// Creates a transport start error.
    #[inline]
    pub fn transport_start(message: impl Into<String>) -> Self {
        Self::TransportStart {
            message: message.into(),
        }
    }

    /// Creates a bot not ready error.
    #[inline]
    pub fn bot_not_ready(action: impl Into<String>, state: TransportState) -> Self {
        Self::BotNotReady {
            action: action.into(),
            state,
        }
    }

    /// Creates an invalid state error.
    #[inline]
    pub fn invalid_state(action: impl Into<String>, state: TransportState) -> Self {
        Self::InvalidState {
            action: action.into(),
            state,
        }
    }

    /// Creates a cancelled error.
    #[inline]
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Creates an unsupported feature error.
    #[inline]
    pub fn unsupported_feature(feature: impl Into<String>, source_name: impl Into<String>) -> Self {
        Self::UnsupportedFeature {
            feature: feature.into(),
            source_name: source_name.into(),
        }
    }

    /// Creates a message too large error.
    #[inline]
    pub fn message_too_large(size: usize, max_size: usize) -> Self {
        Self::MessageTooLarge { size, max_size }
    }

    /// Creates an invalid argument error.
    #[inline]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    #[inline]
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(request_id: MessageId, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            request_id,
            timeout_ms,
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::Timeout { .. } | Self::RequestTimeout { .. }
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::TransportStart { .. }
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this error should move the session to `error`.
    ///
    /// Cancellation is a deliberate teardown, not a failure.
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Cancelled { .. })
    }

    /// Returns the upstream HTTP status carried by the error, if any.
    #[inline]
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::StartBot { status, .. } => *status,
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
