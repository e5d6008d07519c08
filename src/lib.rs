//! RTVI client - Session engine for real-time voice agents.
//!
//! This library drives one session between a local application and a
//! remote conversational agent ("bot") that speaks the RTVI protocol.
//!
//! # Architecture
//!
//! The client sits between the application and a pluggable transport:
//!
//! - **Application**: Calls session methods, observes events
//! - **Client**: Owns the lifecycle state machine and message routing
//! - **Transport**: Moves media and JSON envelopes to the bot
//!
//! Key design principles:
//!
//! - Each [`RtviClient`] owns exactly one transport
//! - Every emission is delivered in order: typed callback, then bus handlers
//! - Outbound envelopes are size-checked before they reach the transport
//! - Bot function calls are dispatched to named async handlers, at most once
//!
//! # Quick Start
//!
//! ```no_run
//! use rtvi_client::{Callbacks, ConnectParams, Result, RtviClient};
//! use rtvi_client::transport::WebSocketTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = RtviClient::builder()
//!         .transport(WebSocketTransport::new())
//!         .callbacks(Callbacks::new().on_user_transcript(|t| println!("user: {}", t.text)))
//!         .build()?;
//!
//!     let params = ConnectParams::params(serde_json::json!({ "ws_url": "ws://127.0.0.1:7860/ws" }));
//!     let bot = client.connect(Some(params)).await?;
//!     println!("Bot ready, protocol {}", bot.version);
//!
//!     client.send_client_message("set-language", serde_json::json!({ "lang": "en" }))?;
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | [`RtviClient`], builder and options |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`events`] | Canonical events, bus and typed callbacks |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | RTVI envelope and payload types |
//! | [`rest`] | Connection params fetch |
//! | [`transport`] | Transport contract and providers |

// ============================================================================
// Modules
// ============================================================================

/// Session client.
///
/// Use [`RtviClient::builder()`] to create a configured client.
pub mod client;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Canonical events and their delivery.
pub mod events;

/// Type-safe identifiers.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// RTVI protocol message types.
pub mod protocol;

/// HTTP fetch of connection params.
pub mod rest;

/// Transport contract and providers.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{
    ApiRequest, ClientBuilder, ClientOptions, ConnectParams, Endpoint, FunctionCallRegistry,
    RtviClient,
};

// Error types
pub use error::{Error, Result};

// Event types
pub use events::{Callbacks, EventName, RtviEvent};

// Identifier types
pub use identifiers::{MessageId, ParticipantId, SubscriptionId};

// Protocol types
pub use protocol::{BotReadyData, FunctionCallParams, MessageType, RtviMessage, SendTextOptions};

// Transport types
pub use transport::{Transport, TransportEvent, TransportState};
