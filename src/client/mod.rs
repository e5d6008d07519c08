//! RTVI client module.
//!
//! This module provides the session entry point.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`RtviClient`] | Session state machine and message router |
//! | [`ClientBuilder`] | Fluent configuration builder |
//! | [`ClientOptions`] | Session options |
//! | [`ConnectParams`] | Inline or fetched connection params |
//! | [`FunctionCallRegistry`] | Named handlers for bot function calls |
//!
//! # Example
//!
//! ```no_run
//! use rtvi_client::{ConnectParams, Result, RtviClient};
//! use rtvi_client::transport::WebSocketTransport;
//!
//! # async fn example() -> Result<()> {
//! let client = RtviClient::builder()
//!     .transport(WebSocketTransport::new())
//!     .build()?;
//!
//! let params = ConnectParams::params(serde_json::json!({ "ws_url": "ws://127.0.0.1:7860/ws" }));
//! client.connect(Some(params)).await?;
//! client.send_client_message("hello", serde_json::json!({}))?;
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Core client implementation.
pub mod core;

/// Function-call handler registry.
pub mod functions;

/// Client options and builder.
pub mod options;

/// Connection parameters.
pub mod params;

// ============================================================================
// Re-exports
// ============================================================================

pub use core::RtviClient;
pub use functions::{DispatchOutcome, FunctionCallFuture, FunctionCallHandler, FunctionCallRegistry};
pub use options::{ClientBuilder, ClientOptions, DEFAULT_REQUEST_TIMEOUT};
pub use params::{ApiRequest, ConnectParams, Endpoint};
