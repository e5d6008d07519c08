//! Client configuration and builder.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use rtvi_client::{Callbacks, RtviClient, transport::MemoryTransport};
//!
//! let (transport, _remote) = MemoryTransport::new();
//! let client = RtviClient::builder()
//!     .transport(transport)
//!     .enable_cam(true)
//!     .ready_timeout(Duration::from_secs(30))
//!     .callbacks(Callbacks::new().on_bot_ready(|_| println!("ready")))
//!     .build()?;
//! ```
//!
//! # Defaults
//!
//! | Option | Default |
//! |--------|---------|
//! | `enable_mic` | `true` |
//! | `enable_cam` | `false` |
//! | `max_message_size` | 65536 bytes |
//! | `ready_timeout` | none (wait for `bot-ready` indefinitely) |
//! | `request_timeout` | 10s |

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use tokio::runtime::Handle;
use tracing::Span;

use crate::error::{Error, Result};
use crate::events::Callbacks;
use crate::protocol::DEFAULT_MAX_MESSAGE_SIZE;
use crate::transport::{MediaOptions, Transport};

use super::core::RtviClient;

// ============================================================================
// Constants
// ============================================================================

/// Default timeout for [`RtviClient::send_client_request`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// ClientOptions
// ============================================================================

/// Session options, fixed at construction.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Start with the microphone enabled.
    pub enable_mic: bool,
    /// Start with the camera enabled.
    pub enable_cam: bool,
    /// Ceiling for one outbound envelope, in UTF-8 bytes (inclusive).
    pub max_message_size: usize,
    /// How long `connect` waits for `bot-ready`.
    pub ready_timeout: Option<Duration>,
    /// Default wait for a `server-response`.
    pub request_timeout: Duration,
    /// Typed per-event callbacks.
    pub callbacks: Callbacks,
    /// Parent span for all client logging; defaults to an `rtvi_client` span.
    pub span: Option<Span>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            enable_mic: true,
            enable_cam: false,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            ready_timeout: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            callbacks: Callbacks::default(),
            span: None,
        }
    }
}

impl ClientOptions {
    /// Media defaults handed to the transport on device init.
    #[inline]
    #[must_use]
    pub fn media(&self) -> MediaOptions {
        MediaOptions {
            enable_mic: self.enable_mic,
            enable_cam: self.enable_cam,
        }
    }
}

// ============================================================================
// ClientBuilder
// ============================================================================

/// Builder for configuring an [`RtviClient`].
///
/// Use [`RtviClient::builder()`] to create a new builder.
#[derive(Default)]
pub struct ClientBuilder {
    /// Transport the session takes ownership of.
    transport: Option<Box<dyn Transport>>,
    /// Accumulated options.
    options: ClientOptions,
}

impl ClientBuilder {
    /// Creates a builder with default options and no transport.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the transport. The client owns it exclusively.
    #[inline]
    #[must_use]
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    /// Sets an already boxed transport.
    #[inline]
    #[must_use]
    pub fn boxed_transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Starts with the microphone enabled or disabled.
    #[inline]
    #[must_use]
    pub fn enable_mic(mut self, enable: bool) -> Self {
        self.options.enable_mic = enable;
        self
    }

    /// Starts with the camera enabled or disabled.
    #[inline]
    #[must_use]
    pub fn enable_cam(mut self, enable: bool) -> Self {
        self.options.enable_cam = enable;
        self
    }

    /// Sets the outbound message ceiling in bytes.
    #[inline]
    #[must_use]
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.options.max_message_size = bytes;
        self
    }

    /// Fails `connect` if `bot-ready` does not arrive in time.
    #[inline]
    #[must_use]
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.options.ready_timeout = Some(timeout);
        self
    }

    /// Sets the default client request timeout.
    #[inline]
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.options.request_timeout = timeout;
        self
    }

    /// Sets the typed callbacks.
    #[inline]
    #[must_use]
    pub fn callbacks(mut self, callbacks: Callbacks) -> Self {
        self.options.callbacks = callbacks;
        self
    }

    /// Sets the parent span for client logging.
    #[inline]
    #[must_use]
    pub fn span(mut self, span: Span) -> Self {
        self.options.span = Some(span);
        self
    }

    /// Replaces all options at once.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Builds the client with validation.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if no transport is set
    /// - [`Error::Config`] if `max_message_size` is zero
    /// - [`Error::Config`] if called outside a tokio runtime
    pub fn build(self) -> Result<RtviClient> {
        let transport = self.transport.ok_or_else(|| {
            Error::config(
                "Transport is required. Use .transport() to set it.\n\
                 Example: RtviClient::builder().transport(WebSocketTransport::new())",
            )
        })?;

        if self.options.max_message_size == 0 {
            return Err(Error::config("max_message_size must be greater than zero"));
        }

        let runtime = Handle::try_current().map_err(|_| {
            Error::config(
                "RtviClient must be built inside a tokio runtime.\n\
                 Example: #[tokio::main] async fn main() { RtviClient::builder()... }",
            )
        })?;

        RtviClient::new(transport, self.options, runtime)
    }
}

// ============================================================================
// Tests
// ============================================================================
