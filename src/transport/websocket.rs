//! WebSocket transport.
//!
//! Carries RTVI envelopes as JSON text frames over a single WebSocket.
//! There is no media path: device lists are empty, mic and camera are
//! plain flags, and screen sharing is unsupported.
//!
//! # Connection Params
//!
//! The URL is taken from the params handed to [`Transport::connect`]:
//!
//! | Shape | Example |
//! |-------|---------|
//! | object with `ws_url` | `{"ws_url": "wss://bot.example.com/ws"}` |
//! | object with `wsUrl` | `{"wsUrl": "wss://bot.example.com/ws"}` |
//! | plain string | `"wss://bot.example.com/ws"` |
//!
//! # Event Loop
//!
//! Connecting spawns a tokio task that handles:
//!
//! - Incoming text frames, forwarded as [`TransportEvent::Message`]
//! - Outgoing envelopes queued by [`Transport::send_message`]
//! - Remote close or socket errors, reported as [`TransportEvent::Disconnected`]

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::protocol::RtviMessage;

use super::{MediaOptions, Transport, TransportEvent, TransportEventHandler};

// ============================================================================
// Constants
// ============================================================================

/// Default timeout for the WebSocket handshake.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Name reported by the transport.
const TRANSPORT_NAME: &str = "WebSocketTransport";

// ============================================================================
// Types
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Shared slot holding the client's event handler.
type HandlerSlot = Arc<Mutex<Option<TransportEventHandler>>>;

/// Internal commands for the event loop.
enum LinkCommand {
    /// Send one serialized envelope.
    Send(String),
    /// Close the socket without reporting a remote disconnect.
    Shutdown,
}

/// A live connection: command channel plus the event loop task.
struct Link {
    command_tx: mpsc::UnboundedSender<LinkCommand>,
    task: JoinHandle<()>,
}

// ============================================================================
// WebSocketTransport
// ============================================================================

/// Transport exchanging envelopes over a WebSocket.
///
/// # Example
///
/// ```ignore
/// use rtvi_client::{RtviClient, ConnectParams, transport::WebSocketTransport};
///
/// let client = RtviClient::builder()
///     .transport(WebSocketTransport::new())
///     .build()?;
///
/// client
///     .connect(Some(ConnectParams::params(serde_json::json!({ "ws_url": "ws://127.0.0.1:7860/ws" }))))
///     .await?;
/// ```
pub struct WebSocketTransport {
    handler: HandlerSlot,
    link: Mutex<Option<Link>>,
    mic_enabled: Mutex<bool>,
    cam_enabled: Mutex<bool>,
    connect_timeout: Duration,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketTransport {
    /// Creates a transport with the default handshake timeout (30s).
    #[must_use]
    pub fn new() -> Self {
        Self {
            handler: Arc::new(Mutex::new(None)),
            link: Mutex::new(None),
            mic_enabled: Mutex::new(false),
            cam_enabled: Mutex::new(false),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Sets the handshake timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Returns `true` while the event loop is running.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .is_some_and(|link| !link.task.is_finished())
    }

    /// Extracts and validates the WebSocket URL from connection params.
    fn resolve_url(params: Option<&Value>) -> Result<Url> {
        let raw = match params {
            Some(Value::String(url)) => Some(url.as_str()),
            Some(Value::Object(map)) => map
                .get("ws_url")
                .or_else(|| map.get("wsUrl"))
                .and_then(Value::as_str),
            _ => None,
        };

        let raw = raw.ok_or_else(|| Error::transport_start("connection params carry no ws_url"))?;

        let url = Url::parse(raw)
            .map_err(|e| Error::transport_start(format!("invalid ws_url `{raw}`: {e}")))?;

        match url.scheme() {
            "ws" | "wss" => Ok(url),
            scheme => Err(Error::transport_start(format!(
                "unsupported ws_url scheme: {scheme}"
            ))),
        }
    }

    /// Stops the event loop, if any, and waits for it to finish.
    async fn shutdown_link(&self) {
        let link = self.link.lock().take();

        if let Some(link) = link {
            let _ = link.command_tx.send(LinkCommand::Shutdown);
            if let Err(e) = link.task.await {
                warn!(error = %e, "WebSocket event loop ended abnormally");
            }
        }
    }

    /// Event loop that handles WebSocket I/O.
    async fn run_event_loop(
        ws_stream: WsStream,
        mut command_rx: mpsc::UnboundedReceiver<LinkCommand>,
        handler: HandlerSlot,
    ) {
        let (mut ws_write, mut ws_read) = ws_stream.split();
        let mut remote_closed = false;

        loop {
            tokio::select! {
                message = ws_read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<Value>(text.as_str()) {
                                Ok(value) => Self::emit(&handler, TransportEvent::Message(value)),
                                Err(e) => warn!(error = %e, "Dropping non-JSON text frame"),
                            }
                        }

                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "WebSocket closed by remote");
                            remote_closed = true;
                            break;
                        }

                        Some(Err(e)) => {
                            error!(error = %e, "WebSocket error");
                            remote_closed = true;
                            break;
                        }

                        None => {
                            debug!("WebSocket stream ended");
                            remote_closed = true;
                            break;
                        }

                        // Ignore Binary, Ping, Pong, Frame
                        _ => {}
                    }
                }

                command = command_rx.recv() => {
                    match command {
                        Some(LinkCommand::Send(json)) => {
                            if let Err(e) = ws_write.send(Message::Text(json.into())).await {
                                error!(error = %e, "Failed to send envelope");
                                remote_closed = true;
                                break;
                            }
                            trace!("Envelope sent");
                        }

                        Some(LinkCommand::Shutdown) => {
                            debug!("Shutdown command received");
                            let _ = ws_write.close().await;
                            break;
                        }

                        None => {
                            debug!("Command channel closed");
                            let _ = ws_write.close().await;
                            break;
                        }
                    }
                }
            }
        }

        if remote_closed {
            Self::emit(&handler, TransportEvent::Disconnected);
        }

        debug!("WebSocket event loop terminated");
    }

    /// Invokes the handler with the slot unlocked.
    fn emit(handler: &HandlerSlot, event: TransportEvent) {
        let handler = handler.lock().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &str {
        TRANSPORT_NAME
    }

    fn set_event_handler(&self, handler: TransportEventHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn clear_event_handler(&self) {
        *self.handler.lock() = None;
    }

    async fn init_devices(&self, options: MediaOptions) -> Result<()> {
        *self.mic_enabled.lock() = options.enable_mic;
        *self.cam_enabled.lock() = options.enable_cam;
        Ok(())
    }

    async fn connect(&self, params: Option<Value>) -> Result<()> {
        let url = Self::resolve_url(params.as_ref())?;

        // A reconnect replaces the previous socket.
        self.shutdown_link().await;

        let (ws_stream, _response) = timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| Error::timeout("WebSocket handshake", self.connect_timeout.as_millis() as u64))?
            .map_err(|e| Error::transport_start(format!("WebSocket handshake failed: {e}")))?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(Self::run_event_loop(
            ws_stream,
            command_rx,
            Arc::clone(&self.handler),
        ));

        *self.link.lock() = Some(Link { command_tx, task });

        info!(%url, "WebSocket transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.shutdown_link().await;
        Ok(())
    }

    fn send_message(&self, message: &RtviMessage) -> Result<()> {
        let json = message.serialize()?;

        let link = self.link.lock();
        let link = link.as_ref().ok_or(Error::ConnectionClosed)?;
        link.command_tx
            .send(LinkCommand::Send(json))
            .map_err(|_| Error::ConnectionClosed)
    }

    fn enable_mic(&self, enable: bool) -> Result<()> {
        *self.mic_enabled.lock() = enable;
        Ok(())
    }

    fn is_mic_enabled(&self) -> bool {
        *self.mic_enabled.lock()
    }

    fn enable_cam(&self, enable: bool) -> Result<()> {
        *self.cam_enabled.lock() = enable;
        Ok(())
    }

    fn is_cam_enabled(&self) -> bool {
        *self.cam_enabled.lock()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use tokio::net::TcpListener;

    /// Binds a local server and returns its URL plus the accepted socket.
    async fn bind_server() -> (String, JoinHandle<WebSocketStream<TcpStream>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            tokio_tungstenite::accept_async(stream)
                .await
                .expect("upgrade")
        });

        (format!("ws://127.0.0.1:{port}"), accept)
    }

    fn forwarding_handler() -> (TransportEventHandler, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: TransportEventHandler = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        (handler, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    #[test]
    fn test_resolve_url_shapes() {
        let url = WebSocketTransport::resolve_url(Some(&json!({ "ws_url": "ws://localhost/a" })))
            .expect("snake case");
        assert_eq!(url.path(), "/a");

        WebSocketTransport::resolve_url(Some(&json!({ "wsUrl": "wss://localhost/b" })))
            .expect("camel case");
        WebSocketTransport::resolve_url(Some(&json!("ws://localhost"))).expect("string");
    }

    #[test]
    fn test_resolve_url_rejects_missing_and_http() {
        let err = WebSocketTransport::resolve_url(None).unwrap_err();
        assert!(matches!(err, Error::TransportStart { .. }));

        let err = WebSocketTransport::resolve_url(Some(&json!({ "ws_url": "http://localhost" })))
            .unwrap_err();
        assert!(err.to_string().contains("scheme"));
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let transport = WebSocketTransport::new();
        let err = transport
            .send_message(&RtviMessage::client_ready())
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        transport.disconnect().await.expect("disconnect is idempotent");
    }

    #[tokio::test]
    async fn test_round_trip_with_server() {
        let (url, accept) = bind_server().await;
        let transport = WebSocketTransport::new();
        let (handler, mut events) = forwarding_handler();
        transport.set_event_handler(handler);

        transport
            .connect(Some(json!({ "ws_url": url })))
            .await
            .expect("connect");
        let mut server = accept.await.expect("server task");
        assert!(transport.is_connected());

        transport
            .send_message(&RtviMessage::client_ready())
            .expect("send");

        let frame = server.next().await.expect("frame").expect("ok frame");
        let sent: Value = serde_json::from_str(frame.to_text().expect("text")).expect("json");
        assert_eq!(sent["type"], "client-ready");
        assert_eq!(sent["label"], "rtvi-ai");

        let ready = json!({ "id": "1", "label": "rtvi-ai", "type": "bot-ready", "data": {} });
        server
            .send(Message::Text(ready.to_string().into()))
            .await
            .expect("server send");

        match next_event(&mut events).await {
            TransportEvent::Message(value) => assert_eq!(value["type"], "bot-ready"),
            other => panic!("unexpected event: {other:?}"),
        }

        transport.disconnect().await.expect("disconnect");
        assert!(!transport.is_connected());
        assert!(events.try_recv().is_err(), "local disconnect is not reported");
    }

    #[tokio::test]
    async fn test_remote_close_reports_disconnected() {
        let (url, accept) = bind_server().await;
        let transport = WebSocketTransport::new();
        let (handler, mut events) = forwarding_handler();
        transport.set_event_handler(handler);

        transport.connect(Some(json!(url))).await.expect("connect");
        let mut server = accept.await.expect("server task");
        server.close(None).await.expect("close");

        assert_eq!(next_event(&mut events).await, TransportEvent::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let transport = WebSocketTransport::new().with_connect_timeout(Duration::from_secs(5));
        let err = transport
            .connect(Some(json!({ "ws_url": format!("ws://127.0.0.1:{port}") })))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransportStart { .. }));
    }

    #[test]
    fn test_screen_share_unsupported() {
        let transport = WebSocketTransport::new();
        let err = transport.enable_screen_share(true).unwrap_err();
        assert!(err.to_string().contains("WebSocketTransport"));
        assert!(!transport.is_sharing_screen());
    }

    #[tokio::test]
    async fn test_media_flags() {
        let transport = WebSocketTransport::new();
        transport
            .init_devices(MediaOptions::default())
            .await
            .expect("init");
        assert!(transport.is_mic_enabled());
        transport.enable_cam(true).expect("cam");
        assert!(transport.is_cam_enabled());
        assert!(transport.get_all_mics().await.expect("mics").is_empty());
    }
}
