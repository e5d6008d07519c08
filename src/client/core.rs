//! RTVI session client.
//!
//! [`RtviClient`] drives one session over an exclusively owned transport:
//!
//! ```text
//! disconnected → initializing → initialized → connecting → connected → ready
//!       ▲                                                                 │
//!       └──────────────────── disconnecting ◄─────────────────────────────┘
//! ```
//!
//! `error` is entered when device init or connect fails.
//!
//! # Ordering
//!
//! Every emission (state changes, transport events, inbound messages)
//! runs under one re-entrant lock, so observers see each state exactly
//! once and in order, even while transport events arrive from other
//! threads. Handlers may call back into the client.
//!
//! # Example
//!
//! ```ignore
//! use rtvi_client::{ConnectParams, EventName, RtviClient, RtviEvent};
//! use rtvi_client::transport::WebSocketTransport;
//!
//! let client = RtviClient::builder()
//!     .transport(WebSocketTransport::new())
//!     .build()?;
//!
//! client.on(EventName::UserTranscript, |event| {
//!     if let RtviEvent::UserTranscript(t) = event {
//!         println!("user: {}", t.text);
//!     }
//! });
//!
//! client.register_function_call_handler("get_weather", |call| async move {
//!     Some(serde_json::json!({ "city": call.arguments["city"], "temp": 21 }))
//! });
//!
//! client
//!     .connect(Some(ConnectParams::params(serde_json::json!({ "ws_url": "ws://127.0.0.1:7860/ws" }))))
//!     .await?;
//! client.send_client_message("set-language", serde_json::json!({ "lang": "en" }))?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::Future;
use std::mem;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::{Mutex, ReentrantMutex};
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, trace, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::{EventBus, EventName, RtviEvent};
use crate::identifiers::{MessageId, ParticipantId, SubscriptionId};
use crate::protocol::{
    BotReadyData, ErrorData, FunctionCallParams, LlmFunctionCallData,
    LlmFunctionCallInProgressData, MessageType, RTVI_MESSAGE_LABEL, RtviMessage, SendTextOptions,
};
use crate::rest;
use crate::transport::{
    MediaDeviceInfo, Participant, Tracks, Transport, TransportEvent, TransportEventHandler,
    TransportState,
};

use super::functions::{DispatchOutcome, FunctionCallRegistry};
use super::options::{ClientBuilder, ClientOptions};
use super::params::{ApiRequest, ConnectParams};

// ============================================================================
// Constants
// ============================================================================

/// Maximum pending client requests before rejecting new ones.
const MAX_PENDING_REQUESTS: usize = 100;

// ============================================================================
// Types
// ============================================================================

/// Map of request IDs to response channels.
type PendingMap = FxHashMap<MessageId, oneshot::Sender<Result<Value>>>;

/// Mutable session state, guarded by one lock.
struct Session {
    state: TransportState,
    /// Cancelled and replaced by every disconnect.
    cancel: CancellationToken,
    participants: FxHashMap<ParticipantId, Participant>,
    bot_id: Option<ParticipantId>,
    /// Last fatal failure, reported to observers of the failed attempt.
    last_error: Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: TransportState::Disconnected,
            cancel: CancellationToken::new(),
            participants: FxHashMap::default(),
            bot_id: None,
            last_error: None,
        }
    }
}

/// What a `connect` call does, decided atomically.
enum ConnectRole {
    /// Devices must be initialized first.
    Init,
    /// This call drives the attempt.
    Lead(CancellationToken),
    /// Another call is driving the attempt.
    Observe,
    /// Already ready.
    Ready(BotReadyData),
}

// ============================================================================
// RtviClient
// ============================================================================

/// Handle to one RTVI session.
///
/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct RtviClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    id: String,
    transport: Arc<dyn Transport>,
    options: ClientOptions,
    span: Span,
    runtime: Handle,
    http: reqwest::Client,
    bus: EventBus,
    functions: FunctionCallRegistry,
    /// Serializes every emission.
    emit_lock: ReentrantMutex<()>,
    session: Mutex<Session>,
    state_tx: watch::Sender<TransportState>,
    ready_tx: watch::Sender<Option<BotReadyData>>,
    pending: Mutex<PendingMap>,
}

impl fmt::Debug for RtviClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtviClient")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("transport", &self.inner.transport.name())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// RtviClient - Construction
// ============================================================================

impl RtviClient {
    /// Creates a builder for configuring a client.
    #[inline]
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Creates a client owning `transport`.
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        options: ClientOptions,
        runtime: Handle,
    ) -> Result<Self> {
        let id = Uuid::new_v4().to_string();
        let span = options
            .span
            .clone()
            .unwrap_or_else(|| info_span!("rtvi_client", client_id = %id));
        let http = reqwest::Client::builder().build()?;

        let inner = Arc::new(ClientInner {
            id,
            transport: Arc::from(transport),
            options,
            span,
            runtime,
            http,
            bus: EventBus::new(),
            functions: FunctionCallRegistry::new(),
            emit_lock: ReentrantMutex::new(()),
            session: Mutex::new(Session::default()),
            state_tx: watch::Sender::new(TransportState::Disconnected),
            ready_tx: watch::Sender::new(None),
            pending: Mutex::new(PendingMap::default()),
        });

        let weak: Weak<ClientInner> = Arc::downgrade(&inner);
        let handler: TransportEventHandler = Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_transport_event(event);
            }
        });
        inner.transport.set_event_handler(handler);

        debug!(parent: &inner.span, transport = inner.transport.name(), "Client created");
        Ok(Self { inner })
    }
}

// ============================================================================
// RtviClient - Lifecycle
// ============================================================================

impl RtviClient {
    /// Initializes media devices.
    ///
    /// `disconnected → initializing → initialized`. No-op once initialized
    /// or further along; a concurrent call waits for the one in flight.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] if disconnected meanwhile
    /// - any transport device error (state moves to `error`)
    pub async fn init_devices(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let span = inner.span.clone();
        async move { inner.init_devices().await }
            .instrument(span)
            .await
    }

    /// Connects the session and waits for the bot.
    ///
    /// Runs device init when needed, resolves `params`, connects the
    /// transport, sends `client-ready` and waits for `bot-ready`. While
    /// `ready` this is a no-op; a concurrent call waits for the attempt
    /// in flight.
    ///
    /// # Errors
    ///
    /// - [`Error::StartBot`] / [`Error::Timeout`] if the params fetch fails
    /// - [`Error::TransportStart`] if the transport cannot connect
    /// - [`Error::ConnectionTimeout`] if `bot-ready` does not arrive within `ready_timeout`
    /// - [`Error::Cancelled`] if [`RtviClient::disconnect`] runs meanwhile
    pub async fn connect(&self, params: Option<ConnectParams>) -> Result<BotReadyData> {
        let inner = Arc::clone(&self.inner);
        let span = inner.span.clone();
        async move { inner.connect(params).await }
            .instrument(span)
            .await
    }

    /// Ends the session.
    ///
    /// `* → disconnecting → disconnected`. Aborts an in-flight connect,
    /// fails pending requests and clears participants. Always ends in
    /// `disconnected`.
    ///
    /// # Errors
    ///
    /// Returns the transport's disconnect error, after the session has
    /// still reached `disconnected`.
    pub async fn disconnect(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let span = inner.span.clone();
        async move { inner.disconnect().await }
            .instrument(span)
            .await
    }

    /// Fetches connection params from `request` without connecting.
    ///
    /// Emits `botStarted` with the response. Aborted by `disconnect`.
    ///
    /// # Errors
    ///
    /// Same as the params fetch of [`RtviClient::connect`].
    pub async fn start_bot(&self, request: ApiRequest) -> Result<Value> {
        let inner = Arc::clone(&self.inner);
        let span = inner.span.clone();
        async move {
            let cancel = inner.session.lock().cancel.clone();
            let response = rest::make_request(&inner.http, request, &cancel).await?;
            inner.emit_unless_cancelled(RtviEvent::BotStarted(response.clone()), &cancel);
            Ok(response)
        }
        .instrument(span)
        .await
    }
}

// ============================================================================
// RtviClient - Messaging
// ============================================================================

impl RtviClient {
    /// Sends an application message (`client-message`).
    ///
    /// # Errors
    ///
    /// - [`Error::BotNotReady`] unless `ready`
    /// - [`Error::MessageTooLarge`] if the envelope exceeds `max_message_size`
    ///   (also reported through the `error` event)
    pub fn send_client_message(&self, msg_type: impl Into<String>, data: Value) -> Result<()> {
        let message = RtviMessage::client_message(msg_type, data);
        self.inner.send_checked("sendClientMessage", &message)
    }

    /// Sends an application request and waits for its `server-response`.
    ///
    /// Uses the configured `request_timeout` when `timeout` is `None`.
    ///
    /// # Errors
    ///
    /// - the errors of [`RtviClient::send_client_message`]
    /// - [`Error::Protocol`] on `error-response` or too many pending requests
    /// - [`Error::RequestTimeout`] if no answer arrives in time
    /// - [`Error::ConnectionClosed`] if the session ends first
    pub async fn send_client_request(
        &self,
        msg_type: impl Into<String>,
        data: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let inner = Arc::clone(&self.inner);
        let span = inner.span.clone();
        let message = RtviMessage::client_message(msg_type, data);
        let timeout = timeout.unwrap_or(inner.options.request_timeout);

        async move { inner.request(message, timeout).await }
            .instrument(span)
            .await
    }

    /// Sends user text to the bot (`send-text`).
    ///
    /// # Errors
    ///
    /// Same as [`RtviClient::send_client_message`].
    pub fn send_text(&self, content: impl Into<String>, options: &SendTextOptions) -> Result<()> {
        let message = RtviMessage::send_text(content, options);
        self.inner.send_checked("sendText", &message)
    }

    /// Asks the bot to leave (`disconnect-bot`).
    ///
    /// # Errors
    ///
    /// Same as [`RtviClient::send_client_message`].
    pub fn disconnect_bot(&self) -> Result<()> {
        self.inner
            .send_checked("disconnectBot", &RtviMessage::disconnect_bot())
    }

    /// Registers a handler for bot-initiated function calls.
    ///
    /// Replaces any handler registered under the same name.
    pub fn register_function_call_handler<F, Fut>(&self, function_name: impl Into<String>, handler: F)
    where
        F: Fn(FunctionCallParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Value>> + Send + 'static,
    {
        self.inner.functions.register(function_name, handler);
    }

    /// Removes a function-call handler.
    pub fn unregister_function_call_handler(&self, function_name: &str) -> bool {
        self.inner.functions.unregister(function_name)
    }

    /// Removes every function-call handler.
    pub fn unregister_all_function_call_handlers(&self) {
        self.inner.functions.clear();
    }
}

// ============================================================================
// RtviClient - Events
// ============================================================================

impl RtviClient {
    /// Subscribes to `event`. Handlers run after the typed callback.
    pub fn on<F>(&self, event: EventName, handler: F) -> SubscriptionId
    where
        F: Fn(&RtviEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on(event, handler)
    }

    /// Unsubscribes one handler.
    pub fn off(&self, event: EventName, id: SubscriptionId) -> bool {
        self.inner.bus.off(event, id)
    }

    /// Unsubscribes every handler of `event`.
    pub fn off_all(&self, event: EventName) {
        self.inner.bus.off_all(event);
    }
}

// ============================================================================
// RtviClient - State & Devices
// ============================================================================

impl RtviClient {
    /// Current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> TransportState {
        self.inner.session.lock().state
    }

    /// Returns `true` while `connected` or `ready`.
    #[inline]
    #[must_use]
    pub fn connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Returns `true` once the bot is ready.
    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == TransportState::Ready
    }

    /// Name of the owned transport.
    #[inline]
    #[must_use]
    pub fn transport_name(&self) -> &str {
        self.inner.transport.name()
    }

    /// Participants currently in the session.
    #[must_use]
    pub fn participants(&self) -> Vec<Participant> {
        self.inner
            .session
            .lock()
            .participants
            .values()
            .cloned()
            .collect()
    }

    /// The bot participant, once it joined.
    #[must_use]
    pub fn bot_participant(&self) -> Option<Participant> {
        let session = self.inner.session.lock();
        let id = session.bot_id.as_ref()?;
        session.participants.get(id).cloned()
    }

    /// Current media tracks.
    #[must_use]
    pub fn tracks(&self) -> Tracks {
        self.inner.transport.tracks()
    }

    /// Available microphones.
    ///
    /// # Errors
    ///
    /// Propagates the transport's enumeration error.
    pub async fn get_all_mics(&self) -> Result<Vec<MediaDeviceInfo>> {
        self.inner.transport.get_all_mics().await
    }

    /// Available cameras.
    ///
    /// # Errors
    ///
    /// Propagates the transport's enumeration error.
    pub async fn get_all_cams(&self) -> Result<Vec<MediaDeviceInfo>> {
        self.inner.transport.get_all_cams().await
    }

    /// Available speakers.
    ///
    /// # Errors
    ///
    /// Propagates the transport's enumeration error.
    pub async fn get_all_speakers(&self) -> Result<Vec<MediaDeviceInfo>> {
        self.inner.transport.get_all_speakers().await
    }

    #[must_use]
    pub fn selected_mic(&self) -> Option<MediaDeviceInfo> {
        self.inner.transport.selected_mic()
    }

    #[must_use]
    pub fn selected_cam(&self) -> Option<MediaDeviceInfo> {
        self.inner.transport.selected_cam()
    }

    #[must_use]
    pub fn selected_speaker(&self) -> Option<MediaDeviceInfo> {
        self.inner.transport.selected_speaker()
    }

    /// Selects a microphone.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] before device init, or the transport's error.
    pub fn update_mic(&self, device_id: &str) -> Result<()> {
        self.inner.require_active("updateMic")?;
        self.inner.transport.update_mic(device_id)
    }

    /// Selects a camera.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] before device init, or the transport's error.
    pub fn update_cam(&self, device_id: &str) -> Result<()> {
        self.inner.require_active("updateCam")?;
        self.inner.transport.update_cam(device_id)
    }

    /// Selects a speaker.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] before device init, or the transport's error.
    pub fn update_speaker(&self, device_id: &str) -> Result<()> {
        self.inner.require_active("updateSpeaker")?;
        self.inner.transport.update_speaker(device_id)
    }

    /// Enables or disables the microphone.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] before device init, or the transport's error.
    pub fn enable_mic(&self, enable: bool) -> Result<()> {
        self.inner.require_active("enableMic")?;
        self.inner.transport.enable_mic(enable)
    }

    /// Enables or disables the camera.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] before device init, or the transport's error.
    pub fn enable_cam(&self, enable: bool) -> Result<()> {
        self.inner.require_active("enableCam")?;
        self.inner.transport.enable_cam(enable)
    }

    /// Starts or stops screen sharing.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] before device init
    /// - [`Error::UnsupportedFeature`] if the transport cannot share
    pub fn enable_screen_share(&self, enable: bool) -> Result<()> {
        self.inner.require_active("enableScreenShare")?;
        self.inner.transport.enable_screen_share(enable)
    }

    #[inline]
    #[must_use]
    pub fn is_mic_enabled(&self) -> bool {
        self.inner.transport.is_mic_enabled()
    }

    #[inline]
    #[must_use]
    pub fn is_cam_enabled(&self) -> bool {
        self.inner.transport.is_cam_enabled()
    }

    #[inline]
    #[must_use]
    pub fn is_sharing_screen(&self) -> bool {
        self.inner.transport.is_sharing_screen()
    }
}

// ============================================================================
// ClientInner - State Machine
// ============================================================================

impl ClientInner {
    async fn init_devices(&self) -> Result<()> {
        let cancel = {
            let _emit = self.emit_lock.lock();
            let cancel = {
                let mut session = self.session.lock();
                match session.state {
                    TransportState::Disconnected | TransportState::Error => {
                        session.state = TransportState::Initializing;
                        session.last_error = None;
                        Some(session.cancel.clone())
                    }
                    TransportState::Initializing => None,
                    _ => return Ok(()),
                }
            };
            if cancel.is_some() {
                self.publish_state(TransportState::Initializing);
            }
            cancel
        };

        let Some(cancel) = cancel else {
            return self.observe("initDevices", TransportState::Initialized).await.map(|_| ());
        };

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::cancelled("initDevices")),
            result = self.transport.init_devices(self.options.media()) => result,
        };

        match result {
            Ok(()) => self.transition(
                &[TransportState::Initializing],
                TransportState::Initialized,
                &cancel,
                "initDevices",
            ),
            Err(e) => Err(self.fail(e, &cancel, "initDevices")),
        }
    }

    async fn connect(&self, params: Option<ConnectParams>) -> Result<BotReadyData> {
        // A disconnect replaces and cancels this token, so it spans device init too.
        let entry = self.session.lock().cancel.clone();
        let cancel = loop {
            match self.claim_connect(&entry)? {
                ConnectRole::Init => self.init_devices().await?,
                ConnectRole::Lead(cancel) => break cancel,
                ConnectRole::Observe => return self.observe("connect", TransportState::Ready).await,
                ConnectRole::Ready(data) => return Ok(data),
            }
        };

        info!("Connecting");

        match self.run_connect(params, &cancel).await {
            Ok(data) => {
                info!(version = %data.version, "Bot ready");
                Ok(data)
            }
            Err(Error::Cancelled { operation }) => {
                debug!(%operation, "Connect aborted");
                Err(Error::Cancelled { operation })
            }
            Err(e) => {
                if let Err(teardown) = self.transport.disconnect().await {
                    warn!(error = %teardown, "Transport teardown after failed connect");
                }
                Err(self.fail(e, &cancel, "connect"))
            }
        }
    }

    /// Decides this call's role and, when leading, enters `connecting`.
    ///
    /// Fails with `Cancelled` once `entry` was cancelled by a disconnect.
    fn claim_connect(&self, entry: &CancellationToken) -> Result<ConnectRole> {
        let _emit = self.emit_lock.lock();
        let cancel = {
            let mut session = self.session.lock();
            if entry.is_cancelled() {
                return Err(Error::cancelled("connect"));
            }
            match session.state {
                TransportState::Disconnected
                | TransportState::Error
                | TransportState::Initializing => return Ok(ConnectRole::Init),
                TransportState::Connecting | TransportState::Connected => {
                    return Ok(ConnectRole::Observe);
                }
                TransportState::Ready => {
                    let data = self.ready_tx.borrow().clone().unwrap_or_default();
                    return Ok(ConnectRole::Ready(data));
                }
                TransportState::Disconnecting => {
                    return Err(Error::invalid_state("connect", session.state));
                }
                TransportState::Initialized => {
                    session.state = TransportState::Connecting;
                    session.cancel.clone()
                }
            }
        };

        self.ready_tx.send_replace(None);
        self.publish_state(TransportState::Connecting);
        Ok(ConnectRole::Lead(cancel))
    }

    /// Steps of a leading connect after `connecting` was entered.
    async fn run_connect(
        &self,
        params: Option<ConnectParams>,
        cancel: &CancellationToken,
    ) -> Result<BotReadyData> {
        let transport_params = match params {
            None => None,
            Some(ConnectParams::Params(value)) => Some(value),
            Some(ConnectParams::Endpoint(request)) => {
                let response = rest::make_request(&self.http, request, cancel).await?;
                self.emit_unless_cancelled(RtviEvent::BotStarted(response.clone()), cancel);
                Some(response)
            }
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::cancelled("connect")),
            result = self.transport.connect(transport_params) => result?,
        }

        {
            let _emit = self.emit_lock.lock();
            self.transition(
                &[TransportState::Connecting],
                TransportState::Connected,
                cancel,
                "connect",
            )?;
            self.emit(RtviEvent::Connected);
        }

        self.transport.send_message(&RtviMessage::client_ready())?;
        debug!("client-ready sent, waiting for bot-ready");

        let data = self.wait_bot_ready(cancel).await?;

        let _emit = self.emit_lock.lock();
        self.transition(
            &[TransportState::Connected],
            TransportState::Ready,
            cancel,
            "connect",
        )?;
        self.emit(RtviEvent::BotReady(data.clone()));
        Ok(data)
    }

    /// Waits for the inbound `bot-ready`, bounded by `ready_timeout`.
    async fn wait_bot_ready(&self, cancel: &CancellationToken) -> Result<BotReadyData> {
        let mut ready_rx = self.ready_tx.subscribe();
        let wait = async {
            let ready = ready_rx
                .wait_for(Option::is_some)
                .await
                .map_err(|_| Error::ConnectionClosed)?;
            Ok::<_, Error>((*ready).clone().unwrap_or_default())
        };

        let wait = async {
            match self.options.ready_timeout {
                Some(limit) => tokio::time::timeout(limit, wait)
                    .await
                    .map_err(|_| Error::connection_timeout(limit.as_millis() as u64))?,
                None => wait.await,
            }
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::cancelled("connect")),
            result = wait => result,
        }
    }

    /// Waits for an attempt driven by another call.
    async fn observe(&self, operation: &str, target: TransportState) -> Result<BotReadyData> {
        let mut state_rx = self.state_tx.subscribe();
        let reached = |state: &TransportState| -> bool {
            match target {
                TransportState::Initialized => !matches!(state, TransportState::Initializing),
                _ => matches!(
                    state,
                    TransportState::Ready
                        | TransportState::Error
                        | TransportState::Disconnecting
                        | TransportState::Disconnected
                ),
            }
        };

        let state = *state_rx
            .wait_for(reached)
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        match state {
            TransportState::Error => {
                let reason = self
                    .session
                    .lock()
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string());
                Err(Error::connection(format!("{operation} failed: {reason}")))
            }
            TransportState::Disconnecting | TransportState::Disconnected => {
                Err(Error::cancelled(operation))
            }
            _ => Ok(self.ready_tx.borrow().clone().unwrap_or_default()),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let leading = {
            let _emit = self.emit_lock.lock();
            let leading = {
                let mut session = self.session.lock();
                match session.state {
                    TransportState::Disconnected => return Ok(()),
                    TransportState::Disconnecting => false,
                    _ => {
                        mem::replace(&mut session.cancel, CancellationToken::new()).cancel();
                        session.state = TransportState::Disconnecting;
                        true
                    }
                }
            };
            if leading {
                self.publish_state(TransportState::Disconnecting);
            }
            leading
        };

        if !leading {
            let mut state_rx = self.state_tx.subscribe();
            let _ = state_rx
                .wait_for(|s| *s == TransportState::Disconnected)
                .await;
            return Ok(());
        }

        info!("Disconnecting");
        self.fail_pending_requests();

        let result = self.transport.disconnect().await;
        if let Err(e) = &result {
            warn!(error = %e, "Transport disconnect failed");
        }

        self.finish_disconnect();
        result
    }

    /// Remote end closed the connection.
    fn handle_remote_disconnect(&self) {
        let _emit = self.emit_lock.lock();
        {
            let mut session = self.session.lock();
            if !session.state.is_connected() {
                debug!(state = %session.state, "Ignoring transport disconnect");
                return;
            }
            mem::replace(&mut session.cancel, CancellationToken::new()).cancel();
            session.state = TransportState::Disconnecting;
        }

        info!("Transport disconnected by remote");
        self.publish_state(TransportState::Disconnecting);
        self.fail_pending_requests();
        self.finish_disconnect();
    }

    fn finish_disconnect(&self) {
        let _emit = self.emit_lock.lock();
        {
            let mut session = self.session.lock();
            session.participants.clear();
            session.bot_id = None;
            session.state = TransportState::Disconnected;
        }
        self.functions.reset_claims();
        self.ready_tx.send_replace(None);

        self.publish_state(TransportState::Disconnected);
        self.emit(RtviEvent::Disconnected);
    }

    /// Moves `from → to` unless the attempt was cancelled.
    fn transition(
        &self,
        from: &[TransportState],
        to: TransportState,
        cancel: &CancellationToken,
        operation: &str,
    ) -> Result<()> {
        let _emit = self.emit_lock.lock();
        {
            let mut session = self.session.lock();
            if cancel.is_cancelled() {
                return Err(Error::cancelled(operation));
            }
            if !from.contains(&session.state) {
                return Err(Error::invalid_state(operation, session.state));
            }
            session.state = to;
        }
        self.publish_state(to);
        Ok(())
    }

    /// Moves to `error` and reports `err`, unless the attempt was cancelled.
    fn fail(&self, err: Error, cancel: &CancellationToken, operation: &str) -> Error {
        if !err.is_fatal() {
            return err;
        }

        let _emit = self.emit_lock.lock();
        let message = err.to_string();
        {
            let mut session = self.session.lock();
            if cancel.is_cancelled() {
                return Error::cancelled(operation);
            }
            session.state = TransportState::Error;
            session.last_error = Some(message.clone());
        }

        error!(%operation, error = %message, "Session failed");
        self.publish_state(TransportState::Error);
        self.emit(RtviEvent::Error(RtviMessage::error(message, true)));
        err
    }

    /// Publishes a state already written to the session.
    fn publish_state(&self, state: TransportState) {
        let _emit = self.emit_lock.lock();
        self.state_tx.send_replace(state);
        debug!(parent: &self.span, %state, "Transport state changed");
        self.emit(RtviEvent::TransportStateChanged(state));
    }

    fn require_active(&self, action: &str) -> Result<()> {
        let state = self.session.lock().state;
        if state.is_terminal() {
            return Err(Error::invalid_state(action, state));
        }
        Ok(())
    }
}

// ============================================================================
// ClientInner - Emission
// ============================================================================

impl ClientInner {
    /// Delivers `event` to its callback, then to bus handlers.
    fn emit(&self, event: RtviEvent) {
        let _emit = self.emit_lock.lock();
        let _enter = self.span.enter();
        trace!(event = %event.name(), "Emitting event");
        self.options.callbacks.invoke(&event);
        self.bus.emit(&event);
    }

    fn emit_unless_cancelled(&self, event: RtviEvent, cancel: &CancellationToken) {
        let _emit = self.emit_lock.lock();
        if !cancel.is_cancelled() {
            self.emit(event);
        }
    }

    /// Reports a non-fatal failure through the `error` event.
    fn report_error(&self, err: &Error) {
        self.emit(RtviEvent::Error(RtviMessage::error(err.to_string(), false)));
    }
}

// ============================================================================
// ClientInner - Transport Events
// ============================================================================

impl ClientInner {
    fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        let _emit = self.emit_lock.lock();

        match event {
            TransportEvent::Message(value) => self.handle_message(value),
            TransportEvent::Disconnected => self.handle_remote_disconnect(),

            TransportEvent::ParticipantJoined(participant) => {
                let became_bot = {
                    let mut session = self.session.lock();
                    session
                        .participants
                        .insert(participant.id.clone(), participant.clone());
                    let became_bot = !participant.local && session.bot_id.is_none();
                    if became_bot {
                        session.bot_id = Some(participant.id.clone());
                    }
                    became_bot
                };
                self.emit(RtviEvent::ParticipantConnected(participant.clone()));
                if became_bot {
                    self.emit(RtviEvent::BotConnected(participant));
                }
            }

            TransportEvent::ParticipantLeft(participant) => {
                let was_bot = {
                    let mut session = self.session.lock();
                    session.participants.remove(&participant.id);
                    let was_bot = session.bot_id.as_ref() == Some(&participant.id);
                    if was_bot {
                        session.bot_id = None;
                    }
                    was_bot
                };
                self.emit(RtviEvent::ParticipantLeft(participant.clone()));
                if was_bot {
                    self.emit(RtviEvent::BotDisconnected(participant));
                }
            }

            TransportEvent::BotConnected(participant) => {
                let is_new = {
                    let mut session = self.session.lock();
                    let is_new = session.bot_id.as_ref() != Some(&participant.id);
                    session.bot_id = Some(participant.id.clone());
                    session
                        .participants
                        .insert(participant.id.clone(), participant.clone());
                    is_new
                };
                if is_new {
                    self.emit(RtviEvent::BotConnected(participant));
                }
            }

            TransportEvent::BotDisconnected(participant) => {
                let was_bot = {
                    let mut session = self.session.lock();
                    let was_bot = session.bot_id.as_ref() == Some(&participant.id);
                    if was_bot {
                        session.bot_id = None;
                    }
                    was_bot
                };
                if was_bot {
                    self.emit(RtviEvent::BotDisconnected(participant));
                }
            }

            TransportEvent::UserStartedSpeaking => self.emit(RtviEvent::UserStartedSpeaking),
            TransportEvent::UserStoppedSpeaking => self.emit(RtviEvent::UserStoppedSpeaking),
            TransportEvent::BotStartedSpeaking => self.emit(RtviEvent::BotStartedSpeaking),
            TransportEvent::BotStoppedSpeaking => self.emit(RtviEvent::BotStoppedSpeaking),
            TransportEvent::TrackStarted(track) => self.emit(RtviEvent::TrackStarted(track)),
            TransportEvent::TrackStopped(track) => self.emit(RtviEvent::TrackStopped(track)),
            TransportEvent::ScreenTrackStarted(track) => {
                self.emit(RtviEvent::ScreenTrackStarted(track));
            }
            TransportEvent::ScreenTrackStopped(track) => {
                self.emit(RtviEvent::ScreenTrackStopped(track));
            }
            TransportEvent::ScreenShareError(message) => {
                self.emit(RtviEvent::ScreenShareError(message));
            }
            TransportEvent::LocalAudioLevel(level) => self.emit(RtviEvent::LocalAudioLevel(level)),
            TransportEvent::RemoteAudioLevel(level) => {
                self.emit(RtviEvent::RemoteAudioLevel(level));
            }
            TransportEvent::AvailableCamsUpdated(cams) => {
                self.emit(RtviEvent::AvailableCamsUpdated(cams));
            }
            TransportEvent::AvailableMicsUpdated(mics) => {
                self.emit(RtviEvent::AvailableMicsUpdated(mics));
            }
            TransportEvent::AvailableSpeakersUpdated(speakers) => {
                self.emit(RtviEvent::AvailableSpeakersUpdated(speakers));
            }
            TransportEvent::CamUpdated(cam) => self.emit(RtviEvent::CamUpdated(cam)),
            TransportEvent::MicUpdated(mic) => self.emit(RtviEvent::MicUpdated(mic)),
            TransportEvent::SpeakerUpdated(speaker) => self.emit(RtviEvent::SpeakerUpdated(speaker)),
            TransportEvent::DeviceError(err) => self.emit(RtviEvent::DeviceError(err)),
        }
    }
}

// ============================================================================
// ClientInner - Inbound Messages
// ============================================================================

impl ClientInner {
    fn handle_message(self: &Arc<Self>, value: Value) {
        if let Some(label) = value.get("label").and_then(Value::as_str)
            && label != RTVI_MESSAGE_LABEL
        {
            trace!(%label, "Ignoring message with foreign label");
            return;
        }

        let message = match RtviMessage::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Malformed inbound message");
                self.report_error(&e);
                return;
            }
        };

        trace!(id = %message.id, msg_type = %message.msg_type, "Inbound message");

        let Some(kind) = message.kind() else {
            debug!(msg_type = %message.msg_type, "Unknown message type");
            self.emit(RtviEvent::UnknownMessage(message));
            return;
        };

        match kind {
            MessageType::BotReady => {
                if let Some(data) = self.parse::<BotReadyData>(&message) {
                    debug!(version = %data.version, "bot-ready received");
                    self.ready_tx.send_replace(Some(data));
                }
            }

            MessageType::Error => self.emit(RtviEvent::Error(message)),

            MessageType::ErrorResponse => {
                let reason = message
                    .parse_data::<ErrorData>()
                    .map(|d| d.message)
                    .unwrap_or_default();
                self.resolve_pending(
                    &message.id,
                    Err(Error::protocol(format!("request rejected by server: {reason}"))),
                );
                self.emit(RtviEvent::MessageError(message));
            }

            MessageType::ServerResponse => {
                let body = message
                    .data
                    .get("d")
                    .cloned()
                    .unwrap_or_else(|| message.data.clone());
                self.resolve_pending(&message.id, Ok(body));
                self.emit(RtviEvent::ServerResponse(message.data));
            }

            MessageType::ServerMessage => self.emit(RtviEvent::ServerMessage(message.data)),
            MessageType::Metrics => self.emit(RtviEvent::Metrics(message.data)),

            MessageType::UserStartedSpeaking => self.emit(RtviEvent::UserStartedSpeaking),
            MessageType::UserStoppedSpeaking => self.emit(RtviEvent::UserStoppedSpeaking),
            MessageType::BotStartedSpeaking => self.emit(RtviEvent::BotStartedSpeaking),
            MessageType::BotStoppedSpeaking => self.emit(RtviEvent::BotStoppedSpeaking),
            MessageType::UserMuteStarted => self.emit(RtviEvent::UserMuteStarted),
            MessageType::UserMuteStopped => self.emit(RtviEvent::UserMuteStopped),

            MessageType::UserTranscription => {
                if let Some(data) = self.parse(&message) {
                    self.emit(RtviEvent::UserTranscript(data));
                }
            }
            MessageType::BotOutput => {
                if let Some(data) = self.parse(&message) {
                    self.emit(RtviEvent::BotOutput(data));
                }
            }
            MessageType::BotTranscription => {
                if let Some(data) = self.parse(&message) {
                    self.emit(RtviEvent::BotTranscript(data));
                }
            }
            MessageType::BotLlmText => {
                if let Some(data) = self.parse(&message) {
                    self.emit(RtviEvent::BotLlmText(data));
                }
            }
            MessageType::BotLlmStarted => self.emit(RtviEvent::BotLlmStarted),
            MessageType::BotLlmStopped => self.emit(RtviEvent::BotLlmStopped),
            MessageType::BotLlmSearchResponse => {
                self.emit(RtviEvent::BotLlmSearchResponse(message.data));
            }
            MessageType::BotTtsText => {
                if let Some(data) = self.parse(&message) {
                    self.emit(RtviEvent::BotTtsText(data));
                }
            }
            MessageType::BotTtsStarted => self.emit(RtviEvent::BotTtsStarted),
            MessageType::BotTtsStopped => self.emit(RtviEvent::BotTtsStopped),

            MessageType::LlmFunctionCall => {
                if let Some(legacy) = self.parse::<LlmFunctionCallData>(&message) {
                    let in_progress = LlmFunctionCallInProgressData::from(&legacy);
                    self.emit(RtviEvent::LlmFunctionCall(legacy));
                    self.emit(RtviEvent::LlmFunctionCallInProgress(in_progress.clone()));
                    self.dispatch_function_call(&in_progress);
                }
            }
            MessageType::LlmFunctionCallStarted => {
                if let Some(data) = self.parse(&message) {
                    self.emit(RtviEvent::LlmFunctionCallStarted(data));
                }
            }
            MessageType::LlmFunctionCallInProgress => {
                if let Some(data) = self.parse::<LlmFunctionCallInProgressData>(&message) {
                    self.emit(RtviEvent::LlmFunctionCallInProgress(data.clone()));
                    self.dispatch_function_call(&data);
                }
            }
            MessageType::LlmFunctionCallStopped => {
                if let Some(data) = self.parse(&message) {
                    self.emit(RtviEvent::LlmFunctionCallStopped(data));
                }
            }

            // Client-to-bot kinds are never expected inbound.
            MessageType::ClientReady
            | MessageType::ClientMessage
            | MessageType::DisconnectBot
            | MessageType::LlmFunctionCallResult
            | MessageType::SendText => self.emit(RtviEvent::UnknownMessage(message)),
        }
    }

    /// Parses a typed payload, reporting a protocol error on failure.
    fn parse<T: DeserializeOwned>(&self, message: &RtviMessage) -> Option<T> {
        match message.parse_data() {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(error = %e, "Invalid message payload");
                self.report_error(&e);
                None
            }
        }
    }

    /// Runs the registered handler at most once per tool call.
    fn dispatch_function_call(self: &Arc<Self>, data: &LlmFunctionCallInProgressData) {
        if data.tool_call_id.is_empty() {
            warn!(function = ?data.function_name, "Function call without tool_call_id");
            self.report_error(&Error::protocol("function call is missing tool_call_id"));
            return;
        }

        let Some(params) = FunctionCallParams::from_in_progress(data) else {
            debug!(tool_call_id = %data.tool_call_id, "Function call without name");
            return;
        };

        if !self.functions.claim(&params.tool_call_id) {
            debug!(tool_call_id = %params.tool_call_id, "Function call already dispatched");
            return;
        }

        let inner = Arc::clone(self);
        let task = async move {
            let outcome = AssertUnwindSafe(inner.functions.dispatch(params.clone()))
                .catch_unwind()
                .await;

            match outcome {
                Ok(DispatchOutcome::Handled(result)) => {
                    let result = result.unwrap_or_else(|| json!({}));
                    let message = RtviMessage::function_call_result(&params, result);
                    if let Err(e) = inner.send_function_call_result(&message) {
                        warn!(error = %e, function = %params.function_name, "Failed to send function call result");
                    }
                }
                Ok(DispatchOutcome::Unhandled) => {}
                Err(_) => {
                    error!(function = %params.function_name, "Function call handler panicked");
                }
            }
        };

        self.runtime.spawn(task.instrument(self.span.clone()));
    }
}

// ============================================================================
// ClientInner - Outbound Messages
// ============================================================================

impl ClientInner {
    /// Requires `ready`, then sends.
    fn send_checked(&self, action: &str, message: &RtviMessage) -> Result<()> {
        let state = self.session.lock().state;
        if state != TransportState::Ready {
            return Err(Error::bot_not_ready(action, state));
        }
        self.send_sized(message)
    }

    /// Results may race ahead of `ready`; a live connection is enough.
    fn send_function_call_result(&self, message: &RtviMessage) -> Result<()> {
        let state = self.session.lock().state;
        if !state.is_connected() {
            return Err(Error::bot_not_ready("llmFunctionCallResult", state));
        }
        self.send_sized(message)
    }

    /// Enforces the size ceiling, then sends.
    fn send_sized(&self, message: &RtviMessage) -> Result<()> {
        let size = message.byte_size()?;
        let max_size = self.options.max_message_size;
        if size > max_size {
            let err = Error::message_too_large(size, max_size);
            warn!(parent: &self.span, size, max_size, "Outbound message too large");
            self.report_error(&err);
            return Err(err);
        }

        trace!(parent: &self.span, id = %message.id, msg_type = %message.msg_type, size, "Sending message");
        self.transport.send_message(message)
    }

    async fn request(&self, message: RtviMessage, timeout: Duration) -> Result<Value> {
        let request_id = message.id.clone();
        let (response_tx, response_rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock();
            if pending.len() >= MAX_PENDING_REQUESTS {
                warn!(
                    pending = pending.len(),
                    max = MAX_PENDING_REQUESTS,
                    "Too many pending requests"
                );
                return Err(Error::protocol(format!(
                    "Too many pending requests: {}/{}",
                    pending.len(),
                    MAX_PENDING_REQUESTS
                )));
            }
            pending.insert(request_id.clone(), response_tx);
        }

        if let Err(e) = self.send_checked("sendClientRequest", &message) {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(Error::request_timeout(
                    request_id,
                    timeout.as_millis() as u64,
                ))
            }
        }
    }

    fn resolve_pending(&self, id: &MessageId, result: Result<Value>) {
        let tx = self.pending.lock().remove(id);
        match tx {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => trace!(%id, "Response without pending request"),
        }
    }

    /// Fails all pending requests with `ConnectionClosed`.
    fn fail_pending_requests(&self) {
        let pending: Vec<_> = self.pending.lock().drain().collect();
        let count = pending.len();

        for (_, tx) in pending {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }

        if count > 0 {
            debug!(count, "Failed pending requests on disconnect");
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.session.get_mut().cancel.cancel();
        self.transport.clear_event_handler();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::events::Callbacks;
    use crate::protocol::{
        LlmFunctionCallStartedData, LlmFunctionCallStoppedData, TranscriptData,
    };
    use crate::transport::{MemoryRemote, MemoryTransport};

    const WAIT: Duration = Duration::from_secs(5);

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn client_with(builder: ClientBuilder) -> (RtviClient, MemoryRemote) {
        init_tracing();
        let (transport, remote) = MemoryTransport::new();
        let client = builder.transport(transport).build().expect("build client");
        (client, remote)
    }

    fn client() -> (RtviClient, MemoryRemote) {
        client_with(RtviClient::builder())
    }

    fn record_states(client: &RtviClient) -> Arc<Mutex<Vec<TransportState>>> {
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        client.on(EventName::TransportStateChanged, move |event| {
            if let RtviEvent::TransportStateChanged(state) = event {
                sink.lock().push(*state);
            }
        });
        states
    }

    fn record(client: &RtviClient, name: EventName) -> Arc<Mutex<Vec<RtviEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        client.on(name, move |event| sink.lock().push(event.clone()));
        events
    }

    fn envelope(msg_type: &str, data: Value) -> Value {
        json!({ "id": Uuid::new_v4().to_string(), "label": "rtvi-ai", "type": msg_type, "data": data })
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition reached in time");
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_connect_and_disconnect_state_sequence() {
        let callback_states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&callback_states);
        let (client, remote) = client_with(
            RtviClient::builder().callbacks(
                Callbacks::new().on_transport_state_changed(move |s| sink.lock().push(*s)),
            ),
        );
        let states = record_states(&client);

        let ready = client.connect(None).await.expect("connect");
        assert_eq!(ready.version, crate::protocol::RTVI_PROTOCOL_VERSION);
        assert_eq!(client.state(), TransportState::Ready);
        assert_eq!(remote.sent_of(MessageType::ClientReady).len(), 1);

        client.disconnect().await.expect("disconnect");

        let expected = vec![
            TransportState::Initializing,
            TransportState::Initialized,
            TransportState::Connecting,
            TransportState::Connected,
            TransportState::Ready,
            TransportState::Disconnecting,
            TransportState::Disconnected,
        ];
        assert_eq!(*states.lock(), expected);
        assert_eq!(*callback_states.lock(), expected);
        assert_eq!(remote.disconnect_calls(), 1);
        assert!(client.participants().is_empty());
    }

    #[tokio::test]
    async fn test_connect_when_ready_is_noop() {
        let (client, remote) = client();
        client.connect(None).await.expect("connect");
        let states = record_states(&client);

        client.connect(None).await.expect("second connect");
        assert!(states.lock().is_empty());
        assert_eq!(remote.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_connect_observes_in_flight_attempt() {
        let (client, remote) = client();
        remote.delay_connect(Some(Duration::from_millis(50)));
        let states = record_states(&client);

        let (first, second) = tokio::join!(client.connect(None), client.connect(None));
        first.expect("first connect");
        second.expect("second connect");

        assert_eq!(remote.connect_calls(), 1);
        assert_eq!(remote.init_calls(), 1);
        assert_eq!(
            states
                .lock()
                .iter()
                .filter(|s| **s == TransportState::Ready)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_init_devices_is_idempotent() {
        let (client, remote) = client();
        let mics = record(&client, EventName::AvailableMicsUpdated);

        client.init_devices().await.expect("init");
        client.init_devices().await.expect("init again");

        assert_eq!(client.state(), TransportState::Initialized);
        assert_eq!(remote.init_calls(), 1);
        assert_eq!(mics.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_enters_error() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let (client, remote) = client_with(
            RtviClient::builder()
                .callbacks(Callbacks::new().on_error(move |m: &RtviMessage| sink.lock().push(m.clone()))),
        );
        remote.fail_connect(Some("room expired"));
        let states = record_states(&client);

        let err = client.connect(None).await.unwrap_err();
        assert!(matches!(err, Error::TransportStart { .. }));
        assert_eq!(client.state(), TransportState::Error);
        assert_eq!(states.lock().last(), Some(&TransportState::Error));

        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].data["fatal"], true);
        assert!(errors[0].get_string("message").contains("room expired"));
    }

    #[tokio::test]
    async fn test_connect_after_error_retries() {
        let (client, remote) = client();
        remote.fail_connect(Some("first attempt"));
        client.connect(None).await.unwrap_err();

        remote.fail_connect(None);
        client.connect(None).await.expect("retry");
        assert!(client.is_ready());
    }

    #[tokio::test]
    async fn test_ready_timeout() {
        let (client, remote) =
            client_with(RtviClient::builder().ready_timeout(Duration::from_millis(50)));
        remote.auto_ready(false);

        let err = client.connect(None).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionTimeout { timeout_ms: 50 }));
        assert_eq!(client.state(), TransportState::Error);
    }

    #[tokio::test]
    async fn test_disconnect_during_connect_converges() {
        let (client, remote) = client();
        remote.delay_connect(Some(Duration::from_millis(500)));
        let states = record_states(&client);

        let connecting = {
            let client = client.clone();
            tokio::spawn(async move { client.connect(None).await })
        };
        eventually(|| client.state() == TransportState::Connecting).await;

        client.disconnect().await.expect("disconnect");
        let result = connecting.await.expect("connect task");

        assert!(matches!(result, Err(Error::Cancelled { .. })));
        assert_eq!(client.state(), TransportState::Disconnected);

        let states = states.lock();
        assert_eq!(states.last(), Some(&TransportState::Disconnected));
        assert!(!states.contains(&TransportState::Connected));
        assert!(!states.contains(&TransportState::Error));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_after_device_init_is_not_undone() {
        for _ in 0..20 {
            let (client, _remote) = client();
            let states = record_states(&client);
            let disconnecting = Arc::new(Mutex::new(None));

            let handle = client.clone();
            let slot = Arc::clone(&disconnecting);
            client.on(EventName::TransportStateChanged, move |event| {
                if *event != RtviEvent::TransportStateChanged(TransportState::Initialized) {
                    return;
                }
                let mut slot = slot.lock();
                if slot.is_none() {
                    let client = handle.clone();
                    *slot = Some(tokio::spawn(async move { client.disconnect().await }));
                    // Let the disconnect queue behind the running connect.
                    std::thread::sleep(Duration::from_millis(2));
                }
            });

            let result = client.connect(None).await;
            let task = disconnecting.lock().take().expect("disconnect spawned");
            task.await.expect("disconnect task").expect("disconnect");

            assert!(matches!(result, Ok(_) | Err(Error::Cancelled { .. })));
            assert_eq!(client.state(), TransportState::Disconnected);

            let states = states.lock();
            let first_disconnect = states
                .iter()
                .position(|s| *s == TransportState::Disconnecting)
                .expect("disconnecting");
            assert!(!states[first_disconnect..].contains(&TransportState::Initializing));
            assert_eq!(states.last(), Some(&TransportState::Disconnected));
        }
    }

    #[tokio::test]
    async fn test_connect_cancelled_once_disconnected_after_init() {
        let (client, remote) = client();
        let entry = client.inner.session.lock().cancel.clone();
        client.init_devices().await.expect("init");
        client.disconnect().await.expect("disconnect");

        assert!(matches!(
            client.inner.claim_connect(&entry),
            Err(Error::Cancelled { .. })
        ));
        assert_eq!(client.state(), TransportState::Disconnected);
        assert_eq!(remote.connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_while_waiting_for_bot_ready() {
        let (client, remote) = client();
        remote.auto_ready(false);

        let connecting = {
            let client = client.clone();
            tokio::spawn(async move { client.connect(None).await })
        };
        eventually(|| client.state() == TransportState::Connected).await;

        client.disconnect().await.expect("disconnect");
        let result = connecting.await.expect("connect task");
        assert!(matches!(result, Err(Error::Cancelled { .. })));
        assert_eq!(client.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn test_remote_close() {
        let (client, remote) = client();
        client.connect(None).await.expect("connect");
        let states = record_states(&client);
        let disconnected = record(&client, EventName::Disconnected);

        remote.close();

        assert_eq!(
            *states.lock(),
            vec![TransportState::Disconnecting, TransportState::Disconnected]
        );
        assert_eq!(disconnected.lock().len(), 1);
        assert!(client.bot_participant().is_none());
    }

    // ------------------------------------------------------------------------
    // Participants
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_first_remote_participant_becomes_bot() {
        let (client, remote) = client();
        let bots = record(&client, EventName::BotConnected);
        let joined = record(&client, EventName::ParticipantConnected);

        client.connect(None).await.expect("connect");

        assert_eq!(joined.lock().len(), 2);
        assert_eq!(bots.lock().len(), 1);
        assert_eq!(client.bot_participant().map(|p| p.name), Some("Bot".to_string()));

        let left = record(&client, EventName::BotDisconnected);
        remote.emit(TransportEvent::ParticipantLeft(Participant::new("bot", "Bot", false)));
        assert_eq!(left.lock().len(), 1);
        assert!(client.bot_participant().is_none());
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_send_requires_ready() {
        let (client, _remote) = client();
        let err = client.send_client_message("t", json!({})).unwrap_err();
        assert!(matches!(err, Error::BotNotReady { .. }));
    }

    #[tokio::test]
    async fn test_small_message_never_reports_error() {
        let (client, remote) = client();
        let errors = record(&client, EventName::Error);
        client.connect(None).await.expect("connect");

        client
            .send_client_message("test", json!({ "data": "small payload" }))
            .expect("send");

        assert!(errors.lock().is_empty());
        let sent = remote.sent_of(MessageType::ClientMessage);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data["d"]["data"], "small payload");
    }

    #[tokio::test]
    async fn test_oversize_message_fails_and_reports() {
        let callback_errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&callback_errors);
        let (client, remote) = client_with(
            RtviClient::builder()
                .callbacks(Callbacks::new().on_error(move |m: &RtviMessage| sink.lock().push(m.clone()))),
        );
        let errors = record(&client, EventName::Error);
        client.connect(None).await.expect("connect");

        let err = client
            .send_client_message("test", json!({ "data": "x".repeat(70_000) }))
            .unwrap_err();

        assert!(matches!(err, Error::MessageTooLarge { max_size: 65_536, .. }));
        assert!(remote.sent_of(MessageType::ClientMessage).is_empty());

        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        let RtviEvent::Error(envelope) = &errors[0] else {
            panic!("expected error event");
        };
        assert_eq!(envelope.msg_type, "error");
        assert!(envelope.get_string("message").contains("65536"));
        assert_eq!(callback_errors.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_size_boundary_is_inclusive() {
        let data = json!({ "data": "x".repeat(50) });
        let exact = RtviMessage::client_message("test", data.clone())
            .byte_size()
            .expect("size");

        let (client, _remote) = client_with(RtviClient::builder().max_message_size(exact));
        client.connect(None).await.expect("connect");
        client
            .send_client_message("test", data.clone())
            .expect("exactly at limit");

        let (client, _remote) = client_with(RtviClient::builder().max_message_size(exact - 1));
        client.connect(None).await.expect("connect");
        let err = client.send_client_message("test", data).unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_send_text_and_disconnect_bot() {
        let (client, remote) = client();
        client.connect(None).await.expect("connect");

        let options = SendTextOptions {
            run_immediately: Some(true),
            audio_response: None,
        };
        client.send_text("hello", &options).expect("send text");
        client.disconnect_bot().expect("disconnect bot");

        let text = remote.sent_of(MessageType::SendText);
        assert_eq!(text[0].data["content"], "hello");
        assert_eq!(text[0].data["options"], json!({ "run_immediately": true }));
        assert_eq!(remote.sent_of(MessageType::DisconnectBot).len(), 1);
    }

    #[tokio::test]
    async fn test_client_request_resolves_with_server_response() {
        let (client, remote) = client();
        let responses = record(&client, EventName::ServerResponse);
        client.connect(None).await.expect("connect");

        let request = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send_client_request("get-config", json!({}), None)
                    .await
            })
        };
        eventually(|| !remote.sent_of(MessageType::ClientMessage).is_empty()).await;

        let id = remote.sent_of(MessageType::ClientMessage)[0].id.clone();
        remote.inject_message(json!({
            "id": id.as_str(),
            "label": "rtvi-ai",
            "type": "server-response",
            "data": { "t": "get-config", "d": { "voice": "alloy" } }
        }));

        let response = request.await.expect("task").expect("response");
        assert_eq!(response, json!({ "voice": "alloy" }));
        assert_eq!(responses.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_client_request_rejected_by_error_response() {
        let (client, remote) = client();
        client.connect(None).await.expect("connect");

        let request = {
            let client = client.clone();
            tokio::spawn(async move { client.send_client_request("bad", json!({}), None).await })
        };
        eventually(|| !remote.sent_of(MessageType::ClientMessage).is_empty()).await;

        let id = remote.sent_of(MessageType::ClientMessage)[0].id.clone();
        remote.inject_message(json!({
            "id": id.as_str(),
            "label": "rtvi-ai",
            "type": "error-response",
            "data": { "message": "unknown request" }
        }));

        let err = request.await.expect("task").unwrap_err();
        assert!(err.to_string().contains("unknown request"));
    }

    #[tokio::test]
    async fn test_client_request_timeout() {
        let (client, _remote) = client();
        client.connect(None).await.expect("connect");

        let err = client
            .send_client_request("slow", json!({}), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RequestTimeout { timeout_ms: 20, .. }));
    }

    #[tokio::test]
    async fn test_pending_request_fails_on_disconnect() {
        let (client, remote) = client();
        client.connect(None).await.expect("connect");

        let request = {
            let client = client.clone();
            tokio::spawn(async move { client.send_client_request("wait", json!({}), None).await })
        };
        eventually(|| !remote.sent_of(MessageType::ClientMessage).is_empty()).await;

        client.disconnect().await.expect("disconnect");
        let err = request.await.expect("task").unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_inbound_routing() {
        let (client, remote) = client();
        let server = record(&client, EventName::ServerMessage);
        let transcripts = record(&client, EventName::UserTranscript);
        let unknown = record(&client, EventName::UnknownMessage);
        let errors = record(&client, EventName::Error);
        client.connect(None).await.expect("connect");

        remote.inject_message(envelope("server-message", json!({ "hello": "world" })));
        remote.inject_message(envelope(
            "user-transcription",
            json!({ "text": "hi", "final": true, "timestamp": "t", "user_id": "u" }),
        ));
        remote.inject_message(envelope("future-kind", json!({})));
        remote.inject_message(envelope("error", json!({ "message": "boom", "fatal": false })));

        assert_eq!(*server.lock(), vec![RtviEvent::ServerMessage(json!({ "hello": "world" }))]);
        assert_eq!(
            *transcripts.lock(),
            vec![RtviEvent::UserTranscript(TranscriptData {
                text: "hi".into(),
                is_final: true,
                timestamp: "t".into(),
                user_id: "u".into(),
            })]
        );
        assert_eq!(unknown.lock().len(), 1);
        assert_eq!(errors.lock().len(), 1);
        assert!(client.is_ready(), "unknown kinds are never fatal");
    }

    #[tokio::test]
    async fn test_foreign_label_is_ignored() {
        let (client, remote) = client();
        let server = record(&client, EventName::ServerMessage);
        client.connect(None).await.expect("connect");

        remote.inject_message(json!({
            "id": "1", "label": "other-protocol", "type": "server-message", "data": {}
        }));
        assert!(server.lock().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_inbound_reports_protocol_error() {
        let (client, remote) = client();
        let errors = record(&client, EventName::Error);
        client.connect(None).await.expect("connect");

        remote.inject_message(json!({ "id": "1", "label": "rtvi-ai", "data": {} }));
        remote.inject_message(json!({ "id": "2", "label": "rtvi-ai", "type": "server-message" }));

        let errors = errors.lock();
        assert_eq!(errors.len(), 2);
        let RtviEvent::Error(envelope) = &errors[0] else {
            panic!("expected error event");
        };
        assert!(envelope.get_string("message").contains("Protocol error"));
        assert_eq!(client.state(), TransportState::Ready);
    }

    // ------------------------------------------------------------------------
    // Function Calls
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_function_call_dispatch_to_named_handler() {
        let (client, remote) = client();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let other_calls = Arc::new(Mutex::new(0));

        let sink = Arc::clone(&seen);
        client.register_function_call_handler("testHandler", move |call| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(call.arguments.clone());
                Some(json!({ "ok": true }))
            }
        });
        let other = Arc::clone(&other_calls);
        client.register_function_call_handler("otherHandler", move |_| {
            let other = Arc::clone(&other);
            async move {
                *other.lock() += 1;
                None
            }
        });
        client.connect(None).await.expect("connect");

        remote.inject_message(envelope(
            "llm-function-call-in-progress",
            json!({ "function_name": "testHandler", "tool_call_id": "call-1", "arguments": { "a": 1 } }),
        ));

        eventually(|| !remote.sent_of(MessageType::LlmFunctionCallResult).is_empty()).await;

        assert_eq!(*seen.lock(), vec![json!({ "a": 1 })]);
        assert_eq!(*other_calls.lock(), 0);

        let result = &remote.sent_of(MessageType::LlmFunctionCallResult)[0];
        assert_eq!(result.data["tool_call_id"], "call-1");
        assert_eq!(result.data["function_name"], "testHandler");
        assert_eq!(result.data["result"], json!({ "ok": true }));
    }

    #[tokio::test]
    async fn test_function_call_dispatched_at_most_once() {
        let (client, remote) = client();
        let calls = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&calls);
        client.register_function_call_handler("f", move |_| {
            let sink = Arc::clone(&sink);
            async move {
                *sink.lock() += 1;
                None
            }
        });
        client.connect(None).await.expect("connect");

        remote.inject_message(envelope(
            "llm-function-call",
            json!({ "function_name": "f", "tool_call_id": "same", "args": {} }),
        ));
        remote.inject_message(envelope(
            "llm-function-call-in-progress",
            json!({ "function_name": "f", "tool_call_id": "same", "arguments": {} }),
        ));

        eventually(|| !remote.sent_of(MessageType::LlmFunctionCallResult).is_empty()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*calls.lock(), 1);
        let results = remote.sent_of(MessageType::LlmFunctionCallResult);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].data["result"], json!({}));
    }

    #[tokio::test]
    async fn test_unhandled_function_call_sends_nothing() {
        let (client, remote) = client();
        let events = record(&client, EventName::LlmFunctionCallInProgress);
        client.connect(None).await.expect("connect");

        remote.inject_message(envelope(
            "llm-function-call-in-progress",
            json!({ "function_name": "nobody", "tool_call_id": "c", "arguments": {} }),
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(events.lock().len(), 1);
        assert!(remote.sent_of(MessageType::LlmFunctionCallResult).is_empty());
    }

    #[tokio::test]
    async fn test_function_call_without_tool_call_id_reports_error() {
        let (client, remote) = client();
        let calls = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&calls);
        client.register_function_call_handler("f", move |_| {
            let sink = Arc::clone(&sink);
            async move {
                *sink.lock() += 1;
                None
            }
        });
        let errors = record(&client, EventName::Error);
        client.connect(None).await.expect("connect");

        remote.inject_message(envelope(
            "llm-function-call",
            json!({ "function_name": "f", "args": {} }),
        ));
        remote.inject_message(envelope(
            "llm-function-call-in-progress",
            json!({ "function_name": "f", "tool_call_id": "", "arguments": {} }),
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*calls.lock(), 0);
        assert!(remote.sent_of(MessageType::LlmFunctionCallResult).is_empty());

        let errors = errors.lock();
        assert_eq!(errors.len(), 2);
        for event in errors.iter() {
            let RtviEvent::Error(message) = event else {
                panic!("expected error event");
            };
            assert!(message.get_string("message").contains("tool_call_id"));
            assert_eq!(message.data["fatal"], json!(false));
        }
        assert_eq!(client.state(), TransportState::Ready);
    }

    #[tokio::test]
    async fn test_function_call_variants_fire_callback_and_event() {
        let callbacks_seen = Arc::new(Mutex::new(Vec::new()));
        let (c1, c2, c3, c4) = (
            Arc::clone(&callbacks_seen),
            Arc::clone(&callbacks_seen),
            Arc::clone(&callbacks_seen),
            Arc::clone(&callbacks_seen),
        );
        let callbacks = Callbacks::new()
            .on_llm_function_call(move |d: &LlmFunctionCallData| {
                c1.lock().push(RtviEvent::LlmFunctionCall(d.clone()));
            })
            .on_llm_function_call_started(move |d: &LlmFunctionCallStartedData| {
                c2.lock().push(RtviEvent::LlmFunctionCallStarted(d.clone()));
            })
            .on_llm_function_call_in_progress(move |d: &LlmFunctionCallInProgressData| {
                c3.lock().push(RtviEvent::LlmFunctionCallInProgress(d.clone()));
            })
            .on_llm_function_call_stopped(move |d: &LlmFunctionCallStoppedData| {
                c4.lock().push(RtviEvent::LlmFunctionCallStopped(d.clone()));
            });

        let (client, remote) = client_with(RtviClient::builder().callbacks(callbacks));
        let events_seen = Arc::new(Mutex::new(Vec::new()));
        for name in [
            EventName::LlmFunctionCall,
            EventName::LlmFunctionCallStarted,
            EventName::LlmFunctionCallInProgress,
            EventName::LlmFunctionCallStopped,
        ] {
            let sink = Arc::clone(&events_seen);
            client.on(name, move |event| sink.lock().push(event.clone()));
        }
        client.connect(None).await.expect("connect");

        remote.inject_message(envelope(
            "llm-function-call-started",
            json!({ "function_name": "f" }),
        ));
        remote.inject_message(envelope(
            "llm-function-call-in-progress",
            json!({ "function_name": "f", "tool_call_id": "c1", "arguments": { "x": 1 } }),
        ));
        remote.inject_message(envelope(
            "llm-function-call-stopped",
            json!({ "function_name": "f", "tool_call_id": "c1", "cancelled": false, "result": 42 }),
        ));
        remote.inject_message(envelope(
            "llm-function-call",
            json!({ "function_name": "legacy", "tool_call_id": "c2", "args": { "y": 2 } }),
        ));

        let callbacks_seen = callbacks_seen.lock();
        let events_seen = events_seen.lock();
        assert_eq!(*callbacks_seen, *events_seen);

        let names: Vec<EventName> = events_seen.iter().map(RtviEvent::name).collect();
        assert_eq!(
            names,
            vec![
                EventName::LlmFunctionCallStarted,
                EventName::LlmFunctionCallInProgress,
                EventName::LlmFunctionCallStopped,
                EventName::LlmFunctionCall,
                EventName::LlmFunctionCallInProgress,
            ]
        );
        assert_eq!(
            events_seen[4],
            RtviEvent::LlmFunctionCallInProgress(LlmFunctionCallInProgressData {
                function_name: Some("legacy".into()),
                tool_call_id: "c2".into(),
                arguments: json!({ "y": 2 }),
            })
        );
    }

    // ------------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_device_toggles_require_initialization() {
        let (client, _remote) = client();
        assert!(matches!(
            client.enable_mic(false).unwrap_err(),
            Error::InvalidState { .. }
        ));
        assert!(matches!(
            client.enable_screen_share(true).unwrap_err(),
            Error::InvalidState { .. }
        ));

        client.init_devices().await.expect("init");
        client.enable_mic(false).expect("mic");
        assert!(!client.is_mic_enabled());
    }

    #[tokio::test]
    async fn test_device_updates_are_mirrored() {
        let (client, _remote) = client();
        let cams = record(&client, EventName::CamUpdated);
        let tracks = record(&client, EventName::TrackStarted);
        client.init_devices().await.expect("init");

        client.update_cam("cam-default").expect("update cam");
        client.enable_cam(true).expect("enable cam");

        assert_eq!(cams.lock().len(), 1);
        assert_eq!(tracks.lock().len(), 1);
        assert!(client.tracks().local.video.is_some());
        assert!(client.update_mic("missing").is_err());
    }

    // ------------------------------------------------------------------------
    // Params
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_inline_params_reach_transport() {
        let (client, remote) = client();
        client
            .connect(Some(ConnectParams::params(json!({ "room": "r1" }))))
            .await
            .expect("connect");
        assert_eq!(remote.last_params(), Some(json!({ "room": "r1" })));
    }

    #[tokio::test]
    async fn test_endpoint_params_are_fetched() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "room": "fetched" })))
            .expect(1)
            .mount(&server)
            .await;

        let (client, remote) = client();
        let started = record(&client, EventName::BotStarted);

        let request = ApiRequest::url(&format!("{}/start", server.uri())).expect("url");
        client
            .connect(Some(ConnectParams::endpoint(request)))
            .await
            .expect("connect");

        assert_eq!(remote.last_params(), Some(json!({ "room": "fetched" })));
        assert_eq!(*started.lock(), vec![RtviEvent::BotStarted(json!({ "room": "fetched" }))]);
    }

    #[tokio::test]
    async fn test_disconnect_during_endpoint_fetch() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "room": "late" }))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let (client, remote) = client();
        let started = record(&client, EventName::BotStarted);
        let errors = record(&client, EventName::Error);

        let request = ApiRequest::url(&server.uri()).expect("url");
        let connecting = {
            let client = client.clone();
            tokio::spawn(async move { client.connect(Some(ConnectParams::endpoint(request))).await })
        };
        eventually(|| client.state() == TransportState::Connecting).await;

        client.disconnect().await.expect("disconnect");
        let result = tokio::time::timeout(WAIT, connecting)
            .await
            .expect("fetch aborted")
            .expect("connect task");

        assert!(matches!(result, Err(Error::Cancelled { .. })));
        assert_eq!(client.state(), TransportState::Disconnected);
        assert!(started.lock().is_empty());
        assert!(errors.lock().is_empty());
        assert_eq!(remote.connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_endpoint_failure_enters_error_with_status() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({ "detail": "no capacity" })))
            .mount(&server)
            .await;

        let (client, remote) = client();
        let request = ApiRequest::url(&server.uri()).expect("url");
        let err = client
            .connect(Some(ConnectParams::endpoint(request)))
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(503));
        assert_eq!(client.state(), TransportState::Error);
        assert_eq!(remote.connect_calls(), 0);
    }
}
