//! In-process loopback transport.
//!
//! [`MemoryTransport`] satisfies the full transport contract without any
//! network or media. It is split in two halves:
//!
//! - [`MemoryTransport`] is moved into the client, which owns it exclusively.
//! - [`MemoryRemote`] stays with the caller and plays the bot side: it
//!   injects inbound messages and events, inspects what was sent, and
//!   scripts connect failures or delays.
//!
//! # Example
//!
//! ```ignore
//! use rtvi_client::{RtviClient, transport::MemoryTransport};
//!
//! let (transport, remote) = MemoryTransport::new();
//! let client = RtviClient::builder().transport(transport).build()?;
//!
//! client.connect(None).await?;          // remote answers client-ready with bot-ready
//! remote.inject_message(serde_json::json!({
//!     "id": "1", "label": "rtvi-ai", "type": "server-message", "data": { "hello": "world" }
//! }));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::{MessageType, RTVI_PROTOCOL_VERSION, RtviMessage};

use super::{
    MediaDeviceInfo, MediaDeviceKind, MediaOptions, MediaTrack, Participant, ParticipantTracks,
    TrackEvent, TrackKind, Tracks, Transport, TransportEvent, TransportEventHandler,
};

// ============================================================================
// Constants
// ============================================================================

/// Name reported by the transport.
const TRANSPORT_NAME: &str = "MemoryTransport";

// ============================================================================
// Types
// ============================================================================

/// Mutable state shared by both halves.
struct MemoryState {
    connected: bool,
    mic_enabled: bool,
    cam_enabled: bool,
    sharing_screen: bool,
    auto_ready: bool,
    join_participants: bool,
    connect_error: Option<String>,
    connect_delay: Option<Duration>,
    last_params: Option<Value>,
    init_calls: usize,
    connect_calls: usize,
    disconnect_calls: usize,
    selected_mic: Option<MediaDeviceInfo>,
    selected_cam: Option<MediaDeviceInfo>,
    selected_speaker: Option<MediaDeviceInfo>,
    sent: Vec<RtviMessage>,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            connected: false,
            mic_enabled: false,
            cam_enabled: false,
            sharing_screen: false,
            auto_ready: true,
            join_participants: true,
            connect_error: None,
            connect_delay: None,
            last_params: None,
            init_calls: 0,
            connect_calls: 0,
            disconnect_calls: 0,
            selected_mic: None,
            selected_cam: None,
            selected_speaker: None,
            sent: Vec::new(),
        }
    }
}

/// State shared between [`MemoryTransport`] and [`MemoryRemote`].
struct MemoryShared {
    state: Mutex<MemoryState>,
    handler: Mutex<Option<TransportEventHandler>>,
}

impl MemoryShared {
    /// Invokes the installed handler without holding any lock.
    fn emit(&self, event: TransportEvent) {
        let handler = self.handler.lock().clone();
        match handler {
            Some(handler) => handler(event),
            None => trace!(?event, "No handler installed, dropping event"),
        }
    }
}

// ============================================================================
// Devices
// ============================================================================

fn local_participant() -> Participant {
    Participant::new("local", "You", true)
}

fn bot_participant() -> Participant {
    Participant::new("bot", "Bot", false)
}

fn mics() -> Vec<MediaDeviceInfo> {
    vec![MediaDeviceInfo::new("mic-default", MediaDeviceKind::AudioInput, "Default Microphone")]
}

fn cams() -> Vec<MediaDeviceInfo> {
    vec![MediaDeviceInfo::new("cam-default", MediaDeviceKind::VideoInput, "Default Camera")]
}

fn speakers() -> Vec<MediaDeviceInfo> {
    vec![MediaDeviceInfo::new("speaker-default", MediaDeviceKind::AudioOutput, "Default Speaker")]
}

fn find_device(devices: Vec<MediaDeviceInfo>, device_id: &str) -> Result<MediaDeviceInfo> {
    devices
        .into_iter()
        .find(|d| d.device_id == device_id)
        .ok_or_else(|| Error::invalid_argument(format!("Unknown device: {device_id}")))
}

// ============================================================================
// MemoryTransport
// ============================================================================

/// Loopback transport half owned by the client.
pub struct MemoryTransport {
    shared: Arc<MemoryShared>,
}

impl MemoryTransport {
    /// Creates a transport and its remote control.
    #[must_use]
    pub fn new() -> (Self, MemoryRemote) {
        let shared = Arc::new(MemoryShared {
            state: Mutex::new(MemoryState::default()),
            handler: Mutex::new(None),
        });

        (
            Self {
                shared: Arc::clone(&shared),
            },
            MemoryRemote { shared },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        TRANSPORT_NAME
    }

    fn set_event_handler(&self, handler: TransportEventHandler) {
        *self.shared.handler.lock() = Some(handler);
    }

    fn clear_event_handler(&self) {
        *self.shared.handler.lock() = None;
    }

    async fn init_devices(&self, options: MediaOptions) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            state.init_calls += 1;
            state.mic_enabled = options.enable_mic;
            state.cam_enabled = options.enable_cam;
            state.selected_mic = mics().into_iter().next();
            state.selected_cam = cams().into_iter().next();
            state.selected_speaker = speakers().into_iter().next();
        }

        self.shared.emit(TransportEvent::AvailableMicsUpdated(mics()));
        self.shared.emit(TransportEvent::AvailableCamsUpdated(cams()));
        self.shared.emit(TransportEvent::AvailableSpeakersUpdated(speakers()));

        debug!(?options, "Memory devices initialized");
        Ok(())
    }

    async fn connect(&self, params: Option<Value>) -> Result<()> {
        let delay = {
            let mut state = self.shared.state.lock();
            state.connect_calls += 1;
            state.last_params = params;
            state.connect_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let join = {
            let mut state = self.shared.state.lock();
            if let Some(message) = state.connect_error.clone() {
                return Err(Error::transport_start(message));
            }
            state.connected = true;
            state.join_participants
        };

        if join {
            self.shared
                .emit(TransportEvent::ParticipantJoined(local_participant()));
            self.shared
                .emit(TransportEvent::ParticipantJoined(bot_participant()));
        }

        debug!("Memory transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.disconnect_calls += 1;
        state.connected = false;
        state.sharing_screen = false;
        debug!("Memory transport disconnected");
        Ok(())
    }

    fn send_message(&self, message: &RtviMessage) -> Result<()> {
        let answer_ready = {
            let mut state = self.shared.state.lock();
            if !state.connected {
                return Err(Error::ConnectionClosed);
            }
            state.sent.push(message.clone());
            state.auto_ready && message.kind() == Some(MessageType::ClientReady)
        };

        trace!(id = %message.id, msg_type = %message.msg_type, "Memory transport sent message");

        if answer_ready {
            let ready = RtviMessage::of(
                MessageType::BotReady,
                json!({ "version": RTVI_PROTOCOL_VERSION, "about": { "name": "memory-bot" } }),
            );
            self.shared.emit(TransportEvent::Message(serde_json::to_value(&ready)?));
        }

        Ok(())
    }

    fn tracks(&self) -> Tracks {
        let state = self.shared.state.lock();
        let local = ParticipantTracks {
            audio: state
                .mic_enabled
                .then(|| MediaTrack::new("local-audio", TrackKind::Audio)),
            video: state
                .cam_enabled
                .then(|| MediaTrack::new("local-video", TrackKind::Video)),
            screen_audio: None,
            screen_video: state
                .sharing_screen
                .then(|| MediaTrack::new("local-screen", TrackKind::Video)),
        };
        let bot = state.connected.then(|| ParticipantTracks {
            audio: Some(MediaTrack::new("bot-audio", TrackKind::Audio)),
            ..ParticipantTracks::default()
        });
        Tracks { local, bot }
    }

    async fn get_all_mics(&self) -> Result<Vec<MediaDeviceInfo>> {
        Ok(mics())
    }

    async fn get_all_cams(&self) -> Result<Vec<MediaDeviceInfo>> {
        Ok(cams())
    }

    async fn get_all_speakers(&self) -> Result<Vec<MediaDeviceInfo>> {
        Ok(speakers())
    }

    fn update_mic(&self, device_id: &str) -> Result<()> {
        let device = find_device(mics(), device_id)?;
        self.shared.state.lock().selected_mic = Some(device.clone());
        self.shared.emit(TransportEvent::MicUpdated(device));
        Ok(())
    }

    fn update_cam(&self, device_id: &str) -> Result<()> {
        let device = find_device(cams(), device_id)?;
        self.shared.state.lock().selected_cam = Some(device.clone());
        self.shared.emit(TransportEvent::CamUpdated(device));
        Ok(())
    }

    fn update_speaker(&self, device_id: &str) -> Result<()> {
        let device = find_device(speakers(), device_id)?;
        self.shared.state.lock().selected_speaker = Some(device.clone());
        self.shared.emit(TransportEvent::SpeakerUpdated(device));
        Ok(())
    }

    fn selected_mic(&self) -> Option<MediaDeviceInfo> {
        self.shared.state.lock().selected_mic.clone()
    }

    fn selected_cam(&self) -> Option<MediaDeviceInfo> {
        self.shared.state.lock().selected_cam.clone()
    }

    fn selected_speaker(&self) -> Option<MediaDeviceInfo> {
        self.shared.state.lock().selected_speaker.clone()
    }

    fn enable_mic(&self, enable: bool) -> Result<()> {
        self.shared.state.lock().mic_enabled = enable;
        Ok(())
    }

    fn is_mic_enabled(&self) -> bool {
        self.shared.state.lock().mic_enabled
    }

    fn enable_cam(&self, enable: bool) -> Result<()> {
        let changed = {
            let mut state = self.shared.state.lock();
            let changed = state.cam_enabled != enable;
            state.cam_enabled = enable;
            changed
        };

        if changed {
            let event = TrackEvent {
                track: MediaTrack::new("local-video", TrackKind::Video),
                participant: Some(local_participant()),
            };
            self.shared.emit(if enable {
                TransportEvent::TrackStarted(event)
            } else {
                TransportEvent::TrackStopped(event)
            });
        }
        Ok(())
    }

    fn is_cam_enabled(&self) -> bool {
        self.shared.state.lock().cam_enabled
    }

    fn enable_screen_share(&self, enable: bool) -> Result<()> {
        let changed = {
            let mut state = self.shared.state.lock();
            let changed = state.sharing_screen != enable;
            state.sharing_screen = enable;
            changed
        };

        if changed {
            let event = TrackEvent {
                track: MediaTrack::new("local-screen", TrackKind::Video),
                participant: Some(local_participant()),
            };
            self.shared.emit(if enable {
                TransportEvent::ScreenTrackStarted(event)
            } else {
                TransportEvent::ScreenTrackStopped(event)
            });
        }
        Ok(())
    }

    fn is_sharing_screen(&self) -> bool {
        self.shared.state.lock().sharing_screen
    }
}

// ============================================================================
// MemoryRemote
// ============================================================================

/// Bot-side control of a [`MemoryTransport`].
#[derive(Clone)]
pub struct MemoryRemote {
    shared: Arc<MemoryShared>,
}

impl MemoryRemote {
    /// Delivers a raw inbound message to the client.
    pub fn inject_message(&self, message: Value) {
        self.shared.emit(TransportEvent::Message(message));
    }

    /// Delivers an arbitrary transport event to the client.
    pub fn emit(&self, event: TransportEvent) {
        self.shared.emit(event);
    }

    /// Simulates the remote end closing the connection.
    pub fn close(&self) {
        self.shared.state.lock().connected = false;
        self.shared.emit(TransportEvent::Disconnected);
    }

    /// Returns every envelope sent so far.
    #[must_use]
    pub fn sent_messages(&self) -> Vec<RtviMessage> {
        self.shared.state.lock().sent.clone()
    }

    /// Returns sent envelopes of one kind.
    #[must_use]
    pub fn sent_of(&self, kind: MessageType) -> Vec<RtviMessage> {
        self.shared
            .state
            .lock()
            .sent
            .iter()
            .filter(|m| m.kind() == Some(kind))
            .cloned()
            .collect()
    }

    /// Forgets the envelopes sent so far.
    pub fn clear_sent(&self) {
        self.shared.state.lock().sent.clear();
    }

    /// Makes subsequent connects fail with a transport start error.
    pub fn fail_connect(&self, message: Option<&str>) {
        self.shared.state.lock().connect_error = message.map(str::to_string);
    }

    /// Delays subsequent connects.
    pub fn delay_connect(&self, delay: Option<Duration>) {
        self.shared.state.lock().connect_delay = delay;
    }

    /// Whether `client-ready` is answered with `bot-ready` (default: yes).
    pub fn auto_ready(&self, enabled: bool) {
        self.shared.state.lock().auto_ready = enabled;
    }

    /// Whether connecting announces local and bot participants (default: yes).
    pub fn join_participants(&self, enabled: bool) {
        self.shared.state.lock().join_participants = enabled;
    }

    /// Whether the transport is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().connected
    }

    /// Parameters of the last connect.
    #[must_use]
    pub fn last_params(&self) -> Option<Value> {
        self.shared.state.lock().last_params.clone()
    }

    /// Number of `init_devices` calls.
    #[must_use]
    pub fn init_calls(&self) -> usize {
        self.shared.state.lock().init_calls
    }

    /// Number of `connect` calls.
    #[must_use]
    pub fn connect_calls(&self) -> usize {
        self.shared.state.lock().connect_calls
    }

    /// Number of `disconnect` calls.
    #[must_use]
    pub fn disconnect_calls(&self) -> usize {
        self.shared.state.lock().disconnect_calls
    }

    /// Whether a handler is installed.
    #[must_use]
    pub fn has_handler(&self) -> bool {
        self.shared.handler.lock().is_some()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn collecting_handler() -> (TransportEventHandler, Arc<Mutex<Vec<TransportEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let handler: TransportEventHandler = Arc::new(move |event| sink.lock().push(event));
        (handler, events)
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (transport, _remote) = MemoryTransport::new();
        let err = transport
            .send_message(&RtviMessage::disconnect_bot())
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_client_ready_answered_with_bot_ready() {
        let (transport, remote) = MemoryTransport::new();
        let (handler, events) = collecting_handler();
        transport.set_event_handler(handler);

        transport.connect(None).await.expect("connect");
        transport
            .send_message(&RtviMessage::client_ready())
            .expect("send");

        assert_eq!(remote.sent_of(MessageType::ClientReady).len(), 1);
        let events = events.lock();
        let ready = events.iter().find_map(|e| match e {
            TransportEvent::Message(v) => Some(v.clone()),
            _ => None,
        });
        assert_eq!(ready.expect("bot-ready")["type"], "bot-ready");
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let (transport, remote) = MemoryTransport::new();
        remote.fail_connect(Some("room expired"));

        let err = transport.connect(None).await.unwrap_err();
        assert!(matches!(err, Error::TransportStart { .. }));
        assert!(!remote.is_connected());
    }

    #[tokio::test]
    async fn test_init_devices_announces_devices() {
        let (transport, remote) = MemoryTransport::new();
        let (handler, events) = collecting_handler();
        transport.set_event_handler(handler);

        transport
            .init_devices(MediaOptions::default())
            .await
            .expect("init");

        assert_eq!(remote.init_calls(), 1);
        assert!(transport.is_mic_enabled());
        assert_eq!(events.lock().len(), 3);
        assert_eq!(
            transport.selected_mic().map(|d| d.device_id),
            Some("mic-default".to_string())
        );
    }

    #[tokio::test]
    async fn test_update_unknown_device() {
        let (transport, _remote) = MemoryTransport::new();
        let err = transport.update_mic("nope").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_screen_share_emits_track_events() {
        let (transport, _remote) = MemoryTransport::new();
        let (handler, events) = collecting_handler();
        transport.set_event_handler(handler);

        transport.enable_screen_share(true).expect("share");
        transport.enable_screen_share(true).expect("share again");
        transport.enable_screen_share(false).expect("stop");

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], TransportEvent::ScreenTrackStarted(_)));
        assert!(matches!(events[1], TransportEvent::ScreenTrackStopped(_)));
    }

    #[tokio::test]
    async fn test_tracks_follow_toggles() {
        let (transport, _remote) = MemoryTransport::new();
        transport.enable_mic(true).expect("mic");
        let tracks = transport.tracks();
        assert!(tracks.local.audio.is_some());
        assert!(tracks.local.video.is_none());
        assert!(tracks.bot.is_none());
    }
}
