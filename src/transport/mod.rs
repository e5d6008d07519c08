//! Transport contract and providers.
//!
//! The client never assumes a specific transport's internals. Everything
//! it needs is expressed by the [`Transport`] trait; providers push
//! [`TransportEvent`]s through the handler installed by the client.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐                              ┌─────────────────┐
//! │  RtviClient     │   connect / send / devices   │  Transport      │
//! │                 │─────────────────────────────►│  (provider)     │
//! │  state machine  │                              │                 │
//! │  event bus      │◄─────────────────────────────│  media + data   │
//! │                 │      TransportEvent          │  channel        │
//! └─────────────────┘                              └─────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `memory` | In-process loopback provider |
//! | `websocket` | JSON envelopes over a WebSocket |

// ============================================================================
// Submodules
// ============================================================================

/// In-process loopback transport.
pub mod memory;

/// WebSocket transport.
pub mod websocket;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::ParticipantId;
use crate::protocol::RtviMessage;

// ============================================================================
// Re-exports
// ============================================================================

pub use memory::{MemoryRemote, MemoryTransport};
pub use websocket::WebSocketTransport;

// ============================================================================
// TransportState
// ============================================================================

/// Canonical session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    /// No session.
    #[default]
    Disconnected,
    /// Acquiring media devices.
    Initializing,
    /// Devices ready, not connected.
    Initialized,
    /// Resolving params and connecting the transport.
    Connecting,
    /// Transport connected, waiting for the bot.
    Connected,
    /// Bot ready.
    Ready,
    /// Tearing down.
    Disconnecting,
    /// Unrecoverable failure.
    Error,
}

impl TransportState {
    /// Returns the wire/event name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ready => "ready",
            Self::Disconnecting => "disconnecting",
            Self::Error => "error",
        }
    }

    /// Returns `true` for `disconnected` and `error`.
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }

    /// Returns `true` while the transport holds a live connection.
    #[inline]
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Ready)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Participants & Tracks
// ============================================================================

/// A session participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    /// Transport-assigned ID.
    pub id: ParticipantId,
    /// Display name.
    pub name: String,
    /// `true` for the participant on this client.
    pub local: bool,
}

impl Participant {
    /// Creates a participant.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, local: bool) -> Self {
        Self {
            id: ParticipantId::new(id),
            name: name.into(),
            local,
        }
    }
}

/// Media track kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Audio track.
    Audio,
    /// Video track.
    Video,
}

/// Opaque handle to a media track owned by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaTrack {
    /// Transport-assigned track ID.
    pub id: String,
    /// Track kind.
    pub kind: TrackKind,
}

impl MediaTrack {
    /// Creates a track handle.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// Tracks of one participant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantTracks {
    /// Microphone audio.
    pub audio: Option<MediaTrack>,
    /// Camera video.
    pub video: Option<MediaTrack>,
    /// Screen share audio.
    pub screen_audio: Option<MediaTrack>,
    /// Screen share video.
    pub screen_video: Option<MediaTrack>,
}

/// Current local and bot tracks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tracks {
    /// Local participant tracks.
    pub local: ParticipantTracks,
    /// Bot tracks, once the bot joined.
    pub bot: Option<ParticipantTracks>,
}

/// Track start/stop notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackEvent {
    /// The track.
    pub track: MediaTrack,
    /// Owning participant, when known.
    pub participant: Option<Participant>,
}

/// Audio level of a remote participant.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteAudioLevel {
    /// Level in `0.0..=1.0`.
    pub level: f32,
    /// Speaking participant.
    pub participant: Participant,
}

// ============================================================================
// Devices
// ============================================================================

/// Media device kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaDeviceKind {
    /// Microphone.
    AudioInput,
    /// Speaker.
    AudioOutput,
    /// Camera.
    VideoInput,
}

/// A media device as enumerated by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaDeviceInfo {
    /// Device ID.
    pub device_id: String,
    /// Group ID (devices on the same hardware).
    pub group_id: String,
    /// Device kind.
    pub kind: MediaDeviceKind,
    /// Human-readable label.
    pub label: String,
}

impl MediaDeviceInfo {
    /// Creates a device description.
    #[must_use]
    pub fn new(device_id: impl Into<String>, kind: MediaDeviceKind, label: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            group_id: String::new(),
            kind,
            label: label.into(),
        }
    }
}

/// Device failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceErrorKind {
    /// Device busy in another application.
    InUse,
    /// Permission denied.
    Permissions,
    /// Device not found.
    NotFound,
    /// Constraints cannot be satisfied.
    Constraints,
    /// Anything else.
    Unknown,
}

/// Device failure reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceError {
    /// Failure category.
    pub kind: DeviceErrorKind,
    /// Affected device kinds.
    pub devices: Vec<MediaDeviceKind>,
    /// Details.
    pub message: String,
}

/// Local media defaults applied on device initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaOptions {
    /// Start with the microphone enabled.
    pub enable_mic: bool,
    /// Start with the camera enabled.
    pub enable_cam: bool,
}

impl Default for MediaOptions {
    fn default() -> Self {
        Self {
            enable_mic: true,
            enable_cam: false,
        }
    }
}

// ============================================================================
// TransportEvent
// ============================================================================

/// Signals a transport pushes to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Remote end closed the connection.
    Disconnected,
    /// A participant joined.
    ParticipantJoined(Participant),
    /// A participant left.
    ParticipantLeft(Participant),
    /// Explicit bot-connected signal.
    BotConnected(Participant),
    /// Explicit bot-disconnected signal.
    BotDisconnected(Participant),
    /// Local voice activity detected by the transport.
    UserStartedSpeaking,
    /// Local voice activity ended.
    UserStoppedSpeaking,
    /// Bot audio activity detected by the transport.
    BotStartedSpeaking,
    /// Bot audio activity ended.
    BotStoppedSpeaking,
    /// A media track started.
    TrackStarted(TrackEvent),
    /// A media track stopped.
    TrackStopped(TrackEvent),
    /// A screen share track started.
    ScreenTrackStarted(TrackEvent),
    /// A screen share track stopped.
    ScreenTrackStopped(TrackEvent),
    /// Screen share failed.
    ScreenShareError(String),
    /// Local audio level.
    LocalAudioLevel(f32),
    /// Remote audio level.
    RemoteAudioLevel(RemoteAudioLevel),
    /// Camera list changed.
    AvailableCamsUpdated(Vec<MediaDeviceInfo>),
    /// Microphone list changed.
    AvailableMicsUpdated(Vec<MediaDeviceInfo>),
    /// Speaker list changed.
    AvailableSpeakersUpdated(Vec<MediaDeviceInfo>),
    /// Selected camera changed.
    CamUpdated(MediaDeviceInfo),
    /// Selected microphone changed.
    MicUpdated(MediaDeviceInfo),
    /// Selected speaker changed.
    SpeakerUpdated(MediaDeviceInfo),
    /// Device failure.
    DeviceError(DeviceError),
    /// Inbound protocol message, not yet validated.
    Message(Value),
}

/// Handler installed by the client to receive transport events.
///
/// Transports must not hold internal locks while invoking it.
pub type TransportEventHandler = Arc<dyn Fn(TransportEvent) + Send + Sync>;

// ============================================================================
// Transport
// ============================================================================

/// Capability set every transport provider implements.
///
/// All methods take `&self`; providers use interior mutability so a
/// disconnect can run while a connect is suspended.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Provider name, used in logs and unsupported-feature errors.
    fn name(&self) -> &str;

    /// Installs the event handler, replacing any previous one.
    fn set_event_handler(&self, handler: TransportEventHandler);

    /// Removes the event handler.
    fn clear_event_handler(&self);

    /// Enumerates devices and acquires local media.
    async fn init_devices(&self, options: MediaOptions) -> Result<()>;

    /// Connects using provider-specific parameters.
    ///
    /// # Errors
    ///
    /// Failure to connect must be reported, never swallowed.
    async fn connect(&self, params: Option<Value>) -> Result<()>;

    /// Closes the connection. Must succeed when not connected.
    async fn disconnect(&self) -> Result<()>;

    /// Sends one envelope.
    fn send_message(&self, message: &RtviMessage) -> Result<()>;

    /// Current media tracks.
    fn tracks(&self) -> Tracks {
        Tracks::default()
    }

    /// Available microphones.
    async fn get_all_mics(&self) -> Result<Vec<MediaDeviceInfo>> {
        Ok(Vec::new())
    }

    /// Available cameras.
    async fn get_all_cams(&self) -> Result<Vec<MediaDeviceInfo>> {
        Ok(Vec::new())
    }

    /// Available speakers.
    async fn get_all_speakers(&self) -> Result<Vec<MediaDeviceInfo>> {
        Ok(Vec::new())
    }

    /// Selects a microphone.
    fn update_mic(&self, _device_id: &str) -> Result<()> {
        Err(Error::unsupported_feature("updateMic", self.name()))
    }

    /// Selects a camera.
    fn update_cam(&self, _device_id: &str) -> Result<()> {
        Err(Error::unsupported_feature("updateCam", self.name()))
    }

    /// Selects a speaker.
    fn update_speaker(&self, _device_id: &str) -> Result<()> {
        Err(Error::unsupported_feature("updateSpeaker", self.name()))
    }

    /// Selected microphone.
    fn selected_mic(&self) -> Option<MediaDeviceInfo> {
        None
    }

    /// Selected camera.
    fn selected_cam(&self) -> Option<MediaDeviceInfo> {
        None
    }

    /// Selected speaker.
    fn selected_speaker(&self) -> Option<MediaDeviceInfo> {
        None
    }

    /// Enables or disables the microphone.
    fn enable_mic(&self, enable: bool) -> Result<()>;

    /// Whether the microphone is enabled.
    fn is_mic_enabled(&self) -> bool;

    /// Enables or disables the camera.
    fn enable_cam(&self, enable: bool) -> Result<()>;

    /// Whether the camera is enabled.
    fn is_cam_enabled(&self) -> bool;

    /// Starts or stops screen sharing.
    fn enable_screen_share(&self, _enable: bool) -> Result<()> {
        Err(Error::unsupported_feature("screenShare", self.name()))
    }

    /// Whether the screen is being shared.
    fn is_sharing_screen(&self) -> bool {
        false
    }
}

// ============================================================================
// Tests
// ============================================================================
