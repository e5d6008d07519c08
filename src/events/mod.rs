//! Canonical client events.
//!
//! Everything the client reports to the embedding application is one
//! [`RtviEvent`]. Each event is delivered twice, in this order:
//!
//! 1. the matching typed callback in [`Callbacks`], if set;
//! 2. every handler subscribed on the [`EventBus`] for its [`EventName`].
//!
//! # Event Groups
//!
//! | Group | Events |
//! |-------|--------|
//! | Local connection | `connected`, `disconnected`, `transportStateChanged` |
//! | Bot lifecycle | `botStarted`, `botConnected`, `botReady`, `botDisconnected` |
//! | Messaging | `error`, `serverMessage`, `serverResponse`, `messageError`, `unknownMessage` |
//! | Speech | `userStartedSpeaking`, `userTranscript`, `botOutput`, `botTtsText`, ... |
//! | Function calls | `llmFunctionCall`, `llmFunctionCallStarted`, `llmFunctionCallInProgress`, `llmFunctionCallStopped` |
//! | Participants & media | `participantConnected`, `trackStarted`, `localAudioLevel`, ... |
//! | Devices | `availableMicsUpdated`, `micUpdated`, `deviceError`, ... |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `bus` | Ordered subscription registry |
//! | `callbacks` | One typed callback per event |

// ============================================================================
// Submodules
// ============================================================================

/// Ordered subscription registry.
pub mod bus;

/// Typed per-event callbacks.
pub mod callbacks;

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use serde_json::Value;
use tracing::error;

use crate::protocol::{
    BotLlmTextData, BotOutputData, BotReadyData, BotTtsTextData, LlmFunctionCallData,
    LlmFunctionCallInProgressData, LlmFunctionCallStartedData, LlmFunctionCallStoppedData,
    RtviMessage, TranscriptData,
};
use crate::transport::{
    DeviceError, MediaDeviceInfo, Participant, RemoteAudioLevel, TrackEvent, TransportState,
};

// ============================================================================
// Re-exports
// ============================================================================

pub use bus::{EventBus, EventHandler};
pub use callbacks::{Callback, Callbacks, UnitCallback};

// ============================================================================
// EventName
// ============================================================================

/// Subscription key, one per [`RtviEvent`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    Connected,
    Disconnected,
    TransportStateChanged,
    BotStarted,
    BotConnected,
    BotReady,
    BotDisconnected,
    Error,
    ServerMessage,
    ServerResponse,
    MessageError,
    UnknownMessage,
    Metrics,
    BotStartedSpeaking,
    BotStoppedSpeaking,
    UserStartedSpeaking,
    UserStoppedSpeaking,
    UserMuteStarted,
    UserMuteStopped,
    UserTranscript,
    BotOutput,
    BotTranscript,
    BotLlmText,
    BotLlmStarted,
    BotLlmStopped,
    LlmFunctionCall,
    LlmFunctionCallStarted,
    LlmFunctionCallInProgress,
    LlmFunctionCallStopped,
    BotLlmSearchResponse,
    BotTtsText,
    BotTtsStarted,
    BotTtsStopped,
    ParticipantConnected,
    ParticipantLeft,
    TrackStarted,
    TrackStopped,
    ScreenTrackStarted,
    ScreenTrackStopped,
    ScreenShareError,
    LocalAudioLevel,
    RemoteAudioLevel,
    AvailableCamsUpdated,
    AvailableMicsUpdated,
    AvailableSpeakersUpdated,
    CamUpdated,
    MicUpdated,
    SpeakerUpdated,
    DeviceError,
}

impl EventName {
    /// Returns the camelCase event name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::TransportStateChanged => "transportStateChanged",
            Self::BotStarted => "botStarted",
            Self::BotConnected => "botConnected",
            Self::BotReady => "botReady",
            Self::BotDisconnected => "botDisconnected",
            Self::Error => "error",
            Self::ServerMessage => "serverMessage",
            Self::ServerResponse => "serverResponse",
            Self::MessageError => "messageError",
            Self::UnknownMessage => "unknownMessage",
            Self::Metrics => "metrics",
            Self::BotStartedSpeaking => "botStartedSpeaking",
            Self::BotStoppedSpeaking => "botStoppedSpeaking",
            Self::UserStartedSpeaking => "userStartedSpeaking",
            Self::UserStoppedSpeaking => "userStoppedSpeaking",
            Self::UserMuteStarted => "userMuteStarted",
            Self::UserMuteStopped => "userMuteStopped",
            Self::UserTranscript => "userTranscript",
            Self::BotOutput => "botOutput",
            Self::BotTranscript => "botTranscript",
            Self::BotLlmText => "botLlmText",
            Self::BotLlmStarted => "botLlmStarted",
            Self::BotLlmStopped => "botLlmStopped",
            Self::LlmFunctionCall => "llmFunctionCall",
            Self::LlmFunctionCallStarted => "llmFunctionCallStarted",
            Self::LlmFunctionCallInProgress => "llmFunctionCallInProgress",
            Self::LlmFunctionCallStopped => "llmFunctionCallStopped",
            Self::BotLlmSearchResponse => "botLlmSearchResponse",
            Self::BotTtsText => "botTtsText",
            Self::BotTtsStarted => "botTtsStarted",
            Self::BotTtsStopped => "botTtsStopped",
            Self::ParticipantConnected => "participantConnected",
            Self::ParticipantLeft => "participantLeft",
            Self::TrackStarted => "trackStarted",
            Self::TrackStopped => "trackStopped",
            Self::ScreenTrackStarted => "screenTrackStarted",
            Self::ScreenTrackStopped => "screenTrackStopped",
            Self::ScreenShareError => "screenShareError",
            Self::LocalAudioLevel => "localAudioLevel",
            Self::RemoteAudioLevel => "remoteAudioLevel",
            Self::AvailableCamsUpdated => "availableCamsUpdated",
            Self::AvailableMicsUpdated => "availableMicsUpdated",
            Self::AvailableSpeakersUpdated => "availableSpeakersUpdated",
            Self::CamUpdated => "camUpdated",
            Self::MicUpdated => "micUpdated",
            Self::SpeakerUpdated => "speakerUpdated",
            Self::DeviceError => "deviceError",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// RtviEvent
// ============================================================================

/// A canonical client event with its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RtviEvent {
    // Local connection
    /// Transport connected.
    Connected,
    /// Session ended.
    Disconnected,
    /// Lifecycle state changed.
    TransportStateChanged(TransportState),

    // Bot lifecycle
    /// Connection params fetched from the start endpoint.
    BotStarted(Value),
    /// Bot joined the session.
    BotConnected(Participant),
    /// Bot is ready for messages.
    BotReady(BotReadyData),
    /// Bot left the session.
    BotDisconnected(Participant),

    // Messaging
    /// Server-side or local error, as an `error` envelope.
    Error(RtviMessage),
    /// Unsolicited application message.
    ServerMessage(Value),
    /// Answer to a client request.
    ServerResponse(Value),
    /// Error answering a client request.
    MessageError(RtviMessage),
    /// Inbound message of a kind this client does not know.
    UnknownMessage(RtviMessage),
    /// Pipeline metrics.
    Metrics(Value),

    // Speech activity
    BotStartedSpeaking,
    BotStoppedSpeaking,
    UserStartedSpeaking,
    UserStoppedSpeaking,
    UserMuteStarted,
    UserMuteStopped,

    // Transcripts & LLM
    UserTranscript(TranscriptData),
    BotOutput(BotOutputData),
    /// Deprecated in favor of [`RtviEvent::BotOutput`].
    BotTranscript(BotLlmTextData),
    BotLlmText(BotLlmTextData),
    BotLlmStarted,
    BotLlmStopped,
    /// Deprecated in favor of [`RtviEvent::LlmFunctionCallInProgress`].
    LlmFunctionCall(LlmFunctionCallData),
    LlmFunctionCallStarted(LlmFunctionCallStartedData),
    LlmFunctionCallInProgress(LlmFunctionCallInProgressData),
    LlmFunctionCallStopped(LlmFunctionCallStoppedData),
    BotLlmSearchResponse(Value),
    BotTtsText(BotTtsTextData),
    BotTtsStarted,
    BotTtsStopped,

    // Participants & media
    ParticipantConnected(Participant),
    ParticipantLeft(Participant),
    TrackStarted(TrackEvent),
    TrackStopped(TrackEvent),
    ScreenTrackStarted(TrackEvent),
    ScreenTrackStopped(TrackEvent),
    ScreenShareError(String),
    LocalAudioLevel(f32),
    RemoteAudioLevel(RemoteAudioLevel),

    // Devices
    AvailableCamsUpdated(Vec<MediaDeviceInfo>),
    AvailableMicsUpdated(Vec<MediaDeviceInfo>),
    AvailableSpeakersUpdated(Vec<MediaDeviceInfo>),
    CamUpdated(MediaDeviceInfo),
    MicUpdated(MediaDeviceInfo),
    SpeakerUpdated(MediaDeviceInfo),
    DeviceError(DeviceError),
}

impl RtviEvent {
    /// Returns the subscription key of this event.
    #[must_use]
    pub const fn name(&self) -> EventName {
        match self {
            Self::Connected => EventName::Connected,
            Self::Disconnected => EventName::Disconnected,
            Self::TransportStateChanged(_) => EventName::TransportStateChanged,
            Self::BotStarted(_) => EventName::BotStarted,
            Self::BotConnected(_) => EventName::BotConnected,
            Self::BotReady(_) => EventName::BotReady,
            Self::BotDisconnected(_) => EventName::BotDisconnected,
            Self::Error(_) => EventName::Error,
            Self::ServerMessage(_) => EventName::ServerMessage,
            Self::ServerResponse(_) => EventName::ServerResponse,
            Self::MessageError(_) => EventName::MessageError,
            Self::UnknownMessage(_) => EventName::UnknownMessage,
            Self::Metrics(_) => EventName::Metrics,
            Self::BotStartedSpeaking => EventName::BotStartedSpeaking,
            Self::BotStoppedSpeaking => EventName::BotStoppedSpeaking,
            Self::UserStartedSpeaking => EventName::UserStartedSpeaking,
            Self::UserStoppedSpeaking => EventName::UserStoppedSpeaking,
            Self::UserMuteStarted => EventName::UserMuteStarted,
            Self::UserMuteStopped => EventName::UserMuteStopped,
            Self::UserTranscript(_) => EventName::UserTranscript,
            Self::BotOutput(_) => EventName::BotOutput,
            Self::BotTranscript(_) => EventName::BotTranscript,
            Self::BotLlmText(_) => EventName::BotLlmText,
            Self::BotLlmStarted => EventName::BotLlmStarted,
            Self::BotLlmStopped => EventName::BotLlmStopped,
            Self::LlmFunctionCall(_) => EventName::LlmFunctionCall,
            Self::LlmFunctionCallStarted(_) => EventName::LlmFunctionCallStarted,
            Self::LlmFunctionCallInProgress(_) => EventName::LlmFunctionCallInProgress,
            Self::LlmFunctionCallStopped(_) => EventName::LlmFunctionCallStopped,
            Self::BotLlmSearchResponse(_) => EventName::BotLlmSearchResponse,
            Self::BotTtsText(_) => EventName::BotTtsText,
            Self::BotTtsStarted => EventName::BotTtsStarted,
            Self::BotTtsStopped => EventName::BotTtsStopped,
            Self::ParticipantConnected(_) => EventName::ParticipantConnected,
            Self::ParticipantLeft(_) => EventName::ParticipantLeft,
            Self::TrackStarted(_) => EventName::TrackStarted,
            Self::TrackStopped(_) => EventName::TrackStopped,
            Self::ScreenTrackStarted(_) => EventName::ScreenTrackStarted,
            Self::ScreenTrackStopped(_) => EventName::ScreenTrackStopped,
            Self::ScreenShareError(_) => EventName::ScreenShareError,
            Self::LocalAudioLevel(_) => EventName::LocalAudioLevel,
            Self::RemoteAudioLevel(_) => EventName::RemoteAudioLevel,
            Self::AvailableCamsUpdated(_) => EventName::AvailableCamsUpdated,
            Self::AvailableMicsUpdated(_) => EventName::AvailableMicsUpdated,
            Self::AvailableSpeakersUpdated(_) => EventName::AvailableSpeakersUpdated,
            Self::CamUpdated(_) => EventName::CamUpdated,
            Self::MicUpdated(_) => EventName::MicUpdated,
            Self::SpeakerUpdated(_) => EventName::SpeakerUpdated,
            Self::DeviceError(_) => EventName::DeviceError,
        }
    }
}

// ============================================================================
// Handler Isolation
// ============================================================================

/// Runs one application handler, containing any panic it raises.
///
/// Returns `false` if the handler panicked.
pub(crate) fn run_guarded(event: EventName, handler: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(handler)) {
        Ok(()) => true,
        Err(payload) => {
            error!(event = %event, panic = panic_message(&*payload), "Event handler panicked");
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_are_camel_case() {
        assert_eq!(EventName::TransportStateChanged.as_str(), "transportStateChanged");
        assert_eq!(EventName::LlmFunctionCallInProgress.to_string(), "llmFunctionCallInProgress");
        assert_eq!(EventName::BotLlmSearchResponse.as_str(), "botLlmSearchResponse");
    }

    #[test]
    fn test_event_name_matches_variant() {
        let event = RtviEvent::TransportStateChanged(TransportState::Ready);
        assert_eq!(event.name(), EventName::TransportStateChanged);
        assert_eq!(RtviEvent::BotTtsStopped.name(), EventName::BotTtsStopped);
        assert_eq!(
            RtviEvent::UnknownMessage(RtviMessage::new("future", Value::Null)).name(),
            EventName::UnknownMessage
        );
    }

    #[test]
    fn test_run_guarded_contains_panic() {
        assert!(run_guarded(EventName::Error, || {}));
        assert!(!run_guarded(EventName::Error, || panic!("handler failure")));
    }
}
