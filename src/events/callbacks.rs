//! Typed per-event callbacks.
//!
//! [`Callbacks`] holds at most one callback per canonical event and is set
//! up once, through [`ClientBuilder::callbacks`](crate::ClientBuilder::callbacks).
//! Callbacks fire before bus handlers, for every occurrence.
//!
//! ```ignore
//! let callbacks = Callbacks::new()
//!     .on_bot_ready(|data| println!("bot ready: {}", data.version))
//!     .on_user_transcript(|t| if t.is_final { println!("user: {}", t.text) });
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::protocol::{
    BotLlmTextData, BotOutputData, BotReadyData, BotTtsTextData, LlmFunctionCallData,
    LlmFunctionCallInProgressData, LlmFunctionCallStartedData, LlmFunctionCallStoppedData,
    RtviMessage, TranscriptData,
};
use crate::transport::{
    DeviceError, MediaDeviceInfo, Participant, RemoteAudioLevel, TrackEvent, TransportState,
};

use super::{EventName, RtviEvent, run_guarded};

// ============================================================================
// Types
// ============================================================================

/// Callback receiving an event payload.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Callback for events without payload.
pub type UnitCallback = Arc<dyn Fn() + Send + Sync>;

// ============================================================================
// Callbacks
// ============================================================================

/// One optional callback per canonical event.
#[derive(Clone, Default)]
pub struct Callbacks {
    connected: Option<UnitCallback>,
    disconnected: Option<UnitCallback>,
    transport_state_changed: Option<Callback<TransportState>>,

    bot_started: Option<Callback<Value>>,
    bot_connected: Option<Callback<Participant>>,
    bot_ready: Option<Callback<BotReadyData>>,
    bot_disconnected: Option<Callback<Participant>>,

    error: Option<Callback<RtviMessage>>,
    server_message: Option<Callback<Value>>,
    server_response: Option<Callback<Value>>,
    message_error: Option<Callback<RtviMessage>>,
    unknown_message: Option<Callback<RtviMessage>>,
    metrics: Option<Callback<Value>>,

    bot_started_speaking: Option<UnitCallback>,
    bot_stopped_speaking: Option<UnitCallback>,
    user_started_speaking: Option<UnitCallback>,
    user_stopped_speaking: Option<UnitCallback>,
    user_mute_started: Option<UnitCallback>,
    user_mute_stopped: Option<UnitCallback>,

    user_transcript: Option<Callback<TranscriptData>>,
    bot_output: Option<Callback<BotOutputData>>,
    bot_transcript: Option<Callback<BotLlmTextData>>,
    bot_llm_text: Option<Callback<BotLlmTextData>>,
    bot_llm_started: Option<UnitCallback>,
    bot_llm_stopped: Option<UnitCallback>,
    llm_function_call: Option<Callback<LlmFunctionCallData>>,
    llm_function_call_started: Option<Callback<LlmFunctionCallStartedData>>,
    llm_function_call_in_progress: Option<Callback<LlmFunctionCallInProgressData>>,
    llm_function_call_stopped: Option<Callback<LlmFunctionCallStoppedData>>,
    bot_llm_search_response: Option<Callback<Value>>,
    bot_tts_text: Option<Callback<BotTtsTextData>>,
    bot_tts_started: Option<UnitCallback>,
    bot_tts_stopped: Option<UnitCallback>,

    participant_connected: Option<Callback<Participant>>,
    participant_left: Option<Callback<Participant>>,
    track_started: Option<Callback<TrackEvent>>,
    track_stopped: Option<Callback<TrackEvent>>,
    screen_track_started: Option<Callback<TrackEvent>>,
    screen_track_stopped: Option<Callback<TrackEvent>>,
    screen_share_error: Option<Callback<String>>,
    local_audio_level: Option<Callback<f32>>,
    remote_audio_level: Option<Callback<RemoteAudioLevel>>,

    available_cams_updated: Option<Callback<Vec<MediaDeviceInfo>>>,
    available_mics_updated: Option<Callback<Vec<MediaDeviceInfo>>>,
    available_speakers_updated: Option<Callback<Vec<MediaDeviceInfo>>>,
    cam_updated: Option<Callback<MediaDeviceInfo>>,
    mic_updated: Option<Callback<MediaDeviceInfo>>,
    speaker_updated: Option<Callback<MediaDeviceInfo>>,
    device_error: Option<Callback<DeviceError>>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks").finish_non_exhaustive()
    }
}

fn unit(f: impl Fn() + Send + Sync + 'static) -> Option<UnitCallback> {
    Some(Arc::new(f))
}

fn typed<T>(f: impl Fn(&T) + Send + Sync + 'static) -> Option<Callback<T>> {
    Some(Arc::new(f))
}

// ============================================================================
// Callbacks - Setters
// ============================================================================

impl Callbacks {
    /// Creates an empty callback set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------------
    // Local connection
    // ------------------------------------------------------------------------

    /// Transport connected.
    #[must_use]
    pub fn on_connected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.connected = unit(f);
        self
    }

    /// Session ended.
    #[must_use]
    pub fn on_disconnected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.disconnected = unit(f);
        self
    }

    /// Every lifecycle transition.
    #[must_use]
    pub fn on_transport_state_changed(
        mut self,
        f: impl Fn(&TransportState) + Send + Sync + 'static,
    ) -> Self {
        self.transport_state_changed = typed(f);
        self
    }

    // ------------------------------------------------------------------------
    // Bot lifecycle
    // ------------------------------------------------------------------------

    /// Start endpoint answered.
    #[must_use]
    pub fn on_bot_started(mut self, f: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.bot_started = typed(f);
        self
    }

    /// Bot joined.
    #[must_use]
    pub fn on_bot_connected(mut self, f: impl Fn(&Participant) + Send + Sync + 'static) -> Self {
        self.bot_connected = typed(f);
        self
    }

    /// Bot ready for messages.
    #[must_use]
    pub fn on_bot_ready(mut self, f: impl Fn(&BotReadyData) + Send + Sync + 'static) -> Self {
        self.bot_ready = typed(f);
        self
    }

    /// Bot left.
    #[must_use]
    pub fn on_bot_disconnected(
        mut self,
        f: impl Fn(&Participant) + Send + Sync + 'static,
    ) -> Self {
        self.bot_disconnected = typed(f);
        self
    }

    // ------------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------------

    /// Error envelope, local or from the server.
    #[must_use]
    pub fn on_error(mut self, f: impl Fn(&RtviMessage) + Send + Sync + 'static) -> Self {
        self.error = typed(f);
        self
    }

    /// Unsolicited server message.
    #[must_use]
    pub fn on_server_message(mut self, f: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.server_message = typed(f);
        self
    }

    /// Answer to a client request.
    #[must_use]
    pub fn on_server_response(mut self, f: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.server_response = typed(f);
        self
    }

    /// Error answering a client request.
    #[must_use]
    pub fn on_message_error(mut self, f: impl Fn(&RtviMessage) + Send + Sync + 'static) -> Self {
        self.message_error = typed(f);
        self
    }

    /// Inbound message of an unknown kind.
    #[must_use]
    pub fn on_unknown_message(
        mut self,
        f: impl Fn(&RtviMessage) + Send + Sync + 'static,
    ) -> Self {
        self.unknown_message = typed(f);
        self
    }

    /// Pipeline metrics.
    #[must_use]
    pub fn on_metrics(mut self, f: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.metrics = typed(f);
        self
    }

    // ------------------------------------------------------------------------
    // Speech activity
    // ------------------------------------------------------------------------

    #[must_use]
    pub fn on_bot_started_speaking(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.bot_started_speaking = unit(f);
        self
    }

    #[must_use]
    pub fn on_bot_stopped_speaking(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.bot_stopped_speaking = unit(f);
        self
    }

    #[must_use]
    pub fn on_user_started_speaking(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.user_started_speaking = unit(f);
        self
    }

    #[must_use]
    pub fn on_user_stopped_speaking(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.user_stopped_speaking = unit(f);
        self
    }

    #[must_use]
    pub fn on_user_mute_started(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.user_mute_started = unit(f);
        self
    }

    #[must_use]
    pub fn on_user_mute_stopped(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.user_mute_stopped = unit(f);
        self
    }

    // ------------------------------------------------------------------------
    // Transcripts & LLM
    // ------------------------------------------------------------------------

    #[must_use]
    pub fn on_user_transcript(
        mut self,
        f: impl Fn(&TranscriptData) + Send + Sync + 'static,
    ) -> Self {
        self.user_transcript = typed(f);
        self
    }

    #[must_use]
    pub fn on_bot_output(mut self, f: impl Fn(&BotOutputData) + Send + Sync + 'static) -> Self {
        self.bot_output = typed(f);
        self
    }

    /// Deprecated server event, prefer [`Callbacks::on_bot_output`].
    #[must_use]
    pub fn on_bot_transcript(
        mut self,
        f: impl Fn(&BotLlmTextData) + Send + Sync + 'static,
    ) -> Self {
        self.bot_transcript = typed(f);
        self
    }

    #[must_use]
    pub fn on_bot_llm_text(mut self, f: impl Fn(&BotLlmTextData) + Send + Sync + 'static) -> Self {
        self.bot_llm_text = typed(f);
        self
    }

    #[must_use]
    pub fn on_bot_llm_started(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.bot_llm_started = unit(f);
        self
    }

    #[must_use]
    pub fn on_bot_llm_stopped(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.bot_llm_stopped = unit(f);
        self
    }

    /// Deprecated combined function call, prefer
    /// [`Callbacks::on_llm_function_call_in_progress`].
    #[must_use]
    pub fn on_llm_function_call(
        mut self,
        f: impl Fn(&LlmFunctionCallData) + Send + Sync + 'static,
    ) -> Self {
        self.llm_function_call = typed(f);
        self
    }

    #[must_use]
    pub fn on_llm_function_call_started(
        mut self,
        f: impl Fn(&LlmFunctionCallStartedData) + Send + Sync + 'static,
    ) -> Self {
        self.llm_function_call_started = typed(f);
        self
    }

    #[must_use]
    pub fn on_llm_function_call_in_progress(
        mut self,
        f: impl Fn(&LlmFunctionCallInProgressData) + Send + Sync + 'static,
    ) -> Self {
        self.llm_function_call_in_progress = typed(f);
        self
    }

    #[must_use]
    pub fn on_llm_function_call_stopped(
        mut self,
        f: impl Fn(&LlmFunctionCallStoppedData) + Send + Sync + 'static,
    ) -> Self {
        self.llm_function_call_stopped = typed(f);
        self
    }

    #[must_use]
    pub fn on_bot_llm_search_response(
        mut self,
        f: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Self {
        self.bot_llm_search_response = typed(f);
        self
    }

    #[must_use]
    pub fn on_bot_tts_text(mut self, f: impl Fn(&BotTtsTextData) + Send + Sync + 'static) -> Self {
        self.bot_tts_text = typed(f);
        self
    }

    #[must_use]
    pub fn on_bot_tts_started(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.bot_tts_started = unit(f);
        self
    }

    #[must_use]
    pub fn on_bot_tts_stopped(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.bot_tts_stopped = unit(f);
        self
    }

    // ------------------------------------------------------------------------
    // Participants & media
    // ------------------------------------------------------------------------

    #[must_use]
    pub fn on_participant_connected(
        mut self,
        f: impl Fn(&Participant) + Send + Sync + 'static,
    ) -> Self {
        self.participant_connected = typed(f);
        self
    }

    #[must_use]
    pub fn on_participant_left(
        mut self,
        f: impl Fn(&Participant) + Send + Sync + 'static,
    ) -> Self {
        self.participant_left = typed(f);
        self
    }

    #[must_use]
    pub fn on_track_started(mut self, f: impl Fn(&TrackEvent) + Send + Sync + 'static) -> Self {
        self.track_started = typed(f);
        self
    }

    #[must_use]
    pub fn on_track_stopped(mut self, f: impl Fn(&TrackEvent) + Send + Sync + 'static) -> Self {
        self.track_stopped = typed(f);
        self
    }

    #[must_use]
    pub fn on_screen_track_started(
        mut self,
        f: impl Fn(&TrackEvent) + Send + Sync + 'static,
    ) -> Self {
        self.screen_track_started = typed(f);
        self
    }

    #[must_use]
    pub fn on_screen_track_stopped(
        mut self,
        f: impl Fn(&TrackEvent) + Send + Sync + 'static,
    ) -> Self {
        self.screen_track_stopped = typed(f);
        self
    }

    #[must_use]
    pub fn on_screen_share_error(mut self, f: impl Fn(&String) + Send + Sync + 'static) -> Self {
        self.screen_share_error = typed(f);
        self
    }

    #[must_use]
    pub fn on_local_audio_level(mut self, f: impl Fn(&f32) + Send + Sync + 'static) -> Self {
        self.local_audio_level = typed(f);
        self
    }

    #[must_use]
    pub fn on_remote_audio_level(
        mut self,
        f: impl Fn(&RemoteAudioLevel) + Send + Sync + 'static,
    ) -> Self {
        self.remote_audio_level = typed(f);
        self
    }

    // ------------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------------

    #[must_use]
    pub fn on_available_cams_updated(
        mut self,
        f: impl Fn(&Vec<MediaDeviceInfo>) + Send + Sync + 'static,
    ) -> Self {
        self.available_cams_updated = typed(f);
        self
    }

    #[must_use]
    pub fn on_available_mics_updated(
        mut self,
        f: impl Fn(&Vec<MediaDeviceInfo>) + Send + Sync + 'static,
    ) -> Self {
        self.available_mics_updated = typed(f);
        self
    }

    #[must_use]
    pub fn on_available_speakers_updated(
        mut self,
        f: impl Fn(&Vec<MediaDeviceInfo>) + Send + Sync + 'static,
    ) -> Self {
        self.available_speakers_updated = typed(f);
        self
    }

    #[must_use]
    pub fn on_cam_updated(mut self, f: impl Fn(&MediaDeviceInfo) + Send + Sync + 'static) -> Self {
        self.cam_updated = typed(f);
        self
    }

    #[must_use]
    pub fn on_mic_updated(mut self, f: impl Fn(&MediaDeviceInfo) + Send + Sync + 'static) -> Self {
        self.mic_updated = typed(f);
        self
    }

    #[must_use]
    pub fn on_speaker_updated(
        mut self,
        f: impl Fn(&MediaDeviceInfo) + Send + Sync + 'static,
    ) -> Self {
        self.speaker_updated = typed(f);
        self
    }

    #[must_use]
    pub fn on_device_error(mut self, f: impl Fn(&DeviceError) + Send + Sync + 'static) -> Self {
        self.device_error = typed(f);
        self
    }
}

// ============================================================================
// Callbacks - Dispatch
// ============================================================================

impl Callbacks {
    /// Invokes the callback matching `event`, if set.
    ///
    /// Returns `true` if a callback ran to completion.
    pub fn invoke(&self, event: &RtviEvent) -> bool {
        let name = event.name();

        match event {
            RtviEvent::Connected => fire_unit(name, self.connected.as_ref()),
            RtviEvent::Disconnected => fire_unit(name, self.disconnected.as_ref()),
            RtviEvent::TransportStateChanged(state) => {
                fire(name, self.transport_state_changed.as_ref(), state)
            }

            RtviEvent::BotStarted(response) => fire(name, self.bot_started.as_ref(), response),
            RtviEvent::BotConnected(p) => fire(name, self.bot_connected.as_ref(), p),
            RtviEvent::BotReady(data) => fire(name, self.bot_ready.as_ref(), data),
            RtviEvent::BotDisconnected(p) => fire(name, self.bot_disconnected.as_ref(), p),

            RtviEvent::Error(message) => fire(name, self.error.as_ref(), message),
            RtviEvent::ServerMessage(data) => fire(name, self.server_message.as_ref(), data),
            RtviEvent::ServerResponse(data) => fire(name, self.server_response.as_ref(), data),
            RtviEvent::MessageError(message) => {
                fire(name, self.message_error.as_ref(), message)
            }
            RtviEvent::UnknownMessage(message) => {
                fire(name, self.unknown_message.as_ref(), message)
            }
            RtviEvent::Metrics(data) => fire(name, self.metrics.as_ref(), data),

            RtviEvent::BotStartedSpeaking => fire_unit(name, self.bot_started_speaking.as_ref()),
            RtviEvent::BotStoppedSpeaking => fire_unit(name, self.bot_stopped_speaking.as_ref()),
            RtviEvent::UserStartedSpeaking => {
                fire_unit(name, self.user_started_speaking.as_ref())
            }
            RtviEvent::UserStoppedSpeaking => {
                fire_unit(name, self.user_stopped_speaking.as_ref())
            }
            RtviEvent::UserMuteStarted => fire_unit(name, self.user_mute_started.as_ref()),
            RtviEvent::UserMuteStopped => fire_unit(name, self.user_mute_stopped.as_ref()),

            RtviEvent::UserTranscript(data) => fire(name, self.user_transcript.as_ref(), data),
            RtviEvent::BotOutput(data) => fire(name, self.bot_output.as_ref(), data),
            RtviEvent::BotTranscript(data) => fire(name, self.bot_transcript.as_ref(), data),
            RtviEvent::BotLlmText(data) => fire(name, self.bot_llm_text.as_ref(), data),
            RtviEvent::BotLlmStarted => fire_unit(name, self.bot_llm_started.as_ref()),
            RtviEvent::BotLlmStopped => fire_unit(name, self.bot_llm_stopped.as_ref()),
            RtviEvent::LlmFunctionCall(data) => {
                fire(name, self.llm_function_call.as_ref(), data)
            }
            RtviEvent::LlmFunctionCallStarted(data) => {
                fire(name, self.llm_function_call_started.as_ref(), data)
            }
            RtviEvent::LlmFunctionCallInProgress(data) => {
                fire(name, self.llm_function_call_in_progress.as_ref(), data)
            }
            RtviEvent::LlmFunctionCallStopped(data) => {
                fire(name, self.llm_function_call_stopped.as_ref(), data)
            }
            RtviEvent::BotLlmSearchResponse(data) => {
                fire(name, self.bot_llm_search_response.as_ref(), data)
            }
            RtviEvent::BotTtsText(data) => fire(name, self.bot_tts_text.as_ref(), data),
            RtviEvent::BotTtsStarted => fire_unit(name, self.bot_tts_started.as_ref()),
            RtviEvent::BotTtsStopped => fire_unit(name, self.bot_tts_stopped.as_ref()),

            RtviEvent::ParticipantConnected(p) => {
                fire(name, self.participant_connected.as_ref(), p)
            }
            RtviEvent::ParticipantLeft(p) => fire(name, self.participant_left.as_ref(), p),
            RtviEvent::TrackStarted(t) => fire(name, self.track_started.as_ref(), t),
            RtviEvent::TrackStopped(t) => fire(name, self.track_stopped.as_ref(), t),
            RtviEvent::ScreenTrackStarted(t) => fire(name, self.screen_track_started.as_ref(), t),
            RtviEvent::ScreenTrackStopped(t) => fire(name, self.screen_track_stopped.as_ref(), t),
            RtviEvent::ScreenShareError(e) => fire(name, self.screen_share_error.as_ref(), e),
            RtviEvent::LocalAudioLevel(l) => fire(name, self.local_audio_level.as_ref(), l),
            RtviEvent::RemoteAudioLevel(l) => fire(name, self.remote_audio_level.as_ref(), l),

            RtviEvent::AvailableCamsUpdated(d) => {
                fire(name, self.available_cams_updated.as_ref(), d)
            }
            RtviEvent::AvailableMicsUpdated(d) => {
                fire(name, self.available_mics_updated.as_ref(), d)
            }
            RtviEvent::AvailableSpeakersUpdated(d) => {
                fire(name, self.available_speakers_updated.as_ref(), d)
            }
            RtviEvent::CamUpdated(d) => fire(name, self.cam_updated.as_ref(), d),
            RtviEvent::MicUpdated(d) => fire(name, self.mic_updated.as_ref(), d),
            RtviEvent::SpeakerUpdated(d) => fire(name, self.speaker_updated.as_ref(), d),
            RtviEvent::DeviceError(e) => fire(name, self.device_error.as_ref(), e),
        }
    }
}

fn fire<T>(name: EventName, callback: Option<&Callback<T>>, payload: &T) -> bool {
    callback.is_some_and(|cb| run_guarded(name, || cb(payload)))
}

fn fire_unit(name: EventName, callback: Option<&UnitCallback>) -> bool {
    callback.is_some_and(|cb| run_guarded(name, || cb()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn test_unset_callback_is_skipped() {
        let callbacks = Callbacks::new();
        assert!(!callbacks.invoke(&RtviEvent::Connected));
    }

    #[test]
    fn test_typed_callback_receives_payload() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callbacks =
            Callbacks::new().on_transport_state_changed(move |state| sink.lock().push(*state));

        assert!(callbacks.invoke(&RtviEvent::TransportStateChanged(TransportState::Connecting)));
        assert!(!callbacks.invoke(&RtviEvent::Connected));
        assert_eq!(*seen.lock(), vec![TransportState::Connecting]);
    }

    #[test]
    fn test_unit_callback() {
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        let callbacks = Callbacks::new().on_bot_tts_started(move || *sink.lock() += 1);

        callbacks.invoke(&RtviEvent::BotTtsStarted);
        callbacks.invoke(&RtviEvent::BotTtsStarted);
        assert_eq!(*count.lock(), 2);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let callbacks = Callbacks::new().on_server_message(|_| panic!("callback failure"));
        assert!(!callbacks.invoke(&RtviEvent::ServerMessage(json!({}))));
    }

    #[test]
    fn test_clone_shares_callbacks() {
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        let callbacks = Callbacks::new().on_connected(move || *sink.lock() += 1);
        let copy = callbacks.clone();

        callbacks.invoke(&RtviEvent::Connected);
        copy.invoke(&RtviEvent::Connected);
        assert_eq!(*count.lock(), 2);
    }
}
