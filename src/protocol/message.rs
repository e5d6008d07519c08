//! RTVI message envelope.
//!
//! Every protocol exchange, inbound or outbound, is one envelope:
//!
//! ```json
//! {
//!   "id": "uuid",
//!   "label": "rtvi-ai",
//!   "type": "client-message",
//!   "data": { ... }
//! }
//! ```
//!
//! Sizes are always measured on this exact serialized form, in UTF-8 bytes.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::identifiers::MessageId;

use super::data::{FunctionCallParams, SendTextOptions};

// ============================================================================
// Constants
// ============================================================================

/// Protocol discriminator carried by every envelope.
pub const RTVI_MESSAGE_LABEL: &str = "rtvi-ai";

/// Protocol version announced in `client-ready`.
pub const RTVI_PROTOCOL_VERSION: &str = "1.0.0";

/// Default ceiling for a single outbound message (64 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

// ============================================================================
// MessageType
// ============================================================================

/// Known message kinds.
///
/// The wire `type` stays a plain string on [`RtviMessage`] so unknown kinds
/// from newer servers still round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    // Outbound
    /// Client finished connecting and is ready for the bot.
    ClientReady,
    /// Application-level message or request.
    ClientMessage,
    /// Ask the bot to leave.
    DisconnectBot,
    /// Result of a client-side function call.
    LlmFunctionCallResult,
    /// Text input for the bot.
    SendText,

    // Inbound
    /// Bot is connected and ready to receive messages.
    BotReady,
    /// Server-side error.
    Error,
    /// Error answering a client request.
    ErrorResponse,
    /// Answer to a client request.
    ServerResponse,
    /// Unsolicited application message from the server.
    ServerMessage,
    /// Pipeline metrics.
    Metrics,
    /// User voice activity began.
    UserStartedSpeaking,
    /// User voice activity ended.
    UserStoppedSpeaking,
    /// Bot audio output began.
    BotStartedSpeaking,
    /// Bot audio output ended.
    BotStoppedSpeaking,
    /// User input muted by the server.
    UserMuteStarted,
    /// User input unmuted by the server.
    UserMuteStopped,
    /// Speech-to-text transcript of the user.
    UserTranscription,
    /// Aggregated bot output.
    BotOutput,
    /// Bot transcript (deprecated by `bot-output`).
    BotTranscription,
    /// LLM text token(s).
    BotLlmText,
    /// LLM response began.
    BotLlmStarted,
    /// LLM response ended.
    BotLlmStopped,
    /// Combined function-call request (deprecated).
    LlmFunctionCall,
    /// Function call started.
    LlmFunctionCallStarted,
    /// Function call with arguments, awaiting a result.
    LlmFunctionCallInProgress,
    /// Function call finished or cancelled.
    LlmFunctionCallStopped,
    /// LLM search grounding response.
    BotLlmSearchResponse,
    /// TTS text.
    BotTtsText,
    /// TTS began.
    BotTtsStarted,
    /// TTS ended.
    BotTtsStopped,
}

impl MessageType {
    /// Every known message kind.
    pub const ALL: [Self; 31] = [
        Self::ClientReady,
        Self::ClientMessage,
        Self::DisconnectBot,
        Self::LlmFunctionCallResult,
        Self::SendText,
        Self::BotReady,
        Self::Error,
        Self::ErrorResponse,
        Self::ServerResponse,
        Self::ServerMessage,
        Self::Metrics,
        Self::UserStartedSpeaking,
        Self::UserStoppedSpeaking,
        Self::BotStartedSpeaking,
        Self::BotStoppedSpeaking,
        Self::UserMuteStarted,
        Self::UserMuteStopped,
        Self::UserTranscription,
        Self::BotOutput,
        Self::BotTranscription,
        Self::BotLlmText,
        Self::BotLlmStarted,
        Self::BotLlmStopped,
        Self::LlmFunctionCall,
        Self::LlmFunctionCallStarted,
        Self::LlmFunctionCallInProgress,
        Self::LlmFunctionCallStopped,
        Self::BotLlmSearchResponse,
        Self::BotTtsText,
        Self::BotTtsStarted,
        Self::BotTtsStopped,
    ];

    /// Returns the wire string for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClientReady => "client-ready",
            Self::ClientMessage => "client-message",
            Self::DisconnectBot => "disconnect-bot",
            Self::LlmFunctionCallResult => "llm-function-call-result",
            Self::SendText => "send-text",
            Self::BotReady => "bot-ready",
            Self::Error => "error",
            Self::ErrorResponse => "error-response",
            Self::ServerResponse => "server-response",
            Self::ServerMessage => "server-message",
            Self::Metrics => "metrics",
            Self::UserStartedSpeaking => "user-started-speaking",
            Self::UserStoppedSpeaking => "user-stopped-speaking",
            Self::BotStartedSpeaking => "bot-started-speaking",
            Self::BotStoppedSpeaking => "bot-stopped-speaking",
            Self::UserMuteStarted => "user-mute-started",
            Self::UserMuteStopped => "user-mute-stopped",
            Self::UserTranscription => "user-transcription",
            Self::BotOutput => "bot-output",
            Self::BotTranscription => "bot-transcription",
            Self::BotLlmText => "bot-llm-text",
            Self::BotLlmStarted => "bot-llm-started",
            Self::BotLlmStopped => "bot-llm-stopped",
            Self::LlmFunctionCall => "llm-function-call",
            Self::LlmFunctionCallStarted => "llm-function-call-started",
            Self::LlmFunctionCallInProgress => "llm-function-call-in-progress",
            Self::LlmFunctionCallStopped => "llm-function-call-stopped",
            Self::BotLlmSearchResponse => "bot-llm-search-response",
            Self::BotTtsText => "bot-tts-text",
            Self::BotTtsStarted => "bot-tts-started",
            Self::BotTtsStopped => "bot-tts-stopped",
        }
    }

    /// Looks up a kind by its wire string.
    #[must_use]
    pub fn from_wire(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }

    /// Returns `true` for the function-call family (all four variants).
    #[inline]
    #[must_use]
    pub const fn is_function_call(self) -> bool {
        matches!(
            self,
            Self::LlmFunctionCall
                | Self::LlmFunctionCallStarted
                | Self::LlmFunctionCallInProgress
                | Self::LlmFunctionCallStopped
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// RtviMessage
// ============================================================================

/// One protocol message unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtviMessage {
    /// Envelope ID.
    pub id: MessageId,

    /// Protocol label (always [`RTVI_MESSAGE_LABEL`] for outbound).
    pub label: String,

    /// Message kind on the wire.
    #[serde(rename = "type")]
    pub msg_type: String,

    /// Kind-specific payload.
    pub data: Value,
}

impl RtviMessage {
    /// Creates a new envelope with a generated ID.
    #[must_use]
    pub fn new(msg_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: MessageId::generate(),
            label: RTVI_MESSAGE_LABEL.to_string(),
            msg_type: msg_type.into(),
            data,
        }
    }

    /// Creates an envelope of a known kind.
    #[inline]
    #[must_use]
    pub fn of(kind: MessageType, data: Value) -> Self {
        Self::new(kind.as_str(), data)
    }

    /// Validates a raw inbound JSON value into an envelope.
    ///
    /// `type` (string) and `data` are required. A missing `id` is
    /// generated, a missing `label` defaults to the RTVI label.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if required fields are missing or
    /// have the wrong shape.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(Error::protocol("message is not a JSON object"));
        };

        let msg_type = match map.remove("type") {
            Some(Value::String(t)) => t,
            Some(_) => return Err(Error::protocol("message `type` is not a string")),
            None => return Err(Error::protocol("message is missing `type`")),
        };

        let data = map
            .remove("data")
            .ok_or_else(|| Error::protocol(format!("message `{msg_type}` is missing `data`")))?;

        let id = match map.remove("id") {
            Some(Value::String(id)) => MessageId::new(id),
            Some(Value::Number(n)) => MessageId::new(n.to_string()),
            _ => MessageId::generate(),
        };

        let label = match map.remove("label") {
            Some(Value::String(label)) => label,
            _ => RTVI_MESSAGE_LABEL.to_string(),
        };

        Ok(Self {
            id,
            label,
            msg_type,
            data,
        })
    }

    /// Returns the known kind, if any.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_wire(&self.msg_type)
    }

    /// Returns `true` if the envelope carries the RTVI label.
    #[inline]
    #[must_use]
    pub fn is_rtvi(&self) -> bool {
        self.label == RTVI_MESSAGE_LABEL
    }

    /// Serializes to canonical JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the payload cannot be serialized.
    pub fn serialize(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Returns the serialized size in UTF-8 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the payload cannot be serialized.
    pub fn byte_size(&self) -> Result<usize> {
        size_of(self)
    }

    /// Gets a string field from the payload.
    ///
    /// Returns empty string if key not found or not a string.
    #[inline]
    #[must_use]
    pub fn get_string(&self, key: &str) -> String {
        self.data
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    }
}

// ============================================================================
// RtviMessage - Outbound Constructors
// ============================================================================

impl RtviMessage {
    /// `client-ready` announcing protocol version and library info.
    #[must_use]
    pub fn client_ready() -> Self {
        Self::of(
            MessageType::ClientReady,
            json!({
                "version": RTVI_PROTOCOL_VERSION,
                "about": {
                    "library": env!("CARGO_PKG_NAME"),
                    "library_version": env!("CARGO_PKG_VERSION"),
                    "platform": std::env::consts::OS,
                },
            }),
        )
    }

    /// `client-message` wrapping an application message type and payload.
    #[must_use]
    pub fn client_message(msg_type: impl Into<String>, data: Value) -> Self {
        Self::of(
            MessageType::ClientMessage,
            json!({ "t": msg_type.into(), "d": data }),
        )
    }

    /// `llm-function-call-result` answering a function call.
    #[must_use]
    pub fn function_call_result(params: &FunctionCallParams, result: Value) -> Self {
        Self::of(
            MessageType::LlmFunctionCallResult,
            json!({
                "function_name": params.function_name,
                "tool_call_id": params.tool_call_id,
                "arguments": params.arguments,
                "result": result,
            }),
        )
    }

    /// `send-text` carrying user text input.
    #[must_use]
    pub fn send_text(content: impl Into<String>, options: &SendTextOptions) -> Self {
        Self::of(
            MessageType::SendText,
            json!({ "content": content.into(), "options": options }),
        )
    }

    /// `disconnect-bot` asking the bot to leave.
    #[must_use]
    pub fn disconnect_bot() -> Self {
        Self::of(MessageType::DisconnectBot, Value::Object(Map::new()))
    }

    /// `error` envelope as delivered to error observers.
    #[must_use]
    pub fn error(message: impl Into<String>, fatal: bool) -> Self {
        Self::of(
            MessageType::Error,
            json!({ "message": message.into(), "fatal": fatal }),
        )
    }
}

// ============================================================================
// Size Accounting
// ============================================================================

/// Writer that only counts bytes.
#[derive(Default)]
struct ByteCounter(usize);

impl io::Write for ByteCounter {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Returns the exact UTF-8 byte length of `value`'s JSON encoding.
///
/// Serialization is streamed into a counter, nothing is buffered.
///
/// # Errors
///
/// Returns [`Error::Json`] if the value cannot be serialized.
pub fn size_of<T: Serialize + ?Sized>(value: &T) -> Result<usize> {
    let mut counter = ByteCounter::default();
    serde_json::to_writer(&mut counter, value)?;
    Ok(counter.0)
}

/// Returns `true` if `value` serializes to at most `max_size` bytes.
///
/// Values that fail to serialize are never within the limit.
#[must_use]
pub fn message_size_within_limit<T: Serialize + ?Sized>(value: &T, max_size: usize) -> bool {
    size_of(value).is_ok_and(|size| size <= max_size)
}

// ============================================================================
// Tests
// ============================================================================
