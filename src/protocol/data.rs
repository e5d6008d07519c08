//! Typed payloads carried in envelope `data`.
//!
//! Every field defaults, so partially populated payloads from older or
//! newer servers still parse.

// ============================================================================
// Imports
// ============================================================================

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

use super::RtviMessage;

// ============================================================================
// Parsing
// ============================================================================

impl RtviMessage {
    /// Parses the payload into a typed structure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the payload has the wrong shape.
    pub fn parse_data<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            Error::protocol(format!("invalid `{}` payload: {e}", self.msg_type))
        })
    }
}

// ============================================================================
// Bot Lifecycle
// ============================================================================

/// Payload of `bot-ready`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotReadyData {
    /// Protocol version spoken by the bot.
    pub version: String,
    /// Free-form bot description.
    pub about: Option<Value>,
}

/// Payload of `error` and `error-response`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorData {
    /// Human-readable error text.
    pub message: String,
    /// Whether the session cannot continue.
    pub fatal: bool,
}

// ============================================================================
// Transcripts & Text
// ============================================================================

/// Payload of `user-transcription`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptData {
    /// Transcribed text.
    pub text: String,
    /// `true` once the segment will no longer change.
    #[serde(rename = "final")]
    pub is_final: bool,
    /// Server timestamp.
    pub timestamp: String,
    /// Speaker ID.
    pub user_id: String,
}

/// Payload of `bot-output`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotOutputData {
    /// Output text.
    pub text: String,
    /// Whether the text was spoken.
    pub spoken: bool,
    /// Aggregation unit (`word`, `sentence`, ...).
    pub aggregated_by: String,
}

/// Payload of `bot-llm-text` and `bot-transcription`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotLlmTextData {
    /// Text chunk.
    pub text: String,
}

/// Payload of `bot-tts-text`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotTtsTextData {
    /// Text chunk.
    pub text: String,
}

// ============================================================================
// Function Calls
// ============================================================================

/// Payload of the deprecated combined `llm-function-call`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmFunctionCallData {
    /// Function to invoke.
    pub function_name: String,
    /// Correlates request and result.
    pub tool_call_id: String,
    /// Argument bag.
    pub args: Value,
}

/// Payload of `llm-function-call-started`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmFunctionCallStartedData {
    /// Function about to be invoked, when disclosed.
    pub function_name: Option<String>,
}

/// Payload of `llm-function-call-in-progress`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmFunctionCallInProgressData {
    /// Function to invoke, when disclosed.
    pub function_name: Option<String>,
    /// Correlates request and result.
    pub tool_call_id: String,
    /// Argument bag.
    pub arguments: Value,
}

impl From<&LlmFunctionCallData> for LlmFunctionCallInProgressData {
    fn from(legacy: &LlmFunctionCallData) -> Self {
        Self {
            function_name: Some(legacy.function_name.clone()),
            tool_call_id: legacy.tool_call_id.clone(),
            arguments: legacy.args.clone(),
        }
    }
}

/// Payload of `llm-function-call-stopped`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmFunctionCallStoppedData {
    /// Function that ran, when disclosed.
    pub function_name: Option<String>,
    /// Correlates request and result.
    pub tool_call_id: String,
    /// `true` if the call was cancelled server-side.
    pub cancelled: bool,
    /// Result reported by the server, if any.
    pub result: Option<Value>,
}

/// Parameters handed to a registered function-call handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallParams {
    /// Registered handler name.
    pub function_name: String,
    /// Must be echoed back in the result.
    pub tool_call_id: String,
    /// Argument bag.
    pub arguments: Value,
}

impl FunctionCallParams {
    /// Builds params from an in-progress payload.
    ///
    /// Returns `None` when the function name was not disclosed.
    #[must_use]
    pub fn from_in_progress(data: &LlmFunctionCallInProgressData) -> Option<Self> {
        let function_name = data.function_name.clone()?;
        Some(Self {
            function_name,
            tool_call_id: data.tool_call_id.clone(),
            arguments: data.arguments.clone(),
        })
    }
}

// ============================================================================
// Client Messages
// ============================================================================

/// `{t, d}` body of `client-message`, `server-response` and `server-message`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientMessageData {
    /// Application message type.
    pub t: String,
    /// Application payload.
    pub d: Value,
}

/// Options of `send-text`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendTextOptions {
    /// Run the LLM immediately instead of waiting for more input.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_immediately: Option<bool>,
    /// Speak the response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_response: Option<bool>,
}

// ============================================================================
// Tests
// ============================================================================
