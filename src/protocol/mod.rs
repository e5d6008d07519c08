//! RTVI protocol message types.
//!
//! This module defines the envelope exchanged between the client and the
//! remote agent, plus typed payloads for the known message kinds.
//!
//! # Protocol Overview
//!
//! | Message Type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | `client-ready` | Client → Bot | Transport connected, client ready |
//! | `client-message` | Client → Bot | Application message / request |
//! | `llm-function-call-result` | Client → Bot | Function call result |
//! | `bot-ready` | Bot → Client | Bot ready to receive messages |
//! | `server-response` | Bot → Client | Answer to a client request |
//! | `server-message` | Bot → Client | Unsolicited application message |
//! | `llm-function-call-*` | Bot → Client | Function call phases |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `data` | Typed payloads |
//! | `message` | Envelope, message kinds, size accounting |

// ============================================================================
// Submodules
// ============================================================================

/// Typed message payloads.
pub mod data;

/// Envelope type and size accounting.
pub mod message;

// ============================================================================
// Re-exports
// ============================================================================

pub use data::{
    BotLlmTextData, BotOutputData, BotReadyData, BotTtsTextData, ClientMessageData, ErrorData,
    FunctionCallParams, LlmFunctionCallData, LlmFunctionCallInProgressData,
    LlmFunctionCallStartedData, LlmFunctionCallStoppedData, SendTextOptions, TranscriptData,
};
pub use message::{
    DEFAULT_MAX_MESSAGE_SIZE, MessageType, RTVI_MESSAGE_LABEL, RTVI_PROTOCOL_VERSION, RtviMessage,
    message_size_within_limit, size_of,
};
