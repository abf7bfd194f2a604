//! Control-channel message envelopes.
//!
//! Every JSON message on the duplex channel carries a `type` tag. Outbound
//! messages (client → agent) are [`ClientMessage`]; inbound messages
//! (agent → client) are [`AgentMessage`]. Binary audio frames travel as
//! separate binary transport frames; the `audio_chunk` control message
//! carries their metadata, or the audio itself as embedded base64 when the
//! agent cannot send a binary frame.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    AgentState, AudioFormat, CommandPayload, ElementDescriptor, ExecutionOutcome, InteractionMode,
};

/// Session mode marker sent in `session_config`.
///
/// Distinguishes the co-pilot from other widget modes served by the same
/// endpoint.
pub const COPILOT_MODE: &str = "visual-copilot";

/// Messages sent from the client to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opening handshake describing the session.
    SessionConfig {
        /// Always [`COPILOT_MODE`].
        mode: String,
        interaction_mode: InteractionMode,
        /// Unix timestamp in milliseconds.
        timestamp: i64,
        /// Present when resuming a prior session.
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        current_url: String,
        /// Recovered mission goal, passed as a resume hint.
        #[serde(skip_serializing_if = "Option::is_none")]
        pending_goal: Option<String>,
    },
    /// A page blueprint, full or differential.
    DomUpdate {
        elements: Vec<ElementDescriptor>,
        url: String,
    },
    /// Typed user input from the host chat surface.
    TextInput {
        text: String,
        mode: InteractionMode,
    },
    /// Local agent-voice mute toggle, mirrored to the agent.
    SpeakerMute { muted: bool },
    /// Outcome report for one executed command.
    ExecutionComplete {
        status: String,
        outcome: ExecutionOutcome,
        /// Fresh blueprint captured after the action, when it changed.
        #[serde(skip_serializing_if = "Option::is_none")]
        dom_context: Option<Vec<ElementDescriptor>>,
        timestamp: i64,
    },
    /// Request for a cacheable visual asset delivered over the channel.
    RequestAsset { asset: String },
    /// Keepalive reply.
    Pong,
}

/// Messages received from the agent.
///
/// Unknown `type` tags fail deserialization; callers log and ignore them
/// so protocol additions never terminate a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Session established; the id is persisted for resume.
    SessionCreated { session_id: String },
    /// The agent began tracking a multi-step goal.
    MissionStarted { goal: String },
    /// Conversational state change.
    StateUpdate {
        #[serde(skip_serializing_if = "Option::is_none")]
        state: Option<AgentState>,
    },
    /// Legacy spelling of [`AgentMessage::StateUpdate`].
    SessionReady {
        #[serde(skip_serializing_if = "Option::is_none")]
        state: Option<AgentState>,
    },
    /// Streamed agent text for the chat surface.
    AgentResponse {
        text: String,
        #[serde(default)]
        is_streaming: bool,
    },
    /// Text substitute for synthesized speech in turbo mode.
    TurboSpeech { text: String },
    /// An action to execute against the page.
    Command { payload: CommandPayload },
    /// Standalone navigation request.
    Navigate { url: String },
    /// Metadata for one audio chunk.
    ///
    /// When `binary_sent` is true the payload arrived (or will arrive) as
    /// a separate binary frame; otherwise `data` holds base64 PCM.
    AudioChunk {
        #[serde(default)]
        format: AudioFormat,
        #[serde(default = "default_output_rate")]
        sample_rate: u32,
        #[serde(default)]
        binary_sent: bool,
        #[serde(default, alias = "audio", skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
    /// A cacheable visual asset (e.g. the orb SVG).
    AssetData { asset: String, data: String },
    /// Dedicated audio channel accepted the session.
    AudioStreamReady,
    /// Dedicated audio channel finished the current utterance.
    AudioStreamEnd,
    /// Agent acknowledged a `speaker_mute` toggle.
    SpeakerMuteConfirmed {
        muted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        mode: Option<InteractionMode>,
    },
    /// Keepalive probe; answered with [`ClientMessage::Pong`].
    Ping,
}

fn default_output_rate() -> u32 {
    44_100
}

impl AgentMessage {
    /// Parses one control-channel text frame.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

impl ClientMessage {
    /// Serializes the message for the wire.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Decodes base64-embedded audio from an `audio_chunk` message.
pub fn decode_embedded_audio(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(data)
}

/// Encodes raw bytes as base64 for embedding in a control message.
pub fn encode_embedded(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Returns a forward-compatible view of an arbitrary inbound frame.
///
/// Used by diagnostics to log the `type` tag of messages the typed enum
/// does not understand.
pub fn message_type(raw: &Value) -> Option<&str> {
    raw.get("type").and_then(Value::as_str)
}
