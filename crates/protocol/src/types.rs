//! Core protocol types used across the wire.
//!
//! These types represent the data shapes shared by several messages:
//! element descriptors, commands, execution outcomes, audio chunk
//! metadata, and the persisted mission snapshot.

use serde::{Deserialize, Serialize};

/// How the user interacts with the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionMode {
    /// Full audio capture and playback with a voice walkthrough.
    #[default]
    Interactive,
    /// Text-only operation, no audio in either direction.
    Turbo,
}

impl InteractionMode {
    /// Returns the wire spelling of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionMode::Interactive => "interactive",
            InteractionMode::Turbo => "turbo",
        }
    }
}

impl std::fmt::Display for InteractionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent-side conversational state reported via `state_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    /// Waiting for user speech or text.
    Listening,
    /// Producing a response.
    Thinking,
    /// Synthesized speech is being delivered.
    Speaking,
}

/// Sample encoding of a binary audio frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AudioFormat {
    /// Signed 16-bit little-endian integer PCM.
    #[serde(rename = "pcm_s16le")]
    PcmS16le,
    /// 32-bit little-endian float PCM.
    #[default]
    #[serde(rename = "pcm_f32le")]
    PcmF32le,
}

/// Screen-space bounding box of a scanned element.
///
/// Coordinates are document-absolute (viewport position plus scroll offset),
/// rounded to whole pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// One addressable element in a page blueprint.
///
/// Produced by the element index on every scan and sent to the agent in
/// `dom_update` and `execution_complete` messages. The `id` is stable
/// across scans of an unchanged element (see the element index for the
/// hashing scheme).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementDescriptor {
    /// Stable identifier the agent uses to target commands.
    pub id: String,
    /// Best-available text for the element, whitespace-collapsed, capped.
    pub text: String,
    /// Lowercase tag name; headings are collapsed to `"header"`.
    #[serde(rename = "type")]
    pub tag: String,
    /// Whether the element accepts interaction (click/focus/type).
    pub interactive: bool,
    /// Whether the element appeared since the previous scan.
    #[serde(rename = "isNew")]
    pub is_new: bool,
    /// `"focused"`, `"active"`, or empty.
    #[serde(default)]
    pub state: String,
    #[serde(rename = "ariaSelected", skip_serializing_if = "Option::is_none")]
    pub aria_selected: Option<String>,
    #[serde(rename = "ariaCurrent", skip_serializing_if = "Option::is_none")]
    pub aria_current: Option<String>,
    #[serde(rename = "ariaExpanded", skip_serializing_if = "Option::is_none")]
    pub aria_expanded: Option<String>,
    pub rect: Rect,
}

/// The action kinds the agent may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Click,
    TypeText,
    Scroll,
    ScrollTo,
    Highlight,
    Spotlight,
    Clear,
    Wait,
    Navigate,
}

/// A symbolic command received from the agent.
///
/// Consumed immediately by the executor; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    /// Stable id of the target element, when the command has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// Free text: input content for `type_text`, fallback target text or
    /// scroll direction for other kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Structured result of one executed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Whether the post-action re-scan hash differs from the pre-action hash.
    pub dom_changed: bool,
    /// Whether the document URL changed during execution.
    pub url_changed: bool,
    /// Number of elements flagged new by the post-action scan.
    pub new_elements_count: usize,
    pub current_url: String,
    /// Whether a dialog/modal marker is present after the action.
    pub has_modal: bool,
    /// Milliseconds from action dispatch until the document settled.
    pub settle_time_ms: u64,
    /// Content hash of the post-action blueprint.
    pub dom_hash: u32,
    /// Vertical scroll position after the action, in pixels.
    pub scroll_y: i32,
}

/// Mission snapshot persisted across page navigations.
///
/// Written just before unload while a goal is tracked; read once on the
/// next load and discarded if older than the freshness window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionState {
    pub session_id: String,
    pub goal: String,
    /// URL the mission was saved from.
    pub url: String,
    pub mode: InteractionMode,
    /// Unix timestamp in milliseconds at save time.
    pub saved_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interaction_mode_wire_spelling() {
        assert_eq!(
            serde_json::to_string(&InteractionMode::Turbo).unwrap(),
            "\"turbo\""
        );
        let mode: InteractionMode = serde_json::from_str("\"interactive\"").unwrap();
        assert_eq!(mode, InteractionMode::Interactive);
    }

    #[test]
    fn command_kind_snake_case() {
        assert_eq!(
            serde_json::to_string(&CommandKind::TypeText).unwrap(),
            "\"type_text\""
        );
        assert_eq!(
            serde_json::to_string(&CommandKind::ScrollTo).unwrap(),
            "\"scroll_to\""
        );
    }

    #[test]
    fn element_descriptor_round_trip() {
        let desc = ElementDescriptor {
            id: "t-abc123".into(),
            text: "Submit".into(),
            tag: "button".into(),
            interactive: true,
            is_new: false,
            state: "focused".into(),
            aria_selected: None,
            aria_current: Some("page".into()),
            aria_expanded: None,
            rect: Rect {
                x: 10,
                y: 20,
                width: 80,
                height: 24,
            },
        };
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["type"], "button");
        assert_eq!(json["isNew"], false);
        assert_eq!(json["ariaCurrent"], "page");
        assert!(json.get("ariaSelected").is_none());
        let back: ElementDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(back, desc);
    }

    #[test]
    fn command_payload_tolerates_missing_fields() {
        let cmd: CommandPayload =
            serde_json::from_str(r#"{"type": "wait"}"#).unwrap();
        assert_eq!(cmd.kind, CommandKind::Wait);
        assert!(cmd.target_id.is_none());
        assert!(cmd.text.is_none());
    }

    #[test]
    fn audio_format_wire_names() {
        assert_eq!(
            serde_json::to_string(&AudioFormat::PcmS16le).unwrap(),
            "\"pcm_s16le\""
        );
        let format: AudioFormat = serde_json::from_str("\"pcm_f32le\"").unwrap();
        assert_eq!(format, AudioFormat::PcmF32le);
    }
}
