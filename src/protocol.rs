use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages exchanged between peers in a room.
///
/// The serialized shape is the wire contract: adjacently tagged JSON with
/// snake_case type names (`speedChange` is the historical exception) and
/// camelCase payload fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum Message {
    /// "Load this media and adopt this state." Sent on local load, on
    /// peer-connect while synced, and as the answer to `request_video_info`.
    VideoInfo {
        media_id: String,
        position_seconds: f64,
        rate: f64,
        paused: bool,
    },
    /// "Tell me the current media and state." Sent by a newly joined peer
    /// once its player signals readiness.
    RequestVideoInfo,
    Play,
    Pause,
    /// Local position moved past the drift threshold outside a suppression
    /// window.
    Seek { position_seconds: f64 },
    #[serde(rename = "speedChange")]
    SpeedChange { rate: f64 },
    Chat {
        sender: String,
        content: String,
        timestamp: u64,
    },
    ChatHistory { messages: Vec<ChatMessage> },
}

/// One entry in the replicated chat log. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: String,
    pub content: String,
    /// Unix milliseconds at the author.
    pub timestamp: u64,
}

/// The single piece of shared state the sync engine converges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub media_id: Option<String>,
    pub position_seconds: f64,
    pub rate: f64,
    pub paused: bool,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            media_id: None,
            position_seconds: 0.0,
            rate: 1.0,
            paused: true,
        }
    }
}

/// Opaque transport-assigned peer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Determined at join time; a tie-break input, never a privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Guest,
}
