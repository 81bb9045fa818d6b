//! Conversation state, turns and session flags

use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Phase of the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConversationState {
    /// Session not running
    #[default]
    Stopped,
    /// Waiting for the wake word
    WakeWordWait,
    /// Capturing the user's utterance
    Listening,
    /// Transcript received, query being dispatched
    Processing,
    /// Query sent, no reply text yet
    AiStreaming,
    /// Reply text arriving
    AiResponding,
    /// Reply complete, playback draining
    Speaking,
    /// Between turns of a continuous dialog
    ContinuousDialogWait,
}

impl ConversationState {
    /// Whether a wake word in this state interrupts an answer in progress
    #[must_use]
    pub const fn is_answering(self) -> bool {
        matches!(self, Self::AiStreaming | Self::AiResponding | Self::Speaking)
    }

    /// Whether reply text is still arriving
    #[must_use]
    pub const fn is_streaming(self) -> bool {
        matches!(self, Self::AiStreaming | Self::AiResponding)
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::WakeWordWait => "wake-word-wait",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::AiStreaming => "ai-streaming",
            Self::AiResponding => "ai-responding",
            Self::Speaking => "speaking",
            Self::ContinuousDialogWait => "continuous-dialog-wait",
        };
        f.write_str(name)
    }
}

/// One query and its reply
#[derive(Debug, Clone)]
pub struct Turn {
    /// Unique turn id
    pub id: Uuid,
    /// Transcript of the user's utterance, once recognized
    pub query: Option<String>,
    /// Reply text received so far
    pub response: String,
    /// When the turn started
    pub started_at: DateTime<Utc>,
}

impl Turn {
    /// Start a new turn now
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            query: None,
            response: String::new(),
            started_at: Utc::now(),
        }
    }

    /// Milliseconds since the turn started
    #[must_use]
    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }
}

impl Default for Turn {
    fn default() -> Self {
        Self::new()
    }
}

/// Dialog mode flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    /// User preference: keep listening after each reply
    pub continuous_dialog_enabled: bool,
    /// Whether the current turn was entered without a wake word
    pub is_continuous_dialog_mode: bool,
}
