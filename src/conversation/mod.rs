//! Conversation control
//!
//! The state machine tying wake word, recognition, the streaming reply and
//! playback into turns, with barge-in and continuous dialog.

mod events;
mod orchestrator;
mod state;

pub use events::{Event, Update};
pub use orchestrator::{Collaborators, Orchestrator, SessionHandle};
pub use state::{ConversationState, SessionFlags, Turn};
