//! Hark - hands-free voice conversation with a streaming AI service
//!
//! A session waits for a wake word, records the user's question, sends the
//! transcript to a streaming chat endpoint and speaks the reply sentence by
//! sentence while it is still arriving. Saying the wake word during an
//! answer cuts it off and starts a new question. With continuous dialog
//! enabled the session listens again after each answer without waiting for
//! the wake word.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Orchestrator                       │
//! │   state machine  │  event loop  │  segmenter tick   │
//! └──────┬──────────────┬──────────────┬───────────┬────┘
//!        │              │              │           │
//! ┌──────▼─────┐ ┌──────▼─────┐ ┌──────▼─────┐ ┌───▼────────┐
//! │ Wake word  │ │ Recognizer │ │  Streaming │ │  Playback  │
//! │ capture    │ │ VAD + STT  │ │  text      │ │  queue     │
//! └──────┬─────┘ └──────┬─────┘ └────────────┘ └───┬────────┘
//!        │              │                          │
//! ┌──────▼──────────────▼─────┐             ┌──────▼─────┐
//! │        Microphone         │             │    TTS     │
//! └───────────────────────────┘             └────────────┘
//! ```

pub mod config;
pub mod conversation;
pub mod error;
pub mod stream;
pub mod voice;

pub use config::Config;
pub use conversation::{Collaborators, ConversationState, Orchestrator, SessionHandle};
pub use error::{Error, Result};
