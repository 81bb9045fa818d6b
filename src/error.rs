//! Error types for hark

use thiserror::Error;

/// Result type alias for hark operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in hark
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio capture or playback device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Microphone or service permission was refused
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Speech recognition error
    #[error("recognition error: {0}")]
    Recognition(String),

    /// Streaming text service error
    #[error("stream error: {0}")]
    Stream(String),

    /// Speech synthesis error for a single unit
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Wake word engine error
    #[error("wake word error: {0}")]
    WakeWord(String),

    /// Speech-to-text API error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech API error
    #[error("TTS error: {0}")]
    Tts(String),

    /// A speech API answered with a non-success status
    #[error("{service} API error {status}: {body}")]
    Api {
        service: &'static str,
        status: u16,
        body: String,
    },

    /// The session control loop is gone
    #[error("session closed")]
    SessionClosed,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
