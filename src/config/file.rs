//! TOML configuration file loading
//!
//! Supports `~/.config/hark/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::PathBuf;

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct HarkConfigFile {
    /// Wake word engine configuration
    #[serde(default)]
    pub wake: WakeFileConfig,

    /// Microphone framing
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Turn sequencing
    #[serde(default)]
    pub dialog: DialogFileConfig,

    /// Sentence segmentation
    #[serde(default)]
    pub segmenter: SegmenterFileConfig,

    /// Streaming text service
    #[serde(default)]
    pub stream: StreamFileConfig,

    /// STT/TTS backends
    #[serde(default)]
    pub speech: SpeechFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Wake word configuration
#[derive(Debug, Default, Deserialize)]
pub struct WakeFileConfig {
    /// "local" or "push-to-talk"
    pub engine: Option<String>,

    /// Wake phrases (e.g. `["hey hark"]`)
    pub phrases: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    pub sample_rate: Option<u32>,
    pub frame_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DialogFileConfig {
    /// Keep listening after each reply without a new wake word
    pub continuous_dialog: Option<bool>,
    pub grace_delay_ms: Option<u64>,
    pub retry_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SegmenterFileConfig {
    pub max_chars: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub tick_ms: Option<u64>,
}

/// Streaming text service configuration
#[derive(Debug, Default, Deserialize)]
pub struct StreamFileConfig {
    /// Chat endpoint URL
    pub url: Option<String>,

    /// Session cookie (prefer `HARK_STREAM_COOKIE`)
    pub cookie: Option<String>,

    pub model: Option<String>,
    pub chat_model_id: Option<String>,
    pub agent_id: Option<String>,
    pub plugin: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
}

/// Speech recognition/synthesis configuration
#[derive(Debug, Default, Deserialize)]
pub struct SpeechFileConfig {
    /// "whisper" or "deepgram"
    pub stt_provider: Option<String>,

    /// STT model (e.g. "whisper-1")
    pub stt_model: Option<String>,

    /// "openai", "elevenlabs" or "console"
    pub tts_provider: Option<String>,

    /// TTS model (e.g. "tts-1")
    pub tts_model: Option<String>,

    /// TTS voice identifier (e.g. "alloy")
    pub tts_voice: Option<String>,

    /// TTS speed multiplier
    pub tts_speed: Option<f32>,

    pub speech_timeout_secs: Option<u64>,
    pub end_silence_ms: Option<u64>,
    pub max_utterance_secs: Option<u64>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub deepgram: Option<String>,
    pub elevenlabs: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `HarkConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> HarkConfigFile {
    let Some(path) = config_file_path() else {
        return HarkConfigFile::default();
    };

    if !path.exists() {
        return HarkConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                HarkConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            HarkConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/hark/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("hark").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let file: HarkConfigFile = toml::from_str("").unwrap();
        assert!(file.wake.engine.is_none());
        assert!(file.stream.url.is_none());
    }

    #[test]
    fn partial_sections_parse() {
        let file: HarkConfigFile = toml::from_str(
            r#"
            [segmenter]
            max_chars = 200

            [speech]
            tts_provider = "console"
            "#,
        )
        .unwrap();
        assert_eq!(file.segmenter.max_chars, Some(200));
        assert!(file.segmenter.timeout_ms.is_none());
        assert_eq!(file.speech.tts_provider.as_deref(), Some("console"));
    }
}
