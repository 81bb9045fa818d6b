//! Configuration management for hark
//!
//! Values are layered: built-in defaults, then the TOML config file, then
//! environment variables. CLI flags are applied last by the binary.

pub mod file;

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;

use crate::{Error, Result};

use self::file::HarkConfigFile;

/// Default streaming chat endpoint
pub const DEFAULT_STREAM_URL: &str =
    "https://yuanbao.tencent.com/api/chat/1859758a-1c39-4d37-8ce5-92a38edf70a0";

/// hark runtime configuration
#[derive(Debug)]
pub struct Config {
    /// Wake word engine selection
    pub wake: WakeConfig,

    /// Microphone framing
    pub audio: AudioConfig,

    /// Turn sequencing and continuous dialog
    pub dialog: DialogConfig,

    /// Sentence segmentation bounds
    pub segmenter: SegmenterConfig,

    /// Streaming text service
    pub stream: StreamConfig,

    /// Speech recognition and synthesis backends
    pub speech: SpeechConfig,
}

/// Which wake word backend drives the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WakeEngineKind {
    /// In-process capture loop feeding a keyword spotter
    #[default]
    LocalModel,
    /// Press Enter to wake
    PushToTalk,
}

impl WakeEngineKind {
    /// Parse an engine name from config or env
    ///
    /// # Errors
    ///
    /// Returns error for an unknown engine name
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "local" | "local-model" | "kws" => Ok(Self::LocalModel),
            "push-to-talk" | "ptt" => Ok(Self::PushToTalk),
            other => Err(Error::Config(format!("unknown wake engine: {other}"))),
        }
    }
}

/// Wake word configuration
#[derive(Debug, Clone)]
pub struct WakeConfig {
    /// Engine variant
    pub engine: WakeEngineKind,

    /// Phrases that count as a wake word (matched case-insensitively)
    pub phrases: Vec<String>,
}

/// Audio framing configuration
#[derive(Debug, Clone, Copy)]
pub struct AudioConfig {
    /// Capture sample rate in Hz
    pub sample_rate: u32,

    /// Duration of one capture frame
    pub frame: Duration,
}

impl AudioConfig {
    /// Number of samples in one frame
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn frame_len(&self) -> usize {
        (self.sample_rate as u128 * self.frame.as_millis() / 1000) as usize
    }
}

/// Dialog sequencing configuration
#[derive(Debug, Clone, Copy)]
pub struct DialogConfig {
    /// Re-enter listening after a reply without a new wake word
    pub continuous_dialog: bool,

    /// Pause between the end of playback and the next turn
    pub grace_delay: Duration,

    /// Pause before retrying after a recoverable recognition error
    pub retry_delay: Duration,
}

/// Sentence segmenter bounds
#[derive(Debug, Clone, Copy)]
pub struct SegmenterConfig {
    /// Emit an unterminated buffer once it reaches this many characters
    pub max_chars: usize,

    /// Emit an unterminated buffer after this long without new text
    pub timeout: Duration,

    /// How often the timeout is re-evaluated
    pub tick: Duration,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            max_chars: 1000,
            timeout: Duration::from_millis(1000),
            tick: Duration::from_millis(100),
        }
    }
}

/// Streaming text service configuration
#[derive(Debug)]
pub struct StreamConfig {
    /// Chat endpoint URL
    pub url: String,

    /// Session cookie sent with every request
    pub cookie: Option<SecretString>,

    /// Model identifier
    pub model: String,

    /// Chat model identifier
    pub chat_model_id: String,

    /// Agent identifier
    pub agent_id: String,

    /// Plugin mode
    pub plugin: String,

    /// TCP/TLS connect timeout
    pub connect_timeout: Duration,

    /// Maximum gap between body reads
    pub read_timeout: Duration,
}

/// STT backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SttProvider {
    /// `OpenAI` Whisper
    #[default]
    Whisper,
    /// Deepgram
    Deepgram,
}

/// TTS backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TtsProvider {
    /// `OpenAI` speech
    #[default]
    OpenAi,
    /// `ElevenLabs`
    ElevenLabs,
    /// Print to stdout instead of speaking
    Console,
}

/// Speech recognition and synthesis configuration
#[derive(Debug)]
pub struct SpeechConfig {
    /// STT backend
    pub stt_provider: SttProvider,

    /// STT model (e.g. "whisper-1", "nova-2")
    pub stt_model: String,

    /// TTS backend
    pub tts_provider: TtsProvider,

    /// TTS model (e.g. "tts-1")
    pub tts_model: String,

    /// TTS voice identifier
    pub tts_voice: String,

    /// TTS speed multiplier
    pub tts_speed: f32,

    /// Give up listening if no speech starts within this window
    pub speech_timeout: Duration,

    /// Trailing silence that ends an utterance
    pub end_silence: Duration,

    /// Hard cap on one utterance
    pub max_utterance: Duration,

    /// `OpenAI` API key
    pub openai_api_key: Option<SecretString>,

    /// Deepgram API key
    pub deepgram_api_key: Option<SecretString>,

    /// `ElevenLabs` API key
    pub elevenlabs_api_key: Option<SecretString>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wake: WakeConfig {
                engine: WakeEngineKind::LocalModel,
                phrases: vec!["hey hark".to_string()],
            },
            audio: AudioConfig {
                sample_rate: 16000,
                frame: Duration::from_millis(100),
            },
            dialog: DialogConfig {
                continuous_dialog: true,
                grace_delay: Duration::from_millis(300),
                retry_delay: Duration::from_millis(1000),
            },
            segmenter: SegmenterConfig::default(),
            stream: StreamConfig {
                url: DEFAULT_STREAM_URL.to_string(),
                cookie: None,
                model: "gpt_175B_0404".to_string(),
                chat_model_id: "deep_seek_v3".to_string(),
                agent_id: "naQivTmsDa".to_string(),
                plugin: "Adaptive".to_string(),
                connect_timeout: Duration::from_secs(10),
                read_timeout: Duration::from_secs(30),
            },
            speech: SpeechConfig {
                stt_provider: SttProvider::Whisper,
                stt_model: "whisper-1".to_string(),
                tts_provider: TtsProvider::OpenAi,
                tts_model: "tts-1".to_string(),
                tts_voice: "alloy".to_string(),
                tts_speed: 1.1,
                speech_timeout: Duration::from_secs(5),
                end_silence: Duration::from_millis(800),
                max_utterance: Duration::from_secs(15),
                openai_api_key: None,
                deepgram_api_key: None,
                elevenlabs_api_key: None,
            },
        }
    }
}

impl Config {
    /// Load configuration from the default file location and environment
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is invalid
    pub fn load() -> Result<Self> {
        let file = file::load_config_file();
        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    /// Load configuration from an explicit file path and environment
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed, or a value is invalid
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: HarkConfigFile = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "loaded config file");
        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file overlaid with an env lookup
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is invalid
    pub fn from_sources<F>(file: HarkConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        config.apply_file(file)?;
        config.apply_env(&env)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: HarkConfigFile) -> Result<()> {
        if let Some(engine) = file.wake.engine {
            self.wake.engine = WakeEngineKind::parse(&engine)?;
        }
        if let Some(phrases) = file.wake.phrases {
            self.wake.phrases = phrases;
        }

        if let Some(rate) = file.audio.sample_rate {
            self.audio.sample_rate = rate;
        }
        if let Some(ms) = file.audio.frame_ms {
            self.audio.frame = Duration::from_millis(ms);
        }

        if let Some(enabled) = file.dialog.continuous_dialog {
            self.dialog.continuous_dialog = enabled;
        }
        if let Some(ms) = file.dialog.grace_delay_ms {
            self.dialog.grace_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = file.dialog.retry_delay_ms {
            self.dialog.retry_delay = Duration::from_millis(ms);
        }

        if let Some(max) = file.segmenter.max_chars {
            self.segmenter.max_chars = max;
        }
        if let Some(ms) = file.segmenter.timeout_ms {
            self.segmenter.timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.segmenter.tick_ms {
            self.segmenter.tick = Duration::from_millis(ms);
        }

        let stream = file.stream;
        if let Some(url) = stream.url {
            self.stream.url = url;
        }
        if let Some(cookie) = stream.cookie {
            self.stream.cookie = Some(SecretString::from(cookie));
        }
        if let Some(model) = stream.model {
            self.stream.model = model;
        }
        if let Some(id) = stream.chat_model_id {
            self.stream.chat_model_id = id;
        }
        if let Some(id) = stream.agent_id {
            self.stream.agent_id = id;
        }
        if let Some(plugin) = stream.plugin {
            self.stream.plugin = plugin;
        }
        if let Some(secs) = stream.connect_timeout_secs {
            self.stream.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = stream.read_timeout_secs {
            self.stream.read_timeout = Duration::from_secs(secs);
        }

        let speech = file.speech;
        if let Some(provider) = speech.stt_provider {
            self.speech.stt_provider = parse_stt_provider(&provider)?;
        }
        if let Some(model) = speech.stt_model {
            self.speech.stt_model = model;
        }
        if let Some(provider) = speech.tts_provider {
            self.speech.tts_provider = parse_tts_provider(&provider)?;
        }
        if let Some(model) = speech.tts_model {
            self.speech.tts_model = model;
        }
        if let Some(voice) = speech.tts_voice {
            self.speech.tts_voice = voice;
        }
        if let Some(speed) = speech.tts_speed {
            self.speech.tts_speed = speed;
        }
        if let Some(secs) = speech.speech_timeout_secs {
            self.speech.speech_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = speech.end_silence_ms {
            self.speech.end_silence = Duration::from_millis(ms);
        }
        if let Some(secs) = speech.max_utterance_secs {
            self.speech.max_utterance = Duration::from_secs(secs);
        }

        let keys = file.api_keys;
        if let Some(key) = keys.openai {
            self.speech.openai_api_key = Some(SecretString::from(key));
        }
        if let Some(key) = keys.deepgram {
            self.speech.deepgram_api_key = Some(SecretString::from(key));
        }
        if let Some(key) = keys.elevenlabs {
            self.speech.elevenlabs_api_key = Some(SecretString::from(key));
        }

        Ok(())
    }

    fn apply_env<F>(&mut self, env: &F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(engine) = env("HARK_WAKE_ENGINE") {
            self.wake.engine = WakeEngineKind::parse(&engine)?;
        }
        if let Some(phrases) = env("HARK_WAKE_WORDS") {
            self.wake.phrases = phrases
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = env("HARK_CONTINUOUS_DIALOG") {
            self.dialog.continuous_dialog = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(url) = env("HARK_STREAM_URL") {
            self.stream.url = url;
        }
        if let Some(cookie) = env("HARK_STREAM_COOKIE") {
            self.stream.cookie = Some(SecretString::from(cookie));
        }
        if let Some(model) = env("HARK_STT_MODEL") {
            self.speech.stt_model = model;
        }
        if let Some(provider) = env("HARK_STT_PROVIDER") {
            self.speech.stt_provider = parse_stt_provider(&provider)?;
        }
        if let Some(model) = env("HARK_TTS_MODEL") {
            self.speech.tts_model = model;
        }
        if let Some(provider) = env("HARK_TTS_PROVIDER") {
            self.speech.tts_provider = parse_tts_provider(&provider)?;
        }
        if let Some(voice) = env("HARK_TTS_VOICE") {
            self.speech.tts_voice = voice;
        }
        if let Some(key) = env("OPENAI_API_KEY") {
            self.speech.openai_api_key = Some(SecretString::from(key));
        }
        if let Some(key) = env("DEEPGRAM_API_KEY") {
            self.speech.deepgram_api_key = Some(SecretString::from(key));
        }
        if let Some(key) = env("ELEVENLABS_API_KEY") {
            self.speech.elevenlabs_api_key = Some(SecretString::from(key));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.wake.engine == WakeEngineKind::LocalModel && self.wake.phrases.is_empty() {
            return Err(Error::Config(
                "wake.phrases required for the local wake engine".to_string(),
            ));
        }
        if self.audio.sample_rate == 0 || self.audio.frame_len() == 0 {
            return Err(Error::Config("audio frame must hold at least one sample".to_string()));
        }
        if self.segmenter.max_chars == 0 {
            return Err(Error::Config("segmenter.max_chars must be positive".to_string()));
        }
        if self.segmenter.tick.is_zero() {
            return Err(Error::Config("segmenter.tick_ms must be positive".to_string()));
        }
        Ok(())
    }
}

fn parse_stt_provider(s: &str) -> Result<SttProvider> {
    match s.trim().to_lowercase().as_str() {
        "whisper" | "openai" => Ok(SttProvider::Whisper),
        "deepgram" => Ok(SttProvider::Deepgram),
        other => Err(Error::Config(format!("unknown STT provider: {other}"))),
    }
}

fn parse_tts_provider(s: &str) -> Result<TtsProvider> {
    match s.trim().to_lowercase().as_str() {
        "openai" => Ok(TtsProvider::OpenAi),
        "elevenlabs" => Ok(TtsProvider::ElevenLabs),
        "console" => Ok(TtsProvider::Console),
        other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
    }
}
