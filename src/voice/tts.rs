//! Text-to-speech (TTS) processing
//!
//! A synthesizer speaks one utterance at a time. `speak` returns as soon as
//! the utterance is accepted; completion is observed by polling
//! `is_speaking`. `interrupt` cuts off whatever is playing or pending.

use std::io::Write;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use secrecy::{ExposeSecret, SecretString};
use tokio::runtime::Handle;

use super::playback::AudioPlayback;
use super::stt::check_status;
use crate::config::{SpeechConfig, TtsProvider};
use crate::{Error, Result};

const OPENAI_TTS_URL: &str = "https://api.openai.com/v1/audio/speech";
const ELEVENLABS_TTS_URL: &str = "https://api.elevenlabs.io/v1/text-to-speech";
const ELEVENLABS_DEFAULT_MODEL: &str = "eleven_monolingual_v1";

/// Voice output engine
pub trait SpeechSynthesizer: Send + Sync {
    /// Start speaking `text`, interrupting anything already playing
    ///
    /// Returns once the utterance is accepted. `is_speaking` reports true
    /// from then until it finishes or is interrupted.
    ///
    /// # Errors
    ///
    /// Returns error if the utterance cannot be accepted
    fn speak(&self, text: &str) -> Result<()>;

    /// Whether an utterance is playing or about to play
    fn is_speaking(&self) -> bool;

    /// Stop the current utterance immediately
    fn interrupt(&self);
}

/// Utterance bookkeeping shared with the speaker thread
///
/// Every `speak` and `interrupt` starts a new generation. The speaker thread
/// only clears `speaking` for the generation it was working on, so a late
/// finish never hides a newer utterance.
#[derive(Debug, Default)]
struct Utterances {
    state: Mutex<UtteranceState>,
}

#[derive(Debug, Default)]
struct UtteranceState {
    generation: u64,
    speaking: bool,
}

impl Utterances {
    fn lock(&self) -> MutexGuard<'_, UtteranceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) -> u64 {
        let mut state = self.lock();
        state.generation += 1;
        state.speaking = true;
        state.generation
    }

    fn cancel(&self) {
        let mut state = self.lock();
        state.generation += 1;
        state.speaking = false;
    }

    fn finish(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation == generation {
            state.speaking = false;
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn is_speaking(&self) -> bool {
        self.lock().speaking
    }
}

/// Which remote voice to use
#[derive(Debug, Clone)]
pub struct VoiceSettings {
    /// `OpenAi` or `ElevenLabs`
    pub provider: TtsProvider,
    /// Model identifier
    pub model: String,
    /// Voice name or `ElevenLabs` voice id
    pub voice: String,
    /// Speed multiplier (`OpenAI` only)
    pub speed: f32,
}

/// Fetches speech audio over HTTP
struct VoiceClient {
    client: reqwest::Client,
    api_key: SecretString,
    settings: VoiceSettings,
    endpoint: String,
}

impl VoiceClient {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        match self.settings.provider {
            TtsProvider::ElevenLabs => self.synthesize_elevenlabs(text).await,
            TtsProvider::OpenAi | TtsProvider::Console => self.synthesize_openai(text).await,
        }
    }

    /// Synthesize using OpenAI TTS
    async fn synthesize_openai(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
        }

        let request = TtsRequest {
            model: &self.settings.model,
            input: text,
            voice: &self.settings.voice,
            speed: self.settings.speed,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        let response = check_status("OpenAI TTS", response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Synthesize using ElevenLabs TTS
    async fn synthesize_elevenlabs(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.settings.voice
        );

        let request = ElevenLabsRequest {
            text,
            model_id: &self.settings.model,
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        let response = check_status("ElevenLabs TTS", response).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

struct Job {
    text: String,
    generation: u64,
}

/// Speaks through `OpenAI` or `ElevenLabs` on the default output device
///
/// Fetching, decoding and playback happen on a dedicated speaker thread.
pub struct CloudSynthesizer {
    utterances: Arc<Utterances>,
    jobs: Mutex<mpsc::Sender<Job>>,
}

impl CloudSynthesizer {
    /// Create a synthesizer
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing or the speaker thread cannot start
    pub fn new(settings: VoiceSettings, api_key: &str, runtime: Handle) -> Result<Self> {
        let endpoint = match settings.provider {
            TtsProvider::OpenAi => OPENAI_TTS_URL,
            TtsProvider::ElevenLabs => ELEVENLABS_TTS_URL,
            TtsProvider::Console => {
                return Err(Error::Config(
                    "console voice has no cloud synthesizer".to_string(),
                ));
            }
        };
        Self::with_endpoint(settings, api_key, endpoint, runtime)
    }

    /// Create a synthesizer that posts to `endpoint`
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing or the speaker thread cannot start
    pub fn with_endpoint(
        settings: VoiceSettings,
        api_key: &str,
        endpoint: &str,
        runtime: Handle,
    ) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(match settings.provider {
                TtsProvider::ElevenLabs => "ElevenLabs API key required for TTS".to_string(),
                _ => "OpenAI API key required for TTS".to_string(),
            }));
        }

        let voice = VoiceClient {
            client: reqwest::Client::new(),
            api_key: SecretString::from(api_key.to_string()),
            settings,
            endpoint: endpoint.to_string(),
        };

        let utterances = Arc::new(Utterances::default());
        let (tx, rx) = mpsc::channel();
        let shared = Arc::clone(&utterances);

        std::thread::Builder::new()
            .name("hark-speaker".to_string())
            .spawn(move || speaker(&rx, &voice, &shared, &runtime))?;

        Ok(Self {
            utterances,
            jobs: Mutex::new(tx),
        })
    }

    /// Build from speech configuration
    ///
    /// # Errors
    ///
    /// Returns error if the provider's API key is not configured
    pub fn from_config(config: &SpeechConfig, runtime: Handle) -> Result<Self> {
        let (key, model) = match config.tts_provider {
            TtsProvider::ElevenLabs => (
                config.elevenlabs_api_key.as_ref(),
                if config.tts_model == "tts-1" {
                    ELEVENLABS_DEFAULT_MODEL.to_string()
                } else {
                    config.tts_model.clone()
                },
            ),
            _ => (config.openai_api_key.as_ref(), config.tts_model.clone()),
        };
        let key = key.map(ExposeSecret::expose_secret).unwrap_or_default();

        let settings = VoiceSettings {
            provider: config.tts_provider,
            model,
            voice: config.tts_voice.clone(),
            speed: config.tts_speed,
        };
        Self::new(settings, key, runtime)
    }
}

impl SpeechSynthesizer for CloudSynthesizer {
    fn speak(&self, text: &str) -> Result<()> {
        let generation = self.utterances.begin();
        let job = Job {
            text: text.to_string(),
            generation,
        };

        let sent = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(job);

        if sent.is_err() {
            self.utterances.finish(generation);
            return Err(Error::Synthesis("speaker thread has exited".to_string()));
        }
        Ok(())
    }

    fn is_speaking(&self) -> bool {
        self.utterances.is_speaking()
    }

    fn interrupt(&self) {
        self.utterances.cancel();
    }
}

/// Speaker thread: fetch, decode and play jobs until the sender is dropped
fn speaker(rx: &mpsc::Receiver<Job>, voice: &VoiceClient, utterances: &Utterances, runtime: &Handle) {
    let mut playback: Option<AudioPlayback> = None;

    while let Ok(job) = rx.recv() {
        if !utterances.is_current(job.generation) {
            continue;
        }

        let result = runtime
            .block_on(voice.synthesize(&job.text))
            .and_then(|audio| {
                if !utterances.is_current(job.generation) {
                    return Ok(());
                }
                if playback.is_none() {
                    playback = Some(AudioPlayback::new()?);
                }
                match playback.as_ref() {
                    Some(device) => {
                        device.play_mp3(&audio, || !utterances.is_current(job.generation))
                    }
                    None => Ok(()),
                }
            });

        if let Err(e) = result {
            tracing::warn!(error = %e, text = %job.text, "speech synthesis failed");
            // Reopen the device next time in case it went away
            playback = None;
        }
        utterances.finish(job.generation);
    }

    tracing::debug!("speaker thread exited");
}

/// Prints units instead of speaking them
///
/// Speaking time is simulated from the text length so turn timing behaves
/// like a real voice.
pub struct ConsoleSynthesizer {
    per_char: Duration,
    speaking_until: Mutex<Option<Instant>>,
}

impl ConsoleSynthesizer {
    /// Create a console voice taking `per_char` per character
    #[must_use]
    pub const fn new(per_char: Duration) -> Self {
        Self {
            per_char,
            speaking_until: Mutex::new(None),
        }
    }
}

impl Default for ConsoleSynthesizer {
    fn default() -> Self {
        Self::new(Duration::from_millis(40))
    }
}

impl SpeechSynthesizer for ConsoleSynthesizer {
    fn speak(&self, text: &str) -> Result<()> {
        let chars = u32::try_from(text.chars().count()).unwrap_or(u32::MAX);
        {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "🔊 {text}")?;
        }
        *self
            .speaking_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now() + self.per_char * chars);
        Ok(())
    }

    fn is_speaking(&self) -> bool {
        self.speaking_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|until| Instant::now() < until)
    }

    fn interrupt(&self) {
        *self
            .speaking_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}
