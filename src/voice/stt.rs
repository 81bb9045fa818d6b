//! Speech-to-text (STT) processing
//!
//! Transcription is called from the capture and recognizer threads, not from
//! async code. The HTTP client is async and is driven on the session's tokio
//! runtime through a [`Handle`], which keeps every client inside the runtime
//! that owns it.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tokio::runtime::Handle;

use super::capture::samples_to_wav;
use crate::config::{SpeechConfig, SttProvider};
use crate::{Error, Result};

const WHISPER_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
const DEEPGRAM_URL: &str = "https://api.deepgram.com/v1/listen";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on one transcription request, upload to last body byte
pub const TRANSCRIBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Turns a finished utterance into text
pub trait Transcriber: Send + Sync {
    /// Transcribe mono samples in `[-1.0, 1.0]`
    ///
    /// Blocks the calling thread. Must not be called from async code.
    ///
    /// # Errors
    ///
    /// Returns error if encoding or the request fails
    fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<String>;
}

/// Response from OpenAI Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Response from Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// Transcribes speech with Whisper or Deepgram
pub struct CloudTranscriber {
    client: reqwest::Client,
    runtime: Handle,
    api_key: SecretString,
    model: String,
    provider: SttProvider,
    endpoint: String,
    timeout: Duration,
}

impl CloudTranscriber {
    /// Create a transcriber for `provider`
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing or the HTTP client cannot be built
    pub fn new(
        provider: SttProvider,
        api_key: &str,
        model: String,
        runtime: Handle,
    ) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(match provider {
                SttProvider::Whisper => "OpenAI API key required for Whisper".to_string(),
                SttProvider::Deepgram => "Deepgram API key required".to_string(),
            }));
        }

        let endpoint = match provider {
            SttProvider::Whisper => WHISPER_URL,
            SttProvider::Deepgram => DEEPGRAM_URL,
        };

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            runtime,
            api_key: SecretString::from(api_key.to_string()),
            model,
            provider,
            endpoint: endpoint.to_string(),
            timeout: TRANSCRIBE_TIMEOUT,
        })
    }

    /// Build from speech configuration, picking the key for the provider
    ///
    /// # Errors
    ///
    /// Returns error if the provider's API key is not configured
    pub fn from_config(config: &SpeechConfig, runtime: Handle) -> Result<Self> {
        let key = match config.stt_provider {
            SttProvider::Whisper => config.openai_api_key.as_ref(),
            SttProvider::Deepgram => config.deepgram_api_key.as_ref(),
        };
        let key = key.map(ExposeSecret::expose_secret).unwrap_or_default();
        Self::new(config.stt_provider, key, config.stt_model.clone(), runtime)
    }

    /// Send requests to `endpoint` instead of the provider's public URL
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Give up on a request after `timeout`
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn transcribe_wav(&self, audio: Vec<u8>) -> Result<String> {
        match self.provider {
            SttProvider::Whisper => self.transcribe_whisper(audio).await,
            SttProvider::Deepgram => self.transcribe_deepgram(audio).await,
        }
    }

    /// Transcribe using OpenAI Whisper
    async fn transcribe_whisper(&self, audio: Vec<u8>) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), "starting Whisper transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone());

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Whisper request failed"))?;

        let response = check_status("Whisper", response).await?;
        let result: WhisperResponse = response
            .json()
            .await
            .inspect_err(|e| tracing::error!(error = %e, "failed to parse response"))?;

        tracing::info!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }

    /// Transcribe using Deepgram
    async fn transcribe_deepgram(&self, audio: Vec<u8>) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), "starting Deepgram transcription");

        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("model", self.model.as_str()), ("punctuate", "true")])
            .header(
                "Authorization",
                format!("Token {}", self.api_key.expose_secret()),
            )
            .header("Content-Type", "audio/wav")
            .timeout(self.timeout)
            .body(audio)
            .send()
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Deepgram request failed"))?;

        let response = check_status("Deepgram", response).await?;
        let result: DeepgramResponse = response
            .json()
            .await
            .inspect_err(|e| tracing::error!(error = %e, "failed to parse Deepgram response"))?;

        let transcript = result
            .results
            .channels
            .into_iter()
            .next()
            .and_then(|c| c.alternatives.into_iter().next())
            .map(|a| a.transcript)
            .unwrap_or_default();

        tracing::info!(transcript = %transcript, "transcription complete");
        Ok(transcript)
    }
}

impl Transcriber for CloudTranscriber {
    fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<String> {
        let wav = samples_to_wav(samples, sample_rate)?;
        self.runtime.block_on(self.transcribe_wav(wav))
    }
}

/// Turn a non-success response into [`Error::Api`]
pub(crate) async fn check_status(
    service: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = response.status();
    tracing::debug!(status = %status, service, "received response");

    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    tracing::error!(status = %status, body = %body, service, "API error");
    Err(Error::Api {
        service,
        status: status.as_u16(),
        body,
    })
}
