//! Keyword spotting over transcribed speech segments
//!
//! The spotter gates audio with an energy detector, transcribes each
//! completed segment and reports a keyword when the transcript contains one
//! of the configured wake phrases.

use std::collections::VecDeque;
use std::sync::Arc;

use super::stt::Transcriber;
use super::vad::{DetectorState, UtteranceDetector, VadConfig};

/// Outcome of the last [`KeywordSpotter::decode`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpotterResult {
    /// The phrase that matched, empty when nothing did
    pub keyword: String,
}

/// Streaming keyword detector fed one frame at a time
///
/// A spotter may buffer internally: after `accept_frame`, call `decode`
/// while `is_ready` holds and inspect `result` after each decode.
pub trait KeywordSpotter: Send {
    /// Feed one frame of samples in `[-1.0, 1.0]`
    fn accept_frame(&mut self, samples: &[f32]);

    /// Whether buffered audio is waiting to be decoded
    fn is_ready(&self) -> bool;

    /// Decode the next buffered chunk
    fn decode(&mut self);

    /// Result of the last decode
    fn result(&self) -> SpotterResult;

    /// Drop all buffered audio and state
    fn reset(&mut self);
}

/// Spots wake phrases by transcribing speech segments
pub struct TranscriptSpotter {
    detector: UtteranceDetector,
    transcriber: Arc<dyn Transcriber>,
    phrases: Vec<String>,
    sample_rate: u32,
    segments: VecDeque<Vec<f32>>,
    keyword: String,
}

impl TranscriptSpotter {
    /// Create a spotter for `phrases`
    pub fn new(phrases: &[String], transcriber: Arc<dyn Transcriber>, sample_rate: u32) -> Self {
        let phrases: Vec<String> = phrases
            .iter()
            .map(|p| normalize(p))
            .filter(|p| !p.is_empty())
            .collect();

        tracing::debug!(phrases = ?phrases, "keyword spotter initialized");

        Self {
            detector: UtteranceDetector::new(VadConfig::default(), sample_rate),
            transcriber,
            phrases,
            sample_rate,
            segments: VecDeque::new(),
            keyword: String::new(),
        }
    }

    /// Get the configured wake phrases, normalized
    #[must_use]
    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }

    /// Find the wake phrase contained in `transcript`, if any
    #[must_use]
    pub fn match_phrase(&self, transcript: &str) -> Option<&str> {
        let normalized = format!(" {} ", normalize(transcript));
        self.phrases
            .iter()
            .find(|phrase| normalized.contains(&format!(" {phrase} ")))
            .map(String::as_str)
    }
}

impl KeywordSpotter for TranscriptSpotter {
    fn accept_frame(&mut self, samples: &[f32]) {
        if self.detector.process(samples) == DetectorState::Complete {
            let segment = self.detector.take_utterance();
            tracing::trace!(samples = segment.len(), "speech segment queued");
            self.segments.push_back(segment);
        }
    }

    fn is_ready(&self) -> bool {
        !self.segments.is_empty()
    }

    fn decode(&mut self) {
        self.keyword.clear();
        let Some(segment) = self.segments.pop_front() else {
            return;
        };

        match self.transcriber.transcribe(&segment, self.sample_rate) {
            Ok(transcript) => {
                if let Some(phrase) = self.match_phrase(&transcript) {
                    tracing::info!(wake_word = phrase, transcript, "wake word detected");
                    self.keyword = phrase.to_string();
                } else {
                    tracing::debug!(transcript, "no wake word in segment");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "wake word transcription failed");
            }
        }
    }

    fn result(&self) -> SpotterResult {
        SpotterResult {
            keyword: self.keyword.clone(),
        }
    }

    fn reset(&mut self) {
        self.detector.reset();
        self.segments.clear();
        self.keyword.clear();
    }
}

/// Lowercase, strip punctuation and collapse whitespace
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
