//! Energy-based voice activity detection
//!
//! Splits a sample stream into utterances: speech starts when a frame's RMS
//! energy crosses a threshold and ends after a run of quiet frames.

use std::time::Duration;

/// Minimum audio energy threshold to consider speech
pub const ENERGY_THRESHOLD: f32 = 0.03;

/// Minimum duration of speech worth keeping
const MIN_SPEECH: Duration = Duration::from_millis(300);

/// Silence duration to consider end of utterance
const END_SILENCE: Duration = Duration::from_millis(500);

/// State of the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// Waiting for speech
    Idle,
    /// Speech started, accumulating
    Speaking,
    /// Enough speech followed by enough silence; utterance ready
    Complete,
}

/// Detector thresholds
#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    /// RMS energy above which a frame counts as speech
    pub threshold: f32,
    /// Shortest utterance that completes; shorter bursts are discarded
    pub min_speech: Duration,
    /// Trailing silence that ends an utterance
    pub end_silence: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: ENERGY_THRESHOLD,
            min_speech: MIN_SPEECH,
            end_silence: END_SILENCE,
        }
    }
}

/// Accumulates one utterance at a time
#[derive(Debug)]
pub struct UtteranceDetector {
    threshold: f32,
    min_speech_samples: usize,
    end_silence_samples: usize,
    state: DetectorState,
    buffer: Vec<f32>,
    silence_counter: usize,
}

impl UtteranceDetector {
    /// Create a detector for audio at `sample_rate`
    #[must_use]
    pub fn new(config: VadConfig, sample_rate: u32) -> Self {
        Self {
            threshold: config.threshold,
            min_speech_samples: samples_in(config.min_speech, sample_rate),
            end_silence_samples: samples_in(config.end_silence, sample_rate),
            state: DetectorState::Idle,
            buffer: Vec::new(),
            silence_counter: 0,
        }
    }

    /// Feed samples and return the resulting state
    pub fn process(&mut self, samples: &[f32]) -> DetectorState {
        let energy = rms(samples);
        let is_speech = energy > self.threshold;

        match self.state {
            DetectorState::Idle => {
                if is_speech {
                    self.state = DetectorState::Speaking;
                    self.buffer.clear();
                    self.buffer.extend_from_slice(samples);
                    self.silence_counter = 0;
                    tracing::trace!(energy, "speech detected");
                }
            }
            DetectorState::Speaking => {
                self.buffer.extend_from_slice(samples);

                if is_speech {
                    self.silence_counter = 0;
                } else {
                    self.silence_counter += samples.len();
                }

                if self.silence_counter > self.end_silence_samples
                    && self.buffer.len() > self.min_speech_samples + self.silence_counter
                {
                    tracing::debug!(samples = self.buffer.len(), "utterance complete");
                    self.state = DetectorState::Complete;
                } else if self.silence_counter > self.end_silence_samples {
                    // Too much silence without enough speech
                    tracing::trace!("speech too short, resetting");
                    self.reset();
                }
            }
            DetectorState::Complete => {}
        }

        self.state
    }

    /// Take the completed utterance and return to idle
    pub fn take_utterance(&mut self) -> Vec<f32> {
        let samples = std::mem::take(&mut self.buffer);
        self.reset();
        samples
    }

    /// Whether speech has started
    #[must_use]
    pub fn in_speech(&self) -> bool {
        self.state != DetectorState::Idle
    }

    /// Samples accumulated so far
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Get current state
    #[must_use]
    pub const fn state(&self) -> DetectorState {
        self.state
    }

    /// Reset detector to idle state
    pub fn reset(&mut self) {
        self.state = DetectorState::Idle;
        self.buffer.clear();
        self.silence_counter = 0;
    }
}

#[allow(clippy::cast_possible_truncation)]
fn samples_in(duration: Duration, sample_rate: u32) -> usize {
    (u128::from(sample_rate) * duration.as_millis() / 1000) as usize
}

/// Calculate RMS energy of audio samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
