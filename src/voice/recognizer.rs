//! One-shot speech recognition
//!
//! A recognizer captures a single utterance, transcribes it and reports the
//! outcome through a sink: a final transcript or an error code.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::capture::{AudioFrameSource, pcm_to_f32};
use super::stt::Transcriber;
use super::vad::{DetectorState, UtteranceDetector, VadConfig};
use crate::config::SpeechConfig;
use crate::{Error, Result};

/// Error codes a recognizer reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionErrorCode {
    /// Audio recording failed
    Audio,
    /// Microphone or service access was refused
    InsufficientPermissions,
    /// The recognition service did not answer in time
    NetworkTimeout,
    /// The recognition service could not be reached
    Network,
    /// Speech was heard but nothing was recognized
    NoMatch,
    /// The caller cancelled the request
    Client,
    /// The service is overloaded
    Busy,
    /// The service failed
    Server,
    /// No speech started before the timeout
    SpeechTimeout,
    /// Anything else
    Unknown,
}

/// How the session should react to a recognition error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionFailure {
    /// Try again, in listening or wake word mode depending on dialog mode
    Retryable,
    /// Fatal to the session
    PermissionDenied,
    /// Caller-side cancellation, not a failure
    Cancelled,
    /// Report and fall back to waiting for a wake word
    Reported,
}

impl RecognitionErrorCode {
    /// Classify the code for the session
    #[must_use]
    pub const fn classify(self) -> RecognitionFailure {
        match self {
            Self::NoMatch | Self::NetworkTimeout | Self::Network | Self::SpeechTimeout => {
                RecognitionFailure::Retryable
            }
            Self::InsufficientPermissions => RecognitionFailure::PermissionDenied,
            Self::Client => RecognitionFailure::Cancelled,
            Self::Audio | Self::Busy | Self::Server | Self::Unknown => RecognitionFailure::Reported,
        }
    }

    /// Map a transcription or capture error to a code
    #[must_use]
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::Http(e) if e.is_timeout() => Self::NetworkTimeout,
            Error::Http(_) => Self::Network,
            Error::Api { status, .. } => match status {
                401 | 403 => Self::InsufficientPermissions,
                408 => Self::NetworkTimeout,
                429 => Self::Busy,
                500..=599 => Self::Server,
                _ => Self::Unknown,
            },
            Error::Audio(_) => Self::Audio,
            Error::PermissionDenied(_) => Self::InsufficientPermissions,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for RecognitionErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Audio => "audio recording error",
            Self::InsufficientPermissions => "insufficient permissions",
            Self::NetworkTimeout => "network timeout",
            Self::Network => "network error",
            Self::NoMatch => "no match",
            Self::Client => "client error",
            Self::Busy => "recognizer busy",
            Self::Server => "server error",
            Self::SpeechTimeout => "no speech input",
            Self::Unknown => "unknown error",
        };
        f.write_str(text)
    }
}

/// Something a recognizer reports while listening
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// Intermediate transcript
    Partial(String),
    /// Final transcript; ends the attempt
    Final(String),
    /// Failure; ends the attempt
    Error(RecognitionErrorCode),
}

/// Receives recognition events from the recognizer's thread
pub type RecognitionSink = Arc<dyn Fn(RecognitionEvent) + Send + Sync>;

/// Speech recognition engine
pub trait SpeechRecognizer: Send {
    /// Begin one listening attempt
    ///
    /// Exactly one `Final` or `Error` is delivered to `sink` unless the
    /// attempt is cancelled with [`stop_listening`](Self::stop_listening).
    ///
    /// # Errors
    ///
    /// Returns error if the attempt cannot be started at all
    fn start_listening(&mut self, sink: RecognitionSink) -> Result<()>;

    /// Cancel the current attempt without reporting anything
    fn stop_listening(&mut self);

    /// Whether an attempt is in progress
    fn is_listening(&self) -> bool;
}

/// Listening limits
#[derive(Debug, Clone, Copy)]
pub struct ListenLimits {
    /// Give up if no speech starts within this window
    pub speech_timeout: Duration,
    /// Trailing silence that ends the utterance
    pub end_silence: Duration,
    /// Hard cap on utterance length
    pub max_utterance: Duration,
}

impl From<&SpeechConfig> for ListenLimits {
    fn from(config: &SpeechConfig) -> Self {
        Self {
            speech_timeout: config.speech_timeout,
            end_silence: config.end_silence,
            max_utterance: config.max_utterance,
        }
    }
}

type SharedSource = Arc<Mutex<Box<dyn AudioFrameSource>>>;

/// Recognizes one utterance from a frame source with a cloud transcriber
pub struct UtteranceRecognizer {
    source: SharedSource,
    transcriber: Arc<dyn Transcriber>,
    limits: ListenLimits,
    frame_len: usize,
    listening: Arc<AtomicBool>,
    attempt: Arc<AtomicU64>,
    cancelled: Option<Arc<AtomicBool>>,
}

impl UtteranceRecognizer {
    /// Create a recognizer reading `frame_len` samples per frame
    pub fn new(
        source: Box<dyn AudioFrameSource>,
        transcriber: Arc<dyn Transcriber>,
        limits: ListenLimits,
        frame_len: usize,
    ) -> Self {
        Self {
            source: Arc::new(Mutex::new(source)),
            transcriber,
            limits,
            frame_len,
            listening: Arc::new(AtomicBool::new(false)),
            attempt: Arc::new(AtomicU64::new(0)),
            cancelled: None,
        }
    }
}

impl SpeechRecognizer for UtteranceRecognizer {
    fn start_listening(&mut self, sink: RecognitionSink) -> Result<()> {
        self.stop_listening();

        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        let cancelled = Arc::new(AtomicBool::new(false));
        self.cancelled = Some(Arc::clone(&cancelled));
        self.listening.store(true, Ordering::SeqCst);

        let job = Attempt {
            source: Arc::clone(&self.source),
            transcriber: Arc::clone(&self.transcriber),
            limits: self.limits,
            frame_len: self.frame_len,
            cancelled,
        };
        let listening = Arc::clone(&self.listening);
        let current = Arc::clone(&self.attempt);

        let spawned = std::thread::Builder::new()
            .name("hark-listen".to_string())
            .spawn(move || {
                let event = job.run();
                if current.load(Ordering::SeqCst) == attempt {
                    listening.store(false, Ordering::SeqCst);
                }
                if let Some(event) = event {
                    sink(event);
                }
            });

        if let Err(e) = spawned {
            self.listening.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        tracing::debug!(attempt, "listening");
        Ok(())
    }

    fn stop_listening(&mut self) {
        if let Some(cancelled) = self.cancelled.take() {
            cancelled.store(true, Ordering::SeqCst);
            self.listening.store(false, Ordering::SeqCst);
        }
    }

    fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }
}

impl Drop for UtteranceRecognizer {
    fn drop(&mut self) {
        self.stop_listening();
    }
}

enum Captured {
    Utterance(Vec<f32>),
    Failed(RecognitionErrorCode),
    Cancelled,
}

/// One listening attempt, run on its own thread
struct Attempt {
    source: SharedSource,
    transcriber: Arc<dyn Transcriber>,
    limits: ListenLimits,
    frame_len: usize,
    cancelled: Arc<AtomicBool>,
}

impl Attempt {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the event to report, or `None` when cancelled
    fn run(&self) -> Option<RecognitionEvent> {
        let (captured, sample_rate) = {
            let mut source = self.source.lock().unwrap_or_else(PoisonError::into_inner);
            if self.is_cancelled() {
                return None;
            }
            let sample_rate = source.sample_rate();
            let captured = match source.start() {
                Ok(()) => self.capture(&mut **source),
                Err(e) => {
                    tracing::error!(error = %e, "failed to start listening");
                    Captured::Failed(RecognitionErrorCode::from_error(&e))
                }
            };
            source.stop();
            (captured, sample_rate)
        };

        let event = match captured {
            Captured::Cancelled => return None,
            Captured::Failed(code) => RecognitionEvent::Error(code),
            Captured::Utterance(samples) => {
                match self.transcriber.transcribe(&samples, sample_rate) {
                    Ok(text) if text.trim().is_empty() => {
                        RecognitionEvent::Error(RecognitionErrorCode::NoMatch)
                    }
                    Ok(text) => RecognitionEvent::Final(text.trim().to_string()),
                    Err(e) => {
                        tracing::warn!(error = %e, "utterance transcription failed");
                        RecognitionEvent::Error(RecognitionErrorCode::from_error(&e))
                    }
                }
            }
        };

        if self.is_cancelled() { None } else { Some(event) }
    }

    fn capture(&self, source: &mut dyn AudioFrameSource) -> Captured {
        let vad = VadConfig {
            end_silence: self.limits.end_silence,
            ..VadConfig::default()
        };
        let mut detector = UtteranceDetector::new(vad, source.sample_rate());
        let mut frame = vec![0i16; self.frame_len];
        let started = Instant::now();
        let mut speech_started: Option<Instant> = None;

        loop {
            if self.is_cancelled() {
                return Captured::Cancelled;
            }

            let n = match source.read_frame(&mut frame) {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(error = %e, "capture failed while listening");
                    return Captured::Failed(RecognitionErrorCode::from_error(&e));
                }
            };

            if n > 0 && detector.process(&pcm_to_f32(&frame[..n])) == DetectorState::Complete {
                return Captured::Utterance(detector.take_utterance());
            }

            if detector.in_speech() {
                let since = *speech_started.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.limits.max_utterance {
                    tracing::debug!("utterance hit length cap");
                    return Captured::Utterance(detector.take_utterance());
                }
            } else {
                speech_started = None;
                if started.elapsed() >= self.limits.speech_timeout {
                    return Captured::Failed(RecognitionErrorCode::SpeechTimeout);
                }
            }
        }
    }
}
