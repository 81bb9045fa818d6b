//! Voice processing module
//!
//! Handles audio capture, wake word spotting, speech recognition, sentence
//! segmentation and speech output.

mod capture;
mod capture_loop;
mod playback;
mod playback_queue;
mod recognizer;
mod segmenter;
mod spotter;
mod stt;
mod tts;
mod vad;
mod wake;

pub use capture::{
    AudioFrameSource, Microphone, MicrophoneTap, SAMPLE_RATE, pcm_to_f32, samples_to_wav,
};
pub use capture_loop::{CaptureLoop, CaptureSignal, SignalFn};
pub use playback::{AudioPlayback, PLAYBACK_SAMPLE_RATE, decode_mp3, resample_linear};
pub use playback_queue::{Next, PlaybackQueue, PlaybackWorker};
pub use recognizer::{
    ListenLimits, RecognitionErrorCode, RecognitionEvent, RecognitionFailure, RecognitionSink,
    SpeechRecognizer, UtteranceRecognizer,
};
pub use segmenter::{SENTENCE_TERMINATORS, SentenceSegmenter, SpeakableUnit, is_terminator};
pub use spotter::{KeywordSpotter, SpotterResult, TranscriptSpotter};
pub use stt::{CloudTranscriber, TRANSCRIBE_TIMEOUT, Transcriber};
pub use tts::{CloudSynthesizer, ConsoleSynthesizer, SpeechSynthesizer, VoiceSettings};
pub use vad::{DetectorState, ENERGY_THRESHOLD, UtteranceDetector, VadConfig, rms};
pub use wake::{ExternalWakeEngine, PushToTalk, WakeWordEngine};
