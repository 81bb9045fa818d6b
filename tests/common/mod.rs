//! Shared test utilities
//!
//! Scriptable stand-ins for the collaborators a session drives, so the
//! control loop can be exercised without audio hardware or network access.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hark::config::Config;
use hark::conversation::{ConversationState, SessionHandle, Update};
use hark::stream::{RequestId, StreamEvent, StreamHandle, StreamSink, TextStreamer};
use hark::voice::{
    AudioFrameSource, ExternalWakeEngine, RecognitionErrorCode, RecognitionEvent, RecognitionSink,
    SignalFn, SpeechRecognizer, SpeechSynthesizer,
};
use hark::{Error, Result};
use tokio::sync::broadcast;

/// How long a test waits for the session to reach a state
pub const STATE_TIMEOUT: Duration = Duration::from_secs(3);

/// Config with short delays suitable for tests
#[must_use]
pub fn test_config(continuous: bool) -> Config {
    let mut config = Config::default();
    config.dialog.continuous_dialog = continuous;
    config.dialog.grace_delay = Duration::from_millis(30);
    config.dialog.retry_delay = Duration::from_millis(30);
    config.segmenter.timeout = Duration::from_millis(200);
    config.segmenter.tick = Duration::from_millis(10);
    config
}

/// Wait for `state`, failing the test on timeout
pub async fn reach(session: &SessionHandle, state: ConversationState) {
    tokio::time::timeout(STATE_TIMEOUT, session.wait_for_state(state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}, at {}", session.state()))
        .expect("session closed");
}

/// Collect updates until `pred` matches one, failing on timeout
pub async fn expect_update<F>(updates: &mut broadcast::Receiver<Update>, pred: F) -> Update
where
    F: Fn(&Update) -> bool,
{
    tokio::time::timeout(STATE_TIMEOUT, async {
        loop {
            let update = updates.recv().await.expect("update channel closed");
            if pred(&update) {
                return update;
            }
        }
    })
    .await
    .expect("timed out waiting for update")
}

/// Wake engine that records start and stop calls
#[derive(Clone, Default)]
pub struct FakeWake {
    pub starts: Arc<AtomicUsize>,
    pub stops: Arc<AtomicUsize>,
    pub signal: Arc<Mutex<Option<SignalFn>>>,
    pub deny: bool,
}

impl FakeWake {
    /// An engine whose start fails with a permission error
    #[must_use]
    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    /// Report a wake word as the engine would
    pub fn fire(&self, keyword: &str) {
        let signal = self.signal.lock().unwrap().clone();
        if let Some(signal) = signal {
            signal(hark::voice::CaptureSignal::Wake {
                keyword: keyword.to_string(),
            });
        }
    }

    /// Report a capture failure as the engine would
    pub fn fail(&self, message: &str) {
        let signal = self.signal.lock().unwrap().clone();
        if let Some(signal) = signal {
            signal(hark::voice::CaptureSignal::Failed(message.to_string()));
        }
    }
}

impl ExternalWakeEngine for FakeWake {
    fn start(&mut self, on_signal: SignalFn) -> Result<()> {
        if self.deny {
            return Err(Error::PermissionDenied("microphone".to_string()));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.signal.lock().unwrap() = Some(on_signal);
        Ok(())
    }

    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.signal.lock().unwrap().take();
    }
}

/// Recognizer whose results are delivered by the test
#[derive(Clone, Default)]
pub struct FakeRecognizer {
    pub starts: Arc<AtomicUsize>,
    pub sink: Arc<Mutex<Option<RecognitionSink>>>,
}

impl FakeRecognizer {
    fn emit(&self, event: RecognitionEvent) {
        let sink = self.sink.lock().unwrap().take();
        let sink = sink.expect("recognizer is not listening");
        sink(event);
    }

    /// Deliver a final transcript
    pub fn hear(&self, text: &str) {
        self.emit(RecognitionEvent::Final(text.to_string()));
    }

    /// Deliver an error
    pub fn fail(&self, code: RecognitionErrorCode) {
        self.emit(RecognitionEvent::Error(code));
    }

    /// Deliver a partial transcript without ending the attempt
    pub fn partial(&self, text: &str) {
        let sink = self.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink(RecognitionEvent::Partial(text.to_string()));
        }
    }

    #[must_use]
    pub fn listening(&self) -> bool {
        self.sink.lock().unwrap().is_some()
    }
}

impl SpeechRecognizer for FakeRecognizer {
    fn start_listening(&mut self, sink: RecognitionSink) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn stop_listening(&mut self) {
        self.sink.lock().unwrap().take();
    }

    fn is_listening(&self) -> bool {
        self.listening()
    }
}

struct OpenRequest {
    id: RequestId,
    sink: StreamSink,
    cancelled: Arc<AtomicBool>,
}

/// Streaming service whose reply is scripted by the test
#[derive(Clone, Default)]
pub struct FakeStreamer {
    pub queries: Arc<Mutex<Vec<String>>>,
    open: Arc<Mutex<Option<OpenRequest>>>,
    next_id: Arc<AtomicU64>,
}

impl FakeStreamer {
    fn emit(&self, event: StreamEvent, honor_cancel: bool) {
        let guard = self.open.lock().unwrap();
        let request = guard.as_ref().expect("no request open");
        if honor_cancel && request.cancelled.load(Ordering::SeqCst) {
            return;
        }
        (request.sink)(request.id, event);
    }

    /// Send a reply fragment
    pub fn text(&self, text: &str) {
        self.emit(StreamEvent::Text(text.to_string()), true);
    }

    /// End the reply normally
    pub fn complete(&self) {
        self.emit(StreamEvent::Complete, true);
    }

    /// End the reply with an error
    pub fn fail(&self, message: &str) {
        self.emit(StreamEvent::Failed(message.to_string()), true);
    }

    /// Send a fragment even if the request was cancelled
    pub fn text_ignoring_cancel(&self, text: &str) {
        self.emit(StreamEvent::Text(text.to_string()), false);
    }

    /// Whether the open request was cancelled
    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.open
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|r| r.cancelled.load(Ordering::SeqCst))
    }
}

impl TextStreamer for FakeStreamer {
    fn open(&self, query: &str, sink: StreamSink) -> StreamHandle {
        self.queries.lock().unwrap().push(query.to_string());
        let id: RequestId = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let cancelled = Arc::new(AtomicBool::new(false));
        *self.open.lock().unwrap() = Some(OpenRequest {
            id,
            sink,
            cancelled: Arc::clone(&cancelled),
        });
        StreamHandle::new(id, cancelled)
    }
}

/// Synthesizer that records what it was asked to say
///
/// Each unit "plays" for a fixed time so tests can observe speaking.
pub struct FakeSynth {
    pub spoken: Mutex<Vec<String>>,
    pub interrupts: AtomicUsize,
    per_unit: Duration,
    speaking_until: Mutex<Option<Instant>>,
}

impl FakeSynth {
    #[must_use]
    pub fn new(per_unit: Duration) -> Self {
        Self {
            spoken: Mutex::new(Vec::new()),
            interrupts: AtomicUsize::new(0),
            per_unit,
            speaking_until: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

impl SpeechSynthesizer for FakeSynth {
    fn speak(&self, text: &str) -> Result<()> {
        self.spoken.lock().unwrap().push(text.to_string());
        *self.speaking_until.lock().unwrap() = Some(Instant::now() + self.per_unit);
        Ok(())
    }

    fn is_speaking(&self) -> bool {
        self.speaking_until
            .lock()
            .unwrap()
            .is_some_and(|until| Instant::now() < until)
    }

    fn interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        self.speaking_until.lock().unwrap().take();
    }
}

/// Frame source producing scripted frames, then silence
pub struct ScriptedSource {
    frames: std::collections::VecDeque<Vec<i16>>,
    frame_period: Duration,
    pub started: bool,
}

impl ScriptedSource {
    #[must_use]
    pub fn new(frames: Vec<Vec<i16>>, frame_period: Duration) -> Self {
        Self {
            frames: frames.into(),
            frame_period,
            started: false,
        }
    }
}

impl AudioFrameSource for ScriptedSource {
    fn start(&mut self) -> Result<()> {
        self.started = true;
        Ok(())
    }

    fn read_frame(&mut self, frame: &mut [i16]) -> Result<usize> {
        std::thread::sleep(self.frame_period);
        match self.frames.pop_front() {
            Some(samples) => {
                let n = samples.len().min(frame.len());
                frame[..n].copy_from_slice(&samples[..n]);
                Ok(n)
            }
            None => {
                frame.fill(0);
                Ok(frame.len())
            }
        }
    }

    fn stop(&mut self) {
        self.started = false;
    }

    fn sample_rate(&self) -> u32 {
        hark::voice::SAMPLE_RATE
    }
}
