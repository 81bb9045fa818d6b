//! Conversation orchestrator
//!
//! A single control loop owns the state machine and every collaborator.
//! Collaborators run on their own threads and tasks; everything they report
//! arrives here as an [`Event`] on one channel, so transitions never race
//! each other.
//!
//! Stale reports are filtered rather than prevented: each listening attempt,
//! stream request, playback batch and scheduled resume carries a number, and
//! events whose number is no longer current are dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;

use super::events::{Event, Update};
use super::state::{ConversationState, SessionFlags, Turn};
use crate::config::{Config, DialogConfig};
use crate::stream::{RequestId, StreamEvent, StreamHandle, StreamSink, TextStreamer};
use crate::voice::{
    CaptureSignal, PlaybackWorker, RecognitionErrorCode, RecognitionEvent, RecognitionFailure,
    RecognitionSink, SentenceSegmenter, SignalFn, SpeakableUnit, SpeechRecognizer,
    SpeechSynthesizer, WakeWordEngine,
};
use crate::{Error, Result};

/// Capacity of the update broadcast
const UPDATE_CAPACITY: usize = 256;

/// Everything the orchestrator drives, constructed by the caller
pub struct Collaborators {
    /// Wake word source
    pub wake: WakeWordEngine,
    /// Speech recognizer for the user's utterance
    pub recognizer: Box<dyn SpeechRecognizer>,
    /// Streaming text service
    pub streamer: Arc<dyn TextStreamer>,
    /// Voice output
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}

/// Cloneable handle for controlling a running session
#[derive(Clone)]
pub struct SessionHandle {
    events: mpsc::UnboundedSender<Event>,
    state: watch::Receiver<ConversationState>,
    updates: broadcast::Sender<Update>,
    continuous_mode: Arc<AtomicBool>,
}

impl SessionHandle {
    fn send(&self, event: Event) -> Result<()> {
        self.events.send(event).map_err(|_| Error::SessionClosed)
    }

    /// Start listening for the wake word
    ///
    /// # Errors
    ///
    /// Returns error if the control loop has exited
    pub fn start(&self) -> Result<()> {
        self.send(Event::Start)
    }

    /// Stop the session; it can be started again
    ///
    /// # Errors
    ///
    /// Returns error if the control loop has exited
    pub fn stop(&self) -> Result<()> {
        self.send(Event::Stop)
    }

    /// Act as if the wake word was heard
    ///
    /// # Errors
    ///
    /// Returns error if the control loop has exited
    pub fn wake(&self) -> Result<()> {
        self.send(Event::Wake {
            keyword: "manual".to_string(),
        })
    }

    /// Change the continuous dialog preference
    ///
    /// # Errors
    ///
    /// Returns error if the control loop has exited
    pub fn set_continuous_dialog(&self, enabled: bool) -> Result<()> {
        self.send(Event::SetContinuousDialog(enabled))
    }

    /// Stop the session and end the control loop
    ///
    /// # Errors
    ///
    /// Returns error if the control loop has already exited
    pub fn shutdown(&self) -> Result<()> {
        self.send(Event::Shutdown)
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConversationState {
        *self.state.borrow()
    }

    /// Wait until the session reaches `target`
    ///
    /// # Errors
    ///
    /// Returns error if the control loop exits first
    pub async fn wait_for_state(&self, target: ConversationState) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| Error::SessionClosed)
    }

    /// Whether the current turn was entered without a wake word
    #[must_use]
    pub fn is_continuous_dialog_mode(&self) -> bool {
        self.continuous_mode.load(Ordering::SeqCst)
    }

    /// Receive session updates
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Update> {
        self.updates.subscribe()
    }
}

/// Owns the conversation state machine
pub struct Orchestrator {
    state: ConversationState,
    flags: SessionFlags,
    turn: Option<Turn>,
    dialog: DialogConfig,
    tick: Duration,

    segmenter: SentenceSegmenter,
    playback: PlaybackWorker,
    wake: WakeWordEngine,
    recognizer: Box<dyn SpeechRecognizer>,
    streamer: Arc<dyn TextStreamer>,
    request: Option<StreamHandle>,

    listen_attempt: u64,
    resume_token: u64,
    fatal: Option<Error>,

    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    state_tx: watch::Sender<ConversationState>,
    updates: broadcast::Sender<Update>,
    continuous_mode: Arc<AtomicBool>,
}

impl Orchestrator {
    /// Create a stopped session
    #[must_use]
    pub fn new(config: &Config, collaborators: Collaborators) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConversationState::Stopped);
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);

        let completions = events_tx.clone();
        let playback = PlaybackWorker::new(collaborators.synthesizer, move |generation| {
            let _ = completions.send(Event::PlaybackComplete { generation });
        });

        Self {
            state: ConversationState::Stopped,
            flags: SessionFlags {
                continuous_dialog_enabled: config.dialog.continuous_dialog,
                is_continuous_dialog_mode: false,
            },
            turn: None,
            dialog: config.dialog,
            tick: config.segmenter.tick,
            segmenter: SentenceSegmenter::new(config.segmenter),
            playback,
            wake: collaborators.wake,
            recognizer: collaborators.recognizer,
            streamer: collaborators.streamer,
            request: None,
            listen_attempt: 0,
            resume_token: 0,
            fatal: None,
            events_tx,
            events_rx,
            state_tx,
            updates,
            continuous_mode: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for controlling the session from elsewhere
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            events: self.events_tx.clone(),
            state: self.state_tx.subscribe(),
            updates: self.updates.clone(),
            continuous_mode: Arc::clone(&self.continuous_mode),
        }
    }

    /// Receive session updates
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Update> {
        self.updates.subscribe()
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> ConversationState {
        self.state
    }

    /// Whether the current turn was entered without a wake word
    #[must_use]
    pub const fn is_continuous_dialog_mode(&self) -> bool {
        self.flags.is_continuous_dialog_mode
    }

    /// Run the control loop until shutdown
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`] if the session died from a
    /// permission failure
    pub async fn run(mut self) -> Result<()> {
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::debug!(wake_engine = self.wake.name(), "control loop started");

        loop {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(Event::Shutdown) | None => break,
                    Some(event) => self.handle_event(event),
                },
                _ = tick.tick() => self.on_tick(),
            }

            if let Some(error) = self.fatal.take() {
                tracing::error!(error = %error, "session failed");
                self.stop_session();
                return Err(error);
            }
        }

        self.stop_session();
        self.playback.shutdown();
        tracing::debug!("control loop exited");
        Ok(())
    }

    /// Apply one event
    pub fn handle_event(&mut self, event: Event) {
        tracing::trace!(state = %self.state, event = ?event, "event");

        match event {
            Event::Start => self.on_start(),
            Event::Stop => self.stop_session(),
            Event::Shutdown => {}
            Event::SetContinuousDialog(enabled) => self.on_set_continuous(enabled),
            _ if self.state == ConversationState::Stopped => {
                tracing::debug!("session stopped, ignoring event");
            }
            Event::Wake { keyword } => self.on_wake(&keyword),
            Event::CaptureFailed(message) => self.on_capture_failed(&message),
            Event::Recognition { attempt, event } => self.on_recognition(attempt, event),
            Event::Stream { request, event } => self.on_stream(request, event),
            Event::PlaybackComplete { generation } => self.on_playback_complete(generation),
            Event::Resume { token } => self.on_resume(token),
        }
    }

    fn on_start(&mut self) {
        if self.state != ConversationState::Stopped {
            tracing::debug!(state = %self.state, "already started");
            return;
        }

        self.set_continuous_mode(false);

        let events = self.events_tx.clone();
        let on_signal: SignalFn = Arc::new(move |signal: CaptureSignal| {
            let event = match signal {
                CaptureSignal::Wake { keyword } => Event::Wake { keyword },
                CaptureSignal::Failed(message) => Event::CaptureFailed(message),
            };
            let _ = events.send(event);
        });

        if let Err(e) = self.wake.start(on_signal) {
            tracing::error!(error = %e, engine = self.wake.name(), "failed to start wake engine");
            self.publish(Update::Error(e.to_string()));
            if matches!(e, Error::PermissionDenied(_)) {
                self.fatal = Some(e);
            }
            return;
        }

        self.transition(ConversationState::WakeWordWait);
    }

    fn on_wake(&mut self, keyword: &str) {
        match self.state {
            ConversationState::Listening if self.recognizer.is_listening() => {
                tracing::debug!(keyword, "already listening, ignoring wake word");
                return;
            }
            ConversationState::Processing => {
                tracing::debug!(keyword, "query in flight, ignoring wake word");
                return;
            }
            ConversationState::Listening => {
                // Attempt ended without a result
                self.end_turn();
            }
            state if state.is_answering() => self.barge_in(),
            ConversationState::ContinuousDialogWait => {
                // Pending resume is superseded
                self.resume_token += 1;
            }
            _ => {}
        }

        tracing::info!(keyword, "wake word");
        self.set_continuous_mode(false);
        self.begin_listening();
    }

    /// Cut off the answer in progress
    fn barge_in(&mut self) {
        tracing::info!(state = %self.state, "barge-in");
        self.cancel_request();
        let dropped = self.playback.stop();
        self.segmenter.clear();
        if let Some(turn) = self.turn.take() {
            tracing::debug!(turn = %turn.id, dropped, "turn interrupted");
        }
        self.publish(Update::Interrupted);
    }

    fn begin_listening(&mut self) {
        self.listen_attempt += 1;
        let attempt = self.listen_attempt;
        let events = self.events_tx.clone();
        let sink: RecognitionSink = Arc::new(move |event: RecognitionEvent| {
            let _ = events.send(Event::Recognition { attempt, event });
        });

        match self.recognizer.start_listening(sink) {
            Ok(()) => {
                let turn = Turn::new();
                tracing::debug!(turn = %turn.id, attempt, "turn started");
                self.turn = Some(turn);
                self.transition(ConversationState::Listening);
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to start listening");
                self.publish(Update::Error(e.to_string()));
                if matches!(e, Error::PermissionDenied(_)) {
                    self.fatal = Some(e);
                    return;
                }
                self.end_turn();
                self.set_continuous_mode(false);
                self.transition(ConversationState::WakeWordWait);
            }
        }
    }

    fn on_recognition(&mut self, attempt: u64, event: RecognitionEvent) {
        if attempt != self.listen_attempt || self.state != ConversationState::Listening {
            tracing::debug!(attempt, "dropping stale recognition event");
            return;
        }

        match event {
            RecognitionEvent::Partial(text) => {
                tracing::debug!(partial = %text, "partial transcript");
                self.publish(Update::PartialTranscript(text));
            }
            RecognitionEvent::Final(text) if text.trim().is_empty() => {
                self.on_recognition_error(RecognitionErrorCode::NoMatch);
            }
            RecognitionEvent::Final(text) => self.dispatch_query(&text),
            RecognitionEvent::Error(code) => self.on_recognition_error(code),
        }
    }

    fn on_recognition_error(&mut self, code: RecognitionErrorCode) {
        match code.classify() {
            RecognitionFailure::Cancelled => {
                tracing::debug!(code = %code, "recognition cancelled by client");
            }
            RecognitionFailure::Retryable => {
                let continuous = self.flags.is_continuous_dialog_mode;
                tracing::info!(code = %code, continuous, "recognition retry");
                self.end_turn();
                if self.flags.is_continuous_dialog_mode {
                    self.transition(ConversationState::ContinuousDialogWait);
                    self.schedule_resume(self.dialog.retry_delay);
                } else {
                    self.transition(ConversationState::WakeWordWait);
                }
            }
            RecognitionFailure::PermissionDenied => {
                tracing::error!(code = %code, "recognition not permitted");
                self.publish(Update::Error(code.to_string()));
                self.fatal = Some(Error::PermissionDenied(code.to_string()));
            }
            RecognitionFailure::Reported => {
                tracing::warn!(code = %code, "recognition failed");
                self.publish(Update::Error(code.to_string()));
                self.end_turn();
                self.set_continuous_mode(false);
                self.transition(ConversationState::WakeWordWait);
            }
        }
    }

    fn dispatch_query(&mut self, text: &str) {
        tracing::info!(query = %text, "transcript");
        if let Some(turn) = self.turn.as_mut() {
            turn.query = Some(text.to_string());
        }
        self.publish(Update::Transcript(text.to_string()));
        self.transition(ConversationState::Processing);

        self.segmenter.clear();
        let events = self.events_tx.clone();
        let sink: StreamSink = Arc::new(move |request: RequestId, event: StreamEvent| {
            let _ = events.send(Event::Stream { request, event });
        });
        let handle = self.streamer.open(text, sink);
        tracing::debug!(request = handle.id(), "query dispatched");
        self.request = Some(handle);

        self.transition(ConversationState::AiStreaming);
    }

    fn on_stream(&mut self, request: RequestId, event: StreamEvent) {
        let current = self.request.as_ref().map(StreamHandle::id);
        if current != Some(request) || !self.state.is_streaming() {
            tracing::debug!(request, "dropping stale stream event");
            return;
        }

        match event {
            StreamEvent::Text(text) => {
                if self.state == ConversationState::AiStreaming {
                    self.transition(ConversationState::AiResponding);
                }
                if let Some(turn) = self.turn.as_mut() {
                    turn.response.push_str(&text);
                }
                let units = self.segmenter.append(&text);
                self.publish(Update::ResponseText(text));
                self.enqueue_all(units);
            }
            StreamEvent::Complete => {
                self.request = None;
                if let Some(unit) = self.segmenter.flush() {
                    self.playback.enqueue(unit);
                }
                let response = self
                    .turn
                    .as_ref()
                    .map(|t| t.response.clone())
                    .unwrap_or_default();
                tracing::info!(chars = response.chars().count(), "response complete");
                self.transition(ConversationState::Speaking);
                self.publish(Update::ResponseComplete(response));

                if self.playback.is_idle() {
                    self.conclude_turn();
                }
            }
            StreamEvent::Failed(message) => {
                tracing::warn!(error = %message, "stream failed");
                self.request = None;
                self.publish(Update::Error(message));
                self.playback.stop();
                self.segmenter.clear();
                self.end_turn();
                self.set_continuous_mode(false);
                self.transition(ConversationState::WakeWordWait);
            }
        }
    }

    fn enqueue_all(&self, units: Vec<SpeakableUnit>) {
        for unit in units {
            tracing::debug!(unit = %unit, "speakable unit");
            self.playback.enqueue(unit);
        }
    }

    fn on_tick(&mut self) {
        if !self.state.is_streaming() {
            return;
        }
        if let Some(unit) = self.segmenter.tick() {
            tracing::debug!(unit = %unit, "speakable unit after pause");
            self.playback.enqueue(unit);
        }
    }

    fn on_playback_complete(&mut self, generation: u64) {
        if self.state != ConversationState::Speaking
            || generation != self.playback.generation()
            || !self.playback.is_idle()
        {
            tracing::trace!(generation, "ignoring playback completion");
            return;
        }
        self.conclude_turn();
    }

    /// The reply has been fully spoken
    fn conclude_turn(&mut self) {
        self.end_turn();
        if self.flags.continuous_dialog_enabled {
            self.set_continuous_mode(true);
            self.transition(ConversationState::ContinuousDialogWait);
            self.schedule_resume(self.dialog.grace_delay);
        } else {
            self.set_continuous_mode(false);
            self.transition(ConversationState::WakeWordWait);
        }
    }

    fn schedule_resume(&mut self, delay: Duration) {
        self.resume_token += 1;
        let token = self.resume_token;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::Resume { token });
        });
    }

    fn on_resume(&mut self, token: u64) {
        if self.state != ConversationState::ContinuousDialogWait || token != self.resume_token {
            tracing::trace!(token, "ignoring stale resume");
            return;
        }
        self.begin_listening();
    }

    fn on_set_continuous(&mut self, enabled: bool) {
        tracing::info!(enabled, "continuous dialog preference");
        self.flags.continuous_dialog_enabled = enabled;

        if !enabled && self.state == ConversationState::ContinuousDialogWait {
            self.resume_token += 1;
            self.set_continuous_mode(false);
            self.transition(ConversationState::WakeWordWait);
        }
    }

    fn on_capture_failed(&mut self, message: &str) {
        tracing::error!(error = message, "wake word capture stopped");
        self.publish(Update::Error(format!("audio capture failed: {message}")));
        self.stop_session();
    }

    /// Release everything and return to `Stopped`
    ///
    /// Capture is stopped and joined first, then the request is cancelled,
    /// playback flushed and segmenter state cleared.
    fn stop_session(&mut self) {
        if self.state == ConversationState::Stopped {
            return;
        }

        let wake = &mut self.wake;
        off_worker(|| wake.stop());
        self.cancel_request();
        self.playback.stop();
        self.segmenter.clear();
        self.recognizer.stop_listening();
        self.end_turn();
        self.resume_token += 1;
        self.set_continuous_mode(false);
        self.transition(ConversationState::Stopped);
    }

    fn cancel_request(&mut self) {
        if let Some(request) = self.request.take() {
            request.cancel();
        }
    }

    fn end_turn(&mut self) {
        if let Some(turn) = self.turn.take() {
            tracing::debug!(turn = %turn.id, elapsed_ms = turn.elapsed_ms(), "turn ended");
        }
    }

    fn set_continuous_mode(&mut self, on: bool) {
        self.flags.is_continuous_dialog_mode = on;
        self.continuous_mode.store(on, Ordering::SeqCst);
    }

    fn transition(&mut self, to: ConversationState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        tracing::info!(from = %from, to = %to, "state transition");
        self.state_tx.send_replace(to);
        self.publish(Update::State { from, to });
    }

    fn publish(&self, update: Update) {
        // No subscribers is fine
        let _ = self.updates.send(update);
    }
}

/// Run a blocking call without stalling the other tasks on this worker
///
/// Joining the capture thread can wait on a transcription that needs the
/// runtime's IO driver to finish.
fn off_worker<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current().map(|h| h.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(f),
        _ => f(),
    }
}
