//! Wake word engines
//!
//! Two kinds of engine can wake the session: the in-process capture loop
//! with a keyword spotter, or a third-party engine that owns its own input
//! and only reports detections.

use std::io::BufRead;
use std::sync::{Arc, Mutex, PoisonError};

use super::capture_loop::{CaptureLoop, CaptureSignal, SignalFn};
use crate::Result;

/// A wake engine that manages its own audio input
pub trait ExternalWakeEngine: Send {
    /// Begin reporting detections to `on_signal`
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot start
    fn start(&mut self, on_signal: SignalFn) -> Result<()>;

    /// Stop reporting detections. Calling it again is a no-op.
    fn stop(&mut self);
}

/// The engine a session listens with, chosen at construction
pub enum WakeWordEngine {
    /// Capture loop feeding a keyword spotter
    LocalModel(CaptureLoop),
    /// Engine with its own input
    ThirdPartyEngine(Box<dyn ExternalWakeEngine>),
}

impl WakeWordEngine {
    /// Start listening for the wake word
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot start
    pub fn start(&mut self, on_signal: SignalFn) -> Result<()> {
        match self {
            Self::LocalModel(capture) => capture.start(on_signal),
            Self::ThirdPartyEngine(engine) => engine.start(on_signal),
        }
    }

    /// Stop listening; for the local model this waits for the capture thread
    pub fn stop(&mut self) {
        match self {
            Self::LocalModel(capture) => capture.stop(),
            Self::ThirdPartyEngine(engine) => engine.stop(),
        }
    }

    /// Short engine name for logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::LocalModel(_) => "local-model",
            Self::ThirdPartyEngine(_) => "third-party",
        }
    }
}

type Armed = Arc<Mutex<Option<SignalFn>>>;

/// Wakes the session each time Enter is pressed
///
/// One reader thread is started on first use and kept for the life of the
/// process, since a blocking stdin read cannot be interrupted. Detections
/// are only reported while the engine is started.
#[derive(Default)]
pub struct PushToTalk {
    armed: Armed,
    reader_started: bool,
}

impl PushToTalk {
    /// Create a push-to-talk engine
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn spawn_reader(&mut self) -> Result<()> {
        if self.reader_started {
            return Ok(());
        }

        let armed = Arc::clone(&self.armed);
        std::thread::Builder::new()
            .name("hark-ptt".to_string())
            .spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    if line.is_err() {
                        break;
                    }
                    let callback = armed
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    if let Some(on_signal) = callback {
                        on_signal(CaptureSignal::Wake {
                            keyword: "push-to-talk".to_string(),
                        });
                    }
                }
                tracing::debug!("stdin closed, push-to-talk reader exited");
            })?;

        self.reader_started = true;
        Ok(())
    }
}

impl ExternalWakeEngine for PushToTalk {
    fn start(&mut self, on_signal: SignalFn) -> Result<()> {
        self.spawn_reader()?;
        *self.armed.lock().unwrap_or_else(PoisonError::into_inner) = Some(on_signal);
        tracing::info!("press Enter to talk");
        Ok(())
    }

    fn stop(&mut self) {
        self.armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
