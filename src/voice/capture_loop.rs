//! Continuous capture loop for wake word spotting
//!
//! The loop owns a frame source and a keyword spotter and runs them on a
//! dedicated thread. Both are moved into the thread on start and handed back
//! through its `JoinHandle` on stop, so the device and spotter are only ever
//! released after the thread has exited.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use super::capture::{AudioFrameSource, pcm_to_f32};
use super::spotter::KeywordSpotter;
use crate::{Error, Result};

/// What the capture thread reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSignal {
    /// A wake phrase was spotted
    Wake { keyword: String },
    /// The frame source failed; the loop has exited
    Failed(String),
}

/// Receives capture signals on the capture thread
pub type SignalFn = Arc<dyn Fn(CaptureSignal) + Send + Sync>;

struct Parts {
    source: Box<dyn AudioFrameSource>,
    spotter: Box<dyn KeywordSpotter>,
}

struct Running {
    is_recording: Arc<AtomicBool>,
    handle: JoinHandle<Parts>,
}

/// Reads frames, feeds the spotter, reports wake events
pub struct CaptureLoop {
    parts: Option<Parts>,
    running: Option<Running>,
    frame_len: usize,
}

impl CaptureLoop {
    /// Create a stopped loop reading `frame_len` samples per frame
    pub fn new(
        source: Box<dyn AudioFrameSource>,
        spotter: Box<dyn KeywordSpotter>,
        frame_len: usize,
    ) -> Self {
        Self {
            parts: Some(Parts { source, spotter }),
            running: None,
            frame_len,
        }
    }

    /// Start capturing on a new thread
    ///
    /// A no-op if already running.
    ///
    /// # Errors
    ///
    /// Returns error if the frame source cannot start
    pub fn start(&mut self, on_signal: SignalFn) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }

        let mut parts = self
            .parts
            .take()
            .ok_or_else(|| Error::WakeWord("capture resources were lost".to_string()))?;

        if let Err(e) = parts.source.start() {
            self.parts = Some(parts);
            return Err(e);
        }
        parts.spotter.reset();

        let is_recording = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&is_recording);
        let frame_len = self.frame_len;

        let handle = std::thread::Builder::new()
            .name("hark-wake".to_string())
            .spawn(move || run(parts, &flag, frame_len, &*on_signal))?;

        self.running = Some(Running {
            is_recording,
            handle,
        });
        tracing::debug!(frame_len, "wake word capture started");
        Ok(())
    }

    /// Stop the loop and wait for its thread to exit
    ///
    /// Returns within about one frame period plus any decode in progress;
    /// decodes still pending are skipped.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        running.is_recording.store(false, Ordering::SeqCst);
        match running.handle.join() {
            Ok(mut parts) => {
                parts.source.stop();
                parts.spotter.reset();
                self.parts = Some(parts);
                tracing::debug!("wake word capture stopped");
            }
            Err(_) => {
                tracing::error!("wake word capture thread panicked");
            }
        }
    }

    /// Whether the capture thread is running
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| r.is_recording.load(Ordering::SeqCst) && !r.handle.is_finished())
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    mut parts: Parts,
    is_recording: &AtomicBool,
    frame_len: usize,
    on_signal: &(dyn Fn(CaptureSignal) + Send + Sync),
) -> Parts {
    let mut frame = vec![0i16; frame_len];

    while is_recording.load(Ordering::SeqCst) {
        let n = match parts.source.read_frame(&mut frame) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "wake word capture failed");
                on_signal(CaptureSignal::Failed(e.to_string()));
                break;
            }
        };
        if n == 0 || !is_recording.load(Ordering::SeqCst) {
            continue;
        }

        parts.spotter.accept_frame(&pcm_to_f32(&frame[..n]));

        // A decode can take as long as a transcription request
        while parts.spotter.is_ready() && is_recording.load(Ordering::SeqCst) {
            parts.spotter.decode();
            let keyword = parts.spotter.result().keyword;
            if keyword.trim().is_empty() {
                continue;
            }

            parts.spotter.reset();
            if is_recording.load(Ordering::SeqCst) {
                on_signal(CaptureSignal::Wake { keyword });
            }
        }
    }

    parts
}
