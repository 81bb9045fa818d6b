//! Playback queue and its single consumer thread
//!
//! The segmenter pushes speakable units from the control loop; one worker
//! thread pops them in order and hands each to the synthesizer, waiting for
//! it to finish before taking the next. The worker starts on the first push
//! and retires once the queue stays empty for a short linger.
//!
//! Every flush bumps the queue generation. The worker checks the generation
//! under `speak_lock` right before speaking, and `stop` takes the same lock
//! before interrupting the synthesizer, so a unit popped before a flush can
//! never start playing after it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::segmenter::SpeakableUnit;
use super::tts::SpeechSynthesizer;

/// Interval between `is_speaking` polls
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long an idle worker waits for more units before retiring
const IDLE_LINGER: Duration = Duration::from_millis(50);

/// Result of asking the queue for work
#[derive(Debug, PartialEq, Eq)]
pub enum Next {
    /// A unit to speak, tagged with the generation it was popped in
    Unit {
        unit: SpeakableUnit,
        generation: u64,
    },
    /// Queue stayed empty; the caller is no longer the active worker
    Retired { generation: u64 },
}

#[derive(Debug, Default)]
struct QueueState {
    units: VecDeque<SpeakableUnit>,
    worker_active: bool,
    in_flight: bool,
}

/// Unbounded FIFO of speakable units shared between producer and worker
#[derive(Debug, Default)]
pub struct PlaybackQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    generation: AtomicU64,
}

impl PlaybackQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a unit
    ///
    /// Returns true when no worker is active and the caller must start one.
    pub fn push(&self, unit: SpeakableUnit) -> bool {
        let mut state = self.lock();
        state.units.push_back(unit);
        self.available.notify_one();
        if state.worker_active {
            false
        } else {
            state.worker_active = true;
            true
        }
    }

    /// Pop the next unit, waiting up to `linger` for one to arrive
    ///
    /// On timeout the caller is marked retired; a later `push` will ask for
    /// a fresh worker.
    pub fn next_or_retire(&self, linger: Duration) -> Next {
        let deadline = Instant::now() + linger;
        let mut state = self.lock();
        loop {
            if let Some(unit) = state.units.pop_front() {
                state.in_flight = true;
                return Next::Unit {
                    unit,
                    generation: self.generation(),
                };
            }

            let now = Instant::now();
            if now >= deadline {
                state.worker_active = false;
                return Next::Retired {
                    generation: self.generation(),
                };
            }

            state = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Mark the unit returned by the last `next_or_retire` as finished
    pub fn finish_unit(&self) {
        self.lock().in_flight = false;
    }

    /// Drop every pending unit and start a new generation
    ///
    /// Returns the number of units dropped.
    pub fn flush(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.units.len();
        state.units.clear();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.available.notify_all();
        dropped
    }

    /// Current generation
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Number of pending units
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().units.len()
    }

    /// Whether no units are pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().units.is_empty()
    }

    /// Nothing pending and nothing being spoken
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.units.is_empty() && !state.in_flight
    }
}

type CompletionFn = Box<dyn Fn(u64) + Send + Sync>;

struct Shared {
    queue: PlaybackQueue,
    synth: Arc<dyn SpeechSynthesizer>,
    speak_lock: Mutex<()>,
    on_complete: CompletionFn,
    poll: Duration,
    linger: Duration,
}

impl Shared {
    /// Start speaking `unit` unless a flush happened since it was popped
    fn speak(&self, unit: &SpeakableUnit, generation: u64) -> bool {
        let _guard = self.speak_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.queue.generation() != generation {
            tracing::debug!(unit = %unit, "skipping flushed unit");
            return false;
        }

        self.synth.interrupt();
        if let Err(e) = self.synth.speak(unit.as_str()) {
            tracing::warn!(error = %e, unit = %unit, "synthesis failed, moving on");
        }
        true
    }

    fn wait_until_done(&self, generation: u64) {
        while self.synth.is_speaking() && self.queue.generation() == generation {
            std::thread::sleep(self.poll);
        }
    }

    fn run(&self) {
        tracing::trace!("playback worker started");
        let mut spoken_generation = None;

        loop {
            match self.queue.next_or_retire(self.linger) {
                Next::Unit { unit, generation } => {
                    if self.speak(&unit, generation) {
                        spoken_generation = Some(generation);
                        tracing::debug!(unit = %unit, "speaking");
                        self.wait_until_done(generation);
                    }
                    self.queue.finish_unit();
                }
                Next::Retired { generation } => {
                    if spoken_generation == Some(generation) {
                        tracing::debug!(generation, "playback complete");
                        (self.on_complete)(generation);
                    }
                    break;
                }
            }
        }

        tracing::trace!("playback worker exited");
    }
}

/// Owns the playback queue and starts its consumer thread on demand
pub struct PlaybackWorker {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackWorker {
    /// Create a worker speaking through `synth`
    ///
    /// `on_complete` runs on the worker thread, once per drained batch,
    /// with the generation the batch belonged to. It does not run for a
    /// batch that was flushed.
    pub fn new<F>(synth: Arc<dyn SpeechSynthesizer>, on_complete: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        Self::with_timing(synth, on_complete, POLL_INTERVAL, IDLE_LINGER)
    }

    /// Create a worker with explicit poll and linger intervals
    pub fn with_timing<F>(
        synth: Arc<dyn SpeechSynthesizer>,
        on_complete: F,
        poll: Duration,
        linger: Duration,
    ) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                queue: PlaybackQueue::new(),
                synth,
                speak_lock: Mutex::new(()),
                on_complete: Box::new(on_complete),
                poll,
                linger,
            }),
            handle: Mutex::new(None),
        }
    }

    /// Queue a unit for playback
    pub fn enqueue(&self, unit: SpeakableUnit) {
        if self.shared.queue.push(unit) {
            self.spawn();
        }
    }

    fn spawn(&self) {
        let shared = Arc::clone(&self.shared);
        match std::thread::Builder::new()
            .name("hark-playback".to_string())
            .spawn(move || shared.run())
        {
            Ok(handle) => {
                let mut slot = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
                *slot = Some(handle);
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to start playback worker");
                self.shared.queue.flush();
                let _ = self.shared.queue.next_or_retire(Duration::ZERO);
            }
        }
    }

    /// Drop pending units and interrupt the unit being spoken
    ///
    /// Safe to call repeatedly and from any thread. The completion callback
    /// will not run for anything queued before this call.
    pub fn stop(&self) -> usize {
        let dropped = self.shared.queue.flush();
        {
            let _guard = self
                .shared
                .speak_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.shared.synth.interrupt();
        }
        if dropped > 0 {
            tracing::debug!(dropped, "playback queue flushed");
        }
        dropped
    }

    /// Current queue generation
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.shared.queue.generation()
    }

    /// Nothing pending and nothing being spoken
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.shared.queue.is_idle()
    }

    /// Number of units waiting to be spoken
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Stop playback and wait for the worker thread to exit
    pub fn shutdown(&self) {
        self.stop();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if handle.is_some_and(|h| h.join().is_err()) {
            tracing::warn!("playback worker panicked");
        }
    }
}

impl Drop for PlaybackWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;

    use super::*;
    use crate::Result;

    fn unit(text: &str) -> SpeakableUnit {
        SpeakableUnit::new(text).unwrap()
    }

    /// Synthesizer that "speaks" for a fixed duration and records what it said
    struct TimedSynth {
        spoken: Mutex<Vec<String>>,
        speaking_until: Mutex<Option<Instant>>,
        duration: Duration,
        interrupted: AtomicBool,
    }

    impl TimedSynth {
        fn new(duration: Duration) -> Arc<Self> {
            Arc::new(Self {
                spoken: Mutex::new(Vec::new()),
                speaking_until: Mutex::new(None),
                duration,
                interrupted: AtomicBool::new(false),
            })
        }

        fn spoken(&self) -> Vec<String> {
            self.spoken.lock().unwrap().clone()
        }
    }

    impl SpeechSynthesizer for TimedSynth {
        fn speak(&self, text: &str) -> Result<()> {
            self.spoken.lock().unwrap().push(text.to_string());
            *self.speaking_until.lock().unwrap() = Some(Instant::now() + self.duration);
            Ok(())
        }

        fn is_speaking(&self) -> bool {
            self.speaking_until
                .lock()
                .unwrap()
                .is_some_and(|until| Instant::now() < until)
        }

        fn interrupt(&self) {
            self.interrupted.store(true, Ordering::SeqCst);
            *self.speaking_until.lock().unwrap() = None;
        }
    }

    #[test]
    fn queue_preserves_fifo_order() {
        let queue = PlaybackQueue::new();
        assert!(queue.push(unit("a")));
        assert!(!queue.push(unit("b")));

        let Next::Unit { unit: first, .. } = queue.next_or_retire(Duration::ZERO) else {
            panic!("expected a unit");
        };
        queue.finish_unit();
        queue.push(unit("c"));

        let mut order = vec![first.into_string()];
        while let Next::Unit { unit, .. } = queue.next_or_retire(Duration::ZERO) {
            order.push(unit.into_string());
            queue.finish_unit();
        }
        assert_eq!(order, vec!["a", "b", "c"]);

        // Retired: the next push asks for a new worker
        assert!(queue.push(unit("d")));
    }

    #[test]
    fn flush_bumps_generation_and_clears() {
        let queue = PlaybackQueue::new();
        queue.push(unit("a"));
        queue.push(unit("b"));
        let before = queue.generation();
        assert_eq!(queue.flush(), 2);
        assert_eq!(queue.generation(), before + 1);
        assert!(queue.is_empty());
        assert_eq!(queue.flush(), 0);
    }

    #[test]
    fn in_flight_unit_is_not_idle() {
        let queue = PlaybackQueue::new();
        queue.push(unit("a"));
        let _ = queue.next_or_retire(Duration::ZERO);
        assert!(queue.is_empty());
        assert!(!queue.is_idle());
        queue.finish_unit();
        assert!(queue.is_idle());
    }

    #[test]
    fn worker_speaks_in_order_and_completes_once() {
        let synth = TimedSynth::new(Duration::from_millis(10));
        let (tx, rx) = mpsc::channel();
        let worker = PlaybackWorker::with_timing(
            synth.clone(),
            move |generation| tx.send(generation).unwrap(),
            Duration::from_millis(2),
            Duration::from_millis(20),
        );

        for text in ["one.", "two.", "three."] {
            worker.enqueue(unit(text));
        }

        let generation = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(generation, worker.generation());
        assert_eq!(synth.spoken(), vec!["one.", "two.", "three."]);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(worker.is_idle());
    }

    #[test]
    fn worker_restarts_after_retiring() {
        let synth = TimedSynth::new(Duration::from_millis(5));
        let (tx, rx) = mpsc::channel();
        let worker = PlaybackWorker::with_timing(
            synth.clone(),
            move |generation| tx.send(generation).unwrap(),
            Duration::from_millis(2),
            Duration::from_millis(10),
        );

        worker.enqueue(unit("first."));
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        worker.enqueue(unit("second."));
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        assert_eq!(synth.spoken(), vec!["first.", "second."]);
    }

    #[test]
    fn stop_prevents_further_units_and_completion() {
        let synth = TimedSynth::new(Duration::from_millis(200));
        let (tx, rx) = mpsc::channel();
        let worker = PlaybackWorker::with_timing(
            synth.clone(),
            move |generation| tx.send(generation).unwrap(),
            Duration::from_millis(2),
            Duration::from_millis(20),
        );

        worker.enqueue(unit("one."));
        worker.enqueue(unit("two."));
        worker.enqueue(unit("three."));

        // Let the first unit start
        let deadline = Instant::now() + Duration::from_secs(2);
        while synth.spoken().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }

        let dropped = worker.stop();
        assert_eq!(dropped, 2);
        worker.stop();

        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        assert_eq!(synth.spoken(), vec!["one."]);
        assert!(!synth.is_speaking());
        assert!(synth.interrupted.load(Ordering::SeqCst));
    }

    #[test]
    fn enqueue_after_stop_plays_new_batch() {
        let synth = TimedSynth::new(Duration::from_millis(100));
        let (tx, rx) = mpsc::channel();
        let worker = PlaybackWorker::with_timing(
            synth.clone(),
            move |generation| tx.send(generation).unwrap(),
            Duration::from_millis(2),
            Duration::from_millis(20),
        );

        worker.enqueue(unit("old one."));
        worker.enqueue(unit("old two."));
        std::thread::sleep(Duration::from_millis(20));
        worker.stop();

        worker.enqueue(unit("new."));
        let generation = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(generation, worker.generation());

        let spoken = synth.spoken();
        assert_eq!(spoken.last().map(String::as_str), Some("new."));
        assert!(!spoken.iter().any(|s| s == "old two."));
    }

    #[test]
    fn synthesis_error_moves_to_next_unit() {
        struct FailingFirst {
            calls: Mutex<Vec<String>>,
        }

        impl SpeechSynthesizer for FailingFirst {
            fn speak(&self, text: &str) -> Result<()> {
                let mut calls = self.calls.lock().unwrap();
                calls.push(text.to_string());
                if calls.len() == 1 {
                    return Err(crate::Error::Synthesis("voice unavailable".to_string()));
                }
                Ok(())
            }

            fn is_speaking(&self) -> bool {
                false
            }

            fn interrupt(&self) {}
        }

        let synth = Arc::new(FailingFirst {
            calls: Mutex::new(Vec::new()),
        });
        let (tx, rx) = mpsc::channel();
        let worker = PlaybackWorker::with_timing(
            synth.clone(),
            move |generation| tx.send(generation).unwrap(),
            Duration::from_millis(2),
            Duration::from_millis(20),
        );

        worker.enqueue(unit("broken."));
        worker.enqueue(unit("fine."));

        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(*synth.calls.lock().unwrap(), vec!["broken.", "fine."]);
    }
}
