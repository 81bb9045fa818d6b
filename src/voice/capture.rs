//! Audio capture from microphone
//!
//! One cpal input stream feeds any number of taps. The wake word loop and
//! the speech recognizer each read from their own tap, so neither has to
//! reopen the device when the other starts. The stream is opened when the
//! first tap starts and closed when the last one stops.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Seconds of audio a tap keeps before dropping the oldest samples
const BACKLOG_SECS: usize = 5;

/// Fixed-size PCM frame producer
///
/// Frames are 16-bit mono at [`sample_rate`](Self::sample_rate).
pub trait AudioFrameSource: Send {
    /// Begin delivering frames. Calling it again while started is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened
    fn start(&mut self) -> Result<()>;

    /// Fill `frame` with the next samples
    ///
    /// Blocks for at most about two frame periods. Returns the number of
    /// samples written, which is 0 when nothing arrived in time.
    ///
    /// # Errors
    ///
    /// Returns error if the device failed
    fn read_frame(&mut self, frame: &mut [i16]) -> Result<usize>;

    /// Stop delivering frames. Calling it again is a no-op.
    fn stop(&mut self);

    /// Samples per second
    fn sample_rate(&self) -> u32;
}

/// Convert 16-bit PCM to floats in `[-1.0, 1.0)`
#[must_use]
pub fn pcm_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| f32::from(s) / 32768.0).collect()
}

#[derive(Default)]
struct TapState {
    samples: VecDeque<i16>,
    failure: Option<String>,
}

struct TapBuffer {
    state: Mutex<TapState>,
    ready: Condvar,
    capacity: usize,
}

impl TapBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(TapState::default()),
            ready: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TapState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, samples: impl Iterator<Item = i16>) {
        let mut state = self.lock();
        state.samples.extend(samples);
        let excess = state.samples.len().saturating_sub(self.capacity);
        if excess > 0 {
            state.samples.drain(..excess);
        }
        self.ready.notify_all();
    }

    fn fail(&self, message: &str) {
        let mut state = self.lock();
        state.failure = Some(message.to_string());
        self.ready.notify_all();
    }

    fn reset(&self) {
        let mut state = self.lock();
        state.samples.clear();
        state.failure = None;
    }
}

type TapList = Arc<Mutex<Vec<Arc<TapBuffer>>>>;

/// Handle to the thread that owns the cpal stream
///
/// `cpal::Stream` is not `Send`, so it lives and dies on its own thread.
struct StreamThread {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

struct Hub {
    sample_rate: u32,
    taps: TapList,
    stream: Mutex<Option<StreamThread>>,
}

impl Hub {
    fn attach(&self, tap: &Arc<TapBuffer>) -> Result<()> {
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        self.taps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(tap));

        if stream.is_none() {
            match open_stream(self.sample_rate, Arc::clone(&self.taps)) {
                Ok(thread) => *stream = Some(thread),
                Err(e) => {
                    self.remove(tap);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn detach(&self, tap: &Arc<TapBuffer>) {
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        let remaining = self.remove(tap);

        if remaining > 0 {
            return;
        }
        if let Some(thread) = stream.take() {
            let _ = thread.stop.send(());
            if thread.handle.join().is_err() {
                tracing::warn!("audio capture thread panicked");
            }
            tracing::debug!("audio capture stopped");
        }
    }

    fn remove(&self, tap: &Arc<TapBuffer>) -> usize {
        let mut taps = self.taps.lock().unwrap_or_else(PoisonError::into_inner);
        taps.retain(|t| !Arc::ptr_eq(t, tap));
        taps.len()
    }
}

/// Opens the input device and runs the stream on a dedicated thread
fn open_stream(sample_rate: u32, taps: TapList) -> Result<StreamThread> {
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);

    let handle = std::thread::Builder::new()
        .name("hark-capture".to_string())
        .spawn(move || {
            let stream = match build_input_stream(sample_rate, &taps) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            // Park until asked to stop (or the hub is dropped)
            let _ = stop_rx.recv();
            drop(stream);
        })?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(StreamThread {
            stop: stop_tx,
            handle,
        }),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(_) => {
            let _ = handle.join();
            Err(Error::Audio("audio capture thread exited during startup".to_string()))
        }
    }
}

fn build_input_stream(sample_rate: u32, taps: &TapList) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

    let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
        c.min_sample_rate() <= SampleRate(sample_rate) && c.max_sample_rate() >= SampleRate(sample_rate)
    };

    let supported_config = device
        .supported_input_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| c.channels() == 1 && supports_rate(c))
        .or_else(|| {
            // Fallback: any channel count, downmixed in the callback
            device
                .supported_input_configs()
                .ok()?
                .find(supports_rate)
        })
        .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;

    let config: StreamConfig = supported_config
        .with_sample_rate(SampleRate(sample_rate))
        .config();
    let channels = usize::from(config.channels.max(1));

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "audio capture initialized"
    );

    let data_taps = Arc::clone(taps);
    let error_taps = Arc::clone(taps);

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let taps = data_taps.lock().unwrap_or_else(PoisonError::into_inner);
                for tap in taps.iter() {
                    tap.push(data.chunks(channels).map(downmix));
                }
            },
            move |err| {
                tracing::error!(error = %err, "audio capture error");
                let message = err.to_string();
                let taps = error_taps.lock().unwrap_or_else(PoisonError::into_inner);
                for tap in taps.iter() {
                    tap.fail(&message);
                }
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    tracing::debug!("audio capture started");

    Ok(stream)
}

/// Average one interleaved frame to a mono 16-bit sample
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn downmix(frame: &[f32]) -> i16 {
    let mean = frame.iter().sum::<f32>() / frame.len().max(1) as f32;
    (mean * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// The default input device, shared between taps
#[derive(Clone)]
pub struct Microphone {
    hub: Arc<Hub>,
}

impl Microphone {
    /// Create a microphone capturing at `sample_rate`
    ///
    /// The device is not opened until a tap starts.
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        Self {
            hub: Arc::new(Hub {
                sample_rate,
                taps: Arc::new(Mutex::new(Vec::new())),
                stream: Mutex::new(None),
            }),
        }
    }

    /// Create an independent reader of this microphone
    #[must_use]
    pub fn tap(&self) -> MicrophoneTap {
        let capacity = self.hub.sample_rate as usize * BACKLOG_SECS;
        MicrophoneTap {
            hub: Arc::clone(&self.hub),
            buffer: Arc::new(TapBuffer::new(capacity)),
            active: false,
        }
    }

    /// Get the sample rate
    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.hub.sample_rate
    }
}

/// One reader of a [`Microphone`]
pub struct MicrophoneTap {
    hub: Arc<Hub>,
    buffer: Arc<TapBuffer>,
    active: bool,
}

impl MicrophoneTap {
    /// Check if currently capturing
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.active
    }

    fn frame_period(&self, len: usize) -> Duration {
        let rate = u64::from(self.hub.sample_rate.max(1));
        Duration::from_millis(len as u64 * 1000 / rate)
    }
}

impl AudioFrameSource for MicrophoneTap {
    fn start(&mut self) -> Result<()> {
        if self.active {
            return Ok(());
        }
        self.buffer.reset();
        self.hub.attach(&self.buffer)?;
        self.active = true;
        Ok(())
    }

    fn read_frame(&mut self, frame: &mut [i16]) -> Result<usize> {
        if !self.active {
            return Err(Error::Audio("microphone tap not started".to_string()));
        }

        let wait = self.frame_period(frame.len()) * 2;
        let state = self.buffer.lock();
        let (mut state, _) = self
            .buffer
            .ready
            .wait_timeout_while(state, wait, |s| {
                s.failure.is_none() && s.samples.len() < frame.len()
            })
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(failure) = state.failure.take() {
            return Err(Error::Audio(failure));
        }

        let n = state.samples.len().min(frame.len());
        for (slot, sample) in frame.iter_mut().zip(state.samples.drain(..n)) {
            *slot = sample;
        }
        Ok(n)
    }

    fn stop(&mut self) {
        if self.active {
            self.active = false;
            self.hub.detach(&self.buffer);
            self.buffer.reset();
        }
    }

    fn sample_rate(&self) -> u32 {
        self.hub.sample_rate
    }
}

impl Drop for MicrophoneTap {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
