//! Synthesized-reply playback
//!
//! Each reply segment plays through its own [`PlaybackHandle`], which owns
//! exactly one underlying output stream and is discarded on completion,
//! error, or cancellation. Cancellation is synchronous and idempotent, and
//! silences the output before stopping it so halting mid-sample produces no
//! audible artifact.

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, StreamConfig};
use tokio::sync::watch;

use crate::{Error, Result};

/// Sample rate for playback (matches common TTS output)
const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Destination for synthesized audio
pub trait AudioSink: Send + Sync {
    /// Start playing MP3 bytes, returning immediately with a handle
    ///
    /// # Errors
    ///
    /// Returns error if decoding fails or the output device rejects the
    /// stream.
    fn play(&self, mp3: &[u8]) -> Result<PlaybackHandle>;
}

/// Shared control block between a handle and its output stream
#[derive(Debug)]
struct PlaybackCtrl {
    /// f32 gain bits; the output callback multiplies every sample by this
    volume: AtomicU32,
    /// Source detached: the callback emits silence regardless of position
    detached: AtomicBool,
    cancelled: AtomicBool,
    position: AtomicUsize,
}

/// Wraps one playback. Clones share the same underlying stream; the
/// orchestrator keeps one clone to cancel on barge-in while the reply
/// pipeline keeps another to await completion.
#[derive(Debug, Clone)]
pub struct PlaybackHandle {
    ctrl: Arc<PlaybackCtrl>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl PlaybackHandle {
    fn new() -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            ctrl: Arc::new(PlaybackCtrl {
                volume: AtomicU32::new(1.0f32.to_bits()),
                detached: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                position: AtomicUsize::new(0),
            }),
            done_tx,
            done_rx,
        }
    }

    /// Handle for playback not bound to a local output stream: hosts that
    /// route audio to their own output keep cancellation semantics, and
    /// drive completion through [`PlaybackHandle::finish`].
    #[must_use]
    pub fn unbound() -> Self {
        Self::new()
    }

    /// Stop playback immediately. Idempotent; safe when nothing is playing.
    ///
    /// Zeroes the volume and detaches the source before the stream winds
    /// down, so the device never renders a truncated sample.
    pub fn cancel(&self) {
        if !self.ctrl.cancelled.swap(true, Ordering::SeqCst) {
            self.ctrl.volume.store(0.0f32.to_bits(), Ordering::SeqCst);
            self.ctrl.detached.store(true, Ordering::SeqCst);
            tracing::debug!("playback cancelled");
        }
        self.finish();
    }

    /// Whether this playback was cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.ctrl.cancelled.load(Ordering::SeqCst)
    }

    /// Whether playback has ended for any reason
    #[must_use]
    pub fn is_finished(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Wait until playback ends (completion, error, or cancellation)
    pub async fn finished(&self) {
        let mut rx = self.done_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Mark playback complete, waking waiters. Idempotent.
    pub fn finish(&self) {
        let _ = self.done_tx.send(true);
    }
}

/// Plays audio to the default output device
pub struct AudioPlayer {
    device: Device,
    config: StreamConfig,
}

impl AudioPlayer {
    /// Open the default output device
    ///
    /// # Errors
    ///
    /// Returns error if no suitable output configuration exists
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
            })
            .or_else(|| {
                device.supported_output_configs().ok()?.find(|c| {
                    c.channels() == 2
                        && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                        && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
                })
            })
            .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = PLAYBACK_SAMPLE_RATE,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self { device, config })
    }

    /// Start playing raw samples. Used by the hardware smoke tests.
    ///
    /// # Errors
    ///
    /// Returns error if the output device rejects the stream.
    pub fn play_samples(&self, samples: Vec<f32>) -> Result<PlaybackHandle> {
        self.spawn_playback(samples)
    }

    /// Start playing decoded samples on a dedicated audio thread.
    ///
    /// Output streams are not `Send`, so the stream lives on its own thread
    /// and is controlled through the handle's shared atomics.
    fn spawn_playback(&self, samples: Vec<f32>) -> Result<PlaybackHandle> {
        let handle = PlaybackHandle::new();
        if samples.is_empty() {
            handle.finish();
            return Ok(handle);
        }

        let device = self.device.clone();
        let config = self.config.clone();
        let thread_handle = handle.clone();

        std::thread::Builder::new()
            .name("parley-playback".to_string())
            .spawn(move || {
                if let Err(e) = run_output_stream(&device, &config, samples, &thread_handle) {
                    tracing::error!(error = %e, "audio playback error");
                }
                thread_handle.finish();
            })
            .map_err(|e| Error::Audio(format!("playback thread spawn failed: {e}")))?;

        Ok(handle)
    }
}

impl AudioSink for AudioPlayer {
    fn play(&self, mp3: &[u8]) -> Result<PlaybackHandle> {
        let samples = decode_mp3(mp3)?;
        self.spawn_playback(samples)
    }
}

fn run_output_stream(
    device: &Device,
    config: &StreamConfig,
    samples: Vec<f32>,
    handle: &PlaybackHandle,
) -> Result<()> {
    let channels = usize::from(config.channels);
    let total = samples.len();
    let ctrl = Arc::clone(&handle.ctrl);
    let samples = Arc::new(samples);

    let cb_ctrl = Arc::clone(&ctrl);
    let cb_samples = Arc::clone(&samples);
    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let volume = f32::from_bits(cb_ctrl.volume.load(Ordering::SeqCst));
                let detached = cb_ctrl.detached.load(Ordering::SeqCst);

                for frame in data.chunks_mut(channels) {
                    let pos = cb_ctrl.position.load(Ordering::SeqCst);
                    let sample = if detached || pos >= cb_samples.len() {
                        0.0
                    } else {
                        cb_ctrl.position.store(pos + 1, Ordering::SeqCst);
                        cb_samples[pos] * volume
                    };
                    for out in frame.iter_mut() {
                        *out = sample;
                    }
                }
            },
            |err| {
                tracing::error!(error = %err, "audio output stream error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    let duration_ms = (total as u64 * 1000) / u64::from(PLAYBACK_SAMPLE_RATE);
    let deadline = Instant::now() + Duration::from_millis(duration_ms + 500);

    while Instant::now() < deadline {
        if ctrl.cancelled.load(Ordering::SeqCst)
            || ctrl.position.load(Ordering::SeqCst) >= total
        {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    // Let the device drain the final buffer before tearing the stream down
    if !ctrl.cancelled.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    drop(stream);
    tracing::debug!(samples = total, "playback ended");
    Ok(())
}

/// Decode MP3 bytes to mono f32 samples
fn decode_mp3(mp3_data: &[u8]) -> Result<Vec<f32>> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if frame.channels == 2 {
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    Ok(samples)
}
