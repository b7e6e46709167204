//! Microphone capture: a continuous 16 kHz mono int16 stream framed
//! as upstream AudioData.
//!
//! The OS side lives behind [`CaptureBackend`] so command-routing
//! tests can run with a scripted backend. The shipped backend uses
//! cpal; when the host has no input device, `start` is a no-op and
//! the session continues without upstream audio.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::audio::decode_types::MIC_DECODE_TYPE;
use crate::error::AutoboxError;
use crate::protocol::{AudioData, Message};
use crate::session::outbound::{FrameCategory, OutboundQueue};

/// Capture sample rate the dongle expects upstream.
pub const MIC_SAMPLE_RATE: u32 = 16_000;

// ── CaptureBackend ───────────────────────────────────────────────

/// Produces raw 16 kHz mono int16 PCM chunks.
pub trait CaptureBackend: Send + 'static {
    /// Begin capturing into `tx`.
    ///
    /// Returns `Ok(false)` when no capture endpoint is present (the
    /// caller treats start as a no-op). Capture failures after a
    /// successful start are logged by the backend and end the chunk
    /// stream without tearing down the session.
    fn start(&mut self, tx: mpsc::UnboundedSender<Bytes>) -> Result<bool, AutoboxError>;

    /// Stop capturing and release the device. Idempotent.
    fn stop(&mut self);
}

// ── Microphone ───────────────────────────────────────────────────

/// Owns the capture backend and frames chunks for the writer queue.
pub struct Microphone {
    backend: Box<dyn CaptureBackend>,
    outbound: Arc<OutboundQueue>,
    forward: Option<tokio::task::JoinHandle<()>>,
    running: bool,
}

impl Microphone {
    pub fn new(backend: Box<dyn CaptureBackend>, outbound: Arc<OutboundQueue>) -> Self {
        Self {
            backend,
            outbound,
            forward: None,
            running: false,
        }
    }

    /// Start capturing. Re-entrant: a running capture is replaced.
    pub fn start(&mut self) {
        self.stop();

        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        match self.backend.start(tx) {
            Ok(true) => {
                let outbound = Arc::clone(&self.outbound);
                self.forward = Some(tokio::spawn(async move {
                    // Chunks arrive in capture order and leave in the
                    // same order; the queue may shed the oldest under
                    // pressure.
                    while let Some(chunk) = rx.recv().await {
                        let frame =
                            Message::AudioData(AudioData::pcm_frame(MIC_DECODE_TYPE, 0, chunk));
                        if let Err(err) = outbound.push(FrameCategory::AudioUpstream, frame) {
                            debug!("mic frame not queued: {err}");
                            if matches!(err, AutoboxError::ChannelClosed) {
                                break;
                            }
                        }
                    }
                }));
                self.running = true;
            }
            Ok(false) => {
                debug!("no capture endpoint; microphone start is a no-op");
            }
            Err(err) => {
                warn!("microphone start failed: {err}");
            }
        }
    }

    /// Stop capturing and release the device. Idempotent.
    pub fn stop(&mut self) {
        self.backend.stop();
        if let Some(task) = self.forward.take() {
            task.abort();
        }
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

// ── NullBackend ──────────────────────────────────────────────────

/// Backend for hosts without audio input; `start` always no-ops.
#[derive(Debug, Default)]
pub struct NullBackend;

impl CaptureBackend for NullBackend {
    fn start(&mut self, _tx: mpsc::UnboundedSender<Bytes>) -> Result<bool, AutoboxError> {
        Ok(false)
    }

    fn stop(&mut self) {}
}

// ── CpalBackend ──────────────────────────────────────────────────

/// OS capture via cpal's default input device.
#[derive(Default)]
pub struct CpalBackend {
    stop: Option<Arc<AtomicBool>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaptureBackend for CpalBackend {
    fn start(&mut self, tx: mpsc::UnboundedSender<Bytes>) -> Result<bool, AutoboxError> {
        self.stop();

        use cpal::traits::HostTrait;
        let host = cpal::default_host();
        if host.default_input_device().is_none() {
            return Ok(false);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        // The cpal stream is !Send, so the capture thread owns it for
        // its whole lifetime.
        let thread = thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || {
                if let Err(err) = capture_thread(tx, stop_flag) {
                    warn!("microphone capture ended: {err}");
                }
            })
            .map_err(|e| AutoboxError::Capture(e.to_string()))?;

        self.stop = Some(stop);
        self.thread = Some(thread);
        Ok(true)
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.store(true, Ordering::SeqCst);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        CaptureBackend::stop(self);
    }
}

fn capture_thread(
    tx: mpsc::UnboundedSender<Bytes>,
    stop: Arc<AtomicBool>,
) -> Result<(), AutoboxError> {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::SampleFormat;

    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| AutoboxError::Capture("input device disappeared".into()))?;

    let supported = device
        .default_input_config()
        .map_err(|e| AutoboxError::Capture(e.to_string()))?;
    let in_rate = supported.sample_rate().0;
    let in_channels = supported.channels() as usize;
    let config: cpal::StreamConfig = supported.config();

    let err_fn = |err| warn!("capture stream error: {err}");
    let stream = match supported.sample_format() {
        SampleFormat::I16 => {
            let tx = tx.clone();
            device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let chunk = downmix_resample_i16(data, in_channels, in_rate);
                    let _ = tx.send(samples_to_bytes(&chunk));
                },
                err_fn,
                None,
            )
        }
        SampleFormat::F32 => {
            let tx = tx.clone();
            device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let ints: Vec<i16> = data
                        .iter()
                        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                        .collect();
                    let chunk = downmix_resample_i16(&ints, in_channels, in_rate);
                    let _ = tx.send(samples_to_bytes(&chunk));
                },
                err_fn,
                None,
            )
        }
        other => {
            return Err(AutoboxError::Capture(format!(
                "unsupported capture sample format {other:?}"
            )))
        }
    }
    .map_err(|e| AutoboxError::Capture(e.to_string()))?;

    stream
        .play()
        .map_err(|e| AutoboxError::Capture(e.to_string()))?;

    while !stop.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(50));
    }
    drop(stream);
    Ok(())
}

/// Take channel 0 and nearest-neighbour resample to 16 kHz.
fn downmix_resample_i16(input: &[i16], channels: usize, in_rate: u32) -> Vec<i16> {
    let frames = input.len() / channels.max(1);
    if in_rate == MIC_SAMPLE_RATE && channels == 1 {
        return input.to_vec();
    }
    let out_frames = (frames as u64 * MIC_SAMPLE_RATE as u64 / in_rate as u64) as usize;
    (0..out_frames)
        .map(|i| {
            let src = (i as u64 * in_rate as u64 / MIC_SAMPLE_RATE as u64) as usize;
            input[src.min(frames.saturating_sub(1)) * channels]
        })
        .collect()
}

fn samples_to_bytes(samples: &[i16]) -> Bytes {
    let mut buf = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        buf.extend_from_slice(&s.to_le_bytes());
    }
    Bytes::from(buf)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Scripted backend: reports a present device and counts calls.
    #[derive(Default)]
    pub struct ScriptedBackend {
        pub starts: usize,
        pub stops: usize,
    }

    impl CaptureBackend for ScriptedBackend {
        fn start(&mut self, _tx: mpsc::UnboundedSender<Bytes>) -> Result<bool, AutoboxError> {
            self.starts += 1;
            Ok(true)
        }

        fn stop(&mut self) {
            self.stops += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::ScriptedBackend;
    use super::*;

    fn mic() -> Microphone {
        Microphone::new(
            Box::new(ScriptedBackend::default()),
            Arc::new(OutboundQueue::new(16)),
        )
    }

    #[tokio::test]
    async fn start_is_reentrant_and_stop_idempotent() {
        let mut mic = mic();
        assert!(!mic.is_running());

        mic.start();
        assert!(mic.is_running());
        // Re-entrant start replaces the previous capture.
        mic.start();
        assert!(mic.is_running());

        mic.stop();
        assert!(!mic.is_running());
        mic.stop();
        assert!(!mic.is_running());
    }

    #[tokio::test]
    async fn null_backend_makes_start_a_noop() {
        let mut mic = Microphone::new(
            Box::new(NullBackend),
            Arc::new(OutboundQueue::new(16)),
        );
        mic.start();
        assert!(!mic.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn chunks_are_framed_as_upstream_audio() {
        let outbound = Arc::new(OutboundQueue::new(16));
        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();

        let mut mic = Microphone::new(Box::new(CaptureTap { outer: Some(rx) }), outbound.clone());
        mic.start();
        tx.send(Bytes::from_static(&[0x01, 0x00, 0x02, 0x00])).unwrap();

        // Allow the forward task to run.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        match outbound.pop_blocking(Duration::from_millis(200)) {
            crate::session::outbound::PopResult::Frame(f) => {
                assert_eq!(f.category, FrameCategory::AudioUpstream);
                match f.message {
                    Message::AudioData(a) => {
                        assert_eq!(a.decode_type, MIC_DECODE_TYPE);
                        assert_eq!(a.data, Bytes::from_static(&[0x01, 0x00, 0x02, 0x00]));
                    }
                    other => panic!("expected AudioData, got {other:?}"),
                }
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    /// Backend that pipes an external receiver into the mic channel.
    struct CaptureTap {
        outer: Option<mpsc::UnboundedReceiver<Bytes>>,
    }

    impl CaptureBackend for CaptureTap {
        fn start(&mut self, tx: mpsc::UnboundedSender<Bytes>) -> Result<bool, AutoboxError> {
            let mut outer = self.outer.take().expect("single start");
            tokio::spawn(async move {
                while let Some(chunk) = outer.recv().await {
                    if tx.send(chunk).is_err() {
                        break;
                    }
                }
            });
            Ok(true)
        }

        fn stop(&mut self) {}
    }

    #[test]
    fn downmix_resample_takes_channel_zero() {
        // 32 kHz stereo → 16 kHz mono: every other left sample.
        let input: Vec<i16> = vec![10, -1, 20, -2, 30, -3, 40, -4];
        let out = downmix_resample_i16(&input, 2, 32_000);
        assert_eq!(out, vec![10, 30]);
    }

    #[test]
    fn passthrough_when_already_native() {
        let input = vec![1i16, 2, 3];
        assert_eq!(downmix_resample_i16(&input, 1, 16_000), input);
    }
}
