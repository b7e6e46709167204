//! The decoder seam the video pipeline drives.
//!
//! Actual H.264 decoding is a platform collaborator (VideoToolbox,
//! VAAPI, a software fallback…); the pipeline only needs configure /
//! decode / reset with a hardware-preference knob, so that is the
//! whole trait.

use bytes::Bytes;

use crate::error::AutoboxError;

// ── Configuration ────────────────────────────────────────────────

/// Hardware acceleration preference for a configure attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HwPreference {
    PreferHardware,
    PreferSoftware,
}

/// Decoder configuration derived from the stream's SPS.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderConfig {
    /// RFC 6381 string, e.g. `avc1.64002A`.
    pub codec: String,
    pub coded_width: u32,
    pub coded_height: u32,
    pub hw: HwPreference,
    /// Always set: frames are for display, not transcoding.
    pub optimize_for_latency: bool,
    /// The raw SPS NAL unit, for decoders that take a description.
    pub sps: Bytes,
}

// ── Frames ───────────────────────────────────────────────────────

/// One access unit handed to the decoder.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub keyframe: bool,
    pub timestamp: u32,
    /// Annex-B byte stream.
    pub data: Bytes,
}

/// A decoded picture ready for the renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub timestamp: u32,
    /// Pixel data in the decoder's output format.
    pub data: Bytes,
}

// ── VideoDecoder ─────────────────────────────────────────────────

/// Platform decoder driven by the pipeline.
pub trait VideoDecoder: Send + 'static {
    /// Apply a configuration. Called once per SPS+IDR gate; a failed
    /// hardware attempt is retried with software preference.
    fn configure(&mut self, config: &DecoderConfig) -> Result<(), AutoboxError>;

    /// Decode one chunk, returning zero or more output frames.
    fn decode(&mut self, chunk: EncodedChunk) -> Result<Vec<VideoFrame>, AutoboxError>;

    /// Discard internal state; the pipeline will reconfigure.
    fn reset(&mut self);
}

impl VideoDecoder for Box<dyn VideoDecoder> {
    fn configure(&mut self, config: &DecoderConfig) -> Result<(), AutoboxError> {
        (**self).configure(config)
    }

    fn decode(&mut self, chunk: EncodedChunk) -> Result<Vec<VideoFrame>, AutoboxError> {
        (**self).decode(chunk)
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}
