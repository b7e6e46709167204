//! The video pipeline: decode, pace, paint.
//!
//! ```text
//! VideoData ──► VideoPipeline (sps+idr gate, decode) ──► FrameCell
//!                                                            │
//!                       present loop @ 1000/fps ms ──► Renderer::draw
//! ```
//!
//! | Module     | Purpose                                       |
//! |----------- |-----------------------------------------------|
//! | `decoder`  | Decoder seam: configure / decode / reset      |
//! | `pipeline` | Gating, hw→sw fallback, error recovery        |
//! | `pacing`   | Single-slot pending cell + paced present loop |
//! | `renderer` | Capability probe and renderer selection       |

pub mod decoder;
pub mod pacing;
pub mod pipeline;
pub mod renderer;

// ── Re-exports ───────────────────────────────────────────────────

pub use decoder::{DecoderConfig, EncodedChunk, HwPreference, VideoDecoder, VideoFrame};
pub use pacing::{present_loop, FrameCell};
pub use pipeline::VideoPipeline;
pub use renderer::{
    probe_order, DecoderSupportQuery, Renderer, RendererKind, RendererProbe, RendererSelector,
};
