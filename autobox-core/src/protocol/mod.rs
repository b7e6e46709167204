//! The framed dongle wire protocol: bit-exact encode/decode, no IO.
//!
//! ```text
//! USB bulk-in  ──► DongleCodec::decode ──► Message ──► demux
//! outbound     ──► Message::encode_frame ──► USB bulk-out
//! ```
//!
//! | Module    | Purpose                                         |
//! |---------- |-------------------------------------------------|
//! | `header`  | 16-byte frame header, magic + checksum          |
//! | `message` | Typed payload layouts for every tag             |
//! | `codec`   | Resumable framing over `tokio_util::codec`      |
//! | `nalu`    | Annex-B scanning, keyframe detection, SPS parse |

pub mod codec;
pub mod header;
pub mod message;
pub mod nalu;

// ── Re-exports ───────────────────────────────────────────────────

pub use codec::DongleCodec;
pub use header::{FrameHeader, FRAME_MAGIC, MAX_FRAME};
pub use message::{
    AudioCommand, AudioControl, AudioData, CommandValue, JsonBlob, MediaPayload, Message,
    MessageTag, OpenInfo, PhoneType, TouchAction, TouchEvent, TouchPoint, VideoData,
};
pub use nalu::{find_nalu, is_keyframe, iter_nalus, parse_sps, NaluType, SpsInfo};
