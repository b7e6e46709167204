//! The closed registry mapping a dongle `decodeType` to PCM metadata.
//!
//! Pinned against the reference firmware; anything outside this table
//! is an unknown stream and gets dropped (reported once).

use crate::error::AutoboxError;

/// PCM stream parameters for one decode type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub mime: &'static str,
    pub frequency: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

/// Decode type the microphone upstream uses (16 kHz mono).
pub const MIC_DECODE_TYPE: u8 = 5;

/// Look up a decode type in the registry.
pub fn decode_type_format(decode_type: u8) -> Result<AudioFormat, AutoboxError> {
    let (frequency, channels) = match decode_type {
        1 | 2 => (44_100, 2),
        3 => (8_000, 1),
        4 => (48_000, 2),
        5 => (16_000, 1),
        6 => (24_000, 1),
        7 => (16_000, 2),
        other => return Err(AutoboxError::UnknownDecodeType(other)),
    };
    Ok(AudioFormat {
        mime: "audio/pcm",
        frequency,
        channels,
        bit_depth: 16,
    })
}
