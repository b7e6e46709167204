//! Domain-specific error types for the dongle bridge.
//!
//! All fallible operations return `Result<T, AutoboxError>`.
//! No panics on invalid input — every error is typed and recoverable.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the dongle bridge core.
#[derive(Debug, Error)]
pub enum AutoboxError {
    // ── Transport errors ─────────────────────────────────────────
    /// The USB layer reported an error.
    #[error("usb error: {0}")]
    Usb(#[from] rusb::Error),

    /// No adapter with a known vendor/product pair is attached.
    #[error("no dongle present (vid 0x1314, pid 0x1520/0x1521)")]
    NoDevice,

    /// The device disappeared mid-operation (unplug or reset).
    #[error("device gone")]
    DeviceGone,

    /// No interface exposes a bulk in/out endpoint pair.
    #[error("no bulk endpoint pair on any interface")]
    NoBulkEndpoints,

    /// The IO layer reported an error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // ── Protocol errors ──────────────────────────────────────────
    /// Received bytes that do not start with the frame magic.
    #[error("invalid frame magic: {found:#010x}")]
    InvalidMagic { found: u32 },

    /// The header checksum does not match the type word.
    #[error("header checksum mismatch: expected {expected:#010x}, found {found:#010x}")]
    ChecksumMismatch { expected: u32, found: u32 },

    /// Declared payload length exceeds the configured maximum.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A payload ended before its declared fields.
    #[error("truncated payload for type {tag:#04x}: needed {needed}, got {got}")]
    TruncatedPayload { tag: u32, needed: usize, got: usize },

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// A JSON payload (BoxInfo, media bag) failed to parse.
    #[error("json payload error: {0}")]
    Json(#[from] serde_json::Error),

    // ── Media errors ─────────────────────────────────────────────
    /// The SPS bitstream could not be parsed.
    #[error("sps parse error: {0}")]
    SpsParse(&'static str),

    /// The video decoder rejected a configuration.
    #[error("decoder configure failed: {0}")]
    DecoderConfigure(String),

    /// The video decoder failed on a chunk.
    #[error("decode error: {0}")]
    Decode(String),

    /// An audio stream carried a decode type outside the registry.
    #[error("unknown audio decode type {0}")]
    UnknownDecodeType(u8),

    /// The capture backend failed to open or run.
    #[error("capture error: {0}")]
    Capture(String),

    // ── Concurrency errors ───────────────────────────────────────
    /// A channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// The writer queue overflowed for a category that must not drop.
    #[error("writer queue overflow ({category})")]
    QueueOverflow { category: &'static str },

    // ── Lifecycle errors ─────────────────────────────────────────
    /// An operation was invoked in a state that does not permit it.
    #[error("cannot {op}: session is {state}")]
    InvalidState { op: &'static str, state: &'static str },

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl AutoboxError {
    /// `true` when the error means the device has physically left the
    /// bus, so the session should treat it as a detach rather than a
    /// fatal IO failure.
    pub fn is_device_gone(&self) -> bool {
        matches!(
            self,
            AutoboxError::DeviceGone
                | AutoboxError::Usb(rusb::Error::NoDevice)
                | AutoboxError::Usb(rusb::Error::NotFound)
        )
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for AutoboxError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        AutoboxError::ChannelClosed
    }
}
