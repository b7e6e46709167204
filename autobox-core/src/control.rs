//! The host-facing control surface: typed events flowing up, commands
//! flowing down.
//!
//! The host never touches protocol bytes — it consumes [`CoreEvent`]s
//! from a channel and posts [`HostCommand`]s to the session.

use bytes::Bytes;
use serde_json::Value;

use crate::config::DongleConfig;
use crate::error::AutoboxError;
use crate::input::PointerUpdate;
use crate::protocol::{CommandValue, MediaPayload, PhoneType, TouchEvent};
use crate::usb::DeviceIdentity;

// ── CoreEvent ────────────────────────────────────────────────────

/// Events the core surfaces to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    Plugged {
        phone_type: PhoneType,
        wifi: Option<u32>,
    },
    Unplugged,
    /// First (or changed) video resolution observed on the stream.
    Resolution {
        width: u32,
        height: u32,
    },
    /// A new audio stream was opened.
    AudioInfo {
        codec: String,
        sample_rate: u32,
        channels: u16,
        bit_depth: u16,
    },
    /// Merged media metadata snapshot.
    MediaMeta(MediaMeta),
    /// In-band command notification from the dongle.
    Command(CommandValue),
    /// Identity of the attached adapter.
    DongleInfo(DeviceIdentity),
    /// Fatal: the host must Stop and Start again.
    Failure(String),
}

// ── HostCommand ──────────────────────────────────────────────────

/// Commands the host posts into the session.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    Start,
    Stop,
    SendKey(CommandValue),
    SendTouch(TouchEvent),
    /// One pointer changed; the session snapshots all active pointers.
    SendMultiTouch(PointerUpdate),
    /// Only accepted while the session is closed.
    SetConfig(Box<DongleConfig>),
    ForceReset,
}

// ── Media metadata merge ─────────────────────────────────────────

/// Merged now-playing state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaMeta {
    /// Opaque key → value bag from Data updates.
    pub media: Value,
    /// Most recent album cover, if any.
    pub album_cover: Option<Bytes>,
}

/// Accumulates partial MediaData updates.
///
/// The dongle interleaves Data and AlbumCover messages; each update
/// carries only what changed. Data updates merge per key and preserve
/// the cover; a cover update preserves the bag.
#[derive(Debug, Default, Clone)]
pub struct MediaMetaState {
    bag: serde_json::Map<String, Value>,
    album_cover: Option<Bytes>,
}

impl MediaMetaState {
    /// Fold one payload in and return the merged snapshot.
    pub fn apply(&mut self, payload: &MediaPayload) -> Result<MediaMeta, AutoboxError> {
        match payload {
            MediaPayload::Data(blob) => {
                if let Value::Object(update) = blob.value()? {
                    for (key, value) in update {
                        self.bag.insert(key, value);
                    }
                }
            }
            MediaPayload::AlbumCover(image) => {
                self.album_cover = Some(image.clone());
            }
        }
        Ok(self.snapshot())
    }

    pub fn snapshot(&self) -> MediaMeta {
        MediaMeta {
            media: Value::Object(self.bag.clone()),
            album_cover: self.album_cover.clone(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
