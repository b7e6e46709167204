//! Typed dongle messages and their byte-exact payload layouts.
//!
//! Every payload is little-endian. Layouts pinned from the reference
//! firmware capture:
//!
//! | tag   | message          | payload |
//! |-------|------------------|---------|
//! | 0x01  | Open             | `width:u32 height:u32 fps:u32 format:u32 packetMax:u32 iBoxVersion:u32 phoneWorkMode:u32` |
//! | 0x02  | Plugged          | `phoneType:u32 [wifi:u32]` |
//! | 0x03  | Ack              | `value:u32` |
//! | 0x04  | Unplugged        | empty |
//! | 0x05  | Touch            | `x:f32 y:f32 action:u32` |
//! | 0x06  | VideoData        | `width:u32 height:u32 flags:u32 timestamp:u32 reserved:u32` + Annex-B H.264 |
//! | 0x07  | AudioData        | `decodeType:u8 audioType:u8 reserved:u16` + control block or PCM (see below) |
//! | 0x08  | Command          | `value:u32` |
//! | 0x14  | BoxInfo          | JSON settings object |
//! | 0x17  | MultiTouch       | `count:u32` then per pointer `id:u32 x:f32 y:f32 action:u32` |
//! | 0x19  | BoxSettings      | JSON settings object |
//! | 0x2A  | MediaData        | `mediaType:u32` + NUL-terminated JSON (Data) or image bytes (AlbumCover) |
//! | 0x99  | SendFile         | `pathLen:u32` path+NUL `contentLen:u32` content |
//! | 0xAA  | HeartBeat        | empty |
//! | 0xCC  | SoftwareVersion  | ASCII |
//!
//! An AudioData payload of exactly 16 bytes carries the control block
//! `command:u32 volume:f32 durationMs:u32` (command 0 = volume ramp
//! only); any other length carries interleaved int16 PCM from offset 4.
//!
//! Unknown tags are surfaced as [`Message::Unknown`] rather than
//! dropped, so upper layers can log without losing the transport.

use std::fmt;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::AutoboxError;
use crate::protocol::header::FrameHeader;

// ── MessageTag ───────────────────────────────────────────────────

/// Wire tags for every message the driver understands.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTag {
    Open = 0x01,
    Plugged = 0x02,
    Ack = 0x03,
    Unplugged = 0x04,
    Touch = 0x05,
    VideoData = 0x06,
    AudioData = 0x07,
    Command = 0x08,
    BoxInfo = 0x14,
    MultiTouch = 0x17,
    BoxSettings = 0x19,
    MediaData = 0x2A,
    SendFile = 0x99,
    HeartBeat = 0xAA,
    SoftwareVersion = 0xCC,
}

// ── PhoneType ────────────────────────────────────────────────────

/// Kind of phone the dongle reports on Plugged.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PhoneType {
    AndroidMirror = 1,
    CarPlay = 3,
    IPhoneMirror = 4,
    AndroidAuto = 5,
    HiCar = 6,
}

impl TryFrom<u32> for PhoneType {
    type Error = AutoboxError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PhoneType::AndroidMirror),
            3 => Ok(PhoneType::CarPlay),
            4 => Ok(PhoneType::IPhoneMirror),
            5 => Ok(PhoneType::AndroidAuto),
            6 => Ok(PhoneType::HiCar),
            _ => Err(AutoboxError::UnknownVariant {
                type_name: "PhoneType",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for PhoneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── CommandValue ─────────────────────────────────────────────────

/// The closed command set, shared by inbound notifications and
/// outbound key presses.
///
/// Ranges as observed on the reference firmware:
/// - `1..=25` — driver/box control
/// - `100..=114` — navigation keys
/// - `200..=205` — media transport keys
/// - `500..=501` — video focus
/// - `1000..=1012` — wifi/bluetooth pairing flow
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandValue {
    StartRecordAudio = 1,
    StopRecordAudio = 2,
    RequestHostUi = 3,
    Siri = 5,
    Mic = 7,
    Frame = 12,
    BoxMic = 15,
    EnableNightMode = 16,
    DisableNightMode = 17,
    AudioTransferOn = 22,
    AudioTransferOff = 23,
    Wifi24g = 24,
    Wifi5g = 25,
    Left = 100,
    Right = 101,
    SelectDown = 104,
    SelectUp = 105,
    Back = 106,
    Down = 114,
    Home = 200,
    Play = 201,
    Pause = 202,
    PlayOrPause = 203,
    Next = 204,
    Prev = 205,
    RequestVideoFocus = 500,
    ReleaseVideoFocus = 501,
    WifiEnable = 1000,
    AutoConnectEnable = 1001,
    WifiConnect = 1002,
    ScanningDevice = 1003,
    DeviceFound = 1004,
    DeviceNotFound = 1005,
    ConnectDeviceFailed = 1006,
    BtConnected = 1007,
    BtDisconnected = 1008,
    WifiConnected = 1009,
    WifiDisconnected = 1010,
    BtPairStart = 1011,
    WifiPair = 1012,
}

impl TryFrom<u32> for CommandValue {
    type Error = AutoboxError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use CommandValue::*;
        Ok(match value {
            1 => StartRecordAudio,
            2 => StopRecordAudio,
            3 => RequestHostUi,
            5 => Siri,
            7 => Mic,
            12 => Frame,
            15 => BoxMic,
            16 => EnableNightMode,
            17 => DisableNightMode,
            22 => AudioTransferOn,
            23 => AudioTransferOff,
            24 => Wifi24g,
            25 => Wifi5g,
            100 => Left,
            101 => Right,
            104 => SelectDown,
            105 => SelectUp,
            106 => Back,
            114 => Down,
            200 => Home,
            201 => Play,
            202 => Pause,
            203 => PlayOrPause,
            204 => Next,
            205 => Prev,
            500 => RequestVideoFocus,
            501 => ReleaseVideoFocus,
            1000 => WifiEnable,
            1001 => AutoConnectEnable,
            1002 => WifiConnect,
            1003 => ScanningDevice,
            1004 => DeviceFound,
            1005 => DeviceNotFound,
            1006 => ConnectDeviceFailed,
            1007 => BtConnected,
            1008 => BtDisconnected,
            1009 => WifiConnected,
            1010 => WifiDisconnected,
            1011 => BtPairStart,
            1012 => WifiPair,
            _ => {
                return Err(AutoboxError::UnknownVariant {
                    type_name: "CommandValue",
                    value: value as u64,
                })
            }
        })
    }
}

impl fmt::Display for CommandValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── AudioCommand ─────────────────────────────────────────────────

/// In-band audio stream commands carried by AudioData control blocks.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioCommand {
    OutputStart = 1,
    OutputStop = 2,
    InputConfig = 3,
    PhonecallStart = 4,
    PhonecallStop = 5,
    NaviStart = 6,
    NaviStop = 7,
    SiriStart = 8,
    SiriStop = 9,
    MediaStart = 10,
    MediaStop = 11,
    AlertStart = 12,
    AlertStop = 13,
}

impl TryFrom<u32> for AudioCommand {
    type Error = AutoboxError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use AudioCommand::*;
        Ok(match value {
            1 => OutputStart,
            2 => OutputStop,
            3 => InputConfig,
            4 => PhonecallStart,
            5 => PhonecallStop,
            6 => NaviStart,
            7 => NaviStop,
            8 => SiriStart,
            9 => SiriStop,
            10 => MediaStart,
            11 => MediaStop,
            12 => AlertStart,
            13 => AlertStop,
            _ => {
                return Err(AutoboxError::UnknownVariant {
                    type_name: "AudioCommand",
                    value: value as u64,
                })
            }
        })
    }
}

// ── TouchAction ──────────────────────────────────────────────────

/// Pointer phase for single- and multi-touch frames.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TouchAction {
    Down = 0,
    Move = 1,
    Up = 2,
}

impl TryFrom<u32> for TouchAction {
    type Error = AutoboxError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TouchAction::Down),
            1 => Ok(TouchAction::Move),
            2 => Ok(TouchAction::Up),
            _ => Err(AutoboxError::UnknownVariant {
                type_name: "TouchAction",
                value: value as u64,
            }),
        }
    }
}

// ── Payload structs ──────────────────────────────────────────────

/// The Open configuration block (also echoed back by the dongle as
/// its open acknowledgement).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenInfo {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: u32,
    pub packet_max: u32,
    pub i_box_version: u32,
    pub phone_work_mode: u32,
}

impl OpenInfo {
    pub const SIZE: usize = 28;
}

/// One H.264 access unit with the 20-byte vendor prefix stripped.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoData {
    pub width: u32,
    pub height: u32,
    pub flags: u32,
    pub timestamp: u32,
    pub reserved: u32,
    /// Annex-B byte stream (0x00000001 start codes).
    pub payload: Bytes,
}

/// The 12-byte control block a 16-byte AudioData payload carries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioControl {
    /// In-band stream command; `None` for a volume-ramp-only frame.
    pub command: Option<AudioCommand>,
    pub volume: f32,
    pub volume_duration_ms: u32,
}

/// One PCM chunk or audio control message.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioData {
    pub decode_type: u8,
    pub audio_type: u8,
    /// Present exactly when this is a control frame.
    pub control: Option<AudioControl>,
    /// Interleaved int16 LE samples; empty for control frames.
    pub data: Bytes,
}

impl AudioData {
    /// `true` when the stream belongs to the navigation volume channel.
    pub fn is_nav(&self) -> bool {
        matches!(self.audio_type, 2 | 3)
    }

    /// The in-band command, if this is a command frame.
    pub fn command(&self) -> Option<AudioCommand> {
        self.control.and_then(|c| c.command)
    }

    /// A control frame carrying `command` for the given stream.
    pub fn command_frame(decode_type: u8, audio_type: u8, command: AudioCommand) -> Self {
        Self {
            decode_type,
            audio_type,
            control: Some(AudioControl {
                command: Some(command),
                volume: 0.0,
                volume_duration_ms: 0,
            }),
            data: Bytes::new(),
        }
    }

    /// A PCM data frame for the given stream.
    pub fn pcm_frame(decode_type: u8, audio_type: u8, data: Bytes) -> Self {
        Self {
            decode_type,
            audio_type,
            control: None,
            data,
        }
    }
}

/// A single-touch event, normalized to the unit square.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TouchEvent {
    pub x: f32,
    pub y: f32,
    pub action: TouchAction,
}

/// One pointer inside a multi-touch snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TouchPoint {
    pub id: u32,
    pub x: f32,
    pub y: f32,
    pub action: TouchAction,
}

/// A JSON payload kept byte-exact.
///
/// The raw bytes are preserved so re-encoding a decoded frame yields
/// the identical byte sequence; [`JsonBlob::value`] parses on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonBlob {
    raw: Bytes,
}

impl JsonBlob {
    pub fn from_raw(raw: Bytes) -> Self {
        Self { raw }
    }

    pub fn from_value(value: &serde_json::Value) -> Self {
        Self {
            raw: Bytes::from(serde_json::to_vec(value).expect("serializing a Value cannot fail")),
        }
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Parse the blob, tolerating the firmware's trailing NULs.
    pub fn value(&self) -> Result<serde_json::Value, AutoboxError> {
        let end = self
            .raw
            .iter()
            .rposition(|&b| b != 0)
            .map(|i| i + 1)
            .unwrap_or(0);
        Ok(serde_json::from_slice(&self.raw[..end])?)
    }
}

/// Media metadata: either a JSON bag or an album-cover image.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaPayload {
    Data(JsonBlob),
    AlbumCover(Bytes),
}

impl MediaPayload {
    const TYPE_DATA: u32 = 1;
    const TYPE_ALBUM_COVER: u32 = 3;
}

// ── Message ──────────────────────────────────────────────────────

/// A decoded dongle frame, either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Open(OpenInfo),
    Plugged {
        phone_type: PhoneType,
        wifi: Option<u32>,
    },
    Ack {
        value: u32,
    },
    Unplugged,
    Touch(TouchEvent),
    VideoData(VideoData),
    AudioData(AudioData),
    Command(CommandValue),
    BoxInfo(JsonBlob),
    MultiTouch(Vec<TouchPoint>),
    BoxSettings(JsonBlob),
    MediaData(MediaPayload),
    SendFile {
        path: String,
        content: Bytes,
    },
    HeartBeat,
    SoftwareVersion(Bytes),
    /// A tag outside the table above, surfaced for logging.
    Unknown {
        tag: u32,
        payload: Bytes,
    },
}

fn need(tag: u32, payload: &[u8], needed: usize) -> Result<(), AutoboxError> {
    if payload.len() < needed {
        return Err(AutoboxError::TruncatedPayload {
            tag,
            needed,
            got: payload.len(),
        });
    }
    Ok(())
}

fn u32_at(payload: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(payload[offset..offset + 4].try_into().expect("4-byte slice"))
}

fn f32_at(payload: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes(payload[offset..offset + 4].try_into().expect("4-byte slice"))
}

impl Message {
    /// Wire tag for this message.
    pub fn tag(&self) -> u32 {
        match self {
            Message::Open(_) => MessageTag::Open as u32,
            Message::Plugged { .. } => MessageTag::Plugged as u32,
            Message::Ack { .. } => MessageTag::Ack as u32,
            Message::Unplugged => MessageTag::Unplugged as u32,
            Message::Touch(_) => MessageTag::Touch as u32,
            Message::VideoData(_) => MessageTag::VideoData as u32,
            Message::AudioData(_) => MessageTag::AudioData as u32,
            Message::Command(_) => MessageTag::Command as u32,
            Message::BoxInfo(_) => MessageTag::BoxInfo as u32,
            Message::MultiTouch(_) => MessageTag::MultiTouch as u32,
            Message::BoxSettings(_) => MessageTag::BoxSettings as u32,
            Message::MediaData(_) => MessageTag::MediaData as u32,
            Message::SendFile { .. } => MessageTag::SendFile as u32,
            Message::HeartBeat => MessageTag::HeartBeat as u32,
            Message::SoftwareVersion(_) => MessageTag::SoftwareVersion as u32,
            Message::Unknown { tag, .. } => *tag,
        }
    }

    /// Decode a payload for the given tag.
    ///
    /// Unknown tags succeed as [`Message::Unknown`]; malformed payloads
    /// for known tags are errors and the frame is dropped upstream.
    pub fn decode_payload(tag: u32, payload: Bytes) -> Result<Message, AutoboxError> {
        match tag {
            t if t == MessageTag::Open as u32 => {
                need(tag, &payload, OpenInfo::SIZE)?;
                Ok(Message::Open(OpenInfo {
                    width: u32_at(&payload, 0),
                    height: u32_at(&payload, 4),
                    fps: u32_at(&payload, 8),
                    format: u32_at(&payload, 12),
                    packet_max: u32_at(&payload, 16),
                    i_box_version: u32_at(&payload, 20),
                    phone_work_mode: u32_at(&payload, 24),
                }))
            }
            t if t == MessageTag::Plugged as u32 => {
                need(tag, &payload, 4)?;
                let phone_type = PhoneType::try_from(u32_at(&payload, 0))?;
                let wifi = (payload.len() >= 8).then(|| u32_at(&payload, 4));
                Ok(Message::Plugged { phone_type, wifi })
            }
            t if t == MessageTag::Ack as u32 => {
                need(tag, &payload, 4)?;
                Ok(Message::Ack {
                    value: u32_at(&payload, 0),
                })
            }
            t if t == MessageTag::Unplugged as u32 => Ok(Message::Unplugged),
            t if t == MessageTag::Touch as u32 => {
                need(tag, &payload, 12)?;
                Ok(Message::Touch(TouchEvent {
                    x: f32_at(&payload, 0),
                    y: f32_at(&payload, 4),
                    action: TouchAction::try_from(u32_at(&payload, 8))?,
                }))
            }
            t if t == MessageTag::VideoData as u32 => {
                need(tag, &payload, 20)?;
                Ok(Message::VideoData(VideoData {
                    width: u32_at(&payload, 0),
                    height: u32_at(&payload, 4),
                    flags: u32_at(&payload, 8),
                    timestamp: u32_at(&payload, 12),
                    reserved: u32_at(&payload, 16),
                    payload: payload.slice(20..),
                }))
            }
            t if t == MessageTag::AudioData as u32 => {
                need(tag, &payload, 4)?;
                let decode_type = payload[0];
                let audio_type = payload[1];
                if payload.len() == 16 {
                    let raw_cmd = u32_at(&payload, 4);
                    let command = if raw_cmd == 0 {
                        None
                    } else {
                        Some(AudioCommand::try_from(raw_cmd)?)
                    };
                    Ok(Message::AudioData(AudioData {
                        decode_type,
                        audio_type,
                        control: Some(AudioControl {
                            command,
                            volume: f32_at(&payload, 8),
                            volume_duration_ms: u32_at(&payload, 12),
                        }),
                        data: Bytes::new(),
                    }))
                } else {
                    Ok(Message::AudioData(AudioData {
                        decode_type,
                        audio_type,
                        control: None,
                        data: payload.slice(4..),
                    }))
                }
            }
            t if t == MessageTag::Command as u32 => {
                need(tag, &payload, 4)?;
                Ok(Message::Command(CommandValue::try_from(u32_at(
                    &payload, 0,
                ))?))
            }
            t if t == MessageTag::BoxInfo as u32 => Ok(Message::BoxInfo(JsonBlob::from_raw(payload))),
            t if t == MessageTag::MultiTouch as u32 => {
                need(tag, &payload, 4)?;
                let count = u32_at(&payload, 0) as usize;
                need(tag, &payload, 4 + count * 16)?;
                let mut points = Vec::with_capacity(count);
                for i in 0..count {
                    let base = 4 + i * 16;
                    points.push(TouchPoint {
                        id: u32_at(&payload, base),
                        x: f32_at(&payload, base + 4),
                        y: f32_at(&payload, base + 8),
                        action: TouchAction::try_from(u32_at(&payload, base + 12))?,
                    });
                }
                Ok(Message::MultiTouch(points))
            }
            t if t == MessageTag::BoxSettings as u32 => {
                Ok(Message::BoxSettings(JsonBlob::from_raw(payload)))
            }
            t if t == MessageTag::MediaData as u32 => {
                need(tag, &payload, 4)?;
                let media_type = u32_at(&payload, 0);
                let body = payload.slice(4..);
                match media_type {
                    MediaPayload::TYPE_DATA => {
                        Ok(Message::MediaData(MediaPayload::Data(JsonBlob::from_raw(body))))
                    }
                    MediaPayload::TYPE_ALBUM_COVER => {
                        Ok(Message::MediaData(MediaPayload::AlbumCover(body)))
                    }
                    other => Err(AutoboxError::UnknownVariant {
                        type_name: "MediaType",
                        value: other as u64,
                    }),
                }
            }
            t if t == MessageTag::SendFile as u32 => {
                need(tag, &payload, 4)?;
                let path_len = u32_at(&payload, 0) as usize;
                need(tag, &payload, 4 + path_len + 4)?;
                let raw_path = &payload[4..4 + path_len];
                let path = String::from_utf8_lossy(raw_path.strip_suffix(&[0]).unwrap_or(raw_path))
                    .into_owned();
                let content_len = u32_at(&payload, 4 + path_len) as usize;
                need(tag, &payload, 8 + path_len + content_len)?;
                Ok(Message::SendFile {
                    path,
                    content: payload.slice(8 + path_len..8 + path_len + content_len),
                })
            }
            t if t == MessageTag::HeartBeat as u32 => Ok(Message::HeartBeat),
            t if t == MessageTag::SoftwareVersion as u32 => Ok(Message::SoftwareVersion(payload)),
            _ => Ok(Message::Unknown { tag, payload }),
        }
    }

    /// Encode the payload bytes (no header).
    pub fn encode_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Message::Open(info) => {
                for v in [
                    info.width,
                    info.height,
                    info.fps,
                    info.format,
                    info.packet_max,
                    info.i_box_version,
                    info.phone_work_mode,
                ] {
                    buf.extend_from_slice(&v.to_le_bytes());
                }
            }
            Message::Plugged { phone_type, wifi } => {
                buf.extend_from_slice(&(*phone_type as u32).to_le_bytes());
                if let Some(wifi) = wifi {
                    buf.extend_from_slice(&wifi.to_le_bytes());
                }
            }
            Message::Ack { value } => buf.extend_from_slice(&value.to_le_bytes()),
            Message::Unplugged | Message::HeartBeat => {}
            Message::Touch(t) => {
                buf.extend_from_slice(&t.x.to_le_bytes());
                buf.extend_from_slice(&t.y.to_le_bytes());
                buf.extend_from_slice(&(t.action as u32).to_le_bytes());
            }
            Message::VideoData(v) => {
                for field in [v.width, v.height, v.flags, v.timestamp, v.reserved] {
                    buf.extend_from_slice(&field.to_le_bytes());
                }
                buf.extend_from_slice(&v.payload);
            }
            Message::AudioData(a) => {
                buf.extend_from_slice(&[a.decode_type, a.audio_type, 0, 0]);
                if let Some(control) = &a.control {
                    let raw_cmd = control.command.map(|c| c as u32).unwrap_or(0);
                    buf.extend_from_slice(&raw_cmd.to_le_bytes());
                    buf.extend_from_slice(&control.volume.to_le_bytes());
                    buf.extend_from_slice(&control.volume_duration_ms.to_le_bytes());
                } else {
                    buf.extend_from_slice(&a.data);
                }
            }
            Message::Command(c) => buf.extend_from_slice(&(*c as u32).to_le_bytes()),
            Message::BoxInfo(blob) | Message::BoxSettings(blob) => {
                buf.extend_from_slice(blob.raw());
            }
            Message::MultiTouch(points) => {
                buf.extend_from_slice(&(points.len() as u32).to_le_bytes());
                for p in points {
                    buf.extend_from_slice(&p.id.to_le_bytes());
                    buf.extend_from_slice(&p.x.to_le_bytes());
                    buf.extend_from_slice(&p.y.to_le_bytes());
                    buf.extend_from_slice(&(p.action as u32).to_le_bytes());
                }
            }
            Message::MediaData(media) => match media {
                MediaPayload::Data(blob) => {
                    buf.extend_from_slice(&MediaPayload::TYPE_DATA.to_le_bytes());
                    buf.extend_from_slice(blob.raw());
                }
                MediaPayload::AlbumCover(image) => {
                    buf.extend_from_slice(&MediaPayload::TYPE_ALBUM_COVER.to_le_bytes());
                    buf.extend_from_slice(image);
                }
            },
            Message::SendFile { path, content } => {
                buf.extend_from_slice(&((path.len() + 1) as u32).to_le_bytes());
                buf.extend_from_slice(path.as_bytes());
                buf.extend_from_slice(&[0]);
                buf.extend_from_slice(&(content.len() as u32).to_le_bytes());
                buf.extend_from_slice(content);
            }
            Message::SoftwareVersion(raw) => buf.extend_from_slice(raw),
            Message::Unknown { payload, .. } => buf.extend_from_slice(payload),
        }
        buf.freeze()
    }

    /// Encode a complete frame: header plus payload.
    pub fn encode_frame(&self) -> Bytes {
        let payload = self.encode_payload();
        let header = FrameHeader::new(self.tag(), payload.len() as u32);
        let mut buf = BytesMut::with_capacity(FrameHeader::SIZE + payload.len());
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(&payload);
        buf.freeze()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let payload = msg.encode_payload();
        let decoded = Message::decode_payload(msg.tag(), payload.clone()).unwrap();
        assert_eq!(decoded, msg);
        // Same semantics and same length back out.
        assert_eq!(decoded.encode_payload(), payload);
    }

    #[test]
    fn open_roundtrip() {
        roundtrip(Message::Open(OpenInfo {
            width: 800,
            height: 480,
            fps: 20,
            format: 5,
            packet_max: 49152,
            i_box_version: 2,
            phone_work_mode: 2,
        }));
    }

    #[test]
    fn plugged_with_and_without_wifi() {
        roundtrip(Message::Plugged {
            phone_type: PhoneType::CarPlay,
            wifi: None,
        });
        roundtrip(Message::Plugged {
            phone_type: PhoneType::AndroidAuto,
            wifi: Some(1),
        });
    }

    #[test]
    fn touch_wire_bytes() {
        // x=0.25 y=0.5 Down — byte image fixed by the protocol.
        let msg = Message::Touch(TouchEvent {
            x: 0.25,
            y: 0.5,
            action: TouchAction::Down,
        });
        let payload = msg.encode_payload();
        assert_eq!(payload.len(), 12);
        assert_eq!(
            payload.as_ref(),
            &[
                0x00, 0x00, 0x80, 0x3E, // 0.25f32
                0x00, 0x00, 0x00, 0x3F, // 0.5f32
                0x00, 0x00, 0x00, 0x00, // Down
            ]
        );
        roundtrip(msg);
    }

    #[test]
    fn video_data_strips_vendor_header() {
        let mut payload = Vec::new();
        for v in [800u32, 480, 2, 1234, 0] {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        payload.extend_from_slice(&[0, 0, 0, 1, 0x65, 0xAA]);
        let msg =
            Message::decode_payload(MessageTag::VideoData as u32, Bytes::from(payload)).unwrap();
        match &msg {
            Message::VideoData(v) => {
                assert_eq!(v.width, 800);
                assert_eq!(v.height, 480);
                assert_eq!(v.timestamp, 1234);
                assert_eq!(v.payload.as_ref(), &[0, 0, 0, 1, 0x65, 0xAA]);
            }
            other => panic!("expected VideoData, got {other:?}"),
        }
        roundtrip(msg);
    }

    #[test]
    fn audio_control_block_is_sixteen_bytes() {
        let msg = Message::AudioData(AudioData::command_frame(5, 4, AudioCommand::SiriStart));
        let payload = msg.encode_payload();
        assert_eq!(payload.len(), 16);
        assert_eq!(u32::from_le_bytes(payload[4..8].try_into().unwrap()), 8);
        roundtrip(msg);
    }

    #[test]
    fn audio_volume_ramp_without_command() {
        roundtrip(Message::AudioData(AudioData {
            decode_type: 1,
            audio_type: 0,
            control: Some(AudioControl {
                command: None,
                volume: 0.6,
                volume_duration_ms: 250,
            }),
            data: Bytes::new(),
        }));
    }

    #[test]
    fn audio_pcm_passthrough() {
        let samples: Vec<u8> = vec![0x01, 0x00, 0xFF, 0x7F, 0x00, 0x80];
        roundtrip(Message::AudioData(AudioData::pcm_frame(
            1,
            1,
            Bytes::from(samples),
        )));
    }

    #[test]
    fn multi_touch_roundtrip() {
        roundtrip(Message::MultiTouch(vec![
            TouchPoint {
                id: 0,
                x: 0.1,
                y: 0.2,
                action: TouchAction::Down,
            },
            TouchPoint {
                id: 1,
                x: 0.9,
                y: 0.8,
                action: TouchAction::Move,
            },
        ]));
    }

    #[test]
    fn media_data_json_and_cover() {
        let bag = serde_json::json!({"MediaSongName": "song", "MediaArtistName": "artist"});
        roundtrip(Message::MediaData(MediaPayload::Data(JsonBlob::from_value(
            &bag,
        ))));
        roundtrip(Message::MediaData(MediaPayload::AlbumCover(Bytes::from(
            vec![0x89, 0x50, 0x4E, 0x47],
        ))));
    }

    #[test]
    fn media_data_unknown_type_rejected() {
        let mut payload = 7u32.to_le_bytes().to_vec();
        payload.extend_from_slice(b"{}");
        assert!(matches!(
            Message::decode_payload(MessageTag::MediaData as u32, Bytes::from(payload)),
            Err(AutoboxError::UnknownVariant { .. })
        ));
    }

    #[test]
    fn send_file_roundtrip() {
        roundtrip(Message::SendFile {
            path: "/tmp/screen_dpi".into(),
            content: Bytes::from(160u32.to_le_bytes().to_vec()),
        });
    }

    #[test]
    fn json_blob_tolerates_trailing_nul() {
        let blob = JsonBlob::from_raw(Bytes::from_static(b"{\"a\":1}\0\0"));
        assert_eq!(blob.value().unwrap()["a"], 1);
    }

    #[test]
    fn unknown_tag_is_preserved() {
        let payload = Bytes::from_static(&[1, 2, 3]);
        let msg = Message::decode_payload(0xE0, payload.clone()).unwrap();
        match &msg {
            Message::Unknown { tag, payload: p } => {
                assert_eq!(*tag, 0xE0);
                assert_eq!(p, &payload);
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
        roundtrip(msg);
    }

    #[test]
    fn truncated_payloads_rejected() {
        assert!(matches!(
            Message::decode_payload(MessageTag::Touch as u32, Bytes::from_static(&[0; 8])),
            Err(AutoboxError::TruncatedPayload { .. })
        ));
        assert!(matches!(
            Message::decode_payload(MessageTag::VideoData as u32, Bytes::from_static(&[0; 19])),
            Err(AutoboxError::TruncatedPayload { .. })
        ));
    }

    #[test]
    fn command_value_roundtrip() {
        for v in [1u32, 12, 106, 200, 501, 1012] {
            let cmd = CommandValue::try_from(v).unwrap();
            assert_eq!(cmd as u32, v);
        }
        assert!(CommandValue::try_from(0xDEAD).is_err());
    }

    #[test]
    fn nav_stream_classification() {
        for (audio_type, nav) in [(0u8, false), (2, true), (3, true), (4, false)] {
            let a = AudioData::pcm_frame(1, audio_type, Bytes::new());
            assert_eq!(a.is_nav(), nav, "audio_type {audio_type}");
        }
    }
}
