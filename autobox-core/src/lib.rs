//! # autobox-core — Carlinkit dongle bridge
//!
//! Protocol stack and real-time media pipeline for the Carlinkit class
//! of CarPlay / Android Auto USB adapters (vendor 0x1314).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────── USB ───────────┐   ┌────────── media ─────────────┐
//! │ bulk-in ─► codec ─► demux ├──►│ video: gate ─► decode ─► cell│
//! │ bulk-out ◄─ writer queue  │   │ audio: rings ─► worklets     │
//! └───────────┬───────────────┘   └──────────────────────────────┘
//!             │ session FSM: open → init → config → streaming
//!             ▼
//!   host: CoreEvent stream up, HostCommand sink down
//! ```
//!
//! | Module     | Purpose                                        |
//! |----------- |------------------------------------------------|
//! | `protocol` | Framed wire codec, message layouts, NALU/SPS   |
//! | `usb`      | Device open/claim, bulk IO, hot-plug watcher   |
//! | `session`  | Lifecycle FSM, handshake, heartbeats, writer   |
//! | `demux`    | Kind-routing to the media pipelines            |
//! | `video`    | Decode gating, frame pacing, renderer choice   |
//! | `audio`    | Stream players, PCM rings, render worklet      |
//! | `mic`      | Capture backend and upstream audio framing     |
//! | `input`    | Touch / multi-touch / key encoding             |
//! | `control`  | Host-facing events and commands                |
//! | `config`   | The immutable session configuration snapshot   |

pub mod audio;
pub mod config;
pub mod control;
pub mod demux;
pub mod error;
pub mod input;
pub mod mic;
pub mod protocol;
pub mod session;
pub mod usb;
pub mod video;

// ── Re-exports ───────────────────────────────────────────────────

pub use config::{DongleConfig, PhoneTypeConfig, WifiType};
pub use control::{CoreEvent, HostCommand, MediaMeta, MediaMetaState};
pub use error::AutoboxError;
pub use protocol::{AudioCommand, CommandValue, Message, PhoneType, TouchAction};
pub use session::{Session, SessionBuilder, SessionOutputs, SessionPhase, SessionTiming};
pub use usb::{DongleEndpoint, HotplugEvent, HotplugWatcher, UsbDongle};
