//! The audio pipeline: per-stream players, PCM rings, the render
//! worklet, and in-band command routing.
//!
//! Streams are keyed by `(decodeType, audioType)` and created lazily
//! on first data. Creating a player allocates a ring, hands its read
//! half (plus a control channel) to the consumer side as a
//! [`PlayerHandoff`], and reports the stream upward as `AudioInfo`.
//! Audio types 2 and 3 are navigation prompts and ride the nav volume
//! channel.
//!
//! | Module         | Purpose                                   |
//! |--------------- |-------------------------------------------|
//! | `decode_types` | `decodeType` → PCM metadata registry      |
//! | `ring`         | SPSC atomic-index sample ring             |
//! | `worklet`      | Render consumer: preroll, ramp, adaptation|

pub mod decode_types;
pub mod ring;
pub mod worklet;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::config::DongleConfig;
use crate::control::CoreEvent;
use crate::mic::Microphone;
use crate::protocol::{AudioCommand, AudioData};

pub use decode_types::{decode_type_format, AudioFormat, MIC_DECODE_TYPE};
pub use ring::{pcm_ring, PcmReader, PcmWriter};
pub use worklet::{PcmWorklet, RenderReport, WorkletControl, QUANTUM_FRAMES};

/// Delay before nav volume is applied on `AudioNaviStart`, giving the
/// stream a moment to begin.
const NAV_VOLUME_DELAY: Duration = Duration::from_millis(10);

/// Ring sized for half a second of audio.
fn ring_capacity(format: &AudioFormat) -> usize {
    (format.frequency as usize * format.channels as usize) / 2 + 1
}

// ── Stream key ───────────────────────────────────────────────────

/// Identity of one PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PcmStreamKey {
    pub decode_type: u8,
    pub audio_type: u8,
}

impl PcmStreamKey {
    /// Navigation streams get their own volume channel.
    pub fn is_nav(&self) -> bool {
        matches!(self.audio_type, 2 | 3)
    }
}

// ── PlayerHandoff ────────────────────────────────────────────────

/// Everything the consumer side needs to run one stream's worklet.
pub struct PlayerHandoff {
    pub key: PcmStreamKey,
    pub format: AudioFormat,
    pub reader: PcmReader,
    pub control: mpsc::UnboundedReceiver<WorkletControl>,
}

struct Player {
    writer: PcmWriter,
    control: mpsc::UnboundedSender<WorkletControl>,
}

// ── AudioPipeline ────────────────────────────────────────────────

/// Routes AudioData to players, owns the microphone, applies volume
/// policy.
pub struct AudioPipeline {
    players: HashMap<PcmStreamKey, Player>,
    handoffs: mpsc::UnboundedSender<PlayerHandoff>,
    events: mpsc::UnboundedSender<CoreEvent>,
    mic: Microphone,
    audio_transfer_mode: bool,
    audio_volume: f32,
    nav_volume: f32,
    preroll_ms: u32,
    ramp_ms: u32,
    /// Decode types already reported as unknown (reported once each).
    unknown_reported: HashSet<u8>,
}

impl AudioPipeline {
    pub fn new(
        config: &DongleConfig,
        mic: Microphone,
        events: mpsc::UnboundedSender<CoreEvent>,
        handoffs: mpsc::UnboundedSender<PlayerHandoff>,
    ) -> Self {
        Self {
            players: HashMap::new(),
            handoffs,
            events,
            mic,
            audio_transfer_mode: config.audio_transfer_mode,
            audio_volume: config.audio_volume,
            nav_volume: config.nav_volume,
            preroll_ms: config.audio_preroll_ms,
            ramp_ms: config.audio_ramp_ms,
            unknown_reported: HashSet::new(),
        }
    }

    pub fn microphone(&self) -> &Microphone {
        &self.mic
    }

    pub fn microphone_mut(&mut self) -> &mut Microphone {
        &mut self.mic
    }

    /// Drop all players (unplug or config change) and stop capture.
    pub fn reset(&mut self) {
        self.players.clear();
        self.mic.stop();
    }

    /// Route one AudioData frame.
    pub fn handle(&mut self, frame: AudioData) {
        let key = PcmStreamKey {
            decode_type: frame.decode_type,
            audio_type: frame.audio_type,
        };

        if let Some(control) = frame.control {
            if let Some(command) = control.command {
                self.route_command(key, command);
            }
            if control.volume > 0.0 || control.volume_duration_ms > 0 {
                if self.ensure_player(key) {
                    let player = &self.players[&key];
                    let _ = player.control.send(WorkletControl::SetVolume {
                        target: control.volume,
                        duration_ms: control.volume_duration_ms,
                    });
                }
            }
            return;
        }

        if !self.ensure_player(key) {
            return;
        }
        let samples: Vec<i16> = frame
            .data
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let player = self.players.get_mut(&key).expect("player just ensured");
        let written = player.writer.write(&samples);
        if written < samples.len() {
            trace!(
                decode_type = key.decode_type,
                audio_type = key.audio_type,
                dropped = samples.len() - written,
                "ring full, dropped samples at writer"
            );
        }
    }

    /// In-band audio commands: mic gating and nav volume.
    fn route_command(&mut self, key: PcmStreamKey, command: AudioCommand) {
        match command {
            AudioCommand::SiriStart | AudioCommand::PhonecallStart => {
                if self.audio_transfer_mode {
                    debug!("audio transfer mode active, leaving microphone to the phone");
                } else {
                    self.mic.start();
                }
            }
            AudioCommand::SiriStop | AudioCommand::PhonecallStop => {
                self.mic.stop();
            }
            AudioCommand::NaviStart => {
                if self.ensure_player(key) {
                    let control = self.players[&key].control.clone();
                    let nav_volume = self.nav_volume;
                    tokio::spawn(async move {
                        tokio::time::sleep(NAV_VOLUME_DELAY).await;
                        let _ = control.send(WorkletControl::SetVolume {
                            target: nav_volume,
                            duration_ms: 0,
                        });
                    });
                }
            }
            other => {
                trace!("audio command {other:?} (no local action)");
            }
        }
    }

    /// Create the player for `key` if it does not exist yet.
    ///
    /// Returns `false` when the decode type is outside the registry;
    /// the stream is dropped and the condition reported once.
    fn ensure_player(&mut self, key: PcmStreamKey) -> bool {
        if self.players.contains_key(&key) {
            return true;
        }
        let format = match decode_type_format(key.decode_type) {
            Ok(format) => format,
            Err(err) => {
                if self.unknown_reported.insert(key.decode_type) {
                    warn!("dropping audio stream: {err}");
                }
                return false;
            }
        };

        let (writer, reader) = pcm_ring(ring_capacity(&format));
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let initial_volume = if key.is_nav() {
            self.nav_volume
        } else {
            self.audio_volume
        };
        let _ = control_tx.send(WorkletControl::SetVolume {
            target: initial_volume,
            duration_ms: 0,
        });
        // Configured playback tuning; the worklet clamps preroll to
        // its base and adapts upward from there.
        let _ = control_tx.send(WorkletControl::SetPrerollMs(self.preroll_ms));
        let _ = control_tx.send(WorkletControl::SetRampMs(self.ramp_ms));

        let _ = self.handoffs.send(PlayerHandoff {
            key,
            format,
            reader,
            control: control_rx,
        });
        let _ = self.events.send(CoreEvent::AudioInfo {
            codec: format.mime.to_string(),
            sample_rate: format.frequency,
            channels: format.channels,
            bit_depth: format.bit_depth,
        });

        self.players.insert(
            key,
            Player {
                writer,
                control: control_tx,
            },
        );
        true
    }
}

// ── Tests ────────────────────────────────────────────────────────
