//! Session configuration.
//!
//! A [`DongleConfig`] is an immutable snapshot handed to the session at
//! start; changing it requires a stop + start cycle.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::audio::worklet::{DEFAULT_PREROLL_MS, DEFAULT_RAMP_MS};
use crate::protocol::PhoneType;

// ── WifiType ─────────────────────────────────────────────────────

/// Radio band the dongle advertises to the phone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WifiType {
    #[serde(rename = "2.4ghz")]
    Ghz24,
    #[default]
    #[serde(rename = "5ghz")]
    Ghz5,
}

// ── PhoneTypeConfig ──────────────────────────────────────────────

/// Per-phone tuning carried in [`DongleConfig::phone_config`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhoneTypeConfig {
    /// Cadence of the `frame` keep-alive command in milliseconds.
    /// `None` disables the frame heartbeat for this phone type.
    pub frame_interval: Option<u64>,
}

// ── DongleConfig ─────────────────────────────────────────────────

/// Everything the driver pushes to the adapter during configuration.
///
/// Defaults match the reference firmware: 800×480 @ 20 fps, 160 dpi,
/// 48 KiB packets, 5 GHz WiFi.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DongleConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub dpi: u32,
    /// Vendor pixel/stream format selector.
    pub format: u32,
    pub i_box_version: u32,
    pub phone_work_mode: u32,
    /// Largest bulk payload the dongle may emit.
    pub packet_max: u32,
    /// Media metadata delay in milliseconds.
    pub media_delay: u32,
    /// When `true`, the phone keeps mic/audio upstream itself and the
    /// head unit must not capture.
    pub audio_transfer_mode: bool,
    /// Master volume for ordinary streams, 0.0..=1.0.
    pub audio_volume: f32,
    /// Volume for navigation prompts (audio types 2 and 3).
    pub nav_volume: f32,
    /// Initial playback preroll in milliseconds. The worklet treats
    /// this as a floor and raises its working target under underrun
    /// pressure.
    pub audio_preroll_ms: u32,
    /// Crossfade length across playback gaps in milliseconds.
    pub audio_ramp_ms: u32,
    pub wifi_type: WifiType,
    pub wifi_channel: u32,
    pub night_mode: bool,
    /// `true` for right-hand-drive markets.
    pub drive_hand_right: bool,
    pub car_name: String,
    pub oem_name: String,
    pub phone_config: HashMap<PhoneType, PhoneTypeConfig>,
    /// OEM icon PNG written to the dongle at `/etc/oem_icon.png`.
    #[serde(skip)]
    pub oem_icon: Vec<u8>,
    /// Launcher icon PNGs keyed by square pixel size (120/180/250).
    #[serde(skip)]
    pub icons: Vec<(u32, Vec<u8>)>,
}

impl Default for DongleConfig {
    fn default() -> Self {
        let mut phone_config = HashMap::new();
        phone_config.insert(
            PhoneType::CarPlay,
            PhoneTypeConfig {
                frame_interval: Some(5000),
            },
        );
        phone_config.insert(PhoneType::AndroidAuto, PhoneTypeConfig::default());

        Self {
            width: 800,
            height: 480,
            fps: 20,
            dpi: 160,
            format: 5,
            i_box_version: 2,
            phone_work_mode: 2,
            packet_max: 49152,
            media_delay: 300,
            audio_transfer_mode: false,
            audio_volume: 1.0,
            nav_volume: 1.0,
            audio_preroll_ms: DEFAULT_PREROLL_MS,
            audio_ramp_ms: DEFAULT_RAMP_MS,
            wifi_type: WifiType::default(),
            wifi_channel: 36,
            night_mode: false,
            drive_hand_right: false,
            car_name: "autobox".into(),
            oem_name: "autobox".into(),
            phone_config,
            oem_icon: Vec::new(),
            icons: Vec::new(),
        }
    }
}

impl DongleConfig {
    /// Frame heartbeat cadence for the given phone type, if configured.
    pub fn frame_interval(&self, phone: PhoneType) -> Option<u64> {
        self.phone_config.get(&phone).and_then(|c| c.frame_interval)
    }

    /// Target present interval derived from the configured fps.
    pub fn present_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis((1000 / self.fps.max(1)) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_firmware() {
        let cfg = DongleConfig::default();
        assert_eq!(cfg.width, 800);
        assert_eq!(cfg.height, 480);
        assert_eq!(cfg.fps, 20);
        assert_eq!(cfg.packet_max, 49152);
        assert_eq!(cfg.audio_preroll_ms, 8);
        assert_eq!(cfg.audio_ramp_ms, 5);
        assert_eq!(cfg.wifi_type, WifiType::Ghz5);
        assert_eq!(cfg.frame_interval(PhoneType::CarPlay), Some(5000));
        assert_eq!(cfg.frame_interval(PhoneType::AndroidAuto), None);
        assert_eq!(cfg.frame_interval(PhoneType::HiCar), None);
    }

    #[test]
    fn present_interval_from_fps() {
        let cfg = DongleConfig {
            fps: 50,
            ..Default::default()
        };
        assert_eq!(cfg.present_interval().as_millis(), 20);
    }
}
