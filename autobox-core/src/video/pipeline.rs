//! H.264 decode pipeline: SPS+IDR gating, hardware-first configure,
//! and decoded-frame hand-off to the pending cell.
//!
//! A stream joined mid-GOP decodes nothing: delta frames are dropped
//! until an SPS has been seen *and* a keyframe arrives. Configuration
//! prefers hardware and falls back to software. If the very first IDR
//! after configuring fails to decode, the configuration is discarded
//! and the pipeline re-arms on the next SPS+IDR pair; later decode
//! errors just drop the frame.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::control::CoreEvent;
use crate::protocol::nalu::{find_nalu, is_keyframe, parse_sps, NaluType, SpsInfo};
use crate::protocol::VideoData;
use crate::video::decoder::{DecoderConfig, EncodedChunk, HwPreference, VideoDecoder};
use crate::video::pacing::FrameCell;

// ── VideoPipeline ────────────────────────────────────────────────

/// Decode-side state for one session.
pub struct VideoPipeline<D: VideoDecoder> {
    decoder: D,
    cell: Arc<FrameCell>,
    events: mpsc::UnboundedSender<CoreEvent>,

    configured: bool,
    /// First post-configure IDR must decode, or we reconfigure.
    awaiting_first_idr: bool,
    sps_raw: Option<Bytes>,
    sps_info: Option<SpsInfo>,
    last_resolution: Option<(u32, u32)>,
}

impl<D: VideoDecoder> VideoPipeline<D> {
    pub fn new(
        decoder: D,
        cell: Arc<FrameCell>,
        events: mpsc::UnboundedSender<CoreEvent>,
    ) -> Self {
        Self {
            decoder,
            cell,
            events,
            configured: false,
            awaiting_first_idr: false,
            sps_raw: None,
            sps_info: None,
            last_resolution: None,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// Tear down decode state (phone unplug); the next SPS+IDR pair
    /// reconfigures from scratch.
    pub fn reset(&mut self) {
        self.decoder.reset();
        self.configured = false;
        self.awaiting_first_idr = false;
        self.sps_raw = None;
        self.sps_info = None;
        self.last_resolution = None;
    }

    /// Feed one VideoData access unit.
    pub fn feed(&mut self, video: VideoData) {
        if self.last_resolution != Some((video.width, video.height)) {
            self.last_resolution = Some((video.width, video.height));
            let _ = self.events.send(CoreEvent::Resolution {
                width: video.width,
                height: video.height,
            });
        }

        let data = video.payload;

        if let Some(sps) = find_nalu(&data, NaluType::Sps) {
            match parse_sps(sps) {
                Ok(info) => {
                    let offset = sps.as_ptr() as usize - data.as_ptr() as usize;
                    self.sps_raw = Some(data.slice(offset..offset + sps.len()));
                    self.sps_info = Some(info);
                }
                Err(err) => debug!("ignoring unparseable sps: {err}"),
            }
        }

        let keyframe = is_keyframe(&data);

        if !self.configured {
            let (Some(info), true) = (self.sps_info, keyframe) else {
                debug!("dropping access unit before sps+idr gate");
                return;
            };
            if !self.try_configure(&info) {
                return;
            }
            self.configured = true;
            self.awaiting_first_idr = true;
        }

        let chunk = EncodedChunk {
            keyframe,
            timestamp: video.timestamp,
            data,
        };
        match self.decoder.decode(chunk) {
            Ok(frames) => {
                if keyframe {
                    self.awaiting_first_idr = false;
                }
                for frame in frames {
                    self.cell.put(frame);
                }
            }
            Err(err) => {
                warn!("decode error, dropping frame: {err}");
                if self.awaiting_first_idr && keyframe {
                    // The configuration cannot decode its own first
                    // keyframe: discard it and re-arm the gate.
                    self.decoder.reset();
                    self.configured = false;
                    self.awaiting_first_idr = false;
                    self.sps_raw = None;
                    self.sps_info = None;
                }
            }
        }
    }

    /// Hardware first, software fallback.
    fn try_configure(&mut self, info: &SpsInfo) -> bool {
        let sps = self.sps_raw.clone().unwrap_or_default();
        for hw in [HwPreference::PreferHardware, HwPreference::PreferSoftware] {
            let config = DecoderConfig {
                codec: info.codec_string(),
                coded_width: info.width,
                coded_height: info.height,
                hw,
                optimize_for_latency: true,
                sps: sps.clone(),
            };
            match self.decoder.configure(&config) {
                Ok(()) => {
                    info!(
                        codec = %config.codec,
                        width = config.coded_width,
                        height = config.coded_height,
                        "decoder configured ({hw:?})"
                    );
                    return true;
                }
                Err(err) => debug!("configure {hw:?} failed: {err}"),
            }
        }
        warn!("decoder rejected both hardware and software configurations");
        false
    }
}

// ── Tests ────────────────────────────────────────────────────────
