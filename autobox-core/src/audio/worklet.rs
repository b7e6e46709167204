//! The render-side PCM consumer ("worklet").
//!
//! Pulls one quantum (128 frames × channels) per render callback from
//! the ring and guarantees continuous, click-free output:
//!
//! - **Priming**: silence until the ring holds
//!   `targetPrerollQuanta` quanta of samples.
//! - **Alignment**: reads are clamped to whole frames; zero aligned
//!   samples is a hard underrun.
//! - **Ramp**: a linear crossfade from the last held frame into the
//!   stream whenever priming ends.
//! - **Padding**: a short read is padded by repeating the last frame.
//! - **Adaptation**: hard underruns and soft-underrun streaks raise
//!   the preroll target (bounded); long stable runs lower it back
//!   toward the base.
//!
//! All state lives on the audio thread; the only cross-thread traffic
//! is the ring's two atomic indices and the control receiver.

use crate::audio::decode_types::AudioFormat;
use crate::audio::ring::PcmReader;

/// Frames per render quantum.
pub const QUANTUM_FRAMES: usize = 128;

/// Default initial preroll.
pub const DEFAULT_PREROLL_MS: u32 = 8;

/// Default crossfade length.
pub const DEFAULT_RAMP_MS: u32 = 5;

/// Adaptation ceiling.
pub const MAX_PREROLL_MS: u32 = 40;

/// Soft underruns in a row before the target is raised.
const SOFT_UNDERRUN_LIMIT: u32 = 4;

/// Full quanta in a row before the target is lowered.
const STABLE_QUANTA_LIMIT: u32 = 128;

// ── Control & reporting ──────────────────────────────────────────

/// Parameter updates delivered from the pipeline side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WorkletControl {
    /// Linear volume ramp to `target` over `duration_ms`.
    SetVolume { target: f32, duration_ms: u32 },
    /// Raise the working preroll target (never below base).
    SetPrerollMs(u32),
    /// Change the crossfade length.
    SetRampMs(u32),
}

/// What one render call observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderReport {
    /// A hard underrun occurred (emitted once per episode).
    pub underrun: bool,
    /// First full quantum after an underrun episode.
    pub recovered: bool,
}

// ── PcmWorklet ───────────────────────────────────────────────────

/// Per-stream render consumer.
pub struct PcmWorklet {
    reader: PcmReader,
    channels: usize,
    sample_rate: u32,

    base_preroll_quanta: u32,
    target_preroll_quanta: u32,
    max_preroll_quanta: u32,

    priming: bool,
    awaiting_recovery: bool,

    ramp_total_frames: u32,
    ramp_remaining: u32,
    /// Held frame the active crossfade blends away from.
    ramp_from: Vec<i16>,

    /// Last emitted frame (pre-volume domain) for hold and padding.
    last_frame: Vec<i16>,

    soft_underrun_streak: u32,
    stable_full_quanta_streak: u32,

    volume: f32,
    volume_target: f32,
    volume_step: f32,
}

fn quanta_for_ms(ms: u32, sample_rate: u32) -> u32 {
    let frames = (ms as u64 * sample_rate as u64).div_ceil(1000);
    (frames.div_ceil(QUANTUM_FRAMES as u64)).max(1) as u32
}

impl PcmWorklet {
    pub fn new(reader: PcmReader, format: AudioFormat) -> Self {
        let base = quanta_for_ms(DEFAULT_PREROLL_MS, format.frequency);
        let max = quanta_for_ms(MAX_PREROLL_MS, format.frequency);
        let channels = format.channels as usize;
        Self {
            reader,
            channels,
            sample_rate: format.frequency,
            base_preroll_quanta: base,
            target_preroll_quanta: base,
            max_preroll_quanta: max,
            priming: true,
            awaiting_recovery: false,
            ramp_total_frames: DEFAULT_RAMP_MS * format.frequency / 1000,
            ramp_remaining: 0,
            ramp_from: vec![0; channels],
            last_frame: vec![0; channels],
            soft_underrun_streak: 0,
            stable_full_quanta_streak: 0,
            volume: 1.0,
            volume_target: 1.0,
            volume_step: 0.0,
        }
    }

    pub fn base_preroll_quanta(&self) -> u32 {
        self.base_preroll_quanta
    }

    pub fn target_preroll_quanta(&self) -> u32 {
        self.target_preroll_quanta
    }

    pub fn is_priming(&self) -> bool {
        self.priming
    }

    /// Apply a control message from the pipeline.
    pub fn apply_control(&mut self, control: WorkletControl) {
        match control {
            WorkletControl::SetVolume {
                target,
                duration_ms,
            } => {
                self.volume_target = target.clamp(0.0, 1.0);
                if duration_ms == 0 {
                    self.volume = self.volume_target;
                    self.volume_step = 0.0;
                } else {
                    let frames = (duration_ms as u64 * self.sample_rate as u64 / 1000).max(1);
                    self.volume_step = (self.volume_target - self.volume) / frames as f32;
                }
            }
            WorkletControl::SetPrerollMs(ms) => {
                let requested = quanta_for_ms(ms, self.sample_rate).min(self.max_preroll_quanta);
                // Only ever raises; base remains the floor.
                self.target_preroll_quanta = self
                    .target_preroll_quanta
                    .max(requested)
                    .max(self.base_preroll_quanta);
            }
            WorkletControl::SetRampMs(ms) => {
                self.ramp_total_frames = ms * self.sample_rate / 1000;
            }
        }
    }

    fn bump_target(&mut self) {
        if self.target_preroll_quanta < self.max_preroll_quanta {
            self.target_preroll_quanta += 1;
        }
    }

    fn hold_fill(&self, out: &mut [i16]) {
        for (i, sample) in out.iter_mut().enumerate() {
            *sample = self.last_frame[i % self.channels];
        }
    }

    fn begin_ramp(&mut self) {
        self.ramp_remaining = self.ramp_total_frames;
        self.ramp_from.copy_from_slice(&self.last_frame);
    }

    /// Render one quantum into `out` (`QUANTUM_FRAMES × channels`
    /// samples, or any whole number of frames).
    pub fn render(&mut self, out: &mut [i16]) -> RenderReport {
        debug_assert_eq!(out.len() % self.channels, 0);
        let mut report = RenderReport::default();
        let want = out.len();

        if self.priming {
            let threshold =
                self.target_preroll_quanta as usize * QUANTUM_FRAMES * self.channels;
            if self.reader.available() < threshold {
                out.fill(0);
                return report;
            }
            self.priming = false;
            self.begin_ramp();
        }

        let available = self.reader.available();
        let aligned = available - available % self.channels;

        if aligned == 0 {
            // Hard underrun: hold the last frame, raise the target,
            // and go back to priming. The event fires once per episode.
            self.hold_fill(out);
            self.apply_volume(out);
            self.bump_target();
            self.priming = true;
            self.soft_underrun_streak = 0;
            self.stable_full_quanta_streak = 0;
            if !self.awaiting_recovery {
                self.awaiting_recovery = true;
                report.underrun = true;
            }
            return report;
        }

        let take = aligned.min(want);
        let got = self.reader.read(&mut out[..take]);
        debug_assert_eq!(got, take);

        if take < want {
            // Pad with the last delivered frame (clickless hold).
            let (head, tail) = out.split_at_mut(take);
            let hold_frame = &head[take - self.channels..];
            for (i, sample) in tail.iter_mut().enumerate() {
                *sample = hold_frame[i % self.channels];
            }

            self.stable_full_quanta_streak = 0;
            self.soft_underrun_streak += 1;
            if self.soft_underrun_streak >= SOFT_UNDERRUN_LIMIT {
                self.bump_target();
                self.soft_underrun_streak = 0;
            }
        } else {
            self.soft_underrun_streak = 0;
            self.stable_full_quanta_streak += 1;
            if self.awaiting_recovery {
                self.awaiting_recovery = false;
                report.recovered = true;
            }
            if self.stable_full_quanta_streak >= STABLE_QUANTA_LIMIT
                && self.target_preroll_quanta > self.base_preroll_quanta
            {
                self.target_preroll_quanta -= 1;
                self.stable_full_quanta_streak = 0;
            }
        }

        self.apply_ramp(out);

        let frame_start = out.len() - self.channels;
        self.last_frame.copy_from_slice(&out[frame_start..]);

        self.apply_volume(out);
        report
    }

    /// Linear crossfade from `ramp_from` into the fresh samples.
    fn apply_ramp(&mut self, out: &mut [i16]) {
        if self.ramp_remaining == 0 || self.ramp_total_frames == 0 {
            return;
        }
        let total = self.ramp_total_frames as f32;
        let frames = out.len() / self.channels;
        for frame in 0..frames {
            if self.ramp_remaining == 0 {
                break;
            }
            let progressed = self.ramp_total_frames - self.ramp_remaining;
            let alpha = (progressed as f32 + 1.0) / total;
            for ch in 0..self.channels {
                let idx = frame * self.channels + ch;
                let held = self.ramp_from[ch] as f32;
                let fresh = out[idx] as f32;
                out[idx] = (held * (1.0 - alpha) + fresh * alpha) as i16;
            }
            self.ramp_remaining -= 1;
        }
    }

    fn apply_volume(&mut self, out: &mut [i16]) {
        if self.volume == self.volume_target && (self.volume - 1.0).abs() < f32::EPSILON {
            return;
        }
        let frames = out.len() / self.channels;
        for frame in 0..frames {
            if self.volume_step != 0.0 {
                let next = self.volume + self.volume_step;
                let overshot = (self.volume_step > 0.0 && next >= self.volume_target)
                    || (self.volume_step < 0.0 && next <= self.volume_target);
                if overshot {
                    self.volume = self.volume_target;
                    self.volume_step = 0.0;
                } else {
                    self.volume = next;
                }
            }
            for ch in 0..self.channels {
                let idx = frame * self.channels + ch;
                out[idx] = ((out[idx] as f32) * self.volume) as i16;
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::decode_types::decode_type_format;
    use crate::audio::ring::{pcm_ring, PcmWriter};

    /// 48 kHz stereo (decode type 4): base preroll works out to 3
    /// quanta, the adaptation scenario the pipeline is tuned around.
    fn stereo_worklet() -> (PcmWriter, PcmWorklet) {
        let fmt = decode_type_format(4).unwrap();
        let (w, r) = pcm_ring(64 * 1024);
        (w, PcmWorklet::new(r, fmt))
    }

    fn quantum(channels: usize) -> Vec<i16> {
        vec![0i16; QUANTUM_FRAMES * channels]
    }

    fn fill_quanta(w: &mut PcmWriter, channels: usize, quanta: usize, value: i16) {
        let samples = vec![value; quanta * QUANTUM_FRAMES * channels];
        assert_eq!(w.write(&samples), samples.len());
    }

    #[test]
    fn base_preroll_derivation() {
        let (_w, worklet) = stereo_worklet();
        // ceil(8 ms × 48000 / (1000 × 128)) = 3
        assert_eq!(worklet.base_preroll_quanta(), 3);
        assert_eq!(worklet.target_preroll_quanta(), 3);

        let fmt = decode_type_format(5).unwrap(); // 16 kHz mono
        let (_w2, r2) = pcm_ring(1024);
        let mono = PcmWorklet::new(r2, fmt);
        // ceil(8 ms × 16000 / (1000 × 128)) = 1
        assert_eq!(mono.base_preroll_quanta(), 1);
    }

    #[test]
    fn silence_while_priming() {
        let (mut w, mut worklet) = stereo_worklet();
        let mut out = quantum(2);

        // Two quanta buffered < target of three: still priming.
        fill_quanta(&mut w, 2, 2, 5000);
        let report = worklet.render(&mut out);
        assert_eq!(report, RenderReport::default());
        assert!(worklet.is_priming());
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn emits_after_preroll_with_ramp_in() {
        let (mut w, mut worklet) = stereo_worklet();
        let mut out = quantum(2);

        fill_quanta(&mut w, 2, 3, 8000);
        let report = worklet.render(&mut out);
        assert_eq!(report, RenderReport::default());
        assert!(!worklet.is_priming());

        // Crossfade from held silence: starts low, climbs toward the
        // stream level and keeps climbing across the quantum.
        assert!(out[0].abs() < 1000, "ramp should start near the held 0");
        assert!(out[out.len() - 2] > out[0]);
    }

    #[test]
    fn hard_underrun_bumps_target_and_reprimes() {
        let (mut w, mut worklet) = stereo_worklet();
        let mut out = quantum(2);

        fill_quanta(&mut w, 2, 3, 1000);
        worklet.render(&mut out); // consume one quantum
        worklet.render(&mut out);
        worklet.render(&mut out); // ring now empty

        let report = worklet.render(&mut out);
        assert!(report.underrun);
        assert!(!report.recovered);
        assert_eq!(worklet.target_preroll_quanta(), 4);
        assert!(worklet.is_priming());

        // The underrun event fires once per episode.
        let report = worklet.render(&mut out);
        assert!(!report.underrun);
    }

    #[test]
    fn recovered_on_first_full_quantum_after_underrun() {
        let (mut w, mut worklet) = stereo_worklet();
        let mut out = quantum(2);

        fill_quanta(&mut w, 2, 3, 1000);
        for _ in 0..3 {
            worklet.render(&mut out);
        }
        assert!(worklet.render(&mut out).underrun);

        // Refill past the (raised) target and render again.
        fill_quanta(&mut w, 2, 4, 2000);
        let report = worklet.render(&mut out);
        assert!(report.recovered);
        assert!(!report.underrun);
    }

    #[test]
    fn adaptation_decays_back_to_base() {
        let (mut w, mut worklet) = stereo_worklet();
        let mut out = quantum(2);

        // Scenario: base 3, hard underrun raises to 4, then 128
        // stable quanta decay the target back to 3.
        fill_quanta(&mut w, 2, 3, 1000);
        for _ in 0..3 {
            worklet.render(&mut out);
        }
        assert!(worklet.render(&mut out).underrun);
        assert_eq!(worklet.target_preroll_quanta(), 4);

        fill_quanta(&mut w, 2, 4, 1000);
        assert!(worklet.render(&mut out).recovered);
        for _ in 0..STABLE_QUANTA_LIMIT - 1 {
            fill_quanta(&mut w, 2, 1, 1000);
            let report = worklet.render(&mut out);
            assert_eq!(report, RenderReport::default());
        }
        assert_eq!(worklet.target_preroll_quanta(), 3);
    }

    #[test]
    fn short_read_pads_with_last_frame() {
        let (mut w, mut worklet) = stereo_worklet();
        let mut out = quantum(2);

        fill_quanta(&mut w, 2, 3, 1000);
        worklet.render(&mut out);
        worklet.render(&mut out);

        // Leave half a quantum in the ring.
        let half = vec![700i16; QUANTUM_FRAMES]; // 64 stereo frames
        w.write(&half);
        worklet.render(&mut out); // drains the last full quantum
        let report = worklet.render(&mut out);
        assert_eq!(report, RenderReport::default()); // soft, not hard

        // Tail is a repeat of the final delivered frame.
        let tail = &out[QUANTUM_FRAMES..];
        assert!(tail.iter().all(|&s| s == 700));
    }

    #[test]
    fn soft_underrun_streak_bumps_target() {
        let (mut w, mut worklet) = stereo_worklet();
        let mut out = quantum(2);

        fill_quanta(&mut w, 2, 3, 1000);
        worklet.render(&mut out);
        worklet.render(&mut out);
        worklet.render(&mut out);

        let target_before = worklet.target_preroll_quanta();
        for _ in 0..SOFT_UNDERRUN_LIMIT {
            // A sliver per quantum: aligned but never full.
            w.write(&[300, 300]);
            let report = worklet.render(&mut out);
            assert!(!report.underrun);
        }
        assert_eq!(worklet.target_preroll_quanta(), target_before + 1);
    }

    #[test]
    fn single_stray_sample_is_a_hard_underrun_for_stereo() {
        let (mut w, mut worklet) = stereo_worklet();
        let mut out = quantum(2);

        fill_quanta(&mut w, 2, 3, 1000);
        worklet.render(&mut out);
        worklet.render(&mut out);
        worklet.render(&mut out);

        w.write(&[123]); // unaligned leftover
        let report = worklet.render(&mut out);
        assert!(report.underrun);
    }

    #[test]
    fn set_volume_scales_output() {
        let (mut w, mut worklet) = stereo_worklet();
        let mut out = quantum(2);

        worklet.apply_control(WorkletControl::SetVolume {
            target: 0.5,
            duration_ms: 0,
        });
        worklet.apply_control(WorkletControl::SetRampMs(0)); // isolate volume
        fill_quanta(&mut w, 2, 3, 8000);
        worklet.render(&mut out);
        assert!(out.iter().all(|&s| s == 4000), "expected uniform 4000");
    }

    #[test]
    fn set_preroll_only_raises() {
        let (_w, mut worklet) = stereo_worklet();
        assert_eq!(worklet.target_preroll_quanta(), 3);

        worklet.apply_control(WorkletControl::SetPrerollMs(24));
        let raised = worklet.target_preroll_quanta();
        assert!(raised > 3);

        // Asking for less than base cannot lower the target.
        worklet.apply_control(WorkletControl::SetPrerollMs(1));
        assert_eq!(worklet.target_preroll_quanta(), raised);
    }
}
