//! Renderer capability interface and data-driven selection.
//!
//! The surface itself comes from the host; the core only chooses
//! *which* renderer variant to paint with. On first run the available
//! contexts are probed in a platform-dependent priority order, each
//! tested for decoder support with hardware preferred and then with
//! software; the first variant reporting either wins and the choice
//! is cached for the session.

use crate::error::AutoboxError;
use crate::video::decoder::{HwPreference, VideoFrame};

// ── Renderer ─────────────────────────────────────────────────────

/// Renderer variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererKind {
    /// Modern GPU context (wgpu-class).
    Gpu,
    /// GL2 context.
    Gl2,
}

/// A paint target for decoded frames.
pub trait Renderer: Send {
    fn kind(&self) -> RendererKind;

    fn draw(&mut self, frame: &VideoFrame) -> Result<(), AutoboxError>;
}

// ── Probing ──────────────────────────────────────────────────────

/// One capability question put to a candidate context.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderSupportQuery {
    pub codec: String,
    pub hw: HwPreference,
}

/// Host-supplied capability oracle for the available contexts.
pub trait RendererProbe {
    fn decoder_supported(&self, kind: RendererKind, query: &DecoderSupportQuery) -> bool;
}

/// Candidate order for this platform.
pub fn probe_order() -> &'static [RendererKind] {
    if cfg!(target_os = "macos") {
        &[RendererKind::Gpu, RendererKind::Gl2]
    } else if cfg!(all(
        target_os = "linux",
        any(target_arch = "arm", target_arch = "aarch64")
    )) {
        &[RendererKind::Gl2]
    } else {
        &[RendererKind::Gl2, RendererKind::Gpu]
    }
}

// ── RendererSelector ─────────────────────────────────────────────

/// Probes once, then answers from cache for the rest of the session.
#[derive(Debug, Default)]
pub struct RendererSelector {
    cached: Option<Option<RendererKind>>,
}

impl RendererSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the renderer for `codec`, consulting the probe only on
    /// the first call.
    pub fn select(&mut self, probe: &dyn RendererProbe, codec: &str) -> Option<RendererKind> {
        if let Some(cached) = self.cached {
            return cached;
        }
        let selected = Self::probe_all(probe, codec);
        self.cached = Some(selected);
        selected
    }

    fn probe_all(probe: &dyn RendererProbe, codec: &str) -> Option<RendererKind> {
        for &kind in probe_order() {
            for hw in [HwPreference::PreferHardware, HwPreference::PreferSoftware] {
                let query = DecoderSupportQuery {
                    codec: codec.to_string(),
                    hw,
                };
                if probe.decoder_supported(kind, &query) {
                    return Some(kind);
                }
            }
        }
        None
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Probe that answers from a table and logs every question.
    struct TableProbe {
        supported: Vec<(RendererKind, HwPreference)>,
        asked: RefCell<Vec<(RendererKind, HwPreference)>>,
    }

    impl RendererProbe for TableProbe {
        fn decoder_supported(&self, kind: RendererKind, query: &DecoderSupportQuery) -> bool {
            self.asked.borrow_mut().push((kind, query.hw));
            self.supported.contains(&(kind, query.hw))
        }
    }

    #[test]
    fn hardware_is_asked_before_software() {
        let probe = TableProbe {
            supported: vec![(probe_order()[0], HwPreference::PreferSoftware)],
            asked: RefCell::new(Vec::new()),
        };
        let mut selector = RendererSelector::new();
        let selected = selector.select(&probe, "avc1.64002A");

        assert_eq!(selected, Some(probe_order()[0]));
        let asked = probe.asked.borrow();
        assert_eq!(asked[0], (probe_order()[0], HwPreference::PreferHardware));
        assert_eq!(asked[1], (probe_order()[0], HwPreference::PreferSoftware));
    }

    #[test]
    fn falls_through_to_later_candidates() {
        let last = *probe_order().last().unwrap();
        let probe = TableProbe {
            supported: vec![(last, HwPreference::PreferHardware)],
            asked: RefCell::new(Vec::new()),
        };
        let mut selector = RendererSelector::new();
        assert_eq!(selector.select(&probe, "avc1.64002A"), Some(last));
    }

    #[test]
    fn no_support_selects_nothing() {
        let probe = TableProbe {
            supported: vec![],
            asked: RefCell::new(Vec::new()),
        };
        let mut selector = RendererSelector::new();
        assert_eq!(selector.select(&probe, "avc1.64002A"), None);
        // Every candidate was asked both ways.
        assert_eq!(probe.asked.borrow().len(), probe_order().len() * 2);
    }

    #[test]
    fn selection_is_cached_for_the_session() {
        let probe = TableProbe {
            supported: vec![(probe_order()[0], HwPreference::PreferHardware)],
            asked: RefCell::new(Vec::new()),
        };
        let mut selector = RendererSelector::new();
        selector.select(&probe, "avc1.64002A");
        let first_round = probe.asked.borrow().len();

        selector.select(&probe, "avc1.64002A");
        assert_eq!(probe.asked.borrow().len(), first_round, "cache hit, no reprobe");
    }

    #[test]
    fn platform_order_is_nonempty_and_unique() {
        let order = probe_order();
        assert!(!order.is_empty());
        if order.len() == 2 {
            assert_ne!(order[0], order[1]);
        }
    }
}
