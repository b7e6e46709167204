//! The single-slot pending frame cell and the paced present loop.
//!
//! The decode task posts frames into the cell (latest wins, the
//! overwritten frame is closed by drop); the render task samples it
//! on a `1000 / fps` ms cadence and draws when a frame is present and
//! the inter-present interval has elapsed. Decoder and renderer share
//! nothing else.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::AutoboxError;
use crate::video::decoder::VideoFrame;
use crate::video::renderer::Renderer;

// ── FrameCell ────────────────────────────────────────────────────

/// Single-slot latest-wins frame hand-off.
#[derive(Debug, Default)]
pub struct FrameCell {
    slot: Mutex<Option<VideoFrame>>,
    notify: Notify,
}

impl FrameCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a frame, closing any frame already pending.
    pub fn put(&self, frame: VideoFrame) {
        let mut slot = self.slot.lock().expect("frame cell poisoned");
        *slot = Some(frame); // previous frame drops here
        drop(slot);
        self.notify.notify_one();
    }

    /// Take the pending frame, clearing the cell.
    pub fn take(&self) -> Option<VideoFrame> {
        self.slot.lock().expect("frame cell poisoned").take()
    }

    /// Wait until a frame is (probably) present.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

// ── Present loop ─────────────────────────────────────────────────

/// Draw pending frames at the target cadence until cancelled.
///
/// Renderer errors are logged and the frame dropped; the loop keeps
/// running (the next keyframe recovers the picture).
pub async fn present_loop<R: Renderer + ?Sized>(
    cell: &FrameCell,
    renderer: &mut R,
    fps: u32,
    cancel: CancellationToken,
) -> Result<(), AutoboxError> {
    let interval = Duration::from_millis((1000 / fps.max(1)) as u64);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_present: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            tick = ticker.tick() => {
                let due = last_present
                    .map(|t| tick.duration_since(t) >= interval)
                    .unwrap_or(true);
                if !due {
                    continue;
                }
                if let Some(frame) = cell.take() {
                    if let Err(err) = renderer.draw(&frame) {
                        warn!("renderer draw failed: {err}");
                        continue;
                    }
                    last_present = Some(tick);
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::renderer::RendererKind;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn frame(ts: u32) -> VideoFrame {
        VideoFrame {
            width: 800,
            height: 480,
            timestamp: ts,
            data: Bytes::new(),
        }
    }

    #[test]
    fn cell_is_latest_wins() {
        let cell = FrameCell::new();
        cell.put(frame(1));
        cell.put(frame(2));
        cell.put(frame(3));
        assert_eq!(cell.take().unwrap().timestamp, 3);
        assert!(cell.take().is_none());
    }

    struct CountingRenderer {
        drawn: Arc<AtomicUsize>,
        last_ts: Arc<AtomicUsize>,
    }

    impl Renderer for CountingRenderer {
        fn kind(&self) -> RendererKind {
            RendererKind::Gl2
        }

        fn draw(&mut self, frame: &VideoFrame) -> Result<(), AutoboxError> {
            self.drawn.fetch_add(1, Ordering::SeqCst);
            self.last_ts.store(frame.timestamp as usize, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn present_loop_draws_latest_and_clears() {
        let cell = Arc::new(FrameCell::new());
        let drawn = Arc::new(AtomicUsize::new(0));
        let last_ts = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let mut renderer = CountingRenderer {
            drawn: Arc::clone(&drawn),
            last_ts: Arc::clone(&last_ts),
        };

        cell.put(frame(7));
        cell.put(frame(8)); // overwrites 7

        let loop_cell = Arc::clone(&cell);
        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            present_loop(&loop_cell, &mut renderer, 20, loop_cancel)
                .await
                .unwrap();
        });

        tokio::time::sleep(Duration::from_millis(120)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(drawn.load(Ordering::SeqCst), 1, "one pending frame, one draw");
        assert_eq!(last_ts.load(Ordering::SeqCst), 8, "latest frame wins");
    }

    #[tokio::test(start_paused = true)]
    async fn present_loop_stops_on_cancel() {
        let cell = FrameCell::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        struct NeverRenderer;
        impl Renderer for NeverRenderer {
            fn kind(&self) -> RendererKind {
                RendererKind::Gl2
            }
            fn draw(&mut self, _: &VideoFrame) -> Result<(), AutoboxError> {
                panic!("must not draw");
            }
        }

        let mut renderer = NeverRenderer;
        present_loop(&cell, &mut renderer, 30, cancel).await.unwrap();
    }
}
