//! Outbound frame queue feeding the single USB writer.
//!
//! All producers (driver control, touch, key, mic PCM) post here; one
//! writer task drains in order. The queue is bounded; overflow policy
//! is per category:
//!
//! - **Control** frames never drop — overflow is a hard error that the
//!   session escalates to `Failure`.
//! - **Touch** frames coalesce: the oldest *Move-only* touch frame is
//!   discarded to make room. Frames carrying a Down or Up are never
//!   dropped, so pointer state transitions survive and ordering across
//!   Down/Up boundaries is preserved.
//! - **AudioUpstream** (mic PCM) drops its oldest frame.
//!
//! Producers never block: `push` takes the lock, mutates, returns.
//! The consumer side blocks on a condvar so the writer thread needs no
//! async runtime.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::AutoboxError;
use crate::protocol::{Message, TouchAction};

// ── FrameCategory ────────────────────────────────────────────────

/// Overflow class of an outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCategory {
    /// Session control: init blobs, config, commands, heartbeats.
    Control,
    /// Touch and multi-touch frames.
    Touch,
    /// Microphone PCM upstream.
    AudioUpstream,
}

impl FrameCategory {
    fn name(&self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Touch => "touch",
            Self::AudioUpstream => "audio-upstream",
        }
    }
}

/// A frame queued for the writer.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub category: FrameCategory,
    pub message: Message,
}

/// `true` when every pointer in the frame is merely moving, i.e. the
/// frame carries no Down/Up state transition and may be coalesced.
fn is_move_only(message: &Message) -> bool {
    match message {
        Message::Touch(t) => t.action == TouchAction::Move,
        Message::MultiTouch(points) => points.iter().all(|p| p.action == TouchAction::Move),
        _ => false,
    }
}

// ── OutboundQueue ────────────────────────────────────────────────

/// Result of a blocking pop.
#[derive(Debug)]
pub enum PopResult {
    Frame(Outbound),
    /// Nothing arrived within the wait window.
    Empty,
    /// Queue closed and fully drained.
    Closed,
}

struct QueueState {
    frames: VecDeque<Outbound>,
    closed: bool,
}

/// Bounded multi-producer, single-consumer frame queue.
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue a frame, applying the category overflow policy.
    pub fn push(&self, category: FrameCategory, message: Message) -> Result<(), AutoboxError> {
        let mut state = self.state.lock().expect("outbound queue poisoned");
        if state.closed {
            return Err(AutoboxError::ChannelClosed);
        }

        if state.frames.len() >= self.capacity {
            let victim = state.frames.iter().position(|f| {
                f.category == category
                    && match category {
                        FrameCategory::Control => false,
                        FrameCategory::Touch => is_move_only(&f.message),
                        FrameCategory::AudioUpstream => true,
                    }
            });
            match victim {
                Some(idx) => {
                    state.frames.remove(idx);
                }
                None => {
                    return Err(AutoboxError::QueueOverflow {
                        category: category.name(),
                    });
                }
            }
        }

        state.frames.push_back(Outbound { category, message });
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Dequeue the next frame, waiting up to `timeout` for one.
    ///
    /// After [`close`](Self::close), remaining frames keep draining;
    /// only an empty closed queue reports [`PopResult::Closed`].
    pub fn pop_blocking(&self, timeout: Duration) -> PopResult {
        let mut state = self.state.lock().expect("outbound queue poisoned");
        loop {
            if let Some(frame) = state.frames.pop_front() {
                return PopResult::Frame(frame);
            }
            if state.closed {
                return PopResult::Closed;
            }
            let (next, wait) = self
                .available
                .wait_timeout(state, timeout)
                .expect("outbound queue poisoned");
            state = next;
            if wait.timed_out() && state.frames.is_empty() {
                return if state.closed {
                    PopResult::Closed
                } else {
                    PopResult::Empty
                };
            }
        }
    }

    /// Close the queue. Pending frames remain drainable.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("outbound queue poisoned");
        state.closed = true;
        drop(state);
        self.available.notify_all();
    }

    /// Discard anything not yet written.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("outbound queue poisoned");
        state.frames.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("outbound queue poisoned").frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandValue, TouchEvent};

    fn touch(action: TouchAction) -> Message {
        Message::Touch(TouchEvent {
            x: 0.5,
            y: 0.5,
            action,
        })
    }

    #[test]
    fn fifo_order_preserved() {
        let q = OutboundQueue::new(8);
        q.push(FrameCategory::Control, Message::HeartBeat).unwrap();
        q.push(FrameCategory::Touch, touch(TouchAction::Down)).unwrap();
        q.push(FrameCategory::Control, Message::Command(CommandValue::Siri))
            .unwrap();

        let order: Vec<Message> = (0..3)
            .map(|_| match q.pop_blocking(Duration::from_millis(10)) {
                PopResult::Frame(f) => f.message,
                other => panic!("expected frame, got {other:?}"),
            })
            .collect();
        assert_eq!(order[0], Message::HeartBeat);
        assert_eq!(order[1], touch(TouchAction::Down));
        assert_eq!(order[2], Message::Command(CommandValue::Siri));
    }

    #[test]
    fn touch_overflow_coalesces_oldest_move() {
        let q = OutboundQueue::new(2);
        q.push(FrameCategory::Touch, touch(TouchAction::Move)).unwrap();
        q.push(FrameCategory::Touch, touch(TouchAction::Up)).unwrap();
        // Full: the Move frame gives way, the Up survives.
        q.push(FrameCategory::Touch, touch(TouchAction::Move)).unwrap();

        match q.pop_blocking(Duration::from_millis(10)) {
            PopResult::Frame(f) => assert_eq!(f.message, touch(TouchAction::Up)),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn touch_down_up_never_dropped() {
        let q = OutboundQueue::new(2);
        q.push(FrameCategory::Touch, touch(TouchAction::Down)).unwrap();
        q.push(FrameCategory::Touch, touch(TouchAction::Up)).unwrap();
        // No Move-only frame to sacrifice: overflow is an error.
        assert!(matches!(
            q.push(FrameCategory::Touch, touch(TouchAction::Move)),
            Err(AutoboxError::QueueOverflow { category: "touch" })
        ));
    }

    #[test]
    fn control_overflow_is_an_error() {
        let q = OutboundQueue::new(1);
        q.push(FrameCategory::Control, Message::HeartBeat).unwrap();
        assert!(matches!(
            q.push(FrameCategory::Control, Message::HeartBeat),
            Err(AutoboxError::QueueOverflow { category: "control" })
        ));
    }

    #[test]
    fn audio_upstream_drops_oldest() {
        let q = OutboundQueue::new(1);
        let first = Message::AudioData(crate::protocol::AudioData::pcm_frame(
            5,
            0,
            bytes::Bytes::from_static(&[1, 0]),
        ));
        let second = Message::AudioData(crate::protocol::AudioData::pcm_frame(
            5,
            0,
            bytes::Bytes::from_static(&[2, 0]),
        ));
        q.push(FrameCategory::AudioUpstream, first).unwrap();
        q.push(FrameCategory::AudioUpstream, second.clone()).unwrap();

        match q.pop_blocking(Duration::from_millis(10)) {
            PopResult::Frame(f) => assert_eq!(f.message, second),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn overflow_only_victimizes_same_category() {
        let q = OutboundQueue::new(1);
        q.push(FrameCategory::Touch, touch(TouchAction::Move)).unwrap();
        // An audio frame cannot displace a touch frame.
        let audio = Message::AudioData(crate::protocol::AudioData::pcm_frame(
            5,
            0,
            bytes::Bytes::new(),
        ));
        assert!(q.push(FrameCategory::AudioUpstream, audio).is_err());
    }

    #[test]
    fn close_drains_then_reports_closed() {
        let q = OutboundQueue::new(4);
        q.push(FrameCategory::Control, Message::HeartBeat).unwrap();
        q.close();

        assert!(matches!(
            q.pop_blocking(Duration::from_millis(10)),
            PopResult::Frame(_)
        ));
        assert!(matches!(
            q.pop_blocking(Duration::from_millis(10)),
            PopResult::Closed
        ));
        // Push after close is rejected.
        assert!(q.push(FrameCategory::Control, Message::HeartBeat).is_err());
    }

    #[test]
    fn pop_times_out_when_empty() {
        let q = OutboundQueue::new(4);
        assert!(matches!(
            q.pop_blocking(Duration::from_millis(5)),
            PopResult::Empty
        ));
    }
}
