//! Input encoding: normalized touch, multi-touch snapshots, keys.
//!
//! Coordinates are normalized to the unit square before they reach the
//! wire; NaN and infinite values clamp to the nearest edge (0).
//!
//! Multi-touch is stateful: the dongle expects a full-frame snapshot
//! of every active pointer on each update, with the changed pointer
//! carrying its Down/Up action and the rest reporting Move. Slot ids
//! are small integers allocated at pointer-down (lowest free slot)
//! and become reusable after the pointer lifts.

use crate::protocol::{CommandValue, Message, TouchAction, TouchEvent, TouchPoint};

// ── Single touch ─────────────────────────────────────────────────

fn clamp_unit(v: f32) -> f32 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Encode a normalized single-touch frame.
pub fn encode_touch(x: f32, y: f32, action: TouchAction) -> Message {
    Message::Touch(TouchEvent {
        x: clamp_unit(x),
        y: clamp_unit(y),
        action,
    })
}

/// Encode a key command frame.
pub fn encode_key(value: CommandValue) -> Message {
    Message::Command(value)
}

// ── Multi-touch tracking ─────────────────────────────────────────

/// One pointer change reported by the host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerUpdate {
    /// Host-side pointer identity (OS pointer id).
    pub pointer_id: u64,
    pub x: f32,
    pub y: f32,
    pub phase: TouchAction,
}

#[derive(Debug, Clone, Copy)]
struct ActivePointer {
    pointer_id: u64,
    x: f32,
    y: f32,
}

/// Maps host pointer ids to wire slot ids and builds snapshots.
#[derive(Debug, Default)]
pub struct MultiTouchTracker {
    /// Index = wire slot id; `None` = free.
    slots: Vec<Option<ActivePointer>>,
}

impl MultiTouchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one pointer change; returns the multi-touch frame to
    /// send, or `None` for updates about unknown pointers.
    pub fn update(&mut self, update: PointerUpdate) -> Option<Message> {
        let x = clamp_unit(update.x);
        let y = clamp_unit(update.y);

        let slot = match update.phase {
            TouchAction::Down => {
                let slot = match self.find_slot(update.pointer_id) {
                    // Re-down of a live pointer: reuse its slot.
                    Some(slot) => slot,
                    None => self.allocate(),
                };
                self.slots[slot] = Some(ActivePointer {
                    pointer_id: update.pointer_id,
                    x,
                    y,
                });
                slot
            }
            TouchAction::Move | TouchAction::Up => {
                let slot = self.find_slot(update.pointer_id)?;
                let entry = self.slots[slot].as_mut().expect("slot occupied");
                entry.x = x;
                entry.y = y;
                slot
            }
        };

        let frame = self.snapshot(slot, update.phase);

        if update.phase == TouchAction::Up {
            self.slots[slot] = None;
        }

        Some(frame)
    }

    /// Currently held slot ids (ids seen Down, not yet Up).
    pub fn active_slots(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i as u32))
            .collect()
    }

    fn find_slot(&self, pointer_id: u64) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.map(|p| p.pointer_id) == Some(pointer_id))
    }

    fn allocate(&mut self) -> usize {
        match self.slots.iter().position(Option::is_none) {
            Some(free) => free,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        }
    }

    /// Full-frame snapshot: every active pointer, the changed one with
    /// its override action, the rest as Move.
    fn snapshot(&self, changed_slot: usize, action: TouchAction) -> Message {
        let points = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| {
                entry.map(|p| TouchPoint {
                    id: slot as u32,
                    x: p.x,
                    y: p.y,
                    action: if slot == changed_slot {
                        action
                    } else {
                        TouchAction::Move
                    },
                })
            })
            .collect();
        Message::MultiTouch(points)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn down(id: u64, x: f32, y: f32) -> PointerUpdate {
        PointerUpdate {
            pointer_id: id,
            x,
            y,
            phase: TouchAction::Down,
        }
    }

    fn moved(id: u64, x: f32, y: f32) -> PointerUpdate {
        PointerUpdate {
            pointer_id: id,
            x,
            y,
            phase: TouchAction::Move,
        }
    }

    fn up(id: u64) -> PointerUpdate {
        PointerUpdate {
            pointer_id: id,
            x: 0.0,
            y: 0.0,
            phase: TouchAction::Up,
        }
    }

    fn points(msg: Message) -> Vec<TouchPoint> {
        match msg {
            Message::MultiTouch(p) => p,
            other => panic!("expected MultiTouch, got {other:?}"),
        }
    }

    #[test]
    fn touch_clamps_non_finite_and_out_of_range() {
        let msg = encode_touch(f32::NAN, f32::INFINITY, TouchAction::Down);
        match msg {
            Message::Touch(t) => {
                assert_eq!(t.x, 0.0);
                assert_eq!(t.y, 0.0);
            }
            other => panic!("expected Touch, got {other:?}"),
        }

        match encode_touch(-3.0, 7.5, TouchAction::Move) {
            Message::Touch(t) => {
                assert_eq!(t.x, 0.0);
                assert_eq!(t.y, 1.0);
            }
            other => panic!("expected Touch, got {other:?}"),
        }
    }

    #[test]
    fn snapshot_contains_all_pointers_with_override() {
        let mut tracker = MultiTouchTracker::new();
        tracker.update(down(100, 0.1, 0.1));
        let frame = points(tracker.update(down(200, 0.9, 0.9)).unwrap());

        assert_eq!(frame.len(), 2);
        assert_eq!(frame[0].id, 0);
        assert_eq!(frame[0].action, TouchAction::Move); // unchanged pointer
        assert_eq!(frame[1].id, 1);
        assert_eq!(frame[1].action, TouchAction::Down); // the changed one
    }

    #[test]
    fn up_overrides_then_releases_slot() {
        let mut tracker = MultiTouchTracker::new();
        tracker.update(down(100, 0.1, 0.1));
        tracker.update(down(200, 0.9, 0.9));

        let frame = points(tracker.update(up(100)).unwrap());
        assert_eq!(frame.len(), 2);
        assert_eq!(frame[0].action, TouchAction::Up);
        assert_eq!(frame[1].action, TouchAction::Move);

        // Slot 0 released; only slot 1 remains active.
        assert_eq!(tracker.active_slots(), vec![1]);
    }

    #[test]
    fn slot_ids_are_stable_and_reused_after_release() {
        let mut tracker = MultiTouchTracker::new();
        tracker.update(down(100, 0.1, 0.1));
        tracker.update(down(200, 0.2, 0.2));
        assert_eq!(tracker.active_slots(), vec![0, 1]);

        // Pointer 100 keeps slot 0 for its whole lifetime.
        let frame = points(tracker.update(moved(100, 0.3, 0.3)).unwrap());
        assert_eq!(frame[0].id, 0);
        assert_eq!(frame[0].x, 0.3);

        tracker.update(up(100));
        // Next pointer-down takes the lowest free slot: 0 again.
        tracker.update(down(300, 0.5, 0.5));
        assert_eq!(tracker.active_slots(), vec![0, 1]);

        let frame = points(tracker.update(moved(300, 0.6, 0.6)).unwrap());
        let slot_of_300 = frame.iter().find(|p| p.x == 0.6).unwrap();
        assert_eq!(slot_of_300.id, 0);
    }

    #[test]
    fn move_for_unknown_pointer_is_ignored() {
        let mut tracker = MultiTouchTracker::new();
        assert!(tracker.update(moved(999, 0.5, 0.5)).is_none());
        assert!(tracker.update(up(999)).is_none());
    }

    #[test]
    fn active_set_matches_down_not_up() {
        let mut tracker = MultiTouchTracker::new();
        tracker.update(down(1, 0.1, 0.1));
        tracker.update(down(2, 0.2, 0.2));
        tracker.update(down(3, 0.3, 0.3));
        tracker.update(up(2));
        assert_eq!(tracker.active_slots(), vec![0, 2]);
    }
}
