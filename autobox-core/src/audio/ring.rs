//! Single-producer single-consumer PCM sample ring.
//!
//! Shared storage of N interleaved int16 samples plus two atomic
//! indices. The decode side owns the write index, the render callback
//! owns the read index; each publishes its own index with `Release`
//! and observes the counterpart with `Acquire`, so the sample data
//! written before an index bump is visible to the other side after it
//! reads the bump.
//!
//! The writer never overwrites unread data: samples that do not fit
//! are dropped at the writer and counted. The reader only advances
//! after it has fully copied the samples it returns. One slot is kept
//! vacant so `(write − read) mod N ≤ N − 1` distinguishes full from
//! empty.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

// ── Shared storage ───────────────────────────────────────────────

struct RingShared {
    data: Box<[UnsafeCell<i16>]>,
    capacity: u32,
    /// Next slot the writer will fill (mod capacity).
    write: AtomicU32,
    /// Next slot the reader will take (mod capacity).
    read: AtomicU32,
    /// Samples dropped at the writer because the ring was full.
    dropped: AtomicU64,
}

// SAFETY: the write index is only advanced by the single PcmWriter and
// the read index only by the single PcmReader; each slot is accessed
// mutably only by the side that currently owns it per the index
// protocol above.
unsafe impl Send for RingShared {}
unsafe impl Sync for RingShared {}

impl RingShared {
    fn readable(&self, write: u32, read: u32) -> u32 {
        (write + self.capacity - read) % self.capacity
    }
}

/// Create a ring holding up to `capacity − 1` samples.
///
/// # Panics
///
/// Panics if `capacity < 2`.
pub fn pcm_ring(capacity: usize) -> (PcmWriter, PcmReader) {
    assert!(capacity >= 2, "ring needs at least two slots");
    let data: Box<[UnsafeCell<i16>]> = (0..capacity).map(|_| UnsafeCell::new(0)).collect();
    let shared = Arc::new(RingShared {
        data,
        capacity: capacity as u32,
        write: AtomicU32::new(0),
        read: AtomicU32::new(0),
        dropped: AtomicU64::new(0),
    });
    (
        PcmWriter {
            shared: Arc::clone(&shared),
        },
        PcmReader { shared },
    )
}

// ── PcmWriter ────────────────────────────────────────────────────

/// The decode-side half. Not cloneable: single writer.
pub struct PcmWriter {
    shared: Arc<RingShared>,
}

impl PcmWriter {
    /// Append samples; returns how many fit. The remainder is dropped
    /// and counted — unread data is never overwritten.
    pub fn write(&mut self, samples: &[i16]) -> usize {
        let shared = &self.shared;
        let write = shared.write.load(Ordering::Relaxed);
        let read = shared.read.load(Ordering::Acquire);
        let free = (shared.capacity - 1 - shared.readable(write, read)) as usize;

        let n = free.min(samples.len());
        for (i, &sample) in samples[..n].iter().enumerate() {
            let slot = (write as usize + i) % shared.capacity as usize;
            // SAFETY: slots in [write, write + n) are writer-owned.
            unsafe { *shared.data[slot].get() = sample };
        }
        shared
            .write
            .store((write + n as u32) % shared.capacity, Ordering::Release);

        let dropped = samples.len() - n;
        if dropped > 0 {
            shared.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        }
        n
    }

    /// Free sample slots right now.
    pub fn free(&self) -> usize {
        let shared = &self.shared;
        let write = shared.write.load(Ordering::Relaxed);
        let read = shared.read.load(Ordering::Acquire);
        (shared.capacity - 1 - shared.readable(write, read)) as usize
    }

    /// Total samples dropped at this writer.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

// ── PcmReader ────────────────────────────────────────────────────

/// The render-side half. Not cloneable: single reader.
pub struct PcmReader {
    shared: Arc<RingShared>,
}

impl PcmReader {
    /// Samples available to read right now.
    pub fn available(&self) -> usize {
        let shared = &self.shared;
        let write = shared.write.load(Ordering::Acquire);
        let read = shared.read.load(Ordering::Relaxed);
        shared.readable(write, read) as usize
    }

    /// Copy up to `out.len()` samples; returns how many were copied.
    /// The read index is published only after the copy completes.
    pub fn read(&mut self, out: &mut [i16]) -> usize {
        let shared = &self.shared;
        let write = shared.write.load(Ordering::Acquire);
        let read = shared.read.load(Ordering::Relaxed);
        let n = (shared.readable(write, read) as usize).min(out.len());

        for (i, slot_out) in out[..n].iter_mut().enumerate() {
            let slot = (read as usize + i) % shared.capacity as usize;
            // SAFETY: slots in [read, read + n) are reader-owned.
            *slot_out = unsafe { *shared.data[slot].get() };
        }
        shared
            .read
            .store((read + n as u32) % shared.capacity, Ordering::Release);
        n
    }

    /// Total samples dropped at the writer (diagnostics).
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

// ── Tests ────────────────────────────────────────────────────────
