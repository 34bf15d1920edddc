//! Latest-frame cache.
//!
//! This module holds the single-slot store that sits between one capture
//! producer and any number of streaming sessions.
//!
//! - `Frame`: Immutable encoded image (JPEG bytes) tagged with a sequence number.
//! - `FrameCache`: Overwrite-on-write slot. Readers copy out the current frame.
//!
//! The cache never queues. A newer write discards the previous frame even if no
//! reader has seen it, so memory and staleness stay bounded and a slow reader
//! can never apply backpressure to the producer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Frame: immutable encoded image
// ----------------------------------------------------------------------------

/// One encoded frame as produced by a capture backend.
///
/// The payload is shared immutably between readers; cloning a `Frame` never
/// copies pixel data and nobody can mutate it after the write.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Arc<[u8]>,
    /// Sequence number assigned at write time. Strictly increasing per cache.
    pub seq: u64,
    captured_at: Instant,
}

impl Frame {
    /// Encoded bytes (JPEG for every built-in backend).
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Time since the producer handed this frame to the cache.
    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }
}

// ----------------------------------------------------------------------------
// FrameCache: single-slot latest-wins store
// ----------------------------------------------------------------------------

/// Single-slot cache shared by one writer and many readers.
///
/// `write` and `read` each hold the lock only for a pointer swap / clone, so a
/// reader can never observe a partially written frame and the lock is never
/// held across network I/O or inference.
#[derive(Debug, Default)]
pub struct FrameCache {
    slot: Mutex<Slot>,
    writes: AtomicU64,
}

#[derive(Debug, Default)]
struct Slot {
    latest: Option<Frame>,
    next_seq: u64,
}

impl FrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the slot with a new frame and return its sequence number.
    ///
    /// Empty payloads are ignored (returns `None`) so readers never receive an
    /// empty frame that looks like the "no frame yet" sentinel.
    pub fn write(&self, data: Vec<u8>) -> Option<u64> {
        if data.is_empty() {
            return None;
        }
        let data: Arc<[u8]> = data.into();
        let mut slot = self.lock();
        slot.next_seq += 1;
        let seq = slot.next_seq;
        slot.latest = Some(Frame {
            data,
            seq,
            captured_at: Instant::now(),
        });
        drop(slot);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Some(seq)
    }

    /// Copy out the current frame, or `None` if nothing was written yet.
    pub fn read(&self) -> Option<Frame> {
        self.lock().latest.clone()
    }

    /// Like `read`, but only returns a frame newer than `last_seq`.
    pub fn read_newer(&self, last_seq: u64) -> Option<Frame> {
        let slot = self.lock();
        match &slot.latest {
            Some(frame) if frame.seq > last_seq => Some(frame.clone()),
            _ => None,
        }
    }

    /// Sequence number of the current frame (0 when empty).
    pub fn latest_seq(&self) -> u64 {
        self.lock().latest.as_ref().map_or(0, |frame| frame.seq)
    }

    /// Total frames written since creation.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // The slot only ever holds a whole `Frame`, so a poisoned lock still
        // guards a consistent value.
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
