//! Fixed-capacity history of decimated samples, shared between the acquisition thread and
//! the renderer.

use core::ops::{Add, Sub};
use std::ops::{AddAssign, SubAssign};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::Sample;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingCursor {
    index: usize,
    bound: usize,
}

impl RingCursor {
    pub fn new(bound: usize) -> RingCursor {
        RingCursor { index: 0, bound }
    }

    pub fn into_inner(self) -> usize {
        self.index
    }

    fn wrap(index: usize, bound: usize) -> RingCursor {
        // a zero bound is an unallocated ring; every position is position zero
        RingCursor { index: index.checked_rem(bound).unwrap_or(0), bound }
    }
}

impl Add<usize> for RingCursor {
    type Output = RingCursor;

    fn add(self, offset: usize) -> Self::Output {
        let offset = offset.checked_rem(self.bound).unwrap_or(0);
        RingCursor::wrap(self.index.wrapping_add(offset), self.bound)
    }
}

impl AddAssign<usize> for RingCursor {
    fn add_assign(&mut self, offset: usize) {
        *self = *self + offset
    }
}

impl Sub<usize> for RingCursor {
    type Output = RingCursor;

    fn sub(self, offset: usize) -> Self::Output {
        let offset = offset.checked_rem(self.bound).unwrap_or(0);
        RingCursor::wrap(self.index + self.bound - offset, self.bound)
    }
}

impl SubAssign<usize> for RingCursor {
    fn sub_assign(&mut self, offset: usize) {
        *self = *self - offset
    }
}

#[derive(Debug)]
pub struct RingBuffer {
    storage: Vec<Sample>,
    head: RingCursor,
    filled: usize,
    appended: u64,
}

impl RingBuffer {
    /// Creates a ring holding at most `capacity` samples. A zero capacity ring is unallocated
    /// and ignores appends.
    pub fn new(capacity: usize) -> RingBuffer {
        RingBuffer {
            storage: vec![0; capacity],
            head: RingCursor::new(capacity),
            filled: 0,
            appended: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Number of valid samples; never exceeds the capacity.
    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Position the next sample will be written to.
    pub fn cursor(&self) -> RingCursor {
        self.head
    }

    /// Total samples appended since the last reset, including overwritten ones.
    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// Writes `samples` after the newest sample, overwriting the oldest ones once full.
    /// A batch longer than the ring leaves only its last `capacity` samples.
    pub fn append(&mut self, samples: &[Sample]) {
        let capacity = self.capacity();
        if capacity == 0 || samples.is_empty() { return }
        self.appended += samples.len() as u64;

        let samples = &samples[samples.len().saturating_sub(capacity)..];
        let start = self.head.into_inner();
        let (first, second) = samples.split_at(samples.len().min(capacity - start));
        self.storage[start..start + first.len()].copy_from_slice(first);
        self.storage[..second.len()].copy_from_slice(second);

        self.head += samples.len();
        self.filled = (self.filled + samples.len()).min(capacity);
    }

    /// Copies the valid samples, oldest first, into `output`.
    pub fn snapshot_into(&self, output: &mut Vec<Sample>) {
        output.clear();
        output.reserve(self.filled);
        let oldest = (self.head - self.filled).into_inner();
        if oldest + self.filled <= self.capacity() {
            output.extend_from_slice(&self.storage[oldest..oldest + self.filled]);
        } else {
            output.extend_from_slice(&self.storage[oldest..]);
            output.extend_from_slice(&self.storage[..self.head.into_inner()]);
        }
    }

    pub fn snapshot(&self) -> Vec<Sample> {
        let mut output = Vec::new();
        self.snapshot_into(&mut output);
        output
    }

    /// Discards all samples and reallocates for `capacity`.
    pub fn reset(&mut self, capacity: usize) {
        log::debug!("resizing ring buffer from {} to {} samples", self.capacity(), capacity);
        *self = RingBuffer::new(capacity)
    }

    /// Discards all samples, keeping the allocation.
    pub fn clear(&mut self) {
        self.head = RingCursor::new(self.capacity());
        self.filled = 0;
        self.appended = 0;
    }
}

/// Ring buffer handle that may be cloned into the acquisition thread.
///
/// Every method holds the lock only for the duration of one copy, so a reader observes either
/// none or all of any appended batch.
#[derive(Debug, Clone)]
pub struct SharedRing(Arc<Mutex<RingBuffer>>);

impl SharedRing {
    pub fn new(capacity: usize) -> SharedRing {
        SharedRing(Arc::new(Mutex::new(RingBuffer::new(capacity))))
    }

    fn lock(&self) -> MutexGuard<'_, RingBuffer> {
        // the ring holds plain samples; a panic mid-copy leaves nothing worth refusing to read
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, samples: &[Sample]) {
        self.lock().append(samples)
    }

    pub fn snapshot(&self) -> Vec<Sample> {
        self.lock().snapshot()
    }

    /// Copies the valid samples into `output` and returns the capacity they were taken from.
    pub fn snapshot_into(&self, output: &mut Vec<Sample>) -> usize {
        let ring = self.lock();
        ring.snapshot_into(output);
        ring.capacity()
    }

    pub fn reset(&self, capacity: usize) {
        self.lock().reset(capacity)
    }

    pub fn clear(&self) {
        self.lock().clear()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    /// Returns `(len, capacity)` under one lock.
    pub fn fill(&self) -> (usize, usize) {
        let ring = self.lock();
        (ring.len(), ring.capacity())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ring_cursor() {
        let cursor = RingCursor::new(128);
        assert_eq!((cursor + 10).index, 10);
        assert_eq!((cursor + 10 + 120).index, 2);
        assert_eq!((cursor + 130).index, 2);
        assert_eq!((cursor - 10).index, 118);
        assert_eq!((cursor - 130).index, 126);
        assert_eq!((cursor + 0), cursor);
        let mut cursor = cursor;
        cursor += 10;
        assert_eq!(cursor.index, 10);
        cursor -= 20;
        assert_eq!(cursor.index, 118);
    }

    #[test]
    fn test_ring_cursor_unallocated() {
        let cursor = RingCursor::new(0);
        assert_eq!((cursor + 5).into_inner(), 0);
        assert_eq!((cursor - 5).into_inner(), 0);
    }

    #[test]
    fn test_ring_simple() {
        let mut ring = RingBuffer::new(8);
        assert!(ring.is_empty());
        ring.append(&[1, 2, 3]);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.snapshot(), [1, 2, 3]);
        ring.append(&[4, 5, 6, 7, 8]);
        assert_eq!(ring.len(), 8);
        assert_eq!(ring.snapshot(), [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_ring_wraparound() {
        let mut ring = RingBuffer::new(8);
        ring.append(&[1, 2, 3, 4, 5, 6]);
        ring.append(&[7, 8, 9, 10]);
        assert_eq!(ring.len(), 8);
        assert_eq!(ring.cursor().into_inner(), 2);
        assert_eq!(ring.snapshot(), [3, 4, 5, 6, 7, 8, 9, 10]);
        ring.append(&[11]);
        assert_eq!(ring.snapshot(), [4, 5, 6, 7, 8, 9, 10, 11]);
        assert_eq!(ring.appended(), 11);
    }

    #[test]
    fn test_ring_oversize_batch() {
        let mut ring = RingBuffer::new(4);
        ring.append(&[1]);
        ring.append(&[10, 11, 12, 13, 14, 15, 16]);
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.snapshot(), [13, 14, 15, 16]);
        ring.append(&[17, 18]);
        assert_eq!(ring.snapshot(), [15, 16, 17, 18]);
    }

    #[test]
    fn test_ring_unallocated() {
        let mut ring = RingBuffer::new(0);
        ring.append(&[1, 2, 3]);
        assert_eq!(ring.len(), 0);
        assert_eq!(ring.capacity(), 0);
        assert!(ring.snapshot().is_empty());
    }

    #[test]
    fn test_ring_reset() {
        let mut ring = RingBuffer::new(4);
        ring.append(&[1, 2, 3]);
        ring.reset(6);
        assert_eq!(ring.capacity(), 6);
        assert!(ring.is_empty());
        assert_eq!(ring.appended(), 0);
        ring.append(&[4, 5]);
        assert_eq!(ring.snapshot(), [4, 5]);
        ring.clear();
        assert!(ring.snapshot().is_empty());
        assert_eq!(ring.capacity(), 6);
    }

    #[test]
    fn test_ring_filled_never_exceeds_capacity() {
        let mut ring = RingBuffer::new(7);
        for size in 0..20 {
            let batch = vec![size as i8; size];
            ring.append(&batch);
            assert!(ring.len() <= ring.capacity());
            assert_eq!(ring.snapshot().len(), ring.len());
        }
    }

    #[test]
    fn test_shared_ring_batches_are_not_torn() {
        const BATCH: usize = 16;
        let ring = SharedRing::new(BATCH * 10);
        let writer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                for index in 0..5000usize {
                    ring.append(&[index as i8; BATCH]);
                }
            })
        };
        let mut snapshot = Vec::new();
        while !writer.is_finished() {
            ring.snapshot_into(&mut snapshot);
            assert_eq!(snapshot.len() % BATCH, 0);
            let batches = snapshot.chunks(BATCH).collect::<Vec<_>>();
            for batch in &batches {
                assert!(batch.iter().all(|&sample| sample == batch[0]));
            }
            for pair in batches.windows(2) {
                assert_eq!(pair[1][0], pair[0][0].wrapping_add(1));
            }
        }
        writer.join().unwrap();
        assert_eq!(ring.fill(), (BATCH * 10, BATCH * 10));
    }

    #[test]
    fn test_shared_snapshot_matches_capacity_across_resets() {
        let ring = SharedRing::new(1000);
        let resizer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                for index in 0..2000usize {
                    ring.append(&[1; 64]);
                    ring.reset(if index % 2 == 0 { 10 } else { 1000 });
                    ring.append(&[2; 64]);
                }
            })
        };
        let mut snapshot = Vec::new();
        while !resizer.is_finished() {
            let capacity = ring.snapshot_into(&mut snapshot);
            assert!(snapshot.len() <= capacity, "{} samples in a ring of {}", snapshot.len(), capacity);
        }
        resizer.join().unwrap();
    }
}
