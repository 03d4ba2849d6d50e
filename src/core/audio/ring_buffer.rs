//! Lock-free single-producer/single-consumer sample ring.
//!
//! The ring is the only structure shared with the real-time output callback, so
//! it never locks and never allocates after construction. Both cursors are
//! atomics and every slot is an atomic `f32`; the producer publishes with
//! `Release` and the consumer observes with `Acquire`.
//!
//! One slot is reserved to tell "full" from "empty", so a ring created with
//! capacity `C` holds at most `C - 1` samples.
//!
//! # Overflow policy
//!
//! Writes never block. Samples that do not fit in the free space are dropped
//! (the newest data is lost, not the oldest) and counted in
//! [`SampleRingBuffer::dropped_samples`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use portable_atomic::AtomicF32;

/// Smallest capacity that can hold at least one sample.
const MIN_CAPACITY: usize = 2;

/// Fixed-capacity circular store of `f32` samples.
#[derive(Debug)]
pub struct SampleRingBuffer {
    slots: Box<[AtomicF32]>,
    capacity: usize,
    /// Next slot the producer writes.
    write_pos: AtomicUsize,
    /// Next slot the consumer reads.
    read_pos: AtomicUsize,
    /// Samples rejected because the ring was full.
    dropped: AtomicU64,
}

impl SampleRingBuffer {
    /// Create a ring with room for `capacity` slots (`capacity - 1` usable samples).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_CAPACITY);
        let slots = (0..capacity)
            .map(|_| AtomicF32::new(0.0))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            capacity,
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Create a ring sized to hold `seconds` of mono audio at `sample_rate`.
    pub fn with_duration(sample_rate: u32, seconds: f32) -> Self {
        let samples = (sample_rate as f64 * seconds.max(0.0) as f64).ceil() as usize;
        Self::new(samples + 1)
    }

    /// Total number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Maximum number of samples that can be buffered at once.
    #[inline]
    pub fn usable_capacity(&self) -> usize {
        self.capacity - 1
    }

    /// Number of samples written but not yet read.
    #[inline]
    pub fn available(&self) -> usize {
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        (w + self.capacity - r) % self.capacity
    }

    /// Number of samples that can be written before data starts being dropped.
    #[inline]
    pub fn free_space(&self) -> usize {
        self.usable_capacity() - self.available()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Total samples dropped by overflowing writes since construction.
    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Append samples, dropping whatever exceeds the free space.
    ///
    /// Returns the number of samples actually stored.
    pub fn write(&self, data: &[f32]) -> usize {
        let w = self.write_pos.load(Ordering::Relaxed);
        let r = self.read_pos.load(Ordering::Acquire);
        let available = (w + self.capacity - r) % self.capacity;
        let free = self.capacity - 1 - available;

        let count = data.len().min(free);
        for (i, &sample) in data[..count].iter().enumerate() {
            self.slots[(w + i) % self.capacity].store(sample, Ordering::Relaxed);
        }
        self.write_pos
            .store((w + count) % self.capacity, Ordering::Release);

        let rejected = data.len() - count;
        if rejected > 0 {
            self.dropped.fetch_add(rejected as u64, Ordering::Relaxed);
        }
        count
    }

    /// Append `count` samples of `data` starting at `offset`.
    ///
    /// Out-of-range requests are clamped to the slice.
    pub fn write_range(&self, data: &[f32], offset: usize, count: usize) -> usize {
        let start = offset.min(data.len());
        let end = start.saturating_add(count).min(data.len());
        self.write(&data[start..end])
    }

    /// Fill `out` from the ring, advancing the read cursor.
    ///
    /// Slots past the available data are zero-filled. Returns the number of
    /// real samples copied.
    pub fn read(&self, out: &mut [f32]) -> usize {
        let r = self.read_pos.load(Ordering::Acquire);
        let copied = self.copy_from(r, out);
        self.advance_read(r, copied);
        copied
    }

    /// Read into `data[offset..offset + count]`, zero-filling the unfilled part.
    pub fn read_range(&self, data: &mut [f32], offset: usize, count: usize) -> usize {
        let start = offset.min(data.len());
        let end = start.saturating_add(count).min(data.len());
        self.read(&mut data[start..end])
    }

    /// Copy upcoming samples into `out` without consuming them.
    ///
    /// Returns the number of real samples copied; the rest of `out` is zeroed.
    pub fn peek(&self, out: &mut [f32]) -> usize {
        let r = self.read_pos.load(Ordering::Acquire);
        self.copy_from(r, out)
    }

    /// Like [`peek`](Self::peek), but also returns the read cursor the copy
    /// started from, for a later [`consume_from`](Self::consume_from).
    ///
    /// Returns `(cursor, copied)`.
    pub fn peek_at(&self, out: &mut [f32]) -> (usize, usize) {
        let r = self.read_pos.load(Ordering::Acquire);
        (r, self.copy_from(r, out))
    }

    /// Consume up to `count` samples that were peeked at `cursor`.
    ///
    /// If the read cursor moved since the peek (a concurrent [`clear`](Self::clear)),
    /// nothing is consumed and 0 is returned, so samples written after the
    /// clear stay buffered.
    pub fn consume_from(&self, cursor: usize, count: usize) -> usize {
        let w = self.write_pos.load(Ordering::Acquire);
        let available = (w + self.capacity - cursor) % self.capacity;
        let count = count.min(available);
        if count == 0 {
            return 0;
        }
        match self.read_pos.compare_exchange(
            cursor,
            (cursor + count) % self.capacity,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => count,
            Err(_) => 0,
        }
    }

    /// Consume up to `count` samples without copying them.
    pub fn skip(&self, count: usize) -> usize {
        let r = self.read_pos.load(Ordering::Acquire);
        let w = self.write_pos.load(Ordering::Acquire);
        let available = (w + self.capacity - r) % self.capacity;
        let skipped = count.min(available);
        self.advance_read(r, skipped);
        skipped
    }

    /// Discard everything buffered by moving the read cursor onto the write cursor.
    pub fn clear(&self) {
        let w = self.write_pos.load(Ordering::Acquire);
        self.read_pos.store(w, Ordering::Release);
    }

    fn copy_from(&self, r: usize, out: &mut [f32]) -> usize {
        let w = self.write_pos.load(Ordering::Acquire);
        let available = (w + self.capacity - r) % self.capacity;
        let count = out.len().min(available);

        for (i, slot) in out[..count].iter_mut().enumerate() {
            *slot = self.slots[(r + i) % self.capacity].load(Ordering::Relaxed);
        }
        out[count..].fill(0.0);
        count
    }

    fn advance_read(&self, from: usize, count: usize) {
        if count == 0 {
            return;
        }
        // A concurrent clear() wins over this advance.
        let _ = self.read_pos.compare_exchange(
            from,
            (from + count) % self.capacity,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}
