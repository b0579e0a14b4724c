//! Lock-free ring buffer carrying decoded samples to the render callback.
//!
//! Single-producer, single-consumer: the decode worker writes, the audio
//! callback reads. Positions only ever advance, wrapping through a
//! power-of-two capacity, so a masked index is always in bounds.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Lock-free single-producer, single-consumer ring buffer of f32 samples.
///
/// The consumer side is safe to call from a real-time audio callback: reads
/// touch only atomics and a preallocated slab, never a lock held across I/O.
pub struct RingBuffer {
    /// Preallocated sample storage, interior-mutable through the position
    /// protocol: the producer only writes slots in `[write_pos, read_pos +
    /// capacity)`, the consumer only reads slots in `[read_pos, write_pos)`.
    slots: Box<[Slot]>,
    /// Monotonic read position (wrapping).
    read_pos: AtomicUsize,
    /// Monotonic write position (wrapping).
    write_pos: AtomicUsize,
    /// Mask for index wrapping (capacity - 1).
    mask: usize,
}

/// One sample cell. A dedicated type keeps the interior mutability narrow.
struct Slot(std::cell::UnsafeCell<f32>);

// SAFETY: slot access is disjoint between the single producer and single
// consumer, coordinated by the acquire/release position protocol below.
#[allow(unsafe_code)]
unsafe impl Send for Slot {}
#[allow(unsafe_code)]
unsafe impl Sync for Slot {}

impl RingBuffer {
    /// Create a ring buffer holding at least `capacity` samples.
    ///
    /// The capacity is rounded up to the next power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let slots = (0..capacity)
            .map(|_| Slot(std::cell::UnsafeCell::new(0.0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
            mask: capacity - 1,
        }
    }

    /// Total capacity in samples.
    pub const fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Samples currently available for reading.
    pub fn available(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// Free slots available for writing.
    pub fn free(&self) -> usize {
        self.capacity() - self.available()
    }

    /// True when no samples are buffered.
    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// True when no further samples can be written.
    pub fn is_full(&self) -> bool {
        self.free() == 0
    }

    /// Write samples from the producer thread.
    ///
    /// Returns the number of samples actually written (0 when full).
    pub fn write(&self, samples: &[f32]) -> usize {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);

        let space = self.capacity() - write.wrapping_sub(read);
        let count = samples.len().min(space);

        for (offset, &sample) in samples[..count].iter().enumerate() {
            let idx = write.wrapping_add(offset) & self.mask;
            // SAFETY: these slots are outside [read, write) so the consumer
            // will not touch them until the position store below.
            #[allow(unsafe_code)]
            unsafe {
                *self.slots[idx].0.get() = sample;
            }
        }

        self.write_pos
            .store(write.wrapping_add(count), Ordering::Release);
        count
    }

    /// Read samples from the consumer thread.
    ///
    /// Returns the number of samples actually read (0 when empty).
    pub fn read(&self, output: &mut [f32]) -> usize {
        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);

        let buffered = write.wrapping_sub(read);
        let count = output.len().min(buffered);

        for (offset, out) in output[..count].iter_mut().enumerate() {
            let idx = read.wrapping_add(offset) & self.mask;
            // SAFETY: these slots are inside [read, write) which the
            // producer will not overwrite until the position store below.
            #[allow(unsafe_code)]
            unsafe {
                *out = *self.slots[idx].0.get();
            }
        }

        self.read_pos
            .store(read.wrapping_add(count), Ordering::Release);
        count
    }

    /// Discard everything currently buffered.
    ///
    /// Only the producer may call this, and only while it is not writing
    /// concurrently (the swap/seek protocol guarantees that).
    pub fn clear(&self) {
        let write = self.write_pos.load(Ordering::Relaxed);
        self.read_pos.store(write, Ordering::Release);
    }
}

/// Thread-safe reference to a ring buffer.
pub type SharedRingBuffer = Arc<RingBuffer>;

/// Create a new shared ring buffer.
pub fn shared_ring_buffer(capacity: usize) -> SharedRingBuffer {
    Arc::new(RingBuffer::new(capacity))
}
