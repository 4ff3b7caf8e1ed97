// src/ring.rs

//! Bounded SPSC rings of fixed-size stereo chunks between each synthesis
//! engine and the audio callback.
//!
//! Each slot carries `frames * 2` interleaved f32 samples and an atomic
//! EMPTY/FULL state. The producer publishes a slot with a release store so a
//! consumer that observes FULL with an acquire load sees every sample write;
//! the consumer hands the slot back the same way. Neither side ever blocks:
//! the producer retries with a bounded backoff and eventually abandons the
//! buffer, the consumer substitutes silence.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const EMPTY: u8 = 0;
const FULL: u8 = 1;

/// Producer-side backoff ladder while the next slot is still FULL.
const BACKOFF_STEPS_US: [u64; 5] = [5, 10, 20, 50, 100];
/// Give up on the buffer after roughly this long; the consumer will see an
/// EMPTY slot and emit silence for this engine.
const ABANDON_AFTER: Duration = Duration::from_millis(10);

struct Slot {
    state: AtomicU8,
    samples: UnsafeCell<Box<[f32]>>,
}

struct Shared {
    slots: Box<[Slot]>,
    frames: usize,
}

// Slot sample storage is only ever touched by the single producer (while the
// slot is EMPTY) or the single consumer (while it is FULL); the state field
// mediates the handoff with acquire/release.
unsafe impl Sync for Shared {}
unsafe impl Send for Shared {}

/// Creates a ring of `capacity` slots of `frames` stereo frames each.
/// Capacity 2 is the double-buffer minimum; 4-8 absorbs scheduling jitter.
pub fn audio_ring(capacity: usize, frames: usize) -> (RingProducer, RingConsumer) {
    assert!(capacity >= 2, "ring capacity must be at least 2");
    let slots = (0..capacity)
        .map(|_| Slot {
            state: AtomicU8::new(EMPTY),
            samples: UnsafeCell::new(vec![0.0f32; frames * 2].into_boxed_slice()),
        })
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let shared = Arc::new(Shared { slots, frames });
    (
        RingProducer {
            shared: shared.clone(),
            next: 0,
        },
        RingConsumer { shared, next: 0 },
    )
}

pub struct RingProducer {
    shared: Arc<Shared>,
    next: usize,
}

impl RingProducer {
    pub fn frames(&self) -> usize {
        self.shared.frames
    }

    /// Copies one interleaved stereo chunk into the next slot if it is EMPTY.
    pub fn try_push(&mut self, chunk: &[f32]) -> bool {
        debug_assert_eq!(chunk.len(), self.shared.frames * 2);
        let slot = &self.shared.slots[self.next];
        if slot.state.load(Ordering::Acquire) != EMPTY {
            return false;
        }
        unsafe {
            let dst = &mut *slot.samples.get();
            dst.copy_from_slice(chunk);
        }
        slot.state.store(FULL, Ordering::Release);
        self.next = (self.next + 1) % self.shared.slots.len();
        true
    }

    /// `try_push` with the bounded exponential backoff. Returns false when
    /// the buffer had to be abandoned (consumer stalled for ~10 ms).
    pub fn push_with_backoff(&mut self, chunk: &[f32]) -> bool {
        if self.try_push(chunk) {
            return true;
        }
        let start = Instant::now();
        let mut step = 0;
        loop {
            std::thread::sleep(Duration::from_micros(
                BACKOFF_STEPS_US[step.min(BACKOFF_STEPS_US.len() - 1)],
            ));
            step += 1;
            if self.try_push(chunk) {
                return true;
            }
            if start.elapsed() >= ABANDON_AFTER {
                return false;
            }
        }
    }
}

pub struct RingConsumer {
    shared: Arc<Shared>,
    next: usize,
}

impl RingConsumer {
    pub fn frames(&self) -> usize {
        self.shared.frames
    }

    /// Copies the next FULL chunk into `out` and releases the slot. When the
    /// slot is EMPTY, `out` is zeroed and false is returned; the read
    /// position does not advance, so the engine's stream stays contiguous.
    pub fn pop_into(&mut self, out: &mut [f32]) -> bool {
        debug_assert_eq!(out.len(), self.shared.frames * 2);
        let slot = &self.shared.slots[self.next];
        if slot.state.load(Ordering::Acquire) != FULL {
            out.fill(0.0);
            return false;
        }
        unsafe {
            let src = &*slot.samples.get();
            out.copy_from_slice(src);
        }
        slot.state.store(EMPTY, Ordering::Release);
        self.next = (self.next + 1) % self.shared.slots.len();
        true
    }

    /// Number of slots currently FULL, producer's view notwithstanding.
    /// Diagnostic only.
    pub fn occupancy(&self) -> usize {
        self.shared
            .slots
            .iter()
            .filter(|s| s.state.load(Ordering::Relaxed) == FULL)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_preserved() {
        let (mut tx, mut rx) = audio_ring(4, 2);
        for n in 0..3 {
            let v = n as f32;
            assert!(tx.try_push(&[v, v, v + 0.5, v + 0.5]));
        }
        let mut out = [0.0f32; 4];
        for n in 0..3 {
            assert!(rx.pop_into(&mut out));
            assert_eq!(out[0], n as f32);
        }
        assert!(!rx.pop_into(&mut out));
        assert!(out.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn producer_blocked_by_full_ring() {
        let (mut tx, mut rx) = audio_ring(2, 1);
        assert!(tx.try_push(&[0.1, 0.1]));
        assert!(tx.try_push(&[0.2, 0.2]));
        assert!(!tx.try_push(&[0.3, 0.3]));
        let mut out = [0.0f32; 2];
        assert!(rx.pop_into(&mut out));
        assert!(tx.try_push(&[0.3, 0.3]));
    }

    #[test]
    fn empty_pop_substitutes_silence_without_advancing() {
        let (mut tx, mut rx) = audio_ring(2, 1);
        let mut out = [9.0f32; 2];
        assert!(!rx.pop_into(&mut out));
        assert_eq!(out, [0.0, 0.0]);
        // The slot the consumer is parked on is the one the producer fills
        // next, so the stream resumes without skipping.
        assert!(tx.try_push(&[0.7, 0.7]));
        assert!(rx.pop_into(&mut out));
        assert_eq!(out, [0.7, 0.7]);
    }

    #[test]
    fn cross_thread_handoff() {
        let (mut tx, mut rx) = audio_ring(4, 64);
        let producer = std::thread::spawn(move || {
            let mut chunk = vec![0.0f32; 128];
            for n in 0..200 {
                for (i, x) in chunk.iter_mut().enumerate() {
                    *x = (n * 128 + i) as f32;
                }
                while !tx.try_push(&chunk) {
                    std::thread::yield_now();
                }
            }
        });
        let mut out = vec![0.0f32; 128];
        let mut expected = 0.0f32;
        let mut received = 0;
        while received < 200 {
            if rx.pop_into(&mut out) {
                assert_eq!(out[0], expected);
                assert_eq!(out[127], expected + 127.0);
                expected += 128.0;
                received += 1;
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn backoff_abandons_after_timeout() {
        let (mut tx, _rx) = audio_ring(2, 1);
        assert!(tx.push_with_backoff(&[0.0, 0.0]));
        assert!(tx.push_with_backoff(&[0.0, 0.0]));
        let start = Instant::now();
        assert!(!tx.push_with_backoff(&[0.0, 0.0]));
        assert!(start.elapsed() >= ABANDON_AFTER);
    }
}
