//! Lock-free SPSC ring buffer.
//!
//! The classic single-producer / single-consumer ring: the producer is the
//! only writer of `tail`, the consumer the only writer of `head`, and one
//! physical slot is sacrificed to tell empty (`head == tail`) from full
//! (`tail + 1 == head`, modulo capacity). Blocking is a busy-wait with a
//! pause each iteration and a scheduler yield once the wait drags on; the
//! timeout is checked every iteration.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{PikaError, PikaResult};
use crate::utils::{spin_backoff, Timeout, Timer};

/// Shared state of the lock-free ring: just the two cursors. Initialized
/// in place inside a zero-filled region.
#[repr(C)]
pub struct SpscState {
    /// Consumer cursor; written only by the consumer
    head: AtomicU64,
    /// Producer cursor; written only by the producer
    tail: AtomicU64,
}

/// Per-endpoint view of a lock-free ring.
///
/// `capacity` is the physical slot count, queue length plus the sacrificed
/// slot. Correctness rests on at most one live producer and one live
/// consumer, which channel creation enforces.
#[derive(Debug)]
pub struct SpscRing {
    state: NonNull<SpscState>,
    slots: NonNull<u8>,
    element_size: usize,
    capacity: u64,
}

// SAFETY: the view owns nothing thread-affine; cross-endpoint publication
// goes through the release/acquire cursor protocol.
unsafe impl Send for SpscRing {}

impl SpscRing {
    /// Zero the cursors and return a view.
    ///
    /// # Safety
    ///
    /// `state` must point to zeroed (or dead) storage for an `SpscState`
    /// and `slots` to at least `(queue_len + 1) * element_size` bytes,
    /// both valid for the life of the returned view and any peer view.
    /// The caller must hold the channel-creation gate.
    pub unsafe fn init_in_place(
        state: NonNull<SpscState>,
        slots: NonNull<u8>,
        element_size: usize,
        element_alignment: usize,
        queue_len: u64,
    ) -> PikaResult<Self> {
        Self::validate_geometry(slots, element_alignment, queue_len)?;
        let st = state.as_ref();
        st.head.store(0, Ordering::Relaxed);
        st.tail.store(0, Ordering::Relaxed);
        Ok(Self::view(state, slots, element_size, queue_len))
    }

    /// Build a view over already-initialized shared state.
    ///
    /// # Safety
    ///
    /// Same pointer contract as [`init_in_place`](Self::init_in_place),
    /// with the state already initialized and matching geometry.
    pub unsafe fn attach(
        state: NonNull<SpscState>,
        slots: NonNull<u8>,
        element_size: usize,
        element_alignment: usize,
        queue_len: u64,
    ) -> PikaResult<Self> {
        Self::validate_geometry(slots, element_alignment, queue_len)?;
        Ok(Self::view(state, slots, element_size, queue_len))
    }

    fn view(state: NonNull<SpscState>, slots: NonNull<u8>, element_size: usize, queue_len: u64) -> Self {
        Self {
            state,
            slots,
            element_size,
            capacity: queue_len + 1,
        }
    }

    fn validate_geometry(
        slots: NonNull<u8>,
        element_alignment: usize,
        queue_len: u64,
    ) -> PikaResult<()> {
        if queue_len == 0 {
            return Err(PikaError::ring_buffer("queue length must be at least 1"));
        }
        if element_alignment == 0 || (slots.as_ptr() as usize) % element_alignment != 0 {
            return Err(PikaError::ring_buffer("slot buffer is not aligned"));
        }
        Ok(())
    }

    fn state(&self) -> &SpscState {
        // SAFETY: the view's constructors guarantee the pointer outlives it.
        unsafe { self.state.as_ref() }
    }

    fn slot_ptr(&self, index: u64) -> *mut u8 {
        debug_assert!(index < self.capacity);
        // SAFETY: index is below capacity, so the offset stays inside the
        // slot area the constructor was given.
        unsafe { self.slots.as_ptr().add(index as usize * self.element_size) }
    }

    /// Copy one element in, busy-waiting while the ring is full.
    ///
    /// Producer side only. `tail` is loaded relaxed (we are its only
    /// writer), `head` acquired to observe consumer progress, and the new
    /// `tail` released to publish the payload bytes.
    pub fn push(&self, src: &[u8], timeout: Timeout) -> PikaResult<()> {
        if src.len() != self.element_size {
            return Err(PikaError::ring_buffer(format!(
                "push of {} bytes into a ring with element size {}",
                src.len(),
                self.element_size
            )));
        }
        let st = self.state();
        let timer = Timer::start();
        let mut iteration = 0u32;
        loop {
            let tail = st.tail.load(Ordering::Relaxed);
            let next = (tail + 1) % self.capacity;
            if next != st.head.load(Ordering::Acquire) {
                // SAFETY: the slot at `tail` is invisible to the consumer
                // until the release store below.
                unsafe {
                    std::ptr::copy_nonoverlapping(src.as_ptr(), self.slot_ptr(tail), self.element_size);
                }
                st.tail.store(next, Ordering::Release);
                return Ok(());
            }
            if timeout.expired(&timer) {
                return Err(PikaError::timeout("ring buffer full"));
            }
            spin_backoff(&mut iteration);
        }
    }

    /// Copy one element out, busy-waiting while the ring is empty.
    /// Consumer side only; the ordering mirror of [`push`](Self::push).
    pub fn pop(&self, dst: &mut [u8], timeout: Timeout) -> PikaResult<()> {
        if dst.len() != self.element_size {
            return Err(PikaError::ring_buffer(format!(
                "pop of {} bytes from a ring with element size {}",
                dst.len(),
                self.element_size
            )));
        }
        let st = self.state();
        let timer = Timer::start();
        let mut iteration = 0u32;
        loop {
            let head = st.head.load(Ordering::Relaxed);
            if head != st.tail.load(Ordering::Acquire) {
                // SAFETY: the acquire load of `tail` made the producer's
                // slot write visible.
                unsafe {
                    std::ptr::copy_nonoverlapping(self.slot_ptr(head), dst.as_mut_ptr(), self.element_size);
                }
                st.head.store((head + 1) % self.capacity, Ordering::Release);
                return Ok(());
            }
            if timeout.expired(&timer) {
                return Err(PikaError::timeout("ring buffer empty"));
            }
            spin_backoff(&mut iteration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, Layout};

    const QUEUE_LEN: u64 = 4;
    const ELEMENT_SIZE: usize = 8;

    #[repr(C)]
    struct TestBlock {
        state: SpscState,
        slots: [u8; (QUEUE_LEN as usize + 1) * ELEMENT_SIZE],
    }

    fn leaked_block() -> &'static TestBlock {
        let layout = Layout::new::<TestBlock>();
        // SAFETY: non-zero sized layout; zeroed storage is valid for SpscState.
        unsafe {
            let raw = alloc_zeroed(layout) as *mut TestBlock;
            assert!(!raw.is_null());
            &*raw
        }
    }

    fn init_ring(block: &'static TestBlock) -> SpscRing {
        // SAFETY: block is zeroed, properly laid out, and lives forever.
        unsafe {
            SpscRing::init_in_place(
                NonNull::from(&block.state),
                NonNull::new(block.slots.as_ptr() as *mut u8).unwrap(),
                ELEMENT_SIZE,
                8,
                QUEUE_LEN,
            )
            .expect("init_in_place")
        }
    }

    fn attach_ring(block: &'static TestBlock) -> SpscRing {
        // SAFETY: the state was initialized by init_ring.
        unsafe {
            SpscRing::attach(
                NonNull::from(&block.state),
                NonNull::new(block.slots.as_ptr() as *mut u8).unwrap(),
                ELEMENT_SIZE,
                8,
                QUEUE_LEN,
            )
            .expect("attach")
        }
    }

    #[test]
    fn holds_queue_len_elements_before_full() {
        let ring = init_ring(leaked_block());
        for value in 0..QUEUE_LEN {
            ring.push(&value.to_ne_bytes(), Timeout::from_micros(1_000)).expect("push");
        }
        let err = ring
            .push(&99u64.to_ne_bytes(), Timeout::from_micros(1_000))
            .unwrap_err();
        assert!(err.is_timeout());

        let mut out = [0u8; ELEMENT_SIZE];
        for expected in 0..QUEUE_LEN {
            ring.pop(&mut out, Timeout::from_micros(1_000)).expect("pop");
            assert_eq!(u64::from_ne_bytes(out), expected);
        }
        assert!(ring.pop(&mut out, Timeout::from_micros(1_000)).unwrap_err().is_timeout());
    }

    #[test]
    fn cross_thread_stream_preserves_order() {
        let block = leaked_block();
        let producer_ring = init_ring(block);

        const COUNT: u64 = 10_000;
        let producer = std::thread::spawn(move || {
            for value in 0..COUNT {
                producer_ring
                    .push(&value.to_ne_bytes(), Timeout::Infinite)
                    .expect("push");
            }
        });

        let consumer_ring = attach_ring(block);
        let mut out = [0u8; ELEMENT_SIZE];
        for expected in 0..COUNT {
            consumer_ring.pop(&mut out, Timeout::Infinite).expect("pop");
            assert_eq!(u64::from_ne_bytes(out), expected);
        }
        producer.join().unwrap();
    }

    #[test]
    fn empty_pop_times_out_quickly() {
        let ring = init_ring(leaked_block());
        let timer = Timer::start();
        let err = ring
            .pop(&mut [0u8; ELEMENT_SIZE], Timeout::from_micros(1_000))
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(timer.elapsed_micros() < 100_000, "busy-wait overshot its budget");
    }
}
