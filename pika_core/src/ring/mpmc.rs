//! Lock-protected MPMC ring buffer.
//!
//! The shared portion ([`MpmcState`]) is embedded in the channel header
//! inside the backing region; [`MpmcRing`] is a per-endpoint view over it.
//! A coarse mutex serializes every mutation of the ring (indices, count,
//! slot contents), and blocked sides park on the `not_empty` / `not_full`
//! condition variables. Signals are issued after the critical section so a
//! wakee does not immediately collide with the signaller's lock.
//!
//! Slot lifecycle: empty, being written (lock held by a producer), full,
//! being read (lock held by a consumer), empty again.

use std::cell::{Cell, UnsafeCell};
use std::ptr::NonNull;
use std::time::Instant;

use crate::error::{PikaError, PikaResult};
use crate::sync::{MutexGuard, SharedCondvar, SharedMutex};
use crate::utils::Timeout;

/// Shared state of the lock-protected ring. Never constructed by value;
/// it is initialized in place inside a zero-filled region and thereafter
/// only reached through [`MpmcRing`] views.
#[repr(C)]
pub struct MpmcState {
    /// Coarse-grained lock protecting all access to the ring
    mutex: SharedMutex,
    not_empty: SharedCondvar,
    not_full: SharedCondvar,
    write_index: UnsafeCell<u64>,
    read_index: UnsafeCell<u64>,
    count: UnsafeCell<u64>,
}

// SAFETY: the index fields are only touched with the embedded mutex held;
// the primitives themselves are process-shared.
unsafe impl Send for MpmcState {}
unsafe impl Sync for MpmcState {}

/// Which zero-copy slot this endpoint currently holds.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum HeldSlot {
    Write,
    Read,
}

/// Per-endpoint view of a lock-protected ring.
///
/// The view stores no pointers in the shared region: slot addresses are
/// recomputed from this mapping's base on every access, so independently
/// mapped processes agree on the ring while disagreeing on addresses.
#[derive(Debug)]
pub struct MpmcRing {
    state: NonNull<MpmcState>,
    slots: NonNull<u8>,
    element_size: usize,
    queue_len: u64,
    /// Set between a slot acquisition and its release; the mutex stays
    /// locked for that entire window.
    held: Cell<Option<HeldSlot>>,
}

// SAFETY: the view owns no thread-affine resources; the state it points at
// is synchronized by the embedded process-shared primitives. The `held`
// Cell keeps the type !Sync, which is what single-endpoint use requires.
unsafe impl Send for MpmcRing {}

impl MpmcRing {
    /// Initialize the shared state in place and return a view of it.
    ///
    /// # Safety
    ///
    /// `state` must point to zeroed (or otherwise dead) storage for an
    /// `MpmcState`, and `slots` to at least `queue_len * element_size`
    /// bytes, both valid for the life of the returned view and any peer
    /// views. The caller must hold the channel-creation gate so no peer
    /// observes the state mid-initialization.
    pub unsafe fn init_in_place(
        state: NonNull<MpmcState>,
        slots: NonNull<u8>,
        element_size: usize,
        element_alignment: usize,
        queue_len: u64,
        cross_process: bool,
    ) -> PikaResult<Self> {
        Self::validate_geometry(slots, element_alignment, queue_len)?;
        let st = state.as_ref();
        st.mutex.initialize(cross_process)?;
        st.not_empty
            .initialize(cross_process)
            .map_err(|e| PikaError::sync_primitive(format!("{e} (not_empty condition variable)")))?;
        st.not_full
            .initialize(cross_process)
            .map_err(|e| PikaError::sync_primitive(format!("{e} (not_full condition variable)")))?;
        *st.write_index.get() = 0;
        *st.read_index.get() = 0;
        *st.count.get() = 0;
        Ok(Self::view(state, slots, element_size, queue_len))
    }

    /// Build a view over already-initialized shared state.
    ///
    /// # Safety
    ///
    /// `state` must point to an `MpmcState` that completed
    /// [`init_in_place`](Self::init_in_place) (possibly in another
    /// process), `slots` to that ring's slot area in this mapping, and the
    /// geometry arguments must match the initializing ones.
    pub unsafe fn attach(
        state: NonNull<MpmcState>,
        slots: NonNull<u8>,
        element_size: usize,
        element_alignment: usize,
        queue_len: u64,
    ) -> PikaResult<Self> {
        Self::validate_geometry(slots, element_alignment, queue_len)?;
        Ok(Self::view(state, slots, element_size, queue_len))
    }

    fn view(state: NonNull<MpmcState>, slots: NonNull<u8>, element_size: usize, queue_len: u64) -> Self {
        Self {
            state,
            slots,
            element_size,
            queue_len,
            held: Cell::new(None),
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

    fn state(&self) -> &MpmcState {
        // SAFETY: the view's constructors guarantee the pointer outlives it.
        unsafe { self.state.as_ref() }
    }

    /// Address of slot `index` in this mapping.
    fn slot_ptr(&self, index: u64) -> NonNull<u8> {
        debug_assert!(index < self.queue_len);
        // SAFETY: index is below queue_len, so the offset stays inside the
        // slot area the constructor was given.
        unsafe { NonNull::new_unchecked(self.slots.as_ptr().add(index as usize * self.element_size)) }
    }

    /// Copy one element in. Blocks while the ring is full; a spent timeout
    /// returns [`PikaError::Timeout`] with indices, count, and slots
    /// untouched.
    pub fn push(&self, src: &[u8], timeout: Timeout) -> PikaResult<()> {
        if src.len() != self.element_size {
            return Err(PikaError::ring_buffer(format!(
                "push of {} bytes into a ring with element size {}",
                src.len(),
                self.element_size
            )));
        }
        let deadline = timeout.deadline();
        let st = self.state();
        let capacity = self.queue_len;
        let mut guard = Self::lock_phase(&st.mutex, deadline)?;
        Self::wait_phase(&st.not_full, &mut guard, deadline, || {
            // SAFETY: count is only read or written with the mutex held.
            (unsafe { *st.count.get() }) < capacity
        })?;
        // SAFETY: the mutex is held; the slot at write_index is not
        // visible to any consumer until count is bumped below.
        unsafe {
            let write_index = *st.write_index.get();
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.slot_ptr(write_index).as_ptr(),
                self.element_size,
            );
            *st.write_index.get() = (write_index + 1) % capacity;
            *st.count.get() += 1;
        }
        drop(guard);
        st.not_empty.signal();
        Ok(())
    }

    /// Copy one element out. Blocks while the ring is empty; a spent
    /// timeout returns [`PikaError::Timeout`] with state untouched.
    pub fn pop(&self, dst: &mut [u8], timeout: Timeout) -> PikaResult<()> {
        if dst.len() != self.element_size {
            return Err(PikaError::ring_buffer(format!(
                "pop of {} bytes from a ring with element size {}",
                dst.len(),
                self.element_size
            )));
        }
        let deadline = timeout.deadline();
        let st = self.state();
        let capacity = self.queue_len;
        let mut guard = Self::lock_phase(&st.mutex, deadline)?;
        Self::wait_phase(&st.not_empty, &mut guard, deadline, || {
            // SAFETY: count is only read or written with the mutex held.
            (unsafe { *st.count.get() }) != 0
        })?;
        // SAFETY: the mutex is held and count != 0, so the slot at
        // read_index holds a committed element.
        unsafe {
            let read_index = *st.read_index.get();
            std::ptr::copy_nonoverlapping(
                self.slot_ptr(read_index).as_ptr(),
                dst.as_mut_ptr(),
                self.element_size,
            );
            *st.read_index.get() = (read_index + 1) % capacity;
            *st.count.get() -= 1;
        }
        drop(guard);
        st.not_full.signal();
        Ok(())
    }

    /// Zero-copy producer entry: wait for space, then hand back a pointer
    /// to the current write slot with the mutex still held. The caller
    /// writes the element in place and commits with
    /// [`release_write_slot`](Self::release_write_slot).
    pub fn acquire_write_slot(&self, timeout: Timeout) -> PikaResult<NonNull<u8>> {
        self.ensure_no_held_slot()?;
        let deadline = timeout.deadline();
        let st = self.state();
        let capacity = self.queue_len;
        let mut guard = Self::lock_phase(&st.mutex, deadline)?;
        Self::wait_phase(&st.not_full, &mut guard, deadline, || {
            // SAFETY: count is only read or written with the mutex held.
            (unsafe { *st.count.get() }) < capacity
        })?;
        // SAFETY: the mutex is held.
        let slot = self.slot_ptr(unsafe { *st.write_index.get() });
        self.held.set(Some(HeldSlot::Write));
        guard.leak();
        Ok(slot)
    }

    /// Commit a slot obtained from
    /// [`acquire_write_slot`](Self::acquire_write_slot): advance the write
    /// index, bump the count, unlock, and signal `not_empty`. A pointer
    /// other than the held write slot is rejected and the slot stays held.
    pub fn release_write_slot(&self, slot: NonNull<u8>) -> PikaResult<()> {
        if self.held.get() != Some(HeldSlot::Write) {
            return Err(PikaError::ring_buffer(
                "release_write_slot without a held write slot",
            ));
        }
        let st = self.state();
        // SAFETY: the slot acquisition left the mutex held by this endpoint.
        let write_index = unsafe { *st.write_index.get() };
        if slot != self.slot_ptr(write_index) {
            return Err(PikaError::ring_buffer(
                "release_write_slot called with a foreign slot pointer",
            ));
        }
        // SAFETY: mutex held, pointer verified; commit and unlock.
        unsafe {
            *st.write_index.get() = (write_index + 1) % self.queue_len;
            *st.count.get() += 1;
            self.held.set(None);
            st.mutex.unlock_raw()?;
        }
        st.not_empty.signal();
        Ok(())
    }

    /// Zero-copy consumer entry, mirror of
    /// [`acquire_write_slot`](Self::acquire_write_slot). The returned slot
    /// is read-only by contract.
    pub fn acquire_read_slot(&self, timeout: Timeout) -> PikaResult<NonNull<u8>> {
        self.ensure_no_held_slot()?;
        let deadline = timeout.deadline();
        let st = self.state();
        let mut guard = Self::lock_phase(&st.mutex, deadline)?;
        Self::wait_phase(&st.not_empty, &mut guard, deadline, || {
            // SAFETY: count is only read or written with the mutex held.
            (unsafe { *st.count.get() }) != 0
        })?;
        // SAFETY: the mutex is held.
        let slot = self.slot_ptr(unsafe { *st.read_index.get() });
        self.held.set(Some(HeldSlot::Read));
        guard.leak();
        Ok(slot)
    }

    /// Retire a slot obtained from
    /// [`acquire_read_slot`](Self::acquire_read_slot): advance the read
    /// index, drop the count, unlock, and signal `not_full`.
    pub fn release_read_slot(&self, slot: NonNull<u8>) -> PikaResult<()> {
        if self.held.get() != Some(HeldSlot::Read) {
            return Err(PikaError::ring_buffer(
                "release_read_slot without a held read slot",
            ));
        }
        let st = self.state();
        // SAFETY: the slot acquisition left the mutex held by this endpoint.
        let read_index = unsafe { *st.read_index.get() };
        if slot != self.slot_ptr(read_index) {
            return Err(PikaError::ring_buffer(
                "release_read_slot called with a foreign slot pointer",
            ));
        }
        // SAFETY: mutex held, pointer verified; retire and unlock.
        unsafe {
            *st.read_index.get() = (read_index + 1) % self.queue_len;
            *st.count.get() -= 1;
            self.held.set(None);
            st.mutex.unlock_raw()?;
        }
        st.not_full.signal();
        Ok(())
    }

    /// Destroy the embedded primitives. Called once, by the last endpoint
    /// departing an inter-process channel; failures are logged by the
    /// primitives themselves.
    pub fn destroy_primitives(&self) {
        let st = self.state();
        st.not_empty.destroy();
        st.not_full.destroy();
        st.mutex.destroy();
    }

    fn ensure_no_held_slot(&self) -> PikaResult<()> {
        if self.held.get().is_some() {
            return Err(PikaError::ring_buffer(
                "endpoint already holds an unreleased slot",
            ));
        }
        Ok(())
    }

    fn lock_phase<'a>(
        mutex: &'a SharedMutex,
        deadline: Option<Instant>,
    ) -> PikaResult<MutexGuard<'a>> {
        match deadline {
            None => mutex.lock(),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(PikaError::timeout("ring buffer lock acquisition timed out"));
                }
                mutex.lock_timed(deadline - now)
            }
        }
    }

    fn wait_phase<F>(
        condvar: &SharedCondvar,
        guard: &mut MutexGuard<'_>,
        deadline: Option<Instant>,
        ready: F,
    ) -> PikaResult<()>
    where
        F: FnMut() -> bool,
    {
        match deadline {
            None => condvar.wait(guard, ready),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                condvar.wait_timed(guard, remaining, ready)
            }
        }
    }
}
