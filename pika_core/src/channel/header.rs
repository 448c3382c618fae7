//! The channel header at offset 0 of every backing region.
//!
//! The header is what two independently started endpoints agree on: an
//! initialization flag published last, live endpoint counts, the channel's
//! fixed parameters for re-attach validation, and the embedded ring state.
//! The ring state is a tagged union discriminated by `spsc_mode`; code
//! addresses never enter the shared region, so any process can map it.
//!
//! Slots follow the header at the first offset that is a multiple of the
//! element alignment and not below `size_of::<ChannelHeader>()`.

use std::cell::UnsafeCell;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::ring::{MpmcState, SpscState};

/// Storage for whichever ring variant the channel was created with.
/// Discriminated by [`ChannelHeader::spsc_mode`], which is immutable after
/// registration.
#[repr(C)]
pub(crate) union RingState {
    mpmc: ManuallyDrop<MpmcState>,
    spsc: ManuallyDrop<SpscState>,
}

#[repr(C)]
pub(crate) struct ChannelHeader {
    /// Set (with release ordering) once header construction has completed.
    /// Attaching endpoints load it with acquire before trusting any other
    /// field.
    registered: AtomicBool,
    /// True if the lock-free ring is in use. Written once, before
    /// `registered`.
    spsc_mode: AtomicBool,
    _reserved: [u8; 6],
    pub(crate) producer_count: AtomicU64,
    pub(crate) consumer_count: AtomicU64,
    // Fixed channel parameters, written once under the rendezvous gate
    // before `registered` and read-only afterwards.
    queue_size: UnsafeCell<u64>,
    element_size: UnsafeCell<u64>,
    element_alignment: UnsafeCell<u64>,
    ring: RingState,
}

// SAFETY: non-atomic fields are written only during the gated construction
// window and read-only once `registered` is observed.
unsafe impl Send for ChannelHeader {}
unsafe impl Sync for ChannelHeader {}

// Both backing variants hand out page-aligned bases.
const _: () = assert!(std::mem::align_of::<ChannelHeader>() <= 4096);

impl ChannelHeader {
    /// First slot offset: the smallest multiple of `element_alignment`
    /// that is not below the header size.
    pub(crate) fn slots_offset(element_alignment: u64) -> u64 {
        let header_size = std::mem::size_of::<ChannelHeader>() as u64;
        header_size.div_ceil(element_alignment) * element_alignment
    }

    /// Full backing-region size for a channel with these parameters. The
    /// lock-free ring carries one extra physical slot.
    pub(crate) fn required_region_size(
        queue_size: u64,
        element_size: u64,
        element_alignment: u64,
        spsc_mode: bool,
    ) -> u64 {
        let slot_count = if spsc_mode { queue_size + 1 } else { queue_size };
        Self::slots_offset(element_alignment) + slot_count * element_size
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Publish the header. Everything else must be in place first.
    pub(crate) fn mark_registered(&self) {
        self.registered.store(true, Ordering::Release);
    }

    pub(crate) fn spsc_mode(&self) -> bool {
        self.spsc_mode.load(Ordering::Relaxed)
    }

    pub(crate) fn set_spsc_mode(&self, spsc_mode: bool) {
        self.spsc_mode.store(spsc_mode, Ordering::Relaxed);
    }

    /// Record the channel's fixed parameters.
    ///
    /// # Safety
    ///
    /// Only during the gated construction window, before
    /// [`mark_registered`](Self::mark_registered).
    pub(crate) unsafe fn set_config(&self, queue_size: u64, element_size: u64, element_alignment: u64) {
        *self.queue_size.get() = queue_size;
        *self.element_size.get() = element_size;
        *self.element_alignment.get() = element_alignment;
    }

    pub(crate) fn queue_size(&self) -> u64 {
        // SAFETY: read-only after the construction window.
        unsafe { *self.queue_size.get() }
    }

    pub(crate) fn element_size(&self) -> u64 {
        // SAFETY: read-only after the construction window.
        unsafe { *self.element_size.get() }
    }

    pub(crate) fn element_alignment(&self) -> u64 {
        // SAFETY: read-only after the construction window.
        unsafe { *self.element_alignment.get() }
    }

    /// The MPMC variant of the embedded ring state.
    ///
    /// # Safety
    ///
    /// The channel must have been registered with `spsc_mode == false`, or
    /// be inside its gated construction window about to initialize this
    /// variant.
    pub(crate) unsafe fn mpmc_state(&self) -> &MpmcState {
        &self.ring.mpmc
    }

    /// The SPSC variant of the embedded ring state; mirror contract of
    /// [`mpmc_state`](Self::mpmc_state).
    ///
    /// # Safety
    ///
    /// The channel must have been registered with `spsc_mode == true`, or
    /// be inside its gated construction window about to initialize this
    /// variant.
    pub(crate) unsafe fn spsc_state(&self) -> &SpscState {
        &self.ring.spsc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_offset_is_aligned_and_clears_the_header() {
        let header_size = std::mem::size_of::<ChannelHeader>() as u64;
        for alignment in [1u64, 2, 4, 8, 16, 64, 128, 4096] {
            let offset = ChannelHeader::slots_offset(alignment);
            assert_eq!(offset % alignment, 0, "alignment {alignment}");
            assert!(offset >= header_size, "alignment {alignment}");
            assert!(offset < header_size + alignment, "alignment {alignment} overshoots");
        }
    }

    #[test]
    fn spsc_region_carries_one_extra_slot() {
        let mpmc = ChannelHeader::required_region_size(8, 16, 16, false);
        let spsc = ChannelHeader::required_region_size(8, 16, 16, true);
        assert_eq!(spsc - mpmc, 16);
    }
}
