//! Bounded ring buffers over caller-provided storage.
//!
//! Two variants with one byte-oriented contract: the lock-protected
//! [`MpmcRing`] (any number of producers and consumers, blocking waits)
//! and the lock-free [`SpscRing`] (exactly one of each, busy-waiting).
//! A channel picks its variant once at creation; [`RingRef`] is the tagged
//! selection endpoints dispatch through on every operation.

pub mod mpmc;
pub mod spsc;

pub use mpmc::{MpmcRing, MpmcState};
pub use spsc::{SpscRing, SpscState};

use std::ptr::NonNull;

use crate::error::{PikaError, PikaResult};
use crate::utils::Timeout;

fn zero_copy_unsupported() -> PikaError {
    PikaError::ring_buffer("zero-copy slot access is not supported on the lock-free ring")
}

/// The ring variant an endpoint operates, fixed at channel creation.
#[derive(Debug)]
pub(crate) enum RingRef {
    Mpmc(MpmcRing),
    Spsc(SpscRing),
}

impl RingRef {
    pub(crate) fn push(&self, src: &[u8], timeout: Timeout) -> PikaResult<()> {
        match self {
            RingRef::Mpmc(ring) => ring.push(src, timeout),
            RingRef::Spsc(ring) => ring.push(src, timeout),
        }
    }

    pub(crate) fn pop(&self, dst: &mut [u8], timeout: Timeout) -> PikaResult<()> {
        match self {
            RingRef::Mpmc(ring) => ring.pop(dst, timeout),
            RingRef::Spsc(ring) => ring.pop(dst, timeout),
        }
    }

    pub(crate) fn acquire_write_slot(&self, timeout: Timeout) -> PikaResult<NonNull<u8>> {
        match self {
            RingRef::Mpmc(ring) => ring.acquire_write_slot(timeout),
            RingRef::Spsc(_) => Err(zero_copy_unsupported()),
        }
    }

    pub(crate) fn release_write_slot(&self, slot: NonNull<u8>) -> PikaResult<()> {
        match self {
            RingRef::Mpmc(ring) => ring.release_write_slot(slot),
            RingRef::Spsc(_) => Err(zero_copy_unsupported()),
        }
    }

    pub(crate) fn acquire_read_slot(&self, timeout: Timeout) -> PikaResult<NonNull<u8>> {
        match self {
            RingRef::Mpmc(ring) => ring.acquire_read_slot(timeout),
            RingRef::Spsc(_) => Err(zero_copy_unsupported()),
        }
    }

    pub(crate) fn release_read_slot(&self, slot: NonNull<u8>) -> PikaResult<()> {
        match self {
            RingRef::Mpmc(ring) => ring.release_read_slot(slot),
            RingRef::Spsc(_) => Err(zero_copy_unsupported()),
        }
    }
}
