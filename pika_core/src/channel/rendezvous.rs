//! Channel rendezvous: how independently started endpoints agree on one
//! shared buffer.
//!
//! Creation runs under a named binary semaphore (`<channel_name>` plus a
//! transport suffix), the single authority over header construction. The
//! first endpoint in builds the header and ring in place; every later one
//! validates its parameters against the stored configuration. Teardown
//! runs under the same gate, and whichever endpoint sees both sides reach
//! zero removes the channel's OS artifacts.

use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use crate::channel::header::ChannelHeader;
use crate::channel::{ChannelParameters, ChannelType};
use crate::error::{PikaError, PikaResult};
use crate::memory::{BackingStorage, InterProcessRegion, InterThreadRegion};
use crate::ring::{MpmcRing, RingRef, SpscRing};
use crate::sync::NamedSemaphore;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum EndpointSide {
    Producer,
    Consumer,
}

impl EndpointSide {
    fn as_str(self) -> &'static str {
        match self {
            EndpointSide::Producer => "producer",
            EndpointSide::Consumer => "consumer",
        }
    }
}

/// Everything one endpoint holds: the backing storage (the single owner of
/// the bytes), a header view into it, and the ring view selected at
/// creation. Dropping the core counts the endpoint out and, for the last
/// one, tears the channel down.
#[derive(Debug)]
pub(crate) struct ChannelCore {
    header: NonNull<ChannelHeader>,
    ring: RingRef,
    storage: BackingStorage,
    side: EndpointSide,
    channel_name: String,
    sem_name: String,
}

// SAFETY: the core owns its storage handle; the header it points into is
// process-shared state reached through atomics and gated sections.
unsafe impl Send for ChannelCore {}

pub(crate) fn open_endpoint(
    params: &ChannelParameters,
    element_size: u64,
    element_alignment: u64,
    side: EndpointSide,
) -> PikaResult<ChannelCore> {
    if params.queue_size == 0 {
        return Err(PikaError::channel("queue_size must be at least 1"));
    }
    if element_size == 0 {
        return Err(PikaError::channel("zero-sized payload types are not supported"));
    }

    let suffix = match params.channel_type {
        ChannelType::InterProcess => "_inter_process",
        ChannelType::InterThread => "_inter_thread",
    };
    let sem_name = format!("{}{}", params.channel_name, suffix);
    let semaphore = NamedSemaphore::new(&sem_name, 1)?;
    // Exclusive access to create or re-open the channel header; released
    // on every exit path below.
    let _gate = semaphore.acquire();

    let required =
        ChannelHeader::required_region_size(params.queue_size, element_size, element_alignment, params.spsc_mode)
            as usize;
    let storage = match params.channel_type {
        ChannelType::InterProcess => {
            BackingStorage::InterProcess(InterProcessRegion::acquire(&params.channel_name, required)?)
        }
        ChannelType::InterThread => {
            BackingStorage::InterThread(InterThreadRegion::acquire(&params.channel_name, required)?)
        }
    };

    let base = storage.base();
    assert!(!base.is_null(), "backing storage produced a nil base pointer");
    if (base as usize) % mem::align_of::<ChannelHeader>() != 0 {
        return Err(PikaError::ring_buffer(
            "backing region is not aligned for the channel header",
        ));
    }
    if (base as usize) % element_alignment as usize != 0 {
        return Err(PikaError::ring_buffer(
            "backing region is not aligned for the element type",
        ));
    }
    if storage.len() < mem::size_of::<ChannelHeader>() {
        return Err(PikaError::shared_buffer(format!(
            "backing region for '{}' is too small to hold a channel header ({} bytes)",
            params.channel_name,
            storage.len()
        )));
    }

    let header = NonNull::new(base.cast::<ChannelHeader>()).expect("non-null base checked above");
    // SAFETY: base is aligned and large enough for the header (both
    // checked above); concurrent construction is excluded by the gate.
    let h = unsafe { header.as_ref() };
    let slots_offset = ChannelHeader::slots_offset(element_alignment) as usize;

    let ring = if !h.is_registered() {
        if storage.len() < required {
            return Err(PikaError::shared_buffer(format!(
                "backing region for '{}' is smaller than required ({} < {} bytes)",
                params.channel_name,
                storage.len(),
                required
            )));
        }
        // SAFETY: slots_offset < required <= region length (checked above).
        let slots = unsafe { NonNull::new_unchecked(base.add(slots_offset)) };
        // SAFETY: gated construction window; the region is zero-filled.
        unsafe {
            h.set_config(params.queue_size, element_size, element_alignment);
        }
        h.set_spsc_mode(params.spsc_mode);
        let ring = if params.spsc_mode {
            // SAFETY: spsc state + slot area are valid for the region's
            // lifetime, and the gate is held.
            RingRef::Spsc(unsafe {
                SpscRing::init_in_place(
                    NonNull::from(h.spsc_state()),
                    slots,
                    element_size as usize,
                    element_alignment as usize,
                    params.queue_size,
                )?
            })
        } else {
            // SAFETY: as above, for the mpmc variant.
            RingRef::Mpmc(unsafe {
                MpmcRing::init_in_place(
                    NonNull::from(h.mpmc_state()),
                    slots,
                    element_size as usize,
                    element_alignment as usize,
                    params.queue_size,
                    storage.is_inter_process(),
                )?
            })
        };
        h.mark_registered();
        log::debug!(
            "registered channel '{}' (queue_size={}, element_size={}, spsc_mode={})",
            params.channel_name,
            params.queue_size,
            element_size,
            params.spsc_mode
        );
        ring
    } else {
        validate_existing(h, params, element_size, element_alignment)?;
        // SAFETY: the parameters match the registering endpoint's, so the
        // region was sized to cover slots_offset plus the slot area.
        let slots = unsafe { NonNull::new_unchecked(base.add(slots_offset)) };
        let ring = if params.spsc_mode {
            // SAFETY: registered with spsc_mode true (validated above).
            RingRef::Spsc(unsafe {
                SpscRing::attach(
                    NonNull::from(h.spsc_state()),
                    slots,
                    element_size as usize,
                    element_alignment as usize,
                    params.queue_size,
                )?
            })
        } else {
            // SAFETY: registered with spsc_mode false (validated above).
            RingRef::Mpmc(unsafe {
                MpmcRing::attach(
                    NonNull::from(h.mpmc_state()),
                    slots,
                    element_size as usize,
                    element_alignment as usize,
                    params.queue_size,
                )?
            })
        };
        log::debug!("attached {} to channel '{}'", side.as_str(), params.channel_name);
        ring
    };

    // The lock-free ring is sound only with a single endpoint per side;
    // refuse the forbidden configuration here, under the gate.
    if params.spsc_mode {
        let own_count = match side {
            EndpointSide::Producer => h.producer_count.load(Ordering::Acquire),
            EndpointSide::Consumer => h.consumer_count.load(Ordering::Acquire),
        };
        if own_count >= 1 {
            return Err(PikaError::channel(format!(
                "channel '{}' is in spsc mode and already has a live {}",
                params.channel_name,
                side.as_str()
            )));
        }
    }
    match side {
        EndpointSide::Producer => h.producer_count.fetch_add(1, Ordering::AcqRel),
        EndpointSide::Consumer => h.consumer_count.fetch_add(1, Ordering::AcqRel),
    };

    Ok(ChannelCore {
        header,
        ring,
        storage,
        side,
        channel_name: params.channel_name.clone(),
        sem_name,
    })
}

fn validate_existing(
    h: &ChannelHeader,
    params: &ChannelParameters,
    element_size: u64,
    element_alignment: u64,
) -> PikaResult<()> {
    if h.queue_size() != params.queue_size {
        return Err(PikaError::ring_buffer(format!(
            "existing ring buffer queue length: {}; requested ring buffer queue length: {}",
            h.queue_size(),
            params.queue_size
        )));
    }
    if h.element_size() != element_size {
        return Err(PikaError::ring_buffer(format!(
            "existing ring buffer element size (in bytes): {}; requested element size (in bytes): {}",
            h.element_size(),
            element_size
        )));
    }
    if h.element_alignment() != element_alignment {
        return Err(PikaError::ring_buffer(format!(
            "existing ring buffer element alignment: {}; requested element alignment: {}",
            h.element_alignment(),
            element_alignment
        )));
    }
    if h.spsc_mode() != params.spsc_mode {
        return Err(PikaError::ring_buffer(format!(
            "existing channel spsc_mode: {}; requested spsc_mode: {}",
            h.spsc_mode(),
            params.spsc_mode
        )));
    }
    Ok(())
}

impl ChannelCore {
    fn header(&self) -> &ChannelHeader {
        // SAFETY: the storage field keeps the mapping alive for as long as
        // this core exists.
        unsafe { self.header.as_ref() }
    }

    pub(crate) fn ring(&self) -> &RingRef {
        &self.ring
    }

    /// Spin (yielding) until the opposite side shows up. Cancellation is
    /// cooperative: callers that need a bound poll `is_connected` above
    /// this instead.
    pub(crate) fn connect(&self) -> PikaResult<()> {
        while !self.is_connected() {
            std::thread::yield_now();
        }
        Ok(())
    }

    pub(crate) fn is_connected(&self) -> bool {
        let h = self.header();
        let opposite = match self.side {
            EndpointSide::Producer => &h.consumer_count,
            EndpointSide::Consumer => &h.producer_count,
        };
        opposite.load(Ordering::Acquire) >= 1
    }
}

impl Drop for ChannelCore {
    fn drop(&mut self) {
        // Re-enter the creation gate so the last-holder decision cannot
        // race a concurrent open of the same channel.
        let semaphore = match NamedSemaphore::new(&self.sem_name, 1) {
            Ok(sem) => sem,
            Err(err) => {
                log::error!(
                    "teardown gate for channel '{}' unavailable, leaking its name: {err}",
                    self.channel_name
                );
                let h = self.header();
                match self.side {
                    EndpointSide::Producer => h.producer_count.fetch_sub(1, Ordering::AcqRel),
                    EndpointSide::Consumer => h.consumer_count.fetch_sub(1, Ordering::AcqRel),
                };
                return;
            }
        };
        let gate = semaphore.acquire();

        let h = self.header();
        let own_remaining = match self.side {
            EndpointSide::Producer => h.producer_count.fetch_sub(1, Ordering::AcqRel) - 1,
            EndpointSide::Consumer => h.consumer_count.fetch_sub(1, Ordering::AcqRel) - 1,
        };
        let opposite_remaining = match self.side {
            EndpointSide::Producer => h.consumer_count.load(Ordering::Acquire),
            EndpointSide::Consumer => h.producer_count.load(Ordering::Acquire),
        };

        if own_remaining == 0 && opposite_remaining == 0 {
            if self.storage.is_inter_process() {
                // Last endpoint on this machine: destroy the embedded
                // primitives, then detach the names. Mappings elsewhere
                // (there are none) would stay valid until unmapped.
                if let RingRef::Mpmc(ring) = &self.ring {
                    ring.destroy_primitives();
                }
                self.storage.unlink();
                log::debug!("unlinked backing artifacts of channel '{}'", self.channel_name);
            }
            // The registry entry of an inter-thread channel lives on for
            // the process lifetime; only the OS semaphore name is removed.
            NamedSemaphore::unlink(&self.sem_name);
        }
        drop(gate);
    }
}
