//! Typed channel endpoints.
//!
//! [`Channel::create_producer`] and [`Channel::create_consumer`] run the
//! rendezvous protocol and hand back typed endpoints. The typed layer is a
//! thin coercion over the byte-oriented ring contract: payloads must be
//! [`bytemuck::Pod`] (trivially copyable, any bit pattern valid, size and
//! alignment known at compile time), and no ordering or retry logic is
//! added on top of the ring's.

mod header;
mod rendezvous;

use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;

use bytemuck::Pod;

use crate::error::PikaResult;
use crate::utils::Timeout;

use rendezvous::{open_endpoint, ChannelCore, EndpointSide};

/// Where the two endpoints of a channel live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    /// Endpoints in distinct OS processes, backed by named shared memory
    InterProcess,
    /// Endpoints in threads of one process, backed by a process-wide
    /// registry entry
    InterThread,
}

/// Identity and shape of a channel. Two endpoints meet by using equal
/// parameters; any mismatch is rejected at creation.
#[derive(Debug, Clone)]
pub struct ChannelParameters {
    /// Leading-slash channel name, at most NAME_MAX bytes
    pub channel_name: String,
    /// Ring capacity in elements; at least 1
    pub queue_size: u64,
    pub channel_type: ChannelType,
    /// Use the lock-free single-producer single-consumer ring instead of
    /// the lock-protected MPMC ring
    pub spsc_mode: bool,
}

/// Factory for channel endpoints.
pub struct Channel;

impl Channel {
    /// Create a producer endpoint for `T`-typed messages.
    pub fn create_producer<T: Pod>(params: &ChannelParameters) -> PikaResult<Producer<T>> {
        let core = open_endpoint(
            params,
            mem::size_of::<T>() as u64,
            mem::align_of::<T>() as u64,
            EndpointSide::Producer,
        )?;
        Ok(Producer {
            core,
            _payload: PhantomData,
        })
    }

    /// Create a consumer endpoint for `T`-typed messages.
    pub fn create_consumer<T: Pod>(params: &ChannelParameters) -> PikaResult<Consumer<T>> {
        let core = open_endpoint(
            params,
            mem::size_of::<T>() as u64,
            mem::align_of::<T>() as u64,
            EndpointSide::Consumer,
        )?;
        Ok(Consumer {
            core,
            _payload: PhantomData,
        })
    }
}

/// The sending end of a channel. Non-copyable, movable; dropping it counts
/// the producer out of the channel.
#[derive(Debug)]
pub struct Producer<T: Pod> {
    core: ChannelCore,
    _payload: PhantomData<fn(T)>,
}

impl<T: Pod> Producer<T> {
    /// Enqueue `value`, blocking while the ring is full.
    pub fn send(&self, value: T) -> PikaResult<()> {
        self.send_timeout(value, Timeout::Infinite)
    }

    /// Enqueue `value`, giving up with [`crate::PikaError::Timeout`] once
    /// the budget is spent. A timed-out send leaves the queue untouched.
    pub fn send_timeout(&self, value: T, timeout: Timeout) -> PikaResult<()> {
        self.core.ring().push(bytemuck::bytes_of(&value), timeout)
    }

    /// Zero-copy send: returns the current write slot for in-place
    /// construction. The ring's lock is held until the matching
    /// [`release_send_slot`](Self::release_send_slot); nothing else can
    /// run against this channel in between, so keep the window short.
    /// Unsupported in spsc mode.
    pub fn get_send_slot(&self, timeout: Timeout) -> PikaResult<NonNull<T>> {
        self.core.ring().acquire_write_slot(timeout).map(NonNull::cast)
    }

    /// Commit a slot obtained from [`get_send_slot`](Self::get_send_slot).
    /// Any other pointer is rejected without disturbing the held slot.
    pub fn release_send_slot(&self, slot: NonNull<T>) -> PikaResult<()> {
        self.core.ring().release_write_slot(slot.cast())
    }

    /// Block (yielding) until a consumer exists.
    pub fn connect(&self) -> PikaResult<()> {
        self.core.connect()
    }

    /// True while at least one consumer endpoint is live.
    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }
}

/// The receiving end of a channel. Non-copyable, movable; dropping it
/// counts the consumer out of the channel.
#[derive(Debug)]
pub struct Consumer<T: Pod> {
    core: ChannelCore,
    _payload: PhantomData<fn() -> T>,
}

impl<T: Pod> Consumer<T> {
    /// Dequeue into `out`, blocking while the ring is empty.
    pub fn receive(&self, out: &mut T) -> PikaResult<()> {
        self.receive_timeout(out, Timeout::Infinite)
    }

    /// Dequeue into `out`, giving up with [`crate::PikaError::Timeout`]
    /// once the budget is spent. A timed-out receive leaves the queue and
    /// `out` untouched.
    pub fn receive_timeout(&self, out: &mut T, timeout: Timeout) -> PikaResult<()> {
        // Stage into a local so a timeout cannot leave `out` half-written.
        let mut staged = T::zeroed();
        self.core.ring().pop(bytemuck::bytes_of_mut(&mut staged), timeout)?;
        *out = staged;
        Ok(())
    }

    /// Value-returning receive.
    pub fn recv_timeout(&self, timeout: Timeout) -> PikaResult<T> {
        let mut value = T::zeroed();
        self.receive_timeout(&mut value, timeout)?;
        Ok(value)
    }

    /// Zero-copy receive: returns the current read slot. The element is
    /// read-only and stays in place until the matching
    /// [`release_receive_slot`](Self::release_receive_slot); the ring's
    /// lock is held in between. Unsupported in spsc mode.
    pub fn get_receive_slot(&self, timeout: Timeout) -> PikaResult<NonNull<T>> {
        self.core.ring().acquire_read_slot(timeout).map(NonNull::cast)
    }

    /// Retire a slot obtained from
    /// [`get_receive_slot`](Self::get_receive_slot).
    pub fn release_receive_slot(&self, slot: NonNull<T>) -> PikaResult<()> {
        self.core.ring().release_read_slot(slot.cast())
    }

    /// Block (yielding) until a producer exists.
    pub fn connect(&self) -> PikaResult<()> {
        self.core.connect()
    }

    /// True while at least one producer endpoint is live.
    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }
}
