//! # pika
//!
//! Typed, bounded producer/consumer channels carrying fixed-size POD
//! messages between endpoints in distinct OS processes or in threads of a
//! single process. The same API and queueing semantics apply to both
//! transports; only the byte store underneath differs.
//!
//! The building blocks, bottom up:
//!
//! - **Sync**: a mutex, condition variable, and named semaphore that are
//!   safe to place inside shared memory and operate across processes
//! - **Memory**: the backing byte regions (named shared memory, or a
//!   process-wide heap registry)
//! - **Ring**: the bounded ring buffer, lock-protected MPMC or lock-free
//!   SPSC
//! - **Channel**: the rendezvous protocol and the typed endpoint surface
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use pika_core::{Channel, ChannelParameters, ChannelType};
//!
//! let params = ChannelParameters {
//!     channel_name: "/telemetry".to_string(),
//!     queue_size: 8,
//!     channel_type: ChannelType::InterThread,
//!     spsc_mode: false,
//! };
//! let producer = Channel::create_producer::<u64>(&params)?;
//! let consumer = Channel::create_consumer::<u64>(&params)?;
//!
//! producer.connect()?;
//! producer.send(42)?;
//!
//! let mut value = 0u64;
//! consumer.receive(&mut value)?;
//! assert_eq!(value, 42);
//! # Ok::<(), pika_core::PikaError>(())
//! ```
//!
//! All blocking operations take a [`Timeout`]; expiry returns
//! [`PikaError::Timeout`] and leaves every queue invariant intact.

pub mod channel;
pub mod error;
pub mod memory;
pub mod ring;
pub mod sync;
pub(crate) mod utils;

pub use channel::{Channel, ChannelParameters, ChannelType, Consumer, Producer};
pub use error::{PikaError, PikaResult};
pub use utils::{Timeout, Timer};

// Re-export bytemuck so downstream crates derive Pod/Zeroable from the
// same version the channel bounds are checked against.
pub use bytemuck;
