//! # pika
//!
//! Typed, bounded producer/consumer channels over shared memory. One
//! surface for two transports: endpoints in distinct OS processes
//! (inter-process) or in threads of one process (inter-thread).
//!
//! This crate is a thin facade over [`pika_core`]; see that crate for the
//! building blocks (sync primitives, backing storage, ring buffers, the
//! rendezvous protocol).
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use pika::prelude::*;
//!
//! let params = ChannelParameters {
//!     channel_name: "/sensor_frames".to_string(),
//!     queue_size: 16,
//!     channel_type: ChannelType::InterProcess,
//!     spsc_mode: false,
//! };
//!
//! let producer = Channel::create_producer::<[f32; 4]>(&params)?;
//! producer.connect()?;
//! producer.send([0.0, 0.1, 0.2, 0.3])?;
//! # Ok::<(), PikaError>(())
//! ```

pub use pika_core::{self, *};

/// Everything needed to open a channel and move messages.
pub mod prelude {
    pub use pika_core::channel::{Channel, ChannelParameters, ChannelType, Consumer, Producer};
    pub use pika_core::error::{PikaError, PikaResult};
    pub use pika_core::{Timeout, Timer};
}
