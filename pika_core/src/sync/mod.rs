//! Synchronization primitives safe to place inside shared memory.
//!
//! [`SharedMutex`] and [`SharedCondvar`] wrap their pthread counterparts
//! with the `PTHREAD_PROCESS_SHARED` attribute, so a single instance in a
//! mapped region can be operated by threads of different processes.
//! [`NamedSemaphore`] is a system-wide named semaphore used as the
//! channel-creation lock. All three expose explicit initialization that
//! returns a result, so they can be constructed in place inside a
//! zero-filled region.

mod condvar;
mod mutex;
mod semaphore;

pub use condvar::SharedCondvar;
pub use mutex::{MutexGuard, SharedMutex};
pub use semaphore::{NamedSemaphore, SemaphoreGuard};

use std::time::Duration;

use crate::error::{PikaError, PikaResult};

/// Absolute `timespec` at `duration` past now on the given clock.
pub(crate) fn timespec_after(clock: libc::clockid_t, duration: Duration) -> PikaResult<libc::timespec> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid, writable timespec and `clock` is a valid clock id.
    let rc = unsafe { libc::clock_gettime(clock, &mut now) };
    if rc != 0 {
        return Err(PikaError::sync_primitive(format!(
            "clock_gettime failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    let nanos = now.tv_nsec as i64 + duration.subsec_nanos() as i64;
    let carry = nanos / 1_000_000_000;
    let secs = (now.tv_sec as i64)
        .saturating_add(duration.as_secs().min(i64::MAX as u64) as i64)
        .saturating_add(carry);
    Ok(libc::timespec {
        tv_sec: secs as libc::time_t,
        tv_nsec: (nanos % 1_000_000_000) as _,
    })
}
