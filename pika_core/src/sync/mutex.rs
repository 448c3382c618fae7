//! Process-shared mutex and its RAII lock guard.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use crate::error::{PikaError, PikaResult};

use super::timespec_after;

const UNINITIALIZED: u8 = 0;
const INITIALIZED: u8 = 1;

/// A mutex that may live inside a shared-memory region.
///
/// The wrapped `pthread_mutex_t` is initialized in place via
/// [`initialize`](Self::initialize); with `cross_process` set, the mutex
/// stays valid through any mapping of the underlying memory, in any
/// process. Locking before a successful initialize is an error, not UB.
/// Recursive locking is not supported.
#[repr(C)]
#[derive(Debug)]
pub struct SharedMutex {
    state: AtomicU8,
    raw: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: the pthread mutex is the synchronization; the init flag is atomic.
unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    /// In-place initialization. The memory behind `self` must be zeroed or
    /// otherwise not hold a live initialized mutex.
    pub fn initialize(&self, cross_process: bool) -> PikaResult<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        // SAFETY: attr points to writable storage for a mutexattr.
        let rc = unsafe { libc::pthread_mutexattr_init(attr.as_mut_ptr()) };
        if rc != 0 {
            return Err(PikaError::sync_primitive(format!(
                "pthread_mutexattr_init failed with error code {rc}"
            )));
        }
        if cross_process {
            // SAFETY: attr was initialized above.
            let rc = unsafe {
                libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED)
            };
            if rc != 0 {
                return Err(PikaError::sync_primitive(format!(
                    "pthread_mutexattr_setpshared failed with error code {rc}"
                )));
            }
        }
        // SAFETY: self.raw points to storage for a pthread_mutex_t; attr is initialized.
        let rc = unsafe { libc::pthread_mutex_init(self.raw.get(), attr.as_ptr()) };
        // SAFETY: attr was initialized above and is no longer needed.
        unsafe { libc::pthread_mutexattr_destroy(attr.as_mut_ptr()) };
        if rc != 0 {
            return Err(PikaError::sync_primitive(format!(
                "pthread_mutex_init failed with error code {rc}"
            )));
        }
        self.state.store(INITIALIZED, Ordering::Release);
        Ok(())
    }

    /// Block until the mutex is acquired.
    pub fn lock(&self) -> PikaResult<MutexGuard<'_>> {
        self.ensure_initialized("lock")?;
        // SAFETY: the mutex is initialized (checked above).
        let rc = unsafe { libc::pthread_mutex_lock(self.raw.get()) };
        if rc != 0 {
            return Err(PikaError::sync_primitive(format!(
                "pthread_mutex_lock failed with error code {rc}"
            )));
        }
        Ok(MutexGuard { mutex: self })
    }

    /// Like [`lock`](Self::lock), but gives up after `timeout` with a
    /// [`PikaError::Timeout`].
    pub fn lock_timed(&self, timeout: Duration) -> PikaResult<MutexGuard<'_>> {
        self.ensure_initialized("lock_timed")?;
        // pthread_mutex_timedlock measures against CLOCK_REALTIME.
        let deadline = timespec_after(libc::CLOCK_REALTIME, timeout)?;
        // SAFETY: the mutex is initialized and deadline is a valid timespec.
        let rc = unsafe { libc::pthread_mutex_timedlock(self.raw.get(), &deadline) };
        if rc == libc::ETIMEDOUT {
            return Err(PikaError::timeout("mutex acquisition timed out"));
        }
        if rc != 0 {
            return Err(PikaError::sync_primitive(format!(
                "pthread_mutex_timedlock failed with error code {rc}"
            )));
        }
        Ok(MutexGuard { mutex: self })
    }

    /// Unlock without a guard. The caller must hold the lock.
    pub(crate) unsafe fn unlock_raw(&self) -> PikaResult<()> {
        self.ensure_initialized("unlock")?;
        let rc = libc::pthread_mutex_unlock(self.raw.get());
        if rc != 0 {
            return Err(PikaError::sync_primitive(format!(
                "pthread_mutex_unlock failed with error code {rc}"
            )));
        }
        Ok(())
    }

    /// Destroy the underlying pthread mutex. Failures are logged; after
    /// this call the mutex is back in the uninitialized state.
    pub fn destroy(&self) {
        if self.state.swap(UNINITIALIZED, Ordering::AcqRel) == INITIALIZED {
            // SAFETY: the mutex was initialized and nobody may hold it at
            // destruction time per the pthread contract.
            let rc = unsafe { libc::pthread_mutex_destroy(self.raw.get()) };
            if rc != 0 {
                log::warn!("pthread_mutex_destroy failed with error code {rc}");
            }
        }
    }

    pub(crate) fn raw_ptr(&self) -> *mut libc::pthread_mutex_t {
        self.raw.get()
    }

    fn ensure_initialized(&self, op: &str) -> PikaResult<()> {
        if self.state.load(Ordering::Acquire) != INITIALIZED {
            return Err(PikaError::sync_primitive(format!(
                "SharedMutex::{op} called on an uninitialized mutex"
            )));
        }
        Ok(())
    }
}

/// Move-only proof that its mutex is held; dropping it unlocks.
#[derive(Debug)]
pub struct MutexGuard<'a> {
    mutex: &'a SharedMutex,
}

impl<'a> MutexGuard<'a> {
    pub(crate) fn mutex(&self) -> &'a SharedMutex {
        self.mutex
    }

    /// Keep the mutex locked past the guard's lifetime. The caller takes
    /// over responsibility for the eventual `unlock_raw`.
    pub(crate) fn leak(self) {
        std::mem::forget(self);
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard's existence proves this thread holds the lock.
        if let Err(err) = unsafe { self.mutex.unlock_raw() } {
            log::error!("mutex unlock failed in guard drop: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    fn fresh_mutex() -> SharedMutex {
        SharedMutex {
            state: AtomicU8::new(UNINITIALIZED),
            // SAFETY: pthread_mutex_t is plain data; any bit pattern is
            // storage until pthread_mutex_init runs.
            raw: UnsafeCell::new(unsafe { std::mem::zeroed() }),
        }
    }

    #[test]
    fn lock_before_initialize_is_an_error() {
        let mutex = fresh_mutex();
        let err = mutex.lock().unwrap_err();
        assert!(matches!(err, PikaError::SyncPrimitive(_)));
    }

    #[test]
    fn serializes_concurrent_increments() {
        struct Shared {
            mutex: SharedMutex,
            // Plain counter mutated under the mutex; atomic only so the
            // test itself stays data-race free for the final read.
            value: AtomicU64,
        }

        let shared = Arc::new(Shared {
            mutex: fresh_mutex(),
            value: AtomicU64::new(0),
        });
        shared.mutex.initialize(false).expect("initialize");

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        let guard = shared.mutex.lock().expect("lock");
                        let v = shared.value.load(Ordering::Relaxed);
                        shared.value.store(v + 1, Ordering::Relaxed);
                        drop(guard);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(shared.value.load(Ordering::Relaxed), 4_000);
    }

    #[test]
    fn timed_lock_reports_timeout_kind() {
        let shared = Arc::new(fresh_mutex());
        shared.initialize(false).expect("initialize");

        let held = shared.lock().expect("lock");
        let contender = {
            let shared = shared.clone();
            std::thread::spawn(move || shared.lock_timed(Duration::from_micros(1_000)).map(drop))
        };
        let err = contender.join().unwrap().unwrap_err();
        assert!(err.is_timeout());
        drop(held);

        // Uncontended timed lock succeeds.
        let guard = shared.lock_timed(Duration::from_micros(1_000)).expect("lock_timed");
        drop(guard);
    }
}
