//! Process-shared condition variable with predicate-based waits.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use crate::error::{PikaError, PikaResult};

use super::{timespec_after, MutexGuard};

const UNINITIALIZED: u8 = 0;
const INITIALIZED: u8 = 1;

/// A condition variable that may live inside a shared-memory region.
///
/// Waits take the lock guard plus a predicate and re-check the predicate
/// after every wakeup, so spurious wakeups are tolerated. A pthread-level
/// wait failure is surfaced to the caller as a
/// [`PikaError::SyncPrimitive`] rather than silently returning with the
/// predicate possibly still false.
#[repr(C)]
pub struct SharedCondvar {
    state: AtomicU8,
    raw: UnsafeCell<libc::pthread_cond_t>,
}

// SAFETY: operated only together with a SharedMutex; the init flag is atomic.
unsafe impl Send for SharedCondvar {}
unsafe impl Sync for SharedCondvar {}

impl SharedCondvar {
    /// In-place initialization. Timed waits are measured against
    /// `CLOCK_MONOTONIC`, so wall-clock steps cannot shorten or stretch
    /// them.
    pub fn initialize(&self, cross_process: bool) -> PikaResult<()> {
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        // SAFETY: attr points to writable storage for a condattr.
        let rc = unsafe { libc::pthread_condattr_init(attr.as_mut_ptr()) };
        if rc != 0 {
            return Err(PikaError::sync_primitive(format!(
                "pthread_condattr_init failed with error code {rc}"
            )));
        }
        if cross_process {
            // SAFETY: attr was initialized above.
            let rc = unsafe {
                libc::pthread_condattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED)
            };
            if rc != 0 {
                return Err(PikaError::sync_primitive(format!(
                    "pthread_condattr_setpshared failed with error code {rc}"
                )));
            }
        }
        // SAFETY: attr was initialized above.
        let rc = unsafe { libc::pthread_condattr_setclock(attr.as_mut_ptr(), libc::CLOCK_MONOTONIC) };
        if rc != 0 {
            return Err(PikaError::sync_primitive(format!(
                "pthread_condattr_setclock failed with error code {rc}"
            )));
        }
        // SAFETY: self.raw points to storage for a pthread_cond_t; attr is initialized.
        let rc = unsafe { libc::pthread_cond_init(self.raw.get(), attr.as_ptr()) };
        // SAFETY: attr was initialized above and is no longer needed.
        unsafe { libc::pthread_condattr_destroy(attr.as_mut_ptr()) };
        if rc != 0 {
            return Err(PikaError::sync_primitive(format!(
                "pthread_cond_init failed with error code {rc}"
            )));
        }
        self.state.store(INITIALIZED, Ordering::Release);
        Ok(())
    }

    /// Block until `ready` returns true. The predicate is evaluated with
    /// the guard's mutex held; while it is false the lock is released and
    /// the thread suspends until signalled, then re-acquires and re-checks.
    pub fn wait<F>(&self, guard: &mut MutexGuard<'_>, mut ready: F) -> PikaResult<()>
    where
        F: FnMut() -> bool,
    {
        self.ensure_initialized()?;
        let mutex = guard.mutex();
        while !ready() {
            // SAFETY: both primitives are initialized and the guard proves
            // the mutex is held by this thread.
            let rc = unsafe { libc::pthread_cond_wait(self.raw.get(), mutex.raw_ptr()) };
            if rc != 0 {
                return Err(PikaError::sync_primitive(format!(
                    "pthread_cond_wait failed with error code {rc}"
                )));
            }
        }
        Ok(())
    }

    /// Like [`wait`](Self::wait), but gives up once `timeout` has elapsed
    /// with the predicate still false, returning [`PikaError::Timeout`].
    pub fn wait_timed<F>(
        &self,
        guard: &mut MutexGuard<'_>,
        timeout: Duration,
        mut ready: F,
    ) -> PikaResult<()>
    where
        F: FnMut() -> bool,
    {
        self.ensure_initialized()?;
        let deadline = timespec_after(libc::CLOCK_MONOTONIC, timeout)?;
        let mutex = guard.mutex();
        while !ready() {
            // SAFETY: both primitives are initialized and the guard proves
            // the mutex is held by this thread.
            let rc =
                unsafe { libc::pthread_cond_timedwait(self.raw.get(), mutex.raw_ptr(), &deadline) };
            if rc == libc::ETIMEDOUT {
                // The deadline may expire in the same instant the state
                // becomes ready; the predicate gets the last word.
                if ready() {
                    return Ok(());
                }
                return Err(PikaError::timeout("condition wait timed out"));
            }
            if rc != 0 {
                return Err(PikaError::sync_primitive(format!(
                    "pthread_cond_timedwait failed with error code {rc}"
                )));
            }
        }
        Ok(())
    }

    /// Wake one waiter. Failures cannot be reported to the signalling
    /// path's caller and are logged.
    pub fn signal(&self) {
        if self.state.load(Ordering::Acquire) != INITIALIZED {
            log::warn!("SharedCondvar::signal called on an uninitialized condition variable");
            return;
        }
        // SAFETY: the condition variable is initialized.
        let rc = unsafe { libc::pthread_cond_signal(self.raw.get()) };
        if rc != 0 {
            log::warn!("pthread_cond_signal failed with error code {rc}");
        }
    }

    /// Destroy the underlying pthread condition variable, logging failures.
    pub fn destroy(&self) {
        if self.state.swap(UNINITIALIZED, Ordering::AcqRel) == INITIALIZED {
            // SAFETY: the condvar was initialized and has no waiters at
            // destruction time per the channel teardown contract.
            let rc = unsafe { libc::pthread_cond_destroy(self.raw.get()) };
            if rc != 0 {
                log::warn!("pthread_cond_destroy failed with error code {rc}");
            }
        }
    }

    fn ensure_initialized(&self) -> PikaResult<()> {
        if self.state.load(Ordering::Acquire) != INITIALIZED {
            return Err(PikaError::sync_primitive(
                "SharedCondvar used before initialization",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SharedMutex;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    struct Block {
        mutex: SharedMutex,
        condvar: SharedCondvar,
        flag: AtomicBool,
    }

    fn fresh_block() -> Arc<Block> {
        // SAFETY: pthread types are plain storage until their init runs.
        let block = Arc::new(Block {
            mutex: unsafe { std::mem::zeroed() },
            condvar: unsafe { std::mem::zeroed() },
            flag: AtomicBool::new(false),
        });
        block.mutex.initialize(false).expect("mutex init");
        block.condvar.initialize(false).expect("condvar init");
        block
    }

    #[test]
    fn signal_wakes_predicate_waiter() {
        let block = fresh_block();
        let waiter = {
            let block = block.clone();
            std::thread::spawn(move || {
                let mut guard = block.mutex.lock().expect("lock");
                block
                    .condvar
                    .wait(&mut guard, || block.flag.load(Ordering::Relaxed))
                    .expect("wait");
                assert!(block.flag.load(Ordering::Relaxed));
            })
        };

        std::thread::sleep(Duration::from_millis(5));
        {
            let guard = block.mutex.lock().expect("lock");
            block.flag.store(true, Ordering::Relaxed);
            drop(guard);
        }
        block.condvar.signal();
        waiter.join().unwrap();
    }

    #[test]
    fn timed_wait_expires_when_never_signalled() {
        let block = fresh_block();
        let mut guard = block.mutex.lock().expect("lock");
        let err = block
            .condvar
            .wait_timed(&mut guard, Duration::from_micros(1_000), || {
                block.flag.load(Ordering::Relaxed)
            })
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn wait_returns_immediately_when_ready() {
        let block = fresh_block();
        block.flag.store(true, Ordering::Relaxed);
        let mut guard = block.mutex.lock().expect("lock");
        block
            .condvar
            .wait_timed(&mut guard, Duration::from_micros(1), || {
                block.flag.load(Ordering::Relaxed)
            })
            .expect("already ready");
    }
}
