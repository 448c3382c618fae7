//! System-wide named semaphore used as the channel-creation lock.

use std::ffi::CString;
use std::ptr::NonNull;

use crate::error::{PikaError, PikaResult};

/// A POSIX named semaphore. pika uses one per channel, with an initial
/// value of 1, as a binary gate granting exclusive access to the channel
/// header during rendezvous.
#[derive(Debug)]
pub struct NamedSemaphore {
    sem: NonNull<libc::sem_t>,
    name: String,
}

// SAFETY: sem_t handles may be used from any thread of the opening process.
unsafe impl Send for NamedSemaphore {}

impl NamedSemaphore {
    /// Open (or create with `initial_value`) the named semaphore. The name
    /// must begin with `/`.
    pub fn new(name: &str, initial_value: u32) -> PikaResult<Self> {
        if !name.starts_with('/') {
            return Err(PikaError::sync_primitive(format!(
                "semaphore name '{name}' must begin with '/'"
            )));
        }
        let c_name = CString::new(name).map_err(|_| {
            PikaError::sync_primitive(format!("semaphore name '{name}' contains a NUL byte"))
        })?;
        // SAFETY: c_name is a valid NUL-terminated string; mode and value
        // are passed per the variadic sem_open contract.
        let raw = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT,
                0o600 as libc::c_uint,
                initial_value as libc::c_uint,
            )
        };
        if raw == libc::SEM_FAILED {
            return Err(PikaError::sync_primitive(format!(
                "sem_open('{name}') failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self {
            // SAFETY: raw was checked against SEM_FAILED and is never null on success.
            sem: unsafe { NonNull::new_unchecked(raw) },
            name: name.to_string(),
        })
    }

    /// Decrement, blocking while the count is zero. Failures other than
    /// signal interruption cannot be reported here and are logged.
    pub fn wait(&self) {
        loop {
            // SAFETY: self.sem is a live handle from sem_open.
            if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                return;
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            log::error!("sem_wait on '{}' failed: {err}", self.name);
            return;
        }
    }

    /// Increment, releasing one waiter. Failures are logged.
    pub fn post(&self) {
        // SAFETY: self.sem is a live handle from sem_open.
        if unsafe { libc::sem_post(self.sem.as_ptr()) } != 0 {
            log::error!(
                "sem_post on '{}' failed: {}",
                self.name,
                std::io::Error::last_os_error()
            );
        }
    }

    /// Wait, returning a guard that posts when dropped. Every exit path of
    /// a rendezvous releases the gate this way.
    pub fn acquire(&self) -> SemaphoreGuard<'_> {
        self.wait();
        SemaphoreGuard { sem: self }
    }

    /// Remove the semaphore's name from the system. Existing handles stay
    /// usable until closed. Called by the last departing endpoint.
    pub fn unlink(name: &str) {
        let Ok(c_name) = CString::new(name) else {
            return;
        };
        // SAFETY: c_name is a valid NUL-terminated string.
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                log::warn!("sem_unlink('{name}') failed: {err}");
            }
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: self.sem is a live handle from sem_open.
        if unsafe { libc::sem_close(self.sem.as_ptr()) } != 0 {
            log::warn!(
                "sem_close on '{}' failed: {}",
                self.name,
                std::io::Error::last_os_error()
            );
        }
    }
}

/// Posts its semaphore when dropped.
pub struct SemaphoreGuard<'a> {
    sem: &'a NamedSemaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.sem.post();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(prefix: &str) -> String {
        format!(
            "/pika_sem_{}_{}_{}",
            prefix,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        )
    }

    #[test]
    fn name_must_lead_with_slash() {
        let err = NamedSemaphore::new("no-slash", 1).unwrap_err();
        assert!(matches!(err, PikaError::SyncPrimitive(_)));
    }

    #[test]
    fn binary_gate_round_trip() {
        let name = unique_name("gate");
        let sem = NamedSemaphore::new(&name, 1).expect("sem_open");
        {
            let _guard = sem.acquire();
            // Count is zero while held; a second handle can still open it.
            let second = NamedSemaphore::new(&name, 1).expect("reopen");
            drop(second);
        }
        // The guard posted; acquiring again must not block.
        let _guard = sem.acquire();
        drop(_guard);
        NamedSemaphore::unlink(&name);
    }
}
