//! Inter-process backing storage over named shared memory.
//!
//! A channel's region is a file on `/dev/shm` (tmpfs, RAM-backed), sized
//! by truncation on first creation and mapped read/write. Opening
//! `/dev/shm/<name>` is the same object `shm_open("/<name>")` produces, so
//! region names keep the leading-slash POSIX convention.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{PikaError, PikaResult};

use super::validate_region_name;

const SHM_DIR: &str = "/dev/shm";

/// A named shared-memory object mapped into this process.
///
/// The region persists as long as any process holds a mapping; the name is
/// removed via [`unlink`](Self::unlink) by whichever endpoint departs
/// last, not by `Drop`.
#[derive(Debug)]
pub struct InterProcessRegion {
    mmap: MmapMut,
    _file: File,
    path: PathBuf,
    name: String,
}

impl InterProcessRegion {
    /// Open or create the named region with user read/write permissions.
    ///
    /// A fresh object is sized to `size` bytes (the filesystem zero-fills
    /// it). An existing object is mapped at its current size, whatever
    /// that is; layout validation downstream reports a parameter mismatch
    /// far more usefully than a raw size comparison here could.
    pub fn acquire(name: &str, size: usize) -> PikaResult<Self> {
        validate_region_name(name)?;
        let path = PathBuf::from(SHM_DIR).join(&name[1..]);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&path)
            .map_err(|e| {
                PikaError::shared_buffer(format!(
                    "failed to open shared memory object '{name}': {e}"
                ))
            })?;
        let existing_len = file
            .metadata()
            .map_err(|e| {
                PikaError::shared_buffer(format!(
                    "failed to stat shared memory object '{name}': {e}"
                ))
            })?
            .len();
        let len = if existing_len == 0 {
            file.set_len(size as u64).map_err(|e| {
                PikaError::shared_buffer(format!(
                    "failed to size shared memory object '{name}' to {size} bytes: {e}"
                ))
            })?;
            size
        } else {
            existing_len as usize
        };
        // SAFETY: the file is open read/write and at least `len` bytes long.
        let mmap = unsafe { MmapOptions::new().len(len).map_mut(&file) }.map_err(|e| {
            PikaError::shared_buffer(format!("failed to map shared memory object '{name}': {e}"))
        })?;
        Ok(Self {
            mmap,
            _file: file,
            path,
            name: name.to_string(),
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.len() == 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the object's name. Mappings held by any process stay valid
    /// until unmapped; a subsequent `acquire` with this name creates a
    /// fresh object.
    pub fn unlink(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to unlink shared memory object '{}': {e}", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(prefix: &str) -> String {
        format!(
            "/pika_shm_{}_{}_{}",
            prefix,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        )
    }

    #[test]
    fn create_write_reopen_read() {
        let name = unique_name("rw");
        let size = 4096;
        let region = InterProcessRegion::acquire(&name, size).expect("acquire");
        assert_eq!(region.len(), size);

        let ptr = region.as_ptr();
        // Fresh objects are zero-filled.
        for i in 0..size {
            // SAFETY: i is within the mapped length.
            assert_eq!(unsafe { *ptr.add(i) }, 0, "byte {i} not zeroed");
        }
        // SAFETY: offsets are within the mapped length.
        unsafe {
            for i in 0..size {
                *ptr.add(i) = (i % 251) as u8;
            }
        }

        let reopened = InterProcessRegion::acquire(&name, size).expect("reopen");
        let rptr = reopened.as_ptr();
        for i in 0..size {
            // SAFETY: i is within the mapped length.
            assert_eq!(unsafe { *rptr.add(i) }, (i % 251) as u8, "byte {i} mismatch");
        }

        region.unlink();
    }

    #[test]
    fn existing_region_keeps_its_size() {
        let name = unique_name("size");
        let region = InterProcessRegion::acquire(&name, 8192).expect("acquire");
        // A second endpoint asking for a different size still maps the
        // object as it exists on disk.
        let second = InterProcessRegion::acquire(&name, 1024).expect("reopen");
        assert_eq!(second.len(), 8192);
        region.unlink();
    }

    #[test]
    fn unlink_detaches_the_name() {
        let name = unique_name("unlink");
        let region = InterProcessRegion::acquire(&name, 1024).expect("acquire");
        region.unlink();
        let fresh = InterProcessRegion::acquire(&name, 2048).expect("fresh acquire");
        assert_eq!(fresh.len(), 2048);
        fresh.unlink();
    }
}
