//! Backing storage for channels.
//!
//! Both variants expose the same `(base_ptr, len)` contract over an
//! addressable, contiguous byte region acquired by name:
//!
//! - [`InterProcessRegion`]: a named shared-memory object, mapped
//!   read/write into the address space.
//! - [`InterThreadRegion`]: a process-wide registry entry backed by a
//!   heap allocation with process lifetime.

pub mod heap_region;
pub mod shm_region;

pub use heap_region::InterThreadRegion;
pub use shm_region::InterProcessRegion;

use crate::error::{PikaError, PikaResult};

/// Longest accepted region name, leading slash included.
pub(crate) const NAME_MAX: usize = 255;

/// Region names follow the POSIX shared-memory convention: a leading `/`,
/// no further `/`, at most NAME_MAX bytes.
pub(crate) fn validate_region_name(name: &str) -> PikaResult<()> {
    if !name.starts_with('/') {
        return Err(PikaError::shared_buffer(format!(
            "region name '{name}' must begin with '/'"
        )));
    }
    if name.len() == 1 {
        return Err(PikaError::shared_buffer(
            "region name must not be empty after the leading '/'",
        ));
    }
    if name[1..].contains('/') {
        return Err(PikaError::shared_buffer(format!(
            "region name '{name}' must not contain additional '/' characters"
        )));
    }
    if name.len() > NAME_MAX {
        return Err(PikaError::shared_buffer(format!(
            "region name length {} exceeds the maximum of {NAME_MAX} bytes",
            name.len()
        )));
    }
    Ok(())
}

/// The storage a channel endpoint holds, selected once at creation.
#[derive(Debug)]
pub(crate) enum BackingStorage {
    InterProcess(InterProcessRegion),
    InterThread(InterThreadRegion),
}

impl BackingStorage {
    pub(crate) fn base(&self) -> *mut u8 {
        match self {
            BackingStorage::InterProcess(region) => region.as_ptr(),
            BackingStorage::InterThread(region) => region.as_ptr(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            BackingStorage::InterProcess(region) => region.len(),
            BackingStorage::InterThread(region) => region.len(),
        }
    }

    pub(crate) fn is_inter_process(&self) -> bool {
        matches!(self, BackingStorage::InterProcess(_))
    }

    /// Remove the region's name. Only the inter-process variant has an OS
    /// artifact to remove; registry entries live for the process lifetime.
    pub(crate) fn unlink(&self) {
        if let BackingStorage::InterProcess(region) = self {
            region.unlink();
        }
    }
}
