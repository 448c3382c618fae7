//! Inter-thread backing storage.
//!
//! Endpoints inside one process share a heap allocation through a
//! process-wide registry keyed by region name. Entries are created on
//! first acquire and live for the process lifetime, so a channel stays
//! re-attachable for as long as the process runs.

use std::alloc::{alloc_zeroed, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Mutex, OnceLock};

use crate::error::{PikaError, PikaResult};

use super::validate_region_name;

/// Allocation alignment for registry blocks. Matches the page alignment
/// `mmap` gives the inter-process variant, so both storages satisfy the
/// same header and element alignment contract.
const REGION_ALIGN: usize = 4096;

#[derive(Debug)]
struct RegionBlock {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: a block is a plain byte region; concurrent access to its
// contents is governed by the primitives the channel layer places in it.
unsafe impl Send for RegionBlock {}
unsafe impl Sync for RegionBlock {}

fn registry() -> &'static Mutex<HashMap<String, &'static RegionBlock>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, &'static RegionBlock>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A handle to a registry-backed region. Two handles acquired with the
/// same name in the same process address the same bytes.
#[derive(Debug)]
pub struct InterThreadRegion {
    name: String,
    block: &'static RegionBlock,
}

impl InterThreadRegion {
    /// Look up or create the named region. A fresh region is zero-filled
    /// and sized to `size` bytes; an existing one is returned as-is.
    pub fn acquire(name: &str, size: usize) -> PikaResult<Self> {
        validate_region_name(name)?;
        let mut map = registry().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(block) = map.get(name).copied() {
            return Ok(Self {
                name: name.to_string(),
                block,
            });
        }

        let layout = Layout::from_size_align(size, REGION_ALIGN).map_err(|e| {
            PikaError::shared_buffer(format!("invalid region layout for '{name}': {e}"))
        })?;
        // SAFETY: layout has non-zero size; a channel region always holds
        // at least its header.
        let raw = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(raw).ok_or_else(|| {
            PikaError::shared_buffer(format!(
                "allocation of {size} bytes for region '{name}' failed"
            ))
        })?;
        let block: &'static RegionBlock = Box::leak(Box::new(RegionBlock { base, len: size }));
        map.insert(name.to_string(), block);
        Ok(Self {
            name: name.to_string(),
            block,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.block.base.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.block.len
    }

    pub fn is_empty(&self) -> bool {
        self.block.len == 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(prefix: &str) -> String {
        format!(
            "/pika_heap_{}_{}_{}",
            prefix,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        )
    }

    #[test]
    fn fresh_region_is_zeroed_and_aligned() {
        let name = unique_name("zeroed");
        let region = InterThreadRegion::acquire(&name, 1024).expect("acquire");
        assert_eq!(region.len(), 1024);
        assert_eq!(region.as_ptr() as usize % REGION_ALIGN, 0);
        for i in 0..1024 {
            // SAFETY: i is within the allocation.
            assert_eq!(unsafe { *region.as_ptr().add(i) }, 0);
        }
    }

    #[test]
    fn same_name_shares_the_same_bytes() {
        let name = unique_name("shared");
        let first = InterThreadRegion::acquire(&name, 256).expect("first");
        let second = InterThreadRegion::acquire(&name, 256).expect("second");
        assert_eq!(first.as_ptr(), second.as_ptr());

        // SAFETY: offset 0 is within the allocation; the write is visible
        // through the second handle because both alias the same block.
        unsafe {
            *first.as_ptr() = 0xA5;
            assert_eq!(*second.as_ptr(), 0xA5);
        }
    }

    #[test]
    fn different_names_do_not_alias() {
        let a = InterThreadRegion::acquire(&unique_name("a"), 128).expect("a");
        let b = InterThreadRegion::acquire(&unique_name("b"), 128).expect("b");
        assert_ne!(a.as_ptr(), b.as_ptr());
    }
}
