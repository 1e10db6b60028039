//! Reserved virtual address windows.

use core::fmt;
use std::sync::Arc;

use log::warn;

use crate::addr::DevicePtr;
use crate::provider::{DeviceMemoryProvider, ProviderError};

/// One contiguous reservation of device virtual address space.
///
/// Nothing is backed until a mapping binds a page inside the window. The
/// reservation is returned to the provider on drop, after the owning segment
/// has torn down every mapping inside; a window absorbed by a merge hands
/// its reservation to the survivor instead.
pub struct VirWindow {
    provider: Arc<dyn DeviceMemoryProvider>,
    base: DevicePtr,
    size: u64,
    live_mappings: usize,
    released: bool,
}

impl VirWindow {
    /// Reserves a fresh window of `size` bytes, a positive multiple of the
    /// provider granularity.
    pub fn reserve(
        provider: &Arc<dyn DeviceMemoryProvider>,
        size: u64,
    ) -> Result<VirWindow, ProviderError> {
        debug_assert!(size > 0 && size % provider.granularity() == 0);
        let base = provider.reserve(size)?;
        debug_assert!(!base.is_null());
        Ok(VirWindow {
            provider: Arc::clone(provider),
            base,
            size,
            live_mappings: 0,
            released: false,
        })
    }

    pub fn base(&self) -> DevicePtr {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// First address just past the window.
    pub fn end(&self) -> DevicePtr {
        self.base + self.size
    }

    pub fn contains(&self, ptr: DevicePtr) -> bool {
        self.base <= ptr && ptr < self.end()
    }

    /// Whether any sub-range is currently mapped.
    pub fn is_mapped(&self) -> bool {
        self.live_mappings > 0
    }

    pub(crate) fn mapping_bound(&mut self) {
        self.live_mappings += 1;
    }

    pub(crate) fn mapping_torn(&mut self) {
        debug_assert!(self.live_mappings > 0);
        self.live_mappings -= 1;
    }

    /// Subdivides the reservation: `self` keeps `[base, base + keep)` and the
    /// returned window owns the tail. `tail_mappings` of the live mappings
    /// move over with it. Relies on the provider accepting sub-range frees.
    pub(crate) fn split_off(&mut self, keep: u64, tail_mappings: usize) -> VirWindow {
        debug_assert!(keep > 0 && keep < self.size);
        debug_assert!(tail_mappings <= self.live_mappings);
        let tail = VirWindow {
            provider: Arc::clone(&self.provider),
            base: self.base + keep,
            size: self.size - keep,
            live_mappings: tail_mappings,
            released: false,
        };
        self.size = keep;
        self.live_mappings -= tail_mappings;
        tail
    }

    /// Absorbs `other`, which must start exactly at our end. The combined
    /// reservation is freed in one piece when `self` drops.
    pub(crate) fn absorb(&mut self, mut other: VirWindow) {
        debug_assert_eq!(self.end(), other.base);
        self.size += other.size;
        self.live_mappings += other.live_mappings;
        other.released = true;
    }
}

impl Drop for VirWindow {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.provider.free(self.base, self.size) {
            warn!(
                "failed to free window reservation at {} ({} bytes): {err}",
                self.base, self.size
            );
        }
    }
}

impl fmt::Debug for VirWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirWindow")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("live_mappings", &self.live_mappings)
            .finish()
    }
}
