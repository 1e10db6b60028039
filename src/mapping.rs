//! Bindings of physical pages into virtual windows.

use core::fmt;
use std::sync::Arc;

use log::{trace, warn};

use crate::addr::DevicePtr;
use crate::page::{BlockRef, PhyPage};
use crate::provider::{AccessFlags, ProviderError};
use crate::window::VirWindow;

/// A live binding of one physical page at an offset inside a window.
///
/// At most one live mapping hosts any given page: binding claims the page's
/// mapping slot and unbinding yields it back. The mapping holds a strong
/// reference to its page; the page only refers back through the
/// informational [`BlockRef`] list, never through ownership.
pub struct Mapping {
    addr: DevicePtr,
    offset: u64,
    size: u64,
    page: Arc<PhyPage>,
    torn: bool,
}

impl Mapping {
    /// Maps `page` at `window.base() + offset` and grants read/write access
    /// on the page's device.
    ///
    /// On failure nothing stays mapped and the page's mapping slot is free
    /// again; the caller decides whether to keep or release the page.
    pub fn bind(
        window: &mut VirWindow,
        offset: u64,
        page: Arc<PhyPage>,
        block: Option<u64>,
    ) -> Result<Mapping, ProviderError> {
        let size = page.size();
        debug_assert!(offset + size <= window.size());
        assert!(
            page.claim_mapping(),
            "page {:?} is already hosted by a live mapping",
            page.handle()
        );

        let addr = window.base() + offset;
        let provider = Arc::clone(page.provider());
        if let Err(err) = provider.map(addr, size, page.handle()) {
            page.yield_mapping();
            return Err(err);
        }
        if let Err(err) = provider.set_access(addr, size, page.device(), AccessFlags::RW) {
            // Roll the map back so the caller sees no partial effect.
            if let Err(unmap_err) = provider.unmap(addr, size) {
                warn!("rollback unmap at {addr} failed: {unmap_err}");
            }
            page.yield_mapping();
            return Err(err);
        }

        page.set_free(false);
        page.push_back_ref(BlockRef { block, offset });
        window.mapping_bound();
        trace!("mapped {:?} ({size} bytes) at {addr}", page.handle());
        Ok(Mapping {
            addr,
            offset,
            size,
            page,
            torn: false,
        })
    }

    pub fn addr(&self) -> DevicePtr {
        self.addr
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// First offset just past the mapping.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn page(&self) -> &Arc<PhyPage> {
        &self.page
    }

    /// Takes over bookkeeping for a page the caller already mapped at
    /// `window.base() + offset`. The zero-copy relocation path binds the
    /// destination range itself before retiring the source, then adopts the
    /// result.
    ///
    /// # Panics
    ///
    /// Panics if another live mapping still hosts the page.
    pub(crate) fn adopt(window: &mut VirWindow, offset: u64, page: Arc<PhyPage>) -> Mapping {
        let size = page.size();
        debug_assert!(offset + size <= window.size());
        assert!(
            page.claim_mapping(),
            "page {:?} is already hosted by a live mapping",
            page.handle()
        );
        page.set_free(false);
        window.mapping_bound();
        Mapping {
            addr: window.base() + offset,
            offset,
            size,
            page,
            torn: false,
        }
    }

    /// Re-keys the mapping when the books around it change base (split,
    /// merge). The device-side binding and its address are untouched.
    pub(crate) fn with_offset(mut self, offset: u64) -> Mapping {
        self.offset = offset;
        self
    }

    fn teardown(&mut self) -> Result<(), ProviderError> {
        if self.torn {
            return Ok(());
        }
        self.torn = true;
        let result = self.page.provider().unmap(self.addr, self.size);
        self.page.yield_mapping();
        self.page.set_free(true);
        trace!("unmapped {:?} ({} bytes) at {}", self.page.handle(), self.size, self.addr);
        result
    }

    /// Unmaps the binding and hands the page back for the caller to release,
    /// leak, or rebind. The provider error, if any, is surfaced after the
    /// bookkeeping has settled.
    pub fn unbind(mut self, window: &mut VirWindow) -> (Arc<PhyPage>, Result<(), ProviderError>) {
        let result = self.teardown();
        window.mapping_torn();
        (Arc::clone(&self.page), result)
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if !self.torn {
            if let Err(err) = self.teardown() {
                warn!("unmap at {} failed while dropping mapping: {err}", self.addr);
            }
        }
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("addr", &self.addr)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("page", &self.page.handle())
            .finish()
    }
}
