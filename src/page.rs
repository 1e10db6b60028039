//! Physical page objects.

use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::provider::{DeviceId, DeviceMemoryProvider, PageHandle, ProviderError, StreamId};

/// Weak back-reference from a page to external allocator bookkeeping.
///
/// Purely informational. An upstream caching allocator can tag the pages
/// backing its blocks and read the tags back for diagnostics; nothing in
/// this crate depends on the contents.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockRef {
    /// Opaque id of the client block, if the client registered one.
    pub block: Option<u64>,
    /// Offset of the hosting mapping inside its window at the time the
    /// reference was recorded.
    pub offset: u64,
}

impl BlockRef {
    /// Most back-references retained per page; older entries are evicted.
    pub const CAP: usize = 64;
}

/// One fixed-size physical allocation and its metadata.
///
/// Pages are shared as `Arc<PhyPage>`: the live mapping holds one strong
/// reference, diagnostics may transiently hold another. The provider handle
/// is released exactly once, explicitly when the last owning mapping is torn
/// down or the segment is destroyed; `Drop` is the idempotent backstop.
pub struct PhyPage {
    provider: Arc<dyn DeviceMemoryProvider>,
    device: DeviceId,
    size: u64,
    handle: PageHandle,
    free: AtomicBool,
    mapped: AtomicBool,
    owner_stream: Option<StreamId>,
    back_refs: Mutex<Vec<BlockRef>>,
    released: AtomicBool,
}

impl PhyPage {
    /// Allocates a physical page of `size` bytes, a positive multiple of the
    /// provider granularity.
    pub fn create(
        provider: &Arc<dyn DeviceMemoryProvider>,
        device: DeviceId,
        size: u64,
        owner_stream: Option<StreamId>,
    ) -> Result<Arc<PhyPage>, ProviderError> {
        debug_assert!(size > 0 && size % provider.granularity() == 0);
        let handle = provider.create_page(device, size)?;
        Ok(Arc::new(PhyPage {
            provider: Arc::clone(provider),
            device,
            size,
            handle,
            free: AtomicBool::new(true),
            mapped: AtomicBool::new(false),
            owner_stream,
            back_refs: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
        }))
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn handle(&self) -> PageHandle {
        self.handle
    }

    pub fn owner_stream(&self) -> Option<StreamId> {
        self.owner_stream
    }

    pub fn is_free(&self) -> bool {
        self.free.load(Ordering::Acquire)
    }

    pub(crate) fn set_free(&self, free: bool) {
        self.free.store(free, Ordering::Release);
    }

    pub(crate) fn provider(&self) -> &Arc<dyn DeviceMemoryProvider> {
        &self.provider
    }

    /// Claims the page's single mapping slot. Returns `false` if a live
    /// mapping already hosts the page.
    pub(crate) fn claim_mapping(&self) -> bool {
        !self.mapped.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn yield_mapping(&self) {
        self.mapped.store(false, Ordering::Release);
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Acquire)
    }

    pub(crate) fn push_back_ref(&self, block_ref: BlockRef) {
        let mut refs = self.back_refs.lock().unwrap();
        if refs.len() == BlockRef::CAP {
            refs.remove(0);
        }
        refs.push(block_ref);
    }

    /// Snapshot of the recorded back-references, oldest first.
    pub fn back_refs(&self) -> Vec<BlockRef> {
        self.back_refs.lock().unwrap().clone()
    }

    /// Releases the provider handle. Idempotent; tolerates being called
    /// again after the owning segment already released the page.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.provider.release_page(self.handle);
        }
    }

    /// Forgets the handle without releasing it. Used when an unmap failure
    /// leaves the handle possibly still bound on the device; leaking the
    /// page is preferable to releasing storage that may still be mapped.
    pub(crate) fn leak(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            warn!(
                "leaking physical page {:?} ({} bytes) on device {:?}",
                self.handle, self.size, self.device
            );
        }
    }
}

impl Drop for PhyPage {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for PhyPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhyPage")
            .field("device", &self.device)
            .field("size", &self.size)
            .field("handle", &self.handle)
            .field("free", &self.is_free())
            .field("mapped", &self.is_mapped())
            .field("owner_stream", &self.owner_stream)
            .finish()
    }
}
