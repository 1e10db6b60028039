//! An in-memory device memory provider for tests.
//!
//! Models reserved address space, physical pages, and live mappings with
//! plain maps; enforces the [`DeviceMemoryProvider`] contract; and counts
//! driver calls so tests can observe exactly what the allocator did. No
//! bytes move: `copy` only validates its operands.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use log::trace;

use crate::addr::DevicePtr;
use crate::provider::{
    AccessFlags, DeviceId, DeviceMemoryProvider, PageHandle, ProviderError,
};

/// Totals of every provider call made so far.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CallCounts {
    pub reserves: u64,
    pub frees: u64,
    pub creates: u64,
    pub releases: u64,
    pub maps: u64,
    pub unmaps: u64,
    pub set_accesses: u64,
    pub copies: u64,
}

#[derive(Debug)]
struct PageState {
    device: DeviceId,
    size: u64,
    released: bool,
    times_mapped: u64,
}

#[derive(Default)]
struct State {
    /// Disjoint reserved ranges, base -> size.
    reserved: BTreeMap<u64, u64>,
    pages: HashMap<u64, PageState>,
    /// Live mappings, addr -> (size, raw handle).
    mappings: BTreeMap<u64, (u64, u64)>,
    access: HashMap<u64, AccessFlags>,
    next_va: u64,
    next_handle: u64,
    physical_used: u64,
    physical_limit: Option<u64>,
    deny_alias: bool,
    fail_maps: u32,
    fail_unmaps: u32,
    skip_copies: u32,
    fail_copies: u32,
    fail_creates: u32,
    counts: CallCounts,
}

pub struct MockProvider {
    granularity: u64,
    state: Mutex<State>,
}

impl MockProvider {
    /// A mock with the typical 2 MiB granularity.
    pub fn new() -> MockProvider {
        MockProvider::with_granularity(2 * 1024 * 1024)
    }

    pub fn with_granularity(granularity: u64) -> MockProvider {
        assert!(granularity.is_power_of_two());
        MockProvider {
            granularity,
            state: Mutex::new(State {
                // Keep address zero (the null pointer) out of the space.
                next_va: 1 << 32,
                next_handle: 1,
                ..State::default()
            }),
        }
    }

    /// Caps the total bytes of live physical pages; `create_page` beyond the
    /// cap fails with `OutOfMemory`.
    pub fn set_physical_limit(&self, bytes: Option<u64>) {
        self.state.lock().unwrap().physical_limit = bytes;
    }

    /// Makes `map` refuse any handle that has been mapped before, modeling a
    /// device that cannot alias physical pages at a second address.
    pub fn set_deny_alias(&self, deny: bool) {
        self.state.lock().unwrap().deny_alias = deny;
    }

    pub fn fail_next_maps(&self, n: u32) {
        self.state.lock().unwrap().fail_maps = n;
    }

    pub fn fail_next_unmaps(&self, n: u32) {
        self.state.lock().unwrap().fail_unmaps = n;
    }

    pub fn fail_next_copies(&self, n: u32) {
        self.fail_copies_after(0, n);
    }

    /// Lets `skip` copies through, then fails the following `n`.
    pub fn fail_copies_after(&self, skip: u32, n: u32) {
        let mut state = self.state.lock().unwrap();
        state.skip_copies = skip;
        state.fail_copies = n;
    }

    pub fn fail_next_creates(&self, n: u32) {
        self.state.lock().unwrap().fail_creates = n;
    }

    pub fn counts(&self) -> CallCounts {
        self.state.lock().unwrap().counts
    }

    /// Pages created and not yet released.
    pub fn live_pages(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.pages.values().filter(|p| !p.released).count()
    }

    pub fn live_mappings(&self) -> usize {
        self.state.lock().unwrap().mappings.len()
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.state.lock().unwrap().reserved.values().sum()
    }

    /// Panics unless every reservation has been freed, every mapping
    /// unmapped, and every page released.
    pub fn assert_quiescent(&self) {
        let state = self.state.lock().unwrap();
        assert!(state.mappings.is_empty(), "live mappings remain: {:?}", state.mappings);
        assert!(state.reserved.is_empty(), "reserved ranges remain: {:?}", state.reserved);
        let live: Vec<_> = state.pages.iter().filter(|(_, p)| !p.released).collect();
        assert!(live.is_empty(), "unreleased pages remain: {live:?}");
    }

    fn check_size(&self, size: u64) -> Result<(), ProviderError> {
        if size == 0 || size % self.granularity != 0 {
            return Err(ProviderError::InvalidRange);
        }
        Ok(())
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        MockProvider::new()
    }
}

fn overlaps(mappings: &BTreeMap<u64, (u64, u64)>, addr: u64, size: u64) -> bool {
    mappings
        .range(..addr + size)
        .next_back()
        .is_some_and(|(&maddr, &(msize, _))| maddr + msize > addr)
}

fn containing_mapping(mappings: &BTreeMap<u64, (u64, u64)>, addr: u64, size: u64) -> bool {
    mappings
        .range(..=addr)
        .next_back()
        .is_some_and(|(&maddr, &(msize, _))| addr + size <= maddr + msize)
}

impl DeviceMemoryProvider for MockProvider {
    fn granularity(&self) -> u64 {
        self.granularity
    }

    fn reserve(&self, size: u64) -> Result<DevicePtr, ProviderError> {
        self.check_size(size)?;
        let mut state = self.state.lock().unwrap();
        state.counts.reserves += 1;
        let base = state.next_va;
        state.next_va += size;
        state.reserved.insert(base, size);
        trace!("mock: reserved [{base:#x}, {:#x})", base + size);
        Ok(DevicePtr::from_raw(base))
    }

    fn free(&self, addr: DevicePtr, size: u64) -> Result<(), ProviderError> {
        self.check_size(size)?;
        let mut state = self.state.lock().unwrap();
        state.counts.frees += 1;
        let (a, end) = (addr.as_raw(), addr.as_raw() + size);

        if overlaps(&state.mappings, a, size) {
            return Err(ProviderError::InvalidRange);
        }

        // The span may cross several reserved ranges (windows merge their
        // reservations); it must be fully covered with no gaps.
        let affected: Vec<(u64, u64)> = state
            .reserved
            .range(..end)
            .filter(|(&rbase, &rsize)| rbase + rsize > a)
            .map(|(&rbase, &rsize)| (rbase, rsize))
            .collect();
        let mut cursor = a;
        for &(rbase, rsize) in &affected {
            if rbase > cursor {
                return Err(ProviderError::InvalidRange);
            }
            cursor = cursor.max(rbase + rsize);
        }
        if affected.is_empty() || affected[0].0 > a || cursor < end {
            return Err(ProviderError::InvalidRange);
        }

        for &(rbase, _) in &affected {
            state.reserved.remove(&rbase);
        }
        let (first_base, _) = affected[0];
        let (last_base, last_size) = affected[affected.len() - 1];
        if first_base < a {
            state.reserved.insert(first_base, a - first_base);
        }
        if last_base + last_size > end {
            state.reserved.insert(end, last_base + last_size - end);
        }
        trace!("mock: freed [{a:#x}, {end:#x})");
        Ok(())
    }

    fn create_page(&self, device: DeviceId, size: u64) -> Result<PageHandle, ProviderError> {
        self.check_size(size)?;
        let mut state = self.state.lock().unwrap();
        state.counts.creates += 1;
        if state.fail_creates > 0 {
            state.fail_creates -= 1;
            return Err(ProviderError::OutOfMemory);
        }
        if let Some(limit) = state.physical_limit {
            if state.physical_used + size > limit {
                return Err(ProviderError::OutOfMemory);
            }
        }
        let handle = state.next_handle;
        state.next_handle += 1;
        state.pages.insert(
            handle,
            PageState {
                device,
                size,
                released: false,
                times_mapped: 0,
            },
        );
        state.physical_used += size;
        Ok(PageHandle(handle))
    }

    fn release_page(&self, handle: PageHandle) {
        let mut state = self.state.lock().unwrap();
        state.counts.releases += 1;
        let still_mapped = state
            .mappings
            .values()
            .any(|&(_, mapped_handle)| mapped_handle == handle.0);
        assert!(!still_mapped, "page {handle:?} released while mapped");
        if let Some(page) = state.pages.get_mut(&handle.0) {
            if !page.released {
                page.released = true;
                let size = page.size;
                state.physical_used -= size;
            }
        }
    }

    fn map(&self, addr: DevicePtr, size: u64, handle: PageHandle) -> Result<(), ProviderError> {
        self.check_size(size)?;
        let mut state = self.state.lock().unwrap();
        state.counts.maps += 1;
        if state.fail_maps > 0 {
            state.fail_maps -= 1;
            return Err(ProviderError::Failure(-1));
        }

        let a = addr.as_raw();
        let reserved = state
            .reserved
            .range(..=a)
            .next_back()
            .is_some_and(|(&rbase, &rsize)| a + size <= rbase + rsize);
        if !addr.is_aligned_to(self.granularity) || !reserved {
            return Err(ProviderError::InvalidRange);
        }
        if overlaps(&state.mappings, a, size) {
            return Err(ProviderError::InvalidRange);
        }

        let deny_alias = state.deny_alias;
        let page = state
            .pages
            .get_mut(&handle.0)
            .filter(|p| !p.released)
            .ok_or(ProviderError::InvalidHandle)?;
        if page.size != size {
            return Err(ProviderError::InvalidRange);
        }
        if deny_alias && page.times_mapped > 0 {
            return Err(ProviderError::CannotAlias);
        }
        page.times_mapped += 1;
        state.mappings.insert(a, (size, handle.0));
        trace!("mock: mapped handle {} at [{a:#x}, {:#x})", handle.0, a + size);
        Ok(())
    }

    fn unmap(&self, addr: DevicePtr, size: u64) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.counts.unmaps += 1;
        if state.fail_unmaps > 0 {
            state.fail_unmaps -= 1;
            return Err(ProviderError::Failure(-1));
        }
        let a = addr.as_raw();
        match state.mappings.get(&a) {
            Some(&(msize, _)) if msize == size => {
                state.mappings.remove(&a);
                state.access.remove(&a);
                Ok(())
            }
            _ => Err(ProviderError::InvalidRange),
        }
    }

    fn set_access(
        &self,
        addr: DevicePtr,
        size: u64,
        device: DeviceId,
        access: AccessFlags,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.counts.set_accesses += 1;
        let a = addr.as_raw();
        let handle = match state.mappings.get(&a) {
            Some(&(msize, handle)) if msize == size => handle,
            _ => return Err(ProviderError::InvalidRange),
        };
        // Access is only ever granted on the device that owns the page.
        let owner = state.pages.get(&handle).map(|p| p.device);
        if owner != Some(device) {
            return Err(ProviderError::InvalidRange);
        }
        state.access.insert(a, access);
        Ok(())
    }

    fn copy(&self, dst: DevicePtr, src: DevicePtr, size: u64) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.counts.copies += 1;
        if state.skip_copies > 0 {
            state.skip_copies -= 1;
        } else if state.fail_copies > 0 {
            state.fail_copies -= 1;
            return Err(ProviderError::Failure(-1));
        }
        let (d, s) = (dst.as_raw(), src.as_raw());
        if d < s + size && s < d + size {
            return Err(ProviderError::InvalidRange);
        }
        if !containing_mapping(&state.mappings, d, size)
            || !containing_mapping(&state.mappings, s, size)
        {
            return Err(ProviderError::InvalidRange);
        }
        Ok(())
    }
}
