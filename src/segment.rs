//! Segments: one virtual window tiled by used and free subranges.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use itertools::Itertools;
use log::{debug, error, info, warn};

use crate::addr::{align_up_checked, DevicePtr};
use crate::error::Error;
use crate::mapping::Mapping;
use crate::monitor::SegmentStats;
use crate::page::{BlockRef, PhyPage};
use crate::provider::{AccessFlags, DeviceId, DeviceMemoryProvider, ProviderError, StreamId};
use crate::window::VirWindow;

/// One pointer move committed by a compaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Relocation {
    pub old: DevicePtr,
    pub new: DevicePtr,
    pub size: u64,
}

/// How compaction relocates pages.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CompactionPolicy {
    /// Rebind the existing physical page; copy only when the provider
    /// refuses the rebind.
    #[default]
    ZeroCopyPreferred,
    /// Always allocate a replacement page and copy.
    CopyAlways,
    /// Never compact.
    Never,
}

type MoveResult = Result<Mapping, (Option<Mapping>, Error)>;

/// One virtual window plus the ordered books of used and free subranges.
///
/// All offsets and sizes are multiples of the granularity, and at any
/// operation boundary `used` and `free` together tile `[0, window.size())`
/// with no adjacent free entries. Field order matters for teardown: the
/// mappings (which unmap and release their pages on drop) go down before the
/// window frees its reservation.
pub struct Segment {
    used: BTreeMap<u64, Mapping>,
    free: BTreeMap<u64, u64>,
    window: VirWindow,
    provider: Arc<dyn DeviceMemoryProvider>,
    device: DeviceId,
    granularity: u64,
    policy: CompactionPolicy,
    fused: bool,
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("used", &self.used)
            .field("free", &self.free)
            .field("window", &self.window)
            .field("device", &self.device)
            .field("granularity", &self.granularity)
            .field("policy", &self.policy)
            .field("fused", &self.fused)
            .finish()
    }
}

impl Segment {
    /// Reserves a fresh window of `size` bytes, initially all free.
    pub fn new(
        provider: Arc<dyn DeviceMemoryProvider>,
        device: DeviceId,
        size: u64,
        granularity: u64,
        policy: CompactionPolicy,
    ) -> Result<Segment, Error> {
        debug_assert!(granularity.is_power_of_two());
        debug_assert!(size > 0 && size % granularity == 0);
        let window = VirWindow::reserve(&provider, size).map_err(|_| Error::OutOfVirtual)?;
        debug!("new segment at {} ({size} bytes) on {device:?}", window.base());
        let mut free = BTreeMap::new();
        free.insert(0, size);
        Ok(Segment {
            used: BTreeMap::new(),
            free,
            window,
            provider,
            device,
            granularity,
            policy,
            fused: false,
        })
    }

    pub fn base(&self) -> DevicePtr {
        self.window.base()
    }

    pub fn size(&self) -> u64 {
        self.window.size()
    }

    /// First address just past the window.
    pub fn end(&self) -> DevicePtr {
        self.window.end()
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Whether this segment was produced by a merge.
    pub fn is_fused(&self) -> bool {
        self.fused
    }

    pub fn contains(&self, ptr: DevicePtr) -> bool {
        self.window.contains(ptr)
    }

    /// Allocates `n` bytes (rounded up to the granularity) without
    /// attempting compaction.
    pub fn try_allocate(&mut self, n: u64, stream: Option<StreamId>) -> Result<DevicePtr, Error> {
        let size = self.round_request(n)?;
        match self.find_fit(size) {
            Some((offset, fsize)) => self.place(offset, fsize, size, stream),
            None => Err(Error::OutOfVirtual),
        }
    }

    /// Allocates `n` bytes, compacting the segment once if no free subrange
    /// is large enough. Pointer moves committed by that compaction are
    /// appended to `relocated` for the caller to publish.
    pub fn allocate(
        &mut self,
        n: u64,
        stream: Option<StreamId>,
        relocated: &mut Vec<Relocation>,
    ) -> Result<DevicePtr, Error> {
        let size = self.round_request(n)?;
        if let Some((offset, fsize)) = self.find_fit(size) {
            return self.place(offset, fsize, size, stream);
        }
        match self.compact(relocated) {
            Ok(()) => {}
            // Moves committed before the abort may still have made room;
            // fall through to one more fit check.
            Err(Error::CompactionFailed) => {}
            Err(err) => return Err(err),
        }
        match self.find_fit(size) {
            Some((offset, fsize)) => self.place(offset, fsize, size, stream),
            None => Err(Error::OutOfVirtual),
        }
    }

    /// Returns `ptr`'s subrange to the free book, tearing down its mapping
    /// and releasing its page. A provider failure during unmap is surfaced
    /// after the books have settled; the page handle is then leaked rather
    /// than released out from under a possibly live device mapping.
    pub fn deallocate(&mut self, ptr: DevicePtr) -> Result<(), Error> {
        let offset = self.offset_of(ptr)?;
        let mapping = self.used.remove(&offset).ok_or(Error::NotOwned)?;
        let size = mapping.size();
        let (page, unmap_result) = mapping.unbind(&mut self.window);
        match &unmap_result {
            Ok(()) => page.release(),
            Err(err) => {
                warn!("unmap at {ptr} failed during deallocate: {err}");
                page.leak();
            }
        }
        self.insert_free(offset, size);
        self.assert_invariants();
        unmap_result.map_err(Error::UnmapFailed)
    }

    /// Packs the used subranges contiguously from offset zero, leaving one
    /// trailing free subrange. Commits moves in increasing offset order and
    /// appends each to `relocated`; on a mid-way failure the committed moves
    /// stay in force, the failed subrange is restored, and
    /// [`Error::CompactionFailed`] is returned with the books still valid.
    pub fn compact(&mut self, relocated: &mut Vec<Relocation>) -> Result<(), Error> {
        if matches!(self.policy, CompactionPolicy::Never) {
            return Ok(());
        }

        // Plan: the destination of each used subrange is the running sum of
        // the sizes before it.
        let mut moves = Vec::new();
        let mut next = 0u64;
        for (&offset, mapping) in &self.used {
            if offset != next {
                moves.push((offset, next));
            }
            next += mapping.size();
        }
        if moves.is_empty() {
            return Ok(());
        }

        debug!(
            "compacting segment {}: moving {} of {} subranges",
            self.window.base(),
            moves.len(),
            self.used.len()
        );
        // Strictly increasing source order: by the time a destination is
        // written, any page that sat there has already moved lower.
        for (old, new) in moves {
            if let Err(err) = self.relocate_one(old, new, relocated) {
                warn!("compaction of segment {} aborted: {err}", self.window.base());
                self.rebuild_free();
                self.assert_invariants();
                return Err(Error::CompactionFailed);
            }
        }
        self.rebuild_free();
        self.assert_invariants();
        info!(
            "compacted segment {}: {} bytes used, {} bytes free",
            self.window.base(),
            next,
            self.window.size() - next
        );
        Ok(())
    }

    /// Splits the segment: `self` keeps `[0, keep_size)`, the returned
    /// segment takes ownership of everything above. A used subrange may not
    /// straddle the split point; a free subrange straddling it is divided in
    /// place. Mapped pages stay at their device addresses.
    pub fn split(&mut self, keep_size: u64) -> Result<Segment, Error> {
        if keep_size == 0 || keep_size >= self.window.size() || keep_size % self.granularity != 0 {
            return Err(Error::BadSplit);
        }
        if let Some((&offset, mapping)) = self.used.range(..keep_size).next_back() {
            if offset + mapping.size() > keep_size {
                return Err(Error::BadSplit);
            }
        }
        if let Some((&offset, &size)) = self.free.range(..keep_size).next_back() {
            if offset + size > keep_size {
                self.free.insert(offset, keep_size - offset);
                self.free.insert(keep_size, offset + size - keep_size);
            }
        }

        let tail_used: BTreeMap<u64, Mapping> = self
            .used
            .split_off(&keep_size)
            .into_iter()
            .map(|(offset, mapping)| {
                let rebased = offset - keep_size;
                (rebased, mapping.with_offset(rebased))
            })
            .collect();
        let tail_free: BTreeMap<u64, u64> = self
            .free
            .split_off(&keep_size)
            .into_iter()
            .map(|(offset, size)| (offset - keep_size, size))
            .collect();
        let window = self.window.split_off(keep_size, tail_used.len());
        info!(
            "split segment {} at {keep_size:#x}; tail at {}",
            self.window.base(),
            window.base()
        );

        let tail = Segment {
            used: tail_used,
            free: tail_free,
            window,
            provider: Arc::clone(&self.provider),
            device: self.device,
            granularity: self.granularity,
            policy: self.policy,
            fused: false,
        };
        self.assert_invariants();
        tail.assert_invariants();
        Ok(tail)
    }

    /// Absorbs `other`, whose window must start exactly at our end and live
    /// on the same device; `other` is returned unchanged otherwise. The
    /// survivor is marked fused.
    pub fn merge(&mut self, other: Segment) -> Result<(), Segment> {
        if self.device != other.device || self.window.end() != other.window.base() {
            return Err(other);
        }
        let shift = self.window.size();
        let Segment {
            used, free, window, ..
        } = other;
        self.window.absorb(window);
        for (offset, mapping) in used {
            let rebased = shift + offset;
            self.used.insert(rebased, mapping.with_offset(rebased));
        }
        for (offset, size) in free {
            self.insert_free(shift + offset, size);
        }
        self.fused = true;
        info!("merged segments; survivor {} now {} bytes", self.window.base(), self.window.size());
        self.assert_invariants();
        Ok(())
    }

    /// Records a client block id on the page backing `ptr`. Diagnostics
    /// only; see [`BlockRef`].
    pub fn note_block_ref(&self, ptr: DevicePtr, block: u64) -> Result<(), Error> {
        let offset = self.offset_of(ptr)?;
        let mapping = self.used.get(&offset).ok_or(Error::NotOwned)?;
        mapping.page().push_back_ref(BlockRef {
            block: Some(block),
            offset,
        });
        Ok(())
    }

    /// Snapshot of the books for the fragmentation monitor.
    pub fn stats(&self) -> SegmentStats {
        SegmentStats {
            base: self.window.base(),
            end: self.window.end(),
            device: self.device,
            free: self.free.values().copied().collect(),
            used: self.used.values().map(|m| m.size()).collect(),
            fused: self.fused,
        }
    }

    /// Validates the segment invariants. Compiled to a no-op in release
    /// builds; called after every mutating operation.
    pub fn assert_invariants(&self) {
        if !cfg!(debug_assertions) {
            return;
        }
        let mut tiles: Vec<(u64, u64)> = self
            .used
            .iter()
            .map(|(&offset, m)| (offset, m.size()))
            .chain(self.free.iter().map(|(&offset, &size)| (offset, size)))
            .collect();
        tiles.sort_unstable();
        let mut cursor = 0u64;
        for &(offset, size) in &tiles {
            assert_eq!(offset, cursor, "gap or overlap at offset {offset:#x}");
            assert!(size > 0 && size % self.granularity == 0);
            cursor = offset + size;
        }
        assert_eq!(cursor, self.window.size(), "books do not tile the window");

        for ((&a_off, &a_size), (&b_off, _)) in self.free.iter().tuple_windows() {
            assert_ne!(a_off + a_size, b_off, "adjacent free subranges");
        }

        let mut handles = std::collections::HashSet::new();
        for (&offset, mapping) in &self.used {
            assert_eq!(mapping.offset(), offset);
            assert_eq!(mapping.addr(), self.window.base() + offset);
            assert!(!mapping.page().is_free());
            assert!(handles.insert(mapping.page().handle()), "page mapped twice");
        }
    }

    fn round_request(&self, n: u64) -> Result<u64, Error> {
        if n == 0 {
            return Err(Error::BadSize);
        }
        let size = align_up_checked(n, self.granularity).ok_or(Error::BadSize)?;
        if size > self.window.size() {
            return Err(Error::BadSize);
        }
        Ok(size)
    }

    /// First fit by offset. Keeps low addresses dense, which makes
    /// compaction a mostly monotonic walk.
    fn find_fit(&self, size: u64) -> Option<(u64, u64)> {
        self.free
            .iter()
            .find(|&(_, &fsize)| fsize >= size)
            .map(|(&offset, &fsize)| (offset, fsize))
    }

    fn place(
        &mut self,
        offset: u64,
        fsize: u64,
        size: u64,
        stream: Option<StreamId>,
    ) -> Result<DevicePtr, Error> {
        let page = PhyPage::create(&self.provider, self.device, size, stream)
            .map_err(Error::OutOfPhysical)?;
        // A failed bind drops the page, which releases the handle.
        let mapping =
            Mapping::bind(&mut self.window, offset, page, None).map_err(Error::MapFailed)?;

        let removed = self.free.remove(&offset);
        debug_assert_eq!(removed, Some(fsize));
        if fsize > size {
            self.free.insert(offset + size, fsize - size);
        }
        let ptr = mapping.addr();
        self.used.insert(offset, mapping);
        self.assert_invariants();
        Ok(ptr)
    }

    fn offset_of(&self, ptr: DevicePtr) -> Result<u64, Error> {
        let offset = ptr.offset_from(self.window.base()).ok_or(Error::NotOwned)?;
        if offset >= self.window.size() || offset % self.granularity != 0 {
            return Err(Error::NotOwned);
        }
        Ok(offset)
    }

    /// Inserts a free subrange, eagerly coalescing with both neighbors.
    fn insert_free(&mut self, mut offset: u64, mut size: u64) {
        if let Some((&prev_off, &prev_size)) = self.free.range(..offset).next_back() {
            if prev_off + prev_size == offset {
                self.free.remove(&prev_off);
                offset = prev_off;
                size += prev_size;
            }
        }
        if let Some(&next_size) = self.free.get(&(offset + size)) {
            self.free.remove(&(offset + size));
            size += next_size;
        }
        self.free.insert(offset, size);
    }

    /// Recomputes the free book as the complement of the used book. The
    /// result is coalesced by construction.
    fn rebuild_free(&mut self) {
        self.free.clear();
        let mut cursor = 0u64;
        for (&offset, mapping) in &self.used {
            if offset > cursor {
                self.free.insert(cursor, offset - cursor);
            }
            cursor = offset + mapping.size();
        }
        if cursor < self.window.size() {
            self.free.insert(cursor, self.window.size() - cursor);
        }
    }

    fn relocate_one(
        &mut self,
        old: u64,
        new: u64,
        relocated: &mut Vec<Relocation>,
    ) -> Result<(), Error> {
        let mapping = match self.used.remove(&old) {
            Some(mapping) => mapping,
            None => return Err(Error::CompactionFailed),
        };
        let size = mapping.size();

        let moved = match self.policy {
            CompactionPolicy::ZeroCopyPreferred => match self.remap_move(mapping, new) {
                Ok(m) => Ok(m),
                Err((Some(restored), err)) => {
                    debug!("rebind at offset {new:#x} refused ({err}); copying instead");
                    self.copy_move(restored, new)
                }
                Err((None, err)) => Err((None, err)),
            },
            CompactionPolicy::CopyAlways => self.copy_move(mapping, new),
            CompactionPolicy::Never => unreachable!(),
        };

        match moved {
            Ok(mapping) => {
                relocated.push(Relocation {
                    old: self.window.base() + old,
                    new: mapping.addr(),
                    size,
                });
                self.used.insert(new, mapping);
                Ok(())
            }
            Err((Some(mapping), err)) => {
                self.used.insert(old, mapping);
                Err(err)
            }
            Err((None, err)) => {
                error!("subrange at offset {old:#x} lost during compaction: {err}");
                Err(err)
            }
        }
    }

    /// Moves `mapping` by rebinding its physical page at `new`. The
    /// destination is bound before the source is retired, so a provider that
    /// refuses to alias the page leaves the source untouched and the caller
    /// can fall back to a copy.
    fn remap_move(&mut self, mapping: Mapping, new: u64) -> MoveResult {
        let size = mapping.size();
        let handle = mapping.page().handle();
        let new_addr = self.window.base() + new;

        if let Err(err) = self.provider.map(new_addr, size, handle) {
            return Err((Some(mapping), Error::MapFailed(err)));
        }
        if let Err(err) = self
            .provider
            .set_access(new_addr, size, self.device, AccessFlags::RW)
        {
            if let Err(unmap_err) = self.provider.unmap(new_addr, size) {
                warn!("rollback unmap at {new_addr} failed: {unmap_err}");
            }
            return Err((Some(mapping), Error::MapFailed(err)));
        }

        let (page, unmap_result) = mapping.unbind(&mut self.window);
        if let Err(err) = unmap_result {
            // The source range's device state is unknown; retreat from the
            // destination and drop the subrange.
            if let Err(unmap_err) = self.provider.unmap(new_addr, size) {
                warn!("retreat unmap at {new_addr} failed: {unmap_err}");
            }
            page.leak();
            return Err((None, Error::UnmapFailed(err)));
        }
        Ok(Mapping::adopt(&mut self.window, new, page))
    }

    /// Moves `mapping` to `new` by copying into a freshly allocated page.
    fn copy_move(&mut self, mapping: Mapping, new: u64) -> MoveResult {
        let old = mapping.offset();
        let size = mapping.size();
        let stream = mapping.page().owner_stream();

        // A destination overlapping its source needs a staging hop.
        if new + size > old {
            return self.copy_move_staged(mapping, new);
        }

        let replacement = match PhyPage::create(&self.provider, self.device, size, stream) {
            Ok(page) => page,
            Err(err) => return Err((Some(mapping), Error::OutOfPhysical(err))),
        };
        let target = match Mapping::bind(&mut self.window, new, replacement, None) {
            Ok(m) => m,
            Err(err) => return Err((Some(mapping), Error::MapFailed(err))),
        };
        if let Err(err) = self.provider.copy(target.addr(), mapping.addr(), size) {
            let (replacement, _) = target.unbind(&mut self.window);
            replacement.release();
            return Err((Some(mapping), Error::CopyFailed(err)));
        }

        let (old_page, unmap_result) = mapping.unbind(&mut self.window);
        match unmap_result {
            Ok(()) => old_page.release(),
            Err(err) => {
                // The move itself succeeded; the stale source range stays
                // unusable until the segment is torn down.
                warn!("unmap of copied-from range at offset {old:#x} failed: {err}");
                old_page.leak();
            }
        }
        Ok(target)
    }

    /// Overlap-safe copy move: bounce the contents through a page mapped in
    /// a scratch reservation, so no page is ever bound at two addresses.
    fn copy_move_staged(&mut self, mapping: Mapping, new: u64) -> MoveResult {
        let size = mapping.size();
        let stream = mapping.page().owner_stream();

        let bounce = match PhyPage::create(&self.provider, self.device, size, stream) {
            Ok(page) => page,
            Err(err) => return Err((Some(mapping), Error::OutOfPhysical(err))),
        };
        let mut stage = match Staging::reserve(&self.provider, size) {
            Ok(stage) => stage,
            Err(_) => return Err((Some(mapping), Error::OutOfVirtual)),
        };
        if let Err(err) = stage.map(&bounce, self.device) {
            return Err((Some(mapping), Error::MapFailed(err)));
        }
        if let Err(err) = self.provider.copy(stage.base(), mapping.addr(), size) {
            return Err((Some(mapping), Error::CopyFailed(err)));
        }

        // The bounce page holds the contents; retire the source.
        let (old_page, unmap_result) = mapping.unbind(&mut self.window);
        if let Err(err) = unmap_result {
            old_page.leak();
            return Err((None, Error::UnmapFailed(err)));
        }
        old_page.release();

        let replacement = match PhyPage::create(&self.provider, self.device, size, stream) {
            Ok(page) => page,
            Err(err) => return Err((None, Error::OutOfPhysical(err))),
        };
        let target = match Mapping::bind(&mut self.window, new, replacement, None) {
            Ok(m) => m,
            Err(err) => return Err((None, Error::MapFailed(err))),
        };
        if let Err(err) = self.provider.copy(target.addr(), stage.base(), size) {
            let (replacement, _) = target.unbind(&mut self.window);
            replacement.release();
            return Err((None, Error::CopyFailed(err)));
        }
        if let Err(err) = stage.unmap() {
            warn!("failed to unmap staging range at {}: {err}", stage.base());
        }
        Ok(target)
    }
}

/// Scratch reservation used by overlap-safe copy moves. Cleans up after
/// itself however far the move got; the page mapped into it must outlive it.
struct Staging {
    provider: Arc<dyn DeviceMemoryProvider>,
    base: DevicePtr,
    size: u64,
    mapped: bool,
}

impl Staging {
    fn reserve(provider: &Arc<dyn DeviceMemoryProvider>, size: u64) -> Result<Staging, ProviderError> {
        let base = provider.reserve(size)?;
        Ok(Staging {
            provider: Arc::clone(provider),
            base,
            size,
            mapped: false,
        })
    }

    fn base(&self) -> DevicePtr {
        self.base
    }

    fn map(&mut self, page: &PhyPage, device: DeviceId) -> Result<(), ProviderError> {
        self.provider.map(self.base, self.size, page.handle())?;
        self.mapped = true;
        self.provider
            .set_access(self.base, self.size, device, AccessFlags::RW)
    }

    fn unmap(&mut self) -> Result<(), ProviderError> {
        if self.mapped {
            self.provider.unmap(self.base, self.size)?;
            self.mapped = false;
        }
        Ok(())
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if self.mapped {
            if let Err(err) = self.provider.unmap(self.base, self.size) {
                warn!("failed to unmap staging range at {}: {err}", self.base);
                return;
            }
        }
        if let Err(err) = self.provider.free(self.base, self.size) {
            warn!("failed to free staging range at {}: {err}", self.base);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use test_log::test;

    use crate::mock::MockProvider;

    const G: u64 = 2 * 1024 * 1024;
    const SEG: u64 = 16 * G;

    fn segment_sized(policy: CompactionPolicy, size: u64) -> (Arc<MockProvider>, Segment) {
        let mock = Arc::new(MockProvider::new());
        let provider: Arc<dyn DeviceMemoryProvider> = mock.clone();
        let segment = Segment::new(provider, DeviceId(0), size, G, policy).unwrap();
        (mock, segment)
    }

    fn new_segment(policy: CompactionPolicy) -> (Arc<MockProvider>, Segment) {
        segment_sized(policy, SEG)
    }

    fn free_map(segment: &Segment) -> Vec<(u64, u64)> {
        segment.free.iter().map(|(&o, &s)| (o, s)).collect()
    }

    fn used_offsets(segment: &Segment) -> Vec<u64> {
        segment.used.keys().copied().collect()
    }

    #[test]
    fn sequential_fill() {
        let (_mock, mut segment) = new_segment(CompactionPolicy::ZeroCopyPreferred);
        let base = segment.base();
        for i in 0..8u64 {
            let ptr = segment.try_allocate(G, None).unwrap();
            assert_eq!(ptr, base + i * G);
        }
        assert_eq!(free_map(&segment), vec![(8 * G, 8 * G)]);
    }

    #[test]
    fn bad_sizes_are_rejected() {
        let (_mock, mut segment) = new_segment(CompactionPolicy::ZeroCopyPreferred);
        assert_eq!(segment.try_allocate(0, None), Err(Error::BadSize));
        assert_eq!(segment.try_allocate(SEG + 1, None), Err(Error::BadSize));
        assert_eq!(segment.try_allocate(u64::MAX, None), Err(Error::BadSize));
        assert_eq!(free_map(&segment), vec![(0, SEG)]);
    }

    #[test]
    fn requests_round_up_to_granularity() {
        let (mock, mut segment) = new_segment(CompactionPolicy::ZeroCopyPreferred);
        let ptr = segment.try_allocate(1, None).unwrap();
        assert_eq!(free_map(&segment), vec![(G, SEG - G)]);
        segment.deallocate(ptr).unwrap();
        assert_eq!(free_map(&segment), vec![(0, SEG)]);
        assert_eq!(mock.live_pages(), 0);
    }

    #[test]
    fn whole_window_allocation_succeeds_on_empty_segment() {
        let (_mock, mut segment) = new_segment(CompactionPolicy::ZeroCopyPreferred);
        let ptr = segment.try_allocate(SEG, None).unwrap();
        assert_eq!(ptr, segment.base());
        assert_eq!(free_map(&segment), vec![]);
        let mut relocated = Vec::new();
        assert_eq!(
            segment.allocate(G, None, &mut relocated),
            Err(Error::OutOfVirtual)
        );
        assert!(relocated.is_empty());
    }

    #[test]
    fn mis_free_detection() {
        let (_mock, mut segment) = new_segment(CompactionPolicy::ZeroCopyPreferred);
        let base = segment.base();
        segment.try_allocate(G, None).unwrap();
        assert_eq!(segment.deallocate(base + G / 2), Err(Error::NotOwned));
        assert_eq!(segment.deallocate(base + SEG), Err(Error::NotOwned));
        assert_eq!(segment.deallocate(base + G), Err(Error::NotOwned));
        assert_eq!(used_offsets(&segment), vec![0]);
        assert_eq!(free_map(&segment), vec![(G, SEG - G)]);
    }

    #[test]
    fn deallocate_coalesces_both_ways() {
        let (mock, mut segment) = new_segment(CompactionPolicy::ZeroCopyPreferred);
        let a = segment.try_allocate(G, None).unwrap();
        let b = segment.try_allocate(G, None).unwrap();
        let c = segment.try_allocate(G, None).unwrap();
        segment.deallocate(a).unwrap();
        segment.deallocate(c).unwrap();
        assert_eq!(free_map(&segment), vec![(0, G), (2 * G, SEG - 2 * G)]);
        segment.deallocate(b).unwrap();
        assert_eq!(free_map(&segment), vec![(0, SEG)]);
        assert_eq!(mock.live_pages(), 0);
    }

    #[test]
    fn fragmentation_then_compaction() {
        // A full 8-granule window: freeing the even-indexed pages leaves
        // four one-page holes and no tail, so a 4-page request cannot fit
        // without compaction.
        let (_mock, mut segment) = segment_sized(CompactionPolicy::ZeroCopyPreferred, 8 * G);
        let base = segment.base();
        let ptrs: Vec<_> = (0..8)
            .map(|_| segment.try_allocate(G, None).unwrap())
            .collect();
        for i in [0, 2, 4, 6] {
            segment.deallocate(ptrs[i]).unwrap();
        }
        assert_eq!(
            free_map(&segment),
            vec![(0, G), (2 * G, G), (4 * G, G), (6 * G, G)]
        );

        let mut relocated = Vec::new();
        let ptr = segment.allocate(4 * G, None, &mut relocated).unwrap();
        assert_eq!(ptr, base + 4 * G);
        assert_eq!(
            relocated,
            vec![
                Relocation { old: base + G, new: base, size: G },
                Relocation { old: base + 3 * G, new: base + G, size: G },
                Relocation { old: base + 5 * G, new: base + 2 * G, size: G },
                Relocation { old: base + 7 * G, new: base + 3 * G, size: G },
            ]
        );
        assert_eq!(used_offsets(&segment), vec![0, G, 2 * G, 3 * G, 4 * G]);
        assert_eq!(free_map(&segment), vec![]);
    }

    #[test]
    fn copy_fallback_when_provider_cannot_alias() {
        let (mock, mut segment) = segment_sized(CompactionPolicy::ZeroCopyPreferred, 8 * G);
        mock.set_deny_alias(true);
        let base = segment.base();
        let ptrs: Vec<_> = (0..8)
            .map(|_| segment.try_allocate(G, None).unwrap())
            .collect();
        for i in [0, 2, 4, 6] {
            segment.deallocate(ptrs[i]).unwrap();
        }

        let mut relocated = Vec::new();
        let ptr = segment.allocate(4 * G, None, &mut relocated).unwrap();
        assert_eq!(ptr, base + 4 * G);
        assert_eq!(relocated.len(), 4);
        assert_eq!(mock.counts().copies, 4);
        // Four surviving pages replaced by copies, plus the new allocation.
        assert_eq!(mock.live_pages(), 5);
        assert_eq!(free_map(&segment), vec![]);
    }

    #[test]
    fn copy_always_policy_never_rebinds() {
        let (mock, mut segment) = new_segment(CompactionPolicy::CopyAlways);
        let ptrs: Vec<_> = (0..4)
            .map(|_| segment.try_allocate(G, None).unwrap())
            .collect();
        segment.deallocate(ptrs[0]).unwrap();
        segment.deallocate(ptrs[2]).unwrap();

        let mut relocated = Vec::new();
        segment.compact(&mut relocated).unwrap();
        assert_eq!(relocated.len(), 2);
        assert_eq!(mock.counts().copies, 2);
        assert_eq!(free_map(&segment), vec![(2 * G, SEG - 2 * G)]);
    }

    #[test]
    fn compaction_is_idempotent() {
        let (mock, mut segment) = new_segment(CompactionPolicy::ZeroCopyPreferred);
        let ptrs: Vec<_> = (0..4)
            .map(|_| segment.try_allocate(G, None).unwrap())
            .collect();
        segment.deallocate(ptrs[1]).unwrap();

        let mut relocated = Vec::new();
        segment.compact(&mut relocated).unwrap();
        assert_eq!(relocated.len(), 2);

        let counts = mock.counts();
        let mut again = Vec::new();
        segment.compact(&mut again).unwrap();
        assert!(again.is_empty());
        assert_eq!(mock.counts(), counts);
    }

    #[test]
    fn never_policy_disables_compaction() {
        let (mock, mut segment) = segment_sized(CompactionPolicy::Never, 8 * G);
        let ptrs: Vec<_> = (0..8)
            .map(|_| segment.try_allocate(G, None).unwrap())
            .collect();
        for i in [0, 2, 4, 6] {
            segment.deallocate(ptrs[i]).unwrap();
        }
        let maps_before = mock.counts().maps;
        let mut relocated = Vec::new();
        assert_eq!(
            segment.allocate(4 * G, None, &mut relocated),
            Err(Error::OutOfVirtual)
        );
        assert!(relocated.is_empty());
        assert_eq!(mock.counts().maps, maps_before);
    }

    #[test]
    fn failed_move_restores_the_subrange() {
        let (mock, mut segment) = new_segment(CompactionPolicy::CopyAlways);
        let ptrs: Vec<_> = (0..4)
            .map(|_| segment.try_allocate(G, None).unwrap())
            .collect();
        segment.deallocate(ptrs[0]).unwrap();
        segment.deallocate(ptrs[2]).unwrap();
        let free_before = free_map(&segment);

        mock.fail_next_copies(1);
        let mut relocated = Vec::new();
        assert_eq!(
            segment.compact(&mut relocated),
            Err(Error::CompactionFailed)
        );
        assert!(relocated.is_empty());
        assert_eq!(free_map(&segment), free_before);
        assert_eq!(used_offsets(&segment), vec![G, 3 * G]);
    }

    #[test]
    fn partial_compaction_keeps_committed_moves() {
        let (mock, mut segment) = new_segment(CompactionPolicy::CopyAlways);
        let base = segment.base();
        let ptrs: Vec<_> = (0..6)
            .map(|_| segment.try_allocate(G, None).unwrap())
            .collect();
        for i in [0, 2, 4] {
            segment.deallocate(ptrs[i]).unwrap();
        }

        // Let the first move's copy through, fail the second.
        mock.fail_copies_after(1, 1);
        let mut relocated = Vec::new();
        assert_eq!(
            segment.compact(&mut relocated),
            Err(Error::CompactionFailed)
        );

        // The committed move stays in force; the failed one was restored.
        assert_eq!(
            relocated,
            vec![Relocation {
                old: base + G,
                new: base,
                size: G
            }]
        );
        assert_eq!(used_offsets(&segment), vec![0, 3 * G, 5 * G]);
        assert_eq!(
            free_map(&segment),
            vec![(G, 2 * G), (4 * G, G), (6 * G, SEG - 6 * G)]
        );

        // A later compaction finishes the job.
        let mut rest = Vec::new();
        segment.compact(&mut rest).unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(used_offsets(&segment), vec![0, G, 2 * G]);
        assert_eq!(free_map(&segment), vec![(3 * G, SEG - 3 * G)]);
    }

    #[test]
    fn split_and_merge_round_trip() {
        let (mock, mut segment) = new_segment(CompactionPolicy::ZeroCopyPreferred);
        for _ in 0..4 {
            segment.try_allocate(G, None).unwrap();
        }
        let used_before = used_offsets(&segment);
        let free_before = free_map(&segment);
        let counts_before = mock.counts();

        let tail = segment.split(2 * G).unwrap();
        assert_eq!(used_offsets(&segment), vec![0, G]);
        assert_eq!(free_map(&segment), vec![]);
        assert_eq!(used_offsets(&tail), vec![0, G]);
        assert_eq!(free_map(&tail), vec![(2 * G, SEG - 4 * G)]);
        assert_eq!(segment.end(), tail.base());

        segment.merge(tail).unwrap();
        assert!(segment.is_fused());
        assert_eq!(used_offsets(&segment), used_before);
        assert_eq!(free_map(&segment), free_before);
        assert_eq!(segment.size(), SEG);
        // Subdivision moves no pages: not a single map or unmap happened.
        assert_eq!(mock.counts().maps, counts_before.maps);
        assert_eq!(mock.counts().unmaps, counts_before.unmaps);
    }

    #[test]
    fn split_point_rules() {
        let (_mock, mut segment) = new_segment(CompactionPolicy::ZeroCopyPreferred);
        segment.try_allocate(2 * G, None).unwrap();
        // Inside a used subrange, unaligned, or at the extremes: rejected.
        assert!(matches!(segment.split(G), Err(Error::BadSplit)));
        assert!(matches!(segment.split(G / 2), Err(Error::BadSplit)));
        assert!(matches!(segment.split(0), Err(Error::BadSplit)));
        assert!(matches!(segment.split(SEG), Err(Error::BadSplit)));
        // Inside a free subrange: the subrange is divided.
        let tail = segment.split(3 * G).unwrap();
        assert_eq!(free_map(&segment), vec![(2 * G, G)]);
        assert_eq!(free_map(&tail), vec![(0, SEG - 3 * G)]);
    }

    #[test]
    fn merge_rejects_foreign_segments() {
        let mock = Arc::new(MockProvider::new());
        let provider: Arc<dyn DeviceMemoryProvider> = mock.clone();
        let mut a = Segment::new(
            Arc::clone(&provider),
            DeviceId(0),
            SEG,
            G,
            CompactionPolicy::ZeroCopyPreferred,
        )
        .unwrap();
        // Leave a hole in the address space so `b` is not adjacent.
        let _gap = provider.reserve(G).unwrap();
        let b = Segment::new(
            provider,
            DeviceId(0),
            SEG,
            G,
            CompactionPolicy::ZeroCopyPreferred,
        )
        .unwrap();
        let b = a.merge(b).unwrap_err();
        assert_eq!(b.size(), SEG);
    }

    #[test]
    fn merge_adjacent_segments() {
        let mock = Arc::new(MockProvider::new());
        let provider: Arc<dyn DeviceMemoryProvider> = mock.clone();
        let mut a = Segment::new(
            Arc::clone(&provider),
            DeviceId(0),
            SEG,
            G,
            CompactionPolicy::ZeroCopyPreferred,
        )
        .unwrap();
        let mut b = Segment::new(
            provider,
            DeviceId(0),
            SEG,
            G,
            CompactionPolicy::ZeroCopyPreferred,
        )
        .unwrap();
        assert_eq!(a.end(), b.base());
        let pa = a.try_allocate(G, None).unwrap();
        let pb = b.try_allocate(G, None).unwrap();

        a.merge(b).unwrap();
        assert!(a.is_fused());
        assert_eq!(used_offsets(&a), vec![0, SEG]);
        assert_eq!(a.size(), 2 * SEG);

        a.deallocate(pa).unwrap();
        a.deallocate(pb).unwrap();
        assert_eq!(free_map(&a), vec![(0, 2 * SEG)]);
        drop(a);
        mock.assert_quiescent();
    }

    #[test]
    fn back_refs_attach_to_pages() {
        let (_mock, mut segment) = new_segment(CompactionPolicy::ZeroCopyPreferred);
        let ptr = segment.try_allocate(G, None).unwrap();
        segment.note_block_ref(ptr, 42).unwrap();
        assert_eq!(segment.note_block_ref(ptr + G, 42), Err(Error::NotOwned));
        let refs = segment.used[&0].page().back_refs();
        assert_eq!(refs.last().unwrap().block, Some(42));
    }

    #[test]
    fn teardown_releases_everything() {
        let (mock, mut segment) = new_segment(CompactionPolicy::ZeroCopyPreferred);
        for _ in 0..5 {
            segment.try_allocate(G, None).unwrap();
        }
        drop(segment);
        mock.assert_quiescent();
    }

    mod properties {
        use super::*;

        use proptest::prelude::*;
        use test_log::test;

        #[derive(Clone, Copy, Debug)]
        enum Op {
            Allocate { granules: u64 },
            Free { index: usize },
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                (1u64..5).prop_map(|granules| Op::Allocate { granules }),
                (0usize..64).prop_map(|index| Op::Free { index }),
            ]
        }

        proptest! {
            #[test]
            fn random_traffic_preserves_invariants(ops in proptest::collection::vec(op_strategy(), 1..80)) {
                let (mock, mut segment) = new_segment(CompactionPolicy::ZeroCopyPreferred);
                let mut live = Vec::new();

                for op in ops {
                    match op {
                        Op::Allocate { granules } => {
                            let mut relocated = Vec::new();
                            match segment.allocate(granules * G, None, &mut relocated) {
                                Ok(ptr) => {
                                    // Compaction may have moved earlier
                                    // allocations; rewrite our bookkeeping
                                    // like a client following the log.
                                    for relocation in &relocated {
                                        for p in live.iter_mut() {
                                            if *p == relocation.old {
                                                *p = relocation.new;
                                            }
                                        }
                                    }
                                    live.push(ptr);
                                }
                                Err(Error::OutOfVirtual) => {}
                                Err(err) => prop_assert!(false, "unexpected error: {err}"),
                            }
                        }
                        Op::Free { index } => {
                            if !live.is_empty() {
                                let ptr = live.swap_remove(index % live.len());
                                segment.deallocate(ptr).unwrap();
                            }
                        }
                    }
                    segment.assert_invariants();
                }

                for ptr in live {
                    segment.deallocate(ptr).unwrap();
                }
                prop_assert_eq!(free_map(&segment), vec![(0, SEG)]);
                drop(segment);
                mock.assert_quiescent();
            }
        }
    }
}
