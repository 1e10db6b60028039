//! The multi-segment allocator facade.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::addr::{align_up_checked, DevicePtr};
use crate::error::Error;
use crate::monitor::{FragmentationMonitor, Maintenance, SegmentStats};
use crate::provider::{DeviceId, DeviceMemoryProvider, StreamId};
use crate::segment::{CompactionPolicy, Relocation, Segment};

/// Client callback for compaction commits. An upstream allocator uses the
/// batches to rewrite its own pointer bookkeeping.
pub trait RelocationListener: Send + Sync {
    fn on_relocations(&self, batch: &[Relocation]);
}

/// Tunables recognized by the pool.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Forces a granularity instead of querying the provider. Testing hook.
    pub granularity_override: Option<u64>,
    /// Pool-wide fragmentation score above which maintenance kicks in, in
    /// `(0, 1)`.
    pub fragmentation_threshold: f64,
    /// Window size for freshly created segments, a multiple of the
    /// granularity. Larger requests get a window of their own size.
    pub default_segment_size: u64,
    pub compaction_policy: CompactionPolicy,
    /// Merge adjacent windows during maintenance.
    pub merge_adjacent: bool,
    /// Maintenance rounds skipped after a failed compaction.
    pub compaction_cooldown: u32,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            granularity_override: None,
            fragmentation_threshold: 0.5,
            default_segment_size: 64 * 1024 * 1024,
            compaction_policy: CompactionPolicy::default(),
            merge_adjacent: true,
            compaction_cooldown: 4,
        }
    }
}

struct Inner {
    /// Sorted by window base address.
    segments: Vec<Arc<Mutex<Segment>>>,
    /// old pointer -> (new pointer, generation). Entries survive at least
    /// until the end of the next compaction commit.
    relocations: HashMap<DevicePtr, (DevicePtr, u64)>,
    generation: u64,
}

/// Multi-segment device memory pool.
///
/// Dispatches allocations to segments (creating them on demand), redirects
/// late frees of compaction-moved pointers through the relocation log, and
/// hosts the fragmentation monitor behind [`DevicePool::maintain`].
pub struct DevicePool {
    provider: Arc<dyn DeviceMemoryProvider>,
    device: DeviceId,
    granularity: u64,
    config: PoolConfig,
    /// Lock order: this mutex before any segment mutex, never the reverse,
    /// and never across a provider call.
    inner: Mutex<Inner>,
    monitor: Mutex<FragmentationMonitor>,
    listeners: Mutex<Vec<Arc<dyn RelocationListener>>>,
}

impl DevicePool {
    /// # Panics
    ///
    /// Panics if the configuration is inconsistent: a non-power-of-two
    /// granularity, a threshold outside `(0, 1)`, or a default segment size
    /// that is zero or unaligned.
    pub fn new(
        provider: Arc<dyn DeviceMemoryProvider>,
        device: DeviceId,
        config: PoolConfig,
    ) -> DevicePool {
        let granularity = config
            .granularity_override
            .unwrap_or_else(|| provider.granularity());
        assert!(granularity.is_power_of_two());
        assert!(config.fragmentation_threshold > 0.0 && config.fragmentation_threshold < 1.0);
        assert!(
            config.default_segment_size > 0 && config.default_segment_size % granularity == 0
        );

        let monitor = FragmentationMonitor::new(
            config.fragmentation_threshold,
            config.merge_adjacent,
            config.compaction_cooldown,
        );
        DevicePool {
            provider,
            device,
            granularity,
            config,
            inner: Mutex::new(Inner {
                segments: Vec::new(),
                relocations: HashMap::new(),
                generation: 0,
            }),
            monitor: Mutex::new(monitor),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn add_listener(&self, listener: Arc<dyn RelocationListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn allocate(&self, size: u64) -> Result<DevicePtr, Error> {
        self.allocate_on(size, None)
    }

    /// Allocates `size` bytes, recording `stream` as the owner of the
    /// backing page.
    pub fn allocate_on(&self, size: u64, stream: Option<StreamId>) -> Result<DevicePtr, Error> {
        if size == 0 {
            return Err(Error::BadSize);
        }
        let rounded = align_up_checked(size, self.granularity).ok_or(Error::BadSize)?;
        let segments = self.snapshot();

        // First pass: plain fit in an existing segment.
        for segment in &segments {
            let mut guard = segment.lock().unwrap();
            match guard.try_allocate(rounded, stream) {
                Ok(ptr) => {
                    drop(guard);
                    self.note_allocated(ptr);
                    return Ok(ptr);
                }
                // No fit, or too big for this window: try the next one.
                Err(Error::OutOfVirtual) | Err(Error::BadSize) => {}
                Err(err) => return Err(err),
            }
        }

        // Second pass: let each segment compact itself once.
        if !matches!(self.config.compaction_policy, CompactionPolicy::Never) {
            for segment in &segments {
                let mut batch = Vec::new();
                let result = {
                    let mut guard = segment.lock().unwrap();
                    guard.allocate(rounded, stream, &mut batch)
                };
                self.publish(batch);
                match result {
                    Ok(ptr) => {
                        self.note_allocated(ptr);
                        return Ok(ptr);
                    }
                    Err(Error::OutOfVirtual) | Err(Error::BadSize) => {}
                    Err(err) => return Err(err),
                }
            }
        }

        // Nothing fits: reserve a fresh window.
        let window_size = rounded.max(self.config.default_segment_size);
        let mut segment = Segment::new(
            Arc::clone(&self.provider),
            self.device,
            window_size,
            self.granularity,
            self.config.compaction_policy,
        )?;
        let ptr = segment.try_allocate(rounded, stream)?;
        debug!(
            "created segment at {} for a {rounded} byte request",
            segment.base()
        );
        self.insert_segment(Arc::new(Mutex::new(segment)));
        self.note_allocated(ptr);
        Ok(ptr)
    }

    /// Frees `ptr`. A pointer moved by a compaction is transparently
    /// redirected through the relocation log; the spent log entry is
    /// retired on success so the address can be reused.
    pub fn deallocate(&self, ptr: DevicePtr) -> Result<(), Error> {
        if ptr.is_null() {
            return Err(Error::NotOwned);
        }
        let target = self.resolve(ptr);
        for segment in self.snapshot() {
            let mut guard = segment.lock().unwrap();
            if guard.contains(target) {
                guard.deallocate(target)?;
                drop(guard);
                if target != ptr {
                    self.inner.lock().unwrap().relocations.remove(&ptr);
                }
                return Ok(());
            }
        }
        Err(Error::NotOwned)
    }

    /// Tags the page backing `ptr` with a client block id. Diagnostics only;
    /// see [`crate::page::BlockRef`].
    pub fn attach_block_ref(&self, ptr: DevicePtr, block: u64) -> Result<(), Error> {
        let target = self.resolve(ptr);
        for segment in self.snapshot() {
            let guard = segment.lock().unwrap();
            if guard.contains(target) {
                return guard.note_block_ref(target, block);
            }
        }
        Err(Error::NotOwned)
    }

    /// Runs one maintenance round: snapshot every segment, let the monitor
    /// decide, then re-enter segments to merge and compact. Meant to be
    /// driven periodically by the embedder.
    pub fn maintain(&self) {
        let stats = self.stats();
        let plan = self.monitor.lock().unwrap().plan(&stats);
        for action in plan {
            match action {
                Maintenance::Merge(a, b) => self.merge_pair(a, b),
                Maintenance::Compact(base) => {
                    let Some(segment) = self.find_by_base(base) else {
                        continue;
                    };
                    let mut batch = Vec::new();
                    let result = segment.lock().unwrap().compact(&mut batch);
                    self.publish(batch);
                    if let Err(err) = result {
                        warn!("maintenance compaction of segment {base} failed: {err}");
                        self.monitor.lock().unwrap().note_failure();
                    }
                }
            }
        }
    }

    /// Per-segment snapshots, sorted by base address.
    pub fn stats(&self) -> Vec<SegmentStats> {
        self.snapshot()
            .iter()
            .map(|segment| segment.lock().unwrap().stats())
            .collect()
    }

    /// Current contents of the relocation log.
    pub fn relocations(&self) -> Vec<(DevicePtr, DevicePtr)> {
        let inner = self.inner.lock().unwrap();
        inner
            .relocations
            .iter()
            .map(|(&old, &(new, _))| (old, new))
            .collect()
    }

    fn snapshot(&self) -> Vec<Arc<Mutex<Segment>>> {
        self.inner.lock().unwrap().segments.clone()
    }

    fn find_by_base(&self, base: DevicePtr) -> Option<Arc<Mutex<Segment>>> {
        let inner = self.inner.lock().unwrap();
        inner
            .segments
            .iter()
            .find(|segment| segment.lock().unwrap().base() == base)
            .cloned()
    }

    fn insert_segment(&self, segment: Arc<Mutex<Segment>>) {
        let base = segment.lock().unwrap().base();
        let mut inner = self.inner.lock().unwrap();
        let index = inner
            .segments
            .partition_point(|s| s.lock().unwrap().base() < base);
        inner.segments.insert(index, segment);
    }

    fn merge_pair(&self, a_base: DevicePtr, b_base: DevicePtr) {
        // Detach the tail from the pool; skip the merge if a concurrent
        // operation still holds a reference to it.
        let detached = {
            let mut inner = self.inner.lock().unwrap();
            let Some(index) = inner
                .segments
                .iter()
                .position(|s| s.lock().unwrap().base() == b_base)
            else {
                return;
            };
            inner.segments.remove(index)
        };
        let tail = match Arc::try_unwrap(detached) {
            Ok(mutex) => mutex.into_inner().unwrap(),
            Err(arc) => {
                self.insert_segment(arc);
                return;
            }
        };
        let Some(survivor) = self.find_by_base(a_base) else {
            self.insert_segment(Arc::new(Mutex::new(tail)));
            return;
        };
        let merge_result = survivor.lock().unwrap().merge(tail);
        match merge_result {
            Ok(()) => info!("merged segment {b_base} into {a_base}"),
            Err(tail) => self.insert_segment(Arc::new(Mutex::new(tail))),
        }
    }

    /// Follows the relocation chain for a pointer moved by one or more
    /// compactions; identity for anything else. Only strictly newer
    /// generations may chain: within one batch an entry's old address can
    /// coincide with another entry's new address, and those must not link.
    fn resolve(&self, ptr: DevicePtr) -> DevicePtr {
        let inner = self.inner.lock().unwrap();
        let mut current = ptr;
        let mut last_generation = 0;
        while let Some(&(next, generation)) = inner.relocations.get(&current) {
            if generation <= last_generation {
                break;
            }
            current = next;
            last_generation = generation;
        }
        current
    }

    /// A fresh allocation at `ptr` retires any stale log entry keyed by it.
    fn note_allocated(&self, ptr: DevicePtr) {
        self.inner.lock().unwrap().relocations.remove(&ptr);
    }

    /// Commits a relocation batch: bumps the generation, prunes entries two
    /// generations old, records the batch, and notifies listeners.
    fn publish(&self, batch: Vec<Relocation>) {
        if batch.is_empty() {
            return;
        }
        {
            let mut inner = self.inner.lock().unwrap();
            inner.generation += 1;
            let generation = inner.generation;
            inner
                .relocations
                .retain(|_, &mut (_, entry_generation)| entry_generation + 1 >= generation);
            for relocation in &batch {
                inner
                    .relocations
                    .insert(relocation.old, (relocation.new, generation));
            }
        }
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in &listeners {
            listener.on_relocations(&batch);
        }
        debug!("published {} relocations", batch.len());
    }
}
