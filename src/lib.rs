//! Device memory pooling over virtual-address windows, with compaction.
//!
//! A conventional caching allocator hands out contiguous ranges from fixed
//! arenas and fragments over long runs. This crate instead reserves large
//! virtual address windows and maps fixed-granularity physical pages into
//! them on demand, so the physical backing of an address range can change
//! without the range itself moving. When fragmentation crosses a threshold,
//! a segment is compacted by rebinding its live pages at lower offsets in
//! the same window, preferring a zero-copy rebind and falling back to a
//! device-side copy.
//!
//! The pieces, bottom up: [`PhyPage`] owns one physical allocation handle,
//! [`VirWindow`] one reserved address range, and [`Mapping`] binds a page
//! into a window. A [`Segment`] keeps the ordered books of used and free
//! subranges over one window and implements allocate, deallocate, compact,
//! split, and merge. [`DevicePool`] fans requests out across segments,
//! publishes relocation batches to listeners, and redirects late frees of
//! moved pointers; the [`FragmentationMonitor`] decides from snapshots when
//! to merge and compact.
//!
//! The driver surface is abstracted behind [`DeviceMemoryProvider`]. The
//! crate ships [`mock::MockProvider`], a contract-checking in-memory
//! implementation used by the test suite and suitable for embedders' tests.

pub mod addr;
pub mod error;
pub mod mapping;
pub mod mock;
pub mod monitor;
pub mod page;
pub mod pool;
pub mod provider;
pub mod segment;
pub mod window;

pub use addr::DevicePtr;
pub use error::Error;
pub use mapping::Mapping;
pub use monitor::{FragmentationMonitor, Maintenance, SegmentStats};
pub use page::{BlockRef, PhyPage};
pub use pool::{DevicePool, PoolConfig, RelocationListener};
pub use provider::{
    AccessFlags, DeviceId, DeviceMemoryProvider, PageHandle, ProviderError, StreamId,
};
pub use segment::{CompactionPolicy, Relocation, Segment};
pub use window::VirWindow;
