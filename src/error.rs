//! Error kinds surfaced by the allocator.

use thiserror::Error;

use crate::provider::ProviderError;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum Error {
    /// The request is not a positive multiple of the granularity after
    /// rounding, or exceeds the segment's window.
    #[error("bad allocation size")]
    BadSize,
    /// The pointer does not correspond to a known used subrange.
    #[error("pointer is not owned by this allocator")]
    NotOwned,
    /// The provider could not allocate a physical page.
    #[error("out of device physical memory")]
    OutOfPhysical(#[source] ProviderError),
    /// No free subrange is large enough, even after compaction.
    #[error("out of contiguous virtual address space")]
    OutOfVirtual,
    #[error("provider failed to map a page")]
    MapFailed(#[source] ProviderError),
    #[error("provider failed to unmap a range")]
    UnmapFailed(#[source] ProviderError),
    #[error("device copy failed")]
    CopyFailed(#[source] ProviderError),
    /// The split point is not on a usable subrange boundary.
    #[error("split point is not on a subrange boundary")]
    BadSplit,
    /// Compaction aborted mid-way. The segment is still valid, and moves
    /// committed before the abort remain in force.
    #[error("compaction aborted")]
    CompactionFailed,
}
