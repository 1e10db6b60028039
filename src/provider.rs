//! The device memory provider capability.
//!
//! Everything the allocator does to a device funnels through
//! [`DeviceMemoryProvider`]. The trait is object-safe and shared as
//! `Arc<dyn DeviceMemoryProvider>`; calls are synchronous and may block on
//! driver work. The crate ships [`crate::mock::MockProvider`] for tests;
//! production embedders implement the trait over their driver bindings.

use bitflags::bitflags;
use thiserror::Error;

use crate::addr::DevicePtr;

/// Identifies one device. Opaque to the allocator.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct DeviceId(pub u32);

/// Identifies a client stream. Recorded on pages for diagnostics only.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct StreamId(pub u64);

/// Opaque handle to one physical page allocation, issued by the provider.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct PageHandle(pub u64);

bitflags! {
    /// Access rights granted on a mapped range.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct AccessFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl AccessFlags {
    pub const RW: AccessFlags = AccessFlags::READ.union(AccessFlags::WRITE);
}

/// Failures reported by a provider implementation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    #[error("device out of physical memory")]
    OutOfMemory,
    #[error("virtual address space exhausted")]
    AddressSpaceExhausted,
    #[error("physical page cannot be aliased at this range")]
    CannotAlias,
    #[error("range is not valid for this operation")]
    InvalidRange,
    #[error("unknown or released page handle")]
    InvalidHandle,
    #[error("device driver failure (code {0})")]
    Failure(i32),
}

/// Driver-level operations the allocator is built on.
pub trait DeviceMemoryProvider: Send + Sync {
    /// Minimum mappable unit in bytes. A power of two, constant for the
    /// lifetime of the provider.
    fn granularity(&self) -> u64;

    /// Reserves a contiguous virtual address range of `size` bytes with no
    /// backing memory. The returned address is granularity-aligned and
    /// never null.
    fn reserve(&self, size: u64) -> Result<DevicePtr, ProviderError>;

    /// Releases reserved address space. Every mapping inside the range must
    /// have been unmapped first. Implementations accept any sub-range of
    /// space reserved earlier, so one reservation can be subdivided between
    /// owners and released piecewise.
    fn free(&self, addr: DevicePtr, size: u64) -> Result<(), ProviderError>;

    /// Allocates a physical page of `size` bytes on `device`. `size` is a
    /// positive multiple of the granularity.
    fn create_page(&self, device: DeviceId, size: u64) -> Result<PageHandle, ProviderError>;

    /// Releases a physical page. Idempotent: releasing an already-released
    /// handle is a no-op.
    fn release_page(&self, handle: PageHandle);

    /// Binds `handle` to the `size` bytes of virtual space at `addr`. Fails
    /// if any part of the range is already mapped. Implementations that
    /// cannot bind the same page at a second address over its lifetime
    /// report [`ProviderError::CannotAlias`].
    fn map(&self, addr: DevicePtr, size: u64, handle: PageHandle) -> Result<(), ProviderError>;

    /// Tears down the mapping previously established at exactly
    /// (`addr`, `size`). Must not be called on an unmapped range.
    fn unmap(&self, addr: DevicePtr, size: u64) -> Result<(), ProviderError>;

    /// Grants `access` on the mapped range to `device`.
    fn set_access(
        &self,
        addr: DevicePtr,
        size: u64,
        device: DeviceId,
        access: AccessFlags,
    ) -> Result<(), ProviderError>;

    /// Synchronous device-side copy of `size` bytes between two mapped,
    /// non-overlapping ranges.
    fn copy(&self, dst: DevicePtr, src: DevicePtr, size: u64) -> Result<(), ProviderError>;
}
