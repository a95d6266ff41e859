//! The hardware-facing primitives that a NIC driver is written against:
//! register access, DMA memory allocation and binding, cache synchronization, and a microsecond clock.
//!
//! A driver never touches page tables or PCI config space directly.
//! Instead it receives implementations of [`RegisterAccess`], [`DmaAllocator`], and [`Clock`]
//! from whoever discovered the device, which keeps the driver testable against the [`sim`] backend.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

use alloc::{boxed::Box, vec::Vec};
use core::{fmt, ops::Add};

/// A physical (bus) address as seen by the device.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> PhysicalAddress {
        PhysicalAddress(addr)
    }

    pub const fn zero() -> PhysicalAddress {
        PhysicalAddress(0)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl Add<usize> for PhysicalAddress {
    type Output = PhysicalAddress;
    fn add(self, rhs: usize) -> PhysicalAddress {
        PhysicalAddress(self.0 + rhs as u64)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "p{:#X}", self.0)
    }
}
impl fmt::UpperHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}
impl fmt::LowerHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// One physically-contiguous piece of a DMA mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaCookie {
    pub addr: PhysicalAddress,
    pub len: usize,
}

/// The direction of a cache synchronization on DMA memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncDirection {
    /// The CPU wrote to the memory and the device is about to read it.
    ForDevice,
    /// The device wrote to the memory and the CPU is about to read it.
    ForCpu,
}

/// Requirements on a DMA allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaConstraints {
    /// Required alignment of the starting physical address, in bytes.
    pub align: usize,
    /// If true, the allocation must be backed by a single [`DmaCookie`].
    pub contiguous: bool,
}

impl DmaConstraints {
    /// Descriptor rings: 128-byte aligned and physically contiguous.
    pub const RING: DmaConstraints = DmaConstraints { align: 128, contiguous: true };
    /// Receive buffers are handed to the device as a single address.
    pub const RX_BUFFER: DmaConstraints = DmaConstraints { align: 64, contiguous: true };
    /// Transmit copy buffers may span several physical chunks.
    pub const TX_BUFFER: DmaConstraints = DmaConstraints { align: 64, contiguous: false };
}

/// The ways in which the hardware layer can fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HalError {
    /// Not enough DMA-able memory to satisfy the allocation.
    NoMemory,
    /// Memory could not be bound for device access.
    MappingFailed,
    /// The register window no longer responds (e.g., the device was surprise-removed).
    AccessFault,
    /// A DMA handle was found to be invalid during a sync or integrity check.
    HandleFault,
    /// An offset or length fell outside of a DMA region.
    InvalidRange,
    /// An allocation did not satisfy the requested constraints.
    ConstraintViolation,
}

impl From<HalError> for &'static str {
    fn from(error: HalError) -> Self {
        match error {
            HalError::NoMemory => "out of DMA memory",
            HalError::MappingFailed => "failed to bind memory for DMA",
            HalError::AccessFault => "device register access fault",
            HalError::HandleFault => "invalid DMA handle",
            HalError::InvalidRange => "offset or length outside of DMA region",
            HalError::ConstraintViolation => "DMA allocation violates the requested constraints",
        }
    }
}

/// Memory allocated by a [`DmaAllocator`]. Freed when dropped.
pub trait DmaMemory: Send + Sync {
    /// The CPU-visible starting address of this memory.
    fn as_ptr(&self) -> *mut u8;
    /// The size of this memory in bytes.
    fn size(&self) -> usize;
    /// The physical chunks backing this memory, in order.
    fn cookies(&self) -> &[DmaCookie];
    /// Synchronizes the CPU's and the device's view of `len` bytes starting at `offset`.
    fn sync(&self, offset: usize, len: usize, direction: SyncDirection) -> Result<(), HalError>;
    /// Verifies that the underlying DMA handle is still valid.
    fn check_handle(&self) -> Result<(), HalError>;
}

/// A region of DMA-able memory, owned by the driver.
///
/// Backed by one or more physical chunks ("cookies");
/// descriptor rings require exactly one, see [`DmaRegion::is_contiguous()`].
pub struct DmaRegion {
    mem: Box<dyn DmaMemory>,
}

impl DmaRegion {
    pub fn new(mem: Box<dyn DmaMemory>) -> DmaRegion {
        DmaRegion { mem }
    }

    pub fn size(&self) -> usize {
        self.mem.size()
    }

    /// The starting physical address of this region.
    pub fn phys_addr(&self) -> PhysicalAddress {
        self.mem.cookies().first().map(|c| c.addr).unwrap_or_default()
    }

    pub fn cookies(&self) -> &[DmaCookie] {
        self.mem.cookies()
    }

    pub fn is_contiguous(&self) -> bool {
        self.mem.cookies().len() == 1
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.mem.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the backing memory is valid for `size()` bytes for the lifetime of `self.mem`.
        unsafe { core::slice::from_raw_parts(self.mem.as_ptr(), self.mem.size()) }
    }

    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive CPU access.
        unsafe { core::slice::from_raw_parts_mut(self.mem.as_ptr(), self.mem.size()) }
    }

    /// Returns the physical chunks that back the byte range `[offset, offset + len)`.
    ///
    /// A range that crosses a cookie boundary is split into one entry per chunk.
    pub fn phys_segments(&self, offset: usize, len: usize) -> Result<Vec<DmaCookie>, HalError> {
        let end = offset.checked_add(len).ok_or(HalError::InvalidRange)?;
        if end > self.size() {
            return Err(HalError::InvalidRange);
        }
        let mut segments = Vec::new();
        let mut cookie_start = 0;
        for cookie in self.mem.cookies() {
            let cookie_end = cookie_start + cookie.len;
            let lo = core::cmp::max(offset, cookie_start);
            let hi = core::cmp::min(end, cookie_end);
            if lo < hi {
                segments.push(DmaCookie { addr: cookie.addr + (lo - cookie_start), len: hi - lo });
            }
            if cookie_end >= end {
                break;
            }
            cookie_start = cookie_end;
        }
        Ok(segments)
    }

    /// Synchronizes `len` bytes starting at `offset`.
    pub fn sync(&self, offset: usize, len: usize, direction: SyncDirection) -> Result<(), HalError> {
        if offset.checked_add(len).map_or(true, |end| end > self.size()) {
            return Err(HalError::InvalidRange);
        }
        self.mem.sync(offset, len, direction)
    }

    /// Synchronizes the whole region.
    pub fn sync_all(&self, direction: SyncDirection) -> Result<(), HalError> {
        self.mem.sync(0, self.mem.size(), direction)
    }

    pub fn check_handle(&self) -> Result<(), HalError> {
        self.mem.check_handle()
    }
}

impl fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DmaRegion {{ size: {}, cookies: {:?} }}", self.size(), self.cookies())
    }
}

/// Memory owned by someone else that has been made visible to the device.
pub trait DmaMapping: Send + Sync {
    fn cookies(&self) -> &[DmaCookie];
    fn sync(&self, direction: SyncDirection) -> Result<(), HalError>;
}

/// A live device binding of caller-owned memory.
/// The memory is unbound when this is dropped.
pub struct DmaBinding {
    inner: Box<dyn DmaMapping>,
}

impl DmaBinding {
    pub fn new(inner: Box<dyn DmaMapping>) -> DmaBinding {
        DmaBinding { inner }
    }

    pub fn cookies(&self) -> &[DmaCookie] {
        self.inner.cookies()
    }

    pub fn sync(&self, direction: SyncDirection) -> Result<(), HalError> {
        self.inner.sync(direction)
    }
}

impl fmt::Debug for DmaBinding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DmaBinding {{ cookies: {:?} }}", self.cookies())
    }
}

/// Access to the device's memory-mapped register window.
///
/// Offsets are in bytes from the start of the window.
pub trait RegisterAccess: Send + Sync {
    fn read_reg(&self, offset: u32) -> u32;
    fn write_reg(&self, offset: u32, value: u32);
    /// Verifies that the register window is still reachable.
    fn check_access(&self) -> Result<(), HalError>;
}

/// Allocation of DMA memory and binding of existing memory for DMA.
pub trait DmaAllocator: Send + Sync {
    /// Allocates `size` bytes of zeroed DMA-able memory.
    fn alloc_dma(&self, size: usize, constraints: DmaConstraints) -> Result<DmaRegion, HalError>;

    /// Makes the `len` bytes at `ptr` visible to the device.
    ///
    /// # Safety
    /// The memory at `ptr` must remain valid and must not move until the returned
    /// [`DmaBinding`] is dropped.
    unsafe fn bind_dma(&self, ptr: *const u8, len: usize) -> Result<DmaBinding, HalError>;
}

/// A monotonic microsecond clock with a bounded busy-wait.
pub trait Clock: Send + Sync {
    fn now_us(&self) -> u64;
    fn delay_us(&self, us: u64);
}

/// Allocates a region and checks it against `constraints`, logging the failure cause.
pub fn alloc_checked(
    dma: &dyn DmaAllocator,
    size: usize,
    constraints: DmaConstraints,
) -> Result<DmaRegion, HalError> {
    let region = dma.alloc_dma(size, constraints).map_err(|e| {
        warn!("nic_hal::alloc_checked(): failed to allocate {} bytes: {:?}", size, e);
        e
    })?;
    if constraints.contiguous && !region.is_contiguous() {
        error!("nic_hal::alloc_checked(): {} byte region came back in {} pieces", size, region.cookies().len());
        return Err(HalError::ConstraintViolation);
    }
    if region.phys_addr().value() % constraints.align as u64 != 0 {
        error!("nic_hal::alloc_checked(): region at {:#X} is not {}-byte aligned", region.phys_addr(), constraints.align);
        return Err(HalError::ConstraintViolation);
    }
    Ok(region)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDma;

    #[test]
    fn phys_segments_split_at_cookie_boundaries() {
        let dma = SimDma::with_segment_size(256);
        let region = dma.alloc_dma(1024, DmaConstraints::TX_BUFFER).unwrap();
        assert_eq!(region.cookies().len(), 4);

        let segments = region.phys_segments(200, 100).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].addr, region.phys_addr() + 200);
        assert_eq!(segments[0].len, 56);
        assert_eq!(segments[1].addr, region.phys_addr() + 256);
        assert_eq!(segments[1].len, 44);

        let whole = region.phys_segments(0, 1024).unwrap();
        assert_eq!(whole.iter().map(|s| s.len).sum::<usize>(), 1024);
        assert_eq!(region.phys_segments(1000, 100), Err(HalError::InvalidRange));
    }

    #[test]
    fn alloc_checked_rejects_fragmented_rings() {
        let dma = SimDma::with_segment_size(128);
        let ring = alloc_checked(&dma, 512, DmaConstraints::RING).unwrap();
        assert!(ring.is_contiguous());

        dma.set_ignore_contiguity(true);
        let err = alloc_checked(&dma, 512, DmaConstraints::RING).map(|_| ());
        assert_eq!(err, Err(HalError::ConstraintViolation));

        drop(ring);
        assert_eq!(dma.live_allocations(), 0);
    }

    #[test]
    fn regions_are_zeroed_and_freed() {
        let dma = SimDma::new();
        {
            let mut region = dma.alloc_dma(64, DmaConstraints::RX_BUFFER).unwrap();
            assert!(region.as_slice().iter().all(|b| *b == 0));
            region.as_slice_mut()[3] = 0xAB;
            assert_eq!(region.as_slice()[3], 0xAB);
            assert_eq!(dma.live_allocations(), 1);
        }
        assert_eq!(dma.live_allocations(), 0);
    }
}
