//! A simulated hardware layer backed by heap memory.
//!
//! Physical addresses are identical to virtual addresses, so a simulated device
//! can "DMA" by dereferencing the addresses that a driver programs into its registers.
//! Allocations can be split into several cookies and made to fail on demand.

use alloc::{alloc::{alloc_zeroed, dealloc, Layout}, boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use crate::{Clock, DmaAllocator, DmaBinding, DmaConstraints, DmaCookie, DmaMapping, DmaMemory, DmaRegion, HalError, PhysicalAddress, SyncDirection};

struct Counters {
    live_allocations: AtomicUsize,
    live_bindings: AtomicUsize,
    handle_fault: AtomicBool,
    /// Number of syncs that may still succeed.
    syncs_remaining: AtomicUsize,
}

impl Counters {
    fn new() -> Counters {
        Counters {
            live_allocations: AtomicUsize::new(0),
            live_bindings: AtomicUsize::new(0),
            handle_fault: AtomicBool::new(false),
            syncs_remaining: AtomicUsize::new(usize::MAX),
        }
    }

    fn check_sync(&self) -> Result<(), HalError> {
        if self.handle_fault.load(Ordering::SeqCst) {
            return Err(HalError::HandleFault);
        }
        let permitted = self.syncs_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                usize::MAX => Some(n),
                0 => None,
                n => Some(n - 1),
            })
            .is_ok();
        if !permitted {
            return Err(HalError::HandleFault);
        }
        core::sync::atomic::fence(Ordering::SeqCst);
        Ok(())
    }
}

/// A [`DmaAllocator`] that hands out identity-mapped heap memory.
pub struct SimDma {
    /// Non-contiguous allocations are split into cookies of this many bytes, counted from the start.
    /// Zero disables splitting.
    segment_size: usize,
    ignore_contiguity: AtomicBool,
    /// Number of allocations that may still succeed.
    allocs_remaining: AtomicUsize,
    fail_binds: AtomicBool,
    counters: Arc<Counters>,
}

impl SimDma {
    pub fn new() -> SimDma {
        SimDma::with_segment_size(0)
    }

    pub fn with_segment_size(segment_size: usize) -> SimDma {
        SimDma {
            segment_size,
            ignore_contiguity: AtomicBool::new(false),
            allocs_remaining: AtomicUsize::new(usize::MAX),
            fail_binds: AtomicBool::new(false),
            counters: Arc::new(Counters::new()),
        }
    }

    /// Lets the next `count` allocations succeed and fails every one after that.
    pub fn fail_allocs_after(&self, count: usize) {
        self.allocs_remaining.store(count, Ordering::SeqCst);
    }

    pub fn clear_alloc_failures(&self) {
        self.allocs_remaining.store(usize::MAX, Ordering::SeqCst);
    }

    pub fn set_fail_binds(&self, fail: bool) {
        self.fail_binds.store(fail, Ordering::SeqCst);
    }

    /// Splits even contiguous allocations, which a correct platform never does.
    pub fn set_ignore_contiguity(&self, ignore: bool) {
        self.ignore_contiguity.store(ignore, Ordering::SeqCst);
    }

    /// Makes every sync and handle check on every region fail.
    pub fn set_handle_fault(&self, fault: bool) {
        self.counters.handle_fault.store(fault, Ordering::SeqCst);
    }

    /// Lets the next `count` syncs succeed and faults every one after that.
    pub fn fail_syncs_after(&self, count: usize) {
        self.counters.syncs_remaining.store(count, Ordering::SeqCst);
    }

    pub fn clear_sync_failures(&self) {
        self.counters.syncs_remaining.store(usize::MAX, Ordering::SeqCst);
    }

    pub fn live_allocations(&self) -> usize {
        self.counters.live_allocations.load(Ordering::SeqCst)
    }

    pub fn live_bindings(&self) -> usize {
        self.counters.live_bindings.load(Ordering::SeqCst)
    }

    fn split(&self, start: u64, len: usize, contiguous: bool) -> Vec<DmaCookie> {
        let seg = self.segment_size;
        if seg == 0 || (contiguous && !self.ignore_contiguity.load(Ordering::SeqCst)) {
            return alloc::vec![DmaCookie { addr: PhysicalAddress::new(start), len }];
        }
        let mut cookies = Vec::new();
        let mut addr = start;
        let end = start + len as u64;
        while addr < end {
            let next = core::cmp::min(addr + seg as u64, end);
            cookies.push(DmaCookie { addr: PhysicalAddress::new(addr), len: (next - addr) as usize });
            addr = next;
        }
        cookies
    }
}

impl Default for SimDma {
    fn default() -> Self {
        SimDma::new()
    }
}

struct SimMemory {
    ptr: *mut u8,
    layout: Layout,
    cookies: Vec<DmaCookie>,
    counters: Arc<Counters>,
}

// SAFETY: the pointer is uniquely owned by this object and only freed on drop.
unsafe impl Send for SimMemory {}
unsafe impl Sync for SimMemory {}

impl DmaMemory for SimMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    fn size(&self) -> usize {
        self.layout.size()
    }

    fn cookies(&self) -> &[DmaCookie] {
        &self.cookies
    }

    fn sync(&self, _offset: usize, _len: usize, _direction: SyncDirection) -> Result<(), HalError> {
        self.counters.check_sync()
    }

    fn check_handle(&self) -> Result<(), HalError> {
        if self.counters.handle_fault.load(Ordering::SeqCst) {
            Err(HalError::HandleFault)
        } else {
            Ok(())
        }
    }
}

impl Drop for SimMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `alloc_dma` with this exact layout.
        unsafe { dealloc(self.ptr, self.layout) };
        self.counters.live_allocations.fetch_sub(1, Ordering::SeqCst);
    }
}

struct SimBinding {
    cookies: Vec<DmaCookie>,
    counters: Arc<Counters>,
}

impl DmaMapping for SimBinding {
    fn cookies(&self) -> &[DmaCookie] {
        &self.cookies
    }

    fn sync(&self, _direction: SyncDirection) -> Result<(), HalError> {
        self.counters.check_sync()
    }
}

impl Drop for SimBinding {
    fn drop(&mut self) {
        self.counters.live_bindings.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DmaAllocator for SimDma {
    fn alloc_dma(&self, size: usize, constraints: DmaConstraints) -> Result<DmaRegion, HalError> {
        let permitted = self.allocs_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                usize::MAX => Some(n),
                0 => None,
                n => Some(n - 1),
            })
            .is_ok();
        if !permitted || size == 0 {
            return Err(HalError::NoMemory);
        }
        let layout = Layout::from_size_align(size, constraints.align.max(1))
            .map_err(|_| HalError::ConstraintViolation)?;
        // SAFETY: `size` is non-zero.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(HalError::NoMemory);
        }
        self.counters.live_allocations.fetch_add(1, Ordering::SeqCst);
        let cookies = self.split(ptr as u64, size, constraints.contiguous);
        Ok(DmaRegion::new(Box::new(SimMemory { ptr, layout, cookies, counters: self.counters.clone() })))
    }

    unsafe fn bind_dma(&self, ptr: *const u8, len: usize) -> Result<DmaBinding, HalError> {
        if self.fail_binds.load(Ordering::SeqCst) || len == 0 {
            return Err(HalError::MappingFailed);
        }
        self.counters.live_bindings.fetch_add(1, Ordering::SeqCst);
        let cookies = self.split(ptr as u64, len, false);
        Ok(DmaBinding::new(Box::new(SimBinding { cookies, counters: self.counters.clone() })))
    }
}

/// A virtual clock. Delays advance time instantly instead of spinning.
#[derive(Default)]
pub struct SimClock {
    now: AtomicU64,
}

impl SimClock {
    pub fn new() -> SimClock {
        SimClock { now: AtomicU64::new(0) }
    }

    pub fn advance(&self, us: u64) {
        self.now.fetch_add(us, Ordering::SeqCst);
    }
}

impl Clock for SimClock {
    fn now_us(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn delay_us(&self, us: u64) {
        self.advance(us.max(1));
    }
}
