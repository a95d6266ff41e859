//! Defines buffers that are used to send and receive packets.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;

use core::{
    ops::Deref,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use alloc::{sync::Arc, vec::Vec};
use spin::Mutex;
use nic_hal::{alloc_checked, DmaAllocator, DmaConstraints, DmaCookie, DmaRegion, PhysicalAddress, SyncDirection};

/// A buffer that packet bytes are copied into before transmission.
///
/// Unlike receive buffers, a transmit buffer may be backed by several physical chunks;
/// [`TransmitBuffer::phys_segments()`] returns one entry per chunk.
/// Auto-dereferences into the bytes appended so far.
pub struct TransmitBuffer {
    region: DmaRegion,
    length: usize,
}

impl TransmitBuffer {
    /// Allocates a new, empty TransmitBuffer that can hold `capacity` bytes.
    pub fn new(dma: &dyn DmaAllocator, capacity: usize) -> Result<TransmitBuffer, &'static str> {
        let region = alloc_checked(dma, capacity, DmaConstraints::TX_BUFFER)?;
        Ok(TransmitBuffer { region, length: 0 })
    }

    pub fn capacity(&self) -> usize {
        self.region.size()
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.length
    }

    /// Copies `bytes` to the end of this buffer.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), &'static str> {
        if bytes.len() > self.remaining() {
            return Err("TransmitBuffer::append(): not enough room in buffer");
        }
        let start = self.length;
        self.region.as_slice_mut()[start..start + bytes.len()].copy_from_slice(bytes);
        self.length += bytes.len();
        Ok(())
    }

    /// Empties the buffer so it can be reused for another packet.
    pub fn reset(&mut self) {
        self.length = 0;
    }

    /// The physical chunks that hold bytes `[offset, offset + len)` of this buffer.
    pub fn phys_segments(&self, offset: usize, len: usize) -> Result<Vec<DmaCookie>, &'static str> {
        if offset + len > self.length {
            return Err("TransmitBuffer::phys_segments(): range exceeds buffer length");
        }
        Ok(self.region.phys_segments(offset, len)?)
    }

    /// Flushes the appended bytes so the device sees them.
    pub fn sync_for_device(&self) -> Result<(), &'static str> {
        if self.length == 0 {
            return Ok(());
        }
        Ok(self.region.sync(0, self.length, SyncDirection::ForDevice)?)
    }
}

impl Deref for TransmitBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.region.as_slice()[..self.length]
    }
}


/// A buffer that stores a packet (a piece of an Ethernet frame) that has been received from the NIC
/// and is guaranteed to be contiguous in physical memory.
/// Auto-dereferences into a byte slice that represents its received bytes.
///
/// The first `padding` bytes of the underlying memory are skipped
/// so that the IP header following a 14-byte Ethernet header lands on a 4-byte boundary.
///
/// When dropped, its underlying memory is automatically returned to its [`RxBufferPool`] for future reuse.
pub struct ReceiveBuffer {
    /// Only `None` while the buffer is being dropped.
    region: Option<DmaRegion>,
    padding: usize,
    length: u16,
    pool: Arc<RxBufferPool>,
}

/// A receive buffer with several owners, e.g., a frame that the stack queued for more than one consumer.
/// The memory goes back to the pool when the last owner drops it.
pub type SharedReceiveBuffer = Arc<ReceiveBuffer>;

impl ReceiveBuffer {
    /// The physical address the device should write the packet to.
    pub fn phys_addr(&self) -> PhysicalAddress {
        self.region.as_ref().map(|r| r.phys_addr() + self.padding).unwrap_or_default()
    }

    /// The maximum number of bytes the device may write to this buffer.
    pub fn capacity(&self) -> usize {
        self.region.as_ref().map_or(0, |r| r.size() - self.padding)
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    /// Sets the buffer's length, i.e., how many bytes the device wrote.
    ///
    /// Returns an error if the length is greater than the buffer's capacity.
    pub fn set_length(&mut self, length: u16) -> Result<(), &'static str> {
        if usize::from(length) > self.capacity() {
            Err("ReceiveBuffer::set_length(): length too long")
        } else {
            self.length = length;
            Ok(())
        }
    }

    /// Makes the bytes the device wrote visible to the CPU.
    pub fn sync_for_cpu(&self) -> Result<(), &'static str> {
        match self.region.as_ref() {
            Some(r) => Ok(r.sync(self.padding, usize::from(self.length), SyncDirection::ForCpu)?),
            None => Err("ReceiveBuffer::sync_for_cpu(): buffer has no memory"),
        }
    }

    pub fn into_shared(self) -> SharedReceiveBuffer {
        Arc::new(self)
    }
}

impl Deref for ReceiveBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match self.region.as_ref() {
            Some(r) => &r.as_slice()[self.padding..self.padding + usize::from(self.length)],
            None => &[],
        }
    }
}

impl Drop for ReceiveBuffer {
    fn drop(&mut self) {
        // trace!("ReceiveBuffer::drop(): length: {:5}, phys_addr: {:#X}", self.length, self.phys_addr());
        if let Some(region) = self.region.take() {
            self.pool.recycle(region);
        }
    }
}


/// A network (e.g., Ethernet) frame that has been received by the NIC.
pub struct ReceivedFrame {
    /// The buffers holding the frame, in order. Only the last one had the end-of-packet bit set.
    pub buffers: Vec<ReceiveBuffer>,
    /// The VLAN tag the hardware stripped from the frame, if any.
    pub vlan_tag: Option<u16>,
}

impl ReceivedFrame {
    /// The total number of bytes in the frame.
    pub fn len(&self) -> usize {
        self.buffers.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the frame out into one contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len());
        for b in &self.buffers {
            bytes.extend_from_slice(b);
        }
        bytes
    }
}


/// The pool that receive buffers are taken from and returned to.
///
/// A pool outlives the rings it feeds: buffers held by the network stack when a ring is torn down
/// still find their way back here. After [`RxBufferPool::close()`], returned buffers are freed instead.
pub struct RxBufferPool {
    free: Mutex<Vec<DmaRegion>>,
    buffer_size: usize,
    padding: usize,
    /// Buffers handed out by [`RxBufferPool::alloc()`] that have not yet been dropped.
    outstanding: AtomicUsize,
    closed: AtomicBool,
}

impl RxBufferPool {
    /// Creates an empty pool of buffers that each hold `buffer_size` bytes,
    /// the first `padding` of which are never written by the device.
    pub fn new(buffer_size: usize, padding: usize) -> Arc<RxBufferPool> {
        Arc::new(RxBufferPool {
            free: Mutex::new(Vec::new()),
            buffer_size,
            padding,
            outstanding: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    /// Allocates `count` more buffers into the pool.
    ///
    /// Either all `count` buffers are added or, on failure, none are.
    pub fn fill(&self, dma: &dyn DmaAllocator, count: usize) -> Result<(), &'static str> {
        let mut fresh = Vec::with_capacity(count);
        for _i in 0..count {
            match alloc_checked(dma, self.buffer_size, DmaConstraints::RX_BUFFER) {
                Ok(region) => fresh.push(region),
                Err(e) => {
                    error!("RxBufferPool::fill(): failed to allocate rx buffer {} of {}: {:?}", _i, count, e);
                    // `fresh` is dropped here, freeing the buffers allocated so far.
                    return Err(e.into());
                }
            }
        }
        self.closed.store(false, Ordering::Release);
        self.free.lock().append(&mut fresh);
        Ok(())
    }

    /// Takes a buffer out of the pool, or `None` if the pool is empty.
    pub fn alloc(self: &Arc<Self>) -> Option<ReceiveBuffer> {
        let region = self.free.lock().pop()?;
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Some(ReceiveBuffer {
            region: Some(region),
            padding: self.padding,
            length: 0,
            pool: Arc::clone(self),
        })
    }

    /// The number of buffers currently sitting in the pool.
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// The number of buffers taken out of the pool and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Frees every buffer in the pool. Outstanding buffers are freed when their owners drop them.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let drained = core::mem::take(&mut *self.free.lock());
        debug!("RxBufferPool::close(): freed {} buffers, {} still outstanding", drained.len(), self.outstanding());
    }

    fn recycle(&self, region: DmaRegion) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if self.closed.load(Ordering::Acquire) {
            return; // `region` is freed here.
        }
        self.free.lock().push(region);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use nic_hal::sim::SimDma;

    #[test]
    fn receive_buffers_return_to_pool() {
        let dma = SimDma::new();
        let pool = RxBufferPool::new(2048, 2);
        pool.fill(&dma, 4).unwrap();
        assert_eq!(pool.free_count(), 4);

        let mut rb = pool.alloc().unwrap();
        assert_eq!(rb.capacity(), 2046);
        assert_eq!(rb.phys_addr().value() % 64, 2);
        rb.set_length(60).unwrap();
        assert_eq!(rb.len(), 60);
        assert!(rb.set_length(4000).is_err());
        assert_eq!(pool.free_count(), 3);
        assert_eq!(pool.outstanding(), 1);

        drop(rb);
        assert_eq!(pool.free_count(), 4);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(dma.live_allocations(), 4);
    }

    #[test]
    fn shared_buffer_returns_on_last_drop() {
        let dma = SimDma::new();
        let pool = RxBufferPool::new(256, 0);
        pool.fill(&dma, 1).unwrap();

        let shared = pool.alloc().unwrap().into_shared();
        let other = Arc::clone(&shared);
        drop(shared);
        assert_eq!(pool.free_count(), 0);
        drop(other);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn closed_pool_frees_late_returns() {
        let dma = SimDma::new();
        let pool = RxBufferPool::new(256, 0);
        pool.fill(&dma, 3).unwrap();
        let held = pool.alloc().unwrap();

        pool.close();
        assert_eq!(dma.live_allocations(), 1);
        drop(held);
        assert_eq!(dma.live_allocations(), 0);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn failed_fill_keeps_nothing() {
        let dma = SimDma::new();
        let pool = RxBufferPool::new(256, 0);
        dma.fail_allocs_after(2);
        assert!(pool.fill(&dma, 5).is_err());
        assert_eq!(pool.free_count(), 0);
        assert_eq!(dma.live_allocations(), 0);
    }

    #[test]
    fn transmit_buffer_segments() {
        let dma = SimDma::with_segment_size(64);
        let mut tb = TransmitBuffer::new(&dma, 256).unwrap();
        tb.append(&[0xAA; 100]).unwrap();
        tb.append(&[0xBB; 20]).unwrap();
        assert_eq!(tb.length(), 120);
        assert_eq!(&tb[98..102], &[0xAA, 0xAA, 0xBB, 0xBB]);

        let segs = tb.phys_segments(0, 120).unwrap();
        assert_eq!(segs.iter().map(|s| s.len).collect::<Vec<_>>(), vec![64, 56]);
        assert!(tb.phys_segments(100, 40).is_err());
        assert!(tb.append(&[0; 200]).is_err());

        tb.reset();
        assert_eq!(tb.length(), 0);
        assert_eq!(tb.remaining(), 256);
    }
}
