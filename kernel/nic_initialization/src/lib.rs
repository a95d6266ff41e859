//! Functions that are used in a NIC initialization procedure.
//!
//! They include allocating descriptor rings and receive buffer pools, and programming a queue's ring registers.
//! Every function here either returns fully-built resources or releases whatever it allocated before failing.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;

use core::marker::PhantomData;
use alloc::{sync::Arc, vec::Vec};
use nic_hal::{alloc_checked, DmaAllocator, DmaConstraints, DmaRegion, HalError, PhysicalAddress, SyncDirection};
use intel_ethernet::descriptors::{RxDescriptor, TxDescriptor, DESCRIPTOR_SIZE};
use nic_buffers::{ReceiveBuffer, RxBufferPool};

/// The smallest ring the hardware accepts. Ring lengths must also be a multiple of this
/// so that the ring's size in bytes is a multiple of 128.
pub const RING_SIZE_GRANULARITY: usize = 8;

/// The registers needed to set up a receive queue.
pub trait RxQueueRegisters {
    fn set_rdbal(&mut self, value: u32);
    fn set_rdbah(&mut self, value: u32);
    fn set_rdlen(&mut self, value: u32);
    fn set_rdh(&mut self, value: u32);
    fn set_rdt(&mut self, value: u32);
}

/// The registers needed to set up a transmit queue.
pub trait TxQueueRegisters {
    fn set_tdbal(&mut self, value: u32);
    fn set_tdbah(&mut self, value: u32);
    fn set_tdlen(&mut self, value: u32);
    fn set_tdh(&mut self, value: u32);
    fn set_tdt(&mut self, value: u32);
}

/// A physically-contiguous array of `T` descriptors that the device reads and writes.
///
/// The ring may have extra 16-byte slots past its last descriptor,
/// e.g., to receive the transmit head write-back value. Those slots are not part of the ring length
/// reported to the device.
pub struct DescriptorRing<T> {
    region: DmaRegion,
    num_desc: usize,
    extra_slots: usize,
    _descriptor: PhantomData<T>,
}

impl<T> DescriptorRing<T> {
    pub fn num_desc(&self) -> usize {
        self.num_desc
    }

    pub fn phys_addr(&self) -> PhysicalAddress {
        self.region.phys_addr()
    }

    /// The length in bytes of the descriptor array, excluding extra slots.
    pub fn size_in_bytes(&self) -> usize {
        self.num_desc * DESCRIPTOR_SIZE
    }

    /// The physical address of extra slot `i`.
    pub fn extra_slot_phys_addr(&self, i: usize) -> Option<PhysicalAddress> {
        (i < self.extra_slots).then(|| self.phys_addr() + self.size_in_bytes() + i * DESCRIPTOR_SIZE)
    }

    /// Reads the first 32 bits of extra slot `i`.
    pub fn read_extra_slot(&self, i: usize) -> Option<u32> {
        if i >= self.extra_slots {
            return None;
        }
        let offset = self.size_in_bytes() + i * DESCRIPTOR_SIZE;
        // SAFETY: the offset is within the region and 16-byte aligned.
        Some(unsafe { core::ptr::read_volatile(self.region.as_ptr().add(offset) as *const u32) })
    }

    /// Clears the contents of every extra slot.
    pub fn clear_extra_slots(&self) {
        for i in 0..self.extra_slots {
            let offset = self.size_in_bytes() + i * DESCRIPTOR_SIZE;
            // SAFETY: as above.
            unsafe { core::ptr::write_bytes(self.region.as_ptr().add(offset), 0, DESCRIPTOR_SIZE) };
        }
    }

    /// Returns the descriptor at `index`, which is taken modulo the ring size.
    pub fn desc(&self, index: usize) -> &T {
        // SAFETY: the region holds `num_desc` properly-aligned `T`s, initialized at allocation.
        unsafe { &*(self.region.as_ptr() as *const T).add(index % self.num_desc) }
    }

    /// Returns the descriptor at `index` for writing.
    ///
    /// # Safety
    /// The caller must ensure no other reference to the same slot exists,
    /// which the TX path guarantees by only writing slots it reserved under the ring lock.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn desc_mut(&self, index: usize) -> &mut T {
        &mut *(self.region.as_ptr() as *mut T).add(index % self.num_desc)
    }

    pub fn sync(&self, direction: SyncDirection) -> Result<(), HalError> {
        self.region.sync_all(direction)
    }

    pub fn check_handle(&self) -> Result<(), HalError> {
        self.region.check_handle()
    }
}

/// Allocates a zeroed ring of `num_desc` descriptors plus `extra_slots` trailing slots.
pub fn allocate_ring<T>(dma: &dyn DmaAllocator, num_desc: usize, extra_slots: usize) -> Result<DescriptorRing<T>, &'static str> {
    if core::mem::size_of::<T>() != DESCRIPTOR_SIZE {
        return Err("nic_initialization::allocate_ring(): descriptor type is not 16 bytes");
    }
    if num_desc < RING_SIZE_GRANULARITY || num_desc % RING_SIZE_GRANULARITY != 0 || num_desc > u16::MAX as usize {
        error!("nic_initialization::allocate_ring(): invalid ring size {}", num_desc);
        return Err("nic_initialization::allocate_ring(): ring size must be a multiple of 8");
    }
    // Descriptor rings must be 128 byte-aligned and in one physical piece.
    let region = alloc_checked(dma, (num_desc + extra_slots) * DESCRIPTOR_SIZE, DmaConstraints::RING)?;
    Ok(DescriptorRing { region, num_desc, extra_slots, _descriptor: PhantomData })
}

/// Initialize the receive buffer pool from where receive buffers are taken and returned
///
/// # Arguments
/// * `dma`: the allocator for the buffers' memory
/// * `num_rx_buffers`: number of buffers that are initially added to the pool
/// * `buffer_size`: size of the receive buffers in bytes
/// * `padding`: bytes at the start of each buffer that the device never writes
pub fn init_rx_buf_pool(dma: &dyn DmaAllocator, num_rx_buffers: usize, buffer_size: usize, padding: usize) -> Result<Arc<RxBufferPool>, &'static str> {
    if padding >= buffer_size {
        return Err("nic_initialization::init_rx_buf_pool(): padding larger than buffer");
    }
    let pool = RxBufferPool::new(buffer_size, padding);
    pool.fill(dma, num_rx_buffers)?;
    Ok(pool)
}

/// Steps to create and initialize a receive descriptor queue
///
/// # Arguments
/// * `dma`: the allocator for the ring's memory
/// * `num_desc`: number of descriptors in the queue
/// * `rx_buffer_pool`: pool from which to take receive buffers; it is grown if it runs dry
///
/// On failure, any buffers taken go back to the pool and the ring is freed.
pub fn init_rx_queue<T: RxDescriptor>(dma: &dyn DmaAllocator, num_desc: usize, rx_buffer_pool: &Arc<RxBufferPool>)
    -> Result<(DescriptorRing<T>, Vec<ReceiveBuffer>), &'static str>
{
    let ring = allocate_ring::<T>(dma, num_desc, 0)?;

    // now that we've created the rx descriptors, we can fill them in with initial values
    let mut rx_bufs_in_use: Vec<ReceiveBuffer> = Vec::with_capacity(num_desc);
    for i in 0..num_desc {
        // obtain or create a receive buffer for each rx_desc
        let rx_buf = match rx_buffer_pool.alloc() {
            Some(rb) => rb,
            None => {
                rx_buffer_pool.fill(dma, 1)?;
                rx_buffer_pool.alloc().ok_or("nic_initialization::init_rx_queue(): couldn't obtain a ReceiveBuffer from the pool")?
            }
        };
        // SAFETY: the ring was just allocated and is not shared yet.
        unsafe { ring.desc_mut(i) }.init(rx_buf.phys_addr());
        rx_bufs_in_use.push(rx_buf);
    }

    Ok((ring, rx_bufs_in_use))
}

/// Steps to create and initialize a transmit descriptor queue
///
/// # Arguments
/// * `dma`: the allocator for the ring's memory
/// * `num_desc`: number of descriptors in the queue
/// * `extra_slots`: trailing slots past the last descriptor, e.g. for the head write-back value
pub fn init_tx_queue<T: TxDescriptor>(dma: &dyn DmaAllocator, num_desc: usize, extra_slots: usize) -> Result<DescriptorRing<T>, &'static str> {
    let ring = allocate_ring::<T>(dma, num_desc, extra_slots)?;
    reset_tx_descriptors(&ring);
    Ok(ring)
}

/// Clears every transmit descriptor and extra slot so the ring can be handed to the device again.
pub fn reset_tx_descriptors<T: TxDescriptor>(ring: &DescriptorRing<T>) {
    for i in 0..ring.num_desc() {
        // SAFETY: callers only reset rings the device is not using.
        unsafe { ring.desc_mut(i) }.init();
    }
    ring.clear_extra_slots();
}

/// Writes a receive ring's location and length into the queue registers, with head and tail at 0.
pub fn program_rx_queue<T, S: RxQueueRegisters>(ring: &DescriptorRing<T>, rxq_regs: &mut S) {
    let rx_desc_phys_addr_lower  = ring.phys_addr().value() as u32;
    let rx_desc_phys_addr_higher = (ring.phys_addr().value() >> 32) as u32;

    // write the physical address of the rx descs ring
    rxq_regs.set_rdbal(rx_desc_phys_addr_lower);
    rxq_regs.set_rdbah(rx_desc_phys_addr_higher);

    // write the length (in total bytes) of the rx descs array
    rxq_regs.set_rdlen(ring.size_in_bytes() as u32);

    // Write the head index (the first receive descriptor)
    rxq_regs.set_rdh(0);
    rxq_regs.set_rdt(0);
}

/// Writes a transmit ring's location and length into the queue registers, with head and tail at 0.
pub fn program_tx_queue<T, S: TxQueueRegisters>(ring: &DescriptorRing<T>, txq_regs: &mut S) {
    let tx_desc_phys_addr_lower  = ring.phys_addr().value() as u32;
    let tx_desc_phys_addr_higher = (ring.phys_addr().value() >> 32) as u32;

    // write the physical address of the tx descs array
    txq_regs.set_tdbal(tx_desc_phys_addr_lower);
    txq_regs.set_tdbah(tx_desc_phys_addr_higher);

    // write the length (in total bytes) of the tx descs array
    txq_regs.set_tdlen(ring.size_in_bytes() as u32);

    // write the head index and the tail index (both 0 initially because there are no tx requests yet)
    txq_regs.set_tdh(0);
    txq_regs.set_tdt(0);
}
