//! Transmit control blocks: the software record of which descriptors carry which bytes.

use alloc::{boxed::Box, vec::Vec};
use nic_buffers::TransmitBuffer;
use nic_hal::{DmaAllocator, DmaBinding, DmaCookie, HalError, SyncDirection};
use crate::{config::MAX_DATA_PER_TX_DESC, packet::Packet};

/// How a control block's bytes reach the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TcbType {
    /// Not yet used for the current packet.
    Unset,
    /// Bytes were copied into the block's own transmit buffer.
    Copy,
    /// The caller's fragment was bound for DMA in place.
    DmaBound,
}

/// One control block. A packet occupies one or more of them.
///
/// A block lives on exactly one of the ring's free list, its work list,
/// or the transient list of a send or reclaim in progress.
pub struct TxControlBlock {
    pub(crate) kind: TcbType,
    pub(crate) buffer: TransmitBuffer,
    /// The (address, length) pairs this block puts into descriptors, in order.
    pub(crate) segments: Vec<DmaCookie>,
    pub(crate) bindings: Vec<DmaBinding>,
    /// Descriptors this block occupies, including a context descriptor in front of the packet's first block.
    pub(crate) desc_num: usize,
    /// Ring index of this block's first descriptor.
    pub(crate) first_index: usize,
    /// Ring index of the last descriptor of the packet this block belongs to.
    pub(crate) last_index: usize,
    /// Held by the packet's last block so bound fragments stay valid until completion.
    pub(crate) packet: Option<Packet>,
    pub(crate) timestamp_us: u64,
}

impl TxControlBlock {
    pub fn new(dma: &dyn DmaAllocator, buffer_size: usize) -> Result<Box<TxControlBlock>, &'static str> {
        Ok(Box::new(TxControlBlock {
            kind: TcbType::Unset,
            buffer: TransmitBuffer::new(dma, buffer_size)?,
            segments: Vec::new(),
            bindings: Vec::new(),
            desc_num: 0,
            first_index: 0,
            last_index: 0,
            packet: None,
            timestamp_us: 0,
        }))
    }

    /// True if `len` more bytes can be copied into this block.
    pub(crate) fn can_copy(&self, len: usize) -> bool {
        matches!(self.kind, TcbType::Unset | TcbType::Copy) && self.buffer.remaining() >= len
    }

    pub(crate) fn copy_in(&mut self, bytes: &[u8]) -> Result<(), &'static str> {
        self.buffer.append(bytes)?;
        self.kind = TcbType::Copy;
        Ok(())
    }

    /// Binds `bytes` for DMA. The bytes must stay in place until [`Self::reset()`] drops the binding.
    pub(crate) fn bind(&mut self, dma: &dyn DmaAllocator, bytes: &[u8]) -> Result<(), HalError> {
        // SAFETY: the fragment belongs to the packet that the packet's last block holds
        // until this block is reset, and heap fragments don't move when the packet does.
        let binding = unsafe { dma.bind_dma(bytes.as_ptr(), bytes.len())? };
        binding.sync(SyncDirection::ForDevice)?;
        for cookie in binding.cookies() {
            push_split(&mut self.segments, *cookie);
        }
        self.bindings.push(binding);
        self.kind = TcbType::DmaBound;
        Ok(())
    }

    /// Turns the copied bytes into segments and flushes them to the device.
    /// Returns the number of data descriptors this block needs.
    pub(crate) fn finish(&mut self) -> Result<usize, &'static str> {
        if self.kind == TcbType::Copy {
            self.segments = self.buffer.phys_segments(0, self.buffer.length())?;
            self.buffer.sync_for_device()?;
        }
        Ok(self.segments.len())
    }

    /// The number of payload bytes this block carries.
    #[cfg(test)]
    pub(crate) fn byte_len(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }

    /// Clears the block for reuse, releasing its DMA bindings and then its packet.
    pub(crate) fn reset(&mut self) {
        self.bindings.clear();
        self.packet = None;
        self.segments.clear();
        self.buffer.reset();
        self.kind = TcbType::Unset;
        self.desc_num = 0;
        self.first_index = 0;
        self.last_index = 0;
        self.timestamp_us = 0;
    }
}

impl core::fmt::Debug for TxControlBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{{kind: {:?}, desc_num: {}, first: {}, last: {}, segments: {}, has_packet: {}}}",
            self.kind, self.desc_num, self.first_index, self.last_index, self.segments.len(), self.packet.is_some())
    }
}

/// Appends `cookie`, split so that no piece exceeds what one data descriptor can carry.
fn push_split(segments: &mut Vec<DmaCookie>, cookie: DmaCookie) {
    let mut offset = 0;
    while offset < cookie.len {
        let len = core::cmp::min(cookie.len - offset, MAX_DATA_PER_TX_DESC);
        segments.push(DmaCookie { addr: cookie.addr + offset, len });
        offset += len;
    }
}

/// Allocates `count` control blocks, freeing them all if any allocation fails.
pub(crate) fn alloc_control_blocks(dma: &dyn DmaAllocator, count: usize, buffer_size: usize) -> Result<Vec<Box<TxControlBlock>>, &'static str> {
    let mut tcbs = Vec::with_capacity(count);
    for _ in 0..count {
        tcbs.push(TxControlBlock::new(dma, buffer_size)?);
    }
    Ok(tcbs)
}


#[cfg(test)]
mod tests {
    use super::*;
    use nic_hal::sim::SimDma;

    #[test]
    fn copy_then_reset() {
        let dma = SimDma::with_segment_size(64);
        let mut tcb = TxControlBlock::new(&dma, 256).unwrap();
        assert!(tcb.can_copy(256));
        tcb.copy_in(&[7; 100]).unwrap();
        assert_eq!(tcb.kind, TcbType::Copy);
        assert_eq!(tcb.finish().unwrap(), 2);
        assert_eq!(tcb.byte_len(), 100);
        assert!(!tcb.can_copy(200));

        tcb.reset();
        assert_eq!(tcb.kind, TcbType::Unset);
        assert!(tcb.segments.is_empty());
        assert!(tcb.can_copy(256));
    }

    #[test]
    fn bound_blocks_release_bindings_on_reset() {
        let dma = SimDma::with_segment_size(512);
        let data = alloc::vec![1u8; 1500];
        let mut tcb = TxControlBlock::new(&dma, 256).unwrap();
        tcb.bind(&dma, &data).unwrap();
        assert_eq!(tcb.kind, TcbType::DmaBound);
        assert!(!tcb.can_copy(1));
        assert_eq!(tcb.finish().unwrap(), 3);
        assert_eq!(dma.live_bindings(), 1);
        tcb.reset();
        assert_eq!(dma.live_bindings(), 0);
    }

    #[test]
    fn large_bindings_are_split_per_descriptor() {
        let dma = SimDma::new();
        let data = alloc::vec![0u8; 40 * 1024];
        let mut tcb = TxControlBlock::new(&dma, 256).unwrap();
        tcb.bind(&dma, &data).unwrap();
        assert_eq!(tcb.finish().unwrap(), 3);
        assert_eq!(tcb.byte_len(), 40 * 1024);
        assert!(tcb.segments.iter().all(|s| s.len <= MAX_DATA_PER_TX_DESC));
    }

    #[test]
    fn failed_allocation_frees_everything() {
        let dma = SimDma::new();
        dma.fail_allocs_after(3);
        assert!(alloc_control_blocks(&dma, 5, 128).is_err());
        assert_eq!(dma.live_allocations(), 0);
    }
}
