//! Tunables of the VF driver and the hard limits they are checked against.

use crate::regs::MAX_MSIX_VECTORS;

/// The smallest ring the hardware accepts.
pub const MIN_RING_SIZE: usize = 8;
pub const MAX_RING_SIZE: usize = 4096;
/// The most data descriptors the hardware accepts for one packet.
pub const MAX_TX_DESC_PER_PACKET: usize = 32;
/// The most bytes one transmit data descriptor may point to.
pub const MAX_DATA_PER_TX_DESC: usize = 16 * 1024;
/// The most transmit or receive rings a VF can be given.
pub const MAX_RING_PAIRS: usize = 8;
pub const MIN_MTU: u32 = 68;
pub const MAX_MTU: u32 = 9710;
pub const DEFAULT_MTU: u32 = 1500;
/// The most multicast hashes the PF accepts in one request.
pub const MAX_MULTICAST_ADDRS: usize = 30;
/// The most VLAN filters a VF may request.
pub const MAX_VLAN_FILTERS: usize = 64;
/// Ethernet header, one VLAN tag, and the FCS.
pub const FRAME_OVERHEAD: u32 = 14 + 4 + 4;

/// How transmit completions are detected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReclaimStrategy {
    /// Check the descriptor-done bit on the last descriptor of every outstanding packet.
    Legacy,
    /// Compare against the head index that the hardware writes into host memory.
    HeadWriteBack,
}

/// Configuration of one VF instance.
#[derive(Clone, Debug)]
pub struct VfConfig {
    pub tx_ring_size: usize,
    pub rx_ring_size: usize,
    /// Requested ring counts; the PF may grant fewer.
    pub tx_rings: usize,
    pub rx_rings: usize,
    /// Fragments shorter than this are copied instead of bound for DMA.
    pub tx_copy_thresh: usize,
    /// Reclaim before sending when fewer than this many descriptors are free.
    pub tx_recycle_thresh: usize,
    /// Report busy when fewer than this many descriptors are free after reclaiming.
    pub tx_overload_thresh: usize,
    /// Tell the stack to resume once this many descriptors are free again.
    pub tx_resched_thresh: usize,
    pub tx_desc_limit: usize,
    /// Size of every control block's copy buffer.
    pub tx_buffer_size: usize,
    /// Number of control blocks per ring. Zero picks one and a half times the ring size.
    pub tx_control_blocks: usize,
    pub reclaim_strategy: ReclaimStrategy,
    /// Bytes skipped at the start of every receive buffer to align the IP header.
    pub rx_buffer_padding: usize,
    /// Receive buffers allocated beyond those needed to fill every ring.
    pub rx_pool_extra: usize,
    /// The most frames delivered per ring per interrupt.
    pub rx_budget: usize,
    pub min_vectors: usize,
    pub max_vectors: usize,
    pub mailbox_timeout_us: u64,
    pub mailbox_poll_us: u64,
    /// How long stop waits for in-flight sends and completions.
    pub drain_timeout_us: u64,
    pub drain_poll_us: u64,
    /// Age of the oldest outstanding transmit after which a ring without progress is stalled.
    pub stall_threshold_us: u64,
    /// Automatic resets beyond this many leave the device in the error state.
    pub max_resets: u32,
    /// How many times MAC address acquisition restarts when the PF reports a concurrent change.
    pub max_mac_restarts: u32,
    pub mtu: u32,
}

impl Default for VfConfig {
    fn default() -> Self {
        VfConfig {
            tx_ring_size: 1024,
            rx_ring_size: 1024,
            tx_rings: MAX_RING_PAIRS,
            rx_rings: MAX_RING_PAIRS,
            tx_copy_thresh: 512,
            tx_recycle_thresh: 64,
            tx_overload_thresh: 8,
            tx_resched_thresh: 128,
            tx_desc_limit: MAX_TX_DESC_PER_PACKET,
            tx_buffer_size: 2048,
            tx_control_blocks: 0,
            reclaim_strategy: ReclaimStrategy::Legacy,
            rx_buffer_padding: 2,
            rx_pool_extra: 256,
            rx_budget: 256,
            min_vectors: 1,
            max_vectors: MAX_MSIX_VECTORS,
            mailbox_timeout_us: 20_000,
            mailbox_poll_us: 50,
            drain_timeout_us: 10_000,
            drain_poll_us: 100,
            stall_threshold_us: 8_000_000,
            max_resets: 16,
            max_mac_restarts: 4,
            mtu: DEFAULT_MTU,
        }
    }
}

impl VfConfig {
    /// Checks every tunable against the hardware limits and against each other.
    pub fn validate(&self) -> Result<(), &'static str> {
        for size in [self.tx_ring_size, self.rx_ring_size] {
            if !(MIN_RING_SIZE..=MAX_RING_SIZE).contains(&size) || size % MIN_RING_SIZE != 0 {
                return Err("VfConfig: ring sizes must be a multiple of 8 between 8 and 4096");
            }
        }
        if self.tx_rings == 0 || self.rx_rings == 0 || self.tx_rings > MAX_RING_PAIRS || self.rx_rings > MAX_RING_PAIRS {
            return Err("VfConfig: ring counts must be between 1 and 8");
        }
        if self.tx_desc_limit == 0 || self.tx_desc_limit > MAX_TX_DESC_PER_PACKET || self.tx_desc_limit >= self.tx_ring_size {
            return Err("VfConfig: tx_desc_limit out of range");
        }
        if self.tx_overload_thresh > self.tx_recycle_thresh
            || self.tx_recycle_thresh >= self.tx_ring_size
            || self.tx_resched_thresh > self.tx_ring_size
        {
            return Err("VfConfig: tx thresholds must satisfy overload <= recycle < ring size and resched <= ring size");
        }
        if self.tx_buffer_size < 256 || self.tx_buffer_size > MAX_DATA_PER_TX_DESC || self.tx_copy_thresh > self.tx_buffer_size {
            return Err("VfConfig: tx copy buffers must hold 256 bytes to 16 KB and a full copied fragment");
        }
        if self.tx_control_blocks != 0 && self.tx_control_blocks < self.tx_desc_limit {
            return Err("VfConfig: too few tx control blocks for one packet");
        }
        if self.rx_buffer_padding >= 64 || self.rx_budget == 0 {
            return Err("VfConfig: invalid rx padding or budget");
        }
        if self.min_vectors == 0 || self.min_vectors > self.max_vectors || self.max_vectors > MAX_MSIX_VECTORS {
            return Err("VfConfig: vector bounds must satisfy 1 <= min <= max <= 3");
        }
        if self.mailbox_poll_us == 0 || self.mailbox_timeout_us < self.mailbox_poll_us || self.drain_poll_us == 0 {
            return Err("VfConfig: poll intervals must be non-zero and below their timeouts");
        }
        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err("VfConfig: MTU out of range");
        }
        Ok(())
    }

    /// The number of control blocks each transmit ring gets.
    pub fn tx_control_block_count(&self) -> usize {
        if self.tx_control_blocks == 0 {
            self.tx_ring_size + self.tx_ring_size / 2
        } else {
            self.tx_control_blocks
        }
    }
}

/// The number of bytes the device may write into one receive buffer for the given MTU,
/// rounded up to the 1 KB granularity of the hardware and capped at 16 KB.
/// Larger frames span several buffers.
pub fn rx_buffer_data_size(mtu: u32) -> usize {
    let frame = (mtu + FRAME_OVERHEAD) as usize;
    let rounded = (frame + 1023) & !1023;
    core::cmp::min(rounded, 16 * 1024)
}
