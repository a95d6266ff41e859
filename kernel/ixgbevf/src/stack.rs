//! The network stack's side of the ring interface.
//!
//! The driver registers every ring with the stack, hands it received frames,
//! and tells it when a blocked transmit ring can take packets again.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use nic_buffers::ReceivedFrame;
use crate::packet::Packet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RingDirection {
    Tx,
    Rx,
}

/// The stack's name for a registered ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RingHandle(pub u64);

/// The result of handing a packet to a transmit ring.
#[derive(Debug, PartialEq, Eq)]
pub enum SendResult {
    /// The packet is owned by the ring until its transmission completes.
    Sent,
    /// The ring is out of descriptors or control blocks. The packet is returned untouched;
    /// the stack should retry after [`NetStack::tx_resume()`].
    Busy(Packet),
    /// The packet was discarded.
    Dropped,
}

/// Rings of one direction that are managed together. A VF has one group per direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RingGroup {
    pub direction: RingDirection,
    pub index: usize,
    pub rings: Vec<usize>,
}

/// Counters of one ring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingStats {
    pub packets: u64,
    pub bytes: u64,
    /// Transmit: busy because of too few free descriptors. Receive: frames dropped for lack of a buffer.
    pub no_resources: u64,
    /// Transmit: busy because no control block was free.
    pub no_control_blocks: u64,
    pub dropped: u64,
    pub errors: u64,
    /// Transmit packets that had to be linearized.
    pub linearized: u64,
    pub context_descriptors: u64,
    pub reschedules: u64,
}

/// The live counters behind a [`RingStats`] snapshot, updated without locks.
#[derive(Debug, Default)]
pub(crate) struct RingCounters {
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
    pub no_resources: AtomicU64,
    pub no_control_blocks: AtomicU64,
    pub dropped: AtomicU64,
    pub errors: AtomicU64,
    pub linearized: AtomicU64,
    pub context_descriptors: AtomicU64,
    pub reschedules: AtomicU64,
}

impl RingCounters {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RingStats {
        RingStats {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            no_resources: self.no_resources.load(Ordering::Relaxed),
            no_control_blocks: self.no_control_blocks.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            linearized: self.linearized.load(Ordering::Relaxed),
            context_descriptors: self.context_descriptors.load(Ordering::Relaxed),
            reschedules: self.reschedules.load(Ordering::Relaxed),
        }
    }
}

/// What the driver needs from the network stack.
pub trait NetStack: Send + Sync {
    /// Makes a ring known to the stack.
    fn register_ring(&self, direction: RingDirection, index: usize) -> Result<RingHandle, &'static str>;
    fn unregister_ring(&self, handle: RingHandle);
    /// The ring is programmed and can be used.
    fn ring_started(&self, handle: RingHandle);
    /// Frames received on a ring from interrupt context.
    fn deliver(&self, handle: RingHandle, frames: Vec<ReceivedFrame>);
    /// A transmit ring that returned [`SendResult::Busy`] has room again.
    fn tx_resume(&self, handle: RingHandle);
    fn link_changed(&self, up: bool);
    fn update_stats(&self, handle: RingHandle, stats: RingStats);
}
