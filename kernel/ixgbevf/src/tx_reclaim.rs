//! Reclaiming transmit descriptors and control blocks once the device is done with them.

use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::Ordering;
use intel_ethernet::descriptors::TxDescriptor;
use nic_hal::SyncDirection;
use crate::{
    config::ReclaimStrategy,
    control_block::TxControlBlock,
    stack::RingCounters,
    state::DeviceState,
    tx::{TxResources, TxRing},
};

impl TxRing {
    /// Returns the descriptors and control blocks of every completed packet to the free pools,
    /// and returns how many descriptors were freed.
    ///
    /// Packets complete in ring order, so reclaiming stops at the first packet that isn't done.
    /// Also detects a stalled ring and tells the stack to resume a blocked one.
    pub fn reclaim(&self) -> usize {
        let res = match self.resources() {
            Some(res) => res,
            None => return 0,
        };
        let mut recycle = self.recycle_lock.lock();
        if let Err(e) = res.ring.sync(SyncDirection::ForCpu) {
            error!("ixgbevf::TxRing::reclaim(): ring {}: failed to sync descriptors: {:?}", self.index, e);
            self.state.insert(DeviceState::ERROR);
            return 0;
        }

        let n = res.ring.num_desc();
        // the head the device wrote back, if this ring uses that strategy
        let hw_head = match self.params.strategy {
            ReclaimStrategy::HeadWriteBack => res.ring.read_extra_slot(0).map(|head| head as usize % n),
            ReclaimStrategy::Legacy => None,
        };

        let mut pending: Vec<Box<TxControlBlock>> = Vec::new();
        let mut freed = 0;
        let mut oldest_outstanding = None;
        {
            let mut work = res.work_list.lock();
            let mut head = recycle.head;
            loop {
                let (last_index, timestamp) = match work[head].as_ref() {
                    Some(tcb) => (tcb.last_index, tcb.timestamp_us),
                    None => break,
                };
                let done = match hw_head {
                    None => res.ring.desc(last_index).descriptor_done(),
                    // done if the packet's last descriptor lies between our head and the device's
                    Some(hw_head) => (last_index + n - head) % n < (hw_head + n - head) % n,
                };
                if !done {
                    oldest_outstanding = Some(timestamp);
                    break;
                }

                // the packet's blocks sit back to back starting at `head`
                let mut idx = head;
                loop {
                    let tcb = match work[idx].take() {
                        Some(tcb) => tcb,
                        None => {
                            error!("ixgbevf::TxRing::reclaim(): ring {}: no control block at descriptor {}", self.index, idx);
                            break;
                        }
                    };
                    let desc_num = tcb.desc_num;
                    let holds_last = (last_index + n - idx) % n < desc_num;
                    freed += desc_num;
                    pending.push(tcb);
                    idx = (idx + desc_num) % n;
                    if holds_last || desc_num == 0 {
                        break;
                    }
                }
                head = idx;
            }
            recycle.head = head;
        }

        // releases DMA bindings and then the packets
        for tcb in pending.iter_mut() {
            tcb.reset();
        }
        res.free_list.lock().append(&mut pending);
        res.tbd_free.fetch_add(freed, Ordering::AcqRel);
        drop(recycle);

        self.check_stall(freed, oldest_outstanding);
        self.resume_if_blocked(&res);
        freed
    }

    /// A ring is stalled if nothing completed while a packet has been waiting longer than
    /// the threshold on a link that is up. Any progress clears the stall.
    fn check_stall(&self, freed: usize, oldest_outstanding: Option<u64>) {
        if freed > 0 {
            if self.stalled.swap(false, Ordering::AcqRel) {
                info!("ixgbevf::TxRing::reclaim(): ring {} is making progress again", self.index);
            }
            return;
        }
        let timestamp = match oldest_outstanding {
            Some(timestamp) => timestamp,
            None => return,
        };
        let age = self.platform.clock.now_us().saturating_sub(timestamp);
        if self.link_up.load(Ordering::Acquire)
            && age > self.params.stall_threshold_us
            && !self.stalled.swap(true, Ordering::AcqRel)
        {
            warn!("ixgbevf::TxRing::reclaim(): ring {} stalled, oldest packet waiting {} us", self.index, age);
        }
    }

    fn resume_if_blocked(&self, res: &TxResources) {
        if self.blocked.load(Ordering::Acquire)
            && res.free_descriptors() >= self.params.resched_thresh
            && self.blocked.swap(false, Ordering::AcqRel)
        {
            RingCounters::inc(&self.stats.reschedules);
            self.platform.stack.tx_resume(self.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use intel_ethernet::descriptors::{TX_CMD_RS, TX_STATUS_DD};
    use nic_hal::sim::SimDma;
    use crate::{
        config::VfConfig,
        packet::{tests::tcp_frame, Packet, TxOffload, TxOffloadFlags},
        stack::SendResult,
        test_support::{assert_census, frame, test_config, Harness, PfConfig},
    };
    use super::*;

    fn small(seed: u8) -> Packet {
        Packet::new(vec![frame(60, seed)])
    }

    #[test]
    fn only_the_finished_packet_is_reclaimed() {
        let h = Harness::new(PfConfig::default());
        let nic = h.started(test_config());
        let ring = nic.tx_ring(0).unwrap();
        for seed in 0..3 {
            assert_eq!(ring.send(small(seed)), SendResult::Sent);
        }

        assert_eq!(h.sim.complete_tx(0, 1), vec![frame(60, 0)]);
        assert_eq!(ring.reclaim(), 1);
        let census = ring.census().unwrap();
        assert_eq!(census.free_descriptors, 6);
        assert_eq!(census.work_blocks, 2);
        assert_eq!(census.work_descriptors, 2);
        assert_census(ring);
        assert_eq!(ring.reclaim(), 0);

        assert_eq!(h.sim.complete_tx(0, 2).len(), 2);
        assert_eq!(ring.reclaim(), 2);
        assert_eq!(ring.free_descriptors(), 8);
        assert_census(ring);
    }

    #[test]
    fn multi_descriptor_packet_completes_on_its_last_descriptor() {
        let h = Harness::with_dma(PfConfig::default(), SimDma::with_segment_size(128));
        let nic = h.started(VfConfig { tx_ring_size: 16, ..test_config() });
        let ring = nic.tx_ring(0).unwrap();
        let lso = TxOffload { flags: TxOffloadFlags::LSO | TxOffloadFlags::L4_CSUM, mss: 100, vlan_tag: None };
        assert_eq!(ring.send(Packet::with_offload(vec![tcp_frame(300)], lso)), SendResult::Sent);
        assert_eq!(ring.send(small(1)), SendResult::Sent);

        // a context descriptor, the copied header, then the payload bound in three segments
        let res = ring.resources().unwrap();
        assert!(res.ring.desc(0).is_context());
        for i in 1..4 {
            assert_eq!(res.ring.desc(i).cmd_type_len.read() & TX_CMD_RS, 0);
        }
        assert_ne!(res.ring.desc(4).cmd_type_len.read() & TX_CMD_RS, 0);
        assert_eq!(ring.census().unwrap().work_blocks, 3);
        assert_eq!(ring.reclaim(), 0);

        assert_eq!(h.sim.complete_tx(0, 1), vec![tcp_frame(300)]);
        for i in 1..4 {
            assert_eq!(res.ring.desc(i).olinfo_status.read() & TX_STATUS_DD, 0);
        }
        assert!(res.ring.desc(4).descriptor_done());
        assert!(!res.ring.desc(5).descriptor_done());
        assert_eq!(ring.reclaim(), 5);
        let census = ring.census().unwrap();
        assert_eq!(census.work_blocks, 1);
        assert_eq!(census.work_descriptors, 1);
        assert_census(ring);

        assert_eq!(h.sim.complete_tx(0, 1), vec![frame(60, 1)]);
        assert_eq!(ring.reclaim(), 1);
        assert_eq!(ring.free_descriptors(), 16);
    }

    #[test]
    fn written_back_head_inside_a_packet_frees_none_of_it() {
        let h = Harness::with_dma(PfConfig::default(), SimDma::with_segment_size(128));
        let nic = h.started(VfConfig {
            tx_ring_size: 16,
            reclaim_strategy: ReclaimStrategy::HeadWriteBack,
            ..test_config()
        });
        let ring = nic.tx_ring(0).unwrap();
        assert_eq!(ring.send(small(0)), SendResult::Sent);
        // descriptors 1..=3
        assert_eq!(ring.send(Packet::new(vec![frame(354, 2)])), SendResult::Sent);
        assert_eq!(ring.census().unwrap().work_descriptors, 4);

        h.sim.set_tx_head(0, 2);
        assert_eq!(ring.reclaim(), 1);
        h.sim.set_tx_head(0, 3);
        assert_eq!(ring.reclaim(), 0);
        let census = ring.census().unwrap();
        assert_eq!(census.work_blocks, 1);
        assert_eq!(census.work_descriptors, 3);
        assert_census(ring);

        h.sim.set_tx_head(0, 4);
        assert_eq!(ring.reclaim(), 3);
        assert_eq!(ring.free_descriptors(), 16);
        assert_census(ring);
    }
}
