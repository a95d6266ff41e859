//! The transmit engine of one VF ring.
//!
//! Sending happens in two phases. The packet is first split into control blocks
//! without holding the ring lock: small fragments are copied into a block's buffer,
//! large ones are bound for DMA in place. Only then is the ring locked,
//! descriptors reserved and written, and the tail advanced.
//!
//! Lock order: `tx_lock` -> `recycle_lock` -> work list -> free list.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::{Mutex, MutexGuard};
use intel_ethernet::descriptors::{
    AdvancedTxDescriptor, TX_CMD_EOP, TX_CMD_RS, TX_CMD_TSE, TX_CMD_VLE,
    TX_PAYLEN_SHIFT, TX_POPTS_IXSM, TX_POPTS_TXSM,
};
use nic_hal::{HalError, SyncDirection};
use nic_initialization::{init_tx_queue, program_tx_queue, reset_tx_descriptors, DescriptorRing};
use crate::{
    Platform,
    config::{ReclaimStrategy, VfConfig},
    control_block::{alloc_control_blocks, TxControlBlock},
    packet::{fragment_views, FragmentView, Packet, TxContext, TxOffloadFlags},
    queue_registers::VfTxQueueRegisters,
    regs,
    stack::{RingCounters, RingHandle, RingStats, SendResult},
    state::{DeviceState, StateCell},
};

/// The tunables a transmit ring needs, copied out of the device configuration.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TxParams {
    pub ring_size: usize,
    pub copy_thresh: usize,
    pub recycle_thresh: usize,
    pub overload_thresh: usize,
    pub resched_thresh: usize,
    pub desc_limit: usize,
    pub buffer_size: usize,
    pub control_blocks: usize,
    pub strategy: ReclaimStrategy,
    pub stall_threshold_us: u64,
}

impl From<&VfConfig> for TxParams {
    fn from(config: &VfConfig) -> Self {
        TxParams {
            ring_size: config.tx_ring_size,
            copy_thresh: config.tx_copy_thresh,
            recycle_thresh: config.tx_recycle_thresh,
            overload_thresh: config.tx_overload_thresh,
            resched_thresh: config.tx_resched_thresh,
            desc_limit: config.tx_desc_limit,
            buffer_size: config.tx_buffer_size,
            control_blocks: config.tx_control_block_count(),
            strategy: config.reclaim_strategy,
            stall_threshold_us: config.stall_threshold_us,
        }
    }
}

/// The memory of a transmit ring: descriptors, control blocks, and the lists that own them.
pub(crate) struct TxResources {
    pub ring: DescriptorRing<AdvancedTxDescriptor>,
    /// Control blocks handed to the device, keyed by the index of their first descriptor.
    pub work_list: Mutex<Vec<Option<Box<TxControlBlock>>>>,
    pub free_list: Mutex<Vec<Box<TxControlBlock>>>,
    /// Descriptors not owned by any outstanding packet.
    pub tbd_free: AtomicUsize,
    /// Control blocks taken from the free list by a send that hasn't reached the work list yet.
    pub in_transit: AtomicUsize,
    pub total_tcbs: usize,
}

impl TxResources {
    fn new(ring: DescriptorRing<AdvancedTxDescriptor>, tcbs: Vec<Box<TxControlBlock>>) -> TxResources {
        let n = ring.num_desc();
        let mut work_list = Vec::with_capacity(n);
        work_list.resize_with(n, || None);
        TxResources {
            ring,
            work_list: Mutex::new(work_list),
            total_tcbs: tcbs.len(),
            free_list: Mutex::new(tcbs),
            tbd_free: AtomicUsize::new(n),
            in_transit: AtomicUsize::new(0),
        }
    }

    pub fn free_descriptors(&self) -> usize {
        self.tbd_free.load(Ordering::Acquire)
    }

    fn take_tcb(&self) -> Option<Box<TxControlBlock>> {
        let mut free = self.free_list.lock();
        let tcb = free.pop()?;
        self.in_transit.fetch_add(1, Ordering::AcqRel);
        Some(tcb)
    }

    /// Gives back control blocks that a send took but never handed to the device.
    fn return_unsent(&self, mut tcbs: Vec<Box<TxControlBlock>>) {
        let count = tcbs.len();
        for tcb in tcbs.iter_mut() {
            tcb.reset();
        }
        let mut free = self.free_list.lock();
        free.append(&mut tcbs);
        self.in_transit.fetch_sub(count, Ordering::AcqRel);
    }

    /// Takes `n` descriptors, always leaving at least one free so that a full ring
    /// is never mistaken for an empty one.
    fn reserve(&self, n: usize) -> bool {
        self.tbd_free
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |free| (free > n).then(|| free - n))
            .is_ok()
    }

    /// Moves every control block on the work list back to the free list
    /// and marks every descriptor free. The device must no longer be using the ring.
    fn discard_in_flight(&self) -> usize {
        let mut work = self.work_list.lock();
        let mut discarded: Vec<Box<TxControlBlock>> = work.iter_mut().filter_map(Option::take).collect();
        for tcb in discarded.iter_mut() {
            tcb.reset();
        }
        let count = discarded.len();
        self.free_list.lock().append(&mut discarded);
        self.tbd_free.store(self.ring.num_desc(), Ordering::Release);
        count
    }
}

/// The tail-side state of a ring, guarded by its `tx_lock`.
pub struct TxTail {
    pub(crate) tail: usize,
    /// The offload parameters of the last context descriptor written,
    /// which the hardware applies to every later packet until replaced.
    pub(crate) last_context: Option<TxContext>,
}

/// The head-side state of a ring, guarded by its `recycle_lock`.
pub(crate) struct RecycleState {
    /// Ring index of the first descriptor of the oldest outstanding packet.
    pub head: usize,
}

/// A snapshot of where a ring's descriptors and control blocks are.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxCensus {
    pub ring_size: usize,
    pub free_descriptors: usize,
    /// The sum of `desc_num` over the work list.
    pub work_descriptors: usize,
    pub free_blocks: usize,
    pub work_blocks: usize,
    pub in_transit_blocks: usize,
    pub total_blocks: usize,
}

#[derive(Debug)]
enum BuildError {
    NoControlBlock,
    /// Binding a fragment for DMA failed.
    Dma(HalError),
    /// Flushing a copy buffer to the device failed.
    Sync(&'static str),
    Copy(&'static str),
}

struct Built {
    tcbs: Vec<Box<TxControlBlock>>,
    data_descs: usize,
}

/// Counts a sender in for as long as it's alive, so that stop can wait for senders to leave.
struct SenderGuard<'a>(&'a AtomicUsize);

impl<'a> SenderGuard<'a> {
    fn enter(count: &'a AtomicUsize) -> SenderGuard<'a> {
        count.fetch_add(1, Ordering::AcqRel);
        SenderGuard(count)
    }
}

impl Drop for SenderGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One transmit ring of a VF.
pub struct TxRing {
    pub(crate) index: usize,
    pub(crate) handle: RingHandle,
    pub(crate) params: TxParams,
    pub(crate) platform: Platform,
    pub(crate) state: Arc<StateCell>,
    pub(crate) link_up: Arc<AtomicBool>,
    pub(crate) resources: Mutex<Option<Arc<TxResources>>>,
    pub(crate) tx_lock: Mutex<TxTail>,
    pub(crate) recycle_lock: Mutex<RecycleState>,
    /// Set when a send returned busy; cleared when the stack is told to resume.
    pub(crate) blocked: AtomicBool,
    pub(crate) stalled: AtomicBool,
    pub(crate) intr_enabled: AtomicBool,
    pub(crate) active_senders: AtomicUsize,
    pub(crate) stats: RingCounters,
}

impl TxRing {
    pub(crate) fn new(index: usize, handle: RingHandle, params: TxParams, platform: Platform, state: Arc<StateCell>, link_up: Arc<AtomicBool>) -> TxRing {
        TxRing {
            index,
            handle,
            params,
            platform,
            state,
            link_up,
            resources: Mutex::new(None),
            tx_lock: Mutex::new(TxTail { tail: 0, last_context: None }),
            recycle_lock: Mutex::new(RecycleState { head: 0 }),
            blocked: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            intr_enabled: AtomicBool::new(true),
            active_senders: AtomicUsize::new(0),
            stats: RingCounters::default(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn handle(&self) -> RingHandle {
        self.handle
    }

    pub fn stats(&self) -> RingStats {
        self.stats.snapshot()
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    pub(crate) fn resources(&self) -> Option<Arc<TxResources>> {
        self.resources.lock().clone()
    }

    /// The number of free descriptors, or zero if the ring has no resources.
    pub fn free_descriptors(&self) -> usize {
        self.resources().map_or(0, |res| res.free_descriptors())
    }

    /// True if some packet was handed to the device and not reclaimed yet.
    pub(crate) fn has_outstanding_work(&self) -> bool {
        self.resources().map_or(false, |res| res.free_descriptors() < res.ring.num_desc())
    }

    /// Hands `packet` to the device.
    ///
    /// Never blocks: if the ring lacks descriptors or control blocks, the packet is returned
    /// in [`SendResult::Busy`] and the stack is told through [`crate::NetStack::tx_resume()`]
    /// once there is room. A packet that needed linearizing comes back linearized.
    pub fn send(&self, mut packet: Packet) -> SendResult {
        let _sender = SenderGuard::enter(&self.active_senders);
        if !self.state.is_running() {
            RingCounters::inc(&self.stats.dropped);
            return SendResult::Dropped;
        }
        let res = match self.resources() {
            Some(res) => res,
            None => {
                RingCounters::inc(&self.stats.dropped);
                return SendResult::Dropped;
            }
        };
        if packet.is_empty() {
            RingCounters::inc(&self.stats.dropped);
            return SendResult::Dropped;
        }
        let context = match TxContext::from_packet(&packet) {
            Ok(context) => context,
            Err(e) => {
                warn!("ixgbevf::TxRing::send(): ring {}: dropping packet: {}", self.index, e);
                RingCounters::inc(&self.stats.dropped);
                return SendResult::Dropped;
            }
        };

        if res.free_descriptors() < self.params.recycle_thresh {
            self.reclaim();
        }
        if res.free_descriptors() < self.params.overload_thresh {
            self.blocked.store(true, Ordering::Release);
            RingCounters::inc(&self.stats.no_resources);
            return SendResult::Busy(packet);
        }

        let mut linearized = false;
        let mut reclaimed = false;
        let built = loop {
            match self.build(&res, &packet, context.as_ref()) {
                Ok(built) if built.data_descs > self.params.desc_limit => {
                    res.return_unsent(built.tcbs);
                    if linearized {
                        warn!("ixgbevf::TxRing::send(): ring {}: packet needs {} descriptors even when linearized",
                            self.index, built.data_descs);
                        RingCounters::inc(&self.stats.dropped);
                        return SendResult::Dropped;
                    }
                    trace!("ixgbevf::TxRing::send(): ring {}: linearizing a packet that needs {} descriptors", self.index, built.data_descs);
                    packet.linearize();
                    linearized = true;
                    RingCounters::inc(&self.stats.linearized);
                }
                Ok(built) => break built,
                Err(BuildError::NoControlBlock) if !reclaimed => {
                    reclaimed = true;
                    self.reclaim();
                }
                Err(BuildError::NoControlBlock) => {
                    self.blocked.store(true, Ordering::Release);
                    RingCounters::inc(&self.stats.no_control_blocks);
                    return SendResult::Busy(packet);
                }
                Err(BuildError::Dma(e)) => {
                    if matches!(e, HalError::HandleFault | HalError::AccessFault) {
                        error!("ixgbevf::TxRing::send(): ring {}: DMA fault {:?}", self.index, e);
                        self.state.insert(DeviceState::ERROR);
                    }
                    RingCounters::inc(&self.stats.dropped);
                    return SendResult::Dropped;
                }
                Err(BuildError::Sync(e)) => {
                    error!("ixgbevf::TxRing::send(): ring {}: {}", self.index, e);
                    self.state.insert(DeviceState::ERROR);
                    RingCounters::inc(&self.stats.errors);
                    return SendResult::Dropped;
                }
                Err(BuildError::Copy(e)) => {
                    warn!("ixgbevf::TxRing::send(): ring {}: {}", self.index, e);
                    RingCounters::inc(&self.stats.dropped);
                    return SendResult::Dropped;
                }
            }
        };

        self.emit(&res, built, packet, context)
    }

    /// Splits the packet into control blocks. On failure every block taken is returned.
    fn build(&self, res: &TxResources, packet: &Packet, context: Option<&TxContext>) -> Result<Built, BuildError> {
        let mut bounce = Vec::new();
        let views = fragment_views(packet, context, &mut bounce);
        let mut tcbs = Vec::new();
        match self.fill_control_blocks(res, &views, &mut tcbs) {
            Ok(data_descs) => Ok(Built { tcbs, data_descs }),
            Err(e) => {
                res.return_unsent(tcbs);
                Err(e)
            }
        }
    }

    fn fill_control_blocks(&self, res: &TxResources, views: &[FragmentView], tcbs: &mut Vec<Box<TxControlBlock>>) -> Result<usize, BuildError> {
        for view in views {
            let len = view.bytes.len();
            if view.force_copy || len < self.params.copy_thresh {
                // adjacent small fragments share one copy buffer
                if !tcbs.last().map_or(false, |tcb| tcb.can_copy(len)) {
                    tcbs.push(res.take_tcb().ok_or(BuildError::NoControlBlock)?);
                }
                if let Some(tcb) = tcbs.last_mut() {
                    tcb.copy_in(view.bytes).map_err(BuildError::Copy)?;
                }
            } else {
                let mut tcb = res.take_tcb().ok_or(BuildError::NoControlBlock)?;
                let bound = tcb.bind(&*self.platform.dma, view.bytes);
                tcbs.push(tcb);
                bound.map_err(BuildError::Dma)?;
            }
        }

        let mut data_descs = 0;
        for tcb in tcbs.iter_mut() {
            data_descs += tcb.finish().map_err(BuildError::Sync)?;
        }
        Ok(data_descs)
    }

    /// Writes the descriptors of a built packet and hands them to the device.
    fn emit(&self, res: &TxResources, mut built: Built, packet: Packet, context: Option<TxContext>) -> SendResult {
        let mut tx = self.tx_lock.lock();
        if !self.state.is_running() {
            drop(tx);
            res.return_unsent(built.tcbs);
            RingCounters::inc(&self.stats.dropped);
            return SendResult::Dropped;
        }

        let need_context = context.is_some() && tx.last_context != context;
        let needed = built.data_descs + need_context as usize;
        if !res.reserve(needed) {
            drop(tx);
            res.return_unsent(built.tcbs);
            self.blocked.store(true, Ordering::Release);
            RingCounters::inc(&self.stats.no_resources);
            return SendResult::Busy(packet);
        }

        let n = res.ring.num_desc();
        let first = tx.tail;
        let prev_context = tx.last_context;
        let last_index = (first + needed - 1) % n;
        let mut idx = first;

        if let (true, Some(ctx)) = (need_context, context) {
            let (vlan_macip_lens, type_tucmd, mss_l4len_idx) = ctx.descriptor_words();
            // SAFETY: slot `idx` was reserved above and only this thread writes it under `tx_lock`.
            unsafe { res.ring.desc_mut(idx) }.set_context(vlan_macip_lens, type_tucmd, mss_l4len_idx);
            idx = (idx + 1) % n;
            tx.last_context = Some(ctx);
        }

        let mut cmd = 0;
        let mut popts = 0;
        let mut payload_len = packet.len();
        if let Some(ctx) = context {
            if ctx.is_lso() {
                cmd |= TX_CMD_TSE;
                payload_len -= ctx.header_len();
            }
            if ctx.vlan_tag.is_some() {
                cmd |= TX_CMD_VLE;
            }
            if ctx.flags.contains(TxOffloadFlags::IPV4_CSUM) {
                popts |= TX_POPTS_IXSM;
            }
            if ctx.flags.intersects(TxOffloadFlags::L4_CSUM | TxOffloadFlags::LSO) {
                popts |= TX_POPTS_TXSM;
            }
        }
        let first_olinfo = (payload_len as u32) << TX_PAYLEN_SHIFT | popts;

        let now = self.platform.clock.now_us();
        let mut written = 0;
        for (i, tcb) in built.tcbs.iter_mut().enumerate() {
            tcb.first_index = if i == 0 { first } else { idx };
            for segment in tcb.segments.iter() {
                written += 1;
                let desc_cmd = if written == built.data_descs { cmd | TX_CMD_EOP | TX_CMD_RS } else { cmd };
                let olinfo = if written == 1 { first_olinfo } else { 0 };
                // SAFETY: as above.
                unsafe { res.ring.desc_mut(idx) }.set_data(segment.addr, segment.len as u16, desc_cmd, olinfo);
                idx = (idx + 1) % n;
            }
            tcb.desc_num = (idx + n - tcb.first_index) % n;
            tcb.last_index = last_index;
            tcb.timestamp_us = now;
        }

        // Nothing is handed over until the device can see the descriptors.
        if let Err(e) = res.ring.sync(SyncDirection::ForDevice) {
            error!("ixgbevf::TxRing::send(): ring {}: failed to sync descriptors: {:?}", self.index, e);
            tx.last_context = prev_context;
            res.tbd_free.fetch_add(needed, Ordering::AcqRel);
            drop(tx);
            res.return_unsent(built.tcbs);
            self.state.insert(DeviceState::ERROR);
            RingCounters::inc(&self.stats.errors);
            return SendResult::Dropped;
        }
        if need_context {
            RingCounters::inc(&self.stats.context_descriptors);
        }

        let len = packet.len();
        if let Some(last) = built.tcbs.last_mut() {
            last.packet = Some(packet);
        }
        {
            let mut work = res.work_list.lock();
            let count = built.tcbs.len();
            for tcb in built.tcbs.drain(..) {
                let slot = tcb.first_index;
                work[slot] = Some(tcb);
            }
            res.in_transit.fetch_sub(count, Ordering::AcqRel);
        }
        tx.tail = idx;
        self.platform.regs.write_reg(regs::tdt(self.index), idx as u32);

        RingCounters::inc(&self.stats.packets);
        RingCounters::add(&self.stats.bytes, len as u64);
        trace!("ixgbevf::TxRing::send(): ring {}: {} bytes in descriptors {}..={}", self.index, len, first, last_index);
        SendResult::Sent
    }

    /// Allocates the ring's descriptors and control blocks if it has none.
    /// Returns true if anything was allocated.
    pub(crate) fn allocate(&self) -> Result<bool, &'static str> {
        let mut slot = self.resources.lock();
        if slot.is_some() {
            return Ok(false);
        }
        let extra_slots = match self.params.strategy {
            ReclaimStrategy::HeadWriteBack => 1,
            ReclaimStrategy::Legacy => 0,
        };
        let ring = init_tx_queue::<AdvancedTxDescriptor>(&*self.platform.dma, self.params.ring_size, extra_slots)?;
        let tcbs = alloc_control_blocks(&*self.platform.dma, self.params.control_blocks, self.params.buffer_size)?;
        *slot = Some(Arc::new(TxResources::new(ring, tcbs)));
        Ok(true)
    }

    pub(crate) fn free_resources(&self) {
        self.resources.lock().take();
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TxTail> {
        self.tx_lock.lock()
    }

    /// Programs the ring into the device and enables it. The caller holds the ring's `tx_lock`.
    pub(crate) fn program(&self, tx: &mut TxTail) -> Result<(), &'static str> {
        let res = self.resources().ok_or("ixgbevf::TxRing::program(): ring has no resources")?;
        let mut recycle = self.recycle_lock.lock();
        let regs = &*self.platform.regs;

        res.discard_in_flight();
        reset_tx_descriptors(&res.ring);
        res.ring.sync(SyncDirection::ForDevice)?;
        program_tx_queue(&res.ring, &mut VfTxQueueRegisters { regs, index: self.index });

        match self.params.strategy {
            ReclaimStrategy::HeadWriteBack => {
                let addr = res.ring.extra_slot_phys_addr(0)
                    .ok_or("ixgbevf::TxRing::program(): ring has no head write-back slot")?;
                regs.write_reg(regs::tdwbah(self.index), (addr.value() >> 32) as u32);
                regs.write_reg(regs::tdwbal(self.index), addr.value() as u32 | regs::TDWBAL_HEAD_WB_ENABLE);
            }
            ReclaimStrategy::Legacy => {
                regs.write_reg(regs::tdwbah(self.index), 0);
                regs.write_reg(regs::tdwbal(self.index), 0);
            }
        }
        regs.write_reg(regs::txdctl(self.index), regs::TXDCTL_ENABLE);

        tx.tail = 0;
        tx.last_context = None;
        recycle.head = 0;
        self.blocked.store(false, Ordering::Release);
        self.stalled.store(false, Ordering::Release);
        Ok(())
    }

    /// Disables the ring and drops every packet still on it. The caller holds the ring's `tx_lock`.
    pub(crate) fn disable(&self, tx: &mut TxTail) {
        self.platform.regs.write_reg(regs::txdctl(self.index), 0);
        if let Some(res) = self.resources() {
            let mut recycle = self.recycle_lock.lock();
            let discarded = res.discard_in_flight();
            if discarded > 0 {
                debug!("ixgbevf::TxRing::disable(): ring {}: discarded {} control blocks", self.index, discarded);
            }
            recycle.head = 0;
        }
        tx.tail = 0;
        tx.last_context = None;
    }

    /// Counts where every descriptor and control block is.
    /// Locks the whole ring, so the counts are consistent with each other.
    pub fn census(&self) -> Option<TxCensus> {
        let res = self.resources()?;
        let _tx = self.tx_lock.lock();
        let _recycle = self.recycle_lock.lock();
        let work = res.work_list.lock();
        let free = res.free_list.lock();
        let (work_blocks, work_descriptors) = work.iter()
            .flatten()
            .fold((0, 0), |(blocks, descs), tcb| (blocks + 1, descs + tcb.desc_num));
        Some(TxCensus {
            ring_size: res.ring.num_desc(),
            free_descriptors: res.free_descriptors(),
            work_descriptors,
            free_blocks: free.len(),
            work_blocks,
            in_transit_blocks: res.in_transit.load(Ordering::Acquire),
            total_blocks: res.total_tcbs,
        })
    }
}
