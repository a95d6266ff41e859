//! The receive engine of one VF ring.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};
use spin::{Mutex, MutexGuard};
use intel_ethernet::descriptors::{AdvancedRxDescriptor, RxDescriptor};
use nic_buffers::{ReceiveBuffer, ReceivedFrame, RxBufferPool};
use nic_hal::SyncDirection;
use nic_initialization::{init_rx_queue, program_rx_queue, DescriptorRing};
use crate::{
    Platform,
    queue_registers::VfRxQueueRegisters,
    regs,
    stack::{RingCounters, RingHandle, RingStats},
    state::{DeviceState, StateCell},
};

/// The memory of a receive ring and the progress through it.
pub struct RxResources {
    pub(crate) ring: DescriptorRing<AdvancedRxDescriptor>,
    /// `bufs[i]` is the buffer that descriptor `i` points to.
    pub(crate) bufs: Vec<ReceiveBuffer>,
    /// The next descriptor the device will complete.
    pub(crate) next: usize,
    pub(crate) pool: Arc<RxBufferPool>,
    /// Buffers of a frame whose end-of-packet buffer hasn't arrived yet.
    pub(crate) partial: Vec<ReceiveBuffer>,
    /// Set while skipping the rest of a frame that couldn't be received.
    pub(crate) discarding: bool,
}

/// One receive ring of a VF.
pub struct RxRing {
    pub(crate) index: usize,
    pub(crate) handle: RingHandle,
    pub(crate) ring_size: usize,
    pub(crate) platform: Platform,
    pub(crate) state: Arc<StateCell>,
    pub(crate) inner: Mutex<Option<RxResources>>,
    pub(crate) intr_enabled: AtomicBool,
    pub(crate) stats: RingCounters,
}

impl RxRing {
    pub(crate) fn new(index: usize, handle: RingHandle, ring_size: usize, platform: Platform, state: Arc<StateCell>) -> RxRing {
        RxRing {
            index,
            handle,
            ring_size,
            platform,
            state,
            inner: Mutex::new(None),
            intr_enabled: AtomicBool::new(true),
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

    /// Allocates the ring and fills it with buffers from `pool` if it has none.
    /// Returns true if anything was allocated.
    pub(crate) fn allocate(&self, pool: &Arc<RxBufferPool>) -> Result<bool, &'static str> {
        let mut inner = self.inner.lock();
        if inner.is_some() {
            return Ok(false);
        }
        let (ring, bufs) = init_rx_queue::<AdvancedRxDescriptor>(&*self.platform.dma, self.ring_size, pool)?;
        *inner = Some(RxResources {
            ring,
            bufs,
            next: 0,
            pool: Arc::clone(pool),
            partial: Vec::new(),
            discarding: false,
        });
        Ok(true)
    }

    /// Frees the ring. Its buffers go back to their pool.
    pub(crate) fn free_resources(&self) {
        self.inner.lock().take();
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Option<RxResources>> {
        self.inner.lock()
    }

    /// Programs the ring into the device and enables it. The caller holds the ring's lock.
    pub(crate) fn program(&self, inner: &mut Option<RxResources>, vlan_strip: bool) -> Result<(), &'static str> {
        let res = inner.as_mut().ok_or("ixgbevf::RxRing::program(): ring has no resources")?;
        let regs = &*self.platform.regs;
        let n = res.ring.num_desc();

        for (i, buf) in res.bufs.iter().enumerate() {
            // SAFETY: the device isn't using the ring and the caller holds its lock.
            unsafe { res.ring.desc_mut(i) }.init(buf.phys_addr());
        }
        res.next = 0;
        res.partial.clear();
        res.discarding = false;
        res.ring.sync(SyncDirection::ForDevice)?;

        let bsize = (res.pool.buffer_size() - res.pool.padding()) as u32 >> regs::SRRCTL_BSIZEPKT_SHIFT;
        regs.write_reg(regs::srrctl(self.index), bsize | regs::SRRCTL_DESCTYPE_ADV_ONEBUF | regs::SRRCTL_DROP_EN);
        program_rx_queue(&res.ring, &mut VfRxQueueRegisters { regs, index: self.index });

        let mut rxdctl = regs::RXDCTL_ENABLE;
        if vlan_strip {
            rxdctl |= regs::RXDCTL_VME;
        }
        regs.write_reg(regs::rxdctl(self.index), rxdctl);
        // every descriptor but one belongs to the device
        regs.write_reg(regs::rdt(self.index), (n - 1) as u32);
        Ok(())
    }

    /// Disables the ring and drops any partly received frame. The caller holds the ring's lock.
    pub(crate) fn disable(&self, inner: &mut Option<RxResources>) {
        self.platform.regs.write_reg(regs::rxdctl(self.index), 0);
        if let Some(res) = inner.as_mut() {
            res.partial.clear();
            res.discarding = false;
        }
    }

    pub(crate) fn check_handle(&self) -> Result<(), nic_hal::HalError> {
        match self.inner.lock().as_ref() {
            Some(res) => res.ring.check_handle(),
            None => Ok(()),
        }
    }

    /// Collects up to `budget` received frames, refilling each used descriptor from the pool.
    ///
    /// If the pool is empty the descriptor keeps its buffer and the frame is dropped,
    /// so the ring never runs out of buffers.
    pub fn poll(&self, budget: usize) -> Vec<ReceivedFrame> {
        let mut frames = Vec::new();
        if !self.state.is_running() {
            return frames;
        }
        let mut inner = self.inner.lock();
        let res = match inner.as_mut() {
            Some(res) => res,
            None => return frames,
        };
        if let Err(e) = res.ring.sync(SyncDirection::ForCpu) {
            error!("ixgbevf::RxRing::poll(): ring {}: failed to sync descriptors: {:?}", self.index, e);
            self.state.insert(DeviceState::ERROR);
            return frames;
        }

        let n = res.ring.num_desc();
        let mut last_processed = None;
        let mut processed = 0;
        while frames.len() < budget && processed < n {
            let idx = res.next;
            let desc = res.ring.desc(idx);
            if !desc.descriptor_done() {
                break;
            }
            let length = desc.length() as u16;
            let eop = desc.end_of_packet();
            let frame_error = desc.frame_error();
            let vlan_tag = desc.vlan_stripped().then(|| desc.get_vlan_tag());

            let mut drop_frame = res.discarding || frame_error;
            if frame_error {
                RingCounters::inc(&self.stats.errors);
            }
            if !drop_frame {
                match res.pool.alloc() {
                    Some(fresh) => {
                        // SAFETY: the device is done with this descriptor and we hold the ring lock.
                        unsafe { res.ring.desc_mut(idx) }.set_packet_address(fresh.phys_addr());
                        let mut filled = core::mem::replace(&mut res.bufs[idx], fresh);
                        match filled.set_length(length).and_then(|_| filled.sync_for_cpu()) {
                            Ok(()) => res.partial.push(filled),
                            Err(e) => {
                                warn!("ixgbevf::RxRing::poll(): ring {}: {}", self.index, e);
                                RingCounters::inc(&self.stats.errors);
                                drop_frame = true;
                            }
                        }
                    }
                    None => {
                        RingCounters::inc(&self.stats.no_resources);
                        drop_frame = true;
                    }
                }
            }

            if drop_frame {
                // the descriptor keeps (or already got) a buffer from `bufs`
                let addr = res.bufs[idx].phys_addr();
                // SAFETY: as above.
                unsafe { res.ring.desc_mut(idx) }.set_packet_address(addr);
                res.partial.clear();
                res.discarding = !eop;
                if eop {
                    RingCounters::inc(&self.stats.dropped);
                }
            } else if eop {
                let frame = ReceivedFrame { buffers: core::mem::take(&mut res.partial), vlan_tag };
                RingCounters::inc(&self.stats.packets);
                RingCounters::add(&self.stats.bytes, frame.len() as u64);
                frames.push(frame);
            }

            res.next = (idx + 1) % n;
            last_processed = Some(idx);
            processed += 1;
        }

        if let Some(idx) = last_processed {
            if let Err(e) = res.ring.sync(SyncDirection::ForDevice) {
                error!("ixgbevf::RxRing::poll(): ring {}: failed to sync descriptors: {:?}", self.index, e);
                self.state.insert(DeviceState::ERROR);
                return frames;
            }
            // hand the refilled descriptors back to the device
            self.platform.regs.write_reg(regs::rdt(self.index), idx as u32);
        }
        frames
    }

    pub(crate) fn set_interrupt_enabled(&self, enabled: bool) {
        self.intr_enabled.store(enabled, Ordering::Release);
    }
}
