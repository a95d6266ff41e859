//! The VF device: attaching to the PF, the start/stop/suspend/reset lifecycle,
//! the configuration requests forwarded to the PF, and interrupt dispatch.
//!
//! Lock order: device lock -> transmit rings in index order -> receive rings in index order.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};
use nic_buffers::{ReceivedFrame, RxBufferPool};
use nic_initialization::init_rx_buf_pool;
use crate::{
    DeviceError, Platform,
    config::{rx_buffer_data_size, VfConfig, DEFAULT_MTU, MAX_MULTICAST_ADDRS, MAX_VLAN_FILTERS, MIN_MTU},
    interrupts::{InterruptCause, VectorMap},
    mailbox::{MailboxClient, MailboxError, QueueLimits},
    packet::Packet,
    regs,
    rx::{RxResources, RxRing},
    stack::{RingDirection, RingGroup, RingHandle, RingStats, SendResult},
    state::{DeviceState, StateCell},
    tx::{TxCensus, TxParams, TxRing, TxTail},
};

/// Every vector bit, whether allocated or not.
const ALL_VECTORS: u32 = (1 << regs::MAX_MSIX_VECTORS) - 1;

/// A MAC address the PF assigned to this VF, and whether its receive filter is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MacFilter {
    pub addr: [u8; 6],
    pub enabled: bool,
}

/// Device-wide counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub resets: u64,
    /// Resets the watchdog started because a transmit ring stalled.
    pub stall_resets: u64,
    /// Resets the watchdog started because the device was in the error state.
    pub error_resets: u64,
    pub mailbox_errors: u64,
}

#[derive(Debug, Default)]
pub(crate) struct DeviceCounters {
    pub resets: AtomicU64,
    pub stall_resets: AtomicU64,
    pub error_resets: AtomicU64,
    pub mailbox_errors: AtomicU64,
}

/// What the PF told us during the handshake.
struct Identity {
    macs: Vec<[u8; 6]>,
    limits: QueueLimits,
    max_mtu: u32,
}

/// The state guarded by the device lock.
pub(crate) struct DeviceInner {
    pub mailbox: MailboxClient,
    pub num_vectors: usize,
    /// The PF-assigned addresses; the first is the primary address.
    pub macs: Vec<MacFilter>,
    pub multicast: Vec<[u8; 6]>,
    pub mc_promisc: bool,
    pub vlans: Vec<u16>,
    pub mtu: u32,
    pub max_mtu: u32,
    pub vlan_strip: bool,
    pub rx_pool: Option<Arc<RxBufferPool>>,
}

/// A virtual function of an Intel 82599 NIC.
pub struct IxgbeVfNic {
    pub(crate) platform: Platform,
    pub(crate) config: VfConfig,
    pub(crate) state: Arc<StateCell>,
    pub(crate) link_up: Arc<AtomicBool>,
    pub(crate) inner: Mutex<DeviceInner>,
    /// Read by the interrupt path without the device lock.
    pub(crate) vector_map: Mutex<Arc<VectorMap>>,
    pub(crate) tx_rings: Vec<TxRing>,
    pub(crate) rx_rings: Vec<RxRing>,
    pub(crate) counters: DeviceCounters,
}

impl IxgbeVfNic {
    /// Attaches to the VF behind `platform`.
    ///
    /// Resets the VF, negotiates the mailbox API with the PF, fetches the VF's MAC addresses
    /// and limits, registers the rings with the stack, and maps the interrupt vectors.
    /// Nothing is enabled and no ring memory is allocated until [`Self::start()`].
    /// On failure everything obtained so far is released.
    pub fn attach(platform: Platform, config: VfConfig) -> Result<IxgbeVfNic, DeviceError> {
        config.validate().map_err(DeviceError::InvalidConfig)?;
        platform.regs.check_access()?;
        // nothing may interrupt us until start
        platform.regs.write_reg(regs::VTEIMC, ALL_VECTORS);

        let mut mailbox = MailboxClient::new(
            Arc::clone(&platform.regs),
            Arc::clone(&platform.clock),
            config.mailbox_timeout_us,
            config.mailbox_poll_us,
        );
        let identity = handshake(&mut mailbox, &config).map_err(|e| {
            error!("ixgbevf::attach(): handshake with the PF failed: {:?}", e);
            e
        })?;
        if config.mtu > identity.max_mtu {
            error!("ixgbevf::attach(): MTU {} exceeds the PF's limit of {}", config.mtu, identity.max_mtu);
            return Err(DeviceError::InvalidConfig("ixgbevf::attach(): MTU exceeds the PF's limit"));
        }
        let num_tx = core::cmp::min(config.tx_rings, identity.limits.tx);
        let num_rx = core::cmp::min(config.rx_rings, identity.limits.rx);
        if num_tx < config.tx_rings || num_rx < config.rx_rings {
            info!("ixgbevf::attach(): PF granted {} tx and {} rx rings, {} and {} requested",
                num_tx, num_rx, config.tx_rings, config.rx_rings);
        }

        let state = Arc::new(StateCell::new());
        let link_up = Arc::new(AtomicBool::new(false));
        let params = TxParams::from(&config);
        let mut tx_rings = Vec::with_capacity(num_tx);
        let mut rx_rings = Vec::with_capacity(num_rx);
        let registered = (|| -> Result<(), &'static str> {
            for i in 0..num_tx {
                let handle = platform.stack.register_ring(RingDirection::Tx, i)?;
                tx_rings.push(TxRing::new(i, handle, params, platform.clone(), Arc::clone(&state), Arc::clone(&link_up)));
            }
            for i in 0..num_rx {
                let handle = platform.stack.register_ring(RingDirection::Rx, i)?;
                rx_rings.push(RxRing::new(i, handle, config.rx_ring_size, platform.clone(), Arc::clone(&state)));
            }
            Ok(())
        })();
        if let Err(e) = registered {
            error!("ixgbevf::attach(): failed to register rings: {}", e);
            unregister_rings(&platform, &tx_rings, &rx_rings);
            return Err(DeviceError::NoResources(e));
        }

        let map = match setup_vectors(&platform, config.min_vectors, config.max_vectors, num_rx, num_tx) {
            Ok(map) => map,
            Err(e) => {
                unregister_rings(&platform, &tx_rings, &rx_rings);
                return Err(e);
            }
        };

        if config.mtu != DEFAULT_MTU {
            if let Err(e) = mailbox.set_mtu(config.mtu) {
                error!("ixgbevf::attach(): PF refused MTU {}: {:?}", config.mtu, e);
                teardown_vectors(&platform, &map);
                unregister_rings(&platform, &tx_rings, &rx_rings);
                return Err(e.into());
            }
        }

        let macs = identity.macs.iter()
            .enumerate()
            .map(|(i, addr)| MacFilter { addr: *addr, enabled: i == 0 })
            .collect();
        info!("ixgbevf::attach(): VF with {} tx rings, {} rx rings, {} vectors, MAC {:02X?}",
            num_tx, num_rx, map.num_vectors(), identity.macs.first());

        let nic = IxgbeVfNic {
            inner: Mutex::new(DeviceInner {
                mailbox,
                num_vectors: map.num_vectors(),
                macs,
                multicast: Vec::new(),
                mc_promisc: false,
                vlans: Vec::new(),
                mtu: config.mtu,
                max_mtu: identity.max_mtu,
                vlan_strip: identity.limits.vlan_strip,
                rx_pool: None,
            }),
            vector_map: Mutex::new(Arc::new(map)),
            platform,
            config,
            state,
            link_up,
            tx_rings,
            rx_rings,
            counters: DeviceCounters::default(),
        };
        nic.state.insert(DeviceState::INITIALIZED);
        Ok(nic)
    }

    /// Stops the device, frees every resource, and gives the vectors and rings back.
    pub fn detach(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        if !self.state.contains(DeviceState::INITIALIZED) {
            return Err(DeviceError::InvalidState);
        }
        self.stop_locked(&mut inner, true);
        let map = Arc::clone(&*self.vector_map.lock());
        teardown_vectors(&self.platform, &map);
        unregister_rings(&self.platform, &self.tx_rings, &self.rx_rings);
        self.state.remove(DeviceState::all());
        info!("ixgbevf::detach(): detached");
        Ok(())
    }

    /// Allocates whatever ring resources are missing, programs every ring, and enables interrupts.
    pub fn start(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        self.start_locked(&mut inner)
    }

    pub(crate) fn start_locked(&self, inner: &mut DeviceInner) -> Result<(), DeviceError> {
        let state = self.state.get();
        if !state.contains(DeviceState::INITIALIZED) || state.contains(DeviceState::SUSPENDED) {
            return Err(DeviceError::InvalidState);
        }
        if state.contains(DeviceState::STARTED) {
            return Ok(());
        }
        if state.contains(DeviceState::ERROR) {
            self.recover_locked(inner)?;
        }
        self.allocate_resources(inner)?;

        let mut tx_guards: Vec<MutexGuard<'_, TxTail>> = self.tx_rings.iter().map(|ring| ring.lock()).collect();
        let mut rx_guards: Vec<MutexGuard<'_, Option<RxResources>>> = self.rx_rings.iter().map(|ring| ring.lock()).collect();
        let programmed = (|| -> Result<(), &'static str> {
            for (ring, tx) in self.tx_rings.iter().zip(tx_guards.iter_mut()) {
                ring.program(tx)?;
            }
            for (ring, rx) in self.rx_rings.iter().zip(rx_guards.iter_mut()) {
                ring.program(rx, inner.vlan_strip)?;
            }
            Ok(())
        })();
        if let Err(e) = programmed {
            error!("ixgbevf::start(): failed to program the rings: {}", e);
            for (ring, tx) in self.tx_rings.iter().zip(tx_guards.iter_mut()) {
                ring.disable(tx);
            }
            for (ring, rx) in self.rx_rings.iter().zip(rx_guards.iter_mut()) {
                ring.disable(rx);
            }
            return Err(DeviceError::Hardware(e));
        }

        self.state.remove(DeviceState::STALL | DeviceState::ERROR);
        self.state.insert(DeviceState::STARTED);
        let map = Arc::clone(&*self.vector_map.lock());
        self.enable_interrupts(&map);
        drop(rx_guards);
        drop(tx_guards);

        self.refresh_link();
        for ring in &self.tx_rings {
            self.platform.stack.ring_started(ring.handle());
        }
        for ring in &self.rx_rings {
            self.platform.stack.ring_started(ring.handle());
        }
        debug!("ixgbevf::start(): started");
        Ok(())
    }

    /// Gives every ring its memory, creating the receive buffer pool if needed.
    /// Anything allocated here is freed again if a later allocation fails.
    fn allocate_resources(&self, inner: &mut DeviceInner) -> Result<(), DeviceError> {
        let (pool, fresh_pool) = match inner.rx_pool.as_ref() {
            Some(pool) => (Arc::clone(pool), false),
            None => {
                let padding = self.config.rx_buffer_padding;
                let buffer_size = rx_buffer_data_size(inner.mtu) + padding;
                let count = self.rx_rings.len() * self.config.rx_ring_size + self.config.rx_pool_extra;
                let pool = init_rx_buf_pool(&*self.platform.dma, count, buffer_size, padding).map_err(|e| {
                    error!("ixgbevf::start(): failed to create a pool of {} rx buffers: {}", count, e);
                    DeviceError::NoResources(e)
                })?;
                (pool, true)
            }
        };

        let mut fresh_tx = Vec::new();
        let mut fresh_rx = Vec::new();
        let allocated = (|| -> Result<(), &'static str> {
            for ring in &self.tx_rings {
                if ring.allocate()? {
                    fresh_tx.push(ring);
                }
            }
            for ring in &self.rx_rings {
                if ring.allocate(&pool)? {
                    fresh_rx.push(ring);
                }
            }
            Ok(())
        })();
        if let Err(e) = allocated {
            error!("ixgbevf::start(): failed to allocate ring resources: {}", e);
            for ring in fresh_tx {
                ring.free_resources();
            }
            for ring in fresh_rx {
                ring.free_resources();
            }
            if fresh_pool {
                pool.close();
            }
            return Err(DeviceError::NoResources(e));
        }
        inner.rx_pool = Some(pool);
        Ok(())
    }

    /// Disables the rings and drops every packet still on them.
    /// If `free_buffers` is set, every ring's memory and the receive buffer pool are freed too.
    pub fn stop(&self, free_buffers: bool) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        if !self.state.contains(DeviceState::INITIALIZED) {
            return Err(DeviceError::InvalidState);
        }
        self.stop_locked(&mut inner, free_buffers);
        Ok(())
    }

    pub(crate) fn stop_locked(&self, inner: &mut DeviceInner, free_buffers: bool) {
        let was_started = self.state.contains(DeviceState::STARTED);
        self.disable_interrupts();
        self.state.remove(DeviceState::STARTED);
        if was_started {
            self.drain();
        }
        {
            let mut tx_guards: Vec<MutexGuard<'_, TxTail>> = self.tx_rings.iter().map(|ring| ring.lock()).collect();
            let mut rx_guards: Vec<MutexGuard<'_, Option<RxResources>>> = self.rx_rings.iter().map(|ring| ring.lock()).collect();
            for (ring, tx) in self.tx_rings.iter().zip(tx_guards.iter_mut()) {
                ring.disable(tx);
            }
            for (ring, rx) in self.rx_rings.iter().zip(rx_guards.iter_mut()) {
                ring.disable(rx);
            }
        }
        if free_buffers {
            self.free_resources(inner);
        }
        debug!("ixgbevf::stop(): stopped, buffers {}", if free_buffers { "freed" } else { "kept" });
    }

    fn free_resources(&self, inner: &mut DeviceInner) {
        for ring in &self.tx_rings {
            ring.free_resources();
        }
        // the rings' buffers go back to the pool before it is closed
        for ring in &self.rx_rings {
            ring.free_resources();
        }
        if let Some(pool) = inner.rx_pool.take() {
            pool.close();
        }
    }

    /// Waits for senders to leave and for the hardware to finish outstanding packets,
    /// for at most the drain timeout.
    fn drain(&self) {
        let clock = &self.platform.clock;
        let start = clock.now_us();
        loop {
            for ring in &self.tx_rings {
                ring.reclaim();
            }
            let busy = self.tx_rings.iter()
                .any(|ring| ring.active_senders.load(Ordering::Acquire) > 0 || ring.has_outstanding_work());
            if !busy {
                return;
            }
            if clock.now_us().saturating_sub(start) >= self.config.drain_timeout_us {
                warn!("ixgbevf::stop(): tx rings didn't drain within {} us, discarding outstanding packets",
                    self.config.drain_timeout_us);
                return;
            }
            clock.delay_us(self.config.drain_poll_us);
        }
    }

    /// Stops the device, keeping its buffers, until [`Self::resume()`].
    pub fn suspend(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        let state = self.state.get();
        if !state.contains(DeviceState::INITIALIZED) {
            return Err(DeviceError::InvalidState);
        }
        if state.contains(DeviceState::SUSPENDED) {
            return Ok(());
        }
        self.stop_locked(&mut inner, false);
        self.state.insert(DeviceState::SUSPENDED);
        debug!("ixgbevf::suspend(): suspended");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        if !self.state.contains(DeviceState::INITIALIZED) {
            return Err(DeviceError::InvalidState);
        }
        self.state.remove(DeviceState::SUSPENDED);
        self.start_locked(&mut inner)
    }

    /// Stops and restarts the device. If it is in the error state, the PF handshake is redone
    /// and the configuration is sent to the PF again first.
    pub fn reset(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        self.reset_locked(&mut inner)
    }

    pub(crate) fn reset_locked(&self, inner: &mut DeviceInner) -> Result<(), DeviceError> {
        let state = self.state.get();
        if !state.contains(DeviceState::INITIALIZED) {
            return Err(DeviceError::InvalidState);
        }
        let resets = self.counters.resets.fetch_add(1, Ordering::AcqRel) + 1;
        if resets > self.config.max_resets as u64 {
            error!("ixgbevf::reset(): {} resets exceed the limit of {}, leaving the device in the error state",
                resets, self.config.max_resets);
            self.state.insert(DeviceState::ERROR);
            self.stop_locked(inner, false);
            return Err(DeviceError::ResetLimit);
        }
        info!("ixgbevf::reset(): reset {} (state {:?})", resets, state);

        self.stop_locked(inner, false);
        if state.contains(DeviceState::ERROR) {
            self.recover_locked(inner)?;
        }
        self.state.remove(DeviceState::STALL | DeviceState::ERROR);
        if state.contains(DeviceState::STARTED) {
            if let Err(e) = self.start_locked(inner) {
                self.state.insert(DeviceState::ERROR);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Redoes the PF handshake after a fault and replays the configuration the PF forgot.
    /// The device stays in the error state if this fails.
    fn recover_locked(&self, inner: &mut DeviceInner) -> Result<(), DeviceError> {
        let identity = handshake(&mut inner.mailbox, &self.config).map_err(|e| self.mailbox_failed("recover", e))?;
        if identity.limits.tx < self.tx_rings.len() || identity.limits.rx < self.rx_rings.len() {
            error!("ixgbevf::reset(): PF now grants only {} tx and {} rx rings", identity.limits.tx, identity.limits.rx);
            return Err(DeviceError::Mailbox(MailboxError::LimitOutOfRange));
        }
        if inner.mtu > identity.max_mtu {
            error!("ixgbevf::reset(): MTU {} exceeds the PF's new limit of {}", inner.mtu, identity.max_mtu);
            return Err(DeviceError::Mailbox(MailboxError::LimitOutOfRange));
        }
        inner.vlan_strip = identity.limits.vlan_strip;
        inner.max_mtu = identity.max_mtu;
        inner.macs = identity.macs.iter()
            .enumerate()
            .map(|(i, addr)| {
                let enabled = inner.macs.iter()
                    .find(|mac| mac.addr == *addr)
                    .map_or(i == 0, |mac| mac.enabled);
                MacFilter { addr: *addr, enabled }
            })
            .collect();

        // the function-level reset cleared the vector mapping
        self.vector_map.lock().program(&*self.platform.regs);
        self.replay_config(inner).map_err(|e| self.mailbox_failed("recover", e))?;
        info!("ixgbevf::reset(): PF handshake redone and configuration replayed");
        Ok(())
    }

    /// Sends the PF every setting that differs from what it assumes after a reset.
    fn replay_config(&self, inner: &mut DeviceInner) -> Result<(), MailboxError> {
        if inner.mtu != DEFAULT_MTU {
            inner.mailbox.set_mtu(inner.mtu)?;
        }
        for (i, mac) in inner.macs.iter().enumerate() {
            // the PF enables only the primary address on its own
            if mac.enabled != (i == 0) {
                inner.mailbox.set_mac_filter(mac.addr, mac.enabled)?;
            }
        }
        if !inner.multicast.is_empty() {
            inner.mailbox.set_multicast(&inner.multicast)?;
        }
        if inner.mc_promisc {
            inner.mailbox.set_mc_promisc(true)?;
        }
        for vid in inner.vlans.iter() {
            inner.mailbox.set_vlan(*vid, true)?;
        }
        Ok(())
    }

    fn mailbox_failed(&self, op: &str, error: MailboxError) -> DeviceError {
        self.counters.mailbox_errors.fetch_add(1, Ordering::Relaxed);
        error!("ixgbevf::{}(): mailbox request failed: {:?}", op, error);
        DeviceError::Mailbox(error)
    }

    /// Locks the device for a configuration request.
    fn lock_initialized(&self) -> Result<MutexGuard<'_, DeviceInner>, DeviceError> {
        let inner = self.inner.lock();
        if !self.state.contains(DeviceState::INITIALIZED) {
            return Err(DeviceError::InvalidState);
        }
        Ok(inner)
    }

    /// Turns on the receive filter of a PF-assigned MAC address.
    pub fn mac_enable(&self, addr: [u8; 6]) -> Result<(), DeviceError> {
        self.set_mac_filter(addr, true)
    }

    pub fn mac_disable(&self, addr: [u8; 6]) -> Result<(), DeviceError> {
        self.set_mac_filter(addr, false)
    }

    fn set_mac_filter(&self, addr: [u8; 6], enable: bool) -> Result<(), DeviceError> {
        let mut inner = self.lock_initialized()?;
        let i = inner.macs.iter().position(|mac| mac.addr == addr).ok_or(DeviceError::NotAssigned)?;
        if inner.macs[i].enabled == enable {
            return Ok(());
        }
        inner.mailbox.set_mac_filter(addr, enable).map_err(|e| self.mailbox_failed("set_mac_filter", e))?;
        inner.macs[i].enabled = enable;
        debug!("ixgbevf::set_mac_filter(): {:02X?} {}", addr, if enable { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Adds a multicast address and sends the PF the whole list.
    pub fn multicast_add(&self, addr: [u8; 6]) -> Result<(), DeviceError> {
        let mut inner = self.lock_initialized()?;
        if addr[0] & 1 == 0 {
            return Err(DeviceError::OutOfRange);
        }
        if inner.multicast.contains(&addr) {
            return Ok(());
        }
        if inner.multicast.len() >= MAX_MULTICAST_ADDRS {
            return Err(DeviceError::TooMany);
        }
        inner.multicast.push(addr);
        let inner = &mut *inner;
        if let Err(e) = inner.mailbox.set_multicast(&inner.multicast) {
            inner.multicast.pop();
            return Err(self.mailbox_failed("multicast_add", e));
        }
        Ok(())
    }

    pub fn multicast_remove(&self, addr: [u8; 6]) -> Result<(), DeviceError> {
        let mut inner = self.lock_initialized()?;
        let i = inner.multicast.iter().position(|a| *a == addr).ok_or(DeviceError::NotFound)?;
        inner.multicast.remove(i);
        let inner = &mut *inner;
        if let Err(e) = inner.mailbox.set_multicast(&inner.multicast) {
            inner.multicast.insert(i, addr);
            return Err(self.mailbox_failed("multicast_remove", e));
        }
        Ok(())
    }

    pub fn set_multicast_promisc(&self, enable: bool) -> Result<(), DeviceError> {
        let mut inner = self.lock_initialized()?;
        if inner.mc_promisc == enable {
            return Ok(());
        }
        inner.mailbox.set_mc_promisc(enable).map_err(|e| self.mailbox_failed("set_multicast_promisc", e))?;
        inner.mc_promisc = enable;
        Ok(())
    }

    /// Changes the MTU. The device must be stopped.
    ///
    /// If the new MTU needs receive buffers of another size, the rings' receive memory
    /// and the buffer pool are freed and recreated by the next start.
    pub fn set_mtu(&self, mtu: u32) -> Result<(), DeviceError> {
        let mut inner = self.lock_initialized()?;
        if self.state.contains(DeviceState::STARTED) {
            return Err(DeviceError::Busy);
        }
        if mtu < MIN_MTU || mtu > inner.max_mtu {
            return Err(DeviceError::OutOfRange);
        }
        if mtu == inner.mtu {
            return Ok(());
        }
        inner.mailbox.set_mtu(mtu).map_err(|e| self.mailbox_failed("set_mtu", e))?;
        if rx_buffer_data_size(mtu) != rx_buffer_data_size(inner.mtu) {
            for ring in &self.rx_rings {
                ring.free_resources();
            }
            if let Some(pool) = inner.rx_pool.take() {
                pool.close();
            }
        }
        inner.mtu = mtu;
        info!("ixgbevf::set_mtu(): MTU is now {}", mtu);
        Ok(())
    }

    /// Asks the PF to pass frames of VLAN `vid` to this VF.
    pub fn vlan_add(&self, vid: u16) -> Result<(), DeviceError> {
        let mut inner = self.lock_initialized()?;
        if vid >= 4096 {
            return Err(DeviceError::OutOfRange);
        }
        if inner.vlans.contains(&vid) {
            return Ok(());
        }
        if inner.vlans.len() >= MAX_VLAN_FILTERS {
            return Err(DeviceError::TooMany);
        }
        inner.mailbox.set_vlan(vid, true).map_err(|e| self.mailbox_failed("vlan_add", e))?;
        inner.vlans.push(vid);
        Ok(())
    }

    pub fn vlan_remove(&self, vid: u16) -> Result<(), DeviceError> {
        let mut inner = self.lock_initialized()?;
        let i = inner.vlans.iter().position(|v| *v == vid).ok_or(DeviceError::NotFound)?;
        inner.mailbox.set_vlan(vid, false).map_err(|e| self.mailbox_failed("vlan_remove", e))?;
        inner.vlans.remove(i);
        Ok(())
    }

    /// Reallocates the interrupt vectors, aiming for `count`, and remaps every cause onto them.
    /// Returns the number of vectors the device ended up with.
    ///
    /// Receive rings stay enabled meanwhile. Once the new vectors are unmasked,
    /// a software interrupt on every vector picks up whatever arrived in between.
    pub fn adjust_interrupts(&self, count: usize) -> Result<usize, DeviceError> {
        let mut inner = self.lock_initialized()?;
        if count == 0 {
            return Err(DeviceError::OutOfRange);
        }
        let target = count.clamp(self.config.min_vectors, self.config.max_vectors);
        if target == inner.num_vectors {
            return Ok(target);
        }

        self.state.insert(DeviceState::INTR_ADJUSTING);
        self.disable_interrupts();
        let old = Arc::clone(&*self.vector_map.lock());
        teardown_vectors(&self.platform, &old);

        let (rx, tx) = (self.rx_rings.len(), self.tx_rings.len());
        let result = setup_vectors(&self.platform, self.config.min_vectors, target, rx, tx).or_else(|e| {
            warn!("ixgbevf::adjust_interrupts(): couldn't get {} vectors ({:?}), restoring {}", target, e, old.num_vectors());
            setup_vectors(&self.platform, self.config.min_vectors, old.num_vectors(), rx, tx)
        });
        let map = match result {
            Ok(map) => Arc::new(map),
            Err(e) => {
                error!("ixgbevf::adjust_interrupts(): device left without vectors: {:?}", e);
                inner.num_vectors = 0;
                self.state.insert(DeviceState::ERROR);
                self.state.remove(DeviceState::INTR_ADJUSTING);
                return Err(e);
            }
        };
        inner.num_vectors = map.num_vectors();
        *self.vector_map.lock() = Arc::clone(&map);
        self.state.remove(DeviceState::INTR_ADJUSTING);

        if self.state.contains(DeviceState::STARTED) {
            self.enable_interrupts(&map);
            self.platform.regs.write_reg(regs::VTEICS, map.mask());
        }
        info!("ixgbevf::adjust_interrupts(): now using {} vectors", map.num_vectors());
        Ok(map.num_vectors())
    }

    fn enable_interrupts(&self, map: &VectorMap) {
        let regs = &*self.platform.regs;
        let mask = map.mask();
        regs.write_reg(regs::VTEIAC, mask);
        regs.write_reg(regs::VTEIAM, mask);
        for vector in 0..map.num_vectors() {
            regs.write_reg(regs::vteitr(vector), regs::DEFAULT_EITR_INTERVAL);
        }
        regs.write_reg(regs::VTEIMS, mask);
    }

    fn disable_interrupts(&self) {
        self.platform.regs.write_reg(regs::VTEIMC, ALL_VECTORS);
    }

    /// Turns interrupt-driven completion of one ring back on.
    /// While vectors are being reallocated this succeeds without effect.
    pub fn interrupt_enable(&self, direction: RingDirection, index: usize) -> Result<(), DeviceError> {
        self.set_ring_interrupt(direction, index, true)
    }

    /// Turns interrupt-driven completion of one ring off, e.g. while the stack polls it.
    pub fn interrupt_disable(&self, direction: RingDirection, index: usize) -> Result<(), DeviceError> {
        self.set_ring_interrupt(direction, index, false)
    }

    fn set_ring_interrupt(&self, direction: RingDirection, index: usize, enabled: bool) -> Result<(), DeviceError> {
        if self.state.contains(DeviceState::INTR_ADJUSTING) {
            return Ok(());
        }
        match direction {
            RingDirection::Rx => self.rx_rings.get(index).ok_or(DeviceError::NotFound)?.set_interrupt_enabled(enabled),
            RingDirection::Tx => self.tx_rings.get(index).ok_or(DeviceError::NotFound)?.intr_enabled.store(enabled, Ordering::Release),
        }
        Ok(())
    }

    /// The handler of MSI-X vector `vector`.
    pub fn handle_interrupt(&self, vector: usize) {
        let map = Arc::clone(&*self.vector_map.lock());
        if vector >= map.num_vectors() {
            warn!("ixgbevf::handle_interrupt(): spurious interrupt on vector {}", vector);
            return;
        }
        let running = self.state.is_running();
        for cause in map.causes(vector) {
            match *cause {
                InterruptCause::Rx(i) if running => {
                    if let Some(ring) = self.rx_rings.get(i).filter(|ring| ring.intr_enabled.load(Ordering::Acquire)) {
                        let frames = ring.poll(self.config.rx_budget);
                        if !frames.is_empty() {
                            self.platform.stack.deliver(ring.handle(), frames);
                        }
                    }
                }
                InterruptCause::Tx(i) if running => {
                    if let Some(ring) = self.tx_rings.get(i).filter(|ring| ring.intr_enabled.load(Ordering::Acquire)) {
                        ring.reclaim();
                    }
                }
                InterruptCause::Other => {
                    // the watchdog gets to it if the device is busy
                    if let Some(mut inner) = self.inner.try_lock() {
                        self.service_mailbox(&mut inner);
                    }
                }
                _ => {}
            }
        }
        if self.state.contains(DeviceState::STARTED) && !self.state.contains(DeviceState::INTR_ADJUSTING) {
            // the vector was auto-masked when it fired
            self.platform.regs.write_reg(regs::VTEIMS, 1 << vector);
        }
    }

    /// Hands `packet` to transmit ring `index`.
    pub fn send(&self, index: usize, packet: Packet) -> SendResult {
        match self.tx_rings.get(index) {
            Some(ring) => ring.send(packet),
            None => SendResult::Dropped,
        }
    }

    /// Collects up to `budget` received frames from receive ring `index`.
    pub fn poll(&self, index: usize, budget: usize) -> Vec<ReceivedFrame> {
        self.rx_rings.get(index).map(|ring| ring.poll(budget)).unwrap_or_default()
    }

    /// The VF has one transmit group and one receive group.
    pub fn groups(&self) -> Vec<RingGroup> {
        alloc::vec![
            RingGroup { direction: RingDirection::Tx, index: 0, rings: (0..self.tx_rings.len()).collect() },
            RingGroup { direction: RingDirection::Rx, index: 0, rings: (0..self.rx_rings.len()).collect() },
        ]
    }

    pub fn ring_stats(&self, direction: RingDirection, index: usize) -> Option<RingStats> {
        match direction {
            RingDirection::Tx => self.tx_rings.get(index).map(TxRing::stats),
            RingDirection::Rx => self.rx_rings.get(index).map(RxRing::stats),
        }
    }

    pub fn ring_handle(&self, direction: RingDirection, index: usize) -> Option<RingHandle> {
        match direction {
            RingDirection::Tx => self.tx_rings.get(index).map(TxRing::handle),
            RingDirection::Rx => self.rx_rings.get(index).map(RxRing::handle),
        }
    }

    pub fn tx_census(&self, index: usize) -> Option<TxCensus> {
        self.tx_rings.get(index).and_then(TxRing::census)
    }

    pub fn tx_ring(&self, index: usize) -> Option<&TxRing> {
        self.tx_rings.get(index)
    }

    pub fn rx_ring(&self, index: usize) -> Option<&RxRing> {
        self.rx_rings.get(index)
    }

    pub fn state(&self) -> DeviceState {
        self.state.get()
    }

    pub fn link_is_up(&self) -> bool {
        self.link_up.load(Ordering::Acquire)
    }

    pub fn mac_addrs(&self) -> Vec<MacFilter> {
        self.inner.lock().macs.clone()
    }

    pub fn mtu(&self) -> u32 {
        self.inner.lock().mtu
    }

    pub fn num_vectors(&self) -> usize {
        self.inner.lock().num_vectors
    }

    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            resets: self.counters.resets.load(Ordering::Relaxed),
            stall_resets: self.counters.stall_resets.load(Ordering::Relaxed),
            error_resets: self.counters.error_resets.load(Ordering::Relaxed),
            mailbox_errors: self.counters.mailbox_errors.load(Ordering::Relaxed),
        }
    }
}

/// Resets the VF and learns its identity and limits from the PF.
fn handshake(mailbox: &mut MailboxClient, config: &VfConfig) -> Result<Identity, MailboxError> {
    mailbox.reset()?;
    let version = mailbox.negotiate_api()?;
    let macs = mailbox.get_mac_addrs(config.max_mac_restarts)?;
    let limits = mailbox.get_queues()?;
    let max_mtu = mailbox.get_mtu_limit()?;
    debug!("ixgbevf::handshake(): API {}, {} MACs, limits {:?}, max MTU {}", version, macs.len(), limits, max_mtu);
    Ok(Identity { macs, limits, max_mtu })
}

/// Allocates between `min` and `max` vectors, maps every cause onto them, and attaches them.
/// On failure nothing stays allocated or attached.
fn setup_vectors(platform: &Platform, min: usize, max: usize, rx_rings: usize, tx_rings: usize) -> Result<VectorMap, DeviceError> {
    let granted = platform.interrupts.alloc_vectors(min, max).map_err(|e| {
        error!("ixgbevf::setup_vectors(): failed to allocate {} to {} vectors: {}", min, max, e);
        DeviceError::NoResources(e)
    })?;
    let map = match VectorMap::assign(granted, rx_rings, tx_rings) {
        Ok(map) => map,
        Err(e) => {
            platform.interrupts.free_vectors();
            return Err(DeviceError::NoResources(e));
        }
    };
    map.program(&*platform.regs);
    for vector in 0..map.num_vectors() {
        if let Err(e) = platform.interrupts.attach(vector) {
            error!("ixgbevf::setup_vectors(): failed to attach vector {}: {}", vector, e);
            for attached in 0..vector {
                platform.interrupts.detach(attached);
            }
            platform.interrupts.free_vectors();
            return Err(DeviceError::NoResources(e));
        }
    }
    Ok(map)
}

fn teardown_vectors(platform: &Platform, map: &VectorMap) {
    for vector in 0..map.num_vectors() {
        platform.interrupts.detach(vector);
    }
    platform.interrupts.free_vectors();
}

fn unregister_rings(platform: &Platform, tx_rings: &[TxRing], rx_rings: &[RxRing]) {
    for ring in tx_rings {
        platform.stack.unregister_ring(ring.handle());
    }
    for ring in rx_rings {
        platform.stack.unregister_ring(ring.handle());
    }
}
