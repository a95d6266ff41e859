//! The periodic health check of a VF.
//!
//! The platform calls [`IxgbeVfNic::watchdog_tick()`] every few seconds. It is the only path
//! that recovers a device from the error or stall states, and the one that notices
//! PF messages if the mailbox vector is shared with a busy ring.

use core::sync::atomic::Ordering;
use nic_hal::HalError;
use crate::{
    DeviceError,
    device::{DeviceInner, IxgbeVfNic},
    mailbox::Notification,
    regs,
    state::DeviceState,
};

const MAX_NOTIFICATIONS_PER_TICK: usize = 8;

impl IxgbeVfNic {
    /// Checks the hardware, reclaims finished transmissions, resets the device if it is
    /// in the error state or a transmit ring stalled, refreshes the link state, publishes
    /// ring statistics, and services the mailbox.
    pub fn watchdog_tick(&self) {
        if !self.state.contains(DeviceState::INITIALIZED) {
            return;
        }
        if let Err(e) = self.check_integrity() {
            if !self.state.contains(DeviceState::ERROR) {
                error!("ixgbevf::watchdog_tick(): hardware fault: {:?}", e);
                self.state.insert(DeviceState::ERROR);
            }
        }

        let state = self.state.get();
        if state.contains(DeviceState::ERROR | DeviceState::STARTED) {
            let mut inner = self.inner.lock();
            match self.reset_locked(&mut inner) {
                Err(DeviceError::ResetLimit) => {}
                result => {
                    self.counters.error_resets.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = result {
                        error!("ixgbevf::watchdog_tick(): reset after error failed: {:?}", e);
                    }
                }
            }
            return;
        }

        if state.contains(DeviceState::STARTED) {
            let mut stalled = false;
            for ring in &self.tx_rings {
                ring.reclaim();
                stalled |= ring.is_stalled();
            }
            if stalled {
                self.state.insert(DeviceState::STALL);
                warn!("ixgbevf::watchdog_tick(): tx ring stalled, resetting");
                let mut inner = self.inner.lock();
                match self.reset_locked(&mut inner) {
                    Err(DeviceError::ResetLimit) => {}
                    result => {
                        self.counters.stall_resets.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = result {
                            error!("ixgbevf::watchdog_tick(): reset after stall failed: {:?}", e);
                        }
                    }
                }
                return;
            }
        }

        self.refresh_link();
        self.publish_stats();
        // skipped this time if an admin operation holds the lock
        if let Some(mut inner) = self.inner.try_lock() {
            self.service_mailbox(&mut inner);
        }
    }

    fn check_integrity(&self) -> Result<(), HalError> {
        self.platform.regs.check_access()?;
        for ring in &self.tx_rings {
            if let Some(res) = ring.resources() {
                res.ring.check_handle()?;
            }
        }
        for ring in &self.rx_rings {
            ring.check_handle()?;
        }
        Ok(())
    }

    /// Reads the link state and tells the stack if it changed.
    pub(crate) fn refresh_link(&self) {
        let up = self.platform.regs.read_reg(regs::VFLINKS) & regs::VFLINKS_UP != 0;
        if self.link_up.swap(up, Ordering::AcqRel) != up {
            info!("ixgbevf: link {}", if up { "up" } else { "down" });
            self.platform.stack.link_changed(up);
        }
    }

    fn publish_stats(&self) {
        for ring in &self.tx_rings {
            self.platform.stack.update_stats(ring.handle(), ring.stats());
        }
        for ring in &self.rx_rings {
            self.platform.stack.update_stats(ring.handle(), ring.stats());
        }
    }

    /// Handles a PF reset or a message from the PF. The caller holds the device lock.
    pub(crate) fn service_mailbox(&self, inner: &mut DeviceInner) {
        // a request made since the last tick may have queued more than one notification
        for _ in 0..MAX_NOTIFICATIONS_PER_TICK {
            match inner.mailbox.poll_notifications() {
                Ok(None) => return,
                Ok(Some(Notification::PfReset)) => {
                    warn!("ixgbevf::service_mailbox(): PF reset, the device needs a reset");
                    self.state.insert(DeviceState::ERROR);
                    return;
                }
                Ok(Some(Notification::VlanStrip(enable))) => {
                    // applied when the receive rings are next programmed
                    inner.vlan_strip = enable;
                }
                Err(e) => {
                    self.counters.mailbox_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("ixgbevf::service_mailbox(): {:?}", e);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use crate::{
        DeviceError, Packet, RingDirection, SendResult,
        config::VfConfig,
        mailbox::message::{Opcode, MSG_CTS},
        state::DeviceState,
        test_support::{frame, test_config, Harness, PfConfig},
    };

    const MAC2: [u8; 6] = [0x02, 0, 0, 0, 0, 0x02];

    #[test]
    fn pf_reset_is_recovered_and_the_configuration_replayed() {
        let h = Harness::new(PfConfig::default());
        let nic = h.attach(test_config()).unwrap();
        nic.set_mtu(3000).unwrap();
        nic.start().unwrap();
        nic.mac_enable(MAC2).unwrap();
        nic.multicast_add([0x01, 0x00, 0x5E, 0x00, 0x00, 0x01]).unwrap();
        nic.set_multicast_promisc(true).unwrap();
        nic.vlan_add(10).unwrap();

        h.sim.trigger_pf_reset();
        nic.watchdog_tick();
        assert!(nic.state().contains(DeviceState::ERROR));
        nic.watchdog_tick();
        assert!(nic.state().contains(DeviceState::STARTED));
        assert!(!nic.state().contains(DeviceState::ERROR));

        for opcode in [Opcode::Reset, Opcode::ApiNegotiate, Opcode::SetMtu, Opcode::SetMacFilter,
            Opcode::SetMulticast, Opcode::UpdateXcastMode, Opcode::SetVlan]
        {
            assert_eq!(h.sim.request_count(opcode), 2, "{:?}", opcode);
        }
        assert!(nic.mac_addrs()[1].enabled);
        assert_eq!(nic.stats().error_resets, 1);
        assert_eq!(nic.stats().resets, 1);
        assert_eq!(nic.send(0, Packet::new(vec![frame(60, 1)])), SendResult::Sent);
    }

    #[test]
    fn stalled_ring_is_reset() {
        let h = Harness::new(PfConfig::default());
        let nic = h.started(test_config());
        assert_eq!(nic.send(0, Packet::new(vec![frame(60, 1)])), SendResult::Sent);

        h.clock.advance(500);
        nic.watchdog_tick();
        assert_eq!(nic.stats().stall_resets, 0);

        h.clock.advance(1000);
        nic.watchdog_tick();
        let stats = nic.stats();
        assert_eq!((stats.stall_resets, stats.resets, stats.error_resets), (1, 1, 0));
        let state = nic.state();
        assert!(state.contains(DeviceState::STARTED));
        assert!(!state.intersects(DeviceState::STALL | DeviceState::ERROR));
        assert!(!nic.tx_ring(0).unwrap().is_stalled());
        assert_eq!(nic.tx_census(0).unwrap().free_descriptors, 8);
        // a stall reset doesn't need the PF
        assert_eq!(h.sim.request_count(Opcode::Reset), 1);
    }

    #[test]
    fn no_stall_while_the_link_is_down() {
        let h = Harness::new(PfConfig::default());
        let nic = h.started(test_config());
        h.sim.set_link(false);
        nic.watchdog_tick();
        assert_eq!(h.stack.link_events(), vec![true, false]);
        assert!(!nic.link_is_up());

        assert_eq!(nic.send(0, Packet::new(vec![frame(60, 1)])), SendResult::Sent);
        h.clock.advance(5000);
        nic.watchdog_tick();
        assert_eq!(nic.stats().stall_resets, 0);

        h.sim.set_link(true);
        nic.watchdog_tick();
        assert_eq!(h.stack.link_events(), vec![true, false, true]);
    }

    #[test]
    fn register_fault_resets_a_running_device() {
        let h = Harness::new(PfConfig::default());
        let nic = h.started(test_config());
        h.sim.set_access_fault(true);
        nic.watchdog_tick();
        h.sim.set_access_fault(false);
        assert_eq!(nic.stats().error_resets, 1);
        assert_eq!(h.sim.request_count(Opcode::Reset), 2);
        assert!(nic.state().contains(DeviceState::STARTED));
        assert!(!nic.state().contains(DeviceState::ERROR));
    }

    #[test]
    fn fault_on_a_stopped_device_is_recovered_by_start() {
        let h = Harness::new(PfConfig::default());
        let nic = h.attach(test_config()).unwrap();
        h.sim.set_access_fault(true);
        nic.watchdog_tick();
        h.sim.set_access_fault(false);
        assert!(nic.state().contains(DeviceState::ERROR));
        assert_eq!(nic.stats().error_resets, 0);

        nic.start().unwrap();
        assert!(!nic.state().contains(DeviceState::ERROR));
        assert_eq!(h.sim.request_count(Opcode::Reset), 2);
    }

    #[test]
    fn failed_recovery_leaves_the_device_in_error() {
        let h = Harness::new(PfConfig::default());
        let nic = h.started(test_config());
        h.sim.trigger_pf_reset();
        nic.watchdog_tick();
        h.sim.set_unresponsive(true);
        nic.watchdog_tick();
        let state = nic.state();
        assert!(state.contains(DeviceState::ERROR));
        assert!(!state.contains(DeviceState::STARTED));
        assert!(nic.stats().mailbox_errors > 0);

        h.sim.set_unresponsive(false);
        nic.start().unwrap();
        assert!(!nic.state().contains(DeviceState::ERROR));
    }

    #[test]
    fn resets_refused_by_the_limit_are_not_counted() {
        let h = Harness::new(PfConfig::default());
        let nic = h.started(VfConfig { max_resets: 1, ..test_config() });
        nic.reset().unwrap();

        h.sim.trigger_pf_reset();
        nic.watchdog_tick();
        assert!(nic.state().contains(DeviceState::ERROR));
        nic.watchdog_tick();
        let stats = nic.stats();
        assert_eq!((stats.resets, stats.error_resets), (2, 0));
        assert!(nic.state().contains(DeviceState::ERROR));
        assert!(!nic.state().contains(DeviceState::STARTED));
    }

    #[test]
    fn stall_resets_refused_by_the_limit_are_not_counted() {
        let h = Harness::new(PfConfig::default());
        let nic = h.started(VfConfig { max_resets: 1, ..test_config() });
        nic.reset().unwrap();
        assert_eq!(nic.send(0, Packet::new(vec![frame(60, 1)])), SendResult::Sent);

        h.clock.advance(1500);
        nic.watchdog_tick();
        let stats = nic.stats();
        assert_eq!((stats.resets, stats.stall_resets), (2, 0));
        assert!(nic.state().contains(DeviceState::ERROR));
    }

    #[test]
    fn notification_received_during_a_request_is_applied() {
        let h = Harness::new(PfConfig::default());
        let nic = h.attach(test_config()).unwrap();
        assert!(!nic.inner.lock().vlan_strip);

        h.sim.pf_send_before_next_reply(&[Opcode::VlanStripNotify as u32 | MSG_CTS, 1]);
        nic.set_mtu(2000).unwrap();
        assert_eq!(nic.mtu(), 2000);
        nic.watchdog_tick();
        assert!(nic.inner.lock().vlan_strip);
        assert_eq!(nic.stats().mailbox_errors, 0);
    }

    #[test]
    fn ring_statistics_reach_the_stack() {
        let h = Harness::new(PfConfig::default());
        let nic = h.started(test_config());
        assert_eq!(nic.send(0, Packet::new(vec![frame(100, 1)])), SendResult::Sent);
        nic.watchdog_tick();
        let handle = nic.ring_handle(RingDirection::Tx, 0).unwrap();
        let stats = h.stack.last_stats(handle).unwrap();
        assert_eq!((stats.packets, stats.bytes), (1, 100));
        assert_eq!(nic.ring_stats(RingDirection::Tx, 0), Some(stats));
        assert_eq!(nic.ring_stats(RingDirection::Tx, 1), None);
        assert!(h.stack.last_stats(nic.ring_handle(RingDirection::Rx, 0).unwrap()).is_some());
    }

    #[test]
    fn detached_device_is_left_alone() {
        let h = Harness::new(PfConfig::default());
        let nic = h.started(test_config());
        nic.detach().unwrap();
        h.sim.trigger_pf_reset();
        nic.watchdog_tick();
        nic.watchdog_tick();
        assert!(nic.state().is_empty());
        assert_eq!(nic.reset(), Err(DeviceError::InvalidState));
    }
}
