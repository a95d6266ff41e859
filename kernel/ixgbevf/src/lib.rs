//! A driver core for the virtual function (VF) of the Intel 82599 10GbE NIC under SR-IOV.
//!
//! A VF owns a handful of rings and little else. Its MAC addresses, filters, and
//! limits belong to the physical function (PF), which the VF asks through a mailbox.
//! This crate implements the rings, the mailbox protocol, and the state machine
//! that ties them together; the platform supplies register access, DMA memory,
//! a clock, interrupt vectors, and the network stack above the driver through [`Platform`].
//!
//! The main entry point is [`IxgbeVfNic::attach()`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;
#[macro_use] extern crate bitflags;
#[macro_use] extern crate static_assertions;

pub mod config;
pub mod control_block;
mod device;
pub mod interrupts;
pub mod mailbox;
pub mod packet;
mod queue_registers;
pub mod regs;
pub mod rx;
pub mod stack;
pub mod state;
pub mod tx;
mod tx_reclaim;
mod watchdog;
#[cfg(test)]
mod test_support;

use alloc::sync::Arc;
use nic_hal::{Clock, DmaAllocator, HalError, RegisterAccess};

pub use config::{ReclaimStrategy, VfConfig};
pub use device::{DeviceStats, IxgbeVfNic, MacFilter};
pub use interrupts::{InterruptCause, InterruptController, VectorMap};
pub use mailbox::MailboxError;
pub use packet::{Packet, TxOffload, TxOffloadFlags};
pub use stack::{NetStack, RingDirection, RingGroup, RingHandle, RingStats, SendResult};
pub use state::DeviceState;

const_assert!(regs::MAX_MSIX_VECTORS <= 32);
const_assert!(config::MAX_MULTICAST_ADDRS / 2 < regs::MAILBOX_SIZE);

/// Everything the driver needs from the system it runs in.
#[derive(Clone)]
pub struct Platform {
    pub regs: Arc<dyn RegisterAccess>,
    pub dma: Arc<dyn DmaAllocator>,
    pub clock: Arc<dyn Clock>,
    pub interrupts: Arc<dyn InterruptController>,
    pub stack: Arc<dyn NetStack>,
}

/// The errors of the VF's control operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceError {
    InvalidConfig(&'static str),
    Hal(HalError),
    Mailbox(MailboxError),
    /// Memory, vectors, or ring registrations couldn't be obtained.
    NoResources(&'static str),
    /// Programming the rings into the device failed.
    Hardware(&'static str),
    /// The operation isn't allowed in the device's current state.
    InvalidState,
    /// The operation needs the device stopped.
    Busy,
    /// The MAC address isn't one the PF assigned to this VF.
    NotAssigned,
    OutOfRange,
    TooMany,
    NotFound,
    /// The device was reset too many times and stays in the error state.
    ResetLimit,
}

impl From<HalError> for DeviceError {
    fn from(error: HalError) -> Self {
        DeviceError::Hal(error)
    }
}

impl From<MailboxError> for DeviceError {
    fn from(error: MailboxError) -> Self {
        DeviceError::Mailbox(error)
    }
}

impl From<DeviceError> for &'static str {
    fn from(error: DeviceError) -> Self {
        match error {
            DeviceError::InvalidConfig(e) | DeviceError::NoResources(e) | DeviceError::Hardware(e) => e,
            DeviceError::Hal(e) => e.into(),
            DeviceError::Mailbox(e) => e.into(),
            DeviceError::InvalidState => "ixgbevf: operation not allowed in the current state",
            DeviceError::Busy => "ixgbevf: operation requires the device to be stopped",
            DeviceError::NotAssigned => "ixgbevf: MAC address not assigned to this VF",
            DeviceError::OutOfRange => "ixgbevf: value out of range",
            DeviceError::TooMany => "ixgbevf: too many entries",
            DeviceError::NotFound => "ixgbevf: no such entry",
            DeviceError::ResetLimit => "ixgbevf: too many resets, device left in the error state",
        }
    }
}
