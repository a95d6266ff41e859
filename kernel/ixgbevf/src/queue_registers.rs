//! Access to the registers of one VF receive or transmit queue.
//! They implement the `RxQueueRegisters` and `TxQueueRegisters` traits so the generic
//! ring setup in `nic_initialization` can program them.

use nic_hal::RegisterAccess;
use nic_initialization::{RxQueueRegisters, TxQueueRegisters};
use crate::regs;

/// The registers of receive queue `index`, reached through the VF's register window.
pub struct VfRxQueueRegisters<'r> {
    pub regs: &'r dyn RegisterAccess,
    pub index: usize,
}

impl RxQueueRegisters for VfRxQueueRegisters<'_> {
    fn set_rdbal(&mut self, value: u32) {
        self.regs.write_reg(regs::rdbal(self.index), value)
    }
    fn set_rdbah(&mut self, value: u32) {
        self.regs.write_reg(regs::rdbah(self.index), value)
    }
    fn set_rdlen(&mut self, value: u32) {
        self.regs.write_reg(regs::rdlen(self.index), value)
    }
    fn set_rdh(&mut self, value: u32) {
        self.regs.write_reg(regs::rdh(self.index), value)
    }
    fn set_rdt(&mut self, value: u32) {
        self.regs.write_reg(regs::rdt(self.index), value)
    }
}

/// The registers of transmit queue `index`, reached through the VF's register window.
pub struct VfTxQueueRegisters<'r> {
    pub regs: &'r dyn RegisterAccess,
    pub index: usize,
}

impl TxQueueRegisters for VfTxQueueRegisters<'_> {
    fn set_tdbal(&mut self, value: u32) {
        self.regs.write_reg(regs::tdbal(self.index), value)
    }
    fn set_tdbah(&mut self, value: u32) {
        self.regs.write_reg(regs::tdbah(self.index), value)
    }
    fn set_tdlen(&mut self, value: u32) {
        self.regs.write_reg(regs::tdlen(self.index), value)
    }
    fn set_tdh(&mut self, value: u32) {
        self.regs.write_reg(regs::tdh(self.index), value)
    }
    fn set_tdt(&mut self, value: u32) {
        self.regs.write_reg(regs::tdt(self.index), value)
    }
}
