//! Moving words through the VFMAILBOX/VFMBMEM register pair.
//!
//! The mailbox is one buffer shared by both sides. Whoever writes takes ownership
//! of the buffer first (VFU for the VF), and the read-to-clear bits of VFMAILBOX
//! tell each side what the other has done.

use alloc::{sync::Arc, vec::Vec};
use nic_hal::{Clock, RegisterAccess};
use crate::regs::{
    MAILBOX_SIZE, VFMAILBOX, VFMAILBOX_ACK, VFMAILBOX_PFACK, VFMAILBOX_PFSTS, VFMAILBOX_R2C_BITS,
    VFMAILBOX_REQ, VFMAILBOX_RSTD, VFMAILBOX_RSTI, VFMAILBOX_VFU, VFMBMEM,
};
use super::MailboxError;

pub struct MailboxTransport {
    regs: Arc<dyn RegisterAccess>,
    clock: Arc<dyn Clock>,
    timeout_us: u64,
    poll_us: u64,
    /// Read-to-clear bits seen in VFMAILBOX but not yet consumed.
    cached_bits: u32,
}

impl MailboxTransport {
    pub fn new(regs: Arc<dyn RegisterAccess>, clock: Arc<dyn Clock>, timeout_us: u64, poll_us: u64) -> MailboxTransport {
        MailboxTransport { regs, clock, timeout_us, poll_us, cached_bits: 0 }
    }

    pub(crate) fn regs(&self) -> &dyn RegisterAccess {
        &*self.regs
    }

    fn read_mailbox(&mut self) -> u32 {
        let value = self.regs.read_reg(VFMAILBOX);
        self.cached_bits |= value & VFMAILBOX_R2C_BITS;
        value | self.cached_bits
    }

    /// Consumes `mask` from the cached read-to-clear bits. True if any of them was set.
    fn check_for_bit(&mut self, mask: u32) -> bool {
        let value = self.read_mailbox();
        if value & mask != 0 {
            self.cached_bits &= !mask;
            true
        } else {
            false
        }
    }

    /// True if the PF has written a message.
    pub fn check_for_msg(&mut self) -> bool {
        self.check_for_bit(VFMAILBOX_PFSTS)
    }

    /// True if the PF has acknowledged our message.
    pub fn check_for_ack(&mut self) -> bool {
        self.check_for_bit(VFMAILBOX_PFACK)
    }

    /// True if the PF is resetting, or has reset, the VF.
    pub fn check_for_rst(&mut self) -> bool {
        let value = self.read_mailbox();
        if value & (VFMAILBOX_RSTD | VFMAILBOX_RSTI) != 0 {
            self.cached_bits &= !VFMAILBOX_RSTD;
            true
        } else {
            false
        }
    }

    /// Polls `check` until it succeeds or the mailbox timeout runs out.
    fn poll(&mut self, check: fn(&mut MailboxTransport) -> bool) -> Result<(), MailboxError> {
        let start = self.clock.now_us();
        loop {
            if check(self) {
                return Ok(());
            }
            if self.clock.now_us().saturating_sub(start) >= self.timeout_us {
                return Err(MailboxError::Timeout);
            }
            self.clock.delay_us(self.poll_us);
        }
    }

    /// Waits for the reset-done indication after a function-level reset.
    pub fn wait_for_reset(&mut self) -> Result<(), MailboxError> {
        let start = self.clock.now_us();
        loop {
            if self.read_mailbox() & VFMAILBOX_RSTD != 0 {
                self.cached_bits &= !VFMAILBOX_RSTD;
                return Ok(());
            }
            if self.clock.now_us().saturating_sub(start) >= self.timeout_us {
                return Err(MailboxError::Timeout);
            }
            self.clock.delay_us(self.poll_us);
        }
    }

    /// Takes ownership of the mailbox buffer.
    fn obtain_lock(&mut self) -> Result<(), MailboxError> {
        self.poll(|mbx| {
            mbx.regs.write_reg(VFMAILBOX, VFMAILBOX_VFU);
            mbx.read_mailbox() & VFMAILBOX_VFU != 0
        }).map_err(|_| MailboxError::Busy)
    }

    /// Writes a message and waits until the PF acknowledges it.
    pub fn write_posted(&mut self, words: &[u32]) -> Result<(), MailboxError> {
        if words.is_empty() || words.len() > MAILBOX_SIZE {
            return Err(MailboxError::Malformed);
        }
        self.obtain_lock()?;
        // forget stale indications from before this message
        self.check_for_msg();
        self.check_for_ack();
        for (i, word) in words.iter().enumerate() {
            self.regs.write_reg(VFMBMEM + 4 * i as u32, *word);
        }
        // releases VFU and interrupts the PF
        self.regs.write_reg(VFMAILBOX, VFMAILBOX_REQ);
        self.poll(MailboxTransport::check_for_ack)
    }

    /// Waits for a message from the PF and reads it.
    pub fn read_posted(&mut self) -> Result<Vec<u32>, MailboxError> {
        self.poll(MailboxTransport::check_for_msg)?;
        self.read_message()
    }

    /// Reads the message that the PF signalled and acknowledges it.
    pub fn read_message(&mut self) -> Result<Vec<u32>, MailboxError> {
        self.obtain_lock()?;
        let words = (0..MAILBOX_SIZE)
            .map(|i| self.regs.read_reg(VFMBMEM + 4 * i as u32))
            .collect();
        // releases VFU and tells the PF the message was received
        self.regs.write_reg(VFMAILBOX, VFMAILBOX_ACK);
        Ok(words)
    }
}
