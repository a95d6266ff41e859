//! The request/response protocol through which a VF asks its PF for everything
//! it can't do itself: its MAC addresses, its queue and MTU limits, and its filters.
//!
//! One request is outstanding at a time. Every request is answered with the same opcode
//! and either ACK or NACK; a reply with neither was never processed by the PF.

pub mod message;
mod transport;

use alloc::{collections::VecDeque, sync::Arc, vec::Vec};
use nic_hal::{Clock, RegisterAccess};
use crate::{
    config::{MAX_MTU, MAX_MULTICAST_ADDRS, MAX_RING_PAIRS, MIN_MTU},
    regs::{VFCTRL, VFCTRL_RST},
};
use message::{acknowledgement_word, multicast_hash, refusal_word, Envelope, Message, MsgStatus, Opcode};
pub use transport::MailboxTransport;

/// The mailbox API version this driver speaks.
pub const API_VERSION: u32 = 3;
/// The most MAC addresses a PF may assign to one VF.
pub const MAX_MAC_ADDRS: u32 = 64;
/// How many messages of its own the PF may send before it answers a request.
const MAX_INTERLEAVED: usize = 4;

/// The errors of a mailbox transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailboxError {
    /// The PF didn't react within the mailbox timeout.
    Timeout,
    /// The mailbox buffer couldn't be taken from the PF.
    Busy,
    /// The PF refused the request.
    Nack(Opcode),
    /// The PF replied without ACK or NACK, i.e. it never processed the request.
    Unprocessed(Opcode),
    /// The reply doesn't belong to the request.
    UnexpectedReply,
    UnknownOpcode(u16),
    Malformed,
    /// A message has more entries than the mailbox allows.
    TooMany,
    /// The PF reset the VF; everything negotiated so far is void.
    PfReset,
    VersionMismatch { requested: u32, acked: u32 },
    /// A limit the PF reported is outside what the hardware supports.
    LimitOutOfRange,
    /// The PF kept changing the MAC list while it was being fetched.
    MacListUnstable,
}

impl From<MailboxError> for &'static str {
    fn from(error: MailboxError) -> Self {
        match error {
            MailboxError::Timeout => "mailbox: timed out waiting for the PF",
            MailboxError::Busy => "mailbox: couldn't obtain the mailbox buffer",
            MailboxError::Nack(_) => "mailbox: the PF refused the request",
            MailboxError::Unprocessed(_) => "mailbox: the PF didn't process the request",
            MailboxError::UnexpectedReply => "mailbox: reply doesn't match the request",
            MailboxError::UnknownOpcode(_) => "mailbox: unknown opcode",
            MailboxError::Malformed => "mailbox: malformed message",
            MailboxError::TooMany => "mailbox: too many entries for one message",
            MailboxError::PfReset => "mailbox: the PF reset the VF",
            MailboxError::VersionMismatch { .. } => "mailbox: the PF doesn't support our API version",
            MailboxError::LimitOutOfRange => "mailbox: the PF reported a limit outside the hardware's range",
            MailboxError::MacListUnstable => "mailbox: the MAC address list kept changing",
        }
    }
}

/// The rings the PF lets this VF use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueLimits {
    pub tx: usize,
    pub rx: usize,
    /// Whether the PF has VLAN stripping enabled on the VF's receive rings.
    pub vlan_strip: bool,
}

/// Something the PF told us without being asked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Notification {
    PfReset,
    VlanStrip(bool),
}

/// The VF side of the mailbox protocol.
pub struct MailboxClient {
    transport: MailboxTransport,
    /// The negotiated API version, if negotiation succeeded since the last reset.
    api: Option<u32>,
    /// Notifications that arrived while a reply was awaited.
    pending: VecDeque<Notification>,
}

impl MailboxClient {
    pub fn new(regs: Arc<dyn RegisterAccess>, clock: Arc<dyn Clock>, timeout_us: u64, poll_us: u64) -> MailboxClient {
        MailboxClient {
            transport: MailboxTransport::new(regs, clock, timeout_us, poll_us),
            api: None,
            pending: VecDeque::new(),
        }
    }

    pub fn api_version(&self) -> Option<u32> {
        self.api
    }

    /// Sends `request` and returns the PF's acknowledged reply.
    fn transact(&mut self, request: Message) -> Result<Message, MailboxError> {
        let opcode = request.opcode();
        let words = Envelope::request(request).encode()?;
        self.transport.write_posted(&words)?;

        let mut interleaved = 0;
        let (reply, word0) = loop {
            let reply = self.transport.read_posted()?;
            let word0 = reply.first().copied().ok_or(MailboxError::Malformed)?;
            if word0 as u16 == opcode as u16 {
                break (reply, word0);
            }
            // a message the PF sent on its own before answering
            if word0 & (message::MSG_ACK | message::MSG_NACK) == 0 && interleaved < MAX_INTERLEAVED {
                interleaved += 1;
                if let Some(notification) = self.answer_pf_message(&reply)? {
                    self.pending.push_back(notification);
                }
                continue;
            }
            warn!("ixgbevf::mailbox: reply {:#X} to a {:?} request", word0, opcode);
            return Err(MailboxError::UnexpectedReply);
        };
        if word0 & (message::MSG_ACK | message::MSG_NACK) == 0 {
            return Err(MailboxError::Unprocessed(opcode));
        }
        let envelope = Envelope::decode(&reply)?;
        match envelope.status {
            MsgStatus::Ack => {
                trace!("ixgbevf::mailbox: {:?} acked", opcode);
                Ok(envelope.message)
            }
            MsgStatus::Nack => {
                debug!("ixgbevf::mailbox: {:?} refused by the PF", opcode);
                Err(MailboxError::Nack(opcode))
            }
            MsgStatus::Request => Err(MailboxError::Unprocessed(opcode)),
        }
    }

    /// Sends a request whose only useful reply is an acknowledgement.
    fn transact_ack(&mut self, request: Message) -> Result<(), MailboxError> {
        self.transact(request).map(|_| ())
    }

    /// Resets the VF and tells the PF about it.
    pub fn reset(&mut self) -> Result<(), MailboxError> {
        self.api = None;
        self.transport.regs().write_reg(VFCTRL, VFCTRL_RST);
        self.transport.wait_for_reset()?;
        self.transact_ack(Message::Reset)?;
        debug!("ixgbevf::mailbox: reset done");
        Ok(())
    }

    /// Asks the PF for [`API_VERSION`]. Any other answer is a failure.
    pub fn negotiate_api(&mut self) -> Result<u32, MailboxError> {
        match self.transact(Message::ApiNegotiate { version: API_VERSION })? {
            Message::ApiNegotiate { version } if version == API_VERSION => {
                self.api = Some(version);
                Ok(version)
            }
            Message::ApiNegotiate { version } => {
                error!("ixgbevf::mailbox: asked for API version {}, PF answered {}", API_VERSION, version);
                Err(MailboxError::VersionMismatch { requested: API_VERSION, acked: version })
            }
            _ => Err(MailboxError::UnexpectedReply),
        }
    }

    /// Fetches every MAC address the PF assigned, one page at a time.
    ///
    /// If the PF reports that the list changed while it was being fetched,
    /// starts over from the first page, at most `max_restarts` times.
    pub fn get_mac_addrs(&mut self, max_restarts: u32) -> Result<Vec<[u8; 6]>, MailboxError> {
        let mut restarts = 0;
        let mut addrs: Vec<[u8; 6]> = Vec::new();
        loop {
            let offset = addrs.len() as u32;
            let (total, page_offset, changed, page) = match self.transact(Message::GetMacAddrs { offset })? {
                Message::MacAddrs { total, offset, changed, addrs } => (total, offset, changed, addrs),
                _ => return Err(MailboxError::UnexpectedReply),
            };
            if changed && offset != 0 {
                if restarts >= max_restarts {
                    return Err(MailboxError::MacListUnstable);
                }
                restarts += 1;
                debug!("ixgbevf::mailbox: MAC list changed while fetching it, restarting");
                addrs.clear();
                continue;
            }
            if page_offset != offset {
                return Err(MailboxError::Malformed);
            }
            if total == 0 || total > MAX_MAC_ADDRS {
                return Err(MailboxError::LimitOutOfRange);
            }
            if page.is_empty() && offset < total {
                return Err(MailboxError::Malformed);
            }
            addrs.extend(page);
            if addrs.len() as u32 >= total {
                addrs.truncate(total as usize);
                return Ok(addrs);
            }
        }
    }

    pub fn get_queues(&mut self) -> Result<QueueLimits, MailboxError> {
        match self.transact(Message::GetQueues)? {
            Message::Queues { tx, rx, vlan_strip } => {
                let valid = 1..=MAX_RING_PAIRS as u32;
                if !valid.contains(&tx) || !valid.contains(&rx) {
                    return Err(MailboxError::LimitOutOfRange);
                }
                Ok(QueueLimits { tx: tx as usize, rx: rx as usize, vlan_strip })
            }
            _ => Err(MailboxError::UnexpectedReply),
        }
    }

    pub fn get_mtu_limit(&mut self) -> Result<u32, MailboxError> {
        match self.transact(Message::GetMtuLimit)? {
            Message::MtuLimit { max_mtu } if (MIN_MTU..=MAX_MTU).contains(&max_mtu) => Ok(max_mtu),
            Message::MtuLimit { .. } => Err(MailboxError::LimitOutOfRange),
            _ => Err(MailboxError::UnexpectedReply),
        }
    }

    pub fn set_mac_filter(&mut self, addr: [u8; 6], enable: bool) -> Result<(), MailboxError> {
        self.transact_ack(Message::SetMacFilter { addr, enable })
    }

    /// Replaces the PF's multicast list for this VF with `addrs`.
    pub fn set_multicast(&mut self, addrs: &[[u8; 6]]) -> Result<(), MailboxError> {
        if addrs.len() > MAX_MULTICAST_ADDRS {
            return Err(MailboxError::TooMany);
        }
        let hashes = addrs.iter().map(multicast_hash).collect();
        self.transact_ack(Message::SetMulticast { hashes })
    }

    pub fn set_mc_promisc(&mut self, enable: bool) -> Result<(), MailboxError> {
        self.transact_ack(Message::SetMcPromisc { enable })
    }

    pub fn set_mtu(&mut self, mtu: u32) -> Result<(), MailboxError> {
        self.transact_ack(Message::SetMtu { mtu })
    }

    pub fn set_vlan(&mut self, vid: u16, add: bool) -> Result<(), MailboxError> {
        self.transact_ack(Message::SetVlan { vid, add })
    }

    /// Checks for a PF reset or a message from the PF, answering any message.
    /// Messages that arrived during a request are returned first, oldest first.
    pub fn poll_notifications(&mut self) -> Result<Option<Notification>, MailboxError> {
        if self.transport.check_for_rst() {
            warn!("ixgbevf::mailbox: the PF reset the VF");
            self.api = None;
            self.pending.clear();
            return Ok(Some(Notification::PfReset));
        }
        if let Some(notification) = self.pending.pop_front() {
            return Ok(Some(notification));
        }
        if !self.transport.check_for_msg() {
            return Ok(None);
        }
        let words = self.transport.read_message()?;
        self.answer_pf_message(&words)
    }

    /// Acknowledges a message the PF sent on its own if we understand it, and refuses it otherwise.
    fn answer_pf_message(&mut self, words: &[u32]) -> Result<Option<Notification>, MailboxError> {
        let word0 = words.first().copied().ok_or(MailboxError::Malformed)?;
        match Envelope::decode(words) {
            Ok(Envelope { status: MsgStatus::Request, message: Message::VlanStripNotify { enable }, .. }) => {
                self.transport.write_posted(&[acknowledgement_word(word0)])?;
                debug!("ixgbevf::mailbox: the PF turned VLAN stripping {}", if enable { "on" } else { "off" });
                Ok(Some(Notification::VlanStrip(enable)))
            }
            other => {
                warn!("ixgbevf::mailbox: refusing unexpected PF message {:#X}: {:?}", word0, other);
                self.transport.write_posted(&[refusal_word(word0)])?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use nic_hal::sim::SimClock;
    use crate::test_support::{PfConfig, SimNic};
    use message::{MSG_ACK, MSG_CTS, MSG_NACK};

    fn connect(pf: PfConfig) -> (Arc<SimNic>, Arc<SimClock>, MailboxClient) {
        let sim = Arc::new(SimNic::new(pf));
        let clock = Arc::new(SimClock::new());
        let client = MailboxClient::new(sim.clone(), clock.clone(), 1000, 10);
        (sim, clock, client)
    }

    fn macs(count: u8) -> Vec<[u8; 6]> {
        (0..count).map(|i| [0x02, 0, 0, 0, 0x10, i]).collect()
    }

    #[test]
    fn handshake_with_a_cooperative_pf() {
        let (sim, _clock, mut mbx) = connect(PfConfig::default());
        mbx.reset().unwrap();
        assert_eq!(mbx.api_version(), None);
        assert_eq!(mbx.negotiate_api(), Ok(API_VERSION));
        assert_eq!(mbx.api_version(), Some(API_VERSION));
        assert_eq!(mbx.get_mac_addrs(4).unwrap(), PfConfig::default().macs);
        assert_eq!(mbx.get_queues(), Ok(QueueLimits { tx: 4, rx: 4, vlan_strip: false }));
        assert_eq!(mbx.get_mtu_limit(), Ok(9000));
        assert_eq!(sim.request_count(Opcode::Reset), 1);
        assert_eq!(sim.total_requests(), 5);
    }

    #[test]
    fn other_api_versions_are_rejected() {
        let (_sim, _clock, mut mbx) = connect(PfConfig { api_version: 2, ..PfConfig::default() });
        mbx.reset().unwrap();
        assert_eq!(mbx.negotiate_api(), Err(MailboxError::VersionMismatch { requested: 3, acked: 2 }));
        assert_eq!(mbx.api_version(), None);
    }

    #[test]
    fn refused_and_unprocessed_requests() {
        let (_sim, _clock, mut mbx) = connect(PfConfig {
            nack: vec![Opcode::SetMtu],
            unprocessed: vec![Opcode::SetVlan],
            ..PfConfig::default()
        });
        assert_eq!(mbx.set_mtu(9000), Err(MailboxError::Nack(Opcode::SetMtu)));
        assert_eq!(mbx.set_vlan(10, true), Err(MailboxError::Unprocessed(Opcode::SetVlan)));
        assert_eq!(mbx.set_mc_promisc(true), Ok(()));
    }

    #[test]
    fn silent_pf_times_out() {
        let (sim, clock, mut mbx) = connect(PfConfig::default());
        sim.set_unresponsive(true);
        assert_eq!(mbx.set_mtu(2000), Err(MailboxError::Timeout));
        assert!(clock.now_us() >= 1000);
    }

    #[test]
    fn mac_list_change_restarts_the_fetch() {
        let (sim, _clock, mut mbx) = connect(PfConfig {
            macs: macs(8),
            macs_after_change: Some(macs(9)),
            ..PfConfig::default()
        });
        assert_eq!(mbx.get_mac_addrs(4).unwrap(), macs(9));
        // two pages, then two pages of the new list
        assert_eq!(sim.request_count(Opcode::GetMacAddrs), 4);

        let (_sim, _clock, mut mbx) = connect(PfConfig {
            macs: macs(8),
            macs_after_change: Some(macs(9)),
            ..PfConfig::default()
        });
        assert_eq!(mbx.get_mac_addrs(0), Err(MailboxError::MacListUnstable));
    }

    #[test]
    fn vlan_strip_notification_is_acknowledged() {
        let (sim, _clock, mut mbx) = connect(PfConfig::default());
        assert_eq!(mbx.poll_notifications(), Ok(None));

        sim.pf_send(&[Opcode::VlanStripNotify as u32 | MSG_CTS, 1]);
        assert_eq!(mbx.poll_notifications(), Ok(Some(Notification::VlanStrip(true))));
        assert_eq!(sim.replies(), vec![0x100 | MSG_ACK | MSG_CTS]);
        assert_eq!(sim.vf_acks(), 1);
    }

    #[test]
    fn unknown_pf_messages_are_refused() {
        let (sim, _clock, mut mbx) = connect(PfConfig::default());
        sim.pf_send(&[0x77 | 2 << 16, 5, 6]);
        assert_eq!(mbx.poll_notifications(), Ok(None));
        assert_eq!(sim.replies(), vec![0x77 | MSG_NACK | MSG_CTS]);
    }

    #[test]
    fn pf_message_ahead_of_a_reply_is_answered_and_kept() {
        let (sim, _clock, mut mbx) = connect(PfConfig::default());
        sim.pf_send_before_next_reply(&[Opcode::VlanStripNotify as u32 | MSG_CTS, 1]);
        assert_eq!(mbx.set_mtu(2000), Ok(()));
        assert_eq!(sim.request_count(Opcode::SetMtu), 1);
        assert_eq!(sim.replies(), vec![0x100 | MSG_ACK | MSG_CTS]);

        assert_eq!(mbx.poll_notifications(), Ok(Some(Notification::VlanStrip(true))));
        assert_eq!(mbx.poll_notifications(), Ok(None));
    }

    #[test]
    fn unknown_pf_message_ahead_of_a_reply_is_refused() {
        let (sim, _clock, mut mbx) = connect(PfConfig::default());
        sim.pf_send_before_next_reply(&[0x77 | 2 << 16, 5, 6]);
        assert_eq!(mbx.get_mtu_limit(), Ok(9000));
        assert_eq!(sim.replies(), vec![0x77 | MSG_NACK | MSG_CTS]);
        assert_eq!(mbx.poll_notifications(), Ok(None));
    }

    #[test]
    fn pf_reset_discards_queued_notifications() {
        let (sim, _clock, mut mbx) = connect(PfConfig::default());
        sim.pf_send_before_next_reply(&[Opcode::VlanStripNotify as u32 | MSG_CTS, 0]);
        assert_eq!(mbx.set_mc_promisc(true), Ok(()));
        sim.trigger_pf_reset();
        assert_eq!(mbx.poll_notifications(), Ok(Some(Notification::PfReset)));
        assert_eq!(mbx.poll_notifications(), Ok(None));
    }

    #[test]
    fn pf_reset_voids_the_negotiated_api() {
        let (sim, _clock, mut mbx) = connect(PfConfig::default());
        mbx.reset().unwrap();
        mbx.negotiate_api().unwrap();
        sim.trigger_pf_reset();
        assert_eq!(mbx.poll_notifications(), Ok(Some(Notification::PfReset)));
        assert_eq!(mbx.api_version(), None);
        assert_eq!(mbx.poll_notifications(), Ok(None));
    }

    #[test]
    fn oversized_multicast_list_is_not_sent() {
        let (sim, _clock, mut mbx) = connect(PfConfig::default());
        let addrs = vec![[0x01, 0, 0x5E, 0, 0, 1]; MAX_MULTICAST_ADDRS + 1];
        assert_eq!(mbx.set_multicast(&addrs), Err(MailboxError::TooMany));
        assert_eq!(sim.total_requests(), 0);
        assert_eq!(mbx.set_multicast(&addrs[..MAX_MULTICAST_ADDRS]), Ok(()));
        assert_eq!(sim.request_count(Opcode::SetMulticast), 1);
    }
}
