//! The words exchanged with the PF and their typed form.
//!
//! Word 0 of every message holds the opcode in bits 0..16, an opcode-specific
//! count or flag in bits 16..24, and the status bits CTS, NACK, and ACK in bits 29..32.
//! Bits 24..29 are reserved and must be zero.

use alloc::vec::Vec;
use bit_field::BitField;
use num_enum::TryFromPrimitive;
use crate::{config::MAX_MULTICAST_ADDRS, regs::MAILBOX_SIZE};
use super::MailboxError;

/// The PF processed the message.
pub const MSG_ACK:          u32 = 1 << 31;
/// The PF refused the message.
pub const MSG_NACK:         u32 = 1 << 30;
/// Clear to send: the sender has completed the reset handshake.
pub const MSG_CTS:          u32 = 1 << 29;
const RESERVED_BITS:        u32 = 0x1F << 24;
const STATUS_BITS:          u32 = MSG_ACK | MSG_NACK | MSG_CTS;

/// The most MAC addresses one reply page carries.
pub const MAC_ADDRS_PER_PAGE: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u16)]
pub enum Opcode {
    Reset           = 0x01,
    SetMulticast    = 0x03,
    SetVlan         = 0x04,
    SetMtu          = 0x05,
    SetMacFilter    = 0x06,
    ApiNegotiate    = 0x08,
    GetQueues       = 0x09,
    GetMtuLimit     = 0x0A,
    GetMacAddrs     = 0x0B,
    UpdateXcastMode = 0x0C,
    /// Sent by the PF when it turns VLAN stripping on or off for the VF's rings.
    VlanStripNotify = 0x100,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgStatus {
    Request,
    Ack,
    Nack,
}

/// The payload of a mailbox message.
///
/// Replies to requests that fetch something have their own variant;
/// replies to everything else echo the request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Reset,
    ApiNegotiate { version: u32 },
    GetMacAddrs { offset: u32 },
    /// One page of the VF's assigned MAC addresses, starting at `offset`.
    /// `changed` means the list changed since the previous page was sent.
    MacAddrs { total: u32, offset: u32, changed: bool, addrs: Vec<[u8; 6]> },
    SetMacFilter { addr: [u8; 6], enable: bool },
    /// The full list of multicast hashes the VF wants to receive.
    SetMulticast { hashes: Vec<u16> },
    SetMcPromisc { enable: bool },
    SetMtu { mtu: u32 },
    SetVlan { vid: u16, add: bool },
    GetQueues,
    Queues { tx: u32, rx: u32, vlan_strip: bool },
    GetMtuLimit,
    MtuLimit { max_mtu: u32 },
    VlanStripNotify { enable: bool },
    /// The NACK reply to any request.
    Refused { opcode: Opcode },
}

impl Message {
    pub fn opcode(&self) -> Opcode {
        match self {
            Message::Reset => Opcode::Reset,
            Message::ApiNegotiate { .. } => Opcode::ApiNegotiate,
            Message::GetMacAddrs { .. } | Message::MacAddrs { .. } => Opcode::GetMacAddrs,
            Message::SetMacFilter { .. } => Opcode::SetMacFilter,
            Message::SetMulticast { .. } => Opcode::SetMulticast,
            Message::SetMcPromisc { .. } => Opcode::UpdateXcastMode,
            Message::SetMtu { .. } => Opcode::SetMtu,
            Message::SetVlan { .. } => Opcode::SetVlan,
            Message::GetQueues | Message::Queues { .. } => Opcode::GetQueues,
            Message::GetMtuLimit | Message::MtuLimit { .. } => Opcode::GetMtuLimit,
            Message::VlanStripNotify { .. } => Opcode::VlanStripNotify,
            Message::Refused { opcode } => *opcode,
        }
    }

    /// The info byte of word 0 and the words after it.
    fn payload(&self) -> Result<(u8, Vec<u32>), MailboxError> {
        let mut words = Vec::new();
        let info = match self {
            Message::Reset | Message::GetQueues | Message::GetMtuLimit | Message::Refused { .. } => 0,
            Message::ApiNegotiate { version } => {
                words.push(*version);
                0
            }
            Message::GetMacAddrs { offset } => {
                words.push(*offset);
                0
            }
            Message::MacAddrs { total, offset, changed, addrs } => {
                if addrs.len() > MAC_ADDRS_PER_PAGE || *total >= 1 << 31 {
                    return Err(MailboxError::TooMany);
                }
                words.push(*total | (*changed as u32) << 31);
                words.push(*offset);
                for addr in addrs {
                    words.extend_from_slice(&mac_to_words(addr));
                }
                addrs.len() as u8
            }
            Message::SetMacFilter { addr, enable } => {
                words.extend_from_slice(&mac_to_words(addr));
                *enable as u8
            }
            Message::SetMulticast { hashes } => {
                if hashes.len() > MAX_MULTICAST_ADDRS {
                    return Err(MailboxError::TooMany);
                }
                for pair in hashes.chunks(2) {
                    let high = pair.get(1).copied().unwrap_or(0) as u32;
                    words.push(pair[0] as u32 | high << 16);
                }
                hashes.len() as u8
            }
            Message::SetMcPromisc { enable } | Message::VlanStripNotify { enable } => {
                words.push(*enable as u32);
                0
            }
            Message::SetMtu { mtu } => {
                words.push(*mtu);
                0
            }
            Message::SetVlan { vid, add } => {
                words.push(*vid as u32);
                *add as u8
            }
            Message::Queues { tx, rx, vlan_strip } => {
                words.extend_from_slice(&[*tx, *rx, *vlan_strip as u32]);
                0
            }
            Message::MtuLimit { max_mtu } => {
                words.push(*max_mtu);
                0
            }
        };
        Ok((info, words))
    }
}

fn mac_to_words(addr: &[u8; 6]) -> [u32; 2] {
    [
        u32::from_le_bytes([addr[0], addr[1], addr[2], addr[3]]),
        u16::from_le_bytes([addr[4], addr[5]]) as u32,
    ]
}

fn mac_from_words(low: u32, high: u32) -> Result<[u8; 6], MailboxError> {
    if high >> 16 != 0 {
        return Err(MailboxError::Malformed);
    }
    let l = low.to_le_bytes();
    let h = (high as u16).to_le_bytes();
    Ok([l[0], l[1], l[2], l[3], h[0], h[1]])
}

fn flag(value: u32) -> Result<bool, MailboxError> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(MailboxError::Malformed),
    }
}

/// A message together with its status bits, i.e. everything word 0 says.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub status: MsgStatus,
    pub cts: bool,
    pub message: Message,
}

impl Envelope {
    pub fn request(message: Message) -> Envelope {
        Envelope { status: MsgStatus::Request, cts: false, message }
    }

    pub fn ack(message: Message) -> Envelope {
        Envelope { status: MsgStatus::Ack, cts: true, message }
    }

    /// Produces the mailbox words of this message.
    pub fn encode(&self) -> Result<Vec<u32>, MailboxError> {
        let (info, payload) = self.message.payload()?;
        let mut word0 = self.message.opcode() as u32 | (info as u32) << 16;
        word0 |= match self.status {
            MsgStatus::Request => 0,
            MsgStatus::Ack => MSG_ACK,
            MsgStatus::Nack => MSG_NACK,
        };
        if self.cts {
            word0 |= MSG_CTS;
        }
        let mut words = Vec::with_capacity(1 + payload.len());
        words.push(word0);
        words.extend(payload);
        if words.len() > MAILBOX_SIZE {
            return Err(MailboxError::TooMany);
        }
        Ok(words)
    }

    /// Parses mailbox words, rejecting anything that [`Self::encode()`] would not produce.
    pub fn decode(words: &[u32]) -> Result<Envelope, MailboxError> {
        if words.is_empty() || words.len() > MAILBOX_SIZE {
            return Err(MailboxError::Malformed);
        }
        let word0 = words[0];
        if word0 & RESERVED_BITS != 0 {
            return Err(MailboxError::Malformed);
        }
        let status = match (word0 & MSG_ACK != 0, word0 & MSG_NACK != 0) {
            (false, false) => MsgStatus::Request,
            (true, false) => MsgStatus::Ack,
            (false, true) => MsgStatus::Nack,
            (true, true) => return Err(MailboxError::Malformed),
        };
        let cts = word0 & MSG_CTS != 0;
        let raw_opcode = word0.get_bits(0..16) as u16;
        let opcode = Opcode::try_from(raw_opcode).map_err(|_| MailboxError::UnknownOpcode(raw_opcode))?;
        let info = word0.get_bits(16..24);
        let word = |i: usize| words.get(i).copied().ok_or(MailboxError::Malformed);

        let message = if status == MsgStatus::Nack {
            Message::Refused { opcode }
        } else {
            let is_reply = status == MsgStatus::Ack;
            match opcode {
                Opcode::Reset => Message::Reset,
                Opcode::ApiNegotiate => Message::ApiNegotiate { version: word(1)? },
                Opcode::GetMacAddrs if !is_reply => Message::GetMacAddrs { offset: word(1)? },
                Opcode::GetMacAddrs => {
                    let count = info as usize;
                    if count > MAC_ADDRS_PER_PAGE {
                        return Err(MailboxError::Malformed);
                    }
                    let w1 = word(1)?;
                    let mut addrs = Vec::with_capacity(count);
                    for i in 0..count {
                        addrs.push(mac_from_words(word(3 + 2 * i)?, word(4 + 2 * i)?)?);
                    }
                    Message::MacAddrs { total: w1 & !(1 << 31), offset: word(2)?, changed: w1.get_bit(31), addrs }
                }
                Opcode::SetMacFilter => Message::SetMacFilter {
                    addr: mac_from_words(word(1)?, word(2)?)?,
                    enable: flag(info)?,
                },
                Opcode::SetMulticast => {
                    let count = info as usize;
                    if count > MAX_MULTICAST_ADDRS {
                        return Err(MailboxError::Malformed);
                    }
                    let mut hashes = Vec::with_capacity(count);
                    for i in 0..count {
                        let w = word(1 + i / 2)?;
                        hashes.push(if i % 2 == 0 { w as u16 } else { (w >> 16) as u16 });
                    }
                    Message::SetMulticast { hashes }
                }
                Opcode::UpdateXcastMode => Message::SetMcPromisc { enable: flag(word(1)?)? },
                Opcode::SetMtu => Message::SetMtu { mtu: word(1)? },
                Opcode::SetVlan => {
                    let vid = word(1)?;
                    if vid >= 4096 {
                        return Err(MailboxError::Malformed);
                    }
                    Message::SetVlan { vid: vid as u16, add: flag(info)? }
                }
                Opcode::GetQueues if !is_reply => Message::GetQueues,
                Opcode::GetQueues => Message::Queues { tx: word(1)?, rx: word(2)?, vlan_strip: flag(word(3)?)? },
                Opcode::GetMtuLimit if !is_reply => Message::GetMtuLimit,
                Opcode::GetMtuLimit => Message::MtuLimit { max_mtu: word(1)? },
                Opcode::VlanStripNotify => Message::VlanStripNotify { enable: flag(word(1)?)? },
            }
        };
        Ok(Envelope { status, cts, message })
    }
}

/// The reply word for a PF message that the VF doesn't understand.
pub fn refusal_word(word0: u32) -> u32 {
    (word0 & !(STATUS_BITS | RESERVED_BITS | 0xFF << 16)) | MSG_NACK | MSG_CTS
}

/// The reply word acknowledging a PF message.
pub fn acknowledgement_word(word0: u32) -> u32 {
    (word0 & !(STATUS_BITS | RESERVED_BITS)) | MSG_ACK | MSG_CTS
}

/// The 12-bit hash the PF's multicast table is indexed by.
pub fn multicast_hash(addr: &[u8; 6]) -> u16 {
    ((addr[4] as u16 >> 4) | (addr[5] as u16) << 4) & 0xFFF
}


#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn mac_page_layout() {
        let reply = Envelope::ack(Message::MacAddrs {
            total: 8,
            offset: 6,
            changed: true,
            addrs: vec![[0x02, 0x11, 0x22, 0x33, 0x44, 0x55], [0x02, 0, 0, 0, 0, 1]],
        });
        let words = reply.encode().unwrap();
        assert_eq!(words[0], 0x0B | 2 << 16 | MSG_ACK | MSG_CTS);
        assert_eq!(words[1], 8 | 1 << 31);
        assert_eq!(words[2], 6);
        assert_eq!(words[3], 0x3322_1102);
        assert_eq!(words[4], 0x5544);
        assert_eq!(Envelope::decode(&words).unwrap(), reply);
    }

    #[test]
    fn multicast_hashes_are_packed_in_pairs() {
        let hashes: Vec<u16> = (0..5).map(|i| 0x100 + i).collect();
        let request = Envelope::request(Message::SetMulticast { hashes });
        let words = request.encode().unwrap();
        assert_eq!(words.len(), 4);
        assert_eq!(words[0], 0x03 | 5 << 16);
        assert_eq!(words[1], 0x100 | 0x101 << 16);
        assert_eq!(words[3], 0x104);
        assert_eq!(Envelope::decode(&words).unwrap(), request);

        let too_many = Message::SetMulticast { hashes: vec![0; MAX_MULTICAST_ADDRS + 1] };
        assert_eq!(Envelope::request(too_many).encode(), Err(MailboxError::TooMany));
    }

    #[test]
    fn replies_and_requests_share_opcodes() {
        let request = Envelope::request(Message::GetQueues).encode().unwrap();
        assert_eq!(Envelope::decode(&request).unwrap().message, Message::GetQueues);
        let reply = Envelope::ack(Message::Queues { tx: 4, rx: 2, vlan_strip: true }).encode().unwrap();
        assert_eq!(reply[1..], [4, 2, 1]);
        assert_eq!(Envelope::decode(&reply).unwrap().message, Message::Queues { tx: 4, rx: 2, vlan_strip: true });

        let nack = Envelope::decode(&[0x05 | MSG_NACK | MSG_CTS]).unwrap();
        assert_eq!(nack.status, MsgStatus::Nack);
        assert_eq!(nack.message, Message::Refused { opcode: Opcode::SetMtu });
    }

    #[test]
    fn decode_is_strict() {
        assert_eq!(Envelope::decode(&[]), Err(MailboxError::Malformed));
        assert_eq!(Envelope::decode(&[0x05 | 1 << 24, 1500]), Err(MailboxError::Malformed));
        assert_eq!(Envelope::decode(&[0x05 | MSG_ACK | MSG_NACK, 1500]), Err(MailboxError::Malformed));
        assert_eq!(Envelope::decode(&[0x77]), Err(MailboxError::UnknownOpcode(0x77)));
        // a truncated payload
        assert_eq!(Envelope::decode(&[0x05]), Err(MailboxError::Malformed));
        // flags must be 0 or 1
        assert_eq!(Envelope::decode(&[0x0C, 2]), Err(MailboxError::Malformed));
        assert_eq!(Envelope::decode(&[0x04 | 1 << 16, 4096]), Err(MailboxError::Malformed));
        // the high half of a MAC address's second word must be zero
        assert_eq!(Envelope::decode(&[0x06 | 1 << 16, 0, 0x1_0000]), Err(MailboxError::Malformed));
    }

    #[test]
    fn reply_words_for_pf_messages() {
        let word0 = 0x100 | MSG_CTS;
        assert_eq!(acknowledgement_word(word0), 0x100 | MSG_ACK | MSG_CTS);
        assert_eq!(refusal_word(0x1234 | 3 << 16), 0x1234 | MSG_NACK | MSG_CTS);
    }

    #[test]
    fn multicast_hash_uses_the_top_twelve_bits() {
        assert_eq!(multicast_hash(&[0x01, 0x00, 0x5E, 0x00, 0x00, 0xFB]), 0xFB0);
        assert_eq!(multicast_hash(&[0x01, 0x00, 0x5E, 0x00, 0x12, 0x34]), 0x341);
    }
}
