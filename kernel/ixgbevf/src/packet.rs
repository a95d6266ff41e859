//! Outgoing packets and the offload context derived from their headers.

use alloc::vec::Vec;
use intel_ethernet::descriptors::{
    TX_CTX_L4LEN_SHIFT, TX_CTX_MACLEN_SHIFT, TX_CTX_MSS_SHIFT, TX_CTX_TUCMD_IPV4,
    TX_CTX_TUCMD_L4T_TCP, TX_CTX_TUCMD_L4T_UDP, TX_CTX_VLAN_SHIFT,
};

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;
/// Ethernet + VLAN + IPv4 with options + TCP with options.
const MAX_HEADER_LEN: usize = 18 + 60 + 60;

bitflags! {
    /// Offloads the stack requests for a packet.
    #[derive(Default)]
    pub struct TxOffloadFlags: u8 {
        /// Insert the IPv4 header checksum.
        const IPV4_CSUM = 1 << 0;
        /// Insert the TCP or UDP checksum.
        const L4_CSUM   = 1 << 1;
        /// TCP segmentation offload.
        const LSO       = 1 << 2;
    }
}

/// The offload request attached to a packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxOffload {
    pub flags: TxOffloadFlags,
    /// Maximum segment size, required for [`TxOffloadFlags::LSO`].
    pub mss: u16,
    /// A VLAN tag for the hardware to insert.
    pub vlan_tag: Option<u16>,
}

/// A packet handed to the driver for transmission, as a chain of fragments.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Packet {
    fragments: Vec<Vec<u8>>,
    pub offload: TxOffload,
}

impl Packet {
    pub fn new(fragments: Vec<Vec<u8>>) -> Packet {
        Packet { fragments, offload: TxOffload::default() }
    }

    pub fn with_offload(fragments: Vec<Vec<u8>>, offload: TxOffload) -> Packet {
        Packet { fragments, offload }
    }

    pub fn fragments(&self) -> &[Vec<u8>] {
        &self.fragments
    }

    /// Total length in bytes.
    pub fn len(&self) -> usize {
        self.fragments.iter().map(|f| f.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merges every fragment into one.
    pub fn linearize(&mut self) {
        if self.fragments.len() <= 1 {
            return;
        }
        let mut whole = Vec::with_capacity(self.len());
        for f in self.fragments.drain(..) {
            whole.extend_from_slice(&f);
        }
        self.fragments.push(whole);
    }

    /// Copies up to `len` bytes from the start of the packet, across fragment boundaries.
    pub fn copy_prefix(&self, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        for f in &self.fragments {
            let take = core::cmp::min(len - out.len(), f.len());
            out.extend_from_slice(&f[..take]);
            if out.len() == len {
                break;
            }
        }
        out
    }
}

/// The layer 4 protocol of a packet with checksum or segmentation offload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum L4Proto {
    None,
    Tcp,
    Udp,
}

/// The parameters of a transmit context descriptor.
///
/// Two packets with equal contexts can share one context descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxContext {
    pub flags: TxOffloadFlags,
    pub mac_len: u16,
    pub ip_len: u16,
    pub l4_len: u16,
    pub l4: L4Proto,
    pub ipv4: bool,
    pub mss: u16,
    pub vlan_tag: Option<u16>,
}

impl TxContext {
    /// Derives the offload context of `packet` from its headers.
    ///
    /// Returns `Ok(None)` if the packet requests no offload and no VLAN insertion.
    pub fn from_packet(packet: &Packet) -> Result<Option<TxContext>, &'static str> {
        let offload = packet.offload;
        if offload.flags.is_empty() {
            return Ok(offload.vlan_tag.map(|tag| TxContext {
                flags: TxOffloadFlags::empty(),
                mac_len: 14,
                ip_len: 0,
                l4_len: 0,
                l4: L4Proto::None,
                ipv4: false,
                mss: 0,
                vlan_tag: Some(tag),
            }));
        }

        let hdr = packet.copy_prefix(MAX_HEADER_LEN);
        let be16 = |at: usize| -> Result<u16, &'static str> {
            hdr.get(at..at + 2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
                .ok_or("TxContext: packet too short for its headers")
        };
        let byte = |at: usize| -> Result<u8, &'static str> {
            hdr.get(at).copied().ok_or("TxContext: packet too short for its headers")
        };

        let (mac_len, ethertype) = match be16(12)? {
            ETHERTYPE_VLAN => (18usize, be16(16)?),
            other => (14usize, other),
        };
        let (ipv4, ip_len, proto) = match ethertype {
            ETHERTYPE_IPV4 => {
                let ihl = (byte(mac_len)? & 0x0F) as usize * 4;
                if ihl < 20 {
                    return Err("TxContext: bad IPv4 header length");
                }
                (true, ihl, byte(mac_len + 9)?)
            }
            ETHERTYPE_IPV6 => (false, 40, byte(mac_len + 6)?),
            _ => return Err("TxContext: checksum offload requested for a non-IP packet"),
        };
        let l4_start = mac_len + ip_len;
        let (l4, l4_len) = match proto {
            IPPROTO_TCP => (L4Proto::Tcp, (byte(l4_start + 12)? >> 4) as usize * 4),
            IPPROTO_UDP => (L4Proto::Udp, 8),
            _ => (L4Proto::None, 0),
        };

        if offload.flags.contains(TxOffloadFlags::IPV4_CSUM) && !ipv4 {
            return Err("TxContext: IPv4 checksum requested for a non-IPv4 packet");
        }
        if offload.flags.contains(TxOffloadFlags::L4_CSUM) && l4 == L4Proto::None {
            return Err("TxContext: L4 checksum requested for a packet that is neither TCP nor UDP");
        }
        if offload.flags.contains(TxOffloadFlags::LSO) {
            if l4 != L4Proto::Tcp || l4_len < 20 {
                return Err("TxContext: segmentation offload requires a TCP packet");
            }
            if offload.mss == 0 {
                return Err("TxContext: segmentation offload requires an MSS");
            }
            if packet.len() < l4_start + l4_len {
                return Err("TxContext: packet too short for its headers");
            }
        }

        Ok(Some(TxContext {
            flags: offload.flags,
            mac_len: mac_len as u16,
            ip_len: ip_len as u16,
            l4_len: l4_len as u16,
            l4,
            ipv4,
            mss: offload.mss,
            vlan_tag: offload.vlan_tag,
        }))
    }

    pub fn is_lso(&self) -> bool {
        self.flags.contains(TxOffloadFlags::LSO)
    }

    /// The length of the MAC, IP, and L4 headers together.
    pub fn header_len(&self) -> usize {
        (self.mac_len + self.ip_len + self.l4_len) as usize
    }

    /// The three words of the context descriptor:
    /// `(vlan_macip_lens, type_tucmd, mss_l4len_idx)`.
    pub fn descriptor_words(&self) -> (u32, u32, u32) {
        let vlan_macip_lens = self.ip_len as u32
            | (self.mac_len as u32) << TX_CTX_MACLEN_SHIFT
            | (self.vlan_tag.unwrap_or(0) as u32) << TX_CTX_VLAN_SHIFT;
        let mut type_tucmd = 0;
        if self.ipv4 {
            type_tucmd |= TX_CTX_TUCMD_IPV4;
        }
        match self.l4 {
            L4Proto::Tcp => type_tucmd |= TX_CTX_TUCMD_L4T_TCP,
            L4Proto::Udp => type_tucmd |= TX_CTX_TUCMD_L4T_UDP,
            L4Proto::None => {}
        }
        let mss_l4len_idx = if self.is_lso() {
            (self.mss as u32) << TX_CTX_MSS_SHIFT | (self.l4_len as u32) << TX_CTX_L4LEN_SHIFT
        } else {
            0
        };
        (vlan_macip_lens, type_tucmd, mss_l4len_idx)
    }
}

/// A piece of a packet as the transmit path sees it.
pub(crate) struct FragmentView<'p> {
    pub bytes: &'p [u8],
    /// Must be copied into a control block's buffer, never bound for DMA.
    /// Set for synthesized header segments, which don't outlive the send call.
    pub force_copy: bool,
}

/// Returns the packet's fragments as views, without modifying the packet.
///
/// For segmentation offload the whole header must sit in one descriptor. If it spans fragments,
/// the header bytes are gathered into `bounce` and the first view is that bounce segment,
/// followed by the rest of the packet.
pub(crate) fn fragment_views<'p>(packet: &'p Packet, context: Option<&TxContext>, bounce: &'p mut Vec<u8>) -> Vec<FragmentView<'p>> {
    let frags = packet.fragments();
    let header_len = match context {
        Some(ctx) if ctx.is_lso() => ctx.header_len(),
        _ => 0,
    };
    if header_len == 0 || frags.first().map_or(true, |f| f.len() >= header_len) {
        let mut views: Vec<FragmentView<'p>> = frags.iter()
            .filter(|f| !f.is_empty())
            .map(|f| FragmentView { bytes: f.as_slice(), force_copy: false })
            .collect();
        if header_len != 0 && !views.is_empty() {
            // keep the header in the first control block's copy buffer
            let first = views[0].bytes;
            if first.len() > header_len {
                let (hdr, rest) = first.split_at(header_len);
                views[0] = FragmentView { bytes: hdr, force_copy: true };
                views.insert(1, FragmentView { bytes: rest, force_copy: false });
            } else {
                views[0].force_copy = true;
            }
        }
        return views;
    }

    *bounce = packet.copy_prefix(header_len);
    let bounce: &'p Vec<u8> = bounce;
    let mut views = Vec::with_capacity(frags.len() + 1);
    views.push(FragmentView { bytes: bounce.as_slice(), force_copy: true });
    let mut skip = header_len;
    for f in frags {
        if skip >= f.len() {
            skip -= f.len();
            continue;
        }
        views.push(FragmentView { bytes: &f[skip..], force_copy: false });
        skip = 0;
    }
    views
}
