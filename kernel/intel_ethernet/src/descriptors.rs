use core::fmt;
use bit_field::BitField;
use volatile::Volatile;
use nic_hal::PhysicalAddress;

/// The size in bytes of every descriptor slot, transmit or receive.
pub const DESCRIPTOR_SIZE: usize = 16;

/// A trait for the minimum set of functions needed to receive a packet using one of Intel's receive descriptor types.
/// Receive descriptors contain the physical address where an incoming packet should be stored by the NIC,
/// as well as bits that are updated by the HW once the packet is received.
/// There is one receive descriptor per receive buffer.
pub trait RxDescriptor {
    /// Initializes a receive descriptor by clearing its status
    /// and setting the descriptor's physical address.
    fn init(&mut self, packet_buffer_address: PhysicalAddress);

    /// Updates the descriptor's physical address, clearing whatever the hardware wrote back.
    fn set_packet_address(&mut self, packet_buffer_address: PhysicalAddress);

    /// Clears the status bits of the descriptor.
    fn reset_status(&mut self);

    /// Returns true if the descriptor has a received packet copied to its buffer.
    fn descriptor_done(&self) -> bool;

    /// Returns true if the descriptor's packet buffer is the last in a frame.
    fn end_of_packet(&self) -> bool;

    /// The length of the packet in the descriptor's packet buffer.
    fn length(&self) -> u64;
}

/// A trait for the minimum set of functions needed to transmit a packet using one of Intel's transmit descriptor types.
pub trait TxDescriptor {
    /// Initializes a transmit descriptor by clearing all of its values.
    fn init(&mut self);

    /// Returns true once the hardware has written back the descriptor-done bit.
    /// Only meaningful for descriptors that had [`TX_CMD_RS`] set.
    fn descriptor_done(&self) -> bool;
}


/// Advanced Transmit Descriptor (section 7.2.3.2.4 of the 82599 datasheet).
///
/// The same 16-byte slot also holds an Advanced Transmit Context Descriptor (section 7.2.3.2.3),
/// written through [`AdvancedTxDescriptor::set_context()`]:
/// the first quadword carries `VLAN/MACLEN/IPLEN`, `cmd_type_len` carries `TUCMD/DTYP`,
/// and `olinfo_status` carries `MSS/L4LEN/IDX`.
#[repr(C)]
pub struct AdvancedTxDescriptor {
    /// The starting physical address of the transmit buffer.
    pub buffer_addr: Volatile<u64>,
    /// Data length, descriptor type, and command bits.
    pub cmd_type_len: Volatile<u32>,
    /// Payload length, offload options, and the descriptor-done status bit.
    pub olinfo_status: Volatile<u32>,
}

const_assert_eq!(core::mem::size_of::<AdvancedTxDescriptor>(), DESCRIPTOR_SIZE);

impl AdvancedTxDescriptor {
    /// Fills in a data descriptor.
    ///
    /// # Arguments
    /// * `addr`: physical address of the data
    /// * `len`: number of bytes at `addr`
    /// * `cmd`: command bits, e.g. [`TX_CMD_EOP`] and [`TX_CMD_RS`] on the last descriptor of a packet
    /// * `olinfo`: payload length and checksum options; only the first descriptor of a packet needs them
    pub fn set_data(&mut self, addr: PhysicalAddress, len: u16, cmd: u32, olinfo: u32) {
        self.buffer_addr.write(addr.value());
        self.cmd_type_len.write(len as u32 | cmd | TX_DTYP_DATA | TX_CMD_DEXT | TX_CMD_IFCS);
        self.olinfo_status.write(olinfo);
    }

    /// Fills in a context descriptor with checksum and segmentation parameters.
    pub fn set_context(&mut self, vlan_macip_lens: u32, type_tucmd: u32, mss_l4len_idx: u32) {
        self.buffer_addr.write(vlan_macip_lens as u64);
        self.cmd_type_len.write(type_tucmd | TX_DTYP_CONTEXT | TX_CMD_DEXT);
        self.olinfo_status.write(mss_l4len_idx);
    }

    /// The data length of a data descriptor.
    pub fn data_len(&self) -> u16 {
        self.cmd_type_len.read().get_bits(0..16) as u16
    }

    pub fn is_context(&self) -> bool {
        self.cmd_type_len.read() & TX_DTYP_MASK == TX_DTYP_CONTEXT
    }

    pub fn is_end_of_packet(&self) -> bool {
        self.cmd_type_len.read() & TX_CMD_EOP != 0
    }

    /// The payload length the hardware was told about in the first data descriptor of a packet.
    pub fn payload_len(&self) -> u32 {
        self.olinfo_status.read() >> TX_PAYLEN_SHIFT
    }
}

impl TxDescriptor for AdvancedTxDescriptor {
    fn init(&mut self) {
        self.buffer_addr.write(0);
        self.cmd_type_len.write(0);
        self.olinfo_status.write(0);
    }

    fn descriptor_done(&self) -> bool {
        self.olinfo_status.read().get_bit(0)
    }
}

impl fmt::Debug for AdvancedTxDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{addr: {:#X}, cmd_type_len: {:#X}, olinfo_status: {:#X}}}",
            self.buffer_addr.read(), self.cmd_type_len.read(), self.olinfo_status.read())
    }
}


/// Advanced Receive Descriptor (section 7.1.6 of the 82599 datasheet).
/// It has 2 modes: Read and Write Back. There is one receive descriptor per receive buffer that can be converted between these 2 modes.
/// Read contains the addresses that the driver writes.
/// Write Back contains information the hardware writes on receiving a packet.
#[repr(C)]
pub struct AdvancedRxDescriptor {
    /// the starting physcal address of the receive buffer for the packet
    pub packet_buffer_address: Volatile<u64>,
    /// the starting physcal address of the receive buffer for the header.
    /// Header splitting is never enabled, so the driver writes zero here.
    pub header_buffer_address: Volatile<u64>,
}

const_assert_eq!(core::mem::size_of::<AdvancedRxDescriptor>(), DESCRIPTOR_SIZE);

impl RxDescriptor for AdvancedRxDescriptor {
    fn init(&mut self, packet_buffer_address: PhysicalAddress) {
        self.packet_buffer_address.write(packet_buffer_address.value());
        self.header_buffer_address.write(0);
    }

    fn set_packet_address(&mut self, packet_buffer_address: PhysicalAddress) {
        self.packet_buffer_address.write(packet_buffer_address.value());
        self.header_buffer_address.write(0);
    }

    fn reset_status(&mut self) {
        self.header_buffer_address.write(0);
    }

    fn descriptor_done(&self) -> bool {
        (self.get_ext_status() & RX_STATUS_DD) == RX_STATUS_DD
    }

    fn end_of_packet(&self) -> bool {
        (self.get_ext_status() & RX_STATUS_EOP) == RX_STATUS_EOP
    }

    fn length(&self) -> u64 {
        self.get_pkt_len()
    }
}

impl AdvancedRxDescriptor {
    /// Write Back mode function for the Advanced Receive Descriptor
    /// Status information indicates whether a descriptor has been used
    /// and whether the buffer is the last one for a packet
    pub fn get_ext_status(&self) -> u64 {
        self.header_buffer_address.read().get_bits(0..20)
    }

    /// Write Back mode function for the Advanced Receive Descriptor
    /// returns errors reported by hardware for different packet types
    pub fn get_ext_error(&self) -> u64 {
        self.header_buffer_address.read().get_bits(20..32)
    }

    /// Write Back mode function for the Advanced Receive Descriptor
    /// Returns the number of bytes posted to the packet buffer
    pub fn get_pkt_len(&self) -> u64 {
        self.header_buffer_address.read().get_bits(32..48)
    }

    /// Write Back mode function for the Advanced Receive Descriptor
    /// If the vlan header is stripped from the packet, then the 16 bits of the VLAN tag are posted here
    pub fn get_vlan_tag(&self) -> u16 {
        self.header_buffer_address.read().get_bits(48..64) as u16
    }

    /// True if the hardware stripped a VLAN tag, which is then available from [`Self::get_vlan_tag()`].
    pub fn vlan_stripped(&self) -> bool {
        (self.get_ext_status() & RX_STATUS_VP) == RX_STATUS_VP
    }

    /// True if the hardware flagged a frame error (CRC, symbol, or length) on this buffer.
    pub fn frame_error(&self) -> bool {
        (self.get_ext_error() & RX_ERROR_RXE) == RX_ERROR_RXE
    }
}

impl fmt::Debug for AdvancedRxDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{Packet buffer address: {:#X}, Packet header address: {:#X}}}",
            self.packet_buffer_address.read(), self.header_buffer_address.read())
    }
}


/* Advanced transmit descriptor: cmd_type_len */
/// Tx Command: End of Packet
pub const TX_CMD_EOP:                      u32 = 1 << 24;
/// Tx Command: Insert FCS
pub const TX_CMD_IFCS:                     u32 = 1 << 25;
/// Tx Command: Report Status
pub const TX_CMD_RS:                       u32 = 1 << 27;
/// Tx Command: Descriptor Extension (advanced format)
pub const TX_CMD_DEXT:                     u32 = 1 << 29;
/// Tx Command: VLAN Packet Enable
pub const TX_CMD_VLE:                      u32 = 1 << 30;
/// Tx Command: TCP Segmentation Enable
pub const TX_CMD_TSE:                      u32 = 1 << 31;
/// Descriptor type: advanced data
pub const TX_DTYP_DATA:                    u32 = 0x3 << 20;
/// Descriptor type: advanced context
pub const TX_DTYP_CONTEXT:                 u32 = 0x2 << 20;
pub const TX_DTYP_MASK:                    u32 = 0xF << 20;

/* Advanced transmit data descriptor: olinfo_status */
/// Tx Status: descriptor done
pub const TX_STATUS_DD:                    u32 = 1 << 0;
/// Insert IP checksum
pub const TX_POPTS_IXSM:                   u32 = 1 << 8;
/// Insert TCP/UDP checksum
pub const TX_POPTS_TXSM:                   u32 = 1 << 9;
/// Shift of the payload length field
pub const TX_PAYLEN_SHIFT:                 u32 = 14;

/* Advanced transmit context descriptor */
/// Shift of the MAC header length in `vlan_macip_lens`; the IP header length occupies the low 9 bits.
pub const TX_CTX_MACLEN_SHIFT:             u32 = 9;
/// Shift of the VLAN tag in `vlan_macip_lens`
pub const TX_CTX_VLAN_SHIFT:               u32 = 16;
/// TUCMD: the packet is IPv4
pub const TX_CTX_TUCMD_IPV4:               u32 = 1 << 10;
/// TUCMD: L4 type is TCP
pub const TX_CTX_TUCMD_L4T_TCP:            u32 = 1 << 11;
/// TUCMD: L4 type is UDP
pub const TX_CTX_TUCMD_L4T_UDP:            u32 = 0;
/// Shift of the L4 header length in `mss_l4len_idx`
pub const TX_CTX_L4LEN_SHIFT:              u32 = 8;
/// Shift of the maximum segment size in `mss_l4len_idx`
pub const TX_CTX_MSS_SHIFT:                u32 = 16;

/* Advanced receive descriptor write-back */
/// Rx Status: descriptor done
pub const RX_STATUS_DD:                    u64 = 1 << 0;
/// Rx Status: end of packet
pub const RX_STATUS_EOP:                   u64 = 1 << 1;
/// Rx Status: VLAN tag stripped
pub const RX_STATUS_VP:                    u64 = 1 << 3;
/// Rx Error: frame error (bit 29 of the write-back, bit 9 of the error field)
pub const RX_ERROR_RXE:                    u64 = 1 << 9;


#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed<T>() -> T {
        // SAFETY: descriptors are plain integers, so all-zero is a valid value.
        unsafe { core::mem::zeroed() }
    }

    #[test]
    fn data_descriptor_fields() {
        let mut desc: AdvancedTxDescriptor = zeroed();
        desc.set_data(PhysicalAddress::new(0x1000), 60, TX_CMD_EOP | TX_CMD_RS, 60 << TX_PAYLEN_SHIFT);
        assert_eq!(desc.data_len(), 60);
        assert!(desc.is_end_of_packet());
        assert!(!desc.is_context());
        assert_eq!(desc.payload_len(), 60);
        assert!(!desc.descriptor_done());
        desc.olinfo_status.write(desc.olinfo_status.read() | TX_STATUS_DD);
        assert!(desc.descriptor_done());
    }

    #[test]
    fn context_descriptor_is_not_a_packet_end() {
        let mut desc: AdvancedTxDescriptor = zeroed();
        desc.set_context(14 << TX_CTX_MACLEN_SHIFT | 20, TX_CTX_TUCMD_IPV4 | TX_CTX_TUCMD_L4T_TCP, 1448 << TX_CTX_MSS_SHIFT | 20 << TX_CTX_L4LEN_SHIFT);
        assert!(desc.is_context());
        assert!(!desc.is_end_of_packet());
        assert_eq!(desc.buffer_addr.read() as u32 >> TX_CTX_MACLEN_SHIFT, 14);
    }

    #[test]
    fn rx_write_back() {
        let mut desc: AdvancedRxDescriptor = zeroed();
        desc.init(PhysicalAddress::new(0x2002));
        assert!(!desc.descriptor_done());
        let mut wb: u64 = 0;
        wb.set_bits(0..20, RX_STATUS_DD | RX_STATUS_EOP | RX_STATUS_VP);
        wb.set_bits(32..48, 1514);
        wb.set_bits(48..64, 0x0064);
        desc.header_buffer_address.write(wb);
        assert!(desc.descriptor_done());
        assert!(desc.end_of_packet());
        assert!(desc.vlan_stripped());
        assert!(!desc.frame_error());
        assert_eq!(desc.length(), 1514);
        assert_eq!(desc.get_vlan_tag(), 100);
        desc.reset_status();
        assert!(!desc.descriptor_done());
    }
}
