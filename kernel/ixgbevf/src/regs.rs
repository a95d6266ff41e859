//! Register offsets and bit values of the 82599 virtual function's register window.
//!
//! A VF sees only its own small window: control and status, interrupt registers,
//! its rings' registers, and the mailbox shared with the PF.

/// VF Control Register
pub const VFCTRL:                       u32 = 0x0000;
/// VF Link Status Register
pub const VFLINKS:                      u32 = 0x0010;

/// Extended Interrupt Cause Set Register, used to raise a software interrupt
pub const VTEICS:                       u32 = 0x0104;
/// Extended Interrupt Mask Set/Read Register
pub const VTEIMS:                       u32 = 0x0108;
/// Extended Interrupt Mask Clear Register
pub const VTEIMC:                       u32 = 0x010C;
/// Extended Interrupt Auto Clear Register
pub const VTEIAC:                       u32 = 0x0110;
/// Extended Interrupt Auto Mask Register
pub const VTEIAM:                       u32 = 0x0114;
/// Interrupt Vector Allocation Registers, one per pair of queues
pub const fn vtivar(n: usize) -> u32 { 0x0120 + 4 * n as u32 }
/// Interrupt Vector Allocation Register for the mailbox ("other") cause
pub const VTIVAR_MISC:                  u32 = 0x0140;
/// Extended Interrupt Throttle Registers
pub const fn vteitr(n: usize) -> u32 { 0x0820 + 4 * n as u32 }

/// Mailbox memory, [`MAILBOX_SIZE`] words
pub const VFMBMEM:                      u32 = 0x0200;
/// Mailbox control register
pub const VFMAILBOX:                    u32 = 0x02FC;

/// Number of bytes between consecutive queues' registers
pub const QUEUE_REG_DIST:               u32 = 0x40;

pub const fn rdbal(n: usize) -> u32  { 0x1000 + QUEUE_REG_DIST * n as u32 }
pub const fn rdbah(n: usize) -> u32  { 0x1004 + QUEUE_REG_DIST * n as u32 }
pub const fn rdlen(n: usize) -> u32  { 0x1008 + QUEUE_REG_DIST * n as u32 }
pub const fn rdh(n: usize) -> u32    { 0x1010 + QUEUE_REG_DIST * n as u32 }
pub const fn srrctl(n: usize) -> u32 { 0x1014 + QUEUE_REG_DIST * n as u32 }
pub const fn rdt(n: usize) -> u32    { 0x1018 + QUEUE_REG_DIST * n as u32 }
pub const fn rxdctl(n: usize) -> u32 { 0x1028 + QUEUE_REG_DIST * n as u32 }

pub const fn tdbal(n: usize) -> u32  { 0x2000 + QUEUE_REG_DIST * n as u32 }
pub const fn tdbah(n: usize) -> u32  { 0x2004 + QUEUE_REG_DIST * n as u32 }
pub const fn tdlen(n: usize) -> u32  { 0x2008 + QUEUE_REG_DIST * n as u32 }
pub const fn tdh(n: usize) -> u32    { 0x2010 + QUEUE_REG_DIST * n as u32 }
pub const fn tdt(n: usize) -> u32    { 0x2018 + QUEUE_REG_DIST * n as u32 }
pub const fn txdctl(n: usize) -> u32 { 0x2028 + QUEUE_REG_DIST * n as u32 }
/// Transmit head write-back address, low half. Bit 0 enables the write-back.
pub const fn tdwbal(n: usize) -> u32 { 0x2038 + QUEUE_REG_DIST * n as u32 }
pub const fn tdwbah(n: usize) -> u32 { 0x203C + QUEUE_REG_DIST * n as u32 }

// VFCTRL commands
pub const VFCTRL_RST:                   u32 = 1 << 26;

// VFLINKS bits
pub const VFLINKS_UP:                   u32 = 1 << 30;

// Mailbox control bits
/// VF requests the PF to read a message
pub const VFMAILBOX_REQ:                u32 = 1 << 0;
/// VF acknowledges a PF message
pub const VFMAILBOX_ACK:                u32 = 1 << 1;
/// VF owns the mailbox buffer
pub const VFMAILBOX_VFU:                u32 = 1 << 2;
/// PF wrote a message
pub const VFMAILBOX_PFSTS:              u32 = 1 << 4;
/// PF acknowledged the VF's message
pub const VFMAILBOX_PFACK:              u32 = 1 << 5;
/// PF reset is in progress
pub const VFMAILBOX_RSTI:               u32 = 1 << 6;
/// PF reset is done
pub const VFMAILBOX_RSTD:               u32 = 1 << 7;
/// The bits that are cleared when VFMAILBOX is read
pub const VFMAILBOX_R2C_BITS:           u32 = VFMAILBOX_RSTD | VFMAILBOX_PFSTS | VFMAILBOX_PFACK;

/// Size of the mailbox in 32-bit words
pub const MAILBOX_SIZE:                 usize = 16;

// SRRCTL commands
/// Shift of the packet buffer size, in 1 KB units
pub const SRRCTL_BSIZEPKT_SHIFT:        u32 = 10;
pub const SRRCTL_DESCTYPE_ADV_ONEBUF:   u32 = 1 << 25;
pub const SRRCTL_DROP_EN:               u32 = 1 << 28;

// RXDCTL / TXDCTL commands
pub const RXDCTL_ENABLE:                u32 = 1 << 25;
/// Strip VLAN tags from received frames
pub const RXDCTL_VME:                   u32 = 1 << 30;
pub const TXDCTL_ENABLE:                u32 = 1 << 25;
pub const TDWBAL_HEAD_WB_ENABLE:        u32 = 1 << 0;

// IVAR
/// Marks an IVAR entry as valid
pub const IVAR_ALLOC_VAL:               u32 = 0x80;

/// The maximum number of MSI-X vectors a VF has
pub const MAX_MSIX_VECTORS:             usize = 3;
/// Interrupt throttle interval written at start, in 2 us units
pub const DEFAULT_EITR_INTERVAL:        u32 = 0x0C8 << 3;
