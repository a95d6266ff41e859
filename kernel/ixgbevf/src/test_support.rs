//! A simulated VF register window with a PF behind its mailbox, plus a recording
//! network stack and interrupt controller, for exercising the driver without hardware.
//!
//! The simulated device "DMAs" by dereferencing the physical addresses the driver programs,
//! which works because [`SimDma`] hands out identity-mapped memory.

use alloc::{sync::Arc, vec, vec::Vec};
use std::collections::HashMap;
use spin::Mutex;
use intel_ethernet::descriptors::{
    AdvancedRxDescriptor, AdvancedTxDescriptor, DESCRIPTOR_SIZE, RX_STATUS_DD, RX_STATUS_EOP,
    RX_STATUS_VP, TX_CMD_RS, TX_STATUS_DD,
};
use nic_buffers::ReceivedFrame;
use nic_hal::{sim::{SimClock, SimDma}, HalError, RegisterAccess};
use crate::{
    DeviceError, IxgbeVfNic, Platform,
    config::{ReclaimStrategy, VfConfig},
    interrupts::InterruptController,
    mailbox::message::{refusal_word, Envelope, Message, Opcode, MAC_ADDRS_PER_PAGE, MSG_ACK, MSG_CTS, MSG_NACK},
    regs::*,
    stack::{NetStack, RingDirection, RingHandle, RingStats},
    tx::TxRing,
};

/// How the simulated PF behaves.
pub(crate) struct PfConfig {
    /// The version the PF acknowledges, whatever the VF asks for.
    pub api_version: u32,
    pub macs: Vec<[u8; 6]>,
    /// Replaces `macs` the first time a page other than the first is requested,
    /// and flags that reply as changed.
    pub macs_after_change: Option<Vec<[u8; 6]>>,
    pub tx_queues: u32,
    pub rx_queues: u32,
    pub vlan_strip: bool,
    pub max_mtu: u32,
    /// Requests the PF refuses.
    pub nack: Vec<Opcode>,
    /// Requests the PF answers without ACK or NACK.
    pub unprocessed: Vec<Opcode>,
    /// The PF never acknowledges anything.
    pub unresponsive: bool,
    pub link_up: bool,
}

impl Default for PfConfig {
    fn default() -> Self {
        PfConfig {
            api_version: crate::mailbox::API_VERSION,
            macs: vec![[0x02, 0, 0, 0, 0, 0x01], [0x02, 0, 0, 0, 0, 0x02]],
            macs_after_change: None,
            tx_queues: 4,
            rx_queues: 4,
            vlan_strip: false,
            max_mtu: 9000,
            nack: Vec::new(),
            unprocessed: Vec::new(),
            unresponsive: false,
            link_up: true,
        }
    }
}

struct SimState {
    regs: HashMap<u32, u32>,
    mbx: [u32; MAILBOX_SIZE],
    vfu: bool,
    /// Read-to-clear bits of VFMAILBOX.
    r2c: u32,
    pf: PfConfig,
    /// Word 0 of every request the VF sent.
    requests: Vec<u32>,
    /// Word 0 of every reply the VF sent to a PF message.
    replies: Vec<u32>,
    vf_acks: usize,
    access_fault: bool,
    /// A message the PF sends in place of its next reply.
    interjection: Option<Vec<u32>>,
    /// The reply held back by an interjection, sent once the VF answers it.
    deferred_reply: Option<Vec<u32>>,
}

impl SimState {
    fn reg(&self, offset: u32) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    fn reg64(&self, low: u32, high: u32) -> u64 {
        (self.reg(high) as u64) << 32 | self.reg(low) as u64
    }

    /// Sets TDH of transmit ring `queue` and writes it back if the driver enabled that.
    fn set_tx_head(&mut self, queue: usize, head: usize) {
        self.regs.insert(tdh(queue), head as u32);
        let wbal = self.reg(tdwbal(queue));
        if wbal & TDWBAL_HEAD_WB_ENABLE != 0 {
            let addr = (self.reg(tdwbah(queue)) as u64) << 32 | (wbal & !0x3) as u64;
            // SAFETY: the driver pointed the write-back at the extra slot of its ring.
            unsafe { core::ptr::write_volatile(addr as *mut u32, head as u32) };
        }
    }

    fn handle_mailbox_write(&mut self) {
        let word0 = self.mbx[0];
        if word0 & (MSG_ACK | MSG_NACK) != 0 {
            self.replies.push(word0);
            self.r2c |= VFMAILBOX_PFACK;
            if let Some(reply) = self.deferred_reply.take() {
                self.post(&reply);
            }
            return;
        }
        self.requests.push(word0);
        if self.pf.unresponsive {
            return;
        }
        self.r2c |= VFMAILBOX_PFACK;
        let reply = match Envelope::decode(&self.mbx) {
            Ok(envelope) => self.reply_to(envelope.message),
            Err(_) => vec![refusal_word(word0)],
        };
        match self.interjection.take() {
            Some(message) => {
                self.deferred_reply = Some(reply);
                self.post(&message);
            }
            None => self.post(&reply),
        }
    }

    fn post(&mut self, words: &[u32]) {
        self.mbx[..words.len()].copy_from_slice(words);
        self.r2c |= VFMAILBOX_PFSTS;
    }

    fn reply_to(&mut self, message: Message) -> Vec<u32> {
        let opcode = message.opcode();
        if self.pf.nack.contains(&opcode) {
            return vec![opcode as u32 | MSG_NACK | MSG_CTS];
        }
        if self.pf.unprocessed.contains(&opcode) {
            return vec![opcode as u32 | MSG_CTS];
        }
        let reply = match message {
            Message::ApiNegotiate { .. } => Message::ApiNegotiate { version: self.pf.api_version },
            Message::GetMacAddrs { offset } => {
                let mut changed = false;
                if offset != 0 {
                    if let Some(macs) = self.pf.macs_after_change.take() {
                        self.pf.macs = macs;
                        changed = true;
                    }
                }
                let total = self.pf.macs.len();
                let start = core::cmp::min(offset as usize, total);
                let end = core::cmp::min(start + MAC_ADDRS_PER_PAGE, total);
                Message::MacAddrs { total: total as u32, offset, changed, addrs: self.pf.macs[start..end].to_vec() }
            }
            Message::GetQueues => Message::Queues { tx: self.pf.tx_queues, rx: self.pf.rx_queues, vlan_strip: self.pf.vlan_strip },
            Message::GetMtuLimit => Message::MtuLimit { max_mtu: self.pf.max_mtu },
            other => other,
        };
        Envelope::ack(reply).encode().unwrap_or_else(|_| vec![refusal_word(opcode as u32)])
    }
}

/// The register window of a simulated VF.
pub(crate) struct SimNic {
    state: Mutex<SimState>,
}

impl SimNic {
    pub fn new(pf: PfConfig) -> SimNic {
        SimNic {
            state: Mutex::new(SimState {
                regs: HashMap::new(),
                mbx: [0; MAILBOX_SIZE],
                vfu: false,
                r2c: 0,
                pf,
                requests: Vec::new(),
                replies: Vec::new(),
                vf_acks: 0,
                access_fault: false,
                interjection: None,
                deferred_reply: None,
            }),
        }
    }

    /// The last value written to a register.
    pub fn reg(&self, offset: u32) -> u32 {
        self.state.lock().reg(offset)
    }

    /// How many requests with `opcode` the VF has sent.
    pub fn request_count(&self, opcode: Opcode) -> usize {
        self.state.lock().requests.iter().filter(|w| **w & 0xFFFF == opcode as u32).count()
    }

    pub fn total_requests(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Word 0 of every reply the VF sent to a PF message.
    pub fn replies(&self) -> Vec<u32> {
        self.state.lock().replies.clone()
    }

    pub fn vf_acks(&self) -> usize {
        self.state.lock().vf_acks
    }

    /// Sends a message from the PF to the VF.
    pub fn pf_send(&self, words: &[u32]) {
        let mut st = self.state.lock();
        st.mbx[..words.len()].copy_from_slice(words);
        st.r2c |= VFMAILBOX_PFSTS;
    }

    /// Makes the PF send `words` after the next request, before replying to it.
    pub fn pf_send_before_next_reply(&self, words: &[u32]) {
        self.state.lock().interjection = Some(words.to_vec());
    }

    /// Makes the PF reset the VF behind the driver's back.
    pub fn trigger_pf_reset(&self) {
        self.state.lock().r2c |= VFMAILBOX_RSTD;
    }

    pub fn set_link(&self, up: bool) {
        self.state.lock().pf.link_up = up;
    }

    pub fn set_access_fault(&self, fault: bool) {
        self.state.lock().access_fault = fault;
    }

    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.state.lock().pf.unresponsive = unresponsive;
    }

    /// Transmits up to `packets` packets queued on transmit ring `queue`, as the hardware would:
    /// sets DD on every descriptor with RS, advances TDH, and writes the head back if enabled.
    /// Returns the bytes of every transmitted packet.
    pub fn complete_tx(&self, queue: usize, packets: usize) -> Vec<Vec<u8>> {
        let mut st = self.state.lock();
        let base = st.reg64(tdbal(queue), tdbah(queue));
        let n = st.reg(tdlen(queue)) as usize / DESCRIPTOR_SIZE;
        if base == 0 || n == 0 || st.reg(txdctl(queue)) & TXDCTL_ENABLE == 0 {
            return Vec::new();
        }
        let tail = st.reg(tdt(queue)) as usize;
        let mut head = st.reg(tdh(queue)) as usize;
        let mut frames = Vec::new();
        let mut current = Vec::new();
        while head != tail && frames.len() < packets {
            // SAFETY: `base` is the driver's ring, identity-mapped by SimDma and `n` descriptors long.
            let desc = unsafe { &mut *(base as *mut AdvancedTxDescriptor).add(head) };
            if !desc.is_context() {
                let addr = desc.buffer_addr.read();
                let len = desc.data_len() as usize;
                // SAFETY: the driver keeps every bound fragment and copy buffer alive until reclaim.
                current.extend_from_slice(unsafe { core::slice::from_raw_parts(addr as *const u8, len) });
                if desc.cmd_type_len.read() & TX_CMD_RS != 0 {
                    desc.olinfo_status.write(desc.olinfo_status.read() | TX_STATUS_DD);
                }
                if desc.is_end_of_packet() {
                    frames.push(core::mem::take(&mut current));
                }
            }
            head = (head + 1) % n;
        }
        st.set_tx_head(queue, head);
        frames
    }

    /// Moves the head of transmit ring `queue` without setting DD anywhere,
    /// as a device part way through a packet would.
    pub fn set_tx_head(&self, queue: usize, head: usize) {
        self.state.lock().set_tx_head(queue, head);
    }

    /// Receives `frames` on receive ring `queue`, spreading each over as many buffers as needed.
    /// Stops at the first frame that doesn't fit in the descriptors the driver handed over,
    /// and returns how many frames were received.
    pub fn inject_rx<F: AsRef<[u8]>>(&self, queue: usize, frames: &[F], vlan_tag: Option<u16>) -> usize {
        let mut st = self.state.lock();
        let base = st.reg64(rdbal(queue), rdbah(queue));
        let n = st.reg(rdlen(queue)) as usize / DESCRIPTOR_SIZE;
        let buffer_size = ((st.reg(srrctl(queue)) & 0x1F) as usize) << SRRCTL_BSIZEPKT_SHIFT;
        if base == 0 || n == 0 || buffer_size == 0 || st.reg(rxdctl(queue)) & RXDCTL_ENABLE == 0 {
            return 0;
        }
        let tail = st.reg(rdt(queue)) as usize;
        let mut head = st.reg(rdh(queue)) as usize;
        let mut received = 0;
        for frame in frames {
            let chunks: Vec<&[u8]> = frame.as_ref().chunks(buffer_size).collect();
            if chunks.len() > (tail + n - head) % n {
                break;
            }
            for (i, chunk) in chunks.iter().enumerate() {
                // SAFETY: as in `complete_tx()`.
                let desc = unsafe { &mut *(base as *mut AdvancedRxDescriptor).add(head) };
                let addr = desc.packet_buffer_address.read();
                // SAFETY: the descriptor points at a receive buffer of at least `buffer_size` bytes.
                unsafe { core::ptr::copy_nonoverlapping(chunk.as_ptr(), addr as *mut u8, chunk.len()) };
                let mut write_back = RX_STATUS_DD | (chunk.len() as u64) << 32;
                if i == chunks.len() - 1 {
                    write_back |= RX_STATUS_EOP;
                }
                if let Some(tag) = vlan_tag {
                    write_back |= RX_STATUS_VP | (tag as u64) << 48;
                }
                desc.header_buffer_address.write(write_back);
                head = (head + 1) % n;
            }
            received += 1;
        }
        st.regs.insert(rdh(queue), head as u32);
        received
    }
}

impl RegisterAccess for SimNic {
    fn read_reg(&self, offset: u32) -> u32 {
        let mut st = self.state.lock();
        match offset {
            VFMAILBOX => {
                let value = if st.vfu { VFMAILBOX_VFU } else { 0 } | st.r2c;
                st.r2c = 0;
                value
            }
            o if (VFMBMEM..VFMBMEM + 4 * MAILBOX_SIZE as u32).contains(&o) => st.mbx[((o - VFMBMEM) / 4) as usize],
            VFLINKS => if st.pf.link_up { VFLINKS_UP } else { 0 },
            o => st.reg(o),
        }
    }

    fn write_reg(&self, offset: u32, value: u32) {
        let mut st = self.state.lock();
        match offset {
            VFMAILBOX => {
                if value & VFMAILBOX_REQ != 0 {
                    st.vfu = false;
                    st.handle_mailbox_write();
                } else if value & VFMAILBOX_ACK != 0 {
                    st.vfu = false;
                    st.vf_acks += 1;
                } else if value & VFMAILBOX_VFU != 0 {
                    st.vfu = true;
                }
            }
            o if (VFMBMEM..VFMBMEM + 4 * MAILBOX_SIZE as u32).contains(&o) => st.mbx[((o - VFMBMEM) / 4) as usize] = value,
            VFCTRL if value & VFCTRL_RST != 0 => {
                st.regs.clear();
                st.vfu = false;
                st.r2c |= VFMAILBOX_RSTD;
            }
            o => {
                st.regs.insert(o, value);
            }
        }
    }

    fn check_access(&self) -> Result<(), HalError> {
        if self.state.lock().access_fault {
            Err(HalError::AccessFault)
        } else {
            Ok(())
        }
    }
}


#[derive(Default)]
struct IntrState {
    available: usize,
    allocated: usize,
    attached: Vec<usize>,
    fail_attach: bool,
}

/// An interrupt controller that only keeps books.
pub(crate) struct SimInterrupts {
    state: Mutex<IntrState>,
}

impl SimInterrupts {
    pub fn new(available: usize) -> SimInterrupts {
        SimInterrupts { state: Mutex::new(IntrState { available, ..Default::default() }) }
    }

    pub fn set_available(&self, available: usize) {
        self.state.lock().available = available;
    }

    pub fn set_fail_attach(&self, fail: bool) {
        self.state.lock().fail_attach = fail;
    }

    pub fn allocated(&self) -> usize {
        self.state.lock().allocated
    }

    pub fn attached(&self) -> Vec<usize> {
        self.state.lock().attached.clone()
    }
}

impl InterruptController for SimInterrupts {
    fn alloc_vectors(&self, min: usize, max: usize) -> Result<usize, &'static str> {
        let mut st = self.state.lock();
        if st.allocated != 0 {
            return Err("SimInterrupts: vectors already allocated");
        }
        let granted = core::cmp::min(max, st.available);
        if granted == 0 || granted < min {
            return Err("SimInterrupts: not enough vectors");
        }
        st.allocated = granted;
        Ok(granted)
    }

    fn free_vectors(&self) {
        self.state.lock().allocated = 0;
    }

    fn attach(&self, vector: usize) -> Result<(), &'static str> {
        let mut st = self.state.lock();
        if st.fail_attach || vector >= st.allocated {
            return Err("SimInterrupts: can't attach vector");
        }
        st.attached.push(vector);
        Ok(())
    }

    fn detach(&self, vector: usize) {
        self.state.lock().attached.retain(|v| *v != vector);
    }
}


#[derive(Default)]
struct StackLog {
    next_handle: u64,
    registered: Vec<RingHandle>,
    started: Vec<RingHandle>,
    delivered: Vec<(RingHandle, ReceivedFrame)>,
    resumed: Vec<RingHandle>,
    link_events: Vec<bool>,
    stats: HashMap<u64, RingStats>,
    /// Registration fails once this many rings are registered.
    fail_register_at: Option<usize>,
}

/// A network stack that records every upcall.
#[derive(Default)]
pub(crate) struct RecordingStack {
    log: Mutex<StackLog>,
}

impl RecordingStack {
    pub fn registered(&self) -> Vec<RingHandle> {
        self.log.lock().registered.clone()
    }

    pub fn started(&self) -> Vec<RingHandle> {
        self.log.lock().started.clone()
    }

    pub fn take_delivered(&self) -> Vec<ReceivedFrame> {
        self.log.lock().delivered.drain(..).map(|(_, frame)| frame).collect()
    }

    pub fn resumed(&self) -> Vec<RingHandle> {
        self.log.lock().resumed.clone()
    }

    pub fn link_events(&self) -> Vec<bool> {
        self.log.lock().link_events.clone()
    }

    pub fn last_stats(&self, handle: RingHandle) -> Option<RingStats> {
        self.log.lock().stats.get(&handle.0).copied()
    }

    pub fn fail_register_at(&self, count: usize) {
        self.log.lock().fail_register_at = Some(count);
    }
}

impl NetStack for RecordingStack {
    fn register_ring(&self, _direction: RingDirection, _index: usize) -> Result<RingHandle, &'static str> {
        let mut log = self.log.lock();
        if log.fail_register_at == Some(log.registered.len()) {
            return Err("RecordingStack: registration refused");
        }
        log.next_handle += 1;
        let handle = RingHandle(log.next_handle);
        log.registered.push(handle);
        Ok(handle)
    }

    fn unregister_ring(&self, handle: RingHandle) {
        self.log.lock().registered.retain(|h| *h != handle);
    }

    fn ring_started(&self, handle: RingHandle) {
        self.log.lock().started.push(handle);
    }

    fn deliver(&self, handle: RingHandle, frames: Vec<ReceivedFrame>) {
        let mut log = self.log.lock();
        for frame in frames {
            log.delivered.push((handle, frame));
        }
    }

    fn tx_resume(&self, handle: RingHandle) {
        self.log.lock().resumed.push(handle);
    }

    fn link_changed(&self, up: bool) {
        self.log.lock().link_events.push(up);
    }

    fn update_stats(&self, handle: RingHandle, stats: RingStats) {
        self.log.lock().stats.insert(handle.0, stats);
    }
}


/// Everything a driver instance needs, simulated.
pub(crate) struct Harness {
    pub sim: Arc<SimNic>,
    pub dma: Arc<SimDma>,
    pub clock: Arc<SimClock>,
    pub intr: Arc<SimInterrupts>,
    pub stack: Arc<RecordingStack>,
}

impl Harness {
    pub fn new(pf: PfConfig) -> Harness {
        Harness::with_dma(pf, SimDma::new())
    }

    pub fn with_dma(pf: PfConfig, dma: SimDma) -> Harness {
        Harness {
            sim: Arc::new(SimNic::new(pf)),
            dma: Arc::new(dma),
            clock: Arc::new(SimClock::new()),
            intr: Arc::new(SimInterrupts::new(MAX_MSIX_VECTORS)),
            stack: Arc::new(RecordingStack::default()),
        }
    }

    pub fn platform(&self) -> Platform {
        Platform {
            regs: self.sim.clone(),
            dma: self.dma.clone(),
            clock: self.clock.clone(),
            interrupts: self.intr.clone(),
            stack: self.stack.clone(),
        }
    }

    pub fn attach(&self, config: VfConfig) -> Result<IxgbeVfNic, DeviceError> {
        IxgbeVfNic::attach(self.platform(), config)
    }

    /// Attaches and starts a device.
    pub fn started(&self, config: VfConfig) -> IxgbeVfNic {
        let nic = self.attach(config).unwrap();
        nic.start().unwrap();
        nic
    }
}

/// A small configuration: rings of 8 descriptors, one of each direction.
pub(crate) fn test_config() -> VfConfig {
    VfConfig {
        tx_ring_size: 8,
        rx_ring_size: 8,
        tx_rings: 1,
        rx_rings: 1,
        tx_copy_thresh: 64,
        tx_recycle_thresh: 2,
        tx_overload_thresh: 1,
        tx_resched_thresh: 4,
        tx_desc_limit: 4,
        tx_buffer_size: 256,
        tx_control_blocks: 12,
        reclaim_strategy: ReclaimStrategy::Legacy,
        rx_buffer_padding: 2,
        rx_pool_extra: 4,
        rx_budget: 16,
        mailbox_timeout_us: 1000,
        mailbox_poll_us: 10,
        drain_timeout_us: 1000,
        drain_poll_us: 100,
        stall_threshold_us: 1000,
        max_resets: 4,
        ..VfConfig::default()
    }
}

/// A frame of `len` bytes whose contents depend on `seed`.
pub(crate) fn frame(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
}

/// Checks that every descriptor and control block of `ring` is accounted for exactly once.
pub(crate) fn assert_census(ring: &TxRing) {
    let census = ring.census().unwrap();
    assert_eq!(census.free_descriptors + census.work_descriptors, census.ring_size, "{:?}", census);
    assert_eq!(census.free_blocks + census.work_blocks + census.in_transit_blocks, census.total_blocks, "{:?}", census);
}
