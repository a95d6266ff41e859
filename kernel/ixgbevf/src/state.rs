use core::sync::atomic::{AtomicU32, Ordering};

bitflags! {
    /// The state of a VF device.
    ///
    /// Transitions happen only under the device lock,
    /// but the data path reads the flags without it.
    pub struct DeviceState: u32 {
        /// Attach finished: the PF handshake succeeded and the rings exist.
        const INITIALIZED       = 1 << 0;
        /// Rings are programmed and enabled.
        const STARTED           = 1 << 1;
        const SUSPENDED         = 1 << 2;
        /// A transmit ring stopped making progress.
        const STALL             = 1 << 3;
        /// A hardware or PF fault; cleared only by a reset.
        const ERROR             = 1 << 4;
        /// Interrupt vectors are being reallocated.
        const INTR_ADJUSTING    = 1 << 5;
    }
}

/// A [`DeviceState`] that can be shared between the device and its rings.
#[derive(Debug, Default)]
pub struct StateCell(AtomicU32);

impl StateCell {
    pub const fn new() -> StateCell {
        StateCell(AtomicU32::new(0))
    }

    pub fn get(&self) -> DeviceState {
        DeviceState::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    pub fn contains(&self, flags: DeviceState) -> bool {
        self.get().contains(flags)
    }

    pub fn insert(&self, flags: DeviceState) {
        self.0.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn remove(&self, flags: DeviceState) {
        self.0.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// True if packets may be submitted: started, and neither suspended nor in error.
    pub fn is_running(&self) -> bool {
        let state = self.get();
        state.contains(DeviceState::STARTED)
            && !state.intersects(DeviceState::SUSPENDED | DeviceState::ERROR)
    }
}
