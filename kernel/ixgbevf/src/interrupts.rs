//! Mapping of ring and mailbox interrupt causes onto the VF's MSI-X vectors.

use alloc::vec::Vec;
use nic_hal::RegisterAccess;
use crate::{
    config::MAX_RING_PAIRS,
    regs::{self, IVAR_ALLOC_VAL, MAX_MSIX_VECTORS},
};

/// The OS side of MSI-X vector management.
pub trait InterruptController: Send + Sync {
    /// Allocates between `min` and `max` vectors and returns how many were granted.
    fn alloc_vectors(&self, min: usize, max: usize) -> Result<usize, &'static str>;
    /// Frees every allocated vector. All of them must be detached first.
    fn free_vectors(&self);
    /// Routes `vector` to the driver's [`crate::IxgbeVfNic::handle_interrupt()`].
    fn attach(&self, vector: usize) -> Result<(), &'static str>;
    fn detach(&self, vector: usize);
}

/// Something that raises an interrupt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterruptCause {
    Rx(usize),
    Tx(usize),
    /// The mailbox.
    Other,
}

/// Which causes each vector carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VectorMap {
    vectors: Vec<Vec<InterruptCause>>,
}

impl VectorMap {
    /// Spreads every receive ring, then every transmit ring, then the mailbox cause
    /// over `num_vectors` vectors in round-robin order.
    pub fn assign(num_vectors: usize, rx_rings: usize, tx_rings: usize) -> Result<VectorMap, &'static str> {
        if num_vectors == 0 || num_vectors > MAX_MSIX_VECTORS {
            return Err("VectorMap::assign(): vector count must be between 1 and 3");
        }
        if rx_rings > MAX_RING_PAIRS || tx_rings > MAX_RING_PAIRS {
            return Err("VectorMap::assign(): too many rings");
        }
        let mut vectors = Vec::with_capacity(num_vectors);
        vectors.resize_with(num_vectors, Vec::new);
        let causes = (0..rx_rings).map(InterruptCause::Rx)
            .chain((0..tx_rings).map(InterruptCause::Tx))
            .chain(core::iter::once(InterruptCause::Other));
        for (i, cause) in causes.enumerate() {
            vectors[i % num_vectors].push(cause);
        }
        Ok(VectorMap { vectors })
    }

    pub fn num_vectors(&self) -> usize {
        self.vectors.len()
    }

    pub fn causes(&self, vector: usize) -> &[InterruptCause] {
        self.vectors.get(vector).map_or(&[], |causes| causes.as_slice())
    }

    pub fn vector_of(&self, cause: InterruptCause) -> Option<usize> {
        self.vectors.iter().position(|causes| causes.contains(&cause))
    }

    /// The bit mask of every vector, as used by the VTEIMS/VTEIMC/VTEICS registers.
    pub fn mask(&self) -> u32 {
        (1 << self.vectors.len()) - 1
    }

    /// Writes the mapping into the IVAR registers.
    ///
    /// Each VTIVAR register covers two queues: bytes 0 and 1 are the receive and transmit
    /// causes of the even queue, bytes 2 and 3 those of the odd queue.
    pub fn program(&self, regs: &dyn RegisterAccess) {
        for n in 0..MAX_RING_PAIRS / 2 {
            regs.write_reg(regs::vtivar(n), 0);
        }
        for (vector, causes) in self.vectors.iter().enumerate() {
            for cause in causes {
                let (queue, direction) = match *cause {
                    InterruptCause::Rx(q) => (q, 0),
                    InterruptCause::Tx(q) => (q, 1),
                    InterruptCause::Other => {
                        regs.write_reg(regs::VTIVAR_MISC, vector as u32 | IVAR_ALLOC_VAL);
                        continue;
                    }
                };
                let reg = regs::vtivar(queue >> 1);
                let shift = 16 * (queue as u32 & 1) + 8 * direction;
                let mut ivar = regs.read_reg(reg);
                ivar &= !(0xFF << shift);
                ivar |= (vector as u32 | IVAR_ALLOC_VAL) << shift;
                regs.write_reg(reg, ivar);
            }
        }
    }
}
