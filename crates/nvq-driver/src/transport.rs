//! Seam to the NVMe transport that actually owns the controller.
//!
//! The real transports (PCIe via VFIO, NVMe-over-Fabrics TCP) live outside
//! this crate; the driver only needs doorbell-level submit and poll plus
//! qpair lifecycle and geometry. [`crate::MemCtrlr`] implements the same
//! trait over RAM for hermetic runs.

use crate::cmd::{NvmeCommand, NvmeCompletion};

/// Raw view of a host buffer handed to the transport for DMA.
///
/// The pointee must stay alive and at a stable address until the command
/// completes; qpairs are single-threaded, so there is no concurrent access
/// to reason about.
#[derive(Debug, Clone, Copy)]
pub struct DmaRegion {
    pub ptr: *mut u8,
    pub len: usize,
}

impl DmaRegion {
    pub fn new(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("queue pair {qid} does not exist")]
    NoSuchQpair { qid: u16 },
    #[error("submission queue {qid} is full")]
    QueueFull { qid: u16 },
    #[error("controller cannot create another io qpair")]
    QpairExhausted,
}

/// Black-box controller access: submit to a queue, poll its completions.
///
/// Implementations are not required to be thread-safe per qpair; only the
/// owning thread may submit to or poll a given qpair.
pub trait Transport {
    /// Namespace capacity in 512-byte sectors (single namespace assumed).
    fn ns_sectors(&self) -> u64;

    /// Largest data transfer the controller accepts, in bytes.
    fn max_transfer_bytes(&self) -> usize;

    /// Allocates an I/O qpair and returns its id (>= 1).
    fn create_io_qpair(&mut self) -> Result<u16, TransportError>;

    fn delete_io_qpair(&mut self, qid: u16) -> Result<(), TransportError>;

    /// Rings the doorbell for one command on qpair `qid` (0 = admin).
    fn submit(
        &mut self,
        qid: u16,
        cmd: &NvmeCommand,
        data: Option<DmaRegion>,
    ) -> Result<(), TransportError>;

    /// Reaps up to `max` completions from qpair `qid` into `out`,
    /// returning how many were reaped.
    fn poll(&mut self, qid: u16, max: usize, out: &mut Vec<NvmeCompletion>) -> usize;
}
