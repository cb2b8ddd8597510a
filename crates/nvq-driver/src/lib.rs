//! User-space NVMe qualification driver.
//!
//! A host-side engine for firmware validation: it submits admin and I/O
//! commands over a pluggable [`Transport`], records every command/completion
//! pair in a per-qpair log, verifies read payloads against a host-maintained
//! CRC table shared across cooperating processes, and runs closed-loop
//! synthetic workloads ([`run_ioworker`]).
//!
//! The transport (PCIe or fabrics), DMA allocation, and the scripting-facing
//! binding layer all live outside this crate. [`MemCtrlr`] provides a
//! RAM-backed loopback transport so the whole pipeline can run hermetically.

pub mod buffer;
pub mod cmd;
pub mod cmdlog;
pub mod config;
pub mod ctrlr;
pub mod ioworker;
pub mod mem_ctrlr;
pub mod opnames;
pub mod oracle;
pub mod rpc;
pub mod transport;

/// Logical block size. The driver only supports 512-byte formatted
/// namespaces; sizing and stamping arithmetic assume it throughout.
pub const SECTOR_SIZE: usize = 512;

pub use buffer::{BufferError, IoBuffer};
pub use cmd::{NvmeCommand, NvmeCompletion};
pub use cmdlog::{CmdLogEntry, IoCallback, CMD_LOG_DEPTH, MAX_QPAIRS};
pub use config::{DriverConfig, GlobalConfig};
pub use ctrlr::{Ctrlr, CtrlrOpts, DriverError};
pub use ioworker::{run_ioworker, IoWorkerArgs, IoWorkerError, IoWorkerRets, US_PER_S};
pub use mem_ctrlr::MemCtrlr;
pub use oracle::{CrcTable, VerifyError, VerifyErrorKind, WriteToken};
pub use rpc::controllers_snapshot;
pub use transport::{DmaRegion, Transport, TransportError};
