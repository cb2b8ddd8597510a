//! Controller handle: driver init, qpair lifecycle, command submission, and
//! the completion trampoline.

use std::path::PathBuf;
use std::time::Instant;

use nvq_shmem::{Region, RegionFlags, RegionManager, Role, ShmemError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, warn};

use crate::buffer::IoBuffer;
use crate::cmd::{
    io_opc, status_field, DsmRange, NvmeCommand, NvmeCompletion, SCT_MEDIA_ERROR,
    SC_UNRECOVERED_READ_ERROR,
};
use crate::cmdlog::{CmdLog, CmdLogEntry, IoCallback, MAX_QPAIRS};
use crate::config::{DriverConfig, GlobalConfig};
use crate::oracle::{CrcTable, WriteToken};
use crate::transport::{DmaRegion, Transport, TransportError};
use crate::SECTOR_SIZE;

/// Stable inter-process region names.
pub const TOKEN_REGION: &str = "driver_io_token";
pub const CRC_REGION: &str = "driver_crc32_table";
pub const CONFIG_REGION: &str = "driver_global_config";
pub const CMDLOG_REGION: &str = "driver_cmdlog_table";

/// Single-namespace driver; everything targets nsid 1.
const NSID: u32 = 1;

/// All writes are PRNG-reproducible from this seed.
const RNG_SEED: u64 = 1;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Shmem(#[from] ShmemError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("region {name:?} missing at secondary attach")]
    RegionMissing { name: &'static str },
    #[error("region {name:?} is {got} bytes, need {need}")]
    RegionSize {
        name: &'static str,
        got: usize,
        need: usize,
    },
    #[error("controller qpair limit reached (id {qid}, cap {MAX_QPAIRS})")]
    QpairLimit { qid: u16 },
    #[error("qpair {qid} is not active")]
    InactiveQpair { qid: u16 },
    #[error("zero-length i/o")]
    EmptyIo,
    #[error("buffer holds {len} bytes, i/o needs {need}")]
    ShortBuffer { len: usize, need: usize },
    #[error("io flags {flags:#010x} use reserved low bits")]
    BadIoFlags { flags: u32 },
}

/// Driver init options.
#[derive(Debug, Clone)]
pub struct CtrlrOpts {
    pub role: Role,
    /// Directory holding the named regions; defaults to the system
    /// shared-memory mount. Tests point this at a private tempdir.
    pub shm_dir: Option<PathBuf>,
    /// Upper bound on the checksum-table size. A namespace needing more
    /// disables read verification instead of failing init.
    pub crc_table_limit: Option<usize>,
}

impl Default for CtrlrOpts {
    fn default() -> Self {
        Self {
            role: Role::Primary,
            shm_dir: None,
            crc_table_limit: None,
        }
    }
}

/// One controller as seen by one process.
///
/// Owns the transport connection, the shared-state handles, and the
/// process-wide PRNG. Qpairs are identified by id; the admin qpair is 0.
pub struct Ctrlr<T: Transport> {
    transport: T,
    shmem: RegionManager,
    token: WriteToken,
    config: GlobalConfig,
    crc: CrcTable,
    log: CmdLog,
    rng: StdRng,
    epoch: Instant,
    nsze: u64,
    poll_scratch: Vec<NvmeCompletion>,
}

impl<T: Transport> Ctrlr<T> {
    /// Brings the driver up against `transport`.
    ///
    /// The primary reserves the four shared regions and seeds them; a
    /// secondary attaches to what the primary created. A missing required
    /// region is fatal to a secondary; a missing or unreservable checksum
    /// region only disables read verification.
    pub fn init(transport: T, opts: CtrlrOpts) -> Result<Self, DriverError> {
        let shmem = match &opts.shm_dir {
            Some(dir) => RegionManager::with_dir(opts.role, dir),
            None => match opts.role {
                Role::Primary => RegionManager::primary(),
                Role::Secondary => RegionManager::secondary(),
            },
        };
        let nsze = transport.ns_sectors();

        let (token_region, config_region, log_region, crc_region) = match opts.role {
            Role::Primary => {
                let token =
                    shmem.reserve(TOKEN_REGION, WriteToken::REGION_LEN, RegionFlags::IOVA_ANY)?;
                let config = shmem.reserve(
                    CONFIG_REGION,
                    GlobalConfig::REGION_LEN,
                    RegionFlags::IOVA_ANY,
                )?;
                let log = shmem.reserve(CMDLOG_REGION, CmdLog::region_len(), RegionFlags::IOVA_ANY)?;
                let crc = Self::reserve_crc(&shmem, nsze, opts.crc_table_limit);
                (token, config, log, crc)
            }
            Role::Secondary => {
                let token = Self::require(&shmem, TOKEN_REGION)?;
                let config = Self::require(&shmem, CONFIG_REGION)?;
                let log = Self::require(&shmem, CMDLOG_REGION)?;
                let crc = shmem.lookup(CRC_REGION)?;
                if crc.is_none() {
                    warn!("checksum table region not found; read verification disabled");
                }
                (token, config, log, crc)
            }
        };

        if log_region.len() < CmdLog::region_len() {
            return Err(DriverError::RegionSize {
                name: CMDLOG_REGION,
                got: log_region.len(),
                need: CmdLog::region_len(),
            });
        }

        let mut log = CmdLog::new(log_region);
        if opts.role == Role::Primary {
            log.reset_all();
            log.init_qpair(0);
        }
        debug!(role = ?opts.role, nsze, "driver initialized");

        Ok(Self {
            transport,
            shmem,
            token: WriteToken::new(token_region),
            config: GlobalConfig::new(config_region),
            crc: CrcTable::new(crc_region, nsze),
            log,
            rng: StdRng::seed_from_u64(RNG_SEED),
            epoch: Instant::now(),
            nsze,
            poll_scratch: Vec::new(),
        })
    }

    fn require(shmem: &RegionManager, name: &'static str) -> Result<Region, DriverError> {
        shmem
            .lookup(name)?
            .ok_or(DriverError::RegionMissing { name })
    }

    fn reserve_crc(shmem: &RegionManager, nsze: u64, limit: Option<usize>) -> Option<Region> {
        let need = CrcTable::region_len(nsze);
        if limit.is_some_and(|cap| need > cap) {
            warn!(need, "checksum table exceeds memory budget; read verification disabled");
            return None;
        }
        match shmem.reserve(CRC_REGION, need, RegionFlags::IOVA_ANY) {
            Ok(region) => Some(region),
            Err(e) => {
                warn!(error = %e, "checksum table unavailable; read verification disabled");
                None
            }
        }
    }

    /// Microseconds since driver init on the monotonic clock.
    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    pub fn nsze(&self) -> u64 {
        self.nsze
    }

    pub fn max_transfer_bytes(&self) -> usize {
        self.transport.max_transfer_bytes()
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    /// Sets the shared config word; intended once, before workloads start.
    pub fn configure(&self, config: DriverConfig) {
        self.config.store(config);
    }

    pub fn crc_table(&self) -> &CrcTable {
        &self.crc
    }

    pub fn token(&self) -> &WriteToken {
        &self.token
    }

    pub fn cmdlog(&self) -> &CmdLog {
        &self.log
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub(crate) fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Creates an I/O qpair. Ids come from the transport; anything at or
    /// past the controller cap is handed back and rejected.
    pub fn create_io_qpair(&mut self) -> Result<u16, DriverError> {
        let qid = self.transport.create_io_qpair()?;
        if usize::from(qid) >= MAX_QPAIRS {
            let _ = self.transport.delete_io_qpair(qid);
            return Err(DriverError::QpairLimit { qid });
        }
        self.log.init_qpair(usize::from(qid));
        debug!(qid, "created io qpair");
        Ok(qid)
    }

    /// Deletes the transport qpair, then clears its log to the sentinel.
    /// In that order: a freed qpair can no longer complete into dead slots.
    pub fn free_io_qpair(&mut self, qid: u16) -> Result<(), DriverError> {
        if qid == 0 || !self.log.is_active(usize::from(qid)) {
            return Err(DriverError::InactiveQpair { qid });
        }
        self.transport.delete_io_qpair(qid)?;
        self.log.clear_qpair(usize::from(qid));
        debug!(qid, "freed io qpair");
        Ok(())
    }

    /// Submits a Read or Write.
    ///
    /// Writes are stamped and recorded in the checksum table here, before
    /// the device sees the data. `len` may exceed the transfer size but
    /// must fit the buffer; `io_flags` may only use the upper 16 bits of
    /// cdw12.
    #[allow(clippy::too_many_arguments)]
    pub fn submit_rw(
        &mut self,
        qid: u16,
        is_read: bool,
        buf: &mut IoBuffer,
        len: usize,
        lba: u64,
        lba_count: u32,
        io_flags: u32,
        callback: Option<IoCallback>,
    ) -> Result<(), DriverError> {
        if lba_count == 0 {
            return Err(DriverError::EmptyIo);
        }
        if io_flags & 0xFFFF != 0 {
            return Err(DriverError::BadIoFlags { flags: io_flags });
        }
        let need = lba_count as usize * SECTOR_SIZE;
        if len < need || buf.len() < len {
            return Err(DriverError::ShortBuffer {
                len: buf.len().min(len),
                need,
            });
        }

        let mut cmd = NvmeCommand {
            opcode: if is_read { io_opc::READ } else { io_opc::WRITE },
            nsid: NSID,
            cdw12: (lba_count - 1) | io_flags,
            ..Default::default()
        };
        cmd.set_slba(lba);

        if !is_read {
            self.crc
                .record_write(lba, lba_count, &mut buf.as_mut_slice()[..need], SECTOR_SIZE, &self.token);
        }

        let data = DmaRegion::new(buf.as_mut_ptr(), len);
        self.submit_logged(qid, cmd, Some(data), lba, lba_count, callback)
    }

    /// Submits an arbitrary command with the same log machinery and no
    /// buffer stamping. Dataset Management deallocations on an I/O qpair
    /// drop the named ranges from the checksum table before submission.
    #[allow(clippy::too_many_arguments)]
    pub fn submit_raw(
        &mut self,
        qid: u16,
        opcode: u8,
        nsid: u32,
        buf: Option<(&mut IoBuffer, usize)>,
        cdw10: u32,
        cdw11: u32,
        cdw12: u32,
        cdw13: u32,
        cdw14: u32,
        cdw15: u32,
        callback: Option<IoCallback>,
    ) -> Result<(), DriverError> {
        let cmd = NvmeCommand {
            opcode,
            nsid,
            cdw10,
            cdw11,
            cdw12,
            cdw13,
            cdw14,
            cdw15,
            ..Default::default()
        };

        let data = match buf {
            Some((buf, len)) => {
                if buf.len() < len {
                    return Err(DriverError::ShortBuffer {
                        len: buf.len(),
                        need: len,
                    });
                }
                if opcode == io_opc::DATASET_MANAGEMENT && qid != 0 {
                    let nranges = (cdw10 & 0xFF) as usize + 1;
                    for i in 0..nranges {
                        let range = buf
                            .as_slice()
                            .get(i * DsmRange::WIRE_SIZE..)
                            .and_then(DsmRange::parse);
                        if let Some(range) = range {
                            self.crc.invalidate(range.slba, u64::from(range.nlb));
                        }
                    }
                }
                Some(DmaRegion::new(buf.as_mut_ptr(), len))
            }
            None => None,
        };

        self.submit_logged(qid, cmd, data, 0, 0, callback)
    }

    fn submit_logged(
        &mut self,
        qid: u16,
        cmd: NvmeCommand,
        data: Option<DmaRegion>,
        lba: u64,
        lba_count: u32,
        callback: Option<IoCallback>,
    ) -> Result<(), DriverError> {
        if !self.log.is_active(usize::from(qid)) {
            return Err(DriverError::InactiveQpair { qid });
        }
        let entry = CmdLogEntry {
            cmd,
            t_cmd_us: self.now_us(),
            buf: data.map_or(0, |d| d.ptr as u64),
            buf_len: data.map_or(0, |d| d.len as u32),
            lba,
            lba_count,
            verify_read: u8::from(cmd.opcode == io_opc::READ && data.is_some()),
            ..Default::default()
        };
        let slot = self.log.append(usize::from(qid), entry, callback);

        let mut wire = cmd;
        wire.cid = slot;
        if let Err(e) = self.transport.submit(qid, &wire, data) {
            // The slot stays logged for post-mortem but must not fire a
            // callback later.
            self.log.take_callback(usize::from(qid), usize::from(slot));
            return Err(e.into());
        }
        Ok(())
    }

    /// Reaps up to `max` completions from the qpair and runs the trampoline
    /// for each: stamp latency into completion dword 2, verify read
    /// payloads, then fire the user callback.
    pub fn process_completions(&mut self, qid: u16, max: usize) -> usize {
        let mut cpls = std::mem::take(&mut self.poll_scratch);
        cpls.clear();
        let n = self.transport.poll(qid, max, &mut cpls);
        for cpl in cpls.drain(..) {
            self.complete_one(qid, cpl);
        }
        self.poll_scratch = cpls;
        n
    }

    fn complete_one(&mut self, qid: u16, mut cpl: NvmeCompletion) {
        let slot = usize::from(cpl.cid);
        let entry = self.log.entry(usize::from(qid), slot);
        let t_cpl = self.now_us();
        let latency = u32::try_from(t_cpl.saturating_sub(entry.t_cmd_us)).unwrap_or(u32::MAX);
        cpl.cdw2 = latency;

        if entry.verify_read != 0 && entry.buf != 0 && self.config.verify_read() {
            let need = entry.lba_count as usize * SECTOR_SIZE;
            if need > 0 && need <= entry.buf_len as usize {
                // SAFETY: the submitter keeps the I/O buffer alive until its
                // completion; this is that completion.
                let data =
                    unsafe { std::slice::from_raw_parts(entry.buf as *const u8, need) };
                if let Err(e) = self.crc.verify(entry.lba, entry.lba_count, data, SECTOR_SIZE) {
                    warn!(lba = e.lba, kind = ?e.kind, "read verification failed; reporting media error");
                    cpl.status =
                        status_field(SCT_MEDIA_ERROR, SC_UNRECOVERED_READ_ERROR, cpl.status & 1);
                }
            }
        }

        self.log.update(usize::from(qid), slot, |e| {
            e.cpl = cpl;
            e.t_cpl_us = t_cpl;
        });

        if let Some(callback) = self.log.take_callback(usize::from(qid), slot) {
            callback(&cpl);
        }
    }
}

impl<T: Transport> Drop for Ctrlr<T> {
    fn drop(&mut self) {
        if self.shmem.role() == Role::Primary {
            for name in [TOKEN_REGION, CRC_REGION, CONFIG_REGION, CMDLOG_REGION] {
                if let Err(e) = self.shmem.free(name) {
                    debug!(name, error = %e, "region teardown failed");
                }
            }
        }
    }
}
