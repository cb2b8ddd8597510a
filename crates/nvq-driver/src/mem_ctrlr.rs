//! RAM-backed loopback controller.
//!
//! Implements [`Transport`] against an in-memory namespace so the whole
//! submission/verification pipeline can run without hardware: tests, CI for
//! test scripts, and bring-up of new tooling. Commands execute synchronously
//! at submit time; completions queue per qpair and are delivered on `poll`.

use std::collections::VecDeque;

use crate::cmd::{
    io_opc, status_field, DsmRange, NvmeCommand, NvmeCompletion, SC_COMPARE_FAILURE,
    SC_INVALID_OPCODE, SC_LBA_OUT_OF_RANGE, SCT_MEDIA_ERROR,
};
use crate::transport::{DmaRegion, Transport, TransportError};
use crate::SECTOR_SIZE;

const DEFAULT_MAX_TRANSFER: usize = 128 * 1024;

// More queues than the driver's own cap, so the cap is the driver's to
// enforce.
const QPAIR_SLOTS: usize = 64;

/// Dataset Management `cdw11` attribute: deallocate.
const DSM_AD: u32 = 1 << 2;

pub struct MemCtrlr {
    disk: Vec<u8>,
    sectors: u64,
    max_transfer: usize,
    qpair_live: [bool; QPAIR_SLOTS],
    pending: Vec<VecDeque<NvmeCompletion>>,
    inject: VecDeque<u16>,
}

impl MemCtrlr {
    pub fn new(sectors: u64) -> Self {
        let mut qpair_live = [false; QPAIR_SLOTS];
        qpair_live[0] = true; // admin qpair always exists
        Self {
            disk: vec![0u8; sectors as usize * SECTOR_SIZE],
            sectors,
            max_transfer: DEFAULT_MAX_TRANSFER,
            qpair_live,
            pending: (0..QPAIR_SLOTS).map(|_| VecDeque::new()).collect(),
            inject: VecDeque::new(),
        }
    }

    pub fn set_max_transfer(&mut self, bytes: usize) {
        self.max_transfer = bytes;
    }

    /// Queues a status to be reported by an upcoming submission instead of
    /// executing it. Statuses apply in FIFO order, one per submission.
    pub fn inject_status(&mut self, sct: u8, sc: u8) {
        self.inject.push_back(status_field(sct, sc, 0));
    }

    /// Direct view of one sector's media content, for test assertions.
    pub fn sector(&self, lba: u64) -> &[u8] {
        let start = lba as usize * SECTOR_SIZE;
        &self.disk[start..start + SECTOR_SIZE]
    }

    fn check_qpair(&self, qid: u16) -> Result<(), TransportError> {
        if usize::from(qid) < QPAIR_SLOTS && self.qpair_live[usize::from(qid)] {
            Ok(())
        } else {
            Err(TransportError::NoSuchQpair { qid })
        }
    }

    fn complete(&mut self, qid: u16, cid: u16, cdw0: u32, status: u16) {
        self.pending[usize::from(qid)].push_back(NvmeCompletion {
            cdw0,
            cdw1: 0,
            // SQ head / SQ id, as a device would report before the driver
            // repurposes this dword.
            cdw2: (u32::from(qid) << 16) | u32::from(cid),
            cid,
            // Devices report phase 1 on the first pass through the queue.
            status: status | 1,
        });
    }

    fn range_ok(&self, slba: u64, nlb: u32) -> bool {
        slba.checked_add(u64::from(nlb))
            .is_some_and(|end| end <= self.sectors)
    }

    fn execute_io(&mut self, cmd: &NvmeCommand, data: Option<DmaRegion>) -> u16 {
        match cmd.opcode {
            io_opc::FLUSH => 0,
            io_opc::WRITE => {
                let (slba, nlb) = (cmd.slba(), cmd.nlb());
                if !self.range_ok(slba, nlb) {
                    return status_field(0, SC_LBA_OUT_OF_RANGE, 0);
                }
                let Some(src) = dma_slice(data, nlb) else {
                    return status_field(0, SC_INVALID_OPCODE, 0);
                };
                let start = slba as usize * SECTOR_SIZE;
                self.disk[start..start + src.len()].copy_from_slice(src);
                0
            }
            io_opc::READ => {
                let (slba, nlb) = (cmd.slba(), cmd.nlb());
                if !self.range_ok(slba, nlb) {
                    return status_field(0, SC_LBA_OUT_OF_RANGE, 0);
                }
                let Some(dst) = dma_slice_mut(data, nlb) else {
                    return status_field(0, SC_INVALID_OPCODE, 0);
                };
                let start = slba as usize * SECTOR_SIZE;
                dst.copy_from_slice(&self.disk[start..start + dst.len()]);
                0
            }
            io_opc::COMPARE => {
                let (slba, nlb) = (cmd.slba(), cmd.nlb());
                if !self.range_ok(slba, nlb) {
                    return status_field(0, SC_LBA_OUT_OF_RANGE, 0);
                }
                let Some(src) = dma_slice(data, nlb) else {
                    return status_field(0, SC_INVALID_OPCODE, 0);
                };
                let start = slba as usize * SECTOR_SIZE;
                if src == &self.disk[start..start + src.len()] {
                    0
                } else {
                    status_field(SCT_MEDIA_ERROR, SC_COMPARE_FAILURE, 0)
                }
            }
            io_opc::WRITE_ZEROES => {
                let (slba, nlb) = (cmd.slba(), cmd.nlb());
                if !self.range_ok(slba, nlb) {
                    return status_field(0, SC_LBA_OUT_OF_RANGE, 0);
                }
                let start = slba as usize * SECTOR_SIZE;
                self.disk[start..start + nlb as usize * SECTOR_SIZE].fill(0);
                0
            }
            io_opc::DATASET_MANAGEMENT => {
                if cmd.cdw11 & DSM_AD == 0 {
                    return 0; // hints only, nothing to do
                }
                let nranges = (cmd.cdw10 & 0xFF) as usize + 1;
                let Some(list) = data else {
                    return status_field(0, SC_INVALID_OPCODE, 0);
                };
                // SAFETY: caller contract on DmaRegion (live until
                // completion; completion is synchronous here).
                let bytes = unsafe { std::slice::from_raw_parts(list.ptr, list.len) };
                for i in 0..nranges {
                    let Some(range) = bytes
                        .get(i * DsmRange::WIRE_SIZE..)
                        .and_then(DsmRange::parse)
                    else {
                        return status_field(0, SC_INVALID_OPCODE, 0);
                    };
                    if !self.range_ok(range.slba, range.nlb) {
                        return status_field(0, SC_LBA_OUT_OF_RANGE, 0);
                    }
                    // Deallocated blocks read back zeroes on this device.
                    let start = range.slba as usize * SECTOR_SIZE;
                    self.disk[start..start + range.nlb as usize * SECTOR_SIZE].fill(0);
                }
                0
            }
            _ => status_field(0, SC_INVALID_OPCODE, 0),
        }
    }
}

fn dma_slice(data: Option<DmaRegion>, nlb: u32) -> Option<&'static [u8]> {
    let region = data?;
    let need = nlb as usize * SECTOR_SIZE;
    if region.len < need {
        return None;
    }
    // SAFETY: caller contract on DmaRegion; used only within this
    // submission, despite the 'static spelling.
    Some(unsafe { std::slice::from_raw_parts(region.ptr, need) })
}

fn dma_slice_mut(data: Option<DmaRegion>, nlb: u32) -> Option<&'static mut [u8]> {
    let region = data?;
    let need = nlb as usize * SECTOR_SIZE;
    if region.len < need {
        return None;
    }
    // SAFETY: as above, plus the qpair's single-threaded discipline means
    // nothing else aliases the buffer during the submission.
    Some(unsafe { std::slice::from_raw_parts_mut(region.ptr, need) })
}

impl Transport for MemCtrlr {
    fn ns_sectors(&self) -> u64 {
        self.sectors
    }

    fn max_transfer_bytes(&self) -> usize {
        self.max_transfer
    }

    fn create_io_qpair(&mut self) -> Result<u16, TransportError> {
        for qid in 1..QPAIR_SLOTS {
            if !self.qpair_live[qid] {
                self.qpair_live[qid] = true;
                return Ok(qid as u16);
            }
        }
        Err(TransportError::QpairExhausted)
    }

    fn delete_io_qpair(&mut self, qid: u16) -> Result<(), TransportError> {
        if qid == 0 {
            return Err(TransportError::NoSuchQpair { qid });
        }
        self.check_qpair(qid)?;
        self.qpair_live[usize::from(qid)] = false;
        self.pending[usize::from(qid)].clear();
        Ok(())
    }

    fn submit(
        &mut self,
        qid: u16,
        cmd: &NvmeCommand,
        data: Option<DmaRegion>,
    ) -> Result<(), TransportError> {
        self.check_qpair(qid)?;
        if let Some(status) = self.inject.pop_front() {
            self.complete(qid, cmd.cid, 0, status);
            return Ok(());
        }
        let status = if qid == 0 {
            // Admin commands all succeed on the loopback controller.
            0
        } else {
            self.execute_io(cmd, data)
        };
        self.complete(qid, cmd.cid, 0, status);
        Ok(())
    }

    fn poll(&mut self, qid: u16, max: usize, out: &mut Vec<NvmeCompletion>) -> usize {
        let queue = &mut self.pending[usize::from(qid)];
        let n = queue.len().min(max);
        out.extend(queue.drain(..n));
        n
    }
}
