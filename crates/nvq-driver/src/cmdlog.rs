//! Per-qpair command/completion log rings.
//!
//! Each qpair owns a fixed ring of [`CMD_LOG_DEPTH`] entries in the
//! `driver_cmdlog_table` region, written round-robin by the owning thread.
//! The ring depth exceeds the maximum outstanding command count, so a slot
//! is never reused while its command is still in flight; the slot index
//! doubles as the command identifier. Readers (dump, RPC) observe the tail
//! with acquire semantics and walk backward, copying entries; torn reads of
//! in-flight slots are tolerated because only completed entries are shown.

use std::sync::atomic::{AtomicU32, Ordering};

use nvq_shmem::Region;

use crate::cmd::{NvmeCommand, NvmeCompletion};

/// Ring depth per qpair. Must exceed the device's maximum outstanding
/// command count. Shared-layout-defining; do not change without resizing
/// the `driver_cmdlog_table` region.
pub const CMD_LOG_DEPTH: usize = 2048;

/// Tail sentinel for a qpair whose log is cleared / not in use.
pub const CMD_LOG_CLEARED: u32 = CMD_LOG_DEPTH as u32;

/// Hard cap on qpairs per controller, admin qpair (id 0) included.
pub const MAX_QPAIRS: usize = 16;

/// User completion callback, fired by the trampoline after post-processing.
pub type IoCallback = Box<dyn FnOnce(&NvmeCompletion)>;

/// One log slot: the submitted command, its completion, wall-clock
/// timestamps, and the verification context the trampoline needs.
#[repr(C, align(128))]
#[derive(Clone, Copy, Debug, Default)]
pub struct CmdLogEntry {
    pub cmd: NvmeCommand,
    pub cpl: NvmeCompletion,
    /// Microseconds since driver init at submission.
    pub t_cmd_us: u64,
    /// Microseconds since driver init at completion; 0 while in flight.
    pub t_cpl_us: u64,
    /// Borrowed I/O buffer address, meaningful only in the owning process.
    pub buf: u64,
    pub buf_len: u32,
    pub lba_count: u32,
    pub lba: u64,
    /// Non-zero if the trampoline should verify the read payload.
    pub verify_read: u8,
}

#[repr(C)]
struct QpairLog {
    tail: u32,
    _pad: [u32; 31],
    entries: [CmdLogEntry; CMD_LOG_DEPTH],
}

/// Handle over the shared log region plus the process-local callback table.
///
/// Callbacks are closures and cannot live in shared memory; they are kept
/// per-slot on the side, in the process that submitted the command.
pub struct CmdLog {
    region: Region,
    callbacks: Vec<Vec<Option<IoCallback>>>,
    appended: [u64; MAX_QPAIRS],
}

impl CmdLog {
    /// Size of the `driver_cmdlog_table` region.
    pub fn region_len() -> usize {
        MAX_QPAIRS * std::mem::size_of::<QpairLog>()
    }

    pub(crate) fn new(region: Region) -> Self {
        debug_assert!(region.len() >= Self::region_len());
        let callbacks = (0..MAX_QPAIRS).map(|_| Vec::new()).collect();
        Self {
            region,
            callbacks,
            appended: [0; MAX_QPAIRS],
        }
    }

    fn qlog(&self, qid: usize) -> *mut QpairLog {
        assert!(qid < MAX_QPAIRS, "qpair id {qid} out of range");
        // SAFETY: qid is bounded and the region covers MAX_QPAIRS blocks.
        unsafe { self.region.base_ptr().cast::<QpairLog>().add(qid) }
    }

    fn tail_cell(&self, qid: usize) -> &AtomicU32 {
        // SAFETY: the tail word is the 4-aligned first field of the block.
        unsafe { AtomicU32::from_ptr(std::ptr::addr_of_mut!((*self.qlog(qid)).tail)) }
    }

    /// Seeds every tail with the cleared sentinel. Primary-init only: a
    /// fresh zero-filled region would otherwise read as sixteen active
    /// qpairs with tail 0.
    pub(crate) fn reset_all(&mut self) {
        for qid in 0..MAX_QPAIRS {
            self.tail_cell(qid).store(CMD_LOG_CLEARED, Ordering::Release);
        }
    }

    /// Marks the qpair's log in use, tail at slot 0.
    pub fn init_qpair(&mut self, qid: usize) {
        self.tail_cell(qid).store(0, Ordering::Release);
        self.callbacks[qid] = std::iter::repeat_with(|| None).take(CMD_LOG_DEPTH).collect();
        self.appended[qid] = 0;
    }

    /// Clears the qpair's log (tail = sentinel). The entries remain in
    /// memory for post-mortem reads but the qpair counts as inactive.
    pub fn clear_qpair(&mut self, qid: usize) {
        self.tail_cell(qid).store(CMD_LOG_CLEARED, Ordering::Release);
        self.callbacks[qid].clear();
    }

    pub fn is_active(&self, qid: usize) -> bool {
        self.tail(qid) != CMD_LOG_CLEARED
    }

    pub fn tail(&self, qid: usize) -> u32 {
        self.tail_cell(qid).load(Ordering::Acquire)
    }

    /// Total commands ever appended to this qpair's log by this process.
    pub fn appended(&self, qid: usize) -> u64 {
        self.appended[qid]
    }

    /// Writes `entry` at the tail slot, stamping its command id with the
    /// slot index, and advances the tail. Returns the slot index; the caller
    /// submits the command with `cid == slot` so the completion can be
    /// routed back here in O(1).
    pub(crate) fn append(
        &mut self,
        qid: usize,
        mut entry: CmdLogEntry,
        callback: Option<IoCallback>,
    ) -> u16 {
        let tail = self.tail(qid);
        assert!(
            tail != CMD_LOG_CLEARED,
            "append to cleared qpair {qid} log"
        );
        let slot = tail as usize;
        entry.cmd.cid = slot as u16;
        // SAFETY: single-writer ring; only the owning thread reaches here.
        unsafe { (*self.qlog(qid)).entries[slot] = entry };
        if self.callbacks[qid].len() != CMD_LOG_DEPTH {
            // Secondary attach: the ring was initialized by another process,
            // but callbacks are per-process.
            self.callbacks[qid] = std::iter::repeat_with(|| None).take(CMD_LOG_DEPTH).collect();
        }
        self.callbacks[qid][slot] = callback;
        self.appended[qid] += 1;
        self.tail_cell(qid)
            .store(((slot + 1) % CMD_LOG_DEPTH) as u32, Ordering::Release);
        slot as u16
    }

    /// Copy of one slot.
    pub fn entry(&self, qid: usize, slot: usize) -> CmdLogEntry {
        assert!(slot < CMD_LOG_DEPTH);
        // SAFETY: slot is bounded; reads may be torn for in-flight slots,
        // which callers tolerate by looking only at completed entries.
        unsafe { (*self.qlog(qid)).entries[slot] }
    }

    /// Applies a mutation to one slot; completion-side use only.
    pub(crate) fn update(&mut self, qid: usize, slot: usize, f: impl FnOnce(&mut CmdLogEntry)) {
        assert!(slot < CMD_LOG_DEPTH);
        // SAFETY: exclusive access through &mut self.
        f(unsafe { &mut (*self.qlog(qid)).entries[slot] });
    }

    pub(crate) fn take_callback(&mut self, qid: usize, slot: usize) -> Option<IoCallback> {
        self.callbacks[qid].get_mut(slot).and_then(Option::take)
    }

    /// The most recent `count` entries, newest first, walking backward from
    /// the tail. `count == 0` requests the whole ring; at most
    /// `CMD_LOG_DEPTH - 1` entries are returned, fewer if the qpair has not
    /// yet filled them.
    pub fn dump(&self, qid: usize, count: usize) -> Vec<CmdLogEntry> {
        let tail = self.tail(qid);
        if tail == CMD_LOG_CLEARED {
            return Vec::new();
        }
        let want = if count == 0 { CMD_LOG_DEPTH - 1 } else { count };
        let available = self.appended[qid].min((CMD_LOG_DEPTH - 1) as u64) as usize;
        let n = want.min(available);
        let mut out = Vec::with_capacity(n);
        let mut slot = tail as usize;
        for _ in 0..n {
            slot = (slot + CMD_LOG_DEPTH - 1) % CMD_LOG_DEPTH;
            out.push(self.entry(qid, slot));
        }
        out
    }
}
