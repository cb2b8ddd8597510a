//! Closed-loop synthetic workload generator bound to one qpair.
//!
//! A worker keeps `qdepth` I/O contexts in flight, each owning its own
//! buffer; every completion funds the next submission until the termination
//! predicate fires, then in-flight commands are drained. Read/write mix,
//! LBA distribution, address-space region, IOPS throttle, and time/count
//! bounds are all per-run arguments.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

use crate::buffer::{BufferError, IoBuffer};
use crate::cmd::NvmeCompletion;
use crate::cmdlog::CMD_LOG_DEPTH;
use crate::ctrlr::{Ctrlr, DriverError};
use crate::transport::Transport;
use crate::SECTOR_SIZE;

/// Latency histogram length: one bucket per microsecond up to a second.
pub const US_PER_S: usize = 1_000_000;

/// Unbounded runs are still cut off after a day.
const MAX_SECONDS: u64 = 24 * 60 * 60;

/// Grace period past the time bound before the run is declared stuck.
const DRAIN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct IoWorkerArgs {
    /// First LBA to issue (sequential mode); clamped into the region.
    pub lba_start: u64,
    /// Blocks per I/O.
    pub lba_size: u32,
    /// Alignment of every issued LBA, in blocks.
    pub lba_align: u64,
    /// Random (true) or sequential (false) LBA selection.
    pub lba_random: bool,
    /// Address-space region the worker stays inside, in blocks.
    pub region_start: u64,
    pub region_end: u64,
    /// 0 = all writes, 100 = all reads.
    pub read_percentage: u32,
    /// Open-loop rate limit; 0 = unthrottled.
    pub iops: u32,
    /// Stop after this many I/Os; 0 = unbounded.
    pub io_count: u64,
    /// Stop after this many seconds; 0 = unbounded (capped at 24 h).
    pub seconds: u32,
    /// Outstanding I/Os to maintain; at most half the command-log depth.
    pub qdepth: u32,
    /// Collect the per-second submission counter array.
    pub io_per_second: bool,
    /// Collect the per-microsecond latency histogram.
    pub io_per_latency: bool,
}

impl Default for IoWorkerArgs {
    fn default() -> Self {
        Self {
            lba_start: 0,
            lba_size: 8,
            lba_align: 8,
            lba_random: true,
            region_start: 0,
            region_end: u64::MAX,
            read_percentage: 50,
            iops: 0,
            io_count: 0,
            seconds: 10,
            qdepth: 64,
            io_per_second: false,
            io_per_latency: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IoWorkerRets {
    pub io_count_read: u64,
    pub io_count_write: u64,
    pub latency_max_us: u32,
    pub mseconds: u32,
    /// First non-zero NVMe status observed, as the 11-bit composite;
    /// 0 if the run was clean.
    pub error: u16,
    /// Per-second I/O counts, present when requested.
    pub io_per_second: Vec<u64>,
    /// Per-microsecond latency buckets, present when requested.
    pub io_per_latency: Vec<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum IoWorkerError {
    #[error("transfer of {bytes} bytes exceeds the controller limit of {max}")]
    OversizeTransfer { bytes: usize, max: usize },
    #[error("invalid worker arguments: {reason}")]
    InvalidArgs { reason: &'static str },
    #[error("wall clock ceiling exceeded with {outstanding} i/o outstanding")]
    DeadlineExceeded {
        outstanding: u64,
        rets: Box<IoWorkerRets>,
    },
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Normalized LBA-space parameters for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
    region_start: u64,
    region_end: u64,
    align: u64,
}

fn align_down(lba: u64, align: u64) -> u64 {
    lba / align * align
}

fn align_up(lba: u64, align: u64) -> u64 {
    lba.div_ceil(align) * align
}

fn normalize(args: &IoWorkerArgs, nsze: u64) -> Result<Geometry, IoWorkerError> {
    if args.read_percentage > 100 {
        return Err(IoWorkerError::InvalidArgs {
            reason: "read_percentage over 100",
        });
    }
    if args.qdepth == 0 || args.qdepth as usize > CMD_LOG_DEPTH / 2 {
        return Err(IoWorkerError::InvalidArgs {
            reason: "qdepth must be in 1..=CMD_LOG_DEPTH/2",
        });
    }
    if args.lba_size == 0 {
        return Err(IoWorkerError::InvalidArgs {
            reason: "lba_size must be non-zero",
        });
    }
    let align = args.lba_align.max(1);
    let end = args
        .region_end
        .min(nsze)
        .saturating_sub(u64::from(args.lba_size) + 1);
    let region_end = align_down(end, align);
    let region_start = align_up(args.region_start, align);
    if region_start >= region_end {
        return Err(IoWorkerError::InvalidArgs {
            reason: "empty region after alignment",
        });
    }
    Ok(Geometry {
        region_start,
        region_end,
        align,
    })
}

/// Mutable worker state shared between the drive loop and the per-I/O
/// completion callbacks.
#[derive(Default)]
struct WorkerState {
    sent: u64,
    completed: u64,
    reads: u64,
    writes: u64,
    latency_max_us: u32,
    error: u16,
    finish: bool,
    latency_buckets: Option<Vec<u32>>,
    /// Context indices whose completion arrived and may be reused.
    reusable: Vec<usize>,
}

struct Pacing {
    gap: Option<Duration>,
    io_due: Instant,
}

impl Pacing {
    fn new(start: Instant, iops: u32) -> Self {
        let gap = (iops > 0).then(|| Duration::from_micros(US_PER_S as u64 / u64::from(iops)));
        Self {
            gap,
            io_due: start + gap.unwrap_or_default(),
        }
    }

    /// Open-loop throttle: sleep until the next submission is due.
    fn wait(&mut self) {
        let Some(gap) = self.gap else { return };
        let now = Instant::now();
        if self.io_due > now {
            std::thread::sleep(self.io_due - now);
        }
        self.io_due += gap;
    }
}

/// Runs one synthetic workload to completion on `qid`.
///
/// Device-reported errors do not fail the run; the first is latched into
/// `rets.error`, no further I/Os start, and in-flight ones are drained.
/// Only argument errors and a blown wall-clock ceiling return `Err`.
pub fn run_ioworker<T: Transport>(
    ctrlr: &mut Ctrlr<T>,
    qid: u16,
    args: &IoWorkerArgs,
) -> Result<IoWorkerRets, IoWorkerError> {
    let xfer = args.lba_size as usize * SECTOR_SIZE;
    if xfer > ctrlr.max_transfer_bytes() {
        return Err(IoWorkerError::OversizeTransfer {
            bytes: xfer,
            max: ctrlr.max_transfer_bytes(),
        });
    }
    let geometry = normalize(args, ctrlr.nsze())?;

    let mut qdepth = u64::from(args.qdepth);
    if args.io_count != 0 {
        qdepth = qdepth.min(args.io_count);
    }
    let mut cursor = args
        .lba_start
        .clamp(geometry.region_start, geometry.region_end);

    let start = Instant::now();
    let bound_secs = if args.seconds == 0 {
        MAX_SECONDS
    } else {
        u64::from(args.seconds).min(MAX_SECONDS)
    };
    let due_time = start + Duration::from_secs(bound_secs);
    let ceiling = due_time + DRAIN_GRACE;
    let mut pacing = Pacing::new(start, args.iops);

    let mut per_second: Vec<u64> = Vec::new();
    let mut next_second = start + Duration::from_secs(1);
    let mut total_at_boundary = 0u64;

    let mut contexts: Vec<IoBuffer> = (0..qdepth)
        .map(|_| IoBuffer::new(xfer))
        .collect::<Result<_, _>>()?;

    let state = Rc::new(RefCell::new(WorkerState {
        latency_buckets: args.io_per_latency.then(|| vec![0u32; US_PER_S]),
        ..Default::default()
    }));

    debug!(qid, ?geometry, qdepth, "ioworker starting");

    // Prime the pipeline, one I/O per context.
    for idx in 0..qdepth as usize {
        pacing.wait();
        issue_one(ctrlr, qid, args, geometry, &mut cursor, &state, &mut contexts, idx)?;
    }

    loop {
        let (sent, completed, finish) = {
            let s = state.borrow();
            (s.sent, s.completed, s.finish)
        };
        if finish && sent == completed {
            break;
        }
        if Instant::now() > ceiling {
            let rets = collect_rets(&state, start, per_second);
            return Err(IoWorkerError::DeadlineExceeded {
                outstanding: sent - completed,
                rets: Box::new(rets),
            });
        }

        ctrlr.process_completions(qid, qdepth as usize);

        // Per-second rollover, recorded at each boundary crossing.
        let now = Instant::now();
        while args.io_per_second && now >= next_second && (per_second.len() as u64) < bound_secs {
            let s = state.borrow();
            let total = s.reads + s.writes;
            drop(s);
            per_second.push(total - total_at_boundary);
            total_at_boundary = total;
            next_second += Duration::from_secs(1);
        }

        let reusable = std::mem::take(&mut state.borrow_mut().reusable);
        for idx in reusable {
            let mut s = state.borrow_mut();
            if !s.finish {
                let count_done = args.io_count != 0 && s.sent >= args.io_count;
                if count_done || Instant::now() > due_time {
                    s.finish = true;
                }
            }
            let finish = s.finish;
            drop(s);
            if !finish {
                pacing.wait();
                issue_one(ctrlr, qid, args, geometry, &mut cursor, &state, &mut contexts, idx)?;
            }
        }
    }

    // Completions that landed after the last boundary still belong in the
    // per-second counters.
    if args.io_per_second {
        let s = state.borrow();
        let leftover = (s.reads + s.writes) - total_at_boundary;
        drop(s);
        if leftover > 0 {
            if (per_second.len() as u64) < bound_secs {
                per_second.push(leftover);
            } else if let Some(last) = per_second.last_mut() {
                *last += leftover;
            }
        }
    }

    let rets = collect_rets(&state, start, per_second);
    debug!(
        reads = rets.io_count_read,
        writes = rets.io_count_write,
        error = rets.error,
        "ioworker finished"
    );
    Ok(rets)
}

fn collect_rets(
    state: &Rc<RefCell<WorkerState>>,
    start: Instant,
    per_second: Vec<u64>,
) -> IoWorkerRets {
    let mut s = state.borrow_mut();
    IoWorkerRets {
        io_count_read: s.reads,
        io_count_write: s.writes,
        latency_max_us: s.latency_max_us,
        mseconds: start.elapsed().as_millis() as u32,
        error: s.error,
        io_per_second: per_second,
        io_per_latency: s.latency_buckets.take().unwrap_or_default(),
    }
}

/// Picks the next LBA and direction, then submits one I/O on `contexts[idx]`.
#[allow(clippy::too_many_arguments)]
fn issue_one<T: Transport>(
    ctrlr: &mut Ctrlr<T>,
    qid: u16,
    args: &IoWorkerArgs,
    geometry: Geometry,
    cursor: &mut u64,
    state: &Rc<RefCell<WorkerState>>,
    contexts: &mut [IoBuffer],
    idx: usize,
) -> Result<(), IoWorkerError> {
    let span = geometry.region_end - geometry.region_start;
    let (is_read, lba) = {
        let rng = ctrlr.rng_mut();
        let is_read = rng.gen_range(0..100u32) < args.read_percentage;
        let lba = if args.lba_random {
            align_down(geometry.region_start + rng.gen_range(0..span), geometry.align)
        } else {
            let lba = align_down(*cursor, geometry.align);
            *cursor += geometry.align;
            if *cursor > geometry.region_end {
                *cursor = geometry.region_start;
            }
            lba
        };
        (is_read, lba)
    };

    let shared = Rc::clone(state);
    let callback = Box::new(move |cpl: &NvmeCompletion| {
        let mut s = shared.borrow_mut();
        let latency = cpl.latency_us();
        if latency > s.latency_max_us {
            s.latency_max_us = latency;
        }
        if let Some(buckets) = s.latency_buckets.as_mut() {
            buckets[latency.min(US_PER_S as u32 - 1) as usize] += 1;
        }
        if is_read {
            s.reads += 1;
        } else {
            s.writes += 1;
        }
        s.completed += 1;
        if cpl.is_error() {
            if s.error == 0 {
                s.error = cpl.composite_status();
            }
            s.finish = true;
        }
        s.reusable.push(idx);
    });

    let len = args.lba_size as usize * SECTOR_SIZE;
    ctrlr.submit_rw(
        qid,
        is_read,
        &mut contexts[idx],
        len,
        lba,
        args.lba_size,
        0,
        Some(callback),
    )?;
    state.borrow_mut().sent += 1;
    Ok(())
}
