//! Model-based property: for any sequence of aligned writes, trims, and
//! reads, every read completion passes verification.

use std::cell::RefCell;
use std::rc::Rc;

use proptest::prelude::*;

use nvq_driver::cmd::{io_opc, DsmRange};
use nvq_driver::{
    Ctrlr, CtrlrOpts, DriverConfig, IoBuffer, MemCtrlr, NvmeCompletion, SECTOR_SIZE,
};

const NS_SECTORS: u64 = 256;
const MAX_OPS: usize = 24;

#[derive(Clone, Debug)]
enum Op {
    Write { lba: u64, count: u32 },
    Read { lba: u64, count: u32 },
    Trim { lba: u64, count: u32 },
}

fn extent_strategy() -> impl Strategy<Value = (u64, u32)> {
    // Bias towards small extents but cover up to 8 blocks anywhere that
    // fits inside the namespace.
    (1u32..=8).prop_flat_map(|count| {
        (0..NS_SECTORS - u64::from(count)).prop_map(move |lba| (lba, count))
    })
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => extent_strategy().prop_map(|(lba, count)| Op::Write { lba, count }),
        3 => extent_strategy().prop_map(|(lba, count)| Op::Read { lba, count }),
        1 => extent_strategy().prop_map(|(lba, count)| Op::Trim { lba, count }),
    ]
}

fn record_into(seen: &Rc<RefCell<Option<NvmeCompletion>>>) -> nvq_driver::IoCallback {
    let inner = Rc::clone(seen);
    Box::new(move |cpl: &NvmeCompletion| {
        *inner.borrow_mut() = Some(*cpl);
    })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        .. ProptestConfig::default()
    })]

    #[test]
    fn reads_always_verify(ops in prop::collection::vec(op_strategy(), 1..=MAX_OPS)) {
        let dir = tempfile::tempdir().unwrap();
        let opts = CtrlrOpts {
            shm_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let mut ctrlr = Ctrlr::init(MemCtrlr::new(NS_SECTORS), opts).unwrap();
        ctrlr.configure(DriverConfig::VERIFY_READ);
        let qid = ctrlr.create_io_qpair().unwrap();

        let mut buf = IoBuffer::new(8 * SECTOR_SIZE).unwrap();
        let seen = Rc::new(RefCell::new(None));

        for op in &ops {
            match *op {
                Op::Write { lba, count } => {
                    let cb = record_into(&seen);
                    ctrlr
                        .submit_rw(qid, false, &mut buf, count as usize * SECTOR_SIZE, lba, count, 0, Some(cb))
                        .unwrap();
                    ctrlr.process_completions(qid, 16);
                    let cpl = seen.borrow_mut().take().expect("write completed");
                    prop_assert!(!cpl.is_error(), "write {lba}+{count} failed: {:#x}", cpl.status);
                }
                Op::Read { lba, count } => {
                    let cb = record_into(&seen);
                    ctrlr
                        .submit_rw(qid, true, &mut buf, count as usize * SECTOR_SIZE, lba, count, 0, Some(cb))
                        .unwrap();
                    ctrlr.process_completions(qid, 16);
                    let cpl = seen.borrow_mut().take().expect("read completed");
                    prop_assert!(!cpl.is_error(), "read {lba}+{count} failed: {:#x}", cpl.status);
                }
                Op::Trim { lba, count } => {
                    let mut ranges = IoBuffer::new(SECTOR_SIZE).unwrap();
                    DsmRange { cattr: 0, nlb: count, slba: lba }
                        .write_to(&mut ranges.as_mut_slice()[..DsmRange::WIRE_SIZE]);
                    ctrlr
                        .submit_raw(
                            qid,
                            io_opc::DATASET_MANAGEMENT,
                            1,
                            Some((&mut ranges, DsmRange::WIRE_SIZE)),
                            0,
                            1 << 2, // deallocate
                            0,
                            0,
                            0,
                            0,
                            None,
                        )
                        .unwrap();
                    ctrlr.process_completions(qid, 16);
                }
            }
        }

        // Sweep the whole namespace; everything must still verify.
        for lba in (0..NS_SECTORS).step_by(8) {
            let count = 8.min(NS_SECTORS - lba) as u32;
            let cb = record_into(&seen);
            ctrlr
                .submit_rw(qid, true, &mut buf, count as usize * SECTOR_SIZE, lba, count, 0, Some(cb))
                .unwrap();
            ctrlr.process_completions(qid, 16);
            let cpl = seen.borrow_mut().take().expect("sweep read completed");
            prop_assert!(!cpl.is_error(), "sweep read at {lba} failed: {:#x}", cpl.status);
        }
    }
}
