use nvq_driver::cmd::io_opc;
use nvq_driver::{
    Ctrlr, CtrlrOpts, DriverError, IoBuffer, MemCtrlr, CMD_LOG_DEPTH, MAX_QPAIRS, SECTOR_SIZE,
};
use nvq_driver::cmdlog::CMD_LOG_CLEARED;

fn new_ctrlr(sectors: u64) -> (Ctrlr<MemCtrlr>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let opts = CtrlrOpts {
        shm_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    (Ctrlr::init(MemCtrlr::new(sectors), opts).unwrap(), dir)
}

#[test]
fn ring_wraps_and_dump_returns_most_recent() {
    let (mut ctrlr, _dir) = new_ctrlr(256);
    let qid = ctrlr.create_io_qpair().unwrap();

    const SUBMISSIONS: usize = 3000;
    for _ in 0..SUBMISSIONS {
        ctrlr
            .submit_raw(qid, io_opc::FLUSH, 1, None, 0, 0, 0, 0, 0, 0, None)
            .unwrap();
        ctrlr.process_completions(qid, 16);
    }

    let tail = ctrlr.cmdlog().tail(usize::from(qid));
    assert_eq!(tail as usize, SUBMISSIONS % CMD_LOG_DEPTH);

    let dumped = ctrlr.cmdlog().dump(usize::from(qid), 0);
    assert_eq!(dumped.len(), CMD_LOG_DEPTH - 1);
    // Newest first, cids walking backward through the ring.
    assert_eq!(
        usize::from(dumped[0].cmd.cid),
        (SUBMISSIONS - 1) % CMD_LOG_DEPTH
    );
    assert_eq!(
        usize::from(dumped[1].cmd.cid),
        (SUBMISSIONS - 2) % CMD_LOG_DEPTH
    );
}

#[test]
fn completed_entries_carry_consistent_latency() {
    let (mut ctrlr, _dir) = new_ctrlr(256);
    let qid = ctrlr.create_io_qpair().unwrap();

    let mut buf = IoBuffer::new(SECTOR_SIZE).unwrap();
    for lba in 0..32u64 {
        ctrlr
            .submit_rw(qid, false, &mut buf, SECTOR_SIZE, lba, 1, 0, None)
            .unwrap();
        ctrlr.process_completions(qid, 16);
    }

    for entry in ctrlr.cmdlog().dump(usize::from(qid), 32) {
        assert!(entry.t_cpl_us >= entry.t_cmd_us);
        assert_eq!(
            u64::from(entry.cpl.cdw2),
            entry.t_cpl_us - entry.t_cmd_us,
            "dword 2 must be the host-measured latency"
        );
    }
}

#[test]
fn dump_on_fresh_qpair_is_bounded_by_history() {
    let (mut ctrlr, _dir) = new_ctrlr(256);
    let qid = ctrlr.create_io_qpair().unwrap();

    assert!(ctrlr.cmdlog().dump(usize::from(qid), 0).is_empty());

    for _ in 0..5 {
        ctrlr
            .submit_raw(qid, io_opc::FLUSH, 1, None, 0, 0, 0, 0, 0, 0, None)
            .unwrap();
    }
    ctrlr.process_completions(qid, 16);
    assert_eq!(ctrlr.cmdlog().dump(usize::from(qid), 0).len(), 5);
    assert_eq!(ctrlr.cmdlog().dump(usize::from(qid), 3).len(), 3);
}

#[test]
fn freed_qpair_reads_as_cleared() {
    let (mut ctrlr, _dir) = new_ctrlr(256);
    let qid = ctrlr.create_io_qpair().unwrap();
    assert!(ctrlr.cmdlog().is_active(usize::from(qid)));

    ctrlr.free_io_qpair(qid).unwrap();
    assert!(!ctrlr.cmdlog().is_active(usize::from(qid)));
    assert_eq!(ctrlr.cmdlog().tail(usize::from(qid)), CMD_LOG_CLEARED);
    assert!(ctrlr.cmdlog().dump(usize::from(qid), 0).is_empty());

    // Submitting to a cleared qpair is rejected at the driver layer.
    let err = ctrlr.submit_raw(qid, io_opc::FLUSH, 1, None, 0, 0, 0, 0, 0, 0, None);
    assert!(matches!(err, Err(DriverError::InactiveQpair { .. })));
}

#[test]
fn qpair_ids_are_capped() {
    let (mut ctrlr, _dir) = new_ctrlr(256);

    // Ids 1..MAX_QPAIRS come up fine; the next one is rejected even though
    // the transport still has queues to hand out.
    let mut created = Vec::new();
    for _ in 1..MAX_QPAIRS {
        created.push(ctrlr.create_io_qpair().unwrap());
    }
    assert_eq!(created.len(), MAX_QPAIRS - 1);
    let err = ctrlr.create_io_qpair();
    assert!(matches!(err, Err(DriverError::QpairLimit { .. })));
}
