use std::cell::RefCell;
use std::rc::Rc;

use nvq_driver::cmd::io_opc;
use nvq_driver::{
    Ctrlr, CtrlrOpts, DriverConfig, IoBuffer, MemCtrlr, NvmeCompletion, SECTOR_SIZE,
};

fn new_ctrlr(sectors: u64) -> (Ctrlr<MemCtrlr>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let opts = CtrlrOpts {
        shm_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    (Ctrlr::init(MemCtrlr::new(sectors), opts).unwrap(), dir)
}

fn capture() -> (Rc<RefCell<Option<NvmeCompletion>>>, nvq_driver::IoCallback) {
    let seen = Rc::new(RefCell::new(None));
    let inner = Rc::clone(&seen);
    let cb = Box::new(move |cpl: &NvmeCompletion| {
        *inner.borrow_mut() = Some(*cpl);
    });
    (seen, cb)
}

#[test]
fn write_then_read_passes_verification() {
    let (mut ctrlr, _dir) = new_ctrlr(1024);
    ctrlr.configure(DriverConfig::VERIFY_READ);
    let qid = ctrlr.create_io_qpair().unwrap();

    let mut wbuf = IoBuffer::new(SECTOR_SIZE).unwrap();
    wbuf.fill(0x5A);
    let (wrote, cb) = capture();
    ctrlr
        .submit_rw(qid, false, &mut wbuf, SECTOR_SIZE, 0, 1, 0, Some(cb))
        .unwrap();
    ctrlr.process_completions(qid, 16);
    let wcpl = wrote.borrow().expect("write completed");
    assert!(!wcpl.is_error());

    // The stamped payload is self-describing: LBA up front, token at the end.
    assert_eq!(&wbuf.as_slice()[..8], &0u64.to_le_bytes());
    // Caller bytes between the stamps are untouched.
    assert!(wbuf.as_slice()[8..SECTOR_SIZE - 8].iter().all(|&b| b == 0x5A));

    let mut rbuf = IoBuffer::new(SECTOR_SIZE).unwrap();
    let (read, cb) = capture();
    ctrlr
        .submit_rw(qid, true, &mut rbuf, SECTOR_SIZE, 0, 1, 0, Some(cb))
        .unwrap();
    ctrlr.process_completions(qid, 16);
    let rcpl = read.borrow().expect("read completed");
    assert!(!rcpl.is_error());
    assert_eq!(rbuf.as_slice(), wbuf.as_slice());

    // Completion dword 2 is the host-measured latency, consistent with the
    // log's timestamps (write was slot 0, read slot 1).
    let entry = ctrlr.cmdlog().entry(usize::from(qid), 1);
    assert!(entry.t_cpl_us >= entry.t_cmd_us);
    assert_eq!(
        u64::from(rcpl.latency_us()),
        entry.t_cpl_us - entry.t_cmd_us
    );
    assert_eq!(entry.cpl.cdw2, rcpl.cdw2);
}

#[test]
fn corrupted_media_reads_back_as_injected_media_error() {
    let (mut ctrlr, _dir) = new_ctrlr(1024);
    ctrlr.configure(DriverConfig::VERIFY_READ);
    let qid = ctrlr.create_io_qpair().unwrap();

    let mut wbuf = IoBuffer::new(SECTOR_SIZE).unwrap();
    ctrlr
        .submit_rw(qid, false, &mut wbuf, SECTOR_SIZE, 7, 1, 0, None)
        .unwrap();
    ctrlr.process_completions(qid, 16);

    // Rewrite the block through the raw bypass with a bad token, leaving
    // the checksum table untouched.
    let mut corrupt = IoBuffer::new(SECTOR_SIZE).unwrap();
    corrupt.as_mut_slice().copy_from_slice(wbuf.as_slice());
    let tail = SECTOR_SIZE - 8;
    corrupt.as_mut_slice()[tail..].copy_from_slice(&u64::MAX.to_le_bytes());
    ctrlr
        .submit_raw(
            qid,
            io_opc::WRITE,
            1,
            Some((&mut corrupt, SECTOR_SIZE)),
            7,
            0,
            0, // one block, 0-based
            0,
            0,
            0,
            None,
        )
        .unwrap();
    ctrlr.process_completions(qid, 16);

    // The device reports success; the driver forges the media error.
    let mut rbuf = IoBuffer::new(SECTOR_SIZE).unwrap();
    let (read, cb) = capture();
    ctrlr
        .submit_rw(qid, true, &mut rbuf, SECTOR_SIZE, 7, 1, 0, Some(cb))
        .unwrap();
    ctrlr.process_completions(qid, 16);
    let cpl = read.borrow().expect("read completed");
    assert!(cpl.is_error());
    assert_eq!(cpl.sct(), 0x02);
    assert_eq!(cpl.sc(), 0x81);

    // The forged status also lands in the log.
    let entry = ctrlr.cmdlog().entry(usize::from(qid), 2);
    assert_eq!(entry.cpl.sct(), 0x02);
    assert_eq!(entry.cpl.sc(), 0x81);
}

#[test]
fn uncorrectable_marking_fails_any_intersecting_read() {
    let (mut ctrlr, _dir) = new_ctrlr(1024);
    ctrlr.configure(DriverConfig::VERIFY_READ);
    let qid = ctrlr.create_io_qpair().unwrap();

    let mut wbuf = IoBuffer::new(4 * SECTOR_SIZE).unwrap();
    ctrlr
        .submit_rw(qid, false, &mut wbuf, 4 * SECTOR_SIZE, 100, 4, 0, None)
        .unwrap();
    ctrlr.process_completions(qid, 16);

    ctrlr.crc_table().mark_uncorrectable(101, 1);

    let mut rbuf = IoBuffer::new(4 * SECTOR_SIZE).unwrap();
    let (read, cb) = capture();
    ctrlr
        .submit_rw(qid, true, &mut rbuf, 4 * SECTOR_SIZE, 100, 4, 0, Some(cb))
        .unwrap();
    ctrlr.process_completions(qid, 16);
    let cpl = read.borrow().expect("read completed");
    assert_eq!(cpl.sct(), 0x02);
    assert_eq!(cpl.sc(), 0x81);
}

#[test]
fn verification_is_opt_in_via_config_word() {
    let (mut ctrlr, _dir) = new_ctrlr(1024);
    // VERIFY_READ left unset.
    let qid = ctrlr.create_io_qpair().unwrap();

    let mut wbuf = IoBuffer::new(SECTOR_SIZE).unwrap();
    ctrlr
        .submit_rw(qid, false, &mut wbuf, SECTOR_SIZE, 3, 1, 0, None)
        .unwrap();
    ctrlr.process_completions(qid, 16);

    let mut junk = IoBuffer::new(SECTOR_SIZE).unwrap();
    junk.fill(0xEE);
    ctrlr
        .submit_raw(
            qid,
            io_opc::WRITE,
            1,
            Some((&mut junk, SECTOR_SIZE)),
            3,
            0,
            0,
            0,
            0,
            0,
            None,
        )
        .unwrap();
    ctrlr.process_completions(qid, 16);

    let mut rbuf = IoBuffer::new(SECTOR_SIZE).unwrap();
    let (read, cb) = capture();
    ctrlr
        .submit_rw(qid, true, &mut rbuf, SECTOR_SIZE, 3, 1, 0, Some(cb))
        .unwrap();
    ctrlr.process_completions(qid, 16);
    assert!(!read.borrow().expect("read completed").is_error());
}
