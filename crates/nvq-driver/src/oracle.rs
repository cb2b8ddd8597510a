//! Host-maintained data-integrity table: one CRC32C slot per logical block.
//!
//! The table lives in the `driver_crc32_table` region so every cooperating
//! process verifies reads against the same view. Two slot values are
//! reserved as sentinels; real checksums are biased away from them.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crc::{Crc, CRC_32_ISCSI};
use nvq_shmem::Region;
use tracing::warn;

/// Block has never been written, or has been trimmed/sanitized. Reads are
/// not verified.
pub const SLOT_UNMAPPED: u32 = 0x0000_0000;
/// Block explicitly marked bad; any read must fail verification.
pub const SLOT_UNCORRECTABLE: u32 = 0xFFFF_FFFF;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// CRC32C of one sector, biased off the two sentinel values.
fn sector_crc(sector: &[u8]) -> u32 {
    match CASTAGNOLI.checksum(sector) {
        SLOT_UNMAPPED => 1,
        SLOT_UNCORRECTABLE => 0xFFFF_FFFE,
        crc => crc,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyErrorKind {
    /// The table carries the uncorrectable sentinel for this block.
    Uncorrectable,
    /// The payload's leading 8 bytes do not name the block's own LBA.
    LbaStamp,
    /// Checksum mismatch against the last acknowledged write.
    Crc,
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("read verification failed at lba {lba}: {kind:?}")]
pub struct VerifyError {
    pub kind: VerifyErrorKind,
    pub lba: u64,
}

/// Process-wide monotonically increasing write counter, shared through the
/// `driver_io_token` region. Every write of every block gets a unique value.
pub struct WriteToken {
    region: Region,
}

impl WriteToken {
    pub const REGION_LEN: usize = 8;

    pub(crate) fn new(region: Region) -> Self {
        debug_assert!(region.len() >= Self::REGION_LEN);
        Self { region }
    }

    fn cell(&self) -> &AtomicU64 {
        // SAFETY: region base is page-aligned and outlives the borrow.
        unsafe { AtomicU64::from_ptr(self.region.base_ptr().cast()) }
    }

    /// Claims `count` consecutive token values, returning the first.
    pub fn fetch_add(&self, count: u64) -> u64 {
        self.cell().fetch_add(count, Ordering::SeqCst)
    }

    pub fn current(&self) -> u64 {
        self.cell().load(Ordering::SeqCst)
    }
}

/// LBA-indexed checksum table sized to the whole namespace.
///
/// When the table region could not be reserved (namespace too large for the
/// available memory) the table runs *disabled*: verification reports
/// success and slot updates are skipped, but write payloads are still
/// stamped so the token stays globally unique.
pub struct CrcTable {
    slots: Option<Region>,
    nsze: u64,
}

impl CrcTable {
    /// Bytes of shared memory needed to cover `nsze` blocks.
    pub fn region_len(nsze: u64) -> usize {
        nsze as usize * 4
    }

    pub(crate) fn new(slots: Option<Region>, nsze: u64) -> Self {
        if let Some(region) = &slots {
            debug_assert!(region.len() >= Self::region_len(nsze));
        }
        Self { slots, nsze }
    }

    pub fn enabled(&self) -> bool {
        self.slots.is_some()
    }

    fn slot(&self, lba: u64) -> Option<&AtomicU32> {
        if lba >= self.nsze {
            return None;
        }
        let region = self.slots.as_ref()?;
        // SAFETY: lba < nsze keeps the offset inside the mapping, which is
        // 4-aligned at every slot; the borrow is tied to &self.
        Some(unsafe { AtomicU32::from_ptr(region.base_ptr().cast::<u32>().add(lba as usize)) })
    }

    /// Current slot value, for inspection and tests.
    pub fn get(&self, lba: u64) -> Option<u32> {
        self.slot(lba).map(|s| s.load(Ordering::Relaxed))
    }

    /// Stamps each sector of a write payload and records its checksum.
    ///
    /// Per sector `i`: bytes `0..8` take the little-endian LBA, the last 8
    /// bytes take `token + i`, and the slot for `lba + i` takes the CRC of
    /// the stamped sector. The table is updated here, *before* submission,
    /// so the stamped payload is exactly what DMAs to the device; a write
    /// that later fails leaves the table ahead of the media, and a
    /// subsequent read of that block will flag a mismatch.
    pub fn record_write(
        &self,
        lba: u64,
        lba_count: u32,
        buf: &mut [u8],
        sector_size: usize,
        token: &WriteToken,
    ) {
        let token_base = token.fetch_add(u64::from(lba_count));
        for i in 0..lba_count as usize {
            let block_lba = lba + i as u64;
            let sector = &mut buf[i * sector_size..(i + 1) * sector_size];
            sector[..8].copy_from_slice(&block_lba.to_le_bytes());
            let tail = sector_size - 8;
            sector[tail..].copy_from_slice(&(token_base + i as u64).to_le_bytes());
            if let Some(slot) = self.slot(block_lba) {
                slot.store(sector_crc(sector), Ordering::Relaxed);
            }
        }
    }

    /// Checks a read payload block by block.
    ///
    /// Unmapped blocks are skipped; uncorrectable blocks fail regardless of
    /// payload; everything else must carry its own LBA in the leading 8
    /// bytes and match the recorded checksum.
    pub fn verify(
        &self,
        lba: u64,
        lba_count: u32,
        buf: &[u8],
        sector_size: usize,
    ) -> Result<(), VerifyError> {
        if !self.enabled() {
            return Ok(());
        }
        for i in 0..lba_count as usize {
            let block_lba = lba + i as u64;
            let expected = match self.get(block_lba) {
                None | Some(SLOT_UNMAPPED) => continue,
                Some(SLOT_UNCORRECTABLE) => {
                    return Err(VerifyError {
                        kind: VerifyErrorKind::Uncorrectable,
                        lba: block_lba,
                    })
                }
                Some(crc) => crc,
            };
            let sector = &buf[i * sector_size..(i + 1) * sector_size];
            let stamp = u64::from_le_bytes(sector[..8].try_into().unwrap());
            if stamp != block_lba {
                return Err(VerifyError {
                    kind: VerifyErrorKind::LbaStamp,
                    lba: block_lba,
                });
            }
            if sector_crc(sector) != expected {
                return Err(VerifyError {
                    kind: VerifyErrorKind::Crc,
                    lba: block_lba,
                });
            }
        }
        Ok(())
    }

    /// Returns `[lba, lba + count)` to the unmapped state (trim/deallocate).
    pub fn invalidate(&self, lba: u64, count: u64) {
        self.set_range(lba, count, SLOT_UNMAPPED);
    }

    /// Marks `[lba, lba + count)` so any read of it fails verification.
    pub fn mark_uncorrectable(&self, lba: u64, count: u64) {
        self.set_range(lba, count, SLOT_UNCORRECTABLE);
    }

    /// Clears the whole table (format/sanitize).
    pub fn invalidate_all(&self) {
        self.set_range(0, self.nsze, SLOT_UNMAPPED);
    }

    fn set_range(&self, lba: u64, count: u64, value: u32) {
        if !self.enabled() {
            return;
        }
        let end = lba.saturating_add(count).min(self.nsze);
        if lba >= end && count > 0 {
            warn!(lba, count, "checksum range update entirely out of bounds");
        }
        for block in lba..end {
            if let Some(slot) = self.slot(block) {
                slot.store(value, Ordering::Relaxed);
            }
        }
    }
}
