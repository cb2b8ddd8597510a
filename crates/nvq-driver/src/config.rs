//! Process-shared driver configuration word.

use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use nvq_shmem::Region;

bitflags! {
    /// The 64-bit config word in the `driver_global_config` region.
    /// Intended to be set once before a workload starts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DriverConfig: u64 {
        /// Verify read payloads against the CRC table on completion.
        const VERIFY_READ = 1 << 0;
    }
}

/// Atomic view over the shared config word.
pub struct GlobalConfig {
    region: Region,
}

impl GlobalConfig {
    /// The region must hold at least one u64; callers size it at reserve
    /// time via [`GlobalConfig::REGION_LEN`].
    pub const REGION_LEN: usize = 8;

    pub(crate) fn new(region: Region) -> Self {
        debug_assert!(region.len() >= Self::REGION_LEN);
        Self { region }
    }

    fn cell(&self) -> &AtomicU64 {
        // SAFETY: the mapping is 8-aligned (page-aligned base, offset 0) and
        // lives as long as `self.region`.
        unsafe { AtomicU64::from_ptr(self.region.base_ptr().cast()) }
    }

    pub fn load(&self) -> DriverConfig {
        DriverConfig::from_bits_retain(self.cell().load(Ordering::SeqCst))
    }

    pub fn store(&self, config: DriverConfig) {
        self.cell().store(config.bits(), Ordering::SeqCst);
    }

    pub fn verify_read(&self) -> bool {
        self.load().contains(DriverConfig::VERIFY_READ)
    }
}
