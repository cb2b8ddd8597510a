//! Named shared-memory regions with explicit primary/secondary roles.
//!
//! Cooperating driver processes share their cross-process state (write token,
//! CRC table, config word, command log) through named regions. The *primary*
//! process creates and destroys them; *secondaries* only attach. A region is
//! a plain file mapped shared with `memmap2`, living under `/dev/shm` by
//! default so attachments from different processes observe the same pages.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use memmap2::MmapMut;
use tracing::debug;

bitflags! {
    /// Backing-placement hints accepted by [`RegionManager::reserve`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        /// The region is never a device DMA target, so IOVA-fragmented
        /// backing is acceptable.
        const IOVA_ANY = 1 << 0;
    }
}

/// Which side of the shared-memory contract this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates and destroys regions.
    Primary,
    /// Attaches to regions the primary created.
    Secondary,
}

#[derive(Debug, thiserror::Error)]
pub enum ShmemError {
    #[error("role {role:?} may not {op} regions")]
    NotPermitted { role: Role, op: &'static str },
    #[error("region {name:?} already exists")]
    AlreadyExists { name: String },
    #[error("region {name:?}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ShmemError>;

/// A mapped shared-memory region: `(name, base, len, owner_role)`.
///
/// Dropping a `Region` unmaps it but leaves the backing file in place; only
/// [`RegionManager::free`] (primary role) deletes it.
pub struct Region {
    name: String,
    base: *mut u8,
    len: usize,
    owner_role: Role,
    _map: MmapMut,
    _file: File,
}

// The mapping stays valid wherever the handle travels; concurrent access is
// governed by the driver's single-writer discipline, not by this type.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn owner_role(&self) -> Role {
        self.owner_role
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.base
    }

    /// Base pointer for callers that build atomic views over the mapping.
    pub fn base_ptr(&self) -> *mut u8 {
        self.base
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `base` and `len` describe the live mapping owned by `_map`.
        unsafe { std::slice::from_raw_parts(self.base, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: exclusive borrow of the handle; mapping is writable.
        unsafe { std::slice::from_raw_parts_mut(self.base, self.len) }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("owner_role", &self.owner_role)
            .finish()
    }
}

/// Names, reserves, and looks up regions on behalf of one process.
#[derive(Debug, Clone)]
pub struct RegionManager {
    role: Role,
    dir: PathBuf,
}

fn default_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

impl RegionManager {
    pub fn primary() -> Self {
        Self::with_dir(Role::Primary, default_dir())
    }

    pub fn secondary() -> Self {
        Self::with_dir(Role::Secondary, default_dir())
    }

    /// Manager rooted at an explicit directory. Tests point this at a
    /// per-test tempdir so region names cannot collide across processes.
    pub fn with_dir(role: Role, dir: impl Into<PathBuf>) -> Self {
        Self {
            role,
            dir: dir.into(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Creates a new zero-filled region of `len` bytes. Primary only; the
    /// name must not already exist.
    pub fn reserve(&self, name: &str, len: usize, _flags: RegionFlags) -> Result<Region> {
        if self.role != Role::Primary {
            return Err(ShmemError::NotPermitted {
                role: self.role,
                op: "reserve",
            });
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(self.path(name))
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    ShmemError::AlreadyExists {
                        name: name.to_string(),
                    }
                } else {
                    ShmemError::Io {
                        name: name.to_string(),
                        source: e,
                    }
                }
            })?;
        file.set_len(len as u64).map_err(|e| ShmemError::Io {
            name: name.to_string(),
            source: e,
        })?;
        debug!(name, len, "reserved shared region");
        self.map(name, file, len)
    }

    /// Attaches to an existing region, or `Ok(None)` if the name is unknown.
    pub fn lookup(&self, name: &str) -> Result<Option<Region>> {
        let file = match OpenOptions::new().read(true).write(true).open(self.path(name)) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ShmemError::Io {
                    name: name.to_string(),
                    source: e,
                })
            }
        };
        let len = file
            .metadata()
            .map_err(|e| ShmemError::Io {
                name: name.to_string(),
                source: e,
            })?
            .len() as usize;
        debug!(name, len, "attached shared region");
        self.map(name, file, len).map(Some)
    }

    /// Deletes the backing file. Primary only; missing names are ignored so
    /// teardown is idempotent.
    pub fn free(&self, name: &str) -> Result<()> {
        if self.role != Role::Primary {
            return Err(ShmemError::NotPermitted {
                role: self.role,
                op: "free",
            });
        }
        match std::fs::remove_file(self.path(name)) {
            Ok(()) => {
                debug!(name, "freed shared region");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ShmemError::Io {
                name: name.to_string(),
                source: e,
            }),
        }
    }

    fn map(&self, name: &str, file: File, len: usize) -> Result<Region> {
        // SAFETY: the mapping is over a regular file we hold open; shared
        // mutation across processes is the whole point of these regions.
        let mut map = unsafe {
            MmapMut::map_mut(&file).map_err(|e| ShmemError::Io {
                name: name.to_string(),
                source: e,
            })?
        };
        let base = map.as_mut_ptr();
        Ok(Region {
            name: name.to_string(),
            base,
            len,
            owner_role: self.role,
            _map: map,
            _file: file,
        })
    }
}
