use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::{Error, Result};
use crate::plan::BranchIndex;

// -------------------------------------------------------------------------------------------------
// Buffer
// -------------------------------------------------------------------------------------------------
/// A restored hibernation image. Disk-backed images stay memory-mapped
/// read-only so booting does not double-allocate the branch state.
pub enum Buffer {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        match self {
            Buffer::Owned(v) => v,
            Buffer::Mapped(m) => m,
        }
    }
}

// -------------------------------------------------------------------------------------------------
// HibernationStore
// -------------------------------------------------------------------------------------------------
enum Stored {
    Memory(Vec<u8>),
    Disk(PathBuf),
}

/// Spill storage for idle branch state: either packed in-process buffers, or
/// temp files under the scratch directory, created 0600 and deleted when the
/// branch is booted or retired.
pub struct HibernationStore {
    disk_dir: Option<PathBuf>,
    stored: HashMap<BranchIndex, Stored>,
    nonce: u64,
}

impl HibernationStore {
    pub fn in_memory() -> HibernationStore {
        HibernationStore {
            disk_dir: None,
            stored: HashMap::new(),
            nonce: 0,
        }
    }

    pub fn on_disk(dir: PathBuf) -> HibernationStore {
        HibernationStore {
            disk_dir: Some(dir),
            stored: HashMap::new(),
            nonce: 0,
        }
    }

    fn fail(branch: BranchIndex, reason: impl std::fmt::Display) -> Error {
        Error::Hibernation {
            branch,
            reason: reason.to_string(),
        }
    }

    pub fn save(&mut self, branch: BranchIndex, bytes: Vec<u8>) -> Result<()> {
        self.discard(branch);
        match &self.disk_dir {
            None => {
                self.stored.insert(branch, Stored::Memory(bytes));
            }
            Some(dir) => {
                self.nonce += 1;
                let path = dir.join(format!("strata.{branch}.{}", self.nonce));
                let mut options = OpenOptions::new();
                options.write(true).create_new(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::OpenOptionsExt;
                    options.mode(0o600);
                }
                let mut file = options
                    .open(&path)
                    .map_err(|e| Self::fail(branch, format!("cannot create {path:?}: {e}")))?;
                file.write_all(&bytes)
                    .and_then(|_| file.sync_data())
                    .map_err(|e| Self::fail(branch, format!("cannot write {path:?}: {e}")))?;
                debug!("hibernated branch {branch} to {path:?} ({} bytes)", bytes.len());
                self.stored.insert(branch, Stored::Disk(path));
            }
        }
        Ok(())
    }

    pub fn load(&mut self, branch: BranchIndex) -> Result<Buffer> {
        match self.stored.remove(&branch) {
            Some(Stored::Memory(bytes)) => Ok(Buffer::Owned(bytes)),
            Some(Stored::Disk(path)) => {
                let file = File::open(&path)
                    .map_err(|e| Self::fail(branch, format!("cannot open {path:?}: {e}")))?;
                let map = unsafe { Mmap::map(&file) }
                    .map_err(|e| Self::fail(branch, format!("cannot map {path:?}: {e}")))?;
                // The mapping holds the data; the directory entry can go.
                let _ = std::fs::remove_file(&path);
                Ok(Buffer::Mapped(map))
            }
            None => Err(Self::fail(branch, "no hibernated state")),
        }
    }

    /// Drop any stored image for the branch; used when a hibernated branch is
    /// deleted.
    pub fn discard(&mut self, branch: BranchIndex) {
        if let Some(Stored::Disk(path)) = self.stored.remove(&branch) {
            let _ = std::fs::remove_file(path);
        }
    }

    pub fn holds(&self, branch: BranchIndex) -> bool {
        self.stored.contains_key(&branch)
    }
}

impl Drop for HibernationStore {
    fn drop(&mut self) {
        let branches: Vec<BranchIndex> = self.stored.keys().copied().collect();
        for b in branches {
            self.discard(b);
        }
    }
}

// -------------------------------------------------------------------------------------------------
// state packing + scratch placement
// -------------------------------------------------------------------------------------------------
/// Pack per-item hibernation payloads into one image.
pub fn pack_states(states: &[(String, Vec<u8>)], branch: BranchIndex) -> Result<Vec<u8>> {
    bincode::serialize(states).map_err(|e| HibernationStore::fail(branch, e))
}

pub fn unpack_states(bytes: &[u8], branch: BranchIndex) -> Result<Vec<(String, Vec<u8>)>> {
    bincode::deserialize(bytes).map_err(|e| HibernationStore::fail(branch, e))
}

/// Where spill files go: an explicit cache path beats `XDG_CACHE_HOME`, which
/// beats `TMPDIR`, which beats the system default.
pub fn scratch_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(cache) = std::env::var_os("XDG_CACHE_HOME") {
        if !cache.is_empty() {
            return PathBuf::from(cache).join("strata");
        }
    }
    if let Some(tmp) = std::env::var_os("TMPDIR") {
        if !tmp.is_empty() {
            return PathBuf::from(tmp);
        }
    }
    std::env::temp_dir()
}
