// SPDX-License-Identifier: AGPL-3.0-or-later
//! JSON file catalog shared by every node that can reach the path

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{
    remove_origin, select, upsert, CatalogStore, ConflictPolicy, Entries, MemoryCatalog,
    PutOutcome,
};
use crate::error::{RelayError, Result};
use crate::fragment::Fragment;
use crate::predicate::TagPredicate;

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CatalogFile {
    version: u32,
    #[serde(default)]
    fragments: Vec<Fragment>,
}

/// Catalog persisted as a single JSON document
///
/// Every operation re-reads the file so puts from other nodes are visible,
/// and every mutation is written back through a temporary file and a rename.
/// Mutations hold an exclusive lock on `<path>.lock` from load to rename, so
/// concurrent writers in other processes are serialized.
#[derive(Debug)]
pub struct FileCatalog {
    path: PathBuf,
    policy: ConflictPolicy,
    lock: Mutex<()>,
}

impl FileCatalog {
    /// Open (but do not create) the catalog at `path`
    pub fn open<P: AsRef<Path>>(path: P, policy: ConflictPolicy) -> Result<Self> {
        let catalog = Self {
            path: path.as_ref().to_path_buf(),
            policy,
            lock: Mutex::new(()),
        };
        // Surface corruption before any run starts
        catalog.load()?;
        Ok(catalog)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy the current contents into an in-memory catalog
    pub fn snapshot(&self) -> Result<MemoryCatalog> {
        let _guard = self.lock.lock();
        let entries = self.load()?;
        Ok(MemoryCatalog::with_fragments(
            self.policy,
            entries.into_values().collect(),
        ))
    }

    fn load(&self) -> Result<Entries> {
        if !self.path.exists() {
            return Ok(Entries::new());
        }

        let contents = std::fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(Entries::new());
        }

        let file: CatalogFile =
            serde_json::from_str(&contents).map_err(|e| self.corrupt(e.to_string()))?;
        if file.version != FORMAT_VERSION {
            return Err(self.corrupt(format!("unsupported format version {}", file.version)));
        }

        Ok(file
            .fragments
            .into_iter()
            .map(|fragment| (fragment.key(), fragment))
            .collect())
    }

    fn save(&self, entries: &Entries) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = CatalogFile {
            version: FORMAT_VERSION,
            fragments: entries.values().cloned().collect(),
        };
        let contents = serde_json::to_string_pretty(&file)?;

        let tmp = self.sibling(&format!(".{}.tmp", std::process::id()));
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.path)?;

        debug!(path = %self.path.display(), fragments = entries.len(), "Catalog saved");
        Ok(())
    }

    /// `<path><suffix>` in the same directory
    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(OsString::from)
            .unwrap_or_else(|| OsString::from("catalog"));
        name.push(suffix);
        self.path.with_file_name(name)
    }

    fn lock_exclusive(&self) -> Result<FileLock> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        FileLock::acquire(&self.sibling(".lock"))
    }

    fn corrupt(&self, message: String) -> RelayError {
        RelayError::CorruptCatalog {
            path: self.path.display().to_string(),
            message,
        }
    }
}

impl CatalogStore for FileCatalog {
    fn put(&self, fragment: Fragment) -> Result<PutOutcome> {
        let _guard = self.lock.lock();
        let _file_lock = self.lock_exclusive()?;
        let mut entries = self.load()?;
        let outcome = upsert(&mut entries, fragment, self.policy)?;
        if outcome != PutOutcome::Unchanged {
            self.save(&entries)?;
        }
        Ok(outcome)
    }

    fn query(&self, predicate: &TagPredicate) -> Result<Vec<Fragment>> {
        let _guard = self.lock.lock();
        Ok(select(&self.load()?, predicate))
    }

    fn all(&self) -> Result<Vec<Fragment>> {
        let _guard = self.lock.lock();
        Ok(self.load()?.into_values().collect())
    }

    fn purge_origin(&self, origin: &str) -> Result<usize> {
        let _guard = self.lock.lock();
        let _file_lock = self.lock_exclusive()?;
        let mut entries = self.load()?;
        let removed = remove_origin(&mut entries, origin);
        if removed > 0 {
            self.save(&entries)?;
            info!(origin = %origin, removed = removed, "Purged fragments");
        }
        Ok(removed)
    }

    fn len(&self) -> Result<usize> {
        let _guard = self.lock.lock();
        Ok(self.load()?.len())
    }
}

/// Advisory `flock` held until drop
#[derive(Debug)]
struct FileLock {
    #[cfg_attr(not(unix), allow(dead_code))]
    file: File,
}

impl FileLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            loop {
                // SAFETY: the descriptor stays open for the lifetime of `file`
                let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
                if ret == 0 {
                    break;
                }
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::Interrupted {
                    return Err(err.into());
                }
            }
        }

        debug!(path = %path.display(), "Catalog lock acquired");
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // The lock file itself stays; unlinking it would let a waiter lock a stale inode
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: the descriptor is still open
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}
