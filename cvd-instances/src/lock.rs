//! Per-instance advisory lock files.
//!
//! An instance id is reserved by holding an exclusive `flock` on
//! `<lock_dir>/instance-<id>.lock`. The file's presence means nothing on its
//! own; only the lock bit does. Dropping the [`InstanceLockFile`] closes the
//! descriptor, which releases the lock on every exit path.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use cvd_core::{BASE_INSTANCE_ID, MAX_INSTANCES};
use fs2::FileExt;
use tracing::{debug, warn};

use crate::InstancesError;

const LOCK_FILE_PREFIX: &str = "instance-";
const LOCK_FILE_SUFFIX: &str = ".lock";

/// An exclusively held instance id. Released on drop.
#[derive(Debug)]
pub struct InstanceLockFile {
    id: u32,
    path: PathBuf,
    _file: File,
}

impl InstanceLockFile {
    /// The reserved id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLockFile {
    fn drop(&mut self) {
        debug!(instance_id = self.id, "released instance lock");
    }
}

/// Hands out [`InstanceLockFile`]s for ids in
/// `[BASE_INSTANCE_ID, BASE_INSTANCE_ID + MAX_INSTANCES)`.
#[derive(Debug, Clone)]
pub struct InstanceLockFileManager {
    lock_dir: PathBuf,
}

impl InstanceLockFileManager {
    /// Manage lock files under `lock_dir`. The directory is created lazily.
    #[must_use]
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self { lock_dir: lock_dir.into() }
    }

    /// Directory holding the lock files.
    #[must_use]
    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Lock file path of `id`.
    #[must_use]
    pub fn lock_path(&self, id: u32) -> PathBuf {
        self.lock_dir.join(format!("{LOCK_FILE_PREFIX}{id}{LOCK_FILE_SUFFIX}"))
    }

    /// Every id that may be locked, in ascending order.
    pub fn id_range() -> impl Iterator<Item = u32> {
        BASE_INSTANCE_ID..BASE_INSTANCE_ID + MAX_INSTANCES
    }

    /// Lock `id`, or report `None` if another holder has it.
    ///
    /// # Errors
    /// [`InstancesError::LockIo`] if the id is out of range or the file cannot
    /// be created or locked.
    pub fn try_acquire(&self, id: u32) -> Result<Option<InstanceLockFile>, InstancesError> {
        let path = self.lock_path(id);
        let lock_io = |source: io::Error| InstancesError::LockIo { path: path.clone(), source };
        if !Self::id_range().any(|i| i == id) {
            return Err(lock_io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("instance id {id} is outside the lockable range"),
            )));
        }
        fs::create_dir_all(&self.lock_dir).map_err(lock_io)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(lock_io)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                debug!(instance_id = id, path = %path.display(), "acquired instance lock");
                Ok(Some(InstanceLockFile { id, path, _file: file }))
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(lock_io(e)),
        }
    }

    /// Lock `id`.
    ///
    /// # Errors
    /// [`InstancesError::LockBusy`] if another holder has it, otherwise see
    /// [`try_acquire`](Self::try_acquire).
    pub fn acquire(&self, id: u32) -> Result<InstanceLockFile, InstancesError> {
        self.try_acquire(id)?.ok_or(InstancesError::LockBusy { id })
    }

    /// Lock every id in `ids`, releasing all of them if any is busy.
    ///
    /// # Errors
    /// See [`acquire`](Self::acquire).
    pub fn acquire_all(&self, ids: &[u32]) -> Result<Vec<InstanceLockFile>, InstancesError> {
        ids.iter().map(|id| self.acquire(*id)).collect()
    }

    /// Lock the smallest free id.
    ///
    /// # Errors
    /// [`InstancesError::NoFreeInstanceId`] when every id is held.
    pub fn acquire_any(&self) -> Result<InstanceLockFile, InstancesError> {
        self.acquire_unused(&BTreeSet::new())
    }

    /// Lock the smallest free id that is not in `excluded`.
    ///
    /// `excluded` carries ids recorded in the database whose lock is free
    /// because their group is stopped.
    ///
    /// # Errors
    /// [`InstancesError::NoFreeInstanceId`] when no candidate can be locked.
    pub fn acquire_unused(&self, excluded: &BTreeSet<u32>) -> Result<InstanceLockFile, InstancesError> {
        for id in Self::id_range().filter(|id| !excluded.contains(id)) {
            if let Some(lock) = self.try_acquire(id)? {
                return Ok(lock);
            }
        }
        Err(InstancesError::NoFreeInstanceId)
    }

    /// Whether some holder currently has `id` locked.
    ///
    /// # Errors
    /// See [`try_acquire`](Self::try_acquire).
    pub fn is_locked(&self, id: u32) -> Result<bool, InstancesError> {
        Ok(self.try_acquire(id)?.is_none())
    }

    /// Unlink the lock file of `id`. A missing file is not an error.
    ///
    /// # Errors
    /// [`InstancesError::LockIo`] if the file exists but cannot be removed.
    pub fn remove_lock_file(&self, id: u32) -> Result<(), InstancesError> {
        let path = self.lock_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(instance_id = id, "removed instance lock file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(InstancesError::LockIo { path, source }),
        }
    }

    /// Unlink every lock file. Returns how many were removed.
    ///
    /// # Errors
    /// [`InstancesError::LockIo`] if the directory cannot be listed.
    pub fn remove_all(&self) -> Result<usize, InstancesError> {
        let entries = match fs::read_dir(&self.lock_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(InstancesError::LockIo { path: self.lock_dir.clone(), source }),
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !(name.starts_with(LOCK_FILE_PREFIX) && name.ends_with(LOCK_FILE_SUFFIX)) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to remove lock file"),
            }
        }
        Ok(removed)
    }
}
