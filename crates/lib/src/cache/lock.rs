//! Advisory file locks on a store, shared across processes.
//!
//! Two lock files live in the store:
//! - `.lock`: every single write runs under it exclusively. Writes are
//!   short, so [`StoreLock::acquire`] blocks until it is free.
//! - `.session.lock`: held shared for the whole of a build and exclusively
//!   by garbage collection. [`StoreLock::try_session`] fails fast and
//!   reports who holds it.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const LOCK_FILENAME: &str = ".lock";
const SESSION_LOCK_FILENAME: &str = ".session.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Shared,
  Exclusive,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
  pub version: u32,
  pub pid: u32,
  pub started_at_unix: u64,
  pub command: String,
  pub store: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreLockError {
  #[error(
    "Store is locked by another process: {command} (PID {pid}, started {started_at})\n\
             If you're sure no strata process is running, remove the lock file:\n  {lock_path}"
  )]
  Contention {
    command: String,
    pid: u32,
    started_at: String,
    lock_path: PathBuf,
  },

  #[error(
    "Store is in use by another process (a build is running)\n\
             If you're sure no strata process is running, remove the lock file:\n  {lock_path}"
  )]
  ContentionUnknown { lock_path: PathBuf },

  #[error("Failed to create store directory: {0}")]
  CreateDir(#[source] io::Error),

  #[error("Failed to open lock file: {0}")]
  OpenFile(#[source] io::Error),

  #[error("Failed to write lock metadata: {0}")]
  WriteMetadata(#[source] io::Error),

  #[error("Failed to acquire lock: {0}")]
  LockFailed(#[source] io::Error),
}

/// A held lock; released on drop.
#[derive(Debug)]
pub struct StoreLock {
  file: File,
  lock_path: PathBuf,
  mode: LockMode,
}

impl StoreLock {
  /// Block until the write lock on `store` is held in `mode`.
  pub fn acquire(store: &Path, mode: LockMode, command: &str) -> Result<Self, StoreLockError> {
    let (file, lock_path) = open_lock_file(store, LOCK_FILENAME)?;
    lock(&file, mode, true).map_err(StoreLockError::LockFailed)?;
    Self::finish(file, lock_path, mode, command, store)
  }

  /// Take the session lock on `store` only if it is free right now.
  pub fn try_session(store: &Path, mode: LockMode, command: &str) -> Result<Self, StoreLockError> {
    let (file, lock_path) = open_lock_file(store, SESSION_LOCK_FILENAME)?;

    if let Err(err) = lock(&file, mode, false) {
      if err.kind() == io::ErrorKind::WouldBlock {
        return Err(read_contention_error(&lock_path));
      }
      return Err(StoreLockError::LockFailed(err));
    }

    Self::finish(file, lock_path, mode, command, store)
  }

  fn finish(file: File, lock_path: PathBuf, mode: LockMode, command: &str, store: &Path) -> Result<Self, StoreLockError> {
    if mode == LockMode::Exclusive {
      write_metadata(&file, command, store)?;
    }
    Ok(StoreLock { file, lock_path, mode })
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }
}

impl Drop for StoreLock {
  fn drop(&mut self) {
    // shared holders write nothing, so stale metadata must not outlive us
    if self.mode == LockMode::Exclusive {
      let _ = self.file.set_len(0);
    }
  }
}

fn open_lock_file(store: &Path, filename: &str) -> Result<(File, PathBuf), StoreLockError> {
  if !store.exists() {
    std::fs::create_dir_all(store).map_err(StoreLockError::CreateDir)?;
  }

  let lock_path = store.join(filename);
  let file = OpenOptions::new()
    .read(true)
    .write(true)
    .create(true)
    .truncate(false)
    .open(&lock_path)
    .map_err(StoreLockError::OpenFile)?;

  Ok((file, lock_path))
}

fn write_metadata(file: &File, command: &str, store: &Path) -> Result<(), StoreLockError> {
  let metadata = LockMetadata {
    version: 1,
    pid: std::process::id(),
    started_at_unix: SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default()
      .as_secs(),
    command: command.to_string(),
    store: store.to_path_buf(),
  };

  file.set_len(0).map_err(StoreLockError::WriteMetadata)?;
  let mut writer = io::BufWriter::new(file);
  serde_json::to_writer_pretty(&mut writer, &metadata).map_err(|e| StoreLockError::WriteMetadata(io::Error::other(e)))?;
  writer.flush().map_err(StoreLockError::WriteMetadata)?;

  Ok(())
}

fn read_contention_error(lock_path: &Path) -> StoreLockError {
  if let Ok(mut file) = File::open(lock_path) {
    let mut contents = String::new();
    if file.read_to_string(&mut contents).is_ok()
      && let Ok(metadata) = serde_json::from_str::<LockMetadata>(&contents)
    {
      return StoreLockError::Contention {
        command: metadata.command,
        pid: metadata.pid,
        started_at: format!("Unix timestamp {}", metadata.started_at_unix),
        lock_path: lock_path.to_path_buf(),
      };
    }
  }

  StoreLockError::ContentionUnknown {
    lock_path: lock_path.to_path_buf(),
  }
}

#[cfg(unix)]
fn lock(file: &File, mode: LockMode, block: bool) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  let operation = match (mode, block) {
    (LockMode::Shared, true) => FlockOperation::LockShared,
    (LockMode::Exclusive, true) => FlockOperation::LockExclusive,
    (LockMode::Shared, false) => FlockOperation::NonBlockingLockShared,
    (LockMode::Exclusive, false) => FlockOperation::NonBlockingLockExclusive,
  };

  flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn lock(file: &File, mode: LockMode, block: bool) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  let handle = file.as_raw_handle() as HANDLE;
  let mut flags = if block { 0 } else { LOCKFILE_FAIL_IMMEDIATELY };
  if mode == LockMode::Exclusive {
    flags |= LOCKFILE_EXCLUSIVE_LOCK;
  }

  // SAFETY: OVERLAPPED is plain data and valid zero-initialized; the handle
  // is owned by `file` for the duration of the call.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(handle, flags, 0, 1, 0, &mut overlapped)
  };

  if result == 0 {
    Err(io::Error::last_os_error())
  } else {
    Ok(())
  }
}
