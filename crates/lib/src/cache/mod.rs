//! The content-addressable cache.
//!
//! # Storage Layout
//!
//! ```text
//! <store>/
//! ├── objects/<aa>/<digest>.json   # de-duplicated values
//! ├── entries/<fingerprint>.json   # CacheEntry metadata
//! ├── names.json                   # name -> latest {fingerprint, digest, kind}
//! ├── history.jsonl                # append-only history log
//! ├── .lock                        # advisory write lock
//! └── .session.lock                # shared by builds, exclusive for gc
//! ```
//!
//! # Submodules
//!
//! - [`store`] - [`CacheStore`] and its entry types
//! - [`lock`] - cross-process write and session locks

pub mod lock;
pub mod store;

pub use lock::{LockMode, StoreLock, StoreLockError};
pub use store::{CacheEntry, CacheError, CacheStore, EntryKind, EntryMeta, NameRecord, ObjectInfo};
