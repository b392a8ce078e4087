// fm-store: The shared persisted table and its interprocess lock.
//
// One ingestion process writes the table; any number of reader processes
// (the dashboard) read it.  Every participant must reach the file through
// `SharedTable` with the same table path, so that readers never observe a
// table that is being rewritten.

pub mod lock;
pub mod table;

use fm_protocol::Record;
use lock::{FileLock, LockError, LockMode};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use lock::LockGuard;
pub use table::TableError;

/// Suffix appended to the table path to form the sidecar lock file.
pub const LOCK_SUFFIX: &str = ".lock";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// The persisted table plus the reader/writer lock that guards it.
#[derive(Debug, Clone)]
pub struct SharedTable {
    table_path: PathBuf,
    lock: FileLock,
}

impl SharedTable {
    pub fn new(table_path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        let table_path = table_path.into();
        let lock = FileLock::new(lock_path_for(&table_path), lock_timeout);
        SharedTable { table_path, lock }
    }

    pub fn table_path(&self) -> &Path {
        &self.table_path
    }

    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    /// Run `f` while holding the shared lock.  The lock is released on every
    /// exit path, including when `f` fails or panics.
    pub fn with_read_lock<T, E>(&self, f: impl FnOnce(&Path) -> Result<T, E>) -> Result<T, E>
    where
        E: From<LockError>,
    {
        let _guard = self.lock.acquire(LockMode::Shared)?;
        f(&self.table_path)
    }

    /// Run `f` while holding the exclusive lock.
    pub fn with_write_lock<T, E>(&self, f: impl FnOnce(&Path) -> Result<T, E>) -> Result<T, E>
    where
        E: From<LockError>,
    {
        let _guard = self.lock.acquire(LockMode::Exclusive)?;
        f(&self.table_path)
    }

    /// Read the whole table under the shared lock.
    ///
    /// Returns `Ok(None)` when no table has been written yet; readers should
    /// treat that as an empty dashboard rather than an error.
    pub fn load(&self) -> Result<Option<Vec<Record>>, StoreError> {
        self.with_read_lock(|path| Ok(table::read(path)?))
    }

    /// Replace the whole table under the exclusive lock.
    pub fn store(&self, records: &[Record]) -> Result<(), StoreError> {
        self.with_write_lock(|path| {
            table::write(path, records)?;
            tracing::debug!(path = %path.display(), rows = records.len(), "table rewritten");
            Ok(())
        })
    }
}

/// Sidecar lock path for a table: the table path with [`LOCK_SUFFIX`] appended.
pub fn lock_path_for(table_path: &Path) -> PathBuf {
    let mut name = table_path.as_os_str().to_owned();
    name.push(LOCK_SUFFIX);
    PathBuf::from(name)
}
