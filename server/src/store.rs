//! Package record store.
//!
//! Every package is one JSON file named after its ID. Writes go to a
//! temporary file first and are renamed into place, so a reader never
//! sees a partial record.
//!
//! The daemon and the admin tool share the directory. Every write holds
//! an advisory lock on `store.lock`, which orders writers across
//! processes.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use async_fd_lock::{LockWrite, RwLockWriteGuard};
use serde::{de::DeserializeOwned, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::{ServerError, ServerResult};
use sitepack::package::Package;

/// File holding the IDs of packages waiting to be cancelled.
const PENDING_CANCEL_FILE: &str = "pending-cancel.json";

/// File locked by writers.
const LOCK_FILE: &str = "store.lock";

#[derive(Debug)]
pub struct PackageStore {
    path: PathBuf,

    /// Orders the writers of this process before they take the file lock.
    write_lock: Mutex<()>,
}

/// Exclusive write access to the store.
struct WriteGuard<'a> {
    _local: MutexGuard<'a, ()>,
    _file: RwLockWriteGuard<File>,
}

impl PackageStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn record_path(&self, id: i64) -> PathBuf {
        self.path.join(format!("{}.json", id))
    }

    async fn lock(&self) -> ServerResult<WriteGuard<'_>> {
        let local = self.write_lock.lock().await;

        fs::create_dir_all(&self.path)
            .await
            .map_err(ServerError::store_error)?;

        let lock_path = self.path.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)
            .await
            .map_err(ServerError::store_error)?;

        let file = file
            .lock_write()
            .await
            .map_err(|_| ServerError::StoreError(anyhow!("Cannot lock {:?}", lock_path)))?;

        Ok(WriteGuard {
            _local: local,
            _file: file,
        })
    }

    /// Loads a package.
    pub async fn load(&self, id: i64) -> ServerResult<Package> {
        match read_json(&self.record_path(id)).await? {
            Some(package) => Ok(package),
            None => Err(ServerError::NoSuchPackage),
        }
    }

    /// Saves a package, replacing any previous record.
    pub async fn save(&self, package: &Package) -> ServerResult<()> {
        let _guard = self.lock().await?;
        write_json(&self.record_path(package.id), package).await
    }

    /// Saves a package only if its record still exists.
    ///
    /// Fails with [`ServerError::NoSuchPackage`] if the package was
    /// deleted since it was loaded.
    pub async fn save_existing(&self, package: &Package) -> ServerResult<()> {
        let _guard = self.lock().await?;

        let path = self.record_path(package.id);
        match fs::metadata(&path).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(ServerError::NoSuchPackage),
            Err(e) => return Err(ServerError::store_error(e)),
        }

        write_json(&path, package).await
    }

    /// Returns the IDs of all packages, in ascending order.
    pub async fn list(&self) -> ServerResult<Vec<i64>> {
        let mut entries = match fs::read_dir(&self.path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ServerError::store_error(e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(ServerError::store_error)?
        {
            let file_name = entry.file_name();
            let id = file_name
                .to_str()
                .and_then(|name| name.strip_suffix(".json"))
                .and_then(|stem| stem.parse::<i64>().ok());

            if let Some(id) = id {
                ids.push(id);
            }
        }

        ids.sort_unstable();
        Ok(ids)
    }

    /// Returns an ID no package uses yet.
    pub async fn next_id(&self) -> ServerResult<i64> {
        Ok(self.list().await?.last().map_or(1, |id| id + 1))
    }

    /// Deletes a package record.
    pub async fn delete(&self, id: i64) -> ServerResult<()> {
        let _guard = self.lock().await?;

        match fs::remove_file(self.record_path(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(ServerError::NoSuchPackage),
            Err(e) => return Err(ServerError::store_error(e)),
        }

        self.update_pending_cancel(|pending| pending.remove(&id))
            .await
    }

    /// Records a cancellation request.
    pub async fn request_cancel(&self, id: i64) -> ServerResult<()> {
        let _guard = self.lock().await?;
        self.update_pending_cancel(|pending| pending.insert(id))
            .await
    }

    /// Forgets a cancellation request once it was honored.
    pub async fn clear_cancel(&self, id: i64) -> ServerResult<()> {
        let _guard = self.lock().await?;
        self.update_pending_cancel(|pending| pending.remove(&id))
            .await
    }

    /// Returns the packages waiting to be cancelled.
    pub async fn pending_cancel(&self) -> ServerResult<BTreeSet<i64>> {
        Ok(read_json(&self.path.join(PENDING_CANCEL_FILE))
            .await?
            .unwrap_or_default())
    }

    /// Rewrites the pending-cancel list if `f` changed it.
    ///
    /// The caller holds the write lock.
    async fn update_pending_cancel<F>(&self, f: F) -> ServerResult<()>
    where
        F: FnOnce(&mut BTreeSet<i64>) -> bool,
    {
        let mut pending = self.pending_cancel().await?;
        if f(&mut pending) {
            write_json(&self.path.join(PENDING_CANCEL_FILE), &pending).await?;
        }

        Ok(())
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> ServerResult<Option<T>> {
    let contents = match fs::read(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ServerError::store_error(e)),
    };

    let value = serde_json::from_slice(&contents).map_err(ServerError::store_error)?;
    Ok(Some(value))
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> ServerResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(ServerError::store_error)?;
    }

    let contents = serde_json::to_vec_pretty(value).map_err(ServerError::store_error)?;

    let mut temp = path.as_os_str().to_owned();
    temp.push(format!(".{}.tmp", Uuid::new_v4()));
    let temp = PathBuf::from(temp);

    if let Err(e) = fs::write(&temp, contents).await {
        let _ = fs::remove_file(&temp).await;
        return Err(ServerError::store_error(e));
    }

    fs::rename(&temp, path)
        .await
        .map_err(ServerError::store_error)?;

    Ok(())
}
