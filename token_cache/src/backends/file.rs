//! A file cache backend

use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use token_cache_clock::{Clock, System, UnixTime};

use super::{BackendError, CacheBackend};
use crate::CacheKeyRef;

#[derive(Debug, Serialize, Deserialize)]
struct FileEntry {
    value: String,
    expires_at: UnixTime,
}

/// A cache backend that keeps one file per entry in a directory
///
/// This allows multiple processes on the same logical filesystem to share
/// tokens, and tokens to survive a restart. Entries are written readable only
/// by the owner, and replaced atomically so that concurrent writers of one
/// key leave the last complete entry behind.
#[derive(Debug)]
pub struct FileCache<C = System> {
    dir: PathBuf,
    clock: C,
}

impl FileCache<System> {
    /// Constructs a new file cache rooted at `dir`
    ///
    /// The directory is created on first write if it does not exist.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            clock: System,
        }
    }
}

impl<C> FileCache<C> {
    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> FileCache<D> {
        FileCache {
            dir: self.dir,
            clock,
        }
    }

    /// The directory entries are stored in
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &CacheKeyRef) -> PathBuf {
        self.dir.join(format!("{}.json", key.as_str()))
    }

    async fn read_entry(&self, path: &Path) -> Result<Option<FileEntry>, io::Error> {
        match fs::read(path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write_entry(&self, path: &Path, entry: &FileEntry) -> Result<(), io::Error> {
        fs::create_dir_all(&self.dir).await?;

        let data = serde_json::to_vec(entry)?;
        let staging = staging_path(path);

        if let Err(e) = write_private(&staging, &data).await {
            let _ = fs::remove_file(&staging).await;
            return Err(e);
        }

        // Readers see either the previous entry or this one, never a mix
        if let Err(e) = fs::rename(&staging, path).await {
            let _ = fs::remove_file(&staging).await;
            return Err(e);
        }

        Ok(())
    }
}

/// A sibling path unique to this write, so concurrent writers never share a file
fn staging_path(path: &Path) -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(0);

    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(format!(".{}.{}.tmp", std::process::id(), n));
    path.with_file_name(name)
}

async fn write_private(path: &Path, data: &[u8]) -> Result<(), io::Error> {
    use tokio::io::AsyncWriteExt;

    let mut file_opts = OpenOptions::new();

    file_opts.create_new(true).write(true);

    #[cfg(unix)]
    file_opts.mode(0o600);

    let mut file = file_opts.open(path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

async fn remove_if_present(path: &Path) -> Result<(), io::Error> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[async_trait]
impl<C: Clock + Send + Sync> CacheBackend for FileCache<C> {
    async fn get(&self, key: &CacheKeyRef) -> Result<Option<String>, BackendError> {
        let path = self.path_for(key);

        match self.read_entry(&path).await? {
            Some(entry) if self.clock.now() < entry.expires_at => Ok(Some(entry.value)),
            Some(entry) => {
                tracing::trace!(
                    cache.key = %key,
                    expired_at = entry.expires_at.0,
                    "removing expired cache file"
                );
                remove_if_present(&path).await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &CacheKeyRef,
        value: &str,
        expires_at: UnixTime,
    ) -> Result<(), BackendError> {
        let entry = FileEntry {
            value: value.to_owned(),
            expires_at,
        };
        Ok(self.write_entry(&self.path_for(key), &entry).await?)
    }

    async fn delete(&self, key: &CacheKeyRef) -> Result<(), BackendError> {
        Ok(remove_if_present(&self.path_for(key)).await?)
    }
}
