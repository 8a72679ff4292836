//! Versioned per-account roster snapshots.
//!
//! File layout: a 4-byte big-endian version tag followed by the bincode
//! encoding of the entry map (a `u64` entry count, then `protocol id ->
//! ContactSnapshot` pairs). A file is either absent, fully valid, or removed.

use crate::backend::BackendPool;
use crate::config::{CoreConfig, CACHE_BACKEND_FILE, CACHE_BACKEND_MEMORY};
use crate::contact::ContactSnapshot;
use crate::error::CoreError;
use bincode::Options;
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use thiserror::Error;

pub const CACHE_VERSION: i32 = 3;

pub type RosterSnapshot = BTreeMap<String, ContactSnapshot>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io {0}")]
    Io(#[from] std::io::Error),
    #[error("codec")]
    Codec,
    #[error("empty")]
    Empty,
    #[error("version {found}, expected {expected}")]
    Version { found: i32, expected: i32 },
}

/// Fixed-width integers, and a body must be consumed exactly.
fn body_codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

pub fn encode_snapshot(entries: &RosterSnapshot) -> Result<Vec<u8>, CacheError> {
    let body = body_codec()
        .serialize(entries).map_err(|_| CacheError::Codec)?;
    let mut out = Vec::with_capacity(body.len() + 4);
    out.extend_from_slice(&CACHE_VERSION.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<RosterSnapshot, CacheError> {
    if bytes.is_empty() {
        return Err(CacheError::Empty);
    }
    let Some((tag, body)) = bytes.split_first_chunk::<4>() else {
        return Err(CacheError::Codec);
    };
    let found = i32::from_be_bytes(*tag);
    if found != CACHE_VERSION {
        return Err(CacheError::Version {
            found,
            expected: CACHE_VERSION,
        });
    }
    body_codec()
        .deserialize(body)
        .map_err(|_| CacheError::Codec)
}

/// Load/persist of an account's roster snapshot.
pub trait RosterCacheStore: Send + Sync {
    /// Never fails: missing, empty, stale or corrupt data loads as empty.
    fn load(&self, account_path: &str) -> RosterSnapshot;
    /// Replaces the whole snapshot. An empty mapping removes it.
    fn persist(&self, account_path: &str, entries: &RosterSnapshot) -> Result<(), CacheError>;
}

#[derive(Clone, Debug)]
pub struct FileRosterCache {
    dir: PathBuf,
}

impl FileRosterCache {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn cache_file_path(&self, account_path: &str) -> PathBuf {
        let hash = blake3::hash(account_path.as_bytes()).to_hex();
        self.dir.join(format!("roster-{}.cache", &hash.as_str()[..32]))
    }

    fn discard(&self, path: &Path) {
        if let Err(err) = fs::remove_file(path) {
            if err.kind() != ErrorKind::NotFound {
                warn!("could not remove cache file {}: {}", path.display(), err);
            }
        }
    }
}

impl RosterCacheStore for FileRosterCache {
    fn load(&self, account_path: &str) -> RosterSnapshot {
        let path = self.cache_file_path(account_path);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("account {} has no cache file", account_path);
                return RosterSnapshot::new();
            }
            Err(err) => {
                warn!("can't read {}: {}", path.display(), err);
                return RosterSnapshot::new();
            }
        };
        match decode_snapshot(&bytes) {
            Ok(entries) => {
                debug!(
                    "loaded {} contacts from cache for account {}",
                    entries.len(),
                    account_path
                );
                entries
            }
            Err(CacheError::Empty) => {
                debug!("empty cache file {}", path.display());
                self.discard(&path);
                RosterSnapshot::new()
            }
            Err(CacheError::Version { found, expected }) => {
                warn!(
                    "wrong cache version {} (expected {}) for file {}",
                    found,
                    expected,
                    path.display()
                );
                self.discard(&path);
                RosterSnapshot::new()
            }
            Err(err) => {
                warn!("corrupt cache file {}: {}", path.display(), err);
                self.discard(&path);
                RosterSnapshot::new()
            }
        }
    }

    fn persist(&self, account_path: &str, entries: &RosterSnapshot) -> Result<(), CacheError> {
        let path = self.cache_file_path(account_path);
        if entries.is_empty() {
            self.discard(&path);
            return Ok(());
        }
        let data = encode_snapshot(entries)?;
        fs::create_dir_all(&self.dir)?;
        let mut temp = NamedTempFile::new_in(&self.dir)?;
        temp.write_all(&data)?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|err| CacheError::Io(err.error))?;
        debug!(
            "wrote {} contacts to cache for account {}",
            entries.len(),
            account_path
        );
        Ok(())
    }
}

/// Keeps encoded snapshots in memory, same format as the file store.
#[derive(Debug, Default)]
pub struct MemoryRosterCache {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryRosterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored bytes, for inspection.
    pub fn raw(&self, account_path: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .ok()
            .and_then(|files| files.get(account_path).cloned())
    }

    pub fn put_raw(&self, account_path: &str, bytes: Vec<u8>) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(account_path.to_string(), bytes);
        }
    }
}

impl RosterCacheStore for MemoryRosterCache {
    fn load(&self, account_path: &str) -> RosterSnapshot {
        let Ok(mut files) = self.files.lock() else {
            return RosterSnapshot::new();
        };
        let Some(bytes) = files.get(account_path) else {
            return RosterSnapshot::new();
        };
        match decode_snapshot(bytes) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("discarding cached roster for {}: {}", account_path, err);
                files.remove(account_path);
                RosterSnapshot::new()
            }
        }
    }

    fn persist(&self, account_path: &str, entries: &RosterSnapshot) -> Result<(), CacheError> {
        let mut files = self
            .files
            .lock()
            .map_err(|_| CacheError::Io(std::io::Error::other("poisoned")))?;
        if entries.is_empty() {
            files.remove(account_path);
        } else {
            files.insert(account_path.to_string(), encode_snapshot(entries)?);
        }
        Ok(())
    }
}

/// Cache stores per account, from the configured backend names in order.
pub fn cache_backends(config: &CoreConfig) -> BackendPool<dyn RosterCacheStore> {
    let mut pool = BackendPool::new();
    for name in config.cache_backends.iter() {
        match name.as_str() {
            CACHE_BACKEND_FILE => {
                let dir = config.cache_dir.clone();
                pool = pool.with_candidate(CACHE_BACKEND_FILE, move |_context| {
                    fs::create_dir_all(&dir).map_err(|err| {
                        CoreError::Cache(CacheError::Io(err))
                    })?;
                    let store: Arc<dyn RosterCacheStore> = Arc::new(FileRosterCache::new(&dir));
                    Ok(store)
                });
            }
            CACHE_BACKEND_MEMORY => {
                pool = pool.with_candidate(CACHE_BACKEND_MEMORY, |_context| {
                    let store: Arc<dyn RosterCacheStore> = Arc::new(MemoryRosterCache::new());
                    Ok(store)
                });
            }
            other => warn!("unknown cache backend {}", other),
        }
    }
    pool
}
