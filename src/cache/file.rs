//! File-backed cache store
//!
//! Layout: `<dir>/<account>/<kind>/<digest>.json`, where the account segment
//! is base64url-encoded and the digest is a 64-bit FNV-1a hash of the key
//! material. Each file carries the full key so a digest collision reads as a
//! miss rather than someone else's entry.
//!
//! Writes go to a uniquely named temporary file in the same directory and
//! are renamed into place, so concurrent writers of one key never share a
//! temporary path and readers never see a half-written file.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

use super::store::{CacheKey, CacheStore, EntryKind, KeyScope, StoredEntry};
use crate::error::{GmailError, Result};

#[derive(Debug, Serialize, Deserialize)]
struct FileRecord {
    key: CacheKey,
    #[serde(flatten)]
    entry: StoredEntry,
}

/// One JSON file per cache entry under a root directory
pub struct FileStore {
    root: PathBuf,
}

fn fnv1a64(data: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    data.iter()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(PRIME))
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn account_dir(&self, account: &str) -> PathBuf {
        let encoded = if account.is_empty() {
            "_".to_string()
        } else {
            URL_SAFE_NO_PAD.encode(account.as_bytes())
        };
        self.root.join(encoded)
    }

    fn kind_dir(&self, account: &str, kind: EntryKind) -> PathBuf {
        self.account_dir(account).join(kind.as_str())
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.kind_dir(&key.account, key.kind)
            .join(format!("{:016x}.json", fnv1a64(key.material.as_bytes())))
    }

    fn scope_dir(&self, scope: &KeyScope<'_>) -> PathBuf {
        match scope {
            KeyScope::Account(account) => self.account_dir(account),
            KeyScope::Kind(account, kind) => self.kind_dir(account, *kind),
        }
    }
}

/// Write `bytes` to `path` through a fresh temporary file in `dir`
fn write_atomically(dir: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_data()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

async fn count_json_files(dir: &Path) -> Result<usize> {
    let mut pending = vec![dir.to_path_buf()];
    let mut count = 0;

    while let Some(current) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
            } else if path.extension().map_or(false, |ext| ext == "json") {
                count += 1;
            }
        }
    }

    Ok(count)
}

#[async_trait]
impl CacheStore for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<StoredEntry>> {
        let content = match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: FileRecord = serde_json::from_str(&content)?;
        if record.key != *key {
            debug!("Cache file digest collision for {:?}", key);
            return Ok(None);
        }
        Ok(Some(record.entry))
    }

    async fn set(&self, key: &CacheKey, entry: StoredEntry) -> Result<()> {
        let path = self.path_for(key);
        let dir = self.kind_dir(&key.account, key.kind);
        tokio::fs::create_dir_all(&dir).await?;
        let record = FileRecord {
            key: key.clone(),
            entry,
        };
        let json = serde_json::to_vec(&record)?;

        tokio::task::spawn_blocking(move || write_atomically(&dir, &path, &json))
            .await
            .map_err(|e| GmailError::CacheError(format!("cache writer task failed: {}", e)))??;
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_scope(&self, scope: KeyScope<'_>) -> Result<usize> {
        let dir = self.scope_dir(&scope);
        let removed = count_json_files(&dir).await?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(removed),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn count(&self, scope: KeyScope<'_>) -> Result<usize> {
        count_json_files(&self.scope_dir(&scope)).await
    }
}
