//! Key-value backing for the response cache

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use crate::error::{GmailError, Result};

/// Shape of a cached response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    MessageList,
    MessageDetail,
    MessageMetadata,
    LabelList,
}

impl EntryKind {
    pub const ALL: [EntryKind; 4] = [
        EntryKind::MessageList,
        EntryKind::MessageDetail,
        EntryKind::MessageMetadata,
        EntryKind::LabelList,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::MessageList => "message_list",
            EntryKind::MessageDetail => "message_detail",
            EntryKind::MessageMetadata => "message_metadata",
            EntryKind::LabelList => "label_list",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite cache key: `(account, kind, key material)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub account: String,
    pub kind: EntryKind,
    pub material: String,
}

impl CacheKey {
    pub fn new(account: &str, kind: EntryKind, material: impl Into<String>) -> Self {
        Self {
            account: account.to_string(),
            kind,
            material: material.into(),
        }
    }

    pub fn in_scope(&self, scope: &KeyScope<'_>) -> bool {
        match scope {
            KeyScope::Account(account) => self.account == *account,
            KeyScope::Kind(account, kind) => self.account == *account && self.kind == *kind,
        }
    }
}

/// Set of keys addressed by bulk operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScope<'a> {
    /// Every entry of an account
    Account(&'a str),
    /// Every entry of one kind for an account
    Kind(&'a str, EntryKind),
}

/// A stored value with its creation time and time-to-live
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub value: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl StoredEntry {
    pub fn new(value: serde_json::Value, ttl_secs: u64) -> Self {
        Self {
            value,
            created_at: Utc::now(),
            ttl_secs,
        }
    }

    /// An entry is expired once its age reaches the TTL
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::seconds(self.ttl_secs.min(i64::MAX as u64) as i64);
        now.signed_duration_since(self.created_at) >= ttl
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Key-value store behind [`ResponseCache`](super::ResponseCache)
///
/// Implementations only store and remove; TTL and hit accounting are handled
/// by the response cache.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Short name for logs and stats
    fn name(&self) -> &'static str;

    async fn get(&self, key: &CacheKey) -> Result<Option<StoredEntry>>;

    async fn set(&self, key: &CacheKey, entry: StoredEntry) -> Result<()>;

    /// Returns whether an entry was removed
    async fn delete(&self, key: &CacheKey) -> Result<bool>;

    /// Remove every entry in `scope`, returning how many were removed
    async fn delete_scope(&self, scope: KeyScope<'_>) -> Result<usize>;

    async fn count(&self, scope: KeyScope<'_>) -> Result<usize>;
}

/// Bounded in-memory store with least-recently-used eviction
pub struct MemoryStore {
    entries: Mutex<LruCache<CacheKey, StoredEntry>>,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LruCache<CacheKey, StoredEntry>>> {
        self.entries
            .lock()
            .map_err(|e| GmailError::CacheError(format!("memory store lock poisoned: {}", e)))
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<StoredEntry>> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn set(&self, key: &CacheKey, entry: StoredEntry) -> Result<()> {
        self.lock()?.put(key.clone(), entry);
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.lock()?.pop(key).is_some())
    }

    async fn delete_scope(&self, scope: KeyScope<'_>) -> Result<usize> {
        let mut entries = self.lock()?;
        let doomed: Vec<CacheKey> = entries
            .iter()
            .filter(|(key, _)| key.in_scope(&scope))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        Ok(doomed.len())
    }

    async fn count(&self, scope: KeyScope<'_>) -> Result<usize> {
        Ok(self
            .lock()?
            .iter()
            .filter(|(key, _)| key.in_scope(&scope))
            .count())
    }
}
