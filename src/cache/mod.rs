//! Local response cache
//!
//! Caches message lists, message details, metadata-only messages and label
//! lists per account with a TTL per entry kind. Mutations never update
//! entries in place; callers invalidate and let the next read repopulate.
//!
//! The cache never fails a caller: store errors are logged and read as a
//! miss, and a disabled cache misses every read and ignores every write.
//!
//! Every invalidation bumps a per-account, per-kind generation counter.
//! Writers pass the [`Generation`] they captured before their remote read,
//! and a write whose generation has moved on is dropped, so a read that was
//! in flight during a mutation cannot put the pre-mutation state back.

mod file;
#[cfg(feature = "cache")]
mod sqlite;
mod store;

pub use file::FileStore;
#[cfg(feature = "cache")]
pub use sqlite::SqliteStore;
pub use store::{CacheKey, CacheStore, EntryKind, KeyScope, MemoryStore, StoredEntry};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

use crate::config::{CacheBackend, CacheConfig};
use crate::models::{Label, Message, MessageRef};

/// Time-to-live per entry kind, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub list: u64,
    pub message: u64,
    pub metadata: u64,
    pub labels: u64,
}

impl CacheTtls {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            list: config.list_ttl_secs,
            message: config.message_ttl_secs,
            metadata: config.metadata_ttl_secs,
            labels: config.label_ttl_secs,
        }
    }

    pub fn for_kind(&self, kind: EntryKind) -> u64 {
        match kind {
            EntryKind::MessageList => self.list,
            EntryKind::MessageDetail => self.message,
            EntryKind::MessageMetadata => self.metadata,
            EntryKind::LabelList => self.labels,
        }
    }
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

/// Invalidation counters of one account, captured before a remote read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Generation([u64; 4]);

impl Generation {
    fn slot(kind: EntryKind) -> usize {
        match kind {
            EntryKind::MessageList => 0,
            EntryKind::MessageDetail => 1,
            EntryKind::MessageMetadata => 2,
            EntryKind::LabelList => 3,
        }
    }

    fn of(&self, kind: EntryKind) -> u64 {
        self.0[Self::slot(kind)]
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct HitCounters {
    hits: u64,
    misses: u64,
}

/// Cache statistics for one account
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub account: String,
    pub enabled: bool,
    pub backend: String,
    pub list_entries: usize,
    pub message_entries: usize,
    pub metadata_entries: usize,
    pub label_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

impl CacheStats {
    pub fn total_entries(&self) -> usize {
        self.list_entries + self.message_entries + self.metadata_entries + self.label_entries
    }
}

/// Key material for a list query; label order and duplicates do not matter
pub fn list_key_material(query: &str, label_ids: &[String]) -> String {
    let labels: BTreeSet<&str> = label_ids.iter().map(String::as_str).collect();
    let labels: Vec<&str> = labels.into_iter().collect();
    format!("{}\u{1f}{}", query, labels.join(","))
}

/// Response cache shared by every service handle
///
/// Cloning is cheap and clones share the store and counters.
#[derive(Clone)]
pub struct ResponseCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    enabled: bool,
    store: Arc<dyn CacheStore>,
    ttls: CacheTtls,
    counters: Mutex<HashMap<String, HitCounters>>,
    generations: Mutex<HashMap<String, Generation>>,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>, ttls: CacheTtls) -> Self {
        Self::build(true, store, ttls)
    }

    /// A cache that misses every read and ignores every write
    pub fn disabled() -> Self {
        Self::build(false, Arc::new(MemoryStore::new(1)), CacheTtls::default())
    }

    /// Build the configured backing store
    ///
    /// A backing that cannot be opened leaves the cache disabled.
    pub fn from_config(config: &CacheConfig) -> Self {
        if !config.enabled {
            debug!("Response cache disabled by configuration");
            return Self::disabled();
        }

        let ttls = CacheTtls::from_config(config);
        match config.backend {
            CacheBackend::Memory => Self::new(Arc::new(MemoryStore::new(config.capacity)), ttls),
            CacheBackend::File => Self::new(Arc::new(FileStore::new(&config.dir)), ttls),
            #[cfg(feature = "cache")]
            CacheBackend::Sqlite => match SqliteStore::open(&config.dir.join("cache.db")) {
                Ok(store) => Self::new(Arc::new(store), ttls),
                Err(e) => {
                    warn!("Could not open sqlite cache in {:?}, caching disabled: {}", config.dir, e);
                    Self::disabled()
                }
            },
            #[cfg(not(feature = "cache"))]
            CacheBackend::Sqlite => {
                warn!("Sqlite cache backend requires the `cache` feature, caching disabled");
                Self::disabled()
            }
        }
    }

    fn build(enabled: bool, store: Arc<dyn CacheStore>, ttls: CacheTtls) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                enabled,
                store,
                ttls,
                counters: Mutex::new(HashMap::new()),
                generations: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    pub fn ttls(&self) -> CacheTtls {
        self.inner.ttls
    }

    fn count_lookup(&self, account: &str, hit: bool) {
        let mut counters = self
            .inner
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = counters.entry(account.to_string()).or_default();
        if hit {
            entry.hits += 1;
        } else {
            entry.misses += 1;
        }
    }

    /// Snapshot to pass to the `set_*` methods after a remote read
    ///
    /// Take it before the read starts.
    pub fn generation(&self, account: &str) -> Generation {
        self.inner
            .generations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(account)
            .copied()
            .unwrap_or_default()
    }

    fn bump(&self, account: &str, kinds: &[EntryKind]) {
        let mut generations = self
            .inner
            .generations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let generation = generations.entry(account.to_string()).or_default();
        for kind in kinds {
            generation.0[Generation::slot(*kind)] += 1;
        }
    }

    fn is_current(&self, key: &CacheKey, seen: Generation) -> bool {
        self.generation(&key.account).of(key.kind) == seen.of(key.kind)
    }

    async fn discard(&self, key: &CacheKey) {
        if let Err(e) = self.inner.store.delete(key).await {
            warn!("Failed to remove cache entry {}/{}: {}", key.account, key.kind, e);
        }
    }

    async fn read<T: DeserializeOwned>(&self, key: CacheKey) -> Option<T> {
        if !self.inner.enabled {
            return None;
        }

        let value = match self.inner.store.get(&key).await {
            Ok(Some(entry)) if entry.is_expired() => {
                trace!("Cache entry expired: {}/{}", key.account, key.kind);
                self.discard(&key).await;
                None
            }
            Ok(Some(entry)) => match serde_json::from_value(entry.value) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("Discarding undecodable cache entry {}/{}: {}", key.account, key.kind, e);
                    self.discard(&key).await;
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Cache read failed for {}/{}, treating as miss: {}", key.account, key.kind, e);
                None
            }
        };

        trace!(
            "Cache {} for {}/{}",
            if value.is_some() { "hit" } else { "miss" },
            key.account,
            key.kind
        );
        self.count_lookup(&key.account, value.is_some());
        value
    }

    async fn write<T: Serialize + ?Sized>(&self, key: CacheKey, value: &T, seen: Generation) {
        if !self.inner.enabled {
            return;
        }
        if !self.is_current(&key, seen) {
            trace!("Dropping cache write invalidated in flight: {}/{}", key.account, key.kind);
            return;
        }

        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                warn!("Could not encode cache entry {}/{}: {}", key.account, key.kind, e);
                return;
            }
        };
        let entry = StoredEntry::new(value, self.inner.ttls.for_kind(key.kind));
        if let Err(e) = self.inner.store.set(&key, entry).await {
            warn!("Cache write failed for {}/{}: {}", key.account, key.kind, e);
            return;
        }
        // An invalidation may have run while the entry was being stored
        if !self.is_current(&key, seen) {
            self.discard(&key).await;
        }
    }

    async fn remove_scope(&self, scope: KeyScope<'_>) -> usize {
        if !self.inner.enabled {
            return 0;
        }
        match self.inner.store.delete_scope(scope).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Cache invalidation failed for {:?}: {}", scope, e);
                0
            }
        }
    }

    pub async fn get_list(
        &self,
        account: &str,
        query: &str,
        label_ids: &[String],
    ) -> Option<Vec<MessageRef>> {
        let material = list_key_material(query, label_ids);
        self.read(CacheKey::new(account, EntryKind::MessageList, material))
            .await
    }

    pub async fn set_list(
        &self,
        account: &str,
        query: &str,
        label_ids: &[String],
        messages: &[MessageRef],
        seen: Generation,
    ) {
        let material = list_key_material(query, label_ids);
        self.write(CacheKey::new(account, EntryKind::MessageList, material), messages, seen)
            .await
    }

    /// Look up a message detail, or its metadata-only form
    pub async fn get_message(&self, account: &str, id: &str, metadata_only: bool) -> Option<Message> {
        let kind = if metadata_only {
            EntryKind::MessageMetadata
        } else {
            EntryKind::MessageDetail
        };
        self.read(CacheKey::new(account, kind, id)).await
    }

    /// Store a message; without a body it is stored as metadata only
    pub async fn set_message(
        &self,
        account: &str,
        id: &str,
        message: &Message,
        has_body: bool,
        seen: Generation,
    ) {
        let kind = if has_body {
            EntryKind::MessageDetail
        } else {
            EntryKind::MessageMetadata
        };
        self.write(CacheKey::new(account, kind, id), message, seen).await
    }

    pub async fn get_labels(&self, account: &str) -> Option<Vec<Label>> {
        self.read(CacheKey::new(account, EntryKind::LabelList, ""))
            .await
    }

    pub async fn set_labels(&self, account: &str, labels: &[Label], seen: Generation) {
        self.write(CacheKey::new(account, EntryKind::LabelList, ""), labels, seen)
            .await
    }

    /// Drop the detail and metadata entries of one message
    ///
    /// Writes captured before this call are dropped for every message of the
    /// account, not only `id`.
    pub async fn invalidate_message(&self, account: &str, id: &str) {
        self.bump(account, &[EntryKind::MessageDetail, EntryKind::MessageMetadata]);
        if !self.inner.enabled {
            return;
        }
        for kind in [EntryKind::MessageDetail, EntryKind::MessageMetadata] {
            self.discard(&CacheKey::new(account, kind, id)).await;
        }
        trace!("Invalidated cached message {}/{}", account, id);
    }

    /// Drop every cached message detail and metadata entry of an account
    pub async fn invalidate_messages(&self, account: &str) {
        self.bump(account, &[EntryKind::MessageDetail, EntryKind::MessageMetadata]);
        let mut removed = 0;
        for kind in [EntryKind::MessageDetail, EntryKind::MessageMetadata] {
            removed += self.remove_scope(KeyScope::Kind(account, kind)).await;
        }
        trace!("Invalidated {} cached messages for {}", removed, account);
    }

    /// Drop every cached list of an account
    pub async fn invalidate_lists(&self, account: &str) {
        self.bump(account, &[EntryKind::MessageList]);
        let removed = self
            .remove_scope(KeyScope::Kind(account, EntryKind::MessageList))
            .await;
        trace!("Invalidated {} cached lists for {}", removed, account);
    }

    pub async fn invalidate_labels(&self, account: &str) {
        self.bump(account, &[EntryKind::LabelList]);
        self.remove_scope(KeyScope::Kind(account, EntryKind::LabelList))
            .await;
    }

    /// Drop everything cached for an account, returning how many entries went
    pub async fn invalidate_account(&self, account: &str) -> usize {
        self.bump(account, &EntryKind::ALL);
        let removed = self.remove_scope(KeyScope::Account(account)).await;
        debug!("Cleared {} cache entries for {}", removed, account);
        removed
    }

    pub async fn get_stats(&self, account: &str) -> CacheStats {
        let counters = self
            .inner
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(account)
            .copied()
            .unwrap_or_default();

        let mut stats = CacheStats {
            account: account.to_string(),
            enabled: self.inner.enabled,
            backend: self.inner.store.name().to_string(),
            list_entries: 0,
            message_entries: 0,
            metadata_entries: 0,
            label_entries: 0,
            hits: counters.hits,
            misses: counters.misses,
            hit_rate: 0.0,
        };

        let lookups = counters.hits + counters.misses;
        if lookups > 0 {
            stats.hit_rate = counters.hits as f64 / lookups as f64;
        }

        if self.inner.enabled {
            for kind in EntryKind::ALL {
                let count = match self.inner.store.count(KeyScope::Kind(account, kind)).await {
                    Ok(count) => count,
                    Err(e) => {
                        warn!("Could not count cache entries for {}/{}: {}", account, kind, e);
                        0
                    }
                };
                match kind {
                    EntryKind::MessageList => stats.list_entries = count,
                    EntryKind::MessageDetail => stats.message_entries = count,
                    EntryKind::MessageMetadata => stats.metadata_entries = count,
                    EntryKind::LabelList => stats.label_entries = count,
                }
            }
        }

        stats
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("enabled", &self.inner.enabled)
            .field("backend", &self.inner.store.name())
            .field("ttls", &self.inner.ttls)
            .finish()
    }
}
