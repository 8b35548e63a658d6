//! Tiered on-disk store
//!
//! Values live as files under `<dbRoot>/{hot,warm,cold}/<sha256(key)>`.
//! The tiers differ only in placement directory; an entry's tier is decided
//! at `put` time from the age of whatever it replaces and is not revisited
//! afterwards. Metadata is memory-only: reads of unknown keys probe the
//! tier directories, so a restarted node heals its index lazily.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use lib_crypto::hashing::hash_sha256_hex;

use crate::error::StorageError;
use crate::now_millis;

const HOT_AGE_MS: u64 = 24 * 60 * 60 * 1_000;
const WARM_AGE_MS: u64 = 7 * 24 * 60 * 60 * 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    Hot,
    Warm,
    Cold,
}

impl StorageTier {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
        }
    }

    pub const ALL: [StorageTier; 3] = [Self::Hot, Self::Warm, Self::Cold];

    /// Age-based placement rule, applied on `put`.
    fn for_age(age_ms: u64) -> Self {
        if age_ms < HOT_AGE_MS {
            Self::Hot
        } else if age_ms < WARM_AGE_MS {
            Self::Warm
        } else {
            Self::Cold
        }
    }
}

/// In-memory record of a stored key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageKey {
    pub key: String,
    /// Bytes on disk (post-compression when enabled).
    pub size: u64,
    /// SHA-256 of the serialized (uncompressed) value, hex.
    pub hash: String,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    pub tier: StorageTier,
    pub compressed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Force a tier instead of the age rule.
    pub tier: Option<StorageTier>,
    /// Time-to-live; `None` never expires.
    pub ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub local_used: u64,
    pub local_total: u64,
    pub compression_ratio: f64,
    pub fragmentation_percent: f64,
    pub entries: usize,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    /// Hard cap on bytes across all tiers; 0 disables the cap.
    pub max_local_size: u64,
    pub compression_enabled: bool,
    /// In-memory value cache capacity, entries.
    pub cache_size: usize,
    /// Expired-entry sweep cadence.
    pub sweep_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/storage"),
            max_local_size: 0,
            compression_enabled: false,
            cache_size: 1_024,
            sweep_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    metadata: HashMap<String, StorageKey>,
    /// Decoded-value cache, FIFO-bounded by `cache_size`.
    values: HashMap<String, Value>,
    value_order: VecDeque<String>,
    used_bytes: u64,
    /// Uncompressed payload total, for the compression ratio.
    raw_bytes: u64,
}

pub struct TieredStore {
    config: StoreConfig,
    state: RwLock<StoreState>,
}

impl TieredStore {
    /// Open the store, creating tier directories and rebuilding byte
    /// accounting from whatever files already exist.
    pub async fn open(config: StoreConfig) -> Result<Self, StorageError> {
        let mut used_bytes = 0u64;
        for tier in StorageTier::ALL {
            let dir = config.db_path.join(tier.dir_name());
            tokio::fs::create_dir_all(&dir).await?;
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if let Ok(meta) = entry.metadata().await {
                    used_bytes += meta.len();
                }
            }
        }

        info!(path = %config.db_path.display(), used_bytes, "tiered store opened");
        Ok(Self {
            config,
            state: RwLock::new(StoreState {
                used_bytes,
                raw_bytes: used_bytes,
                ..Default::default()
            }),
        })
    }

    fn file_path(&self, tier: StorageTier, key: &str) -> PathBuf {
        self.config
            .db_path
            .join(tier.dir_name())
            .join(hash_sha256_hex(key.as_bytes()))
    }

    /// Store a value. Returns the recorded metadata.
    pub async fn put(&self, key: &str, value: &Value, opts: PutOptions) -> Result<StorageKey, StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidArgument("empty storage key".into()));
        }

        let raw = serde_json::to_vec(value)?;
        let hash = hash_sha256_hex(&raw);
        let compressed = self.config.compression_enabled;
        let bytes = if compressed { compress_prepend_size(&raw) } else { raw.clone() };
        let now = now_millis();

        let mut state = self.state.write().await;

        let previous = state.metadata.get(key).cloned();
        let tier = match opts.tier {
            Some(tier) => tier,
            None => {
                let age = previous
                    .as_ref()
                    .map(|p| now.saturating_sub(p.created_at))
                    .unwrap_or(0);
                StorageTier::for_age(age)
            }
        };

        let replaced_bytes = previous.as_ref().map(|p| p.size).unwrap_or(0);
        if self.config.max_local_size > 0 {
            let projected = state.used_bytes.saturating_sub(replaced_bytes) + bytes.len() as u64;
            if projected > self.config.max_local_size {
                return Err(StorageError::StorageFull {
                    used: state.used_bytes,
                    max: self.config.max_local_size,
                });
            }
        }

        // Tier may have changed relative to the entry being replaced
        if let Some(prev) = &previous {
            if prev.tier != tier {
                let _ = tokio::fs::remove_file(self.file_path(prev.tier, key)).await;
            }
            state.raw_bytes = state.raw_bytes.saturating_sub(Self::raw_size(prev));
        }

        tokio::fs::write(self.file_path(tier, key), &bytes).await?;

        let record = StorageKey {
            key: key.to_string(),
            size: bytes.len() as u64,
            hash,
            created_at: previous.as_ref().map(|p| p.created_at).unwrap_or(now),
            expires_at: opts.ttl_ms.map(|ttl| now + ttl),
            tier,
            compressed,
        };

        state.used_bytes = state.used_bytes.saturating_sub(replaced_bytes) + record.size;
        state.raw_bytes += raw.len() as u64;
        state.metadata.insert(key.to_string(), record.clone());
        Self::cache_value(&mut state, self.config.cache_size, key, value.clone());

        debug!(key, tier = tier.dir_name(), size = record.size, "stored value");
        Ok(record)
    }

    // Raw size is not kept per entry; approximate with disk size when the
    // entry predates this process.
    fn raw_size(record: &StorageKey) -> u64 {
        record.size
    }

    /// Fetch a value, honoring expiry. Unknown keys probe the tier
    /// directories so entries survive process restarts.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let now = now_millis();
        let mut state = self.state.write().await;

        if let Some(record) = state.metadata.get(key).cloned() {
            if record.expires_at.map(|at| at <= now).unwrap_or(false) {
                drop(state);
                self.delete(key).await?;
                return Ok(None);
            }

            if let Some(value) = state.values.get(key) {
                return Ok(Some(value.clone()));
            }

            return match tokio::fs::read(self.file_path(record.tier, key)).await {
                Ok(bytes) => {
                    let value = Self::decode(&bytes, record.compressed)?;
                    Self::cache_value(&mut state, self.config.cache_size, key, value.clone());
                    Ok(Some(value))
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Self-healing: drop the dangling record
                    warn!(key, "backing file missing; dropping metadata");
                    let size = record.size;
                    state.metadata.remove(key);
                    state.used_bytes = state.used_bytes.saturating_sub(size);
                    Ok(None)
                }
                Err(e) => Err(e.into()),
            };
        }

        // No metadata: probe each tier for a file left by a previous run
        for tier in StorageTier::ALL {
            let path = self.file_path(tier, key);
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            let compressed = self.config.compression_enabled;
            let value = Self::decode(&bytes, compressed)?;
            let created_at = file_mtime_millis(&path).await.unwrap_or(now);
            let raw = serde_json::to_vec(&value)?;

            let record = StorageKey {
                key: key.to_string(),
                size: bytes.len() as u64,
                hash: hash_sha256_hex(&raw),
                created_at,
                expires_at: None,
                tier,
                compressed,
            };
            state.metadata.insert(key.to_string(), record);
            Self::cache_value(&mut state, self.config.cache_size, key, value.clone());
            debug!(key, tier = tier.dir_name(), "rebuilt metadata from disk");
            return Ok(Some(value));
        }

        Ok(None)
    }

    fn decode(bytes: &[u8], compressed: bool) -> Result<Value, StorageError> {
        let raw = if compressed {
            match decompress_size_prepended(bytes) {
                Ok(raw) => raw,
                // Tolerate plain files written before compression was enabled
                Err(_) => bytes.to_vec(),
            }
        } else {
            bytes.to_vec()
        };
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Remove a key. Returns whether anything was deleted.
    pub async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let mut state = self.state.write().await;
        let Some(record) = state.metadata.remove(key) else {
            return Ok(false);
        };
        state.values.remove(key);
        state.value_order.retain(|k| k != key);
        state.used_bytes = state.used_bytes.saturating_sub(record.size);
        state.raw_bytes = state.raw_bytes.saturating_sub(Self::raw_size(&record));
        drop(state);

        match tokio::fs::remove_file(self.file_path(record.tier, key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(true)
    }

    /// All known keys under `prefix`, with their current values.
    pub async fn scan(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError> {
        let keys: Vec<String> = {
            let state = self.state.read().await;
            state
                .metadata
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect()
        };

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(&key).await? {
                out.push((key, value));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    pub async fn metadata(&self, key: &str) -> Option<StorageKey> {
        self.state.read().await.metadata.get(key).cloned()
    }

    /// Delete every expired entry. Returns the reaped count.
    pub async fn sweep_expired(&self, now_ms: u64) -> Result<usize, StorageError> {
        let expired: Vec<String> = {
            let state = self.state.read().await;
            state
                .metadata
                .values()
                .filter(|r| r.expires_at.map(|at| at <= now_ms).unwrap_or(false))
                .map(|r| r.key.clone())
                .collect()
        };

        for key in &expired {
            self.delete(key).await?;
        }
        if !expired.is_empty() {
            info!(reaped = expired.len(), "storage TTL sweep");
        }
        Ok(expired.len())
    }

    pub async fn stats(&self) -> StorageStats {
        let state = self.state.read().await;
        let entries = state.metadata.len();

        let compression_ratio = if self.config.compression_enabled && state.used_bytes > 0 {
            state.raw_bytes as f64 / state.used_bytes as f64
        } else {
            1.0
        };

        // Synthetic estimate: share of entries whose tier no longer matches
        // what the age rule would pick today.
        let now = now_millis();
        let misplaced = state
            .metadata
            .values()
            .filter(|r| StorageTier::for_age(now.saturating_sub(r.created_at)) != r.tier)
            .count();
        let fragmentation_percent = if entries == 0 {
            0.0
        } else {
            (misplaced as f64 / entries as f64) * 100.0
        };

        StorageStats {
            local_used: state.used_bytes,
            local_total: self.config.max_local_size,
            compression_ratio,
            fragmentation_percent,
            entries,
        }
    }

    fn cache_value(state: &mut StoreState, cache_size: usize, key: &str, value: Value) {
        if cache_size == 0 {
            return;
        }
        if !state.values.contains_key(key) {
            state.value_order.push_back(key.to_string());
        }
        state.values.insert(key.to_string(), value);
        while state.values.len() > cache_size {
            if let Some(evicted) = state.value_order.pop_front() {
                state.values.remove(&evicted);
            } else {
                break;
            }
        }
    }

    /// Background expiry sweep on the configured cadence.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        let interval = Duration::from_millis(store.config.sweep_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = store.sweep_expired(now_millis()).await {
                            warn!(error = %e, "storage sweep failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for TieredStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredStore")
            .field("db_path", &self.config.db_path)
            .finish()
    }
}

async fn file_mtime_millis(path: &Path) -> Option<u64> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    let mtime = meta.modified().ok()?;
    Some(mtime.duration_since(UNIX_EPOCH).ok()?.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn store(compression: bool) -> (TempDir, TieredStore) {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            db_path: dir.path().to_path_buf(),
            compression_enabled: compression,
            ..Default::default()
        };
        let store = TieredStore::open(config).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let (_dir, store) = store(false).await;
        let record = store
            .put("doc/1", &json!({"title": "hello"}), PutOptions::default())
            .await
            .unwrap();
        assert_eq!(record.tier, StorageTier::Hot);
        assert_eq!(
            store.get("doc/1").await.unwrap(),
            Some(json!({"title": "hello"}))
        );
    }

    #[tokio::test]
    async fn file_lands_in_tier_directory_under_hashed_name() {
        let (dir, store) = store(false).await;
        store.put("doc/1", &json!(1), PutOptions::default()).await.unwrap();
        let hashed = lib_crypto::hashing::hash_sha256_hex(b"doc/1");
        assert!(dir.path().join("hot").join(hashed).exists());
    }

    #[tokio::test]
    async fn explicit_tier_is_honored() {
        let (dir, store) = store(false).await;
        store
            .put(
                "archive/1",
                &json!("old"),
                PutOptions {
                    tier: Some(StorageTier::Cold),
                    ttl_ms: None,
                },
            )
            .await
            .unwrap();
        let hashed = lib_crypto::hashing::hash_sha256_hex(b"archive/1");
        assert!(dir.path().join("cold").join(hashed).exists());
        assert_eq!(store.get("archive/1").await.unwrap(), Some(json!("old")));
    }

    #[tokio::test]
    async fn expired_entry_reads_absent_and_is_deleted() {
        let (_dir, store) = store(false).await;
        store
            .put(
                "ephemeral",
                &json!(42),
                PutOptions {
                    tier: None,
                    ttl_ms: Some(0),
                },
            )
            .await
            .unwrap();
        // expires_at == now; read must treat it as gone
        assert_eq!(store.get("ephemeral").await.unwrap(), None);
        assert!(store.metadata("ephemeral").await.is_none());
    }

    #[tokio::test]
    async fn sweep_reaps_expired_entries() {
        let (_dir, store) = store(false).await;
        store
            .put("a", &json!(1), PutOptions { tier: None, ttl_ms: Some(10) })
            .await
            .unwrap();
        store.put("b", &json!(2), PutOptions::default()).await.unwrap();

        let reaped = store.sweep_expired(now_millis() + 20).await.unwrap();
        assert_eq!(reaped, 1);
        assert!(store.metadata("a").await.is_none());
        assert!(store.metadata("b").await.is_some());
    }

    #[tokio::test]
    async fn delete_unlinks_file() {
        let (dir, store) = store(false).await;
        store.put("doc/1", &json!(1), PutOptions::default()).await.unwrap();
        assert!(store.delete("doc/1").await.unwrap());
        assert!(!store.delete("doc/1").await.unwrap());

        let hashed = lib_crypto::hashing::hash_sha256_hex(b"doc/1");
        assert!(!dir.path().join("hot").join(hashed).exists());
    }

    #[tokio::test]
    async fn scan_filters_by_prefix() {
        let (_dir, store) = store(false).await;
        store.put("user/1", &json!(1), PutOptions::default()).await.unwrap();
        store.put("user/2", &json!(2), PutOptions::default()).await.unwrap();
        store.put("doc/1", &json!(3), PutOptions::default()).await.unwrap();

        let users = store.scan("user/").await.unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].0, "user/1");
        assert_eq!(users[1].0, "user/2");
    }

    #[tokio::test]
    async fn unknown_key_is_recovered_from_disk() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            db_path: dir.path().to_path_buf(),
            ..Default::default()
        };

        {
            let store = TieredStore::open(config.clone()).await.unwrap();
            store.put("persisted", &json!("survives"), PutOptions::default()).await.unwrap();
        }

        // Fresh instance has no metadata for the key but finds the file
        let store = TieredStore::open(config).await.unwrap();
        assert_eq!(store.get("persisted").await.unwrap(), Some(json!("survives")));
        assert!(store.metadata("persisted").await.is_some());
    }

    #[tokio::test]
    async fn compression_roundtrip_and_ratio() {
        let (_dir, store) = store(true).await;
        let value = json!(vec!["repetitive payload"; 100]);
        store.put("big", &value, PutOptions::default()).await.unwrap();

        assert_eq!(store.get("big").await.unwrap(), Some(value));
        let stats = store.stats().await;
        assert!(stats.compression_ratio > 1.0);
    }

    #[tokio::test]
    async fn hard_cap_surfaces_storage_full() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            db_path: dir.path().to_path_buf(),
            max_local_size: 8,
            ..Default::default()
        };
        let store = TieredStore::open(config).await.unwrap();

        let err = store
            .put("too-big", &json!("a very long payload"), PutOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::StorageFull { .. }));
    }

    #[tokio::test]
    async fn missing_backing_file_self_heals() {
        let (dir, store) = store(false).await;
        store.put("doc/1", &json!(1), PutOptions::default()).await.unwrap();

        // Clear the memory cache path by deleting the backing file directly,
        // then force a disk read with a fresh store instance sharing the dir.
        let hashed = lib_crypto::hashing::hash_sha256_hex(b"doc/1");
        std::fs::remove_file(dir.path().join("hot").join(hashed)).unwrap();

        let fresh = TieredStore::open(StoreConfig {
            db_path: dir.path().to_path_buf(),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(fresh.get("doc/1").await.unwrap(), None);
    }
}
