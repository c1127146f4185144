//! Thread-safe, memory-bounded cache for compiled scripts.
//!
//! [`ScriptCache`] is keyed by [`pipeline_types::ScriptFingerprint`] and
//! holds compiled artifacts in an LRU-ordered in-memory tier bounded by
//! both an entry-count budget and a memory budget (entries are evicted
//! oldest-first once either budget is exceeded) and, per entry, a TTL. An
//! optional disk tier persists entries best-effort under a configured
//! directory; a version mismatch between the on-disk format and the
//! cache's current artifact version is treated as a miss rather than an
//! error, so upgrading the compiler never trips over stale cache files.
//!
//! # Example
//!
//! ```
//! use pipeline_cache::ScriptCache;
//! use pipeline_types::ScriptFingerprint;
//!
//! let cache: ScriptCache<String> = ScriptCache::new(16, 1024 * 1024, 60_000);
//! let fp = ScriptFingerprint::compute(b"pipeline { }", b"cfg-v1");
//!
//! assert!(cache.get(&fp, 0).is_none());
//! cache.put(fp.clone(), "compiled-artifact".to_string(), 32, None, 0);
//! assert_eq!(cache.get(&fp, 1_000), Some("compiled-artifact".to_string()));
//! assert_eq!(cache.stats().hits, 1);
//! ```

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

use pipeline_types::{CacheEntry, CacheStats, ScriptFingerprint};

/// Default time-to-live applied to an entry when `put` doesn't specify one.
pub const DEFAULT_TTL_MS: u64 = 15 * 60 * 1000;
/// Format version stamped into persisted disk entries.
pub const DISK_FORMAT_VERSION: u32 = 1;

struct CacheInner<A> {
    entries: HashMap<ScriptFingerprint, CacheEntry<A>>,
    /// Least-recently-used ordering: front is least recently used.
    lru: VecDeque<ScriptFingerprint>,
    memory_used: usize,
    next_seq: u64,
    stats: CacheStats,
}

impl<A> CacheInner<A> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            lru: VecDeque::new(),
            memory_used: 0,
            next_seq: 0,
            stats: CacheStats::default(),
        }
    }

    fn touch(&mut self, fp: &ScriptFingerprint) {
        if let Some(pos) = self.lru.iter().position(|k| k == fp) {
            let key = self.lru.remove(pos).expect("position came from iter");
            self.lru.push_back(key);
        }
    }

    fn remove(&mut self, fp: &ScriptFingerprint) -> Option<CacheEntry<A>> {
        if let Some(pos) = self.lru.iter().position(|k| k == fp) {
            self.lru.remove(pos);
        }
        let removed = self.entries.remove(fp);
        if let Some(entry) = &removed {
            self.memory_used = self.memory_used.saturating_sub(entry.size_bytes);
        }
        removed
    }

    fn evict_to_budget(&mut self, max_entries: usize, max_memory_bytes: usize) {
        while self.entries.len() > max_entries || self.memory_used > max_memory_bytes {
            let Some(oldest) = self.lru.pop_front() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&oldest) {
                self.memory_used = self.memory_used.saturating_sub(entry.size_bytes);
                self.stats.evictions += 1;
            }
        }
    }
}

/// A memory-bounded, optionally disk-backed cache of compiled script
/// artifacts, keyed by content fingerprint.
pub struct ScriptCache<A> {
    inner: Mutex<CacheInner<A>>,
    max_entries: usize,
    max_memory_bytes: usize,
    default_ttl_ms: u64,
    disk_dir: Option<PathBuf>,
}

impl<A: Clone> ScriptCache<A> {
    /// An in-memory-only cache bounded by `max_entries` and
    /// `max_memory_bytes`, with `default_ttl_ms` applied to entries whose
    /// `put` doesn't override it. An entry is evicted, oldest-first, once
    /// either budget is exceeded.
    pub fn new(max_entries: usize, max_memory_bytes: usize, default_ttl_ms: u64) -> Self {
        Self {
            inner: Mutex::new(CacheInner::new()),
            max_entries,
            max_memory_bytes,
            default_ttl_ms,
            disk_dir: None,
        }
    }

    /// Enable the disk tier, persisting entries under `dir` (created lazily
    /// on first write).
    pub fn with_disk_dir(mut self, dir: PathBuf) -> Self {
        self.disk_dir = Some(dir);
        self
    }

    /// Look up `fingerprint`, promoting it to most-recently-used on a hit
    /// and falling through to the disk tier (if configured) on a memory
    /// miss. Expired entries are evicted and counted as misses.
    pub fn get(&self, fingerprint: &ScriptFingerprint, now_ms: u64) -> Option<A> {
        {
            let mut inner = self.inner.lock().expect("cache mutex poisoned");
            if let Some(entry) = inner.entries.get(fingerprint) {
                if entry.is_expired(now_ms) {
                    inner.remove(fingerprint);
                    inner.stats.misses += 1;
                } else {
                    let artifact = entry.artifact.clone();
                    inner.touch(fingerprint);
                    if let Some(entry) = inner.entries.get_mut(fingerprint) {
                        entry.last_access_ms = now_ms;
                        entry.access_count += 1;
                    }
                    inner.stats.hits += 1;
                    return Some(artifact);
                }
            } else {
                inner.stats.misses += 1;
            }
        }
        None
    }

    /// Insert or overwrite `fingerprint`'s entry, persisting to disk
    /// best-effort if a disk tier is configured. `size_bytes` is the
    /// caller's estimate, charged against the memory budget.
    pub fn put(
        &self,
        fingerprint: ScriptFingerprint,
        artifact: A,
        size_bytes: usize,
        ttl_ms: Option<u64>,
        now_ms: u64,
    ) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        inner.remove(&fingerprint);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            fingerprint.clone(),
            CacheEntry {
                artifact,
                inserted_seq: seq,
                inserted_at_ms: now_ms,
                last_access_ms: now_ms,
                access_count: 0,
                size_bytes,
                ttl_ms: ttl_ms.unwrap_or(self.default_ttl_ms),
            },
        );
        inner.lru.push_back(fingerprint);
        inner.memory_used += size_bytes;
        inner.stats.puts += 1;
        inner.evict_to_budget(self.max_entries, self.max_memory_bytes);
    }

    /// Drop every entry from the in-memory tier (the disk tier, if any, is
    /// left untouched — callers that want a full wipe should also remove
    /// the disk directory).
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        inner.entries.clear();
        inner.lru.clear();
        inner.memory_used = 0;
    }

    /// Number of entries currently held in memory.
    pub fn size(&self) -> usize {
        self.inner.lock().expect("cache mutex poisoned").entries.len()
    }

    /// A snapshot of cumulative hit/miss/eviction counters and current
    /// memory usage.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("cache mutex poisoned");
        CacheStats {
            memory_usage_bytes: inner.memory_used,
            ..inner.stats
        }
    }
}

impl<A> ScriptCache<A>
where
    A: Clone + serde::Serialize + serde::de::DeserializeOwned,
{
    /// Look up `fingerprint`, falling through to the disk tier on a memory
    /// miss and promoting a disk hit back into memory.
    pub fn get_with_disk_fallback(
        &self,
        fingerprint: &ScriptFingerprint,
        now_ms: u64,
    ) -> Option<A> {
        // Check memory without letting it record a miss yet: a disk hit
        // should count as one hit overall, not a miss followed by a hit.
        {
            let mut inner = self.inner.lock().expect("cache mutex poisoned");
            if let Some(entry) = inner.entries.get(fingerprint) {
                if !entry.is_expired(now_ms) {
                    let artifact = entry.artifact.clone();
                    inner.touch(fingerprint);
                    if let Some(entry) = inner.entries.get_mut(fingerprint) {
                        entry.last_access_ms = now_ms;
                        entry.access_count += 1;
                    }
                    inner.stats.hits += 1;
                    return Some(artifact);
                }
                inner.remove(fingerprint);
            }
        }

        let disk_hit = self.disk_dir.as_ref().and_then(|dir| {
            let path = dir.join(fingerprint.cache_file_name());
            let bytes = std::fs::read(&path).ok()?;
            let persisted: PersistedEntry<A> = serde_json::from_slice(&bytes).ok()?;
            (persisted.version == DISK_FORMAT_VERSION).then_some(persisted)
        });

        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        match disk_hit {
            Some(persisted) => {
                inner.stats.disk_hits += 1;
                inner.stats.hits += 1;
                drop(inner);
                self.put(
                    fingerprint.clone(),
                    persisted.artifact.clone(),
                    persisted.size_bytes,
                    Some(persisted.ttl_ms),
                    now_ms,
                );
                Some(persisted.artifact)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Persist `fingerprint`'s current in-memory entry to disk, best
    /// effort (I/O errors are swallowed — the disk tier is an optimization,
    /// not a durability guarantee).
    pub fn persist_to_disk(&self, fingerprint: &ScriptFingerprint) {
        let Some(dir) = &self.disk_dir else {
            return;
        };
        let entry = {
            let inner = self.inner.lock().expect("cache mutex poisoned");
            inner.entries.get(fingerprint).map(|e| PersistedEntry {
                version: DISK_FORMAT_VERSION,
                artifact: e.artifact.clone(),
                size_bytes: e.size_bytes,
                ttl_ms: e.ttl_ms,
            })
        };
        let Some(entry) = entry else {
            return;
        };
        let Ok(bytes) = serde_json::to_vec(&entry) else {
            return;
        };
        if std::fs::create_dir_all(dir).is_err() {
            return;
        }
        let path = dir.join(fingerprint.cache_file_name());
        let tmp_path = path.with_extension("tmp");
        if std::fs::write(&tmp_path, &bytes).is_ok() {
            let _ = std::fs::rename(&tmp_path, &path);
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct PersistedEntry<A> {
    version: u32,
    artifact: A,
    size_bytes: usize,
    ttl_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_hit_after_put() {
        let cache: ScriptCache<String> = ScriptCache::new(100, 4096, DEFAULT_TTL_MS);
        let fp = ScriptFingerprint::compute(b"script-a", b"cfg");

        assert!(cache.get(&fp, 0).is_none());
        cache.put(fp.clone(), "artifact".to_string(), 16, None, 0);
        assert_eq!(cache.get(&fp, 10), Some("artifact".to_string()));

        let stats = cache.stats();
        assert_eq!(stats.puts, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn expired_entry_is_treated_as_miss_and_evicted() {
        let cache: ScriptCache<String> = ScriptCache::new(100, 4096, 100);
        let fp = ScriptFingerprint::compute(b"script-b", b"cfg");
        cache.put(fp.clone(), "artifact".to_string(), 16, Some(100), 0);

        assert!(cache.get(&fp, 50).is_some());
        assert!(cache.get(&fp, 500).is_none());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn memory_budget_evicts_least_recently_used() {
        let cache: ScriptCache<String> = ScriptCache::new(100, 20, DEFAULT_TTL_MS);
        let fp_a = ScriptFingerprint::compute(b"a", b"cfg");
        let fp_b = ScriptFingerprint::compute(b"b", b"cfg");
        let fp_c = ScriptFingerprint::compute(b"c", b"cfg");

        cache.put(fp_a.clone(), "a".to_string(), 10, None, 0);
        cache.put(fp_b.clone(), "b".to_string(), 10, None, 1);
        // Touch `a` so `b` becomes the least-recently-used entry.
        assert!(cache.get(&fp_a, 2).is_some());
        cache.put(fp_c.clone(), "c".to_string(), 10, None, 3);

        assert!(cache.get(&fp_b, 4).is_none());
        assert!(cache.get(&fp_a, 5).is_some());
        assert!(cache.get(&fp_c, 6).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn entry_count_budget_evicts_least_recently_used() {
        // Seed scenario S3: maxEntries=3; put A, B, C; get(A); put D.
        // get(B) then misses; get(A), get(C), get(D) all hit.
        let cache: ScriptCache<String> = ScriptCache::new(3, usize::MAX, DEFAULT_TTL_MS);
        let fp_a = ScriptFingerprint::compute(b"a", b"cfg");
        let fp_b = ScriptFingerprint::compute(b"b", b"cfg");
        let fp_c = ScriptFingerprint::compute(b"c", b"cfg");
        let fp_d = ScriptFingerprint::compute(b"d", b"cfg");

        cache.put(fp_a.clone(), "A".to_string(), 1, None, 0);
        cache.put(fp_b.clone(), "B".to_string(), 1, None, 1);
        cache.put(fp_c.clone(), "C".to_string(), 1, None, 2);
        assert!(cache.get(&fp_a, 3).is_some());
        cache.put(fp_d.clone(), "D".to_string(), 1, None, 4);

        assert!(cache.get(&fp_b, 5).is_none());
        assert!(cache.get(&fp_a, 6).is_some());
        assert!(cache.get(&fp_c, 7).is_some());
        assert!(cache.get(&fp_d, 8).is_some());
        assert_eq!(cache.size(), 3);
    }

    #[test]
    fn clear_empties_the_memory_tier() {
        let cache: ScriptCache<String> = ScriptCache::new(100, 4096, DEFAULT_TTL_MS);
        let fp = ScriptFingerprint::compute(b"script-c", b"cfg");
        cache.put(fp.clone(), "artifact".to_string(), 16, None, 0);
        cache.clear();
        assert_eq!(cache.size(), 0);
        assert!(cache.get(&fp, 1).is_none());
    }

    #[test]
    fn disk_tier_serves_after_memory_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let cache: ScriptCache<String> =
            ScriptCache::new(100, 16, DEFAULT_TTL_MS).with_disk_dir(dir.path().to_path_buf());
        let fp = ScriptFingerprint::compute(b"script-d", b"cfg");

        cache.put(fp.clone(), "artifact".to_string(), 16, None, 0);
        cache.persist_to_disk(&fp);
        cache.clear();
        assert!(cache.get(&fp, 1).is_none());

        let hit = cache.get_with_disk_fallback(&fp, 2);
        assert_eq!(hit, Some("artifact".to_string()));
        assert_eq!(cache.stats().disk_hits, 1);
    }

    #[test]
    fn disk_version_mismatch_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(
            ScriptFingerprint::compute(b"script-e", b"cfg").cache_file_name(),
        );
        std::fs::write(&path, br#"{"version":999,"artifact":"x","size_bytes":1,"ttl_ms":1000}"#)
            .unwrap();

        let cache: ScriptCache<String> =
            ScriptCache::new(100, 4096, DEFAULT_TTL_MS).with_disk_dir(dir.path().to_path_buf());
        let fp = ScriptFingerprint::compute(b"script-e", b"cfg");
        assert!(cache.get_with_disk_fallback(&fp, 0).is_none());
    }
}
