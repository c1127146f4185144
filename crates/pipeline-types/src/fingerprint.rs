//! Content-addressed identity for compiled scripts, and the shape of a
//! single cache entry / cache statistics snapshot.

use sha2::{Digest, Sha256};

/// A content-addressed key: the SHA-256 of the script source bytes combined
/// with a stable hash of the compilation configuration. Two scripts with
/// byte-equal source and configuration always produce equal fingerprints;
/// distinct configurations always produce distinct fingerprints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptFingerprint {
    source_hash: [u8; 32],
    config_hash: [u8; 32],
}

impl ScriptFingerprint {
    /// Compute the fingerprint of `source` under `config_key`, an opaque,
    /// pre-serialized representation of the compilation configuration
    /// (the caller is responsible for producing a stable encoding, e.g. by
    /// sorting map keys before serializing).
    pub fn compute(source: &[u8], config_key: &[u8]) -> Self {
        let source_hash = Sha256::digest(source).into();
        let mut config_hasher = Sha256::new();
        config_hasher.update(config_key);
        let config_hash = config_hasher.finalize().into();
        Self {
            source_hash,
            config_hash,
        }
    }

    /// Hex-encoded source hash, used as the first half of the persisted
    /// cache filename (`script_<sourceHash>_<configHash>.cache`).
    pub fn source_hash_hex(&self) -> String {
        hex::encode(self.source_hash)
    }

    /// Hex-encoded configuration hash, the second half of the filename.
    pub fn config_hash_hex(&self) -> String {
        hex::encode(self.config_hash)
    }

    /// The filename this fingerprint maps to under a disk cache root.
    pub fn cache_file_name(&self) -> String {
        format!(
            "script_{}_{}.cache",
            self.source_hash_hex(),
            self.config_hash_hex()
        )
    }
}

/// A single entry in the script compilation cache, generic over the
/// opaque compiled-artifact type `A`.
#[derive(Debug, Clone)]
pub struct CacheEntry<A> {
    /// The compiled artifact.
    pub artifact: A,
    /// Monotonic insertion sequence number, used to break LRU ties
    /// (older insertion order evicted first).
    pub inserted_seq: u64,
    /// Wall-clock insertion time, in milliseconds since an arbitrary epoch
    /// chosen by the cache (not necessarily UNIX time) — used for TTL checks.
    pub inserted_at_ms: u64,
    /// Wall-clock time of the most recent access, used for LRU ordering.
    pub last_access_ms: u64,
    /// Number of times this entry has been read.
    pub access_count: u64,
    /// Approximate size of the entry, charged against the memory budget.
    pub size_bytes: usize,
    /// Time-to-live for this entry, in milliseconds.
    pub ttl_ms: u64,
}

impl<A> CacheEntry<A> {
    /// Whether this entry has outlived its TTL as of `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.inserted_at_ms) > self.ttl_ms
    }
}

/// Point-in-time statistics for a script compilation cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of `get` calls that found a live entry.
    pub hits: u64,
    /// Number of `get` calls that found nothing (or an expired entry).
    pub misses: u64,
    /// Number of `put` calls.
    pub puts: u64,
    /// Number of entries evicted to respect LRU / memory bounds.
    pub evictions: u64,
    /// Number of hits served from the disk tier (and promoted to memory).
    pub disk_hits: u64,
    /// Current approximate memory usage of the in-memory tier, in bytes.
    pub memory_usage_bytes: usize,
}

impl CacheStats {
    /// `hits / (hits + misses)`, or `0.0` when nothing has been requested yet.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
