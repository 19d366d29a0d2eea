//! Optional shared key/value cache with TTL, falling back to an in-memory
//! LRU (`spec.md` §4.3). The cache never holds the only copy of any
//! authoritative data — every entry is reconstructible by rerunning the RAG
//! pipeline.
//!
//! Grounded on the `reflex-cache` example crate's choice of [`moka`] for a
//! concurrent TTL+LRU cache serving exactly this role ("high-speed semantic
//! cache for LLM responses"), and on the re-architecture note in
//! `spec.md` §9: cache keys are composite (`subject_id`, `vkp_version`,
//! `question_hash`) with a secondary index so subject-scoped invalidation
//! is an O(matching keys) structured lookup, not a string-pattern scan.

use dashmap::DashMap;
use moka::Expiry;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tutor_types::SubjectId;

/// A deterministic cache key: SHA-256 of the normalized question,
/// concatenated with the subject id and the installed VKP version string
/// (`spec.md` §4.2 step 2, §8 property 10).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Builds the deterministic key for `(question, subject_id, installed_version)`.
    #[must_use]
    pub fn new(question: &str, subject_id: SubjectId, installed_version: &str) -> Self {
        let normalized = normalize_question(question);
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update(subject_id.to_le_bytes());
        hasher.update(installed_version.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Lowercases and collapses whitespace, matching `spec.md` §4.2's cache-key
/// normalization rule exactly so equal questions always hash equal
/// (`spec.md` §8 property 10).
#[must_use]
pub fn normalize_question(question: &str) -> String {
    question
        .trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Cache statistics (`spec.md` §4.3).
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entry_count: u64,
    pub hit_count: u64,
    pub miss_count: u64,
}

/// Key/value cache contract. Errors from this trait are never surfaced to
/// RAG pipeline callers (`spec.md` §4.2 failure policy: "Cache errors are
/// never surfaced; log and proceed") — the trait itself is therefore
/// infallible, with failures handled (logged) inside implementations.
pub trait Cache: Send + Sync {
    /// Returns the cached value for `key`, if present and unexpired.
    fn get(&self, key: &CacheKey) -> Option<String>;

    /// Stores `value` under `key` for `subject_id`/`version`, expiring
    /// after `ttl`.
    fn set(&self, key: CacheKey, subject_id: SubjectId, version: String, value: String, ttl: Duration);

    /// Removes a single entry.
    fn delete(&self, key: &CacheKey);

    /// Invalidates every entry scoped to `subject_id` whose encoded version
    /// is exactly `version` — used after a VKP install so stale answers
    /// from the previous version become unreachable (`spec.md` §8 property 11).
    fn invalidate_subject_version(&self, subject_id: SubjectId, version: &str);

    /// Invalidates every entry for `subject_id`, regardless of version —
    /// the coarser admin-facing `cache_invalidate` operation (`spec.md` §6).
    fn invalidate_subject(&self, subject_id: SubjectId);

    /// Current cache statistics.
    fn stats(&self) -> CacheStats;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubjectVersion {
    subject_id: SubjectId,
    version: String,
}

/// Cached value paired with the TTL it was stored with, so each entry can
/// expire on its own schedule rather than a cache-wide default.
#[derive(Debug, Clone)]
struct CachedEntry {
    value: String,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<CacheKey, CachedEntry> for PerEntryTtl {
    fn expire_after_create(&self, _key: &CacheKey, value: &CachedEntry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &CachedEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// [`moka::sync::Cache`]-backed implementation with a secondary
/// `(subject_id, version) -> keys` index to make subject/version-scoped
/// invalidation efficient without pattern-matching string keys.
pub struct MokaCache {
    entries: moka::sync::Cache<CacheKey, CachedEntry>,
    by_scope: Arc<DashMap<SubjectVersion, Vec<CacheKey>>>,
    key_scope: Arc<DashMap<CacheKey, SubjectVersion>>,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl MokaCache {
    /// Creates a cache bounded to `max_capacity` entries. `default_ttl` sets
    /// the cache's notion of "a long time" for capacity planning only — the
    /// actual expiry of each entry is whatever `ttl` is passed to
    /// [`Cache::set`] for it.
    #[must_use]
    pub fn new(max_capacity: u64, default_ttl: Duration) -> Self {
        let _ = default_ttl;
        let by_scope: Arc<DashMap<SubjectVersion, Vec<CacheKey>>> = Arc::new(DashMap::new());
        let key_scope: Arc<DashMap<CacheKey, SubjectVersion>> = Arc::new(DashMap::new());
        let eviction_scope = key_scope.clone();
        let eviction_index = by_scope.clone();
        let entries = moka::sync::Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .eviction_listener(move |key: Arc<CacheKey>, _value, _cause| {
                if let Some((_, scope)) = eviction_scope.remove(key.as_ref()) {
                    if let Some(mut keys) = eviction_index.get_mut(&scope) {
                        keys.retain(|k| k != key.as_ref());
                    }
                }
            })
            .build();
        Self {
            entries,
            by_scope,
            key_scope,
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
        }
    }
}

impl Cache for MokaCache {
    fn get(&self, key: &CacheKey) -> Option<String> {
        match self.entries.get(key) {
            Some(entry) => {
                self.hit_count.fetch_add(1, Ordering::Relaxed);
                Some(entry.value)
            }
            None => {
                self.miss_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn set(&self, key: CacheKey, subject_id: SubjectId, version: String, value: String, ttl: Duration) {
        let scope = SubjectVersion { subject_id, version };
        self.by_scope.entry(scope.clone()).or_default().push(key.clone());
        self.key_scope.insert(key.clone(), scope);
        self.entries.insert(key, CachedEntry { value, ttl });
    }

    fn delete(&self, key: &CacheKey) {
        self.entries.invalidate(key);
        if let Some((_, scope)) = self.key_scope.remove(key) {
            if let Some(mut keys) = self.by_scope.get_mut(&scope) {
                keys.retain(|k| k != key);
            }
        }
    }

    fn invalidate_subject_version(&self, subject_id: SubjectId, version: &str) {
        let scope = SubjectVersion {
            subject_id,
            version: version.to_string(),
        };
        if let Some((_, keys)) = self.by_scope.remove(&scope) {
            for key in keys {
                self.entries.invalidate(&key);
                self.key_scope.remove(&key);
            }
        }
    }

    fn invalidate_subject(&self, subject_id: SubjectId) {
        let scopes: Vec<SubjectVersion> = self
            .by_scope
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|s| s.subject_id == subject_id)
            .collect();
        for scope in scopes {
            self.invalidate_subject_version(scope.subject_id, &scope.version);
        }
    }

    fn stats(&self) -> CacheStats {
        self.entries.run_pending_tasks();
        CacheStats {
            entry_count: self.entries.entry_count(),
            hit_count: self.hit_count.load(Ordering::Relaxed),
            miss_count: self.miss_count.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_determinism_matches_spec_property_10() {
        let a = CacheKey::new("Apa itu   Pythagoras?", 1, "1.0.0");
        let b = CacheKey::new("apa itu pythagoras?", 1, "1.0.0");
        assert_eq!(a, b, "normalized questions must hash equal");

        let c = CacheKey::new("apa itu pythagoras?", 2, "1.0.0");
        assert_ne!(a, c, "different subject must hash differently");

        let d = CacheKey::new("apa itu pythagoras?", 1, "1.1.0");
        assert_ne!(a, d, "different version must hash differently");
    }

    #[test]
    fn invalidate_subject_version_removes_only_matching_entries() {
        let cache = MokaCache::new(100, Duration::from_secs(60));
        let k1 = CacheKey::new("q1", 1, "1.0.0");
        let k2 = CacheKey::new("q2", 1, "1.1.0");
        cache.set(k1.clone(), 1, "1.0.0".into(), "r1".into(), Duration::from_secs(60));
        cache.set(k2.clone(), 1, "1.1.0".into(), "r2".into(), Duration::from_secs(60));

        cache.invalidate_subject_version(1, "1.0.0");

        assert!(cache.get(&k1).is_none());
        assert_eq!(cache.get(&k2), Some("r2".to_string()));
    }

    #[test]
    fn invalidate_subject_removes_all_versions() {
        let cache = MokaCache::new(100, Duration::from_secs(60));
        let k1 = CacheKey::new("q1", 1, "1.0.0");
        let k2 = CacheKey::new("q2", 1, "1.1.0");
        cache.set(k1.clone(), 1, "1.0.0".into(), "r1".into(), Duration::from_secs(60));
        cache.set(k2.clone(), 1, "1.1.0".into(), "r2".into(), Duration::from_secs(60));

        cache.invalidate_subject(1);

        assert!(cache.get(&k1).is_none());
        assert!(cache.get(&k2).is_none());
    }

    #[test]
    fn stats_count_hits_and_misses() {
        let cache = MokaCache::new(100, Duration::from_secs(60));
        let k1 = CacheKey::new("q1", 1, "1.0.0");
        let missing = CacheKey::new("never set", 1, "1.0.0");

        cache.set(k1.clone(), 1, "1.0.0".into(), "r1".into(), Duration::from_secs(60));
        assert!(cache.get(&k1).is_some());
        assert!(cache.get(&missing).is_none());
        assert!(cache.get(&missing).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 2);
    }
}
