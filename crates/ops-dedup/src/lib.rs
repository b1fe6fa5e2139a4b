//! Fingerprint-based deduplication cache (spec §4.2).
//!
//! An in-memory TTL map keyed by the normalized alert fingerprint, guarded
//! by a single `RwLock` (spec §5: "in-memory maps under a component-local
//! lock"), mirroring the teacher's `ModelCache` shape but without the
//! LRU/predictive machinery — dedup only ever needs TTL expiry.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use ops_common::model::{now, FingerprintEntry};
use ops_common::utils::normalize_message;
use tokio::sync::RwLock;
use tracing::debug;

pub const DEFAULT_TTL_MS: u64 = 300_000;

/// Compute the stable fingerprint for an alert's identity fields:
/// `ruleId | metric | severity | normalizedMessage` (spec §4.2).
pub fn fingerprint(rule_id: &str, metric: &str, severity: &str, message: &str) -> String {
    let normalized = normalize_message(message);
    ops_common::utils::stable_hash(&[rule_id, metric, severity, &normalized])
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub size: usize,
    pub suppressed_count: u64,
}

pub struct FingerprintCache {
    entries: RwLock<HashMap<String, FingerprintEntry>>,
    suppressed_count: std::sync::atomic::AtomicU64,
    default_ttl: Duration,
}

impl FingerprintCache {
    pub fn new(default_ttl_ms: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            suppressed_count: std::sync::atomic::AtomicU64::new(0),
            default_ttl: Duration::from_millis(default_ttl_ms),
        }
    }

    /// Whether a live (non-expired) entry exists for `fp`.
    pub async fn exists(&self, fp: &str) -> bool {
        let entries = self.entries.read().await;
        match entries.get(fp) {
            Some(entry) => !entry.is_expired(now()),
            None => false,
        }
    }

    /// Record a sighting of `fp`. Updates `lastSeen`/`count`/`expiresAt` if
    /// an entry exists, otherwise creates one. Returns the entry after the
    /// update along with whether this was a duplicate (i.e. it already
    /// existed and was not expired) so callers can bump suppression stats.
    pub async fn set(&self, fp: &str, ttl_ms: Option<u64>) -> (FingerprintEntry, bool) {
        let ttl = ttl_ms.map(Duration::from_millis).unwrap_or(self.default_ttl);
        let current = now();
        let mut entries = self.entries.write().await;
        let was_duplicate = entries
            .get(fp)
            .map(|e| !e.is_expired(current))
            .unwrap_or(false);

        let entry = entries
            .entry(fp.to_string())
            .and_modify(|e| {
                e.last_seen = current;
                e.count += 1;
                e.expires_at = current + chrono::Duration::from_std(ttl).unwrap();
            })
            .or_insert_with(|| FingerprintEntry {
                fingerprint: fp.to_string(),
                first_seen: current,
                last_seen: current,
                count: 1,
                expires_at: current + chrono::Duration::from_std(ttl).unwrap(),
            })
            .clone();

        if was_duplicate {
            self.suppressed_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            debug!(fingerprint = %fp, count = entry.count, "duplicate alert suppressed");
        }
        (entry, was_duplicate)
    }

    pub async fn get(&self, fp: &str) -> Option<FingerprintEntry> {
        let entries = self.entries.read().await;
        entries.get(fp).filter(|e| !e.is_expired(now())).cloned()
    }

    pub async fn delete(&self, fp: &str) -> bool {
        let mut entries = self.entries.write().await;
        entries.remove(fp).is_some()
    }

    /// Remove all expired entries. Returns the count removed.
    pub async fn cleanup(&self) -> usize {
        let current: chrono::DateTime<Utc> = now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(current));
        before - entries.len()
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        CacheStats {
            size: entries.len(),
            suppressed_count: self.suppressed_count.load(std::sync::atomic::Ordering::Relaxed),
        }
    }
}

impl Default for FingerprintCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL_MS)
    }
}
