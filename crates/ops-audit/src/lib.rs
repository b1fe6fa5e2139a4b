//! Audit log (spec §4.1): an append-only, replayable, filterable record of
//! every state-changing action in the core.
//!
//! Write actions assign `id`/`timestamp` here; read actions never fabricate
//! one. Persistence is one JSON array per UTC day under
//! `data/ai-ops/audit/YYYY-MM-DD.json`. Writes are best-effort: an I/O
//! failure is logged and does not propagate, matching the teacher's
//! `PersistentQueue` "log and continue" posture for non-critical-path
//! writes. `query` is the one operation where an I/O error is surfaced,
//! since a caller relying on query results must know if they are
//! incomplete.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ops_common::model::{new_id, now, AuditEntry, AuditQuery};
use ops_common::{fsio, Result};
use tokio::sync::Mutex;
use tracing::{error, info};

/// Append-only audit log, one instance per process, owning its own
/// directory under the data root.
pub struct AuditLog {
    dir: PathBuf,
    retention_days: u32,
    // Serializes read-modify-write of the current day's file across
    // concurrent `log` calls, per spec §5 ("within a component, writes are
    // serialized").
    write_lock: Arc<Mutex<()>>,
}

impl AuditLog {
    pub fn new(data_dir: impl Into<PathBuf>, retention_days: u32) -> Self {
        Self {
            dir: data_dir.into().join("audit"),
            retention_days,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Append a new audit entry. `id` and `timestamp` are assigned here;
    /// any caller-supplied id/timestamp on the builder fields is ignored.
    pub async fn log(&self, actor: impl Into<String>, action: impl Into<String>, details: serde_json::Value) {
        let entry = AuditEntry {
            id: new_id(),
            timestamp: now(),
            actor: actor.into(),
            action: action.into(),
            details,
        };
        let _guard = self.write_lock.lock().await;
        if let Err(e) = fsio::append_day_record(&self.dir, entry.timestamp, &entry).await {
            error!(error = %e, "failed to persist audit entry; continuing (best-effort write)");
        }
    }

    /// Query entries across the `[from, to]` range (inclusive), optionally
    /// filtered by action/actor, sorted timestamp-descending and capped at
    /// `limit`. Unlike `log`, I/O failures here are surfaced to the caller.
    pub async fn query(&self, query: AuditQuery) -> Result<Vec<AuditEntry>> {
        let from = query.from.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let to = query.to.unwrap_or_else(now);
        let limit = query.limit.unwrap_or(usize::MAX);

        let mut matched = Vec::new();
        for day in fsio::list_days(&self.dir).await? {
            let entries: Vec<AuditEntry> = fsio::read_day(&self.dir, &day).await?;
            for entry in entries {
                if entry.timestamp < from || entry.timestamp > to {
                    continue;
                }
                if let Some(action) = &query.action {
                    if &entry.action != action {
                        continue;
                    }
                }
                if let Some(actor) = &query.actor {
                    if &entry.actor != actor {
                        continue;
                    }
                }
                matched.push(entry);
            }
        }
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matched.truncate(limit);
        Ok(matched)
    }

    /// Delete day files older than the retention window. Returns the count
    /// of files removed.
    pub async fn sweep_retention(&self) -> Result<usize> {
        let removed = fsio::sweep_retention(&self.dir, now(), self.retention_days).await?;
        if removed > 0 {
            info!(removed, "audit retention sweep removed old day files");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn log_then_query_returns_descending() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path(), 90);

        log.log("system", "alert_trigger", serde_json::json!({"rule": "cpu"})).await;
        log.log("system", "alert_trigger", serde_json::json!({"rule": "mem"})).await;

        let results = log.query(AuditQuery::default()).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].timestamp >= results[1].timestamp);
    }

    #[tokio::test]
    async fn query_filters_by_action_and_actor() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path(), 90);
        log.log("rule-engine", "alert_trigger", serde_json::json!({})).await;
        log.log("snapshot-store", "config_change", serde_json::json!({})).await;

        let results = log
            .query(AuditQuery {
                action: Some("config_change".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].actor, "snapshot-store");
    }

    #[tokio::test]
    async fn query_respects_limit() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path(), 90);
        for i in 0..5 {
            log.log("system", "tick", serde_json::json!({"i": i})).await;
        }
        let results = log
            .query(AuditQuery {
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn sweep_retention_reports_removed_count() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path(), 1);
        // No files exist yet; sweep is a no-op, not an error.
        let removed = log.sweep_retention().await.unwrap();
        assert_eq!(removed, 0);
    }
}
