//! Shared day-partitioned JSON array persistence.
//!
//! Every component that owns a `data/ai-ops/<component>/YYYY-MM-DD.json`
//! file (spec §6) goes through these helpers rather than hand-rolling file
//! I/O, so the on-disk format and failure handling stay identical across
//! the audit log, metrics collector, rule engine, noise filter, analyzer,
//! decision engine and snapshot store.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

use crate::model::day_key;
use crate::{Error, Result};

/// Append one record to the JSON array for `ts`'s UTC calendar day,
/// creating the directory and file as needed.
pub async fn append_day_record<T: Serialize>(dir: &Path, ts: DateTime<Utc>, record: &T) -> Result<()> {
    let path = day_path(dir, ts);
    let mut records: Vec<serde_json::Value> = read_day_raw(&path).await?;
    records.push(serde_json::to_value(record)?);
    write_day_raw(&path, &records).await
}

/// Read all records for a given UTC calendar day, newest file format is a
/// plain JSON array; a missing file is an empty list, never an error.
pub async fn read_day<T: DeserializeOwned>(dir: &Path, day: &str) -> Result<Vec<T>> {
    let path = dir.join(format!("{day}.json"));
    let raw = read_day_raw(&path).await?;
    raw.into_iter()
        .map(|v| serde_json::from_value(v).map_err(Error::from))
        .collect()
}

/// Overwrite the full set of records for a day (used by components that
/// rewrite in place, e.g. marking an alert resolved).
pub async fn write_day<T: Serialize>(dir: &Path, day: &str, records: &[T]) -> Result<()> {
    let path = dir.join(format!("{day}.json"));
    let values: Vec<serde_json::Value> = records
        .iter()
        .map(serde_json::to_value)
        .collect::<std::result::Result<_, _>>()?;
    write_day_raw(&path, &values).await
}

/// List the `YYYY-MM-DD` day keys present as files under `dir`.
pub async fn list_days(dir: &Path) -> Result<Vec<String>> {
    let mut days = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(days),
        Err(e) => return Err(Error::Io(e.to_string())),
    };
    while let Some(entry) = entries.next_entry().await.map_err(|e| Error::Io(e.to_string()))? {
        if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
            if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
                days.push(stem.to_string());
            }
        }
    }
    days.sort();
    Ok(days)
}

/// Delete day files older than `retention_days` relative to `now`. Returns
/// the number of files removed.
pub async fn sweep_retention(dir: &Path, now: DateTime<Utc>, retention_days: u32) -> Result<usize> {
    let cutoff = now - chrono::Duration::days(retention_days as i64);
    let cutoff_key = day_key(cutoff);
    let mut removed = 0usize;
    for day in list_days(dir).await? {
        if day.as_str() < cutoff_key.as_str() {
            let path = dir.join(format!("{day}.json"));
            if tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

fn day_path(dir: &Path, ts: DateTime<Utc>) -> PathBuf {
    dir.join(format!("{}.json", day_key(ts)))
}

async fn read_day_raw(path: &Path) -> Result<Vec<serde_json::Value>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            if bytes.is_empty() {
                Ok(Vec::new())
            } else {
                serde_json::from_slice(&bytes).map_err(Error::from)
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(Error::Io(e.to_string())),
    }
}

async fn write_day_raw(path: &Path, records: &[serde_json::Value]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::Io(e.to_string()))?;
    }
    let bytes = serde_json::to_vec_pretty(records)?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| Error::Io(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Rec {
        n: u32,
    }

    #[tokio::test]
    async fn append_and_read_round_trips() {
        let dir = tempdir().unwrap();
        let ts = Utc::now();
        append_day_record(dir.path(), ts, &Rec { n: 1 }).await.unwrap();
        append_day_record(dir.path(), ts, &Rec { n: 2 }).await.unwrap();

        let day = day_key(ts);
        let records: Vec<Rec> = read_day(dir.path(), &day).await.unwrap();
        assert_eq!(records, vec![Rec { n: 1 }, Rec { n: 2 }]);
    }

    #[tokio::test]
    async fn missing_day_is_empty_not_error() {
        let dir = tempdir().unwrap();
        let records: Vec<Rec> = read_day(dir.path(), "2000-01-01").await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn sweep_retention_removes_old_days_only() {
        let dir = tempdir().unwrap();
        let now = Utc::now();
        let old = now - chrono::Duration::days(100);
        append_day_record(dir.path(), old, &Rec { n: 1 }).await.unwrap();
        append_day_record(dir.path(), now, &Rec { n: 2 }).await.unwrap();

        let removed = sweep_retention(dir.path(), now, 90).await.unwrap();
        assert_eq!(removed, 1);

        let remaining = list_days(dir.path()).await.unwrap();
        assert_eq!(remaining, vec![day_key(now)]);
    }
}
