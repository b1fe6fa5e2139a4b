//! Periodic metrics collector (spec §4.3).
//!
//! A single ticker at `intervalMs` pulls `/system/resource` and
//! `/interface` from the device client, parses them into samples, updates
//! the in-memory latest snapshot, and appends to the current UTC day file.
//! The background tick is a `tokio::task::JoinHandle` stored on the struct
//! and aborted on `Drop`, mirroring the teacher's `AlertManager` shape.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ops_common::model::{day_key, now, InterfaceSample, LinkStatus, SystemSample};
use ops_common::ports::DeviceClient;
use ops_common::utils::parse_uptime;
use ops_common::{Error, Result};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const SYSTEM_DIR: &str = "metrics/system";
const INTERFACE_DIR: &str = "metrics/interfaces";

/// One point in a `getHistory` result.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LatestSnapshot {
    pub system: Option<SystemSample>,
    pub interfaces: HashMap<String, InterfaceSample>,
}

struct Inner {
    device: Arc<dyn DeviceClient>,
    data_dir: PathBuf,
    retention_days: u32,
    latest: RwLock<LatestSnapshot>,
    consecutive_failures: AtomicU32,
    failure_warn_threshold: u32,
}

pub struct MetricsCollector {
    inner: Arc<Inner>,
    ticker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MetricsCollector {
    pub fn new(
        device: Arc<dyn DeviceClient>,
        data_dir: impl Into<PathBuf>,
        retention_days: u32,
        failure_warn_threshold: u32,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                device,
                data_dir: data_dir.into(),
                retention_days,
                latest: RwLock::new(LatestSnapshot::default()),
                consecutive_failures: AtomicU32::new(0),
                failure_warn_threshold,
            }),
            ticker: tokio::sync::Mutex::new(None),
        }
    }

    /// Run the retention sweep once; intended to run at startup, per spec.
    pub async fn sweep_retention_at_startup(&self) -> Result<()> {
        let now = now();
        let removed_sys =
            ops_common::fsio::sweep_retention(&self.inner.data_dir.join(SYSTEM_DIR), now, self.inner.retention_days)
                .await?;
        let removed_if = ops_common::fsio::sweep_retention(
            &self.inner.data_dir.join(INTERFACE_DIR),
            now,
            self.inner.retention_days,
        )
        .await?;
        if removed_sys + removed_if > 0 {
            info!(removed_sys, removed_if, "metrics retention sweep complete");
        }
        Ok(())
    }

    /// Start the periodic tick at `interval_ms`. A second call is a no-op.
    pub async fn start(self: &Arc<Self>, interval_ms: u64) {
        let mut guard = self.ticker.lock().await;
        if guard.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                if let Err(e) = Self::tick(&inner).await {
                    warn!(error = %e, "metrics tick failed");
                }
            }
        });
        *guard = Some(handle);
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
    }

    /// Bypass the timer and collect immediately; the fresh snapshot is also
    /// persisted, per spec §4.3.
    pub async fn collect_now(&self) -> Result<LatestSnapshot> {
        Self::tick(&self.inner).await?;
        Ok(self.inner.latest.read().await.clone())
    }

    async fn tick(inner: &Arc<Inner>) -> Result<()> {
        if !inner.device.is_connected().await {
            let failures = inner.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures >= inner.failure_warn_threshold {
                warn!(failures, "device disconnected for consecutive collector ticks");
            }
            return Ok(());
        }

        let resource = inner.device.print("/system/resource").await;
        let interfaces = inner.device.print("/interface").await;

        let (resource, interfaces) = match (resource, interfaces) {
            (Ok(r), Ok(i)) => {
                inner.consecutive_failures.store(0, Ordering::Relaxed);
                (r, i)
            }
            _ => {
                let failures = inner.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= inner.failure_warn_threshold {
                    warn!(failures, "consecutive metrics collection failures");
                }
                return Ok(());
            }
        };

        let ts = now();
        if let Some(system) = parse_system_sample(ts, &resource) {
            inner.latest.write().await.system = Some(system.clone());
            ops_common::fsio::append_day_record(&inner.data_dir.join(SYSTEM_DIR), ts, &system).await?;
        }

        let samples = parse_interface_samples(ts, &interfaces);
        {
            let mut latest = inner.latest.write().await;
            for sample in &samples {
                latest.interfaces.insert(sample.name.clone(), sample.clone());
            }
        }
        for sample in &samples {
            ops_common::fsio::append_day_record(&inner.data_dir.join(INTERFACE_DIR), ts, sample).await?;
        }

        Ok(())
    }

    pub async fn latest(&self) -> LatestSnapshot {
        self.inner.latest.read().await.clone()
    }

    /// System metrics select CPU/mem/disk percent by `metric` name; interface
    /// history uses key `interface:<name>` and returns `rx+tx` bytes,
    /// sorted ascending by time (spec §4.3).
    pub async fn get_history(
        &self,
        metric: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<HistoryPoint>> {
        let mut points = Vec::new();
        if let Some(name) = metric.strip_prefix("interface:") {
            for day in day_keys_between(from, to) {
                let samples: Vec<InterfaceSample> =
                    ops_common::fsio::read_day(&self.inner.data_dir.join(INTERFACE_DIR), &day).await?;
                for sample in samples {
                    if sample.name != name || sample.timestamp < from || sample.timestamp > to {
                        continue;
                    }
                    points.push(HistoryPoint {
                        timestamp: sample.timestamp,
                        value: (sample.rx_bytes + sample.tx_bytes) as f64,
                        label: Some(sample.name.clone()),
                    });
                }
            }
        } else {
            for day in day_keys_between(from, to) {
                let samples: Vec<SystemSample> =
                    ops_common::fsio::read_day(&self.inner.data_dir.join(SYSTEM_DIR), &day).await?;
                for sample in samples {
                    if sample.timestamp < from || sample.timestamp > to {
                        continue;
                    }
                    let value = match metric {
                        "cpu" => sample.cpu_pct as f64,
                        "memory" => 100.0 - sample.mem_free_pct as f64,
                        "disk" => 100.0 - sample.disk_free_pct as f64,
                        other => return Err(Error::Validation(format!("unknown metric {other}"))),
                    };
                    points.push(HistoryPoint {
                        timestamp: sample.timestamp,
                        value,
                        label: None,
                    });
                }
            }
        }
        points.sort_by_key(|p| p.timestamp);
        Ok(points)
    }
}

impl Drop for MetricsCollector {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.ticker.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

fn day_keys_between(from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<String> {
    let mut days = Vec::new();
    let mut cursor = from.date_naive();
    let end = to.date_naive();
    while cursor <= end {
        days.push(cursor.format("%Y-%m-%d").to_string());
        cursor = cursor.succ_opt().unwrap_or(end);
        if cursor == end && days.last().map(|d| d.as_str()) == Some(&end.format("%Y-%m-%d").to_string()) {
            break;
        }
    }
    if days.is_empty() {
        days.push(day_key(from));
    }
    days
}

fn parse_system_sample(ts: DateTime<Utc>, rows: &[serde_json::Value]) -> Option<SystemSample> {
    let row = rows.first()?;
    let cpu_pct = row.get("cpu-load").and_then(|v| v.as_str()).and_then(|s| s.trim_end_matches('%').parse().ok())
        .or_else(|| row.get("cpu-load").and_then(|v| v.as_f64()).map(|v| v as f32))
        .unwrap_or(0.0);
    let mem_total = row.get("total-memory").and_then(|v| v.as_u64()).unwrap_or(0);
    let mem_free = row.get("free-memory").and_then(|v| v.as_u64()).unwrap_or(0);
    let mem_used = mem_total.saturating_sub(mem_free);
    let disk_total = row.get("total-hdd-space").and_then(|v| v.as_u64()).unwrap_or(0);
    let disk_free = row.get("free-hdd-space").and_then(|v| v.as_u64()).unwrap_or(0);
    let disk_used = disk_total.saturating_sub(disk_free);
    let uptime = row.get("uptime").and_then(|v| v.as_str()).map(parse_uptime).unwrap_or(0);

    Some(SystemSample {
        timestamp: ts,
        cpu_pct,
        mem_total,
        mem_used,
        mem_free_pct: ratio_pct(mem_free, mem_total),
        disk_total,
        disk_used,
        disk_free_pct: ratio_pct(disk_free, disk_total),
        uptime_sec: uptime,
    })
}

fn ratio_pct(part: u64, total: u64) -> f32 {
    if total == 0 {
        0.0
    } else {
        (part as f64 / total as f64 * 100.0) as f32
    }
}

fn parse_interface_samples(ts: DateTime<Utc>, rows: &[serde_json::Value]) -> Vec<InterfaceSample> {
    rows.iter()
        .filter_map(|row| {
            let name = row.get("name")?.as_str()?.to_string();
            let status = match row.get("running").and_then(|v| v.as_bool()) {
                Some(true) => LinkStatus::Up,
                _ => LinkStatus::Down,
            };
            Some(InterfaceSample {
                timestamp: ts,
                name,
                status,
                rx_bytes: row.get("rx-byte").and_then(|v| v.as_u64()).unwrap_or(0),
                tx_bytes: row.get("tx-byte").and_then(|v| v.as_u64()).unwrap_or(0),
                rx_packets: row.get("rx-packet").and_then(|v| v.as_u64()).unwrap_or(0),
                tx_packets: row.get("tx-packet").and_then(|v| v.as_u64()).unwrap_or(0),
                rx_errors: row.get("rx-error").and_then(|v| v.as_u64()).unwrap_or(0),
                tx_errors: row.get("tx-error").and_then(|v| v.as_u64()).unwrap_or(0),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ops_common::Result as OpsResult;
    use tempfile::tempdir;

    struct StubDevice {
        connected: bool,
    }

    #[async_trait]
    impl DeviceClient for StubDevice {
        async fn is_connected(&self) -> bool {
            self.connected
        }

        async fn print(&self, path: &str) -> OpsResult<Vec<serde_json::Value>> {
            if path == "/system/resource" {
                Ok(vec![serde_json::json!({
                    "cpu-load": "42",
                    "total-memory": 1000,
                    "free-memory": 400,
                    "total-hdd-space": 2000,
                    "free-hdd-space": 1500,
                    "uptime": "1d2h3m4s",
                })])
            } else {
                Ok(vec![serde_json::json!({
                    "name": "ether1",
                    "running": true,
                    "rx-byte": 100,
                    "tx-byte": 200,
                    "rx-packet": 1,
                    "tx-packet": 2,
                    "rx-error": 0,
                    "tx-error": 0,
                })])
            }
        }

        async fn execute_raw(&self, _path: &str, _params: serde_json::Value) -> OpsResult<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }

    #[tokio::test]
    async fn collect_now_persists_and_updates_latest() {
        let dir = tempdir().unwrap();
        let collector = MetricsCollector::new(Arc::new(StubDevice { connected: true }), dir.path(), 7, 3);
        let snapshot = collector.collect_now().await.unwrap();
        let system = snapshot.system.unwrap();
        assert_eq!(system.cpu_pct, 42.0);
        assert_eq!(system.mem_used, 600);
        assert!(system.is_valid());
        assert_eq!(snapshot.interfaces.get("ether1").unwrap().status, LinkStatus::Up);
    }

    #[tokio::test]
    async fn collect_now_skips_when_disconnected() {
        let dir = tempdir().unwrap();
        let collector = MetricsCollector::new(Arc::new(StubDevice { connected: false }), dir.path(), 7, 3);
        let snapshot = collector.collect_now().await.unwrap();
        assert!(snapshot.system.is_none());
    }

    #[tokio::test]
    async fn get_history_returns_ascending_cpu_series() {
        let dir = tempdir().unwrap();
        let collector = Arc::new(MetricsCollector::new(Arc::new(StubDevice { connected: true }), dir.path(), 7, 3));
        collector.collect_now().await.unwrap();
        let now_ts = now();
        let history = collector
            .get_history("cpu", now_ts - chrono::Duration::minutes(1), now_ts + chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].value, 42.0);
    }
}
