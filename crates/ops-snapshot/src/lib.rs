//! Configuration snapshot store (spec §4.9): capture, FIFO-retained
//! history, line-keyed diffing and dangerous-change detection.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use md5::{Digest, Md5};
use once_cell::sync::Lazy;
use ops_audit::AuditLog;
use ops_common::model::{
    new_id, now, ConfigDiff, ConfigSnapshot, DangerousChangeMatch, DangerousChangeReport, RiskLevel, SnapshotTrigger,
};
use ops_common::ports::DeviceClient;
use ops_common::{Error, Result};
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{info, warn};

const INDEX_FILE: &str = "snapshots/index.json";
const SNAPSHOT_DIR: &str = "snapshots";

/// Sections probed when a single full-config export is unavailable.
const SECTION_PATHS: &[&str] = &[
    "/ip firewall filter",
    "/ip route",
    "/interface",
    "/ip dns",
    "/ip service",
    "/user",
    "/system",
];

pub struct SnapshotConfig {
    pub max_retained: usize,
    pub device_timeout_ms: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_retained: 30,
            device_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreResult {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct SnapshotStore {
    data_dir: PathBuf,
    device: Arc<dyn DeviceClient>,
    audit: Arc<AuditLog>,
    config: SnapshotConfig,
    write_lock: Mutex<()>,
}

impl SnapshotStore {
    pub fn new(data_dir: impl Into<PathBuf>, device: Arc<dyn DeviceClient>, audit: Arc<AuditLog>, config: SnapshotConfig) -> Self {
        Self {
            data_dir: data_dir.into(),
            device,
            audit,
            config,
            write_lock: Mutex::new(()),
        }
    }

    /// Capture the device's current configuration, persist it, enforce
    /// retention, audit the capture and — unless the trigger is
    /// `pre_remediation` — diff against the previous snapshot and audit a
    /// dangerous-change detection if any pattern matches.
    pub async fn create_snapshot(&self, trigger: SnapshotTrigger) -> Result<ConfigSnapshot> {
        let _guard = self.write_lock.lock().await;
        let content = self.fetch_config().await?;

        let mut hasher = Md5::new();
        hasher.update(content.as_bytes());
        let checksum = hasher.finalize().iter().map(|b| format!("{b:02x}")).collect::<String>();

        let snapshot = ConfigSnapshot {
            id: new_id(),
            timestamp: now(),
            trigger,
            size: content.len() as u64,
            checksum,
            metadata: None,
        };

        let mut index = self.read_index().await?;
        let previous = index.last().cloned();

        self.write_snapshot_file(&snapshot.id, &content).await?;
        index.push(snapshot.clone());

        let mut evicted_ids = Vec::new();
        while index.len() > self.config.max_retained {
            evicted_ids.push(index.remove(0).id);
        }
        self.write_index(&index).await?;
        for id in evicted_ids {
            let _ = tokio::fs::remove_file(self.snapshot_path(&id)).await;
        }

        self.audit
            .log(
                "snapshot-store",
                "create_snapshot",
                serde_json::json!({"id": snapshot.id, "trigger": format!("{:?}", snapshot.trigger)}),
            )
            .await;

        if trigger != SnapshotTrigger::PreRemediation {
            if let Some(prev) = previous {
                let prev_content = self.read_snapshot_file(&prev.id).await?;
                let diff = diff_configs(&prev_content, &content);
                let report = detect_dangerous_changes(&diff);
                if report.detected {
                    self.audit
                        .log(
                            "snapshot-store",
                            "config_change/dangerous_change_detection",
                            serde_json::to_value(&report)?,
                        )
                        .await;
                }
            }
        }

        Ok(snapshot)
    }

    pub async fn list_snapshots(&self) -> Result<Vec<ConfigSnapshot>> {
        self.read_index().await
    }

    pub async fn get_snapshot_content(&self, id: &str) -> Result<String> {
        self.read_snapshot_file(id).await
    }

    pub async fn diff(&self, from_id: &str, to_id: &str) -> Result<ConfigDiff> {
        let from = self.read_snapshot_file(from_id).await?;
        let to = self.read_snapshot_file(to_id).await?;
        Ok(diff_configs(&from, &to))
    }

    /// Best-effort line-by-line restore. Always takes a pre-remediation
    /// snapshot first so the prior state can be recovered.
    pub async fn restore_snapshot(&self, id: &str) -> Result<RestoreResult> {
        self.create_snapshot(SnapshotTrigger::PreRemediation).await?;
        let content = self.read_snapshot_file(id).await?;

        let mut attempted = 0usize;
        let mut succeeded = 0usize;
        for raw_line in content.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('/') {
                continue;
            }
            attempted += 1;
            match self.device.execute_raw("/restore-line", serde_json::json!({"line": line})).await {
                Ok(_) => succeeded += 1,
                Err(e) => warn!(error = %e, line, "restore line failed"),
            }
        }
        Ok(RestoreResult { attempted, succeeded, failed: attempted - succeeded })
    }

    async fn fetch_config(&self) -> Result<String> {
        if !self.device.is_connected().await {
            return Err(Error::Dependency("device not connected".into()));
        }
        match self.device.execute_raw("/export", serde_json::Value::Null).await {
            Ok(value) => Ok(value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string())),
            Err(e) => {
                warn!(error = %e, "full config export failed, falling back to per-section enumeration");
                self.fetch_config_per_section().await
            }
        }
    }

    async fn fetch_config_per_section(&self) -> Result<String> {
        let mut sections = Vec::new();
        for path in SECTION_PATHS {
            if let Ok(values) = self.device.print(path).await {
                sections.push(format!("{path}\n{}", serde_json::to_string_pretty(&values)?));
            }
        }
        if sections.is_empty() {
            return Err(Error::Dependency("device unreachable for every config section".into()));
        }
        Ok(sections.join("\n"))
    }

    fn snapshot_path(&self, id: &str) -> PathBuf {
        self.data_dir.join(SNAPSHOT_DIR).join(format!("{id}.rsc"))
    }

    async fn read_snapshot_file(&self, id: &str) -> Result<String> {
        tokio::fs::read_to_string(self.snapshot_path(id)).await.map_err(|e| Error::Io(e.to_string()))
    }

    async fn write_snapshot_file(&self, id: &str, content: &str) -> Result<()> {
        let path = self.snapshot_path(id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| Error::Io(e.to_string()))?;
        }
        tokio::fs::write(path, content).await.map_err(|e| Error::Io(e.to_string()))
    }

    async fn read_index(&self) -> Result<Vec<ConfigSnapshot>> {
        let path = self.data_dir.join(INDEX_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(Error::from),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::Io(e.to_string())),
        }
    }

    async fn write_index(&self, index: &[ConfigSnapshot]) -> Result<()> {
        let path = self.data_dir.join(INDEX_FILE);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| Error::Io(e.to_string()))?;
        }
        let bytes = serde_json::to_vec_pretty(index)?;
        tokio::fs::write(&path, bytes).await.map_err(|e| Error::Io(e.to_string()))
    }
}

// ---------------------------------------------------------------------
// Diff algorithm
// ---------------------------------------------------------------------

static NORMALIZE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(rx-byte|tx-byte|rx-packet|tx-packet|bytes|packets|uptime|rx-rate|tx-rate)=\S+\s*").unwrap());

fn normalize_line(line: &str) -> String {
    NORMALIZE_RE.replace_all(line, "").trim().to_string()
}

fn extract_identifier(line: &str) -> Option<String> {
    for prefix in [".id=", "name=", "address=", "comment="] {
        if let Some(idx) = line.find(prefix) {
            let rest = &line[idx + prefix.len()..];
            let value: String = rest.chars().take_while(|c| !c.is_whitespace()).collect();
            if !value.is_empty() {
                return Some(format!("{prefix}{value}"));
            }
        }
    }
    None
}

/// Split on lines, skip comments, key each content line by
/// `<section-path>:<identifier>`.
fn keyed_lines(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let mut current_path = String::new();
    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('/') {
            current_path = line.to_string();
            continue;
        }
        let identifier = extract_identifier(line).unwrap_or_else(|| line.to_string());
        let key = format!("{current_path}:{identifier}");
        map.insert(key, normalize_line(line));
    }
    map
}

/// Key-based diff between two configuration captures.
pub fn diff_configs(old: &str, new: &str) -> ConfigDiff {
    let old_map = keyed_lines(old);
    let new_map = keyed_lines(new);

    let mut additions = Vec::new();
    let mut modifications = Vec::new();
    for (key, new_val) in &new_map {
        match old_map.get(key) {
            None => additions.push(new_val.clone()),
            Some(old_val) if old_val != new_val => modifications.push(new_val.clone()),
            _ => {}
        }
    }
    let mut deletions = Vec::new();
    for (key, old_val) in &old_map {
        if !new_map.contains_key(key) {
            deletions.push(old_val.clone());
        }
    }

    ConfigDiff { additions, modifications, deletions }
}

// ---------------------------------------------------------------------
// Dangerous-change pattern catalog (spec §6)
// ---------------------------------------------------------------------

enum PatternScope {
    DeletionsOnly,
    AnyChange,
}

struct DangerousPattern {
    name: &'static str,
    risk: RiskLevel,
    regex: Regex,
    scope: PatternScope,
}

static DANGEROUS_PATTERNS: Lazy<Vec<DangerousPattern>> = Lazy::new(|| {
    vec![
        DangerousPattern {
            name: "firewall_rule_deletion",
            risk: RiskLevel::High,
            regex: Regex::new(r"(?i)^/ip(v6)?\s+firewall\s+(filter|nat|mangle)").unwrap(),
            scope: PatternScope::DeletionsOnly,
        },
        DangerousPattern {
            name: "password_change",
            risk: RiskLevel::High,
            regex: Regex::new(r"(?i)password=|/user\s+.*password").unwrap(),
            scope: PatternScope::AnyChange,
        },
        DangerousPattern {
            name: "admin_user_change",
            risk: RiskLevel::High,
            regex: Regex::new(r"(?i)/user\s+(add|remove|set)|group=full").unwrap(),
            scope: PatternScope::AnyChange,
        },
        DangerousPattern {
            name: "interface_disable",
            risk: RiskLevel::Medium,
            regex: Regex::new(r"(?i)/interface\s+.*disable|disabled=yes").unwrap(),
            scope: PatternScope::AnyChange,
        },
        DangerousPattern {
            name: "routing_change",
            risk: RiskLevel::Medium,
            regex: Regex::new(r"(?i)/ip\s+route\s+(add|remove|set)|/routing").unwrap(),
            scope: PatternScope::AnyChange,
        },
        DangerousPattern {
            name: "dns_change",
            risk: RiskLevel::Low,
            regex: Regex::new(r"(?i)/ip\s+dns\s+set|/ip\s+dns\s+static").unwrap(),
            scope: PatternScope::AnyChange,
        },
        DangerousPattern {
            name: "service_disable",
            risk: RiskLevel::Medium,
            regex: Regex::new(r"(?i)/ip\s+service\s+.*disable|disabled=yes").unwrap(),
            scope: PatternScope::AnyChange,
        },
        DangerousPattern {
            name: "system_reset",
            risk: RiskLevel::High,
            regex: Regex::new(r"(?i)/system\s+reset|/system\s+reboot").unwrap(),
            scope: PatternScope::AnyChange,
        },
    ]
});

/// Apply the dangerous-change catalog to a diff; overall risk is the
/// maximum level among matches.
pub fn detect_dangerous_changes(diff: &ConfigDiff) -> DangerousChangeReport {
    let mut matches = Vec::new();
    for pattern in DANGEROUS_PATTERNS.iter() {
        let candidates: Vec<&String> = match pattern.scope {
            PatternScope::DeletionsOnly => diff.deletions.iter().collect(),
            PatternScope::AnyChange => diff
                .additions
                .iter()
                .chain(diff.modifications.iter())
                .chain(diff.deletions.iter())
                .collect(),
        };
        for line in candidates {
            if pattern.regex.is_match(line) {
                matches.push(DangerousChangeMatch {
                    name: pattern.name.to_string(),
                    risk: pattern.risk,
                    line: line.clone(),
                });
            }
        }
    }
    let overall_risk_level = matches.iter().map(|m| m.risk).max();
    if overall_risk_level.is_some() {
        info!(count = matches.len(), "dangerous changes detected");
    }
    DangerousChangeReport { detected: !matches.is_empty(), overall_risk_level, patterns: matches }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use tempfile::tempdir;

    struct StubDevice {
        export: String,
    }

    #[async_trait]
    impl DeviceClient for StubDevice {
        async fn is_connected(&self) -> bool {
            true
        }
        async fn print(&self, _path: &str) -> Result<Vec<Value>> {
            Ok(vec![])
        }
        async fn execute_raw(&self, path: &str, _params: Value) -> Result<Value> {
            if path == "/export" {
                Ok(Value::String(self.export.clone()))
            } else {
                Ok(Value::Null)
            }
        }
    }

    fn store(dir: &std::path::Path, export: &str) -> SnapshotStore {
        SnapshotStore::new(
            dir,
            Arc::new(StubDevice { export: export.to_string() }),
            Arc::new(AuditLog::new(dir, 90)),
            SnapshotConfig::default(),
        )
    }

    const BASE_CONFIG: &str = "/ip firewall filter\nadd chain=input action=accept comment=allow-ssh\n";

    #[tokio::test]
    async fn create_snapshot_persists_and_indexes() {
        let dir = tempdir().unwrap();
        let s = store(dir.path(), BASE_CONFIG);
        let snap = s.create_snapshot(SnapshotTrigger::Manual).await.unwrap();
        let index = s.list_snapshots().await.unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index[0].id, snap.id);
        assert!(!snap.checksum.is_empty());
    }

    #[tokio::test]
    async fn retention_evicts_oldest_beyond_cap() {
        let dir = tempdir().unwrap();
        let mut config = SnapshotConfig::default();
        config.max_retained = 2;
        let s = SnapshotStore::new(
            dir.path(),
            Arc::new(StubDevice { export: BASE_CONFIG.to_string() }),
            Arc::new(AuditLog::new(dir.path(), 90)),
            config,
        );
        let first = s.create_snapshot(SnapshotTrigger::Auto).await.unwrap();
        s.create_snapshot(SnapshotTrigger::Auto).await.unwrap();
        s.create_snapshot(SnapshotTrigger::Auto).await.unwrap();

        let index = s.list_snapshots().await.unwrap();
        assert_eq!(index.len(), 2);
        assert!(!index.iter().any(|snap| snap.id == first.id));
    }

    #[tokio::test]
    async fn diff_detects_addition_modification_and_deletion() {
        let old = "/ip firewall filter\nadd chain=input action=accept comment=allow-ssh\nadd chain=input action=drop comment=block-telnet\n";
        let new = "/ip firewall filter\nadd chain=input action=accept comment=allow-ssh port=22\n";
        let diff = diff_configs(old, new);
        assert_eq!(diff.deletions.len(), 1);
        assert!(diff.deletions[0].contains("block-telnet"));
        assert_eq!(diff.modifications.len(), 1);
    }

    #[tokio::test]
    async fn dangerous_change_flags_firewall_rule_deletion() {
        let old = "/ip firewall filter\nadd chain=input action=accept comment=allow-ssh\n";
        let new = "/ip firewall filter\n";
        let diff = diff_configs(old, new);
        let report = detect_dangerous_changes(&diff);
        assert!(report.detected);
        assert_eq!(report.overall_risk_level, Some(RiskLevel::High));
        assert_eq!(report.patterns[0].name, "firewall_rule_deletion");
    }

    #[tokio::test]
    async fn pre_remediation_snapshot_skips_dangerous_change_audit() {
        let dir = tempdir().unwrap();
        let s = store(dir.path(), BASE_CONFIG);
        s.create_snapshot(SnapshotTrigger::Manual).await.unwrap();

        let audit = AuditLog::new(dir.path(), 90);
        let before = audit.query(ops_common::model::AuditQuery::default()).await.unwrap().len();
        s.create_snapshot(SnapshotTrigger::PreRemediation).await.unwrap();
        let after = audit.query(ops_common::model::AuditQuery::default()).await.unwrap().len();
        // only the create_snapshot entry, never a dangerous-change entry
        assert_eq!(after - before, 1);
    }

    #[tokio::test]
    async fn restore_takes_pre_remediation_snapshot_first() {
        let dir = tempdir().unwrap();
        let s = store(dir.path(), BASE_CONFIG);
        let snap = s.create_snapshot(SnapshotTrigger::Manual).await.unwrap();
        let result = s.restore_snapshot(&snap.id).await.unwrap();
        let index = s.list_snapshots().await.unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index[1].trigger, SnapshotTrigger::PreRemediation);
        assert_eq!(result.attempted, result.succeeded);
    }
}
