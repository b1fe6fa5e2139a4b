//! Alert rule engine (spec §4.4): rule lifecycle plus per-tick evaluation
//! against the latest system/interface samples.
//!
//! Rules and active events are in-memory maps guarded by their own locks
//! (spec §5: "rule trigger state is confined to the rule engine"), mirroring
//! the teacher's `mcp-pipeline-guard::pipeline_state` map-under-lock shape.
//! `rules.json` and the per-day `events/YYYY-MM-DD.json` files are the two
//! persisted artifacts this component owns.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ops_audit::AuditLog;
use ops_common::model::{
    new_id, now, AlertEvent, AlertRule, AlertStatus, InterfaceSample, LinkStatus, Metric, RuleTriggerState,
    Severity, SystemSample,
};
use ops_common::ports::{Notification, NotificationDispatcher};
use ops_common::{fsio, Error, Result};
use ops_metrics::MetricsCollector;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const RULES_FILE: &str = "alerts/rules.json";
const EVENTS_DIR: &str = "alerts/events";

pub struct RuleEngineConfig {
    pub traffic_window_short_ms: u64,
    pub traffic_window_long_ms: u64,
}

impl Default for RuleEngineConfig {
    fn default() -> Self {
        Self {
            traffic_window_short_ms: 30_000,
            traffic_window_long_ms: 120_000,
        }
    }
}

pub struct RuleEngine {
    data_dir: PathBuf,
    rules: RwLock<HashMap<String, AlertRule>>,
    trigger_state: RwLock<HashMap<String, RuleTriggerState>>,
    active: RwLock<HashMap<String, AlertEvent>>,
    metrics: Arc<MetricsCollector>,
    audit: Arc<AuditLog>,
    notifier: Arc<dyn NotificationDispatcher>,
    config: RuleEngineConfig,
}

impl RuleEngine {
    pub async fn load(
        data_dir: impl Into<PathBuf>,
        metrics: Arc<MetricsCollector>,
        audit: Arc<AuditLog>,
        notifier: Arc<dyn NotificationDispatcher>,
        config: RuleEngineConfig,
    ) -> Result<Self> {
        let data_dir = data_dir.into();
        let rules: Vec<AlertRule> = read_rules_file(&data_dir).await?;
        let rules_map = rules.into_iter().map(|r| (r.id.clone(), r)).collect();
        let active = rebuild_active_alerts(&data_dir).await?;
        Ok(Self {
            data_dir,
            rules: RwLock::new(rules_map),
            trigger_state: RwLock::new(HashMap::new()),
            active: RwLock::new(active),
            metrics,
            audit,
            notifier,
            config,
        })
    }

    async fn persist_rules(&self) -> Result<()> {
        let rules = self.rules.read().await;
        let list: Vec<&AlertRule> = rules.values().collect();
        write_rules_file(&self.data_dir, &list).await
    }

    pub async fn create_rule(&self, mut rule: AlertRule) -> Result<AlertRule> {
        let ts = now();
        rule.id = new_id();
        rule.created_at = ts;
        rule.updated_at = ts;
        rule.last_triggered_at = None;
        self.rules.write().await.insert(rule.id.clone(), rule.clone());
        self.persist_rules().await?;
        self.audit
            .log("rule-engine", "rule_created", serde_json::json!({"ruleId": rule.id}))
            .await;
        Ok(rule)
    }

    pub async fn update_rule(&self, id: &str, mut updated: AlertRule) -> Result<AlertRule> {
        let mut rules = self.rules.write().await;
        let existing = rules.get(id).ok_or_else(|| Error::NotFound(format!("rule {id}")))?;
        updated.id = existing.id.clone();
        updated.created_at = existing.created_at;
        updated.updated_at = now();
        updated.last_triggered_at = existing.last_triggered_at;
        rules.insert(id.to_string(), updated.clone());
        drop(rules);
        self.persist_rules().await?;
        self.audit
            .log("rule-engine", "rule_updated", serde_json::json!({"ruleId": id}))
            .await;
        Ok(updated)
    }

    pub async fn delete_rule(&self, id: &str) -> Result<()> {
        let removed = self.rules.write().await.remove(id);
        if removed.is_none() {
            return Err(Error::NotFound(format!("rule {id}")));
        }
        self.persist_rules().await?;
        // Deleted rules auto-resolve silently on the next recovery pass
        // (spec §4.4 step 1); nothing to do here beyond persisting removal.
        self.audit
            .log("rule-engine", "rule_deleted", serde_json::json!({"ruleId": id}))
            .await;
        Ok(())
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<AlertRule> {
        let mut rules = self.rules.write().await;
        let rule = rules.get_mut(id).ok_or_else(|| Error::NotFound(format!("rule {id}")))?;
        rule.enabled = enabled;
        rule.updated_at = now();
        let updated = rule.clone();
        drop(rules);
        self.persist_rules().await?;
        Ok(updated)
    }

    pub async fn list_rules(&self) -> Vec<AlertRule> {
        self.rules.read().await.values().cloned().collect()
    }

    pub async fn get_active_alerts(&self) -> Vec<AlertEvent> {
        self.active.read().await.values().cloned().collect()
    }

    pub async fn get_alert_history(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<AlertEvent>> {
        let dir = self.data_dir.join(EVENTS_DIR);
        let mut matched = Vec::new();
        for day in fsio::list_days(&dir).await? {
            let events: Vec<AlertEvent> = fsio::read_day(&dir, &day).await?;
            matched.extend(events.into_iter().filter(|e| e.triggered_at >= from && e.triggered_at <= to));
        }
        matched.sort_by(|a, b| a.triggered_at.cmp(&b.triggered_at));
        Ok(matched)
    }

    pub async fn resolve_alert(&self, id: &str) -> Result<AlertEvent> {
        let rule_id = {
            let active = self.active.read().await;
            active
                .values()
                .find(|e| e.id == id)
                .map(|e| e.rule_id.clone())
                .ok_or_else(|| Error::NotFound(format!("active alert {id}")))?
        };
        self.resolve_by_rule_id(&rule_id, now()).await
    }

    async fn resolve_by_rule_id(&self, rule_id: &str, resolved_at: DateTime<Utc>) -> Result<AlertEvent> {
        let mut event = {
            let mut active = self.active.write().await;
            active.remove(rule_id).ok_or_else(|| Error::NotFound(format!("active alert for rule {rule_id}")))?
        };
        event.status = AlertStatus::Resolved;
        event.resolved_at = Some(resolved_at);
        self.append_event(&event).await?;
        Ok(event)
    }

    async fn append_event(&self, event: &AlertEvent) -> Result<()> {
        fsio::append_day_record(&self.data_dir.join(EVENTS_DIR), event.triggered_at, event).await
    }

    /// Run one evaluation tick: recovery pass, then trigger pass, per spec
    /// §4.4. Returns the alerts newly triggered this tick.
    pub async fn evaluate(&self, system: &SystemSample, interfaces: &[InterfaceSample]) -> Result<Vec<AlertEvent>> {
        self.run_recovery_pass(system, interfaces).await;
        self.run_trigger_pass(system, interfaces).await
    }

    async fn run_recovery_pass(&self, system: &SystemSample, interfaces: &[InterfaceSample]) {
        let active_rule_ids: Vec<String> = self.active.read().await.keys().cloned().collect();
        for rule_id in active_rule_ids {
            let rule = self.rules.read().await.get(&rule_id).cloned();
            let (still_triggering, rule_enabled) = match &rule {
                None => (false, false),
                Some(r) => (self.condition_holds(r, system, interfaces).await, r.enabled),
            };
            if still_triggering {
                continue;
            }
            let silent = rule.is_none() || !rule_enabled;
            match self.resolve_by_rule_id(&rule_id, now()).await {
                Ok(event) => {
                    self.audit
                        .log(
                            "rule-engine",
                            "alert_recovered",
                            serde_json::json!({"ruleId": rule_id, "alertId": event.id}),
                        )
                        .await;
                    if !silent {
                        let _ = self
                            .notifier
                            .send(
                                &event_channels(&rule),
                                Notification {
                                    kind: "recovery".into(),
                                    title: format!("Resolved: {}", event.rule_name),
                                    body: event.message.clone(),
                                    data: serde_json::json!({"alertId": event.id}),
                                    high_priority: false,
                                },
                            )
                            .await;
                    }
                }
                Err(e) => warn!(rule_id = %rule_id, error = %e, "failed to resolve active alert"),
            }
        }
    }

    async fn condition_holds(&self, rule: &AlertRule, system: &SystemSample, interfaces: &[InterfaceSample]) -> bool {
        match self.current_value(rule, system, interfaces).await {
            Some(CurrentValue::Numeric(v)) => rule.operator.evaluate(v, rule.threshold),
            Some(CurrentValue::LinkStatus(status)) => status == rule.effective_target_status(),
            None => false,
        }
    }

    async fn run_trigger_pass(&self, system: &SystemSample, interfaces: &[InterfaceSample]) -> Result<Vec<AlertEvent>> {
        let rule_ids: Vec<String> = self.rules.read().await.keys().cloned().collect();
        let mut triggered = Vec::new();

        for rule_id in rule_ids {
            let rule = match self.rules.read().await.get(&rule_id).cloned() {
                Some(r) if r.enabled => r,
                _ => continue,
            };

            if let Some(last) = rule.last_triggered_at {
                if (now() - last).num_milliseconds() < rule.cooldown_ms as i64 {
                    continue;
                }
            }

            let result = self.evaluate_single_rule(&rule, system, interfaces).await;
            match result {
                Ok(Some(event)) => triggered.push(event),
                Ok(None) => {}
                Err(e) => warn!(rule_id = %rule.id, error = %e, "rule evaluation failed; skipping"),
            }
        }
        Ok(triggered)
    }

    async fn evaluate_single_rule(
        &self,
        rule: &AlertRule,
        system: &SystemSample,
        interfaces: &[InterfaceSample],
    ) -> Result<Option<AlertEvent>> {
        let value = match self.current_value(rule, system, interfaces).await {
            Some(v) => v,
            None => return Ok(None),
        };

        let met = match value {
            CurrentValue::Numeric(v) => rule.operator.evaluate(v, rule.threshold),
            CurrentValue::LinkStatus(status) => status == rule.effective_target_status(),
        };

        let mut states = self.trigger_state.write().await;
        let state = states.entry(rule.id.clone()).or_insert_with(|| RuleTriggerState {
            rule_id: rule.id.clone(),
            consecutive_count: 0,
            last_evaluated_at: None,
        });
        state.last_evaluated_at = Some(now());
        if met {
            state.consecutive_count += 1;
        } else {
            state.consecutive_count = 0;
        }
        let consecutive_count = state.consecutive_count;
        drop(states);

        if consecutive_count < rule.duration_samples {
            return Ok(None);
        }
        if self.active.read().await.contains_key(&rule.id) {
            return Ok(None);
        }

        let numeric_value = match value {
            CurrentValue::Numeric(v) => v,
            CurrentValue::LinkStatus(LinkStatus::Up) => 1.0,
            CurrentValue::LinkStatus(LinkStatus::Down) => 0.0,
        };

        let event = AlertEvent {
            id: new_id(),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            severity: rule.severity,
            metric: rule.metric,
            current_value: numeric_value,
            threshold: rule.threshold,
            message: format_alert_message(rule, numeric_value),
            ai_analysis: None,
            status: AlertStatus::Active,
            triggered_at: now(),
            resolved_at: None,
            auto_response_result: None,
        };

        {
            let mut rules = self.rules.write().await;
            if let Some(r) = rules.get_mut(&rule.id) {
                r.last_triggered_at = Some(event.triggered_at);
            }
        }
        self.trigger_state.write().await.get_mut(&rule.id).map(|s| s.consecutive_count = 0);
        self.active.write().await.insert(rule.id.clone(), event.clone());
        self.append_event(&event).await?;
        self.audit
            .log("rule-engine", "alert_trigger", serde_json::json!({"ruleId": rule.id, "alertId": event.id}))
            .await;

        let _ = self
            .notifier
            .send(
                &rule.channels,
                Notification {
                    kind: "alert".into(),
                    title: event.rule_name.clone(),
                    body: event.message.clone(),
                    data: serde_json::json!({"alertId": event.id}),
                    high_priority: matches!(rule.severity, Severity::Critical | Severity::Emergency),
                },
            )
            .await;

        Ok(Some(event))
    }

    async fn current_value(
        &self,
        rule: &AlertRule,
        system: &SystemSample,
        interfaces: &[InterfaceSample],
    ) -> Option<CurrentValue> {
        match rule.metric {
            Metric::Cpu => Some(CurrentValue::Numeric(system.cpu_pct as f64)),
            Metric::Memory => Some(CurrentValue::Numeric((100.0 - system.mem_free_pct) as f64)),
            Metric::Disk => Some(CurrentValue::Numeric((100.0 - system.disk_free_pct) as f64)),
            Metric::InterfaceStatus => {
                let label = rule.metric_label.as_deref()?;
                match interfaces.iter().find(|i| i.name == label) {
                    Some(i) => Some(CurrentValue::LinkStatus(i.status)),
                    None => {
                        warn!(rule_id = %rule.id, interface = label, "interface_status rule references unknown interface");
                        None
                    }
                }
            }
            Metric::InterfaceTraffic => {
                let label = rule.metric_label.as_deref()?;
                self.interface_traffic_kbps(label).await
            }
        }
    }

    async fn interface_traffic_kbps(&self, name: &str) -> Option<CurrentValue> {
        let key = format!("interface:{name}");
        let end = now();
        for window_ms in [self.config.traffic_window_short_ms, self.config.traffic_window_long_ms] {
            let start = end - chrono::Duration::milliseconds(window_ms as i64);
            let points = self.metrics.get_history(&key, start, end).await.ok()?;
            if points.len() < 2 {
                continue;
            }
            let first = points.first().unwrap();
            let last = points.last().unwrap();
            let elapsed_sec = (last.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0;
            if elapsed_sec <= 0.0 {
                continue;
            }
            let bytes_per_sec = (last.value - first.value) / elapsed_sec;
            return Some(CurrentValue::Numeric(bytes_per_sec / 1024.0));
        }
        debug!(interface = name, "no traffic history in either window; skipping interface_traffic rule");
        None
    }
}

#[derive(Debug, Clone, Copy)]
enum CurrentValue {
    Numeric(f64),
    LinkStatus(LinkStatus),
}

fn event_channels(rule: &Option<AlertRule>) -> Vec<String> {
    rule.as_ref().map(|r| r.channels.clone()).unwrap_or_default()
}

fn format_alert_message(rule: &AlertRule, value: f64) -> String {
    match rule.metric {
        Metric::InterfaceStatus => format!(
            "{} is {:?} (expected {:?})",
            rule.metric_label.as_deref().unwrap_or("interface"),
            if value >= 1.0 { LinkStatus::Up } else { LinkStatus::Down },
            rule.effective_target_status()
        ),
        _ => format!("{} {:?} threshold {:.2} (current {value:.2})", rule.name, rule.operator, rule.threshold),
    }
}

/// Rebuild the active-alert map from the last 7 days of persisted event
/// history (spec §9: unflushed in-memory state is at-most-once, but
/// persisted active alerts survive a restart by replay).
async fn rebuild_active_alerts(data_dir: &PathBuf) -> Result<HashMap<String, AlertEvent>> {
    let dir = data_dir.join(EVENTS_DIR);
    let cutoff = now() - chrono::Duration::days(7);
    let mut latest_by_rule: HashMap<String, AlertEvent> = HashMap::new();

    for day in fsio::list_days(&dir).await? {
        if day.as_str() < day_key_str(cutoff).as_str() {
            continue;
        }
        let events: Vec<AlertEvent> = fsio::read_day(&dir, &day).await?;
        for event in events {
            latest_by_rule
                .entry(event.rule_id.clone())
                .and_modify(|existing| {
                    if event.triggered_at > existing.triggered_at {
                        *existing = event.clone();
                    }
                })
                .or_insert(event);
        }
    }

    latest_by_rule.retain(|_, event| event.status == AlertStatus::Active);
    Ok(latest_by_rule)
}

fn day_key_str(ts: DateTime<Utc>) -> String {
    ops_common::model::day_key(ts)
}

async fn read_rules_file(data_dir: &PathBuf) -> Result<Vec<AlertRule>> {
    let path = data_dir.join(RULES_FILE);
    match tokio::fs::read(&path).await {
        Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(Error::from),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(Error::Io(e.to_string())),
    }
}

async fn write_rules_file(data_dir: &PathBuf, rules: &[&AlertRule]) -> Result<()> {
    let path = data_dir.join(RULES_FILE);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| Error::Io(e.to_string()))?;
    }
    let bytes = serde_json::to_vec_pretty(rules)?;
    tokio::fs::write(&path, bytes).await.map_err(|e| Error::Io(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ops_common::model::Operator;
    use ops_common::ports::NullDeviceClient;
    use tempfile::tempdir;

    struct NullNotifier;

    #[async_trait]
    impl NotificationDispatcher for NullNotifier {
        async fn send(&self, _channels: &[String], _notification: Notification) -> Result<()> {
            Ok(())
        }
    }

    fn cpu_rule(threshold: f64, duration_samples: u32) -> AlertRule {
        let ts = now();
        AlertRule {
            id: String::new(),
            name: "cpu high".into(),
            enabled: true,
            metric: Metric::Cpu,
            metric_label: None,
            operator: Operator::Gt,
            threshold,
            target_status: None,
            duration_samples,
            cooldown_ms: 60_000,
            severity: Severity::Warning,
            channels: vec!["ops".into()],
            auto_response: None,
            created_at: ts,
            updated_at: ts,
            last_triggered_at: None,
        }
    }

    fn sample(cpu_pct: f32) -> SystemSample {
        SystemSample {
            timestamp: now(),
            cpu_pct,
            mem_total: 1000,
            mem_used: 400,
            mem_free_pct: 60.0,
            disk_total: 1000,
            disk_used: 400,
            disk_free_pct: 60.0,
            uptime_sec: 100,
        }
    }

    async fn engine(dir: &std::path::Path) -> RuleEngine {
        let audit = Arc::new(AuditLog::new(dir, 90));
        let metrics = Arc::new(MetricsCollector::new(Arc::new(NullDeviceClient), dir, 7, 3));
        RuleEngine::load(dir, metrics, audit, Arc::new(NullNotifier), RuleEngineConfig::default())
            .await
            .unwrap()
    }

    fn alert_event(rule_id: &str, status: AlertStatus) -> AlertEvent {
        AlertEvent {
            id: new_id(),
            rule_id: rule_id.to_string(),
            rule_name: "cpu high".into(),
            severity: Severity::Warning,
            metric: Metric::Cpu,
            current_value: 95.0,
            threshold: 90.0,
            message: "cpu high".into(),
            ai_analysis: None,
            status,
            triggered_at: now(),
            resolved_at: None,
            auto_response_result: None,
        }
    }

    #[tokio::test]
    async fn restart_rebuilds_active_alerts_from_event_history() {
        let dir = tempdir().unwrap();
        fsio::append_day_record(&dir.path().join(EVENTS_DIR), now(), &alert_event("cpu-high", AlertStatus::Active))
            .await
            .unwrap();
        fsio::append_day_record(&dir.path().join(EVENTS_DIR), now(), &alert_event("mem-high", AlertStatus::Resolved))
            .await
            .unwrap();

        let reloaded = engine(dir.path()).await;
        let active = reloaded.get_active_alerts().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].rule_id, "cpu-high");
    }

    #[tokio::test]
    async fn triggers_after_consecutive_count_reached() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;
        let rule = engine.create_rule(cpu_rule(80.0, 2)).await.unwrap();

        let triggered = engine.evaluate(&sample(90.0), &[]).await.unwrap();
        assert!(triggered.is_empty());

        let triggered = engine.evaluate(&sample(90.0), &[]).await.unwrap();
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].rule_id, rule.id);

        let active = engine.get_active_alerts().await;
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn resets_consecutive_count_when_condition_not_met() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;
        engine.create_rule(cpu_rule(80.0, 2)).await.unwrap();

        engine.evaluate(&sample(90.0), &[]).await.unwrap();
        engine.evaluate(&sample(10.0), &[]).await.unwrap();
        let triggered = engine.evaluate(&sample(90.0), &[]).await.unwrap();
        assert!(triggered.is_empty());
    }

    #[tokio::test]
    async fn recovery_pass_resolves_active_alert() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;
        engine.create_rule(cpu_rule(80.0, 1)).await.unwrap();

        engine.evaluate(&sample(95.0), &[]).await.unwrap();
        assert_eq!(engine.get_active_alerts().await.len(), 1);

        engine.evaluate(&sample(10.0), &[]).await.unwrap();
        assert!(engine.get_active_alerts().await.is_empty());
    }

    #[tokio::test]
    async fn interface_status_rule_skips_unknown_interface() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;
        let ts = now();
        let rule = AlertRule {
            id: String::new(),
            name: "wan down".into(),
            enabled: true,
            metric: Metric::InterfaceStatus,
            metric_label: Some("ether1".into()),
            operator: Operator::Eq,
            threshold: 0.0,
            target_status: Some(LinkStatus::Down),
            duration_samples: 1,
            cooldown_ms: 0,
            severity: Severity::Critical,
            channels: vec![],
            auto_response: None,
            created_at: ts,
            updated_at: ts,
            last_triggered_at: None,
        };
        engine.create_rule(rule).await.unwrap();
        let triggered = engine.evaluate(&sample(10.0), &[]).await.unwrap();
        assert!(triggered.is_empty());
    }

    #[tokio::test]
    async fn cooldown_suppresses_retrigger() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;
        let mut rule = cpu_rule(80.0, 1);
        rule.cooldown_ms = 3_600_000;
        engine.create_rule(rule).await.unwrap();

        let first = engine.evaluate(&sample(90.0), &[]).await.unwrap();
        assert_eq!(first.len(), 1);
        engine.resolve_alert(&first[0].id).await.unwrap();

        let second = engine.evaluate(&sample(90.0), &[]).await.unwrap();
        assert!(second.is_empty());
    }
}
