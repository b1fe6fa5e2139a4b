//! Event preprocessor (spec §4.5): normalize multi-source inputs into a
//! `UnifiedEvent`, aggregate bursts into `CompositeEvent`s, detect interface
//! flapping, and enrich with cached device identity.

pub mod syslog;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use ops_common::model::{
    new_id, now, Aggregation, CompositeEvent, DeviceInfo, EventSource, Severity, UnifiedEvent,
};
use ops_common::ports::DeviceClient;
use ops_common::Result;
use regex::Regex;
use tokio::sync::RwLock;
use tracing::debug;

use syslog::{parse_syslog, primary_topic, SyslogMessage};

pub struct PreprocessorConfig {
    pub flap_window_ms: u64,
    pub flap_min_changes: u32,
    pub aggregation_window_ms: u64,
    pub device_info_ttl_ms: u64,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            flap_window_ms: 30_000,
            flap_min_changes: 2,
            aggregation_window_ms: 30_000,
            device_info_ttl_ms: 300_000,
        }
    }
}

// ---------------------------------------------------------------------
// Normalize
// ---------------------------------------------------------------------

/// Map a parsed syslog message to a `UnifiedEvent`.
pub fn normalize_syslog(msg: &SyslogMessage) -> UnifiedEvent {
    let severity = Severity::from_syslog_severity(msg.severity);
    let category = primary_topic(&msg.topic);
    UnifiedEvent {
        id: new_id(),
        source: EventSource::Syslog,
        timestamp: now(),
        severity,
        category,
        message: msg.message.clone(),
        raw_data: serde_json::json!({
            "facility": msg.facility,
            "severity": msg.severity,
            "hostname": msg.hostname,
            "topic": msg.topic,
        }),
        metadata: HashMap::new(),
        device_info: None,
        alert_rule_info: None,
    }
}

/// Map a metric-origin alert into a `UnifiedEvent`. `metric` is the raw
/// metric key (`cpu`, `memory`, `disk`, `interface_status`, ...).
pub fn normalize_metric(
    metric: &str,
    severity: Severity,
    message: String,
    rule_id: String,
    rule_name: String,
) -> UnifiedEvent {
    let category = if metric.starts_with("interface") {
        "interface"
    } else {
        "system"
    };
    UnifiedEvent {
        id: new_id(),
        source: EventSource::Metrics,
        timestamp: now(),
        severity,
        category: category.to_string(),
        message,
        raw_data: serde_json::json!({"metric": metric}),
        metadata: HashMap::new(),
        device_info: None,
        alert_rule_info: Some(ops_common::model::AlertRuleInfo { rule_id, rule_name }),
    }
}

/// Stateless constructor for manually-created events (e.g. from an operator
/// action), per spec §4.5.
pub fn create_manual_event(severity: Severity, category: String, message: String) -> UnifiedEvent {
    UnifiedEvent {
        id: new_id(),
        source: EventSource::Manual,
        timestamp: now(),
        severity,
        category,
        message,
        raw_data: serde_json::Value::Null,
        metadata: HashMap::new(),
        device_info: None,
        alert_rule_info: None,
    }
}

/// Stateless constructor for API-injected events, per spec §4.5.
pub fn create_api_event(severity: Severity, category: String, message: String, raw_data: serde_json::Value) -> UnifiedEvent {
    UnifiedEvent {
        id: new_id(),
        source: EventSource::Api,
        timestamp: now(),
        severity,
        category,
        message,
        raw_data,
        metadata: HashMap::new(),
        device_info: None,
        alert_rule_info: None,
    }
}

// ---------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------

struct AggregationRule {
    name: &'static str,
    pattern: Regex,
    min_count: usize,
    composite_pattern: &'static str,
}

static AGGREGATION_RULES: Lazy<Vec<AggregationRule>> = Lazy::new(|| {
    vec![
        AggregationRule {
            name: "interface-flap-messages",
            pattern: Regex::new(r"(?i)interface.*(flap|unstable|intermittent)").unwrap(),
            min_count: 3,
            composite_pattern: "interface-flapping",
        },
        AggregationRule {
            name: "auth-failure-burst",
            pattern: Regex::new(r"(?i)(login|authentication)\s+(failed|failure)").unwrap(),
            min_count: 5,
            composite_pattern: "auth-failure-burst",
        },
        AggregationRule {
            name: "connection-issue-burst",
            pattern: Regex::new(r"(?i)connection\s+(lost|refused|timeout|reset)").unwrap(),
            min_count: 5,
            composite_pattern: "connection-issue-burst",
        },
    ]
});

static INTERFACE_STATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(\S+)\s+link\s+(up|down)").unwrap());

pub struct Aggregator {
    window_ms: u64,
    buffers: RwLock<HashMap<&'static str, VecDeque<(DateTime<Utc>, UnifiedEvent)>>>,
    flap_window_ms: u64,
    flap_min_changes: u32,
    flap_state: RwLock<HashMap<String, VecDeque<DateTime<Utc>>>>,
    flap_events: RwLock<HashMap<String, Vec<UnifiedEvent>>>,
}

impl Aggregator {
    pub fn new(config: &PreprocessorConfig) -> Self {
        Self {
            window_ms: config.aggregation_window_ms,
            buffers: RwLock::new(HashMap::new()),
            flap_window_ms: config.flap_window_ms,
            flap_min_changes: config.flap_min_changes,
            flap_state: RwLock::new(HashMap::new()),
            flap_events: RwLock::new(HashMap::new()),
        }
    }

    /// Feed one normalized event through the aggregation rules and the
    /// dedicated flap detector. Returns a composite event if a rule's
    /// threshold is reached this call.
    pub async fn ingest(&self, event: UnifiedEvent) -> Option<CompositeEvent> {
        if let Some(composite) = self.ingest_flap(&event).await {
            return Some(composite);
        }
        self.ingest_aggregation_rules(event).await
    }

    async fn ingest_aggregation_rules(&self, event: UnifiedEvent) -> Option<CompositeEvent> {
        for rule in AGGREGATION_RULES.iter() {
            if !rule.pattern.is_match(&event.message) && !rule.pattern.is_match(&event.category) {
                continue;
            }
            let now_ts = now();
            let cutoff = now_ts - chrono::Duration::milliseconds(self.window_ms as i64);
            let mut buffers = self.buffers.write().await;
            let buf = buffers.entry(rule.name).or_default();
            buf.retain(|(ts, _)| *ts >= cutoff);
            buf.push_back((now_ts, event.clone()));

            if buf.len() >= rule.min_count {
                let events: Vec<UnifiedEvent> = buf.iter().map(|(_, e)| e.clone()).collect();
                buf.clear();
                drop(buffers);
                return Some(build_composite(&events, rule.composite_pattern));
            }
            return None;
        }
        None
    }

    async fn ingest_flap(&self, event: &UnifiedEvent) -> Option<CompositeEvent> {
        let caps = INTERFACE_STATE_RE.captures(&event.message)?;
        let iface = caps[1].to_string();
        let now_ts = now();
        let cutoff = now_ts - chrono::Duration::milliseconds(self.flap_window_ms as i64);

        let mut states = self.flap_state.write().await;
        let changes = states.entry(iface.clone()).or_default();
        changes.retain(|ts| *ts >= cutoff);
        changes.push_back(now_ts);
        let count = changes.len();

        let mut flap_events = self.flap_events.write().await;
        let buffered = flap_events.entry(iface.clone()).or_default();
        buffered.retain(|e| e.timestamp >= cutoff);
        buffered.push(event.clone());

        if count as u32 >= self.flap_min_changes {
            let events = std::mem::take(buffered);
            changes.clear();
            debug!(interface = %iface, count, "interface flap threshold reached");
            return Some(build_composite(&events, "interface-flapping"));
        }
        None
    }
}

fn build_composite(events: &[UnifiedEvent], pattern: &str) -> CompositeEvent {
    let first_seen = events.iter().map(|e| e.timestamp).min().unwrap_or_else(now);
    let last_seen = events.iter().map(|e| e.timestamp).max().unwrap_or_else(now);
    let max_severity = events.iter().map(|e| e.severity).max().unwrap_or(Severity::Info);
    let base = events.last().cloned().unwrap_or_else(|| create_manual_event(max_severity, "aggregation".into(), pattern.to_string()));

    CompositeEvent {
        base: UnifiedEvent {
            id: new_id(),
            source: base.source,
            timestamp: last_seen,
            severity: max_severity.escalate(),
            category: base.category.clone(),
            message: format!("{pattern}: {} occurrences", events.len()),
            raw_data: serde_json::json!({"pattern": pattern}),
            metadata: HashMap::new(),
            device_info: base.device_info.clone(),
            alert_rule_info: None,
        },
        is_composite: true,
        child_event_ids: events.iter().map(|e| e.id.clone()).collect(),
        aggregation: Aggregation {
            count: events.len() as u32,
            first_seen,
            last_seen,
            pattern: pattern.to_string(),
        },
    }
}

// ---------------------------------------------------------------------
// Enrichment
// ---------------------------------------------------------------------

pub struct DeviceInfoCache {
    device: Arc<dyn DeviceClient>,
    ttl_ms: u64,
    cached: RwLock<Option<(DeviceInfo, DateTime<Utc>)>>,
}

impl DeviceInfoCache {
    pub fn new(device: Arc<dyn DeviceClient>, ttl_ms: u64) -> Self {
        Self {
            device,
            ttl_ms,
            cached: RwLock::new(None),
        }
    }

    pub async fn get(&self) -> Option<DeviceInfo> {
        {
            let cached = self.cached.read().await;
            if let Some((info, fetched_at)) = cached.as_ref() {
                if now() - *fetched_at < chrono::Duration::milliseconds(self.ttl_ms as i64) {
                    return Some(info.clone());
                }
            }
        }
        let info = self.fetch().await?;
        *self.cached.write().await = Some((info.clone(), now()));
        Some(info)
    }

    async fn fetch(&self) -> Option<DeviceInfo> {
        if !self.device.is_connected().await {
            return None;
        }
        let identity = self.device.print("/system/identity").await.ok()?;
        let resource = self.device.print("/system/resource").await.ok()?;
        let routerboard = self.device.print("/system/routerboard").await.ok().unwrap_or_default();
        let address = self.device.print("/ip/address").await.ok().unwrap_or_default();

        let hostname = identity.first().and_then(|v| v.get("name")).and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
        let version = resource.first().and_then(|v| v.get("version")).and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
        let model = routerboard.first().and_then(|v| v.get("model")).and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
        let ip = address
            .first()
            .and_then(|v| v.get("address"))
            .and_then(|v| v.as_str())
            .map(|s| s.split('/').next().unwrap_or(s).to_string())
            .unwrap_or_else(|| "unknown".to_string());

        Some(DeviceInfo { hostname, model, version, ip })
    }

    /// Attach cached device identity to an event; best-effort, never fails.
    pub async fn enrich(&self, mut event: UnifiedEvent) -> UnifiedEvent {
        event.device_info = self.get().await;
        event
    }
}
