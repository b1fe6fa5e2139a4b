//! Shared data model (spec §3).
//!
//! All identifiers are opaque string UUIDs. All timestamps are
//! `DateTime<Utc>`; where a spec field is documented in milliseconds it is
//! still modeled as `DateTime<Utc>` here (`.timestamp_millis()` recovers the
//! integer form), matching how the rest of the workspace handles time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Generate a fresh opaque entity id.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current wall-clock time. Centralized so tests can see where "now" is read;
/// production code always goes through here rather than calling `Utc::now()`
/// directly in component bodies.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// UTC calendar day used for file partitioning (`YYYY-MM-DD`).
pub fn day_key(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d").to_string()
}

// ---------------------------------------------------------------------
// Samples
// ---------------------------------------------------------------------

/// A single system resource sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_pct: f32,
    pub mem_total: u64,
    pub mem_used: u64,
    pub mem_free_pct: f32,
    pub disk_total: u64,
    pub disk_used: u64,
    pub disk_free_pct: f32,
    pub uptime_sec: u64,
}

impl SystemSample {
    /// Invariants from spec §3: `memUsed <= memTotal`, `used + free = total`.
    pub fn is_valid(&self) -> bool {
        self.mem_used <= self.mem_total
            && self.disk_used <= self.disk_total
            && (0.0..=100.0).contains(&self.cpu_pct)
            && (0.0..=100.0).contains(&self.mem_free_pct)
            && (0.0..=100.0).contains(&self.disk_free_pct)
    }
}

/// Interface link state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Up,
    Down,
}

/// A single per-interface sample. Counters are monotonically
/// non-decreasing across samples from a stable device; a decrease signals a
/// counter reset and invalidates derived rates for that interval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterfaceSample {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub status: LinkStatus,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
}

// ---------------------------------------------------------------------
// Alert rules
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Cpu,
    Memory,
    Disk,
    InterfaceStatus,
    /// Unit is KB/s — the rule's `threshold` is compared against the
    /// averaged rx+tx rate after conversion from bytes/sec, per spec §4.4
    /// step 2 and the Design Note in spec §9 about surfacing the unit
    /// explicitly.
    InterfaceTraffic,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Gt,
    Lt,
    Eq,
    Ne,
    Gte,
    Lte,
}

impl Operator {
    /// Evaluate `current <op> threshold` for numeric metrics.
    pub fn evaluate(&self, current: f64, threshold: f64) -> bool {
        match self {
            Operator::Gt => current > threshold,
            Operator::Lt => current < threshold,
            Operator::Eq => (current - threshold).abs() < f64::EPSILON,
            Operator::Ne => (current - threshold).abs() >= f64::EPSILON,
            Operator::Gte => current >= threshold,
            Operator::Lte => current <= threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl Severity {
    /// Escalate one rank, saturating at `Emergency`. Used by composite
    /// aggregation (spec §4.5) and noise-filter AI assist confidence scoring.
    pub fn escalate(self) -> Self {
        match self {
            Severity::Info => Severity::Warning,
            Severity::Warning => Severity::Critical,
            Severity::Critical => Severity::Emergency,
            Severity::Emergency => Severity::Emergency,
        }
    }

    /// Syslog PRI severity (0-7) to this severity, per spec §4.5.
    pub fn from_syslog_severity(sev: u8) -> Self {
        match sev {
            0 => Severity::Emergency,
            1 | 2 => Severity::Critical,
            3 | 4 => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub metric: Metric,
    pub metric_label: Option<String>,
    pub operator: Operator,
    pub threshold: f64,
    pub target_status: Option<LinkStatus>,
    pub duration_samples: u32,
    pub cooldown_ms: u64,
    pub severity: Severity,
    pub channels: Vec<String>,
    pub auto_response: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

impl AlertRule {
    /// `targetStatus` defaults to `down` and only applies to
    /// `interface_status` rules (spec §3).
    pub fn effective_target_status(&self) -> LinkStatus {
        self.target_status.unwrap_or(LinkStatus::Down)
    }
}

/// In-memory per-rule trigger state (spec §3). Never persisted.
#[derive(Debug, Clone, Default)]
pub struct RuleTriggerState {
    pub rule_id: String,
    pub consecutive_count: u32,
    pub last_evaluated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertEvent {
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub metric: Metric,
    pub current_value: f64,
    pub threshold: f64,
    pub message: String,
    pub ai_analysis: Option<String>,
    pub status: AlertStatus,
    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub auto_response_result: Option<String>,
}

impl AlertEvent {
    /// `status=resolved <=> resolvedAt != null && resolvedAt >= triggeredAt`.
    pub fn is_consistent(&self) -> bool {
        match (self.status, self.resolved_at) {
            (AlertStatus::Resolved, Some(r)) => r >= self.triggered_at,
            (AlertStatus::Resolved, None) => false,
            (AlertStatus::Active, None) => true,
            (AlertStatus::Active, Some(_)) => false,
        }
    }
}

// ---------------------------------------------------------------------
// Unified / composite events
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Syslog,
    Metrics,
    Manual,
    Api,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceInfo {
    pub hostname: String,
    pub model: String,
    pub version: String,
    pub ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertRuleInfo {
    pub rule_id: String,
    pub rule_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnifiedEvent {
    pub id: String,
    pub source: EventSource,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub category: String,
    pub message: String,
    pub raw_data: serde_json::Value,
    pub metadata: HashMap<String, String>,
    pub device_info: Option<DeviceInfo>,
    pub alert_rule_info: Option<AlertRuleInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Aggregation {
    pub count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompositeEvent {
    #[serde(flatten)]
    pub base: UnifiedEvent,
    pub is_composite: bool,
    pub child_event_ids: Vec<String>,
    pub aggregation: Aggregation,
}

impl CompositeEvent {
    pub fn is_consistent(&self) -> bool {
        self.aggregation.first_seen <= self.aggregation.last_seen
            && self.aggregation.count as usize == self.child_event_ids.len()
    }
}

// ---------------------------------------------------------------------
// Fingerprint cache
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FingerprintEntry {
    pub fingerprint: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u32,
    pub expires_at: DateTime<Utc>,
}

impl FingerprintEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

// ---------------------------------------------------------------------
// Noise filter
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceType {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recurrence {
    #[serde(rename = "type")]
    pub kind: RecurrenceType,
    pub day_of_week: Option<Vec<u8>>,
    pub day_of_month: Option<Vec<u8>>,
    pub start_hhmm: String,
    pub end_hhmm: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MaintenanceWindow {
    pub id: String,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub resources: Vec<String>,
    pub recurring: Option<Recurrence>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnownIssue {
    pub id: String,
    pub pattern: String,
    pub description: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub auto_resolve: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilterReason {
    Maintenance,
    KnownIssue,
    Transient,
    AiFiltered,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterResult {
    pub filtered: bool,
    pub reason: Option<FilterReason>,
    pub details: String,
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserFeedback {
    Correct,
    FalsePositive,
    FalseNegative,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterFeedback {
    pub alert_id: String,
    pub filter_result: FilterResult,
    pub user_feedback: UserFeedback,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// Root cause analysis
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RootCause {
    pub id: String,
    pub category: String,
    pub description: String,
    pub confidence: u8,
    pub evidence: Vec<String>,
    pub related_alerts: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimelineRole {
    Trigger,
    Cause,
    Effect,
    Symptom,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineEntry {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub role: TimelineRole,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImpactScope {
    Local,
    Partial,
    Widespread,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Impact {
    pub scope: ImpactScope,
    pub services: Vec<String>,
    pub network_segments: Vec<String>,
    pub affected_users_estimate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimilarIncident {
    pub analysis_id: String,
    pub alert_id: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RootCauseAnalysis {
    pub id: String,
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub root_causes: Vec<RootCause>,
    pub timeline: Vec<TimelineEntry>,
    pub impact: Impact,
    pub similar_incidents: Option<Vec<SimilarIncident>>,
}

// ---------------------------------------------------------------------
// Decision engine
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    AutoExecute,
    NotifyAndWait,
    Escalate,
    Silence,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Factor {
    pub name: String,
    pub score: f32,
    pub weight: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub id: String,
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: DecisionAction,
    pub reasoning: String,
    pub factors: Vec<Factor>,
    pub matched_rule_id: Option<String>,
    pub executed: bool,
    pub execution_result: Option<String>,
}

// ---------------------------------------------------------------------
// Configuration snapshots
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotTrigger {
    Auto,
    Manual,
    PreRemediation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigSnapshot {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub trigger: SnapshotTrigger,
    pub size: u64,
    pub checksum: String,
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DangerousChangeMatch {
    pub name: String,
    pub risk: RiskLevel,
    pub line: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DangerousChangeReport {
    pub detected: bool,
    pub overall_risk_level: Option<RiskLevel>,
    pub patterns: Vec<DangerousChangeMatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConfigDiff {
    pub additions: Vec<String>,
    pub modifications: Vec<String>,
    pub deletions: Vec<String>,
}

// ---------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub action: Option<String>,
    pub actor: Option<String>,
    pub limit: Option<usize>,
}
