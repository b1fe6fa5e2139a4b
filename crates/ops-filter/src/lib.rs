//! Noise filter (spec §4.6): maintenance windows, known-issue patterns,
//! transient-flap suppression, and a best-effort AI-assist pass for
//! `info`-severity events, checked in that priority order.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};
use once_cell::sync::Lazy;
use ops_common::model::{
    now, FilterFeedback, FilterReason, FilterResult, KnownIssue, MaintenanceWindow, RecurrenceType, UnifiedEvent,
};
use ops_common::ports::{LlmAnalysisRequest, LlmAnalyzer};
use ops_common::utils::wildcard_match;
use ops_common::{fsio, Error, Result};
use regex::Regex;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const MAINTENANCE_FILE: &str = "filters/maintenance.json";
const KNOWN_ISSUES_FILE: &str = "filters/known-issues.json";
const FEEDBACK_DIR: &str = "filters/feedback";

static NOISE_KEYWORDS: &[&str] = &["noise", "benign", "non-issue", "expected", "informational"];
static INTERFACE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(ether\d+|wlan\d+|sfp[-+]?\d+|vlan\d+|bridge\d*)\b").unwrap());

pub struct FilterConfig {
    pub transient_window_ms: u64,
    pub transient_min_changes: u32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            transient_window_ms: 30_000,
            transient_min_changes: 3,
        }
    }
}

pub struct NoiseFilter {
    data_dir: PathBuf,
    maintenance_windows: RwLock<Vec<MaintenanceWindow>>,
    known_issues: RwLock<Vec<KnownIssue>>,
    transient_state: RwLock<HashMap<String, VecDeque<DateTime<Utc>>>>,
    llm: Arc<dyn LlmAnalyzer>,
    config: FilterConfig,
}

impl NoiseFilter {
    pub async fn load(data_dir: impl Into<PathBuf>, llm: Arc<dyn LlmAnalyzer>, config: FilterConfig) -> Result<Self> {
        let data_dir = data_dir.into();
        let windows = read_json_file(&data_dir.join(MAINTENANCE_FILE)).await?;
        let issues = read_json_file(&data_dir.join(KNOWN_ISSUES_FILE)).await?;
        Ok(Self {
            data_dir,
            maintenance_windows: RwLock::new(windows),
            known_issues: RwLock::new(issues),
            transient_state: RwLock::new(HashMap::new()),
            llm,
            config,
        })
    }

    pub async fn add_maintenance_window(&self, window: MaintenanceWindow) -> Result<()> {
        let mut windows = self.maintenance_windows.write().await;
        windows.push(window);
        write_json_file(&self.data_dir.join(MAINTENANCE_FILE), &*windows).await
    }

    pub async fn remove_maintenance_window(&self, id: &str) -> Result<()> {
        let mut windows = self.maintenance_windows.write().await;
        let before = windows.len();
        windows.retain(|w| w.id != id);
        if windows.len() == before {
            return Err(Error::NotFound(format!("maintenance window {id}")));
        }
        write_json_file(&self.data_dir.join(MAINTENANCE_FILE), &*windows).await
    }

    pub async fn add_known_issue(&self, issue: KnownIssue) -> Result<()> {
        let mut issues = self.known_issues.write().await;
        issues.push(issue);
        write_json_file(&self.data_dir.join(KNOWN_ISSUES_FILE), &*issues).await
    }

    pub async fn remove_known_issue(&self, id: &str) -> Result<()> {
        let mut issues = self.known_issues.write().await;
        let before = issues.len();
        issues.retain(|i| i.id != id);
        if issues.len() == before {
            return Err(Error::NotFound(format!("known issue {id}")));
        }
        write_json_file(&self.data_dir.join(KNOWN_ISSUES_FILE), &*issues).await
    }

    /// Decide whether `event` is noise, checking maintenance windows, known
    /// issues, transient flapping, then (info severity only) AI assist, in
    /// that order.
    pub async fn filter(&self, event: &UnifiedEvent) -> FilterResult {
        let ts = now();

        if let Some(result) = self.check_maintenance(event, ts).await {
            return result;
        }
        if let Some(result) = self.check_known_issue(event, ts).await {
            return result;
        }
        if let Some(result) = self.check_transient(event, ts).await {
            return result;
        }
        if event.severity == ops_common::model::Severity::Info {
            if let Some(result) = self.check_ai_assist(event).await {
                return result;
            }
        }

        FilterResult {
            filtered: false,
            reason: None,
            details: "no filter matched".into(),
            confidence: None,
        }
    }

    async fn check_maintenance(&self, event: &UnifiedEvent, ts: DateTime<Utc>) -> Option<FilterResult> {
        let windows = self.maintenance_windows.read().await;
        for window in windows.iter() {
            if !window_time_matches(window, ts) {
                continue;
            }
            if window.resources.is_empty() {
                return Some(FilterResult {
                    filtered: true,
                    reason: Some(FilterReason::Maintenance),
                    details: format!("within maintenance window {}", window.name),
                    confidence: None,
                });
            }
            let resources = derive_resources(event);
            if window
                .resources
                .iter()
                .any(|pattern| resources.iter().any(|r| wildcard_match(pattern, r)))
            {
                return Some(FilterResult {
                    filtered: true,
                    reason: Some(FilterReason::Maintenance),
                    details: format!("matched maintenance window {} resource list", window.name),
                    confidence: None,
                });
            }
        }
        None
    }

    async fn check_known_issue(&self, event: &UnifiedEvent, ts: DateTime<Utc>) -> Option<FilterResult> {
        let issues = self.known_issues.read().await;
        for issue in issues.iter() {
            if let Some(expires_at) = issue.expires_at {
                if ts > expires_at {
                    continue;
                }
            }
            let matched = match Regex::new(&issue.pattern) {
                Ok(re) => re.is_match(&event.message) || re.is_match(&event.category),
                Err(_) => {
                    warn!(pattern = %issue.pattern, "known issue pattern failed to compile as regex; falling back to substring match");
                    event.message.contains(&issue.pattern) || event.category.contains(&issue.pattern)
                }
            };
            if matched {
                return Some(FilterResult {
                    filtered: true,
                    reason: Some(FilterReason::KnownIssue),
                    details: issue.description.clone(),
                    confidence: None,
                });
            }
        }
        None
    }

    async fn check_transient(&self, event: &UnifiedEvent, ts: DateTime<Utc>) -> Option<FilterResult> {
        if event.category != "interface" {
            return None;
        }
        let key = extract_interface_name(&event.message).unwrap_or_else(|| "interface".to_string());
        let cutoff = ts - chrono::Duration::milliseconds(self.config.transient_window_ms as i64);

        let mut state = self.transient_state.write().await;
        let changes = state.entry(key.clone()).or_default();
        changes.retain(|t| *t >= cutoff);
        changes.push_back(ts);
        let count = changes.len() as u32;

        if count >= self.config.transient_min_changes {
            debug!(interface = %key, count, "transient flap suppression triggered");
            return Some(FilterResult {
                filtered: true,
                reason: Some(FilterReason::Transient),
                details: format!("{count} state changes on {key} within transient window"),
                confidence: None,
            });
        }
        None
    }

    async fn check_ai_assist(&self, event: &UnifiedEvent) -> Option<FilterResult> {
        let request = LlmAnalysisRequest {
            kind: "noise_assessment".into(),
            context: serde_json::json!({
                "message": event.message,
                "category": event.category,
                "severity": "info",
            }),
        };
        let response = match self.llm.analyze(request).await {
            Ok(r) => r,
            Err(_) => return None,
        };
        let low_risk = matches!(response.risk_level.as_deref(), Some("low") | Some("none"));
        let summary_lower = response.summary.to_lowercase();
        let has_noise_keyword = NOISE_KEYWORDS.iter().any(|kw| summary_lower.contains(kw));
        if low_risk && has_noise_keyword {
            Some(FilterResult {
                filtered: true,
                reason: Some(FilterReason::AiFiltered),
                details: response.summary,
                confidence: response.confidence,
            })
        } else {
            None
        }
    }

    /// Append-only feedback record, one UTC day file per spec §6.
    pub async fn record_feedback(&self, alert_id: String, filter_result: FilterResult, user_feedback: ops_common::model::UserFeedback) -> Result<()> {
        let feedback = FilterFeedback {
            alert_id,
            filter_result,
            user_feedback,
            recorded_at: now(),
        };
        fsio::append_day_record(&self.data_dir.join(FEEDBACK_DIR), feedback.recorded_at, &feedback).await
    }
}

fn window_time_matches(window: &MaintenanceWindow, ts: DateTime<Utc>) -> bool {
    match &window.recurring {
        None => ts >= window.start_time && ts <= window.end_time,
        Some(rec) => {
            let day_ok = match rec.kind {
                RecurrenceType::Daily => true,
                RecurrenceType::Weekly => rec
                    .day_of_week
                    .as_ref()
                    .map(|days| days.contains(&(ts.weekday().num_days_from_sunday() as u8)))
                    .unwrap_or(false),
                RecurrenceType::Monthly => rec
                    .day_of_month
                    .as_ref()
                    .map(|days| days.contains(&(ts.day() as u8)))
                    .unwrap_or(false),
            };
            day_ok && time_of_day_in_range(ts, &rec.start_hhmm, &rec.end_hhmm)
        }
    }
}

fn time_of_day_in_range(ts: DateTime<Utc>, start_hhmm: &str, end_hhmm: &str) -> bool {
    let now_minutes = ts.hour() * 60 + ts.minute();
    let (Some(start), Some(end)) = (parse_hhmm(start_hhmm), parse_hhmm(end_hhmm)) else {
        return false;
    };
    if start <= end {
        now_minutes >= start && now_minutes <= end
    } else {
        // Window wraps past midnight.
        now_minutes >= start || now_minutes <= end
    }
}

fn parse_hhmm(hhmm: &str) -> Option<u32> {
    let (h, m) = hhmm.split_once(':')?;
    Some(h.parse::<u32>().ok()? * 60 + m.parse::<u32>().ok()?)
}

fn extract_interface_name(message: &str) -> Option<String> {
    INTERFACE_NAME_RE.captures(message).map(|c| c[1].to_string())
}

fn derive_resources(event: &UnifiedEvent) -> Vec<String> {
    let mut resources = vec![event.category.clone()];
    if let Some(info) = &event.device_info {
        resources.push(info.hostname.clone());
        resources.push(info.ip.clone());
    }
    if let Some(metric) = event.raw_data.get("metric").and_then(|v| v.as_str()) {
        resources.push(metric.to_string());
    }
    if let Some(topic) = event.raw_data.get("topic").and_then(|v| v.as_str()) {
        resources.push(topic.to_string());
    }
    if let Some(iface) = extract_interface_name(&event.message) {
        resources.push(iface);
    }
    resources.extend(event.metadata.values().cloned());
    resources
}

async fn read_json_file<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> Result<Vec<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(Error::from),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(Error::Io(e.to_string())),
    }
}

async fn write_json_file<T: serde::Serialize>(path: &std::path::Path, items: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| Error::Io(e.to_string()))?;
    }
    let bytes = serde_json::to_vec_pretty(items)?;
    tokio::fs::write(path, bytes).await.map_err(|e| Error::Io(e.to_string()))
}
