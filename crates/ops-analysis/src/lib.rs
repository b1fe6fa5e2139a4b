//! Root-cause analyzer (spec §4.7): pattern-phase + best-effort AI-phase
//! cause extraction, timeline classification, impact scoring and
//! similar-incident search, plus a TTL+LRU cache over reusable analysis
//! text keyed by fingerprint.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lru::LruCache;
use once_cell::sync::Lazy;
use ops_common::model::{
    new_id, now, Impact, ImpactScope, RootCause, RootCauseAnalysis, Severity, SimilarIncident, TimelineEntry,
    TimelineRole, UnifiedEvent,
};
use ops_common::ports::{LlmAnalysisRequest, LlmAnalyzer};
use ops_common::utils::normalize_message;
use ops_common::{fsio, Result};
use regex::Regex;
use tokio::sync::RwLock;
use tracing::debug;

const ANALYSIS_DIR: &str = "analysis";

// ---------------------------------------------------------------------
// Pattern catalog
// ---------------------------------------------------------------------

struct PatternDef {
    id: &'static str,
    pattern: Regex,
    category: &'static str,
    base_confidence: i16,
    description: &'static str,
}

static PATTERNS: Lazy<Vec<PatternDef>> = Lazy::new(|| {
    vec![
        PatternDef {
            id: "interface_down",
            pattern: Regex::new(r"(?i)link\s+down|interface.*\bdown\b").unwrap(),
            category: "connectivity",
            base_confidence: 70,
            description: "Physical or logical interface link down",
        },
        PatternDef {
            id: "high_cpu",
            pattern: Regex::new(r"(?i)cpu\s+(load|usage).*high|cpu.*\b9[0-9]%").unwrap(),
            category: "resource",
            base_confidence: 65,
            description: "Sustained high CPU utilization",
        },
        PatternDef {
            id: "high_memory",
            pattern: Regex::new(r"(?i)(memory|ram).*(low|exhausted|high usage)").unwrap(),
            category: "resource",
            base_confidence: 65,
            description: "Memory exhaustion",
        },
        PatternDef {
            id: "disk_full",
            pattern: Regex::new(r"(?i)disk.*(full|low space|exhausted)").unwrap(),
            category: "resource",
            base_confidence: 70,
            description: "Disk space exhaustion",
        },
        PatternDef {
            id: "auth_failure",
            pattern: Regex::new(r"(?i)(login|authentication)\s+(failed|failure)").unwrap(),
            category: "security",
            base_confidence: 55,
            description: "Repeated authentication failures",
        },
        PatternDef {
            id: "dhcp_issue",
            pattern: Regex::new(r"(?i)dhcp.*(fail|lease|no offer)").unwrap(),
            category: "network-service",
            base_confidence: 50,
            description: "DHCP service disruption",
        },
        PatternDef {
            id: "routing_flap",
            pattern: Regex::new(r"(?i)(route|bgp|ospf).*(flap|down|lost)").unwrap(),
            category: "routing",
            base_confidence: 60,
            description: "Routing instability",
        },
        PatternDef {
            id: "firewall_block",
            pattern: Regex::new(r"(?i)firewall.*(drop|block|reject)").unwrap(),
            category: "security",
            base_confidence: 45,
            description: "Firewall rule blocking traffic",
        },
        PatternDef {
            id: "power_event",
            pattern: Regex::new(r"(?i)(power|psu|ups).*(fail|loss|restore)").unwrap(),
            category: "hardware",
            base_confidence: 75,
            description: "Power subsystem event",
        },
    ]
});

/// Confidence offset applied by severity (spec §4.7: "±10 by severity").
fn severity_adjustment(severity: Severity) -> i16 {
    match severity {
        Severity::Emergency => 10,
        Severity::Critical => 5,
        Severity::Warning => 0,
        Severity::Info => -10,
    }
}

fn clamp_confidence(value: i16) -> u8 {
    value.clamp(0, 100) as u8
}

/// Pattern phase for a single event: match against the built-in catalog; if
/// nothing matches, emit a generic `unknown` cause at confidence 40.
fn pattern_phase(event: &UnifiedEvent) -> RootCause {
    for pat in PATTERNS.iter() {
        if pat.pattern.is_match(&event.message) {
            let confidence = clamp_confidence(pat.base_confidence + severity_adjustment(event.severity));
            return RootCause {
                id: pat.id.to_string(),
                category: pat.category.to_string(),
                description: pat.description.to_string(),
                confidence,
                evidence: vec![event.message.clone()],
                related_alerts: vec![event.id.clone()],
            };
        }
    }
    RootCause {
        id: "unknown".to_string(),
        category: "unknown".to_string(),
        description: "No known pattern matched this event".to_string(),
        confidence: 40,
        evidence: vec![event.message.clone()],
        related_alerts: vec![event.id.clone()],
    }
}

async fn ai_phase(llm: &Arc<dyn LlmAnalyzer>, event: &UnifiedEvent) -> Option<RootCause> {
    let request = LlmAnalysisRequest {
        kind: "root_cause".into(),
        context: serde_json::json!({
            "message": event.message,
            "category": event.category,
            "severity": format!("{:?}", event.severity),
        }),
    };
    let response = llm.analyze(request).await.ok()?;
    Some(RootCause {
        id: new_id(),
        category: response.risk_level.clone().unwrap_or_else(|| "ai".to_string()),
        description: response.summary,
        confidence: response.confidence.map(|c| (c * 100.0) as u8).unwrap_or(50).min(100),
        evidence: Vec::new(),
        related_alerts: vec![event.id.clone()],
    })
}

/// Deduplicate by lowercased description; on collision keep max confidence
/// and union of evidence + related alerts; sort by confidence descending.
fn merge_causes(causes: Vec<RootCause>) -> Vec<RootCause> {
    let mut by_description: HashMap<String, RootCause> = HashMap::new();
    for cause in causes {
        let key = cause.description.to_lowercase();
        by_description
            .entry(key)
            .and_modify(|existing| {
                if cause.confidence > existing.confidence {
                    existing.confidence = cause.confidence;
                    existing.id = cause.id.clone();
                    existing.category = cause.category.clone();
                }
                for e in &cause.evidence {
                    if !existing.evidence.contains(e) {
                        existing.evidence.push(e.clone());
                    }
                }
                for a in &cause.related_alerts {
                    if !existing.related_alerts.contains(a) {
                        existing.related_alerts.push(a.clone());
                    }
                }
            })
            .or_insert(cause);
    }
    let mut merged: Vec<RootCause> = by_description.into_values().collect();
    merged.sort_by(|a, b| b.confidence.cmp(&a.confidence));
    merged
}

/// Stable fingerprint for a batch's cause-worthy shape: category plus
/// normalized message per event, same normalization `ops-dedup` uses.
fn batch_fingerprint(events: &[&UnifiedEvent]) -> String {
    let parts: Vec<String> = events
        .iter()
        .map(|e| format!("{}|{}", e.category, normalize_message(&e.message)))
        .collect();
    let refs: Vec<&str> = parts.iter().map(|s| s.as_str()).collect();
    ops_common::utils::stable_hash(&refs)
}

// ---------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------

static EFFECT_HINT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(due to|caused by|result of)").unwrap());
static CAUSE_HINT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(leads to|resulting in|triggered)").unwrap());

fn build_timeline(events: &[UnifiedEvent]) -> Vec<TimelineEntry> {
    let mut sorted: Vec<&UnifiedEvent> = events.iter().collect();
    sorted.sort_by_key(|e| e.timestamp);

    sorted
        .iter()
        .enumerate()
        .map(|(i, e)| {
            let role = if i == 0 {
                TimelineRole::Trigger
            } else if EFFECT_HINT_RE.is_match(&e.message) {
                TimelineRole::Effect
            } else if CAUSE_HINT_RE.is_match(&e.message) {
                TimelineRole::Cause
            } else {
                TimelineRole::Symptom
            };
            TimelineEntry {
                event_id: e.id.clone(),
                timestamp: e.timestamp,
                role,
                message: e.message.clone(),
            }
        })
        .collect()
}

// ---------------------------------------------------------------------
// Impact
// ---------------------------------------------------------------------

static SEGMENT_CIDR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{1,3}(?:\.\d{1,3}){3}/\d{1,2}\b").unwrap());
static SEGMENT_VLAN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bvlan\s*(\d+)\b").unwrap());
static WAN_HINT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(wan|internet|uplink)\b").unwrap());

fn build_impact(events: &[UnifiedEvent], max_severity: Severity, related_count: usize) -> Impact {
    let scope = if max_severity == Severity::Emergency || related_count >= 5 {
        ImpactScope::Widespread
    } else if max_severity == Severity::Critical || related_count > 2 {
        ImpactScope::Partial
    } else {
        ImpactScope::Local
    };

    let mut services = Vec::new();
    let mut segments = Vec::new();
    for event in events {
        let combined = format!("{} {}", event.category, event.message);
        for (keyword, service) in [("dhcp", "DHCP"), ("dns", "DNS"), ("vpn", "VPN"), ("firewall", "Firewall")] {
            if combined.to_lowercase().contains(keyword) && !services.contains(&service.to_string()) {
                services.push(service.to_string());
            }
        }
        for cap in SEGMENT_CIDR_RE.find_iter(&event.message) {
            let s = cap.as_str().to_string();
            if !segments.contains(&s) {
                segments.push(s);
            }
        }
        for cap in SEGMENT_VLAN_RE.captures_iter(&event.message) {
            let s = format!("VLAN {}", &cap[1]);
            if !segments.contains(&s) {
                segments.push(s);
            }
        }
    }

    let scope_base = match scope {
        ImpactScope::Local => 5.0,
        ImpactScope::Partial => 25.0,
        ImpactScope::Widespread => 100.0,
    };
    let wan_multiplier = if events.iter().any(|e| WAN_HINT_RE.is_match(&e.message)) { 2.0 } else { 1.0 };
    let system_multiplier = if events.iter().any(|e| e.category == "system") { 1.5 } else { 1.0 };
    let affected_users_estimate = (scope_base * wan_multiplier * system_multiplier) as u32;

    Impact {
        scope,
        services,
        network_segments: segments,
        affected_users_estimate,
    }
}

// ---------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------

pub struct AnalyzerConfig {
    pub correlation_window_ms: u64,
    pub similar_incident_window_days: u32,
    pub similar_incident_min_similarity: f32,
    pub cache_ttl_ms: u64,
    pub cache_capacity: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            correlation_window_ms: 300_000,
            similar_incident_window_days: 30,
            similar_incident_min_similarity: 0.3,
            cache_ttl_ms: 600_000,
            cache_capacity: 512,
        }
    }
}

pub struct RootCauseAnalyzer {
    data_dir: PathBuf,
    llm: Arc<dyn LlmAnalyzer>,
    config: AnalyzerConfig,
    cache: AnalysisCache,
}

impl RootCauseAnalyzer {
    pub fn new(data_dir: impl Into<PathBuf>, llm: Arc<dyn LlmAnalyzer>, config: AnalyzerConfig) -> Self {
        let cache = AnalysisCache::new(config.cache_capacity, config.cache_ttl_ms);
        Self {
            data_dir: data_dir.into(),
            llm,
            config,
            cache,
        }
    }

    /// Analyze a single event: pattern phase + best-effort AI phase, merged.
    pub async fn analyze(&self, event: &UnifiedEvent) -> Result<RootCauseAnalysis> {
        self.analyze_batch(std::slice::from_ref(event)).await
    }

    /// Correlate a batch of events within the configured window from the
    /// earliest, running pattern phase per event plus one AI call seeded
    /// with the highest-severity event. The merged cause set is cached by
    /// fingerprint so a repeat of the same event shape skips both phases.
    pub async fn analyze_batch(&self, events: &[UnifiedEvent]) -> Result<RootCauseAnalysis> {
        let earliest = events.iter().map(|e| e.timestamp).min().unwrap_or_else(now);
        let cutoff = earliest + chrono::Duration::milliseconds(self.config.correlation_window_ms as i64);
        let windowed: Vec<&UnifiedEvent> = events.iter().filter(|e| e.timestamp <= cutoff).collect();

        let cache_key = batch_fingerprint(&windowed);
        let merged = match self.cache.get(&cache_key).await {
            Some(cached) => serde_json::from_str(&cached).unwrap_or_default(),
            None => {
                let mut causes: Vec<RootCause> = windowed.iter().map(|e| pattern_phase(e)).collect();
                if let Some(seed) = windowed.iter().max_by_key(|e| e.severity) {
                    if let Some(ai_cause) = ai_phase(&self.llm, seed).await {
                        causes.push(ai_cause);
                    }
                }
                let merged = merge_causes(causes);
                if let Ok(text) = serde_json::to_string(&merged) {
                    self.cache.put(cache_key, text).await;
                }
                merged
            }
        };

        let owned_events: Vec<UnifiedEvent> = windowed.into_iter().cloned().collect();
        let timeline = build_timeline(&owned_events);
        let max_severity = owned_events.iter().map(|e| e.severity).max().unwrap_or(Severity::Info);
        let related_count = merged.iter().map(|c| c.related_alerts.len()).sum::<usize>().max(owned_events.len());
        let impact = build_impact(&owned_events, max_severity, related_count);

        let alert_id = owned_events.first().map(|e| e.id.clone()).unwrap_or_default();
        let analysis = RootCauseAnalysis {
            id: new_id(),
            alert_id,
            timestamp: now(),
            root_causes: merged,
            timeline,
            impact,
            similar_incidents: None,
        };

        fsio::append_day_record(&self.data_dir.join(ANALYSIS_DIR), analysis.timestamp, &analysis).await?;
        Ok(analysis)
    }

    /// Scan the last `similar_incident_window_days` of analyses for ones
    /// similar to `target`, by the weighted-sum formula in spec §4.7.
    pub async fn find_similar_incidents(&self, target: &RootCauseAnalysis) -> Result<Vec<SimilarIncident>> {
        let dir = self.data_dir.join(ANALYSIS_DIR);
        let cutoff = now() - chrono::Duration::days(self.config.similar_incident_window_days as i64);
        let mut scored = Vec::new();

        for day in fsio::list_days(&dir).await? {
            let analyses: Vec<RootCauseAnalysis> = fsio::read_day(&dir, &day).await?;
            for candidate in analyses {
                if candidate.id == target.id || candidate.timestamp < cutoff {
                    continue;
                }
                let similarity = similarity_score(target, &candidate);
                if similarity >= self.config.similar_incident_min_similarity {
                    scored.push(SimilarIncident {
                        analysis_id: candidate.id.clone(),
                        alert_id: candidate.alert_id.clone(),
                        similarity,
                    });
                }
            }
        }
        scored.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored)
    }
}

fn similarity_score(a: &RootCauseAnalysis, b: &RootCauseAnalysis) -> f32 {
    let category_match = match (a.root_causes.first(), b.root_causes.first()) {
        (Some(ca), Some(cb)) if ca.category == cb.category => 0.3,
        _ => 0.0,
    };

    let words_a = word_set(&a.root_causes.first().map(|c| c.description.clone()).unwrap_or_default());
    let words_b = word_set(&b.root_causes.first().map(|c| c.description.clone()).unwrap_or_default());
    let jaccard = jaccard_similarity(&words_a, &words_b);
    let message_overlap = if jaccard > 0.1 { 0.4 * jaccard } else { 0.0 };

    let conf_a = a.root_causes.first().map(|c| c.confidence).unwrap_or(0) as f32 / 100.0;
    let conf_b = b.root_causes.first().map(|c| c.confidence).unwrap_or(0) as f32 / 100.0;
    let confidence_alignment = 0.1 * (1.0 - (conf_a - conf_b).abs());
    let severity_alignment = if a.impact.scope == b.impact.scope { 0.2 } else { 0.0 };

    let scope_match = if a.impact.scope == b.impact.scope { 0.1 } else { 0.0 };

    category_match + message_overlap + severity_alignment + confidence_alignment + scope_match
}

fn word_set(text: &str) -> std::collections::HashSet<String> {
    text.to_lowercase().split_whitespace().map(|w| w.to_string()).collect()
}

fn jaccard_similarity(a: &std::collections::HashSet<String>, b: &std::collections::HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f32;
    let union = a.union(b).count() as f32;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

// ---------------------------------------------------------------------
// Analysis cache: TTL + LRU map from fingerprint to reusable analysis text
// ---------------------------------------------------------------------

pub struct AnalysisCache {
    inner: RwLock<LruCache<String, (String, DateTime<Utc>)>>,
    ttl_ms: u64,
}

impl AnalysisCache {
    pub fn new(capacity: usize, ttl_ms: u64) -> Self {
        Self {
            inner: RwLock::new(LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap())),
            ttl_ms,
        }
    }

    pub async fn get(&self, fingerprint: &str) -> Option<String> {
        let mut cache = self.inner.write().await;
        match cache.get(fingerprint) {
            Some((text, stored_at)) if now() - *stored_at < chrono::Duration::milliseconds(self.ttl_ms as i64) => {
                Some(text.clone())
            }
            Some(_) => {
                cache.pop(fingerprint);
                None
            }
            None => None,
        }
    }

    pub async fn put(&self, fingerprint: String, text: String) {
        debug!(fingerprint = %fingerprint, "caching analysis text");
        self.inner.write().await.put(fingerprint, (text, now()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ops_common::model::EventSource;
    use ops_common::ports::LlmAnalysisResponse;
    use tempfile::tempdir;

    struct NullLlm;
    #[async_trait]
    impl LlmAnalyzer for NullLlm {
        async fn analyze(&self, _request: LlmAnalysisRequest) -> Result<LlmAnalysisResponse> {
            Err(ops_common::Error::Dependency("no llm".into()))
        }
    }

    struct CountingLlm(std::sync::atomic::AtomicU64);
    #[async_trait]
    impl LlmAnalyzer for CountingLlm {
        async fn analyze(&self, _request: LlmAnalysisRequest) -> Result<LlmAnalysisResponse> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(LlmAnalysisResponse {
                summary: "ai-derived cause".into(),
                recommendations: Vec::new(),
                confidence: Some(0.8),
                risk_level: Some("ai".into()),
            })
        }
    }

    fn event(message: &str, severity: Severity) -> UnifiedEvent {
        UnifiedEvent {
            id: new_id(),
            source: EventSource::Syslog,
            timestamp: now(),
            severity,
            category: "interface".into(),
            message: message.to_string(),
            raw_data: serde_json::Value::Null,
            metadata: HashMap::new(),
            device_info: None,
            alert_rule_info: None,
        }
    }

    #[tokio::test]
    async fn pattern_phase_matches_known_cause() {
        let dir = tempdir().unwrap();
        let analyzer = RootCauseAnalyzer::new(dir.path(), Arc::new(NullLlm), AnalyzerConfig::default());
        let analysis = analyzer.analyze(&event("ether1 link down", Severity::Warning)).await.unwrap();
        assert_eq!(analysis.root_causes[0].id, "interface_down");
        assert!(analysis.root_causes[0].confidence > 0);
    }

    #[tokio::test]
    async fn unmatched_event_gets_generic_unknown_cause() {
        let dir = tempdir().unwrap();
        let analyzer = RootCauseAnalyzer::new(dir.path(), Arc::new(NullLlm), AnalyzerConfig::default());
        let analysis = analyzer.analyze(&event("completely unrecognizable gibberish", Severity::Warning)).await.unwrap();
        assert_eq!(analysis.root_causes[0].id, "unknown");
        assert_eq!(analysis.root_causes[0].confidence, 40);
    }

    #[tokio::test]
    async fn timeline_marks_first_event_as_trigger() {
        let dir = tempdir().unwrap();
        let analyzer = RootCauseAnalyzer::new(dir.path(), Arc::new(NullLlm), AnalyzerConfig::default());
        let e1 = event("ether1 link down", Severity::Warning);
        let mut e2 = event("resulting in connection lost", Severity::Warning);
        e2.timestamp = e1.timestamp + chrono::Duration::seconds(5);
        let analysis = analyzer.analyze_batch(&[e1, e2]).await.unwrap();
        assert_eq!(analysis.timeline[0].role, TimelineRole::Trigger);
    }

    #[tokio::test]
    async fn impact_scope_widespread_on_emergency() {
        let dir = tempdir().unwrap();
        let analyzer = RootCauseAnalyzer::new(dir.path(), Arc::new(NullLlm), AnalyzerConfig::default());
        let analysis = analyzer.analyze(&event("ether1 link down", Severity::Emergency)).await.unwrap();
        assert_eq!(analysis.impact.scope, ImpactScope::Widespread);
        assert_eq!(analysis.impact.affected_users_estimate, 100);
    }

    #[tokio::test]
    async fn similar_incidents_find_matching_category() {
        let dir = tempdir().unwrap();
        let analyzer = RootCauseAnalyzer::new(dir.path(), Arc::new(NullLlm), AnalyzerConfig::default());
        let first = analyzer.analyze(&event("ether1 link down", Severity::Warning)).await.unwrap();
        let second = analyzer.analyze(&event("ether2 link down", Severity::Warning)).await.unwrap();

        let similar = analyzer.find_similar_incidents(&second).await.unwrap();
        assert!(similar.iter().any(|s| s.analysis_id == first.id));
    }

    #[tokio::test]
    async fn analysis_cache_expires_entries() {
        let cache = AnalysisCache::new(10, 0);
        cache.put("fp1".into(), "cached text".into()).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(cache.get("fp1").await.is_none());
    }

    #[tokio::test]
    async fn analysis_cache_returns_live_entry() {
        let cache = AnalysisCache::new(10, 300_000);
        cache.put("fp1".into(), "cached text".into()).await;
        assert_eq!(cache.get("fp1").await, Some("cached text".to_string()));
    }

    #[tokio::test]
    async fn repeat_analysis_reuses_cache_instead_of_recalling_llm() {
        let dir = tempdir().unwrap();
        let llm = Arc::new(CountingLlm(std::sync::atomic::AtomicU64::new(0)));
        let analyzer = RootCauseAnalyzer::new(dir.path(), llm.clone(), AnalyzerConfig::default());

        let first = analyzer.analyze(&event("ether1 link down", Severity::Warning)).await.unwrap();
        let second = analyzer.analyze(&event("ether1 link down", Severity::Warning)).await.unwrap();

        assert_eq!(llm.0.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(first.root_causes, second.root_causes);
    }
}
