//! Pipeline orchestrator (spec §4.10): normalize -> deduplicate -> filter ->
//! analyze -> decide, wiring every other `ops-*` component together behind
//! one entry point, plus the UDP syslog receiver.

pub mod app;
pub mod syslog_receiver;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ops_analysis::RootCauseAnalyzer;
use ops_audit::AuditLog;
use ops_common::model::{
    AlertEvent, AlertStatus, CompositeEvent, EventSource, FilterResult, Metric, RootCauseAnalysis,
    Severity, UnifiedEvent,
};
use ops_preprocessor::{Aggregator, DeviceInfoCache};
use ops_common::Result;
use ops_decision::DecisionEngine;
use ops_dedup::{fingerprint, FingerprintCache};
use ops_filter::NoiseFilter;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Which stage an outcome reflects. Matches the spec's exact naming; note
/// that the error path below always reports `Normalize` regardless of the
/// stage that actually failed (spec §4.10: "returns a failed result with
/// stage `normalize`").
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Normalize,
    Deduplicate,
    Filter,
    Analyze,
    Decide,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub event: UnifiedEvent,
    pub stage: Stage,
    pub filtered: bool,
    pub filter_result: Option<FilterResult>,
    pub analysis: Option<RootCauseAnalysis>,
    pub decision: Option<ops_common::model::Decision>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub processed: AtomicU64,
    pub filtered: AtomicU64,
    pub deduplicated: AtomicU64,
    pub analyzed: AtomicU64,
    pub decided: AtomicU64,
    pub errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct PipelineStatsSnapshot {
    pub processed: u64,
    pub filtered: u64,
    pub deduplicated: u64,
    pub analyzed: u64,
    pub decided: u64,
    pub errors: u64,
}

impl PipelineStats {
    fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            analyzed: self.analyzed.load(Ordering::Relaxed),
            decided: self.decided.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

pub struct Pipeline {
    dedup: Arc<FingerprintCache>,
    filter: Arc<NoiseFilter>,
    analyzer: Arc<RootCauseAnalyzer>,
    decision: Arc<DecisionEngine>,
    audit: Arc<AuditLog>,
    dedup_ttl_ms: u64,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn new(
        dedup: Arc<FingerprintCache>,
        filter: Arc<NoiseFilter>,
        analyzer: Arc<RootCauseAnalyzer>,
        decision: Arc<DecisionEngine>,
        audit: Arc<AuditLog>,
        dedup_ttl_ms: u64,
    ) -> Self {
        Self {
            dedup,
            filter,
            analyzer,
            decision,
            audit,
            dedup_ttl_ms,
            stats: PipelineStats::default(),
        }
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    /// The noise filter this pipeline runs events through, exposed so a
    /// caller can seed maintenance windows/known issues ahead of time.
    pub fn filter(&self) -> &Arc<NoiseFilter> {
        &self.filter
    }

    /// The decision engine this pipeline scores alerts against, exposed so
    /// a caller can seed decision rules ahead of time.
    pub fn decision(&self) -> &Arc<DecisionEngine> {
        &self.decision
    }

    /// Run one event through every stage, never returning an `Err` — any
    /// failure anywhere is caught, audited, and reported inline as an
    /// outcome whose `stage` is hardcoded to `Normalize` (spec §4.10).
    pub async fn process(&self, event: UnifiedEvent) -> PipelineOutcome {
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        match self.process_inner(event.clone()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, event_id = %event.id, "pipeline stage failed");
                self.audit
                    .log(
                        "pipeline",
                        "pipeline_error",
                        serde_json::json!({"event_id": event.id, "error": e.to_string()}),
                    )
                    .await;
                PipelineOutcome {
                    event,
                    stage: Stage::Normalize,
                    filtered: false,
                    filter_result: None,
                    analysis: None,
                    decision: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn process_inner(&self, event: UnifiedEvent) -> Result<PipelineOutcome> {
        // normalize: the event arriving here is already a `UnifiedEvent`,
        // produced upstream by `ops_preprocessor`'s stateless constructors
        // or the syslog receiver. There is nothing left to do at this
        // stage besides acting as the named starting point for the error
        // path above.

        // deduplicate: skip composite events (already collapsed by the
        // aggregator) and metric-origin events (already deduplicated by
        // the rule engine's own active-alert tracking), per spec §4.10.
        let is_composite = event.metadata.contains_key("composite");
        let skip_dedup = is_composite || event.source == EventSource::Metrics;
        if !skip_dedup {
            let fp = fingerprint(
                rule_id_of(&event),
                metric_key_of(&event),
                severity_key(event.severity),
                &event.message,
            );
            let (_, was_duplicate) = self.dedup.set(&fp, Some(self.dedup_ttl_ms)).await;
            if was_duplicate {
                self.stats.deduplicated.fetch_add(1, Ordering::Relaxed);
                return Ok(PipelineOutcome {
                    event,
                    stage: Stage::Deduplicate,
                    filtered: true,
                    filter_result: None,
                    analysis: None,
                    decision: None,
                    error: None,
                });
            }
        }

        // filter: noise suppression in priority order.
        let filter_result = self.filter.filter(&event).await;
        if filter_result.filtered {
            self.stats.filtered.fetch_add(1, Ordering::Relaxed);
            return Ok(PipelineOutcome {
                event,
                stage: Stage::Filter,
                filtered: true,
                filter_result: Some(filter_result),
                analysis: None,
                decision: None,
                error: None,
            });
        }

        // analyze: best-effort root cause analysis; never short-circuits.
        let analysis = self.analyzer.analyze(&event).await?;
        self.stats.analyzed.fetch_add(1, Ordering::Relaxed);

        // decide: synthesize the alert-shaped view the decision engine
        // scores against, then run the four-factor scoring and action.
        let alert = alert_from_event(&event, &analysis);
        let scope = analysis.impact.scope;
        let history = self.decision.historical_success_rate(rule_id_of(&event)).await?;
        let decision = self.decision.decide(&alert, scope, history).await?;
        self.stats.decided.fetch_add(1, Ordering::Relaxed);

        Ok(PipelineOutcome {
            event,
            stage: Stage::Decide,
            filtered: false,
            filter_result: Some(filter_result),
            analysis: Some(analysis),
            decision: Some(decision),
            error: None,
        })
    }

    /// Feed a composite event (already the output of `ops_preprocessor`'s
    /// `Aggregator`) in as its flattened base event, marked so the
    /// deduplicate stage above skips it.
    pub async fn process_composite(&self, composite: CompositeEvent) -> PipelineOutcome {
        let mut event = composite.base;
        event.metadata.insert("composite".to_string(), "true".to_string());
        self.process(event).await
    }

    /// Route whichever shape a feed produced to the right entry point.
    pub async fn dispatch(&self, input: PipelineInput) -> PipelineOutcome {
        match input {
            PipelineInput::Event(event) => self.process(event).await,
            PipelineInput::Composite(composite) => self.process_composite(composite).await,
        }
    }
}

/// What a feed (syslog receiver, metric tick) hands to the pipeline after
/// running an event through device-identity enrichment and burst/flap
/// aggregation: the plain event, or the composite an aggregation rule
/// produced instead.
pub enum PipelineInput {
    Event(UnifiedEvent),
    Composite(CompositeEvent),
}

/// Enrich an event with cached device identity, then feed it through the
/// burst/flap aggregator (spec §4.5). Always yields the enriched plain
/// event; additionally yields a composite when a rule's threshold fires.
pub async fn prepare_event(
    device_info: &DeviceInfoCache,
    aggregator: &Aggregator,
    event: UnifiedEvent,
) -> (UnifiedEvent, Option<CompositeEvent>) {
    let enriched = device_info.enrich(event).await;
    let composite = aggregator.ingest(enriched.clone()).await;
    (enriched, composite)
}

fn rule_id_of(event: &UnifiedEvent) -> &str {
    event
        .alert_rule_info
        .as_ref()
        .map(|i| i.rule_id.as_str())
        .unwrap_or(event.category.as_str())
}

fn metric_key_of(event: &UnifiedEvent) -> &str {
    event
        .raw_data
        .get("metric")
        .and_then(|v| v.as_str())
        .unwrap_or(event.category.as_str())
}

fn severity_key(severity: Severity) -> &'static str {
    match severity {
        Severity::Info => "info",
        Severity::Warning => "warning",
        Severity::Critical => "critical",
        Severity::Emergency => "emergency",
    }
}

fn metric_of(event: &UnifiedEvent) -> Metric {
    if event.category == "interface" {
        Metric::InterfaceStatus
    } else if event.category == "disk" {
        Metric::Disk
    } else if event.category == "memory" {
        Metric::Memory
    } else {
        Metric::Cpu
    }
}

/// Build the alert-shaped view the decision engine scores against. The
/// decision engine was designed around metric-rule alerts; generic
/// syslog/manual/API events have no natural `currentValue`/`threshold`
/// pair, so those are left at zero and only the fields the four-factor
/// scoring actually reads (severity, id, timestamps) carry real data.
fn alert_from_event(event: &UnifiedEvent, analysis: &RootCauseAnalysis) -> AlertEvent {
    let ai_analysis = analysis.root_causes.first().map(|c| c.description.clone());
    AlertEvent {
        id: event.id.clone(),
        rule_id: rule_id_of(event).to_string(),
        rule_name: event
            .alert_rule_info
            .as_ref()
            .map(|i| i.rule_name.clone())
            .unwrap_or_else(|| event.category.clone()),
        severity: event.severity,
        metric: metric_of(event),
        current_value: 0.0,
        threshold: 0.0,
        message: event.message.clone(),
        ai_analysis,
        status: AlertStatus::Active,
        triggered_at: event.timestamp,
        resolved_at: None,
        auto_response_result: None,
    }
}
