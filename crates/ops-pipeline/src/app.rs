//! Bootstrap: wire every component from a single `Config` into a running
//! `App`, mirroring the teacher's `init_gateway` shape.

use std::sync::Arc;

use ops_analysis::{AnalyzerConfig, RootCauseAnalyzer};
use ops_audit::AuditLog;
use ops_common::config::Config;
use ops_common::ports::{DeviceClient, LlmAnalyzer, NotificationDispatcher};
use ops_common::Result;
use ops_decision::{DecisionConfig, DecisionEngine, NullRemediationExecutor, RemediationExecutor};
use ops_dedup::FingerprintCache;
use ops_filter::{FilterConfig, NoiseFilter};
use ops_metrics::MetricsCollector;
use ops_preprocessor::{Aggregator, DeviceInfoCache, PreprocessorConfig};
use ops_rules::{RuleEngine, RuleEngineConfig};
use ops_snapshot::{SnapshotConfig, SnapshotStore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::syslog_receiver::SyslogReceiver;
use crate::{prepare_event, Pipeline};

/// Everything a running process needs: the pipeline itself plus the
/// longer-lived components the binary ticks and shuts down explicitly.
pub struct App {
    pub pipeline: Arc<Pipeline>,
    pub metrics: Arc<MetricsCollector>,
    pub rules: Arc<RuleEngine>,
    pub snapshots: Arc<SnapshotStore>,
    pub audit: Arc<AuditLog>,
    pub aggregator: Arc<Aggregator>,
    pub device_info: Arc<DeviceInfoCache>,
}

impl App {
    pub async fn bootstrap(
        config: &Config,
        device: Arc<dyn DeviceClient>,
        llm: Arc<dyn LlmAnalyzer>,
        notifier: Arc<dyn NotificationDispatcher>,
        executor: Arc<dyn RemediationExecutor>,
    ) -> Result<Self> {
        let data_dir = config.data_dir.as_path();
        let audit = Arc::new(AuditLog::new(data_dir, config.audit.retention_days));

        let metrics = Arc::new(MetricsCollector::new(
            device.clone(),
            data_dir,
            config.metrics.retention_days,
            config.metrics.failure_warn_threshold,
        ));
        metrics.sweep_retention_at_startup().await?;

        let rules = Arc::new(
            RuleEngine::load(
                data_dir,
                metrics.clone(),
                audit.clone(),
                notifier.clone(),
                RuleEngineConfig {
                    traffic_window_short_ms: config.rules.traffic_window_short_ms,
                    traffic_window_long_ms: config.rules.traffic_window_long_ms,
                },
            )
            .await?,
        );

        let aggregator = Arc::new(Aggregator::new(&PreprocessorConfig {
            flap_window_ms: config.preprocessor.flap_window_ms,
            flap_min_changes: config.preprocessor.flap_min_changes,
            aggregation_window_ms: config.preprocessor.aggregation_window_ms,
            device_info_ttl_ms: config.preprocessor.device_info_ttl_ms,
        }));
        let device_info = Arc::new(DeviceInfoCache::new(device.clone(), config.preprocessor.device_info_ttl_ms));

        let dedup = Arc::new(FingerprintCache::new(config.dedup.default_ttl_ms));

        let filter = Arc::new(
            NoiseFilter::load(
                data_dir,
                llm.clone(),
                FilterConfig {
                    transient_window_ms: config.filter.transient_window_ms,
                    transient_min_changes: config.filter.transient_min_changes,
                },
            )
            .await?,
        );

        let analyzer = Arc::new(RootCauseAnalyzer::new(
            data_dir,
            llm.clone(),
            AnalyzerConfig {
                correlation_window_ms: config.analysis.correlation_window_ms,
                similar_incident_window_days: config.analysis.similar_incident_window_days,
                similar_incident_min_similarity: config.analysis.similar_incident_min_similarity,
                cache_ttl_ms: config.analysis.cache_ttl_ms,
                cache_capacity: config.analysis.cache_capacity,
            },
        ));

        let decision = Arc::new(
            DecisionEngine::load(
                data_dir,
                notifier.clone(),
                executor,
                audit.clone(),
                DecisionConfig {
                    business_hours_start: config.decision.business_hours_start,
                    business_hours_end: config.decision.business_hours_end,
                    night_hours_end: config.decision.night_hours_end,
                },
            )
            .await?,
        );

        let snapshots = Arc::new(SnapshotStore::new(
            data_dir,
            device,
            audit.clone(),
            SnapshotConfig {
                max_retained: config.snapshot.max_retained,
                device_timeout_ms: config.snapshot.device_timeout_ms,
            },
        ));

        let pipeline = Arc::new(Pipeline::new(
            dedup,
            filter,
            analyzer,
            decision,
            audit.clone(),
            config.dedup.default_ttl_ms,
        ));

        Ok(Self {
            pipeline,
            metrics,
            rules,
            snapshots,
            audit,
            aggregator,
            device_info,
        })
    }

    /// Start the metrics ticker, the rule-evaluation tick that turns fresh
    /// samples into alert events, and the syslog receiver; every event
    /// that reaches the pipeline does so on a dedicated task so neither
    /// feed blocks on pipeline work.
    pub async fn start(&self, config: &Config) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();

        if config.metrics.enabled {
            self.metrics.start(config.metrics.interval_ms).await;

            let rules = self.rules.clone();
            let metrics = self.metrics.clone();
            let pipeline = self.pipeline.clone();
            let aggregator = self.aggregator.clone();
            let device_info = self.device_info.clone();
            let interval_ms = config.metrics.interval_ms;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
                loop {
                    ticker.tick().await;
                    let snapshot = metrics.latest().await;
                    let Some(system) = snapshot.system.clone() else {
                        continue;
                    };
                    let interfaces: Vec<_> = snapshot.interfaces.values().cloned().collect();
                    match rules.evaluate(&system, &interfaces).await {
                        Ok(alerts) => {
                            for alert in alerts {
                                let event = ops_preprocessor::normalize_metric(
                                    metric_key(alert.metric),
                                    alert.severity,
                                    alert.message.clone(),
                                    alert.rule_id.clone(),
                                    alert.rule_name.clone(),
                                );
                                let (event, composite) = prepare_event(&device_info, &aggregator, event).await;
                                let outcome = pipeline.process(event).await;
                                info!(stage = ?outcome.stage, "metric alert processed");
                                if let Some(composite) = composite {
                                    let outcome = pipeline.process_composite(composite).await;
                                    info!(stage = ?outcome.stage, "metric alert composite processed");
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "rule evaluation failed"),
                    }
                }
            }));
        }

        let receiver = SyslogReceiver::bind(config.data_dir.as_path(), &config.syslog.bind_address).await?;
        let (recv_handle, mut rx) = receiver.spawn(self.aggregator.clone(), self.device_info.clone());
        let pipeline = self.pipeline.clone();
        handles.push(tokio::spawn(async move {
            while let Some(input) = rx.recv().await {
                let outcome = pipeline.dispatch(input).await;
                info!(stage = ?outcome.stage, filtered = outcome.filtered, "event processed");
            }
            recv_handle.abort();
        }));

        Ok(handles)
    }

    pub async fn shutdown(&self) {
        self.metrics.stop().await;
        let _ = self.audit.sweep_retention().await;
    }
}

pub fn default_llm() -> Arc<dyn LlmAnalyzer> {
    Arc::new(ops_common::ports::NullLlmAnalyzer)
}

pub fn default_device() -> Arc<dyn DeviceClient> {
    Arc::new(ops_common::ports::NullDeviceClient)
}

pub fn default_notifier() -> Arc<dyn NotificationDispatcher> {
    Arc::new(ops_common::ports::LoggingNotificationDispatcher)
}

pub fn default_executor() -> Arc<dyn RemediationExecutor> {
    Arc::new(NullRemediationExecutor)
}

fn metric_key(metric: ops_common::model::Metric) -> &'static str {
    use ops_common::model::Metric;
    match metric {
        Metric::Cpu => "cpu",
        Metric::Memory => "memory",
        Metric::Disk => "disk",
        Metric::InterfaceStatus => "interface_status",
        Metric::InterfaceTraffic => "interface_traffic",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn bootstrap_wires_every_component() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        config.syslog.bind_address = "127.0.0.1:0".to_string();

        let app = App::bootstrap(&config, default_device(), default_llm(), default_notifier(), default_executor())
            .await
            .unwrap();
        assert_eq!(app.pipeline.stats().processed, 0);
    }
}
