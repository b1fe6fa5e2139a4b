//! End-to-end scenario tests driving `App`/`Pipeline` through their public
//! surface, matching the six concrete scenarios every component-level
//! scenario above is drawn from. Real timestamps and short real sleeps are
//! used throughout, the same idiom every crate's own TTL/window tests use.

use std::sync::Arc;

use ops_common::model::{
    new_id, now, AlertRule, DecisionAction, EventSource, Metric, MaintenanceWindow, Operator, Severity,
    SystemSample, UnifiedEvent,
};
use ops_decision::{DecisionRule, RuleCondition};
use ops_pipeline::app::{default_device, default_executor, default_llm, default_notifier, App};
use ops_pipeline::{PipelineInput, Stage};
use ops_snapshot::{detect_dangerous_changes, diff_configs};
use tempfile::tempdir;

async fn app() -> (tempfile::TempDir, App) {
    let dir = tempdir().unwrap();
    let mut config = ops_common::config::Config::default();
    config.data_dir = dir.path().to_path_buf();
    config.syslog.bind_address = "127.0.0.1:0".to_string();
    let app = App::bootstrap(&config, default_device(), default_llm(), default_notifier(), default_executor())
        .await
        .unwrap();
    (dir, app)
}

fn cpu_rule(threshold: f64) -> AlertRule {
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
        duration_samples: 1,
        cooldown_ms: 0,
        severity: Severity::Warning,
        channels: vec!["ops".into()],
        auto_response: None,
        created_at: ts,
        updated_at: ts,
        last_triggered_at: None,
    }
}

fn system_sample(cpu_pct: f32) -> SystemSample {
    SystemSample {
        timestamp: now(),
        cpu_pct,
        mem_total: 1000,
        mem_used: 400,
        mem_free_pct: 60.0,
        disk_total: 1000,
        disk_used: 400,
        disk_free_pct: 60.0,
        uptime_sec: 3600,
    }
}

fn manual_event(message: &str, severity: Severity) -> UnifiedEvent {
    UnifiedEvent {
        id: new_id(),
        source: EventSource::Manual,
        timestamp: now(),
        severity,
        category: "system".into(),
        message: message.to_string(),
        raw_data: serde_json::Value::Null,
        metadata: std::collections::HashMap::new(),
        device_info: None,
        alert_rule_info: None,
    }
}

/// Scenario 1: a CPU rule fires once the threshold is crossed, then
/// recovers once the next sample drops back below it, with no alert left
/// active.
#[tokio::test]
async fn cpu_alert_fires_and_recovers() {
    let (_dir, app) = app().await;
    app.rules.create_rule(cpu_rule(90.0)).await.unwrap();

    let triggered = app.rules.evaluate(&system_sample(95.0), &[]).await.unwrap();
    assert_eq!(triggered.len(), 1);
    let alert = &triggered[0];

    let event = ops_preprocessor::normalize_metric(
        "cpu",
        alert.severity,
        alert.message.clone(),
        alert.rule_id.clone(),
        alert.rule_name.clone(),
    );
    let (event, composite) = ops_pipeline::prepare_event(&app.device_info, &app.aggregator, event).await;
    assert!(composite.is_none());
    let outcome = app.pipeline.process(event).await;
    assert_eq!(outcome.stage, Stage::Decide);
    assert_eq!(app.rules.get_active_alerts().await.len(), 1);

    let recovered = app.rules.evaluate(&system_sample(10.0), &[]).await.unwrap();
    assert!(recovered.is_empty());
    assert!(app.rules.get_active_alerts().await.is_empty());
}

/// Scenario 2: the same alert fingerprint processed twice short-circuits
/// at the deduplicate stage the second time.
#[tokio::test]
async fn repeated_event_is_deduplicated() {
    let (_dir, app) = app().await;
    let event = manual_event("disk almost full", Severity::Warning);
    let first = app.pipeline.process(event.clone()).await;
    assert_eq!(first.stage, Stage::Decide);

    let mut repeat = event;
    repeat.id = new_id();
    let second = app.pipeline.process(repeat).await;
    assert_eq!(second.stage, Stage::Deduplicate);
    assert!(second.filtered);
}

/// Scenario 3: two flap-state transitions on the same interface within the
/// flap window surface as a composite event that the pipeline decides on.
#[tokio::test]
async fn interface_flap_burst_yields_composite_decision() {
    let (_dir, app) = app().await;

    let down = ops_preprocessor::normalize_syslog(
        &ops_preprocessor::syslog::parse_syslog("<134>Jan  1 00:00:00 r1 interface ether1 link down").unwrap(),
    );
    let up = ops_preprocessor::normalize_syslog(
        &ops_preprocessor::syslog::parse_syslog("<134>Jan  1 00:00:01 r1 interface ether1 link up").unwrap(),
    );

    let (first_event, first_composite) = ops_pipeline::prepare_event(&app.device_info, &app.aggregator, down).await;
    assert!(first_composite.is_none());
    let first_outcome = app.pipeline.process(first_event).await;
    assert_eq!(first_outcome.stage, Stage::Decide);

    let (second_event, second_composite) = ops_pipeline::prepare_event(&app.device_info, &app.aggregator, up).await;
    let composite = second_composite.expect("flap threshold should have been reached");
    assert_eq!(composite.aggregation.pattern, "interface-flapping");
    assert_eq!(composite.aggregation.count, 2);

    let plain_outcome = app.pipeline.process(second_event).await;
    assert_eq!(plain_outcome.stage, Stage::Decide);

    let composite_outcome = app.pipeline.process_composite(composite).await;
    assert_eq!(composite_outcome.stage, Stage::Decide);
}

/// Scenario 4: an event covered by an active maintenance window is
/// suppressed at the filter stage instead of reaching analysis.
#[tokio::test]
async fn maintenance_window_suppresses_event() {
    let (_dir, app) = app().await;
    app.pipeline
        .filter()
        .add_maintenance_window(MaintenanceWindow {
            id: new_id(),
            name: "planned work".into(),
            start_time: now() - chrono::Duration::seconds(60),
            end_time: now() + chrono::Duration::seconds(60),
            resources: vec!["ether*".into()],
            recurring: None,
        })
        .await
        .unwrap();

    let outcome = app.pipeline.process(manual_event("ether2 down", Severity::Warning)).await;
    assert_eq!(outcome.stage, Stage::Filter);
    assert!(outcome.filtered);
}

/// Scenario 5: a firewall-rule deletion between two config captures is
/// flagged as a high-risk dangerous change.
#[tokio::test]
async fn dangerous_config_change_is_flagged() {
    let old = "/ip firewall filter\nadd chain=input action=accept comment=allow-ssh\n";
    let new = "/ip firewall filter\n";
    let diff = diff_configs(old, new);
    let report = detect_dangerous_changes(&diff);
    assert!(report.detected);
    assert_eq!(report.patterns[0].name, "firewall_rule_deletion");
}

/// Scenario 6: an emergency-severity, widespread-impact event matches an
/// escalation rule and the decision engine escalates rather than just
/// notifying.
#[tokio::test]
async fn emergency_event_escalates_via_decision_rule() {
    let (_dir, app) = app().await;
    app.pipeline
        .decision()
        .set_rules(vec![DecisionRule {
            id: "rule-emergency-escalate".into(),
            priority: 1,
            conditions: vec![RuleCondition {
                factor: "severity".into(),
                operator: Operator::Gte,
                value: 0.95,
            }],
            action: DecisionAction::Escalate,
        }])
        .await
        .unwrap();

    let outcome = app
        .pipeline
        .process(manual_event(
            "core switch unreachable across entire site, widespread outage",
            Severity::Emergency,
        ))
        .await;
    assert_eq!(outcome.stage, Stage::Decide);
    let decision = outcome.decision.unwrap();
    assert_eq!(decision.action, DecisionAction::Escalate);
    assert_eq!(decision.matched_rule_id.as_deref(), Some("rule-emergency-escalate"));
}

/// The syslog receiver path end to end: a UDP datagram becomes a
/// `PipelineInput` the drain side can dispatch straight into the pipeline.
#[tokio::test]
async fn syslog_datagram_flows_to_a_decided_outcome() {
    let (dir, app) = app().await;
    let receiver = ops_pipeline::syslog_receiver::SyslogReceiver::bind(dir.path(), "127.0.0.1:0")
        .await
        .unwrap();
    let addr = receiver.local_addr().unwrap();
    let (handle, mut rx) = receiver.spawn(app.aggregator.clone(), app.device_info.clone());

    let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(b"<134>Jan  1 12:00:00 router1 interface ether1 link down", addr)
        .await
        .unwrap();

    let input = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
        .await
        .expect("receive timed out")
        .expect("channel closed");
    assert!(matches!(input, PipelineInput::Event(_)));
    let outcome = app.pipeline.dispatch(input).await;
    assert_eq!(outcome.stage, Stage::Decide);

    handle.abort();
}
