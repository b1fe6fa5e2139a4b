//! Decision engine (spec §4.8): four-factor scoring, priority-ordered rule
//! matching and action execution for remediation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use ops_audit::AuditLog;
use ops_common::model::{new_id, now, AlertEvent, Decision, DecisionAction, Factor, ImpactScope, Operator};
use ops_common::ports::{Notification, NotificationDispatcher};
use ops_common::{fsio, Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

const HISTORY_DIR: &str = "decisions/history";
const RULES_FILE: &str = "decisions/rules.json";

pub struct DecisionConfig {
    pub business_hours_start: u8,
    pub business_hours_end: u8,
    pub night_hours_end: u8,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            business_hours_start: 9,
            business_hours_end: 18,
            night_hours_end: 6,
        }
    }
}

/// A single decision rule condition: `factor <op> value`, all conditions in
/// a rule must hold for the rule to match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    pub factor: String,
    pub operator: Operator,
    pub value: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRule {
    pub id: String,
    pub priority: u32,
    pub conditions: Vec<RuleCondition>,
    pub action: DecisionAction,
}

fn condition_holds(condition: &RuleCondition, actual: f32) -> bool {
    match condition.operator {
        Operator::Eq => (actual - condition.value).abs() < 0.001,
        Operator::Ne => (actual - condition.value).abs() >= 0.001,
        Operator::Gt => actual > condition.value,
        Operator::Lt => actual < condition.value,
        Operator::Gte => actual >= condition.value,
        Operator::Lte => actual <= condition.value,
    }
}

pub trait RemediationExecutor: Send + Sync {
    fn execute(&self, decision: &Decision) -> Result<String>;
}

pub struct NullRemediationExecutor;
impl RemediationExecutor for NullRemediationExecutor {
    fn execute(&self, _decision: &Decision) -> Result<String> {
        Ok("no-op".to_string())
    }
}

pub struct DecisionEngine {
    data_dir: PathBuf,
    rules: RwLock<Vec<DecisionRule>>,
    notifier: Arc<dyn NotificationDispatcher>,
    executor: Arc<dyn RemediationExecutor>,
    audit: Arc<AuditLog>,
    config: DecisionConfig,
}

impl DecisionEngine {
    /// Construct an engine and load `decisions/rules.json` if present.
    pub async fn load(
        data_dir: impl Into<PathBuf>,
        notifier: Arc<dyn NotificationDispatcher>,
        executor: Arc<dyn RemediationExecutor>,
        audit: Arc<AuditLog>,
        config: DecisionConfig,
    ) -> Result<Self> {
        let data_dir = data_dir.into();
        let rules = read_rules_file(&data_dir).await?;
        Ok(Self {
            data_dir,
            rules: RwLock::new(rules),
            notifier,
            executor,
            audit,
            config,
        })
    }

    pub async fn set_rules(&self, rules: Vec<DecisionRule>) -> Result<()> {
        write_rules_file(&self.data_dir, &rules).await?;
        *self.rules.write().await = rules;
        Ok(())
    }

    pub async fn list_rules(&self) -> Vec<DecisionRule> {
        self.rules.read().await.clone()
    }

    /// Score the four factors for `alert` and `scope`, producing values in
    /// `[0, 1]`.
    pub fn score_factors(&self, alert: &AlertEvent, scope: ImpactScope, historical_success_rate: Option<f32>, at: DateTime<Utc>) -> Vec<Factor> {
        let severity_score = match alert.severity {
            ops_common::model::Severity::Info => 0.1,
            ops_common::model::Severity::Warning => 0.4,
            ops_common::model::Severity::Critical => 0.8,
            ops_common::model::Severity::Emergency => 1.0,
        };

        let hour = at.hour() as u8;
        let time_score = if hour >= self.config.business_hours_start && hour < self.config.business_hours_end {
            0.3
        } else if hour < self.config.night_hours_end {
            0.9
        } else {
            0.6
        };

        let history_score = historical_success_rate.unwrap_or(0.5).clamp(0.0, 1.0);

        let scope_score = match scope {
            ImpactScope::Local => 0.8,
            ImpactScope::Partial => 0.5,
            ImpactScope::Widespread => 0.2,
        };

        vec![
            Factor { name: "severity".into(), score: severity_score, weight: 0.35 },
            Factor { name: "time_of_day".into(), score: time_score, weight: 0.15 },
            Factor { name: "historical_success_rate".into(), score: history_score, weight: 0.25 },
            Factor { name: "affected_scope".into(), score: scope_score, weight: 0.25 },
        ]
    }

    fn weighted_score(factors: &[Factor]) -> f32 {
        factors.iter().map(|f| f.score.clamp(0.0, 1.0) * f.weight).sum::<f32>().clamp(0.0, 1.0)
    }

    /// Match the priority-ordered rule list against `factors`, keyed by
    /// factor name. An empty condition list always matches. No match falls
    /// back to `notify_and_wait`.
    async fn match_rule(&self, factors: &[Factor]) -> (DecisionAction, Option<String>) {
        let by_name: HashMap<&str, f32> = factors.iter().map(|f| (f.name.as_str(), f.score)).collect();
        let mut rules = self.rules.read().await.clone();
        rules.sort_by_key(|r| r.priority);

        for rule in &rules {
            let all_match = rule.conditions.is_empty()
                || rule.conditions.iter().all(|c| {
                    by_name
                        .get(c.factor.as_str())
                        .map(|actual| condition_holds(c, *actual))
                        .unwrap_or(false)
                });
            if all_match {
                return (rule.action, Some(rule.id.clone()));
            }
        }
        (DecisionAction::NotifyAndWait, None)
    }

    /// Decide and execute the action for `alert`, persisting the decision
    /// and recording an audit entry reflecting what happened.
    pub async fn decide(&self, alert: &AlertEvent, scope: ImpactScope, historical_success_rate: Option<f32>) -> Result<Decision> {
        let at = now();
        let factors = self.score_factors(alert, scope, historical_success_rate, at);
        let (action, matched_rule_id) = self.match_rule(&factors).await;

        let reasoning = format!(
            "weighted score {:.2} from {} factors selected {:?}",
            Self::weighted_score(&factors),
            factors.len(),
            action
        );

        let mut decision = Decision {
            id: new_id(),
            alert_id: alert.id.clone(),
            timestamp: at,
            action,
            reasoning,
            factors,
            matched_rule_id,
            executed: false,
            execution_result: None,
        };

        self.execute(&mut decision).await;
        fsio::append_day_record(&self.data_dir.join(HISTORY_DIR), decision.timestamp, &decision).await?;
        Ok(decision)
    }

    async fn execute(&self, decision: &mut Decision) {
        match decision.action {
            DecisionAction::AutoExecute => {
                let result = self.executor.execute(decision);
                decision.executed = true;
                match result {
                    Ok(output) => decision.execution_result = Some(output),
                    Err(e) => decision.execution_result = Some(format!("execution failed: {e}")),
                }
                self.audit
                    .log("decision-engine", "auto_execute", serde_json::json!({"decision_id": decision.id}))
                    .await;
            }
            DecisionAction::NotifyAndWait => {
                let notification = Notification {
                    kind: "decision".into(),
                    title: "Action required".into(),
                    body: decision.reasoning.clone(),
                    data: serde_json::json!({"decision_id": decision.id}),
                    high_priority: false,
                };
                let _ = self.notifier.send(&["default".to_string()], notification).await;
                decision.executed = true;
                self.audit
                    .log("decision-engine", "notify_and_wait", serde_json::json!({"decision_id": decision.id}))
                    .await;
            }
            DecisionAction::Escalate => {
                let notification = Notification {
                    kind: "decision".into(),
                    title: "ESCALATION".into(),
                    body: decision.reasoning.clone(),
                    data: serde_json::json!({"decision_id": decision.id}),
                    high_priority: true,
                };
                let _ = self.notifier.send(&["default".to_string()], notification).await;
                decision.executed = true;
                self.audit
                    .log("decision-engine", "escalate", serde_json::json!({"decision_id": decision.id}))
                    .await;
            }
            DecisionAction::Silence => {
                self.audit
                    .log("decision-engine", "silence", serde_json::json!({"decision_id": decision.id}))
                    .await;
            }
        }
    }

    /// Historical success rate over decisions for `matched_rule_id`, used
    /// as input to the next `decide()` call; `None` if there is no history.
    pub async fn historical_success_rate(&self, rule_id: &str) -> Result<Option<f32>> {
        let dir = self.data_dir.join(HISTORY_DIR);
        let mut total = 0usize;
        let mut succeeded = 0usize;
        for day in fsio::list_days(&dir).await? {
            let decisions: Vec<Decision> = fsio::read_day(&dir, &day).await?;
            for d in decisions {
                if d.matched_rule_id.as_deref() == Some(rule_id) {
                    total += 1;
                    if d.executed && d.execution_result.as_deref().map(|r| !r.starts_with("execution failed")).unwrap_or(true) {
                        succeeded += 1;
                    }
                }
            }
        }
        if total == 0 {
            Ok(None)
        } else {
            Ok(Some(succeeded as f32 / total as f32))
        }
    }
}

async fn read_rules_file(data_dir: &PathBuf) -> Result<Vec<DecisionRule>> {
    let path = data_dir.join(RULES_FILE);
    match tokio::fs::read(&path).await {
        Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(Error::from),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(Error::Io(e.to_string())),
    }
}

async fn write_rules_file(data_dir: &PathBuf, rules: &[DecisionRule]) -> Result<()> {
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
    use ops_common::model::{AlertStatus, Metric, Severity};
    use tempfile::tempdir;

    struct NullNotifier;
    #[async_trait]
    impl NotificationDispatcher for NullNotifier {
        async fn send(&self, _channels: &[String], _notification: Notification) -> Result<()> {
            Ok(())
        }
    }

    fn alert(severity: Severity) -> AlertEvent {
        AlertEvent {
            id: new_id(),
            rule_id: "cpu-high".into(),
            rule_name: "CPU high".into(),
            severity,
            metric: Metric::Cpu,
            current_value: 95.0,
            threshold: 90.0,
            message: "cpu high".into(),
            ai_analysis: None,
            status: AlertStatus::Active,
            triggered_at: now(),
            resolved_at: None,
            auto_response_result: None,
        }
    }

    async fn engine(dir: &std::path::Path) -> DecisionEngine {
        DecisionEngine::load(
            dir,
            Arc::new(NullNotifier),
            Arc::new(NullRemediationExecutor),
            Arc::new(AuditLog::new(dir, 90)),
            DecisionConfig::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn no_rules_defaults_to_notify_and_wait() {
        let dir = tempdir().unwrap();
        let e = engine(dir.path()).await;
        let decision = e.decide(&alert(Severity::Warning), ImpactScope::Local, None).await.unwrap();
        assert_eq!(decision.action, DecisionAction::NotifyAndWait);
        assert!(decision.matched_rule_id.is_none());
    }

    #[tokio::test]
    async fn matching_rule_picks_auto_execute() {
        let dir = tempdir().unwrap();
        let e = engine(dir.path()).await;
        e.set_rules(vec![DecisionRule {
            id: "auto-low-risk".into(),
            priority: 1,
            conditions: vec![RuleCondition { factor: "affected_scope".into(), operator: Operator::Gte, value: 0.7 }],
            action: DecisionAction::AutoExecute,
        }])
        .await
        .unwrap();

        let decision = e.decide(&alert(Severity::Warning), ImpactScope::Local, None).await.unwrap();
        assert_eq!(decision.action, DecisionAction::AutoExecute);
        assert!(decision.executed);
        assert_eq!(decision.matched_rule_id, Some("auto-low-risk".to_string()));
    }

    #[tokio::test]
    async fn rules_are_tried_in_priority_order() {
        let dir = tempdir().unwrap();
        let e = engine(dir.path()).await;
        e.set_rules(vec![
            DecisionRule {
                id: "second".into(),
                priority: 2,
                conditions: vec![],
                action: DecisionAction::Silence,
            },
            DecisionRule {
                id: "first".into(),
                priority: 1,
                conditions: vec![],
                action: DecisionAction::Escalate,
            },
        ])
        .await
        .unwrap();

        let decision = e.decide(&alert(Severity::Emergency), ImpactScope::Widespread, None).await.unwrap();
        assert_eq!(decision.matched_rule_id, Some("first".to_string()));
        assert_eq!(decision.action, DecisionAction::Escalate);
    }

    #[tokio::test]
    async fn silence_does_not_mark_executed() {
        let dir = tempdir().unwrap();
        let e = engine(dir.path()).await;
        e.set_rules(vec![DecisionRule {
            id: "silence-all".into(),
            priority: 1,
            conditions: vec![],
            action: DecisionAction::Silence,
        }])
        .await
        .unwrap();

        let decision = e.decide(&alert(Severity::Info), ImpactScope::Local, None).await.unwrap();
        assert_eq!(decision.action, DecisionAction::Silence);
        assert!(!decision.executed);
    }

    #[tokio::test]
    async fn historical_success_rate_defaults_to_none_without_history() {
        let dir = tempdir().unwrap();
        let e = engine(dir.path()).await;
        assert_eq!(e.historical_success_rate("cpu-high").await.unwrap(), None);
    }

    #[tokio::test]
    async fn emergency_alert_scores_higher_severity_factor() {
        let dir = tempdir().unwrap();
        let e = engine(dir.path()).await;
        let factors = e.score_factors(&alert(Severity::Emergency), ImpactScope::Local, None, now());
        let severity_factor = factors.iter().find(|f| f.name == "severity").unwrap();
        assert_eq!(severity_factor.score, 1.0);
    }
}
