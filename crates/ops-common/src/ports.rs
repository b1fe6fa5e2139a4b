//! Collaborator interfaces (spec §6) the core depends on but does not
//! implement: the device protocol client, the LLM analysis service, the
//! notification dispatcher, and a minimal scheduler contract. Production
//! wiring supplies real implementations; tests use the `Null*` doubles
//! below, mirroring the teacher's `tests/utils/mock_services.rs`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

#[async_trait]
pub trait DeviceClient: Send + Sync {
    async fn is_connected(&self) -> bool;
    async fn print(&self, path: &str) -> Result<Vec<Value>>;
    async fn execute_raw(&self, path: &str, params: Value) -> Result<Value>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmAnalysisRequest {
    pub kind: String,
    pub context: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmAnalysisResponse {
    pub summary: String,
    pub recommendations: Vec<String>,
    pub risk_level: Option<String>,
    pub confidence: Option<f32>,
}

#[async_trait]
pub trait LlmAnalyzer: Send + Sync {
    async fn analyze(&self, request: LlmAnalysisRequest) -> Result<LlmAnalysisResponse>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub kind: String,
    pub title: String,
    pub body: String,
    pub data: Value,
    pub high_priority: bool,
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send(&self, channels: &[String], notification: Notification) -> Result<()>;
}

/// Always-disconnected device client; used where no device I/O is under
/// test and a timeout/skip path should be exercised.
pub struct NullDeviceClient;

#[async_trait]
impl DeviceClient for NullDeviceClient {
    async fn is_connected(&self) -> bool {
        false
    }

    async fn print(&self, _path: &str) -> Result<Vec<Value>> {
        Ok(Vec::new())
    }

    async fn execute_raw(&self, _path: &str, _params: Value) -> Result<Value> {
        Ok(Value::Null)
    }
}

/// Best-effort LLM stub that always fails, exercising the pipeline's
/// degrade-gracefully path (spec §7).
pub struct NullLlmAnalyzer;

#[async_trait]
impl LlmAnalyzer for NullLlmAnalyzer {
    async fn analyze(&self, _request: LlmAnalysisRequest) -> Result<LlmAnalysisResponse> {
        Err(crate::Error::Dependency("no LLM analyzer configured".into()))
    }
}

/// Notification dispatcher that only logs; used in tests and as a safe
/// default when no real channel configuration is supplied.
pub struct LoggingNotificationDispatcher;

#[async_trait]
impl NotificationDispatcher for LoggingNotificationDispatcher {
    async fn send(&self, channels: &[String], notification: Notification) -> Result<()> {
        tracing::info!(
            channels = ?channels,
            title = %notification.title,
            high_priority = notification.high_priority,
            "notification dispatched"
        );
        Ok(())
    }
}
