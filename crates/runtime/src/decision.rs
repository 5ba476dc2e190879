//! Decision logging sink.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

/// One completed (or failed) query evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionEvent {
    pub decision_id: Uuid,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait DecisionLogger: Send + Sync {
    async fn log(&self, event: DecisionEvent);
}

/// Writes every decision to the log.
#[derive(Debug, Default)]
pub struct ConsoleDecisionLogger;

#[async_trait]
impl DecisionLogger for ConsoleDecisionLogger {
    async fn log(&self, event: DecisionEvent) {
        let line = serde_json::to_string(&event).unwrap_or_default();
        info!(decision_id = %event.decision_id, event = %line, "decision");
    }
}

/// `decision_logs.console = true` in the engine configuration.
pub fn console_enabled(decision_logs: Option<&Value>) -> bool {
    decision_logs
        .and_then(|v| v.get("console"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn console_flag_is_read_from_config() {
        assert!(console_enabled(Some(&json!({"console": true}))));
        assert!(!console_enabled(Some(&json!({"console": false}))));
        assert!(!console_enabled(None));
    }
}
