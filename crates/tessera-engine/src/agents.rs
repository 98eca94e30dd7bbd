//! Built-in agents used for dry runs and smoke tests.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;

use tessera_core::error::{Result, TesseraError};
use tessera_core::traits::Agent;

/// Returns its resolved parameters, tagged with the action name.
pub struct EchoAgent;

impl Agent for EchoAgent {
    fn name(&self) -> &str {
        "echo"
    }

    fn actions(&self) -> Vec<String> {
        vec!["echo".into()]
    }

    fn execute(
        &self,
        action: &str,
        parameters: serde_json::Value,
        _context: HashMap<String, serde_json::Value>,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        let action = action.to_string();
        Box::pin(async move {
            tracing::debug!(action = %action, "echo agent");
            Ok(serde_json::json!({ "action": action, "parameters": parameters }))
        })
    }
}

/// Sleeps for `ms` milliseconds, then returns `{ "slept_ms": ms }`.
pub struct DelayAgent;

#[derive(Deserialize)]
struct DelayInput {
    #[serde(default = "default_delay")]
    ms: u64,
}

fn default_delay() -> u64 {
    100
}

impl Agent for DelayAgent {
    fn name(&self) -> &str {
        "delay"
    }

    fn actions(&self) -> Vec<String> {
        vec!["delay".into()]
    }

    fn execute(
        &self,
        _action: &str,
        parameters: serde_json::Value,
        _context: HashMap<String, serde_json::Value>,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let input: DelayInput = serde_json::from_value(parameters)
                .map_err(|e| TesseraError::Agent(format!("invalid delay parameters: {}", e)))?;
            tokio::time::sleep(Duration::from_millis(input.ms)).await;
            Ok(serde_json::json!({ "slept_ms": input.ms }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_returns_parameters() {
        let out = EchoAgent
            .execute("crm.tag", serde_json::json!({"tag": "hot"}), HashMap::new())
            .await
            .unwrap();
        assert_eq!(out["action"], "crm.tag");
        assert_eq!(out["parameters"]["tag"], "hot");
    }

    #[tokio::test]
    async fn delay_sleeps() {
        let start = std::time::Instant::now();
        let out = DelayAgent
            .execute("delay", serde_json::json!({"ms": 20}), HashMap::new())
            .await
            .unwrap();
        assert_eq!(out["slept_ms"], 20);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn delay_rejects_bad_input() {
        let err = DelayAgent
            .execute("delay", serde_json::json!({"ms": "soon"}), HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::Agent(_)));
    }
}
