use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{info, warn};

use tessera_core::config::RetryConfig;
use tessera_core::error::{Result, TesseraError};
use tessera_core::expr::lookup;
use tessera_core::workflow::WorkflowStep;

use crate::registry::AgentRegistry;
use crate::run::ExecutionHandle;

/// Dispatches single steps to agents with timeout and retry.
pub struct StepExecutor {
    agents: Arc<AgentRegistry>,
    retry: RetryConfig,
    default_timeout: Duration,
}

impl StepExecutor {
    pub fn new(agents: Arc<AgentRegistry>, retry: RetryConfig, default_timeout: Duration) -> Self {
        Self {
            agents,
            retry,
            default_timeout,
        }
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    /// Run one step to a terminal record.
    ///
    /// Each attempt is bounded by the step timeout. A failed attempt is
    /// retried up to `retry_count` times with exponential backoff; the last
    /// error is returned once retries are exhausted. Cancellation of the
    /// execution marks the record cancelled and returns `Cancelled`.
    pub async fn execute(
        &self,
        run: &ExecutionHandle,
        step: &WorkflowStep,
        iteration: Option<u32>,
    ) -> Result<Value> {
        let agent = match self.agents.resolve(step) {
            Ok(agent) => agent,
            Err(e) => {
                // Still leave a failed record behind so the run shows why.
                let record = run.begin_step(&step.id, "", iteration).await?;
                run.fail_step(&record, &e).await?;
                return Err(e);
            }
        };
        let timeout = step
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        let record = run.begin_step(&step.id, agent.name(), iteration).await?;
        let mut attempt: u32 = 0;

        loop {
            let context = run.variables().await;
            let parameters = interpolate(&Value::Object(step.parameters.clone()), &context);
            let started = Instant::now();

            let outcome = tokio::select! {
                _ = run.cancel.cancelled() => {
                    run.cancel_step(&record).await?;
                    return Err(TesseraError::Cancelled);
                }
                r = tokio::time::timeout(timeout, agent.execute(&step.action, parameters, context)) => r,
            };

            let err = match outcome {
                Ok(Ok(value)) => {
                    info!(
                        execution_id = %run.id,
                        step_id = %step.id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Step completed"
                    );
                    run.complete_step(&record, value.clone(), step.output_variable.as_deref())
                        .await?;
                    return Ok(value);
                }
                Ok(Err(e)) => TesseraError::StepFailure {
                    step: step.id.clone(),
                    message: e.to_string(),
                },
                Err(_) => TesseraError::StepTimeout {
                    step: step.id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                },
            };

            run.fail_step(&record, &err).await?;
            if attempt >= step.retry_count {
                warn!(execution_id = %run.id, step_id = %step.id, error = %err, "Step failed");
                return Err(err);
            }

            let backoff = calculate_backoff(attempt, &self.retry);
            warn!(
                execution_id = %run.id,
                step_id = %step.id,
                attempt = attempt + 1,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Step failed, retrying"
            );
            tokio::select! {
                _ = run.cancel.cancelled() => return Err(TesseraError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
            attempt += 1;
            run.retry_step(&record).await?;
        }
    }
}

pub(crate) fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let factor = 2u64.saturating_pow(attempt);
    let ms = config
        .initial_backoff_ms
        .saturating_mul(factor)
        .min(config.max_backoff_ms);
    if !config.jitter {
        return Duration::from_millis(ms);
    }
    // 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

/// Replace `${path}` placeholders in string parameters with context values.
///
/// A string that is exactly one placeholder takes the value's JSON type;
/// placeholders embedded in text are rendered as text. Unknown paths
/// resolve to null.
pub fn interpolate(value: &Value, vars: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => interpolate_str(s, vars),
        Value::Array(items) => Value::Array(items.iter().map(|v| interpolate(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_path(path: &str, vars: &HashMap<String, Value>) -> Value {
    let parts: Vec<String> = path.trim().split('.').map(str::to_string).collect();
    lookup(&parts, vars)
}

fn interpolate_str(s: &str, vars: &HashMap<String, Value>) -> Value {
    if let Some(inner) = s.strip_prefix("${").and_then(|r| r.strip_suffix('}')) {
        if !inner.contains("${") && !inner.contains('}') {
            return resolve_path(inner, vars);
        }
    }
    if !s.contains("${") {
        return Value::String(s.to_string());
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                match resolve_path(&after[..end], vars) {
                    Value::String(text) => out.push_str(&text),
                    Value::Null => {}
                    other => out.push_str(&other.to_string()),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    Value::String(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> HashMap<String, Value> {
        HashMap::from([
            ("lead".to_string(), json!({"name": "Ada", "score": 91})),
            ("tags".to_string(), json!(["hot", "b2b"])),
        ])
    }

    #[test]
    fn whole_placeholder_keeps_type() {
        assert_eq!(interpolate(&json!("${lead.score}"), &vars()), json!(91));
        assert_eq!(interpolate(&json!("${tags}"), &vars()), json!(["hot", "b2b"]));
        assert_eq!(interpolate(&json!("${missing}"), &vars()), Value::Null);
    }

    #[test]
    fn embedded_placeholders_render_text() {
        let out = interpolate(&json!("Hi ${lead.name}, score ${lead.score}${nope}!"), &vars());
        assert_eq!(out, json!("Hi Ada, score 91!"));
    }

    #[test]
    fn nested_structures() {
        let out = interpolate(
            &json!({"to": "${lead.name}", "list": ["${tags.0}", 3], "n": true}),
            &vars(),
        );
        assert_eq!(out, json!({"to": "Ada", "list": ["hot", 3], "n": true}));
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        assert_eq!(interpolate(&json!("cost ${oops"), &vars()), json!("cost ${oops"));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let cfg = RetryConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            jitter: false,
        };
        assert_eq!(calculate_backoff(0, &cfg), Duration::from_millis(100));
        assert_eq!(calculate_backoff(2, &cfg), Duration::from_millis(400));
        assert_eq!(calculate_backoff(10, &cfg), Duration::from_millis(1000));
        assert_eq!(calculate_backoff(80, &cfg), Duration::from_millis(1000));
    }

    #[test]
    fn backoff_jitter_range() {
        let cfg = RetryConfig {
            initial_backoff_ms: 1000,
            max_backoff_ms: 10_000,
            jitter: true,
        };
        for _ in 0..50 {
            let ms = calculate_backoff(0, &cfg).as_millis();
            assert!((800..=1200).contains(&ms), "{ms}");
        }
    }
}
