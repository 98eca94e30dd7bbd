use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use serde_json::{json, Value};

use tessera_core::error::{Result, TesseraError};
use tessera_core::traits::Agent;

enum Outcome {
    Return(Value),
    Fail(String),
    Panic,
}

#[derive(Default)]
struct Script {
    default_delay_ms: u64,
    random_delay_ms: Option<(u64, u64)>,
    delays: HashMap<String, u64>,
    always_fail: HashSet<String>,
    panics: HashSet<String>,
    fail_times: HashMap<String, u32>,
    returns: HashMap<String, Value>,
}

#[derive(Default)]
struct Observed {
    calls: Mutex<Vec<String>>,
    current: AtomicUsize,
    peak: AtomicUsize,
}

/// Agent whose behavior is scripted per action.
///
/// Registered under the name `scripted`; tests usually make it the registry
/// fallback and use each step's id as its action. Clones share both the
/// script and the observations.
#[derive(Clone, Default)]
pub struct ScriptedAgent {
    script: Arc<Mutex<Script>>,
    observed: Arc<Observed>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    fn edit(self, f: impl FnOnce(&mut Script)) -> Self {
        if let Ok(mut script) = self.script.lock() {
            f(&mut script);
        }
        self
    }

    /// Delay applied to every action without its own delay.
    pub fn with_default_delay(self, ms: u64) -> Self {
        self.edit(|s| s.default_delay_ms = ms)
    }

    pub fn with_delay(self, action: &str, ms: u64) -> Self {
        self.edit(|s| {
            s.delays.insert(action.to_string(), ms);
        })
    }

    /// Uniform random delay in `[min_ms, max_ms]` for every action.
    pub fn with_random_delay(self, min_ms: u64, max_ms: u64) -> Self {
        self.edit(|s| s.random_delay_ms = Some((min_ms, max_ms.max(min_ms))))
    }

    pub fn always_fail(self, action: &str) -> Self {
        self.edit(|s| {
            s.always_fail.insert(action.to_string());
        })
    }

    /// Panic inside the call instead of returning.
    pub fn panic_on(self, action: &str) -> Self {
        self.edit(|s| {
            s.panics.insert(action.to_string());
        })
    }

    /// Fail the first `n` calls of `action`, then succeed.
    pub fn fail_times(self, action: &str, n: u32) -> Self {
        self.edit(|s| {
            s.fail_times.insert(action.to_string(), n);
        })
    }

    pub fn returns(self, action: &str, value: Value) -> Self {
        self.edit(|s| {
            s.returns.insert(action.to_string(), value);
        })
    }

    /// Actions in the order their calls started.
    pub fn calls(&self) -> Vec<String> {
        self.observed
            .calls
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self, action: &str) -> usize {
        self.calls().iter().filter(|c| *c == action).count()
    }

    /// Most calls ever in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.observed.peak.load(Ordering::SeqCst)
    }

    /// Decide delay and outcome for one call.
    fn plan(&self, action: &str, parameters: &Value) -> (u64, Outcome) {
        let Ok(mut script) = self.script.lock() else {
            return (0, Outcome::Fail("script poisoned".into()));
        };
        let delay = match (script.delays.get(action), script.random_delay_ms) {
            (Some(ms), _) => *ms,
            (None, Some((lo, hi))) => rand::thread_rng().gen_range(lo..=hi),
            (None, None) => script.default_delay_ms,
        };

        if script.panics.contains(action) {
            return (delay, Outcome::Panic);
        }
        if script.always_fail.contains(action) {
            return (delay, Outcome::Fail(format!("{} failed", action)));
        }
        if let Some(left) = script.fail_times.get_mut(action) {
            if *left > 0 {
                *left -= 1;
                return (delay, Outcome::Fail(format!("{} failed (transient)", action)));
            }
        }
        let value = script
            .returns
            .get(action)
            .cloned()
            .unwrap_or_else(|| json!({ "action": action, "params": parameters }));
        (delay, Outcome::Return(value))
    }
}

impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted"
    }

    fn execute(
        &self,
        action: &str,
        parameters: Value,
        _context: HashMap<String, Value>,
    ) -> BoxFuture<'_, Result<Value>> {
        let action = action.to_string();
        Box::pin(async move {
            if let Ok(mut calls) = self.observed.calls.lock() {
                calls.push(action.clone());
            }
            let now = self.observed.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.observed.peak.fetch_max(now, Ordering::SeqCst);

            let (delay, outcome) = self.plan(&action, &parameters);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            self.observed.current.fetch_sub(1, Ordering::SeqCst);
            match outcome {
                Outcome::Return(value) => Ok(value),
                Outcome::Fail(message) => Err(TesseraError::Agent(message)),
                Outcome::Panic => panic!("scripted panic in {}", action),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transient_failures_then_success() {
        let agent = ScriptedAgent::new().fail_times("flaky", 2);
        for _ in 0..2 {
            assert!(agent
                .execute("flaky", json!({}), HashMap::new())
                .await
                .is_err());
        }
        assert!(agent
            .execute("flaky", json!({}), HashMap::new())
            .await
            .is_ok());
        assert_eq!(agent.call_count("flaky"), 3);
    }

    #[tokio::test]
    async fn scripted_return_and_echo() {
        let agent = ScriptedAgent::new().returns("count", json!(7));
        let clone = agent.clone();
        assert_eq!(
            clone
                .execute("count", json!({}), HashMap::new())
                .await
                .unwrap(),
            json!(7)
        );
        let echoed = agent
            .execute("other", json!({"x": 1}), HashMap::new())
            .await
            .unwrap();
        assert_eq!(echoed["params"]["x"], 1);
        assert_eq!(agent.calls(), vec!["count", "other"]);
    }
}
