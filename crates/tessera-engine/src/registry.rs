use std::collections::HashMap;
use std::sync::Arc;

use tessera_core::error::{Result, TesseraError};
use tessera_core::traits::Agent;
use tessera_core::workflow::WorkflowStep;

/// Registry of worker agents, routed by action name.
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
    routes: HashMap<String, String>,
    fallback: Option<String>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent and route every action it declares to it.
    pub fn register(&mut self, agent: impl Agent) {
        self.register_arc(Arc::new(agent));
    }

    pub fn register_arc(&mut self, agent: Arc<dyn Agent>) {
        let name = agent.name().to_string();
        for action in agent.actions() {
            self.routes.insert(action, name.clone());
        }
        self.agents.insert(name, agent);
    }

    /// Route an action to an already registered agent.
    pub fn route(&mut self, action: impl Into<String>, agent: impl Into<String>) {
        self.routes.insert(action.into(), agent.into());
    }

    /// Agent used when no route matches.
    pub fn set_fallback(&mut self, agent: impl Into<String>) {
        self.fallback = Some(agent.into());
    }

    /// Unregister an agent by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.routes.retain(|_, agent| agent != name);
        self.agents.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    /// List all registered agents.
    pub fn list(&self) -> Vec<&str> {
        self.agents.keys().map(|s| s.as_str()).collect()
    }

    /// Pick the agent for a step: explicit override, then action route,
    /// then the fallback.
    pub fn resolve(&self, step: &WorkflowStep) -> Result<Arc<dyn Agent>> {
        if let Some(name) = &step.agent {
            return self
                .get(name)
                .ok_or_else(|| TesseraError::AgentNotFound(name.clone()));
        }
        self.routes
            .get(&step.action)
            .or(self.fallback.as_ref())
            .and_then(|name| self.get(name))
            .ok_or_else(|| TesseraError::AgentNotFound(step.action.clone()))
    }

    /// Create a registry with the built-in agents, `echo` as fallback.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::agents::EchoAgent);
        registry.register(crate::agents::DelayAgent);
        registry.set_fallback("echo");
        registry
    }
}
