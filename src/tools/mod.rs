//! Agent tools: the registry and the built-in tool set.

mod calculator;
mod expectation;
mod retrieval;

pub use calculator::{infer_expression, CalculatorTool};
pub use expectation::ExpectationCoverageTool;
pub use retrieval::SemanticRetrievalTool;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::contract::RequestContext;
use crate::model::{EvidenceItem, RetrievalPlan, ToolResult};
use crate::profile::AgentProfile;

/// Everything a tool can read for one invocation.
pub struct ToolInvocation<'a> {
    /// Planned input merged with piped context.
    pub payload: Map<String, Value>,
    pub working_query: &'a str,
    pub plan: Option<&'a RetrievalPlan>,
    pub profile: &'a AgentProfile,
    pub ctx: &'a RequestContext,
    pub chunks: &'a [EvidenceItem],
    pub validated_filters: Option<Value>,
    pub scope_payload: Value,
    /// Total-budget deadline; long-running tools shrink to fit.
    pub deadline: Option<Instant>,
}

/// A tool the planner can schedule.
///
/// Tools report failures through `ToolResult::failure`, never by erroring:
/// the reflect node owns the retry decision.
#[async_trait]
pub trait AgentTool: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, invocation: ToolInvocation<'_>) -> ToolResult;
}

/// Registry of tools available to the kernel.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, Arc<dyn AgentTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn AgentTool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentTool>> {
        self.tools.get(name.trim()).cloned()
    }

    /// Tools both registered and allowed by the profile, in profile order.
    pub fn resolve_allowed(&self, profile: &AgentProfile) -> Vec<String> {
        profile
            .capabilities
            .allowed_tools
            .iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty() && self.tools.contains_key(name.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct NoopTool;

    #[async_trait]
    impl AgentTool for NoopTool {
        fn name(&self) -> &'static str {
            "python_calculator"
        }

        async fn run(&self, _invocation: ToolInvocation<'_>) -> ToolResult {
            ToolResult::success("python_calculator", Map::new())
        }
    }

    #[test]
    fn test_resolve_allowed_preserves_profile_order() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(NoopTool));
        let mut profile = AgentProfile::default();
        profile.capabilities.allowed_tools = vec![
            "python_calculator".to_string(),
            "unregistered_tool".to_string(),
        ];
        assert_eq!(
            registry.resolve_allowed(&profile),
            vec!["python_calculator".to_string()]
        );
    }
}
