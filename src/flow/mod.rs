//! The reasoning graph: shared state, nodes, and routing.

mod execute;
mod interaction;
mod planner;
mod reflect;
mod state;
mod synthesis;

pub use execute::execute_tool_node;
pub use interaction::{decide_interaction, InteractionDecision};
pub use planner::{build_retrieval_plan, build_tool_plan, default_tool_input, planner_node};
pub use reflect::reflect_node;
pub use state::{
    FlowState, NextAction, StateDelta, ANSWER_PREVIEW_LIMIT, DEFAULT_MAX_REFLECTIONS,
    DEFAULT_MAX_STEPS, HARD_MAX_REFLECTIONS, HARD_MAX_STEPS, MAX_PLAN_ATTEMPTS,
    RETRY_REASON_LIMIT,
};
pub use synthesis::{aggregate_subqueries_node, citation_validate_node, generator_node};

use std::sync::Arc;

use crate::config::KernelConfig;
use crate::generator::AnswerGenerator;
use crate::llm::CompletionClient;
use crate::tools::ToolRegistry;
use crate::validation::CitationValidator;

/// Components shared by the graph nodes.
pub struct FlowComponents {
    pub tools: ToolRegistry,
    pub generator: Arc<dyn AnswerGenerator>,
    pub validator: CitationValidator,
    pub config: Arc<KernelConfig>,
    /// Optional LLM used to refine clarification questions and rewrite
    /// plans from user feedback; heuristics apply when absent.
    pub clarifier: Option<Arc<dyn CompletionClient>>,
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared fixtures for node tests.

    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::config::KernelConfig;
    use crate::contract::doubles::StaticContract;
    use crate::contract::RequestContext;
    use crate::error::Result;
    use crate::generator::{AnswerGenerator, GenerationRequest};
    use crate::model::{AnswerDraft, EvidenceItem, RetrievalPlan, ToolCall, ToolPlan};
    use crate::profile::AgentProfile;
    use crate::retrieval::{DeterministicSubqueryPlanner, RetrievalFlow};
    use crate::tools::{CalculatorTool, ExpectationCoverageTool, SemanticRetrievalTool, ToolRegistry};
    use crate::validation::CitationValidator;

    use super::{FlowComponents, FlowState};

    /// Deterministic generator citing the first available marker.
    pub(crate) struct EchoGenerator;

    #[async_trait]
    impl AnswerGenerator for EchoGenerator {
        async fn generate(&self, request: GenerationRequest<'_>) -> Result<AnswerDraft> {
            let mut evidence: Vec<EvidenceItem> = request.chunks.to_vec();
            evidence.extend(request.summaries.to_vec());
            let text = match evidence.first() {
                Some(item) => format!(
                    "Segun [{}], la evidencia responde a: {}",
                    item.source, request.query
                ),
                None => "No hay evidencia suficiente en el contexto.".to_string(),
            };
            Ok(AnswerDraft {
                text,
                mode: request.plan.mode.clone(),
                evidence,
            })
        }
    }

    pub(crate) fn components_with_config(
        items: Vec<EvidenceItem>,
        config: KernelConfig,
    ) -> FlowComponents {
        let config = Arc::new(config);
        let contract = Arc::new(StaticContract::with_default_items(items));
        let flow = Arc::new(RetrievalFlow::new(
            contract,
            Arc::new(DeterministicSubqueryPlanner),
            config.clone(),
        ));
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(SemanticRetrievalTool::new(flow)));
        tools.register(Arc::new(CalculatorTool));
        tools.register(Arc::new(ExpectationCoverageTool));
        FlowComponents {
            tools,
            generator: Arc::new(EchoGenerator),
            validator: CitationValidator,
            config,
            clarifier: None,
        }
    }

    pub(crate) fn components_with_items(items: Vec<EvidenceItem>) -> FlowComponents {
        components_with_config(items, KernelConfig::new("s"))
    }

    /// Flow state with an explicit tool plan and matching capabilities.
    pub(crate) fn state_with_plan(query: &str, tools: &[&str]) -> FlowState {
        let mut profile = AgentProfile::default();
        profile.capabilities.allowed_tools = tools.iter().map(|t| t.to_string()).collect();
        let mut state = FlowState::new(
            query,
            RequestContext::new("acme"),
            Arc::new(profile),
            Duration::from_secs(60),
        );
        state.retrieval_plan = Some(RetrievalPlan::generic("explicativa", Vec::new()));
        state.tool_plan = Some(ToolPlan {
            goal: query.to_string(),
            steps: tools
                .iter()
                .map(|tool| {
                    ToolCall::new(
                        *tool,
                        super::default_tool_input(tool, query, "explicativa"),
                        "test",
                    )
                })
                .collect(),
            complexity: "simple".to_string(),
        });
        state.allowed_tools = tools.iter().map(|t| t.to_string()).collect();
        state
    }
}
