//! The `semantic_retrieval` tool: runs the retrieval flow and packages
//! evidence plus diagnostics into the tool result metadata.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::codes::RETRIEVAL_UPSTREAM_UNAVAILABLE;
use crate::error::Error;
use crate::model::{EvidenceItem, ToolResult};
use crate::retrieval::{RetrievalArgs, RetrievalFlow};

use super::{AgentTool, ToolInvocation};

pub const RETRIEVAL_TOOL: &str = "semantic_retrieval";

/// Wraps [`RetrievalFlow`] as a plannable tool.
pub struct SemanticRetrievalTool {
    flow: Arc<RetrievalFlow>,
}

impl SemanticRetrievalTool {
    pub fn new(flow: Arc<RetrievalFlow>) -> Self {
        Self { flow }
    }
}

/// Assign sequential markers to items that arrived without one.
fn label_evidence(items: &mut [EvidenceItem], prefix: char) {
    for (index, item) in items.iter_mut().enumerate() {
        if item.source.trim().is_empty() {
            item.source = format!("{prefix}{}", index + 1);
        }
    }
}

#[async_trait]
impl AgentTool for SemanticRetrievalTool {
    fn name(&self) -> &'static str {
        RETRIEVAL_TOOL
    }

    async fn run(&self, invocation: ToolInvocation<'_>) -> ToolResult {
        let Some(plan) = invocation.plan else {
            return ToolResult::failure(RETRIEVAL_TOOL, "tool_error: missing retrieval plan");
        };
        let query = invocation
            .payload
            .get("query")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .unwrap_or(invocation.working_query);

        let args = RetrievalArgs {
            query,
            plan,
            profile: invocation.profile,
            ctx: invocation.ctx,
            validated_filters: invocation.validated_filters.clone(),
            scope_payload: invocation.scope_payload.clone(),
            deadline: invocation.deadline,
        };
        let run = match self.flow.execute(&args).await {
            Ok(run) => run,
            Err(Error::Contract { .. }) => {
                return ToolResult::failure(RETRIEVAL_TOOL, RETRIEVAL_UPSTREAM_UNAVAILABLE);
            }
            Err(error) => {
                warn!(error = %error, "semantic_retrieval_failed");
                return ToolResult::failure(RETRIEVAL_TOOL, format!("tool_error: {error}"));
            }
        };

        let (mut chunks, mut summaries): (Vec<EvidenceItem>, Vec<EvidenceItem>) = run
            .evidence
            .into_iter()
            .partition(|item| !item.is_summary());
        label_evidence(&mut chunks, 'C');
        label_evidence(&mut summaries, 'R');
        summaries.truncate(plan.summary_k as usize);

        let mut output = Map::new();
        output.insert("chunk_count".to_string(), json!(chunks.len()));
        output.insert("summary_count".to_string(), json!(summaries.len()));
        output.insert(
            "strategy".to_string(),
            json!(run.diagnostics.strategy.clone()),
        );

        let mut metadata = Map::new();
        metadata.insert("chunks".to_string(), json!(chunks));
        metadata.insert("summaries".to_string(), json!(summaries));
        metadata.insert("subquery_groups".to_string(), json!(run.groups));
        metadata.insert("retrieval".to_string(), json!(run.diagnostics));

        ToolResult::success(RETRIEVAL_TOOL, output).with_metadata(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::contract::doubles::StaticContract;
    use crate::contract::RequestContext;
    use crate::model::RetrievalPlan;
    use crate::profile::AgentProfile;
    use crate::retrieval::DeterministicSubqueryPlanner;
    use pretty_assertions::assert_eq;

    fn tool_with_items(items: Vec<EvidenceItem>) -> SemanticRetrievalTool {
        let contract = StaticContract::with_default_items(items);
        let flow = RetrievalFlow::new(
            Arc::new(contract),
            Arc::new(DeterministicSubqueryPlanner),
            Arc::new(KernelConfig::new("s")),
        );
        SemanticRetrievalTool::new(Arc::new(flow))
    }

    #[tokio::test]
    async fn test_retrieval_tool_splits_layers() {
        let chunk = EvidenceItem::new("C1", "9.1 seguimiento", 0.9).with_metadata(json!({
            "row": {"metadata": {"source_standard": "ISO 9001", "fusion_source": "chunks"}}
        }));
        let summary = EvidenceItem::new("R1", "resumen de 9.1", 0.85).with_metadata(json!({
            "row": {"metadata": {"source_standard": "ISO 9001", "fusion_source": "raptor"}}
        }));
        let tool = tool_with_items(vec![chunk, summary]);
        let profile = AgentProfile::default();
        let ctx = RequestContext::new("acme");
        let plan = RetrievalPlan::generic("explicativa", vec!["ISO 9001".to_string()]);
        let invocation = ToolInvocation {
            payload: Map::new(),
            working_query: "explica 9.1 de ISO 9001",
            plan: Some(&plan),
            profile: &profile,
            ctx: &ctx,
            chunks: &[],
            validated_filters: None,
            scope_payload: json!({"valid": true}),
            deadline: None,
        };
        let result = tool.run(invocation).await;
        assert!(result.ok);
        assert_eq!(result.output["chunk_count"], json!(1));
        assert_eq!(result.output["summary_count"], json!(1));
        assert!(result.metadata.contains_key("retrieval"));
    }

    #[tokio::test]
    async fn test_upstream_failure_maps_to_code() {
        let contract = StaticContract {
            scope_response: StaticContract::valid_scope(),
            hybrid_failure: Some("boom".to_string()),
            ..Default::default()
        };
        let flow = RetrievalFlow::new(
            Arc::new(contract),
            Arc::new(DeterministicSubqueryPlanner),
            Arc::new(KernelConfig::new("s")),
        );
        let tool = SemanticRetrievalTool::new(Arc::new(flow));
        let profile = AgentProfile::default();
        let ctx = RequestContext::new("acme");
        let plan = RetrievalPlan::generic("explicativa", vec![]);
        let invocation = ToolInvocation {
            payload: Map::new(),
            working_query: "algo",
            plan: Some(&plan),
            profile: &profile,
            ctx: &ctx,
            chunks: &[],
            validated_filters: None,
            scope_payload: Value::Null,
            deadline: None,
        };
        let result = tool.run(invocation).await;
        assert!(!result.ok);
        assert_eq!(result.error.as_deref(), Some(RETRIEVAL_UPSTREAM_UNAVAILABLE));
    }
}
