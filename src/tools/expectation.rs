//! Expectation coverage: check the mode's expectation checklist against the
//! retrieved evidence so the generator can surface gaps.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::model::ToolResult;

use super::{AgentTool, ToolInvocation};

pub const EXPECTATION_TOOL: &str = "expectation_coverage";

/// The expectation-coverage tool.
#[derive(Debug, Default)]
pub struct ExpectationCoverageTool;

#[async_trait]
impl AgentTool for ExpectationCoverageTool {
    fn name(&self) -> &'static str {
        EXPECTATION_TOOL
    }

    async fn run(&self, invocation: ToolInvocation<'_>) -> ToolResult {
        let mode = invocation
            .payload
            .get("mode")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| invocation.plan.map(|plan| plan.mode.clone()))
            .unwrap_or_default();

        let expectations = invocation
            .profile
            .mode_config(&mode)
            .map(|cfg| cfg.expectations.clone())
            .unwrap_or_default();

        let mut output = Map::new();
        if expectations.is_empty() {
            output.insert("coverage_ratio".to_string(), json!(1.0));
            output.insert("covered".to_string(), json!([]));
            output.insert("missing".to_string(), json!([]));
            return ToolResult::success(EXPECTATION_TOOL, output);
        }

        let corpus: Vec<String> = invocation
            .chunks
            .iter()
            .map(|item| item.content.to_lowercase())
            .collect();

        let mut covered = Vec::new();
        let mut missing = Vec::new();
        for expectation in &expectations {
            let keywords: Vec<String> = expectation
                .keywords
                .iter()
                .map(|keyword| keyword.trim().to_lowercase())
                .filter(|keyword| !keyword.is_empty())
                .collect();
            let hit = !keywords.is_empty()
                && corpus
                    .iter()
                    .any(|content| keywords.iter().any(|keyword| content.contains(keyword)));
            if hit {
                covered.push(json!({
                    "id": expectation.id,
                    "description": expectation.description,
                }));
            } else {
                missing.push(json!({
                    "id": expectation.id,
                    "missing_risk": expectation.missing_risk,
                    "reason": if keywords.is_empty() {
                        "no_keywords_declared"
                    } else {
                        "no_keyword_match_in_evidence"
                    },
                }));
            }
        }

        let ratio = covered.len() as f64 / expectations.len() as f64;
        output.insert("coverage_ratio".to_string(), json!((ratio * 10_000.0).round() / 10_000.0));
        output.insert("covered".to_string(), Value::Array(covered));
        output.insert("missing".to_string(), Value::Array(missing));
        ToolResult::success(EXPECTATION_TOOL, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::RequestContext;
    use crate::model::EvidenceItem;
    use crate::profile::{AgentProfile, Expectation, QueryModeConfig};
    use pretty_assertions::assert_eq;

    fn profile_with_expectations() -> AgentProfile {
        let mut profile = AgentProfile::default();
        let mode = QueryModeConfig {
            expectations: vec![
                Expectation {
                    id: "seguimiento".to_string(),
                    description: "Seguimiento y medicion".to_string(),
                    keywords: vec!["seguimiento".to_string()],
                    missing_risk: "alto".to_string(),
                },
                Expectation {
                    id: "auditoria".to_string(),
                    description: "Programa de auditoria".to_string(),
                    keywords: vec!["auditoria interna".to_string()],
                    missing_risk: "medio".to_string(),
                },
            ],
            ..Default::default()
        };
        profile.query_modes.modes.insert("explicativa".to_string(), mode);
        profile
    }

    #[tokio::test]
    async fn test_coverage_splits_covered_and_missing() {
        let profile = profile_with_expectations();
        let ctx = RequestContext::new("acme");
        let chunks = vec![EvidenceItem::new("C1", "El seguimiento del desempeño", 0.9)];
        let mut payload = Map::new();
        payload.insert("mode".to_string(), json!("explicativa"));
        let invocation = ToolInvocation {
            payload,
            working_query: "q",
            plan: None,
            profile: &profile,
            ctx: &ctx,
            chunks: &chunks,
            validated_filters: None,
            scope_payload: Value::Null,
            deadline: None,
        };
        let result = ExpectationCoverageTool.run(invocation).await;
        assert!(result.ok);
        assert_eq!(result.output["coverage_ratio"], json!(0.5));
        assert_eq!(result.output["missing"].as_array().unwrap().len(), 1);
    }
}
