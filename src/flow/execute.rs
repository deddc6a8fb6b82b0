//! Execute-tool node: run the next planned tool with piped context and a
//! per-tool deadline, then fold its result into the state.

use std::time::Instant;

use serde_json::{json, Map, Value};
use tracing::{error, warn};

use crate::codes::{STOP_MAX_STEPS, STOP_MISSING_PLAN, TOOL_NOT_REGISTERED, TOOL_TIMEOUT};
use crate::config::ContractMode;
use crate::model::{
    sanitize_payload, EvidenceItem, ReasoningStep, RetrievalDiagnostics, StepType, SubqueryGroup,
    ToolResult,
};
use crate::tools::{infer_expression, ToolInvocation};

use super::state::{FlowState, NextAction, StateDelta, SANITIZE_LIMIT};
use super::FlowComponents;

/// Effective deadline for one tool, before the adaptive clamp.
///
/// `semantic_retrieval` on the advanced contract gets the widest retrieval
/// stage budget, capped so the generator and validator tail still fits in
/// the total budget.
fn effective_tool_timeout_ms(components: &FlowComponents, tool_name: &str) -> u64 {
    let timeouts = &components.config.stage_timeouts;
    let base = timeouts.execute_tool_ms;
    if tool_name != "semantic_retrieval"
        || components.config.retrieval_contract == ContractMode::Legacy
    {
        return base;
    }
    let retrieval = timeouts
        .retrieval_hybrid_ms
        .max(timeouts.retrieval_multi_query_ms)
        .max(timeouts.retrieval_coverage_repair_ms);
    let tail = (timeouts.plan_ms + timeouts.classify_ms + timeouts.generate_ms
        + timeouts.validate_ms
        + 300)
        .max(400);
    let cap = components
        .config
        .total_timeout_ms
        .saturating_sub(tail)
        .max(base);
    base.max(retrieval.min(cap))
}

/// The execute-tool node.
pub async fn execute_tool_node(state: &FlowState, components: &FlowComponents) -> StateDelta {
    let started = Instant::now();
    let Some(plan) = &state.tool_plan else {
        return StateDelta {
            next_action: Some(NextAction::Generate),
            stop_reason: Some(STOP_MISSING_PLAN.to_string()),
            ..Default::default()
        }
        .with_stage_timing("execute_tool", started.elapsed());
    };
    let cursor = state.tool_cursor;
    if cursor >= plan.steps.len() {
        return StateDelta {
            next_action: Some(NextAction::Generate),
            ..Default::default()
        }
        .with_stage_timing("execute_tool", started.elapsed());
    }
    if state.tool_results.len() >= state.max_steps as usize {
        return StateDelta {
            next_action: Some(NextAction::Generate),
            stop_reason: Some(STOP_MAX_STEPS.to_string()),
            ..Default::default()
        }
        .with_stage_timing("execute_tool", started.elapsed());
    }

    let step_call = &plan.steps[cursor];
    let tool_name = step_call.tool.trim().to_string();
    let tool = components.tools.get(&tool_name);

    let mut tool_elapsed_ms = 0.0;
    let result = match tool {
        None => ToolResult::failure(&tool_name, TOOL_NOT_REGISTERED),
        Some(tool) => {
            let mut payload = step_call.input.clone();
            // Pipe the previous tool's result so tools can chain.
            if cursor > 0 {
                if let Some(prev) = state.tool_results.last() {
                    if prev.ok {
                        if !prev.output.is_empty() {
                            payload
                                .entry("previous_tool_output".to_string())
                                .or_insert(Value::Object(prev.output.clone()));
                        }
                        if !prev.metadata.is_empty() {
                            payload
                                .entry("previous_tool_metadata".to_string())
                                .or_insert(Value::Object(prev.metadata.clone()));
                        }
                    }
                }
            }
            if !state.working_memory.is_empty() {
                payload.insert(
                    "working_memory".to_string(),
                    Value::Object(state.working_memory.clone()),
                );
            }
            if tool_name == "python_calculator"
                && payload
                    .get("expression")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .map(str::is_empty)
                    .unwrap_or(true)
            {
                if let Some(expression) = infer_expression(&state.working_query) {
                    payload.insert("expression".to_string(), json!(expression));
                }
            }

            let mut timeout_ms = effective_tool_timeout_ms(components, &tool_name);
            if let Some(policy) = state.profile.capabilities.tool_policies.get(&tool_name) {
                timeout_ms = policy.timeout_ms.clamp(20, 5_000);
            }
            let timeout = state.adaptive_timeout(timeout_ms, 2_800);

            let invocation = ToolInvocation {
                payload,
                working_query: &state.working_query,
                plan: state.retrieval_plan.as_ref(),
                profile: &state.profile,
                ctx: &state.ctx,
                chunks: &state.chunks,
                validated_filters: state.validated_filters.clone(),
                scope_payload: state.scope_payload.clone(),
                deadline: Some(state.deadline),
            };
            let tool_started = Instant::now();
            let outcome = tokio::time::timeout(timeout, tool.run(invocation)).await;
            tool_elapsed_ms = tool_started.elapsed().as_secs_f64() * 1000.0;
            match outcome {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        tool = %tool_name,
                        timeout_ms = timeout.as_millis() as u64,
                        "tool_timed_out"
                    );
                    ToolResult::failure(&tool_name, TOOL_TIMEOUT)
                }
            }
        }
    };

    if !result.ok {
        error!(tool = %tool_name, error = ?result.error, "tool_execution_failed");
    }

    let mut step_output = sanitize_payload(&result.output, SANITIZE_LIMIT);
    step_output.insert(
        "duration_ms".to_string(),
        json!((tool_elapsed_ms * 100.0).round() / 100.0),
    );
    let trace_step = ReasoningStep::new(
        state.next_step_index(),
        StepType::Tool,
        if step_call.rationale.is_empty() {
            "tool_execution".to_string()
        } else {
            step_call.rationale.clone()
        },
    )
    .with_tool(&tool_name)
    .with_input(sanitize_payload(&step_call.input, SANITIZE_LIMIT))
    .with_output(step_output)
    .with_outcome(result.ok, result.error.clone());

    let mut delta = StateDelta {
        tool_cursor: Some(cursor + 1),
        append_steps: vec![trace_step],
        ..Default::default()
    };
    delta
        .tool_timings
        .insert(tool_name.clone(), tool_elapsed_ms);

    if tool_name == "semantic_retrieval" && result.ok {
        // Retrieval results accumulate across passes rather than replace.
        let chunks: Vec<EvidenceItem> = result
            .metadata
            .get("chunks")
            .cloned()
            .map(|value| serde_json::from_value(value).unwrap_or_default())
            .unwrap_or_default();
        let summaries: Vec<EvidenceItem> = result
            .metadata
            .get("summaries")
            .cloned()
            .map(|value| serde_json::from_value(value).unwrap_or_default())
            .unwrap_or_default();
        let groups: Vec<SubqueryGroup> = result
            .metadata
            .get("subquery_groups")
            .cloned()
            .map(|value| serde_json::from_value(value).unwrap_or_default())
            .unwrap_or_default();
        if let Some(diagnostics) = result
            .metadata
            .get("retrieval")
            .cloned()
            .and_then(|value| serde_json::from_value::<RetrievalDiagnostics>(value).ok())
        {
            delta.retrieval = Some(diagnostics);
        }
        delta.append_chunks = chunks;
        delta.append_summaries = summaries;
        delta.append_subquery_groups = groups;
    } else if result.ok {
        let mut memory = state.working_memory.clone();
        memory.insert(result.tool.clone(), Value::Object(result.output.clone()));
        delta.working_memory = Some(memory);
    }
    delta.push_tool_results = vec![result];
    delta.with_stage_timing("execute_tool", started.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::test_support::{components_with_items, state_with_plan};
    use crate::model::ToolCall;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_retrieval_results_accumulate() {
        let item = EvidenceItem::new("C1", "9.1 seguimiento", 0.9).with_metadata(json!({
            "row": {"metadata": {"source_standard": "ISO 9001"}}
        }));
        let components = components_with_items(vec![item]);
        let mut state = state_with_plan(
            "Que exige la cláusula 9.1 de ISO 9001?",
            &["semantic_retrieval"],
        );
        let delta = execute_tool_node(&state, &components).await;
        state.apply(delta);
        assert_eq!(state.chunks.len(), 1);
        assert_eq!(state.tool_cursor, 1);
        assert!(state.retrieval.is_some());
        assert!(state.tool_results[0].ok);

        // A second pass appends instead of replacing.
        state.tool_cursor = 0;
        let delta = execute_tool_node(&state, &components).await;
        state.apply(delta);
        assert_eq!(state.chunks.len(), 2);
    }

    #[tokio::test]
    async fn test_unregistered_tool_fails_cleanly() {
        let components = components_with_items(vec![]);
        let mut state = state_with_plan("algo", &[]);
        state.tool_plan = Some(crate::model::ToolPlan {
            goal: "algo".to_string(),
            steps: vec![ToolCall::new("no_such_tool", Map::new(), "r")],
            complexity: "simple".to_string(),
        });
        let delta = execute_tool_node(&state, &components).await;
        state.apply(delta);
        assert!(!state.tool_results[0].ok);
        assert_eq!(
            state.tool_results[0].error.as_deref(),
            Some(TOOL_NOT_REGISTERED)
        );
    }

    #[tokio::test]
    async fn test_calculator_expression_inferred_and_memorized() {
        let components = components_with_items(vec![]);
        let mut state = state_with_plan(
            "Calcula 5*(20+2) con los límites del 9.1",
            &["python_calculator"],
        );
        let delta = execute_tool_node(&state, &components).await;
        state.apply(delta);
        let result = &state.tool_results[0];
        assert!(result.ok, "error: {:?}", result.error);
        assert_eq!(result.output["result"], json!(110));
        let memory = state.working_memory.get("python_calculator").unwrap();
        assert_eq!(memory["result"], json!(110));
    }

    #[tokio::test]
    async fn test_max_steps_stops_execution() {
        let components = components_with_items(vec![]);
        let mut state = state_with_plan("algo", &["semantic_retrieval"]);
        state.max_steps = 0;
        let delta = execute_tool_node(&state, &components).await;
        state.apply(delta);
        assert_eq!(state.stop_reason, STOP_MAX_STEPS);
        assert_eq!(state.next_action, NextAction::Generate);
    }
}
