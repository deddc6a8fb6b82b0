//! Reflect node: decide whether to continue the plan, replan, or generate.

use std::time::Instant;

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::codes::{
    is_retryable_reason, RETRIEVAL_CLAUSE_MISSING, RETRIEVAL_EMPTY, RETRIEVAL_GRAPH_FALLBACK,
    RETRIEVAL_LOW_SCORE, RETRIEVAL_SCOPE_MISMATCH, RETRIEVAL_TIMEOUT,
    RETRIEVAL_UPSTREAM_UNAVAILABLE, STOP_MISSING_PLAN, STOP_TOOL_ERROR_NON_RETRYABLE,
    STOP_TOOL_ERROR_UNRECOVERABLE, TOOL_TIMEOUT,
};
use crate::model::{ReasoningStep, StepType, ToolResult};

use super::state::{FlowState, NextAction, StateDelta, MAX_PLAN_ATTEMPTS, RETRY_REASON_LIMIT};

/// Extract a retryable signal from a successful retrieval pass.
///
/// Intentionally multi-scope plans treat scope/clause gaps as informational
/// only; replanning cannot make a cross-scope query single-scope.
fn retrieval_signal(state: &FlowState, last: &ToolResult) -> String {
    if last.tool != "semantic_retrieval" || !last.ok {
        return String::new();
    }
    let chunk_count = last
        .output
        .get("chunk_count")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let summary_count = last
        .output
        .get("summary_count")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    if chunk_count + summary_count == 0 {
        return RETRIEVAL_EMPTY.to_string();
    }

    let Some(retrieval) = &state.retrieval else {
        return String::new();
    };
    let cross_scope = state
        .retrieval_plan
        .as_ref()
        .map(|plan| plan.requested_standards.len() >= 2)
        .unwrap_or(false);

    if !cross_scope {
        if retrieval.scope_validation_failed() {
            return RETRIEVAL_SCOPE_MISMATCH.to_string();
        }
        if !retrieval.trace.missing_scopes.is_empty() {
            return RETRIEVAL_SCOPE_MISMATCH.to_string();
        }
        if !retrieval.trace.missing_clause_refs.is_empty() {
            return RETRIEVAL_CLAUSE_MISSING.to_string();
        }
    }
    let codes = &retrieval.trace.error_codes;
    let ordered: [&str; 6] = [
        if cross_scope { "" } else { RETRIEVAL_SCOPE_MISMATCH },
        if cross_scope { "" } else { RETRIEVAL_CLAUSE_MISSING },
        RETRIEVAL_LOW_SCORE,
        RETRIEVAL_GRAPH_FALLBACK,
        RETRIEVAL_TIMEOUT,
        RETRIEVAL_UPSTREAM_UNAVAILABLE,
    ];
    for code in ordered {
        if !code.is_empty() && codes.iter().any(|candidate| candidate == code) {
            return code.to_string();
        }
    }
    String::new()
}

/// Normalize a tool error into a retry-signal code.
///
/// A `tool_timeout` is retryable only when it came from retrieval.
fn retry_reason_from_error(last: &ToolResult) -> String {
    let error = last.error.as_deref().unwrap_or("").to_string();
    if error == TOOL_TIMEOUT && last.tool == "semantic_retrieval" {
        return RETRIEVAL_TIMEOUT.to_string();
    }
    error
}

/// The reflect node.
pub fn reflect_node(state: &FlowState) -> StateDelta {
    let started = Instant::now();
    let Some(plan) = &state.tool_plan else {
        return StateDelta {
            next_action: Some(NextAction::Generate),
            stop_reason: Some(STOP_MISSING_PLAN.to_string()),
            ..Default::default()
        }
        .with_stage_timing("reflect", started.elapsed());
    };

    let cursor = state.tool_cursor;
    let mut reflections = state.reflections;
    let mut plan_attempts = state.plan_attempts;
    let max_reflections = state.max_reflections;
    let last = state.tool_results.last();

    let mut next_action = NextAction::Generate;
    let mut stop_reason = String::new();
    let mut retry_reason = String::new();
    let mut retryable = false;

    match last {
        Some(last) if !last.ok => {
            retry_reason = retry_reason_from_error(last);
            retryable = is_retryable_reason(&retry_reason);
            if retryable && reflections < max_reflections && plan_attempts < MAX_PLAN_ATTEMPTS {
                reflections += 1;
                plan_attempts += 1;
                next_action = NextAction::Replan;
            } else {
                next_action = NextAction::Generate;
                if state.stop_reason.is_empty() {
                    stop_reason = if retryable {
                        STOP_TOOL_ERROR_UNRECOVERABLE.to_string()
                    } else {
                        STOP_TOOL_ERROR_NON_RETRYABLE.to_string()
                    };
                }
            }
        }
        Some(last) if last.ok && cursor >= plan.steps.len() => {
            retry_reason = retrieval_signal(state, last);
            retryable = is_retryable_reason(&retry_reason);
            if retryable && reflections < max_reflections && plan_attempts < MAX_PLAN_ATTEMPTS {
                reflections += 1;
                plan_attempts += 1;
                next_action = NextAction::Replan;
            }
        }
        _ if cursor < plan.steps.len() => {
            next_action = NextAction::ExecuteTool;
        }
        _ => {}
    }

    let clipped_reason: String = retry_reason.chars().take(RETRY_REASON_LIMIT).collect();
    let mut step_output = Map::new();
    step_output.insert(
        "next_action".to_string(),
        json!(match next_action {
            NextAction::ExecuteTool => "execute_tool",
            NextAction::Generate => "generate",
            NextAction::Replan => "replan",
            NextAction::Interrupt => "interrupt",
        }),
    );
    step_output.insert("plan_attempts".to_string(), json!(plan_attempts));
    step_output.insert("reflections".to_string(), json!(reflections));
    step_output.insert(
        "last_tool_ok".to_string(),
        json!(last.map(|result| result.ok).unwrap_or(true)),
    );
    step_output.insert("retryable".to_string(), json!(retryable));
    step_output.insert("retry_reason".to_string(), json!(clipped_reason.clone()));
    let trace_step = ReasoningStep::new(
        state.next_step_index(),
        StepType::Reflection,
        "reflection_decision",
    )
    .with_output(step_output);

    debug!(
        ?next_action,
        retry_reason = %clipped_reason,
        retryable,
        reflections,
        plan_attempts,
        cursor,
        plan_steps = plan.steps.len(),
        "reflect_decision"
    );

    let mut delta = StateDelta {
        next_action: Some(next_action),
        plan_attempts: Some(plan_attempts),
        reflections: Some(reflections),
        append_steps: vec![trace_step],
        ..Default::default()
    };
    if !stop_reason.is_empty() {
        delta.stop_reason = Some(stop_reason);
    }
    if next_action == NextAction::Replan {
        // Replan reasons travel in working memory, never in the query text:
        // annotating the query would poison the embedding space.
        let mut memory = state.working_memory.clone();
        let reason = if clipped_reason.is_empty() {
            "retry".to_string()
        } else {
            clipped_reason
        };
        memory.insert("last_replan_reason".to_string(), json!(reason));
        delta.working_memory = Some(memory);
        delta.working_query = Some(state.user_query.clone());
    }
    delta.with_stage_timing("reflect", started.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::test_support::state_with_plan;
    use crate::model::{RetrievalDiagnostics, RetrievalTrace};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn retrieval_result(chunks: u64, summaries: u64) -> ToolResult {
        let mut output = Map::new();
        output.insert("chunk_count".to_string(), json!(chunks));
        output.insert("summary_count".to_string(), json!(summaries));
        ToolResult {
            tool: "semantic_retrieval".to_string(),
            ok: true,
            output,
            metadata: Map::new(),
            error: None,
        }
    }

    #[test]
    fn test_mid_plan_continues_execution() {
        let mut state = state_with_plan("q", &["semantic_retrieval", "python_calculator"]);
        state.tool_cursor = 1;
        state.tool_results.push(retrieval_result(2, 0));
        // Cursor still inside the plan: keep executing.
        state.tool_cursor = 1;
        let delta = reflect_node(&state);
        assert_eq!(delta.next_action, Some(NextAction::ExecuteTool));
    }

    #[test]
    fn test_empty_retrieval_triggers_replan_with_clean_query() {
        let mut state = state_with_plan("consulta original", &["semantic_retrieval"]);
        state.tool_cursor = 1;
        state.working_query = "consulta original".to_string();
        state.tool_results.push(retrieval_result(0, 0));
        let delta = reflect_node(&state);
        assert_eq!(delta.next_action, Some(NextAction::Replan));
        assert_eq!(delta.working_query.as_deref(), Some("consulta original"));
        let memory = delta.working_memory.unwrap();
        assert_eq!(memory["last_replan_reason"], json!(RETRIEVAL_EMPTY));
        assert_eq!(delta.plan_attempts, Some(2));
        assert_eq!(delta.reflections, Some(1));
    }

    #[test]
    fn test_replan_capped_by_max_attempts() {
        let mut state = state_with_plan("q", &["semantic_retrieval"]);
        state.tool_cursor = 1;
        state.plan_attempts = MAX_PLAN_ATTEMPTS;
        state.reflections = 1;
        state.max_reflections = 6;
        state.tool_results.push(retrieval_result(0, 0));
        let delta = reflect_node(&state);
        assert_eq!(delta.next_action, Some(NextAction::Generate));
        assert_eq!(delta.plan_attempts, Some(MAX_PLAN_ATTEMPTS));
    }

    #[test]
    fn test_non_retryable_error_stops() {
        let mut state = state_with_plan("q", &["python_calculator"]);
        state.tool_cursor = 1;
        state
            .tool_results
            .push(ToolResult::failure("python_calculator", "missing_expression"));
        let delta = reflect_node(&state);
        assert_eq!(delta.next_action, Some(NextAction::Generate));
        assert_eq!(
            delta.stop_reason.as_deref(),
            Some(STOP_TOOL_ERROR_NON_RETRYABLE)
        );
    }

    #[test]
    fn test_retrieval_timeout_is_retryable() {
        let mut state = state_with_plan("q", &["semantic_retrieval"]);
        state.tool_cursor = 1;
        state
            .tool_results
            .push(ToolResult::failure("semantic_retrieval", TOOL_TIMEOUT));
        let delta = reflect_node(&state);
        assert_eq!(delta.next_action, Some(NextAction::Replan));
    }

    #[test]
    fn test_cross_scope_mismatch_is_informational() {
        let mut state = state_with_plan("q", &["semantic_retrieval"]);
        state.tool_cursor = 1;
        if let Some(plan) = state.retrieval_plan.as_mut() {
            plan.requested_standards =
                vec!["ISO 9001".to_string(), "ISO 14001".to_string()];
        }
        let mut diagnostics = RetrievalDiagnostics::empty("advanced");
        diagnostics.trace = RetrievalTrace {
            missing_scopes: vec!["ISO 14001".to_string()],
            ..Default::default()
        };
        state.retrieval = Some(diagnostics);
        state.tool_results.push(retrieval_result(3, 0));
        let delta = reflect_node(&state);
        assert_eq!(delta.next_action, Some(NextAction::Generate));
    }

    #[test]
    fn test_single_scope_mismatch_is_retryable() {
        let mut state = state_with_plan("q", &["semantic_retrieval"]);
        state.tool_cursor = 1;
        if let Some(plan) = state.retrieval_plan.as_mut() {
            plan.requested_standards = vec!["ISO 9001".to_string()];
        }
        let mut diagnostics = RetrievalDiagnostics::empty("advanced");
        diagnostics.trace = RetrievalTrace {
            missing_scopes: vec!["ISO 9001".to_string()],
            ..Default::default()
        };
        state.retrieval = Some(diagnostics);
        state.tool_results.push(retrieval_result(3, 0));
        let delta = reflect_node(&state);
        assert_eq!(delta.next_action, Some(NextAction::Replan));
    }
}
