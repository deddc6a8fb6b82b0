//! Shared flow state and the delta-merge runtime.
//!
//! Each node reads a snapshot of [`FlowState`] and returns a [`StateDelta`];
//! the runtime merges deltas append-only for lists, overwrite for scalars,
//! and union for timing maps. Reasoning steps stay monotone in `index`
//! because merging is single-threaded per query.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use crate::contract::RequestContext;
use crate::model::{
    AnswerDraft, ClarificationContext, ClarificationRequest, EvidenceItem, PartialAnswer,
    QueryIntent, ReasoningStep, RetrievalDiagnostics, RetrievalPlan, SubqueryGroup, ToolPlan,
    ToolResult, ValidationResult,
};
use crate::profile::AgentProfile;

pub const DEFAULT_MAX_STEPS: u32 = 4;
pub const DEFAULT_MAX_REFLECTIONS: u32 = 2;
pub const MAX_PLAN_ATTEMPTS: u32 = 3;
pub const HARD_MAX_STEPS: u32 = 12;
pub const HARD_MAX_REFLECTIONS: u32 = 6;
pub const ANSWER_PREVIEW_LIMIT: usize = 180;
pub const RETRY_REASON_LIMIT: usize = 120;
/// Per-scalar clip applied to audited tool payloads.
pub const SANITIZE_LIMIT: usize = 280;

/// Where the graph goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NextAction {
    ExecuteTool,
    #[default]
    Generate,
    Replan,
    Interrupt,
}

/// The graph's shared record for one query.
#[derive(Clone)]
pub struct FlowState {
    pub user_query: String,
    /// Mutable across replans; only ever reset to `user_query`.
    pub working_query: String,
    pub ctx: RequestContext,
    pub scope_label: String,
    pub profile: Arc<AgentProfile>,
    pub intent: Option<QueryIntent>,
    pub retrieval_plan: Option<RetrievalPlan>,
    pub tool_plan: Option<ToolPlan>,
    pub allowed_tools: Vec<String>,
    pub tool_cursor: usize,
    pub tool_results: Vec<ToolResult>,
    pub plan_attempts: u32,
    pub reflections: u32,
    pub max_steps: u32,
    pub max_reflections: u32,
    pub chunks: Vec<EvidenceItem>,
    pub summaries: Vec<EvidenceItem>,
    pub subquery_groups: Vec<SubqueryGroup>,
    pub partial_answers: Vec<PartialAnswer>,
    /// Keyed by tool name; also carries `last_replan_reason`.
    pub working_memory: Map<String, Value>,
    pub retrieval: Option<RetrievalDiagnostics>,
    pub generation: Option<AnswerDraft>,
    pub validation: Option<ValidationResult>,
    pub reasoning_steps: Vec<ReasoningStep>,
    pub stage_timings_ms: BTreeMap<String, f64>,
    pub tool_timings_ms: BTreeMap<String, f64>,
    pub flow_started: Instant,
    /// Absolute wall-clock deadline for the whole flow.
    pub deadline: Instant,
    pub next_action: NextAction,
    pub stop_reason: String,
    pub clarification_request: Option<ClarificationRequest>,
    pub clarification_context: Option<ClarificationContext>,
    pub interaction_interruptions: u32,
    pub interaction_level: String,
    pub interaction_metrics: Map<String, Value>,
    /// Filters normalized by upstream scope validation.
    pub validated_filters: Option<Value>,
    /// Scope-validation payload embedded in diagnostics.
    pub scope_payload: Value,
}

impl FlowState {
    pub fn new(
        user_query: impl Into<String>,
        ctx: RequestContext,
        profile: Arc<AgentProfile>,
        total_budget: Duration,
    ) -> Self {
        let user_query = user_query.into();
        let now = Instant::now();
        Self {
            working_query: user_query.clone(),
            user_query,
            ctx,
            scope_label: String::new(),
            profile,
            intent: None,
            retrieval_plan: None,
            tool_plan: None,
            allowed_tools: Vec::new(),
            tool_cursor: 0,
            tool_results: Vec::new(),
            plan_attempts: 1,
            reflections: 0,
            max_steps: DEFAULT_MAX_STEPS,
            max_reflections: DEFAULT_MAX_REFLECTIONS,
            chunks: Vec::new(),
            summaries: Vec::new(),
            subquery_groups: Vec::new(),
            partial_answers: Vec::new(),
            working_memory: Map::new(),
            retrieval: None,
            generation: None,
            validation: None,
            reasoning_steps: Vec::new(),
            stage_timings_ms: BTreeMap::new(),
            tool_timings_ms: BTreeMap::new(),
            flow_started: now,
            deadline: now + total_budget,
            next_action: NextAction::Generate,
            stop_reason: String::new(),
            clarification_request: None,
            clarification_context: None,
            interaction_interruptions: 0,
            interaction_level: "L1".to_string(),
            interaction_metrics: Map::new(),
            validated_filters: None,
            scope_payload: Value::Null,
        }
    }

    /// Index for the next appended reasoning step.
    pub fn next_step_index(&self) -> usize {
        self.reasoning_steps.len() + 1
    }

    /// Remaining wall-clock budget.
    pub fn remaining_budget(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the total budget is exhausted (with headroom to spare).
    pub fn budget_exhausted(&self, headroom: Duration) -> bool {
        self.remaining_budget() <= headroom
    }

    /// Stage deadline: the stage default shrunk to fit the remaining total
    /// budget minus tail headroom. Never below 25 ms.
    pub fn adaptive_timeout(&self, stage_default_ms: u64, headroom_ms: u64) -> Duration {
        let remaining = self.remaining_budget().as_millis() as u64;
        let budget = remaining.saturating_sub(headroom_ms);
        Duration::from_millis(stage_default_ms.min(budget).max(25))
    }

    /// Merge a node's delta into the state.
    pub fn apply(&mut self, delta: StateDelta) {
        if let Some(intent) = delta.intent {
            self.intent = Some(intent);
        }
        if let Some(plan) = delta.retrieval_plan {
            self.retrieval_plan = Some(plan);
        }
        if let Some(plan) = delta.tool_plan {
            self.tool_plan = Some(plan);
        }
        if let Some(tools) = delta.allowed_tools {
            self.allowed_tools = tools;
        }
        if let Some(query) = delta.working_query {
            self.working_query = query;
        }
        if let Some(cursor) = delta.tool_cursor {
            self.tool_cursor = cursor;
        }
        if delta.reset_tool_results {
            self.tool_results.clear();
        }
        self.tool_results.extend(delta.push_tool_results);
        if let Some(attempts) = delta.plan_attempts {
            self.plan_attempts = attempts;
        }
        if let Some(reflections) = delta.reflections {
            self.reflections = reflections;
        }
        if let Some(max_steps) = delta.max_steps {
            self.max_steps = max_steps;
        }
        if let Some(max_reflections) = delta.max_reflections {
            self.max_reflections = max_reflections;
        }
        self.chunks.extend(delta.append_chunks);
        self.summaries.extend(delta.append_summaries);
        self.subquery_groups.extend(delta.append_subquery_groups);
        if let Some(partials) = delta.partial_answers {
            self.partial_answers = partials;
        }
        if let Some(memory) = delta.working_memory {
            self.working_memory = memory;
        }
        if let Some(retrieval) = delta.retrieval {
            self.retrieval = Some(retrieval);
        }
        if let Some(generation) = delta.generation {
            self.generation = Some(generation);
        }
        if let Some(validation) = delta.validation {
            self.validation = Some(validation);
        }
        self.reasoning_steps.extend(delta.append_steps);
        for (stage, elapsed) in delta.stage_timings {
            let entry = self.stage_timings_ms.entry(stage).or_insert(0.0);
            *entry += elapsed.max(0.0);
        }
        for (tool, elapsed) in delta.tool_timings {
            let entry = self.tool_timings_ms.entry(tool).or_insert(0.0);
            *entry += elapsed.max(0.0);
        }
        if let Some(action) = delta.next_action {
            self.next_action = action;
        }
        if let Some(stop_reason) = delta.stop_reason {
            if !stop_reason.is_empty() {
                self.stop_reason = stop_reason;
            }
        }
        if let Some(clarification) = delta.clarification_request {
            self.clarification_request = Some(clarification);
        }
        if let Some(count) = delta.interaction_interruptions {
            self.interaction_interruptions = count;
        }
        if let Some(level) = delta.interaction_level {
            self.interaction_level = level;
        }
        if let Some(metrics) = delta.interaction_metrics {
            self.interaction_metrics = metrics;
        }
    }
}

/// A node's contribution to the state.
#[derive(Debug, Default)]
pub struct StateDelta {
    pub intent: Option<QueryIntent>,
    pub retrieval_plan: Option<RetrievalPlan>,
    pub tool_plan: Option<ToolPlan>,
    pub allowed_tools: Option<Vec<String>>,
    pub working_query: Option<String>,
    pub tool_cursor: Option<usize>,
    pub reset_tool_results: bool,
    pub push_tool_results: Vec<ToolResult>,
    pub plan_attempts: Option<u32>,
    pub reflections: Option<u32>,
    pub max_steps: Option<u32>,
    pub max_reflections: Option<u32>,
    pub append_chunks: Vec<EvidenceItem>,
    pub append_summaries: Vec<EvidenceItem>,
    pub append_subquery_groups: Vec<SubqueryGroup>,
    pub partial_answers: Option<Vec<PartialAnswer>>,
    pub working_memory: Option<Map<String, Value>>,
    pub retrieval: Option<RetrievalDiagnostics>,
    pub generation: Option<AnswerDraft>,
    pub validation: Option<ValidationResult>,
    pub append_steps: Vec<ReasoningStep>,
    pub stage_timings: BTreeMap<String, f64>,
    pub tool_timings: BTreeMap<String, f64>,
    pub next_action: Option<NextAction>,
    pub stop_reason: Option<String>,
    pub clarification_request: Option<ClarificationRequest>,
    pub interaction_interruptions: Option<u32>,
    pub interaction_level: Option<String>,
    pub interaction_metrics: Option<Map<String, Value>>,
}

impl StateDelta {
    pub fn with_stage_timing(mut self, stage: &str, elapsed: Duration) -> Self {
        self.stage_timings
            .insert(stage.to_string(), elapsed.as_secs_f64() * 1000.0);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StepType;
    use pretty_assertions::assert_eq;

    fn state() -> FlowState {
        FlowState::new(
            "query",
            RequestContext::new("acme"),
            Arc::new(AgentProfile::default()),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn test_apply_appends_lists_and_overwrites_scalars() {
        let mut state = state();
        state.apply(StateDelta {
            append_chunks: vec![EvidenceItem::new("C1", "a", 0.9)],
            tool_cursor: Some(1),
            append_steps: vec![ReasoningStep::new(1, StepType::Plan, "plan")],
            ..Default::default()
        });
        state.apply(StateDelta {
            append_chunks: vec![EvidenceItem::new("C2", "b", 0.8)],
            append_steps: vec![ReasoningStep::new(2, StepType::Tool, "tool")],
            ..Default::default()
        });
        assert_eq!(state.chunks.len(), 2);
        assert_eq!(state.tool_cursor, 1);
        let indices: Vec<usize> = state.reasoning_steps.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![1, 2]);
    }

    #[test]
    fn test_timings_union_adds() {
        let mut state = state();
        let mut delta = StateDelta::default();
        delta.stage_timings.insert("planner".to_string(), 10.0);
        state.apply(delta);
        let mut delta = StateDelta::default();
        delta.stage_timings.insert("planner".to_string(), 5.0);
        state.apply(delta);
        assert_eq!(state.stage_timings_ms.get("planner"), Some(&15.0));
    }

    #[test]
    fn test_empty_stop_reason_never_overwrites() {
        let mut state = state();
        state.apply(StateDelta {
            stop_reason: Some("done".to_string()),
            ..Default::default()
        });
        state.apply(StateDelta {
            stop_reason: Some(String::new()),
            ..Default::default()
        });
        assert_eq!(state.stop_reason, "done");
    }

    #[test]
    fn test_adaptive_timeout_shrinks_to_budget() {
        let mut state = state();
        state.deadline = Instant::now() + Duration::from_millis(500);
        let timeout = state.adaptive_timeout(30_000, 200);
        assert!(timeout <= Duration::from_millis(300));
        assert!(timeout >= Duration::from_millis(25));
    }
}
