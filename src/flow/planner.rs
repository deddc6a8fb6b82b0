//! Planner node: intent classification, retrieval plan, tool plan, and the
//! interaction decision.

use std::time::{Duration, Instant};

use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::codes::STOP_PLANNER_TIMEOUT;
use crate::llm::{ChatMessage, CompletionRequest};
use crate::model::{
    ClarificationKind, ClarificationRequest, QueryIntent, ReasoningStep, RetrievalPlan, StepType,
    ToolCall, ToolPlan,
};
use crate::profile::AgentProfile;
use crate::router::{
    classify_intent, extract_requested_scopes, is_complex_query, looks_like_scope_phrase,
    matches_profile_patterns,
};

use super::interaction::{decide_interaction, InteractionDecision};
use super::state::{FlowState, NextAction, StateDelta, HARD_MAX_REFLECTIONS, HARD_MAX_STEPS};
use super::FlowComponents;

/// Classification confidence below which an unanchored query may trigger a
/// clarification once retrieval has already come back empty.
const LOW_CONFIDENCE_THRESHOLD: f64 = 0.55;
const CLARIFIER_TIMEOUT: Duration = Duration::from_millis(800);

fn arithmetic_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\d+\s*[\+\-\*/]\s*\d+").unwrap()
    })
}

/// Default input payload for a planned tool.
pub fn default_tool_input(tool: &str, query: &str, mode: &str) -> Map<String, Value> {
    let mut input = Map::new();
    match tool {
        "semantic_retrieval" => {
            input.insert("query".to_string(), json!(query));
        }
        "expectation_coverage" => {
            input.insert("mode".to_string(), json!(mode));
        }
        _ => {}
    }
    input
}

/// Retrieval plan for the classified mode, via the profile's mode table.
pub fn build_retrieval_plan(
    intent: &QueryIntent,
    query: &str,
    profile: &AgentProfile,
) -> RetrievalPlan {
    let requested_standards = extract_requested_scopes(query, profile);
    let mode_name = intent.mode.trim();

    if let Some(mode_cfg) = profile.mode_config(mode_name) {
        let retrieval_key = mode_cfg
            .retrieval_profile
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .unwrap_or(mode_name);
        if let Some(retrieval_cfg) = profile.retrieval.by_mode.get(retrieval_key) {
            return RetrievalPlan {
                mode: mode_name.to_string(),
                chunk_k: retrieval_cfg.chunk_k,
                chunk_fetch_k: retrieval_cfg.chunk_fetch_k,
                summary_k: retrieval_cfg.summary_k,
                require_literal_evidence: mode_cfg.require_literal_evidence,
                allow_inference: mode_cfg.allow_inference,
                response_contract: mode_cfg
                    .response_contract
                    .as_deref()
                    .map(str::trim)
                    .filter(|contract| !contract.is_empty())
                    .map(str::to_string),
                requested_standards,
            };
        }
        let mut plan = RetrievalPlan::generic(mode_name, requested_standards);
        plan.require_literal_evidence = mode_cfg.require_literal_evidence;
        plan.allow_inference = mode_cfg.allow_inference;
        plan.response_contract = mode_cfg
            .response_contract
            .as_deref()
            .map(str::trim)
            .filter(|contract| !contract.is_empty())
            .map(str::to_string);
        return plan;
    }

    if let Some(retrieval_cfg) = profile.retrieval.by_mode.get(mode_name) {
        return RetrievalPlan {
            mode: mode_name.to_string(),
            chunk_k: retrieval_cfg.chunk_k,
            chunk_fetch_k: retrieval_cfg.chunk_fetch_k,
            summary_k: retrieval_cfg.summary_k,
            require_literal_evidence: retrieval_cfg.require_literal_evidence,
            allow_inference: !retrieval_cfg.require_literal_evidence,
            response_contract: None,
            requested_standards,
        };
    }

    RetrievalPlan::generic(mode_name, requested_standards)
}

/// Build the ordered tool plan: the mode's execution plan filtered to
/// allowed tools, falling back to plain retrieval, plus heuristic additions.
pub fn build_tool_plan(
    query: &str,
    intent: &QueryIntent,
    profile: &AgentProfile,
    allowed_tools: &[String],
) -> ToolPlan {
    let complexity = if is_complex_query(query, profile) {
        "complex"
    } else {
        "simple"
    };
    let mode_cfg = profile.mode_config(&intent.mode);
    let mode_tool_hints: Vec<String> = mode_cfg
        .map(|cfg| cfg.tool_hints.clone())
        .unwrap_or_default();
    let execution_plan: Vec<String> = mode_cfg
        .map(|cfg| {
            cfg.execution_plan
                .iter()
                .map(|tool| tool.trim().to_string())
                .filter(|tool| !tool.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let mut steps: Vec<ToolCall> = Vec::new();
    let mut push_unique = |tool: &str, rationale: &str, steps: &mut Vec<ToolCall>| {
        if !allowed_tools.iter().any(|allowed| allowed == tool) {
            return;
        }
        if steps.iter().any(|step| step.tool == tool) {
            return;
        }
        steps.push(ToolCall::new(
            tool,
            default_tool_input(tool, query, &intent.mode),
            rationale,
        ));
    };

    for tool in &execution_plan {
        push_unique(tool, "mode_execution_plan", &mut steps);
    }
    if steps.is_empty() {
        push_unique("semantic_retrieval", "retrieve_grounding", &mut steps);
    }
    if complexity == "complex" && mode_tool_hints.iter().any(|hint| hint == "logical_comparison") {
        push_unique("logical_comparison", "cross_scope_relation", &mut steps);
    }
    if matches_profile_patterns(query, &profile.router.extraction_patterns) {
        push_unique("structural_extraction", "extract_structured_data", &mut steps);
    }
    let needs_calculation = arithmetic_pattern().is_match(query)
        || matches_profile_patterns(query, &profile.router.calculation_patterns);
    if needs_calculation {
        push_unique("python_calculator", "deterministic_numeric_check", &mut steps);
    }
    if steps.is_empty() {
        push_unique("semantic_retrieval", "default_retrieval", &mut steps);
    }

    ToolPlan {
        goal: query.to_string(),
        steps,
        complexity: complexity.to_string(),
    }
}

/// Parse scope labels out of a clarification answer.
fn scopes_from_answer(answer: &str, profile: &AgentProfile) -> Vec<String> {
    let mut scopes = extract_requested_scopes(answer, profile);
    if scopes.is_empty() {
        for part in answer.split(',') {
            let candidate = part.trim();
            if looks_like_scope_phrase(candidate) {
                let value = candidate.to_uppercase();
                if !scopes.contains(&value) {
                    scopes.push(value);
                }
            }
        }
    }
    scopes
}

async fn refine_clarification_with_llm(
    components: &FlowComponents,
    query: &str,
    decision: &InteractionDecision,
    metrics: &mut Map<String, Value>,
) -> (String, Vec<String>) {
    let mut question = decision.question.clone();
    let mut options = decision.options.clone();
    metrics
        .entry("clarification_model_used".to_string())
        .or_insert(json!("heuristic"));
    metrics
        .entry("clarification_confidence".to_string())
        .or_insert(json!(0.0));
    metrics
        .entry("clarification_expected_answer".to_string())
        .or_insert(json!(""));

    let Some(clarifier) = &components.clarifier else {
        return (question, options);
    };
    // Guided reprompts are the anti-loop path; never rewrite those.
    if metrics.get("guided_reprompt").and_then(Value::as_bool) == Some(true) {
        return (question, options);
    }

    let request = CompletionRequest::new(vec![
        ChatMessage::system(
            "Eres un asistente que formula preguntas de aclaracion breves. Devuelve solo JSON \
             con {\"question\": str, \"options\": [str], \"expected_answer\": str, \
             \"confidence\": float}.",
        ),
        ChatMessage::user(format!(
            "Consulta original: {query}\nPregunta actual: {question}\nOpciones: {}\nSlots \
             faltantes: {}",
            options.join(", "),
            decision.missing_slots.join(", ")
        )),
    ])
    .with_temperature(0.0)
    .json_object();

    match tokio::time::timeout(CLARIFIER_TIMEOUT, clarifier.complete(request)).await {
        Ok(Ok(completion)) => {
            if let Ok(payload) = serde_json::from_str::<Value>(completion.content.trim()) {
                if let Some(text) = payload.get("question").and_then(Value::as_str) {
                    if !text.trim().is_empty() {
                        question = text.trim().to_string();
                    }
                }
                if let Some(values) = payload.get("options").and_then(Value::as_array) {
                    let parsed: Vec<String> = values
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::trim)
                        .filter(|value| !value.is_empty())
                        .map(str::to_string)
                        .collect();
                    if !parsed.is_empty() {
                        options = parsed;
                    }
                }
                metrics.insert(
                    "clarification_expected_answer".to_string(),
                    json!(payload
                        .get("expected_answer")
                        .and_then(Value::as_str)
                        .unwrap_or("")),
                );
                metrics.insert(
                    "clarification_confidence".to_string(),
                    json!(payload
                        .get("confidence")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0)),
                );
                metrics.insert("clarification_model_used".to_string(), json!(completion.model));
            }
        }
        Ok(Err(error)) => warn!(error = %error, "clarification_llm_failed"),
        Err(_) => warn!("clarification_llm_timeout"),
    }
    (question, options)
}

async fn rewrite_plan_with_feedback(
    components: &FlowComponents,
    feedback: &str,
    query: &str,
    mode: &str,
    plan: &ToolPlan,
    allowed_tools: &[String],
) -> Option<Vec<ToolCall>> {
    let clarifier = components.clarifier.as_ref()?;
    let current: Vec<&str> = plan.steps.iter().map(|step| step.tool.as_str()).collect();
    let request = CompletionRequest::new(vec![
        ChatMessage::system(
            "Reordena un plan de herramientas segun feedback del usuario. Devuelve solo JSON \
             con {\"new_plan\": [nombres de herramienta]}.",
        ),
        ChatMessage::user(format!(
            "Plan actual: {}\nHerramientas permitidas: {}\nFeedback: {}",
            current.join(", "),
            allowed_tools.join(", "),
            feedback.replace('_', " ")
        )),
    ])
    .with_temperature(0.0)
    .json_object();

    let completion = tokio::time::timeout(CLARIFIER_TIMEOUT, clarifier.complete(request))
        .await
        .ok()?
        .ok()?;
    let payload: Value = serde_json::from_str(completion.content.trim()).ok()?;
    let tools = payload.get("new_plan")?.as_array()?;
    let steps: Vec<ToolCall> = tools
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|tool| allowed_tools.iter().any(|allowed| allowed == tool))
        .map(|tool| {
            ToolCall::new(
                tool,
                default_tool_input(tool, query, mode),
                "user_feedback_override",
            )
        })
        .collect();
    (!steps.is_empty()).then_some(steps)
}

/// The planner node.
pub async fn planner_node(state: &FlowState, components: &FlowComponents) -> StateDelta {
    let started = Instant::now();
    let query = if state.working_query.trim().is_empty() {
        state.user_query.trim().to_string()
    } else {
        state.working_query.trim().to_string()
    };
    let profile = state.profile.as_ref();
    let allowed_tools = components.tools.resolve_allowed(profile);

    let base_planner_ms = components.config.stage_timeouts.classify_ms
        + components.config.stage_timeouts.plan_ms;
    let planner_budget = state.adaptive_timeout(base_planner_ms, 3_000);
    if planner_budget <= Duration::from_millis(25) {
        return StateDelta {
            next_action: Some(NextAction::Generate),
            stop_reason: Some(STOP_PLANNER_TIMEOUT.to_string()),
            ..Default::default()
        }
        .with_stage_timing("planner", started.elapsed());
    }

    let (intent, classification) = classify_intent(&query, profile);
    let mut retrieval_plan = build_retrieval_plan(&intent, &query, profile);
    let max_steps = profile.max_steps(HARD_MAX_STEPS).max(1);
    let max_reflections = profile.max_reflections(HARD_MAX_REFLECTIONS);
    let mut tool_plan = build_tool_plan(&query, &intent, profile, &allowed_tools);
    tool_plan.steps.truncate(max_steps as usize);

    debug!(
        mode = %intent.mode,
        confidence = classification.confidence,
        tools = tool_plan.steps.len(),
        "planner_decision"
    );

    // Slot values extracted from a prior clarification answer.
    let mut clarification_context = state.clarification_context.clone();
    if let Some(context) = clarification_context.as_mut() {
        if context.requested_scopes.is_empty() {
            if let Some(answer) = context.answer_text.as_deref() {
                if context.missing_slots.iter().any(|slot| slot == "scope") {
                    context.requested_scopes = scopes_from_answer(answer, profile);
                }
            }
        }
    }

    let interaction = decide_interaction(
        &query,
        &intent,
        &retrieval_plan,
        &tool_plan,
        profile,
        state.interaction_interruptions,
        clarification_context.as_ref(),
    );

    if let Some(context) = &clarification_context {
        for scope in &context.requested_scopes {
            if !retrieval_plan.requested_standards.contains(scope) {
                retrieval_plan.requested_standards.push(scope.clone());
            }
        }
        if let Some(feedback) = context
            .plan_feedback
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
        {
            if state.interaction_interruptions > 0 {
                if let Some(steps) = rewrite_plan_with_feedback(
                    components,
                    feedback,
                    &query,
                    &intent.mode,
                    &tool_plan,
                    &allowed_tools,
                )
                .await
                {
                    tool_plan.steps = steps;
                }
            }
        }
    }

    let mut plan_step = ReasoningStep::new(
        state.next_step_index(),
        StepType::Plan,
        "universal_plan_generated",
    );
    let mut plan_output = Map::new();
    plan_output.insert("intent_mode".to_string(), json!(intent.mode));
    plan_output.insert("confidence".to_string(), json!(classification.confidence));
    plan_output.insert("complexity".to_string(), json!(tool_plan.complexity));
    plan_output.insert(
        "tool_sequence".to_string(),
        json!(tool_plan
            .steps
            .iter()
            .map(|step| step.tool.clone())
            .collect::<Vec<_>>()),
    );
    plan_step = plan_step.with_output(plan_output);

    let mut delta = StateDelta {
        intent: Some(intent.clone()),
        retrieval_plan: Some(retrieval_plan),
        tool_plan: Some(tool_plan.clone()),
        allowed_tools: Some(allowed_tools),
        max_steps: Some(max_steps),
        max_reflections: Some(max_reflections),
        tool_cursor: Some(0),
        reset_tool_results: true,
        append_steps: vec![plan_step],
        next_action: Some(if tool_plan.steps.is_empty() {
            NextAction::Generate
        } else {
            NextAction::ExecuteTool
        }),
        interaction_level: Some(interaction.level.clone()),
        interaction_metrics: Some(interaction.metrics.clone()),
        interaction_interruptions: Some(state.interaction_interruptions),
        ..Default::default()
    };

    // Low-confidence clarification once retrieval already came back empty.
    let empty_retry = state
        .working_memory
        .get("last_replan_reason")
        .and_then(Value::as_str)
        == Some(crate::codes::RETRIEVAL_EMPTY);
    let low_confidence_interrupt = !interaction.needs_interrupt
        && classification.confidence < LOW_CONFIDENCE_THRESHOLD
        && empty_retry
        && state.interaction_interruptions < profile.interaction_policy.max_interruptions_per_turn
        && profile.interaction_policy.enabled;

    let effective = if low_confidence_interrupt {
        let mut metrics = interaction.metrics.clone();
        metrics.insert("low_confidence".to_string(), json!(true));
        let options: Vec<String> = profile.query_modes.modes.keys().cloned().collect();
        InteractionDecision {
            level: "L2".to_string(),
            needs_interrupt: true,
            kind: Some(ClarificationKind::Clarification),
            question: "No encontre evidencia con esa formulacion. ¿Puedes precisar que \
                       necesitas (por ejemplo el modo de consulta o la norma exacta)?"
                .to_string(),
            options,
            metrics,
            missing_slots: vec!["objective".to_string()],
            scope_candidates: interaction.scope_candidates.clone(),
        }
    } else {
        interaction
    };

    if effective.needs_interrupt {
        let kind = effective.kind.unwrap_or(ClarificationKind::Clarification);
        let mut metrics = effective.metrics.clone();
        let (question, options) = if kind == ClarificationKind::Clarification {
            refine_clarification_with_llm(components, &query, &effective, &mut metrics).await
        } else {
            (effective.question.clone(), effective.options.clone())
        };
        let expected_answer = metrics
            .get("clarification_expected_answer")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let mut interrupt_step = ReasoningStep::new(
            state.next_step_index() + 1,
            StepType::Plan,
            "interaction_interrupt",
        );
        let mut interrupt_output = Map::new();
        interrupt_output.insert("level".to_string(), json!(effective.level));
        interrupt_output.insert("kind".to_string(), json!(kind.to_string()));
        interrupt_step = interrupt_step.with_output(interrupt_output);

        delta.next_action = Some(NextAction::Interrupt);
        delta.stop_reason = Some(format!("awaiting_{kind}"));
        delta.clarification_request = Some(ClarificationRequest {
            kind,
            level: effective.level.clone(),
            question,
            options,
            missing_slots: effective.missing_slots.clone(),
            expected_answer,
        });
        delta.interaction_interruptions = Some(state.interaction_interruptions + 1);
        delta.interaction_metrics = Some(metrics);
        delta.append_steps.push(interrupt_step);
    }

    delta.with_stage_timing("planner", started.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_tool_plan_defaults_to_retrieval() {
        let profile = AgentProfile::default();
        let intent = QueryIntent::new("explicativa", "r");
        let plan = build_tool_plan(
            "que exige 9.1",
            &intent,
            &profile,
            &["semantic_retrieval".to_string()],
        );
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].tool, "semantic_retrieval");
    }

    #[test]
    fn test_tool_plan_follows_mode_execution_plan_order() {
        let mut profile = AgentProfile::default();
        let mode = crate::profile::QueryModeConfig {
            execution_plan: vec![
                "semantic_retrieval".to_string(),
                "python_calculator".to_string(),
                "semantic_retrieval".to_string(),
            ],
            ..Default::default()
        };
        profile.query_modes.modes.insert("calculada".to_string(), mode);
        let intent = QueryIntent::new("calculada", "r");
        let allowed = vec![
            "semantic_retrieval".to_string(),
            "python_calculator".to_string(),
        ];
        let plan = build_tool_plan("Calcula 5*(20+2) con 9.1", &intent, &profile, &allowed);
        let tools: Vec<&str> = plan.steps.iter().map(|step| step.tool.as_str()).collect();
        assert_eq!(tools, vec!["semantic_retrieval", "python_calculator"]);
    }

    #[test]
    fn test_tool_plan_adds_calculator_for_arithmetic() {
        let profile = AgentProfile::default();
        let intent = QueryIntent::new("explicativa", "r");
        let allowed = vec![
            "semantic_retrieval".to_string(),
            "python_calculator".to_string(),
        ];
        let plan = build_tool_plan(
            "Calcula 5*(20+2) con los límites del 9.1",
            &intent,
            &profile,
            &allowed,
        );
        let tools: Vec<&str> = plan.steps.iter().map(|step| step.tool.as_str()).collect();
        assert_eq!(tools, vec!["semantic_retrieval", "python_calculator"]);
    }

    #[test]
    fn test_allowed_tool_filter_never_removes_existing_choices() {
        let profile = AgentProfile::default();
        let intent = QueryIntent::new("explicativa", "r");
        let narrow = build_tool_plan(
            "Calcula 2+2",
            &intent,
            &profile,
            &["semantic_retrieval".to_string()],
        );
        let wide = build_tool_plan(
            "Calcula 2+2",
            &intent,
            &profile,
            &[
                "semantic_retrieval".to_string(),
                "python_calculator".to_string(),
            ],
        );
        let narrow_tools: Vec<&str> =
            narrow.steps.iter().map(|step| step.tool.as_str()).collect();
        let wide_tools: Vec<&str> = wide.steps.iter().map(|step| step.tool.as_str()).collect();
        for tool in &narrow_tools {
            assert!(wide_tools.contains(tool));
        }
    }

    #[test]
    fn test_retrieval_plan_uses_mode_profile() {
        let mut profile = AgentProfile::default();
        let mode = crate::profile::QueryModeConfig {
            retrieval_profile: Some("literal_normativa".to_string()),
            require_literal_evidence: true,
            ..Default::default()
        };
        profile
            .query_modes
            .modes
            .insert("literal_normativa".to_string(), mode);
        let intent = QueryIntent::new("literal_normativa", "r");
        let plan =
            build_retrieval_plan(&intent, "Que exige la cláusula 9.1 de ISO 9001?", &profile);
        assert_eq!(plan.chunk_k, 45);
        assert!(plan.require_literal_evidence);
        assert_eq!(plan.requested_standards, vec!["ISO 9001".to_string()]);
    }

    #[test]
    fn test_retrieval_plan_generic_fallback() {
        let profile = AgentProfile {
            retrieval: crate::profile::RetrievalPolicy {
                by_mode: Default::default(),
                ..Default::default()
            },
            ..Default::default()
        };
        let intent = QueryIntent::new("desconocido", "r");
        let plan = build_retrieval_plan(&intent, "algo", &profile);
        assert_eq!(plan.chunk_k, 30);
        assert_eq!(plan.chunk_fetch_k, 120);
        assert_eq!(plan.summary_k, 5);
    }

    #[test]
    fn test_scopes_from_answer_parses_comma_list() {
        let profile = AgentProfile::default();
        let scopes = scopes_from_answer("ISO 9001, ISO 14001", &profile);
        assert_eq!(scopes, vec!["ISO 9001".to_string(), "ISO 14001".to_string()]);
    }
}
