//! Interaction policy: when the planner interrupts with a clarification or
//! plan-approval request instead of executing.

use serde_json::{json, Map, Value};

use crate::model::{
    ClarificationContext, ClarificationKind, QueryIntent, RetrievalPlan, ToolPlan,
};
use crate::profile::AgentProfile;
use crate::router::{detect_scope_candidates, looks_like_scope_phrase, vague_goal_signal};

/// Outcome of the interaction decision.
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionDecision {
    /// "L1" (none), "L2" (clarification), or "L3" (plan approval).
    pub level: String,
    pub needs_interrupt: bool,
    pub kind: Option<ClarificationKind>,
    pub question: String,
    pub options: Vec<String>,
    pub metrics: Map<String, Value>,
    pub missing_slots: Vec<String>,
    pub scope_candidates: Vec<String>,
}

impl InteractionDecision {
    fn none() -> Self {
        Self {
            level: "L1".to_string(),
            needs_interrupt: false,
            kind: None,
            question: String::new(),
            options: Vec::new(),
            metrics: Map::new(),
            missing_slots: Vec::new(),
            scope_candidates: Vec::new(),
        }
    }
}

fn display_name(tool: &str) -> &str {
    match tool {
        "semantic_retrieval" => "Buscar contexto normativo",
        "logical_comparison" => "Analizar cruces y vacios logicos",
        "structural_extraction" => "Extraer y estructurar datos",
        "python_calculator" => "Ejecutar calculos matematicos",
        "expectation_coverage" => "Verificar cobertura de expectativas",
        "citation_validator" => "Validar citas contra la fuente",
        other => other,
    }
}

/// Consolidated plan preview for the L3 approval question.
fn plan_preview(tool_plan: &ToolPlan) -> String {
    let mut consolidated: Vec<(String, usize)> = Vec::new();
    for step in &tool_plan.steps {
        let name = display_name(&step.tool).to_string();
        match consolidated.last_mut() {
            Some((last, count)) if *last == name => *count += 1,
            _ => consolidated.push((name, 1)),
        }
    }
    let steps: Vec<String> = consolidated
        .iter()
        .take(4)
        .enumerate()
        .map(|(index, (name, count))| {
            if *count > 1 {
                format!("{}) {name} ({count}x paralelizado)", index + 1)
            } else {
                format!("{}) {name}", index + 1)
            }
        })
        .collect();
    if steps.is_empty() {
        "1) Buscar contexto normativo".to_string()
    } else {
        steps.join(" -> ")
    }
}

fn estimate_subqueries(profile: &AgentProfile, mode: &str, scope_count_requested: usize) -> usize {
    let Some(mode_cfg) = profile.mode_config(mode) else {
        return scope_count_requested.max(1);
    };
    let max_subqueries = mode_cfg.decomposition_policy.max_subqueries.max(1);
    if scope_count_requested >= 2 {
        return (scope_count_requested + 1).min(max_subqueries).max(2);
    }
    max_subqueries.min(if max_subqueries >= 2 { 2 } else { 1 }).max(1)
}

/// Decide whether to interrupt, and with what question.
pub fn decide_interaction(
    query: &str,
    intent: &QueryIntent,
    retrieval_plan: &RetrievalPlan,
    tool_plan: &ToolPlan,
    profile: &AgentProfile,
    prior_interruptions: u32,
    context: Option<&ClarificationContext>,
) -> InteractionDecision {
    if !profile.interaction_policy.enabled {
        return InteractionDecision::none();
    }
    let policy = &profile.interaction_policy;
    let thresholds = &policy.thresholds;
    let mode_policy = profile.mode_interaction(&intent.mode);

    let context_scopes: Vec<String> = context
        .map(|ctx| {
            let mut ordered: Vec<String> = Vec::new();
            for scope in &ctx.requested_scopes {
                let value = scope.trim().to_uppercase();
                if !value.is_empty() && !ordered.contains(&value) {
                    ordered.push(value);
                }
            }
            ordered
        })
        .unwrap_or_default();
    let requested_scopes: Vec<String> = if retrieval_plan.requested_standards.is_empty() {
        context_scopes.clone()
    } else {
        retrieval_plan.requested_standards.clone()
    };

    let mut scope_candidates: Vec<String> = Vec::new();
    for scope in context_scopes
        .iter()
        .cloned()
        .chain(detect_scope_candidates(query, profile))
    {
        let value = scope.trim().to_uppercase();
        if !value.is_empty() && !scope_candidates.contains(&value) {
            scope_candidates.push(value);
        }
    }

    let clarification_round = context.map(|ctx| ctx.round).unwrap_or(0);
    let clarification_choice = context
        .and_then(|ctx| ctx.selected_option.clone())
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    let clarification_confirmed = context
        .map(|ctx| ctx.confirmed || ctx.plan_approved)
        .unwrap_or(false);
    let clarification_text = context
        .and_then(|ctx| ctx.answer_text.clone())
        .unwrap_or_default();
    let has_user_feedback = context
        .map(|ctx| {
            ctx.plan_approved
                || ctx
                    .plan_feedback
                    .as_deref()
                    .map(|text| !text.trim().is_empty())
                    .unwrap_or(false)
        })
        .unwrap_or(false);

    let scope_count_requested = if scope_candidates.is_empty() {
        requested_scopes.len()
    } else {
        scope_candidates.len()
    };
    let scope_count_confirmed = requested_scopes.len();

    let objective_hint = context
        .and_then(|ctx| ctx.objective_hint.clone())
        .filter(|text| !text.trim().is_empty())
        .or_else(|| {
            (!clarification_text.trim().is_empty()
                && !looks_like_scope_phrase(&clarification_text))
            .then(|| clarification_text.trim().to_string())
        })
        .unwrap_or_default();

    let required_slots: Vec<String> = mode_policy
        .required_slots
        .iter()
        .map(|slot| slot.trim().to_lowercase())
        .filter(|slot| !slot.is_empty())
        .collect();
    let mut missing_slots: Vec<String> = Vec::new();
    if required_slots.contains(&"scope".to_string()) && scope_count_confirmed == 0 {
        missing_slots.push("scope".to_string());
    }
    if required_slots.contains(&"objective".to_string())
        && objective_hint.is_empty()
        && query.split_whitespace().count() < 8
    {
        missing_slots.push("objective".to_string());
    }

    let mut ambiguity_score: f64 = 0.0;
    if !missing_slots.is_empty() {
        ambiguity_score += 0.35;
    }
    if scope_count_requested >= 2 && scope_count_confirmed == 0 {
        ambiguity_score += 0.25;
    }
    if vague_goal_signal(query) {
        ambiguity_score += 0.1;
    }
    if query.to_lowercase().contains("iso") && scope_count_confirmed == 0 {
        ambiguity_score += 0.2;
    }
    ambiguity_score = ambiguity_score.clamp(0.0, 1.0);

    let estimated_subqueries = estimate_subqueries(profile, &intent.mode, scope_count_requested);
    let estimated_latency_s = ((3.2
        + estimated_subqueries as f64 * 1.6
        + tool_plan.steps.len() as f64 * 0.9)
        * 100.0)
        .round()
        / 100.0;
    let estimated_cost_tokens =
        900 + estimated_subqueries as u64 * 1_500 + tool_plan.steps.len() as u64 * 600;
    let coverage_confidence = (1.0
        - ambiguity_score * 0.55
        - if scope_count_requested >= 2 && scope_count_confirmed == 0 {
            0.25
        } else {
            0.0
        })
    .clamp(0.0, 1.0);

    let risk_level = {
        let raw = mode_policy.risk_level.trim().to_lowercase();
        if matches!(raw.as_str(), "low" | "medium" | "high") {
            raw
        } else {
            "low".to_string()
        }
    };

    let needs_l2 = !missing_slots.is_empty()
        || (ambiguity_score >= thresholds.l2_ambiguity
            && scope_count_requested >= 1
            && scope_count_confirmed == 0);
    let needs_l3 = mode_policy.require_plan_approval
        || estimated_subqueries >= thresholds.l3_subqueries
        || estimated_latency_s >= thresholds.l3_latency_s
        || estimated_cost_tokens >= thresholds.l3_cost_tokens
        || (risk_level == "high" && ambiguity_score >= thresholds.l2_ambiguity);

    let mut metrics = Map::new();
    metrics.insert(
        "ambiguity_score".to_string(),
        json!((ambiguity_score * 10_000.0).round() / 10_000.0),
    );
    metrics.insert("scope_count_requested".to_string(), json!(scope_count_requested));
    metrics.insert("scope_count_confirmed".to_string(), json!(scope_count_confirmed));
    metrics.insert("missing_required_slots".to_string(), json!(missing_slots.len()));
    metrics.insert("estimated_subqueries".to_string(), json!(estimated_subqueries));
    metrics.insert("estimated_cost_tokens".to_string(), json!(estimated_cost_tokens));
    metrics.insert("estimated_latency_s".to_string(), json!(estimated_latency_s));
    metrics.insert("risk_level".to_string(), json!(risk_level));
    metrics.insert(
        "coverage_confidence".to_string(),
        json!((coverage_confidence * 10_000.0).round() / 10_000.0),
    );
    metrics.insert("clarification_round".to_string(), json!(clarification_round));
    metrics.insert("slots_filled".to_string(), json!(scope_count_confirmed));
    metrics.insert("loop_prevented".to_string(), json!(false));
    metrics.insert(
        "objective_hint_present".to_string(),
        json!(!objective_hint.is_empty()),
    );

    let mut decision = InteractionDecision {
        level: "L1".to_string(),
        needs_interrupt: false,
        kind: None,
        question: String::new(),
        options: Vec::new(),
        metrics,
        missing_slots: missing_slots.clone(),
        scope_candidates: scope_candidates.clone(),
    };

    if prior_interruptions >= policy.max_interruptions_per_turn {
        return decision;
    }
    if has_user_feedback {
        return decision;
    }
    if clarification_confirmed && !objective_hint.is_empty() && scope_count_confirmed == 0 {
        decision.metrics.insert("loop_prevented".to_string(), json!(true));
        decision
            .metrics
            .insert("proposal_confirmed_without_scope".to_string(), json!(true));
        return decision;
    }
    if clarification_round >= 2 && scope_count_confirmed == 0 {
        decision.metrics.insert("loop_prevented".to_string(), json!(true));
        return decision;
    }

    if needs_l3 {
        decision.level = "L3".to_string();
        decision.needs_interrupt = true;
        decision.kind = Some(ClarificationKind::PlanApproval);
        decision.question = format!(
            "Entiendo que requieres un analisis profundo. Plan propuesto: {}. \
             ¿Te parece bien este plan o quieres ajustarlo (ej: pedir enfoque en una tabla)?",
            plan_preview(tool_plan)
        );
        decision.options = vec![
            "si".to_string(),
            "ajustar".to_string(),
            "cambiar alcance".to_string(),
        ];
        return decision;
    }

    if needs_l2 {
        decision.level = "L2".to_string();
        decision.needs_interrupt = true;
        decision.kind = Some(ClarificationKind::Clarification);
        if matches!(
            clarification_choice.as_str(),
            "compare_multiple" | "comparar_multiples"
        ) && scope_count_confirmed == 0
        {
            let example = if scope_candidates.is_empty() {
                "alcance A, alcance B".to_string()
            } else {
                scope_candidates
                    .iter()
                    .take(2)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            decision.question = format!(
                "Perfecto, comparemos multiples alcances. \
                 Escribe los alcances exactos separados por coma (ej: {example})."
            );
            decision.options = if scope_candidates.is_empty() {
                vec!["Escribir alcances ahora".to_string()]
            } else {
                scope_candidates.iter().take(4).cloned().collect()
            };
            decision.metrics.insert("guided_reprompt".to_string(), json!(true));
        } else if scope_count_requested >= 2 && scope_count_confirmed == 0 && !scope_candidates.is_empty()
        {
            decision.options = scope_candidates.iter().take(4).cloned().collect();
            decision.question = format!(
                "Veo ambiguedad de alcance. ¿Quieres que responda para: {}?",
                decision.options.join(", ")
            );
        } else if !objective_hint.is_empty() {
            decision.question = format!(
                "Entendi que quieres avanzar con '{objective_hint}'. \
                 Propongo continuar con comparacion multialcance. ¿Confirmas? \
                 Si prefieres acotar, escribe normas exactas separadas por coma."
            );
            decision.options = vec!["si, continuar".to_string()];
            decision.metrics.insert("proposal_generated".to_string(), json!(true));
        } else {
            decision.question = "Necesito un dato concreto para responder con evidencia: \
                                 indica el alcance exacto que deseas analizar."
                .to_string();
            decision.options = scope_candidates.iter().take(4).cloned().collect();
        }
        return decision;
    }

    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ToolCall;
    use pretty_assertions::assert_eq;

    fn tool_plan(tools: &[&str]) -> ToolPlan {
        ToolPlan {
            goal: "q".to_string(),
            steps: tools
                .iter()
                .map(|tool| ToolCall::new(*tool, Map::new(), "r"))
                .collect(),
            complexity: "simple".to_string(),
        }
    }

    fn profile_requiring_scope(mode: &str) -> AgentProfile {
        let mut profile = AgentProfile::default();
        profile.query_modes.modes.insert(mode.to_string(), Default::default());
        profile.interaction_policy.mode_overrides.insert(
            mode.to_string(),
            crate::profile::ModeInteractionPolicy {
                required_slots: vec!["scope".to_string()],
                risk_level: "low".to_string(),
                require_plan_approval: false,
            },
        );
        profile
    }

    #[test]
    fn test_no_interrupt_when_policy_disabled() {
        let mut profile = AgentProfile::default();
        profile.interaction_policy.enabled = false;
        let decision = decide_interaction(
            "que dice eso",
            &QueryIntent::new("explicativa", "r"),
            &RetrievalPlan::generic("explicativa", vec![]),
            &tool_plan(&["semantic_retrieval"]),
            &profile,
            0,
            None,
        );
        assert!(!decision.needs_interrupt);
        assert_eq!(decision.level, "L1");
    }

    #[test]
    fn test_missing_scope_slot_triggers_l2() {
        let profile = profile_requiring_scope("explicativa");
        let decision = decide_interaction(
            "qué dice eso",
            &QueryIntent::new("explicativa", "r"),
            &RetrievalPlan::generic("explicativa", vec![]),
            &tool_plan(&["semantic_retrieval"]),
            &profile,
            0,
            None,
        );
        assert!(decision.needs_interrupt);
        assert_eq!(decision.level, "L2");
        assert_eq!(decision.kind, Some(ClarificationKind::Clarification));
        assert_eq!(decision.missing_slots, vec!["scope".to_string()]);
        assert!(!decision.question.is_empty());
    }

    #[test]
    fn test_plan_approval_when_mode_requires_it() {
        let mut profile = AgentProfile::default();
        profile.query_modes.modes.insert("comparativa".to_string(), Default::default());
        profile.interaction_policy.mode_overrides.insert(
            "comparativa".to_string(),
            crate::profile::ModeInteractionPolicy {
                required_slots: Vec::new(),
                risk_level: "low".to_string(),
                require_plan_approval: true,
            },
        );
        let decision = decide_interaction(
            "Compara ISO 9001 con ISO 14001",
            &QueryIntent::new("comparativa", "r"),
            &RetrievalPlan::generic(
                "comparativa",
                vec!["ISO 9001".to_string(), "ISO 14001".to_string()],
            ),
            &tool_plan(&["semantic_retrieval", "python_calculator"]),
            &profile,
            0,
            None,
        );
        assert!(decision.needs_interrupt);
        assert_eq!(decision.level, "L3");
        assert_eq!(decision.kind, Some(ClarificationKind::PlanApproval));
        assert!(decision.question.contains("Buscar contexto normativo"));
    }

    #[test]
    fn test_max_interruptions_respected() {
        let profile = profile_requiring_scope("explicativa");
        let decision = decide_interaction(
            "qué dice eso",
            &QueryIntent::new("explicativa", "r"),
            &RetrievalPlan::generic("explicativa", vec![]),
            &tool_plan(&["semantic_retrieval"]),
            &profile,
            1,
            None,
        );
        assert!(!decision.needs_interrupt);
    }

    #[test]
    fn test_loop_prevention_after_two_rounds() {
        let profile = profile_requiring_scope("explicativa");
        let context = ClarificationContext {
            round: 2,
            ..Default::default()
        };
        let decision = decide_interaction(
            "qué dice eso",
            &QueryIntent::new("explicativa", "r"),
            &RetrievalPlan::generic("explicativa", vec![]),
            &tool_plan(&["semantic_retrieval"]),
            &profile,
            0,
            Some(&context),
        );
        assert!(!decision.needs_interrupt);
        assert_eq!(decision.metrics["loop_prevented"], json!(true));
    }

    #[test]
    fn test_confirmed_scopes_do_not_interrupt() {
        let profile = profile_requiring_scope("explicativa");
        let decision = decide_interaction(
            "Que exige la cláusula 9.1 de ISO 9001?",
            &QueryIntent::new("explicativa", "r"),
            &RetrievalPlan::generic("explicativa", vec!["ISO 9001".to_string()]),
            &tool_plan(&["semantic_retrieval"]),
            &profile,
            0,
            None,
        );
        assert!(!decision.needs_interrupt);
    }
}
