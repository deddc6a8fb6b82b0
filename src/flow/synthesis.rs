//! Aggregation, generation, and validation nodes.

use std::time::Instant;

use futures::future::join_all;
use regex::Regex;
use serde_json::{json, Map};
use std::sync::OnceLock;
use tracing::{error, warn};

use crate::codes::{STOP_DONE, STOP_GENERATOR_TIMEOUT, STOP_MISSING_RETRIEVAL_PLAN, STOP_VALIDATION_FAILED};
use crate::generator::GenerationRequest;
use crate::model::{
    clip_text, EvidenceItem, PartialAnswer, PartialStatus, ReasoningStep, RetrievalPlan, StepType,
    SubqueryGroup, ValidationResult,
};

use super::state::{FlowState, StateDelta, ANSWER_PREVIEW_LIMIT};
use super::FlowComponents;

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"[a-zA-Z0-9áéíóúñÁÉÍÓÚÑ]{3,}").unwrap()
    })
}

fn keyword_overlap(query: &str, content: &str) -> usize {
    let query_tokens: Vec<String> = token_pattern()
        .find_iter(&query.to_lowercase())
        .map(|found| found.as_str().to_string())
        .collect();
    if query_tokens.is_empty() {
        return 0;
    }
    let content_lower = content.to_lowercase();
    let content_tokens: Vec<&str> = token_pattern()
        .find_iter(&content_lower)
        .map(|found| found.as_str())
        .collect();
    query_tokens
        .iter()
        .filter(|token| content_tokens.contains(&token.as_str()))
        .count()
}

fn snippet_summary(candidates: &[EvidenceItem]) -> String {
    let snippets: Vec<String> = candidates
        .iter()
        .take(2)
        .filter(|item| !item.content.trim().is_empty())
        .map(|item| format!("{}: {}", item.source, clip_text(&item.content, 220)))
        .collect();
    if snippets.is_empty() {
        "Evidencia recuperada.".to_string()
    } else {
        snippets.join(" | ")
    }
}

/// Map-reduce over subquery groups: pick top evidence per group and
/// summarize each concurrently, falling back to snippets on failure.
pub async fn aggregate_subqueries_node(
    state: &FlowState,
    components: &FlowComponents,
) -> StateDelta {
    let started = Instant::now();
    let mode_aggregation = state
        .retrieval_plan
        .as_ref()
        .and_then(|plan| state.profile.mode_config(&plan.mode))
        .map(|cfg| {
            cfg.decomposition_policy
                .subquery_aggregation_mode
                .trim()
                .to_lowercase()
        })
        .unwrap_or_default();
    let enabled =
        components.config.subquery_grouped_map_reduce || mode_aggregation == "grouped_map_reduce";
    if !enabled {
        return StateDelta::default().with_stage_timing("subquery_aggregate", started.elapsed());
    }

    let max_groups = components.config.subquery_map_max_subqueries.max(1);
    let max_items = components.config.subquery_map_items_per_subquery.max(1);
    let mut groups: Vec<SubqueryGroup> = state.subquery_groups.iter().take(max_groups).cloned().collect();
    if groups.is_empty() {
        if let Some(retrieval) = &state.retrieval {
            groups = retrieval
                .trace
                .subqueries
                .iter()
                .take(max_groups)
                .cloned()
                .collect();
        }
    }
    if groups.is_empty() {
        return StateDelta::default().with_stage_timing("subquery_aggregate", started.elapsed());
    }

    let mut partial_answers: Vec<PartialAnswer> = Vec::new();
    let mut jobs: Vec<(usize, String, Vec<EvidenceItem>)> = Vec::new();
    for (index, group) in groups.iter().enumerate() {
        let id = {
            let id = group.id.trim();
            if id.is_empty() {
                format!("q{}", index + 1)
            } else {
                id.to_string()
            }
        };
        let query = group.query.trim().to_string();

        let candidates: Vec<EvidenceItem> = if !group.items.is_empty() {
            group
                .items
                .iter()
                .filter(|item| !item.content.trim().is_empty())
                .take(max_items)
                .cloned()
                .collect()
        } else if !query.is_empty() && !state.chunks.is_empty() {
            let mut ranked = state.chunks.clone();
            ranked.sort_by(|a, b| {
                let overlap_a = keyword_overlap(&query, &a.content);
                let overlap_b = keyword_overlap(&query, &b.content);
                overlap_b.cmp(&overlap_a).then_with(|| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
            });
            ranked.truncate(max_items);
            ranked
        } else {
            Vec::new()
        };

        if candidates.is_empty() {
            partial_answers.push(PartialAnswer {
                id,
                query,
                status: PartialStatus::NoEvidence,
                evidence_sources: Vec::new(),
                summary: "Sin evidencia suficiente para esta subconsulta.".to_string(),
            });
            continue;
        }

        partial_answers.push(PartialAnswer {
            id,
            query: query.clone(),
            status: PartialStatus::Ok,
            evidence_sources: candidates.iter().map(|item| item.source.clone()).collect(),
            summary: "Resumen pendiente".to_string(),
        });
        jobs.push((partial_answers.len() - 1, query, candidates));
    }

    if !jobs.is_empty() {
        let profile = state.profile.as_ref();
        let timeout =
            state.adaptive_timeout(components.config.stage_timeouts.generate_ms, 1_000);
        let summaries = tokio::time::timeout(
            timeout,
            join_all(jobs.iter().map(|(_, query, candidates)| {
                let sub_plan = RetrievalPlan {
                    mode: "concisa_y_directa".to_string(),
                    chunk_k: candidates.len() as u32,
                    chunk_fetch_k: candidates.len() as u32,
                    summary_k: 0,
                    require_literal_evidence: false,
                    allow_inference: true,
                    response_contract: None,
                    requested_standards: Vec::new(),
                };
                let prompt = format!(
                    "[SUBCONSULTA: {query}]\nResume la respuesta basandote SOLO en los \
                     fragmentos proporcionados."
                );
                let generator = components.generator.clone();
                async move {
                    generator
                        .generate(GenerationRequest {
                            query: &prompt,
                            scope_label: "",
                            plan: &sub_plan,
                            chunks: candidates,
                            summaries: &[],
                            working_memory: &Map::new(),
                            partial_answers: &[],
                            profile,
                        })
                        .await
                }
            })),
        )
        .await;

        match summaries {
            Ok(results) => {
                for ((partial_index, _, candidates), result) in jobs.iter().zip(results) {
                    partial_answers[*partial_index].summary = match result {
                        Ok(draft) if !draft.text.trim().is_empty() => draft.text.trim().to_string(),
                        Ok(_) => "Evidencia recuperada.".to_string(),
                        Err(err) => {
                            error!(error = %err, "subquery_summarization_failed");
                            snippet_summary(candidates)
                        }
                    };
                }
            }
            Err(_) => {
                warn!("subquery_aggregation_timeout");
                for (partial_index, _, candidates) in &jobs {
                    partial_answers[*partial_index].summary = snippet_summary(candidates);
                }
            }
        }
    }

    StateDelta {
        partial_answers: Some(partial_answers),
        ..Default::default()
    }
    .with_stage_timing("subquery_aggregate", started.elapsed())
}

/// Generator node: synthesize the answer draft under an adaptive deadline.
pub async fn generator_node(state: &FlowState, components: &FlowComponents) -> StateDelta {
    let started = Instant::now();
    let Some(plan) = &state.retrieval_plan else {
        return StateDelta {
            stop_reason: Some(STOP_MISSING_RETRIEVAL_PLAN.to_string()),
            ..Default::default()
        }
        .with_stage_timing("generator", started.elapsed());
    };

    let timeout = state.adaptive_timeout(components.config.stage_timeouts.generate_ms, 1_000);
    let outcome = tokio::time::timeout(
        timeout,
        components.generator.generate(GenerationRequest {
            query: &state.user_query,
            scope_label: &state.scope_label,
            plan,
            chunks: &state.chunks,
            summaries: &state.summaries,
            working_memory: &state.working_memory,
            partial_answers: &state.partial_answers,
            profile: &state.profile,
        }),
    )
    .await;

    let answer = match outcome {
        Ok(Ok(answer)) => answer,
        Ok(Err(err)) => {
            error!(error = %err, "generator_failed");
            return StateDelta {
                stop_reason: Some(STOP_GENERATOR_TIMEOUT.to_string()),
                ..Default::default()
            }
            .with_stage_timing("generator", started.elapsed());
        }
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "generator_timed_out");
            return StateDelta {
                stop_reason: Some(STOP_GENERATOR_TIMEOUT.to_string()),
                ..Default::default()
            }
            .with_stage_timing("generator", started.elapsed());
        }
    };

    let mut step_output = Map::new();
    step_output.insert(
        "answer_preview".to_string(),
        json!(clip_text(&answer.text, ANSWER_PREVIEW_LIMIT)),
    );
    step_output.insert("evidence_count".to_string(), json!(answer.evidence.len()));
    step_output.insert(
        "partial_answers_count".to_string(),
        json!(state.partial_answers.len()),
    );
    let trace_step = ReasoningStep::new(
        state.next_step_index(),
        StepType::Synthesis,
        "synthesis_completed",
    )
    .with_output(step_output);

    StateDelta {
        generation: Some(answer),
        append_steps: vec![trace_step],
        ..Default::default()
    }
    .with_stage_timing("generator", started.elapsed())
}

/// Validation node: run the deterministic citation checks.
pub fn citation_validate_node(state: &FlowState, components: &FlowComponents) -> StateDelta {
    let started = Instant::now();
    let (Some(answer), Some(plan)) = (&state.generation, &state.retrieval_plan) else {
        return StateDelta {
            validation: Some(ValidationResult::rejected(vec![
                "missing_generation_or_plan".to_string(),
            ])),
            stop_reason: Some(STOP_VALIDATION_FAILED.to_string()),
            ..Default::default()
        }
        .with_stage_timing("validation", started.elapsed());
    };

    let validation =
        components
            .validator
            .validate(answer, plan, &state.user_query, &state.profile);

    let mut step_output = Map::new();
    step_output.insert("accepted".to_string(), json!(validation.accepted));
    step_output.insert("issues".to_string(), json!(validation.issues.clone()));
    let trace_step = ReasoningStep::new(
        state.next_step_index(),
        StepType::Validation,
        "validation_completed",
    )
    .with_output(step_output)
    .with_outcome(validation.accepted, None);

    let stop_reason = if state.stop_reason.is_empty() {
        Some(if validation.accepted {
            STOP_DONE.to_string()
        } else {
            STOP_VALIDATION_FAILED.to_string()
        })
    } else {
        None
    };

    StateDelta {
        validation: Some(validation),
        append_steps: vec![trace_step],
        stop_reason,
        ..Default::default()
    }
    .with_stage_timing("validation", started.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::test_support::{components_with_items, state_with_plan};
    use crate::model::AnswerDraft;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn evidence(source: &str, content: &str) -> EvidenceItem {
        EvidenceItem::new(source, content, 0.9).with_metadata(json!({
            "row": {"metadata": {"source_standard": "ISO 9001", "clause_id": "9.1"}}
        }))
    }

    #[tokio::test]
    async fn test_aggregation_disabled_by_default() {
        let components = components_with_items(vec![]);
        let mut state = state_with_plan("q", &["semantic_retrieval"]);
        state.subquery_groups = vec![SubqueryGroup {
            id: "s1".to_string(),
            query: "sub".to_string(),
            items: vec![evidence("C1", "contenido")],
        }];
        let delta = aggregate_subqueries_node(&state, &components).await;
        assert!(delta.partial_answers.is_none());
    }

    #[tokio::test]
    async fn test_aggregation_produces_partials_per_group() {
        let mut config = crate::config::KernelConfig::new("s");
        config.subquery_grouped_map_reduce = true;
        let components =
            crate::flow::test_support::components_with_config(vec![], config);
        let mut state = state_with_plan("q", &["semantic_retrieval"]);
        state.subquery_groups = vec![
            SubqueryGroup {
                id: "s1".to_string(),
                query: "requisitos 9.1".to_string(),
                items: vec![evidence("C1", "9.1 seguimiento y medicion")],
            },
            SubqueryGroup {
                id: "s2".to_string(),
                query: "sin evidencia".to_string(),
                items: vec![],
            },
        ];
        let delta = aggregate_subqueries_node(&state, &components).await;
        let partials = delta.partial_answers.unwrap();
        assert_eq!(partials.len(), 2);
        assert_eq!(partials[0].status, PartialStatus::Ok);
        assert_eq!(partials[0].evidence_sources, vec!["C1".to_string()]);
        assert!(!partials[0].summary.is_empty());
        assert_eq!(partials[1].status, PartialStatus::NoEvidence);
    }

    #[tokio::test]
    async fn test_generator_node_appends_synthesis_step() {
        let components = components_with_items(vec![]);
        let mut state = state_with_plan("que exige 9.1", &["semantic_retrieval"]);
        state.chunks = vec![evidence("C1", "9.1 seguimiento")];
        let delta = generator_node(&state, &components).await;
        assert!(delta.generation.is_some());
        assert_eq!(delta.append_steps.len(), 1);
        assert_eq!(delta.append_steps[0].step_type, StepType::Synthesis);
    }

    #[test]
    fn test_validate_node_sets_done() {
        let components = components_with_items(vec![]);
        let mut state = state_with_plan("que exige 9.1", &["semantic_retrieval"]);
        state.generation = Some(AnswerDraft {
            text: "Segun [C1], se requiere seguimiento.".to_string(),
            mode: "explicativa".to_string(),
            evidence: vec![evidence("C1", "9.1 seguimiento")],
        });
        let delta = citation_validate_node(&state, &components);
        assert!(delta.validation.as_ref().unwrap().accepted);
        assert_eq!(delta.stop_reason.as_deref(), Some(STOP_DONE));
    }

    #[test]
    fn test_validate_node_without_generation_fails() {
        let components = components_with_items(vec![]);
        let state = state_with_plan("q", &["semantic_retrieval"]);
        let delta = citation_validate_node(&state, &components);
        assert!(!delta.validation.as_ref().unwrap().accepted);
        assert_eq!(delta.stop_reason.as_deref(), Some(STOP_VALIDATION_FAILED));
    }
}
