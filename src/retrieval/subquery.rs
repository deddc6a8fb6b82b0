//! Subquery planning: query expansion and the deterministic / LLM-assisted
//! planner pair behind the hybrid planner.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::llm::{ChatMessage, CompletionClient, CompletionRequest};
use crate::model::SubqueryRequest;
use crate::profile::{AgentProfile, DecompositionPolicy};
use crate::router::{extract_clause_refs, is_complex_query};

/// Step-back phrasing shared by the refine pass and coverage repair.
pub const STEP_BACK_PREFIX: &str = "principios generales y requisitos clave relacionados";

/// Inputs for one planning round.
#[derive(Debug, Clone)]
pub struct SubqueryPlanningContext<'a> {
    pub query: &'a str,
    pub requested_standards: &'a [String],
    pub max_queries: usize,
    pub mode: &'a str,
    pub require_literal_evidence: bool,
    pub include_semantic_tail: bool,
    pub profile: &'a AgentProfile,
    pub decomposition: &'a DecompositionPolicy,
}

/// Planner interface; implementations must tolerate failure by returning
/// an empty list rather than erroring.
#[async_trait]
pub trait SubqueryPlanner: Send + Sync {
    async fn plan(&self, ctx: &SubqueryPlanningContext<'_>) -> Vec<SubqueryRequest>;
}

/// Apply profile search-hint expansions to the query.
///
/// Each matching hint appends its expansion terms once; the applied map
/// (term → additions) goes into the retrieval trace.
pub fn apply_search_hints(
    query: &str,
    profile: &AgentProfile,
) -> (String, BTreeMap<String, Vec<String>>) {
    let text = query.trim();
    if text.is_empty() || profile.retrieval.search_hints.is_empty() {
        return (text.to_string(), BTreeMap::new());
    }

    let lowered = text.to_lowercase();
    let mut expanded_terms: Vec<String> = Vec::new();
    let mut applied: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for hint in &profile.retrieval.search_hints {
        let term = hint.term.trim();
        if term.is_empty() || !lowered.contains(&term.to_lowercase()) {
            continue;
        }
        let additions: Vec<String> = hint
            .expand_to
            .iter()
            .map(|value| value.trim().to_string())
            .filter(|value| {
                !value.is_empty()
                    && !lowered.contains(&value.to_lowercase())
                    && !expanded_terms.contains(value)
            })
            .collect();
        if additions.is_empty() {
            continue;
        }
        expanded_terms.extend(additions.iter().cloned());
        applied.insert(term.to_string(), additions);
    }

    if expanded_terms.is_empty() {
        return (text.to_string(), BTreeMap::new());
    }
    (format!("{text} {}", expanded_terms.join(" ")), applied)
}

fn standard_key(standard: &str) -> String {
    static KEY: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let pattern = KEY.get_or_init(|| {
        Regex::new(r"\b(\d{4,5})\b").unwrap()
    });
    pattern
        .captures(standard)
        .and_then(|captures| captures.get(1))
        .map(|digits| digits.as_str().to_string())
        .unwrap_or_else(|| standard.trim().to_string())
}

/// The clause reference closest after a standard mention, within a short
/// window, so "ISO 9001 9.1.2" binds the clause to that standard.
fn clause_near_standard(query: &str, standard: &str) -> Option<String> {
    static CLAUSE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let clause_pattern = CLAUSE.get_or_init(|| {
        Regex::new(r"\b\d+(?:\.\d+)+\b").unwrap()
    });
    let key = standard_key(standard);
    if key.is_empty() {
        return None;
    }
    let position = find_case_insensitive(query, standard)
        .or_else(|| find_case_insensitive(query, &key))?;
    let window_start = position.min(query.len());
    let window: String = query[window_start..].chars().take(90).collect();
    clause_pattern
        .find(&window)
        .map(|found| found.as_str().to_string())
}

fn find_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let lowered_haystack = haystack.to_lowercase();
    let lowered_needle = needle.to_lowercase();
    lowered_haystack
        .find(&lowered_needle)
        .map(|start| start + lowered_needle.len())
        .filter(|end| haystack.is_char_boundary(*end))
}

fn literal_mode(mode: &str) -> bool {
    matches!(mode.trim(), "literal_normativa" | "literal_lista")
}

fn shared_scope_filters(requested_standards: &[String]) -> Option<serde_json::Value> {
    if requested_standards.is_empty() {
        return None;
    }
    Some(serde_json::json!({ "source_standards": requested_standards }))
}

/// Build deterministic subqueries: one per requested scope (≤3), a bridge
/// query for documentary impact, and a step-back query for general
/// principles. Literal modes suppress the step-back, reserving it for
/// coverage repair.
pub fn build_deterministic_subqueries(ctx: &SubqueryPlanningContext<'_>) -> Vec<SubqueryRequest> {
    let (effective_query, _) = apply_search_hints(ctx.query, ctx.profile);
    let clause_refs = extract_clause_refs(&effective_query, ctx.profile);
    let max_queries = ctx.max_queries.max(1);
    let mut out: Vec<SubqueryRequest> = Vec::new();

    for standard in ctx.requested_standards.iter().take(3) {
        let clause = clause_near_standard(&effective_query, standard);
        let key = {
            let key = standard_key(standard).to_lowercase();
            if key.is_empty() {
                "scope".to_string()
            } else {
                key
            }
        };
        let mut query_parts: Vec<String> = vec![standard.clone()];
        if let Some(clause) = &clause {
            query_parts.push(clause.clone());
        }
        query_parts.extend(clause_refs.iter().take(3).cloned());
        let query_text = query_parts.join(" ").split_whitespace().collect::<Vec<_>>().join(" ");

        let mut filters = serde_json::json!({ "source_standard": standard });
        if let Some(clause) = &clause {
            filters["metadata"] = serde_json::json!({ "clause_id": clause });
        }
        let clause_id = clause
            .as_deref()
            .unwrap_or("general")
            .replace('.', "_");
        out.push(
            SubqueryRequest::new(format!("scope_{key}_{clause_id}"), query_text)
                .with_filters(filters),
        );
        if out.len() >= max_queries {
            return out;
        }
    }

    let literal = literal_mode(ctx.mode) || ctx.require_literal_evidence;
    let shared = shared_scope_filters(ctx.requested_standards);

    if out.len() < max_queries && (!literal || out.is_empty()) {
        let mut bridge = SubqueryRequest::new(
            "bridge_contexto",
            format!("{effective_query} impacto documental evidencia registros cumplimiento riesgos"),
        );
        if let Some(filters) = &shared {
            bridge = bridge.with_filters(filters.clone());
        }
        out.push(bridge);
    }

    if out.len() < max_queries && !literal_mode(ctx.mode) {
        let mut step_back =
            SubqueryRequest::new("step_back", format!("{STEP_BACK_PREFIX}: {effective_query}"));
        if let Some(filters) = &shared {
            step_back = step_back.with_filters(filters.clone());
        }
        out.push(step_back);
    }

    if out.len() < max_queries && ctx.include_semantic_tail {
        let mut tail = SubqueryRequest::new("semantic_tail", effective_query.clone());
        if let Some(filters) = &shared {
            tail = tail.with_filters(filters.clone());
        }
        out.push(tail);
    }

    out.truncate(max_queries);
    out
}

fn subquery_key(subquery: &SubqueryRequest) -> String {
    let id = subquery.id.trim();
    if !id.is_empty() {
        return id.to_string();
    }
    subquery.query.trim().to_lowercase()
}

/// Guarantee every requested scope has at least one subquery, synthesizing
/// deterministic fillers for the missing ones. When the merged set exceeds
/// the cap, one representative per requested scope is selected first.
pub fn ensure_scope_coverage(
    ctx: &SubqueryPlanningContext<'_>,
    subqueries: Vec<SubqueryRequest>,
) -> Vec<SubqueryRequest> {
    let max_queries = ctx.max_queries.max(1);
    let requested: Vec<String> = ctx
        .requested_standards
        .iter()
        .map(|scope| scope.trim().to_uppercase())
        .filter(|scope| !scope.is_empty())
        .collect();
    if requested.len() < 2 {
        let mut capped = subqueries;
        capped.truncate(max_queries);
        return capped;
    }

    let mut present: Vec<String> = Vec::new();
    for subquery in &subqueries {
        present.extend(subquery.scope_filters());
    }
    let missing: Vec<String> = requested
        .iter()
        .filter(|scope| !present.contains(scope))
        .cloned()
        .collect();
    if missing.is_empty() {
        let mut capped = subqueries;
        capped.truncate(max_queries);
        return capped;
    }

    let filler_ctx = SubqueryPlanningContext {
        requested_standards: &missing,
        max_queries: missing.len(),
        ..ctx.clone()
    };
    let fillers = build_deterministic_subqueries(&filler_ctx);

    let mut merged: Vec<SubqueryRequest> = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    for subquery in subqueries.into_iter().chain(fillers) {
        let key = subquery_key(&subquery);
        if key.is_empty() || seen.contains(&key) {
            continue;
        }
        seen.push(key);
        merged.push(subquery);
    }
    if merged.len() <= max_queries {
        return merged;
    }

    // One representative per requested scope first, then fill up.
    let mut selected: Vec<SubqueryRequest> = Vec::new();
    let mut selected_keys: Vec<String> = Vec::new();
    for scope in &requested {
        if let Some(subquery) = merged.iter().find(|candidate| {
            candidate.scope_filters().contains(scope)
                && !selected_keys.contains(&subquery_key(candidate))
        }) {
            selected_keys.push(subquery_key(subquery));
            selected.push(subquery.clone());
        }
    }
    for subquery in &merged {
        if selected.len() >= max_queries {
            break;
        }
        let key = subquery_key(subquery);
        if selected_keys.contains(&key) {
            continue;
        }
        selected_keys.push(key);
        selected.push(subquery.clone());
    }
    selected.truncate(max_queries);
    selected
}

/// Deterministic planner: scope subqueries with coverage enforcement.
#[derive(Debug, Default)]
pub struct DeterministicSubqueryPlanner;

#[async_trait]
impl SubqueryPlanner for DeterministicSubqueryPlanner {
    async fn plan(&self, ctx: &SubqueryPlanningContext<'_>) -> Vec<SubqueryRequest> {
        let planned = build_deterministic_subqueries(ctx);
        ensure_scope_coverage(ctx, planned)
    }
}

#[derive(Debug, Deserialize)]
struct SubqueryPlanPayload {
    #[serde(default)]
    subqueries: Vec<SubqueryRequest>,
}

/// LLM-assisted planner with a tight timeout; any failure yields an empty
/// plan and the hybrid planner stays deterministic.
pub struct LlmSubqueryPlanner {
    client: Arc<dyn CompletionClient>,
    timeout: Duration,
}

impl LlmSubqueryPlanner {
    pub fn new(client: Arc<dyn CompletionClient>, timeout_ms: u64) -> Self {
        Self {
            client,
            timeout: Duration::from_millis(timeout_ms.max(100)),
        }
    }
}

#[async_trait]
impl SubqueryPlanner for LlmSubqueryPlanner {
    async fn plan(&self, ctx: &SubqueryPlanningContext<'_>) -> Vec<SubqueryRequest> {
        let standards = if ctx.requested_standards.is_empty() {
            "(none)".to_string()
        } else {
            ctx.requested_standards.join(", ")
        };
        let request = CompletionRequest::new(vec![
            ChatMessage::system(
                "You are a retrieval subquery planner. Return JSON only with \
                 {\"subqueries\": [...]}. No extra text.",
            ),
            ChatMessage::user(format!(
                "Query: {}\nRequested standards: {}\nMax subqueries: {}\n\
                 Constraints: each subquery item must contain id, query, optional filters.",
                ctx.query, standards, ctx.max_queries
            )),
        ])
        .with_temperature(0.0)
        .json_object();

        let completion =
            match tokio::time::timeout(self.timeout, self.client.complete(request)).await {
                Ok(Ok(completion)) => completion,
                Ok(Err(error)) => {
                    warn!(error = %error, "light_planner_failed_fallback");
                    return Vec::new();
                }
                Err(_) => {
                    warn!(timeout_ms = self.timeout.as_millis() as u64, "light_planner_timeout");
                    return Vec::new();
                }
            };

        match serde_json::from_str::<SubqueryPlanPayload>(completion.content.trim()) {
            Ok(payload) => {
                let mut subqueries = payload.subqueries;
                subqueries.truncate(ctx.max_queries.max(1));
                subqueries
            }
            Err(error) => {
                warn!(error = %error, "light_planner_bad_payload");
                Vec::new()
            }
        }
    }
}

/// Hybrid planner: deterministic always, LLM only for complex queries in
/// modes that opted in, merged with dedup and scope-coverage enforcement.
pub struct HybridSubqueryPlanner {
    deterministic: DeterministicSubqueryPlanner,
    llm: Option<LlmSubqueryPlanner>,
}

impl HybridSubqueryPlanner {
    pub fn new(llm: Option<LlmSubqueryPlanner>) -> Self {
        Self {
            deterministic: DeterministicSubqueryPlanner,
            llm,
        }
    }
}

#[async_trait]
impl SubqueryPlanner for HybridSubqueryPlanner {
    async fn plan(&self, ctx: &SubqueryPlanningContext<'_>) -> Vec<SubqueryRequest> {
        let deterministic = self.deterministic.plan(ctx).await;

        let Some(llm) = &self.llm else {
            return deterministic;
        };
        if !ctx.decomposition.light_llm_enabled {
            return deterministic;
        }
        let needs_llm = deterministic.is_empty() || is_complex_query(ctx.query, ctx.profile);
        if !needs_llm {
            return deterministic;
        }

        let llm_subqueries = llm.plan(ctx).await;
        if llm_subqueries.is_empty() {
            return deterministic;
        }

        let mut merged: Vec<SubqueryRequest> = Vec::new();
        let mut seen: Vec<String> = Vec::new();
        for subquery in deterministic.into_iter().chain(llm_subqueries) {
            let key = subquery_key(&subquery);
            if key.is_empty() || seen.contains(&key) {
                continue;
            }
            seen.push(key);
            merged.push(subquery);
        }
        let mut covered = ensure_scope_coverage(ctx, merged);
        covered.truncate(ctx.max_queries.max(1));
        covered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedCompletionClient;
    use crate::profile::SearchHint;
    use pretty_assertions::assert_eq;

    fn context<'a>(
        query: &'a str,
        standards: &'a [String],
        mode: &'a str,
        profile: &'a AgentProfile,
        decomposition: &'a DecompositionPolicy,
    ) -> SubqueryPlanningContext<'a> {
        SubqueryPlanningContext {
            query,
            requested_standards: standards,
            max_queries: 6,
            mode,
            require_literal_evidence: literal_mode(mode),
            include_semantic_tail: false,
            profile,
            decomposition,
        }
    }

    #[test]
    fn test_search_hints_expand_once() {
        let mut profile = AgentProfile::default();
        profile.retrieval.search_hints = vec![
            SearchHint {
                term: "auditoria".to_string(),
                expand_to: vec!["auditoría interna".to_string(), "programa".to_string()],
            },
            SearchHint {
                term: "nada".to_string(),
                expand_to: vec!["irrelevante".to_string()],
            },
        ];
        let (expanded, applied) = apply_search_hints("plan de auditoria anual", &profile);
        assert_eq!(expanded, "plan de auditoria anual auditoría interna programa");
        assert_eq!(applied.len(), 1);
        assert!(applied.contains_key("auditoria"));
    }

    #[test]
    fn test_clause_binds_to_nearest_standard() {
        assert_eq!(
            clause_near_standard("Compara ISO 9001 9.1.2 con ISO 14001 9.1.1", "ISO 9001"),
            Some("9.1.2".to_string())
        );
        assert_eq!(
            clause_near_standard("Compara ISO 9001 9.1.2 con ISO 14001 9.1.1", "ISO 14001"),
            Some("9.1.1".to_string())
        );
    }

    #[tokio::test]
    async fn test_deterministic_plan_covers_each_scope() {
        let profile = AgentProfile::default();
        let decomposition = DecompositionPolicy::default();
        let standards = vec!["ISO 9001".to_string(), "ISO 14001".to_string()];
        let ctx = context(
            "Compara ISO 9001 9.1.2 con ISO 14001 9.1.1",
            &standards,
            "comparativa",
            &profile,
            &decomposition,
        );
        let plan = DeterministicSubqueryPlanner.plan(&ctx).await;
        let scopes: Vec<Vec<String>> = plan.iter().map(SubqueryRequest::scope_filters).collect();
        assert!(scopes.iter().any(|s| s.contains(&"ISO 9001".to_string())));
        assert!(scopes.iter().any(|s| s.contains(&"ISO 14001".to_string())));
        assert!(plan.iter().any(|sq| sq.id == "bridge_contexto"));
        assert!(plan.iter().any(|sq| sq.id == "step_back"));
    }

    #[tokio::test]
    async fn test_literal_mode_suppresses_step_back() {
        let profile = AgentProfile::default();
        let decomposition = DecompositionPolicy::default();
        let standards = vec!["ISO 9001".to_string()];
        let ctx = context(
            "Que exige la cláusula 9.1 de ISO 9001?",
            &standards,
            "literal_normativa",
            &profile,
            &decomposition,
        );
        let plan = DeterministicSubqueryPlanner.plan(&ctx).await;
        assert!(plan.iter().all(|sq| sq.id != "step_back"));
        assert!(plan.iter().all(|sq| sq.id != "bridge_contexto"));
    }

    #[tokio::test]
    async fn test_planning_is_idempotent() {
        let profile = AgentProfile::default();
        let decomposition = DecompositionPolicy::default();
        let standards = vec!["ISO 9001".to_string(), "ISO 45001".to_string()];
        let ctx = context(
            "Compara ISO 9001 con ISO 45001",
            &standards,
            "comparativa",
            &profile,
            &decomposition,
        );
        let first = DeterministicSubqueryPlanner.plan(&ctx).await;
        let second = DeterministicSubqueryPlanner.plan(&ctx).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_coverage_enforcement_synthesizes_fillers() {
        let profile = AgentProfile::default();
        let decomposition = DecompositionPolicy::default();
        let standards = vec!["ISO 9001".to_string(), "ISO 14001".to_string()];
        let ctx = context(
            "Compara ambos",
            &standards,
            "comparativa",
            &profile,
            &decomposition,
        );
        let partial = vec![SubqueryRequest::new("custom", "solo 9001")
            .with_filters(serde_json::json!({"source_standard": "ISO 9001"}))];
        let covered = ensure_scope_coverage(&ctx, partial);
        let scopes: Vec<Vec<String>> =
            covered.iter().map(SubqueryRequest::scope_filters).collect();
        assert!(scopes.iter().any(|s| s.contains(&"ISO 14001".to_string())));
    }

    #[tokio::test]
    async fn test_hybrid_planner_merges_llm_for_complex_queries() {
        let profile = AgentProfile::default();
        let decomposition = DecompositionPolicy {
            light_llm_enabled: true,
            ..Default::default()
        };
        let standards = vec!["ISO 9001".to_string(), "ISO 14001".to_string()];
        let ctx = context(
            "Compara ISO 9001 con ISO 14001",
            &standards,
            "comparativa",
            &profile,
            &decomposition,
        );
        let scripted = Arc::new(ScriptedCompletionClient::new(vec![
            r#"{"subqueries": [{"id": "llm_extra", "query": "riesgos compartidos"}]}"#.to_string(),
        ]));
        let planner =
            HybridSubqueryPlanner::new(Some(LlmSubqueryPlanner::new(scripted, 600)));
        let plan = planner.plan(&ctx).await;
        assert!(plan.iter().any(|sq| sq.id == "llm_extra"));
        assert!(plan.len() <= 6);
    }

    #[tokio::test]
    async fn test_hybrid_planner_survives_llm_garbage() {
        let profile = AgentProfile::default();
        let decomposition = DecompositionPolicy {
            light_llm_enabled: true,
            ..Default::default()
        };
        let standards = vec!["ISO 9001".to_string(), "ISO 14001".to_string()];
        let ctx = context(
            "Compara ISO 9001 con ISO 14001",
            &standards,
            "comparativa",
            &profile,
            &decomposition,
        );
        let scripted = Arc::new(ScriptedCompletionClient::new(vec!["not json".to_string()]));
        let planner =
            HybridSubqueryPlanner::new(Some(LlmSubqueryPlanner::new(scripted, 600)));
        let plan = planner.plan(&ctx).await;
        assert!(!plan.is_empty());
        assert!(plan.iter().all(|sq| sq.id != "llm_extra"));
    }
}
