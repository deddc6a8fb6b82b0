//! Core data model for the orchestration kernel.
//!
//! These types travel between the graph nodes, the retrieval flow, the
//! generator, and the validator. The state record itself lives in
//! [`crate::flow::state`]; everything here is the payload vocabulary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Classified query intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryIntent {
    /// Profile-defined mode name (e.g. `literal_normativa`, `comparativa`).
    pub mode: String,
    /// Why this mode was selected.
    pub rationale: String,
}

impl QueryIntent {
    pub fn new(mode: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            mode: mode.into(),
            rationale: rationale.into(),
        }
    }
}

/// Retrieval parameters derived from the profile's per-mode config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalPlan {
    pub mode: String,
    pub chunk_k: u32,
    pub chunk_fetch_k: u32,
    pub summary_k: u32,
    pub require_literal_evidence: bool,
    pub allow_inference: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_contract: Option<String>,
    /// Scope labels requested by the query, in detection order.
    pub requested_standards: Vec<String>,
}

impl RetrievalPlan {
    /// Generic plan used when the profile has no config for the mode.
    pub fn generic(mode: impl Into<String>, requested_standards: Vec<String>) -> Self {
        Self {
            mode: mode.into(),
            chunk_k: 30,
            chunk_fetch_k: 120,
            summary_k: 5,
            require_literal_evidence: false,
            allow_inference: true,
            response_contract: None,
            requested_standards,
        }
    }
}

/// One planned tool invocation. Order-preserving within a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    pub input: Map<String, Value>,
    pub rationale: String,
}

impl ToolCall {
    pub fn new(tool: impl Into<String>, input: Map<String, Value>, rationale: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            input,
            rationale: rationale.into(),
        }
    }
}

/// Ordered tool plan plus the goal it serves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPlan {
    pub goal: String,
    pub steps: Vec<ToolCall>,
    /// "simple" or "complex"; informs interaction estimates.
    pub complexity: String,
}

/// Outcome of a tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool: String,
    pub ok: bool,
    #[serde(default)]
    pub output: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(tool: impl Into<String>, output: Map<String, Value>) -> Self {
        Self {
            tool: tool.into(),
            ok: true,
            output,
            metadata: Map::new(),
            error: None,
        }
    }

    pub fn failure(tool: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            ok: false,
            output: Map::new(),
            metadata: Map::new(),
            error: Some(error.into()),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Kind of reasoning step in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Plan,
    Tool,
    Reflection,
    Synthesis,
    Validation,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plan => write!(f, "plan"),
            Self::Tool => write!(f, "tool"),
            Self::Reflection => write!(f, "reflection"),
            Self::Synthesis => write!(f, "synthesis"),
            Self::Validation => write!(f, "validation"),
        }
    }
}

/// One entry in the append-only reasoning trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub index: usize,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub description: String,
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default)]
    pub output: Map<String, Value>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReasoningStep {
    pub fn new(index: usize, step_type: StepType, description: impl Into<String>) -> Self {
        Self {
            index,
            step_type,
            tool: None,
            description: description.into(),
            input: Map::new(),
            output: Map::new(),
            ok: true,
            error: None,
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_input(mut self, input: Map<String, Value>) -> Self {
        self.input = input;
        self
    }

    pub fn with_output(mut self, output: Map<String, Value>) -> Self {
        self.output = output;
        self
    }

    pub fn with_outcome(mut self, ok: bool, error: Option<String>) -> Self {
        self.ok = ok;
        self.error = error;
        self
    }
}

/// A retrieved evidence item with its provenance marker.
///
/// `source` carries the marker the generator cites and the validator checks:
/// `C`-prefixed for chunks, `R`-prefixed for summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub score: f64,
    /// Nested metadata; `metadata.row.metadata` holds standard/clause fields.
    #[serde(default)]
    pub metadata: Value,
}

impl EvidenceItem {
    pub fn new(source: impl Into<String>, content: impl Into<String>, score: f64) -> Self {
        Self {
            source: source.into(),
            content: content.into(),
            score,
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// The innermost row metadata object, if present.
    pub fn row_metadata(&self) -> Option<&Map<String, Value>> {
        self.metadata
            .get("row")
            .and_then(|row| row.get("metadata"))
            .and_then(Value::as_object)
    }

    /// The scope/standard this item is attributed to, uppercased.
    pub fn row_standard(&self) -> Option<String> {
        let meta = self.row_metadata()?;
        for field in ["source_standard", "standard", "scope"] {
            if let Some(value) = meta.get(field).and_then(Value::as_str) {
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_uppercase());
                }
            }
        }
        None
    }

    /// Whether this item anchors the given clause reference, either in
    /// metadata or in its content.
    pub fn mentions_clause(&self, clause: &str) -> bool {
        if clause.is_empty() {
            return false;
        }
        if self.content.contains(clause) {
            return true;
        }
        if let Some(meta) = self.row_metadata() {
            for field in ["clause_id", "clause_ref", "clause"] {
                if meta.get(field).and_then(Value::as_str).map(str::trim) == Some(clause) {
                    return true;
                }
            }
            if let Some(refs) = meta.get("clause_refs").and_then(Value::as_array) {
                if refs
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|item| item.trim() == clause)
                {
                    return true;
                }
            }
        }
        false
    }

    /// Whether this item is a summary-layer result.
    ///
    /// Fusion-source metadata wins over the legacy marker prefix.
    pub fn is_summary(&self) -> bool {
        if let Some(meta) = self.row_metadata() {
            if let Some(fusion) = meta.get("fusion_source").and_then(Value::as_str) {
                return fusion.eq_ignore_ascii_case("raptor");
            }
        }
        self.source.to_uppercase().starts_with('R')
    }
}

/// Subquery sent to the retrieval contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubqueryRequest {
    pub id: String,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
}

impl SubqueryRequest {
    pub fn new(id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            query: query.into(),
            k: None,
            fetch_k: None,
            filters: None,
        }
    }

    pub fn with_filters(mut self, filters: Value) -> Self {
        self.filters = Some(filters);
        self
    }

    /// Scope labels this subquery is filtered to, uppercased.
    pub fn scope_filters(&self) -> Vec<String> {
        let Some(filters) = self.filters.as_ref().and_then(Value::as_object) else {
            return Vec::new();
        };
        if let Some(one) = filters.get("source_standard").and_then(Value::as_str) {
            let trimmed = one.trim();
            if !trimmed.is_empty() {
                return vec![trimmed.to_uppercase()];
            }
        }
        filters
            .get("source_standards")
            .and_then(Value::as_array)
            .map(|many| {
                many.iter()
                    .filter_map(Value::as_str)
                    .map(|value| value.trim().to_uppercase())
                    .filter(|value| !value.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A subquery together with the evidence it retrieved, used by the
/// grouped map-reduce aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubqueryGroup {
    pub id: String,
    pub query: String,
    #[serde(default)]
    pub items: Vec<EvidenceItem>,
}

/// Status of a per-subquery partial answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialStatus {
    Ok,
    NoEvidence,
}

/// A per-subquery summary produced by the aggregation node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialAnswer {
    pub id: String,
    pub query: String,
    pub status: PartialStatus,
    pub evidence_sources: Vec<String>,
    pub summary: String,
}

/// Trace record for the min-score filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinScoreFilterTrace {
    pub threshold: f64,
    pub kept: usize,
    pub dropped: usize,
    pub backstop_applied: bool,
    pub backstop_top_n: usize,
}

/// Trace record for a coverage-repair pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageGateTrace {
    pub trigger_reason: String,
    pub missing_scopes: Vec<String>,
    pub missing_clause_refs: Vec<String>,
    pub added_queries: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub step_back_queries: Vec<String>,
    pub final_missing_scopes: Vec<String>,
    pub final_missing_clause_refs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Mode-policy knobs that shaped a retrieval pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModePolicyTrace {
    pub require_all_requested_scopes: bool,
    pub min_clause_refs: usize,
    pub max_subqueries: usize,
}

/// Schema-versioned retrieval trace with typed sub-records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalTrace {
    pub schema_version: String,
    /// Per-operation timings, keyed by operation name.
    #[serde(default)]
    pub timings_ms: BTreeMap<String, f64>,
    #[serde(default)]
    pub error_codes: Vec<String>,
    #[serde(default)]
    pub missing_scopes: Vec<String>,
    #[serde(default)]
    pub missing_clause_refs: Vec<String>,
    /// Subqueries executed in the selected strategy, with their items.
    #[serde(default)]
    pub subqueries: Vec<SubqueryGroup>,
    /// Per-layer item counts (chunks/summaries/graph).
    #[serde(default)]
    pub layer_counts: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_score_filter: Option<MinScoreFilterTrace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage_gate: Option<CoverageGateTrace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode_policy: Option<ModePolicyTrace>,
    /// Search-hint expansions applied to the query, term → additions.
    #[serde(default)]
    pub search_hint_expansions: BTreeMap<String, Vec<String>>,
    /// Why multi-query was promoted to the primary strategy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promoted_reason: Option<String>,
    /// Why the multihop fallback fired.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    /// Set when the fallback was skipped or exited early.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multi_query_fallback_skipped: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multi_query_fallback_early_exit: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_scopes_before: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_scopes_after: Vec<String>,
    /// Set when a refine pass replaced the primary multi-query result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refine_reason: Option<String>,
    /// Upstream trace payload from the hybrid endpoint, passed through.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hybrid_trace: Option<Value>,
}

impl Default for RetrievalTrace {
    fn default() -> Self {
        Self {
            schema_version: "v1".to_string(),
            timings_ms: BTreeMap::new(),
            error_codes: Vec::new(),
            missing_scopes: Vec::new(),
            missing_clause_refs: Vec::new(),
            subqueries: Vec::new(),
            layer_counts: BTreeMap::new(),
            min_score_filter: None,
            coverage_gate: None,
            mode_policy: None,
            search_hint_expansions: BTreeMap::new(),
            promoted_reason: None,
            fallback_reason: None,
            multi_query_fallback_skipped: None,
            multi_query_fallback_early_exit: None,
            missing_scopes_before: Vec::new(),
            missing_scopes_after: Vec::new(),
            refine_reason: None,
            hybrid_trace: None,
        }
    }
}

/// Diagnostics returned alongside retrieval evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalDiagnostics {
    /// Contract surface used ("advanced"/"comprehensive"/"legacy").
    pub contract: String,
    /// Strategy that produced the returned items.
    pub strategy: String,
    /// Whether the upstream marked the result partial.
    pub partial: bool,
    pub trace: RetrievalTrace,
    /// Scope-validation payload from the contract, passed through.
    #[serde(default)]
    pub scope_validation: Value,
}

impl RetrievalDiagnostics {
    pub fn empty(contract: impl Into<String>) -> Self {
        Self {
            contract: contract.into(),
            strategy: "none".to_string(),
            partial: false,
            trace: RetrievalTrace::default(),
            scope_validation: Value::Null,
        }
    }

    /// Whether upstream scope validation flagged the request invalid.
    pub fn scope_validation_failed(&self) -> bool {
        self.scope_validation
            .get("valid")
            .and_then(Value::as_bool)
            .map(|valid| !valid)
            .unwrap_or(false)
    }
}

/// Synthesized answer draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerDraft {
    pub text: String,
    pub mode: String,
    pub evidence: Vec<EvidenceItem>,
}

/// Citation validation outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub accepted: bool,
    pub issues: Vec<String>,
}

impl ValidationResult {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            issues: Vec::new(),
        }
    }

    pub fn rejected(issues: Vec<String>) -> Self {
        Self {
            accepted: false,
            issues,
        }
    }
}

/// Kind of interaction interrupt raised by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClarificationKind {
    Clarification,
    PlanApproval,
}

impl std::fmt::Display for ClarificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clarification => write!(f, "clarification"),
            Self::PlanApproval => write!(f, "plan_approval"),
        }
    }
}

/// Structured interrupt asking the user for input before retrieval runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationRequest {
    pub kind: ClarificationKind,
    /// Escalation level, "L2" or "L3".
    pub level: String,
    pub question: String,
    pub options: Vec<String>,
    pub missing_slots: Vec<String>,
    pub expected_answer: String,
}

/// Context carried back from a previous clarification round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClarificationContext {
    #[serde(default)]
    pub round: u32,
    #[serde(default)]
    pub selected_option: Option<String>,
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub plan_approved: bool,
    #[serde(default)]
    pub answer_text: Option<String>,
    #[serde(default)]
    pub plan_feedback: Option<String>,
    #[serde(default)]
    pub requested_scopes: Vec<String>,
    #[serde(default)]
    pub missing_slots: Vec<String>,
    #[serde(default)]
    pub objective_hint: Option<String>,
}

/// Scope-validation rejection payload surfaced instead of an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeValidationError {
    pub violations: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub normalized_scope: Value,
    #[serde(default)]
    pub query_scope: Value,
}

/// Collapse whitespace and clip text to a display limit.
pub(crate) fn clip_text(value: &str, limit: usize) -> String {
    let text = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.chars().count() <= limit {
        return text;
    }
    let clipped: String = text.chars().take(limit).collect();
    format!("{}...", clipped.trim_end())
}

/// Clip every scalar in a payload for trace auditability.
pub(crate) fn sanitize_payload(payload: &Map<String, Value>, limit: usize) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in payload {
        let sanitized = match value {
            Value::String(text) => Value::String(clip_text(text, limit)),
            Value::Number(_) | Value::Bool(_) | Value::Null => value.clone(),
            Value::Object(inner) => Value::Object(
                inner
                    .iter()
                    .map(|(k, v)| {
                        let text = match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), Value::String(clip_text(&text, limit)))
                    })
                    .collect(),
            ),
            other => Value::String(clip_text(&other.to_string(), limit)),
        };
        out.insert(key.clone(), sanitized);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item_with_row(standard: &str, clause: &str) -> EvidenceItem {
        EvidenceItem::new("C1", "9.1 Seguimiento y medicion", 0.9).with_metadata(json!({
            "row": {
                "content": "9.1 Seguimiento y medicion",
                "metadata": {"source_standard": standard, "clause_id": clause},
                "similarity": 0.9,
            }
        }))
    }

    #[test]
    fn test_row_standard_uppercases() {
        let item = item_with_row("iso 9001", "9.1");
        assert_eq!(item.row_standard().as_deref(), Some("ISO 9001"));
    }

    #[test]
    fn test_mentions_clause_from_metadata_and_content() {
        let item = item_with_row("ISO 9001", "9.1.2");
        assert!(item.mentions_clause("9.1.2"));
        assert!(item.mentions_clause("9.1"));
        assert!(!item.mentions_clause("5.3"));
    }

    #[test]
    fn test_summary_detection_prefers_fusion_source() {
        let mut item = item_with_row("ISO 9001", "9.1");
        assert!(!item.is_summary());
        item.metadata = json!({
            "row": {"metadata": {"fusion_source": "raptor"}}
        });
        assert!(item.is_summary());
        let legacy = EvidenceItem::new("R3", "resumen", 0.8);
        assert!(legacy.is_summary());
    }

    #[test]
    fn test_subquery_scope_filters() {
        let single = SubqueryRequest::new("s1", "q")
            .with_filters(json!({"source_standard": "iso 14001"}));
        assert_eq!(single.scope_filters(), vec!["ISO 14001".to_string()]);

        let many = SubqueryRequest::new("s2", "q")
            .with_filters(json!({"source_standards": ["ISO 9001", "ISO 45001"]}));
        assert_eq!(many.scope_filters(), vec!["ISO 9001", "ISO 45001"]);
    }

    #[test]
    fn test_clip_text_collapses_whitespace() {
        assert_eq!(clip_text("a   b\n c", 10), "a b c");
        let clipped = clip_text("abcdefghij", 4);
        assert_eq!(clipped, "abcd...");
    }

    #[test]
    fn test_sanitize_payload_clips_scalars() {
        let mut payload = Map::new();
        payload.insert("query".to_string(), json!("x".repeat(500)));
        payload.insert("count".to_string(), json!(3));
        let sanitized = sanitize_payload(&payload, 280);
        let query = sanitized["query"].as_str().unwrap_or_default();
        assert!(query.chars().count() <= 283);
        assert_eq!(sanitized["count"], json!(3));
    }
}
