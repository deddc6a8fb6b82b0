//! Agent profile: the declarative policy bundle per tenant.
//!
//! Profiles parameterize routing, retrieval, synthesis, validation, and
//! interaction without code changes. Every section is defaulted so a partial
//! document still yields a working profile; unknown keys are rejected so
//! typos surface at load time instead of silently configuring nothing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Profile lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProfileStatus {
    Draft,
    #[default]
    Active,
}

/// Descriptive metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProfileMeta {
    pub id: String,
    pub description: String,
    pub owner: String,
}

impl Default for ProfileMeta {
    fn default() -> Self {
        Self {
            id: "base_v1".to_string(),
            description: String::new(),
            owner: "orchestrator".to_string(),
        }
    }
}

/// Persona settings applied during synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdentityPolicy {
    pub role: String,
    pub tone: String,
    pub style_guide: Vec<String>,
}

impl Default for IdentityPolicy {
    fn default() -> Self {
        Self {
            role: "Analista tecnico".to_string(),
            tone: "Formal y basado en evidencia".to_string(),
            style_guide: Vec::new(),
        }
    }
}

/// A named scope-detection pattern. With a label, any match yields the
/// label; without one, the captured text becomes the scope candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScopePattern {
    #[serde(default)]
    pub label: Option<String>,
    pub regex: String,
}

/// Router heuristics: hint word lists and detection patterns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouterHeuristics {
    pub literal_list_hints: Vec<String>,
    pub literal_normative_hints: Vec<String>,
    pub comparative_hints: Vec<String>,
    pub interpretive_hints: Vec<String>,
    pub conflict_markers: Vec<String>,
    pub evidence_markers: Vec<String>,
    /// Scope label → hint substrings that imply it.
    pub scope_hints: BTreeMap<String, Vec<String>>,
    pub scope_patterns: Vec<ScopePattern>,
    /// Clause-reference patterns; the built-in dotted-number pattern is the
    /// fallback when empty.
    pub reference_patterns: Vec<String>,
    /// Analytical-connector tokens that mark a query as complex.
    pub complexity_hints: Vec<String>,
    /// Queries matching these need the structural-extraction tool.
    pub extraction_patterns: Vec<String>,
    /// Queries matching these need the calculator tool.
    pub calculation_patterns: Vec<String>,
}

/// Retrieval depth parameters for one retrieval profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrievalModeConfig {
    pub chunk_k: u32,
    pub chunk_fetch_k: u32,
    pub summary_k: u32,
    #[serde(default)]
    pub require_literal_evidence: bool,
}

/// A query-expansion hint: when `term` appears, append `expand_to` terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchHint {
    pub term: String,
    #[serde(default)]
    pub expand_to: Vec<String>,
}

/// Retrieval policy: per-profile depth configs and score floor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrievalPolicy {
    pub by_mode: BTreeMap<String, RetrievalModeConfig>,
    pub search_hints: Vec<SearchHint>,
    pub min_score: f64,
}

impl Default for RetrievalPolicy {
    fn default() -> Self {
        let mut by_mode = BTreeMap::new();
        by_mode.insert(
            "literal_lista".to_string(),
            RetrievalModeConfig {
                chunk_k: 45,
                chunk_fetch_k: 220,
                summary_k: 3,
                require_literal_evidence: true,
            },
        );
        by_mode.insert(
            "literal_normativa".to_string(),
            RetrievalModeConfig {
                chunk_k: 45,
                chunk_fetch_k: 220,
                summary_k: 3,
                require_literal_evidence: true,
            },
        );
        by_mode.insert(
            "comparativa".to_string(),
            RetrievalModeConfig {
                chunk_k: 35,
                chunk_fetch_k: 140,
                summary_k: 5,
                require_literal_evidence: false,
            },
        );
        by_mode.insert(
            "ambigua_scope".to_string(),
            RetrievalModeConfig {
                chunk_k: 0,
                chunk_fetch_k: 0,
                summary_k: 0,
                require_literal_evidence: true,
            },
        );
        by_mode.insert(
            "explicativa".to_string(),
            RetrievalModeConfig {
                chunk_k: 30,
                chunk_fetch_k: 120,
                summary_k: 5,
                require_literal_evidence: false,
            },
        );
        Self {
            by_mode,
            search_hints: Vec::new(),
            min_score: 0.75,
        }
    }
}

/// Validation policy for synthesized answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidationPolicy {
    pub require_citations: bool,
    pub forbidden_concepts: Vec<String>,
    /// Substituted for the answer text when validation rejects the draft.
    pub fallback_message: String,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            require_citations: true,
            forbidden_concepts: Vec::new(),
            fallback_message: "No tengo informacion suficiente en el contexto para responder."
                .to_string(),
        }
    }
}

/// Synthesis policy: persona, rules, and citation rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SynthesisPolicy {
    pub system_persona: String,
    pub citation_format: String,
    pub synthesis_rules: Vec<String>,
    pub strict_style: Vec<String>,
    pub interpretive_style: Vec<String>,
    pub citation_schema_version: String,
    pub citation_required_fields: Vec<String>,
    pub citation_render_template: String,
    pub citation_noise_filters: Vec<String>,
    pub min_structured_citation_ratio: f64,
}

impl Default for SynthesisPolicy {
    fn default() -> Self {
        Self {
            system_persona:
                "Responde con evidencia del contexto recuperado y evita afirmaciones sin sustento."
                    .to_string(),
            citation_format: "C#/R#".to_string(),
            synthesis_rules: vec![
                "Cada afirmacion relevante debe referenciar evidencia recuperada.".to_string(),
                "Si no hay evidencia suficiente, indicarlo explicitamente.".to_string(),
                "No inventar referencias ni citas.".to_string(),
            ],
            strict_style: vec![
                "Para cada afirmacion: requisito | cita breve | fuente.".to_string(),
                "No inventar texto normativo.".to_string(),
            ],
            interpretive_style: vec![
                "Puedes conectar evidencias separadas, pero transparenta inferencias.".to_string(),
                "Incluye referencias al final de cada punto.".to_string(),
            ],
            citation_schema_version: "v1".to_string(),
            citation_required_fields: vec![
                "id".to_string(),
                "standard".to_string(),
                "clause_id".to_string(),
                "quote".to_string(),
            ],
            citation_render_template: "{id} | {standard} | clausula {clause_id} | \"{snippet}\""
                .to_string(),
            citation_noise_filters: vec![
                "indice".to_string(),
                "prólogo".to_string(),
                "traducción oficial".to_string(),
                "official translation".to_string(),
            ],
            min_structured_citation_ratio: 0.5,
        }
    }
}

/// How subqueries are planned and aggregated for one mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecompositionPolicy {
    pub max_subqueries: usize,
    /// "grouped_map_reduce" enables per-subquery partial answers.
    pub subquery_aggregation_mode: String,
    /// Allow the LLM-assisted planner for this mode.
    pub light_llm_enabled: bool,
}

impl Default for DecompositionPolicy {
    fn default() -> Self {
        Self {
            max_subqueries: 6,
            subquery_aggregation_mode: String::new(),
            light_llm_enabled: false,
        }
    }
}

/// Coverage demands for one mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoverageRequirements {
    /// Defaults to "true when ≥2 scopes are requested" at evaluation time.
    pub require_all_requested_scopes: Option<bool>,
    /// Defaults to 1 for literal modes, 0 otherwise.
    pub min_clause_refs: Option<usize>,
}

/// An expectation checked by the expectation-coverage tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Expectation {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// Any of these appearing in evidence marks the expectation covered.
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub missing_risk: String,
}

/// Per-mode behavior bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueryModeConfig {
    /// Retrieval profile key into `retrieval.by_mode`; defaults to the mode
    /// name itself.
    pub retrieval_profile: Option<String>,
    pub require_literal_evidence: bool,
    pub allow_inference: bool,
    pub response_contract: Option<String>,
    pub tool_hints: Vec<String>,
    /// Ordered tool names executed for this mode.
    pub execution_plan: Vec<String>,
    pub decomposition_policy: DecompositionPolicy,
    pub coverage_requirements: CoverageRequirements,
    pub expectations: Vec<Expectation>,
}

/// One ordered intent-classification rule. The first rule whose keyword,
/// pattern, and marker conditions all hold selects its mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntentRule {
    pub id: String,
    pub mode: String,
    pub all_keywords: Vec<String>,
    pub any_keywords: Vec<String>,
    pub all_patterns: Vec<String>,
    pub any_patterns: Vec<String>,
    /// Virtual tokens such as `__mode__=comparativa` or `__low_confidence__`.
    pub all_markers: Vec<String>,
    pub any_markers: Vec<String>,
}

/// Query-mode policy: mode table, default, and classification rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueryModesPolicy {
    pub default_mode: String,
    pub modes: BTreeMap<String, QueryModeConfig>,
    pub intent_rules: Vec<IntentRule>,
}

impl Default for QueryModesPolicy {
    fn default() -> Self {
        Self {
            default_mode: "explicativa".to_string(),
            modes: BTreeMap::new(),
            intent_rules: Vec::new(),
        }
    }
}

/// Reasoning loop budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReasoningBudget {
    pub max_steps: u32,
    pub max_reflections: u32,
}

impl Default for ReasoningBudget {
    fn default() -> Self {
        Self {
            max_steps: 4,
            max_reflections: 2,
        }
    }
}

/// Per-tool execution override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolPolicy {
    pub timeout_ms: u64,
}

/// Capabilities: which tools the profile may run and under what budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CapabilitiesPolicy {
    pub allowed_tools: Vec<String>,
    pub reasoning_budget: ReasoningBudget,
    pub tool_policies: BTreeMap<String, ToolPolicy>,
}

impl Default for CapabilitiesPolicy {
    fn default() -> Self {
        Self {
            allowed_tools: vec!["semantic_retrieval".to_string()],
            reasoning_budget: ReasoningBudget::default(),
            tool_policies: BTreeMap::new(),
        }
    }
}

/// Interrupt thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InteractionThresholds {
    pub l2_ambiguity: f64,
    pub l3_subqueries: usize,
    pub l3_latency_s: f64,
    pub l3_cost_tokens: u64,
}

impl Default for InteractionThresholds {
    fn default() -> Self {
        Self {
            l2_ambiguity: 0.45,
            l3_subqueries: 6,
            l3_latency_s: 20.0,
            l3_cost_tokens: 12_000,
        }
    }
}

/// Per-mode interaction override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModeInteractionPolicy {
    /// Slots that must be present ("scope", "objective").
    pub required_slots: Vec<String>,
    /// "low", "medium", or "high".
    pub risk_level: String,
    pub require_plan_approval: bool,
}

impl Default for ModeInteractionPolicy {
    fn default() -> Self {
        Self {
            required_slots: Vec::new(),
            risk_level: "low".to_string(),
            require_plan_approval: false,
        }
    }
}

/// Interaction policy: when to interrupt with clarification or plan approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InteractionPolicy {
    pub enabled: bool,
    pub max_interruptions_per_turn: u32,
    pub thresholds: InteractionThresholds,
    pub mode_overrides: BTreeMap<String, ModeInteractionPolicy>,
}

impl Default for InteractionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_interruptions_per_turn: 1,
            thresholds: InteractionThresholds::default(),
            mode_overrides: BTreeMap::new(),
        }
    }
}

/// Complete agent profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentProfile {
    pub profile_id: String,
    pub version: String,
    pub status: ProfileStatus,
    pub meta: ProfileMeta,
    pub identity: IdentityPolicy,
    pub router: RouterHeuristics,
    pub retrieval: RetrievalPolicy,
    pub validation: ValidationPolicy,
    pub synthesis: SynthesisPolicy,
    pub query_modes: QueryModesPolicy,
    pub capabilities: CapabilitiesPolicy,
    pub interaction_policy: InteractionPolicy,
}

impl Default for AgentProfile {
    fn default() -> Self {
        Self {
            profile_id: "base".to_string(),
            version: "1.0.0".to_string(),
            status: ProfileStatus::Active,
            meta: ProfileMeta::default(),
            identity: IdentityPolicy::default(),
            router: RouterHeuristics::default(),
            retrieval: RetrievalPolicy::default(),
            validation: ValidationPolicy::default(),
            synthesis: SynthesisPolicy::default(),
            query_modes: QueryModesPolicy::default(),
            capabilities: CapabilitiesPolicy::default(),
            interaction_policy: InteractionPolicy::default(),
        }
    }
}

impl AgentProfile {
    /// Mode config for a mode name, if declared.
    pub fn mode_config(&self, mode: &str) -> Option<&QueryModeConfig> {
        self.query_modes.modes.get(mode.trim())
    }

    /// Per-mode interaction policy, falling back to defaults.
    pub fn mode_interaction(&self, mode: &str) -> ModeInteractionPolicy {
        self.interaction_policy
            .mode_overrides
            .get(mode.trim())
            .cloned()
            .unwrap_or_default()
    }

    /// Effective maximum reflections, clamped by the hard cap.
    pub fn max_reflections(&self, hard_cap: u32) -> u32 {
        self.capabilities.reasoning_budget.max_reflections.min(hard_cap)
    }

    /// Effective maximum tool steps, clamped by the hard cap.
    pub fn max_steps(&self, hard_cap: u32) -> u32 {
        self.capabilities.reasoning_budget.max_steps.min(hard_cap)
    }
}

/// Where a resolved profile came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileSource {
    Store,
    TenantMap,
    TenantFile,
    Base,
}

/// Resolution record attached to retrieval diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileResolution {
    pub source: ProfileSource,
    pub requested_profile_id: Option<String>,
    pub applied_profile_id: String,
    pub decision_reason: String,
}
