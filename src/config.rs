//! Kernel configuration.
//!
//! All tunables live in a single [`KernelConfig`] built at startup and
//! threaded through constructors. Nothing reads configuration from global
//! state after initialization.

use serde::{Deserialize, Serialize};

/// Which retrieval contract surface the kernel talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContractMode {
    /// Per-endpoint contract: validate-scope + hybrid, with kernel-side
    /// subquery fan-out and local RRF merging.
    #[default]
    Advanced,
    /// Single comprehensive endpoint; multi-query merging happens server
    /// side through `/api/v1/retrieval/multi-query`.
    Comprehensive,
    /// Minimal hybrid-only contract, no multi-query strategies.
    Legacy,
}

/// Per-stage timeout budgets in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTimeouts {
    /// Intent classification budget.
    pub classify_ms: u64,
    /// Plan construction budget.
    pub plan_ms: u64,
    /// Default per-tool execution budget.
    pub execute_tool_ms: u64,
    /// Answer synthesis budget.
    pub generate_ms: u64,
    /// Citation validation budget.
    pub validate_ms: u64,
    /// Hybrid retrieval stage budget.
    pub retrieval_hybrid_ms: u64,
    /// Multi-query retrieval stage budget.
    pub retrieval_multi_query_ms: u64,
    /// Coverage-repair stage budget.
    pub retrieval_coverage_repair_ms: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            classify_ms: 2_000,
            plan_ms: 3_000,
            execute_tool_ms: 30_000,
            generate_ms: 15_000,
            validate_ms: 5_000,
            retrieval_hybrid_ms: 1_800,
            retrieval_multi_query_ms: 1_800,
            retrieval_coverage_repair_ms: 800,
        }
    }
}

/// Backend selector endpoints and probe policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Primary (local) RAG engine base URL.
    pub local_url: String,
    /// Secondary RAG engine base URL.
    pub secondary_url: String,
    /// Health probe path on the primary.
    pub health_path: String,
    /// Probe timeout in milliseconds.
    pub probe_timeout_ms: u64,
    /// How long a probe result stays cached.
    pub ttl_seconds: u64,
    /// Forced backend name ("local"/"secondary"); bypasses probing.
    pub force_backend: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            local_url: "http://localhost:8000".to_string(),
            secondary_url: "http://localhost:8000".to_string(),
            health_path: "/health".to_string(),
            probe_timeout_ms: 300,
            ttl_seconds: 20,
            force_backend: None,
        }
    }
}

/// Kernel-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Retrieval contract surface.
    pub retrieval_contract: ContractMode,
    /// Total wall-clock budget per query in milliseconds.
    pub total_timeout_ms: u64,
    /// Per-stage budgets.
    pub stage_timeouts: StageTimeouts,
    /// Run multi-query as the primary strategy for multihop queries.
    pub multi_query_primary: bool,
    /// Append a step-back query and retry once when the primary multi-query
    /// pass is insufficient.
    pub multi_query_refine: bool,
    /// Enable the multihop multi-query fallback after hybrid.
    pub multihop_fallback: bool,
    /// Minimum merged items for a multi-query pass to be accepted.
    pub multi_query_min_items: usize,
    /// Cap on subqueries when multi-query runs as a fallback.
    pub multi_query_fallback_max_queries: usize,
    /// Enable the post-retrieval coverage gate.
    pub coverage_gate_enabled: bool,
    /// Cap on missing scopes/clauses repaired per pass.
    pub coverage_gate_max_missing: usize,
    /// Enable the step-back repair pass when gaps remain.
    pub coverage_gate_step_back: bool,
    /// Skip the multihop fallback when hybrid already covers every scope.
    pub early_exit_coverage: bool,
    /// Keep the best below-threshold items when the min-score filter would
    /// drop everything.
    pub min_score_backstop_enabled: bool,
    /// How many dropped items the backstop keeps.
    pub min_score_backstop_top_n: usize,
    /// Append a semantic tail to deterministic per-scope subqueries.
    pub deterministic_subquery_semantic_tail: bool,
    /// Enable the LLM-assisted subquery planner.
    pub light_planner_enabled: bool,
    /// Light planner timeout in milliseconds.
    pub light_planner_timeout_ms: u64,
    /// Enable grouped map-reduce aggregation regardless of mode policy.
    pub subquery_grouped_map_reduce: bool,
    /// Cap on groups summarized by the aggregation node.
    pub subquery_map_max_subqueries: usize,
    /// Evidence items kept per group during aggregation.
    pub subquery_map_items_per_subquery: usize,
    /// Backend endpoints and probing.
    pub backend: BackendConfig,
    /// Shared secret sent as `X-Service-Secret`. Mandatory.
    pub service_secret: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            retrieval_contract: ContractMode::Advanced,
            total_timeout_ms: 60_000,
            stage_timeouts: StageTimeouts::default(),
            multi_query_primary: false,
            multi_query_refine: false,
            multihop_fallback: true,
            multi_query_min_items: 6,
            multi_query_fallback_max_queries: 3,
            coverage_gate_enabled: true,
            coverage_gate_max_missing: 2,
            coverage_gate_step_back: true,
            early_exit_coverage: true,
            min_score_backstop_enabled: false,
            min_score_backstop_top_n: 6,
            deterministic_subquery_semantic_tail: false,
            light_planner_enabled: false,
            light_planner_timeout_ms: 600,
            subquery_grouped_map_reduce: false,
            subquery_map_max_subqueries: 8,
            subquery_map_items_per_subquery: 5,
            backend: BackendConfig::default(),
            service_secret: String::new(),
        }
    }
}

impl KernelConfig {
    /// Create a configuration with the mandatory service secret set.
    pub fn new(service_secret: impl Into<String>) -> Self {
        Self {
            service_secret: service_secret.into(),
            ..Self::default()
        }
    }

    /// Set the total wall-clock budget.
    pub fn with_total_timeout_ms(mut self, ms: u64) -> Self {
        self.total_timeout_ms = ms;
        self
    }

    /// Set the retrieval contract mode.
    pub fn with_contract_mode(mut self, mode: ContractMode) -> Self {
        self.retrieval_contract = mode;
        self
    }

    /// Set backend endpoints.
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    /// Validate invariants that must hold before any query runs.
    ///
    /// The shared secret is the one piece of configuration that must not be
    /// defaulted; a kernel without it cannot authenticate to the RAG engine.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.service_secret.trim().is_empty() {
            return Err(crate::error::Error::Config(
                "service_secret must be configured".to_string(),
            ));
        }
        if self.total_timeout_ms == 0 {
            return Err(crate::error::Error::Config(
                "total_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_rejects_missing_secret() {
        let config = KernelConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_new_with_secret_validates() {
        let config = KernelConfig::new("s3cret");
        assert!(config.validate().is_ok());
        assert_eq!(config.retrieval_contract, ContractMode::Advanced);
        assert_eq!(config.multi_query_min_items, 6);
    }

    #[test]
    fn test_builder_chain() {
        let config = KernelConfig::new("s3cret")
            .with_total_timeout_ms(2_000)
            .with_contract_mode(ContractMode::Legacy);
        assert_eq!(config.total_timeout_ms, 2_000);
        assert_eq!(config.retrieval_contract, ContractMode::Legacy);
    }
}
