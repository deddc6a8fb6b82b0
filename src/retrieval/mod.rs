//! Multi-strategy retrieval: subquery planning, strategy ladder, coverage
//! repair, and score/noise policies.

mod coverage;
mod filters;
mod flow;
mod fusion;
mod subquery;

pub use coverage::{
    decide_multihop_fallback, find_missing_clause_refs, find_missing_scopes, CoverageDecision,
};
pub use filters::{filter_by_min_score, reduce_structural_noise, record_layer_counts, BackstopPolicy};
pub use flow::{normalize_evidence, RetrievalArgs, RetrievalFlow, RetrievalRun};
pub use fusion::reciprocal_rank_fusion;
pub use subquery::{
    apply_search_hints, build_deterministic_subqueries, ensure_scope_coverage,
    DeterministicSubqueryPlanner, HybridSubqueryPlanner, LlmSubqueryPlanner, SubqueryPlanner,
    SubqueryPlanningContext,
};
