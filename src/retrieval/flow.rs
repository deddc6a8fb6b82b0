//! Multi-strategy retrieval pipeline behind the `semantic_retrieval` tool.
//!
//! Strategies run in a ladder: optional multi-query primary, hybrid
//! baseline, multihop multi-query fallback. Every stage runs under its own
//! deadline; failures degrade to whatever evidence is already in hand
//! instead of escaping through the tool boundary.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::codes::{
    merge_error_codes, RETRIEVAL_CLAUSE_MISSING, RETRIEVAL_SCOPE_MISMATCH, RETRIEVAL_TIMEOUT,
    RETRIEVAL_UPSTREAM_UNAVAILABLE,
};
use crate::config::{ContractMode, KernelConfig};
use crate::contract::{
    ContractPort, HybridRequest, MergeConfig, MultiQueryRequest, MultiQueryResponse,
    RequestContext,
};
use crate::error::{Error, Result};
use crate::model::{
    CoverageGateTrace, EvidenceItem, ModePolicyTrace, RetrievalDiagnostics, RetrievalPlan,
    RetrievalTrace, SubqueryGroup, SubqueryRequest,
};
use crate::profile::AgentProfile;
use crate::router::extract_clause_refs;

use super::coverage::{decide_multihop_fallback, find_missing_clause_refs, find_missing_scopes};
use super::filters::{
    filter_by_min_score, record_layer_counts, reduce_structural_noise, BackstopPolicy,
};
use super::fusion::reciprocal_rank_fusion;
use super::subquery::{
    apply_search_hints, SubqueryPlanner, SubqueryPlanningContext, STEP_BACK_PREFIX,
};

const RRF_K: u32 = 60;
const MIN_STAGE_TIMEOUT_MS: u64 = 25;
const QUERY_TEXT_LIMIT: usize = 900;

/// Inputs for one retrieval pass.
pub struct RetrievalArgs<'a> {
    pub query: &'a str,
    pub plan: &'a RetrievalPlan,
    pub profile: &'a AgentProfile,
    pub ctx: &'a RequestContext,
    /// Filters normalized by scope validation, overriding the plan's.
    pub validated_filters: Option<Value>,
    /// Scope-validation payload to embed in diagnostics.
    pub scope_payload: Value,
    /// Total-budget deadline; stages shrink their timeouts to fit.
    pub deadline: Option<Instant>,
}

/// Evidence plus diagnostics from one retrieval pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalRun {
    pub evidence: Vec<EvidenceItem>,
    pub groups: Vec<SubqueryGroup>,
    pub diagnostics: RetrievalDiagnostics,
}

/// The retrieval flow. Cheap to clone per query; holds shared components.
pub struct RetrievalFlow {
    contract: Arc<dyn ContractPort>,
    planner: Arc<dyn SubqueryPlanner>,
    config: Arc<KernelConfig>,
}

struct PassPolicy {
    require_all_scopes: bool,
    min_clause_refs: usize,
    max_subqueries: usize,
    k: u32,
    fetch_k: u32,
}

impl RetrievalFlow {
    pub fn new(
        contract: Arc<dyn ContractPort>,
        planner: Arc<dyn SubqueryPlanner>,
        config: Arc<KernelConfig>,
    ) -> Self {
        Self {
            contract,
            planner,
            config,
        }
    }

    fn contract_label(&self) -> &'static str {
        match self.config.retrieval_contract {
            ContractMode::Advanced => "advanced",
            ContractMode::Comprehensive => "comprehensive",
            ContractMode::Legacy => "legacy",
        }
    }

    fn stage_timeout(&self, default_ms: u64, deadline: Option<Instant>, headroom_ms: u64) -> Duration {
        let default_ms = default_ms.max(MIN_STAGE_TIMEOUT_MS);
        let Some(deadline) = deadline else {
            return Duration::from_millis(default_ms);
        };
        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .as_millis() as u64;
        let budget = remaining.saturating_sub(headroom_ms);
        Duration::from_millis(default_ms.min(budget).max(MIN_STAGE_TIMEOUT_MS))
    }

    /// Execute the retrieval ladder for one query.
    ///
    /// Returns an error only when the hybrid baseline itself is unreachable
    /// and no earlier strategy produced evidence.
    pub async fn execute(&self, args: &RetrievalArgs<'_>) -> Result<RetrievalRun> {
        let plan = args.plan;
        if plan.chunk_k == 0 {
            let mut diagnostics = RetrievalDiagnostics::empty(self.contract_label());
            diagnostics.strategy = "hybrid".to_string();
            diagnostics.scope_validation = args.scope_payload.clone();
            return Ok(RetrievalRun {
                evidence: Vec::new(),
                groups: Vec::new(),
                diagnostics,
            });
        }

        let (expanded_query, hint_trace) = apply_search_hints(args.query, args.profile);
        let clause_refs = extract_clause_refs(&expanded_query, args.profile);
        let multihop_hint = plan.requested_standards.len() >= 2 || clause_refs.len() >= 2;

        let mode_cfg = args.profile.mode_config(&plan.mode);
        let coverage = mode_cfg
            .map(|cfg| cfg.coverage_requirements.clone())
            .unwrap_or_default();
        let decomposition = mode_cfg
            .map(|cfg| cfg.decomposition_policy.clone())
            .unwrap_or_default();

        let literal = matches!(plan.mode.as_str(), "literal_normativa" | "literal_lista")
            || plan.require_literal_evidence;
        let cross_scope = plan.requested_standards.len() >= 2 && !literal;
        let policy = PassPolicy {
            require_all_scopes: coverage
                .require_all_requested_scopes
                .unwrap_or(plan.requested_standards.len() >= 2),
            min_clause_refs: coverage
                .min_clause_refs
                .unwrap_or(usize::from(plan.require_literal_evidence))
                .min(6),
            max_subqueries: decomposition.max_subqueries.clamp(2, 12),
            k: plan.chunk_k.min(if cross_scope { 24 } else { 18 }).max(1),
            fetch_k: plan.chunk_fetch_k.max(1),
        };

        let filters = args.validated_filters.clone().or_else(|| {
            (!plan.requested_standards.is_empty())
                .then(|| json!({ "source_standards": plan.requested_standards }))
        });

        let planning_ctx = SubqueryPlanningContext {
            query: args.query,
            requested_standards: &plan.requested_standards,
            max_queries: policy.max_subqueries,
            mode: &plan.mode,
            require_literal_evidence: plan.require_literal_evidence,
            include_semantic_tail: self.config.deterministic_subquery_semantic_tail,
            profile: args.profile,
            decomposition: &decomposition,
        };

        // 1. Multi-query primary.
        if self.config.multi_query_primary
            && self.config.retrieval_contract != ContractMode::Legacy
            && multihop_hint
        {
            let mut subqueries = self.planner.plan(&planning_ctx).await;
            if let Some(run) = self
                .multi_query_primary_pass(args, &policy, &clause_refs, &expanded_query, &hint_trace, &mut subqueries)
                .await
            {
                return Ok(run);
            }
        }

        // 2. Hybrid baseline.
        let mut trace = RetrievalTrace::default();
        trace.search_hint_expansions = hint_trace.clone();
        trace.mode_policy = Some(ModePolicyTrace {
            require_all_requested_scopes: policy.require_all_scopes,
            min_clause_refs: policy.min_clause_refs,
            max_subqueries: policy.max_subqueries,
        });

        let hybrid_timeout = self.stage_timeout(
            self.config.stage_timeouts.retrieval_hybrid_ms,
            args.deadline,
            0,
        );
        let hybrid_started = Instant::now();
        let hybrid_request = HybridRequest {
            query: expanded_query.clone(),
            tenant_id: args.ctx.tenant_id.clone(),
            collection_id: args.ctx.collection_id.clone(),
            k: policy.k,
            fetch_k: policy.fetch_k,
            filters: filters.clone(),
            rerank: json!({ "enabled": true }),
            graph: json!({ "max_hops": 2 }),
        };
        let hybrid_outcome = tokio::time::timeout(
            hybrid_timeout,
            self.contract.hybrid(hybrid_request, args.ctx),
        )
        .await;
        trace.timings_ms.insert(
            "hybrid".to_string(),
            hybrid_started.elapsed().as_secs_f64() * 1000.0,
        );

        let mut hybrid_failed = false;
        let mut items: Vec<EvidenceItem> = Vec::new();
        match hybrid_outcome {
            Ok(Ok(response)) => {
                if !response.trace.is_null() {
                    trace.hybrid_trace = Some(response.trace.clone());
                }
                items = normalize_evidence(response.items);
            }
            Ok(Err(error)) => {
                warn!(error = %error, "hybrid_retrieval_failed");
                hybrid_failed = true;
                trace.error_codes = merge_error_codes([
                    std::mem::take(&mut trace.error_codes),
                    vec![RETRIEVAL_UPSTREAM_UNAVAILABLE.to_string()],
                ]);
            }
            Err(_) => {
                warn!(timeout_ms = hybrid_timeout.as_millis() as u64, "hybrid_retrieval_timeout");
                hybrid_failed = true;
                trace.error_codes = merge_error_codes([
                    std::mem::take(&mut trace.error_codes),
                    vec![RETRIEVAL_TIMEOUT.to_string()],
                ]);
            }
        }
        items = filter_by_min_score(
            items,
            Some(args.profile.retrieval.min_score),
            self.backstop(),
            &mut trace,
        );

        // 3. Multihop fallback.
        if self.config.multihop_fallback
            && self.config.retrieval_contract != ContractMode::Legacy
            && multihop_hint
        {
            if self.config.early_exit_coverage && plan.requested_standards.len() >= 2 {
                let missing_before = find_missing_scopes(
                    &items,
                    &plan.requested_standards,
                    policy.require_all_scopes,
                );
                if missing_before.is_empty() {
                    trace.multi_query_fallback_skipped =
                        Some("coverage_already_satisfied".to_string());
                    return Ok(self
                        .finish_hybrid(args, &policy, &clause_refs, &expanded_query, items, trace)
                        .await);
                }
            }

            let decision = decide_multihop_fallback(
                &clause_refs,
                &plan.requested_standards,
                &items,
                trace.hybrid_trace.as_ref(),
                12,
            );
            if decision.needs_fallback {
                let missing_before = find_missing_scopes(
                    &items,
                    &plan.requested_standards,
                    policy.require_all_scopes,
                );
                let mut subqueries = self.planner.plan(&planning_ctx).await;
                let fallback_max = self
                    .config
                    .multi_query_fallback_max_queries
                    .max(2)
                    .min(policy.max_subqueries);
                subqueries.truncate(fallback_max);

                let mq_timeout = self.stage_timeout(
                    self.config.stage_timeouts.retrieval_multi_query_ms,
                    args.deadline,
                    0,
                );
                let mq_started = Instant::now();
                let mq_outcome = self
                    .run_multi_query(&subqueries, &policy, mq_timeout, args.ctx)
                    .await;
                trace.timings_ms.insert(
                    "multi_query_fallback".to_string(),
                    mq_started.elapsed().as_secs_f64() * 1000.0,
                );

                let response = match mq_outcome {
                    Ok(response) => response,
                    Err(error) => {
                        // Graceful degradation: hybrid items instead of nothing.
                        warn!(
                            error = %error,
                            hybrid_items = items.len(),
                            "multi_query_fallback_failed_using_hybrid"
                        );
                        let mut diag_trace = trace.clone();
                        diag_trace.fallback_reason = Some(format!("error: {error}"));
                        let items = reduce_structural_noise(items, args.query);
                        let mut diagnostics = RetrievalDiagnostics {
                            contract: self.contract_label().to_string(),
                            strategy: "hybrid".to_string(),
                            partial: true,
                            trace: diag_trace,
                            scope_validation: args.scope_payload.clone(),
                        };
                        record_layer_counts(&items, &mut diagnostics.trace);
                        return Ok(RetrievalRun {
                            evidence: items,
                            groups: Vec::new(),
                            diagnostics,
                        });
                    }
                };

                let mut fb_trace = trace.clone();
                fb_trace.fallback_reason = Some(decision.reason.clone());
                fb_trace.error_codes = merge_error_codes([
                    std::mem::take(&mut fb_trace.error_codes),
                    vec![decision.code.clone()],
                ]);
                fb_trace.subqueries = response.subqueries.clone();

                let mut mq_items = filter_by_min_score(
                    normalize_evidence(response.items),
                    Some(args.profile.retrieval.min_score),
                    self.backstop(),
                    &mut fb_trace,
                );
                mq_items = reduce_structural_noise(mq_items, args.query);

                let missing_after = find_missing_scopes(
                    &mq_items,
                    &plan.requested_standards,
                    policy.require_all_scopes,
                );
                if self.config.early_exit_coverage
                    && plan.requested_standards.len() >= 2
                    && missing_after.len() >= missing_before.len()
                {
                    fb_trace.multi_query_fallback_early_exit =
                        Some("no_coverage_improvement".to_string());
                    fb_trace.missing_scopes_before = missing_before;
                    fb_trace.missing_scopes_after = missing_after.clone();
                    if !missing_after.is_empty() {
                        fb_trace.error_codes = merge_error_codes([
                            std::mem::take(&mut fb_trace.error_codes),
                            vec![RETRIEVAL_SCOPE_MISMATCH.to_string()],
                        ]);
                    }
                    record_layer_counts(&mq_items, &mut fb_trace);
                    return Ok(RetrievalRun {
                        evidence: mq_items,
                        groups: fb_trace.subqueries.clone(),
                        diagnostics: RetrievalDiagnostics {
                            contract: self.contract_label().to_string(),
                            strategy: "multi_query".to_string(),
                            partial: response.partial,
                            trace: fb_trace,
                            scope_validation: args.scope_payload.clone(),
                        },
                    });
                }

                let mut repaired = self
                    .coverage_repair(
                        mq_items,
                        &mut fb_trace,
                        "multi_query_fallback",
                        args,
                        &policy,
                        &clause_refs,
                        &expanded_query,
                    )
                    .await;
                repaired = filter_by_min_score(
                    repaired,
                    Some(args.profile.retrieval.min_score),
                    self.backstop(),
                    &mut fb_trace,
                );
                repaired = reduce_structural_noise(repaired, args.query);
                record_layer_counts(&repaired, &mut fb_trace);
                let groups = fb_trace.subqueries.clone();
                return Ok(RetrievalRun {
                    evidence: repaired,
                    groups,
                    diagnostics: RetrievalDiagnostics {
                        contract: self.contract_label().to_string(),
                        strategy: "multi_query".to_string(),
                        partial: response.partial,
                        trace: fb_trace,
                        scope_validation: args.scope_payload.clone(),
                    },
                });
            }
        }

        // 4. Hybrid with coverage repair.
        if hybrid_failed && items.is_empty() {
            return Err(Error::contract("hybrid", RETRIEVAL_UPSTREAM_UNAVAILABLE));
        }
        Ok(self
            .finish_hybrid(args, &policy, &clause_refs, &expanded_query, items, trace)
            .await)
    }

    fn backstop(&self) -> BackstopPolicy {
        BackstopPolicy {
            enabled: self.config.min_score_backstop_enabled,
            top_n: self.config.min_score_backstop_top_n,
        }
    }

    async fn multi_query_primary_pass(
        &self,
        args: &RetrievalArgs<'_>,
        policy: &PassPolicy,
        clause_refs: &[String],
        expanded_query: &str,
        hint_trace: &std::collections::BTreeMap<String, Vec<String>>,
        subqueries: &mut Vec<SubqueryRequest>,
    ) -> Option<RetrievalRun> {
        let mut trace = RetrievalTrace {
            promoted_reason: Some("complex_intent".to_string()),
            search_hint_expansions: hint_trace.clone(),
            ..Default::default()
        };
        let timeout = self.stage_timeout(
            self.config.stage_timeouts.retrieval_multi_query_ms,
            args.deadline,
            0,
        );
        let started = Instant::now();
        let outcome = self
            .run_multi_query(subqueries, policy, timeout, args.ctx)
            .await;
        trace.timings_ms.insert(
            "multi_query_primary".to_string(),
            started.elapsed().as_secs_f64() * 1000.0,
        );
        let response = match outcome {
            Ok(response) => response,
            Err(error) => {
                debug!(error = %error, "multi_query_primary_failed");
                return None;
            }
        };

        let min_items = self.config.multi_query_min_items.max(1);
        if response.items.len() >= min_items {
            trace.subqueries = response.subqueries.clone();
            let accepted = self
                .accept_multi_query(args, policy, clause_refs, expanded_query, response, trace, "multi_query_primary")
                .await;
            return Some(accepted);
        }

        if !self.config.multi_query_refine {
            return None;
        }
        // Refine: append a step-back query and retry once.
        let mut step_back =
            SubqueryRequest::new("step_back", format!("{STEP_BACK_PREFIX}: {expanded_query}"));
        if !args.plan.requested_standards.is_empty() {
            step_back = step_back
                .with_filters(json!({ "source_standards": args.plan.requested_standards }));
        }
        subqueries.push(step_back);
        let started = Instant::now();
        let outcome = self
            .run_multi_query(subqueries, policy, timeout, args.ctx)
            .await;
        trace.timings_ms.insert(
            "multi_query_refine".to_string(),
            started.elapsed().as_secs_f64() * 1000.0,
        );
        let response = match outcome {
            Ok(response) => response,
            Err(error) => {
                debug!(error = %error, "multi_query_refine_failed");
                return None;
            }
        };
        if response.items.len() < min_items {
            return None;
        }
        trace.refine_reason = Some("insufficient_primary_multi_query".to_string());
        trace.subqueries = response.subqueries.clone();
        let accepted = self
            .accept_multi_query(args, policy, clause_refs, expanded_query, response, trace, "multi_query_refined")
            .await;
        Some(accepted)
    }

    async fn accept_multi_query(
        &self,
        args: &RetrievalArgs<'_>,
        policy: &PassPolicy,
        clause_refs: &[String],
        expanded_query: &str,
        response: MultiQueryResponse,
        mut trace: RetrievalTrace,
        strategy: &str,
    ) -> RetrievalRun {
        let mut items = filter_by_min_score(
            normalize_evidence(response.items),
            Some(args.profile.retrieval.min_score),
            self.backstop(),
            &mut trace,
        );
        items = reduce_structural_noise(items, args.query);
        items = self
            .coverage_repair(items, &mut trace, strategy, args, policy, clause_refs, expanded_query)
            .await;
        items = filter_by_min_score(
            items,
            Some(args.profile.retrieval.min_score),
            self.backstop(),
            &mut trace,
        );
        items = reduce_structural_noise(items, args.query);
        record_layer_counts(&items, &mut trace);
        let groups = trace.subqueries.clone();
        RetrievalRun {
            evidence: items,
            groups,
            diagnostics: RetrievalDiagnostics {
                contract: self.contract_label().to_string(),
                strategy: strategy.to_string(),
                partial: response.partial,
                trace,
                scope_validation: args.scope_payload.clone(),
            },
        }
    }

    async fn finish_hybrid(
        &self,
        args: &RetrievalArgs<'_>,
        policy: &PassPolicy,
        clause_refs: &[String],
        expanded_query: &str,
        items: Vec<EvidenceItem>,
        mut trace: RetrievalTrace,
    ) -> RetrievalRun {
        let mut items = self
            .coverage_repair(items, &mut trace, "hybrid", args, policy, clause_refs, expanded_query)
            .await;
        items = filter_by_min_score(
            items,
            Some(args.profile.retrieval.min_score),
            self.backstop(),
            &mut trace,
        );
        items = reduce_structural_noise(items, args.query);
        record_layer_counts(&items, &mut trace);
        RetrievalRun {
            evidence: items,
            groups: trace.subqueries.clone(),
            diagnostics: RetrievalDiagnostics {
                contract: self.contract_label().to_string(),
                strategy: "hybrid".to_string(),
                partial: false,
                trace,
                scope_validation: args.scope_payload.clone(),
            },
        }
    }

    /// Run a set of subqueries and merge their results deterministically.
    ///
    /// In comprehensive mode the contract's multi-query endpoint does the
    /// merge. Otherwise the kernel fans out one hybrid call per subquery
    /// inside the stage deadline; dropping the joined future on timeout
    /// cancels every sibling. Per-subquery failures leave an empty slot in
    /// the fixed-size result vector and mark the response partial.
    async fn run_multi_query(
        &self,
        subqueries: &[SubqueryRequest],
        policy: &PassPolicy,
        timeout: Duration,
        ctx: &RequestContext,
    ) -> Result<MultiQueryResponse> {
        if subqueries.is_empty() {
            return Ok(MultiQueryResponse::default());
        }
        let top_k = policy.k.max(12).min(16) as usize;
        let merge = MergeConfig::rrf(RRF_K, top_k);

        if self.config.retrieval_contract == ContractMode::Comprehensive {
            let request = MultiQueryRequest {
                queries: subqueries.to_vec(),
                merge,
                tenant_id: ctx.tenant_id.clone(),
                collection_id: ctx.collection_id.clone(),
            };
            return tokio::time::timeout(timeout, self.contract.multi_query(request, ctx))
                .await
                .map_err(|_| Error::timeout("multi_query", timeout.as_millis() as u64))?;
        }

        let calls = subqueries.iter().map(|subquery| {
            let request = HybridRequest {
                query: subquery.query.clone(),
                tenant_id: ctx.tenant_id.clone(),
                collection_id: ctx.collection_id.clone(),
                k: subquery.k.unwrap_or(policy.k),
                fetch_k: subquery.fetch_k.unwrap_or(policy.fetch_k),
                filters: subquery.filters.clone(),
                rerank: json!({ "enabled": true }),
                graph: json!({ "max_hops": 2 }),
            };
            self.contract.hybrid(request, ctx)
        });
        let results = tokio::time::timeout(timeout, join_all(calls))
            .await
            .map_err(|_| Error::timeout("multi_query_fanout", timeout.as_millis() as u64))?;

        let mut partial = false;
        let mut lists: Vec<Vec<EvidenceItem>> = Vec::with_capacity(subqueries.len());
        let mut groups: Vec<SubqueryGroup> = Vec::with_capacity(subqueries.len());
        for (subquery, result) in subqueries.iter().zip(results) {
            let items = match result {
                Ok(response) => {
                    partial |= response.partial;
                    normalize_evidence(response.items)
                }
                Err(error) => {
                    warn!(subquery = %subquery.id, error = %error, "subquery_failed");
                    partial = true;
                    Vec::new()
                }
            };
            groups.push(SubqueryGroup {
                id: subquery.id.clone(),
                query: subquery.query.clone(),
                items: items.clone(),
            });
            lists.push(items);
        }
        let items = reciprocal_rank_fusion(&lists, RRF_K, top_k);
        Ok(MultiQueryResponse {
            items,
            trace: Value::Null,
            subqueries: groups,
            partial,
        })
    }

    /// Repair coverage gaps with focused subqueries, then optionally with a
    /// step-back pass. Best-effort: failures return the original items.
    #[allow(clippy::too_many_arguments)]
    async fn coverage_repair(
        &self,
        items: Vec<EvidenceItem>,
        trace: &mut RetrievalTrace,
        reason: &str,
        args: &RetrievalArgs<'_>,
        policy: &PassPolicy,
        clause_refs: &[String],
        expanded_query: &str,
    ) -> Vec<EvidenceItem> {
        if !self.config.coverage_gate_enabled
            || self.config.retrieval_contract == ContractMode::Legacy
        {
            return items;
        }
        let plan = args.plan;
        let missing_scopes = find_missing_scopes(
            &items,
            &plan.requested_standards,
            policy.require_all_scopes,
        );
        let missing_clauses =
            find_missing_clause_refs(&items, clause_refs, policy.min_clause_refs);
        if missing_scopes.is_empty() && missing_clauses.is_empty() {
            trace.missing_scopes.clear();
            trace.missing_clause_refs.clear();
            return items;
        }

        let cap = self.config.coverage_gate_max_missing.max(1);
        let missing_scopes: Vec<String> = missing_scopes.into_iter().take(cap).collect();
        let missing_clauses: Vec<String> = missing_clauses.into_iter().take(cap).collect();

        let mut focused: Vec<SubqueryRequest> = Vec::new();
        for (index, scope) in missing_scopes.iter().enumerate() {
            let mut parts: Vec<&str> = vec![scope.as_str()];
            parts.extend(clause_refs.iter().take(3).map(String::as_str));
            parts.push(expanded_query);
            let text: String = parts.join(" ").chars().take(QUERY_TEXT_LIMIT).collect();
            focused.push(
                SubqueryRequest::new(format!("scope_repair_{}", index + 1), text)
                    .with_filters(json!({ "source_standard": scope })),
            );
        }
        for (index, clause) in missing_clauses.iter().enumerate() {
            let text: String = format!("{expanded_query} clausula {clause}")
                .chars()
                .take(QUERY_TEXT_LIMIT)
                .collect();
            let mut filters = json!({ "metadata": { "clause_id": clause } });
            if !plan.requested_standards.is_empty() {
                filters["source_standards"] = json!(plan.requested_standards);
            }
            focused.push(
                SubqueryRequest::new(format!("clause_repair_{}", index + 1), text)
                    .with_filters(filters),
            );
        }

        let repair_policy = PassPolicy {
            require_all_scopes: policy.require_all_scopes,
            min_clause_refs: policy.min_clause_refs,
            max_subqueries: policy.max_subqueries,
            k: policy.k.max(12).min(18),
            fetch_k: policy.fetch_k,
        };
        let timeout = self.stage_timeout(
            self.config.stage_timeouts.retrieval_coverage_repair_ms,
            args.deadline,
            0,
        );
        let started = Instant::now();
        let outcome = self
            .run_multi_query(&focused, &repair_policy, timeout, args.ctx)
            .await;
        trace.timings_ms.insert(
            "coverage_gate".to_string(),
            started.elapsed().as_secs_f64() * 1000.0,
        );

        let repair_items = match outcome {
            Ok(response) => normalize_evidence(response.items),
            Err(error) => {
                trace.coverage_gate = Some(CoverageGateTrace {
                    trigger_reason: reason.to_string(),
                    missing_scopes: missing_scopes.clone(),
                    missing_clause_refs: missing_clauses.clone(),
                    error: Some(format!("coverage_gate_timeout: {error}")),
                    ..Default::default()
                });
                return items;
            }
        };

        if repair_items.is_empty() {
            trace.coverage_gate = Some(CoverageGateTrace {
                trigger_reason: reason.to_string(),
                missing_scopes: missing_scopes.clone(),
                missing_clause_refs: missing_clauses.clone(),
                added_queries: focused.iter().map(|sq| sq.id.clone()).collect(),
                final_missing_scopes: missing_scopes.clone(),
                final_missing_clause_refs: missing_clauses.clone(),
                ..Default::default()
            });
            trace.missing_scopes = missing_scopes.clone();
            trace.missing_clause_refs = missing_clauses.clone();
            let mut codes = Vec::new();
            if !missing_scopes.is_empty() {
                codes.push(RETRIEVAL_SCOPE_MISMATCH.to_string());
            }
            if !missing_clauses.is_empty() {
                codes.push(RETRIEVAL_CLAUSE_MISSING.to_string());
            }
            trace.error_codes =
                merge_error_codes([std::mem::take(&mut trace.error_codes), codes]);
            return items;
        }

        let mut merged = dedup_merge(items, repair_items);
        let mut gate = CoverageGateTrace {
            trigger_reason: reason.to_string(),
            missing_scopes: missing_scopes.clone(),
            missing_clause_refs: missing_clauses.clone(),
            added_queries: focused.iter().map(|sq| sq.id.clone()).collect(),
            ..Default::default()
        };

        // Step-back pass for whatever is still missing.
        let remaining_scopes = find_missing_scopes(
            &merged,
            &plan.requested_standards,
            policy.require_all_scopes,
        );
        let remaining_clauses =
            find_missing_clause_refs(&merged, clause_refs, policy.min_clause_refs);
        if (!remaining_scopes.is_empty() || !remaining_clauses.is_empty())
            && self.config.coverage_gate_step_back
        {
            let remaining_scopes: Vec<String> =
                remaining_scopes.into_iter().take(cap).collect();
            let remaining_clauses: Vec<String> =
                remaining_clauses.into_iter().take(cap).collect();
            let mut step_back: Vec<SubqueryRequest> = Vec::new();
            for (index, scope) in remaining_scopes.iter().enumerate() {
                step_back.push(
                    SubqueryRequest::new(
                        format!("scope_step_back_{}", index + 1),
                        format!("{STEP_BACK_PREFIX} con: {expanded_query}"),
                    )
                    .with_filters(json!({ "source_standard": scope })),
                );
            }
            for (index, clause) in remaining_clauses.iter().enumerate() {
                let text: String =
                    format!("{STEP_BACK_PREFIX} con: {expanded_query} clausula {clause}")
                        .chars()
                        .take(QUERY_TEXT_LIMIT)
                        .collect();
                let mut filters = json!({ "metadata": { "clause_id": clause } });
                if !plan.requested_standards.is_empty() {
                    filters["source_standards"] = json!(plan.requested_standards);
                }
                step_back.push(
                    SubqueryRequest::new(format!("clause_step_back_{}", index + 1), text)
                        .with_filters(filters),
                );
            }

            let started = Instant::now();
            let outcome = self
                .run_multi_query(&step_back, &repair_policy, timeout, args.ctx)
                .await;
            trace.timings_ms.insert(
                "coverage_gate_step_back".to_string(),
                started.elapsed().as_secs_f64() * 1000.0,
            );
            if let Ok(response) = outcome {
                let step_items = normalize_evidence(response.items);
                if !step_items.is_empty() {
                    merged = dedup_merge(merged, step_items);
                    gate.step_back_queries =
                        step_back.iter().map(|sq| sq.id.clone()).collect();
                }
            }
        }

        let final_scopes = find_missing_scopes(
            &merged,
            &plan.requested_standards,
            policy.require_all_scopes,
        );
        let final_clauses =
            find_missing_clause_refs(&merged, clause_refs, policy.min_clause_refs);
        gate.final_missing_scopes = final_scopes.clone();
        gate.final_missing_clause_refs = final_clauses.clone();
        trace.coverage_gate = Some(gate);
        trace.missing_scopes = final_scopes.clone();
        trace.missing_clause_refs = final_clauses.clone();
        let mut codes = Vec::new();
        if !final_scopes.is_empty() {
            codes.push(RETRIEVAL_SCOPE_MISMATCH.to_string());
        }
        if !final_clauses.is_empty() {
            codes.push(RETRIEVAL_CLAUSE_MISSING.to_string());
        }
        trace.error_codes = merge_error_codes([std::mem::take(&mut trace.error_codes), codes]);
        merged
    }
}

/// Wrap flat item metadata into the nested row shape the rest of the kernel
/// reads, and drop items without content.
pub fn normalize_evidence(items: Vec<EvidenceItem>) -> Vec<EvidenceItem> {
    items
        .into_iter()
        .filter(|item| !item.content.trim().is_empty())
        .map(|mut item| {
            let has_row = item
                .metadata
                .as_object()
                .map(|meta| meta.contains_key("row"))
                .unwrap_or(false);
            if !has_row {
                let flat = if item.metadata.is_null() {
                    json!({})
                } else {
                    item.metadata.clone()
                };
                item.metadata = json!({
                    "row": {
                        "content": item.content,
                        "metadata": flat,
                        "similarity": item.score,
                    }
                });
            }
            item
        })
        .collect()
}

fn dedup_merge(base: Vec<EvidenceItem>, additions: Vec<EvidenceItem>) -> Vec<EvidenceItem> {
    let mut merged: Vec<EvidenceItem> = Vec::with_capacity(base.len() + additions.len());
    let mut seen: Vec<String> = Vec::new();
    for item in base.into_iter().chain(additions) {
        let key = {
            let source = item.source.trim().to_uppercase();
            if source.is_empty() {
                item.content.clone()
            } else {
                source
            }
        };
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        merged.push(item);
    }
    merged
}
