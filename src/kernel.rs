//! The query kernel: runs the reasoning graph for one query and assembles
//! the structured response.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::codes::{STOP_ORCHESTRATOR_TIMEOUT, STOP_VALIDATION_FAILED};
use crate::config::{ContractMode, KernelConfig};
use crate::contract::{
    ContractPort, RagContractClient, RequestContext, ScopeValidationRequest,
};
use crate::error::Result;
use crate::flow::{
    aggregate_subqueries_node, citation_validate_node, execute_tool_node, generator_node,
    planner_node, reflect_node, FlowComponents, FlowState, NextAction, MAX_PLAN_ATTEMPTS,
};
use crate::generator::AnswerGenerator;
use crate::llm::CompletionClient;
use crate::metrics::MetricsStore;
use crate::model::{
    AnswerDraft, ClarificationContext, ClarificationRequest, QueryIntent, ReasoningStep,
    RetrievalDiagnostics, RetrievalPlan, ScopeValidationError, ValidationResult,
};
use crate::profile::AgentProfile;
use crate::retrieval::{
    DeterministicSubqueryPlanner, HybridSubqueryPlanner, LlmSubqueryPlanner, RetrievalFlow,
    SubqueryPlanner,
};
use crate::tools::{
    CalculatorTool, ExpectationCoverageTool, SemanticRetrievalTool, ToolRegistry,
};
use crate::validation::{build_citation_bundle, CitationDetail, CitationValidator};

const ENGINE_NAME: &str = "universal_flow";
/// Sections the trace counts in the final answer.
const RESPONSE_SECTIONS: [&str; 5] = [
    "hechos citados",
    "inferencias",
    "brechas",
    "recomendaciones",
    "confianza y supuestos",
];

/// One incoming query with its tenant scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    pub tenant_id: String,
    #[serde(default)]
    pub collection_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub scope_label: String,
    /// Context from a previous clarification round, if any.
    #[serde(default)]
    pub clarification_context: Option<ClarificationContext>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            tenant_id: tenant_id.into(),
            ..Self::default()
        }
    }
}

/// Observability payload returned with every answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningTraceReport {
    pub engine: String,
    pub stop_reason: String,
    pub plan_attempts: u32,
    pub reflections: u32,
    pub tools_used: Vec<String>,
    pub steps: Vec<ReasoningStep>,
    pub stage_timings_ms: std::collections::BTreeMap<String, f64>,
    pub tool_timings_ms: std::collections::BTreeMap<String, f64>,
    pub stage_budgets_ms: Value,
    pub final_confidence: Option<f64>,
    pub response_sections_detected: usize,
    pub expectation_coverage_ratio: Option<f64>,
    pub missing_expectations: usize,
}

/// The kernel's structured result for one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelResponse {
    pub intent: QueryIntent,
    pub plan: RetrievalPlan,
    pub answer: AnswerDraft,
    pub validation: ValidationResult,
    pub retrieval: RetrievalDiagnostics,
    pub clarification: Option<ClarificationRequest>,
    /// Set when upstream scope validation rejected the request.
    pub scope_error: Option<ScopeValidationError>,
    pub citations: Vec<String>,
    pub citation_details: Vec<CitationDetail>,
    pub citation_quality: Value,
    pub reasoning_trace: ReasoningTraceReport,
    pub engine: String,
}

/// The reasoning-and-retrieval kernel.
pub struct QueryKernel {
    config: Arc<KernelConfig>,
    contract: Arc<dyn ContractPort>,
    components: FlowComponents,
}

impl QueryKernel {
    /// Build a kernel over an explicit contract port.
    pub fn new(
        config: KernelConfig,
        contract: Arc<dyn ContractPort>,
        generator: Arc<dyn AnswerGenerator>,
        clarifier: Option<Arc<dyn CompletionClient>>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let planner: Arc<dyn SubqueryPlanner> = if config.light_planner_enabled {
            match &clarifier {
                Some(client) => Arc::new(HybridSubqueryPlanner::new(Some(
                    LlmSubqueryPlanner::new(client.clone(), config.light_planner_timeout_ms),
                ))),
                None => Arc::new(DeterministicSubqueryPlanner),
            }
        } else {
            Arc::new(DeterministicSubqueryPlanner)
        };
        let flow = Arc::new(RetrievalFlow::new(
            contract.clone(),
            planner,
            config.clone(),
        ));
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(SemanticRetrievalTool::new(flow)));
        tools.register(Arc::new(CalculatorTool));
        tools.register(Arc::new(ExpectationCoverageTool));

        Ok(Self {
            contract,
            components: FlowComponents {
                tools,
                generator,
                validator: CitationValidator,
                config: config.clone(),
                clarifier,
            },
            config,
        })
    }

    /// Build a kernel over the HTTP retrieval contract.
    pub fn over_http(
        config: KernelConfig,
        generator: Arc<dyn AnswerGenerator>,
        clarifier: Option<Arc<dyn CompletionClient>>,
        metrics: Arc<MetricsStore>,
    ) -> Result<Self> {
        let contract = Arc::new(RagContractClient::new(&config, metrics)?);
        Self::new(config, contract, generator, clarifier)
    }

    /// Handle one query under the total wall-clock budget.
    pub async fn handle(
        &self,
        request: QueryRequest,
        profile: Arc<AgentProfile>,
    ) -> Result<KernelResponse> {
        let ctx = RequestContext {
            tenant_id: request.tenant_id.clone(),
            collection_id: request.collection_id.clone(),
            user_id: request.user_id.clone(),
            request_id: request.request_id.clone(),
            correlation_id: request.correlation_id.clone(),
        };
        let mut state = FlowState::new(
            request.query.clone(),
            ctx.clone(),
            profile.clone(),
            Duration::from_millis(self.config.total_timeout_ms),
        );
        state.scope_label = request.scope_label.clone();
        state.clarification_context = request.clarification_context.clone();

        info!(tenant_id = %request.tenant_id, "kernel_query_started");

        // Upstream scope validation gates retrieval entirely.
        let scope_timeout = state.adaptive_timeout(
            self.config.stage_timeouts.retrieval_hybrid_ms,
            0,
        );
        let scope_request = ScopeValidationRequest {
            query: request.query.clone(),
            tenant_id: request.tenant_id.clone(),
            collection_id: request.collection_id.clone(),
            filters: None,
        };
        match tokio::time::timeout(
            scope_timeout,
            self.contract.validate_scope(scope_request, &ctx),
        )
        .await
        {
            Ok(Ok(response)) => {
                if !response.valid {
                    return Ok(self.scope_invalid_response(&state, response));
                }
                state.validated_filters = response.normalized_filters();
                state.scope_payload = serde_json::to_value(&response).unwrap_or(Value::Null);
            }
            Ok(Err(error)) => {
                // Absorbed: retrieval still runs, unvalidated.
                warn!(error = %error, "scope_validation_unavailable");
            }
            Err(_) => {
                warn!("scope_validation_timeout");
            }
        }

        // Plan → execute → reflect loop, bounded by plan attempts.
        let mut interrupted = false;
        'plan: for _ in 0..MAX_PLAN_ATTEMPTS {
            if state.budget_exhausted(Duration::ZERO) {
                state.stop_reason = STOP_ORCHESTRATOR_TIMEOUT.to_string();
                break 'plan;
            }
            let delta = planner_node(&state, &self.components).await;
            state.apply(delta);
            match state.next_action {
                NextAction::Interrupt => {
                    interrupted = true;
                    break 'plan;
                }
                NextAction::Generate => break 'plan,
                _ => {}
            }
            loop {
                if state.budget_exhausted(Duration::ZERO) {
                    state.stop_reason = STOP_ORCHESTRATOR_TIMEOUT.to_string();
                    break 'plan;
                }
                let delta = execute_tool_node(&state, &self.components).await;
                state.apply(delta);
                let delta = reflect_node(&state);
                state.apply(delta);
                match state.next_action {
                    NextAction::Replan if state.plan_attempts < MAX_PLAN_ATTEMPTS => {
                        continue 'plan;
                    }
                    NextAction::Replan | NextAction::Generate | NextAction::Interrupt => {
                        break 'plan;
                    }
                    NextAction::ExecuteTool => {}
                }
            }
        }

        if interrupted {
            return Ok(self.clarification_response(&state));
        }

        let delta = aggregate_subqueries_node(&state, &self.components).await;
        state.apply(delta);
        let delta = generator_node(&state, &self.components).await;
        state.apply(delta);
        if state.generation.is_some() {
            let delta = citation_validate_node(&state, &self.components);
            state.apply(delta);
        } else if state.validation.is_none() {
            state.validation = Some(ValidationResult::rejected(vec![
                "no answer draft was produced".to_string(),
            ]));
        }

        Ok(self.finalize(state))
    }

    fn empty_intent(state: &FlowState) -> QueryIntent {
        state
            .intent
            .clone()
            .unwrap_or_else(|| QueryIntent::new("default", "unclassified"))
    }

    fn plan_or_generic(state: &FlowState) -> RetrievalPlan {
        state
            .retrieval_plan
            .clone()
            .unwrap_or_else(|| RetrievalPlan::generic("default", Vec::new()))
    }

    fn diagnostics_or_empty(&self, state: &FlowState) -> RetrievalDiagnostics {
        state.retrieval.clone().unwrap_or_else(|| {
            RetrievalDiagnostics::empty(match self.config.retrieval_contract {
                ContractMode::Advanced => "advanced",
                ContractMode::Comprehensive => "comprehensive",
                ContractMode::Legacy => "legacy",
            })
        })
    }

    fn scope_invalid_response(
        &self,
        state: &FlowState,
        response: crate::contract::ScopeValidationResponse,
    ) -> KernelResponse {
        let fallback = state.profile.validation.fallback_message.clone();
        let mut diagnostics = self.diagnostics_or_empty(state);
        diagnostics.scope_validation = serde_json::to_value(&response).unwrap_or(Value::Null);
        let scope_error = ScopeValidationError {
            violations: response.violations.clone(),
            warnings: response.warnings.clone(),
            normalized_scope: response.normalized_scope.clone(),
            query_scope: serde_json::to_value(&response.query_scope).unwrap_or(Value::Null),
        };
        let mut state_view = state.clone();
        state_view.stop_reason = STOP_VALIDATION_FAILED.to_string();
        let trace = self.trace_report(&state_view, Some(false), "");
        KernelResponse {
            intent: Self::empty_intent(state),
            plan: Self::plan_or_generic(state),
            answer: AnswerDraft {
                text: fallback,
                mode: String::new(),
                evidence: Vec::new(),
            },
            validation: ValidationResult::rejected(
                response
                    .violations
                    .iter()
                    .map(|violation| format!("scope violation: {violation}"))
                    .collect(),
            ),
            retrieval: diagnostics,
            clarification: None,
            scope_error: Some(scope_error),
            citations: Vec::new(),
            citation_details: Vec::new(),
            citation_quality: Value::Null,
            reasoning_trace: trace,
            engine: ENGINE_NAME.to_string(),
        }
    }

    fn clarification_response(&self, state: &FlowState) -> KernelResponse {
        let clarification = state.clarification_request.clone();
        let question = clarification
            .as_ref()
            .map(|request| request.question.clone())
            .unwrap_or_default();
        let intent = Self::empty_intent(state);
        let trace = self.trace_report(state, Some(true), &question);
        KernelResponse {
            plan: Self::plan_or_generic(state),
            answer: AnswerDraft {
                text: question,
                mode: intent.mode.clone(),
                evidence: Vec::new(),
            },
            intent,
            validation: ValidationResult::accepted(),
            retrieval: self.diagnostics_or_empty(state),
            clarification,
            scope_error: None,
            citations: Vec::new(),
            citation_details: Vec::new(),
            citation_quality: Value::Null,
            reasoning_trace: trace,
            engine: ENGINE_NAME.to_string(),
        }
    }

    fn finalize(&self, mut state: FlowState) -> KernelResponse {
        let plan = Self::plan_or_generic(&state);
        let fallback = state.profile.validation.fallback_message.clone();

        let mut answer = state.generation.clone().unwrap_or_else(|| AnswerDraft {
            text: fallback.clone(),
            mode: plan.mode.clone(),
            evidence: Vec::new(),
        });
        let validation = state
            .validation
            .clone()
            .unwrap_or_else(|| ValidationResult::rejected(vec!["no validation ran".to_string()]));

        // Fallback substitution runs after every validation check.
        if !validation.accepted && !fallback.trim().is_empty() {
            answer.text = fallback;
        }

        if state.budget_exhausted(Duration::ZERO) {
            state.stop_reason = STOP_ORCHESTRATOR_TIMEOUT.to_string();
        }
        if state.stop_reason.is_empty() {
            state.stop_reason = STOP_VALIDATION_FAILED.to_string();
        }
        let total_elapsed = state.flow_started.elapsed().as_secs_f64() * 1000.0;
        state
            .stage_timings_ms
            .insert("total".to_string(), total_elapsed);

        let (citations, citation_details, citation_quality) = build_citation_bundle(
            &answer.text,
            &answer.evidence,
            &state.profile,
            &plan.requested_standards,
        );

        let trace = self.trace_report(&state, Some(validation.accepted), &answer.text);
        info!(
            stop_reason = %state.stop_reason,
            accepted = validation.accepted,
            evidence = answer.evidence.len(),
            "kernel_query_finished"
        );
        KernelResponse {
            intent: Self::empty_intent(&state),
            plan,
            answer,
            validation,
            retrieval: self.diagnostics_or_empty(&state),
            clarification: None,
            scope_error: None,
            citations,
            citation_details,
            citation_quality,
            reasoning_trace: trace,
            engine: ENGINE_NAME.to_string(),
        }
    }

    fn stage_budgets(&self) -> Value {
        let timeouts = &self.config.stage_timeouts;
        let retrieval_budget = timeouts
            .retrieval_hybrid_ms
            .max(timeouts.retrieval_multi_query_ms)
            .max(timeouts.retrieval_coverage_repair_ms)
            .max(timeouts.execute_tool_ms);
        json!({
            "planner": timeouts.plan_ms + timeouts.classify_ms,
            "execute_tool": retrieval_budget,
            "generator": timeouts.generate_ms,
            "validation": timeouts.validate_ms,
            "total": self.config.total_timeout_ms,
            "is_adaptive": true,
        })
    }

    fn trace_report(
        &self,
        state: &FlowState,
        accepted: Option<bool>,
        answer_text: &str,
    ) -> ReasoningTraceReport {
        let mut tools_used: Vec<String> = state
            .reasoning_steps
            .iter()
            .filter_map(|step| step.tool.clone())
            .collect();
        tools_used.sort();
        tools_used.dedup();

        let lowered = answer_text.to_lowercase();
        let sections_detected = RESPONSE_SECTIONS
            .iter()
            .filter(|section| lowered.contains(*section))
            .count();

        let expectation = state.working_memory.get("expectation_coverage");
        let expectation_coverage_ratio = expectation
            .and_then(|record| record.get("coverage_ratio"))
            .and_then(Value::as_f64);
        let missing_expectations = expectation
            .and_then(|record| record.get("missing"))
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);

        ReasoningTraceReport {
            engine: ENGINE_NAME.to_string(),
            stop_reason: if state.stop_reason.is_empty() {
                "unknown".to_string()
            } else {
                state.stop_reason.clone()
            },
            plan_attempts: state.plan_attempts,
            reflections: state.reflections,
            tools_used,
            steps: state.reasoning_steps.clone(),
            stage_timings_ms: state.stage_timings_ms.clone(),
            tool_timings_ms: state.tool_timings_ms.clone(),
            stage_budgets_ms: self.stage_budgets(),
            final_confidence: accepted.map(|ok| if ok { 1.0 } else { 0.45 }),
            response_sections_detected: sections_detected,
            expectation_coverage_ratio,
            missing_expectations,
        }
    }
}
