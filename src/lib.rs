//! # raq-core
//!
//! A retrieval-augmented question-answering orchestration kernel. It sits
//! between a chat surface and a downstream RAG engine: it classifies the
//! query against a tenant profile, plans a tool sequence, fans out
//! retrieval subqueries, reflects on partial results, synthesizes a
//! grounded answer, and validates its citations, all under a hard
//! wall-clock budget.
//!
//! ## Core Components
//!
//! - **Kernel**: the per-query state machine and its structured response
//! - **Retrieval**: the multi-strategy retrieval pipeline with coverage
//!   repair and deterministic rank fusion
//! - **Profile**: the declarative per-tenant policy bundle
//! - **Contract**: the HTTP retrieval contract with backend failover
//!
//! ## Example
//!
//! ```rust,ignore
//! use raq_core::{KernelConfig, MetricsStore, QueryKernel, QueryRequest};
//!
//! let config = KernelConfig::new(std::env::var("RAG_SERVICE_SECRET")?);
//! let kernel = QueryKernel::over_http(config, generator, None, metrics)?;
//! let response = kernel
//!     .handle(QueryRequest::new("Que exige la cláusula 9.1?", "acme"), profile)
//!     .await?;
//! println!("{}", response.answer.text);
//! ```

pub mod codes;
pub mod config;
pub mod contract;
pub mod error;
pub mod flow;
pub mod generator;
pub mod kernel;
pub mod llm;
pub mod metrics;
pub mod model;
pub mod profile;
pub mod retrieval;
pub mod router;
pub mod tools;
pub mod validation;

// Re-exports for convenience
pub use config::{BackendConfig, ContractMode, KernelConfig, StageTimeouts};
pub use contract::{
    Backend, BackendSelector, ContractPort, HybridRequest, MergeConfig, MultiQueryRequest,
    MultiQueryResponse, QueryScope, RagContractClient, RequestContext, RetrievalResponse,
    ScopeValidationRequest, ScopeValidationResponse,
};
pub use error::{Error, Result};
pub use generator::{AnswerGenerator, GenerationRequest, LlmAnswerGenerator};
pub use kernel::{KernelResponse, QueryKernel, QueryRequest, ReasoningTraceReport};
pub use llm::{
    ChatCompletionsClient, ChatMessage, ChatRole, CompletionClient, CompletionRequest,
    CompletionResponse, LlmClientConfig,
};
pub use metrics::{EndpointCounters, MetricsStore};
pub use model::{
    AnswerDraft, ClarificationContext, ClarificationKind, ClarificationRequest, CoverageGateTrace,
    EvidenceItem, MinScoreFilterTrace, ModePolicyTrace, PartialAnswer, PartialStatus, QueryIntent,
    ReasoningStep, RetrievalDiagnostics, RetrievalPlan, RetrievalTrace, ScopeValidationError,
    StepType, SubqueryGroup, SubqueryRequest, ToolCall, ToolPlan, ToolResult, ValidationResult,
};
pub use profile::{AgentProfile, HttpProfileStore, ProfileRepository, ProfileResolution};
pub use retrieval::{
    reciprocal_rank_fusion, DeterministicSubqueryPlanner, HybridSubqueryPlanner,
    LlmSubqueryPlanner, RetrievalArgs, RetrievalFlow, RetrievalRun, SubqueryPlanner,
    SubqueryPlanningContext,
};
pub use tools::{AgentTool, CalculatorTool, ExpectationCoverageTool, SemanticRetrievalTool, ToolInvocation, ToolRegistry};
pub use validation::{build_citation_bundle, CitationDetail, CitationValidator};
