//! Wire types for the RAG retrieval contract.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{EvidenceItem, SubqueryGroup, SubqueryRequest};

/// Identity and correlation fields attached to every contract call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl RequestContext {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ..Self::default()
        }
    }

    pub fn with_collection(mut self, collection_id: impl Into<String>) -> Self {
        self.collection_id = Some(collection_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// `POST /api/v1/retrieval/validate-scope` request body.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeValidationRequest {
    pub query: String,
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
}

/// Query-scope analysis embedded in the validate-scope response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryScope {
    pub requested_standards: Vec<String>,
    pub requires_scope_clarification: bool,
    pub suggested_scopes: Vec<String>,
}

/// `validate-scope` response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeValidationResponse {
    pub valid: bool,
    pub violations: Vec<String>,
    pub warnings: Vec<String>,
    pub normalized_scope: Value,
    pub query_scope: QueryScope,
}

impl ScopeValidationResponse {
    /// Filters normalized by the engine, when provided.
    pub fn normalized_filters(&self) -> Option<Value> {
        self.normalized_scope.get("filters").cloned()
    }
}

/// `POST /api/v1/retrieval/hybrid` request body.
#[derive(Debug, Clone, Serialize)]
pub struct HybridRequest {
    pub query: String,
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    pub k: u32,
    pub fetch_k: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
    pub rerank: Value,
    pub graph: Value,
}

/// Response shared by the hybrid endpoint and kernel-side fan-out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalResponse {
    pub items: Vec<EvidenceItem>,
    pub trace: Value,
    pub partial: bool,
}

/// RRF merge parameters for multi-query calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    pub strategy: String,
    pub rrf_k: u32,
    pub top_k: usize,
}

impl MergeConfig {
    pub fn rrf(rrf_k: u32, top_k: usize) -> Self {
        Self {
            strategy: "rrf".to_string(),
            rrf_k,
            top_k,
        }
    }
}

/// `POST /api/v1/retrieval/multi-query` request body.
#[derive(Debug, Clone, Serialize)]
pub struct MultiQueryRequest {
    pub queries: Vec<SubqueryRequest>,
    pub merge: MergeConfig,
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
}

/// Multi-query response: merged items plus per-subquery groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiQueryResponse {
    pub items: Vec<EvidenceItem>,
    pub trace: Value,
    pub subqueries: Vec<SubqueryGroup>,
    pub partial: bool,
}
