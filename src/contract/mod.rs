//! RAG retrieval contract: wire types, backend selection, HTTP client.

mod client;
mod selector;
mod types;

pub use client::{ContractPort, RagContractClient};
pub use selector::{Backend, BackendSelector};
pub use types::{
    HybridRequest, MergeConfig, MultiQueryRequest, MultiQueryResponse, QueryScope, RequestContext,
    RetrievalResponse, ScopeValidationRequest, ScopeValidationResponse,
};

#[cfg(test)]
pub(crate) mod doubles {
    //! In-memory contract double used across retrieval, flow, and kernel
    //! tests.

    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::error::{Error, Result};
    use crate::model::{EvidenceItem, SubqueryGroup};

    use super::*;

    /// A recorded hybrid call: the query text and its scope filters.
    #[derive(Debug, Clone, PartialEq)]
    pub struct RecordedCall {
        pub query: String,
        pub scopes: Vec<String>,
    }

    /// Contract double serving canned items, optionally per scope filter.
    #[derive(Default)]
    pub struct StaticContract {
        pub scope_response: ScopeValidationResponse,
        /// Items returned when the request filters to a single scope.
        pub items_by_scope: BTreeMap<String, Vec<EvidenceItem>>,
        /// Items returned for unfiltered or unmatched requests.
        pub default_items: Vec<EvidenceItem>,
        /// When set, every hybrid call fails with this message.
        pub hybrid_failure: Option<String>,
        /// Scripted multi-query response for comprehensive-mode tests.
        pub multi_query_response: Option<MultiQueryResponse>,
        pub hybrid_calls: Mutex<Vec<RecordedCall>>,
        pub multi_query_calls: Mutex<usize>,
    }

    impl StaticContract {
        pub fn valid_scope() -> ScopeValidationResponse {
            ScopeValidationResponse {
                valid: true,
                ..Default::default()
            }
        }

        pub fn with_default_items(items: Vec<EvidenceItem>) -> Self {
            Self {
                scope_response: Self::valid_scope(),
                default_items: items,
                ..Default::default()
            }
        }

        pub fn recorded_hybrid_calls(&self) -> Vec<RecordedCall> {
            self.hybrid_calls
                .lock()
                .map(|guard| guard.clone())
                .unwrap_or_default()
        }

        fn scopes_from_filters(filters: Option<&Value>) -> Vec<String> {
            let Some(filters) = filters.and_then(Value::as_object) else {
                return Vec::new();
            };
            if let Some(one) = filters.get("source_standard").and_then(Value::as_str) {
                return vec![one.to_uppercase()];
            }
            filters
                .get("source_standards")
                .and_then(Value::as_array)
                .map(|many| {
                    many.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_uppercase)
                        .collect()
                })
                .unwrap_or_default()
        }

        fn items_for(&self, scopes: &[String]) -> Vec<EvidenceItem> {
            if scopes.len() == 1 {
                if let Some(items) = self.items_by_scope.get(&scopes[0]) {
                    return items.clone();
                }
            }
            self.default_items.clone()
        }
    }

    #[async_trait]
    impl ContractPort for StaticContract {
        async fn validate_scope(
            &self,
            _request: ScopeValidationRequest,
            _ctx: &RequestContext,
        ) -> Result<ScopeValidationResponse> {
            Ok(self.scope_response.clone())
        }

        async fn hybrid(
            &self,
            request: HybridRequest,
            _ctx: &RequestContext,
        ) -> Result<RetrievalResponse> {
            if let Some(message) = &self.hybrid_failure {
                return Err(Error::contract("hybrid", message.clone()));
            }
            let scopes = Self::scopes_from_filters(request.filters.as_ref());
            if let Ok(mut guard) = self.hybrid_calls.lock() {
                guard.push(RecordedCall {
                    query: request.query.clone(),
                    scopes: scopes.clone(),
                });
            }
            Ok(RetrievalResponse {
                items: self.items_for(&scopes),
                trace: Value::Null,
                partial: false,
            })
        }

        async fn multi_query(
            &self,
            request: MultiQueryRequest,
            _ctx: &RequestContext,
        ) -> Result<MultiQueryResponse> {
            if let Ok(mut guard) = self.multi_query_calls.lock() {
                *guard += 1;
            }
            if let Some(response) = &self.multi_query_response {
                return Ok(response.clone());
            }
            let mut items = Vec::new();
            let mut groups = Vec::new();
            for subquery in &request.queries {
                let scopes = subquery.scope_filters();
                let group_items = self.items_for(&scopes);
                for item in &group_items {
                    if !items.contains(item) {
                        items.push(item.clone());
                    }
                }
                groups.push(SubqueryGroup {
                    id: subquery.id.clone(),
                    query: subquery.query.clone(),
                    items: group_items,
                });
            }
            items.truncate(request.merge.top_k);
            Ok(MultiQueryResponse {
                items,
                trace: Value::Null,
                subqueries: groups,
                partial: false,
            })
        }
    }
}
