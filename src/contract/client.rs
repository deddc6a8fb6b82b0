//! HTTP client for the RAG retrieval contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::KernelConfig;
use crate::error::{Error, Result};
use crate::metrics::MetricsStore;

use super::selector::{Backend, BackendSelector};
use super::types::{
    HybridRequest, MultiQueryRequest, MultiQueryResponse, RequestContext, RetrievalResponse,
    ScopeValidationRequest, ScopeValidationResponse,
};

const VALIDATE_SCOPE_PATH: &str = "/api/v1/retrieval/validate-scope";
const HYBRID_PATH: &str = "/api/v1/retrieval/hybrid";
const MULTI_QUERY_PATH: &str = "/api/v1/retrieval/multi-query";

/// Async port over the retrieval contract, implemented by the HTTP client
/// and by in-memory doubles in tests.
#[async_trait]
pub trait ContractPort: Send + Sync {
    async fn validate_scope(
        &self,
        request: ScopeValidationRequest,
        ctx: &RequestContext,
    ) -> Result<ScopeValidationResponse>;

    async fn hybrid(&self, request: HybridRequest, ctx: &RequestContext)
        -> Result<RetrievalResponse>;

    async fn multi_query(
        &self,
        request: MultiQueryRequest,
        ctx: &RequestContext,
    ) -> Result<MultiQueryResponse>;
}

enum PostFailure {
    Transport(String),
    Status(u16, String),
}

impl PostFailure {
    fn retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status(code, _) => *code >= 500,
        }
    }

    fn into_error(self, endpoint: &str) -> Error {
        match self {
            Self::Transport(message) => Error::contract(endpoint, message),
            Self::Status(code, body) => Error::contract(endpoint, format!("status {code}: {body}")),
        }
    }
}

/// Contract client with backend failover.
pub struct RagContractClient {
    secret: String,
    http: reqwest::Client,
    selector: BackendSelector,
    metrics: Arc<MetricsStore>,
}

impl RagContractClient {
    /// Build the client from kernel configuration.
    ///
    /// Fails fast when the shared secret is missing; a kernel that cannot
    /// authenticate must not start.
    pub fn new(config: &KernelConfig, metrics: Arc<MetricsStore>) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .connect_timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            secret: config.service_secret.clone(),
            http,
            selector: BackendSelector::new(&config.backend)?,
            metrics,
        })
    }

    async fn post_once<B: Serialize, R: DeserializeOwned>(
        &self,
        base_url: &str,
        path: &str,
        body: &B,
        ctx: &RequestContext,
    ) -> std::result::Result<R, PostFailure> {
        let url = format!("{base_url}{path}");
        let trace_id = ctx
            .request_id
            .clone()
            .or_else(|| ctx.correlation_id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let correlation_id = ctx
            .correlation_id
            .clone()
            .or_else(|| ctx.request_id.clone())
            .unwrap_or_else(|| trace_id.clone());

        let mut request = self
            .http
            .post(&url)
            .header("X-Service-Secret", &self.secret)
            .header("X-Tenant-ID", &ctx.tenant_id)
            .header("X-Trace-ID", &trace_id)
            .header("X-Correlation-ID", &correlation_id)
            .json(body);
        if let Some(request_id) = &ctx.request_id {
            request = request.header("X-Request-ID", request_id);
        }
        if let Some(user_id) = &ctx.user_id {
            request = request.header("X-User-ID", user_id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PostFailure::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PostFailure::Status(status.as_u16(), body));
        }
        response
            .json::<R>()
            .await
            .map_err(|e| PostFailure::Transport(format!("decode: {e}")))
    }

    async fn post_with_failover<B: Serialize, R: DeserializeOwned>(
        &self,
        endpoint: &str,
        path: &str,
        body: &B,
        ctx: &RequestContext,
    ) -> Result<R> {
        self.metrics.record_request(endpoint);
        let primary = self.selector.current_backend().await;
        let primary_url = self.selector.base_url_for(primary).to_string();

        match self.post_once(&primary_url, path, body, ctx).await {
            Ok(parsed) => {
                self.metrics.record_success(endpoint);
                Ok(parsed)
            }
            Err(failure) if failure.retryable() && !self.selector.is_forced() => {
                let alternate = primary.alternate();
                let alternate_url = self.selector.base_url_for(alternate).to_string();
                self.metrics.record_fallback_retry(endpoint);
                warn!(
                    endpoint,
                    from_backend = %primary,
                    to_backend = %alternate,
                    "rag_backend_fallback_retry"
                );
                match self.post_once(&alternate_url, path, body, ctx).await {
                    Ok(parsed) => {
                        self.selector.set_backend(alternate).await;
                        self.metrics.record_success(endpoint);
                        Ok(parsed)
                    }
                    Err(second) => {
                        self.metrics.record_failure(endpoint);
                        Err(second.into_error(endpoint))
                    }
                }
            }
            Err(failure) => {
                self.metrics.record_failure(endpoint);
                Err(failure.into_error(endpoint))
            }
        }
    }

    /// Pin the cached backend choice. Exposed for warm-up paths.
    pub async fn pin_backend(&self, backend: Backend) {
        self.selector.set_backend(backend).await;
    }
}

#[async_trait]
impl ContractPort for RagContractClient {
    async fn validate_scope(
        &self,
        request: ScopeValidationRequest,
        ctx: &RequestContext,
    ) -> Result<ScopeValidationResponse> {
        debug!(tenant_id = %ctx.tenant_id, "contract_validate_scope");
        self.post_with_failover("validate_scope", VALIDATE_SCOPE_PATH, &request, ctx)
            .await
    }

    async fn hybrid(
        &self,
        request: HybridRequest,
        ctx: &RequestContext,
    ) -> Result<RetrievalResponse> {
        debug!(tenant_id = %ctx.tenant_id, k = request.k, "contract_hybrid");
        self.post_with_failover("hybrid", HYBRID_PATH, &request, ctx)
            .await
    }

    async fn multi_query(
        &self,
        request: MultiQueryRequest,
        ctx: &RequestContext,
    ) -> Result<MultiQueryResponse> {
        debug!(
            tenant_id = %ctx.tenant_id,
            queries = request.queries.len(),
            "contract_multi_query"
        );
        self.post_with_failover("multi_query", MULTI_QUERY_PATH, &request, ctx)
            .await
    }
}
