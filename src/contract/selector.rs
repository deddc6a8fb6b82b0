//! Backend selection between the local RAG engine and its secondary.
//!
//! The selector probes the primary's health endpoint with a short timeout
//! and caches the winner for a TTL. A forced backend bypasses probing
//! entirely. The contract client promotes the alternate backend after a
//! successful failover retry.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::BackendConfig;

/// Which backend a request should target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Local,
    Secondary,
}

impl Backend {
    pub fn alternate(self) -> Self {
        match self {
            Self::Local => Self::Secondary,
            Self::Secondary => Self::Local,
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "local" => Some(Self::Local),
            "secondary" | "docker" => Some(Self::Secondary),
            _ => None,
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

#[derive(Debug)]
struct CachedChoice {
    backend: Backend,
    expires_at: Instant,
}

/// Probing backend selector with a TTL cache.
#[derive(Debug)]
pub struct BackendSelector {
    local_url: String,
    secondary_url: String,
    health_path: String,
    probe_timeout: Duration,
    ttl: Duration,
    forced: Option<Backend>,
    probe_http: reqwest::Client,
    cache: Mutex<Option<CachedChoice>>,
}

impl BackendSelector {
    pub fn new(config: &BackendConfig) -> crate::error::Result<Self> {
        let probe_timeout = Duration::from_millis(config.probe_timeout_ms.max(50));
        let probe_http = reqwest::Client::builder()
            .timeout(probe_timeout)
            .connect_timeout(probe_timeout)
            .build()?;
        let health_path = if config.health_path.starts_with('/') {
            config.health_path.clone()
        } else {
            format!("/{}", config.health_path)
        };
        Ok(Self {
            local_url: config.local_url.trim_end_matches('/').to_string(),
            secondary_url: config.secondary_url.trim_end_matches('/').to_string(),
            health_path,
            probe_timeout,
            ttl: Duration::from_secs(config.ttl_seconds.max(1)),
            forced: config.force_backend.as_deref().and_then(Backend::parse),
            probe_http,
            cache: Mutex::new(None),
        })
    }

    pub fn is_forced(&self) -> bool {
        self.forced.is_some()
    }

    pub fn base_url_for(&self, backend: Backend) -> &str {
        match backend {
            Backend::Local => &self.local_url,
            Backend::Secondary => &self.secondary_url,
        }
    }

    /// Current backend, probing when the cache is stale.
    pub async fn current_backend(&self) -> Backend {
        if let Some(forced) = self.forced {
            return forced;
        }
        let mut cache = self.cache.lock().await;
        let now = Instant::now();
        if let Some(cached) = cache.as_ref() {
            if now < cached.expires_at {
                return cached.backend;
            }
        }
        let backend = self.probe().await;
        if cache.as_ref().map(|c| c.backend) != Some(backend) {
            info!(backend = %backend, "rag_backend_selected");
        }
        *cache = Some(CachedChoice {
            backend,
            expires_at: now + self.ttl,
        });
        backend
    }

    /// Pin the cached backend (after a successful failover retry).
    pub async fn set_backend(&self, backend: Backend) {
        if self.forced.is_some() {
            return;
        }
        let mut cache = self.cache.lock().await;
        *cache = Some(CachedChoice {
            backend,
            expires_at: Instant::now() + self.ttl,
        });
    }

    async fn probe(&self) -> Backend {
        let probe_url = format!("{}{}", self.local_url, self.health_path);
        match self.probe_http.get(&probe_url).send().await {
            Ok(response) if response.status().is_success() => Backend::Local,
            Ok(response) => {
                warn!(
                    backend = "local",
                    url = %probe_url,
                    status = response.status().as_u16(),
                    "rag_backend_probe_failed"
                );
                Backend::Secondary
            }
            Err(error) => {
                warn!(
                    backend = "local",
                    url = %probe_url,
                    error = %error,
                    timeout_ms = self.probe_timeout.as_millis() as u64,
                    "rag_backend_probe_failed"
                );
                Backend::Secondary
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(force: Option<&str>) -> BackendConfig {
        BackendConfig {
            local_url: "http://127.0.0.1:1/".to_string(),
            secondary_url: "http://secondary:8000".to_string(),
            health_path: "health".to_string(),
            probe_timeout_ms: 60,
            ttl_seconds: 20,
            force_backend: force.map(str::to_string),
        }
    }

    #[test]
    fn test_backend_alternation() {
        assert_eq!(Backend::Local.alternate(), Backend::Secondary);
        assert_eq!(Backend::Secondary.alternate(), Backend::Local);
    }

    #[tokio::test]
    async fn test_forced_backend_bypasses_probe() {
        let selector = BackendSelector::new(&config(Some("secondary"))).unwrap();
        assert!(selector.is_forced());
        assert_eq!(selector.current_backend().await, Backend::Secondary);
        // set_backend must not override a forced choice
        selector.set_backend(Backend::Local).await;
        assert_eq!(selector.current_backend().await, Backend::Secondary);
    }

    #[tokio::test]
    async fn test_unreachable_primary_falls_back_and_caches() {
        let selector = BackendSelector::new(&config(None)).unwrap();
        // Port 1 is closed: probe fails, secondary wins.
        assert_eq!(selector.current_backend().await, Backend::Secondary);
        // Cached: no second probe within the TTL.
        assert_eq!(selector.current_backend().await, Backend::Secondary);
    }

    #[tokio::test]
    async fn test_set_backend_promotes() {
        let selector = BackendSelector::new(&config(None)).unwrap();
        selector.set_backend(Backend::Local).await;
        assert_eq!(selector.current_backend().await, Backend::Local);
    }

    #[test]
    fn test_health_path_normalized() {
        let selector = BackendSelector::new(&config(None)).unwrap();
        assert_eq!(selector.health_path, "/health");
        assert_eq!(selector.base_url_for(Backend::Local), "http://127.0.0.1:1");
    }
}
