//! Process-wide RPC endpoint registry.
//!
//! Endpoints are cached per URL and shared by every component on the same
//! chain, so two vaults on the same chain never hold two connection pools.
//! Providers themselves are built per call from the cached endpoint; alloy
//! HTTP providers are stateless, so this keeps the unnameable filler types
//! out of struct fields.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use alloy::providers::{Provider, ProviderBuilder};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info};

static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<RpcEndpoint>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Arc<RpcEndpoint>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A cached RPC endpoint for one URL.
pub struct RpcEndpoint {
    url: reqwest::Url,
}

impl RpcEndpoint {
    /// Build a provider for this endpoint.
    pub fn provider(&self) -> impl Provider + Clone {
        ProviderBuilder::new().on_http(self.url.clone())
    }

    /// The endpoint URL.
    pub fn url(&self) -> &reqwest::Url {
        &self.url
    }

    /// Current head block number.
    pub async fn block_number(&self) -> Result<u64> {
        Ok(self.provider().get_block_number().await?)
    }

    /// Chain id reported by the node.
    pub async fn chain_id(&self) -> Result<u64> {
        Ok(self.provider().get_chain_id().await?)
    }
}

impl std::fmt::Debug for RpcEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcEndpoint").field("url", &self.url.as_str()).finish()
    }
}

/// Get (or lazily create) the shared endpoint for an RPC URL.
pub fn rpc_endpoint(url: &str) -> Result<Arc<RpcEndpoint>> {
    let mut map = registry().lock();
    if let Some(existing) = map.get(url) {
        return Ok(existing.clone());
    }

    let parsed: reqwest::Url = url.parse().with_context(|| format!("invalid RPC URL: {url}"))?;
    let endpoint = Arc::new(RpcEndpoint { url: parsed });
    map.insert(url.to_string(), endpoint.clone());
    debug!(url, "RPC endpoint registered");
    Ok(endpoint)
}

/// Drop every cached endpoint. Called once at shutdown; outstanding
/// `Arc<RpcEndpoint>` handles stay valid until their holders finish.
pub fn shutdown_endpoints() {
    let mut map = registry().lock();
    let count = map.len();
    map.clear();
    info!(count, "RPC endpoint registry cleared");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_are_shared_per_url() {
        let a = rpc_endpoint("http://localhost:18545").unwrap();
        let b = rpc_endpoint("http://localhost:18545").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = rpc_endpoint("http://localhost:28545").unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(rpc_endpoint("not a url").is_err());
    }
}
