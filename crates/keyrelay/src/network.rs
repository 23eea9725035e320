//! Network registry and provider resolution.
//!
//! Transactions are routed to an RPC endpoint chosen by the request's
//! `chainId` or, when it has none, by the network the operator last
//! selected. The selection is persisted under `selectedNetwork`.

use crate::error::StoreError;
use crate::store::{self, keys, Store};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;
use url::Url;

/// A resolved RPC endpoint for one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderHandle {
    /// EIP-155 chain id.
    pub chain_id: u64,
    /// Short network key, e.g. `eth`.
    pub key: String,
    /// Human-readable name.
    pub name: String,
    /// Native currency symbol.
    pub symbol: String,
    /// JSON-RPC endpoint.
    pub rpc_url: Url,
}

/// Maps a transaction's chain to a provider.
#[async_trait]
pub trait NetworkResolver: Send + Sync {
    /// Provider for an explicit chain id.
    async fn resolve_by_chain_id(&self, chain_id: u64) -> Option<ProviderHandle>;
    /// Provider for the operator's current selection.
    async fn resolve_by_selection(&self) -> Option<ProviderHandle>;
}

const DEFAULT_NETWORKS: &[(&str, u64, &str, &str, &str)] = &[
    ("bsc", 56, "BNB Smart Chain", "BNB", "https://bsc-dataseed.binance.org"),
    ("eth", 1, "Ethereum", "ETH", "https://eth.llamarpc.com"),
    ("arb", 42161, "Arbitrum One", "ETH", "https://arb1.arbitrum.io/rpc"),
    ("pol", 137, "Polygon", "POL", "https://polygon-rpc.com"),
];

/// The known networks plus the persisted selection.
pub struct NetworkRegistry {
    networks: Vec<ProviderHandle>,
    store: Arc<dyn Store>,
}

impl NetworkRegistry {
    /// Registry over the built-in network table.
    ///
    /// # Errors
    ///
    /// Returns an error if a built-in RPC URL fails to parse.
    pub fn with_defaults(store: Arc<dyn Store>) -> anyhow::Result<Self> {
        let networks = DEFAULT_NETWORKS
            .iter()
            .map(|&(key, chain_id, name, symbol, rpc)| {
                Ok(ProviderHandle {
                    chain_id,
                    key: key.to_string(),
                    name: name.to_string(),
                    symbol: symbol.to_string(),
                    rpc_url: Url::parse(rpc)?,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { networks, store })
    }

    /// Registry over an explicit network list.
    #[must_use]
    pub fn new(networks: Vec<ProviderHandle>, store: Arc<dyn Store>) -> Self {
        Self { networks, store }
    }

    /// Replaces the RPC URL for the network named `key`. Returns `false`
    /// if no such network exists.
    pub fn override_rpc(&mut self, key: &str, rpc_url: Url) -> bool {
        match self.networks.iter_mut().find(|n| n.key == key) {
            Some(network) => {
                network.rpc_url = rpc_url;
                true
            }
            None => false,
        }
    }

    /// All known networks.
    #[must_use]
    pub fn networks(&self) -> &[ProviderHandle] {
        &self.networks
    }

    /// Finds a network by chain id or key.
    #[must_use]
    pub fn find(&self, query: &str) -> Option<&ProviderHandle> {
        match query.parse::<u64>() {
            Ok(chain_id) => self.networks.iter().find(|n| n.chain_id == chain_id),
            Err(_) => self.networks.iter().find(|n| n.key.eq_ignore_ascii_case(query)),
        }
    }

    /// Persists `query` (chain id or key) as the current selection.
    ///
    /// # Errors
    ///
    /// Returns an error if the network is unknown or cannot be saved.
    pub async fn select(&self, query: &str) -> anyhow::Result<ProviderHandle> {
        let network = self
            .find(query)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown network: {query}"))?;
        store::save(self.store.as_ref(), keys::SELECTED_NETWORK, &network.chain_id).await?;
        Ok(network)
    }

    /// Currently selected network, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the selection cannot be read.
    pub async fn selected(&self) -> Result<Option<ProviderHandle>, StoreError> {
        let chain_id = store::load::<u64>(self.store.as_ref(), keys::SELECTED_NETWORK).await?;
        Ok(chain_id.and_then(|id| self.networks.iter().find(|n| n.chain_id == id).cloned()))
    }
}

#[async_trait]
impl NetworkResolver for NetworkRegistry {
    async fn resolve_by_chain_id(&self, chain_id: u64) -> Option<ProviderHandle> {
        self.networks.iter().find(|n| n.chain_id == chain_id).cloned()
    }

    async fn resolve_by_selection(&self) -> Option<ProviderHandle> {
        match self.selected().await {
            Ok(selected) => selected,
            Err(e) => {
                warn!(error = %e, "failed to read selected network");
                None
            }
        }
    }
}
