//! Ethereum brumes: circuits bound to one endpoint per chain.
//!
//! A brume is a circuit plus a randomly chosen RPC endpoint for every known
//! chain, so requests through one brume keep one exit identity per chain.
//! The brume pool takes its circuits out of the circuit pool; each active
//! wallet then gets a small subpool taken out of the brume pool, spreading
//! its traffic over a bounded set of exits.

use std::collections::HashMap;
use std::sync::Arc;

use brume_types::{RpcRequestInit, WalletId, chains};
use dashmap::DashMap;
use rand::seq::SliceRandom;
use serde_json::Value;
use tracing::{debug, warn};

use crate::fetch::{FetchError, FetchInit, fetch_rpc};
use crate::looped::{LoopError, Looped, RetrySettings, try_loop};
use crate::pool::{Pool, PoolParams};
use crate::tor::{Circuit, CircuitPool, TransportError};

#[derive(Debug, Clone)]
pub struct EthereumBrume {
    pub circuit: Arc<dyn Circuit>,
    urls: Arc<HashMap<u64, String>>,
}

impl EthereumBrume {
    /// Pick one endpoint per registered chain for `circuit`.
    pub fn new(circuit: Arc<dyn Circuit>) -> Self {
        Self::with_endpoints(circuit, &HashMap::new())
    }

    /// Like [`EthereumBrume::new`], drawing from `overrides` for the chains it lists.
    pub fn with_endpoints(circuit: Arc<dyn Circuit>, overrides: &HashMap<u64, Vec<String>>) -> Self {
        let mut rng = rand::thread_rng();
        let urls = chains()
            .filter_map(|chain| {
                let candidates = overrides.get(&chain.chain_id).unwrap_or(&chain.urls);
                candidates.choose(&mut rng).map(|url| (chain.chain_id, url.clone()))
            })
            .collect();
        Self { circuit, urls: Arc::new(urls) }
    }

    /// A brume with explicit endpoints.
    pub fn with_urls(circuit: Arc<dyn Circuit>, urls: HashMap<u64, String>) -> Self {
        Self { circuit, urls: Arc::new(urls) }
    }

    pub fn url(&self, chain_id: u64) -> Option<&str> {
        self.urls.get(&chain_id).map(String::as_str)
    }
}

pub type BrumePool = Pool<EthereumBrume>;

/// Builds brumes with `make` from circuits taken out of `circuits`.
pub fn brume_pool_with<F>(circuits: CircuitPool, capacity: usize, make: F) -> BrumePool
where
    F: Fn(Arc<dyn Circuit>) -> EthereumBrume + Send + Sync + 'static,
{
    let make = Arc::new(make);
    Pool::new("brumes", capacity, move |params: PoolParams<EthereumBrume>| {
        let circuits = circuits.clone();
        let make = make.clone();
        async move {
            let circuit = circuits.take_random().await.map_err(|e| params.fail(e))?;
            Ok(make(circuit))
        }
    })
}

pub fn brume_pool(circuits: CircuitPool, capacity: usize) -> BrumePool {
    brume_pool_with(circuits, capacity, EthereumBrume::new)
}

/// Per-wallet subpools of the brume pool.
pub struct WalletBrumes {
    brumes: BrumePool,
    per_wallet: usize,
    wallets: DashMap<WalletId, BrumePool>,
}

impl WalletBrumes {
    pub fn new(brumes: BrumePool, per_wallet: usize) -> Self {
        Self { brumes, per_wallet, wallets: DashMap::new() }
    }

    /// The subpool of `wallet`, created on first use.
    pub fn get(&self, wallet: WalletId) -> BrumePool {
        self.wallets
            .entry(wallet)
            .or_insert_with(|| {
                debug!(wallet = %wallet, size = self.per_wallet, "creating wallet brumes");
                self.brumes.subpool(format!("wallet-{}", wallet.short()), self.per_wallet)
            })
            .clone()
    }

    /// Forget every subpool (on logout).
    pub fn clear(&self) {
        self.wallets.clear();
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }
}

/// Send a JSON-RPC request for `chain_id` through a random brume of `pool`.
///
/// Transport failures evict and destroy the brume and retry with another;
/// any other failure ends the loop.
pub async fn ethereum_fetch(
    pool: &BrumePool,
    chain_id: u64,
    request: &RpcRequestInit,
    init: &FetchInit,
    retry: &RetrySettings,
) -> Result<Value, FetchError> {
    try_loop(retry, |attempt| async move {
        let brume = pool
            .acquire_random()
            .await
            .map_err(|e| Looped::Retry(FetchError::Transport(TransportError::Pool(e))))?;
        let Some(url) = brume.url(chain_id) else {
            return Err(Looped::Cancel(FetchError::InvalidUrl(format!("no endpoint for chain {chain_id}"))));
        };

        match fetch_rpc(brume.circuit.as_ref(), url, request.clone(), init.clone()).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_retryable() => {
                warn!(chain_id, attempt, brume = brume.index(), error = %e, "brume failed, rotating");
                if brume.evict() {
                    brume.circuit.destroy().await;
                }
                Err(Looped::Retry(e))
            }
            Err(e) => Err(Looped::Cancel(e)),
        }
    })
    .await
    .map_err(LoopError::into_inner)
}
