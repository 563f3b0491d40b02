//! Anonymizing transport capability and the pools built on it.
//!
//! The transport itself is external: a [`TorConnector`] yields client
//! connections, a [`TorClient`] builds circuits, and a [`Circuit`] opens
//! byte streams to `host:port`. Two stacked pools keep them warm:
//!
//! ```text
//! tor pool (clients)  ──acquire_random──►  circuit pool (circuits)
//!   connect(random fallback)                 client.create_circuit()
//! ```
//!
//! Builds go through [`try_loop`]: a failed connect retries with another
//! fallback, a failed circuit evicts the client it came from and retries
//! with another one.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::looped::{Looped, RetrySettings, try_loop};
use crate::pool::{Pool, PoolError, PoolParams};

/// A byte stream through a circuit.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type CircuitStream = Box<dyn AsyncStream>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("no fallback endpoints configured")]
    NoFallbacks,

    #[error("failed to connect through {fallback}: {message}")]
    Connect { fallback: String, message: String },

    #[error("failed to create circuit: {0}")]
    Circuit(String),

    #[error("failed to open stream to {host}:{port}: {message}")]
    Stream { host: String, port: u16, message: String },

    #[error("circuit destroyed")]
    Destroyed,

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Opens anonymizing client connections.
#[async_trait]
pub trait TorConnector: Send + Sync + 'static {
    async fn connect(&self, fallback: &str) -> Result<Arc<dyn TorClient>, TransportError>;
}

/// A connected anonymizing client.
#[async_trait]
pub trait TorClient: Send + Sync + fmt::Debug + 'static {
    async fn create_circuit(&self) -> Result<Arc<dyn Circuit>, TransportError>;
}

/// A multi-hop path that can carry streams to many destinations.
#[async_trait]
pub trait Circuit: Send + Sync + fmt::Debug + 'static {
    async fn open(&self, host: &str, port: u16) -> Result<CircuitStream, TransportError>;

    /// Tear the circuit down. Later opens fail with [`TransportError::Destroyed`].
    async fn destroy(&self);
}

pub type TorPool = Pool<Arc<dyn TorClient>>;
pub type CircuitPool = Pool<Arc<dyn Circuit>>;

fn build_error<T: Clone + Send + Sync + 'static>(
    params: &PoolParams<T>,
    error: crate::looped::LoopError<TransportError>,
) -> PoolError {
    params.fail(error.into_inner())
}

/// Pool of client connections, each through a random fallback endpoint.
pub fn tor_pool(
    connector: Arc<dyn TorConnector>,
    fallbacks: Vec<String>,
    capacity: usize,
    retry: RetrySettings,
) -> TorPool {
    let fallbacks = Arc::new(fallbacks);
    Pool::new("tors", capacity, move |params: PoolParams<Arc<dyn TorClient>>| {
        let connector = connector.clone();
        let fallbacks = fallbacks.clone();
        let index = params.index;
        async move {
            let result = try_loop(&retry, |attempt| {
                let connector = connector.clone();
                let fallback = fallbacks.choose(&mut rand::thread_rng()).cloned();
                async move {
                    let Some(fallback) = fallback else {
                        return Err(Looped::Cancel(TransportError::NoFallbacks));
                    };
                    debug!(index, attempt, %fallback, "connecting tor client");
                    connector.connect(&fallback).await.map_err(|e| {
                        warn!(index, attempt, error = %e, "tor client connect failed");
                        Looped::Retry(e)
                    })
                }
            })
            .await;
            result.map_err(|e| build_error(&params, e))
        }
    })
}

/// Pool of circuits, each built through a random ready client.
pub fn circuit_pool(tors: TorPool, capacity: usize, retry: RetrySettings) -> CircuitPool {
    Pool::new("circuits", capacity, move |params: PoolParams<Arc<dyn Circuit>>| {
        let tors = tors.clone();
        let index = params.index;
        async move {
            let result = try_loop(&retry, |attempt| {
                let tors = tors.clone();
                async move {
                    let tor = tors.acquire_random().await.map_err(|e| Looped::Retry(e.into()))?;
                    match tor.create_circuit().await {
                        Ok(circuit) => Ok(circuit),
                        Err(e) => {
                            warn!(index, attempt, tor = tor.index(), error = %e, "circuit creation failed");
                            tor.evict();
                            Err(Looped::Retry(e))
                        }
                    }
                }
            })
            .await;
            result.map_err(|e| build_error(&params, e))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct NullCircuit;

    #[async_trait]
    impl Circuit for NullCircuit {
        async fn open(&self, host: &str, port: u16) -> Result<CircuitStream, TransportError> {
            Err(TransportError::Stream { host: host.into(), port, message: "null".into() })
        }

        async fn destroy(&self) {}
    }

    #[derive(Debug)]
    struct Client {
        healthy: bool,
    }

    #[async_trait]
    impl TorClient for Client {
        async fn create_circuit(&self) -> Result<Arc<dyn Circuit>, TransportError> {
            if self.healthy {
                Ok(Arc::new(NullCircuit))
            } else {
                Err(TransportError::Circuit("extend failed".into()))
            }
        }
    }

    /// First `bad` connections produce clients that cannot build circuits.
    struct Connector {
        connects: AtomicUsize,
        bad: usize,
    }

    #[async_trait]
    impl TorConnector for Connector {
        async fn connect(&self, fallback: &str) -> Result<Arc<dyn TorClient>, TransportError> {
            if fallback == "down" {
                return Err(TransportError::Connect { fallback: fallback.into(), message: "refused".into() });
            }
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Client { healthy: n >= self.bad }))
        }
    }

    #[tokio::test]
    async fn test_circuit_build_evicts_bad_client() {
        let connector = Arc::new(Connector { connects: AtomicUsize::new(0), bad: 1 });
        let tors = tor_pool(connector.clone(), vec!["127.0.0.1:9050".into()], 1, RetrySettings::immediate(3));
        let circuits = circuit_pool(tors.clone(), 1, RetrySettings::immediate(3));

        circuits.get(0).await.unwrap();
        // The unhealthy client was evicted and replaced.
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(tors.size(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_fallbacks_fail_the_build() {
        let connector = Arc::new(Connector { connects: AtomicUsize::new(0), bad: 0 });
        let tors = tor_pool(connector, vec!["down".into()], 2, RetrySettings::immediate(2));
        assert!(matches!(tors.get(0).await, Err(PoolError::Build { .. })));
    }

    #[tokio::test]
    async fn test_no_fallbacks() {
        let connector = Arc::new(Connector { connects: AtomicUsize::new(0), bad: 0 });
        let tors = tor_pool(connector, vec![], 1, RetrySettings::immediate(3));
        match tors.get(0).await {
            Err(PoolError::Build { message, .. }) => assert!(message.contains("no fallback")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
