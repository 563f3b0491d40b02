//! Anonymizing transport over a Tor daemon's SOCKS5 port.
//!
//! Each fallback is a SOCKS5 endpoint. A [`Socks5Client`] stands for one
//! reachable proxy; a [`Socks5Circuit`] is a random username/password pair
//! on that proxy. Tor isolates streams by SOCKS credentials, so streams
//! opened through the same circuit share a path and streams of different
//! circuits never do.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use brume_kernel::{Circuit, CircuitStream, TorClient, TorConnector, TransportError};
use rand::RngCore;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

use crate::constants::{ISOLATION_TOKEN_BYTES, PROXY_CONNECT_TIMEOUT};

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("proxy error: {0}")]
    Proxy(#[from] tokio_socks::Error),

    #[error("proxy connection timed out")]
    Timeout,
}

/// Username/password sent during the SOCKS5 handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Fresh random credentials, one isolation group.
    pub fn random() -> Self {
        let mut token = [0u8; ISOLATION_TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut token);
        Self { username: hex::encode(token), password: "brume".to_string() }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("username", &self.username).finish_non_exhaustive()
    }
}

// ============================================================================
// Transport capability
// ============================================================================

/// Connects to SOCKS5 fallbacks.
#[derive(Debug, Default)]
pub struct Socks5Connector;

#[async_trait]
impl TorConnector for Socks5Connector {
    async fn connect(&self, fallback: &str) -> Result<Arc<dyn TorClient>, TransportError> {
        // Dead fallbacks fail here and not on the first stream.
        match tokio::time::timeout(PROXY_CONNECT_TIMEOUT, TcpStream::connect(fallback)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(connect_failed(fallback, e.into())),
            Err(_) => return Err(connect_failed(fallback, SocksError::Timeout)),
        }
        debug!(proxy = %fallback, "socks proxy reachable");
        Ok(Arc::new(Socks5Client::new(fallback)))
    }
}

fn connect_failed(fallback: &str, e: SocksError) -> TransportError {
    TransportError::Connect { fallback: fallback.to_string(), message: e.to_string() }
}

/// A reachable SOCKS5 proxy.
#[derive(Debug)]
pub struct Socks5Client {
    proxy: String,
}

impl Socks5Client {
    pub fn new(proxy: impl Into<String>) -> Self {
        Self { proxy: proxy.into() }
    }

    pub fn proxy(&self) -> &str {
        &self.proxy
    }
}

#[async_trait]
impl TorClient for Socks5Client {
    async fn create_circuit(&self) -> Result<Arc<dyn Circuit>, TransportError> {
        Ok(Arc::new(Socks5Circuit::new(self.proxy.clone(), Credentials::random())))
    }
}

/// One isolation group on a proxy.
#[derive(Debug)]
pub struct Socks5Circuit {
    proxy: String,
    credentials: Credentials,
    destroyed: AtomicBool,
}

impl Socks5Circuit {
    pub fn new(proxy: String, credentials: Credentials) -> Self {
        Self { proxy, credentials, destroyed: AtomicBool::new(false) }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, SocksError> {
        let connect = Socks5Stream::connect_with_password(
            self.proxy.as_str(),
            (host, port),
            &self.credentials.username,
            &self.credentials.password,
        );
        match tokio::time::timeout(PROXY_CONNECT_TIMEOUT, connect).await {
            Ok(stream) => Ok(stream?.into_inner()),
            Err(_) => Err(SocksError::Timeout),
        }
    }
}

#[async_trait]
impl Circuit for Socks5Circuit {
    async fn open(&self, host: &str, port: u16) -> Result<CircuitStream, TransportError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(TransportError::Destroyed);
        }
        let stream = self.dial(host, port).await.map_err(|e| TransportError::Stream {
            host: host.to_string(),
            port,
            message: e.to_string(),
        })?;
        debug!(proxy = %self.proxy, host, port, "stream opened");
        Ok(Box::new(stream))
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
    }
}
