//! HTTP exchanges over circuit streams.
//!
//! [`fetch`] opens a stream through a [`Circuit`], wraps it in TLS for
//! `https` targets, and performs one HTTP/1.1 request with hyper. The
//! exchange honours an optional timeout and cancellation token.
//!
//! Failures are classified for the retry loops: transport and connection
//! errors are retryable (another circuit may work), while HTTP status
//! errors, decode errors, timeouts and aborts are surfaced as-is.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use brume_types::{RpcError, RpcId, RpcRequestInit, RpcResponse};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use crate::tor::{Circuit, CircuitStream, TransportError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("invalid url {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("http status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("request timed out")]
    Timeout,

    #[error("request aborted")]
    Aborted,

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl FetchError {
    /// Whether another circuit might succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transport(_) | FetchError::Connection(_))
    }
}

/// How to perform a request.
#[derive(Debug, Clone, Default)]
pub struct FetchInit {
    /// Defaults to `GET`, or `POST` when a body is set.
    pub method: Option<hyper::Method>,
    pub body: Option<Bytes>,
    pub content_type: Option<&'static str>,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl FetchInit {
    pub fn json(body: &Value) -> Self {
        Self {
            body: Some(Bytes::from(body.to_string())),
            content_type: Some("application/json"),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Bytes,
}

impl FetchResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

struct Target {
    tls: bool,
    host: String,
    port: u16,
    path: String,
}

fn parse_target(url: &str) -> Result<Target, FetchError> {
    let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
    let tls = match parsed.scheme() {
        "https" => true,
        "http" => false,
        _ => return Err(FetchError::InvalidUrl(url.to_string())),
    };
    let host = parsed.host_str().ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?.to_string();
    let port = parsed.port_or_known_default().unwrap_or(if tls { 443 } else { 80 });
    let path = match parsed.query() {
        Some(query) => format!("{}?{}", parsed.path(), query),
        None => parsed.path().to_string(),
    };
    Ok(Target { tls, host, port, path })
}

fn tls_config() -> Result<Arc<ClientConfig>, FetchError> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    if let Some(config) = CONFIG.get() {
        return Ok(config.clone());
    }

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| FetchError::Connection(format!("tls setup: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(CONFIG.get_or_init(|| Arc::new(config)).clone())
}

async fn connect(circuit: &dyn Circuit, target: &Target) -> Result<CircuitStream, FetchError> {
    let stream = circuit.open(&target.host, target.port).await?;
    if !target.tls {
        return Ok(stream);
    }

    let name = ServerName::try_from(target.host.as_str())
        .map_err(|_| FetchError::InvalidUrl(target.host.clone()))?
        .to_owned();
    let tls = TlsConnector::from(tls_config()?)
        .connect(name, stream)
        .await
        .map_err(|e| FetchError::Connection(format!("tls handshake: {e}")))?;
    Ok(Box::new(tls))
}

async fn exchange(circuit: &dyn Circuit, url: &str, init: &FetchInit) -> Result<FetchResponse, FetchError> {
    let target = parse_target(url)?;
    let stream = connect(circuit, &target).await?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| FetchError::Connection(e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            trace!(error = %e, "http connection ended");
        }
    });

    let method = init.method.clone().unwrap_or(if init.body.is_some() {
        hyper::Method::POST
    } else {
        hyper::Method::GET
    });
    let mut request = Request::builder().method(method).uri(target.path.as_str()).header(HOST, target.host.as_str());
    if let Some(content_type) = init.content_type {
        request = request.header(CONTENT_TYPE, content_type);
    }
    let request = request
        .body(Full::new(init.body.clone().unwrap_or_default()))
        .map_err(|e| FetchError::InvalidUrl(format!("{url}: {e}")))?;

    let response = sender.send_request(request).await.map_err(|e| FetchError::Connection(e.to_string()))?;
    let status = response.status().as_u16();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| FetchError::Connection(e.to_string()))?
        .to_bytes();

    trace!(url, status, len = body.len(), "fetched");
    if !(200..300).contains(&status) {
        return Err(FetchError::Status { status, body: String::from_utf8_lossy(&body).into_owned() });
    }
    Ok(FetchResponse { status, body })
}

/// Perform one HTTP request through `circuit`.
pub async fn fetch(circuit: &dyn Circuit, url: &str, init: FetchInit) -> Result<FetchResponse, FetchError> {
    let cancel = init.cancel.clone().unwrap_or_default();
    let timeout = init.timeout;
    let sleep = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = exchange(circuit, url, &init) => result,
        _ = sleep => {
            debug!(url, timeout_ms = timeout.map(|t| t.as_millis() as u64), "fetch timed out");
            Err(FetchError::Timeout)
        }
        _ = cancel.cancelled() => Err(FetchError::Aborted),
    }
}

static NEXT_RPC_ID: AtomicI64 = AtomicI64::new(1);

/// POST a JSON-RPC request and return its result.
pub async fn fetch_rpc(
    circuit: &dyn Circuit,
    url: &str,
    request: RpcRequestInit,
    init: FetchInit,
) -> Result<Value, FetchError> {
    let id = RpcId::Number(NEXT_RPC_ID.fetch_add(1, Ordering::Relaxed));
    let body = serde_json::to_value(request.with_id(id)).map_err(|e| FetchError::Decode(e.to_string()))?;

    let FetchInit { timeout, cancel, .. } = init;
    let init = FetchInit { timeout, cancel, ..FetchInit::json(&body) };
    let response: RpcResponse = fetch(circuit, url, init).await?.json()?;
    Ok(response.into_result()?)
}
