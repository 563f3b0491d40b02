//! Shared fixtures for the background integration tests.
//!
//! - [`FakeBrowser`] records window calls and reports popup creation
//! - [`FakeConnector`] hands out circuits whose streams reach an in-process
//!   hyper server answering JSON-RPC as a tiny Ethereum node ([`FakeNode`])
//! - [`Harness::connect`] wires a client port back-to-back with a server
//!   port served by the [`Background`]

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use brume_kernel::{
    Background, BackgroundConfig, Browser, Circuit, CircuitStream, KvDb, PopupError, PopupRect, Port,
    RequestHandler, TabId, TorClient, TorConnector, TransportError, WindowId, WindowInfo, serve_port,
};
use brume_types::{
    EthereumPrivateKeyWallet, OriginData, RequestId, RpcError, RpcId, RpcMessage, RpcRequestInit, RpcResponse,
    UserId, UserInit, WalletData, WalletId,
};
use bytes::Bytes;
use futures::Stream;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;

pub const NODE_URL: &str = "http://node.test/rpc";
pub const LOG_URL: &str = "http://log.test/";
pub const PASSWORD: &str = "correct horse";

// ============================================================================
// Browser
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum BrowserCall {
    CreatePopup { url: String, window: WindowId },
    UpdateTab { url: Option<String> },
    Focus(WindowId),
    OpenTab(String),
}

pub struct FakeBrowser {
    next_window: AtomicI64,
    calls: mpsc::UnboundedSender<BrowserCall>,
}

impl FakeBrowser {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<BrowserCall>) {
        let (calls, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { next_window: AtomicI64::new(1), calls }), rx)
    }
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn create_popup(&self, url: &str, _rect: PopupRect) -> Result<WindowInfo, PopupError> {
        let n = self.next_window.fetch_add(1, Ordering::SeqCst);
        let window = WindowId(n);
        let _ = self.calls.send(BrowserCall::CreatePopup { url: url.to_string(), window });
        Ok(WindowInfo { window, tab: TabId(n) })
    }

    async fn update_tab(&self, _tab: TabId, url: Option<&str>, _highlighted: bool) -> Result<(), PopupError> {
        let _ = self.calls.send(BrowserCall::UpdateTab { url: url.map(str::to_string) });
        Ok(())
    }

    async fn focus_window(&self, window: WindowId) -> Result<(), PopupError> {
        let _ = self.calls.send(BrowserCall::Focus(window));
        Ok(())
    }

    async fn open_tab(&self, url: &str) -> Result<(), PopupError> {
        let _ = self.calls.send(BrowserCall::OpenTab(url.to_string()));
        Ok(())
    }
}

/// The request id carried by a popup url.
pub fn request_id_of(url: &str) -> RequestId {
    let query = url.split_once('?').map(|(_, q)| q).unwrap_or_default();
    let id = url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "id")
        .map(|(_, v)| v.into_owned())
        .unwrap();
    RequestId::parse(&id).unwrap()
}

// ============================================================================
// Network
// ============================================================================

/// A JSON-RPC endpoint that records what it receives.
#[derive(Default)]
pub struct FakeNode {
    pub requests: Mutex<Vec<Value>>,
}

impl FakeNode {
    pub fn methods(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .filter_map(|r| r["method"].as_str().map(str::to_string))
            .collect()
    }

    fn answer(&self, request: Value) -> Value {
        self.requests.lock().push(request.clone());
        let id = request["id"].clone();
        let result = match request["method"].as_str() {
            Some("eth_getBalance") => json!("0xde0b6b3a7640000"),
            Some("eth_blockNumber") => json!("0x10"),
            Some("eth_sendRawTransaction") => json!("0xfeed"),
            Some("eth_call") => json!(format!("0x{:064x}", 5_000_000u64)),
            Some(other) => {
                return json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32601, "message": format!("no {other}")}});
            }
            // Anything that is not JSON-RPC (the log beacon).
            None => json!({}),
        };
        json!({"jsonrpc": "2.0", "id": id, "result": result})
    }
}

#[derive(Debug)]
pub struct FakeCircuit {
    node: Arc<FakeNode>,
    stats: Arc<NetStats>,
}

#[derive(Debug, Default)]
pub struct NetStats {
    pub clients: AtomicUsize,
    pub circuits: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub streams: AtomicUsize,
}

impl std::fmt::Debug for FakeNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FakeNode")
    }
}

#[async_trait]
impl Circuit for FakeCircuit {
    async fn open(&self, _host: &str, _port: u16) -> Result<CircuitStream, TransportError> {
        self.stats.streams.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(64 * 1024);
        let node = self.node.clone();
        tokio::spawn(async move {
            let service = service_fn(move |request: Request<Incoming>| {
                let node = node.clone();
                async move {
                    let body = request.into_body().collect().await?.to_bytes();
                    let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
                    let reply = node.answer(request);
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(reply.to_string()))))
                }
            });
            let _ = hyper::server::conn::http1::Builder::new().serve_connection(TokioIo::new(server), service).await;
        });
        Ok(Box::new(client))
    }

    async fn destroy(&self) {
        self.stats.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct FakeClient {
    node: Arc<FakeNode>,
    stats: Arc<NetStats>,
}

#[async_trait]
impl TorClient for FakeClient {
    async fn create_circuit(&self) -> Result<Arc<dyn Circuit>, TransportError> {
        self.stats.circuits.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeCircuit { node: self.node.clone(), stats: self.stats.clone() }))
    }
}

pub struct FakeConnector {
    pub node: Arc<FakeNode>,
    pub stats: Arc<NetStats>,
}

#[async_trait]
impl TorConnector for FakeConnector {
    async fn connect(&self, _fallback: &str) -> Result<Arc<dyn TorClient>, TransportError> {
        self.stats.clients.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeClient { node: self.node.clone(), stats: self.stats.clone() }))
    }
}

// ============================================================================
// Ports
// ============================================================================

fn receiver_stream(rx: mpsc::UnboundedReceiver<RpcMessage>) -> impl Stream<Item = RpcMessage> + Unpin {
    Box::pin(futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|m| (m, rx)) }))
}

/// Both ends of one connection.
pub struct Connection {
    pub client: Port,
    pub server: Port,
}

impl Connection {
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.client.request(RpcRequestInit::new(method, params)).await.map_err(|e| match e {
            brume_kernel::PortError::Rpc(e) => e,
            other => RpcError::internal(other.to_string()),
        })
    }

    pub fn close(&self) {
        self.client.close();
        self.server.close();
    }
}

/// A page: answers `brume_origin` and records everything else it is sent.
pub struct PageHandler {
    origin: String,
    events: mpsc::UnboundedSender<RpcRequestInit>,
}

#[async_trait]
impl RequestHandler for PageHandler {
    async fn handle(&self, _port: &Port, request: RpcRequestInit) -> Option<Result<Value, RpcError>> {
        if request.method == "brume_origin" {
            let origin = OriginData { origin: self.origin.clone(), title: Some("Test dApp".into()), icon: None };
            return Some(Ok(json!(origin)));
        }
        let _ = self.events.send(request);
        Some(Ok(Value::Null))
    }
}

pub struct Page {
    pub connection: Connection,
    pub events: mpsc::UnboundedReceiver<RpcRequestInit>,
}

impl Page {
    /// `brume_run` with a wallet request.
    pub async fn run(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let mouse = json!({"x": 500.0, "y": 400.0});
        self.connection.request("brume_run", json!([{"method": method, "params": params}, mouse])).await
    }

    pub async fn next_event(&mut self) -> RpcRequestInit {
        tokio::time::timeout(std::time::Duration::from_secs(5), self.events.recv()).await.unwrap().unwrap()
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn test_config() -> BackgroundConfig {
    let mut config = BackgroundConfig::from_toml(
        r#"
        log_url = "http://log.test/"

        [tor]
        proxies = ["127.0.0.1:9050"]

        [pools]
        tors = 1
        circuits = 2
        brumes = 2
        brumes_per_wallet = 1

        [retry]
        max_attempts = 3
        base_delay_ms = 0
        max_delay_ms = 0

        [storage]
        kdf_iterations = 16
        "#,
    )
    .unwrap();
    for chain in ["1", "137"] {
        config.endpoints.insert(chain.to_string(), vec![NODE_URL.to_string()]);
    }
    config
}

pub struct Harness {
    pub background: Arc<Background>,
    pub node: Arc<FakeNode>,
    pub stats: Arc<NetStats>,
    pub browser: mpsc::UnboundedReceiver<BrowserCall>,
    pub foreground: Connection,
}

pub struct NoopHandler;

#[async_trait]
impl RequestHandler for NoopHandler {
    async fn handle(&self, _port: &Port, _request: RpcRequestInit) -> Option<Result<Value, RpcError>> {
        Some(Ok(Value::Null))
    }
}

/// Forwards every request it is sent (subscription updates) to a channel.
pub struct RecordingHandler(pub mpsc::UnboundedSender<RpcRequestInit>);

#[async_trait]
impl RequestHandler for RecordingHandler {
    async fn handle(&self, _port: &Port, request: RpcRequestInit) -> Option<Result<Value, RpcError>> {
        let _ = self.0.send(request);
        Some(Ok(Value::Null))
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: BackgroundConfig) -> Self {
        let node = Arc::new(FakeNode::default());
        let stats = Arc::new(NetStats::default());
        let (browser, calls) = FakeBrowser::new();
        let connector = Arc::new(FakeConnector { node: node.clone(), stats: stats.clone() });
        let background = Background::new(config, KvDb::in_memory().unwrap(), browser, connector);
        let foreground = connect(&background, "foreground", Arc::new(NoopHandler));
        Self { background, node, stats, browser: calls, foreground }
    }

    pub fn connect(&self, name: &str, handler: Arc<dyn RequestHandler>) -> Connection {
        connect(&self.background, name, handler)
    }

    pub fn page(&self, origin: &str) -> Page {
        let (events, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(PageHandler { origin: origin.to_string(), events });
        Page { connection: self.connect(&format!("content:{origin}"), handler), events: rx }
    }

    pub async fn next_browser_call(&mut self) -> BrowserCall {
        tokio::time::timeout(std::time::Duration::from_secs(5), self.browser.recv()).await.unwrap().unwrap()
    }

    /// Wait for a popup window to be created and return its url.
    pub async fn next_popup(&mut self) -> (String, WindowId) {
        loop {
            if let BrowserCall::CreatePopup { url, window } = self.next_browser_call().await {
                return (url, window);
            }
        }
    }

    /// Wait for the popup to be created or navigated and return the url shown.
    pub async fn next_popup_url(&mut self) -> String {
        loop {
            match self.next_browser_call().await {
                BrowserCall::CreatePopup { url, .. } | BrowserCall::UpdateTab { url: Some(url) } => return url,
                _ => continue,
            }
        }
    }

    /// The popup page connecting and announcing itself.
    pub async fn popup_hello(&self) -> Connection {
        let popup = self.connect("foreground", Arc::new(NoopHandler));
        popup.request("popup_hello", json!([])).await.unwrap();
        popup
    }

    /// The popup answering request `id`.
    pub async fn answer(&self, popup: &Connection, id: RequestId, result: Result<Value, RpcError>) {
        let response = RpcResponse::from_result(RpcId::String(id.to_string()), result);
        popup.request("popup_data", json!([response])).await.unwrap();
    }

    /// Create a user with one wallet and log in. Returns the wallet.
    pub async fn login_with_wallet(&self) -> (UserId, WalletData) {
        let uuid = UserId::new();
        let init = UserInit {
            uuid,
            name: "alice".into(),
            color: 1,
            emoji: "🦊".into(),
            password: PASSWORD.into(),
        };
        self.foreground.request("brume_createUser", json!([init])).await.unwrap();
        self.foreground.request("brume_login", json!([uuid, PASSWORD])).await.unwrap();

        let wallet: WalletData = EthereumPrivateKeyWallet {
            uuid: WalletId::new(),
            name: "main".into(),
            color: 2,
            emoji: "💰".into(),
            private_key: "0x01".into(),
            address: "0x00000000000000000000000000000000000000aa".into(),
        }
        .into();
        self.foreground.request("brume_createWallet", json!([wallet])).await.unwrap();
        (uuid, wallet)
    }

    /// Run the connect flow for `page`, approving with `wallet` on chain 1.
    pub async fn connect_page(&mut self, page: &Page, wallet: &WalletData, persistent: bool) -> (Value, Connection) {
        let request = page.run("eth_requestAccounts", json!([]));
        let approve = async {
            let (url, _) = self.next_popup().await;
            let popup = self.popup_hello().await;
            let id = request_id_of(&url);
            self.answer(&popup, id, Ok(json!([persistent, wallet.uuid(), 1]))).await;
            popup
        };
        let (accounts, popup) = tokio::join!(request, approve);
        (accounts.unwrap(), popup)
    }
}

pub fn connect(background: &Arc<Background>, name: &str, handler: Arc<dyn RequestHandler>) -> Connection {
    let (server, server_out) = Port::channel(name);
    let (client, client_out) = Port::channel(format!("{name}-client"));
    tokio::spawn(serve_port(server.clone(), receiver_stream(client_out), background.clone()));
    tokio::spawn(serve_port(client.clone(), receiver_stream(server_out), handler));
    Connection { client, server }
}
