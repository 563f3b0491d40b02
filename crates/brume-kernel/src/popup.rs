//! Single-window approval popup.
//!
//! At most one popup window exists at a time. Approval requests are routed
//! through it one path at a time: if the window is already open it is
//! navigated and focused, otherwise a new one is created near the click and
//! the broker waits for its `popup_hello`.
//!
//! ```text
//! request_popup(req) ─► cache request/{id} ─► waiters[id] ─► open_or_focus(path)
//!                                                               │
//!        popup_data {id, result|error} ──► waiters[id] ◄────────┘
//!        window removed ─────────────────► closed token ─► Cancelled
//! ```
//!
//! The cached request and the waiter are both removed when the call ends,
//! whatever the outcome.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use brume_types::{AppRequestData, Mouse, RequestId, RpcError, RpcId, RpcResponse, app_request_key};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheCore, RawState};
use crate::config::PopupConfig;
use crate::port::Port;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PopupError {
    /// The window was closed before answering.
    #[error("popup closed")]
    Cancelled,

    /// The popup answered with an error.
    #[error(transparent)]
    Rejected(RpcError),

    #[error("popup request timed out")]
    Timeout,

    #[error("browser error: {0}")]
    Browser(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowId(pub i64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub i64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopupRect {
    pub left: i64,
    pub top: i64,
    pub width: u32,
    pub height: u32,
}

impl PopupRect {
    /// A `width` x `height` rect centred on the mouse, clamped to the screen origin.
    pub fn centered(mouse: Mouse, width: u32, height: u32) -> Self {
        let left = (mouse.x - f64::from(width) / 2.0).max(0.0) as i64;
        let top = (mouse.y - f64::from(height) / 2.0).max(0.0) as i64;
        Self { left, top, width, height }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowInfo {
    pub window: WindowId,
    pub tab: TabId,
}

/// Window management provided by the browser.
#[async_trait]
pub trait Browser: Send + Sync + 'static {
    /// Create a popup window showing the extension page `url`.
    async fn create_popup(&self, url: &str, rect: PopupRect) -> Result<WindowInfo, PopupError>;

    async fn update_tab(&self, tab: TabId, url: Option<&str>, highlighted: bool) -> Result<(), PopupError>;

    async fn focus_window(&self, window: WindowId) -> Result<(), PopupError>;

    /// Open an extension page in a regular tab.
    async fn open_tab(&self, url: &str) -> Result<(), PopupError>;
}

pub fn popup_url(path: &str) -> String {
    format!("popup.html#{path}")
}

pub fn index_url(path: &str) -> String {
    format!("index.html#{path}")
}

struct PopupData {
    window: WindowId,
    tab: TabId,
    port: Port,
    closed: CancellationToken,
}

pub struct PopupBroker {
    browser: Arc<dyn Browser>,
    cache: Arc<CacheCore>,
    width: u32,
    height: u32,
    hello_timeout: Duration,
    slot: tokio::sync::Mutex<Option<PopupData>>,
    hello: parking_lot::Mutex<Option<oneshot::Sender<Port>>>,
    waiters: DashMap<RequestId, oneshot::Sender<RpcResponse>>,
    windows: Arc<DashMap<WindowId, CancellationToken>>,
}

/// Deletes the cached request and its waiter when dropped.
struct RequestGuard<'a> {
    broker: &'a PopupBroker,
    id: RequestId,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.broker.waiters.remove(&self.id);
        self.broker.cache.delete(&app_request_key(self.id));
    }
}

impl PopupBroker {
    pub fn new(browser: Arc<dyn Browser>, cache: Arc<CacheCore>, config: &PopupConfig) -> Self {
        Self {
            browser,
            cache,
            width: config.width,
            height: config.height,
            hello_timeout: config.hello_timeout(),
            slot: tokio::sync::Mutex::new(None),
            hello: parking_lot::Mutex::new(None),
            waiters: DashMap::new(),
            windows: Arc::new(DashMap::new()),
        }
    }

    pub fn browser(&self) -> &Arc<dyn Browser> {
        &self.browser
    }

    /// Show `path` in the popup, creating the window if needed.
    ///
    /// Returns a token cancelled when that window goes away. A new window
    /// that does not say hello within the configured timeout is abandoned
    /// with [`PopupError::Timeout`].
    pub async fn open_or_focus(&self, path: &str, mouse: Mouse) -> Result<CancellationToken, PopupError> {
        let url = popup_url(path);
        let mut slot = self.slot.lock().await;

        if let Some(popup) = slot.as_ref().filter(|p| !p.closed.is_cancelled()) {
            debug!(window = popup.window.0, path, "reusing popup");
            self.browser.update_tab(popup.tab, Some(&url), true).await?;
            self.browser.focus_window(popup.window).await?;
            return Ok(popup.closed.clone());
        }

        let (tx, rx) = oneshot::channel();
        *self.hello.lock() = Some(tx);

        let rect = PopupRect::centered(mouse, self.width, self.height);
        let info = self.browser.create_popup(&url, rect).await?;
        let closed = CancellationToken::new();
        self.windows.insert(info.window, closed.clone());
        info!(window = info.window.0, path, "popup opened");

        let hello = tokio::time::timeout(self.hello_timeout, async {
            tokio::select! {
                port = rx => port.map_err(|_| PopupError::Cancelled),
                _ = closed.cancelled() => Err(PopupError::Cancelled),
            }
        });
        let port = match hello.await {
            Ok(Ok(port)) => port,
            Ok(Err(e)) => {
                self.hello.lock().take();
                return Err(e);
            }
            Err(_) => {
                warn!(window = info.window.0, "popup never said hello");
                self.hello.lock().take();
                self.windows.remove(&info.window);
                closed.cancel();
                return Err(PopupError::Timeout);
            }
        };

        // The popup's port going away means the window is gone too.
        let watched = closed.clone();
        let popup_port = port.clone();
        let windows = self.windows.clone();
        let window = info.window;
        tokio::spawn(async move {
            tokio::select! {
                _ = popup_port.closed() => {
                    windows.remove(&window);
                    watched.cancel();
                }
                _ = watched.cancelled() => {}
            }
        });

        *slot = Some(PopupData { window: info.window, tab: info.tab, port, closed: closed.clone() });
        Ok(closed)
    }

    /// The popup page announced itself on `port`.
    pub fn hello(&self, port: Port) {
        match self.hello.lock().take() {
            Some(tx) => {
                let _ = tx.send(port);
            }
            None => debug!(port = %port.name(), "popup hello without pending open"),
        }
    }

    /// The popup answered a request. Returns whether anyone was waiting.
    pub fn data(&self, response: RpcResponse) -> bool {
        let id = match &response.id {
            RpcId::String(s) => RequestId::parse(s).ok(),
            _ => None,
        };
        let Some(id) = id else {
            warn!(id = %response.id, "popup data with invalid request id");
            return false;
        };
        match self.waiters.remove(&id) {
            Some((_, tx)) => tx.send(response).is_ok(),
            None => {
                debug!(request = ?id, "popup data for unknown request");
                false
            }
        }
    }

    /// The browser removed a window.
    pub async fn window_removed(&self, window: WindowId) {
        let Some((_, closed)) = self.windows.remove(&window) else {
            return;
        };
        // Wake waiters first; an open in progress releases the slot on cancel.
        closed.cancel();

        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|p| p.window == window) {
            if let Some(popup) = slot.take() {
                popup.port.close();
            }
            info!(window = window.0, "popup closed");
        }
    }

    /// Number of windows still awaiting a `brume_windowRemoved`.
    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }

    /// Whether a popup window is currently tracked.
    pub async fn is_open(&self) -> bool {
        self.slot.lock().await.as_ref().is_some_and(|p| !p.closed.is_cancelled())
    }

    /// Ask the user to approve `request` and wait for the answer.
    ///
    /// Fails with [`PopupError::Cancelled`] if the window closes first and
    /// with [`PopupError::Timeout`] once `timeout` elapses.
    pub async fn request_popup(
        &self,
        request: AppRequestData,
        mouse: Mouse,
        timeout: Option<Duration>,
    ) -> Result<Value, PopupError> {
        let id = request.id;
        let path = request.popup_path();

        let state = serde_json::to_value(&request).map_err(|e| PopupError::Browser(e.to_string()))?;
        self.cache.set(&app_request_key(id), Some(RawState::data(state)));
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        let _guard = RequestGuard { broker: self, id };

        debug!(request = ?id, method = %request.method, origin = %request.origin, "requesting approval");
        let flow = async {
            let closed = self.open_or_focus(&path, mouse).await?;
            tokio::select! {
                response = rx => match response {
                    Ok(response) => response.into_result().map_err(PopupError::Rejected),
                    Err(_) => Err(PopupError::Cancelled),
                },
                _ = closed.cancelled() => Err(PopupError::Cancelled),
            }
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, flow).await.map_err(|_| PopupError::Timeout)?,
            None => flow.await,
        }
    }

    /// Decode a popup answer into `T`.
    pub async fn request_popup_as<T: serde::de::DeserializeOwned>(
        &self,
        request: AppRequestData,
        mouse: Mouse,
        timeout: Option<Duration>,
    ) -> Result<T, PopupError> {
        let value = self.request_popup(request, mouse, timeout).await?;
        serde_json::from_value(value)
            .map_err(|e| PopupError::Rejected(RpcError::invalid_params(format!("bad popup answer: {e}"))))
    }
}
