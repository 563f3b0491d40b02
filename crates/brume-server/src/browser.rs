//! Window management forwarded to the browser bridge.
//!
//! The extension side connects once with the port name `browser`. Window
//! calls made by the popup broker become requests on that port; the bridge
//! answers them and in turn reports closed windows with
//! `brume_windowRemoved`, which the background routes itself.

use async_trait::async_trait;
use brume_kernel::{Browser, Port, PopupError, PopupRect, TabId, WindowId, WindowInfo};
use brume_types::RpcRequestInit;
use parking_lot::RwLock;
use serde_json::{Value, json};
use strum::{AsRefStr, EnumString};
use tracing::{debug, info};

/// Requests sent to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, EnumString)]
pub enum BridgeMethod {
    /// `[url, rect]` → `{window, tab}`
    #[strum(serialize = "browser_createPopup")]
    CreatePopup,
    /// `[tab, url | null, highlighted]`
    #[strum(serialize = "browser_updateTab")]
    UpdateTab,
    /// `[window]`
    #[strum(serialize = "browser_focusWindow")]
    FocusWindow,
    /// `[url]`
    #[strum(serialize = "browser_openTab")]
    OpenTab,
}

/// A [`Browser`] backed by whichever bridge port attached last.
#[derive(Default)]
pub struct PortBrowser {
    port: RwLock<Option<Port>>,
}

impl PortBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route window calls to `port` from now on.
    pub fn attach(&self, port: Port) {
        info!(port = ?port.id(), "browser bridge attached");
        *self.port.write() = Some(port);
    }

    pub fn is_attached(&self) -> bool {
        self.port.read().as_ref().is_some_and(|port| !port.is_closed())
    }

    fn current(&self) -> Result<Port, PopupError> {
        match self.port.read().as_ref() {
            Some(port) if !port.is_closed() => Ok(port.clone()),
            _ => Err(PopupError::Browser("no browser bridge attached".into())),
        }
    }

    async fn call(&self, method: BridgeMethod, params: Value) -> Result<Value, PopupError> {
        let port = self.current()?;
        debug!(method = method.as_ref(), "bridge call");
        port.request(RpcRequestInit::new(method.as_ref(), params))
            .await
            .map_err(|e| PopupError::Browser(e.to_string()))
    }
}

#[async_trait]
impl Browser for PortBrowser {
    async fn create_popup(&self, url: &str, rect: PopupRect) -> Result<WindowInfo, PopupError> {
        let value = self.call(BridgeMethod::CreatePopup, json!([url, rect])).await?;
        serde_json::from_value(value).map_err(|e| PopupError::Browser(format!("bad window info: {e}")))
    }

    async fn update_tab(&self, tab: TabId, url: Option<&str>, highlighted: bool) -> Result<(), PopupError> {
        self.call(BridgeMethod::UpdateTab, json!([tab, url, highlighted])).await?;
        Ok(())
    }

    async fn focus_window(&self, window: WindowId) -> Result<(), PopupError> {
        self.call(BridgeMethod::FocusWindow, json!([window])).await?;
        Ok(())
    }

    async fn open_tab(&self, url: &str) -> Result<(), PopupError> {
        self.call(BridgeMethod::OpenTab, json!([url])).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brume_types::{RpcMessage, RpcResponse};

    #[tokio::test]
    async fn test_unattached_bridge_fails() {
        let browser = PortBrowser::new();
        assert!(!browser.is_attached());
        let err = browser.open_tab("index.html#/").await.unwrap_err();
        assert_eq!(err, PopupError::Browser("no browser bridge attached".into()));
    }

    #[tokio::test]
    async fn test_create_popup_round_trip() {
        let browser = PortBrowser::new();
        let (port, mut outbound) = Port::channel("browser");
        browser.attach(port.clone());

        let bridge = tokio::spawn(async move {
            let Some(RpcMessage::Request(request)) = outbound.recv().await else {
                panic!("expected a request");
            };
            assert_eq!(request.method, "browser_createPopup");
            assert_eq!(request.params[0], "popup.html#/hello");
            assert_eq!(request.params[1]["width"], 400);
            port.dispatch(RpcResponse::ok(request.id, json!({ "window": 7, "tab": 70 })).into());
        });

        let rect = PopupRect { left: 0, top: 0, width: 400, height: 630 };
        let info = browser.create_popup("popup.html#/hello", rect).await.unwrap();
        assert_eq!(info, WindowInfo { window: WindowId(7), tab: TabId(70) });
        bridge.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_bridge_detaches() {
        let browser = PortBrowser::new();
        let (port, _outbound) = Port::channel("browser");
        browser.attach(port.clone());
        assert!(browser.is_attached());

        port.close();
        assert!(!browser.is_attached());
        assert!(browser.focus_window(WindowId(1)).await.is_err());
    }

    #[test]
    fn test_method_names() {
        assert_eq!(BridgeMethod::UpdateTab.as_ref(), "browser_updateTab");
        assert_eq!("browser_openTab".parse::<BridgeMethod>().unwrap(), BridgeMethod::OpenTab);
    }
}
