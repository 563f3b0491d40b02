//! Bidirectional JSON-RPC message ports.
//!
//! A [`Port`] is one end of a long-lived channel to a content script, the
//! foreground UI, or the browser bridge. Both sides may issue requests; each
//! request carries a fresh id and is resolved by the response with the same
//! id. The transport feeds incoming messages to [`Port::dispatch`] and drains
//! outgoing ones from the receiver returned by [`Port::channel`].
//!
//! ```text
//!  transport ──RpcMessage──► dispatch ─┬─ response ─► pending[id] (oneshot)
//!                                      └─ request ──► RequestHandler ──► respond
//!  transport ◄──RpcMessage── outbound ◄── request / notify / respond
//! ```
//!
//! Closing a port (transport ended, or [`Port::close`]) fails every pending
//! request with [`PortError::Closed`] and fires [`Port::closed`] for whoever
//! tracks the port's lifetime.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use brume_types::{PortId, RpcError, RpcId, RpcMessage, RpcRequest, RpcRequestInit, RpcResponse};
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PortError {
    #[error("port closed")]
    Closed,

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

struct PortInner {
    id: PortId,
    name: String,
    outbound: mpsc::UnboundedSender<RpcMessage>,
    pending: DashMap<RpcId, oneshot::Sender<RpcResponse>>,
    closed: CancellationToken,
}

/// One end of a message channel. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Port {
    inner: Arc<PortInner>,
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PartialEq for Port {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Port {}

/// Removes a pending request entry when the waiting call goes away.
struct PendingGuard<'a> {
    port: &'a Port,
    id: RpcId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.port.inner.pending.remove(&self.id);
    }
}

impl Port {
    pub fn new(name: impl Into<String>, outbound: mpsc::UnboundedSender<RpcMessage>) -> Self {
        Self {
            inner: Arc::new(PortInner {
                id: PortId::new(),
                name: name.into(),
                outbound,
                pending: DashMap::new(),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// A port plus the receiver of everything it sends.
    pub fn channel(name: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<RpcMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(name, tx), rx)
    }

    pub fn id(&self) -> PortId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the port is closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Close the port, failing all pending requests.
    pub fn close(&self) {
        if self.inner.closed.is_cancelled() {
            return;
        }
        debug!(port = %self.inner.name, id = ?self.inner.id, "port closed");
        self.inner.closed.cancel();
        // Dropping the senders wakes every waiter with a receive error.
        self.inner.pending.clear();
    }

    fn send(&self, message: RpcMessage) -> Result<(), PortError> {
        if self.is_closed() {
            return Err(PortError::Closed);
        }
        self.inner.outbound.send(message).map_err(|_| {
            self.close();
            PortError::Closed
        })
    }

    /// Register a pending id and send the request.
    fn start(&self, init: RpcRequestInit) -> Result<(RpcId, oneshot::Receiver<RpcResponse>), PortError> {
        let id = RpcId::String(uuid::Uuid::new_v4().to_string());
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id.clone(), tx);
        trace!(port = %self.inner.name, method = %init.method, %id, "request");
        if let Err(e) = self.send(init.with_id(id.clone()).into()) {
            self.inner.pending.remove(&id);
            return Err(e);
        }
        Ok((id, rx))
    }

    async fn wait(&self, rx: oneshot::Receiver<RpcResponse>) -> Result<Value, PortError> {
        tokio::select! {
            response = rx => match response {
                Ok(response) => Ok(response.into_result()?),
                Err(_) => Err(PortError::Closed),
            },
            _ = self.closed() => Err(PortError::Closed),
        }
    }

    /// Send a request and wait for the correlated response.
    pub async fn request(&self, init: RpcRequestInit) -> Result<Value, PortError> {
        let (id, rx) = self.start(init)?;
        let _guard = PendingGuard { port: self, id };
        self.wait(rx).await
    }

    /// Like [`Port::request`], decoding the result into `T`.
    pub async fn request_as<T: DeserializeOwned>(&self, init: RpcRequestInit) -> Result<T, PortError> {
        let value = self.request(init).await?;
        serde_json::from_value(value).map_err(|e| PortError::Rpc(RpcError::internal(format!("bad result: {e}"))))
    }

    /// Send a request without waiting for its outcome.
    ///
    /// The message is queued before this returns; the reply (or failure) is
    /// collected on a background task and only logged.
    pub fn notify(&self, init: RpcRequestInit) {
        let method = init.method.clone();
        match self.start(init) {
            Ok((id, rx)) => {
                let port = self.clone();
                tokio::spawn(async move {
                    let _guard = PendingGuard { port: &port, id };
                    if let Err(e) = port.wait(rx).await {
                        debug!(port = %port.name(), method = %method, error = %e, "notification failed");
                    }
                });
            }
            Err(e) => debug!(port = %self.name(), method = %method, error = %e, "notification not sent"),
        }
    }

    /// Answer a request received on this port.
    pub fn respond(&self, response: RpcResponse) -> Result<(), PortError> {
        self.send(response.into())
    }

    /// Feed an incoming message. Responses resolve their pending request;
    /// requests are handed back to the caller for routing.
    pub fn dispatch(&self, message: RpcMessage) -> Option<RpcRequest> {
        match message {
            RpcMessage::Request(request) => Some(request),
            RpcMessage::Response(response) => {
                match self.inner.pending.remove(&response.id) {
                    Some((_, tx)) => {
                        let _ = tx.send(response);
                    }
                    None => trace!(port = %self.inner.name, id = %response.id, "response without pending request"),
                }
                None
            }
        }
    }
}

// ============================================================================
// Serving
// ============================================================================

/// Something that answers requests arriving on ports.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// `None` means the method is not handled here.
    async fn handle(&self, port: &Port, request: RpcRequestInit) -> Option<Result<Value, RpcError>>;
}

/// Pump `inbound` into `port` until either side ends, answering each
/// request on its own task. Closes the port on exit.
pub async fn serve_port<S>(port: Port, mut inbound: S, handler: Arc<dyn RequestHandler>)
where
    S: Stream<Item = RpcMessage> + Unpin,
{
    loop {
        let message = tokio::select! {
            message = inbound.next() => message,
            _ = port.closed() => None,
        };
        let Some(message) = message else { break };
        let Some(request) = port.dispatch(message) else { continue };

        let port = port.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            let RpcRequest { id, method, params, .. } = request;
            let result = match handler.handle(&port, RpcRequestInit::new(method.clone(), params)).await {
                Some(result) => result,
                None => Err(RpcError::method_not_found(&method)),
            };
            if let Err(e) = port.respond(RpcResponse::from_result(id, result)) {
                debug!(port = %port.name(), method = %method, error = %e, "response dropped");
            }
        });
    }
    port.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply_to(port: &Port, message: RpcMessage, result: Value) {
        match message {
            RpcMessage::Request(req) => {
                port.dispatch(RpcResponse::ok(req.id, result).into());
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_resolves_by_id() {
        let (port, mut rx) = Port::channel("script");
        let task = tokio::spawn({
            let port = port.clone();
            async move { port.request(RpcRequestInit::method("brume_origin")).await }
        });

        let message = rx.recv().await.unwrap();
        reply_to(&port, message, json!({"origin": "https://a.example"}));

        let value = task.await.unwrap().unwrap();
        assert_eq!(value["origin"], "https://a.example");
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let (port, mut rx) = Port::channel("script");
        let a = tokio::spawn({
            let port = port.clone();
            async move { port.request(RpcRequestInit::method("a")).await }
        });
        let first = rx.recv().await.unwrap();
        let b = tokio::spawn({
            let port = port.clone();
            async move { port.request(RpcRequestInit::method("b")).await }
        });
        let second = rx.recv().await.unwrap();

        reply_to(&port, second, json!("for b"));
        reply_to(&port, first, json!("for a"));

        assert_eq!(a.await.unwrap().unwrap(), json!("for a"));
        assert_eq!(b.await.unwrap().unwrap(), json!("for b"));
    }

    #[tokio::test]
    async fn test_error_response_is_rpc_error() {
        let (port, mut rx) = Port::channel("script");
        let task = tokio::spawn({
            let port = port.clone();
            async move { port.request(RpcRequestInit::method("x")).await }
        });
        if let RpcMessage::Request(req) = rx.recv().await.unwrap() {
            port.dispatch(RpcResponse::err(req.id, RpcError::new(4001, "rejected")).into());
        }
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, PortError::Rpc(ref e) if e.code == 4001));
    }

    #[tokio::test]
    async fn test_close_fails_pending_requests() {
        let (port, _rx) = Port::channel("script");
        let task = tokio::spawn({
            let port = port.clone();
            async move { port.request(RpcRequestInit::method("never")).await }
        });
        tokio::task::yield_now().await;
        port.close();
        assert_eq!(task.await.unwrap(), Err(PortError::Closed));
        assert_eq!(port.request(RpcRequestInit::method("late")).await, Err(PortError::Closed));
    }

    #[tokio::test]
    async fn test_dropped_transport_closes_port() {
        let (port, rx) = Port::channel("script");
        drop(rx);
        assert_eq!(port.request(RpcRequestInit::method("x")).await, Err(PortError::Closed));
        assert!(port.is_closed());
    }

    #[tokio::test]
    async fn test_notify_sends_immediately() {
        let (port, mut rx) = Port::channel("script");
        port.notify(RpcRequestInit::new("chainChanged", json!(["0x89"])));
        match rx.try_recv().unwrap() {
            RpcMessage::Request(req) => {
                assert_eq!(req.method, "chainChanged");
                assert_eq!(req.params, json!(["0x89"]));
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, _port: &Port, request: RpcRequestInit) -> Option<Result<Value, RpcError>> {
            (request.method == "echo").then(|| Ok(request.params))
        }
    }

    #[tokio::test]
    async fn test_serve_port_answers_and_rejects_unknown() {
        let (port, mut outbound) = Port::channel("foreground");
        let (tx, inbound) = mpsc::unbounded_channel::<RpcMessage>();
        let inbound = tokio_stream_from(inbound);
        let server = tokio::spawn(serve_port(port.clone(), inbound, Arc::new(Echo)));

        tx.send(RpcRequestInit::new("echo", json!([1])).with_id(RpcId::Number(1)).into()).unwrap();
        tx.send(RpcRequestInit::method("nope").with_id(RpcId::Number(2)).into()).unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            match outbound.recv().await.unwrap() {
                RpcMessage::Response(res) => seen.push(res),
                other => panic!("expected response, got {other:?}"),
            }
        }
        seen.sort_by_key(|r| r.id.to_string());
        assert_eq!(seen[0].clone().into_result().unwrap(), json!([1]));
        assert_eq!(seen[1].clone().into_result().unwrap_err().code, RpcError::METHOD_NOT_FOUND);

        drop(tx);
        server.await.unwrap();
        assert!(port.is_closed());
    }

    fn tokio_stream_from(mut rx: mpsc::UnboundedReceiver<RpcMessage>) -> impl Stream<Item = RpcMessage> + Unpin {
        Box::pin(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)))
    }
}
