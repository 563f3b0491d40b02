//! Port connections over a local socket.
//!
//! One TCP connection carries one port. Frames are newline-delimited:
//!
//! ```text
//! client ─► "foreground\n"                         port name, once
//! client ─► {"jsonrpc":"2.0","id":1,"method":...}\n   requests and responses,
//! client ◄─ {"jsonrpc":"2.0","id":1,"result":...}\n   both directions
//! ```
//!
//! A connection named `browser` also becomes the window bridge of the
//! shared [`PortBrowser`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use brume_kernel::constants::BROWSER_PORT;
use brume_kernel::{Background, Port, RequestHandler, serve_port};
use brume_types::RpcMessage;
use futures::{Sink, SinkExt, Stream, StreamExt, stream};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use crate::browser::PortBrowser;
use crate::constants::{HANDSHAKE_TIMEOUT, MAX_LINE_LENGTH};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection closed before naming its port")]
    Unnamed,

    #[error("timed out waiting for the port name")]
    HandshakeTimeout,

    #[error("frame error: {0}")]
    Frame(#[from] LinesCodecError),
}

/// Accepts port connections and hands them to the background.
pub struct PortServer {
    background: Arc<Background>,
    browser: Arc<PortBrowser>,
}

impl PortServer {
    /// `browser` must be the same instance the background was built with.
    pub fn new(background: Arc<Background>, browser: Arc<PortBrowser>) -> Arc<Self> {
        Arc::new(Self { background, browser })
    }

    pub fn background(&self) -> &Arc<Background> {
        &self.background
    }

    /// Bind `addr` and serve until the process exits.
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        info!(addr = %listener.local_addr()?, "listening for ports");
        loop {
            let (socket, peer) = listener.accept().await?;
            let _ = socket.set_nodelay(true);
            let server = self.clone();
            tokio::spawn(async move {
                debug!(%peer, "connection accepted");
                if let Err(e) = server.serve_connection(socket).await {
                    warn!(%peer, error = %e, "connection failed");
                }
                debug!(%peer, "connection closed");
            });
        }
    }

    /// Run one port over `stream` until either side closes it.
    pub async fn serve_connection<S>(&self, stream: S) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let name = match tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
            Ok(Some(line)) => line?.trim().to_string(),
            Ok(None) => return Err(ConnectionError::Unnamed),
            Err(_) => return Err(ConnectionError::HandshakeTimeout),
        };
        if name.is_empty() {
            return Err(ConnectionError::Unnamed);
        }

        let (port, outbound) = Port::channel(name.clone());
        info!(port = %name, id = ?port.id(), "port connected");
        if name == BROWSER_PORT {
            self.browser.attach(port.clone());
        }

        let (sink, lines) = framed.split();
        let writer = tokio::spawn(write_frames(sink, outbound, name.clone()));
        let handler: Arc<dyn RequestHandler> = self.background.clone();
        serve_port(port, read_frames(lines, name), handler).await;
        writer.abort();
        Ok(())
    }
}

/// Decode inbound lines, skipping blank and malformed ones. Ends on EOF or
/// a framing error.
fn read_frames<S>(lines: S, name: String) -> impl Stream<Item = RpcMessage> + Unpin
where
    S: Stream<Item = Result<String, LinesCodecError>> + Unpin,
{
    Box::pin(stream::unfold((lines, name), |(mut lines, name)| async move {
        loop {
            match lines.next().await? {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => match serde_json::from_str::<RpcMessage>(&line) {
                    Ok(message) => return Some((message, (lines, name))),
                    Err(e) => warn!(port = %name, error = %e, "dropping malformed frame"),
                },
                Err(e) => {
                    warn!(port = %name, error = %e, "framing error");
                    return None;
                }
            }
        }
    }))
}

async fn write_frames<S>(mut sink: S, mut outbound: mpsc::UnboundedReceiver<RpcMessage>, name: String)
where
    S: Sink<String, Error = LinesCodecError> + Unpin,
{
    while let Some(message) = outbound.recv().await {
        let line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(e) => {
                warn!(port = %name, error = %e, "unserializable message");
                continue;
            }
        };
        if let Err(e) = sink.send(line).await {
            debug!(port = %name, error = %e, "write failed");
            break;
        }
    }
}
