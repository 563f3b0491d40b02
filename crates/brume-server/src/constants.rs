//! Server constants.

use std::time::Duration;

/// Default address the port listener binds to.
///
/// Loopback only: the extension bridge and the UI run on the same machine.
pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:9595";

/// Longest accepted frame, in bytes. Longer lines drop the connection.
pub const MAX_LINE_LENGTH: usize = 4 * 1024 * 1024;

/// How long a connection may take to send its port name.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a SOCKS5 proxy may take to accept a connection or finish a CONNECT.
pub const PROXY_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Bytes of randomness in each circuit's SOCKS username.
///
/// Tor isolates streams by SOCKS credentials, so every circuit gets its own.
pub const ISOLATION_TOKEN_BYTES: usize = 16;
