//! Default values shared across the kernel.
//!
//! Every value here is the default for a field of
//! [`BackgroundConfig`](crate::config::BackgroundConfig).

use std::time::Duration;

/// SOCKS5 endpoint of a local Tor daemon.
pub const DEFAULT_TOR_PROXY: &str = "127.0.0.1:9050";

/// Anonymizing client connections kept open.
pub const TOR_POOL_CAPACITY: usize = 9;

/// Circuits kept ready across all clients.
pub const CIRCUIT_POOL_CAPACITY: usize = 9;

/// Ethereum brumes (circuit + chosen endpoints) kept ready.
pub const BRUME_POOL_CAPACITY: usize = 9;

/// Brumes reserved for each active wallet.
pub const BRUMES_PER_WALLET: usize = 3;

/// Attempts made by a retry loop before giving up.
pub const RETRY_MAX_ATTEMPTS: u32 = 3;

/// First backoff step of a retry loop; doubles on each retry.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Upper bound of the backoff.
pub const RETRY_MAX_DELAY: Duration = Duration::from_millis(30_000);

pub const POPUP_WIDTH: u32 = 400;
pub const POPUP_HEIGHT: u32 = 630;

/// How long a freshly created popup has to say hello.
pub const POPUP_HELLO_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a transaction approval and its broadcast may take.
pub const SEND_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(600);

/// Timeout for ordinary Ethereum fetches.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Endpoint of the anonymous usage beacon.
pub const LOG_URL: &str = "https://proxy.brume.money";

/// PBKDF2-SHA256 rounds for password-derived keys.
pub const KDF_ITERATIONS: u32 = 100_000;

/// Capacity of the cache and pool flow buses.
pub const FLOW_BUS_CAPACITY: usize = 256;

/// Route the foreground starts on.
pub const DEFAULT_PATH: &str = "/";

/// Port name used by the extension UI (popup and full tab).
pub const FOREGROUND_PORT: &str = "foreground";

/// Port name used by the window-management bridge.
pub const BROWSER_PORT: &str = "browser";
