//! # brume-server
//!
//! Runs the Brume background process as a local service.
//!
//! Ports arrive as TCP connections speaking newline-delimited JSON-RPC
//! ([`PortServer`]). Window management is forwarded to the extension's
//! `browser` port ([`PortBrowser`]) and all network traffic leaves through
//! SOCKS5 circuits on a Tor daemon ([`Socks5Connector`]).

pub mod browser;
pub mod constants;
pub mod listener;
pub mod socks;

pub use browser::{BridgeMethod, PortBrowser};
pub use listener::{ConnectionError, PortServer};
pub use socks::{Credentials, Socks5Circuit, Socks5Client, Socks5Connector, SocksError};
