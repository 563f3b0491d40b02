//! # brume-kernel
//!
//! The background process of the Brume wallet, minus its transports.
//!
//! A [`Background`] answers JSON-RPC requests arriving on [`Port`]s:
//! - Content scripts relay page requests (`brume_run`); wallet methods are
//!   approved through a single popup window, the rest go to the chain
//! - The foreground manages users, seeds and wallets, and reads or
//!   subscribes to the raw cache
//! - The browser bridge reports closed windows
//!
//! Network traffic never leaves without anonymization: every fetch runs
//! over a circuit taken from a pool chain built on a [`TorConnector`].
//! Sessions bind an origin to wallets and a chain, and may persist in the
//! user's encrypted storage.

pub mod background;
pub mod brumes;
pub mod cache;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod db;
pub mod error;
pub mod ethereum;
pub mod fetch;
pub mod flows;
pub mod looped;
pub mod pool;
pub mod popup;
pub mod port;
pub mod router;
pub mod sessions;
pub mod storage;
pub mod tor;
pub mod users;

pub use background::Background;
pub use brumes::{BrumePool, EthereumBrume, WalletBrumes, brume_pool, brume_pool_with, ethereum_fetch};
pub use cache::{CacheCore, RawState};
pub use config::{BackgroundConfig, ConfigError};
pub use crypto::{CryptoError, UserKeys};
pub use db::{KvDb, KvRecord};
pub use error::{BackgroundError, Result};
pub use ethereum::{EthereumContext, EthereumQuery, FixedInit, fetch_cached};
pub use fetch::{FetchError, FetchInit, FetchResponse, fetch, fetch_rpc};
pub use flows::{CacheFlow, FlowBus, FlowMessage, HasSubject, PoolFlow, Subscription, matches_pattern};
pub use looped::{LoopError, Looped, RetrySettings, try_loop};
pub use pool::{Lease, Pool, PoolError, PoolParams};
pub use popup::{Browser, PopupBroker, PopupError, PopupRect, TabId, WindowId, WindowInfo};
pub use port::{Port, PortError, RequestHandler, serve_port};
pub use sessions::SessionManager;
pub use storage::{EncryptedStorage, GlobalStorage, SharedDb, Storage, StorageError};
pub use tor::{
    AsyncStream, Circuit, CircuitPool, CircuitStream, TorClient, TorConnector, TorPool, TransportError,
    circuit_pool, tor_pool,
};
pub use users::UserSession;
