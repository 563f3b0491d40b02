//! Shared records and wire types for the Brume background process.
//!
//! This crate is the leaf of the workspace: typed ids, JSON-RPC envelopes,
//! the wallet / seed / user / session / request records, and the static
//! chain registries. It has **no internal dependencies**.
//!
//! # Entity Overview
//!
//! ```text
//! User (UserId)
//!     └── owns encrypted storage
//!             └── Seed (SeedId)       seed/{uuid}
//!             └── Wallet (WalletId)   wallet/{uuid}
//!             └── Session per origin  persistentSession/{origin}
//!
//! Session (SessionId) ← origin + [WalletRef] + EthereumChain
//!     └── subscribed scripts (PortId), in memory only
//!
//! AppRequest (RequestId) ← pending popup approval, request/{uuid}
//! ```
//!
//! # Key Types
//!
//! |--------------------|--------------------------------------------|
//! | Type               | Purpose                                    |
//! |--------------------|--------------------------------------------|
//! | [`RpcRequest`]     | JSON-RPC request on a port                 |
//! | [`RpcResponse`]    | JSON-RPC response on a port                |
//! | [`WalletData`]     | Canonical wallet record with key material  |
//! | [`WalletRef`]      | `{ref: true, uuid}` pointer to a wallet    |
//! | [`SessionData`]    | Origin ↔ wallets + chain binding           |
//! | [`AppRequestData`] | Pending popup approval                     |
//! | [`EthereumChain`]  | Chain registry entry                       |
//! |--------------------|--------------------------------------------|

pub mod chain;
pub mod ids;
pub mod request;
pub mod rpc;
pub mod seed;
pub mod session;
pub mod user;
pub mod wallet;

pub use chain::{
    ContractTokenInfo, EthereumChain, NativeTokenInfo, PairInfo, chain_by_id, chains,
    pair_by_address, parse_chain_id, token_by_address,
};
pub use ids::{PortId, RequestId, SeedId, SessionId, UserId, WalletId};
pub use request::{AppRequestData, Mouse, app_request_key};
pub use rpc::{RpcError, RpcId, RpcMessage, RpcOutcome, RpcRequest, RpcRequestInit, RpcResponse};
pub use seed::{EncryptedMnemonic, SeedData, SeedRef, seed_key};
pub use session::{OriginData, SessionData, origin_key, persistent_session_key};
pub use user::{UserData, UserInit, UserRef, user_key};
pub use wallet::{EthereumPrivateKeyWallet, EthereumWallet, Wallet, WalletData, WalletRef, wallet_key};

/// Current time as Unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
