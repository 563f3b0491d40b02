//! Wallet session records.
//!
//! A session binds a web origin to the wallets and chain it may use. The same
//! [`SessionData`] value is held in memory as the temporary session and,
//! when the user opted in, stored per origin as the persistent session.

use serde::{Deserialize, Serialize};

use crate::chain::EthereumChain;
use crate::ids::SessionId;
use crate::wallet::WalletRef;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    pub id: SessionId,
    pub origin: String,
    pub wallets: Vec<WalletRef>,
    pub chain: EthereumChain,
}

impl SessionData {
    pub fn new(origin: impl Into<String>, wallets: Vec<WalletRef>, chain: EthereumChain) -> Self {
        Self { id: SessionId::new(), origin: origin.into(), wallets, chain }
    }

    /// The wallet requests are signed and fetched with.
    pub fn primary_wallet(&self) -> Option<&WalletRef> {
        self.wallets.first()
    }

    /// Same session with the chain replaced.
    pub fn with_chain(&self, chain: EthereumChain) -> Self {
        Self { chain, ..self.clone() }
    }
}

/// What a content script reports about its page in reply to `brume_origin`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginData {
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// Storage key of the persistent session for an origin.
pub fn persistent_session_key(origin: &str) -> String {
    format!("persistentSession/{origin}")
}

/// Storage key of the last-seen page metadata for an origin.
pub fn origin_key(origin: &str) -> String {
    format!("origin/{origin}")
}
