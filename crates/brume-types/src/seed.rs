//! Seed records.
//!
//! Mnemonic entropy is encrypted by the foreground through `brume_encrypt`
//! before it is sent here, so a seed record only ever holds `{iv, cipher}`.
//! Ledger seeds carry no secret at all.

use serde::{Deserialize, Serialize};

use crate::ids::SeedId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMnemonic {
    /// Base64 IV.
    pub iv: String,
    /// Base64 ciphertext.
    pub cipher: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SeedData {
    Mnemonic {
        uuid: SeedId,
        name: String,
        color: u32,
        emoji: String,
        mnemonic: EncryptedMnemonic,
    },
    Ledger {
        uuid: SeedId,
        name: String,
        color: u32,
        emoji: String,
    },
}

impl SeedData {
    pub fn uuid(&self) -> SeedId {
        match self {
            SeedData::Mnemonic { uuid, .. } | SeedData::Ledger { uuid, .. } => *uuid,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            SeedData::Mnemonic { name, .. } | SeedData::Ledger { name, .. } => name,
        }
    }
}

/// A reference to a seed, as kept in the `seeds` list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeedRef {
    #[serde(rename = "ref")]
    pub tag: crate::wallet::RefTag,
    pub uuid: SeedId,
}

impl SeedRef {
    pub fn new(uuid: SeedId) -> Self {
        Self { tag: crate::wallet::RefTag, uuid }
    }
}

pub fn seed_key(uuid: SeedId) -> String {
    format!("seed/{uuid}")
}
