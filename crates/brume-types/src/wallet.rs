//! Wallet records and references.
//!
//! A [`WalletData`] is the one canonical record holding key material; it is
//! stored encrypted under `wallet/{uuid}`. Everything else (sessions, lists,
//! brume subpools) holds a [`WalletRef`] and resolves it by uuid.

use serde::{Deserialize, Serialize};

use crate::ids::WalletId;

/// Marker that serializes as `true` and only deserializes from `true`.
///
/// Gives [`Wallet`] an explicit discriminant: `{"ref": true, "uuid": ..}`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RefTag;

impl Serialize for RefTag {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bool(true)
    }
}

impl<'de> Deserialize<'de> for RefTag {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        match bool::deserialize(d)? {
            true => Ok(RefTag),
            false => Err(serde::de::Error::custom("expected `ref: true`")),
        }
    }
}

/// A reference to a wallet by uuid, without secret material.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WalletRef {
    #[serde(rename = "ref")]
    pub tag: RefTag,
    pub uuid: WalletId,
}

impl WalletRef {
    pub fn new(uuid: WalletId) -> Self {
        Self { tag: RefTag, uuid }
    }
}

/// An Ethereum account backed by a raw private key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthereumPrivateKeyWallet {
    pub uuid: WalletId,
    pub name: String,
    pub color: u32,
    pub emoji: String,
    pub private_key: String,
    pub address: String,
}

// Key material stays out of logs.
impl std::fmt::Debug for EthereumPrivateKeyWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EthereumPrivateKeyWallet")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Full wallet records, discriminated by `coin` + `type`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "coin", rename_all = "lowercase")]
pub enum WalletData {
    Ethereum(EthereumWallet),
}

/// Ethereum wallet kinds, discriminated by `type`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EthereumWallet {
    PrivateKey(EthereumPrivateKeyWallet),
}

impl WalletData {
    pub fn uuid(&self) -> WalletId {
        match self {
            WalletData::Ethereum(EthereumWallet::PrivateKey(w)) => w.uuid,
        }
    }

    /// The account address this wallet signs for.
    pub fn address(&self) -> &str {
        match self {
            WalletData::Ethereum(EthereumWallet::PrivateKey(w)) => &w.address,
        }
    }

    pub fn to_ref(&self) -> WalletRef {
        WalletRef::new(self.uuid())
    }
}

impl From<EthereumPrivateKeyWallet> for WalletData {
    fn from(w: EthereumPrivateKeyWallet) -> Self {
        WalletData::Ethereum(EthereumWallet::PrivateKey(w))
    }
}

/// Either form, as received from the foreground.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Wallet {
    Ref(WalletRef),
    Data(WalletData),
}

impl Wallet {
    pub fn uuid(&self) -> WalletId {
        match self {
            Wallet::Ref(r) => r.uuid,
            Wallet::Data(d) => d.uuid(),
        }
    }

    pub fn to_ref(&self) -> WalletRef {
        WalletRef::new(self.uuid())
    }
}

/// Storage key of the canonical record for a wallet.
pub fn wallet_key(uuid: WalletId) -> String {
    format!("wallet/{uuid}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> WalletData {
        EthereumPrivateKeyWallet {
            uuid: WalletId::new(),
            name: "Main".into(),
            color: 3,
            emoji: "🐳".into(),
            private_key: "0x01".into(),
            address: "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf".into(),
        }
        .into()
    }

    #[test]
    fn test_wallet_data_wire_shape() {
        let data = sample();
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["coin"], "ethereum");
        assert_eq!(value["type"], "privateKey");
        assert_eq!(value["privateKey"], "0x01");
        let back: WalletData = serde_json::from_value(value).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_ref_discriminant() {
        let data = sample();
        let r = serde_json::to_value(data.to_ref()).unwrap();
        assert_eq!(r, json!({ "ref": true, "uuid": data.uuid().to_string() }));

        let wallet: Wallet = serde_json::from_value(r).unwrap();
        assert!(matches!(wallet, Wallet::Ref(_)));

        let wallet: Wallet = serde_json::from_value(serde_json::to_value(&data).unwrap()).unwrap();
        assert!(matches!(wallet, Wallet::Data(_)));
    }

    #[test]
    fn test_ref_false_is_rejected() {
        let bad = json!({ "ref": false, "uuid": WalletId::new().to_string() });
        assert!(serde_json::from_value::<WalletRef>(bad).is_err());
    }

    #[test]
    fn test_debug_hides_private_key() {
        let shown = format!("{:?}", sample());
        assert!(!shown.contains("0x01"));
    }
}
