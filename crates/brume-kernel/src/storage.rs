//! Global and per-user storage over the SQLite key/value table.
//!
//! Both stores hold [`RawState`] values keyed by cache key strings.
//! [`GlobalStorage`] writes them as plain JSON (user list, user records).
//! [`EncryptedStorage`] belongs to a logged-in user: the key is blinded with
//! the user's hasher and prefixed with the user id, the value is sealed with
//! the user's crypter.

use std::sync::Arc;

use brume_types::UserId;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::RawState;
use crate::crypto::{CryptoError, UserKeys, decode_b64, encode_b64};
use crate::db::KvDb;

pub type SharedDb = Arc<Mutex<KvDb>>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid stored value: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("already exists: {0}")]
    Exists(String),
}

/// A store of raw cache states.
pub trait Storage: Send + Sync {
    fn get_raw(&self, key: &str) -> Result<Option<RawState>, StorageError>;

    fn set_raw(&self, key: &str, state: &RawState) -> Result<(), StorageError>;

    fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Decode the data half of the state stored at `key`.
    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError>
    where
        Self: Sized,
    {
        match self.get_raw(key)?.and_then(|state| state.data) {
            Some(data) => Ok(Some(serde_json::from_value(data)?)),
            None => Ok(None),
        }
    }

    /// Store `value` as fresh data at `key`.
    fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<RawState, StorageError>
    where
        Self: Sized,
    {
        let state = RawState::data(serde_json::to_value(value)?);
        self.set_raw(key, &state)?;
        Ok(state)
    }
}

// ============================================================================
// Global
// ============================================================================

#[derive(Clone)]
pub struct GlobalStorage {
    db: SharedDb,
}

impl GlobalStorage {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }
}

impl Storage for GlobalStorage {
    fn get_raw(&self, key: &str) -> Result<Option<RawState>, StorageError> {
        let text = self.db.lock().get(key)?;
        Ok(text.map(|t| serde_json::from_str(&t)).transpose()?)
    }

    fn set_raw(&self, key: &str, state: &RawState) -> Result<(), StorageError> {
        let text = serde_json::to_string(state)?;
        self.db.lock().set(key, &text)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.db.lock().delete(key)?)
    }
}

// ============================================================================
// Encrypted (per user)
// ============================================================================

#[derive(Serialize, Deserialize)]
struct Sealed {
    iv: String,
    cipher: String,
}

pub struct EncryptedStorage {
    user: UserId,
    db: SharedDb,
    keys: UserKeys,
}

impl EncryptedStorage {
    pub fn new(user: UserId, db: SharedDb, keys: UserKeys) -> Self {
        Self { user, db, keys }
    }

    fn row_key(&self, key: &str) -> String {
        format!("{}:{}", self.user, hex::encode(self.keys.hasher.hash(key.as_bytes())))
    }
}

impl Storage for EncryptedStorage {
    fn get_raw(&self, key: &str) -> Result<Option<RawState>, StorageError> {
        let Some(text) = self.db.lock().get(&self.row_key(key))? else {
            return Ok(None);
        };
        let sealed: Sealed = serde_json::from_str(&text)?;
        let plain = self.keys.crypter.decrypt(&decode_b64(&sealed.iv)?, &decode_b64(&sealed.cipher)?)?;
        Ok(Some(serde_json::from_slice(&plain)?))
    }

    fn set_raw(&self, key: &str, state: &RawState) -> Result<(), StorageError> {
        let plain = serde_json::to_vec(state)?;
        let (iv, cipher) = self.keys.crypter.encrypt_random(&plain)?;
        let sealed = Sealed { iv: encode_b64(&iv), cipher: encode_b64(&cipher) };
        self.db.lock().set(&self.row_key(key), &serde_json::to_string(&sealed)?)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.db.lock().delete(&self.row_key(key))?)
    }
}

impl std::fmt::Debug for EncryptedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedStorage").field("user", &self.user).finish_non_exhaustive()
    }
}
