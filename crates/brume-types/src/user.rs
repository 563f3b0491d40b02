//! User records.
//!
//! A user is created from a [`UserInit`] carrying the password; the stored
//! [`UserData`] keeps only the PBKDF2 salt and a verifier derived from the
//! same key material, never the password itself.

use serde::{Deserialize, Serialize};

use crate::ids::UserId;
use crate::wallet::RefTag;

/// What the foreground sends to `brume_createUser`.
#[derive(Clone, Deserialize, Serialize)]
pub struct UserInit {
    pub uuid: UserId,
    pub name: String,
    pub color: u32,
    pub emoji: String,
    pub password: String,
}

impl std::fmt::Debug for UserInit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserInit")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Stored user record, under `user/{uuid}` in global storage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserData {
    pub uuid: UserId,
    pub name: String,
    pub color: u32,
    pub emoji: String,
    /// Base64 PBKDF2 salt.
    pub salt: String,
    /// Base64 HMAC of a fixed label under the derived key.
    pub verifier: String,
    /// PBKDF2 rounds used to derive the key.
    #[serde(default = "default_iterations")]
    pub iterations: u32,
}

fn default_iterations() -> u32 {
    100_000
}

impl UserData {
    pub fn to_ref(&self) -> UserRef {
        UserRef { tag: RefTag, uuid: self.uuid }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserRef {
    #[serde(rename = "ref")]
    pub tag: RefTag,
    pub uuid: UserId,
}

pub fn user_key(uuid: UserId) -> String {
    format!("user/{uuid}")
}
