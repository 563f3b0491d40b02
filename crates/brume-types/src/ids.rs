//! Typed identifiers for sessions, approval requests, wallets, seeds and users.
//!
//! All ID types wrap a random UUIDv4. On the wire they are the standard
//! hyphenated UUID string, which is also what the foreground and the popup
//! send back. The `short()` form is for log lines only, never a lookup key.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A wallet session identifier.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

/// A pending popup approval request identifier.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(uuid::Uuid);

/// A wallet identifier. Canonical records are stored under `wallet/{id}`.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletId(uuid::Uuid);

/// A seed identifier.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeedId(uuid::Uuid);

/// A user identifier.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(uuid::Uuid);

/// Identifier of a connected port (one per content script or foreground).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(uuid::Uuid);

// ── Shared behavior ─────────────────────────────────────────────────────────

macro_rules! impl_typed_id {
    ($T:ident, $name:literal) => {
        impl $T {
            /// Create a new random ID (UUIDv4).
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// First 8 hex characters, for display only.
            pub fn short(&self) -> String {
                self.0.as_simple().to_string()[..8].to_string()
            }

            /// Parse from a hex string (32 chars, no hyphens) or standard UUID format.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                uuid::Uuid::parse_str(s).map(Self)
            }

            /// A nil ID, for sentinel values only.
            pub fn nil() -> Self {
                Self(uuid::Uuid::nil())
            }

            /// Check if this is the nil ID.
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<uuid::Uuid> for $T {
            fn from(u: uuid::Uuid) -> Self {
                Self(u)
            }
        }

        impl From<$T> for uuid::Uuid {
            fn from(id: $T) -> uuid::Uuid {
                id.0
            }
        }

        impl FromStr for $T {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl fmt::Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $name, self.short())
            }
        }
    };
}

impl_typed_id!(SessionId, "SessionId");
impl_typed_id!(RequestId, "RequestId");
impl_typed_id!(WalletId, "WalletId");
impl_typed_id!(SeedId, "SeedId");
impl_typed_id!(UserId, "UserId");
impl_typed_id!(PortId, "PortId");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_hyphenated_uuid() {
        let id = SessionId::new();
        let shown = id.to_string();
        assert_eq!(shown.len(), 36);
        assert_eq!(SessionId::parse(&shown).unwrap(), id);
    }

    #[test]
    fn test_short_is_prefix() {
        let id = WalletId::new();
        assert_eq!(id.short().len(), 8);
        assert!(id.to_string().replace('-', "").starts_with(&id.short()));
    }

    #[test]
    fn test_serde_transparent() {
        let id = RequestId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: RequestId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_unique_and_nil() {
        assert_ne!(UserId::new(), UserId::new());
        assert!(SeedId::nil().is_nil());
        assert!(!SeedId::new().is_nil());
    }
}
