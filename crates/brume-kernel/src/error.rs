//! Error type returned by every request handler.

use brume_types::RpcError;
use thiserror::Error;

use crate::crypto::CryptoError;
use crate::fetch::FetchError;
use crate::pool::PoolError;
use crate::popup::PopupError;
use crate::port::PortError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum BackgroundError {
    /// No user is logged in.
    #[error("locked")]
    Locked,

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unimplemented: {0}")]
    Unimplemented(String),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Popup(#[from] PopupError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T, E = BackgroundError> = std::result::Result<T, E>;

impl BackgroundError {
    pub fn not_found(what: impl Into<String>) -> Self {
        BackgroundError::NotFound(what.into())
    }

    /// The JSON-RPC error object sent back to the caller.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            BackgroundError::Locked => RpcError::new(RpcError::UNAUTHORIZED, "locked"),
            BackgroundError::InvalidParams(m) => RpcError::invalid_params(m.clone()),
            BackgroundError::Unimplemented(m) => RpcError::new(RpcError::UNIMPLEMENTED, format!("unimplemented: {m}")),
            BackgroundError::Port(PortError::Rpc(e)) => e.clone(),
            BackgroundError::Popup(PopupError::Cancelled) => {
                RpcError::new(RpcError::USER_REJECTED, "user rejected the request")
            }
            BackgroundError::Popup(PopupError::Rejected(e)) => e.clone(),
            BackgroundError::Storage(e @ StorageError::Exists(_)) => RpcError::invalid_params(e.to_string()),
            BackgroundError::Fetch(FetchError::Rpc(e)) => e.clone(),
            BackgroundError::Fetch(e) => RpcError::new(RpcError::UPSTREAM_ERROR, e.to_string()),
            BackgroundError::Rpc(e) => e.clone(),
            other => RpcError::internal(other.to_string()),
        }
    }
}

impl From<BackgroundError> for RpcError {
    fn from(e: BackgroundError) -> Self {
        e.to_rpc_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_codes() {
        assert_eq!(BackgroundError::Locked.to_rpc_error().code, RpcError::UNAUTHORIZED);
        assert_eq!(BackgroundError::InvalidParams("x".into()).to_rpc_error().code, RpcError::INVALID_PARAMS);
        assert_eq!(BackgroundError::Unimplemented("x".into()).to_rpc_error().code, RpcError::UNIMPLEMENTED);
        assert_eq!(BackgroundError::from(PopupError::Cancelled).to_rpc_error().code, RpcError::USER_REJECTED);
        assert_eq!(BackgroundError::from(FetchError::Timeout).to_rpc_error().code, RpcError::UPSTREAM_ERROR);
        assert_eq!(BackgroundError::not_found("session").to_rpc_error().code, RpcError::INTERNAL_ERROR);
        assert_eq!(
            BackgroundError::from(StorageError::Exists("user".into())).to_rpc_error().code,
            RpcError::INVALID_PARAMS
        );
    }

    #[test]
    fn test_upstream_rpc_error_passes_through() {
        let upstream = RpcError::new(-32010, "nonce too low");
        let err = BackgroundError::from(FetchError::Rpc(upstream.clone()));
        assert_eq!(err.to_rpc_error(), upstream);
    }
}
