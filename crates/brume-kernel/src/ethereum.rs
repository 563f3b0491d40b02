//! Ethereum queries and the cached fetch.
//!
//! Wallet-scoped requests are routed to a typed [`EthereumQuery`]. Every
//! query has a cache key derived from chain, method and params; a successful
//! fetch is written to the user's storage and the raw cache (which notifies
//! subscribers), a failed one leaves both untouched.

use std::time::Duration;

use alloy_primitives::U256;
use brume_types::{EthereumChain, PairInfo, RpcRequestInit, pair_by_address, token_by_address};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::brumes::{BrumePool, ethereum_fetch};
use crate::cache::{CacheCore, RawState};
use crate::error::{BackgroundError, Result};
use crate::fetch::{FetchError, FetchInit};
use crate::looped::RetrySettings;
use crate::storage::Storage;

/// ERC-20 `balanceOf(address)`.
const BALANCE_OF: &str = "0x70a08231";

/// Uniswap-v2 `getReserves()`.
const GET_RESERVES: &str = "0x0902f1ac";

/// A decimal fixed-point amount: `value / 10^decimals`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedInit {
    pub value: String,
    pub decimals: u8,
}

/// Everything a query needs to reach the network.
#[derive(Clone, Debug)]
pub struct EthereumContext {
    pub chain: &'static EthereumChain,
    pub brumes: BrumePool,
    pub retry: RetrySettings,
    pub timeout: Duration,
}

impl EthereumContext {
    /// Raw JSON-RPC call on this chain.
    pub async fn fetch(&self, request: &RpcRequestInit, timeout: Duration) -> Result<Value, FetchError> {
        let init = FetchInit::default().with_timeout(timeout);
        ethereum_fetch(&self.brumes, self.chain.chain_id, request, &init, &self.retry).await
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum EthereumQuery {
    Balance { address: String, block: String },
    TokenBalance { account: String, token: String, decimals: u8, block: String },
    PairPrice { pair: &'static PairInfo },
    Unknown(RpcRequestInit),
}

impl EthereumQuery {
    /// Map a wallet request onto a query.
    pub fn route(request: &RpcRequestInit) -> Result<Self> {
        match request.method.as_str() {
            "eth_getBalance" => {
                let (address, block): (String, String) = request.params()?;
                Ok(EthereumQuery::Balance { address, block })
            }
            "eth_getTokenBalance" => {
                let (account, token, block): (String, String, String) = request.params()?;
                let info = token_by_address(&token).ok_or_else(|| BackgroundError::not_found(format!("token {token}")))?;
                Ok(EthereumQuery::TokenBalance { account, token: info.address.clone(), decimals: info.decimals, block })
            }
            "eth_getPairPrice" => {
                let (address,): (String,) = request.params()?;
                let pair = pair_by_address(&address).ok_or_else(|| BackgroundError::not_found(format!("pair {address}")))?;
                Ok(EthereumQuery::PairPrice { pair })
            }
            _ => Ok(EthereumQuery::Unknown(request.clone())),
        }
    }

    fn method_and_params(&self) -> (String, Value) {
        match self {
            EthereumQuery::Balance { address, block } => ("eth_getBalance".into(), json!([address, block])),
            EthereumQuery::TokenBalance { account, token, block, .. } => {
                ("eth_getTokenBalance".into(), json!([account, token, block]))
            }
            EthereumQuery::PairPrice { pair } => ("eth_getPairPrice".into(), json!([pair.address])),
            EthereumQuery::Unknown(request) => (request.method.clone(), request.params.clone()),
        }
    }

    /// Cache key: `{"chainId":..,"method":..,"params":..}`.
    pub fn cache_key(&self, chain_id: u64) -> String {
        let (method, params) = self.method_and_params();
        json!({ "chainId": chain_id, "method": method, "params": params }).to_string()
    }

    /// Fetch the current value from the network.
    pub async fn fetch(&self, ctx: &EthereumContext) -> Result<Value, FetchError> {
        match self {
            EthereumQuery::Balance { address, block } => {
                let request = RpcRequestInit::new("eth_getBalance", json!([address, block]));
                let hex = ctx.fetch(&request, ctx.timeout).await?;
                let value = hex_to_decimal(as_str(&hex)?)?;
                Ok(json!(FixedInit { value, decimals: ctx.chain.token.decimals }))
            }
            EthereumQuery::TokenBalance { account, token, decimals, block } => {
                let data = format!("{BALANCE_OF}{}", pad_address(account));
                let request = RpcRequestInit::new("eth_call", json!([{ "to": token, "data": data }, block]));
                let hex = ctx.fetch(&request, ctx.timeout).await?;
                let value = hex_to_decimal(as_str(&hex)?)?;
                Ok(json!(FixedInit { value, decimals: *decimals }))
            }
            EthereumQuery::PairPrice { pair } => {
                let request = RpcRequestInit::new("eth_call", json!([{ "to": pair.address, "data": GET_RESERVES }, "pending"]));
                let hex = ctx.fetch(&request, ctx.timeout).await?;
                let price = pair_price(pair, as_str(&hex)?)?;
                Ok(json!(price))
            }
            EthereumQuery::Unknown(request) => ctx.fetch(request, ctx.timeout).await,
        }
    }
}

/// Fetch `query`, storing the value on success.
pub async fn fetch_cached<S: Storage>(
    query: &EthereumQuery,
    ctx: &EthereumContext,
    cache: &CacheCore,
    storage: &S,
) -> Result<Value> {
    let key = query.cache_key(ctx.chain.chain_id);
    let value = query.fetch(ctx).await?;

    let state = RawState::data(value.clone());
    storage.set_raw(&key, &state)?;
    cache.set(&key, Some(state));
    debug!(key, "ethereum query cached");
    Ok(value)
}

fn as_str(value: &Value) -> Result<&str, FetchError> {
    value.as_str().ok_or_else(|| FetchError::Decode(format!("expected hex string, got {value}")))
}

fn pad_address(address: &str) -> String {
    let raw = address.trim_start_matches("0x").to_lowercase();
    format!("{raw:0>64}")
}

/// `0x`-prefixed big-endian hex (up to uint256) to a decimal string.
pub fn hex_to_decimal(hex: &str) -> Result<String, FetchError> {
    let digits = hex.trim_start_matches("0x").trim_start_matches('0');
    if digits.is_empty() {
        return Ok("0".into());
    }
    U256::from_str_radix(digits, 16)
        .map(|n| n.to_string())
        .map_err(|e| FetchError::Decode(format!("bad quantity {hex}: {e}")))
}

/// Price of `token0` in `token1` from `getReserves` output, as 18-decimal fixed point.
pub fn pair_price(pair: &PairInfo, reserves: &str) -> Result<FixedInit, FetchError> {
    let data = hex::decode(reserves.trim_start_matches("0x"))
        .map_err(|e| FetchError::Decode(format!("bad reserves {reserves}: {e}")))?;
    if data.len() < 64 {
        return Err(FetchError::Decode(format!("short reserves: {reserves}")));
    }
    let word = |i: usize| -> f64 {
        let amount = U256::from_be_slice(&data[i * 32..(i + 1) * 32]);
        amount.to_string().parse::<f64>().unwrap_or(0.0)
    };
    let decimals = |address: &str| token_by_address(address).map(|t| t.decimals).unwrap_or(18);

    let amount0 = word(0) / 10f64.powi(decimals(&pair.token0) as i32);
    let amount1 = word(1) / 10f64.powi(decimals(&pair.token1) as i32);
    if amount0 == 0.0 || amount1 == 0.0 {
        return Err(FetchError::Decode(format!("empty reserves for {}", pair.address)));
    }

    let price = if pair.reversed { amount0 / amount1 } else { amount1 / amount0 };
    Ok(FixedInit { value: format!("{:.0}", price * 1e18), decimals: 18 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_to_decimal() {
        assert_eq!(hex_to_decimal("0x0").unwrap(), "0");
        assert_eq!(hex_to_decimal("0x").unwrap(), "0");
        assert_eq!(hex_to_decimal("0xde0b6b3a7640000").unwrap(), "1000000000000000000");
        assert!(hex_to_decimal("0xzz").is_err());
    }

    #[test]
    fn test_hex_to_decimal_keeps_uint256_precision() {
        assert_eq!(
            hex_to_decimal("0x100000000000000000000000000000000").unwrap(),
            "340282366920938463463374607431768211456"
        );
        let max = format!("0x{}", "f".repeat(64));
        assert_eq!(
            hex_to_decimal(&max).unwrap(),
            "115792089237316195423570985008687907853269984665640564039457584007913129639935"
        );
        assert!(hex_to_decimal(&format!("0x1{}", "0".repeat(64))).is_err());
    }

    #[test]
    fn test_cache_key_shape() {
        let query = EthereumQuery::route(&RpcRequestInit::new("eth_getBalance", json!(["0xabc", "pending"]))).unwrap();
        let key: Value = serde_json::from_str(&query.cache_key(1)).unwrap();
        assert_eq!(key, json!({"chainId": 1, "method": "eth_getBalance", "params": ["0xabc", "pending"]}));
    }

    #[test]
    fn test_unknown_methods_pass_through() {
        let request = RpcRequestInit::new("eth_blockNumber", json!([]));
        assert_eq!(EthereumQuery::route(&request).unwrap(), EthereumQuery::Unknown(request));
    }

    #[test]
    fn test_bad_params_are_invalid_params() {
        let err = EthereumQuery::route(&RpcRequestInit::new("eth_getBalance", json!(["0xabc"]))).unwrap_err();
        assert_eq!(err.to_rpc_error().code, brume_types::RpcError::INVALID_PARAMS);
    }

    #[test]
    fn test_pad_address() {
        let padded = pad_address("0xAbC");
        assert_eq!(padded.len(), 64);
        assert!(padded.ends_with("abc"));
    }

    #[test]
    fn test_pair_price() {
        let pair = PairInfo {
            chain_id: 1,
            name: "X/Y".into(),
            address: "0xpair".into(),
            token0: "0xunknown0".into(),
            token1: "0xunknown1".into(),
            reversed: false,
        };
        // reserve0 = 1e18, reserve1 = 2e18, timestamp = 0
        let reserves = format!("0x{:064x}{:064x}{:064x}", 1_000_000_000_000_000_000u128, 2_000_000_000_000_000_000u128, 0);
        let price = pair_price(&pair, &reserves).unwrap();
        assert_eq!(price, FixedInit { value: "2000000000000000000".into(), decimals: 18 });

        let reversed = PairInfo { reversed: true, ..pair };
        assert_eq!(pair_price(&reversed, &reserves).unwrap().value, "500000000000000000");
    }

    #[test]
    fn test_pair_price_rejects_garbage() {
        let pair = PairInfo {
            chain_id: 1,
            name: "X/Y".into(),
            address: "0xpair".into(),
            token0: "0xunknown0".into(),
            token1: "0xunknown1".into(),
            reversed: false,
        };
        let multibyte = format!("0x{}é{}", "0".repeat(63), "1".repeat(64));
        assert!(matches!(pair_price(&pair, &multibyte), Err(FetchError::Decode(_))));
        assert!(matches!(pair_price(&pair, "0x1234"), Err(FetchError::Decode(_))));
        assert!(matches!(pair_price(&pair, &format!("0x{}", "z".repeat(128))), Err(FetchError::Decode(_))));
    }
}
