//! Static chain, token and pair registries.
//!
//! Read-only configuration consumed by the fetch layer: chain id → RPC
//! endpoints, explorer and native token; contract tokens and Uniswap-v2
//! style pairs by address. Address lookups are case-insensitive.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

/// Native token of a chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeTokenInfo {
    pub name: String,
    pub chain_id: u64,
    pub symbol: String,
    pub decimals: u8,
    #[serde(default)]
    pub pairs: Vec<String>,
}

/// An ERC-20 token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractTokenInfo {
    pub name: String,
    pub chain_id: u64,
    pub symbol: String,
    pub decimals: u8,
    pub address: String,
    #[serde(default)]
    pub pairs: Vec<String>,
}

/// A Uniswap-v2 style pair whose reserves give a price.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairInfo {
    pub chain_id: u64,
    pub name: String,
    pub address: String,
    pub token0: String,
    pub token1: String,
    #[serde(default)]
    pub reversed: bool,
}

/// An EVM chain the wallet can talk to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthereumChain {
    pub name: String,
    pub chain_id: u64,
    pub urls: Vec<String>,
    pub etherscan: String,
    pub token: NativeTokenInfo,
}

impl EthereumChain {
    /// `0x`-prefixed hex chain id, as sent in `chainChanged`.
    pub fn hex_id(&self) -> String {
        format!("{:#x}", self.chain_id)
    }
}

/// Parse a `0x`-prefixed hex or decimal chain id.
pub fn parse_chain_id(s: &str) -> Option<u64> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

const WETH_USDT: &str = "0x0d4a11d5eeaac28ec3f61d100daf4d40471f1852";

fn chain(
    name: &str,
    chain_id: u64,
    url: &str,
    etherscan: &str,
    symbol: &str,
    pairs: &[&str],
) -> EthereumChain {
    EthereumChain {
        name: name.to_string(),
        chain_id,
        urls: vec![url.to_string()],
        etherscan: etherscan.to_string(),
        token: NativeTokenInfo {
            name: symbol.to_string(),
            chain_id,
            symbol: symbol.to_string(),
            decimals: 18,
            pairs: pairs.iter().map(|p| p.to_string()).collect(),
        },
    }
}

static CHAINS: LazyLock<BTreeMap<u64, EthereumChain>> = LazyLock::new(|| {
    [
        chain("Ethereum", 1, "https://eth.llamarpc.com", "https://etherscan.io", "ETH", &[WETH_USDT]),
        chain("Goerli (testnet)", 5, "https://rpc.ankr.com/eth_goerli", "https://goerli.etherscan.io", "ETH", &[]),
        chain("Optimism", 10, "https://optimism.api.onfinality.io/public", "https://optimistic.etherscan.io", "ETH", &[WETH_USDT]),
        chain("Binance", 56, "https://bnb.api.onfinality.io/public", "https://bnbscan.com", "BNB", &["0x16b9a82891338f9ba80e2d6970fdda79d1eb0dae"]),
        chain("Ethereum Classic", 61, "https://etc.rivet.link", "https://blockscout.com/etc/mainnet/", "ETC", &["0xdb8721b7a04c3e592264bf58558526b16b15e757"]),
        chain("Gnosis", 100, "https://gnosis.api.onfinality.io/public", "https://gnosisscan.io", "xDAI", &[]),
        chain("Polygon", 137, "https://polygon.llamarpc.com", "https://polygonscan.com", "MATIC", &["0x819f3450dA6f110BA6Ea52195B3beaFa246062dE", WETH_USDT]),
        chain("zkSync", 324, "https://mainnet.era.zksync.io", "https://explorer.zksync.io/", "ETH", &[WETH_USDT]),
        chain("Base", 8453, "https://1rpc.io/base", "https://basescan.org", "ETH", &[WETH_USDT]),
        chain("Arbitrum", 42161, "https://arbitrum.api.onfinality.io/public", "https://arbiscan.io", "ETH", &[WETH_USDT]),
        chain("Celo", 42220, "https://celo.api.onfinality.io/public", "https://celoscan.io", "CELO", &["0xf5b1bc6c9c180b64f5711567b1d6a51a350f8422"]),
        chain("Avalanche", 43114, "https://avalanche.api.onfinality.io/public/ext/bc/C/rpc", "https://snowtrace.io", "AVAX", &[WETH_USDT]),
        chain("Linea", 59144, "https://rpc.linea.build", "https://lineascan.build", "ETH", &[WETH_USDT]),
        chain("Sepolia (testnet)", 11155111, "https://rpc.sepolia.org", "https://sepolia.etherscan.io", "ETH", &[]),
    ]
    .into_iter()
    .map(|c| (c.chain_id, c))
    .collect()
});

fn token(name: &str, chain_id: u64, symbol: &str, decimals: u8, address: &str, pairs: &[&str]) -> ContractTokenInfo {
    ContractTokenInfo {
        name: name.to_string(),
        chain_id,
        symbol: symbol.to_string(),
        decimals,
        address: address.to_string(),
        pairs: pairs.iter().map(|p| p.to_string()).collect(),
    }
}

const WETH_ON_ETHEREUM: &str = "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2";
const WBTC_ON_ETHEREUM: &str = "0x2260FAC5E5542a773Aa44fBCfeDf7C193bc2C599";
const USDT_ON_ETHEREUM: &str = "0xdAC17F958D2ee523a2206206994597C13D831ec7";
const MATIC_ON_ETHEREUM: &str = "0x7D1AfA7B718fb893dB30A3aBc0Cfc608AaCfeBB0";
const BUSDT_ON_BINANCE: &str = "0x55d398326f99059fF775485246999027B3197955";
const WBNB_ON_BINANCE: &str = "0xbb4CdB9CBd36B01bD1cBaEBF2De08d9173bc095c";

static TOKENS: LazyLock<HashMap<String, ContractTokenInfo>> = LazyLock::new(|| {
    [
        token("Wrapped ETH", 1, "WETH", 18, WETH_ON_ETHEREUM, &[WETH_USDT]),
        token("Wrapped BTC", 1, "WBTC", 8, WBTC_ON_ETHEREUM, &["0xbb2b8038a1640196fbe3e38816f3e67cba72d940", WETH_USDT]),
        token("DAI", 1, "DAI", 18, "0x6B175474E89094C44Da98b954EedeAC495271d0F", &[]),
        token("Tether USD", 1, "USDT", 6, USDT_ON_ETHEREUM, &[]),
        token("Matic", 1, "MATIC", 18, MATIC_ON_ETHEREUM, &["0x819f3450dA6f110BA6Ea52195B3beaFa246062dE", WETH_USDT]),
        token("Binance USD", 56, "BUSDT", 18, BUSDT_ON_BINANCE, &[]),
        token("Wrapped BNB", 56, "WBNB", 18, WBNB_ON_BINANCE, &["0x16b9a82891338f9ba80e2d6970fdda79d1eb0dae"]),
    ]
    .into_iter()
    .map(|t| (t.address.to_lowercase(), t))
    .collect()
});

fn pair(chain_id: u64, name: &str, address: &str, token0: &str, token1: &str, reversed: bool) -> PairInfo {
    PairInfo {
        chain_id,
        name: name.to_string(),
        address: address.to_string(),
        token0: token0.to_string(),
        token1: token1.to_string(),
        reversed,
    }
}

static PAIRS: LazyLock<HashMap<String, PairInfo>> = LazyLock::new(|| {
    [
        pair(1, "WETH_USDT", WETH_USDT, WETH_ON_ETHEREUM, USDT_ON_ETHEREUM, false),
        pair(1, "WBTC_WETH", "0xbb2b8038a1640196fbe3e38816f3e67cba72d940", WBTC_ON_ETHEREUM, WETH_ON_ETHEREUM, false),
        pair(1, "MATIC_WETH", "0x819f3450dA6f110BA6Ea52195B3beaFa246062dE", MATIC_ON_ETHEREUM, WETH_ON_ETHEREUM, false),
        pair(56, "BUSDT_WBNB", "0x16b9a82891338f9ba80e2d6970fdda79d1eb0dae", BUSDT_ON_BINANCE, WBNB_ON_BINANCE, true),
    ]
    .into_iter()
    .map(|p| (p.address.to_lowercase(), p))
    .collect()
});

/// Look up a chain by numeric id.
pub fn chain_by_id(chain_id: u64) -> Option<&'static EthereumChain> {
    CHAINS.get(&chain_id)
}

/// All known chains, ordered by id.
pub fn chains() -> impl Iterator<Item = &'static EthereumChain> {
    CHAINS.values()
}

/// Look up a contract token by address (case-insensitive).
pub fn token_by_address(address: &str) -> Option<&'static ContractTokenInfo> {
    TOKENS.get(&address.to_lowercase())
}

/// Look up a pair by address (case-insensitive).
pub fn pair_by_address(address: &str) -> Option<&'static PairInfo> {
    PAIRS.get(&address.to_lowercase())
}
