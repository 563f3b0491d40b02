//! Request routing for the three kinds of port.
//!
//! Content scripts only ever send `brume_run`, wrapping the page's EIP-1193
//! request and the click position. Wallet methods that need the user's
//! consent go through the popup; everything else is forwarded to the
//! session's chain through the session wallet's brumes and cached.
//!
//! The foreground (extension UI) drives users, seeds, wallets, cache reads
//! and subscriptions. The browser bridge only reports window removals.

use std::sync::Arc;
use std::time::Duration;

use brume_types::{
    AppRequestData, Mouse, RpcRequestInit, RpcResponse, SeedData, SessionData, UserId, UserInit, WalletData,
    WalletId, chain_by_id,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use strum::{AsRefStr, EnumString};
use tracing::{debug, info, warn};

use crate::background::Background;
use crate::crypto::{decode_b64, encode_b64};
use crate::error::{BackgroundError, Result};
use crate::ethereum::{EthereumContext, EthereumQuery, fetch_cached};
use crate::fetch::{FetchInit, fetch};
use crate::flows::CacheFlow;
use crate::looped::{LoopError, Looped, try_loop};
use crate::popup::{WindowId, index_url};
use crate::port::Port;
use crate::sessions::resolve_chain;
use crate::users::{UserSession, create_user};

// ============================================================================
// Methods
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, AsRefStr)]
pub enum ContentMethod {
    #[strum(serialize = "brume_run")]
    Run,
}

/// EIP-1193 methods handled by the wallet itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, AsRefStr)]
pub enum WalletMethod {
    #[strum(serialize = "eth_requestAccounts")]
    RequestAccounts,
    #[strum(serialize = "eth_accounts")]
    Accounts,
    #[strum(serialize = "eth_sendTransaction")]
    SendTransaction,
    #[strum(serialize = "personal_sign")]
    PersonalSign,
    #[strum(serialize = "eth_signTypedData_v4")]
    SignTypedDataV4,
    #[strum(serialize = "wallet_switchEthereumChain")]
    SwitchEthereumChain,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, AsRefStr)]
pub enum ForegroundMethod {
    #[strum(serialize = "brume_getPath")]
    GetPath,
    #[strum(serialize = "brume_setPath")]
    SetPath,
    #[strum(serialize = "brume_login")]
    Login,
    #[strum(serialize = "brume_logout")]
    Logout,
    #[strum(serialize = "brume_getCurrentUser")]
    GetCurrentUser,
    #[strum(serialize = "brume_createUser")]
    CreateUser,
    #[strum(serialize = "brume_removeUser")]
    RemoveUser,
    #[strum(serialize = "brume_createSeed")]
    CreateSeed,
    #[strum(serialize = "brume_createWallet")]
    CreateWallet,
    #[strum(serialize = "brume_removeWallet")]
    RemoveWallet,
    #[strum(serialize = "brume_disconnect")]
    Disconnect,
    #[strum(serialize = "brume_get_global")]
    GetGlobal,
    #[strum(serialize = "brume_get_user")]
    GetUser,
    #[strum(serialize = "brume_subscribe")]
    Subscribe,
    #[strum(serialize = "brume_eth_fetch")]
    EthFetch,
    #[strum(serialize = "brume_eth_index")]
    EthIndex,
    #[strum(serialize = "brume_log")]
    Log,
    #[strum(serialize = "brume_open")]
    Open,
    #[strum(serialize = "brume_encrypt")]
    Encrypt,
    #[strum(serialize = "brume_decrypt")]
    Decrypt,
    #[strum(serialize = "popup_hello")]
    PopupHello,
    #[strum(serialize = "popup_data")]
    PopupData,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, AsRefStr)]
pub enum BrowserMethod {
    #[strum(serialize = "brume_windowRemoved")]
    WindowRemoved,
}

/// `eth_sendTransaction` fields shown to the user.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionInit {
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl Background {
    // ========================================================================
    // Content scripts
    // ========================================================================

    pub(crate) async fn route_content_script(&self, script: &Port, request: RpcRequestInit) -> Option<Result<Value>> {
        match request.method.parse::<ContentMethod>().ok()? {
            ContentMethod::Run => Some(self.brume_run(script, &request).await),
        }
    }

    async fn brume_run(&self, script: &Port, request: &RpcRequestInit) -> Result<Value> {
        let (subrequest, mouse): (RpcRequestInit, Mouse) = request.params()?;
        debug!(script = ?script.id(), method = %subrequest.method, "brume_run");

        let Ok(method) = subrequest.method.parse::<WalletMethod>() else {
            return self.eth_forward(script, subrequest, mouse).await;
        };
        match method {
            WalletMethod::RequestAccounts => self.eth_request_accounts(script, mouse).await,
            WalletMethod::Accounts => self.eth_accounts(script).await,
            WalletMethod::SendTransaction => self.eth_send_transaction(script, &subrequest, mouse).await,
            WalletMethod::PersonalSign => self.personal_sign(script, &subrequest, mouse).await,
            WalletMethod::SignTypedDataV4 => self.sign_typed_data(script, &subrequest, mouse).await,
            WalletMethod::SwitchEthereumChain => self.switch_ethereum_chain(script, &subrequest, mouse).await,
        }
    }

    /// Session of `script`, prompting for one if needed, with the user it belongs to.
    async fn connected(&self, script: &Port, mouse: Mouse) -> Result<(Arc<UserSession>, SessionData)> {
        let user = self.user();
        let session = self.sessions().get_or_wait(script, mouse, user.as_deref(), self.cache(), self.popup()).await?;
        let user = user.ok_or(BackgroundError::Locked)?;
        Ok((user, session))
    }

    fn addresses(user: &UserSession, session: &SessionData) -> Result<Vec<String>> {
        session
            .wallets
            .iter()
            .map(|r| {
                let wallet = user.wallet(r.uuid)?.ok_or_else(|| BackgroundError::not_found(format!("wallet {}", r.uuid)))?;
                Ok(wallet.address().to_string())
            })
            .collect()
    }

    /// Network context of a session: its primary wallet's brumes on its chain.
    fn session_context(&self, session: &SessionData, timeout: Duration) -> Result<EthereumContext> {
        let wallet = session.primary_wallet().ok_or_else(|| BackgroundError::not_found("session wallet"))?;
        self.ethereum_context(wallet.uuid, session.chain.chain_id, timeout)
    }

    fn ethereum_context(&self, wallet: WalletId, chain_id: u64, timeout: Duration) -> Result<EthereumContext> {
        let chain = chain_by_id(chain_id).ok_or_else(|| BackgroundError::not_found(format!("chain {chain_id}")))?;
        Ok(EthereumContext { chain, brumes: self.wallet_brumes().get(wallet), retry: *self.retry(), timeout })
    }

    /// Ask the user to approve `method` for `session`.
    async fn approve<T: serde::de::DeserializeOwned>(
        &self,
        session: &SessionData,
        method: &str,
        params: Value,
        mouse: Mouse,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let request = AppRequestData::new(session.origin.clone(), method, object(params)).with_session(session.id);
        Ok(self.popup().request_popup_as(request, mouse, timeout).await?)
    }

    async fn eth_request_accounts(&self, script: &Port, mouse: Mouse) -> Result<Value> {
        let (user, session) = self.connected(script, mouse).await?;
        Ok(json!(Self::addresses(&user, &session)?))
    }

    /// Never prompts: an unconnected page gets an empty list.
    async fn eth_accounts(&self, script: &Port) -> Result<Value> {
        let user = self.user();
        let session = self.sessions().get_silently(script, user.as_deref(), self.cache()).await?;
        match (user, session) {
            (Some(user), Some(session)) => Ok(json!(Self::addresses(&user, &session)?)),
            _ => Ok(json!([])),
        }
    }

    async fn eth_send_transaction(&self, script: &Port, subrequest: &RpcRequestInit, mouse: Mouse) -> Result<Value> {
        let (transaction,): (TransactionInit,) = subrequest.params()?;
        let (_, session) = self.connected(script, mouse).await?;
        let timeout = self.config().timeouts.send_transaction();

        let signature: String = self
            .approve(&session, "eth_sendTransaction", json!(transaction), mouse, Some(timeout))
            .await?;

        let ctx = self.session_context(&session, timeout)?;
        let broadcast = RpcRequestInit::new("eth_sendRawTransaction", json!([signature]));
        let hash = ctx.fetch(&broadcast, timeout).await?;
        info!(origin = %session.origin, chain = session.chain.chain_id, "transaction broadcast");
        Ok(hash)
    }

    async fn personal_sign(&self, script: &Port, subrequest: &RpcRequestInit, mouse: Mouse) -> Result<Value> {
        let (message, address): (String, String) = subrequest.params()?;
        let (_, session) = self.connected(script, mouse).await?;
        self.approve(&session, "personal_sign", json!({ "message": message, "address": address }), mouse, None)
            .await
    }

    async fn sign_typed_data(&self, script: &Port, subrequest: &RpcRequestInit, mouse: Mouse) -> Result<Value> {
        let (address, data): (String, Value) = subrequest.params()?;
        let (_, session) = self.connected(script, mouse).await?;
        self.approve(&session, "eth_signTypedData_v4", json!({ "data": data, "address": address }), mouse, None)
            .await
    }

    async fn switch_ethereum_chain(&self, script: &Port, subrequest: &RpcRequestInit, mouse: Mouse) -> Result<Value> {
        let (param,): (Value,) = subrequest.params()?;
        let chain_id = param
            .get("chainId")
            .cloned()
            .ok_or_else(|| BackgroundError::InvalidParams("missing chainId".into()))?;
        let chain = resolve_chain(&chain_id)?;

        let (user, session) = self.connected(script, mouse).await?;
        let _: Value = self
            .approve(&session, "wallet_switchEthereumChain", json!({ "chainId": chain_id }), mouse, None)
            .await?;
        self.sessions().switch_chain(session.id, chain, &user, self.cache()).await?;
        Ok(Value::Null)
    }

    /// Any other method goes to the session's chain, cached in the user's storage.
    async fn eth_forward(&self, script: &Port, subrequest: RpcRequestInit, mouse: Mouse) -> Result<Value> {
        let (user, session) = self.connected(script, mouse).await?;
        let ctx = self.session_context(&session, self.config().timeouts.fetch())?;
        fetch_cached(&EthereumQuery::Unknown(subrequest), &ctx, self.cache(), &user.storage).await
    }

    // ========================================================================
    // Foreground
    // ========================================================================

    pub(crate) async fn route_foreground(&self, foreground: &Port, request: RpcRequestInit) -> Option<Result<Value>> {
        let method = request.method.parse::<ForegroundMethod>().ok()?;
        let result = match method {
            ForegroundMethod::GetPath => Ok(json!(self.path())),
            ForegroundMethod::SetPath => self.set_path_from(&request),
            ForegroundMethod::Login => self.brume_login(&request).await,
            ForegroundMethod::Logout => {
                self.logout();
                Ok(Value::Null)
            }
            ForegroundMethod::GetCurrentUser => Ok(json!(self.user().map(|u| u.user.clone()))),
            ForegroundMethod::CreateUser => self.brume_create_user(&request).await,
            ForegroundMethod::CreateSeed => self.brume_create_seed(&request),
            ForegroundMethod::CreateWallet => self.brume_create_wallet(&request),
            ForegroundMethod::RemoveUser | ForegroundMethod::RemoveWallet => {
                Err(BackgroundError::Unimplemented(method.as_ref().to_string()))
            }
            ForegroundMethod::Disconnect => self.brume_disconnect(&request).await,
            ForegroundMethod::GetGlobal => self.brume_get_global(&request),
            ForegroundMethod::GetUser => self.brume_get_user(&request),
            ForegroundMethod::Subscribe => self.brume_subscribe(foreground, &request),
            ForegroundMethod::EthFetch => self.brume_eth_fetch(&request).await,
            ForegroundMethod::EthIndex => self.brume_eth_index(&request),
            ForegroundMethod::Log => self.brume_log().await,
            ForegroundMethod::Open => self.brume_open(&request).await,
            ForegroundMethod::Encrypt => self.brume_encrypt(&request),
            ForegroundMethod::Decrypt => self.brume_decrypt(&request),
            ForegroundMethod::PopupHello => {
                self.popup().hello(foreground.clone());
                Ok(Value::Null)
            }
            ForegroundMethod::PopupData => self.popup_data(&request),
        };
        Some(result)
    }

    fn set_path_from(&self, request: &RpcRequestInit) -> Result<Value> {
        let (path,): (String,) = request.params()?;
        self.set_path(path);
        Ok(Value::Null)
    }

    async fn brume_login(&self, request: &RpcRequestInit) -> Result<Value> {
        let (uuid, password): (UserId, String) = request.params()?;
        self.login(uuid, password).await?;
        Ok(Value::Null)
    }

    async fn brume_create_user(&self, request: &RpcRequestInit) -> Result<Value> {
        let (init,): (UserInit,) = request.params()?;
        let global = self.global().clone();
        let cache = self.cache().clone();
        let iterations = self.config().storage.kdf_iterations;
        let users = tokio::task::spawn_blocking(move || create_user(&global, &cache, &init, iterations)).await??;
        Ok(json!(users))
    }

    fn brume_create_seed(&self, request: &RpcRequestInit) -> Result<Value> {
        let (seed,): (SeedData,) = request.params()?;
        let seeds = self.require_user()?.create_seed(self.cache(), &seed)?;
        Ok(json!(seeds))
    }

    fn brume_create_wallet(&self, request: &RpcRequestInit) -> Result<Value> {
        let (wallet,): (WalletData,) = request.params()?;
        let wallets = self.require_user()?.create_wallet(self.cache(), &wallet)?;
        Ok(json!(wallets))
    }

    async fn brume_disconnect(&self, request: &RpcRequestInit) -> Result<Value> {
        let (origin,): (String,) = request.params()?;
        let user = self.require_user()?;
        self.sessions().disconnect(&origin, &user, self.cache()).await?;
        Ok(Value::Null)
    }

    fn brume_get_global(&self, request: &RpcRequestInit) -> Result<Value> {
        let (key,): (String,) = request.params()?;
        Ok(json!(self.load(self.global(), &key)?))
    }

    fn brume_get_user(&self, request: &RpcRequestInit) -> Result<Value> {
        let (key,): (String,) = request.params()?;
        let user = self.require_user()?;
        Ok(json!(self.load(&user.storage, &key)?))
    }

    /// Push every change of `key` to the foreground until it goes away.
    fn brume_subscribe(&self, foreground: &Port, request: &RpcRequestInit) -> Result<Value> {
        let (key,): (String,) = request.params()?;
        let mut flows = self.cache().subscribe();
        let port = foreground.clone();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    message = flows.recv() => message,
                    _ = port.closed() => None,
                };
                let Some(message) = message else { break };
                if message.payload.key() != key {
                    continue;
                }
                let state = match message.payload {
                    CacheFlow::Updated { state, .. } => state,
                    CacheFlow::Deleted { .. } => None,
                };
                port.notify(RpcRequestInit::new("brume_update", json!([key, state])));
            }
            debug!(key, "subscription ended");
        });
        Ok(Value::Null)
    }

    fn eth_target(&self, request: &RpcRequestInit) -> Result<(Arc<UserSession>, EthereumContext, EthereumQuery)> {
        let (wallet, chain_id, subrequest): (WalletId, u64, RpcRequestInit) = request.params()?;
        let user = self.require_user()?;
        user.wallet(wallet)?.ok_or_else(|| BackgroundError::not_found(format!("wallet {wallet}")))?;
        let ctx = self.ethereum_context(wallet, chain_id, self.config().timeouts.fetch())?;
        let query = EthereumQuery::route(&subrequest)?;
        Ok((user, ctx, query))
    }

    async fn brume_eth_fetch(&self, request: &RpcRequestInit) -> Result<Value> {
        let (user, ctx, query) = self.eth_target(request)?;
        fetch_cached(&query, &ctx, self.cache(), &user.storage).await
    }

    /// Re-publish the stored state of a query without fetching.
    fn brume_eth_index(&self, request: &RpcRequestInit) -> Result<Value> {
        let (user, ctx, query) = self.eth_target(request)?;
        let key = query.cache_key(ctx.chain.chain_id);
        self.load(&user.storage, &key)?;
        self.cache().reindex(&key);
        Ok(Value::Null)
    }

    /// Anonymous usage beacon through a one-off circuit.
    async fn brume_log(&self) -> Result<Value> {
        let circuits = self.circuits().clone();
        let circuit = try_loop(self.retry(), |_| {
            let circuits = circuits.clone();
            async move { circuits.take_random().await.map_err(Looped::Retry) }
        })
        .await
        .map_err(LoopError::into_inner)?;

        let init = FetchInit::json(&json!({ "tor": true })).with_timeout(self.config().timeouts.fetch());
        let result = fetch(circuit.as_ref(), &self.config().log_url, init).await;
        circuit.destroy().await;

        if let Err(e) = &result {
            warn!(error = %e, "log beacon failed");
        }
        result?;
        Ok(Value::Null)
    }

    async fn brume_open(&self, request: &RpcRequestInit) -> Result<Value> {
        let (path,): (String,) = request.params()?;
        self.popup().browser().open_tab(&index_url(&path)).await?;
        Ok(Value::Null)
    }

    /// `[plainBase64]` → `[ivBase64, cipherBase64]` with the user's key.
    fn brume_encrypt(&self, request: &RpcRequestInit) -> Result<Value> {
        let (plain,): (String,) = request.params()?;
        let user = self.require_user()?;
        let (iv, cipher) = user.keys.crypter.encrypt_random(&decode_b64(&plain)?)?;
        Ok(json!([encode_b64(&iv), encode_b64(&cipher)]))
    }

    fn brume_decrypt(&self, request: &RpcRequestInit) -> Result<Value> {
        let (iv, cipher): (String, String) = request.params()?;
        let user = self.require_user()?;
        let plain = user.keys.crypter.decrypt(&decode_b64(&iv)?, &decode_b64(&cipher)?)?;
        Ok(json!(encode_b64(&plain)))
    }

    fn popup_data(&self, request: &RpcRequestInit) -> Result<Value> {
        let (response,): (RpcResponse,) = request.params()?;
        self.popup().data(response);
        Ok(Value::Null)
    }

    // ========================================================================
    // Browser
    // ========================================================================

    pub(crate) async fn route_browser(&self, request: RpcRequestInit) -> Option<Result<Value>> {
        match request.method.parse::<BrowserMethod>().ok()? {
            BrowserMethod::WindowRemoved => Some(self.window_removed(&request).await),
        }
    }

    async fn window_removed(&self, request: &RpcRequestInit) -> Result<Value> {
        let (window,): (WindowId,) = request.params()?;
        self.popup().window_removed(window).await;
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_names() {
        assert_eq!("brume_run".parse::<ContentMethod>().unwrap(), ContentMethod::Run);
        assert_eq!("eth_signTypedData_v4".parse::<WalletMethod>().unwrap(), WalletMethod::SignTypedDataV4);
        assert_eq!(ForegroundMethod::GetGlobal.as_ref(), "brume_get_global");
        assert!("eth_blockNumber".parse::<WalletMethod>().is_err());
        assert!("brume_run".parse::<ForegroundMethod>().is_err());
    }

    #[test]
    fn test_transaction_fields_skip_missing() {
        let tx: TransactionInit = serde_json::from_value(json!({"from": "0xa", "value": "0x1", "nonce": "0x9"})).unwrap();
        assert_eq!(json!(tx), json!({"from": "0xa", "value": "0x1"}));
    }
}
