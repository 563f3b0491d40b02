//! Origin sessions and the scripts subscribed to them.
//!
//! Per origin:
//!
//! ```text
//! [none] ──approve(persistent=false)──► [temporary]
//! [none] ──approve(persistent=true)───► [temporary] + [persistent]
//! [persistent] ──script connects──────► [temporary] (same id, rehydrated)
//! [any] ──switch chain────────────────► chain replaced, chainChanged to scripts
//! [any] ──disconnect──────────────────► [none], accountsChanged [] to scripts
//! ```
//!
//! A script (content-script port) maps to at most one session; a session
//! keeps the set of scripts to notify. A closing script is unsubscribed, and
//! a temporary session with no scripts left is dropped. Every check-then-act
//! sequence for an origin runs under that origin's lock.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use brume_types::{
    AppRequestData, EthereumChain, Mouse, OriginData, PortId, RpcRequestInit, SessionData, SessionId, WalletId,
    chain_by_id, origin_key, parse_chain_id, persistent_session_key,
};
use dashmap::DashMap;
use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::cache::CacheCore;
use crate::error::{BackgroundError, Result};
use crate::popup::PopupBroker;
use crate::port::Port;
use crate::storage::Storage;
use crate::users::{UserSession, store};

/// Accepts a numeric or `0x`-hex chain id.
pub fn chain_id_from_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => parse_chain_id(s),
        _ => None,
    }
}

pub fn resolve_chain(value: &Value) -> Result<&'static EthereumChain> {
    let chain_id = chain_id_from_value(value).ok_or_else(|| BackgroundError::InvalidParams(format!("bad chain id {value}")))?;
    chain_by_id(chain_id).ok_or_else(|| BackgroundError::not_found(format!("chain {chain_id}")))
}

pub struct SessionManager {
    /// Live sessions by id.
    temporary: DashMap<SessionId, SessionData>,
    /// Live session of each origin.
    by_origin: DashMap<String, SessionId>,
    /// Subscribed scripts of each live session.
    scripts: DashMap<SessionId, HashMap<PortId, Port>>,
    /// Session of each subscribed script.
    sessions: DashMap<PortId, SessionId>,
    origin_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Handed to close watchers so they do not keep the manager alive.
    weak: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            temporary: DashMap::new(),
            by_origin: DashMap::new(),
            scripts: DashMap::new(),
            sessions: DashMap::new(),
            origin_locks: DashMap::new(),
            weak: weak.clone(),
        })
    }

    /// Take the lock of `origin`. The map entry goes away with the last
    /// holder once the origin has no live session.
    async fn lock_origin(&self, origin: &str) -> OriginGuard<'_> {
        let lock = self.origin_locks.entry(origin.to_string()).or_default().clone();
        OriginGuard { manager: self, origin: origin.to_string(), guard: Some(lock.lock_owned().await) }
    }

    /// Origins with a lock entry.
    pub fn locked_origins(&self) -> usize {
        self.origin_locks.len()
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    pub fn session(&self, id: SessionId) -> Option<SessionData> {
        self.temporary.get(&id).map(|s| s.clone())
    }

    pub fn session_of_script(&self, script: PortId) -> Option<SessionData> {
        let id = *self.sessions.get(&script)?;
        self.session(id)
    }

    pub fn session_of_origin(&self, origin: &str) -> Option<SessionData> {
        let id = *self.by_origin.get(origin)?;
        self.session(id)
    }

    /// Scripts currently subscribed to `id`.
    pub fn scripts_of(&self, id: SessionId) -> Vec<Port> {
        self.scripts.get(&id).map(|s| s.values().cloned().collect()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.temporary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.temporary.is_empty()
    }

    // ── Subscription ────────────────────────────────────────────────────────

    /// Make `session` live and subscribe `script` to it. Caller holds the origin lock.
    fn attach(&self, script: &Port, session: &SessionData) {
        self.temporary.entry(session.id).or_insert_with(|| session.clone());
        self.by_origin.insert(session.origin.clone(), session.id);
        self.scripts.entry(session.id).or_default().insert(script.id(), script.clone());

        let previous = self.sessions.insert(script.id(), session.id);
        debug!(session = ?session.id, origin = %session.origin, script = ?script.id(), "script subscribed");
        if previous.is_some() {
            return;
        }

        let weak = self.weak.clone();
        let port = script.clone();
        tokio::spawn(async move {
            port.closed().await;
            if let Some(manager) = weak.upgrade() {
                manager.detach(&port).await;
            }
        });
    }

    /// Unsubscribe a closed script, dropping its session if it was the last one.
    pub async fn detach(&self, script: &Port) {
        let Some(id) = self.sessions.get(&script.id()).map(|s| *s) else {
            return;
        };
        let origin = self.temporary.get(&id).map(|s| s.origin.clone());
        let _guard = match &origin {
            Some(origin) => Some(self.lock_origin(origin).await),
            None => None,
        };

        if self.sessions.remove_if(&script.id(), |_, s| *s == id).is_none() {
            return;
        }
        let empty = match self.scripts.get_mut(&id) {
            Some(mut scripts) => {
                scripts.remove(&script.id());
                scripts.is_empty()
            }
            None => true,
        };
        debug!(session = ?id, script = ?script.id(), "script unsubscribed");

        if empty {
            self.scripts.remove_if(&id, |_, s| s.is_empty());
            if let Some((_, session)) = self.temporary.remove(&id) {
                self.by_origin.remove_if(&session.origin, |_, v| *v == id);
                debug!(session = ?id, origin = %session.origin, "temporary session dropped");
            }
        }
    }

    // ── Lookup and creation ─────────────────────────────────────────────────

    /// Live or persisted session of `origin`, subscribing `script` to it.
    /// Caller holds the origin lock.
    fn rehydrate(
        &self,
        script: &Port,
        origin: &OriginData,
        user: &UserSession,
        cache: &CacheCore,
    ) -> Result<Option<SessionData>> {
        if let Some(session) = self.session_of_origin(&origin.origin) {
            self.attach(script, &session);
            return Ok(Some(session));
        }

        let Some(session) = user.storage.get::<SessionData>(&persistent_session_key(&origin.origin))? else {
            return Ok(None);
        };
        store(&user.storage, cache, &origin_key(&origin.origin), origin)?;
        self.attach(script, &session);
        info!(session = ?session.id, origin = %origin.origin, "persistent session restored");
        Ok(Some(session))
    }

    async fn origin_of(script: &Port) -> Result<OriginData> {
        Ok(script.request_as(RpcRequestInit::method("brume_origin")).await?)
    }

    /// Session of `script` without prompting the user.
    pub async fn get_silently(
        &self,
        script: &Port,
        user: Option<&UserSession>,
        cache: &CacheCore,
    ) -> Result<Option<SessionData>> {
        if let Some(session) = self.session_of_script(script.id()) {
            return Ok(Some(session));
        }
        let Some(user) = user else {
            return Ok(None);
        };

        let origin = Self::origin_of(script).await?;
        let _guard = self.lock_origin(&origin.origin).await;
        self.rehydrate(script, &origin, user, cache)
    }

    /// Session of `script`, asking the user to connect a wallet if the
    /// origin has none.
    pub async fn get_or_wait(
        &self,
        script: &Port,
        mouse: Mouse,
        user: Option<&UserSession>,
        cache: &CacheCore,
        popup: &PopupBroker,
    ) -> Result<SessionData> {
        if let Some(session) = self.session_of_script(script.id()) {
            return Ok(session);
        }

        let origin = Self::origin_of(script).await?;
        let _guard = self.lock_origin(&origin.origin).await;

        let Some(user) = user else {
            // Bring up the popup so the user can unlock, then refuse.
            if let Err(e) = popup.open_or_focus("/", mouse).await {
                warn!(error = %e, "failed to open popup for login");
            }
            return Err(BackgroundError::Locked);
        };

        if let Some(session) = self.rehydrate(script, &origin, user, cache)? {
            return Ok(session);
        }

        let request = AppRequestData::new(origin.origin.clone(), "eth_requestAccounts", Map::new());
        let (persistent, wallet_id, chain_id): (bool, WalletId, Value) =
            popup.request_popup_as(request, mouse, None).await?;

        let wallet = user.wallet(wallet_id)?.ok_or_else(|| BackgroundError::not_found(format!("wallet {wallet_id}")))?;
        let chain = resolve_chain(&chain_id)?;
        let session = SessionData::new(origin.origin.clone(), vec![wallet.to_ref()], chain.clone());

        store(&user.storage, cache, &origin_key(&origin.origin), &origin)?;
        if persistent {
            store(&user.storage, cache, &persistent_session_key(&origin.origin), &session)?;
        }
        self.attach(script, &session);
        info!(session = ?session.id, origin = %origin.origin, persistent, "session created");
        Ok(session)
    }

    // ── Mutation ────────────────────────────────────────────────────────────

    /// Replace the chain of session `id`, persisted record first.
    ///
    /// Every subscribed script gets one `chainChanged`.
    pub async fn switch_chain(
        &self,
        id: SessionId,
        chain: &'static EthereumChain,
        user: &UserSession,
        cache: &CacheCore,
    ) -> Result<SessionData> {
        let origin = self.session(id).map(|s| s.origin).ok_or_else(|| BackgroundError::not_found("session"))?;
        let _guard = self.lock_origin(&origin).await;

        let current = self.session(id).ok_or_else(|| BackgroundError::not_found("session"))?;
        let updated = current.with_chain(chain.clone());

        let key = persistent_session_key(&origin);
        if let Some(persisted) = user.storage.get::<SessionData>(&key)? {
            if persisted.id == id {
                store(&user.storage, cache, &key, &updated)?;
            }
        }
        self.temporary.insert(id, updated.clone());

        let hex = chain.hex_id();
        let scripts = self.scripts_of(id);
        info!(session = ?id, %origin, chain = %hex, scripts = scripts.len(), "chain switched");
        for script in scripts {
            script.notify(RpcRequestInit::new("chainChanged", json!([hex])));
        }
        Ok(updated)
    }

    /// Forget everything about `origin`, telling its scripts they lost access.
    pub async fn disconnect(&self, origin: &str, user: &UserSession, cache: &CacheCore) -> Result<SessionId> {
        let _guard = self.lock_origin(origin).await;

        let key = persistent_session_key(origin);
        let persisted: Option<SessionData> = user.storage.get(&key)?;
        let live = self.by_origin.remove(origin).map(|(_, id)| id);
        let id = persisted
            .as_ref()
            .map(|s| s.id)
            .or(live)
            .ok_or_else(|| BackgroundError::not_found(format!("session for {origin}")))?;

        if persisted.is_some() {
            user.storage.delete(&key)?;
            cache.set(&key, None);
        }
        for removed in [Some(id), live.filter(|l| *l != id)].into_iter().flatten() {
            self.temporary.remove(&removed);
            self.notify_removed(removed);
        }

        info!(session = ?id, origin, "session disconnected");
        Ok(id)
    }

    fn notify_removed(&self, id: SessionId) {
        let Some((_, scripts)) = self.scripts.remove(&id) else {
            return;
        };
        for (script_id, script) in scripts {
            self.sessions.remove_if(&script_id, |_, s| *s == id);
            script.notify(RpcRequestInit::new("accountsChanged", json!([[]])));
        }
    }

    /// Drop all live sessions (on logout). Persisted sessions stay.
    pub fn clear(&self) {
        self.sessions.clear();
        self.scripts.clear();
        self.by_origin.clear();
        self.temporary.clear();
        self.origin_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

/// Held origin lock.
struct OriginGuard<'a> {
    manager: &'a SessionManager,
    origin: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for OriginGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let manager = self.manager;
        manager
            .origin_locks
            .remove_if(&self.origin, |_, lock| Arc::strong_count(lock) == 1 && !manager.by_origin.contains_key(&self.origin));
    }
}
