//! The background context.
//!
//! One [`Background`] owns everything the process keeps between requests:
//! the raw cache, storage, the pool chain, live sessions, the popup broker
//! and the logged-in user. Every port is served by the same instance; the
//! port name decides which router handles a request:
//!
//! | port name    | router                 |
//! |--------------|------------------------|
//! | `foreground` | extension UI requests  |
//! | `browser`    | window events          |
//! | anything else| content-script traffic |
//!
//! ```text
//! TorConnector ─► tors ─► circuits ─► brumes ─► per-wallet subpools
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use brume_types::{RpcError, RpcRequestInit, UserData, UserId, user_key};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info};

use crate::brumes::{BrumePool, EthereumBrume, WalletBrumes, brume_pool_with};
use crate::cache::{CacheCore, RawState};
use crate::config::BackgroundConfig;
use crate::constants::{BROWSER_PORT, DEFAULT_PATH, FOREGROUND_PORT};
use crate::db::KvDb;
use crate::error::{BackgroundError, Result};
use crate::looped::RetrySettings;
use crate::popup::{Browser, PopupBroker};
use crate::port::{Port, RequestHandler};
use crate::sessions::SessionManager;
use crate::storage::{GlobalStorage, SharedDb, Storage, StorageError};
use crate::tor::{CircuitPool, TorConnector, TorPool, circuit_pool, tor_pool};
use crate::users::UserSession;

pub struct Background {
    config: BackgroundConfig,
    retry: RetrySettings,
    cache: Arc<CacheCore>,
    db: SharedDb,
    global: GlobalStorage,
    user: RwLock<Option<Arc<UserSession>>>,
    path: Mutex<String>,
    sessions: Arc<SessionManager>,
    popup: PopupBroker,
    tors: TorPool,
    circuits: CircuitPool,
    brumes: BrumePool,
    wallet_brumes: WalletBrumes,
}

impl Background {
    /// Wire up the pool chain and storage. Pools fill on first use.
    pub fn new(
        config: BackgroundConfig,
        db: KvDb,
        browser: Arc<dyn Browser>,
        connector: Arc<dyn TorConnector>,
    ) -> Arc<Self> {
        let retry = config.retry_settings();
        let cache = Arc::new(CacheCore::default());
        let db: SharedDb = Arc::new(Mutex::new(db));

        let tors = tor_pool(connector, config.tor.proxies.clone(), config.pools.tors, retry);
        let circuits = circuit_pool(tors.clone(), config.pools.circuits, retry);
        let overrides = config.endpoint_overrides();
        let brumes = brume_pool_with(circuits.clone(), config.pools.brumes, move |circuit| {
            EthereumBrume::with_endpoints(circuit, &overrides)
        });
        let wallet_brumes = WalletBrumes::new(brumes.clone(), config.pools.brumes_per_wallet);
        let popup = PopupBroker::new(browser, cache.clone(), &config.popup);

        info!(
            tors = config.pools.tors,
            circuits = config.pools.circuits,
            brumes = config.pools.brumes,
            "background ready"
        );

        Arc::new(Self {
            global: GlobalStorage::new(db.clone()),
            config,
            retry,
            cache,
            db,
            user: RwLock::new(None),
            path: Mutex::new(DEFAULT_PATH.to_string()),
            sessions: SessionManager::new(),
            popup,
            tors,
            circuits,
            brumes,
            wallet_brumes,
        })
    }

    /// Open the database named by the config, creating its directory.
    pub fn open(
        config: BackgroundConfig,
        browser: Arc<dyn Browser>,
        connector: Arc<dyn TorConnector>,
    ) -> std::result::Result<Arc<Self>, StorageError> {
        if let Some(dir) = config.storage.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let db = KvDb::open(&config.storage.path)?;
        info!(path = %config.storage.path.display(), "storage opened");
        Ok(Self::new(config, db, browser, connector))
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn config(&self) -> &BackgroundConfig {
        &self.config
    }

    pub fn retry(&self) -> &RetrySettings {
        &self.retry
    }

    pub fn cache(&self) -> &Arc<CacheCore> {
        &self.cache
    }

    pub fn global(&self) -> &GlobalStorage {
        &self.global
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn popup(&self) -> &PopupBroker {
        &self.popup
    }

    pub fn tors(&self) -> &TorPool {
        &self.tors
    }

    pub fn circuits(&self) -> &CircuitPool {
        &self.circuits
    }

    pub fn brumes(&self) -> &BrumePool {
        &self.brumes
    }

    pub fn wallet_brumes(&self) -> &WalletBrumes {
        &self.wallet_brumes
    }

    pub fn path(&self) -> String {
        self.path.lock().clone()
    }

    pub fn set_path(&self, path: impl Into<String>) {
        *self.path.lock() = path.into();
    }

    // ── User ────────────────────────────────────────────────────────────────

    /// The logged-in user, if any.
    pub fn user(&self) -> Option<Arc<UserSession>> {
        self.user.read().clone()
    }

    pub(crate) fn require_user(&self) -> Result<Arc<UserSession>> {
        self.user().ok_or(BackgroundError::Locked)
    }

    /// Unlock `uuid` with `password`.
    ///
    /// Key derivation runs on the blocking pool. A different user already
    /// logged in is logged out first.
    pub async fn login(&self, uuid: UserId, password: String) -> Result<Arc<UserSession>> {
        let user: UserData = self
            .global
            .get(&user_key(uuid))?
            .ok_or_else(|| BackgroundError::not_found(format!("user {uuid}")))?;

        let db = self.db.clone();
        let session = tokio::task::spawn_blocking(move || UserSession::open(user, &password, db)).await??;
        let session = Arc::new(session);

        let previous = self.user.write().replace(session.clone());
        if previous.is_some_and(|p| p.user.uuid != uuid) {
            self.reset();
        }
        info!(user = %uuid, name = %session.user.name, "logged in");
        Ok(session)
    }

    /// Forget the user and everything derived from it.
    pub fn logout(&self) {
        let previous = self.user.write().take();
        self.reset();
        if let Some(previous) = previous {
            info!(user = %previous.user.uuid, "logged out");
        }
    }

    fn reset(&self) {
        self.cache.clear();
        self.sessions.clear();
        self.wallet_brumes.clear();
    }

    // ── Cache-backed reads ──────────────────────────────────────────────────

    /// State of `key`, loaded from `storage` on first access.
    ///
    /// Absence is memoised too, so a missing key hits storage only once.
    pub(crate) fn load<S: Storage>(&self, storage: &S, key: &str) -> Result<Option<RawState>> {
        if let Some(state) = self.cache.get(key) {
            return Ok(state);
        }
        let state = storage.get_raw(key)?;
        self.cache.set(key, state.clone());
        Ok(state)
    }
}

#[async_trait]
impl RequestHandler for Background {
    async fn handle(&self, port: &Port, request: RpcRequestInit) -> Option<std::result::Result<Value, RpcError>> {
        let method = request.method.clone();
        let routed = match port.name() {
            FOREGROUND_PORT => self.route_foreground(port, request).await,
            BROWSER_PORT => self.route_browser(request).await,
            _ => self.route_content_script(port, request).await,
        };
        routed.map(|result| {
            result.map_err(|e| {
                debug!(port = %port.name(), method = %method, error = %e, "request failed");
                e.to_rpc_error()
            })
        })
    }
}
