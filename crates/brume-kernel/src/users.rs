//! Users and the logged-in user session.
//!
//! Creating a user stores its record (salt + verifier, never the password)
//! in global storage. Logging in re-derives the keys, checks them against
//! the verifier and opens the user's encrypted storage. Seeds and wallets
//! live in that storage, with `seeds` / `wallets` ref lists next to them.
//!
//! Writes go through the cache as well, so `brume_get_user` and
//! subscriptions see them immediately.

use brume_types::{
    SeedData, SeedRef, UserData, UserInit, UserRef, Wallet, WalletData, WalletId, WalletRef, seed_key,
    user_key, wallet_key,
};
use serde::Serialize;
use tracing::info;

use crate::cache::CacheCore;
use crate::crypto::{CryptoError, SALT_LEN, UserKeys, decode_b64, encode_b64, random_bytes};
use crate::storage::{EncryptedStorage, GlobalStorage, SharedDb, Storage, StorageError};

pub const USERS_KEY: &str = "users";
pub const SEEDS_KEY: &str = "seeds";
pub const WALLETS_KEY: &str = "wallets";

/// Build the stored record for a new user.
pub fn new_user_data(init: &UserInit, iterations: u32) -> Result<UserData, CryptoError> {
    let salt = random_bytes::<SALT_LEN>();
    let keys = UserKeys::derive(&init.password, &salt, iterations)?;
    Ok(UserData {
        uuid: init.uuid,
        name: init.name.clone(),
        color: init.color,
        emoji: init.emoji.clone(),
        salt: encode_b64(&salt),
        verifier: keys.verifier(),
        iterations,
    })
}

/// Write `value` to `storage` and mirror the new state into the cache.
pub fn store<S: Storage, T: Serialize>(
    storage: &S,
    cache: &CacheCore,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let state = storage.set(key, value)?;
    cache.set(key, Some(state));
    Ok(())
}

/// Store a new user and append it to the user list. Returns the list.
///
/// An existing user with the same uuid is left untouched.
pub fn create_user(
    global: &GlobalStorage,
    cache: &CacheCore,
    init: &UserInit,
    iterations: u32,
) -> Result<Vec<UserRef>, StorageError> {
    if global.get_raw(&user_key(init.uuid))?.is_some() {
        return Err(StorageError::Exists(format!("user {}", init.uuid)));
    }
    let user = new_user_data(init, iterations)?;
    store(global, cache, &user_key(user.uuid), &user)?;

    let mut users: Vec<UserRef> = global.get(USERS_KEY)?.unwrap_or_default();
    if !users.iter().any(|r| r.uuid == user.uuid) {
        users.push(user.to_ref());
    }
    store(global, cache, USERS_KEY, &users)?;

    info!(user = %user.uuid, name = %user.name, "user created");
    Ok(users)
}

/// The logged-in user: its record, keys and encrypted storage.
#[derive(Debug)]
pub struct UserSession {
    pub user: UserData,
    pub keys: UserKeys,
    pub storage: EncryptedStorage,
}

impl UserSession {
    /// Derive the keys from `password` and open the user's storage.
    pub fn open(user: UserData, password: &str, db: SharedDb) -> Result<Self, CryptoError> {
        let salt = decode_b64(&user.salt)?;
        let keys = UserKeys::derive(password, &salt, user.iterations)?;
        keys.check_verifier(&user.verifier)?;

        let storage = EncryptedStorage::new(user.uuid, db, keys.clone());
        Ok(Self { user, keys, storage })
    }

    pub fn create_seed(&self, cache: &CacheCore, seed: &SeedData) -> Result<Vec<SeedRef>, StorageError> {
        store(&self.storage, cache, &seed_key(seed.uuid()), seed)?;

        let mut seeds: Vec<SeedRef> = self.storage.get(SEEDS_KEY)?.unwrap_or_default();
        if !seeds.iter().any(|r| r.uuid == seed.uuid()) {
            seeds.push(SeedRef::new(seed.uuid()));
        }
        store(&self.storage, cache, SEEDS_KEY, &seeds)?;
        Ok(seeds)
    }

    pub fn create_wallet(&self, cache: &CacheCore, wallet: &WalletData) -> Result<Vec<WalletRef>, StorageError> {
        store(&self.storage, cache, &wallet_key(wallet.uuid()), wallet)?;

        let mut wallets: Vec<WalletRef> = self.storage.get(WALLETS_KEY)?.unwrap_or_default();
        if !wallets.iter().any(|r| r.uuid == wallet.uuid()) {
            wallets.push(wallet.to_ref());
        }
        store(&self.storage, cache, WALLETS_KEY, &wallets)?;
        Ok(wallets)
    }

    /// The canonical record of a wallet.
    pub fn wallet(&self, uuid: WalletId) -> Result<Option<WalletData>, StorageError> {
        self.storage.get(&wallet_key(uuid))
    }

    /// Resolve either form to the canonical record.
    pub fn resolve_wallet(&self, wallet: &Wallet) -> Result<Option<WalletData>, StorageError> {
        match wallet {
            Wallet::Data(data) => Ok(Some(data.clone())),
            Wallet::Ref(r) => self.wallet(r.uuid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use brume_types::{EthereumPrivateKeyWallet, UserId};
    use parking_lot::Mutex;

    use crate::db::KvDb;

    fn init(password: &str) -> UserInit {
        UserInit {
            uuid: UserId::new(),
            name: "alice".into(),
            color: 1,
            emoji: "🦊".into(),
            password: password.into(),
        }
    }

    fn db() -> SharedDb {
        Arc::new(Mutex::new(KvDb::in_memory().unwrap()))
    }

    #[test]
    fn test_create_user_and_login() {
        let db = db();
        let global = GlobalStorage::new(db.clone());
        let cache = CacheCore::default();
        let init = init("hunter2");

        let users = create_user(&global, &cache, &init, 8).unwrap();
        assert_eq!(users, vec![UserRef { tag: Default::default(), uuid: init.uuid }]);
        assert!(cache.get(USERS_KEY).is_some());

        let user: UserData = global.get(&user_key(init.uuid)).unwrap().unwrap();
        assert!(!serde_json::to_string(&user).unwrap().contains("hunter2"));

        assert!(UserSession::open(user.clone(), "hunter2", db.clone()).is_ok());
        assert!(matches!(
            UserSession::open(user, "wrong", db),
            Err(CryptoError::InvalidPassword)
        ));
    }

    #[test]
    fn test_create_user_refuses_existing_uuid() {
        let db = db();
        let global = GlobalStorage::new(db.clone());
        let cache = CacheCore::default();
        let first = init("hunter2");
        create_user(&global, &cache, &first, 8).unwrap();

        let again = UserInit { uuid: first.uuid, name: "mallory".into(), ..init("other") };
        assert!(matches!(create_user(&global, &cache, &again, 8), Err(StorageError::Exists(_))));

        // The original record and password still stand.
        let user: UserData = global.get(&user_key(first.uuid)).unwrap().unwrap();
        assert_eq!(user.name, "alice");
        assert!(UserSession::open(user, "hunter2", db).is_ok());
        let users: Vec<UserRef> = global.get(USERS_KEY).unwrap().unwrap();
        assert_eq!(users.len(), 1);
    }

    #[test]
    fn test_wallets_are_listed_once() {
        let db = db();
        let global = GlobalStorage::new(db.clone());
        let cache = CacheCore::default();
        let init = init("pw");
        create_user(&global, &cache, &init, 8).unwrap();
        let user: UserData = global.get(&user_key(init.uuid)).unwrap().unwrap();
        let session = UserSession::open(user, "pw", db).unwrap();

        let wallet: WalletData = EthereumPrivateKeyWallet {
            uuid: WalletId::new(),
            name: "Main".into(),
            color: 0,
            emoji: "🐳".into(),
            private_key: "0x01".into(),
            address: "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf".into(),
        }
        .into();

        session.create_wallet(&cache, &wallet).unwrap();
        let wallets = session.create_wallet(&cache, &wallet).unwrap();
        assert_eq!(wallets, vec![wallet.to_ref()]);
        assert_eq!(session.resolve_wallet(&Wallet::Ref(wallet.to_ref())).unwrap(), Some(wallet));
    }
}
