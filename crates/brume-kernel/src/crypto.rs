//! Password-derived keys for user storage.
//!
//! PBKDF2-HMAC-SHA256 stretches the password and salt into 64 bytes: the
//! first half keys AES-256-GCM (the [`Crypter`]), the second half keys
//! HMAC-SHA256 (the [`Hasher`]) used to blind storage keys and to build the
//! password verifier.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// AES-GCM nonce length in bytes.
pub const IV_LEN: usize = 12;

pub const SALT_LEN: usize = 16;

/// What the verifier authenticates.
const VERIFIER_LABEL: &[u8] = b"brume/verifier";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("iv must be {IV_LEN} bytes, got {0}")]
    InvalidIv(usize),

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,

    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid password")]
    InvalidPassword,

    #[error("invalid key length")]
    InvalidKey,
}

/// AES-256-GCM with caller- or randomly-chosen IVs.
#[derive(Clone)]
pub struct Crypter {
    cipher: Aes256Gcm,
}

impl Crypter {
    pub fn new(key: &[u8; 32]) -> Self {
        Self { cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)) }
    }

    pub fn encrypt(&self, iv: &[u8], plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if iv.len() != IV_LEN {
            return Err(CryptoError::InvalidIv(iv.len()));
        }
        self.cipher.encrypt(Nonce::from_slice(iv), plain).map_err(|_| CryptoError::Encrypt)
    }

    /// Encrypt under a fresh random IV, returning `(iv, cipher)`.
    pub fn encrypt_random(&self, plain: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let iv = random_bytes::<IV_LEN>();
        let cipher = self.encrypt(&iv, plain)?;
        Ok((iv.to_vec(), cipher))
    }

    pub fn decrypt(&self, iv: &[u8], cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if iv.len() != IV_LEN {
            return Err(CryptoError::InvalidIv(iv.len()));
        }
        self.cipher.decrypt(Nonce::from_slice(iv), cipher).map_err(|_| CryptoError::Decrypt)
    }
}

impl std::fmt::Debug for Crypter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Crypter(..)")
    }
}

/// Keyed HMAC-SHA256.
#[derive(Clone)]
pub struct Hasher {
    mac: HmacSha256,
}

impl Hasher {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        let mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { mac })
    }

    pub fn hash(&self, data: &[u8]) -> [u8; 32] {
        let mut mac = self.mac.clone();
        mac.update(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }

    /// Constant-time check of `tag` against the HMAC of `data`.
    pub fn verify(&self, data: &[u8], tag: &[u8]) -> bool {
        let mut mac = self.mac.clone();
        mac.update(data);
        mac.verify_slice(tag).is_ok()
    }
}

impl std::fmt::Debug for Hasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Hasher(..)")
    }
}

/// Both keys derived from one password.
#[derive(Clone, Debug)]
pub struct UserKeys {
    pub crypter: Crypter,
    pub hasher: Hasher,
}

impl UserKeys {
    pub fn derive(password: &str, salt: &[u8], iterations: u32) -> Result<Self, CryptoError> {
        let mut okm = [0u8; 64];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut okm);

        let mut aes = [0u8; 32];
        aes.copy_from_slice(&okm[..32]);

        Ok(Self { crypter: Crypter::new(&aes), hasher: Hasher::new(&okm[32..])? })
    }

    /// Base64 verifier stored with the user record.
    pub fn verifier(&self) -> String {
        BASE64.encode(self.hasher.hash(VERIFIER_LABEL))
    }

    /// Whether these keys produced `verifier`.
    pub fn check_verifier(&self, verifier: &str) -> Result<(), CryptoError> {
        let tag = BASE64.decode(verifier)?;
        if self.hasher.verify(VERIFIER_LABEL, &tag) {
            Ok(())
        } else {
            Err(CryptoError::InvalidPassword)
        }
    }
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

pub fn encode_b64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_b64(text: &str) -> Result<Vec<u8>, CryptoError> {
    Ok(BASE64.decode(text)?)
}
