//! C11 — Config / Secrets Store.
//!
//! Read path is env-override → cache → DB fallback; write
//! paths encrypt secret values with a Fernet-style token derived from
//! `SECRET_KEY`. The Redis cache tier is an external system out of this
//! crate's persisted-state scope, so it is represented here as an
//! injectable [`ConfigCache`] seam — wire it to a real cache in the host
//! process, or leave the no-op default, which degrades gracefully to
//! env-then-DB. Uses the exact Fernet token shape (SHA-256-derived key,
//! 44-byte base64 key material) and `store::sqlite::SqliteStore`'s per-call instrument
//! style for the DB half.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use miette::Diagnostic;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::instrument;

use crate::store::models::ConfigRow;
use crate::store::Store;
use crate::types::generate_id;

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("SECRET_KEY is not configured")]
    #[diagnostic(code(config::missing_secret_key))]
    MissingSecretKey,

    #[error("failed to decrypt config value")]
    #[diagnostic(code(config::decrypt_failed))]
    DecryptFailed,

    #[error("config backend error: {0}")]
    #[diagnostic(code(config::backend))]
    Backend(String),
}

impl From<crate::store::StoreError> for ConfigError {
    fn from(err: crate::store::StoreError) -> Self {
        ConfigError::Backend(err.to_string())
    }
}

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

const TOKEN_VERSION: u8 = 0x80;

/// Derives a 32-byte key from `SECRET_KEY` via SHA-256: the first 16 bytes
/// sign the token (HMAC-SHA256), the last 16 encrypt it (AES-128-CBC).
fn derive_key(secret_key: &str) -> [u8; 32] {
    let digest = Sha256::digest(secret_key.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

/// Encrypts `plaintext` into a self-contained, authenticated token:
/// `version(1) || timestamp(8, BE) || iv(16) || ciphertext || hmac(32)`,
/// base64-url encoded without padding.
fn encrypt_value(secret_key: &str, plaintext: &str) -> String {
    let key = derive_key(secret_key);
    let (signing_key, enc_key) = key.split_at(16);

    let mut iv = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let timestamp = chrono::Utc::now().timestamp() as u64;

    let ciphertext = Aes128CbcEnc::new(GenericArray::from_slice(enc_key), GenericArray::from_slice(&iv))
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    let mut payload = Vec::with_capacity(1 + 8 + 16 + ciphertext.len());
    payload.push(TOKEN_VERSION);
    payload.extend_from_slice(&timestamp.to_be_bytes());
    payload.extend_from_slice(&iv);
    payload.extend_from_slice(&ciphertext);

    let mut mac = HmacSha256::new_from_slice(signing_key).expect("HMAC accepts any key length");
    mac.update(&payload);
    let signature = mac.finalize().into_bytes();

    payload.extend_from_slice(&signature);
    URL_SAFE_NO_PAD.encode(payload)
}

fn decrypt_value(secret_key: &str, token: &str) -> Result<String> {
    let key = derive_key(secret_key);
    let (signing_key, enc_key) = key.split_at(16);

    let raw = URL_SAFE_NO_PAD.decode(token).map_err(|_| ConfigError::DecryptFailed)?;
    if raw.len() < 1 + 8 + 16 + 32 {
        return Err(ConfigError::DecryptFailed);
    }

    let (payload, signature) = raw.split_at(raw.len() - 32);
    let mut mac = HmacSha256::new_from_slice(signing_key).expect("HMAC accepts any key length");
    mac.update(payload);
    mac.verify_slice(signature).map_err(|_| ConfigError::DecryptFailed)?;

    if payload[0] != TOKEN_VERSION {
        return Err(ConfigError::DecryptFailed);
    }
    let iv = &payload[9..25];
    let ciphertext = &payload[25..];

    let plaintext = Aes128CbcDec::new(GenericArray::from_slice(enc_key), GenericArray::from_slice(iv))
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| ConfigError::DecryptFailed)?;

    String::from_utf8(plaintext).map_err(|_| ConfigError::DecryptFailed)
}

/// A cache entry mirrors the `{is_encrypted, value}` shape stored under
/// `${prefix}sys:config:${key}` in the original Redis-backed cache.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigCacheEntry {
    pub is_encrypted: bool,
    pub value: String,
}

/// Seam over the external cache tier the real deployment fronts the
/// config table with. Out of this crate's persisted-state scope; the
/// default [`NoopConfigCache`] simply always misses.
#[async_trait]
pub trait ConfigCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<ConfigCacheEntry>;
    async fn set(&self, key: &str, entry: ConfigCacheEntry);
}

#[derive(Default)]
pub struct NoopConfigCache;

#[async_trait]
impl ConfigCache for NoopConfigCache {
    async fn get(&self, _key: &str) -> Option<ConfigCacheEntry> {
        None
    }

    async fn set(&self, _key: &str, _entry: ConfigCacheEntry) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// An environment override shadows this key; the write was skipped.
    Skip,
    Written,
}

pub struct ConfigService {
    store: Arc<dyn Store>,
    cache: Arc<dyn ConfigCache>,
    secret_key: Option<String>,
}

impl ConfigService {
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn ConfigCache>, secret_key: Option<String>) -> Self {
        Self { store, cache, secret_key }
    }

    pub fn with_default_cache(store: Arc<dyn Store>, secret_key: Option<String>) -> Self {
        Self::new(store, Arc::new(NoopConfigCache), secret_key)
    }

    fn decrypt_if_needed(&self, is_encrypted: bool, value: &str) -> Result<String> {
        if !is_encrypted {
            return Ok(value.to_string());
        }
        let secret_key = self.secret_key.as_deref().ok_or(ConfigError::MissingSecretKey)?;
        decrypt_value(secret_key, value)
    }

    /// `get(key)`: env override, then cache, then DB.
    #[instrument(skip(self))]
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        dotenvy::dotenv().ok();
        if let Ok(v) = std::env::var(key) {
            return Ok(Some(v));
        }

        if let Some(entry) = self.cache.get(key).await {
            return self.decrypt_if_needed(entry.is_encrypted, &entry.value).map(Some);
        }

        match self.store.get_config(key).await? {
            Some(row) => {
                let plain = self.decrypt_if_needed(row.is_encrypted, &row.value)?;
                self.cache
                    .set(key, ConfigCacheEntry { is_encrypted: row.is_encrypted, value: row.value.clone() })
                    .await;
                Ok(Some(plain))
            }
            None => Ok(None),
        }
    }

    /// `add(key, value, is_secret, remark)`: returns `Skip` if an env
    /// override shadows the key; otherwise persists (encrypting when
    /// `is_secret`), preferring an existing cache entry's value over the
    /// caller's new one to protect against a concurrent writer race.
    #[instrument(skip(self, value))]
    pub async fn add(&self, key: &str, value: &str, is_secret: bool, remark: Option<String>) -> Result<WriteOutcome> {
        dotenvy::dotenv().ok();
        if std::env::var(key).is_ok() {
            return Ok(WriteOutcome::Skip);
        }

        let (is_encrypted, stored_value) = self.resolve_value_to_persist(key, value, is_secret).await?;

        let row = ConfigRow { config_bid: generate_id(), key: key.to_string(), value: stored_value.clone(), is_encrypted, remark };
        self.store.upsert_config(row).await?;
        self.cache.set(key, ConfigCacheEntry { is_encrypted, value: stored_value }).await;
        Ok(WriteOutcome::Written)
    }

    /// `update(key, value, is_secret, remark)`: `false` if an env override
    /// shadows the key, `true` once persisted.
    #[instrument(skip(self, value))]
    pub async fn update(&self, key: &str, value: &str, is_secret: bool, remark: Option<String>) -> Result<bool> {
        match self.add(key, value, is_secret, remark).await? {
            WriteOutcome::Skip => Ok(false),
            WriteOutcome::Written => Ok(true),
        }
    }

    async fn resolve_value_to_persist(&self, key: &str, value: &str, is_secret: bool) -> Result<(bool, String)> {
        if let Some(entry) = self.cache.get(key).await {
            return Ok((entry.is_encrypted, entry.value));
        }
        if is_secret {
            let secret_key = self.secret_key.as_deref().ok_or(ConfigError::MissingSecretKey)?;
            Ok((true, encrypt_value(secret_key, value)))
        } else {
            Ok((false, value.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let secret = "test-secret-key-12345";
        let token = encrypt_value(secret, "sensitive-data-123");
        assert_ne!(token, "sensitive-data-123");
        let plain = decrypt_value(secret, &token).unwrap();
        assert_eq!(plain, "sensitive-data-123");
    }

    #[test]
    fn decrypt_rejects_tampered_token() {
        let secret = "test-secret-key-12345";
        let mut token = encrypt_value(secret, "sensitive-data-123");
        token.push('x');
        assert!(decrypt_value(secret, &token).is_err());
    }

    #[test]
    fn decrypt_rejects_wrong_key() {
        let token = encrypt_value("key-one", "sensitive-data-123");
        assert!(decrypt_value("key-two", &token).is_err());
    }

    #[tokio::test]
    async fn get_prefers_env_override() {
        std::env::set_var("MDF_TEST_ENV_OVERRIDE", "from-env");
        let store = Arc::new(InMemoryStore::new());
        let svc = ConfigService::with_default_cache(store, None);
        let value = svc.get("MDF_TEST_ENV_OVERRIDE").await.unwrap();
        assert_eq!(value.as_deref(), Some("from-env"));
        std::env::remove_var("MDF_TEST_ENV_OVERRIDE");
    }

    #[tokio::test]
    async fn add_then_get_roundtrips_plain_value() {
        let store = Arc::new(InMemoryStore::new());
        let svc = ConfigService::with_default_cache(store, None);
        let outcome = svc.add("feature.flag", "on", false, None).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        let value = svc.get("feature.flag").await.unwrap();
        assert_eq!(value.as_deref(), Some("on"));
    }

    #[tokio::test]
    async fn add_secret_requires_secret_key() {
        let store = Arc::new(InMemoryStore::new());
        let svc = ConfigService::with_default_cache(store, None);
        let err = svc.add("api.key", "sekret", true, None).await.unwrap_err();
        assert!(matches!(err, ConfigError::MissingSecretKey));
    }

    #[tokio::test]
    async fn add_then_get_roundtrips_encrypted_value() {
        let store = Arc::new(InMemoryStore::new());
        let svc = ConfigService::with_default_cache(store, Some("topsecret".to_string()));
        svc.add("api.key", "sekret-value", true, None).await.unwrap();
        let value = svc.get("api.key").await.unwrap();
        assert_eq!(value.as_deref(), Some("sekret-value"));
    }
}
