//! Credential vault: sealed broker credentials and shared session handles.
//!
//! Credentials rest in the account store as AES-256-GCM blobs and are
//! unsealed in memory only for the lifetime of a session handle. Handles
//! are cached per account and shared via `Arc`; concurrent callers for the
//! same account single-flight through a per-account slot lock, so one
//! unseal serves a whole fan-out burst.

use std::sync::Arc;
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::db::Database;

/// Sessions stay valid this long after authentication; the broker rotates
/// daily tokens, 8 hours keeps us safely inside a trading day.
fn session_ttl() -> chrono::Duration {
    chrono::Duration::hours(8)
}

/// Vault failure modes.
#[derive(Debug, Error, Clone)]
pub enum VaultError {
    /// Credentials missing or unreadable; permanent until the vault record
    /// is updated.
    #[error("invalid credentials for {0}")]
    InvalidCredentials(String),

    /// Backing store hiccup; worth one retry with backoff.
    #[error("transient auth failure: {0}")]
    AuthTransient(String),
}

/// Unsealed broker credentials, exactly the fields the wire head needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerCredentials {
    /// Broker client code; doubles as the order requester code.
    pub client_code: String,
    pub user_id: String,
    pub password: String,
    pub api_key: String,
    pub app_name: String,
    pub app_version: String,
    /// Origin IP the broker requires on order requests.
    pub public_ip: String,
}

/// An authenticated broker session for one account.
#[derive(Debug, Clone)]
pub struct BrokerSession {
    pub account_id: String,
    pub credentials: BrokerCredentials,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl BrokerSession {
    /// True when the session is inside the pre-expiry refresh window.
    pub fn needs_refresh(&self, guard: Duration) -> bool {
        let guard = chrono::Duration::from_std(guard).unwrap_or(chrono::Duration::zero());
        Utc::now() + guard >= self.expires_at
    }
}

type SessionSlot = Arc<Mutex<Option<Arc<BrokerSession>>>>;

/// Holds the sealing key and the per-account session cache.
pub struct CredentialVault {
    db: Database,
    key: [u8; 32],
    refresh_guard: Duration,
    slots: Mutex<ahash::AHashMap<String, SessionSlot>>,
}

impl CredentialVault {
    /// `key_b64` is the base64 of exactly 32 key bytes.
    pub fn new(db: Database, key_b64: &str, refresh_guard: Duration) -> anyhow::Result<Self> {
        let raw = BASE64
            .decode(key_b64)
            .map_err(|e| anyhow::anyhow!("vault key is not valid base64: {e}"))?;
        let key: [u8; 32] = raw
            .try_into()
            .map_err(|_| anyhow::anyhow!("vault key must be 32 bytes"))?;
        Ok(Self {
            db,
            key,
            refresh_guard,
            slots: Mutex::new(ahash::AHashMap::new()),
        })
    }

    /// Seal credentials for storage: base64(nonce || ciphertext).
    pub fn seal(&self, credentials: &BrokerCredentials) -> anyhow::Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).expect("key length checked at build");
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let plaintext = serde_json::to_vec(credentials)?;
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|e| anyhow::anyhow!("seal failed: {e}"))?;
        let mut blob = nonce_bytes.to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    fn unseal(&self, account_id: &str, blob: &str) -> Result<BrokerCredentials, VaultError> {
        let invalid = || VaultError::InvalidCredentials(account_id.to_string());
        let raw = BASE64.decode(blob).map_err(|_| invalid())?;
        if raw.len() < 12 {
            return Err(invalid());
        }
        let (nonce_bytes, ciphertext) = raw.split_at(12);
        let cipher = Aes256Gcm::new_from_slice(&self.key).expect("key length checked at build");
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| invalid())?;
        serde_json::from_slice(&plaintext).map_err(|_| invalid())
    }

    async fn slot_for(&self, account_id: &str) -> SessionSlot {
        let mut slots = self.slots.lock().await;
        slots
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Yield the shared session for an account, authenticating if the cache
    /// is cold or inside the refresh guard window.
    pub async fn session(&self, account_id: &str) -> Result<Arc<BrokerSession>, VaultError> {
        let slot = self.slot_for(account_id).await;
        let mut guard = slot.lock().await;

        if let Some(session) = guard.as_ref() {
            if !session.needs_refresh(self.refresh_guard) {
                return Ok(session.clone());
            }
        }

        let session = Arc::new(self.authenticate(account_id).await?);
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Drop the cached session so the next caller re-authenticates.
    pub async fn invalidate(&self, account_id: &str) {
        let slot = self.slot_for(account_id).await;
        *slot.lock().await = None;
    }

    /// Invalidate and authenticate fresh; the adapter's one allowed
    /// recovery after an auth rejection.
    pub async fn reauthenticate(
        &self,
        account_id: &str,
    ) -> Result<Arc<BrokerSession>, VaultError> {
        self.invalidate(account_id).await;
        self.session(account_id).await
    }

    async fn authenticate(&self, account_id: &str) -> Result<BrokerSession, VaultError> {
        let record = self
            .db
            .get_account(account_id)
            .await
            .map_err(|e| VaultError::AuthTransient(e.to_string()))?
            .ok_or_else(|| VaultError::InvalidCredentials(account_id.to_string()))?;

        let credentials = self.unseal(account_id, &record.sealed_credentials)?;
        let now = Utc::now();
        tracing::debug!(account = %account_id, "broker session established");
        Ok(BrokerSession {
            account_id: account_id.to_string(),
            credentials,
            created_at: now,
            expires_at: now + session_ttl(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::AccountRecord;
    use rust_decimal_macros::dec;

    fn test_key() -> String {
        BASE64.encode([7u8; 32])
    }

    fn creds(client_code: &str) -> BrokerCredentials {
        BrokerCredentials {
            client_code: client_code.to_string(),
            user_id: "user".to_string(),
            password: "pass".to_string(),
            api_key: "key".to_string(),
            app_name: "copyrelay".to_string(),
            app_version: "1.0.0".to_string(),
            public_ip: "203.0.113.7".to_string(),
        }
    }

    async fn vault_with_account(account: &str) -> CredentialVault {
        let db = Database::in_memory().await.unwrap();
        let vault = CredentialVault::new(db.clone(), &test_key(), Duration::from_secs(300)).unwrap();
        let sealed = vault.seal(&creds(account)).unwrap();
        db.save_account(&AccountRecord {
            account_id: account.to_string(),
            sealed_credentials: sealed,
            balance: dec!(100000),
            max_daily_loss: None,
            max_drawdown_pct: None,
            max_position_notional: None,
            max_open_positions: None,
            max_exposure: None,
        })
        .await
        .unwrap();
        vault
    }

    #[tokio::test]
    async fn seal_unseal_roundtrip() {
        let vault = vault_with_account("F1").await;
        let sealed = vault.seal(&creds("F1")).unwrap();
        let unsealed = vault.unseal("F1", &sealed).unwrap();
        assert_eq!(unsealed.client_code, "F1");
        assert_eq!(unsealed.password, "pass");
    }

    #[tokio::test]
    async fn sessions_are_cached_and_shared() {
        let vault = vault_with_account("F1").await;
        let a = vault.session("F1").await.unwrap();
        let b = vault.session("F1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn invalidate_forces_fresh_session() {
        let vault = vault_with_account("F1").await;
        let a = vault.session("F1").await.unwrap();
        vault.invalidate("F1").await;
        let b = vault.session("F1").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn unknown_account_is_invalid_credentials() {
        let vault = vault_with_account("F1").await;
        let err = vault.session("NOPE").await.unwrap_err();
        assert!(matches!(err, VaultError::InvalidCredentials(_)));
    }

    #[tokio::test]
    async fn garbage_blob_is_invalid_credentials() {
        let db = Database::in_memory().await.unwrap();
        let vault = CredentialVault::new(db.clone(), &test_key(), Duration::from_secs(300)).unwrap();
        db.save_account(&AccountRecord {
            account_id: "F2".to_string(),
            sealed_credentials: "not base64!!".to_string(),
            balance: dec!(0),
            max_daily_loss: None,
            max_drawdown_pct: None,
            max_position_notional: None,
            max_open_positions: None,
            max_exposure: None,
        })
        .await
        .unwrap();

        let err = vault.session("F2").await.unwrap_err();
        assert!(matches!(err, VaultError::InvalidCredentials(_)));
    }

    #[test]
    fn refresh_window() {
        let session = BrokerSession {
            account_id: "F1".to_string(),
            credentials: creds("F1"),
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::minutes(3),
        };
        assert!(session.needs_refresh(Duration::from_secs(300)));
        assert!(!session.needs_refresh(Duration::from_secs(60)));
    }
}
