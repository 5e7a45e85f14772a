//! Application credentials captured from running instances
//!
//! Instances may report long-lived credentials back after the user signs in.
//! They are stored encrypted per user and re-injected into the next instance
//! the user provisions. Reporting back is authorized by a short-lived,
//! single-use capture token issued at provision time.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{OrchestratorError, Result};

/// AES-GCM nonce length in bytes
const NONCE_LENGTH: usize = 12;

/// Length of the random part of a capture token
const TOKEN_BYTES: usize = 32;

/// Encryption primitive for captured credentials.
pub trait CredentialCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String>;
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// AES-256-GCM with a random nonce prepended to the ciphertext, base64 encoded.
#[derive(Clone)]
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| OrchestratorError::Credential(format!("Invalid key: {e}")))?;
        Ok(Self { cipher })
    }

    /// Build from a base64-encoded 32 byte key
    pub fn from_base64_key(key: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(key.trim())
            .map_err(|e| OrchestratorError::Credential(format!("Key is not base64: {e}")))?;
        Self::new(&bytes)
    }
}

impl CredentialCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| OrchestratorError::Credential(format!("Encryption failed: {e}")))?;

        let mut combined = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);

        Ok(STANDARD.encode(combined))
    }

    fn decrypt(&self, encrypted: &str) -> Result<String> {
        let combined = STANDARD
            .decode(encrypted)
            .map_err(|e| OrchestratorError::Credential(format!("Ciphertext is not base64: {e}")))?;

        if combined.len() < NONCE_LENGTH {
            return Err(OrchestratorError::Credential(
                "Encrypted data too short".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LENGTH);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| OrchestratorError::Credential(format!("Decryption failed: {e}")))?;

        String::from_utf8(plaintext)
            .map_err(|_| OrchestratorError::Credential("Decrypted data is not UTF-8".to_string()))
    }
}

/// A capture token in clear text. Only its hash is stored.
#[derive(Clone)]
pub struct CaptureToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for CaptureToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Previously captured credentials for a user, decrypted.
    async fn load_captured(&self, user_id: &str) -> Result<Option<String>>;

    async fn issue_capture_token(
        &self,
        user_id: &str,
        workspace_id: &str,
        ttl: Duration,
    ) -> Result<CaptureToken>;
}

#[derive(Clone)]
pub struct SqlCredentialStore {
    pool: SqlitePool,
    cipher: Option<Arc<dyn CredentialCipher>>,
}

impl SqlCredentialStore {
    /// Without a cipher nothing is injected and nothing can be captured.
    pub fn new(pool: SqlitePool, cipher: Option<Arc<dyn CredentialCipher>>) -> Self {
        Self { pool, cipher }
    }

    /// Exchange a capture token for storing `credentials` on behalf of the
    /// token's user. Tokens are single-use. Returns the user id.
    pub async fn redeem_capture_token(&self, token: &str, credentials: &str) -> Result<String> {
        let cipher = self.cipher.as_ref().ok_or_else(|| {
            OrchestratorError::Credential("Credential capture is not configured".to_string())
        })?;

        let now = Utc::now().timestamp();
        let hash = hash_token(token);

        let user_id: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE capture_tokens SET used_at = ?
            WHERE token_hash = ? AND used_at IS NULL AND expires_at > ?
            RETURNING user_id
            "#,
        )
        .bind(now)
        .bind(&hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(user_id) = user_id else {
            return Err(OrchestratorError::Credential(
                "Capture token is invalid, expired or already used".to_string(),
            ));
        };

        let ciphertext = cipher.encrypt(credentials)?;

        sqlx::query(
            r#"
            INSERT INTO captured_credentials (user_id, ciphertext, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET ciphertext = excluded.ciphertext,
                                               updated_at = excluded.updated_at
            "#,
        )
        .bind(&user_id)
        .bind(&ciphertext)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!(user_id = %user_id, "Captured credentials stored");
        Ok(user_id)
    }

    /// Drop tokens that expired or were used. Returns how many were removed.
    pub async fn purge_capture_tokens(&self) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM capture_tokens WHERE used_at IS NOT NULL OR expires_at <= ?")
                .bind(Utc::now().timestamp())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CredentialStore for SqlCredentialStore {
    async fn load_captured(&self, user_id: &str) -> Result<Option<String>> {
        let ciphertext: Option<String> =
            sqlx::query_scalar("SELECT ciphertext FROM captured_credentials WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        let (Some(ciphertext), Some(cipher)) = (ciphertext, self.cipher.as_ref()) else {
            return Ok(None);
        };

        // Unreadable credentials are not worth failing a provision over
        match cipher.decrypt(&ciphertext) {
            Ok(plaintext) => Ok(Some(plaintext)),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Ignoring unreadable captured credentials");
                Ok(None)
            }
        }
    }

    async fn issue_capture_token(
        &self,
        user_id: &str,
        workspace_id: &str,
        ttl: Duration,
    ) -> Result<CaptureToken> {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| OrchestratorError::InvalidInput(format!("Capture token TTL: {e}")))?;
        let expires_at = now + ttl;

        sqlx::query(
            r#"
            INSERT INTO capture_tokens (token_hash, user_id, workspace_id, expires_at, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(hash_token(&token))
        .bind(user_id)
        .bind(workspace_id)
        .bind(expires_at.timestamp())
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(CaptureToken { token, expires_at })
    }
}

fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_db;

    fn cipher() -> Arc<dyn CredentialCipher> {
        Arc::new(AesGcmCipher::new(&[7u8; 32]).unwrap())
    }

    #[test]
    fn test_encryption_roundtrip() {
        let cipher = AesGcmCipher::new(&[1u8; 32]).unwrap();
        let encrypted = cipher.encrypt("{\"token\":\"abc\"}").unwrap();

        assert_ne!(encrypted, "{\"token\":\"abc\"}");
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), "{\"token\":\"abc\"}");
    }

    #[test]
    fn test_different_keys_fail_decryption() {
        let encrypted = AesGcmCipher::new(&[1u8; 32]).unwrap().encrypt("secret").unwrap();
        let other = AesGcmCipher::new(&[2u8; 32]).unwrap();

        assert!(other.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_short_keys_are_rejected() {
        assert!(AesGcmCipher::new(&[0u8; 8]).is_err());
        assert!(AesGcmCipher::from_base64_key("not base64!").is_err());
    }

    #[tokio::test]
    async fn test_capture_token_is_single_use() {
        let pool = create_test_db().await;
        let store = SqlCredentialStore::new(pool, Some(cipher()));

        let token = store
            .issue_capture_token("user-1", "ws-1", Duration::from_secs(600))
            .await
            .unwrap();

        let user = store.redeem_capture_token(&token.token, "creds-v1").await.unwrap();
        assert_eq!(user, "user-1");
        assert_eq!(
            store.load_captured("user-1").await.unwrap().as_deref(),
            Some("creds-v1")
        );

        let again = store.redeem_capture_token(&token.token, "creds-v2").await;
        assert!(matches!(again, Err(OrchestratorError::Credential(_))));
        assert_eq!(store.purge_capture_tokens().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_token_is_rejected() {
        let pool = create_test_db().await;
        let store = SqlCredentialStore::new(pool, Some(cipher()));

        let token = store
            .issue_capture_token("user-1", "ws-1", Duration::ZERO)
            .await
            .unwrap();

        assert!(store.redeem_capture_token(&token.token, "creds").await.is_err());
        assert!(store.load_captured("user-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_without_cipher_nothing_is_loaded() {
        let pool = create_test_db().await;
        sqlx::query("INSERT INTO captured_credentials (user_id, ciphertext, updated_at) VALUES ('u', 'x', 0)")
            .execute(&pool)
            .await
            .unwrap();

        let store = SqlCredentialStore::new(pool, None);
        assert!(store.load_captured("u").await.unwrap().is_none());
    }

    #[test]
    fn test_token_hash_is_hex_sha256() {
        let hash = hash_token("abc");
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
