//! Encrypted per-user agent credentials
//!
//! Values are sealed with AES-256-GCM and stored as base64(nonce || ciphertext).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use agentrun_queue::{Clock, CredentialBundle, CredentialError, CredentialResolver, SystemClock};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::backend::{from_millis_opt, to_millis, StorageError};

const NONCE_LEN: usize = 12;

pub struct SqliteCredentialVault {
    pool: SqlitePool,
    cipher: Aes256Gcm,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for SqliteCredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteCredentialVault").finish_non_exhaustive()
    }
}

impl SqliteCredentialVault {
    pub fn new(pool: SqlitePool, key: &[u8]) -> Result<Self, StorageError> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| StorageError::Crypto("vault key must be 32 bytes".to_string()))?;
        Ok(Self {
            pool,
            cipher,
            clock: Arc::new(SystemClock),
        })
    }

    /// Key from `AGENTRUN_VAULT_KEY` (base64, 32 bytes)
    pub fn from_env(pool: SqlitePool) -> Result<Self, StorageError> {
        let encoded = Zeroizing::new(std::env::var("AGENTRUN_VAULT_KEY").map_err(|_| {
            StorageError::Crypto("AGENTRUN_VAULT_KEY is not set".to_string())
        })?);
        let key = Zeroizing::new(
            base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| StorageError::Crypto(format!("AGENTRUN_VAULT_KEY: {}", e)))?,
        );
        Self::new(pool, &key)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn encrypt(&self, plaintext: &str) -> Result<String, StorageError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| StorageError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    fn decrypt(&self, encoded: &str) -> Result<Zeroizing<String>, StorageError> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| StorageError::Crypto(format!("Base64 decode failed: {}", e)))?;

        if combined.len() <= NONCE_LEN {
            return Err(StorageError::Crypto("Encrypted value too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| StorageError::Crypto(format!("Decryption failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map(Zeroizing::new)
            .map_err(|e| StorageError::Crypto(format!("UTF-8 decode failed: {}", e)))
    }

    /// Store (or replace) one credential field, re-activating it
    pub async fn store_secret(
        &self,
        agent_id: &str,
        user_id: &str,
        field: &str,
        value: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let sealed = self.encrypt(value)?;
        sqlx::query(
            r#"
            INSERT INTO credentials (agent_id, user_id, field, ciphertext, expires_at, active, updated_at)
            VALUES (?, ?, ?, ?, ?, 1, ?)
            ON CONFLICT (agent_id, user_id, field) DO UPDATE SET
                ciphertext = excluded.ciphertext,
                expires_at = excluded.expires_at,
                active = 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(agent_id)
        .bind(user_id)
        .bind(field)
        .bind(sealed)
        .bind(expires_at.map(to_millis))
        .bind(to_millis(self.clock.now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn deactivate(
        &self,
        agent_id: &str,
        user_id: &str,
        field: &str,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE credentials SET active = 0, updated_at = ? \
             WHERE agent_id = ? AND user_id = ? AND field = ?",
        )
        .bind(to_millis(self.clock.now()))
        .bind(agent_id)
        .bind(user_id)
        .bind(field)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl CredentialResolver for SqliteCredentialVault {
    async fn resolve(
        &self,
        agent_id: &str,
        user_id: &str,
        fields: &[String],
    ) -> Result<CredentialBundle, CredentialError> {
        let now = self.clock.now();
        let mut bundle = CredentialBundle::new();

        for field in fields {
            let row = sqlx::query(
                "SELECT ciphertext, expires_at, active FROM credentials \
                 WHERE agent_id = ? AND user_id = ? AND field = ?",
            )
            .bind(agent_id)
            .bind(user_id)
            .bind(field)
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::from)?;

            let Some(row) = row else {
                return Err(CredentialError::Missing(field.clone()));
            };
            let active: bool = row.try_get("active").map_err(StorageError::from)?;
            let expires_at = from_millis_opt(row.try_get("expires_at").map_err(StorageError::from)?)?;
            if !active || expires_at.is_some_and(|at| at <= now) {
                return Err(CredentialError::Missing(field.clone()));
            }

            let sealed: String = row.try_get("ciphertext").map_err(StorageError::from)?;
            let value = self.decrypt(&sealed).map_err(|e| {
                tracing::error!(agent_id, user_id, field = %field, error = %e, "Credential decryption failed");
                CredentialError::Decryption(field.clone())
            })?;
            bundle.insert(field.clone(), value.as_str());
        }

        Ok(bundle)
    }
}
