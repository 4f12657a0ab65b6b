// Credential storage on top of a key-value backend
// Access token entries expire together with the token's own `exp` claim

use std::sync::Arc;

use super::codec;
use super::types::TokenKind;
use crate::store::KeyValueStore;

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const USERNAME_KEY: &str = "username";

/// Reads and writes the session's token pair
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    fn key(kind: TokenKind) -> &'static str {
        match kind {
            TokenKind::Access => ACCESS_TOKEN_KEY,
            TokenKind::Refresh => REFRESH_TOKEN_KEY,
        }
    }

    /// Stored token, or `None`. Backend failures read as absent.
    pub fn get(&self, kind: TokenKind) -> Option<String> {
        self.read(Self::key(kind))
    }

    /// Username remembered from the last login
    pub fn username(&self) -> Option<String> {
        self.read(USERNAME_KEY)
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.backend.get(key) {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(e) => {
                tracing::warn!(key, "Credential store read failed: {:#}", e);
                None
            }
        }
    }

    /// Persist both tokens
    pub fn set(&self, access_token: &str, refresh_token: &str) -> anyhow::Result<()> {
        let expires_at = codec::expiry(access_token);
        self.backend.set(ACCESS_TOKEN_KEY, access_token, expires_at)?;
        self.backend.set(REFRESH_TOKEN_KEY, refresh_token, None)?;

        tracing::debug!(
            expires_at = ?expires_at,
            "Stored credential pair"
        );
        Ok(())
    }

    /// Remember the login name alongside the access token
    pub fn set_username(&self, username: &str, access_token: &str) -> anyhow::Result<()> {
        self.backend
            .set(USERNAME_KEY, username, codec::expiry(access_token))
    }

    /// Remove every session entry. Never fails; backend errors are logged.
    pub fn clear(&self) {
        for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USERNAME_KEY] {
            if let Err(e) = self.backend.remove(key) {
                tracing::warn!(key, "Credential store delete failed: {:#}", e);
            }
        }
    }
}
