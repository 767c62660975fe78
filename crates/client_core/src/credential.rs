use std::fmt;

use anyhow::Result;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use storage::PersistentStore;

use crate::error::CredentialError;

pub const TOKEN_KEY: &str = "token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const USERNAME_KEY: &str = "username";
pub const USER_ID_KEY: &str = "user_id";

/// Keys the auth collaborator writes and sign-out must clear.
pub const CREDENTIAL_KEYS: [&str; 4] = [TOKEN_KEY, REFRESH_TOKEN_KEY, USERNAME_KEY, USER_ID_KEY];

#[derive(Deserialize)]
struct Claims {
    #[serde(default)]
    exp: Option<i64>,
}

/// Bearer token handed over by the auth collaborator.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .finish()
    }
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Expiry from the `exp` claim. `Ok(None)` means the token never expires.
    pub fn expires_at(&self) -> Result<Option<DateTime<Utc>>, CredentialError> {
        let payload = self
            .token
            .split('.')
            .nth(1)
            .filter(|segment| !segment.is_empty())
            .ok_or(CredentialError::Malformed)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|_| CredentialError::Malformed)?;
        let claims: Claims =
            serde_json::from_slice(&bytes).map_err(|_| CredentialError::Malformed)?;
        match claims.exp {
            None => Ok(None),
            Some(exp) => DateTime::from_timestamp(exp, 0)
                .map(Some)
                .ok_or(CredentialError::Malformed),
        }
    }

    /// Fails when the token is undecodable or expired at `now`.
    pub fn ensure_valid(&self, now: DateTime<Utc>) -> Result<(), CredentialError> {
        if self.token.is_empty() {
            return Err(CredentialError::Missing);
        }
        match self.expires_at()? {
            Some(exp) if now >= exp => Err(CredentialError::Expired),
            _ => Ok(()),
        }
    }
}

pub async fn load_credential(store: &dyn PersistentStore) -> Result<Option<Credential>> {
    Ok(store.get(TOKEN_KEY).await?.map(Credential::new))
}

pub async fn purge_credential(store: &dyn PersistentStore) -> Result<()> {
    for key in CREDENTIAL_KEYS {
        store.remove(key).await?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/credential_tests.rs"]
mod tests;
