use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::CredentialError;

/// Short-lived bearer credential for the realtime endpoint
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// True when the token expires within `margin` from now
    pub fn expires_within(&self, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or_else(|_| chrono::Duration::zero());
        self.expires_at - margin <= Utc::now()
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Issues tokens for a scope
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError>;
}

/// Hands out a fixed key with a rolling expiry
pub struct StaticCredentials {
    token: String,
    ttl: Duration,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>, ttl: Duration) -> Self {
        Self {
            token: token.into(),
            ttl,
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn get_token(&self, _scope: &str) -> Result<AccessToken, CredentialError> {
        Ok(AccessToken::new(self.token.clone(), expiry_after(self.ttl)))
    }
}

/// Reads the key from an environment variable on every request
pub struct EnvCredentials {
    var: String,
    ttl: Duration,
}

impl EnvCredentials {
    pub fn new(var: impl Into<String>, ttl: Duration) -> Self {
        Self {
            var: var.into(),
            ttl,
        }
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentials {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        match std::env::var(&self.var) {
            Ok(token) if !token.trim().is_empty() => {
                Ok(AccessToken::new(token.trim(), expiry_after(self.ttl)))
            }
            _ => Err(CredentialError::Unavailable {
                scope: scope.to_string(),
                message: format!("environment variable {} is not set", self.var),
            }),
        }
    }
}

fn expiry_after(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1))
}

/// Caches one token and refreshes it shortly before expiry
pub struct TokenCache {
    provider: Arc<dyn CredentialProvider>,
    scope: String,
    refresh_margin: Duration,
    current: Option<AccessToken>,
}

impl TokenCache {
    pub fn new(provider: Arc<dyn CredentialProvider>, scope: impl Into<String>) -> Self {
        Self {
            provider,
            scope: scope.into(),
            refresh_margin: Duration::from_secs(60),
            current: None,
        }
    }

    /// A token valid for at least the refresh margin
    pub async fn token(&mut self) -> Result<AccessToken, CredentialError> {
        if let Some(token) = &self.current {
            if !token.expires_within(self.refresh_margin) {
                return Ok(token.clone());
            }
            debug!("Access token for {} near expiry, refreshing", self.scope);
        }

        let token = self.provider.get_token(&self.scope).await?;
        info!("Obtained access token for {} (expires {})", self.scope, token.expires_at);
        self.current = Some(token.clone());
        Ok(token)
    }
}
