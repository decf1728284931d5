use crate::errors::{Error, Result};
use crate::model::{Token, TokenGrant};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Performs the client-credentials exchange
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn exchange(&self) -> Result<TokenGrant>;
}

/// Caches the bearer token and refreshes it once it has expired
pub struct CredentialManager {
    endpoint: Arc<dyn TokenEndpoint>,
    token: Mutex<Option<Token>>,
}

impl CredentialManager {
    pub fn new(endpoint: Arc<dyn TokenEndpoint>) -> Self {
        Self {
            endpoint,
            token: Mutex::new(None),
        }
    }

    pub async fn ensure_valid_token(&self) -> Result<Token> {
        self.ensure_valid_token_at(Utc::now()).await
    }

    pub async fn ensure_valid_token_at(&self, now: DateTime<Utc>) -> Result<Token> {
        let mut cached = self.token.lock().await;

        if let Some(token) = cached.as_ref() {
            if !token.is_expired_at(now) {
                return Ok(token.clone());
            }
            info!("Access token expired at {}, refreshing", token.expires_at);
        }

        let token = token_from_grant(self.endpoint.exchange().await?, now)?;
        debug!("Got new token with expire time {}", token.expires_at);
        *cached = Some(token.clone());
        Ok(token)
    }
}

fn token_from_grant(grant: TokenGrant, now: DateTime<Utc>) -> Result<Token> {
    let value = grant
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::Auth("response has no access_token".to_string()))?;
    let expires_in = grant
        .expires_in
        .ok_or_else(|| Error::Auth("response has no expires_in".to_string()))?;

    let expires_at = Some(expires_in)
        .filter(|secs| *secs >= 0)
        .and_then(Duration::try_seconds)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| Error::Auth(format!("invalid expires_in: {}", expires_in)))?;

    Ok(Token { value, expires_at })
}
