//! Per-handler OAuth driver contract consumed by the engine.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use turnstile_activity::TurnContext;

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Token returned by a driver. `Debug` never prints the token value.
pub struct TokenResponse {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
    /// On-Behalf-Of style tokens that must be re-exchanged on every access.
    #[serde(default)]
    pub is_exchangeable: bool,
}

impl TokenResponse {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            connection_name: None,
            expiration: None,
            is_exchangeable: false,
        }
    }

    pub fn with_expiration(mut self, expiration: DateTime<Utc>) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_connection_name(mut self, connection_name: impl Into<String>) -> Self {
        self.connection_name = Some(connection_name.into());
        self
    }

    pub fn exchangeable(mut self) -> Self {
        self.is_exchangeable = true;
        self
    }
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token", &"[REDACTED]")
            .field("connection_name", &self.connection_name)
            .field("expiration", &self.expiration)
            .field("is_exchangeable", &self.is_exchangeable)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `SignInStatus` values.
pub enum SignInStatus {
    Pending,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outcome of one driver sign-in step.
pub struct SignInResponse {
    pub status: SignInStatus,
    pub token: Option<TokenResponse>,
    pub cause: Option<String>,
    pub error: Option<String>,
}

impl SignInResponse {
    pub fn pending() -> Self {
        Self {
            status: SignInStatus::Pending,
            token: None,
            cause: None,
            error: None,
        }
    }

    pub fn complete(token: TokenResponse) -> Self {
        Self {
            status: SignInStatus::Complete,
            token: Some(token),
            cause: None,
            error: None,
        }
    }

    pub fn error(cause: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            status: SignInStatus::Error,
            token: None,
            cause: Some(cause.into()),
            error: Some(detail.into()),
        }
    }

    pub fn cause_or_unknown(&self) -> &str {
        self.cause.as_deref().unwrap_or("unknown")
    }
}

/// One configured sign-in handler.
///
/// `sign_user_in` errors are folded into a flow error by the engine; they do
/// not abort the turn.
#[async_trait]
pub trait UserAuthorizationDriver: Send + Sync {
    async fn sign_user_in(
        &self,
        context: &TurnContext,
        force_sign_in: bool,
        exchange_connection: Option<&str>,
        exchange_scopes: &[String],
    ) -> Result<SignInResponse>;

    async fn get_refreshed_user_token(
        &self,
        context: &TurnContext,
        exchange_connection: Option<&str>,
        exchange_scopes: &[String],
    ) -> Result<Option<TokenResponse>>;

    async fn reset_state(&self, context: &TurnContext) -> Result<()>;

    async fn sign_out(&self, context: &TurnContext) -> Result<()>;
}
