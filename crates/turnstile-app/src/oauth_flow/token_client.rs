//! Token service boundary used by [`super::OAuthFlowDriver`].

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use turnstile_activity::Activity;

use crate::user_authorization::TokenResponse;

const DEFAULT_SIGN_IN_LINK_BASE: &str = "https://token.turnstile.local/signin";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Public struct `TokenExchangeResource` used across turnstile components.
pub struct TokenExchangeResource {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Link and SSO metadata rendered into the sign-in card.
pub struct SignInResource {
    pub sign_in_link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_exchange_resource: Option<TokenExchangeResource>,
}

#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// SSO or On-Behalf-Of exchange input. `Debug` never prints the token.
pub struct TokenExchangeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

impl std::fmt::Debug for TokenExchangeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenExchangeRequest")
            .field("uri", &self.uri)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Trait contract for the token service.
///
/// `Ok(None)` means "no token"; `Err` is reserved for transport failures.
#[async_trait]
pub trait UserTokenClient: Send + Sync {
    async fn get_user_token(
        &self,
        user_id: &str,
        connection_name: &str,
        channel_id: &str,
        magic_code: Option<&str>,
    ) -> Result<Option<TokenResponse>>;

    async fn get_sign_in_resource(
        &self,
        connection_name: &str,
        activity: &Activity,
    ) -> Result<SignInResource>;

    async fn exchange_token(
        &self,
        user_id: &str,
        connection_name: &str,
        channel_id: &str,
        request: &TokenExchangeRequest,
    ) -> Result<Option<TokenResponse>>;

    async fn sign_out_user(
        &self,
        user_id: &str,
        connection_name: &str,
        channel_id: &str,
    ) -> Result<()>;
}

type UserConnection = (String, String);

#[derive(Debug, Default)]
struct TokenServiceState {
    tokens: HashMap<UserConnection, TokenResponse>,
    magic_codes: HashMap<(String, String, String), TokenResponse>,
    sso_tokens: HashMap<String, TokenResponse>,
    calls: BTreeMap<&'static str, usize>,
    minted: usize,
}

impl TokenServiceState {
    fn record(&mut self, operation: &'static str) {
        *self.calls.entry(operation).or_default() += 1;
    }
}

/// In-process token service for tests and the sign-in harness.
#[derive(Debug, Default)]
pub struct InMemoryUserTokenClient {
    state: Mutex<TokenServiceState>,
}

fn user_connection(user_id: &str, connection_name: &str) -> UserConnection {
    (user_id.to_string(), connection_name.to_string())
}

impl InMemoryUserTokenClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a token as if the user had already signed in.
    pub async fn set_token(&self, user_id: &str, connection_name: &str, token: TokenResponse) {
        self.state
            .lock()
            .await
            .tokens
            .insert(user_connection(user_id, connection_name), token);
    }

    /// Makes `code` redeemable once for `token`.
    pub async fn issue_magic_code(
        &self,
        user_id: &str,
        connection_name: &str,
        code: &str,
        token: TokenResponse,
    ) {
        self.state.lock().await.magic_codes.insert(
            (
                user_id.to_string(),
                connection_name.to_string(),
                code.to_string(),
            ),
            token,
        );
    }

    /// Makes an SSO token exchangeable once for `token`.
    pub async fn register_sso_token(&self, sso_token: &str, token: TokenResponse) {
        self.state
            .lock()
            .await
            .sso_tokens
            .insert(sso_token.to_string(), token);
    }

    pub async fn has_token(&self, user_id: &str, connection_name: &str) -> bool {
        self.state
            .lock()
            .await
            .tokens
            .contains_key(&user_connection(user_id, connection_name))
    }

    pub async fn call_count(&self, operation: &str) -> usize {
        self.state
            .lock()
            .await
            .calls
            .get(operation)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl UserTokenClient for InMemoryUserTokenClient {
    async fn get_user_token(
        &self,
        user_id: &str,
        connection_name: &str,
        _channel_id: &str,
        magic_code: Option<&str>,
    ) -> Result<Option<TokenResponse>> {
        let mut state = self.state.lock().await;
        state.record("get_user_token");
        let key = user_connection(user_id, connection_name);
        if let Some(code) = magic_code {
            let redeemed = state.magic_codes.remove(&(
                user_id.to_string(),
                connection_name.to_string(),
                code.to_string(),
            ));
            if let Some(token) = redeemed {
                state.tokens.insert(key, token.clone());
                return Ok(Some(token));
            }
        }
        Ok(state.tokens.get(&key).cloned())
    }

    async fn get_sign_in_resource(
        &self,
        connection_name: &str,
        activity: &Activity,
    ) -> Result<SignInResource> {
        let mut state = self.state.lock().await;
        state.record("get_sign_in_resource");
        Ok(SignInResource {
            sign_in_link: format!(
                "{DEFAULT_SIGN_IN_LINK_BASE}?connection={connection_name}&user={}",
                activity.from.id
            ),
            token_exchange_resource: Some(TokenExchangeResource {
                id: format!("{connection_name}-sso"),
                uri: None,
            }),
        })
    }

    async fn exchange_token(
        &self,
        user_id: &str,
        connection_name: &str,
        _channel_id: &str,
        request: &TokenExchangeRequest,
    ) -> Result<Option<TokenResponse>> {
        let mut state = self.state.lock().await;
        state.record("exchange_token");
        let Some(presented) = request.token.as_deref() else {
            return Ok(None);
        };
        if let Some(token) = state.sso_tokens.remove(presented) {
            state
                .tokens
                .insert(user_connection(user_id, connection_name), token.clone());
            return Ok(Some(token));
        }
        let known = state
            .tokens
            .iter()
            .any(|((user, _), token)| user == user_id && token.token == presented);
        if !known {
            return Ok(None);
        }
        state.minted += 1;
        let minted = TokenResponse::new(format!("{connection_name}-obo-{}", state.minted))
            .with_connection_name(connection_name)
            .exchangeable();
        Ok(Some(minted))
    }

    async fn sign_out_user(
        &self,
        user_id: &str,
        connection_name: &str,
        _channel_id: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.record("sign_out_user");
        state
            .tokens
            .remove(&user_connection(user_id, connection_name));
        Ok(())
    }
}
