//! OAuth card sign-in driver backed by a token service.
//!
//! Starting a flow either returns a token the service already holds or sends
//! an OAuth card and reports Pending. Continuations accept a typed magic code,
//! `signin/verifyState`, `signin/tokenExchange`, the `tokens/response` event
//! and `signin/failure`. Flow records are kept in storage per
//! (channel, conversation, user, handler) so a pending flow survives restarts.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use turnstile_activity::{sign_in_names, Activity, Attachment, InvokeResponse, TurnContext};
use turnstile_core::{current_unix_timestamp_ms, is_past_deadline, unix_ms_deadline};
use turnstile_storage::{delete_key, read_typed, write_typed, Storage};

use crate::settings::{AuthorizationSettings, HandlerSettings};
use crate::user_authorization::{
    SignInResponse, TokenResponse, UserAuthorizationDriver,
};

mod token_client;


pub use token_client::{
    InMemoryUserTokenClient, SignInResource, TokenExchangeRequest, TokenExchangeResource,
    UserTokenClient,
};

pub const OAUTH_CARD_CONTENT_TYPE: &str = "application/vnd.microsoft.card.oauth";
const MAGIC_CODE_LENGTH: usize = 6;
const PRECONDITION_FAILED: u16 = 412;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct FlowRecord {
    started_unix_ms: u64,
    expires_unix_ms: u64,
}

fn magic_code(text: Option<&str>) -> Option<&str> {
    let code = text?.trim();
    (code.len() == MAGIC_CODE_LENGTH && code.bytes().all(|byte| byte.is_ascii_digit()))
        .then_some(code)
}

fn value_str<'a>(activity: &'a Activity, field: &str) -> Option<&'a str> {
    activity
        .value
        .as_ref()
        .and_then(|value| value.get(field))
        .and_then(Value::as_str)
}

/// Public struct `OAuthFlowDriver` used across turnstile components.
pub struct OAuthFlowDriver {
    handler_name: String,
    settings: HandlerSettings,
    client: Arc<dyn UserTokenClient>,
    storage: Arc<dyn Storage>,
}

impl OAuthFlowDriver {
    pub fn new(
        handler_name: impl Into<String>,
        settings: HandlerSettings,
        client: Arc<dyn UserTokenClient>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            handler_name: handler_name.into(),
            settings,
            client,
            storage,
        }
    }

    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }

    pub fn connection_name(&self) -> &str {
        &self.settings.connection_name
    }

    /// `oauth-flow/{channel}/{conversation}/{user}/{handler}`
    fn flow_key(&self, activity: &Activity) -> String {
        format!(
            "oauth-flow/{}/{}/{}/{}",
            activity.channel_id, activity.conversation.id, activity.from.id, self.handler_name
        )
    }

    pub async fn has_active_flow(&self, activity: &Activity) -> Result<bool> {
        Ok(self.load_flow(activity).await?.is_some())
    }

    async fn load_flow(&self, activity: &Activity) -> Result<Option<FlowRecord>> {
        Ok(read_typed::<FlowRecord>(self.storage.as_ref(), &self.flow_key(activity)).await?)
    }

    async fn clear_flow(&self, activity: &Activity) -> Result<()> {
        delete_key(self.storage.as_ref(), &self.flow_key(activity)).await?;
        Ok(())
    }

    fn exchange_parameters<'a>(
        &'a self,
        exchange_connection: Option<&'a str>,
        exchange_scopes: &'a [String],
    ) -> Option<(&'a str, &'a [String])> {
        let connection = exchange_connection.or(self.settings.obo_connection_name.as_deref())?;
        let scopes = if exchange_scopes.is_empty() {
            self.settings.obo_scopes.as_slice()
        } else {
            exchange_scopes
        };
        Some((connection, scopes))
    }

    async fn exchange_on_behalf_of(
        &self,
        activity: &Activity,
        token: &TokenResponse,
        connection: &str,
        scopes: &[String],
    ) -> Result<Option<TokenResponse>> {
        let request = TokenExchangeRequest {
            uri: None,
            token: Some(token.token.clone()),
            scopes: scopes.to_vec(),
        };
        let exchanged = self
            .client
            .exchange_token(&activity.from.id, connection, &activity.channel_id, &request)
            .await?;
        Ok(exchanged.map(TokenResponse::exchangeable))
    }

    /// Applies the On-Behalf-Of exchange when one is configured.
    async fn complete(
        &self,
        activity: &Activity,
        token: TokenResponse,
        exchange_connection: Option<&str>,
        exchange_scopes: &[String],
    ) -> Result<SignInResponse> {
        let Some((connection, scopes)) = self.exchange_parameters(exchange_connection, exchange_scopes)
        else {
            return Ok(SignInResponse::complete(token));
        };
        match self
            .exchange_on_behalf_of(activity, &token, connection, scopes)
            .await?
        {
            Some(exchanged) => Ok(SignInResponse::complete(exchanged)),
            None => Ok(SignInResponse::error(
                "obo_exchange_failed",
                format!("on-behalf-of exchange for connection '{connection}' returned no token"),
            )),
        }
    }

    async fn begin_flow(
        &self,
        context: &TurnContext,
        exchange_connection: Option<&str>,
        exchange_scopes: &[String],
    ) -> Result<SignInResponse> {
        let activity = context.activity();
        let existing = self
            .client
            .get_user_token(
                &activity.from.id,
                &self.settings.connection_name,
                &activity.channel_id,
                None,
            )
            .await?;
        if let Some(token) = existing {
            tracing::debug!(handler = %self.handler_name, "token service already holds a token");
            return self
                .complete(activity, token, exchange_connection, exchange_scopes)
                .await;
        }

        let resource = self
            .client
            .get_sign_in_resource(&self.settings.connection_name, activity)
            .await?;
        let mut card = activity.create_reply(self.settings.text.clone());
        card.attachments.push(Attachment {
            content_type: OAUTH_CARD_CONTENT_TYPE.to_string(),
            content: json!({
                "text": self.settings.text,
                "connectionName": self.settings.connection_name,
                "tokenExchangeResource": resource.token_exchange_resource,
                "buttons": [{
                    "type": "signin",
                    "title": self.settings.title,
                    "value": resource.sign_in_link,
                }],
            }),
        });
        context.send_activity(card).await?;

        let started_unix_ms = current_unix_timestamp_ms();
        let record = FlowRecord {
            started_unix_ms,
            expires_unix_ms: unix_ms_deadline(
                started_unix_ms,
                Duration::from_secs(self.settings.flow_timeout_seconds),
            ),
        };
        write_typed(self.storage.as_ref(), &self.flow_key(activity), &record).await?;
        tracing::debug!(handler = %self.handler_name, "sent sign-in card");
        Ok(SignInResponse::pending())
    }

    async fn continue_flow(
        &self,
        context: &TurnContext,
        exchange_connection: Option<&str>,
        exchange_scopes: &[String],
    ) -> Result<SignInResponse> {
        let activity = context.activity();
        let Some(flow) = self.load_flow(activity).await? else {
            return Ok(SignInResponse::error(
                "flow_not_started",
                "no sign-in flow is active for this user",
            ));
        };
        if is_past_deadline(Some(flow.expires_unix_ms), current_unix_timestamp_ms()) {
            self.clear_flow(activity).await?;
            return Ok(SignInResponse::error(
                "flow_timeout",
                format!(
                    "sign-in flow started at unix ms {} expired",
                    flow.started_unix_ms
                ),
            ));
        }

        let token = if activity.is_message() {
            let Some(code) = magic_code(activity.text.as_deref()) else {
                return Ok(SignInResponse::error(
                    "invalid_activity",
                    "expected a six digit sign-in code",
                ));
            };
            let token = self.redeem_code(activity, code).await?;
            if token.is_none() {
                return Ok(SignInResponse::error(
                    "invalid_magic_code",
                    "the sign-in code was not accepted",
                ));
            }
            token
        } else if activity.is_invoke() && activity.is_named(sign_in_names::VERIFY_STATE) {
            self.verify_state(context).await?
        } else if activity.is_invoke() && activity.is_named(sign_in_names::TOKEN_EXCHANGE) {
            self.exchange_sso_token(context).await?
        } else if activity.is_event() && activity.is_named(sign_in_names::TOKEN_RESPONSE_EVENT) {
            activity
                .value
                .clone()
                .and_then(|value| serde_json::from_value::<TokenResponse>(value).ok())
        } else if activity.is_invoke() && activity.is_named(sign_in_names::FAILURE) {
            context.send_invoke_response(InvokeResponse::ok(None)).await?;
            self.clear_flow(activity).await?;
            let detail = value_str(activity, "message").unwrap_or("channel reported sign-in failure");
            return Ok(SignInResponse::error("sign_in_failure", detail));
        } else {
            return Ok(SignInResponse::error(
                "invalid_activity",
                format!(
                    "'{}' activity cannot continue a sign-in flow",
                    activity.activity_type
                ),
            ));
        };

        let Some(token) = token else {
            let cause = if activity.is_named(sign_in_names::TOKEN_EXCHANGE) {
                "token_exchange_failed"
            } else if activity.is_event() {
                "invalid_token_response"
            } else {
                "invalid_state"
            };
            return Ok(SignInResponse::error(cause, "the token service returned no token"));
        };
        self.clear_flow(activity).await?;
        self.complete(activity, token, exchange_connection, exchange_scopes)
            .await
    }

    async fn redeem_code(&self, activity: &Activity, code: &str) -> Result<Option<TokenResponse>> {
        self.client
            .get_user_token(
                &activity.from.id,
                &self.settings.connection_name,
                &activity.channel_id,
                Some(code),
            )
            .await
    }

    async fn verify_state(&self, context: &TurnContext) -> Result<Option<TokenResponse>> {
        let activity = context.activity();
        let token = match value_str(activity, "state") {
            Some(state) => self.redeem_code(activity, state).await?,
            None => None,
        };
        let response = if token.is_some() {
            InvokeResponse::ok(None)
        } else {
            InvokeResponse::new(
                PRECONDITION_FAILED,
                Some(json!({ "cause": "invalid_state" })),
            )
        };
        context.send_invoke_response(response).await?;
        Ok(token)
    }

    async fn exchange_sso_token(&self, context: &TurnContext) -> Result<Option<TokenResponse>> {
        let activity = context.activity();
        let exchange_id = value_str(activity, "id").unwrap_or_default().to_string();
        let requested_connection = value_str(activity, "connectionName");
        let connection_matches = requested_connection
            .map_or(true, |name| name.eq_ignore_ascii_case(&self.settings.connection_name));
        let token = match value_str(activity, "token") {
            Some(sso_token) if connection_matches => {
                let request = TokenExchangeRequest {
                    uri: None,
                    token: Some(sso_token.to_string()),
                    scopes: Vec::new(),
                };
                self.client
                    .exchange_token(
                        &activity.from.id,
                        &self.settings.connection_name,
                        &activity.channel_id,
                        &request,
                    )
                    .await?
            }
            _ => None,
        };
        let body = json!({
            "id": exchange_id,
            "connectionName": self.settings.connection_name,
        });
        let response = match &token {
            Some(_) => InvokeResponse::ok(Some(body)),
            None => {
                let mut body = body;
                body["failureDetail"] = json!("the token exchange was not accepted");
                InvokeResponse::new(PRECONDITION_FAILED, Some(body))
            }
        };
        context.send_invoke_response(response).await?;
        Ok(token)
    }
}

#[async_trait]
impl UserAuthorizationDriver for OAuthFlowDriver {
    async fn sign_user_in(
        &self,
        context: &TurnContext,
        force_sign_in: bool,
        exchange_connection: Option<&str>,
        exchange_scopes: &[String],
    ) -> Result<SignInResponse> {
        if force_sign_in {
            self.begin_flow(context, exchange_connection, exchange_scopes)
                .await
        } else {
            self.continue_flow(context, exchange_connection, exchange_scopes)
                .await
        }
    }

    async fn get_refreshed_user_token(
        &self,
        context: &TurnContext,
        exchange_connection: Option<&str>,
        exchange_scopes: &[String],
    ) -> Result<Option<TokenResponse>> {
        let activity = context.activity();
        let Some(token) = self
            .client
            .get_user_token(
                &activity.from.id,
                &self.settings.connection_name,
                &activity.channel_id,
                None,
            )
            .await?
        else {
            return Ok(None);
        };
        match self.exchange_parameters(exchange_connection, exchange_scopes) {
            Some((connection, scopes)) => {
                self.exchange_on_behalf_of(activity, &token, connection, scopes)
                    .await
            }
            None => Ok(Some(token)),
        }
    }

    async fn reset_state(&self, context: &TurnContext) -> Result<()> {
        self.clear_flow(context.activity()).await
    }

    async fn sign_out(&self, context: &TurnContext) -> Result<()> {
        let activity = context.activity();
        self.clear_flow(activity).await?;
        self.client
            .sign_out_user(
                &activity.from.id,
                &self.settings.connection_name,
                &activity.channel_id,
            )
            .await
    }
}

/// One [`OAuthFlowDriver`] per configured handler, sharing `client` and `storage`.
pub fn oauth_flow_drivers(
    settings: &AuthorizationSettings,
    client: Arc<dyn UserTokenClient>,
    storage: Arc<dyn Storage>,
) -> BTreeMap<String, Arc<dyn UserAuthorizationDriver>> {
    settings
        .handlers
        .iter()
        .map(|(name, handler)| {
            let driver: Arc<dyn UserAuthorizationDriver> = Arc::new(OAuthFlowDriver::new(
                name.clone(),
                handler.clone(),
                Arc::clone(&client),
                Arc::clone(&storage),
            ));
            (name.clone(), driver)
        })
        .collect()
}
