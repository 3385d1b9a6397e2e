//! Authorization engine: the resumable sign-in state machine that gates route
//! dispatch.
//!
//! Per (conversation, recipient) pair the engine is Idle, Pending, or moves
//! through Complete/Error within a single call. Pending and Error always stop
//! the turn. Complete lets the turn proceed unless the flow was started by a
//! different activity; that banked activity is then replayed through the
//! [`ContinuationBridge`] and the current turn stops.
//!
//! Flow outcomes are handled here and never surface as errors. Only
//! configuration errors, cancellation, storage failures and the token
//! refresh invariant are returned to callers.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use turnstile_activity::TurnContext;
use turnstile_core::{current_unix_timestamp_ms, Cancelled};
use turnstile_storage::{Storage, StorageError};

use crate::continuation::{ContinuationBridge, ContinuationError};
use crate::oauth_flow::{oauth_flow_drivers, UserTokenClient};
use crate::route::BoxFuture;
use crate::settings::AuthorizationSettings;
use crate::turn_state::TurnState;

pub mod driver;
mod failure;
pub mod sign_in_state;
mod token_cache;

#[cfg(test)]
mod tests;

pub use driver::{SignInResponse, SignInStatus, TokenResponse, UserAuthorizationDriver};
pub use failure::{SignInFailure, SignInFailureBody, DEFAULT_SIGN_IN_FAILURE_MESSAGE};
pub use sign_in_state::{sign_in_state_key, SignInState};
pub use token_cache::TOKEN_REFRESH_MARGIN_MINUTES;

use sign_in_state::SignInStateStore;
use token_cache::{token_cache_key, CachedToken, TokenCache};

/// Failure detail reported when a driver call itself fails; the error chain is only logged.
pub const DRIVER_ERROR_DETAIL: &str = "the sign-in provider could not complete the request";

/// Enumerates supported `AuthorizationError` values.
#[derive(Debug, Error)]
pub enum AuthorizationError {
    #[error("no sign-in handlers configured")]
    NoHandlersConfigured,
    #[error("default sign-in handler '{0}' is not registered")]
    DefaultHandlerMissing(String),
    #[error("sign-in handler '{0}' is not registered")]
    UnknownHandler(String),
    #[error("activity is missing a conversation id or recipient id")]
    MissingConversationReference,
    #[error(
        "handler '{0}' has a cached token but refresh returned none; sign-in state is inconsistent"
    )]
    TokenRefreshMissing(String),
    #[error("sign-in operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Continuation(#[from] ContinuationError),
    #[error("sign-in handler '{handler}' failed: {source:#}")]
    Driver {
        handler: String,
        source: anyhow::Error,
    },
    #[error("failed to deliver sign-in response: {0:#}")]
    Send(anyhow::Error),
    #[error("sign-in callback failed: {0:#}")]
    Callback(anyhow::Error),
}

impl From<Cancelled> for AuthorizationError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

pub type AutoSignInPredicate = Arc<dyn Fn(&TurnContext) -> bool + Send + Sync>;

/// Called instead of the default failure response when registered.
///
/// The callback owns the whole user-visible failure, invoke responses included.
pub type SignInFailureHandler =
    Arc<dyn Fn(Arc<TurnContext>, TurnState, SignInFailure) -> BoxFuture<anyhow::Result<()>> + Send + Sync>;

/// Called after a flow completes, before routing resumes.
pub type SignInSuccessHandler =
    Arc<dyn Fn(Arc<TurnContext>, TurnState, String) -> BoxFuture<anyhow::Result<()>> + Send + Sync>;

pub type FailureMessageFormatter = Arc<dyn Fn(&str, &SignInResponse) -> String + Send + Sync>;

/// Wraps an async closure as a [`SignInFailureHandler`].
pub fn failure_handler<F, Fut>(callback: F) -> SignInFailureHandler
where
    F: Fn(Arc<TurnContext>, TurnState, SignInFailure) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |context, state, failure| Box::pin(callback(context, state, failure)))
}

/// Wraps an async closure as a [`SignInSuccessHandler`].
pub fn success_handler<F, Fut>(callback: F) -> SignInSuccessHandler
where
    F: Fn(Arc<TurnContext>, TurnState, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |context, state, handler_name| Box::pin(callback(context, state, handler_name)))
}

/// Whether a turn without an active flow should start one.
#[derive(Clone)]
pub enum AutoSignIn {
    Always,
    Never,
    Predicate(AutoSignInPredicate),
}

impl AutoSignIn {
    fn should_start(&self, context: &TurnContext) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::Predicate(predicate) => predicate(context),
        }
    }
}

/// Public struct `UserAuthorizationOptions` used across turnstile components.
#[derive(Clone)]
pub struct UserAuthorizationOptions {
    pub default_handler_name: Option<String>,
    pub auto_sign_in: AutoSignIn,
    pub pending_flow_ttl: Option<Duration>,
    pub failure_message: Option<FailureMessageFormatter>,
    pub on_sign_in_failure: Option<SignInFailureHandler>,
    pub on_sign_in_success: Option<SignInSuccessHandler>,
}

impl Default for UserAuthorizationOptions {
    fn default() -> Self {
        Self {
            default_handler_name: None,
            auto_sign_in: AutoSignIn::Always,
            pending_flow_ttl: Some(Duration::from_secs(
                crate::settings::DEFAULT_PENDING_FLOW_TTL_SECONDS,
            )),
            failure_message: None,
            on_sign_in_failure: None,
            on_sign_in_success: None,
        }
    }
}

impl UserAuthorizationOptions {
    pub fn from_settings(settings: &AuthorizationSettings) -> Self {
        let failure_message = settings.sign_in_failure_message.clone().map(|template| {
            let formatter: FailureMessageFormatter = Arc::new(move |handler: &str, response: &SignInResponse| {
                template
                    .replace("{handler}", handler)
                    .replace("{cause}", response.cause_or_unknown())
            });
            formatter
        });
        Self {
            default_handler_name: settings
                .resolved_default_handler_name()
                .map(str::to_string),
            auto_sign_in: if settings.auto_sign_in {
                AutoSignIn::Always
            } else {
                AutoSignIn::Never
            },
            pending_flow_ttl: (settings.pending_flow_ttl_seconds > 0)
                .then(|| Duration::from_secs(settings.pending_flow_ttl_seconds)),
            failure_message,
            on_sign_in_failure: None,
            on_sign_in_success: None,
        }
    }
}

/// Parameters of one `ensure_signed_in` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignInRequest {
    pub handler_name: Option<String>,
    pub force_auto: bool,
    pub exchange_connection: Option<String>,
    pub exchange_scopes: Vec<String>,
}

impl SignInRequest {
    pub fn new(handler_name: Option<&str>, force_auto: bool) -> Self {
        Self {
            handler_name: handler_name.map(str::to_string),
            force_auto,
            ..Self::default()
        }
    }
}

/// Public struct `UserAuthorization` used across turnstile components.
pub struct UserAuthorization {
    drivers: BTreeMap<String, Arc<dyn UserAuthorizationDriver>>,
    default_handler_name: String,
    storage: Arc<dyn Storage>,
    continuation: Arc<dyn ContinuationBridge>,
    options: UserAuthorizationOptions,
    token_cache: TokenCache,
}

impl UserAuthorization {
    /// Fails when no drivers are given or the default handler is unknown.
    pub fn new(
        storage: Arc<dyn Storage>,
        drivers: BTreeMap<String, Arc<dyn UserAuthorizationDriver>>,
        continuation: Arc<dyn ContinuationBridge>,
        options: UserAuthorizationOptions,
    ) -> Result<Self, AuthorizationError> {
        let default_handler_name = match options.default_handler_name.as_deref() {
            Some(name) if drivers.contains_key(name) => name.to_string(),
            Some(name) => return Err(AuthorizationError::DefaultHandlerMissing(name.to_string())),
            None => drivers
                .keys()
                .next()
                .cloned()
                .ok_or(AuthorizationError::NoHandlersConfigured)?,
        };
        Ok(Self {
            drivers,
            default_handler_name,
            storage,
            continuation,
            options,
            token_cache: TokenCache::default(),
        })
    }

    /// Builds an engine with one [`crate::oauth_flow::OAuthFlowDriver`] per configured handler.
    pub fn from_settings(
        storage: Arc<dyn Storage>,
        settings: &AuthorizationSettings,
        client: Arc<dyn UserTokenClient>,
        continuation: Arc<dyn ContinuationBridge>,
    ) -> Result<Self, AuthorizationError> {
        let drivers = oauth_flow_drivers(settings, client, Arc::clone(&storage));
        Self::new(
            storage,
            drivers,
            continuation,
            UserAuthorizationOptions::from_settings(settings),
        )
    }

    pub fn default_handler_name(&self) -> &str {
        &self.default_handler_name
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.drivers.keys().cloned().collect()
    }

    pub fn has_handler(&self, handler_name: &str) -> bool {
        self.drivers.contains_key(handler_name)
    }

    fn driver(
        &self,
        handler_name: &str,
    ) -> Result<&Arc<dyn UserAuthorizationDriver>, AuthorizationError> {
        self.drivers
            .get(handler_name)
            .ok_or_else(|| AuthorizationError::UnknownHandler(handler_name.to_string()))
    }

    /// Returns `true` when normal route handling may proceed this turn.
    ///
    /// `false` means the caller must stop; any response has already been sent.
    pub async fn ensure_signed_in(
        &self,
        context: &Arc<TurnContext>,
        turn_state: &TurnState,
        handler_name: Option<&str>,
        force_auto: bool,
    ) -> Result<bool, AuthorizationError> {
        self.ensure_signed_in_with(
            context,
            turn_state,
            SignInRequest::new(handler_name, force_auto),
        )
        .await
    }

    #[tracing::instrument(
        name = "turnstile.user_authorization.ensure_signed_in",
        skip_all,
        fields(
            conversation_id = %context.activity().conversation.id,
            activity_type = %context.activity().activity_type,
            requested_handler = request.handler_name.as_deref().unwrap_or_default(),
            force_auto = request.force_auto
        )
    )]
    pub async fn ensure_signed_in_with(
        &self,
        context: &Arc<TurnContext>,
        turn_state: &TurnState,
        request: SignInRequest,
    ) -> Result<bool, AuthorizationError> {
        let cancellation = context.cancellation();
        let activity = context.activity();
        let key = sign_in_state_key(activity)?;
        let store = SignInStateStore::new(self.storage.as_ref(), cancellation);
        let mut state = store
            .load(&key, self.options.pending_flow_ttl, current_unix_timestamp_ms())
            .await?;
        let continuation = state.is_active();

        let auto_start = request.force_auto || self.options.auto_sign_in.should_start(context);
        if !auto_start && !continuation {
            if activity.is_oauth_invoke() {
                tracing::warn!(
                    invoke_name = activity.name.as_deref().unwrap_or_default(),
                    "sign-in invoke received without an active flow"
                );
                self.reject_out_of_band_invoke(context).await?;
                return Ok(false);
            }
            return Ok(true);
        }

        let handler_name = state
            .active_handler_name
            .clone()
            .or(request.handler_name)
            .unwrap_or_else(|| self.default_handler_name.clone());
        let driver = self.driver(&handler_name)?;
        let (exchange_connection, exchange_scopes) = if continuation {
            (
                state.exchange_connection_name.clone(),
                state.exchange_scopes.clone(),
            )
        } else {
            (request.exchange_connection, request.exchange_scopes)
        };

        let response = match cancellation
            .run(driver.sign_user_in(
                context,
                !continuation,
                exchange_connection.as_deref(),
                &exchange_scopes,
            ))
            .await?
        {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(handler = %handler_name, "sign-in driver failed: {error:#}");
                SignInResponse::error("driver_error", DRIVER_ERROR_DETAIL)
            }
        };
        let response = match (response.status, response.token.is_some()) {
            (SignInStatus::Complete, false) => {
                SignInResponse::error("missing_token", "sign-in completed without a token")
            }
            _ => response,
        };

        match response.status {
            SignInStatus::Pending => {
                if !continuation {
                    state.active_handler_name = Some(handler_name.clone());
                    state.continuation_activity = Some(activity.clone());
                    state.exchange_connection_name = exchange_connection;
                    state.exchange_scopes = exchange_scopes;
                    state.started_unix_ms = Some(current_unix_timestamp_ms());
                    store.save(&key, &state).await?;
                }
                tracing::debug!(handler = %handler_name, continuation, "sign-in pending");
                Ok(false)
            }
            SignInStatus::Error => {
                tracing::warn!(
                    handler = %handler_name,
                    cause = response.cause_or_unknown(),
                    "sign-in flow failed"
                );
                if let Err(error) = cancellation.run(driver.reset_state(context)).await? {
                    tracing::warn!(handler = %handler_name, "driver reset failed: {error:#}");
                }
                store.delete(&key).await?;
                cancellation.run(turn_state.save(self.storage.as_ref())).await??;
                self.report_failure(
                    context,
                    turn_state,
                    &handler_name,
                    response,
                    state.continuation_activity,
                )
                .await?;
                Ok(false)
            }
            SignInStatus::Complete => {
                let Some(token) = response.token else {
                    return Ok(false);
                };
                let banked = state
                    .continuation_activity
                    .take()
                    .filter(|banked| !banked.same_activity(activity));
                if banked.is_some() {
                    cancellation.run(turn_state.save(self.storage.as_ref())).await??;
                }
                // Deleting the record commits the transition; nothing after it is cancelled.
                store.delete(&key).await?;
                self.token_cache.insert(
                    &token_cache_key(activity, &handler_name),
                    CachedToken {
                        token,
                        exchange_connection,
                        exchange_scopes,
                    },
                );
                tracing::info!(handler = %handler_name, continuation, "sign-in complete");

                let callback = match &self.options.on_sign_in_success {
                    Some(on_success) => {
                        on_success(Arc::clone(context), turn_state.clone(), handler_name.clone())
                            .await
                            .map_err(AuthorizationError::Callback)
                    }
                    None => Ok(()),
                };

                let Some(banked) = banked else {
                    callback?;
                    return Ok(true);
                };
                let audience = context
                    .identity()
                    .and_then(|identity| identity.audience())
                    .map(str::to_string);
                self.continuation
                    .resume(context.identity().cloned(), banked, audience)
                    .await?;
                tracing::debug!(handler = %handler_name, "banked activity handed to continuation");
                callback?;
                Ok(false)
            }
        }
    }

    /// Current token for `handler_name`, refreshing through the driver when needed.
    ///
    /// `None` means the handler never completed sign-in in this engine.
    pub async fn get_token(
        &self,
        context: &TurnContext,
        handler_name: &str,
    ) -> Result<Option<String>, AuthorizationError> {
        let cache_key = token_cache_key(context.activity(), handler_name);
        let Some(entry) = self.token_cache.get(&cache_key) else {
            return Ok(None);
        };
        if !context.activity().is_agentic_request() && entry.is_reusable_at(Utc::now()) {
            return Ok(Some(entry.token.token));
        }

        let driver = self.driver(handler_name)?;
        let refreshed = context
            .cancellation()
            .run(driver.get_refreshed_user_token(
                context,
                entry.exchange_connection.as_deref(),
                &entry.exchange_scopes,
            ))
            .await?
            .map_err(|source| AuthorizationError::Driver {
                handler: handler_name.to_string(),
                source,
            })?;
        let Some(token) = refreshed else {
            tracing::error!(handler = handler_name, "token refresh returned none for a signed-in handler");
            return Err(AuthorizationError::TokenRefreshMissing(
                handler_name.to_string(),
            ));
        };
        let value = token.token.clone();
        if !entry.token.is_exchangeable && !token.is_exchangeable {
            self.token_cache.refresh(&cache_key, token);
        }
        Ok(Some(value))
    }

    /// Forces an On-Behalf-Of exchange for a signed-in handler. Never cached.
    pub async fn exchange_token(
        &self,
        context: &TurnContext,
        handler_name: &str,
        exchange_connection: &str,
        exchange_scopes: &[String],
    ) -> Result<Option<String>, AuthorizationError> {
        if self
            .token_cache
            .get(&token_cache_key(context.activity(), handler_name))
            .is_none()
        {
            return Ok(None);
        }
        let driver = self.driver(handler_name)?;
        let exchanged = context
            .cancellation()
            .run(driver.get_refreshed_user_token(
                context,
                Some(exchange_connection),
                exchange_scopes,
            ))
            .await?
            .map_err(|source| AuthorizationError::Driver {
                handler: handler_name.to_string(),
                source,
            })?;
        exchanged
            .map(|token| token.token)
            .map(Some)
            .ok_or_else(|| AuthorizationError::TokenRefreshMissing(handler_name.to_string()))
    }

    /// Signs out one handler, or every handler when `handler_name` is `None`.
    ///
    /// Signing out a handler that is not signed in is not an error.
    pub async fn sign_out(
        &self,
        context: &TurnContext,
        handler_name: Option<&str>,
    ) -> Result<(), AuthorizationError> {
        let handler_names = match handler_name {
            Some(name) => {
                self.driver(name)?;
                vec![name.to_string()]
            }
            None => self.handler_names(),
        };
        let cancellation = context.cancellation();
        let key = sign_in_state_key(context.activity())?;
        SignInStateStore::new(self.storage.as_ref(), cancellation)
            .delete(&key)
            .await?;
        for name in handler_names {
            self.token_cache
                .remove(&token_cache_key(context.activity(), &name));
            let driver = self.driver(&name)?;
            cancellation
                .run(driver.sign_out(context))
                .await?
                .map_err(|source| AuthorizationError::Driver {
                    handler: name.clone(),
                    source,
                })?;
            tracing::info!(handler = %name, "signed out");
        }
        Ok(())
    }
}
