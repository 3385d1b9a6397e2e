//! Turn dispatch host: loads turn state, runs hooks, gates on sign-in and
//! walks the route snapshot.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use thiserror::Error;
use turnstile_activity::{ActivitySender, InvokeResponse, TurnContext};
use turnstile_core::Cancelled;
use turnstile_storage::{Storage, StorageError};

use crate::continuation::{ContinuationReceiver, ResumedTurn};
use crate::route::{BoxFuture, Route, RouteError, RouteFlags, RouteHandler, RouteSpec};
use crate::route_registry::RouteRegistry;
use crate::route_selectors;
use crate::turn_state::TurnState;
use crate::user_authorization::{AuthorizationError, UserAuthorization};


/// Runs before or after routing. Returning `false` from a before-turn hook ends the turn.
pub type TurnHook = Arc<dyn Fn(Arc<TurnContext>, TurnState) -> BoxFuture<Result<bool>> + Send + Sync>;

/// Wraps an async closure as a [`TurnHook`].
pub fn turn_hook<F, Fut>(hook: F) -> TurnHook
where
    F: Fn(Arc<TurnContext>, TurnState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    Arc::new(move |context, state| Box::pin(hook(context, state)))
}

/// Enumerates supported `ApplicationError` values.
#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("route requires sign-in handler '{0}' but no authorization is configured")]
    AuthorizationNotConfigured(String),
    #[error("turn cancelled")]
    Cancelled,
    #[error("route selector failed: {0:#}")]
    Selector(anyhow::Error),
    #[error("route handler failed: {0:#}")]
    Handler(anyhow::Error),
    #[error("turn hook failed: {0:#}")]
    Hook(anyhow::Error),
    #[error("failed to send response: {0:#}")]
    Send(anyhow::Error),
}

impl From<Cancelled> for ApplicationError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

/// Public struct `AgentApplication` used across turnstile components.
pub struct AgentApplication {
    routes: RouteRegistry,
    storage: Arc<dyn Storage>,
    authorization: Option<Arc<UserAuthorization>>,
    before_turn: RwLock<Vec<TurnHook>>,
    after_turn: RwLock<Vec<TurnHook>>,
}

impl AgentApplication {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            routes: RouteRegistry::new(),
            storage,
            authorization: None,
            before_turn: RwLock::new(Vec::new()),
            after_turn: RwLock::new(Vec::new()),
        }
    }

    pub fn with_authorization(mut self, authorization: Arc<UserAuthorization>) -> Self {
        self.authorization = Some(authorization);
        self
    }

    pub fn authorization(&self) -> Option<&Arc<UserAuthorization>> {
        self.authorization.as_ref()
    }

    pub fn routes(&self) -> &RouteRegistry {
        &self.routes
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.storage)
    }

    pub fn add_route(&self, spec: RouteSpec) -> Result<(), RouteError> {
        self.routes.add(Route::build(spec)?)
    }

    pub fn on_activity(
        &self,
        activity_type: impl Into<String>,
        handler: RouteHandler,
    ) -> Result<(), RouteError> {
        self.add_route(RouteSpec::new(
            route_selectors::activity_type(activity_type),
            handler,
        ))
    }

    /// Message route matching `text` exactly, ignoring case.
    pub fn on_message(&self, text: impl Into<String>, handler: RouteHandler) -> Result<(), RouteError> {
        self.add_route(RouteSpec::new(route_selectors::message_text(text), handler))
    }

    pub fn on_message_pattern(&self, pattern: &str, handler: RouteHandler) -> Result<(), RouteError> {
        self.add_route(RouteSpec::new(route_selectors::message_regex(pattern)?, handler))
    }

    pub fn on_invoke(&self, name: impl Into<String>, handler: RouteHandler) -> Result<(), RouteError> {
        let mut spec = RouteSpec::new(route_selectors::invoke_name(name), handler);
        spec.flags = RouteFlags::invoke();
        self.add_route(spec)
    }

    pub fn before_turn(&self, hook: TurnHook) {
        self.before_turn
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    pub fn after_turn(&self, hook: TurnHook) {
        self.after_turn
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    /// Closes the route registry; later turns fail with [`RouteError::RegistryDisposed`].
    pub fn dispose(&self) {
        self.routes.dispose();
    }

    fn hooks(hooks: &RwLock<Vec<TurnHook>>) -> Vec<TurnHook> {
        hooks.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn run_hooks(
        hooks: Vec<TurnHook>,
        context: &Arc<TurnContext>,
        turn_state: &TurnState,
    ) -> Result<bool, ApplicationError> {
        for hook in hooks {
            let proceed = hook(Arc::clone(context), turn_state.clone())
                .await
                .map_err(ApplicationError::Hook)?;
            if !proceed {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Processes one inbound activity.
    #[tracing::instrument(
        name = "turnstile.application.on_turn",
        skip_all,
        fields(
            conversation_id = %context.activity().conversation.id,
            activity_type = %context.activity().activity_type
        )
    )]
    pub async fn on_turn(&self, context: Arc<TurnContext>) -> Result<(), ApplicationError> {
        let cancellation = context.cancellation();
        let turn_state = cancellation
            .run(TurnState::load(&context, self.storage.as_ref()))
            .await??;

        if !Self::run_hooks(Self::hooks(&self.before_turn), &context, &turn_state).await? {
            tracing::debug!("before-turn hook ended the turn");
            return Ok(());
        }

        if let Some(authorization) = &self.authorization {
            if !authorization
                .ensure_signed_in(&context, &turn_state, None, false)
                .await?
            {
                tracing::debug!("sign-in gate ended the turn");
                return Ok(());
            }
        }

        let snapshot = self.routes.snapshot()?;
        let mut matched = false;
        for (position, route) in snapshot.iter().enumerate() {
            cancellation.check()?;
            if !route
                .matches(Arc::clone(&context))
                .await
                .map_err(ApplicationError::Selector)?
            {
                continue;
            }
            matched = true;
            for handler_name in route.oauth_handler_names(&context) {
                let authorization = self.authorization.as_ref().ok_or_else(|| {
                    ApplicationError::AuthorizationNotConfigured(handler_name.clone())
                })?;
                if !authorization
                    .ensure_signed_in(&context, &turn_state, Some(&handler_name), true)
                    .await?
                {
                    tracing::debug!(handler = %handler_name, position, "route sign-in ended the turn");
                    return Ok(());
                }
            }
            tracing::debug!(position, flags = ?route.flags(), "dispatching route");
            route
                .run(Arc::clone(&context), turn_state.clone())
                .await
                .map_err(ApplicationError::Handler)?;
            if !route.flags().non_terminal {
                break;
            }
        }

        let activity = context.activity();
        if activity.is_invoke() && !matched && !context.invoke_response_sent() {
            tracing::debug!(
                invoke_name = activity.name.as_deref().unwrap_or_default(),
                "no route matched invoke"
            );
            context
                .send_invoke_response(InvokeResponse::not_implemented())
                .await
                .map_err(ApplicationError::Send)?;
        }

        Self::run_hooks(Self::hooks(&self.after_turn), &context, &turn_state).await?;
        cancellation
            .run(turn_state.save(self.storage.as_ref()))
            .await??;
        Ok(())
    }

    /// Re-enters turn processing for an activity handed over by the continuation bridge.
    pub async fn resume(
        &self,
        turn: ResumedTurn,
        sender: Arc<dyn ActivitySender>,
    ) -> Result<(), ApplicationError> {
        let mut context = TurnContext::new(turn.activity, sender);
        if let Some(identity) = turn.identity {
            context = context.with_identity(identity);
        }
        tracing::debug!(
            audience = turn.audience.as_deref().unwrap_or_default(),
            "resuming banked activity"
        );
        self.on_turn(Arc::new(context)).await
    }

    /// Processes every continuation currently queued; returns how many ran.
    pub async fn drain_continuations(
        &self,
        receiver: &mut ContinuationReceiver,
        sender: Arc<dyn ActivitySender>,
    ) -> Result<usize, ApplicationError> {
        let mut processed = 0;
        while let Some(turn) = receiver.try_recv() {
            self.resume(turn, Arc::clone(&sender)).await?;
            processed += 1;
        }
        Ok(processed)
    }
}
