//! Route model: selector, handler, flags, rank and required sign-in handlers.
//!
//! A [`Route`] is built once from a plain [`RouteSpec`] and never mutated.
//! Channel and agentic restrictions are checked before the route-specific
//! selector runs.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use turnstile_activity::{Activity, TurnContext};

use crate::turn_state::TurnState;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Side-effect-free predicate deciding whether a route handles the turn.
pub type RouteSelector = Arc<dyn Fn(Arc<TurnContext>) -> BoxFuture<Result<bool>> + Send + Sync>;

/// Action run when a route matches.
pub type RouteHandler =
    Arc<dyn Fn(Arc<TurnContext>, TurnState) -> BoxFuture<Result<()>> + Send + Sync>;

/// Ordered sign-in handler names a route needs before its handler may run.
pub type OAuthHandlerNames = Arc<dyn Fn(&TurnContext) -> Vec<String> + Send + Sync>;

/// Wraps an async closure as a [`RouteSelector`].
pub fn selector<F, Fut>(predicate: F) -> RouteSelector
where
    F: Fn(Arc<TurnContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    Arc::new(move |context| Box::pin(predicate(context)))
}

/// Wraps a synchronous activity predicate as a [`RouteSelector`].
pub fn activity_selector<F>(predicate: F) -> RouteSelector
where
    F: Fn(&Activity) -> bool + Send + Sync + 'static,
{
    Arc::new(move |context| {
        let matched = predicate(context.activity());
        Box::pin(async move { Ok(matched) })
    })
}

/// Wraps an async closure as a [`RouteHandler`].
pub fn handler<F, Fut>(action: F) -> RouteHandler
where
    F: Fn(Arc<TurnContext>, TurnState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |context, state| Box::pin(action(context, state)))
}

/// Fixed list of sign-in handler names, independent of the turn.
pub fn oauth_handlers<I, S>(names: I) -> OAuthHandlerNames
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let names = names.into_iter().map(Into::into).collect::<Vec<String>>();
    Arc::new(move |_| names.clone())
}

fn no_oauth_handlers() -> OAuthHandlerNames {
    Arc::new(|_| Vec::new())
}

/// Enumerates supported `RouteError` values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("route registry disposed")]
    RegistryDisposed,
    #[error("invoke routes cannot be non-terminal")]
    NonTerminalInvoke,
    #[error("route channel restriction must not be blank")]
    BlankChannel,
    #[error("invalid message pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Evaluation order among routes of the same priority class; lower runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RouteRank(pub u16);

impl RouteRank {
    pub const FIRST: RouteRank = RouteRank(0);
    pub const LAST: RouteRank = RouteRank(u16::MAX - 1);
    pub const UNSPECIFIED: RouteRank = RouteRank(u16::MAX);
}

impl Default for RouteRank {
    fn default() -> Self {
        Self::UNSPECIFIED
    }
}

/// Independent route markers; any combination is valid except non-terminal invoke.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RouteFlags {
    pub agentic: bool,
    pub invoke: bool,
    pub non_terminal: bool,
}

impl RouteFlags {
    pub const NONE: RouteFlags = RouteFlags {
        agentic: false,
        invoke: false,
        non_terminal: false,
    };

    pub fn invoke() -> Self {
        Self {
            invoke: true,
            ..Self::NONE
        }
    }

    pub fn agentic() -> Self {
        Self {
            agentic: true,
            ..Self::NONE
        }
    }

    pub fn non_terminal() -> Self {
        Self {
            non_terminal: true,
            ..Self::NONE
        }
    }

    /// Agentic+Invoke = 0, Invoke = 1, Agentic = 2, plain = 3.
    pub fn priority_class(self) -> u8 {
        match (self.agentic, self.invoke) {
            (true, true) => 0,
            (false, true) => 1,
            (true, false) => 2,
            (false, false) => 3,
        }
    }
}

/// Plain data describing a route before validation.
#[derive(Clone)]
pub struct RouteSpec {
    pub selector: RouteSelector,
    pub handler: RouteHandler,
    pub flags: RouteFlags,
    pub rank: RouteRank,
    pub channel_id: Option<String>,
    pub oauth_handlers: OAuthHandlerNames,
}

impl RouteSpec {
    pub fn new(selector: RouteSelector, handler: RouteHandler) -> Self {
        Self {
            selector,
            handler,
            flags: RouteFlags::NONE,
            rank: RouteRank::UNSPECIFIED,
            channel_id: None,
            oauth_handlers: no_oauth_handlers(),
        }
    }
}

/// Public struct `Route` used across turnstile components.
pub struct Route {
    selector: RouteSelector,
    handler: RouteHandler,
    flags: RouteFlags,
    rank: RouteRank,
    channel_id: Option<String>,
    oauth_handlers: OAuthHandlerNames,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("flags", &self.flags)
            .field("rank", &self.rank)
            .field("channel_id", &self.channel_id)
            .finish_non_exhaustive()
    }
}

impl Route {
    pub fn build(spec: RouteSpec) -> Result<Self, RouteError> {
        if spec.flags.invoke && spec.flags.non_terminal {
            return Err(RouteError::NonTerminalInvoke);
        }
        let channel_id = match spec.channel_id {
            Some(channel) if channel.trim().is_empty() => return Err(RouteError::BlankChannel),
            Some(channel) => Some(channel.trim().to_string()),
            None => None,
        };
        Ok(Self {
            selector: spec.selector,
            handler: spec.handler,
            flags: spec.flags,
            rank: spec.rank,
            channel_id,
            oauth_handlers: spec.oauth_handlers,
        })
    }

    pub fn flags(&self) -> RouteFlags {
        self.flags
    }

    pub fn rank(&self) -> RouteRank {
        self.rank
    }

    pub fn channel_id(&self) -> Option<&str> {
        self.channel_id.as_deref()
    }

    pub(crate) fn order_key(&self) -> (u8, RouteRank) {
        (self.flags.priority_class(), self.rank)
    }

    pub fn oauth_handler_names(&self, context: &TurnContext) -> Vec<String> {
        (self.oauth_handlers)(context)
    }

    /// Channel and agentic restrictions first, then the route's own selector.
    pub async fn matches(&self, context: Arc<TurnContext>) -> Result<bool> {
        if !self.restrictions_allow(context.activity()) {
            return Ok(false);
        }
        (self.selector)(context).await
    }

    pub async fn run(&self, context: Arc<TurnContext>, state: TurnState) -> Result<()> {
        (self.handler)(context, state).await
    }

    fn restrictions_allow(&self, activity: &Activity) -> bool {
        if let Some(channel) = self.channel_id.as_deref() {
            if !activity.channel_id.eq_ignore_ascii_case(channel) {
                return false;
            }
        }
        !(self.flags.agentic && !activity.is_agentic_request())
    }
}
