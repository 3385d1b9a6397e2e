//! Route dispatch and resumable user sign-in for turnstile agents.
//!
//! An [`AgentApplication`] holds a priority-ordered [`RouteRegistry`] and an
//! optional [`UserAuthorization`] engine. Each turn is gated on sign-in before
//! the matching routes run; flows that complete on a later turn hand the
//! original activity to a [`ContinuationBridge`] for replay.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use turnstile_app::{handler, route_selectors, AgentApplication, RouteSpec};
//! use turnstile_storage::MemoryStorage;
//!
//! let app = AgentApplication::new(Arc::new(MemoryStorage::new()));
//! app.add_route(RouteSpec::new(
//!     route_selectors::message_text("ping"),
//!     handler(|context, _state| async move { context.send_text("pong").await }),
//! ))
//! .expect("route");
//! assert_eq!(app.routes().len(), 1);
//! ```

pub mod application;
pub mod continuation;
pub mod oauth_flow;
pub mod route;
pub mod route_registry;
pub mod route_selectors;
pub mod settings;
pub mod turn_state;
pub mod user_authorization;

pub use application::{turn_hook, AgentApplication, ApplicationError, TurnHook};
pub use continuation::{
    continuation_channel, ContinuationBridge, ContinuationError, ContinuationReceiver,
    QueuedContinuationBridge, ResumedTurn,
};
pub use oauth_flow::{
    oauth_flow_drivers, InMemoryUserTokenClient, OAuthFlowDriver, SignInResource,
    TokenExchangeRequest, UserTokenClient, OAUTH_CARD_CONTENT_TYPE,
};
pub use route::{
    activity_selector, handler, oauth_handlers, selector, BoxFuture, OAuthHandlerNames, Route,
    RouteError, RouteFlags, RouteHandler, RouteRank, RouteSelector, RouteSpec,
};
pub use route_registry::{RouteRegistry, RouteSnapshot};
pub use settings::{
    load_authorization_settings, parse_authorization_settings, AuthorizationSettings,
    HandlerSettings,
};
pub use turn_state::{StateScope, TurnState};
pub use user_authorization::{
    failure_handler, success_handler, AuthorizationError, AutoSignIn, SignInFailure,
    SignInRequest, SignInResponse, SignInState, SignInStatus, TokenResponse, UserAuthorization,
    UserAuthorizationDriver, UserAuthorizationOptions,
};
