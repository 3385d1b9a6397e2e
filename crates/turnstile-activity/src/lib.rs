//! Activity protocol types and the per-turn context for turnstile agents.
//!
//! An [`Activity`] is one inbound or outbound protocol unit. A [`TurnContext`]
//! wraps the inbound activity for the duration of one turn and owns the
//! outbound path (messages and invoke responses) plus the turn's cancellation
//! token.
//!
//! ```rust
//! use turnstile_activity::{Activity, ChannelAccount};
//!
//! let activity = Activity::message("msteams", "conv-1", "hello")
//!     .with_id("a-1")
//!     .with_from(ChannelAccount::user("user-1"))
//!     .with_recipient(ChannelAccount::agentic_user("agent-1"));
//!
//! assert!(activity.is_agentic_request());
//! assert!(!activity.is_invoke());
//! ```

pub mod activity;
pub mod identity;
pub mod invoke;
pub mod turn_context;

pub use activity::*;
pub use identity::*;
pub use invoke::*;
pub use turn_context::*;
