//! Low-level helpers shared by every turnstile crate: the per-turn
//! cancellation token, deadline arithmetic in Unix milliseconds, and atomic
//! text replacement for file-backed state.

pub mod atomic_io;
pub mod cancellation;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use cancellation::{Cancelled, CooperativeCancellationToken};
pub use time_utils::{
    current_unix_timestamp_ms, duration_ms, is_past_deadline, unix_ms_deadline,
};
