//! Engine-lifetime token cache keyed by handler name and signed-in user.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use turnstile_activity::Activity;

use super::driver::TokenResponse;

/// Tokens closer than this to expiry are refreshed instead of reused.
pub const TOKEN_REFRESH_MARGIN_MINUTES: i64 = 5;

/// `{handler}/{channelId}/{userId}`; one engine serves many users.
pub(crate) fn token_cache_key(activity: &Activity, handler_name: &str) -> String {
    format!(
        "{handler_name}/{}/{}",
        activity.channel_id, activity.from.id
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CachedToken {
    pub(crate) token: TokenResponse,
    pub(crate) exchange_connection: Option<String>,
    pub(crate) exchange_scopes: Vec<String>,
}

impl CachedToken {
    /// Reusable without a driver call: not exchangeable and more than the margin left.
    pub(crate) fn is_reusable_at(&self, now: DateTime<Utc>) -> bool {
        if self.token.is_exchangeable {
            return false;
        }
        match self.token.expiration {
            Some(expiration) => {
                expiration - now > Duration::minutes(TOKEN_REFRESH_MARGIN_MINUTES)
            }
            None => true,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct TokenCache {
    entries: Mutex<HashMap<String, CachedToken>>,
}

impl TokenCache {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, CachedToken>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn get(&self, key: &str) -> Option<CachedToken> {
        self.lock().get(key).cloned()
    }

    pub(crate) fn insert(&self, key: &str, entry: CachedToken) {
        self.lock().insert(key.to_string(), entry);
    }

    /// Replaces only the token value, keeping exchange parameters.
    pub(crate) fn refresh(&self, key: &str, token: TokenResponse) {
        if let Some(entry) = self.lock().get_mut(key) {
            entry.token = token;
        }
    }

    pub(crate) fn remove(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }
}
