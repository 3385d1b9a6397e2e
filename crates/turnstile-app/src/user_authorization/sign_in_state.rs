//! Persisted per-(conversation, recipient) sign-in record.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use turnstile_activity::Activity;
use turnstile_core::{is_past_deadline, unix_ms_deadline, CooperativeCancellationToken};
use turnstile_storage::{delete_key, read_typed, write_typed, Storage};

use super::AuthorizationError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Public struct `SignInState` used across turnstile components.
pub struct SignInState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_handler_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_activity: Option<Activity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_connection_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exchange_scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_unix_ms: Option<u64>,
}

impl SignInState {
    pub fn is_active(&self) -> bool {
        self.active_handler_name.is_some()
    }
}

/// `oauth/{conversationId}/{recipientId}/userAuthorizationState`
pub fn sign_in_state_key(activity: &Activity) -> Result<String, AuthorizationError> {
    let conversation_id = activity.conversation.id.trim();
    let recipient_id = activity.recipient.id.trim();
    if conversation_id.is_empty() || recipient_id.is_empty() {
        return Err(AuthorizationError::MissingConversationReference);
    }
    Ok(format!(
        "oauth/{conversation_id}/{recipient_id}/userAuthorizationState"
    ))
}

/// Thin adapter over keyed storage for [`SignInState`] records.
pub(crate) struct SignInStateStore<'a> {
    storage: &'a dyn Storage,
    cancellation: &'a CooperativeCancellationToken,
}

impl<'a> SignInStateStore<'a> {
    pub(crate) fn new(
        storage: &'a dyn Storage,
        cancellation: &'a CooperativeCancellationToken,
    ) -> Self {
        Self {
            storage,
            cancellation,
        }
    }

    /// Reads the record, treating absence as a default record.
    ///
    /// A pending record started more than `ttl` ago is deleted and read as idle.
    pub(crate) async fn load(
        &self,
        key: &str,
        ttl: Option<Duration>,
        now_unix_ms: u64,
    ) -> Result<SignInState, AuthorizationError> {
        let state = self
            .cancellation
            .run(read_typed::<SignInState>(self.storage, key))
            .await??
            .unwrap_or_default();
        let expires_unix_ms = match (state.is_active(), ttl, state.started_unix_ms) {
            (true, Some(ttl), Some(started)) => Some(unix_ms_deadline(started, ttl)),
            _ => None,
        };
        if is_past_deadline(expires_unix_ms, now_unix_ms) {
            tracing::warn!(
                key,
                handler = state.active_handler_name.as_deref().unwrap_or_default(),
                "discarding abandoned sign-in flow past its ttl"
            );
            self.delete(key).await?;
            return Ok(SignInState::default());
        }
        Ok(state)
    }

    pub(crate) async fn save(&self, key: &str, state: &SignInState) -> Result<(), AuthorizationError> {
        self.cancellation
            .run(write_typed(self.storage, key, state))
            .await??;
        Ok(())
    }

    pub(crate) async fn delete(&self, key: &str) -> Result<(), AuthorizationError> {
        self.cancellation
            .run(delete_key(self.storage, key))
            .await??;
        Ok(())
    }
}
