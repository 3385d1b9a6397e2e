//! Scoped state available to handlers during one turn.
//!
//! Conversation and user scopes are loaded from storage when the turn starts
//! and written back by [`TurnState::save`] only when changed. The temp scope
//! lives for the turn and is never persisted.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use turnstile_activity::{Activity, TurnContext};
use turnstile_storage::{Storage, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported `StateScope` values.
pub enum StateScope {
    Conversation,
    User,
    Temp,
}

#[derive(Debug, Default)]
struct ScopeValues {
    storage_key: Option<String>,
    values: BTreeMap<String, Value>,
    dirty: bool,
}

#[derive(Debug, Default)]
struct TurnStateInner {
    conversation: ScopeValues,
    user: ScopeValues,
    temp: BTreeMap<String, Value>,
}

/// Shared handle; clones observe the same values.
#[derive(Debug, Clone, Default)]
pub struct TurnState {
    inner: Arc<Mutex<TurnStateInner>>,
}

pub fn conversation_state_key(activity: &Activity) -> Option<String> {
    let conversation_id = activity.conversation.id.trim();
    if activity.channel_id.trim().is_empty() || conversation_id.is_empty() {
        return None;
    }
    Some(format!(
        "{}/conversations/{}",
        activity.channel_id.trim(),
        conversation_id
    ))
}

pub fn user_state_key(activity: &Activity) -> Option<String> {
    let user_id = activity.from.id.trim();
    if activity.channel_id.trim().is_empty() || user_id.is_empty() {
        return None;
    }
    Some(format!("{}/users/{}", activity.channel_id.trim(), user_id))
}

impl TurnState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(context: &TurnContext, storage: &dyn Storage) -> StorageResult<Self> {
        let conversation_key = conversation_state_key(context.activity());
        let user_key = user_state_key(context.activity());
        let keys = conversation_key
            .iter()
            .chain(user_key.iter())
            .cloned()
            .collect::<Vec<_>>();
        let mut stored = if keys.is_empty() {
            BTreeMap::new()
        } else {
            storage.read(&keys).await?
        };

        let scope_values = |key: Option<String>, stored: &mut BTreeMap<String, Value>| {
            let values = key
                .as_ref()
                .and_then(|key| stored.remove(key))
                .and_then(|value| serde_json::from_value(value).ok())
                .unwrap_or_default();
            ScopeValues {
                storage_key: key,
                values,
                dirty: false,
            }
        };
        let conversation = scope_values(conversation_key, &mut stored);
        let user = scope_values(user_key, &mut stored);

        Ok(Self {
            inner: Arc::new(Mutex::new(TurnStateInner {
                conversation,
                user,
                temp: BTreeMap::new(),
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TurnStateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get<T>(&self, scope: StateScope, key: &str) -> Option<T>
    where
        T: DeserializeOwned,
    {
        let inner = self.lock();
        let value = match scope {
            StateScope::Conversation => inner.conversation.values.get(key),
            StateScope::User => inner.user.values.get(key),
            StateScope::Temp => inner.temp.get(key),
        }?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn set<T>(&self, scope: StateScope, key: &str, value: &T) -> Result<(), serde_json::Error>
    where
        T: Serialize,
    {
        let value = serde_json::to_value(value)?;
        let mut inner = self.lock();
        match scope {
            StateScope::Conversation => {
                inner.conversation.values.insert(key.to_string(), value);
                inner.conversation.dirty = true;
            }
            StateScope::User => {
                inner.user.values.insert(key.to_string(), value);
                inner.user.dirty = true;
            }
            StateScope::Temp => {
                inner.temp.insert(key.to_string(), value);
            }
        }
        Ok(())
    }

    pub fn remove(&self, scope: StateScope, key: &str) {
        let mut inner = self.lock();
        match scope {
            StateScope::Conversation => {
                if inner.conversation.values.remove(key).is_some() {
                    inner.conversation.dirty = true;
                }
            }
            StateScope::User => {
                if inner.user.values.remove(key).is_some() {
                    inner.user.dirty = true;
                }
            }
            StateScope::Temp => {
                inner.temp.remove(key);
            }
        }
    }

    pub fn is_dirty(&self) -> bool {
        let inner = self.lock();
        inner.conversation.dirty || inner.user.dirty
    }

    /// Writes changed conversation/user scopes.
    pub async fn save(&self, storage: &dyn Storage) -> StorageResult<()> {
        let changes = {
            let inner = self.lock();
            [&inner.conversation, &inner.user]
                .into_iter()
                .filter(|scope| scope.dirty)
                .filter_map(|scope| {
                    let key = scope.storage_key.clone()?;
                    let value = serde_json::to_value(&scope.values).ok()?;
                    Some((key, value))
                })
                .collect::<BTreeMap<String, Value>>()
        };
        if changes.is_empty() {
            return Ok(());
        }
        storage.write(changes).await?;
        let mut inner = self.lock();
        inner.conversation.dirty = false;
        inner.user.dirty = false;
        Ok(())
    }
}
