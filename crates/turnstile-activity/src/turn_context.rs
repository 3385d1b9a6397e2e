//! Per-turn context: inbound activity, caller identity, outbound sink and
//! cancellation.
//!
//! The context records whether anything was sent and whether an invoke
//! response was already produced. A turn admits at most one invoke response.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use turnstile_core::CooperativeCancellationToken;

use crate::activity::{activity_types, Activity};
use crate::identity::ClaimsIdentity;
use crate::invoke::InvokeResponse;

#[async_trait]
/// Trait contract for the outbound channel connection.
pub trait ActivitySender: Send + Sync {
    async fn send_activities(&self, activities: Vec<Activity>) -> Result<()>;
}

/// Sender that keeps every outbound activity in memory.
#[derive(Debug, Default)]
pub struct RecordingSender {
    sent: AsyncMutex<Vec<Activity>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<Activity> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|activity| activity.is_message())
            .filter_map(|activity| activity.text.clone())
            .collect()
    }

    pub async fn invoke_responses(&self) -> Vec<InvokeResponse> {
        self.sent
            .lock()
            .await
            .iter()
            .filter_map(InvokeResponse::from_activity)
            .collect()
    }

    pub async fn clear(&self) {
        self.sent.lock().await.clear();
    }
}

#[async_trait]
impl ActivitySender for RecordingSender {
    async fn send_activities(&self, activities: Vec<Activity>) -> Result<()> {
        self.sent.lock().await.extend(activities);
        Ok(())
    }
}

/// Public struct `TurnContext` used across turnstile components.
pub struct TurnContext {
    activity: Activity,
    identity: Option<ClaimsIdentity>,
    sender: Arc<dyn ActivitySender>,
    cancellation: CooperativeCancellationToken,
    responded: AtomicBool,
    invoke_response_sent: AtomicBool,
}

impl std::fmt::Debug for TurnContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnContext")
            .field("activity", &self.activity)
            .field("identity", &self.identity)
            .field("responded", &self.responded())
            .field("invoke_response_sent", &self.invoke_response_sent())
            .finish_non_exhaustive()
    }
}

impl TurnContext {
    pub fn new(activity: Activity, sender: Arc<dyn ActivitySender>) -> Self {
        Self {
            activity,
            identity: None,
            sender,
            cancellation: CooperativeCancellationToken::new(),
            responded: AtomicBool::new(false),
            invoke_response_sent: AtomicBool::new(false),
        }
    }

    pub fn with_identity(mut self, identity: ClaimsIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_cancellation(mut self, cancellation: CooperativeCancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn activity(&self) -> &Activity {
        &self.activity
    }

    pub fn identity(&self) -> Option<&ClaimsIdentity> {
        self.identity.as_ref()
    }

    pub fn sender(&self) -> Arc<dyn ActivitySender> {
        Arc::clone(&self.sender)
    }

    pub fn cancellation(&self) -> &CooperativeCancellationToken {
        &self.cancellation
    }

    pub fn responded(&self) -> bool {
        self.responded.load(Ordering::SeqCst)
    }

    pub fn invoke_response_sent(&self) -> bool {
        self.invoke_response_sent.load(Ordering::SeqCst)
    }

    /// Sends one activity, filling in conversation addressing from the inbound activity.
    ///
    /// `invokeResponse` activities are routed through [`Self::send_invoke_response`].
    pub async fn send_activity(&self, activity: Activity) -> Result<()> {
        if activity.is_type(activity_types::INVOKE_RESPONSE) {
            if let Some(response) = InvokeResponse::from_activity(&activity) {
                self.send_invoke_response(response).await?;
                return Ok(());
            }
        }
        let activity = self.activity.conversation_reference().apply(activity);
        self.cancellation
            .run(self.sender.send_activities(vec![activity]))
            .await??;
        self.responded.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let reply = self.activity.create_reply(text);
        self.send_activity(reply).await
    }

    /// Sends the invoke response for this turn.
    ///
    /// Returns `false` without sending when a response already went out.
    pub async fn send_invoke_response(&self, response: InvokeResponse) -> Result<bool> {
        if self.invoke_response_sent.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                status = response.status,
                conversation_id = %self.activity.conversation.id,
                "dropping duplicate invoke response"
            );
            return Ok(false);
        }
        let mut activity = response.into_activity();
        activity.reply_to_id = self.activity.id.clone();
        let sent = self
            .cancellation
            .run(self.sender.send_activities(vec![activity]))
            .await;
        match sent {
            Ok(Ok(())) => {
                self.responded.store(true, Ordering::SeqCst);
                Ok(true)
            }
            Ok(Err(error)) => {
                self.invoke_response_sent.store(false, Ordering::SeqCst);
                Err(error)
            }
            Err(cancelled) => {
                self.invoke_response_sent.store(false, Ordering::SeqCst);
                Err(cancelled.into())
            }
        }
    }
}
