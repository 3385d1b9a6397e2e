//! Continuation Bridge: re-enters turn processing for a banked activity
//! outside the request/response cycle that completed sign-in.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use turnstile_activity::{Activity, ClaimsIdentity};

/// Enumerates supported `ContinuationError` values.
#[derive(Debug, Error)]
pub enum ContinuationError {
    #[error("continuation receiver closed")]
    Closed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One activity scheduled to be processed as if newly received.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumedTurn {
    pub identity: Option<ClaimsIdentity>,
    pub activity: Activity,
    pub audience: Option<String>,
}

/// Trait contract for proactive continuation.
///
/// `resume` schedules work; it must not wait for the resumed turn to finish.
#[async_trait]
pub trait ContinuationBridge: Send + Sync {
    async fn resume(
        &self,
        identity: Option<ClaimsIdentity>,
        activity: Activity,
        audience: Option<String>,
    ) -> Result<(), ContinuationError>;
}

/// Bridge backed by an unbounded channel the host drains.
#[derive(Debug, Clone)]
pub struct QueuedContinuationBridge {
    sender: mpsc::UnboundedSender<ResumedTurn>,
}

/// Receiving half of [`QueuedContinuationBridge`].
#[derive(Debug)]
pub struct ContinuationReceiver {
    receiver: mpsc::UnboundedReceiver<ResumedTurn>,
}

pub fn continuation_channel() -> (QueuedContinuationBridge, ContinuationReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        QueuedContinuationBridge { sender },
        ContinuationReceiver { receiver },
    )
}

impl ContinuationReceiver {
    pub async fn recv(&mut self) -> Option<ResumedTurn> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ResumedTurn> {
        self.receiver.try_recv().ok()
    }
}

#[async_trait]
impl ContinuationBridge for QueuedContinuationBridge {
    async fn resume(
        &self,
        identity: Option<ClaimsIdentity>,
        activity: Activity,
        audience: Option<String>,
    ) -> Result<(), ContinuationError> {
        tracing::debug!(
            conversation_id = %activity.conversation.id,
            activity_type = %activity.activity_type,
            "queued continuation turn"
        );
        self.sender
            .send(ResumedTurn {
                identity,
                activity,
                audience,
            })
            .map_err(|_| ContinuationError::Closed)
    }
}
