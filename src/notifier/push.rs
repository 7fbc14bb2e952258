use async_trait::async_trait;
use tracing::info;

use crate::models::{RideId, UserId};

/// Out-of-band notification for a user's device (FCM, SMS, email workers).
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub kind: &'static str,
    pub title: String,
    pub body: String,
    pub ride_id: Option<RideId>,
}

#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, target: UserId, event: &PushEvent) -> anyhow::Result<()>;
}

/// Used when no broker is configured.
pub struct LogPush;

#[async_trait]
impl PushSender for LogPush {
    async fn send(&self, target: UserId, event: &PushEvent) -> anyhow::Result<()> {
        info!(target_user = %target, kind = event.kind, "Push: {} - {}", event.title, event.body);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::mpsc;

    /// Forwards every push to a channel the test can await on.
    pub(crate) struct RecordingPush {
        tx: mpsc::UnboundedSender<(UserId, PushEvent)>,
    }

    impl RecordingPush {
        pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<(UserId, PushEvent)>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Self { tx }, rx)
        }
    }

    #[async_trait]
    impl PushSender for RecordingPush {
        async fn send(&self, target: UserId, event: &PushEvent) -> anyhow::Result<()> {
            self.tx.send((target, event.clone()))?;
            Ok(())
        }
    }

    pub(crate) struct FailingPush;

    #[async_trait]
    impl PushSender for FailingPush {
        async fn send(&self, _target: UserId, _event: &PushEvent) -> anyhow::Result<()> {
            anyhow::bail!("push gateway unreachable")
        }
    }
}
