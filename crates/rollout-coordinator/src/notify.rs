//! Channel-backed notification sink.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use rollout_kernel::{LifecycleEvent, NotificationSink};

/// Forwards lifecycle events into a bounded channel without ever waiting.
/// Events that do not fit (or arrive after the receiver is gone) are dropped and counted.
pub struct ChannelNotificationSink {
    tx: mpsc::Sender<LifecycleEvent>,
    dropped: AtomicU64,
}

impl ChannelNotificationSink {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl NotificationSink for ChannelNotificationSink {
    fn notify(&self, event: &LifecycleEvent) {
        if let Err(err) = self.tx.try_send(event.clone()) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            let reason = match err {
                mpsc::error::TrySendError::Full(_) => "full",
                mpsc::error::TrySendError::Closed(_) => "closed",
            };
            tracing::debug!(
                deployment_id = event.deployment_id(),
                reason,
                dropped = total,
                "notification dropped"
            );
        }
    }
}
