//! Hand-off from worker threads to the async notification transport.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::messages::StatusUpdate;
use crate::collaborators::NotificationChannel;
use crate::error::NotifyError;

/// Cloneable producer side. Sending never blocks and needs no runtime.
#[derive(Debug, Clone)]
pub struct NotificationSender {
    tx: mpsc::UnboundedSender<StatusUpdate>,
}

impl NotificationSender {
    /// Create a sender and the receiver a dispatcher will drain
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StatusUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, update: StatusUpdate) -> Result<(), NotifyError> {
        self.tx.send(update).map_err(|_| NotifyError::Closed)
    }

    /// Best-effort send; a stopped dispatcher is logged and ignored
    pub fn notify(&self, update: StatusUpdate) {
        let work_id = update.work_id.clone();
        if let Err(e) = self.send(update) {
            debug!(work_id = %work_id, error = %e, "Dropping status update");
        }
    }
}

/// Drains queued updates into a [`NotificationChannel`]
pub struct NotificationDispatcher;

impl NotificationDispatcher {
    /// Spawn the drain loop on the current runtime.
    ///
    /// Stops when `cancel` fires or every sender is dropped. Delivery
    /// failures are logged and never propagate.
    pub fn spawn(
        mut rx: mpsc::UnboundedReceiver<StatusUpdate>,
        channel: Arc<dyn NotificationChannel>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!("Notification dispatcher started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    update = rx.recv() => {
                        let Some(update) = update else { break };
                        deliver(channel.as_ref(), &update);
                    }
                }
            }
            debug!("Notification dispatcher stopped");
        })
    }
}

fn deliver(channel: &dyn NotificationChannel, update: &StatusUpdate) {
    match channel.broadcast(&update.work_id, update) {
        Ok(()) => {}
        Err(NotifyError::NoSubscribers { work_id }) => {
            trace!(work_id = %work_id, "No subscribers for status update");
        }
        Err(e) => {
            warn!(work_id = %update.work_id, error = %e, "Failed to deliver status update");
        }
    }
}
