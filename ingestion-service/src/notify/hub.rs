//! In-process subscriber registry.
//!
//! Subscribers register for specific uploads or for every upload and receive
//! [`ServerMessage`]s on an unbounded channel.

use std::collections::HashSet;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use super::messages::{ServerMessage, StatusUpdate};
use crate::collaborators::NotificationChannel;
use crate::error::NotifyError;

/// What a subscriber wants to hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    AllUploads,
    Uploads(HashSet<String>),
}

impl Subscription {
    pub fn upload(work_id: impl Into<String>) -> Self {
        Subscription::Uploads(HashSet::from([work_id.into()]))
    }

    fn matches(&self, work_id: &str) -> bool {
        match self {
            Subscription::AllUploads => true,
            Subscription::Uploads(ids) => ids.contains(work_id),
        }
    }
}

struct Subscriber {
    subscription: Subscription,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

/// Fans status updates out to registered subscribers
#[derive(Default)]
pub struct SubscriberHub {
    subscribers: DashMap<String, Subscriber>,
}

impl SubscriberHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Returns its id and message stream.
    pub fn subscribe(
        &self,
        subscription: Subscription,
    ) -> (String, mpsc::UnboundedReceiver<ServerMessage>) {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        debug!(subscriber_id = %id, subscription = ?subscription, "Adding subscriber");
        self.subscribers
            .insert(id.clone(), Subscriber { subscription, tx });
        (id, rx)
    }

    /// Add one upload to an existing subscription. Returns false for unknown ids.
    pub fn watch(&self, subscriber_id: &str, work_id: &str) -> bool {
        let Some(mut subscriber) = self.subscribers.get_mut(subscriber_id) else {
            return false;
        };
        if let Subscription::Uploads(ids) = &mut subscriber.subscription {
            ids.insert(work_id.to_string());
        }
        true
    }

    pub fn unsubscribe(&self, subscriber_id: &str) {
        debug!(subscriber_id = %subscriber_id, "Removing subscriber");
        self.subscribers.remove(subscriber_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl NotificationChannel for SubscriberHub {
    fn broadcast(&self, work_id: &str, update: &StatusUpdate) -> Result<(), NotifyError> {
        let msg: ServerMessage = update.clone().into();
        let mut matched = 0;
        let mut sent_count = 0;
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if !subscriber.subscription.matches(work_id) {
                continue;
            }
            matched += 1;
            if subscriber.tx.send(msg.clone()).is_ok() {
                sent_count += 1;
            } else {
                closed.push(entry.key().clone());
            }
        }

        // Removal happens after iteration; a DashMap shard is locked while iterating
        for id in &closed {
            self.unsubscribe(id);
        }

        if matched == 0 {
            return Err(NotifyError::NoSubscribers {
                work_id: work_id.to_string(),
            });
        }
        if sent_count == 0 {
            return Err(NotifyError::Delivery {
                message: format!("all {} subscribers for {} disconnected", matched, work_id),
            });
        }

        debug!(work_id = %work_id, sent_count = sent_count, "Broadcast status update");
        Ok(())
    }
}
