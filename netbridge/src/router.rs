//! Fan-out of reassembled messages to topic subscribers.

use std::collections::HashMap;
use std::sync::Mutex;

use metrics::counter;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::protocol::{Message, Topic};

/// Per-subscriber buffer. A subscriber that falls this far behind loses
/// messages; the session reader is never blocked on a slow consumer.
pub const SUBSCRIBER_BUFFER: usize = 16;

const STATUS_BUFFER: usize = 16;

/// Session lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Connected,
    Disconnected,
    Error(String),
}

/// Delivers messages to every current subscriber of their topic and
/// broadcasts status events. Subscriptions end when the receiver is dropped
/// or the owning session closes.
pub struct TopicRouter {
    subscribers: Mutex<HashMap<Topic, Vec<mpsc::Sender<Message>>>>,
    status: broadcast::Sender<Status>,
    buffer: usize,
}

impl TopicRouter {
    pub fn new(buffer: usize) -> Self {
        let (status, _) = broadcast::channel(STATUS_BUFFER);
        TopicRouter {
            subscribers: Mutex::new(HashMap::new()),
            status,
            buffer,
        }
    }

    pub fn subscribe(&self, topic: Topic) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .entry(topic)
            .or_default()
            .push(tx);
        rx
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<Status> {
        self.status.subscribe()
    }

    /// Fan a message out to the topic's subscribers. Full buffers drop the
    /// message for that subscriber; closed receivers are pruned.
    pub fn publish(&self, message: Message) {
        let mut subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        let Some(senders) = subscribers.get_mut(&message.topic) else {
            debug!(topic = %message.topic, id = %message.id, "no subscribers for message");
            return;
        };
        senders.retain(|tx| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                counter!("netbridge_subscriber_dropped").increment(1);
                warn!(topic = %dropped.topic, id = %dropped.id, "subscriber lagging, message dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn emit_status(&self, status: Status) {
        // No receivers is fine; status events are best-effort.
        let _ = self.status.send(status);
    }

    /// Drop every topic sender so subscribers observe end-of-stream.
    pub fn close(&self) {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .clear();
    }
}
