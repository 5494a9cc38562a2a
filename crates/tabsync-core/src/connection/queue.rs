//! Bounded FIFO of outbound publishes awaiting delivery.

use std::collections::VecDeque;

use tabsync_protocol::{PublishRequest, SyncError};
use tokio::sync::oneshot;
use tracing::warn;

pub type Delivery = oneshot::Receiver<Result<(), SyncError>>;

pub struct QueuedMessage {
    pub request: PublishRequest,
    pub enqueued_at_ms: i64,
    pub attempt_count: u32,
    pub max_attempts: u32,
    done: oneshot::Sender<Result<(), SyncError>>,
}

impl QueuedMessage {
    pub fn new(
        request: PublishRequest,
        enqueued_at_ms: i64,
        max_attempts: u32,
    ) -> (Self, Delivery) {
        let (done, delivery) = oneshot::channel();
        let message = Self {
            request,
            enqueued_at_ms,
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            done,
        };
        (message, delivery)
    }

    pub fn exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    pub fn succeed(self) {
        // The sender may have given up waiting
        let _ = self.done.send(Ok(()));
    }

    pub fn fail(self, error: SyncError) {
        let _ = self.done.send(Err(error));
    }
}

pub struct OutboundQueue {
    items: VecDeque<QueuedMessage>,
    max_length: usize,
    /// A flush task is draining the queue.
    pub(crate) flushing: bool,
}

impl OutboundQueue {
    pub fn new(max_length: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_length: max_length.max(1),
            flushing: false,
        }
    }

    /// Append a message. When full, the oldest message is failed to make room.
    pub fn push(&mut self, message: QueuedMessage) {
        if self.items.len() >= self.max_length {
            if let Some(oldest) = self.items.pop_front() {
                warn!("Outbound queue full, dropping message {}", oldest.request.message_id);
                oldest.fail(SyncError::SendError("outbound queue overflow".into()));
            }
        }
        self.items.push_back(message);
    }

    /// Put a message back at the head after a failed attempt.
    pub fn retry_front(&mut self, message: QueuedMessage) {
        self.items.push_front(message);
    }

    pub fn pop_front(&mut self) -> Option<QueuedMessage> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Fail every queued message. Returns how many were dropped.
    pub fn clear(&mut self, reason: &str) -> usize {
        let count = self.items.len();
        for message in self.items.drain(..) {
            message.fail(SyncError::SendError(reason.to_string()));
        }
        count
    }
}
