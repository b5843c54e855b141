//! Message transport seam.
//!
//! Delivery is at-least-once with manual acknowledgement: a consumer
//! acks a message only after handling it, nacks to request broker
//! redelivery, and routes terminal failures to the dead-letter channel.
//! The in-process channel transport backs tests and single-node runs.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use depot_core::models::{DeadLetter, TaskMessage};
use depot_core::DepotResult;

/// Per-delivery acknowledgement token.
#[async_trait]
pub trait Acknowledge: Send {
    /// Confirm handling; the broker forgets the message.
    async fn ack(self: Box<Self>) -> DepotResult<()>;

    /// Decline handling; the broker redelivers later.
    async fn nack(self: Box<Self>) -> DepotResult<()>;
}

/// One received message plus its acknowledgement token.
pub struct Delivery {
    pub message: TaskMessage,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(message: TaskMessage, acker: Box<dyn Acknowledge>) -> Self {
        Delivery { message, acker }
    }

    pub async fn ack(self) -> DepotResult<()> {
        self.acker.ack().await
    }

    pub async fn nack(self) -> DepotResult<()> {
        self.acker.nack().await
    }
}

#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn publish(&self, message: TaskMessage) -> DepotResult<()>;

    /// Take the next available message, or `None` when the queue is
    /// currently empty.
    async fn receive(&self) -> DepotResult<Option<Delivery>>;

    async fn dead_letter(&self, letter: DeadLetter) -> DepotResult<()>;
}

/// In-process queue transport. A nacked message goes back to the front
/// of the queue; dead letters accumulate for inspection.
#[derive(Clone, Default)]
pub struct ChannelTransport {
    inner: Arc<ChannelInner>,
}

#[derive(Default)]
struct ChannelInner {
    queue: Mutex<VecDeque<TaskMessage>>,
    notify: Notify,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.lock().await.clone()
    }

    /// Wake a consumer blocked on an empty queue.
    pub fn wakeup(&self) {
        self.inner.notify.notify_one();
    }
}

struct RequeueAcker {
    inner: Arc<ChannelInner>,
    message: TaskMessage,
}

#[async_trait]
impl Acknowledge for RequeueAcker {
    async fn ack(self: Box<Self>) -> DepotResult<()> {
        Ok(())
    }

    async fn nack(self: Box<Self>) -> DepotResult<()> {
        self.inner.queue.lock().await.push_front(self.message);
        self.inner.notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl MessageTransport for ChannelTransport {
    async fn publish(&self, message: TaskMessage) -> DepotResult<()> {
        self.inner.queue.lock().await.push_back(message);
        self.inner.notify.notify_one();
        Ok(())
    }

    async fn receive(&self) -> DepotResult<Option<Delivery>> {
        let message = self.inner.queue.lock().await.pop_front();
        Ok(message.map(|message| {
            Delivery::new(
                message.clone(),
                Box::new(RequeueAcker {
                    inner: self.inner.clone(),
                    message,
                }),
            )
        }))
    }

    async fn dead_letter(&self, letter: DeadLetter) -> DepotResult<()> {
        tracing::warn!(
            task_id = %letter.message.task_id,
            reason = %letter.failure_reason,
            "Message routed to dead-letter channel"
        );
        self.inner.dead_letters.lock().await.push(letter);
        Ok(())
    }
}
