//! Message consumer and worker pool.
//!
//! A consumer drains the transport and drives each task message through
//! the idempotency guard before handing it to the chain runner. The
//! guard has two tiers: the probabilistic existence filter (a negative
//! answer drops the message outright) and the processed-message ledger
//! (a hit means this exact delivery was already handled). Both tiers
//! degrade open: if either is unreachable the message proceeds, relying
//! on task-status checks for correctness.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};

use depot_core::models::DeadLetter;
use depot_core::{DepotError, DepotResult};
use depot_store::{ProcessedMessageStore, TaskStore};

use crate::filter::ExistenceFilter;
use crate::runner::{ChainRunner, RunOutcome};
use crate::transport::{Delivery, MessageTransport};

pub struct TaskConsumer {
    tasks: Arc<dyn TaskStore>,
    ledger: Arc<dyn ProcessedMessageStore>,
    filter: Arc<dyn ExistenceFilter>,
    transport: Arc<dyn MessageTransport>,
    runner: Arc<ChainRunner>,
    ledger_ttl: chrono::Duration,
    node_id: String,
}

impl TaskConsumer {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        ledger: Arc<dyn ProcessedMessageStore>,
        filter: Arc<dyn ExistenceFilter>,
        transport: Arc<dyn MessageTransport>,
        runner: Arc<ChainRunner>,
        ledger_ttl: chrono::Duration,
        node_id: String,
    ) -> Self {
        TaskConsumer {
            tasks,
            ledger,
            filter,
            transport,
            runner,
            ledger_ttl,
            node_id,
        }
    }

    /// Handle one delivery to acknowledgement.
    #[tracing::instrument(skip(self, delivery), fields(task_id = %delivery.message.task_id, message_id = %delivery.message.message_id))]
    pub async fn handle(&self, delivery: Delivery) -> DepotResult<()> {
        let message = delivery.message.clone();

        // Deadline check comes first: an expired message must not run
        // any callback, whatever state the task is in.
        if message.is_expired(Utc::now()) {
            self.expire_task(&message.task_id).await;
            return delivery.ack().await;
        }

        // Tier one: the existence filter. A definite miss means the task
        // was never created; the message is noise and is dropped.
        match self.filter.might_contain(message.task_id).await {
            Ok(false) => {
                tracing::warn!("Message for unknown task dropped by existence filter");
                return delivery.ack().await;
            }
            Ok(true) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Existence filter unavailable, proceeding");
            }
        }

        // Tier two: the dedup ledger catches broker redelivery of an
        // already-handled message.
        match self.ledger.is_processed(message.message_id).await {
            Ok(true) => {
                tracing::debug!("Duplicate delivery dropped by message ledger");
                return delivery.ack().await;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Message ledger unavailable, proceeding");
            }
        }

        match self.runner.run(message.task_id).await {
            Ok(RunOutcome::Completed) | Ok(RunOutcome::AlreadyTerminal) => {
                self.mark_processed(message.message_id).await;
                delivery.ack().await
            }
            Ok(RunOutcome::Failed { reason }) => {
                // Terminal chain failure: the task is already FAILED and
                // saved; the message goes to the dead-letter channel.
                self.transport
                    .dead_letter(DeadLetter {
                        message: message.clone(),
                        failure_reason: reason,
                        node_id: self.node_id.clone(),
                    })
                    .await?;
                self.mark_processed(message.message_id).await;
                delivery.ack().await
            }
            Err(DepotError::NotFound(what)) => {
                tracing::warn!(what = %what, "Message references a missing task, dropping");
                delivery.ack().await
            }
            Err(e) if e.is_redeliverable() || e.is_retryable() => {
                tracing::error!(error = %e, kind = e.kind(), "Recoverable failure, leaving message for redelivery");
                delivery.nack().await
            }
            Err(e) => {
                tracing::error!(error = %e, kind = e.kind(), "Chain run failed terminally");
                self.transport
                    .dead_letter(DeadLetter {
                        message: message.clone(),
                        failure_reason: e.to_string(),
                        node_id: self.node_id.clone(),
                    })
                    .await?;
                self.mark_processed(message.message_id).await;
                delivery.ack().await
            }
        }
    }

    /// Move the task to EXPIRED, racing completion safely: terminal
    /// tasks are left untouched.
    async fn expire_task(&self, task_id: &uuid::Uuid) {
        match self.tasks.find_for_update(*task_id).await {
            Ok(mut lease) => {
                if lease.task.status.is_terminal() {
                    return;
                }
                lease.task.mark_expired();
                if let Err(e) = self.tasks.save(&lease.task).await {
                    tracing::warn!(task_id = %task_id, error = %e, "Failed to persist expiry");
                } else {
                    tracing::info!(task_id = %task_id, "Task expired before processing");
                }
            }
            Err(DepotError::NotFound(_)) => {}
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to load task for expiry");
            }
        }
    }

    /// Ledger writes degrade open: a failed write only risks one extra
    /// redundant run, which the task-status check absorbs.
    async fn mark_processed(&self, message_id: uuid::Uuid) {
        if let Err(e) = self
            .ledger
            .mark_processed(message_id, self.ledger_ttl)
            .await
        {
            tracing::warn!(message_id = %message_id, error = %e, "Failed to record processed message");
        }
    }
}

/// Fixed-size worker pool draining the transport until shutdown.
pub struct ConsumerPool {
    consumer: Arc<TaskConsumer>,
    transport: Arc<dyn MessageTransport>,
    semaphore: Arc<Semaphore>,
    max_workers: usize,
    poll_interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
}

impl ConsumerPool {
    pub fn new(
        consumer: Arc<TaskConsumer>,
        transport: Arc<dyn MessageTransport>,
        max_workers: usize,
        poll_interval: Duration,
    ) -> (Self, mpsc::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        (
            ConsumerPool {
                consumer,
                transport,
                semaphore: Arc::new(Semaphore::new(max_workers)),
                max_workers,
                poll_interval,
                shutdown_rx,
            },
            shutdown_tx,
        )
    }

    /// Run until a shutdown signal arrives, then wait for in-flight
    /// handlers to finish.
    pub async fn run(mut self) {
        tracing::info!(workers = self.max_workers, "Consumer pool started");
        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    tracing::info!("Consumer pool shutting down");
                    break;
                }
                received = self.transport.receive() => {
                    match received {
                        Ok(Some(delivery)) => self.dispatch(delivery).await,
                        Ok(None) => tokio::time::sleep(self.poll_interval).await,
                        Err(e) => {
                            tracing::error!(error = %e, "Transport receive failed");
                            tokio::time::sleep(self.poll_interval).await;
                        }
                    }
                }
            }
        }

        // Reacquire every permit so all spawned handlers are done.
        let _ = self.semaphore.acquire_many(self.max_workers as u32).await;
        tracing::info!("Consumer pool stopped");
    }

    async fn dispatch(&self, delivery: Delivery) {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let consumer = self.consumer.clone();
        tokio::spawn(async move {
            let task_id = delivery.message.task_id;
            if let Err(e) = consumer.handle(delivery).await {
                tracing::error!(task_id = %task_id, error = %e, "Message handling failed");
            }
            drop(permit);
        });
    }
}
