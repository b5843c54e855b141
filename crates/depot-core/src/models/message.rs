use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The single message type driving chain execution. `message_id` is
/// unique per publish (not per task) so the dedup ledger can distinguish
/// broker redelivery from a deliberate re-run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskMessage {
    pub task_id: Uuid,
    pub message_id: Uuid,
    /// Messages past this deadline short-circuit to EXPIRED without
    /// running any callback.
    pub deadline: DateTime<Utc>,
}

impl TaskMessage {
    pub fn new(task_id: Uuid, deadline: DateTime<Utc>) -> Self {
        TaskMessage {
            task_id,
            message_id: Uuid::new_v4(),
            deadline,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }
}

/// A terminally-failed message routed to the side channel for operator
/// inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: TaskMessage,
    pub failure_reason: String,
    pub node_id: String,
}
