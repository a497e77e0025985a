use serde::Serialize;
use tokio::sync::broadcast;

use crate::domain::{OperationType, Priority};
use crate::error::ErrorReport;
use crate::scheduler::JobId;

/// Something observable happened inside the gateway.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    JobQueued {
        job_id: JobId,
        operation_type: OperationType,
        priority: Priority,
    },
    JobStarted {
        job_id: JobId,
        operation_type: OperationType,
        attempt: u32,
    },
    JobRetryScheduled {
        job_id: JobId,
        attempt: u32,
        delay_ms: u64,
        error: ErrorReport,
    },
    JobCompleted {
        job_id: JobId,
        operation_type: OperationType,
        cache_hit: bool,
    },
    JobFailed {
        job_id: JobId,
        operation_type: OperationType,
        error: ErrorReport,
    },
    QuotaCommitted {
        units: u64,
        used: u64,
        remaining: u64,
    },
    CredentialRefreshed {
        owner_id: Option<String>,
    },
    CacheDegraded {
        reason: String,
    },
}

/// Fan-out of [`GatewayEvent`]s to any number of subscribers.
///
/// Slow subscribers lose the oldest events rather than blocking publishers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: GatewayEvent) {
        // Sending only fails when nobody listens.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
