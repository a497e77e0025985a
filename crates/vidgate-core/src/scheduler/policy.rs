use std::collections::HashMap;
use std::time::Duration;

use crate::domain::OperationType;

/// Concurrency and start-rate limits of one operation-type queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePolicy {
    pub max_concurrency: usize,
    /// Token-bucket refill rate for job starts.
    pub starts_per_second: u32,
    /// Extra wait applied to lowest-priority jobs before they become ready.
    pub low_priority_delay: Duration,
}

impl QueuePolicy {
    pub const fn new(max_concurrency: usize, starts_per_second: u32) -> Self {
        Self {
            max_concurrency,
            starts_per_second,
            low_priority_delay: Duration::from_millis(500),
        }
    }

    #[must_use]
    pub const fn with_low_priority_delay(mut self, delay: Duration) -> Self {
        self.low_priority_delay = delay;
        self
    }

    /// Search is expensive in units, so it runs narrower than lookups.
    pub const fn default_for(operation: OperationType) -> Self {
        match operation {
            OperationType::Search => Self::new(2, 2),
            OperationType::VideoDetails | OperationType::VideoStats => Self::new(5, 10),
            OperationType::ChannelDetails | OperationType::PlaylistItems => Self::new(3, 5),
        }
    }
}

/// One [`QueuePolicy`] per operation type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePolicies {
    policies: HashMap<OperationType, QueuePolicy>,
}

impl QueuePolicies {
    /// The same policy for every queue.
    pub fn uniform(policy: QueuePolicy) -> Self {
        Self {
            policies: OperationType::ALL
                .into_iter()
                .map(|operation| (operation, policy))
                .collect(),
        }
    }

    #[must_use]
    pub fn with(mut self, operation: OperationType, policy: QueuePolicy) -> Self {
        self.policies.insert(operation, policy);
        self
    }

    pub fn get(&self, operation: OperationType) -> QueuePolicy {
        self.policies
            .get(&operation)
            .copied()
            .unwrap_or_else(|| QueuePolicy::default_for(operation))
    }
}

impl Default for QueuePolicies {
    fn default() -> Self {
        Self {
            policies: OperationType::ALL
                .into_iter()
                .map(|operation| (operation, QueuePolicy::default_for(operation)))
                .collect(),
        }
    }
}

/// How long finished jobs stay pollable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_finished_jobs: usize,
    pub max_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_finished_jobs: 1_000,
            max_age: Duration::from_secs(3_600),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_to_one_queue_only() {
        let policies = QueuePolicies::default().with(OperationType::Search, QueuePolicy::new(1, 1));
        assert_eq!(policies.get(OperationType::Search).max_concurrency, 1);
        assert_eq!(policies.get(OperationType::VideoDetails).max_concurrency, 5);
        assert_eq!(
            policies.get(OperationType::PlaylistItems).low_priority_delay,
            Duration::from_millis(500)
        );
    }
}
