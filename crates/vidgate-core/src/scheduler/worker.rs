use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use crate::domain::OperationType;

use super::dispatch::Dispatcher;
use super::policy::{QueuePolicies, QueuePolicy};
use super::queue::JobQueue;
use super::throttle::StartLimiter;

/// Upper bound on how long an idle lane sleeps before re-checking its queue.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// One task per operation-type queue, each bounded by its own concurrency
/// limit and start rate.
#[derive(Debug)]
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    lanes: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn the lane tasks. Must be called inside a Tokio runtime.
    pub fn start(
        queue: Arc<JobQueue>,
        dispatcher: Arc<Dispatcher>,
        policies: &QueuePolicies,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let lanes = OperationType::ALL
            .into_iter()
            .map(|operation| {
                let lane = Lane {
                    operation,
                    policy: policies.get(operation),
                    queue: Arc::clone(&queue),
                    dispatcher: Arc::clone(&dispatcher),
                    shutdown: shutdown.subscribe(),
                };
                tokio::spawn(lane.run())
            })
            .collect();

        tracing::info!(lanes = OperationType::ALL.len(), "worker pool started");
        Self { shutdown, lanes }
    }

    /// Stop claiming new work and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for lane in self.lanes {
            if let Err(error) = lane.await {
                tracing::error!(%error, "worker lane ended abnormally");
            }
        }
        tracing::info!("worker pool stopped");
    }
}

struct Lane {
    operation: OperationType,
    policy: QueuePolicy,
    queue: Arc<JobQueue>,
    dispatcher: Arc<Dispatcher>,
    shutdown: watch::Receiver<bool>,
}

impl Lane {
    async fn run(mut self) {
        let max_concurrency = self.policy.max_concurrency.max(1);
        let permits = Arc::new(Semaphore::new(max_concurrency));
        let limiter = StartLimiter::per_second(self.policy.starts_per_second);
        let notify = self.queue.notifier(self.operation);

        tracing::debug!(
            operation = %self.operation,
            max_concurrency,
            starts_per_second = self.policy.starts_per_second,
            "worker lane running"
        );

        'lane: loop {
            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'lane,
                },
                _ = self.shutdown.changed() => break 'lane,
            };

            let claim = loop {
                if *self.shutdown.borrow() {
                    break 'lane;
                }
                if let Some(claim) = self.queue.claim_next(self.operation) {
                    break claim;
                }
                let idle = self
                    .queue
                    .next_due_in(self.operation)
                    .map_or(IDLE_POLL, |due| due.min(IDLE_POLL));
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep(idle) => {}
                    _ = self.shutdown.changed() => break 'lane,
                }
            };

            // The start token is taken after the claim so an idle lane keeps
            // its burst for when work arrives.
            limiter.acquire().await;

            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move {
                dispatcher.run(claim).await;
                drop(permit);
            });
        }

        // Every permit back in hand means every dispatched claim finished.
        if let Ok(all) = permits.acquire_many(max_concurrency as u32).await {
            drop(all);
        }
        tracing::debug!(operation = %self.operation, "worker lane drained");
    }
}
