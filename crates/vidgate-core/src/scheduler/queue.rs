//! Per-operation-type priority queues with quota-gated admission.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{watch, Notify};

use crate::client::PROVIDER_CHUNK_SIZE;
use crate::domain::{JobOutput, JobParams, OperationType, UtcDateTime};
use crate::events::{EventBus, GatewayEvent};
use crate::quota::{QuotaCostTable, QuotaError, QuotaLedger};
use crate::retry::RetryPolicy;
use crate::ApiError;

use super::job::{JobHandle, JobId, JobRequest, JobSnapshot, JobStatus};
use super::policy::{QueuePolicies, RetentionPolicy};

/// Per-queue counts for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub operation_type: OperationType,
    pub waiting: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub delayed: usize,
}

/// A job handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub id: JobId,
    pub params: JobParams,
    pub owner_id: Option<String>,
    /// 1-based attempt number of this run.
    pub attempt: u32,
}

/// Jobs a worker runs together: always one job, except for batched lookups
/// of one owner whose ids fit a single provider request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub operation_type: OperationType,
    pub jobs: Vec<ClaimedJob>,
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Retrying { delay: Duration },
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadyKey {
    priority: u8,
    seq: u64,
    id: JobId,
}

// BinaryHeap is a max-heap: the smallest (priority, seq) must compare greatest.
impl Ord for ReadyKey {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

impl PartialOrd for ReadyKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct Lane {
    ready: BinaryHeap<ReadyKey>,
    delayed: Vec<(Instant, ReadyKey)>,
    active: usize,
    completed: u64,
    failed: u64,
}

impl Lane {
    fn promote_due(&mut self, now: Instant) -> Vec<JobId> {
        let mut promoted = Vec::new();
        let mut index = 0;
        while index < self.delayed.len() {
            if self.delayed[index].0 <= now {
                let (_, key) = self.delayed.swap_remove(index);
                promoted.push(key.id);
                self.ready.push(key);
            } else {
                index += 1;
            }
        }
        promoted
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(due, _)| *due).min()
    }
}

struct JobRecord {
    request: JobRequest,
    snapshot: JobSnapshot,
    updates: watch::Sender<JobSnapshot>,
}

impl JobRecord {
    fn publish(&mut self) {
        self.updates.send_replace(self.snapshot.clone());
    }
}

#[derive(Default)]
struct QueueInner {
    next_seq: u64,
    jobs: HashMap<JobId, JobRecord>,
    lanes: HashMap<OperationType, Lane>,
    finished: VecDeque<(JobId, Instant)>,
}

impl QueueInner {
    fn lane(&mut self, operation: OperationType) -> &mut Lane {
        self.lanes.entry(operation).or_default()
    }

    fn set_status(&mut self, id: JobId, status: JobStatus) {
        if let Some(record) = self.jobs.get_mut(&id) {
            record.snapshot.status = status;
            record.publish();
        }
    }
}

/// Holds every job from enqueue until it is pruned after finishing.
pub struct JobQueue {
    inner: Mutex<QueueInner>,
    notifiers: HashMap<OperationType, Arc<Notify>>,
    ledger: Arc<QuotaLedger>,
    costs: QuotaCostTable,
    policies: QueuePolicies,
    retry: RetryPolicy,
    retention: RetentionPolicy,
    events: EventBus,
}

impl JobQueue {
    pub fn new(ledger: Arc<QuotaLedger>, events: EventBus) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notifiers: OperationType::ALL
                .into_iter()
                .map(|operation| (operation, Arc::new(Notify::new())))
                .collect(),
            ledger,
            costs: QuotaCostTable::default(),
            policies: QueuePolicies::default(),
            retry: RetryPolicy::default(),
            retention: RetentionPolicy::default(),
            events,
        }
    }

    #[must_use]
    pub fn with_policies(mut self, policies: QueuePolicies) -> Self {
        self.policies = policies;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    #[must_use]
    pub fn with_cost_table(mut self, costs: QuotaCostTable) -> Self {
        self.costs = costs;
        self
    }

    pub fn policies(&self) -> &QueuePolicies {
        &self.policies
    }

    /// Validate, check quota and queue a job.
    ///
    /// A job that fails validation or the quota check is never created.
    pub fn enqueue(&self, request: JobRequest) -> Result<JobHandle, ApiError> {
        request.params.validate()?;

        let operation = request.operation_type();
        let cost = self
            .costs
            .cost(operation, request.params.resource_count());
        let now = UtcDateTime::now();
        if !self.ledger.has_capacity_at(cost, now) {
            let snapshot = self.ledger.snapshot_at(now);
            let error = QuotaError::Exhausted {
                requested: cost,
                remaining: snapshot.remaining.saturating_sub(snapshot.reserved),
                reset_at: snapshot.reset_at,
            };
            tracing::warn!(
                %operation,
                cost,
                remaining = snapshot.remaining,
                "rejecting job: daily quota exhausted"
            );
            return Err(error.to_api_error(now));
        }

        let id = JobId::new();
        let priority = request.priority;
        let delay = if priority.is_lowest() {
            self.policies.get(operation).low_priority_delay
        } else {
            Duration::ZERO
        };
        let status = if delay.is_zero() {
            JobStatus::Queued
        } else {
            JobStatus::Delayed
        };

        let snapshot = JobSnapshot {
            id,
            operation_type: operation,
            priority,
            owner_id: request.owner_id.clone(),
            status,
            attempts: 0,
            created_at: now,
            finished_at: None,
            result: None,
            error: None,
        };
        let (updates, receiver) = watch::channel(snapshot.clone());

        {
            let mut inner = self.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let key = ReadyKey {
                priority: priority.as_u8(),
                seq,
                id,
            };
            let lane = inner.lane(operation);
            if delay.is_zero() {
                lane.ready.push(key);
            } else {
                lane.delayed.push((Instant::now() + delay, key));
            }
            inner.jobs.insert(
                id,
                JobRecord {
                    request,
                    snapshot,
                    updates,
                },
            );
        }

        tracing::debug!(job_id = %id, %operation, %priority, cost, "job queued");
        self.events.publish(GatewayEvent::JobQueued {
            job_id: id,
            operation_type: operation,
            priority,
        });
        self.notify(operation);
        Ok(JobHandle::new(id, receiver))
    }

    /// Take the next ready job of `operation`, plus compatible batched jobs.
    pub fn claim_next(&self, operation: OperationType) -> Option<Claim> {
        let mut inner = self.lock();
        let promoted = inner.lane(operation).promote_due(Instant::now());
        for id in promoted {
            inner.set_status(id, JobStatus::Queued);
        }

        let first = inner.lane(operation).ready.pop()?;
        let mut claimed = vec![first.id];

        if operation.is_batched() {
            let owner = inner
                .jobs
                .get(&first.id)
                .and_then(|record| record.request.owner_id.clone());
            let mut union: HashSet<String> = inner
                .jobs
                .get(&first.id)
                .and_then(|record| record.request.params.resource_ids())
                .map(|ids| ids.iter().map(str::to_owned).collect())
                .unwrap_or_default();

            let mut candidates =
                std::mem::take(&mut inner.lane(operation).ready).into_sorted_vec();
            // Sorted ascending by Ord, so the most urgent job is last.
            candidates.reverse();
            let mut skipped = Vec::new();
            for key in candidates {
                let compatible = inner.jobs.get(&key.id).and_then(|record| {
                    if record.request.owner_id != owner {
                        return None;
                    }
                    let ids = record.request.params.resource_ids()?;
                    let grown = ids.iter().filter(|id| !union.contains(*id)).count();
                    if union.len() + grown > PROVIDER_CHUNK_SIZE {
                        return None;
                    }
                    Some(ids.iter().map(str::to_owned).collect::<Vec<_>>())
                });
                match compatible {
                    Some(ids) => {
                        union.extend(ids);
                        claimed.push(key.id);
                    }
                    None => skipped.push(key),
                }
            }
            inner.lane(operation).ready.extend(skipped);
        }

        let mut jobs = Vec::with_capacity(claimed.len());
        for id in claimed {
            let Some(record) = inner.jobs.get_mut(&id) else {
                continue;
            };
            record.snapshot.status = JobStatus::Active;
            record.snapshot.attempts += 1;
            record.publish();
            jobs.push(ClaimedJob {
                id,
                params: record.request.params.clone(),
                owner_id: record.request.owner_id.clone(),
                attempt: record.snapshot.attempts,
            });
        }
        inner.lane(operation).active += jobs.len();
        drop(inner);

        for job in &jobs {
            self.events.publish(GatewayEvent::JobStarted {
                job_id: job.id,
                operation_type: operation,
                attempt: job.attempt,
            });
        }
        if jobs.len() > 1 {
            tracing::debug!(%operation, jobs = jobs.len(), "coalesced batched lookups");
        }

        (!jobs.is_empty()).then_some(Claim {
            operation_type: operation,
            jobs,
        })
    }

    pub fn complete(&self, id: JobId, output: JobOutput, cache_hit: bool) {
        let operation = {
            let mut inner = self.lock();
            let Some(record) = inner.jobs.get_mut(&id) else {
                return;
            };
            record.snapshot.status = JobStatus::Completed;
            record.snapshot.finished_at = Some(UtcDateTime::now());
            record.snapshot.result = Some(output);
            record.snapshot.error = None;
            record.publish();
            let operation = record.snapshot.operation_type;

            let lane = inner.lane(operation);
            lane.active = lane.active.saturating_sub(1);
            lane.completed += 1;
            self.finish_locked(&mut inner, id);
            operation
        };

        self.events.publish(GatewayEvent::JobCompleted {
            job_id: id,
            operation_type: operation,
            cache_hit,
        });
    }

    /// Record a failed attempt: requeue with backoff while attempts remain and
    /// the error is retryable, otherwise fail the job.
    pub fn fail_attempt(&self, id: JobId, error: ApiError) -> FailureDisposition {
        let mut inner = self.lock();
        let Some(record) = inner.jobs.get_mut(&id) else {
            return FailureDisposition::Failed;
        };
        let attempts = record.snapshot.attempts;
        let operation = record.snapshot.operation_type;
        let priority = record.snapshot.priority;
        let report = error.report();

        if self.retry.should_retry(&error, attempts) {
            let delay = self.retry.delay_for(&error, attempts);
            record.snapshot.status = JobStatus::Delayed;
            record.snapshot.error = Some(report.clone());
            record.publish();

            let seq = inner.next_seq;
            inner.next_seq += 1;
            let lane = inner.lane(operation);
            lane.active = lane.active.saturating_sub(1);
            lane.delayed.push((
                Instant::now() + delay,
                ReadyKey {
                    priority: priority.as_u8(),
                    seq,
                    id,
                },
            ));
            drop(inner);

            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            tracing::debug!(
                job_id = %id,
                attempt = attempts,
                delay_ms,
                code = report.code,
                "retry scheduled"
            );
            self.events.publish(GatewayEvent::JobRetryScheduled {
                job_id: id,
                attempt: attempts,
                delay_ms,
                error: report,
            });
            self.notify(operation);
            return FailureDisposition::Retrying { delay };
        }

        record.snapshot.status = JobStatus::Failed;
        record.snapshot.finished_at = Some(UtcDateTime::now());
        record.snapshot.error = Some(report.clone());
        record.publish();

        let lane = inner.lane(operation);
        lane.active = lane.active.saturating_sub(1);
        lane.failed += 1;
        self.finish_locked(&mut inner, id);
        drop(inner);

        tracing::warn!(
            job_id = %id,
            %operation,
            attempts,
            code = report.code,
            message = %report.message,
            "job failed"
        );
        self.events.publish(GatewayEvent::JobFailed {
            job_id: id,
            operation_type: operation,
            error: report,
        });
        FailureDisposition::Failed
    }

    /// Fail every job that has not started yet.
    pub fn abandon_pending(&self, reason: &str) -> usize {
        let report = ApiError::internal(reason.to_owned()).report();
        let now = UtcDateTime::now();
        let mut inner = self.lock();

        let mut pending = Vec::new();
        for (operation, lane) in &mut inner.lanes {
            let abandoned = lane.ready.len() + lane.delayed.len();
            pending.extend(lane.ready.drain().map(|key| key.id));
            pending.extend(lane.delayed.drain(..).map(|(_, key)| key.id));
            lane.failed += abandoned as u64;
            if abandoned > 0 {
                tracing::warn!(%operation, abandoned, "abandoning queued jobs");
            }
        }

        for id in &pending {
            if let Some(record) = inner.jobs.get_mut(id) {
                record.snapshot.status = JobStatus::Failed;
                record.snapshot.finished_at = Some(now);
                record.snapshot.error = Some(report.clone());
                record.publish();
            }
            self.finish_locked(&mut inner, *id);
        }
        pending.len()
    }

    pub fn snapshot(&self, id: JobId) -> Option<JobSnapshot> {
        self.lock()
            .jobs
            .get(&id)
            .map(|record| record.snapshot.clone())
    }

    pub fn stats(&self) -> Vec<QueueStats> {
        let inner = self.lock();
        OperationType::ALL
            .into_iter()
            .map(|operation| {
                let lane = inner.lanes.get(&operation);
                QueueStats {
                    operation_type: operation,
                    waiting: lane.map_or(0, |lane| lane.ready.len()),
                    active: lane.map_or(0, |lane| lane.active),
                    completed: lane.map_or(0, |lane| lane.completed),
                    failed: lane.map_or(0, |lane| lane.failed),
                    delayed: lane.map_or(0, |lane| lane.delayed.len()),
                }
            })
            .collect()
    }

    /// Time until the earliest delayed job of `operation` becomes ready.
    pub fn next_due_in(&self, operation: OperationType) -> Option<Duration> {
        let inner = self.lock();
        let due = inner.lanes.get(&operation)?.next_due()?;
        Some(due.saturating_duration_since(Instant::now()))
    }

    pub(crate) fn notifier(&self, operation: OperationType) -> Arc<Notify> {
        self.notifiers
            .get(&operation)
            .map(Arc::clone)
            .unwrap_or_else(|| Arc::new(Notify::new()))
    }

    fn notify(&self, operation: OperationType) {
        if let Some(notify) = self.notifiers.get(&operation) {
            notify.notify_one();
        }
    }

    /// Track a finished job and prune the oldest beyond retention.
    fn finish_locked(&self, inner: &mut QueueInner, id: JobId) {
        let now = Instant::now();
        inner.finished.push_back((id, now));
        while let Some((oldest, finished_at)) = inner.finished.front().copied() {
            let too_many = inner.finished.len() > self.retention.max_finished_jobs;
            let too_old = now.duration_since(finished_at) > self.retention.max_age;
            if !too_many && !too_old {
                break;
            }
            inner.finished.pop_front();
            inner.jobs.remove(&oldest);
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner
            .lock()
            .expect("job queue mutex should not be poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Page, Priority, ResourceBatch, ResourceIds, SearchParams, VideoStats,
    };
    use crate::quota::{DailyReset, QuotaState};

    fn queue_with_budget(used: u64, budget: u64) -> JobQueue {
        let reset_at = DailyReset::default().next_after(UtcDateTime::now());
        let ledger = Arc::new(QuotaLedger::from_state(QuotaState {
            used_units: used,
            daily_budget: budget,
            reset_at,
        }));
        JobQueue::new(ledger, EventBus::default())
            .with_retry_policy(RetryPolicy::fixed(Duration::ZERO, 3))
    }

    fn stats_job(ids: &[&str]) -> JobRequest {
        JobRequest::new(JobParams::VideoStats(
            ResourceIds::new(ids.iter().copied()).expect("ids"),
        ))
    }

    fn search_job(query: &str, priority: Priority) -> JobRequest {
        JobRequest::new(JobParams::Search(SearchParams::new(query))).with_priority(priority)
    }

    fn lane_stats(queue: &JobQueue, operation: OperationType) -> QueueStats {
        queue
            .stats()
            .into_iter()
            .find(|stats| stats.operation_type == operation)
            .expect("every operation has a lane")
    }

    fn claimed_ids(claim: &Claim) -> Vec<JobId> {
        claim.jobs.iter().map(|job| job.id).collect()
    }

    #[test]
    fn rejected_enqueue_creates_no_job() {
        let queue = queue_with_budget(9_950, 10_000);
        let error = queue
            .enqueue(search_job("rust", Priority::Normal))
            .expect_err("over budget");

        assert_eq!(error.code(), "quota.exceeded");
        assert!(error.retry_after().is_some());
        assert!(queue.stats().iter().all(|s| s.waiting == 0 && s.delayed == 0));
        assert!(queue.lock().jobs.is_empty());
    }

    #[test]
    fn invalid_params_are_rejected_before_queueing() {
        let queue = queue_with_budget(0, 10_000);
        let error = queue
            .enqueue(search_job("   ", Priority::Normal))
            .expect_err("invalid");
        assert_eq!(error.code(), "request.invalid");
        assert!(queue.lock().jobs.is_empty());
    }

    #[test]
    fn claims_follow_priority_then_fifo() {
        let queue = queue_with_budget(0, 10_000);
        let normal_a = queue.enqueue(search_job("a", Priority::Normal)).expect("a").id();
        let normal_b = queue.enqueue(search_job("b", Priority::Normal)).expect("b").id();
        let critical = queue.enqueue(search_job("c", Priority::Critical)).expect("c").id();

        let order: Vec<JobId> = std::iter::from_fn(|| queue.claim_next(OperationType::Search))
            .flat_map(|claim| claimed_ids(&claim))
            .collect();
        assert_eq!(order, vec![critical, normal_a, normal_b]);
    }

    #[test]
    fn lowest_priority_jobs_wait_before_becoming_ready() {
        let queue = queue_with_budget(0, 10_000);
        let handle = queue.enqueue(search_job("later", Priority::Low)).expect("low");

        assert_eq!(handle.snapshot().status, JobStatus::Delayed);
        assert!(queue.claim_next(OperationType::Search).is_none());
        assert!(queue.next_due_in(OperationType::Search).is_some());
    }

    #[test]
    fn batched_lookups_of_one_owner_are_coalesced() {
        let queue = queue_with_budget(0, 10_000);
        let first = queue.enqueue(stats_job(&["a", "b"])).expect("first").id();
        let second = queue.enqueue(stats_job(&["a", "c"])).expect("second").id();
        let other_owner = queue
            .enqueue(stats_job(&["a"]).with_owner("someone-else"))
            .expect("third")
            .id();

        let claim = queue.claim_next(OperationType::VideoStats).expect("claim");
        assert_eq!(claimed_ids(&claim), vec![first, second]);
        assert_eq!(claim.jobs[0].attempt, 1);

        let rest = queue.claim_next(OperationType::VideoStats).expect("claim");
        assert_eq!(claimed_ids(&rest), vec![other_owner]);
    }

    #[test]
    fn coalescing_stops_at_the_provider_chunk_size() {
        let queue = queue_with_budget(0, 10_000);
        let wide: Vec<String> = (0..45).map(|n| format!("v{n}")).collect();
        let narrow: Vec<String> = (100..110).map(|n| format!("v{n}")).collect();
        queue
            .enqueue(JobRequest::new(JobParams::VideoStats(ResourceIds::new(wide).expect("ids"))))
            .expect("wide");
        queue
            .enqueue(JobRequest::new(JobParams::VideoStats(ResourceIds::new(narrow).expect("ids"))))
            .expect("narrow");

        let claim = queue.claim_next(OperationType::VideoStats).expect("claim");
        assert_eq!(claim.jobs.len(), 1);
    }

    #[test]
    fn retryable_failures_requeue_until_attempts_run_out() {
        let queue = queue_with_budget(0, 10_000);
        let handle = queue.enqueue(stats_job(&["a"])).expect("job");
        let error = ApiError::upstream(503, "backend error");

        for attempt in 1..=3 {
            let claim = queue.claim_next(OperationType::VideoStats).expect("claim");
            assert_eq!(claim.jobs[0].attempt, attempt);
            let disposition = queue.fail_attempt(handle.id(), error.clone());
            if attempt < 3 {
                assert_eq!(disposition, FailureDisposition::Retrying { delay: Duration::ZERO });
            } else {
                assert_eq!(disposition, FailureDisposition::Failed);
            }
        }

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.attempts, 3);
        assert!(queue.claim_next(OperationType::VideoStats).is_none());
        let stats = lane_stats(&queue, OperationType::VideoStats);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.active, 0);
    }

    #[test]
    fn non_retryable_failures_fail_immediately() {
        let queue = queue_with_budget(0, 10_000);
        let handle = queue.enqueue(stats_job(&["a"])).expect("job");
        queue.claim_next(OperationType::VideoStats).expect("claim");

        let disposition = queue.fail_attempt(handle.id(), ApiError::upstream(404, "not found"));
        assert_eq!(disposition, FailureDisposition::Failed);
        assert_eq!(handle.snapshot().attempts, 1);
    }

    #[tokio::test]
    async fn completion_resolves_the_handle() {
        let queue = queue_with_budget(0, 10_000);
        let handle = queue.enqueue(stats_job(&["a"])).expect("job");
        let claim = queue.claim_next(OperationType::VideoStats).expect("claim");

        let output = JobOutput::VideoStats(ResourceBatch::<VideoStats> {
            items: Vec::new(),
            missing: vec![String::from("a")],
        });
        queue.complete(claim.jobs[0].id, output.clone(), false);

        assert_eq!(handle.wait().await.expect("completed"), output);
    }

    #[test]
    fn finished_jobs_are_pruned_beyond_retention() {
        let queue = queue_with_budget(0, 10_000).with_retention(RetentionPolicy {
            max_finished_jobs: 1,
            max_age: Duration::from_secs(60),
        });
        let first = queue.enqueue(search_job("a", Priority::Normal)).expect("a").id();
        let second = queue.enqueue(search_job("b", Priority::Normal)).expect("b").id();

        for _ in 0..2 {
            let claim = queue.claim_next(OperationType::Search).expect("claim");
            queue.complete(claim.jobs[0].id, JobOutput::Search(Page::empty()), false);
        }

        assert!(queue.snapshot(first).is_none());
        assert!(queue.snapshot(second).is_some());
        assert_eq!(lane_stats(&queue, OperationType::Search).completed, 2);
    }
}
