//! Per-operation job queues and the workers that drain them.
//!
//! Jobs enter through [`JobQueue::enqueue`], which refuses work the daily
//! quota cannot cover. A [`WorkerPool`] runs one lane per operation type;
//! each lane claims jobs in priority order under its [`QueuePolicy`] and
//! hands them to the [`Dispatcher`].

mod dispatch;
mod job;
mod policy;
mod queue;
mod throttle;
mod worker;

pub use dispatch::Dispatcher;
pub use job::{JobHandle, JobId, JobRequest, JobSnapshot, JobStatus};
pub use policy::{QueuePolicies, QueuePolicy, RetentionPolicy};
pub use queue::{Claim, ClaimedJob, FailureDisposition, JobQueue, QueueStats};
pub use throttle::StartLimiter;
pub use worker::WorkerPool;
