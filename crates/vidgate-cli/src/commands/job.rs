use serde::Serialize;
use serde_json::Value;
use vidgate_core::{
    JobParams, JobRequest, JobSnapshot, JobStatus, PlaylistPage, Priority, QueueStats,
    QuotaSnapshot, ResourceIds, SearchOrder, SearchParams,
};
use vidgate_store::JobLogRecord;

use crate::cli::{Cli, Command};
use crate::error::CliError;

use super::{CommandOutcome, Context};

#[derive(Debug, Serialize)]
struct JobEnvelope {
    job: JobSnapshot,
    quota: QuotaSnapshot,
    queues: Vec<QueueStats>,
}

pub fn build_request(command: &Command, cli: &Cli) -> Result<JobRequest, CliError> {
    let params = match command {
        Command::Search(args) => {
            let mut params = SearchParams::new(args.query.trim());
            if let Some(max_results) = args.max_results {
                params = params.with_max_results(max_results);
            }
            if let Some(order) = &args.order {
                params = params.with_order(order.parse::<SearchOrder>()?);
            }
            if let Some(channel_id) = &args.channel_id {
                params = params.with_channel_id(channel_id.trim());
            }
            JobParams::Search(params)
        }
        Command::Videos(args) => JobParams::VideoDetails(ResourceIds::new(&args.ids)?),
        Command::Channels(args) => JobParams::ChannelDetails(ResourceIds::new(&args.ids)?),
        Command::Stats(args) => JobParams::VideoStats(ResourceIds::new(&args.ids)?),
        Command::Playlist(args) => {
            let mut page = PlaylistPage::new(args.playlist_id.trim());
            if let Some(token) = &args.page_token {
                page = page.with_page_token(token.trim());
            }
            if let Some(max_results) = args.max_results {
                page = page.with_max_results(max_results);
            }
            JobParams::PlaylistItems(page)
        }
        Command::Quota | Command::History(_) => {
            return Err(CliError::Rejected(vidgate_core::ApiError::internal(
                "command does not submit a job",
            )))
        }
    };
    params.validate()?;

    let mut request = JobRequest::new(params).with_priority(Priority::try_from(cli.priority)?);
    if let Some(owner) = &cli.owner {
        request = request.with_owner(owner.trim());
    }
    Ok(request)
}

/// Submit `request`, wait for it, record the outcome and print the envelope.
pub async fn run(request: JobRequest, context: &Context) -> Result<CommandOutcome, CliError> {
    let gateway = &context.gateway;
    gateway.start();

    let handle = match gateway.enqueue(request) {
        Ok(handle) => handle,
        Err(error) => {
            gateway.shutdown().await;
            return Err(CliError::Rejected(error));
        }
    };
    let job = handle.wait_snapshot().await;
    gateway.shutdown().await;

    if let Some(store) = &context.store {
        store.append_job_log(&log_record(&job))?;
    }

    let failure = match (&job.status, &job.error) {
        (JobStatus::Completed, _) => None,
        (_, Some(error)) => Some(CliError::JobFailed {
            job_id: job.id.to_string(),
            code: error.code,
            message: error.message.clone(),
        }),
        (status, None) => Some(CliError::JobFailed {
            job_id: job.id.to_string(),
            code: "internal",
            message: format!("job ended {status}"),
        }),
    };

    let output: Value = serde_json::to_value(JobEnvelope {
        job,
        quota: gateway.quota(),
        queues: gateway.queue_stats(),
    })?;

    Ok(match failure {
        Some(failure) => CommandOutcome::failed(output, failure),
        None => CommandOutcome::ok(output),
    })
}

fn log_record(job: &JobSnapshot) -> JobLogRecord {
    JobLogRecord {
        job_id: job.id.to_string(),
        operation_type: job.operation_type.as_str().to_owned(),
        owner_id: job.owner_id.clone(),
        status: job.status.as_str().to_owned(),
        attempts: i64::from(job.attempts),
        error_code: job.error.as_ref().map(|error| error.code.to_owned()),
        finished_at_unix: job
            .finished_at
            .unwrap_or_else(vidgate_core::UtcDateTime::now)
            .unix_timestamp(),
    }
}
