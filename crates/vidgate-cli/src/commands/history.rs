use serde::Serialize;
use vidgate_store::JobLogRecord;

use crate::cli::HistoryArgs;
use crate::error::CliError;

use super::{CommandOutcome, Context};

#[derive(Debug, Serialize)]
struct HistoryEnvelope {
    jobs: Vec<JobLogRecord>,
}

pub fn run(args: &HistoryArgs, context: &Context) -> Result<CommandOutcome, CliError> {
    let jobs = match &context.store {
        Some(store) => store.recent_job_log(args.limit)?,
        None => {
            tracing::warn!("history is unavailable with --no-store");
            Vec::new()
        }
    };
    Ok(CommandOutcome::ok(serde_json::to_value(HistoryEnvelope { jobs })?))
}
