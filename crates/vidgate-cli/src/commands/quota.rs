use serde::Serialize;
use vidgate_core::{QueueStats, QuotaSnapshot};

use crate::error::CliError;

use super::{CommandOutcome, Context};

#[derive(Debug, Serialize)]
struct QuotaEnvelope {
    quota: QuotaSnapshot,
    queues: Vec<QueueStats>,
    persistent: bool,
}

pub fn run(context: &Context) -> Result<CommandOutcome, CliError> {
    let output = serde_json::to_value(QuotaEnvelope {
        quota: context.gateway.quota(),
        queues: context.gateway.queue_stats(),
        persistent: context.store.is_some(),
    })?;
    Ok(CommandOutcome::ok(output))
}
