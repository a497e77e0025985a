use thiserror::Error;
use vidgate_core::{ApiError, GatewayError};
use vidgate_store::StoreError;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Validation(#[from] vidgate_core::ValidationError),

    /// The gateway refused the job before queuing it.
    #[error("job rejected: {0}")]
    Rejected(ApiError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("job {job_id} failed: {message} ({code})")]
    JobFailed {
        job_id: String,
        code: &'static str,
        message: String,
    },

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) => 2,
            Self::Rejected(_) => 2,
            Self::Gateway(GatewayError::Config(_)) => 2,
            Self::JobFailed { .. } => 3,
            Self::Serialization(_) => 4,
            Self::Gateway(_) => 10,
            Self::Store(_) => 10,
            Self::Io(_) => 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_and_failures_use_distinct_exit_codes() {
        let rejected = CliError::Rejected(ApiError::quota_exceeded("daily quota exhausted"));
        let failed = CliError::JobFailed {
            job_id: String::from("job"),
            code: "upstream.error",
            message: String::from("boom"),
        };
        let io = CliError::Io(std::io::Error::other("disk"));

        assert_eq!(rejected.exit_code(), 2);
        assert_eq!(failed.exit_code(), 3);
        assert_eq!(io.exit_code(), 10);
    }
}
