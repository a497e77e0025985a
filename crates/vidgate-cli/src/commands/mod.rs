mod history;
mod job;
mod quota;

use std::sync::Arc;

use serde_json::Value;
use vidgate_core::{Gateway, GatewayBuilder, GatewayConfig, GatewayError, PersistentQuotaStore};
use vidgate_store::{LedgerStore, StoreConfig};

use crate::cli::{Cli, Command};
use crate::error::CliError;

/// Ledger row shared by every CLI invocation.
const LEDGER_ID: &str = "default";

/// What a command printed, plus the error to exit with after printing.
pub struct CommandOutcome {
    pub output: Value,
    pub failure: Option<CliError>,
}

impl CommandOutcome {
    pub fn ok(output: Value) -> Self {
        Self {
            output,
            failure: None,
        }
    }

    pub fn failed(output: Value, failure: CliError) -> Self {
        Self {
            output,
            failure: Some(failure),
        }
    }
}

pub async fn run(cli: &Cli) -> Result<CommandOutcome, CliError> {
    match &cli.command {
        Command::Quota => {
            let context = Context::open(cli)?;
            quota::run(&context)
        }
        Command::History(args) => {
            let context = Context::open(cli)?;
            history::run(args, &context)
        }
        command => {
            let request = job::build_request(command, cli)?;
            let context = Context::open(cli)?;
            job::run(request, &context).await
        }
    }
}

/// Gateway plus the store backing it, unless `--no-store` was given.
pub struct Context {
    pub gateway: Gateway,
    pub store: Option<LedgerStore>,
}

impl Context {
    fn open(cli: &Cli) -> Result<Self, CliError> {
        let config = GatewayConfig::from_env().map_err(GatewayError::from)?;
        if cli.no_store {
            return Ok(Self {
                gateway: GatewayBuilder::new(config).build()?,
                store: None,
            });
        }

        let store_config = match &config.home {
            Some(home) => StoreConfig::for_home(home),
            None => StoreConfig::default(),
        };
        let store = LedgerStore::open(store_config)?;
        tracing::debug!(db = %store.db_path().display(), "using persistent quota ledger");
        let gateway = GatewayBuilder::new(config)
            .with_quota_store(Arc::new(PersistentQuotaStore::new(store.clone(), LEDGER_ID)))
            .build()?;

        Ok(Self {
            gateway,
            store: Some(store),
        })
    }
}
