mod config;
mod drawdown;
mod resolve;
mod sources;

use serde_json::Value;
use tickguard_core::{ProviderId, TickguardConfig, UtcDateTime};

use crate::cli::{Cli, Command};
use crate::error::CliError;
use crate::output::{Envelope, ErrorView, Meta, Outcome};

pub struct CommandResult {
    pub data: Value,
    pub outcome: Outcome,
    pub warnings: Vec<String>,
    pub errors: Vec<ErrorView>,
    pub latency_ms: u64,
    pub cache_hit: bool,
    pub source_chain: Vec<ProviderId>,
}

impl CommandResult {
    pub fn ok(data: Value) -> Self {
        Self {
            data,
            outcome: Outcome::Ok,
            warnings: Vec::new(),
            errors: Vec::new(),
            latency_ms: 0,
            cache_hit: false,
            source_chain: Vec::new(),
        }
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    pub fn with_errors(mut self, errors: Vec<ErrorView>) -> Self {
        self.errors.extend(errors);
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_cache_hit(mut self, cache_hit: bool) -> Self {
        self.cache_hit = cache_hit;
        self
    }

    pub fn with_source_chain(mut self, source_chain: Vec<ProviderId>) -> Self {
        self.source_chain = source_chain;
        self
    }
}

pub async fn run(cli: &Cli, config: &TickguardConfig) -> Result<Envelope, CliError> {
    let result = match &cli.command {
        Command::Resolve(args) => resolve::run(args, config).await?,
        Command::Sources => sources::run(config)?,
        Command::Config => config::run(cli, config)?,
        Command::Drawdown(args) => drawdown::run(args, config).await?,
    };

    let CommandResult {
        data,
        outcome,
        warnings,
        errors,
        latency_ms,
        cache_hit,
        source_chain,
    } = result;

    Ok(Envelope {
        meta: Meta {
            generated_at: UtcDateTime::now(),
            outcome,
            source_chain,
            latency_ms,
            cache_hit,
            warnings,
        },
        data,
        errors,
    })
}
