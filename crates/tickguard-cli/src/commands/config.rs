use std::env;

use serde::Serialize;
use tickguard_core::config::CONFIG_PATH_ENV;
use tickguard_core::TickguardConfig;

use crate::cli::Cli;
use crate::error::CliError;

use super::CommandResult;

#[derive(Debug, Serialize)]
struct ConfigResponseData<'a> {
    /// Where the configuration came from: a file path or `defaults`.
    origin: String,
    admin_token_configured: bool,
    config: &'a TickguardConfig,
}

pub fn run(cli: &Cli, config: &TickguardConfig) -> Result<CommandResult, CliError> {
    let origin = cli
        .config
        .as_ref()
        .map(|path| path.display().to_string())
        .or_else(|| env::var(CONFIG_PATH_ENV).ok().filter(|path| !path.is_empty()))
        .unwrap_or_else(|| String::from("defaults"));

    let admin_token_configured = env::var(&config.failsafe.admin_token_env)
        .map(|token| !token.trim().is_empty())
        .unwrap_or(false);

    let mut warnings = Vec::new();
    if !admin_token_configured {
        warnings.push(format!(
            "{} is not set; a fail-safe halt cannot be reset",
            config.failsafe.admin_token_env
        ));
    }

    let data = serde_json::to_value(ConfigResponseData {
        origin,
        admin_token_configured,
        config,
    })?;
    Ok(CommandResult::ok(data).with_warnings(warnings))
}
