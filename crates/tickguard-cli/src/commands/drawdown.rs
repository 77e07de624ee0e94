use std::env;

use rust_decimal::Decimal;
use serde::Serialize;
use tickguard_core::{
    DrawdownSnapshot, FailSafeError, FailSafeMonitor, MonitorStatus, ResetRequest,
    TickguardConfig,
};

use crate::cli::DrawdownArgs;
use crate::error::CliError;
use crate::output::{ErrorView, Outcome};

use super::CommandResult;

/// Environment variable holding the token an operator presents on reset.
pub const RESET_TOKEN_ENV: &str = "TICKGUARD_RESET_TOKEN";

#[derive(Debug, Serialize)]
struct DrawdownResponseData {
    steps: Vec<StepView>,
    trade_permitted: bool,
    snapshot: DrawdownSnapshot,
}

#[derive(Debug, Serialize)]
struct StepView {
    valuation: Decimal,
    status: MonitorStatus,
}

pub async fn run(args: &DrawdownArgs, config: &TickguardConfig) -> Result<CommandResult, CliError> {
    let mut failsafe = config.failsafe.clone();
    if let Some(threshold) = args.threshold {
        failsafe.halt_threshold_pct = threshold;
    }
    let monitor = failsafe.monitor()?;

    let steps = replay(&monitor, &args.valuations)?;

    if let Some(operator) = &args.reset_as {
        let token = env::var(RESET_TOKEN_ENV).unwrap_or_default();
        let mut request = ResetRequest::new(operator.as_str(), token);
        if let Some(note) = &args.note {
            request = request.with_note(note.as_str());
        }
        monitor.reset(request)?;
    }

    finish(&monitor, steps).await
}

fn replay(monitor: &FailSafeMonitor, valuations: &[Decimal]) -> Result<Vec<StepView>, CliError> {
    valuations
        .iter()
        .map(|&valuation| {
            let status = monitor.update_valuation(valuation)?;
            Ok(StepView { valuation, status })
        })
        .collect()
}

async fn finish(monitor: &FailSafeMonitor, steps: Vec<StepView>) -> Result<CommandResult, CliError> {
    let gate = monitor.guard(|| async {}).await;
    let snapshot = monitor.snapshot()?;

    let (outcome, errors) = match &gate {
        Ok(()) => (Outcome::Ok, Vec::new()),
        Err(error @ FailSafeError::EmergencyHalt { .. }) => (
            Outcome::Halted,
            vec![ErrorView {
                code: error.code().to_owned(),
                message: error.to_string(),
                provider: None,
                retryable: false,
            }],
        ),
        Err(other) => return Err(other.clone().into()),
    };

    let data = serde_json::to_value(DrawdownResponseData {
        steps,
        trade_permitted: gate.is_ok(),
        snapshot,
    })?;
    Ok(CommandResult::ok(data)
        .with_outcome(outcome)
        .with_errors(errors))
}
