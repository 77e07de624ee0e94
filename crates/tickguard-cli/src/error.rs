use thiserror::Error;
use tickguard_core::{ConfigError, FailSafeError, ValidationError};

/// CLI-level error categories mapped to exit codes.
///
/// Degraded and unavailable prices are not errors here: they are rendered
/// and reported through [`crate::output::Outcome`].
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    FailSafe(#[from] FailSafeError),

    #[error("command error: {0}")]
    Command(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) | Self::Config(_) | Self::Command(_) => 2,
            Self::FailSafe(FailSafeError::EmergencyHalt { .. }) => 6,
            Self::FailSafe(_) => 7,
            Self::Serialization(_) => 5,
            Self::Io(_) => 10,
        }
    }
}
