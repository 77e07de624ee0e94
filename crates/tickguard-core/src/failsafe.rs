//! Portfolio drawdown fail-safe.
//!
//! One [`FailSafeMonitor`] per process, shared behind an `Arc`. Valuation
//! updates track the running peak; once `(peak - current) / peak` reaches the
//! halt threshold the monitor halts inside that same update, and every trade
//! entry point fails with [`FailSafeError::EmergencyHalt`] until an
//! authenticated operator resets it.
//!
//! A poisoned state lock is reported as a halt. The monitor never answers
//! "permitted" when it cannot read its own state.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use crate::retry::Retryable;
use crate::{UtcDateTime, ValidationError};

const AUDIT_CAPACITY: usize = 64;
const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailSafeError {
    #[error("emergency halt: {reason}")]
    EmergencyHalt {
        reason: String,
        halted_at: Option<UtcDateTime>,
    },
    #[error("reset rejected: {reason}")]
    Unauthorized { reason: String },
    #[error("manual reset is disabled: no admin token configured")]
    ResetDisabled,
    #[error("fail-safe is armed; nothing to reset")]
    NotHalted,
    #[error(transparent)]
    InvalidValuation(#[from] ValidationError),
}

impl FailSafeError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::EmergencyHalt { .. } => "failsafe.emergency_halt",
            Self::Unauthorized { .. } => "failsafe.unauthorized",
            Self::ResetDisabled => "failsafe.reset_disabled",
            Self::NotHalted => "failsafe.not_halted",
            Self::InvalidValuation(_) => "failsafe.invalid_valuation",
        }
    }

    pub const fn is_halt(&self) -> bool {
        matches!(self, Self::EmergencyHalt { .. })
    }
}

impl Retryable for FailSafeError {
    fn is_retryable(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorStatus {
    Armed,
    Halted,
}

/// Loss recorded at the moment the monitor halted. Survives resets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HaltRecord {
    pub halted_at: UtcDateTime,
    pub peak: Decimal,
    pub valuation: Decimal,
    pub drawdown_pct: Decimal,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Halt,
    Reset,
    ResetRejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    pub at: UtcDateTime,
    pub action: AuditAction,
    pub operator: Option<String>,
    pub detail: String,
}

/// Operator credentials and note for a manual reset.
#[derive(Clone)]
pub struct ResetRequest {
    pub operator: String,
    pub token: String,
    pub note: Option<String>,
}

impl ResetRequest {
    pub fn new(operator: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            token: token.into(),
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

impl std::fmt::Debug for ResetRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResetRequest")
            .field("operator", &self.operator)
            .field("token", &"<redacted>")
            .field("note", &self.note)
            .finish()
    }
}

/// Point-in-time view for dashboards and the `drawdown` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrawdownSnapshot {
    pub status: MonitorStatus,
    pub peak: Decimal,
    pub current: Decimal,
    pub drawdown_pct: Decimal,
    pub halt_threshold_pct: Decimal,
    pub max_drawdown_pct: Decimal,
    pub halted_at: Option<UtcDateTime>,
    pub halt_reason: Option<String>,
    pub last_halt: Option<HaltRecord>,
    pub audit: Vec<AuditEntry>,
}

#[derive(Debug, Default)]
struct DrawdownState {
    peak: Decimal,
    current: Decimal,
    max_drawdown: Decimal,
    halted: bool,
    halted_at: Option<UtcDateTime>,
    halt_reason: Option<String>,
    last_halt: Option<HaltRecord>,
    audit: VecDeque<AuditEntry>,
}

impl DrawdownState {
    fn drawdown(&self) -> Decimal {
        if self.peak <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        ((self.peak - self.current) / self.peak).max(Decimal::ZERO)
    }

    fn record(&mut self, action: AuditAction, operator: Option<String>, detail: String) {
        if self.audit.len() == AUDIT_CAPACITY {
            self.audit.pop_front();
        }
        self.audit.push_back(AuditEntry {
            at: UtcDateTime::now(),
            action,
            operator,
            detail,
        });
    }

    fn halt_error(&self) -> FailSafeError {
        FailSafeError::EmergencyHalt {
            reason: self
                .halt_reason
                .clone()
                .unwrap_or_else(|| String::from("trading halted")),
            halted_at: self.halted_at,
        }
    }
}

#[derive(Debug)]
pub struct FailSafeMonitor {
    /// Fraction in `(0, 1]`; 10% is stored as `0.10`.
    halt_threshold: Decimal,
    admin_token: Option<String>,
    state: Mutex<DrawdownState>,
}

impl FailSafeMonitor {
    /// Create an armed monitor halting at `threshold_pct` percent drawdown.
    pub fn new(threshold_pct: Decimal) -> Result<Self, ValidationError> {
        if threshold_pct <= Decimal::ZERO || threshold_pct > HUNDRED {
            return Err(ValidationError::NonPositiveValue {
                field: "halt_threshold_pct",
                value: threshold_pct.to_string(),
            });
        }
        Ok(Self {
            halt_threshold: threshold_pct / HUNDRED,
            admin_token: None,
            state: Mutex::new(DrawdownState::default()),
        })
    }

    /// Token an operator must present to reset a halt. Without one, halts
    /// are permanent for the life of the process.
    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.admin_token = (!token.is_empty()).then_some(token);
        self
    }

    pub fn halt_threshold_pct(&self) -> Decimal {
        (self.halt_threshold * HUNDRED).normalize()
    }

    /// Feed the latest portfolio valuation.
    ///
    /// Raises the peak when exceeded and halts synchronously when the
    /// drawdown reaches the threshold. Returns the resulting status.
    pub fn update_valuation(&self, valuation: Decimal) -> Result<MonitorStatus, FailSafeError> {
        if valuation < Decimal::ZERO {
            return Err(ValidationError::NegativeValue {
                field: "valuation",
                value: valuation.to_string(),
            }
            .into());
        }

        let mut state = self.lock()?;
        state.current = valuation;
        if valuation > state.peak {
            state.peak = valuation;
        }

        let drawdown = state.drawdown();
        if drawdown > state.max_drawdown {
            state.max_drawdown = drawdown;
        }

        if state.halted {
            return Ok(MonitorStatus::Halted);
        }

        if drawdown >= self.halt_threshold {
            let drawdown_pct = as_pct(drawdown);
            let reason = format!(
                "portfolio drawdown {drawdown_pct}% reached threshold {}% (peak {}, valuation {})",
                self.halt_threshold_pct(),
                state.peak,
                valuation
            );
            let halted_at = UtcDateTime::now();

            state.halted = true;
            state.halted_at = Some(halted_at);
            state.halt_reason = Some(reason.clone());
            state.last_halt = Some(HaltRecord {
                halted_at,
                peak: state.peak,
                valuation,
                drawdown_pct,
                reason: reason.clone(),
            });
            state.record(AuditAction::Halt, None, reason);

            tracing::error!(
                peak = %state.peak,
                valuation = %valuation,
                drawdown_pct = %drawdown_pct,
                threshold_pct = %self.halt_threshold_pct(),
                "failsafe.halt"
            );
            return Ok(MonitorStatus::Halted);
        }

        Ok(MonitorStatus::Armed)
    }

    /// Gate for every trade-initiating operation.
    ///
    /// # Errors
    ///
    /// [`FailSafeError::EmergencyHalt`] while halted or when the state lock
    /// is poisoned.
    pub fn check_permitted(&self) -> Result<(), FailSafeError> {
        let state = self.lock()?;
        if state.halted {
            return Err(state.halt_error());
        }
        Ok(())
    }

    /// Run `operation` only if trading is permitted.
    ///
    /// The halt check happens before `operation` is even constructed, so a
    /// halted monitor never lets a network or ledger call start.
    pub async fn guard<T, F, Fut>(&self, operation: F) -> Result<T, FailSafeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Err(error) = self.check_permitted() {
            tracing::warn!(code = error.code(), "failsafe.blocked");
            return Err(error);
        }
        Ok(operation().await)
    }

    pub fn status(&self) -> MonitorStatus {
        match self.check_permitted() {
            Ok(()) => MonitorStatus::Armed,
            Err(_) => MonitorStatus::Halted,
        }
    }

    /// Clear a halt after checking operator credentials.
    ///
    /// The peak is re-baselined to the current valuation so the next update
    /// does not immediately halt again. The recorded loss is kept in
    /// [`DrawdownSnapshot::last_halt`] and `max_drawdown_pct`.
    pub fn reset(&self, request: ResetRequest) -> Result<DrawdownSnapshot, FailSafeError> {
        let Some(expected) = self.admin_token.as_deref() else {
            return Err(FailSafeError::ResetDisabled);
        };

        // A reset is the one path allowed to recover a poisoned lock.
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                self.state.clear_poison();
                let mut guard = poisoned.into_inner();
                guard.halted = true;
                guard
                    .halt_reason
                    .get_or_insert_with(|| String::from("fail-safe state lock was poisoned"));
                guard
            }
        };

        let operator = request.operator.trim().to_owned();
        let rejection = if operator.is_empty() {
            Some("operator name is required")
        } else if !constant_time_eq(request.token.as_bytes(), expected.as_bytes()) {
            Some("admin token does not match")
        } else {
            None
        };

        if let Some(reason) = rejection {
            state.record(
                AuditAction::ResetRejected,
                (!operator.is_empty()).then(|| operator.clone()),
                String::from(reason),
            );
            tracing::warn!(operator = %operator, reason, "failsafe.reset_rejected");
            return Err(FailSafeError::Unauthorized {
                reason: String::from(reason),
            });
        }

        if !state.halted {
            return Err(FailSafeError::NotHalted);
        }

        state.halted = false;
        state.halted_at = None;
        state.halt_reason = None;
        state.peak = state.current;

        let detail = match &request.note {
            Some(note) => format!("re-armed at valuation {}: {note}", state.current),
            None => format!("re-armed at valuation {}", state.current),
        };
        state.record(AuditAction::Reset, Some(operator.clone()), detail);
        tracing::warn!(operator = %operator, valuation = %state.current, "failsafe.reset");

        Ok(self.snapshot_of(&state))
    }

    pub fn snapshot(&self) -> Result<DrawdownSnapshot, FailSafeError> {
        let state = self.lock()?;
        Ok(self.snapshot_of(&state))
    }

    fn snapshot_of(&self, state: &DrawdownState) -> DrawdownSnapshot {
        DrawdownSnapshot {
            status: if state.halted {
                MonitorStatus::Halted
            } else {
                MonitorStatus::Armed
            },
            peak: state.peak,
            current: state.current,
            drawdown_pct: as_pct(state.drawdown()),
            halt_threshold_pct: self.halt_threshold_pct(),
            max_drawdown_pct: as_pct(state.max_drawdown),
            halted_at: state.halted_at,
            halt_reason: state.halt_reason.clone(),
            last_halt: state.last_halt.clone(),
            audit: state.audit.iter().cloned().collect(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, DrawdownState>, FailSafeError> {
        self.state.lock().map_err(|_| {
            tracing::error!("failsafe.lock_poisoned");
            FailSafeError::EmergencyHalt {
                reason: String::from("fail-safe state lock is poisoned"),
                halted_at: None,
            }
        })
    }
}

fn as_pct(fraction: Decimal) -> Decimal {
    (fraction * HUNDRED).round_dp(4).normalize()
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter()
        .zip(right)
        .fold(0_u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
