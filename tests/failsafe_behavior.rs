//! Behavior-driven tests for the drawdown fail-safe.
//!
//! A halted monitor must block every trade entry point until an operator
//! resets it, and must never silently fail open.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rust_decimal_macros::dec;
use tickguard_core::{
    AuditAction, FailSafeError, FailSafeMonitor, MonitorStatus, ResetRequest, TickguardConfig,
};

const ADMIN_TOKEN: &str = "correct-horse-battery-staple";

fn armed_monitor() -> Arc<FailSafeMonitor> {
    Arc::new(
        FailSafeMonitor::new(dec!(10))
            .expect("valid threshold")
            .with_admin_token(ADMIN_TOKEN),
    )
}

#[tokio::test]
async fn twelve_percent_drop_halts_and_every_trade_fails_until_reset() {
    // Given: a monitor with a 10% threshold and a 100,000 peak
    let monitor = armed_monitor();
    assert_eq!(
        monitor.update_valuation(dec!(100000)).expect("valid"),
        MonitorStatus::Armed
    );

    // When: the portfolio drops to 88,000
    let status = monitor.update_valuation(dec!(88000)).expect("valid");

    // Then: the monitor is halted synchronously
    assert_eq!(status, MonitorStatus::Halted);

    // And: every trade entry point fails with an emergency halt before running
    let executed = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let counter = Arc::clone(&executed);
        let outcome = monitor
            .guard(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        let error = outcome.expect_err("trading is halted");
        assert!(error.is_halt());
        assert_eq!(error.code(), "failsafe.emergency_halt");
    }
    assert_eq!(executed.load(Ordering::SeqCst), 0, "no trade may start");

    // And: a recovery in valuation alone does not re-arm the monitor
    monitor.update_valuation(dec!(101000)).expect("valid");
    assert!(monitor.check_permitted().is_err());

    // When: an operator resets with the admin token
    let snapshot = monitor
        .reset(ResetRequest::new("ops-oncall", ADMIN_TOKEN).with_note("post-mortem filed"))
        .expect("reset accepted");

    // Then: trading is permitted again and the recorded loss is kept
    assert_eq!(snapshot.status, MonitorStatus::Armed);
    assert!(monitor.check_permitted().is_ok());
    let halt = snapshot.last_halt.expect("halt is on record");
    assert_eq!(halt.peak, dec!(100000));
    assert_eq!(halt.valuation, dec!(88000));
    assert_eq!(halt.drawdown_pct, dec!(12));
    assert!(snapshot.max_drawdown_pct >= dec!(12));
}

#[tokio::test]
async fn drawdown_just_below_threshold_stays_armed() {
    // Given: a 10% threshold and a 100,000 peak
    let monitor = armed_monitor();
    monitor.update_valuation(dec!(100000)).expect("valid");

    // When: the portfolio falls 9.99%
    let status = monitor.update_valuation(dec!(90010)).expect("valid");

    // Then: trading is still permitted
    assert_eq!(status, MonitorStatus::Armed);
    assert!(monitor.guard(|| async { 42 }).await.is_ok());

    // And: exactly 10% halts
    assert_eq!(
        monitor.update_valuation(dec!(90000)).expect("valid"),
        MonitorStatus::Halted
    );
}

#[tokio::test]
async fn reset_with_wrong_token_is_rejected_and_audited() {
    // Given: a halted monitor
    let monitor = armed_monitor();
    monitor.update_valuation(dec!(100000)).expect("valid");
    monitor.update_valuation(dec!(50000)).expect("valid");

    // When: someone resets with the wrong token
    let error = monitor
        .reset(ResetRequest::new("intruder", "guess"))
        .expect_err("wrong token");

    // Then: the reset is refused and the monitor stays halted
    assert!(matches!(error, FailSafeError::Unauthorized { .. }));
    assert_eq!(monitor.status(), MonitorStatus::Halted);

    // And: the attempt appears in the audit log
    let snapshot = monitor.snapshot().expect("snapshot");
    let actions = snapshot
        .audit
        .iter()
        .map(|entry| entry.action)
        .collect::<Vec<_>>();
    assert_eq!(actions, vec![AuditAction::Halt, AuditAction::ResetRejected]);
}

#[tokio::test]
async fn monitor_without_admin_token_cannot_be_reset() {
    // Given: a monitor built without an admin token
    let monitor = FailSafeMonitor::new(dec!(10)).expect("valid threshold");
    monitor.update_valuation(dec!(100)).expect("valid");
    monitor.update_valuation(dec!(80)).expect("valid");

    // When: a reset is attempted
    let error = monitor
        .reset(ResetRequest::new("ops", "anything"))
        .expect_err("reset disabled");

    // Then: the halt stands
    assert_eq!(error, FailSafeError::ResetDisabled);
    assert!(monitor.check_permitted().is_err());
}

#[tokio::test]
async fn halt_is_visible_to_every_task_sharing_the_monitor() {
    // Given: trade tasks sharing one monitor
    let monitor = armed_monitor();
    monitor.update_valuation(dec!(100000)).expect("valid");

    // When: one task reports a breaching valuation
    let reporter = Arc::clone(&monitor);
    tokio::spawn(async move { reporter.update_valuation(dec!(85000)) })
        .await
        .expect("task joins")
        .expect("valid valuation");

    // Then: every other task is blocked
    let mut handles = Vec::new();
    for _ in 0..8 {
        let monitor = Arc::clone(&monitor);
        handles.push(tokio::spawn(async move {
            monitor.guard(|| async { "order placed" }).await
        }));
    }
    for handle in handles {
        let outcome = handle.await.expect("task joins");
        assert!(matches!(outcome, Err(FailSafeError::EmergencyHalt { .. })));
    }
}

#[test]
fn configured_threshold_builds_the_monitor() {
    // Given: a config with a 15% halt threshold
    let config = TickguardConfig::from_toml_str(
        r#"
        [failsafe]
        halt_threshold_pct = 15
        admin_token_env = "TICKGUARD_TEST_UNSET_ADMIN_TOKEN"
        "#,
    )
    .expect("config parses");

    // When: the monitor is built from it
    let monitor = config.failsafe.monitor().expect("monitor builds");

    // Then: the threshold is carried over exactly
    assert_eq!(monitor.halt_threshold_pct(), dec!(15));
}
