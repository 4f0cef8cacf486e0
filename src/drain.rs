//! Drain: take a running node out of service before it is upgraded.
//!
//! Maintenance on, scheduler stopped, queued work waited out or cleared,
//! process stopped. Any failure leaves the node where it is for manual
//! inspection; nothing here restarts a node.

use std::time::Duration;

use chrono::Utc;
use colored::Colorize;
use tracing::{info, warn};

use crate::error::{RpcError, Step, StepError};
use crate::prober::{self, MaintenanceFlag};
use crate::remote::{Gateway, Operation, RpcOutput};
use crate::retry::{call_with_retry, RetryPolicy};

pub const STOP_TIMER_ACK: &str = "You stopped the timers";

/// What the queue wait did, for the operator summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    pub waited: Option<Duration>,
    pub cleared: bool,
}

/// Run one mutating call under the mutation retry budget.
pub(crate) async fn mutate(
    gw: &Gateway,
    address: &str,
    op: Operation,
    label: &str,
) -> Result<RpcOutput, RpcError> {
    let policy = gw.retry().mutation;
    call_with_retry(&policy, label, || gw.call(address, op.clone())).await
}

fn require(out: &RpcOutput, needle: &str) -> bool {
    out.simulated || out.combined().contains(needle)
}

// ── Maintenance flag ───────────────────────────────────────

/// Drive the maintenance flag to `on` and confirm it.
///
/// The platform only offers a toggle, so the flag is read first and toggled
/// only when it differs. Returns the flag as finally observed;
/// `NotSupported` is returned as-is for the caller to judge.
pub async fn set_maintenance(
    gw: &Gateway,
    address: &str,
    on: bool,
) -> Result<MaintenanceFlag, String> {
    let wanted = MaintenanceFlag::from_bool(on);
    let word = if on { "on" } else { "off" };

    let read = prober::maintenance_flag(gw, address).await;

    // Simulated steps never change the node: in dry-run the read is reported, not enforced.
    if gw.is_dry_run() {
        match read {
            Ok(current) if current == wanted => return Ok(current),
            Ok(current) => info!(
                address,
                target = word,
                ?current,
                "dry run: maintenance flag would be toggled"
            ),
            Err(e) => warn!(
                address,
                target = word,
                error = %e,
                "dry run: maintenance flag unreadable"
            ),
        }
        mutate(gw, address, Operation::update("toggleMaintenanceFlagAdmin"), "toggle maintenance")
            .await
            .map_err(|e| e.to_string())?;
        return Ok(wanted);
    }

    let current = read.map_err(|e| format!("cannot read maintenance flag: {e}"))?;
    if current == MaintenanceFlag::NotSupported || current == wanted {
        return Ok(current);
    }

    info!(address, target = word, "toggling maintenance flag");
    mutate(gw, address, Operation::update("toggleMaintenanceFlagAdmin"), "toggle maintenance")
        .await
        .map_err(|e| format!("toggle failed: {e}"))?;

    let timing = gw.timing();
    let pause = Duration::from_secs(timing.flag_propagation_secs);
    for attempt in 1..=timing.flag_poll_attempts.max(1) {
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        match prober::maintenance_flag_with(gw, address, &RetryPolicy::once()).await {
            Ok(flag) if flag == wanted => return Ok(flag),
            Ok(flag) => warn!(address, attempt, ?flag, "maintenance flag not yet {word}"),
            Err(e) => warn!(address, attempt, error = %e, "maintenance flag unreadable"),
        }
    }
    Err(format!("maintenance flag did not turn {word}"))
}

// ── Drain ──────────────────────────────────────────────────

pub async fn drain(gw: &Gateway, address: &str) -> Result<DrainOutcome, StepError> {
    match set_maintenance(gw, address, true).await {
        Ok(MaintenanceFlag::NotSupported) => {
            println!(
                "  {} maintenance flag not supported by this build, continuing",
                "::".blue().bold()
            );
        }
        Ok(_) => println!("  {} maintenance mode on", "ok".green().bold()),
        Err(e) => return Err(StepError::new(Step::MaintenanceOn, e)),
    }

    let out = mutate(gw, address, Operation::update("stopTimerExecutionAdmin"), "stop timers")
        .await
        .map_err(|e| StepError::new(Step::Drain, format!("stop timers: {e}")))?;
    if !require(&out, STOP_TIMER_ACK) {
        return Err(StepError::new(
            Step::Drain,
            format!("stop timers not acknowledged: {}", out.combined().trim()),
        ));
    }
    println!("  {} timers stopped", "ok".green().bold());

    let outcome = drain_queue(gw, address).await?;

    let out = mutate(gw, address, Operation::Stop, "stop node")
        .await
        .map_err(|e| StepError::new(Step::Drain, format!("stop node: {e}")))?;
    if !out.simulated && !out.stdout.trim().is_empty() {
        return Err(StepError::new(
            Step::Drain,
            format!("stop node returned unexpected output: {}", out.stdout.trim()),
        ));
    }
    println!("  {} node stopped", "ok".green().bold());
    Ok(outcome)
}

/// Wait out recently queued work, then clear whatever is left.
async fn drain_queue(gw: &Gateway, address: &str) -> Result<DrainOutcome, StepError> {
    let read = |when: &'static str| async move {
        prober::queue(gw, address)
            .await
            .map_err(|e| StepError::new(Step::Drain, format!("read queue {when}: {e}")))
    };

    let entries = read("before drain").await?;
    let Some(newest) = entries.iter().map(|e| e.queued_at).max() else {
        return Ok(DrainOutcome::default());
    };

    let mut outcome = DrainOutcome::default();
    let grace = gw.timing().queue_grace();
    let age = (Utc::now() - newest).to_std().unwrap_or(Duration::ZERO);
    let remaining = if age < grace {
        let wait = grace - age;
        println!(
            "  {} {} queued item(s), newest {}s old; waiting {}s",
            "::".blue().bold(),
            entries.len(),
            age.as_secs(),
            wait.as_secs()
        );
        outcome.waited = Some(wait);
        if gw.is_dry_run() {
            info!(address, wait_secs = wait.as_secs(), "dry run: queue wait skipped");
            entries.len()
        } else {
            tokio::time::sleep(wait).await;
            read("after grace period").await?.len()
        }
    } else {
        entries.len()
    };

    if remaining == 0 {
        return Ok(outcome);
    }

    warn!(address, remaining, "clearing challenge queue");
    let out = mutate(gw, address, Operation::update("resetChallengeQueueAdmin"), "clear queue")
        .await
        .map_err(|e| StepError::new(Step::Drain, format!("clear queue: {e}")))?;
    let compact: String = out.combined().split_whitespace().collect();
    if !out.simulated && !compact.contains("status_code=200") {
        return Err(StepError::new(
            Step::Drain,
            format!("clear queue not acknowledged: {}", out.combined().trim()),
        ));
    }
    outcome.cleared = true;
    println!("  {} queue cleared", "ok".green().bold());
    Ok(outcome)
}
