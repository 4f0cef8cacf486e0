//! Post-upgrade verification: bring the node back and prove the new build
//! is running and healthy.
//!
//! Each step is its own function so the orchestrator can check for
//! cancellation between them.

use std::time::Duration;

use colored::Colorize;
use tracing::{info, warn};

use crate::drain::{mutate, set_maintenance};
use crate::error::{Step, StepError};
use crate::prober::{self, Health, MaintenanceFlag};
use crate::remote::{Gateway, Operation};
use crate::retry::RetryPolicy;

pub const START_TIMER_ACK: &str = "You started the timers";

async fn pause(secs: u64) {
    if secs > 0 {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }
}

pub async fn start_node(gw: &Gateway, address: &str) -> Result<(), StepError> {
    let out = mutate(gw, address, Operation::Start, "start node")
        .await
        .map_err(|e| StepError::new(Step::Start, e.to_string()))?;
    if !out.simulated && !out.stdout.trim().is_empty() {
        return Err(StepError::new(
            Step::Start,
            format!("start returned unexpected output: {}", out.stdout.trim()),
        ));
    }
    println!("  {} node started", "ok".green().bold());
    Ok(())
}

/// Wait for the maintenance endpoint to answer, then make sure the flag is
/// on before the scheduler comes back.
pub async fn maintenance_gate(gw: &Gateway, address: &str) -> Result<(), StepError> {
    if gw.is_dry_run() {
        info!(address, "dry run: maintenance gate not polled");
        return Ok(());
    }

    let timing = gw.timing();
    let attempts = timing.maintenance_gate_attempts.max(1);
    let mut answered = None;
    for attempt in 1..=attempts {
        match prober::maintenance_flag_with(gw, address, &RetryPolicy::once()).await {
            Ok(flag) => {
                answered = Some(flag);
                break;
            }
            Err(e) => {
                warn!(address, attempt, attempts, error = %e, "maintenance endpoint not answering");
                if attempt < attempts {
                    pause(timing.maintenance_gate_interval_secs).await;
                }
            }
        }
    }

    match answered {
        None => Err(StepError::new(
            Step::MaintenanceGate,
            format!("maintenance endpoint did not answer after {attempts} attempts"),
        )),
        Some(MaintenanceFlag::NotSupported) => Err(StepError::new(
            Step::MaintenanceGate,
            "upgraded build has no maintenance flag",
        )),
        Some(MaintenanceFlag::On) => {
            println!("  {} maintenance endpoint up, flag on", "ok".green().bold());
            Ok(())
        }
        Some(MaintenanceFlag::Off) => {
            println!(
                "  {} fresh build came up with maintenance off, turning it on",
                "::".blue().bold()
            );
            match set_maintenance(gw, address, true).await {
                Ok(MaintenanceFlag::On) => Ok(()),
                Ok(flag) => Err(StepError::new(
                    Step::MaintenanceGate,
                    format!("maintenance flag reads {flag:?} after turning it on"),
                )),
                Err(e) => Err(StepError::new(Step::MaintenanceGate, e)),
            }
        }
    }
}

pub async fn start_timers(gw: &Gateway, address: &str) -> Result<(), StepError> {
    let out = mutate(gw, address, Operation::update("startTimerExecutionAdmin"), "start timers")
        .await
        .map_err(|e| StepError::new(Step::StartTimer, e.to_string()))?;
    if !out.simulated && !out.combined().contains(START_TIMER_ACK) {
        return Err(StepError::new(
            Step::StartTimer,
            format!("start timers not acknowledged: {}", out.combined().trim()),
        ));
    }
    println!("  {} timers started", "ok".green().bold());
    Ok(())
}

pub async fn maintenance_off(gw: &Gateway, address: &str) -> Result<(), StepError> {
    match set_maintenance(gw, address, false).await {
        Ok(MaintenanceFlag::Off) => {
            println!("  {} maintenance mode off", "ok".green().bold());
            Ok(())
        }
        Ok(MaintenanceFlag::NotSupported) => Err(StepError::new(
            Step::MaintenanceOff,
            "maintenance flag not supported, cannot confirm it is off",
        )),
        Ok(MaintenanceFlag::On) => Err(StepError::new(
            Step::MaintenanceOff,
            "maintenance flag still on",
        )),
        Err(e) => Err(StepError::new(Step::MaintenanceOff, e)),
    }
}

/// Health after a settle delay. Answers blaming maintenance mode are retried
/// with longer spacing; any other unhealthy answer fails at once.
pub async fn health_gate(gw: &Gateway, address: &str) -> Result<(), StepError> {
    if gw.is_dry_run() {
        info!(address, "dry run: health gate not polled");
        return Ok(());
    }

    let timing = gw.timing();
    pause(timing.health_settle_secs).await;

    // transport errors back off from the health interval
    let policy = RetryPolicy::new(
        gw.retry().status.max_attempts,
        timing.health_interval_secs as f64,
    );
    let attempts = timing.health_attempts.max(1);
    let mut last = String::new();
    for attempt in 1..=attempts {
        match prober::health_with(gw, address, &policy).await {
            Health::Healthy => {
                println!("  {} healthy", "ok".green().bold());
                return Ok(());
            }
            unhealthy if unhealthy.is_maintenance() => {
                warn!(address, attempt, attempts, "health blocked by maintenance mode");
                if let Health::Unhealthy(detail) = unhealthy {
                    last = detail;
                }
                if attempt < attempts {
                    pause(timing.health_maintenance_interval_secs).await;
                }
            }
            Health::Unhealthy(detail) => {
                return Err(StepError::new(Step::Health, detail));
            }
        }
    }
    Err(StepError::new(
        Step::Health,
        format!("still in maintenance after {attempts} health checks: {last}"),
    ))
}

/// Prove the running build changed: equal to `target` when one is given,
/// otherwise different from `before`. Returns the new fingerprint.
pub async fn verify_version(
    gw: &Gateway,
    address: &str,
    before: Option<&str>,
    target: Option<&str>,
) -> Result<Option<String>, StepError> {
    if gw.is_dry_run() {
        info!(address, "dry run: version not re-read");
        return Ok(None);
    }

    let after = prober::fingerprint(gw, address)
        .await
        .ok_or_else(|| StepError::new(Step::Version, "module hash unavailable after upgrade"))?;

    match target {
        Some(target) if after != target => Err(StepError::new(
            Step::Version,
            format!("module hash {after} does not match target {target}"),
        )),
        None if before == Some(after.as_str()) => Err(StepError::new(
            Step::Version,
            format!("module hash {after} unchanged by upgrade"),
        )),
        _ => {
            println!("  {} module hash {}", "ok".green().bold(), after.dimmed());
            Ok(Some(after))
        }
    }
}
