//! Read-only probes of a node's runtime state.
//!
//! Every probe is safe to repeat and runs under the generous status retry
//! budget. Probes that feed a decision (lifecycle, fingerprint, health)
//! never raise: exhausted retries surface as `Unknown` / `Unhealthy`.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::remote::{Gateway, Operation, RpcOutput};
use crate::retry::{call_with_retry, RetryPolicy};
use crate::topup::with_top_up;

// ── Types ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Running,
    Stopping,
    Stopped,
    Unknown,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Lifecycle::Running => "running",
            Lifecycle::Stopping => "stopping",
            Lifecycle::Stopped => "stopped",
            Lifecycle::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy(String),
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Health::Healthy)
    }

    /// The node answered, but only to say it is in maintenance mode.
    pub fn is_maintenance(&self) -> bool {
        match self {
            Health::Healthy => false,
            Health::Unhealthy(detail) => detail.to_lowercase().contains("maintenance"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceFlag {
    On,
    Off,
    /// The node's build predates the maintenance flag.
    NotSupported,
}

impl MaintenanceFlag {
    pub fn from_bool(on: bool) -> Self {
        if on {
            MaintenanceFlag::On
        } else {
            MaintenanceFlag::Off
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: Option<String>,
    pub queued_at: DateTime<Utc>,
}

/// Lifecycle and fingerprint, read together from one status call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    pub lifecycle: Lifecycle,
    pub fingerprint: Option<String>,
}

// ── Parsers ────────────────────────────────────────────────

pub fn parse_lifecycle(text: &str) -> Lifecycle {
    for line in text.lines() {
        if let Some(rest) = line.trim().strip_prefix("Status:") {
            return match rest.trim() {
                "Running" => Lifecycle::Running,
                "Stopping" => Lifecycle::Stopping,
                "Stopped" => Lifecycle::Stopped,
                _ => Lifecycle::Unknown,
            };
        }
    }
    Lifecycle::Unknown
}

/// The module hash, or `None` when no module is installed.
pub fn parse_fingerprint(text: &str) -> Option<String> {
    text.lines()
        .find_map(|line| line.trim().strip_prefix("Module hash:"))
        .map(str::trim)
        .filter(|hash| hash.starts_with("0x"))
        .map(str::to_string)
}

/// Healthy answers, compared with all whitespace removed so single-line and
/// pretty-printed candid both match.
const HEALTHY_PAYLOADS: &[&str] = &[
    "variant{Ok=record{status_code=200:nat16}}",
    "variant{17_724=record{3_475_804_314=200:nat16}}",
];

pub fn parse_health(text: &str) -> Health {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if HEALTHY_PAYLOADS.iter().any(|p| compact.contains(p)) {
        Health::Healthy
    } else {
        Health::Unhealthy(text.split_whitespace().collect::<Vec<_>>().join(" "))
    }
}

/// `{"Ok":{"flag":true}}` → `Some(true)`.
pub fn parse_maintenance_flag(text: &str) -> Option<bool> {
    let value: Value = serde_json::from_str(text.trim()).ok()?;
    value.get("Ok")?.get("flag")?.as_bool()
}

/// Queue entries from `{"Ok":[{"challengeQueuedTimestamp":"<ns>"}]}`.
pub fn parse_queue(text: &str) -> Result<Vec<QueueEntry>, String> {
    let value: Value =
        serde_json::from_str(text.trim()).map_err(|e| format!("queue is not JSON: {e}"))?;
    if let Some(err) = value.get("Err") {
        return Err(format!("queue query returned an error: {err}"));
    }
    let entries = value
        .get("Ok")
        .and_then(Value::as_array)
        .ok_or_else(|| "queue response has no Ok list".to_string())?;

    entries
        .iter()
        .map(|entry| {
            let raw = entry
                .get("challengeQueuedTimestamp")
                .ok_or_else(|| "queue entry has no timestamp".to_string())?;
            let nanos = match raw {
                Value::String(s) => s.replace('_', "").parse::<i64>().ok(),
                Value::Number(n) => n.as_i64(),
                _ => None,
            }
            .ok_or_else(|| format!("queue timestamp {raw} is not a number"))?;
            Ok(QueueEntry {
                id: entry
                    .get("challengeQueuedId")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                queued_at: Utc.timestamp_nanos(nanos),
            })
        })
        .collect()
}

fn is_not_supported(err: &RpcError) -> bool {
    let text = err.text();
    text.contains("IC0536") || text.contains("has no query method")
}

// ── Probes ─────────────────────────────────────────────────

async fn status_call(
    gw: &Gateway,
    address: &str,
    policy: &RetryPolicy,
) -> Result<RpcOutput, RpcError> {
    with_top_up(gw, address, move || {
        call_with_retry(policy, "status", move || gw.call(address, Operation::Status))
    })
    .await
}

/// Lifecycle and fingerprint; `Unknown`/`None` when the node cannot be read.
pub async fn node_state(gw: &Gateway, address: &str) -> NodeState {
    let policy = gw.retry().status;
    match status_call(gw, address, &policy).await {
        Ok(out) => {
            let text = out.combined();
            NodeState {
                lifecycle: parse_lifecycle(&text),
                fingerprint: parse_fingerprint(&text),
            }
        }
        Err(e) => {
            warn!(address, error = %e, "status unavailable");
            NodeState {
                lifecycle: Lifecycle::Unknown,
                fingerprint: None,
            }
        }
    }
}

pub async fn fingerprint(gw: &Gateway, address: &str) -> Option<String> {
    node_state(gw, address).await.fingerprint
}

/// Health under the status retry budget.
pub async fn health(gw: &Gateway, address: &str) -> Health {
    let policy = gw.retry().status;
    health_with(gw, address, &policy).await
}

/// Health under a caller-chosen budget; the post-upgrade gate paces itself.
pub async fn health_with(gw: &Gateway, address: &str, policy: &RetryPolicy) -> Health {
    match call_with_retry(policy, "health", || gw.call(address, Operation::query("health"))).await {
        Ok(out) => {
            let health = parse_health(&out.stdout);
            debug!(address, healthy = health.is_healthy(), "health probe");
            health
        }
        Err(e) => Health::Unhealthy(e.to_string()),
    }
}

/// Current maintenance flag. `NotSupported` for builds without the feature.
pub async fn maintenance_flag(gw: &Gateway, address: &str) -> Result<MaintenanceFlag, RpcError> {
    let policy = gw.retry().status;
    maintenance_flag_with(gw, address, &policy).await
}

/// Maintenance flag under a caller-chosen budget, for loops that pace
/// their own polls.
pub async fn maintenance_flag_with(
    gw: &Gateway,
    address: &str,
    policy: &RetryPolicy,
) -> Result<MaintenanceFlag, RpcError> {
    let result = call_with_retry(policy, "getMaintenanceFlag", || {
        gw.call(address, Operation::query_json("getMaintenanceFlag"))
    })
    .await;
    match result {
        Ok(out) => parse_maintenance_flag(&out.stdout)
            .map(MaintenanceFlag::from_bool)
            .ok_or_else(|| RpcError::Unexpected {
                command: "getMaintenanceFlag".to_string(),
                detail: out.stdout.clone(),
            }),
        Err(e) if is_not_supported(&e) => Ok(MaintenanceFlag::NotSupported),
        Err(e) => Err(e),
    }
}

pub async fn queue(gw: &Gateway, address: &str) -> Result<Vec<QueueEntry>, RpcError> {
    let policy = gw.retry().status;
    let out = call_with_retry(&policy, "getChallengeQueueAdmin", || {
        gw.call(address, Operation::query_json("getChallengeQueueAdmin"))
    })
    .await?;
    parse_queue(&out.stdout).map_err(|detail| RpcError::Unexpected {
        command: "getChallengeQueueAdmin".to_string(),
        detail,
    })
}
