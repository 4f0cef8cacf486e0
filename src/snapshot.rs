//! Recovery points taken before a node is mutated.
//!
//! A snapshot is never restored automatically; its id travels with the
//! node's status so an operator can roll back by hand.

use colored::Colorize;
use tracing::{error, info, warn};

use crate::domain::status::Compensation;
use crate::drain::mutate;
use crate::error::{Step, StepError};
use crate::remote::{Gateway, Operation};

pub const DRY_RUN_SNAPSHOT_ID: &str = "dry-run-snapshot-id";
/// The platform confirmed the snapshot but its id could not be read.
pub const UNPARSED_SNAPSHOT_ID: &str = "created-but-not-parsed";

/// A failed snapshot, with the restart attempts made afterwards.
#[derive(Debug)]
pub struct SnapshotFailure {
    pub error: StepError,
    pub compensations: Vec<Compensation>,
}

pub fn parse_snapshot_id(text: &str) -> Option<String> {
    let (_, rest) = text.split_once("Snapshot ID:")?;
    rest.split_whitespace()
        .next()
        .map(|id| id.trim_end_matches(['.', ',']).to_string())
        .filter(|id| !id.is_empty())
}

/// Snapshot a stopped node.
///
/// On failure the node is restarted (process, then scheduler) so it is not
/// left stopped without a recovery point. The restarts are best effort and
/// reported as compensations.
pub async fn create(gw: &Gateway, address: &str) -> Result<String, SnapshotFailure> {
    match mutate(gw, address, Operation::CreateSnapshot, "create snapshot").await {
        Ok(out) if out.simulated => Ok(DRY_RUN_SNAPSHOT_ID.to_string()),
        Ok(out) => {
            let id = parse_snapshot_id(&out.combined()).unwrap_or_else(|| {
                warn!(address, output = %out.combined().trim(), "snapshot id not found in output");
                UNPARSED_SNAPSHOT_ID.to_string()
            });
            info!(address, snapshot_id = %id, "snapshot created");
            Ok(id)
        }
        Err(e) => {
            error!(address, error = %e, "snapshot failed, restarting node");
            let compensations = restart_after_failed_snapshot(gw, address).await;
            Err(SnapshotFailure {
                error: StepError::new(Step::Snapshot, e.to_string()),
                compensations,
            })
        }
    }
}

async fn restart_after_failed_snapshot(gw: &Gateway, address: &str) -> Vec<Compensation> {
    let mut done = Vec::new();
    for (action, op) in [
        ("restart node", Operation::Start),
        (
            "restart timers",
            Operation::update("startTimerExecutionAdmin"),
        ),
    ] {
        let result = mutate(gw, address, op, action).await;
        let compensation = Compensation {
            action: action.to_string(),
            succeeded: result.is_ok(),
            detail: result.err().map(|e| e.to_string()),
        };
        if compensation.succeeded {
            println!("  {} {action} after failed snapshot", "ok".green().bold());
        } else {
            println!("  {} {action} after failed snapshot failed", "!!".red().bold());
        }
        done.push(compensation);
    }
    done
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_id_from_stderr_line() {
        assert_eq!(
            parse_snapshot_id(
                "Created a new snapshot of canister abc123. Snapshot ID: snap_123456"
            )
            .as_deref(),
            Some("snap_123456")
        );
        assert_eq!(
            parse_snapshot_id("Snapshot ID: 0000000000000000ffffff\nDone.").as_deref(),
            Some("0000000000000000ffffff")
        );
    }

    #[test]
    fn missing_id_is_none() {
        assert_eq!(parse_snapshot_id("Snapshot created but no ID in output"), None);
        assert_eq!(parse_snapshot_id("Snapshot ID:   "), None);
    }
}
