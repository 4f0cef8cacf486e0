//! Install the new build over a drained, snapshotted node.

use tracing::info;

use crate::error::{Step, StepError};
use crate::remote::{Gateway, Operation};
use crate::retry::call_with_retry;
use crate::topup::with_top_up;

/// Upgrade `address` from the build named `deployment_key`.
///
/// Deploys run under the deploy retry budget; a node that runs out of cycles
/// mid-deploy gets one top-up and one more full attempt.
pub async fn deploy(
    gw: &Gateway,
    address: &str,
    deployment_key: &str,
    assume_yes: bool,
) -> Result<(), StepError> {
    let policy = gw.retry().deploy;
    let op = Operation::Deploy {
        deployment_key: deployment_key.to_string(),
        assume_yes,
    };

    let op = &op;
    let policy = &policy;
    with_top_up(gw, address, move || {
        call_with_retry(policy, "deploy", move || gw.call(address, op.clone()))
    })
    .await
    .map_err(|e| StepError::new(Step::Deploy, e.to_string()))?;

    info!(address, deployment_key, "deploy finished");
    Ok(())
}
