//! Resource top-up: a single-shot compensating action for nodes that ran
//! out of cycles.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::RpcError;
use crate::remote::{Gateway, Operation};

const EXHAUSTION_SIGNATURES: &[&str] = &["out of cycles", "ic0207", "insufficient cycles"];

/// Whether the error text says the node lacks the resources to run the call.
pub fn is_resource_exhausted(error_text: &str) -> bool {
    let lower = error_text.to_lowercase();
    EXHAUSTION_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

/// Run `op`; if it fails with resource exhaustion, top the node up once and
/// run `op` exactly one more time.
///
/// A failed top-up ends the operation with [`RpcError::TopUpFailed`]. The
/// retried call's error, if any, is returned as-is.
pub async fn with_top_up<T, F, Fut>(gw: &Gateway, address: &str, mut op: F) -> Result<T, RpcError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(err) if is_resource_exhausted(&err.text()) => {
            warn!(address, error = %err, "node is out of cycles, topping up");
            top_up(gw, address).await?;
            op().await
        }
        Err(err) => Err(err),
    }
}

/// Send the configured grant to `address` and wait for it to settle.
pub async fn top_up(gw: &Gateway, address: &str) -> Result<(), RpcError> {
    let cycles = gw.top_up().cycles();
    gw.call(address, Operation::TopUp { cycles })
        .await
        .map_err(|e| RpcError::TopUpFailed {
            address: address.to_string(),
            detail: e.to_string(),
        })?;
    info!(address, cycles, "top-up sent");
    let settle = Duration::from_secs(gw.top_up().settle_secs);
    if !settle.is_zero() && !gw.is_dry_run() {
        tokio::time::sleep(settle).await;
    }
    Ok(())
}
