//! The single path every remote call takes.
//!
//! The gateway owns the transport and the run-wide call policy: dry-run
//! simulation of mutating calls, one execution-log line per call, and the
//! fixed inter-call delay that keeps the fleet under the platform rate limit.

use std::sync::Arc;

use tracing::{info, warn};

use super::{Operation, RemoteCall, RemoteClient, RpcOutput};
use crate::config::{Config, RetryConfig, TimingConfig, TopUpConfig};
use crate::error::RpcError;

/// Target of the execution-log events.
pub const EXEC_LOG_TARGET: &str = "fleet_upgrade::exec";

#[derive(Clone)]
pub struct Gateway {
    client: Arc<dyn RemoteClient>,
    network: String,
    dry_run: bool,
    timing: TimingConfig,
    retry: RetryConfig,
    top_up: TopUpConfig,
}

impl Gateway {
    pub fn new(client: Arc<dyn RemoteClient>, network: &str, cfg: &Config) -> Self {
        Self {
            client,
            network: network.to_string(),
            dry_run: false,
            timing: cfg.timing.clone(),
            retry: cfg.retry.clone(),
            top_up: cfg.top_up.clone(),
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn top_up(&self) -> &TopUpConfig {
        &self.top_up
    }

    /// Issue one call against `target`.
    ///
    /// In dry-run, mutating operations are logged and answered with a
    /// simulated success; reads still reach the platform.
    pub async fn call(&self, target: &str, op: Operation) -> Result<RpcOutput, RpcError> {
        let call = RemoteCall {
            network: self.network.clone(),
            target: target.to_string(),
            op,
        };

        if self.dry_run && call.op.is_mutating() {
            info!(
                target: EXEC_LOG_TARGET,
                address = target,
                dry_run = true,
                command = %call,
                "simulated"
            );
            return Ok(RpcOutput::simulated());
        }

        info!(target: EXEC_LOG_TARGET, address = target, command = %call, "call");
        let result = self.client.execute(&call).await;
        match &result {
            Ok(out) => info!(
                target: EXEC_LOG_TARGET,
                address = target,
                output = %out.combined().trim(),
                "ok"
            ),
            Err(e) => warn!(target: EXEC_LOG_TARGET, address = target, error = %e, "failed"),
        }

        let throttle = self.timing.throttle();
        if !throttle.is_zero() {
            tokio::time::sleep(throttle).await;
        }
        result
    }
}
