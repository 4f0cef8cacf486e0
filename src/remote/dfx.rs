//! `RemoteClient` backed by the `dfx` command-line client.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{Operation, RemoteCall, RemoteClient, RpcOutput};
use crate::config::DfxConfig;
use crate::error::RpcError;

pub struct DfxClient {
    binary: String,
    call_timeout: Duration,
    deploy_timeout: Duration,
    deploy_dir: Option<PathBuf>,
    prepare_command: Vec<String>,
}

impl DfxClient {
    pub fn new(cfg: &DfxConfig) -> Self {
        Self {
            binary: cfg.binary.clone(),
            call_timeout: Duration::from_secs(cfg.call_timeout_secs),
            deploy_timeout: Duration::from_secs(cfg.deploy_timeout_secs),
            deploy_dir: cfg.deploy_dir.as_ref().map(PathBuf::from),
            prepare_command: cfg.prepare_command.clone(),
        }
    }

    fn command_for(&self, call: &RemoteCall) -> Option<(Vec<String>, Duration)> {
        match call.op {
            Operation::RefreshRegistry => {
                if self.prepare_command.is_empty() {
                    None
                } else {
                    Some((self.prepare_command.clone(), self.deploy_timeout))
                }
            }
            Operation::Deploy { .. } => Some((call.argv(&self.binary), self.deploy_timeout)),
            _ => Some((call.argv(&self.binary), self.call_timeout)),
        }
    }

    /// Deploys and the registry refresh operate on the local project tree.
    fn runs_in_project_dir(op: &Operation) -> bool {
        matches!(op, Operation::Deploy { .. } | Operation::RefreshRegistry)
    }
}

#[async_trait]
impl RemoteClient for DfxClient {
    async fn execute(&self, call: &RemoteCall) -> Result<RpcOutput, RpcError> {
        let Some((argv, limit)) = self.command_for(call) else {
            debug!("no registry refresh command configured");
            return Ok(RpcOutput::default());
        };
        let rendered = argv.join(" ");
        let (program, args) = argv.split_first().ok_or_else(|| RpcError::Spawn {
            command: rendered.clone(),
            detail: "empty command line".to_string(),
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if Self::runs_in_project_dir(&call.op) {
            if let Some(dir) = &self.deploy_dir {
                cmd.current_dir(dir);
            }
        }

        let output = match tokio::time::timeout(limit, cmd.output()).await {
            Err(_) => {
                return Err(RpcError::Timeout {
                    command: rendered,
                    secs: limit.as_secs(),
                })
            }
            Ok(Err(e)) => {
                return Err(RpcError::Spawn {
                    command: rendered,
                    detail: e.to_string(),
                })
            }
            Ok(Ok(output)) => output,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if output.status.success() {
            Ok(RpcOutput::new(stdout, stderr))
        } else {
            Err(RpcError::Failed {
                command: rendered,
                stderr,
                stdout,
            })
        }
    }
}
