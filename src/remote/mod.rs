//! Remote platform access.
//!
//! The orchestrator never shells out directly. It builds a [`RemoteCall`] and
//! hands it to a [`RemoteClient`]; the production client drives the `dfx`
//! command line ([`dfx::DfxClient`]), tests drive an in-memory platform.
//! All calls go through the [`gateway::Gateway`], which adds dry-run,
//! execution logging, and throttling.

pub mod dfx;
pub mod gateway;

use std::fmt;

use async_trait::async_trait;

use crate::error::RpcError;

pub use gateway::Gateway;

/// What to do against one remote node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Lifecycle status and module hash.
    Status,
    /// Read-only method call.
    Query {
        method: String,
        args: Option<String>,
        json: bool,
    },
    /// State-changing method call.
    Update { method: String, args: Option<String> },
    Start,
    Stop,
    CreateSnapshot,
    /// Install a new build of `deployment_key` over the running node.
    Deploy {
        deployment_key: String,
        assume_yes: bool,
    },
    /// Send `cycles` from the operator wallet to the node.
    TopUp { cycles: u128 },
    /// Refresh the local deployment-key mapping (runs the configured command).
    RefreshRegistry,
}

impl Operation {
    pub fn query(method: &str) -> Self {
        Operation::Query {
            method: method.to_string(),
            args: None,
            json: false,
        }
    }

    pub fn query_json(method: &str) -> Self {
        Operation::Query {
            method: method.to_string(),
            args: None,
            json: true,
        }
    }

    pub fn update(method: &str) -> Self {
        Operation::Update {
            method: method.to_string(),
            args: None,
        }
    }

    /// Whether the operation changes remote or local state. Mutating
    /// operations are simulated in dry-run.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Operation::Status | Operation::Query { .. })
    }
}

/// One call: an operation against a target node on a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub network: String,
    /// Node address (or registry node name); empty for local-only operations.
    pub target: String,
    pub op: Operation,
}

impl RemoteCall {
    /// Render as the equivalent `dfx` command line, for logs.
    pub fn argv(&self, binary: &str) -> Vec<String> {
        let net = self.network.clone();
        let target = self.target.clone();
        let mut argv: Vec<String> = vec![binary.to_string()];
        match &self.op {
            Operation::Status => {
                argv.extend(["canister".into(), "--network".into(), net, "status".into(), target]);
            }
            Operation::Query { method, args, json } => {
                argv.extend(["canister".into(), "--network".into(), net, "call".into(), target]);
                argv.push(method.clone());
                if let Some(a) = args {
                    argv.push(a.clone());
                }
                if *json {
                    argv.extend(["--output".into(), "json".into()]);
                }
            }
            Operation::Update { method, args } => {
                argv.extend(["canister".into(), "--network".into(), net, "call".into(), target]);
                argv.push(method.clone());
                if let Some(a) = args {
                    argv.push(a.clone());
                }
            }
            Operation::Start => {
                argv.extend(["canister".into(), "--network".into(), net, "start".into(), target]);
            }
            Operation::Stop => {
                argv.extend(["canister".into(), "--network".into(), net, "stop".into(), target]);
            }
            Operation::CreateSnapshot => {
                argv.extend([
                    "canister".into(),
                    "--network".into(),
                    net,
                    "snapshot".into(),
                    "create".into(),
                    target,
                ]);
            }
            Operation::Deploy {
                deployment_key,
                assume_yes,
            } => {
                argv.extend([
                    "deploy".into(),
                    deployment_key.clone(),
                    "--mode".into(),
                    "upgrade".into(),
                    "--network".into(),
                    net,
                ]);
                if *assume_yes {
                    argv.push("--yes".into());
                }
            }
            Operation::TopUp { cycles } => {
                argv.extend([
                    "wallet".into(),
                    "--network".into(),
                    net,
                    "send".into(),
                    target,
                    cycles.to_string(),
                ]);
            }
            Operation::RefreshRegistry => {
                argv.truncate(0);
            }
        }
        argv
    }
}

impl fmt::Display for RemoteCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op {
            Operation::RefreshRegistry => write!(f, "refresh registry mapping ({})", self.network),
            _ => write!(f, "{}", self.argv("dfx").join(" ")),
        }
    }
}

/// Raw output of a successful call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcOutput {
    pub stdout: String,
    pub stderr: String,
    /// Produced by dry-run instead of the platform.
    pub simulated: bool,
}

impl RpcOutput {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            simulated: false,
        }
    }

    pub fn simulated() -> Self {
        Self {
            simulated: true,
            ..Self::default()
        }
    }

    /// stdout and stderr together; the platform client is not consistent
    /// about which stream carries the interesting line.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Transport to the remote platform.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn execute(&self, call: &RemoteCall) -> Result<RpcOutput, RpcError>;
}
