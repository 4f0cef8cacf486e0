//! In-memory stand-in for the remote platform.
//!
//! Simulates per-node lifecycle, module hash, maintenance flag, challenge
//! queue and snapshots, records every call, and fails calls on request.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use fleet_upgrade::config::{Config, TimingConfig};
use fleet_upgrade::domain::node::{Node, NodeKind};
use fleet_upgrade::error::RpcError;
use fleet_upgrade::orchestrator::CancelToken;
use fleet_upgrade::registry::DeploymentMap;
use fleet_upgrade::remote::{Gateway, Operation, RemoteCall, RemoteClient, RpcOutput};

pub const NETWORK: &str = "testing";
pub const HEALTHY: &str = "(variant { Ok = record { status_code = 200 : nat16 } })";

#[derive(Debug, Clone)]
pub struct FakeNode {
    pub owner: String,
    pub running: bool,
    pub fingerprint: String,
    /// Module hash after the next deploy.
    pub next_fingerprint: String,
    /// `None` for builds without the maintenance flag.
    pub flag: Option<bool>,
    /// Whether the build installed by a deploy has the flag.
    pub next_has_flag: bool,
    /// The node stops answering (as if stopped) once its flag is toggled.
    pub toggle_breaks_flag_read: bool,
    pub timers_running: bool,
    pub healthy: bool,
    pub healthy_after_upgrade: bool,
    /// Successive queue reads, newest-entry ages in seconds; empty once drained.
    pub queue_reads: VecDeque<Vec<u64>>,
    pub snapshot_id: String,
    pub snapshots: Vec<String>,
    pub cycles_received: u128,
}

impl FakeNode {
    pub fn running(fingerprint: &str) -> Self {
        Self {
            owner: "owner-1".into(),
            running: true,
            fingerprint: fingerprint.into(),
            next_fingerprint: format!("{fingerprint}ff"),
            flag: Some(false),
            next_has_flag: true,
            toggle_breaks_flag_read: false,
            timers_running: true,
            healthy: true,
            healthy_after_upgrade: true,
            queue_reads: VecDeque::new(),
            snapshot_id: "snap_000".into(),
            snapshots: Vec::new(),
            cycles_received: 0,
        }
    }
}

type Key = (String, String);

#[derive(Default)]
pub struct FakePlatform {
    nodes: Mutex<Vec<(String, FakeNode)>>,
    calls: Mutex<Vec<RemoteCall>>,
    fail_next: Mutex<HashMap<Key, VecDeque<String>>>,
    fail_always: Mutex<HashMap<Key, String>>,
    cancel_after: Mutex<Option<(String, CancelToken)>>,
    latency: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Short name of an operation, matching the method for canister calls.
pub fn op_name(op: &Operation) -> String {
    match op {
        Operation::Status => "status".into(),
        Operation::Query { method, .. } | Operation::Update { method, .. } => method.clone(),
        Operation::Start => "start".into(),
        Operation::Stop => "stop".into(),
        Operation::CreateSnapshot => "snapshot".into(),
        Operation::Deploy { .. } => "deploy".into(),
        Operation::TopUp { .. } => "top_up".into(),
        Operation::RefreshRegistry => "refresh".into(),
    }
}

fn failed(call: &RemoteCall, stderr: &str) -> RpcError {
    RpcError::Failed {
        command: call.to_string(),
        stderr: stderr.to_string(),
        stdout: String::new(),
    }
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, address: &str, node: FakeNode) {
        self.nodes.lock().unwrap().push((address.to_string(), node));
    }

    pub fn node(&self, address: &str) -> FakeNode {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .find(|(a, _)| a == address)
            .map(|(_, n)| n.clone())
            .unwrap()
    }

    pub fn listing(&self) -> Vec<Node> {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .map(|(a, n)| Node::new(a, &n.owner, NodeKind::ShareAgent))
            .collect()
    }

    /// One deployment key per node, in insertion order.
    pub fn mapping(&self) -> DeploymentMap {
        let entries: serde_json::Map<String, serde_json::Value> = self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .map(|(i, (a, _))| {
                (
                    format!("mainer_share_agent_{:04}", i + 1),
                    serde_json::json!({ NETWORK: a }),
                )
            })
            .collect();
        DeploymentMap::from_json(&serde_json::Value::Object(entries).to_string()).unwrap()
    }

    pub fn fail_next(&self, address: &str, op: &str, stderr: &str) {
        self.fail_next
            .lock()
            .unwrap()
            .entry((address.into(), op.into()))
            .or_default()
            .push_back(stderr.into());
    }

    pub fn fail_always(&self, address: &str, op: &str, stderr: &str) {
        self.fail_always
            .lock()
            .unwrap()
            .insert((address.into(), op.into()), stderr.into());
    }

    /// Trip `token` once a call named `op` has completed.
    pub fn cancel_after(&self, op: &str, token: CancelToken) {
        *self.cancel_after.lock().unwrap() = Some((op.into(), token));
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn ops_for(&self, address: &str) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|c| c.target == address)
            .map(|c| op_name(&c.op))
            .collect()
    }

    pub fn count(&self, address: &str, op: &str) -> usize {
        self.ops_for(address).iter().filter(|o| *o == op).count()
    }

    pub fn mutating_calls(&self, address: &str) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|c| c.target == address && c.op.is_mutating())
            .map(|c| op_name(&c.op))
            .collect()
    }

    fn scripted_failure(&self, call: &RemoteCall) -> Option<String> {
        let key = (call.target.clone(), op_name(&call.op));
        if let Some(err) = self.fail_always.lock().unwrap().get(&key) {
            return Some(err.clone());
        }
        self.fail_next
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
    }

    fn respond(&self, call: &RemoteCall) -> Result<RpcOutput, RpcError> {
        let mut nodes = self.nodes.lock().unwrap();
        let Some((_, node)) = nodes.iter_mut().find(|(a, _)| *a == call.target) else {
            return Err(failed(call, "Cannot find canister id"));
        };
        let ok = |s: &str| Ok(RpcOutput::new(s, ""));

        match &call.op {
            Operation::Status => ok(&format!(
                "Status: {}\nModule hash: {}",
                if node.running { "Running" } else { "Stopped" },
                node.fingerprint
            )),
            Operation::Start => {
                node.running = true;
                ok("")
            }
            Operation::Stop => {
                node.running = false;
                ok("")
            }
            Operation::CreateSnapshot => {
                node.snapshots.push(node.snapshot_id.clone());
                Ok(RpcOutput::new(
                    "",
                    format!(
                        "Created a new snapshot of canister {}. Snapshot ID: {}",
                        call.target, node.snapshot_id
                    ),
                ))
            }
            Operation::Deploy { .. } => {
                node.fingerprint = node.next_fingerprint.clone();
                node.flag = node.next_has_flag.then_some(false);
                node.healthy = node.healthy_after_upgrade;
                ok("")
            }
            Operation::TopUp { cycles } => {
                node.cycles_received += cycles;
                ok("Transferred cycles")
            }
            Operation::RefreshRegistry => ok(""),
            Operation::Query { method, .. } | Operation::Update { method, .. } => {
                match method.as_str() {
                    "health" => {
                        if !node.running {
                            Err(failed(call, "Error: IC0508: Canister is stopped"))
                        } else if node.flag == Some(true) {
                            ok("(variant { Err = variant { Other = \"Maintenance mode is on\" } })")
                        } else if node.healthy {
                            ok(HEALTHY)
                        } else {
                            ok("(variant { Err = \"Unhealthy\" })")
                        }
                    }
                    "getMaintenanceFlag" => match node.flag {
                        None => Err(failed(
                            call,
                            "Error: IC0536: Canister has no query method 'getMaintenanceFlag'",
                        )),
                        Some(flag) if node.running => ok(&format!("{{\"Ok\":{{\"flag\":{flag}}}}}")),
                        Some(_) => Err(failed(call, "Error: IC0508: Canister is stopped")),
                    },
                    "toggleMaintenanceFlagAdmin" => match node.flag {
                        None => Err(failed(call, "Error: IC0536: has no update method")),
                        Some(flag) => {
                            node.flag = Some(!flag);
                            if node.toggle_breaks_flag_read {
                                node.running = false;
                            }
                            ok("(variant { Ok = record { flag = true } })")
                        }
                    },
                    "stopTimerExecutionAdmin" => {
                        node.timers_running = false;
                        ok("(variant { Ok = record { auth = \"You stopped the timers: \" } })")
                    }
                    "startTimerExecutionAdmin" => {
                        node.timers_running = true;
                        ok("(variant { Ok = record { auth = \"You started the timers:  1, \" } })")
                    }
                    "getChallengeQueueAdmin" => {
                        let ages = node.queue_reads.pop_front().unwrap_or_default();
                        let now = Utc::now().timestamp_nanos_opt().unwrap();
                        let entries: Vec<_> = ages
                            .iter()
                            .enumerate()
                            .map(|(i, age)| {
                                serde_json::json!({
                                    "challengeQueuedId": format!("q{i}"),
                                    "challengeQueuedTimestamp":
                                        (now - (*age as i64) * 1_000_000_000).to_string(),
                                })
                            })
                            .collect();
                        ok(&serde_json::json!({ "Ok": entries }).to_string())
                    }
                    "resetChallengeQueueAdmin" => {
                        node.queue_reads.clear();
                        ok("(variant { Ok = record { status_code = 200 : nat16 } })")
                    }
                    other => Err(failed(call, &format!("has no update method '{other}'"))),
                }
            }
        }
    }
}

#[async_trait]
impl RemoteClient for FakePlatform {
    async fn execute(&self, call: &RemoteCall) -> Result<RpcOutput, RpcError> {
        self.calls.lock().unwrap().push(call.clone());

        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(latency).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        let result = match self.scripted_failure(call) {
            Some(stderr) => Err(failed(call, &stderr)),
            None => self.respond(call),
        };

        if let Some((op, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if *op == op_name(&call.op) {
                token.cancel();
            }
        }
        result
    }
}

/// Gateway over `fake` with no pacing delays.
pub fn gateway(fake: &Arc<FakePlatform>, dry_run: bool) -> Gateway {
    let mut cfg = Config::default();
    cfg.timing = TimingConfig::immediate();
    gateway_with(fake, &cfg, dry_run)
}

pub fn gateway_with(fake: &Arc<FakePlatform>, cfg: &Config, dry_run: bool) -> Gateway {
    Gateway::new(fake.clone(), NETWORK, cfg).with_dry_run(dry_run)
}
