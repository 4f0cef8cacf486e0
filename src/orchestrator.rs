//! The rolling upgrade loop.
//!
//! Nodes are upgraded strictly one at a time, in list order. Each node runs a
//! fixed sequence of steps; the first failing step decides the node's final
//! status and, by default, stops the whole run.

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use colored::Colorize;
use tracing::{error, info, warn};

use crate::deploy;
use crate::domain::node::Node;
use crate::domain::status::{StatusStore, UpgradeStatus};
use crate::drain;
use crate::error::{Step, StepError};
use crate::prober::{self, Lifecycle};
use crate::registry::DeploymentMap;
use crate::remote::Gateway;
use crate::snapshot;
use crate::verify;

// ── Run configuration ──────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub owner: Option<String>,
    pub node: Option<String>,
    /// Applied after filtering, before reversal.
    pub max: Option<usize>,
    pub reverse: bool,
}

/// Read-only parameters of one invocation.
#[derive(Debug, Clone, Default)]
pub struct OrchestrationRun {
    pub network: String,
    pub target_hash: Option<String>,
    pub selection: Selection,
    pub dry_run: bool,
    pub ask_before_upgrade: bool,
    pub deploy_with_yes: bool,
    pub continue_on_failure: bool,
}

// ── Selection ──────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Selected {
    /// Nodes to upgrade, in processing order.
    pub nodes: Vec<Node>,
    /// Addressable nodes excluded by a filter.
    pub filtered: Vec<Node>,
}

pub fn select(nodes: &[Node], selection: &Selection) -> Selected {
    let mut selected = Selected::default();
    for node in nodes {
        if node.address.is_empty() {
            continue;
        }
        let wanted = node.kind.is_upgrade_eligible()
            && selection.owner.as_ref().map_or(true, |o| *o == node.owner)
            && selection.node.as_ref().map_or(true, |a| *a == node.address);
        if wanted {
            selected.nodes.push(node.clone());
        } else {
            selected.filtered.push(node.clone());
        }
    }
    if let Some(max) = selection.max {
        selected.nodes.truncate(max);
    }
    if selection.reverse {
        selected.nodes.reverse();
    }
    selected
}

/// The `Failed_*` status a step failure ends in.
pub fn failure_status(step: Step) -> UpgradeStatus {
    match step {
        Step::Resolve | Step::Version => UpgradeStatus::FailedOther,
        Step::Drain => UpgradeStatus::FailedDrainTimer,
        Step::MaintenanceOn | Step::MaintenanceGate | Step::MaintenanceOff => {
            UpgradeStatus::FailedMaintenance
        }
        Step::Snapshot => UpgradeStatus::FailedSnapshot,
        Step::Deploy => UpgradeStatus::FailedDeploy,
        Step::Start => UpgradeStatus::FailedStart,
        Step::StartTimer => UpgradeStatus::FailedStartTimer,
        Step::Health => UpgradeStatus::FailedHealth,
    }
}

// ── Cancellation ───────────────────────────────────────────

/// Process-wide stop request, checked between nodes and between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// First Ctrl+C requests a stop after the current step; a second one
    /// exits immediately.
    pub fn watch_ctrl_c(&self) {
        let token = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            token.cancel();
            eprintln!(
                "\n{} interrupt received; stopping after the current step (Ctrl+C again to abort)",
                "!!".yellow().bold()
            );
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{} aborted", "!!".red().bold());
                std::process::exit(130);
            }
        });
    }
}

// ── Interactive gate ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAnswer {
    Upgrade,
    Skip,
    Exit,
}

impl GateAnswer {
    /// `y`/`n`/`exit`; empty means yes. `None` for anything else.
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "" | "y" | "yes" => Some(GateAnswer::Upgrade),
            "n" | "no" => Some(GateAnswer::Skip),
            "exit" | "q" | "quit" => Some(GateAnswer::Exit),
            _ => None,
        }
    }
}

/// Per-node confirmation before any mutation.
pub trait UpgradeGate: Send {
    fn ask(&mut self, node: &Node, position: usize, total: usize) -> GateAnswer;
}

/// Asks on stderr, reads stdin.
pub struct StdinGate;

impl UpgradeGate for StdinGate {
    fn ask(&mut self, node: &Node, position: usize, total: usize) -> GateAnswer {
        let stdin = io::stdin();
        loop {
            eprint!(
                "{} [{position}/{total}] upgrade {}? [Y/n/exit] ",
                "??".yellow().bold(),
                node.address.bold()
            );
            let _ = io::stderr().flush();
            let mut input = String::new();
            match stdin.lock().read_line(&mut input) {
                Ok(0) | Err(_) => return GateAnswer::Exit,
                Ok(_) => {}
            }
            if let Some(answer) = GateAnswer::parse(&input) {
                return answer;
            }
            eprintln!("   answer y, n or exit");
        }
    }
}

// ── Loop ───────────────────────────────────────────────────

/// Why the loop ended before the end of the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    FailFast { address: String },
    OperatorExit,
    Interrupted,
}

#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub processed: usize,
    pub stopped: Option<StopReason>,
}

enum NodeEnd {
    Finished(UpgradeStatus),
    OperatorExit,
    Interrupted,
}

pub struct Orchestrator<'a> {
    gw: &'a Gateway,
    run: &'a OrchestrationRun,
    mapping: &'a DeploymentMap,
    store: &'a StatusStore,
    cancel: CancelToken,
    gate: Box<dyn UpgradeGate + 'a>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        gw: &'a Gateway,
        run: &'a OrchestrationRun,
        mapping: &'a DeploymentMap,
        store: &'a StatusStore,
    ) -> Self {
        Self {
            gw,
            run,
            mapping,
            store,
            cancel: CancelToken::new(),
            gate: Box::new(StdinGate),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_gate(mut self, gate: Box<dyn UpgradeGate + 'a>) -> Self {
        self.gate = gate;
        self
    }

    pub async fn run(&mut self, selected: &Selected) -> RunOutcome {
        for node in &selected.filtered {
            self.store.register(&node.address);
            self.store.set(&node.address, UpgradeStatus::SkippedFiltered, None);
        }
        for node in &selected.nodes {
            self.store.register(&node.address);
        }

        let total = selected.nodes.len();
        let mut outcome = RunOutcome::default();
        for (i, node) in selected.nodes.iter().enumerate() {
            if self.cancel.is_cancelled() {
                outcome.stopped = Some(StopReason::Interrupted);
                break;
            }
            println!();
            println!(
                "{} [{}/{}] {} {}",
                ">>".blue().bold(),
                i + 1,
                total,
                node.address.bold(),
                format!("(owner {})", node.owner).dimmed()
            );
            outcome.processed += 1;

            match self.upgrade_node(node, i + 1, total).await {
                NodeEnd::Finished(status) => {
                    self.print_status(&node.address, status);
                    if status.is_failure() && !self.run.continue_on_failure {
                        outcome.stopped = Some(StopReason::FailFast {
                            address: node.address.clone(),
                        });
                        break;
                    }
                }
                NodeEnd::OperatorExit => {
                    outcome.stopped = Some(StopReason::OperatorExit);
                    break;
                }
                NodeEnd::Interrupted => {
                    outcome.stopped = Some(StopReason::Interrupted);
                    break;
                }
            }
        }
        outcome
    }

    fn print_status(&self, address: &str, status: UpgradeStatus) {
        let error = self
            .store
            .get(address)
            .and_then(|r| r.error)
            .unwrap_or_default();
        if status == UpgradeStatus::Success {
            println!("{} {} upgraded", "ok".green().bold(), address);
        } else if status.is_failure() {
            println!("{} {} {}: {}", "!!".red().bold(), address, status, error);
        } else {
            println!("{} {} {}", "::".blue().bold(), address, status);
        }
    }

    fn finish(&self, address: &str, status: UpgradeStatus, error: Option<String>) -> NodeEnd {
        self.store.set(address, status, error);
        NodeEnd::Finished(status)
    }

    fn fail(&self, address: &str, err: StepError, snapshot_id: Option<&str>) -> NodeEnd {
        let status = failure_status(err.step);
        let message = match snapshot_id {
            Some(id) => format!("{err}; snapshot {id} available for manual rollback"),
            None => err.to_string(),
        };
        error!(
            address,
            step = err.step.name(),
            snapshot_id = ?snapshot_id,
            error = %err.message,
            "upgrade failed"
        );
        self.finish(address, status, Some(message))
    }

    /// Stop point between steps. Once mutation has begun an interrupted node
    /// is recorded as failed; before that it goes back to pending.
    fn interrupted(
        &self,
        address: &str,
        after: Step,
        mutated: bool,
        snapshot_id: Option<&str>,
    ) -> Option<NodeEnd> {
        if !self.cancel.is_cancelled() {
            return None;
        }
        warn!(address, after = after.name(), "interrupted");
        if mutated {
            let mut message = format!("interrupted after {} step", after.name());
            if let Some(id) = snapshot_id {
                message.push_str(&format!("; snapshot {id} available for manual rollback"));
            }
            self.store.set(address, UpgradeStatus::FailedOther, Some(message));
        } else {
            self.store.set(address, UpgradeStatus::Pending, None);
        }
        Some(NodeEnd::Interrupted)
    }

    async fn upgrade_node(&mut self, node: &Node, position: usize, total: usize) -> NodeEnd {
        let gw = self.gw;
        let address = node.address.as_str();
        self.store.set(address, UpgradeStatus::InProgress, None);

        let key = match self.mapping.resolve(address, gw.network()) {
            Ok(key) => key,
            Err(e) => return self.fail(address, StepError::new(Step::Resolve, e.to_string()), None),
        };
        info!(address, deployment_key = %key, "resolved");

        let state = prober::node_state(gw, address).await;
        println!(
            "  {} {} running {}",
            "::".blue().bold(),
            state.lifecycle,
            state.fingerprint.as_deref().unwrap_or("<unknown hash>").dimmed()
        );
        if let (Some(target), Some(current)) = (&self.run.target_hash, &state.fingerprint) {
            if target == current {
                match prober::health(gw, address).await {
                    prober::Health::Healthy => {
                        return self.finish(address, UpgradeStatus::SkippedAlreadyUpgraded, None);
                    }
                    prober::Health::Unhealthy(detail) => {
                        println!(
                            "  {} already at target hash but unhealthy, upgrading again",
                            "!!".yellow().bold()
                        );
                        info!(address, detail = %detail, "at target but unhealthy");
                    }
                }
            }
        }
        if let Some(end) = self.interrupted(address, Step::Resolve, false, None) {
            return end;
        }

        if self.run.ask_before_upgrade {
            match self.gate.ask(node, position, total) {
                GateAnswer::Upgrade => {}
                GateAnswer::Skip => {
                    return self.finish(address, UpgradeStatus::SkippedUserChoice, None);
                }
                GateAnswer::Exit => {
                    self.store.set(
                        address,
                        UpgradeStatus::SkippedUserChoice,
                        Some("operator ended the run here".into()),
                    );
                    return NodeEnd::OperatorExit;
                }
            }
        }

        if state.lifecycle == Lifecycle::Stopped {
            println!("  {} already stopped, skipping drain", "::".blue().bold());
        } else {
            match drain::drain(gw, address).await {
                Ok(drained) => info!(
                    address,
                    waited_secs = ?drained.waited.map(|w| w.as_secs()),
                    cleared = drained.cleared,
                    "drained"
                ),
                Err(e) => return self.fail(address, e, None),
            }
        }
        if let Some(end) = self.interrupted(address, Step::Drain, true, None) {
            return end;
        }

        let snapshot_id = match snapshot::create(gw, address).await {
            Ok(id) => id,
            Err(failure) => {
                for c in failure.compensations {
                    self.store.add_compensation(address, c);
                }
                return self.fail(address, failure.error, None);
            }
        };
        self.store.attach_snapshot(address, &snapshot_id);
        println!("  {} snapshot {}", "ok".green().bold(), snapshot_id);
        let snap = Some(snapshot_id.as_str());
        if let Some(end) = self.interrupted(address, Step::Snapshot, true, snap) {
            return end;
        }

        println!("  {} deploying {}", ">>".blue().bold(), key);
        if let Err(e) = deploy::deploy(gw, address, &key, self.run.deploy_with_yes).await {
            return self.fail(address, e, snap);
        }
        println!("  {} deployed", "ok".green().bold());
        if let Some(end) = self.interrupted(address, Step::Deploy, true, snap) {
            return end;
        }

        let steps = [
            Step::Start,
            Step::MaintenanceGate,
            Step::StartTimer,
            Step::MaintenanceOff,
            Step::Health,
        ];
        for step in steps {
            let result = match step {
                Step::Start => verify::start_node(gw, address).await,
                Step::MaintenanceGate => verify::maintenance_gate(gw, address).await,
                Step::StartTimer => verify::start_timers(gw, address).await,
                Step::MaintenanceOff => verify::maintenance_off(gw, address).await,
                _ => verify::health_gate(gw, address).await,
            };
            if let Err(e) = result {
                return self.fail(address, e, snap);
            }
            if let Some(end) = self.interrupted(address, step, true, snap) {
                return end;
            }
        }

        let before = state.fingerprint.as_deref();
        if let Err(e) =
            verify::verify_version(gw, address, before, self.run.target_hash.as_deref()).await
        {
            return self.fail(address, e, snap);
        }

        self.finish(address, UpgradeStatus::Success, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::NodeKind;

    fn fleet() -> Vec<Node> {
        vec![
            Node::new("a-cai", "alice", NodeKind::ShareAgent),
            Node::new("b-cai", "bob", NodeKind::ShareAgent),
            Node::new("", "carol", NodeKind::ShareAgent),
            Node::new("c-cai", "alice", NodeKind::ShareAgent),
            Node::new("llm-cai", "protocol", NodeKind::Infrastructure("MainerLlm".into())),
            Node::new("d-cai", "alice", NodeKind::OwnAgent),
        ]
    }

    fn addresses(nodes: &[Node]) -> Vec<&str> {
        nodes.iter().map(|n| n.address.as_str()).collect()
    }

    #[test]
    fn selects_eligible_addressable_nodes() {
        let selected = select(&fleet(), &Selection::default());
        assert_eq!(addresses(&selected.nodes), ["a-cai", "b-cai", "c-cai"]);
        assert_eq!(addresses(&selected.filtered), ["llm-cai", "d-cai"]);
    }

    #[test]
    fn owner_filter_then_cap_then_reverse() {
        let selection = Selection {
            owner: Some("alice".into()),
            max: Some(2),
            reverse: true,
            ..Selection::default()
        };
        let selected = select(&fleet(), &selection);
        assert_eq!(addresses(&selected.nodes), ["c-cai", "a-cai"]);
        assert!(addresses(&selected.filtered).contains(&"b-cai"));
    }

    #[test]
    fn cap_applies_before_reversal() {
        let selection = Selection {
            max: Some(2),
            reverse: true,
            ..Selection::default()
        };
        let selected = select(&fleet(), &selection);
        assert_eq!(addresses(&selected.nodes), ["b-cai", "a-cai"]);
    }

    #[test]
    fn specific_node_filter() {
        let selection = Selection {
            node: Some("b-cai".into()),
            ..Selection::default()
        };
        assert_eq!(addresses(&select(&fleet(), &selection).nodes), ["b-cai"]);
    }

    #[test]
    fn gate_answers() {
        assert_eq!(GateAnswer::parse(""), Some(GateAnswer::Upgrade));
        assert_eq!(GateAnswer::parse("Y\n"), Some(GateAnswer::Upgrade));
        assert_eq!(GateAnswer::parse("n"), Some(GateAnswer::Skip));
        assert_eq!(GateAnswer::parse("exit"), Some(GateAnswer::Exit));
        assert_eq!(GateAnswer::parse("maybe"), None);
    }

    #[test]
    fn every_step_maps_to_a_failure() {
        for step in [
            Step::Resolve,
            Step::MaintenanceOn,
            Step::Drain,
            Step::Snapshot,
            Step::Deploy,
            Step::Start,
            Step::MaintenanceGate,
            Step::StartTimer,
            Step::MaintenanceOff,
            Step::Health,
            Step::Version,
        ] {
            assert!(failure_status(step).is_failure(), "{}", step.name());
        }
    }
}
