//! Per-run upgrade status: the status store and the reports rendered from it.
//!
//! The store is the only owner of node outcomes. Components report results
//! back to the orchestrator, which records them here; the report writers
//! persist a snapshot of it as JSON and as a grouped markdown document.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeStatus {
    Pending,
    InProgress,
    Success,
    SkippedAlreadyUpgraded,
    SkippedUserChoice,
    SkippedFiltered,
    FailedDrainTimer,
    FailedSnapshot,
    FailedDeploy,
    FailedStart,
    FailedHealth,
    FailedStartTimer,
    FailedMaintenance,
    FailedOther,
}

impl UpgradeStatus {
    /// Report order.
    pub const ALL: [UpgradeStatus; 14] = [
        UpgradeStatus::Success,
        UpgradeStatus::FailedDrainTimer,
        UpgradeStatus::FailedSnapshot,
        UpgradeStatus::FailedDeploy,
        UpgradeStatus::FailedStart,
        UpgradeStatus::FailedMaintenance,
        UpgradeStatus::FailedStartTimer,
        UpgradeStatus::FailedHealth,
        UpgradeStatus::FailedOther,
        UpgradeStatus::SkippedAlreadyUpgraded,
        UpgradeStatus::SkippedUserChoice,
        UpgradeStatus::SkippedFiltered,
        UpgradeStatus::InProgress,
        UpgradeStatus::Pending,
    ];

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            UpgradeStatus::FailedDrainTimer
                | UpgradeStatus::FailedSnapshot
                | UpgradeStatus::FailedDeploy
                | UpgradeStatus::FailedStart
                | UpgradeStatus::FailedHealth
                | UpgradeStatus::FailedStartTimer
                | UpgradeStatus::FailedMaintenance
                | UpgradeStatus::FailedOther
        )
    }

    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            UpgradeStatus::SkippedAlreadyUpgraded
                | UpgradeStatus::SkippedUserChoice
                | UpgradeStatus::SkippedFiltered
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, UpgradeStatus::Pending | UpgradeStatus::InProgress)
    }

    /// snake_case key used in the JSON report.
    pub fn key(&self) -> &'static str {
        match self {
            UpgradeStatus::Pending => "pending",
            UpgradeStatus::InProgress => "in_progress",
            UpgradeStatus::Success => "success",
            UpgradeStatus::SkippedAlreadyUpgraded => "skipped_already_upgraded",
            UpgradeStatus::SkippedUserChoice => "skipped_user_choice",
            UpgradeStatus::SkippedFiltered => "skipped_filtered",
            UpgradeStatus::FailedDrainTimer => "failed_drain_timer",
            UpgradeStatus::FailedSnapshot => "failed_snapshot",
            UpgradeStatus::FailedDeploy => "failed_deploy",
            UpgradeStatus::FailedStart => "failed_start",
            UpgradeStatus::FailedHealth => "failed_health",
            UpgradeStatus::FailedStartTimer => "failed_start_timer",
            UpgradeStatus::FailedMaintenance => "failed_maintenance",
            UpgradeStatus::FailedOther => "failed_other",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            UpgradeStatus::Pending => "Pending (not reached)",
            UpgradeStatus::InProgress => "In progress",
            UpgradeStatus::Success => "Success",
            UpgradeStatus::SkippedAlreadyUpgraded => "Skipped: already upgraded",
            UpgradeStatus::SkippedUserChoice => "Skipped: user choice",
            UpgradeStatus::SkippedFiltered => "Skipped: filtered",
            UpgradeStatus::FailedDrainTimer => "Failed: drain / stop timer",
            UpgradeStatus::FailedSnapshot => "Failed: snapshot",
            UpgradeStatus::FailedDeploy => "Failed: deploy",
            UpgradeStatus::FailedStart => "Failed: start",
            UpgradeStatus::FailedHealth => "Failed: health",
            UpgradeStatus::FailedStartTimer => "Failed: start timer",
            UpgradeStatus::FailedMaintenance => "Failed: maintenance mode",
            UpgradeStatus::FailedOther => "Failed: other",
        }
    }
}

impl fmt::Display for UpgradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A best-effort action taken to leave a node in a safer state after a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compensation {
    pub action: String,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: UpgradeStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compensations: Vec<Compensation>,
}

impl StatusRecord {
    fn new(status: UpgradeStatus) -> Self {
        Self {
            status,
            timestamp: Utc::now(),
            error: None,
            snapshot_id: None,
            compensations: Vec::new(),
        }
    }
}

// ── Store ──────────────────────────────────────────────────

/// Address → outcome for one run. Safe to share between workers writing
/// distinct addresses.
#[derive(Debug, Default)]
pub struct StatusStore {
    records: Mutex<BTreeMap<String, StatusRecord>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_records<R>(&self, f: impl FnOnce(&mut BTreeMap<String, StatusRecord>) -> R) -> R {
        let mut guard = match self.records.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Register a node that passed selection.
    pub fn register(&self, address: &str) {
        self.with_records(|r| {
            r.entry(address.to_string())
                .or_insert_with(|| StatusRecord::new(UpgradeStatus::Pending));
        });
    }

    /// Move a node to `status`.
    ///
    /// Terminal records are final: a second terminal transition is refused
    /// and `false` is returned.
    pub fn set(&self, address: &str, status: UpgradeStatus, error: Option<String>) -> bool {
        self.with_records(|r| {
            let record = r
                .entry(address.to_string())
                .or_insert_with(|| StatusRecord::new(UpgradeStatus::Pending));
            if record.status.is_terminal() {
                warn!(
                    address,
                    current = %record.status,
                    refused = %status,
                    "status already final"
                );
                return false;
            }
            record.status = status;
            record.timestamp = Utc::now();
            if error.is_some() {
                record.error = error;
            }
            true
        })
    }

    pub fn attach_snapshot(&self, address: &str, snapshot_id: &str) {
        self.with_records(|r| {
            if let Some(record) = r.get_mut(address) {
                record.snapshot_id = Some(snapshot_id.to_string());
            }
        });
    }

    pub fn add_compensation(&self, address: &str, compensation: Compensation) {
        self.with_records(|r| {
            if let Some(record) = r.get_mut(address) {
                record.compensations.push(compensation);
            }
        });
    }

    pub fn get(&self, address: &str) -> Option<StatusRecord> {
        self.with_records(|r| r.get(address).cloned())
    }

    pub fn records(&self) -> BTreeMap<String, StatusRecord> {
        self.with_records(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.with_records(|r| r.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, status: UpgradeStatus) -> usize {
        self.with_records(|r| r.values().filter(|rec| rec.status == status).count())
    }

    pub fn has_failures(&self) -> bool {
        self.with_records(|r| r.values().any(|rec| rec.status.is_failure()))
    }

    pub fn summary(&self) -> BTreeMap<String, usize> {
        summarize(&self.records())
    }
}

fn summarize(records: &BTreeMap<String, StatusRecord>) -> BTreeMap<String, usize> {
    let mut summary = BTreeMap::new();
    for rec in records.values() {
        *summary.entry(rec.status.key().to_string()).or_insert(0) += 1;
    }
    summary
}

// ── Reports ────────────────────────────────────────────────

/// Persisted form of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub network: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub host: String,
    pub dry_run: bool,
    pub summary: BTreeMap<String, usize>,
    pub nodes: BTreeMap<String, StatusRecord>,
}

impl RunReport {
    pub fn from_store(
        store: &StatusStore,
        network: &str,
        started_at: DateTime<Utc>,
        dry_run: bool,
    ) -> Self {
        let nodes = store.records();
        Self {
            network: network.to_string(),
            started_at,
            finished_at: Utc::now(),
            host: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".into()),
            dry_run,
            summary: summarize(&nodes),
            nodes,
        }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Addresses grouped by outcome, in report order, omitting empty groups.
    pub fn grouped(&self) -> Vec<(UpgradeStatus, Vec<(&String, &StatusRecord)>)> {
        UpgradeStatus::ALL
            .iter()
            .filter_map(|status| {
                let members: Vec<_> = self
                    .nodes
                    .iter()
                    .filter(|(_, rec)| rec.status == *status)
                    .collect();
                (!members.is_empty()).then_some((*status, members))
            })
            .collect()
    }

    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("# Upgrade Status Report\n\n");
        out.push_str(&format!("- Network: `{}`\n", self.network));
        out.push_str(&format!("- Host: `{}`\n", self.host));
        out.push_str(&format!("- Started: {}\n", self.started_at.to_rfc3339()));
        out.push_str(&format!("- Finished: {}\n", self.finished_at.to_rfc3339()));
        if self.dry_run {
            out.push_str("- Mode: **dry run** (no mutating calls were made)\n");
        }
        out.push_str(&format!("- Nodes: {}\n\n", self.nodes.len()));

        out.push_str("## Summary\n\n| Status | Count |\n|---|---|\n");
        let groups = self.grouped();
        for (status, members) in &groups {
            out.push_str(&format!("| {} | {} |\n", status.title(), members.len()));
        }

        for (status, members) in &groups {
            out.push_str(&format!("\n## {} ({})\n\n", status.title(), members.len()));
            for (address, rec) in members {
                out.push_str(&format!("- `{address}`"));
                if let Some(err) = &rec.error {
                    out.push_str(&format!(": {err}"));
                }
                out.push('\n');
                if let Some(snap) = &rec.snapshot_id {
                    out.push_str(&format!("  - snapshot: `{snap}`\n"));
                }
                for c in &rec.compensations {
                    let outcome = if c.succeeded { "ok" } else { "FAILED" };
                    match &c.detail {
                        Some(d) => out.push_str(&format!("  - {}: {outcome} ({d})\n", c.action)),
                        None => out.push_str(&format!("  - {}: {outcome}\n", c.action)),
                    }
                }
            }
        }
        out
    }
}

/// Where a run's reports were written.
#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub json: PathBuf,
    pub markdown: PathBuf,
}

/// Write the JSON and markdown reports for `report` under `dir`.
pub async fn write_reports(dir: &Path, report: &RunReport) -> Result<ReportPaths> {
    let stamp = report.started_at.format("%Y%m%d_%H%M%S");
    let base = format!("upgrade_status_{}_{}", report.network, stamp);
    let paths = ReportPaths {
        json: dir.join(format!("{base}.json")),
        markdown: dir.join(format!("{base}.md")),
    };
    let json = serde_json::to_string_pretty(report).context("failed to serialize status report")?;
    write_atomic(&paths.json, &json).await?;
    write_atomic(&paths.markdown, &report.render_markdown()).await?;
    Ok(paths)
}

/// Write to a `.tmp` sibling, then rename over the final path.
pub async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, content)
        .await
        .with_context(|| format!("writing temp file {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
    Ok(())
}
