//! `fleet-upgrade upgrade`: rolling upgrade of the selected nodes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use colored::Colorize;
use tracing::info;

use crate::config::Config;
use crate::domain::status::{write_reports, RunReport, StatusStore, UpgradeStatus};
use crate::logging::{self, LogOptions};
use crate::orchestrator::{self, CancelToken, OrchestrationRun, Orchestrator, StopReason};
use crate::registry::{self, DeploymentMap};
use crate::remote::dfx::DfxClient;
use crate::remote::Gateway;

pub struct UpgradeOptions {
    pub run: OrchestrationRun,
    pub skip_preparation: bool,
    pub no_confirm: bool,
    pub log_json: bool,
}

pub fn run(cfg: Config, opts: UpgradeOptions) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(cfg, opts))
}

async fn run_async(cfg: Config, opts: UpgradeOptions) -> Result<()> {
    let started = Utc::now();
    let run = opts.run;
    let output_dir = PathBuf::from(&cfg.output_dir);
    let log_path = logging::execution_log_path(&output_dir, &run.network, started);
    logging::init(LogOptions {
        level: &cfg.log_level,
        json: opts.log_json,
        file: Some(log_path.clone()),
    })?;
    info!(
        network = %run.network,
        dry_run = run.dry_run,
        target_hash = ?run.target_hash,
        "upgrade run starting"
    );

    println!(
        "{} Fleet upgrade on {}{}",
        ">>".blue().bold(),
        run.network.bold(),
        if run.dry_run {
            " (dry run)".yellow().to_string()
        } else {
            String::new()
        }
    );
    if let Some(hash) = &run.target_hash {
        println!("   target module hash {}", hash.dimmed());
    }
    println!("   execution log {}", log_path.display().to_string().dimmed());

    if !run.dry_run && !opts.no_confirm && !confirm_live_run(&run.network)? {
        println!("{} Cancelled", "::".blue().bold());
        return Ok(());
    }

    let client = Arc::new(DfxClient::new(&cfg.dfx));
    let gw = Gateway::new(client, &run.network, &cfg).with_dry_run(run.dry_run);

    if opts.skip_preparation {
        println!("{} Skipping registry refresh", "::".blue().bold());
    } else {
        println!("{} Refreshing deployment mapping...", "::".blue().bold());
        registry::refresh(&gw, &cfg.dfx).await?;
    }

    let mapping_path = cfg.dfx.canister_ids_path();
    let mapping = DeploymentMap::load(&mapping_path)?;
    if mapping.is_empty() {
        bail!("deployment mapping {} has no entries", mapping_path.display());
    }

    println!("{} Fetching fleet listing...", "::".blue().bold());
    let nodes = registry::fetch_nodes(&gw, &cfg.dfx).await?;
    let selected = orchestrator::select(&nodes, &run.selection);
    if selected.nodes.is_empty() {
        bail!(
            "no nodes match the selection ({} listed, {} filtered out)",
            nodes.len(),
            selected.filtered.len()
        );
    }
    println!(
        "{} {} node(s) selected, {} filtered out",
        "::".blue().bold(),
        selected.nodes.len(),
        selected.filtered.len()
    );

    let cancel = CancelToken::new();
    cancel.watch_ctrl_c();

    let store = StatusStore::new();
    let outcome = Orchestrator::new(&gw, &run, &mapping, &store)
        .with_cancel(cancel)
        .run(&selected)
        .await;

    let report = RunReport::from_store(&store, &run.network, started, run.dry_run);
    let paths = write_reports(&output_dir, &report)
        .await
        .context("writing status reports")?;

    println!();
    match &outcome.stopped {
        Some(StopReason::FailFast { address }) => println!(
            "{} Stopped after failure on {} (use --continue-on-failure to keep going)",
            "!!".red().bold(),
            address
        ),
        Some(StopReason::OperatorExit) => println!("{} Stopped by operator", "::".blue().bold()),
        Some(StopReason::Interrupted) => println!("{} Interrupted", "!!".yellow().bold()),
        None => {}
    }
    print_summary(&store);
    println!("   status  {}", paths.json.display());
    println!("   report  {}", paths.markdown.display());

    if store.has_failures() {
        let failed: usize = UpgradeStatus::ALL
            .iter()
            .filter(|s| s.is_failure())
            .map(|s| store.count(*s))
            .sum();
        bail!("{failed} node(s) failed to upgrade");
    }
    Ok(())
}

fn confirm_live_run(network: &str) -> Result<bool> {
    eprintln!(
        "{} This will upgrade live nodes on {}.",
        "!!".yellow().bold(),
        network.bold()
    );
    eprint!("{} Type 'yes' to continue: ", "??".blue().bold());
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim() == "yes")
}

fn print_summary(store: &StatusStore) {
    println!("{}", "Summary".bold());
    for status in UpgradeStatus::ALL {
        let count = store.count(status);
        if count == 0 {
            continue;
        }
        let label = if status == UpgradeStatus::Success {
            status.title().green().to_string()
        } else if status.is_failure() {
            status.title().red().to_string()
        } else {
            status.title().to_string()
        };
        println!("  {:<32} {}", label, count);
    }
}
