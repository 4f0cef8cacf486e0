//! `fleet-upgrade health`: read-only health survey of the fleet.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use colored::Colorize;

use crate::config::Config;
use crate::domain::status::write_atomic;
use crate::logging::{self, LogOptions};
use crate::registry;
use crate::remote::dfx::DfxClient;
use crate::remote::Gateway;
use crate::survey;

pub fn run(
    cfg: Config,
    network: &str,
    workers: Option<usize>,
    owner: Option<&str>,
    log_json: bool,
) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(cfg, network, workers, owner, log_json))
}

async fn run_async(
    cfg: Config,
    network: &str,
    workers: Option<usize>,
    owner: Option<&str>,
    log_json: bool,
) -> Result<()> {
    logging::init(LogOptions {
        level: &cfg.log_level,
        json: log_json,
        file: None,
    })?;

    let workers = workers.unwrap_or(cfg.survey.workers);
    let client = Arc::new(DfxClient::new(&cfg.dfx));
    let gw = Arc::new(Gateway::new(client, network, &cfg));

    let nodes: Vec<_> = registry::fetch_nodes(&gw, &cfg.dfx)
        .await?
        .into_iter()
        .filter(|n| !n.address.is_empty() && n.kind.is_upgrade_eligible())
        .filter(|n| owner.map_or(true, |o| n.owner == o))
        .collect();
    if nodes.is_empty() {
        bail!("no nodes to survey on {network}");
    }

    println!(
        "{} Surveying {} node(s) on {} with {} workers...",
        "::".blue().bold(),
        nodes.len(),
        network.bold(),
        workers
    );
    let report = survey::run(Arc::clone(&gw), nodes, workers).await;

    println!();
    println!(
        "  {} healthy   {}",
        "ok".green().bold(),
        report.healthy.to_string().bold()
    );
    println!(
        "  {} unhealthy {}",
        "!!".red().bold(),
        report.unhealthy.len().to_string().bold()
    );
    for entry in &report.unhealthy {
        println!(
            "     {} {} {}",
            entry.address,
            format!("(owner {})", entry.owner).dimmed(),
            entry.detail.as_deref().unwrap_or_default()
        );
    }

    let path = PathBuf::from(&cfg.output_dir).join(format!(
        "health_{}_{}.json",
        network,
        Utc::now().format("%Y%m%d_%H%M%S")
    ));
    let json = serde_json::to_string_pretty(&report).context("failed to serialize survey")?;
    write_atomic(&path, &json).await?;
    println!("   report  {}", path.display());

    if !report.unhealthy.is_empty() {
        bail!("{} of {} node(s) unhealthy", report.unhealthy.len(), report.total);
    }
    Ok(())
}
