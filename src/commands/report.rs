//! `fleet-upgrade report`: re-render a persisted status file.

use std::path::Path;

use anyhow::Result;
use colored::Colorize;

use crate::domain::status::{RunReport, UpgradeStatus};

pub fn run(path: &Path) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(RunReport::load(path))?;

    println!("{}", "═══ Upgrade Status Report ═══".cyan().bold());
    println!("  Network:   {}", report.network.bold());
    println!("  Host:      {}", report.host);
    println!("  Started:   {}", report.started_at.to_rfc3339());
    println!("  Finished:  {}", report.finished_at.to_rfc3339());
    if report.dry_run {
        println!("  Mode:      {}", "dry run".yellow());
    }

    for (status, members) in report.grouped() {
        println!();
        println!("{}", section_title(status, members.len()));
        for (address, rec) in members {
            match &rec.error {
                Some(err) => println!("  {} {}", address, err.dimmed()),
                None => println!("  {}", address),
            }
            if let Some(snap) = &rec.snapshot_id {
                println!("    snapshot {}", snap);
            }
            for c in &rec.compensations {
                let mark = if c.succeeded {
                    "ok".green().bold()
                } else {
                    "!!".red().bold()
                };
                println!("    {} {}", mark, c.action);
            }
        }
    }
    Ok(())
}

fn section_title(status: UpgradeStatus, count: usize) -> String {
    let title = format!("── {} ({}) ──", status.title(), count);
    if status == UpgradeStatus::Success {
        title.green().to_string()
    } else if status.is_failure() {
        title.red().to_string()
    } else if status.is_skip() {
        title.yellow().to_string()
    } else {
        title.dimmed().to_string()
    }
}
