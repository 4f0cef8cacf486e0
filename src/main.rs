use std::path::PathBuf;

use clap::{Parser, Subcommand};

use fleet_upgrade::commands;
use fleet_upgrade::config;
use fleet_upgrade::orchestrator::{OrchestrationRun, Selection};

#[derive(Parser)]
#[command(
    name = "fleet-upgrade",
    version,
    about = "Safe rolling upgrades for a fleet of remote agent nodes"
)]
struct Cli {
    /// Path to config file (default: ~/.config/fleet-upgrade/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit console log events as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upgrade the selected nodes one at a time
    Upgrade {
        /// Target network (e.g. ic, testing, local)
        #[arg(long)]
        network: String,

        /// Expected module hash after upgrade; nodes already running it are skipped
        #[arg(long)]
        target_hash: Option<String>,

        /// Process at most this many nodes (applied after filtering, before --reverse)
        #[arg(long)]
        num: Option<usize>,

        /// Only upgrade the node with this address
        #[arg(long)]
        mainer: Option<String>,

        /// Only upgrade nodes owned by this principal
        #[arg(long)]
        user: Option<String>,

        /// Process the selected nodes in reverse order
        #[arg(long)]
        reverse: bool,

        /// Log every mutating call instead of making it
        #[arg(long)]
        dry_run: bool,

        /// Ask before upgrading each node (y/n/exit)
        #[arg(long)]
        ask_before_upgrade: bool,

        /// Pass --yes to the deploy command
        #[arg(long)]
        deploy_with_yes: bool,

        /// Do not refresh the deployment mapping first
        #[arg(long)]
        skip_preparation: bool,

        /// Skip the live-run confirmation prompt
        #[arg(long)]
        no_confirm: bool,

        /// Keep going after a node fails instead of stopping the run
        #[arg(long)]
        continue_on_failure: bool,
    },

    /// Survey fleet health with bounded parallelism (read-only)
    Health {
        /// Target network
        #[arg(long)]
        network: String,

        /// Concurrent health checks (overrides config)
        #[arg(long)]
        workers: Option<usize>,

        /// Only survey nodes owned by this principal
        #[arg(long)]
        user: Option<String>,
    },

    /// Print a saved upgrade status file as a grouped report
    Report {
        /// Path to an upgrade_status_*.json file
        path: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Upgrade {
            network,
            target_hash,
            num,
            mainer,
            user,
            reverse,
            dry_run,
            ask_before_upgrade,
            deploy_with_yes,
            skip_preparation,
            no_confirm,
            continue_on_failure,
        } => {
            let cfg = config::load(cli.config.as_deref())?;
            let run = OrchestrationRun {
                network,
                target_hash,
                selection: Selection {
                    owner: user,
                    node: mainer,
                    max: num,
                    reverse,
                },
                dry_run,
                ask_before_upgrade,
                deploy_with_yes,
                continue_on_failure,
            };
            commands::upgrade::run(
                cfg,
                commands::upgrade::UpgradeOptions {
                    run,
                    skip_preparation,
                    no_confirm,
                    log_json: cli.log_json,
                },
            )
        }
        Commands::Health {
            network,
            workers,
            user,
        } => {
            let cfg = config::load(cli.config.as_deref())?;
            commands::health::run(cfg, &network, workers, user.as_deref(), cli.log_json)
        }
        Commands::Report { path } => commands::report::run(&path),
    }
}
