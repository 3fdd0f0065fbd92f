//! Shardline Balancer
//!
//! Loads a cluster snapshot into the in-memory data source and runs the
//! balancer service against it, either until interrupted or for a fixed
//! number of passes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use shardline_balancer::{ActionExecutor, BalancerConfig, BalancerService, InMemoryCluster};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shardline-balancer")]
#[command(about = "Shardline tablet load balancer")]
struct Cli {
    /// Cluster snapshot (JSON) to balance
    #[arg(long, env = "SHARDLINE_SNAPSHOT")]
    snapshot: PathBuf,

    /// Balancer configuration file (TOML)
    #[arg(long, env = "SHARDLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Interval between passes in seconds
    #[arg(long)]
    pass_interval: Option<u64>,

    /// Maximum AddReplica tasks in flight
    #[arg(long)]
    max_concurrent_adds: Option<usize>,

    /// Maximum RemoveReplica tasks in flight
    #[arg(long)]
    max_concurrent_removals: Option<usize>,

    /// Maximum StepDownLeader tasks in flight
    #[arg(long)]
    max_concurrent_leader_moves: Option<usize>,

    /// Print the plan without dispatching it
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Stop after this many passes
    #[arg(long)]
    passes: Option<u64>,

    /// Log as JSON
    #[arg(long, default_value = "false")]
    log_json: bool,
}

impl Cli {
    /// Defaults, then the config file, then `SHARDLINE_*`, then flags
    fn load_config(&self) -> anyhow::Result<BalancerConfig> {
        let mut config = match &self.config {
            Some(path) => BalancerConfig::from_toml_file(path)?,
            None => BalancerConfig::default(),
        };
        config.apply_env()?;

        if let Some(v) = self.pass_interval {
            config.pass_interval_secs = v;
        }
        if self.dry_run {
            config.dry_run = true;
        }
        for options in &mut config.passes {
            if let Some(v) = self.max_concurrent_adds {
                options.max_concurrent_adds = v;
            }
            if let Some(v) = self.max_concurrent_removals {
                options.max_concurrent_removals = v;
            }
            if let Some(v) = self.max_concurrent_leader_moves {
                options.max_concurrent_leader_moves = v;
            }
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = cli.load_config()?;
    let source = Arc::new(
        InMemoryCluster::from_json_file(&cli.snapshot)
            .with_context(|| format!("loading snapshot {}", cli.snapshot.display()))?,
    );

    info!(
        snapshot = %cli.snapshot.display(),
        passes = ?cli.passes,
        pass_interval = config.pass_interval_secs,
        dry_run = config.dry_run,
        "Starting Shardline balancer"
    );

    let (executor, mut progress_rx) = ActionExecutor::with_progress(config.executor.clone());
    let mut service = BalancerService::with_executor(source.clone(), config, executor);

    // Spawn progress reporter
    tokio::spawn(async move {
        while let Some(update) = progress_rx.recv().await {
            info!(
                action = %update.action,
                status = ?update.status,
                "Dispatch progress"
            );
        }
    });

    let cancel = service.cancellation_token();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                cancel.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    let cycles = service.run(cli.passes).await;

    let state = source.state();
    println!("Ran {} cycles", cycles);
    println!("{:<16} {:>10} {:>10}", "NODE", "REPLICAS", "LEADERS");
    for node in &state.nodes {
        println!(
            "{:<16} {:>10} {:>10}",
            node.id,
            source.replicas_on(&node.id),
            source.leaders_on(&node.id)
        );
    }

    Ok(())
}
