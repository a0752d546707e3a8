//! tidectl — TideOps operator CLI
//!
//! Runs one scale-down tick against a cluster, or inspects and cancels a
//! rolling instance refresh from its persisted state blob. Results go to
//! stdout as JSON so the output composes with the rest of the tooling.

use std::path::PathBuf;

use chrono::Utc;
use clap::{Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tide_proto::{HostGroupInfo, RefreshState};
use tide_rpc::{JrpcPool, PoolConfig};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "tidectl")]
#[command(about = "TideOps storage fleet control plane")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scale-down tick and print the scale response
    ScaleDown {
        /// Path to a host group info JSON file
        #[arg(short, long)]
        info: PathBuf,

        /// Management API port on the backends
        #[arg(long, default_value_t = 14000)]
        port: u16,

        /// Fix the backend IP shuffle (testing)
        #[arg(long)]
        seed: Option<u64>,

        /// Evaluate timeouts against this instant instead of the wall clock
        #[arg(long)]
        now: Option<chrono::DateTime<Utc>>,
    },

    /// Print the progress of a rolling instance refresh
    RefreshStatus {
        /// Path to the persisted refresh state blob
        #[arg(short, long)]
        state: PathBuf,

        /// Optional JSON file with the current instance id list
        #[arg(long)]
        instances: Option<PathBuf>,
    },

    /// Cancel a rolling instance refresh
    RefreshCancel {
        /// Path to the persisted refresh state blob
        #[arg(short, long)]
        state: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("tidectl=info".parse()?))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::ScaleDown { info, port, seed, now } => run_scale_down(info, port, seed, now).await,
        Commands::RefreshStatus { state, instances } => refresh_status(state, instances),
        Commands::RefreshCancel { state } => refresh_cancel(state),
    }
}

// ─── Scale down ──────────────────────────────────────────────────────────────

async fn run_scale_down(
    info_path: PathBuf,
    port: u16,
    seed: Option<u64>,
    now: Option<chrono::DateTime<Utc>>,
) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(&info_path)?;
    let info: HostGroupInfo = serde_json::from_str(&raw)?;
    info!(
        role = %info.role,
        backends = info.backend_ips.len(),
        desired = info.storage_backends_desired_capacity,
        "loaded host group info"
    );

    let config = PoolConfig {
        port,
        username: info.username.clone(),
        password: info.password.clone(),
        ..Default::default()
    };
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let pool = JrpcPool::new(info.backend_ips.clone(), config, &mut rng);

    match tide_scale::scale_down(&pool, &info, now.unwrap_or_else(Utc::now)).await {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, fatal = e.is_fatal(), "scale down failed");
            anyhow::bail!("{e}")
        }
    }
}

// ─── Refresh ─────────────────────────────────────────────────────────────────

fn load_state(path: &PathBuf) -> anyhow::Result<RefreshState> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn refresh_status(state_path: PathBuf, instances_path: Option<PathBuf>) -> anyhow::Result<()> {
    let state = load_state(&state_path)?;

    let instance_ids: Option<Vec<String>> = match instances_path {
        Some(path) => Some(serde_json::from_str(&std::fs::read_to_string(path)?)?),
        None => None,
    };

    let progress = tide_refresh::calculate_progress(&state, instance_ids.as_deref(), Utc::now());
    println!("{}", serde_json::to_string_pretty(&progress)?);
    Ok(())
}

fn refresh_cancel(state_path: PathBuf) -> anyhow::Result<()> {
    let mut state = load_state(&state_path)?;
    if !tide_refresh::is_in_progress(Some(&state)) {
        anyhow::bail!("no refresh in progress (phase: {})", state.phase);
    }

    tide_refresh::mark_cancelled(&mut state, Utc::now());
    std::fs::write(&state_path, serde_json::to_string_pretty(&state)?)?;
    info!(path = %state_path.display(), "refresh cancelled");

    let progress = tide_refresh::calculate_progress(&state, None, Utc::now());
    println!("{}", serde_json::to_string_pretty(&progress)?);
    Ok(())
}
