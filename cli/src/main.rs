use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use keel_kernel::ids::{JobId, TxnId};
use keel_kernel::invariants::InvariantEngine;
use keel_kernel::log::{FileLogStore, StateLog};
use keel_kernel::replay::{self, replay_state, RecoveredState};
use keel_kernel::KernelConfig;

/// Keel frontend state log tool
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(about = "Inspect and maintain a Keel frontend state log", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay the log and print what a restarted frontend would recover
    Inspect {
        /// Directory holding the state log
        #[arg(long)]
        log_dir: PathBuf,

        /// Path to kernel config JSON
        #[arg(long)]
        config: Option<PathBuf>,

        /// Print every recovered record instead of a summary
        #[arg(long)]
        full: bool,
    },

    /// Fold the log into a checkpoint
    Compact {
        #[arg(long)]
        log_dir: PathBuf,

        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Serialize)]
struct Summary {
    last_seq: u64,
    last_txn_id: u64,
    last_job_id: u64,
    last_publish_version: u64,
    transactions: BTreeMap<String, usize>,
    pending_publish: Vec<TxnId>,
    live_jobs: Vec<JobId>,
    jobs: BTreeMap<String, usize>,
    quota_overrides: usize,
    installed_schemas: usize,
}

impl Summary {
    fn of(state: &RecoveredState) -> Self {
        let mut transactions = BTreeMap::new();
        for txn in state.transactions.values() {
            *transactions.entry(txn.state.to_string()).or_insert(0) += 1;
        }
        let mut jobs = BTreeMap::new();
        for job in state.jobs.values() {
            *jobs.entry(job.state.to_string()).or_insert(0) += 1;
        }
        Self {
            last_seq: state.last_seq,
            last_txn_id: state.last_txn_id,
            last_job_id: state.last_job_id,
            last_publish_version: state.last_publish_version,
            transactions,
            pending_publish: state.unpublished().map(|t| t.id).collect(),
            live_jobs: state.live_jobs().map(|j| j.id).collect(),
            jobs,
            quota_overrides: state.quotas.len(),
            installed_schemas: state.schemas.len(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CompactOutput {
    absorbed: u64,
    last_seq: u64,
}

fn load_config(path: Option<PathBuf>) -> Result<KernelConfig> {
    let config = match path {
        Some(path) => KernelConfig::from_json_file(&path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => KernelConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn open_log(dir: &Path) -> Result<StateLog> {
    let store = FileLogStore::open(dir)
        .with_context(|| format!("opening state log in {}", dir.display()))?;
    Ok(StateLog::open(Box::new(store))?)
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("keel=info,keel_kernel=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Inspect {
            log_dir,
            config,
            full,
        } => {
            let config = load_config(config)?;
            let log = open_log(&log_dir)?;
            let invariants = InvariantEngine::with_defaults(config.publish_quorum);
            let state = replay_state(log.load()?, &invariants)?;

            if full {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&Summary::of(&state))?);
            }
        }

        Command::Compact { log_dir, config } => {
            let config = load_config(config)?;
            let log = open_log(&log_dir)?.shared();
            let invariants = InvariantEngine::with_defaults(config.publish_quorum);
            let absorbed = replay::compact(&log, &invariants)?;

            let output = CompactOutput {
                absorbed,
                last_seq: log.lock().last_seq(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
