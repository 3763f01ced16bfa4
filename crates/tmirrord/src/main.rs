//! tmirrord entry point.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

use tmirror_engine::{
    ChannelPublisher, FleetSnapshot, InMemoryControlPlane, MirrorEngine, PolicyStore,
};
use tmirrord::{init_logging, DaemonConfig, Host, LogFormat, Simulation, DEFAULT_CONFIG_PATH};

/// Traffic mirror session provisioning host
#[derive(Parser, Debug)]
#[command(name = "tmirrord")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Daemon configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Policy document; overrides the region-selected one
    #[arg(short, long)]
    policy: Option<PathBuf>,

    /// Region used to select the policy document
    #[arg(short, long, env = "TMIRROR_REGION")]
    region: Option<String>,

    /// Fleet snapshot (JSON) backing the in-memory control plane
    #[arg(long, global = true)]
    fleet: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Log format (plain, json); overrides the config file
    #[arg(long)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Handle an instance state-change or security-finding notification
    Event {
        /// Payload file, or - for stdin
        input: String,
    },
    /// Handle one backfill continuation message
    Backfill {
        /// Payload file, or - for stdin
        input: String,
    },
    /// Handle a provisioning lifecycle event
    Bootstrap {
        /// Payload file, or - for stdin
        input: String,
    },
    /// Dry-run events and a full backfill walk against the fleet snapshot
    Simulate {
        /// Start a backfill walk after the events
        #[arg(long)]
        start_backfill: bool,

        /// Event payload files, handled in order
        #[arg(long = "event")]
        events: Vec<PathBuf>,
    },
    /// Load and validate the policy document, then exit
    Validate,
}

enum Handler {
    Event,
    Backfill,
    Bootstrap,
}

fn read_payload(input: &str) -> anyhow::Result<Value> {
    let raw = if input == "-" {
        let mut raw = String::new();
        std::io::stdin().read_to_string(&mut raw).context("reading payload from stdin")?;
        raw
    } else {
        fs::read_to_string(input).with_context(|| format!("reading payload {}", input))?
    };
    serde_json::from_str(&raw).with_context(|| format!("parsing payload {}", input))
}

fn read_fleet(path: Option<&Path>) -> anyhow::Result<FleetSnapshot> {
    let Some(path) = path else {
        return Ok(FleetSnapshot::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading fleet snapshot {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing fleet snapshot {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(args: Args, config: DaemonConfig) -> anyhow::Result<()> {
    config.validate()?;

    let policy_path = match &args.policy {
        Some(path) => path.clone(),
        None => {
            let region =
                config.resolve_region(args.region.as_deref(), std::env::var("AWS_REGION").ok())?;
            config.policy_path(&region)
        }
    };
    let policies = PolicyStore::load_from_file(&policy_path, &config.engine)
        .with_context(|| format!("loading policy document {}", policy_path.display()))?;
    info!(path = %policy_path.display(), entries = policies.len(), "Policy document is valid");

    let fleet = read_fleet(args.fleet.as_deref())?;

    let (input, handler) = match args.command {
        Command::Validate => return Ok(()),
        Command::Simulate { start_backfill, events } => {
            if args.fleet.is_none() {
                bail!("simulate requires --fleet");
            }
            let events = events
                .iter()
                .map(|path| read_payload(&path.to_string_lossy()))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let report = Simulation {
                fleet,
                policies,
                settings: config.engine.clone(),
                topic: config.daemon.backfill_topic.clone(),
                start_backfill,
                events,
            }
            .run()
            .await?;
            return print_json(&report);
        }
        Command::Event { input } => (input, Handler::Event),
        Command::Backfill { input } => (input, Handler::Backfill),
        Command::Bootstrap { input } => (input, Handler::Bootstrap),
    };

    let payload = read_payload(&input)?;
    let control_plane = Arc::new(InMemoryControlPlane::from_snapshot(fleet));
    let (publisher, mut rx) = ChannelPublisher::new();
    let engine = MirrorEngine::new(control_plane, policies, config.engine.clone());
    let host = Host::new(engine, Arc::new(publisher));

    let outcome = match handler {
        Handler::Event => host.handle_event(&payload).await?,
        Handler::Backfill => host.handle_backfill(&payload).await?,
        Handler::Bootstrap => host.handle_bootstrap(&payload).await?,
    };
    print_json(&outcome)?;

    // Published continuations go to stdout after the outcome.
    while let Ok(message) = rx.try_recv() {
        print_json(&message)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match DaemonConfig::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tmirrord: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let level = args.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, args.log_format.unwrap_or(config.logging.format));

    match run(args, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("tmirrord failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
