use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::DateTime;
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::{FileStore, LimitConfig, PersistedRateLimiter, TollgateError};

/// Inspect and drive a persisted per-identity rate limiter.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Store file, overriding the configuration
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Record namespace prefix, overriding the configuration
    #[arg(long, global = true)]
    prefix: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register an identity, restoring its persisted budget
    Create { identity: String },
    /// Take up to COUNT tokens from an identity
    Take { identity: String, count: u64 },
    /// Print the tokens available to an identity
    Available { identity: String },
    /// Persist and drop an identity, optionally banning it
    Remove {
        identity: String,
        /// Ban duration in seconds; 0 means no ban
        #[arg(long, default_value_t = 0)]
        ban_secs: u64,
    },
    /// Change an identity's limit for this run, keeping its consumed budget
    UpdateConfig {
        identity: String,
        #[command(flatten)]
        limit: LimitArgs,
    },
    /// Persist a limit override used whenever the identity is created
    SetOverride {
        identity: String,
        #[command(flatten)]
        limit: LimitArgs,
    },
    /// Delete a persisted limit override
    ClearOverride { identity: String },
    /// Show an identity's budget and ban state
    Status { identity: String },
}

#[derive(Debug, Args)]
struct LimitArgs {
    /// Refill interval in milliseconds
    #[arg(long)]
    interval_ms: u64,
    /// Bucket capacity
    #[arg(long)]
    capacity: u64,
    /// Tokens added per interval
    #[arg(long, default_value_t = 1)]
    quantum: u64,
}

impl LimitArgs {
    fn to_limit_config(&self) -> LimitConfig {
        LimitConfig::new(
            Duration::from_millis(self.interval_ms),
            self.capacity,
            self.quantum,
        )
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = match &cli.config {
        Some(path) => TollgateConfig::from_file(path)?,
        None => TollgateConfig::default(),
    };
    if let Some(store) = cli.store.clone() {
        config.store.path = store;
    }
    if let Some(prefix) = cli.prefix.clone() {
        config.store.prefix = prefix;
    }
    debug!(?config, "Configuration loaded");

    let store = FileStore::open(&config.store.path)
        .with_context(|| format!("opening store {}", config.store.path.display()))?;
    let limiter = PersistedRateLimiter::new(
        Arc::new(store),
        config.limits.to_limit_config()?,
        config.store.prefix.clone().into_bytes(),
    )?;

    let outcome = run(&limiter, cli.command);
    limiter.shutdown().context("flushing limiter state")?;
    outcome
}

fn run(limiter: &PersistedRateLimiter, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Create { identity } => {
            limiter.create(identity.as_bytes())?;
            println!("{}", limiter.available(identity.as_bytes()));
        }
        Command::Take { identity, count } => {
            limiter.create(identity.as_bytes())?;
            println!("{}", limiter.take_available(identity.as_bytes(), count));
        }
        Command::Available { identity } => {
            limiter.create(identity.as_bytes())?;
            println!("{}", limiter.available(identity.as_bytes()));
        }
        Command::Remove { identity, ban_secs } => {
            let id = identity.as_bytes();
            // A banned identity can still be removed; its state just is not loaded.
            if limiter.blacklist_deadline(id)?.is_none() {
                limiter.create(id)?;
            }
            limiter.remove(id, Duration::from_secs(ban_secs))?;
            info!(identity = %identity, ban_secs, "Removed identity");
        }
        Command::UpdateConfig { identity, limit } => {
            limiter.create(identity.as_bytes())?;
            limiter.update_config(identity.as_bytes(), limit.to_limit_config())?;
            println!("{}", limiter.available(identity.as_bytes()));
        }
        Command::SetOverride { identity, limit } => {
            limiter.set_config_override(identity.as_bytes(), limit.to_limit_config())?;
        }
        Command::ClearOverride { identity } => {
            limiter.clear_config_override(identity.as_bytes())?;
        }
        Command::Status { identity } => print_status(limiter, &identity)?,
    }
    Ok(())
}

fn print_status(limiter: &PersistedRateLimiter, identity: &str) -> anyhow::Result<()> {
    let id = identity.as_bytes();
    println!("identity:  {}", identity);

    if let Some(deadline) = limiter.blacklist_deadline(id)? {
        let until = i64::try_from(deadline)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .map_or_else(|| deadline.to_string(), |t| t.to_rfc3339());
        println!("banned:    until {}", until);
    }

    match limiter.create(id) {
        Err(TollgateError::Blacklisted { .. }) => return Ok(()),
        result => result?,
    }
    if let Some(bucket) = limiter.bucket(id) {
        println!("capacity:  {}", bucket.capacity());
        println!("available: {}", bucket.available());
        println!("rate:      {:.3} tokens/s", bucket.rate());
    }
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
