//! Hokkaido: shop-floor dashboard sync core
//!
//! Main binary with subcommands:
//! - `simulate`: Run a scripted shift against the in-memory store and
//!   print subsystem statistics
//! - `normalize`: Show how machine keys are normalized for lookup
//! - `collections`: List known collections with their TTLs and
//!   invalidation targets

use clap::{Parser, Subcommand};
use hokkaido_sync::{ReplayPolicy, SyncConfig};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod catalogue;
mod simulate;

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "hokkaido")]
#[command(about = "Cache and sync core of the Hokkaido shop-floor dashboard", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted shift against the in-memory store
    Simulate {
        /// Number of machines on the floor (H01, H02, ...)
        #[arg(long, env = "HOKKAIDO_MACHINES", default_value = "6")]
        machines: u8,

        /// Number of simulation ticks
        #[arg(long, env = "HOKKAIDO_TICKS", default_value = "24")]
        ticks: u32,

        /// Wall-clock length of one tick in milliseconds
        #[arg(long, env = "HOKKAIDO_TICK_MS", default_value = "25")]
        tick_ms: u64,

        /// Shared state TTL in seconds
        #[arg(long, env = "HOKKAIDO_STATE_TTL_SECS", default_value = "300")]
        state_ttl_secs: u64,

        /// Query cache TTL in seconds
        #[arg(long, env = "HOKKAIDO_QUERY_CACHE_TTL_SECS", default_value = "300")]
        query_cache_ttl_secs: u64,

        /// Maximum deletes per committed batch (1-500)
        #[arg(long, env = "HOKKAIDO_MAX_BATCH_SIZE", default_value = "500")]
        max_batch_size: usize,

        /// Delay before the mirror restarts after a subscription failure
        #[arg(long, env = "HOKKAIDO_MIRROR_RESTART_DELAY_SECS", default_value = "30")]
        mirror_restart_delay_secs: u64,

        /// Apply replayed snapshots when they differ from the mirror instead
        /// of discarding them.
        /// Accepts 1/true/yes/on or 0/false/no/off; anything else is rejected.
        #[arg(long, env = "HOKKAIDO_DIFF_REPLAYS", value_parser = parse_bool_env, default_value = "false")]
        diff_replays: bool,
    },

    /// Normalize machine keys the way the live mirror indexes them
    Normalize {
        /// Keys to normalize
        #[arg(value_name = "KEY", required = true)]
        keys: Vec<String>,
    },

    /// List known collections
    Collections,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "hokkaido=info,hokkaido_sync=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            machines,
            ticks,
            tick_ms,
            state_ttl_secs,
            query_cache_ttl_secs,
            max_batch_size,
            mirror_restart_delay_secs,
            diff_replays,
        } => {
            let config = SyncConfig {
                state_ttl_secs,
                query_cache_ttl_secs,
                max_batch_size,
                mirror_restart_delay_secs,
                replay_policy: if diff_replays {
                    ReplayPolicy::DiffAndApply
                } else {
                    ReplayPolicy::Discard
                },
                ..SyncConfig::default()
            };
            simulate::run(
                config,
                simulate::Shift {
                    machines,
                    ticks,
                    tick: std::time::Duration::from_millis(tick_ms),
                },
            )
            .await
        }

        Commands::Normalize { keys } => {
            for key in keys {
                println!("{key:?} -> {}", hokkaido_sync::normalize_key(&key));
            }
            Ok(())
        }

        Commands::Collections => catalogue::print(),
    }
}
