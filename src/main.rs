// ABOUTME: CLI entry point for subgraph-replicator
// ABOUTME: Parses commands, resolves configuration and routes to command handlers

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use subgraph_replicator::commands;
use subgraph_replicator::config::{Config, ConfigOverrides};

#[derive(Parser)]
#[command(name = "subgraph-replicator")]
#[command(about = "Incremental, resumable subgraph-event-to-PostgreSQL replication CLI", long_about = None)]
#[command(version)]
struct Cli {
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to a TOML config file with [source], [target] and [sync] sections
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Descriptor registry TOML (defaults to the embedded registry)
    #[arg(long, global = true)]
    registry: Option<PathBuf>,
    /// Sync journal path (defaults to ~/.subgraph-replicator/sync-state.json)
    #[arg(long = "state-path", global = true)]
    state_path: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct ConnectionArgs {
    /// Subgraph GraphQL endpoint
    #[arg(long, env = "SUBGRAPH_ENDPOINT")]
    endpoint: Option<String>,
    /// Subgraph API key, sent as a bearer token
    #[arg(long = "api-key", env = "SUBGRAPH_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    /// Target PostgreSQL URL
    #[arg(long, env = "TARGET_URL", hide_env_values = true)]
    target: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Replicate new events into the target database
    Sync {
        #[command(flatten)]
        connection: ConnectionArgs,
        /// Event types to sync (repeatable; default: all)
        #[arg(long = "event")]
        events: Vec<String>,
        /// Only sync event types of this group
        #[arg(long)]
        group: Option<String>,
        /// Run a single pass and print the cycle reports as JSON
        #[arg(long)]
        once: bool,
        /// Seconds between passes in daemon mode
        #[arg(long)]
        interval: Option<u64>,
        /// Records per page (1-1000)
        #[arg(long = "page-size")]
        page_size: Option<usize>,
        /// Event types synced concurrently
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Show the last recorded cycle per event type
    Status {
        /// Print the raw journal as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the event types in the registry
    Events {
        #[arg(long)]
        group: Option<String>,
    },
    /// Validate configuration and registry
    Validate {
        #[command(flatten)]
        connection: ConnectionArgs,
        /// Also check that every target table exists with its mandatory columns
        #[arg(long = "check-target")]
        check_target: bool,
    },
    /// Print the GraphQL document a cycle would send
    Plan {
        #[arg(long)]
        event: String,
        /// Resume block number
        #[arg(long)]
        block: Option<i64>,
        /// Resume log index (requires --block)
        #[arg(long = "log-index")]
        log_index: Option<i64>,
    },
}

fn resolve_config(cli: &Cli, overrides: ConfigOverrides) -> anyhow::Result<Config> {
    let mut config = Config::load_or_default(cli.config.as_deref())?;
    config.apply_overrides(ConfigOverrides {
        registry: cli.registry.clone(),
        state_path: cli.state_path.clone(),
        ..overrides
    });
    Ok(config)
}

fn connection_overrides(connection: ConnectionArgs) -> ConfigOverrides {
    ConfigOverrides {
        endpoint: connection.endpoint,
        api_key: connection.api_key,
        target_url: connection.target,
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // We need to parse CLI args early to get the log level
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    // 3. Default to "info" if neither are provided
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    // Initialize TLS policy using thread-safe OnceLock
    subgraph_replicator::postgres::init_tls_policy(cli.allow_self_signed_certs);

    match &cli.command {
        Commands::Sync {
            connection,
            events,
            group,
            once,
            interval,
            page_size,
            concurrency,
        } => {
            let config = resolve_config(
                &cli,
                ConfigOverrides {
                    page_size: *page_size,
                    concurrency: *concurrency,
                    interval_secs: *interval,
                    ..connection_overrides(connection.clone())
                },
            )?;
            commands::sync(
                &config,
                commands::SyncOptions {
                    events: events.clone(),
                    group: group.clone(),
                    once: *once,
                },
            )
            .await
        }
        Commands::Status { json } => {
            let config = resolve_config(&cli, ConfigOverrides::default())?;
            commands::status(&config, *json).await
        }
        Commands::Events { group } => {
            let config = resolve_config(&cli, ConfigOverrides::default())?;
            commands::events(&config, group.as_deref())
        }
        Commands::Validate {
            connection,
            check_target,
        } => {
            let config = resolve_config(&cli, connection_overrides(connection.clone()))?;
            commands::validate(&config, *check_target)
                .await
                .context("Validation failed")
        }
        Commands::Plan {
            event,
            block,
            log_index,
        } => {
            let config = resolve_config(&cli, ConfigOverrides::default())?;
            commands::plan(&config, event, *block, *log_index)
        }
    }
}
