mod check_commands;
mod outcome_commands;
mod relay;
mod server;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "threadrelay", about = "threadrelay: thread-preserving chat relay")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (overrides discovery of ./threadrelay.toml etc.).
    #[arg(long, global = true, env = "THREADRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Address the health endpoint binds to (overrides config value).
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Port the health endpoint listens on (overrides config and `PORT`).
    #[arg(long, global = true)]
    port: Option<u16>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start relaying (default when no subcommand is provided).
    Run,
    /// Validate the configuration and report errors/warnings.
    Check {
        /// Show informational diagnostics in addition to errors and warnings.
        #[arg(long)]
        verbose: bool,
    },
    /// Show recent delivery outcomes from the database.
    Outcomes {
        /// Maximum number of outcomes to show.
        #[arg(long, default_value_t = 20)]
        limit: u32,
        /// Only outcomes for this origin chat.
        #[arg(long, allow_hyphen_values = true)]
        origin: Option<i64>,
        /// Print JSON lines instead of a table.
        #[arg(long)]
        json: bool,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_telemetry(&cli);

    match cli.command {
        None | Some(Commands::Run) => {
            info!(version = env!("CARGO_PKG_VERSION"), "threadrelay starting");
            relay::run(relay::RunOptions {
                config: cli.config,
                bind: cli.bind,
                port: cli.port,
            })
            .await
        },
        Some(Commands::Check { verbose }) => check_commands::check(cli.config.as_deref(), verbose),
        Some(Commands::Outcomes {
            limit,
            origin,
            json,
        }) => outcome_commands::show(cli.config.as_deref(), limit, origin, json).await,
    }
}
