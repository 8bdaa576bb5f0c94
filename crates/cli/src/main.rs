//! Parley CLI: the main entry point.
//!
//! Commands:
//! - `chat`   : Interactive chat or single-message mode
//! - `budget` : Show how a context window is split
//! - `tools`  : List the built-in tool catalog
//! - `config` : Print the default (or current) configuration

use clap::{Parser, Subcommand};
use parley_config::AppConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Parley: conversational agent loop with tool calling",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "PARLEY_LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the agent
    Chat {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Show the token budget for a context window
    Budget {
        /// Context window in tokens
        #[arg(short, long)]
        window: usize,

        /// Fixed overhead (system prompt plus tool schemas) in tokens
        #[arg(short, long, default_value_t = 0)]
        overhead: usize,
    },

    /// List the tools the model can call
    Tools {
        /// Print the definitions sent to the engine as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print configuration
    Config {
        /// Show the effective configuration instead of the defaults
        #[arg(long)]
        current: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logging settings live in the config file, so load it before anything logs.
    let config = AppConfig::load();
    let json = cli.log_json
        || config
            .as_ref()
            .map(|c| c.logging.json)
            .unwrap_or_default();
    init_tracing(cli.verbose, json);
    let config = config.map_err(|e| format!("Failed to load config: {e}"))?;

    match cli.command {
        Commands::Chat { message } => commands::chat::run(&config, message).await?,
        Commands::Budget { window, overhead } => commands::budget::run(&config, window, overhead)?,
        Commands::Tools { json } => commands::tools::run(&config, json)?,
        Commands::Config { current } => commands::config_cmd::run(&config, current)?,
    }

    Ok(())
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    // Logs go to stderr so streamed answers on stdout stay clean.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
