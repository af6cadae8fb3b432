use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tabvox::storage::SnapshotStore;
use tabvox::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tabvox")]
#[command(
    author,
    version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("TABVOX_GIT_HASH"), ")"),
    about = "tabvox - multi-tab voice assistant orchestrator",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway and push channel
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
    },

    /// Send one prompt through the agent invoker and print the reply
    Ask {
        /// Prompt text
        prompt: String,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        init: bool,
    },
}

fn load_config(path: Option<&Path>) -> Result<(Config, PathBuf)> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => Config::config_path()?,
    };
    let config = Config::load_from(&path)?;
    Ok((config, path))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "tabvox=debug,tower_http=debug"
    } else {
        "tabvox=info,tower_http=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let (mut config, config_path) = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port, host } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            tracing::info!(
                config = %config_path.display(),
                agent = %config.agent.command,
                max_sessions = config.sessions.max_sessions,
                "Starting tabvox gateway"
            );

            let orchestrator = tabvox::orchestrator_from_config(&config);
            if config.storage.restore_on_start {
                let store = SnapshotStore::new(config.storage.path.clone());
                match store.load() {
                    Ok(Some(snapshot)) => {
                        orchestrator.restore(&snapshot).await;
                    }
                    Ok(None) => tracing::info!("No saved sessions to restore"),
                    Err(e) => tracing::warn!("Failed to restore sessions: {:#}", e),
                }
            }
            tabvox::transport::run_http_server(config, orchestrator).await?;
        }
        Commands::Ask { prompt } => {
            let invoker = tabvox::invoker_from_config(&config);
            let invocation = invoker.invoke(&prompt).await;
            println!("{}", invocation.user_text());
            if invocation.reply().is_none() {
                std::process::exit(1);
            }
        }
        Commands::Config { init } => {
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            if init {
                config.save_to(&config_path)?;
                eprintln!("Wrote {}", config_path.display());
            }
            print!("{rendered}");
        }
    }

    Ok(())
}
