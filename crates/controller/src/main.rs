//! Shadow Controller
//!
//! Command-line front end for pairing with a device manager and driving
//! devices.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use controller::config::Config;
use controller::protocol::CloseReason;
use controller::runner::{self, Identity, RunPlan};
use controller::session::{self, SessionOptions};
use controller::storage::{FileStore, SettingsStore};
use controller::transport::{ConnectionSettings, WebSocketTransport};

/// Shadow Controller - pairs with a device manager and drives devices.
#[derive(Parser, Debug)]
#[command(name = "shadow-ctl")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Pair, load each URL on every device and screenshot it
    Run {
        /// URL to load (repeatable)
        #[arg(long = "url", required = true)]
        urls: Vec<String>,

        /// Pause after each URL and each screenshot, in milliseconds
        #[arg(long, default_value_t = runner::DEFAULT_STEP_DELAY.as_millis() as u64)]
        delay_ms: u64,

        /// Controller name shown on the device manager (defaults to config)
        #[arg(long)]
        name: Option<String>,

        /// Driver id (defaults to the stored id, generated on first use)
        #[arg(long)]
        id: Option<String>,

        /// 64-hex-character encryption token; omit to pair with a passcode
        #[arg(long)]
        token: Option<String>,

        /// Skip screenshots
        #[arg(long)]
        no_screenshot: bool,
    },

    /// Show or change the saved connection settings
    #[command(subcommand)]
    Settings(SettingsCommands),

    /// Print the protocol log
    Log {
        /// Only print the newest N entries
        #[arg(long, short)]
        limit: Option<usize>,
    },

    /// Forget saved settings, driver id and protocol log
    Reset,
}

/// Subcommands for connection settings.
#[derive(Subcommand, Debug, Clone)]
pub enum SettingsCommands {
    /// Print the saved connection settings
    Show,

    /// Update the saved connection settings
    Set {
        /// Scheme, ws or wss
        #[arg(long)]
        protocol: Option<String>,

        /// Device manager host
        #[arg(long)]
        host: Option<String>,

        /// Device manager port
        #[arg(long)]
        port: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    // Initialize tracing
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.controller.log_level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store = Arc::new(FileStore::open_in(&config.controller.data_dir)?);
    tracing::debug!("Using store at {:?}", store.path());

    match cli.command {
        Commands::Run {
            urls,
            delay_ms,
            name,
            id,
            token,
            no_screenshot,
        } => {
            let identity = Identity {
                name: name.unwrap_or_else(|| config.controller.client_name.clone()),
                id: runner::resolve_driver_id(store.as_ref(), id.as_deref())?,
                token,
            };
            let plan = RunPlan {
                urls,
                step_delay: Duration::from_millis(delay_ms),
                screenshots: !no_screenshot,
            };
            run(&config, store, identity, plan).await?;
        }
        Commands::Settings(SettingsCommands::Show) => {
            let settings = ConnectionSettings::load(store.as_ref())?;
            match settings {
                Some(settings) => print_settings(&settings, "saved"),
                None => {
                    let defaults = ConnectionSettings::from(config.connection.clone());
                    print_settings(&defaults, "default");
                }
            }
        }
        Commands::Settings(SettingsCommands::Set {
            protocol,
            host,
            port,
        }) => {
            let mut connection = config.connection.clone();
            if let Some(current) = ConnectionSettings::load(store.as_ref())? {
                connection.protocol = current.protocol;
                connection.host = current.host;
                connection.port = current.port;
            }
            if let Some(protocol) = protocol {
                connection.protocol = protocol;
            }
            if let Some(host) = host {
                connection.host = host;
            }
            if let Some(port) = port {
                connection.port = port;
            }

            let mut candidate = config.clone();
            candidate.connection = connection.clone();
            candidate.validate()?;

            let settings = ConnectionSettings::from(connection);
            settings.save(store.as_ref())?;
            print_settings(&settings, "saved");
        }
        Commands::Log { limit } => {
            let entries = store.log_entries()?;
            let skip = limit.map_or(0, |limit| entries.len().saturating_sub(limit));
            for entry in entries.iter().skip(skip) {
                println!("{}", entry);
            }
        }
        Commands::Reset => {
            let (handle, task) = session::spawn(
                WebSocketTransport::new(),
                store.clone(),
                SessionOptions::from_config(&config),
            );
            handle.reset().await?;
            handle.shutdown().await?;
            task.await.context("Session driver panicked")?;
            println!("Saved settings cleared.");
        }
    }

    Ok(())
}

async fn run(
    config: &Config,
    store: Arc<FileStore>,
    identity: Identity,
    plan: RunPlan,
) -> anyhow::Result<()> {
    let (handle, task) = session::spawn(
        WebSocketTransport::new(),
        store,
        SessionOptions::from_config(config),
    );

    let result = tokio::select! {
        result = runner::run(&handle, &identity, &plan) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, disconnecting");
            let reason = runner::disconnect(&handle, runner::DISCONNECT_TIMEOUT).await?;
            Ok(runner::RunReport {
                urls_sent: 0,
                screenshot_requests: Vec::new(),
                disconnect_reason: reason.unwrap_or(CloseReason::Unknown.code()),
            })
        }
    };

    handle.shutdown().await?;
    task.await.context("Session driver panicked")?;

    let report = result?;
    println!(
        "Sent {} URL(s), requested {} screenshot(s), closed with reason {}",
        report.urls_sent,
        report.screenshot_requests.len(),
        report.disconnect_reason
    );
    Ok(())
}

fn print_settings(settings: &ConnectionSettings, origin: &str) {
    println!("Connection settings ({}):", origin);
    println!("  protocol: {}", settings.protocol);
    println!("  host:     {}", settings.host);
    println!("  port:     {}", settings.port);
    println!("  url:      {}", settings.url());
}
