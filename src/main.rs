// ABOUTME: Main entry point for the USSD gateway
// ABOUTME: Initializes logging, config, SQLite store, session bridge, sweeper, and HTTP server

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ussdgate::{
    bridge::{BridgeSettings, SessionBridge},
    config::Config,
    handler::UssdHandler,
    metrics, paths,
    push::PushClient,
    server::{self, AppState},
    store::SqliteStore,
};

#[derive(Parser)]
#[command(name = "ussdgate", version, about = "USSD gateway bridging providers and a flow engine")]
struct Cli {
    /// Config file (defaults to USSDGATE_CONFIG_PATH, ./config.toml, ~/.config/ussdgate/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    /// Also write daily-rotated log files to the standard log directory
    #[arg(long, global = true)]
    log_file: bool,

    /// Directory for log files (implies --log-file)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway (default)
    Serve,
    /// Load and validate configuration, then exit
    CheckConfig,
}

fn init_logging(cli: &Cli) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_dir = cli
        .log_dir
        .clone()
        .or_else(|| cli.log_file.then(paths::log_dir));
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "ussdgate.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if cli.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
    guard
}

fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli);

    let config = load_config(&cli)?;
    match cli.command.unwrap_or(Command::Serve) {
        Command::CheckConfig => {
            tracing::info!(
                channels = config.channels.len(),
                database = %config.database.path,
                "Configuration is valid"
            );
            Ok(())
        }
        Command::Serve => serve(config).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        database = %config.database.path,
        session_idle_ttl_secs = config.ussd.session_idle_ttl_secs,
        default_wait_timeout_secs = config.ussd.default_wait_timeout_secs,
        "Configuration loaded"
    );

    let store = SqliteStore::open(&config.database.path)?;
    for channel in &config.channels {
        store
            .upsert_channel(channel)
            .with_context(|| format!("Failed to seed channel {}", channel.uuid))?;
    }
    tracing::info!(
        channels = config.channels.len(),
        data_dir = %paths::data_dir().display(),
        "Channel store ready"
    );

    let metrics_handle = metrics::init_metrics()?;
    let bridge = Arc::new(SessionBridge::new(
        Arc::new(store),
        BridgeSettings::from(&config.ussd),
    ));

    let shutdown = CancellationToken::new();
    let sweeper = config
        .ussd
        .sweep_interval()
        .map(|interval| bridge.spawn_sweeper(interval, shutdown.clone()));

    let state = AppState {
        handler: Arc::new(UssdHandler::new(Arc::clone(&bridge), PushClient::new()?)),
        api_key: config.server.api_key.clone(),
        metrics: Some(metrics_handle),
    };

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutdown signal received");
        signal.cancel();
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let result = server::start_server(&addr, state, shutdown.clone()).await;

    shutdown.cancel();
    if let Some(sweeper) = sweeper {
        let _ = sweeper.await;
    }
    result
}
