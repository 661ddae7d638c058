use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cockpit::api::{self, AppState};
use cockpit::client::{TelemetryClient, DEFAULT_TELEMETRY_ENDPOINT};
use cockpit::engine::{Hub, TelemetryPoller};
use cockpit::storage::{seed, StateStore};
use cockpit::Config;

const DEFAULT_LOG_FILTER: &str = "cockpit=info,tower_http=warn";

#[derive(Parser)]
#[command(name = "cockpit")]
#[command(about = "Live state hub for prompt-optimization agents", long_about = None)]
#[command(version)]
struct Cli {
    /// Emit newline-delimited JSON logs
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub
    Serve {
        #[arg(long, help = "Path to a TOML config file")]
        config: Option<PathBuf>,
        #[arg(long, help = "Port to listen on (overrides config)")]
        port: Option<u16>,
        #[arg(long, help = "Install the built-in demo agents")]
        seed_demo: bool,
    },
    /// Post randomized telemetry for one agent
    TelemetryDemo {
        #[arg(long)]
        agent: String,
        #[arg(long, default_value = DEFAULT_TELEMETRY_ENDPOINT)]
        endpoint: String,
        #[arg(long, default_value_t = 3)]
        interval_secs: u64,
        #[arg(long, help = "Stop after this many reports")]
        count: Option<u64>,
    },
}

fn init_tracing(json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .try_init()
            .ok();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Serve {
            config,
            port,
            seed_demo,
        } => serve(config, port, seed_demo).await?,
        Commands::TelemetryDemo {
            agent,
            endpoint,
            interval_secs,
            count,
        } => {
            info!(agent_id = %agent, %endpoint, interval_secs, "Telemetry demo started");
            let client = TelemetryClient::new(endpoint, agent);
            let sent = client
                .run(Duration::from_secs(interval_secs), count)
                .await?;
            info!(sent, "Telemetry demo finished");
        }
    }

    Ok(())
}

async fn serve(config_path: Option<PathBuf>, port: Option<u16>, seed_demo: bool) -> Result<()> {
    let mut config = Config::load(config_path.as_deref())?;
    if let Some(port) = port {
        config.port = port;
    }
    config.seed_demo |= seed_demo;

    let evaluator = config.build_evaluator()?;
    let hub = Arc::new(Hub::new(
        Arc::new(StateStore::new()),
        evaluator,
        config.optimizer_defaults(),
    ));

    if config.seed_demo {
        hub.seed(seed::demo_agents()).await;
    }
    if let Some(path) = &config.seed_path {
        let agents = seed::load_agents(path)?;
        hub.seed(agents).await;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = config.poll_interval().map(|interval| {
        let poller = TelemetryPoller::new(hub.clone(), interval);
        tokio::spawn(poller.run(shutdown_rx.clone()))
    });

    info!(
        evaluator = ?config.evaluator,
        optimizer = %config.default_optimizer,
        threshold = config.default_score_threshold,
        "Starting cockpit hub"
    );

    let state = AppState { hub: hub.clone() };
    api::serve(state, &config.bind_address(), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested");
    })
    .await?;

    shutdown_tx.send_replace(true);
    for key in hub.tasks().list_active().await {
        if let Err(e) = hub.stop_optimization(&key.agent_id, &key.planet_id).await {
            warn!(resource = %key, error = %e, "Failed to stop optimization");
        }
    }
    if let Some(poller) = poller {
        poller.await.ok();
    }

    Ok(())
}
