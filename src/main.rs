//! Coin Rewards Engine server
//!
//! Loads the configuration, wires the engine, starts the reconciler and serves
//! the JSON RPC surface until Ctrl-C or SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! cargo run
//! cargo run -- --config /etc/coin-rewards/config.yaml
//! CONFIG_PATH=staging.yaml cargo run -- --port 9090
//! ```
//!
//! # Exit Codes
//!
//! - 0: Graceful shutdown
//! - 1: Startup failure (missing or invalid config, port in use, etc.)

use coin_rewards_engine::config::{Config, LoggingConfig};
use coin_rewards_engine::core::reconciler;
use coin_rewards_engine::{cli, rpc, EngineBuilder};
use std::process::ExitCode;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Inconsistencies buffered for the operator log before the reconciler drops them.
const ALERT_CAPACITY: usize = 64;

async fn run(config: Config) -> Result<(), String> {
    let (alerts, operator_log) = mpsc::channel(ALERT_CAPACITY);
    let engine = EngineBuilder::new(config.clone())
        .with_alerts(alerts)
        .build()
        .map_err(|e| e.to_string())?;
    reconciler::spawn_alert_sink(operator_log);
    engine.start().await.map_err(|e| e.to_string())?;

    let shutdown = CancellationToken::new();
    let reconciler = engine.reconciler.clone().spawn(shutdown.child_token());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("cannot bind {}: {}", addr, e))?;

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested");
        signal_token.cancel();
    });

    let router = rpc::router(engine.service.clone(), shutdown.child_token());
    let served = rpc::serve(listener, router, shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = reconciler.await {
        error!(error = %e, "reconciler task failed");
    }
    engine.shutdown();
    served.map_err(|e| format!("server error: {}", e))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::parse_args();

    let config = match Config::load(&args.config) {
        Ok(config) => args.apply(config),
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.logging);
    info!(config = %args.config.display(), port = config.server.port, "starting coin-rewards engine");

    match run(config).await {
        Ok(()) => {
            info!("stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "engine failed");
            ExitCode::FAILURE
        }
    }
}
