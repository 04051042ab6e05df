//! leafscan
//!
//! `leafscan serve` runs the JSON prediction API; `leafscan predict` diagnoses
//! image files from the command line.

use anyhow::Result;
use clap::Parser;
use leafscan_classifiers::Predictor;
use leafscan_server::{create_router, AppState, ServerConfig};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

mod cli;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            listen,
            port,
            json_logs,
            verbose,
        } => {
            let config = ServerConfig::load(Some(&config))?.with_overrides(listen, port);
            init_tracing(verbose, json_logs || config.logging.json);
            serve(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Predict {
            config,
            images,
            verbose,
        } => {
            let config = ServerConfig::load(Some(&config))?;
            init_tracing(verbose, config.logging.json);
            Ok(predict_files(&config, &images).await)
        }
    }
}

async fn serve(config: ServerConfig) -> Result<()> {
    info!("Starting leafscan server");

    let metrics_handle = init_metrics()?;

    let predictor = Arc::new(load_predictor(&config).await?);
    if !predictor.is_ready() {
        warn!("Serving without a model; /v1/predict will return 503");
    }

    let state = AppState::new(predictor, metrics_handle, config.server.max_body_bytes);
    let app = create_router(state);

    let addr = config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);

    let shutdown = async {
        shutdown_signal().await;
        warn!("Shutdown signal received, stopping server...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn predict_files(config: &ServerConfig, images: &[PathBuf]) -> ExitCode {
    let predictor = match load_predictor(config).await {
        Ok(predictor) => predictor,
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut failed = false;
    for image in images {
        let line = match predictor.predict(image).await {
            Ok(diagnosis) => json!({"image": image, "diagnosis": diagnosis}),
            Err(e) => {
                failed = true;
                json!({"image": image, "error": e.kind(), "message": e.to_string()})
            }
        };
        println!("{}", line);
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Build the predictor off the async runtime; model loading may download
/// and parse large files
async fn load_predictor(config: &ServerConfig) -> Result<Predictor> {
    let predictor_config = config.predictor.clone();
    let predictor = tokio::task::spawn_blocking(move || Predictor::load(&predictor_config)).await?;
    Ok(predictor)
}

/// Listen for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
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

/// Initialize tracing; logs go to stderr so `predict` output stays clean
fn init_tracing(verbose: bool, json: bool) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("leafscan=debug,tower_http=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("leafscan=info"))
    };

    let (text, json) = if json {
        (None, Some(fmt::layer().json().with_writer(std::io::stderr)))
    } else {
        (Some(fmt::layer().with_writer(std::io::stderr)), None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .init();
}

/// Initialize metrics exporter and return handle for rendering
fn init_metrics() -> Result<PrometheusHandle> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install metrics: {}", e))?;

    metrics::describe_counter!(
        "leafscan_predictions_total",
        "Predictions served, by outcome"
    );
    metrics::describe_histogram!(
        "leafscan_inference_latency_us",
        metrics::Unit::Microseconds,
        "Forward pass latency in microseconds"
    );
    metrics::describe_counter!(
        "leafscan_model_load_attempts_total",
        "Model loader strategy attempts, by strategy and result"
    );

    info!("Metrics exporter initialized");
    Ok(handle)
}
