//! Prometheus exporter for JSON HTTP endpoints.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use json2prom::config::{LogFormat, LoggingConfig, SOURCES_FILE_VAR};
use json2prom::{ExporterConfig, HttpServer, JsonCollector, init_tracing};

/// Prometheus exporter for JSON HTTP endpoints.
#[derive(Parser, Debug)]
#[command(name = "json2prom")]
#[command(about = "Expose numeric fields of JSON endpoints as Prometheus gauges")]
#[command(version)]
struct Args {
    /// Path to a JSON5 file holding the source list (overrides SOURCES and SOURCES_FILE).
    #[arg(short, long)]
    sources_file: Option<PathBuf>,

    /// HTTP listen address (overrides HTTP_ADDR).
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format.
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Run one collection, print the discovered metrics and exit.
    #[arg(long)]
    describe: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let mut logging = LoggingConfig::from_lookup(|name| std::env::var(name).ok());
    if let Some(level) = &args.log_level {
        logging.level = level.clone();
    }
    if let Some(format) = args.log_format {
        logging.format = format;
    }
    init_tracing(&logging).context("Failed to initialize logging")?;

    // Load configuration
    let sources_file = args
        .sources_file
        .as_ref()
        .map(|path| path.to_string_lossy().into_owned());
    let mut config = match ExporterConfig::from_lookup(|name| {
        if name == SOURCES_FILE_VAR && sources_file.is_some() {
            return sources_file.clone();
        }
        std::env::var(name).ok()
    }) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };

    // Override listen address from CLI
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    let listen_addr = config.listen_addr()?;

    let collector = Arc::new(
        JsonCollector::new(config.sources.clone()).context("Failed to build HTTP client")?,
    );

    if args.describe {
        return describe(&collector).await;
    }

    info!(
        sources = collector.sources().len(),
        "Starting json2prom exporter"
    );

    let http_server = match HttpServer::bind(collector.clone(), &listen_addr).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to start HTTP server");
            return Err(e);
        }
    };

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut http_task = tokio::spawn(http_server.run(shutdown_rx));

    // Wait for shutdown signal, or for the server to stop on its own
    tokio::select! {
        result = &mut http_task => {
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!(error = %e, "HTTP server error");
                    Err(e)
                }
                Err(e) => Err(anyhow::anyhow!("HTTP server task failed: {}", e)),
            };
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    // Signal shutdown
    shutdown_tx.send(true)?;

    match tokio::time::timeout(Duration::from_secs(5), http_task).await {
        Ok(Ok(Err(e))) => error!(error = %e, "HTTP server error"),
        Ok(Err(e)) => error!(error = %e, "HTTP server task failed"),
        Err(_) => error!("HTTP server did not stop in time"),
        Ok(Ok(Ok(()))) => {}
    }

    let metrics = collector.metrics();
    info!(
        scrapes = metrics.scrapes(),
        samples = metrics.samples(),
        "Exporter stopped"
    );
    Ok(())
}

/// Resolve when SIGTERM arrives; never on platforms without it.
async fn terminate() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}

/// Print every metric a trial collection discovers.
async fn describe(collector: &JsonCollector) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    collector.describe(tx).await;

    let mut descriptors = BTreeSet::new();
    while let Some(desc) = rx.recv().await {
        descriptors.insert(desc);
    }

    for desc in &descriptors {
        println!("{desc}");
    }
    info!(metrics = descriptors.len(), "Describe finished");
    Ok(())
}
