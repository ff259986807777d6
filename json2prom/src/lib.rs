//! Prometheus exporter for JSON HTTP endpoints.
//!
//! Every scrape of `/metrics` fetches each configured source concurrently,
//! walks the returned JSON document and turns its numeric leaves into gauge
//! samples. Per-source key actions can skip subtrees, map strings to numbers
//! or turn object keys into label values.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │  JSON sources   │────>│    Collector    │────>│   HTTP Server   │
//! │  (HTTP GET)     │     │   (projector)   │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! SOURCES='[{"URL": "http://localhost:9000/stats", "Namespace": "app"}]' json2prom
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] and [`config::Source`] for configuration options.

pub mod collector;
pub mod config;
pub mod exposition;
pub mod http;
pub mod mapping;
pub mod projector;
pub mod sample;

pub use collector::{JsonCollector, ScrapeError, SharedCollector};
pub use config::{Action, ConfigError, ExporterConfig, LogFormat, LoggingConfig, Source};
pub use http::HttpServer;
pub use projector::{Projector, project};
pub use sample::{Descriptor, Sample, SampleSink};

/// Initialize tracing with the given configuration.
///
/// `RUST_LOG`, when set, takes precedence over the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), ConfigError> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let result = match config.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .try_init(),
    };

    result.map_err(|e| ConfigError::Logging(e.to_string()))
}
