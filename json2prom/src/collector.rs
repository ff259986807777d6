//! Scrape coordinator: fetches every source and projects its document.
//!
//! Each scrape spawns one task per source. Tasks share the process-wide
//! HTTP client and push samples into a shared unbounded channel; a failing
//! source is logged and contributes nothing, without affecting the others.
//! The scrape completes once every task has been joined.

use std::sync::Arc;
use std::time::Duration;

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::Source;
use crate::projector::project;
use crate::sample::{Descriptor, Sample, SampleSink};

/// Per-request timeout of the upstream HTTP client.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a source contributed nothing to a scrape.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("Fetch failed: {0}")]
    Fetch(#[source] reqwest::Error),
    #[error("Failed to decode JSON body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Upstream reported an error: {0}")]
    Sentinel(String),
    #[error("Scrape deadline exceeded")]
    Deadline,
}

impl ScrapeError {
    /// Short reason used as a label value.
    pub fn reason(&self) -> &'static str {
        match self {
            ScrapeError::Fetch(_) => "fetch",
            ScrapeError::Decode(_) => "decode",
            ScrapeError::Sentinel(_) => "sentinel",
            ScrapeError::Deadline => "deadline",
        }
    }
}

/// Counters describing the exporter itself.
#[derive(Debug, Clone, Default)]
pub struct ExporterMetrics {
    scrapes: Counter,
    samples: Counter,
    source_failures: Family<Vec<(String, String)>, Counter>,
}

impl ExporterMetrics {
    /// Register all counters with `registry`.
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "json2prom_scrapes",
            "Collections performed",
            self.scrapes.clone(),
        );
        registry.register(
            "json2prom_samples",
            "Gauge samples emitted across all collections",
            self.samples.clone(),
        );
        registry.register(
            "json2prom_source_failures",
            "Sources dropped from a collection, by reason",
            self.source_failures.clone(),
        );
    }

    /// Total collections performed.
    pub fn scrapes(&self) -> u64 {
        self.scrapes.get()
    }

    /// Total samples emitted.
    pub fn samples(&self) -> u64 {
        self.samples.get()
    }

    /// Failures recorded for one source and reason.
    pub fn source_failures(&self, url: &str, reason: &str) -> u64 {
        self.source_failures
            .get_or_create(&failure_labels(url, reason))
            .get()
    }

    fn record_failure(&self, url: &str, reason: &str) {
        self.source_failures
            .get_or_create(&failure_labels(url, reason))
            .inc();
    }
}

fn failure_labels(url: &str, reason: &str) -> Vec<(String, String)> {
    vec![
        ("source".to_string(), url.to_string()),
        ("reason".to_string(), reason.to_string()),
    ]
}

/// Collects gauge samples from every configured source on demand.
#[derive(Debug, Clone)]
pub struct JsonCollector {
    client: reqwest::Client,
    sources: Arc<[Arc<Source>]>,
    metrics: ExporterMetrics,
}

/// Create a shareable collector handle.
pub type SharedCollector = Arc<JsonCollector>;

impl JsonCollector {
    /// Create a collector with its own HTTP client.
    pub fn new(sources: Vec<Arc<Source>>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("json2prom/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self::with_client(client, sources))
    }

    /// Create a collector around an existing HTTP client.
    pub fn with_client(client: reqwest::Client, sources: Vec<Arc<Source>>) -> Self {
        Self {
            client,
            sources: sources.into(),
            metrics: ExporterMetrics::default(),
        }
    }

    /// Configured sources.
    pub fn sources(&self) -> &[Arc<Source>] {
        &self.sources
    }

    /// Exporter self-metrics.
    pub fn metrics(&self) -> &ExporterMetrics {
        &self.metrics
    }

    /// Fetch and project every source, pushing samples into `sink`.
    ///
    /// Returns once every source has either emitted its samples or failed.
    /// With a `deadline`, fetches still running at that instant count as
    /// failed.
    pub async fn collect(&self, sink: mpsc::UnboundedSender<Sample>, deadline: Option<Instant>) {
        self.metrics.scrapes.inc();

        let mut tasks = JoinSet::new();
        for source in self.sources.iter() {
            let client = self.client.clone();
            let source = Arc::clone(source);
            let metrics = self.metrics.clone();
            let mut sink = sink.clone();

            tasks.spawn(async move {
                match scrape_source(&client, &source, deadline, &mut sink).await {
                    Ok(emitted) => {
                        metrics.samples.inc_by(emitted as u64);
                        debug!(source = %source.url, emitted, "Source collected");
                    }
                    Err(e) => {
                        metrics.record_failure(&source.url, e.reason());
                        warn!(source = %source.url, error = %e, "Source dropped from scrape");
                    }
                }
            });
        }
        drop(sink);

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Source task failed");
            }
        }
    }

    /// Run one collection and gather its samples.
    pub async fn scrape(&self, deadline: Option<Instant>) -> Vec<Sample> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.collect(tx, deadline).await;

        let mut samples = Vec::new();
        while let Some(sample) = rx.recv().await {
            samples.push(sample);
        }
        samples
    }

    /// Discover metric descriptors through a trial collection.
    ///
    /// Each emitted sample's [`Descriptor`] is forwarded to `descs` by a
    /// background task, which is joined before returning.
    pub async fn describe(&self, descs: mpsc::UnboundedSender<Descriptor>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Sample>();

        let forwarder = tokio::spawn(async move {
            while let Some(sample) = rx.recv().await {
                if descs.send(sample.descriptor()).is_err() {
                    break;
                }
            }
        });

        self.collect(tx, None).await;

        if let Err(e) = forwarder.await {
            error!(error = %e, "Descriptor forwarder failed");
        }
    }
}

async fn scrape_source<S: SampleSink + ?Sized>(
    client: &reqwest::Client,
    source: &Source,
    deadline: Option<Instant>,
    sink: &mut S,
) -> Result<usize, ScrapeError> {
    let fetch = fetch_document(client, &source.url);
    let document = match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fetch)
            .await
            .map_err(|_| ScrapeError::Deadline)??,
        None => fetch.await?,
    };

    if let Some(sentinel) = error_sentinel(source, &document) {
        return Err(ScrapeError::Sentinel(sentinel.to_string()));
    }

    Ok(project(source, &document, sink))
}

async fn fetch_document(client: &reqwest::Client, url: &str) -> Result<Value, ScrapeError> {
    let response = client.get(url).send().await.map_err(ScrapeError::Fetch)?;

    let status = response.status();
    if !status.is_success() {
        debug!(source = %url, %status, "Upstream returned non-success status, decoding anyway");
    }

    let body = response.bytes().await.map_err(ScrapeError::Fetch)?;
    Ok(serde_json::from_slice(&body)?)
}

/// The error sentinel of `document`, if the source defines one and the
/// document root is an object carrying it.
pub fn error_sentinel<'v>(source: &Source, document: &'v Value) -> Option<&'v Value> {
    let key = source.error_key()?;
    document.as_object()?.get(key)
}
