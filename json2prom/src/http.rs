//! HTTP server for the metrics endpoint.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info};

use crate::collector::SharedCollector;
use crate::exposition;

/// Header through which Prometheus announces its scrape timeout.
pub const SCRAPE_TIMEOUT_HEADER: &str = "x-prometheus-scrape-timeout-seconds";

/// Time reserved for encoding and writing the response.
const DEADLINE_MARGIN: Duration = Duration::from_millis(250);

const INDEX_HTML: &str = "<html><head><title>json2prom</title></head>\
<body><h1>json2prom</h1><p><a href=\"/metrics\">Metrics</a></p></body></html>";

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    collector: SharedCollector,
}

/// Create the HTTP router.
fn create_router(collector: SharedCollector) -> Router {
    let state = AppState { collector };

    Router::new()
        .route("/", get(index_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handler for the / endpoint.
async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Handler for the /metrics endpoint.
async fn metrics_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let deadline = scrape_deadline(&headers);
    let samples = state.collector.scrape(deadline).await;
    debug!(samples = samples.len(), "Scrape collected");

    match exposition::render(samples, state.collector.metrics()) {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, exposition::CONTENT_TYPE)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to encode metrics\n",
            )
                .into_response()
        }
    }
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Deadline derived from the scrape timeout header, if present and sane.
fn scrape_deadline(headers: &HeaderMap) -> Option<Instant> {
    let seconds: f64 = headers
        .get(SCRAPE_TIMEOUT_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()?;

    let timeout = Duration::try_from_secs_f64(seconds).ok()?;
    if timeout.is_zero() {
        return None;
    }

    Some(Instant::now() + timeout.saturating_sub(DEADLINE_MARGIN))
}

/// HTTP server bound to its listen address.
pub struct HttpServer {
    collector: SharedCollector,
    listener: TcpListener,
}

impl HttpServer {
    /// Bind the listen address.
    pub async fn bind(collector: SharedCollector, listen_addr: &str) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", listen_addr, e))?;

        Ok(Self {
            collector,
            listener,
        })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the HTTP server until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let router = create_router(self.collector);

        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "HTTP server listening");
        }

        // Run server with graceful shutdown
        axum::serve(self.listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}
