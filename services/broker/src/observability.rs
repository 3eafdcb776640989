//! Tracing and metrics setup for the broker service.
//!
//! Installs a `tracing` subscriber filtered by `RUST_LOG` and a Prometheus
//! recorder, and serves `/metrics`, `/live` and `/ready` over HTTP with `axum`.
//! In tests the recorder is cached so repeated initialization does not fail.

use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
#[cfg(test)]
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[cfg(test)]
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initializes logging and metrics for the service.
///
/// Returns a `PrometheusHandle` for serving metrics.
pub fn init_observability(service_name: &str) -> anyhow::Result<PrometheusHandle> {
    // Use environment variable for log filtering; default to "info" if unset or invalid.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();
    init_subscriber(tracing_subscriber::registry().with(filter).with(fmt_layer));
    tracing::debug!(service = service_name, "tracing initialized");

    install_metrics_recorder()
}

/// Serves Prometheus metrics and health endpoints on the given socket address.
///
/// - `/metrics`: Prometheus text exposition.
/// - `/live`: liveness probe returning "ok".
/// - `/ready`: readiness probe returning "ok".
pub async fn serve_metrics(handle: PrometheusHandle, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(handle).into_make_service()).await
}

fn router(handle: PrometheusHandle) -> axum::Router {
    axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/live", axum::routing::get(|| async { "ok" }))
        .route("/ready", axum::routing::get(|| async { "ok" }))
}

fn install_metrics_recorder() -> anyhow::Result<PrometheusHandle> {
    #[cfg(test)]
    {
        if let Some(handle) = METRICS_HANDLE.get() {
            return Ok(handle.clone());
        }
        let handle = PrometheusBuilder::new().install_recorder()?;
        let _ = METRICS_HANDLE.set(handle.clone());
        Ok(handle)
    }
    #[cfg(not(test))]
    {
        Ok(PrometheusBuilder::new().install_recorder()?)
    }
}

// `try_init` in tests so several tests can share one process.
fn init_subscriber<S>(subscriber: S)
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    #[cfg(test)]
    {
        let _ = subscriber.try_init();
    }
    #[cfg(not(test))]
    {
        subscriber.init();
    }
}
