//! Prometheus recorder with an optional scrape endpoint.
//!
//! The recorder is a process-wide singleton. A full run over every entity can
//! take hours, so operators may expose `/metrics` while it is in progress.

use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{AlreadyInitializedSnafu, BindSnafu, MetricsError, PrometheusInitSnafu};

/// Histogram buckets for duration metrics (in seconds). Warehouse queries
/// range from sub-second metadata lookups to multi-minute scans.
const DURATION_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn install() -> Result<PrometheusHandle, MetricsError> {
    PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS)
        .context(PrometheusInitSnafu)?
        .install_recorder()
        .context(PrometheusInitSnafu)
}

/// Install the recorder and, if `addr` is given, serve `/metrics` on it.
///
/// # Errors
///
/// Returns an error if a recorder is already installed or the listener
/// cannot be bound.
pub async fn init_global(addr: Option<SocketAddr>) -> Result<(), MetricsError> {
    ensure!(HANDLE.get().is_none(), AlreadyInitializedSnafu);
    let handle = install()?;
    HANDLE
        .set(handle.clone())
        .map_err(|_| AlreadyInitializedSnafu.build())?;

    if let Some(addr) = addr {
        let listener = TcpListener::bind(addr).await.context(BindSnafu { addr })?;
        tokio::spawn(serve(listener, handle));
        info!(%addr, "Metrics endpoint started");
    }

    Ok(())
}

/// Install the recorder for tests without starting an endpoint.
///
/// Safe to call from many test threads at once.
pub fn init_test() {
    if HANDLE.get().is_some() {
        return;
    }
    match install() {
        Ok(handle) => {
            let _ = HANDLE.set(handle);
        }
        Err(_) => {
            // Another thread won the race; wait until it publishes the handle.
            while HANDLE.get().is_none() {
                std::hint::spin_loop();
            }
        }
    }
}

/// Render current metrics in Prometheus text format, if a recorder is installed.
pub fn render() -> Option<String> {
    HANDLE.get().map(PrometheusHandle::render)
}

async fn serve(listener: TcpListener, handle: PrometheusHandle) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .layer(Extension(handle));

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "Metrics server error");
    }
}

async fn metrics_handler(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::counter;
    use std::thread;

    #[test]
    fn test_init_test_is_idempotent() {
        init_test();
        init_test();
        assert!(render().is_some());
    }

    #[test]
    fn test_render_contains_recorded_counter() {
        init_test();
        counter!("avalanche_test_counter").increment(7);
        let output = render().unwrap();
        assert!(output.contains("avalanche_test_counter"));
    }

    #[test]
    fn test_concurrent_init_test() {
        let handles: Vec<_> = (0..8).map(|_| thread::spawn(init_test)).collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(render().is_some());
    }
}
