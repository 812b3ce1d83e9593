mod tracker;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use once_cell::sync::Lazy;
use prometheus::{
    opts, register_gauge_vec, register_histogram_vec, register_int_counter,
    register_int_counter_vec, Encoder, GaugeVec, HistogramVec, IntCounter, IntCounterVec,
};
use tokio::net::TcpListener;
use tracing::{error, info};

pub use tracker::Tracker;

static FRONT_CONNECTIONS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        opts!("sedum_front_connection", "current frontend connections"),
        &["proxy"]
    )
    .expect("front connection gauge registration must succeed")
});

static FRONT_CONNECTION_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "sedum_front_connection_total",
            "frontend connections accepted since start"
        ),
        &["proxy"]
    )
    .expect("front connection counter registration must succeed")
});

static FRONT_COMMAND_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "sedum_front_command_total",
            "frontend commands grouped by result"
        ),
        &["proxy", "result"]
    )
    .expect("front command counter registration must succeed")
});

static GLOBAL_ERROR: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!("sedum_global_error", "global error counter"))
        .expect("global error counter registration must succeed")
});

static BACKEND_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "sedum_backend_error_total",
            "backend errors grouped by node and kind"
        ),
        &["proxy", "backend", "kind"]
    )
    .expect("backend error counter registration must succeed")
});

static TOTAL_TIMER: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "sedum_total_timer",
        "request latency through the proxy in microseconds",
        &["proxy"],
        vec![1_000.0, 10_000.0, 40_000.0, 100_000.0, 200_000.0]
    )
    .expect("total timer histogram registration must succeed")
});

static VERSION_GAUGE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        opts!("sedum_version", "running sedum version"),
        &["version"]
    )
    .expect("version gauge registration must succeed")
});

/// Monotonic structure version; observers diff snapshots instead of
/// locking. Bumped on slot-map changes, route publishes, and health flips.
static STATS_VERSION: AtomicU64 = AtomicU64::new(0);

pub fn stats_version() -> u64 {
    STATS_VERSION.load(Ordering::Relaxed)
}

pub fn stats_version_bump() -> u64 {
    STATS_VERSION.fetch_add(1, Ordering::Relaxed) + 1
}

pub fn register_version(version: &str) {
    VERSION_GAUGE.with_label_values(&[version]).set(1.0);
}

pub fn front_conn_open(proxy: &str) {
    FRONT_CONNECTION_TOTAL.with_label_values(&[proxy]).inc();
    FRONT_CONNECTIONS.with_label_values(&[proxy]).inc();
}

pub fn front_conn_close(proxy: &str) {
    FRONT_CONNECTIONS.with_label_values(&[proxy]).dec();
}

pub fn front_command(proxy: &str, success: bool) {
    let result = if success { "ok" } else { "fail" };
    FRONT_COMMAND_TOTAL
        .with_label_values(&[proxy, result])
        .inc();
}

pub fn global_error_incr() {
    GLOBAL_ERROR.inc();
}

pub fn backend_error(proxy: &str, backend: &str, kind: &str) {
    BACKEND_ERRORS
        .with_label_values(&[proxy, backend, kind])
        .inc();
}

pub fn total_tracker(proxy: &str) -> Tracker {
    Tracker::new(TOTAL_TIMER.with_label_values(&[proxy]))
}

pub fn front_connections_current(proxy: &str) -> u64 {
    FRONT_CONNECTIONS
        .with_label_values(&[proxy])
        .get()
        .max(0.0)
        .round() as u64
}

pub fn front_connections_total(proxy: &str) -> u64 {
    FRONT_CONNECTION_TOTAL.with_label_values(&[proxy]).get()
}

pub fn front_commands(proxy: &str, result: &str) -> u64 {
    FRONT_COMMAND_TOTAL
        .with_label_values(&[proxy, result])
        .get()
}

pub fn global_error_count() -> u64 {
    GLOBAL_ERROR.get()
}

/// Serve `/metrics` in Prometheus text format.
pub async fn run_http_server(port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .context("invalid metrics bind address")?;
    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
    info!(%addr, "metrics server listening");
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

async fn metrics_handler() -> String {
    let encoder = prometheus::TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&families, &mut buffer) {
        error!(error = %err, "failed to encode prometheus metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_gauges_track_open_close() {
        let proxy = "metrics-test";
        front_conn_open(proxy);
        front_conn_open(proxy);
        front_conn_close(proxy);
        assert_eq!(front_connections_current(proxy), 1);
        assert!(front_connections_total(proxy) >= 2);
    }

    #[test]
    fn stats_version_is_monotonic() {
        let before = stats_version();
        let bumped = stats_version_bump();
        assert!(bumped > before);
        assert!(stats_version() >= bumped);
    }

    #[test]
    fn command_counters_accumulate() {
        let proxy = "metrics-cmd";
        front_command(proxy, true);
        front_command(proxy, false);
        assert!(front_commands(proxy, "ok") >= 1);
        assert!(front_commands(proxy, "fail") >= 1);
    }
}
