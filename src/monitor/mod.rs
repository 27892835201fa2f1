use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use prometheus::Encoder;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Self-monitor: guardrail and health counters for the engine itself.
///
/// Subsystems hold an `Arc<Monitor>` and record noteworthy events;
/// the counters are served in Prometheus text format on /metrics.
/// This table is the authority guardrail code reports to — the
/// counters never feed back into aggregation.
pub struct Monitor {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Pull path ===
    /// Pulls that failed or timed out, by atom tag.
    pull_failures: CounterVec,
    /// Pull requests for tags with no registered puller, by atom tag.
    pullers_not_found: CounterVec,
    /// Pulls rejected because the config's uid provider was missing.
    uid_provider_missing: CounterVec,
    /// Currently registered pull callbacks, by atom tag.
    pullers_registered: GaugeVec,
    /// Pull alarms fired.
    pub alarms_fired: Counter,

    // === Producer path ===
    /// Dimension tuple count recorded once a producer crosses the
    /// soft limit, by metric id.
    metric_dimension_size: GaugeVec,
    /// New-key insertions rejected by the dimension hard limit.
    hard_dimension_limit_reached: CounterVec,
    /// Buckets closed, by metric id.
    buckets_flushed: CounterVec,
    /// Past buckets discarded by drop_data, by metric id.
    buckets_dropped: CounterVec,
    /// Events discarded because they predate the producer time base.
    pub stale_events_dropped: Counter,

    // === uid map ===
    /// Bytes retained by the uid map change log.
    uid_map_bytes: Gauge,
    /// Change records evicted to stay under the byte budget.
    pub uid_map_changes_evicted: Counter,
}

impl Monitor {
    /// Creates a monitor with all counters registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let pull_failures = CounterVec::new(
            Opts::new("pull_failures_total", "Pulls that failed or timed out.")
                .namespace("metrond"),
            &["atom"],
        )?;
        let pullers_not_found = CounterVec::new(
            Opts::new(
                "pullers_not_found_total",
                "Pull requests with no registered puller.",
            )
            .namespace("metrond"),
            &["atom"],
        )?;
        let uid_provider_missing = CounterVec::new(
            Opts::new(
                "uid_provider_missing_total",
                "Pulls rejected for lack of a uid provider.",
            )
            .namespace("metrond"),
            &["atom"],
        )?;
        let pullers_registered = GaugeVec::new(
            Opts::new("pullers_registered", "Currently registered pull callbacks.")
                .namespace("metrond"),
            &["atom"],
        )?;
        let alarms_fired = Counter::with_opts(
            Opts::new("alarms_fired_total", "Pull alarms fired.").namespace("metrond"),
        )?;

        let metric_dimension_size = GaugeVec::new(
            Opts::new(
                "metric_dimension_size",
                "Dimension tuple count past the soft limit.",
            )
            .namespace("metrond"),
            &["metric"],
        )?;
        let hard_dimension_limit_reached = CounterVec::new(
            Opts::new(
                "hard_dimension_limit_reached_total",
                "New-key insertions rejected by the dimension hard limit.",
            )
            .namespace("metrond"),
            &["metric"],
        )?;
        let buckets_flushed = CounterVec::new(
            Opts::new("buckets_flushed_total", "Buckets closed per metric.")
                .namespace("metrond"),
            &["metric"],
        )?;
        let buckets_dropped = CounterVec::new(
            Opts::new("buckets_dropped_total", "Past buckets discarded per metric.")
                .namespace("metrond"),
            &["metric"],
        )?;
        let stale_events_dropped = Counter::with_opts(
            Opts::new(
                "stale_events_dropped_total",
                "Events older than the producer time base.",
            )
            .namespace("metrond"),
        )?;

        let uid_map_bytes = Gauge::with_opts(
            Opts::new("uid_map_bytes", "Bytes retained by the uid map change log.")
                .namespace("metrond"),
        )?;
        let uid_map_changes_evicted = Counter::with_opts(
            Opts::new(
                "uid_map_changes_evicted_total",
                "Change records evicted to stay under the byte budget.",
            )
            .namespace("metrond"),
        )?;

        registry.register(Box::new(pull_failures.clone()))?;
        registry.register(Box::new(pullers_not_found.clone()))?;
        registry.register(Box::new(uid_provider_missing.clone()))?;
        registry.register(Box::new(pullers_registered.clone()))?;
        registry.register(Box::new(alarms_fired.clone()))?;
        registry.register(Box::new(metric_dimension_size.clone()))?;
        registry.register(Box::new(hard_dimension_limit_reached.clone()))?;
        registry.register(Box::new(buckets_flushed.clone()))?;
        registry.register(Box::new(buckets_dropped.clone()))?;
        registry.register(Box::new(stale_events_dropped.clone()))?;
        registry.register(Box::new(uid_map_bytes.clone()))?;
        registry.register(Box::new(uid_map_changes_evicted.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            pull_failures,
            pullers_not_found,
            uid_provider_missing,
            pullers_registered,
            alarms_fired,
            metric_dimension_size,
            hard_dimension_limit_reached,
            buckets_flushed,
            buckets_dropped,
            stale_events_dropped,
            uid_map_bytes,
            uid_map_changes_evicted,
        })
    }

    /// Creates a monitor that is never served; used by tests and by
    /// subsystems constructed before the config is loaded.
    pub fn detached() -> Arc<Self> {
        Arc::new(Self::new("").expect("static metric definitions are valid"))
    }

    pub fn note_pull_failed(&self, atom_tag: i32) {
        self.pull_failures
            .with_label_values(&[&atom_tag.to_string()])
            .inc();
    }

    pub fn note_puller_not_found(&self, atom_tag: i32) {
        self.pullers_not_found
            .with_label_values(&[&atom_tag.to_string()])
            .inc();
    }

    pub fn note_uid_provider_missing(&self, atom_tag: i32) {
        self.uid_provider_missing
            .with_label_values(&[&atom_tag.to_string()])
            .inc();
    }

    pub fn note_puller_registration_changed(&self, atom_tag: i32, registered: bool) {
        let gauge = self
            .pullers_registered
            .with_label_values(&[&atom_tag.to_string()]);
        if registered {
            gauge.inc();
        } else {
            gauge.dec();
        }
    }

    pub fn note_metric_dimension_size(&self, metric_id: i64, size: usize) {
        self.metric_dimension_size
            .with_label_values(&[&metric_id.to_string()])
            .set(size as f64);
    }

    pub fn note_hard_dimension_limit_reached(&self, metric_id: i64) {
        self.hard_dimension_limit_reached
            .with_label_values(&[&metric_id.to_string()])
            .inc();
    }

    pub fn note_bucket_flushed(&self, metric_id: i64) {
        self.buckets_flushed
            .with_label_values(&[&metric_id.to_string()])
            .inc();
    }

    pub fn note_buckets_dropped(&self, metric_id: i64) {
        self.buckets_dropped
            .with_label_values(&[&metric_id.to_string()])
            .inc();
    }

    pub fn note_uid_map_bytes(&self, bytes: usize) {
        self.uid_map_bytes.set(bytes as f64);
    }

    /// Reads back a pull-path counter, for tests and shell dumps.
    pub fn pull_failure_count(&self, atom_tag: i32) -> u64 {
        self.pull_failures
            .with_label_values(&[&atom_tag.to_string()])
            .get() as u64
    }

    /// Reads back the hard-limit counter for a metric.
    pub fn hard_limit_count(&self, metric_id: i64) -> u64 {
        self.hard_dimension_limit_reached
            .with_label_values(&[&metric_id.to_string()])
            .get() as u64
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("listening on {}", self.addr))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "self-monitor server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "self-monitor server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the self-monitor server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - liveness probe.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate_per_label() {
        let monitor = Monitor::detached();
        monitor.note_pull_failed(42);
        monitor.note_pull_failed(42);
        monitor.note_pull_failed(7);

        assert_eq!(monitor.pull_failure_count(42), 2);
        assert_eq!(monitor.pull_failure_count(7), 1);
        assert_eq!(monitor.pull_failure_count(999), 0);
    }

    #[test]
    fn test_registration_gauge_tracks_up_and_down() {
        let monitor = Monitor::detached();
        monitor.note_puller_registration_changed(5, true);
        monitor.note_puller_registration_changed(5, true);
        monitor.note_puller_registration_changed(5, false);

        let value = monitor
            .pullers_registered
            .with_label_values(&["5"])
            .get();
        assert_eq!(value as i64, 1);
    }

    #[test]
    fn test_hard_limit_counter() {
        let monitor = Monitor::detached();
        monitor.note_hard_dimension_limit_reached(1234);
        assert_eq!(monitor.hard_limit_count(1234), 1);
    }

    #[test]
    fn test_gathered_families_include_namespace() {
        let monitor = Monitor::detached();
        monitor.note_bucket_flushed(1);
        let families = monitor.registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "metrond_buckets_flushed_total"));
    }
}
