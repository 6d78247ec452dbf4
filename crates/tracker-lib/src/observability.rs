//! Observability infrastructure for the statement pipeline
//!
//! Provides:
//! - Prometheus metrics (batch latency, pending statements, retry delay, backup posts)
//! - Structured JSON logging with tracing

use prometheus::{
    register_gauge, register_histogram, register_int_counter, register_int_gauge, Gauge,
    Histogram, IntCounter, IntGauge,
};
use chrono::{DateTime, Utc};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Histogram buckets for batch round-trip latency (in seconds)
const SEND_LATENCY_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<PipelineMetricsInner> = OnceLock::new();

struct PipelineMetricsInner {
    batches_sent: IntCounter,
    statements_sent: IntCounter,
    batch_failures: IntCounter,
    token_refreshes: IntCounter,
    backup_posts: IntCounter,
    backup_failures: IntCounter,
    pending_statements: IntGauge,
    retry_delay_seconds: Gauge,
    online: IntGauge,
    batch_send_seconds: Histogram,
}

impl PipelineMetricsInner {
    fn new() -> Self {
        Self {
            batches_sent: register_int_counter!(
                "tracker_batches_sent_total",
                "Batches accepted by the primary collector"
            )
            .expect("Failed to register batches_sent"),

            statements_sent: register_int_counter!(
                "tracker_statements_sent_total",
                "Statements accepted by the primary collector"
            )
            .expect("Failed to register statements_sent"),

            batch_failures: register_int_counter!(
                "tracker_batch_failures_total",
                "Batch submissions that failed"
            )
            .expect("Failed to register batch_failures"),

            token_refreshes: register_int_counter!(
                "tracker_token_refreshes_total",
                "Credential refreshes triggered by rejected requests"
            )
            .expect("Failed to register token_refreshes"),

            backup_posts: register_int_counter!(
                "tracker_backup_posts_total",
                "Successful backup mirror posts"
            )
            .expect("Failed to register backup_posts"),

            backup_failures: register_int_counter!(
                "tracker_backup_failures_total",
                "Failed backup mirror posts"
            )
            .expect("Failed to register backup_failures"),

            pending_statements: register_int_gauge!(
                "tracker_pending_statements",
                "Buffered statements not yet accepted by the primary collector"
            )
            .expect("Failed to register pending_statements"),

            retry_delay_seconds: register_gauge!(
                "tracker_retry_delay_seconds",
                "Current retry backoff delay, 0 when healthy"
            )
            .expect("Failed to register retry_delay_seconds"),

            online: register_int_gauge!(
                "tracker_online",
                "1 when the pipeline believes the collector is reachable"
            )
            .expect("Failed to register online"),

            batch_send_seconds: register_histogram!(
                "tracker_batch_send_seconds",
                "Round-trip time of primary batch submissions",
                SEND_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register batch_send_seconds"),
        }
    }
}

/// Pipeline metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance. Every pipeline in the
/// process reports into the same registry.
#[derive(Clone)]
pub struct PipelineMetrics {
    _private: (),
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &PipelineMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn record_batch_sent(&self, statements: usize, elapsed: Duration) {
        let inner = self.inner();
        inner.batches_sent.inc();
        inner.statements_sent.inc_by(statements as u64);
        inner.batch_send_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn inc_batch_failures(&self) {
        self.inner().batch_failures.inc();
    }

    pub fn inc_token_refreshes(&self) {
        self.inner().token_refreshes.inc();
    }

    pub fn record_backup(&self, success: bool) {
        if success {
            self.inner().backup_posts.inc();
        } else {
            self.inner().backup_failures.inc();
        }
    }

    pub fn set_pending(&self, pending: usize) {
        self.inner().pending_statements.set(pending as i64);
    }

    /// Current backoff delay, `None` when no failure is outstanding
    pub fn set_retry_delay(&self, delay: Option<Duration>) {
        self.inner()
            .retry_delay_seconds
            .set(retry_delay_seconds(delay));
    }

    pub fn set_online(&self, online: bool) {
        self.inner().online.set(i64::from(online));
    }
}

/// Gauge value for a backoff delay; sub-second delays stay visible
fn retry_delay_seconds(delay: Option<Duration>) -> f64 {
    delay.map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

/// Structured logger for pipeline events
///
/// Every event carries an `event` field and the actor the pipeline tracks.
#[derive(Clone)]
pub struct StructuredLogger {
    actor: String,
}

impl StructuredLogger {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
        }
    }

    pub fn log_startup(&self, version: &str, endpoint: &str, batch_size: usize, backup: bool) {
        info!(
            event = "pipeline_started",
            actor = %self.actor,
            version = %version,
            endpoint = %endpoint,
            batch_size = batch_size,
            backup_enabled = backup,
            "Statement pipeline started"
        );
    }

    pub fn log_batch_delivered(&self, statements: usize, delivered_offset: usize, pending: usize) {
        info!(
            event = "batch_delivered",
            actor = %self.actor,
            statements = statements,
            delivered_offset = delivered_offset,
            pending = pending,
            "Batch accepted by collector"
        );
    }

    pub fn log_batch_failed(&self, statements: usize, error: &str, retry_delay: Option<Duration>) {
        warn!(
            event = "batch_failed",
            actor = %self.actor,
            statements = statements,
            error = %error,
            retry_delay_ms = retry_delay.map(|d| d.as_millis() as u64),
            "Batch delivery failed, statements stay buffered"
        );
    }

    pub fn log_backup(&self, statements: usize, format: &str, error: Option<&str>) {
        match error {
            None => info!(
                event = "backup_mirrored",
                actor = %self.actor,
                statements = statements,
                format = %format,
                "Buffer mirrored to backup sink"
            ),
            Some(error) => warn!(
                event = "backup_failed",
                actor = %self.actor,
                statements = statements,
                format = %format,
                error = %error,
                "Backup mirror failed"
            ),
        }
    }

    pub fn log_credential_refreshed(&self, expires_at: DateTime<Utc>) {
        info!(
            event = "credential_refreshed",
            actor = %self.actor,
            expires_at = %expires_at,
            "OAuth2 token issued"
        );
    }

    pub fn log_credential_refresh_failed(&self, error: &str) {
        warn!(
            event = "credential_refresh_failed",
            actor = %self.actor,
            error = %error,
            "OAuth2 token exchange failed, keeping previous token"
        );
    }

    pub fn log_logout(&self, credential: &str, pending: usize) {
        info!(
            event = "logout",
            actor = %self.actor,
            credential = %credential,
            pending = pending,
            "Credential dropped, delivery parked until next login"
        );
    }

    pub fn log_connectivity(&self, online: bool, pending: usize) {
        if online {
            info!(
                event = "connectivity",
                actor = %self.actor,
                online = true,
                pending = pending,
                "Collector reachable again"
            );
        } else {
            warn!(
                event = "connectivity",
                actor = %self.actor,
                online = false,
                pending = pending,
                "Collector unreachable, buffering locally"
            );
        }
    }
}

/// Install a JSON tracing subscriber filtered by `RUST_LOG`
///
/// `debug` lowers the default level when `RUST_LOG` is unset. Returns quietly
/// if a global subscriber is already installed.
pub fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .try_init();
}
