//! # Application State Management
//!
//! Shared state accessed by every HTTP handler and every relay session.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: Many handlers and session tasks hold a reference to the same data
//! - **RwLock**: Many readers OR one writer at a time
//! - **Poisoning**: A lock is "poisoned" if a thread panicked while holding it. The
//!   counters here stay meaningful after such a panic, so we recover the guard with
//!   `PoisonError::into_inner` instead of panicking a second time.
//!
//! ### RAII Guards
//! [`SessionSlot`] reserves one of the `max_concurrent_sessions` places. The place is
//! released in `Drop`, so a session that ends by error, panic or cancellation can
//! never leak its slot.

use crate::config::AppConfig;
use crate::relay::SessionReport;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// State shared across all handlers and relay sessions.
///
/// Cloning is cheap: every clone points at the same locked data.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (recognition parameters can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// HTTP and relay counters
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected since startup.
///
/// ## HTTP:
/// - **request_count / error_count**: every request and every 4xx/5xx answer
/// - **endpoint_metrics**: per-endpoint request counts and latency
///
/// ## Relay:
/// - **active_sessions**: sessions currently holding a [`SessionSlot`]
/// - **sessions_***: how sessions ended
/// - **audio_bytes_forwarded / results_emitted**: traffic through the relay
/// - **malformed_frames**: upstream frames that could not be decoded
/// - **audio_backpressure_waits**: times a client's reads were paused on a full session queue
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub active_sessions: u32,
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub audio_bytes_forwarded: u64,
    pub results_emitted: u64,
    pub malformed_frames: u64,
    pub audio_backpressure_waits: u64,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for one endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// One reserved relay session place; released on drop.
#[derive(Debug)]
pub struct SessionSlot {
    metrics: Arc<RwLock<AppMetrics>>,
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
    }
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_ref(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately; sessions keep the copy they started with.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    /// Record one request against `endpoint` (e.g. "GET /health").
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Reserve a session place, or `None` when `max_concurrent_sessions` are running.
    ///
    /// The limit is read from the live configuration, so a runtime update applies
    /// to the next connection.
    pub fn try_acquire_session(&self) -> Option<SessionSlot> {
        let limit = self.get_config().performance.max_concurrent_sessions;
        let mut metrics = self.metrics_mut();
        if metrics.active_sessions as usize >= limit {
            return None;
        }

        metrics.active_sessions += 1;
        metrics.sessions_started += 1;
        Some(SessionSlot {
            metrics: Arc::clone(&self.metrics),
        })
    }

    /// Fold a session report into the relay counters.
    pub fn record_session_report(&self, report: &SessionReport) {
        let mut metrics = self.metrics_mut();
        if report.end.is_success() {
            metrics.sessions_completed += 1;
        } else {
            metrics.sessions_failed += 1;
        }
        metrics.audio_bytes_forwarded += report.audio_bytes;
        metrics.results_emitted += report.listener.results_emitted;
        metrics.malformed_frames += report.listener.malformed_frames;
    }

    /// A session that ended with an error (no report).
    pub fn record_session_failure(&self) {
        self.metrics_mut().sessions_failed += 1;
    }

    pub fn record_backpressure_waits(&self, count: u64) {
        self.metrics_mut().audio_backpressure_waits += count;
    }

    /// Snapshot of the current metrics (used by /metrics and /health).
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_ref().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
