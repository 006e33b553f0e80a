use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port,
            "ws_path": config.server.ws_path
        },
        "upstream": {
            "url": config.upstream.url,
            "model": config.upstream.model,
            "sample_rate": config.upstream.sample_rate,
            "language_hints": config.upstream.language_hints,
            "api_key_configured": !config.upstream.api_key.trim().is_empty()
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": ratio(metrics.error_count, metrics.request_count),
            "active_sessions": metrics.active_sessions
        },
        "memory": get_memory_info(),
        "system": get_system_status(&config, &metrics)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    let endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": ratio(metrics.error_count, metrics.request_count),
            "requests_per_second": ratio(metrics.request_count, uptime_seconds)
        },
        "relay": {
            "active_sessions": metrics.active_sessions,
            "sessions_started": metrics.sessions_started,
            "sessions_completed": metrics.sessions_completed,
            "sessions_failed": metrics.sessions_failed,
            "audio_bytes_forwarded": metrics.audio_bytes_forwarded,
            "results_emitted": metrics.results_emitted,
            "malformed_frames": metrics.malformed_frames,
            "audio_backpressure_waits": metrics.audio_backpressure_waits
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info(),
        "performance": {
            "max_concurrent_sessions": config.performance.max_concurrent_sessions,
            "audio_queue_capacity": config.performance.audio_queue_capacity
        }
    }))
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator > 0 {
        numerator as f64 / denominator as f64
    } else {
        0.0
    }
}

/// Resident and virtual memory of this process, read from `/proc` on Linux.
fn get_memory_info() -> serde_json::Value {
    match read_proc_memory() {
        Some((resident, virtual_size)) => json!({
            "resident_memory_bytes": resident,
            "virtual_memory_bytes": virtual_size,
            "available": true
        }),
        None => json!({
            "resident_memory_bytes": 0,
            "virtual_memory_bytes": 0,
            "available": false,
            "note": "Memory info not available on this platform"
        }),
    }
}

#[cfg(target_os = "linux")]
fn read_proc_memory() -> Option<(u64, u64)> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", std::process::id())).ok()?;

    let field_bytes = |name: &str| {
        status
            .lines()
            .find(|line| line.starts_with(name))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
            .unwrap_or(0)
    };

    Some((field_bytes("VmRSS:"), field_bytes("VmSize:")))
}

#[cfg(not(target_os = "linux"))]
fn read_proc_memory() -> Option<(u64, u64)> {
    None
}

fn get_system_status(
    config: &crate::config::AppConfig,
    metrics: &crate::state::AppMetrics,
) -> serde_json::Value {
    let max_sessions = config.performance.max_concurrent_sessions;
    let session_usage = if max_sessions > 0 {
        metrics.active_sessions as f64 / max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage >= 1.0 {
        "at_capacity"
    } else if session_usage > 0.7 {
        "high_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": max_sessions,
        "current_sessions": metrics.active_sessions,
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - new clients will get 503 at capacity"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_reports_upstream_and_load() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 1;
        let state = AppState::new(config);
        let _slot = state.try_acquire_session().unwrap();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["upstream"]["model"], "paraformer-realtime-v2");
        assert_eq!(body["upstream"]["api_key_configured"], false);
        assert_eq!(body["system"]["status"], "at_capacity");
        assert_eq!(body["metrics"]["active_sessions"], 1);
    }

    #[actix_web::test]
    async fn test_metrics_include_relay_counters() {
        let state = AppState::new(AppConfig::default());
        state.record_backpressure_waits(2);
        state.record_session_failure();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/api/v1/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/metrics").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["relay"]["audio_backpressure_waits"], 2);
        assert_eq!(body["relay"]["sessions_failed"], 1);
        assert_eq!(body["performance"]["audio_queue_capacity"], 64);
    }
}
