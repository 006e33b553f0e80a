use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Configuration as shown over HTTP. The API key is never included.
fn config_view(config: &AppConfig) -> serde_json::Value {
    json!({
        "mode": config.mode,
        "server": {
            "host": config.server.host,
            "port": config.server.port,
            "ws_path": config.server.ws_path,
            "allowed_origins": config.server.allowed_origins
        },
        "upstream": {
            "url": config.upstream.url,
            "api_key_configured": !config.upstream.api_key.trim().is_empty(),
            "data_inspection": config.upstream.data_inspection,
            "model": config.upstream.model,
            "format": config.upstream.format,
            "sample_rate": config.upstream.sample_rate,
            "language_hints": config.upstream.language_hints,
            "task_start_timeout_secs": config.upstream.task_start_timeout_secs,
            "finish_timeout_secs": config.upstream.finish_timeout_secs
        },
        "performance": {
            "max_concurrent_sessions": config.performance.max_concurrent_sessions,
            "audio_queue_capacity": config.performance.audio_queue_capacity
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

/// Apply a partial update; only sessions opened afterwards see the new values.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config.update_from_json(&json_str)?;

    state.update_config(current_config.clone()).map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test, App};

    fn state() -> AppState {
        let mut config = AppConfig::default();
        config.upstream.api_key = "sk-secret".to_string();
        AppState::new(config)
    }

    #[actix_web::test]
    async fn test_get_config_hides_api_key() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state()))
                .route("/api/v1/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/config").to_request();
        let body = test::call_and_read_body(&app, req).await;
        let text = String::from_utf8(body.to_vec()).unwrap();

        assert!(!text.contains("sk-secret"));
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["config"]["upstream"]["api_key_configured"], true);
        assert_eq!(json["config"]["mode"], "serve");
    }

    #[actix_web::test]
    async fn test_update_config() {
        let state = state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/api/v1/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"upstream": {"language_hints": ["en"], "sample_rate": 8000}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let config = state.get_config();
        assert_eq!(config.upstream.language_hints, vec!["en".to_string()]);
        assert_eq!(config.upstream.sample_rate, 8000);
        assert_eq!(config.upstream.api_key, "sk-secret");
    }

    #[actix_web::test]
    async fn test_update_config_rejects_invalid_values() {
        let state = state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/api/v1/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"performance": {"max_concurrent_sessions": 0}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().performance.max_concurrent_sessions, 10);
    }
}
