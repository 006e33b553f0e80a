use super::is_websocket_upgrade;
use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::StatusCode,
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};

/// Counts requests and errors and records per-endpoint latency.
///
/// Successful WebSocket upgrades are counted but kept out of the latency table;
/// relay traffic is tracked by the session counters instead.
pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService { service }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let endpoint = format!("{} {}", req.method(), req.uri().path());
        let websocket = is_websocket_upgrade(req.headers());

        let app_state = req.app_data::<web::Data<AppState>>().cloned();
        if let Some(app_state) = &app_state {
            app_state.increment_request_count();
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            if let Some(app_state) = app_state {
                match &result {
                    Ok(response) => {
                        let status = response.status();
                        let is_error = status.is_client_error() || status.is_server_error();
                        let upgraded = websocket && status == StatusCode::SWITCHING_PROTOCOLS;

                        if !upgraded {
                            app_state.record_endpoint_request(&endpoint, duration_ms, is_error);
                        }
                        if is_error {
                            app_state.increment_error_count();
                        }
                    }
                    Err(_) => {
                        app_state.record_endpoint_request(&endpoint, duration_ms, true);
                        app_state.increment_error_count();
                    }
                }
            }

            result
        })
    }
}
