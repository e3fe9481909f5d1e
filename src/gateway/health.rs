use super::state::GatewayState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<GatewayState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "turnlink-gateway",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_connections": metrics.active_connections,
            "uploads_completed": metrics.uploads_completed,
            "replies_delivered": metrics.replies_delivered,
            "stop_requests": metrics.stop_requests
        },
        "tasks": {
            "tracked": state.task_count(),
            "audio_chunk_bytes": config.server.audio_chunk_bytes
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_reports_counters() {
        let state = GatewayState::new(AppConfig::default());
        state.register_task("t1");

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["tasks"]["tracked"], 1);
        assert_eq!(body["service"]["name"], "turnlink-gateway");
    }
}
