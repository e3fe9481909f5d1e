//! HTTP handlers of the loopback gateway.

use super::state::{GatewayState, StopOutcome};
use crate::error::AppError;
use crate::interrupt::StopRequest;
use actix_web::{web, HttpResponse, Result};
use serde_json::json;
use tracing::{info, warn};

/// `POST /control/stop` with `{"sessionId": "<task id>"}`.
///
/// Unknown ids answer `404` with a plain-text body so the client can surface it as is.
/// A task that already finished (delivered or stopped) is acknowledged with `finished`.
pub async fn stop_task(
    state: web::Data<GatewayState>,
    request: web::Json<StopRequest>,
) -> Result<HttpResponse, AppError> {
    let session_id = request.into_inner().session_id;
    if session_id.trim().is_empty() {
        return Err(AppError::ValidationError("sessionId must not be empty".to_string()));
    }

    let status = match state.request_stop(&session_id) {
        StopOutcome::Stopping => "stopping",
        StopOutcome::AlreadyFinished => "finished",
        StopOutcome::Unknown => {
            warn!(task_id = %session_id, "Stop requested for unknown task");
            return Ok(HttpResponse::NotFound()
                .content_type("text/plain; charset=utf-8")
                .body(format!("Session {} not found", session_id)));
        }
    };

    info!(task_id = %session_id, status, "Stop accepted");
    Ok(HttpResponse::Ok().json(json!({
        "status": status,
        "sessionId": session_id,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_stop_known_and_unknown_task() {
        let state = GatewayState::new(AppConfig::default());
        state.register_task("t1");

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/control/stop", web::post().to(stop_task)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/control/stop")
            .set_json(json!({"sessionId": "t1"}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "stopping");
        assert_eq!(state.task_count(), 0);

        let req = test::TestRequest::post()
            .uri("/control/stop")
            .set_json(json!({"sessionId": "t1"}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "finished");

        let req = test::TestRequest::post()
            .uri("/control/stop")
            .set_json(json!({"sessionId": "missing"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 404);
        let body = test::read_body(resp).await;
        assert_eq!(body, "Session missing not found");
    }

    #[actix_web::test]
    async fn test_stop_rejects_empty_id() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(GatewayState::new(AppConfig::default())))
                .route("/control/stop", web::post().to(stop_task)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/control/stop")
            .set_json(json!({"sessionId": " "}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);
    }
}
