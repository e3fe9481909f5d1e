//! # Interrupt Client
//!
//! The out-of-band stop request: `POST {http_base_url}/{stop_path}` with
//! `{"sessionId": "<task id>"}`. It is advisory; the backend decides what stopping means
//! and the local session state does not change because of it.

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Fallback message when a failed stop response has no body.
const INTERRUPT_FAILED: &str = "interrupt request failed";

/// Body of the stop request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopRequest {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

/// Sends stop requests for a task.
#[async_trait]
pub trait Interrupter: Send + Sync {
    async fn stop(&self, session_id: &str) -> AppResult<()>;
}

/// `reqwest`-based interrupter.
#[derive(Debug, Clone)]
pub struct HttpInterrupter {
    http: reqwest::Client,
    stop_url: String,
}

impl HttpInterrupter {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.client.interrupt_timeout())
            .build()?;

        Ok(Self {
            http,
            stop_url: config.gateway.stop_url(),
        })
    }

    pub fn stop_url(&self) -> &str {
        &self.stop_url
    }
}

#[async_trait]
impl Interrupter for HttpInterrupter {
    async fn stop(&self, session_id: &str) -> AppResult<()> {
        let request = StopRequest {
            session_id: session_id.to_string(),
        };

        let response = self.http.post(&self.stop_url).json(&request).send().await?;
        let status = response.status();

        if status.is_success() {
            info!(task_id = %session_id, "Interrupt accepted");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let message = if body.trim().is_empty() {
            INTERRUPT_FAILED.to_string()
        } else {
            body.trim().to_string()
        };
        warn!(task_id = %session_id, status = %status, error = %message, "Interrupt rejected");
        Err(AppError::Backend(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_request_wire_shape() {
        let body = serde_json::to_value(StopRequest {
            session_id: "t1".to_string(),
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"sessionId": "t1"}));
    }

    #[test]
    fn test_stop_url_from_config() {
        let mut config = AppConfig::default();
        config.gateway.http_base_url = "http://backend:9000/".to_string();
        let interrupter = HttpInterrupter::new(&config).unwrap();
        assert_eq!(interrupter.stop_url(), "http://backend:9000/control/stop");
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transport_error() {
        // Reserve a free port, then release it so nothing is listening there
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = AppConfig::default();
        config.gateway.http_base_url = format!("http://127.0.0.1:{}", port);
        config.client.interrupt_timeout_ms = 500;
        let interrupter = HttpInterrupter::new(&config).unwrap();

        let err = interrupter.stop("t1").await.unwrap_err();
        assert!(matches!(err, AppError::Transport(_)));
    }
}
