//! End-to-end turns: the WebSocket turn client against the loopback gateway.

use std::net::SocketAddr;
use std::time::Duration;
use turnlink::audio::RecordedInput;
use turnlink::gateway::{self, GatewayState};
use turnlink::interrupt::{HttpInterrupter, Interrupter};
use turnlink::{AppConfig, AppError, OutputStatus, TurnClient, UploadStatus};

/// Start a gateway on a free port and return a client config pointing at it.
fn start_gateway(audio_chunk_bytes: usize) -> (AppConfig, GatewayState, SocketAddr) {
    let mut config = AppConfig::default();
    config.server.port = 0;
    config.server.audio_chunk_bytes = audio_chunk_bytes;
    config.client.turn_timeout_ms = 10_000;

    let state = GatewayState::new(config.clone());
    let (server, addrs) = gateway::bind(&config, state.clone()).expect("bind gateway");
    actix_web::rt::spawn(server);

    let addr = addrs[0];
    (gateway::client_config_for(&config, addr), state, addr)
}

#[actix_web::test]
async fn text_turn_is_echoed() {
    let (config, state, _) = start_gateway(1024);
    let mut client = TurnClient::from_config(config).unwrap();

    client.submit_text("hello gateway").unwrap();
    let snapshot = client.run_until_settled().await.unwrap();

    assert_eq!(snapshot.upload_status, UploadStatus::Queued);
    assert_eq!(snapshot.output_status, OutputStatus::Completed);
    assert_eq!(snapshot.received_text.as_deref(), Some("hello gateway"));
    assert_eq!(snapshot.audio_handle, None);
    assert_eq!(snapshot.last_error, None);

    // Delivered tasks leave the table
    let task_id = snapshot.task_id.expect("task id assigned");
    assert!(!state.has_task(&task_id));
    assert_eq!(state.task_count(), 0);
    assert_eq!(state.get_metrics_snapshot().replies_delivered, 1);
}

#[actix_web::test]
async fn audio_turn_is_reassembled_across_chunks() {
    let (config, _, _) = start_gateway(1000);
    let mut client = TurnClient::from_config(config).unwrap();

    let recorded: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
    let recording = RecordedInput::from_bytes(&recorded, 700).unwrap();
    assert_eq!(recording.len(), 4);

    client.submit_audio(recording).unwrap();
    let snapshot = client.run_until_settled().await.unwrap();

    assert_eq!(snapshot.upload_status, UploadStatus::Queued);
    assert_eq!(snapshot.output_status, OutputStatus::Completed);
    assert_eq!(snapshot.last_error, None);
    assert!(snapshot
        .received_text
        .as_deref()
        .unwrap_or_default()
        .contains("2500 bytes"));

    let handle = snapshot.audio_handle.expect("audio handle");
    let audio = client.resolve_audio(&handle).expect("live audio");
    assert_eq!(audio.media_type, "audio/mpeg");
    assert_eq!(audio.bytes, recorded);
}

#[actix_web::test]
async fn second_turn_replaces_first() {
    let (config, state, _) = start_gateway(1024);
    let mut client = TurnClient::from_config(config).unwrap();

    client.submit_text("first").unwrap();
    let first = client.run_until_settled().await.unwrap();

    client.submit_text("second").unwrap();
    let second = client.run_until_settled().await.unwrap();

    assert_eq!(second.received_text.as_deref(), Some("second"));
    assert_ne!(first.task_id, second.task_id);
    assert_eq!(state.task_count(), 0);
}

#[actix_web::test]
async fn stop_for_unknown_task_reports_backend_text() {
    let (config, _, _) = start_gateway(1024);
    let interrupter = HttpInterrupter::new(&config).unwrap();

    let err = interrupter.stop("does-not-exist").await.unwrap_err();
    assert_eq!(
        err,
        AppError::Backend("Session does-not-exist not found".to_string())
    );
}

#[actix_web::test]
async fn interrupt_is_accepted_without_changing_upload_status() {
    let (config, state, _) = start_gateway(1024);
    let mut client = TurnClient::from_config(config).unwrap();

    client.submit_text("stop me").unwrap();
    let before = client.run_until_settled().await.unwrap();

    // Returns at once; the stop request runs in the background
    assert!(client.interrupt());
    tokio::time::timeout(Duration::from_secs(5), async {
        while state.get_metrics_snapshot().stop_requests == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stop request reached the gateway");

    let after = client.snapshot();
    assert_eq!(after.upload_status, before.upload_status);
    assert_eq!(after.output_status, before.output_status);
    assert_eq!(after.last_error, None);
    assert_eq!(state.get_metrics_snapshot().stop_requests, 1);
    assert_eq!(state.task_count(), 0);
}

#[actix_web::test]
async fn health_endpoint_reports_service() {
    let (_, _, addr) = start_gateway(1024);

    let body: serde_json::Value = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"]["name"], "turnlink-gateway");
}
