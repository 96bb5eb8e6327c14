// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;

use super::*;
use crate::connection::WsClientConnection;
use crate::test_support::{test_query, ListenerEvent, RecordingListener};
use crate::wire::DeviceOs;

fn listener_arc(listener: Arc<RecordingListener>) -> Arc<dyn ServerEvents> {
    listener
}

async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

fn sign_certificate(extra: serde_json::Value) -> String {
    let mut message = json!({
        "method": "signCertificate",
        "csr": "--CSR--",
        "destination": "/sandbox",
        "medium": 1,
    });
    if let (Some(target), Some(source)) = (message.as_object_mut(), extra.as_object()) {
        for (key, value) in source {
            target.insert(key.clone(), value.clone());
        }
    }
    message.to_string()
}

// -- Untrusted message handling -----------------------------------------------

#[tokio::test]
async fn csr_exchange_responds_with_device_id() -> anyhow::Result<()> {
    let listener = RecordingListener::new();
    let events = listener_arc(Arc::clone(&listener));
    let query = test_query("deathstar", DeviceOs::Android, "yoda", "yoda42");

    let response =
        handle_untrusted_message(&events, &query, &sign_certificate(json!({}))).await?;
    assert_eq!(response.as_deref(), Some(r#"{"deviceId":"D1"}"#));
    assert!(!listener
        .recorded()
        .iter()
        .any(|e| matches!(e, ListenerEvent::SetupError(_))));
    Ok(())
}

#[tokio::test]
async fn csr_failure_responds_with_empty_object() -> anyhow::Result<()> {
    let listener = RecordingListener::failing_csr();
    let events = listener_arc(Arc::clone(&listener));
    let query = test_query("deathstar", DeviceOs::Android, "yoda", "yoda42");

    let response =
        handle_untrusted_message(&events, &query, &sign_certificate(json!({}))).await?;
    assert_eq!(response.as_deref(), Some("{}"));
    assert!(listener
        .recorded()
        .iter()
        .any(|e| matches!(e, ListenerEvent::SetupError(msg) if msg.contains("deathstar"))));
    Ok(())
}

#[tokio::test]
async fn same_day_timestamp_is_accepted() -> anyhow::Result<()> {
    let listener = RecordingListener::new();
    let events = listener_arc(Arc::clone(&listener));
    let query = test_query("deathstar", DeviceOs::Android, "yoda", "yoda42");

    let now = chrono::Utc::now().timestamp_millis();
    let response = handle_untrusted_message(
        &events,
        &query,
        &sign_certificate(json!({ "timestamp": now })),
    )
    .await?;
    assert_eq!(response.as_deref(), Some(r#"{"deviceId":"D1"}"#));
    Ok(())
}

#[tokio::test]
async fn stale_timestamp_is_rejected() -> anyhow::Result<()> {
    let listener = RecordingListener::new();
    let events = listener_arc(Arc::clone(&listener));
    let query = test_query("deathstar", DeviceOs::Android, "yoda", "yoda42");

    // Two days ago is never the same calendar day.
    let stale = chrono::Utc::now().timestamp_millis() - 2 * 24 * 60 * 60 * 1000;
    let response = handle_untrusted_message(
        &events,
        &query,
        &sign_certificate(json!({ "timestamp": stale })),
    )
    .await?;
    assert_eq!(response.as_deref(), Some("{}"));
    assert!(listener
        .recorded()
        .iter()
        .any(|e| matches!(e, ListenerEvent::SetupError(msg) if msg.contains("different date"))));
    Ok(())
}

#[tokio::test]
async fn device_logs_are_forwarded() -> anyhow::Result<()> {
    let listener = RecordingListener::new();
    let events = listener_arc(Arc::clone(&listener));
    let query = test_query("deathstar", DeviceOs::Android, "yoda", "yoda42");

    let logs = json!({ "logs": ["1700000000000:info:booted", "garbage"] });
    handle_untrusted_message(&events, &query, &sign_certificate(logs)).await?;
    assert!(listener
        .recorded()
        .iter()
        .any(|e| matches!(e, ListenerEvent::DeviceLogs(1))));
    Ok(())
}

#[tokio::test]
async fn ack_produces_no_response() -> anyhow::Result<()> {
    let listener = RecordingListener::new();
    let events = listener_arc(Arc::clone(&listener));
    let query = test_query("deathstar", DeviceOs::Android, "yoda", "yoda42");

    let raw = json!({"method": "signCertificateAck", "logs": []}).to_string();
    let response = handle_untrusted_message(&events, &query, &raw).await?;
    assert_eq!(response, None);
    Ok(())
}

#[tokio::test]
async fn malformed_untrusted_message_is_an_error() {
    let listener = RecordingListener::new();
    let events = listener_arc(listener);
    let query = test_query("deathstar", DeviceOs::Android, "yoda", "yoda42");

    assert!(handle_untrusted_message(&events, &query, "not json").await.is_err());
    assert!(handle_untrusted_message(&events, &query, r#"{"method":"teleport"}"#)
        .await
        .is_err());
}

// -- Secure session -----------------------------------------------------------

fn secure_query(app: &str) -> SecureClientQuery {
    SecureClientQuery {
        query: test_query(app, DeviceOs::Android, "yoda", "yoda42"),
        csr: None,
        csr_path: None,
        medium: CertificateExchangeMedium::FsAccess,
    }
}

fn establish(
    listener: Arc<RecordingListener>,
) -> (Arc<SecureSession<WsClientConnection>>, mpsc::UnboundedReceiver<Outbound>) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let connection = Arc::new(WsClientConnection::new(outbound_tx.clone()));
    let session = SecureSession::establish(
        listener_arc(listener),
        secure_query("deathstar"),
        connection,
        outbound_tx,
    );
    (session, outbound_rx)
}

const EXECUTE: &str =
    r#"{"method":"execute","params":{"api":"network","method":"newRequest","params":{}}}"#;

#[tokio::test]
async fn execute_messages_dispatch_after_resolution() -> anyhow::Result<()> {
    let listener = RecordingListener::new();
    let (session, _outbound) = establish(Arc::clone(&listener));
    settle().await;

    session.on_raw_message(EXECUTE);
    let recorded = listener.recorded();
    assert!(recorded.iter().any(|e| matches!(
        e,
        ListenerEvent::ClientMessage { id, payload }
            if id == "deathstar#Android#yoda#yoda42" && payload == EXECUTE
    )));
    Ok(())
}

#[tokio::test]
async fn execute_messages_buffer_until_resolution() -> anyhow::Result<()> {
    let listener = RecordingListener::gated();
    let (session, _outbound) = establish(Arc::clone(&listener));
    settle().await;

    let first = EXECUTE.replace("newRequest", "first");
    let second = EXECUTE.replace("newRequest", "second");
    session.on_raw_message(&first);
    session.on_raw_message(&second);
    assert!(
        !listener
            .recorded()
            .iter()
            .any(|e| matches!(e, ListenerEvent::ClientMessage { .. })),
        "messages must buffer until the client resolves"
    );

    listener.release_clients();
    settle().await;

    let messages: Vec<String> = listener
        .recorded()
        .iter()
        .filter_map(|e| match e {
            ListenerEvent::ClientMessage { payload, .. } => Some(payload.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(messages, vec![first, second], "buffered replay preserves arrival order");
    Ok(())
}

#[tokio::test]
async fn failed_resolution_closes_with_internal_error() -> anyhow::Result<()> {
    let listener = RecordingListener::failing_connection();
    let (session, mut outbound) = establish(Arc::clone(&listener));
    settle().await;

    assert_eq!(outbound.try_recv().ok(), Some(Outbound::Close(1011)));

    // Messages after the failure are dropped silently.
    session.on_raw_message(EXECUTE);
    assert!(!listener
        .recorded()
        .iter()
        .any(|e| matches!(e, ListenerEvent::ClientMessage { .. })));
    Ok(())
}

#[tokio::test]
async fn responses_route_to_pending_requests() -> anyhow::Result<()> {
    let listener = RecordingListener::new();
    let (session, mut outbound) = establish(Arc::clone(&listener));
    settle().await;

    let connection = listener
        .connections
        .lock()
        .first()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("client connection not captured"))?;
    let request = connection.send_expect_response(json!({"method": "getPlugins"}));
    tokio::pin!(request);
    let _ = futures_util::poll!(request.as_mut());
    assert!(matches!(outbound.try_recv().ok(), Some(Outbound::Text(_))));

    session.on_raw_message(r#"{"id":0,"success":{"plugins":["network"]}}"#);
    let response = request.await?;
    assert_eq!(response.success, Some(json!({"plugins": ["network"]})));
    Ok(())
}

#[tokio::test]
async fn unmatched_response_raises_an_error() -> anyhow::Result<()> {
    let listener = RecordingListener::new();
    let (session, _outbound) = establish(Arc::clone(&listener));
    settle().await;

    session.on_raw_message(r#"{"id":42,"success":{}}"#);
    assert!(listener
        .recorded()
        .iter()
        .any(|e| matches!(e, ListenerEvent::Error(msg) if msg.contains("42"))));
    Ok(())
}

#[tokio::test]
async fn garbage_messages_raise_errors_without_closing() -> anyhow::Result<()> {
    let listener = RecordingListener::new();
    let (session, mut outbound) = establish(Arc::clone(&listener));
    settle().await;

    session.on_raw_message("not json");
    assert!(listener.recorded().iter().any(|e| matches!(e, ListenerEvent::Error(_))));
    // No close frame was sent.
    assert!(outbound.try_recv().is_err());

    // The connection still works afterwards.
    session.on_raw_message(EXECUTE);
    assert!(listener
        .recorded()
        .iter()
        .any(|e| matches!(e, ListenerEvent::ClientMessage { .. })));
    Ok(())
}
