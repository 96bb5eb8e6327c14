// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end connection tests: certificate exchange over the insecure
//! adapters and the full browser flow, modern and legacy, over real
//! WebSocket clients.

use futures_util::StreamExt;
use serde_json::json;

use periscope::events::HubEvent;
use periscope_specs::{expect_event, recv_json, send_text, Endpoint, TestHub, TIMEOUT};

const DEVICE_QUERY: &str = "device_id=yoda42&device=yoda&app=deathstar&os=Android&sdk_version=4";

// -- Certificate exchange (insecure adapters) ---------------------------------

async fn exchange_certificate_on(endpoint: Endpoint) -> anyhow::Result<()> {
    let hub = TestHub::start(endpoint).await?;
    let mut events = hub.subscribe();
    let mut client = hub.connect(DEVICE_QUERY, None).await?;

    expect_event(&mut events, |e| {
        matches!(e, HubEvent::ClientSetupStart { app, .. } if app == "deathstar")
    })
    .await?;

    send_text(
        &mut client,
        json!({
            "method": "signCertificate",
            "csr": "--CSR--",
            "destination": "/sandbox",
            "medium": 1,
        })
        .to_string(),
    )
    .await?;

    let response = recv_json(&mut client).await?;
    assert_eq!(response, json!({"deviceId": "D1"}));

    hub.stop().await;
    Ok(())
}

#[tokio::test]
async fn certificate_exchange_over_socket_family() -> anyhow::Result<()> {
    exchange_certificate_on(Endpoint::SocketInsecure).await
}

#[tokio::test]
async fn certificate_exchange_over_ws_family() -> anyhow::Result<()> {
    exchange_certificate_on(Endpoint::WsInsecure).await
}

#[tokio::test]
async fn garbled_message_does_not_close_the_connection() -> anyhow::Result<()> {
    let hub = TestHub::start(Endpoint::SocketInsecure).await?;
    let mut client = hub.connect(DEVICE_QUERY, None).await?;

    send_text(&mut client, "not json").await?;
    // The connection survives; a well-formed exchange still works.
    send_text(
        &mut client,
        json!({
            "method": "signCertificate",
            "csr": "--CSR--",
            "destination": "/sandbox",
            "medium": 1,
        })
        .to_string(),
    )
    .await?;
    let response = recv_json(&mut client).await?;
    assert_eq!(response, json!({"deviceId": "D1"}));

    hub.stop().await;
    Ok(())
}

// -- Browser flow -------------------------------------------------------------

#[tokio::test]
async fn browser_modern_flow() -> anyhow::Result<()> {
    let hub = TestHub::start(Endpoint::Browser).await?;
    let mut events = hub.subscribe();
    let mut client = hub
        .connect(
            "device_id=yoda42&device=yoda&app=deathstar&os=MacOS&sdk_version=4",
            Some("http://localhost"),
        )
        .await?;

    let connected = expect_event(&mut events, |e| {
        matches!(e, HubEvent::ClientConnected { .. })
    })
    .await?;
    let HubEvent::ClientConnected { client: description } = connected else {
        anyhow::bail!("expected ClientConnected");
    };
    assert_eq!(description.id, "deathstar#MacOS#yoda#yoda42");

    // Hub requests the plugin list; the client answers over the wire.
    let registry = hub.registry.clone();
    let client_id = description.id.clone();
    let request = tokio::spawn(async move {
        registry
            .client_request_response(&client_id, json!({"method": "getPlugins"}))
            .await
    });

    let get_plugins = recv_json(&mut client).await?;
    assert_eq!(get_plugins["method"], "getPlugins");
    send_text(
        &mut client,
        json!({"id": get_plugins["id"], "success": {"plugins": ["inspector"]}}).to_string(),
    )
    .await?;

    let response = tokio::time::timeout(TIMEOUT, request).await???;
    assert_eq!(response.success, Some(json!({"plugins": ["inspector"]})));

    // Client traffic reaches the message stream keyed by client id.
    let execute = json!({
        "method": "execute",
        "params": { "api": "hub", "method": "admire", "params": "constantly" },
    });
    send_text(&mut client, execute.to_string()).await?;
    let message = expect_event(&mut events, |e| {
        matches!(e, HubEvent::ClientMessage { .. })
    })
    .await?;
    let HubEvent::ClientMessage { id, payload } = message else {
        anyhow::bail!("expected ClientMessage");
    };
    assert_eq!(id, description.id);
    assert_eq!(serde_json::from_str::<serde_json::Value>(&payload)?, execute);

    hub.stop().await;
    Ok(())
}

#[tokio::test]
async fn browser_legacy_flow() -> anyhow::Result<()> {
    let hub = TestHub::start(Endpoint::Browser).await?;
    let mut events = hub.subscribe();
    // Legacy clients only send deviceId and device.
    let mut client = hub
        .connect("deviceId=yoda42&device=yoda", Some("http://localhost"))
        .await?;

    let connected = expect_event(&mut events, |e| {
        matches!(e, HubEvent::ClientConnected { .. })
    })
    .await?;
    let HubEvent::ClientConnected { client: description } = connected else {
        anyhow::bail!("expected ClientConnected");
    };
    assert_eq!(description.id, "yoda#MacOS#yoda#yoda42");

    // The hub asks for plugins; the legacy client never answers directly,
    // but its connect message carries the list.
    let registry = hub.registry.clone();
    let client_id = description.id.clone();
    let request = tokio::spawn(async move {
        registry
            .client_request_response(&client_id, json!({"method": "getPlugins"}))
            .await
    });
    // Let the request hit the wire before the connect message races it.
    let _get_plugins = recv_json(&mut client).await?;

    send_text(
        &mut client,
        json!({"app": "yoda", "type": "connect", "plugins": ["legacyrocks"]}).to_string(),
    )
    .await?;
    let response = tokio::time::timeout(TIMEOUT, request).await???;
    assert_eq!(response.success, Some(json!({"plugins": ["legacyrocks"]})));

    // Legacy envelopes normalize to modern messages before dispatch.
    let execute = json!({
        "method": "execute",
        "params": { "api": "hub", "method": "admire", "params": "constantly" },
    });
    send_text(&mut client, json!({"app": "yoda", "payload": execute}).to_string()).await?;
    let message = expect_event(&mut events, |e| {
        matches!(e, HubEvent::ClientMessage { .. })
    })
    .await?;
    let HubEvent::ClientMessage { payload, .. } = message else {
        anyhow::bail!("expected ClientMessage");
    };
    assert_eq!(serde_json::from_str::<serde_json::Value>(&payload)?, execute);

    hub.stop().await;
    Ok(())
}

#[tokio::test]
async fn browser_refuses_unknown_origins() -> anyhow::Result<()> {
    let hub = TestHub::start(Endpoint::Browser).await?;

    let refused = hub
        .connect("deviceId=yoda42&device=yoda", Some("http://evil.test"))
        .await;
    assert!(refused.is_err(), "mismatched origin must be refused");

    let refused = hub.connect("deviceId=yoda42&device=yoda", None).await;
    assert!(refused.is_err(), "missing origin must be refused");

    hub.stop().await;
    Ok(())
}

#[tokio::test]
async fn browser_disconnect_removes_the_client() -> anyhow::Result<()> {
    let hub = TestHub::start(Endpoint::Browser).await?;
    let mut events = hub.subscribe();
    let mut client = hub
        .connect("deviceId=yoda42&device=yoda", Some("http://localhost"))
        .await?;
    expect_event(&mut events, |e| matches!(e, HubEvent::ClientConnected { .. })).await?;

    send_text(&mut client, json!({"app": "yoda", "type": "disconnect"}).to_string()).await?;
    expect_event(&mut events, |e| matches!(e, HubEvent::ClientDisconnected { .. })).await?;
    assert_eq!(hub.registry.connection_count(), 0);

    // The server sent a close frame.
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, client.next()).await? {
            Some(Ok(message)) if message.is_close() => break,
            Some(Ok(_)) => {}
            Some(Err(_)) | None => break,
        }
    }

    hub.stop().await;
    Ok(())
}
