// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use super::*;
use crate::adapter::ServerEvents as _;
use crate::events::HubEvent;
use crate::test_support::{drain_events, test_query, StubCertificateProvider, StubConnection};

fn registry_with(provider: Arc<StubCertificateProvider>) -> Arc<ControllerInner> {
    ControllerInner::new(HubSettings::default(), provider)
}

fn registry() -> Arc<ControllerInner> {
    registry_with(StubCertificateProvider::new("D1"))
}

#[tokio::test]
async fn add_connection_registers_and_emits() -> anyhow::Result<()> {
    let registry = registry();
    let mut rx = registry.subscribe();
    let connection = StubConnection::new();

    let client = registry
        .add_connection(
            connection,
            test_query("deathstar", DeviceOs::Ios, "yoda", "yoda42"),
            CsrQuery::default(),
            false,
        )
        .await?;

    assert_eq!(client.id, "deathstar#iOS#yoda#yoda42");
    assert_eq!(registry.connection_count(), 1);
    assert_eq!(registry.client(&client.id).map(|c| c.id), Some(client.id.clone()));

    let events = drain_events(&mut rx);
    assert!(matches!(
        events.as_slice(),
        [HubEvent::ClientConnected { client }] if client.id == "deathstar#iOS#yoda#yoda42"
    ));
    Ok(())
}

#[tokio::test]
async fn android_device_id_is_resolved_from_csr() -> anyhow::Result<()> {
    let provider = StubCertificateProvider::new("resolved-device");
    let registry = registry_with(Arc::clone(&provider));
    let connection = StubConnection::new();

    let client = registry
        .add_connection(
            connection,
            test_query("deathstar", DeviceOs::Android, "yoda", "stale-device"),
            CsrQuery {
                csr: Some("--CSR--".to_owned()),
                csr_path: Some("/data/app.csr".to_owned()),
            },
            false,
        )
        .await?;

    assert_eq!(client.id, "deathstar#Android#yoda#resolved-device");
    assert_eq!(
        provider.calls.lock().as_slice(),
        ["extract_app_name_from_csr", "get_target_device_id"]
    );
    Ok(())
}

#[tokio::test]
async fn android_without_csr_keeps_reported_device_id() -> anyhow::Result<()> {
    let registry = registry();
    let client = registry
        .add_connection(
            StubConnection::new(),
            test_query("deathstar", DeviceOs::Android, "yoda", "yoda42"),
            CsrQuery::default(),
            false,
        )
        .await?;
    assert_eq!(client.id, "deathstar#Android#yoda#yoda42");
    Ok(())
}

#[tokio::test]
async fn outdated_sdk_gets_a_name_hint() -> anyhow::Result<()> {
    let registry = registry();
    let mut query = test_query("deathstar", DeviceOs::Ios, "yoda", "yoda42");
    query.sdk_version = Some(1);
    let client = registry
        .add_connection(StubConnection::new(), query, CsrQuery::default(), false)
        .await?;
    assert_eq!(client.query.app, "deathstar (Outdated SDK)");
    Ok(())
}

#[tokio::test]
async fn reconnect_replaces_zombie_connection() -> anyhow::Result<()> {
    let registry = registry();
    let mut rx = registry.subscribe();
    let first = StubConnection::new();
    let second = StubConnection::new();
    let query = test_query("deathstar", DeviceOs::Ios, "yoda", "yoda42");

    registry
        .add_connection(first.clone(), query.clone(), CsrQuery::default(), false)
        .await?;
    registry
        .add_connection(second.clone(), query, CsrQuery::default(), false)
        .await?;

    assert!(first.is_closed());
    assert!(!second.is_closed());
    assert_eq!(registry.connection_count(), 1);

    let events = drain_events(&mut rx);
    assert!(matches!(
        events.as_slice(),
        [
            HubEvent::ClientConnected { .. },
            HubEvent::ClientDisconnected { .. },
            HubEvent::ClientConnected { .. },
        ]
    ));
    Ok(())
}

#[tokio::test]
async fn silent_replace_keeps_the_old_connection_open() -> anyhow::Result<()> {
    let registry = registry();
    let first = StubConnection::new();
    let query = test_query("deathstar", DeviceOs::Ios, "yoda", "yoda42");

    registry
        .add_connection(first.clone(), query.clone(), CsrQuery::default(), false)
        .await?;
    let mut rx = registry.subscribe();
    registry
        .add_connection(StubConnection::new(), query, CsrQuery::default(), true)
        .await?;

    assert!(!first.is_closed());
    assert_eq!(registry.connection_count(), 1);
    let events = drain_events(&mut rx);
    assert!(
        !events.iter().any(|e| matches!(e, HubEvent::ClientDisconnected { .. })),
        "silent replace must not emit a disconnect"
    );
    Ok(())
}

#[tokio::test]
async fn transport_close_removes_the_registration() -> anyhow::Result<()> {
    let registry = registry();
    let connection = StubConnection::new();
    let client = registry
        .add_connection(
            connection.clone(),
            test_query("deathstar", DeviceOs::Ios, "yoda", "yoda42"),
            CsrQuery::default(),
            false,
        )
        .await?;
    let mut rx = registry.subscribe();

    connection.fire(crate::connection::ConnectionStatus::Closed);

    assert_eq!(registry.connection_count(), 0);
    let events = drain_events(&mut rx);
    assert!(matches!(
        events.as_slice(),
        [HubEvent::ClientDisconnected { id }] if *id == client.id
    ));
    Ok(())
}

#[tokio::test]
async fn fake_clients_have_no_live_connection() -> anyhow::Result<()> {
    let registry = registry();
    let query = test_query("import", DeviceOs::MacOs, "file", "session-1");
    let id = build_client_id(&query);
    registry.attach_fake_client(ClientDescription { id: id.clone(), query });

    assert_eq!(registry.connection_count(), 1);
    assert!(registry.client_request(&id, json!({"method": "ping"})).is_err());
    Ok(())
}

#[tokio::test]
async fn command_dispatch_reaches_the_connection() -> anyhow::Result<()> {
    let registry = registry();
    let connection = StubConnection::new();
    let client = registry
        .add_connection(
            connection.clone(),
            test_query("deathstar", DeviceOs::Ios, "yoda", "yoda42"),
            CsrQuery::default(),
            false,
        )
        .await?;

    registry.client_request(&client.id, json!({"method": "refresh"}))?;
    let response = registry
        .client_request_response(&client.id, json!({"id": 7, "method": "getPlugins"}))
        .await?;

    assert_eq!(response.id, Some(7));
    assert_eq!(connection.sent.lock().len(), 2);
    assert!(registry.client_request("unknown#id", json!({})).is_err());
    Ok(())
}

// -- Certificate exchange -----------------------------------------------------

#[tokio::test]
async fn csr_happy_path_resolves_device_id() -> anyhow::Result<()> {
    let registry = registry();
    let query = test_query("A", DeviceOs::Ios, "D", "unknown");

    let result = registry
        .on_process_csr("--CSR--", &query, "/sandbox", CertificateExchangeMedium::FsAccess)
        .await?;
    assert_eq!(result.device_id, "D1");

    // The client reconnects securely under the resolved device id.
    let secure = SecureClientQuery {
        query: test_query("A", DeviceOs::Ios, "D", "D1"),
        csr: None,
        csr_path: None,
        medium: CertificateExchangeMedium::FsAccess,
    };
    registry.on_secure_connection_attempt(&secure);
    let client = registry.on_connection_created(secure, StubConnection::new()).await?;
    assert_eq!(client.id, "A#iOS#D#D1");
    Ok(())
}

#[tokio::test]
async fn csr_failure_emits_setup_error_and_rejects() {
    let registry = registry_with(StubCertificateProvider::failing());
    let mut rx = registry.subscribe();
    let query = test_query("A", DeviceOs::Ios, "D", "unknown");

    let result = registry
        .on_process_csr("--CSR--", &query, "/sandbox", CertificateExchangeMedium::FsAccess)
        .await;
    assert!(result.is_err());

    // The adapter reports the failure through on_client_setup_error.
    registry.on_client_setup_error(
        &query,
        &anyhow::anyhow!("stub provider failure"),
    );
    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        HubEvent::ClientSetupError { app, message, .. }
            if app == "A" && message.contains("stub provider failure")
    )));
}

#[tokio::test(start_paused = true)]
async fn unresponsive_timer_fires_once() -> anyhow::Result<()> {
    let registry = registry();
    let mut rx = registry.subscribe();
    let query = test_query("A", DeviceOs::Ios, "D", "unknown");

    registry
        .on_process_csr("--CSR--", &query, "/sandbox", CertificateExchangeMedium::FsAccess)
        .await?;
    tokio::time::advance(Duration::from_secs(31)).await;
    tokio::task::yield_now().await;

    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        HubEvent::ClientUnresponsive { device_id, .. } if device_id == "D1"
    )));

    // A second exchange for the same client only logs; the notification
    // already happened.
    registry
        .on_process_csr("--CSR--", &query, "/sandbox", CertificateExchangeMedium::FsAccess)
        .await?;
    tokio::time::advance(Duration::from_secs(31)).await;
    tokio::task::yield_now().await;
    let events = drain_events(&mut rx);
    assert!(
        !events.iter().any(|e| matches!(e, HubEvent::ClientUnresponsive { .. })),
        "repeat unresponsive reports must not re-notify"
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn secure_reconnect_cancels_unresponsive_timer() -> anyhow::Result<()> {
    let registry = registry();
    let mut rx = registry.subscribe();
    let query = test_query("A", DeviceOs::Ios, "D", "unknown");

    registry
        .on_process_csr("--CSR--", &query, "/sandbox", CertificateExchangeMedium::FsAccess)
        .await?;

    // Same (app, os, device, device_id) key reconnects in time.
    registry.on_secure_connection_attempt(&SecureClientQuery {
        query: query.clone(),
        csr: None,
        csr_path: None,
        medium: CertificateExchangeMedium::FsAccess,
    });

    tokio::time::advance(Duration::from_secs(60)).await;
    tokio::task::yield_now().await;
    let events = drain_events(&mut rx);
    assert!(
        !events.iter().any(|e| matches!(e, HubEvent::ClientUnresponsive { .. })),
        "a timely secure reconnect must cancel the timer"
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn disabled_platform_attempts_are_ignored() -> anyhow::Result<()> {
    let settings = HubSettings { enable_ios: false, ..HubSettings::default() };
    let registry = ControllerInner::new(settings, StubCertificateProvider::new("D1"));
    let mut rx = registry.subscribe();
    let query = test_query("A", DeviceOs::Ios, "D", "unknown");

    registry
        .on_process_csr("--CSR--", &query, "/sandbox", CertificateExchangeMedium::FsAccess)
        .await?;
    // The attempt is refused outright, so it does not cancel the timer.
    registry.on_secure_connection_attempt(&SecureClientQuery {
        query: query.clone(),
        csr: None,
        csr_path: None,
        medium: CertificateExchangeMedium::FsAccess,
    });

    tokio::time::advance(Duration::from_secs(31)).await;
    tokio::task::yield_now().await;
    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(e, HubEvent::ClientUnresponsive { .. })));
    Ok(())
}

// -- Connection tracker -------------------------------------------------------

#[tokio::test]
async fn tracker_flags_connection_loops() {
    let mut tracker = ConnectionTracker::new();
    let query = test_query("A", DeviceOs::Android, "D", "d1");
    assert!(!tracker.log_connection_attempt(&query));
    assert!(!tracker.log_connection_attempt(&query));
    assert!(!tracker.log_connection_attempt(&query));
    assert!(tracker.log_connection_attempt(&query));
}

#[tokio::test(start_paused = true)]
async fn tracker_window_slides() {
    let mut tracker = ConnectionTracker::new();
    let query = test_query("A", DeviceOs::Android, "D", "d1");
    for _ in 0..3 {
        assert!(!tracker.log_connection_attempt(&query));
    }
    tokio::time::advance(Duration::from_secs(21)).await;
    // The old attempts aged out of the window.
    assert!(!tracker.log_connection_attempt(&query));
}

#[tokio::test]
async fn tracker_keys_are_per_client() {
    let mut tracker = ConnectionTracker::new();
    let a = test_query("A", DeviceOs::Android, "D", "d1");
    let b = test_query("B", DeviceOs::Android, "D", "d1");
    for _ in 0..3 {
        tracker.log_connection_attempt(&a);
    }
    assert!(!tracker.log_connection_attempt(&b));
}

// -- Controller lifecycle -----------------------------------------------------

#[tokio::test]
async fn controller_starts_configured_endpoints() -> anyhow::Result<()> {
    let settings = HubSettings {
        ports: ServerPorts {
            insecure: Some(0),
            secure: None,
            alt_insecure: Some(0),
            alt_secure: None,
            browser: Some(0),
        },
        ..HubSettings::default()
    };
    let mut controller = ServerController::new(settings, StubCertificateProvider::new("D1"));
    let mut rx = controller.subscribe();

    let bound = controller.start().await?;
    let labels: Vec<_> = bound.iter().map(|(label, _)| *label).collect();
    assert_eq!(labels, ["socket-insecure", "ws-insecure", "browser"]);
    assert!(bound.iter().all(|(_, port)| *port != 0));

    let events = drain_events(&mut rx);
    assert_eq!(
        events.iter().filter(|e| matches!(e, HubEvent::Listening { .. })).count(),
        3
    );

    controller.stop().await;
    Ok(())
}
