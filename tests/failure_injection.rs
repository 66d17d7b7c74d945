//! Failure injection tests for the device link.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time;

use device_link::config::{CircuitBreakerConfig, LinkConfig, RateLimitTier, UpstreamConfig};
use device_link::error::{ErrorKind, LinkError};
use device_link::protocol::{AdapterRegistry, Command};
use device_link::resilience::CircuitState;
use device_link::{CommandOptions, DeviceDescriptor, DeviceLink};

mod common;
use common::{MockAdapter, MockState, MOCK_PROTOCOL};

fn link_with(config: LinkConfig) -> (DeviceLink, Arc<MockState>) {
    let adapter = MockAdapter::new();
    let state = adapter.state.clone();
    let link = DeviceLink::new(config, AdapterRegistry::new().with(Arc::new(adapter))).unwrap();
    (link, state)
}

fn base_config() -> LinkConfig {
    let mut config = LinkConfig::default();
    config.connections.reconnect_base_delay_ms = 100;
    config.connections.reconnect_max_delay_ms = 100;
    config.devices = vec![DeviceDescriptor::new("dsp-1", "10.0.0.40:1710", MOCK_PROTOCOL)];
    config
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_on_malformed_responses_and_recovers() {
    let mut config = base_config();
    config.circuit_breaker = CircuitBreakerConfig {
        volume_threshold: 4,
        error_threshold_percentage: 50,
        reset_timeout_ms: 5_000,
        ..Default::default()
    };
    let (link, state) = link_with(config);
    let options = CommandOptions::default().no_queue();

    for _ in 0..4 {
        let err = link
            .execute_device_command("dsp-1", Command::new("BAD"), options.clone())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    let rejected = link
        .execute_device_command("dsp-1", Command::new("PING"), options.clone())
        .await
        .unwrap_err();
    assert_eq!(rejected.kind(), ErrorKind::CircuitOpen);
    assert!(rejected.retry_after().unwrap() <= Duration::from_secs(5));
    assert_eq!(state.sent_payloads().len(), 4, "open breaker must not reach the device");

    let status = &link.get_circuit_breaker_status()["device:dsp-1"];
    assert_eq!(status.state, CircuitState::Open);
    assert_eq!(status.stats.rejects, 1);
    assert!(status.opened_at.is_some());

    time::sleep(Duration::from_secs(5)).await;
    let recovered = link
        .execute_device_command("dsp-1", Command::new("PING"), options)
        .await
        .unwrap();
    assert_eq!(recovered.payload, "OK PING");
    assert_eq!(link.breakers().get("device:dsp-1").unwrap().state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_commands_do_not_trip_breaker() {
    let mut config = base_config();
    config.circuit_breaker.volume_threshold = 2;
    let (link, _state) = link_with(config);

    for _ in 0..10 {
        let err = link
            .execute_device_command("dsp-1", Command::new("NO"), CommandOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    assert_eq!(link.breakers().get("device:dsp-1").unwrap().state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_per_caller_and_tier() {
    let mut config = base_config();
    config.rate_limit.tiers.insert("sensitive".into(), RateLimitTier::new(2, 60_000));
    let (link, state) = link_with(config);

    let kiosk = CommandOptions::default().for_caller("kiosk-1", "sensitive");
    for _ in 0..2 {
        link.execute_device_command("dsp-1", Command::new("MUTE"), kiosk.clone())
            .await
            .unwrap();
    }

    let denied = link
        .execute_device_command("dsp-1", Command::new("MUTE"), kiosk.clone())
        .await
        .unwrap_err();
    assert!(matches!(denied, LinkError::RateLimitExceeded { ref tier, .. } if tier == "sensitive"));
    assert!(denied.retry_after().unwrap() <= Duration::from_secs(60));
    assert_eq!(state.sent_payloads().len(), 2);

    // Other identities have their own budget.
    let other = CommandOptions::default().for_caller("kiosk-2", "sensitive");
    assert!(link.execute_device_command("dsp-1", Command::new("MUTE"), other).await.is_ok());

    let decision = link.check_rate_limit("kiosk-1", "sensitive");
    assert!(!decision.allowed);
    assert_eq!(decision.remaining, 0);

    time::sleep(Duration::from_secs(61)).await;
    assert!(link.execute_device_command("dsp-1", Command::new("MUTE"), kiosk).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_health_check_reports_partial_failure() {
    let mut config = base_config();
    config.devices = vec![
        DeviceDescriptor::new("matrix-1", "10.0.0.20:5000", MOCK_PROTOCOL),
        DeviceDescriptor::new("ir-1", "10.0.0.30:4998", "mock-down"),
        DeviceDescriptor::new("tv-1", "10.0.1.5:5555", "adb-shell"),
    ];

    let up = MockAdapter::new();
    let down = MockAdapter::with_kind("mock-down");
    down.state.set_down(true);
    let adapters = AdapterRegistry::new().with(Arc::new(up)).with(Arc::new(down));
    let link = DeviceLink::new(config, adapters).unwrap();

    let snapshot = link.run_health_check().await;
    assert_eq!(snapshot.total, 3);
    assert_eq!(snapshot.healthy, 1);
    assert_eq!(snapshot.unhealthy, 2);
    assert!(snapshot.records["matrix-1"].healthy);
    assert!(snapshot.records["ir-1"].error.as_deref().unwrap().contains("refused"));
    assert!(snapshot.records["tv-1"].error.as_deref().unwrap().contains("no protocol adapter"));

    assert_eq!(link.health_snapshot().pass, 1);
    assert_eq!(link.health_stats().total_errors, 2);
}

#[tokio::test(start_paused = true)]
async fn test_health_check_and_command_share_one_transport() {
    let mut config = base_config();
    config.devices = vec![DeviceDescriptor::new("matrix-1", "10.0.0.20:5000", MOCK_PROTOCOL)];
    let (link, state) = link_with(config);
    *state.connect_delay.lock().unwrap() = Duration::from_millis(50);
    *state.check_delay.lock().unwrap() = Duration::from_millis(100);

    let command = async {
        time::sleep(Duration::from_millis(10)).await;
        link.execute_device_command("matrix-1", Command::new("ROUTE 1 4"), CommandOptions::default())
            .await
    };
    let (snapshot, routed) = tokio::join!(link.run_health_check(), command);

    assert!(snapshot.records["matrix-1"].healthy);
    assert!(routed.is_ok());
    assert_eq!(state.max_live(), 1, "health check and command overlapped on the device");
    assert_eq!(state.connect_count(), 2);
    assert_eq!(state.sent_payloads(), vec!["ROUTE 1 4"]);
}

#[tokio::test(start_paused = true)]
async fn test_device_reload_drops_stale_connections() {
    let (link, state) = link_with(base_config());
    link.execute_device_command("dsp-1", Command::new("PING"), CommandOptions::default())
        .await
        .unwrap();
    assert_eq!(link.get_connection_status(None).stats.connected, 1);

    let change = link
        .reload_devices(vec![
            DeviceDescriptor::new("dsp-1", "10.0.0.41:1710", MOCK_PROTOCOL),
            DeviceDescriptor::new("dsp-2", "10.0.0.42:1710", MOCK_PROTOCOL),
        ])
        .await;
    assert_eq!(change.changed, vec!["dsp-1".to_string()]);
    assert_eq!(change.added, vec!["dsp-2".to_string()]);
    assert_eq!(link.get_connection_status(None).stats.total, 0);
    assert!(link.breakers().get("device:dsp-2").is_some());

    link.execute_device_command("dsp-1", Command::new("PING"), CommandOptions::default())
        .await
        .unwrap();
    assert_eq!(state.connect_count(), 2);

    link.reload_devices(vec![]).await;
    let gone = link
        .execute_device_command("dsp-1", Command::new("PING"), CommandOptions::default())
        .await
        .unwrap_err();
    assert_eq!(gone.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_upstream_serves_stale_body_when_failing() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let addr = common::start_programmable_backend(move || {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                (200, r#"{"channels":[101,102]}"#.to_string())
            } else {
                (503, r#"{"error":"maintenance"}"#.to_string())
            }
        }
    })
    .await;

    let mut config = base_config();
    config.upstreams = vec![UpstreamConfig {
        name: "guide".into(),
        base_url: format!("http://{}/", addr),
        timeout_ms: 2_000,
    }];
    config.circuit_breakers = BTreeMap::from([(
        "upstream:guide".to_string(),
        CircuitBreakerConfig {
            volume_threshold: 2,
            error_threshold_percentage: 50,
            reset_timeout_ms: 60_000,
            ..Default::default()
        },
    )]);
    let (link, _state) = link_with(config);

    let fresh = link.fetch_upstream("guide", "v1/channels").await.unwrap();
    assert!(!fresh.stale);
    assert_eq!(fresh.body["channels"][1], 102);

    let stale = link.fetch_upstream("guide", "v1/channels").await.unwrap();
    assert!(stale.stale);
    assert_eq!(stale.body, fresh.body);
    assert_eq!(stale.fetched_at, fresh.fetched_at);

    // Nothing cached for this path: the failure surfaces.
    let uncached = link.fetch_upstream("guide", "v1/lineup").await.unwrap_err();
    assert!(matches!(uncached, LinkError::Upstream { .. } | LinkError::CircuitOpen { .. }));

    // With the breaker open the backend is no longer called, the cache still answers.
    let before = calls.load(Ordering::SeqCst);
    let cached = link.fetch_upstream("guide", "v1/channels").await.unwrap();
    assert!(cached.stale);
    assert_eq!(calls.load(Ordering::SeqCst), before);
    assert_eq!(link.upstream("guide").unwrap().breaker().state(), CircuitState::Open);
}
