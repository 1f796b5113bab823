//! Service behaviour against a scripted transport

#![allow(clippy::disallowed_methods)] // Integration test - unwrap is acceptable

mod common;

use std::io;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use common::*;
use modmaster::runtime::ReconnectPolicy;
use modmaster::{
    AddressBase, ConnectionStatus, DecoderConfig, DecoderType, ErrorKind, Event, ModmasterError,
    NumericValue, ReadKind, ReadRequest, Service, ServiceConfig, ServiceOptions, TransportError,
};

fn holding(address: u16, quantity: u16) -> ReadRequest {
    ReadRequest::new(ReadKind::HoldingRegisters, address, quantity)
}

#[tokio::test]
async fn test_connect_twice_runs_one_loop() {
    let device = MockDevice::unreachable();
    let service = service(&device);

    service.connect().unwrap();
    service.connect().unwrap();

    assert!(service.is_connecting());
    assert!(wait_for(|| device.opens() >= 2).await);
    assert_eq!(count_logs(&service, "connect requested: starting loop"), 1);
    assert_eq!(count_logs(&service, "connect requested: already connecting"), 1);

    service.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_repeated_connect_keeps_backoff() {
    let device = MockDevice::unreachable();
    let service = Service::with_factory(
        ServiceConfig::default(),
        std::sync::Arc::new(MockFactory {
            device: std::sync::Arc::clone(&device),
        }),
        ServiceOptions {
            reconnect: ReconnectPolicy::from_millis(50, 1_000, 2.0),
            ..ServiceOptions::default()
        },
    );

    service.connect().unwrap();
    // Third failure schedules a 200ms wait
    assert!(wait_for(|| device.opens() == 3).await);
    service.connect().unwrap();
    assert!(wait_for(|| device.opens() == 4).await);

    let times = device.open_times.lock().clone();
    let gap = times[3] - times[2];
    assert!(gap >= Duration::from_millis(150), "backoff was reset: {:?}", gap);
    assert!(service
        .logs()
        .iter()
        .any(|e| e.message.starts_with("connect attempt 4:")));
    assert_eq!(count_logs(&service, "connect requested: starting loop"), 1);

    service.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_connect_publishes_connecting_status_before_first_attempt() {
    let device = MockDevice::new();
    let service = service(&device);
    let mut events = service.take_events().unwrap();

    service.connect().unwrap();

    // The loop has not been polled yet on this single-threaded runtime
    let mut before = Vec::new();
    while let Ok(event) = events.try_recv() {
        before.push(event);
    }
    assert_eq!(device.opens(), 0);
    let status = before.iter().find_map(|e| match e {
        Event::Status(status) => Some(status.clone()),
        _ => None,
    });
    assert_eq!(
        status,
        Some(ConnectionStatus {
            connected: false,
            connecting: true,
            last_error: None,
        })
    );
    assert!(!before.iter().any(|e| matches!(
        e,
        Event::Log(entry) if entry.message.starts_with("connect attempt")
    )));

    assert!(wait_for(|| service.is_connected()).await);
    let mut after = Vec::new();
    while let Ok(event) = events.try_recv() {
        after.push(event);
    }
    assert!(after.iter().any(|e| matches!(
        e,
        Event::Log(entry) if entry.message.starts_with("connect attempt 1:")
    )));
}

#[tokio::test]
async fn test_connect_when_connected_is_noop() {
    let device = MockDevice::new();
    let service = service(&device);
    connected(&service).await;

    service.connect().unwrap();
    assert_eq!(count_logs(&service, "connect requested: already connected"), 1);
    assert_eq!(device.opens(), 1);
    assert!(service.last_connect_error().is_none());
}

#[tokio::test]
async fn test_disconnect_when_never_connected() {
    let device = MockDevice::new();
    let service = service(&device);

    service.disconnect().await.unwrap();

    assert_eq!(service.status_snapshot(), ConnectionStatus::default());
    assert_eq!(device.closes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_disconnect_closes_client() {
    let device = MockDevice::new();
    let service = service(&device);
    connected(&service).await;

    service.disconnect().await.unwrap();

    assert!(!service.is_connected());
    assert_eq!(device.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_read_while_disconnected() {
    let device = MockDevice::new();
    let service = service(&device);

    let failure = service.read(holding(0, 1)).await.unwrap_err();

    assert!(matches!(failure.error, ModmasterError::NotConnected));
    assert_eq!(failure.kind(), ErrorKind::Modbus);
    assert_eq!(failure.result.error_kind, Some(ErrorKind::Modbus));
    assert_eq!(
        failure.result.error_message.as_deref(),
        Some("modbus client not connected")
    );
    assert_eq!(service.stats().error_count, 1);
    assert_eq!(service.stats().read_count, 0);
    assert_eq!(device.reads(), 0);
    assert_eq!(device.opens(), 0);
    assert!(!service.is_connecting());
}

#[tokio::test]
async fn test_zero_quantity_is_rejected_before_transport() {
    let device = MockDevice::new();
    let service = service(&device);
    connected(&service).await;

    let failure = service.read(holding(0, 0)).await.unwrap_err();

    assert!(matches!(failure.error, ModmasterError::InvalidInput(_)));
    assert_eq!(failure.kind(), ErrorKind::Modbus);
    assert_eq!(device.reads(), 0);
}

#[tokio::test]
async fn test_address_base_translation() {
    let device = MockDevice::with_registers(vec![7, 8]);
    let config = ServiceConfig {
        address_base: AddressBase::One,
        ..ServiceConfig::default()
    };
    let service = service_with(&device, config);
    connected(&service).await;

    let result = service.read(holding(10, 2)).await.unwrap();
    service.read(holding(0, 1)).await.unwrap();

    assert_eq!(*device.addresses.lock(), vec![9, 0]);
    // The result echoes the address the caller asked for
    assert_eq!(result.address, 10);
    assert_eq!(result.reg_values, vec![7, 8]);
}

#[tokio::test]
async fn test_unit_id_override() {
    let device = MockDevice::new();
    let config = ServiceConfig {
        unit_id: 3,
        ..ServiceConfig::default()
    };
    let service = service_with(&device, config);
    connected(&service).await;

    service.read(holding(0, 1)).await.unwrap();
    service.read(holding(0, 1).with_unit(9)).await.unwrap();

    assert_eq!(*device.unit_ids.lock(), vec![3, 9]);
}

#[tokio::test]
async fn test_coil_read_returns_bools() {
    let device = MockDevice::new();
    *device.coils.lock() = vec![true, false, true];
    let service = service(&device);
    connected(&service).await;

    let result = service
        .read(ReadRequest::new(ReadKind::Coils, 0, 3))
        .await
        .unwrap();

    assert_eq!(result.bool_values, vec![true, false, true]);
    assert!(result.reg_values.is_empty());
    assert!(result.decoded.is_empty());
}

#[tokio::test]
async fn test_decoders_applied_to_registers() {
    let device = MockDevice::with_registers(vec![0x1234, 0x5678]);
    let mut config = ServiceConfig::default();
    config.set_decoder(DecoderConfig::new(DecoderType::Uint16).enabled());
    config.set_decoder(DecoderConfig::new(DecoderType::Uint32).enabled());
    let service = service_with(&device, config);
    connected(&service).await;

    let result = service.read(holding(0, 2)).await.unwrap();
    let values: Vec<NumericValue> = result.decoded.iter().map(|d| d.value).collect();
    assert_eq!(
        values,
        vec![NumericValue::U16(0x1234), NumericValue::U32(0x1234_5678)]
    );

    // One register is not enough for the 32-bit decoder
    let result = service.read(holding(0, 1)).await.unwrap();
    assert_eq!(result.decoded.len(), 1);
}

#[tokio::test]
async fn test_stats_count_successes_and_errors() {
    let device = MockDevice::new();
    let service = service(&device);
    connected(&service).await;

    service.read(holding(0, 1)).await.unwrap();
    service.read(holding(0, 1)).await.unwrap();
    device.fail_next_read(TransportError::Exception("IllegalDataAddress".into()));
    let failure = service.read(holding(0, 1)).await.unwrap_err();

    assert_eq!(failure.kind(), ErrorKind::Modbus);
    let stats = service.stats();
    assert_eq!(stats.read_count, 2);
    assert_eq!(stats.error_count, 1);
}

#[tokio::test]
async fn test_modbus_error_does_not_reconnect() {
    let device = MockDevice::new();
    let service = service(&device);
    connected(&service).await;

    device.fail_next_read(TransportError::Exception("IllegalFunction".into()));
    service.read(holding(0, 1)).await.unwrap_err();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(service.is_connected());
    assert_eq!(device.opens(), 1);
    assert_eq!(count_logs(&service, "connection lost; reconnecting"), 0);
}

#[tokio::test]
async fn test_connection_error_triggers_reconnect() {
    let device = MockDevice::new();
    let service = service(&device);
    connected(&service).await;

    device.fail_next_read(TransportError::Io(io::Error::from(
        io::ErrorKind::ConnectionReset,
    )));
    let failure = service.read(holding(0, 1)).await.unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::Connection);
    assert_eq!(failure.result.error_kind, Some(ErrorKind::Connection));

    assert!(wait_for(|| device.opens() == 2 && service.is_connected()).await);
    assert_eq!(device.closes.load(Ordering::SeqCst), 1);
    assert_eq!(count_logs(&service, "connection lost; reconnecting"), 1);

    // The new client serves reads again
    service.read(holding(0, 1)).await.unwrap();
}

#[tokio::test]
async fn test_failed_attempts_record_last_error() {
    let device = MockDevice::unreachable();
    let service = service(&device);

    service.connect().unwrap();
    assert!(wait_for(|| service.last_connect_error().is_some()).await);

    let status = service.status_snapshot();
    assert!(!status.connected);
    assert!(status.connecting);
    assert!(service
        .logs()
        .iter()
        .any(|e| e.message.starts_with("connect failed: ")));
    assert!(service
        .logs()
        .iter()
        .any(|e| e.message == "connect attempt 1: tcp://127.0.0.1:502 timeout=1000ms"));

    service.disconnect().await.unwrap();
    assert!(service.last_connect_error().is_none());
}

#[tokio::test]
async fn test_retry_succeeds_after_failures() {
    let device = MockDevice::new();
    device.failing_opens.store(2, Ordering::SeqCst);
    let service = service(&device);

    service.connect().unwrap();
    assert!(wait_for(|| service.is_connected()).await);

    assert_eq!(device.opens(), 3);
    assert!(!service.is_connecting());
    assert!(service.last_connect_error().is_none());
}

#[tokio::test]
async fn test_disconnect_interrupts_backoff() {
    let device = MockDevice::unreachable();
    let service = Service::with_factory(
        ServiceConfig::default(),
        std::sync::Arc::new(MockFactory {
            device: std::sync::Arc::clone(&device),
        }),
        ServiceOptions {
            reconnect: ReconnectPolicy::from_millis(60_000, 60_000, 2.0),
            ..ServiceOptions::default()
        },
    );

    service.connect().unwrap();
    assert!(wait_for(|| service.last_connect_error().is_some()).await);

    let started = Instant::now();
    service.disconnect().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));

    assert!(wait_for(|| count_logs(&service, "connect stopped") == 1).await);
    assert_eq!(device.opens(), 1);
    assert_eq!(service.status_snapshot(), ConnectionStatus::default());
}

#[tokio::test]
async fn test_disconnect_during_open_discards_client() {
    let device = MockDevice::new();
    *device.open_delay.lock() = Duration::from_millis(100);
    let service = service(&device);

    service.connect().unwrap();
    assert!(wait_for(|| device.opens() == 1).await);
    service.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(!service.is_connected());
    assert!(!service.is_connecting());
}

#[tokio::test]
async fn test_disconnect_racing_implicit_reconnect() {
    let device = MockDevice::new();
    let service = service(&device);
    connected(&service).await;

    device.fail_next_read(TransportError::Closed);
    service.read(holding(0, 1)).await.unwrap_err();
    service.disconnect().await.unwrap();

    // Whatever order the detached reconnect ran in, the explicit
    // disconnect wins
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!service.is_connected());
    assert!(!service.is_connecting());
}

#[tokio::test]
async fn test_reconnect_after_config_update_uses_new_config() {
    let device = MockDevice::unreachable();
    let service = service(&device);

    let mut config = service.config();
    config.tcp.host = "10.1.2.3".to_string();
    service.update_config(config).unwrap();

    service.connect().unwrap();
    assert!(wait_for(|| device.opens() >= 1).await);
    assert!(service
        .logs()
        .iter()
        .any(|e| e.message.starts_with("connect attempt 1: tcp://10.1.2.3:502")));
    service.disconnect().await.unwrap();

    let invalid = ServiceConfig {
        timeout_ms: 0,
        ..ServiceConfig::default()
    };
    assert!(service.update_config(invalid).is_err());
    assert_eq!(service.config().tcp.host, "10.1.2.3");

    let mut missing_decoders = service.config();
    missing_decoders.decoders.clear();
    assert!(matches!(
        service.update_config(missing_decoders),
        Err(ModmasterError::Config(_))
    ));
    assert_eq!(service.config().decoders.len(), 5);
}

#[tokio::test]
async fn test_events_follow_read_lifecycle() {
    let device = MockDevice::with_registers(vec![42]);
    let service = service(&device);
    let mut events = service.take_events().unwrap();
    assert!(service.take_events().is_none());

    connected(&service).await;
    service.read(holding(0, 1)).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    let names: Vec<&str> = seen.iter().map(|e| e.type_name()).collect();

    assert_eq!(names.first(), Some(&"log"));
    assert!(names.contains(&"status"));
    let stats_at = names.iter().position(|n| *n == "stats").unwrap();
    let data_at = names.iter().position(|n| *n == "data").unwrap();
    assert!(stats_at < data_at);

    match seen.last() {
        Some(Event::Data(result)) => assert_eq!(result.reg_values, vec![42]),
        other => panic!("expected data event last, got {:?}", other),
    }
}

#[tokio::test]
async fn test_failed_read_emits_error_event() {
    let device = MockDevice::new();
    let service = service(&device);
    let mut events = service.take_events().unwrap();

    service.read(holding(0, 1)).await.unwrap_err();

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        if let Event::Error(result) = event {
            assert_eq!(result.error_kind, Some(ErrorKind::Modbus));
            saw_error = true;
        }
    }
    assert!(saw_error);
}

#[tokio::test]
async fn test_full_event_channel_drops_instead_of_blocking() {
    let device = MockDevice::new();
    let service = Service::with_factory(
        ServiceConfig::default(),
        std::sync::Arc::new(MockFactory {
            device: std::sync::Arc::clone(&device),
        }),
        ServiceOptions {
            event_capacity: 4,
            log_capacity: 8,
            ..fast_options()
        },
    );
    connected(&service).await;

    for _ in 0..20 {
        with_deadline(service.read(holding(0, 1))).await.unwrap();
    }

    assert!(service.dropped_events() > 0);
    assert_eq!(service.logs().len(), 8);
    assert_eq!(service.stats().read_count, 20);
}

#[test]
fn test_connect_requires_runtime() {
    let device = MockDevice::new();
    let service = service(&device);
    assert!(matches!(service.connect(), Err(ModmasterError::Runtime(_))));
    assert!(!service.is_connecting());
}
