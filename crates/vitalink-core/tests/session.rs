//! Session lifecycle tests against the scripted transport.

use std::time::Duration;

use vitalink_core::{
    Central, DiscoveredDevice, DisconnectReason, Error, FailureKind, MockPeripheral, MockStep,
    MockTransport, SessionConfig, SessionOptions, SessionState, TransportCall,
};
use vitalink_types::uuid::{
    BATTERY_LEVEL, BATTERY_SERVICE, GLUCOSE_MEASUREMENT, RECORD_ACCESS_CONTROL_POINT,
};
use vitalink_types::{DeviceModel, uuids};

const BP_PACKET: [u8; 7] = [0x00, 0x78, 0x00, 0x50, 0x00, 0x5D, 0x00];

fn setup(peripheral: MockPeripheral) -> (MockTransport, Central, DiscoveredDevice) {
    let transport = MockTransport::new();
    let descriptor = peripheral.descriptor();
    let id = transport.add(peripheral);
    let central = Central::new(transport.clone());
    (transport, central, DiscoveredDevice::new(id, descriptor))
}

#[tokio::test]
async fn test_second_session_for_same_device_conflicts() {
    let (_transport, central, device) =
        setup(MockPeripheral::new(DeviceModel::OmronEvolv.descriptor()));

    let mut first = central
        .open_session(device.clone(), SessionOptions::default())
        .await
        .unwrap();
    assert_eq!(first.state(), SessionState::Streaming);

    let second = central.claim_session(device.clone(), SessionOptions::default());
    assert!(matches!(second, Err(Error::SessionConflict { .. })));

    first.close().await.unwrap();
    assert_eq!(first.state(), SessionState::Closed);
    assert!(!central.has_session(&device.peripheral_id));
    assert!(
        central
            .claim_session(device, SessionOptions::default())
            .is_ok()
    );
}

#[tokio::test(start_paused = true)]
async fn test_stalled_transfer_request_times_out_and_tears_down() {
    let descriptor = DeviceModel::ContourNextOne.descriptor();
    let (transport, central, device) =
        setup(MockPeripheral::new(descriptor).stall(MockStep::WriteValue));
    let options = SessionOptions::new(
        SessionConfig::default().subscribe_timeout(Duration::from_secs(3)),
    );

    let mut session = central.claim_session(device.clone(), options).unwrap();
    let err = session.connect().await.unwrap_err();

    assert!(matches!(
        err,
        Error::Timeout {
            state: SessionState::Subscribing,
            duration,
        } if duration == Duration::from_secs(3)
    ));
    assert_eq!(session.state(), SessionState::Error(FailureKind::Timeout));
    assert!(session.subscriptions().is_empty());
    assert!(!transport.is_connected(&device.peripheral_id));
    assert!(!central.has_session(&device.peripheral_id));

    // Unsubscribe strictly precedes disconnect.
    let calls = transport.calls();
    let tail = &calls[calls.len() - 3..];
    assert!(matches!(
        &tail[0],
        TransportCall::WriteValue { characteristic, .. }
            if *characteristic == RECORD_ACCESS_CONTROL_POINT
    ));
    assert_eq!(
        tail[1],
        TransportCall::SetNotify {
            characteristic: GLUCOSE_MEASUREMENT,
            enabled: false
        }
    );
    assert_eq!(tail[2], TransportCall::Disconnect);
}

#[tokio::test]
async fn test_connect_walks_every_state_in_order() {
    let descriptor = DeviceModel::AccuChekGuide.descriptor();
    let (transport, central, device) = setup(MockPeripheral::new(descriptor));

    let session = central
        .open_session(device.clone(), SessionOptions::default())
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Streaming);
    assert_eq!(session.subscriptions(), &[GLUCOSE_MEASUREMENT]);

    let control = descriptor.profile().control.unwrap();
    assert_eq!(
        transport.calls(),
        vec![
            TransportCall::Connect(device.peripheral_id.clone()),
            TransportCall::DiscoverServices,
            TransportCall::DiscoverCharacteristics(uuids::GLUCOSE_SERVICE),
            TransportCall::SetNotify {
                characteristic: GLUCOSE_MEASUREMENT,
                enabled: true
            },
            TransportCall::WriteValue {
                characteristic: control.characteristic,
                value: control.command.to_vec()
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_subscribing_closes_cleanly() {
    let descriptor = DeviceModel::OmronM7.descriptor();
    let (transport, central, device) =
        setup(MockPeripheral::new(descriptor).stall(MockStep::Subscribe));

    let mut session = central
        .claim_session(device.clone(), SessionOptions::default())
        .unwrap();
    let token = session.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
    });

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!transport.is_connected(&device.peripheral_id));

    let calls = transport.calls();
    let measurement = descriptor.profile().measurement;
    let unsubscribe = calls
        .iter()
        .position(|c| {
            *c == TransportCall::SetNotify {
                characteristic: measurement,
                enabled: false,
            }
        })
        .expect("unsubscribe recorded");
    let disconnect = calls
        .iter()
        .position(|c| *c == TransportCall::Disconnect)
        .expect("disconnect recorded");
    assert!(unsubscribe < disconnect);
}

#[tokio::test]
async fn test_cancel_before_connect_touches_nothing() {
    let (transport, central, device) =
        setup(MockPeripheral::new(DeviceModel::BeurerBm54.descriptor()));

    let mut session = central
        .claim_session(device, SessionOptions::default())
        .unwrap();
    session.cancellation_token().cancel();

    assert!(matches!(session.connect().await, Err(Error::Cancelled)));
    assert_eq!(session.state(), SessionState::Closed);
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn test_missing_service_fails_discovery() {
    let (transport, central, device) = setup(
        MockPeripheral::new(DeviceModel::AndUa651.descriptor()).services(vec![BATTERY_SERVICE]),
    );

    let mut session = central
        .claim_session(device.clone(), SessionOptions::default())
        .unwrap();
    let err = session.connect().await.unwrap_err();

    assert!(matches!(err, Error::ServiceNotFound(uuid) if uuid == uuids::BLOOD_PRESSURE_SERVICE));
    assert_eq!(session.state(), SessionState::Error(FailureKind::Discovery));
    assert_eq!(transport.calls().last(), Some(&TransportCall::Disconnect));
    assert!(!transport.is_connected(&device.peripheral_id));
}

#[tokio::test]
async fn test_missing_control_point_fails_discovery() {
    let (_transport, central, device) = setup(
        MockPeripheral::new(DeviceModel::ContourNextOne.descriptor())
            .characteristics(vec![GLUCOSE_MEASUREMENT]),
    );

    let mut session = central
        .claim_session(device, SessionOptions::default())
        .unwrap();
    let err = session.connect().await.unwrap_err();
    assert!(matches!(
        err,
        Error::CharacteristicNotFound { uuid, service_count: 1 }
            if uuid == RECORD_ACCESS_CONTROL_POINT
    ));
}

#[tokio::test(start_paused = true)]
async fn test_idle_stream_times_out() {
    let (transport, central, device) =
        setup(MockPeripheral::new(DeviceModel::OmronEvolv.descriptor()));
    let options = SessionOptions::new(
        SessionConfig::default().idle_timeout(Some(Duration::from_secs(5))),
    );

    let mut session = central.open_session(device.clone(), options).await.unwrap();
    let err = session.next_packet().await.unwrap_err();

    assert!(matches!(
        err,
        Error::Timeout {
            state: SessionState::Streaming,
            ..
        }
    ));
    assert_eq!(session.state(), SessionState::Error(FailureKind::Timeout));
    assert!(!transport.is_connected(&device.peripheral_id));
}

#[tokio::test]
async fn test_unexpected_disconnect_is_an_error() {
    let (_transport, central, device) = setup(
        MockPeripheral::new(DeviceModel::OmronEvolv.descriptor())
            .notify(BP_PACKET.to_vec())
            .disconnect_after_notifications(),
    );

    let mut session = central
        .open_session(device, SessionOptions::default())
        .await
        .unwrap();
    let packet = session.next_packet().await.unwrap().unwrap();
    assert_eq!(packet.bytes.as_ref(), &BP_PACKET);

    let err = session.next_packet().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Disconnected {
            reason: DisconnectReason::RemoteClosed
        }
    ));
    assert_eq!(
        session.state(),
        SessionState::Error(FailureKind::Disconnected)
    );
    assert!(session.counters().received() == 1);
}

#[tokio::test]
async fn test_expected_disconnect_closes_session() {
    let (_transport, central, device) = setup(
        MockPeripheral::new(DeviceModel::OmronEvolv.descriptor())
            .notify(BP_PACKET.to_vec())
            .disconnect_after_notifications(),
    );

    let mut session = central
        .open_session(device.clone(), SessionOptions::default())
        .await
        .unwrap();
    let mut states = session.state_changes();
    session.expect_disconnect();

    assert!(session.next_packet().await.unwrap().is_some());
    assert!(session.next_packet().await.unwrap().is_none());
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(*states.borrow_and_update(), SessionState::Closed);
    assert!(!central.has_session(&device.peripheral_id));

    // A closed session keeps answering None.
    assert!(session.next_packet().await.unwrap().is_none());
}

#[tokio::test]
async fn test_read_value_requires_streaming() {
    let descriptor = DeviceModel::OmronEvolv.descriptor();
    let (_transport, central, device) = setup(
        MockPeripheral::new(descriptor)
            .characteristics(vec![descriptor.profile().measurement, BATTERY_LEVEL])
            .value(BATTERY_LEVEL, vec![87u8]),
    );

    let mut session = central
        .claim_session(device, SessionOptions::default())
        .unwrap();
    assert!(matches!(
        session.read_value(BATTERY_LEVEL).await,
        Err(Error::NotStreaming {
            state: SessionState::Idle
        })
    ));

    session.connect().await.unwrap();
    let value = session.read_value(BATTERY_LEVEL).await.unwrap();
    assert_eq!(value.as_ref(), &[87u8]);
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_claiming() {
    let (_transport, central, device) =
        setup(MockPeripheral::new(DeviceModel::OmronEvolv.descriptor()));
    let options = SessionOptions::new(SessionConfig::default().event_capacity(0));

    let result = central.claim_session(device.clone(), options);
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
    assert!(!central.has_session(&device.peripheral_id));
}

/// Yield until the spawned drop-time teardown has run.
async fn settle(transport: &MockTransport, central: &Central, device: &DiscoveredDevice) {
    let peripheral = &device.peripheral_id;
    for _ in 0..20 {
        if !transport.is_connected(peripheral) && !central.has_session(peripheral) {
            return;
        }
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_dropped_session_releases_device_after_teardown() {
    let (transport, central, device) =
        setup(MockPeripheral::new(DeviceModel::OmronEvolv.descriptor()));

    let session = central
        .open_session(device.clone(), SessionOptions::default())
        .await
        .unwrap();
    drop(session);
    // Teardown runs on a spawned task that has not been polled yet.
    assert!(central.has_session(&device.peripheral_id));

    settle(&transport, &central, &device).await;
    assert!(!transport.is_connected(&device.peripheral_id));
    assert!(!central.has_session(&device.peripheral_id));
    assert_eq!(transport.calls().last(), Some(&TransportCall::Disconnect));
}

#[tokio::test]
async fn test_reopen_after_drop_keeps_new_link() {
    let (transport, central, device) =
        setup(MockPeripheral::new(DeviceModel::OmronEvolv.descriptor()));

    let first = central
        .open_session(device.clone(), SessionOptions::default())
        .await
        .unwrap();
    drop(first);

    // The old link is still being torn down.
    let early = central.claim_session(device.clone(), SessionOptions::default());
    assert!(matches!(early, Err(Error::SessionConflict { .. })));

    settle(&transport, &central, &device).await;
    let second = central
        .open_session(device.clone(), SessionOptions::default())
        .await
        .unwrap();
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert_eq!(second.state(), SessionState::Streaming);
    assert!(transport.is_connected(&device.peripheral_id));
}

#[tokio::test]
async fn test_centrals_over_one_radio_share_ownership() {
    let (transport, central, device) =
        setup(MockPeripheral::new(DeviceModel::OmronEvolv.descriptor()));
    let other = Central::new(transport.clone());

    let _scan = central.scan(device.descriptor).unwrap();
    assert!(other.is_scanning());
    assert!(matches!(
        other.scan(device.descriptor),
        Err(Error::ScanAlreadyActive)
    ));

    let _session = central
        .claim_session(device.clone(), SessionOptions::default())
        .unwrap();
    assert!(other.has_session(&device.peripheral_id));
    assert!(matches!(
        other.claim_session(device.clone(), SessionOptions::default()),
        Err(Error::SessionConflict { .. })
    ));

    // A separate radio is not affected.
    let elsewhere = Central::new(MockTransport::new());
    assert!(!elsewhere.is_scanning());
    assert!(elsewhere.scan(device.descriptor).is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_cancels_pending_link() {
    let (transport, central, device) = setup(
        MockPeripheral::new(DeviceModel::OmronEvolv.descriptor()).stall(MockStep::Connect),
    );
    let options = SessionOptions::new(
        SessionConfig::default().connect_timeout(Duration::from_secs(2)),
    );

    let mut session = central.claim_session(device.clone(), options).unwrap();
    let err = session.connect().await.unwrap_err();

    assert!(matches!(
        err,
        Error::Timeout {
            state: SessionState::Connecting,
            ..
        }
    ));
    assert_eq!(session.state(), SessionState::Error(FailureKind::Timeout));
    assert!(!transport.is_connected(&device.peripheral_id));
    assert!(!central.has_session(&device.peripheral_id));
    assert_eq!(
        transport.calls(),
        vec![
            TransportCall::Connect(device.peripheral_id.clone()),
            TransportCall::CancelConnect(device.peripheral_id.clone()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_connecting_cancels_pending_link() {
    let (transport, central, device) = setup(
        MockPeripheral::new(DeviceModel::AccuChekGuide.descriptor()).stall(MockStep::Connect),
    );

    let mut session = central
        .claim_session(device.clone(), SessionOptions::default())
        .unwrap();
    let token = session.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
    });

    assert!(matches!(session.connect().await, Err(Error::Cancelled)));
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!transport.is_connected(&device.peripheral_id));
    assert_eq!(
        transport.calls().last(),
        Some(&TransportCall::CancelConnect(device.peripheral_id.clone()))
    );
}

#[tokio::test(start_paused = true)]
async fn test_dropping_a_connecting_session_cancels_pending_link() {
    let (transport, central, device) = setup(
        MockPeripheral::new(DeviceModel::OmronM7.descriptor()).stall(MockStep::Connect),
    );

    let mut session = central
        .claim_session(device.clone(), SessionOptions::default())
        .unwrap();
    let attempt = tokio::time::timeout(Duration::from_secs(1), session.connect()).await;
    assert!(attempt.is_err());
    assert!(transport.is_connected(&device.peripheral_id));
    drop(session);

    settle(&transport, &central, &device).await;
    assert!(!transport.is_connected(&device.peripheral_id));
    assert!(!central.has_session(&device.peripheral_id));
    assert_eq!(
        transport.calls().last(),
        Some(&TransportCall::CancelConnect(device.peripheral_id.clone()))
    );
}
