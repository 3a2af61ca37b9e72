mod common;

use common::{mock_opener, odrive_port, MOCK_PORT};
use odrive_control_lib::config::AppSettings;
use odrive_control_lib::device::{ConnectionState, DeviceError, DeviceManager};
use odrive_control_lib::serial::engine::EngineEvent;
use odrive_control_lib::serial::PortDescriptor;
use pretty_assertions::assert_eq;

fn receiver_port() -> PortDescriptor {
    PortDescriptor {
        port_name: "/dev/ttyUSB9".into(),
        vid: Some(0x046D),
        pid: Some(0xC52B),
        serial_number: None,
        manufacturer: Some("Logitech".into()),
        product: Some("Unifying Receiver".into()),
    }
}

#[tokio::test]
async fn test_discovery_keeps_only_candidates() {
    let (opener, _devices) = mock_opener(vec![receiver_port(), odrive_port()]);
    let (manager, _events) = DeviceManager::new(opener, &AppSettings::default());

    let found = manager.discover_devices().await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].port_name, MOCK_PORT);
    assert_eq!(found[0].connection_state, ConnectionState::Disconnected);

    // a second scan keeps the same identity
    let again = manager.discover_devices().await;
    assert_eq!(again[0].id, found[0].id);
    assert_eq!(manager.get_devices().await.len(), 1);

    let manual = manager.add_port("/dev/ttyS3").await;
    assert_eq!(manual.vid, None);
    assert_eq!(manager.get_devices().await.len(), 2);
}

#[tokio::test]
async fn test_connect_probes_firmware_and_tracks_link_state() {
    let (opener, mut devices) = mock_opener(vec![odrive_port()]);
    let (manager, mut events) = DeviceManager::new(opener, &AppSettings::default());
    let id = manager.discover_devices().await[0].id;

    let controller = async {
        let mut device = devices.recv().await.unwrap();
        assert_eq!(device.answer("0").await, "r fw_version_major #req_0");
        assert_eq!(device.answer("5").await, "r fw_version_minor #req_1");
        assert_eq!(device.answer("6").await, "r fw_version_revision #req_2");
        device
    };
    let (connected, device) = tokio::join!(manager.connect_device(&id), controller);

    let connected = connected.unwrap();
    assert_eq!(connected.firmware_version.as_deref(), Some("v0.5.6"));
    assert!(connected.is_connected());
    assert_eq!(manager.get_connected_device_id().await, Some(id));

    // the controller end vanishes: the manager mirrors the reconnect
    drop(device);
    loop {
        let event = events.recv().await.unwrap();
        manager.apply_event(&event).await;
        if matches!(event, EngineEvent::Disconnected { unexpected: true, .. }) {
            break;
        }
    }
    assert_eq!(manager.get_device(&id).await.unwrap().connection_state, ConnectionState::Reconnecting);

    manager.disconnect_device().await.unwrap();
    assert_eq!(manager.get_device(&id).await.unwrap().connection_state, ConnectionState::Disconnected);
    assert!(matches!(manager.disconnect_device().await, Err(DeviceError::NotConnected)));
}

#[tokio::test]
async fn test_firmware_probe_failure_does_not_fail_connect() {
    let (opener, mut devices) = mock_opener(vec![odrive_port()]);
    let (manager, _events) = DeviceManager::new(opener, &AppSettings::default());
    let id = manager.discover_devices().await[0].id;

    let controller = async {
        let mut device = devices.recv().await.unwrap();
        device.answer("error: unknown property").await;
        device
    };
    let (connected, _device) = tokio::join!(manager.connect_device(&id), controller);

    let connected = connected.unwrap();
    assert_eq!(connected.firmware_version, None);
    assert_eq!(connected.connection_state, ConnectionState::Connected);
}

#[tokio::test]
async fn test_failed_connect_marks_device_errored() {
    let (opener, _devices) = mock_opener(vec![odrive_port()]);
    opener.set_failing(true);
    let (manager, _events) = DeviceManager::new(opener, &AppSettings::default());
    let id = manager.discover_devices().await[0].id;

    assert!(matches!(manager.connect_device(&id).await, Err(DeviceError::SerialError(_))));
    assert!(matches!(
        manager.get_device(&id).await.unwrap().connection_state,
        ConnectionState::Error(_)
    ));
    assert_eq!(manager.get_connected_device_id().await, None);
    assert!(matches!(
        manager.connect_device(&uuid::Uuid::new_v4()).await,
        Err(DeviceError::NotFound)
    ));
}
