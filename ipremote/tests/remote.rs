//! Remote wiring without touching the network

use std::sync::Arc;

use ipremote::samples::Receiver;
use ipremote::{DeviceDescription, DeviceGroup, Remote, RemoteConfig, RemoteError};
use ipremote_reactor::testing::ManualScheduler;

fn remote() -> Remote {
    Remote::with_scheduler(RemoteConfig::new(), Arc::new(ManualScheduler::new())).unwrap()
}

fn receiver_description() -> DeviceDescription {
    let mut description = DeviceDescription::default();
    description.device_type = "urn:schemas-upnp-org:device:MediaRenderer:1".to_string();
    description.friendly_name = "VSX-1123".to_string();
    description.model_name = "VSX-1123/CUXESM".to_string();
    description.udn = "uuid:5F9EC1B3-ED59-79BB-4530-0011A5000001".to_string();
    description.control_port = Some(8102);
    description
}

#[test]
fn test_register_creates_closed_device() {
    let remote = remote();
    let device = remote.register(Arc::new(Receiver::new().unwrap())).unwrap();

    assert_eq!(device.name(), Receiver::NAME);
    assert!(!device.is_open());
    assert!(!device.is_connected());
    assert_eq!(remote.device_names(), vec![Receiver::NAME.to_string()]);
    assert!(remote.device(Receiver::NAME).is_some());
}

#[test]
fn test_duplicate_driver_rejected() {
    let remote = remote();
    remote.register(Arc::new(Receiver::new().unwrap())).unwrap();

    let result = remote.register(Arc::new(Receiver::new().unwrap()));
    assert!(matches!(result, Err(RemoteError::DuplicateDriver(_))));
    assert_eq!(remote.devices().len(), 1);
}

#[test]
fn test_identify_by_description() {
    let remote = remote();
    remote.register(Arc::new(Receiver::new().unwrap())).unwrap();
    let source = "192.168.1.20:1900".parse().unwrap();

    assert_eq!(
        remote.identify(&receiver_description(), source).as_deref(),
        Some(Receiver::NAME)
    );

    let mut player = receiver_description();
    player.model_name = "BDP-150".to_string();
    assert_eq!(remote.identify(&player, source), None);
}

#[test]
fn test_unregister() {
    let remote = remote();
    remote.register(Arc::new(Receiver::new().unwrap())).unwrap();

    remote.unregister(Receiver::NAME).unwrap();
    assert!(remote.device(Receiver::NAME).is_none());
    assert!(matches!(
        remote.unregister(Receiver::NAME),
        Err(RemoteError::DeviceNotFound(_))
    ));

    // The name is free again.
    remote.register(Arc::new(Receiver::new().unwrap())).unwrap();
}

#[test]
fn test_close_without_open_is_harmless() {
    let remote = remote();
    remote.register(Arc::new(Receiver::new().unwrap())).unwrap();

    assert!(!remote.is_open());
    remote.close();
    remote.close();
    assert!(matches!(remote.search(), Err(RemoteError::Discovery(_))));
}

#[test]
fn test_close_deactivates_group() {
    let remote = remote();
    let receiver = Arc::new(Receiver::new().unwrap());
    remote.register(receiver.clone()).unwrap();

    let zone = receiver.zone1();
    let movie = DeviceGroup::new("living room", "movie")
        .with_sound(zone.sound().unwrap().clone())
        .with_selection(zone.input().clone(), zone.power().clone(), "25")
        .unwrap();
    remote.groups().register(movie).unwrap();

    assert!(remote.groups().set_active_group("living room", "movie"));
    assert_eq!(remote.groups().activities_for_location("living room"), vec!["movie"]);

    remote.close();
    assert!(remote.groups().active_group().is_none());
    assert_eq!(remote.groups().groups().len(), 1);
}
