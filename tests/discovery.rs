use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

use mdns_sd::{ServiceEvent, ServiceInfo};

use localcomm::config::{LocalConfig, StaticServiceConfig};
use localcomm::network::{
    discover_from_config, Discover, DiscoveryEvent, DiscoveryService, ManualDiscover,
    MdnsBrowser,
};
use localcomm::LocalCommError;

fn service(name: &str, port: u16, iface: &str) -> DiscoveryService {
    DiscoveryService::new(name, IpAddr::V4(Ipv4Addr::LOCALHOST), port, iface)
}

#[test]
fn services_compare_without_interface() {
    let a = service("obj", 4000, "lo");
    let b = service("obj", 4000, "eth0");
    assert_eq!(a, b);
    assert_ne!(a, service("obj", 4001, "lo"));
    assert_ne!(a, service("other", 4000, "lo"));
    assert!(a.is_loopback());
    assert!(!DiscoveryService::new("x", "192.0.2.7".parse().unwrap(), 1, "eth0").is_loopback());
}

#[tokio::test]
async fn manual_backend_dedups_and_replays() {
    let d = ManualDiscover::new();
    assert!(d.publish(service("a", 1, "lo")));
    assert!(!d.publish(service("a", 1, "eth0")), "same service twice");

    let mut rx = d.start().await.unwrap();
    assert!(d.is_running());
    assert_eq!(
        rx.recv().await,
        Some(DiscoveryEvent::Discovered(service("a", 1, "lo")))
    );

    assert!(d.publish(service("b", 2, "lo")));
    assert_eq!(
        rx.recv().await,
        Some(DiscoveryEvent::Discovered(service("b", 2, "lo")))
    );
    assert!(d.withdraw(&service("a", 1, "lo")));
    assert!(!d.withdraw(&service("a", 1, "lo")));
    assert_eq!(
        rx.recv().await,
        Some(DiscoveryEvent::Lost(service("a", 1, "lo")))
    );

    d.stop().await.unwrap();
    assert!(!d.is_running());
    assert_eq!(rx.recv().await, None);
    assert_eq!(d.services(), vec![service("b", 2, "lo")]);
}

#[tokio::test]
async fn static_backend_reads_config() {
    let cfg = LocalConfig {
        static_services: Some(vec![StaticServiceConfig {
            name: "obj".into(),
            address: "127.0.0.1".into(),
            port: 4500,
            interface: None,
        }]),
        ..Default::default()
    };
    let d = discover_from_config(&cfg).unwrap();
    let mut rx = d.start().await.unwrap();
    match rx.recv().await {
        Some(DiscoveryEvent::Discovered(s)) => {
            assert_eq!(s.name, "obj");
            assert_eq!(s.port, 4500);
            assert_eq!(s.interface, "static");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn backend_selection_errors() {
    let bad_addr = LocalConfig {
        static_services: Some(vec![StaticServiceConfig {
            name: "obj".into(),
            address: "not-an-ip".into(),
            port: 1,
            interface: None,
        }]),
        ..Default::default()
    };
    assert!(matches!(
        discover_from_config(&bad_addr),
        Err(LocalCommError::Config(_))
    ));

    let unknown = LocalConfig {
        discovery: Some("carrier-pigeon".into()),
        ..Default::default()
    };
    assert!(matches!(
        discover_from_config(&unknown),
        Err(LocalCommError::Discovery(_))
    ));
}

#[tokio::test]
async fn mdns_backend_is_selected_but_idle_until_started() {
    let cfg = LocalConfig {
        discovery: Some("MDNS".into()),
        mdns_service_type: Some("_lamp._tcp.local.".into()),
        ..Default::default()
    };
    let backend = discover_from_config(&cfg).unwrap();
    assert!(!backend.is_running());
    // stopping a backend that never browsed is a no-op
    backend.stop().await.unwrap();
    assert!(!backend.is_running());
}

const LAMP_TYPE: &str = "_lamp._tcp.local.";

fn lamp(ips: &str, port: u16) -> ServiceInfo {
    ServiceInfo::new(
        LAMP_TYPE,
        "kitchen",
        "kitchen.local.",
        ips,
        port,
        None::<HashMap<String, String>>,
    )
    .unwrap()
}

#[test]
fn mdns_resolution_maps_to_found_and_lost() {
    let mut browser = MdnsBrowser::new(LAMP_TYPE);

    let found = browser.handle(ServiceEvent::ServiceResolved(lamp("127.0.0.1", 4100)));
    assert_eq!(found.len(), 1);
    let DiscoveryEvent::Discovered(svc) = &found[0] else {
        panic!("expected a discovered service, got {:?}", found[0]);
    };
    assert_eq!(svc.name, "kitchen");
    assert_eq!(svc.port, 4100);
    assert_eq!(svc.interface, "mdns");
    assert!(svc.is_loopback());

    // re-resolution of the same record is not a new service
    assert!(browser
        .handle(ServiceEvent::ServiceResolved(lamp("127.0.0.1", 4100)))
        .is_empty());

    // a second address shows up as its own service
    let more = browser.handle(ServiceEvent::ServiceResolved(lamp("127.0.0.1,10.0.0.7", 4100)));
    assert_eq!(more.len(), 1);

    assert!(browser
        .handle(ServiceEvent::SearchStarted(LAMP_TYPE.into()))
        .is_empty());

    let lost = browser.handle(ServiceEvent::ServiceRemoved(
        LAMP_TYPE.into(),
        format!("kitchen.{}", LAMP_TYPE),
    ));
    assert_eq!(lost.len(), 2);
    assert!(lost.iter().all(|e| matches!(e, DiscoveryEvent::Lost(s) if s.name == "kitchen")));

    // unknown instances vanish silently
    assert!(browser
        .handle(ServiceEvent::ServiceRemoved(LAMP_TYPE.into(), "ghost._lamp._tcp.local.".into()))
        .is_empty());
}
