use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv6Addr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dhcpsvc::codec::link_local;
use dhcpsvc::packet6::{
    ALL_DHCP_SERVERS, DHCP6_CLIENT_PORT, DHCP6_SERVER_PORT, IaAddress, IaNa, StatusCode, duid_ll,
};
use dhcpsvc::{
    AddrFamily, ChannelPeer, ChannelProvider, Dhcp6Frame, Dhcp6Message, Dhcp6MessageType,
    Dhcp6Option, HwAddr, InterfaceConfig, Ipv6Config, LeaseDb, ManualClock, ServerConfig, Service,
};

const SERVER_MAC: HwAddr = HwAddr::new([0x02, 0, 0, 0, 0, 1]);
const CLIENT_MAC: HwAddr = HwAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x06]);

fn config(dir: &Path) -> ServerConfig {
    let lan = InterfaceConfig {
        ipv4: None,
        ipv6: Some(Ipv6Config {
            enabled: true,
            range_start: "fd00::1000".parse().unwrap(),
            range_end: "fd00::10ff".parse().unwrap(),
            lease_duration_seconds: 7200,
            dns_servers: vec!["fd00::1".parse().unwrap()],
        }),
        static_leases: Vec::new(),
    };
    ServerConfig {
        leases_file: dir.join("leases.json"),
        interfaces: BTreeMap::from([("br0".to_string(), lan)]),
        ..Default::default()
    }
}

fn ia(addr: Option<Ipv6Addr>) -> Dhcp6Option {
    Dhcp6Option::IaNa(IaNa {
        iaid: 1,
        t1: 0,
        t2: 0,
        options: addr
            .into_iter()
            .map(|addr| {
                Dhcp6Option::IaAddr(IaAddress {
                    addr,
                    preferred_lifetime: 0,
                    valid_lifetime: 0,
                    options: Vec::new(),
                })
            })
            .collect(),
    })
}

async fn exchange(peer: &mut ChannelPeer, message: Dhcp6Message) -> Dhcp6Message {
    let frame = Dhcp6Frame {
        src_mac: CLIENT_MAC,
        dst_mac: HwAddr::new([0x33, 0x33, 0x00, 0x01, 0x00, 0x02]),
        src_ip: link_local(CLIENT_MAC),
        dst_ip: ALL_DHCP_SERVERS,
        src_port: DHCP6_CLIENT_PORT,
        dst_port: DHCP6_SERVER_PORT,
        message,
    };
    peer.send(frame.encode()).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), peer.recv())
        .await
        .unwrap()
        .unwrap();
    let reply = Dhcp6Frame::parse(&reply).unwrap();
    assert_eq!(reply.src_mac, SERVER_MAC);
    assert_eq!(reply.dst_mac, CLIENT_MAC);
    assert_eq!(reply.src_ip, link_local(SERVER_MAC));
    assert_eq!(reply.dst_ip, link_local(CLIENT_MAC));
    assert_eq!(reply.src_port, DHCP6_SERVER_PORT);
    assert_eq!(reply.dst_port, DHCP6_CLIENT_PORT);
    reply.message
}

#[tokio::test]
async fn solicit_advertise_request_reply() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::default());
    let service = Service::new(config(dir.path()), clock.clone()).await.unwrap();

    let provider = ChannelProvider::new();
    let mut peer = provider.add("br0", SERVER_MAC, 8);
    service.start(&provider).await.unwrap();
    assert_eq!(service.running_interfaces().await, vec!["br0"]);

    let client_id = Dhcp6Option::ClientId(duid_ll(CLIENT_MAC));
    let solicit = Dhcp6Message::new(
        Dhcp6MessageType::Solicit,
        0x1234,
        vec![
            client_id.clone(),
            ia(None),
            Dhcp6Option::OptionRequest(vec![23]),
        ],
    );
    let advertise = exchange(&mut peer, solicit).await;
    assert_eq!(advertise.message_type, Dhcp6MessageType::Advertise);
    assert_eq!(advertise.transaction_id, 0x1234);
    assert!(
        advertise
            .options
            .contains(&Dhcp6Option::DnsServers(vec!["fd00::1".parse().unwrap()]))
    );
    let offered = advertise.ia_na().unwrap().first_address().unwrap();
    assert_eq!(offered, "fd00::1000".parse::<Ipv6Addr>().unwrap());
    let server_id = advertise.server_id().unwrap().to_vec();

    let request = Dhcp6Message::new(
        Dhcp6MessageType::Request,
        0x1235,
        vec![
            client_id.clone(),
            Dhcp6Option::ServerId(server_id.clone()),
            ia(Some(offered)),
        ],
    );
    let reply = exchange(&mut peer, request).await;
    assert_eq!(reply.message_type, Dhcp6MessageType::Reply);
    let bound = reply.ia_na().unwrap();
    assert_eq!(bound.first_address(), Some(offered));
    assert_eq!((bound.t1, bound.t2), (3600, 4800));
    assert_ne!(bound.status(), Some(StatusCode::NoAddrsAvail));

    let leases = service.leases().await;
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].hw_addr, CLIENT_MAC);
    assert_eq!(leases[0].family(), AddrFamily::V6);
    assert_eq!(
        service.mac_by_ip(IpAddr::V6(offered)).await,
        Some(CLIENT_MAC)
    );

    service.shutdown(Duration::from_secs(5)).await.unwrap();

    let db = LeaseDb::open(&config(dir.path()), clock.clone()).await.unwrap();
    let restored = db.leases().await;
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].ip_address, IpAddr::V6(offered));
}

#[tokio::test]
async fn release_frees_the_address() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::default());
    let service = Service::new(config(dir.path()), clock.clone()).await.unwrap();

    let provider = ChannelProvider::new();
    let mut peer = provider.add("br0", SERVER_MAC, 8);
    service.start(&provider).await.unwrap();

    let client_id = Dhcp6Option::ClientId(duid_ll(CLIENT_MAC));
    let rapid = Dhcp6Message::new(
        Dhcp6MessageType::Solicit,
        1,
        vec![client_id.clone(), ia(None), Dhcp6Option::RapidCommit],
    );
    let reply = exchange(&mut peer, rapid).await;
    assert_eq!(reply.message_type, Dhcp6MessageType::Reply);
    let addr = reply.ia_na().unwrap().first_address().unwrap();
    assert_eq!(service.leases().await.len(), 1);

    let release = Dhcp6Message::new(
        Dhcp6MessageType::Release,
        2,
        vec![
            client_id,
            Dhcp6Option::ServerId(duid_ll(SERVER_MAC)),
            ia(Some(addr)),
        ],
    );
    let reply = exchange(&mut peer, release).await;
    assert_eq!(reply.status(), Some(StatusCode::Success));
    assert!(service.leases().await.is_empty());

    service.shutdown(Duration::from_secs(5)).await.unwrap();
}
