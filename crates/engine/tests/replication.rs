use std::net::{IpAddr, SocketAddr};
use std::thread;
use std::time::{Duration, Instant};

use glam::Vec3;

use tether::{
    BitStream, ChannelConfig, EventBundle, LifecycleState, NetPeer, NetPeerEvent, NetPeerId,
    NetUserId, Network, PeerConfig, PropertyConfig, Replica, ReplicaChannel, ReplicaProperty,
    Role, Variant,
};

const NET_DT: f32 = 1.0 / 60.0;

fn localhost() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

fn open_peer(role: Role, guid: u64) -> NetPeer {
    let config = PeerConfig {
        role,
        project_guid: guid,
        ..Default::default()
    };
    NetPeer::open(config, localhost(), (0, 0)).unwrap()
}

/// Pumps both peers until the condition holds or the timeout expires.
fn pump_until(
    peers: &mut [&mut NetPeer],
    events: &mut Vec<NetPeerEvent>,
    timeout_ms: u64,
    mut condition: impl FnMut(&[NetPeerEvent]) -> bool,
) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        for peer in peers.iter_mut() {
            peer.update(NET_DT);
            events.extend(peer.drain_events());
        }
        if condition(events) {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition(events)
}

fn pose_replica() -> Replica {
    let mut replica = Replica::new(1, 77);
    let mut pose = ReplicaChannel::new("Pose", ChannelConfig::default());
    pose.add_property(
        ReplicaProperty::new(
            "Position",
            Variant::Real3(Vec3::ZERO),
            PropertyConfig {
                use_interpolation: true,
                sample_time_offset: -0.1,
                ..Default::default()
            },
        )
        .unwrap(),
    );
    replica.add_channel(pose);
    replica
}

#[test]
fn handshake_accept_assigns_peer_id() {
    let mut server = open_peer(Role::Server, 1);
    let mut client = open_peer(Role::Client, 1);
    let server_addr = server.local_addr();

    assert_eq!(client.net_peer_id(), NetPeerId::INVALID);
    client.connect(server_addr, EventBundle::new());

    let mut events = Vec::new();
    let connected = pump_until(&mut [&mut server, &mut client], &mut events, 2000, |events| {
        events
            .iter()
            .filter(|event| matches!(event, NetPeerEvent::LinkConnected { .. }))
            .count()
            >= 2
    });
    assert!(connected, "both sides publish LinkConnected");
    assert!(client.net_peer_id().is_valid());
    assert_eq!(server.users().count(), 0);
}

#[test]
fn handshake_deny_surfaces_response_bundle() {
    let mut server = open_peer(Role::Server, 1);
    server.set_connect_handler(|_, _| {
        let mut bundle = EventBundle::new();
        let mut reason = BitStream::new();
        reason.write_string("full");
        bundle.add("DenyReason", reason);
        tether::Decision {
            accept: false,
            bundle,
        }
    });
    let mut client = open_peer(Role::Client, 1);
    let server_addr = server.local_addr();
    client.connect(server_addr, EventBundle::new());

    let mut events = Vec::new();
    let denied = pump_until(&mut [&mut server, &mut client], &mut events, 2000, |events| {
        events
            .iter()
            .any(|event| matches!(event, NetPeerEvent::ConnectDenied { .. }))
    });
    assert!(denied);
    assert!(!client.net_peer_id().is_valid());

    let bundle = events.iter_mut().find_map(|event| match event {
        NetPeerEvent::ConnectDenied { bundle, .. } => Some(bundle),
        _ => None,
    });
    let mut data = bundle.unwrap().get("DenyReason").unwrap().data.clone();
    assert_eq!(data.read_string().unwrap(), "full");
}

#[test]
fn user_add_round_trip() {
    let mut server = open_peer(Role::Server, 2);
    let mut client = open_peer(Role::Client, 2);
    let server_addr = server.local_addr();
    client.connect(server_addr, EventBundle::new());

    let mut events = Vec::new();
    pump_until(&mut [&mut server, &mut client], &mut events, 2000, |events| {
        events
            .iter()
            .filter(|event| matches!(event, NetPeerEvent::LinkConnected { .. }))
            .count()
            >= 2
    });

    let mut bundle = EventBundle::new();
    let mut name = BitStream::new();
    name.write_string("alice");
    bundle.add("Name", name);
    client.add_user(bundle);

    let mut events = Vec::new();
    let online = pump_until(&mut [&mut server, &mut client], &mut events, 2000, |events| {
        events
            .iter()
            .filter(|event| matches!(event, NetPeerEvent::UserOnline { .. }))
            .count()
            >= 2
    });
    assert!(online, "user online on both peers");
    assert!(client.user(NetUserId(1)).is_some());
    assert!(server.user(NetUserId(1)).is_some());
    assert!(client.user(NetUserId(1)).unwrap().added_by_us);
    assert!(!server.user(NetUserId(1)).unwrap().added_by_us);

    // The server read the request bundle the client sent.
    let mut stored = server.user(NetUserId(1)).unwrap().request_bundle.clone();
    let mut name = stored.get("Name").unwrap().data.clone();
    assert_eq!(name.read_string().unwrap(), "alice");
}

#[test]
fn replica_creation_and_property_replication() {
    let mut server = open_peer(Role::Server, 3);
    let mut client = open_peer(Role::Client, 3);
    client.set_replica_factory(|_, _| pose_replica());
    let server_addr = server.local_addr();
    client.connect(server_addr, EventBundle::new());

    let mut events = Vec::new();
    pump_until(&mut [&mut server, &mut client], &mut events, 2000, |events| {
        events
            .iter()
            .filter(|event| matches!(event, NetPeerEvent::LinkConnected { .. }))
            .count()
            >= 2
    });

    // Register on the server with a non-zero initial position so online
    // replication carries state.
    let mut replica = pose_replica();
    replica
        .channel_mut("Pose")
        .unwrap()
        .property_mut("Position")
        .unwrap()
        .set(Variant::Real3(Vec3::new(1.0, 2.0, 3.0)));
    let id = server.register_replica(replica).unwrap();

    let mut events = Vec::new();
    let online = pump_until(&mut [&mut server, &mut client], &mut events, 2000, |events| {
        events
            .iter()
            .any(|event| matches!(event, NetPeerEvent::ReplicaOnline { id: seen } if *seen == id))
    });
    assert!(online, "client brings the replica online");

    // Initial channel state landed before the online event.
    let client_replica = client.replica(id).unwrap();
    assert_eq!(client_replica.state(), LifecycleState::Online);
    let position = client_replica
        .channel("Pose")
        .unwrap()
        .property("Position")
        .unwrap()
        .get()
        .clone();
    assert_eq!(position, Variant::Real3(Vec3::new(1.0, 2.0, 3.0)));

    // Two successive changes arrive in order on an ordered channel.
    server
        .replica_mut(id)
        .unwrap()
        .channel_mut("Pose")
        .unwrap()
        .property_mut("Position")
        .unwrap()
        .set(Variant::Real3(Vec3::new(1.0, 2.0, 4.0)));

    let mut events = Vec::new();
    let changed = pump_until(&mut [&mut server, &mut client], &mut events, 2000, |events| {
        events
            .iter()
            .any(|event| matches!(event, NetPeerEvent::ChannelPropertyChanged { .. }))
    });
    assert!(changed, "change replicated to client");

    // The interpolated sample near now sits between the two authoritative
    // values on z.
    let property = client
        .replica(id)
        .unwrap()
        .channel("Pose")
        .unwrap()
        .property("Position")
        .unwrap()
        .clone();
    let sampled = property.sample(client.now()).unwrap();
    match sampled {
        Variant::Real3(value) => {
            assert!((3.0..=4.0).contains(&value.z), "sampled {value:?}");
            assert_eq!(value.x, 1.0);
        }
        other => panic!("unexpected variant {other:?}"),
    }
}

#[test]
fn replica_offline_exits_once() {
    let mut server = open_peer(Role::Server, 4);
    let mut client = open_peer(Role::Client, 4);
    client.set_replica_factory(|_, _| pose_replica());
    let server_addr = server.local_addr();
    client.connect(server_addr, EventBundle::new());

    let mut events = Vec::new();
    pump_until(&mut [&mut server, &mut client], &mut events, 2000, |events| {
        events
            .iter()
            .filter(|event| matches!(event, NetPeerEvent::LinkConnected { .. }))
            .count()
            >= 2
    });

    let id = server.register_replica(pose_replica()).unwrap();
    let mut events = Vec::new();
    pump_until(&mut [&mut server, &mut client], &mut events, 2000, |events| {
        events
            .iter()
            .any(|event| matches!(event, NetPeerEvent::ReplicaOnline { id: seen } if *seen == id))
    });

    server.destroy_replica(id);
    let mut events = Vec::new();
    let destroyed = pump_until(&mut [&mut server, &mut client], &mut events, 2000, |events| {
        events
            .iter()
            .any(|event| matches!(event, NetPeerEvent::ReplicaDestroyed { id: seen } if *seen == id))
    });
    assert!(destroyed);
    assert!(client.replica(id).is_none());
    // Online exited through exactly one offline on the client.
    let offline_count = events
        .iter()
        .filter(|event| matches!(event, NetPeerEvent::ReplicaOffline { id: seen } if *seen == id))
        .count();
    assert_eq!(offline_count, 1);
}

#[test]
fn direct_host_refresh_discovers_server() {
    let mut server = open_peer(Role::Server, 5);
    let mut info = BitStream::new();
    info.write_string("midnight skirmish");
    server.set_basic_host_info(info);

    let mut client = open_peer(Role::Client, 5);
    let server_addr = server.local_addr();
    client.refresh_host(Network::Lan, server_addr);

    let mut events = Vec::new();
    let refreshed = pump_until(&mut [&mut server, &mut client], &mut events, 2000, |events| {
        events
            .iter()
            .any(|event| matches!(event, NetPeerEvent::HostRefreshCompleted { .. }))
    });
    assert!(refreshed);
    let hosts = client.host_list(Network::Lan);
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].address, server_addr);
    let mut stored = hosts[0].basic_host_info.clone();
    assert_eq!(stored.read_string().unwrap(), "midnight skirmish");
}

#[test]
fn master_server_directory_round_trip() {
    let mut master = open_peer(Role::MasterServer, 6);
    let master_addr = master.local_addr();

    let server_config = PeerConfig {
        role: Role::Server,
        project_guid: 6,
        master_servers: vec![master_addr],
        host_publish_interval: 0.0,
        ..Default::default()
    };
    let mut server = NetPeer::open(server_config, localhost(), (0, 0)).unwrap();
    let mut info = BitStream::new();
    info.write_u16(9000);
    server.set_basic_host_info(info);

    // The server publishes its record to the master.
    let mut events = Vec::new();
    pump_until(&mut [&mut master, &mut server], &mut events, 1000, |_| false);

    let client_config = PeerConfig {
        role: Role::Client,
        project_guid: 6,
        master_servers: vec![master_addr],
        ..Default::default()
    };
    let mut client = NetPeer::open(client_config, localhost(), (0, 0)).unwrap();
    client.discover_host_list(Network::Internet, (0, 0));

    let mut events = Vec::new();
    let discovered = pump_until(
        &mut [&mut master, &mut server, &mut client],
        &mut events,
        2000,
        |events| {
            events
                .iter()
                .any(|event| matches!(event, NetPeerEvent::HostDiscovered { .. }))
        },
    );
    assert!(discovered, "record list relayed through the master server");
    assert_eq!(client.host_list(Network::Internet).len(), 1);
}

#[test]
fn extra_host_info_requires_a_connected_link() {
    let mut server = open_peer(Role::Server, 7);
    let mut extra = BitStream::new();
    extra.write_string("mods: none, map rotation: 3");
    server.set_extra_host_info(extra);

    let mut client = open_peer(Role::Client, 7);
    let server_addr = server.local_addr();

    // Without a link the request is refused outright.
    assert!(!client.request_extra_host_info(server_addr));

    client.connect(server_addr, EventBundle::new());
    let mut events = Vec::new();
    pump_until(&mut [&mut server, &mut client], &mut events, 2000, |events| {
        events
            .iter()
            .filter(|event| matches!(event, NetPeerEvent::LinkConnected { .. }))
            .count()
            >= 2
    });

    assert!(client.request_extra_host_info(server_addr));
    let mut events = Vec::new();
    let fetched = pump_until(&mut [&mut server, &mut client], &mut events, 2000, |events| {
        events.iter().any(|event| {
            matches!(
                event,
                NetPeerEvent::HostRefreshCompleted {
                    result: tether::RefreshResult::ExtraHostInfo,
                    ..
                }
            )
        })
    });
    assert!(fetched);
}

#[test]
fn timeout_resolves_connect_attempt() {
    let config = PeerConfig {
        role: Role::Client,
        attempt_timeout: 0.2,
        ..Default::default()
    };
    let mut client = NetPeer::open(config, localhost(), (0, 0)).unwrap();
    // Nobody listens here.
    let nowhere: SocketAddr = "127.0.0.1:1".parse().unwrap();
    client.connect(nowhere, EventBundle::new());

    let mut events = Vec::new();
    let timed_out = pump_until(&mut [&mut client], &mut events, 2000, |events| {
        events.iter().any(|event| {
            matches!(
                event,
                NetPeerEvent::LinkDisconnected {
                    reason: tether::DisconnectReason::Timeout,
                    ..
                }
            )
        })
    });
    assert!(timed_out);
}
