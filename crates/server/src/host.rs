use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use glam::{Mat3, Quat, Vec3};

use tether::physics::{BodyIndex, NodeIndex};
use tether::{
    NetObjectId,
    ChannelConfig, EffectKind, EffectScope, EventBundle, NetPeer, NetPeerEvent, PeerConfig,
    PhysicsEffect, PhysicsEvent, PhysicsSpace, PropertyConfig, Replica, ReplicaChannel,
    ReplicaProperty, Role, Shape, SimulationClock, SpaceConfig, Variant,
};

use crate::config::HostConfig;

/// Replica type id for the demo bodies a server hosts.
const BALL_REPLICA_TYPE: u64 = 0xba11;
const WORLD_CREATE_CONTEXT: u64 = 1;

/// A replicated physics body on the server side.
struct ReplicatedBody {
    node: NodeIndex,
    body: BodyIndex,
    replica: NetObjectId,
}

/// The host application: one peer and one physics space driven by fixed
/// timesteps from a single run loop.
pub struct Host {
    config: HostConfig,
    peer: NetPeer,
    space: PhysicsSpace,
    clock: SimulationClock,
    replicated: Vec<ReplicatedBody>,
    last_frame: Instant,
}

/// The channel layout shared by every peer for the demo ball replicas. The
/// channel set must not differ between client and server.
fn ball_replica() -> Replica {
    let mut replica = Replica::new(WORLD_CREATE_CONTEXT, BALL_REPLICA_TYPE);
    let mut pose = ReplicaChannel::new("Pose", ChannelConfig::default());
    pose.add_property(
        ReplicaProperty::new(
            "Position",
            Variant::Real3(Vec3::ZERO),
            PropertyConfig {
                use_delta_threshold: true,
                delta_threshold: 0.001,
                use_interpolation: true,
                sample_time_offset: -0.1,
                ..Default::default()
            },
        )
        .expect("static property config"),
    );
    pose.add_property(
        ReplicaProperty::new(
            "Orientation",
            Variant::Quaternion(Quat::IDENTITY),
            PropertyConfig {
                use_half_floats: true,
                ..Default::default()
            },
        )
        .expect("static property config"),
    );
    replica.add_channel(pose);
    replica
}

impl Host {
    pub fn open(config: HostConfig, bind: IpAddr, ports: (u16, u16)) -> Result<Self> {
        let peer_config = PeerConfig {
            role: config.role,
            project_guid: config.project_guid,
            max_links: config.max_clients,
            master_servers: config.master_servers.clone(),
            ..Default::default()
        };
        let mut peer = NetPeer::open(peer_config, bind, ports)
            .with_context(|| format!("no bindable port in {}..={}", ports.0, ports.1))?;
        peer.set_replica_factory(|_context, _replica_type| ball_replica());

        let clock = SimulationClock::new(config.physics_rate, config.net_rate);
        let mut host = Self {
            replicated: Vec::new(),
            last_frame: Instant::now(),
            config,
            peer,
            space: PhysicsSpace::new(SpaceConfig::default()),
            clock,
        };

        if host.config.role == Role::Server {
            host.build_world();
            host.register_replicas();
        }
        Ok(host)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.peer.local_addr()
    }

    fn build_world(&mut self) {
        let space = &mut self.space;
        space.add_effect(PhysicsEffect::new(
            EffectKind::Gravity {
                direction: -Vec3::Y,
                strength: 9.81,
            },
            EffectScope::Space,
        ));

        let ground = space.add_node(None);
        space.add_collider(
            ground,
            Shape::Box {
                half_extents: Vec3::new(50.0, 1.0, 50.0),
            },
        );
        space.place_node(ground, Vec3::new(0.0, -1.0, 0.0), Mat3::IDENTITY);

        for index in 0..self.config.body_count {
            let node = space.add_node(None);
            let body = space.add_body(node);
            space.add_collider(node, Shape::Sphere { radius: 0.5 });
            space.place_node(
                node,
                Vec3::new(index as f32 * 1.5 - 2.0, 4.0 + index as f32, 0.0),
                Mat3::IDENTITY,
            );
            self.replicated.push(ReplicatedBody {
                node,
                body,
                replica: NetObjectId::INVALID,
            });
        }
    }

    fn register_replicas(&mut self) {
        for entry in &mut self.replicated {
            if let Some(id) = self.peer.register_replica(ball_replica()) {
                entry.replica = id;
            }
        }
    }

    pub fn connect(&mut self, address: SocketAddr) {
        self.peer.connect(address, EventBundle::new());
    }

    pub fn add_user(&mut self, name: &str) {
        let mut bundle = EventBundle::new();
        let mut data = tether::BitStream::new();
        data.write_string(name);
        bundle.add("Name", data);
        self.peer.add_user(bundle);
    }

    pub fn discover_lan(&mut self, ports: (u16, u16)) {
        self.peer.discover_host_list(tether::Network::Lan, ports);
    }

    pub fn discover_internet(&mut self) {
        self.peer.discover_host_list(tether::Network::Internet, (0, 0));
    }

    /// One frame of the run loop: advances both fixed-step loops and drains
    /// events to the log.
    pub fn tick_once(&mut self) {
        let now = Instant::now();
        let delta = (now - self.last_frame).as_secs_f32();
        self.last_frame = now;

        let physics_dt = self.clock.physics.dt();
        for _ in 0..self.clock.physics.advance(delta) {
            self.space.step(physics_dt);
        }
        let net_dt = self.clock.net.dt();
        for _ in 0..self.clock.net.advance(delta) {
            self.publish_body_state();
            self.peer.update(net_dt);
        }

        self.drain_logs();
    }

    /// Copies authoritative body poses into their replica channels; change
    /// detection picks the moved ones up on the next observation.
    fn publish_body_state(&mut self) {
        if self.config.role != Role::Server {
            return;
        }
        for entry in &self.replicated {
            if !entry.replica.is_valid() {
                continue;
            }
            let Some(node) = self.space.node(entry.node) else {
                continue;
            };
            let translation = node.transform.translation;
            let rotation = self
                .space
                .body(entry.body)
                .map(|body| body.rotation)
                .unwrap_or(Quat::IDENTITY);
            let Some(replica) = self.peer.replica_mut(entry.replica) else {
                continue;
            };
            let Some(channel) = replica.channel_mut("Pose") else {
                continue;
            };
            if let Some(property) = channel.property_mut("Position") {
                property.set(Variant::Real3(translation));
            }
            if let Some(property) = channel.property_mut("Orientation") {
                property.set(Variant::Quaternion(rotation));
            }
        }
    }

    fn drain_logs(&mut self) {
        for event in self.peer.drain_events() {
            match event {
                NetPeerEvent::LinkConnecting { address } => {
                    log::info!("link to {address} connecting");
                }
                NetPeerEvent::LinkConnected {
                    address,
                    remote_peer_id,
                } => log::info!("link to {address} connected (peer {remote_peer_id})"),
                NetPeerEvent::LinkDisconnected { address, reason } => {
                    log::info!("link to {address} disconnected: {reason:?}");
                }
                NetPeerEvent::ConnectDenied { address, .. } => {
                    log::warn!("connection to {address} denied");
                }
                NetPeerEvent::UserOnline { user_id, .. } => log::info!("user {user_id} online"),
                NetPeerEvent::UserOffline { user_id } => log::info!("user {user_id} offline"),
                NetPeerEvent::ReplicaOnline { id } => log::info!("replica {id} online"),
                NetPeerEvent::ReplicaOffline { id } => log::info!("replica {id} offline"),
                NetPeerEvent::HostDiscovered { host } => {
                    log::info!(
                        "discovered host {} ({:?}, rtt {:.0} ms)",
                        host.address,
                        host.network,
                        host.round_trip_time * 1000.0
                    );
                }
                NetPeerEvent::BandwidthWarning { address } => {
                    log::warn!("outgoing frame to {address} is near the bandwidth budget");
                }
                NetPeerEvent::ProtocolError { address } => {
                    log::warn!("protocol error on link to {address}");
                }
                other => log::debug!("{other:?}"),
            }
        }
        for event in self.space.drain_events() {
            match event {
                PhysicsEvent::Warning { message } => log::warn!("physics: {message}"),
                PhysicsEvent::InvalidVelocity { body, .. } => {
                    log::warn!("body {body} velocity clamped to the space maximum");
                }
                other => log::trace!("{other:?}"),
            }
        }
    }

    /// Runs the host until the process is terminated.
    pub fn run(&mut self) {
        log::info!(
            "{:?} peer {} listening on {}",
            self.config.role,
            self.peer.guid(),
            self.local_addr()
        );
        loop {
            self.tick_once();
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
