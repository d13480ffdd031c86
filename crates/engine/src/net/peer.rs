use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Instant;

use super::bitstream::BitStream;
use super::bundle::EventBundle;
use super::channel::{Authority, ReliabilityMode, SerializeReason, TransferMode};
use super::discovery::{
    AcceptedPong, HostDirectory, HostPingKind, NetHost, Network, PingManager, RefreshResult,
};
use super::events::NetPeerEvent;
use super::link::{
    DisconnectReason, LinkDirection, LinkEvent, LinkState, MAX_PACKET_SIZE, PacketHeader, PeerLink,
};
use super::message::{ConnectResponse, HostRecord, Message, UserAddResponse};
use super::replica::{FamilyTreeId, LifecycleState, NetObjectId, NetPeerId, NetUserId, Replica};
use super::family::FamilyTree;

/// The peer id a server assigns itself; clients receive ids from its store.
const SERVER_PEER_ID: NetPeerId = NetPeerId(1);

/// Reserved event names carrying the extra-host-info exchange over a link.
const EXTRA_HOST_INFO_REQUEST: &str = "__ExtraHostInfoRequest";
const EXTRA_HOST_INFO_REPLY: &str = "__ExtraHostInfoReply";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offline,
    Client,
    Server,
    MasterServer,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub role: Role,
    pub project_guid: u64,
    pub max_links: usize,
    /// Seconds without traffic before a connected link is dropped.
    pub link_timeout: f32,
    /// Seconds before an unanswered connect attempt resolves as no-response.
    pub attempt_timeout: f32,
    /// Outgoing byte budget per link per net tick.
    pub frame_budget_bytes: usize,
    pub basic_host_info_timeout: f32,
    /// Seconds between re-publishing our host record to master servers.
    pub host_publish_interval: f32,
    pub internet_host_record_lifetime: f32,
    pub internet_same_ip_host_record_limit: usize,
    pub master_servers: Vec<SocketAddr>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            role: Role::Offline,
            project_guid: 0,
            max_links: 64,
            link_timeout: 10.0,
            attempt_timeout: 10.0,
            frame_budget_bytes: 16 * 1024,
            basic_host_info_timeout: 2.0,
            host_publish_interval: 30.0,
            internet_host_record_lifetime: 120.0,
            internet_same_ip_host_record_limit: 64,
            master_servers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NetUser {
    pub id: NetUserId,
    pub owner_peer: NetPeerId,
    pub added_by_us: bool,
    pub request_bundle: EventBundle,
}

/// Result of the application's decision on a connect or user-add request.
pub struct Decision {
    pub accept: bool,
    pub bundle: EventBundle,
}

impl Default for Decision {
    fn default() -> Self {
        Self {
            accept: true,
            bundle: EventBundle::new(),
        }
    }
}

type ConnectHandler = Box<dyn FnMut(SocketAddr, &mut EventBundle) -> Decision + Send>;
type UserAddHandler = Box<dyn FnMut(&mut EventBundle) -> Decision + Send>;
/// Builds a replica (with its channel set) for an incoming creation message.
type ReplicaFactory = Box<dyn FnMut(u64, u64) -> Replica + Send>;

/// Id store with free-list reuse; released ids are handed out again.
#[derive(Debug)]
struct IdStore {
    next: u32,
    free: Vec<u32>,
}

impl IdStore {
    fn starting_at(next: u32) -> Self {
        Self { next, free: Vec::new() }
    }

    fn acquire(&mut self) -> u32 {
        if let Some(id) = self.free.pop() {
            return id;
        }
        let id = self.next;
        self.next += 1;
        id
    }

    fn release(&mut self, id: u32) {
        if id != 0 && !self.free.contains(&id) {
            self.free.push(id);
        }
    }
}

/// Random u64 from hasher state; good enough for salts and GUIDs.
pub fn rand_u64() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let state = RandomState::new();
    let mut hasher = state.build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64,
    );
    hasher.finish()
}

/// A peer in the network graph: multiplexes links, assigns ids, routes
/// messages, and relays authoritative replica changes.
pub struct NetPeer {
    config: PeerConfig,
    guid: u64,
    socket: UdpSocket,
    local_addr: SocketAddr,
    net_peer_id: NetPeerId,
    epoch: Instant,
    links: HashMap<SocketAddr, PeerLink>,
    dying_links: Vec<SocketAddr>,

    peer_ids: IdStore,
    user_ids: IdStore,
    object_ids: IdStore,
    family_ids: IdStore,

    replicas: HashMap<NetObjectId, Replica>,
    family_trees: HashMap<FamilyTreeId, FamilyTree>,
    emplaced_waiting: HashMap<(u64, u32), Replica>,
    deferred_attachments: HashMap<NetObjectId, Vec<NetObjectId>>,

    users: HashMap<NetUserId, NetUser>,
    pending_user_requests: VecDeque<EventBundle>,

    ping_manager: PingManager,
    host_lists: HashMap<Network, Vec<NetHost>>,
    directory: HostDirectory,
    pending_indirect_refreshes: HashMap<SocketAddr, Vec<SocketAddr>>,
    basic_host_info: BitStream,
    extra_host_info: BitStream,
    last_publish_time: f32,

    connect_handler: Option<ConnectHandler>,
    user_add_handler: Option<UserAddHandler>,
    replica_factory: Option<ReplicaFactory>,

    events: VecDeque<NetPeerEvent>,
    recv_buffer: [u8; MAX_PACKET_SIZE * 2],
}

impl NetPeer {
    /// Opens a peer on the first bindable port in `ports` (inclusive).
    pub fn open(config: PeerConfig, bind_ip: IpAddr, ports: (u16, u16)) -> io::Result<Self> {
        let mut last_error = io::Error::new(io::ErrorKind::AddrInUse, "no ports in range");
        for port in ports.0..=ports.1 {
            match UdpSocket::bind((bind_ip, port)) {
                Ok(socket) => return Self::from_socket(config, socket),
                Err(error) => last_error = error,
            }
        }
        Err(last_error)
    }

    pub fn open_any<A: ToSocketAddrs>(config: PeerConfig, addr: A) -> io::Result<Self> {
        Self::from_socket(config, UdpSocket::bind(addr)?)
    }

    fn from_socket(config: PeerConfig, socket: UdpSocket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        socket.set_broadcast(true)?;
        let local_addr = socket.local_addr()?;
        let guid = rand_u64();
        let net_peer_id = if config.role == Role::Server {
            SERVER_PEER_ID
        } else {
            NetPeerId::INVALID
        };
        let directory = HostDirectory::new(
            config.internet_host_record_lifetime,
            config.internet_same_ip_host_record_limit,
        );
        let manager_id = (guid & 0xffff_ffff) as u32;
        let project_guid = config.project_guid;
        Ok(Self {
            config,
            guid,
            socket,
            local_addr,
            net_peer_id,
            epoch: Instant::now(),
            links: HashMap::new(),
            dying_links: Vec::new(),
            peer_ids: IdStore::starting_at(SERVER_PEER_ID.0 + 1),
            user_ids: IdStore::starting_at(1),
            object_ids: IdStore::starting_at(1),
            family_ids: IdStore::starting_at(1),
            replicas: HashMap::new(),
            family_trees: HashMap::new(),
            emplaced_waiting: HashMap::new(),
            deferred_attachments: HashMap::new(),
            users: HashMap::new(),
            pending_user_requests: VecDeque::new(),
            ping_manager: PingManager::new(manager_id, project_guid),
            host_lists: HashMap::new(),
            directory,
            pending_indirect_refreshes: HashMap::new(),
            basic_host_info: BitStream::new(),
            extra_host_info: BitStream::new(),
            last_publish_time: -f32::INFINITY,
            connect_handler: None,
            user_add_handler: None,
            replica_factory: None,
            events: VecDeque::new(),
            recv_buffer: [0; MAX_PACKET_SIZE * 2],
        })
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    pub fn guid(&self) -> u64 {
        self.guid
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn net_peer_id(&self) -> NetPeerId {
        self.net_peer_id
    }

    pub fn is_server(&self) -> bool {
        self.config.role == Role::Server
    }

    pub fn now(&self) -> f32 {
        self.epoch.elapsed().as_secs_f32()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn link_state(&self, address: SocketAddr) -> Option<LinkState> {
        self.links.get(&address).map(|link| link.state())
    }

    pub fn link_rtt(&self, address: SocketAddr) -> Option<f32> {
        self.links.get(&address).map(|link| link.rtt_seconds())
    }

    pub fn set_connect_handler(
        &mut self,
        handler: impl FnMut(SocketAddr, &mut EventBundle) -> Decision + Send + 'static,
    ) {
        self.connect_handler = Some(Box::new(handler));
    }

    pub fn set_user_add_handler(
        &mut self,
        handler: impl FnMut(&mut EventBundle) -> Decision + Send + 'static,
    ) {
        self.user_add_handler = Some(Box::new(handler));
    }

    pub fn set_replica_factory(
        &mut self,
        factory: impl FnMut(u64, u64) -> Replica + Send + 'static,
    ) {
        self.replica_factory = Some(Box::new(factory));
    }

    /// The bounded host info published for discovery; kept small enough to
    /// ride in pongs and host records.
    pub fn set_basic_host_info(&mut self, info: BitStream) {
        self.basic_host_info = info;
    }

    /// Larger host info served only to connected peers on request.
    pub fn set_extra_host_info(&mut self, info: BitStream) {
        self.extra_host_info = info;
    }

    pub fn drain_events(&mut self) -> Vec<NetPeerEvent> {
        self.events.drain(..).collect()
    }

    //
    // Link management
    //

    /// Begins connecting to a remote peer, bundling request data.
    pub fn connect(&mut self, address: SocketAddr, bundle: EventBundle) {
        if self.links.contains_key(&address) {
            return;
        }
        let now = self.now();
        let mut link = PeerLink::new(address, LinkDirection::Outgoing, now);
        link.set_attempt_timeout(self.config.attempt_timeout);
        let mut bundle = bundle;
        link.advance(&LinkEvent::ConnectIntent {
            pending_user_adds: self.pending_user_requests.len() as u32,
            bundle: bundle.as_stream().clone(),
        });
        self.links.insert(address, link);
        self.events.push_back(NetPeerEvent::LinkConnecting { address });
    }

    /// Sends a disconnect notice and tears the link down after the flush.
    pub fn disconnect(&mut self, address: SocketAddr, bundle: EventBundle) {
        let Some(link) = self.links.get_mut(&address) else {
            return;
        };
        let mut bundle = bundle;
        let transition = link.advance(&LinkEvent::DisconnectIntent {
            bundle: bundle.as_stream().clone(),
        });
        if let Some(reason) = transition.disconnected {
            self.events
                .push_back(NetPeerEvent::LinkDisconnected { address, reason });
            self.dying_links.push(address);
        }
    }

    /// Dispatches a bundled event to a remote peer.
    pub fn send_event(&mut self, address: SocketAddr, mut bundle: EventBundle) {
        if let Some(link) = self.links.get_mut(&address) {
            link.queue(
                Message::NetEvent {
                    bundle: bundle.as_stream().clone(),
                },
                TransferMode::Ordered,
                true,
            );
        }
    }

    fn queue_to_all(&mut self, message: Message, transfer: TransferMode, reliable: bool) {
        for link in self.links.values_mut() {
            if link.state() == LinkState::Connected {
                link.queue(message.clone(), transfer, reliable);
            }
        }
    }

    //
    // Users
    //

    /// Requests a user add. Clients forward to the server; a server adds the
    /// user locally and immediately.
    pub fn add_user(&mut self, mut bundle: EventBundle) {
        if self.is_server() {
            let id = NetUserId(self.user_ids.acquire());
            self.users.insert(
                id,
                NetUser {
                    id,
                    owner_peer: self.net_peer_id,
                    added_by_us: true,
                    request_bundle: bundle,
                },
            );
            self.events.push_back(NetPeerEvent::UserOnline {
                user_id: id,
                owner_peer: self.net_peer_id,
                added_by_us: true,
            });
            return;
        }

        let message = Message::UserAddRequest {
            bundle: bundle.as_stream().clone(),
        };
        let server = self.server_link_addr();
        match server {
            Some(address) => {
                if let Some(link) = self.links.get_mut(&address) {
                    link.queue(message, TransferMode::Ordered, true);
                }
                self.pending_user_requests.push_back(bundle);
            }
            None => self.pending_user_requests.push_back(bundle),
        }
    }

    /// Requests removal of a user this peer added.
    pub fn remove_user(&mut self, user_id: NetUserId, mut bundle: EventBundle) {
        if self.is_server() {
            if self.users.remove(&user_id).is_some() {
                self.user_ids.release(user_id.0);
                self.events.push_back(NetPeerEvent::UserOffline { user_id });
            }
            return;
        }
        if let Some(address) = self.server_link_addr() {
            if let Some(link) = self.links.get_mut(&address) {
                link.queue(
                    Message::UserRemoveRequest {
                        net_user_id: user_id,
                        bundle: bundle.as_stream().clone(),
                    },
                    TransferMode::Ordered,
                    true,
                );
            }
        }
    }

    pub fn user(&self, id: NetUserId) -> Option<&NetUser> {
        self.users.get(&id)
    }

    pub fn users(&self) -> impl Iterator<Item = &NetUser> {
        self.users.values()
    }

    fn server_link_addr(&self) -> Option<SocketAddr> {
        // Clients hold exactly one outgoing link, to the server.
        self.links
            .iter()
            .find(|(_, link)| link.direction() == LinkDirection::Outgoing)
            .map(|(addr, _)| *addr)
    }

    //
    // Replication API
    //

    /// Registers a replica on the server: assigns its id, joins it to a
    /// family tree, brings it online, and announces it to every client.
    pub fn register_replica(&mut self, mut replica: Replica) -> Option<NetObjectId> {
        if !self.is_server() || !replica.register() {
            return None;
        }
        let id = NetObjectId(self.object_ids.acquire());
        if !replica.make_live(id) {
            self.object_ids.release(id.0);
            return None;
        }

        // Non-emplaced replicas join their parent's family tree, or root one.
        if !replica.is_emplaced() {
            let tree_id = replica
                .parent()
                .and_then(|parent| self.replicas.get(&parent))
                .and_then(|parent| parent.family_tree_id())
                .unwrap_or_else(|| {
                    let tree_id = FamilyTreeId(self.family_ids.acquire());
                    self.family_trees.insert(
                        tree_id,
                        FamilyTree::new(tree_id, replica.create_context(), replica.replica_type()),
                    );
                    tree_id
                });
            if let Some(tree) = self.family_trees.get_mut(&tree_id) {
                tree.add(id);
            }
            replica.set_family_tree_id(tree_id);
        }

        let now = self.now();
        let channel_data = serialize_lifecycle_channels(&mut replica, SerializeReason::Online, now);
        let message = creation_message(&replica, id, channel_data);
        replica.bring_online(now);
        self.replicas.insert(id, replica);
        self.queue_to_all(message, TransferMode::Ordered, true);
        self.events.push_back(NetPeerEvent::ReplicaOnline { id });
        Some(id)
    }

    /// Announces every online replica to a newly connected subscriber, in id
    /// order so family-tree ancestors precede their descendants.
    fn sync_replicas_to_link(&mut self, address: SocketAddr, now: f32) {
        if !self.is_server() {
            return;
        }
        let mut ids: Vec<NetObjectId> = self.replicas.keys().copied().collect();
        ids.sort_unstable();
        let mut messages = Vec::new();
        for id in ids {
            let Some(replica) = self.replicas.get_mut(&id) else {
                continue;
            };
            if !replica.is_online() {
                continue;
            }
            let channel_data =
                serialize_lifecycle_channels(replica, SerializeReason::Online, now);
            messages.push(creation_message(replica, id, channel_data));
        }
        if let Some(link) = self.links.get_mut(&address) {
            for message in messages {
                link.queue(message, TransferMode::Ordered, true);
            }
        }
    }

    /// Pre-registers a level-authored replica on a client, matched later by
    /// its (emplace context, emplace id) pair instead of a creation message.
    pub fn emplace_replica(&mut self, mut replica: Replica) -> bool {
        let super::replica::CreateSource::Emplaced { context, emplace_id } = replica.create_source()
        else {
            return false;
        };
        if !replica.register() {
            return false;
        }
        self.emplaced_waiting.insert((context, emplace_id), replica);
        true
    }

    /// Takes a replica offline, replicating final channel state first.
    pub fn take_replica_offline(&mut self, id: NetObjectId) {
        let now = self.now();
        let Some(replica) = self.replicas.get_mut(&id) else {
            return;
        };
        if !replica.is_online() {
            return;
        }
        let channel_data = serialize_lifecycle_channels(replica, SerializeReason::Offline, now);
        replica.take_offline(now);
        if self.is_server() {
            self.queue_to_all(
                Message::ReplicaOffline {
                    net_object_id: id,
                    channel_data,
                },
                TransferMode::Ordered,
                true,
            );
        }
        self.events.push_back(NetPeerEvent::ReplicaOffline { id });
    }

    /// Locally invalidates a replica without destroying its game object.
    /// Servers propagate the forget to all subscribers.
    pub fn forget_replica(&mut self, id: NetObjectId) {
        if self.finalize_replica(id, false) && self.is_server() {
            self.queue_to_all(
                Message::ForgetReplica { net_object_id: id },
                TransferMode::Ordered,
                true,
            );
        }
    }

    /// Destroys a replica everywhere.
    pub fn destroy_replica(&mut self, id: NetObjectId) {
        if self.finalize_replica(id, true) && self.is_server() {
            self.queue_to_all(
                Message::DestroyReplica { net_object_id: id },
                TransferMode::Ordered,
                true,
            );
        }
    }

    fn finalize_replica(&mut self, id: NetObjectId, destroyed: bool) -> bool {
        let Some(mut replica) = self.replicas.remove(&id) else {
            return false;
        };
        // Every replica that entered online exits through exactly one of
        // offline, forget, or destroy.
        if replica.is_online() {
            replica.take_offline(self.now());
            self.events.push_back(NetPeerEvent::ReplicaOffline { id });
        }
        if let Some(tree_id) = replica.family_tree_id() {
            if let Some(tree) = self.family_trees.get_mut(&tree_id) {
                tree.remove(id);
                if tree.is_empty() {
                    self.family_trees.remove(&tree_id);
                    self.family_ids.release(tree_id.0);
                }
            }
        }
        if self.is_server() {
            self.object_ids.release(id.0);
        }
        self.events.push_back(if destroyed {
            NetPeerEvent::ReplicaDestroyed { id }
        } else {
            NetPeerEvent::ReplicaForgotten { id }
        });
        true
    }

    pub fn replica(&self, id: NetObjectId) -> Option<&Replica> {
        self.replicas.get(&id)
    }

    pub fn replica_mut(&mut self, id: NetObjectId) -> Option<&mut Replica> {
        self.replicas.get_mut(&id)
    }

    pub fn replicas(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.values()
    }

    pub fn family_tree(&self, id: FamilyTreeId) -> Option<&FamilyTree> {
        self.family_trees.get(&id)
    }

    //
    // Level and game load notifications
    //

    pub fn broadcast_level_load_started(&mut self, net_space_id: NetObjectId, level_resource_id: u64) {
        self.queue_to_all(
            Message::LevelLoadStarted {
                net_space_id,
                level_resource_id,
            },
            TransferMode::Ordered,
            true,
        );
    }

    pub fn broadcast_level_load_finished(&mut self, net_space_id: NetObjectId) {
        self.queue_to_all(
            Message::LevelLoadFinished { net_space_id },
            TransferMode::Ordered,
            true,
        );
    }

    pub fn broadcast_game_load_started(&mut self) {
        self.queue_to_all(Message::GameLoadStarted, TransferMode::Ordered, true);
    }

    pub fn broadcast_game_load_finished(&mut self) {
        self.queue_to_all(Message::GameLoadFinished, TransferMode::Ordered, true);
    }

    //
    // Host discovery
    //

    /// Builds a fresh host list: LAN broadcasts across the port range,
    /// Internet queries every subscribed master server.
    pub fn discover_host_list(&mut self, network: Network, port_range: (u16, u16)) {
        let now = self.now();
        for cancelled in self
            .ping_manager
            .cancel_superseded(HostPingKind::DiscoverList, network)
        {
            log::debug!("host request {cancelled} superseded by list discovery");
        }
        self.host_lists.entry(network).or_default().clear();

        match network {
            Network::Lan => {
                let targets: Vec<SocketAddr> = (port_range.0..=port_range.1)
                    .map(|port| SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port))
                    .collect();
                let (_, message) = self.ping_manager.create_ping(
                    network,
                    HostPingKind::DiscoverList,
                    targets.clone(),
                    self.config.basic_host_info_timeout,
                    now,
                );
                for target in targets {
                    self.send_connectionless(target, &message);
                }
            }
            Network::Internet => {
                let targets = self.config.master_servers.clone();
                let (_, message) = self.ping_manager.create_ping(
                    network,
                    HostPingKind::MasterQuery,
                    targets.clone(),
                    self.config.basic_host_info_timeout,
                    now,
                );
                for target in targets {
                    self.send_connectionless(target, &message);
                }
            }
        }
    }

    /// Refreshes a single host's basic info directly.
    pub fn refresh_host(&mut self, network: Network, address: SocketAddr) {
        let now = self.now();
        let (_, message) = self.ping_manager.create_ping(
            network,
            HostPingKind::SingleRefresh(address),
            vec![address],
            self.config.basic_host_info_timeout,
            now,
        );
        self.send_connectionless(address, &message);
    }

    /// Requests a host's extra info over an existing connected link. The
    /// request and reply ride as reserved net events; the result arrives as
    /// a refresh completion with the extra-info outcome.
    pub fn request_extra_host_info(&mut self, address: SocketAddr) -> bool {
        let Some(link) = self.links.get_mut(&address) else {
            return false;
        };
        if link.state() != LinkState::Connected {
            return false;
        }
        let mut bundle = EventBundle::new();
        bundle.add(EXTRA_HOST_INFO_REQUEST, BitStream::new());
        link.queue(
            Message::NetEvent {
                bundle: bundle.as_stream().clone(),
            },
            TransferMode::Ordered,
            true,
        );
        true
    }

    pub fn host_list(&self, network: Network) -> &[NetHost] {
        self.host_lists
            .get(&network)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    //
    // Tick
    //

    /// Runs one net tick: drains the transport, advances handshakes and
    /// pings, observes replica channels, serializes outgoing frames under the
    /// bandwidth budget, and queues events for the application.
    pub fn update(&mut self, dt: f32) {
        let now = self.now();
        self.receive_datagrams(now);
        self.update_link_timeouts(now);
        self.update_pings(now);
        self.observe_replicas(now, dt);
        self.publish_host_records(now);
        if self.config.role == Role::MasterServer {
            self.directory.expire(now);
        }
        self.flush_links(now);
        self.reap_dying_links();
    }

    fn receive_datagrams(&mut self, now: f32) {
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, from)) => {
                    let data = self.recv_buffer[..size].to_vec();
                    self.handle_datagram(&data, from, now);
                }
                Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => {
                    log::warn!("socket receive failed: {error}");
                    break;
                }
            }
        }
    }

    fn handle_datagram(&mut self, data: &[u8], from: SocketAddr, now: f32) {
        if self.links.contains_key(&from) {
            self.handle_link_datagram(data, from, now);
            return;
        }

        // Unknown sender: either a connect attempt or connectionless
        // discovery traffic.
        let messages = parse_standalone(data);
        let is_connect = messages
            .iter()
            .any(|message| matches!(message, Message::ConnectRequest { .. }));
        if is_connect {
            if self.config.role != Role::Server || self.links.len() >= self.config.max_links {
                return;
            }
            let mut link = PeerLink::new(from, LinkDirection::Incoming, now);
            link.set_attempt_timeout(self.config.attempt_timeout);
            self.links.insert(from, link);
            self.events
                .push_back(NetPeerEvent::LinkConnecting { address: from });
            self.handle_link_datagram(data, from, now);
            return;
        }
        for message in messages {
            self.handle_connectionless(message, from, now);
        }
    }

    fn handle_link_datagram(&mut self, data: &[u8], from: SocketAddr, now: f32) {
        let Some(link) = self.links.get_mut(&from) else {
            return;
        };
        match link.receive_packet(data, now) {
            Ok(messages) => {
                for message in messages {
                    self.handle_link_message(message, from, now);
                }
            }
            Err(reason) => {
                self.events.push_back(NetPeerEvent::ProtocolError { address: from });
                self.events.push_back(NetPeerEvent::LinkDisconnected {
                    address: from,
                    reason,
                });
                self.dying_links.push(from);
            }
        }
    }

    fn handle_link_message(&mut self, message: Message, from: SocketAddr, now: f32) {
        match message {
            Message::ConnectRequest { bundle, .. } => self.on_connect_request(bundle, from),
            Message::ConnectResponse {
                response,
                net_peer_id,
                bundle,
            } => self.on_connect_response(response, net_peer_id, bundle, from),
            Message::ConnectConfirmation => {
                if let Some(link) = self.links.get_mut(&from) {
                    let transition = link.advance(&LinkEvent::ConfirmationReceived);
                    if transition.connected {
                        let remote_peer_id = link.remote_peer_id();
                        self.events.push_back(NetPeerEvent::LinkConnected {
                            address: from,
                            remote_peer_id,
                        });
                        // A freshly confirmed subscriber receives the whole
                        // live replica set.
                        self.sync_replicas_to_link(from, now);
                    }
                }
            }
            Message::DisconnectNotice { .. } => {
                if let Some(link) = self.links.get_mut(&from) {
                    let transition = link.advance(&LinkEvent::DisconnectReceived);
                    if let Some(reason) = transition.disconnected {
                        let remote = link.remote_peer_id();
                        if self.is_server() && remote.is_valid() {
                            self.peer_ids.release(remote.0);
                        }
                        self.events.push_back(NetPeerEvent::LinkDisconnected {
                            address: from,
                            reason,
                        });
                        self.dying_links.push(from);
                    }
                }
            }
            Message::NetEvent { bundle } => {
                let mut bundle = EventBundle::from_stream(bundle);
                // Reserved events implement the extra-host-info exchange; the
                // rest surface to the application.
                if bundle.get(EXTRA_HOST_INFO_REQUEST).is_some() {
                    let mut reply = EventBundle::new();
                    reply.add(EXTRA_HOST_INFO_REPLY, self.extra_host_info.clone());
                    if let Some(link) = self.links.get_mut(&from) {
                        link.queue(
                            Message::NetEvent {
                                bundle: reply.as_stream().clone(),
                            },
                            TransferMode::Ordered,
                            true,
                        );
                    }
                } else if let Some(event) = bundle.get(EXTRA_HOST_INFO_REPLY) {
                    let info = event.data.clone();
                    self.upsert_host(NetHost {
                        network: Network::Internet,
                        address: from,
                        round_trip_time: self
                            .links
                            .get(&from)
                            .map(|link| link.rtt_seconds())
                            .unwrap_or(0.0),
                        basic_host_info: info,
                    });
                    self.events.push_back(NetPeerEvent::HostRefreshCompleted {
                        address: from,
                        result: RefreshResult::ExtraHostInfo,
                    });
                } else {
                    self.events
                        .push_back(NetPeerEvent::EventReceived { from, bundle });
                }
            }
            Message::UserAddRequest { bundle } => self.on_user_add_request(bundle, from),
            Message::UserAddResponse {
                response,
                net_user_id,
                bundle,
            } => self.on_user_add_response(response, net_user_id, bundle, from),
            Message::UserRemoveRequest { net_user_id, .. } => {
                if self.is_server() && self.users.remove(&net_user_id).is_some() {
                    self.user_ids.release(net_user_id.0);
                    self.events
                        .push_back(NetPeerEvent::UserOffline { user_id: net_user_id });
                }
            }
            Message::LevelLoadStarted {
                net_space_id,
                level_resource_id,
            } => self.events.push_back(NetPeerEvent::LevelLoadStarted {
                net_space_id,
                level_resource_id,
            }),
            Message::LevelLoadFinished { net_space_id } => self
                .events
                .push_back(NetPeerEvent::LevelLoadFinished { net_space_id }),
            Message::GameLoadStarted => self
                .events
                .push_back(NetPeerEvent::GameLoadStarted { from }),
            Message::GameLoadFinished => self
                .events
                .push_back(NetPeerEvent::GameLoadFinished { from }),
            Message::CreateReplica { .. } | Message::EmplaceReplica { .. } => {
                self.on_replica_creation(message, now)
            }
            Message::ReplicaOffline {
                net_object_id,
                channel_data,
            } => self.on_replica_offline(net_object_id, channel_data, now),
            Message::ForgetReplica { net_object_id } => {
                self.finalize_replica(net_object_id, false);
            }
            Message::DestroyReplica { net_object_id } => {
                self.finalize_replica(net_object_id, true);
            }
            Message::ChannelData {
                net_object_id,
                channel_index,
                data,
            } => self.on_channel_data(net_object_id, channel_index, data, from, now),
            // Discovery messages are valid over links too.
            other => self.handle_connectionless(other, from, now),
        }
    }

    fn on_connect_request(&mut self, bundle: BitStream, from: SocketAddr) {
        if !self.is_server() {
            return;
        }
        let Some(link) = self.links.get_mut(&from) else {
            return;
        };
        if link.state() != LinkState::Unattempted {
            // Handshake replay; the state machine already absorbed it.
            return;
        }
        link.advance(&LinkEvent::RequestReceived);

        let mut request = EventBundle::from_stream(bundle);
        let decision = match self.connect_handler.as_mut() {
            Some(handler) => handler(from, &mut request),
            None => Decision::default(),
        };

        // The net peer id is assigned immediately before the response goes out.
        let assigned = if decision.accept {
            NetPeerId(self.peer_ids.acquire())
        } else {
            NetPeerId::INVALID
        };
        let Some(link) = self.links.get_mut(&from) else {
            return;
        };
        link.set_remote_peer_id(assigned);
        let mut bundle = decision.bundle;
        let transition = link.advance(&LinkEvent::ConnectDecision {
            accept: decision.accept,
            assigned_peer_id: assigned,
            bundle: bundle.as_stream().clone(),
        });
        if let Some(reason) = transition.disconnected {
            self.events.push_back(NetPeerEvent::LinkDisconnected {
                address: from,
                reason,
            });
            self.dying_links.push(from);
        }
    }

    fn on_connect_response(
        &mut self,
        response: ConnectResponse,
        net_peer_id: NetPeerId,
        bundle: BitStream,
        from: SocketAddr,
    ) {
        let Some(link) = self.links.get_mut(&from) else {
            return;
        };
        let transition = link.advance(&LinkEvent::ResponseReceived {
            response,
            net_peer_id,
            bundle: bundle.clone(),
        });
        if let Some(assigned) = transition.assigned_peer_id {
            self.net_peer_id = assigned;
            link.set_remote_peer_id(SERVER_PEER_ID);
        }
        if transition.connected {
            self.events.push_back(NetPeerEvent::LinkConnected {
                address: from,
                remote_peer_id: SERVER_PEER_ID,
            });
            // Flush user add requests queued while we were connecting.
            let pending: Vec<EventBundle> = self.pending_user_requests.iter().cloned().collect();
            for mut request in pending {
                if let Some(link) = self.links.get_mut(&from) {
                    link.queue(
                        Message::UserAddRequest {
                            bundle: request.as_stream().clone(),
                        },
                        TransferMode::Ordered,
                        true,
                    );
                }
            }
        }
        if transition.disconnected == Some(DisconnectReason::Denied) {
            self.events.push_back(NetPeerEvent::ConnectDenied {
                address: from,
                bundle: EventBundle::from_stream(bundle),
            });
            self.events.push_back(NetPeerEvent::LinkDisconnected {
                address: from,
                reason: DisconnectReason::Denied,
            });
            self.dying_links.push(from);
        }
    }

    fn on_user_add_request(&mut self, bundle: BitStream, from: SocketAddr) {
        if !self.is_server() {
            return;
        }
        let owner_peer = self
            .links
            .get(&from)
            .map(|link| link.remote_peer_id())
            .unwrap_or_default();

        // Pre-allocate the id; released again should the request be denied.
        let user_id = NetUserId(self.user_ids.acquire());
        let mut request = EventBundle::from_stream(bundle);
        let decision = match self.user_add_handler.as_mut() {
            Some(handler) => handler(&mut request),
            None => Decision::default(),
        };

        let mut response_bundle = decision.bundle;
        let message = if decision.accept {
            self.users.insert(
                user_id,
                NetUser {
                    id: user_id,
                    owner_peer,
                    added_by_us: false,
                    request_bundle: request,
                },
            );
            self.events.push_back(NetPeerEvent::UserOnline {
                user_id,
                owner_peer,
                added_by_us: false,
            });
            Message::UserAddResponse {
                response: UserAddResponse::Accept,
                net_user_id: user_id,
                bundle: response_bundle.as_stream().clone(),
            }
        } else {
            self.user_ids.release(user_id.0);
            Message::UserAddResponse {
                response: UserAddResponse::Deny,
                net_user_id: NetUserId::INVALID,
                bundle: response_bundle.as_stream().clone(),
            }
        };
        if let Some(link) = self.links.get_mut(&from) {
            link.queue(message, TransferMode::Ordered, true);
        }
    }

    fn on_user_add_response(
        &mut self,
        response: UserAddResponse,
        net_user_id: NetUserId,
        bundle: BitStream,
        _from: SocketAddr,
    ) {
        let request_bundle = self.pending_user_requests.pop_front().unwrap_or_default();
        match response {
            UserAddResponse::Accept => {
                self.users.insert(
                    net_user_id,
                    NetUser {
                        id: net_user_id,
                        owner_peer: self.net_peer_id,
                        added_by_us: true,
                        request_bundle,
                    },
                );
                self.events.push_back(NetPeerEvent::UserOnline {
                    user_id: net_user_id,
                    owner_peer: self.net_peer_id,
                    added_by_us: true,
                });
            }
            UserAddResponse::Deny => {
                self.events.push_back(NetPeerEvent::UserAddDenied {
                    bundle: EventBundle::from_stream(bundle),
                });
            }
        }
    }

    fn on_replica_creation(&mut self, message: Message, now: f32) {
        let (id, parent, owner, channel_data, replica) = match message {
            Message::CreateReplica {
                family_tree_id,
                net_object_id,
                create_context,
                replica_type,
                parent,
                owner,
                channel_data,
            } => {
                let Some(factory) = self.replica_factory.as_mut() else {
                    log::warn!("no replica factory registered; dropping creation");
                    return;
                };
                let mut replica = factory(create_context, replica_type);
                replica.set_family_tree_id(family_tree_id);
                let tree = self
                    .family_trees
                    .entry(family_tree_id)
                    .or_insert_with(|| FamilyTree::new(family_tree_id, create_context, replica_type));
                tree.add(net_object_id);
                (net_object_id, parent, owner, channel_data, replica)
            }
            Message::EmplaceReplica {
                net_object_id,
                emplace_context,
                emplace_id,
                parent,
                owner,
                channel_data,
            } => {
                let Some(replica) = self.emplaced_waiting.remove(&(emplace_context, emplace_id))
                else {
                    log::warn!(
                        "no emplaced replica waiting for ({emplace_context}, {emplace_id})"
                    );
                    return;
                };
                (net_object_id, parent, owner, channel_data, replica)
            }
            _ => return,
        };

        let mut replica = replica;
        if replica.state() == LifecycleState::Invalid {
            replica.register();
        }
        if !replica.make_live(id) {
            log::warn!("replica {id} failed to go live");
            return;
        }
        replica.set_owner(if owner.is_valid() { Some(owner) } else { None });

        // Initial channel values are applied before the online event fires.
        let mut data = channel_data;
        deserialize_lifecycle_channels(&mut replica, &mut data, SerializeReason::Online, now);

        // Parent attachment defers until the parent itself is online.
        if parent.is_valid() {
            if self.replicas.get(&parent).is_some_and(Replica::is_online) {
                replica.set_parent(Some(parent));
            } else {
                self.deferred_attachments.entry(parent).or_default().push(id);
            }
        }

        replica.bring_online(now);
        self.replicas.insert(id, replica);
        self.events.push_back(NetPeerEvent::ReplicaOnline { id });

        // Replay attachments that were waiting on us.
        if let Some(children) = self.deferred_attachments.remove(&id) {
            for child in children {
                if let Some(child_replica) = self.replicas.get_mut(&child) {
                    child_replica.set_parent(Some(id));
                }
            }
        }
    }

    fn on_replica_offline(&mut self, id: NetObjectId, channel_data: BitStream, now: f32) {
        let Some(replica) = self.replicas.get_mut(&id) else {
            return;
        };
        // Final channel state lands before the offline event.
        let mut data = channel_data;
        deserialize_lifecycle_channels(replica, &mut data, SerializeReason::Offline, now);
        if replica.take_offline(now) {
            self.events.push_back(NetPeerEvent::ReplicaOffline { id });
        }
    }

    fn on_channel_data(
        &mut self,
        id: NetObjectId,
        channel_index: u8,
        data: BitStream,
        from: SocketAddr,
        now: f32,
    ) {
        let rtt = self
            .links
            .get(&from)
            .map(|link| link.rtt_seconds())
            .unwrap_or(0.0);
        let estimated = now - rtt * 0.5;

        let Some(replica) = self.replicas.get_mut(&id) else {
            return;
        };
        let Some(channel) = replica.channels_mut().get_mut(channel_index as usize) else {
            return;
        };
        let channel_name = channel.name().to_string();
        let mut payload = data.clone();
        if let Err(error) = channel.deserialize(&mut payload, SerializeReason::Change, estimated) {
            log::warn!("channel data decode failed on {id}/{channel_name}: {error}");
            return;
        }
        let allow_relay = channel.config().allow_relay;
        let authority = channel.authority();
        let transfer = channel.config().transfer_mode;
        let reliable = channel.config().reliability_mode == ReliabilityMode::Reliable
            || transfer == TransferMode::Ordered;

        self.events.push_back(NetPeerEvent::ChannelPropertyChanged {
            id,
            channel: channel_name,
        });

        // The server relays client-authoritative changes to other clients but
        // never echoes them back to the authoring link.
        if self.is_server() && authority == Authority::Client && allow_relay {
            let message = Message::ChannelData {
                net_object_id: id,
                channel_index,
                data,
            };
            for (&address, link) in &mut self.links {
                if link.state() == LinkState::Connected && address != from {
                    link.queue(message.clone(), transfer, reliable);
                }
            }
        }
    }

    fn handle_connectionless(&mut self, message: Message, from: SocketAddr, now: f32) {
        match message {
            Message::HostPing {
                project_guid,
                ping_id,
                send_attempt_id,
                manager_id,
                ..
            } => {
                if project_guid != self.config.project_guid {
                    return;
                }
                match self.config.role {
                    Role::Server => {
                        let message = Message::HostPong {
                            project_guid,
                            ping_id,
                            send_attempt_id,
                            manager_id,
                            bundle: self.basic_host_info.clone(),
                        };
                        self.send_connectionless(from, &message);
                    }
                    Role::MasterServer => {
                        let message = Message::HostRecordList {
                            records: self.directory.records(),
                        };
                        self.send_connectionless(from, &message);
                    }
                    _ => {}
                }
            }
            Message::HostPong {
                project_guid,
                ping_id,
                send_attempt_id,
                manager_id,
                bundle,
            } => {
                let Some(accepted) = self.ping_manager.accept_pong(
                    from,
                    project_guid,
                    ping_id,
                    send_attempt_id,
                    manager_id,
                    now,
                ) else {
                    return;
                };
                self.on_pong_accepted(accepted, bundle, from);
            }
            Message::HostPublish {
                project_guid,
                basic_host_info,
            } => {
                if self.config.role == Role::MasterServer
                    && project_guid == self.config.project_guid
                {
                    self.directory.publish(from, basic_host_info, now);
                }
            }
            Message::HostRecordList { records } => self.on_host_record_list(records),
            Message::RequestHostRefresh {
                project_guid,
                address,
            } => self.on_request_host_refresh(project_guid, address, from),
            Message::HostRefresh {
                address,
                basic_host_info,
            } => self.on_host_refresh(address, basic_host_info, from),
            _ => {}
        }
    }

    fn on_pong_accepted(&mut self, accepted: AcceptedPong, bundle: BitStream, from: SocketAddr) {
        match accepted.kind {
            HostPingKind::DiscoverList | HostPingKind::RefreshList => {
                if accepted.first_response_from_host {
                    let host = NetHost {
                        network: accepted.network,
                        address: from,
                        round_trip_time: accepted.round_trip_time,
                        basic_host_info: bundle,
                    };
                    self.upsert_host(host.clone());
                    self.events.push_back(NetPeerEvent::HostDiscovered { host });
                }
            }
            HostPingKind::SingleRefresh(_) => {
                let host = NetHost {
                    network: accepted.network,
                    address: from,
                    round_trip_time: accepted.round_trip_time,
                    basic_host_info: bundle,
                };
                self.upsert_host(host);
                self.events.push_back(NetPeerEvent::HostRefreshCompleted {
                    address: from,
                    result: RefreshResult::DirectBasicHostInfo,
                });
            }
            HostPingKind::MasterQuery => {}
        }
    }

    fn on_host_record_list(&mut self, records: Vec<HostRecord>) {
        // Record lists answer master queries; the pending pings resolve now.
        self.ping_manager.resolve_master_queries();
        for record in records {
            let host = NetHost {
                network: Network::Internet,
                address: record.address,
                round_trip_time: 0.0,
                basic_host_info: record.basic_host_info,
            };
            self.upsert_host(host.clone());
            self.events.push_back(NetPeerEvent::HostDiscovered { host });
        }
        self.events.push_back(NetPeerEvent::HostListRefreshed {
            network: Network::Internet,
        });
    }

    fn on_request_host_refresh(&mut self, project_guid: u64, address: SocketAddr, from: SocketAddr) {
        if project_guid != self.config.project_guid {
            return;
        }
        match self.config.role {
            // A game server answers with its current basic host info.
            Role::Server => {
                let message = Message::HostRefresh {
                    address: self.local_addr,
                    basic_host_info: self.basic_host_info.clone(),
                };
                self.send_connectionless(from, &message);
            }
            // A master server forwards the request to the host and remembers
            // who asked.
            Role::MasterServer => {
                self.pending_indirect_refreshes
                    .entry(address)
                    .or_default()
                    .push(from);
                let message = Message::RequestHostRefresh {
                    project_guid,
                    address,
                };
                self.send_connectionless(address, &message);
            }
            _ => {}
        }
    }

    fn on_host_refresh(&mut self, address: SocketAddr, basic_host_info: BitStream, from: SocketAddr) {
        if self.config.role == Role::MasterServer {
            // Forward the refreshed info to every waiting requester.
            if let Some(waiting) = self.pending_indirect_refreshes.remove(&from) {
                let message = Message::HostRefresh {
                    address: from,
                    basic_host_info,
                };
                for requester in waiting {
                    self.send_connectionless(requester, &message);
                }
            }
            return;
        }
        let host = NetHost {
            network: Network::Internet,
            address,
            round_trip_time: 0.0,
            basic_host_info,
        };
        self.upsert_host(host);
        self.events.push_back(NetPeerEvent::HostRefreshCompleted {
            address,
            result: RefreshResult::IndirectBasicHostInfo,
        });
    }

    fn upsert_host(&mut self, host: NetHost) {
        let list = self.host_lists.entry(host.network).or_default();
        if let Some(existing) = list.iter_mut().find(|entry| entry.address == host.address) {
            *existing = host;
        } else {
            list.push(host);
        }
    }

    //
    // Per-tick internals
    //

    fn update_link_timeouts(&mut self, now: f32) {
        let mut expired = Vec::new();
        for (&address, link) in &self.links {
            if link.attempt_timed_out(now) {
                expired.push((address, DisconnectReason::Timeout));
            } else if link.state() == LinkState::Connected
                && link.is_timed_out(now, self.config.link_timeout)
            {
                expired.push((address, DisconnectReason::Timeout));
            }
        }
        for (address, reason) in expired {
            if let Some(link) = self.links.get_mut(&address) {
                link.advance(&LinkEvent::AttemptTimedOut);
                let remote = link.remote_peer_id();
                if self.is_server() && remote.is_valid() {
                    self.peer_ids.release(remote.0);
                }
            }
            self.events
                .push_back(NetPeerEvent::LinkDisconnected { address, reason });
            self.dying_links.push(address);
        }
    }

    fn update_pings(&mut self, now: f32) {
        for (message, targets) in self.ping_manager.collect_resends(now) {
            for target in targets {
                self.send_connectionless(target, &message);
            }
        }
        for (_, ping) in self.ping_manager.collect_timeouts(now) {
            match ping.kind {
                HostPingKind::SingleRefresh(address) => {
                    self.events.push_back(NetPeerEvent::HostRefreshCompleted {
                        address,
                        result: RefreshResult::NoResponse,
                    });
                }
                HostPingKind::DiscoverList | HostPingKind::RefreshList => {
                    self.events.push_back(NetPeerEvent::HostListRefreshed {
                        network: ping.network,
                    });
                }
                HostPingKind::MasterQuery => {
                    self.events.push_back(NetPeerEvent::HostListRefreshed {
                        network: Network::Internet,
                    });
                }
            }
        }
    }

    fn observe_replicas(&mut self, now: f32, dt: f32) {
        let is_server = self.is_server();
        let our_peer = self.net_peer_id;

        let mut outgoing: Vec<(Message, TransferMode, bool, Option<NetPeerId>)> = Vec::new();
        for (&id, replica) in &mut self.replicas {
            if !replica.is_online() {
                continue;
            }
            let owner_peer = replica
                .owner()
                .and_then(|user| self.users.get(&user))
                .map(|user| user.owner_peer);
            for (index, channel) in replica.channels_mut().iter_mut().enumerate() {
                let authoritative = match channel.authority() {
                    Authority::Server => is_server,
                    Authority::Client => owner_peer == Some(our_peer) && our_peer.is_valid(),
                };
                if authoritative {
                    let changed = channel.observe(now);
                    if changed && channel.config().replicate_on_change {
                        let mut data = BitStream::new();
                        if channel
                            .serialize(&mut data, SerializeReason::Change, now)
                            .is_ok()
                        {
                            let transfer = channel.config().transfer_mode;
                            // Ordered forces reliable delivery.
                            let reliable = channel.config().reliability_mode
                                == ReliabilityMode::Reliable
                                || transfer == TransferMode::Ordered;
                            let suppress = if is_server
                                && channel.authority() == Authority::Client
                            {
                                owner_peer
                            } else {
                                None
                            };
                            outgoing.push((
                                Message::ChannelData {
                                    net_object_id: id,
                                    channel_index: index as u8,
                                    data,
                                },
                                transfer,
                                reliable,
                                suppress,
                            ));
                        }
                    }
                } else {
                    channel.converge(now, dt);
                }
            }
        }

        for (message, transfer, reliable, suppress) in outgoing {
            for link in self.links.values_mut() {
                if link.state() != LinkState::Connected {
                    continue;
                }
                if Some(link.remote_peer_id()) == suppress {
                    continue;
                }
                link.queue(message.clone(), transfer, reliable);
            }
        }
    }

    fn publish_host_records(&mut self, now: f32) {
        if self.config.role != Role::Server
            || self.config.master_servers.is_empty()
            || now - self.last_publish_time < self.config.host_publish_interval
        {
            return;
        }
        self.last_publish_time = now;
        let message = Message::HostPublish {
            project_guid: self.config.project_guid,
            basic_host_info: self.basic_host_info.clone(),
        };
        for master in self.config.master_servers.clone() {
            self.send_connectionless(master, &message);
        }
    }

    fn flush_links(&mut self, now: f32) {
        let budget = self.config.frame_budget_bytes;
        let mut warnings = Vec::new();
        let mut sends: Vec<(SocketAddr, Vec<Vec<u8>>)> = Vec::new();
        for (&address, link) in &mut self.links {
            let packets = link.build_packets(now, budget);
            if link.take_fill_warning() {
                warnings.push(address);
            }
            if !packets.is_empty() {
                sends.push((address, packets));
            }
        }
        for (address, packets) in sends {
            for packet in packets {
                if let Err(error) = self.socket.send_to(&packet, address) {
                    if error.kind() != io::ErrorKind::WouldBlock {
                        log::warn!("send to {address} failed: {error}");
                    }
                }
            }
        }
        for address in warnings {
            self.events
                .push_back(NetPeerEvent::BandwidthWarning { address });
        }
    }

    fn reap_dying_links(&mut self) {
        for address in std::mem::take(&mut self.dying_links) {
            // Flush any farewell traffic (deny, disconnect notice) first.
            if let Some(mut link) = self.links.remove(&address) {
                let now = self.now();
                for packet in link.build_packets(now, MAX_PACKET_SIZE * 4) {
                    let _ = self.socket.send_to(&packet, address);
                }
            }
        }
    }

    fn send_connectionless(&self, address: SocketAddr, message: &Message) {
        let mut packet = BitStream::new();
        PacketHeader::new(0, 0, 0).write(&mut packet);
        packet.write_u8(1);
        let mut envelope = BitStream::new();
        envelope.write_u16(0);
        envelope.write_uint(0, 2);
        envelope.write_bit(false);
        if message.write(&mut envelope).is_err() {
            log::warn!("connectionless message to {address} too large to encode");
            return;
        }
        packet.append(&envelope);
        if let Err(error) = self.socket.send_to(packet.as_bytes(), address) {
            if error.kind() != io::ErrorKind::WouldBlock {
                log::warn!("send to {address} failed: {error}");
            }
        }
    }
}

/// Builds the creation (or emplacement) announcement for a live replica.
fn creation_message(replica: &Replica, id: NetObjectId, channel_data: BitStream) -> Message {
    match replica.create_source() {
        super::replica::CreateSource::Spawned => Message::CreateReplica {
            family_tree_id: replica.family_tree_id().unwrap_or_default(),
            net_object_id: id,
            create_context: replica.create_context(),
            replica_type: replica.replica_type(),
            parent: replica.parent().unwrap_or_default(),
            owner: replica.owner().unwrap_or_default(),
            channel_data,
        },
        super::replica::CreateSource::Emplaced { context, emplace_id } => {
            Message::EmplaceReplica {
                net_object_id: id,
                emplace_context: context,
                emplace_id,
                parent: replica.parent().unwrap_or_default(),
                owner: replica.owner().unwrap_or_default(),
                channel_data,
            }
        }
    }
}

/// Decodes a datagram from an unknown sender without link state.
fn parse_standalone(data: &[u8]) -> Vec<Message> {
    let mut stream = BitStream::from_bytes(data);
    let Ok(header) = PacketHeader::read(&mut stream) else {
        return Vec::new();
    };
    if !header.is_valid() {
        return Vec::new();
    }
    let Ok(count) = stream.read_u8() else {
        return Vec::new();
    };
    let mut messages = Vec::new();
    for _ in 0..count {
        // Envelope prefix: sequence, transfer mode, reliable flag.
        if stream.read_u16().is_err() || stream.read_uint(2).is_err() || stream.read_bit().is_err()
        {
            break;
        }
        match Message::read(&mut stream) {
            Ok(message) => messages.push(message),
            Err(_) => break,
        }
    }
    messages
}

/// Serializes every channel flagged for the given lifecycle moment, in
/// channel order, into one stream.
fn serialize_lifecycle_channels(
    replica: &mut Replica,
    reason: SerializeReason,
    now: f32,
) -> BitStream {
    let mut data = BitStream::new();
    for channel in replica.channels_mut() {
        let include = match reason {
            SerializeReason::Online => channel.config().replicate_on_online,
            SerializeReason::Offline => channel.config().replicate_on_offline,
            SerializeReason::Change => true,
        };
        if include {
            if let Err(error) = channel.serialize(&mut data, reason, now) {
                log::warn!("channel {} failed to serialize: {error}", channel.name());
            }
        }
    }
    data
}

fn deserialize_lifecycle_channels(
    replica: &mut Replica,
    data: &mut BitStream,
    reason: SerializeReason,
    now: f32,
) {
    for channel in replica.channels_mut() {
        let include = match reason {
            SerializeReason::Online => channel.config().replicate_on_online,
            SerializeReason::Offline => channel.config().replicate_on_offline,
            SerializeReason::Change => true,
        };
        if include {
            if let Err(error) = channel.deserialize(data, reason, now) {
                log::warn!("channel {} failed to deserialize: {error}", channel.name());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_store_reuses_released_ids() {
        let mut store = IdStore::starting_at(1);
        let a = store.acquire();
        let b = store.acquire();
        assert_eq!((a, b), (1, 2));
        store.release(a);
        assert_eq!(store.acquire(), 1);
        assert_eq!(store.acquire(), 3);
    }

    #[test]
    fn open_retries_adjacent_ports() {
        let config = PeerConfig {
            role: Role::Server,
            ..Default::default()
        };
        let first = NetPeer::open(config.clone(), "127.0.0.1".parse().unwrap(), (46100, 46105))
            .unwrap();
        // The first port is taken; the second open lands on the next one.
        let second = NetPeer::open(config, "127.0.0.1".parse().unwrap(), (46100, 46105)).unwrap();
        assert_ne!(first.local_addr().port(), second.local_addr().port());
        assert!(second.local_addr().port() <= 46105);
    }

    #[test]
    fn server_assigns_itself_the_reserved_peer_id() {
        let config = PeerConfig {
            role: Role::Server,
            ..Default::default()
        };
        let peer = NetPeer::open(config, "127.0.0.1".parse().unwrap(), (0, 0)).unwrap();
        assert_eq!(peer.net_peer_id(), SERVER_PEER_ID);
    }
}
