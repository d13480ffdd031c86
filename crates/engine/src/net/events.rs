use std::net::SocketAddr;

use super::bundle::EventBundle;
use super::discovery::{NetHost, Network, RefreshResult};
use super::link::DisconnectReason;
use super::replica::{NetObjectId, NetPeerId, NetUserId};

/// Typed events produced by the peer and drained by the host application each
/// net tick. Nothing fails silently; every error class surfaces here.
#[derive(Debug)]
pub enum NetPeerEvent {
    LinkConnecting {
        address: SocketAddr,
    },
    LinkConnected {
        address: SocketAddr,
        remote_peer_id: NetPeerId,
    },
    LinkDisconnected {
        address: SocketAddr,
        reason: DisconnectReason,
    },
    /// The remote denied our connect request; carries their response bundle.
    ConnectDenied {
        address: SocketAddr,
        bundle: EventBundle,
    },
    UserOnline {
        user_id: NetUserId,
        owner_peer: NetPeerId,
        added_by_us: bool,
    },
    UserOffline {
        user_id: NetUserId,
    },
    UserAddDenied {
        bundle: EventBundle,
    },
    ReplicaOnline {
        id: NetObjectId,
    },
    ReplicaOffline {
        id: NetObjectId,
    },
    ReplicaForgotten {
        id: NetObjectId,
    },
    ReplicaDestroyed {
        id: NetObjectId,
    },
    ChannelPropertyChanged {
        id: NetObjectId,
        channel: String,
    },
    LevelLoadStarted {
        net_space_id: NetObjectId,
        level_resource_id: u64,
    },
    LevelLoadFinished {
        net_space_id: NetObjectId,
    },
    GameLoadStarted {
        from: SocketAddr,
    },
    GameLoadFinished {
        from: SocketAddr,
    },
    HostDiscovered {
        host: NetHost,
    },
    HostListRefreshed {
        network: Network,
    },
    HostRefreshCompleted {
        address: SocketAddr,
        result: RefreshResult,
    },
    /// A remote peer dispatched a bundled event to us.
    EventReceived {
        from: SocketAddr,
        bundle: EventBundle,
    },
    /// An outgoing frame crossed the warning fill threshold.
    BandwidthWarning {
        address: SocketAddr,
    },
    ProtocolError {
        address: SocketAddr,
    },
}
