pub mod bitstream;
pub mod bundle;
pub mod channel;
pub mod discovery;
pub mod events;
pub mod family;
pub mod link;
pub mod message;
pub mod peer;
pub mod property;
pub mod replica;
pub mod variant;

pub use bitstream::{BitError, BitStream, bits_to_represent};
pub use bundle::{EventBundle, NetEvent};
pub use channel::{
    Authority, AuthorityMode, ChannelConfig, DetectionMode, ReliabilityMode, ReplicaChannel,
    SerializationMode, SerializeReason, TransferMode,
};
pub use discovery::{
    HostDirectory, HostPingKind, NetHost, Network, PendingHostPing, PingManager, RefreshResult,
};
pub use events::NetPeerEvent;
pub use family::FamilyTree;
pub use link::{
    DisconnectReason, LinkDirection, LinkState, MAX_PACKET_SIZE, PeerLink, PROTOCOL_VERSION,
};
pub use message::{ConnectResponse, HostRecord, Message, UserAddResponse};
pub use peer::{Decision, NetPeer, NetUser, PeerConfig, Role};
pub use property::{ConfigError, InterpolationCurve, PropertyConfig, ReplicaProperty};
pub use replica::{
    CreateSource, FamilyTreeId, LifecycleState, NetObjectId, NetPeerId, NetUserId, Replica,
};
pub use variant::{ValueEncoding, Variant, VariantKind};
