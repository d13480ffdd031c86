pub mod net;
pub mod physics;
pub mod simulation;

pub use net::{
    Authority, AuthorityMode, BitError, BitStream, ChannelConfig, ConfigError, Decision,
    DetectionMode, DisconnectReason, EventBundle, FamilyTree, FamilyTreeId, HostRecord,
    InterpolationCurve, LifecycleState, LinkState, Message, NetEvent, NetHost, NetObjectId,
    NetPeer, NetPeerEvent, NetPeerId, NetUser, NetUserId, Network, PeerConfig, PropertyConfig,
    RefreshResult, ReliabilityMode, Replica, ReplicaChannel, ReplicaProperty, Role,
    SerializationMode, TransferMode, Variant, VariantKind,
};
pub use physics::{
    Aabb, AddingPolicy, BodyIndex, CastFilter, CastResult, CastResults, Collider, ColliderIndex,
    DynamicState, EffectKind, EffectScope, HeightMapShape, Manifold, Material, NodeIndex,
    PhysicsEffect, PhysicsEvent, PhysicsMesh, PhysicsSpace, Ray, RigidBody, Shape, SpaceConfig,
    SpringSystem, Triangle, WeldJoint,
};
pub use simulation::{SimulationClock, TickLoop};
