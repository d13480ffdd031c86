use std::fmt;

use super::channel::{Authority, ReplicaChannel};

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub u32);

        impl $name {
            pub const INVALID: $name = $name(0);

            pub fn is_valid(self) -> bool {
                self.0 != 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identifies a replica across all peers. Assigned by the server.
    NetObjectId
);
id_type!(
    /// Identifies a peer within the graph. Assigned by the server on connect.
    NetPeerId
);
id_type!(
    /// Identifies an added user. Assigned by the server on user add.
    NetUserId
);
id_type!(
    /// Identifies a family tree of archetype-derived replicas.
    FamilyTreeId
);

/// How a replica came to exist on this peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateSource {
    /// Spawned from its replica type and delivered through a family tree.
    Spawned,
    /// Pre-authored in the level and matched by (emplace context, emplace id).
    Emplaced { context: u64, emplace_id: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    /// Not yet registered with a peer.
    Invalid,
    /// Registered, id pending.
    Valid,
    /// Assigned a net object id by the server.
    Live,
    /// Created or emplaced everywhere, channels primed.
    Online,
    /// Taken offline; terminal alongside forget and destroy.
    Offline,
}

/// A networked entity: identity, owner, channel set, and lifecycle.
#[derive(Debug, Clone)]
pub struct Replica {
    net_object_id: NetObjectId,
    family_tree_id: Option<FamilyTreeId>,
    create_source: CreateSource,
    /// The space (or other container) this replica was created in.
    create_context: u64,
    /// The archetype resource this replica was derived from.
    replica_type: u64,
    owner: Option<NetUserId>,
    parent: Option<NetObjectId>,
    channels: Vec<ReplicaChannel>,
    state: LifecycleState,
    online_timestamp: f32,
    offline_timestamp: f32,
}

impl Replica {
    pub fn new(create_context: u64, replica_type: u64) -> Self {
        Self {
            net_object_id: NetObjectId::INVALID,
            family_tree_id: None,
            create_source: CreateSource::Spawned,
            create_context,
            replica_type,
            owner: None,
            parent: None,
            channels: Vec::new(),
            state: LifecycleState::Invalid,
            online_timestamp: 0.0,
            offline_timestamp: 0.0,
        }
    }

    pub fn new_emplaced(create_context: u64, replica_type: u64, emplace_id: u32) -> Self {
        let mut replica = Self::new(create_context, replica_type);
        replica.create_source = CreateSource::Emplaced {
            context: create_context,
            emplace_id,
        };
        replica
    }

    pub fn net_object_id(&self) -> NetObjectId {
        self.net_object_id
    }

    pub fn family_tree_id(&self) -> Option<FamilyTreeId> {
        self.family_tree_id
    }

    pub fn set_family_tree_id(&mut self, id: FamilyTreeId) {
        self.family_tree_id = Some(id);
    }

    pub fn create_source(&self) -> CreateSource {
        self.create_source
    }

    pub fn is_emplaced(&self) -> bool {
        matches!(self.create_source, CreateSource::Emplaced { .. })
    }

    pub fn create_context(&self) -> u64 {
        self.create_context
    }

    pub fn replica_type(&self) -> u64 {
        self.replica_type
    }

    pub fn owner(&self) -> Option<NetUserId> {
        self.owner
    }

    pub fn set_owner(&mut self, owner: Option<NetUserId>) {
        self.owner = owner;
    }

    pub fn parent(&self) -> Option<NetObjectId> {
        self.parent
    }

    pub fn set_parent(&mut self, parent: Option<NetObjectId>) {
        self.parent = parent;
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_online(&self) -> bool {
        self.state == LifecycleState::Online
    }

    pub fn online_timestamp(&self) -> f32 {
        self.online_timestamp
    }

    pub fn offline_timestamp(&self) -> f32 {
        self.offline_timestamp
    }

    /// Newest change timestamp across all channels.
    pub fn last_change_timestamp(&self) -> f32 {
        self.channels
            .iter()
            .map(|channel| channel.last_change_timestamp())
            .fold(0.0, f32::max)
    }

    //
    // Channels
    //

    /// Adds a channel. Channels cannot be added once the replica is online;
    /// the channel set must not differ between peers.
    pub fn add_channel(&mut self, channel: ReplicaChannel) -> bool {
        if self.state >= LifecycleState::Online {
            return false;
        }
        if self.channels.iter().any(|c| c.name() == channel.name()) {
            return false;
        }
        self.channels.push(channel);
        true
    }

    pub fn channel(&self, name: &str) -> Option<&ReplicaChannel> {
        self.channels.iter().find(|c| c.name() == name)
    }

    pub fn channel_mut(&mut self, name: &str) -> Option<&mut ReplicaChannel> {
        self.channels.iter_mut().find(|c| c.name() == name)
    }

    pub fn channels(&self) -> &[ReplicaChannel] {
        &self.channels
    }

    pub fn channels_mut(&mut self) -> &mut [ReplicaChannel] {
        &mut self.channels
    }

    /// True when `peer_user` may observe and serialize the named channel:
    /// server authority channels belong to the server, client authority
    /// channels to the replica's owning user.
    pub fn has_channel_authority(&self, channel: &ReplicaChannel, is_server: bool, user: Option<NetUserId>) -> bool {
        match channel.authority() {
            Authority::Server => is_server,
            Authority::Client => is_server || (user.is_some() && user == self.owner),
        }
    }

    //
    // Lifecycle
    //

    /// Invalid -> Valid: registered with a replicator, id pending.
    pub fn register(&mut self) -> bool {
        if self.state != LifecycleState::Invalid {
            return false;
        }
        self.state = LifecycleState::Valid;
        true
    }

    /// Valid -> Live: the server assigned a net object id.
    pub fn make_live(&mut self, id: NetObjectId) -> bool {
        if self.state != LifecycleState::Valid || !id.is_valid() {
            return false;
        }
        self.net_object_id = id;
        self.state = LifecycleState::Live;
        true
    }

    /// Live -> Online. Initial channel state is deserialized by the caller
    /// before this transition so values are set before the online event.
    pub fn bring_online(&mut self, timestamp: f32) -> bool {
        if self.state != LifecycleState::Live {
            return false;
        }
        self.state = LifecycleState::Online;
        self.online_timestamp = timestamp;
        true
    }

    /// Online -> Offline.
    pub fn take_offline(&mut self, timestamp: f32) -> bool {
        if self.state != LifecycleState::Online {
            return false;
        }
        self.state = LifecycleState::Offline;
        self.offline_timestamp = timestamp;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::channel::ChannelConfig;

    #[test]
    fn lifecycle_transitions_in_order() {
        let mut replica = Replica::new(1, 2);
        assert_eq!(replica.state(), LifecycleState::Invalid);
        assert!(!replica.make_live(NetObjectId(5)));

        assert!(replica.register());
        assert!(replica.make_live(NetObjectId(5)));
        assert_eq!(replica.net_object_id(), NetObjectId(5));
        assert!(replica.bring_online(1.0));
        assert!(!replica.bring_online(2.0));
        assert!(replica.take_offline(3.0));
        assert!(!replica.take_offline(4.0));
    }

    #[test]
    fn channels_frozen_once_online() {
        let mut replica = Replica::new(1, 2);
        assert!(replica.add_channel(ReplicaChannel::new("Pose", ChannelConfig::default())));
        assert!(!replica.add_channel(ReplicaChannel::new("Pose", ChannelConfig::default())));

        replica.register();
        replica.make_live(NetObjectId(1));
        replica.bring_online(0.0);
        assert!(!replica.add_channel(ReplicaChannel::new("Other", ChannelConfig::default())));
    }

    #[test]
    fn client_authority_requires_owner() {
        let mut replica = Replica::new(1, 2);
        let mut channel = ReplicaChannel::new("Input", ChannelConfig::default());
        channel.set_authority_unchecked(Authority::Client);
        replica.set_owner(Some(NetUserId(3)));

        assert!(replica.has_channel_authority(&channel, false, Some(NetUserId(3))));
        assert!(!replica.has_channel_authority(&channel, false, Some(NetUserId(4))));
        assert!(replica.has_channel_authority(&channel, true, None));
    }
}
