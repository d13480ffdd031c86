use super::bitstream::{BitError, BitStream};
use super::property::ReplicaProperty;

/// Seconds covered by the quantized wire timestamp.
const TIMESTAMP_RANGE: f32 = 4096.0;
const TIMESTAMP_QUANTUM: f32 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectionMode {
    /// Assume something changed every observation.
    Assume,
    /// Only the manual change flag triggers replication.
    Manual,
    /// Compare property values automatically.
    Automatic,
    /// Manual change flag or automatic comparison.
    #[default]
    Manumatic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializationMode {
    All,
    #[default]
    Changed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReliabilityMode {
    #[default]
    Reliable,
    Unreliable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Release as received, including late messages.
    Immediate,
    /// Release as received, discarding late messages.
    Sequenced,
    /// Hold until preceding messages arrive.
    #[default]
    Ordered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Authority {
    #[default]
    Server,
    /// The owning user's peer observes and replicates; the server relays but
    /// never echoes back to the author.
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthorityMode {
    #[default]
    Fixed,
    Dynamic,
}

/// Why a channel is being serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializeReason {
    Online,
    Change,
    Offline,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub detect_outgoing_changes: bool,
    pub accept_incoming_changes: bool,
    pub authority_mode: AuthorityMode,
    pub authority_default: Authority,
    pub allow_relay: bool,
    pub allow_napping: bool,
    /// Frames after the last change during which the channel stays awake.
    pub awake_duration: u32,
    pub detection_mode: DetectionMode,
    pub awake_detection_interval: u32,
    pub nap_detection_interval: u32,
    pub replicate_on_online: bool,
    pub replicate_on_change: bool,
    pub replicate_on_offline: bool,
    pub serialization_mode: SerializationMode,
    pub reliability_mode: ReliabilityMode,
    pub transfer_mode: TransferMode,
    pub accurate_timestamp_on_change: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            detect_outgoing_changes: true,
            accept_incoming_changes: true,
            authority_mode: AuthorityMode::Fixed,
            authority_default: Authority::Server,
            allow_relay: true,
            allow_napping: true,
            awake_duration: 10,
            detection_mode: DetectionMode::Manumatic,
            awake_detection_interval: 1,
            nap_detection_interval: 2,
            replicate_on_online: true,
            replicate_on_change: true,
            replicate_on_offline: true,
            serialization_mode: SerializationMode::Changed,
            reliability_mode: ReliabilityMode::Reliable,
            transfer_mode: TransferMode::Ordered,
            accurate_timestamp_on_change: false,
        }
    }
}

/// An ordered set of properties replicated together under one reliability and
/// transfer policy.
#[derive(Debug, Clone)]
pub struct ReplicaChannel {
    name: String,
    config: ChannelConfig,
    authority: Authority,
    properties: Vec<ReplicaProperty>,
    pending_changes: Vec<bool>,
    napping: bool,
    frames_since_change: u32,
    frames_since_observation: u32,
    change_flag: bool,
    last_change_timestamp: f32,
}

impl ReplicaChannel {
    pub fn new(name: impl Into<String>, config: ChannelConfig) -> Self {
        let authority = config.authority_default;
        Self {
            name: name.into(),
            config,
            authority,
            properties: Vec::new(),
            pending_changes: Vec::new(),
            napping: false,
            frames_since_change: 0,
            frames_since_observation: 0,
            change_flag: false,
            last_change_timestamp: 0.0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn authority(&self) -> Authority {
        self.authority
    }

    /// Changing authority after construction is only legal in dynamic
    /// authority mode; callers gate on the replica being offline otherwise.
    pub fn set_authority(&mut self, authority: Authority) -> bool {
        if self.config.authority_mode == AuthorityMode::Fixed && authority != self.authority {
            return false;
        }
        self.authority = authority;
        true
    }

    /// Forces authority during pre-online setup regardless of mode.
    pub fn set_authority_unchecked(&mut self, authority: Authority) {
        self.authority = authority;
    }

    /// Adds a property. Returns false if one of that name already exists.
    pub fn add_property(&mut self, property: ReplicaProperty) -> bool {
        if self.properties.iter().any(|p| p.name() == property.name()) {
            return false;
        }
        self.properties.push(property);
        self.pending_changes.push(false);
        true
    }

    pub fn property(&self, name: &str) -> Option<&ReplicaProperty> {
        self.properties.iter().find(|p| p.name() == name)
    }

    pub fn property_mut(&mut self, name: &str) -> Option<&mut ReplicaProperty> {
        self.properties.iter_mut().find(|p| p.name() == name)
    }

    pub fn properties(&self) -> &[ReplicaProperty] {
        &self.properties
    }

    pub fn is_napping(&self) -> bool {
        self.napping
    }

    pub fn wake_up(&mut self) {
        self.napping = false;
        self.frames_since_change = 0;
    }

    pub fn take_nap(&mut self) {
        self.napping = true;
    }

    pub fn set_change_flag(&mut self, flag: bool) {
        self.change_flag = flag;
    }

    pub fn change_flag(&self) -> bool {
        self.change_flag
    }

    pub fn last_change_timestamp(&self) -> f32 {
        self.last_change_timestamp
    }

    fn detection_interval(&self) -> u32 {
        if self.napping {
            self.config.nap_detection_interval
        } else {
            self.config.awake_detection_interval
        }
    }

    /// Runs one frame of change observation on the authoritative peer.
    /// Returns true when changes were detected this frame.
    pub fn observe(&mut self, timestamp: f32) -> bool {
        if !self.config.detect_outgoing_changes {
            return false;
        }

        self.frames_since_observation += 1;
        if self.frames_since_observation < self.detection_interval().max(1) {
            return false;
        }
        self.frames_since_observation = 0;

        let automatic = matches!(
            self.config.detection_mode,
            DetectionMode::Automatic | DetectionMode::Manumatic
        );
        let manual = matches!(
            self.config.detection_mode,
            DetectionMode::Manual | DetectionMode::Manumatic
        );

        let mut changed = matches!(self.config.detection_mode, DetectionMode::Assume);
        changed |= manual && self.change_flag;
        for (index, property) in self.properties.iter().enumerate() {
            let property_changed = if automatic {
                property.has_changed()
            } else {
                changed
            };
            self.pending_changes[index] = property_changed || (manual && self.change_flag);
            changed |= property_changed;
        }

        if changed {
            self.change_flag = false;
            self.frames_since_change = 0;
            self.napping = false;
            self.last_change_timestamp = timestamp;
            for (index, property) in self.properties.iter_mut().enumerate() {
                if self.pending_changes[index] {
                    property.mark_observed(timestamp);
                }
            }
        } else {
            self.frames_since_change = self.frames_since_change.saturating_add(1);
            if self.config.allow_napping && self.frames_since_change >= self.config.awake_duration {
                self.napping = true;
            }
        }

        changed
    }

    /// Serializes the channel. Online and offline replication always carry
    /// every property; change replication honors the serialization mode,
    /// prefixing one presence bit per property in changed mode.
    pub fn serialize(
        &mut self,
        stream: &mut BitStream,
        reason: SerializeReason,
        timestamp: f32,
    ) -> Result<(), BitError> {
        let accurate = self.config.accurate_timestamp_on_change;
        stream.write_bit(accurate);
        if accurate {
            stream.write_quantized_f32(
                timestamp.rem_euclid(TIMESTAMP_RANGE),
                0.0,
                TIMESTAMP_RANGE,
                TIMESTAMP_QUANTUM,
            )?;
        }

        let changed_only =
            reason == SerializeReason::Change && self.config.serialization_mode == SerializationMode::Changed;
        if changed_only {
            for &pending in &self.pending_changes {
                stream.write_bit(pending);
            }
            for (index, property) in self.properties.iter().enumerate() {
                if self.pending_changes[index] {
                    property.serialize(stream)?;
                }
            }
        } else {
            for property in &self.properties {
                property.serialize(stream)?;
            }
        }

        if reason == SerializeReason::Change {
            self.pending_changes.iter_mut().for_each(|p| *p = false);
        }
        Ok(())
    }

    /// Deserializes a received channel payload. `estimated_timestamp` is used
    /// when the author did not serialize an accurate one (typically now minus
    /// half the link round trip).
    pub fn deserialize(
        &mut self,
        stream: &mut BitStream,
        reason: SerializeReason,
        estimated_timestamp: f32,
    ) -> Result<(), BitError> {
        let accurate = stream.read_bit()?;
        let timestamp = if accurate {
            stream.read_quantized_f32(0.0, TIMESTAMP_RANGE, TIMESTAMP_QUANTUM)?
        } else {
            estimated_timestamp
        };

        let changed_only =
            reason == SerializeReason::Change && self.config.serialization_mode == SerializationMode::Changed;
        let mut present = vec![true; self.properties.len()];
        if changed_only {
            for slot in &mut present {
                *slot = stream.read_bit()?;
            }
        }

        let accept = self.config.accept_incoming_changes;
        for (index, property) in self.properties.iter_mut().enumerate() {
            if !present[index] {
                continue;
            }
            if accept {
                property.deserialize(stream, timestamp)?;
            } else {
                // The bits must still be consumed to keep the message framed.
                let mut discard = property.clone();
                discard.deserialize(stream, timestamp)?;
            }
        }
        if accept {
            self.last_change_timestamp = timestamp;
        }
        Ok(())
    }

    /// Runs interpolation/convergence for every property on a receiving peer.
    pub fn converge(&mut self, now: f32, dt: f32) {
        for property in &mut self.properties {
            property.converge(now, dt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::property::PropertyConfig;
    use crate::net::variant::Variant;
    use glam::Vec3;

    fn pose_channel(config: ChannelConfig) -> ReplicaChannel {
        let mut channel = ReplicaChannel::new("Pose", config);
        channel.add_property(
            ReplicaProperty::new(
                "Position",
                Variant::Real3(Vec3::ZERO),
                PropertyConfig::default(),
            )
            .unwrap(),
        );
        channel.add_property(
            ReplicaProperty::new("Health", Variant::Int(100), PropertyConfig::default()).unwrap(),
        );
        channel
    }

    #[test]
    fn naps_after_awake_duration_and_wakes_on_change() {
        let config = ChannelConfig {
            detection_mode: DetectionMode::Automatic,
            awake_duration: 3,
            ..Default::default()
        };
        let mut channel = pose_channel(config);

        for frame in 0..3 {
            assert!(!channel.observe(frame as f32), "frame {frame}");
        }
        assert!(channel.is_napping());

        // A napping channel observes on the longer interval: first frame is
        // skipped, second detects.
        channel
            .property_mut("Health")
            .unwrap()
            .set(Variant::Int(50));
        assert!(!channel.observe(4.0));
        assert!(channel.observe(5.0));
        assert!(!channel.is_napping());
    }

    #[test]
    fn changed_mode_round_trip_only_sends_changed() {
        let mut sender = pose_channel(ChannelConfig::default());
        let mut receiver = pose_channel(ChannelConfig::default());

        sender
            .property_mut("Position")
            .unwrap()
            .set(Variant::Real3(Vec3::new(1.0, 2.0, 3.0)));
        assert!(sender.observe(1.0));

        let mut stream = BitStream::new();
        sender
            .serialize(&mut stream, SerializeReason::Change, 1.0)
            .unwrap();
        receiver
            .deserialize(&mut stream, SerializeReason::Change, 1.0)
            .unwrap();
        assert_eq!(stream.bits_remaining(), 0);

        assert_eq!(
            receiver.property("Position").unwrap().get(),
            &Variant::Real3(Vec3::new(1.0, 2.0, 3.0))
        );
        assert_eq!(receiver.property("Health").unwrap().get(), &Variant::Int(100));
    }

    #[test]
    fn online_replication_carries_all_properties() {
        let mut sender = pose_channel(ChannelConfig::default());
        let mut receiver = pose_channel(ChannelConfig::default());
        sender.property_mut("Health").unwrap().set(Variant::Int(7));

        let mut stream = BitStream::new();
        sender
            .serialize(&mut stream, SerializeReason::Online, 0.0)
            .unwrap();
        receiver
            .deserialize(&mut stream, SerializeReason::Online, 0.0)
            .unwrap();
        assert_eq!(receiver.property("Health").unwrap().get(), &Variant::Int(7));
    }

    #[test]
    fn accurate_timestamp_is_carried() {
        let config = ChannelConfig {
            accurate_timestamp_on_change: true,
            ..Default::default()
        };
        let mut sender = pose_channel(config.clone());
        let mut receiver = pose_channel(config);

        sender
            .property_mut("Position")
            .unwrap()
            .set(Variant::Real3(Vec3::ONE));
        sender.observe(12.5);

        let mut stream = BitStream::new();
        sender
            .serialize(&mut stream, SerializeReason::Change, 12.5)
            .unwrap();
        receiver
            .deserialize(&mut stream, SerializeReason::Change, 99.0)
            .unwrap();
        assert!((receiver.last_change_timestamp() - 12.5).abs() < 0.001);
    }

    #[test]
    fn fixed_authority_rejects_change() {
        let mut channel = pose_channel(ChannelConfig::default());
        assert!(!channel.set_authority(Authority::Client));
        let mut dynamic = pose_channel(ChannelConfig {
            authority_mode: AuthorityMode::Dynamic,
            ..Default::default()
        });
        assert!(dynamic.set_authority(Authority::Client));
    }
}
