use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use super::bitstream::{BitError, BitStream};
use super::channel::TransferMode;
use super::message::{ConnectResponse, Message};
use super::replica::{NetObjectId, NetPeerId};

pub const MAX_PACKET_SIZE: usize = 1200;
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x54455448;

/// Fraction of the frame budget past which no further messages are packed.
pub const FRAME_FILL_SKIP: f32 = 0.9;
/// Fraction of the frame budget past which a warning event is raised.
pub const FRAME_FILL_WARNING: f32 = 0.8;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;
const PROTOCOL_STRIKE_LIMIT: u32 = 3;
const DEFAULT_ATTEMPT_TIMEOUT: f32 = 10.0;

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[inline]
fn sequence16_greater_than(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 <= u16::MAX / 2)) || ((s1 < s2) && (s2 - s1 > u16::MAX / 2))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub magic: u32,
    pub version: u32,
    pub sequence: u32,
    pub ack: u32,
    pub ack_bitfield: u32,
}

impl PacketHeader {
    pub fn new(sequence: u32, ack: u32, ack_bitfield: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            sequence,
            ack,
            ack_bitfield,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }

    pub fn write(&self, stream: &mut BitStream) {
        stream.write_u32(self.magic);
        stream.write_u32(self.version);
        stream.write_u32(self.sequence);
        stream.write_u32(self.ack);
        stream.write_u32(self.ack_bitfield);
    }

    pub fn read(stream: &mut BitStream) -> Result<Self, BitError> {
        Ok(Self {
            magic: stream.read_u32()?,
            version: stream.read_u32()?,
            sequence: stream.read_u32()?,
            ack: stream.read_u32()?,
            ack_bitfield: stream.read_u32()?,
        })
    }
}

/// Which transfer channel a message is ordered within. Derived from the
/// message itself so both sides agree without negotiating ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKey {
    Control,
    Replica(NetObjectId, u8),
}

fn channel_key(message: &Message) -> ChannelKey {
    match message {
        Message::ChannelData {
            net_object_id,
            channel_index,
            ..
        } => ChannelKey::Replica(*net_object_id, *channel_index),
        _ => ChannelKey::Control,
    }
}

/// One queued message plus its delivery policy.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sequence: u16,
    pub transfer: TransferMode,
    pub reliable: bool,
    pub message: Message,
}

impl Envelope {
    fn write(&self, stream: &mut BitStream) -> Result<(), BitError> {
        stream.write_u16(self.sequence);
        stream.write_uint(
            match self.transfer {
                TransferMode::Immediate => 0,
                TransferMode::Sequenced => 1,
                TransferMode::Ordered => 2,
            },
            2,
        );
        stream.write_bit(self.reliable);
        self.message.write(stream)
    }

    fn read(stream: &mut BitStream) -> Result<Self, BitError> {
        let sequence = stream.read_u16()?;
        let transfer = match stream.read_uint(2)? {
            0 => TransferMode::Immediate,
            1 => TransferMode::Sequenced,
            _ => TransferMode::Ordered,
        };
        let reliable = stream.read_bit()?;
        let message = Message::read(stream)?;
        Ok(Self {
            sequence,
            transfer,
            reliable,
            message,
        })
    }
}

#[derive(Debug, Clone)]
struct PendingPacket {
    sequence: u32,
    send_time: f32,
    acked: bool,
    reliable: Vec<Envelope>,
}

/// Tracks sent packets awaiting acknowledgement, estimates the round trip,
/// and surfaces reliable payloads from packets deemed lost.
#[derive(Debug)]
pub struct AckTracker {
    pending: VecDeque<PendingPacket>,
    max_pending: usize,
    srtt: f32,
    rtt_var: f32,
}

impl AckTracker {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(max_pending),
            max_pending,
            srtt: 100.0,
            rtt_var: 50.0,
        }
    }

    pub fn track_packet(&mut self, sequence: u32, send_time: f32, reliable: Vec<Envelope>) {
        while self.pending.len() >= self.max_pending {
            self.pending.pop_front();
        }
        self.pending.push_back(PendingPacket {
            sequence,
            send_time,
            acked: false,
            reliable,
        });
    }

    pub fn process_ack(&mut self, ack: u32, ack_bitfield: u32, now: f32) {
        let mut rtt_samples = Vec::new();
        for pending in &mut self.pending {
            if pending.acked {
                continue;
            }
            let is_acked = if pending.sequence == ack {
                true
            } else if sequence_greater_than(ack, pending.sequence) {
                let diff = ack.wrapping_sub(pending.sequence);
                diff <= 32 && (ack_bitfield & (1 << (diff - 1))) != 0
            } else {
                false
            };
            if is_acked {
                pending.acked = true;
                pending.reliable.clear();
                rtt_samples.push((now - pending.send_time) * 1000.0);
            }
        }
        for rtt in rtt_samples {
            self.update_rtt(rtt);
        }
        while self.pending.front().is_some_and(|p| p.acked) {
            self.pending.pop_front();
        }
    }

    /// Drains reliable envelopes from packets unacked past the retransmission
    /// timeout so the caller can requeue them.
    pub fn take_lost(&mut self, now: f32) -> Vec<Envelope> {
        let rto_seconds = ((self.srtt + 4.0 * self.rtt_var) / 1000.0).max(0.05);
        let mut lost = Vec::new();
        for pending in &mut self.pending {
            if !pending.acked && now - pending.send_time > rto_seconds {
                lost.append(&mut pending.reliable);
                pending.acked = true;
            }
        }
        while self.pending.front().is_some_and(|p| p.acked) {
            self.pending.pop_front();
        }
        lost
    }

    fn update_rtt(&mut self, rtt: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;
        let diff = (rtt - self.srtt).abs();
        self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn unacked_count(&self) -> usize {
        self.pending.iter().filter(|p| !p.acked).count()
    }
}

/// Tracks received packet sequences for duplicate rejection and builds the
/// ack + bitfield pair echoed in outgoing headers.
#[derive(Debug, Default)]
pub struct ReceiveTracker {
    last_received: u32,
    received_bitfield: u32,
    seen_any: bool,
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false for duplicates.
    pub fn record_received(&mut self, sequence: u32) -> bool {
        if !self.seen_any {
            self.seen_any = true;
            self.last_received = sequence;
            self.received_bitfield = 0;
            return true;
        }
        if sequence == self.last_received {
            return false;
        }
        if sequence_greater_than(sequence, self.last_received) {
            let diff = sequence.wrapping_sub(self.last_received);
            if diff <= 32 {
                self.received_bitfield = (self.received_bitfield << diff) | (1 << (diff - 1));
            } else {
                self.received_bitfield = 0;
            }
            self.last_received = sequence;
            true
        } else {
            let diff = self.last_received.wrapping_sub(sequence);
            if diff > 32 {
                return false;
            }
            let mask = 1 << (diff - 1);
            if self.received_bitfield & mask != 0 {
                return false;
            }
            self.received_bitfield |= mask;
            true
        }
    }

    pub fn ack_data(&self) -> (u32, u32) {
        (self.last_received, self.received_bitfield)
    }
}

//
// Handshake state machine
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Unattempted,
    AttemptingConnect,
    Connected,
    Disconnecting,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    /// We initiated the connection.
    Outgoing,
    /// The remote peer initiated.
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Request,
    Timeout,
    Denied,
    ProtocolError,
}

/// An input to the handshake state machine.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Local intent to connect (client side).
    ConnectIntent {
        pending_user_adds: u32,
        bundle: BitStream,
    },
    /// A connect request arrived on a fresh incoming link (server side).
    RequestReceived,
    /// The application decided on a received request (server side).
    ConnectDecision {
        accept: bool,
        assigned_peer_id: NetPeerId,
        bundle: BitStream,
    },
    ResponseReceived {
        response: ConnectResponse,
        net_peer_id: NetPeerId,
        bundle: BitStream,
    },
    ConfirmationReceived,
    DisconnectIntent {
        bundle: BitStream,
    },
    DisconnectReceived,
    AttemptTimedOut,
}

/// The output of one handshake step: the next state, messages to send, and
/// whether the link just connected or disconnected.
#[derive(Debug, Default)]
pub struct Transition {
    pub send: Vec<Message>,
    pub connected: bool,
    pub disconnected: Option<DisconnectReason>,
    pub assigned_peer_id: Option<NetPeerId>,
}

/// Advances the handshake. Pure: replaying an event in a state it does not
/// apply to leaves the state unchanged, making every step idempotent.
pub fn advance(state: LinkState, event: &LinkEvent) -> (LinkState, Transition) {
    let mut transition = Transition::default();
    let next = match (state, event) {
        (
            LinkState::Unattempted,
            LinkEvent::ConnectIntent {
                pending_user_adds,
                bundle,
            },
        ) => {
            transition.send.push(Message::ConnectRequest {
                pending_user_adds: *pending_user_adds,
                bundle: bundle.clone(),
            });
            LinkState::AttemptingConnect
        }
        (LinkState::Unattempted, LinkEvent::RequestReceived) => LinkState::AttemptingConnect,
        (
            LinkState::AttemptingConnect,
            LinkEvent::ConnectDecision {
                accept,
                assigned_peer_id,
                bundle,
            },
        ) => {
            if *accept {
                transition.send.push(Message::ConnectResponse {
                    response: ConnectResponse::Accept,
                    net_peer_id: *assigned_peer_id,
                    bundle: bundle.clone(),
                });
                LinkState::AttemptingConnect
            } else {
                transition.send.push(Message::ConnectResponse {
                    response: ConnectResponse::Deny,
                    net_peer_id: NetPeerId::INVALID,
                    bundle: bundle.clone(),
                });
                transition.disconnected = Some(DisconnectReason::Denied);
                LinkState::Disconnected
            }
        }
        (
            LinkState::AttemptingConnect,
            LinkEvent::ResponseReceived {
                response,
                net_peer_id,
                ..
            },
        ) => match response {
            ConnectResponse::Accept => {
                transition.assigned_peer_id = Some(*net_peer_id);
                transition.send.push(Message::ConnectConfirmation);
                transition.connected = true;
                LinkState::Connected
            }
            ConnectResponse::Deny => {
                transition.disconnected = Some(DisconnectReason::Denied);
                LinkState::Disconnected
            }
        },
        (LinkState::AttemptingConnect, LinkEvent::ConfirmationReceived) => {
            transition.connected = true;
            LinkState::Connected
        }
        (LinkState::AttemptingConnect, LinkEvent::AttemptTimedOut) => {
            transition.disconnected = Some(DisconnectReason::Timeout);
            LinkState::Disconnected
        }
        (LinkState::Connected | LinkState::AttemptingConnect, LinkEvent::DisconnectIntent { bundle }) => {
            transition.send.push(Message::DisconnectNotice {
                bundle: bundle.clone(),
            });
            transition.disconnected = Some(DisconnectReason::Request);
            LinkState::Disconnected
        }
        (
            LinkState::Connected | LinkState::AttemptingConnect | LinkState::Disconnecting,
            LinkEvent::DisconnectReceived,
        ) => {
            transition.disconnected = Some(DisconnectReason::Request);
            LinkState::Disconnected
        }
        // Anything else is a replay or a stale event; do not mutate state.
        (state, _) => state,
    };
    (next, transition)
}

//
// Reorder channels
//

#[derive(Debug, Default)]
struct ReorderChannel {
    started: bool,
    next_release: u16,
    latest_released: u16,
    held: HashMap<u16, Message>,
}

impl ReorderChannel {
    fn release(&mut self, envelope: Envelope, out: &mut Vec<Message>) {
        match envelope.transfer {
            TransferMode::Immediate => {
                // Kept in step for sequenced/ordered replays after an
                // immediate burst.
                if !self.started || sequence16_greater_than(envelope.sequence, self.latest_released)
                {
                    self.latest_released = envelope.sequence;
                    self.next_release = envelope.sequence.wrapping_add(1);
                    self.started = true;
                }
                out.push(envelope.message);
            }
            TransferMode::Sequenced => {
                if !self.started
                    || sequence16_greater_than(envelope.sequence, self.latest_released)
                {
                    self.started = true;
                    self.latest_released = envelope.sequence;
                    self.next_release = envelope.sequence.wrapping_add(1);
                    out.push(envelope.message);
                }
            }
            TransferMode::Ordered => {
                if !self.started {
                    self.started = true;
                    self.next_release = 0;
                }
                if sequence16_greater_than(self.next_release, envelope.sequence) {
                    // Already released (duplicate).
                    return;
                }
                self.held.insert(envelope.sequence, envelope.message);
                while let Some(message) = self.held.remove(&self.next_release) {
                    self.latest_released = self.next_release;
                    self.next_release = self.next_release.wrapping_add(1);
                    out.push(message);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LinkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rtt_ms: f32,
}

/// One ordered, flow-controlled connection between two peers.
pub struct PeerLink {
    pub address: SocketAddr,
    state: LinkState,
    direction: LinkDirection,
    remote_peer_id: NetPeerId,
    remote_guid: u64,
    creation_time: f32,
    last_receive_time: f32,
    attempt_timeout: f32,
    send_sequence: u32,
    ack_tracker: AckTracker,
    receive_tracker: ReceiveTracker,
    out_sequences: HashMap<ChannelKey, u16>,
    outgoing: VecDeque<Envelope>,
    reorder: HashMap<ChannelKey, ReorderChannel>,
    stats: LinkStats,
    protocol_strikes: u32,
    fill_warning: bool,
}

impl PeerLink {
    pub fn new(address: SocketAddr, direction: LinkDirection, now: f32) -> Self {
        Self {
            address,
            state: LinkState::Unattempted,
            direction,
            remote_peer_id: NetPeerId::INVALID,
            remote_guid: 0,
            creation_time: now,
            last_receive_time: now,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            send_sequence: 0,
            ack_tracker: AckTracker::new(256),
            receive_tracker: ReceiveTracker::new(),
            out_sequences: HashMap::new(),
            outgoing: VecDeque::new(),
            reorder: HashMap::new(),
            stats: LinkStats::default(),
            protocol_strikes: 0,
            fill_warning: false,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn direction(&self) -> LinkDirection {
        self.direction
    }

    pub fn remote_peer_id(&self) -> NetPeerId {
        self.remote_peer_id
    }

    pub fn set_remote_peer_id(&mut self, id: NetPeerId) {
        self.remote_peer_id = id;
    }

    pub fn remote_guid(&self) -> u64 {
        self.remote_guid
    }

    pub fn set_remote_guid(&mut self, guid: u64) {
        self.remote_guid = guid;
    }

    pub fn creation_time(&self) -> f32 {
        self.creation_time
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn rtt_seconds(&self) -> f32 {
        self.ack_tracker.srtt() / 1000.0
    }

    pub fn touch(&mut self, now: f32) {
        self.last_receive_time = now;
    }

    pub fn attempt_timed_out(&self, now: f32) -> bool {
        matches!(
            self.state,
            LinkState::Unattempted | LinkState::AttemptingConnect
        ) && now - self.creation_time > self.attempt_timeout
    }

    pub fn set_attempt_timeout(&mut self, seconds: f32) {
        self.attempt_timeout = seconds;
    }

    pub fn is_timed_out(&self, now: f32, timeout: f32) -> bool {
        now - self.last_receive_time > timeout
    }

    /// Runs one handshake step and queues any produced messages.
    pub fn advance(&mut self, event: &LinkEvent) -> Transition {
        let (next, transition) = advance(self.state, event);
        self.state = next;
        for message in &transition.send {
            self.queue(message.clone(), TransferMode::Ordered, true);
        }
        transition
    }

    /// Queues a message for delivery under the given policy.
    pub fn queue(&mut self, message: Message, transfer: TransferMode, reliable: bool) {
        let key = channel_key(&message);
        let sequence = self.out_sequences.entry(key).or_insert(0);
        let envelope = Envelope {
            sequence: *sequence,
            transfer,
            reliable,
            message,
        };
        *sequence = sequence.wrapping_add(1);
        self.outgoing.push_back(envelope);
    }

    fn requeue(&mut self, envelopes: Vec<Envelope>) {
        // Retransmissions keep their original channel sequences and jump the
        // queue so ordered channels stall as briefly as possible.
        for envelope in envelopes.into_iter().rev() {
            self.outgoing.push_front(envelope);
        }
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// True once per frame when the last build crossed the warning fill.
    pub fn take_fill_warning(&mut self) -> bool {
        std::mem::take(&mut self.fill_warning)
    }

    /// Builds outgoing packets up to `frame_budget` bytes for this frame.
    /// Individual packets stop filling at [`FRAME_FILL_SKIP`] of the MTU.
    pub fn build_packets(&mut self, now: f32, frame_budget: usize) -> Vec<Vec<u8>> {
        self.requeue_lost(now);

        let mut packets = Vec::new();
        let mut budget_used = 0usize;

        while !self.outgoing.is_empty() {
            if budget_used >= frame_budget {
                self.fill_warning = true;
                break;
            }

            let sequence = self.send_sequence;
            self.send_sequence = self.send_sequence.wrapping_add(1);
            let (ack, ack_bitfield) = self.receive_tracker.ack_data();

            let mut body = BitStream::new();
            let mut count = 0u8;
            let mut reliable = Vec::new();
            let fill_limit = (MAX_PACKET_SIZE as f32 * FRAME_FILL_SKIP) as usize;

            while let Some(envelope) = self.outgoing.front() {
                if count == u8::MAX {
                    break;
                }
                let mut trial = BitStream::new();
                if envelope.write(&mut trial).is_err() {
                    // Unencodable payload; drop it rather than wedge the queue.
                    log::warn!("dropping unencodable message to {}", self.address);
                    self.outgoing.pop_front();
                    continue;
                }
                let header_bytes = 21;
                if header_bytes + (body.bits_written() + trial.bits_written()).div_ceil(8)
                    > fill_limit
                {
                    if count == 0 {
                        // A single oversized message still goes out alone.
                        body.append(&trial);
                        count += 1;
                        let envelope = self.outgoing.pop_front().unwrap();
                        if envelope.reliable {
                            reliable.push(envelope);
                        }
                    }
                    break;
                }
                body.append(&trial);
                count += 1;
                let envelope = self.outgoing.pop_front().unwrap();
                if envelope.reliable {
                    reliable.push(envelope);
                }
            }

            if count == 0 {
                self.send_sequence = sequence;
                break;
            }

            let mut packet = BitStream::new();
            PacketHeader::new(sequence, ack, ack_bitfield).write(&mut packet);
            packet.write_u8(count);
            packet.append(&body);

            let bytes = packet.as_bytes().to_vec();
            budget_used += bytes.len();
            if budget_used as f32 > frame_budget as f32 * FRAME_FILL_WARNING {
                self.fill_warning = true;
            }
            self.ack_tracker.track_packet(sequence, now, reliable);
            self.stats.packets_sent += 1;
            self.stats.bytes_sent += bytes.len() as u64;
            packets.push(bytes);
        }
        packets
    }

    fn requeue_lost(&mut self, now: f32) {
        let lost = self.ack_tracker.take_lost(now);
        if !lost.is_empty() {
            self.requeue(lost);
        }
    }

    /// Ingests one received datagram: validates the header, rejects
    /// duplicates, processes acks, and releases messages per their transfer
    /// mode. Returns messages in release order, or an error after repeated
    /// malformed packets.
    pub fn receive_packet(
        &mut self,
        data: &[u8],
        now: f32,
    ) -> Result<Vec<Message>, DisconnectReason> {
        let mut stream = BitStream::from_bytes(data);
        let header = match PacketHeader::read(&mut stream) {
            Ok(header) if header.is_valid() => header,
            _ => return self.strike(),
        };

        if !self.receive_tracker.record_received(header.sequence) {
            return Ok(Vec::new());
        }
        self.ack_tracker
            .process_ack(header.ack, header.ack_bitfield, now);
        self.stats.packets_received += 1;
        self.stats.bytes_received += data.len() as u64;
        self.stats.rtt_ms = self.ack_tracker.srtt();
        self.last_receive_time = now;

        let count = match stream.read_u8() {
            Ok(count) => count,
            Err(_) => return self.strike(),
        };

        let mut released = Vec::new();
        for _ in 0..count {
            let envelope = match Envelope::read(&mut stream) {
                Ok(envelope) => envelope,
                Err(error) => {
                    // The rest of the packet cannot be framed; discard it.
                    log::warn!("malformed message from {}: {error}", self.address);
                    return self.strike_keep(released);
                }
            };
            let key = channel_key(&envelope.message);
            self.reorder
                .entry(key)
                .or_default()
                .release(envelope, &mut released);
        }
        self.protocol_strikes = 0;
        Ok(released)
    }

    fn strike(&mut self) -> Result<Vec<Message>, DisconnectReason> {
        self.strike_keep(Vec::new())
    }

    fn strike_keep(&mut self, released: Vec<Message>) -> Result<Vec<Message>, DisconnectReason> {
        self.protocol_strikes += 1;
        if self.protocol_strikes >= PROTOCOL_STRIKE_LIMIT {
            Err(DisconnectReason::ProtocolError)
        } else {
            Ok(released)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_address() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn sequence_comparison_wraps() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(sequence_greater_than(0, u32::MAX));
        assert!(!sequence_greater_than(u32::MAX, 0));
    }

    #[test]
    fn handshake_is_idempotent() {
        let (state, transition) = advance(
            LinkState::Unattempted,
            &LinkEvent::ConnectIntent {
                pending_user_adds: 0,
                bundle: BitStream::new(),
            },
        );
        assert_eq!(state, LinkState::AttemptingConnect);
        assert_eq!(transition.send.len(), 1);

        // Replaying the same event in the new state changes nothing.
        let (replayed, transition) = advance(
            state,
            &LinkEvent::ConnectIntent {
                pending_user_adds: 0,
                bundle: BitStream::new(),
            },
        );
        assert_eq!(replayed, state);
        assert!(transition.send.is_empty());
    }

    #[test]
    fn handshake_accept_flow() {
        let (state, transition) = advance(
            LinkState::AttemptingConnect,
            &LinkEvent::ResponseReceived {
                response: ConnectResponse::Accept,
                net_peer_id: NetPeerId(7),
                bundle: BitStream::new(),
            },
        );
        assert_eq!(state, LinkState::Connected);
        assert!(transition.connected);
        assert_eq!(transition.assigned_peer_id, Some(NetPeerId(7)));
        assert!(matches!(
            transition.send[0],
            Message::ConnectConfirmation
        ));

        // Confirmation arriving twice must not reconnect.
        let (state, transition) = advance(state, &LinkEvent::ConfirmationReceived);
        assert_eq!(state, LinkState::Connected);
        assert!(!transition.connected);
    }

    #[test]
    fn handshake_deny_tears_down() {
        let (state, transition) = advance(
            LinkState::AttemptingConnect,
            &LinkEvent::ResponseReceived {
                response: ConnectResponse::Deny,
                net_peer_id: NetPeerId::INVALID,
                bundle: BitStream::new(),
            },
        );
        assert_eq!(state, LinkState::Disconnected);
        assert_eq!(transition.disconnected, Some(DisconnectReason::Denied));
    }

    #[test]
    fn ordered_channel_holds_for_gap() {
        let mut channel = ReorderChannel::default();
        let mut out = Vec::new();

        let envelope = |sequence| Envelope {
            sequence,
            transfer: TransferMode::Ordered,
            reliable: true,
            message: Message::GameLoadFinished,
        };

        channel.release(envelope(1), &mut out);
        assert!(out.is_empty());
        channel.release(envelope(0), &mut out);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn sequenced_channel_drops_late() {
        let mut channel = ReorderChannel::default();
        let mut out = Vec::new();
        let envelope = |sequence| Envelope {
            sequence,
            transfer: TransferMode::Sequenced,
            reliable: false,
            message: Message::GameLoadFinished,
        };

        channel.release(envelope(1), &mut out);
        channel.release(envelope(0), &mut out);
        channel.release(envelope(2), &mut out);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn immediate_channel_releases_everything() {
        let mut channel = ReorderChannel::default();
        let mut out = Vec::new();
        let envelope = |sequence| Envelope {
            sequence,
            transfer: TransferMode::Immediate,
            reliable: false,
            message: Message::GameLoadFinished,
        };
        channel.release(envelope(2), &mut out);
        channel.release(envelope(0), &mut out);
        channel.release(envelope(1), &mut out);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn packet_round_trip_through_links() {
        let now = 0.0;
        let mut sender = PeerLink::new(test_address(), LinkDirection::Outgoing, now);
        let mut receiver = PeerLink::new(test_address(), LinkDirection::Incoming, now);

        sender.queue(Message::GameLoadStarted, TransferMode::Ordered, true);
        sender.queue(Message::GameLoadFinished, TransferMode::Ordered, true);
        let packets = sender.build_packets(now, MAX_PACKET_SIZE * 4);
        assert_eq!(packets.len(), 1);

        let released = receiver.receive_packet(&packets[0], now).unwrap();
        assert_eq!(released.len(), 2);
        assert!(matches!(released[0], Message::GameLoadStarted));
        assert!(matches!(released[1], Message::GameLoadFinished));

        // Duplicate delivery is filtered.
        let released = receiver.receive_packet(&packets[0], now).unwrap();
        assert!(released.is_empty());
    }

    #[test]
    fn lost_reliable_messages_are_requeued() {
        let mut link = PeerLink::new(test_address(), LinkDirection::Outgoing, 0.0);
        link.queue(Message::GameLoadStarted, TransferMode::Ordered, true);
        let packets = link.build_packets(0.0, MAX_PACKET_SIZE);
        assert_eq!(packets.len(), 1);
        assert!(!link.has_outgoing());

        // Long after the retransmission timeout, building again resends.
        let packets = link.build_packets(10.0, MAX_PACKET_SIZE);
        assert_eq!(packets.len(), 1);
    }

    #[test]
    fn repeated_garbage_disconnects_with_protocol_error() {
        let mut link = PeerLink::new(test_address(), LinkDirection::Incoming, 0.0);
        let garbage = vec![0xffu8; 40];
        assert!(link.receive_packet(&garbage, 0.0).is_ok());
        assert!(link.receive_packet(&garbage, 0.0).is_ok());
        assert_eq!(
            link.receive_packet(&garbage, 0.0).unwrap_err(),
            DisconnectReason::ProtocolError
        );
    }
}
