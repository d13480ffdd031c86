use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::bitstream::{BitError, BitStream, bits_to_represent};
use super::replica::{FamilyTreeId, NetObjectId, NetPeerId, NetUserId};

/// Net object ids are quantized on the wire over this inclusive maximum.
pub const MAX_NET_OBJECT_ID: u32 = (1 << 20) - 1;
/// Family tree ids share the same wire range.
pub const MAX_FAMILY_TREE_ID: u32 = (1 << 20) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectResponse {
    Accept,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAddResponse {
    Accept,
    Deny,
}

/// One record returned from a master server's host directory.
#[derive(Debug, Clone)]
pub struct HostRecord {
    pub address: SocketAddr,
    pub basic_host_info: BitStream,
}

/// Every message that can appear inside a packet body. Messages are
/// bit-aligned and begin with a type tag quantized over the enum cardinality.
#[derive(Debug, Clone)]
pub enum Message {
    // Link handshake
    ConnectRequest {
        pending_user_adds: u32,
        bundle: BitStream,
    },
    ConnectResponse {
        response: ConnectResponse,
        /// The net peer id the server assigned, valid only on accept.
        net_peer_id: NetPeerId,
        bundle: BitStream,
    },
    ConnectConfirmation,
    DisconnectNotice {
        bundle: BitStream,
    },

    // Users and events
    NetEvent {
        bundle: BitStream,
    },
    UserAddRequest {
        bundle: BitStream,
    },
    UserAddResponse {
        response: UserAddResponse,
        net_user_id: NetUserId,
        bundle: BitStream,
    },
    UserRemoveRequest {
        net_user_id: NetUserId,
        bundle: BitStream,
    },

    // Load notifications
    LevelLoadStarted {
        net_space_id: NetObjectId,
        level_resource_id: u64,
    },
    LevelLoadFinished {
        net_space_id: NetObjectId,
    },
    GameLoadStarted,
    GameLoadFinished,

    // Host discovery
    HostPing {
        project_guid: u64,
        ping_id: u32,
        send_attempt_id: u32,
        manager_id: u32,
        bundle: BitStream,
    },
    HostPong {
        project_guid: u64,
        ping_id: u32,
        send_attempt_id: u32,
        manager_id: u32,
        bundle: BitStream,
    },
    HostRecordList {
        records: Vec<HostRecord>,
    },
    HostPublish {
        project_guid: u64,
        basic_host_info: BitStream,
    },
    RequestHostRefresh {
        project_guid: u64,
        address: SocketAddr,
    },
    HostRefresh {
        address: SocketAddr,
        basic_host_info: BitStream,
    },

    // Replication
    CreateReplica {
        family_tree_id: FamilyTreeId,
        net_object_id: NetObjectId,
        create_context: u64,
        replica_type: u64,
        parent: NetObjectId,
        owner: NetUserId,
        channel_data: BitStream,
    },
    EmplaceReplica {
        net_object_id: NetObjectId,
        emplace_context: u64,
        emplace_id: u32,
        parent: NetObjectId,
        owner: NetUserId,
        channel_data: BitStream,
    },
    ReplicaOffline {
        net_object_id: NetObjectId,
        channel_data: BitStream,
    },
    ForgetReplica {
        net_object_id: NetObjectId,
    },
    DestroyReplica {
        net_object_id: NetObjectId,
    },
    ChannelData {
        net_object_id: NetObjectId,
        channel_index: u8,
        data: BitStream,
    },
}

const MESSAGE_TYPE_COUNT: u64 = 24;

impl Message {
    fn tag(&self) -> u64 {
        match self {
            Message::ConnectRequest { .. } => 0,
            Message::ConnectResponse { .. } => 1,
            Message::ConnectConfirmation => 2,
            Message::DisconnectNotice { .. } => 3,
            Message::NetEvent { .. } => 4,
            Message::UserAddRequest { .. } => 5,
            Message::UserAddResponse { .. } => 6,
            Message::UserRemoveRequest { .. } => 7,
            Message::LevelLoadStarted { .. } => 8,
            Message::LevelLoadFinished { .. } => 9,
            Message::GameLoadStarted => 10,
            Message::GameLoadFinished => 11,
            Message::HostPing { .. } => 12,
            Message::HostPong { .. } => 13,
            Message::HostRecordList { .. } => 14,
            Message::HostPublish { .. } => 15,
            Message::RequestHostRefresh { .. } => 16,
            Message::HostRefresh { .. } => 17,
            Message::CreateReplica { .. } => 18,
            Message::EmplaceReplica { .. } => 19,
            Message::ReplicaOffline { .. } => 20,
            Message::ForgetReplica { .. } => 21,
            Message::DestroyReplica { .. } => 22,
            Message::ChannelData { .. } => 23,
        }
    }

    pub fn write(&self, stream: &mut BitStream) -> Result<(), BitError> {
        stream.write_uint(self.tag(), bits_to_represent(MESSAGE_TYPE_COUNT - 1));
        match self {
            Message::ConnectRequest {
                pending_user_adds,
                bundle,
            } => {
                stream.write_u32(*pending_user_adds);
                stream.write_sized_stream(bundle)?;
            }
            Message::ConnectResponse {
                response,
                net_peer_id,
                bundle,
            } => {
                stream.write_bit(*response == ConnectResponse::Deny);
                if *response == ConnectResponse::Accept {
                    stream.write_u32(net_peer_id.0);
                }
                stream.write_sized_stream(bundle)?;
            }
            Message::ConnectConfirmation | Message::GameLoadStarted | Message::GameLoadFinished => {}
            Message::DisconnectNotice { bundle } | Message::NetEvent { bundle } => {
                stream.write_sized_stream(bundle)?;
            }
            Message::UserAddRequest { bundle } => {
                // Historical dummy bit precedes the request bundle.
                stream.write_bit(false);
                stream.write_sized_stream(bundle)?;
            }
            Message::UserAddResponse {
                response,
                net_user_id,
                bundle,
            } => {
                stream.write_bit(*response == UserAddResponse::Deny);
                if *response == UserAddResponse::Accept {
                    stream.write_u32(net_user_id.0);
                }
                stream.write_sized_stream(bundle)?;
            }
            Message::UserRemoveRequest {
                net_user_id,
                bundle,
            } => {
                stream.write_u32(net_user_id.0);
                stream.write_sized_stream(bundle)?;
            }
            Message::LevelLoadStarted {
                net_space_id,
                level_resource_id,
            } => {
                write_object_id(stream, *net_space_id)?;
                stream.write_u64(*level_resource_id);
            }
            Message::LevelLoadFinished { net_space_id } => {
                write_object_id(stream, *net_space_id)?;
            }
            Message::HostPing {
                project_guid,
                ping_id,
                send_attempt_id,
                manager_id,
                bundle,
            }
            | Message::HostPong {
                project_guid,
                ping_id,
                send_attempt_id,
                manager_id,
                bundle,
            } => {
                stream.write_u64(*project_guid);
                stream.write_u32(*ping_id);
                stream.write_u32(*send_attempt_id);
                stream.write_u32(*manager_id);
                stream.write_sized_stream(bundle)?;
            }
            Message::HostRecordList { records } => {
                // The record block carries an explicit outer length so a
                // record list can be safely concatenated with later messages.
                let mut block = BitStream::new();
                block.write_u32(records.len() as u32);
                for record in records {
                    write_address(&mut block, record.address);
                    block.write_u32(record.basic_host_info.bits_written() as u32);
                    block.append(&record.basic_host_info);
                }
                stream.write_sized_stream(&block)?;
            }
            Message::HostPublish {
                project_guid,
                basic_host_info,
            } => {
                stream.write_u64(*project_guid);
                stream.write_sized_stream(basic_host_info)?;
            }
            Message::RequestHostRefresh {
                project_guid,
                address,
            } => {
                stream.write_u64(*project_guid);
                write_address(stream, *address);
            }
            Message::HostRefresh {
                address,
                basic_host_info,
            } => {
                write_address(stream, *address);
                stream.write_sized_stream(basic_host_info)?;
            }
            Message::CreateReplica {
                family_tree_id,
                net_object_id,
                create_context,
                replica_type,
                parent,
                owner,
                channel_data,
            } => {
                stream.write_quantized_i64(
                    i64::from(family_tree_id.0),
                    0,
                    i64::from(MAX_FAMILY_TREE_ID),
                    1,
                )?;
                write_object_id(stream, *net_object_id)?;
                stream.write_u64(*create_context);
                stream.write_u64(*replica_type);
                write_object_id(stream, *parent)?;
                stream.write_u32(owner.0);
                stream.write_sized_stream(channel_data)?;
            }
            Message::EmplaceReplica {
                net_object_id,
                emplace_context,
                emplace_id,
                parent,
                owner,
                channel_data,
            } => {
                write_object_id(stream, *net_object_id)?;
                stream.write_u64(*emplace_context);
                stream.write_u32(*emplace_id);
                write_object_id(stream, *parent)?;
                stream.write_u32(owner.0);
                stream.write_sized_stream(channel_data)?;
            }
            Message::ReplicaOffline {
                net_object_id,
                channel_data,
            } => {
                write_object_id(stream, *net_object_id)?;
                stream.write_sized_stream(channel_data)?;
            }
            Message::ForgetReplica { net_object_id } | Message::DestroyReplica { net_object_id } => {
                write_object_id(stream, *net_object_id)?;
            }
            Message::ChannelData {
                net_object_id,
                channel_index,
                data,
            } => {
                write_object_id(stream, *net_object_id)?;
                stream.write_u8(*channel_index);
                stream.write_sized_stream(data)?;
            }
        }
        Ok(())
    }

    pub fn read(stream: &mut BitStream) -> Result<Message, BitError> {
        let tag = stream.read_uint(bits_to_represent(MESSAGE_TYPE_COUNT - 1))?;
        let message = match tag {
            0 => Message::ConnectRequest {
                pending_user_adds: stream.read_u32()?,
                bundle: stream.read_sized_stream()?,
            },
            1 => {
                let deny = stream.read_bit()?;
                let net_peer_id = if deny {
                    NetPeerId::INVALID
                } else {
                    NetPeerId(stream.read_u32()?)
                };
                Message::ConnectResponse {
                    response: if deny {
                        ConnectResponse::Deny
                    } else {
                        ConnectResponse::Accept
                    },
                    net_peer_id,
                    bundle: stream.read_sized_stream()?,
                }
            }
            2 => Message::ConnectConfirmation,
            3 => Message::DisconnectNotice {
                bundle: stream.read_sized_stream()?,
            },
            4 => Message::NetEvent {
                bundle: stream.read_sized_stream()?,
            },
            5 => {
                stream.read_bit()?;
                Message::UserAddRequest {
                    bundle: stream.read_sized_stream()?,
                }
            }
            6 => {
                let deny = stream.read_bit()?;
                let net_user_id = if deny {
                    NetUserId::INVALID
                } else {
                    NetUserId(stream.read_u32()?)
                };
                Message::UserAddResponse {
                    response: if deny {
                        UserAddResponse::Deny
                    } else {
                        UserAddResponse::Accept
                    },
                    net_user_id,
                    bundle: stream.read_sized_stream()?,
                }
            }
            7 => Message::UserRemoveRequest {
                net_user_id: NetUserId(stream.read_u32()?),
                bundle: stream.read_sized_stream()?,
            },
            8 => Message::LevelLoadStarted {
                net_space_id: read_object_id(stream)?,
                level_resource_id: stream.read_u64()?,
            },
            9 => Message::LevelLoadFinished {
                net_space_id: read_object_id(stream)?,
            },
            10 => Message::GameLoadStarted,
            11 => Message::GameLoadFinished,
            12 | 13 => {
                let project_guid = stream.read_u64()?;
                let ping_id = stream.read_u32()?;
                let send_attempt_id = stream.read_u32()?;
                let manager_id = stream.read_u32()?;
                let bundle = stream.read_sized_stream()?;
                if tag == 12 {
                    Message::HostPing {
                        project_guid,
                        ping_id,
                        send_attempt_id,
                        manager_id,
                        bundle,
                    }
                } else {
                    Message::HostPong {
                        project_guid,
                        ping_id,
                        send_attempt_id,
                        manager_id,
                        bundle,
                    }
                }
            }
            14 => {
                let mut block = stream.read_sized_stream()?;
                let count = block.read_u32()?;
                let mut records = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    let address = read_address(&mut block)?;
                    let bits = block.read_u32()? as usize;
                    let basic_host_info = block.read_stream(bits)?;
                    records.push(HostRecord {
                        address,
                        basic_host_info,
                    });
                }
                Message::HostRecordList { records }
            }
            15 => Message::HostPublish {
                project_guid: stream.read_u64()?,
                basic_host_info: stream.read_sized_stream()?,
            },
            16 => Message::RequestHostRefresh {
                project_guid: stream.read_u64()?,
                address: read_address(stream)?,
            },
            17 => Message::HostRefresh {
                address: read_address(stream)?,
                basic_host_info: stream.read_sized_stream()?,
            },
            18 => Message::CreateReplica {
                family_tree_id: FamilyTreeId(stream.read_quantized_i64(
                    0,
                    i64::from(MAX_FAMILY_TREE_ID),
                    1,
                )? as u32),
                net_object_id: read_object_id(stream)?,
                create_context: stream.read_u64()?,
                replica_type: stream.read_u64()?,
                parent: read_object_id(stream)?,
                owner: NetUserId(stream.read_u32()?),
                channel_data: stream.read_sized_stream()?,
            },
            19 => Message::EmplaceReplica {
                net_object_id: read_object_id(stream)?,
                emplace_context: stream.read_u64()?,
                emplace_id: stream.read_u32()?,
                parent: read_object_id(stream)?,
                owner: NetUserId(stream.read_u32()?),
                channel_data: stream.read_sized_stream()?,
            },
            20 => Message::ReplicaOffline {
                net_object_id: read_object_id(stream)?,
                channel_data: stream.read_sized_stream()?,
            },
            21 => Message::ForgetReplica {
                net_object_id: read_object_id(stream)?,
            },
            22 => Message::DestroyReplica {
                net_object_id: read_object_id(stream)?,
            },
            23 => Message::ChannelData {
                net_object_id: read_object_id(stream)?,
                channel_index: stream.read_u8()?,
                data: stream.read_sized_stream()?,
            },
            _ => return Err(BitError::InvalidRange),
        };
        Ok(message)
    }
}

fn write_object_id(stream: &mut BitStream, id: NetObjectId) -> Result<(), BitError> {
    stream.write_quantized_i64(i64::from(id.0), 0, i64::from(MAX_NET_OBJECT_ID), 1)
}

fn read_object_id(stream: &mut BitStream) -> Result<NetObjectId, BitError> {
    Ok(NetObjectId(
        stream.read_quantized_i64(0, i64::from(MAX_NET_OBJECT_ID), 1)? as u32,
    ))
}

pub fn write_address(stream: &mut BitStream, address: SocketAddr) {
    match address.ip() {
        IpAddr::V4(ip) => {
            stream.write_bit(false);
            for octet in ip.octets() {
                stream.write_u8(octet);
            }
        }
        IpAddr::V6(ip) => {
            stream.write_bit(true);
            for octet in ip.octets() {
                stream.write_u8(octet);
            }
        }
    }
    stream.write_u16(address.port());
}

pub fn read_address(stream: &mut BitStream) -> Result<SocketAddr, BitError> {
    let v6 = stream.read_bit()?;
    let ip = if v6 {
        let mut octets = [0u8; 16];
        for octet in &mut octets {
            *octet = stream.read_u8()?;
        }
        IpAddr::V6(Ipv6Addr::from(octets))
    } else {
        let mut octets = [0u8; 4];
        for octet in &mut octets {
            *octet = stream.read_u8()?;
        }
        IpAddr::V4(Ipv4Addr::from(octets))
    };
    let port = stream.read_u16()?;
    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) -> Message {
        let mut stream = BitStream::new();
        message.write(&mut stream).unwrap();
        let decoded = Message::read(&mut stream).unwrap();
        assert_eq!(stream.bits_remaining(), 0, "bits left after {decoded:?}");
        decoded
    }

    #[test]
    fn connect_response_accept_carries_peer_id() {
        let decoded = round_trip(Message::ConnectResponse {
            response: ConnectResponse::Accept,
            net_peer_id: NetPeerId(42),
            bundle: BitStream::new(),
        });
        match decoded {
            Message::ConnectResponse {
                response,
                net_peer_id,
                ..
            } => {
                assert_eq!(response, ConnectResponse::Accept);
                assert_eq!(net_peer_id, NetPeerId(42));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn deny_omits_the_id() {
        let mut accept = BitStream::new();
        Message::UserAddResponse {
            response: UserAddResponse::Accept,
            net_user_id: NetUserId(1),
            bundle: BitStream::new(),
        }
        .write(&mut accept)
        .unwrap();

        let mut deny = BitStream::new();
        Message::UserAddResponse {
            response: UserAddResponse::Deny,
            net_user_id: NetUserId::INVALID,
            bundle: BitStream::new(),
        }
        .write(&mut deny)
        .unwrap();

        assert_eq!(accept.bits_written(), deny.bits_written() + 32);
    }

    #[test]
    fn host_record_list_round_trip() {
        let mut info = BitStream::new();
        info.write_string("skirmish");
        let records = vec![
            HostRecord {
                address: "192.168.0.5:8005".parse().unwrap(),
                basic_host_info: info.clone(),
            },
            HostRecord {
                address: "[::1]:9000".parse().unwrap(),
                basic_host_info: BitStream::new(),
            },
        ];
        let decoded = round_trip(Message::HostRecordList { records });
        match decoded {
            Message::HostRecordList { records } => {
                assert_eq!(records.len(), 2);
                assert_eq!(records[0].address, "192.168.0.5:8005".parse().unwrap());
                let mut info = records[0].basic_host_info.clone();
                assert_eq!(info.read_string().unwrap(), "skirmish");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn record_list_framing_preserves_following_messages() {
        // A record list concatenated with another message must not clobber it.
        let mut stream = BitStream::new();
        Message::HostRecordList {
            records: vec![HostRecord {
                address: "10.0.0.1:8000".parse().unwrap(),
                basic_host_info: BitStream::new(),
            }],
        }
        .write(&mut stream)
        .unwrap();
        Message::GameLoadFinished.write(&mut stream).unwrap();

        assert!(matches!(
            Message::read(&mut stream).unwrap(),
            Message::HostRecordList { .. }
        ));
        assert!(matches!(
            Message::read(&mut stream).unwrap(),
            Message::GameLoadFinished
        ));
        assert_eq!(stream.bits_remaining(), 0);
    }

    #[test]
    fn create_replica_round_trip() {
        let decoded = round_trip(Message::CreateReplica {
            family_tree_id: FamilyTreeId(3),
            net_object_id: NetObjectId(17),
            create_context: 555,
            replica_type: 777,
            parent: NetObjectId::INVALID,
            owner: NetUserId(2),
            channel_data: BitStream::new(),
        });
        match decoded {
            Message::CreateReplica {
                family_tree_id,
                net_object_id,
                parent,
                owner,
                ..
            } => {
                assert_eq!(family_tree_id, FamilyTreeId(3));
                assert_eq!(net_object_id, NetObjectId(17));
                assert_eq!(parent, NetObjectId::INVALID);
                assert_eq!(owner, NetUserId(2));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
