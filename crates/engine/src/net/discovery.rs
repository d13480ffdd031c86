use std::collections::HashMap;
use std::net::SocketAddr;

use super::bitstream::BitStream;
use super::message::{HostRecord, Message};

/// Which network a host list or discovery request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Lan,
    Internet,
}

/// Outcome of a host refresh request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshResult {
    NoResponse,
    IndirectBasicHostInfo,
    DirectBasicHostInfo,
    ExtraHostInfo,
}

/// A discovered game host.
#[derive(Debug, Clone)]
pub struct NetHost {
    pub network: Network,
    pub address: SocketAddr,
    pub round_trip_time: f32,
    pub basic_host_info: BitStream,
}

/// What a pending ping is trying to accomplish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPingKind {
    /// Build a fresh host list.
    DiscoverList,
    /// Refresh every known host.
    RefreshList,
    /// Refresh one specific host.
    SingleRefresh(SocketAddr),
    /// Query a master server for its record list.
    MasterQuery,
}

/// One outstanding ping awaiting pongs, keyed by ping id.
#[derive(Debug)]
pub struct PendingHostPing {
    pub network: Network,
    pub kind: HostPingKind,
    pub targets: Vec<SocketAddr>,
    pub created_time: f32,
    pub last_send_time: f32,
    pub send_attempt_id: u32,
    pub timeout: f32,
    /// Hosts that already responded to this ping.
    pub responded: Vec<SocketAddr>,
}

impl PendingHostPing {
    pub fn has_timed_out(&self, now: f32) -> bool {
        now - self.created_time >= self.timeout
    }

    pub fn should_resend(&self, now: f32, resend_interval: f32) -> bool {
        now - self.last_send_time >= resend_interval
    }
}

/// Correlates outgoing pings with incoming pongs. Pongs must match on
/// (project guid, ping id, send attempt id, manager id) to be accepted.
#[derive(Debug)]
pub struct PingManager {
    manager_id: u32,
    project_guid: u64,
    next_ping_id: u32,
    pending: HashMap<u32, PendingHostPing>,
    pub resend_interval: f32,
}

/// A pong accepted by the manager.
#[derive(Debug)]
pub struct AcceptedPong {
    pub ping_id: u32,
    pub network: Network,
    pub kind: HostPingKind,
    pub round_trip_time: f32,
    pub first_response_from_host: bool,
}

impl PingManager {
    pub fn new(manager_id: u32, project_guid: u64) -> Self {
        Self {
            manager_id,
            project_guid,
            next_ping_id: 1,
            pending: HashMap::new(),
            resend_interval: 0.25,
        }
    }

    pub fn manager_id(&self) -> u32 {
        self.manager_id
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self, ping_id: u32) -> Option<&PendingHostPing> {
        self.pending.get(&ping_id)
    }

    /// Starts a new ping and returns (ping id, message, targets).
    pub fn create_ping(
        &mut self,
        network: Network,
        kind: HostPingKind,
        targets: Vec<SocketAddr>,
        timeout: f32,
        now: f32,
    ) -> (u32, Message) {
        let ping_id = self.next_ping_id;
        self.next_ping_id = self.next_ping_id.wrapping_add(1).max(1);

        self.pending.insert(
            ping_id,
            PendingHostPing {
                network,
                kind,
                targets,
                created_time: now,
                last_send_time: now,
                send_attempt_id: 0,
                timeout,
                responded: Vec::new(),
            },
        );
        let message = Message::HostPing {
            project_guid: self.project_guid,
            ping_id,
            send_attempt_id: 0,
            manager_id: self.manager_id,
            bundle: BitStream::new(),
        };
        (ping_id, message)
    }

    /// Supersedes prior requests per the cancellation rules: a list-wide
    /// refresh cancels single refreshes, and cancelling a list refresh
    /// resolves its pings as no-response. Returns the cancelled ping ids.
    pub fn cancel_superseded(&mut self, new_kind: HostPingKind, network: Network) -> Vec<u32> {
        let cancelled: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, ping)| {
                ping.network == network
                    && match new_kind {
                        HostPingKind::DiscoverList | HostPingKind::RefreshList => matches!(
                            ping.kind,
                            HostPingKind::SingleRefresh(_)
                                | HostPingKind::DiscoverList
                                | HostPingKind::RefreshList
                        ),
                        _ => false,
                    }
            })
            .map(|(&id, _)| id)
            .collect();
        for id in &cancelled {
            self.pending.remove(id);
        }
        cancelled
    }

    /// Produces resend messages for pings past the resend interval. Each
    /// resend gets a fresh send attempt id so stale pongs are rejected.
    pub fn collect_resends(&mut self, now: f32) -> Vec<(Message, Vec<SocketAddr>)> {
        let mut resends = Vec::new();
        let resend_interval = self.resend_interval;
        for (&ping_id, ping) in &mut self.pending {
            if !ping.should_resend(now, resend_interval) {
                continue;
            }
            ping.send_attempt_id += 1;
            ping.last_send_time = now;
            let unanswered: Vec<SocketAddr> = ping
                .targets
                .iter()
                .filter(|target| !ping.responded.contains(target))
                .copied()
                .collect();
            if unanswered.is_empty() {
                continue;
            }
            resends.push((
                Message::HostPing {
                    project_guid: self.project_guid,
                    ping_id,
                    send_attempt_id: ping.send_attempt_id,
                    manager_id: self.manager_id,
                    bundle: BitStream::new(),
                },
                unanswered,
            ));
        }
        resends
    }

    /// Validates and accepts a pong. The send attempt id must match the
    /// current attempt or the immediately preceding one.
    pub fn accept_pong(
        &mut self,
        from: SocketAddr,
        project_guid: u64,
        ping_id: u32,
        send_attempt_id: u32,
        manager_id: u32,
        now: f32,
    ) -> Option<AcceptedPong> {
        if project_guid != self.project_guid || manager_id != self.manager_id {
            return None;
        }
        let ping = self.pending.get_mut(&ping_id)?;
        if send_attempt_id > ping.send_attempt_id {
            return None;
        }
        let first = !ping.responded.contains(&from);
        if first {
            ping.responded.push(from);
        }
        let accepted = AcceptedPong {
            ping_id,
            network: ping.network,
            kind: ping.kind,
            round_trip_time: now - ping.last_send_time,
            first_response_from_host: first,
        };
        // Single refreshes complete on their first matching pong.
        if matches!(ping.kind, HostPingKind::SingleRefresh(_) | HostPingKind::MasterQuery) {
            self.pending.remove(&ping_id);
        }
        Some(accepted)
    }

    /// Resolves all pending master-server queries, typically because a record
    /// list arrived. Record lists carry no ping correlation on the wire.
    pub fn resolve_master_queries(&mut self) -> Vec<u32> {
        let resolved: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, ping)| ping.kind == HostPingKind::MasterQuery)
            .map(|(&id, _)| id)
            .collect();
        for id in &resolved {
            self.pending.remove(id);
        }
        resolved
    }

    /// Removes timed-out pings, returning them for no-response resolution.
    pub fn collect_timeouts(&mut self, now: f32) -> Vec<(u32, PendingHostPing)> {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, ping)| ping.has_timed_out(now))
            .map(|(&id, _)| id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|ping| (id, ping)))
            .collect()
    }
}

/// A record stored by a master server on behalf of a publishing game server.
#[derive(Debug, Clone)]
struct StoredRecord {
    record: HostRecord,
    expire_time: f32,
}

/// The master server's host directory: records expire after a lifetime and
/// each source ip may hold a bounded number of records.
#[derive(Debug)]
pub struct HostDirectory {
    records: Vec<StoredRecord>,
    pub record_lifetime: f32,
    pub same_ip_record_limit: usize,
}

impl HostDirectory {
    pub fn new(record_lifetime: f32, same_ip_record_limit: usize) -> Self {
        Self {
            records: Vec::new(),
            record_lifetime,
            same_ip_record_limit,
        }
    }

    pub fn publish(&mut self, address: SocketAddr, basic_host_info: BitStream, now: f32) {
        if let Some(stored) = self
            .records
            .iter_mut()
            .find(|stored| stored.record.address == address)
        {
            stored.record.basic_host_info = basic_host_info;
            stored.expire_time = now + self.record_lifetime;
            return;
        }

        let same_ip = self
            .records
            .iter()
            .filter(|stored| stored.record.address.ip() == address.ip())
            .count();
        if same_ip >= self.same_ip_record_limit {
            log::warn!("host record limit reached for {}", address.ip());
            return;
        }

        self.records.push(StoredRecord {
            record: HostRecord {
                address,
                basic_host_info,
            },
            expire_time: now + self.record_lifetime,
        });
    }

    pub fn expire(&mut self, now: f32) {
        self.records.retain(|stored| stored.expire_time > now);
    }

    pub fn records(&self) -> Vec<HostRecord> {
        self.records
            .iter()
            .map(|stored| stored.record.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn pong_correlation_requires_all_ids() {
        let mut manager = PingManager::new(9, 0xabc);
        let (ping_id, _) = manager.create_ping(
            Network::Lan,
            HostPingKind::DiscoverList,
            vec![address(8000)],
            1.0,
            0.0,
        );

        // Wrong guid, wrong manager, and future attempt all rejected.
        assert!(manager
            .accept_pong(address(8000), 0xdef, ping_id, 0, 9, 0.1)
            .is_none());
        assert!(manager
            .accept_pong(address(8000), 0xabc, ping_id, 0, 8, 0.1)
            .is_none());
        assert!(manager
            .accept_pong(address(8000), 0xabc, ping_id, 3, 9, 0.1)
            .is_none());

        let accepted = manager
            .accept_pong(address(8000), 0xabc, ping_id, 0, 9, 0.1)
            .unwrap();
        assert!(accepted.first_response_from_host);
        let repeat = manager
            .accept_pong(address(8000), 0xabc, ping_id, 0, 9, 0.2)
            .unwrap();
        assert!(!repeat.first_response_from_host);
    }

    #[test]
    fn list_refresh_cancels_single_refreshes() {
        let mut manager = PingManager::new(1, 1);
        manager.create_ping(
            Network::Lan,
            HostPingKind::SingleRefresh(address(8000)),
            vec![address(8000)],
            5.0,
            0.0,
        );
        let cancelled = manager.cancel_superseded(HostPingKind::RefreshList, Network::Lan);
        assert_eq!(cancelled.len(), 1);
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn timeouts_drain_pending() {
        let mut manager = PingManager::new(1, 1);
        manager.create_ping(
            Network::Lan,
            HostPingKind::DiscoverList,
            vec![address(8000)],
            1.0,
            0.0,
        );
        assert!(manager.collect_timeouts(0.5).is_empty());
        let expired = manager.collect_timeouts(1.5);
        assert_eq!(expired.len(), 1);
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn directory_enforces_lifetime_and_ip_cap() {
        let mut directory = HostDirectory::new(10.0, 2);
        directory.publish(address(8000), BitStream::new(), 0.0);
        directory.publish(address(8001), BitStream::new(), 0.0);
        // Third record from the same ip is refused.
        directory.publish(address(8002), BitStream::new(), 0.0);
        assert_eq!(directory.len(), 2);

        // Re-publishing refreshes rather than duplicating.
        directory.publish(address(8000), BitStream::new(), 5.0);
        assert_eq!(directory.len(), 2);

        directory.expire(11.0);
        assert_eq!(directory.len(), 1);
        directory.expire(16.0);
        assert!(directory.is_empty());
    }
}
