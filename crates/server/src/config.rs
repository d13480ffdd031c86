use std::net::SocketAddr;

use tether::Role;

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub role: Role,
    pub physics_rate: u32,
    pub net_rate: u32,
    pub project_guid: u64,
    pub max_clients: usize,
    pub master_servers: Vec<SocketAddr>,
    /// Demo bodies spawned and replicated by a server host.
    pub body_count: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            role: Role::Server,
            physics_rate: 60,
            net_rate: 20,
            project_guid: 0,
            max_clients: 32,
            master_servers: Vec::new(),
            body_count: 4,
        }
    }
}
