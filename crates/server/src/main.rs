mod config;
mod host;

use std::net::{IpAddr, SocketAddr};

use anyhow::Result;
use clap::Parser;

use config::HostConfig;
use host::Host;
use tether::Role;

#[derive(Parser)]
#[command(name = "tether-server")]
#[command(about = "Tether networked physics host")]
struct Args {
    /// Peer role: server, client, or master.
    #[arg(short, long, default_value = "server")]
    role: String,

    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// First port to try binding; adjacent ports are retried on failure.
    #[arg(long, default_value_t = 8000)]
    port_start: u16,

    #[arg(long, default_value_t = 8010)]
    port_end: u16,

    #[arg(short, long, default_value_t = 60)]
    tick_rate: u32,

    #[arg(long, default_value_t = 20)]
    net_rate: u32,

    #[arg(short, long, default_value_t = 32)]
    max_clients: usize,

    #[arg(long, default_value_t = 0)]
    project_guid: u64,

    /// Server address to connect to (client role).
    #[arg(short, long)]
    connect: Option<SocketAddr>,

    /// User name added after connecting (client role).
    #[arg(short, long)]
    user: Option<String>,

    /// Master servers to subscribe to, repeatable.
    #[arg(long)]
    master: Vec<SocketAddr>,

    /// Broadcast a LAN host discovery on startup (client role).
    #[arg(long)]
    discover_lan: bool,

    /// Demo bodies simulated and replicated by a server.
    #[arg(long, default_value_t = 4)]
    bodies: usize,
}

fn parse_role(role: &str) -> Result<Role> {
    match role {
        "server" => Ok(Role::Server),
        "client" => Ok(Role::Client),
        "master" => Ok(Role::MasterServer),
        "offline" => Ok(Role::Offline),
        other => anyhow::bail!("unknown role '{other}'"),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = HostConfig {
        role: parse_role(&args.role)?,
        physics_rate: args.tick_rate,
        net_rate: args.net_rate,
        project_guid: args.project_guid,
        max_clients: args.max_clients,
        master_servers: args.master.clone(),
        body_count: args.bodies,
    };

    let bind: IpAddr = args.bind.parse()?;
    let mut host = Host::open(config, bind, (args.port_start, args.port_end))?;
    log::info!("bound {}", host.local_addr());

    if args.discover_lan {
        host.discover_lan((args.port_start, args.port_end));
    }
    if !args.master.is_empty() && args.role == "client" {
        host.discover_internet();
    }
    if let Some(address) = args.connect {
        host.connect(address);
    }
    if let Some(name) = &args.user {
        host.add_user(name);
    }

    host.run();
    Ok(())
}
