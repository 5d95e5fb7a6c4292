use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// UDP port for the secure datagram transport.
pub const SECURE_PORT: u16 = 19840;
/// TCP port for the legacy stream demo transport.
pub const STREAM_PORT: u16 = 4242;

pub const CONNECTION_POOL_SIZE: usize = 128;
pub const QUEUE_CAPACITY: usize = 256;
pub const WORKER_POOL_SIZE: usize = sc_worker::WORKER_POOL_SIZE;
pub const CLIENT_TIMEOUT_SECONDS: u64 = sc_net::secure::CLIENT_TIMEOUT_SECONDS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Transport {
    Secure,
    Stream,
    Both,
}

/// space-captain server: runs the secure DTLS-over-UDP game protocol and/or
/// the legacy TCP echo/reverse/time demo.
#[derive(Debug, Parser)]
#[command(name = "sc-server", version)]
pub struct ServerArgs {
    /// Which transport(s) to run.
    #[arg(long, value_enum, default_value = "both")]
    pub transport: Transport,

    /// Bind address (applies to both transports, on their respective ports).
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Secure (DTLS/UDP) transport port.
    #[arg(long, default_value_t = SECURE_PORT)]
    pub secure_port: u16,

    /// Stream (TCP) transport port.
    #[arg(long, default_value_t = STREAM_PORT)]
    pub stream_port: u16,

    /// Connection/session buffer pool size.
    #[arg(long, default_value_t = CONNECTION_POOL_SIZE)]
    pub pool_size: usize,

    /// Worker thread count.
    #[arg(long, default_value_t = WORKER_POOL_SIZE)]
    pub workers: usize,

    /// Work queue capacity.
    #[arg(long, default_value_t = QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Server certificate path override (else `SC_SERVER_CRT`, else §6 fallback chain).
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Server private key path override (else `SC_SERVER_KEY`, else §6 fallback chain).
    #[arg(long)]
    pub key: Option<PathBuf>,
}

pub struct ServerConfig {
    pub transport: Transport,
    pub secure_addr: SocketAddr,
    pub stream_addr: SocketAddr,
    pub pool_size: usize,
    pub workers: usize,
    pub queue_capacity: usize,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl From<ServerArgs> for ServerConfig {
    fn from(args: ServerArgs) -> Self {
        let (default_cert, default_key) = sc_utils::certs::resolve_server_cert_paths();
        Self {
            transport: args.transport,
            secure_addr: SocketAddr::new(args.bind, args.secure_port),
            stream_addr: SocketAddr::new(args.bind, args.stream_port),
            pool_size: args.pool_size,
            workers: args.workers,
            queue_capacity: args.queue_capacity,
            cert_path: args.cert.unwrap_or(default_cert),
            key_path: args.key.unwrap_or(default_key),
        }
    }
}

impl Default for ServerArgs {
    fn default() -> Self {
        Self {
            transport: Transport::Both,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            secure_port: SECURE_PORT,
            stream_port: STREAM_PORT,
            pool_size: CONNECTION_POOL_SIZE,
            workers: WORKER_POOL_SIZE,
            queue_capacity: QUEUE_CAPACITY,
            cert: None,
            key: None,
        }
    }
}
