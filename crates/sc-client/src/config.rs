use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// space-captain client: drives either the secure DTLS-over-UDP protocol or
/// the legacy TCP echo/reverse/time demo.
#[derive(Debug, Parser)]
#[command(name = "sc-client", version)]
pub struct ClientArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Handshake over DTLS/UDP and round-trip a PING.
    Ping {
        /// Server address, e.g. `127.0.0.1:19840`.
        #[arg(long)]
        server: SocketAddr,

        /// SHA-256 server certificate hash to pin, as produced by `cert-hash`.
        /// Omit to skip pinning — pinning is optional on the client.
        #[arg(long)]
        pin: Option<String>,
    },
    /// Send an ECHO/REVERSE/TIME request over the legacy TCP transport.
    Stream {
        /// Server address, e.g. `127.0.0.1:4242`.
        #[arg(long)]
        server: SocketAddr,

        #[command(subcommand)]
        request: StreamRequest,
    },
    /// Prints the SHA-256 hash of a PEM certificate's DER bytes, hex-encoded,
    /// for use as `ping --pin`.
    CertHash {
        /// Path to the PEM certificate to hash.
        path: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
pub enum StreamRequest {
    Echo { message: String },
    Reverse { message: String },
    Time,
}
