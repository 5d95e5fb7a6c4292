mod config;

use std::io::{Read, Write};
use std::net::{TcpStream, UdpSocket};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow, bail};
use clap::Parser;
use config::{ClientArgs, Command, StreamRequest};
use sc_session::{DtlsContext, DtlsSession, SessionState};
use sc_wire::stream::{STREAM_HEADER_SIZE, StreamHeader, StreamMessageType};
use sc_wire::{HEADER_SIZE, Header, MessageType};
use tracing::info;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ROUNDTRIP_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_SLEEP: Duration = Duration::from_millis(20);

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    match ClientArgs::parse().command {
        Command::Ping { server, pin } => run_or_fail(|| ping(server, pin.as_deref())),
        Command::Stream { server, request } => run_or_fail(|| stream_request(server, request)),
        Command::CertHash { path } => run_or_fail(|| cert_hash(&path)),
    }
}

fn run_or_fail(f: impl FnOnce() -> anyhow::Result<()>) -> ExitCode {
    match f() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn ping(server: std::net::SocketAddr, pin: Option<&str>) -> anyhow::Result<()> {
    let pinned_hash = pin.map(parse_hex_hash).transpose()?;

    let socket = UdpSocket::bind("0.0.0.0:0").context("binding client UDP socket")?;
    socket.set_nonblocking(true).context("setting client socket non-blocking")?;

    let ctx = DtlsContext::client(pinned_hash).context("initializing client DTLS context")?;
    let mut session =
        DtlsSession::new(&ctx, Arc::new(socket), server).context("creating DTLS session")?;

    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    loop {
        match session.handshake() {
            Ok(()) => break,
            Err(e) if e.is_retryable() => {
                if Instant::now() > deadline {
                    bail!("handshake timed out after {HANDSHAKE_TIMEOUT:?}");
                }
                std::thread::sleep(RETRY_SLEEP);
            }
            Err(e) => return Err(anyhow!(e).context("DTLS handshake failed")),
        }
    }
    info!(%server, "handshake established");

    let sequence_number = 1;
    let timestamp = unix_millis();
    let mut request = vec![0u8; HEADER_SIZE];
    Header::new(MessageType::PING, sequence_number, timestamp, 0).encode(&mut request);

    loop {
        match session.write(&request) {
            Ok(_) => break,
            Err(e) if e.is_retryable() => std::thread::sleep(RETRY_SLEEP),
            Err(e) => return Err(anyhow!(e).context("sending PING")),
        }
    }

    let deadline = Instant::now() + ROUNDTRIP_TIMEOUT;
    let mut buf = vec![0u8; HEADER_SIZE];
    let n = loop {
        match session.read(&mut buf) {
            Ok(n) => break n,
            Err(e) if e.is_retryable() => {
                if Instant::now() > deadline {
                    bail!("no response within {ROUNDTRIP_TIMEOUT:?}");
                }
                std::thread::sleep(RETRY_SLEEP);
            }
            Err(e) => return Err(anyhow!(e).context("reading PONG")),
        }
    };

    let response = Header::decode(&buf[..n]).context("decoding PONG header")?;
    if response.message_type != MessageType::PONG {
        bail!("expected PONG, got message type {:#06x}", response.message_type.0);
    }

    println!("PONG sequence_number={} timestamp={}", response.sequence_number, response.timestamp);
    session.close();
    debug_assert_eq!(session.state(), SessionState::Closed);
    Ok(())
}

fn stream_request(server: std::net::SocketAddr, request: StreamRequest) -> anyhow::Result<()> {
    let (message_type, body) = match request {
        StreamRequest::Echo { message } => (StreamMessageType::Echo, message.into_bytes()),
        StreamRequest::Reverse { message } => (StreamMessageType::Reverse, message.into_bytes()),
        StreamRequest::Time => (StreamMessageType::Time, Vec::new()),
    };

    let mut stream = TcpStream::connect(server).context("connecting to stream server")?;
    stream.set_nodelay(true).context("setting TCP_NODELAY")?;

    let header = StreamHeader::new(message_type, body.len() as u32);
    let mut frame = vec![0u8; STREAM_HEADER_SIZE + body.len()];
    header.encode(&mut frame[..STREAM_HEADER_SIZE]);
    frame[STREAM_HEADER_SIZE..].copy_from_slice(&body);
    stream.write_all(&frame).context("sending request")?;

    let mut response_header = [0u8; STREAM_HEADER_SIZE];
    stream.read_exact(&mut response_header).context("reading response header")?;
    let header = StreamHeader::decode(&response_header).context("decoding response header")?;

    let mut response_body = vec![0u8; header.length as usize];
    stream.read_exact(&mut response_body).context("reading response body")?;

    // REVERSE/TIME responses carry a trailing NUL terminator; stop printing there.
    let printable = match response_body.iter().position(|&b| b == 0) {
        Some(nul_at) => &response_body[..nul_at],
        None => &response_body[..],
    };
    match std::str::from_utf8(printable) {
        Ok(text) => println!("{text}"),
        Err(_) => println!("{printable:?}"),
    }
    Ok(())
}

fn cert_hash(path: &std::path::Path) -> anyhow::Result<()> {
    let hash = sc_session::cert_hash(path).context("hashing certificate")?;
    println!("{}", hex_encode(&hash));
    Ok(())
}

fn unix_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn parse_hex_hash(hex: &str) -> anyhow::Result<[u8; 32]> {
    if hex.len() != 64 {
        bail!("pinned hash must be 64 hex characters (32 bytes), got {}", hex.len());
    }
    let mut out = [0u8; 32];
    for (i, chunk) in out.iter_mut().enumerate() {
        *chunk = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).with_context(|| format!("invalid hex at byte {i}"))?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_encode_roundtrips_through_parse_hex_hash() {
        let bytes: [u8; 32] = std::array::from_fn(|i| i as u8);
        let encoded = hex_encode(&bytes);
        assert_eq!(parse_hex_hash(&encoded).unwrap(), bytes);
    }

    #[test]
    fn parse_hex_hash_rejects_wrong_length() {
        assert!(parse_hex_hash("abcd").is_err());
    }

    #[test]
    fn parse_hex_hash_rejects_non_hex() {
        let bogus = "z".repeat(64);
        assert!(parse_hex_hash(&bogus).is_err());
    }
}
