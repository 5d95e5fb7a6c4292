//! Secure datagram (UDP/DTLS) front end: one shared socket demultiplexed
//! across per-peer sessions, handshake stepping, and PING/PONG dispatch.
//!
//! Unlike the stream front end, a single UDP socket carries every peer, so
//! there is no `mio` registry of per-connection tokens here: readiness is
//! a single-fd question, answered with a raw `poll(2)` wait rather than
//! pulling in `mio::net::UdpSocket` just to register one descriptor.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use sc_session::{DtlsContext, DtlsSession, SessionError, SessionState};
use sc_wire::{HEADER_SIZE, Header, MAX_MESSAGE_SIZE, MessageType, PROTOCOL_VERSION};
use tracing::{debug, info, warn};

pub const MAX_EMPTY_POLLS: u32 = 10;
pub const EPOLL_TIMEOUT_MS: i32 = 10;
pub const REAP_INTERVAL: Duration = Duration::from_secs(5);
pub const CLIENT_TIMEOUT_SECONDS: u64 = 30;

/// Minimal `Instant`-based interval gate for a single "has 5s elapsed"
/// check — reaping idle sessions needs nothing fancier.
struct Reaper {
    interval: Duration,
    last_fired: Instant,
}

impl Reaper {
    fn every(interval: Duration) -> Self {
        Self { interval, last_fired: Instant::now() }
    }

    fn fire_if_due(&mut self) -> bool {
        if self.last_fired.elapsed() >= self.interval {
            self.last_fired = Instant::now();
            true
        } else {
            false
        }
    }
}

fn wait_readable(fd: i32, timeout_ms: i32) -> io::Result<bool> {
    let mut fds = [libc::pollfd { fd, events: libc::POLLIN, revents: 0 }];
    let n = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout_ms) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n > 0)
}

/// Owns the shared UDP socket and the live per-peer session table. Runs
/// solely on the main thread, same as [`crate::stream::StreamFrontEnd`].
pub struct SecureFrontEnd {
    socket: Arc<UdpSocket>,
    ctx: Arc<DtlsContext>,
    sessions: HashMap<SocketAddr, DtlsSession>,
    reaper: Reaper,
    empty_polls: u32,
}

impl SecureFrontEnd {
    pub fn bind(addr: SocketAddr, ctx: Arc<DtlsContext>) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        info!(%addr, "secure front end listening");

        Ok(Self {
            socket: Arc::new(socket),
            ctx,
            sessions: HashMap::new(),
            reaper: Reaper::every(REAP_INTERVAL),
            empty_polls: 0,
        })
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Runs the adaptive-polling receive/dispatch loop until `shutdown` is
    /// observed set, reaping idle sessions every [`REAP_INTERVAL`].
    pub fn run(&mut self, shutdown: &AtomicBool) -> io::Result<()> {
        let fd = self.socket.as_raw_fd();
        let mut peek_buf = [0u8; MAX_MESSAGE_SIZE + HEADER_SIZE];

        while !shutdown.load(Ordering::Relaxed) {
            let timeout_ms = if self.empty_polls < MAX_EMPTY_POLLS { 0 } else { EPOLL_TIMEOUT_MS };

            if wait_readable(fd, timeout_ms)? {
                self.empty_polls = 0;
                self.service_one_datagram(&mut peek_buf);
            } else {
                self.empty_polls = self.empty_polls.saturating_add(1);
            }

            if self.reaper.fire_if_due() {
                self.reap_idle_sessions();
            }
        }
        Ok(())
    }

    /// Peeks the next datagram's sender without consuming it, routes to
    /// (or creates) that peer's session, and lets the session's own I/O
    /// consume the datagram during handshake or read. This is how one
    /// socket is demultiplexed across sessions by peer address.
    fn service_one_datagram(&mut self, peek_buf: &mut [u8]) {
        let peer = match self.socket.peek_from(peek_buf) {
            Ok((_, peer)) => peer,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!(error = %e, "failed to peek secure socket");
                return;
            }
        };

        let session = match self.sessions.entry(peer) {
            Entry::Occupied(o) => o.into_mut(),
            Entry::Vacant(v) => match DtlsSession::new(&self.ctx, Arc::clone(&self.socket), peer) {
                Ok(session) => {
                    info!(%peer, "new DTLS session");
                    v.insert(session)
                }
                Err(e) => {
                    warn!(%peer, error = %e, "failed to create DTLS session, discarding datagram");
                    let _ = self.socket.recv_from(peek_buf);
                    return;
                }
            },
        };

        if session.state() != SessionState::Established {
            self.advance_handshake(peer);
            return;
        }

        self.service_established(peer);
    }

    fn advance_handshake(&mut self, peer: SocketAddr) {
        let Some(session) = self.sessions.get_mut(&peer) else { return };
        match session.handshake() {
            Ok(()) => info!(%peer, "DTLS handshake established"),
            Err(e) if e.is_retryable() => {}
            Err(e) => {
                warn!(%peer, error = %e, "DTLS handshake failed");
                self.sessions.remove(&peer);
            }
        }
    }

    fn service_established(&mut self, peer: SocketAddr) {
        let mut body = vec![0u8; MAX_MESSAGE_SIZE + HEADER_SIZE];
        let Some(session) = self.sessions.get_mut(&peer) else { return };

        let n = match session.read(&mut body) {
            Ok(n) => n,
            Err(e) if e.is_retryable() => return,
            Err(SessionError::PeerClosed) => {
                debug!(%peer, "peer closed session");
                self.sessions.remove(&peer);
                return;
            }
            Err(e) => {
                warn!(%peer, error = %e, "DTLS read failed");
                self.sessions.remove(&peer);
                return;
            }
        };

        let response = build_response(&body[..n]);
        match session.write(&response) {
            Ok(_) => {}
            Err(e) if e.is_retryable() => {}
            Err(e) => {
                warn!(%peer, error = %e, "DTLS write failed");
                self.sessions.remove(&peer);
            }
        }
    }

    fn reap_idle_sessions(&mut self) {
        let timeout = Duration::from_secs(CLIENT_TIMEOUT_SECONDS);
        let stale: Vec<SocketAddr> =
            self.sessions.iter().filter(|(_, s)| s.is_idle_past(timeout)).map(|(addr, _)| *addr).collect();

        for addr in stale {
            if let Some(mut session) = self.sessions.remove(&addr) {
                session.close();
                debug!(%addr, "reaped idle session");
            }
        }
    }
}

/// Decides what to send back for one decrypted datagram:
/// a well-formed `PING` at the current protocol version is rewritten to
/// `PONG` in place; anything else — unrecognized type, unknown or invalid
/// `payload_length`, or an unrecognized protocol version — is echoed back
/// unchanged.
fn build_response(payload: &[u8]) -> Vec<u8> {
    match Header::decode(payload) {
        Ok(header) if header.protocol_version == PROTOCOL_VERSION && header.message_type == MessageType::PING => {
            let mut out = payload.to_vec();
            let pong = Header::new(MessageType::PONG, header.sequence_number, header.timestamp, header.payload_length);
            pong.encode(&mut out[..HEADER_SIZE]);
            out
        }
        _ => payload.to_vec(),
    }
}
