use std::io::{self, Read, Write};
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mbedtls::ssl::Context as TlsContext;
use mbedtls::ssl::context::Timer as MbedtlsTimer;
use mbedtls::x509::VerifyError;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::context::{DtlsContext, DtlsRole};
use crate::SessionError;

/// Per-session state machine: `Established` is entered iff
/// `handshake` returns `Ok`; any error from any state moves to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Handshaking,
    Established,
    Closing,
    Closed,
}

/// Bridges one peer's datagrams through the shared UDP socket to mbedtls's
/// non-blocking `Read`/`Write` expectations. A server-role socket is
/// demultiplexed across many sessions, so `read` discards (as `WouldBlock`)
/// any datagram not actually from this session's peer — this is how a
/// single socket is demultiplexed across many sessions.
struct UdpPeerIo {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl Read for UdpPeerIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.socket.recv_from(buf) {
            Ok((n, from)) if from == self.peer => Ok(n),
            Ok((_, from)) => {
                debug!(%from, peer = %self.peer, "discarding datagram from non-peer sender");
                Err(io::ErrorKind::WouldBlock.into())
            }
            Err(e) => Err(e),
        }
    }
}

impl Write for UdpPeerIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send_to(buf, self.peer)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Drives DTLS retransmission timing, mirroring
/// `mbedtls_timing_set_delay`/`mbedtls_timing_get_delay` (wired up on the C
/// side via `mbedtls_ssl_set_timer_cb`). Without this, the handshake state
/// machine has no way to decide when a flight over lossy UDP needs
/// resending, and retransmission simply never happens.
struct DtlsTimer {
    start: Option<Instant>,
    intermediate: Duration,
    final_deadline: Duration,
}

impl DtlsTimer {
    fn new() -> Self {
        Self { start: None, intermediate: Duration::ZERO, final_deadline: Duration::ZERO }
    }
}

impl MbedtlsTimer for DtlsTimer {
    fn set_delay(&mut self, int_ms: u32, fin_ms: u32) {
        self.start = Some(Instant::now());
        self.intermediate = Duration::from_millis(u64::from(int_ms));
        self.final_deadline = Duration::from_millis(u64::from(fin_ms));
    }

    fn get_delay(&self) -> i32 {
        let Some(start) = self.start else { return -1 };
        if self.final_deadline.is_zero() {
            return -1;
        }
        let elapsed = start.elapsed();
        if elapsed >= self.final_deadline {
            2
        } else if elapsed >= self.intermediate {
            1
        } else {
            0
        }
    }
}

/// A single peer's DTLS-over-UDP session.
pub struct DtlsSession {
    peer_addr: SocketAddr,
    state: SessionState,
    last_activity: Instant,
    pinned_hash: Option<[u8; 32]>,
    tls: TlsContext<UdpPeerIo>,
}

impl DtlsSession {
    /// Builds a session bound to `peer_addr` over `socket` (shared with
    /// every other session on the same listening port). The socket must
    /// already be non-blocking.
    pub fn new(ctx: &DtlsContext, socket: Arc<UdpSocket>, peer_addr: SocketAddr) -> Result<Self, SessionError> {
        let mut tls = TlsContext::new(ctx.config.clone());

        if ctx.role() == DtlsRole::Server {
            tls.set_client_transport_id(&transport_id_bytes(peer_addr))
                .map_err(|e| SessionError::Init(e.to_string()))?;
        }

        if ctx.role() == DtlsRole::Client {
            if let Some(pinned) = ctx.pinned_hash {
                tls.set_verify_callback(move |cert, depth, verify_err| {
                    if depth != 0 {
                        return Ok(());
                    }
                    let mut hasher = Sha256::new();
                    hasher.update(cert.as_der());
                    let actual: [u8; 32] = hasher.finalize().into();
                    if actual != pinned {
                        warn!("certificate hash mismatch - potential MITM attack");
                        verify_err.insert(VerifyError::CERT_OTHER);
                        return Err(mbedtls::Error::X509CertVerifyFailed);
                    }
                    verify_err.clear();
                    Ok(())
                });
            }
        }

        let io = UdpPeerIo { socket, peer: peer_addr };
        tls.set_io(io).map_err(|e| SessionError::Init(e.to_string()))?;
        tls.set_timer_callback(DtlsTimer::new());

        Ok(Self {
            peer_addr,
            state: SessionState::New,
            last_activity: Instant::now(),
            pinned_hash: ctx.pinned_hash,
            tls,
        })
    }

    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    #[must_use]
    pub fn is_idle_past(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }

    /// Drives the handshake one step. Safe to call repeatedly from a
    /// non-blocking event loop; each call either completes the handshake,
    /// reports that more I/O is needed, or fails terminally.
    pub fn handshake(&mut self) -> Result<(), SessionError> {
        self.state = SessionState::Handshaking;

        match self.tls.handshake() {
            Ok(()) => {
                self.state = SessionState::Established;
                self.last_activity = Instant::now();
                Ok(())
            }
            Err(mbedtls::Error::SslWantRead | mbedtls::Error::SslWantWrite) => Err(SessionError::WouldBlock),
            Err(mbedtls::Error::SslTimeout) => {
                self.state = SessionState::Closed;
                Err(SessionError::HandshakeTimeout)
            }
            Err(mbedtls::Error::X509CertVerifyFailed) => {
                self.state = SessionState::Closed;
                Err(SessionError::CertVerify)
            }
            Err(e) => {
                self.state = SessionState::Closed;
                Err(SessionError::Handshake(e.to_string()))
            }
        }
    }

    /// Non-blocking read of one plaintext record.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, SessionError> {
        match self.tls.read(buf) {
            Ok(0) => {
                self.state = SessionState::Closed;
                Err(SessionError::PeerClosed)
            }
            Ok(n) => {
                self.last_activity = Instant::now();
                Ok(n)
            }
            Err(e) if would_block(&e) => Err(SessionError::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                self.state = SessionState::Closed;
                Err(SessionError::PeerClosed)
            }
            Err(e) => {
                self.state = SessionState::Closed;
                Err(SessionError::Read(e.to_string()))
            }
        }
    }

    /// Non-blocking write of one plaintext record.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, SessionError> {
        match self.tls.write(buf) {
            Ok(n) => {
                self.last_activity = Instant::now();
                Ok(n)
            }
            Err(e) if would_block(&e) => Err(SessionError::WouldBlock),
            Err(e) => {
                self.state = SessionState::Closed;
                Err(SessionError::Write(e.to_string()))
            }
        }
    }

    /// Sends a close-notify alert. Does not free the session; the caller
    /// drops it afterward.
    pub fn close(&mut self) {
        self.state = SessionState::Closing;
        let _ = self.tls.close_notify();
        self.state = SessionState::Closed;
    }

    #[must_use]
    pub fn has_pin(&self) -> bool {
        self.pinned_hash.is_some()
    }
}

fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

/// A deterministic byte encoding of the peer's IP and port, used as the
/// cookie's client transport id.
fn transport_id_bytes(addr: SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut out = v4.ip().octets().to_vec();
            out.extend_from_slice(&v4.port().to_be_bytes());
            out
        }
        SocketAddr::V6(v6) => {
            let mut out = v6.ip().octets().to_vec();
            out.extend_from_slice(&v6.port().to_be_bytes());
            out
        }
    }
}
