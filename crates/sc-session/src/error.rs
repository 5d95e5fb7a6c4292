use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to initialize DTLS context: {0}")]
    Init(String),
    #[error("DTLS handshake failed: {0}")]
    Handshake(String),
    #[error("DTLS handshake timed out")]
    HandshakeTimeout,
    #[error("peer certificate failed pin verification")]
    CertVerify,
    #[error("DTLS read failed: {0}")]
    Read(String),
    #[error("DTLS write failed: {0}")]
    Write(String),
    #[error("operation would block")]
    WouldBlock,
    #[error("peer sent close-notify")]
    PeerClosed,
}

impl SessionError {
    /// True for the two outcomes that are routine ("try again"), not
    /// session-ending failures.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::WouldBlock)
    }
}
