//! Authenticated, confidential DTLS-over-UDP sessions multiplexed over one
//! socket.

mod cert;
mod context;
mod error;
mod session;

pub use cert::cert_hash;
pub use context::{DtlsContext, DtlsRole};
pub use error::SessionError;
pub use session::{DtlsSession, SessionState};
