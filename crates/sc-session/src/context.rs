use std::path::Path;
use std::sync::Arc;

use mbedtls::pk::Pk;
use mbedtls::rng::{CtrDrbg, OsEntropy};
use mbedtls::ssl::config::{AuthMode, Endpoint, Preset, Transport};
use mbedtls::ssl::dtls_cookie::Context as CookieContext;
use mbedtls::ssl::Config;
use mbedtls::x509::Certificate;

use crate::SessionError;

/// Prefer AEAD suites with ECDHE key exchange, RSA before ECDSA signatures,
/// terminated by mbedtls's required zero sentinel.
const CIPHERSUITES: &[i32] = &[
    0xc02f, // TLS-ECDHE-RSA-WITH-AES-128-GCM-SHA256
    0xc030, // TLS-ECDHE-RSA-WITH-AES-256-GCM-SHA384
    0xc02b, // TLS-ECDHE-ECDSA-WITH-AES-128-GCM-SHA256
    0xc02c, // TLS-ECDHE-ECDSA-WITH-AES-256-GCM-SHA384
    0,
];

const READ_TIMEOUT_MS: u32 = 30_000;
const DRBG_PERSONALIZATION: &[u8] = b"space_captain_dtls";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsRole {
    Client,
    Server,
}

/// Process-wide DTLS configuration, shared (via `Arc`) across every session
/// of one role: a server context owns its certificate chain, key, and
/// cookie context; a client context optionally owns a pinned certificate
/// hash.
pub struct DtlsContext {
    pub(crate) role: DtlsRole,
    pub(crate) config: Arc<Config>,
    pub(crate) cookies: Option<Arc<CookieContext>>,
    pub(crate) pinned_hash: Option<[u8; 32]>,
}

impl DtlsContext {
    /// Builds a server context. Fails with [`SessionError::Init`] if the
    /// certificate or key cannot be loaded.
    pub fn server(cert_path: &Path, key_path: &Path) -> Result<Self, SessionError> {
        let rng = new_rng()?;

        let mut config = Config::new(Endpoint::Server, Transport::Datagram, Preset::Default);
        config.set_rng(rng.clone());
        config.set_ciphersuites(Arc::new(CIPHERSUITES.to_vec()));
        config.set_read_timeout(READ_TIMEOUT_MS);

        let cert_pem = std::fs::read(cert_path).map_err(|e| SessionError::Init(format!("reading {}: {e}", cert_path.display())))?;
        let key_pem = std::fs::read(key_path).map_err(|e| SessionError::Init(format!("reading {}: {e}", key_path.display())))?;
        let chain = Arc::new(Certificate::from_pem_multiple(&cert_pem).map_err(|e| SessionError::Init(e.to_string()))?);
        let key = Arc::new(Pk::from_private_key(&key_pem, None).map_err(|e| SessionError::Init(e.to_string()))?);
        config.push_cert(chain, key).map_err(|e| SessionError::Init(e.to_string()))?;

        let cookies = Arc::new(CookieContext::new(rng).map_err(|e| SessionError::Init(e.to_string()))?);
        config.set_dtls_cookies(cookies.clone());

        // No trust store on the server side; the only authentication this
        // protocol performs is the client's certificate pin, checked
        // client-side.
        config.set_authmode(AuthMode::None);

        Ok(Self { role: DtlsRole::Server, config: Arc::new(config), cookies: Some(cookies), pinned_hash: None })
    }

    /// Builds a client context, optionally pinning a 32-byte SHA-256
    /// server certificate hash obtained out of band (e.g. via
    /// [`crate::cert_hash`]).
    pub fn client(pinned_hash: Option<[u8; 32]>) -> Result<Self, SessionError> {
        let rng = new_rng()?;

        let mut config = Config::new(Endpoint::Client, Transport::Datagram, Preset::Default);
        config.set_rng(rng);
        config.set_ciphersuites(Arc::new(CIPHERSUITES.to_vec()));
        config.set_read_timeout(READ_TIMEOUT_MS);
        config.set_authmode(if pinned_hash.is_some() { AuthMode::Optional } else { AuthMode::None });

        Ok(Self { role: DtlsRole::Client, config: Arc::new(config), cookies: None, pinned_hash })
    }

    #[must_use]
    pub fn role(&self) -> DtlsRole {
        self.role
    }
}

fn new_rng() -> Result<Arc<CtrDrbg>, SessionError> {
    let entropy = Arc::new(OsEntropy::new().map_err(|e| SessionError::Init(e.to_string()))?);
    CtrDrbg::new(entropy, Some(DRBG_PERSONALIZATION))
        .map(Arc::new)
        .map_err(|e| SessionError::Init(e.to_string()))
}
