//! SHA-256 hashing of certificate DER bytes, used to both publish and pin
//! server certificates.

use std::path::Path;

use mbedtls::x509::Certificate;
use sha2::{Digest, Sha256};

use crate::SessionError;

/// Parses the certificate at `path` (PEM or DER, mbedtls auto-detects) and
/// returns the SHA-256 digest of its DER encoding. Parsing first (rather
/// than hashing the raw file bytes) makes the hash independent of PEM
/// comments, line endings, or extra chain entries appended after the leaf.
pub fn cert_hash(path: &Path) -> Result<[u8; 32], SessionError> {
    let mut raw = std::fs::read(path).map_err(|e| SessionError::Init(e.to_string()))?;
    if !raw.ends_with(&[0]) {
        raw.push(0); // mbedtls PEM parsing requires a NUL-terminated buffer
    }

    let certs = Certificate::from_pem_multiple(&raw).map_err(|e| SessionError::Init(e.to_string()))?;
    let leaf = certs.iter().next().ok_or_else(|| SessionError::Init("certificate file contains no entries".into()))?;

    let mut hasher = Sha256::new();
    hasher.update(leaf.as_der());
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reports_init_error() {
        let result = cert_hash(Path::new("/nonexistent/path/server.crt"));
        assert!(matches!(result, Err(SessionError::Init(_))));
    }
}
