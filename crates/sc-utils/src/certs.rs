use std::path::{Path, PathBuf};

use tracing::debug;

const SYSTEM_CERT: &str = "/etc/space-captain/server.crt";
const SYSTEM_KEY: &str = "/etc/space-captain/server.key";
const LOCAL_CERT: &str = ".secrets/certs/server.crt";
const LOCAL_KEY: &str = ".secrets/certs/server.key";

/// Resolves the server certificate/key pair per §6: environment variable
/// override first (`SC_SERVER_CRT`/`SC_SERVER_KEY`), then the system path,
/// then the local development path. Returns both paths together so a
/// partial override (only one variable set) doesn't silently mix an
/// environment cert with a fallback key.
pub fn resolve_server_cert_paths() -> (PathBuf, PathBuf) {
    if let (Ok(crt), Ok(key)) = (std::env::var("SC_SERVER_CRT"), std::env::var("SC_SERVER_KEY")) {
        debug!(%crt, %key, "using certificate paths from environment");
        return (PathBuf::from(crt), PathBuf::from(key));
    }

    if Path::new(SYSTEM_CERT).exists() && Path::new(SYSTEM_KEY).exists() {
        debug!(path = SYSTEM_CERT, "using system certificate path");
        return (PathBuf::from(SYSTEM_CERT), PathBuf::from(SYSTEM_KEY));
    }

    debug!(path = LOCAL_CERT, "falling back to local development certificate path");
    (PathBuf::from(LOCAL_CERT), PathBuf::from(LOCAL_KEY))
}
