use std::io;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to read {path:?}: {source}")]
    ReadPem { path: PathBuf, source: io::Error },

    #[error("No usable {kind} found in {path:?}")]
    InvalidPem { kind: &'static str, path: PathBuf },

    #[error("Invalid TLS configuration: {0}")]
    Tls(#[from] tokio_rustls::rustls::TLSError),

    #[error("Invalid server name {0:?}")]
    InvalidServerName(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("Timed out after {0:?} connecting to peer")]
    DialTimeout(Duration),

    #[error("Connection failed: {0}")]
    Connect(io::Error),

    #[error("TLS handshake failed: {0}")]
    Handshake(io::Error),

    #[error("Stream layer is closed")]
    Closed,
}
