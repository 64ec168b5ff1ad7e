use crate::transport::TransportError;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::rustls::internal::pemfile;
use tokio_rustls::rustls::{
    AllowAnyAuthenticatedClient, Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig,
};

const ALPN_H2: &[u8] = b"h2";

/// TlsConfig names the PEM files a node presents and trusts. The same certificate is used for both
/// directions: every node is a server to its peers and a client of them, and each side verifies
/// the other against `ca_file`.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    pub ca_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// Name that peer certificates must be valid for.
    pub server_name: String,
}

impl TlsConfig {
    pub(crate) fn server_config(&self) -> Result<Arc<ServerConfig>, TransportError> {
        let roots = load_root_store(&self.ca_file)?;
        let mut config = ServerConfig::new(AllowAnyAuthenticatedClient::new(roots));
        config.set_single_cert(load_certs(&self.cert_file)?, load_private_key(&self.key_file)?)?;
        config.set_protocols(&[ALPN_H2.to_vec()]);
        Ok(Arc::new(config))
    }

    pub(crate) fn client_config(&self) -> Result<Arc<ClientConfig>, TransportError> {
        let mut config = ClientConfig::new();
        config.root_store = load_root_store(&self.ca_file)?;
        config.set_single_client_cert(load_certs(&self.cert_file)?, load_private_key(&self.key_file)?)?;
        config.set_protocols(&[ALPN_H2.to_vec()]);
        Ok(Arc::new(config))
    }
}

fn open(path: &Path) -> Result<BufReader<File>, TransportError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TransportError::ReadPem {
            path: path.to_path_buf(),
            source,
        })
}

fn invalid(kind: &'static str, path: &Path) -> TransportError {
    TransportError::InvalidPem {
        kind,
        path: path.to_path_buf(),
    }
}

fn load_root_store(path: &Path) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();
    match roots.add_pem_file(&mut open(path)?) {
        Ok((added, _)) if added > 0 => Ok(roots),
        _ => Err(invalid("CA certificate", path)),
    }
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>, TransportError> {
    match pemfile::certs(&mut open(path)?) {
        Ok(certs) if !certs.is_empty() => Ok(certs),
        _ => Err(invalid("certificate", path)),
    }
}

fn load_private_key(path: &Path) -> Result<PrivateKey, TransportError> {
    pemfile::pkcs8_private_keys(&mut open(path)?)
        .ok()
        .and_then(|mut keys| keys.pop())
        .ok_or_else(|| invalid("PKCS#8 private key", path))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn cert_path(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/certs").join(name)
    }

    pub(crate) fn peer_tls() -> TlsConfig {
        TlsConfig {
            ca_file: cert_path("ca.pem"),
            cert_file: cert_path("peer.pem"),
            key_file: cert_path("peer-key.pem"),
            server_name: "localhost".into(),
        }
    }

    #[test]
    fn loads_peer_identity() {
        let tls = peer_tls();
        tls.server_config().unwrap();
        tls.client_config().unwrap();
    }

    #[test]
    fn missing_file() {
        let mut tls = peer_tls();
        tls.ca_file = cert_path("does-not-exist.pem");
        assert!(matches!(tls.server_config(), Err(TransportError::ReadPem { .. })));
    }

    #[test]
    fn key_file_without_key() {
        let mut tls = peer_tls();
        tls.key_file = cert_path("peer.pem");
        assert!(matches!(
            tls.client_config(),
            Err(TransportError::InvalidPem { .. })
        ));
    }
}
