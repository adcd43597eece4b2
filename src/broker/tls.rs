use std::fs::File;
use std::io::BufReader;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};

use crate::domain::errors::TransportError;

/// TLS material for the broker connection. Paths point at PEM files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    pub ca_certs: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

pub type TlsStream = StreamOwned<ClientConnection, TcpStream>;

fn tls_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Tls(e.to_string())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| TransportError::Tls(format!("no private key found in {}", path.display())))
}

impl TlsConfig {
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, TransportError> {
        let ca = self
            .ca_certs
            .as_deref()
            .ok_or_else(|| TransportError::Tls("a CA bundle is required for TLS".to_string()))?;
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca)? {
            roots.add(cert).map_err(tls_error)?;
        }

        let builder = ClientConfig::builder().with_root_certificates(roots);
        let config = match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
                .map_err(tls_error)?,
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(TransportError::Tls(
                    "cert_file and key_file must be configured together".to_string(),
                ))
            }
        };
        Ok(Arc::new(config))
    }
}

pub fn wrap(
    config: Arc<ClientConfig>,
    host: &str,
    tcp: TcpStream,
) -> Result<TlsStream, TransportError> {
    let name = ServerName::try_from(host.to_string()).map_err(tls_error)?;
    let conn = ClientConnection::new(config, name).map_err(tls_error)?;
    Ok(StreamOwned::new(conn, tcp))
}
