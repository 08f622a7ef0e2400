//! TLS support for transports. Contexts wrap rustls client/server configs
//! built from PEM files; the handshake itself is driven from readiness
//! events by the session state machine (TLS_INIT state), so the reactor
//! never blocks on it. A user-supplied `verify` capability inspects the
//! connection after the handshake and may reject the peer; the default
//! accepts.

use crate::error::{ErrorKind, NetError, NetResult};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, ClientConnection, PrivateKey, RootCertStore, ServerConfig, ServerConnection, ServerName};
use std::fs::File;
use std::io::{self, BufReader};
use std::convert::TryFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

pub type VerifyFn = dyn Fn(&PeerInfo) -> bool + Send + Sync;

/// What the post-handshake verify capability gets to look at.
pub struct PeerInfo<'a> {
    pub certificates: Option<&'a [Certificate]>,
    pub server_side: bool,
}

#[derive(Clone)]
pub struct TlsContext {
    client: Option<Arc<ClientConfig>>,
    server: Option<Arc<ServerConfig>>,
    server_name: String,
    verify: Option<Arc<VerifyFn>>,
}

impl TlsContext {
    /// Client-side context. With a CA file the peer chain is verified
    /// against it; without one any certificate is accepted (the transport
    /// still encrypts, and the `verify` capability can tighten things).
    pub fn client(server_name: &str, ca_file: Option<&Path>) -> io::Result<TlsContext> {
        let builder = ClientConfig::builder().with_safe_defaults();

        let config = match ca_file {
            Some(path) => {
                let mut roots = RootCertStore::empty();
                for cert in read_certs(path)? {
                    roots
                        .add(&cert)
                        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                }
                builder.with_root_certificates(roots).with_no_client_auth()
            }
            None => {
                let mut config = builder
                    .with_root_certificates(RootCertStore::empty())
                    .with_no_client_auth();
                config
                    .dangerous()
                    .set_certificate_verifier(Arc::new(AcceptAnyCert));
                config
            }
        };

        Ok(TlsContext {
            client: Some(Arc::new(config)),
            server: None,
            server_name: server_name.to_string(),
            verify: None,
        })
    }

    /// Server-side context from a certificate chain and private key.
    pub fn server(cert_file: &Path, key_file: &Path) -> io::Result<TlsContext> {
        let certs = read_certs(cert_file)?;
        let key = read_key(key_file)?;

        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        Ok(TlsContext {
            client: None,
            server: Some(Arc::new(config)),
            server_name: String::new(),
            verify: None,
        })
    }

    /// Installs the post-handshake peer check.
    pub fn set_verify<F>(&mut self, verify: F)
    where
        F: Fn(&PeerInfo) -> bool + Send + Sync + 'static,
    {
        self.verify = Some(Arc::new(verify));
    }

    #[inline]
    pub fn is_server(&self) -> bool {
        self.server.is_some()
    }

    pub(crate) fn new_client_conn(&self) -> NetResult<ClientConnection> {
        let config = self.client.clone().ok_or(NetError::Fatal(ErrorKind::Tls))?;
        let name = ServerName::try_from(self.server_name.as_str())
            .map_err(|_| NetError::Fatal(ErrorKind::Tls))?;
        ClientConnection::new(config, name).map_err(|_| NetError::Fatal(ErrorKind::Tls))
    }

    pub(crate) fn new_server_conn(&self) -> NetResult<ServerConnection> {
        let config = self.server.clone().ok_or(NetError::Fatal(ErrorKind::Tls))?;
        ServerConnection::new(config).map_err(|_| NetError::Fatal(ErrorKind::Tls))
    }

    /// Runs the verify capability over a completed handshake.
    pub(crate) fn verify_peer(&self, info: &PeerInfo) -> bool {
        match &self.verify {
            Some(verify) => verify(info),
            None => true,
        }
    }
}

fn read_certs(path: &Path) -> io::Result<Vec<Certificate>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)?;
    if certs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no certificates in file",
        ));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn read_key(path: &Path) -> io::Result<PrivateKey> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)?;
    if keys.is_empty() {
        let mut reader = BufReader::new(File::open(path)?);
        keys = rustls_pemfile::rsa_private_keys(&mut reader)?;
    }
    keys.pop().map(PrivateKey).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "no private key in file")
    })
}

/// Certificate verifier that accepts whatever the peer presents.
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
