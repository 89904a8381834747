//! TLS transport and acceptor.
//!
//! Every node runs its own CA. A peer is trusted through the CA
//! certificate it handed over when it joined, stored as
//! `<ssl dir>/<hostname>/ca.pem`; the CLI trusts a single CA file.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::crypto::{ring, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use mcvirt_proto::{Envelope, McvError, McvResult, Request, Response};

use crate::conn_cache::ConnCache;
use crate::frame;
use crate::transport::{PeerAddr, Transport};

/// File name of a CA certificate inside a peer's directory.
pub const CA_CERT_FILE: &str = "ca.pem";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn tls_error(e: impl std::fmt::Display) -> McvError {
    McvError::Config(format!("TLS: {}", e))
}

/// Load every certificate from a PEM file.
pub fn load_certs(path: &Path) -> McvResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| McvError::Config(format!("open {}: {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| McvError::Config(format!("parse {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(McvError::Config(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

/// Load the first private key from a PEM file.
pub fn load_private_key(path: &Path) -> McvResult<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| McvError::Config(format!("open {}: {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| McvError::Config(format!("parse {}: {}", path.display(), e)))?
        .ok_or_else(|| McvError::Config(format!("no private key in {}", path.display())))
}

/// Build the server-side acceptor from a certificate chain and key.
pub fn build_acceptor(cert: &Path, key: &Path) -> McvResult<TlsAcceptor> {
    let certs = load_certs(cert)?;
    let key = load_private_key(key)?;
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(tls_error)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn client_config(ca_file: &Path) -> McvResult<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_file)? {
        roots.add(cert).map_err(tls_error)?;
    }
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Where trusted CA certificates come from.
#[derive(Debug, Clone)]
pub enum CaSource {
    /// `<dir>/<hostname>/ca.pem`, one CA per peer.
    PerPeer(PathBuf),
    /// One CA file trusted for every peer.
    File(PathBuf),
}

impl CaSource {
    fn path_for(&self, hostname: &str) -> PathBuf {
        match self {
            Self::PerPeer(dir) => dir.join(hostname).join(CA_CERT_FILE),
            Self::File(path) => path.clone(),
        }
    }
}

/// TLS transport.
pub struct TlsTransport {
    ca: CaSource,
    configs: DashMap<String, Arc<ClientConfig>>,
    cache: ConnCache<TlsStream<TcpStream>>,
    connect_timeout: Duration,
}

impl TlsTransport {
    pub fn new(ca: CaSource, max_conns_per_peer: usize, connect_timeout: Duration) -> Self {
        Self {
            ca,
            configs: DashMap::new(),
            cache: ConnCache::new(max_conns_per_peer),
            connect_timeout,
        }
    }

    fn config_for(&self, hostname: &str) -> McvResult<Arc<ClientConfig>> {
        if let Some(config) = self.configs.get(hostname) {
            return Ok(config.clone());
        }
        let config = client_config(&self.ca.path_for(hostname))?;
        self.configs.insert(hostname.to_string(), config.clone());
        Ok(config)
    }

    async fn connect(&self, peer: &PeerAddr) -> McvResult<TlsStream<TcpStream>> {
        let connector = TlsConnector::from(self.config_for(&peer.hostname)?);
        let server_name = ServerName::try_from(peer.hostname.clone())
            .map_err(|e| McvError::Config(format!("invalid server name {}: {}", peer.hostname, e)))?;
        let tcp = crate::net::connect_to(&peer.ip_address, peer.port, self.connect_timeout).await?;
        connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| McvError::CouldNotConnect(format!("{}: TLS handshake: {}", peer, e)))
    }
}

#[async_trait]
impl Transport for TlsTransport {
    fn name(&self) -> &str {
        "tls"
    }

    async fn send_request(
        &self,
        peer: &PeerAddr,
        envelope: Envelope,
        req: Request,
    ) -> McvResult<Response> {
        let key = peer.key();
        let mut stream = match self.cache.get(&key) {
            Some(stream) => stream,
            None => self.connect(peer).await?,
        };

        match frame::call(&mut stream, &envelope, &req).await {
            Ok(response) => {
                self.cache.put(&key, stream);
                Ok(response)
            }
            Err(e) => {
                debug!("TLS request to {} failed: {}", peer, e);
                self.cache.clear_peer(&key);
                Err(e)
            }
        }
    }

    fn forget_peer(&self, hostname: &str) {
        self.configs.remove(hostname);
    }

    async fn shutdown(&self) -> McvResult<()> {
        self.cache.clear_all();
        self.configs.clear();
        Ok(())
    }
}
