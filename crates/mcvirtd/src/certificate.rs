//! Certificate generator.
//!
//! Every node runs its own CA. Files under `<data dir>/ssl`:
//!
//!   ca.pem, ca-key.pem                 this node's CA
//!   server.pem, server-key.pem         server certificate signed by it
//!   <peer>/ca.pem                      CA of a peer
//!   <server>/clientcert.pem,
//!   <server>/clientkey.pem             client identity towards `server`
//!
//! Keys and certificates are produced by the `openssl` CLI through the
//! node's shell-out runner.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info};

use mcvirt_core::tls::CA_CERT_FILE;
use mcvirt_proto::defaults::{DEFAULT_CERT_VALIDITY_DAYS, DEFAULT_RSA_KEY_BITS};
use mcvirt_proto::request::CertOp;
use mcvirt_proto::{McvError, McvResult, Outcome, Reply, Request};

use crate::context::CallContext;
use crate::daemon::NodeState;

const CA_KEY_FILE: &str = "ca-key.pem";
const SERVER_CERT_FILE: &str = "server.pem";
const SERVER_KEY_FILE: &str = "server-key.pem";
const CLIENT_CERT_FILE: &str = "clientcert.pem";
const CLIENT_KEY_FILE: &str = "clientkey.pem";
const CSR_FILE: &str = "client.csr";

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Directory holding everything this node keeps about `peer`.
fn peer_dir(node: &NodeState, peer: &str) -> McvResult<PathBuf> {
    if peer.is_empty() || peer.contains('/') || peer == "." || peer == ".." {
        return Err(McvError::InvalidArguments(format!("invalid node name '{}'", peer)));
    }
    Ok(node.settings.ssl_dir().join(peer))
}

async fn write_file(path: &Path, content: &str) -> McvResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, content)
        .await
        .map_err(|e| McvError::Io(format!("write {}: {}", path.display(), e)))
}

async fn read_file(path: &Path) -> McvResult<String> {
    fs::read_to_string(path)
        .await
        .map_err(|e| McvError::Io(format!("read {}: {}", path.display(), e)))
}

async fn openssl(node: &NodeState, args: &[&str]) -> McvResult<String> {
    let output = node.runner.run("openssl", args).await?;
    if output.success() {
        Ok(output.stdout)
    } else {
        Err(McvError::Config(format!("openssl {}: {}", args.first().unwrap_or(&""), output.stderr.trim())))
    }
}

fn check_pem(what: &str, pem: &str) -> McvResult<()> {
    if pem.contains("-----BEGIN ") {
        Ok(())
    } else {
        Err(McvError::InvalidArguments(format!("{} is not PEM encoded", what)))
    }
}

/// Create this node's CA unless it exists.
pub async fn ensure_ca(node: &NodeState) -> McvResult<()> {
    let dir = node.settings.ssl_dir();
    let cert = dir.join(CA_CERT_FILE);
    if fs::try_exists(&cert).await.unwrap_or(false) {
        return Ok(());
    }
    fs::create_dir_all(&dir).await?;
    let key = dir.join(CA_KEY_FILE);
    let bits = format!("rsa:{}", DEFAULT_RSA_KEY_BITS);
    let days = DEFAULT_CERT_VALIDITY_DAYS.to_string();
    let subject = format!("/CN={} CA", node.hostname);
    openssl(
        node,
        &[
            "req", "-x509", "-nodes", "-newkey", &bits,
            "-keyout", &path_str(&key),
            "-out", &path_str(&cert),
            "-days", &days,
            "-subj", &subject,
        ],
    )
    .await?;
    info!("generated CA certificate for {}", node.hostname);
    Ok(())
}

pub async fn ca_cert(node: &NodeState) -> McvResult<String> {
    ensure_ca(node).await?;
    read_file(&node.settings.ssl_dir().join(CA_CERT_FILE)).await
}

/// Sign `csr` with this node's CA and return the certificate.
async fn sign(node: &NodeState, csr_path: &Path) -> McvResult<String> {
    ensure_ca(node).await?;
    let dir = node.settings.ssl_dir();
    let days = DEFAULT_CERT_VALIDITY_DAYS.to_string();
    openssl(
        node,
        &[
            "x509", "-req",
            "-in", &path_str(csr_path),
            "-CA", &path_str(&dir.join(CA_CERT_FILE)),
            "-CAkey", &path_str(&dir.join(CA_KEY_FILE)),
            "-CAcreateserial",
            "-copy_extensions", "copy",
            "-days", &days,
        ],
    )
    .await
}

/// Paths of this node's server certificate and key, generating and
/// self-signing them with the node CA on first use.
pub async fn ensure_server_cert(node: &NodeState) -> McvResult<(PathBuf, PathBuf)> {
    let dir = node.settings.ssl_dir();
    let cert = dir.join(SERVER_CERT_FILE);
    let key = dir.join(SERVER_KEY_FILE);
    if fs::try_exists(&cert).await.unwrap_or(false) {
        return Ok((cert, key));
    }
    ensure_ca(node).await?;
    let bits = format!("rsa:{}", DEFAULT_RSA_KEY_BITS);
    let subject = format!("/CN={}", node.hostname);
    let san = format!("subjectAltName=DNS:{},DNS:localhost,IP:127.0.0.1", node.hostname);
    let csr = openssl(
        node,
        &[
            "req", "-new", "-nodes", "-newkey", &bits,
            "-keyout", &path_str(&key),
            "-subj", &subject,
            "-addext", &san,
        ],
    )
    .await?;
    let csr_path = dir.join("server.csr");
    write_file(&csr_path, &csr).await?;
    let signed = sign(node, &csr_path).await?;
    write_file(&cert, &signed).await?;
    info!("generated server certificate for {}", node.hostname);
    Ok((cert, key))
}

pub async fn handle(node: &NodeState, _ctx: &CallContext, op: CertOp) -> McvResult<Outcome> {
    match op {
        CertOp::CaCert => Ok(Outcome::reply(Reply::Text(ca_cert(node).await?))),

        CertOp::AddPeerCa { peer, ca_cert } => {
            check_pem("CA certificate", &ca_cert)?;
            let path = peer_dir(node, &peer)?.join(CA_CERT_FILE);
            let previous = fs::read_to_string(&path).await.ok();
            write_file(&path, &ca_cert).await?;
            debug!("installed CA of {}", peer);
            let undo = match previous {
                Some(ca_cert) => CertOp::AddPeerCa { peer, ca_cert },
                None => CertOp::RemovePeer { peer },
            };
            Ok(Outcome::unit().with_compensation(Request::Cert(undo)))
        }

        CertOp::GenerateCsr { server } => {
            let dir = peer_dir(node, &server)?;
            fs::create_dir_all(&dir).await?;
            let bits = format!("rsa:{}", DEFAULT_RSA_KEY_BITS);
            let subject = format!("/CN={}", node.hostname);
            let csr = openssl(
                node,
                &[
                    "req", "-new", "-nodes", "-newkey", &bits,
                    "-keyout", &path_str(&dir.join(CLIENT_KEY_FILE)),
                    "-subj", &subject,
                ],
            )
            .await?;
            Ok(Outcome::reply(Reply::Text(csr)))
        }

        CertOp::SignCsr { client, csr } => {
            check_pem("CSR", &csr)?;
            let csr_path = peer_dir(node, &client)?.join(CSR_FILE);
            write_file(&csr_path, &csr).await?;
            let cert = sign(node, &csr_path).await?;
            debug!("signed client certificate for {}", client);
            Ok(Outcome::reply(Reply::Text(cert)))
        }

        CertOp::InstallClientCert { server, cert } => {
            check_pem("certificate", &cert)?;
            write_file(&peer_dir(node, &server)?.join(CLIENT_CERT_FILE), &cert).await?;
            debug!("installed client certificate for {}", server);
            Ok(Outcome::unit())
        }

        CertOp::RemovePeer { peer } => {
            let dir = peer_dir(node, &peer)?;
            if fs::try_exists(&dir).await.unwrap_or(false) {
                fs::remove_dir_all(&dir)
                    .await
                    .map_err(|e| McvError::Io(format!("remove {}: {}", dir.display(), e)))?;
            }
            info!("removed certificates of {}", peer);
            Ok(Outcome::unit())
        }
    }
}
