//! Shared utilities for the mcvirt CLI.
//!
//! Provides the daemon client (connection flags, session cache, request
//! envelope) and formatting helpers used across all subcommands.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use mcvirt_core::tcp_transport::TcpTransport;
use mcvirt_core::tls::{CaSource, TlsTransport, CA_CERT_FILE};
use mcvirt_core::transport::{PeerAddr, Transport};
use mcvirt_proto::constants::MCVIRT_LISTEN_PORT;
use mcvirt_proto::defaults::{DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_DATA_DIR, DEFAULT_SESSION_FILE};
use mcvirt_proto::{Envelope, McvError, McvResult, Reply, Request};

/// Connection and authentication flags shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// Daemon address
    #[arg(short = 'a', long, global = true, default_value = "127.0.0.1")]
    pub address: String,

    /// Daemon port
    #[arg(short = 'p', long, global = true, default_value_t = MCVIRT_LISTEN_PORT)]
    pub port: u16,

    /// Connect over TLS
    #[arg(long, global = true)]
    pub tls: bool,

    /// CA certificate trusted for the daemon (defaults to the local node CA)
    #[arg(long, global = true)]
    pub ca_file: Option<PathBuf>,

    /// Username; a cached session is used when no password is given
    #[arg(short = 'U', long, global = true, env = "MCVIRT_USERNAME")]
    pub username: Option<String>,

    /// Password
    #[arg(short = 'P', long, global = true, env = "MCVIRT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Act on this node only, skipping cluster fan-out (permission required)
    #[arg(long, global = true)]
    pub ignore_cluster: bool,

    /// Ignore DRBD state checks (permission required)
    #[arg(long, global = true)]
    pub ignore_drbd: bool,
}

// ---------------------------------------------------------------------------
// Session cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedSession {
    pub username: String,
    pub session_id: String,
}

/// `$HOME/.mcvirt-session`, if a home directory is known.
pub fn default_session_file() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(DEFAULT_SESSION_FILE))
}

pub fn load_session(path: &Path) -> Option<CachedSession> {
    let data = std::fs::read(path).ok()?;
    match serde_json::from_slice(&data) {
        Ok(session) => Some(session),
        Err(e) => {
            warn!("ignoring unreadable session file {}: {}", path.display(), e);
            None
        }
    }
}

pub fn save_session(path: &Path, session: &CachedSession) -> McvResult<()> {
    let data = serde_json::to_vec(session)?;
    std::fs::write(path, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// One daemon, one authenticated user.
pub struct Client {
    transport: Box<dyn Transport>,
    peer: PeerAddr,
    username: Option<String>,
    password: Option<String>,
    session: Option<CachedSession>,
    session_file: Option<PathBuf>,
    ignore_cluster: bool,
    ignore_drbd: bool,
}

impl Client {
    pub fn new(args: &ConnectionArgs) -> Self {
        Self::with_session_file(args, default_session_file())
    }

    pub fn with_session_file(args: &ConnectionArgs, session_file: Option<PathBuf>) -> Self {
        let timeout = Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS);
        let transport: Box<dyn Transport> = if args.tls {
            let ca = args
                .ca_file
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR).join("ssl").join(CA_CERT_FILE));
            Box::new(TlsTransport::new(CaSource::File(ca), 1, timeout))
        } else {
            Box::new(TcpTransport::new(1, timeout))
        };
        let session = session_file.as_deref().and_then(load_session);
        Self {
            transport,
            peer: PeerAddr::new(&args.address, &args.address, args.port),
            username: args.username.clone(),
            password: args.password.clone(),
            session,
            session_file,
            ignore_cluster: args.ignore_cluster,
            ignore_drbd: args.ignore_drbd,
        }
    }

    /// Build the handshake: password if given, otherwise the cached session
    /// of the requested (or last) user.
    pub fn envelope(&self) -> McvResult<Envelope> {
        let mut envelope = match (&self.username, &self.password, &self.session) {
            (Some(user), Some(password), _) => Envelope::with_password(user, password),
            (Some(user), None, Some(s)) if &s.username == user => Envelope::with_session(user, &s.session_id),
            (None, None, Some(s)) => Envelope::with_session(&s.username, &s.session_id),
            (None, Some(_), _) => {
                return Err(McvError::InvalidArguments("--password needs --username".into()));
            }
            _ => {
                return Err(McvError::InvalidArguments(
                    "no cached session; log in with --username and --password".into(),
                ));
            }
        };
        envelope.ignore_cluster = self.ignore_cluster;
        envelope.ignore_drbd = self.ignore_drbd;
        Ok(envelope)
    }

    /// Send one request and return its reply, caching any session handed
    /// back by the daemon.
    pub async fn call(&self, req: Request) -> McvResult<Reply> {
        let envelope = self.envelope()?;
        let username = envelope.username.clone();
        debug!("{} -> {}", req.name(), self.peer);
        let response = self.transport.send_request(&self.peer, envelope, req).await?;

        if let (Some(path), Some(username), Some(session_id)) =
            (&self.session_file, username, response.session_id.clone())
        {
            let session = CachedSession { username, session_id };
            if self.session.as_ref() != Some(&session) {
                if let Err(e) = save_session(path, &session) {
                    warn!("failed to cache session in {}: {}", path.display(), e);
                }
            }
        }
        response.result.map(|outcome| outcome.reply)
    }

    /// Call and discard the reply.
    pub async fn run(&self, req: Request) -> McvResult<()> {
        self.call(req).await.map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Formatting and parsing
// ---------------------------------------------------------------------------

/// Format a byte count as a human-readable size string.
///
/// Examples: "1.0 GB", "512.0 MB", "4.0 TB"
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    const TB: u64 = 1024 * GB;

    if bytes >= TB {
        format!("{:.1} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Parse a size string with optional K/M/G/T suffix.
///
/// Examples: "100G" = 100 * 1024^3, "512M" = 512 * 1024^2, "1T" = 1024^4
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, multiplier) = match s.as_bytes().last() {
        Some(b'K' | b'k') => (&s[..s.len() - 1], 1024u64),
        Some(b'M' | b'm') => (&s[..s.len() - 1], 1024u64 * 1024),
        Some(b'G' | b'g') => (&s[..s.len() - 1], 1024u64 * 1024 * 1024),
        Some(b'T' | b't') => (&s[..s.len() - 1], 1024u64 * 1024 * 1024 * 1024),
        _ => (s, 1u64),
    };

    let num: u64 = num_str
        .parse()
        .map_err(|e| format!("invalid size '{}': {}", s, e))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| format!("size '{}' overflows u64", s))
}

/// Parse `node` or `node=location` member specs.
pub fn parse_node_locations(specs: &[String]) -> BTreeMap<String, Option<String>> {
    specs
        .iter()
        .map(|spec| match spec.split_once('=') {
            Some((node, location)) => (node.to_string(), Some(location.to_string())),
            None => (spec.clone(), None),
        })
        .collect()
}

pub fn or_dash(value: Option<&str>) -> String {
    value.unwrap_or("-").to_string()
}

/// Print a success message.
pub fn print_success(msg: &str) {
    println!("{}", msg);
}

/// Print an error message and exit.
pub fn exit_error(msg: &str) -> ! {
    eprintln!("Error: {}", msg);
    std::process::exit(1);
}
