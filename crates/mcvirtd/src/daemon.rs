//! Node-wide daemon state.
//!
//! One `NodeState` per daemon, shared behind an `Arc` by every connection
//! task. Everything a handler needs (config stores, shell-out runner,
//! hypervisor, peer transport, sessions, locks) hangs off it, so handlers
//! take `&NodeState` plus the per-call context and nothing global.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use mcvirt_core::command::CommandRunner;
use mcvirt_core::transport::{PeerAddr, Transport};
use mcvirt_proto::defaults::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_DRBD_DOWN_RETRY_SECS, DEFAULT_DRBD_UP_SETTLE_SECS,
    DEFAULT_MIGRATION_FAILURE_SETTLE_SECS, DEFAULT_POLL_INTERVAL_SECS,
    DEFAULT_ROLE_CHANGE_WAIT_SECS, DEFAULT_SESSION_LIFETIME_SECS, DEFAULT_SHUTDOWN_WAIT_SECS,
};
use mcvirt_proto::{McvError, McvResult};

use crate::config::ConfigStores;
use crate::libvirt::Hypervisor;
use crate::locks::ObjectLocks;
use crate::session::SessionManager;

/// Shared daemon state.
pub type SharedNode = Arc<NodeState>;

/// Waits and poll intervals used by the engines.
#[derive(Debug, Clone)]
pub struct Timings {
    pub drbd_up_settle: Duration,
    pub migration_failure_settle: Duration,
    pub poll_interval: Duration,
    pub role_change_wait: Duration,
    pub drbd_down_retry: Duration,
    pub shutdown_wait: Duration,
    pub connect_timeout: Duration,
    pub session_lifetime: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            drbd_up_settle: Duration::from_secs(DEFAULT_DRBD_UP_SETTLE_SECS),
            migration_failure_settle: Duration::from_secs(DEFAULT_MIGRATION_FAILURE_SETTLE_SECS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            role_change_wait: Duration::from_secs(DEFAULT_ROLE_CHANGE_WAIT_SECS),
            drbd_down_retry: Duration::from_secs(DEFAULT_DRBD_DOWN_RETRY_SECS),
            shutdown_wait: Duration::from_secs(DEFAULT_SHUTDOWN_WAIT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            session_lifetime: Duration::from_secs(DEFAULT_SESSION_LIFETIME_SECS),
        }
    }
}

impl Timings {
    /// No waiting at all, for tests.
    pub fn instant() -> Self {
        Self {
            drbd_up_settle: Duration::ZERO,
            migration_failure_settle: Duration::ZERO,
            poll_interval: Duration::ZERO,
            role_change_wait: Duration::ZERO,
            drbd_down_retry: Duration::ZERO,
            shutdown_wait: Duration::ZERO,
            connect_timeout: Duration::from_secs(1),
            session_lifetime: Duration::from_secs(DEFAULT_SESSION_LIFETIME_SECS),
        }
    }

    /// Number of polls that fit in `wait`; always at least one.
    pub fn attempts(&self, wait: Duration) -> u32 {
        if self.poll_interval.is_zero() {
            return 1;
        }
        let n = wait.as_millis() / self.poll_interval.as_millis().max(1);
        (n as u32).max(1)
    }
}

/// How strictly peer versions must match before a mutating request runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum VersionPolicy {
    /// Version strings must be identical.
    #[default]
    Exact,
    /// Major and minor components must match.
    Minor,
}

impl VersionPolicy {
    pub fn compatible(self, local: &str, remote: &str) -> bool {
        match self {
            Self::Exact => local == remote,
            Self::Minor => {
                let major_minor = |v: &str| v.split('.').take(2).collect::<Vec<_>>().join(".");
                major_minor(local) == major_minor(remote)
            }
        }
    }
}

/// Static settings of one daemon.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub drbd_config_dir: PathBuf,
    /// Port every daemon in the cluster listens on.
    pub port: u16,
    pub version: String,
    pub version_policy: VersionPolicy,
    pub timings: Timings,
}

impl Settings {
    pub fn ssl_dir(&self) -> PathBuf {
        self.data_dir.join("ssl")
    }
}

/// Daemon state.
pub struct NodeState {
    /// This node's name; the identity used in every config.
    pub hostname: String,
    pub settings: Settings,
    pub config: ConfigStores,
    pub runner: Arc<dyn CommandRunner>,
    pub hypervisor: Arc<dyn Hypervisor>,
    pub transport: Arc<dyn Transport>,
    pub sessions: SessionManager,
    pub locks: ObjectLocks,
    /// Serialises authentication and context set-up of incoming requests.
    pub admission: Mutex<()>,
    pub shutdown_notify: Arc<Notify>,
}

impl NodeState {
    pub async fn new(
        hostname: String,
        settings: Settings,
        runner: Arc<dyn CommandRunner>,
        hypervisor: Arc<dyn Hypervisor>,
        transport: Arc<dyn Transport>,
    ) -> McvResult<Self> {
        let config = ConfigStores::open(&settings.data_dir).await?;
        let sessions = SessionManager::new(settings.timings.session_lifetime);
        Ok(Self {
            hostname,
            settings,
            config,
            runner,
            hypervisor,
            transport,
            sessions,
            locks: ObjectLocks::new(),
            admission: Mutex::new(()),
            shutdown_notify: Arc::new(Notify::new()),
        })
    }

    pub fn is_local(&self, node: &str) -> bool {
        node == self.hostname
    }

    /// Names of every peer, excluding this node.
    pub async fn peers(&self) -> Vec<String> {
        self.config.global.get().await.cluster.peer_names()
    }

    /// This node followed by every peer.
    pub async fn all_nodes(&self) -> Vec<String> {
        let mut nodes = vec![self.hostname.clone()];
        nodes.extend(self.peers().await);
        nodes
    }

    /// Whether `node` is this node or a known peer.
    pub async fn is_cluster_node(&self, node: &str) -> bool {
        self.is_local(node) || self.config.global.get().await.cluster.nodes.contains_key(node)
    }

    pub async fn ensure_cluster_node(&self, node: &str) -> McvResult<()> {
        if self.is_cluster_node(node).await {
            Ok(())
        } else {
            Err(McvError::NodeDoesNotExist(node.to_string()))
        }
    }

    /// Cluster IP of this node.
    pub async fn cluster_ip(&self) -> McvResult<String> {
        self.config
            .global
            .get()
            .await
            .cluster
            .cluster_ip
            .ok_or_else(|| McvError::MissingClusterConfiguration("cluster IP is not set".into()))
    }

    /// Cluster IP of any node, this one included.
    pub async fn node_ip(&self, node: &str) -> McvResult<String> {
        if self.is_local(node) {
            return self.cluster_ip().await;
        }
        self.config
            .global
            .get()
            .await
            .cluster
            .nodes
            .get(node)
            .map(|peer| peer.ip_address.clone())
            .ok_or_else(|| McvError::NodeDoesNotExist(node.to_string()))
    }

    pub async fn peer_addr(&self, node: &str) -> McvResult<PeerAddr> {
        let ip = self.node_ip(node).await?;
        Ok(PeerAddr::new(node, &ip, self.settings.port))
    }

    pub async fn drbd_enabled(&self) -> bool {
        self.config.global.get().await.drbd.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_policy() {
        assert!(VersionPolicy::Exact.compatible("10.1.2", "10.1.2"));
        assert!(!VersionPolicy::Exact.compatible("10.1.2", "10.1.3"));
        assert!(VersionPolicy::Minor.compatible("10.1.2", "10.1.3"));
        assert!(!VersionPolicy::Minor.compatible("10.1.2", "10.2.0"));
    }

    #[test]
    fn test_attempts_never_zero() {
        let timings = Timings::instant();
        assert_eq!(timings.attempts(Duration::from_secs(15)), 1);

        let timings = Timings::default();
        assert_eq!(timings.attempts(Duration::from_secs(15)), 3);
        assert_eq!(timings.attempts(Duration::from_secs(1)), 1);
        assert_eq!(timings.attempts(timings.shutdown_wait), 120);
        assert_eq!(Timings::instant().attempts(Timings::instant().shutdown_wait), 1);
    }
}
