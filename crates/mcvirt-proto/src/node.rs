/// Cluster membership types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// What this node knows about one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub ip_address: String,
    /// Cluster-user credentials issued by the peer to this node.
    pub username: String,
    pub password: String,
}

/// The `cluster` section of the global config. The local node is implicit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub cluster_ip: Option<String>,
    #[serde(default)]
    pub nodes: BTreeMap<String, PeerRecord>,
}

impl ClusterConfig {
    pub fn peer_names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }
}

/// Summary returned by `node info` and `cluster list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub hostname: String,
    pub ip_address: Option<String>,
    pub version: String,
    pub drbd_enabled: bool,
    pub reachable: bool,
    /// Pre-v9 volume group, reported until the node has migrated.
    #[serde(default)]
    pub legacy_storage_vg: Option<String>,
}

/// What `add-node` learns about a candidate before joining it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMachineInfo {
    pub hostname: String,
    pub version: String,
    pub node_count: usize,
    pub vm_count: usize,
    pub vm_names: Vec<String>,
    pub drbd_installed: bool,
    pub drbd_enabled: bool,
}
