//! Global node configuration (`mcvirt.json`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::auth::UserRecord;
use crate::constants::CONFIG_SCHEMA_VERSION;
use crate::defaults::{
    DEFAULT_AGENT_CONNECTION_TIMEOUT_SECS, DEFAULT_WATCHDOG_BOOT_WAIT_SECS,
    DEFAULT_WATCHDOG_INTERVAL_SECS, DEFAULT_WATCHDOG_RESET_FAIL_COUNT,
};
use crate::drbd::DrbdNodeConfig;
use crate::node::ClusterConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub connection_timeout: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_AGENT_CONNECTION_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogDefaults {
    pub enabled: bool,
    pub interval: u64,
    pub reset_fail_count: u32,
    pub boot_wait: u64,
}

impl Default for WatchdogDefaults {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: DEFAULT_WATCHDOG_INTERVAL_SECS,
            reset_fail_count: DEFAULT_WATCHDOG_RESET_FAIL_COUNT,
            boot_wait: DEFAULT_WATCHDOG_BOOT_WAIT_SECS,
        }
    }
}

/// Everything a node persists outside the per-entity files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub version: u32,
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// IDs of every VM known to the cluster.
    #[serde(default)]
    pub virtual_machines: Vec<String>,
    #[serde(default)]
    pub hard_drives: Vec<String>,
    #[serde(default)]
    pub storage_backends: Vec<String>,
    /// Network name to physical interface.
    #[serde(default)]
    pub networks: BTreeMap<String, String>,
    #[serde(default)]
    pub users: BTreeMap<String, UserRecord>,
    #[serde(default)]
    pub drbd: DrbdNodeConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub watchdog: WatchdogDefaults,
    #[serde(default)]
    pub default_storage_configured: bool,
    /// Pre-v9 volume group name, consumed by the storage migration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_storage_vg: Option<String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_SCHEMA_VERSION,
            cluster: ClusterConfig::default(),
            virtual_machines: Vec::new(),
            hard_drives: Vec::new(),
            storage_backends: Vec::new(),
            networks: BTreeMap::new(),
            users: BTreeMap::new(),
            drbd: DrbdNodeConfig::default(),
            agent: AgentConfig::default(),
            watchdog: WatchdogDefaults::default(),
            default_storage_configured: false,
            vm_storage_vg: None,
        }
    }
}

impl GlobalConfig {
    pub fn needs_migration(&self) -> bool {
        self.version < CONFIG_SCHEMA_VERSION
    }
}
