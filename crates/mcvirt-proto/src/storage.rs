//! Storage backend configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::McvError;

/// Type of a storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageType {
    /// LVM volume group; volumes are logical volumes.
    Lvm,
    /// Directory; volumes are raw image files.
    File,
}

impl StorageType {
    /// libvirt `<disk type=...>` for volumes on this backend.
    pub fn libvirt_device_type(self) -> &'static str {
        match self {
            Self::Lvm => "block",
            Self::File => "file",
        }
    }

    /// libvirt `<source ...=>` attribute name for volumes on this backend.
    pub fn libvirt_source_parameter(self) -> &'static str {
        match self {
            Self::Lvm => "dev",
            Self::File => "file",
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lvm => write!(f, "Lvm"),
            Self::File => write!(f, "File"),
        }
    }
}

impl FromStr for StorageType {
    type Err = McvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lvm" => Ok(Self::Lvm),
            "file" => Ok(Self::File),
            _ => Err(McvError::InvalidArguments(format!("unknown storage type '{}'", s))),
        }
    }
}

/// Per-node membership of a storage backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStorageConfig {
    /// Overrides the backend's default location on this node.
    #[serde(default)]
    pub location: Option<String>,
}

/// Persisted `storage/<id>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageBackendConfig {
    pub id: String,
    pub name: String,
    pub storage_type: StorageType,
    pub shared: bool,
    /// Volume group name or directory path used where no override is set.
    #[serde(default)]
    pub location: Option<String>,
    pub nodes: BTreeMap<String, NodeStorageConfig>,
}

impl StorageBackendConfig {
    /// Location of the backend on `node`, if `node` is a member.
    pub fn location_on(&self, node: &str) -> Option<&str> {
        let member = self.nodes.get(node)?;
        member.location.as_deref().or(self.location.as_deref())
    }

    pub fn is_available_on(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Either a default location is set or every member overrides it.
    pub fn locations_complete(&self) -> bool {
        self.location.is_some() || self.nodes.values().all(|n| n.location.is_some())
    }

    /// Nodes that hold an identity volume: every member, or for a shared
    /// backend just the first one.
    pub fn identity_nodes(&self) -> Vec<String> {
        if self.shared {
            self.nodes.keys().take(1).cloned().collect()
        } else {
            self.node_names()
        }
    }

    /// Whether hard drives on this backend can be replicated with DRBD.
    pub fn is_drbd_suitable(&self) -> bool {
        self.storage_type == StorageType::Lvm && !self.shared
    }
}

/// Summary returned by `storage list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageBackendInfo {
    pub id: String,
    pub name: String,
    pub storage_type: StorageType,
    pub shared: bool,
    pub location: Option<String>,
    pub nodes: BTreeMap<String, Option<String>>,
}

impl From<&StorageBackendConfig> for StorageBackendInfo {
    fn from(config: &StorageBackendConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            storage_type: config.storage_type,
            shared: config.shared,
            location: config.location.clone(),
            nodes: config
                .nodes
                .iter()
                .map(|(n, c)| (n.clone(), c.location.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(shared: bool, location: Option<&str>) -> StorageBackendConfig {
        let mut nodes = BTreeMap::new();
        nodes.insert("n1".to_string(), NodeStorageConfig::default());
        nodes.insert(
            "n2".to_string(),
            NodeStorageConfig { location: Some("vg_other".into()) },
        );
        StorageBackendConfig {
            id: "sb-0".into(),
            name: "default".into(),
            storage_type: StorageType::Lvm,
            shared,
            location: location.map(String::from),
            nodes,
        }
    }

    #[test]
    fn test_location_override() {
        let sb = backend(false, Some("vg_mcvirt"));
        assert_eq!(sb.location_on("n1"), Some("vg_mcvirt"));
        assert_eq!(sb.location_on("n2"), Some("vg_other"));
        assert_eq!(sb.location_on("n3"), None);
        assert!(sb.locations_complete());
    }

    #[test]
    fn test_locations_incomplete_without_default() {
        let sb = backend(false, None);
        assert!(!sb.locations_complete());
    }

    #[test]
    fn test_identity_nodes() {
        assert_eq!(backend(false, Some("vg")).identity_nodes(), vec!["n1", "n2"]);
        assert_eq!(backend(true, Some("vg")).identity_nodes(), vec!["n1"]);
    }

    #[test]
    fn test_storage_type_parse() {
        assert_eq!("LVM".parse::<StorageType>().unwrap(), StorageType::Lvm);
        assert_eq!("file".parse::<StorageType>().unwrap(), StorageType::File);
        assert!("zfs".parse::<StorageType>().is_err());
    }
}
