//! Virtual machine configuration and state.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{McvError, McvResult};

/// Power state of a VM as seen from the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerState {
    Running,
    Stopped,
    /// Not registered on any node.
    Unknown,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LockState {
    #[default]
    Unlocked,
    Locked,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlocked => write!(f, "UNLOCKED"),
            Self::Locked => write!(f, "LOCKED"),
        }
    }
}

/// Guest-specific tweaks applied to the libvirt domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModificationFlag {
    /// Hyper-V enlightenments and a localtime clock for Windows guests.
    Windows,
}

impl fmt::Display for ModificationFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Windows => write!(f, "windows"),
        }
    }
}

impl FromStr for ModificationFlag {
    type Err = McvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "windows" => Ok(Self::Windows),
            _ => Err(McvError::InvalidModificationFlag(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GraphicsDriver {
    #[default]
    Vga,
    Cirrus,
    Virtio,
}

impl GraphicsDriver {
    pub fn model(self) -> &'static str {
        match self {
            Self::Vga => "vga",
            Self::Cirrus => "cirrus",
            Self::Virtio => "virtio",
        }
    }
}

impl FromStr for GraphicsDriver {
    type Err = McvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vga" => Ok(Self::Vga),
            "cirrus" => Ok(Self::Cirrus),
            "virtio" => Ok(Self::Virtio),
            _ => Err(McvError::InvalidArguments(format!("unknown graphics driver '{}'", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AutostartState {
    #[default]
    NoAutostart,
    OnBoot,
    OnPoll,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub interval: u64,
    pub reset_fail_count: u32,
    pub boot_wait: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAdapter {
    pub mac_address: String,
    pub network: String,
}

/// Persisted `vm/<id>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    pub id: String,
    pub name: String,
    pub cpu_cores: u32,
    /// Memory in bytes.
    pub memory: u64,
    #[serde(default)]
    pub graphics_driver: GraphicsDriver,
    /// Attached hard drive IDs, in disk-number order.
    #[serde(default)]
    pub hard_drives: Vec<String>,
    #[serde(default)]
    pub network_adapters: Vec<NetworkAdapter>,
    pub available_nodes: Vec<String>,
    /// Node the VM is registered on.
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub lock: LockState,
    #[serde(default)]
    pub delete_protection: bool,
    #[serde(default)]
    pub modifications: BTreeSet<ModificationFlag>,
    #[serde(default)]
    pub autostart: AutostartState,
    #[serde(default)]
    pub watchdog: Option<WatchdogConfig>,
    /// libvirt domain UUID, fixed at first registration.
    #[serde(default)]
    pub uuid: Option<String>,
    /// Bumped whenever a change affects the libvirt domain definition.
    #[serde(default)]
    pub version: u64,
    /// Version the local libvirt definition was generated from.
    #[serde(default)]
    pub applied_version: u64,
    #[serde(default)]
    pub clone_parent: Option<String>,
    #[serde(default)]
    pub clone_children: Vec<String>,
    #[serde(default)]
    pub iso: Option<String>,
}

impl VmConfig {
    pub fn new(id: String, name: String, cpu_cores: u32, memory: u64) -> Self {
        Self {
            id,
            name,
            cpu_cores,
            memory,
            graphics_driver: GraphicsDriver::default(),
            hard_drives: Vec::new(),
            network_adapters: Vec::new(),
            available_nodes: Vec::new(),
            node: None,
            lock: LockState::Unlocked,
            delete_protection: false,
            modifications: BTreeSet::new(),
            autostart: AutostartState::default(),
            watchdog: None,
            uuid: None,
            version: 0,
            applied_version: 0,
            clone_parent: None,
            clone_children: Vec::new(),
            iso: None,
        }
    }

    pub fn ensure_unlocked(&self) -> McvResult<()> {
        match self.lock {
            LockState::Unlocked => Ok(()),
            LockState::Locked => Err(McvError::VmLocked(format!("{} is locked", self.name))),
        }
    }

    pub fn is_registered_on(&self, node: &str) -> bool {
        self.node.as_deref() == Some(node)
    }

    /// Apply one change. Returns whether the libvirt definition is now stale.
    pub fn apply(&mut self, change: &VmConfigChange) -> McvResult<bool> {
        match change {
            VmConfigChange::SetNode(node) => {
                if let Some(n) = node {
                    if !self.available_nodes.contains(n) {
                        return Err(McvError::UnsuitableNode {
                            vm: self.name.clone(),
                            node: n.clone(),
                        });
                    }
                }
                self.node = node.clone();
            }
            VmConfigChange::SetLock(lock) => self.lock = *lock,
            VmConfigChange::SetDeleteProtection(enabled) => self.delete_protection = *enabled,
            VmConfigChange::AttachHardDrive(id) => {
                if !self.hard_drives.contains(id) {
                    self.hard_drives.push(id.clone());
                }
            }
            VmConfigChange::DetachHardDrive(id) => self.hard_drives.retain(|h| h != id),
            VmConfigChange::SetAvailableNodes(nodes) => {
                if let Some(n) = &self.node {
                    if !nodes.contains(n) {
                        return Err(McvError::UnsuitableNode {
                            vm: self.name.clone(),
                            node: n.clone(),
                        });
                    }
                }
                self.available_nodes = nodes.clone();
            }
            VmConfigChange::RemoveAvailableNode(node) => {
                if self.node.as_deref() == Some(node.as_str()) {
                    return Err(McvError::VmRegisteredElsewhere {
                        vm: self.name.clone(),
                        node: node.clone(),
                    });
                }
                self.available_nodes.retain(|n| n != node);
            }
            VmConfigChange::AddCloneChild(id) => {
                if !self.clone_children.contains(id) {
                    self.clone_children.push(id.clone());
                }
            }
            VmConfigChange::RemoveCloneChild(id) => self.clone_children.retain(|c| c != id),
            VmConfigChange::SetCpuCores(cores) => self.cpu_cores = *cores,
            VmConfigChange::SetMemory(memory) => self.memory = *memory,
            VmConfigChange::AddModification(flag) => {
                self.modifications.insert(*flag);
            }
            VmConfigChange::RemoveModification(flag) => {
                self.modifications.remove(flag);
            }
            VmConfigChange::AddNetworkAdapter(adapter) => {
                self.network_adapters.push(adapter.clone())
            }
            VmConfigChange::RemoveNetworkAdapter(mac) => {
                self.network_adapters.retain(|a| &a.mac_address != mac)
            }
            VmConfigChange::SetUuid(uuid) => self.uuid = Some(uuid.clone()),
            VmConfigChange::SetIso(iso) => self.iso = iso.clone(),
            VmConfigChange::MarkApplied => self.applied_version = self.version,
        }
        let stale = change.affects_domain();
        if stale {
            self.version += 1;
        }
        Ok(stale)
    }
}

/// One typed edit to a [`VmConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmConfigChange {
    SetNode(Option<String>),
    SetLock(LockState),
    SetDeleteProtection(bool),
    AttachHardDrive(String),
    DetachHardDrive(String),
    SetAvailableNodes(Vec<String>),
    RemoveAvailableNode(String),
    AddCloneChild(String),
    RemoveCloneChild(String),
    SetCpuCores(u32),
    SetMemory(u64),
    AddModification(ModificationFlag),
    RemoveModification(ModificationFlag),
    AddNetworkAdapter(NetworkAdapter),
    RemoveNetworkAdapter(String),
    SetUuid(String),
    SetIso(Option<String>),
    /// Record that the local libvirt definition matches `version`.
    MarkApplied,
}

impl VmConfigChange {
    /// Whether the change alters the libvirt domain definition.
    pub fn affects_domain(&self) -> bool {
        matches!(
            self,
            Self::AttachHardDrive(_)
                | Self::DetachHardDrive(_)
                | Self::SetCpuCores(_)
                | Self::SetMemory(_)
                | Self::AddModification(_)
                | Self::RemoveModification(_)
                | Self::AddNetworkAdapter(_)
                | Self::RemoveNetworkAdapter(_)
        )
    }
}

/// Returned by `vm info` and `vm list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    pub id: String,
    pub name: String,
    pub power_state: PowerState,
    pub lock: LockState,
    pub node: Option<String>,
    pub available_nodes: Vec<String>,
    pub cpu_cores: u32,
    pub memory: u64,
    pub hard_drives: Vec<String>,
    pub network_adapters: Vec<NetworkAdapter>,
    pub delete_protection: bool,
    pub modifications: Vec<ModificationFlag>,
    pub clone_parent: Option<String>,
    pub clone_children: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm() -> VmConfig {
        let mut vm = VmConfig::new("vm-0".into(), "vm1".into(), 2, 2048 * 1024 * 1024);
        vm.available_nodes = vec!["n1".into(), "n2".into()];
        vm
    }

    #[test]
    fn test_set_node_outside_available_nodes() {
        let mut vm = vm();
        vm.apply(&VmConfigChange::SetNode(Some("n1".into()))).unwrap();
        assert!(vm.is_registered_on("n1"));
        let err = vm.apply(&VmConfigChange::SetNode(Some("n3".into()))).unwrap_err();
        assert!(matches!(err, McvError::UnsuitableNode { .. }));
        assert!(vm.is_registered_on("n1"));
    }

    #[test]
    fn test_version_tracks_domain_changes() {
        let mut vm = vm();
        assert!(!vm.apply(&VmConfigChange::SetLock(LockState::Locked)).unwrap());
        assert_eq!(vm.version, 0);
        assert!(vm.apply(&VmConfigChange::SetCpuCores(4)).unwrap());
        assert_eq!(vm.version, 1);
        assert_ne!(vm.version, vm.applied_version);
        vm.apply(&VmConfigChange::MarkApplied).unwrap();
        assert_eq!(vm.version, vm.applied_version);
    }

    #[test]
    fn test_ensure_unlocked() {
        let mut vm = vm();
        assert!(vm.ensure_unlocked().is_ok());
        vm.lock = LockState::Locked;
        assert!(matches!(vm.ensure_unlocked(), Err(McvError::VmLocked(_))));
    }

    #[test]
    fn test_cannot_drop_registered_node_from_availability() {
        let mut vm = vm();
        vm.node = Some("n2".into());
        assert!(vm.apply(&VmConfigChange::RemoveAvailableNode("n2".into())).is_err());
        vm.apply(&VmConfigChange::RemoveAvailableNode("n1".into())).unwrap();
        assert_eq!(vm.available_nodes, vec!["n2".to_string()]);
    }

    #[test]
    fn test_modification_flag_parse() {
        assert_eq!("Windows".parse::<ModificationFlag>().unwrap(), ModificationFlag::Windows);
        assert!(matches!(
            "amiga".parse::<ModificationFlag>(),
            Err(McvError::InvalidModificationFlag(_))
        ));
    }
}
