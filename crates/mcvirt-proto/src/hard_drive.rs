//! Hard drive configuration.
//!
//! A hard drive is a tagged variant: `Local` sits on a single volume,
//! `Drbd` on a replicated resource built from a `-raw` and a `-meta`
//! volume on each of its two nodes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{DRBD_META_SUFFIX, DRBD_RAW_SUFFIX, DRBD_RESOURCE_PREFIX};
use crate::error::McvError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HardDriveType {
    Local,
    Drbd,
}

impl fmt::Display for HardDriveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "Local"),
            Self::Drbd => write!(f, "Drbd"),
        }
    }
}

impl FromStr for HardDriveType {
    type Err = McvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "drbd" => Ok(Self::Drbd),
            _ => Err(McvError::InvalidArguments(format!("unknown hard drive type '{}'", s))),
        }
    }
}

/// Bus a disk is presented on inside the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DiskDriver {
    #[default]
    Virtio,
    Ide,
    Scsi,
    Sata,
}

impl DiskDriver {
    pub fn bus(self) -> &'static str {
        match self {
            Self::Virtio => "virtio",
            Self::Ide => "ide",
            Self::Scsi => "scsi",
            Self::Sata => "sata",
        }
    }

    /// Prefix of the guest device name (`vda`, `hda`, `sda`).
    pub fn device_prefix(self) -> &'static str {
        match self {
            Self::Virtio => "vd",
            Self::Ide => "hd",
            Self::Scsi | Self::Sata => "sd",
        }
    }
}

impl FromStr for DiskDriver {
    type Err = McvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "virtio" => Ok(Self::Virtio),
            "ide" => Ok(Self::Ide),
            "scsi" => Ok(Self::Scsi),
            "sata" => Ok(Self::Sata),
            _ => Err(McvError::InvalidArguments(format!("unknown disk driver '{}'", s))),
        }
    }
}

/// DRBD-specific part of a hard drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrbdDiskConfig {
    pub resource_name: String,
    pub minor: u32,
    pub port: u16,
    /// Whether the last verify or migration left the replica good.
    pub sync_state: bool,
}

impl DrbdDiskConfig {
    pub fn block_device_path(&self) -> String {
        format!("/dev/drbd{}", self.minor)
    }
}

/// Persisted `hard_drive/<id>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardDriveConfig {
    pub id: String,
    pub disk_type: HardDriveType,
    pub driver: DiskDriver,
    pub storage_backend: String,
    pub base_volume_name: String,
    /// Nodes holding this disk's volumes.
    pub nodes: Vec<String>,
    /// VM the disk is attached to.
    #[serde(default)]
    pub vm: Option<String>,
    /// 1-based disk number within the VM.
    pub disk_number: u32,
    #[serde(default)]
    pub drbd: Option<DrbdDiskConfig>,
}

impl HardDriveConfig {
    pub fn raw_volume(&self) -> String {
        match self.disk_type {
            HardDriveType::Local => self.base_volume_name.clone(),
            HardDriveType::Drbd => format!("{}-{}", self.base_volume_name, DRBD_RAW_SUFFIX),
        }
    }

    pub fn meta_volume(&self) -> Option<String> {
        match self.disk_type {
            HardDriveType::Local => None,
            HardDriveType::Drbd => {
                Some(format!("{}-{}", self.base_volume_name, DRBD_META_SUFFIX))
            }
        }
    }

    /// Every volume backing this disk on each of its nodes.
    pub fn volumes(&self) -> Vec<String> {
        let mut volumes = vec![self.raw_volume()];
        volumes.extend(self.meta_volume());
        volumes
    }

    pub fn drbd(&self) -> Result<&DrbdDiskConfig, McvError> {
        self.drbd
            .as_ref()
            .ok_or_else(|| McvError::InvalidArguments(format!("{} is not a DRBD disk", self.id)))
    }

    /// Name of the DRBD peer of `node`.
    pub fn peer_of(&self, node: &str) -> Option<&str> {
        self.nodes.iter().map(String::as_str).find(|n| *n != node)
    }

    /// Guest device target for this disk (`vda`, `vdb`, ...).
    pub fn target_device(&self) -> String {
        let index = self.disk_number.saturating_sub(1);
        let letter = (b'a' + (index % 26) as u8) as char;
        format!("{}{}", self.driver.device_prefix(), letter)
    }
}

/// Volume name of a `Local` disk.
pub fn local_volume_name(vm_name: &str, disk_number: u32) -> String {
    format!("{}-{}-disk-{}", DRBD_RESOURCE_PREFIX, vm_name, disk_number)
}

/// Base volume name of a `Drbd` disk; the two volumes append `-raw`/`-meta`.
pub fn drbd_base_volume_name(vm_name: &str, disk_number: u32) -> String {
    format!("{}-{}-disk-{}-drbd", DRBD_RESOURCE_PREFIX, vm_name, disk_number)
}

/// DRBD resource name of a disk.
pub fn drbd_resource_name(vm_name: &str, disk_number: u32) -> String {
    format!("{}-{}-disk-{}", DRBD_RESOURCE_PREFIX, vm_name, disk_number)
}

/// Summary returned by `hard-drive list` and `drbd list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardDriveInfo {
    pub id: String,
    pub disk_type: HardDriveType,
    pub driver: DiskDriver,
    pub storage_backend: String,
    pub vm: Option<String>,
    pub disk_number: u32,
    pub nodes: Vec<String>,
    pub size: Option<u64>,
    pub drbd: Option<DrbdDiskConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drbd_disk() -> HardDriveConfig {
        HardDriveConfig {
            id: "hd-0".into(),
            disk_type: HardDriveType::Drbd,
            driver: DiskDriver::Virtio,
            storage_backend: "sb-0".into(),
            base_volume_name: drbd_base_volume_name("vm1", 1),
            nodes: vec!["n1".into(), "n2".into()],
            vm: Some("vm-0".into()),
            disk_number: 1,
            drbd: Some(DrbdDiskConfig {
                resource_name: drbd_resource_name("vm1", 1),
                minor: 1,
                port: 7789,
                sync_state: true,
            }),
        }
    }

    #[test]
    fn test_drbd_volume_names() {
        let hdd = drbd_disk();
        assert_eq!(hdd.raw_volume(), "mcvirt_vm-vm1-disk-1-drbd-raw");
        assert_eq!(hdd.meta_volume().unwrap(), "mcvirt_vm-vm1-disk-1-drbd-meta");
        assert_eq!(hdd.drbd().unwrap().resource_name, "mcvirt_vm-vm1-disk-1");
        assert_eq!(hdd.drbd().unwrap().block_device_path(), "/dev/drbd1");
    }

    #[test]
    fn test_local_volume_names() {
        let mut hdd = drbd_disk();
        hdd.disk_type = HardDriveType::Local;
        hdd.base_volume_name = local_volume_name("vm1", 2);
        hdd.drbd = None;
        assert_eq!(hdd.volumes(), vec!["mcvirt_vm-vm1-disk-2".to_string()]);
        assert!(hdd.drbd().is_err());
    }

    #[test]
    fn test_peer_and_target() {
        let mut hdd = drbd_disk();
        assert_eq!(hdd.peer_of("n1"), Some("n2"));
        assert_eq!(hdd.target_device(), "vda");
        hdd.disk_number = 3;
        hdd.driver = DiskDriver::Ide;
        assert_eq!(hdd.target_device(), "hdc");
    }
}
