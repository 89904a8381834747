//! Users and permissions.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::McvError;

/// Kind of account a user record represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserKind {
    /// Human operator.
    Local,
    /// Bootstrap-only machine account handed out in a connect string.
    ConnectionUser,
    /// Machine account a peer node uses to call this node.
    ClusterUser,
}

impl UserKind {
    /// Machine accounts hold every permission and may proxy a human user.
    pub fn is_machine(self) -> bool {
        matches!(self, Self::ConnectionUser | Self::ClusterUser)
    }
}

impl fmt::Display for UserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::ConnectionUser => write!(f, "connection"),
            Self::ClusterUser => write!(f, "cluster"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    ChangeVmPowerState,
    CreateVm,
    ModifyVm,
    DeleteVm,
    SetVmLock,
    MigrateVm,
    ManageCluster,
    ManageStorageBackend,
    ManageDrbd,
    ManageUsers,
    SetSyncState,
    CanIgnoreCluster,
    CanIgnoreDrbd,
}

impl Permission {
    pub const ALL: [Permission; 13] = [
        Self::ChangeVmPowerState,
        Self::CreateVm,
        Self::ModifyVm,
        Self::DeleteVm,
        Self::SetVmLock,
        Self::MigrateVm,
        Self::ManageCluster,
        Self::ManageStorageBackend,
        Self::ManageDrbd,
        Self::ManageUsers,
        Self::SetSyncState,
        Self::CanIgnoreCluster,
        Self::CanIgnoreDrbd,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChangeVmPowerState => "change_vm_power_state",
            Self::CreateVm => "create_vm",
            Self::ModifyVm => "modify_vm",
            Self::DeleteVm => "delete_vm",
            Self::SetVmLock => "set_vm_lock",
            Self::MigrateVm => "migrate_vm",
            Self::ManageCluster => "manage_cluster",
            Self::ManageStorageBackend => "manage_storage_backend",
            Self::ManageDrbd => "manage_drbd",
            Self::ManageUsers => "manage_users",
            Self::SetSyncState => "set_sync_state",
            Self::CanIgnoreCluster => "can_ignore_cluster",
            Self::CanIgnoreDrbd => "can_ignore_drbd",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = McvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| McvError::InvalidArguments(format!("unknown permission '{}'", s)))
    }
}

/// A persisted user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub kind: UserKind,
    /// Hex-encoded random salt.
    pub salt: String,
    /// Hex-encoded SHA-512 of `salt || password`.
    pub password_hash: String,
    #[serde(default)]
    pub superuser: bool,
    #[serde(default)]
    pub permissions: BTreeSet<Permission>,
    /// For cluster users, the peer node the account was issued to.
    #[serde(default)]
    pub node: Option<String>,
}

impl UserRecord {
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.superuser || self.kind.is_machine() || self.permissions.contains(&permission)
    }
}

/// A user as shown by `user list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,
    pub kind: UserKind,
    pub superuser: bool,
    pub permissions: Vec<Permission>,
}
