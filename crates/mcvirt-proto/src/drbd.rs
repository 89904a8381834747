//! DRBD state model.
//!
//! The live state of a resource is the triple (connection, roles, disk
//! states) reported by `drbdadm cstate|role|dstate`. Each axis is bucketed
//! into OK / WARNING / BAD; a BAD state always fails a check, a WARNING
//! only when the caller has not asked to ignore DRBD.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{DRBD_META_FIXED_SECTORS, DRBD_SECTORS_PER_BITMAP_BLOCK, MIB};
use crate::error::{McvError, McvResult};

/// Generates an enum whose variants print and parse as their own names.
macro_rules! drbd_state_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $(Self::$variant => f.write_str(stringify!($variant))),+
                }
            }
        }

        impl FromStr for $name {
            type Err = McvError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim() {
                    $(stringify!($variant) => Ok(Self::$variant),)+
                    other => Err(McvError::UnexpectedReply(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

drbd_state_enum!(
    /// Connection state of a resource.
    ConnectionState {
        StandAlone,
        Disconnecting,
        Unconnected,
        WFConnection,
        WFReportParams,
        Connected,
        StartingSyncS,
        StartingSyncT,
        WFBitMapS,
        WFBitMapT,
        WFSyncUUID,
        SyncSource,
        SyncTarget,
        PausedSyncS,
        PausedSyncT,
        VerifyS,
        VerifyT,
        BrokenPipe,
        NetworkFailure,
        ProtocolError,
        TearDown,
        Timeout,
    }
);

drbd_state_enum!(Role { Primary, Secondary, Unknown });

drbd_state_enum!(DiskState {
    Diskless,
    Attaching,
    Failed,
    Negotiating,
    Inconsistent,
    Outdated,
    DUnknown,
    Consistent,
    UpToDate,
});

/// Health bucket of one state axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StateClass {
    Ok,
    Warning,
    Bad,
}

impl ConnectionState {
    pub fn class(self) -> StateClass {
        use ConnectionState::*;
        match self {
            Connected | VerifyS | VerifyT | SyncSource | StartingSyncS | PausedSyncS
            | WFBitMapS | WFBitMapT | WFSyncUUID => StateClass::Ok,
            StandAlone | Disconnecting | Unconnected | BrokenPipe | NetworkFailure
            | WFConnection | WFReportParams => StateClass::Warning,
            _ => StateClass::Bad,
        }
    }
}

impl DiskState {
    pub fn class(self) -> StateClass {
        match self {
            Self::UpToDate => StateClass::Ok,
            Self::Consistent | Self::DUnknown => StateClass::Warning,
            _ => StateClass::Bad,
        }
    }
}

/// Parse a `local/remote` pair as printed by `drbdadm role|dstate`.
pub fn parse_pair<T: FromStr<Err = McvError>>(output: &str) -> McvResult<(T, T)> {
    let trimmed = output.trim();
    let (local, remote) = trimmed.split_once('/').ok_or_else(|| {
        McvError::UnexpectedReply(format!("expected local/remote pair, got '{}'", trimmed))
    })?;
    Ok((local.parse()?, remote.parse()?))
}

/// Live state of one resource as seen from one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrbdStatus {
    pub connection: ConnectionState,
    pub local_role: Role,
    pub remote_role: Role,
    pub local_disk: DiskState,
    pub remote_disk: DiskState,
}

impl DrbdStatus {
    /// Worst class across the connection and disk axes.
    pub fn class(&self) -> StateClass {
        [
            self.connection.class(),
            self.local_disk.class(),
            self.remote_disk.class(),
        ]
        .into_iter()
        .max()
        .unwrap_or(StateClass::Ok)
    }

    /// Fail on BAD state, and on WARNING unless `ignore_warnings`.
    pub fn check(&self, resource: &str, ignore_warnings: bool) -> McvResult<()> {
        match self.class() {
            StateClass::Ok => Ok(()),
            StateClass::Warning if ignore_warnings => Ok(()),
            StateClass::Warning => Err(McvError::DrbdStateWarning {
                resource: resource.to_string(),
                state: self.to_string(),
            }),
            StateClass::Bad => Err(McvError::DrbdStateBad {
                resource: resource.to_string(),
                state: self.to_string(),
            }),
        }
    }

    /// The state online and offline migration require from the source
    /// node: connected, both disks up to date, local primary, remote
    /// secondary.
    pub fn check_migration_ready(&self, resource: &str) -> McvResult<()> {
        let ready = self.connection == ConnectionState::Connected
            && self.local_disk == DiskState::UpToDate
            && self.remote_disk == DiskState::UpToDate
            && self.local_role == Role::Primary
            && self.remote_role == Role::Secondary;
        if ready {
            Ok(())
        } else {
            Err(McvError::DrbdStateBad {
                resource: resource.to_string(),
                state: self.to_string(),
            })
        }
    }
}

impl fmt::Display for DrbdStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} {}/{}",
            self.connection, self.local_role, self.remote_role, self.local_disk, self.remote_disk
        )
    }
}

/// Size of the metadata volume for a raw volume of `raw_sectors`, in bytes
/// rounded up to a whole MiB.
pub fn meta_volume_size(raw_sectors: u64, sector_size: u64) -> u64 {
    let meta_sectors =
        raw_sectors.div_ceil(DRBD_SECTORS_PER_BITMAP_BLOCK) * 8 + DRBD_META_FIXED_SECTORS;
    (meta_sectors * sector_size).div_ceil(MIB) * MIB
}

/// DRBD node-level configuration stored in the global config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrbdNodeConfig {
    pub enabled: bool,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub sync_rate: Option<String>,
}

impl Default for DrbdNodeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            secret: None,
            protocol: default_protocol(),
            sync_rate: None,
        }
    }
}

fn default_protocol() -> String {
    "C".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(connection: ConnectionState, local: DiskState, remote: DiskState) -> DrbdStatus {
        DrbdStatus {
            connection,
            local_role: Role::Primary,
            remote_role: Role::Secondary,
            local_disk: local,
            remote_disk: remote,
        }
    }

    #[test]
    fn test_parse_states() {
        assert_eq!("WFConnection".parse::<ConnectionState>().unwrap(), ConnectionState::WFConnection);
        let (l, r): (Role, Role) = parse_pair("Primary/Secondary\n").unwrap();
        assert_eq!((l, r), (Role::Primary, Role::Secondary));
        let (l, r): (DiskState, DiskState) = parse_pair("UpToDate/DUnknown").unwrap();
        assert_eq!((l, r), (DiskState::UpToDate, DiskState::DUnknown));
        assert!(parse_pair::<Role>("Primary").is_err());
        assert!("Sleeping".parse::<ConnectionState>().is_err());
    }

    #[test]
    fn test_classification() {
        assert_eq!(ConnectionState::VerifyS.class(), StateClass::Ok);
        assert_eq!(ConnectionState::WFConnection.class(), StateClass::Warning);
        assert_eq!(ConnectionState::SyncTarget.class(), StateClass::Bad);
        assert_eq!(DiskState::Consistent.class(), StateClass::Warning);
        assert_eq!(DiskState::Inconsistent.class(), StateClass::Bad);

        // Roles do not affect health: a healthy secondary is Ok.
        let mut s = status(ConnectionState::Connected, DiskState::UpToDate, DiskState::UpToDate);
        s.local_role = Role::Secondary;
        s.remote_role = Role::Primary;
        assert_eq!(s.class(), StateClass::Ok);
    }

    #[test]
    fn test_check_honours_ignore_flag() {
        let ok = status(ConnectionState::Connected, DiskState::UpToDate, DiskState::UpToDate);
        assert!(ok.check("r", false).is_ok());

        let degraded = status(ConnectionState::WFConnection, DiskState::UpToDate, DiskState::DUnknown);
        assert!(matches!(degraded.check("r", false), Err(McvError::DrbdStateWarning { .. })));
        assert!(degraded.check("r", true).is_ok());

        let bad = status(ConnectionState::Connected, DiskState::Failed, DiskState::UpToDate);
        assert!(matches!(bad.check("r", true), Err(McvError::DrbdStateBad { .. })));
    }

    #[test]
    fn test_migration_ready() {
        let mut s = status(ConnectionState::Connected, DiskState::UpToDate, DiskState::UpToDate);
        assert!(s.check_migration_ready("r").is_ok());
        s.remote_role = Role::Primary;
        assert!(s.check_migration_ready("r").is_err());
    }

    #[test]
    fn test_meta_volume_size() {
        // 10 GiB of 512-byte sectors: 80 bitmap blocks * 8 + 72 = 712 sectors
        let raw_sectors = 10 * 1024 * MIB / 512;
        assert_eq!(meta_volume_size(raw_sectors, 512), MIB);
        // One sector past a bitmap block boundary rounds up
        assert_eq!(meta_volume_size(262_145, 512), MIB);
        // Large 4K-sector volume: 2 TiB / 4096 = 536870912 sectors
        let big = 2 * 1024 * 1024 * MIB / 4096;
        let sectors = (big / 262_144) * 8 + 72;
        assert_eq!(meta_volume_size(big, 4096), (sectors * 4096).div_ceil(MIB) * MIB);
    }
}
