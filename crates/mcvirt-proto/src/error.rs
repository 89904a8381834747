/// MCVirt error types.
///
/// A single enum covers every failure a node can report. It is serialized
/// into the response frame unchanged, so an error raised on a peer is
/// re-raised on the caller as the same variant.

use serde::{Deserialize, Serialize};

/// Unified error type for all MCVirt operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum McvError {
    // Authentication / authorisation
    #[error("authentication failed")]
    AuthenticationError,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("insufficient permission to set flag {0}")]
    InsufficientPermissionForFlag(String),
    #[error("user already exists: {0}")]
    UserAlreadyExists(String),
    #[error("user does not exist: {0}")]
    UserDoesNotExist(String),

    // Membership
    #[error("node is already present in the cluster: {0}")]
    NodeAlreadyPresent(String),
    #[error("node does not exist: {0}")]
    NodeDoesNotExist(String),
    #[error("remote node already contains objects: {0}")]
    RemoteObjectConflict(String),
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),
    #[error("could not connect to {0}")]
    CouldNotConnect(String),
    #[error("node is inaccessible: {0}")]
    InaccessibleNode(String),
    #[error("node {node} runs version {remote}, local version is {local}")]
    NodeVersionMismatch {
        node: String,
        local: String,
        remote: String,
    },
    #[error("missing cluster configuration: {0}")]
    MissingClusterConfiguration(String),

    // Storage
    #[error("storage backend does not exist: {0}")]
    StorageBackendDoesNotExist(String),
    #[error("storage backend already exists: {0}")]
    StorageBackendAlreadyExists(String),
    #[error("invalid storage location: {0}")]
    InvalidStorageLocation(String),
    #[error("storage backend {backend} is not available on node {node}")]
    StorageBackendNotAvailableOnNode { backend: String, node: String },
    #[error("storage backend is in use: {0}")]
    StorageBackendInUse(String),
    #[error("cannot remove the last node of storage backend {0}")]
    CannotRemoveLastNode(String),
    #[error("cannot unshare storage backend while in use: {0}")]
    CannotUnshareInUse(String),
    #[error("volume does not exist: {0}")]
    VolumeDoesNotExist(String),
    #[error("volume already exists: {0}")]
    VolumeAlreadyExists(String),
    #[error("volume is not active: {0}")]
    VolumeIsNotActive(String),
    #[error("storage command failed: {0}")]
    ExternalStorageCommandError(String),
    #[error("insufficient space on {node}: {required} bytes required, {available} available")]
    InsufficientSpace {
        node: String,
        required: u64,
        available: u64,
    },
    #[error("inconsistent volume size: {0}")]
    InconsistentVolumeSize(String),
    #[error("hard drive does not exist: {0}")]
    HardDriveDoesNotExist(String),
    #[error("hard drive is not compatible with the VM's existing disks: {0}")]
    IncompatibleHardDrive(String),
    #[error("DRBD-backed VMs cannot be cloned")]
    CannotCloneDrbdBasedVms,

    // DRBD
    #[error("DRBD state of {resource} is bad: {state}")]
    DrbdStateBad { resource: String, state: String },
    #[error("DRBD state of {resource} is degraded: {state}")]
    DrbdStateWarning { resource: String, state: String },
    #[error("DRBD volume is not in sync: {0}")]
    DrbdVolumeNotInSync(String),
    #[error("DRBD block device is missing: {0}")]
    DrbdBlockDeviceMissing(String),
    #[error("DRBD is not enabled on node {0}")]
    DrbdNotEnabledOnNode(String),
    #[error("DRBD is not installed on node {0}")]
    DrbdNotInstalled(String),
    #[error("DRBD is already enabled on node {0}")]
    DrbdAlreadyEnabled(String),

    // Virtual machines
    #[error("VM does not exist: {0}")]
    VmDoesNotExist(String),
    #[error("VM already exists: {0}")]
    VmAlreadyExists(String),
    #[error("VM is already registered: {0}")]
    VmAlreadyRegistered(String),
    #[error("VM {vm} is registered on node {node}")]
    VmRegisteredElsewhere { vm: String, node: String },
    #[error("VM is not registered: {0}")]
    VmNotRegistered(String),
    #[error("VM is already running: {0}")]
    VmAlreadyStarted(String),
    #[error("VM is already stopped: {0}")]
    VmAlreadyStopped(String),
    #[error("VM lock error: {0}")]
    VmLocked(String),
    #[error("VM is a clone: {0}")]
    VmIsClone(String),
    #[error("VM has clones and cannot be deleted: {0}")]
    CannotDeleteClonedVm(String),
    #[error("VM has clone children and cannot be started: {0}")]
    VmHasCloneChildren(String),
    #[error("delete protection is enabled for VM {0}")]
    DeleteProtectionEnabled(String),
    #[error("delete protection state error: {0}")]
    DeleteProtectionState(String),
    #[error("invalid confirmation code")]
    InvalidConfirmationCode,
    #[error("node {node} is not suitable for VM {vm}")]
    UnsuitableNode { vm: String, node: String },
    #[error("ISO is not present on the destination node: {0}")]
    IsoNotPresentOnDestination(String),
    #[error("VNC is not enabled for VM {0}")]
    VncNotEnabled(String),
    #[error("invalid modification flag: {0}")]
    InvalidModificationFlag(String),
    #[error("network does not exist: {0}")]
    NetworkDoesNotExist(String),
    #[error("network already exists: {0}")]
    NetworkAlreadyExists(String),
    #[error("network is in use: {0}")]
    NetworkInUse(String),
    #[error("interface {interface} does not exist on node {node}")]
    InterfaceDoesNotExist { node: String, interface: String },
    #[error("libvirt error: {0}")]
    LibvirtError(String),

    // Transactions
    #[error("undo failed: {undo} (while compensating for: {cause})")]
    UndoFailed {
        cause: Box<McvError>,
        undo: Box<McvError>,
    },

    // General
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("too many parameters: {0}")]
    TooManyParameters(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl McvError {
    /// Whether this error means a peer could not be reached at all, as
    /// opposed to the peer reporting a failure.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::CouldNotConnect(_) | Self::InaccessibleNode(_) | Self::NetworkError(_)
        )
    }

    /// Whether this error is a DRBD state check failure.
    pub fn is_drbd_state(&self) -> bool {
        matches!(self, Self::DrbdStateBad { .. } | Self::DrbdStateWarning { .. })
    }
}

impl From<std::io::Error> for McvError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for McvError {
    fn from(e: serde_json::Error) -> Self {
        Self::Config(e.to_string())
    }
}

/// Result type alias for MCVirt operations.
pub type McvResult<T> = Result<T, McvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = McvError::NodeVersionMismatch {
            node: "n2".into(),
            local: "10.0.2".into(),
            remote: "10.0.1".into(),
        };
        assert_eq!(e.to_string(), "node n2 runs version 10.0.1, local version is 10.0.2");
        assert_eq!(
            McvError::VmDoesNotExist("vm1".into()).to_string(),
            "VM does not exist: vm1"
        );
    }

    #[test]
    fn test_undo_failed_keeps_both_errors() {
        let e = McvError::UndoFailed {
            cause: Box::new(McvError::VolumeAlreadyExists("a".into())),
            undo: Box::new(McvError::NetworkError("reset".into())),
        };
        let data = bincode::serialize(&e).unwrap();
        let back: McvError = bincode::deserialize(&data).unwrap();
        assert_eq!(back, e);
        assert!(back.to_string().contains("volume already exists: a"));
    }

    #[test]
    fn test_connectivity_classification() {
        assert!(McvError::CouldNotConnect("n2".into()).is_connectivity());
        assert!(McvError::NetworkError("eof".into()).is_connectivity());
        assert!(!McvError::VmLocked("vm1".into()).is_connectivity());
    }
}
