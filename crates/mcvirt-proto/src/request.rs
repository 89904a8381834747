//! Request and response types for the MCVirt RPC protocol.
//!
//! Every call is one `(Envelope, Request)` frame answered by one
//! `Response` frame. The envelope carries authentication and the per-call
//! flags; the request is a two-level enum (area, then operation).
//!
//! Operations come in two flavours. High-level operations (create a VM,
//! add a node) are what operators call; they run on the node that receives
//! them and fan out. Internal operations (create a volume here, write this
//! config here) are the per-node steps those sagas are built from; only
//! peer daemons may call them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::auth::{Permission, UserInfo, UserKind, UserRecord};
use crate::constants::MCVIRT_PROTO_VER;
use crate::drbd::DrbdStatus;
use crate::error::{McvError, McvResult};
use crate::hard_drive::{DiskDriver, HardDriveConfig, HardDriveInfo, HardDriveType};
use crate::node::{NodeInfo, PeerRecord, RemoteMachineInfo};
use crate::storage::{StorageBackendConfig, StorageBackendInfo, StorageType};
use crate::vm::{
    GraphicsDriver, LockState, ModificationFlag, PowerState, VmConfig, VmConfigChange, VmInfo,
};

// ─── Envelope ───────────────────────────────────────────────────────────────

/// Per-call handshake annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub proto_ver: u8,
    /// Request ID (for matching responses)
    pub id: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub session_id: Option<String>,
    /// Human user a machine account is acting for.
    pub proxy_user: Option<String>,
    /// `None` means "use the default for my user kind".
    pub cluster_master: Option<bool>,
    pub has_lock: bool,
    pub ignore_cluster: bool,
    pub ignore_drbd: bool,
}

fn parse_bool(key: &str, value: &str) -> McvResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(McvError::Protocol(format!(
            "annotation {} expects a boolean, got '{}'",
            key, value
        ))),
    }
}

impl Envelope {
    pub fn with_password(username: &str, password: &str) -> Self {
        Self {
            proto_ver: MCVIRT_PROTO_VER,
            username: Some(username.to_string()),
            password: Some(password.to_string()),
            ..Default::default()
        }
    }

    pub fn with_session(username: &str, session_id: &str) -> Self {
        Self {
            proto_ver: MCVIRT_PROTO_VER,
            username: Some(username.to_string()),
            session_id: Some(session_id.to_string()),
            ..Default::default()
        }
    }

    /// Set a handshake annotation by its wire key (`USERNAME`,
    /// `CLUSTER_MASTER`, ...). Keys are case-insensitive.
    pub fn set_annotation(&mut self, key: &str, value: &str) -> McvResult<()> {
        match key.to_ascii_uppercase().as_str() {
            "USERNAME" => self.username = Some(value.to_string()),
            "PASSWORD" => self.password = Some(value.to_string()),
            "SESSION_ID" => self.session_id = Some(value.to_string()),
            "PROXY_USER" => self.proxy_user = Some(value.to_string()),
            "CLUSTER_MASTER" => self.cluster_master = Some(parse_bool(key, value)?),
            "HAS_LOCK" => self.has_lock = parse_bool(key, value)?,
            "IGNORE_CLUSTER" => self.ignore_cluster = parse_bool(key, value)?,
            "IGNORE_DRBD" => self.ignore_drbd = parse_bool(key, value)?,
            _ => {
                return Err(McvError::Protocol(format!("unknown annotation '{}'", key)));
            }
        }
        Ok(())
    }
}

// ─── Requests ───────────────────────────────────────────────────────────────

/// A volume on a storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRef {
    /// Storage backend ID.
    pub backend: String,
    pub name: String,
}

impl VolumeRef {
    pub fn new(backend: &str, name: &str) -> Self {
        Self {
            backend: backend.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for VolumeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.backend, self.name)
    }
}

/// Generates `name()` for an op enum from its variant list.
macro_rules! op_names {
    ($ty:ident, $area:literal, [$($variant:ident),+ $(,)?]) => {
        impl $ty {
            pub fn name(&self) -> &'static str {
                match self {
                    $(Self::$variant { .. } => concat!($area, ".", stringify!($variant))),+
                }
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthOp {
    /// Authenticate and obtain a session; does nothing else.
    Login,
    CreateUser {
        username: String,
        password: String,
        kind: UserKind,
    },
    DeleteUser {
        username: String,
    },
    /// `None` changes the caller's own password.
    ChangePassword {
        username: Option<String>,
        new_password: String,
    },
    SetPermission {
        username: String,
        permission: Permission,
        granted: bool,
    },
    SetSuperuser {
        username: String,
        superuser: bool,
    },
    ListUsers,
    // ---- internal ----
    /// Write (or with `None` remove) one user record on this node.
    PutUser {
        username: String,
        record: Option<UserRecord>,
    },
    /// Replace this node's user table.
    SyncUsers {
        users: BTreeMap<String, UserRecord>,
    },
    /// Issue a cluster user for peer `peer` to call this node with.
    CreateClusterUser {
        peer: String,
    },
}
op_names!(AuthOp, "auth", [
    Login, CreateUser, DeleteUser, ChangePassword, SetPermission, SetSuperuser, ListUsers,
    PutUser, SyncUsers, CreateClusterUser,
]);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeOp {
    Version,
    Info,
    SetClusterIp { ip: String },
    // ---- internal ----
    ListeningPorts,
    PathExists { path: String },
}
op_names!(NodeOp, "node", [Version, Info, SetClusterIp, ListeningPorts, PathExists]);

/// Per-node volume primitives. All internal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeOp {
    Create { volume: VolumeRef, size: u64 },
    Delete { volume: VolumeRef, ignore_missing: bool },
    Activate { volume: VolumeRef },
    Deactivate { volume: VolumeRef },
    /// Zero the whole volume.
    Wipe { volume: VolumeRef },
    Resize { volume: VolumeRef, delta: u64, increase: bool },
    Snapshot { volume: VolumeRef, dest: String, size: u64 },
    /// Copy the contents of `source` onto `dest` on this node.
    Copy { source: VolumeRef, dest: VolumeRef },
    Size { volume: VolumeRef },
    Sectors { volume: VolumeRef },
    SectorSize { volume: VolumeRef },
    Exists { volume: VolumeRef },
    Path { volume: VolumeRef },
    FreeSpace { backend: String },
}
op_names!(VolumeOp, "volume", [
    Create, Delete, Activate, Deactivate, Wipe, Resize, Snapshot, Copy, Size, Sectors,
    SectorSize, Exists, Path, FreeSpace,
]);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageOp {
    Create {
        name: String,
        storage_type: StorageType,
        location: Option<String>,
        shared: bool,
        /// Member nodes with optional per-node location override.
        nodes: BTreeMap<String, Option<String>>,
    },
    Delete { name: String },
    AddNode { name: String, node: String, location: Option<String> },
    RemoveNode { name: String, node: String },
    SetLocation { name: String, location: String, node: Option<String> },
    SetShared { name: String, shared: bool },
    FreeSpace { name: String, nodes: Option<Vec<String>> },
    List,
    // ---- internal ----
    /// Verify a backend location is usable on this node.
    NodePreCheck { storage_type: StorageType, location: String },
    PutConfig { id: String, config: Option<StorageBackendConfig> },
    /// Verify the identity volume of a backend exists on this node.
    EnsureAvailable { id: String },
}
op_names!(StorageOp, "storage", [
    Create, Delete, AddNode, RemoveNode, SetLocation, SetShared, FreeSpace, List,
    NodePreCheck, PutConfig, EnsureAvailable,
]);

/// `drbdadm` actions run against one resource on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrbdAction {
    CreateMd,
    Up,
    Down,
    Connect,
    Disconnect,
    Primary,
    Secondary,
    /// Become primary, overwriting the peer's data.
    OverwritePeer,
    Resize,
    Verify,
    InvalidateRemote,
    AllowTwoPrimaries,
    DisallowTwoPrimaries,
    /// Apply a rewritten resource file to the running resource.
    Adjust,
}

impl DrbdAction {
    /// Action that reverses this one, where one exists.
    pub fn inverse(self) -> Option<Self> {
        match self {
            Self::Up => Some(Self::Down),
            Self::Connect => Some(Self::Disconnect),
            Self::AllowTwoPrimaries => Some(Self::DisallowTwoPrimaries),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrbdOp {
    /// Enable DRBD on every node with one shared secret.
    Enable { secret: Option<String> },
    List,
    /// Called by the DRBD out-of-sync handler.
    OutOfSync { resource: String },
    // ---- internal ----
    EnableLocal { secret: String },
    IsInstalled,
    Adm { hard_drive: String, action: DrbdAction },
    WriteResourceConfig { hard_drive: String },
    RemoveResourceConfig { hard_drive: String },
    Status { hard_drive: String },
    /// Wait until the local role is `Secondary`.
    WaitSecondary { hard_drive: String },
}
op_names!(DrbdOp, "drbd", [
    Enable, List, OutOfSync, EnableLocal, IsInstalled, Adm, WriteResourceConfig,
    RemoveResourceConfig, Status, WaitSecondary,
]);

/// Hard drives are addressed by VM name and 1-based disk number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HardDriveOp {
    /// Create a disk and attach it to an existing VM.
    Create {
        vm: String,
        size: u64,
        storage_type: Option<HardDriveType>,
        backend: Option<String>,
        driver: DiskDriver,
    },
    /// Detach a disk and delete its storage.
    Delete { vm: String, disk_number: u32 },
    Resize { vm: String, disk_number: u32, increase: u64 },
    Verify { vm: String, disk_number: u32 },
    VerifyAll,
    Resync {
        vm: String,
        disk_number: u32,
        source_node: Option<String>,
        auto_determine: bool,
    },
    SetSyncState { vm: String, disk_number: u32, sync_state: bool },
    List,
    // ---- internal ----
    PutConfig { id: String, config: Option<HardDriveConfig> },
    Activate { id: String },
    Deactivate { id: String },
    /// Move the DRBD peer of a disk from `source` to `dest`. Runs on the
    /// node that keeps its replica.
    MoveReplica { id: String, source: String, dest: String },
}
op_names!(HardDriveOp, "hard_drive", [
    Create, Delete, Resize, Verify, VerifyAll, Resync, SetSyncState, List, PutConfig,
    Activate, Deactivate, MoveReplica,
]);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmOp {
    Create {
        name: String,
        cpu_cores: u32,
        memory: u64,
        /// Size of each disk to create, in bytes.
        disks: Vec<u64>,
        networks: Vec<String>,
        storage_type: Option<HardDriveType>,
        backend: Option<String>,
        driver: DiskDriver,
        available_nodes: Option<Vec<String>>,
        graphics: GraphicsDriver,
    },
    Delete { name: String, keep_disks: bool, keep_config: bool },
    Start { name: String, iso: Option<String> },
    Stop { name: String },
    Shutdown { name: String },
    Reset { name: String },
    Register { name: String, node: Option<String> },
    Unregister { name: String },
    SetLock { name: String, lock: LockState },
    SetDeleteProtection { name: String, enabled: bool, confirm: Option<String> },
    Migrate {
        name: String,
        node: String,
        online: bool,
        start: bool,
        wait_for_shutdown: bool,
    },
    /// Move the storage of a VM from one node to another.
    Move { name: String, source: String, dest: String },
    Clone { name: String, new_name: String },
    Duplicate { name: String, new_name: String, backend: Option<String> },
    Update {
        name: String,
        cpu_cores: Option<u32>,
        memory: Option<u64>,
        add_flags: Vec<ModificationFlag>,
        remove_flags: Vec<ModificationFlag>,
        add_network: Option<String>,
        remove_network: Option<String>,
    },
    Info { name: String },
    List,
    Backup { name: String, disk_number: u32, delete: bool },
    // ---- internal ----
    PutConfig { id: String, config: Option<VmConfig> },
    /// Drop the VM from this node but leave its config file on disk.
    ForgetConfig { id: String },
    UpdateConfig { id: String, change: VmConfigChange, reason: String },
    /// Activate disks and define the libvirt domain on this node.
    DefineLocal { id: String },
    /// Undefine the libvirt domain on this node and deactivate disks.
    UndefineLocal { id: String },
    PowerState { id: String },
}
op_names!(VmOp, "vm", [
    Create, Delete, Start, Stop, Shutdown, Reset, Register, Unregister, SetLock,
    SetDeleteProtection, Migrate, Move, Clone, Duplicate, Update, Info, List, Backup,
    PutConfig, ForgetConfig, UpdateConfig, DefineLocal, UndefineLocal, PowerState,
]);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterOp {
    GetConnectString,
    AddNode { connect_string: String },
    RemoveNode { hostname: String, delete_orphaned_vms: bool },
    List,
    // ---- internal ----
    PutPeer { hostname: String, record: Option<PeerRecord> },
    RemoteMachineInfo,
}
op_names!(ClusterOp, "cluster", [
    GetConnectString, AddNode, RemoveNode, List, PutPeer, RemoteMachineInfo,
]);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkOp {
    Create { name: String, physical_interface: String },
    Delete { name: String },
    List,
    // ---- internal ----
    Put { name: String, physical_interface: Option<String> },
    Sync { networks: BTreeMap<String, String> },
    CheckInterface { interface: String },
}
op_names!(NetworkOp, "network", [Create, Delete, List, Put, Sync, CheckInterface]);

/// Certificate exchange between nodes. All internal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CertOp {
    CaCert,
    AddPeerCa { peer: String, ca_cert: String },
    /// Generate a client key and CSR for talking to libvirt on `server`.
    GenerateCsr { server: String },
    /// Sign a CSR from `client` with this node's CA.
    SignCsr { client: String, csr: String },
    InstallClientCert { server: String, cert: String },
    RemovePeer { peer: String },
}
op_names!(CertOp, "cert", [
    CaCert, AddPeerCa, GenerateCsr, SignCsr, InstallClientCert, RemovePeer,
]);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Auth(AuthOp),
    Node(NodeOp),
    Volume(VolumeOp),
    Storage(StorageOp),
    Drbd(DrbdOp),
    HardDrive(HardDriveOp),
    Vm(VmOp),
    Cluster(ClusterOp),
    Network(NetworkOp),
    Cert(CertOp),
}

impl Request {
    /// Dotted operation name for logging (`vm.Start`).
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auth(op) => op.name(),
            Self::Node(op) => op.name(),
            Self::Volume(op) => op.name(),
            Self::Storage(op) => op.name(),
            Self::Drbd(op) => op.name(),
            Self::HardDrive(op) => op.name(),
            Self::Vm(op) => op.name(),
            Self::Cluster(op) => op.name(),
            Self::Network(op) => op.name(),
            Self::Cert(op) => op.name(),
        }
    }

    /// Per-node steps only peer daemons may call.
    pub fn is_internal(&self) -> bool {
        match self {
            Self::Volume(_) | Self::Cert(_) => true,
            Self::Auth(op) => matches!(
                op,
                AuthOp::PutUser { .. } | AuthOp::SyncUsers { .. } | AuthOp::CreateClusterUser { .. }
            ),
            Self::Node(op) => matches!(op, NodeOp::ListeningPorts | NodeOp::PathExists { .. }),
            Self::Storage(op) => matches!(
                op,
                StorageOp::NodePreCheck { .. }
                    | StorageOp::PutConfig { .. }
                    | StorageOp::EnsureAvailable { .. }
            ),
            Self::Drbd(op) => !matches!(
                op,
                DrbdOp::Enable { .. } | DrbdOp::List | DrbdOp::OutOfSync { .. }
            ),
            Self::HardDrive(op) => matches!(
                op,
                HardDriveOp::PutConfig { .. }
                    | HardDriveOp::Activate { .. }
                    | HardDriveOp::Deactivate { .. }
                    | HardDriveOp::MoveReplica { .. }
            ),
            Self::Vm(op) => matches!(
                op,
                VmOp::PutConfig { .. }
                    | VmOp::ForgetConfig { .. }
                    | VmOp::UpdateConfig { .. }
                    | VmOp::DefineLocal { .. }
                    | VmOp::UndefineLocal { .. }
                    | VmOp::PowerState { .. }
            ),
            Self::Cluster(op) => {
                matches!(op, ClusterOp::PutPeer { .. } | ClusterOp::RemoteMachineInfo)
            }
            Self::Network(op) => matches!(
                op,
                NetworkOp::Put { .. } | NetworkOp::Sync { .. } | NetworkOp::CheckInterface { .. }
            ),
        }
    }

    /// Whether the request can change state anywhere.
    pub fn is_mutating(&self) -> bool {
        let query = match self {
            Self::Auth(op) => matches!(op, AuthOp::Login | AuthOp::ListUsers),
            Self::Node(op) => !matches!(op, NodeOp::SetClusterIp { .. }),
            Self::Volume(op) => matches!(
                op,
                VolumeOp::Size { .. }
                    | VolumeOp::Sectors { .. }
                    | VolumeOp::SectorSize { .. }
                    | VolumeOp::Exists { .. }
                    | VolumeOp::Path { .. }
                    | VolumeOp::FreeSpace { .. }
            ),
            Self::Storage(op) => matches!(
                op,
                StorageOp::FreeSpace { .. }
                    | StorageOp::List
                    | StorageOp::NodePreCheck { .. }
                    | StorageOp::EnsureAvailable { .. }
            ),
            Self::Drbd(op) => {
                matches!(op, DrbdOp::IsInstalled | DrbdOp::List | DrbdOp::Status { .. })
            }
            Self::HardDrive(op) => matches!(op, HardDriveOp::List),
            Self::Vm(op) => {
                matches!(op, VmOp::Info { .. } | VmOp::List | VmOp::PowerState { .. })
            }
            Self::Cluster(op) => matches!(op, ClusterOp::List | ClusterOp::RemoteMachineInfo),
            Self::Network(op) => {
                matches!(op, NetworkOp::List | NetworkOp::CheckInterface { .. })
            }
            Self::Cert(op) => matches!(op, CertOp::CaCert),
        };
        !query
    }
}

// ─── Replies ────────────────────────────────────────────────────────────────

/// Successful result of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Unit,
    Bool(bool),
    Text(String),
    Size(u64),
    Texts(Vec<String>),
    Ports(Vec<u16>),
    Credentials { username: String, password: String },
    /// One reply per node, from a fan-out.
    PerNode(BTreeMap<String, Reply>),
    DrbdStatus(DrbdStatus),
    PowerState(PowerState),
    Vm(VmInfo),
    Vms(Vec<VmInfo>),
    HardDrives(Vec<HardDriveInfo>),
    StorageBackends(Vec<StorageBackendInfo>),
    Node(NodeInfo),
    Nodes(Vec<NodeInfo>),
    RemoteMachine(RemoteMachineInfo),
    Networks(BTreeMap<String, String>),
    Users(Vec<UserInfo>),
}

fn unexpected<T>(wanted: &str, got: &Reply) -> McvResult<T> {
    Err(McvError::UnexpectedReply(format!(
        "expected {}, got {:?}",
        wanted, got
    )))
}

impl Reply {
    pub fn into_bool(self) -> McvResult<bool> {
        match self {
            Self::Bool(b) => Ok(b),
            other => unexpected("bool", &other),
        }
    }

    pub fn into_text(self) -> McvResult<String> {
        match self {
            Self::Text(s) => Ok(s),
            other => unexpected("text", &other),
        }
    }

    pub fn into_size(self) -> McvResult<u64> {
        match self {
            Self::Size(n) => Ok(n),
            other => unexpected("size", &other),
        }
    }

    pub fn into_ports(self) -> McvResult<Vec<u16>> {
        match self {
            Self::Ports(p) => Ok(p),
            other => unexpected("ports", &other),
        }
    }

    pub fn into_credentials(self) -> McvResult<(String, String)> {
        match self {
            Self::Credentials { username, password } => Ok((username, password)),
            other => unexpected("credentials", &other),
        }
    }

    pub fn into_per_node(self) -> McvResult<BTreeMap<String, Reply>> {
        match self {
            Self::PerNode(map) => Ok(map),
            other => unexpected("per-node map", &other),
        }
    }

    pub fn into_drbd_status(self) -> McvResult<DrbdStatus> {
        match self {
            Self::DrbdStatus(s) => Ok(s),
            other => unexpected("DRBD status", &other),
        }
    }

    pub fn into_power_state(self) -> McvResult<PowerState> {
        match self {
            Self::PowerState(s) => Ok(s),
            other => unexpected("power state", &other),
        }
    }

    pub fn into_remote_machine(self) -> McvResult<RemoteMachineInfo> {
        match self {
            Self::RemoteMachine(info) => Ok(info),
            other => unexpected("remote machine info", &other),
        }
    }

    pub fn into_networks(self) -> McvResult<BTreeMap<String, String>> {
        match self {
            Self::Networks(n) => Ok(n),
            other => unexpected("networks", &other),
        }
    }
}

/// What one node did for one request: its reply, and optionally the exact
/// request that undoes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub reply: Reply,
    pub compensation: Option<Box<Request>>,
}

impl Outcome {
    pub fn unit() -> Self {
        Self::reply(Reply::Unit)
    }

    pub fn reply(reply: Reply) -> Self {
        Self {
            reply,
            compensation: None,
        }
    }

    pub fn with_compensation(mut self, undo: Request) -> Self {
        self.compensation = Some(Box::new(undo));
        self
    }
}

/// Response to one request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    /// Session the caller may reuse for subsequent connections.
    pub session_id: Option<String>,
    pub result: Result<Outcome, McvError>,
}

impl Response {
    pub fn error(id: u64, err: McvError) -> Self {
        Self {
            id,
            session_id: None,
            result: Err(err),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotations_are_case_insensitive() {
        let mut env = Envelope::default();
        env.set_annotation("username", "admin").unwrap();
        env.set_annotation("Cluster_Master", "false").unwrap();
        env.set_annotation("IGNORE_DRBD", "1").unwrap();
        env.set_annotation("has_lock", "True").unwrap();
        assert_eq!(env.username.as_deref(), Some("admin"));
        assert_eq!(env.cluster_master, Some(false));
        assert!(env.ignore_drbd);
        assert!(env.has_lock);
        assert!(!env.ignore_cluster);
    }

    #[test]
    fn test_bad_annotations() {
        let mut env = Envelope::default();
        assert!(env.set_annotation("COLOUR", "blue").is_err());
        assert!(env.set_annotation("HAS_LOCK", "maybe").is_err());
    }

    #[test]
    fn test_request_names() {
        let req = Request::Vm(VmOp::Start {
            name: "vm1".into(),
            iso: None,
        });
        assert_eq!(req.name(), "vm.Start");
        assert_eq!(Request::Cluster(ClusterOp::List).name(), "cluster.List");
    }

    #[test]
    fn test_internal_and_mutating() {
        let volume = Request::Volume(VolumeOp::Size {
            volume: VolumeRef::new("sb-0", "disk"),
        });
        assert!(volume.is_internal());
        assert!(!volume.is_mutating());

        let start = Request::Vm(VmOp::Start {
            name: "vm1".into(),
            iso: None,
        });
        assert!(!start.is_internal());
        assert!(start.is_mutating());

        assert!(!Request::Drbd(DrbdOp::List).is_internal());
        assert!(Request::Drbd(DrbdOp::IsInstalled).is_internal());
    }

    #[test]
    fn test_frame_payload_roundtrip() {
        let env = Envelope::with_password("admin", "pw");
        let req = Request::Drbd(DrbdOp::Adm {
            hard_drive: "hd-1".into(),
            action: DrbdAction::Up,
        });
        let data = bincode::serialize(&(env.clone(), req.clone())).unwrap();
        let (env2, req2): (Envelope, Request) = bincode::deserialize(&data).unwrap();
        assert_eq!(env2, env);
        assert_eq!(req2, req);
    }

    #[test]
    fn test_reply_accessors() {
        assert_eq!(Reply::Size(42).into_size().unwrap(), 42);
        assert!(matches!(
            Reply::Unit.into_text(),
            Err(McvError::UnexpectedReply(_))
        ));
        assert_eq!(DrbdAction::Up.inverse(), Some(DrbdAction::Down));
        assert_eq!(DrbdAction::Verify.inverse(), None);
    }
}
