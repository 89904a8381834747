/// MCVirt protocol and system constants.

/// Wire protocol version carried in every request envelope.
pub const MCVIRT_PROTO_VER: u8 = 0x01;

/// Default daemon listen port.
pub const MCVIRT_LISTEN_PORT: u16 = 8070;

/// Maximum size of a single wire frame (64 MiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Current schema version of the global config file.
pub const CONFIG_SCHEMA_VERSION: u32 = 9;

// ─── Identifiers ────────────────────────────────────────────────────────────

pub const VM_ID_PREFIX: &str = "vm";
pub const HARD_DRIVE_ID_PREFIX: &str = "hd";
pub const STORAGE_BACKEND_ID_PREFIX: &str = "sb";

// ─── Storage ────────────────────────────────────────────────────────────────

/// Size of the per-backend identity volume.
pub const IDENTITY_VOLUME_SIZE: u64 = MIB;

/// Name of the storage backend created by the v9 upgrade.
pub const DEFAULT_STORAGE_NAME: &str = "default";

// ─── DRBD ───────────────────────────────────────────────────────────────────

/// First TCP port handed out to a DRBD resource.
pub const DRBD_BASE_PORT: u16 = 7789;

/// First DRBD minor number handed out to a resource.
pub const DRBD_FIRST_MINOR: u32 = 1;

/// Prefix of every DRBD resource name.
pub const DRBD_RESOURCE_PREFIX: &str = "mcvirt_vm";

/// Volume suffix of the data volume backing a DRBD resource.
pub const DRBD_RAW_SUFFIX: &str = "raw";

/// Volume suffix of the metadata volume backing a DRBD resource.
pub const DRBD_META_SUFFIX: &str = "meta";

/// Sectors of data covered by one bitmap block of DRBD metadata.
pub const DRBD_SECTORS_PER_BITMAP_BLOCK: u64 = 262_144;

/// Fixed metadata overhead, in sectors.
pub const DRBD_META_FIXED_SECTORS: u64 = 72;

/// Command DRBD invokes when a verify finds out-of-sync blocks.
pub const DRBD_OUT_OF_SYNC_HANDLER: &str = "/usr/bin/mcvirt drbd out-of-sync";

// ─── Networking ─────────────────────────────────────────────────────────────

/// Locally-administered MAC prefix used for generated adapters.
pub const MAC_PREFIX: [u8; 3] = [0x52, 0x54, 0x00];

// ─── Users ──────────────────────────────────────────────────────────────────

/// Username of the superuser created on first start.
pub const INITIAL_ADMIN_USER: &str = "admin";

/// Prefix of generated cluster-user names.
pub const CLUSTER_USER_PREFIX: &str = "mcv-cluster-";

/// Prefix of generated connection-user names.
pub const CONNECTION_USER_PREFIX: &str = "mcv-connection-";
