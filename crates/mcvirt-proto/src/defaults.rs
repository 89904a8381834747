//! Tunable operational defaults.
//!
//! Protocol-level constants (wire format, DRBD numbering, identifier
//! prefixes) remain in [`crate::constants`]. This module centralizes the
//! defaults that can be overridden via CLI flags or test harnesses.

// ─── Paths ──────────────────────────────────────────────────────────────────

/// Default daemon data directory.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/mcvirt";

/// Default directory DRBD resource files are written to.
pub const DEFAULT_DRBD_CONFIG_DIR: &str = "/etc/drbd.d";

/// File name of the global DRBD configuration inside the DRBD config dir.
pub const DEFAULT_DRBD_GLOBAL_CONFIG: &str = "global_common.conf";

/// File the CLI caches its session id in, relative to `$HOME`.
pub const DEFAULT_SESSION_FILE: &str = ".mcvirt-session";

/// Default listen address.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";

// ─── Timings (seconds) ──────────────────────────────────────────────────────

/// Settle time after `drbdadm up` before the disk is attached.
pub const DEFAULT_DRBD_UP_SETTLE_SECS: u64 = 5;

/// Settle time after a failed online migration before tear-down.
pub const DEFAULT_MIGRATION_FAILURE_SETTLE_SECS: u64 = 10;

/// Poll interval for DRBD sync transitions and VM shutdown waits.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Maximum wait for a DRBD role change to be reported.
pub const DEFAULT_ROLE_CHANGE_WAIT_SECS: u64 = 15;

/// How long an offline migration waits for the guest to power off.
pub const DEFAULT_SHUTDOWN_WAIT_SECS: u64 = 600;

/// Connect timeout for daemon-to-daemon RPC.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Idle lifetime of an authenticated session.
pub const DEFAULT_SESSION_LIFETIME_SECS: u64 = 15 * 60;

/// Retry delay when `drbdadm down` fails transiently.
pub const DEFAULT_DRBD_DOWN_RETRY_SECS: u64 = 5;

// ─── Certificates ───────────────────────────────────────────────────────────

/// RSA key size used for the node CA and certificates.
pub const DEFAULT_RSA_KEY_BITS: u32 = 4096;

/// Validity of generated certificates, in days (about ten years).
pub const DEFAULT_CERT_VALIDITY_DAYS: u32 = 3650;

// ─── Watchdog / agent ───────────────────────────────────────────────────────

pub const DEFAULT_AGENT_CONNECTION_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_WATCHDOG_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_WATCHDOG_RESET_FAIL_COUNT: u32 = 6;
pub const DEFAULT_WATCHDOG_BOOT_WAIT_SECS: u64 = 300;
