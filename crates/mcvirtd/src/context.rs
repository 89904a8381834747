//! Per-call context.
//!
//! Built once per request from the handshake, then passed explicitly to
//! every handler, saga step and remote call the request makes.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use mcvirt_proto::auth::{Permission, UserKind, UserRecord};
use mcvirt_proto::{McvError, McvResult};

use crate::transaction::TransactionStack;

pub struct CallContext {
    /// Effective user: the proxied user when a machine account proxies.
    pub user: String,
    pub record: UserRecord,
    /// Kind of the account that actually authenticated.
    pub caller_kind: UserKind,
    pub session_id: Option<String>,
    /// Whether this node coordinates the request (as opposed to serving a
    /// peer that coordinates it).
    pub cluster_master: bool,
    /// The caller already holds the object locks for this request.
    pub has_lock: bool,
    pub ignore_cluster: bool,
    pub ignore_drbd: bool,
    transactions: Mutex<TransactionStack>,
    inaccessible: Mutex<Vec<String>>,
    held_locks: Mutex<HashSet<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CallContext {
    pub fn new(user: String, record: UserRecord, caller_kind: UserKind) -> Self {
        Self {
            user,
            record,
            caller_kind,
            session_id: None,
            cluster_master: !caller_kind.is_machine(),
            has_lock: false,
            ignore_cluster: false,
            ignore_drbd: false,
            transactions: Mutex::new(TransactionStack::default()),
            inaccessible: Mutex::new(Vec::new()),
            held_locks: Mutex::new(HashSet::new()),
        }
    }

    /// Context for work the daemon does on its own behalf (start-up
    /// migration, housekeeping).
    pub fn internal() -> Self {
        let record = UserRecord {
            kind: UserKind::ClusterUser,
            salt: String::new(),
            password_hash: String::new(),
            superuser: true,
            permissions: BTreeSet::new(),
            node: None,
        };
        let mut ctx = Self::new("mcvirtd".to_string(), record, UserKind::ClusterUser);
        ctx.cluster_master = true;
        ctx
    }

    /// Name to present as `proxy_user` when forwarding to a peer. Only
    /// human users are proxied; peers know machine accounts by their own
    /// credentials.
    pub fn proxy_name(&self) -> Option<&str> {
        (self.record.kind == UserKind::Local).then_some(self.user.as_str())
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.record.has_permission(permission)
    }

    pub fn assert_permission(&self, permission: Permission) -> McvResult<()> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            Err(McvError::PermissionDenied(format!(
                "{} lacks permission {}",
                self.user, permission
            )))
        }
    }

    pub fn assert_superuser(&self) -> McvResult<()> {
        if self.record.superuser || self.caller_kind.is_machine() {
            Ok(())
        } else {
            Err(McvError::PermissionDenied(format!("{} is not a superuser", self.user)))
        }
    }

    /// Whether the caller may invoke per-node primitives.
    pub fn may_call_internal(&self) -> bool {
        self.caller_kind.is_machine() || self.record.superuser
    }

    /// Record a peer skipped because it could not be reached.
    pub fn mark_inaccessible(&self, node: &str) {
        let mut nodes = lock(&self.inaccessible);
        if !nodes.iter().any(|n| n == node) {
            nodes.push(node.to_string());
        }
    }

    pub fn inaccessible_nodes(&self) -> Vec<String> {
        lock(&self.inaccessible).clone()
    }

    pub(crate) fn holds_lock(&self, key: &str) -> bool {
        lock(&self.held_locks).contains(key)
    }

    pub(crate) fn add_held_lock(&self, key: &str) {
        lock(&self.held_locks).insert(key.to_string());
    }

    pub(crate) fn remove_held_lock(&self, key: &str) {
        lock(&self.held_locks).remove(key);
    }

    pub(crate) fn transactions(&self) -> MutexGuard<'_, TransactionStack> {
        lock(&self.transactions)
    }
}
