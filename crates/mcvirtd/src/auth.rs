//! Users, passwords and the request handshake.
//!
//! Human users are mirrored on every node, so a user can log in anywhere
//! and be proxied to any peer. Machine accounts are per node: a cluster
//! user exists only on the node that issued it, for the one peer it was
//! issued to.

use std::collections::BTreeSet;

use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha512};
use tracing::{debug, info};

use mcvirt_proto::auth::{Permission, UserInfo, UserKind, UserRecord};
use mcvirt_proto::constants::{CLUSTER_USER_PREFIX, CONNECTION_USER_PREFIX, INITIAL_ADMIN_USER};
use mcvirt_proto::request::AuthOp;
use mcvirt_proto::{Envelope, McvError, McvResult, Outcome, Reply, Request};

use crate::context::CallContext;
use crate::daemon::NodeState;
use crate::transaction::{Function, Transaction};

const GENERATED_PASSWORD_LEN: usize = 32;

pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

fn generate_suffix() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn new_record(kind: UserKind, password: &str) -> UserRecord {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt = hex::encode(salt);
    UserRecord {
        kind,
        password_hash: hash_password(&salt, password),
        salt,
        superuser: false,
        permissions: BTreeSet::new(),
        node: None,
    }
}

pub fn verify_password(record: &UserRecord, password: &str) -> bool {
    hash_password(&record.salt, password) == record.password_hash
}

/// Create the initial superuser if this node has no users at all. Returns
/// the password when one had to be generated.
pub async fn ensure_admin(node: &NodeState, password: Option<&str>) -> McvResult<Option<String>> {
    if !node.config.global.get().await.users.is_empty() {
        return Ok(None);
    }
    let generated = password.is_none();
    let password = password.map(String::from).unwrap_or_else(generate_password);
    let mut record = new_record(UserKind::Local, &password);
    record.superuser = true;
    node.config
        .global
        .update("mcvirtd", "create initial admin user", |cfg| {
            cfg.users.insert(INITIAL_ADMIN_USER.to_string(), record);
            Ok(())
        })
        .await?;
    info!("created initial user {}", INITIAL_ADMIN_USER);
    Ok(generated.then_some(password))
}

/// Authenticate a handshake and build the call context.
pub async fn authenticate(node: &NodeState, envelope: &Envelope) -> McvResult<CallContext> {
    let username = envelope
        .username
        .as_deref()
        .ok_or(McvError::AuthenticationError)?;
    let global = node.config.global.get().await;
    let record = global
        .users
        .get(username)
        .cloned()
        .ok_or(McvError::AuthenticationError)?;

    let session_id = match (&envelope.password, &envelope.session_id) {
        (Some(password), _) => {
            if !verify_password(&record, password) {
                debug!("bad password for {}", username);
                return Err(McvError::AuthenticationError);
            }
            node.sessions.create(username)
        }
        (None, Some(session_id)) => {
            node.sessions.authenticate(session_id, username)?;
            session_id.clone()
        }
        (None, None) => return Err(McvError::AuthenticationError),
    };

    let (user, effective) = match &envelope.proxy_user {
        Some(proxy) => {
            if !record.kind.is_machine() {
                return Err(McvError::InsufficientPermissionForFlag("PROXY_USER".into()));
            }
            let proxied = global
                .users
                .get(proxy)
                .cloned()
                .ok_or_else(|| McvError::UserDoesNotExist(proxy.clone()))?;
            (proxy.clone(), proxied)
        }
        None => (username.to_string(), record.clone()),
    };

    let mut ctx = CallContext::new(user, effective, record.kind);
    ctx.session_id = Some(session_id);

    if let Some(cluster_master) = envelope.cluster_master {
        if record.kind == UserKind::ClusterUser {
            ctx.cluster_master = cluster_master;
        } else if cluster_master != ctx.cluster_master {
            return Err(McvError::InsufficientPermissionForFlag("CLUSTER_MASTER".into()));
        }
    }
    if envelope.has_lock {
        if record.kind != UserKind::ClusterUser {
            return Err(McvError::InsufficientPermissionForFlag("HAS_LOCK".into()));
        }
        ctx.has_lock = true;
    }
    if envelope.ignore_cluster {
        if !ctx.has_permission(Permission::CanIgnoreCluster) {
            return Err(McvError::InsufficientPermissionForFlag("IGNORE_CLUSTER".into()));
        }
        ctx.ignore_cluster = true;
    }
    if envelope.ignore_drbd {
        if !ctx.has_permission(Permission::CanIgnoreDrbd) {
            return Err(McvError::InsufficientPermissionForFlag("IGNORE_DRBD".into()));
        }
        ctx.ignore_drbd = true;
    }
    Ok(ctx)
}

/// Issue a machine account on this node. Cluster users replace any earlier
/// cluster user issued to the same peer.
pub async fn create_machine_user(
    node: &NodeState,
    kind: UserKind,
    peer: Option<&str>,
) -> McvResult<(String, String)> {
    let prefix = match kind {
        UserKind::ClusterUser => CLUSTER_USER_PREFIX,
        UserKind::ConnectionUser => CONNECTION_USER_PREFIX,
        UserKind::Local => {
            return Err(McvError::InvalidArguments("not a machine account kind".into()));
        }
    };
    let username = format!("{}{}", prefix, generate_suffix());
    let password = generate_password();
    let mut record = new_record(kind, &password);
    record.node = peer.map(String::from);

    let reason = format!("issue {} user {}", kind, username);
    node.config
        .global
        .update("mcvirtd", &reason, |cfg| {
            if let Some(peer) = peer {
                cfg.users.retain(|_, r| {
                    !(r.kind == UserKind::ClusterUser && r.node.as_deref() == Some(peer))
                });
            }
            cfg.users.insert(username.clone(), record);
            Ok(())
        })
        .await?;
    Ok((username, password))
}

async fn local_user(node: &NodeState, username: &str) -> McvResult<UserRecord> {
    let record = node
        .config
        .global
        .get()
        .await
        .users
        .get(username)
        .cloned()
        .ok_or_else(|| McvError::UserDoesNotExist(username.to_string()))?;
    if record.kind != UserKind::Local {
        return Err(McvError::InvalidArguments(format!(
            "{} is a {} account",
            username, record.kind
        )));
    }
    Ok(record)
}

/// Write a human user record on every node.
async fn put_user_everywhere(
    node: &NodeState,
    ctx: &CallContext,
    username: &str,
    record: Option<UserRecord>,
) -> McvResult<()> {
    let nodes = node.all_nodes().await;
    let tx = Transaction::begin(ctx);
    let result = Function::new(Request::Auth(AuthOp::PutUser {
        username: username.to_string(),
        record,
    }))
    .on(nodes)
    .run(node, ctx)
    .await;
    tx.settle(node, ctx, result).await?;
    Ok(())
}

pub async fn handle(node: &NodeState, ctx: &CallContext, op: AuthOp) -> McvResult<Outcome> {
    match op {
        AuthOp::Login => Ok(Outcome::unit()),

        AuthOp::CreateUser {
            username,
            password,
            kind,
        } => {
            ctx.assert_permission(Permission::ManageUsers)?;
            if kind != UserKind::Local {
                return Err(McvError::InvalidArguments(
                    "machine accounts are issued by cluster operations".into(),
                ));
            }
            if username.is_empty()
                || username.starts_with(CLUSTER_USER_PREFIX)
                || username.starts_with(CONNECTION_USER_PREFIX)
            {
                return Err(McvError::InvalidArguments(format!("invalid username '{}'", username)));
            }
            if password.is_empty() {
                return Err(McvError::InvalidArguments("password must not be empty".into()));
            }
            if node.config.global.get().await.users.contains_key(&username) {
                return Err(McvError::UserAlreadyExists(username));
            }
            info!("creating user {}", username);
            put_user_everywhere(node, ctx, &username, Some(new_record(kind, &password))).await?;
            Ok(Outcome::unit())
        }

        AuthOp::DeleteUser { username } => {
            ctx.assert_permission(Permission::ManageUsers)?;
            local_user(node, &username).await?;
            if username == ctx.user {
                return Err(McvError::InvalidArguments("cannot delete yourself".into()));
            }
            info!("deleting user {}", username);
            put_user_everywhere(node, ctx, &username, None).await?;
            Ok(Outcome::unit())
        }

        AuthOp::ChangePassword {
            username,
            new_password,
        } => {
            let username = username.unwrap_or_else(|| ctx.user.clone());
            if username != ctx.user {
                ctx.assert_permission(Permission::ManageUsers)?;
            }
            if new_password.is_empty() {
                return Err(McvError::InvalidArguments("password must not be empty".into()));
            }
            let current = local_user(node, &username).await?;
            let mut record = new_record(UserKind::Local, &new_password);
            record.superuser = current.superuser;
            record.permissions = current.permissions;
            put_user_everywhere(node, ctx, &username, Some(record)).await?;
            Ok(Outcome::unit())
        }

        AuthOp::SetPermission {
            username,
            permission,
            granted,
        } => {
            ctx.assert_permission(Permission::ManageUsers)?;
            let mut record = local_user(node, &username).await?;
            if granted {
                record.permissions.insert(permission);
            } else {
                record.permissions.remove(&permission);
            }
            put_user_everywhere(node, ctx, &username, Some(record)).await?;
            Ok(Outcome::unit())
        }

        AuthOp::SetSuperuser {
            username,
            superuser,
        } => {
            ctx.assert_superuser()?;
            let mut record = local_user(node, &username).await?;
            record.superuser = superuser;
            put_user_everywhere(node, ctx, &username, Some(record)).await?;
            Ok(Outcome::unit())
        }

        AuthOp::ListUsers => {
            ctx.assert_permission(Permission::ManageUsers)?;
            let users = node
                .config
                .global
                .get()
                .await
                .users
                .into_iter()
                .map(|(username, r)| UserInfo {
                    username,
                    kind: r.kind,
                    superuser: r.superuser,
                    permissions: r.permissions.into_iter().collect(),
                })
                .collect();
            Ok(Outcome::reply(Reply::Users(users)))
        }

        AuthOp::PutUser { username, record } => {
            let reason = match &record {
                Some(_) => format!("write user {}", username),
                None => format!("remove user {}", username),
            };
            let previous = node
                .config
                .global
                .update(&ctx.user, &reason, |cfg| {
                    Ok(match record {
                        Some(record) => cfg.users.insert(username.clone(), record),
                        None => cfg.users.remove(&username),
                    })
                })
                .await?;
            node.sessions.remove_user(&username);
            Ok(Outcome::unit().with_compensation(Request::Auth(AuthOp::PutUser {
                username,
                record: previous,
            })))
        }

        AuthOp::SyncUsers { users } => {
            let previous = node
                .config
                .global
                .update(&ctx.user, "sync users", |cfg| {
                    let previous = cfg
                        .users
                        .iter()
                        .filter(|(_, r)| r.kind == UserKind::Local)
                        .map(|(n, r)| (n.clone(), r.clone()))
                        .collect();
                    cfg.users.retain(|_, r| r.kind != UserKind::Local);
                    cfg.users.extend(
                        users.into_iter().filter(|(_, r)| r.kind == UserKind::Local),
                    );
                    Ok(previous)
                })
                .await?;
            Ok(Outcome::unit().with_compensation(Request::Auth(AuthOp::SyncUsers { users: previous })))
        }

        AuthOp::CreateClusterUser { peer } => {
            let (username, password) =
                create_machine_user(node, UserKind::ClusterUser, Some(&peer)).await?;
            Ok(Outcome::reply(Reply::Credentials {
                username: username.clone(),
                password,
            })
            .with_compensation(Request::Auth(AuthOp::PutUser {
                username,
                record: None,
            })))
        }
    }
}
