//! Storage backend registry.
//!
//! A backend is a named pool of one type with a default location and a
//! member list; members may override the location. Every node of the
//! cluster holds the config of every backend. An identity volume named
//! after the backend ID marks the location as belonging to it: one on
//! every member for node-local pools, one on the first member for shared
//! pools.

use std::collections::BTreeMap;

use tracing::{info, warn};

use mcvirt_proto::auth::Permission;
use mcvirt_proto::constants::{
    CONFIG_SCHEMA_VERSION, DEFAULT_STORAGE_NAME, IDENTITY_VOLUME_SIZE, STORAGE_BACKEND_ID_PREFIX,
};
use mcvirt_proto::hard_drive::HardDriveConfig;
use mcvirt_proto::id::generate_id;
use mcvirt_proto::request::{NodeOp, StorageOp, VolumeOp, VolumeRef};
use mcvirt_proto::storage::{NodeStorageConfig, StorageBackendConfig, StorageBackendInfo, StorageType};
use mcvirt_proto::{McvError, McvResult, Outcome, Reply, Request};

use crate::context::CallContext;
use crate::daemon::NodeState;
use crate::remote::{query, run_remote_command};
use crate::transaction::{Function, Transaction};
use crate::volume;

fn identity_volume(sb: &StorageBackendConfig) -> VolumeRef {
    VolumeRef::new(&sb.id, &sb.id)
}

fn put_config(id: &str, config: Option<StorageBackendConfig>) -> Request {
    Request::Storage(StorageOp::PutConfig {
        id: id.to_string(),
        config,
    })
}

/// Hard drives stored on a backend.
async fn hard_drives_of(node: &NodeState, sb: &StorageBackendConfig) -> Vec<HardDriveConfig> {
    node.config
        .hard_drives
        .list()
        .await
        .into_iter()
        .filter(|hdd| hdd.storage_backend == sb.id)
        .collect()
}

async fn precheck(
    node: &NodeState,
    ctx: &CallContext,
    sb: &StorageBackendConfig,
    members: &[String],
) -> McvResult<()> {
    for member in members {
        let location = sb
            .location_on(member)
            .ok_or_else(|| McvError::InvalidStorageLocation(format!("no location for node {}", member)))?;
        Function::new(Request::Storage(StorageOp::NodePreCheck {
            storage_type: sb.storage_type,
            location: location.to_string(),
        }))
        .on_node(member)
        .run(node, ctx)
        .await?;
    }
    Ok(())
}

async fn create_identity(node: &NodeState, ctx: &CallContext, sb: &StorageBackendConfig, nodes: Vec<String>) -> McvResult<()> {
    if nodes.is_empty() {
        return Ok(());
    }
    Function::new(Request::Volume(VolumeOp::Create {
        volume: identity_volume(sb),
        size: IDENTITY_VOLUME_SIZE,
    }))
    .on(nodes)
    .run_all(node, ctx)
    .await?;
    Ok(())
}

async fn delete_identity(node: &NodeState, ctx: &CallContext, sb: &StorageBackendConfig, nodes: Vec<String>) -> McvResult<()> {
    if nodes.is_empty() {
        return Ok(());
    }
    Function::new(Request::Volume(VolumeOp::Delete {
        volume: identity_volume(sb),
        ignore_missing: true,
    }))
    .on(nodes)
    .run_all(node, ctx)
    .await?;
    Ok(())
}

async fn publish(node: &NodeState, ctx: &CallContext, sb: &StorageBackendConfig) -> McvResult<()> {
    Function::new(put_config(&sb.id, Some(sb.clone())))
        .on(node.all_nodes().await)
        .run_all(node, ctx)
        .await?;
    Ok(())
}

/// Fail unless `sb` is usable on every node in `nodes`.
pub async fn ensure_available_on(
    node: &NodeState,
    ctx: &CallContext,
    sb: &StorageBackendConfig,
    nodes: &[String],
) -> McvResult<()> {
    for n in nodes {
        if !sb.is_available_on(n) {
            return Err(McvError::StorageBackendNotAvailableOnNode {
                backend: sb.name.clone(),
                node: n.clone(),
            });
        }
    }
    let results = run_remote_command(
        node,
        ctx,
        nodes,
        Request::Storage(StorageOp::EnsureAvailable { id: sb.id.clone() }),
    )
    .await;
    for result in results.into_values() {
        result?;
    }
    Ok(())
}

/// Fail unless every node in `nodes` has `required` bytes free on `sb`.
pub async fn check_free_space(
    node: &NodeState,
    ctx: &CallContext,
    sb: &StorageBackendConfig,
    nodes: &[String],
    required: u64,
) -> McvResult<()> {
    let results = run_remote_command(
        node,
        ctx,
        nodes,
        Request::Volume(VolumeOp::FreeSpace { backend: sb.id.clone() }),
    )
    .await;
    for (n, result) in results {
        let available = result?.into_size()?;
        if available < required {
            return Err(McvError::InsufficientSpace {
                node: n,
                required,
                available,
            });
        }
    }
    Ok(())
}

/// Resolve the backend a new disk goes on: the named one, or the only one
/// available on `nodes`.
pub async fn select_backend(
    node: &NodeState,
    name: Option<&str>,
    nodes: &[String],
) -> McvResult<StorageBackendConfig> {
    if let Some(name) = name {
        return node.config.storage_backend_by_name(name).await;
    }
    let mut candidates: Vec<StorageBackendConfig> = node
        .config
        .storage
        .list()
        .await
        .into_iter()
        .filter(|sb| nodes.iter().all(|n| sb.is_available_on(n)))
        .collect();
    if candidates.len() > 1 {
        candidates.retain(|sb| sb.name == DEFAULT_STORAGE_NAME);
        if candidates.is_empty() {
            return Err(McvError::InvalidArguments(
                "several storage backends are available, name one".into(),
            ));
        }
    }
    candidates.pop().ok_or_else(|| {
        McvError::StorageBackendDoesNotExist(format!(
            "no storage backend is available on {}",
            nodes.join(", ")
        ))
    })
}

pub async fn handle(node: &NodeState, ctx: &CallContext, op: StorageOp) -> McvResult<Outcome> {
    match op {
        StorageOp::Create {
            name,
            storage_type,
            location,
            shared,
            nodes,
        } => {
            ctx.assert_permission(Permission::ManageStorageBackend)?;
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
                return Err(McvError::InvalidArguments(format!("invalid storage backend name '{}'", name)));
            }
            if node.config.storage_backend_by_name(&name).await.is_ok() {
                return Err(McvError::StorageBackendAlreadyExists(name));
            }
            let mut members = BTreeMap::new();
            if nodes.is_empty() {
                members.insert(node.hostname.clone(), NodeStorageConfig::default());
            }
            for (member, location) in nodes {
                node.ensure_cluster_node(&member).await?;
                members.insert(member, NodeStorageConfig { location });
            }
            let sb = StorageBackendConfig {
                id: generate_id(STORAGE_BACKEND_ID_PREFIX, &name),
                name,
                storage_type,
                shared,
                location,
                nodes: members,
            };
            if !sb.locations_complete() {
                return Err(McvError::InvalidStorageLocation(
                    "a location is required for every node without an override".into(),
                ));
            }

            let tx = Transaction::begin(ctx);
            let result = async {
                precheck(node, ctx, &sb, &sb.node_names()).await?;
                publish(node, ctx, &sb).await?;
                create_identity(node, ctx, &sb, sb.identity_nodes()).await
            }
            .await;
            tx.settle(node, ctx, result).await?;
            info!("created storage backend {} ({})", sb.name, sb.id);
            Ok(Outcome::reply(Reply::Text(sb.id)))
        }

        StorageOp::Delete { name } => {
            ctx.assert_permission(Permission::ManageStorageBackend)?;
            let sb = node.config.storage_backend_by_name(&name).await?;
            let used = hard_drives_of(node, &sb).await;
            if !used.is_empty() {
                return Err(McvError::StorageBackendInUse(format!(
                    "{} holds {} hard drive(s)",
                    sb.name,
                    used.len()
                )));
            }
            let tx = Transaction::begin(ctx);
            let result = async {
                delete_identity(node, ctx, &sb, sb.identity_nodes()).await?;
                Function::new(put_config(&sb.id, None))
                    .on(node.all_nodes().await)
                    .run_all(node, ctx)
                    .await
            }
            .await;
            tx.settle(node, ctx, result).await?;
            info!("deleted storage backend {}", sb.name);
            Ok(Outcome::unit())
        }

        StorageOp::AddNode {
            name,
            node: member,
            location,
        } => {
            ctx.assert_permission(Permission::ManageStorageBackend)?;
            let mut sb = node.config.storage_backend_by_name(&name).await?;
            node.ensure_cluster_node(&member).await?;
            if sb.is_available_on(&member) {
                return Err(McvError::InvalidArguments(format!(
                    "{} is already available on {}",
                    sb.name, member
                )));
            }
            sb.nodes.insert(member.clone(), NodeStorageConfig { location });
            if sb.location_on(&member).is_none() {
                return Err(McvError::InvalidStorageLocation(format!(
                    "{} has no default location; give one for {}",
                    sb.name, member
                )));
            }
            let tx = Transaction::begin(ctx);
            let result = async {
                precheck(node, ctx, &sb, std::slice::from_ref(&member)).await?;
                publish(node, ctx, &sb).await?;
                if !sb.shared {
                    create_identity(node, ctx, &sb, vec![member.clone()]).await?;
                }
                Ok::<_, McvError>(())
            }
            .await;
            tx.settle(node, ctx, result).await?;
            info!("storage backend {} added to {}", sb.name, member);
            Ok(Outcome::unit())
        }

        StorageOp::RemoveNode { name, node: member } => {
            ctx.assert_permission(Permission::ManageStorageBackend)?;
            let mut sb = node.config.storage_backend_by_name(&name).await?;
            if !sb.is_available_on(&member) {
                return Err(McvError::StorageBackendNotAvailableOnNode {
                    backend: sb.name.clone(),
                    node: member,
                });
            }
            let used = hard_drives_of(node, &sb).await;
            if used.iter().any(|hdd| hdd.nodes.contains(&member)) {
                return Err(McvError::StorageBackendInUse(format!(
                    "{} holds hard drives on {}",
                    sb.name, member
                )));
            }
            for vm in node.config.vms.list().await {
                if !vm.available_nodes.contains(&member) {
                    continue;
                }
                if used.iter().any(|hdd| vm.hard_drives.contains(&hdd.id)) {
                    return Err(McvError::StorageBackendInUse(format!(
                        "VM {} can run on {} with storage on {}",
                        vm.name, member, sb.name
                    )));
                }
            }
            if sb.nodes.len() == 1 && !used.is_empty() {
                return Err(McvError::CannotRemoveLastNode(sb.name));
            }

            let was_identity = sb.identity_nodes().contains(&member);
            sb.nodes.remove(&member);
            let tx = Transaction::begin(ctx);
            let result = async {
                if was_identity && !sb.shared {
                    delete_identity(node, ctx, &sb, vec![member.clone()]).await?;
                }
                publish(node, ctx, &sb).await
            }
            .await;
            tx.settle(node, ctx, result).await?;
            info!("storage backend {} removed from {}", sb.name, member);
            Ok(Outcome::unit())
        }

        StorageOp::SetLocation {
            name,
            location,
            node: member,
        } => {
            ctx.assert_permission(Permission::ManageStorageBackend)?;
            let mut sb = node.config.storage_backend_by_name(&name).await?;
            if !hard_drives_of(node, &sb).await.is_empty() {
                return Err(McvError::StorageBackendInUse(format!(
                    "cannot move {} while it holds hard drives",
                    sb.name
                )));
            }
            let affected: Vec<String> = match &member {
                Some(member) => {
                    let entry = sb.nodes.get_mut(member).ok_or_else(|| {
                        McvError::StorageBackendNotAvailableOnNode {
                            backend: sb.name.clone(),
                            node: member.clone(),
                        }
                    })?;
                    entry.location = Some(location.clone());
                    vec![member.clone()]
                }
                None => {
                    sb.location = Some(location.clone());
                    sb.nodes
                        .iter()
                        .filter(|(_, c)| c.location.is_none())
                        .map(|(n, _)| n.clone())
                        .collect()
                }
            };
            let tx = Transaction::begin(ctx);
            let result = async {
                precheck(node, ctx, &sb, &affected).await?;
                publish(node, ctx, &sb).await?;
                let identity: Vec<String> = sb
                    .identity_nodes()
                    .into_iter()
                    .filter(|n| affected.contains(n))
                    .collect();
                create_identity(node, ctx, &sb, identity).await
            }
            .await;
            tx.settle(node, ctx, result).await?;
            Ok(Outcome::unit())
        }

        StorageOp::SetShared { name, shared } => {
            ctx.assert_permission(Permission::ManageStorageBackend)?;
            let mut sb = node.config.storage_backend_by_name(&name).await?;
            if sb.shared == shared {
                return Ok(Outcome::unit());
            }
            if !shared && !hard_drives_of(node, &sb).await.is_empty() {
                return Err(McvError::CannotUnshareInUse(sb.name));
            }
            let before = sb.identity_nodes();
            sb.shared = shared;
            let after = sb.identity_nodes();
            let tx = Transaction::begin(ctx);
            let result = async {
                let gone: Vec<String> = before.iter().filter(|n| !after.contains(n)).cloned().collect();
                let new: Vec<String> = after.iter().filter(|n| !before.contains(n)).cloned().collect();
                delete_identity(node, ctx, &sb, gone).await?;
                create_identity(node, ctx, &sb, new).await?;
                publish(node, ctx, &sb).await
            }
            .await;
            tx.settle(node, ctx, result).await?;
            Ok(Outcome::unit())
        }

        StorageOp::FreeSpace { name, nodes } => {
            let sb = node.config.storage_backend_by_name(&name).await?;
            let nodes = nodes.unwrap_or_else(|| sb.node_names());
            let results = run_remote_command(
                node,
                ctx,
                &nodes,
                Request::Volume(VolumeOp::FreeSpace { backend: sb.id.clone() }),
            )
            .await;
            let mut per_node = BTreeMap::new();
            for (n, result) in results {
                per_node.insert(n, result?);
            }
            Ok(Outcome::reply(Reply::PerNode(per_node)))
        }

        StorageOp::List => {
            let backends = node.config.storage.list().await;
            Ok(Outcome::reply(Reply::StorageBackends(
                backends.iter().map(StorageBackendInfo::from).collect(),
            )))
        }

        StorageOp::NodePreCheck {
            storage_type,
            location,
        } => {
            volume::check_location(node, storage_type, &location).await?;
            Ok(Outcome::unit())
        }

        StorageOp::PutConfig { id, config } => {
            let present = config.is_some();
            let previous = node
                .config
                .storage
                .put(&ctx.user, &format!("storage backend {}", id), &id, config)
                .await?;
            node.config
                .global
                .update(&ctx.user, &format!("storage backend list: {}", id), |cfg| {
                    cfg.storage_backends.retain(|s| s != &id);
                    if present {
                        cfg.storage_backends.push(id.clone());
                    }
                    Ok(())
                })
                .await?;
            Ok(Outcome::unit().with_compensation(put_config(&id, previous)))
        }

        StorageOp::EnsureAvailable { id } => {
            let sb = node.config.storage_backend(&id).await?;
            let exists = volume::handle(node, ctx, VolumeOp::Exists { volume: identity_volume(&sb) })
                .await?
                .reply
                .into_bool()?;
            if exists {
                Ok(Outcome::unit())
            } else {
                Err(McvError::StorageBackendNotAvailableOnNode {
                    backend: sb.name,
                    node: node.hostname.clone(),
                })
            }
        }
    }
}

// ─── Start-up migration ─────────────────────────────────────────────────────

async fn finalize_migration(node: &NodeState) -> McvResult<()> {
    node.config
        .global
        .update("mcvirtd", "configuration schema upgrade", |cfg| {
            cfg.version = CONFIG_SCHEMA_VERSION;
            cfg.default_storage_configured = true;
            cfg.vm_storage_vg = None;
            Ok(())
        })
        .await
}

/// Build the default storage backend from the legacy per-node volume group
/// setting and upgrade the config schema.
pub async fn migrate_legacy_config(node: &NodeState) -> McvResult<()> {
    let global = node.config.global.get().await;
    if !global.needs_migration() {
        return Ok(());
    }
    if node.config.storage_backend_by_name(DEFAULT_STORAGE_NAME).await.is_ok() {
        info!("default storage backend already present, finishing upgrade");
        return finalize_migration(node).await;
    }
    let Some(local_vg) = global.vm_storage_vg.clone() else {
        return finalize_migration(node).await;
    };

    let mut ctx = CallContext::internal();
    ctx.ignore_cluster = true;

    let mut vgs = BTreeMap::new();
    vgs.insert(node.hostname.clone(), local_vg.clone());
    for peer in node.peers().await {
        match query(node, &ctx, &peer, Request::Node(NodeOp::Info)).await {
            Ok(Reply::Node(info)) => {
                if let Some(vg) = info.legacy_storage_vg {
                    vgs.insert(peer, vg);
                }
            }
            Ok(other) => warn!("unexpected info reply from {}: {:?}", peer, other),
            Err(e) => warn!("cannot query {} during upgrade: {}", peer, e),
        }
    }

    let uniform = vgs.values().all(|vg| vg == &local_vg);
    let sb = StorageBackendConfig {
        id: generate_id(STORAGE_BACKEND_ID_PREFIX, DEFAULT_STORAGE_NAME),
        name: DEFAULT_STORAGE_NAME.to_string(),
        storage_type: StorageType::Lvm,
        shared: false,
        location: uniform.then(|| local_vg.clone()),
        nodes: vgs
            .iter()
            .map(|(n, vg)| {
                let location = (!uniform).then(|| vg.clone());
                (n.clone(), NodeStorageConfig { location })
            })
            .collect(),
    };
    info!(
        "creating default storage backend {} on {}",
        sb.id,
        sb.node_names().join(", ")
    );

    publish(node, &ctx, &sb).await?;
    for member in sb.identity_nodes() {
        let result = crate::transaction::execute_on(
            node,
            &ctx,
            &member,
            Request::Volume(VolumeOp::Create {
                volume: identity_volume(&sb),
                size: IDENTITY_VOLUME_SIZE,
            }),
        )
        .await;
        match result {
            Ok(_) | Err(McvError::VolumeAlreadyExists(_)) => {}
            Err(e) => warn!("identity volume for {} on {} not created: {}", sb.name, member, e),
        }
    }
    finalize_migration(node).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcvirt_core::command::CommandOutput;

    use crate::testutil::{cluster, single_node, single_node_with_backend, TEST_VG};

    fn create_op(name: &str, location: Option<&str>, nodes: &[(&str, Option<&str>)]) -> StorageOp {
        StorageOp::Create {
            name: name.into(),
            storage_type: StorageType::Lvm,
            location: location.map(String::from),
            shared: false,
            nodes: nodes
                .iter()
                .map(|(n, l)| (n.to_string(), l.map(String::from)))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_create_on_two_nodes() {
        let c = cluster(&["n1", "n2"]).await;
        let n1 = c.node("n1");
        let ctx = CallContext::internal();
        handle(n1, &ctx, create_op("pool", Some("vg_pool"), &[("n1", None), ("n2", Some("vg_other"))]))
            .await
            .unwrap();

        for host in ["n1", "n2"] {
            let sb = c.node(host).config.storage_backend_by_name("pool").await.unwrap();
            assert_eq!(sb.location_on("n2"), Some("vg_other"));
            assert!(c
                .node(host)
                .config
                .global
                .get()
                .await
                .storage_backends
                .contains(&sb.id));
        }
        assert!(c.node("n1").runner.ran("vgs --noheadings vg_pool"));
        assert!(c.node("n2").runner.ran("vgs --noheadings vg_other"));
        assert!(c.node("n2").runner.ran("lvcreate --yes -n sb-"));
    }

    #[tokio::test]
    async fn test_create_failed_precheck_leaves_nothing() {
        let c = cluster(&["n1", "n2"]).await;
        c.node("n2")
            .runner
            .respond("vgs --noheadings vg_pool", CommandOutput::failed(5, "not found"));
        let ctx = CallContext::internal();
        let err = handle(c.node("n1"), &ctx, create_op("pool", Some("vg_pool"), &[("n1", None), ("n2", None)]))
            .await
            .unwrap_err();
        assert!(matches!(err, McvError::InvalidStorageLocation(_)));
        assert!(c.node("n1").config.storage.list().await.is_empty());
        assert!(c.node("n2").config.storage.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_requires_locations() {
        let node = single_node("n1").await;
        let err = handle(&node, &CallContext::internal(), create_op("pool", None, &[("n1", None)]))
            .await
            .unwrap_err();
        assert!(matches!(err, McvError::InvalidStorageLocation(_)));
    }

    #[tokio::test]
    async fn test_duplicate_name() {
        let node = single_node_with_backend("n1").await;
        let err = handle(&node, &CallContext::internal(), create_op("default", Some(TEST_VG), &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, McvError::StorageBackendAlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_unshare_in_use() {
        let node = single_node_with_backend("n1").await;
        let ctx = CallContext::internal();
        let mut sb = node.config.storage_backend_by_name("default").await.unwrap();
        sb.shared = true;
        node.config.storage.put("test", "share", &sb.id, Some(sb.clone())).await.unwrap();
        let hdd = crate::testutil::local_hard_drive(&sb.id, "vm-x", 1, &["n1"]);
        node.config.hard_drives.put("test", "hdd", &hdd.id, Some(hdd.clone())).await.unwrap();

        let err = handle(&node, &ctx, StorageOp::SetShared { name: "default".into(), shared: false })
            .await
            .unwrap_err();
        assert!(matches!(err, McvError::CannotUnshareInUse(_)));
        let err = handle(&node, &ctx, StorageOp::Delete { name: "default".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, McvError::StorageBackendInUse(_)));
    }

    #[tokio::test]
    async fn test_ensure_available_checks_identity_volume() {
        let node = single_node_with_backend("n1").await;
        let ctx = CallContext::internal();
        let sb = node.config.storage_backend_by_name("default").await.unwrap();
        ensure_available_on(&node, &ctx, &sb, &["n1".to_string()]).await.unwrap();
        node.runner.respond("lvs --noheadings", CommandOutput::failed(5, "not found"));
        let err = ensure_available_on(&node, &ctx, &sb, &["n1".to_string()]).await.unwrap_err();
        assert!(matches!(err, McvError::StorageBackendNotAvailableOnNode { .. }));
    }

    #[tokio::test]
    async fn test_free_space_check() {
        let node = single_node_with_backend("n1").await;
        let ctx = CallContext::internal();
        let sb = node.config.storage_backend_by_name("default").await.unwrap();
        node.runner.respond("vgs --noheadings --units b", CommandOutput::ok("  1048576\n"));
        check_free_space(&node, &ctx, &sb, &["n1".to_string()], 1024).await.unwrap();
        let err = check_free_space(&node, &ctx, &sb, &["n1".to_string()], 2 * 1048576)
            .await
            .unwrap_err();
        assert!(matches!(err, McvError::InsufficientSpace { available: 1048576, .. }));
    }

    #[tokio::test]
    async fn test_legacy_migration_uniform_vg() {
        let c = cluster(&["n1", "n2"]).await;
        for host in ["n1", "n2"] {
            c.node(host)
                .config
                .global
                .update("test", "legacy", |cfg| {
                    cfg.version = 8;
                    cfg.vm_storage_vg = Some("vg_legacy".into());
                    Ok(())
                })
                .await
                .unwrap();
        }
        migrate_legacy_config(c.node("n1")).await.unwrap();

        let sb = c.node("n2").config.storage_backend_by_name("default").await.unwrap();
        assert_eq!(sb.location.as_deref(), Some("vg_legacy"));
        assert_eq!(sb.node_names(), vec!["n1", "n2"]);
        let global = c.node("n1").config.global.get().await;
        assert_eq!(global.version, CONFIG_SCHEMA_VERSION);
        assert!(global.default_storage_configured);
        assert!(global.vm_storage_vg.is_none());

        // n2 finds the pushed backend and only finishes its own upgrade.
        migrate_legacy_config(c.node("n2")).await.unwrap();
        assert_eq!(c.node("n2").config.storage.list().await.len(), 1);
        assert!(!c.node("n2").config.global.get().await.needs_migration());
    }

    #[tokio::test]
    async fn test_legacy_migration_differing_vgs() {
        let c = cluster(&["n1", "n2"]).await;
        for (host, vg) in [("n1", "vg_a"), ("n2", "vg_b")] {
            c.node(host)
                .config
                .global
                .update("test", "legacy", |cfg| {
                    cfg.version = 8;
                    cfg.vm_storage_vg = Some(vg.into());
                    Ok(())
                })
                .await
                .unwrap();
        }
        migrate_legacy_config(c.node("n1")).await.unwrap();
        let sb = c.node("n1").config.storage_backend_by_name("default").await.unwrap();
        assert!(sb.location.is_none());
        assert_eq!(sb.location_on("n1"), Some("vg_a"));
        assert_eq!(sb.location_on("n2"), Some("vg_b"));
    }
}
