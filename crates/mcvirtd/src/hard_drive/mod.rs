//! Hard drives.
//!
//! A hard drive is either `Local` (one volume, see [`local`]) or `Drbd`
//! (a replicated pair, see [`crate::drbd::engine`]). This module holds
//! what both share: attach/detach, activation around libvirt, the libvirt
//! disk device, and the operator-facing operations.

pub mod local;

use tracing::{info, warn};

use mcvirt_proto::auth::Permission;
use mcvirt_proto::hard_drive::{DiskDriver, HardDriveConfig, HardDriveInfo, HardDriveType};
use mcvirt_proto::request::{HardDriveOp, VmOp, VolumeOp, VolumeRef};
use mcvirt_proto::storage::StorageBackendConfig;
use mcvirt_proto::vm::{PowerState, VmConfig, VmConfigChange};
use mcvirt_proto::{McvError, McvResult, Outcome, Reply, Request};

use crate::context::CallContext;
use crate::daemon::NodeState;
use crate::drbd::engine;
use crate::libvirt::DiskDevice;
use crate::transaction::{Function, Transaction};
use crate::{storage, volume};

pub fn raw_ref(hdd: &HardDriveConfig) -> VolumeRef {
    VolumeRef::new(&hdd.storage_backend, &hdd.raw_volume())
}

fn put_config(id: &str, config: Option<HardDriveConfig>) -> Request {
    Request::HardDrive(HardDriveOp::PutConfig {
        id: id.to_string(),
        config,
    })
}

/// Hard drives of `vm`, in disk-number order.
pub async fn disks_of(node: &NodeState, vm: &VmConfig) -> McvResult<Vec<HardDriveConfig>> {
    let mut disks = Vec::with_capacity(vm.hard_drives.len());
    for id in &vm.hard_drives {
        disks.push(node.config.hard_drive(id).await?);
    }
    disks.sort_by_key(|hdd| hdd.disk_number);
    Ok(disks)
}

/// Node whose copy of a disk answers size queries.
fn query_node(node: &NodeState, hdd: &HardDriveConfig) -> String {
    match hdd.disk_type {
        HardDriveType::Local => local::holder(node, hdd),
        HardDriveType::Drbd => hdd
            .nodes
            .iter()
            .find(|n| node.is_local(n))
            .or_else(|| hdd.nodes.first())
            .cloned()
            .unwrap_or_else(|| node.hostname.clone()),
    }
}

pub async fn size_of(node: &NodeState, ctx: &CallContext, hdd: &HardDriveConfig) -> McvResult<u64> {
    volume::size_on(node, ctx, &query_node(node, hdd), &raw_ref(hdd)).await
}

/// Disk as presented to libvirt on this node.
pub async fn disk_device(node: &NodeState, hdd: &HardDriveConfig) -> McvResult<DiskDevice> {
    let sb = node.config.storage_backend(&hdd.storage_backend).await?;
    let (device_type, source_param, path) = match &hdd.drbd {
        Some(drbd) => ("block", "dev", drbd.block_device_path()),
        None => (
            sb.storage_type.libvirt_device_type(),
            sb.storage_type.libvirt_source_parameter(),
            volume::volume_path(&sb, &node.hostname, &hdd.raw_volume())?,
        ),
    };
    Ok(DiskDevice {
        device_type,
        source_param,
        path,
        target: hdd.target_device(),
        bus: hdd.driver.bus(),
    })
}

/// Fail unless a new disk of `disk_type` on `sb` may join `vm`'s disks.
pub async fn check_compatible(
    node: &NodeState,
    vm: &VmConfig,
    disk_type: HardDriveType,
    sb: &StorageBackendConfig,
) -> McvResult<()> {
    for existing in disks_of(node, vm).await? {
        let existing_sb = node.config.storage_backend(&existing.storage_backend).await?;
        if existing.disk_type != disk_type
            || existing_sb.shared != sb.shared
            || existing_sb.storage_type != sb.storage_type
        {
            return Err(McvError::IncompatibleHardDrive(format!(
                "{} has {} disks on {} storage (shared: {}); new disk is {} on {} (shared: {})",
                vm.name,
                existing.disk_type,
                existing_sb.storage_type,
                existing_sb.shared,
                disk_type,
                sb.storage_type,
                sb.shared
            )));
        }
    }
    Ok(())
}

/// Disk type a new disk for `vm` gets when none is named: that of its
/// existing disks, otherwise `Local`.
async fn default_type(node: &NodeState, vm: &VmConfig) -> McvResult<HardDriveType> {
    Ok(disks_of(node, vm)
        .await?
        .first()
        .map(|hdd| hdd.disk_type)
        .unwrap_or(HardDriveType::Local))
}

async fn next_disk_number(node: &NodeState, vm: &VmConfig) -> McvResult<u32> {
    Ok(disks_of(node, vm)
        .await?
        .iter()
        .map(|hdd| hdd.disk_number)
        .max()
        .unwrap_or(0)
        + 1)
}

/// Create a disk and attach it to `vm`. Runs inside the caller's
/// transaction.
pub async fn create_disk(
    node: &NodeState,
    ctx: &CallContext,
    vm: &VmConfig,
    size: u64,
    disk_type: Option<HardDriveType>,
    backend: Option<&str>,
    driver: DiskDriver,
) -> McvResult<HardDriveConfig> {
    if size == 0 {
        return Err(McvError::InvalidArguments("disk size must be greater than zero".into()));
    }
    let disk_type = match disk_type {
        Some(t) => t,
        None => default_type(node, vm).await?,
    };
    let placement = match disk_type {
        HardDriveType::Drbd => vm.available_nodes.clone(),
        HardDriveType::Local => vec![node.hostname.clone()],
    };
    let sb = storage::select_backend(node, backend, &placement).await?;
    check_compatible(node, vm, disk_type, &sb).await?;
    // Fresh view: earlier disks of the same call have been attached since.
    let vm = node.config.vm(&vm.id).await?;
    let disk_number = next_disk_number(node, &vm).await?;
    match disk_type {
        HardDriveType::Local => local::create(node, ctx, &vm, &sb, size, driver, disk_number).await,
        HardDriveType::Drbd => engine::create(node, ctx, &vm, &sb, size, driver, disk_number).await,
    }
}

/// Detach a disk from its VM everywhere, optionally destroying its
/// storage, and drop its config.
pub async fn delete_disk(
    node: &NodeState,
    ctx: &CallContext,
    vm: &VmConfig,
    hdd: &HardDriveConfig,
    keep_storage: bool,
) -> McvResult<()> {
    let all_nodes = node.all_nodes().await;
    Function::new(Request::Vm(VmOp::UpdateConfig {
        id: vm.id.clone(),
        change: VmConfigChange::DetachHardDrive(hdd.id.clone()),
        reason: format!("detach disk {} from {}", hdd.disk_number, vm.name),
    }))
    .on(all_nodes.iter().cloned())
    .run_all(node, ctx)
    .await?;

    match hdd.disk_type {
        HardDriveType::Drbd => engine::destroy(node, ctx, hdd, keep_storage).await?,
        HardDriveType::Local if keep_storage => {}
        HardDriveType::Local => {
            Function::new(Request::Volume(VolumeOp::Delete {
                volume: raw_ref(hdd),
                ignore_missing: true,
            }))
            .on_node(&local::holder(node, hdd))
            .run(node, ctx)
            .await?;
        }
    }

    Function::new(put_config(&hdd.id, None))
        .on(all_nodes)
        .run_all(node, ctx)
        .await?;
    info!("deleted disk {} of {}", hdd.disk_number, vm.name);
    Ok(())
}

/// Make a disk usable by libvirt on this node.
pub async fn activate(node: &NodeState, ctx: &CallContext, hdd: &HardDriveConfig) -> McvResult<()> {
    match hdd.disk_type {
        HardDriveType::Local => {
            volume::handle(node, ctx, VolumeOp::Activate { volume: raw_ref(hdd) }).await?;
            Ok(())
        }
        HardDriveType::Drbd => engine::activate(node, ctx, hdd).await,
    }
}

/// Release a disk on this node once libvirt no longer uses it here.
pub async fn deactivate(node: &NodeState, ctx: &CallContext, hdd: &HardDriveConfig) -> McvResult<()> {
    match hdd.disk_type {
        HardDriveType::Local => {
            let sb = node.config.storage_backend(&hdd.storage_backend).await?;
            // A shared volume may be in use from another node.
            if !sb.shared {
                volume::handle(node, ctx, VolumeOp::Deactivate { volume: raw_ref(hdd) }).await?;
            }
            Ok(())
        }
        HardDriveType::Drbd => engine::deactivate(node, ctx, hdd).await,
    }
}

/// Copy the contents of `source` onto `dest`, both held by this node.
/// Replicated disks are copied device to device so the peer follows.
pub async fn copy_contents(
    node: &NodeState,
    ctx: &CallContext,
    source: &HardDriveConfig,
    dest: &HardDriveConfig,
) -> McvResult<()> {
    for hdd in [source, dest] {
        if !hdd.nodes.iter().any(|n| node.is_local(n)) {
            return Err(McvError::InvalidArguments(format!(
                "{} is not held by {}",
                hdd.id, node.hostname
            )));
        }
    }
    if source.disk_type == HardDriveType::Local && dest.disk_type == HardDriveType::Local {
        Function::new(Request::Volume(VolumeOp::Copy {
            source: raw_ref(source),
            dest: raw_ref(dest),
        }))
        .run(node, ctx)
        .await?;
        return Ok(());
    }
    activate(node, ctx, source).await?;
    activate(node, ctx, dest).await?;
    let from = disk_device(node, source).await?.path;
    let to = disk_device(node, dest).await?.path;
    node.runner
        .run_ok(
            "dd",
            &[&format!("if={}", from), &format!("of={}", to), "bs=1M", "conv=fsync"],
        )
        .await?;
    info!("copied {} to {}", from, to);
    Ok(())
}

async fn info_of(node: &NodeState, ctx: &CallContext, hdd: HardDriveConfig) -> HardDriveInfo {
    let size = size_of(node, ctx, &hdd).await.ok();
    HardDriveInfo {
        id: hdd.id,
        disk_type: hdd.disk_type,
        driver: hdd.driver,
        storage_backend: hdd.storage_backend,
        vm: hdd.vm,
        disk_number: hdd.disk_number,
        nodes: hdd.nodes,
        size,
        drbd: hdd.drbd,
    }
}

async fn ensure_stopped(node: &NodeState, ctx: &CallContext, vm: &VmConfig) -> McvResult<()> {
    if crate::vm::power_state(node, ctx, vm).await? == PowerState::Running {
        return Err(McvError::VmAlreadyStarted(vm.name.clone()));
    }
    Ok(())
}

pub async fn handle(node: &NodeState, ctx: &CallContext, op: HardDriveOp) -> McvResult<Outcome> {
    match op {
        HardDriveOp::Create {
            vm,
            size,
            storage_type,
            backend,
            driver,
        } => {
            ctx.assert_permission(Permission::ModifyVm)?;
            let vm = node.config.vm_by_name(&vm).await?;
            vm.ensure_unlocked()?;
            ensure_stopped(node, ctx, &vm).await?;
            let tx = Transaction::begin(ctx);
            let result = create_disk(node, ctx, &vm, size, storage_type, backend.as_deref(), driver).await;
            let hdd = tx.settle(node, ctx, result).await?;
            Ok(Outcome::reply(Reply::Text(hdd.id)))
        }

        HardDriveOp::Delete { vm, disk_number } => {
            ctx.assert_permission(Permission::ModifyVm)?;
            let vm = node.config.vm_by_name(&vm).await?;
            vm.ensure_unlocked()?;
            ensure_stopped(node, ctx, &vm).await?;
            let hdd = node.config.vm_disk(&vm, disk_number).await?;
            let tx = Transaction::begin(ctx);
            let result = delete_disk(node, ctx, &vm, &hdd, false).await;
            tx.settle(node, ctx, result).await?;
            Ok(Outcome::unit())
        }

        HardDriveOp::Resize {
            vm,
            disk_number,
            increase,
        } => {
            ctx.assert_permission(Permission::ModifyVm)?;
            let vm = node.config.vm_by_name(&vm).await?;
            vm.ensure_unlocked()?;
            ensure_stopped(node, ctx, &vm).await?;
            if increase == 0 {
                return Err(McvError::InvalidArguments("size increase must be greater than zero".into()));
            }
            let hdd = node.config.vm_disk(&vm, disk_number).await?;
            let tx = Transaction::begin(ctx);
            let result = async {
                match hdd.disk_type {
                    HardDriveType::Local => {
                        let sb = node.config.storage_backend(&hdd.storage_backend).await?;
                        let holder = local::holder(node, &hdd);
                        storage::check_free_space(node, ctx, &sb, &[holder.clone()], increase).await?;
                        Function::new(Request::Volume(VolumeOp::Resize {
                            volume: raw_ref(&hdd),
                            delta: increase,
                            increase: true,
                        }))
                        .on_node(&holder)
                        .run(node, ctx)
                        .await?;
                        Ok(())
                    }
                    HardDriveType::Drbd => engine::resize(node, ctx, &hdd, increase).await,
                }
            }
            .await;
            tx.settle(node, ctx, result).await?;
            info!("disk {} of {} grown by {} bytes", disk_number, vm.name, increase);
            Ok(Outcome::unit())
        }

        HardDriveOp::Verify { vm, disk_number } => {
            ctx.assert_permission(Permission::ManageDrbd)?;
            let vm = node.config.vm_by_name(&vm).await?;
            let hdd = node.config.vm_disk(&vm, disk_number).await?;
            engine::verify(node, ctx, &hdd).await?;
            Ok(Outcome::unit())
        }

        HardDriveOp::VerifyAll => {
            ctx.assert_permission(Permission::ManageDrbd)?;
            let mut results = Vec::new();
            for hdd in node.config.hard_drives.list().await {
                let Some(drbd) = hdd.drbd.clone() else {
                    continue;
                };
                match engine::verify(node, ctx, &hdd).await {
                    Ok(()) => results.push(format!("{}: OK", drbd.resource_name)),
                    Err(e) => {
                        warn!("verify of {} failed: {}", drbd.resource_name, e);
                        results.push(format!("{}: {}", drbd.resource_name, e));
                    }
                }
            }
            Ok(Outcome::reply(Reply::Texts(results)))
        }

        HardDriveOp::Resync {
            vm,
            disk_number,
            source_node,
            auto_determine,
        } => {
            ctx.assert_permission(Permission::ManageDrbd)?;
            let source = match (source_node, auto_determine) {
                (Some(_), true) => {
                    return Err(McvError::TooManyParameters(
                        "give either a source node or --auto-determine, not both".into(),
                    ))
                }
                (None, false) => {
                    return Err(McvError::InvalidArguments(
                        "a source node or --auto-determine is required".into(),
                    ))
                }
                (Some(source), false) => Some(source),
                (None, true) => None,
            };
            let vm = node.config.vm_by_name(&vm).await?;
            let source = match source {
                Some(source) => source,
                None => vm.node.clone().ok_or_else(|| McvError::VmNotRegistered(vm.name.clone()))?,
            };
            let hdd = node.config.vm_disk(&vm, disk_number).await?;
            engine::resync(node, ctx, &hdd, &source).await?;
            Ok(Outcome::unit())
        }

        HardDriveOp::SetSyncState {
            vm,
            disk_number,
            sync_state,
        } => {
            ctx.assert_permission(Permission::SetSyncState)?;
            let vm = node.config.vm_by_name(&vm).await?;
            let hdd = node.config.vm_disk(&vm, disk_number).await?;
            hdd.drbd()?;
            engine::set_sync_state(node, ctx, &hdd.id, sync_state).await?;
            Ok(Outcome::unit())
        }

        HardDriveOp::List => {
            let mut disks = Vec::new();
            for hdd in node.config.hard_drives.list().await {
                disks.push(info_of(node, ctx, hdd).await);
            }
            Ok(Outcome::reply(Reply::HardDrives(disks)))
        }

        HardDriveOp::PutConfig { id, config } => {
            let reason = match &config {
                Some(_) => format!("write hard drive {}", id),
                None => format!("remove hard drive {}", id),
            };
            let present = config.is_some();
            let prev = node.config.hard_drives.put(&ctx.user, &reason, &id, config).await?;
            node.config
                .global
                .update(&ctx.user, &reason, |cfg| {
                    cfg.hard_drives.retain(|h| h != &id);
                    if present {
                        cfg.hard_drives.push(id.clone());
                    }
                    Ok(())
                })
                .await?;
            Ok(Outcome::unit().with_compensation(put_config(&id, prev)))
        }

        HardDriveOp::Activate { id } => {
            let hdd = node.config.hard_drive(&id).await?;
            activate(node, ctx, &hdd).await?;
            Ok(Outcome::unit().with_compensation(Request::HardDrive(HardDriveOp::Deactivate { id })))
        }

        HardDriveOp::Deactivate { id } => {
            let hdd = node.config.hard_drive(&id).await?;
            deactivate(node, ctx, &hdd).await?;
            Ok(Outcome::unit())
        }

        HardDriveOp::MoveReplica { id, source, dest } => {
            let hdd = node.config.hard_drive(&id).await?;
            let moved = engine::move_replica(node, ctx, &hdd, &source, &dest).await?;
            Ok(Outcome::reply(Reply::Texts(moved.nodes)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcvirt_core::command::CommandOutput;

    use crate::testutil::{drbd_cluster, drbd_hard_drive, single_node_with_backend};

    async fn vm_with_disk(node: &NodeState) -> (VmConfig, HardDriveConfig) {
        let ctx = CallContext::internal();
        let mut vm = VmConfig::new("vm-0".into(), "vm1".into(), 1, 512 * 1024 * 1024);
        vm.available_nodes = vec![node.hostname.clone()];
        node.config.vms.put("admin", "test", &vm.id, Some(vm.clone())).await.unwrap();
        let tx = Transaction::begin(&ctx);
        let hdd = create_disk(node, &ctx, &vm, 1 << 20, None, None, DiskDriver::Virtio).await.unwrap();
        tx.finish(&ctx);
        (node.config.vm(&vm.id).await.unwrap(), hdd)
    }

    #[tokio::test]
    async fn test_disk_numbers_increase() {
        let node = single_node_with_backend("n1").await;
        let (vm, first) = vm_with_disk(&node).await;
        let ctx = CallContext::internal();
        let second = create_disk(&node, &ctx, &vm, 1 << 20, Some(HardDriveType::Local), None, DiskDriver::Ide)
            .await
            .unwrap();
        assert_eq!(first.disk_number, 1);
        assert_eq!(second.disk_number, 2);
        assert_eq!(second.target_device(), "hdb");
        let device = disk_device(&node, &second).await.unwrap();
        assert_eq!(device.device_type, "block");
        assert!(device.path.ends_with("/mcvirt_vm-vm1-disk-2"));
    }

    #[tokio::test]
    async fn test_mixing_disk_types_is_refused() {
        let node = single_node_with_backend("n1").await;
        let (vm, _) = vm_with_disk(&node).await;
        let sb = node.config.storage_backend("sb-test").await.unwrap();
        let err = check_compatible(&node, &vm, HardDriveType::Drbd, &sb).await.unwrap_err();
        assert!(matches!(err, McvError::IncompatibleHardDrive(_)));
        check_compatible(&node, &vm, HardDriveType::Local, &sb).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_create_leaves_nothing_behind() {
        let node = single_node_with_backend("n1").await;
        let ctx = CallContext::internal();
        let mut vm = VmConfig::new("vm-0".into(), "vm1".into(), 1, 512 * 1024 * 1024);
        vm.available_nodes = vec!["n1".into()];
        node.config.vms.put("admin", "test", &vm.id, Some(vm.clone())).await.unwrap();
        node.runner.respond("lvcreate", CommandOutput::failed(5, "insufficient free extents"));

        let err = handle(
            &node,
            &ctx,
            HardDriveOp::Create {
                vm: "vm1".into(),
                size: 1 << 20,
                storage_type: None,
                backend: None,
                driver: DiskDriver::Virtio,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, McvError::ExternalStorageCommandError(_)));
        assert!(node.config.hard_drives.list().await.is_empty());
        assert!(node.config.global.get().await.hard_drives.is_empty());
        assert!(node.config.vm("vm-0").await.unwrap().hard_drives.is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_volume_and_config() {
        let node = single_node_with_backend("n1").await;
        let (_, hdd) = vm_with_disk(&node).await;
        handle(&node, &CallContext::internal(), HardDriveOp::Delete { vm: "vm1".into(), disk_number: 1 })
            .await
            .unwrap();
        assert!(node.runner.ran("lvremove -f"));
        assert!(node.config.hard_drive(&hdd.id).await.is_err());
        assert!(node.config.vm("vm-0").await.unwrap().hard_drives.is_empty());
    }

    #[tokio::test]
    async fn test_resync_flag_checks() {
        let c = drbd_cluster(&["n1", "n2"]).await;
        let n1 = c.node("n1");
        let hdd = drbd_hard_drive(n1).await;
        let mut vm = VmConfig::new("vm1".into(), "vm1".into(), 1, 512 * 1024 * 1024);
        vm.available_nodes = hdd.nodes.clone();
        vm.hard_drives = vec![hdd.id.clone()];
        let id = vm.id.clone();
        n1.config.vms.put("admin", "test", &id, Some(vm)).await.unwrap();
        let ctx = CallContext::internal();
        let resync = |source_node: Option<&str>, auto_determine: bool| HardDriveOp::Resync {
            vm: "vm1".into(),
            disk_number: 1,
            source_node: source_node.map(String::from),
            auto_determine,
        };

        let err = handle(n1, &ctx, resync(Some("n1"), true)).await.unwrap_err();
        assert!(matches!(err, McvError::TooManyParameters(_)));
        let err = handle(n1, &ctx, resync(None, false)).await.unwrap_err();
        assert!(matches!(err, McvError::InvalidArguments(_)));
        let err = handle(n1, &ctx, resync(None, true)).await.unwrap_err();
        assert_eq!(err, McvError::VmNotRegistered("vm1".into()));
        assert!(!n1.runner.ran("drbdadm invalidate-remote"));

        handle(n1, &ctx, resync(Some("n1"), false)).await.unwrap();
        assert!(n1.runner.ran("drbdadm invalidate-remote mcvirt_vm-vm1-disk-1"));
    }
}
