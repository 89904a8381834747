//! Cloning and duplicating VMs.
//!
//! A clone shares its parent's data through a snapshot of each disk and
//! stays linked to it; the parent can then neither start nor be deleted
//! while the clone exists. A duplicate is an independent full copy.

use tracing::info;

use mcvirt_proto::constants::{HARD_DRIVE_ID_PREFIX, VM_ID_PREFIX};
use mcvirt_proto::hard_drive::{local_volume_name, HardDriveConfig, HardDriveType};
use mcvirt_proto::id::generate_id;
use mcvirt_proto::request::VolumeOp;
use mcvirt_proto::vm::{NetworkAdapter, PowerState, VmConfig, VmConfigChange};
use mcvirt_proto::{McvError, McvResult, Request};

use super::{ensure_name_free, generate_mac, power_state, put_config, update};
use crate::context::CallContext;
use crate::daemon::NodeState;
use crate::drbd::engine::attach;
use crate::drbd::put_hard_drive;
use crate::hard_drive::{self, local};
use crate::transaction::{Function, Transaction};

/// New VM config carrying over everything but identity, disks and
/// registration from `source`.
async fn derive_config(node: &NodeState, source: &VmConfig, name: &str) -> VmConfig {
    let mut vm = VmConfig::new(
        generate_id(VM_ID_PREFIX, name),
        name.to_string(),
        source.cpu_cores,
        source.memory,
    );
    vm.graphics_driver = source.graphics_driver;
    vm.available_nodes = source.available_nodes.clone();
    vm.modifications = source.modifications.clone();
    for adapter in &source.network_adapters {
        vm.network_adapters.push(NetworkAdapter {
            mac_address: generate_mac(node).await,
            network: adapter.network.clone(),
        });
    }
    vm
}

async fn publish(node: &NodeState, ctx: &CallContext, vm: &VmConfig) -> McvResult<()> {
    Function::new(put_config(&vm.id, Some(vm.clone())))
        .on(node.all_nodes().await)
        .run_all(node, ctx)
        .await?;
    Ok(())
}

/// Snapshot every disk of `parent` into a new VM linked to it.
pub async fn clone_vm(node: &NodeState, ctx: &CallContext, parent: &VmConfig, new_name: &str) -> McvResult<String> {
    ensure_name_free(node, new_name).await?;
    if parent.clone_parent.is_some() {
        return Err(McvError::VmIsClone(parent.name.clone()));
    }
    parent.ensure_unlocked()?;
    if power_state(node, ctx, parent).await? == PowerState::Running {
        return Err(McvError::VmAlreadyStarted(parent.name.clone()));
    }
    let disks = hard_drive::disks_of(node, parent).await?;
    if disks.iter().any(|hdd| hdd.disk_type == HardDriveType::Drbd) {
        return Err(McvError::CannotCloneDrbdBasedVms);
    }

    let mut vm = derive_config(node, parent, new_name).await;
    vm.clone_parent = Some(parent.id.clone());

    let tx = Transaction::begin(ctx);
    let result = async {
        publish(node, ctx, &vm).await?;
        for source in &disks {
            let hdd = HardDriveConfig {
                id: generate_id(HARD_DRIVE_ID_PREFIX, &format!("{}-{}", vm.name, source.disk_number)),
                disk_type: HardDriveType::Local,
                driver: source.driver,
                storage_backend: source.storage_backend.clone(),
                base_volume_name: local_volume_name(&vm.name, source.disk_number),
                nodes: source.nodes.clone(),
                vm: Some(vm.id.clone()),
                disk_number: source.disk_number,
                drbd: None,
            };
            Function::new(put_hard_drive(&hdd))
                .on(node.all_nodes().await)
                .run_all(node, ctx)
                .await?;
            let size = hard_drive::size_of(node, ctx, source).await?;
            Function::new(Request::Volume(VolumeOp::Snapshot {
                volume: hard_drive::raw_ref(source),
                dest: hdd.raw_volume(),
                size,
            }))
            .on_node(&local::holder(node, source))
            .run(node, ctx)
            .await?;
            attach(node, ctx, &vm, &hdd).await?;
        }
        update(
            node,
            ctx,
            parent,
            VmConfigChange::AddCloneChild(vm.id.clone()),
            &format!("cloned as {}", vm.name),
        )
        .await
    }
    .await;
    tx.settle(node, ctx, result).await?;
    info!("cloned {} as {}", parent.name, vm.name);
    Ok(vm.id)
}

/// Copy `source` into a new, unrelated VM, optionally onto another backend.
pub async fn duplicate_vm(
    node: &NodeState,
    ctx: &CallContext,
    source: &VmConfig,
    new_name: &str,
    backend: Option<&str>,
) -> McvResult<String> {
    ensure_name_free(node, new_name).await?;
    source.ensure_unlocked()?;
    if power_state(node, ctx, source).await? == PowerState::Running {
        return Err(McvError::VmAlreadyStarted(source.name.clone()));
    }
    let disks = hard_drive::disks_of(node, source).await?;
    let vm = derive_config(node, source, new_name).await;

    let tx = Transaction::begin(ctx);
    let result = async {
        publish(node, ctx, &vm).await?;
        for disk in &disks {
            let size = hard_drive::size_of(node, ctx, disk).await?;
            let target = match backend {
                Some(name) => name.to_string(),
                None => disk.storage_backend.clone(),
            };
            let copy = hard_drive::create_disk(node, ctx, &vm, size, Some(disk.disk_type), Some(&target), disk.driver)
                .await?;
            hard_drive::copy_contents(node, ctx, disk, &copy).await?;
        }
        Ok::<_, McvError>(())
    }
    .await;
    tx.settle(node, ctx, result).await?;
    info!("duplicated {} as {}", source.name, vm.name);
    Ok(vm.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::single_node_with_backend;
    use crate::vm::handle;
    use crate::vm::tests::create_request;
    use mcvirt_proto::request::VmOp;

    #[tokio::test]
    async fn test_clone_links_parent_and_blocks_delete() {
        let node = single_node_with_backend("n1").await;
        let ctx = CallContext::internal();
        handle(&node, &ctx, create_request("base", vec![1 << 20])).await.unwrap();

        handle(&node, &ctx, VmOp::Clone { name: "base".into(), new_name: "child".into() })
            .await
            .unwrap();
        let parent = node.config.vm_by_name("base").await.unwrap();
        let child = node.config.vm_by_name("child").await.unwrap();
        assert_eq!(child.clone_parent.as_deref(), Some(parent.id.as_str()));
        assert_eq!(parent.clone_children, vec![child.id.clone()]);
        assert!(node.runner.ran("lvcreate --snapshot -n mcvirt_vm-child-disk-1"));

        let err = handle(&node, &ctx, VmOp::Delete { name: "base".into(), keep_disks: false, keep_config: false })
            .await
            .unwrap_err();
        assert_eq!(err, McvError::CannotDeleteClonedVm("base".into()));
        let err = handle(&node, &ctx, VmOp::Clone { name: "child".into(), new_name: "grandchild".into() })
            .await
            .unwrap_err();
        assert_eq!(err, McvError::VmIsClone("child".into()));

        handle(&node, &ctx, VmOp::Delete { name: "child".into(), keep_disks: false, keep_config: false })
            .await
            .unwrap();
        let parent = node.config.vm_by_name("base").await.unwrap();
        assert!(parent.clone_children.is_empty());
    }

    #[tokio::test]
    async fn test_cloned_parent_cannot_start() {
        let node = single_node_with_backend("n1").await;
        let ctx = CallContext::internal();
        handle(&node, &ctx, create_request("base", vec![1 << 20])).await.unwrap();
        handle(&node, &ctx, VmOp::Register { name: "base".into(), node: None }).await.unwrap();
        handle(&node, &ctx, VmOp::Clone { name: "base".into(), new_name: "child".into() })
            .await
            .unwrap();

        let err = handle(&node, &ctx, VmOp::Start { name: "base".into(), iso: None })
            .await
            .unwrap_err();
        assert_eq!(err, McvError::VmHasCloneChildren("base".into()));
        assert!(!node.hypervisor.is_running("base").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_copies_disks() {
        let node = single_node_with_backend("n1").await;
        let ctx = CallContext::internal();
        handle(&node, &ctx, create_request("base", vec![1 << 20])).await.unwrap();
        handle(&node, &ctx, VmOp::Duplicate { name: "base".into(), new_name: "copy".into(), backend: None })
            .await
            .unwrap();
        let copy = node.config.vm_by_name("copy").await.unwrap();
        assert!(copy.clone_parent.is_none());
        assert_eq!(copy.hard_drives.len(), 1);
        assert!(node.runner.ran("lvcreate --yes -n mcvirt_vm-copy-disk-1"));
        assert!(node.runner.ran("dd if=/dev/"));
    }
}
