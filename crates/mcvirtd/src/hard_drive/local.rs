//! Hard drives on a single volume.

use tracing::info;

use mcvirt_proto::constants::HARD_DRIVE_ID_PREFIX;
use mcvirt_proto::hard_drive::{local_volume_name, DiskDriver, HardDriveConfig, HardDriveType};
use mcvirt_proto::id::generate_id;
use mcvirt_proto::request::{VolumeOp, VolumeRef};
use mcvirt_proto::storage::StorageBackendConfig;
use mcvirt_proto::vm::VmConfig;
use mcvirt_proto::{McvError, McvResult, Request};

use crate::context::CallContext;
use crate::daemon::NodeState;
use crate::drbd::engine::attach;
use crate::drbd::put_hard_drive;
use crate::storage;
use crate::transaction::Function;

/// Nodes a local disk on `sb` is reachable from: every member of a shared
/// backend the VM may run on, otherwise just the creating node.
fn disk_nodes(local: &str, vm: &VmConfig, sb: &StorageBackendConfig) -> Vec<String> {
    if sb.shared {
        vm.available_nodes
            .iter()
            .filter(|n| sb.is_available_on(n))
            .cloned()
            .collect()
    } else {
        vec![local.to_string()]
    }
}

pub async fn create(
    node: &NodeState,
    ctx: &CallContext,
    vm: &VmConfig,
    sb: &StorageBackendConfig,
    size: u64,
    driver: DiskDriver,
    disk_number: u32,
) -> McvResult<HardDriveConfig> {
    if !sb.is_available_on(&node.hostname) {
        return Err(McvError::StorageBackendNotAvailableOnNode {
            backend: sb.name.clone(),
            node: node.hostname.clone(),
        });
    }
    if !sb.shared && vm.available_nodes.iter().any(|n| !node.is_local(n)) {
        return Err(McvError::UnsuitableNode {
            vm: vm.name.clone(),
            node: node.hostname.clone(),
        });
    }
    let local = [node.hostname.clone()];
    storage::ensure_available_on(node, ctx, sb, &local).await?;
    storage::check_free_space(node, ctx, sb, &local, size).await?;

    let hdd = HardDriveConfig {
        id: generate_id(HARD_DRIVE_ID_PREFIX, &format!("{}-{}", vm.name, disk_number)),
        disk_type: HardDriveType::Local,
        driver,
        storage_backend: sb.id.clone(),
        base_volume_name: local_volume_name(&vm.name, disk_number),
        nodes: disk_nodes(&node.hostname, vm, sb),
        vm: Some(vm.id.clone()),
        disk_number,
        drbd: None,
    };

    Function::new(put_hard_drive(&hdd))
        .on(node.all_nodes().await)
        .run_all(node, ctx)
        .await?;
    Function::new(Request::Volume(VolumeOp::Create {
        volume: VolumeRef::new(&hdd.storage_backend, &hdd.raw_volume()),
        size,
    }))
    .run(node, ctx)
    .await?;
    attach(node, ctx, vm, &hdd).await?;
    info!("created local disk {} for {} on {}", hdd.raw_volume(), vm.name, sb.name);
    Ok(hdd)
}

/// Node that holds the volume of a local disk, preferring this one.
pub fn holder(node: &NodeState, hdd: &HardDriveConfig) -> String {
    if hdd.nodes.iter().any(|n| node.is_local(n)) || hdd.nodes.is_empty() {
        node.hostname.clone()
    } else {
        hdd.nodes[0].clone()
    }
}
