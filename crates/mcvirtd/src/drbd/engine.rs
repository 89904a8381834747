//! Replicated hard-drive engine.
//!
//! Every DRBD-backed disk lives on exactly two nodes: a raw volume and a
//! metadata volume on each, a resource file on each, and one block device
//! `/dev/drbd<minor>` that is primary on the node running the VM. All
//! steps below run as `Function`s, so a failure part-way through unwinds
//! on both nodes.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use mcvirt_proto::constants::{DRBD_BASE_PORT, DRBD_FIRST_MINOR, HARD_DRIVE_ID_PREFIX};
use mcvirt_proto::drbd::{meta_volume_size, ConnectionState, DrbdStatus, Role};
use mcvirt_proto::hard_drive::{
    drbd_base_volume_name, drbd_resource_name, DiskDriver, DrbdDiskConfig, HardDriveConfig, HardDriveType,
};
use mcvirt_proto::id::generate_id;
use mcvirt_proto::request::{DrbdAction, DrbdOp, HardDriveOp, NodeOp, VmOp, VolumeOp, VolumeRef};
use mcvirt_proto::storage::StorageBackendConfig;
use mcvirt_proto::vm::{VmConfig, VmConfigChange};
use mcvirt_proto::{McvError, McvResult, Request};

use super::{adm, put_hard_drive, status_on};
use crate::context::CallContext;
use crate::daemon::NodeState;
use crate::remote::run_remote_command;
use crate::transaction::{execute_on, Function};
use crate::{storage, volume};

fn raw(hdd: &HardDriveConfig) -> VolumeRef {
    VolumeRef::new(&hdd.storage_backend, &hdd.raw_volume())
}

fn meta(hdd: &HardDriveConfig) -> McvResult<VolumeRef> {
    hdd.meta_volume()
        .map(|name| VolumeRef::new(&hdd.storage_backend, &name))
        .ok_or_else(|| McvError::InvalidArguments(format!("{} is not a DRBD disk", hdd.id)))
}

fn drbd_request(op: DrbdOp) -> Request {
    Request::Drbd(op)
}

/// Node that runs queries for `hdd`: this node if it holds a replica.
fn query_node(node: &NodeState, hdd: &HardDriveConfig) -> String {
    if hdd.nodes.iter().any(|n| node.is_local(n)) {
        node.hostname.clone()
    } else {
        hdd.nodes.first().cloned().unwrap_or_else(|| node.hostname.clone())
    }
}

async fn run_on(node: &NodeState, ctx: &CallContext, req: Request, nodes: &[String]) -> McvResult<()> {
    Function::new(req).on(nodes.iter().cloned()).run_all(node, ctx).await?;
    Ok(())
}

/// Lowest free DRBD port and minor, across existing disks and whatever
/// already listens on any of `nodes`.
pub async fn allocate(node: &NodeState, ctx: &CallContext, nodes: &[String]) -> McvResult<(u16, u32)> {
    let hdds = node.config.hard_drives.list().await;
    let mut ports: BTreeSet<u16> = hdds.iter().filter_map(|h| h.drbd.as_ref()).map(|d| d.port).collect();
    let minors: BTreeSet<u32> = hdds.iter().filter_map(|h| h.drbd.as_ref()).map(|d| d.minor).collect();

    let listening = run_remote_command(node, ctx, nodes, Request::Node(NodeOp::ListeningPorts)).await;
    for result in listening.into_values() {
        ports.extend(result?.into_ports()?);
    }

    let port = (DRBD_BASE_PORT..=u16::MAX)
        .find(|p| !ports.contains(p))
        .ok_or_else(|| McvError::InvalidArguments("no free DRBD port".into()))?;
    let minor = (DRBD_FIRST_MINOR..u32::MAX)
        .find(|m| !minors.contains(m))
        .ok_or_else(|| McvError::InvalidArguments("no free DRBD minor".into()))?;
    Ok((port, minor))
}

/// Persist a new sync state for a disk on every node.
pub async fn set_sync_state(node: &NodeState, ctx: &CallContext, id: &str, sync_state: bool) -> McvResult<()> {
    let mut hdd = node.config.hard_drive(id).await?;
    if let Some(drbd) = hdd.drbd.as_mut() {
        if drbd.sync_state == sync_state {
            return Ok(());
        }
        drbd.sync_state = sync_state;
    }
    Function::new(put_hard_drive(&hdd))
        .on(node.all_nodes().await)
        .run_all(node, ctx)
        .await?;
    Ok(())
}

/// Create a replicated disk for `vm` and attach it.
pub async fn create(
    node: &NodeState,
    ctx: &CallContext,
    vm: &VmConfig,
    sb: &StorageBackendConfig,
    size: u64,
    driver: DiskDriver,
    disk_number: u32,
) -> McvResult<HardDriveConfig> {
    if !node.drbd_enabled().await {
        return Err(McvError::DrbdNotEnabledOnNode(node.hostname.clone()));
    }
    if !sb.is_drbd_suitable() {
        return Err(McvError::InvalidArguments(format!(
            "storage backend {} cannot hold DRBD volumes",
            sb.name
        )));
    }
    let nodes = vm.available_nodes.clone();
    if nodes.len() != 2 || !nodes.iter().any(|n| node.is_local(n)) {
        return Err(McvError::InvalidArguments(format!(
            "a DRBD disk needs exactly two nodes including {}",
            node.hostname
        )));
    }
    storage::ensure_available_on(node, ctx, sb, &nodes).await?;
    let estimated_meta = meta_volume_size(size.div_ceil(512), 512);
    storage::check_free_space(node, ctx, sb, &nodes, size + estimated_meta).await?;

    let (port, minor) = allocate(node, ctx, &nodes).await?;
    let hdd = HardDriveConfig {
        id: generate_id(HARD_DRIVE_ID_PREFIX, &format!("{}-{}", vm.name, disk_number)),
        disk_type: HardDriveType::Drbd,
        driver,
        storage_backend: sb.id.clone(),
        base_volume_name: drbd_base_volume_name(&vm.name, disk_number),
        nodes: nodes.clone(),
        vm: Some(vm.id.clone()),
        disk_number,
        drbd: Some(DrbdDiskConfig {
            resource_name: drbd_resource_name(&vm.name, disk_number),
            minor,
            port,
            sync_state: true,
        }),
    };
    info!(
        "creating DRBD disk {} for {} on {} (port {}, minor {})",
        hdd.id,
        vm.name,
        nodes.join(", "),
        port,
        minor
    );

    let all_nodes = node.all_nodes().await;
    run_on(node, ctx, put_hard_drive(&hdd), &all_nodes).await?;

    let raw = raw(&hdd);
    run_on(node, ctx, Request::Volume(VolumeOp::Create { volume: raw.clone(), size }), &nodes).await?;
    run_on(node, ctx, Request::Volume(VolumeOp::Activate { volume: raw.clone() }), &nodes).await?;
    run_on(node, ctx, Request::Volume(VolumeOp::Wipe { volume: raw.clone() }), &nodes).await?;

    let (sectors, sector_size) = volume::geometry_on(node, ctx, &node.hostname, &raw).await?;
    let meta = meta(&hdd)?;
    let meta_size = meta_volume_size(sectors, sector_size);
    run_on(node, ctx, Request::Volume(VolumeOp::Create { volume: meta.clone(), size: meta_size }), &nodes).await?;
    run_on(node, ctx, Request::Volume(VolumeOp::Activate { volume: meta.clone() }), &nodes).await?;
    run_on(node, ctx, Request::Volume(VolumeOp::Wipe { volume: meta }), &nodes).await?;

    let id = hdd.id.clone();
    run_on(node, ctx, drbd_request(DrbdOp::WriteResourceConfig { hard_drive: id.clone() }), &nodes).await?;
    run_on(node, ctx, adm(&id, DrbdAction::CreateMd), &nodes).await?;
    run_on(node, ctx, adm(&id, DrbdAction::Up), &nodes).await?;
    tokio::time::sleep(node.settings.timings.drbd_up_settle).await;

    attach(node, ctx, vm, &hdd).await?;

    let local = [node.hostname.clone()];
    let peers: Vec<String> = nodes.iter().filter(|n| !node.is_local(n)).cloned().collect();
    run_on(node, ctx, adm(&id, DrbdAction::OverwritePeer), &local).await?;
    run_on(node, ctx, adm(&id, DrbdAction::Connect), &nodes).await?;
    run_on(node, ctx, adm(&id, DrbdAction::Primary), &local).await?;
    run_on(node, ctx, adm(&id, DrbdAction::Secondary), &peers).await?;
    Ok(hdd)
}

/// Record the disk in the VM's config on every node.
pub async fn attach(node: &NodeState, ctx: &CallContext, vm: &VmConfig, hdd: &HardDriveConfig) -> McvResult<()> {
    Function::new(Request::Vm(VmOp::UpdateConfig {
        id: vm.id.clone(),
        change: VmConfigChange::AttachHardDrive(hdd.id.clone()),
        reason: format!("attach disk {} to {}", hdd.disk_number, vm.name),
    }))
    .on(node.all_nodes().await)
    .run_all(node, ctx)
    .await?;
    Ok(())
}

/// Bring the disk up for use on this node: volumes active, resource not
/// in a bad state, local role primary, block device present.
pub async fn activate(node: &NodeState, ctx: &CallContext, hdd: &HardDriveConfig) -> McvResult<()> {
    let drbd = hdd.drbd()?;
    volume::handle(node, ctx, VolumeOp::Activate { volume: raw(hdd) }).await?;
    volume::handle(node, ctx, VolumeOp::Activate { volume: meta(hdd)? }).await?;

    let status = status_on(node, ctx, &node.hostname, &hdd.id).await?;
    status.check(&drbd.resource_name, ctx.ignore_drbd)?;
    if status.local_role != Role::Primary {
        super::handle(node, ctx, DrbdOp::Adm { hard_drive: hdd.id.clone(), action: DrbdAction::Primary }).await?;
    }

    let device = drbd.block_device_path();
    if !node.runner.run("test", &["-b", &device]).await?.success() {
        return Err(McvError::DrbdBlockDeviceMissing(device));
    }
    debug!("{} active on {}", drbd.resource_name, node.hostname);
    Ok(())
}

/// Release the disk on this node: demote to secondary if primary.
pub async fn deactivate(node: &NodeState, ctx: &CallContext, hdd: &HardDriveConfig) -> McvResult<()> {
    let status = status_on(node, ctx, &node.hostname, &hdd.id).await?;
    if status.local_role == Role::Primary {
        super::handle(node, ctx, DrbdOp::Adm { hard_drive: hdd.id.clone(), action: DrbdAction::Secondary }).await?;
    }
    Ok(())
}

/// Tear down the resource on both nodes and, unless `keep_volumes`, both
/// replicas. The caller detaches the disk and removes its config.
pub async fn destroy(node: &NodeState, ctx: &CallContext, hdd: &HardDriveConfig, keep_volumes: bool) -> McvResult<()> {
    let id = hdd.id.clone();
    run_on(node, ctx, adm(&id, DrbdAction::Down), &hdd.nodes).await?;
    run_on(node, ctx, drbd_request(DrbdOp::RemoveResourceConfig { hard_drive: id }), &hdd.nodes).await?;
    if keep_volumes {
        return Ok(());
    }
    for volume in [raw(hdd), meta(hdd)?] {
        run_on(
            node,
            ctx,
            Request::Volume(VolumeOp::Delete { volume, ignore_missing: true }),
            &hdd.nodes,
        )
        .await?;
    }
    Ok(())
}

/// Both volumes must be the same size on every node. Returns the raw size.
async fn sizes_match(node: &NodeState, ctx: &CallContext, hdd: &HardDriveConfig) -> McvResult<u64> {
    let mut raw_size = 0;
    for (index, volume) in [raw(hdd), meta(hdd)?].into_iter().enumerate() {
        let mut sizes = Vec::with_capacity(hdd.nodes.len());
        for host in &hdd.nodes {
            sizes.push((host.clone(), volume::size_on(node, ctx, host, &volume).await?));
        }
        let first = sizes.first().map(|(_, s)| *s).unwrap_or(0);
        if sizes.iter().any(|(_, s)| *s != first) {
            let detail: Vec<String> = sizes.iter().map(|(h, s)| format!("{}={}", h, s)).collect();
            return Err(McvError::InconsistentVolumeSize(format!(
                "{}: {}",
                volume.name,
                detail.join(", ")
            )));
        }
        if index == 0 {
            raw_size = first;
        }
    }
    Ok(raw_size)
}

/// Grow a replicated disk by `increase` bytes on both nodes.
pub async fn resize(node: &NodeState, ctx: &CallContext, hdd: &HardDriveConfig, increase: u64) -> McvResult<()> {
    let sb = node.config.storage_backend(&hdd.storage_backend).await?;
    sizes_match(node, ctx, hdd).await?;

    let host = query_node(node, hdd);
    let (sectors, sector_size) = volume::geometry_on(node, ctx, &host, &raw(hdd)).await?;
    let sector_size = sector_size.max(1);
    let old_meta = meta_volume_size(sectors, sector_size);
    let new_meta = meta_volume_size(sectors + increase.div_ceil(sector_size), sector_size);
    let meta_delta = new_meta.saturating_sub(old_meta);
    storage::check_free_space(node, ctx, &sb, &hdd.nodes, increase + meta_delta).await?;

    let id = hdd.id.clone();
    Function::new(adm(&id, DrbdAction::Disconnect))
        .on(hdd.nodes.iter().cloned())
        .undo(adm(&id, DrbdAction::Connect))
        .run_all(node, ctx)
        .await?;
    run_on(
        node,
        ctx,
        Request::Volume(VolumeOp::Resize { volume: raw(hdd), delta: increase, increase: true }),
        &hdd.nodes,
    )
    .await?;
    if meta_delta > 0 {
        run_on(
            node,
            ctx,
            Request::Volume(VolumeOp::Resize { volume: meta(hdd)?, delta: meta_delta, increase: true }),
            &hdd.nodes,
        )
        .await?;
    }
    run_on(node, ctx, adm(&id, DrbdAction::Resize), &hdd.nodes).await?;
    sizes_match(node, ctx, hdd).await?;
    run_on(node, ctx, adm(&id, DrbdAction::Connect), &hdd.nodes).await?;
    info!("resized {} by {} bytes", hdd.raw_volume(), increase);
    Ok(())
}

async fn poll_while<F>(node: &NodeState, ctx: &CallContext, host: &str, id: &str, mut busy: F) -> McvResult<DrbdStatus>
where
    F: FnMut(&DrbdStatus) -> bool,
{
    loop {
        let status = status_on(node, ctx, host, id).await?;
        if !busy(&status) {
            return Ok(status);
        }
        tokio::time::sleep(node.settings.timings.poll_interval).await;
    }
}

/// Run an online verify. A disk already known to be out of sync is not
/// verified until an operator resyncs it and resets its sync state.
pub async fn verify(node: &NodeState, ctx: &CallContext, hdd: &HardDriveConfig) -> McvResult<()> {
    let drbd = hdd.drbd()?;
    if !drbd.sync_state {
        return Err(McvError::DrbdVolumeNotInSync(drbd.resource_name.clone()));
    }
    let host = query_node(node, hdd);
    let status = status_on(node, ctx, &host, &hdd.id).await?;
    if status.connection != ConnectionState::Connected {
        return Err(McvError::DrbdStateBad {
            resource: drbd.resource_name.clone(),
            state: status.to_string(),
        });
    }

    set_sync_state(node, ctx, &hdd.id, true).await?;
    let result = async {
        execute_on(node, ctx, &host, adm(&hdd.id, DrbdAction::Verify)).await?;
        poll_while(node, ctx, &host, &hdd.id, |s| {
            matches!(s.connection, ConnectionState::VerifyS | ConnectionState::VerifyT)
        })
        .await
    }
    .await;
    if let Err(e) = result {
        set_sync_state(node, ctx, &hdd.id, false).await?;
        return Err(e);
    }

    let after = node.config.hard_drive(&hdd.id).await?;
    if !after.drbd()?.sync_state {
        return Err(McvError::DrbdVolumeNotInSync(drbd.resource_name.clone()));
    }
    info!("verified {}", drbd.resource_name);
    Ok(())
}

/// Overwrite the peer of `source` with its data and wait for the sync.
pub async fn resync(node: &NodeState, ctx: &CallContext, hdd: &HardDriveConfig, source: &str) -> McvResult<()> {
    let drbd = hdd.drbd()?;
    if !hdd.nodes.iter().any(|n| n == source) {
        return Err(McvError::InvalidArguments(format!(
            "{} holds no replica of {}",
            source, drbd.resource_name
        )));
    }
    let status = status_on(node, ctx, source, &hdd.id).await?;
    if status.connection != ConnectionState::Connected {
        return Err(McvError::DrbdStateBad {
            resource: drbd.resource_name.clone(),
            state: status.to_string(),
        });
    }

    execute_on(node, ctx, source, adm(&hdd.id, DrbdAction::InvalidateRemote)).await?;
    let timings = &node.settings.timings;
    for _ in 0..timings.attempts(timings.role_change_wait) {
        let status = status_on(node, ctx, source, &hdd.id).await?;
        if status.connection == ConnectionState::SyncSource {
            break;
        }
        tokio::time::sleep(timings.poll_interval).await;
    }
    poll_while(node, ctx, source, &hdd.id, |s| {
        matches!(
            s.connection,
            ConnectionState::SyncSource | ConnectionState::StartingSyncS | ConnectionState::PausedSyncS
        )
    })
    .await?;
    set_sync_state(node, ctx, &hdd.id, true).await?;
    info!("resynced {} from {}", drbd.resource_name, source);
    Ok(())
}

/// Move the replica on `source` to `dest`. Runs on the node that keeps
/// its replica; the departing node is cleaned up on a best-effort basis.
pub async fn move_replica(
    node: &NodeState,
    ctx: &CallContext,
    hdd: &HardDriveConfig,
    source: &str,
    dest: &str,
) -> McvResult<HardDriveConfig> {
    let drbd = hdd.drbd()?;
    if !hdd.nodes.iter().any(|n| node.is_local(n)) || node.is_local(source) {
        return Err(McvError::InvalidArguments(format!(
            "{} must be moved from the node keeping its replica",
            drbd.resource_name
        )));
    }
    if !hdd.nodes.iter().any(|n| n == source) {
        return Err(McvError::InvalidArguments(format!("{} holds no replica of {}", source, drbd.resource_name)));
    }
    if hdd.nodes.iter().any(|n| n == dest) {
        return Err(McvError::InvalidArguments(format!("{} already holds {}", dest, drbd.resource_name)));
    }
    let sb = node.config.storage_backend(&hdd.storage_backend).await?;
    let dest_nodes = [dest.to_string()];
    storage::ensure_available_on(node, ctx, &sb, &dest_nodes).await?;

    let raw_ref = raw(hdd);
    let meta_ref = meta(hdd)?;
    let size = volume::size_on(node, ctx, &node.hostname, &raw_ref).await?;
    let (sectors, sector_size) = volume::geometry_on(node, ctx, &node.hostname, &raw_ref).await?;
    storage::check_free_space(node, ctx, &sb, &dest_nodes, size + meta_volume_size(sectors, sector_size))
        .await?;

    let best_effort = [
        adm(&hdd.id, DrbdAction::Down),
        drbd_request(DrbdOp::RemoveResourceConfig { hard_drive: hdd.id.clone() }),
        Request::Volume(VolumeOp::Delete { volume: meta_ref.clone(), ignore_missing: true }),
    ];
    for req in best_effort {
        let name = req.name();
        if let Err(e) = execute_on(node, ctx, source, req).await {
            warn!("{} on departing node {} failed: {}", name, source, e);
        }
    }
    if let Err(e) = super::handle(node, ctx, DrbdOp::Adm { hard_drive: hdd.id.clone(), action: DrbdAction::Disconnect }).await {
        debug!("disconnect before move: {}", e);
    }

    let mut moved = hdd.clone();
    for n in moved.nodes.iter_mut() {
        if n == source {
            *n = dest.to_string();
        }
    }
    run_on(node, ctx, put_hard_drive(&moved), &node.all_nodes().await).await?;

    run_on(node, ctx, Request::Volume(VolumeOp::Create { volume: raw_ref.clone(), size }), &dest_nodes).await?;
    run_on(node, ctx, Request::Volume(VolumeOp::Activate { volume: raw_ref.clone() }), &dest_nodes).await?;
    let meta_size = meta_volume_size(sectors, sector_size);
    run_on(node, ctx, Request::Volume(VolumeOp::Create { volume: meta_ref.clone(), size: meta_size }), &dest_nodes).await?;
    run_on(node, ctx, Request::Volume(VolumeOp::Activate { volume: meta_ref.clone() }), &dest_nodes).await?;
    run_on(node, ctx, Request::Volume(VolumeOp::Wipe { volume: meta_ref }), &dest_nodes).await?;

    let id = hdd.id.clone();
    run_on(node, ctx, drbd_request(DrbdOp::WriteResourceConfig { hard_drive: id.clone() }), &moved.nodes).await?;
    run_on(node, ctx, adm(&id, DrbdAction::CreateMd), &dest_nodes).await?;
    run_on(node, ctx, adm(&id, DrbdAction::Up), &dest_nodes).await?;
    run_on(node, ctx, adm(&id, DrbdAction::Secondary), &dest_nodes).await?;
    let local = [node.hostname.clone()];
    run_on(node, ctx, adm(&id, DrbdAction::Adjust), &local).await?;
    run_on(node, ctx, adm(&id, DrbdAction::OverwritePeer), &local).await?;

    let delete_raw = Request::Volume(VolumeOp::Delete { volume: raw_ref, ignore_missing: true });
    if let Err(e) = execute_on(node, ctx, source, delete_raw).await {
        warn!("could not remove old replica of {} from {}: {}", drbd.resource_name, source, e);
    }
    info!("moved {} replica from {} to {}", drbd.resource_name, source, dest);
    Ok(moved)
}

// ─── Online migration ───────────────────────────────────────────────────────

/// Check a disk can follow its VM to `dest` while running.
pub async fn check_online_migration(node: &NodeState, ctx: &CallContext, hdd: &HardDriveConfig, dest: &str) -> McvResult<()> {
    let drbd = hdd.drbd()?;
    if !hdd.nodes.iter().any(|n| n == dest) {
        return Err(McvError::InvalidArguments(format!("{} holds no replica of {}", dest, drbd.resource_name)));
    }
    status_on(node, ctx, &node.hostname, &hdd.id)
        .await?
        .check_migration_ready(&drbd.resource_name)
}

/// Let the destination become primary alongside this node.
pub async fn start_dual_primary(node: &NodeState, ctx: &CallContext, hdd: &HardDriveConfig, dest: &str) -> McvResult<()> {
    let id = hdd.id.clone();
    run_on(node, ctx, adm(&id, DrbdAction::AllowTwoPrimaries), &hdd.nodes).await?;
    Function::new(adm(&id, DrbdAction::Primary))
        .on_node(dest)
        .undo(adm(&id, DrbdAction::Secondary))
        .run(node, ctx)
        .await?;
    Ok(())
}

/// After the domain moved: demote this node and close dual-primary.
pub async fn finish_migration(node: &NodeState, ctx: &CallContext, hdd: &HardDriveConfig) -> McvResult<()> {
    let id = hdd.id.clone();
    let local = [node.hostname.clone()];
    run_on(node, ctx, adm(&id, DrbdAction::Secondary), &local).await?;
    run_on(node, ctx, drbd_request(DrbdOp::WaitSecondary { hard_drive: id.clone() }), &local).await?;
    run_on(node, ctx, adm(&id, DrbdAction::DisallowTwoPrimaries), &hdd.nodes).await?;
    Ok(())
}

/// After a failed live migration: keep the node now registered primary,
/// demote the other, close dual-primary and mark the disk out of sync.
pub async fn recover_failed_migration(
    node: &NodeState,
    ctx: &CallContext,
    hdd: &HardDriveConfig,
    registered_on: &str,
) -> McvResult<()> {
    tokio::time::sleep(node.settings.timings.migration_failure_settle).await;
    let id = hdd.id.clone();
    for other in hdd.nodes.iter().filter(|n| *n != registered_on) {
        if let Err(e) = execute_on(node, ctx, other, adm(&id, DrbdAction::Secondary)).await {
            warn!("could not demote {} on {}: {}", hdd.raw_volume(), other, e);
        }
    }
    for host in &hdd.nodes {
        if let Err(e) = execute_on(node, ctx, host, adm(&id, DrbdAction::DisallowTwoPrimaries)).await {
            warn!("could not disallow dual-primary for {} on {}: {}", hdd.raw_volume(), host, e);
        }
    }
    set_sync_state(node, ctx, &id, false).await
}

/// Delegate a replica move to the node that keeps it.
pub fn move_request(hdd: &HardDriveConfig, source: &str, dest: &str) -> Request {
    Request::HardDrive(HardDriveOp::MoveReplica {
        id: hdd.id.clone(),
        source: source.to_string(),
        dest: dest.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcvirt_core::command::CommandOutput;

    use crate::testutil::{drbd_cluster, drbd_hard_drive, TEST_BACKEND, TEST_VG};
    use crate::transaction::Transaction;

    #[tokio::test]
    async fn test_allocate_skips_used_and_listening() {
        let c = drbd_cluster(&["n1", "n2"]).await;
        let n1 = c.node("n1");
        drbd_hard_drive(n1).await;
        c.node("n2")
            .runner
            .respond("ss -Htln", CommandOutput::ok("LISTEN 0 5 10.0.0.2:7790 0.0.0.0:*\n"));
        let nodes = vec!["n1".to_string(), "n2".to_string()];
        let (port, minor) = allocate(n1, &CallContext::internal(), &nodes).await.unwrap();
        assert_eq!(port, 7791);
        assert_eq!(minor, 2);
    }

    #[tokio::test]
    async fn test_create_wipes_both_volumes_before_metadata() {
        let c = drbd_cluster(&["n1", "n2"]).await;
        let n1 = c.node("n1");
        let ctx = CallContext::internal();
        let mut vm = VmConfig::new("vm-1".into(), "vm1".into(), 1, 512 * 1024 * 1024);
        vm.available_nodes = vec!["n1".into(), "n2".into()];
        Function::new(crate::vm::put_config(&vm.id, Some(vm.clone())))
            .on(n1.all_nodes().await)
            .run_all(n1, &ctx)
            .await
            .unwrap();
        let sb = n1.config.storage_backend(TEST_BACKEND).await.unwrap();

        let tx = Transaction::begin(&ctx);
        let hdd = create(n1, &ctx, &vm, &sb, 1 << 30, DiskDriver::Virtio, 1).await.unwrap();
        tx.finish(&ctx);

        let raw_wipe = format!("dd if=/dev/zero of=/dev/{}/mcvirt_vm-vm1-disk-1-drbd-raw", TEST_VG);
        let meta_wipe = format!("dd if=/dev/zero of=/dev/{}/mcvirt_vm-vm1-disk-1-drbd-meta", TEST_VG);
        for host in ["n1", "n2"] {
            let commands = c.node(host).runner.commands();
            let position = |needle: &str| commands.iter().position(|cmd| cmd.starts_with(needle));
            let create_md = position("drbdadm -- --force create-md").unwrap();
            assert!(position(raw_wipe.as_str()).unwrap() < create_md, "raw volume not wiped on {}", host);
            assert!(position(meta_wipe.as_str()).unwrap() < create_md, "meta volume not wiped on {}", host);
        }
        assert_eq!(
            c.node("n2").config.vm(&vm.id).await.unwrap().hard_drives,
            vec![hdd.id]
        );
    }

    #[tokio::test]
    async fn test_verify_refuses_out_of_sync_disk() {
        let c = drbd_cluster(&["n1", "n2"]).await;
        let n1 = c.node("n1");
        let hdd = drbd_hard_drive(n1).await;
        let ctx = CallContext::internal();
        set_sync_state(n1, &ctx, &hdd.id, false).await.unwrap();
        assert!(!c.node("n2").config.hard_drive(&hdd.id).await.unwrap().drbd.unwrap().sync_state);

        let hdd = n1.config.hard_drive(&hdd.id).await.unwrap();
        let err = verify(n1, &ctx, &hdd).await.unwrap_err();
        assert!(matches!(err, McvError::DrbdVolumeNotInSync(_)));
        assert!(!n1.runner.ran("drbdadm verify"));

        set_sync_state(n1, &ctx, &hdd.id, true).await.unwrap();
        let hdd = n1.config.hard_drive(&hdd.id).await.unwrap();
        verify(n1, &ctx, &hdd).await.unwrap();
        assert!(n1.runner.ran("drbdadm verify mcvirt_vm-vm1-disk-1"));
    }

    #[tokio::test]
    async fn test_verify_requires_connection() {
        let c = drbd_cluster(&["n1", "n2"]).await;
        let n1 = c.node("n1");
        let hdd = drbd_hard_drive(n1).await;
        n1.runner.respond("drbdadm cstate", CommandOutput::ok("StandAlone\n"));
        let err = verify(n1, &CallContext::internal(), &hdd).await.unwrap_err();
        assert!(matches!(err, McvError::DrbdStateBad { .. }));
    }

    #[tokio::test]
    async fn test_resize_rejects_inconsistent_sizes() {
        let c = drbd_cluster(&["n1", "n2"]).await;
        let n1 = c.node("n1");
        let hdd = drbd_hard_drive(n1).await;
        c.node("n2")
            .runner
            .respond("blockdev --getsize64", CommandOutput::ok("5368709120\n"));
        let err = resize(n1, &CallContext::internal(), &hdd, 1 << 30).await.unwrap_err();
        assert!(matches!(err, McvError::InconsistentVolumeSize(_)));
        assert!(!n1.runner.ran("lvextend"));
    }

    #[tokio::test]
    async fn test_resize_rejects_inconsistent_meta_sizes() {
        let c = drbd_cluster(&["n1", "n2"]).await;
        let n1 = c.node("n1");
        let hdd = drbd_hard_drive(n1).await;
        c.node("n2").runner.respond(
            &format!("blockdev --getsize64 /dev/{}/mcvirt_vm-vm1-disk-1-drbd-meta", TEST_VG),
            CommandOutput::ok("67108864\n"),
        );
        let err = resize(n1, &CallContext::internal(), &hdd, 1 << 30).await.unwrap_err();
        match err {
            McvError::InconsistentVolumeSize(detail) => {
                assert!(detail.starts_with("mcvirt_vm-vm1-disk-1-drbd-meta"), "{}", detail)
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!n1.runner.ran("lvextend"));
        assert!(!n1.runner.ran("drbdadm disconnect"));
    }

    #[tokio::test]
    async fn test_resize_grows_both_replicas() {
        let c = drbd_cluster(&["n1", "n2"]).await;
        let n1 = c.node("n1");
        let hdd = drbd_hard_drive(n1).await;
        resize(n1, &CallContext::internal(), &hdd, 1 << 30).await.unwrap();
        for host in ["n1", "n2"] {
            let runner = &c.node(host).runner;
            assert!(runner.ran("drbdadm disconnect"));
            assert!(runner.ran("lvextend -L +1073741824B"));
            assert!(runner.ran("drbdadm resize"));
            assert!(runner.ran("drbdadm connect"));
        }
    }

    #[tokio::test]
    async fn test_activate_promotes_and_checks_device() {
        let c = drbd_cluster(&["n1", "n2"]).await;
        let n2 = c.node("n2");
        let hdd = drbd_hard_drive(c.node("n1")).await;
        n2.runner.respond("drbdadm role", CommandOutput::ok("Secondary/Primary\n"));
        activate(n2, &CallContext::internal(), &hdd).await.unwrap();
        assert!(n2.runner.ran("drbdadm primary mcvirt_vm-vm1-disk-1"));

        n2.runner.respond("test -b", CommandOutput::failed(1, ""));
        let err = activate(n2, &CallContext::internal(), &hdd).await.unwrap_err();
        assert_eq!(err, McvError::DrbdBlockDeviceMissing("/dev/drbd1".into()));
    }

    #[tokio::test]
    async fn test_activate_state_gate() {
        let c = drbd_cluster(&["n1", "n2"]).await;
        let n1 = c.node("n1");
        let hdd = drbd_hard_drive(n1).await;

        n1.runner.respond("drbdadm cstate", CommandOutput::ok("StandAlone\n"));
        let err = activate(n1, &CallContext::internal(), &hdd).await.unwrap_err();
        assert!(matches!(err, McvError::DrbdStateWarning { .. }));

        let mut ignoring = CallContext::internal();
        ignoring.ignore_drbd = true;
        activate(n1, &ignoring, &hdd).await.unwrap();

        n1.runner.respond("drbdadm cstate", CommandOutput::ok("Connected\n"));
        n1.runner.respond("drbdadm dstate", CommandOutput::ok("Diskless/UpToDate\n"));
        let err = activate(n1, &ignoring, &hdd).await.unwrap_err();
        assert!(matches!(err, McvError::DrbdStateBad { .. }));
    }

    #[tokio::test]
    async fn test_failed_migration_recovery() {
        let c = drbd_cluster(&["n1", "n2"]).await;
        let n1 = c.node("n1");
        let hdd = drbd_hard_drive(n1).await;
        recover_failed_migration(n1, &CallContext::internal(), &hdd, "n2").await.unwrap();
        assert!(n1.runner.ran("drbdadm secondary"));
        assert!(!c.node("n2").runner.ran("drbdadm secondary"));
        assert!(c.node("n2").runner.ran("drbdadm net-options --allow-two-primaries=no"));
        let after = c.node("n2").config.hard_drive(&hdd.id).await.unwrap();
        assert!(!after.drbd.unwrap().sync_state);
    }
}
