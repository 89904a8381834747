//! Moving VMs between nodes.
//!
//! Offline migration re-registers a stopped VM on another node. Online
//! migration hands a running domain over through libvirt while both DRBD
//! replicas are primary. Moving storage relocates one DRBD replica.

use tracing::{info, warn};

use mcvirt_proto::hard_drive::{HardDriveConfig, HardDriveType};
use mcvirt_proto::request::{NetworkOp, VmOp};
use mcvirt_proto::vm::{PowerState, VmConfig, VmConfigChange};
use mcvirt_proto::{McvError, McvResult, Request};

use super::{node_path_exists, power_state, register, unregister, update};
use crate::context::CallContext;
use crate::daemon::NodeState;
use crate::drbd::{engine, status_on};
use crate::hard_drive;
use crate::transaction::{execute_on, Function, Transaction};

async fn ensure_destination(node: &NodeState, vm: &VmConfig, dest: &str) -> McvResult<()> {
    node.ensure_cluster_node(dest).await?;
    if vm.is_registered_on(dest) {
        return Err(McvError::VmAlreadyRegistered(vm.name.clone()));
    }
    if !vm.available_nodes.iter().any(|n| n == dest) {
        return Err(McvError::UnsuitableNode {
            vm: vm.name.clone(),
            node: dest.to_string(),
        });
    }
    Ok(())
}

/// Every network the VM is attached to must have its interface on `dest`.
async fn check_networks(node: &NodeState, ctx: &CallContext, vm: &VmConfig, dest: &str) -> McvResult<()> {
    let networks = node.config.global.get().await.networks;
    for adapter in &vm.network_adapters {
        let interface = networks
            .get(&adapter.network)
            .ok_or_else(|| McvError::NetworkDoesNotExist(adapter.network.clone()))?;
        let req = Request::Network(NetworkOp::CheckInterface {
            interface: interface.clone(),
        });
        execute_on(node, ctx, dest, req).await?;
    }
    Ok(())
}

async fn drbd_disks(node: &NodeState, vm: &VmConfig) -> McvResult<Vec<HardDriveConfig>> {
    Ok(hard_drive::disks_of(node, vm)
        .await?
        .into_iter()
        .filter(|hdd| hdd.disk_type == HardDriveType::Drbd)
        .collect())
}

async fn wait_until_stopped(node: &NodeState, ctx: &CallContext, vm: &VmConfig) -> McvResult<()> {
    let timings = &node.settings.timings;
    for _ in 0..timings.attempts(timings.shutdown_wait) {
        if power_state(node, ctx, vm).await? != PowerState::Running {
            return Ok(());
        }
        tokio::time::sleep(timings.poll_interval).await;
    }
    Err(McvError::VmAlreadyStarted(vm.name.clone()))
}

/// Re-register a stopped VM on `dest`, optionally starting it there.
pub async fn offline(
    node: &NodeState,
    ctx: &CallContext,
    vm: &VmConfig,
    dest: &str,
    start: bool,
    wait_for_shutdown: bool,
) -> McvResult<()> {
    ensure_destination(node, vm, dest).await?;
    if power_state(node, ctx, vm).await? == PowerState::Running {
        if !wait_for_shutdown {
            return Err(McvError::VmAlreadyStarted(vm.name.clone()));
        }
        info!("waiting for {} to shut down", vm.name);
        wait_until_stopped(node, ctx, vm).await?;
    }
    for hdd in drbd_disks(node, vm).await? {
        let resource = &hdd.drbd()?.resource_name;
        let status = status_on(node, ctx, &node.hostname, &hdd.id).await?;
        // ignore_drbd only lets a WARNING state through, never a BAD one.
        status.check(resource, ctx.ignore_drbd)?;
        if !ctx.ignore_drbd {
            status.check_migration_ready(resource)?;
        }
    }
    check_networks(node, ctx, vm, dest).await?;

    let tx = Transaction::begin(ctx);
    let result = async {
        if vm.node.is_some() {
            unregister(node, ctx, vm).await?;
        }
        let vm = node.config.vm(&vm.id).await?;
        register(node, ctx, &vm, dest).await
    }
    .await;
    tx.settle(node, ctx, result).await?;
    info!("migrated {} to {}", vm.name, dest);

    if start {
        let req = Request::Vm(VmOp::Start {
            name: vm.name.clone(),
            iso: None,
        });
        execute_on(node, ctx, dest, req).await?;
    }
    Ok(())
}

/// Node the domain of `vm` is defined on after a failed live migration.
async fn locate_domain(node: &NodeState, ctx: &CallContext, vm: &VmConfig, dest: &str) -> String {
    match node.hypervisor.is_defined(&vm.name).await {
        Ok(true) => return node.hostname.clone(),
        Ok(false) => {}
        Err(e) => warn!("could not query domain {} locally: {}", vm.name, e),
    }
    let req = Request::Vm(VmOp::PowerState { id: vm.id.clone() });
    match execute_on(node, ctx, dest, req).await.and_then(|o| o.reply.into_power_state()) {
        Ok(PowerState::Unknown) | Err(_) => node.hostname.clone(),
        Ok(_) => dest.to_string(),
    }
}

/// Live-migrate a running VM to `dest`.
pub async fn online(node: &NodeState, ctx: &CallContext, vm: &VmConfig, dest: &str) -> McvResult<()> {
    ensure_destination(node, vm, dest).await?;
    if !node.hypervisor.is_running(&vm.name).await? {
        return Err(McvError::VmAlreadyStopped(vm.name.clone()));
    }
    let disks = hard_drive::disks_of(node, vm).await?;
    for hdd in &disks {
        if hdd.disk_type == HardDriveType::Local {
            let sb = node.config.storage_backend(&hdd.storage_backend).await?;
            if !sb.shared || !sb.is_available_on(dest) {
                return Err(McvError::UnsuitableNode {
                    vm: vm.name.clone(),
                    node: dest.to_string(),
                });
            }
        }
    }
    if let Some(iso) = &vm.iso {
        if !node_path_exists(node, ctx, dest, iso).await? {
            return Err(McvError::IsoNotPresentOnDestination(iso.clone()));
        }
    }
    check_networks(node, ctx, vm, dest).await?;
    let drbd: Vec<HardDriveConfig> = disks.into_iter().filter(|hdd| hdd.drbd.is_some()).collect();
    for hdd in &drbd {
        engine::check_online_migration(node, ctx, hdd, dest).await?;
    }

    // The destination needs the domain's disks active before the handover.
    let tx = Transaction::begin(ctx);
    let result = async {
        for hdd in &drbd {
            engine::start_dual_primary(node, ctx, hdd, dest).await?;
        }
        Ok::<_, McvError>(())
    }
    .await;
    tx.settle(node, ctx, result).await?;

    if let Err(e) = node.hypervisor.migrate(&vm.name, dest).await {
        warn!("live migration of {} to {} failed: {}", vm.name, dest, e);
        let registered_on = locate_domain(node, ctx, vm, dest).await;
        if registered_on != node.hostname {
            if let Err(e) = update(
                node,
                ctx,
                vm,
                VmConfigChange::SetNode(Some(registered_on.clone())),
                "domain moved during failed migration",
            )
            .await
            {
                warn!("could not record {} as registered on {}: {}", vm.name, registered_on, e);
            }
        }
        for hdd in &drbd {
            if let Err(e) = engine::recover_failed_migration(node, ctx, hdd, &registered_on).await {
                warn!("could not recover {} after failed migration: {}", hdd.raw_volume(), e);
            }
        }
        return Err(e);
    }

    for hdd in &drbd {
        engine::finish_migration(node, ctx, hdd).await?;
    }
    update(
        node,
        ctx,
        vm,
        VmConfigChange::SetNode(Some(dest.to_string())),
        &format!("live migrated to {}", dest),
    )
    .await?;
    Function::new(Request::Vm(VmOp::UpdateConfig {
        id: vm.id.clone(),
        change: VmConfigChange::MarkApplied,
        reason: format!("{}: domain defined by migration", vm.name),
    }))
    .on_node(dest)
    .run(node, ctx)
    .await?;
    info!("live migrated {} to {}", vm.name, dest);
    Ok(())
}

/// Move the DRBD replica of every disk of `vm` from `source` to `dest`.
pub async fn move_storage(
    node: &NodeState,
    ctx: &CallContext,
    vm: &VmConfig,
    source: &str,
    dest: &str,
) -> McvResult<()> {
    let disks = hard_drive::disks_of(node, vm).await?;
    if disks.is_empty() || disks.iter().any(|hdd| hdd.disk_type != HardDriveType::Drbd) {
        return Err(McvError::InvalidArguments(format!(
            "only DRBD-backed VMs can be moved; {} has other disks",
            vm.name
        )));
    }
    if vm.is_registered_on(source) {
        return Err(McvError::VmRegisteredElsewhere {
            vm: vm.name.clone(),
            node: source.to_string(),
        });
    }
    node.ensure_cluster_node(dest).await?;
    if vm.available_nodes.iter().any(|n| n == dest) {
        return Err(McvError::InvalidArguments(format!("{} can already run on {}", vm.name, dest)));
    }

    let tx = Transaction::begin(ctx);
    let result = async {
        for hdd in &disks {
            let keeper = hdd
                .nodes
                .iter()
                .find(|n| *n != source)
                .cloned()
                .ok_or_else(|| McvError::InvalidArguments(format!("{} has no remaining replica", hdd.raw_volume())))?;
            Function::new(engine::move_request(hdd, source, dest))
                .on_node(&keeper)
                .run(node, ctx)
                .await?;
        }
        let nodes: Vec<String> = vm
            .available_nodes
            .iter()
            .filter(|n| *n != source)
            .cloned()
            .chain(std::iter::once(dest.to_string()))
            .collect();
        update(node, ctx, vm, VmConfigChange::SetAvailableNodes(nodes), &format!("moved from {} to {}", source, dest))
            .await
    }
    .await;
    tx.settle(node, ctx, result).await?;
    info!("moved storage of {} from {} to {}", vm.name, source, dest);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcvirt_core::command::CommandOutput;

    use crate::testutil::{cluster, drbd_cluster, drbd_hard_drive, TestCluster};
    use crate::vm::handle;

    async fn registered_vm(c: &TestCluster) -> VmConfig {
        let n1 = c.node("n1");
        let ctx = CallContext::internal();
        let hdd = drbd_hard_drive(n1).await;
        let mut vm = VmConfig::new("vm1".into(), "vm1".into(), 1, 512 * 1024 * 1024);
        vm.available_nodes = vec!["n1".into(), "n2".into()];
        vm.hard_drives = vec![hdd.id.clone()];
        vm.uuid = Some("5f0e7c1a-1111-4222-8333-444455556666".into());
        vm.node = Some("n1".into());
        Function::new(super::super::put_config(&vm.id, Some(vm.clone())))
            .on(n1.all_nodes().await)
            .run_all(n1, &ctx)
            .await
            .unwrap();
        n1.hypervisor.define("vm1", "<domain/>").await.unwrap();
        vm
    }

    #[tokio::test]
    async fn test_offline_migration_moves_registration() {
        let c = drbd_cluster(&["n1", "n2"]).await;
        let vm = registered_vm(&c).await;
        let ctx = CallContext::internal();
        let n1 = c.node("n1");

        offline(n1, &ctx, &vm, "n2", false, false).await.unwrap();
        let on_n2 = c.node("n2").config.vm("vm1").await.unwrap();
        assert_eq!(on_n2.node.as_deref(), Some("n2"));
        assert_eq!(n1.config.vm("vm1").await.unwrap().node.as_deref(), Some("n2"));
        assert!(!n1.hypervisor.is_defined("vm1").await.unwrap());
        assert!(c.node("n2").hypervisor.is_defined("vm1").await.unwrap());
    }

    #[tokio::test]
    async fn test_offline_migration_refuses_bad_drbd_state() {
        let c = drbd_cluster(&["n1", "n2"]).await;
        let vm = registered_vm(&c).await;
        let n1 = c.node("n1");
        n1.runner.respond("drbdadm dstate", CommandOutput::ok("Diskless/UpToDate\n"));
        let mut ctx = CallContext::internal();
        ctx.ignore_drbd = true;

        let err = offline(n1, &ctx, &vm, "n2", false, false).await.unwrap_err();
        assert!(matches!(err, McvError::DrbdStateBad { .. }));
        assert_eq!(n1.config.vm("vm1").await.unwrap().node.as_deref(), Some("n1"));

        n1.runner.respond("drbdadm dstate", CommandOutput::ok("UpToDate/DUnknown\n"));
        offline(n1, &ctx, &vm, "n2", false, false).await.unwrap();
        assert_eq!(n1.config.vm("vm1").await.unwrap().node.as_deref(), Some("n2"));
    }

    #[tokio::test]
    async fn test_offline_migration_refuses_running_vm() {
        let c = drbd_cluster(&["n1", "n2"]).await;
        let vm = registered_vm(&c).await;
        let n1 = c.node("n1");
        n1.hypervisor.start("vm1").await.unwrap();
        let err = offline(n1, &CallContext::internal(), &vm, "n2", false, false)
            .await
            .unwrap_err();
        assert_eq!(err, McvError::VmAlreadyStarted("vm1".into()));

        let err = offline(n1, &CallContext::internal(), &vm, "n2", false, true)
            .await
            .unwrap_err();
        assert_eq!(err, McvError::VmAlreadyStarted("vm1".into()));
        assert!(n1.hypervisor.is_running("vm1").await.unwrap());
        assert_eq!(n1.config.vm("vm1").await.unwrap().node.as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn test_failed_live_migration_leaves_vm_on_source() {
        let c = drbd_cluster(&["n1", "n2"]).await;
        let vm = registered_vm(&c).await;
        let n1 = c.node("n1");
        n1.hypervisor.start("vm1").await.unwrap();
        n1.hypervisor_fake().fail_migration("connection reset");

        let err = online(n1, &CallContext::internal(), &vm, "n2").await.unwrap_err();
        assert!(matches!(err, McvError::LibvirtError(_)));
        assert_eq!(n1.config.vm("vm1").await.unwrap().node.as_deref(), Some("n1"));
        let hdd = n1.config.hard_drive(&vm.hard_drives[0]).await.unwrap();
        assert!(!hdd.drbd.unwrap().sync_state);
        assert!(c.node("n2").runner.ran("drbdadm secondary mcvirt_vm-vm1-disk-1"));
    }

    #[tokio::test]
    async fn test_migrate_request_checks_available_nodes() {
        let c = cluster(&["n1", "n2", "n3"]).await;
        let n1 = c.node("n1");
        let ctx = CallContext::internal();
        let mut vm = VmConfig::new("vm-a".into(), "a".into(), 1, 1 << 20);
        vm.available_nodes = vec!["n1".into()];
        vm.uuid = Some("5f0e7c1a-1111-4222-8333-444455556666".into());
        vm.node = Some("n1".into());
        Function::new(super::super::put_config(&vm.id, Some(vm.clone())))
            .on(n1.all_nodes().await)
            .run_all(n1, &ctx)
            .await
            .unwrap();
        let req = VmOp::Migrate {
            name: "a".into(),
            node: "n3".into(),
            online: false,
            start: false,
            wait_for_shutdown: false,
        };
        let err = handle(n1, &ctx, req).await.unwrap_err();
        assert_eq!(
            err,
            McvError::UnsuitableNode {
                vm: "a".into(),
                node: "n3".into()
            }
        );
    }
}
