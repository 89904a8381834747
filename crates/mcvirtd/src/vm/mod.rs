//! Virtual machines.
//!
//! A VM's config is replicated to every node; exactly one node (or none)
//! has it registered, meaning its libvirt domain is defined there and its
//! disks are active there. Every change to the config goes through
//! `UpdateConfig` on all nodes so it can be compensated.

pub mod clone;
pub mod migration;

use rand::Rng;
use tracing::{debug, info};

use mcvirt_proto::auth::Permission;
use mcvirt_proto::constants::{MAC_PREFIX, VM_ID_PREFIX};
use mcvirt_proto::hard_drive::HardDriveType;
use mcvirt_proto::id::generate_id;
use mcvirt_proto::request::{NodeOp, VmOp, VolumeOp, VolumeRef};
use mcvirt_proto::vm::{LockState, NetworkAdapter, PowerState, VmConfig, VmConfigChange, VmInfo};
use mcvirt_proto::{McvError, McvResult, Outcome, Reply, Request};

use crate::context::CallContext;
use crate::daemon::NodeState;
use crate::hard_drive::{self, local};
use crate::libvirt::domain_xml;
use crate::storage;
use crate::transaction::{execute_on, Function, Transaction};

pub(crate) fn put_config(id: &str, config: Option<VmConfig>) -> Request {
    Request::Vm(VmOp::PutConfig {
        id: id.to_string(),
        config,
    })
}

/// Apply one change to `vm` on every node.
pub async fn update(
    node: &NodeState,
    ctx: &CallContext,
    vm: &VmConfig,
    change: VmConfigChange,
    reason: &str,
) -> McvResult<()> {
    Function::new(Request::Vm(VmOp::UpdateConfig {
        id: vm.id.clone(),
        change,
        reason: format!("{}: {}", vm.name, reason),
    }))
    .on(node.all_nodes().await)
    .run_all(node, ctx)
    .await?;
    Ok(())
}

pub(crate) fn validate_name(name: &str) -> McvResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(McvError::InvalidArguments(format!("invalid VM name '{}'", name)))
    }
}

pub(crate) async fn ensure_name_free(node: &NodeState, name: &str) -> McvResult<()> {
    validate_name(name)?;
    if node.config.vm_by_name(name).await.is_ok() {
        return Err(McvError::VmAlreadyExists(name.to_string()));
    }
    Ok(())
}

/// MAC address in the locally administered range not used by any VM.
pub(crate) async fn generate_mac(node: &NodeState) -> String {
    let used: Vec<String> = node
        .config
        .vms
        .list()
        .await
        .into_iter()
        .flat_map(|vm| vm.network_adapters.into_iter().map(|a| a.mac_address))
        .collect();
    let mut rng = rand::thread_rng();
    loop {
        let suffix: [u8; 3] = rng.gen();
        let mac = MAC_PREFIX
            .iter()
            .chain(suffix.iter())
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":");
        if !used.contains(&mac) {
            return mac;
        }
    }
}

pub(crate) async fn ensure_network(node: &NodeState, network: &str) -> McvResult<()> {
    if node.config.global.get().await.networks.contains_key(network) {
        Ok(())
    } else {
        Err(McvError::NetworkDoesNotExist(network.to_string()))
    }
}

/// Nodes a new VM may run on. Without an explicit list this follows the
/// storage its disks will use: both replicas for DRBD, every member of a
/// shared backend, otherwise only this node.
async fn placement(
    node: &NodeState,
    storage_type: Option<HardDriveType>,
    backend: Option<&str>,
    requested: Option<Vec<String>>,
) -> McvResult<Vec<String>> {
    let local = [node.hostname.clone()];
    if let Some(mut nodes) = requested {
        nodes.dedup();
        if nodes.is_empty() {
            return Err(McvError::InvalidArguments("available node list is empty".into()));
        }
        for n in &nodes {
            node.ensure_cluster_node(n).await?;
        }
        return Ok(nodes);
    }
    match storage_type {
        Some(HardDriveType::Drbd) => {
            let sb = storage::select_backend(node, backend, &local).await?;
            let mut nodes = local.to_vec();
            for member in sb.node_names() {
                if !node.is_local(&member) && node.is_cluster_node(&member).await {
                    nodes.push(member);
                    return Ok(nodes);
                }
            }
            Err(McvError::InvalidArguments(format!(
                "storage backend {} has no second node for DRBD",
                sb.name
            )))
        }
        _ => match storage::select_backend(node, backend, &local).await {
            Ok(sb) if sb.shared => {
                let mut nodes = Vec::new();
                for member in sb.node_names() {
                    if node.is_cluster_node(&member).await {
                        nodes.push(member);
                    }
                }
                Ok(nodes)
            }
            Ok(_) => Ok(local.to_vec()),
            Err(e) if backend.is_some() => Err(e),
            Err(_) => Ok(local.to_vec()),
        },
    }
}

/// Power state of a VM as seen from the cluster.
pub async fn power_state(node: &NodeState, ctx: &CallContext, vm: &VmConfig) -> McvResult<PowerState> {
    let Some(host) = &vm.node else {
        return Ok(PowerState::Unknown);
    };
    let state = execute_on(node, ctx, host, Request::Vm(VmOp::PowerState { id: vm.id.clone() }))
        .await?
        .reply
        .into_power_state()?;
    Ok(match state {
        PowerState::Running => PowerState::Running,
        _ => PowerState::Stopped,
    })
}

/// Define `vm` on `target` and record it as registered there.
pub async fn register(node: &NodeState, ctx: &CallContext, vm: &VmConfig, target: &str) -> McvResult<()> {
    if vm.uuid.is_none() {
        let uuid = uuid::Uuid::new_v4().to_string();
        update(node, ctx, vm, VmConfigChange::SetUuid(uuid), "assign domain UUID").await?;
    }
    Function::new(Request::Vm(VmOp::DefineLocal { id: vm.id.clone() }))
        .on_node(target)
        .run(node, ctx)
        .await?;
    update(
        node,
        ctx,
        vm,
        VmConfigChange::SetNode(Some(target.to_string())),
        &format!("register on {}", target),
    )
    .await?;
    info!("{} registered on {}", vm.name, target);
    Ok(())
}

/// Undefine `vm` from the node it is registered on.
pub async fn unregister(node: &NodeState, ctx: &CallContext, vm: &VmConfig) -> McvResult<()> {
    let Some(host) = vm.node.clone() else {
        return Err(McvError::VmNotRegistered(vm.name.clone()));
    };
    Function::new(Request::Vm(VmOp::UndefineLocal { id: vm.id.clone() }))
        .on_node(&host)
        .run(node, ctx)
        .await?;
    update(node, ctx, vm, VmConfigChange::SetNode(None), &format!("unregister from {}", host)).await?;
    info!("{} unregistered from {}", vm.name, host);
    Ok(())
}

/// Activate the disks of `vm` here and (re)define its domain.
async fn define_local(node: &NodeState, ctx: &CallContext, vm: &VmConfig) -> McvResult<()> {
    let uuid = vm
        .uuid
        .clone()
        .ok_or_else(|| McvError::Config(format!("{} has no domain UUID", vm.name)))?;
    let mut devices = Vec::with_capacity(vm.hard_drives.len());
    for hdd in hard_drive::disks_of(node, vm).await? {
        hard_drive::activate(node, ctx, &hdd).await?;
        devices.push(hard_drive::disk_device(node, &hdd).await?);
    }
    let xml = domain_xml(vm, &uuid, &devices, vm.iso.as_deref())?;
    node.hypervisor.define(&vm.name, &xml).await?;
    node.config
        .vms
        .update(&ctx.user, &format!("{}: domain defined", vm.name), &vm.id, |cfg| {
            cfg.apply(&VmConfigChange::MarkApplied)
        })
        .await?;
    Ok(())
}

async fn undefine_local(node: &NodeState, ctx: &CallContext, vm: &VmConfig) -> McvResult<()> {
    if node.hypervisor.is_running(&vm.name).await? {
        return Err(McvError::VmAlreadyStarted(vm.name.clone()));
    }
    node.hypervisor.undefine(&vm.name).await?;
    for hdd in hard_drive::disks_of(node, vm).await? {
        hard_drive::deactivate(node, ctx, &hdd).await?;
    }
    Ok(())
}

/// Where a power request for `vm` has to run. `None` means here.
fn remote_host(node: &NodeState, vm: &VmConfig) -> McvResult<Option<String>> {
    match &vm.node {
        None => Err(McvError::VmNotRegistered(vm.name.clone())),
        Some(host) if node.is_local(host) => Ok(None),
        Some(host) => Ok(Some(host.clone())),
    }
}

async fn vm_info(node: &NodeState, ctx: &CallContext, vm: VmConfig) -> McvResult<VmInfo> {
    let power_state = match power_state(node, ctx, &vm).await {
        Ok(state) => state,
        Err(e) if e.is_connectivity() => PowerState::Unknown,
        Err(e) => return Err(e),
    };
    Ok(VmInfo {
        id: vm.id,
        name: vm.name,
        power_state,
        lock: vm.lock,
        node: vm.node,
        available_nodes: vm.available_nodes,
        cpu_cores: vm.cpu_cores,
        memory: vm.memory,
        hard_drives: vm.hard_drives,
        network_adapters: vm.network_adapters,
        delete_protection: vm.delete_protection,
        modifications: vm.modifications.into_iter().collect(),
        clone_parent: vm.clone_parent,
        clone_children: vm.clone_children,
    })
}

fn backup_volume(hdd: &mcvirt_proto::hard_drive::HardDriveConfig) -> VolumeRef {
    VolumeRef::new(&hdd.storage_backend, &format!("{}-snapshot", hdd.raw_volume()))
}

pub async fn handle(node: &NodeState, ctx: &CallContext, op: VmOp) -> McvResult<Outcome> {
    match op {
        VmOp::Create {
            name,
            cpu_cores,
            memory,
            disks,
            networks,
            storage_type,
            backend,
            driver,
            available_nodes,
            graphics,
        } => {
            ctx.assert_permission(Permission::CreateVm)?;
            ensure_name_free(node, &name).await?;
            if cpu_cores == 0 || memory == 0 {
                return Err(McvError::InvalidArguments("CPU cores and memory must be non-zero".into()));
            }
            for network in &networks {
                ensure_network(node, network).await?;
            }
            let nodes = placement(node, storage_type, backend.as_deref(), available_nodes).await?;

            let mut vm = VmConfig::new(generate_id(VM_ID_PREFIX, &name), name, cpu_cores, memory);
            vm.graphics_driver = graphics;
            vm.available_nodes = nodes;
            for network in networks {
                vm.network_adapters.push(NetworkAdapter {
                    mac_address: generate_mac(node).await,
                    network,
                });
            }

            let tx = Transaction::begin(ctx);
            let result = async {
                Function::new(put_config(&vm.id, Some(vm.clone())))
                    .on(node.all_nodes().await)
                    .run_all(node, ctx)
                    .await?;
                for size in disks {
                    hard_drive::create_disk(node, ctx, &vm, size, storage_type, backend.as_deref(), driver).await?;
                }
                Ok::<_, McvError>(())
            }
            .await;
            tx.settle(node, ctx, result).await?;
            info!("created VM {} ({})", vm.name, vm.id);
            Ok(Outcome::reply(Reply::Text(vm.id)))
        }

        VmOp::Delete {
            name,
            keep_disks,
            keep_config,
        } => {
            ctx.assert_permission(Permission::DeleteVm)?;
            let vm = node.config.vm_by_name(&name).await?;
            if vm.delete_protection {
                return Err(McvError::DeleteProtectionEnabled(vm.name));
            }
            if !vm.clone_children.is_empty() {
                return Err(McvError::CannotDeleteClonedVm(vm.name));
            }
            if power_state(node, ctx, &vm).await? == PowerState::Running {
                return Err(McvError::VmAlreadyStarted(vm.name));
            }
            vm.ensure_unlocked()?;

            let tx = Transaction::begin(ctx);
            let result = async {
                if vm.node.is_some() {
                    unregister(node, ctx, &vm).await?;
                }
                let vm = node.config.vm(&vm.id).await?;
                for hdd in hard_drive::disks_of(node, &vm).await? {
                    hard_drive::delete_disk(node, ctx, &vm, &hdd, keep_disks).await?;
                }
                if let Some(parent_id) = &vm.clone_parent {
                    if let Ok(parent) = node.config.vm(parent_id).await {
                        update(
                            node,
                            ctx,
                            &parent,
                            VmConfigChange::RemoveCloneChild(vm.id.clone()),
                            &format!("clone {} deleted", vm.name),
                        )
                        .await?;
                    }
                }
                let remove = if keep_config {
                    Request::Vm(VmOp::ForgetConfig { id: vm.id.clone() })
                } else {
                    put_config(&vm.id, None)
                };
                Function::new(remove).on(node.all_nodes().await).run_all(node, ctx).await?;
                Ok::<_, McvError>(())
            }
            .await;
            tx.settle(node, ctx, result).await?;
            info!("deleted VM {}", name);
            Ok(Outcome::unit())
        }

        VmOp::Start { name, iso } => {
            ctx.assert_permission(Permission::ChangeVmPowerState)?;
            let vm = node.config.vm_by_name(&name).await?;
            vm.ensure_unlocked()?;
            if let Some(host) = remote_host(node, &vm)? {
                return execute_on(node, ctx, &host, Request::Vm(VmOp::Start { name, iso })).await;
            }
            if !vm.clone_children.is_empty() {
                return Err(McvError::VmHasCloneChildren(vm.name));
            }
            if node.hypervisor.is_running(&vm.name).await? {
                return Err(McvError::VmAlreadyStarted(vm.name));
            }
            if let Some(path) = &iso {
                let exists = node_path_exists(node, ctx, &node.hostname, path).await?;
                if !exists {
                    return Err(McvError::InvalidArguments(format!("ISO {} does not exist", path)));
                }
            }
            if vm.iso != iso {
                update(node, ctx, &vm, VmConfigChange::SetIso(iso), "set ISO").await?;
            }
            let vm = node.config.vm(&vm.id).await?;
            define_local(node, ctx, &vm).await?;
            node.hypervisor.start(&vm.name).await?;
            info!("started {}", vm.name);
            Ok(Outcome::unit())
        }

        VmOp::Stop { name } => {
            ctx.assert_permission(Permission::ChangeVmPowerState)?;
            let vm = node.config.vm_by_name(&name).await?;
            vm.ensure_unlocked()?;
            if let Some(host) = remote_host(node, &vm)? {
                return execute_on(node, ctx, &host, Request::Vm(VmOp::Stop { name })).await;
            }
            if !node.hypervisor.is_running(&vm.name).await? {
                return Err(McvError::VmAlreadyStopped(vm.name));
            }
            node.hypervisor.destroy(&vm.name).await?;
            info!("stopped {}", vm.name);
            Ok(Outcome::unit())
        }

        VmOp::Shutdown { name } => {
            ctx.assert_permission(Permission::ChangeVmPowerState)?;
            let vm = node.config.vm_by_name(&name).await?;
            vm.ensure_unlocked()?;
            if let Some(host) = remote_host(node, &vm)? {
                return execute_on(node, ctx, &host, Request::Vm(VmOp::Shutdown { name })).await;
            }
            if !node.hypervisor.is_running(&vm.name).await? {
                return Err(McvError::VmAlreadyStopped(vm.name));
            }
            node.hypervisor.shutdown(&vm.name).await?;
            Ok(Outcome::unit())
        }

        VmOp::Reset { name } => {
            ctx.assert_permission(Permission::ChangeVmPowerState)?;
            let vm = node.config.vm_by_name(&name).await?;
            vm.ensure_unlocked()?;
            if let Some(host) = remote_host(node, &vm)? {
                return execute_on(node, ctx, &host, Request::Vm(VmOp::Reset { name })).await;
            }
            if !node.hypervisor.is_running(&vm.name).await? {
                return Err(McvError::VmAlreadyStopped(vm.name));
            }
            node.hypervisor.reset(&vm.name).await?;
            Ok(Outcome::unit())
        }

        VmOp::Register { name, node: target } => {
            ctx.assert_permission(Permission::ModifyVm)?;
            let vm = node.config.vm_by_name(&name).await?;
            vm.ensure_unlocked()?;
            let target = target.unwrap_or_else(|| node.hostname.clone());
            match &vm.node {
                Some(current) if *current == target => return Err(McvError::VmAlreadyRegistered(vm.name)),
                Some(current) => {
                    return Err(McvError::VmRegisteredElsewhere {
                        vm: vm.name.clone(),
                        node: current.clone(),
                    })
                }
                None => {}
            }
            if !vm.available_nodes.contains(&target) {
                return Err(McvError::UnsuitableNode { vm: vm.name, node: target });
            }
            let tx = Transaction::begin(ctx);
            let result = register(node, ctx, &vm, &target).await;
            tx.settle(node, ctx, result).await?;
            Ok(Outcome::unit())
        }

        VmOp::Unregister { name } => {
            ctx.assert_permission(Permission::ModifyVm)?;
            let vm = node.config.vm_by_name(&name).await?;
            vm.ensure_unlocked()?;
            if power_state(node, ctx, &vm).await? == PowerState::Running {
                return Err(McvError::VmAlreadyStarted(vm.name));
            }
            let tx = Transaction::begin(ctx);
            let result = unregister(node, ctx, &vm).await;
            tx.settle(node, ctx, result).await?;
            Ok(Outcome::unit())
        }

        VmOp::SetLock { name, lock } => {
            ctx.assert_permission(Permission::SetVmLock)?;
            let vm = node.config.vm_by_name(&name).await?;
            if vm.lock == lock {
                return Err(McvError::VmLocked(format!("{} is already {}", vm.name, lock)));
            }
            update(node, ctx, &vm, VmConfigChange::SetLock(lock), &format!("set lock {}", lock)).await?;
            Ok(Outcome::unit())
        }

        VmOp::SetDeleteProtection { name, enabled, confirm } => {
            ctx.assert_permission(Permission::ModifyVm)?;
            let vm = node.config.vm_by_name(&name).await?;
            match (enabled, vm.delete_protection) {
                (true, true) => {
                    return Err(McvError::DeleteProtectionState(format!("already enabled for {}", vm.name)))
                }
                (false, false) => {
                    return Err(McvError::DeleteProtectionState(format!("not enabled for {}", vm.name)))
                }
                (false, true) => {
                    let expected: String = vm.name.chars().rev().collect();
                    if confirm.as_deref() != Some(expected.as_str()) {
                        return Err(McvError::InvalidConfirmationCode);
                    }
                }
                (true, false) => {}
            }
            let reason = if enabled { "enable delete protection" } else { "disable delete protection" };
            update(node, ctx, &vm, VmConfigChange::SetDeleteProtection(enabled), reason).await?;
            Ok(Outcome::unit())
        }

        VmOp::Migrate {
            name,
            node: dest,
            online,
            start,
            wait_for_shutdown,
        } => {
            ctx.assert_permission(Permission::MigrateVm)?;
            let vm = node.config.vm_by_name(&name).await?;
            vm.ensure_unlocked()?;
            if let Some(host) = remote_host(node, &vm)? {
                let req = Request::Vm(VmOp::Migrate {
                    name,
                    node: dest,
                    online,
                    start,
                    wait_for_shutdown,
                });
                return execute_on(node, ctx, &host, req).await;
            }
            if online {
                migration::online(node, ctx, &vm, &dest).await?;
            } else {
                migration::offline(node, ctx, &vm, &dest, start, wait_for_shutdown).await?;
            }
            Ok(Outcome::unit())
        }

        VmOp::Move { name, source, dest } => {
            ctx.assert_permission(Permission::MigrateVm)?;
            let vm = node.config.vm_by_name(&name).await?;
            vm.ensure_unlocked()?;
            migration::move_storage(node, ctx, &vm, &source, &dest).await?;
            Ok(Outcome::unit())
        }

        VmOp::Clone { name, new_name } => {
            ctx.assert_permission(Permission::CreateVm)?;
            let parent = node.config.vm_by_name(&name).await?;
            let id = clone::clone_vm(node, ctx, &parent, &new_name).await?;
            Ok(Outcome::reply(Reply::Text(id)))
        }

        VmOp::Duplicate { name, new_name, backend } => {
            ctx.assert_permission(Permission::CreateVm)?;
            let source = node.config.vm_by_name(&name).await?;
            let id = clone::duplicate_vm(node, ctx, &source, &new_name, backend.as_deref()).await?;
            Ok(Outcome::reply(Reply::Text(id)))
        }

        VmOp::Update {
            name,
            cpu_cores,
            memory,
            add_flags,
            remove_flags,
            add_network,
            remove_network,
        } => {
            ctx.assert_permission(Permission::ModifyVm)?;
            let vm = node.config.vm_by_name(&name).await?;
            vm.ensure_unlocked()?;
            if (cpu_cores.is_some() || memory.is_some()) && power_state(node, ctx, &vm).await? == PowerState::Running {
                return Err(McvError::VmAlreadyStarted(vm.name));
            }
            let mut changes = Vec::new();
            if let Some(cores) = cpu_cores {
                if cores == 0 {
                    return Err(McvError::InvalidArguments("CPU cores must be non-zero".into()));
                }
                changes.push((VmConfigChange::SetCpuCores(cores), format!("set CPU cores to {}", cores)));
            }
            if let Some(memory) = memory {
                if memory == 0 {
                    return Err(McvError::InvalidArguments("memory must be non-zero".into()));
                }
                changes.push((VmConfigChange::SetMemory(memory), format!("set memory to {}", memory)));
            }
            for flag in add_flags {
                changes.push((VmConfigChange::AddModification(flag), format!("add modification {}", flag)));
            }
            for flag in remove_flags {
                changes.push((VmConfigChange::RemoveModification(flag), format!("remove modification {}", flag)));
            }
            if let Some(network) = add_network {
                ensure_network(node, &network).await?;
                let adapter = NetworkAdapter {
                    mac_address: generate_mac(node).await,
                    network: network.clone(),
                };
                changes.push((VmConfigChange::AddNetworkAdapter(adapter), format!("add adapter on {}", network)));
            }
            if let Some(network) = remove_network {
                let adapter = vm
                    .network_adapters
                    .iter()
                    .find(|a| a.network == network)
                    .ok_or_else(|| McvError::NetworkDoesNotExist(format!("{} has no adapter on {}", vm.name, network)))?;
                changes.push((
                    VmConfigChange::RemoveNetworkAdapter(adapter.mac_address.clone()),
                    format!("remove adapter {}", adapter.mac_address),
                ));
            }

            let tx = Transaction::begin(ctx);
            let result = async {
                for (change, reason) in changes {
                    update(node, ctx, &vm, change, &reason).await?;
                }
                Ok::<_, McvError>(())
            }
            .await;
            tx.settle(node, ctx, result).await?;
            Ok(Outcome::unit())
        }

        VmOp::Info { name } => {
            let vm = node.config.vm_by_name(&name).await?;
            Ok(Outcome::reply(Reply::Vm(vm_info(node, ctx, vm).await?)))
        }

        VmOp::List => {
            let mut vms = Vec::new();
            for vm in node.config.vms.list().await {
                vms.push(vm_info(node, ctx, vm).await?);
            }
            vms.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(Outcome::reply(Reply::Vms(vms)))
        }

        VmOp::Backup {
            name,
            disk_number,
            delete,
        } => {
            ctx.assert_permission(Permission::ModifyVm)?;
            let vm = node.config.vm_by_name(&name).await?;
            let hdd = node.config.vm_disk(&vm, disk_number).await?;
            let snapshot = backup_volume(&hdd);
            let holder = local::holder(node, &hdd);
            if delete {
                if vm.lock != LockState::Locked {
                    return Err(McvError::VmLocked(format!("{} has no backup snapshot in progress", vm.name)));
                }
                let tx = Transaction::begin(ctx);
                let result = async {
                    Function::new(Request::Volume(VolumeOp::Delete {
                        volume: snapshot,
                        ignore_missing: false,
                    }))
                    .on_node(&holder)
                    .run(node, ctx)
                    .await?;
                    update(node, ctx, &vm, VmConfigChange::SetLock(LockState::Unlocked), "backup finished").await
                }
                .await;
                tx.settle(node, ctx, result).await?;
                Ok(Outcome::unit())
            } else {
                vm.ensure_unlocked()?;
                let tx = Transaction::begin(ctx);
                let result = async {
                    update(node, ctx, &vm, VmConfigChange::SetLock(LockState::Locked), "backup started").await?;
                    let size = hard_drive::size_of(node, ctx, &hdd).await?;
                    Function::new(Request::Volume(VolumeOp::Snapshot {
                        volume: hard_drive::raw_ref(&hdd),
                        dest: snapshot.name.clone(),
                        size,
                    }))
                    .on_node(&holder)
                    .run(node, ctx)
                    .await
                }
                .await;
                let reply = tx.settle(node, ctx, result).await?;
                Ok(Outcome::reply(reply))
            }
        }

        VmOp::PutConfig { id, config } => {
            let reason = match &config {
                Some(vm) => format!("write VM {}", vm.name),
                None => format!("remove VM {}", id),
            };
            let present = config.is_some();
            let prev = node.config.vms.put(&ctx.user, &reason, &id, config).await?;
            node.config
                .global
                .update(&ctx.user, &reason, |cfg| {
                    cfg.virtual_machines.retain(|v| v != &id);
                    if present {
                        cfg.virtual_machines.push(id.clone());
                    }
                    Ok(())
                })
                .await?;
            Ok(Outcome::unit().with_compensation(put_config(&id, prev)))
        }

        VmOp::ForgetConfig { id } => {
            let reason = format!("remove VM {} keeping its config", id);
            let prev = node.config.vms.forget(&ctx.user, &reason, &id).await?;
            node.config
                .global
                .update(&ctx.user, &reason, |cfg| {
                    cfg.virtual_machines.retain(|v| v != &id);
                    Ok(())
                })
                .await?;
            Ok(Outcome::unit().with_compensation(put_config(&id, prev)))
        }

        VmOp::UpdateConfig { id, change, reason } => {
            let (prev, stale) = node
                .config
                .vms
                .update(&ctx.user, &reason, &id, |vm| vm.apply(&change))
                .await?;
            if stale {
                debug!("{} needs redefining", prev.name);
            }
            Ok(Outcome::unit().with_compensation(put_config(&id, Some(prev))))
        }

        VmOp::DefineLocal { id } => {
            let vm = node.config.vm(&id).await?;
            define_local(node, ctx, &vm).await?;
            Ok(Outcome::unit().with_compensation(Request::Vm(VmOp::UndefineLocal { id })))
        }

        VmOp::UndefineLocal { id } => {
            let vm = node.config.vm(&id).await?;
            undefine_local(node, ctx, &vm).await?;
            Ok(Outcome::unit().with_compensation(Request::Vm(VmOp::DefineLocal { id })))
        }

        VmOp::PowerState { id } => {
            let vm = node.config.vm(&id).await?;
            let state = if node.hypervisor.is_running(&vm.name).await? {
                PowerState::Running
            } else if node.hypervisor.is_defined(&vm.name).await? {
                PowerState::Stopped
            } else {
                PowerState::Unknown
            };
            Ok(Outcome::reply(Reply::PowerState(state)))
        }
    }
}

/// Whether `path` exists on `host`.
pub(crate) async fn node_path_exists(node: &NodeState, ctx: &CallContext, host: &str, path: &str) -> McvResult<bool> {
    execute_on(node, ctx, host, Request::Node(NodeOp::PathExists { path: path.to_string() }))
        .await?
        .reply
        .into_bool()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcvirt_proto::hard_drive::DiskDriver;
    use mcvirt_proto::vm::GraphicsDriver;

    use crate::testutil::{cluster, single_node_with_backend, TestNode};

    pub(crate) fn create_request(name: &str, disks: Vec<u64>) -> VmOp {
        VmOp::Create {
            name: name.into(),
            cpu_cores: 1,
            memory: 512 * 1024 * 1024,
            disks,
            networks: Vec::new(),
            storage_type: None,
            backend: None,
            driver: DiskDriver::Virtio,
            available_nodes: None,
            graphics: GraphicsDriver::Vga,
        }
    }

    async fn created(node: &TestNode, name: &str) -> VmConfig {
        let ctx = CallContext::internal();
        handle(node, &ctx, create_request(name, vec![1 << 20])).await.unwrap();
        node.config.vm_by_name(name).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_and_register_and_start() {
        let node = single_node_with_backend("n1").await;
        let ctx = CallContext::internal();
        let vm = created(&node, "vm1").await;
        assert_eq!(vm.available_nodes, vec!["n1"]);
        assert_eq!(vm.hard_drives.len(), 1);
        assert!(node.config.global.get().await.virtual_machines.contains(&vm.id));

        let err = handle(&node, &ctx, VmOp::Start { name: "vm1".into(), iso: None }).await.unwrap_err();
        assert_eq!(err, McvError::VmNotRegistered("vm1".into()));

        handle(&node, &ctx, VmOp::Register { name: "vm1".into(), node: None }).await.unwrap();
        let vm = node.config.vm(&vm.id).await.unwrap();
        assert!(vm.is_registered_on("n1"));
        assert!(vm.uuid.is_some());
        assert_eq!(vm.applied_version, vm.version);
        assert!(node.hypervisor.is_defined("vm1").await.unwrap());

        handle(&node, &ctx, VmOp::Start { name: "vm1".into(), iso: None }).await.unwrap();
        assert_eq!(power_state(&node, &ctx, &vm).await.unwrap(), PowerState::Running);
        let err = handle(&node, &ctx, VmOp::Start { name: "vm1".into(), iso: None }).await.unwrap_err();
        assert_eq!(err, McvError::VmAlreadyStarted("vm1".into()));

        handle(&node, &ctx, VmOp::Stop { name: "vm1".into() }).await.unwrap();
        let err = handle(&node, &ctx, VmOp::Reset { name: "vm1".into() }).await.unwrap_err();
        assert_eq!(err, McvError::VmAlreadyStopped("vm1".into()));
    }

    #[tokio::test]
    async fn test_duplicate_name_and_bad_network() {
        let node = single_node_with_backend("n1").await;
        let ctx = CallContext::internal();
        created(&node, "vm1").await;
        let err = handle(&node, &ctx, create_request("vm1", Vec::new())).await.unwrap_err();
        assert_eq!(err, McvError::VmAlreadyExists("vm1".into()));

        let mut req = create_request("vm2", Vec::new());
        if let VmOp::Create { networks, .. } = &mut req {
            networks.push("Production".into());
        }
        let err = handle(&node, &ctx, req).await.unwrap_err();
        assert_eq!(err, McvError::NetworkDoesNotExist("Production".into()));
        assert!(node.config.vm_by_name("vm2").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_protection_needs_reversed_name() {
        let node = single_node_with_backend("n1").await;
        let ctx = CallContext::internal();
        created(&node, "web01").await;
        let protect = |enabled: bool, confirm: Option<&str>| VmOp::SetDeleteProtection {
            name: "web01".into(),
            enabled,
            confirm: confirm.map(String::from),
        };

        handle(&node, &ctx, protect(true, None)).await.unwrap();
        let err = handle(&node, &ctx, VmOp::Delete { name: "web01".into(), keep_disks: false, keep_config: false })
            .await
            .unwrap_err();
        assert_eq!(err, McvError::DeleteProtectionEnabled("web01".into()));

        let err = handle(&node, &ctx, protect(false, Some("web01"))).await.unwrap_err();
        assert_eq!(err, McvError::InvalidConfirmationCode);
        handle(&node, &ctx, protect(false, Some("10bew"))).await.unwrap();
        let err = handle(&node, &ctx, protect(false, Some("10bew"))).await.unwrap_err();
        assert!(matches!(err, McvError::DeleteProtectionState(_)));

        handle(&node, &ctx, VmOp::Delete { name: "web01".into(), keep_disks: false, keep_config: false })
            .await
            .unwrap();
        assert!(node.config.vm_by_name("web01").await.is_err());
        assert!(node.config.hard_drives.list().await.is_empty());
        assert!(node.config.global.get().await.virtual_machines.is_empty());
    }

    #[tokio::test]
    async fn test_delete_keeping_config_still_removes_vm() {
        let node = single_node_with_backend("n1").await;
        let ctx = CallContext::internal();
        let vm = created(&node, "vm1").await;

        handle(&node, &ctx, VmOp::Delete { name: "vm1".into(), keep_disks: true, keep_config: true })
            .await
            .unwrap();
        assert!(node.config.vms.get(&vm.id).await.is_none());
        assert!(node.config.vm_by_name("vm1").await.is_err());
        assert!(!node.config.global.get().await.virtual_machines.contains(&vm.id));
        let kept = node.settings.data_dir.join("vm").join(format!("{}.json.kept", vm.id));
        assert!(kept.exists());
        assert!(!node.runner.ran("lvremove"));
    }

    #[tokio::test]
    async fn test_lock_blocks_changes() {
        let node = single_node_with_backend("n1").await;
        let ctx = CallContext::internal();
        created(&node, "vm1").await;
        handle(&node, &ctx, VmOp::SetLock { name: "vm1".into(), lock: LockState::Locked }).await.unwrap();
        let err = handle(&node, &ctx, VmOp::SetLock { name: "vm1".into(), lock: LockState::Locked })
            .await
            .unwrap_err();
        assert!(matches!(err, McvError::VmLocked(_)));
        let err = handle(&node, &ctx, VmOp::Register { name: "vm1".into(), node: None }).await.unwrap_err();
        assert!(matches!(err, McvError::VmLocked(_)));
    }

    #[tokio::test]
    async fn test_update_bumps_version_everywhere() {
        let c = cluster(&["n1", "n2"]).await;
        let n1 = c.node("n1");
        let ctx = CallContext::internal();
        handle(n1, &ctx, create_request("vm1", Vec::new())).await.unwrap();
        let update = VmOp::Update {
            name: "vm1".into(),
            cpu_cores: Some(4),
            memory: None,
            add_flags: vec![mcvirt_proto::vm::ModificationFlag::Windows],
            remove_flags: Vec::new(),
            add_network: None,
            remove_network: None,
        };
        handle(n1, &ctx, update).await.unwrap();
        let vm = c.node("n2").config.vm_by_name("vm1").await.unwrap();
        assert_eq!(vm.cpu_cores, 4);
        assert_eq!(vm.version, 2);
        assert!(vm.modifications.contains(&mcvirt_proto::vm::ModificationFlag::Windows));
    }

    #[tokio::test]
    async fn test_backup_snapshot_locks_vm() {
        let node = single_node_with_backend("n1").await;
        let ctx = CallContext::internal();
        created(&node, "vm1").await;
        let reply = handle(&node, &ctx, VmOp::Backup { name: "vm1".into(), disk_number: 1, delete: false })
            .await
            .unwrap()
            .reply;
        assert!(reply.into_text().unwrap().ends_with("mcvirt_vm-vm1-disk-1-snapshot"));
        assert!(node.runner.ran("lvcreate --snapshot -n mcvirt_vm-vm1-disk-1-snapshot"));
        assert_eq!(node.config.vm_by_name("vm1").await.unwrap().lock, LockState::Locked);

        handle(&node, &ctx, VmOp::Backup { name: "vm1".into(), disk_number: 1, delete: true })
            .await
            .unwrap();
        assert_eq!(node.config.vm_by_name("vm1").await.unwrap().lock, LockState::Unlocked);
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("web-01_a").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("vm 1").is_err());
        assert!(validate_name("../etc").is_err());
    }
}
