//! Cluster membership.
//!
//! Joining a node is a saga run by the node that receives `add-node`:
//!
//!   decode connect string → trust target CA → inspect target
//!   → exchange cluster users, CAs and libvirt client certs with the
//!     target, then between the target and every existing peer
//!   → enable DRBD on the target → copy users, networks, storage,
//!     hard drives and VMs to it
//!
//! Any failed step unwinds the earlier ones. Removal is best-effort: a
//! node that is gone for good must still be removable from the rest.

use tracing::{info, warn};

use mcvirt_core::transport::PeerAddr;
use mcvirt_proto::auth::{Permission, UserKind};
use mcvirt_proto::connect_string::ConnectionString;
use mcvirt_proto::hard_drive::HardDriveType;
use mcvirt_proto::node::{NodeInfo, PeerRecord, RemoteMachineInfo};
use mcvirt_proto::request::{
    AuthOp, CertOp, ClusterOp, DrbdOp, HardDriveOp, NetworkOp, NodeOp, StorageOp, VmOp, VolumeOp,
    VolumeRef,
};
use mcvirt_proto::storage::StorageBackendConfig;
use mcvirt_proto::vm::{VmConfig, VmConfigChange};
use mcvirt_proto::{Envelope, McvError, McvResult, Outcome, Reply, Request};

use crate::context::CallContext;
use crate::daemon::NodeState;
use crate::remote::{query, send};
use crate::transaction::{execute_on, register_step, Function, Transaction};
use crate::{auth, certificate};

fn put_peer(hostname: &str, record: Option<PeerRecord>) -> Request {
    Request::Cluster(ClusterOp::PutPeer {
        hostname: hostname.to_string(),
        record,
    })
}

/// Refuse to go on if any peer runs an incompatible version.
pub async fn check_node_versions(node: &NodeState, ctx: &CallContext) -> McvResult<()> {
    let local = &node.settings.version;
    for peer in node.peers().await {
        match query(node, ctx, &peer, Request::Node(NodeOp::Version)).await {
            Ok(reply) => {
                let remote = reply.into_text()?;
                if !node.settings.version_policy.compatible(local, &remote) {
                    return Err(McvError::NodeVersionMismatch {
                        node: peer,
                        local: local.clone(),
                        remote,
                    });
                }
            }
            Err(e) if e.is_connectivity() && ctx.ignore_cluster => {
                warn!("cannot check version of {}: {}", peer, e);
                ctx.mark_inaccessible(&peer);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// ─── Joining ────────────────────────────────────────────────────────────────

/// A not-yet-member node, reached with the connection user it issued.
struct Candidate {
    addr: PeerAddr,
    connect: ConnectionString,
}

impl Candidate {
    async fn outcome(&self, node: &NodeState, req: Request) -> McvResult<Outcome> {
        let envelope = Envelope::with_password(&self.connect.username, &self.connect.password);
        send(node, &self.addr, envelope, req).await
    }

    async fn call(&self, node: &NodeState, req: Request) -> McvResult<Reply> {
        Ok(self.outcome(node, req).await?.reply)
    }
}

async fn remote_machine_info(node: &NodeState, ctx: &CallContext) -> McvResult<RemoteMachineInfo> {
    let global = node.config.global.get().await;
    let vm_names = node.config.vms.list().await.into_iter().map(|vm| vm.name).collect::<Vec<_>>();
    let drbd_installed = crate::drbd::handle(node, ctx, DrbdOp::IsInstalled)
        .await?
        .reply
        .into_bool()?;
    Ok(RemoteMachineInfo {
        hostname: node.hostname.clone(),
        version: node.settings.version.clone(),
        node_count: global.cluster.nodes.len(),
        vm_count: vm_names.len(),
        vm_names,
        drbd_installed,
        drbd_enabled: global.drbd.enabled,
    })
}

/// Storage backends every current node is a member of, with a default
/// location. These extend to a joining node.
async fn global_backends(node: &NodeState) -> Vec<StorageBackendConfig> {
    let nodes = node.all_nodes().await;
    node.config
        .storage
        .list()
        .await
        .into_iter()
        .filter(|sb| sb.location.is_some() && nodes.iter().all(|n| sb.is_available_on(n)))
        .collect()
}

/// Fail unless the candidate is empty, compatible and can serve this
/// cluster's storage and networks.
async fn check_remote_machine(node: &NodeState, candidate: &Candidate) -> McvResult<()> {
    let target = &candidate.connect.hostname;
    let info = candidate
        .call(node, Request::Cluster(ClusterOp::RemoteMachineInfo))
        .await?
        .into_remote_machine()?;
    if &info.hostname != target {
        return Err(McvError::InvalidConnectionString(format!(
            "connect string names {} but the node reports {}",
            target, info.hostname
        )));
    }
    if info.node_count > 0 {
        return Err(McvError::RemoteObjectConflict(format!(
            "{} is already part of a cluster with {} other node(s)",
            target, info.node_count
        )));
    }
    if info.vm_count > 0 {
        return Err(McvError::RemoteObjectConflict(format!(
            "{} already has VMs: {}",
            target,
            info.vm_names.join(", ")
        )));
    }
    if !node.settings.version_policy.compatible(&node.settings.version, &info.version) {
        return Err(McvError::NodeVersionMismatch {
            node: target.clone(),
            local: node.settings.version.clone(),
            remote: info.version,
        });
    }
    if node.drbd_enabled().await {
        if !info.drbd_installed {
            return Err(McvError::DrbdNotInstalled(target.clone()));
        }
        if info.drbd_enabled {
            return Err(McvError::DrbdAlreadyEnabled(target.clone()));
        }
    }
    for sb in global_backends(node).await {
        let Some(location) = sb.location.clone() else {
            continue;
        };
        let req = Request::Storage(StorageOp::NodePreCheck {
            storage_type: sb.storage_type,
            location,
        });
        candidate.call(node, req).await?;
    }
    for interface in node.config.global.get().await.networks.values() {
        let req = Request::Network(NetworkOp::CheckInterface {
            interface: interface.clone(),
        });
        candidate.call(node, req).await?;
    }
    Ok(())
}

/// Give `client` a libvirt client certificate signed by `server`'s CA.
async fn issue_client_cert(node: &NodeState, ctx: &CallContext, client: &str, server: &str) -> McvResult<()> {
    let csr = Function::new(Request::Cert(CertOp::GenerateCsr {
        server: server.to_string(),
    }))
    .on_node(client)
    .run(node, ctx)
    .await?
    .into_text()?;
    let cert = Function::new(Request::Cert(CertOp::SignCsr {
        client: client.to_string(),
        csr,
    }))
    .on_node(server)
    .run(node, ctx)
    .await?
    .into_text()?;
    Function::new(Request::Cert(CertOp::InstallClientCert {
        server: server.to_string(),
        cert,
    }))
    .on_node(client)
    .run(node, ctx)
    .await?;
    Ok(())
}

/// Let `client` call `server`: a cluster user on the server, the
/// server's record and CA on the client, and a libvirt client cert.
async fn grant_access(node: &NodeState, ctx: &CallContext, client: &str, server: &str) -> McvResult<()> {
    let (username, password) = Function::new(Request::Auth(AuthOp::CreateClusterUser {
        peer: client.to_string(),
    }))
    .on_node(server)
    .run(node, ctx)
    .await?
    .into_credentials()?;
    let record = PeerRecord {
        ip_address: node.node_ip(server).await?,
        username,
        password,
    };
    Function::new(put_peer(server, Some(record)))
        .on_node(client)
        .run(node, ctx)
        .await?;
    let ca_cert = Function::new(Request::Cert(CertOp::CaCert))
        .on_node(server)
        .run(node, ctx)
        .await?
        .into_text()?;
    Function::new(Request::Cert(CertOp::AddPeerCa {
        peer: server.to_string(),
        ca_cert,
    }))
    .on_node(client)
    .run(node, ctx)
    .await?;
    issue_client_cert(node, ctx, client, server).await
}

/// Copy the cluster's shared state onto a freshly-joined node.
async fn sync_to(node: &NodeState, ctx: &CallContext, target: &str) -> McvResult<()> {
    let global = node.config.global.get().await;
    Function::new(Request::Auth(AuthOp::SyncUsers {
        users: global.users.clone(),
    }))
    .on_node(target)
    .run(node, ctx)
    .await?;
    Function::new(Request::Network(NetworkOp::Sync {
        networks: global.networks.clone(),
    }))
    .on_node(target)
    .run(node, ctx)
    .await?;
    for sb in node.config.storage.list().await {
        Function::new(Request::Storage(StorageOp::PutConfig {
            id: sb.id.clone(),
            config: Some(sb),
        }))
        .on_node(target)
        .run(node, ctx)
        .await?;
    }
    for hdd in node.config.hard_drives.list().await {
        Function::new(Request::HardDrive(HardDriveOp::PutConfig {
            id: hdd.id.clone(),
            config: Some(hdd),
        }))
        .on_node(target)
        .run(node, ctx)
        .await?;
    }
    for vm in node.config.vms.list().await {
        Function::new(Request::Vm(VmOp::PutConfig {
            id: vm.id.clone(),
            config: Some(vm),
        }))
        .on_node(target)
        .run(node, ctx)
        .await?;
    }
    Ok(())
}

async fn add_node(node: &NodeState, ctx: &CallContext, connect_string: &str) -> McvResult<()> {
    let connect = ConnectionString::decode(connect_string)?;
    let target = connect.hostname.clone();
    if node.is_cluster_node(&target).await {
        return Err(McvError::NodeAlreadyPresent(target));
    }
    let local_ip = node.cluster_ip().await?;
    if local_ip == connect.ip_address {
        return Err(McvError::InvalidConnectionString(format!(
            "{} has this node's cluster IP {}",
            target, local_ip
        )));
    }
    let candidate = Candidate {
        addr: PeerAddr::new(&target, &connect.ip_address, node.settings.port),
        connect,
    };
    let peers = node.peers().await;
    let backends = global_backends(node).await;

    let tx = Transaction::begin(ctx);
    let result = async {
        Function::new(Request::Cert(CertOp::AddPeerCa {
            peer: target.clone(),
            ca_cert: candidate.connect.ca_cert.clone(),
        }))
        .run(node, ctx)
        .await?;
        check_remote_machine(node, &candidate).await?;

        let create_user = Request::Auth(AuthOp::CreateClusterUser {
            peer: node.hostname.clone(),
        });
        let step = create_user.name();
        let created = candidate.outcome(node, create_user).await?;
        let (username, password) = created.reply.into_credentials()?;
        let record = PeerRecord {
            ip_address: candidate.connect.ip_address.clone(),
            username,
            password,
        };
        Function::new(put_peer(&target, Some(record))).run(node, ctx).await?;
        // The undo reaches the target through the peer record, so it must
        // unwind before that record does.
        register_step(ctx, &target, step, created.compensation.map(|undo| *undo));

        grant_access(node, ctx, &target, &node.hostname).await?;
        issue_client_cert(node, ctx, &node.hostname, &target).await?;
        for peer in &peers {
            grant_access(node, ctx, peer, &target).await?;
            grant_access(node, ctx, &target, peer).await?;
        }

        let drbd = node.config.global.get().await.drbd;
        if drbd.enabled {
            let secret = drbd.secret.unwrap_or_else(auth::generate_password);
            Function::new(Request::Drbd(DrbdOp::EnableLocal { secret }))
                .on_node(&target)
                .run(node, ctx)
                .await?;
        }

        sync_to(node, ctx, &target).await?;
        for sb in &backends {
            crate::storage::handle(
                node,
                ctx,
                StorageOp::AddNode {
                    name: sb.name.clone(),
                    node: target.clone(),
                    location: None,
                },
            )
            .await?;
        }

        Function::new(Request::Auth(AuthOp::PutUser {
            username: candidate.connect.username.clone(),
            record: None,
        }))
        .on_node(&target)
        .run(node, ctx)
        .await?;
        Ok::<_, McvError>(())
    }
    .await;
    tx.settle(node, ctx, result).await?;
    info!("{} joined the cluster", target);
    Ok(())
}

// ─── Removal ────────────────────────────────────────────────────────────────

/// Run `req` on each node in turn, logging failures instead of stopping.
/// Returns the first failure.
async fn best_effort(node: &NodeState, ctx: &CallContext, nodes: &[String], req: Request) -> Option<McvError> {
    let mut first = None;
    for target in nodes {
        if let Err(e) = execute_on(node, ctx, target, req.clone()).await {
            warn!("{} on {} failed: {}", req.name(), target, e);
            first.get_or_insert(e);
        }
    }
    first
}

/// VMs that can only run on `target`.
fn is_orphaned(vm: &VmConfig, target: &str) -> bool {
    !vm.available_nodes.is_empty() && vm.available_nodes.iter().all(|n| n == target)
}

async fn check_removal(node: &NodeState, target: &str, delete_orphaned_vms: bool) -> McvResult<()> {
    let vms = node.config.vms.list().await;
    for vm in &vms {
        if vm.node.as_deref() == Some(target) {
            return Err(McvError::VmRegisteredElsewhere {
                vm: vm.name.clone(),
                node: target.to_string(),
            });
        }
        if is_orphaned(vm, target) && !delete_orphaned_vms {
            return Err(McvError::RemoteObjectConflict(format!(
                "VM {} can only run on {}; remove it first or delete orphaned VMs",
                vm.name, target
            )));
        }
    }
    for hdd in node.config.hard_drives.list().await {
        let orphaned = vms
            .iter()
            .any(|vm| hdd.vm.as_deref() == Some(vm.id.as_str()) && is_orphaned(vm, target));
        if orphaned {
            continue;
        }
        if hdd.disk_type == HardDriveType::Drbd && hdd.nodes.iter().any(|n| n == target) {
            return Err(McvError::StorageBackendInUse(format!(
                "hard drive {} has a DRBD replica on {}",
                hdd.id, target
            )));
        }
        let sb = node.config.storage_backend(&hdd.storage_backend).await?;
        if sb.nodes.len() == 1 && sb.is_available_on(target) {
            return Err(McvError::StorageBackendInUse(format!(
                "{} holds hard drive {} and is only available on {}",
                sb.name, hdd.id, target
            )));
        }
    }
    Ok(())
}

async fn remove_node(node: &NodeState, ctx: &CallContext, target: &str, delete_orphaned_vms: bool) -> McvResult<()> {
    if node.is_local(target) {
        return Err(McvError::InvalidArguments("a node cannot remove itself".into()));
    }
    if !node.peers().await.iter().any(|p| p == target) {
        return Err(McvError::NodeDoesNotExist(target.to_string()));
    }
    check_removal(node, target, delete_orphaned_vms).await?;

    let target_only = vec![target.to_string()];
    let remaining: Vec<String> = node
        .all_nodes()
        .await
        .into_iter()
        .filter(|n| n != target)
        .collect();
    let mut failure = None;
    let mut note = |result: Option<McvError>| {
        if failure.is_none() {
            failure = result;
        }
    };

    for vm in node.config.vms.list().await {
        if is_orphaned(&vm, target) {
            for id in &vm.hard_drives {
                let Ok(hdd) = node.config.hard_drive(id).await else {
                    continue;
                };
                for volume in hdd.volumes() {
                    let req = Request::Volume(VolumeOp::Delete {
                        volume: VolumeRef::new(&hdd.storage_backend, &volume),
                        ignore_missing: true,
                    });
                    best_effort(node, ctx, &target_only, req).await;
                }
                let req = Request::HardDrive(HardDriveOp::PutConfig {
                    id: hdd.id.clone(),
                    config: None,
                });
                note(best_effort(node, ctx, &remaining, req.clone()).await);
                best_effort(node, ctx, &target_only, req).await;
            }
            let req = Request::Vm(VmOp::PutConfig {
                id: vm.id.clone(),
                config: None,
            });
            note(best_effort(node, ctx, &remaining, req.clone()).await);
            best_effort(node, ctx, &target_only, req).await;
            info!("deleted VM {} that could only run on {}", vm.name, target);
        } else if vm.available_nodes.iter().any(|n| n == target) {
            let req = Request::Vm(VmOp::UpdateConfig {
                id: vm.id.clone(),
                change: VmConfigChange::RemoveAvailableNode(target.to_string()),
                reason: format!("{}: {} left the cluster", vm.name, target),
            });
            note(best_effort(node, ctx, &remaining, req).await);
        }
    }

    for mut sb in node.config.storage.list().await {
        if sb.nodes.remove(target).is_none() {
            continue;
        }
        let config = (!sb.nodes.is_empty()).then(|| sb.clone());
        let req = Request::Storage(StorageOp::PutConfig { id: sb.id.clone(), config });
        note(best_effort(node, ctx, &remaining, req).await);
    }

    // Leave the target a standalone node again.
    for vm in node.config.vms.list().await {
        let req = Request::Vm(VmOp::PutConfig { id: vm.id, config: None });
        best_effort(node, ctx, &target_only, req).await;
    }
    for hdd in node.config.hard_drives.list().await {
        let req = Request::HardDrive(HardDriveOp::PutConfig { id: hdd.id, config: None });
        best_effort(node, ctx, &target_only, req).await;
    }
    for sb in node.config.storage.list().await {
        let req = Request::Storage(StorageOp::PutConfig { id: sb.id, config: None });
        best_effort(node, ctx, &target_only, req).await;
    }

    for peer in &remaining {
        best_effort(node, ctx, &target_only, Request::Cert(CertOp::RemovePeer { peer: peer.clone() })).await;
    }
    let req = Request::Cert(CertOp::RemovePeer {
        peer: target.to_string(),
    });
    note(best_effort(node, ctx, &remaining, req).await);

    // The target drops this node last: that revokes the user we call it with.
    for peer in remaining.iter().rev() {
        best_effort(node, ctx, &target_only, put_peer(peer, None)).await;
    }
    for peer in remaining.iter().rev() {
        note(best_effort(node, ctx, std::slice::from_ref(peer), put_peer(target, None)).await);
    }

    info!("{} removed from the cluster", target);
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

// ─── Handler ────────────────────────────────────────────────────────────────

async fn list(node: &NodeState, ctx: &CallContext) -> Vec<NodeInfo> {
    let global = node.config.global.get().await;
    let mut nodes = vec![crate::ops::node::node_info(node).await];
    for (peer, record) in &global.cluster.nodes {
        let info = match query(node, ctx, peer, Request::Node(NodeOp::Info)).await {
            Ok(Reply::Node(info)) => Some(info),
            Ok(other) => {
                warn!("unexpected info reply from {}: {:?}", peer, other);
                None
            }
            Err(e) => {
                warn!("{} is unreachable: {}", peer, e);
                None
            }
        };
        nodes.push(info.unwrap_or_else(|| NodeInfo {
            hostname: peer.clone(),
            ip_address: Some(record.ip_address.clone()),
            version: String::new(),
            drbd_enabled: false,
            reachable: false,
            legacy_storage_vg: None,
        }));
    }
    nodes
}

pub async fn handle(node: &NodeState, ctx: &CallContext, op: ClusterOp) -> McvResult<Outcome> {
    match op {
        ClusterOp::GetConnectString => {
            ctx.assert_permission(Permission::ManageCluster)?;
            let ip_address = node.cluster_ip().await?;
            let ca_cert = certificate::ca_cert(node).await?;
            let (username, password) = auth::create_machine_user(node, UserKind::ConnectionUser, None).await?;
            let connect = ConnectionString {
                hostname: node.hostname.clone(),
                ip_address,
                username,
                password,
                ca_cert,
            };
            Ok(Outcome::reply(Reply::Text(connect.encode()?)))
        }

        ClusterOp::AddNode { connect_string } => {
            ctx.assert_permission(Permission::ManageCluster)?;
            add_node(node, ctx, &connect_string).await?;
            Ok(Outcome::unit())
        }

        ClusterOp::RemoveNode {
            hostname,
            delete_orphaned_vms,
        } => {
            ctx.assert_permission(Permission::ManageCluster)?;
            remove_node(node, ctx, &hostname, delete_orphaned_vms).await?;
            Ok(Outcome::unit())
        }

        ClusterOp::List => Ok(Outcome::reply(Reply::Nodes(list(node, ctx).await))),

        ClusterOp::PutPeer { hostname, record } => {
            let removing = record.is_none();
            let reason = match &record {
                Some(r) => format!("peer {} at {}", hostname, r.ip_address),
                None => format!("remove peer {}", hostname),
            };
            let previous = node
                .config
                .global
                .update(&ctx.user, &reason, |cfg| {
                    Ok(match record {
                        Some(record) => cfg.cluster.nodes.insert(hostname.clone(), record),
                        None => {
                            cfg.users.retain(|_, u| {
                                !(u.kind == UserKind::ClusterUser && u.node.as_deref() == Some(hostname.as_str()))
                            });
                            cfg.cluster.nodes.remove(&hostname)
                        }
                    })
                })
                .await?;
            if removing {
                node.transport.forget_peer(&hostname);
            }
            Ok(Outcome::unit().with_compensation(put_peer(&hostname, previous)))
        }

        ClusterOp::RemoteMachineInfo => Ok(Outcome::reply(Reply::RemoteMachine(remote_machine_info(node, ctx).await?))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcvirt_core::command::CommandOutput;
    use mcvirt_proto::constants::INITIAL_ADMIN_USER;

    use crate::testutil::{cluster, unjoined, TestNode};

    async fn connect_string(target: &TestNode) -> String {
        handle(target, &CallContext::internal(), ClusterOp::GetConnectString)
            .await
            .unwrap()
            .reply
            .into_text()
            .unwrap()
    }

    fn user_count(users: &std::collections::BTreeMap<String, mcvirt_proto::auth::UserRecord>, kind: UserKind) -> usize {
        users.values().filter(|u| u.kind == kind).count()
    }

    #[tokio::test]
    async fn test_add_then_remove_node() {
        let c = unjoined(&["n1", "n2"]).await;
        let (n1, n2) = (c.node("n1"), c.node("n2"));
        let ctx = CallContext::internal();
        let cs = connect_string(n2).await;
        handle(n1, &ctx, ClusterOp::AddNode { connect_string: cs.clone() }).await.unwrap();

        assert_eq!(n1.peers().await, vec!["n2".to_string()]);
        assert_eq!(n2.peers().await, vec!["n1".to_string()]);
        assert_eq!(n2.node_ip("n1").await.unwrap(), "10.0.0.1");
        assert!(n1.settings.ssl_dir().join("n2/ca.pem").exists());
        assert!(n2.settings.ssl_dir().join("n1/ca.pem").exists());
        assert!(n1.settings.ssl_dir().join("n2/clientcert.pem").exists());
        assert!(n2.settings.ssl_dir().join("n1/clientcert.pem").exists());
        let n2_users = n2.config.global.get().await.users;
        assert_eq!(user_count(&n2_users, UserKind::ConnectionUser), 0);
        assert_eq!(user_count(&n2_users, UserKind::ClusterUser), 1);
        assert!(n2_users.contains_key(INITIAL_ADMIN_USER));

        let err = handle(n1, &ctx, ClusterOp::AddNode { connect_string: cs }).await.unwrap_err();
        assert_eq!(err, McvError::NodeAlreadyPresent("n2".into()));

        let reply = handle(n1, &ctx, ClusterOp::List).await.unwrap().reply;
        let Reply::Nodes(nodes) = reply else { panic!("expected nodes") };
        assert_eq!(nodes.len(), 2);
        assert!(nodes.iter().all(|n| n.reachable));

        handle(
            n1,
            &ctx,
            ClusterOp::RemoveNode {
                hostname: "n2".into(),
                delete_orphaned_vms: false,
            },
        )
        .await
        .unwrap();
        assert!(n1.peers().await.is_empty());
        assert!(n2.peers().await.is_empty());
        assert!(!n1.settings.ssl_dir().join("n2").exists());
        for n in [n1, n2] {
            let users = n.config.global.get().await.users;
            assert_eq!(user_count(&users, UserKind::ClusterUser), 0);
        }
    }

    #[tokio::test]
    async fn test_add_node_with_remote_vm_is_refused() {
        let c = unjoined(&["n1", "n2"]).await;
        let (n1, n2) = (c.node("n1"), c.node("n2"));
        let vm = VmConfig::new("vm-pre".into(), "preexisting".into(), 1, 512 * 1024 * 1024);
        let id = vm.id.clone();
        n2.config.vms.put("admin", "test", &id, Some(vm)).await.unwrap();
        let cs = connect_string(n2).await;
        let before = n1.config.global.get().await;

        let err = handle(n1, &CallContext::internal(), ClusterOp::AddNode { connect_string: cs })
            .await
            .unwrap_err();
        assert!(matches!(err, McvError::RemoteObjectConflict(_)));
        assert_eq!(n1.config.global.get().await, before);
        assert!(!n1.settings.ssl_dir().join("n2").exists());
        assert!(n2.peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_add_removes_cluster_users() {
        let c = unjoined(&["n1", "n2"]).await;
        let (n1, n2) = (c.node("n1"), c.node("n2"));
        let cs = connect_string(n2).await;
        n2.runner
            .respond("openssl x509 -req", CommandOutput::failed(1, "unable to load CA private key"));

        let err = handle(n1, &CallContext::internal(), ClusterOp::AddNode { connect_string: cs })
            .await
            .unwrap_err();
        assert!(matches!(err, McvError::Config(_)), "{:?}", err);
        assert!(n2.runner.ran("openssl x509 -req"));
        for n in [n1, n2] {
            let users = n.config.global.get().await.users;
            assert_eq!(user_count(&users, UserKind::ClusterUser), 0, "cluster user left on {}", n.hostname);
            assert!(n.peers().await.is_empty());
        }
        assert!(!n1.settings.ssl_dir().join("n2").exists());
    }

    #[tokio::test]
    async fn test_add_node_rejects_garbage() {
        let c = unjoined(&["n1"]).await;
        let err = handle(
            c.node("n1"),
            &CallContext::internal(),
            ClusterOp::AddNode {
                connect_string: "not base64!".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, McvError::InvalidConnectionString(_)));
    }

    #[tokio::test]
    async fn test_remove_refuses_orphans_without_flag() {
        let c = cluster(&["n1", "n2"]).await;
        let (n1, n2) = (c.node("n1"), c.node("n2"));
        let ctx = CallContext::internal();
        let mut vm = VmConfig::new("vm-2".into(), "only2".into(), 1, 512 * 1024 * 1024);
        vm.available_nodes = vec!["n2".into()];
        for n in [n1, n2] {
            n.config.vms.put("admin", "test", &vm.id, Some(vm.clone())).await.unwrap();
        }
        let remove = |delete_orphaned_vms| ClusterOp::RemoveNode {
            hostname: "n2".into(),
            delete_orphaned_vms,
        };

        let err = handle(n1, &ctx, remove(false)).await.unwrap_err();
        assert!(matches!(err, McvError::RemoteObjectConflict(_)));
        assert_eq!(n1.peers().await, vec!["n2".to_string()]);

        handle(n1, &ctx, remove(true)).await.unwrap();
        assert!(n1.config.vms.list().await.is_empty());
        assert!(n2.config.vms.list().await.is_empty());
        assert!(n1.peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_versions_match_across_cluster() {
        let c = cluster(&["n1", "n2", "n3"]).await;
        check_node_versions(c.node("n1"), &CallContext::internal()).await.unwrap();
        let err = handle(
            c.node("n1"),
            &CallContext::internal(),
            ClusterOp::RemoveNode {
                hostname: "n1".into(),
                delete_orphaned_vms: false,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, McvError::InvalidArguments(_)));
    }
}
