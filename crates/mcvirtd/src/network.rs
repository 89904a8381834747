//! Networks: a cluster-wide map of network name to the physical interface
//! it bridges, mirrored into a libvirt network on every node.

use std::collections::BTreeMap;

use tracing::{info, warn};

use mcvirt_proto::auth::Permission;
use mcvirt_proto::request::NetworkOp;
use mcvirt_proto::{McvError, McvResult, Outcome, Reply, Request};

use crate::context::CallContext;
use crate::daemon::NodeState;
use crate::transaction::{Function, Transaction};

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

fn put_request(name: &str, physical_interface: Option<String>) -> Request {
    Request::Network(NetworkOp::Put {
        name: name.to_string(),
        physical_interface,
    })
}

async fn apply_libvirt(node: &NodeState, name: &str, interface: Option<&str>) -> McvResult<()> {
    match interface {
        Some(interface) => node.hypervisor.define_network(name, interface).await,
        None => node.hypervisor.undefine_network(name).await,
    }
}

/// Fail unless `interface` exists on this host.
async fn check_interface(node: &NodeState, interface: &str) -> McvResult<()> {
    if !valid_name(interface) {
        return Err(McvError::InvalidArguments(format!("invalid interface name '{}'", interface)));
    }
    let output = node.runner.run("ip", &["link", "show", interface]).await?;
    if output.success() {
        Ok(())
    } else {
        Err(McvError::InterfaceDoesNotExist {
            node: node.hostname.clone(),
            interface: interface.to_string(),
        })
    }
}

pub async fn handle(node: &NodeState, ctx: &CallContext, op: NetworkOp) -> McvResult<Outcome> {
    match op {
        NetworkOp::Create {
            name,
            physical_interface,
        } => {
            ctx.assert_permission(Permission::ManageCluster)?;
            if !valid_name(&name) {
                return Err(McvError::InvalidArguments(format!("invalid network name '{}'", name)));
            }
            if node.config.global.get().await.networks.contains_key(&name) {
                return Err(McvError::NetworkAlreadyExists(name));
            }
            let nodes = node.all_nodes().await;
            Function::new(Request::Network(NetworkOp::CheckInterface {
                interface: physical_interface.clone(),
            }))
            .on(nodes.clone())
            .run_all(node, ctx)
            .await?;

            let tx = Transaction::begin(ctx);
            let result = Function::new(put_request(&name, Some(physical_interface.clone())))
                .on(nodes)
                .run_all(node, ctx)
                .await;
            tx.settle(node, ctx, result).await?;
            info!("created network {} on {}", name, physical_interface);
            Ok(Outcome::unit())
        }

        NetworkOp::Delete { name } => {
            ctx.assert_permission(Permission::ManageCluster)?;
            if !node.config.global.get().await.networks.contains_key(&name) {
                return Err(McvError::NetworkDoesNotExist(name));
            }
            let users: Vec<String> = node
                .config
                .vms
                .list()
                .await
                .into_iter()
                .filter(|vm| vm.network_adapters.iter().any(|a| a.network == name))
                .map(|vm| vm.name)
                .collect();
            if !users.is_empty() {
                return Err(McvError::NetworkInUse(format!("{} is used by {}", name, users.join(", "))));
            }
            let tx = Transaction::begin(ctx);
            let result = Function::new(put_request(&name, None))
                .on(node.all_nodes().await)
                .run_all(node, ctx)
                .await;
            tx.settle(node, ctx, result).await?;
            info!("deleted network {}", name);
            Ok(Outcome::unit())
        }

        NetworkOp::List => Ok(Outcome::reply(Reply::Networks(
            node.config.global.get().await.networks,
        ))),

        NetworkOp::Put {
            name,
            physical_interface,
        } => {
            apply_libvirt(node, &name, physical_interface.as_deref()).await?;
            let reason = match &physical_interface {
                Some(interface) => format!("network {} on {}", name, interface),
                None => format!("remove network {}", name),
            };
            let previous = node
                .config
                .global
                .update(&ctx.user, &reason, |cfg| {
                    Ok(match &physical_interface {
                        Some(interface) => cfg.networks.insert(name.clone(), interface.clone()),
                        None => cfg.networks.remove(&name),
                    })
                })
                .await?;
            Ok(Outcome::unit().with_compensation(put_request(&name, previous)))
        }

        NetworkOp::Sync { networks } => {
            let previous = node.config.global.get().await.networks;
            for (name, interface) in &networks {
                if previous.get(name) != Some(interface) {
                    apply_libvirt(node, name, Some(interface)).await?;
                }
            }
            for name in previous.keys().filter(|n| !networks.contains_key(*n)) {
                if let Err(e) = apply_libvirt(node, name, None).await {
                    warn!("failed to undefine network {}: {}", name, e);
                }
            }
            let previous: BTreeMap<String, String> = node
                .config
                .global
                .update(&ctx.user, "sync networks", |cfg| {
                    Ok(std::mem::replace(&mut cfg.networks, networks))
                })
                .await?;
            Ok(Outcome::unit().with_compensation(Request::Network(NetworkOp::Sync { networks: previous })))
        }

        NetworkOp::CheckInterface { interface } => {
            check_interface(node, &interface).await?;
            Ok(Outcome::unit())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcvirt_core::command::CommandOutput;
    use mcvirt_proto::vm::{NetworkAdapter, VmConfig};

    use crate::testutil::{cluster, single_node};

    fn create(name: &str, interface: &str) -> NetworkOp {
        NetworkOp::Create {
            name: name.into(),
            physical_interface: interface.into(),
        }
    }

    #[tokio::test]
    async fn test_create_reaches_every_node() {
        let c = cluster(&["n1", "n2"]).await;
        let (n1, n2) = (c.node("n1"), c.node("n2"));
        handle(n1, &CallContext::internal(), create("Production", "br0")).await.unwrap();

        assert!(n2.runner.ran("ip link show br0"));
        for n in [n1, n2] {
            let networks = n.config.global.get().await.networks;
            assert_eq!(networks.get("Production").map(String::as_str), Some("br0"));
            assert!(n.hypervisor_fake().has_network("Production"));
        }

        let err = handle(n1, &CallContext::internal(), create("Production", "br0")).await.unwrap_err();
        assert_eq!(err, McvError::NetworkAlreadyExists("Production".into()));
    }

    #[tokio::test]
    async fn test_missing_interface_on_peer() {
        let c = cluster(&["n1", "n2"]).await;
        let (n1, n2) = (c.node("n1"), c.node("n2"));
        n2.runner.respond("ip link show", CommandOutput::failed(1, "Device \"br0\" does not exist."));

        let err = handle(n1, &CallContext::internal(), create("Production", "br0")).await.unwrap_err();
        assert_eq!(
            err,
            McvError::InterfaceDoesNotExist {
                node: "n2".into(),
                interface: "br0".into()
            }
        );
        assert!(n1.config.global.get().await.networks.is_empty());
        assert!(n2.config.global.get().await.networks.is_empty());
    }

    #[tokio::test]
    async fn test_delete_refused_while_in_use() {
        let node = single_node("n1").await;
        let ctx = CallContext::internal();
        handle(&node, &ctx, create("Production", "br0")).await.unwrap();
        let mut vm = VmConfig::new("vm-0".into(), "vm1".into(), 1, 512 * 1024 * 1024);
        vm.network_adapters.push(NetworkAdapter {
            mac_address: "52:54:00:00:00:01".into(),
            network: "Production".into(),
        });
        let id = vm.id.clone();
        node.config.vms.put("admin", "test", &id, Some(vm)).await.unwrap();

        let err = handle(&node, &ctx, NetworkOp::Delete { name: "Production".into() }).await.unwrap_err();
        assert!(matches!(err, McvError::NetworkInUse(_)));

        node.config.vms.put("admin", "test", "vm-0", None).await.unwrap();
        handle(&node, &ctx, NetworkOp::Delete { name: "Production".into() }).await.unwrap();
        assert!(node.config.global.get().await.networks.is_empty());
        assert!(!node.hypervisor_fake().has_network("Production"));
    }

    #[tokio::test]
    async fn test_sync_replaces_map() {
        let node = single_node("n1").await;
        let ctx = CallContext::internal();
        handle(&node, &ctx, create("Old", "eth0")).await.unwrap();
        let networks: BTreeMap<String, String> = [("New".to_string(), "eth1".to_string())].into();
        let outcome = handle(&node, &ctx, NetworkOp::Sync { networks: networks.clone() }).await.unwrap();
        assert_eq!(node.config.global.get().await.networks, networks);
        let Some(undo) = outcome.compensation else { panic!("sync has no compensation") };
        assert!(matches!(*undo, Request::Network(NetworkOp::Sync { ref networks }) if networks.contains_key("Old")));
    }
}
