//! Node-level operations: version, info, cluster IP, port scan.

use std::net::IpAddr;

use tracing::info;

use mcvirt_proto::auth::Permission;
use mcvirt_proto::node::NodeInfo;
use mcvirt_proto::request::NodeOp;
use mcvirt_proto::{McvError, McvResult, Outcome, Reply};

use crate::context::CallContext;
use crate::daemon::NodeState;

pub async fn node_info(node: &NodeState) -> NodeInfo {
    let global = node.config.global.get().await;
    let legacy_storage_vg = if global.default_storage_configured {
        None
    } else {
        global.vm_storage_vg.clone()
    };
    NodeInfo {
        hostname: node.hostname.clone(),
        ip_address: global.cluster.cluster_ip.clone(),
        version: node.settings.version.clone(),
        drbd_enabled: global.drbd.enabled,
        reachable: true,
        legacy_storage_vg,
    }
}

/// Ports in `ss -Htln` output.
fn parse_listening_ports(output: &str) -> Vec<u16> {
    let mut ports: Vec<u16> = output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(3))
        .filter_map(|local| local.rsplit_once(':'))
        .filter_map(|(_, port)| port.parse().ok())
        .collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}

pub async fn handle(node: &NodeState, ctx: &CallContext, op: NodeOp) -> McvResult<Outcome> {
    match op {
        NodeOp::Version => Ok(Outcome::reply(Reply::Text(node.settings.version.clone()))),

        NodeOp::Info => Ok(Outcome::reply(Reply::Node(node_info(node).await))),

        NodeOp::SetClusterIp { ip } => {
            ctx.assert_permission(Permission::ManageCluster)?;
            let addr: IpAddr = ip
                .parse()
                .map_err(|_| McvError::InvalidArguments(format!("invalid IP address '{}'", ip)))?;
            if addr.is_loopback() || addr.is_unspecified() {
                return Err(McvError::InvalidArguments(format!(
                    "{} cannot be used as a cluster IP",
                    ip
                )));
            }
            if !node.peers().await.is_empty() {
                return Err(McvError::InvalidArguments(
                    "the cluster IP cannot be changed while the node has peers".into(),
                ));
            }
            node.config
                .global
                .update(&ctx.user, &format!("set cluster IP to {}", ip), |cfg| {
                    cfg.cluster.cluster_ip = Some(ip.clone());
                    Ok(())
                })
                .await?;
            info!("cluster IP set to {}", ip);
            Ok(Outcome::unit())
        }

        NodeOp::ListeningPorts => {
            let output = node.runner.run_ok("ss", &["-Htln"]).await?;
            Ok(Outcome::reply(Reply::Ports(parse_listening_ports(&output))))
        }

        NodeOp::PathExists { path } => {
            let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
            Ok(Outcome::reply(Reply::Bool(exists)))
        }
    }
}
