use clap::Subcommand;
use tabled::{Table, Tabled};

use mcvirt_proto::node::NodeInfo;
use mcvirt_proto::request::ClusterOp;
use mcvirt_proto::{McvError, McvResult, Reply, Request};

use crate::common::{or_dash, print_success, Client};

#[derive(Subcommand, Debug)]
pub enum ClusterCommands {
    /// Print the connect string another node needs to join this one
    GetConnectString,
    /// Join a node to the cluster
    AddNode {
        /// Output of `get-connect-string` on the new node
        #[arg(long)]
        connect_string: String,
    },
    /// Remove a node from the cluster
    RemoveNode {
        hostname: String,
        /// Delete VMs that would be left without a node
        #[arg(long)]
        delete_orphaned_vms: bool,
    },
    /// List cluster nodes
    List,
}

#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "Node")]
    hostname: String,
    #[tabled(rename = "IP")]
    ip_address: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "DRBD")]
    drbd: String,
    #[tabled(rename = "Status")]
    status: String,
}

impl From<&NodeInfo> for NodeRow {
    fn from(node: &NodeInfo) -> Self {
        Self {
            hostname: node.hostname.clone(),
            ip_address: or_dash(node.ip_address.as_deref()),
            version: node.version.clone(),
            drbd: if node.drbd_enabled { "enabled" } else { "disabled" }.to_string(),
            status: if node.reachable { "up" } else { "unreachable" }.to_string(),
        }
    }
}

fn cluster(op: ClusterOp) -> Request {
    Request::Cluster(op)
}

/// Execute a cluster subcommand.
pub async fn run(client: &Client, command: ClusterCommands) -> McvResult<()> {
    match command {
        ClusterCommands::GetConnectString => {
            let connect_string = client.call(cluster(ClusterOp::GetConnectString)).await?.into_text()?;
            println!("{}", connect_string);
        }
        ClusterCommands::AddNode { connect_string } => {
            client.run(cluster(ClusterOp::AddNode { connect_string })).await?;
            print_success("Node added to the cluster");
        }
        ClusterCommands::RemoveNode {
            hostname,
            delete_orphaned_vms,
        } => {
            client
                .run(cluster(ClusterOp::RemoveNode {
                    hostname: hostname.clone(),
                    delete_orphaned_vms,
                }))
                .await?;
            print_success(&format!("Removed {} from the cluster", hostname));
        }
        ClusterCommands::List => match client.call(cluster(ClusterOp::List)).await? {
            Reply::Nodes(nodes) => {
                let rows: Vec<NodeRow> = nodes.iter().map(NodeRow::from).collect();
                println!("{}", Table::new(rows));
            }
            other => return Err(McvError::UnexpectedReply(format!("{:?}", other))),
        },
    }
    Ok(())
}
