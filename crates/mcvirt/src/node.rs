use clap::Subcommand;

use mcvirt_proto::request::NodeOp;
use mcvirt_proto::{McvError, McvResult, Reply, Request};

use crate::common::{or_dash, print_success, Client};

#[derive(Subcommand, Debug)]
pub enum NodeCommands {
    /// Show information about the connected node
    Info,
    /// Show the daemon version
    Version,
    /// Set the address peers use to reach this node
    SetClusterIp { ip: String },
}

/// Execute a node subcommand.
pub async fn run(client: &Client, command: NodeCommands) -> McvResult<()> {
    match command {
        NodeCommands::Info => match client.call(Request::Node(NodeOp::Info)).await? {
            Reply::Node(node) => {
                println!("Hostname:     {}", node.hostname);
                println!("Cluster IP:   {}", or_dash(node.ip_address.as_deref()));
                println!("Version:      {}", node.version);
                println!("DRBD enabled: {}", node.drbd_enabled);
                if let Some(vg) = node.legacy_storage_vg {
                    println!("Legacy VG:    {}", vg);
                }
            }
            other => return Err(McvError::UnexpectedReply(format!("{:?}", other))),
        },
        NodeCommands::Version => {
            let version = client.call(Request::Node(NodeOp::Version)).await?.into_text()?;
            println!("{}", version);
        }
        NodeCommands::SetClusterIp { ip } => {
            client.run(Request::Node(NodeOp::SetClusterIp { ip: ip.clone() })).await?;
            print_success(&format!("Cluster IP set to {}", ip));
        }
    }
    Ok(())
}
