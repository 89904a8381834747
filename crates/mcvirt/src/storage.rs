use clap::Subcommand;
use tabled::{Table, Tabled};

use mcvirt_proto::request::StorageOp;
use mcvirt_proto::storage::{StorageBackendInfo, StorageType};
use mcvirt_proto::{McvError, McvResult, Reply, Request};

use crate::common::{format_size, or_dash, parse_node_locations, print_success, Client};

#[derive(Subcommand, Debug)]
pub enum StorageCommands {
    /// Create a storage backend
    Create {
        name: String,
        /// Lvm or File
        #[arg(long = "type")]
        storage_type: StorageType,
        /// Default volume group or directory
        #[arg(long)]
        location: Option<String>,
        /// The same storage is visible from every member node
        #[arg(long)]
        shared: bool,
        /// Member node, as `node` or `node=location`
        #[arg(long = "node")]
        nodes: Vec<String>,
    },
    /// Delete an unused storage backend
    Delete { name: String },
    /// Make a backend available on another node
    AddNode {
        name: String,
        #[arg(long)]
        node: String,
        #[arg(long)]
        location: Option<String>,
    },
    /// Remove a node from a backend
    RemoveNode {
        name: String,
        #[arg(long)]
        node: String,
    },
    /// Change the default or per-node location of a backend
    SetLocation {
        name: String,
        location: String,
        /// Override only this node's location
        #[arg(long)]
        node: Option<String>,
    },
    /// Mark a backend as shared
    Share {
        name: String,
        #[arg(long)]
        unshare: bool,
    },
    /// Show free space on each member node
    FreeSpace {
        name: String,
        #[arg(long = "node")]
        nodes: Vec<String>,
    },
    /// List storage backends
    List,
}

#[derive(Tabled)]
struct BackendRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Type")]
    storage_type: String,
    #[tabled(rename = "Shared")]
    shared: bool,
    #[tabled(rename = "Location")]
    location: String,
    #[tabled(rename = "Nodes")]
    nodes: String,
}

impl From<&StorageBackendInfo> for BackendRow {
    fn from(backend: &StorageBackendInfo) -> Self {
        let nodes = backend
            .nodes
            .iter()
            .map(|(node, location)| match location {
                Some(loc) => format!("{} ({})", node, loc),
                None => node.clone(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            name: backend.name.clone(),
            id: backend.id.clone(),
            storage_type: backend.storage_type.to_string(),
            shared: backend.shared,
            location: or_dash(backend.location.as_deref()),
            nodes,
        }
    }
}

#[derive(Tabled)]
struct FreeSpaceRow {
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "Free")]
    free: String,
}

fn storage(op: StorageOp) -> Request {
    Request::Storage(op)
}

/// Execute a storage subcommand.
pub async fn run(client: &Client, command: StorageCommands) -> McvResult<()> {
    match command {
        StorageCommands::Create {
            name,
            storage_type,
            location,
            shared,
            nodes,
        } => {
            let id = client
                .call(storage(StorageOp::Create {
                    name: name.clone(),
                    storage_type,
                    location,
                    shared,
                    nodes: parse_node_locations(&nodes),
                }))
                .await?
                .into_text()?;
            print_success(&format!("Created storage backend {} ({})", name, id));
        }
        StorageCommands::Delete { name } => {
            client.run(storage(StorageOp::Delete { name: name.clone() })).await?;
            print_success(&format!("Deleted storage backend {}", name));
        }
        StorageCommands::AddNode { name, node, location } => {
            client
                .run(storage(StorageOp::AddNode {
                    name: name.clone(),
                    node: node.clone(),
                    location,
                }))
                .await?;
            print_success(&format!("Added {} to {}", node, name));
        }
        StorageCommands::RemoveNode { name, node } => {
            client
                .run(storage(StorageOp::RemoveNode {
                    name: name.clone(),
                    node: node.clone(),
                }))
                .await?;
            print_success(&format!("Removed {} from {}", node, name));
        }
        StorageCommands::SetLocation { name, location, node } => {
            client
                .run(storage(StorageOp::SetLocation { name, location, node }))
                .await?;
        }
        StorageCommands::Share { name, unshare } => {
            client
                .run(storage(StorageOp::SetShared { name, shared: !unshare }))
                .await?;
        }
        StorageCommands::FreeSpace { name, nodes } => {
            let nodes = if nodes.is_empty() { None } else { Some(nodes) };
            let per_node = client
                .call(storage(StorageOp::FreeSpace { name, nodes }))
                .await?
                .into_per_node()?;
            let mut rows = Vec::with_capacity(per_node.len());
            for (node, reply) in per_node {
                rows.push(FreeSpaceRow {
                    node,
                    free: format_size(reply.into_size()?),
                });
            }
            println!("{}", Table::new(rows));
        }
        StorageCommands::List => match client.call(storage(StorageOp::List)).await? {
            Reply::StorageBackends(backends) => {
                let rows: Vec<BackendRow> = backends.iter().map(BackendRow::from).collect();
                println!("{}", Table::new(rows));
            }
            other => return Err(McvError::UnexpectedReply(format!("{:?}", other))),
        },
    }
    Ok(())
}
