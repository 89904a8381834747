use clap::Subcommand;
use tabled::{Table, Tabled};

use mcvirt_proto::request::NetworkOp;
use mcvirt_proto::{McvResult, Request};

use crate::common::{print_success, Client};

#[derive(Subcommand, Debug)]
pub enum NetworkCommands {
    /// Create a bridged network on every node
    Create {
        name: String,
        /// Physical interface to bridge
        #[arg(long)]
        interface: String,
    },
    /// Delete a network no VM uses
    Delete { name: String },
    /// List networks
    List,
}

#[derive(Tabled)]
struct NetworkRow {
    #[tabled(rename = "Network")]
    name: String,
    #[tabled(rename = "Interface")]
    interface: String,
}

/// Execute a network subcommand.
pub async fn run(client: &Client, command: NetworkCommands) -> McvResult<()> {
    match command {
        NetworkCommands::Create { name, interface } => {
            client
                .run(Request::Network(NetworkOp::Create {
                    name: name.clone(),
                    physical_interface: interface,
                }))
                .await?;
            print_success(&format!("Created network {}", name));
        }
        NetworkCommands::Delete { name } => {
            client.run(Request::Network(NetworkOp::Delete { name: name.clone() })).await?;
            print_success(&format!("Deleted network {}", name));
        }
        NetworkCommands::List => {
            let networks = client.call(Request::Network(NetworkOp::List)).await?.into_networks()?;
            let rows: Vec<NetworkRow> = networks
                .into_iter()
                .map(|(name, interface)| NetworkRow { name, interface })
                .collect();
            println!("{}", Table::new(rows));
        }
    }
    Ok(())
}
