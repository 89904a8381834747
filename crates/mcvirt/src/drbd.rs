use clap::Subcommand;
use tabled::{Table, Tabled};

use mcvirt_proto::hard_drive::HardDriveInfo;
use mcvirt_proto::request::DrbdOp;
use mcvirt_proto::{McvError, McvResult, Reply, Request};

use crate::common::{or_dash, print_success, Client};

#[derive(Subcommand, Debug)]
pub enum DrbdCommands {
    /// Enable DRBD on every node of the cluster
    Enable {
        /// Shared secret for peer authentication (generated if omitted)
        #[arg(long)]
        secret: Option<String>,
    },
    /// List DRBD hard drives
    List,
    /// Report a resource out of sync; run by the DRBD handler
    OutOfSync {
        #[arg(env = "DRBD_RESOURCE")]
        resource: String,
    },
}

#[derive(Tabled)]
struct DrbdRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "VM")]
    vm: String,
    #[tabled(rename = "Minor")]
    minor: u32,
    #[tabled(rename = "Port")]
    port: u16,
    #[tabled(rename = "Nodes")]
    nodes: String,
    #[tabled(rename = "In sync")]
    sync: bool,
}

impl DrbdRow {
    fn new(hdd: &HardDriveInfo) -> Option<Self> {
        let drbd = hdd.drbd.as_ref()?;
        Some(Self {
            resource: drbd.resource_name.clone(),
            vm: or_dash(hdd.vm.as_deref()),
            minor: drbd.minor,
            port: drbd.port,
            nodes: hdd.nodes.join(", "),
            sync: drbd.sync_state,
        })
    }
}

/// Execute a DRBD subcommand.
pub async fn run(client: &Client, command: DrbdCommands) -> McvResult<()> {
    match command {
        DrbdCommands::Enable { secret } => {
            client.run(Request::Drbd(DrbdOp::Enable { secret })).await?;
            print_success("DRBD enabled");
        }
        DrbdCommands::List => match client.call(Request::Drbd(DrbdOp::List)).await? {
            Reply::HardDrives(disks) => {
                let rows: Vec<DrbdRow> = disks.iter().filter_map(DrbdRow::new).collect();
                println!("{}", Table::new(rows));
            }
            other => return Err(McvError::UnexpectedReply(format!("{:?}", other))),
        },
        DrbdCommands::OutOfSync { resource } => {
            client.run(Request::Drbd(DrbdOp::OutOfSync { resource })).await?;
        }
    }
    Ok(())
}
