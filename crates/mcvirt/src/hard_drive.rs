//! Hard drive subcommands, plus the top-level `verify` and `resync`.

use clap::{Args, Subcommand};
use tabled::{Table, Tabled};

use mcvirt_proto::hard_drive::{DiskDriver, HardDriveInfo, HardDriveType};
use mcvirt_proto::request::HardDriveOp;
use mcvirt_proto::{McvError, McvResult, Reply, Request};

use crate::common::{format_size, or_dash, parse_size, print_success, Client};

#[derive(Subcommand, Debug)]
pub enum HardDriveCommands {
    /// Create a disk and attach it to a VM
    Add {
        vm: String,
        #[arg(long, value_parser = parse_size)]
        size: u64,
        #[arg(long)]
        storage_type: Option<HardDriveType>,
        #[arg(long)]
        storage_backend: Option<String>,
        #[arg(long, default_value = "virtio")]
        driver: DiskDriver,
    },
    /// Detach a disk from its VM and delete it
    Delete {
        vm: String,
        #[arg(long)]
        disk_id: u32,
    },
    /// Grow a disk
    Resize {
        vm: String,
        #[arg(long)]
        disk_id: u32,
        /// Amount to grow by, e.g. 2G
        #[arg(long, value_parser = parse_size)]
        increase: u64,
    },
    /// Mark a DRBD disk in or out of sync
    SetSyncState {
        vm: String,
        #[arg(long)]
        disk_id: u32,
        #[arg(long)]
        out_of_sync: bool,
    },
    /// List all hard drives
    List,
}

/// Verify the DRBD replicas of one disk or of every disk.
#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// VM to verify
    #[arg(required_unless_present = "all")]
    pub vm: Option<String>,
    #[arg(long, default_value_t = 1)]
    pub disk_id: u32,
    /// Verify every DRBD disk in the cluster
    #[arg(long, conflicts_with = "vm")]
    pub all: bool,
}

/// Resynchronise a DRBD disk from one of its replicas.
#[derive(Args, Debug)]
pub struct ResyncArgs {
    pub vm: String,
    #[arg(long, default_value_t = 1)]
    pub disk_id: u32,
    /// Node holding the good copy
    #[arg(long, conflicts_with = "auto_determine")]
    pub source_node: Option<String>,
    /// Use the node the VM is registered on as the source
    #[arg(long)]
    pub auto_determine: bool,
}

#[derive(Tabled)]
struct HardDriveRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "VM")]
    vm: String,
    #[tabled(rename = "Disk")]
    disk: u32,
    #[tabled(rename = "Type")]
    disk_type: String,
    #[tabled(rename = "Backend")]
    backend: String,
    #[tabled(rename = "Nodes")]
    nodes: String,
    #[tabled(rename = "Size")]
    size: String,
}

impl From<&HardDriveInfo> for HardDriveRow {
    fn from(hdd: &HardDriveInfo) -> Self {
        Self {
            id: hdd.id.clone(),
            vm: or_dash(hdd.vm.as_deref()),
            disk: hdd.disk_number,
            disk_type: hdd.disk_type.to_string(),
            backend: hdd.storage_backend.clone(),
            nodes: hdd.nodes.join(", "),
            size: hdd.size.map(format_size).unwrap_or_else(|| "-".into()),
        }
    }
}

pub fn print_hard_drives(disks: &[HardDriveInfo]) {
    let rows: Vec<HardDriveRow> = disks.iter().map(HardDriveRow::from).collect();
    println!("{}", Table::new(rows));
}

fn hard_drive(op: HardDriveOp) -> Request {
    Request::HardDrive(op)
}

/// Execute a hard-drive subcommand.
pub async fn run(client: &Client, command: HardDriveCommands) -> McvResult<()> {
    match command {
        HardDriveCommands::Add {
            vm,
            size,
            storage_type,
            storage_backend,
            driver,
        } => {
            let id = client
                .call(hard_drive(HardDriveOp::Create {
                    vm: vm.clone(),
                    size,
                    storage_type,
                    backend: storage_backend,
                    driver,
                }))
                .await?
                .into_text()?;
            print_success(&format!("Attached {} to {}", id, vm));
        }
        HardDriveCommands::Delete { vm, disk_id } => {
            client
                .run(hard_drive(HardDriveOp::Delete {
                    vm: vm.clone(),
                    disk_number: disk_id,
                }))
                .await?;
            print_success(&format!("Deleted disk {} of {}", disk_id, vm));
        }
        HardDriveCommands::Resize { vm, disk_id, increase } => {
            client
                .run(hard_drive(HardDriveOp::Resize {
                    vm: vm.clone(),
                    disk_number: disk_id,
                    increase,
                }))
                .await?;
            print_success(&format!("Grew disk {} of {} by {}", disk_id, vm, format_size(increase)));
        }
        HardDriveCommands::SetSyncState {
            vm,
            disk_id,
            out_of_sync,
        } => {
            client
                .run(hard_drive(HardDriveOp::SetSyncState {
                    vm,
                    disk_number: disk_id,
                    sync_state: !out_of_sync,
                }))
                .await?;
        }
        HardDriveCommands::List => match client.call(hard_drive(HardDriveOp::List)).await? {
            Reply::HardDrives(disks) => print_hard_drives(&disks),
            other => return Err(McvError::UnexpectedReply(format!("{:?}", other))),
        },
    }
    Ok(())
}

pub async fn verify(client: &Client, args: VerifyArgs) -> McvResult<()> {
    match args.vm {
        Some(vm) if !args.all => {
            client
                .run(hard_drive(HardDriveOp::Verify {
                    vm: vm.clone(),
                    disk_number: args.disk_id,
                }))
                .await?;
            print_success(&format!("Disk {} of {} is in sync", args.disk_id, vm));
        }
        _ => {
            client.run(hard_drive(HardDriveOp::VerifyAll)).await?;
            print_success("All DRBD disks are in sync");
        }
    }
    Ok(())
}

pub async fn resync(client: &Client, args: ResyncArgs) -> McvResult<()> {
    client
        .run(hard_drive(HardDriveOp::Resync {
            vm: args.vm.clone(),
            disk_number: args.disk_id,
            source_node: args.source_node,
            auto_determine: args.auto_determine,
        }))
        .await?;
    print_success(&format!("Resynchronised disk {} of {}", args.disk_id, args.vm));
    Ok(())
}
