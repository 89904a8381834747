//! Virtual machine subcommands.

use clap::{Args, Subcommand};
use tabled::{Table, Tabled};

use mcvirt_proto::hard_drive::{DiskDriver, HardDriveType};
use mcvirt_proto::request::VmOp;
use mcvirt_proto::vm::{GraphicsDriver, LockState, ModificationFlag, VmInfo};
use mcvirt_proto::{McvError, McvResult, Reply, Request};

use crate::common::{format_size, or_dash, parse_size, print_success, Client};

// ---------------------------------------------------------------------------
// CLI argument types
// ---------------------------------------------------------------------------

#[derive(Subcommand, Debug)]
pub enum VmCommands {
    /// Create a VM with its disks and network adapters
    Create(CreateArgs),
    /// Delete a VM
    Delete {
        name: String,
        /// Keep the VM's disks
        #[arg(long)]
        keep_disks: bool,
        /// Keep the libvirt definition and config (disks are detached)
        #[arg(long)]
        keep_config: bool,
    },
    /// Start a VM on the node it is registered on
    Start {
        name: String,
        /// ISO image to boot from
        #[arg(long)]
        iso: Option<String>,
    },
    /// Power a VM off
    Stop { name: String },
    /// Ask the guest to shut down
    Shutdown { name: String },
    /// Reset a running VM
    Reset { name: String },
    /// Register a VM on a node
    Register {
        name: String,
        /// Target node (defaults to the connected node)
        #[arg(long)]
        node: Option<String>,
    },
    /// Unregister a stopped VM
    Unregister { name: String },
    /// Lock or unlock a VM
    Lock {
        name: String,
        #[arg(long)]
        unlock: bool,
    },
    /// Enable or disable delete protection
    DeleteProtection {
        name: String,
        #[arg(long)]
        disable: bool,
        /// Reversed VM name, required to disable
        #[arg(long)]
        confirm: Option<String>,
    },
    /// Migrate a VM to another node
    Migrate {
        name: String,
        /// Destination node
        #[arg(long)]
        node: String,
        /// Live-migrate a running VM
        #[arg(long)]
        online: bool,
        /// Start the VM on the destination afterwards
        #[arg(long)]
        start: bool,
        /// Shut the VM down first and wait for it
        #[arg(long)]
        wait_for_shutdown: bool,
    },
    /// Move a VM's storage between nodes
    Move {
        name: String,
        #[arg(long)]
        source_node: String,
        #[arg(long)]
        destination_node: String,
    },
    /// Create a snapshot-based clone linked to its parent
    Clone { name: String, new_name: String },
    /// Create an independent copy
    Duplicate {
        name: String,
        new_name: String,
        /// Storage backend for the copied disks
        #[arg(long)]
        storage_backend: Option<String>,
    },
    /// Change CPU, memory, flags or network adapters
    Update(UpdateArgs),
    /// Show one VM
    Info { name: String },
    /// List all VMs
    List,
    /// Create or delete the backup snapshot of a disk
    Backup {
        name: String,
        #[arg(long, default_value_t = 1)]
        disk_id: u32,
        /// Delete the snapshot instead
        #[arg(long)]
        delete: bool,
    },
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    pub name: String,
    #[arg(long, default_value_t = 1)]
    pub cpu_count: u32,
    /// Memory, e.g. 512M
    #[arg(long, value_parser = parse_size)]
    pub memory: u64,
    /// Size of each disk to create, e.g. 8G; repeat for more disks
    #[arg(long = "disk-size", value_parser = parse_size)]
    pub disks: Vec<u64>,
    /// Network to attach an adapter to; repeatable
    #[arg(long = "network")]
    pub networks: Vec<String>,
    #[arg(long)]
    pub storage_type: Option<HardDriveType>,
    #[arg(long)]
    pub storage_backend: Option<String>,
    #[arg(long, default_value = "virtio")]
    pub driver: DiskDriver,
    /// Nodes the VM may run on (defaults to all suitable nodes)
    #[arg(long = "nodes", value_delimiter = ',')]
    pub nodes: Vec<String>,
    #[arg(long, default_value = "vga")]
    pub graphics: GraphicsDriver,
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    pub name: String,
    #[arg(long)]
    pub cpu_count: Option<u32>,
    #[arg(long, value_parser = parse_size)]
    pub memory: Option<u64>,
    #[arg(long = "add-flag")]
    pub add_flags: Vec<ModificationFlag>,
    #[arg(long = "remove-flag")]
    pub remove_flags: Vec<ModificationFlag>,
    #[arg(long)]
    pub add_network: Option<String>,
    /// Network whose adapter is removed
    #[arg(long)]
    pub remove_network: Option<String>,
}

// ---------------------------------------------------------------------------
// Table display types
// ---------------------------------------------------------------------------

#[derive(Tabled)]
struct VmRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "CPUs")]
    cpus: u32,
    #[tabled(rename = "Memory")]
    memory: String,
    #[tabled(rename = "Disks")]
    disks: usize,
}

impl From<&VmInfo> for VmRow {
    fn from(vm: &VmInfo) -> Self {
        Self {
            name: vm.name.clone(),
            state: vm.power_state.to_string(),
            node: or_dash(vm.node.as_deref()),
            cpus: vm.cpu_cores,
            memory: format_size(vm.memory),
            disks: vm.hard_drives.len(),
        }
    }
}

fn print_info(vm: &VmInfo) {
    println!("Name:              {}", vm.name);
    println!("ID:                {}", vm.id);
    println!("State:             {}", vm.power_state);
    println!("Lock:              {}", vm.lock);
    println!("Node:              {}", or_dash(vm.node.as_deref()));
    println!("Available nodes:   {}", vm.available_nodes.join(", "));
    println!("CPU cores:         {}", vm.cpu_cores);
    println!("Memory:            {}", format_size(vm.memory));
    println!("Delete protection: {}", if vm.delete_protection { "enabled" } else { "disabled" });
    if !vm.modifications.is_empty() {
        let flags: Vec<String> = vm.modifications.iter().map(|f| f.to_string()).collect();
        println!("Modifications:     {}", flags.join(", "));
    }
    if let Some(parent) = &vm.clone_parent {
        println!("Clone of:          {}", parent);
    }
    if !vm.clone_children.is_empty() {
        println!("Clones:            {}", vm.clone_children.join(", "));
    }
    println!("Hard drives:");
    for id in &vm.hard_drives {
        println!("  {}", id);
    }
    println!("Network adapters:");
    for adapter in &vm.network_adapters {
        println!("  {} on {}", adapter.mac_address, adapter.network);
    }
}

// ---------------------------------------------------------------------------
// Command execution
// ---------------------------------------------------------------------------

fn vm(op: VmOp) -> Request {
    Request::Vm(op)
}

/// Execute a VM subcommand.
pub async fn run(client: &Client, command: VmCommands) -> McvResult<()> {
    match command {
        VmCommands::Create(args) => {
            let available_nodes = (!args.nodes.is_empty()).then_some(args.nodes);
            let id = client
                .call(vm(VmOp::Create {
                    name: args.name.clone(),
                    cpu_cores: args.cpu_count,
                    memory: args.memory,
                    disks: args.disks,
                    networks: args.networks,
                    storage_type: args.storage_type,
                    backend: args.storage_backend,
                    driver: args.driver,
                    available_nodes,
                    graphics: args.graphics,
                }))
                .await?
                .into_text()?;
            print_success(&format!("Created VM {} ({})", args.name, id));
        }
        VmCommands::Delete {
            name,
            keep_disks,
            keep_config,
        } => {
            client
                .run(vm(VmOp::Delete {
                    name: name.clone(),
                    keep_disks,
                    keep_config,
                }))
                .await?;
            print_success(&format!("Deleted VM {}", name));
        }
        VmCommands::Start { name, iso } => {
            client.run(vm(VmOp::Start { name: name.clone(), iso })).await?;
            print_success(&format!("Started {}", name));
        }
        VmCommands::Stop { name } => {
            client.run(vm(VmOp::Stop { name: name.clone() })).await?;
            print_success(&format!("Stopped {}", name));
        }
        VmCommands::Shutdown { name } => {
            client.run(vm(VmOp::Shutdown { name: name.clone() })).await?;
            print_success(&format!("Shutdown signal sent to {}", name));
        }
        VmCommands::Reset { name } => {
            client.run(vm(VmOp::Reset { name: name.clone() })).await?;
            print_success(&format!("Reset {}", name));
        }
        VmCommands::Register { name, node } => {
            client.run(vm(VmOp::Register { name: name.clone(), node })).await?;
            print_success(&format!("Registered {}", name));
        }
        VmCommands::Unregister { name } => {
            client.run(vm(VmOp::Unregister { name: name.clone() })).await?;
            print_success(&format!("Unregistered {}", name));
        }
        VmCommands::Lock { name, unlock } => {
            let lock = if unlock { LockState::Unlocked } else { LockState::Locked };
            client.run(vm(VmOp::SetLock { name: name.clone(), lock })).await?;
            print_success(&format!("{} is now {}", name, lock));
        }
        VmCommands::DeleteProtection {
            name,
            disable,
            confirm,
        } => {
            client
                .run(vm(VmOp::SetDeleteProtection {
                    name: name.clone(),
                    enabled: !disable,
                    confirm,
                }))
                .await?;
            let state = if disable { "disabled" } else { "enabled" };
            print_success(&format!("Delete protection {} for {}", state, name));
        }
        VmCommands::Migrate {
            name,
            node,
            online,
            start,
            wait_for_shutdown,
        } => {
            client
                .run(vm(VmOp::Migrate {
                    name: name.clone(),
                    node: node.clone(),
                    online,
                    start,
                    wait_for_shutdown,
                }))
                .await?;
            print_success(&format!("Migrated {} to {}", name, node));
        }
        VmCommands::Move {
            name,
            source_node,
            destination_node,
        } => {
            client
                .run(vm(VmOp::Move {
                    name: name.clone(),
                    source: source_node,
                    dest: destination_node.clone(),
                }))
                .await?;
            print_success(&format!("Moved storage of {} to {}", name, destination_node));
        }
        VmCommands::Clone { name, new_name } => {
            client
                .run(vm(VmOp::Clone {
                    name: name.clone(),
                    new_name: new_name.clone(),
                }))
                .await?;
            print_success(&format!("Cloned {} as {}", name, new_name));
        }
        VmCommands::Duplicate {
            name,
            new_name,
            storage_backend,
        } => {
            client
                .run(vm(VmOp::Duplicate {
                    name: name.clone(),
                    new_name: new_name.clone(),
                    backend: storage_backend,
                }))
                .await?;
            print_success(&format!("Duplicated {} as {}", name, new_name));
        }
        VmCommands::Update(args) => {
            client
                .run(vm(VmOp::Update {
                    name: args.name.clone(),
                    cpu_cores: args.cpu_count,
                    memory: args.memory,
                    add_flags: args.add_flags,
                    remove_flags: args.remove_flags,
                    add_network: args.add_network,
                    remove_network: args.remove_network,
                }))
                .await?;
            print_success(&format!("Updated {}", args.name));
        }
        VmCommands::Info { name } => match client.call(vm(VmOp::Info { name })).await? {
            Reply::Vm(info) => print_info(&info),
            other => return Err(McvError::UnexpectedReply(format!("{:?}", other))),
        },
        VmCommands::List => match client.call(vm(VmOp::List)).await? {
            Reply::Vms(vms) => {
                let rows: Vec<VmRow> = vms.iter().map(VmRow::from).collect();
                println!("{}", Table::new(rows));
            }
            other => return Err(McvError::UnexpectedReply(format!("{:?}", other))),
        },
        VmCommands::Backup {
            name,
            disk_id,
            delete,
        } => {
            let reply = client
                .call(vm(VmOp::Backup {
                    name: name.clone(),
                    disk_number: disk_id,
                    delete,
                }))
                .await?;
            match reply {
                Reply::Text(path) => print_success(&format!("Backup snapshot: {}", path)),
                _ => print_success(&format!("Removed backup snapshot of {} disk {}", name, disk_id)),
            }
        }
    }
    Ok(())
}
