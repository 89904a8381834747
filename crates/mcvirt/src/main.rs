//! MCVirt operator CLI (mcvirt).
//!
//! Talks to the `mcvirtd` daemon of one node; the daemon fans changes out
//! to the rest of the cluster.
//!
//! # Usage
//!
//! ```text
//! mcvirt [OPTIONS] <COMMAND>
//!
//! Commands:
//!   login       Authenticate and cache a session
//!   vm          Virtual machine management
//!   hard-drive  Hard drive management
//!   verify      Verify DRBD replicas
//!   resync      Resynchronise a DRBD disk
//!   storage     Storage backend management
//!   network     Network management
//!   cluster     Cluster membership
//!   node        Node information and settings
//!   drbd        DRBD management
//!   user        User and permission management
//! ```

mod cluster;
mod common;
mod drbd;
mod hard_drive;
mod network;
mod node;
mod storage;
mod user;
mod vm;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mcvirt_proto::McvResult;

use crate::common::{exit_error, Client, ConnectionArgs};

/// MCVirt cluster admin tool.
#[derive(Parser, Debug)]
#[command(name = "mcvirt", version, about = "MCVirt cluster admin tool")]
struct Cli {
    #[command(flatten)]
    conn: ConnectionArgs,

    /// Enable verbose/debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Authenticate and cache a session
    Login,
    /// Virtual machine management
    #[command(subcommand)]
    Vm(vm::VmCommands),
    /// Hard drive management
    #[command(subcommand)]
    HardDrive(hard_drive::HardDriveCommands),
    /// Verify DRBD replicas
    Verify(hard_drive::VerifyArgs),
    /// Resynchronise a DRBD disk
    Resync(hard_drive::ResyncArgs),
    /// Storage backend management
    #[command(subcommand)]
    Storage(storage::StorageCommands),
    /// Network management
    #[command(subcommand)]
    Network(network::NetworkCommands),
    /// Cluster membership
    #[command(subcommand)]
    Cluster(cluster::ClusterCommands),
    /// Node information and settings
    #[command(subcommand)]
    Node(node::NodeCommands),
    /// DRBD management
    #[command(subcommand)]
    Drbd(drbd::DrbdCommands),
    /// User and permission management
    #[command(subcommand)]
    User(user::UserCommands),
}

async fn dispatch(client: &Client, command: Commands) -> McvResult<()> {
    match command {
        Commands::Login => user::login(client).await,
        Commands::Vm(cmd) => vm::run(client, cmd).await,
        Commands::HardDrive(cmd) => hard_drive::run(client, cmd).await,
        Commands::Verify(args) => hard_drive::verify(client, args).await,
        Commands::Resync(args) => hard_drive::resync(client, args).await,
        Commands::Storage(cmd) => storage::run(client, cmd).await,
        Commands::Network(cmd) => network::run(client, cmd).await,
        Commands::Cluster(cmd) => cluster::run(client, cmd).await,
        Commands::Node(cmd) => node::run(client, cmd).await,
        Commands::Drbd(cmd) => drbd::run(client, cmd).await,
        Commands::User(cmd) => user::run(client, cmd).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let client = Client::new(&cli.conn);
    if let Err(e) = dispatch(&client, cli.command).await {
        exit_error(&e.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("mcvirt").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_global_connection_flags() {
        let cli = parse(&["vm", "list", "-a", "10.0.0.5", "-U", "admin", "-P", "pw", "--ignore-drbd"]);
        assert_eq!(cli.conn.address, "10.0.0.5");
        assert_eq!(cli.conn.username.as_deref(), Some("admin"));
        assert_eq!(cli.conn.password.as_deref(), Some("pw"));
        assert!(cli.conn.ignore_drbd);
        assert!(!cli.conn.ignore_cluster);
        assert!(matches!(cli.command, Commands::Vm(vm::VmCommands::List)));
    }

    #[test]
    fn test_verify_requires_vm_or_all() {
        let none = Cli::try_parse_from(["mcvirt", "verify"]);
        assert!(none.is_err());

        let cli = parse(&["verify", "--all"]);
        match cli.command {
            Commands::Verify(args) => assert!(args.all && args.vm.is_none()),
            other => panic!("unexpected command {:?}", other),
        }

        let cli = parse(&["verify", "vm1", "--disk-id", "2"]);
        match cli.command {
            Commands::Verify(args) => {
                assert_eq!(args.vm.as_deref(), Some("vm1"));
                assert_eq!(args.disk_id, 2);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_resync_source_conflicts_with_auto() {
        let res = Cli::try_parse_from([
            "mcvirt",
            "resync",
            "vm1",
            "--source-node",
            "n1",
            "--auto-determine",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn test_hard_drive_add_parses_size_and_type() {
        let cli = parse(&["hard-drive", "add", "vm1", "--size", "8G", "--storage-type", "drbd"]);
        match cli.command {
            Commands::HardDrive(hard_drive::HardDriveCommands::Add {
                vm,
                size,
                storage_type,
                ..
            }) => {
                assert_eq!(vm, "vm1");
                assert_eq!(size, 8 * 1024 * 1024 * 1024);
                assert_eq!(storage_type, Some(mcvirt_proto::hard_drive::HardDriveType::Drbd));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_storage_create_node_specs() {
        let cli = parse(&[
            "storage", "create", "fast", "--type", "lvm", "--node", "n1", "--node", "n2=vg_b",
        ]);
        match cli.command {
            Commands::Storage(storage::StorageCommands::Create {
                name,
                storage_type,
                nodes,
                shared,
                ..
            }) => {
                assert_eq!(name, "fast");
                assert_eq!(storage_type, mcvirt_proto::storage::StorageType::Lvm);
                assert_eq!(nodes, vec!["n1".to_string(), "n2=vg_b".to_string()]);
                assert!(!shared);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_user_grant_parses_permission() {
        let cli = parse(&["user", "grant", "alice", "manage-drbd"]);
        match cli.command {
            Commands::User(user::UserCommands::Grant { username, permission }) => {
                assert_eq!(username, "alice");
                assert_eq!(permission, mcvirt_proto::auth::Permission::ManageDrbd);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_unknown_storage_type_rejected() {
        assert!(Cli::try_parse_from(["mcvirt", "storage", "create", "x", "--type", "zfs"]).is_err());
    }
}
