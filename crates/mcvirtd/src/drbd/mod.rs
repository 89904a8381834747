//! DRBD node configuration and resource primitives.
//!
//! This module owns what lives on one node: the common config file, the
//! per-resource `.res` files and `drbdadm` calls against one resource.
//! The replicated hard-drive lifecycle built from these primitives is in
//! [`engine`].

pub mod engine;

use std::fmt::Write as _;
use std::path::PathBuf;

use tracing::{info, warn};

use mcvirt_proto::auth::Permission;
use mcvirt_proto::constants::DRBD_OUT_OF_SYNC_HANDLER;
use mcvirt_proto::defaults::DEFAULT_DRBD_GLOBAL_CONFIG;
use mcvirt_proto::drbd::{parse_pair, ConnectionState, DrbdNodeConfig, DrbdStatus, Role};
use mcvirt_proto::hard_drive::{HardDriveConfig, HardDriveInfo, HardDriveType};
use mcvirt_proto::request::{DrbdAction, DrbdOp, HardDriveOp};
use mcvirt_proto::{McvError, McvResult, Outcome, Reply, Request};

use crate::auth::generate_password;
use crate::context::CallContext;
use crate::daemon::NodeState;
use crate::remote::run_remote_command;
use crate::transaction::{execute_on, Function, Transaction};
use crate::volume::volume_path;

pub fn adm(hard_drive: &str, action: DrbdAction) -> Request {
    Request::Drbd(DrbdOp::Adm {
        hard_drive: hard_drive.to_string(),
        action,
    })
}

/// `drbdadm` arguments for an action on `resource`.
fn adm_args(action: DrbdAction, resource: &str) -> Vec<String> {
    let args: &[&str] = match action {
        DrbdAction::CreateMd => &["--", "--force", "create-md"],
        DrbdAction::Up => &["up"],
        DrbdAction::Down => &["down"],
        DrbdAction::Connect => &["connect"],
        DrbdAction::Disconnect => &["disconnect"],
        DrbdAction::Primary => &["primary"],
        DrbdAction::Secondary => &["secondary"],
        DrbdAction::OverwritePeer => &["--", "--overwrite-data-of-peer", "primary"],
        DrbdAction::Resize => &["resize"],
        DrbdAction::Verify => &["verify"],
        DrbdAction::InvalidateRemote => &["invalidate-remote"],
        DrbdAction::AllowTwoPrimaries => &["net-options", "--allow-two-primaries=yes"],
        DrbdAction::DisallowTwoPrimaries => &["net-options", "--allow-two-primaries=no"],
        DrbdAction::Adjust => &["adjust"],
    };
    let mut args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    args.push(resource.to_string());
    args
}

async fn drbdadm(node: &NodeState, args: &[String]) -> McvResult<String> {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    node.runner.run_ok("drbdadm", &args).await
}

fn resource_config_path(node: &NodeState, resource: &str) -> PathBuf {
    node.settings.drbd_config_dir.join(format!("{}.res", resource))
}

/// Render the common config every resource inherits.
pub fn render_global_config(config: &DrbdNodeConfig, secret: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "global {{");
    let _ = writeln!(out, "    usage-count no;");
    let _ = writeln!(out, "}}");
    let _ = writeln!(out);
    let _ = writeln!(out, "common {{");
    let _ = writeln!(out, "    handlers {{");
    let _ = writeln!(out, "        out-of-sync \"{}\";", DRBD_OUT_OF_SYNC_HANDLER);
    let _ = writeln!(out, "    }}");
    if let Some(rate) = &config.sync_rate {
        let _ = writeln!(out, "    disk {{");
        let _ = writeln!(out, "        resync-rate {};", rate);
        let _ = writeln!(out, "    }}");
    }
    let _ = writeln!(out, "    net {{");
    let _ = writeln!(out, "        protocol {};", config.protocol);
    let _ = writeln!(out, "        cram-hmac-alg sha1;");
    let _ = writeln!(out, "        shared-secret \"{}\";", secret);
    let _ = writeln!(out, "        verify-alg md5;");
    let _ = writeln!(out, "    }}");
    let _ = writeln!(out, "}}");
    out
}

/// One `on <host>` section of a resource file.
pub struct ResourceHost {
    pub hostname: String,
    pub disk: String,
    pub meta_disk: String,
    pub address: String,
}

pub fn render_resource(resource: &str, device: &str, port: u16, hosts: &[ResourceHost]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "resource {} {{", resource);
    for host in hosts {
        let _ = writeln!(out, "    on {} {{", host.hostname);
        let _ = writeln!(out, "        device {};", device);
        let _ = writeln!(out, "        disk {};", host.disk);
        let _ = writeln!(out, "        meta-disk {};", host.meta_disk);
        let _ = writeln!(out, "        address {}:{};", host.address, port);
        let _ = writeln!(out, "    }}");
    }
    let _ = writeln!(out, "}}");
    out
}

async fn resource_file(node: &NodeState, hdd: &HardDriveConfig) -> McvResult<String> {
    let drbd = hdd.drbd()?;
    let sb = node.config.storage_backend(&hdd.storage_backend).await?;
    let meta = hdd
        .meta_volume()
        .ok_or_else(|| McvError::InvalidArguments(format!("{} has no metadata volume", hdd.id)))?;
    let mut hosts = Vec::with_capacity(hdd.nodes.len());
    for host in &hdd.nodes {
        hosts.push(ResourceHost {
            hostname: host.clone(),
            disk: volume_path(&sb, host, &hdd.raw_volume())?,
            meta_disk: volume_path(&sb, host, &meta)?,
            address: node.node_ip(host).await?,
        });
    }
    Ok(render_resource(
        &drbd.resource_name,
        &drbd.block_device_path(),
        drbd.port,
        &hosts,
    ))
}

async fn read_status(node: &NodeState, resource: &str) -> McvResult<DrbdStatus> {
    let resource = resource.to_string();
    let connection: ConnectionState = drbdadm(node, &["cstate".into(), resource.clone()])
        .await?
        .trim()
        .parse()?;
    let (local_role, remote_role) = parse_pair(&drbdadm(node, &["role".into(), resource.clone()]).await?)?;
    let (local_disk, remote_disk) = parse_pair(&drbdadm(node, &["dstate".into(), resource]).await?)?;
    Ok(DrbdStatus {
        connection,
        local_role,
        remote_role,
        local_disk,
        remote_disk,
    })
}

/// DRBD status of a hard drive as seen from `host`.
pub async fn status_on(node: &NodeState, ctx: &CallContext, host: &str, hard_drive: &str) -> McvResult<DrbdStatus> {
    execute_on(
        node,
        ctx,
        host,
        Request::Drbd(DrbdOp::Status {
            hard_drive: hard_drive.to_string(),
        }),
    )
    .await?
    .reply
    .into_drbd_status()
}

async fn enable_local(node: &NodeState, ctx: &CallContext, secret: &str) -> McvResult<()> {
    let global = node.config.global.get().await;
    let content = render_global_config(&global.drbd, secret);
    let path = node.settings.drbd_config_dir.join(DEFAULT_DRBD_GLOBAL_CONFIG);
    tokio::fs::create_dir_all(&node.settings.drbd_config_dir).await?;
    tokio::fs::write(&path, content)
        .await
        .map_err(|e| McvError::Io(format!("write {}: {}", path.display(), e)))?;
    node.config
        .global
        .update(&ctx.user, "enable DRBD", |cfg| {
            cfg.drbd.enabled = true;
            cfg.drbd.secret = Some(secret.to_string());
            Ok(())
        })
        .await?;
    info!("DRBD enabled");
    Ok(())
}

pub async fn handle(node: &NodeState, ctx: &CallContext, op: DrbdOp) -> McvResult<Outcome> {
    match op {
        DrbdOp::Enable { secret } => {
            ctx.assert_permission(Permission::ManageDrbd)?;
            if node.drbd_enabled().await {
                return Err(McvError::DrbdAlreadyEnabled(node.hostname.clone()));
            }
            let nodes = node.all_nodes().await;
            let installed = run_remote_command(node, ctx, &nodes, Request::Drbd(DrbdOp::IsInstalled)).await;
            for (host, result) in installed {
                if !result?.into_bool()? {
                    return Err(McvError::DrbdNotInstalled(host));
                }
            }
            let secret = secret.unwrap_or_else(generate_password);
            let tx = Transaction::begin(ctx);
            let result = Function::new(Request::Drbd(DrbdOp::EnableLocal { secret }))
                .on(nodes)
                .run_all(node, ctx)
                .await;
            tx.settle(node, ctx, result).await?;
            Ok(Outcome::unit())
        }

        DrbdOp::List => {
            let disks = node
                .config
                .hard_drives
                .list()
                .await
                .into_iter()
                .filter(|hdd| hdd.disk_type == HardDriveType::Drbd)
                .map(|hdd| HardDriveInfo {
                    id: hdd.id,
                    disk_type: hdd.disk_type,
                    driver: hdd.driver,
                    storage_backend: hdd.storage_backend,
                    vm: hdd.vm,
                    disk_number: hdd.disk_number,
                    nodes: hdd.nodes,
                    size: None,
                    drbd: hdd.drbd,
                })
                .collect();
            Ok(Outcome::reply(Reply::HardDrives(disks)))
        }

        DrbdOp::OutOfSync { resource } => {
            ctx.assert_permission(Permission::ManageDrbd)?;
            let hdd = node
                .config
                .hard_drives
                .list()
                .await
                .into_iter()
                .find(|hdd| hdd.drbd.as_ref().map(|d| d.resource_name.as_str()) == Some(resource.as_str()))
                .ok_or_else(|| McvError::HardDriveDoesNotExist(resource.clone()))?;
            warn!("DRBD reports {} out of sync", resource);
            engine::set_sync_state(node, ctx, &hdd.id, false).await?;
            Ok(Outcome::unit())
        }

        DrbdOp::EnableLocal { secret } => {
            enable_local(node, ctx, &secret).await?;
            Ok(Outcome::unit())
        }

        DrbdOp::IsInstalled => {
            let output = node.runner.run("which", &["drbdadm"]).await?;
            Ok(Outcome::reply(Reply::Bool(output.success())))
        }

        DrbdOp::Adm { hard_drive, action } => {
            let hdd = node.config.hard_drive(&hard_drive).await?;
            let resource = hdd.drbd()?.resource_name.clone();
            let args = adm_args(action, &resource);
            match drbdadm(node, &args).await {
                Ok(_) => {}
                Err(e) if action == DrbdAction::Down => {
                    warn!("drbdadm down {} failed ({}), retrying", resource, e);
                    tokio::time::sleep(node.settings.timings.drbd_down_retry).await;
                    drbdadm(node, &args).await?;
                }
                Err(e) => return Err(e),
            }
            let outcome = Outcome::unit();
            Ok(match action.inverse() {
                Some(inverse) => outcome.with_compensation(adm(&hard_drive, inverse)),
                None => outcome,
            })
        }

        DrbdOp::WriteResourceConfig { hard_drive } => {
            let hdd = node.config.hard_drive(&hard_drive).await?;
            let content = resource_file(node, &hdd).await?;
            let path = resource_config_path(node, &hdd.drbd()?.resource_name);
            let existed = tokio::fs::try_exists(&path).await.unwrap_or(false);
            tokio::fs::create_dir_all(&node.settings.drbd_config_dir).await?;
            tokio::fs::write(&path, content)
                .await
                .map_err(|e| McvError::Io(format!("write {}: {}", path.display(), e)))?;
            let outcome = Outcome::unit();
            Ok(if existed {
                outcome
            } else {
                outcome.with_compensation(Request::Drbd(DrbdOp::RemoveResourceConfig { hard_drive }))
            })
        }

        DrbdOp::RemoveResourceConfig { hard_drive } => {
            let hdd = node.config.hard_drive(&hard_drive).await?;
            let path = resource_config_path(node, &hdd.drbd()?.resource_name);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(Outcome::unit());
            }
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| McvError::Io(format!("remove {}: {}", path.display(), e)))?;
            Ok(Outcome::unit().with_compensation(Request::Drbd(DrbdOp::WriteResourceConfig { hard_drive })))
        }

        DrbdOp::Status { hard_drive } => {
            let hdd = node.config.hard_drive(&hard_drive).await?;
            let status = read_status(node, &hdd.drbd()?.resource_name).await?;
            Ok(Outcome::reply(Reply::DrbdStatus(status)))
        }

        DrbdOp::WaitSecondary { hard_drive } => {
            let hdd = node.config.hard_drive(&hard_drive).await?;
            let resource = hdd.drbd()?.resource_name.clone();
            let timings = &node.settings.timings;
            for _ in 0..timings.attempts(timings.role_change_wait) {
                let status = read_status(node, &resource).await?;
                if status.local_role == Role::Secondary {
                    return Ok(Outcome::unit());
                }
                tokio::time::sleep(timings.poll_interval).await;
            }
            let status = read_status(node, &resource).await?;
            if status.local_role == Role::Secondary {
                return Ok(Outcome::unit());
            }
            Err(McvError::DrbdStateBad {
                resource,
                state: status.to_string(),
            })
        }
    }
}

/// Request that replaces the config of a hard drive on one node.
pub fn put_hard_drive(hdd: &HardDriveConfig) -> Request {
    Request::HardDrive(HardDriveOp::PutConfig {
        id: hdd.id.clone(),
        config: Some(hdd.clone()),
    })
}
