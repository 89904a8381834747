//! Volume manager.
//!
//! Purely local volume primitives on one storage backend: LVM logical
//! volumes for `Lvm` backends, raw image files for `File` backends. Every
//! operation shells out through the node's `CommandRunner`. Multi-node
//! use goes through `Function`s built from [`VolumeOp`] requests.

use tracing::{debug, info};

use mcvirt_core::command::command_line;
use mcvirt_proto::constants::MIB;
use mcvirt_proto::request::{VolumeOp, VolumeRef};
use mcvirt_proto::storage::{StorageBackendConfig, StorageType};
use mcvirt_proto::{McvError, McvResult, Outcome, Reply, Request};

use crate::context::CallContext;
use crate::daemon::NodeState;
use crate::transaction::execute_on;

/// A volume resolved against the local node's view of its backend.
struct LocalVolume {
    storage_type: StorageType,
    /// Volume group name or directory.
    location: String,
    name: String,
}

impl LocalVolume {
    fn path(&self) -> String {
        match self.storage_type {
            StorageType::Lvm => format!("/dev/{}/{}", self.location, self.name),
            StorageType::File => format!("{}/{}", self.location.trim_end_matches('/'), self.name),
        }
    }

    /// `vg/lv`, as LVM commands address a volume.
    fn lv(&self) -> String {
        format!("{}/{}", self.location, self.name)
    }
}

/// Path of `volume` on `host`.
pub fn volume_path(sb: &StorageBackendConfig, host: &str, name: &str) -> McvResult<String> {
    let location = sb
        .location_on(host)
        .ok_or_else(|| McvError::StorageBackendNotAvailableOnNode {
            backend: sb.name.clone(),
            node: host.to_string(),
        })?;
    Ok(LocalVolume {
        storage_type: sb.storage_type,
        location: location.to_string(),
        name: name.to_string(),
    }
    .path())
}

async fn resolve(node: &NodeState, volume: &VolumeRef) -> McvResult<LocalVolume> {
    let sb = node.config.storage_backend(&volume.backend).await?;
    let location = sb
        .location_on(&node.hostname)
        .ok_or_else(|| McvError::StorageBackendNotAvailableOnNode {
            backend: sb.name.clone(),
            node: node.hostname.clone(),
        })?;
    Ok(LocalVolume {
        storage_type: sb.storage_type,
        location: location.to_string(),
        name: volume.name.clone(),
    })
}

async fn run(node: &NodeState, program: &str, args: &[&str]) -> McvResult<String> {
    node.runner.run_ok(program, args).await
}

fn parse_number(output: &str, what: &str) -> McvResult<u64> {
    output
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| !l.is_empty())
        .and_then(|l| l.parse().ok())
        .ok_or_else(|| {
            McvError::ExternalStorageCommandError(format!("could not parse {} from '{}'", what, output.trim()))
        })
}

async fn exists(node: &NodeState, vol: &LocalVolume) -> McvResult<bool> {
    let output = match vol.storage_type {
        StorageType::Lvm => node.runner.run("lvs", &["--noheadings", &vol.lv()]).await?,
        StorageType::File => node.runner.run("test", &["-e", &vol.path()]).await?,
    };
    Ok(output.success())
}

async fn ensure_exists(node: &NodeState, vol: &LocalVolume) -> McvResult<()> {
    if exists(node, vol).await? {
        Ok(())
    } else {
        Err(McvError::VolumeDoesNotExist(vol.lv()))
    }
}

async fn is_active(node: &NodeState, vol: &LocalVolume) -> McvResult<bool> {
    match vol.storage_type {
        StorageType::Lvm => {
            let attr = run(node, "lvs", &["--noheadings", "-o", "lv_attr", &vol.lv()]).await?;
            Ok(attr.trim().chars().nth(4) == Some('a'))
        }
        StorageType::File => Ok(true),
    }
}

async fn size(node: &NodeState, vol: &LocalVolume) -> McvResult<u64> {
    let path = vol.path();
    match vol.storage_type {
        StorageType::Lvm => parse_number(&run(node, "blockdev", &["--getsize64", &path]).await?, "size"),
        StorageType::File => parse_number(&run(node, "stat", &["-c", "%s", &path]).await?, "size"),
    }
}

async fn sector_size(node: &NodeState, vol: &LocalVolume) -> McvResult<u64> {
    match vol.storage_type {
        StorageType::Lvm => {
            parse_number(&run(node, "blockdev", &["--getss", &vol.path()]).await?, "sector size")
        }
        StorageType::File => Ok(512),
    }
}

async fn create(node: &NodeState, vol: &LocalVolume, size: u64) -> McvResult<()> {
    let size_arg = format!("{}B", size);
    match vol.storage_type {
        StorageType::Lvm => {
            let args = ["--yes", "-n", vol.name.as_str(), "-L", size_arg.as_str(), vol.location.as_str()];
            let output = node.runner.run("lvcreate", &args).await?;
            if output.success() {
                return Ok(());
            }
            if output.stderr.contains("already exists") {
                return Err(McvError::VolumeAlreadyExists(vol.lv()));
            }
            Err(McvError::ExternalStorageCommandError(format!(
                "{}: {}",
                command_line("lvcreate", &args),
                output.stderr.trim()
            )))
        }
        StorageType::File => {
            if exists(node, vol).await? {
                return Err(McvError::VolumeAlreadyExists(vol.path()));
            }
            run(node, "truncate", &["-s", &size.to_string(), &vol.path()]).await?;
            Ok(())
        }
    }
}

async fn delete(node: &NodeState, vol: &LocalVolume, ignore_missing: bool) -> McvResult<()> {
    if !exists(node, vol).await? {
        if ignore_missing {
            debug!("volume {} already absent", vol.lv());
            return Ok(());
        }
        return Err(McvError::VolumeDoesNotExist(vol.lv()));
    }
    match vol.storage_type {
        StorageType::Lvm => run(node, "lvremove", &["-f", &vol.lv()]).await?,
        StorageType::File => run(node, "rm", &["-f", &vol.path()]).await?,
    };
    Ok(())
}

/// Free bytes on the backend's location on this node.
async fn free_space(node: &NodeState, storage_type: StorageType, location: &str) -> McvResult<u64> {
    match storage_type {
        StorageType::Lvm => parse_number(
            &run(node, "vgs", &["--noheadings", "--units", "b", "--nosuffix", "-o", "vg_free", location]).await?,
            "free space",
        ),
        StorageType::File => parse_number(
            &run(node, "df", &["--output=avail", "-B1", location]).await?,
            "free space",
        ),
    }
}

pub async fn handle(node: &NodeState, _ctx: &CallContext, op: VolumeOp) -> McvResult<Outcome> {
    match op {
        VolumeOp::Create { volume, size } => {
            let vol = resolve(node, &volume).await?;
            create(node, &vol, size).await?;
            info!("created volume {} ({} bytes)", volume, size);
            Ok(Outcome::unit().with_compensation(Request::Volume(VolumeOp::Delete {
                volume,
                ignore_missing: true,
            })))
        }

        VolumeOp::Delete {
            volume,
            ignore_missing,
        } => {
            let vol = resolve(node, &volume).await?;
            delete(node, &vol, ignore_missing).await?;
            info!("deleted volume {}", volume);
            Ok(Outcome::unit())
        }

        VolumeOp::Activate { volume } => {
            let vol = resolve(node, &volume).await?;
            ensure_exists(node, &vol).await?;
            if is_active(node, &vol).await? {
                return Ok(Outcome::unit());
            }
            run(node, "lvchange", &["-ay", &vol.lv()]).await?;
            Ok(Outcome::unit().with_compensation(Request::Volume(VolumeOp::Deactivate { volume })))
        }

        VolumeOp::Deactivate { volume } => {
            let vol = resolve(node, &volume).await?;
            if vol.storage_type == StorageType::Lvm && exists(node, &vol).await? {
                run(node, "lvchange", &["-an", &vol.lv()]).await?;
            }
            Ok(Outcome::unit())
        }

        VolumeOp::Wipe { volume } => {
            let vol = resolve(node, &volume).await?;
            ensure_exists(node, &vol).await?;
            if !is_active(node, &vol).await? {
                return Err(McvError::VolumeIsNotActive(vol.lv()));
            }
            let count = size(node, &vol).await?.div_ceil(MIB).to_string();
            let of = format!("of={}", vol.path());
            let count = format!("count={}", count);
            run(node, "dd", &["if=/dev/zero", &of, "bs=1M", &count, "conv=fsync"]).await?;
            Ok(Outcome::unit())
        }

        VolumeOp::Resize {
            volume,
            delta,
            increase,
        } => {
            let vol = resolve(node, &volume).await?;
            ensure_exists(node, &vol).await?;
            match (vol.storage_type, increase) {
                (StorageType::Lvm, true) => {
                    run(node, "lvextend", &["-L", &format!("+{}B", delta), &vol.lv()]).await?
                }
                (StorageType::Lvm, false) => {
                    run(node, "lvreduce", &["-f", "-L", &format!("-{}B", delta), &vol.lv()]).await?
                }
                (StorageType::File, true) => {
                    run(node, "truncate", &["-s", &format!("+{}", delta), &vol.path()]).await?
                }
                (StorageType::File, false) => {
                    run(node, "truncate", &["-s", &format!("-{}", delta), &vol.path()]).await?
                }
            };
            Ok(Outcome::unit().with_compensation(Request::Volume(VolumeOp::Resize {
                volume,
                delta,
                increase: !increase,
            })))
        }

        VolumeOp::Snapshot { volume, dest, size } => {
            let vol = resolve(node, &volume).await?;
            ensure_exists(node, &vol).await?;
            let target = LocalVolume {
                storage_type: vol.storage_type,
                location: vol.location.clone(),
                name: dest.clone(),
            };
            match vol.storage_type {
                StorageType::Lvm => {
                    let size_arg = format!("{}B", size);
                    run(node, "lvcreate", &["--snapshot", "-n", &dest, "-L", &size_arg, &vol.lv()]).await?
                }
                StorageType::File => {
                    if exists(node, &target).await? {
                        return Err(McvError::VolumeAlreadyExists(target.path()));
                    }
                    run(node, "cp", &["--sparse=always", &vol.path(), &target.path()]).await?
                }
            };
            info!("snapshot of {} created as {}", volume, dest);
            Ok(Outcome::reply(Reply::Text(target.path())).with_compensation(Request::Volume(
                VolumeOp::Delete {
                    volume: VolumeRef::new(&volume.backend, &dest),
                    ignore_missing: true,
                },
            )))
        }

        VolumeOp::Copy { source, dest } => {
            let src = resolve(node, &source).await?;
            let dst = resolve(node, &dest).await?;
            ensure_exists(node, &src).await?;
            ensure_exists(node, &dst).await?;
            let src_size = size(node, &src).await?;
            let dst_size = size(node, &dst).await?;
            if dst_size < src_size {
                return Err(McvError::InconsistentVolumeSize(format!(
                    "{} ({} bytes) does not fit in {} ({} bytes)",
                    source, src_size, dest, dst_size
                )));
            }
            let input = format!("if={}", src.path());
            let output = format!("of={}", dst.path());
            run(node, "dd", &[&input, &output, "bs=1M", "conv=fsync"]).await?;
            Ok(Outcome::unit())
        }

        VolumeOp::Size { volume } => {
            let vol = resolve(node, &volume).await?;
            Ok(Outcome::reply(Reply::Size(size(node, &vol).await?)))
        }

        VolumeOp::Sectors { volume } => {
            let vol = resolve(node, &volume).await?;
            let bytes = size(node, &vol).await?;
            let sector = sector_size(node, &vol).await?.max(1);
            Ok(Outcome::reply(Reply::Size(bytes / sector)))
        }

        VolumeOp::SectorSize { volume } => {
            let vol = resolve(node, &volume).await?;
            Ok(Outcome::reply(Reply::Size(sector_size(node, &vol).await?)))
        }

        VolumeOp::Exists { volume } => {
            let vol = resolve(node, &volume).await?;
            Ok(Outcome::reply(Reply::Bool(exists(node, &vol).await?)))
        }

        VolumeOp::Path { volume } => {
            let vol = resolve(node, &volume).await?;
            Ok(Outcome::reply(Reply::Text(vol.path())))
        }

        VolumeOp::FreeSpace { backend } => {
            let sb = node.config.storage_backend(&backend).await?;
            let location = sb.location_on(&node.hostname).ok_or_else(|| {
                McvError::StorageBackendNotAvailableOnNode {
                    backend: sb.name.clone(),
                    node: node.hostname.clone(),
                }
            })?;
            Ok(Outcome::reply(Reply::Size(free_space(node, sb.storage_type, location).await?)))
        }
    }
}

/// Pre-flight check that a backend location is usable on this node.
pub async fn check_location(node: &NodeState, storage_type: StorageType, location: &str) -> McvResult<()> {
    let usable = match storage_type {
        StorageType::Lvm => node.runner.run("vgs", &["--noheadings", location]).await?.success(),
        StorageType::File => {
            node.runner.run("test", &["-d", location]).await?.success()
                && node
                    .runner
                    .run("runuser", &["-u", "libvirt-qemu", "--", "test", "-r", location])
                    .await?
                    .success()
        }
    };
    if usable {
        Ok(())
    } else {
        Err(McvError::InvalidStorageLocation(format!(
            "{} {} is not usable on {}",
            storage_type, location, node.hostname
        )))
    }
}

// ─── Helpers for engines ────────────────────────────────────────────────────

/// Size of a volume as reported by `host`.
pub async fn size_on(node: &NodeState, ctx: &CallContext, host: &str, volume: &VolumeRef) -> McvResult<u64> {
    execute_on(node, ctx, host, Request::Volume(VolumeOp::Size { volume: volume.clone() }))
        .await?
        .reply
        .into_size()
}

/// Sector count and sector size of a volume on `host`.
pub async fn geometry_on(
    node: &NodeState,
    ctx: &CallContext,
    host: &str,
    volume: &VolumeRef,
) -> McvResult<(u64, u64)> {
    let sectors = execute_on(node, ctx, host, Request::Volume(VolumeOp::Sectors { volume: volume.clone() }))
        .await?
        .reply
        .into_size()?;
    let sector_size = execute_on(
        node,
        ctx,
        host,
        Request::Volume(VolumeOp::SectorSize { volume: volume.clone() }),
    )
    .await?
    .reply
    .into_size()?;
    Ok((sectors, sector_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcvirt_core::command::CommandOutput;

    use crate::testutil::{single_node_with_backend, TEST_VG};

    fn vol(name: &str) -> VolumeRef {
        VolumeRef::new("sb-test", name)
    }

    #[tokio::test]
    async fn test_create_and_compensation() {
        let node = single_node_with_backend("n1").await;
        let ctx = CallContext::internal();
        let outcome = handle(&node, &ctx, VolumeOp::Create { volume: vol("disk"), size: 4 * MIB })
            .await
            .unwrap();
        assert!(node
            .runner
            .ran(&format!("lvcreate --yes -n disk -L 4194304B {}", TEST_VG)));
        assert_eq!(
            outcome.compensation.map(|b| *b),
            Some(Request::Volume(VolumeOp::Delete {
                volume: vol("disk"),
                ignore_missing: true
            }))
        );
    }

    #[tokio::test]
    async fn test_create_existing_volume() {
        let node = single_node_with_backend("n1").await;
        node.runner.respond(
            "lvcreate",
            CommandOutput::failed(5, "  Logical volume \"disk\" already exists in volume group"),
        );
        let err = handle(&node, &CallContext::internal(), VolumeOp::Create { volume: vol("disk"), size: MIB })
            .await
            .unwrap_err();
        assert!(matches!(err, McvError::VolumeAlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_delete_ignore_missing() {
        let node = single_node_with_backend("n1").await;
        node.runner.respond("lvs --noheadings", CommandOutput::failed(5, "not found"));
        let ctx = CallContext::internal();
        handle(&node, &ctx, VolumeOp::Delete { volume: vol("gone"), ignore_missing: true })
            .await
            .unwrap();
        assert!(!node.runner.ran("lvremove"));
        let err = handle(&node, &ctx, VolumeOp::Delete { volume: vol("gone"), ignore_missing: false })
            .await
            .unwrap_err();
        assert!(matches!(err, McvError::VolumeDoesNotExist(_)));
    }

    #[tokio::test]
    async fn test_activate_is_noop_when_active() {
        let node = single_node_with_backend("n1").await;
        node.runner
            .respond("lvs --noheadings -o lv_attr", CommandOutput::ok("  -wi-a-----\n"));
        let outcome = handle(&node, &CallContext::internal(), VolumeOp::Activate { volume: vol("disk") })
            .await
            .unwrap();
        assert!(outcome.compensation.is_none());
        assert!(!node.runner.ran("lvchange"));
    }

    #[tokio::test]
    async fn test_sectors_from_size() {
        let node = single_node_with_backend("n1").await;
        node.runner.respond("blockdev --getsize64", CommandOutput::ok("1048576\n"));
        node.runner.respond("blockdev --getss", CommandOutput::ok("4096\n"));
        let outcome = handle(&node, &CallContext::internal(), VolumeOp::Sectors { volume: vol("disk") })
            .await
            .unwrap();
        assert_eq!(outcome.reply, Reply::Size(256));
    }

    #[test]
    fn test_paths() {
        let lvm = LocalVolume {
            storage_type: StorageType::Lvm,
            location: "vg_mcvirt".into(),
            name: "disk".into(),
        };
        assert_eq!(lvm.path(), "/dev/vg_mcvirt/disk");
        let file = LocalVolume {
            storage_type: StorageType::File,
            location: "/var/lib/images/".into(),
            name: "disk".into(),
        };
        assert_eq!(file.path(), "/var/lib/images/disk");
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("  1024\n", "size").unwrap(), 1024);
        assert_eq!(parse_number("Avail\n2048\n", "free").unwrap(), 2048);
        assert!(parse_number("", "size").is_err());
    }
}
