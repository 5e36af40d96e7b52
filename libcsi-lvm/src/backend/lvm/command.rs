//! [`LvmAdapter`] backed by the lvm2 command-line tools.
//!
//! Reports are requested as JSON (`--reportformat json --units b --nosuffix`)
//! so sizes and names are read from structured output.  Exit codes decide
//! success; standard error is only carried along for operators.

use std::path::Path;

use async_trait::async_trait;
use nix::mount::MsFlags;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::adapter::{
    BackendError, LogicalVolume, LogicalVolumeSpec, LvmAdapter, MountPoint, MountRequest,
    TAG_READY, VolumeGroupStatus,
};

/// `blkid -p` exit status when the device carries no recognizable signature.
const BLKID_NO_SIGNATURE: i32 = 2;

/// Adapter running `vgs`, `lvs`, `lvcreate`, `lvremove`, `lvextend`, `blkid`,
/// `lvchange`, `mkfs.*` and `dd` on the local host.
#[derive(Debug, Clone, Default)]
pub struct CommandAdapter;

impl CommandAdapter {
    pub fn new() -> Self {
        Self
    }
}

/// Run `program` and return its standard output, failing on a non-zero exit.
///
/// Dropping the returned future kills the child.
async fn run(program: &str, args: &[&str]) -> Result<Vec<u8>, BackendError> {
    debug!(program, ?args, "running command");
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| BackendError::Io {
            context: format!("spawn {program}"),
            source,
        })?;

    if !output.status.success() {
        return Err(BackendError::CommandFailed {
            command: format!("{program} {}", args.join(" ")),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    Ok(output.stdout)
}

// ---------------------------------------------------------------------------
// Report parsing
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct Report<T> {
    report: Vec<T>,
}

#[derive(Deserialize)]
struct VgSection {
    #[serde(default)]
    vg: Vec<VgRow>,
}

#[derive(Deserialize)]
struct VgRow {
    vg_name: String,
    vg_size: String,
    vg_free: String,
    vg_extent_size: String,
}

#[derive(Deserialize)]
struct LvSection {
    #[serde(default)]
    lv: Vec<LvRow>,
}

#[derive(Deserialize)]
struct LvRow {
    lv_name: String,
    vg_name: String,
    lv_size: String,
    #[serde(default)]
    lv_path: String,
    #[serde(default)]
    lv_tags: String,
}

fn parse_bytes(what: &str, value: &str) -> Result<u64, BackendError> {
    value.trim().parse().map_err(|e| BackendError::Parse {
        what: what.to_owned(),
        reason: format!("{value:?}: {e}"),
    })
}

fn parse_vgs(stdout: &[u8]) -> Result<Vec<VolumeGroupStatus>, BackendError> {
    let report: Report<VgSection> =
        serde_json::from_slice(stdout).map_err(|e| BackendError::Parse {
            what: "vgs report".to_owned(),
            reason: e.to_string(),
        })?;

    report
        .report
        .into_iter()
        .flat_map(|section| section.vg)
        .map(|row| {
            Ok(VolumeGroupStatus {
                extent_bytes: parse_bytes("vg_extent_size", &row.vg_extent_size)?,
                size_bytes: parse_bytes("vg_size", &row.vg_size)?,
                free_bytes: parse_bytes("vg_free", &row.vg_free)?,
                name: row.vg_name,
            })
        })
        .collect()
}

fn parse_lvs(stdout: &[u8]) -> Result<Vec<LogicalVolume>, BackendError> {
    let report: Report<LvSection> =
        serde_json::from_slice(stdout).map_err(|e| BackendError::Parse {
            what: "lvs report".to_owned(),
            reason: e.to_string(),
        })?;

    report
        .report
        .into_iter()
        .flat_map(|section| section.lv)
        .map(|row| {
            let device_path = if row.lv_path.is_empty() {
                format!("/dev/{}/{}", row.vg_name, row.lv_name)
            } else {
                row.lv_path
            };
            Ok(LogicalVolume {
                size_bytes: parse_bytes("lv_size", &row.lv_size)?,
                tags: row
                    .lv_tags
                    .split(',')
                    .filter(|t| !t.is_empty())
                    .map(str::to_owned)
                    .collect(),
                name: row.lv_name,
                volume_group: row.vg_name,
                device_path,
            })
        })
        .collect()
}

/// The last mount of `target` in a `/proc/self/mounts` listing.
///
/// `/proc/self/mounts` escapes whitespace in paths (`\040`); target paths
/// handed to the driver never contain whitespace, so fields are compared
/// verbatim.
fn parse_mounts(contents: &str, target: &str) -> Option<MountPoint> {
    // Format: <device> <mountpoint> <fstype> <options> <dump> <pass>
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next()?;
            let options = fields.next().unwrap_or_default();
            (mount_point == target).then(|| MountPoint {
                source: source.to_owned(),
                target: mount_point.to_owned(),
                fs_type: fs_type.to_owned(),
                read_only: options.split(',').any(|o| o == "ro"),
            })
        })
        .last()
}

async fn canonicalize(path: &str) -> Result<String, BackendError> {
    tokio::fs::canonicalize(path)
        .await
        .map(|p| p.to_string_lossy().into_owned())
        .map_err(|source| BackendError::Io {
            context: format!("canonicalize {path}"),
            source,
        })
}

async fn ensure_dir(path: &str) -> Result<(), BackendError> {
    tokio::fs::create_dir_all(Path::new(path))
        .await
        .map_err(|e| BackendError::Mount {
            path: path.to_owned(),
            reason: format!("create mount point: {e}"),
        })
}

impl CommandAdapter {
    /// Filesystem signature on `device`, `None` when the device is blank.
    async fn filesystem_of(&self, device: &str) -> Result<Option<String>, BackendError> {
        let output = Command::new("blkid")
            .args(["-p", "-s", "TYPE", "-o", "value", device])
            .output()
            .await
            .map_err(|source| BackendError::Io {
                context: "spawn blkid".to_owned(),
                source,
            })?;

        match output.status.code() {
            Some(0) => {
                let fs = String::from_utf8_lossy(&output.stdout).trim().to_owned();
                Ok((!fs.is_empty()).then_some(fs))
            }
            Some(BLKID_NO_SIGNATURE) => Ok(None),
            _ => Err(BackendError::CommandFailed {
                command: format!("blkid -p {device}"),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            }),
        }
    }

    async fn make_filesystem(&self, device: &str, fs_type: &str) -> Result<(), BackendError> {
        let program = format!("mkfs.{fs_type}");
        let args: Vec<&str> = match fs_type {
            "ext2" | "ext3" | "ext4" => vec!["-F", device],
            _ => vec![device],
        };
        run(&program, &args).await?;
        info!(%device, %fs_type, "filesystem created");
        Ok(())
    }
}

#[async_trait]
impl LvmAdapter for CommandAdapter {
    async fn volume_group(&self, volume_group: &str) -> Result<VolumeGroupStatus, BackendError> {
        let stdout = run(
            "vgs",
            &[
                "--reportformat",
                "json",
                "--units",
                "b",
                "--nosuffix",
                "-o",
                "vg_name,vg_size,vg_free,vg_extent_size",
            ],
        )
        .await?;

        parse_vgs(&stdout)?
            .into_iter()
            .find(|vg| vg.name == volume_group)
            .ok_or_else(|| BackendError::NotFound(format!("volume group {volume_group}")))
    }

    async fn list_logical_volumes(
        &self,
        volume_group: &str,
    ) -> Result<Vec<LogicalVolume>, BackendError> {
        let stdout = run(
            "lvs",
            &[
                "--reportformat",
                "json",
                "--units",
                "b",
                "--nosuffix",
                "-o",
                "lv_name,vg_name,lv_size,lv_path,lv_tags",
            ],
        )
        .await?;

        Ok(parse_lvs(&stdout)?
            .into_iter()
            .filter(|lv| lv.volume_group == volume_group)
            .collect())
    }

    async fn create_logical_volume(
        &self,
        spec: &LogicalVolumeSpec,
    ) -> Result<LogicalVolume, BackendError> {
        let size = format!("{}b", spec.size_bytes);
        let mut args = vec![
            "--yes",
            "--wipesignatures",
            "y",
            "-L",
            size.as_str(),
            "-n",
            spec.name.as_str(),
        ];
        for tag in &spec.tags {
            args.extend(["--addtag", tag.as_str()]);
        }
        args.push(spec.volume_group.as_str());
        run("lvcreate", &args).await?;

        self.find_logical_volume(&spec.volume_group, &spec.name)
            .await?
            .ok_or_else(|| {
                BackendError::NotFound(format!(
                    "logical volume {}/{} after lvcreate",
                    spec.volume_group, spec.name
                ))
            })
    }

    async fn create_snapshot(
        &self,
        spec: &LogicalVolumeSpec,
        origin: &str,
    ) -> Result<LogicalVolume, BackendError> {
        let source = self
            .find_logical_volume(&spec.volume_group, origin)
            .await?
            .ok_or_else(|| {
                BackendError::NotFound(format!("logical volume {}/{origin}", spec.volume_group))
            })?;

        let mut copy = self.create_logical_volume(spec).await?;

        let input = format!("if={}", source.device_path);
        let output = format!("of={}", copy.device_path);
        let copied = run(
            "dd",
            &[
                input.as_str(),
                output.as_str(),
                "bs=4M",
                "conv=fsync",
                "status=none",
            ],
        )
        .await;

        if let Err(e) = copied {
            // Do not leave a half-copied snapshot behind.
            if let Err(cleanup) = self
                .remove_logical_volume(&spec.volume_group, &spec.name)
                .await
            {
                warn!(lv = %spec.name, error = %cleanup, "failed to remove partial snapshot copy");
            }
            return Err(e);
        }

        let target = format!("{}/{}", spec.volume_group, spec.name);
        run("lvchange", &["--addtag", TAG_READY, target.as_str()]).await?;
        copy.tags.push(TAG_READY.to_owned());
        Ok(copy)
    }

    async fn remove_logical_volume(
        &self,
        volume_group: &str,
        name: &str,
    ) -> Result<(), BackendError> {
        if self.find_logical_volume(volume_group, name).await?.is_none() {
            return Err(BackendError::NotFound(format!(
                "logical volume {volume_group}/{name}"
            )));
        }
        let target = format!("{volume_group}/{name}");
        run("lvremove", &["--yes", target.as_str()]).await?;
        Ok(())
    }

    async fn extend_logical_volume(
        &self,
        volume_group: &str,
        name: &str,
        size_bytes: u64,
    ) -> Result<LogicalVolume, BackendError> {
        let target = format!("{volume_group}/{name}");
        let size = format!("{size_bytes}b");
        run("lvextend", &["-L", size.as_str(), target.as_str()]).await?;

        self.find_logical_volume(volume_group, name)
            .await?
            .ok_or_else(|| BackendError::NotFound(format!("logical volume {target}")))
    }

    async fn mount_device(&self, req: &MountRequest) -> Result<(), BackendError> {
        let fs_type = match self.filesystem_of(&req.device).await? {
            Some(existing) => existing,
            None => {
                self.make_filesystem(&req.device, &req.fs_type).await?;
                req.fs_type.clone()
            }
        };

        ensure_dir(&req.target).await?;

        let mut flags = MsFlags::empty();
        if req.read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        let data = req.mount_flags.join(",");

        nix::mount::mount(
            Some(req.device.as_str()),
            req.target.as_str(),
            Some(fs_type.as_str()),
            flags,
            (!data.is_empty()).then_some(data.as_str()),
        )
        .map_err(|e| BackendError::Mount {
            path: req.target.clone(),
            reason: e.to_string(),
        })?;

        info!(device = %req.device, target = %req.target, %fs_type, "device mounted");
        Ok(())
    }

    async fn bind_mount(
        &self,
        source: &str,
        target: &str,
        read_only: bool,
    ) -> Result<(), BackendError> {
        ensure_dir(target).await?;

        let mut flags = MsFlags::MS_BIND;
        if read_only {
            flags |= MsFlags::MS_RDONLY;
        }

        nix::mount::mount(Some(source), target, None::<&str>, flags, None::<&str>).map_err(
            |e| BackendError::Mount {
                path: target.to_owned(),
                reason: e.to_string(),
            },
        )?;

        // Some kernels ignore MS_RDONLY on the initial bind-mount call; a
        // separate remount is required to actually enforce read-only access.
        if read_only {
            nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| BackendError::Mount {
                path: target.to_owned(),
                reason: format!("remount read-only: {e}"),
            })?;
        }
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<(), BackendError> {
        nix::mount::umount(target).map_err(|e| BackendError::Unmount {
            path: target.to_owned(),
            reason: e.to_string(),
        })?;

        // The mount point directory is ours to remove; anything else living
        // there stays.
        if let Err(e) = tokio::fs::remove_dir(target).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(%target, error = %e, "failed to remove mount point directory");
        }
        Ok(())
    }

    async fn mount_point(&self, target: &str) -> Result<Option<MountPoint>, BackendError> {
        let contents = tokio::fs::read_to_string("/proc/self/mounts")
            .await
            .map_err(|source| BackendError::Io {
                context: "read /proc/self/mounts".to_owned(),
                source,
            })?;

        let Some(mut mount) = parse_mounts(&contents, target) else {
            return Ok(None);
        };
        if mount.source.starts_with('/') {
            // `/dev/mapper/vg-lv` and `/dev/vg/lv` both resolve to `/dev/dm-N`.
            mount.source = canonicalize(&mount.source).await.unwrap_or(mount.source);
        }
        Ok(Some(mount))
    }

    async fn canonical_device(&self, path: &str) -> Result<String, BackendError> {
        canonicalize(path).await
    }

    async fn grow_filesystem(&self, device: &str, mount_path: &str) -> Result<(), BackendError> {
        let mount = self
            .mount_point(mount_path)
            .await?
            .ok_or_else(|| BackendError::NotFound(format!("mount point {mount_path}")))?;

        match mount.fs_type.as_str() {
            "ext2" | "ext3" | "ext4" => run("resize2fs", &[device]).await?,
            "xfs" => run("xfs_growfs", &[mount_path]).await?,
            other => {
                return Err(BackendError::Unsupported(format!(
                    "growing {other} filesystems"
                )));
            }
        };
        info!(%device, %mount_path, "filesystem grown");
        Ok(())
    }
}
