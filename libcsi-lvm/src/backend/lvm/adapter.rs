//! Contract between the state machines and the volume manager.
//!
//! [`LvmAdapter`] is the only way the driver touches LVM or the node's mount
//! table.  Results are structured: callers branch on [`BackendError`]
//! variants and never on diagnostic text.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::error::CsiError;

/// Tag marking a logical volume as a volume created by this driver.
pub const TAG_KIND_VOLUME: &str = "csi-lvm.kind=volume";
/// Tag marking a logical volume as a snapshot created by this driver.
pub const TAG_KIND_SNAPSHOT: &str = "csi-lvm.kind=snapshot";
/// Prefix of the tag carrying the caller-supplied name.
pub const TAG_NAME_PREFIX: &str = "csi-lvm.name=";
/// Prefix of the tag carrying a snapshot's source volume id.
pub const TAG_SOURCE_PREFIX: &str = "csi-lvm.source=";
/// Prefix of the tag carrying the idempotency key of the creating request.
pub const TAG_KEY_PREFIX: &str = "csi-lvm.key=";
/// Prefix of the tag carrying a snapshot's creation time (Unix seconds).
pub const TAG_CREATED_PREFIX: &str = "csi-lvm.created=";
/// Tag added once a snapshot's copy is complete.
pub const TAG_READY: &str = "csi-lvm.ready";

/// Namespace for idempotency keys.
const KEY_NAMESPACE: Uuid = Uuid::from_u128(0x6c76_6d2d_6373_6900_8000_0000_0000_0001);

/// Failure reported by an [`LvmAdapter`].
#[derive(Debug, Error)]
pub enum BackendError {
    /// The volume group, logical volume or mount point does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// An external command exited unsuccessfully.
    #[error("`{command}` failed ({status}): {stderr}")]
    CommandFailed {
        /// Command line that was run.
        command: String,
        /// Exit status as reported by the OS.
        status: String,
        /// Captured standard error, for operators only.
        stderr: String,
    },

    /// Spawning a command or touching the filesystem failed.
    #[error("{context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A mount syscall failed.
    #[error("mount {path}: {reason}")]
    Mount {
        /// Target path.
        path: String,
        /// Failure reason.
        reason: String,
    },

    /// An unmount syscall failed.
    #[error("unmount {path}: {reason}")]
    Unmount {
        /// Target path.
        path: String,
        /// Failure reason.
        reason: String,
    },

    /// Command output did not have the expected shape.
    #[error("cannot parse {what}: {reason}")]
    Parse {
        /// Which output was being parsed.
        what: String,
        /// Parser message.
        reason: String,
    },

    /// The operation is not supported for this volume (e.g. filesystem type).
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The call did not finish within the configured bound.  The outcome is
    /// unknown and must be re-derived.
    #[error("backend call did not finish within {0:?}")]
    Timeout(Duration),
}

impl From<BackendError> for CsiError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Timeout(_) => CsiError::Aborted(e.to_string()),
            BackendError::Mount { path, reason } => CsiError::MountFailed { path, reason },
            BackendError::Unmount { path, reason } => CsiError::UnmountFailed { path, reason },
            BackendError::Unsupported(what) => CsiError::InvalidArgument(what),
            other => CsiError::backend(other),
        }
    }
}

/// State of a volume group as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeGroupStatus {
    /// Volume group name.
    pub name: String,
    /// Allocation unit in bytes.
    pub extent_bytes: u64,
    /// Total size in bytes.
    pub size_bytes: u64,
    /// Unallocated bytes.
    pub free_bytes: u64,
}

impl VolumeGroupStatus {
    /// Round `bytes` up to a whole number of extents.
    pub fn round_up(&self, bytes: u64) -> u64 {
        round_up(bytes, self.extent_bytes)
    }
}

/// Round `bytes` up to a multiple of `extent` (at least one extent).
pub fn round_up(bytes: u64, extent: u64) -> u64 {
    if extent == 0 {
        return bytes;
    }
    bytes.max(1).div_ceil(extent).saturating_mul(extent)
}

/// A logical volume as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalVolume {
    /// Logical volume name.
    pub name: String,
    /// Volume group name.
    pub volume_group: String,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Device path, e.g. `/dev/vg0/lv0`.
    pub device_path: String,
    /// LVM tags.
    pub tags: Vec<String>,
}

impl LogicalVolume {
    /// Value of the first tag starting with `prefix`.
    pub fn tag_value(&self, prefix: &str) -> Option<&str> {
        self.tags.iter().find_map(|t| t.strip_prefix(prefix))
    }

    /// Whether the logical volume carries `tag`.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Whether the logical volume was created for idempotency key `key`.
    pub fn has_key(&self, key: &str) -> bool {
        self.tag_value(TAG_KEY_PREFIX) == Some(key)
    }

    /// Creation time recorded in the tags.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let secs = self.tag_value(TAG_CREATED_PREFIX)?.parse().ok()?;
        DateTime::from_timestamp(secs, 0)
    }
}

/// Parameters of a logical volume to allocate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalVolumeSpec {
    /// Volume group to allocate from.
    pub volume_group: String,
    /// Logical volume name.
    pub name: String,
    /// Size in bytes, already rounded to the extent size.
    pub size_bytes: u64,
    /// Tags to attach.
    pub tags: Vec<String>,
}

/// A filesystem mount of a block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    /// Block device to mount.
    pub device: String,
    /// Mount point.
    pub target: String,
    /// Filesystem to create when the device is unformatted.
    pub fs_type: String,
    /// Extra mount options.
    pub mount_flags: Vec<String>,
    /// Mount read-only.
    pub read_only: bool,
}

/// An entry of the node's mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    /// Canonical path of the mounted device.
    pub source: String,
    /// Mount point.
    pub target: String,
    /// Filesystem type.
    pub fs_type: String,
    /// Whether the mount is read-only.
    pub read_only: bool,
}

/// Idempotency key of a volume named `name`.
///
/// Unlike the volume id it is the same for every attempt to create the
/// volume, so a retry finds the logical volume an earlier attempt left.
pub fn volume_key(name: &str) -> String {
    Uuid::new_v5(&KEY_NAMESPACE, name.as_bytes())
        .simple()
        .to_string()
}

/// Idempotency key of snapshot `name` of volume `source`.
pub fn snapshot_key(source: &str, name: &str) -> String {
    let key = format!("{source}/{name}");
    Uuid::new_v5(&KEY_NAMESPACE, key.as_bytes())
        .simple()
        .to_string()
}

/// Tags identifying a volume created for `name`.
pub fn volume_tags(name: &str) -> Vec<String> {
    let mut tags = vec![
        TAG_KIND_VOLUME.to_owned(),
        format!("{TAG_KEY_PREFIX}{}", volume_key(name)),
    ];
    tags.extend(name_tag(name));
    tags
}

/// Tags identifying a snapshot of `source` created for `name` at `created`.
///
/// [`TAG_READY`] is not among them: the adapter adds it once the copy is
/// complete.
pub fn snapshot_tags(name: &str, source: &str, created: DateTime<Utc>) -> Vec<String> {
    let mut tags = vec![
        TAG_KIND_SNAPSHOT.to_owned(),
        format!("{TAG_KEY_PREFIX}{}", snapshot_key(source, name)),
    ];
    tags.extend(name_tag(name));
    tags.push(format!("{TAG_SOURCE_PREFIX}{source}"));
    tags.push(format!("{TAG_CREATED_PREFIX}{}", created.timestamp()));
    tags
}

/// LVM only accepts `[A-Za-z0-9_+.-/=!:&#]` in tags; names outside that set
/// are simply not tagged.
fn name_tag(name: &str) -> Option<String> {
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_+.-/=!:&#".contains(c));
    (valid && name.len() <= 1000).then(|| format!("{TAG_NAME_PREFIX}{name}"))
}

/// Bound `fut` by `limit`, reporting expiry as [`BackendError::Timeout`].
///
/// Expiry drops the future but does not undo work already handed to the
/// volume manager; callers re-derive the outcome by querying the backend.
pub async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(BackendError::Timeout(limit)))
}

/// Operations the driver needs from the volume manager and the node.
#[async_trait]
pub trait LvmAdapter: Send + Sync + 'static {
    /// Extent size and capacity of a volume group.
    async fn volume_group(&self, volume_group: &str) -> Result<VolumeGroupStatus, BackendError>;

    /// All logical volumes in a volume group.
    async fn list_logical_volumes(
        &self,
        volume_group: &str,
    ) -> Result<Vec<LogicalVolume>, BackendError>;

    /// Allocate a logical volume.
    async fn create_logical_volume(
        &self,
        spec: &LogicalVolumeSpec,
    ) -> Result<LogicalVolume, BackendError>;

    /// Allocate a logical volume holding an independent copy of `origin`.
    ///
    /// The logical volume exists before the copy is done; only a returned
    /// volume, which carries [`TAG_READY`], holds a complete copy.
    async fn create_snapshot(
        &self,
        spec: &LogicalVolumeSpec,
        origin: &str,
    ) -> Result<LogicalVolume, BackendError>;

    /// Remove a logical volume; [`BackendError::NotFound`] when absent.
    async fn remove_logical_volume(&self, volume_group: &str, name: &str)
    -> Result<(), BackendError>;

    /// Grow a logical volume to `size_bytes`.
    async fn extend_logical_volume(
        &self,
        volume_group: &str,
        name: &str,
        size_bytes: u64,
    ) -> Result<LogicalVolume, BackendError>;

    /// Create a filesystem on the device if it has none, then mount it.
    async fn mount_device(&self, req: &MountRequest) -> Result<(), BackendError>;

    /// Bind-mount `source` at `target`.
    async fn bind_mount(&self, source: &str, target: &str, read_only: bool)
    -> Result<(), BackendError>;

    /// Unmount `target`.
    async fn unmount(&self, target: &str) -> Result<(), BackendError>;

    /// The mount at exactly `target`, if any.
    async fn mount_point(&self, target: &str) -> Result<Option<MountPoint>, BackendError>;

    /// Canonical form of a device path, comparable with [`MountPoint::source`].
    async fn canonical_device(&self, path: &str) -> Result<String, BackendError>;

    /// Grow the filesystem on `device` mounted at `mount_path`.
    async fn grow_filesystem(&self, device: &str, mount_path: &str) -> Result<(), BackendError>;

    /// Look up one logical volume by name.
    async fn find_logical_volume(
        &self,
        volume_group: &str,
        name: &str,
    ) -> Result<Option<LogicalVolume>, BackendError> {
        Ok(self
            .list_logical_volumes(volume_group)
            .await?
            .into_iter()
            .find(|lv| lv.name == name))
    }
}
