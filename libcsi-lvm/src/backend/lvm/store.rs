//! Durable copy of the [`VolumeRegistry`].
//!
//! The image is written to a sibling temporary file, synced, and renamed
//! into place, so a crash mid-write leaves the previous image intact.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::registry::{RegistryImage, VolumeRegistry};
use crate::error::CsiError;

/// JSON file holding the last persisted registry image.
pub struct RegistryStore {
    path: PathBuf,
    /// Serializes writers so an older image never overwrites a newer one.
    write: Mutex<()>,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted image; `None` when nothing was persisted yet.
    pub async fn load(&self) -> Result<Option<RegistryImage>, CsiError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CsiError::internal(format!(
                    "read {}: {e}",
                    self.path.display()
                )));
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CsiError::internal(format!("decode {}: {e}", self.path.display())))
    }

    /// Persist the current contents of `registry`.
    ///
    /// The snapshot is taken after acquiring the write lock, so the last
    /// writer always stores the newest state.
    pub async fn save_from(&self, registry: &VolumeRegistry) -> Result<(), CsiError> {
        let _guard = self.write.lock().await;
        let image = registry.image();
        let bytes = serde_json::to_vec_pretty(&image).map_err(CsiError::internal)?;

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| CsiError::internal(format!("create {}: {e}", dir.display())))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let write = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await
        };
        write
            .await
            .map_err(|e| CsiError::internal(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| CsiError::internal(format!("rename {}: {e}", tmp.display())))?;

        debug!(
            path = %self.path.display(),
            volumes = image.volumes.len(),
            snapshots = image.snapshots.len(),
            "registry persisted"
        );
        Ok(())
    }
}
