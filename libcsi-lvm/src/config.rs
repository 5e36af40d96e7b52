//! Driver configuration.
//!
//! [`DriverConfig`] carries the identity reported through the Identity
//! service and the knobs the state machines consult: default volume group,
//! size limits, timeouts and the optional registry state directory.  The
//! binary fills it from command-line flags; tests start from
//! [`DriverConfig::default`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CsiError;

pub const KIB: u64 = 1024;
pub const MIB: u64 = KIB * 1024;
pub const GIB: u64 = MIB * 1024;
pub const TIB: u64 = GIB * 1024;

/// Configuration shared by the Identity, Controller and Node services.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Name reported by `GetPluginInfo`.
    pub driver_name: String,
    /// Version reported by `GetPluginInfo`.
    pub vendor_version: String,
    /// Identifier of the node this process runs on.
    pub node_id: String,
    /// Volume group used when a request does not name one.
    pub volume_group: String,
    /// Directory for the persisted registry image.  `None` keeps the registry
    /// in memory only; startup then relies on backend reconciliation.
    pub state_dir: Option<PathBuf>,
    /// Size used when a create request asks for zero bytes.
    pub default_volume_size: u64,
    /// Largest volume a single request may ask for.
    pub max_volume_size: u64,
    /// Upper bound for a single backend call.
    #[serde(with = "secs")]
    pub backend_timeout: Duration,
    /// Upper bound for waiting on a volume-group or target-path lock.
    #[serde(with = "secs")]
    pub lock_timeout: Duration,
    /// Reported by `NodeGetInfo`.
    pub max_volumes_per_node: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver_name: "csi-lvm".to_owned(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
            node_id: String::new(),
            volume_group: "default".to_owned(),
            state_dir: None,
            default_volume_size: GIB,
            max_volume_size: 100 * TIB,
            backend_timeout: Duration::from_secs(60),
            lock_timeout: Duration::from_secs(30),
            max_volumes_per_node: 256,
        }
    }
}

impl DriverConfig {
    /// Path of the persisted registry image, if persistence is enabled.
    pub fn registry_path(&self) -> Option<PathBuf> {
        self.state_dir.as_deref().map(|dir| dir.join("registry.json"))
    }
}

/// Parse a CSI endpoint into the path of the Unix socket to listen on.
///
/// Accepts `unix://<path>` and bare absolute paths.  A `unix://` path without
/// a leading slash (`unix://tmp/csi.sock`) is taken as absolute.
pub fn parse_endpoint(endpoint: &str) -> Result<PathBuf, CsiError> {
    let path = match endpoint.split_once("://") {
        Some(("unix", rest)) => rest,
        Some((scheme, _)) => {
            return Err(CsiError::InvalidArgument(format!(
                "unsupported endpoint scheme {scheme:?} in {endpoint}"
            )));
        }
        None if endpoint.starts_with('/') => endpoint,
        None => {
            return Err(CsiError::InvalidArgument(format!(
                "endpoint {endpoint} is neither unix://<path> nor an absolute path"
            )));
        }
    };

    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return Err(CsiError::InvalidArgument(format!(
            "endpoint {endpoint} has an empty socket path"
        )));
    }
    Ok(Path::new("/").join(path))
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
