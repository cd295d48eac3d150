//! Runtime configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_common::{StrataError, StrataPaths, StrataResult};

use crate::backend::BackendKind;

/// Runtime configuration options.
///
/// Every field has a default, so a TOML file only needs the keys it changes:
///
/// ```toml
/// root = "/home/dev/.local/share/strata"
/// backend = "fuse"
/// stop_timeout = 2.5
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Root data directory.
    pub root: PathBuf,
    /// How layered mounts are realized.
    pub backend: BackendKind,
    /// `fuse-overlayfs` binary for the FUSE backend.
    pub fuse_overlayfs: PathBuf,
    /// runc-compatible OCI runtime binary.
    pub runtime_binary: PathBuf,
    /// How long a FUSE helper may take to mount (seconds).
    #[serde(with = "secs")]
    pub mount_timeout: Duration,
    /// How long a FUSE helper may take to exit after SIGTERM (seconds).
    #[serde(with = "secs")]
    pub helper_stop_timeout: Duration,
    /// Grace period per signal tier when destroying a container (seconds).
    #[serde(with = "secs")]
    pub stop_timeout: Duration,
    /// Whether to use rootless mode.
    pub rootless: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root: StrataPaths::new().root,
            backend: BackendKind::Overlay,
            fuse_overlayfs: PathBuf::from("fuse-overlayfs"),
            runtime_binary: PathBuf::from("runc"),
            mount_timeout: Duration::from_secs(10),
            helper_stop_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(10),
            rootless: false,
        }
    }
}

impl RuntimeConfig {
    /// Create a rootless configuration rooted in the user's data directory.
    #[must_use]
    pub fn rootless() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));

        Self {
            root: home.join(".local/share/strata"),
            rootless: true,
            ..Self::default()
        }
    }

    /// Load a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> StrataResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        tracing::debug!(path = %path.display(), ?config, "Loaded runtime config");
        Ok(config)
    }

    /// Parse a TOML configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Config`] on malformed input.
    pub fn from_toml(content: &str) -> StrataResult<Self> {
        toml::from_str(content).map_err(|e| StrataError::Config {
            message: e.to_string(),
        })
    }

    /// Paths derived from the root directory.
    #[must_use]
    pub fn paths(&self) -> StrataPaths {
        StrataPaths::with_root(&self.root)
    }

    /// Set the root directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Select the mount backend.
    #[must_use]
    pub const fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Set the per-tier destroy grace period.
    #[must_use]
    pub const fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Set the OCI runtime binary.
    #[must_use]
    pub fn with_runtime_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.runtime_binary = binary.into();
        self
    }
}

/// Durations as (fractional) seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
