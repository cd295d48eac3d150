//! What to run: the container definition handed to [`ContainerState::start`].
//!
//! [`ContainerState::start`]: super::ContainerState::start

use std::path::PathBuf;

use caps::{Capability, CapsHashSet};
use strata_common::{StrataError, StrataResult};
use strata_oci::runtime::ConsoleSize;

use crate::mount::MountSpec;

/// Process to run inside the container.
#[derive(Debug, Clone)]
pub struct ContainerProc {
    /// Command line, program first.
    pub args: Vec<String>,
    /// Environment as `KEY=value` strings.
    pub env: Vec<String>,
    /// Working directory inside the container.
    pub cwd: PathBuf,
    /// User ID inside the container.
    pub uid: u32,
    /// Group ID inside the container.
    pub gid: u32,
    /// Capabilities granted to the process.
    pub capabilities: CapsHashSet,
    /// Initial terminal size.
    pub console_size: ConsoleSize,
}

impl ContainerProc {
    /// Run `args` as root in `/` with a minimal environment.
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            env: vec![
                "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
                "TERM=xterm".to_string(),
            ],
            cwd: PathBuf::from("/"),
            uid: 0,
            gid: 0,
            capabilities: CapsHashSet::new(),
            console_size: ConsoleSize::default(),
        }
    }

    /// Add an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        let prefix = format!("{key}=");
        self.env.retain(|entry| !entry.starts_with(&prefix));
        self.env.push(format!("{key}={value}"));
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Run as `uid`:`gid`.
    #[must_use]
    pub const fn with_user(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Grant a capability.
    #[must_use]
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    /// Grant a capability by name, such as `CAP_NET_ADMIN`.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Config`] for a name the kernel does not know.
    pub fn with_capability_name(self, name: &str) -> StrataResult<Self> {
        let capability = name
            .to_uppercase()
            .parse::<Capability>()
            .map_err(|e| StrataError::Config {
                message: format!("Unknown capability {name}: {e}"),
            })?;
        Ok(self.with_capability(capability))
    }

    /// Set the initial terminal size.
    #[must_use]
    pub const fn with_console_size(mut self, size: ConsoleSize) -> Self {
        self.console_size = size;
        self
    }
}

/// Everything needed to start a container besides its ID.
#[derive(Debug, Clone)]
pub struct ContainerDef {
    /// Mounts, in the layer resolver's order.
    pub mounts: Vec<MountSpec>,
    /// Process to run.
    pub process: ContainerProc,
    /// Hostname inside the container.
    pub hostname: Option<String>,
    /// Keep the container directory (upper layers included) after destroy.
    pub persist: bool,
}

impl ContainerDef {
    /// A definition with no mounts.
    #[must_use]
    pub const fn new(process: ContainerProc) -> Self {
        Self {
            mounts: Vec::new(),
            process,
            hostname: None,
            persist: false,
        }
    }

    /// Append mounts.
    #[must_use]
    pub fn with_mounts(mut self, mounts: impl IntoIterator<Item = MountSpec>) -> Self {
        self.mounts.extend(mounts);
        self
    }

    /// Set the hostname.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Keep the on-disk state after destroy.
    #[must_use]
    pub const fn persistent(mut self) -> Self {
        self.persist = true;
        self
    }
}
