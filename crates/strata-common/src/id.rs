//! Container IDs.
//!
//! An ID names the container's state directory and is handed to the OCI
//! runtime verbatim, so it is restricted to a portable, path-safe alphabet.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{StrataError, StrataResult};

/// A container ID: 1 to 64 ASCII alphanumerics, `-` or `_`, starting with an
/// alphanumeric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerId(String);

impl ContainerId {
    /// Longest accepted ID.
    pub const MAX_LENGTH: usize = 64;

    /// Validate `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::InvalidContainerId`] if `id` is empty, too long,
    /// or could escape its state directory.
    pub fn new(id: impl Into<String>) -> StrataResult<Self> {
        let id = id.into();
        if is_valid(&id) {
            Ok(Self(id))
        } else {
            Err(StrataError::InvalidContainerId { id })
        }
    }

    /// The ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_valid(id: &str) -> bool {
    let mut chars = id.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    id.len() <= ContainerId::MAX_LENGTH
        && first.is_ascii_alphanumeric()
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContainerId {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ContainerId {
    type Error = StrataError;

    fn try_from(id: String) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl From<ContainerId> for String {
    fn from(id: ContainerId) -> Self {
        id.0
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
