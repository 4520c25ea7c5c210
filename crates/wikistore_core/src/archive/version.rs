//! Revision version labels.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// `major.minor` revision label, ordered numerically (`1.10` > `1.9`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    /// Label of the first revision of any archive.
    pub const INITIAL: Version = Version { major: 1, minor: 1 };

    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// `None` once the minor number is exhausted.
    pub fn next_minor(self) -> Option<Self> {
        self.minor.checked_add(1).map(|minor| Self::new(self.major, minor))
    }

    pub fn next_major(self) -> Option<Self> {
        self.major.checked_add(1).map(|major| Self::new(major, 1))
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidVersion(pub String);

impl Display for InvalidVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid version label `{}`", self.0)
    }
}

impl Error for InvalidVersion {}

impl FromStr for Version {
    type Err = InvalidVersion;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (major, minor) = value
            .split_once('.')
            .ok_or_else(|| InvalidVersion(value.to_string()))?;
        let parse = |part: &str| {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(InvalidVersion(value.to_string()));
            }
            part.parse::<u32>()
                .map_err(|_| InvalidVersion(value.to_string()))
        };
        let version = Version::new(parse(major)?, parse(minor)?);
        if version.major == 0 || version.minor == 0 {
            return Err(InvalidVersion(value.to_string()));
        }
        Ok(version)
    }
}
