//! Named facilities and their read/write/execute grants.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;
use utoipa::ToSchema;

/// Facility that unlocks administrative actions.
pub const ADMIN_FACILITY: &str = "Admin";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid access flag `{0}`, expected a combination of r, w and x")]
pub struct AccessParseError(char);

/// Permission set drawn from `r`, `w` and `x`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Access {
    read: bool,
    write: bool,
    execute: bool,
}

impl Access {
    #[must_use]
    pub const fn new(read: bool, write: bool, execute: bool) -> Self {
        Self {
            read,
            write,
            execute,
        }
    }

    #[must_use]
    pub const fn can_read(self) -> bool {
        self.read
    }

    #[must_use]
    pub const fn can_write(self) -> bool {
        self.write
    }

    #[must_use]
    pub const fn can_execute(self) -> bool {
        self.execute
    }
}

impl FromStr for Access {
    type Err = AccessParseError;

    fn from_str(flags: &str) -> Result<Self, Self::Err> {
        let mut access = Self::default();
        for flag in flags.trim().chars() {
            match flag.to_ascii_lowercase() {
                'r' => access.read = true,
                'w' => access.write = true,
                'x' => access.execute = true,
                other => return Err(AccessParseError(other)),
            }
        }
        Ok(access)
    }
}

impl TryFrom<String> for Access {
    type Error = AccessParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Access> for String {
    fn from(access: Access) -> Self {
        access.to_string()
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.read {
            f.write_str("r")?;
        }
        if self.write {
            f.write_str("w")?;
        }
        if self.execute {
            f.write_str("x")?;
        }
        Ok(())
    }
}

/// A named grant held by an account, e.g. `Admin (rwx)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Facility {
    pub name: String,
    #[schema(value_type = String, example = "rwx")]
    pub access: Access,
}

impl Facility {
    #[must_use]
    pub fn new(name: impl Into<String>, access: Access) -> Self {
        Self {
            name: name.into(),
            access,
        }
    }
}

impl fmt::Display for Facility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.access)
    }
}
