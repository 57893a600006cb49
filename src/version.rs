/*
 * Copyright (c) 2024 - 2026, Rodb Contributors.
 * Licensed under the MIT license; see LICENSE at the crate root for details.
 */

//! Engine version and the compatibility rules applied when opening an
//! existing database directory.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The running engine's version, baked in at build time.
pub const RUNTIME_VERSION: Version = Version {
    major: 1,
    minor: 0,
    patch: 0,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Version {
    /// An odd MINOR marks a development line, where the file and runtime
    /// PATCH must match exactly rather than merely file ≤ runtime.
    fn is_development(&self) -> bool {
        self.minor % 2 == 1
    }

    /// Check `self` (read from a database's metadata file) against
    /// `runtime` under the rules in the data model: MAJOR and MINOR must
    /// agree; an even (stable) MINOR allows the file's PATCH to trail the
    /// runtime's, while an odd (development) MINOR requires an exact
    /// PATCH match.
    pub fn check_compatible(&self, runtime: Version) -> Result<()> {
        let major_minor_match = self.major == runtime.major && self.minor == runtime.minor;
        let patch_ok = if self.is_development() {
            self.patch == runtime.patch
        } else {
            self.patch <= runtime.patch
        };
        if major_minor_match && patch_ok {
            Ok(())
        } else {
            Err(Error::IncompatibleVersion {
                file: self.to_string(),
                runtime: runtime.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(major: u32, minor: u32, patch: u32) -> Version {
        Version { major, minor, patch }
    }

    #[test]
    fn stable_line_allows_file_patch_at_or_below_runtime() {
        assert!(v(1, 0, 0).check_compatible(v(1, 0, 3)).is_ok());
        assert!(v(1, 0, 3).check_compatible(v(1, 0, 3)).is_ok());
        assert!(v(1, 0, 4).check_compatible(v(1, 0, 3)).is_err());
    }

    #[test]
    fn development_line_requires_exact_patch_match() {
        assert!(v(1, 1, 2).check_compatible(v(1, 1, 2)).is_ok());
        assert!(v(1, 1, 2).check_compatible(v(1, 1, 3)).is_err());
    }

    #[test]
    fn major_or_minor_mismatch_always_rejected() {
        assert!(v(2, 0, 0).check_compatible(v(1, 0, 0)).is_err());
        assert!(v(1, 2, 0).check_compatible(v(1, 0, 0)).is_err());
    }
}
