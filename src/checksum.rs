// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Content fingerprints.
//!
//! Patchsync never diffs file content. Drift between the local working copy,
//! the registry, and the remote deployment is detected purely by comparing
//! __checksums__ of whole files. A checksum can tell us that two files
//! differ, but never how they differ.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

/// Fingerprint of file content.
///
/// Only equality is meaningful. Two checksums have no ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum(String);

impl Checksum {
    /// Hex digest length.
    pub const LEN: usize = 64;

    /// Borrow hex digest.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Abbreviated form for status output.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

/// Compute fingerprint of given content.
///
/// Empty content yields a well-defined constant, not an error.
pub fn fingerprint(content: impl AsRef<[u8]>) -> Checksum {
    let digest = Sha256::digest(content.as_ref());
    Checksum(hex::encode(digest))
}

impl Display for Checksum {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

impl FromStr for Checksum {
    type Err = ChecksumError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let data = data.trim();
        if data.len() != Self::LEN || hex::decode(data).is_err() {
            return Err(ChecksumError(data.to_string()));
        }

        Ok(Self(data.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for Checksum {
    type Error = ChecksumError;

    fn try_from(data: String) -> Result<Self, Self::Error> {
        data.parse()
    }
}

impl From<Checksum> for String {
    fn from(checksum: Checksum) -> Self {
        checksum.0
    }
}

/// Malformed checksum text.
#[derive(Clone, Debug, thiserror::Error)]
#[error("malformed checksum {0:?}")]
pub struct ChecksumError(String);
