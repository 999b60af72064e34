// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine relevent path information for external files that need to be
//! interacted with, or managed in some way.

use std::path::{Path, PathBuf};

/// Suffix of registry files.
pub const REGISTRY_SUFFIX: &str = ".lock.toml";

/// Determine default absolute path to configuration file.
///
/// Uses XDG Base Directory path `$XDG_CONFIG_HOME/patchsync/config.toml`.
/// Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_config_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("patchsync").join("config.toml"))
        .ok_or(NoWayHome)
}

/// Determine default absolute path to registry directory.
///
/// Uses XDG Base Directory path `$XDG_DATA_HOME/patchsync`. Does not check
/// if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn default_registry_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|path| path.join("patchsync"))
        .ok_or(NoWayHome)
}

/// Path of registry file for site inside of directory.
pub fn registry_path(dir: impl AsRef<Path>, site: &str) -> PathBuf {
    dir.as_ref().join(format!("{site}{REGISTRY_SUFFIX}"))
}

/// No way to determine user's home directory.
///
/// # See Also
///
/// - [`dirs::home_dir`](https://docs.rs/dirs/latest/dirs/fn.home_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's home directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;
