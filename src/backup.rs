// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Timestamped backups of remote file content.
//!
//! Every real apply first copies the current remote content of the target
//! file into a sibling __backup__ file on the remote side. Backup names are
//! derived from the original path plus a UTC timestamp, and always end in
//! `.bak` so bulk file synchronization can exclude them with a `*.bak` glob:
//!
//! ```text
//! wp-content/plugins/acme/x.php
//! wp-content/plugins/acme/x.php.20251017T120000.bak
//! wp-content/plugins/acme/x.php.20251017T120000-1.bak
//! ```
//!
//! Backups are owned by the remote file system. The registry only keeps a
//! [`BackupEntry`] pointing at the latest one for traceability. Nothing in
//! patchsync ever deletes a backup.

use crate::access::{AccessError, FileAccess};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

/// Suffix marking backup files.
pub const BACKUP_SUFFIX: &str = ".bak";

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Reference to a backup on the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BackupEntry {
    /// Path of file that was backed up.
    pub original_path: String,

    /// Path of backup file.
    pub backup_path: String,

    /// Time backup was taken.
    pub created_at: DateTime<Utc>,
}

/// Create and locate backups through a file access capability.
pub struct BackupStore<'a> {
    access: &'a dyn FileAccess,
}

impl<'a> BackupStore<'a> {
    /// Construct new backup store on top of given capability.
    pub fn new(access: &'a dyn FileAccess) -> Self {
        Self { access }
    }

    /// Store content as new backup of path.
    ///
    /// Never overwrites an earlier backup. If a backup with the same
    /// timestamp already exists, a counter is appended to the timestamp.
    ///
    /// # Errors
    ///
    /// - Return [`BackupError::Access`] if backup cannot be written.
    #[instrument(skip(self, content), level = "debug")]
    pub fn create_backup(&self, path: &str, content: &[u8]) -> Result<BackupEntry> {
        let created_at = Utc::now();
        let stamp = created_at.format(TIMESTAMP_FORMAT).to_string();

        let mut backup_path = format!("{path}.{stamp}{BACKUP_SUFFIX}");
        let mut counter = 0;
        while self.access.exists(&backup_path)? {
            counter += 1;
            backup_path = format!("{path}.{stamp}-{counter}{BACKUP_SUFFIX}");
        }

        self.access.write(&backup_path, content)?;
        info!("backup created: {backup_path}");

        Ok(BackupEntry {
            original_path: path.into(),
            backup_path,
            created_at,
        })
    }

    /// Read content of backup.
    ///
    /// # Errors
    ///
    /// - Return [`BackupError::Missing`] if backup file no longer exists.
    /// - Return [`BackupError::Access`] if backup cannot be read.
    pub fn read_backup(&self, entry: &BackupEntry) -> Result<Vec<u8>> {
        debug!("read backup {}", entry.backup_path);
        self.access
            .read(&entry.backup_path)?
            .ok_or_else(|| BackupError::Missing {
                backup_path: entry.backup_path.clone(),
            })
    }

    /// Check if file exists.
    pub fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.access.exists(path)?)
    }

    /// List all backup files of path, newest first.
    pub fn list_backups(&self, path: &str) -> Result<Vec<String>> {
        let mut backups = self
            .access
            .list_matching(&format!("{path}."), BACKUP_SUFFIX)?
            .into_iter()
            .filter(|candidate| is_backup_of(path, candidate))
            .collect::<Vec<_>>();

        // INVARIANT: Timestamps sort lexicographically, counters break ties.
        backups.sort_by(|left, right| backup_key(path, right).cmp(&backup_key(path, left)));

        Ok(backups)
    }
}

fn is_backup_of(path: &str, candidate: &str) -> bool {
    candidate
        .strip_prefix(path)
        .and_then(|rest| rest.strip_prefix('.'))
        .and_then(|rest| rest.strip_suffix(BACKUP_SUFFIX))
        .and_then(|stamp| stamp.split('-').next())
        .is_some_and(|stamp| {
            chrono::NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).is_ok()
        })
}

fn backup_key<'p>(path: &str, candidate: &'p str) -> (&'p str, u64) {
    let stamp = &candidate[path.len() + 1..candidate.len() - BACKUP_SUFFIX.len()];
    match stamp.split_once('-') {
        Some((stamp, counter)) => (stamp, counter.parse().unwrap_or(0)),
        None => (stamp, 0),
    }
}

/// Backup error types.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// Backup file is gone from the remote side.
    #[error("backup file {backup_path:?} does not exist")]
    Missing { backup_path: String },

    /// Underlying file access fails.
    #[error(transparent)]
    Access(#[from] AccessError),
}

/// Friendly result alias :3
pub type Result<T, E = BackupError> = std::result::Result<T, E>;
