// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Restore remote files from their latest backup.
//!
//! Rolling back writes the backup taken by the last apply over the remote
//! file, and marks the patch reverted. The backup itself is kept, so the
//! same rollback can be repeated. Rolling back does not touch the local
//! file, which keeps the patched content so it can be applied again later.

use crate::{
    backup::{BackupEntry, BackupStore},
    checksum::{fingerprint, Checksum},
    engine::{describe, EngineError, Result, Workspace},
    registry::{normalize_path, PatchRegistry},
    state::remote_drifted,
};

use tracing::{info, instrument, warn};

/// Result of a rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// Dry run, nothing was touched.
    Planned {
        backup: BackupEntry,
        current: Option<Checksum>,
        restored: Checksum,
    },

    /// Remote file was restored from backup.
    RolledBack {
        backup: BackupEntry,
        previous: Option<Checksum>,
        restored: Checksum,
    },
}

/// Restore remote content from backups.
pub struct RollbackEngine<'a> {
    workspace: Workspace<'a>,
}

impl<'a> RollbackEngine<'a> {
    /// Construct new rollback engine.
    pub fn new(workspace: Workspace<'a>) -> Self {
        Self { workspace }
    }

    /// Roll back patch to the content its latest backup holds.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::Registry`] if the path is not tracked, or the
    ///   registry cannot be saved.
    /// - Return [`EngineError::NoBackupAvailable`] if the patch was never
    ///   applied.
    /// - Return [`EngineError::Backup`] if the backup file is gone.
    /// - Return [`EngineError::SafetyGateDeclined`] if operator declines.
    /// - Return [`EngineError::RemoteIo`] if the remote cannot be read or
    ///   written.
    #[instrument(skip(self, registry), level = "debug")]
    pub fn rollback(
        &self,
        registry: &mut PatchRegistry,
        path: &str,
        dry_run: bool,
    ) -> Result<RollbackOutcome> {
        let path = normalize_path(path);
        let backup = registry
            .require(&path)?
            .backup_reference()
            .cloned()
            .ok_or_else(|| EngineError::NoBackupAvailable { path: path.clone() })?;

        let content = BackupStore::new(self.workspace.remote).read_backup(&backup)?;
        let restored = fingerprint(&content);
        let current = self.workspace.remote.read(&path)?.map(fingerprint);
        let current_label = current
            .as_ref()
            .map_or("<missing>", |checksum| checksum.short());

        info!(
            "restore {path} from {} ({} bytes)",
            backup.backup_path,
            content.len()
        );
        info!("remote is now {}", describe(&current));
        info!("backup holds   {restored}");

        if remote_drifted(registry.require(&path)?, current.as_ref()) {
            warn!("remote {path} changed since the last apply, rolling back discards that change");
        }

        if dry_run {
            return Ok(RollbackOutcome::Planned {
                backup,
                current,
                restored,
            });
        }

        self.workspace.confirm(&format!(
            "roll back {path} on the remote (remote {current_label} -> backup {})",
            restored.short()
        ))?;
        self.workspace.remote.write(&path, &content)?;

        registry.require_mut(&path)?.mark_reverted();
        registry.save()?;
        info!("rolled back {path}");

        Ok(RollbackOutcome::RolledBack {
            backup,
            previous: current,
            restored,
        })
    }
}
