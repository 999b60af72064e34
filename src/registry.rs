// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Patch registry management.
//!
//! Patchsync keeps one __registry__ per deployment target (site). A registry
//! is an ordered catalog of every tracked patch, keyed by the path of the
//! patched file relative to the WordPress root. The registry is pure data
//! access. It never decides what a patch's state is, nor does it talk to the
//! remote side.
//!
//! # Registry File Layout
//!
//! A registry is persisted as a TOML document, by default at
//! `$XDG_DATA_HOME/patchsync/<site>.lock.toml`. Each patch is an entry in the
//! `[[patch]]` table array, kept in registration order:
//!
//! ```toml
//! site = "production"
//!
//! [[patch]]
//! path = "wp-content/plugins/acme/x.php"
//! description = "fix nonce check"
//! registered_checksum = "e3b0c442..."
//! registered_at = "2025-10-17T12:00:00Z"
//! status = "applied"
//!
//! [patch.applied]
//! at = "2025-10-17T12:05:00Z"
//! by = "jane"
//! local_checksum = "9f86d081..."
//! remote_checksum = "9f86d081..."
//!
//! [patch.backup]
//! original_path = "wp-content/plugins/acme/x.php"
//! backup_path = "wp-content/plugins/acme/x.php.20251017T120500.bak"
//! created_at = "2025-10-17T12:05:00Z"
//! ```
//!
//! # Persistence
//!
//! All mutation happens on the in-memory copy. Nothing is written until the
//! caller invokes [`PatchRegistry::save`], which writes the whole document to
//! a temporary file next to the registry and renames it into place. Thus, a
//! registry file is never partially written.
//!
//! Two processes working on the same registry at once is NOT safe. There is
//! no file locking, and the last save wins.

use crate::{backup::BackupEntry, checksum::Checksum};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::read_to_string,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument};

/// Registry bookkeeping flag.
///
/// This is NOT the display state of a patch. The display state is computed
/// from live checksums by [`classify`](crate::state::classify).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleFlag {
    #[default]
    Registered,
    Applied,
    Reverted,
}

impl Display for LifecycleFlag {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Registered => fmt.write_str("registered"),
            Self::Applied => fmt.write_str("applied"),
            Self::Reverted => fmt.write_str("reverted"),
        }
    }
}

/// Record of the last successful apply.
///
/// Grouping these fields makes it impossible for only some of them to be set.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AppliedRecord {
    /// Time of apply.
    pub at: DateTime<Utc>,

    /// Operator that applied the patch.
    pub by: String,

    /// Local content checksum at apply.
    pub local_checksum: Checksum,

    /// Remote content checksum right after apply.
    pub remote_checksum: Checksum,

    /// Installed version of the owning plugin or theme at apply, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_version: Option<String>,
}

/// Apply that was started but whose outcome was never recorded.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct InFlight {
    /// Record to commit once the remote write is confirmed.
    pub record: AppliedRecord,

    /// Backup taken right before the write.
    pub backup: BackupEntry,
}

/// One tracked patch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PatchEntry {
    path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,

    registered_checksum: Checksum,
    registered_at: DateTime<Utc>,

    #[serde(default)]
    status: LifecycleFlag,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    applied: Option<AppliedRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    backup: Option<BackupEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    reverted_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    in_flight: Option<InFlight>,
}

impl PatchEntry {
    fn new(path: String, description: Option<String>, baseline: Checksum) -> Self {
        Self {
            path,
            description,
            registered_checksum: baseline,
            registered_at: Utc::now(),
            status: LifecycleFlag::Registered,
            applied: None,
            backup: None,
            reverted_at: None,
            in_flight: None,
        }
    }

    /// Path of patched file relative to WordPress root.
    pub fn relative_path(&self) -> &str {
        self.path.as_str()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Checksum of the unpatched content the operator started editing from.
    pub fn registered_checksum(&self) -> &Checksum {
        &self.registered_checksum
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    pub fn lifecycle_flag(&self) -> LifecycleFlag {
        self.status
    }

    /// Record of last successful apply, if any.
    pub fn applied(&self) -> Option<&AppliedRecord> {
        self.applied.as_ref()
    }

    pub fn applied_at(&self) -> Option<DateTime<Utc>> {
        self.applied.as_ref().map(|record| record.at)
    }

    pub fn applied_by(&self) -> Option<&str> {
        self.applied.as_ref().map(|record| record.by.as_str())
    }

    pub fn local_checksum_at_apply(&self) -> Option<&Checksum> {
        self.applied.as_ref().map(|record| &record.local_checksum)
    }

    pub fn remote_checksum_at_apply(&self) -> Option<&Checksum> {
        self.applied.as_ref().map(|record| &record.remote_checksum)
    }

    /// Backup created by the last successful apply.
    pub fn backup_reference(&self) -> Option<&BackupEntry> {
        self.backup.as_ref()
    }

    /// Time of last rollback, unless the patch was applied again since.
    pub fn reverted_at(&self) -> Option<DateTime<Utc>> {
        self.reverted_at
    }

    /// Apply whose outcome was never recorded.
    pub fn in_flight(&self) -> Option<&InFlight> {
        self.in_flight.as_ref()
    }

    /// Journal an apply that is about to write to the remote side.
    pub fn begin_apply(&mut self, record: AppliedRecord, backup: BackupEntry) {
        self.in_flight = Some(InFlight { record, backup });
    }

    /// Commit journaled apply as successful.
    ///
    /// Returns `false` if there was no journaled apply.
    pub fn commit_apply(&mut self) -> bool {
        match self.in_flight.take() {
            Some(in_flight) => {
                self.applied = Some(in_flight.record);
                self.backup = Some(in_flight.backup);
                self.reverted_at = None;
                self.status = LifecycleFlag::Applied;
                true
            }
            None => false,
        }
    }

    /// Drop journaled apply without recording it.
    pub fn abort_apply(&mut self) -> Option<InFlight> {
        self.in_flight.take()
    }

    /// Mark patch as reverted.
    ///
    /// Clears the applied record so the patch shows up as pending again. The
    /// backup reference is kept, since the backup itself is kept.
    pub fn mark_reverted(&mut self) {
        self.applied = None;
        self.in_flight = None;
        self.reverted_at = Some(Utc::now());
        self.status = LifecycleFlag::Reverted;
    }

    fn check_invariants(&self) -> std::result::Result<(), String> {
        let path = &self.path;
        match (self.status, &self.applied, &self.backup) {
            (LifecycleFlag::Applied, Some(_), Some(_)) => Ok(()),
            (LifecycleFlag::Applied, _, _) => Err(format!(
                "patch {path:?} is marked applied without apply record or backup"
            )),
            (LifecycleFlag::Registered, None, None) => Ok(()),
            (LifecycleFlag::Registered, _, _) => Err(format!(
                "patch {path:?} is marked registered but carries apply data"
            )),
            (LifecycleFlag::Reverted, None, Some(_)) => Ok(()),
            (LifecycleFlag::Reverted, _, _) => Err(format!(
                "patch {path:?} is marked reverted but apply data is inconsistent"
            )),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RegistryDocument {
    #[serde(default)]
    site: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,

    #[serde(default, rename = "patch")]
    patches: Vec<PatchEntry>,
}

/// Catalog of tracked patches for one deployment target.
#[derive(Debug, Clone)]
pub struct PatchRegistry {
    registry_path: PathBuf,
    site: String,
    patches: Vec<PatchEntry>,
}

impl PatchRegistry {
    /// Construct new empty registry that will be saved at given path.
    pub fn new(registry_path: impl Into<PathBuf>, site: impl Into<String>) -> Self {
        Self {
            registry_path: registry_path.into(),
            site: site.into(),
            patches: Vec::new(),
        }
    }

    /// Load registry fully into memory.
    ///
    /// A missing registry file yields an empty registry. The file is created
    /// on first save.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::Read`] if registry file cannot be read.
    /// - Return [`RegistryError::Corrupt`] if registry file is malformed or
    ///   violates registry invariants.
    #[instrument(skip(registry_path), level = "debug")]
    pub fn load(registry_path: impl AsRef<Path>, site: &str) -> Result<Self> {
        let registry_path = registry_path.as_ref();
        let data = match read_to_string(registry_path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("no registry at {:?}, start empty", registry_path.display());
                return Ok(Self::new(registry_path, site));
            }
            Err(err) => {
                return Err(RegistryError::Read {
                    source: err,
                    registry_path: registry_path.into(),
                })
            }
        };

        let corrupt = |reason: String| RegistryError::Corrupt {
            registry_path: registry_path.into(),
            reason,
        };

        let document: RegistryDocument =
            toml::from_str(&data).map_err(|err| corrupt(err.to_string()))?;

        let mut seen = HashSet::new();
        for entry in &document.patches {
            if !seen.insert(entry.path.as_str()) {
                return Err(corrupt(format!("duplicate patch {:?}", entry.path)));
            }
            entry.check_invariants().map_err(corrupt)?;
        }

        if !document.site.is_empty() && document.site != site {
            return Err(corrupt(format!(
                "registry belongs to site {:?}, not {site:?}",
                document.site
            )));
        }

        debug!(
            "loaded {} patches from {:?}",
            document.patches.len(),
            registry_path.display()
        );

        Ok(Self {
            registry_path: registry_path.into(),
            site: site.into(),
            patches: document.patches,
        })
    }

    /// Persist registry atomically.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::Serialize`] if registry cannot be serialized.
    /// - Return [`RegistryError::Persist`] if registry file cannot be
    ///   written.
    #[instrument(skip(self), level = "debug")]
    pub fn save(&self) -> Result<()> {
        let document = RegistryDocument {
            site: self.site.clone(),
            updated_at: Some(Utc::now()),
            patches: self.patches.clone(),
        };
        let data = toml::to_string_pretty(&document)?;

        let persist_err = |err| RegistryError::Persist {
            source: err,
            registry_path: self.registry_path.clone(),
        };

        let parent = match self.registry_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        mkdirp::mkdirp(&parent).map_err(persist_err)?;

        let mut temp = NamedTempFile::new_in(&parent).map_err(persist_err)?;
        temp.write_all(data.as_bytes()).map_err(persist_err)?;
        temp.as_file().sync_all().map_err(persist_err)?;
        temp.persist(&self.registry_path)
            .map_err(|err| persist_err(err.error))?;

        debug!("saved registry {:?}", self.registry_path.display());

        Ok(())
    }

    /// Register new patch.
    ///
    /// The `baseline` is the checksum of the unpatched content.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::DuplicatePatch`] if path is already tracked.
    pub fn register(
        &mut self,
        path: &str,
        description: Option<String>,
        baseline: Checksum,
    ) -> Result<&PatchEntry> {
        let path = normalize_path(path);
        if self.get(&path).is_some() {
            return Err(RegistryError::DuplicatePatch { path });
        }

        let description = description.filter(|description| !description.trim().is_empty());
        info!("register patch {path}");
        self.patches.push(PatchEntry::new(path, description, baseline));

        Ok(&self.patches[self.patches.len() - 1])
    }

    /// Remove patch from registry.
    ///
    /// Backups of the patched file are left alone.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::NotFound`] if path is not tracked.
    pub fn remove(&mut self, path: &str) -> Result<PatchEntry> {
        let path = normalize_path(path);
        let index = self
            .position(&path)
            .ok_or_else(|| RegistryError::NotFound { path: path.clone() })?;

        info!("remove patch {path}");
        Ok(self.patches.remove(index))
    }

    /// Get patch by path.
    pub fn get(&self, path: &str) -> Option<&PatchEntry> {
        self.position(path).map(|index| &self.patches[index])
    }

    /// Get mutable patch by path.
    pub fn get_mut(&mut self, path: &str) -> Option<&mut PatchEntry> {
        self.position(path).map(|index| &mut self.patches[index])
    }

    /// Get patch by path, or fail.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::NotFound`] if path is not tracked.
    pub fn require(&self, path: &str) -> Result<&PatchEntry> {
        self.get(path).ok_or_else(|| RegistryError::NotFound {
            path: normalize_path(path),
        })
    }

    /// Get mutable patch by path, or fail.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::NotFound`] if path is not tracked.
    pub fn require_mut(&mut self, path: &str) -> Result<&mut PatchEntry> {
        let path = normalize_path(path);
        match self.position(&path) {
            Some(index) => Ok(&mut self.patches[index]),
            None => Err(RegistryError::NotFound { path }),
        }
    }

    /// All patches in registration order.
    pub fn list(&self) -> &[PatchEntry] {
        self.patches.as_slice()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn site(&self) -> &str {
        self.site.as_str()
    }

    pub fn registry_path(&self) -> &Path {
        self.registry_path.as_path()
    }

    fn position(&self, path: &str) -> Option<usize> {
        let path = normalize_path(path);
        self.patches.iter().position(|entry| entry.path == path)
    }
}

/// Normalize user supplied path relative to the WordPress root.
///
/// Backslashes become slashes, and empty or `.` segments are dropped, so
/// every spelling of a file maps to one registry key.
pub fn normalize_path(path: &str) -> String {
    path.trim()
        .replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Registry error types.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Path is already tracked.
    #[error("patch for {path:?} is already registered")]
    DuplicatePatch { path: String },

    /// Path is not tracked.
    #[error("no patch registered for {path:?}")]
    NotFound { path: String },

    /// Registry file is malformed.
    #[error("registry {:?} is corrupt: {reason}", .registry_path.display())]
    Corrupt {
        registry_path: PathBuf,
        reason: String,
    },

    /// Registry file cannot be read.
    #[error("failed to read registry {:?}", .registry_path.display())]
    Read {
        #[source]
        source: std::io::Error,
        registry_path: PathBuf,
    },

    /// Registry cannot be serialized.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Registry file cannot be written.
    #[error("failed to write registry {:?}", .registry_path.display())]
    Persist {
        #[source]
        source: std::io::Error,
        registry_path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = RegistryError> = std::result::Result<T, E>;
