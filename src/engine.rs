// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Patch lifecycle engines.
//!
//! The engines drive a [`PatchRegistry`] through the patch lifecycle:
//!
//! ```text
//! register --> apply --> rollback --> remove
//!                ^   |       |
//!                |   v       |
//!                +-- apply <-+
//! ```
//!
//! Engines never talk to the network or the file system themselves. Every
//! side effect goes through a [`Workspace`], which bundles the collaborators
//! of one deployment target:
//!
//! - __local__ and __remote__ [`FileAccess`] capabilities,
//! - a [`SafetyGate`] that is consulted before every real remote write,
//! - a [`VersionProbe`] reporting the installed version of the plugin or
//!   theme that owns a patched file.
//!
//! # Safety Guarantee
//!
//! Patchsync never silently overwrites a remote file that diverged from what
//! it last wrote. Such divergence is reported as
//! [`EngineError::ConflictDetected`] with both checksums, and only an
//! explicit force by the operator gets past it. Every real apply takes a
//! backup of the current remote content first, and aborts before writing if
//! the backup cannot be made.

pub mod apply;
pub mod rollback;

use crate::{
    access::{quote, AccessError, FileAccess, Side, SshTree},
    backup::BackupError,
    checksum::{fingerprint, Checksum},
    registry::{PatchEntry, PatchRegistry, RegistryError},
    state::{classify, reference_path, Observation, PatchState},
};

use indicatif::ProgressBar;
use inquire::Confirm;
use tracing::{debug, info, instrument, warn};

/// Production safety confirmation.
pub trait SafetyGate {
    /// Ask whether an operation that writes to the remote side may proceed.
    fn allow(&self, operation: &str) -> bool;
}

/// Safety gate that allows everything.
///
/// Used for targets where production safety is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl SafetyGate for AllowAll {
    fn allow(&self, operation: &str) -> bool {
        debug!("safety gate disabled, allow {operation}");
        true
    }
}

/// Safety gate that asks the operator on the terminal.
///
/// The prompt suspends the given progress bar while waiting for input.
/// Anything other than an explicit "yes" declines.
#[derive(Debug, Clone)]
pub struct PromptGate {
    pub(crate) bar: ProgressBar,
}

impl PromptGate {
    /// Construct new terminal safety gate.
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl SafetyGate for PromptGate {
    #[instrument(skip(self), level = "debug")]
    fn allow(&self, operation: &str) -> bool {
        warn!("production safety is enabled for this site");
        self.bar.suspend(|| {
            Confirm::new(&format!("{operation}?"))
                .with_default(false)
                .with_help_message("this writes to the remote target")
                .prompt()
                .unwrap_or(false)
        })
    }
}

/// Report installed version of the plugin or theme owning a file.
pub trait VersionProbe {
    /// Installed version, or `None` if unknown.
    fn upstream_version(&self, path: &str) -> Option<String>;
}

/// Version probe that never knows anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProbe;

impl VersionProbe for NoProbe {
    fn upstream_version(&self, _path: &str) -> Option<String> {
        None
    }
}

/// Version probe running WP-CLI on the remote host.
#[derive(Debug, Clone)]
pub struct WpCliProbe {
    remote: SshTree,
    root: String,
    wp_command: String,
}

impl WpCliProbe {
    /// Construct new WP-CLI probe.
    ///
    /// The `wp_command` is the shell command used to invoke WP-CLI, e.g.,
    /// `wp` or `php -d memory_limit=512M $(which wp)`.
    pub fn new(remote: SshTree, root: impl Into<String>, wp_command: impl Into<String>) -> Self {
        Self {
            remote,
            root: root.into(),
            wp_command: wp_command.into(),
        }
    }
}

impl VersionProbe for WpCliProbe {
    #[instrument(skip(self), level = "debug")]
    fn upstream_version(&self, path: &str) -> Option<String> {
        let (kind, slug) = upstream_owner(path)?;
        let script = format!(
            "cd {} && {} {kind} get {} --field=version",
            quote(&self.root),
            self.wp_command,
            quote(slug)
        );

        let output = match self.remote.run(&script, None) {
            Ok(output) => output,
            Err(err) => {
                debug!("cannot run wp-cli on {}: {err}", self.remote.host());
                return None;
            }
        };

        if !output.status.success() {
            debug!(
                "wp-cli failed for {kind} {slug}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return None;
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!version.is_empty()).then_some(version)
    }
}

/// Determine plugin or theme owning a path.
///
/// Returns the WP-CLI item kind ("plugin" or "theme") and the item slug.
pub fn upstream_owner(path: &str) -> Option<(&'static str, &str)> {
    let mut parts = path.split('/').skip_while(|part| *part != "wp-content");
    parts.next()?;
    let kind = match parts.next()? {
        "plugins" => "plugin",
        "themes" => "theme",
        _ => return None,
    };

    // INVARIANT: Single file plugins live directly in the plugins directory.
    let slug = parts.next()?;
    parts.next()?;

    Some((kind, slug))
}

/// Collaborators of one deployment target.
#[derive(Clone, Copy)]
pub struct Workspace<'a> {
    pub local: &'a dyn FileAccess,
    pub remote: &'a dyn FileAccess,
    pub gate: &'a dyn SafetyGate,
    pub probe: &'a dyn VersionProbe,
}

impl<'a> Workspace<'a> {
    /// Construct new workspace.
    pub fn new(
        local: &'a dyn FileAccess,
        remote: &'a dyn FileAccess,
        gate: &'a dyn SafetyGate,
        probe: &'a dyn VersionProbe,
    ) -> Self {
        Self {
            local,
            remote,
            gate,
            probe,
        }
    }

    /// Collect live facts about a patched file.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::LocalIo`] if local file cannot be read.
    /// - Return [`EngineError::RemoteIo`] if remote file cannot be read.
    pub fn observe(&self, path: &str) -> Result<Observation> {
        Ok(self.snapshot(path)?.observation)
    }

    /// Derive display state of patch from live facts.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::LocalIo`] if local file cannot be read.
    /// - Return [`EngineError::RemoteIo`] if remote file cannot be read.
    pub fn status(&self, entry: &PatchEntry) -> Result<(PatchState, Observation)> {
        let observation = self.observe(entry.relative_path())?;
        Ok((classify(entry, &observation), observation))
    }

    fn confirm(&self, operation: &str) -> Result<()> {
        if !self.gate.allow(operation) {
            warn!("operation declined: {operation}");
            return Err(EngineError::SafetyGateDeclined {
                operation: operation.into(),
            });
        }

        Ok(())
    }

    pub(crate) fn snapshot(&self, path: &str) -> Result<Snapshot> {
        let local = self.local.read(path)?;
        let remote = self.remote.read(path)?;
        let reference = self.local.read(&reference_path(path))?;
        let upstream_version = self.probe.upstream_version(path);

        let observation = Observation {
            local: local.as_ref().map(fingerprint),
            remote: remote.as_ref().map(fingerprint),
            reference: reference.as_ref().map(fingerprint),
            upstream_version,
        };

        Ok(Snapshot {
            local,
            remote,
            observation,
        })
    }
}

/// File contents behind an observation.
pub(crate) struct Snapshot {
    pub(crate) local: Option<Vec<u8>>,
    pub(crate) remote: Option<Vec<u8>>,
    pub(crate) observation: Observation,
}

/// Register new patch.
///
/// Downloads the current remote content as the unpatched baseline, and keeps
/// it next to the local file as a pristine reference copy. If the remote file
/// does not exist yet, the patch creates a new file, and the baseline is the
/// checksum of empty content. The caller must save the registry.
///
/// # Errors
///
/// - Return [`EngineError::Registry`] with
///   [`RegistryError::DuplicatePatch`] if path is already tracked.
/// - Return [`EngineError::LocalMissing`] if local file does not exist.
/// - Return [`EngineError::RemoteIo`] if remote file cannot be read.
/// - Return [`EngineError::LocalIo`] if reference copy cannot be written.
#[instrument(skip(workspace, registry, description), level = "debug")]
pub fn register<'r>(
    workspace: &Workspace<'_>,
    registry: &'r mut PatchRegistry,
    path: &str,
    description: Option<String>,
) -> Result<&'r PatchEntry> {
    let path = crate::registry::normalize_path(path);
    if registry.get(&path).is_some() {
        return Err(RegistryError::DuplicatePatch { path }.into());
    }

    let local = workspace
        .local
        .read(&path)?
        .ok_or_else(|| EngineError::LocalMissing { path: path.clone() })?;

    let baseline = match workspace.remote.read(&path)? {
        Some(original) => {
            workspace.local.write(&reference_path(&path), &original)?;
            info!("original content kept at {}", reference_path(&path));
            fingerprint(&original)
        }
        None => {
            info!("{path} does not exist on the remote, patch creates it");
            fingerprint(b"")
        }
    };

    if fingerprint(&local) == baseline {
        warn!("local and remote {path} are identical, nothing to patch yet");
    }

    Ok(registry.register(&path, description, baseline)?)
}

/// Remove patch from registry.
///
/// Removing a patch that is live on the remote loses the record of that
/// change, so it goes through the safety gate first. Backups are never
/// deleted. The caller must save the registry.
///
/// # Errors
///
/// - Return [`EngineError::Registry`] with [`RegistryError::NotFound`] if
///   path is not tracked.
/// - Return [`EngineError::SafetyGateDeclined`] if operator declines.
pub fn remove(
    workspace: &Workspace<'_>,
    registry: &mut PatchRegistry,
    path: &str,
) -> Result<PatchEntry> {
    let entry = registry.require(path)?;
    if entry.applied().is_some() {
        warn!("{} is applied on the remote", entry.relative_path());
        workspace.confirm(&format!(
            "remove applied patch {} from the registry",
            entry.relative_path()
        ))?;
    }

    Ok(registry.remove(path)?)
}

fn describe(checksum: &Option<Checksum>) -> String {
    match checksum {
        Some(checksum) => checksum.to_string(),
        None => "<missing>".into(),
    }
}

/// Engine error types.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Registry lookup or persistence fails.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Local file of patch does not exist.
    #[error("local file {path:?} does not exist")]
    LocalMissing { path: String },

    /// Remote diverged from what was last written.
    #[error(
        "{path:?} is {state}: expected remote checksum {}, found {} (use force to overwrite)",
        describe(.expected),
        describe(.actual)
    )]
    ConflictDetected {
        path: String,
        state: PatchState,
        expected: Option<Checksum>,
        actual: Option<Checksum>,
    },

    /// Patch has never been applied, so there is nothing to restore.
    #[error("no backup available for {path:?}")]
    NoBackupAvailable { path: String },

    /// Operator declined production safety confirmation.
    #[error("operation declined: {operation}")]
    SafetyGateDeclined { operation: String },

    /// Remote transport or permission failure.
    #[error(transparent)]
    RemoteIo(AccessError),

    /// Local file system failure.
    #[error(transparent)]
    LocalIo(AccessError),

    /// Backup cannot be located.
    #[error(transparent)]
    Backup(BackupError),
}

impl From<AccessError> for EngineError {
    fn from(err: AccessError) -> Self {
        match err.side() {
            Side::Local => Self::LocalIo(err),
            Side::Remote => Self::RemoteIo(err),
        }
    }
}

impl From<BackupError> for EngineError {
    fn from(err: BackupError) -> Self {
        match err {
            BackupError::Access(err) => err.into(),
            err => Self::Backup(err),
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = EngineError> = std::result::Result<T, E>;
