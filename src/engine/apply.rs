// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Apply patches to the remote target.
//!
//! Applying a patch pushes the current local content of the patched file to
//! the remote target. The sequence for one patch is:
//!
//! 1. Read local and remote content, and classify the patch.
//! 2. Stop if the remote already holds the patch, or refuse if the remote
//!    diverged from what was last written, unless forced.
//! 3. Stop after reporting the plan if this is a dry run.
//! 4. Pass the safety gate.
//! 5. Back up the current remote content.
//! 6. Journal the apply in the registry, and save it.
//! 7. Write the local content to the remote.
//! 8. Commit the journaled apply, and save the registry again.
//!
//! # Interrupted Applies
//!
//! The remote write and the registry save cannot be made atomic together.
//! The journal entry of step 6 covers the gap. If the process dies after the
//! write but before the commit, [`ApplyEngine::reconcile`] finds the journal
//! on the next run, and completes or drops it depending on what the remote
//! actually holds.

use crate::{
    backup::{BackupEntry, BackupStore},
    checksum::{fingerprint, Checksum},
    engine::{EngineError, Result, Snapshot, Workspace},
    registry::{normalize_path, AppliedRecord, PatchRegistry},
    state::{classify, remote_drifted, PatchState},
};

use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, instrument, warn};

/// Knobs for an apply.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Report what would happen without writing anything.
    pub dry_run: bool,

    /// Apply even if the remote diverged or already holds the patch.
    pub force: bool,
}

/// Result of applying one patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Remote already holds the patch. Nothing was touched.
    AlreadyCurrent { state: PatchState },

    /// Dry run, nothing was touched.
    Planned {
        state: PatchState,
        backup: bool,
        bytes: usize,
    },

    /// Local content was written to the remote.
    Applied {
        previous: PatchState,
        backup: BackupEntry,
        checksum: Checksum,
    },
}

/// Outcome of applying every outstanding patch.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Patches that were applied or planned.
    pub applied: Vec<(String, ApplyOutcome)>,

    /// Patches that did not need an apply.
    pub skipped: Vec<(String, PatchState)>,

    /// Patches that failed, in registry order.
    pub failed: Vec<(String, EngineError)>,
}

impl BatchReport {
    /// Every patch went through.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Result of reconciling an interrupted apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// Remote holds the journaled content, apply was recorded.
    Committed(String),

    /// Remote does not hold the journaled content, journal was dropped.
    Dropped(String),
}

/// Push local patch content to the remote target.
pub struct ApplyEngine<'a> {
    workspace: Workspace<'a>,
    operator: String,
}

impl<'a> ApplyEngine<'a> {
    /// Construct new apply engine acting on behalf of an operator.
    pub fn new(workspace: Workspace<'a>, operator: impl Into<String>) -> Self {
        Self {
            workspace,
            operator: operator.into(),
        }
    }

    /// Apply one patch.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::Registry`] if the path is not tracked, or the
    ///   registry cannot be saved.
    /// - Return [`EngineError::LocalMissing`] if the local file is gone.
    /// - Return [`EngineError::ConflictDetected`] if the remote diverged and
    ///   force is off. This is raised in dry runs too.
    /// - Return [`EngineError::SafetyGateDeclined`] if operator declines.
    /// - Return [`EngineError::RemoteIo`] if the remote cannot be read,
    ///   backed up, or written.
    #[instrument(skip(self, registry), level = "debug")]
    pub fn apply(
        &self,
        registry: &mut PatchRegistry,
        path: &str,
        options: ApplyOptions,
    ) -> Result<ApplyOutcome> {
        let path = normalize_path(path);
        registry.require(&path)?;
        let plan = self.plan(registry, &path, options)?;
        self.execute(registry, &path, plan, options, false)
    }

    /// Apply every patch that is pending, orphaned, misaligned, or expired.
    ///
    /// Patches are visited in registry order. A failing patch never aborts
    /// the batch. Each success is saved to the registry on its own, so a
    /// rerun after partial failure only retries what failed. The safety gate
    /// is asked once for the whole batch. If the operator declines, nothing
    /// is written and every planned patch lands in the failures of the
    /// report next to those found while planning.
    ///
    /// # Errors
    ///
    /// None for single patches, which are collected in the report instead.
    #[instrument(skip(self, registry, bar), level = "debug")]
    pub fn apply_all(
        &self,
        registry: &mut PatchRegistry,
        options: ApplyOptions,
        bar: &ProgressBar,
    ) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        let paths = registry
            .list()
            .iter()
            .map(|entry| entry.relative_path().to_string())
            .collect::<Vec<_>>();

        let mut plans = Vec::new();
        for path in paths {
            let state = match self.plan(registry, &path, options) {
                Ok(plan) => plan.state,
                Err(err) => {
                    report.failed.push((path, err));
                    continue;
                }
            };

            if state.needs_apply() {
                plans.push(path);
            } else {
                info!("{path} is {state}, skip");
                report.skipped.push((path, state));
            }
        }

        if plans.is_empty() {
            info!("no patches to apply");
            return Ok(report);
        }

        if !options.dry_run {
            let operation = format!("apply {} patches to the remote", plans.len());
            if let Err(err) = self.workspace.confirm(&operation) {
                // Declining fails every planned patch, not the batch.
                let operation = match err {
                    EngineError::SafetyGateDeclined { operation } => operation,
                    err => return Err(err),
                };
                report.failed.extend(plans.into_iter().map(|path| {
                    let err = EngineError::SafetyGateDeclined {
                        operation: operation.clone(),
                    };
                    (path, err)
                }));
                info!(
                    "{} skipped, {} failed",
                    report.skipped.len(),
                    report.failed.len()
                );
                return Ok(report);
            }
        }

        let style = ProgressStyle::with_template(
            "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}] {pos}/{len}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("-Cco.");
        bar.set_style(style);
        bar.set_length(plans.len() as u64);

        for path in plans {
            bar.set_message(path.clone());

            // INVARIANT: Re-plan right before execution, since an earlier
            //   apply in the batch may have saved the registry.
            let result = self
                .plan(registry, &path, options)
                .and_then(|plan| self.execute(registry, &path, plan, options, true));
            match result {
                Ok(outcome) => report.applied.push((path, outcome)),
                Err(err) => {
                    warn!("failed to apply {path}: {err}");
                    report.failed.push((path, err));
                }
            }
            bar.inc(1);
        }
        bar.finish_and_clear();

        info!(
            "{} applied, {} skipped, {} failed",
            report.applied.len(),
            report.skipped.len(),
            report.failed.len()
        );

        Ok(report)
    }

    /// Complete or drop applies that were interrupted.
    ///
    /// Saves the registry if anything changed.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::RemoteIo`] if the remote cannot be read.
    /// - Return [`EngineError::Registry`] if the registry cannot be saved.
    #[instrument(skip(self, registry), level = "debug")]
    pub fn reconcile(&self, registry: &mut PatchRegistry) -> Result<Vec<Reconciled>> {
        let pending = registry
            .list()
            .iter()
            .filter_map(|entry| {
                entry.in_flight().map(|in_flight| {
                    (
                        entry.relative_path().to_string(),
                        in_flight.record.remote_checksum.clone(),
                    )
                })
            })
            .collect::<Vec<_>>();

        let mut reconciled = Vec::new();
        for (path, intended) in pending {
            let remote = self.workspace.remote.read(&path)?.map(fingerprint);
            let entry = registry.require_mut(&path)?;
            if remote.as_ref() == Some(&intended) {
                info!("interrupted apply of {path} reached the remote, record it");
                entry.commit_apply();
                reconciled.push(Reconciled::Committed(path));
            } else {
                warn!("interrupted apply of {path} never reached the remote, drop it");
                entry.abort_apply();
                reconciled.push(Reconciled::Dropped(path));
            }
        }

        if !reconciled.is_empty() {
            registry.save()?;
        }

        Ok(reconciled)
    }

    fn plan(&self, registry: &PatchRegistry, path: &str, options: ApplyOptions) -> Result<Plan> {
        let entry = registry.require(path)?;
        let snapshot = self.workspace.snapshot(path)?;
        let state = classify(entry, &snapshot.observation);
        info!("{path} is {state}");

        if !options.force {
            // INVARIANT: Remote drift blocks an apply even when local drift
            //   is what got reported.
            if state.is_conflict() || remote_drifted(entry, snapshot.observation.remote.as_ref())
            {
                return Err(EngineError::ConflictDetected {
                    path: path.into(),
                    state,
                    expected: entry.remote_checksum_at_apply().cloned(),
                    actual: snapshot.observation.remote.clone(),
                });
            }
        }

        Ok(Plan { state, snapshot })
    }

    fn execute(
        &self,
        registry: &mut PatchRegistry,
        path: &str,
        plan: Plan,
        options: ApplyOptions,
        confirmed: bool,
    ) -> Result<ApplyOutcome> {
        let Plan { state, snapshot } = plan;

        if !options.force && matches!(state, PatchState::Applied | PatchState::Obsolete) {
            if state == PatchState::Obsolete {
                warn!("{path} is applied, but its baseline is obsolete; register it again");
            }
            return Ok(ApplyOutcome::AlreadyCurrent { state });
        }

        let content = snapshot.local.ok_or_else(|| EngineError::LocalMissing {
            path: path.into(),
        })?;

        if options.dry_run {
            info!(
                "dry run: would back up remote {path} and write {} bytes",
                content.len()
            );
            return Ok(ApplyOutcome::Planned {
                state,
                backup: true,
                bytes: content.len(),
            });
        }

        if !confirmed {
            self.workspace
                .confirm(&format!("apply patch {path} to the remote"))?;
        }

        // INVARIANT: A file the patch creates is backed up as empty content.
        let original = snapshot.remote.unwrap_or_default();
        let backup = BackupStore::new(self.workspace.remote).create_backup(path, &original)?;

        let checksum = fingerprint(&content);
        let record = AppliedRecord {
            at: Utc::now(),
            by: self.operator.clone(),
            local_checksum: checksum.clone(),
            remote_checksum: checksum.clone(),
            upstream_version: snapshot.observation.upstream_version,
        };

        registry.require_mut(path)?.begin_apply(record, backup.clone());
        if let Err(err) = registry.save() {
            registry.require_mut(path)?.abort_apply();
            return Err(err.into());
        }

        if let Err(err) = self.workspace.remote.write(path, &content) {
            registry.require_mut(path)?.abort_apply();
            if let Err(save_err) = registry.save() {
                warn!("failed to drop journal of {path}: {save_err}");
            }
            return Err(err.into());
        }

        registry.require_mut(path)?.commit_apply();
        registry.save()?;
        info!("applied {path} ({} bytes)", content.len());

        Ok(ApplyOutcome::Applied {
            previous: state,
            backup,
            checksum,
        })
    }
}

struct Plan {
    state: PatchState,
    snapshot: Snapshot,
}
