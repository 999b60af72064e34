// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Patch state classification.
//!
//! The registry only records what patchsync itself did. Whether a patch is
//! still live is computed on demand by comparing what the registry recorded
//! against fresh checksums of the local and remote file. The result is the
//! __display state__ of a patch.
//!
//! # Display States
//!
//! Exactly one state is derived per patch. Rules are checked in the order
//! below, and the first match wins:
//!
//! 1. __Pending__: the patch was never applied (or was rolled back).
//! 2. __Orphaned__: the local file changed since the last apply.
//! 3. __Expired__: the remote file changed since the last apply, and the
//!    plugin or theme owning it was updated upstream.
//! 4. __Misaligned__: the remote file changed since the last apply without
//!    an upstream update, e.g., a hand edit or a revert outside patchsync.
//! 5. __Obsolete__: local and remote match the last apply, but the pristine
//!    reference copy kept next to the local file no longer matches the
//!    baseline the patch was registered against.
//! 6. __Applied__: local, remote, and registry agree.
//!
//! Local drift is reported before remote drift, because an uncommitted edit
//! by the operator is the most actionable signal.
//!
//! Expired and misaligned can only be told apart when a version signal is
//! available. Without one, remote drift is always reported as misaligned.
//! Both states block a plain apply.

use crate::{checksum::Checksum, registry::PatchEntry};

use std::fmt::{Display, Formatter, Result as FmtResult};

/// Suffix of the pristine reference copy stored next to a local file.
pub const REFERENCE_SUFFIX: &str = ".original.bak";

/// Path of pristine reference copy for patched file.
pub fn reference_path(path: &str) -> String {
    format!("{path}{REFERENCE_SUFFIX}")
}

/// Computed display state of a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchState {
    Pending,
    Orphaned,
    Expired,
    Misaligned,
    Obsolete,
    Applied,
}

impl PatchState {
    /// Remote diverged from what patchsync last wrote.
    pub fn is_conflict(self) -> bool {
        matches!(self, Self::Expired | Self::Misaligned)
    }

    /// Patch is a candidate for apply-all.
    pub fn needs_apply(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Orphaned | Self::Misaligned | Self::Expired
        )
    }

    /// Short explanation for status output.
    pub fn explain(self) -> &'static str {
        match self {
            Self::Pending => "not applied to the remote yet",
            Self::Orphaned => "local file changed since last apply",
            Self::Expired => "remote file replaced by an upstream update",
            Self::Misaligned => "remote file changed outside of patchsync",
            Self::Obsolete => "pristine reference no longer matches registered baseline",
            Self::Applied => "local, remote, and registry agree",
        }
    }
}

impl Display for PatchState {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let label = match self {
            Self::Pending => "pending",
            Self::Orphaned => "orphaned",
            Self::Expired => "expired",
            Self::Misaligned => "misaligned",
            Self::Obsolete => "obsolete",
            Self::Applied => "applied",
        };

        fmt.pad(label)
    }
}

/// Live facts about a patched file.
///
/// A `None` checksum means the file does not exist on that side.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Checksum of current local file.
    pub local: Option<Checksum>,

    /// Checksum of current remote file.
    pub remote: Option<Checksum>,

    /// Checksum of pristine reference copy next to local file.
    pub reference: Option<Checksum>,

    /// Currently installed version of the owning plugin or theme.
    pub upstream_version: Option<String>,
}

/// Derive display state of patch.
pub fn classify(entry: &PatchEntry, observation: &Observation) -> PatchState {
    let Some(applied) = entry.applied() else {
        return PatchState::Pending;
    };

    if observation.local.as_ref() != Some(&applied.local_checksum) {
        return PatchState::Orphaned;
    }

    if observation.remote.as_ref() != Some(&applied.remote_checksum) {
        return match (&applied.upstream_version, &observation.upstream_version) {
            (Some(then), Some(now)) if then != now => PatchState::Expired,
            _ => PatchState::Misaligned,
        };
    }

    match &observation.reference {
        Some(reference) if reference != entry.registered_checksum() => PatchState::Obsolete,
        _ => PatchState::Applied,
    }
}

/// Check if remote differs from what patchsync last wrote.
///
/// Patches that were never applied cannot drift.
pub fn remote_drifted(entry: &PatchEntry, remote: Option<&Checksum>) -> bool {
    entry
        .remote_checksum_at_apply()
        .is_some_and(|expected| Some(expected) != remote)
}
