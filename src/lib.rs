// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Track, apply, and roll back patches to WordPress files.
//!
//! A __patch__ is a locally modified copy of a file that lives inside a
//! WordPress installation, usually a file shipped by a plugin or theme.
//! Patchsync records every patch in a per-site registry, pushes patched
//! content to the remote installation, backs up whatever it overwrites, and
//! can put the original content back.
//!
//! # Moving Parts
//!
//! - [`registry`] persists the catalog of tracked patches.
//! - [`access`] reads and writes files on the local or remote side.
//! - [`backup`] keeps timestamped copies of overwritten remote content.
//! - [`state`] derives the live state of a patch from fresh checksums.
//! - [`engine`] ties the above together into register, apply, and rollback.
//!
//! Patchsync never resolves a conflict on its own. If the remote changed
//! behind its back, it refuses to write until told to force the write.

pub mod access;
pub mod backup;
pub mod checksum;
pub mod config;
pub mod engine;
pub mod path;
pub mod registry;
pub mod state;

pub use access::{FileAccess, LocalTree, Side, SshTree};
pub use checksum::{fingerprint, Checksum};
pub use engine::{
    apply::{ApplyEngine, ApplyOptions, ApplyOutcome, BatchReport, Reconciled},
    rollback::{RollbackEngine, RollbackOutcome},
    EngineError, Workspace,
};
pub use registry::{PatchEntry, PatchRegistry};
pub use state::PatchState;
