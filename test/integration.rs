// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::SiteFixture;

use patchsync::{
    access::FileAccess,
    checksum::fingerprint,
    engine::{
        apply::{ApplyEngine, ApplyOptions, ApplyOutcome, Reconciled},
        register, remove,
        rollback::{RollbackEngine, RollbackOutcome},
        EngineError,
    },
    registry::{AppliedRecord, LifecycleFlag, PatchRegistry, RegistryError},
    state::PatchState,
};

use anyhow::Result;
use chrono::Utc;
use indicatif::ProgressBar;
use pretty_assertions::assert_eq;

const X_PHP: &str = "wp-content/plugins/acme/x.php";
const FUNCTIONS_PHP: &str = "wp-content/themes/twenty/functions.php";

fn state_of(site: &SiteFixture, path: &str) -> Result<PatchState> {
    let registry = site.registry()?;
    Ok(site.workspace().status(registry.require(path)?)?.0)
}

/// Register `X_PHP` with remote content C0 and local content L1.
fn registered_site() -> Result<SiteFixture> {
    let site = SiteFixture::new()?;
    site.remote.put(X_PHP, "C0");
    site.edit_local(X_PHP, "L1")?;

    let mut registry = site.registry()?;
    register(&site.workspace(), &mut registry, X_PHP, Some("fix nonce".into()))?;
    registry.save()?;

    Ok(site)
}

fn apply(
    site: &SiteFixture,
    path: &str,
    options: ApplyOptions,
) -> Result<ApplyOutcome, EngineError> {
    let mut registry = PatchRegistry::load(site.registry_path(), "production")?;
    ApplyEngine::new(site.workspace(), "jane").apply(&mut registry, path, options)
}

fn force() -> ApplyOptions {
    ApplyOptions {
        dry_run: false,
        force: true,
    }
}

#[test]
fn scenario_a_register_is_pending() -> Result<()> {
    let site = registered_site()?;

    let registry = site.registry()?;
    let entry = registry.require(X_PHP)?;
    assert_eq!(entry.registered_checksum(), &fingerprint("C0"));
    assert_eq!(entry.description(), Some("fix nonce"));
    assert_eq!(entry.lifecycle_flag(), LifecycleFlag::Registered);
    assert_eq!(state_of(&site, X_PHP)?, PatchState::Pending);
    assert_eq!(
        site.local.read(&format!("{X_PHP}.original.bak"))?,
        Some(b"C0".to_vec())
    );

    let mut registry = site.registry()?;
    let result = register(&site.workspace(), &mut registry, X_PHP, None);
    assert!(matches!(
        result,
        Err(EngineError::Registry(RegistryError::DuplicatePatch { .. }))
    ));

    Ok(())
}

#[test]
fn scenario_b_apply() -> Result<()> {
    let site = registered_site()?;

    let outcome = apply(&site, X_PHP, ApplyOptions::default())?;
    assert!(matches!(
        outcome,
        ApplyOutcome::Applied {
            previous: PatchState::Pending,
            ..
        }
    ));
    assert_eq!(site.remote.get(X_PHP), Some("L1".into()));
    assert_eq!(state_of(&site, X_PHP)?, PatchState::Applied);

    let backups = site.remote.backups_of(X_PHP);
    assert_eq!(backups.len(), 1);
    assert_eq!(site.remote.get(&backups[0]), Some("C0".into()));

    let registry = site.registry()?;
    let entry = registry.require(X_PHP)?;
    assert_eq!(entry.applied_by(), Some("jane"));
    assert_eq!(entry.local_checksum_at_apply(), Some(&fingerprint("L1")));
    assert_eq!(entry.remote_checksum_at_apply(), Some(&fingerprint("L1")));
    assert_eq!(
        entry.backup_reference().map(|backup| backup.backup_path.as_str()),
        Some(backups[0].as_str())
    );
    assert_eq!(site.gate.asked.borrow().len(), 1);

    Ok(())
}

#[test]
fn apply_twice_is_idempotent() -> Result<()> {
    let site = registered_site()?;
    apply(&site, X_PHP, ApplyOptions::default())?;
    let before = std::fs::read_to_string(site.registry_path())?;

    let outcome = apply(&site, X_PHP, ApplyOptions::default())?;
    assert_eq!(
        outcome,
        ApplyOutcome::AlreadyCurrent {
            state: PatchState::Applied
        }
    );
    assert_eq!(std::fs::read_to_string(site.registry_path())?, before);
    assert_eq!(site.remote.backups_of(X_PHP).len(), 1);

    Ok(())
}

#[test]
fn scenario_c_local_edit_orphans_patch() -> Result<()> {
    let site = registered_site()?;
    apply(&site, X_PHP, ApplyOptions::default())?;

    site.edit_local(X_PHP, "L2")?;
    assert_eq!(state_of(&site, X_PHP)?, PatchState::Orphaned);

    // Orphaned patches are simply re-applied.
    let outcome = apply(&site, X_PHP, ApplyOptions::default())?;
    assert!(matches!(
        outcome,
        ApplyOutcome::Applied {
            previous: PatchState::Orphaned,
            ..
        }
    ));
    assert_eq!(site.remote.get(X_PHP), Some("L2".into()));
    assert_eq!(state_of(&site, X_PHP)?, PatchState::Applied);

    Ok(())
}

#[test]
fn scenario_d_remote_overwrite_conflicts() -> Result<()> {
    let site = registered_site()?;
    apply(&site, X_PHP, ApplyOptions::default())?;

    site.remote.put(X_PHP, "R3");
    assert_eq!(state_of(&site, X_PHP)?, PatchState::Misaligned);

    let result = apply(&site, X_PHP, ApplyOptions::default());
    match result {
        Err(EngineError::ConflictDetected {
            state,
            expected,
            actual,
            ..
        }) => {
            assert_eq!(state, PatchState::Misaligned);
            assert_eq!(expected, Some(fingerprint("L1")));
            assert_eq!(actual, Some(fingerprint("R3")));
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(site.remote.get(X_PHP), Some("R3".into()));
    assert_eq!(site.remote.backups_of(X_PHP).len(), 1);

    // Dry runs report conflicts too.
    let dry_run = ApplyOptions {
        dry_run: true,
        force: false,
    };
    assert!(matches!(
        apply(&site, X_PHP, dry_run),
        Err(EngineError::ConflictDetected { .. })
    ));

    let outcome = apply(&site, X_PHP, force())?;
    let ApplyOutcome::Applied { backup, .. } = outcome else {
        panic!("expected forced apply");
    };
    assert_eq!(site.remote.get(X_PHP), Some("L1".into()));
    assert_eq!(site.remote.get(&backup.backup_path), Some("R3".into()));
    assert_eq!(site.remote.backups_of(X_PHP).len(), 2);
    assert_eq!(state_of(&site, X_PHP)?, PatchState::Applied);

    Ok(())
}

#[test]
fn scenario_e_rollback_restores_original() -> Result<()> {
    let site = registered_site()?;
    apply(&site, X_PHP, ApplyOptions::default())?;

    let mut registry = site.registry()?;
    let outcome = RollbackEngine::new(site.workspace()).rollback(&mut registry, X_PHP, false)?;
    assert!(matches!(outcome, RollbackOutcome::RolledBack { .. }));
    assert_eq!(site.remote.get(X_PHP), Some("C0".into()));
    assert_eq!(state_of(&site, X_PHP)?, PatchState::Pending);
    assert_eq!(
        site.registry()?.require(X_PHP)?.lifecycle_flag(),
        LifecycleFlag::Reverted
    );

    // Reverted patches can be applied again.
    apply(&site, X_PHP, ApplyOptions::default())?;
    assert_eq!(site.remote.get(X_PHP), Some("L1".into()));
    assert_eq!(state_of(&site, X_PHP)?, PatchState::Applied);

    Ok(())
}

#[test]
fn upstream_update_expires_patch() -> Result<()> {
    let site = registered_site()?;
    site.probe.set("1.0.0");
    apply(&site, X_PHP, ApplyOptions::default())?;
    assert_eq!(
        site.registry()?
            .require(X_PHP)?
            .applied()
            .and_then(|applied| applied.upstream_version.clone()),
        Some("1.0.0".into())
    );

    site.remote.put(X_PHP, "C0 from 1.1.0");
    site.probe.set("1.1.0");
    assert_eq!(state_of(&site, X_PHP)?, PatchState::Expired);
    assert!(matches!(
        apply(&site, X_PHP, ApplyOptions::default()),
        Err(EngineError::ConflictDetected {
            state: PatchState::Expired,
            ..
        })
    ));

    Ok(())
}

#[test]
fn reregistering_against_new_baseline_obsoletes_patch() -> Result<()> {
    let site = registered_site()?;
    apply(&site, X_PHP, ApplyOptions::default())?;

    // Operator refreshed the pristine copy from a newer release by hand.
    site.edit_local(&format!("{X_PHP}.original.bak"), "C0 from 1.1.0")?;
    assert_eq!(state_of(&site, X_PHP)?, PatchState::Obsolete);

    let outcome = apply(&site, X_PHP, ApplyOptions::default())?;
    assert_eq!(
        outcome,
        ApplyOutcome::AlreadyCurrent {
            state: PatchState::Obsolete
        }
    );

    Ok(())
}

#[test]
fn apply_all_continues_past_failures() -> Result<()> {
    let site = registered_site()?;
    site.remote.put(FUNCTIONS_PHP, "T0");
    site.edit_local(FUNCTIONS_PHP, "T1")?;
    site.edit_local("wp-config.php", "new config")?;

    let mut registry = site.registry()?;
    register(&site.workspace(), &mut registry, FUNCTIONS_PHP, None)?;
    register(&site.workspace(), &mut registry, "wp-config.php", None)?;
    registry.save()?;
    site.remote.fail_writes_to(FUNCTIONS_PHP);

    let engine = ApplyEngine::new(site.workspace(), "jane");
    let report = engine.apply_all(&mut registry, ApplyOptions::default(), &ProgressBar::hidden())?;
    let applied = report
        .applied
        .iter()
        .map(|(path, _)| path.as_str())
        .collect::<Vec<_>>();
    let failed = report
        .failed
        .iter()
        .map(|(path, _)| path.as_str())
        .collect::<Vec<_>>();
    assert_eq!(applied, vec![X_PHP, "wp-config.php"]);
    assert_eq!(failed, vec![FUNCTIONS_PHP]);
    assert!(!report.is_success());
    assert!(matches!(report.failed[0].1, EngineError::RemoteIo(_)));
    assert_eq!(site.gate.asked.borrow().len(), 1);

    // New remote files are created, with an empty backup.
    assert_eq!(site.remote.get("wp-config.php"), Some("new config".into()));
    let backups = site.remote.backups_of("wp-config.php");
    assert_eq!(site.remote.get(&backups[0]), Some(String::new()));

    // Failed write left no apply record, nor a dangling journal.
    let registry = site.registry()?;
    let entry = registry.require(FUNCTIONS_PHP)?;
    assert_eq!(entry.applied(), None);
    assert!(entry.in_flight().is_none());
    assert_eq!(site.remote.get(FUNCTIONS_PHP), Some("T0".into()));

    // Second run only touches what is still outstanding.
    let mut registry = registry;
    let report = engine.apply_all(&mut registry, ApplyOptions::default(), &ProgressBar::hidden())?;
    assert_eq!(report.skipped.len(), 2);
    assert_eq!(report.failed.len(), 1);

    Ok(())
}

#[test]
fn declined_gate_blocks_every_write() -> Result<()> {
    let site = registered_site()?;
    site.gate.answer.set(false);

    assert!(matches!(
        apply(&site, X_PHP, ApplyOptions::default()),
        Err(EngineError::SafetyGateDeclined { .. })
    ));
    let mut registry = site.registry()?;
    let engine = ApplyEngine::new(site.workspace(), "jane");
    let report =
        engine.apply_all(&mut registry, ApplyOptions::default(), &ProgressBar::hidden())?;
    assert!(report.applied.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, X_PHP);
    assert!(matches!(
        report.failed[0].1,
        EngineError::SafetyGateDeclined { .. }
    ));
    assert_eq!(site.remote.get(X_PHP), Some("C0".into()));
    assert!(site.remote.backups_of(X_PHP).is_empty());

    site.gate.answer.set(true);
    apply(&site, X_PHP, ApplyOptions::default())?;
    site.gate.answer.set(false);

    let mut registry = site.registry()?;
    assert!(matches!(
        remove(&site.workspace(), &mut registry, X_PHP),
        Err(EngineError::SafetyGateDeclined { .. })
    ));
    assert!(registry.get(X_PHP).is_some());

    Ok(())
}

#[test]
fn failed_backup_aborts_apply() -> Result<()> {
    let site = registered_site()?;
    site.remote.fail_writes_ending_with(".bak");

    assert!(matches!(
        apply(&site, X_PHP, ApplyOptions::default()),
        Err(EngineError::RemoteIo(_))
    ));
    assert_eq!(site.remote.get(X_PHP), Some("C0".into()));
    assert!(site.remote.backups_of(X_PHP).is_empty());
    assert_eq!(site.gate.asked.borrow().len(), 1);

    let registry = site.registry()?;
    let entry = registry.require(X_PHP)?;
    assert_eq!(entry.applied(), None);
    assert_eq!(entry.in_flight(), None);
    assert_eq!(entry.backup_reference(), None);
    assert_eq!(state_of(&site, X_PHP)?, PatchState::Pending);

    Ok(())
}

#[test]
fn remove_keeps_backups() -> Result<()> {
    let site = registered_site()?;
    apply(&site, X_PHP, ApplyOptions::default())?;

    let mut registry = site.registry()?;
    let removed = remove(&site.workspace(), &mut registry, X_PHP)?;
    registry.save()?;
    assert_eq!(removed.relative_path(), X_PHP);
    assert!(site.registry()?.is_empty());
    assert_eq!(site.remote.backups_of(X_PHP).len(), 1);

    let mut registry = site.registry()?;
    assert!(matches!(
        remove(&site.workspace(), &mut registry, X_PHP),
        Err(EngineError::Registry(RegistryError::NotFound { .. }))
    ));

    Ok(())
}

#[test]
fn offline_remote_surfaces_as_remote_io() -> Result<()> {
    let site = registered_site()?;
    site.remote.go_offline();

    let registry = site.registry()?;
    let result = site.workspace().status(registry.require(X_PHP)?);
    assert!(matches!(result, Err(EngineError::RemoteIo(_))));
    assert!(matches!(
        apply(&site, X_PHP, ApplyOptions::default()),
        Err(EngineError::RemoteIo(_))
    ));

    Ok(())
}

#[test]
fn interrupted_apply_is_settled_on_next_run() -> Result<()> {
    let site = registered_site()?;

    // Simulate a crash between the remote write and the commit.
    let mut registry = site.registry()?;
    let backup = patchsync::backup::BackupStore::new(&site.remote).create_backup(X_PHP, b"C0")?;
    registry.require_mut(X_PHP)?.begin_apply(
        AppliedRecord {
            at: Utc::now(),
            by: "jane".into(),
            local_checksum: fingerprint("L1"),
            remote_checksum: fingerprint("L1"),
            upstream_version: None,
        },
        backup,
    );
    registry.save()?;
    site.remote.put(X_PHP, "L1");

    let mut registry = site.registry()?;
    let engine = ApplyEngine::new(site.workspace(), "jane");
    assert_eq!(
        engine.reconcile(&mut registry)?,
        vec![Reconciled::Committed(X_PHP.into())]
    );
    assert_eq!(state_of(&site, X_PHP)?, PatchState::Applied);

    // Rollback works off the recovered backup reference.
    let outcome = RollbackEngine::new(site.workspace()).rollback(&mut registry, X_PHP, false)?;
    assert!(matches!(outcome, RollbackOutcome::RolledBack { .. }));
    assert_eq!(site.remote.get(X_PHP), Some("C0".into()));

    Ok(())
}

#[test]
fn corrupt_registry_is_reported_verbatim() -> Result<()> {
    let site = registered_site()?;
    std::fs::write(site.registry_path(), "[[patch]]\npath = 42\n")?;

    let result = PatchRegistry::load(site.registry_path(), "production");
    match result {
        Err(RegistryError::Corrupt { registry_path, .. }) => {
            assert_eq!(registry_path, site.registry_path())
        }
        other => panic!("expected corrupt registry, got {other:?}"),
    }

    Ok(())
}
