// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use patchsync::{
    access::{LocalTree, SshTree},
    backup::BackupStore,
    checksum::Checksum,
    config::{Config, SiteConfig},
    engine::{
        self,
        apply::{ApplyEngine, ApplyOptions, ApplyOutcome},
        rollback::{RollbackEngine, RollbackOutcome},
        AllowAll, EngineError, PromptGate, SafetyGate, WpCliProbe, Workspace,
    },
    path::default_config_path,
    registry::PatchRegistry,
    state::PatchState,
};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::ProgressBar;
use std::{fs::read_to_string, path::PathBuf, process::exit};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "patchsync [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Site to operate on instead of the default site.
    #[arg(short, long, global = true, value_name = "name")]
    pub site: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        let target = Target::open(self.config, self.site.as_deref())?;
        match self.command {
            Command::Patch(opts) => run_patch(&target, opts),
            Command::PatchCommit(opts) => run_patch_commit(&target, opts),
            Command::Rollback(opts) => run_rollback(&target, opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Register, remove, and inspect tracked patches.
    #[command(override_usage = "patchsync patch [options]")]
    Patch(PatchOptions),

    /// Apply one patch, or every outstanding patch, to the remote.
    #[command(override_usage = "patchsync patch-commit [options] [<path>]")]
    PatchCommit(CommitOptions),

    /// Restore remote file from the backup taken by its last apply.
    #[command(override_usage = "patchsync rollback [options] <path>")]
    Rollback(RollbackOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct PatchOptions {
    /// Register patched file, relative to the WordPress root.
    #[arg(short, long, group = "action", value_name = "path")]
    pub add: Option<String>,

    /// Stop tracking patched file.
    #[arg(short, long, group = "action", value_name = "path")]
    pub remove: Option<String>,

    /// List tracked patches with their live state.
    #[arg(short, long, group = "action")]
    pub list: bool,

    /// Show everything known about one patch.
    #[arg(short, long, group = "action", value_name = "path")]
    pub info: Option<String>,

    /// Brief description of patch to register.
    #[arg(short, long, value_name = "summary", requires = "add")]
    pub description: Option<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct CommitOptions {
    /// Patch to apply. Applies every outstanding patch if omitted.
    #[arg(value_name = "path")]
    pub path: Option<String>,

    /// Report what would happen without writing anything.
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Overwrite the remote even if it changed outside of patchsync.
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RollbackOptions {
    /// Patch to roll back.
    #[arg(required = true, value_name = "path")]
    pub path: String,

    /// Report what would happen without writing anything.
    #[arg(short = 'n', long)]
    pub dry_run: bool,
}

/// Everything needed to work on one configured site.
struct Target {
    site: SiteConfig,
    operator: String,
    local: LocalTree,
    remote: SshTree,
    gate: Box<dyn SafetyGate>,
    probe: WpCliProbe,
    bar: ProgressBar,
}

impl Target {
    fn open(config_path: Option<PathBuf>, site: Option<&str>) -> Result<Self> {
        let config_path = match config_path {
            Some(path) => path,
            None => default_config_path()?,
        };
        let data = read_to_string(&config_path)
            .with_context(|| format!("cannot read configuration {:?}", config_path.display()))?;
        let config: Config = data.parse()?;
        let site = config.site(site)?.clone();

        let operator = config
            .settings
            .operator
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "unknown".into());

        let bar = ProgressBar::new(0);
        let gate: Box<dyn SafetyGate> = if site.production_safety {
            Box::new(PromptGate::new(bar.clone()))
        } else {
            Box::new(AllowAll)
        };

        let remote = SshTree::new(&site.host, site.port, &site.remote_path);
        let probe = WpCliProbe::new(remote.clone(), &site.remote_path, site.wp_command());
        info!("site {} at {}:{}", site.name, site.host, site.remote_path);

        Ok(Self {
            local: LocalTree::new(&site.local_path),
            remote,
            gate,
            probe,
            operator,
            bar,
            site,
        })
    }

    fn workspace(&self) -> Workspace<'_> {
        Workspace::new(&self.local, &self.remote, self.gate.as_ref(), &self.probe)
    }

    fn apply_engine(&self) -> ApplyEngine<'_> {
        ApplyEngine::new(self.workspace(), self.operator.as_str())
    }

    /// Load registry, and settle applies a previous run left unfinished.
    fn registry(&self) -> Result<PatchRegistry> {
        let mut registry = PatchRegistry::load(self.site.registry_path()?, &self.site.name)?;
        if registry.list().iter().any(|entry| entry.in_flight().is_some()) {
            if let Err(err) = self.apply_engine().reconcile(&mut registry) {
                warn!("cannot settle interrupted applies yet: {err}");
            }
        }

        Ok(registry)
    }
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run() -> Result<()> {
    Cli::parse().run()
}

fn run_patch(target: &Target, opts: PatchOptions) -> Result<()> {
    let mut registry = target.registry()?;
    let workspace = target.workspace();

    if let Some(path) = opts.add {
        let entry = engine::register(&workspace, &mut registry, &path, opts.description)?;
        info!(
            "registered {} with baseline {}",
            entry.relative_path(),
            entry.registered_checksum().short()
        );
        registry.save()?;
    } else if let Some(path) = opts.remove {
        let entry = engine::remove(&workspace, &mut registry, &path)?;
        registry.save()?;
        info!("removed {}", entry.relative_path());
    } else if let Some(path) = opts.info {
        show_info(&workspace, &registry, &path)?;
    } else {
        show_list(&workspace, &registry)?;
    }

    Ok(())
}

fn show_list(workspace: &Workspace<'_>, registry: &PatchRegistry) -> Result<()> {
    if registry.is_empty() {
        info!("no patches registered for {}", registry.site());
        return Ok(());
    }

    let mut offline = false;
    for entry in registry.list() {
        let label = if offline {
            unverified(entry.applied().is_some())
        } else {
            match workspace.status(entry) {
                Ok((state, _)) => state.to_string(),
                Err(EngineError::RemoteIo(err)) => {
                    warn!("remote unreachable, states are unverified: {err}");
                    offline = true;
                    unverified(entry.applied().is_some())
                }
                Err(err) => return Err(err.into()),
            }
        };

        match entry.description() {
            Some(description) => println!("{label:<22} {}  {description}", entry.relative_path()),
            None => println!("{label:<22} {}", entry.relative_path()),
        }
    }

    Ok(())
}

fn unverified(applied: bool) -> String {
    let state = if applied {
        PatchState::Applied
    } else {
        PatchState::Pending
    };

    format!("{state} (unverified)")
}

fn show_info(workspace: &Workspace<'_>, registry: &PatchRegistry, path: &str) -> Result<()> {
    let entry = registry.require(path)?;
    let or_none = |value: Option<String>| value.unwrap_or_else(|| "-".into());

    println!("path:             {}", entry.relative_path());
    println!("description:      {}", or_none(entry.description().map(Into::into)));
    println!("registered at:    {}", entry.registered_at());
    println!("baseline:         {}", entry.registered_checksum());
    println!("flag:             {}", entry.lifecycle_flag());
    println!("applied at:       {}", or_none(entry.applied_at().map(|at| at.to_string())));
    println!("applied by:       {}", or_none(entry.applied_by().map(Into::into)));
    println!(
        "local at apply:   {}",
        or_none(entry.local_checksum_at_apply().map(ToString::to_string))
    );
    println!(
        "remote at apply:  {}",
        or_none(entry.remote_checksum_at_apply().map(ToString::to_string))
    );
    println!(
        "upstream version: {}",
        or_none(entry.applied().and_then(|applied| applied.upstream_version.clone()))
    );
    println!(
        "reverted at:      {}",
        or_none(entry.reverted_at().map(|at| at.to_string()))
    );
    println!(
        "backup:           {}",
        or_none(entry.backup_reference().map(|backup| backup.backup_path.clone()))
    );

    match workspace.status(entry) {
        Ok((state, observation)) => {
            println!("state:            {state} ({})", state.explain());
            println!(
                "local now:        {}",
                or_none(observation.local.map(|sum| sum.to_string()))
            );
            println!(
                "remote now:       {}",
                or_none(observation.remote.map(|sum| sum.to_string()))
            );
            println!(
                "reference now:    {}",
                or_none(observation.reference.map(|sum| sum.to_string()))
            );

            for backup in BackupStore::new(workspace.remote).list_backups(entry.relative_path())? {
                println!("known backup:     {backup}");
            }
        }
        Err(EngineError::RemoteIo(err)) => {
            warn!("remote unreachable: {err}");
            println!("state:            {}", unverified(entry.applied().is_some()));
        }
        Err(err) => return Err(err.into()),
    }

    Ok(())
}

fn run_patch_commit(target: &Target, opts: CommitOptions) -> Result<()> {
    let mut registry = target.registry()?;
    let engine = target.apply_engine();
    let options = ApplyOptions {
        dry_run: opts.dry_run,
        force: opts.force,
    };

    let Some(path) = opts.path else {
        let report = engine.apply_all(&mut registry, options, &target.bar)?;
        for (path, outcome) in &report.applied {
            report_apply(path, outcome);
        }
        for (path, err) in &report.failed {
            error!("{path}: {err}");
        }

        if !report.is_success() {
            return Err(anyhow!("{} patches failed to apply", report.failed.len()));
        }

        return Ok(());
    };

    let outcome = engine.apply(&mut registry, &path, options)?;
    report_apply(&path, &outcome);

    Ok(())
}

fn report_apply(path: &str, outcome: &ApplyOutcome) {
    match outcome {
        ApplyOutcome::AlreadyCurrent { state } => info!("{path} is {state}, nothing to do"),
        ApplyOutcome::Planned { state, bytes, .. } => {
            info!("dry run: {path} is {state}, would back up remote and write {bytes} bytes")
        }
        ApplyOutcome::Applied {
            previous,
            backup,
            checksum,
        } => info!(
            "{path} applied (was {previous}), remote now {}, backup at {}",
            checksum.short(),
            backup.backup_path
        ),
    }
}

fn run_rollback(target: &Target, opts: RollbackOptions) -> Result<()> {
    let mut registry = target.registry()?;
    let engine = RollbackEngine::new(target.workspace());

    match engine.rollback(&mut registry, &opts.path, opts.dry_run)? {
        RollbackOutcome::Planned {
            backup,
            current,
            restored,
        } => info!(
            "dry run: would restore {} from {} (remote {} -> {})",
            opts.path,
            backup.backup_path,
            short_or_missing(current.as_ref()),
            restored.short()
        ),
        RollbackOutcome::RolledBack {
            backup,
            previous,
            restored,
        } => info!(
            "{} restored from {} (remote {} -> {})",
            opts.path,
            backup.backup_path,
            short_or_missing(previous.as_ref()),
            restored.short()
        ),
    }

    Ok(())
}

fn short_or_missing(checksum: Option<&Checksum>) -> &str {
    checksum.map_or("<missing>", Checksum::short)
}
