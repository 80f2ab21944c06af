// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Upgrade orchestration: plan, build new, swap old, register.
//!
//! Each package moves through build -> swap -> expand -> register,
//! with the current position persisted so a crash between steps is
//! recoverable with `--resume`. The swap itself is sequenced, never
//! globally atomic; the state file is what makes that safe.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use fs_err as fs;
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::build::{self, Builder};
use crate::db::{self, Database};
use crate::ports;
use crate::remove::{self, Options as RemoveOptions};
use crate::resolver::{self, Resolver, Scope, UpgradePlan};
use crate::session;
use crate::{logger, package, signal, util, Installation};

#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    pub resume: bool,
    pub dry_run: bool,
    pub auto_yes: bool,
    pub force: bool,
    /// Build-phase parallelism; swaps always serialize
    pub parallel: usize,
}

/// Per-package swap phases, persisted for resume
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    Build,
    Swap,
    Expand,
    Register,
}

/// The persisted upgrade position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub target: String,
    pub metafile: PathBuf,
    pub new_version: String,
    pub installed_version: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

#[derive(Debug, Default)]
pub struct Summary {
    pub upgraded: Vec<String>,
    pub skipped: Vec<String>,
}

pub fn plan(scope: Scope, resolver: &mut Resolver<'_>) -> Result<UpgradePlan, Error> {
    Ok(resolver.upgrade_plan(scope)?)
}

fn state_path(install: &Installation) -> PathBuf {
    install.state_dir().join("upgrade.json")
}

pub fn read_state(install: &Installation) -> Result<Option<State>, Error> {
    match fs::read(state_path(install)) {
        Ok(contents) => Ok(Some(serde_json::from_slice(&contents)?)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(Error::Io(err)),
    }
}

fn write_state(install: &Installation, state: &State) -> Result<(), Error> {
    let path = state_path(install);
    if let Some(parent) = path.parent() {
        util::ensure_dir_exists(parent)?;
    }

    let temp = path.with_extension("tmp");
    fs::write(&temp, serde_json::to_vec_pretty(state)?)?;
    fs::rename(&temp, &path)?;

    Ok(())
}

fn clear_state(install: &Installation) {
    let _ = fs::remove_file(state_path(install));
}

/// Execute `plan` in order. On the first fatal error the position is
/// persisted and the run stops with that error.
pub fn execute(
    plan: &UpgradePlan,
    install: &Installation,
    db: &Database,
    ports: &ports::Tree,
    opts: Options,
) -> Result<Summary, Error> {
    let mut summary = Summary::default();

    let rebuild: HashSet<&String> = plan.needs_rebuild.iter().collect();

    // Resume: fast-forward to the recorded package and re-enter at
    // its failed phase
    let resume_state = if opts.resume { read_state(install)? } else { None };
    let mut resume_target = resume_state.as_ref().map(|state| state.target.clone());
    let resume_phase = resume_state
        .as_ref()
        .and_then(|state| state.phase.as_deref())
        .and_then(|phase| Phase::from_str(phase).ok())
        .unwrap_or(Phase::Build);

    let mut pending = vec![];

    for name in &plan.upgrade_order {
        if let Some(target) = &resume_target {
            if name != target {
                summary.skipped.push(name.clone());
                continue;
            }
            resume_target = None;
        }

        if !rebuild.contains(name) {
            summary.skipped.push(name.clone());
            continue;
        }

        pending.push(name.clone());
    }

    if pending.is_empty() {
        info!("nothing to upgrade");
        clear_state(install);
        return Ok(summary);
    }

    if opts.dry_run {
        for name in &pending {
            info!("dry-run: would upgrade {name}");
        }
        return Ok(summary);
    }

    // A DB snapshot before the first mutation makes botched runs
    // recoverable by hand
    match db.backup(None) {
        Ok(path) => info!("installed DB backed up to {}", path.display()),
        Err(err) => warn!("could not back up installed DB: {err}"),
    }

    if opts.parallel > 1 {
        execute_batched(&pending, resume_phase, install, db, ports, opts, &mut summary)?;
    } else {
        for (i, name) in pending.iter().enumerate() {
            let phase = if i == 0 { resume_phase } else { Phase::Build };
            upgrade_one(name, phase, install, db, ports, opts)?;
            summary.upgraded.push(name.clone());
        }
    }

    clear_state(install);

    Ok(summary)
}

/// Partition into batches where no member depends on another member,
/// honoring the dependency order
pub fn batches(pending: &[String], mut deps_of: impl FnMut(&str) -> Vec<String>) -> Vec<Vec<String>> {
    let deps: HashMap<String, Vec<String>> = pending
        .iter()
        .map(|name| (name.clone(), deps_of(name)))
        .collect();

    let mut remaining: Vec<String> = pending.to_vec();
    let mut out = vec![];

    while !remaining.is_empty() {
        let remaining_set: HashSet<&String> = remaining.iter().collect();

        let (batch, rest): (Vec<String>, Vec<String>) = remaining.iter().cloned().partition(|name| {
            deps[name]
                .iter()
                .all(|dep| dep == name || !remaining_set.contains(dep))
        });

        // A residual cycle would stall the partition; fall back to
        // one-at-a-time in plan order
        if batch.is_empty() {
            out.push(vec![rest[0].clone()]);
            remaining = rest[1..].to_vec();
            continue;
        }

        out.push(batch);
        remaining = rest;
    }

    out
}

#[allow(clippy::too_many_arguments)]
fn execute_batched(
    pending: &[String],
    resume_phase: Phase,
    install: &Installation,
    db: &Database,
    ports: &ports::Tree,
    opts: Options,
    summary: &mut Summary,
) -> Result<(), Error> {
    let mut resolver = Resolver::new(ports, db);
    let record_deps: HashMap<String, Vec<String>> = db
        .list()?
        .into_iter()
        .map(|record| (record.name.clone(), record.dependencies))
        .collect();

    let batch_list = batches(pending, |name| {
        let mut deps = resolver
            .recipe(name)
            .map(|recipe| recipe.parsed.dependencies.for_build().map(str::to_owned).collect::<Vec<_>>())
            .unwrap_or_default();
        deps.extend(record_deps.get(name).cloned().unwrap_or_default());
        deps
    });

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.parallel)
        .build()
        .map_err(|_| Error::Pool)?;

    let mut first = true;

    for batch in batch_list {
        if signal::interrupted() {
            return Err(Error::Interrupted);
        }

        // Builds run concurrently within the batch
        let build_errors = pool.install(|| {
            batch
                .par_iter()
                .filter_map(|name| {
                    // The resumed package may already have a finished
                    // build; its phases re-run below
                    let phase = if first && name == &batch[0] { resume_phase } else { Phase::Build };
                    if phase > Phase::Build {
                        return None;
                    }

                    build_one(name, install, db, ports, opts).err().map(|err| (name.clone(), err))
                })
                .collect::<Vec<_>>()
        });

        if let Some((name, err)) = build_errors.into_iter().next() {
            persist_failure(&name, Phase::Build, install, db, ports);
            return Err(Error::Failed {
                package: name,
                source: Box::new(err),
            });
        }

        // Swaps always serialize in plan order
        for name in &batch {
            let phase = if first && name == &batch[0] {
                resume_phase.max(Phase::Swap)
            } else {
                Phase::Swap
            };

            swap_one(name, phase, install, db, ports, opts)?;
            summary.upgraded.push(name.clone());
        }

        first = false;
    }

    Ok(())
}

fn upgrade_one(
    name: &str,
    phase: Phase,
    install: &Installation,
    db: &Database,
    ports: &ports::Tree,
    opts: Options,
) -> Result<(), Error> {
    if phase <= Phase::Build {
        build_one(name, install, db, ports, opts).map_err(|err| {
            persist_failure(name, Phase::Build, install, db, ports);
            Error::Failed {
                package: name.to_owned(),
                source: Box::new(err),
            }
        })?;
    }

    swap_one(name, phase.max(Phase::Swap), install, db, ports, opts)
}

fn build_one(name: &str, install: &Installation, db: &Database, ports: &ports::Tree, opts: Options) -> Result<(), Error> {
    let recipe = ports.load(name)?;

    logger::stage(format!("upgrading {} -> {}", name, recipe.version));

    record_position(name, &recipe, Phase::Build, install, db)?;

    let builder = Builder::new(
        recipe,
        install,
        db,
        build::Options {
            force: opts.force,
            auto_yes: opts.auto_yes,
            resume: opts.resume,
            skip_register: true,
        },
    );

    builder.run()?;

    Ok(())
}

fn swap_one(
    name: &str,
    phase: Phase,
    install: &Installation,
    db: &Database,
    ports: &ports::Tree,
    opts: Options,
) -> Result<(), Error> {
    let recipe = ports.load(name)?;
    let builder = Builder::new(
        recipe.clone(),
        install,
        db,
        build::Options {
            skip_register: true,
            ..Default::default()
        },
    );

    // The swap is not atomic; at least keep ^C from tearing it
    let _guard = signal::ignore([signal::Signal::SIGINT, signal::Signal::SIGTERM]).ok();

    let run = || -> Result<(), Error> {
        // Remove the old version before its replacement lands
        if phase <= Phase::Swap {
            record_position(name, &recipe, Phase::Swap, install, db)?;

            if db.is_installed(name) {
                let outcome = remove::remove(
                    name,
                    install,
                    db,
                    ports,
                    RemoveOptions {
                        force: true,
                        recursive: false,
                        dry_run: false,
                    },
                )?;
                info!("removed old {}", outcome.removed.join(", "));
            }
        }

        if phase <= Phase::Expand {
            record_position(name, &recipe, Phase::Expand, install, db)?;

            let artifact = builder.artifact_path();
            package::extract_artifact(&artifact, &install.root)?;
            info!("expanded {} into {}", artifact.display(), install.root.display());
        }

        record_position(name, &recipe, Phase::Register, install, db)?;
        builder.register()?;

        Ok(())
    };

    run().map_err(|err| {
        warn!("upgrade of {name} stopped: {err}");
        err
    })
}

fn record_position(
    name: &str,
    recipe: &crate::Recipe,
    phase: Phase,
    install: &Installation,
    db: &Database,
) -> Result<(), Error> {
    let installed_version = db.get(name).ok().map(|record| record.version);

    write_state(
        install,
        &State {
            target: name.to_owned(),
            metafile: recipe.path.clone(),
            new_version: recipe.version.clone(),
            installed_version,
            timestamp: Utc::now(),
            phase: Some(phase.to_string()),
        },
    )
}

fn persist_failure(name: &str, phase: Phase, install: &Installation, db: &Database, ports: &ports::Tree) {
    if let Ok(recipe) = ports.load(name) {
        let _ = record_position(name, &recipe, phase, install, db);
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("upgrade of {package} failed")]
    Failed {
        package: String,
        #[source]
        source: Box<Error>,
    },
    #[error("interrupted")]
    Interrupted,
    #[error("failed to build upgrade thread pool")]
    Pool,
    #[error("resolver")]
    Resolver(#[from] resolver::Error),
    #[error("build")]
    Build(#[from] build::Error),
    #[error("remove")]
    Remove(#[from] remove::Error),
    #[error("package")]
    Package(#[from] package::Error),
    #[error("ports")]
    Ports(#[from] ports::Error),
    #[error("db")]
    Db(#[from] db::Error),
    #[error("session")]
    Session(#[from] session::Error),
    #[error("decode upgrade state")]
    Decode(#[from] serde_json::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::path::Path;

    use chrono::TimeDelta;

    use super::*;
    use crate::db::Record;
    use crate::Config;

    struct Fixture {
        temp: tempfile::TempDir,
        install: Installation,
        db: Database,
        ports: ports::Tree,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let install = Installation::open(temp.path(), Config::default());
        let db = Database::open(install.db_path(), temp.path());
        let ports = ports::Tree::open(temp.path().join("ports"));

        Fixture {
            install,
            db,
            ports,
            temp,
        }
    }

    fn write_recipe(fixture: &Fixture, name: &str, contents: &str) {
        let dir = fixture.temp.path().join("ports/core").join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("package.yml"), contents).unwrap();
    }

    fn installed(fixture: &Fixture, name: &str, version: &str, deps: &[&str], age_days: i64) {
        fixture
            .db
            .register(Record {
                name: name.to_owned(),
                version: version.to_owned(),
                prefix: format!("/opt/{name}").into(),
                installed_at: Utc::now() - TimeDelta::days(age_days),
                dependencies: deps.iter().map(|d| (*d).to_owned()).collect(),
                metadata: BTreeMap::new(),
            })
            .unwrap();
    }

    #[test]
    fn world_upgrade_swaps_and_registers() {
        let fixture = fixture();
        write_recipe(&fixture, "libfoo", "name: libfoo\nversion: '1.1'\nprefix: /opt/libfoo\n");
        write_recipe(
            &fixture,
            "app",
            "name: app\nversion: '2.0'\nprefix: /opt/app\ndependencies:\n  runtime: [libfoo]\n",
        );
        installed(&fixture, "libfoo", "1.0", &[], 10);
        installed(&fixture, "app", "2.0", &["libfoo"], 5);

        let mut resolver = Resolver::new(&fixture.ports, &fixture.db);
        let plan = plan(Scope::World, &mut resolver).unwrap();
        assert_eq!(plan.needs_rebuild, vec!["libfoo", "app"]);

        let summary = execute(
            &plan,
            &fixture.install,
            &fixture.db,
            &fixture.ports,
            Options {
                auto_yes: true,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(summary.upgraded, vec!["libfoo", "app"]);
        assert_eq!(fixture.db.get("libfoo").unwrap().version, "1.1");
        assert_eq!(fixture.db.get("app").unwrap().version, "2.0");

        // The state file is cleared after a clean run
        assert!(read_state(&fixture.install).unwrap().is_none());
    }

    #[test]
    fn failure_persists_state_and_resume_finishes() {
        let fixture = fixture();
        write_recipe(&fixture, "libfoo", "name: libfoo\nversion: '1.1'\nprefix: /opt/libfoo\n");
        write_recipe(
            &fixture,
            "app",
            "name: app\nversion: '2.1'\nprefix: /opt/app\ndependencies:\n  runtime: [libfoo]\nhooks:\n  pre-build:\n    - exit 1\n",
        );
        installed(&fixture, "libfoo", "1.0", &[], 10);
        installed(&fixture, "app", "2.0", &["libfoo"], 5);

        let mut resolver = Resolver::new(&fixture.ports, &fixture.db);
        let upgrade_plan = plan(Scope::World, &mut resolver).unwrap();

        let err = execute(
            &upgrade_plan,
            &fixture.install,
            &fixture.db,
            &fixture.ports,
            Options {
                auto_yes: true,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Failed { ref package, .. } if package == "app"));

        // libfoo made it, app is recorded as the failure position
        assert_eq!(fixture.db.get("libfoo").unwrap().version, "1.1");
        let state = read_state(&fixture.install).unwrap().unwrap();
        assert_eq!(state.target, "app");
        assert_eq!(state.new_version, "2.1");

        // Drop the failing hook and resume: only app re-runs
        write_recipe(
            &fixture,
            "app",
            "name: app\nversion: '2.1'\nprefix: /opt/app\ndependencies:\n  runtime: [libfoo]\n",
        );

        let summary = execute(
            &upgrade_plan,
            &fixture.install,
            &fixture.db,
            &fixture.ports,
            Options {
                resume: true,
                auto_yes: true,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(summary.upgraded, vec!["app"]);
        assert!(summary.skipped.contains(&"libfoo".to_owned()));
        assert_eq!(fixture.db.get("app").unwrap().version, "2.1");
        assert!(read_state(&fixture.install).unwrap().is_none());
    }

    #[test]
    fn up_to_date_packages_are_skipped() {
        let fixture = fixture();
        write_recipe(&fixture, "libfoo", "name: libfoo\nversion: '1.0'\nprefix: /opt/libfoo\n");
        installed(&fixture, "libfoo", "1.0", &[], 1);

        let mut resolver = Resolver::new(&fixture.ports, &fixture.db);
        let upgrade_plan = plan(Scope::World, &mut resolver).unwrap();

        let summary = execute(
            &upgrade_plan,
            &fixture.install,
            &fixture.db,
            &fixture.ports,
            Options::default(),
        )
        .unwrap();

        assert!(summary.upgraded.is_empty());
        assert_eq!(summary.skipped, vec!["libfoo"]);
    }

    #[test]
    fn batches_respect_dependency_order() {
        let deps: HashMap<&str, Vec<String>> = [
            ("libc", vec![]),
            ("libfoo", vec!["libc".to_owned()]),
            ("libbar", vec!["libc".to_owned()]),
            ("app", vec!["libfoo".to_owned(), "libbar".to_owned()]),
        ]
        .into_iter()
        .collect();

        let pending = ["libc", "libbar", "libfoo", "app"]
            .iter()
            .map(|s| (*s).to_owned())
            .collect::<Vec<_>>();

        let batches = batches(&pending, |name| deps[name].clone());

        assert_eq!(batches[0], vec!["libc"]);
        assert_eq!(batches[1], vec!["libbar", "libfoo"]);
        assert_eq!(batches[2], vec!["app"]);

        // No batch member depends on another member of its batch
        for batch in &batches {
            for name in batch {
                assert!(deps[name.as_str()].iter().all(|dep| !batch.contains(dep)));
            }
        }
    }

    #[test]
    fn single_scope_covers_dependents() {
        let fixture = fixture();
        write_recipe(&fixture, "libfoo", "name: libfoo\nversion: '1.1'\nprefix: /opt/libfoo\n");
        installed(&fixture, "libfoo", "1.0", &[], 10);
        installed(&fixture, "app", "2.0", &["libfoo"], 5);

        let mut resolver = Resolver::new(&fixture.ports, &fixture.db);
        let upgrade_plan = plan(Scope::Single("libfoo".to_owned()), &mut resolver).unwrap();

        assert_eq!(upgrade_plan.upgrade_order, vec!["libfoo", "app"]);
        // app is flagged because libfoo will be rebuilt
        assert_eq!(upgrade_plan.needs_rebuild, vec!["libfoo", "app"]);
    }

    #[test]
    fn dry_run_leaves_everything_alone() {
        let fixture = fixture();
        write_recipe(&fixture, "libfoo", "name: libfoo\nversion: '1.1'\nprefix: /opt/libfoo\n");
        installed(&fixture, "libfoo", "1.0", &[], 10);

        let mut resolver = Resolver::new(&fixture.ports, &fixture.db);
        let upgrade_plan = plan(Scope::World, &mut resolver).unwrap();

        execute(
            &upgrade_plan,
            &fixture.install,
            &fixture.db,
            &fixture.ports,
            Options {
                dry_run: true,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(fixture.db.get("libfoo").unwrap().version, "1.0");
    }

    #[test]
    fn state_round_trips() {
        let fixture = fixture();

        let state = State {
            target: "libfoo".to_owned(),
            metafile: Path::new("/usr/ports/core/libfoo/package.yml").to_path_buf(),
            new_version: "1.1".to_owned(),
            installed_version: Some("1.0".to_owned()),
            timestamp: Utc::now(),
            phase: Some("swap".to_owned()),
        };

        write_state(&fixture.install, &state).unwrap();
        let read = read_state(&fixture.install).unwrap().unwrap();
        assert_eq!(read.target, "libfoo");
        assert_eq!(read.phase.as_deref(), Some("swap"));

        clear_state(&fixture.install);
        assert!(read_state(&fixture.install).unwrap().is_none());
    }
}
