// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Safe package removal.
//!
//! Refuses when dependents exist (unless forced), protects the
//! critical and shared prefixes, and optionally sweeps the orphans
//! left behind. Dry runs compute and log every decision without
//! touching the filesystem or the DB.

use std::collections::HashSet;
use std::io;
use std::path::Path;

use fs_err as fs;
use log::{info, warn};
use thiserror::Error;

use porg_recipe::Hook;

use crate::build::hooks;
use crate::db::{self, Database, Record};
use crate::environment::CRITICAL_PREFIXES;
use crate::ports;
use crate::resolver::{self, Resolver};
use crate::Installation;

#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    pub force: bool,
    pub recursive: bool,
    pub dry_run: bool,
}

#[derive(Debug, Default)]
pub struct Outcome {
    /// DB keys removed, in removal order
    pub removed: Vec<String>,
    /// Prefixes that were left on disk (critical or shared)
    pub kept_prefixes: Vec<String>,
}

pub fn remove(
    name: &str,
    install: &Installation,
    db: &Database,
    ports: &ports::Tree,
    opts: Options,
) -> Result<Outcome, Error> {
    let mut outcome = Outcome::default();
    let mut visited = HashSet::new();

    remove_inner(name, install, db, ports, opts, &mut outcome, &mut visited)?;

    Ok(outcome)
}

fn remove_inner(
    name: &str,
    install: &Installation,
    db: &Database,
    ports: &ports::Tree,
    opts: Options,
    outcome: &mut Outcome,
    visited: &mut HashSet<String>,
) -> Result<(), Error> {
    let record = db.get(name)?;

    if !visited.insert(record.name.clone()) {
        return Ok(());
    }

    // Direct dependents veto the removal unless forced
    let resolver = Resolver::new(ports, db);
    let dependents = resolver
        .reverse_dependents(&record.name)?
        .into_iter()
        .filter(|dependent| dependent.name != record.name)
        .map(|dependent| dependent.key())
        .collect::<Vec<_>>();

    if !dependents.is_empty() && !opts.force {
        return Err(Error::HasDependents {
            package: record.key(),
            dependents,
        });
    }

    let recipe = ports.load(&record.name).ok();

    if opts.dry_run {
        info!("dry-run: would remove {}", record.key());
        plan_prefix(&record, db, install)?;
        outcome.removed.push(record.key());
    } else {
        hooks::run_for_record(Hook::PreRemove, &record, recipe.as_ref(), install, opts.force)?;

        delete_prefix(&record, db, install, opts, outcome)?;

        let removed = db.unregister(&record.key())?;
        info!("unregistered {}", removed.join(", "));
        outcome.removed.extend(removed);
    }

    if opts.recursive {
        remove_orphans(install, db, ports, opts, outcome, visited)?;
    }

    if !opts.dry_run {
        hooks::run_for_record(Hook::PostRemove, &record, recipe.as_ref(), install, opts.force)?;
    }

    Ok(())
}

fn remove_orphans(
    install: &Installation,
    db: &Database,
    ports: &ports::Tree,
    opts: Options,
    outcome: &mut Outcome,
    visited: &mut HashSet<String>,
) -> Result<(), Error> {
    // In a dry run nothing was unregistered, so exclude everything
    // already visited by hand
    let orphans = Resolver::new(ports, db)
        .orphans()?
        .into_iter()
        .filter(|orphan| !visited.contains(&orphan.name))
        .collect::<Vec<_>>();

    for orphan in orphans {
        info!("removing orphaned dependency {}", orphan.key());

        remove_inner(
            &orphan.name,
            install,
            db,
            ports,
            Options {
                force: true,
                recursive: false,
                dry_run: opts.dry_run,
            },
            outcome,
            visited,
        )?;
    }

    Ok(())
}

/// Figure out whether the record's prefix may be deleted: not in the
/// critical set and not shared with another installed record
fn prefix_disposition(record: &Record, db: &Database) -> Result<PrefixDisposition, Error> {
    let critical = CRITICAL_PREFIXES.iter().any(|c| record.prefix == Path::new(c));
    if critical {
        return Ok(PrefixDisposition::Critical);
    }

    let shared = db
        .list()?
        .iter()
        .any(|other| other.key() != record.key() && other.prefix == record.prefix);
    if shared {
        return Ok(PrefixDisposition::Shared);
    }

    Ok(PrefixDisposition::Deletable)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrefixDisposition {
    Deletable,
    Critical,
    Shared,
}

fn plan_prefix(record: &Record, db: &Database, install: &Installation) -> Result<(), Error> {
    match prefix_disposition(record, db)? {
        PrefixDisposition::Deletable => {
            info!("dry-run: would delete {}", install.under_root(&record.prefix).display());
        }
        disposition => {
            info!("dry-run: would keep {} ({disposition:?})", record.prefix.display());
        }
    }
    Ok(())
}

fn delete_prefix(
    record: &Record,
    db: &Database,
    install: &Installation,
    opts: Options,
    outcome: &mut Outcome,
) -> Result<(), Error> {
    match prefix_disposition(record, db)? {
        PrefixDisposition::Deletable => {
            let resolved = install.under_root(&record.prefix);
            if resolved.exists() {
                fs::remove_dir_all(&resolved)?;
                info!("deleted {}", resolved.display());
            }
        }
        disposition => {
            if opts.force {
                warn!("keeping {} prefix {} despite force", format!("{disposition:?}").to_lowercase(), record.prefix.display());
                outcome.kept_prefixes.push(record.prefix.display().to_string());
            } else {
                return Err(Error::ProtectedPrefix {
                    package: record.key(),
                    prefix: record.prefix.display().to_string(),
                });
            }
        }
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{package} is required by: {}", .dependents.join(", "))]
    HasDependents { package: String, dependents: Vec<String> },
    #[error("refusing to delete protected prefix {prefix} of {package}")]
    ProtectedPrefix { package: String, prefix: String },
    #[error("hook")]
    Hook(#[from] hooks::Error),
    #[error("resolver")]
    Resolver(#[from] resolver::Error),
    #[error("db")]
    Db(#[from] db::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
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

    fn installed(fixture: &Fixture, name: &str, prefix: &str, deps: &[&str]) {
        fixture
            .db
            .register(Record {
                name: name.to_owned(),
                version: "1.0".to_owned(),
                prefix: prefix.into(),
                installed_at: Utc::now(),
                dependencies: deps.iter().map(|d| (*d).to_owned()).collect(),
                metadata: BTreeMap::new(),
            })
            .unwrap();

        // Give the prefix some content to delete
        let dir = fixture.install.under_root(prefix);
        fs::create_dir_all(dir.join("bin")).unwrap();
        fs::write(dir.join("bin/tool"), b"bin").unwrap();
    }

    #[test]
    fn refused_when_dependents_exist() {
        let fixture = fixture();
        installed(&fixture, "libfoo", "/opt/libfoo", &[]);
        installed(&fixture, "app", "/opt/app", &["libfoo"]);

        let err = remove("libfoo", &fixture.install, &fixture.db, &fixture.ports, Options::default()).unwrap_err();

        let Error::HasDependents { dependents, .. } = err else {
            panic!("expected dependents error");
        };
        assert_eq!(dependents, vec!["app-1.0".to_owned()]);

        // DB unchanged
        assert!(fixture.db.is_installed("libfoo"));
    }

    #[test]
    fn plain_remove_deletes_prefix_and_record() {
        let fixture = fixture();
        installed(&fixture, "hello", "/opt/hello", &[]);

        let outcome = remove("hello", &fixture.install, &fixture.db, &fixture.ports, Options::default()).unwrap();

        assert_eq!(outcome.removed, vec!["hello-1.0".to_owned()]);
        assert!(!fixture.db.is_installed("hello"));
        assert!(!fixture.temp.path().join("opt/hello").exists());
    }

    #[test]
    fn dry_run_mutates_nothing() {
        let fixture = fixture();
        installed(&fixture, "hello", "/opt/hello", &[]);

        let outcome = remove(
            "hello",
            &fixture.install,
            &fixture.db,
            &fixture.ports,
            Options {
                dry_run: true,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(outcome.removed, vec!["hello-1.0".to_owned()]);
        assert!(fixture.db.is_installed("hello"));
        assert!(fixture.temp.path().join("opt/hello/bin/tool").exists());
    }

    #[test]
    fn forced_recursive_remove_sweeps_orphans() {
        let fixture = fixture();
        installed(&fixture, "libfoo", "/opt/libfoo", &[]);
        installed(&fixture, "app", "/opt/app", &["libfoo"]);

        let outcome = remove(
            "app",
            &fixture.install,
            &fixture.db,
            &fixture.ports,
            Options {
                force: true,
                recursive: true,
                ..Default::default()
            },
        )
        .unwrap();

        assert!(outcome.removed.contains(&"app-1.0".to_owned()));
        assert!(outcome.removed.contains(&"libfoo-1.0".to_owned()));
        assert!(!fixture.db.is_installed("app"));
        assert!(!fixture.db.is_installed("libfoo"));
    }

    #[test]
    fn shared_prefix_is_protected() {
        let fixture = fixture();
        installed(&fixture, "a", "/opt/stack", &[]);
        installed(&fixture, "b", "/opt/stack", &[]);

        let err = remove("a", &fixture.install, &fixture.db, &fixture.ports, Options::default()).unwrap_err();
        assert!(matches!(err, Error::ProtectedPrefix { .. }));
        assert!(fixture.db.is_installed("a"));

        // Forced: record goes, shared prefix stays
        let outcome = remove(
            "a",
            &fixture.install,
            &fixture.db,
            &fixture.ports,
            Options {
                force: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(outcome.kept_prefixes, vec!["/opt/stack".to_owned()]);
        assert!(!fixture.db.is_installed("a"));
        assert!(fixture.temp.path().join("opt/stack/bin/tool").exists());
    }

    #[test]
    fn missing_package_is_not_found() {
        let fixture = fixture();
        assert!(matches!(
            remove("ghost", &fixture.install, &fixture.db, &fixture.ports, Options::default()),
            Err(Error::Db(db::Error::NotFound(_)))
        ));
    }
}
