// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! System auditing: the revdep scan for binaries with unresolvable
//! shared libraries, the depclean orphan scan, a handful of
//! best-effort hygiene scans, and the repair flows driving the
//! builder and remover over the findings.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::Utc;
use log::{info, warn};
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;

use crate::build::{self, Builder};
use crate::db::{self, Database, Record};
use crate::ports;
use crate::remove::{self, Options as RemoveOptions};
use crate::resolver::{self, Resolver};
use crate::util;
use crate::Installation;

pub mod elf;

/// Directories inside a prefix that may carry ELF images
const SCAN_SUBDIRS: &[&str] = &[
    "bin", "sbin", "lib", "lib64", "usr/bin", "usr/sbin", "usr/lib", "usr/lib64",
];

/// Standard paths checked for dangling symlinks
const SYMLINK_SCAN_DIRS: &[&str] = &["/usr/bin", "/usr/sbin", "/usr/lib", "/usr/lib64", "/opt"];

#[derive(Debug, Clone, Serialize)]
pub struct BrokenLib {
    pub pkg: String,
    pub file: String,
    pub ldd: String,
    #[serde(skip)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokenSymlink {
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Orphan {
    pub pkg: String,
    pub prefix: String,
    #[serde(skip)]
    pub name: String,
}

/// The collated audit report, stable schema
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub generated_at: String,
    pub host: String,
    pub kernel: String,
    pub broken_libs: Vec<BrokenLib>,
    pub broken_symlinks: Vec<BrokenSymlink>,
    pub orphans: Vec<Orphan>,
    pub pkgconf_la: Vec<String>,
    pub python_orphans: Vec<String>,
    pub security: Option<String>,
}

impl Report {
    pub fn has_findings(&self) -> bool {
        !self.broken_libs.is_empty()
            || !self.broken_symlinks.is_empty()
            || !self.orphans.is_empty()
            || !self.pkgconf_la.is_empty()
            || !self.python_orphans.is_empty()
    }
}

/// Scan every installed package for binaries whose dynamic
/// dependencies no longer resolve. Short-circuits per package on the
/// first broken binary to bound runtime.
pub fn revdep_scan(db: &Database, install: &Installation) -> Result<Vec<BrokenLib>, Error> {
    let records = db.list()?;

    let mut broken = vec![];

    for record in &records {
        let prefix = db.resolve_prefix(&record.prefix);

        if let Some(finding) = scan_package(record, &prefix, install)? {
            broken.push(finding);
        }
    }

    Ok(broken)
}

fn scan_package(record: &Record, prefix: &Path, install: &Installation) -> Result<Option<BrokenLib>, Error> {
    for subdir in SCAN_SUBDIRS {
        let dir = prefix.join(subdir);
        if !dir.is_dir() {
            continue;
        }

        for file in util::enumerate_files(&dir, |_| true)? {
            let Some(info) = elf::dynamic_info(&file) else {
                continue;
            };

            for needed in &info.needed {
                if !resolves(needed, &info.rpaths, prefix, install) {
                    return Ok(Some(BrokenLib {
                        pkg: record.key(),
                        file: file.display().to_string(),
                        ldd: format!("{needed} => not found"),
                        name: record.name.clone(),
                    }));
                }
            }
        }
    }

    Ok(None)
}

/// Mimic the dynamic linker's search order: rpath entries, the
/// owning prefix, then the system library paths under the root
fn resolves(needed: &str, rpaths: &[String], prefix: &Path, install: &Installation) -> bool {
    for rpath in rpaths {
        if Path::new(rpath).join(needed).exists() {
            return true;
        }
    }

    for dir in ["lib", "lib64", "usr/lib", "usr/lib64"] {
        if prefix.join(dir).join(needed).exists() {
            return true;
        }
    }

    for dir in ["lib", "lib64", "usr/lib", "usr/lib64"] {
        if install.under_root(dir).join(needed).exists() {
            return true;
        }
    }

    false
}

/// The depclean scan is the resolver's orphan query
pub fn depclean_scan(db: &Database, ports: &ports::Tree) -> Result<Vec<Orphan>, Error> {
    Ok(Resolver::new(ports, db)
        .orphans()?
        .into_iter()
        .map(|record| Orphan {
            pkg: record.key(),
            prefix: record.prefix.display().to_string(),
            name: record.name,
        })
        .collect())
}

/// Build the full collated report
pub fn report(db: &Database, install: &Installation, ports: &ports::Tree) -> Result<Report, Error> {
    Ok(Report {
        generated_at: Utc::now().to_rfc3339(),
        host: hostname(),
        kernel: kernel_release(),
        broken_libs: revdep_scan(db, install)?,
        broken_symlinks: broken_symlinks(install),
        orphans: depclean_scan(db, ports)?,
        pkgconf_la: la_files(install),
        python_orphans: python_orphans(db, install)?,
        security: security_scan(install),
    })
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn kernel_release() -> String {
    fs_err::read_to_string("/proc/sys/kernel/osrelease")
        .map(|release| release.trim().to_owned())
        .unwrap_or_default()
}

/// Dangling symlinks in the standard paths, best effort
fn broken_symlinks(install: &Installation) -> Vec<BrokenSymlink> {
    let mut found = vec![];

    for dir in SYMLINK_SCAN_DIRS {
        collect_broken_symlinks(&install.under_root(dir), &mut found);
    }

    found
}

fn collect_broken_symlinks(dir: &Path, found: &mut Vec<BrokenSymlink>) {
    let Ok(read_dir) = fs_err::read_dir(dir) else {
        return;
    };

    for entry in read_dir.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else { continue };

        if meta.is_dir() {
            collect_broken_symlinks(&path, found);
        } else if meta.is_symlink() && !path.exists() {
            found.push(BrokenSymlink {
                path: path.display().to_string(),
            });
        }
    }
}

/// Leftover libtool archives, a packaging hygiene smell
fn la_files(install: &Installation) -> Vec<String> {
    let mut found = vec![];

    for dir in ["usr/lib", "usr/lib64", "opt"] {
        let dir = install.under_root(dir);
        if !dir.is_dir() {
            continue;
        }

        if let Ok(files) = util::enumerate_files(&dir, |path| {
            path.extension().and_then(|e| e.to_str()) == Some("la")
        }) {
            found.extend(files.into_iter().map(|path| path.display().to_string()));
        }
    }

    found
}

/// site-packages entries no installed package claims
fn python_orphans(db: &Database, install: &Installation) -> Result<Vec<String>, Error> {
    let installed = db.list()?.into_iter().map(|r| r.name.to_lowercase()).collect::<Vec<_>>();

    let mut found = vec![];

    let lib = install.under_root("usr/lib");
    let Ok(entries) = fs_err::read_dir(&lib) else {
        return Ok(found);
    };

    for entry in entries.flatten() {
        let python_dir = entry.path().join("site-packages");
        if !entry.file_name().to_string_lossy().starts_with("python") || !python_dir.is_dir() {
            continue;
        }

        for package in fs_err::read_dir(&python_dir)?.flatten() {
            let name = package.file_name().to_string_lossy().to_lowercase();
            let base = name.split(['-', '.']).next().unwrap_or_default().to_owned();

            if !base.is_empty() && !installed.iter().any(|pkg| pkg.contains(&base)) {
                found.push(package.path().display().to_string());
            }
        }
    }

    Ok(found)
}

/// Delegate to an external scanner hook when the site provides one
fn security_scan(install: &Installation) -> Option<String> {
    let hook = install.hooks_dir().join("security");

    if !hook.is_file() {
        return None;
    }

    match Command::new(&hook).output() {
        Ok(output) if output.status.success() => Some(String::from_utf8_lossy(&output.stdout).trim().to_owned()),
        Ok(output) => {
            warn!("security scanner exited {:?}", output.status.code());
            Some(String::from_utf8_lossy(&output.stderr).trim().to_owned())
        }
        Err(err) => {
            warn!("security scanner failed to run: {err}");
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RepairOptions {
    pub dry_run: bool,
    pub auto_yes: bool,
    pub parallel: usize,
}

/// Rebuild every broken package through the builder. Returns the
/// packages that still failed.
pub fn fix_broken(
    broken: &[BrokenLib],
    install: &Installation,
    db: &Database,
    ports: &ports::Tree,
    opts: RepairOptions,
) -> Result<Vec<String>, Error> {
    let mut names = broken.iter().map(|finding| finding.name.clone()).collect::<Vec<_>>();
    names.sort();
    names.dedup();

    if opts.dry_run {
        for name in &names {
            info!("dry-run: would rebuild {name}");
        }
        return Ok(vec![]);
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.parallel.max(1))
        .build()
        .map_err(|_| Error::Pool)?;

    let failures = pool.install(|| {
        names
            .par_iter()
            .filter_map(|name| {
                let recipe = match ports.load(name) {
                    Ok(recipe) => recipe,
                    Err(err) => {
                        warn!("no recipe to rebuild {name}: {err}");
                        return Some(name.clone());
                    }
                };

                // An in-place repair rebuild re-registers the package
                let builder = Builder::new(
                    recipe,
                    install,
                    db,
                    build::Options {
                        force: true,
                        auto_yes: opts.auto_yes,
                        ..Default::default()
                    },
                );

                match builder.run() {
                    Ok(_) => None,
                    Err(err) => {
                        warn!("rebuild of {name} failed: {err}");
                        Some(name.clone())
                    }
                }
            })
            .collect::<Vec<_>>()
    });

    Ok(failures)
}

/// Remove every orphan. Returns the packages that could not be
/// removed.
pub fn clean_orphans(
    orphans: &[Orphan],
    install: &Installation,
    db: &Database,
    ports: &ports::Tree,
    opts: RepairOptions,
) -> Result<Vec<String>, Error> {
    let mut failures = vec![];

    for orphan in orphans {
        let name = orphan.name.clone();

        let result = remove::remove(
            &name,
            install,
            db,
            ports,
            RemoveOptions {
                force: true,
                recursive: false,
                dry_run: opts.dry_run,
            },
        );

        if let Err(err) = result {
            warn!("failed to remove orphan {name}: {err}");
            failures.push(name);
        }
    }

    Ok(failures)
}

/// Write the report JSON next to the session logs
pub fn write_report(report: &Report, install: &Installation) -> Result<PathBuf, Error> {
    let dir = install.log_dir();
    util::ensure_dir_exists(&dir)?;

    let path = dir.join(format!("audit-{}.json", Utc::now().format("%Y%m%d-%H%M%S")));
    fs_err::write(&path, serde_json::to_vec_pretty(report)?)?;

    Ok(path)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to build repair thread pool")]
    Pool,
    #[error("resolver")]
    Resolver(#[from] resolver::Error),
    #[error("db")]
    Db(#[from] db::Error),
    #[error("encode report")]
    Encode(#[from] serde_json::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

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

    fn installed(fixture: &Fixture, name: &str, prefix: &str) {
        fixture
            .db
            .register(crate::db::Record {
                name: name.to_owned(),
                version: "1.0".to_owned(),
                prefix: prefix.into(),
                installed_at: Utc::now(),
                dependencies: vec![],
                metadata: BTreeMap::new(),
            })
            .unwrap();
    }

    /// A host binary with unresolvable dynamic deps inside the temp
    /// root, or None on exotic static hosts
    fn plant_dynamic_binary(fixture: &Fixture, prefix: &str) -> Option<()> {
        let source = ["/bin/sh", "/bin/ls", "/usr/bin/env"]
            .iter()
            .find(|path| elf::dynamic_info(Path::new(path)).is_some_and(|info| !info.needed.is_empty()))?;

        let bin = fixture.install.under_root(prefix).join("bin");
        fs_err::create_dir_all(&bin).unwrap();
        fs_err::copy(source, bin.join("tool")).unwrap();

        Some(())
    }

    #[test]
    fn revdep_flags_unresolvable_binary() {
        let fixture = fixture();
        installed(&fixture, "util", "/opt/util");

        if plant_dynamic_binary(&fixture, "/opt/util").is_none() {
            return;
        }

        // The temp root carries no libraries at all, so every needed
        // lib reports as missing
        let broken = revdep_scan(&fixture.db, &fixture.install).unwrap();
        assert_eq!(broken.len(), 1);
        assert_eq!(broken[0].pkg, "util-1.0");
        assert!(broken[0].file.ends_with("bin/tool"));
        assert!(broken[0].ldd.ends_with("not found"));
    }

    #[test]
    fn revdep_ignores_scriptware() {
        let fixture = fixture();
        installed(&fixture, "scripts", "/opt/scripts");

        let bin = fixture.temp.path().join("opt/scripts/bin");
        fs_err::create_dir_all(&bin).unwrap();
        fs_err::write(bin.join("run"), "#!/bin/sh\n").unwrap();

        assert!(revdep_scan(&fixture.db, &fixture.install).unwrap().is_empty());
    }

    #[test]
    fn report_collates_scans() {
        let fixture = fixture();
        installed(&fixture, "lonely", "/opt/lonely");

        // A dangling symlink in a scanned path
        let opt = fixture.temp.path().join("opt");
        fs_err::create_dir_all(&opt).unwrap();
        std::os::unix::fs::symlink("/nonexistent-target", opt.join("dangling")).unwrap();

        let report = report(&fixture.db, &fixture.install, &fixture.ports).unwrap();

        assert!(report.has_findings());
        assert_eq!(report.orphans.len(), 1);
        assert_eq!(report.orphans[0].pkg, "lonely-1.0");
        assert_eq!(report.broken_symlinks.len(), 1);

        // Schema fields serialize under their documented names
        let json = serde_json::to_value(&report).unwrap();
        for key in [
            "generated_at",
            "host",
            "kernel",
            "broken_libs",
            "broken_symlinks",
            "orphans",
            "pkgconf_la",
            "python_orphans",
            "security",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn fix_broken_dry_run_builds_nothing() {
        let fixture = fixture();

        let broken = vec![BrokenLib {
            pkg: "util-1.0".to_owned(),
            file: "/opt/util/bin/tool".to_owned(),
            ldd: "libdep.so.3 => not found".to_owned(),
            name: "util".to_owned(),
        }];

        let failures = fix_broken(
            &broken,
            &fixture.install,
            &fixture.db,
            &fixture.ports,
            RepairOptions {
                dry_run: true,
                ..Default::default()
            },
        )
        .unwrap();

        assert!(failures.is_empty());
    }

    #[test]
    fn clean_orphans_dry_run_keeps_db() {
        let fixture = fixture();
        installed(&fixture, "lonely", "/opt/lonely");

        let orphans = depclean_scan(&fixture.db, &fixture.ports).unwrap();
        let failures = clean_orphans(
            &orphans,
            &fixture.install,
            &fixture.db,
            &fixture.ports,
            RepairOptions {
                dry_run: true,
                ..Default::default()
            },
        )
        .unwrap();

        assert!(failures.is_empty());
        assert!(fixture.db.is_installed("lonely"));
    }
}
