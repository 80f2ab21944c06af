// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;
use log::info;
use thiserror::Error;

use porg::audit::{self, RepairOptions};
use porg::db::Database;
use porg::resolver::{self, Resolver, Scope};
use porg::{ports, Installation};

use super::{Global, Outcome};

#[derive(Debug, Parser)]
#[command(about = "Full system audit")]
pub struct Command {
    #[arg(long, help = "Revdep scan only")]
    scan: bool,
    #[arg(long, help = "Rebuild broken packages")]
    fix: bool,
    #[arg(long, help = "Remove orphaned packages")]
    clean: bool,
    #[arg(long, help = "Collate the full report")]
    audit: bool,
    #[arg(long, help = "List packages an upgrade would rebuild")]
    rebuild_needed: bool,
    #[arg(long, help = "Everything above")]
    all: bool,
    #[arg(long, help = "Print the report as JSON")]
    json: bool,
    #[arg(long, help = "Log the plan, change nothing")]
    dry_run: bool,
}

pub fn handle(command: Command, install: &Installation, global: &Global) -> Result<Outcome, Error> {
    let db = Database::open(install.db_path(), &install.root);
    let ports = ports::Tree::open(install.ports_dir());

    let full = command.audit || command.all || !(command.scan || command.fix || command.clean || command.rebuild_needed);

    let repair = RepairOptions {
        dry_run: command.dry_run,
        auto_yes: global.yes,
        parallel: install.config.parallel_n.get(),
    };

    let mut outcome = Outcome::Clean;

    if full {
        let report = audit::report(&db, install, &ports)?;

        if command.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_summary(&report);
        }

        let path = audit::write_report(&report, install)?;
        info!("report written to {}", path.display());

        if report.has_findings() {
            outcome = Outcome::Findings;
        }

        if command.fix || command.all {
            let failures = audit::fix_broken(&report.broken_libs, install, &db, &ports, repair)?;
            if !failures.is_empty() {
                outcome = Outcome::Partial;
            }
        }

        if command.clean || command.all {
            let failures = audit::clean_orphans(&report.orphans, install, &db, &ports, repair)?;
            if !failures.is_empty() {
                outcome = Outcome::Partial;
            }
        }
    } else if command.scan || command.fix || command.clean {
        // Narrow flows share the resolve verb's machinery
        let broken = audit::revdep_scan(&db, install)?;

        if command.json {
            println!("{}", serde_json::to_string_pretty(&broken)?);
        }

        if !broken.is_empty() {
            outcome = Outcome::Findings;

            if command.fix {
                let failures = audit::fix_broken(&broken, install, &db, &ports, repair)?;
                outcome = if failures.is_empty() { Outcome::Clean } else { Outcome::Partial };
            }
        }

        if command.clean {
            let orphans = audit::depclean_scan(&db, &ports)?;
            audit::clean_orphans(&orphans, install, &db, &ports, repair)?;
        }
    }

    if command.rebuild_needed || command.all {
        let mut resolver = Resolver::new(&ports, &db);
        let plan = resolver.upgrade_plan(Scope::World)?;

        if plan.needs_rebuild.is_empty() {
            info!("no rebuilds pending");
        } else {
            for name in &plan.needs_rebuild {
                println!("rebuild-needed {name}");
            }
            outcome = Outcome::Findings;
        }
    }

    Ok(outcome)
}

fn print_summary(report: &audit::Report) {
    println!(
        "audit on {} ({}) at {}",
        report.host, report.kernel, report.generated_at
    );
    println!("  broken libraries : {}", report.broken_libs.len());
    println!("  broken symlinks  : {}", report.broken_symlinks.len());
    println!("  orphans          : {}", report.orphans.len());
    println!("  libtool archives : {}", report.pkgconf_la.len());
    println!("  python orphans   : {}", report.python_orphans.len());

    for finding in &report.broken_libs {
        println!("    {} {} ({})", finding.pkg, finding.file, finding.ldd);
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("audit")]
    Audit(#[from] audit::Error),
    #[error("resolver")]
    Resolver(#[from] resolver::Error),
    #[error("encode report")]
    Encode(#[from] serde_json::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
}
