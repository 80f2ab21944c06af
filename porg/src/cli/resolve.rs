// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;
use log::info;
use thiserror::Error;

use porg::audit::{self, RepairOptions};
use porg::db::Database;
use porg::tui::Styled;
use porg::{ports, Installation};

use super::{Global, Outcome};

#[derive(Debug, Parser)]
#[command(about = "Reverse dependency and orphan maintenance")]
pub struct Command {
    #[arg(long, help = "Scan for binaries with unresolved libraries")]
    scan: bool,
    #[arg(long, help = "Rebuild broken packages")]
    fix: bool,
    #[arg(long, help = "Remove orphaned packages")]
    clean: bool,
    #[arg(long, help = "Scan, fix and clean")]
    all: bool,
    #[arg(long, help = "Concurrent repairs (default PARALLEL_N)")]
    parallel: Option<usize>,
    #[arg(long, help = "Log the plan, change nothing")]
    dry_run: bool,
    #[arg(long, help = "Print findings as JSON")]
    json: bool,
}

pub fn handle(command: Command, install: &Installation, global: &Global) -> Result<Outcome, Error> {
    let db = Database::open(install.db_path(), &install.root);
    let ports = ports::Tree::open(install.ports_dir());

    let scan = command.scan || command.all || !(command.fix || command.clean);
    let fix = command.fix || command.all;
    let clean = command.clean || command.all;

    let repair = RepairOptions {
        dry_run: command.dry_run,
        auto_yes: global.yes,
        parallel: command.parallel.unwrap_or(install.config.parallel_n.get()),
    };

    let mut outcome = Outcome::Clean;

    let broken = if scan || fix {
        let broken = audit::revdep_scan(&db, install)?;

        if command.json {
            println!("{}", serde_json::to_string_pretty(&broken)?);
        } else if broken.is_empty() {
            info!("no broken packages found");
        } else {
            for finding in &broken {
                println!("{} {} {} ({})", "broken".red().bold(), finding.pkg, finding.file, finding.ldd);
            }
        }

        if !broken.is_empty() && !fix {
            outcome = Outcome::Findings;
        }

        broken
    } else {
        vec![]
    };

    if fix && !broken.is_empty() {
        let failures = audit::fix_broken(&broken, install, &db, &ports, repair)?;
        if !failures.is_empty() {
            info!("{} package(s) could not be repaired", failures.len());
            outcome = Outcome::Partial;
        }
    }

    if clean {
        let orphans = audit::depclean_scan(&db, &ports)?;

        if command.json {
            println!("{}", serde_json::to_string_pretty(&orphans)?);
        } else {
            for orphan in &orphans {
                println!("{} {} ({})", "orphan".yellow().bold(), orphan.pkg, orphan.prefix);
            }
        }

        if !orphans.is_empty() {
            let failures = audit::clean_orphans(&orphans, install, &db, &ports, repair)?;
            if !failures.is_empty() {
                outcome = Outcome::Partial;
            }
        }
    }

    Ok(outcome)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("audit")]
    Audit(#[from] audit::Error),
    #[error("encode findings")]
    Encode(#[from] serde_json::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
}
