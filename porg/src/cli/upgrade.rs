// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;
use log::{info, warn};
use thiserror::Error;

use porg::audit;
use porg::db::Database;
use porg::resolver::{self, Resolver, Scope};
use porg::tui::{self, Styled};
use porg::upgrade::{self, Options};
use porg::{ports, Installation};

use super::{Global, Outcome};

#[derive(Debug, Parser)]
#[command(about = "Plan and execute upgrades")]
pub struct Command {
    #[arg(long, conflicts_with = "world", help = "Upgrade a single package")]
    pkg: Option<String>,
    #[arg(long, help = "Upgrade everything installed")]
    world: bool,
    #[arg(long, help = "Print the plan and stop")]
    check: bool,
    #[arg(long, help = "Sync the ports tree first")]
    sync: bool,
    #[arg(long, help = "Continue a previously interrupted run")]
    resume: bool,
    #[arg(long, help = "Run a revdep repair pass afterwards")]
    revdep: bool,
    #[arg(long, help = "Clean orphans afterwards")]
    clean: bool,
    #[arg(long, help = "Concurrent builds per batch (default PARALLEL_N)")]
    parallel: Option<usize>,
    #[arg(long, help = "Log the plan, change nothing")]
    dry_run: bool,
}

pub fn handle(command: Command, install: &Installation, global: &Global) -> Result<Outcome, Error> {
    let db = Database::open(install.db_path(), &install.root);
    let ports = ports::Tree::open(install.ports_dir());

    if command.sync {
        ports.sync(install.config.git_repo.as_deref(), &install.config.git_branch)?;
    }

    let scope = match &command.pkg {
        Some(name) => Scope::Single(name.clone()),
        None => Scope::World,
    };

    let mut resolver = Resolver::new(&ports, &db);
    let plan = upgrade::plan(scope, &mut resolver)?;

    if plan.needs_rebuild.is_empty() && !command.resume {
        info!("everything is up to date");
        return Ok(Outcome::Clean);
    }

    println!("{} {}", "Upgrading".green().bold(), plan.needs_rebuild.join(" "));

    if command.check {
        return Ok(Outcome::Findings);
    }

    if !command.dry_run
        && !tui::ask_yes_no(&format!("Upgrade {} package(s)?", plan.needs_rebuild.len()), global.yes)?
    {
        return Ok(Outcome::Clean);
    }

    let parallel = command.parallel.unwrap_or(install.config.parallel_n.get());

    let summary = upgrade::execute(
        &plan,
        install,
        &db,
        &ports,
        Options {
            resume: command.resume,
            dry_run: command.dry_run,
            auto_yes: global.yes,
            force: false,
            parallel,
        },
    )?;

    info!(
        "upgraded {} package(s), {} already current",
        summary.upgraded.len(),
        summary.skipped.len()
    );

    let mut outcome = Outcome::Clean;

    if command.revdep {
        let broken = audit::revdep_scan(&db, install)?;
        if !broken.is_empty() {
            warn!("{} package(s) broken after upgrade, rebuilding", broken.len());
            let failures = audit::fix_broken(
                &broken,
                install,
                &db,
                &ports,
                audit::RepairOptions {
                    dry_run: command.dry_run,
                    auto_yes: global.yes,
                    parallel,
                },
            )?;
            if !failures.is_empty() {
                outcome = Outcome::Partial;
            }
        }
    }

    if command.clean {
        let orphans = audit::depclean_scan(&db, &ports)?;
        let failures = audit::clean_orphans(
            &orphans,
            install,
            &db,
            &ports,
            audit::RepairOptions {
                dry_run: command.dry_run,
                auto_yes: global.yes,
                parallel,
            },
        )?;
        if !failures.is_empty() {
            outcome = Outcome::Partial;
        }
    }

    Ok(outcome)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("upgrade")]
    Upgrade(#[from] upgrade::Error),
    #[error("resolver")]
    Resolver(#[from] resolver::Error),
    #[error("audit")]
    Audit(#[from] audit::Error),
    #[error("ports")]
    Ports(#[from] ports::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Upgrade(upgrade::Error::Interrupted))
    }
}
