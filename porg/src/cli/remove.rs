// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;
use log::info;
use thiserror::Error;

use porg::db::Database;
use porg::remove::{self, Options};
use porg::tui;
use porg::{ports, Installation};

use super::{Global, Outcome};

#[derive(Debug, Parser)]
#[command(about = "Uninstall packages")]
pub struct Command {
    #[arg(required = true, help = "Packages to remove")]
    packages: Vec<String>,
    #[arg(short, long, help = "Ignore dependents and hook failures")]
    force: bool,
    #[arg(short, long, help = "Also remove dependencies orphaned by this removal")]
    recursive: bool,
    #[arg(long, help = "Log the plan, change nothing")]
    dry_run: bool,
}

pub fn handle(command: Command, install: &Installation, global: &Global) -> Result<Outcome, Error> {
    let db = Database::open(install.db_path(), &install.root);
    let ports = ports::Tree::open(install.ports_dir());

    if !command.dry_run
        && !tui::ask_yes_no(
            &format!("Remove {}?", command.packages.join(", ")),
            global.yes,
        )?
    {
        return Ok(Outcome::Clean);
    }

    let opts = Options {
        force: command.force,
        recursive: command.recursive,
        dry_run: command.dry_run,
    };

    let mut removed = 0;

    for package in &command.packages {
        let outcome = remove::remove(package, install, &db, &ports, opts)?;
        removed += outcome.removed.len();
    }

    info!("removed {removed} package(s)");

    Ok(if command.dry_run { Outcome::Findings } else { Outcome::Clean })
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("remove")]
    Remove(#[from] remove::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
}
