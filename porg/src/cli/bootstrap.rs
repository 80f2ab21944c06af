// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;
use thiserror::Error;

use porg::bootstrap::{self, Bootstrap, Status};
use porg::db::Database;
use porg::tui::Styled;
use porg::{ports, Installation};

use super::{Global, Outcome};

#[derive(Debug, Parser)]
#[command(about = "LFS style bootstrap into the alternate root")]
pub struct Command {
    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, clap::Subcommand)]
enum Action {
    #[command(about = "Create the bootstrap root and state dirs")]
    Prepare,
    #[command(about = "List the manifest phases")]
    List,
    #[command(about = "Report per-phase status")]
    Verify,
    #[command(about = "Re-run one phase unconditionally")]
    Rebuild { phase: String },
    #[command(about = "Run all phases in order")]
    Build {
        #[arg(long, help = "Print the plan, build nothing")]
        dry: bool,
    },
    #[command(about = "Continue from the first non-success phase")]
    Resume,
    #[command(about = "Open a shell inside the bootstrap root")]
    Enter,
    #[command(about = "Delegate image generation to the iso hook")]
    Iso,
    #[command(about = "Forget all phase state")]
    Clean,
    #[command(about = "prepare + build in one go")]
    Full,
}

pub fn handle(command: Command, install: &Installation, _global: &Global) -> Result<Outcome, Error> {
    let db = Database::open(install.db_path(), &install.root);
    let ports = ports::Tree::open(install.ports_dir());

    let bootstrap = Bootstrap::open(install, &db, &ports)?;

    match command.action {
        Action::Prepare => bootstrap.prepare()?,
        Action::List => {
            for (i, phase) in bootstrap.phases().iter().enumerate() {
                println!("{i:>2} {phase}");
            }
        }
        Action::Verify => {
            let mut pending = false;

            for (phase, state) in bootstrap.verify()? {
                let status = match state.as_ref().map(|s| s.status) {
                    Some(Status::Success) => format!("{}", "success".green()),
                    Some(Status::Failed) => format!("{}", "failed".red()),
                    Some(Status::Building) => format!("{}", "building".yellow()),
                    None => format!("{}", "pending".dim()),
                };

                if !matches!(state.map(|s| s.status), Some(Status::Success)) {
                    pending = true;
                }

                println!("{status:>10} {phase}");
            }

            if pending {
                return Ok(Outcome::Findings);
            }
        }
        Action::Rebuild { phase } => bootstrap.rebuild(&phase)?,
        Action::Build { dry } => bootstrap.build(false, dry)?,
        Action::Resume => bootstrap.build(true, false)?,
        Action::Enter => bootstrap.enter()?,
        Action::Iso => bootstrap.iso()?,
        Action::Clean => bootstrap.clean()?,
        Action::Full => bootstrap.full()?,
    }

    Ok(Outcome::Clean)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("bootstrap")]
    Bootstrap(#[from] bootstrap::Error),
}

impl Error {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Bootstrap(bootstrap::Error::Interrupted))
    }
}
