// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;
use log::info;
use thiserror::Error;

use porg::{ports, Installation};

use super::Outcome;

#[derive(Debug, Parser)]
#[command(about = "Update the ports tree from its git remote")]
pub struct Command {}

pub fn handle(_command: Command, install: &Installation) -> Result<Outcome, Error> {
    let ports = ports::Tree::open(install.ports_dir());

    ports.sync(install.config.git_repo.as_deref(), &install.config.git_branch)?;

    info!("ports tree synced, {} recipe(s) available", ports.all().len());

    Ok(Outcome::Clean)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("ports")]
    Ports(#[from] ports::Error),
}
