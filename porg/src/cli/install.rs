// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;
use itertools::Itertools;
use log::info;
use rayon::prelude::*;
use thiserror::Error;

use porg::build::{self, Builder};
use porg::db::Database;
use porg::logger::progress::Progress;
use porg::resolver::{self, Resolver};
use porg::tui::{self, Styled};
use porg::{ports, upgrade, Installation};

use super::{Global, Outcome};

#[derive(Debug, Parser)]
#[command(about = "Resolve, build and register packages")]
pub struct Command {
    #[arg(required = true, help = "Packages to install")]
    packages: Vec<String>,
    #[arg(long, help = "Plan only, build nothing")]
    dry_run: bool,
    #[arg(long, help = "Re-enter a failed build at its recorded step")]
    resume: bool,
    #[arg(long, help = "Concurrent builds for independent packages (default PARALLEL_N)")]
    parallel: Option<usize>,
}

pub fn handle(command: Command, install: &Installation, global: &Global) -> Result<Outcome, Error> {
    let db = Database::open(install.db_path(), &install.root);
    let ports = ports::Tree::open(install.ports_dir());
    let mut resolver = Resolver::new(&ports, &db);

    // One merged order covering every requested package
    let mut order: Vec<String> = vec![];
    for package in &command.packages {
        order.extend(resolver.resolve(package)?);
    }
    let order = order.into_iter().unique().collect::<Vec<_>>();

    let pending = order
        .iter()
        .filter(|name| !db.is_installed(name) || command.packages.contains(name))
        .cloned()
        .collect::<Vec<_>>();

    if pending.is_empty() {
        info!("nothing to install");
        return Ok(Outcome::Clean);
    }

    println!("{} {}", "Installing".green().bold(), pending.join(" "));

    if command.dry_run {
        for name in &pending {
            info!("dry-run: would build {name}");
        }
        return Ok(Outcome::Findings);
    }

    if !tui::ask_yes_no(&format!("Install {} package(s)?", pending.len()), global.yes)? {
        return Ok(Outcome::Clean);
    }

    let opts = build::Options {
        auto_yes: global.yes,
        resume: command.resume,
        ..Default::default()
    };

    let parallel = command.parallel.unwrap_or(install.config.parallel_n.get());

    if parallel > 1 {
        build_batched(&pending, &mut resolver, install, &db, &ports, opts, parallel)?;
    } else {
        let mut progress = Progress::new(pending.len() as u64, "building");

        for (done, name) in pending.iter().enumerate() {
            progress.update(done as u64);
            build_one(name, &ports, install, &db, opts)?;
        }

        progress.finish();
    }

    info!("installed {} package(s)", pending.len());

    Ok(Outcome::Clean)
}

fn build_one(
    name: &str,
    ports: &ports::Tree,
    install: &Installation,
    db: &Database,
    opts: build::Options,
) -> Result<(), Error> {
    let recipe = ports.load(name)?;
    let artifact = Builder::new(recipe, install, db, opts).run()?;
    info!("built {}", artifact.display());
    Ok(())
}

fn build_batched(
    pending: &[String],
    resolver: &mut Resolver<'_>,
    install: &Installation,
    db: &Database,
    ports: &ports::Tree,
    opts: build::Options,
    parallel: usize,
) -> Result<(), Error> {
    let batches = upgrade::batches(pending, |name| {
        resolver
            .recipe(name)
            .map(|recipe| recipe.parsed.dependencies.for_build().map(str::to_owned).collect())
            .unwrap_or_default()
    });

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(parallel)
        .build()
        .map_err(|_| Error::Pool)?;

    for batch in batches {
        let failure = pool.install(|| {
            batch
                .par_iter()
                .find_map_first(|name| build_one(name, ports, install, db, opts).err())
        });

        if let Some(err) = failure {
            return Err(err);
        }
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to build worker pool")]
    Pool,
    #[error("resolver")]
    Resolver(#[from] resolver::Error),
    #[error("ports")]
    Ports(#[from] ports::Error),
    #[error("build")]
    Build(#[from] build::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Build(build::Error::Interrupted))
    }
}
