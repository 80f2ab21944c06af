// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use clap::{Args, Parser};
use log::LevelFilter;
use thiserror::Error;

use porg::{config, logger, signal, Config, Installation};

mod audit;
mod bootstrap;
mod install;
mod remove;
mod resolve;
mod sync;
mod upgrade;
mod version;

#[derive(Debug, Parser)]
#[command(name = "porg", about = "Source based package management for the impatient")]
pub struct Command {
    #[command(flatten)]
    pub global: Global,
    #[command(subcommand)]
    pub subcommand: Subcommand,
}

#[derive(Debug, Args)]
pub struct Global {
    #[arg(
        short = 'D',
        long = "directory",
        global = true,
        default_value = "/",
        help = "Target root directory"
    )]
    pub root: PathBuf,
    #[arg(long = "config", global = true, help = "Alternate porg.conf path")]
    pub config: Option<PathBuf>,
    #[arg(short, long = "yes-all", global = true, help = "Assume yes for all questions")]
    pub yes: bool,
    #[arg(short, long, global = true, help = "Only mirror warnings and errors to the terminal")]
    pub quiet: bool,
    #[arg(short, long, global = true, help = "Log debug detail")]
    pub verbose: bool,
}

#[derive(Debug, clap::Subcommand)]
pub enum Subcommand {
    Install(install::Command),
    Remove(remove::Command),
    Upgrade(upgrade::Command),
    Resolve(resolve::Command),
    Audit(audit::Command),
    Bootstrap(bootstrap::Command),
    Sync(sync::Command),
    Version(version::Command),
}

/// Exit disposition for `main`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// 0: everything done
    Clean,
    /// 1: recoverable issues found (audit findings, plan pending)
    Findings,
    /// 3: some items succeeded, some failed
    Partial,
}

impl Outcome {
    pub fn code(self) -> i32 {
        match self {
            Outcome::Clean => 0,
            Outcome::Findings => 1,
            Outcome::Partial => 3,
        }
    }
}

pub fn process() -> Result<Outcome, Error> {
    let Command { global, subcommand } = Command::parse();

    let config_path = global
        .config
        .clone()
        .unwrap_or_else(|| global.root.join(config::DEFAULT_PATH.trim_start_matches('/')));
    let mut config = Config::load(&config_path)?;

    if global.verbose {
        config.log_level = LevelFilter::Debug;
    }

    let install = Installation::open(global.root.clone(), config);

    let session = match &subcommand {
        Subcommand::Install(_) => "install",
        Subcommand::Remove(_) => "remove",
        Subcommand::Upgrade(_) => "upgrade",
        Subcommand::Resolve(_) => "resolve",
        Subcommand::Audit(_) => "audit",
        Subcommand::Bootstrap(_) => "bootstrap",
        Subcommand::Sync(_) => "sync",
        Subcommand::Version(_) => "version",
    };

    if !matches!(subcommand, Subcommand::Version(_)) {
        match logger::init(
            &install.log_dir(),
            session,
            install.config.log_level,
            global.quiet,
            install.config.log_color,
            install.config.log_json,
        ) {
            Ok(path) => log::debug!("session log at {}", path.display()),
            Err(err) => eprintln!("warning: session log unavailable: {err}"),
        }

        if let Err(err) = logger::rotate(&install.log_dir(), install.config.log_rotate_days) {
            log::debug!("log rotation skipped: {err}");
        }

        signal::install_interrupt_flag()?;
    }

    let outcome = match subcommand {
        Subcommand::Install(command) => install::handle(command, &install, &global).map_err(Error::Install),
        Subcommand::Remove(command) => remove::handle(command, &install, &global).map_err(Error::Remove),
        Subcommand::Upgrade(command) => upgrade::handle(command, &install, &global).map_err(Error::Upgrade),
        Subcommand::Resolve(command) => resolve::handle(command, &install, &global).map_err(Error::Resolve),
        Subcommand::Audit(command) => audit::handle(command, &install, &global).map_err(Error::Audit),
        Subcommand::Bootstrap(command) => bootstrap::handle(command, &install, &global).map_err(Error::Bootstrap),
        Subcommand::Sync(command) => sync::handle(command, &install).map_err(Error::Sync),
        Subcommand::Version(command) => {
            version::handle(command);
            Ok(Outcome::Clean)
        }
    };

    let counters = logger::counters();
    if counters.warn + counters.error > 0 {
        if let Some(path) = logger::session_path() {
            eprintln!(
                "{} warning(s), {} error(s); session log at {}",
                counters.warn,
                counters.error,
                path.display()
            );
        }
    }

    outcome
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("config")]
    Config(#[from] config::Error),
    #[error("signal handling")]
    Signal(#[from] signal::Error),
    #[error("install")]
    Install(#[source] install::Error),
    #[error("remove")]
    Remove(#[source] remove::Error),
    #[error("upgrade")]
    Upgrade(#[source] upgrade::Error),
    #[error("resolve")]
    Resolve(#[source] resolve::Error),
    #[error("audit")]
    Audit(#[source] audit::Error),
    #[error("bootstrap")]
    Bootstrap(#[source] bootstrap::Error),
    #[error("sync")]
    Sync(#[source] sync::Error),
}

impl Error {
    /// 130 for user interrupts, 2 for everything else
    pub fn exit_code(&self) -> i32 {
        if self.is_interrupted() {
            130
        } else {
            2
        }
    }

    fn is_interrupted(&self) -> bool {
        match self {
            Error::Install(err) => err.is_interrupted(),
            Error::Upgrade(err) => err.is_interrupted(),
            Error::Bootstrap(err) => err.is_interrupted(),
            _ => false,
        }
    }
}
