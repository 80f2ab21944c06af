// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::error::Error as _;
use std::process;

mod cli;

fn main() {
    match cli::process() {
        Ok(outcome) => process::exit(outcome.code()),
        Err(err) => {
            report(&err);
            process::exit(err.exit_code());
        }
    }
}

/// Print the full error chain, innermost cause last
fn report(err: &cli::Error) {
    log::error!("{err}");
    eprintln!("error: {err}");

    let mut source = err.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
}
