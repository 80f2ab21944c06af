// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::io::{self, stdout, BufRead, Write};

use crossterm::tty::IsTty;

pub use indicatif::{ProgressBar, ProgressStyle};

macro_rules! impl_method {
    ($method:ident) => {
        fn $method(self) -> <Self as crossterm::style::Stylize>::Styled {
            if stdout().is_tty() {
                <Self as crossterm::style::Stylize>::$method(self)
            } else {
                <Self as crossterm::style::Stylize>::stylize(self)
            }
        }
    };
}

/// Wrapper around [`crossterm::style::Stylize`] which does nothing
/// when stdout is not a TTY
pub trait Styled: crossterm::style::Stylize {
    impl_method!(bold);
    impl_method!(dim);
    impl_method!(red);
    impl_method!(green);
    impl_method!(yellow);
    impl_method!(blue);
    impl_method!(cyan);
    impl_method!(magenta);
}

impl<T> Styled for T where T: crossterm::style::Stylize {}

/// Prompt yes/no on the controlling terminal. `auto_yes` short
/// circuits for `--yes` runs and non-interactive sessions.
pub fn ask_yes_no(question: &str, auto_yes: bool) -> io::Result<bool> {
    if auto_yes || !stdout().is_tty() {
        return Ok(auto_yes);
    }

    print!("{question} {}{} / {}{} ", "[".dim(), "yes".bold(), "no".bold().red(), "]".dim());
    stdout().flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;

    Ok(matches!(line.trim().to_lowercase().as_str(), "y" | "yes"))
}
