// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Child process execution with resource accounting.

use std::io;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use super::progress::read_vm_rss_kib;

const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub command: String,
    pub wall_ms: u128,
    pub peak_rss_kib: u64,
    pub exit_code: Option<i32>,
}

impl Report {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run `command` to completion, sampling its VmRSS from
/// /proc/{pid}/status, and emit a structured PERF line.
pub fn run(mut command: Command) -> Result<Report, Error> {
    let rendered = render(&command);

    let start = Instant::now();
    let mut child = command.spawn().map_err(|err| Error::Spawn(rendered.clone(), err))?;
    let pid = child.id();

    let mut peak_rss_kib = 0;

    let exit_code = loop {
        if let Some(status) = child.try_wait()? {
            break status.code();
        }

        if let Some(rss) = read_vm_rss_kib(pid) {
            peak_rss_kib = peak_rss_kib.max(rss);
        }

        thread::sleep(SAMPLE_INTERVAL);
    };

    let report = Report {
        command: rendered,
        wall_ms: start.elapsed().as_millis(),
        peak_rss_kib,
        exit_code,
    };

    log::info!(
        target: "porg::perf",
        "PERF {}",
        serde_json::to_string(&report).unwrap_or_default()
    );

    Ok(report)
}

fn render(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("spawn {0}")]
    Spawn(String, #[source] io::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reports_exit_and_rss() {
        let mut command = Command::new("sh");
        command.args(["-c", "sleep 0.3"]);

        let report = run(command).unwrap();
        assert!(report.success());
        assert!(report.wall_ms >= 300);
        assert!(report.peak_rss_kib > 0);
    }

    #[test]
    fn captures_failure_code() {
        let mut command = Command::new("sh");
        command.args(["-c", "exit 3"]);

        let report = run(command).unwrap();
        assert_eq!(report.exit_code, Some(3));
        assert!(!report.success());
    }
}
