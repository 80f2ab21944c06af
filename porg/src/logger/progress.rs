// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Single line progress rendering with machine load sampling.

use std::time::{Duration, Instant};

use fs_err as fs;

use crate::tui::{ProgressBar, ProgressStyle};

/// Minimum interval between redraws
const REDRAW_INTERVAL: Duration = Duration::from_millis(150);

/// A `[filled/total]` progress line carrying percent, load average,
/// CPU usage, resident memory and ETA, redrawn in place.
pub struct Progress {
    bar: ProgressBar,
    cpu: CpuSampler,
    last_sample: Instant,
}

impl Progress {
    pub fn new(total: u64, message: impl Into<String>) -> Self {
        let bar = ProgressBar::new(total).with_style(
            ProgressStyle::with_template("|{bar:20.cyan/blue}| [{pos}/{len}] {percent:>3}% {msg} eta {eta}")
                .unwrap()
                .progress_chars("■≡=- "),
        );
        bar.set_message(message.into());
        bar.enable_steady_tick(REDRAW_INTERVAL);

        Self {
            bar,
            cpu: CpuSampler::default(),
            last_sample: Instant::now() - REDRAW_INTERVAL,
        }
    }

    /// Advance to `filled` complete items, refreshing the samples at
    /// most once per redraw interval
    pub fn update(&mut self, filled: u64) {
        self.bar.set_position(filled);

        if self.last_sample.elapsed() >= REDRAW_INTERVAL {
            self.last_sample = Instant::now();

            let load = read_load_average().unwrap_or_default();
            let cpu = self.cpu.sample().unwrap_or_default();
            let rss = read_self_rss_mib().unwrap_or_default();

            self.bar.set_message(format!("load {load:.2} cpu {cpu:.0}% rss {rss}MiB"));
        }
    }

    pub fn inc(&mut self) {
        self.update(self.bar.position() + 1);
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// 1 minute load average from /proc/loadavg
fn read_load_average() -> Option<f64> {
    let contents = fs::read_to_string("/proc/loadavg").ok()?;
    contents.split_whitespace().next()?.parse().ok()
}

/// VmRSS of the current process in MiB
fn read_self_rss_mib() -> Option<u64> {
    read_vm_rss_kib(std::process::id()).map(|kib| kib / 1024)
}

/// VmRSS of `pid` in KiB, from /proc/{pid}/status
pub fn read_vm_rss_kib(pid: u32) -> Option<u64> {
    let contents = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;

    contents
        .lines()
        .find(|line| line.starts_with("VmRSS:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

/// Whole machine CPU usage between consecutive samples
#[derive(Default)]
struct CpuSampler {
    last: Option<(u64, u64)>,
}

impl CpuSampler {
    fn sample(&mut self) -> Option<f64> {
        let contents = fs::read_to_string("/proc/stat").ok()?;
        let mut fields = contents.lines().next()?.split_whitespace().skip(1);

        let mut total = 0u64;
        let mut idle = 0u64;

        for (i, field) in fields.by_ref().enumerate() {
            let value: u64 = field.parse().ok()?;
            total += value;
            // idle + iowait
            if i == 3 || i == 4 {
                idle += value;
            }
        }

        let previous = self.last.replace((total, idle));
        let (prev_total, prev_idle) = previous?;

        let d_total = total.saturating_sub(prev_total);
        let d_idle = idle.saturating_sub(prev_idle);

        if d_total == 0 {
            return None;
        }

        Some(100.0 * (d_total - d_idle) as f64 / d_total as f64)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rss_of_current_process_is_nonzero() {
        assert!(read_vm_rss_kib(std::process::id()).unwrap_or_default() > 0);
    }

    #[test]
    fn load_average_parses() {
        assert!(read_load_average().is_some());
    }
}
