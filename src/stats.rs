//! Runtime counters for the `stats` RPC.
//!
//! PID 1 cannot be inspected from outside the way a normal daemon can, so
//! the daemon reports on itself: uptime, thread count, its own memory and
//! the machine-wide totals, all preformatted for display.

use std::{
    fs,
    sync::OnceLock,
    time::Instant,
};

use sysinfo::{ProcessesToUpdate, System};

use crate::ipc::SysStats;

static STARTED_AT: OnceLock<Instant> = OnceLock::new();

/// Records the daemon start instant. First call wins; re-exec calls this
/// again in the new image, which restarts the uptime clock for that image.
pub fn mark_start() {
    let _ = STARTED_AT.set(Instant::now());
}

/// Seconds since [`mark_start`].
pub fn uptime_seconds() -> u64 {
    STARTED_AT
        .get()
        .map(|t| t.elapsed().as_secs())
        .unwrap_or(0)
}

/// Formats a duration in seconds as a compact `1w2d3h4m5s` string.
pub fn format_duration(total_seconds: u64) -> String {
    if total_seconds == 0 {
        return "0s".to_string();
    }

    let weeks = total_seconds / 604_800;
    let days = (total_seconds % 604_800) / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    let seconds = total_seconds % 60;

    let mut out = String::new();
    for (value, suffix) in [
        (weeks, "w"),
        (days, "d"),
        (hours, "h"),
        (minutes, "m"),
        (seconds, "s"),
    ] {
        if value > 0 {
            out.push_str(&format!("{value}{suffix}"));
        }
    }
    out
}

/// Formats a byte count with a binary-unit suffix.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Thread count of this process, from `/proc/self/status`.
fn thread_count() -> Option<u64> {
    let status = fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("Threads:"))
        .and_then(|rest| rest.trim().parse().ok())
}

/// Collects the current counters.
pub fn collect() -> SysStats {
    let mut system = System::new();
    system.refresh_memory();

    let (mem_resident, mem_virtual) = match sysinfo::get_current_pid() {
        Ok(pid) => {
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            match system.process(pid) {
                Some(process) => (
                    format_size(process.memory()),
                    format_size(process.virtual_memory()),
                ),
                None => ("unknown".to_string(), "unknown".to_string()),
            }
        }
        Err(_) => ("unknown".to_string(), "unknown".to_string()),
    };

    let load = System::load_average();

    SysStats {
        uptime: format_duration(uptime_seconds()),
        threads: thread_count()
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        mem_resident,
        mem_virtual,
        sys_mem_total: format_size(system.total_memory()),
        sys_mem_available: format_size(system.available_memory()),
        load_average: format!(
            "{:.2} {:.2} {:.2}",
            load.one, load.five, load.fifteen
        ),
    }
}
