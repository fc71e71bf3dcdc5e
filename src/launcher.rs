//! Process launching primitives.
//!
//! Service commands are shell strings; every launch goes through `sh -c` so
//! unit files may use pipelines and expansions. Forking-kind commands get a
//! fresh process group so later signals reach the whole group; stderr is
//! inherited so early boot output lands on the console.

use std::{
    fs, io,
    os::unix::process::CommandExt,
    path::Path,
    process::{Child, Command, Stdio},
};

use tracing::debug;

use crate::constants::{SHELL, SHELL_COMMAND_FLAG};

fn shell(cmd: &str) -> Command {
    let mut command = Command::new(SHELL);
    command
        .arg(SHELL_COMMAND_FLAG)
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    command
}

fn status_error(status: std::process::ExitStatus) -> io::Error {
    io::Error::other(format!("command exited with {status}"))
}

/// Runs a command string synchronously, waiting for it to finish. A non-zero
/// exit becomes an error.
pub fn run_sync(cmd: &str) -> io::Result<()> {
    debug!("running: {cmd}");
    let status = shell(cmd).status()?;
    if !status.success() {
        return Err(status_error(status));
    }
    Ok(())
}

/// Runs a command string synchronously in a new process group. Used for
/// forking-kind bodies so signals sent later reach everything the command
/// daemonized.
pub fn run_sync_in_group(cmd: &str) -> io::Result<()> {
    debug!("running in new group: {cmd}");
    let status = shell(cmd).process_group(0).status()?;
    if !status.success() {
        return Err(status_error(status));
    }
    Ok(())
}

/// Spawns a command string asynchronously and hands the child back so the
/// caller can track its PID and wait on it. Used for simple-kind bodies.
pub fn spawn_async(cmd: &str) -> io::Result<Child> {
    debug!("spawning: {cmd}");
    shell(cmd).spawn()
}

/// Reads a PID from a PID file. Daemons write these with trailing
/// whitespace or not at all, so any parse failure is treated as absent.
pub fn read_pid_file(path: &Path) -> Option<u32> {
    let content = fs::read_to_string(path).ok()?;
    content.trim().parse::<u32>().ok().filter(|&pid| pid > 1)
}

/// Whether `pid` names a live (non-zombie) process.
pub fn process_alive(pid: u32) -> bool {
    if pid <= 1 {
        return false;
    }
    let stat_path = format!("/proc/{pid}/stat");
    match fs::read_to_string(&stat_path) {
        Ok(stat) => !matches!(proc_stat_state(&stat), Some('Z') | Some('X')),
        Err(_) => false,
    }
}

/// Extracts the state character from a `/proc/<pid>/stat` line. The command
/// name is wrapped in parentheses and may itself contain spaces, so scan
/// from the closing parenthesis.
pub fn proc_stat_state(stat: &str) -> Option<char> {
    let state_start = stat.rfind(')')?;
    stat[state_start + 1..].trim().chars().next()
}
