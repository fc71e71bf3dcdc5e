//! Shutdown controller.
//!
//! Terminates everything except PID 1 (SIGTERM grace, then SIGKILL),
//! detaches the file log, unmounts filesystems and issues the kernel
//! reboot call. Also owns the process-wide shutting-down flag the getty
//! pool consults to break out of its respawn loops.

use std::{
    fs,
    sync::atomic::{AtomicBool, Ordering},
    thread,
};

use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tracing::{error, info};

use crate::{
    constants::{KILL_WAIT_ATTEMPTS, KILL_WAIT_INTERVAL, NET_FS, VIRT_FS},
    error::InitError,
    logging, mount,
};

static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);

/// Raises the process-wide shutting-down flag.
pub fn begin_shutdown() {
    SHUTTING_DOWN.store(true, Ordering::SeqCst);
}

/// Whether shutdown is in progress. Respawn loops poll this.
pub fn is_shutting_down() -> bool {
    SHUTTING_DOWN.load(Ordering::SeqCst)
}

/// Lists every PID ≥ 2 on the system that has a command line. Kernel
/// threads have an empty cmdline and are skipped.
pub fn list_system_pids() -> Result<Vec<u32>, InitError> {
    let mut pids = Vec::new();
    for entry in fs::read_dir("/proc")? {
        let entry = entry?;
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        if pid < 2 {
            continue;
        }
        let cmdline = format!("/proc/{pid}/cmdline");
        match fs::read(&cmdline) {
            Ok(contents) if !contents.is_empty() => pids.push(pid),
            _ => {}
        }
    }
    Ok(pids)
}

/// Waits up to a minute for all processes to die.
fn wait_for_death() -> Result<(), InitError> {
    for _ in 0..KILL_WAIT_ATTEMPTS {
        let pids = list_system_pids()?;
        if pids.is_empty() {
            return Ok(());
        }
        info!(
            "waiting for processes to die ({} left)...",
            pids.len()
        );
        thread::sleep(KILL_WAIT_INTERVAL);
    }
    Err(InitError::StopFailure {
        service: "system".to_string(),
        detail: "processes did not die after a minute".to_string(),
    })
}

fn signal_all(pids: &[u32], signal_kind: Signal) {
    for &pid in pids {
        let _ = signal::kill(Pid::from_raw(pid as i32), signal_kind);
    }
}

/// Kills every process on the system except init: SIGTERM to all, wait for
/// the zombies to clear, then SIGKILL the survivors and wait again.
pub fn kill_all() {
    info!("killing system processes...");

    match list_system_pids() {
        Ok(pids) => signal_all(&pids, Signal::SIGTERM),
        Err(err) => {
            error!("cannot enumerate processes: {err}");
            return;
        }
    }

    if let Err(err) = wait_for_death() {
        error!("{err}");
    }

    // Survivors did not respond to SIGTERM, so be mean.
    if let Ok(pids) = list_system_pids() {
        if !pids.is_empty() {
            info!(
                "sent kill signal to {} process(es) that ignored term",
                pids.len()
            );
            signal_all(&pids, Signal::SIGKILL);
            thread::sleep(KILL_WAIT_INTERVAL);
        }
    }

    if let Err(err) = wait_for_death() {
        error!("{err}");
    }
}

/// Terminates userspace and powers off or reboots the machine. Only
/// returns if the final reboot call fails.
pub fn run(reboot: bool) {
    begin_shutdown();
    info!("shutdown or reboot initiated, please wait...");

    kill_all();

    // The log file's filesystem is about to go away.
    logging::detach_file();

    info!("unmounting filesystems...");
    let mut except: Vec<&str> = Vec::new();
    except.extend_from_slice(&NET_FS);
    except.extend_from_slice(&VIRT_FS);
    mount::unmount_all_except(&except);

    // Halt explicitly to prevent a kernel panic when PID 1 exits.
    let mode = if reboot {
        nix::sys::reboot::RebootMode::RB_AUTOBOOT
    } else {
        nix::sys::reboot::RebootMode::RB_POWER_OFF
    };
    if let Err(err) = nix::sys::reboot::reboot(mode) {
        error!("reboot call failed: {err}");
    }
}
