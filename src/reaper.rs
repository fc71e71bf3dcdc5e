//! Zombie reaper.
//!
//! PID 1 inherits every orphaned process on the system, so something must
//! continually wait on exited children that no supervisor thread is watching.
//! The supervisor's own waits target specific PIDs; when both race for the
//! same child, whichever loses sees "no child processes" and treats it as a
//! completed reap.

use std::{thread, time::Duration};

use nix::{
    errno::Errno,
    sys::wait::{WaitPidFlag, WaitStatus, waitpid},
    unistd::Pid,
};
use tracing::{debug, trace};

/// How long to idle when there are no children at all to wait for.
const NO_CHILD_BACKOFF: Duration = Duration::from_secs(1);

/// Any child of this process.
fn any_child() -> Pid {
    Pid::from_raw(-1)
}

/// Drains exited children forever. Run this on a dedicated background
/// thread: each pass clears any queued backlog without blocking, then parks
/// in one blocking wait so the loop spends its time asleep rather than
/// polling.
pub fn reap_children() -> ! {
    loop {
        drain_zombies();

        match waitpid(any_child(), None) {
            Ok(WaitStatus::Exited(pid, code)) => {
                trace!("reaped pid {pid} (exit {code})");
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                trace!("reaped pid {pid} (signal {signal})");
            }
            Ok(_) => {}
            // No children: sleep instead of spinning on ECHILD.
            Err(Errno::ECHILD) => thread::sleep(NO_CHILD_BACKOFF),
            Err(err) => {
                debug!("blocking waitpid failed: {err}");
                thread::sleep(NO_CHILD_BACKOFF);
            }
        }
    }
}

/// Reaps up to ten queued zombies without blocking and returns how many were
/// collected. A backlog deeper than ten means something else is badly wrong;
/// the next pass will get to them.
pub fn drain_zombies() -> usize {
    let mut reaped = 0;
    for _ in 0..10 {
        match waitpid(any_child(), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                trace!("reaped pid {pid} (exit {code})");
                reaped += 1;
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                trace!("reaped pid {pid} (signal {signal})");
                reaped += 1;
            }
            // Nothing waiting right now, or no children at all.
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
            Ok(_) => {}
            Err(err) => {
                debug!("waitpid failed: {err}");
                break;
            }
        }
    }
    reaped
}
