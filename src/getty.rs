//! Getty pool.
//!
//! Spawns login processes on a fixed set of virtual terminals and, when
//! `Persist` is set, respawns any that exit. After a re-exec the pool starts
//! in wait mode: entries inherited from the previous image are polled for
//! liveness and only adopted into the normal respawn loop once the original
//! getty dies.

use std::{
    collections::BTreeMap,
    io,
    os::unix::process::CommandExt,
    process::{Child, Command, Stdio},
    sync::RwLock,
    thread,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{
    constants::{GETTY_WAIT_POLL_INTERVAL, TTYS},
    error::InitError,
    launcher, shutdown,
};

/// Backoff after a failed getty spawn so a missing binary cannot spin.
const RESPAWN_BACKOFF: Duration = Duration::from_secs(1);

/// One tracked getty slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GettyRecord {
    /// Terminal this slot owns, e.g. `tty1`.
    pub tty: String,
    /// PID of the getty process, 0 while (re)spawning.
    pub pid: u32,
    /// Whether this process was spawned by the current image. Inherited
    /// entries stay unmanaged until their process dies.
    pub managed: bool,
    /// User logged in automatically, empty for a plain login prompt.
    pub autologin: String,
}

/// The pool's slot table, index to record, behind its own readers-writer
/// lock. Writers never hold it across a spawn or a wait.
#[derive(Debug, Default)]
pub struct GettyPool {
    entries: RwLock<BTreeMap<usize, GettyRecord>>,
}

impl GettyPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs or replaces a slot.
    pub fn set_entry(
        &self,
        index: usize,
        record: GettyRecord,
    ) -> Result<(), InitError> {
        let mut entries = self.entries.write()?;
        entries.insert(index, record);
        Ok(())
    }

    /// Updates the PID of a slot.
    pub fn set_pid(&self, index: usize, pid: u32) -> Result<(), InitError> {
        let mut entries = self.entries.write()?;
        if let Some(entry) = entries.get_mut(&index) {
            entry.pid = pid;
        }
        Ok(())
    }

    /// Marks a slot as owned by the current image.
    pub fn set_managed(&self, index: usize) -> Result<(), InitError> {
        let mut entries = self.entries.write()?;
        if let Some(entry) = entries.get_mut(&index) {
            entry.managed = true;
        }
        Ok(())
    }

    /// Value copy of a slot.
    pub fn get(&self, index: usize) -> Result<Option<GettyRecord>, InitError> {
        let entries = self.entries.read()?;
        Ok(entries.get(&index).cloned())
    }

    /// Value copy of the whole table, for the re-exec snapshot.
    pub fn export(&self) -> Result<BTreeMap<usize, GettyRecord>, InitError> {
        let entries = self.entries.read()?;
        Ok(entries.clone())
    }

    /// Replaces the table wholesale, demoting every entry to unmanaged.
    /// Used when resuming from a re-exec snapshot.
    pub fn restore(
        &self,
        mut records: BTreeMap<usize, GettyRecord>,
    ) -> Result<(), InitError> {
        for record in records.values_mut() {
            record.managed = false;
        }
        let mut entries = self.entries.write()?;
        *entries = records;
        Ok(())
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether the pool has no slots.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pairs the configured autologin users with the tty sequence. No users
/// still yields one plain getty on tty1; more users than terminals are
/// truncated to the eleven available slots.
pub fn pair_autologins(autologins: &[String]) -> Vec<(usize, String, String)> {
    match autologins.len() {
        0 => vec![(0, TTYS[0].to_string(), String::new())],
        1 => vec![(0, TTYS[0].to_string(), autologins[0].clone())],
        _ => autologins
            .iter()
            .take(TTYS.len())
            .enumerate()
            .map(|(idx, user)| (idx, TTYS[idx].to_string(), user.clone()))
            .collect(),
    }
}

/// Spawns a single getty. The child gets a new session; without `setsid`
/// the login shell fails with "inappropriate ioctl for device".
fn spawn_getty(tty: &str, autologin: &str) -> io::Result<Child> {
    info!("spawning getty on {tty} with user '{autologin}'");

    let mut cmd = Command::new("getty");
    cmd.arg("--noclear").arg(tty);
    if !autologin.is_empty() {
        cmd.arg("--autologin").arg(autologin);
    }
    cmd.stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(io::Error::from)?;
            Ok(())
        });
    }
    cmd.spawn()
}

/// Runs the getty pool until every slot's loop has ended, which only
/// happens on shutdown or when `persist` is off and the gettys exit.
///
/// When `resumed` is set, slots restored from the re-exec snapshot are
/// watched instead of respawned: the inherited getty keeps its terminal
/// until it dies, at which point the slot is adopted and the normal loop
/// takes over.
pub fn manage_gettys(
    pool: &GettyPool,
    persist: bool,
    autologins: &[String],
    resumed: bool,
) {
    if resumed && !pool.is_empty() {
        let inherited: Vec<usize> = match pool.export() {
            Ok(entries) => entries.keys().copied().collect(),
            Err(err) => {
                error!("cannot read inherited getty list: {err}");
                return;
            }
        };
        thread::scope(|scope| {
            for index in inherited {
                scope.spawn(move || watch_inherited(pool, index, persist));
            }
        });
        return;
    }

    let pairs = pair_autologins(autologins);
    thread::scope(|scope| {
        for (index, tty, autologin) in pairs {
            scope.spawn(move || respawn_loop(pool, index, tty, autologin, persist));
        }
    });
}

/// Spawn-and-wait loop for one terminal, respawning while `persist` holds
/// and shutdown has not begun.
fn respawn_loop(
    pool: &GettyPool,
    index: usize,
    tty: String,
    autologin: String,
    persist: bool,
) {
    loop {
        if shutdown::is_shutting_down() {
            return;
        }

        let record = GettyRecord {
            tty: tty.clone(),
            pid: 0,
            managed: true,
            autologin: autologin.clone(),
        };
        if let Err(err) = pool.set_entry(index, record) {
            error!("cannot track getty on {tty}: {err}");
            return;
        }

        match spawn_getty(&tty, &autologin) {
            Ok(mut child) => {
                let _ = pool.set_pid(index, child.id());
                match child.wait() {
                    Ok(status) => info!("getty on {tty} exited with {status}"),
                    Err(err) => error!("wait for getty on {tty} failed: {err}"),
                }
                let _ = pool.set_pid(index, 0);
            }
            Err(err) => {
                error!("getty on {tty} failed to spawn: {err}");
                let _ = pool.set_pid(index, 0);
                thread::sleep(RESPAWN_BACKOFF);
            }
        }

        if !persist || shutdown::is_shutting_down() {
            return;
        }
    }
}

/// Polls an inherited getty until it disappears, then adopts the slot.
fn watch_inherited(pool: &GettyPool, index: usize, persist: bool) {
    let (tty, autologin, pid) = match pool.get(index) {
        Ok(Some(record)) => (record.tty, record.autologin, record.pid),
        Ok(None) => return,
        Err(err) => {
            error!("cannot read inherited getty slot {index}: {err}");
            return;
        }
    };

    while pid > 0 && launcher::process_alive(pid) {
        if shutdown::is_shutting_down() {
            return;
        }
        thread::sleep(GETTY_WAIT_POLL_INTERVAL);
    }

    info!("inherited getty on {tty} is gone, taking ownership");
    if let Err(err) = pool.set_managed(index) {
        error!("cannot adopt getty slot {index}: {err}");
        return;
    }
    if persist && !shutdown::is_shutting_down() {
        respawn_loop(pool, index, tty, autologin, persist);
    }
}
