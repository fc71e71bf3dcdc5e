//! Service records and the table that owns them.
//!
//! The [`ServiceTable`] is the authoritative mapping from service name to
//! [`ServiceRecord`], guarded by a single readers-writer lock. Every other
//! subsystem references records by name and looks them up under the lock;
//! nothing holds an interior reference across an unlock.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::RwLock,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::error::InitError;

/// Running state of a single service.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default,
)]
#[strum(serialize_all = "lowercase")]
pub enum RunState {
    /// Never started since this record was created.
    #[default]
    #[strum(serialize = "not started")]
    NotStarted,
    /// Launch sequence in progress.
    Starting,
    /// Launch sequence completed according to the kind's success rules.
    Started,
    /// Stopped on request, or a simple child exited cleanly on its own.
    Stopped,
    /// A launch or stop step failed, or a simple child exited non-zero.
    Errored,
}

/// The most recent action applied to a service.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default,
)]
#[strum(serialize_all = "lowercase")]
pub enum LastAction {
    /// No action recorded yet.
    #[default]
    Unknown,
    /// `ExecPreStart` ran.
    #[strum(serialize = "pre-start")]
    PreStart,
    /// `ExecStart` ran or the service was started.
    Start,
    /// `ExecPostStart` ran.
    #[strum(serialize = "post-start")]
    PostStart,
    /// `ExecPreStop` ran.
    #[strum(serialize = "pre-stop")]
    PreStop,
    /// `ExecStop` ran or the service was stopped.
    Stop,
    /// `ExecPostStop` ran.
    #[strum(serialize = "post-stop")]
    PostStop,
    /// Definition refreshed by a configuration reload.
    Reload,
    /// Stop-then-start cycle.
    Restart,
    /// SIGKILL was delivered.
    Forcekill,
}

/// Execution model of a service. The arms carry kind-specific parameters so
/// launch and stop logic dispatch by matching rather than by string compares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServiceKind {
    /// Long-lived foreground child whose PID the supervisor tracks.
    Simple,
    /// Command that self-daemonizes; liveness is re-derived from the PID file.
    Forking {
        /// Where the daemonized process records its PID. Optional but
        /// strongly recommended; liveness checks are best-effort without it.
        pid_file: Option<PathBuf>,
    },
    /// Runs once to completion; success is exit status zero.
    Oneshot,
    /// No executable body. State reflects whether dependencies are started.
    Virtual,
}

impl ServiceKind {
    /// Short label for status output.
    pub fn label(&self) -> &'static str {
        match self {
            ServiceKind::Simple => "simple",
            ServiceKind::Forking { .. } => "forking",
            ServiceKind::Oneshot => "oneshot",
            ServiceKind::Virtual => "virtual",
        }
    }
}

/// A single supervised unit: its definition and its mutable runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Unique name, `<stem>.service` or `<stem>.target`.
    pub name: String,
    /// Execution model.
    pub kind: ServiceKind,
    /// Free-form description, display only.
    pub description: String,
    /// Whether the boot pass starts this unit.
    pub auto_start: bool,
    /// Command run before the main command. Empty means none.
    pub exec_pre_start: String,
    /// The main command. Required unless the kind is virtual.
    pub exec_start: String,
    /// Command run after the main command has been launched.
    pub exec_post_start: String,
    /// Command run before the stop command.
    pub exec_pre_stop: String,
    /// The stop command. Empty means none.
    pub exec_stop: String,
    /// Command run after the stop command.
    pub exec_post_stop: String,
    /// Peers that must reach `Started` before this unit starts.
    pub requires: Vec<String>,
    /// Peers ordered before this unit.
    pub after: Vec<String>,
    /// Peers ordered after this unit.
    pub before: Vec<String>,
    /// Target this unit belongs to. Empty for targets themselves.
    pub wanted_by: String,
    /// Current run state.
    pub state: RunState,
    /// Most recent action applied.
    pub last_action: LastAction,
    /// Wall-clock seconds of the most recent action.
    pub last_action_at: i64,
    /// Last error text, if any.
    pub last_message: String,
    /// PID of the main child, or from the PID file. 0 when unknown.
    pub last_known_pid: u32,
    /// Tombstone set when the unit file disappeared across a reload.
    pub deleted: bool,
}

impl ServiceRecord {
    /// Whether this record is a target (a boot-phase barrier).
    pub fn is_target(&self) -> bool {
        self.name.ends_with(".target")
    }

    /// Records `action` as the most recent one, stamped with the current
    /// wall clock.
    pub fn touch(&mut self, action: LastAction) {
        self.last_action = action;
        self.last_action_at = Utc::now().timestamp();
    }

    /// All names this record references: requires, after, before and the
    /// owning target. Used by validation and by the dependency sorter.
    pub fn references(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.requires
            .iter()
            .map(|n| ("Requires", n.as_str()))
            .chain(self.after.iter().map(|n| ("After", n.as_str())))
            .chain(self.before.iter().map(|n| ("Before", n.as_str())))
            .chain(
                (!self.wanted_by.is_empty())
                    .then_some(("WantedBy", self.wanted_by.as_str())),
            )
    }
}

#[derive(Debug, Default)]
struct TableInner {
    services: HashMap<String, ServiceRecord>,
    /// Topologically sorted targets; rebuilt on every load.
    targets_order: Vec<String>,
    /// Per-target start order of member services; rebuilt on every load.
    services_order: HashMap<String, Vec<String>>,
    /// Names with a control operation in flight. Serializes start/stop
    /// requests against the same service.
    in_flight: HashSet<String>,
}

/// The authoritative service table. One instance per process.
#[derive(Debug, Default)]
pub struct ServiceTable {
    inner: RwLock<TableInner>,
}

/// RAII guard for the per-name in-flight flag.
pub struct InFlightGuard<'a> {
    table: &'a ServiceTable,
    name: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.table.inner.write() {
            inner.in_flight.remove(&self.name);
        }
    }
}

impl ServiceTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a freshly parsed record, replacing any record of the same name.
    pub fn insert(&self, record: ServiceRecord) -> Result<(), InitError> {
        let mut inner = self.inner.write()?;
        inner.services.insert(record.name.clone(), record);
        Ok(())
    }

    /// Updates the definition fields of an existing record in place,
    /// clearing its tombstone but preserving runtime state, PID and
    /// timestamps. Used by reload for units that reappear on disk.
    pub fn update_definition(
        &self,
        fresh: &ServiceRecord,
    ) -> Result<(), InitError> {
        let mut inner = self.inner.write()?;
        let record = inner
            .services
            .get_mut(&fresh.name)
            .ok_or_else(|| InitError::UnknownService(fresh.name.clone()))?;

        record.deleted = false;
        record.kind = fresh.kind.clone();
        record.description = fresh.description.clone();
        record.auto_start = fresh.auto_start;
        record.exec_pre_start = fresh.exec_pre_start.clone();
        record.exec_start = fresh.exec_start.clone();
        record.exec_post_start = fresh.exec_post_start.clone();
        record.exec_pre_stop = fresh.exec_pre_stop.clone();
        record.exec_stop = fresh.exec_stop.clone();
        record.exec_post_stop = fresh.exec_post_stop.clone();
        record.requires = fresh.requires.clone();
        record.after = fresh.after.clone();
        record.before = fresh.before.clone();
        record.wanted_by = fresh.wanted_by.clone();
        Ok(())
    }

    /// Sets the tombstone on every record. Reload clears it for any name
    /// that reappears; survivors stay visible in `status` but are skipped by
    /// new supervision actions.
    pub fn mark_all_deleted(&self) -> Result<(), InitError> {
        let mut inner = self.inner.write()?;
        for record in inner.services.values_mut() {
            record.deleted = true;
        }
        Ok(())
    }

    /// Returns a value copy of the named record.
    pub fn get(&self, name: &str) -> Result<Option<ServiceRecord>, InitError> {
        let inner = self.inner.read()?;
        Ok(inner.services.get(name).cloned())
    }

    /// Returns the current state of the named record, if present.
    pub fn state_of(&self, name: &str) -> Result<Option<RunState>, InitError> {
        let inner = self.inner.read()?;
        Ok(inner.services.get(name).map(|r| r.state))
    }

    /// Returns a value-copied view of the table suitable to serialize to a
    /// control client. With a filter, the result holds at most that name.
    pub fn snapshot_for_status(
        &self,
        filter: Option<&str>,
    ) -> Result<HashMap<String, ServiceRecord>, InitError> {
        let inner = self.inner.read()?;
        match filter {
            Some(name) => Ok(inner
                .services
                .get(name)
                .map(|r| (r.name.clone(), r.clone()))
                .into_iter()
                .collect()),
            None => Ok(inner
                .services
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()),
        }
    }

    /// All record names, unsorted.
    pub fn names(&self) -> Result<Vec<String>, InitError> {
        let inner = self.inner.read()?;
        Ok(inner.services.keys().cloned().collect())
    }

    /// Number of records, tombstoned ones included.
    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.services.len()).unwrap_or(0)
    }

    /// Whether the table holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies a closure to the named record under the write lock. The
    /// closure must not block; callers do I/O outside and re-acquire.
    pub fn with_record_mut<F, T>(
        &self,
        name: &str,
        f: F,
    ) -> Result<T, InitError>
    where
        F: FnOnce(&mut ServiceRecord) -> T,
    {
        let mut inner = self.inner.write()?;
        let record = inner
            .services
            .get_mut(name)
            .ok_or_else(|| InitError::UnknownService(name.to_string()))?;
        Ok(f(record))
    }

    /// Flips the named record to `state`, recording `action` and clearing or
    /// setting the error message.
    pub fn set_state(
        &self,
        name: &str,
        state: RunState,
        action: LastAction,
        message: Option<String>,
    ) -> Result<(), InitError> {
        self.with_record_mut(name, |record| {
            record.state = state;
            record.touch(action);
            if let Some(message) = message {
                record.last_message = message;
            }
        })
    }

    /// True when every name in `requires` has reached `Started`.
    pub fn requires_satisfied(&self, name: &str) -> Result<bool, InitError> {
        let inner = self.inner.read()?;
        let record = inner
            .services
            .get(name)
            .ok_or_else(|| InitError::UnknownService(name.to_string()))?;
        Ok(record.requires.iter().all(|dep| {
            inner
                .services
                .get(dep)
                .map(|d| d.state == RunState::Started)
                .unwrap_or(false)
        }))
    }

    /// Replaces the startup ordering structures. Called only during load and
    /// reload; effectively immutable in between.
    pub fn set_orders(
        &self,
        targets_order: Vec<String>,
        services_order: HashMap<String, Vec<String>>,
    ) -> Result<(), InitError> {
        let mut inner = self.inner.write()?;
        inner.targets_order = targets_order;
        inner.services_order = services_order;
        Ok(())
    }

    /// Value copies of `targets_order` and `services_order`.
    pub fn orders(
        &self,
    ) -> Result<(Vec<String>, HashMap<String, Vec<String>>), InitError> {
        let inner = self.inner.read()?;
        Ok((inner.targets_order.clone(), inner.services_order.clone()))
    }

    /// Claims the per-name in-flight flag, refusing concurrent control
    /// operations against the same service.
    pub fn claim(&self, name: &str) -> Result<InFlightGuard<'_>, InitError> {
        let mut inner = self.inner.write()?;
        if !inner.in_flight.insert(name.to_string()) {
            return Err(InitError::Busy(name.to_string()));
        }
        Ok(InFlightGuard {
            table: self,
            name: name.to_string(),
        })
    }

    /// Exports every record, sorted by name, for the re-exec snapshot.
    pub fn export(&self) -> Result<Vec<ServiceRecord>, InitError> {
        let inner = self.inner.read()?;
        let mut records: Vec<_> = inner.services.values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Replaces the table contents wholesale. Used when restoring the
    /// re-exec snapshot; the ordering structures are rebuilt by the
    /// subsequent configuration pass.
    pub fn restore(&self, records: Vec<ServiceRecord>) -> Result<(), InitError> {
        let mut inner = self.inner.write()?;
        inner.services =
            records.into_iter().map(|r| (r.name.clone(), r)).collect();
        inner.targets_order.clear();
        inner.services_order.clear();
        Ok(())
    }
}
