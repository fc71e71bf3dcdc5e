//! Service supervisor.
//!
//! Drives every service through its state machine according to its kind, and
//! runs the boot-time startup protocol: services inside a target start in
//! parallel, targets are strict barriers. Lock discipline: snapshot the
//! record under the table lock, release it, do process I/O, re-acquire to
//! write the state transition. No child wait ever happens under the lock.

use std::{sync::Arc, thread};

use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tracing::{error, info, warn};

use crate::{
    constants::{DEPENDENCY_POLL_ATTEMPTS, DEPENDENCY_POLL_INTERVAL},
    error::InitError,
    launcher,
    service::{
        LastAction, RunState, ServiceKind, ServiceRecord, ServiceTable,
    },
};

/// Supervises the services held in one [`ServiceTable`].
#[derive(Clone)]
pub struct Supervisor {
    table: Arc<ServiceTable>,
}

impl Supervisor {
    /// Creates a supervisor over `table`.
    pub fn new(table: Arc<ServiceTable>) -> Self {
        Self { table }
    }

    /// The table this supervisor operates on.
    pub fn table(&self) -> &Arc<ServiceTable> {
        &self.table
    }

    // ------------------------------------------------------------------
    // Boot startup protocol
    // ------------------------------------------------------------------

    /// Starts all auto-start services in dependency order: one thread per
    /// service within a target, a hard barrier between targets. Individual
    /// failures are recorded in the table and logged; boot continues.
    pub fn start_boot_services(&self) {
        let (targets_order, services_order) = match self.table.orders() {
            Ok(orders) => orders,
            Err(err) => {
                error!("cannot read startup orders: {err}");
                return;
            }
        };

        for target in &targets_order {
            let members = services_order
                .get(target)
                .map(Vec::as_slice)
                .unwrap_or_default();

            thread::scope(|scope| {
                for name in members {
                    scope.spawn(move || self.boot_one(name));
                }
            });

            // Barrier passed: the target itself is a virtual unit whose
            // state tracks its dependencies.
            match self.table.requires_satisfied(target) {
                Ok(true) => {
                    if let Err(err) = self.table.set_state(
                        target,
                        RunState::Started,
                        LastAction::Start,
                        None,
                    ) {
                        error!("cannot mark target '{target}' started: {err}");
                    }
                    info!("reached target {target}");
                }
                Ok(false) => {
                    warn!("target '{target}' has unsatisfied requirements");
                }
                Err(err) => error!("cannot inspect target '{target}': {err}"),
            }
        }
    }

    fn boot_one(&self, name: &str) {
        let record = match self.table.get(name) {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(err) => {
                error!("cannot read record for '{name}': {err}");
                return;
            }
        };
        if record.deleted
            || !record.auto_start
            || record.state != RunState::NotStarted
        {
            return;
        }

        if !self.wait_for_requires(name) {
            warn!(
                "abandoning start of '{name}': requirements still unsatisfied \
                 after {DEPENDENCY_POLL_ATTEMPTS} polls"
            );
            return;
        }

        if let Err(err) = self.launch(&record) {
            error!("{err}");
        }
    }

    /// Polls until every `Requires` of `name` reached `Started`, bounded at
    /// 60 attempts of 2 seconds. The cycle detector already ran during load,
    /// so the bound only guards against external waits that never finish.
    fn wait_for_requires(&self, name: &str) -> bool {
        for attempt in 0..DEPENDENCY_POLL_ATTEMPTS {
            match self.table.requires_satisfied(name) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(err) => {
                    error!("dependency check for '{name}' failed: {err}");
                    return false;
                }
            }
            if attempt + 1 < DEPENDENCY_POLL_ATTEMPTS {
                thread::sleep(DEPENDENCY_POLL_INTERVAL);
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Explicit start / stop
    // ------------------------------------------------------------------

    /// Starts a service on request from the control server. Refuses when a
    /// liveness probe says the service is already running.
    pub fn start_service(&self, name: &str) -> Result<(), InitError> {
        let record = self
            .table
            .get(name)?
            .ok_or_else(|| InitError::UnknownService(name.to_string()))?;
        if record.deleted {
            return Err(InitError::Deleted(name.to_string()));
        }
        let _guard = self.table.claim(name)?;

        match &record.kind {
            ServiceKind::Oneshot => {}
            ServiceKind::Forking { pid_file } => {
                let pid = pid_file
                    .as_deref()
                    .and_then(launcher::read_pid_file)
                    .or((record.last_known_pid > 0)
                        .then_some(record.last_known_pid));
                if let Some(pid) = pid
                    && launcher::process_alive(pid)
                {
                    return Err(InitError::AlreadyRunning {
                        service: name.to_string(),
                        pid: Some(pid),
                    });
                }
            }
            ServiceKind::Simple | ServiceKind::Virtual => {
                if record.state == RunState::Started {
                    return Err(InitError::AlreadyRunning {
                        service: name.to_string(),
                        pid: (record.last_known_pid > 0)
                            .then_some(record.last_known_pid),
                    });
                }
            }
        }

        self.launch(&record)
    }

    /// Stops a service on request from the control server.
    pub fn stop_service(&self, name: &str) -> Result<(), InitError> {
        let record = self
            .table
            .get(name)?
            .ok_or_else(|| InitError::UnknownService(name.to_string()))?;
        if record.deleted {
            return Err(InitError::Deleted(name.to_string()));
        }
        let _guard = self.table.claim(name)?;

        // Refuse before any step runs so a rejected stop leaves the record
        // untouched.
        if record.exec_stop.is_empty()
            && matches!(
                record.kind,
                ServiceKind::Forking { .. } | ServiceKind::Oneshot
            )
        {
            return Err(InitError::NoStopCommand {
                service: name.to_string(),
            });
        }

        if !record.exec_pre_stop.is_empty() {
            self.mark(name, LastAction::PreStop)?;
            self.run_step(name, &record.exec_pre_stop, StepKind::Stop)?;
        }

        self.mark(name, LastAction::Stop)?;
        if !record.exec_stop.is_empty() {
            self.run_step(name, &record.exec_stop, StepKind::Stop)?;
        } else if matches!(record.kind, ServiceKind::Simple)
            && record.last_known_pid > 0
        {
            // No stop command defined: terminate the tracked child directly.
            let pid = Pid::from_raw(record.last_known_pid as i32);
            match signal::kill(pid, Signal::SIGTERM) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(err) => {
                    let detail = format!(
                        "cannot signal pid {}: {err}",
                        record.last_known_pid
                    );
                    self.fail(name, StepKind::Stop, &detail)?;
                    return Err(InitError::StopFailure {
                        service: name.to_string(),
                        detail,
                    });
                }
            }
        }

        if !record.exec_post_stop.is_empty() {
            self.mark(name, LastAction::PostStop)?;
            self.run_step(name, &record.exec_post_stop, StepKind::Stop)?;
        }

        self.table.with_record_mut(name, |record| {
            record.state = RunState::Stopped;
            record.touch(LastAction::Stop);
            record.last_known_pid = 0;
        })?;
        info!("stopped service {name}");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Launch sequences
    // ------------------------------------------------------------------

    /// Runs the launch sequence for `record` according to its kind. The
    /// record is a snapshot; all writes go back through the table.
    pub(crate) fn launch(&self, record: &ServiceRecord) -> Result<(), InitError> {
        let name = record.name.as_str();
        self.table.set_state(
            name,
            RunState::Starting,
            LastAction::Start,
            None,
        )?;

        match &record.kind {
            ServiceKind::Oneshot => self.launch_blocking(record, false),
            ServiceKind::Forking { .. } => self.launch_blocking(record, true),
            ServiceKind::Simple => self.launch_simple(record),
            ServiceKind::Virtual => self.launch_virtual(record),
        }
    }

    /// Oneshot and forking services: the whole chain runs synchronously and
    /// success is the main command exiting zero. Forking commands are
    /// expected to self-daemonize; liveness is re-derived from the PID file
    /// afterwards.
    fn launch_blocking(
        &self,
        record: &ServiceRecord,
        new_group: bool,
    ) -> Result<(), InitError> {
        let name = record.name.as_str();

        if !record.exec_pre_start.is_empty() {
            self.mark(name, LastAction::PreStart)?;
            self.run_step(name, &record.exec_pre_start, StepKind::Start)?;
        }

        self.mark(name, LastAction::Start)?;
        let run = if new_group {
            launcher::run_sync_in_group(&record.exec_start)
        } else {
            launcher::run_sync(&record.exec_start)
        };
        if let Err(err) = run {
            let detail = err.to_string();
            self.fail(name, StepKind::Start, &detail)?;
            return Err(InitError::StartFailure {
                service: name.to_string(),
                detail,
            });
        }

        if let ServiceKind::Forking {
            pid_file: Some(pid_file),
        } = &record.kind
        {
            match launcher::read_pid_file(pid_file) {
                Some(pid) => {
                    self.table
                        .with_record_mut(name, |r| r.last_known_pid = pid)?;
                }
                None => warn!(
                    "service '{name}' started but PID file {} is unreadable",
                    pid_file.display()
                ),
            }
        }

        if !record.exec_post_start.is_empty() {
            self.mark(name, LastAction::PostStart)?;
            self.run_step(name, &record.exec_post_start, StepKind::Start)?;
        }

        self.table.set_state(
            name,
            RunState::Started,
            LastAction::Start,
            Some(String::new()),
        )?;
        info!("started service {name}");
        Ok(())
    }

    /// Simple services: the main command stays in the foreground. The PID is
    /// tracked, `ExecPostStart` runs once the child has been launched (not
    /// waited on), and a monitor thread records how the child eventually
    /// exits.
    fn launch_simple(&self, record: &ServiceRecord) -> Result<(), InitError> {
        let name = record.name.as_str();

        if !record.exec_pre_start.is_empty() {
            self.mark(name, LastAction::PreStart)?;
            self.run_step(name, &record.exec_pre_start, StepKind::Start)?;
        }

        self.mark(name, LastAction::Start)?;
        let child = match launcher::spawn_async(&record.exec_start) {
            Ok(child) => child,
            Err(err) => {
                let detail = err.to_string();
                self.fail(name, StepKind::Start, &detail)?;
                return Err(InitError::StartFailure {
                    service: name.to_string(),
                    detail,
                });
            }
        };

        let pid = child.id();
        self.table.with_record_mut(name, |record| {
            record.state = RunState::Started;
            record.last_known_pid = pid;
            record.last_message.clear();
            record.touch(LastAction::Start);
        })?;
        info!("started service {name} (pid {pid})");

        let table = Arc::clone(&self.table);
        let monitored = name.to_string();
        thread::spawn(move || monitor_simple_child(table, monitored, child));

        if !record.exec_post_start.is_empty() {
            self.mark(name, LastAction::PostStart)?;
            self.run_step(name, &record.exec_post_start, StepKind::Start)?;
        }

        Ok(())
    }

    /// Virtual services fork nothing; they are started exactly when their
    /// requirements are.
    fn launch_virtual(&self, record: &ServiceRecord) -> Result<(), InitError> {
        let name = record.name.as_str();
        if self.table.requires_satisfied(name)? {
            self.table.set_state(
                name,
                RunState::Started,
                LastAction::Start,
                Some(String::new()),
            )?;
            info!("started service {name}");
            return Ok(());
        }

        let detail = format!(
            "virtual service '{name}' has requirements that are not started"
        );
        self.fail(name, StepKind::Start, &detail)?;
        Err(InitError::StartFailure {
            service: name.to_string(),
            detail,
        })
    }

    // ------------------------------------------------------------------
    // Step helpers
    // ------------------------------------------------------------------

    fn mark(&self, name: &str, action: LastAction) -> Result<(), InitError> {
        self.table.with_record_mut(name, |record| record.touch(action))
    }

    /// Runs one synchronous `Exec*` step, recording failure in the record
    /// before surfacing it.
    fn run_step(
        &self,
        name: &str,
        cmd: &str,
        kind: StepKind,
    ) -> Result<(), InitError> {
        match launcher::run_sync(cmd) {
            Ok(()) => Ok(()),
            Err(err) => {
                let detail = err.to_string();
                self.fail(name, kind, &detail)?;
                Err(match kind {
                    StepKind::Start => InitError::StartFailure {
                        service: name.to_string(),
                        detail,
                    },
                    StepKind::Stop => InitError::StopFailure {
                        service: name.to_string(),
                        detail,
                    },
                })
            }
        }
    }

    fn fail(
        &self,
        name: &str,
        kind: StepKind,
        detail: &str,
    ) -> Result<(), InitError> {
        error!(
            "{} of service '{name}' failed: {detail}",
            match kind {
                StepKind::Start => "start",
                StepKind::Stop => "stop",
            }
        );
        self.table.with_record_mut(name, |record| {
            record.state = RunState::Errored;
            record.last_message = detail.to_string();
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum StepKind {
    Start,
    Stop,
}

/// Waits for a simple service's child and records the terminal transition.
/// Runs on its own thread, one per tracked child.
fn monitor_simple_child(
    table: Arc<ServiceTable>,
    name: String,
    mut child: std::process::Child,
) {
    match child.wait() {
        Ok(status) if status.success() => {
            info!("service {name} stopped");
            if let Err(err) = table.with_record_mut(&name, |record| {
                record.state = RunState::Stopped;
                record.last_known_pid = 0;
                record.touch(LastAction::Stop);
            }) {
                error!("cannot record exit of '{name}': {err}");
            }
        }
        Ok(status) => {
            let detail = format!("service exited with {status}");
            if let Err(err) = table.with_record_mut(&name, |record| {
                // A failed exit right after we asked the service to stop is
                // the stop taking effect, not a crash.
                let stop_requested = matches!(
                    record.last_action,
                    LastAction::PreStop
                        | LastAction::Stop
                        | LastAction::PostStop
                        | LastAction::Forcekill
                );
                record.last_known_pid = 0;
                if stop_requested {
                    record.state = RunState::Stopped;
                } else {
                    warn!("service {name} exited unexpectedly: {detail}");
                    record.state = RunState::Errored;
                    record.last_message = detail.clone();
                }
            }) {
                error!("cannot record exit of '{name}': {err}");
            }
        }
        // The reaper won the race for this PID; the child is gone, which is
        // all a stop needs to know.
        Err(err) if err.raw_os_error() == Some(libc::ECHILD) => {
            if let Err(err) = table.with_record_mut(&name, |record| {
                record.state = RunState::Stopped;
                record.last_known_pid = 0;
                record.touch(LastAction::Stop);
            }) {
                error!("cannot record exit of '{name}': {err}");
            }
        }
        Err(err) => {
            error!("wait for service '{name}' failed: {err}");
            if let Err(err) = table.with_record_mut(&name, |record| {
                record.state = RunState::Errored;
                record.last_known_pid = 0;
                record.last_message = err.to_string();
            }) {
                error!("cannot record exit of '{name}': {err}");
            }
        }
    }
}
