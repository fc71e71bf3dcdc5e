//! Control server.
//!
//! Accepts request/response connections from the companion CLI on a
//! filesystem-bound stream socket and dispatches to the supervisor. Each
//! connection is served on its own thread; handlers take the service-table
//! lock only for short critical sections and never across a child wait.
//! `shutdown`, `reboot` and `reexec` reply before the destructive step: the
//! response is written and flushed, then the event is handed to the main
//! thread over a channel.

use std::{
    collections::HashMap,
    fs,
    os::unix::{fs::PermissionsExt, net::{UnixListener, UnixStream}},
    path::{Path, PathBuf},
    sync::mpsc::Sender,
    thread,
};

use tracing::{debug, error, info, warn};

use crate::{
    config::{self, MainConfig},
    constants::{
        CONTROL_SOCKET_MODE, LUTRA_BUILD_COMMIT, LUTRA_BUILD_TIME,
        LUTRA_VERSION,
    },
    error::InitError,
    ipc::{
        self, ActionReply, ControlRequest, ControlResponse, ReloadReply,
        ServiceView, VersionInfo,
    },
    logging, stats,
    supervisor::Supervisor,
};

/// Instruction handed from a control handler to the main thread after the
/// reply has reached the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    /// Terminate userspace and power off or reboot.
    Shutdown {
        /// Reboot instead of powering off.
        reboot: bool,
    },
    /// Re-exec the init image, preserving children.
    Reexec,
}

/// The control server. Binds the socket on construction; `serve` runs the
/// accept loop until the process ends.
pub struct ControlServer {
    listener: UnixListener,
    supervisor: Supervisor,
    config_base: PathBuf,
    events: Sender<PowerEvent>,
}

impl ControlServer {
    /// Removes any stale socket, binds a fresh one and forces its
    /// permissive mode so unprivileged clients can query status.
    pub fn bind(
        socket_path: &Path,
        supervisor: Supervisor,
        config_base: PathBuf,
        events: Sender<PowerEvent>,
    ) -> Result<Self, InitError> {
        if socket_path.exists() {
            fs::remove_file(socket_path)?;
        }
        let listener = UnixListener::bind(socket_path)?;
        fs::set_permissions(
            socket_path,
            fs::Permissions::from_mode(CONTROL_SOCKET_MODE),
        )?;
        info!("control server listening on {}", socket_path.display());

        Ok(Self {
            listener,
            supervisor,
            config_base,
            events,
        })
    }

    /// Accept loop. Each connection gets a handler thread; a failed accept
    /// is logged and the loop keeps serving.
    pub fn serve(&self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    let supervisor = self.supervisor.clone();
                    let config_base = self.config_base.clone();
                    let events = self.events.clone();
                    thread::spawn(move || {
                        handle_connection(
                            stream,
                            supervisor,
                            config_base,
                            events,
                        );
                    });
                }
                Err(err)
                    if err.kind() == std::io::ErrorKind::Interrupted =>
                {
                    continue;
                }
                Err(err) => {
                    error!("control socket accept failed: {err}");
                    return;
                }
            }
        }
    }
}

fn handle_connection(
    mut stream: UnixStream,
    supervisor: Supervisor,
    config_base: PathBuf,
    events: Sender<PowerEvent>,
) {
    let request = match ipc::read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!("invalid control request: {err}");
            let _ = ipc::write_response(
                &mut stream,
                &ControlResponse::Error(err.to_string()),
            );
            return;
        }
    };
    debug!("control request: {request:?}");

    let deferred = deferred_event(&request);
    let response = dispatch(request, &supervisor, &config_base);
    if let Err(err) = ipc::write_response(&mut stream, &response) {
        error!("failed to write control response: {err}");
        return;
    }

    // The reply has been flushed; now the destructive part may proceed.
    if let Some(event) = deferred {
        info!("scheduling {event:?}");
        if events.send(event).is_err() {
            error!("power event channel is closed; {event:?} dropped");
        }
    }
}

fn deferred_event(request: &ControlRequest) -> Option<PowerEvent> {
    match request {
        ControlRequest::Shutdown { reboot } => {
            Some(PowerEvent::Shutdown { reboot: *reboot })
        }
        ControlRequest::Reexec => Some(PowerEvent::Reexec),
        _ => None,
    }
}

fn dispatch(
    request: ControlRequest,
    supervisor: &Supervisor,
    config_base: &Path,
) -> ControlResponse {
    match request {
        ControlRequest::Version => ControlResponse::Version(VersionInfo {
            version: LUTRA_VERSION.to_string(),
            build_time: LUTRA_BUILD_TIME.to_string(),
            build_commit: LUTRA_BUILD_COMMIT.to_string(),
            protocol: ipc::PROTOCOL_VERSION,
        }),
        ControlRequest::Stats => ControlResponse::Stats(stats::collect()),
        ControlRequest::Status { name, all } => {
            status_response(supervisor, name.as_deref(), all)
        }
        ControlRequest::Start { name } => {
            let reply = match supervisor.start_service(&name) {
                Ok(()) => ActionReply {
                    name,
                    action: "start".to_string(),
                    err: false,
                    err_str: String::new(),
                },
                Err(err) => ActionReply {
                    name,
                    action: "start".to_string(),
                    err: true,
                    err_str: err.to_string(),
                },
            };
            ControlResponse::Action(reply)
        }
        ControlRequest::Stop { name } => {
            let reply = match supervisor.stop_service(&name) {
                Ok(()) => ActionReply {
                    name,
                    action: "stop".to_string(),
                    err: false,
                    err_str: String::new(),
                },
                Err(err) => ActionReply {
                    name,
                    action: "stop".to_string(),
                    err: true,
                    err_str: err.to_string(),
                },
            };
            ControlResponse::Action(reply)
        }
        ControlRequest::Reload => {
            ControlResponse::Reload(reload(supervisor, config_base))
        }
        // Acknowledged here; the destructive part runs on the main thread
        // once this reply has reached the peer.
        ControlRequest::Reexec | ControlRequest::Shutdown { .. } => {
            ControlResponse::Ok
        }
    }
}

fn status_response(
    supervisor: &Supervisor,
    name: Option<&str>,
    all: bool,
) -> ControlResponse {
    let filter = if all { None } else { name };
    if !all && name.is_none() {
        return ControlResponse::Status(HashMap::new());
    }

    match supervisor.table().snapshot_for_status(filter) {
        Ok(records) => ControlResponse::Status(
            records
                .iter()
                .map(|(name, record)| {
                    (name.clone(), ServiceView::from(record))
                })
                .collect(),
        ),
        Err(err) => ControlResponse::Error(err.to_string()),
    }
}

/// Atomic configuration reload: main config first, then the unit set. A
/// rejected unit load leaves the previous table in force and the rejection
/// is reported to the client.
fn reload(supervisor: &Supervisor, config_base: &Path) -> ReloadReply {
    info!("reloading configuration from {}", config_base.display());

    let main_config = match MainConfig::load(config_base) {
        Ok(config) => config,
        Err(err) => {
            error!("reload rejected: {err}");
            return ReloadReply {
                err: true,
                err_str: err.to_string(),
            };
        }
    };

    if let Err(err) = logging::refresh_file(&main_config.log.filename) {
        warn!("could not refresh the log file sink: {err}");
    }

    match config::load_services(supervisor.table(), config_base, true) {
        Ok(summary) => {
            info!(
                "configuration reloaded: {} unit(s), {} tombstoned",
                summary.loaded, summary.disappeared
            );
            ReloadReply {
                err: false,
                err_str: String::new(),
            }
        }
        Err(err) => {
            error!("reload rejected: {err}");
            ReloadReply {
                err: true,
                err_str: err.to_string(),
            }
        }
    }
}
