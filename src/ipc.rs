//! Control-socket wire protocol shared by the daemon and the CLI.
//!
//! Requests and responses are newline-delimited JSON over a Unix stream
//! socket: self-describing through the enum tags, with the protocol version
//! surfaced in [`VersionInfo`] so peers can detect a mismatched pair.

use std::{
    collections::HashMap,
    io::{self, BufRead, BufReader, Write},
    os::unix::net::UnixStream,
    path::Path,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::service::ServiceRecord;

/// Version of the request/response scheme spoken on the socket.
pub const PROTOCOL_VERSION: u32 = 1;

/// Message sent from the CLI to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlRequest {
    /// Daemon build identification.
    Version,
    /// Runtime counters of the daemon process.
    Stats,
    /// Service status map: one name, or every record when `all` is set.
    Status {
        /// Service to look up. Ignored when `all` is set.
        name: Option<String>,
        /// Return the whole table.
        all: bool,
    },
    /// Start the named service.
    Start {
        /// Service to start.
        name: String,
    },
    /// Stop the named service.
    Stop {
        /// Service to stop.
        name: String,
    },
    /// Re-read the configuration, atomically.
    Reload,
    /// Re-exec the daemon image, preserving running children.
    Reexec,
    /// Terminate all processes and halt or reboot the machine.
    Shutdown {
        /// Reboot instead of powering off.
        reboot: bool,
    },
}

/// Response sent by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlResponse {
    /// Command acknowledged; nothing further to report.
    Ok,
    /// Build identification payload.
    Version(VersionInfo),
    /// Runtime counter payload.
    Stats(SysStats),
    /// Status payload: name to view. Empty when a single requested name is
    /// unknown.
    Status(HashMap<String, ServiceView>),
    /// Outcome of a start or stop.
    Action(ActionReply),
    /// Outcome of a reload.
    Reload(ReloadReply),
    /// The request itself could not be served.
    Error(String),
}

/// Daemon build identification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Daemon version string.
    pub version: String,
    /// Build timestamp, "unknown" when not stamped in.
    pub build_time: String,
    /// Git commit, "unknown" when not stamped in.
    pub build_commit: String,
    /// Protocol version this daemon speaks.
    pub protocol: u32,
}

/// Runtime counters, preformatted for display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysStats {
    /// Time since the daemon started.
    pub uptime: String,
    /// Number of daemon threads.
    pub threads: String,
    /// Resident set size of the daemon.
    pub mem_resident: String,
    /// Virtual memory of the daemon.
    pub mem_virtual: String,
    /// Total memory of the machine.
    pub sys_mem_total: String,
    /// Available memory of the machine.
    pub sys_mem_available: String,
    /// One, five and fifteen minute load averages.
    pub load_average: String,
}

/// Value-copied service state handed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceView {
    /// Service name.
    pub name: String,
    /// Kind label: simple, forking, oneshot or virtual.
    pub kind: String,
    /// Description from the unit file.
    pub description: String,
    /// Current state, human-readable.
    pub state: String,
    /// Most recent action, human-readable.
    pub last_action: String,
    /// Wall-clock seconds of the most recent action.
    pub last_action_at: i64,
    /// Last error text, if any.
    pub last_message: String,
    /// Tracked PID, 0 when unknown.
    pub last_known_pid: u32,
    /// Whether the unit file disappeared across a reload.
    pub deleted: bool,
}

impl From<&ServiceRecord> for ServiceView {
    fn from(record: &ServiceRecord) -> Self {
        Self {
            name: record.name.clone(),
            kind: record.kind.label().to_string(),
            description: record.description.clone(),
            state: record.state.to_string(),
            last_action: record.last_action.to_string(),
            last_action_at: record.last_action_at,
            last_message: record.last_message.clone(),
            last_known_pid: record.last_known_pid,
            deleted: record.deleted,
        }
    }
}

/// Outcome of a start or stop request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReply {
    /// Service the action targeted.
    pub name: String,
    /// The action: "start" or "stop".
    pub action: String,
    /// Whether the action failed.
    pub err: bool,
    /// Failure text when `err` is set.
    pub err_str: String,
}

/// Outcome of a reload request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadReply {
    /// Whether the reload was rejected.
    pub err: bool,
    /// Rejection text when `err` is set.
    pub err_str: String,
}

/// Errors raised by the control channel helpers.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Control socket I/O error.
    #[error("control socket I/O failed: {0}")]
    Io(#[from] io::Error),
    /// Error serializing or deserializing control messages.
    #[error("failed to serialise control message: {0}")]
    Serde(#[from] serde_json::Error),
    /// The daemon reported a protocol-level error.
    #[error("init daemon reported error: {0}")]
    Server(String),
    /// Control socket not present or daemon not running.
    #[error("control socket not available")]
    NotAvailable,
}

/// Sends one request over the socket at `path` and waits for the response.
pub fn send_request(
    path: &Path,
    request: &ControlRequest,
) -> Result<ControlResponse, ControlError> {
    if !path.exists() {
        return Err(ControlError::NotAvailable);
    }

    let mut stream = UnixStream::connect(path)?;
    let payload = serde_json::to_vec(request)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim().is_empty() {
        return Err(ControlError::NotAvailable);
    }

    let response: ControlResponse = serde_json::from_str(line.trim())?;
    if let ControlResponse::Error(message) = &response {
        return Err(ControlError::Server(message.clone()));
    }
    Ok(response)
}

/// Reads one request from a connected client. Used by the accept loop.
pub fn read_request(
    stream: &mut UnixStream,
) -> Result<ControlRequest, ControlError> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    if line.trim().is_empty() {
        return Err(ControlError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "empty control request",
        )));
    }
    Ok(serde_json::from_str(line.trim())?)
}

/// Writes one response back to the connected client.
pub fn write_response(
    stream: &mut UnixStream,
    response: &ControlResponse,
) -> Result<(), ControlError> {
    let payload = serde_json::to_vec(response)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
