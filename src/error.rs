//! Error handling for lutrainit.
use thiserror::Error;

/// Defines all possible errors that can occur in the init daemon.
#[derive(Debug, Error)]
pub enum InitError {
    /// A unit or main configuration file could not be parsed.
    #[error("failed to parse '{file}': {detail}")]
    Parse {
        /// File the error originated from.
        file: String,
        /// What went wrong.
        detail: String,
    },

    /// A unit references a name absent from the service table.
    #[error("service '{service}' has inexistant {what}: {missing}")]
    Validation {
        /// Which field held the dangling reference (WantedBy, Requires, ...).
        what: &'static str,
        /// The service carrying the reference.
        service: String,
        /// The name that did not resolve.
        missing: String,
    },

    /// The dependency graph is not acyclic.
    #[error("dependency cycle detected: {cycle}")]
    Cycle {
        /// Names of the services left on the cycle.
        cycle: String,
    },

    /// Explicit start refused because the service is already running.
    #[error("service '{}' is already running{}", .service, fmt_pid(.pid))]
    AlreadyRunning {
        /// The service that was asked to start.
        service: String,
        /// PID of the live process, when known.
        pid: Option<u32>,
    },

    /// Stop requested for a definition that has no way to terminate.
    #[error("service '{service}' has no stop command")]
    NoStopCommand {
        /// The service that was asked to stop.
        service: String,
    },

    /// A launch step failed.
    #[error("failed to start service '{service}': {detail}")]
    StartFailure {
        /// The service whose launch failed.
        service: String,
        /// Underlying failure text.
        detail: String,
    },

    /// A stop step failed.
    #[error("failed to stop service '{service}': {detail}")]
    StopFailure {
        /// The service whose stop failed.
        service: String,
        /// Underlying failure text.
        detail: String,
    },

    /// The named service is not present in the table.
    #[error("service '{0}' is not loaded")]
    UnknownService(String),

    /// The named service is tombstoned; its unit file disappeared.
    #[error("service '{0}' has been deleted from configuration")]
    Deleted(String),

    /// Another control request is already operating on this service.
    #[error("service '{0}' has an operation in flight")]
    Busy(String),

    /// I/O error in control, serialization or launch paths.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Raw OS error from a wait or signal call.
    #[error(transparent)]
    Errno(#[from] nix::errno::Errno),

    /// A reap race beat us to a wait. Benign; callers treat this as a
    /// successful terminal transition.
    #[error("child already reaped")]
    ChildGone,

    /// Error for poisoned lock.
    #[error("lock is poisoned: {0}")]
    LockPoisoned(String),

    /// Error persisting or restoring the re-exec snapshot.
    #[error("re-exec snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

fn fmt_pid(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!(" (pid {pid})"),
        None => String::new(),
    }
}

/// Implement the `From` trait to convert a `std::sync::PoisonError` into an
/// `InitError`.
impl<T> From<std::sync::PoisonError<T>> for InitError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        InitError::LockPoisoned(err.to_string())
    }
}

/// Error type for re-exec snapshot operations.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Error reading or writing a snapshot file.
    #[error("failed to read snapshot file: {0}")]
    Io(#[from] std::io::Error),

    /// Error encoding or decoding snapshot contents.
    #[error("failed to decode snapshot: {0}")]
    Codec(#[from] serde_json::Error),

    /// The snapshot was written by an incompatible image.
    #[error("snapshot version {found} is not supported (expected {expected})")]
    Version {
        /// Version tag found in the file.
        found: u32,
        /// Version this image writes and understands.
        expected: u32,
    },
}
