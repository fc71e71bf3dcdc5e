//! Constants and fixed paths for the lutrainit daemon.
//!
//! This module centralizes the magic values used throughout the daemon so the
//! timing bounds and filesystem contract live in one place.

use std::time::Duration;

// ============================================================================
// Filesystem Contract
// ============================================================================

/// Directory holding `lutra.conf` and the `lutra.d/` unit directory.
pub const CONFIG_BASE_DIR: &str = "/etc/lutrainit";

/// Subdirectory of the config base where unit files live.
pub const UNIT_SUBDIR: &str = "lutra.d";

/// The control socket the daemon binds and the CLI connects to.
pub const CONTROL_SOCKET_PATH: &str = "/run/ottersock";

/// Mode applied to the control socket after bind. World-writable so any uid
/// can query status; destructive commands are gated on uid 0 in the CLI.
pub const CONTROL_SOCKET_MODE: u32 = 0o757;

/// Serialized service table written before re-exec.
pub const REEXEC_SERVICES_PATH: &str = "/run/lutrainit.reexec.ls.bin";

/// Serialized getty list written before re-exec.
pub const REEXEC_GETTYS_PATH: &str = "/run/lutrainit.reexec.gl.bin";

/// Environment variable the re-exec controller sets so the next image knows
/// it is resuming rather than cold-booting.
pub const REEXEC_ENV_VAR: &str = "LUTRAINIT_REEXECING";

/// Default log file when `[logging] filename` is absent.
pub const DEFAULT_LOG_FILE: &str = "/var/log/lutrainit.log";

/// PATH forced into the environment when it is empty at startup, which is
/// the case when booting from an initramfs.
pub const FALLBACK_PATH: &str = "/usr/local/sbin:/sbin:/bin:/usr/sbin:/usr/bin";

// ============================================================================
// Shell Execution
// ============================================================================

/// Shell used to run service command strings.
pub const SHELL: &str = "sh";

/// Shell flag for executing a command string.
pub const SHELL_COMMAND_FLAG: &str = "-c";

// ============================================================================
// Supervisor Timing
// ============================================================================

/// Maximum number of polls while waiting for a service's `Requires` to reach
/// `Started` during boot. The dependency sorter has already rejected cycles,
/// so this bound only guards against pathological external waits.
pub const DEPENDENCY_POLL_ATTEMPTS: usize = 60;

/// Interval between dependency polls.
pub const DEPENDENCY_POLL_INTERVAL: Duration = Duration::from_secs(2);

// ============================================================================
// Shutdown Timing
// ============================================================================

/// Number of death-wait iterations after SIGTERM (and again after SIGKILL).
pub const KILL_WAIT_ATTEMPTS: usize = 30;

/// Interval between death-wait checks.
pub const KILL_WAIT_INTERVAL: Duration = Duration::from_secs(2);

// ============================================================================
// Getty Pool
// ============================================================================

/// Virtual terminals managed by the getty pool. tty7 is excluded because it
/// is conventionally reserved for an X display.
pub const TTYS: [&str; 11] = [
    "tty1", "tty2", "tty3", "tty4", "tty5", "tty6", "tty8", "tty9", "tty10",
    "tty11", "tty12",
];

/// Poll interval for inherited (unmanaged) getty liveness after a re-exec.
pub const GETTY_WAIT_POLL_INTERVAL: Duration = Duration::from_secs(2);

// ============================================================================
// Filesystem Type Lists
// ============================================================================

/// Network filesystem types never mounted during boot.
pub const NET_FS: [&str; 12] = [
    "nfs", "nfs4", "smbfs", "cifs", "codafs", "ncpfs", "shfs", "fuse",
    "fuseblk", "glusterfs", "davfs", "fuse.glusterfs",
];

/// Virtual filesystem types never unmounted during shutdown.
pub const VIRT_FS: [&str; 5] = ["proc", "sysfs", "tmpfs", "devtmpfs", "devpts"];

// ============================================================================
// Build Metadata
// ============================================================================

/// Daemon version reported by the `version` RPC.
pub const LUTRA_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build timestamp, injected at build time when available.
pub const LUTRA_BUILD_TIME: &str = match option_env!("LUTRA_BUILD_TIME") {
    Some(v) => v,
    None => "unknown",
};

/// Git commit the build is based on, injected at build time when available.
pub const LUTRA_BUILD_COMMIT: &str = match option_env!("LUTRA_BUILD_COMMIT") {
    Some(v) => v,
    None => "unknown",
};
