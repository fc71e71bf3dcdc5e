//! Re-exec controller.
//!
//! Replaces the running init image with the binary on disk while keeping
//! every supervised child alive: the service table and the getty list are
//! serialized to `/run`, an environment flag is set, and the process execs
//! itself. The next image detects the flag, restores both structures and
//! resumes supervision without starting anything. A snapshot that fails to
//! restore turns into a loud cold boot, never an aborted PID 1.

use std::{
    collections::BTreeMap,
    env, fs,
    os::unix::process::CommandExt,
    path::Path,
    process::Command,
};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    constants::{REEXEC_ENV_VAR, REEXEC_GETTYS_PATH, REEXEC_SERVICES_PATH},
    error::{InitError, SnapshotError},
    getty::{GettyPool, GettyRecord},
    service::{ServiceRecord, ServiceTable},
};

/// Version tag written into both snapshot documents. Bump when the record
/// layout changes incompatibly; a mismatch sends the new image to cold boot.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct ServicesSnapshot {
    version: u32,
    services: Vec<ServiceRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GettysSnapshot {
    version: u32,
    gettys: BTreeMap<usize, GettyRecord>,
}

/// Whether this image was started by the re-exec controller of the previous
/// one.
pub fn resuming() -> bool {
    env::var(REEXEC_ENV_VAR).map(|v| v == "true").unwrap_or(false)
}

/// Serializes the service table and getty list to the given paths.
pub fn write_snapshot(
    table: &ServiceTable,
    pool: &GettyPool,
    services_path: &Path,
    gettys_path: &Path,
) -> Result<(), InitError> {
    let services = ServicesSnapshot {
        version: SNAPSHOT_VERSION,
        services: table.export()?,
    };
    let gettys = GettysSnapshot {
        version: SNAPSHOT_VERSION,
        gettys: pool.export()?,
    };

    fs::write(
        services_path,
        serde_json::to_vec(&services).map_err(SnapshotError::from)?,
    )?;
    fs::write(
        gettys_path,
        serde_json::to_vec(&gettys).map_err(SnapshotError::from)?,
    )?;

    info!("service table and getty list serialized for re-exec");
    Ok(())
}

/// Restores both snapshot documents, deleting the files on success. Either
/// file missing, undecodable or version-mismatched fails the whole restore.
pub fn read_snapshot(
    services_path: &Path,
    gettys_path: &Path,
) -> Result<(Vec<ServiceRecord>, BTreeMap<usize, GettyRecord>), SnapshotError> {
    let services: ServicesSnapshot =
        serde_json::from_slice(&fs::read(services_path)?)?;
    if services.version != SNAPSHOT_VERSION {
        return Err(SnapshotError::Version {
            found: services.version,
            expected: SNAPSHOT_VERSION,
        });
    }

    let gettys: GettysSnapshot =
        serde_json::from_slice(&fs::read(gettys_path)?)?;
    if gettys.version != SNAPSHOT_VERSION {
        return Err(SnapshotError::Version {
            found: gettys.version,
            expected: SNAPSHOT_VERSION,
        });
    }

    fs::remove_file(services_path)?;
    fs::remove_file(gettys_path)?;

    info!("service table and getty list restored from re-exec snapshot");
    Ok((services.services, gettys.gettys))
}

/// Serializes state and replaces the process image with argv[0]. Callers
/// must already have detached the file log; the control socket closes on
/// exec. Returns only on failure, with the running instance left intact.
pub fn perform(table: &ServiceTable, pool: &GettyPool) -> InitError {
    if let Err(err) = write_snapshot(
        table,
        pool,
        Path::new(REEXEC_SERVICES_PATH),
        Path::new(REEXEC_GETTYS_PATH),
    ) {
        return err;
    }

    let mut args = env::args();
    let Some(argv0) = args.next() else {
        return InitError::StartFailure {
            service: "init".to_string(),
            detail: "argv[0] is missing".to_string(),
        };
    };

    info!("re-exec-ing {argv0}...");
    let mut command = Command::new(argv0);
    command.args(args).env(REEXEC_ENV_VAR, "true");

    // exec only returns on failure.
    let err = command.exec();
    InitError::Io(err)
}
