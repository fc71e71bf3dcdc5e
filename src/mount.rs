//! Filesystem mounting shell-outs.
//!
//! Mount mechanics are delegated to the system's `mount`/`umount`/`swapon`
//! binaries at fixed boot and shutdown phases. Failures are logged, never
//! fatal: PID 1 keeps going with whatever did mount.

use std::{fs, path::Path, process::Command};

use tracing::error;

/// Runs a command with the console as stdio, blocking until it finishes.
fn run(cmd: &str, args: &[&str]) -> std::io::Result<()> {
    let status = Command::new(cmd).args(args).status()?;
    if !status.success() {
        return Err(std::io::Error::other(format!(
            "{cmd} exited with {status}"
        )));
    }
    Ok(())
}

/// Remounts a filesystem. The boot loader mounts `/` read-only; this turns
/// it read-write, assuming it is rw in fstab.
pub fn remount(dir: &str) {
    if let Err(err) = run("mount", &["-o", "remount", dir]) {
        error!("remount of {dir} failed: {err}");
    }
}

/// Mounts a filesystem, creating the mount point if it does not exist.
pub fn mount(fs_type: &str, device: &str, dir: &str, opts: &str) {
    if !Path::new(dir).exists()
        && let Err(err) = fs::create_dir_all(dir)
    {
        error!("could not create mount point {dir}: {err}");
        return;
    }
    if let Err(err) = run("mount", &["-t", fs_type, device, dir, "-o", opts]) {
        error!("mount of {dir} failed: {err}");
    }
}

/// Activates all swap partitions; `mount -a` does not, since swap is not
/// mounted anywhere.
pub fn swapon_all() {
    if let Err(err) = run("swapon", &["-a"]) {
        error!("swapon failed: {err}");
    }
}

/// Builds the `-t nofs1,nofs2,...` exclusion argument.
fn no_types(except: &[&str]) -> String {
    except
        .iter()
        .map(|fs_type| format!("no{fs_type}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Mounts everything in fstab except the given filesystem types and
/// anything marked `_netdev`.
pub fn mount_all_except(except: &[&str]) {
    let types = no_types(except);
    if let Err(err) =
        run("mount", &["-a", "-t", &types, "-O", "no_netdev"])
    {
        error!("mount -a failed: {err}");
    }
}

/// Unmounts everything except the given filesystem types and anything
/// marked `_netdev`. Run at shutdown once processes are dead.
pub fn unmount_all_except(except: &[&str]) {
    let types = no_types(except);
    if let Err(err) =
        run("umount", &["-a", "-t", &types, "-O", "no_netdev"])
    {
        error!("umount -a failed: {err}");
    }
}
