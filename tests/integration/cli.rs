#[path = "common/mod.rs"]
mod common;

use std::{os::unix::net::UnixListener, thread};

use assert_cmd::Command;
use common::{ConfigTree, oneshot_unit, target_unit};
use lutrainit::ipc::{
    self, ControlResponse, PROTOCOL_VERSION, VersionInfo,
};
use nix::unistd::Uid;
use predicates::prelude::*;
use tempfile::tempdir;

#[test]
fn lutractl_reports_a_missing_daemon() {
    let dir = tempdir().unwrap();
    let socket = dir.path().join("nope.sock");

    Command::cargo_bin("lutractl")
        .unwrap()
        .arg("--socket")
        .arg(&socket)
        .arg("version")
        .assert()
        .failure()
        .stderr(predicate::str::contains("control socket not available"));
}

#[test]
fn lutractl_destructive_commands_require_root() {
    if Uid::effective().is_root() {
        // Nothing to verify when the test run itself is privileged.
        return;
    }

    let dir = tempdir().unwrap();
    let socket = dir.path().join("nope.sock");

    for subcommand in ["reboot", "shutdown", "halt", "reexec", "reload"] {
        Command::cargo_bin("lutractl")
            .unwrap()
            .arg("--socket")
            .arg(&socket)
            .arg(subcommand)
            .assert()
            .failure()
            .stderr(predicate::str::contains("only root can do that"));
    }
}

#[test]
fn lutractl_version_talks_to_a_daemon() {
    let dir = tempdir().unwrap();
    let socket = dir.path().join("d.sock");
    let listener = UnixListener::bind(&socket).unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _request = ipc::read_request(&mut stream).unwrap();
        ipc::write_response(
            &mut stream,
            &ControlResponse::Version(VersionInfo {
                version: "9.9.9".to_string(),
                build_time: "today".to_string(),
                build_commit: "cafebabe".to_string(),
                protocol: PROTOCOL_VERSION,
            }),
        )
        .unwrap();
    });

    Command::cargo_bin("lutractl")
        .unwrap()
        .arg("--socket")
        .arg(&socket)
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("server version: 9.9.9"))
        .stdout(predicate::str::contains("cafebabe"));

    server.join().unwrap();
}

#[test]
fn lutrainit_refuses_sysinit_when_not_pid_one() {
    Command::cargo_bin("lutrainit")
        .unwrap()
        .arg("sysinit")
        .assert()
        .failure();
}

#[test]
fn lutrainit_services_list_prints_the_units() {
    let dir = tempdir().unwrap();
    let tree = ConfigTree::create(dir.path());
    tree.write_unit("multi-user.target", &target_unit(""));
    tree.write_unit(
        "net.service",
        &oneshot_unit("multi-user.target", "", "true"),
    );

    Command::cargo_bin("lutrainit")
        .unwrap()
        .arg("--confdir")
        .arg(&tree.base)
        .arg("services-list")
        .assert()
        .success()
        .stdout(predicate::str::contains("net.service"))
        .stdout(predicate::str::contains("oneshot"))
        .stdout(predicate::str::contains("multi-user.target"));
}

#[test]
fn lutrainit_services_tree_prints_the_boot_order() {
    let dir = tempdir().unwrap();
    let tree = ConfigTree::create(dir.path());
    tree.write_unit("basic.target", &target_unit(""));
    tree.write_unit(
        "multi-user.target",
        "[order]\nRequires = basic.target\n\n[service]\n",
    );
    tree.write_unit(
        "net.service",
        &oneshot_unit("basic.target", "", "true"),
    );

    Command::cargo_bin("lutrainit")
        .unwrap()
        .arg("--confdir")
        .arg(&tree.base)
        .arg("services-tree")
        .assert()
        .success()
        .stdout(predicate::str::contains("+ basic.target"))
        .stdout(predicate::str::contains("\\__ net.service"));
}
