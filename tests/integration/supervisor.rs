#[path = "common/mod.rs"]
mod common;

use std::sync::Arc;

use common::{ConfigTree, oneshot_unit, simple_unit, target_unit, wait_for_state};
use lutrainit::{
    config::load_services,
    error::InitError,
    launcher,
    service::{RunState, ServiceTable},
    supervisor::Supervisor,
};
use tempfile::tempdir;

fn boot(tree: &ConfigTree) -> Supervisor {
    let table = Arc::new(ServiceTable::new());
    load_services(&table, &tree.base, false).unwrap();
    let supervisor = Supervisor::new(table);
    supervisor.start_boot_services();
    supervisor
}

#[test]
fn happy_boot_with_two_targets() {
    let dir = tempdir().unwrap();
    let tree = ConfigTree::create(dir.path());
    tree.write_unit("basic.target", &target_unit(""));
    tree.write_unit(
        "multi-user.target",
        "[order]\nRequires = basic.target\n\n[service]\n",
    );
    tree.write_unit("net.service", &oneshot_unit("basic.target", "", "true"));
    tree.write_unit(
        "app.service",
        &simple_unit("multi-user.target", "net.service", "sleep 3600"),
    );

    let supervisor = boot(&tree);
    let table = supervisor.table();

    for name in [
        "basic.target",
        "multi-user.target",
        "net.service",
        "app.service",
    ] {
        assert_eq!(
            table.state_of(name).unwrap().unwrap(),
            RunState::Started,
            "{name} should be started after boot"
        );
    }

    let app = table.get("app.service").unwrap().unwrap();
    assert!(app.last_known_pid > 0);
    assert!(launcher::process_alive(app.last_known_pid));

    supervisor.stop_service("app.service").unwrap();
    let state = wait_for_state(table, "app.service", RunState::Stopped);
    assert_eq!(state, RunState::Stopped);
}

#[test]
fn boot_respects_in_target_ordering() {
    let dir = tempdir().unwrap();
    let tree = ConfigTree::create(dir.path());
    let first_marker = dir.path().join("first");
    let second_marker = dir.path().join("second");

    tree.write_unit("multi-user.target", &target_unit(""));
    tree.write_unit(
        "first.service",
        &oneshot_unit(
            "multi-user.target",
            "",
            &format!("touch {}", first_marker.display()),
        ),
    );
    // Only runs successfully if first.service already created its marker.
    tree.write_unit(
        "second.service",
        &oneshot_unit(
            "multi-user.target",
            "first.service",
            &format!(
                "test -f {} && touch {}",
                first_marker.display(),
                second_marker.display()
            ),
        ),
    );

    let supervisor = boot(&tree);
    let table = supervisor.table();

    assert_eq!(
        table.state_of("second.service").unwrap().unwrap(),
        RunState::Started
    );
    assert!(second_marker.exists());
}

#[test]
fn boot_skips_units_without_autostart() {
    let dir = tempdir().unwrap();
    let tree = ConfigTree::create(dir.path());
    tree.write_unit("multi-user.target", &target_unit(""));
    tree.write_unit(
        "manual.service",
        "[order]\nWantedBy = multi-user.target\n\n\
         [service]\nType = oneshot\nExecStart = true\n",
    );

    let supervisor = boot(&tree);
    assert_eq!(
        supervisor
            .table()
            .state_of("manual.service")
            .unwrap()
            .unwrap(),
        RunState::NotStarted
    );

    // But an explicit start is honored.
    supervisor.start_service("manual.service").unwrap();
    assert_eq!(
        supervisor
            .table()
            .state_of("manual.service")
            .unwrap()
            .unwrap(),
        RunState::Started
    );
}

#[test]
fn failing_simple_service_ends_errored() {
    let dir = tempdir().unwrap();
    let tree = ConfigTree::create(dir.path());
    tree.write_unit("multi-user.target", &target_unit(""));
    tree.write_unit(
        "foo.service",
        &simple_unit("multi-user.target", "", "false"),
    );

    let supervisor = boot(&tree);
    let table = supervisor.table();

    let state = wait_for_state(table, "foo.service", RunState::Errored);
    assert_eq!(state, RunState::Errored);
    let foo = table.get("foo.service").unwrap().unwrap();
    assert!(!foo.last_message.is_empty());
    assert_eq!(foo.last_known_pid, 0);
}

#[test]
fn stop_of_forking_without_shutdown_command_is_refused() {
    let dir = tempdir().unwrap();
    let tree = ConfigTree::create(dir.path());
    let pid_file = dir.path().join("fork.pid");
    tree.write_unit("multi-user.target", &target_unit(""));
    tree.write_unit(
        "fork.service",
        &format!(
            "[order]\nWantedBy = multi-user.target\n\n\
             [service]\nType = forking\nAutostart = true\n\
             PIDFile = {}\nExecStart = echo 4242 > {}\n",
            pid_file.display(),
            pid_file.display()
        ),
    );

    let supervisor = boot(&tree);
    let table = supervisor.table();

    let fork = table.get("fork.service").unwrap().unwrap();
    assert_eq!(fork.state, RunState::Started);
    assert_eq!(fork.last_known_pid, 4242);

    let before = table.get("fork.service").unwrap().unwrap();
    let err = supervisor.stop_service("fork.service").unwrap_err();
    assert!(matches!(err, InitError::NoStopCommand { .. }));
    assert_eq!(table.get("fork.service").unwrap().unwrap(), before);
}

#[test]
fn deleted_unit_is_refused_after_reload() {
    let dir = tempdir().unwrap();
    let tree = ConfigTree::create(dir.path());
    tree.write_unit("multi-user.target", &target_unit(""));
    tree.write_unit(
        "old.service",
        &oneshot_unit("multi-user.target", "", "true"),
    );

    let table = Arc::new(ServiceTable::new());
    load_services(&table, &tree.base, false).unwrap();
    let supervisor = Supervisor::new(Arc::clone(&table));

    tree.remove_unit("old.service");
    load_services(&table, &tree.base, true).unwrap();

    let err = supervisor.start_service("old.service").unwrap_err();
    assert!(matches!(err, InitError::Deleted(_)));
}

#[test]
fn start_of_started_simple_reports_already_running_without_mutation() {
    let dir = tempdir().unwrap();
    let tree = ConfigTree::create(dir.path());
    tree.write_unit("multi-user.target", &target_unit(""));
    tree.write_unit(
        "svc.service",
        &simple_unit("multi-user.target", "", "sleep 3600"),
    );

    let supervisor = boot(&tree);
    let table = supervisor.table();
    let before = table.get("svc.service").unwrap().unwrap();
    assert_eq!(before.state, RunState::Started);

    let err = supervisor.start_service("svc.service").unwrap_err();
    match err {
        InitError::AlreadyRunning { pid, .. } => {
            assert_eq!(pid, Some(before.last_known_pid));
        }
        other => panic!("expected AlreadyRunning, got {other}"),
    }
    assert_eq!(table.get("svc.service").unwrap().unwrap(), before);

    supervisor.stop_service("svc.service").unwrap();
}
