#[path = "common/mod.rs"]
mod common;

use std::{collections::BTreeMap, sync::Arc};

use common::{ConfigTree, simple_unit, target_unit};
use lutrainit::{
    config::load_services,
    getty::{GettyPool, GettyRecord},
    launcher, reexec,
    service::{RunState, ServiceTable},
    supervisor::Supervisor,
};
use tempfile::tempdir;

/// The full re-exec state cycle short of the exec itself: a running child
/// survives serialization, and the restored table resumes supervision data
/// with the same PID.
#[test]
fn snapshot_preserves_running_children_across_table_instances() {
    let dir = tempdir().unwrap();
    let tree = ConfigTree::create(dir.path());
    tree.write_unit("multi-user.target", &target_unit(""));
    tree.write_unit(
        "svc.service",
        &simple_unit("multi-user.target", "", "sleep 120"),
    );

    let table = Arc::new(ServiceTable::new());
    load_services(&table, &tree.base, false).unwrap();
    let supervisor = Supervisor::new(Arc::clone(&table));
    supervisor.start_service("svc.service").unwrap();

    let before = table.get("svc.service").unwrap().unwrap();
    assert_eq!(before.state, RunState::Started);
    let pid = before.last_known_pid;
    assert!(pid > 0);
    assert!(launcher::process_alive(pid));

    let pool = GettyPool::new();
    pool.set_entry(
        0,
        GettyRecord {
            tty: "tty1".to_string(),
            pid: 4321,
            managed: true,
            autologin: "alice".to_string(),
        },
    )
    .unwrap();

    let ls = dir.path().join("ls.bin");
    let gl = dir.path().join("gl.bin");
    reexec::write_snapshot(&table, &pool, &ls, &gl).unwrap();

    // "New image": fresh table and pool, restored from the files.
    let restored_table = Arc::new(ServiceTable::new());
    let restored_pool = GettyPool::new();
    let (services, gettys) = reexec::read_snapshot(&ls, &gl).unwrap();
    restored_table.restore(services).unwrap();
    restored_pool.restore(gettys).unwrap();

    let after = restored_table.get("svc.service").unwrap().unwrap();
    assert_eq!(after.state, RunState::Started);
    assert_eq!(after.last_known_pid, pid);
    assert!(launcher::process_alive(pid), "child must survive the handoff");

    // Getty entries come back demoted to unmanaged and are only adopted
    // once their process dies.
    let getty = restored_pool.get(0).unwrap().unwrap();
    assert!(!getty.managed);
    assert_eq!(getty.pid, 4321);
    assert_eq!(getty.autologin, "alice");

    // Snapshot files are consumed.
    assert!(!ls.exists());
    assert!(!gl.exists());

    // Re-running the unit load as a reload keeps the restored state, the
    // way the resumed image parses configuration without starting anything.
    load_services(&restored_table, &tree.base, true).unwrap();
    let after_reload = restored_table.get("svc.service").unwrap().unwrap();
    assert_eq!(after_reload.state, RunState::Started);
    assert_eq!(after_reload.last_known_pid, pid);

    let restored_supervisor = Supervisor::new(Arc::clone(&restored_table));
    restored_supervisor.stop_service("svc.service").unwrap();
    let deadline =
        std::time::Instant::now() + std::time::Duration::from_secs(5);
    while launcher::process_alive(pid) && std::time::Instant::now() < deadline
    {
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    assert!(!launcher::process_alive(pid), "child must stop after SIGTERM");

    // The first table still references the child; stop it there too so the
    // monitor thread settles before the test ends.
    let _ = supervisor.stop_service("svc.service");
}

#[test]
fn structurally_equal_tables_after_serialize_deserialize() {
    let dir = tempdir().unwrap();
    let tree = ConfigTree::create(dir.path());
    tree.write_unit("basic.target", &target_unit(""));
    tree.write_unit(
        "a.service",
        &simple_unit("basic.target", "", "sleep 60"),
    );
    tree.write_unit(
        "b.service",
        &simple_unit("basic.target", "a.service", "sleep 60"),
    );

    let table = Arc::new(ServiceTable::new());
    load_services(&table, &tree.base, false).unwrap();

    let ls = dir.path().join("ls.bin");
    let gl = dir.path().join("gl.bin");
    reexec::write_snapshot(&table, &GettyPool::new(), &ls, &gl).unwrap();

    let other = Arc::new(ServiceTable::new());
    let (services, _) = reexec::read_snapshot(&ls, &gl).unwrap();
    other.restore(services).unwrap();

    assert_eq!(table.export().unwrap(), other.export().unwrap());
}

#[test]
fn getty_snapshot_round_trips_the_whole_pool() {
    let dir = tempdir().unwrap();
    let pool = GettyPool::new();
    let mut expected = BTreeMap::new();
    for (idx, tty) in ["tty1", "tty2", "tty3"].iter().enumerate() {
        let record = GettyRecord {
            tty: tty.to_string(),
            pid: 100 + idx as u32,
            managed: true,
            autologin: format!("user{idx}"),
        };
        pool.set_entry(idx, record.clone()).unwrap();
        expected.insert(idx, record);
    }

    let table = ServiceTable::new();
    let ls = dir.path().join("ls.bin");
    let gl = dir.path().join("gl.bin");
    reexec::write_snapshot(&table, &pool, &ls, &gl).unwrap();

    let (_, gettys) = reexec::read_snapshot(&ls, &gl).unwrap();
    assert_eq!(gettys.len(), expected.len());
    for (idx, record) in &expected {
        assert_eq!(gettys[idx].tty, record.tty);
        assert_eq!(gettys[idx].pid, record.pid);
    }
}
