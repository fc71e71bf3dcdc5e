#[path = "common/mod.rs"]
mod common;

use std::{
    path::PathBuf,
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use common::{ConfigTree, oneshot_unit, simple_unit, target_unit};
use lutrainit::{
    config::load_services,
    control::{ControlServer, PowerEvent},
    ipc::{self, ControlRequest, ControlResponse},
    service::{RunState, ServiceTable},
    supervisor::Supervisor,
};
use tempfile::tempdir;

struct Harness {
    socket: PathBuf,
    supervisor: Supervisor,
    events: mpsc::Receiver<PowerEvent>,
    _tree: ConfigTree,
    _dir: tempfile::TempDir,
}

/// Boots a control server over a scratch configuration tree.
fn harness(units: &[(&str, String)]) -> Harness {
    let dir = tempdir().unwrap();
    let tree = ConfigTree::create(dir.path());
    for (name, content) in units {
        tree.write_unit(name, content);
    }

    let table = Arc::new(ServiceTable::new());
    load_services(&table, &tree.base, false).unwrap();
    let supervisor = Supervisor::new(table);

    let socket = dir.path().join("ottersock");
    let (tx, rx) = mpsc::channel();
    let server = ControlServer::bind(
        &socket,
        supervisor.clone(),
        tree.base.clone(),
        tx,
    )
    .unwrap();
    thread::spawn(move || server.serve());

    Harness {
        socket,
        supervisor,
        events: rx,
        _tree: tree,
        _dir: dir,
    }
}

fn base_units() -> Vec<(&'static str, String)> {
    vec![
        ("multi-user.target", target_unit("")),
        (
            "net.service",
            oneshot_unit("multi-user.target", "", "true"),
        ),
        (
            "app.service",
            simple_unit("multi-user.target", "", "sleep 3600"),
        ),
    ]
}

#[test]
fn version_reports_build_and_protocol() {
    let h = harness(&base_units());
    let response =
        ipc::send_request(&h.socket, &ControlRequest::Version).unwrap();
    match response {
        ControlResponse::Version(info) => {
            assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
            assert_eq!(info.protocol, ipc::PROTOCOL_VERSION);
        }
        other => panic!("expected version payload, got {other:?}"),
    }
}

#[test]
fn stats_returns_formatted_counters() {
    let h = harness(&base_units());
    let response =
        ipc::send_request(&h.socket, &ControlRequest::Stats).unwrap();
    match response {
        ControlResponse::Stats(stats) => {
            assert!(!stats.mem_resident.is_empty());
            assert!(!stats.sys_mem_total.is_empty());
        }
        other => panic!("expected stats payload, got {other:?}"),
    }
}

#[test]
fn status_all_and_single_and_unknown() {
    let h = harness(&base_units());

    let all = ipc::send_request(
        &h.socket,
        &ControlRequest::Status {
            name: None,
            all: true,
        },
    )
    .unwrap();
    match all {
        ControlResponse::Status(map) => {
            assert_eq!(map.len(), 3);
            assert!(map.contains_key("multi-user.target"));
        }
        other => panic!("expected status payload, got {other:?}"),
    }

    let single = ipc::send_request(
        &h.socket,
        &ControlRequest::Status {
            name: Some("net.service".to_string()),
            all: false,
        },
    )
    .unwrap();
    match single {
        ControlResponse::Status(map) => {
            assert_eq!(map.len(), 1);
            assert_eq!(map["net.service"].kind, "oneshot");
        }
        other => panic!("expected status payload, got {other:?}"),
    }

    let unknown = ipc::send_request(
        &h.socket,
        &ControlRequest::Status {
            name: Some("nope.service".to_string()),
            all: false,
        },
    )
    .unwrap();
    match unknown {
        ControlResponse::Status(map) => assert!(map.is_empty()),
        other => panic!("expected empty status payload, got {other:?}"),
    }
}

#[test]
fn start_and_stop_round_trip_over_the_socket() {
    let h = harness(&base_units());

    let started = ipc::send_request(
        &h.socket,
        &ControlRequest::Start {
            name: "app.service".to_string(),
        },
    )
    .unwrap();
    match started {
        ControlResponse::Action(reply) => {
            assert!(!reply.err, "start failed: {}", reply.err_str);
            assert_eq!(reply.action, "start");
        }
        other => panic!("expected action payload, got {other:?}"),
    }
    assert_eq!(
        h.supervisor
            .table()
            .state_of("app.service")
            .unwrap()
            .unwrap(),
        RunState::Started
    );

    // Starting again is refused with a structured error, not a transport
    // failure.
    let again = ipc::send_request(
        &h.socket,
        &ControlRequest::Start {
            name: "app.service".to_string(),
        },
    )
    .unwrap();
    match again {
        ControlResponse::Action(reply) => {
            assert!(reply.err);
            assert!(reply.err_str.contains("already running"));
        }
        other => panic!("expected action payload, got {other:?}"),
    }

    let stopped = ipc::send_request(
        &h.socket,
        &ControlRequest::Stop {
            name: "app.service".to_string(),
        },
    )
    .unwrap();
    match stopped {
        ControlResponse::Action(reply) => {
            assert!(!reply.err, "stop failed: {}", reply.err_str);
        }
        other => panic!("expected action payload, got {other:?}"),
    }
}

#[test]
fn unknown_service_action_is_a_structured_error() {
    let h = harness(&base_units());
    let response = ipc::send_request(
        &h.socket,
        &ControlRequest::Start {
            name: "ghost.service".to_string(),
        },
    )
    .unwrap();
    match response {
        ControlResponse::Action(reply) => {
            assert!(reply.err);
            assert!(reply.err_str.contains("not loaded"));
        }
        other => panic!("expected action payload, got {other:?}"),
    }
}

#[test]
fn reload_over_the_socket_tombstones_removed_units() {
    let h = harness(&base_units());

    h._tree.remove_unit("net.service");
    let response =
        ipc::send_request(&h.socket, &ControlRequest::Reload).unwrap();
    match response {
        ControlResponse::Reload(reply) => {
            assert!(!reply.err, "reload failed: {}", reply.err_str)
        }
        other => panic!("expected reload payload, got {other:?}"),
    }

    let status = ipc::send_request(
        &h.socket,
        &ControlRequest::Status {
            name: Some("net.service".to_string()),
            all: false,
        },
    )
    .unwrap();
    match status {
        ControlResponse::Status(map) => {
            assert!(map["net.service"].deleted);
        }
        other => panic!("expected status payload, got {other:?}"),
    }

    // Supervision of a tombstoned unit is refused.
    let start = ipc::send_request(
        &h.socket,
        &ControlRequest::Start {
            name: "net.service".to_string(),
        },
    )
    .unwrap();
    match start {
        ControlResponse::Action(reply) => assert!(reply.err),
        other => panic!("expected action payload, got {other:?}"),
    }
}

#[test]
fn power_requests_reply_before_scheduling_the_event() {
    let h = harness(&base_units());

    let response = ipc::send_request(
        &h.socket,
        &ControlRequest::Shutdown { reboot: true },
    )
    .unwrap();
    assert_eq!(response, ControlResponse::Ok);
    let event = h.events.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(event, PowerEvent::Shutdown { reboot: true });

    let response =
        ipc::send_request(&h.socket, &ControlRequest::Reexec).unwrap();
    assert_eq!(response, ControlResponse::Ok);
    let event = h.events.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(event, PowerEvent::Reexec);
}
