#[path = "common/mod.rs"]
mod common;

use std::sync::Arc;

use common::{ConfigTree, oneshot_unit, target_unit};
use lutrainit::{config::load_services, service::ServiceTable};
use tempfile::tempdir;

#[test]
fn targets_are_ordered_by_their_mutual_references() {
    let dir = tempdir().unwrap();
    let tree = ConfigTree::create(dir.path());
    tree.write_unit("basic.target", &target_unit(""));
    tree.write_unit(
        "network.target",
        "[order]\nAfter = basic.target\n\n[service]\n",
    );
    tree.write_unit(
        "multi-user.target",
        "[order]\nRequires = network.target\nAfter = basic.target\n\n[service]\n",
    );
    tree.write_unit(
        "dns.service",
        &oneshot_unit("network.target", "", "true"),
    );

    let table = Arc::new(ServiceTable::new());
    load_services(&table, &tree.base, false).unwrap();

    let (targets, services) = table.orders().unwrap();
    assert_eq!(
        targets,
        vec!["basic.target", "network.target", "multi-user.target"]
    );
    assert_eq!(services["network.target"], vec!["dns.service"]);
    assert!(services["basic.target"].is_empty());
    assert!(services["multi-user.target"].is_empty());
}

#[test]
fn wanted_by_acts_as_an_ordering_edge_too() {
    // The owning target is an ancestor in the graph, not only a grouping
    // label: a service that is Before its own target would be a cycle.
    let dir = tempdir().unwrap();
    let tree = ConfigTree::create(dir.path());
    tree.write_unit("multi-user.target", &target_unit(""));
    tree.write_unit(
        "selfish.service",
        "[order]\nBefore = multi-user.target\n\n\
         [service]\nType = oneshot\nExecStart = true\n",
    );

    let table = Arc::new(ServiceTable::new());
    let err = load_services(&table, &tree.base, false).unwrap_err();
    assert!(matches!(err, lutrainit::error::InitError::Cycle { .. }));
}

#[test]
fn services_without_constraints_keep_a_stable_order() {
    let dir = tempdir().unwrap();
    let tree = ConfigTree::create(dir.path());
    tree.write_unit("multi-user.target", &target_unit(""));
    for name in ["c.service", "a.service", "b.service"] {
        tree.write_unit(name, &oneshot_unit("multi-user.target", "", "true"));
    }

    let table = Arc::new(ServiceTable::new());
    load_services(&table, &tree.base, false).unwrap();
    let (_, services) = table.orders().unwrap();
    assert_eq!(
        services["multi-user.target"],
        vec!["a.service", "b.service", "c.service"]
    );
}

#[test]
fn before_and_after_shape_the_member_order() {
    let dir = tempdir().unwrap();
    let tree = ConfigTree::create(dir.path());
    tree.write_unit("multi-user.target", &target_unit(""));
    tree.write_unit(
        "z-early.service",
        "[order]\nBefore = a-late.service\nWantedBy = multi-user.target\n\n\
         [service]\nType = oneshot\nExecStart = true\n",
    );
    tree.write_unit(
        "a-late.service",
        &oneshot_unit("multi-user.target", "", "true"),
    );
    tree.write_unit(
        "m-last.service",
        "[order]\nAfter = a-late.service\nWantedBy = multi-user.target\n\n\
         [service]\nType = oneshot\nExecStart = true\n",
    );

    let table = Arc::new(ServiceTable::new());
    load_services(&table, &tree.base, false).unwrap();
    let (_, services) = table.orders().unwrap();

    let members = &services["multi-user.target"];
    let pos = |name: &str| {
        members
            .iter()
            .position(|m| m == name)
            .unwrap_or_else(|| panic!("{name} missing from {members:?}"))
    };
    assert!(pos("z-early.service") < pos("a-late.service"));
    assert!(pos("a-late.service") < pos("m-last.service"));
}
