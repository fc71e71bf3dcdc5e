//! Dependency sorter.
//!
//! Consumes a set of service records and produces the two ordered structures
//! the boot pass runs from: the topologically sorted target list and, for
//! each target, the sorted list of member services. Targets are
//! synchronization barriers; services inside one target may start in
//! parallel, but no service of target `k` begins before every service of
//! target `k-1` reached a terminal start state.

use std::collections::{BTreeSet, HashMap};

use crate::{error::InitError, service::ServiceRecord};

/// The ordering structures rebuilt on every configuration load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyOrder {
    /// Topologically sorted names ending in `.target`.
    pub targets_order: Vec<String>,
    /// For each target, the sorted names of services wanted by it.
    pub services_order: HashMap<String, Vec<String>>,
}

struct EdgeGraph<'a> {
    units: &'a HashMap<String, ServiceRecord>,
    indegree: HashMap<&'a str, usize>,
    edges: HashMap<&'a str, Vec<&'a str>>,
}

impl<'a> EdgeGraph<'a> {
    /// Adds one ordering edge between two known units. References to absent
    /// names are skipped here (validation reports them), as are
    /// self-references, which would otherwise read as a one-node cycle.
    fn add_edge(&mut self, from: &str, to: &str) {
        if from == to {
            return;
        }
        let (Some(from), Some(to)) = (
            self.units.get(from).map(|r| r.name.as_str()),
            self.units.get(to).map(|r| r.name.as_str()),
        ) else {
            return;
        };
        self.edges.entry(from).or_default().push(to);
        *self.indegree.get_mut(to).expect("node must exist") += 1;
    }
}

/// Topologically sorts `units` and splits the result into target and
/// per-target service orders. Rejects cyclic graphs.
///
/// Edge construction: `WantedBy = T` adds `T -> self` (the target is an
/// ancestor of its members as well as their grouping label), `Requires` and
/// `After` entries add `dep -> self`, and `Before` entries add `self -> dep`.
/// References to names absent from `units` are ignored here; reference
/// validation happens during configuration load.
pub fn sort(
    units: &HashMap<String, ServiceRecord>,
) -> Result<DependencyOrder, InitError> {
    let mut graph = EdgeGraph {
        units,
        indegree: units.keys().map(|name| (name.as_str(), 0)).collect(),
        edges: HashMap::new(),
    };

    for record in units.values() {
        if !record.wanted_by.is_empty() {
            graph.add_edge(&record.wanted_by, &record.name);
        }
        for dep in &record.requires {
            graph.add_edge(dep, &record.name);
        }
        for dep in &record.after {
            graph.add_edge(dep, &record.name);
        }
        for dep in &record.before {
            graph.add_edge(&record.name, dep);
        }
    }

    let EdgeGraph {
        mut indegree,
        edges,
        ..
    } = graph;

    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|&(_, &deg)| deg == 0)
        .map(|(&name, _)| name)
        .collect();

    let mut order = Vec::with_capacity(units.len());
    while let Some(name) = ready.pop_first() {
        order.push(name);

        if let Some(children) = edges.get(name) {
            for &child in children {
                if let Some(deg) = indegree.get_mut(child) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(child);
                    }
                }
            }
        }
    }

    if order.len() != units.len() {
        let mut remaining: Vec<&str> = indegree
            .into_iter()
            .filter(|(_, deg)| *deg > 0)
            .map(|(name, _)| name)
            .collect();
        remaining.sort_unstable();

        return Err(InitError::Cycle {
            cycle: remaining.join(" -> "),
        });
    }

    let targets_order: Vec<String> = order
        .iter()
        .filter(|name| name.ends_with(".target"))
        .map(|name| name.to_string())
        .collect();

    let mut services_order: HashMap<String, Vec<String>> = targets_order
        .iter()
        .map(|t| (t.clone(), Vec::new()))
        .collect();
    for name in &order {
        let Some(record) = units.get(*name) else {
            continue;
        };
        if record.is_target() || record.wanted_by.is_empty() {
            continue;
        }
        if let Some(members) = services_order.get_mut(&record.wanted_by) {
            members.push(record.name.clone());
        }
    }

    Ok(DependencyOrder {
        targets_order,
        services_order,
    })
}
