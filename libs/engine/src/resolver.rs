//! Dependency resolution over module manifests.
//!
//! Produces a deterministic start order: Kahn's algorithm with a sorted
//! ready set, so modules with no ordering constraint between them start in
//! ascending name order. Cycle detection reports the actual cycle path
//! rather than just the fact of a cycle.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::errors::EngineError;
use crate::manifest::Manifest;

/// Check the dependency graph without producing an order.
pub fn verify(manifests: &[Manifest]) -> Result<(), EngineError> {
    resolve_order(manifests).map(|_| ())
}

/// Compute the start order for the enabled subset of `manifests`.
///
/// Disabled modules are excluded from the graph entirely; an enabled module
/// depending on a disabled (or unknown) one fails with `MissingDependency`.
pub fn resolve_order(manifests: &[Manifest]) -> Result<Vec<String>, EngineError> {
    let enabled: Vec<&Manifest> = manifests.iter().filter(|m| m.enabled).collect();
    let known: BTreeSet<&str> = enabled.iter().map(|m| m.name.as_str()).collect();

    // adjacency: dependency -> dependents, plus in-degrees of dependents
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    for m in &enabled {
        in_degree.entry(m.name.as_str()).or_insert(0);
        for dep in &m.depends_on {
            if !known.contains(dep.as_str()) {
                return Err(EngineError::MissingDependency {
                    module: m.name.clone(),
                    missing: dep.clone(),
                });
            }
            dependents.entry(dep.as_str()).or_default().push(&m.name);
            *in_degree.entry(m.name.as_str()).or_insert(0) += 1;
        }
    }

    // Kahn with a BTreeSet ready queue: ties break in ascending name order.
    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&n, _)| n)
        .collect();
    let mut order = Vec::with_capacity(enabled.len());
    while let Some(name) = ready.pop_first() {
        order.push(name.to_string());
        if let Some(next) = dependents.get(name) {
            for &dependent in next {
                if let Some(d) = in_degree.get_mut(dependent) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }
    }

    if order.len() != enabled.len() {
        let path = find_cycle(&enabled);
        return Err(EngineError::DependencyCycle { path });
    }
    Ok(order)
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// DFS cycle search, only called once Kahn has proven a cycle exists.
/// Returns the cycle as `[a, b, .., a]`.
fn find_cycle(enabled: &[&Manifest]) -> Vec<String> {
    let by_name: HashMap<&str, &Manifest> =
        enabled.iter().map(|m| (m.name.as_str(), *m)).collect();
    let mut marks: HashMap<&str, Mark> = enabled
        .iter()
        .map(|m| (m.name.as_str(), Mark::White))
        .collect();
    let mut stack: Vec<&str> = Vec::new();

    // Deterministic entry order keeps the reported cycle stable.
    let mut names: Vec<&str> = enabled.iter().map(|m| m.name.as_str()).collect();
    names.sort_unstable();
    for name in names {
        if marks[name] == Mark::White {
            if let Some(cycle) = dfs(name, &by_name, &mut marks, &mut stack) {
                return cycle;
            }
        }
    }
    Vec::new()
}

fn dfs<'a>(
    node: &'a str,
    by_name: &HashMap<&'a str, &'a Manifest>,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    marks.insert(node, Mark::Gray);
    stack.push(node);
    for dep in &by_name[node].depends_on {
        let dep = dep.as_str();
        match marks.get(dep).copied() {
            Some(Mark::Gray) => {
                let start = stack.iter().position(|&n| n == dep).unwrap();
                let mut path: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                path.push(dep.to_string());
                return Some(path);
            }
            Some(Mark::White) => {
                if let Some(cycle) = dfs(dep, by_name, marks, stack) {
                    return Some(cycle);
                }
            }
            _ => {}
        }
    }
    stack.pop();
    marks.insert(node, Mark::Black);
    None
}
