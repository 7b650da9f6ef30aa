use std::collections::{BTreeMap, BTreeSet};

use common::{Error, Result};

/// Topologically sort declared features by their dependency edges.
///
/// Kahn's algorithm over name-ordered maps: among features whose
/// dependencies are all satisfied, the lexicographically smallest name is
/// emitted first. This makes the plan order a pure function of the input,
/// which is what the determinism guarantee rests on.
pub fn topo_sort(nodes: &BTreeMap<String, Vec<String>>) -> Result<Vec<String>> {
    // Validate edges first: a dependency must itself be declared.
    for (name, deps) in nodes {
        for dep in deps {
            if !nodes.contains_key(dep) {
                return Err(Error::Name {
                    symbol: dep.clone(),
                    location: format!("features.{name}.depends_on"),
                });
            }
        }
    }

    let mut remaining: BTreeMap<&str, BTreeSet<&str>> = nodes
        .iter()
        .map(|(name, deps)| {
            (
                name.as_str(),
                deps.iter().map(|d| d.as_str()).collect::<BTreeSet<_>>(),
            )
        })
        .collect();

    let mut plan = Vec::with_capacity(nodes.len());
    while !remaining.is_empty() {
        let ready: Option<&str> = remaining
            .iter()
            .find(|(_, deps)| deps.is_empty())
            .map(|(name, _)| *name);

        let Some(name) = ready else {
            let cycle: Vec<&str> = remaining.keys().copied().collect();
            return Err(Error::Cycle(cycle.join(" -> ")));
        };

        remaining.remove(name);
        for deps in remaining.values_mut() {
            deps.remove(name);
        }
        plan.push(name.to_string());
    }

    Ok(plan)
}
