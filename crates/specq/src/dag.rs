//! Dependency graph validation and ready-item scheduling.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use specq_types::{Status, WorkItem};

use crate::error::DAGError;

/// A validated dependency graph over a change set. Built once per
/// pipeline cycle from whatever [`WorkItem`]s are in scope.
pub struct Dag<'a> {
    items: BTreeMap<&'a str, &'a WorkItem>,
}

impl<'a> Dag<'a> {
    /// Build and validate the graph. Fails if any `deps` entry names an
    /// unknown change, or if the graph contains a cycle (including a
    /// self-loop).
    pub fn build(items: &'a [WorkItem]) -> Result<Self, DAGError> {
        let by_id: BTreeMap<&str, &WorkItem> = items.iter().map(|i| (i.id.as_str(), i)).collect();

        for item in items {
            for dep in &item.deps {
                if !by_id.contains_key(dep.as_str()) {
                    return Err(DAGError::UnknownDependency {
                        from: item.id.clone(),
                        dep: dep.clone(),
                    });
                }
            }
        }

        topo_order(&by_id)?;

        Ok(Self { items: by_id })
    }

    /// Topological order of every change id, dependencies first.
    pub fn topo_order(&self) -> Vec<&str> {
        // Validated at construction time, so this cannot fail here.
        topo_order(&self.items).expect("graph was already validated as acyclic")
    }

    /// Reverse-graph reachability: how many changes would become
    /// unlockable (transitively) if `id` were accepted. Used as the
    /// scheduler's primary tie-break key.
    pub fn unlock_count(&self, id: &str) -> usize {
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (&item_id, item) in &self.items {
            for dep in &item.deps {
                dependents.entry(dep.as_str()).or_default().push(item_id);
            }
        }

        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if let Some(next) = dependents.get(cur) {
                for &n in next {
                    if seen.insert(n) {
                        stack.push(n);
                    }
                }
            }
        }
        seen.len()
    }
}

fn topo_order<'a>(items: &BTreeMap<&'a str, &'a WorkItem>) -> Result<Vec<&'a str>, DAGError> {
    let mut indegree: BTreeMap<&str, usize> = items.keys().map(|&id| (id, 0)).collect();
    for item in items.values() {
        for dep in &item.deps {
            if dep.as_str() == item.id.as_str() {
                return Err(DAGError::Cycle(item.id.clone()));
            }
        }
        // indegree counts edges dependent -> dependency; a node's
        // indegree is its own deps count (how many must finish first).
        *indegree.get_mut(item.id.as_str()).expect("known id") = item.deps.len();
    }

    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for item in items.values() {
        for dep in &item.deps {
            dependents.entry(dep.as_str()).or_default().push(item.id.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|&(_, &deg)| deg == 0)
        .map(|(&id, _)| id)
        .collect();

    let mut out = Vec::with_capacity(items.len());
    while let Some(&id) = ready.iter().next() {
        ready.remove(id);
        out.push(id);
        if let Some(deps) = dependents.get(id) {
            for &dependent in deps {
                let deg = indegree.get_mut(dependent).expect("known id");
                *deg = deg.saturating_sub(1);
                if *deg == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if out.len() != items.len() {
        let stuck: Vec<&str> = indegree
            .iter()
            .filter(|&(_, &deg)| deg > 0)
            .map(|(&id, _)| id)
            .collect();
        return Err(DAGError::Cycle(stuck.join(", ")));
    }

    Ok(out)
}

/// Recompute `pending`/`blocked` → `ready`/`blocked` for every item
/// whose status is currently `pending` or `blocked`. Items in any other
/// status — in particular the transient ones — are left untouched.
///
/// Takes `items` alone, not a [`Dag`]: a `Dag<'a>` borrows `items`, and
/// holding that borrow alive across this function's `&mut` pass would
/// conflict with it. The accepted-id snapshot below is taken and
/// released (as owned `String`s) before `items` is mutated.
pub fn reconcile_status(items: &mut [WorkItem]) {
    let accepted: BTreeSet<String> = items
        .iter()
        .filter(|i| i.status == Status::Accepted)
        .map(|i| i.id.clone())
        .collect();

    for item in items.iter_mut() {
        if !matches!(item.status, Status::Pending | Status::Blocked) {
            continue;
        }
        let all_deps_accepted = item.deps.iter().all(|dep| accepted.contains(dep.as_str()));
        item.status = if all_deps_accepted {
            Status::Ready
        } else {
            Status::Blocked
        };
    }
}

/// Select the next change to run. With `target_id` set, returns that
/// change iff it is present and `ready`. Otherwise picks the head of
/// the ready set ordered by `(-unlock_count, -priority, risk_rank, id)`.
pub fn select_next<'a>(
    dag: &Dag<'a>,
    items: &'a [WorkItem],
    target_id: Option<&str>,
) -> Option<&'a WorkItem> {
    if let Some(target) = target_id {
        return items
            .iter()
            .find(|i| i.id == target && i.status == Status::Ready);
    }

    items
        .iter()
        .filter(|i| i.status == Status::Ready)
        .max_by_key(|i| {
            (
                dag.unlock_count(&i.id),
                i.priority,
                std::cmp::Reverse(i.risk.rank()),
                std::cmp::Reverse(i.id.clone()),
            )
        })
}
