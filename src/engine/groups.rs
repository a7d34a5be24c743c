//! Execution-group computation: Kahn's algorithm with level grouping.
//!
//! Each group is a maximal antichain of the dependency DAG. A cycle never
//! deadlocks grouping; the unresolvable remainder collapses into one final
//! group.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::ParallelMode;
use crate::tracker::Bead;

/// One level of the dependency DAG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionGroup {
    pub level: usize,
    pub bead_ids: Vec<String>,
    pub parallel: bool,
}

/// Compute level groups for the given beads. Dependencies pointing outside
/// the set (already-done beads) are treated as satisfied.
pub fn compute_groups(
    beads: &[Bead],
    mode: ParallelMode,
    threshold: usize,
) -> Vec<ExecutionGroup> {
    let ids: BTreeSet<&str> = beads.iter().map(|b| b.id.as_str()).collect();
    let total = beads.len();

    // In-degree over edges internal to the set.
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for bead in beads {
        let internal = bead
            .deps
            .iter()
            .filter(|d| ids.contains(d.as_str()))
            .count();
        in_degree.insert(&bead.id, internal);
        for dep in &bead.deps {
            if ids.contains(dep.as_str()) {
                dependents.entry(dep).or_default().push(&bead.id);
            }
        }
    }

    let mut groups = Vec::new();
    let mut level = 0;
    while !in_degree.is_empty() {
        let ready: Vec<String> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| (*id).to_string())
            .collect();

        if ready.is_empty() {
            // Cycle: collapse the unresolvable remainder into one final group.
            let remainder: Vec<String> =
                in_degree.keys().map(|id| (*id).to_string()).collect();
            tracing::warn!(
                count = remainder.len(),
                "dependency cycle detected; collapsing remainder into final group"
            );
            groups.push(make_group(level, remainder, mode, threshold, total));
            break;
        }

        for id in &ready {
            in_degree.remove(id.as_str());
            if let Some(children) = dependents.get(id.as_str()) {
                for child in children {
                    if let Some(deg) = in_degree.get_mut(child) {
                        *deg = deg.saturating_sub(1);
                    }
                }
            }
        }

        groups.push(make_group(level, ready, mode, threshold, total));
        level += 1;
    }

    groups
}

fn make_group(
    level: usize,
    mut bead_ids: Vec<String>,
    mode: ParallelMode,
    threshold: usize,
    total: usize,
) -> ExecutionGroup {
    bead_ids.sort();
    let parallel = bead_ids.len() > 1
        && match mode {
            ParallelMode::Never => false,
            ParallelMode::Always => true,
            ParallelMode::Auto => bead_ids.len() >= threshold && total >= 4,
        };
    ExecutionGroup {
        level,
        bead_ids,
        parallel,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::BeadStatus;

    fn bead(id: &str, deps: &[&str]) -> Bead {
        Bead {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            status: BeadStatus::Open,
            deps: deps.iter().map(|s| (*s).to_string()).collect(),
            files: Vec::new(),
            verify_extra: Vec::new(),
        }
    }

    #[test]
    fn levels_respect_dependencies() {
        let beads = vec![
            bead("bd-a", &[]),
            bead("bd-b", &[]),
            bead("bd-c", &["bd-a"]),
            bead("bd-d", &["bd-b", "bd-c"]),
        ];
        let groups = compute_groups(&beads, ParallelMode::Never, 4);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].bead_ids, vec!["bd-a", "bd-b"]);
        assert_eq!(groups[1].bead_ids, vec!["bd-c"]);
        assert_eq!(groups[2].bead_ids, vec!["bd-d"]);

        // No bead's dependency sits at the same or a later level
        for (k, group) in groups.iter().enumerate() {
            for id in &group.bead_ids {
                let b = beads.iter().find(|b| &b.id == id).unwrap();
                for dep in &b.deps {
                    let dep_level = groups
                        .iter()
                        .position(|g| g.bead_ids.contains(dep))
                        .unwrap();
                    assert!(dep_level < k);
                }
            }
        }
    }

    #[test]
    fn union_equals_input_and_groups_disjoint() {
        let beads = vec![
            bead("bd-1", &[]),
            bead("bd-2", &["bd-1"]),
            bead("bd-3", &["bd-1"]),
            bead("bd-4", &["bd-2", "bd-3"]),
        ];
        let groups = compute_groups(&beads, ParallelMode::Auto, 4);
        let mut seen = BTreeSet::new();
        for group in &groups {
            for id in &group.bead_ids {
                assert!(seen.insert(id.clone()), "{id} appears twice");
            }
        }
        assert_eq!(seen.len(), beads.len());
    }

    #[test]
    fn external_deps_are_satisfied() {
        // bd-2 depends on a bead not in the set (already done)
        let beads = vec![bead("bd-2", &["bd-done"])];
        let groups = compute_groups(&beads, ParallelMode::Never, 4);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].bead_ids, vec!["bd-2"]);
    }

    #[test]
    fn cycle_collapses_into_final_group() {
        let beads = vec![
            bead("bd-a", &[]),
            bead("bd-x", &["bd-y"]),
            bead("bd-y", &["bd-x"]),
        ];
        let groups = compute_groups(&beads, ParallelMode::Never, 4);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].bead_ids, vec!["bd-a"]);
        assert_eq!(groups[1].bead_ids, vec!["bd-x", "bd-y"]);
    }

    #[test]
    fn ids_sorted_within_group() {
        let beads = vec![bead("bd-z", &[]), bead("bd-a", &[]), bead("bd-m", &[])];
        let groups = compute_groups(&beads, ParallelMode::Never, 4);
        assert_eq!(groups[0].bead_ids, vec!["bd-a", "bd-m", "bd-z"]);
    }

    #[test]
    fn parallel_gate_by_mode() {
        let beads = vec![
            bead("bd-1", &[]),
            bead("bd-2", &[]),
            bead("bd-3", &[]),
            bead("bd-4", &[]),
        ];
        let never = compute_groups(&beads, ParallelMode::Never, 4);
        assert!(!never[0].parallel);
        let always = compute_groups(&beads, ParallelMode::Always, 4);
        assert!(always[0].parallel);
        let auto = compute_groups(&beads, ParallelMode::Auto, 4);
        assert!(auto[0].parallel);
    }

    #[test]
    fn auto_requires_group_and_total_thresholds() {
        // Group of 2 below threshold 4
        let beads = vec![
            bead("bd-1", &[]),
            bead("bd-2", &[]),
            bead("bd-3", &["bd-1", "bd-2"]),
            bead("bd-4", &["bd-3"]),
        ];
        let groups = compute_groups(&beads, ParallelMode::Auto, 4);
        assert!(!groups[0].parallel);

        // Threshold 2 lets the first group through (total is 4)
        let groups = compute_groups(&beads, ParallelMode::Auto, 2);
        assert!(groups[0].parallel);
    }

    #[test]
    fn singleton_group_never_parallel() {
        let beads = vec![bead("bd-1", &[])];
        for mode in [ParallelMode::Never, ParallelMode::Auto, ParallelMode::Always] {
            let groups = compute_groups(&beads, mode, 1);
            assert!(!groups[0].parallel);
        }
    }

    #[test]
    fn empty_input_yields_no_groups() {
        assert!(compute_groups(&[], ParallelMode::Auto, 4).is_empty());
    }
}
