//! Stable topological ordering over index-addressed DAGs.
//!
//! Nodes are identified by their index; `prerequisites[i]` lists the nodes
//! that must come before node `i`. Ties are broken by the lower index, so
//! callers control the tie-break by choosing their numbering.

use std::collections::{BTreeSet, VecDeque};

/// Orders nodes so every node comes after all of its prerequisites.
///
/// # Errors
///
/// Returns the shortest cycle found among the nodes that could not be
/// ordered, as a list of indices with the first member repeated at the end.
pub fn stable_order(prerequisites: &[BTreeSet<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let count = prerequisites.len();
    let mut waiting_on: Vec<usize> = prerequisites.iter().map(BTreeSet::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
    for (node, prereqs) in prerequisites.iter().enumerate() {
        for &prereq in prereqs {
            dependents[prereq].push(node);
        }
    }

    let mut ready: BTreeSet<usize> = (0..count).filter(|&i| waiting_on[i] == 0).collect();
    let mut order = Vec::with_capacity(count);

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            waiting_on[dependent] -= 1;
            if waiting_on[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() == count {
        return Ok(order);
    }

    let placed: BTreeSet<usize> = order.into_iter().collect();
    let remaining: BTreeSet<usize> = (0..count).filter(|i| !placed.contains(i)).collect();
    Err(shortest_cycle(prerequisites, &remaining).unwrap_or_else(|| remaining.into_iter().collect()))
}

/// Breadth-first search for the shortest cycle through the given nodes.
fn shortest_cycle(prerequisites: &[BTreeSet<usize>], nodes: &BTreeSet<usize>) -> Option<Vec<usize>> {
    let mut best: Option<Vec<usize>> = None;

    for &start in nodes {
        let mut parent: Vec<Option<usize>> = vec![None; prerequisites.len()];
        let mut visited = BTreeSet::from([start]);
        let mut queue = VecDeque::from([start]);

        let found = 'search: loop {
            let Some(current) = queue.pop_front() else {
                break 'search None;
            };
            for &next in prerequisites[current].iter().filter(|n| nodes.contains(n)) {
                if next == start {
                    break 'search Some(current);
                }
                if visited.insert(next) {
                    parent[next] = Some(current);
                    queue.push_back(next);
                }
            }
        };

        if let Some(last) = found {
            let mut path = vec![start];
            let mut cursor = Some(last);
            let mut tail = Vec::new();
            while let Some(node) = cursor.filter(|&n| n != start) {
                tail.push(node);
                cursor = parent[node];
            }
            path.extend(tail.into_iter().rev());
            path.push(start);

            if best.as_ref().is_none_or(|b| path.len() < b.len()) {
                best = Some(path);
            }
        }
    }

    best
}

/// Returns true if `from` depends on `target`, directly or transitively.
#[must_use]
pub fn depends_on(prerequisites: &[BTreeSet<usize>], from: usize, target: usize) -> bool {
    let mut visited = BTreeSet::new();
    let mut stack = vec![from];
    while let Some(node) = stack.pop() {
        for &prereq in &prerequisites[node] {
            if prereq == target {
                return true;
            }
            if visited.insert(prereq) {
                stack.push(prereq);
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(lists: &[&[usize]]) -> Vec<BTreeSet<usize>> {
        lists.iter().map(|l| l.iter().copied().collect()).collect()
    }

    #[test]
    fn test_order_respects_prerequisites() {
        // 0 <- 2 <- 1
        let prereqs = deps(&[&[], &[2], &[0]]);
        assert_eq!(stable_order(&prereqs), Ok(vec![0, 2, 1]));
    }

    #[test]
    fn test_ties_broken_by_index() {
        let prereqs = deps(&[&[], &[], &[], &[0]]);
        assert_eq!(stable_order(&prereqs), Ok(vec![0, 1, 2, 3]));
    }

    #[test]
    fn test_reports_shortest_cycle() {
        // 0 -> 1 -> 2 -> 0 plus 3 -> 1 -> 3; 4 depends on the cycle
        let prereqs = deps(&[&[1], &[2, 3], &[0], &[1], &[0]]);
        let cycle = stable_order(&prereqs).unwrap_err();
        assert_eq!(cycle, vec![1, 3, 1]);
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let prereqs = deps(&[&[], &[1]]);
        assert_eq!(stable_order(&prereqs), Err(vec![1, 1]));
    }

    #[test]
    fn test_transitive_dependency() {
        let prereqs = deps(&[&[], &[0], &[1], &[]]);
        assert!(depends_on(&prereqs, 2, 0));
        assert!(!depends_on(&prereqs, 0, 2));
        assert!(!depends_on(&prereqs, 3, 0));
    }
}
