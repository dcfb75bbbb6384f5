//! Wait-for graph construction and cycle search.
//!
//! There is no standing detector thread. Each blocked session runs a check
//! on its own poll interval: snapshot the manager's wait edges, walk from
//! itself, and report a cycle only if it passes back through the polling
//! session. A cycle among *other* sessions is left for one of them to find,
//! so exactly the deadlocked parties abort and bystanders keep waiting.
//!
//! The snapshot is not atomic with respect to ongoing grants; a stale edge
//! can produce a false cycle in theory, but every session in such a cycle
//! was genuinely blocked within the same poll window, and the unwound
//! request is simply retried by the caller.

use std::collections::{HashMap, HashSet};

use tarn_common::types::LockerId;

use crate::manager::LockManager;

/// Directed graph of "waiter depends on holder" edges.
pub struct WaitForGraph {
    edges: HashMap<LockerId, Vec<LockerId>>,
}

impl WaitForGraph {
    /// Capture the manager's current wait edges. Each waiter contributes
    /// edges to the sessions blocking it (granted holders in conflicting
    /// modes and conflicting requests queued ahead of it).
    pub fn snapshot(manager: &LockManager) -> WaitForGraph {
        let mut edges = HashMap::new();
        for (waiter, resource) in manager.waiting_pairs() {
            let owners = manager.conflict_owners(resource, waiter);
            if !owners.is_empty() {
                edges.insert(waiter, owners);
            }
        }
        WaitForGraph { edges }
    }

    #[cfg(test)]
    fn from_edges(pairs: &[(u64, &[u64])]) -> WaitForGraph {
        let edges = pairs
            .iter()
            .map(|(from, to)| (LockerId(*from), to.iter().map(|id| LockerId(*id)).collect()))
            .collect();
        WaitForGraph { edges }
    }

    /// Depth-first search for a cycle that passes through `start`. Returns
    /// the cycle members in dependency order, `start` first.
    pub fn cycle_through(&self, start: LockerId) -> Option<Vec<LockerId>> {
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        if self.walk(start, start, &mut path, &mut visited) {
            Some(path)
        } else {
            None
        }
    }

    fn walk(
        &self,
        node: LockerId,
        start: LockerId,
        path: &mut Vec<LockerId>,
        visited: &mut HashSet<LockerId>,
    ) -> bool {
        if !visited.insert(node) {
            return false;
        }
        path.push(node);
        if let Some(next) = self.edges.get(&node) {
            for &owner in next {
                if owner == start {
                    return true;
                }
                if self.walk(owner, start, path, visited) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }
}

/// Poll-time check run by a blocked `locker`: is it part of a wait cycle
/// right now? Returns the cycle members when it is.
pub fn check(manager: &LockManager, locker: LockerId) -> Option<Vec<LockerId>> {
    WaitForGraph::snapshot(manager).cycle_through(locker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{GrantNotice, GrantState, QueuePolicy};
    use tarn_common::types::{LockMode, ResourceId};

    #[test]
    fn test_no_cycle_in_chain() {
        let g = WaitForGraph::from_edges(&[(1, &[2]), (2, &[3])]);
        assert!(g.cycle_through(LockerId(1)).is_none());
        assert!(g.cycle_through(LockerId(3)).is_none());
    }

    #[test]
    fn test_two_party_cycle() {
        let g = WaitForGraph::from_edges(&[(1, &[2]), (2, &[1])]);
        assert_eq!(
            g.cycle_through(LockerId(1)),
            Some(vec![LockerId(1), LockerId(2)])
        );
        assert_eq!(
            g.cycle_through(LockerId(2)),
            Some(vec![LockerId(2), LockerId(1)])
        );
    }

    #[test]
    fn test_bystander_sees_no_cycle() {
        // 3 waits on the 1<->2 cycle but is not part of it.
        let g = WaitForGraph::from_edges(&[(1, &[2]), (2, &[1]), (3, &[1])]);
        assert!(g.cycle_through(LockerId(3)).is_none());
        assert!(g.cycle_through(LockerId(1)).is_some());
    }

    #[test]
    fn test_three_party_cycle_in_order() {
        let g = WaitForGraph::from_edges(&[(1, &[2]), (2, &[3]), (3, &[1])]);
        assert_eq!(
            g.cycle_through(LockerId(2)),
            Some(vec![LockerId(2), LockerId(3), LockerId(1)])
        );
    }

    #[test]
    fn test_diamond_without_cycle() {
        let g = WaitForGraph::from_edges(&[(1, &[2, 3]), (2, &[4]), (3, &[4])]);
        assert!(g.cycle_through(LockerId(1)).is_none());
    }

    #[test]
    fn test_snapshot_from_manager_conflicts() {
        let m = LockManager::new();
        let db1 = ResourceId::database("one");
        let db2 = ResourceId::database("two");
        let (a, b) = (LockerId(1), LockerId(2));

        let grant = |res, id, mode| {
            m.lock(res, id, mode, GrantNotice::new(), QueuePolicy::default())
        };
        assert_eq!(grant(db1, a, LockMode::Exclusive), GrantState::Granted);
        assert_eq!(grant(db2, b, LockMode::Exclusive), GrantState::Granted);
        // Cross requests: a waits on b, b waits on a.
        assert_eq!(grant(db2, a, LockMode::Shared), GrantState::Waiting);
        assert_eq!(grant(db1, b, LockMode::Shared), GrantState::Waiting);

        assert_eq!(check(&m, a), Some(vec![a, b]));
        assert_eq!(check(&m, b), Some(vec![b, a]));

        // Break the cycle: a abandons its wait.
        m.abandon_request(db2, a, LockMode::None);
        assert!(check(&m, b).is_none());
    }
}
