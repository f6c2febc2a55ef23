use std::collections::{BTreeMap, BTreeSet};

use crate::common::types::TxnId;

/// Wait-for graph over transactions: an edge `t1 -> t2` means `t1` is
/// waiting for a lock that `t2` holds incompatibly.
///
/// Ordered adjacency keeps cycle search deterministic: the search starts
/// from the lowest transaction id and explores neighbours in ascending
/// order, and the chosen victim is the youngest (largest id) transaction on
/// the first cycle found.
#[derive(Default)]
pub struct WaitsForGraph {
    edges: BTreeMap<TxnId, BTreeSet<TxnId>>,
}

impl WaitsForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&mut self, t1: TxnId, t2: TxnId) {
        if t1 != t2 {
            self.edges.entry(t1).or_default().insert(t2);
        }
    }

    pub fn remove_edge(&mut self, t1: TxnId, t2: TxnId) {
        if let Some(targets) = self.edges.get_mut(&t1) {
            targets.remove(&t2);
            if targets.is_empty() {
                self.edges.remove(&t1);
            }
        }
    }

    /// Drop a transaction and every edge touching it (its locks are gone)
    pub fn remove_txn(&mut self, txn_id: TxnId) {
        self.edges.remove(&txn_id);
        self.edges.retain(|_, targets| {
            targets.remove(&txn_id);
            !targets.is_empty()
        });
    }

    pub fn edges(&self) -> Vec<(TxnId, TxnId)> {
        self.edges
            .iter()
            .flat_map(|(&from, targets)| targets.iter().map(move |&to| (from, to)))
            .collect()
    }

    /// Find a cycle and return its youngest member as the victim
    pub fn has_cycle(&self) -> Option<TxnId> {
        let mut visited = BTreeSet::new();
        for &start in self.edges.keys() {
            if visited.contains(&start) {
                continue;
            }
            let mut path = Vec::new();
            let mut on_path = BTreeSet::new();
            if let Some(victim) = self.dfs(start, &mut visited, &mut path, &mut on_path) {
                return Some(victim);
            }
        }
        None
    }

    fn dfs(
        &self,
        node: TxnId,
        visited: &mut BTreeSet<TxnId>,
        path: &mut Vec<TxnId>,
        on_path: &mut BTreeSet<TxnId>,
    ) -> Option<TxnId> {
        visited.insert(node);
        path.push(node);
        on_path.insert(node);

        if let Some(targets) = self.edges.get(&node) {
            for &next in targets {
                if on_path.contains(&next) {
                    let cycle_start = path.iter().position(|&t| t == next).unwrap();
                    return path[cycle_start..].iter().copied().max();
                }
                if !visited.contains(&next) {
                    if let Some(victim) = self.dfs(next, visited, path, on_path) {
                        return Some(victim);
                    }
                }
            }
        }

        path.pop();
        on_path.remove(&node);
        None
    }
}
