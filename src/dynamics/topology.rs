//! Classifies joints as lying within a closed kinematic loop.
//!
//! Bodies are nodes and joints are edges of a multigraph. Ground and every
//! non-dynamic body collapse into a single ground node, since none of them
//! can move in response to constraint forces. A joint is within a loop
//! exactly when its edge is not a bridge.

use std::collections::HashMap;

use super::joint::Joint;
use crate::{
    core::entity::EntitySet,
    utils::allocator::{Arena, EntityId, JointId},
};

const GROUND: usize = 0;

#[derive(Debug, Clone, Default)]
pub struct KinematicTopology {
    within_loop: HashMap<JointId, bool>,
}

impl KinematicTopology {
    pub fn build(joints: &Arena<Joint, JointId>, entities: &EntitySet) -> Self {
        let mut nodes: HashMap<EntityId, usize> = HashMap::new();
        let mut node_of = |body: Option<EntityId>| -> usize {
            match body {
                Some(id) if entities.get(id).is_some_and(|e| e.flags.dynamic) => {
                    let next = nodes.len() + 1;
                    *nodes.entry(id).or_insert(next)
                }
                _ => GROUND,
            }
        };

        let mut ids = Vec::with_capacity(joints.len());
        let mut edges = Vec::with_capacity(joints.len());
        for (id, joint) in joints.iter() {
            ids.push(id);
            edges.push((node_of(Some(joint.body_a())), node_of(joint.body_b())));
        }

        let bridges = find_bridges(nodes.len() + 1, &edges);
        let within_loop = ids
            .into_iter()
            .zip(bridges)
            .map(|(id, bridge)| (id, !bridge))
            .collect();
        Self { within_loop }
    }

    /// `None` for joints unknown at the last rebuild.
    pub fn within_loop(&self, joint: JointId) -> Option<bool> {
        self.within_loop.get(&joint).copied()
    }

    pub fn loop_joints(&self) -> impl Iterator<Item = JointId> + '_ {
        self.within_loop
            .iter()
            .filter(|(_, in_loop)| **in_loop)
            .map(|(id, _)| *id)
    }
}

/// Marks the bridges of an undirected multigraph with an iterative
/// Tarjan low-link search. Parallel edges and self loops are never bridges.
fn find_bridges(num_nodes: usize, edges: &[(usize, usize)]) -> Vec<bool> {
    let mut adjacency = vec![Vec::new(); num_nodes];
    for (e, &(u, v)) in edges.iter().enumerate() {
        adjacency[u].push((v, e));
        adjacency[v].push((u, e));
    }

    let mut bridge = vec![false; edges.len()];
    let mut disc = vec![usize::MAX; num_nodes];
    let mut low = vec![0; num_nodes];
    let mut timer = 0;

    for root in 0..num_nodes {
        if disc[root] != usize::MAX {
            continue;
        }
        disc[root] = timer;
        low[root] = timer;
        timer += 1;
        // (node, edge used to enter it, next adjacency slot)
        let mut stack: Vec<(usize, Option<usize>, usize)> = vec![(root, None, 0)];
        while let Some(top) = stack.len().checked_sub(1) {
            let (u, parent_edge, next) = stack[top];
            if let Some(&(v, e)) = adjacency[u].get(next) {
                stack[top].2 += 1;
                if Some(e) == parent_edge {
                    continue;
                }
                if disc[v] == usize::MAX {
                    disc[v] = timer;
                    low[v] = timer;
                    timer += 1;
                    stack.push((v, Some(e), 0));
                } else {
                    low[u] = low[u].min(disc[v]);
                }
            } else {
                stack.pop();
                if let (Some(e), Some(&(p, _, _))) = (parent_edge, stack.last()) {
                    low[p] = low[p].min(low[u]);
                    if low[u] > disc[p] {
                        bridge[e] = true;
                    }
                }
            }
        }
    }
    bridge
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_edges_are_bridges() {
        assert_eq!(find_bridges(4, &[(0, 1), (1, 2), (2, 3)]), vec![true; 3]);
    }

    #[test]
    fn cycle_edges_are_not_bridges() {
        let edges = [(0, 1), (1, 2), (2, 0), (2, 3)];
        assert_eq!(find_bridges(4, &edges), vec![false, false, false, true]);
    }

    #[test]
    fn parallel_edges_and_self_loops_close_loops() {
        assert_eq!(find_bridges(2, &[(0, 1), (0, 1)]), vec![false, false]);
        assert_eq!(find_bridges(2, &[(1, 1), (0, 1)]), vec![false, true]);
    }
}
