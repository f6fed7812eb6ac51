//! Linearisation of configured hooks.
//!
//! Nodes are kept in priority order: highest priority first, ties in reverse insertion order,
//! nodes without a priority last in insertion order. Before/after constraints become edges, and
//! a depth-first walk over the priority-ordered nodes emits every node after the nodes that must
//! precede it.

use std::hash::Hash;

use log::warn;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{manager::DetourConfig, Error, Result};

/// A dependency graph over hook configurations, keyed by `K`.
///
/// # Examples
///
/// ```rust
/// use detourcore::manager::{DepGraph, DetourConfig};
///
/// let mut graph = DepGraph::new();
/// graph.insert(1, DetourConfig::new("A"))?;
/// graph.insert(2, DetourConfig::new("B").with_after(["A"]))?;
/// graph.insert(3, DetourConfig::new("C").with_before(["A"]))?;
///
/// assert_eq!(graph.order(), [3, 1, 2]);
/// # Ok::<(), detourcore::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct DepGraph<K> {
    nodes: Vec<K>,
    configs: FxHashMap<K, DetourConfig>,
    before_this: FxHashMap<K, Vec<K>>,
    order: Vec<K>,
}

impl<K: Copy + Eq + Hash> Default for DepGraph<K> {
    fn default() -> Self {
        DepGraph {
            nodes: Vec::new(),
            configs: FxHashMap::default(),
            before_this: FxHashMap::default(),
            order: Vec::new(),
        }
    }
}

impl<K: Copy + Eq + Hash> DepGraph<K> {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// `true` without nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// `true` if `key` is in the graph.
    #[must_use]
    pub fn contains(&self, key: K) -> bool {
        self.configs.contains_key(&key)
    }

    /// The configuration of `key`.
    #[must_use]
    pub fn config(&self, key: K) -> Option<&DetourConfig> {
        self.configs.get(&key)
    }

    /// The linear order, first-called first.
    #[must_use]
    pub fn order(&self) -> &[K] {
        &self.order
    }

    /// Inserts `key` and relinearises.
    ///
    /// A node declaring both before and after the same peer runs before it; the conflict is
    /// logged.
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] if `key` is already present, and
    /// [`Error::DependencyCycle`] if the node closes a cycle; the graph is then left as it was.
    pub fn insert(&mut self, key: K, config: DetourConfig) -> Result<()> {
        if self.contains(key) {
            return Err(Error::InvalidState(format!(
                "Detour '{}' is already in the graph",
                config.id()
            )));
        }

        let mut insert_at = None;
        // (later, earlier)
        let mut edges = Vec::new();
        for (index, &current) in self.nodes.iter().enumerate() {
            let Some(current_config) = self.configs.get(&current) else {
                continue;
            };

            if insert_at.is_none() {
                if let Some(priority) = config.priority() {
                    match current_config.priority() {
                        Some(current_priority) if priority >= current_priority => {
                            insert_at = Some(index);
                        }
                        None => insert_at = Some(index),
                        _ => {}
                    }
                }
            }

            let id = current_config.id();
            let mut is_before = false;
            let mut is_after = false;
            if config.runs_before(id) {
                edges.push((current, key));
                is_before = true;
            }
            if config.runs_after(id) {
                if is_before {
                    warn_conflict(config.id(), id);
                } else {
                    edges.push((key, current));
                    is_after = true;
                }
            }
            if current_config.runs_before(config.id()) {
                if is_before {
                    warn_conflict(config.id(), id);
                } else {
                    edges.push((key, current));
                    is_after = true;
                }
            }
            if current_config.runs_after(config.id()) {
                if is_after {
                    warn_conflict(config.id(), id);
                } else {
                    edges.push((current, key));
                }
            }
        }

        let insert_at = match insert_at {
            Some(mut index) => {
                while index < self.nodes.len() {
                    let current = &self.configs[&self.nodes[index]];
                    if current.priority() != config.priority()
                        || current.sub_priority() <= config.sub_priority()
                    {
                        break;
                    }
                    index += 1;
                }
                index
            }
            None => self.nodes.len(),
        };

        self.nodes.insert(insert_at, key);
        self.configs.insert(key, config);
        for (later, earlier) in edges {
            self.link(later, earlier);
        }

        match self.linearize() {
            Ok(order) => {
                self.order = order;
                Ok(())
            }
            Err(e) => {
                self.detach(key);
                Err(e)
            }
        }
    }

    /// Removes `key` and relinearises. Returns `false` if it was not present.
    pub fn remove(&mut self, key: K) -> bool {
        if !self.contains(key) {
            return false;
        }
        self.detach(key);
        true
    }

    /// Takes `key` out of every structure and relinearises.
    fn detach(&mut self, key: K) {
        self.nodes.retain(|node| *node != key);
        self.configs.remove(&key);
        self.before_this.remove(&key);
        for predecessors in self.before_this.values_mut() {
            predecessors.retain(|node| *node != key);
        }

        // Removing a node cannot introduce a cycle
        match self.linearize() {
            Ok(order) => self.order = order,
            Err(_) => self.order.retain(|node| *node != key),
        }
    }

    /// Records that `earlier` must run before `later`, keeping the predecessor list in priority
    /// order.
    fn link(&mut self, later: K, earlier: K) {
        let Some(earlier_config) = self.configs.get(&earlier) else {
            return;
        };
        let earlier_priority = earlier_config.priority();
        let earlier_sub_priority = earlier_config.sub_priority();
        let configs = &self.configs;
        let list = self.before_this.entry(later).or_default();

        let Some(priority) = earlier_priority else {
            list.push(earlier);
            return;
        };

        let mut index = list
            .iter()
            .position(|node| {
                configs
                    .get(node)
                    .and_then(DetourConfig::priority)
                    .map_or(true, |current| priority >= current)
            })
            .unwrap_or(list.len());

        while index < list.len() {
            match configs.get(&list[index]) {
                Some(current)
                    if current.priority() == earlier_priority
                        && current.sub_priority() > earlier_sub_priority =>
                {
                    index += 1;
                }
                _ => break,
            }
        }
        list.insert(index, earlier);
    }

    fn linearize(&self) -> Result<Vec<K>> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut visiting = FxHashSet::default();
        let mut visited = FxHashSet::default();
        for &node in &self.nodes {
            self.visit(node, &mut visiting, &mut visited, &mut order)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        node: K,
        visiting: &mut FxHashSet<K>,
        visited: &mut FxHashSet<K>,
        order: &mut Vec<K>,
    ) -> Result<()> {
        if visited.contains(&node) {
            return Ok(());
        }
        if !visiting.insert(node) {
            let id = self.configs.get(&node).map_or("?", DetourConfig::id);
            return Err(Error::DependencyCycle(format!(
                "Ordering constraints form a cycle through '{id}'"
            )));
        }

        if let Some(predecessors) = self.before_this.get(&node) {
            for &earlier in predecessors {
                self.visit(earlier, visiting, visited, order)?;
            }
        }

        visiting.remove(&node);
        visited.insert(node);
        order.push(node);
        Ok(())
    }
}

fn warn_conflict(id: &str, peer: &str) {
    warn!("Detour '{id}' is marked as being both before and after '{peer}'");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn before_and_after() {
        let mut graph = DepGraph::new();
        graph.insert(1, DetourConfig::new("A")).unwrap();
        graph
            .insert(2, DetourConfig::new("B").with_after(["A"]))
            .unwrap();
        graph
            .insert(3, DetourConfig::new("C").with_before(["A"]))
            .unwrap();
        assert_eq!(graph.order(), [3, 1, 2]);

        assert!(graph.remove(1));
        assert!(!graph.remove(1));
        assert_eq!(graph.order(), [2, 3]);
    }

    #[test]
    fn priorities_descend_with_newest_first() {
        let mut graph = DepGraph::new();
        for (key, priority) in [(1, 0), (2, 5), (3, 0), (4, -2), (5, 5)] {
            graph
                .insert(key, DetourConfig::new(format!("n{key}")).with_priority(priority))
                .unwrap();
        }
        graph.insert(6, DetourConfig::new("unprioritised")).unwrap();
        assert_eq!(graph.order(), [5, 2, 3, 1, 4, 6]);
    }

    #[test]
    fn sub_priority_orders_equal_priorities() {
        let mut graph = DepGraph::new();
        graph
            .insert(1, DetourConfig::new("a").with_priority(1).with_sub_priority(9))
            .unwrap();
        graph
            .insert(2, DetourConfig::new("b").with_priority(1))
            .unwrap();
        assert_eq!(graph.order(), [1, 2]);
    }

    #[test]
    fn cycle_restores_graph() {
        let mut graph = DepGraph::new();
        graph
            .insert(1, DetourConfig::new("A").with_before(["B"]))
            .unwrap();
        graph
            .insert(2, DetourConfig::new("B").with_before(["C"]))
            .unwrap();
        let before = graph.order().to_vec();

        let result = graph.insert(3, DetourConfig::new("C").with_before(["A"]));
        assert!(matches!(result, Err(Error::DependencyCycle(_))));
        assert_eq!(graph.order(), before.as_slice());
        assert!(!graph.contains(3));
        assert_eq!(graph.len(), 2);

        graph.insert(3, DetourConfig::new("C")).unwrap();
        assert_eq!(graph.order(), [1, 2, 3]);
    }

    #[test]
    fn conflicting_constraints_prefer_before() {
        let mut graph = DepGraph::new();
        graph.insert(1, DetourConfig::new("A")).unwrap();
        graph
            .insert(
                2,
                DetourConfig::new("B").with_before(["A"]).with_after(["A"]),
            )
            .unwrap();
        assert_eq!(graph.order(), [2, 1]);
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let mut graph = DepGraph::new();
        graph.insert(1, DetourConfig::new("A")).unwrap();
        assert!(matches!(
            graph.insert(1, DetourConfig::new("A")),
            Err(Error::InvalidState(_))
        ));
    }
}
