//! Directed acyclic dependency graph over model names.
//!
//! Built once per planning session. Every traversal goes through
//! topological levels or explicit BFS, never unbounded recursion.

use std::collections::{BTreeSet, HashMap, VecDeque};

use indexmap::IndexMap;

use crate::errors::{StrataError, StrataResult};

static NO_EDGES: BTreeSet<String> = BTreeSet::new();

#[derive(Debug, Clone, Default)]
pub struct Dag {
    upstream: IndexMap<String, BTreeSet<String>>,
    downstream: HashMap<String, BTreeSet<String>>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `node` with its direct dependencies. Dependencies that are not yet
    /// nodes are registered as roots.
    pub fn add<I, S>(&mut self, node: &str, deps: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let deps: BTreeSet<String> = deps.into_iter().map(|d| d.as_ref().to_string()).collect();
        for dep in &deps {
            self.upstream.entry(dep.clone()).or_default();
            self.downstream
                .entry(dep.clone())
                .or_default()
                .insert(node.to_string());
        }
        self.upstream.entry(node.to_string()).or_default().extend(deps);
    }

    pub fn contains(&self, node: &str) -> bool {
        self.upstream.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.upstream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstream.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &String> {
        self.upstream.keys()
    }

    /// Direct dependencies of `node`.
    pub fn parents(&self, node: &str) -> &BTreeSet<String> {
        self.upstream.get(node).unwrap_or(&NO_EDGES)
    }

    /// Direct dependents of `node`.
    pub fn children(&self, node: &str) -> &BTreeSet<String> {
        self.downstream.get(node).unwrap_or(&NO_EDGES)
    }

    /// Nodes grouped so every node's dependencies sit in an earlier level.
    /// Each level is sorted by name.
    pub fn levels(&self) -> StrataResult<Vec<Vec<String>>> {
        let mut in_degree: HashMap<&str, usize> = self
            .upstream
            .iter()
            .map(|(node, deps)| (node.as_str(), deps.len()))
            .collect();

        let mut current: Vec<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(node, _)| *node)
            .collect();
        current.sort_unstable();

        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut placed = 0usize;
        while !current.is_empty() {
            let mut next: Vec<&str> = Vec::new();
            for node in &current {
                for child in self.children(node) {
                    if let Some(degree) = in_degree.get_mut(child.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(child.as_str());
                        }
                    }
                }
            }
            placed += current.len();
            levels.push(current.iter().map(|n| n.to_string()).collect());
            next.sort_unstable();
            current = next;
        }

        if placed != self.upstream.len() {
            let mut cyclic: Vec<String> = in_degree
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(node, _)| node.to_string())
                .collect();
            cyclic.sort();
            return Err(StrataError::CyclicDependency(cyclic));
        }
        Ok(levels)
    }

    /// Topological order, upstream first, ties broken by name.
    pub fn sorted(&self) -> StrataResult<Vec<String>> {
        Ok(self.levels()?.into_iter().flatten().collect())
    }

    fn walk(&self, start: &str, towards_children: bool) -> BTreeSet<String> {
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(start);
        while let Some(current) = queue.pop_front() {
            let edges = if towards_children {
                self.children(current)
            } else {
                self.parents(current)
            };
            for next in edges {
                if visited.insert(next.clone()) {
                    queue.push_back(next.as_str());
                }
            }
        }
        visited.remove(start);
        visited
    }

    /// All transitive dependencies of `node`.
    pub fn upstream(&self, node: &str) -> BTreeSet<String> {
        self.walk(node, false)
    }

    /// All transitive dependents of `node`.
    pub fn downstream(&self, node: &str) -> BTreeSet<String> {
        self.walk(node, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> Dag {
        let mut dag = Dag::new();
        dag.add("a", Vec::<String>::new());
        dag.add("b", ["a"]);
        dag.add("c", ["a"]);
        dag.add("d", ["b", "c"]);
        dag
    }

    #[test]
    fn test_levels_group_independent_nodes() {
        let levels = diamond().levels().unwrap();
        assert_eq!(
            levels,
            vec![
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()],
                vec!["d".to_string()],
            ]
        );
    }

    #[test]
    fn test_sorted_is_deterministic() {
        let mut dag = Dag::new();
        dag.add("z", ["m"]);
        dag.add("y", ["m"]);
        dag.add("m", Vec::<String>::new());
        assert_eq!(dag.sorted().unwrap(), vec!["m", "y", "z"]);
    }

    #[test]
    fn test_transitive_walks() {
        let dag = diamond();
        assert_eq!(
            dag.downstream("a"),
            ["b", "c", "d"].iter().map(|s| s.to_string()).collect::<BTreeSet<String>>()
        );
        assert_eq!(
            dag.upstream("d"),
            ["a", "b", "c"].iter().map(|s| s.to_string()).collect::<BTreeSet<String>>()
        );
        assert!(dag.downstream("d").is_empty());
        assert!(dag.parents("missing").is_empty());
    }

    #[test]
    fn test_unknown_dependencies_become_roots() {
        let mut dag = Dag::new();
        dag.add("child", ["external"]);
        assert!(dag.contains("external"));
        assert_eq!(dag.sorted().unwrap(), vec!["external", "child"]);
    }

    #[test]
    fn test_cycle_detected() {
        let mut dag = Dag::new();
        dag.add("a", ["c"]);
        dag.add("b", ["a"]);
        dag.add("c", ["b"]);
        dag.add("root", Vec::<String>::new());
        match dag.sorted() {
            Err(StrataError::CyclicDependency(nodes)) => {
                assert_eq!(nodes, vec!["a", "b", "c"]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }
}
