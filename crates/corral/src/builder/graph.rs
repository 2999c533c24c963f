//
// builder/graph.rs
//
// Import graph between the files of one program
//

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::GraphInvariantError;

/// Forward and backward import edges. The two maps are kept as exact
/// transposes of each other.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Importer -> imported files
    forward: HashMap<PathBuf, BTreeSet<PathBuf>>,
    /// Imported file -> importers
    backward: HashMap<PathBuf, BTreeSet<PathBuf>>,
}

/// Strongly connected components of a graph, in discovery order
#[derive(Debug, Clone, Default)]
pub struct Components {
    pub members: Vec<Vec<PathBuf>>,
    index: HashMap<PathBuf, usize>,
}

impl Components {
    pub fn component_of(&self, path: &Path) -> Option<usize> {
        self.index.get(path).copied()
    }

    /// True when the component is an import cycle
    pub fn is_cycle(&self, component: usize, graph: &DependencyGraph) -> bool {
        match self.members.get(component).map(Vec::as_slice) {
            Some([single]) => graph.get_dependencies(single).contains(&single),
            Some(members) => members.len() > 1,
            None => false,
        }
    }
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the outgoing edges of `from`
    pub fn set_dependencies(&mut self, from: &Path, to: impl IntoIterator<Item = PathBuf>) {
        self.remove_forward_edges(from);
        let targets: BTreeSet<PathBuf> = to.into_iter().collect();
        for target in &targets {
            log::trace!("Adding edge: {} -> {}", from.display(), target.display());
            self.backward
                .entry(target.clone())
                .or_default()
                .insert(from.to_path_buf());
        }
        if !targets.is_empty() {
            self.forward.insert(from.to_path_buf(), targets);
        }
    }

    /// Remove all edges involving a file
    pub fn remove_file(&mut self, path: &Path) {
        self.remove_forward_edges(path);
        self.remove_backward_edges(path);
    }

    pub fn get_dependencies(&self, path: &Path) -> Vec<&PathBuf> {
        self.forward
            .get(path)
            .map(|set| set.iter().collect())
            .unwrap_or_default()
    }

    pub fn get_dependents(&self, path: &Path) -> Vec<&PathBuf> {
        self.backward
            .get(path)
            .map(|set| set.iter().collect())
            .unwrap_or_default()
    }

    /// All files that depend on `path` directly or indirectly
    pub fn get_transitive_dependents(&self, path: &Path) -> Vec<PathBuf> {
        let mut result = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![path.to_path_buf()];
        visited.insert(path.to_path_buf());
        while let Some(current) = stack.pop() {
            for dependent in self.get_dependents(&current) {
                if visited.insert(dependent.clone()) {
                    result.push(dependent.clone());
                    stack.push(dependent.clone());
                }
            }
        }
        result
    }

    pub fn edge_count(&self) -> usize {
        self.forward.values().map(BTreeSet::len).sum()
    }

    /// Check that `forward` and `backward` are transposes
    pub fn verify(&self) -> Result<(), GraphInvariantError> {
        for (from, targets) in &self.forward {
            for to in targets {
                let mirrored = self
                    .backward
                    .get(to)
                    .map(|set| set.contains(from))
                    .unwrap_or(false);
                if !mirrored {
                    return Err(GraphInvariantError {
                        from: from.clone(),
                        to: to.clone(),
                    });
                }
            }
        }
        for (to, sources) in &self.backward {
            for from in sources {
                let mirrored = self
                    .forward
                    .get(from)
                    .map(|set| set.contains(to))
                    .unwrap_or(false);
                if !mirrored {
                    return Err(GraphInvariantError {
                        from: from.clone(),
                        to: to.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Tarjan's algorithm over `nodes`, iterative so deep import chains
    /// cannot overflow the stack.
    pub fn components<'a>(&self, nodes: impl IntoIterator<Item = &'a PathBuf>) -> Components {
        let mut nodes: Vec<&PathBuf> = nodes.into_iter().collect();
        nodes.sort();

        let mut next_index = 0usize;
        let mut index: HashMap<&Path, usize> = HashMap::new();
        let mut lowlink: HashMap<&Path, usize> = HashMap::new();
        let mut on_stack: HashSet<&Path> = HashSet::new();
        let mut stack: Vec<&Path> = Vec::new();
        let mut out = Components::default();

        for root in nodes {
            if index.contains_key(root.as_path()) {
                continue;
            }
            // (node, position in its successor list)
            let mut work: Vec<(&Path, usize)> = vec![(root.as_path(), 0)];
            while let Some((node, child_pos)) = work.pop() {
                if child_pos == 0 {
                    index.insert(node, next_index);
                    lowlink.insert(node, next_index);
                    next_index += 1;
                    stack.push(node);
                    on_stack.insert(node);
                }

                let successors = self.forward.get(node);
                let next_child = successors.and_then(|s| s.iter().nth(child_pos));
                if let Some(child) = next_child {
                    work.push((node, child_pos + 1));
                    let child = child.as_path();
                    if !index.contains_key(child) {
                        work.push((child, 0));
                    } else if on_stack.contains(child) {
                        let low = lowlink[node].min(index[child]);
                        lowlink.insert(node, low);
                    }
                    continue;
                }

                // All successors done: fold lowlink into the parent
                if let Some(&(parent, _)) = work.last() {
                    let low = lowlink[parent].min(lowlink[node]);
                    lowlink.insert(parent, low);
                }

                if lowlink[node] == index[node] {
                    let mut members = Vec::new();
                    while let Some(member) = stack.pop() {
                        on_stack.remove(member);
                        members.push(member.to_path_buf());
                        if member == node {
                            break;
                        }
                    }
                    members.sort();
                    let id = out.members.len();
                    for m in &members {
                        out.index.insert(m.clone(), id);
                    }
                    out.members.push(members);
                }
            }
        }

        out
    }

    /// Human-readable dump of all edges, for logging
    pub fn dump_state(&self) -> String {
        let mut output = format!("Dependency graph ({} edges):\n", self.edge_count());
        let mut importers: Vec<_> = self.forward.keys().collect();
        importers.sort();
        for importer in importers {
            output.push_str(&format!("  {}:\n", importer.display()));
            for target in &self.forward[importer] {
                output.push_str(&format!("    -> {}\n", target.display()));
            }
        }
        output
    }

    #[cfg(test)]
    pub(crate) fn insert_forward_only(&mut self, from: &Path, to: &Path) {
        self.forward
            .entry(from.to_path_buf())
            .or_default()
            .insert(to.to_path_buf());
    }

    fn remove_forward_edges(&mut self, path: &Path) {
        if let Some(targets) = self.forward.remove(path) {
            for target in targets {
                if let Some(sources) = self.backward.get_mut(&target) {
                    sources.remove(path);
                    if sources.is_empty() {
                        self.backward.remove(&target);
                    }
                }
            }
        }
    }

    fn remove_backward_edges(&mut self, path: &Path) {
        if let Some(sources) = self.backward.remove(path) {
            for source in sources {
                if let Some(targets) = self.forward.get_mut(&source) {
                    targets.remove(path);
                    if targets.is_empty() {
                        self.forward.remove(&source);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn p(name: &str) -> PathBuf {
        PathBuf::from(format!("/w/{}.lm", name))
    }

    #[test]
    fn test_edges_are_symmetric() {
        let mut graph = DependencyGraph::new();
        graph.set_dependencies(&p("a"), vec![p("b"), p("c")]);
        graph.set_dependencies(&p("b"), vec![p("c")]);

        assert_eq!(graph.get_dependents(&p("c")), vec![&p("a"), &p("b")]);
        assert!(graph.verify().is_ok());

        graph.set_dependencies(&p("a"), vec![p("b")]);
        assert_eq!(graph.get_dependents(&p("c")), vec![&p("b")]);
        assert!(graph.verify().is_ok());
    }

    #[test]
    fn test_remove_file_drops_both_directions() {
        let mut graph = DependencyGraph::new();
        graph.set_dependencies(&p("a"), vec![p("b")]);
        graph.set_dependencies(&p("b"), vec![p("c")]);
        graph.remove_file(&p("b"));

        assert!(graph.get_dependencies(&p("a")).is_empty());
        assert!(graph.get_dependents(&p("c")).is_empty());
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.verify().is_ok());
    }

    #[test]
    fn test_transitive_dependents_terminate_on_cycle() {
        let mut graph = DependencyGraph::new();
        graph.set_dependencies(&p("a"), vec![p("b")]);
        graph.set_dependencies(&p("b"), vec![p("c")]);
        graph.set_dependencies(&p("c"), vec![p("a")]);

        let mut deps = graph.get_transitive_dependents(&p("a"));
        deps.sort();
        assert_eq!(deps, vec![p("b"), p("c")]);
    }

    #[test]
    fn test_verify_detects_asymmetry() {
        let mut graph = DependencyGraph::new();
        graph.set_dependencies(&p("a"), vec![p("b")]);
        graph.insert_forward_only(&p("a"), &p("z"));
        let err = graph.verify().unwrap_err();
        assert_eq!(err.to, p("z"));
    }

    #[test]
    fn test_components() {
        let mut graph = DependencyGraph::new();
        graph.set_dependencies(&p("a"), vec![p("b")]);
        graph.set_dependencies(&p("b"), vec![p("c")]);
        graph.set_dependencies(&p("c"), vec![p("b"), p("d")]);
        graph.set_dependencies(&p("e"), vec![p("e")]);
        let nodes = vec![p("a"), p("b"), p("c"), p("d"), p("e")];
        let comps = graph.components(&nodes);

        let bc = comps.component_of(&p("b")).unwrap();
        assert_eq!(comps.component_of(&p("c")), Some(bc));
        assert_ne!(comps.component_of(&p("a")), Some(bc));
        assert!(comps.is_cycle(bc, &graph));
        assert!(!comps.is_cycle(comps.component_of(&p("d")).unwrap(), &graph));
        assert!(comps.is_cycle(comps.component_of(&p("e")).unwrap(), &graph));
        assert_eq!(comps.members.len(), 4);
    }

    proptest! {
        #[test]
        fn prop_symmetry_survives_arbitrary_updates(
            ops in prop::collection::vec((0usize..6, prop::collection::vec(0usize..6, 0..4), any::<bool>()), 1..40)
        ) {
            let mut graph = DependencyGraph::new();
            for (from, targets, remove) in ops {
                let from = p(&from.to_string());
                if remove {
                    graph.remove_file(&from);
                } else {
                    graph.set_dependencies(&from, targets.into_iter().map(|t| p(&t.to_string())));
                }
                prop_assert!(graph.verify().is_ok());
            }
        }

        #[test]
        fn prop_components_partition_nodes(
            edges in prop::collection::vec((0usize..8, 0usize..8), 0..30)
        ) {
            let mut graph = DependencyGraph::new();
            let mut adjacency: HashMap<usize, Vec<PathBuf>> = HashMap::new();
            for (a, b) in edges {
                adjacency.entry(a).or_default().push(p(&b.to_string()));
            }
            for (a, targets) in adjacency {
                graph.set_dependencies(&p(&a.to_string()), targets);
            }
            let nodes: Vec<PathBuf> = (0..8).map(|i| p(&i.to_string())).collect();
            let comps = graph.components(&nodes);
            let total: usize = comps.members.iter().map(Vec::len).sum();
            prop_assert_eq!(total, nodes.len());
            for node in &nodes {
                prop_assert!(comps.component_of(node).is_some());
            }
        }
    }
}
