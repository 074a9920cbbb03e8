#![warn(clippy::pedantic)]

/// Handle to a node in a [`LinkageForest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkageNode {
    /// Index of the line in the planner's line list.
    pub line: usize,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Position among the parent's children.
    pub position: usize,
}

/// Arena holding every linkage tree built during a batch. Nodes are never removed; a finished
/// tree is recorded by pushing its root onto the completed list.
#[derive(Debug, Clone, Default)]
pub struct LinkageForest {
    nodes: Vec<LinkageNode>,
    completed: Vec<NodeId>,
}

impl LinkageForest {
    #[must_use]
    pub fn new() -> Self {
        LinkageForest::default()
    }

    pub fn new_tree(&mut self, line: usize) -> NodeId {
        self.nodes.push(LinkageNode {
            line,
            parent: None,
            children: Vec::new(),
            position: 0,
        });
        NodeId(self.nodes.len() - 1)
    }

    #[inline]
    #[must_use]
    pub fn node(&self, id: NodeId) -> &LinkageNode {
        &self.nodes[id.0]
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn completed(&self) -> &[NodeId] {
        &self.completed
    }

    /// Archive the tree containing `id`.
    pub fn complete(&mut self, id: NodeId) {
        let root = self.root_of(id);
        if !self.completed.contains(&root) {
            self.completed.push(root);
        }
    }

    #[must_use]
    pub fn root_of(&self, mut id: NodeId) -> NodeId {
        while let Some(parent) = self.node(id).parent {
            id = parent;
        }
        id
    }

    /// Attach `line` as a child of `parent`.
    ///
    /// Rejected when `parent` already has that child, or when it appears among the parent's
    /// siblings at or after the parent's own position.
    pub fn attach(&mut self, parent: NodeId, line: usize) -> Option<NodeId> {
        let node = self.node(parent);
        if node.children.iter().any(|&c| self.node(c).line == line) {
            return None;
        }
        if let Some(grandparent) = node.parent {
            let siblings = &self.node(grandparent).children;
            if siblings
                .iter()
                .skip(node.position)
                .any(|&s| self.node(s).line == line)
            {
                return None;
            }
        }

        let position = self.node(parent).children.len();
        self.nodes.push(LinkageNode {
            line,
            parent: Some(parent),
            children: Vec::new(),
            position,
        });
        let id = NodeId(self.nodes.len() - 1);
        self.nodes[parent.0].children.push(id);
        Some(id)
    }

    /// Search the tree under `root`, depth first, for a node measuring `parent_line` and attach
    /// `child_line` beneath it. Returns whether the pair belongs to this tree, which is also the
    /// case when the attach is rejected as a duplicate.
    pub fn add_child_to_tree(
        &mut self,
        root: NodeId,
        parent_line: usize,
        child_line: usize,
    ) -> bool {
        match self.find(root, parent_line) {
            Some(node) => {
                self.attach(node, child_line);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn find(&self, root: NodeId, line: usize) -> Option<NodeId> {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let node = self.node(id);
            if node.line == line {
                return Some(id);
            }
            stack.extend(node.children.iter().rev());
        }
        None
    }

    /// Lines of the tree under `root` in depth-first order.
    #[must_use]
    pub fn lines(&self, root: NodeId) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let node = self.node(id);
            out.push(node.line);
            stack.extend(node.children.iter().rev());
        }
        out
    }

    /// True when no node holds two children for the same line.
    #[must_use]
    pub fn children_unique(&self) -> bool {
        self.nodes.iter().all(|n| {
            let mut lines: Vec<usize> = n.children.iter().map(|&c| self.node(c).line).collect();
            let count = lines.len();
            lines.sort_unstable();
            lines.dedup();
            lines.len() == count
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_and_walks_tree() {
        let mut forest = LinkageForest::new();
        let root = forest.new_tree(0);
        let a = forest.attach(root, 2).unwrap();
        let b = forest.attach(root, 3).unwrap();
        forest.attach(a, 4).unwrap();
        assert_eq!(forest.node(b).position, 1);
        assert_eq!(forest.root_of(b), root);
        assert_eq!(forest.lines(root), vec![0, 2, 4, 3]);
        assert_eq!(forest.find(root, 4).map(|id| forest.node(id).line), Some(4));
        assert_eq!(forest.find(root, 9), None);
    }

    #[test]
    fn rejects_duplicate_children() {
        let mut forest = LinkageForest::new();
        let root = forest.new_tree(0);
        assert!(forest.attach(root, 1).is_some());
        assert!(forest.attach(root, 1).is_none());
        assert_eq!(forest.node(root).children.len(), 1);
        assert!(forest.children_unique());
    }

    #[test]
    fn sibling_check_starts_at_own_position() {
        let mut forest = LinkageForest::new();
        let root = forest.new_tree(0);
        let first = forest.attach(root, 1).unwrap();
        let second = forest.attach(root, 2).unwrap();
        forest.attach(root, 5).unwrap();
        // 5 is a later sibling of `first`, so it is rejected there
        assert!(forest.attach(first, 5).is_none());
        // 1 sits before `second`'s position and is not seen
        forest.attach(root, 6).unwrap();
        assert!(forest.attach(second, 6).is_none());
        assert!(forest.attach(second, 1).is_some());
        assert!(forest.children_unique());
    }

    #[test]
    fn add_child_to_tree_matches_parent_line() {
        let mut forest = LinkageForest::new();
        let root = forest.new_tree(1);
        forest.attach(root, 2).unwrap();
        forest.complete(root);
        assert!(forest.add_child_to_tree(root, 2, 4));
        assert_eq!(forest.lines(root), vec![1, 2, 4]);
        assert!(!forest.add_child_to_tree(root, 3, 4));
        // already present still counts as belonging
        assert!(forest.add_child_to_tree(root, 2, 4));
        assert_eq!(forest.len(), 3);
        forest.complete(root);
        assert_eq!(forest.completed(), &[root]);
    }
}
