//! Rooted binary tree with branch lengths.
//!
//! Nodes are indexed `0..n_nodes`, tips first, then internal nodes.

use anyhow::{Result, bail};

#[derive(Debug, Clone)]
pub struct Tree {
    n_nodes: usize,
    n_tips: usize,
    parent: Vec<Option<usize>>,
    branch_lengths: Vec<f64>,
    children: Vec<Vec<usize>>,
    root: usize,
}

impl Tree {
    /// Builds a tree from parent indices (`-1` for the root) and the length
    /// of the branch above each node.
    pub fn from_structure(parent_indices: &[i64], branch_lengths: &[f64], n_tips: usize) -> Result<Self> {
        let n_nodes = parent_indices.len();
        if branch_lengths.len() != n_nodes {
            bail!(
                "parent_indices length {} does not match branch_lengths length {}",
                n_nodes,
                branch_lengths.len()
            );
        }
        if n_tips < 2 || n_nodes != 2 * n_tips - 1 {
            bail!("a rooted binary tree with {n_tips} tips needs {} nodes, got {n_nodes}", 2 * n_tips.max(1) - 1);
        }

        let mut parent = vec![None; n_nodes];
        let mut children = vec![Vec::new(); n_nodes];
        let mut root = None;
        for (node, &p) in parent_indices.iter().enumerate() {
            if p < 0 {
                if root.replace(node).is_some() {
                    bail!("more than one root node");
                }
                continue;
            }
            let p = p as usize;
            if p >= n_nodes || p == node {
                bail!("node {node} has invalid parent {p}");
            }
            parent[node] = Some(p);
            children[p].push(node);
        }
        let Some(root) = root else {
            bail!("no root node found (no node with parent index -1)");
        };

        for (node, kids) in children.iter().enumerate() {
            let is_tip = node < n_tips;
            match (is_tip, kids.len()) {
                (true, 0) | (false, 2) => {}
                (true, k) => bail!("tip {node} has {k} children"),
                (false, k) => bail!("internal node {node} has {k} children, expected 2"),
            }
        }
        for (node, &len) in branch_lengths.iter().enumerate() {
            if node != root && !(len >= 0.0 && len.is_finite()) {
                bail!("branch above node {node} has invalid length {len}");
            }
        }

        let tree = Self {
            n_nodes,
            n_tips,
            parent,
            branch_lengths: branch_lengths.to_vec(),
            children,
            root,
        };
        if tree.post_order().len() != n_nodes {
            bail!("tree is not connected");
        }
        Ok(tree)
    }

    pub fn n_nodes(&self) -> usize {
        self.n_nodes
    }

    pub fn n_tips(&self) -> usize {
        self.n_tips
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn is_tip(&self, node: usize) -> bool {
        node < self.n_tips
    }

    pub fn parent(&self, node: usize) -> Option<usize> {
        self.parent[node]
    }

    /// The two children of an internal node.
    pub fn children(&self, node: usize) -> Option<(usize, usize)> {
        match self.children[node].as_slice() {
            [a, b] => Some((*a, *b)),
            _ => None,
        }
    }

    pub fn branch_length(&self, node: usize) -> f64 {
        self.branch_lengths[node]
    }

    pub fn set_branch_length(&mut self, node: usize, length: f64) -> Result<()> {
        if node >= self.n_nodes {
            bail!("node {node} out of range ({} nodes)", self.n_nodes);
        }
        if !(length >= 0.0 && length.is_finite()) {
            bail!("negative or non-finite branch length {length} for node {node}");
        }
        self.branch_lengths[node] = length;
        Ok(())
    }

    /// Children before parents, root last.
    pub fn post_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.n_nodes);
        let mut visited = vec![false; self.n_nodes];
        let mut stack = vec![(self.root, false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
                continue;
            }
            if visited[node] {
                continue;
            }
            visited[node] = true;
            stack.push((node, true));
            for &child in self.children[node].iter().rev() {
                stack.push((child, false));
            }
        }
        order
    }
}
