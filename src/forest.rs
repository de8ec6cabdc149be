//! Observation trees as cluster trees over the shared taxon universe.
//!
//! # Overview
//! An [`ObservationTree`] captures the topology of one input tree together with
//! the cluster (bit-vector of taxon ids) below every node. It is built once from
//! a `phylotree` tree and is then read-only, so the forest can be shared across
//! threads while the similarity matrix is populated.
//!
//! ```text
//!           root              node clusters (A=0, B=1, C=2, D=3)
//!          /    \             node1: {A,B} → 0b0011
//!      node1    node2         node2: {C,D} → 0b1100
//!      /   \    /   \         root : {A,B,C,D} (the tree's "all" cluster)
//!     A     B  C     D
//! ```
//!
//! Trees may cover only part of the universe. [`ObservationTree::complete`]
//! grafts the missing taxa using a [`SimilarityMatrix`] so that every
//! bipartition of the tree becomes a bipartition of the whole universe.

use std::collections::HashMap;

use phylotree::tree::Tree as PhyloTree;
use tracing::debug;

use crate::cluster::Cluster;
use crate::error::SolverError;
use crate::similarity::SimilarityMatrix;
use crate::taxa::TaxonIdentifier;

/// One node of an [`ObservationTree`].
#[derive(Debug, Clone)]
pub struct TreeNode {
    pub children: Vec<usize>,
    /// Taxon id for leaves, `None` for internal nodes
    pub taxon: Option<usize>,
    /// Taxa below this node
    pub cluster: Cluster,
}

impl TreeNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// An immutable observation tree labelled over a subset of the universe.
#[derive(Debug, Clone)]
pub struct ObservationTree {
    nodes: Vec<TreeNode>,
    root: usize,
    universe: usize,
}

impl ObservationTree {
    /// Extract an observation tree from a phylogenetic tree.
    ///
    /// # Algorithm
    /// 1. Map every leaf name to its id through `taxa`
    /// 2. DFS from the root, building clusters bottom-up
    /// 3. Internal nodes OR their child clusters; nodes with a single child are
    ///    collapsed into that child
    ///
    /// # Errors
    /// Returns [`SolverError::UnnamedLeaf`] or [`SolverError::UnknownTaxon`] for
    /// leaves that cannot be mapped, and `TreeError` for malformed trees.
    pub fn from_tree(tree: &PhyloTree, taxa: &TaxonIdentifier) -> Result<Self, SolverError> {
        let root_id = tree.get_root()?;
        let mut out = ObservationTree { nodes: Vec::new(), root: 0, universe: taxa.taxon_count() };
        let mut cache: HashMap<usize, usize> = HashMap::new();
        out.root = out.copy_subtree(root_id, tree, taxa, &mut cache)?;
        Ok(out)
    }

    /// Parse a newick string and extract its observation tree.
    pub fn from_newick(newick: &str, taxa: &TaxonIdentifier) -> Result<Self, SolverError> {
        let tree = PhyloTree::from_newick(newick)
            .map_err(|e| SolverError::Newick { index: 0, message: e.to_string() })?;
        Self::from_tree(&tree, taxa)
    }

    /// Recursively copy the subtree below `node_id`, returning the new node index.
    fn copy_subtree(
        &mut self,
        node_id: usize,
        tree: &PhyloTree,
        taxa: &TaxonIdentifier,
        cache: &mut HashMap<usize, usize>,
    ) -> Result<usize, SolverError> {
        if let Some(&idx) = cache.get(&node_id) {
            return Ok(idx);
        }
        let node = tree.get(&node_id)?;

        // Base case: leaf node
        if node.children.is_empty() {
            let name = node.name.as_deref().ok_or(SolverError::UnnamedLeaf)?;
            let taxon = taxa.require_id(name)?;
            let idx = self.push_leaf(taxon);
            cache.insert(node_id, idx);
            return Ok(idx);
        }

        // Unary nodes do not define a split of their own
        if node.children.len() == 1 {
            let idx = self.copy_subtree(node.children[0], tree, taxa, cache)?;
            cache.insert(node_id, idx);
            return Ok(idx);
        }

        let mut children = Vec::with_capacity(node.children.len());
        for &child_id in &node.children {
            children.push(self.copy_subtree(child_id, tree, taxa, cache)?);
        }
        let idx = self.push_internal(children);
        cache.insert(node_id, idx);
        Ok(idx)
    }

    fn push_leaf(&mut self, taxon: usize) -> usize {
        self.nodes.push(TreeNode {
            children: Vec::new(),
            taxon: Some(taxon),
            cluster: Cluster::singleton(self.universe, taxon),
        });
        self.nodes.len() - 1
    }

    fn push_internal(&mut self, children: Vec<usize>) -> usize {
        let mut cluster = Cluster::empty(self.universe);
        for &c in &children {
            cluster.or_assign(&self.nodes[c].cluster);
        }
        self.nodes.push(TreeNode { children, taxon: None, cluster });
        self.nodes.len() - 1
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn node(&self, idx: usize) -> &TreeNode {
        &self.nodes[idx]
    }

    pub fn universe(&self) -> usize {
        self.universe
    }

    /// Taxa present in this tree.
    pub fn tree_all(&self) -> &Cluster {
        &self.nodes[self.root].cluster
    }

    pub fn leaf_count(&self) -> usize {
        self.tree_all().size()
    }

    pub fn is_complete(&self) -> bool {
        self.leaf_count() == self.universe
    }

    /// Node indices in post-order (children before parents).
    pub fn postorder(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(self.root, false)];
        while let Some((idx, expanded)) = stack.pop() {
            if expanded {
                order.push(idx);
                continue;
            }
            stack.push((idx, true));
            for &c in self.nodes[idx].children.iter().rev() {
                stack.push((c, false));
            }
        }
        order
    }

    /// Every node cluster in post-order, leaves and root included.
    pub fn clusters(&self) -> impl Iterator<Item = &Cluster> + '_ {
        self.postorder().into_iter().map(move |idx| &self.nodes[idx].cluster)
    }

    pub fn has_polytomy(&self) -> bool {
        self.nodes.iter().any(|n| n.children.len() > 2)
    }

    /// The sides of each polytomy: the child clusters plus the rest of the
    /// universe when it is non-empty (which unroots the polytomy).
    pub fn polytomies(&self) -> Vec<Vec<Cluster>> {
        let all = Cluster::full(self.universe);
        self.postorder()
            .into_iter()
            .filter(|&idx| self.nodes[idx].children.len() > 2)
            .map(|idx| {
                let node = &self.nodes[idx];
                let mut sides: Vec<Cluster> =
                    node.children.iter().map(|&c| self.nodes[c].cluster.clone()).collect();
                let rest = node.cluster.complement_within(&all);
                if !rest.is_empty() {
                    sides.push(rest);
                }
                sides
            })
            .collect()
    }

    /// For each internal node, the clusters on each side of it: children plus
    /// the remainder of the tree's taxa when non-empty.
    pub fn node_sides(&self) -> Vec<Vec<Cluster>> {
        let all = self.tree_all();
        self.postorder()
            .into_iter()
            .filter(|&idx| !self.nodes[idx].is_leaf())
            .map(|idx| {
                let node = &self.nodes[idx];
                let mut sides: Vec<Cluster> =
                    node.children.iter().map(|&c| self.nodes[c].cluster.clone()).collect();
                let rest = node.cluster.complement_within(all);
                if !rest.is_empty() {
                    sides.push(rest);
                }
                sides
            })
            .collect()
    }

    /// Leftmost leaf below `idx`.
    pub fn leftmost_taxon(&self, mut idx: usize) -> Option<usize> {
        while let Some(&first) = self.nodes[idx].children.first() {
            idx = first;
        }
        self.nodes[idx].taxon
    }

    /// Render as newick using taxon names.
    pub fn to_newick(&self, taxa: &TaxonIdentifier) -> String {
        let mut out = String::new();
        self.write_newick(self.root, taxa, &mut out);
        out.push(';');
        out
    }

    fn write_newick(&self, idx: usize, taxa: &TaxonIdentifier, out: &mut String) {
        let node = &self.nodes[idx];
        if let Some(t) = node.taxon {
            out.push_str(taxa.taxon_name(t));
            return;
        }
        out.push('(');
        for (k, &c) in node.children.iter().enumerate() {
            if k > 0 {
                out.push(',');
            }
            self.write_newick(c, taxa, out);
        }
        out.push(')');
    }

    /// Completes a tree that misses some taxa of the universe.
    ///
    /// # Algorithm
    /// Missing taxa are added one at a time in increasing id order:
    /// 1. Find the closest taxon that is present (or already added)
    /// 2. Orient the tree away from that leaf and walk into it: at each internal
    ///    node compare the closest taxon with the leftmost leaves of the first
    ///    two children using the four-point test and follow the winning child
    /// 3. Stop when the closest taxon wins (or a leaf is reached) and graft the
    ///    missing taxon at that position
    ///
    /// # Errors
    /// Returns [`SolverError::TooFewTaxa`] when fewer than three taxa are present.
    pub fn complete(&self, matrix: &SimilarityMatrix) -> Result<ObservationTree, SolverError> {
        let present = self.tree_all().clone();
        if present.size() < 3 {
            return Err(SolverError::TooFewTaxa(present.size()));
        }
        if self.is_complete() {
            return Ok(self.clone());
        }

        let mut graph = Unrooted::from_tree(self);
        graph.suppress_binary_nodes();

        for missing in (0..self.universe).filter(|&t| !present.contains(t)) {
            let closest = matrix
                .closest_present_taxon(&present, missing)
                .ok_or(SolverError::Invariant("no present taxon to attach a missing taxon to"))?;
            let closest_leaf = graph
                .leaf_of(closest)
                .ok_or(SolverError::Invariant("closest taxon is not a leaf of the tree"))?;
            graph.graft(missing, closest, closest_leaf, matrix)?;
            graph.suppress_binary_nodes();
        }

        let completed = graph.into_rooted(self.universe)?;
        debug!(
            "completed tree from {} to {} taxa",
            present.size(),
            completed.leaf_count()
        );
        Ok(completed)
    }
}

/// Undirected working copy of a tree used while grafting missing taxa.
struct Unrooted {
    adj: Vec<Vec<usize>>,
    taxon: Vec<Option<usize>>,
    alive: Vec<bool>,
}

impl Unrooted {
    fn from_tree(tree: &ObservationTree) -> Self {
        let n = tree.nodes.len();
        let mut adj = vec![Vec::new(); n];
        for (idx, node) in tree.nodes.iter().enumerate() {
            for &c in &node.children {
                adj[idx].push(c);
                adj[c].push(idx);
            }
        }
        let taxon = tree.nodes.iter().map(|n| n.taxon).collect();
        Unrooted { adj, taxon, alive: vec![true; n] }
    }

    fn add_node(&mut self, taxon: Option<usize>) -> usize {
        self.adj.push(Vec::new());
        self.taxon.push(taxon);
        self.alive.push(true);
        self.adj.len() - 1
    }

    fn connect(&mut self, a: usize, b: usize) {
        self.adj[a].push(b);
        self.adj[b].push(a);
    }

    fn disconnect(&mut self, a: usize, b: usize) {
        self.adj[a].retain(|&x| x != b);
        self.adj[b].retain(|&x| x != a);
    }

    fn is_leaf(&self, idx: usize) -> bool {
        self.taxon[idx].is_some()
    }

    fn leaf_of(&self, taxon: usize) -> Option<usize> {
        (0..self.taxon.len()).find(|&i| self.alive[i] && self.taxon[i] == Some(taxon))
    }

    /// Internal nodes of degree two do not define splits; splice them out.
    fn suppress_binary_nodes(&mut self) {
        for idx in 0..self.adj.len() {
            if self.alive[idx] && !self.is_leaf(idx) && self.adj[idx].len() == 2 {
                let (a, b) = (self.adj[idx][0], self.adj[idx][1]);
                self.disconnect(idx, a);
                self.disconnect(idx, b);
                self.connect(a, b);
                self.alive[idx] = false;
            }
        }
    }

    fn children(&self, idx: usize, parent: usize) -> Vec<usize> {
        self.adj[idx].iter().copied().filter(|&x| x != parent).collect()
    }

    fn leftmost_taxon(&self, mut idx: usize, mut parent: usize) -> Option<usize> {
        while !self.is_leaf(idx) {
            let next = *self.adj[idx].iter().find(|&&x| x != parent)?;
            parent = idx;
            idx = next;
        }
        self.taxon[idx]
    }

    fn graft(
        &mut self,
        missing: usize,
        closest: usize,
        closest_leaf: usize,
        matrix: &SimilarityMatrix,
    ) -> Result<(), SolverError> {
        let mut parent = closest_leaf;
        let mut start = *self.adj[closest_leaf]
            .first()
            .ok_or(SolverError::Invariant("isolated leaf in tree under completion"))?;

        let mut pair = None;
        while !self.is_leaf(start) {
            let kids = self.children(start, parent);
            if kids.len() < 2 {
                break;
            }
            let (c1, c2) = (kids[0], kids[1]);
            let r1 = self.leftmost_taxon(c1, start).ok_or(SolverError::Invariant("subtree without leaves"))?;
            let r2 = self.leftmost_taxon(c2, start).ok_or(SolverError::Invariant("subtree without leaves"))?;
            pair = Some((c1, c2));
            let better = matrix.better_side_by_four_point(missing, closest, r1, r2);
            if better == closest {
                break;
            } else if better == r1 {
                parent = start;
                start = c1;
            } else {
                parent = start;
                start = c2;
            }
        }

        let leaf = self.add_node(Some(missing));
        if self.is_leaf(start) {
            // Insert on the edge above the leaf
            let joint = self.add_node(None);
            self.disconnect(parent, start);
            self.connect(parent, joint);
            self.connect(joint, start);
            self.connect(joint, leaf);
        } else {
            let (c1, c2) = pair.ok_or(SolverError::Invariant("internal node without two children"))?;
            let joint = self.add_node(None);
            self.disconnect(start, c1);
            self.disconnect(start, c2);
            self.connect(joint, c1);
            self.connect(joint, c2);
            self.connect(start, joint);
            self.connect(start, leaf);
        }
        Ok(())
    }

    /// Root at the first live internal node and rebuild an observation tree.
    fn into_rooted(self, universe: usize) -> Result<ObservationTree, SolverError> {
        let root = (0..self.adj.len())
            .find(|&i| self.alive[i] && !self.is_leaf(i))
            .ok_or(SolverError::Invariant("tree without internal nodes"))?;

        let mut out = ObservationTree { nodes: Vec::new(), root: 0, universe };
        // (node, parent, children already built)
        let mut stack: Vec<(usize, Option<usize>, bool)> = vec![(root, None, false)];
        let mut built: HashMap<usize, usize> = HashMap::new();
        while let Some((idx, parent, expanded)) = stack.pop() {
            let kids: Vec<usize> = match parent {
                Some(p) => self.children(idx, p),
                None => self.adj[idx].clone(),
            };
            if let Some(t) = self.taxon[idx] {
                built.insert(idx, out.push_leaf(t));
                continue;
            }
            if expanded {
                let children = kids.iter().map(|k| built[k]).collect();
                built.insert(idx, out.push_internal(children));
                continue;
            }
            stack.push((idx, parent, true));
            for &k in kids.iter().rev() {
                stack.push((k, Some(idx), false));
            }
        }
        out.root = built[&root];
        Ok(out)
    }
}

/// The observation forest over one taxon universe.
#[derive(Debug, Clone)]
pub struct Forest {
    pub taxa: TaxonIdentifier,
    pub trees: Vec<ObservationTree>,
}

impl Forest {
    /// Builds a forest whose universe is every leaf name across `trees`.
    pub fn from_phylo_trees(trees: &[PhyloTree]) -> Result<Self, SolverError> {
        let taxa = TaxonIdentifier::from_trees(trees)?;
        Self::with_taxa(trees, taxa)
    }

    /// Builds a forest over an explicit universe.
    pub fn with_taxa(trees: &[PhyloTree], taxa: TaxonIdentifier) -> Result<Self, SolverError> {
        let trees = trees
            .iter()
            .map(|t| ObservationTree::from_tree(t, &taxa))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Forest { taxa, trees })
    }

    /// Parses newick strings and builds the forest.
    pub fn from_newick_strs<S: AsRef<str>>(newicks: &[S]) -> Result<Self, SolverError> {
        let trees = newicks
            .iter()
            .enumerate()
            .map(|(index, s)| {
                PhyloTree::from_newick(s.as_ref())
                    .map_err(|e| SolverError::Newick { index, message: e.to_string() })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_phylo_trees(&trees)
    }

    pub fn taxon_count(&self) -> usize {
        self.taxa.taxon_count()
    }

    /// Number of trees that miss at least one taxon.
    pub fn incomplete_count(&self) -> usize {
        self.trees.iter().filter(|t| !t.is_complete()).count()
    }
}
