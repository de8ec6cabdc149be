//! DP state attached to materialized clusters.
//!
//! Every cluster that enters the search space gets exactly one [`Vertex`] in a
//! [`VertexArena`]. Vertices are addressed by [`VertexId`]; a resolved vertex
//! names its two children by id, so the resolution graph is a DAG over strict
//! subsets and never needs back-pointers.

use std::collections::HashMap;

use crate::cluster::Cluster;

/// Index of a vertex in its [`VertexArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexId(usize);

impl VertexId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Lifecycle of a vertex.
///
/// `Unseen → Done` or `Unseen → Unresolvable` in the sequential search.
/// The pipeline producer uses `Unseen → Pending`, and the consumer's result
/// later turns `Pending` into `Done`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VertexState {
    Unseen,
    Pending,
    Done,
    Unresolvable,
}

/// Outcome of scoring a cluster.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Resolution {
    /// Resolved with this score
    Done(f64),
    /// No valid bipartition exists in the materialized search space
    Unresolvable,
    /// Known to be resolvable; the score is computed elsewhere
    Pending,
}

impl Resolution {
    /// Whether the cluster can serve as one side of a split.
    pub fn is_resolvable(&self) -> bool {
        !matches!(self, Resolution::Unresolvable)
    }
}

#[derive(Clone, Debug)]
pub struct Vertex {
    cluster: Cluster,
    state: VertexState,
    max_score: f64,
    children: Option<(VertexId, VertexId)>,
    split_weight: f64,
}

impl Vertex {
    fn new(cluster: Cluster) -> Self {
        Vertex {
            cluster,
            state: VertexState::Unseen,
            max_score: f64::NEG_INFINITY,
            children: None,
            split_weight: 0.0,
        }
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn state(&self) -> VertexState {
        self.state
    }

    /// Best score found; `-inf` until the vertex is done.
    pub fn max_score(&self) -> f64 {
        self.max_score
    }

    /// The winning split, smaller side first. `None` for base clusters.
    pub fn children(&self) -> Option<(VertexId, VertexId)> {
        self.children
    }

    /// Weight of the winning split after combination with its extra terms.
    pub fn split_weight(&self) -> f64 {
        self.split_weight
    }

    /// Memoized outcome, `None` while the vertex is unseen.
    pub fn resolution(&self) -> Option<Resolution> {
        match self.state {
            VertexState::Unseen => None,
            VertexState::Pending => Some(Resolution::Pending),
            VertexState::Done => Some(Resolution::Done(self.max_score)),
            VertexState::Unresolvable => Some(Resolution::Unresolvable),
        }
    }
}

/// Owner of all vertices, keyed by cluster content.
#[derive(Clone, Debug, Default)]
pub struct VertexArena {
    vertices: Vec<Vertex>,
    index: HashMap<Cluster, VertexId>,
}

impl VertexArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the vertex of `cluster`, creating it if needed, and whether it
    /// was created.
    pub fn get_or_insert(&mut self, cluster: Cluster) -> (VertexId, bool) {
        if let Some(&id) = self.index.get(&cluster) {
            return (id, false);
        }
        let id = VertexId(self.vertices.len());
        self.index.insert(cluster.clone(), id);
        self.vertices.push(Vertex::new(cluster));
        (id, true)
    }

    pub fn find(&self, cluster: &Cluster) -> Option<VertexId> {
        self.index.get(cluster).copied()
    }

    #[inline]
    pub fn vertex(&self, id: VertexId) -> &Vertex {
        &self.vertices[id.0]
    }

    #[inline]
    pub fn cluster(&self, id: VertexId) -> &Cluster {
        &self.vertices[id.0].cluster
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn mark_done(&mut self, id: VertexId, score: f64, children: Option<(VertexId, VertexId)>, split_weight: f64) {
        let v = &mut self.vertices[id.0];
        v.state = VertexState::Done;
        v.max_score = score;
        v.children = children;
        v.split_weight = split_weight;
    }

    pub fn mark_pending(&mut self, id: VertexId) {
        self.vertices[id.0].state = VertexState::Pending;
    }

    pub fn mark_unresolvable(&mut self, id: VertexId) {
        let v = &mut self.vertices[id.0];
        v.state = VertexState::Unresolvable;
        v.children = None;
    }

    /// Returns every `Pending` vertex to `Unseen` and reports how many were
    /// reset. Used when a pipeline run fails before its scores arrive.
    pub fn reset_pending(&mut self) -> usize {
        let mut reset = 0;
        for v in self.vertices.iter_mut().filter(|v| v.state == VertexState::Pending) {
            v.state = VertexState::Unseen;
            v.max_score = f64::NEG_INFINITY;
            v.children = None;
            v.split_weight = 0.0;
            reset += 1;
        }
        reset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_per_cluster() {
        let mut arena = VertexArena::new();
        let (a, fresh) = arena.get_or_insert(Cluster::from_ids(4, [0, 1]));
        assert!(fresh);
        let (b, fresh) = arena.get_or_insert(Cluster::from_ids(4, [0, 1]));
        assert!(!fresh);
        assert_eq!(a, b);
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.vertex(a).resolution(), None);
    }

    #[test]
    fn test_state_transitions() {
        let mut arena = VertexArena::new();
        let (leaf_a, _) = arena.get_or_insert(Cluster::singleton(2, 0));
        let (leaf_b, _) = arena.get_or_insert(Cluster::singleton(2, 1));
        let (root, _) = arena.get_or_insert(Cluster::full(2));

        arena.mark_pending(root);
        assert_eq!(arena.vertex(root).resolution(), Some(Resolution::Pending));
        assert!(Resolution::Pending.is_resolvable());

        arena.mark_done(root, 3.5, Some((leaf_a, leaf_b)), 3.5);
        let v = arena.vertex(root);
        assert_eq!(v.state(), VertexState::Done);
        assert_eq!(v.children(), Some((leaf_a, leaf_b)));
        assert_eq!(v.resolution(), Some(Resolution::Done(3.5)));

        arena.mark_unresolvable(leaf_a);
        assert!(!arena.vertex(leaf_a).resolution().is_some_and(|r| r.is_resolvable()));
    }

    #[test]
    fn test_reset_pending_leaves_settled_vertices() {
        let mut arena = VertexArena::new();
        let (leaf_a, _) = arena.get_or_insert(Cluster::singleton(3, 0));
        let (leaf_b, _) = arena.get_or_insert(Cluster::singleton(3, 1));
        let (pair, _) = arena.get_or_insert(Cluster::from_ids(3, [0, 1]));
        let (root, _) = arena.get_or_insert(Cluster::full(3));

        arena.mark_done(leaf_a, 0.0, None, 0.0);
        arena.mark_unresolvable(leaf_b);
        arena.mark_pending(pair);
        arena.mark_pending(root);

        assert_eq!(arena.reset_pending(), 2);
        assert_eq!(arena.vertex(pair).resolution(), None);
        assert_eq!(arena.vertex(root).state(), VertexState::Unseen);
        assert_eq!(arena.vertex(root).max_score(), f64::NEG_INFINITY);
        assert_eq!(arena.vertex(leaf_a).resolution(), Some(Resolution::Done(0.0)));
        assert_eq!(arena.vertex(leaf_b).resolution(), Some(Resolution::Unresolvable));
        assert_eq!(arena.reset_pending(), 0);
    }
}
