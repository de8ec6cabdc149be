//! The search-space index.
//!
//! A [`ClusterCollection`] is scoped to one cluster (its `top`) and records
//! which materialized clusters inside that scope it knows about, bucketed by
//! size. Candidate splits of a cluster are the pairs `(A, cluster ^ A)` where
//! both sides are known to the collection.
//!
//! ```text
//! top = {A,B,C,D}
//!   size 1: {A} {B} {C} {D}
//!   size 2: {A,B} {C,D} {A,D}
//!   size 4: {A,B,C,D}
//!
//! resolutions({A,B,C,D}) = ({A,B},{C,D}), ({A,D},{B,C})?  // only if {B,C} is known
//! ```
//!
//! Collections store [`VertexId`]s; the vertices themselves live in the
//! shared [`VertexArena`].

use std::collections::HashSet;

use crate::cluster::Cluster;
use crate::vertex::{VertexArena, VertexId};

#[derive(Clone, Debug)]
pub struct ClusterCollection {
    top: Cluster,
    buckets: Vec<Vec<VertexId>>,
    members: HashSet<VertexId>,
}

impl ClusterCollection {
    /// An empty collection for clusters inside `top`.
    pub fn new(top: Cluster) -> Self {
        let buckets = vec![Vec::new(); top.size() + 1];
        ClusterCollection { top, buckets, members: HashSet::new() }
    }

    pub fn top(&self) -> &Cluster {
        &self.top
    }

    /// Inserts `cluster`, returning whether it was new to this collection.
    ///
    /// Clusters outside the scope and the empty cluster are ignored.
    pub fn add_cluster(&mut self, arena: &mut VertexArena, cluster: Cluster) -> bool {
        if cluster.is_empty() || !cluster.is_subset_of(&self.top) {
            return false;
        }
        let (id, _) = arena.get_or_insert(cluster);
        self.add_vertex(arena, id)
    }

    /// Inserts an existing vertex, returning whether it was new to this
    /// collection.
    pub fn add_vertex(&mut self, arena: &VertexArena, id: VertexId) -> bool {
        if !self.members.insert(id) {
            return false;
        }
        self.buckets[arena.cluster(id).size()].push(id);
        true
    }

    pub fn contains(&self, arena: &VertexArena, cluster: &Cluster) -> bool {
        self.vertex_for(arena, cluster).is_some()
    }

    pub fn vertex_for(&self, arena: &VertexArena, cluster: &Cluster) -> Option<VertexId> {
        arena.find(cluster).filter(|id| self.members.contains(id))
    }

    pub fn cluster_count(&self) -> usize {
        self.members.len()
    }

    /// Known clusters of a given size, in insertion order.
    pub fn clusters_of_size(&self, size: usize) -> &[VertexId] {
        self.buckets.get(size).map_or(&[], Vec::as_slice)
    }

    /// Every known split `(A, B)` of `cluster` with `A ∪ B = cluster`.
    ///
    /// The smaller side comes first. Sides of equal size are reported once,
    /// with the lower vertex id first. Order follows bucket size, then
    /// insertion order.
    pub fn resolutions(&self, arena: &VertexArena, cluster: &Cluster) -> Vec<(VertexId, VertexId)> {
        let size = cluster.size();
        let mut out = Vec::new();
        for side in 1..=size / 2 {
            for &a in self.clusters_of_size(side) {
                let left = arena.cluster(a);
                if !left.is_subset_of(cluster) {
                    continue;
                }
                let Some(b) = self.vertex_for(arena, &left.complement_within(cluster)) else {
                    continue;
                };
                if 2 * side == size && b < a {
                    continue;
                }
                out.push((a, b));
            }
        }
        out
    }

    /// A new collection scoped to `cluster`, holding every known subset of it.
    pub fn contained(&self, arena: &VertexArena, cluster: &Cluster) -> ClusterCollection {
        let mut sub = ClusterCollection::new(cluster.clone());
        for size in 1..=cluster.size().min(self.top.size()) {
            for &id in &self.buckets[size] {
                if arena.cluster(id).is_subset_of(cluster) {
                    sub.add_vertex(arena, id);
                }
            }
        }
        sub
    }

    /// Groups of strict sub-clusters of the top cluster, largest size first.
    pub fn sub_clusters(&self) -> Vec<Vec<VertexId>> {
        (1..self.top.size())
            .rev()
            .map(|size| &self.buckets[size])
            .filter(|bucket| !bucket.is_empty())
            .cloned()
            .collect()
    }
}
