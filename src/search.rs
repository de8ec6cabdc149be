//! Memoized DP search over the materialized cluster lattice.
//!
//! # Algorithm
//! For a cluster `C` that is not yet memoized:
//! 1. Base case: `|C| ≤ 1`, or all of `C` belongs to one species
//! 2. Scope the collection to the known subsets of `C`
//! 3. If `C` is large relative to the universe, add the complements (within
//!    `C`) of the largest sub-cluster groups
//! 4. Every known split `(A, C ^ A)` whose two sides both resolve is a viable
//!    candidate; a side that does not resolve only drops that candidate
//! 5. With no viable candidate, grow the scope (every subset for small
//!    clusters, else complements of the largest sub-cluster group) and retry;
//!    stop once growth adds nothing
//! 6. Hand the viable candidates to the [`SplitScorer`], or mark `C`
//!    unresolvable
//!
//! Outcomes are memoized in the [`VertexArena`] for the lifetime of the arena,
//! failures included.
//!
//! Whether a cluster resolves never depends on split weights, only on which
//! clusters are materialized. That lets the same structural search drive both
//! the inline scorer (weights computed on the spot) and the pipeline producer
//! (weights computed by workers, scores assembled by a consumer).

use tracing::{trace, warn};

use crate::cluster::Cluster;
use crate::collection::ClusterCollection;
use crate::solver::SolverConfig;
use crate::taxa::SpeciesMapper;
use crate::vertex::{Resolution, VertexArena, VertexId};

/// Bitmask enumeration of all subsets is capped at this cluster size.
const MAX_EXHAUSTIVE_SIZE: usize = 16;

/// Decides the score of clusters the search has found resolvable.
pub trait SplitScorer {
    /// Scores a base cluster.
    fn base(&mut self, arena: &mut VertexArena, v: VertexId) -> Resolution;

    /// Scores a cluster given its viable candidate splits (smaller side
    /// first). `candidates` is never empty.
    fn resolve(&mut self, arena: &mut VertexArena, v: VertexId, candidates: Vec<(VertexId, VertexId)>)
    -> Resolution;
}

pub struct Search<'a, S> {
    config: &'a SolverConfig,
    universe: usize,
    species: Option<&'a SpeciesMapper>,
    scorer: S,
}

impl<'a, S: SplitScorer> Search<'a, S> {
    pub fn new(config: &'a SolverConfig, universe: usize, species: Option<&'a SpeciesMapper>, scorer: S) -> Self {
        Search { config, universe, species, scorer }
    }

    pub fn scorer(&self) -> &S {
        &self.scorer
    }

    pub fn into_scorer(self) -> S {
        self.scorer
    }

    fn is_base(&self, cluster: &Cluster) -> bool {
        cluster.size() <= 1 || self.species.is_some_and(|spm| spm.is_single_species(cluster))
    }

    /// Resolves vertex `v` using the clusters known to `scope`.
    pub fn compute(&mut self, arena: &mut VertexArena, v: VertexId, scope: &ClusterCollection) -> Resolution {
        if let Some(memo) = arena.vertex(v).resolution() {
            return memo;
        }
        let cluster = arena.cluster(v).clone();
        if self.is_base(&cluster) {
            return self.scorer.base(arena, v);
        }

        let size = cluster.size();
        let mut contained = scope.contained(arena, &cluster);
        loop {
            if size as f64 >= self.universe as f64 * self.config.complement_size_fraction {
                self.add_complementary_clusters(arena, &mut contained, &cluster);
            }

            let mut viable = Vec::new();
            for (small, big) in contained.resolutions(arena, &cluster) {
                if !self.compute(arena, big, &contained).is_resolvable() {
                    continue;
                }
                if !self.compute(arena, small, &contained).is_resolvable() {
                    continue;
                }
                viable.push((small, big));
            }
            if !viable.is_empty() {
                return self.scorer.resolve(arena, v, viable);
            }

            if !self.grow(arena, &mut contained, &cluster) {
                break;
            }
        }

        warn!("No resolution found for ( {} taxa ): {}", size, cluster);
        arena.mark_unresolvable(v);
        Resolution::Unresolvable
    }

    /// Adds complements of sub-cluster groups, largest first, stopping after
    /// the first group smaller than `cluster.size() * complement_depth_fraction`.
    fn add_complementary_clusters(&self, arena: &mut VertexArena, contained: &mut ClusterCollection, cluster: &Cluster) {
        let depth = cluster.size() as f64 * self.config.complement_depth_fraction;
        for group in contained.sub_clusters() {
            let group_size = arena.cluster(group[0]).size();
            for x in group {
                let comp = arena.cluster(x).complement_within(cluster);
                contained.add_cluster(arena, comp);
            }
            if (group_size as f64) < depth {
                break;
            }
        }
    }

    /// Grows the scope after a failed round. Returns whether anything new was
    /// added.
    fn grow(&self, arena: &mut VertexArena, contained: &mut ClusterCollection, cluster: &Cluster) -> bool {
        let size = cluster.size();
        if size <= self.config.exhaustive_threshold.min(MAX_EXHAUSTIVE_SIZE) {
            return add_all_subsets(arena, contained, cluster);
        }

        let Some(largest) = contained.sub_clusters().into_iter().next() else {
            return false;
        };
        let mut added = false;
        for x in largest {
            let comp = arena.cluster(x).complement_within(cluster);
            // Single taxa are seeded up front
            if comp.size() > 1 {
                added |= contained.add_cluster(arena, comp);
            }
        }
        trace!("grew scope of {} taxa to {} clusters", size, contained.cluster_count());
        added
    }
}

/// Adds every non-empty proper subset of `cluster`.
fn add_all_subsets(arena: &mut VertexArena, contained: &mut ClusterCollection, cluster: &Cluster) -> bool {
    let members: Vec<usize> = cluster.iter().collect();
    let full_mask = (1u64 << members.len()) - 1;
    let mut added = false;
    for mask in 1..full_mask {
        let mut subset = cluster.clone();
        for (k, &taxon) in members.iter().enumerate() {
            if mask >> k & 1 == 0 {
                subset.remove(taxon);
            }
        }
        added |= contained.add_cluster(arena, subset);
    }
    added
}
