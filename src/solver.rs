//! Solving the search space for the whole taxon set.
//!
//! Two interchangeable strategies implement [`ClusterSolver`]:
//! - [`SequentialSolver`]: one thread, split weights computed inline
//! - [`PipelineSolver`](crate::pipeline::PipelineSolver): a producer walks the
//!   lattice, a worker pool computes weights and a consumer assembles scores
//!
//! Both return a [`Solution`]: the best binary resolution of the whole set
//! over the materialized search space, and its score.

use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::cluster::Cluster;
use crate::error::SolverError;
use crate::search::{Search, SplitScorer};
use crate::search_space::SearchSpace;
use crate::taxa::TaxonIdentifier;
use crate::vertex::{Resolution, VertexArena, VertexId};
use crate::weights::{CostModel, Split, WeightCache};

/// How equal-scoring candidates are settled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TieBreak {
    /// Keep the first candidate seen
    #[default]
    FirstWins,
    /// Replace with probability one half, from the seeded source
    Random,
}

/// Tuning of the search and of the pipeline.
#[derive(Clone, Debug)]
pub struct SolverConfig {
    /// Clusters with at least `universe * fraction` taxa get the complements
    /// of their sub-clusters added before each round
    pub complement_size_fraction: f64,
    /// Complement addition stops after the first sub-cluster group smaller
    /// than `cluster size * fraction`
    pub complement_depth_fraction: f64,
    /// Clusters up to this size grow by adding all of their subsets
    pub exhaustive_threshold: usize,
    pub tie_break: TieBreak,
    /// Splits per work item sent to the pipeline workers
    pub batch_size: usize,
    /// Bound of the pipeline work queue, in batches
    pub queue_capacity: usize,
    pub workers: usize,
    pub seed: u64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            complement_size_fraction: 1.0,
            complement_depth_fraction: 1.0,
            exhaustive_threshold: 5,
            tie_break: TieBreak::FirstWins,
            batch_size: 32,
            queue_capacity: 64,
            workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            seed: 0,
        }
    }
}

/// Injected random source for tie-breaking.
#[derive(Debug)]
pub struct TieBreaker {
    policy: TieBreak,
    rng: StdRng,
}

impl TieBreaker {
    pub fn new(policy: TieBreak, seed: u64) -> Self {
        TieBreaker { policy, rng: StdRng::seed_from_u64(seed) }
    }

    /// Whether a candidate tying the current best should replace it.
    pub fn replace_on_tie(&mut self) -> bool {
        match self.policy {
            TieBreak::FirstWins => false,
            TieBreak::Random => self.rng.gen_bool(0.5),
        }
    }

    /// Whether `score` should replace the current `best`.
    pub fn accepts(&mut self, score: f64, best: Option<f64>) -> bool {
        match best {
            None => true,
            Some(b) if score > b => true,
            Some(b) => score == b && self.replace_on_tie(),
        }
    }
}

/// A strategy that resolves the whole taxon set.
pub trait ClusterSolver {
    fn solve(&self, space: &mut SearchSpace, model: &dyn CostModel) -> Result<Solution, SolverError>;
}

/// Scores candidates as soon as the search finds them viable.
pub struct InlineScorer<'a> {
    model: &'a dyn CostModel,
    cache: &'a WeightCache,
    tie: TieBreaker,
}

impl<'a> InlineScorer<'a> {
    pub fn new(model: &'a dyn CostModel, cache: &'a WeightCache, tie: TieBreaker) -> Self {
        InlineScorer { model, cache, tie }
    }
}

impl SplitScorer for InlineScorer<'_> {
    fn base(&mut self, arena: &mut VertexArena, v: VertexId) -> Resolution {
        let score = self.model.base_score(arena.cluster(v));
        arena.mark_done(v, score, None, 0.0);
        Resolution::Done(score)
    }

    fn resolve(&mut self, arena: &mut VertexArena, v: VertexId, candidates: Vec<(VertexId, VertexId)>) -> Resolution {
        let mut best: Option<(f64, (VertexId, VertexId), f64)> = None;
        for (a, b) in candidates {
            let (Some(Resolution::Done(ls)), Some(Resolution::Done(rs))) =
                (arena.vertex(a).resolution(), arena.vertex(b).resolution())
            else {
                continue;
            };
            let split = Split::new(arena.cluster(a).clone(), arena.cluster(b).clone());
            let w = self.cache.get_or_compute(self.model, &split);
            let c = self.model.combine(w, &split);
            let score = ls + rs + c;
            if self.tie.accepts(score, best.map(|(s, _, _)| s)) {
                best = Some((score, (a, b), c));
            }
        }
        match best {
            Some((score, children, c)) => {
                arena.mark_done(v, score, Some(children), c);
                Resolution::Done(score)
            }
            None => {
                arena.mark_unresolvable(v);
                Resolution::Unresolvable
            }
        }
    }
}

/// Single-threaded memoized search.
#[derive(Clone, Debug, Default)]
pub struct SequentialSolver {
    config: SolverConfig,
}

impl SequentialSolver {
    pub fn new(config: SolverConfig) -> Self {
        SequentialSolver { config }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }
}

impl ClusterSolver for SequentialSolver {
    fn solve(&self, space: &mut SearchSpace, model: &dyn CostModel) -> Result<Solution, SolverError> {
        let start = Instant::now();
        let cache = WeightCache::new();
        let scorer = InlineScorer::new(model, &cache, TieBreaker::new(self.config.tie_break, self.config.seed));
        let root = space.root();
        let universe = space.universe();
        let (arena, clusters, species) = space.parts_mut();

        let mut search = Search::new(&self.config, universe, species, scorer);
        let res = search.compute(arena, root, clusters);
        info!(
            "sequential search done in {:.3}s: {} vertices, {} split weights computed",
            start.elapsed().as_secs_f64(),
            arena.len(),
            cache.evaluations()
        );
        finish(arena, root, res)
    }
}

/// Turns the root outcome into a [`Solution`].
pub(crate) fn finish(arena: &VertexArena, root: VertexId, res: Resolution) -> Result<Solution, SolverError> {
    match res {
        Resolution::Done(score) => Ok(Solution { score, tree: ResolvedTree::from_arena(arena, root)? }),
        Resolution::Unresolvable => {
            let cluster = arena.cluster(root);
            Err(SolverError::RootUnresolvable { size: cluster.size(), members: cluster.to_string() })
        }
        Resolution::Pending => Err(SolverError::Invariant("root still pending after the search finished")),
    }
}

/// Best resolution of the whole set and its score.
#[derive(Clone, Debug)]
pub struct Solution {
    pub score: f64,
    pub tree: ResolvedTree,
}

/// One cluster of a resolved tree.
#[derive(Clone, Debug)]
pub struct ResolvedNode {
    pub cluster: Cluster,
    /// Indices of the two sides, smaller first; `None` for base clusters
    pub children: Option<(usize, usize)>,
    pub score: f64,
    pub split_weight: f64,
}

/// Binary tree recovered from the winning splits.
#[derive(Clone, Debug)]
pub struct ResolvedTree {
    nodes: Vec<ResolvedNode>,
    root: usize,
}

impl ResolvedTree {
    /// Follows the winning splits down from `root`.
    ///
    /// # Errors
    /// Returns [`SolverError::Invariant`] if a reached vertex is not done.
    pub fn from_arena(arena: &VertexArena, root: VertexId) -> Result<Self, SolverError> {
        let mut tree = ResolvedTree { nodes: Vec::new(), root: 0 };
        tree.root = tree.copy(arena, root)?;
        Ok(tree)
    }

    fn copy(&mut self, arena: &VertexArena, id: VertexId) -> Result<usize, SolverError> {
        let v = arena.vertex(id);
        let Some(Resolution::Done(score)) = v.resolution() else {
            return Err(SolverError::Invariant("resolved tree reaches a vertex that is not done"));
        };
        let children = match v.children() {
            Some((a, b)) => Some((self.copy(arena, a)?, self.copy(arena, b)?)),
            None => None,
        };
        self.nodes.push(ResolvedNode { cluster: v.cluster().clone(), children, score, split_weight: v.split_weight() });
        Ok(self.nodes.len() - 1)
    }

    pub fn root(&self) -> &ResolvedNode {
        &self.nodes[self.root]
    }

    pub fn node(&self, idx: usize) -> &ResolvedNode {
        &self.nodes[idx]
    }

    /// Nodes in post-order.
    pub fn nodes(&self) -> &[ResolvedNode] {
        &self.nodes
    }

    pub fn score(&self) -> f64 {
        self.root().score
    }

    /// Whether `cluster` is a node of the tree.
    pub fn contains(&self, cluster: &Cluster) -> bool {
        self.nodes.iter().any(|n| &n.cluster == cluster)
    }

    /// Renders the tree as newick. Base clusters with several taxa (one
    /// species) become a polytomy of their members.
    pub fn to_newick(&self, taxa: &TaxonIdentifier) -> String {
        let mut out = String::new();
        self.write_newick(self.root, taxa, &mut out);
        out.push(';');
        out
    }

    fn write_newick(&self, idx: usize, taxa: &TaxonIdentifier, out: &mut String) {
        let node = &self.nodes[idx];
        match node.children {
            Some((a, b)) => {
                out.push('(');
                self.write_newick(a, taxa, out);
                out.push(',');
                self.write_newick(b, taxa, out);
                out.push(')');
            }
            None if node.cluster.size() == 1 => {
                let id = node.cluster.first().unwrap_or_default();
                out.push_str(taxa.taxon_name(id));
            }
            None => {
                let names: Vec<&str> = node.cluster.iter().map(|t| taxa.taxon_name(t)).collect();
                out.push('(');
                out.push_str(&names.join(","));
                out.push(')');
            }
        }
    }
}
