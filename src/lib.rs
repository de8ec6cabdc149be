//! Crate root: module orchestration and public re-exports.
//!
//! Finds the best binary tree over a taxon universe by dynamic programming on
//! the lattice of clusters (subsets of taxa). Only clusters materialized from a
//! forest of observation trees, plus heuristic additions, are searched.
//!
//! Modules:
//! - `cluster`: bit-vector taxon sets.
//! - `taxa`: taxon names to ids, individuals to species.
//! - `forest`: observation trees as cluster trees; missing-taxon completion.
//! - `similarity`: pairwise taxon similarity, UPGMA and neighbour clusters.
//! - `search_space`: building the set of clusters to search.
//! - `vertex`, `collection`: DP state per cluster and the size-bucketed index.
//! - `weights`: split weights (`CostModel`) and their shared cache.
//! - `search`: the memoized DP search with on-demand augmentation.
//! - `solver`, `pipeline`: sequential and producer/consumer strategies.
//! - `io`: reading trees and species mappings, writing results.

pub mod cluster;
pub mod collection;
pub mod error;
pub mod forest;
pub mod io;
pub mod pipeline;
pub mod search;
pub mod search_space;
pub mod similarity;
pub mod solver;
pub mod taxa;
pub mod vertex;
pub mod weights;

// Re-export frequently used types & functions
pub use cluster::Cluster;
pub use collection::ClusterCollection;
pub use error::SolverError;
pub use forest::{Forest, ObservationTree};
pub use pipeline::{PipelineSolver, PipelineState};
pub use search_space::{BuiltSpace, SearchSpace, SearchSpaceConfig, build_search_space};
pub use similarity::SimilarityMatrix;
pub use solver::{ClusterSolver, ResolvedTree, SequentialSolver, Solution, SolverConfig, TieBreak};
pub use taxa::{SpeciesMapper, TaxonIdentifier};
pub use vertex::{Resolution, VertexArena, VertexId, VertexState};
pub use weights::{CladeSupport, CostModel, FnCost, Split, WeightCache};
