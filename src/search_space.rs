//! The materialized search space ("set X") and how it is built.
//!
//! # Phases
//! 1. Every singleton and the whole set
//! 2. Every cluster of every (completed) observation tree, with its complement
//! 3. Level ≥ 1: UPGMA clusters of the species similarity matrix, and for each
//!    polytomy its UPGMA resolution plus resolutions of random one-per-side
//!    samples mapped back to the sides
//! 4. Level 2: the ranked-neighbour (quadratic) clusters as well
//!
//! Every addition is completed to whole species first. The cluster count is
//! logged after each phase.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::cluster::Cluster;
use crate::collection::ClusterCollection;
use crate::error::SolverError;
use crate::forest::{Forest, ObservationTree};
use crate::similarity::SimilarityMatrix;
use crate::taxa::SpeciesMapper;
use crate::vertex::{VertexArena, VertexId};

/// The clusters the solver may use, with their DP state.
#[derive(Clone, Debug)]
pub struct SearchSpace {
    arena: VertexArena,
    clusters: ClusterCollection,
    root: VertexId,
    universe: usize,
    species: Option<SpeciesMapper>,
}

impl SearchSpace {
    /// A space holding every singleton and the whole set.
    pub fn new(universe: usize) -> Self {
        let mut arena = VertexArena::new();
        let all = Cluster::full(universe);
        let mut clusters = ClusterCollection::new(all.clone());
        for i in 0..universe {
            clusters.add_cluster(&mut arena, Cluster::singleton(universe, i));
        }
        let (root, _) = arena.get_or_insert(all);
        clusters.add_vertex(&arena, root);
        SearchSpace { arena, clusters, root, universe, species: None }
    }

    /// A space over individuals grouped into species. Each species' group of
    /// individuals is a base cluster.
    pub fn with_species(spm: SpeciesMapper) -> Self {
        let mut space = SearchSpace::new(spm.taxon_count());
        if spm.is_single_individual() {
            return space;
        }
        for sp in 0..spm.species_count() {
            space.clusters.add_cluster(&mut space.arena, spm.members(sp).clone());
        }
        space.species = Some(spm);
        space
    }

    pub fn universe(&self) -> usize {
        self.universe
    }

    pub fn root(&self) -> VertexId {
        self.root
    }

    pub fn arena(&self) -> &VertexArena {
        &self.arena
    }

    pub fn clusters(&self) -> &ClusterCollection {
        &self.clusters
    }

    pub fn species(&self) -> Option<&SpeciesMapper> {
        self.species.as_ref()
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.cluster_count()
    }

    pub(crate) fn parts_mut(&mut self) -> (&mut VertexArena, &ClusterCollection, Option<&SpeciesMapper>) {
        (&mut self.arena, &self.clusters, self.species.as_ref())
    }

    pub(crate) fn arena_mut(&mut self) -> &mut VertexArena {
        &mut self.arena
    }

    /// Adds one cluster as is. Returns whether it was new.
    pub fn add_cluster(&mut self, cluster: Cluster) -> bool {
        self.clusters.add_cluster(&mut self.arena, cluster)
    }

    /// Adds a species-completed cluster and its complement, skipping the
    /// empty and whole sets. Returns whether either side was new.
    pub fn add_bipartition(&mut self, cluster: Cluster) -> bool {
        let cluster = match &self.species {
            Some(spm) => spm.complete(&cluster),
            None => cluster,
        };
        if cluster.is_empty() || cluster.size() == self.universe {
            return false;
        }
        let comp = cluster.complement(self.universe);
        let added = self.add_cluster(cluster);
        self.add_cluster(comp) || added
    }

    /// Adds a cluster given over species ids, with its complement.
    pub fn add_species_bipartition(&mut self, species_cluster: &Cluster) -> bool {
        let cluster = match &self.species {
            Some(spm) => spm.expand(species_cluster),
            None => species_cluster.clone(),
        };
        self.add_bipartition(cluster)
    }
}

/// Knobs of search-space construction.
#[derive(Clone, Debug)]
pub struct SearchSpaceConfig {
    /// 0: observation trees only; 1: plus similarity-based clusters;
    /// 2: plus ranked-neighbour clusters
    pub augmentation: u8,
    /// Random one-per-side samples drawn for each polytomy
    pub polytomy_rounds: usize,
    /// Polytomies with more sides are not resolved
    pub polytomy_size_limit: usize,
    /// Graft missing taxa into incomplete trees before collecting clusters
    pub complete_trees: bool,
    pub seed: u64,
}

impl Default for SearchSpaceConfig {
    fn default() -> Self {
        SearchSpaceConfig {
            augmentation: 1,
            polytomy_rounds: 10,
            polytomy_size_limit: 100_000,
            complete_trees: true,
            seed: 0,
        }
    }
}

/// A built search space with the matrices and trees it was built from.
#[derive(Debug)]
pub struct BuiltSpace {
    pub space: SearchSpace,
    pub gene_matrix: SimilarityMatrix,
    pub species_matrix: SimilarityMatrix,
    /// Observation trees after completion, index-aligned with the forest;
    /// trees too small to complete are kept as given
    pub completed: Vec<ObservationTree>,
}

/// Builds the search space from a forest.
///
/// # Errors
/// Fails only on internal invariant violations; trees that are too small to
/// complete contribute their clusters uncompleted, with a warning.
pub fn build_search_space(
    forest: &Forest,
    species: Option<SpeciesMapper>,
    config: &SearchSpaceConfig,
) -> Result<BuiltSpace, SolverError> {
    let n = forest.taxon_count();
    let spm = species.unwrap_or_else(|| SpeciesMapper::identity(&forest.taxa));

    let gene_matrix = SimilarityMatrix::populate_by_quartet_distance(&forest.trees, n);
    let species_matrix = gene_matrix.to_species(&spm);

    let completed = complete_trees(forest, &gene_matrix, config.complete_trees)?;

    let mut space = SearchSpace::with_species(spm);
    for tree in &completed {
        for cluster in tree.clusters() {
            space.add_bipartition(cluster.clone());
        }
    }
    info!("Number of clusters after addition from observation trees: {}", space.cluster_count());

    if config.augmentation >= 1 {
        let quadratic = config.augmentation >= 2;
        for c in species_matrix.infer_tree_clusters() {
            space.add_species_bipartition(&c);
        }
        if quadratic {
            for c in species_matrix.quadratic_clusters() {
                space.add_species_bipartition(&c);
            }
        }
        info!("Number of clusters after addition by distance: {}", space.cluster_count());

        let mut rng = StdRng::seed_from_u64(config.seed);
        for tree in &completed {
            for sides in tree.polytomies() {
                if sides.len() > config.polytomy_size_limit {
                    continue;
                }
                let before = space.cluster_count();
                resolve_polytomy(&mut space, &species_matrix, &sides, config.polytomy_rounds, quadratic, &mut rng)?;
                debug!(
                    "polytomy of size {}: {} clusters added",
                    sides.len(),
                    space.cluster_count() - before
                );
            }
        }
        info!("Number of clusters after polytomy resolution: {}", space.cluster_count());
    }

    Ok(BuiltSpace { space, gene_matrix, species_matrix, completed })
}

fn complete_trees(forest: &Forest, matrix: &SimilarityMatrix, enabled: bool) -> Result<Vec<ObservationTree>, SolverError> {
    let missing = forest.incomplete_count();
    if !enabled || missing == 0 {
        return Ok(forest.trees.clone());
    }
    info!("Will attempt to complete {} trees with missing taxa using the similarity matrix", missing);
    forest
        .trees
        .par_iter()
        .enumerate()
        .map(|(index, tree)| match tree.complete(matrix) {
            Ok(t) => Ok(t),
            Err(SolverError::TooFewTaxa(k)) => {
                warn!("tree {index} has only {k} taxa and is used without completion");
                Ok(tree.clone())
            }
            Err(e) => Err(e),
        })
        .collect()
}

/// Adds UPGMA resolutions of one polytomy, given as taxon clusters.
fn resolve_polytomy(
    space: &mut SearchSpace,
    species_matrix: &SimilarityMatrix,
    taxon_sides: &[Cluster],
    rounds: usize,
    quadratic: bool,
    rng: &mut StdRng,
) -> Result<(), SolverError> {
    let sides: Vec<Cluster> = match space.species() {
        Some(spm) => taxon_sides.iter().map(|s| spm.species_cluster(s)).collect(),
        None => taxon_sides.to_vec(),
    };

    for c in species_matrix.resolve_by_upgma(&sides)? {
        space.add_species_bipartition(&c);
    }

    for _ in 0..rounds {
        let sample: Vec<usize> = sides
            .iter()
            .filter_map(|side| side.iter().nth(rng.gen_range(0..side.size())))
            .collect();
        let induced = species_matrix.induced(&sample);
        let mut found = induced.infer_tree_clusters();
        if quadratic {
            found.extend(induced.quadratic_clusters());
        }
        for restricted in found {
            let mut back = Cluster::empty(species_matrix.size());
            for j in restricted.iter() {
                back.or_assign(&sides[j]);
            }
            space.add_species_bipartition(&back);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxa::TaxonIdentifier;

    #[test]
    fn test_new_space_has_singletons_and_root() {
        let space = SearchSpace::new(5);
        assert_eq!(space.cluster_count(), 6);
        assert_eq!(space.arena().cluster(space.root()), &Cluster::full(5));
    }

    #[test]
    fn test_bipartitions_skip_trivial_sides() {
        let mut space = SearchSpace::new(4);
        assert!(!space.add_bipartition(Cluster::full(4)));
        assert!(!space.add_bipartition(Cluster::empty(4)));
        assert!(space.add_bipartition(Cluster::from_ids(4, [0, 1])));
        assert!(space.clusters().contains(space.arena(), &Cluster::from_ids(4, [2, 3])));
        assert!(!space.add_bipartition(Cluster::from_ids(4, [2, 3])));
        // the singleton exists, its complement is new
        assert!(space.add_bipartition(Cluster::singleton(4, 0)));
    }

    #[test]
    fn test_species_completion_of_bipartitions() {
        let taxa = TaxonIdentifier::from_names(["a1", "a2", "b1", "c1"]);
        let spm = SpeciesMapper::from_assignments(&taxa, [("a1", "A"), ("a2", "A")]).unwrap();
        let mut space = SearchSpace::with_species(spm);
        // {a1,a2} is a base cluster of the space
        assert!(space.clusters().contains(space.arena(), &Cluster::from_ids(4, [0, 1])));
        space.add_bipartition(Cluster::from_ids(4, [0, 2]));
        assert!(space.clusters().contains(space.arena(), &Cluster::from_ids(4, [0, 1, 2])));
        assert!(space.clusters().contains(space.arena(), &Cluster::singleton(4, 3)));
    }

    #[test]
    fn test_build_collects_tree_clusters() {
        let forest = Forest::from_newick_strs(&["((A,B),(C,(D,E)));", "((A,C),(B,D),E);"]).unwrap();
        let config = SearchSpaceConfig { augmentation: 0, ..SearchSpaceConfig::default() };
        let built = build_search_space(&forest, None, &config).unwrap();
        let space = &built.space;
        for tree in &forest.trees {
            for c in tree.clusters().filter(|c| c.size() < 5) {
                assert!(space.clusters().contains(space.arena(), c));
                assert!(space.clusters().contains(space.arena(), &c.complement(5)));
            }
        }
        assert_eq!(built.gene_matrix.size(), 5);
    }

    #[test]
    fn test_small_tree_kept_without_completion() {
        let forest = Forest::from_newick_strs(&["((A,B),(C,(D,E)));", "(A,C);"]).unwrap();
        let config = SearchSpaceConfig { augmentation: 0, ..SearchSpaceConfig::default() };
        let built = build_search_space(&forest, None, &config).unwrap();

        assert_eq!(built.completed.len(), forest.trees.len());
        assert!(built.completed[0].is_complete());
        assert_eq!(built.completed[1].tree_all(), &Cluster::from_ids(5, [0, 2]));

        let space = &built.space;
        assert!(space.clusters().contains(space.arena(), &Cluster::from_ids(5, [0, 2])));
        assert!(space.clusters().contains(space.arena(), &Cluster::from_ids(5, [1, 3, 4])));
    }

    #[test]
    fn test_augmentation_only_adds() {
        let newicks = ["((A,B),(C,(D,E)),F);", "((A,(B,C)),(D,E,F));", "(((A,F),B),(C,D));"];
        let forest = Forest::from_newick_strs(&newicks).unwrap();
        let plain = build_search_space(&forest, None, &SearchSpaceConfig { augmentation: 0, ..Default::default() })
            .unwrap();
        let rich = build_search_space(&forest, None, &SearchSpaceConfig { augmentation: 2, ..Default::default() })
            .unwrap();
        assert!(rich.space.cluster_count() >= plain.space.cluster_count());
        // third tree misses E and is completed
        assert!(rich.completed.iter().all(ObservationTree::is_complete));
        // polytomy (D,E,F) gets a UPGMA resolution: some pair of its sides
        let pairs = [[3usize, 4], [3, 5], [4, 5]];
        assert!(pairs.iter().any(|p| rich.space.clusters().contains(rich.space.arena(), &Cluster::from_ids(6, *p))));
    }
}
