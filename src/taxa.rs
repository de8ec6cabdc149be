//! Taxon identifiers and the individual → species mapping.
//!
//! # CRITICAL: ids come from taxon NAMES
//! Node ids are assigned during tree parsing and differ across trees. Taxon
//! names are consistent, so every tree maps its leaves through one shared
//! [`TaxonIdentifier`]. When the universe is collected from the trees
//! themselves, names are sorted alphabetically so identical inputs always give
//! identical bit positions.

use std::collections::{BTreeSet, HashMap};

use phylotree::tree::Tree as PhyloTree;

use crate::cluster::Cluster;
use crate::error::SolverError;

/// Stable mapping between taxon names and ids in `[0, N)`.
#[derive(Debug, Clone, Default)]
pub struct TaxonIdentifier {
    names: Vec<String>,
    ids: HashMap<String, usize>,
}

impl TaxonIdentifier {
    /// Builds an identifier from names in the given order, ignoring repeats.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut taxa = TaxonIdentifier::default();
        for name in names {
            taxa.add(name.into());
        }
        taxa
    }

    /// Collects the leaf names of all trees, sorted alphabetically.
    ///
    /// # Errors
    /// Returns [`SolverError::UnnamedLeaf`] if a leaf has no name.
    pub fn from_trees(trees: &[PhyloTree]) -> Result<Self, SolverError> {
        let mut names = BTreeSet::new();
        for tree in trees {
            for leaf_id in tree.get_leaves() {
                let name = tree.get(&leaf_id)?.name.clone().ok_or(SolverError::UnnamedLeaf)?;
                names.insert(name);
            }
        }
        Ok(TaxonIdentifier::from_names(names))
    }

    /// Returns the id of `name`, registering it if it is new.
    pub fn add(&mut self, name: String) -> usize {
        if let Some(&id) = self.ids.get(&name) {
            return id;
        }
        let id = self.names.len();
        self.ids.insert(name.clone(), id);
        self.names.push(name);
        id
    }

    pub fn taxon_id(&self, name: &str) -> Option<usize> {
        self.ids.get(name).copied()
    }

    /// Like [`taxon_id`](Self::taxon_id) but reports unknown names as an error.
    pub fn require_id(&self, name: &str) -> Result<usize, SolverError> {
        self.taxon_id(name).ok_or_else(|| SolverError::UnknownTaxon(name.to_string()))
    }

    pub fn taxon_name(&self, id: usize) -> &str {
        &self.names[id]
    }

    pub fn taxon_count(&self) -> usize {
        self.names.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The whole-set cluster.
    pub fn all(&self) -> Cluster {
        Cluster::full(self.taxon_count())
    }

    /// Renders a cluster with taxon names, e.g. `{A, C}`.
    pub fn describe(&self, cluster: &Cluster) -> String {
        let names: Vec<&str> = cluster.iter().map(|id| self.taxon_name(id)).collect();
        format!("{{{}}}", names.join(", "))
    }
}

/// Maps each taxon (individual) to a species.
///
/// With one individual per species this is the identity and the species
/// universe equals the taxon universe.
#[derive(Debug, Clone)]
pub struct SpeciesMapper {
    taxon_to_species: Vec<usize>,
    species: TaxonIdentifier,
    members: Vec<Cluster>,
    taxon_count: usize,
}

impl SpeciesMapper {
    /// Every taxon is its own species.
    pub fn identity(taxa: &TaxonIdentifier) -> Self {
        let n = taxa.taxon_count();
        SpeciesMapper {
            taxon_to_species: (0..n).collect(),
            species: taxa.clone(),
            members: (0..n).map(|i| Cluster::singleton(n, i)).collect(),
            taxon_count: n,
        }
    }

    /// Builds a mapping from `(taxon name, species name)` pairs. Taxa without
    /// an assignment become their own species.
    ///
    /// # Errors
    /// Returns [`SolverError::UnknownTaxon`] for a taxon outside the universe.
    pub fn from_assignments<'a, I>(taxa: &TaxonIdentifier, pairs: I) -> Result<Self, SolverError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let n = taxa.taxon_count();
        let mut assigned: Vec<Option<String>> = vec![None; n];
        for (taxon, species) in pairs {
            assigned[taxa.require_id(taxon)?] = Some(species.to_string());
        }

        let mut species = TaxonIdentifier::default();
        let mut taxon_to_species = Vec::with_capacity(n);
        for (id, sp) in assigned.into_iter().enumerate() {
            let name = sp.unwrap_or_else(|| taxa.taxon_name(id).to_string());
            taxon_to_species.push(species.add(name));
        }

        let mut members = vec![Cluster::empty(n); species.taxon_count()];
        for (taxon, &sp) in taxon_to_species.iter().enumerate() {
            members[sp].insert(taxon);
        }

        Ok(SpeciesMapper { taxon_to_species, species, members, taxon_count: n })
    }

    pub fn species_count(&self) -> usize {
        self.species.taxon_count()
    }

    pub fn taxon_count(&self) -> usize {
        self.taxon_count
    }

    pub fn species_of(&self, taxon: usize) -> usize {
        self.taxon_to_species[taxon]
    }

    pub fn species_names(&self) -> &TaxonIdentifier {
        &self.species
    }

    /// Taxa belonging to `species`.
    pub fn members(&self, species: usize) -> &Cluster {
        &self.members[species]
    }

    pub fn is_single_individual(&self) -> bool {
        self.species_count() == self.taxon_count
    }

    /// Average number of individuals per species.
    pub fn mean_sampling(&self) -> f64 {
        if self.species_count() == 0 {
            return 0.0;
        }
        self.taxon_count as f64 / self.species_count() as f64
    }

    /// Whether all members of a taxon cluster belong to one species.
    pub fn is_single_species(&self, cluster: &Cluster) -> bool {
        let mut ids = cluster.iter().map(|t| self.species_of(t));
        match ids.next() {
            Some(first) => ids.all(|sp| sp == first),
            None => false,
        }
    }

    /// Maps a species-space cluster to the taxon cluster of all its individuals.
    pub fn expand(&self, species_cluster: &Cluster) -> Cluster {
        let mut out = Cluster::empty(self.taxon_count);
        for sp in species_cluster.iter() {
            out.or_assign(&self.members[sp]);
        }
        out
    }

    /// Completes a taxon cluster so that every species touched by it is fully
    /// included.
    pub fn complete(&self, cluster: &Cluster) -> Cluster {
        if self.is_single_individual() {
            return cluster.clone();
        }
        self.expand(&self.species_cluster(cluster))
    }

    /// Species-space cluster of the species touched by a taxon cluster.
    pub fn species_cluster(&self, cluster: &Cluster) -> Cluster {
        Cluster::from_ids(self.species_count(), cluster.iter().map(|t| self.species_of(t)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_sorted_from_trees() {
        let t1 = PhyloTree::from_newick("((Human,Chimp),Gorilla);").unwrap();
        let t2 = PhyloTree::from_newick("((Gorilla,Human),Orang);").unwrap();
        let taxa = TaxonIdentifier::from_trees(&[t1, t2]).unwrap();
        assert_eq!(taxa.names(), &["Chimp", "Gorilla", "Human", "Orang"]);
        assert_eq!(taxa.taxon_id("Human"), Some(2));
        assert!(taxa.require_id("Bonobo").is_err());
        assert_eq!(taxa.describe(&Cluster::from_ids(4, [0, 3])), "{Chimp, Orang}");
    }

    #[test]
    fn test_species_mapping() {
        let taxa = TaxonIdentifier::from_names(["a1", "a2", "b1", "c1", "c2"]);
        let spm = SpeciesMapper::from_assignments(
            &taxa,
            [("a1", "A"), ("a2", "A"), ("b1", "B"), ("c1", "C"), ("c2", "C")],
        )
        .unwrap();
        assert_eq!(spm.species_count(), 3);
        assert!(!spm.is_single_individual());
        assert!((spm.mean_sampling() - 5.0 / 3.0).abs() < 1e-12);

        assert!(spm.is_single_species(&Cluster::from_ids(5, [3, 4])));
        assert!(!spm.is_single_species(&Cluster::from_ids(5, [2, 3])));

        let touched = Cluster::from_ids(5, [0, 3]);
        assert_eq!(spm.complete(&touched), Cluster::from_ids(5, [0, 1, 3, 4]));
        assert_eq!(spm.expand(&Cluster::singleton(3, 1)), Cluster::singleton(5, 2));
    }

    #[test]
    fn test_identity_mapping() {
        let taxa = TaxonIdentifier::from_names(["x", "y", "z"]);
        let spm = SpeciesMapper::identity(&taxa);
        assert!(spm.is_single_individual());
        let c = Cluster::from_ids(3, [0, 2]);
        assert_eq!(spm.complete(&c), c);
        assert!(spm.is_single_species(&Cluster::singleton(3, 1)));
    }
}
