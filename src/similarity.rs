//! Pairwise taxon similarity.
//!
//! # Overview
//! The similarity between two taxa is the fraction of quartets containing both
//! of them in which they are siblings, accumulated over the whole forest:
//!
//! ```text
//!   sim(x, y) = Σ_trees #{ {u,v} : xy|uv in tree } / Σ_trees C(|tree| - 2, 2)
//! ```
//!
//! At an internal node with sides S1..Sk, every pair `x ∈ Si, y ∈ Sj` is
//! separated by the node, and a pair `{u, v}` drawn from one other side `Sm`
//! completes a quartet where x and y are siblings. Pairs split across two other
//! sides form unresolved quartets and are not counted. Each resolved quartet is
//! counted at exactly one node. The diagonal is fixed at 1.0.
//!
//! The matrix is read-only once built. Derived matrices (species level,
//! induced on a sample) are independent instances.

use std::cmp::Ordering;
use std::sync::OnceLock;

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::debug;

use crate::cluster::Cluster;
use crate::error::SolverError;
use crate::forest::ObservationTree;
use crate::taxa::SpeciesMapper;

/// Symmetric n × n similarity matrix.
#[derive(Debug)]
pub struct SimilarityMatrix {
    values: Vec<Vec<f64>>,
    /// Per row: other taxa by decreasing similarity, built on first use
    ordered: OnceLock<Vec<Vec<usize>>>,
}

impl Clone for SimilarityMatrix {
    fn clone(&self) -> Self {
        SimilarityMatrix::from_values(self.values.clone())
    }
}

fn choose2(c: usize) -> f64 {
    (c * c.saturating_sub(1) / 2) as f64
}

impl SimilarityMatrix {
    pub fn from_values(values: Vec<Vec<f64>>) -> Self {
        SimilarityMatrix { values, ordered: OnceLock::new() }
    }

    /// Populates the matrix from a forest over `n` taxa.
    ///
    /// # Algorithm
    /// Trees are processed in parallel. Each tree adds its sibling-quartet
    /// counts and its denominators to shared accumulators; every row of the
    /// accumulators has its own lock and only the upper triangle is written.
    /// The parallel loop returns once every tree is done, after which the
    /// counts are normalized and mirrored.
    pub fn populate_by_quartet_distance(trees: &[ObservationTree], n: usize) -> Self {
        // (quartet count, denominator) for cells (i, j) with i < j
        let rows: Vec<Mutex<Vec<(f64, f64)>>> = (0..n).map(|_| Mutex::new(vec![(0.0, 0.0); n])).collect();

        trees.par_iter().for_each(|tree| {
            let all = tree.tree_all().size();
            for sides in tree.node_sides() {
                let within: Vec<f64> = sides.iter().map(|s| choose2(s.size())).collect();
                let total: f64 = within.iter().sum();
                for (i, left) in sides.iter().enumerate() {
                    for (j, right) in sides.iter().enumerate().skip(i + 1) {
                        // Sibling pairs for (x, y) come from a single other side
                        let c = total - within[i] - within[j];
                        if c == 0.0 {
                            continue;
                        }
                        accumulate_pairs(&rows, left, right, c);
                    }
                }
            }

            let members: Vec<usize> = tree.tree_all().iter().collect();
            let denom = choose2(all.saturating_sub(2));
            for (k, &a) in members.iter().enumerate() {
                let mut row = rows[a].lock();
                for &b in &members[k + 1..] {
                    row[b].1 += denom;
                }
            }
        });

        let mut values = vec![vec![0.0; n]; n];
        for (i, row) in rows.into_iter().enumerate() {
            let row = row.into_inner();
            values[i][i] = 1.0;
            for j in i + 1..n {
                let (count, denom) = row[j];
                let v = if denom > 0.0 { count / denom } else { 0.0 };
                values[i][j] = v;
                values[j][i] = v;
            }
        }
        debug!("similarity matrix populated from {} trees over {} taxa", trees.len(), n);
        SimilarityMatrix::from_values(values)
    }

    pub fn size(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[i][j]
    }

    pub fn values(&self) -> &[Vec<f64>] {
        &self.values
    }

    fn ordered(&self) -> &[Vec<usize>] {
        self.ordered.get_or_init(|| {
            (0..self.size())
                .map(|i| {
                    let row = &self.values[i];
                    let mut inds: Vec<usize> = (0..self.size()).collect();
                    // Decreasing similarity, ties toward the larger id
                    inds.sort_by(|&a, &b| row[b].total_cmp(&row[a]).then(b.cmp(&a)));
                    inds
                })
                .collect()
        })
    }

    /// The most similar taxon to `missing` that is present or has a smaller id.
    ///
    /// Missing taxa are grafted in increasing id order, so every smaller id
    /// is already in the tree by the time `missing` is added.
    pub fn closest_present_taxon(&self, present: &Cluster, missing: usize) -> Option<usize> {
        self.ordered()
            .get(missing)?
            .iter()
            .copied()
            .find(|&other| other < missing || present.contains(other))
    }

    /// Which of `a`, `b`, `c` pairs with `x` under the four-point condition.
    ///
    /// Compares `xa + bc`, `xb + ac` and `xc + ab` and returns the partner of
    /// the largest sum. Ties resolve to the earlier argument.
    pub fn better_side_by_four_point(&self, x: usize, a: usize, b: usize, c: usize) -> usize {
        let v = &self.values;
        let with_a = v[x][a] + v[b][c];
        let with_b = v[x][b] + v[a][c];
        let with_c = v[x][c] + v[a][b];
        if with_a >= with_b && with_a >= with_c {
            a
        } else if with_b >= with_c {
            b
        } else {
            c
        }
    }

    /// UPGMA over the singletons of this matrix: `n - 2` nested merges.
    pub fn infer_tree_clusters(&self) -> Vec<Cluster> {
        let n = self.size();
        let groups = (0..n).map(|i| Cluster::singleton(n, i)).collect();
        upgma_loop(vec![1.0; n], groups, self.values.clone())
    }

    /// Agglomerates the given groups by average inter-group similarity.
    ///
    /// Each returned cluster is the union of the groups merged so far; `k`
    /// groups give `k - 2` clusters for `k > 2` and none otherwise.
    ///
    /// # Errors
    /// Returns [`SolverError::Invariant`] if a group is empty.
    pub fn resolve_by_upgma(&self, groups: &[Cluster]) -> Result<Vec<Cluster>, SolverError> {
        if groups.iter().any(Cluster::is_empty) {
            return Err(SolverError::Invariant("cannot average similarity over an empty group"));
        }
        let k = groups.len();
        let mut sims = vec![vec![0.0; k]; k];
        for i in 0..k {
            sims[i][i] = 1.0;
            for j in i + 1..k {
                let mut total = 0.0;
                for a in groups[i].iter() {
                    for b in groups[j].iter() {
                        total += self.values[a][b];
                    }
                }
                let avg = total / (groups[i].size() * groups[j].size()) as f64;
                sims[i][j] = avg;
                sims[j][i] = avg;
            }
        }
        let weights = groups.iter().map(|g| g.size() as f64).collect();
        Ok(upgma_loop(weights, groups.to_vec(), sims))
    }

    /// Species-level matrix: the average similarity over all pairs of
    /// individuals of the two species.
    pub fn to_species(&self, spm: &SpeciesMapper) -> SimilarityMatrix {
        if spm.is_single_individual() {
            return self.clone();
        }
        let s = spm.species_count();
        let mut sums = vec![vec![0.0; s]; s];
        let mut counts = vec![vec![0usize; s]; s];
        for i in 0..self.size() {
            let si = spm.species_of(i);
            for j in i + 1..self.size() {
                let sj = spm.species_of(j);
                if si == sj {
                    continue;
                }
                sums[si][sj] += self.values[i][j];
                sums[sj][si] += self.values[i][j];
                counts[si][sj] += 1;
                counts[sj][si] += 1;
            }
        }
        let mut values = vec![vec![0.0; s]; s];
        for a in 0..s {
            for b in 0..s {
                values[a][b] = if a == b {
                    1.0
                } else if counts[a][b] > 0 {
                    sums[a][b] / counts[a][b] as f64
                } else {
                    0.0
                };
            }
        }
        SimilarityMatrix::from_values(values)
    }

    /// Matrix restricted to `sample`; row `i` of the result is taxon `sample[i]`.
    pub fn induced(&self, sample: &[usize]) -> SimilarityMatrix {
        let values = sample
            .iter()
            .map(|&a| sample.iter().map(|&b| self.values[a][b]).collect())
            .collect();
        SimilarityMatrix::from_values(values)
    }

    /// Ranked-neighbour clusters: for every taxon, the nested prefixes of all
    /// taxa sorted by decreasing similarity to it (ties toward the smaller id).
    pub fn quadratic_clusters(&self) -> Vec<Cluster> {
        let n = self.size();
        let mut out = Vec::with_capacity(n * n);
        for row in &self.values {
            let mut inds: Vec<usize> = (0..n).collect();
            inds.sort_by(|&a, &b| match row[b].total_cmp(&row[a]) {
                Ordering::Equal => a.cmp(&b),
                ord => ord,
            });
            let mut prefix = Cluster::empty(n);
            for i in inds {
                prefix.insert(i);
                out.push(prefix.clone());
            }
        }
        out
    }
}

/// Adds `c` to every cell (l, r), l ∈ left, r ∈ right, in the upper triangle.
fn accumulate_pairs(rows: &[Mutex<Vec<(f64, f64)>>], left: &Cluster, right: &Cluster, c: f64) {
    for l in left.iter() {
        let mut row = rows[l].lock();
        for r in right.iter().filter(|&r| r > l) {
            row[r].0 += c;
        }
    }
    for r in right.iter() {
        let mut row = rows[r].lock();
        for l in left.iter().filter(|&l| l > r) {
            row[l].0 += c;
        }
    }
}

/// Merges the closest pair of live groups until two remain.
///
/// Each row's best partner is its most similar live group (ties toward the
/// larger index); the first row with a strictly better partner wins. The
/// merged group's similarity to every other group is the weighted average of
/// the two merged rows.
fn upgma_loop(mut weights: Vec<f64>, mut groups: Vec<Cluster>, mut sims: Vec<Vec<f64>>) -> Vec<Cluster> {
    let k = groups.len();
    let mut alive = vec![true; k];
    let mut left = k;
    let mut merges = Vec::with_capacity(k.saturating_sub(2));

    while left > 2 {
        let mut best: Option<(usize, usize)> = None;
        let mut best_hit = f64::NEG_INFINITY;
        for i in (0..k).filter(|&i| alive[i]) {
            let partner = (0..k)
                .filter(|&j| j != i && alive[j])
                .max_by(|&a, &b| sims[i][a].total_cmp(&sims[i][b]).then(a.cmp(&b)));
            if let Some(j) = partner {
                if sims[i][j] > best_hit {
                    best_hit = sims[i][j];
                    best = Some((i, j));
                }
            }
        }
        let Some((i, j)) = best else { break };

        let merged = groups[i].union(&groups[j]);
        let (wi, wj) = (weights[i], weights[j]);
        for m in (0..k).filter(|&m| alive[m] && m != i && m != j) {
            let v = (sims[i][m] * wi + sims[j][m] * wj) / (wi + wj);
            sims[i][m] = v;
            sims[m][i] = v;
        }
        weights[i] = wi + wj;
        alive[j] = false;
        groups[i] = merged.clone();
        merges.push(merged);
        left -= 1;
    }
    merges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::Forest;
    use crate::taxa::TaxonIdentifier;

    fn matrix(rows: &[&[f64]]) -> SimilarityMatrix {
        SimilarityMatrix::from_values(rows.iter().map(|r| r.to_vec()).collect())
    }

    #[test]
    fn test_quartet_population_single_tree() {
        let forest = Forest::from_newick_strs(&["((A,B),(C,D));"]).unwrap();
        let m = SimilarityMatrix::populate_by_quartet_distance(&forest.trees, 4);
        // Only quartet AB|CD: siblings are (A,B) and (C,D)
        assert_eq!(m.get(0, 1), 1.0);
        assert_eq!(m.get(2, 3), 1.0);
        assert_eq!(m.get(0, 2), 0.0);
        assert_eq!(m.get(1, 3), 0.0);
        for i in 0..4 {
            assert_eq!(m.get(i, i), 1.0);
        }
    }

    #[test]
    fn test_quartet_population_is_symmetric_and_bounded() {
        let forest = Forest::from_newick_strs(&[
            "(((A,B),C),(D,(E,F)));",
            "((A,(B,C)),(D,E),F);",
            "((A,C),(B,D));",
        ])
        .unwrap();
        let n = forest.taxon_count();
        let m = SimilarityMatrix::populate_by_quartet_distance(&forest.trees, n);
        for i in 0..n {
            for j in 0..n {
                assert_eq!(m.get(i, j), m.get(j, i));
                assert!((0.0..=1.0).contains(&m.get(i, j)));
            }
        }
        // A and B are siblings in the first tree only
        assert!(m.get(0, 1) > 0.0);
    }

    #[test]
    fn test_quartet_population_ignores_unresolved_quartets() {
        // A star resolves no quartet at all
        let forest = Forest::from_newick_strs(&["(A,B,C,D);"]).unwrap();
        let m = SimilarityMatrix::populate_by_quartet_distance(&forest.trees, 4);
        for (i, j) in [(0, 1), (0, 2), (2, 3)] {
            assert_eq!(m.get(i, j), 0.0);
        }

        // Only AB|CD, AB|CE and AB|DE are resolved; C and D are siblings in
        // one of the three quartets holding both
        let forest = Forest::from_newick_strs(&["((A,B),C,D,E);"]).unwrap();
        let m = SimilarityMatrix::populate_by_quartet_distance(&forest.trees, 5);
        assert_eq!(m.get(0, 1), 1.0);
        assert!((m.get(2, 3) - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(m.get(0, 2), 0.0);
    }

    #[test]
    fn test_closest_present_taxon() {
        let m = matrix(&[
            &[1.0, 0.2, 0.9, 0.1],
            &[0.2, 1.0, 0.3, 0.8],
            &[0.9, 0.3, 1.0, 0.4],
            &[0.1, 0.8, 0.4, 1.0],
        ]);
        let present = Cluster::from_ids(4, [0, 1, 2]);
        assert_eq!(m.closest_present_taxon(&present, 3), Some(1));
        // taxon 2 is absent but smaller than 3, so it still qualifies
        let present = Cluster::from_ids(4, [0, 1]);
        assert_eq!(m.closest_present_taxon(&present, 3), Some(1));
        let present = Cluster::from_ids(4, [1]);
        assert_eq!(m.closest_present_taxon(&present, 2), Some(0));
    }

    #[test]
    fn test_four_point_prefers_sibling() {
        let m = matrix(&[
            &[1.0, 0.9, 0.1, 0.1],
            &[0.9, 1.0, 0.1, 0.1],
            &[0.1, 0.1, 1.0, 0.7],
            &[0.1, 0.1, 0.7, 1.0],
        ]);
        assert_eq!(m.better_side_by_four_point(0, 1, 2, 3), 1);
        assert_eq!(m.better_side_by_four_point(0, 2, 1, 3), 1);
        assert_eq!(m.better_side_by_four_point(2, 0, 1, 3), 3);
    }

    #[test]
    fn test_four_point_independent_of_population_order() {
        // Relabel taxa with a permutation; the chosen partner must follow.
        let base = [
            [1.0, 0.6, 0.2, 0.3, 0.5],
            [0.6, 1.0, 0.4, 0.1, 0.2],
            [0.2, 0.4, 1.0, 0.8, 0.3],
            [0.3, 0.1, 0.8, 1.0, 0.6],
            [0.5, 0.2, 0.3, 0.6, 1.0],
        ];
        let perm = [3usize, 0, 4, 1, 2];
        let mut permuted = vec![vec![0.0; 5]; 5];
        for i in 0..5 {
            for j in 0..5 {
                permuted[perm[i]][perm[j]] = base[i][j];
            }
        }
        let m1 = SimilarityMatrix::from_values(base.iter().map(|r| r.to_vec()).collect());
        let m2 = SimilarityMatrix::from_values(permuted);
        for (x, a, b, c) in [(0, 1, 2, 3), (4, 0, 2, 3), (2, 3, 1, 0)] {
            let r1 = m1.better_side_by_four_point(x, a, b, c);
            let r2 = m2.better_side_by_four_point(perm[x], perm[a], perm[b], perm[c]);
            assert_eq!(perm[r1], r2);
        }
    }

    #[test]
    fn test_upgma_merge_count() {
        let m = matrix(&[
            &[1.0, 0.9, 0.2, 0.1, 0.3],
            &[0.9, 1.0, 0.3, 0.2, 0.1],
            &[0.2, 0.3, 1.0, 0.8, 0.4],
            &[0.1, 0.2, 0.8, 1.0, 0.5],
            &[0.3, 0.1, 0.4, 0.5, 1.0],
        ]);
        for k in 0..=5 {
            let groups: Vec<Cluster> = (0..k).map(|i| Cluster::singleton(5, i)).collect();
            let merges = m.resolve_by_upgma(&groups).unwrap();
            assert_eq!(merges.len(), k.saturating_sub(2));
        }
        let tree = m.infer_tree_clusters();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree[0], Cluster::from_ids(5, [0, 1]));
        assert_eq!(tree[1], Cluster::from_ids(5, [2, 3]));
    }

    #[test]
    fn test_upgma_over_groups_unions_members() {
        let m = matrix(&[
            &[1.0, 0.9, 0.1, 0.1, 0.1],
            &[0.9, 1.0, 0.1, 0.1, 0.1],
            &[0.1, 0.1, 1.0, 0.2, 0.2],
            &[0.1, 0.1, 0.2, 1.0, 0.2],
            &[0.1, 0.1, 0.2, 0.2, 1.0],
        ]);
        let groups = vec![
            Cluster::singleton(5, 0),
            Cluster::singleton(5, 1),
            Cluster::from_ids(5, [2, 3]),
            Cluster::singleton(5, 4),
        ];
        let merges = m.resolve_by_upgma(&groups).unwrap();
        assert_eq!(merges, vec![Cluster::from_ids(5, [0, 1]), Cluster::from_ids(5, [2, 3, 4])]);
        assert!(m.resolve_by_upgma(&[Cluster::empty(5), Cluster::singleton(5, 1)]).is_err());
    }

    #[test]
    fn test_species_and_induced_matrices() {
        let m = matrix(&[
            &[1.0, 0.8, 0.2, 0.4],
            &[0.8, 1.0, 0.6, 0.0],
            &[0.2, 0.6, 1.0, 0.5],
            &[0.4, 0.0, 0.5, 1.0],
        ]);
        let taxa = TaxonIdentifier::from_names(["a1", "a2", "b1", "b2"]);
        let spm = SpeciesMapper::from_assignments(&taxa, [("a1", "A"), ("a2", "A"), ("b1", "B"), ("b2", "B")])
            .unwrap();
        let sp = m.to_species(&spm);
        assert_eq!(sp.size(), 2);
        assert_eq!(sp.get(0, 0), 1.0);
        assert!((sp.get(0, 1) - 0.3).abs() < 1e-12);

        let sub = m.induced(&[3, 1]);
        assert_eq!(sub.values(), &[vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_quadratic_clusters_are_nested_prefixes() {
        let m = matrix(&[&[1.0, 0.5, 0.7], &[0.5, 1.0, 0.5], &[0.7, 0.5, 1.0]]);
        let q = m.quadratic_clusters();
        assert_eq!(q.len(), 9);
        assert_eq!(q[0], Cluster::singleton(3, 0));
        assert_eq!(q[1], Cluster::from_ids(3, [0, 2]));
        assert_eq!(q[2], Cluster::full(3));
        // row 1: itself, then 0 and 2 tie → smaller id first
        assert_eq!(q[4], Cluster::from_ids(3, [0, 1]));
    }
}
