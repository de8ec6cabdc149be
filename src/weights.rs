//! Split weights.
//!
//! A [`CostModel`] turns a candidate split of a cluster into a numeric weight.
//! Weights are maximized by the search. The [`WeightCache`] remembers each
//! weight by its unordered pair of sides so a split that recurs under a
//! different scope is never evaluated twice. It is shared across worker
//! threads in the pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use crate::cluster::Cluster;
use crate::forest::Forest;

/// A candidate split of `parent` into `left` and `right`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Split {
    pub left: Cluster,
    pub right: Cluster,
    pub parent: Cluster,
}

impl Split {
    pub fn new(left: Cluster, right: Cluster) -> Self {
        let parent = left.union(&right);
        Split { left, right, parent }
    }

    /// Taxa outside the parent; together with both sides this forms the
    /// tripartition around the split.
    pub fn context(&self, universe: usize) -> Cluster {
        self.parent.complement(universe)
    }

    /// Order-independent cache key.
    pub fn key(&self) -> (Cluster, Cluster) {
        if self.left <= self.right {
            (self.left.clone(), self.right.clone())
        } else {
            (self.right.clone(), self.left.clone())
        }
    }
}

/// Weight function for candidate splits.
///
/// Implementations must be pure. Splits whose weight cannot be computed
/// should return a weight that never wins rather than failing.
pub trait CostModel: Send + Sync {
    /// Weight of splitting `split.parent` into its two sides.
    fn split_weight(&self, split: &Split) -> f64;

    /// Score of a cluster that needs no further split.
    fn base_score(&self, _cluster: &Cluster) -> f64 {
        0.0
    }

    /// Combines the split weight with model-specific extra terms.
    fn combine(&self, weight: f64, _split: &Split) -> f64 {
        weight
    }
}

/// Concurrent split-weight memo.
#[derive(Debug, Default)]
pub struct WeightCache {
    weights: DashMap<(Cluster, Cluster), f64>,
    evaluations: AtomicUsize,
}

impl WeightCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, split: &Split) -> Option<f64> {
        self.weights.get(&split.key()).map(|w| *w)
    }

    /// Cached weight of `split`, evaluating `model` on a miss.
    pub fn get_or_compute(&self, model: &dyn CostModel, split: &Split) -> f64 {
        let key = split.key();
        if let Some(w) = self.weights.get(&key) {
            return *w;
        }
        let w = model.split_weight(split);
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        self.weights.insert(key, w);
        w
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Number of times the model was evaluated through this cache.
    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::Relaxed)
    }
}

/// Rooted clade frequency: a split scores the number of observation trees
/// that contain its left side as a clade plus the number that contain its
/// right side.
#[derive(Clone, Debug, Default)]
pub struct CladeSupport {
    counts: HashMap<Cluster, usize>,
}

impl CladeSupport {
    pub fn from_forest(forest: &Forest) -> Self {
        let mut counts = HashMap::new();
        for tree in &forest.trees {
            for cluster in tree.clusters() {
                *counts.entry(cluster.clone()).or_insert(0) += 1;
            }
        }
        CladeSupport { counts }
    }

    pub fn support(&self, cluster: &Cluster) -> usize {
        self.counts.get(cluster).copied().unwrap_or(0)
    }
}

impl CostModel for CladeSupport {
    fn split_weight(&self, split: &Split) -> f64 {
        (self.support(&split.left) + self.support(&split.right)) as f64
    }
}

/// Adapter for closures.
pub struct FnCost<F>(pub F);

impl<F> CostModel for FnCost<F>
where
    F: Fn(&Split) -> f64 + Send + Sync,
{
    fn split_weight(&self, split: &Split) -> f64 {
        (self.0)(split)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_evaluates_once_per_unordered_pair() {
        let calls = AtomicUsize::new(0);
        let model = FnCost(|s: &Split| {
            calls.fetch_add(1, Ordering::Relaxed);
            s.left.size() as f64 * 10.0 + s.right.size() as f64
        });
        let cache = WeightCache::new();
        let ab = Cluster::from_ids(4, [0, 1]);
        let c = Cluster::singleton(4, 2);

        let w1 = cache.get_or_compute(&model, &Split::new(ab.clone(), c.clone()));
        let w2 = cache.get_or_compute(&model, &Split::new(c.clone(), ab.clone()));
        assert_eq!(w1, 21.0);
        assert_eq!(w2, 21.0);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(cache.evaluations(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_split_context() {
        let split = Split::new(Cluster::singleton(5, 0), Cluster::singleton(5, 3));
        assert_eq!(split.parent, Cluster::from_ids(5, [0, 3]));
        assert_eq!(split.context(5), Cluster::from_ids(5, [1, 2, 4]));
    }

    #[test]
    fn test_clade_support() {
        let forest = Forest::from_newick_strs(&["((A,B),(C,D));", "((A,B),C,D);", "((A,C),(B,D));"]).unwrap();
        let model = CladeSupport::from_forest(&forest);
        let ab = Cluster::from_ids(4, [0, 1]);
        let cd = Cluster::from_ids(4, [2, 3]);
        assert_eq!(model.support(&ab), 2);
        assert_eq!(model.split_weight(&Split::new(ab, cd)), 3.0);
        assert_eq!(model.base_score(&Cluster::singleton(4, 0)), 0.0);
    }
}
