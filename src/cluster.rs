//! Compact bit-vector representation of taxon clusters.
//!
//! # Overview
//! A cluster is a subset of the taxon universe. Each bit position corresponds
//! to a taxon id, so the cluster of a tree node is the OR of its children.
//!
//! # Example
//! For a universe [A, B, C, D] mapped to ids [0, 1, 2, 3]:
//! - Cluster {A, C} → word `0b0101` (bits 0 and 2 set)
//! - Cluster {B, C, D} → word `0b1110` (bits 1, 2, 3 set)
//!
//! The complement of a cluster inside a parent cluster is `parent XOR cluster`,
//! which is how the search space synthesizes the "other side" of a split.

use std::fmt;

/// A subset of the taxon universe with a cached cardinality.
///
/// Internally stores bits in `Vec<u64>` words to support arbitrarily many taxa.
/// Equality and hashing depend only on bit content (the cached size is a pure
/// function of the words).
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Cluster {
    words: Vec<u64>,
    size: usize,
}

impl Cluster {
    /// Creates an empty cluster able to hold `universe` taxa.
    ///
    /// ```
    /// # use tree_lattice::cluster::Cluster;
    /// // 100 taxa need 2 words (128 bits)
    /// let c = Cluster::empty(100);
    /// assert_eq!(c.words().len(), 2);
    /// assert!(c.is_empty());
    /// ```
    pub fn empty(universe: usize) -> Self {
        Cluster { words: vec![0u64; universe.div_ceil(64)], size: 0 }
    }

    /// The cluster holding every taxon of a universe of size `universe`.
    pub fn full(universe: usize) -> Self {
        let mut c = Cluster::empty(universe);
        for w in 0..universe / 64 {
            c.words[w] = u64::MAX;
        }
        let rest = universe & 63;
        if rest != 0 {
            c.words[universe >> 6] = (1u64 << rest) - 1;
        }
        c.size = universe;
        c
    }

    pub fn singleton(universe: usize, id: usize) -> Self {
        let mut c = Cluster::empty(universe);
        c.insert(id);
        c
    }

    pub fn from_ids<I: IntoIterator<Item = usize>>(universe: usize, ids: I) -> Self {
        let mut c = Cluster::empty(universe);
        for id in ids {
            c.insert(id);
        }
        c
    }

    /// Marks taxon `idx` as a member. Returns whether it was newly added.
    #[inline]
    pub fn insert(&mut self, idx: usize) -> bool {
        let word = idx >> 6;     // Equivalent to idx / 64
        let bit = idx & 63;      // Equivalent to idx % 64
        let mask = 1u64 << bit;
        let fresh = self.words[word] & mask == 0;
        if fresh {
            self.words[word] |= mask;
            self.size += 1;
        }
        fresh
    }

    /// Removes taxon `idx`. Returns whether it was a member.
    #[inline]
    pub fn remove(&mut self, idx: usize) -> bool {
        let word = idx >> 6;
        let mask = 1u64 << (idx & 63);
        let present = self.words[word] & mask != 0;
        if present {
            self.words[word] &= !mask;
            self.size -= 1;
        }
        present
    }

    #[inline]
    pub fn contains(&self, idx: usize) -> bool {
        let word = idx >> 6;
        word < self.words.len() && self.words[word] & (1u64 << (idx & 63)) != 0
    }

    /// Performs bitwise OR with another cluster (union in place).
    ///
    /// ```
    /// # use tree_lattice::cluster::Cluster;
    /// let mut left = Cluster::singleton(4, 0);   // {0}
    /// let right = Cluster::singleton(4, 1);      // {1}
    /// left.or_assign(&right);                    // {0} ∪ {1} = {0, 1}
    /// assert_eq!(left.words()[0], 0b11);
    /// assert_eq!(left.size(), 2);
    /// ```
    #[inline]
    pub fn or_assign(&mut self, other: &Cluster) {
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a |= *b;
        }
        self.recount();
    }

    pub fn union(&self, other: &Cluster) -> Cluster {
        let mut c = self.clone();
        c.or_assign(other);
        c
    }

    /// Symmetric difference. For `self ⊆ parent`, `parent.xor(self)` is the
    /// complement of `self` within `parent`.
    pub fn xor(&self, other: &Cluster) -> Cluster {
        let words: Vec<u64> = self.words.iter().zip(&other.words).map(|(a, b)| a ^ b).collect();
        Cluster::from_words(words)
    }

    /// Complement of `self` inside `parent` (`parent XOR self`).
    pub fn complement_within(&self, parent: &Cluster) -> Cluster {
        parent.xor(self)
    }

    /// Complement of `self` inside the whole universe of `universe` taxa.
    pub fn complement(&self, universe: usize) -> Cluster {
        self.complement_within(&Cluster::full(universe))
    }

    pub fn is_subset_of(&self, other: &Cluster) -> bool {
        self.size <= other.size
            && self.words.iter().zip(&other.words).all(|(a, b)| a & !b == 0)
    }

    pub fn is_disjoint(&self, other: &Cluster) -> bool {
        self.words.iter().zip(&other.words).all(|(a, b)| a & b == 0)
    }

    pub fn intersection_size(&self, other: &Cluster) -> usize {
        self.words
            .iter()
            .zip(&other.words)
            .map(|(a, b)| (a & b).count_ones() as usize)
            .sum()
    }

    /// Number of member taxa (cached population count).
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Lowest member id, if any.
    pub fn first(&self) -> Option<usize> {
        self.iter().next()
    }

    /// Iterates member ids in increasing order.
    pub fn iter(&self) -> Ones<'_> {
        Ones { words: &self.words, word_idx: 0, current: self.words.first().copied().unwrap_or(0) }
    }

    fn from_words(words: Vec<u64>) -> Cluster {
        let mut c = Cluster { words, size: 0 };
        c.recount();
        c
    }

    fn recount(&mut self) {
        self.size = self.words.iter().map(|w| w.count_ones() as usize).sum();
    }
}

/// Iterator over the set bits of a [`Cluster`].
pub struct Ones<'a> {
    words: &'a [u64],
    word_idx: usize,
    current: u64,
}

impl Iterator for Ones<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            if self.current != 0 {
                let bit = self.current.trailing_zeros() as usize;
                self.current &= self.current - 1;
                return Some((self.word_idx << 6) + bit);
            }
            self.word_idx += 1;
            if self.word_idx >= self.words.len() {
                return None;
            }
            self.current = self.words[self.word_idx];
        }
    }
}

impl fmt::Display for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (k, id) in self.iter().enumerate() {
            if k > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{id}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_basic() {
        let mut c = Cluster::empty(4);
        c.insert(0);
        c.insert(2);
        assert_eq!(c.words()[0], 0b0101);
        assert_eq!(c.size(), 2);
        assert!(!c.insert(2));
        assert_eq!(c.size(), 2);
    }

    #[test]
    fn test_cluster_or() {
        let mut c1 = Cluster::from_ids(4, [0, 1]);
        let c2 = Cluster::from_ids(4, [2, 3]);
        c1.or_assign(&c2);
        assert_eq!(c1.words()[0], 0b1111);
        assert_eq!(c1.size(), 4);
    }

    /// Visual example: how clusters represent a small tree
    ///
    /// ```text
    ///           root
    ///          /    \
    ///        node1   D
    ///        /   \
    ///       A    node2
    ///            /   \
    ///           B     C
    /// ```
    ///
    /// Leaf mapping: A=0, B=1, C=2, D=3
    ///
    /// - node2: {B, C} → `0b0110`
    /// - node1: {A, B, C} → `0b0111`
    /// - complement of node1 within the root: {D} → `0b1000`
    #[test]
    fn test_mini_tree_example() {
        let node2 = Cluster::from_ids(4, [1, 2]);
        assert_eq!(node2.words()[0], 0b0110);

        let mut node1 = Cluster::singleton(4, 0);
        node1.or_assign(&node2);
        assert_eq!(node1.words()[0], 0b0111);
        assert_eq!(node1.size(), 3);

        let d = node1.complement(4);
        assert_eq!(d.words()[0], 0b1000);
        assert_eq!(d, Cluster::singleton(4, 3));
    }

    #[test]
    fn test_large_universe() {
        let c = Cluster::from_ids(128, [0, 63, 64, 127]);
        assert_eq!(c.size(), 4);
        assert_eq!(c.words()[0], 1u64 | (1u64 << 63));
        assert_eq!(c.words()[1], 1u64 | (1u64 << 63));
        assert_eq!(c.iter().collect::<Vec<_>>(), vec![0, 63, 64, 127]);
    }

    #[test]
    fn test_full_cluster_partial_word() {
        let all = Cluster::full(70);
        assert_eq!(all.size(), 70);
        assert!(all.contains(69));
        assert!(!all.contains(70));
        assert_eq!(all.words()[1], (1u64 << 6) - 1);
    }

    #[test]
    fn test_complement_sizes_sum_to_universe() {
        for n in [1usize, 5, 64, 65, 130] {
            let all = Cluster::full(n);
            for k in 0..n.min(20) {
                let c = Cluster::from_ids(n, (0..n).filter(|i| i % (k + 1) == 0));
                let comp = c.complement(n);
                assert_eq!(c.size() + comp.size(), n);
                assert!(c.is_disjoint(&comp));
                assert_eq!(c.union(&comp), all);
            }
        }
    }

    #[test]
    fn test_subset_and_remove() {
        let parent = Cluster::from_ids(8, [1, 2, 3, 5]);
        let mut child = Cluster::from_ids(8, [2, 5]);
        assert!(child.is_subset_of(&parent));
        assert!(!parent.is_subset_of(&child));
        assert_eq!(child.complement_within(&parent), Cluster::from_ids(8, [1, 3]));
        assert_eq!(parent.intersection_size(&child), 2);

        assert!(child.remove(5));
        assert!(!child.remove(5));
        assert_eq!(child.size(), 1);
        assert_eq!(child.first(), Some(2));
        assert_eq!(child.to_string(), "{2}");
    }
}
