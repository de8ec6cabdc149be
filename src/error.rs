use phylotree::tree::TreeError;
use thiserror::Error;

/// Errors that can occur while building the search space or solving it.
///
/// A cluster that has no valid bipartition is *not* an error: it is reported as
/// [`Resolution::Unresolvable`](crate::vertex::Resolution) and only becomes
/// [`SolverError::RootUnresolvable`] when it is the whole taxon set.
#[derive(Error, Debug)]
pub enum SolverError {
    /// An observation tree could not be traversed
    #[error("Problem with an observation tree: {0}")]
    Tree(#[from] TreeError),
    /// A newick string could not be parsed
    #[error("Failed to parse tree {index}: {message}")]
    Newick { index: usize, message: String },
    /// A leaf label is not part of the taxon universe
    #[error("Unknown taxon name: {0}")]
    UnknownTaxon(String),
    /// Observation trees must have named leaves
    #[error("All leaf nodes of observation trees must be named.")]
    UnnamedLeaf,
    /// Completion needs at least three present taxa
    #[error("Tree has {0} taxa; it cannot be completed")]
    TooFewTaxa(usize),
    /// The whole taxon set has no resolution in the materialized search space
    #[error("No resolution found for the whole set ({size} taxa): {members}")]
    RootUnresolvable { size: usize, members: String },
    /// A pipeline thread or channel failed
    #[error("Pipeline failure: {0}")]
    Pipeline(String),
    /// Reading or writing files failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A broken internal invariant
    #[error("Invariant violated: {0}")]
    Invariant(&'static str),
}
