//! Error types for the joint transmission-tree sampler.
//!
//! Every variant of [`Error`] is fatal and is raised before the first MCMC
//! iteration. Problems that arise while sampling (invalid tree edits,
//! non-finite densities) are rejections, see [`InvalidMove`] and
//! [`crate::stats::Rejection`].

use crate::params::{FieldSet, ParamField};
use crate::phylogeny::NodeId;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Fatal errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A phylogeny is malformed.
    #[error("invalid phylogeny: {0}")]
    InputValidation(#[from] PhylogenyError),

    /// A dataset cannot be turned into a valid initial colored tree.
    #[error("dataset {dataset} has no valid initial colored tree")]
    InitialTree {
        /// Index of the dataset.
        dataset: usize,
        /// Why the phylogeny is unusable.
        #[source]
        source: PhylogenyError,
    },

    /// Datasets disagree on which parameters are shared.
    #[error("dataset {dataset} shares {found} but dataset 0 shares {expected}")]
    SharingMaskMismatch {
        /// Index of the offending dataset.
        dataset: usize,
        /// Mask of the first dataset.
        expected: FieldSet,
        /// Mask of the offending dataset.
        found: FieldSet,
    },

    /// A parameter lies outside its support.
    #[error("parameter {field} = {value} is outside its support")]
    InvalidParameters {
        /// The offending field.
        field: ParamField,
        /// Its value.
        value: f64,
    },

    /// A field name could not be parsed.
    #[error("unknown parameter name `{0}`")]
    UnknownField(String),

    /// The run configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A joint run needs at least one dataset.
    #[error("no datasets supplied")]
    NoDatasets,

    /// The outbreak simulator gave up.
    #[error("simulation failed: {0}")]
    Simulation(String),
}

/// Structural problems of a [`crate::phylogeny::TimedPhylogeny`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PhylogenyError {
    /// No nodes at all.
    #[error("the phylogeny has no nodes")]
    Empty,

    /// A node id does not exist.
    #[error("node {0} does not exist")]
    UnknownNode(NodeId),

    /// A node was used as a child twice.
    #[error("node {0} has more than one parent")]
    MultipleParents(NodeId),

    /// Some nodes cannot be reached from the root.
    #[error("{unreachable} node(s) are not connected to root {root}")]
    Disconnected {
        /// The root the builder was finished with.
        root: NodeId,
        /// How many nodes are unreachable.
        unreachable: usize,
    },

    /// The chosen root has a parent.
    #[error("node {0} is not a root")]
    NotARoot(NodeId),

    /// A child is not strictly later than its parent.
    #[error("node {child} (t = {child_time}) is not later than its parent {parent} (t = {parent_time})")]
    NonIncreasingTime {
        /// The parent node.
        parent: NodeId,
        /// Its time.
        parent_time: f64,
        /// The child node.
        child: NodeId,
        /// Its time.
        child_time: f64,
    },

    /// A node time is NaN or infinite.
    #[error("node {0} has a non-finite time")]
    NonFiniteTime(NodeId),

    /// Two leaves carry the same host label.
    #[error("leaf label `{0}` is used twice")]
    DuplicateLabel(String),

    /// A sample was taken after the end of the study.
    #[error("leaf `{label}` is sampled at {time}, after the study end {date_t}")]
    LeafAfterHorizon {
        /// Host label.
        label: String,
        /// Sample time.
        time: f64,
        /// Study end.
        date_t: f64,
    },
}

/// A tree edit that would break a colored-tree invariant.
///
/// Returned by [`crate::colored_tree::ColoredTree::apply_move`]; the sampler
/// turns it into a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid move: {0}")]
pub struct InvalidMove(pub &'static str);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phylogeny_errors_keep_their_cause() {
        let err = Error::from(PhylogenyError::MultipleParents(3));
        assert_eq!(
            err.to_string(),
            "invalid phylogeny: node 3 has more than one parent"
        );
    }
}
