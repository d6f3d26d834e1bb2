//! Joint Bayesian inference of transmission trees from dated phylogenies.
//!
//! One Markov chain runs per dataset over its colored tree (who infected
//! whom, and when) and its epidemiological parameters. A chosen subset of
//! the parameters can be shared: shared fields are updated with the pooled
//! likelihood of all datasets and always hold one value.
//!
//! Start with [`joint::JointSampler`].

pub mod colored_tree;
pub mod core;
pub mod distributions;
pub mod error;
pub mod io;
pub mod joint;
pub mod likelihood;
pub mod metropolis_hastings;
pub mod params;
pub mod phylogeny;
pub mod proposals;
pub mod recorder;
pub mod simulation;
pub mod stats;

pub use error::{Error, Result};
