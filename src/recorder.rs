/*!
Storage of the retained states of one dataset's chain.

A [`ChainRecorder`] is offered the state after every post-burn-in iteration
and keeps every `thinning`-th one. Samples hold a full copy of the colored
tree (the phylogeny itself is shared) and of the dataset's effective
parameters, so shared fields appear with the value every dataset saw at that
iteration.
*/

use ndarray::Array1;

use crate::colored_tree::ColoredTree;
use crate::params::{ParamField, ParameterVector};

/// One retained state.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Post-burn-in iteration (1-based) at which the state was recorded.
    pub iteration: usize,
    pub tree: ColoredTree,
    pub params: ParameterVector,
    pub log_likelihood: f64,
    /// Log prior of the dataset's estimated parameters, shared ones included.
    pub log_prior: f64,
}

/// Thinned, insertion-ordered samples of one chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainRecorder {
    samples: Vec<Sample>,
    thinning: usize,
    offered: usize,
}

impl ChainRecorder {
    /// A recorder keeping every `thinning`-th offered state (at least every state).
    pub fn new(thinning: usize) -> Self {
        Self {
            samples: Vec::new(),
            thinning: thinning.max(1),
            offered: 0,
        }
    }

    /// Like [`ChainRecorder::new`], reserving room for `capacity` samples.
    pub fn with_capacity(thinning: usize, capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            ..Self::new(thinning)
        }
    }

    /// Whether the next offered state will be kept.
    pub fn wants_next(&self) -> bool {
        (self.offered + 1) % self.thinning == 0
    }

    /**
    Offers the state after one iteration. `make` is only called when the
    state is kept, so skipped iterations cost nothing. Returns whether the
    state was kept.
    */
    pub fn offer<F>(&mut self, make: F) -> bool
    where
        F: FnOnce(usize) -> Sample,
    {
        let keep = self.wants_next();
        self.offered += 1;
        if keep {
            self.samples.push(make(self.offered));
        }
        keep
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn thinning(&self) -> usize {
        self.thinning
    }

    /// Number of iterations offered so far.
    pub fn iterations(&self) -> usize {
        self.offered
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn last(&self) -> Option<&Sample> {
        self.samples.last()
    }

    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }

    /// Values of one parameter across the retained samples.
    pub fn trajectory(&self, field: ParamField) -> Array1<f64> {
        self.samples.iter().map(|s| s.params.get(field)).collect()
    }

    pub fn log_likelihoods(&self) -> Array1<f64> {
        self.samples.iter().map(|s| s.log_likelihood).collect()
    }

    /// Number of unsampled hosts per retained sample.
    pub fn unsampled_counts(&self) -> Vec<usize> {
        self.samples.iter().map(|s| s.tree.n_unsampled()).collect()
    }
}
