/*!
# Metropolis–Hastings updates of one dataset

A [`DatasetChain`] owns the colored tree of one dataset together with its
likelihood engine, the cached [`OmegaTable`] and its acceptance statistics.
One [`DatasetChain::sweep`] performs

1. `tree_moves` tree proposals, each of a kind drawn from the
   [`MoveWeights`];
2. one random-walk proposal per estimated, non-shared field, in canonical
   field order.

Every proposal is accepted iff `ln u <= Δ log posterior + log Hastings`.
Tree edits go through [`ColoredTree::apply_move`] on a copy, so a rejected
proposal leaves the chain's tree exactly as it was. Proposals with a
non-finite likelihood are logged and rejected.

Shared fields are not touched here; the joint driver updates them with
[`DatasetChain::evaluate`] and [`DatasetChain::commit`].
*/

use std::sync::Arc;

use rand::Rng;

use crate::colored_tree::ColoredTree;
use crate::error::{Error, Result};
use crate::likelihood::{LikelihoodEngine, OmegaTable, Priors};
use crate::params::{DatasetParams, FieldSet, ParameterVector};
use crate::phylogeny::TimedPhylogeny;
use crate::proposals::{accept, propose_parameter, propose_tree_move, MoveWeights, ProposalSteps};
use crate::stats::{AcceptanceStats, MoveFamily, Rejection};

/// What one sweep does.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepPlan {
    pub tree_moves: usize,
    pub weights: MoveWeights,
    pub steps: ProposalSteps,
    pub priors: Priors,
    /// Estimated fields updated inside the sweep (the non-shared ones).
    pub local_fields: FieldSet,
}

/// A candidate log-likelihood together with the table it was computed with.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub log_likelihood: f64,
    table: Option<OmegaTable>,
}

/// The state and bookkeeping of one dataset's chain.
#[derive(Debug, Clone)]
pub struct DatasetChain {
    index: usize,
    tree: ColoredTree,
    engine: LikelihoodEngine,
    cache: Option<OmegaTable>,
    log_likelihood: f64,
    acceptance: AcceptanceStats,
}

impl DatasetChain {
    /**
    Builds the chain of dataset `index` from its phylogeny, starting from the
    default coloring of [`ColoredTree::initialize`].
    */
    pub fn new(
        index: usize,
        phylogeny: Arc<TimedPhylogeny>,
        params: &ParameterVector,
        engine: LikelihoodEngine,
    ) -> Result<Self> {
        let tree = ColoredTree::initialize(phylogeny, params, engine.date_t())
            .map_err(|source| Error::InitialTree {
                dataset: index,
                source,
            })?;
        Ok(Self::from_tree(index, tree, params, engine))
    }

    /// Builds a chain starting from a given tree.
    pub fn from_tree(
        index: usize,
        tree: ColoredTree,
        params: &ParameterVector,
        engine: LikelihoodEngine,
    ) -> Self {
        let mut cache = None;
        let log_likelihood = engine.log_likelihood_cached(&tree, params, &mut cache);
        if !log_likelihood.is_finite() {
            log::warn!("dataset {index}: initial state has log-likelihood {log_likelihood}");
        }
        Self {
            index,
            tree,
            engine,
            cache,
            log_likelihood,
            acceptance: AcceptanceStats::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn tree(&self) -> &ColoredTree {
        &self.tree
    }

    pub fn engine(&self) -> &LikelihoodEngine {
        &self.engine
    }

    /// Log-likelihood of the current tree under the current parameters.
    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    pub fn acceptance(&self) -> &AcceptanceStats {
        &self.acceptance
    }

    /// Log-likelihood of the current tree under `params`, without changing the chain.
    pub fn evaluate(&self, params: &ParameterVector) -> Evaluation {
        let mut table = self.cache.clone().filter(|t| t.matches(params));
        let log_likelihood = self
            .engine
            .log_likelihood_cached(&self.tree, params, &mut table);
        Evaluation {
            log_likelihood,
            table,
        }
    }

    /// Adopts an accepted parameter change evaluated with [`DatasetChain::evaluate`].
    pub fn commit(&mut self, evaluation: Evaluation) {
        self.log_likelihood = evaluation.log_likelihood;
        if evaluation.table.is_some() {
            self.cache = evaluation.table;
        }
    }

    /// Runs one sweep of tree and local parameter updates.
    pub fn sweep<R: Rng + ?Sized>(&mut self, rng: &mut R, params: &mut DatasetParams<'_>, plan: &SweepPlan) {
        for _ in 0..plan.tree_moves {
            self.tree_step(rng, &params.effective(), plan);
        }
        for field in plan.local_fields.iter() {
            let current = params.effective();
            let Some((value, log_hastings)) =
                propose_parameter(&plan.steps, field, current.get(field), rng)
            else {
                continue;
            };
            let family = MoveFamily::Parameter(field);
            if !ParameterVector::in_support(field, value) {
                self.acceptance.record(family, Err(Rejection::OutOfSupport));
                continue;
            }
            let proposed = current.with(field, value);
            let evaluation = self.evaluate(&proposed);
            let Some(log_ratio) = self.checked_ratio(evaluation.log_likelihood, family) else {
                continue;
            };
            let log_ratio = log_ratio + plan.priors.ln_density(field, value)
                - plan.priors.ln_density(field, current.get(field))
                + log_hastings;
            if accept(log_ratio, rng) {
                params.set_local(field, value);
                self.commit(evaluation);
                self.acceptance.record(family, Ok(()));
            } else {
                self.acceptance.record(family, Err(Rejection::Declined));
            }
        }
    }

    fn tree_step<R: Rng + ?Sized>(&mut self, rng: &mut R, params: &ParameterVector, plan: &SweepPlan) {
        let kind = plan.weights.choose(rng);
        let Some((mv, log_hastings)) = propose_tree_move(&self.tree, kind, &plan.steps, rng) else {
            return;
        };
        let family = MoveFamily::Tree(kind);
        let mut candidate = self.tree.clone();
        if candidate.apply_move(&mv).is_err() {
            self.acceptance.record(family, Err(Rejection::Invalid));
            return;
        }
        let proposed_ll = self
            .engine
            .log_likelihood_cached(&candidate, params, &mut self.cache);
        let Some(log_ratio) = self.checked_ratio(proposed_ll, family) else {
            return;
        };
        if accept(log_ratio + log_hastings, rng) {
            self.tree = candidate;
            self.log_likelihood = proposed_ll;
            self.acceptance.record(family, Ok(()));
        } else {
            self.acceptance.record(family, Err(Rejection::Declined));
        }
    }

    /// Likelihood difference to the current state, or `None` (recorded as a rejection) if non-finite.
    fn checked_ratio(&mut self, proposed_ll: f64, family: MoveFamily) -> Option<f64> {
        if proposed_ll.is_finite() {
            return Some(proposed_ll - self.log_likelihood);
        }
        log::warn!(
            "dataset {}: rejecting {:?} with log-likelihood {}",
            self.index,
            family,
            proposed_ll
        );
        self.acceptance.record(family, Err(Rejection::NonFinite));
        None
    }
}
