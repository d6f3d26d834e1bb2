/*!
# Joint sampler

[`JointSampler`] runs one Markov chain per dataset. Every chain has its own
colored tree and its own values for the non-shared parameters; the fields in
the sharing mask have a single value that all datasets read.

## One iteration

1. The master RNG draws one `u64` per dataset, in dataset order.
2. Each dataset seeds a private [`SmallRng`] with its draw and runs a sweep
   (tree moves, then its estimated non-shared fields in canonical field
   order). Sweeps only touch their own dataset, so with
   [`JointConfig::parallel`] they run on the rayon pool and give exactly the
   same result as a sequential run.
3. On the master RNG, one random-walk proposal per estimated shared field in
   canonical order. The proposal is scored with the pooled log-likelihood
   `Σ_d ll_d(θ') − ll_d(θ)` plus the change in the field's log prior
   (counted once) and is written to the shared store only if accepted.

`burnin` iterations run first and are not recorded; then `mcmc_iterations`
iterations run and every `thinning`-th is recorded. A run started with the
same seed, data and configuration reproduces the same samples.

```rust,no_run
use rand::SeedableRng;
use rand::rngs::SmallRng;
use transtree_mcmc::joint::{JointConfig, JointSampler};
use transtree_mcmc::params::{FieldSet, ParameterVector};
use transtree_mcmc::simulation::{simulate_outbreak, SimulationOptions};

let truth = ParameterVector::default();
let mut rng = SmallRng::seed_from_u64(1);
let phylogenies = (0..2)
    .map(|_| simulate_outbreak(&truth, 2010.0, &SimulationOptions::default(), &mut rng).map(|o| o.phylogeny))
    .collect::<Result<Vec<_>, _>>()
    .unwrap();

let config = JointConfig::new(2010.0).set_iterations(500).set_thinning(5);
let share = FieldSet::parse(["neg", "pi"]).unwrap();
let mut sampler = JointSampler::from_phylogenies(phylogenies, truth, share, config)
    .unwrap()
    .set_seed(42);
let run = sampler.run();
assert_eq!(run.chains[0].len(), 100);
```
*/

use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{MultiProgress, ProgressBar};
use rand::prelude::*;
use rayon::prelude::*;

use crate::core::{progress_style, run_chain, run_chain_with_progress, MarkovChain};
use crate::error::{Error, Result};
use crate::likelihood::{LikelihoodEngine, Priors};
use crate::metropolis_hastings::{DatasetChain, SweepPlan};
use crate::params::{FieldSet, JointParameters, ParamField, ParameterVector, SharingMask};
use crate::phylogeny::TimedPhylogeny;
use crate::proposals::{accept, propose_parameter, MoveWeights, ProposalSteps};
use crate::recorder::{ChainRecorder, Sample};
use crate::stats::{split_rhat, AcceptanceStats, MoveFamily, Rejection};

/// Settings of a joint run.
#[derive(Debug, Clone, PartialEq)]
pub struct JointConfig {
    /// End of the study; no sample is dated later.
    pub date_t: f64,
    /// Iterations after burn-in.
    pub mcmc_iterations: usize,
    /// Keep every `thinning`-th post-burn-in iteration.
    pub thinning: usize,
    /// Iterations discarded before recording starts.
    pub burnin: usize,
    /// Tree proposals per dataset and iteration.
    pub tree_moves_per_sweep: usize,
    /// Estimated fields; all others stay at their start values.
    pub update: FieldSet,
    pub priors: Priors,
    pub steps: ProposalSteps,
    pub weights: MoveWeights,
    /// Step of the ω grid; chosen per dataset when `None`.
    pub grid_step: Option<f64>,
    /// Run the per-dataset sweeps on the rayon pool.
    pub parallel: bool,
    /// Stop early after this wall-clock time.
    pub max_duration: Option<Duration>,
}

impl JointConfig {
    /// Default settings for a study ending at `date_t`.
    pub fn new(date_t: f64) -> Self {
        Self {
            date_t,
            mcmc_iterations: 1000,
            thinning: 1,
            burnin: 0,
            tree_moves_per_sweep: 10,
            update: FieldSet::empty()
                .with(ParamField::Neg)
                .with(ParamField::OffR)
                .with(ParamField::Pi),
            priors: Priors::default(),
            steps: ProposalSteps::default(),
            weights: MoveWeights::default(),
            grid_step: None,
            parallel: false,
            max_duration: None,
        }
    }

    pub fn set_iterations(mut self, mcmc_iterations: usize) -> Self {
        self.mcmc_iterations = mcmc_iterations;
        self
    }

    pub fn set_thinning(mut self, thinning: usize) -> Self {
        self.thinning = thinning;
        self
    }

    pub fn set_burnin(mut self, burnin: usize) -> Self {
        self.burnin = burnin;
        self
    }

    pub fn set_tree_moves(mut self, tree_moves_per_sweep: usize) -> Self {
        self.tree_moves_per_sweep = tree_moves_per_sweep;
        self
    }

    pub fn set_update(mut self, update: FieldSet) -> Self {
        self.update = update;
        self
    }

    pub fn set_priors(mut self, priors: Priors) -> Self {
        self.priors = priors;
        self
    }

    pub fn set_steps(mut self, steps: ProposalSteps) -> Self {
        self.steps = steps;
        self
    }

    pub fn set_weights(mut self, weights: MoveWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn set_grid_step(mut self, grid_step: f64) -> Self {
        self.grid_step = Some(grid_step);
        self
    }

    pub fn set_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn set_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }

    /// Checks the settings.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(Error::InvalidConfig(msg));
        if !self.date_t.is_finite() {
            return bad(format!("date_t must be finite, got {}", self.date_t));
        }
        if self.thinning == 0 {
            return bad("thinning must be at least 1".into());
        }
        if let Some(field) = self.update.iter().find(|f| !f.is_estimable()) {
            return bad(format!("{field} is fixed and cannot be updated"));
        }
        if let Some(step) = self.grid_step {
            if !(step.is_finite() && step > 0.0) {
                return bad(format!("grid_step must be positive, got {step}"));
            }
        }
        if !self.weights.is_valid() {
            return bad("move weights must be non-negative with a positive sum".into());
        }
        if !self.steps.is_valid() {
            return bad("proposal steps must be positive".into());
        }
        let priors = [
            self.priors.neg_rate,
            self.priors.off_r_rate,
            self.priors.pi_a,
            self.priors.pi_b,
        ];
        if priors.iter().any(|p| !(p.is_finite() && *p > 0.0)) {
            return bad("prior hyperparameters must be positive".into());
        }
        Ok(())
    }
}

/// The input of one dataset.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub phylogeny: Arc<TimedPhylogeny>,
    /// Start values; also the values of the fields that are not estimated.
    pub init: ParameterVector,
    /// Fields this dataset shares; must be the same for every dataset.
    pub share: FieldSet,
}

impl Dataset {
    pub fn new(phylogeny: impl Into<Arc<TimedPhylogeny>>, init: ParameterVector, share: FieldSet) -> Self {
        Self {
            phylogeny: phylogeny.into(),
            init,
            share,
        }
    }
}

/// Current state of a joint run.
#[derive(Debug, Clone)]
pub struct JointState {
    pub chains: Vec<DatasetChain>,
    pub params: JointParameters,
    pub shared_acceptance: AcceptanceStats,
}

impl JointState {
    /// Log prior of the estimated fields of one dataset (shared fields included).
    fn log_prior(&self, dataset: usize, priors: &Priors, update: FieldSet) -> f64 {
        priors.log_prior(&self.params.view(dataset), update)
    }

    fn sample(&self, dataset: usize, iteration: usize, priors: &Priors, update: FieldSet) -> Sample {
        let chain = &self.chains[dataset];
        Sample {
            iteration,
            tree: chain.tree().clone(),
            params: self.params.view(dataset),
            log_likelihood: chain.log_likelihood(),
            log_prior: self.log_prior(dataset, priors, update),
        }
    }
}

/// Output of [`JointSampler::run`].
#[derive(Debug, Clone)]
pub struct JointRun {
    /// Recorded samples, one recorder per dataset.
    pub chains: Vec<ChainRecorder>,
    /// Acceptance of tree moves and non-shared parameter moves, per dataset.
    pub acceptance: Vec<AcceptanceStats>,
    /// Acceptance of the pooled shared-parameter moves.
    pub shared_acceptance: AcceptanceStats,
    /// Post-burn-in iterations that ran before the run ended.
    pub iterations_completed: usize,
    /// The sharing mask of the run.
    pub share: SharingMask,
}

/// The joint MCMC driver.
#[derive(Debug, Clone)]
pub struct JointSampler {
    config: JointConfig,
    state: JointState,
    plan: SweepPlan,
    shared_fields: FieldSet,
    rng: SmallRng,
    /// The global random seed.
    pub seed: u64,
}

impl JointSampler {
    /**
    Validates the datasets and the configuration and builds the initial
    state. Fails before any iteration if there are no datasets, if datasets
    disagree on the sharing mask, if a start value lies outside its support,
    or if a phylogeny has a sample after `date_t`.

    Shared fields start at the value of dataset 0.
    */
    pub fn new(datasets: Vec<Dataset>, config: JointConfig) -> Result<Self> {
        config.validate()?;
        let first = datasets.first().ok_or(Error::NoDatasets)?;
        let share = first.share;
        for (d, dataset) in datasets.iter().enumerate() {
            if dataset.share != share {
                return Err(Error::SharingMaskMismatch {
                    dataset: d,
                    expected: share,
                    found: dataset.share,
                });
            }
            dataset.init.validate()?;
        }
        for field in share.iter() {
            let value = first.init.get(field);
            for (d, dataset) in datasets.iter().enumerate().skip(1) {
                if dataset.init.get(field) != value {
                    log::warn!(
                        "dataset {d} starts shared field {field} at {}, using {value} from dataset 0",
                        dataset.init.get(field)
                    );
                }
            }
        }

        let starts: Vec<ParameterVector> = datasets.iter().map(|d| d.init).collect();
        let params = JointParameters::new(share, &starts);
        let chains = datasets
            .iter()
            .enumerate()
            .map(|(d, dataset)| {
                let view = params.view(d);
                let engine = match config.grid_step {
                    Some(step) => LikelihoodEngine::new(config.date_t, step),
                    None => LikelihoodEngine::for_phylogeny(config.date_t, &dataset.phylogeny, &view),
                };
                DatasetChain::new(d, Arc::clone(&dataset.phylogeny), &view, engine)
            })
            .collect::<Result<Vec<_>>>()?;

        let plan = SweepPlan {
            tree_moves: config.tree_moves_per_sweep,
            weights: config.weights,
            steps: config.steps,
            priors: config.priors,
            local_fields: config.update.difference(&share),
        };
        let seed = thread_rng().gen::<u64>();
        Ok(Self {
            shared_fields: config.update.intersection(&share),
            plan,
            config,
            state: JointState {
                chains,
                params,
                shared_acceptance: AcceptanceStats::new(),
            },
            rng: SmallRng::seed_from_u64(seed),
            seed,
        })
    }

    /// Builds one [`Dataset`] per phylogeny, all starting from `init` and sharing `share`.
    pub fn from_phylogenies<P>(
        phylogenies: Vec<P>,
        init: ParameterVector,
        share: FieldSet,
        config: JointConfig,
    ) -> Result<Self>
    where
        P: Into<Arc<TimedPhylogeny>>,
    {
        let datasets = phylogenies
            .into_iter()
            .map(|p| Dataset::new(p, init, share))
            .collect();
        Self::new(datasets, config)
    }

    /// Sets the seed of the master random number generator.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn config(&self) -> &JointConfig {
        &self.config
    }

    pub fn n_datasets(&self) -> usize {
        self.state.chains.len()
    }

    /// Runs burn-in and the recorded iterations.
    pub fn run(&mut self) -> JointRun {
        self.run_inner(None)
    }

    /// Same as [`JointSampler::run`], with one progress bar per dataset.
    pub fn run_with_progress(&mut self) -> JointRun {
        let multi = MultiProgress::new();
        let style = progress_style();
        let overall = multi.add(ProgressBar::new(0));
        overall.set_prefix("Joint");
        overall.set_style(style.clone());
        let bars: Vec<ProgressBar> = (0..self.n_datasets())
            .map(|d| {
                let pb = multi.add(ProgressBar::new(0));
                pb.set_prefix(format!("Dataset {d}"));
                pb.set_style(style.clone());
                pb
            })
            .collect();

        let run = self.run_inner(Some((&overall, bars.as_slice())));
        for (pb, acceptance) in bars.iter().zip(&run.acceptance) {
            pb.finish_with_message(format!("p(accept) {:.2}", acceptance.total().rate()));
        }
        overall.finish_with_message("Done!");
        run
    }

    fn run_inner(&mut self, progress: Option<(&ProgressBar, &[ProgressBar])>) -> JointRun {
        let started = Instant::now();
        let deadline = self.config.max_duration.map(|d| started + d);
        let n = self.n_datasets();
        let (burnin, iterations, thinning) = (
            self.config.burnin,
            self.config.mcmc_iterations,
            self.config.thinning,
        );
        let priors = self.config.priors;
        let update = self.config.update;
        log::info!(
            "joint run: {n} datasets, sharing {}, {burnin} burn-in + {iterations} iterations, thinning {thinning}, seed {}",
            self.state.params.mask(),
            self.seed
        );

        let mut burned = 0;
        if burnin > 0 {
            burned = match progress {
                Some((overall, _)) => {
                    overall.set_message("burn-in");
                    run_chain_with_progress(self, burnin, deadline, overall, |_, _| {})
                }
                None => run_chain(self, burnin, deadline, |_, _| {}),
            };
        }

        let mut recorders: Vec<ChainRecorder> = (0..n)
            .map(|_| ChainRecorder::with_capacity(thinning, iterations / thinning.max(1)))
            .collect();
        let mut observe = |_: usize, state: &JointState| {
            for (d, recorder) in recorders.iter_mut().enumerate() {
                let kept = recorder.offer(|iteration| state.sample(d, iteration, &priors, update));
                if kept {
                    if let Some(sample) = recorder.last() {
                        log::debug!(
                            "dataset {d} sample {} (iteration {}): log-likelihood {:.3}, {} unsampled hosts",
                            recorder.len(),
                            sample.iteration,
                            sample.log_likelihood,
                            sample.tree.n_unsampled()
                        );
                    }
                }
            }
            if let Some((_, bars)) = progress {
                for (pb, chain) in bars.iter().zip(&state.chains) {
                    pb.inc(1);
                    pb.set_message(format!(
                        "p(accept) {:.2} ll {:.1}",
                        chain.acceptance().recent_rate(),
                        chain.log_likelihood()
                    ));
                }
            }
        };

        let completed = if burned < burnin {
            0
        } else {
            match progress {
                Some((overall, bars)) => {
                    overall.set_message("sampling");
                    for pb in bars {
                        pb.set_length(iterations as u64);
                    }
                    run_chain_with_progress(self, iterations, deadline, overall, &mut observe)
                }
                None => run_chain(self, iterations, deadline, &mut observe),
            }
        };

        if completed < iterations {
            log::warn!(
                "stopped after {} of {iterations} iterations ({burned} of {burnin} burn-in): time limit reached",
                completed
            );
        }

        let run = JointRun {
            chains: recorders,
            acceptance: self
                .state
                .chains
                .iter()
                .map(|c| c.acceptance().clone())
                .collect(),
            shared_acceptance: self.state.shared_acceptance.clone(),
            iterations_completed: completed,
            share: self.state.params.mask(),
        };
        self.log_summary(&run, started.elapsed());
        run
    }

    fn log_summary(&self, run: &JointRun, elapsed: Duration) {
        log::info!(
            "joint run finished {} iterations in {:.1?}",
            run.iterations_completed,
            elapsed
        );
        for (d, (recorder, acceptance)) in run.chains.iter().zip(&run.acceptance).enumerate() {
            log::info!(
                "dataset {d}: {} samples, acceptance {acceptance}",
                recorder.len()
            );
            for field in self.config.update.iter() {
                if let Some(rhat) = split_rhat(recorder.trajectory(field).view()) {
                    log::info!("dataset {d}: split R-hat of {field} = {rhat:.3}");
                }
            }
        }
        if !self.shared_fields.is_empty() {
            log::info!("shared fields: acceptance {}", run.shared_acceptance);
        }
    }

    /// Runs the per-dataset sweeps of one iteration.
    fn sweep_datasets(&mut self) {
        let seeds: Vec<u64> = (0..self.n_datasets()).map(|_| self.rng.gen()).collect();
        let plan = &self.plan;
        let state = &mut self.state;
        let mut handles = state.params.datasets_mut();
        if self.config.parallel {
            state
                .chains
                .par_iter_mut()
                .zip(handles.par_iter_mut())
                .zip(seeds.par_iter())
                .for_each(|((chain, params), &seed)| {
                    let mut rng = SmallRng::seed_from_u64(seed);
                    chain.sweep(&mut rng, params, plan);
                });
        } else {
            for ((chain, params), &seed) in state.chains.iter_mut().zip(handles.iter_mut()).zip(&seeds) {
                let mut rng = SmallRng::seed_from_u64(seed);
                chain.sweep(&mut rng, params, plan);
            }
        }
    }

    /// One pooled update of a shared field, drawn from the master stream.
    fn update_shared(&mut self, field: ParamField) {
        let current = self.state.params.shared(field);
        let Some((value, log_hastings)) =
            propose_parameter(&self.config.steps, field, current, &mut self.rng)
        else {
            return;
        };
        let family = MoveFamily::Parameter(field);
        let stats = &mut self.state.shared_acceptance;
        if !ParameterVector::in_support(field, value) {
            stats.record(family, Err(Rejection::OutOfSupport));
            return;
        }

        let params = &self.state.params;
        let evaluate = |(d, chain): (usize, &DatasetChain)| {
            chain.evaluate(&params.view(d).with(field, value))
        };
        let evaluations: Vec<_> = if self.config.parallel {
            self.state.chains.par_iter().enumerate().map(evaluate).collect()
        } else {
            self.state.chains.iter().enumerate().map(evaluate).collect()
        };

        let mut delta = 0.0;
        for (chain, evaluation) in self.state.chains.iter().zip(&evaluations) {
            if !evaluation.log_likelihood.is_finite() {
                log::warn!(
                    "dataset {}: rejecting shared {field} = {value} with log-likelihood {}",
                    chain.index(),
                    evaluation.log_likelihood
                );
                self.state
                    .shared_acceptance
                    .record(family, Err(Rejection::NonFinite));
                return;
            }
            delta += evaluation.log_likelihood - chain.log_likelihood();
        }
        let priors = &self.config.priors;
        let log_ratio =
            delta + priors.ln_density(field, value) - priors.ln_density(field, current) + log_hastings;

        if accept(log_ratio, &mut self.rng) {
            self.state.params.set_shared(field, value);
            for (chain, evaluation) in self.state.chains.iter_mut().zip(evaluations) {
                chain.commit(evaluation);
            }
            self.state.shared_acceptance.record(family, Ok(()));
        } else {
            self.state
                .shared_acceptance
                .record(family, Err(Rejection::Declined));
        }
    }
}

impl MarkovChain for JointSampler {
    type State = JointState;

    fn step(&mut self) -> &JointState {
        self.sweep_datasets();
        let shared = self.shared_fields;
        for field in shared.iter() {
            self.update_shared(field);
        }
        &self.state
    }

    fn current_state(&self) -> &JointState {
        &self.state
    }
}
