/*!
# Likelihood of a colored tree

[`LikelihoodEngine::log_likelihood`] scores a [`ColoredTree`] under its
[`ParameterVector`] as the sum of two terms.

**Genealogical term.** Inside every host the lineages (the host's own
sample and one lineage per onward transmission) coalesce backwards in time
under a constant-size coalescent: each pair merges at rate `1 / neg`.

**Epidemiological term.** For a host infected at τ with infectees at
τ₁ … τₖ and infectious until r (its sampling date if sampled, otherwise the
study end `dateT`):

```text
  sampled:     ln π + ln f_ws(s − τ)
  unsampled:   ln(1 − π F_ws(dateT − τ))
  offspring:   Σ ln f_w(τᵢ − τ) + ln G⁽ᵏ⁾(a(τ, r))
```

where `G` is the probability generating function of the negative-binomial
offspring distribution and `a(τ, r)` the probability that one offspring of
the host leaves no sampled descendant:
`a(τ, r) = ∫₀^{r−τ} f_w(g) ω(τ + g) dg + 1 − F_w(r − τ)`.
`ω(t)` is the probability that a host infected at `t` has no sampled
descendant by `dateT`; it solves
`ω(t) = (1 − π F_ws(dateT − t)) · G(a(t, dateT))` with `ω(t ≥ dateT) = 1` and
is tabulated on a grid by [`OmegaTable`].

Everything is computed in log space, and the result is a pure function of
`(tree, parameters)`.
*/

use crate::colored_tree::{ColoredTree, Host};
use crate::distributions::{ln_beta_pdf, ln_exp_pdf, GammaInterval, NegBinomial};
use crate::params::{FieldSet, ParamField, ParameterVector};
use crate::phylogeny::TimedPhylogeny;

/// Default number of grid cells per mean generation interval.
const CELLS_PER_GENERATION: f64 = 20.0;

/// Upper bound on the number of grid cells spanning a typical tree.
const TARGET_MAX_CELLS: f64 = 400.0;

/**
Tabulated probability `ω(t)` that a host infected at `t` has no sampled
descendant, on the grid `tᵢ = dateT − i·step`.

Each value only depends on values closer to `dateT`, so growing the table
towards the past never changes existing entries.
*/
#[derive(Debug, Clone, PartialEq)]
pub struct OmegaTable {
    params: ParameterVector,
    date_t: f64,
    step: f64,
    /// F_w(k·step)
    w_cdf: Vec<f64>,
    /// ω(tᵢ)
    omega: Vec<f64>,
}

impl OmegaTable {
    fn new(params: &ParameterVector, date_t: f64, step: f64) -> Self {
        Self {
            params: *params,
            date_t,
            step,
            w_cdf: vec![0.0],
            omega: vec![1.0],
        }
    }

    /// Whether the table was built for the epidemiological part of `params`.
    pub fn matches(&self, params: &ParameterVector) -> bool {
        self.params.same_epidemiology(params)
    }

    /// Number of tabulated grid points.
    pub fn len(&self) -> usize {
        self.omega.len()
    }

    pub fn is_empty(&self) -> bool {
        self.omega.is_empty()
    }

    /// Grows the table so that it covers `earliest` (plus one cell).
    fn extend_to(&mut self, earliest: f64) {
        let needed = ((self.date_t - earliest) / self.step).floor() as usize + 2;
        if needed <= self.omega.len() {
            return;
        }
        let w = GammaInterval::new(self.params.w_shape, self.params.w_scale);
        let ws = GammaInterval::new(self.params.ws_shape, self.params.ws_scale);
        let offspring = NegBinomial::new(self.params.off_r, self.params.off_p);
        let pi = self.params.pi;

        while self.w_cdf.len() <= needed {
            let k = self.w_cdf.len();
            self.w_cdf.push(w.cdf(k as f64 * self.step));
        }
        for i in self.omega.len()..needed {
            let mut miss = 1.0 - self.w_cdf[i];
            for k in 0..i {
                miss += (self.w_cdf[k + 1] - self.w_cdf[k]) * self.omega[i - k - 1];
            }
            let unsampled = (-pi * ws.cdf(i as f64 * self.step)).ln_1p();
            let value = (unsampled + offspring.ln_pgf(miss.clamp(0.0, 1.0))).exp();
            self.omega.push(value.clamp(0.0, 1.0));
        }
    }

    /// ω(t) by linear interpolation; 1 at or after `dateT`.
    pub fn omega(&self, t: f64) -> f64 {
        if t >= self.date_t {
            return 1.0;
        }
        let x = (self.date_t - t) / self.step;
        let i = x.floor() as usize;
        if i + 1 >= self.omega.len() {
            return *self.omega.last().unwrap_or(&1.0);
        }
        let frac = x - i as f64;
        self.omega[i] * (1.0 - frac) + self.omega[i + 1] * frac
    }

    /// `a(τ, r)`: probability that one offspring of a host infected at `tau`
    /// and infectious until `until` leaves no sampled descendant.
    pub fn miss_probability(&self, tau: f64, until: f64) -> f64 {
        let span = until - tau;
        if !(span > 0.0) {
            return 1.0;
        }
        let w = GammaInterval::new(self.params.w_shape, self.params.w_scale);
        let full = (span / self.step).floor() as usize;
        let mut miss = 0.0;
        let mut last_cdf = 0.0;
        for k in 0..full.min(self.w_cdf.len().saturating_sub(1)) {
            let mass = self.w_cdf[k + 1] - self.w_cdf[k];
            miss += mass * self.omega(tau + (k + 1) as f64 * self.step);
            last_cdf = self.w_cdf[k + 1];
        }
        let cdf_span = w.cdf(span);
        miss += (cdf_span - last_cdf).max(0.0) * self.omega(until);
        miss += 1.0 - cdf_span;
        miss.clamp(0.0, 1.0)
    }
}

/// Prior distributions of the estimable parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Priors {
    /// Rate of the exponential prior on `neg`.
    pub neg_rate: f64,
    /// Rate of the exponential prior on `off.r`.
    pub off_r_rate: f64,
    /// Beta prior on `pi`.
    pub pi_a: f64,
    pub pi_b: f64,
}

impl Default for Priors {
    fn default() -> Self {
        Self {
            neg_rate: 1.0,
            off_r_rate: 1.0,
            pi_a: 1.0,
            pi_b: 1.0,
        }
    }
}

impl Priors {
    /// Log prior density of one field. `off.p` is uniform on (0, 1); fixed fields contribute 0.
    pub fn ln_density(&self, field: ParamField, value: f64) -> f64 {
        match field {
            ParamField::Neg => ln_exp_pdf(value, self.neg_rate),
            ParamField::OffR => ln_exp_pdf(value, self.off_r_rate),
            ParamField::OffP => {
                if value > 0.0 && value < 1.0 {
                    0.0
                } else {
                    f64::NEG_INFINITY
                }
            }
            ParamField::Pi => ln_beta_pdf(value, self.pi_a, self.pi_b),
            _ => 0.0,
        }
    }

    /// Log prior of the given fields of `params`.
    pub fn log_prior(&self, params: &ParameterVector, fields: FieldSet) -> f64 {
        fields
            .iter()
            .map(|f| self.ln_density(f, params.get(f)))
            .sum()
    }
}

/// The two components of the log-likelihood.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogLikelihood {
    pub genealogical: f64,
    pub epidemiological: f64,
}

impl LogLikelihood {
    pub fn total(&self) -> f64 {
        self.genealogical + self.epidemiological
    }
}

/// Scores colored trees for one dataset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LikelihoodEngine {
    date_t: f64,
    grid_step: f64,
    max_cells: usize,
}

impl LikelihoodEngine {
    /// An engine for the study end `date_t` with the given grid step.
    pub fn new(date_t: f64, grid_step: f64) -> Self {
        Self {
            date_t,
            grid_step,
            max_cells: 50_000,
        }
    }

    /**
    Chooses a grid step for a phylogeny: a twentieth of the mean generation
    interval, coarsened so that the span from a generation before the root
    to `date_t` needs at most a few hundred cells.
    */
    pub fn for_phylogeny(date_t: f64, phylogeny: &TimedPhylogeny, params: &ParameterVector) -> Self {
        let generation = params.mean_generation_time();
        let span = date_t - phylogeny.time(phylogeny.root()) + 2.0 * generation;
        let step = (generation / CELLS_PER_GENERATION).max(span / TARGET_MAX_CELLS);
        Self::new(date_t, step)
    }

    /// Caps the grid size; trees reaching further into the past get zero density.
    pub fn with_max_cells(mut self, max_cells: usize) -> Self {
        self.max_cells = max_cells;
        self
    }

    pub fn date_t(&self) -> f64 {
        self.date_t
    }

    pub fn grid_step(&self) -> f64 {
        self.grid_step
    }

    /// Builds an [`OmegaTable`] for `params` reaching back to `earliest`.
    pub fn omega_table(&self, params: &ParameterVector, earliest: f64) -> Option<OmegaTable> {
        let mut table = OmegaTable::new(params, self.date_t, self.grid_step);
        self.ensure(&mut table, earliest).then_some(table)
    }

    fn ensure(&self, table: &mut OmegaTable, earliest: f64) -> bool {
        let cells = (self.date_t - earliest) / self.grid_step;
        if !cells.is_finite() || cells > self.max_cells as f64 {
            return false;
        }
        table.extend_to(earliest);
        true
    }

    /// Log-likelihood of `tree` under `params`.
    pub fn log_likelihood(&self, tree: &ColoredTree, params: &ParameterVector) -> f64 {
        let mut cache = None;
        self.log_likelihood_cached(tree, params, &mut cache)
    }

    /**
    Same value as [`LikelihoodEngine::log_likelihood`], reusing `cache` when
    it was built for the same epidemiological parameters. The cache is
    replaced or grown as needed.
    */
    pub fn log_likelihood_cached(
        &self,
        tree: &ColoredTree,
        params: &ParameterVector,
        cache: &mut Option<OmegaTable>,
    ) -> f64 {
        self.terms_cached(tree, params, cache)
            .map(|terms| terms.total())
            .unwrap_or(f64::NEG_INFINITY)
    }

    /// Both terms of the log-likelihood; `None` when the tree has zero density.
    pub fn terms_cached(
        &self,
        tree: &ColoredTree,
        params: &ParameterVector,
        cache: &mut Option<OmegaTable>,
    ) -> Option<LogLikelihood> {
        let hosts = tree.hosts().ok()?;
        let earliest = tree.root_infection();

        let table = match cache {
            Some(table) if table.matches(params) => table,
            _ => cache.insert(OmegaTable::new(params, self.date_t, self.grid_step)),
        };
        if !self.ensure(table, earliest) {
            return None;
        }

        Some(LogLikelihood {
            genealogical: self.genealogical_term(&hosts, params.neg),
            epidemiological: self.epidemiological_term(&hosts, params, table),
        })
    }

    /// Within-host coalescent log-density summed over hosts.
    pub fn genealogical_term(&self, hosts: &[Host], neg: f64) -> f64 {
        hosts.iter().map(|host| within_host_coalescent(host, neg)).sum()
    }

    /// Transmission, sampling and offspring log-probability summed over hosts.
    pub fn epidemiological_term(
        &self,
        hosts: &[Host],
        params: &ParameterVector,
        table: &OmegaTable,
    ) -> f64 {
        let w = GammaInterval::new(params.w_shape, params.w_scale);
        let ws = GammaInterval::new(params.ws_shape, params.ws_scale);
        let offspring = NegBinomial::new(params.off_r, params.off_p);
        let pi = params.pi;

        let mut total = 0.0;
        for host in hosts {
            let tau = host.infection;
            let until = match host.sample_time {
                Some(s) => {
                    total += pi.ln() + ws.ln_pdf(s - tau);
                    s
                }
                None => {
                    total += (-pi * ws.cdf(self.date_t - tau)).ln_1p();
                    self.date_t
                }
            };
            for &t in &host.infectee_times {
                total += w.ln_pdf(t - tau);
            }
            let miss = table.miss_probability(tau, until);
            total += offspring.ln_pgf_derivative(host.infectee_times.len(), miss);
        }
        total
    }
}

/// Log-density of the coalescent history inside one host.
fn within_host_coalescent(host: &Host, neg: f64) -> f64 {
    // (time, +1 for a lineage appearing going backwards, -1 for a coalescence)
    let mut events: Vec<(f64, i32)> = host
        .infectee_times
        .iter()
        .chain(host.sample_time.iter())
        .map(|&t| (t, 1))
        .chain(host.coalescences.iter().map(|&t| (t, -1)))
        .collect();
    // Latest first; at equal times lineages appear before they merge.
    events.sort_by(|a, b| b.0.total_cmp(&a.0).then(b.1.cmp(&a.1)));

    let ln_rate = -neg.ln();
    let mut lineages = 0i64;
    let mut previous = match events.first() {
        Some(&(t, _)) => t,
        None => return 0.0,
    };
    let mut total = 0.0;
    for (time, kind) in events {
        let pairs = (lineages * (lineages - 1) / 2) as f64;
        total -= pairs * (previous - time) / neg;
        previous = time;
        if kind > 0 {
            lineages += 1;
        } else {
            if lineages < 2 {
                return f64::NEG_INFINITY;
            }
            total += ln_rate;
            lineages -= 1;
        }
    }
    if lineages != 1 {
        return f64::NEG_INFINITY;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colored_tree::tests::small_phylogeny;
    use crate::colored_tree::{EventRef, TreeMove};
    use crate::phylogeny::PhylogenyBuilder;
    use approx::assert_abs_diff_eq;
    use std::sync::Arc;

    fn engine() -> LikelihoodEngine {
        LikelihoodEngine::new(4.0, 0.05)
    }

    #[test]
    fn coalescent_of_two_samples() {
        // Two samples at 3.0 and 2.5 merging at 2.0: one pair for 0.5 years, one coalescence.
        let host = Host {
            infection: 1.0,
            infector: None,
            origin: None,
            leaf: None,
            sample_time: None,
            infectees: vec![1, 2],
            infectee_times: vec![3.0, 2.5],
            coalescences: vec![2.0],
        };
        let neg: f64 = 0.4;
        let expected = -neg.ln() - 0.5 / neg;
        assert_abs_diff_eq!(within_host_coalescent(&host, neg), expected, epsilon = 1e-12);

        let broken = Host {
            coalescences: vec![],
            ..host
        };
        assert_eq!(within_host_coalescent(&broken, neg), f64::NEG_INFINITY);
    }

    #[test]
    fn omega_is_a_probability_and_decreases_into_the_past() {
        let params = ParameterVector::default();
        let table = engine().omega_table(&params, -2.0).unwrap();
        assert_eq!(table.omega(4.0), 1.0);
        let mut previous = 1.0;
        for i in 1..100 {
            let t = 4.0 - i as f64 * 0.05;
            let value = table.omega(t);
            assert!((0.0..=1.0).contains(&value));
            assert!(value <= previous + 1e-12);
            previous = value;
        }
        assert!(table.omega(-1.9) < 1.0);
    }

    #[test]
    fn omega_is_one_when_nothing_is_ever_sampled() {
        let params = ParameterVector::default().with(ParamField::Pi, 1e-12);
        let table = engine().omega_table(&params, 0.0).unwrap();
        assert_abs_diff_eq!(table.omega(0.0), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(table.miss_probability(0.0, 4.0), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn growing_the_table_keeps_earlier_entries() {
        let params = ParameterVector::default();
        let short = engine().omega_table(&params, 2.0).unwrap();
        let long = engine().omega_table(&params, -3.0).unwrap();
        assert!(long.len() > short.len());
        for i in 0..short.len() {
            assert_eq!(short.omega[i].to_bits(), long.omega[i].to_bits());
        }
    }

    #[test]
    fn cached_and_fresh_likelihoods_agree_bitwise() {
        let params = ParameterVector::default();
        let mut tree = ColoredTree::initialize(small_phylogeny(), &params, 4.0).unwrap();
        let fresh = engine().log_likelihood(&tree, &params);
        assert!(fresh.is_finite());

        let mut cache = None;
        let cached = engine().log_likelihood_cached(&tree, &params, &mut cache);
        assert_eq!(fresh.to_bits(), cached.to_bits());

        // Moving the root infection further back grows the cached table.
        tree.apply_move(&TreeMove::ShiftRootInfection { time: -3.0 })
            .unwrap();
        let grown = engine().log_likelihood_cached(&tree, &params, &mut cache);
        let fresh = engine().log_likelihood(&tree, &params);
        assert_eq!(fresh.to_bits(), grown.to_bits());

        // A change of neg keeps the table, a change of pi replaces it.
        let neg = params.with(ParamField::Neg, 1.0);
        assert_eq!(
            engine().log_likelihood(&tree, &neg).to_bits(),
            engine().log_likelihood_cached(&tree, &neg, &mut cache).to_bits()
        );
        let pi = params.with(ParamField::Pi, 0.9);
        assert_eq!(
            engine().log_likelihood(&tree, &pi).to_bits(),
            engine().log_likelihood_cached(&tree, &pi, &mut cache).to_bits()
        );
    }

    #[test]
    fn likelihood_is_finite_at_extreme_sampling_proportions() {
        let tree =
            ColoredTree::initialize(small_phylogeny(), &ParameterVector::default(), 4.0).unwrap();
        for pi in [1e-9, 0.5, 1.0 - 1e-9] {
            let params = ParameterVector::default().with(ParamField::Pi, pi);
            assert!(engine().log_likelihood(&tree, &params).is_finite(), "pi = {pi}");
        }
    }

    #[test]
    fn short_generation_intervals_stay_finite() {
        let params = ParameterVector::default();
        let mut tree = ColoredTree::initialize(small_phylogeny(), &params, 4.0).unwrap();
        // Infect the host above leaf A a hair after its infector's coalescence at 2.0.
        tree.apply_move(&TreeMove::ShiftEvent {
            event: EventRef { node: 0, index: 0 },
            time: 2.0 + 1e-9,
        })
        .unwrap();
        assert!(engine().log_likelihood(&tree, &params).is_finite());
    }

    #[test]
    fn single_leaf_likelihood() {
        let mut b = PhylogenyBuilder::new();
        let a = b.leaf(1.0, "solo");
        let phy = Arc::new(b.build(a).unwrap());
        let params = ParameterVector::default();
        let tree = ColoredTree::initialize(phy, &params, 2.0).unwrap();
        let engine = LikelihoodEngine::new(2.0, 0.05);
        let hosts = tree.hosts().unwrap();
        assert_eq!(engine.genealogical_term(&hosts, params.neg), 0.0);

        // One sampled host infected at -1.0, sampled at 1.0, no infectees.
        let table = engine.omega_table(&params, -1.0).unwrap();
        let ws = GammaInterval::new(2.0, 1.0);
        let nb = NegBinomial::new(params.off_r, params.off_p);
        let expected = params.pi.ln()
            + ws.ln_pdf(2.0)
            + nb.ln_pgf(table.miss_probability(-1.0, 1.0));
        assert_abs_diff_eq!(
            engine.log_likelihood(&tree, &params),
            expected,
            epsilon = 1e-12
        );
    }

    #[test]
    fn trees_beyond_the_grid_have_zero_density() {
        let params = ParameterVector::default();
        let tree = ColoredTree::initialize(small_phylogeny(), &params, 4.0).unwrap();
        let tiny = LikelihoodEngine::new(4.0, 0.05).with_max_cells(10);
        assert_eq!(tiny.log_likelihood(&tree, &params), f64::NEG_INFINITY);
    }

    #[test]
    fn priors() {
        let priors = Priors::default();
        let params = ParameterVector::default();
        assert_abs_diff_eq!(
            priors.log_prior(&params, FieldSet::empty().with(ParamField::Pi)),
            0.0,
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            priors.ln_density(ParamField::Neg, 2.0),
            -2.0,
            epsilon = 1e-12
        );
        assert_eq!(priors.ln_density(ParamField::OffP, 1.5), f64::NEG_INFINITY);
        assert_eq!(priors.ln_density(ParamField::WShape, 7.0), 0.0);
    }

    #[test]
    fn grid_step_for_phylogeny() {
        let phy = small_phylogeny();
        let e = LikelihoodEngine::for_phylogeny(4.0, &phy, &ParameterVector::default());
        assert_abs_diff_eq!(e.grid_step(), 0.1, epsilon = 1e-12);
        assert_eq!(e.date_t(), 4.0);
    }
}
