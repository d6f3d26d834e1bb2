//! Acceptance bookkeeping and summaries of recorded trajectories.

use std::collections::VecDeque;
use std::fmt;

use ndarray::prelude::*;
use ndarray_stats::interpolate::Linear;
use ndarray_stats::{Quantile1dExt, QuantileExt};
use noisy_float::types::n64;

use crate::proposals::TreeMoveKind;

/// Number of recent decisions used by [`AcceptanceStats::recent_rate`].
const WINDOW: usize = 100;

/// Why a proposal was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rejection {
    /// The Metropolis–Hastings test said no.
    Declined,
    /// The proposed tree broke an invariant.
    Invalid,
    /// The proposed parameter value lies outside its support.
    OutOfSupport,
    /// The proposed state had a non-finite log-likelihood.
    NonFinite,
}

/// Proposal counts of one move family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveCounts {
    pub proposed: u64,
    pub accepted: u64,
    pub declined: u64,
    pub invalid: u64,
    pub out_of_support: u64,
    pub non_finite: u64,
}

impl MoveCounts {
    /// Fraction of proposals accepted; 0 before the first proposal.
    pub fn rate(&self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            self.accepted as f64 / self.proposed as f64
        }
    }

    fn record(&mut self, outcome: Result<(), Rejection>) {
        self.proposed += 1;
        match outcome {
            Ok(()) => self.accepted += 1,
            Err(Rejection::Declined) => self.declined += 1,
            Err(Rejection::Invalid) => self.invalid += 1,
            Err(Rejection::OutOfSupport) => self.out_of_support += 1,
            Err(Rejection::NonFinite) => self.non_finite += 1,
        }
    }
}

/// Which move a decision belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MoveFamily {
    Tree(TreeMoveKind),
    Parameter(crate::params::ParamField),
}

/**
Acceptance statistics of one chain (or of the shared updates).

Counts are kept per tree-move kind and per parameter field; a sliding window
over the last hundred decisions gives the recent acceptance rate shown in
progress bars.
*/
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptanceStats {
    tree: [MoveCounts; 6],
    params: [MoveCounts; 8],
    recent: VecDeque<bool>,
    recent_accepted: usize,
}

impl Default for AcceptanceStats {
    fn default() -> Self {
        Self {
            tree: [MoveCounts::default(); 6],
            params: [MoveCounts::default(); 8],
            recent: VecDeque::with_capacity(WINDOW + 1),
            recent_accepted: 0,
        }
    }
}

impl AcceptanceStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of one proposal.
    pub fn record(&mut self, family: MoveFamily, outcome: Result<(), Rejection>) {
        match family {
            MoveFamily::Tree(kind) => self.tree[kind.index()].record(outcome),
            MoveFamily::Parameter(field) => self.params[field as usize].record(outcome),
        }
        let accepted = outcome.is_ok();
        self.recent.push_back(accepted);
        self.recent_accepted += accepted as usize;
        if self.recent.len() > WINDOW {
            if let Some(true) = self.recent.pop_front() {
                self.recent_accepted -= 1;
            }
        }
    }

    /// Counts of one tree move kind.
    pub fn tree_move(&self, kind: TreeMoveKind) -> MoveCounts {
        self.tree[kind.index()]
    }

    /// Counts of one parameter field.
    pub fn parameter(&self, field: crate::params::ParamField) -> MoveCounts {
        self.params[field as usize]
    }

    /// Counts summed over every family.
    pub fn total(&self) -> MoveCounts {
        self.tree
            .iter()
            .chain(self.params.iter())
            .fold(MoveCounts::default(), |acc, c| MoveCounts {
                proposed: acc.proposed + c.proposed,
                accepted: acc.accepted + c.accepted,
                declined: acc.declined + c.declined,
                invalid: acc.invalid + c.invalid,
                out_of_support: acc.out_of_support + c.out_of_support,
                non_finite: acc.non_finite + c.non_finite,
            })
    }

    /// Acceptance rate over the most recent decisions.
    pub fn recent_rate(&self) -> f64 {
        if self.recent.is_empty() {
            0.0
        } else {
            self.recent_accepted as f64 / self.recent.len() as f64
        }
    }
}

impl fmt::Display for AcceptanceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        for kind in TreeMoveKind::ALL {
            let c = self.tree_move(kind);
            if c.proposed > 0 {
                parts.push(format!("{} {:.2}", kind.name(), c.rate()));
            }
        }
        for field in crate::params::ParamField::ALL {
            let c = self.parameter(field);
            if c.proposed > 0 {
                parts.push(format!("{} {:.2}", field, c.rate()));
            }
        }
        write!(f, "{}", parts.join(", "))
    }
}

/// Location and spread of a trajectory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub mean: f64,
    pub sd: f64,
    pub min: f64,
    pub q25: f64,
    pub median: f64,
    pub q75: f64,
    pub max: f64,
}

impl Summary {
    /// Interquartile range.
    pub fn iqr(&self) -> f64 {
        self.q75 - self.q25
    }
}

/// Summarises a trajectory; `None` if it is empty or holds a NaN.
pub fn summarize(values: ArrayView1<f64>) -> Option<Summary> {
    if values.is_empty() {
        return None;
    }
    let min = *values.min().ok()?;
    let max = *values.max().ok()?;
    let mean = values.mean()?;
    let sd = if values.len() > 1 {
        values.std(1.0)
    } else {
        0.0
    };
    let mut noisy = values.mapv(n64);
    let quartiles = noisy
        .quantiles_mut(&array![n64(0.25), n64(0.5), n64(0.75)], &Linear)
        .ok()?;
    Some(Summary {
        mean,
        sd,
        min,
        q25: quartiles[0].raw(),
        median: quartiles[1].raw(),
        q75: quartiles[2].raw(),
        max,
    })
}

/**
Monte Carlo standard error of the mean of a trajectory, by non-overlapping
batch means: the trajectory is cut into `n_batches` equal batches (a
remainder at the start is dropped) and the spread of the batch means
estimates the error of the overall mean under autocorrelation.

Returns `None` for fewer than two batches or fewer than two values per batch.
*/
pub fn batch_means_se(values: ArrayView1<f64>, n_batches: usize) -> Option<f64> {
    if n_batches < 2 {
        return None;
    }
    let size = values.len() / n_batches;
    if size < 2 {
        return None;
    }
    let used = values.slice(s![values.len() - size * n_batches..]);
    let batches = used.to_owned().into_shape_with_order((n_batches, size)).ok()?;
    let means = batches.mean_axis(Axis(1))?;
    Some((means.var(1.0) / n_batches as f64).sqrt())
}

/**
Split potential scale reduction factor of one trajectory: the trajectory is
cut into two halves that are compared like two chains. Values close to 1
indicate that both halves sample the same distribution.

Returns `None` for fewer than four values or a constant trajectory.
*/
pub fn split_rhat(values: ArrayView1<f64>) -> Option<f64> {
    let n = values.len() / 2;
    if n < 2 {
        return None;
    }
    let halves = ndarray::stack(
        Axis(0),
        &[values.slice(s![..n]), values.slice(s![values.len() - n..])],
    )
    .ok()?;
    let means = halves.mean_axis(Axis(1))?;
    let within = halves.var_axis(Axis(1), 1.0).mean()?;
    if !(within > 0.0) {
        return None;
    }
    let between = means.var(1.0) * n as f64;
    let nf = n as f64;
    let var = within * ((nf - 1.0) / nf) + between / nf;
    Some((var / within).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamField;
    use approx::assert_abs_diff_eq;

    #[test]
    fn counts_per_family() {
        let mut stats = AcceptanceStats::new();
        let shift = MoveFamily::Tree(TreeMoveKind::ShiftEvent);
        stats.record(shift, Ok(()));
        stats.record(shift, Err(Rejection::Invalid));
        stats.record(MoveFamily::Parameter(ParamField::Pi), Err(Rejection::NonFinite));
        stats.record(MoveFamily::Parameter(ParamField::Pi), Err(Rejection::OutOfSupport));

        let c = stats.tree_move(TreeMoveKind::ShiftEvent);
        assert_eq!((c.proposed, c.accepted, c.invalid), (2, 1, 1));
        assert_abs_diff_eq!(c.rate(), 0.5);
        let p = stats.parameter(ParamField::Pi);
        assert_eq!((p.proposed, p.non_finite, p.out_of_support), (2, 1, 1));
        assert_eq!(stats.total().proposed, 4);
        assert_eq!(stats.tree_move(TreeMoveKind::AddHost).rate(), 0.0);
        assert_eq!(stats.to_string(), "shift-event 0.50, pi 0.00");
    }

    #[test]
    fn recent_rate_uses_a_sliding_window() {
        let mut stats = AcceptanceStats::new();
        let family = MoveFamily::Parameter(ParamField::Neg);
        for _ in 0..WINDOW {
            stats.record(family, Ok(()));
        }
        assert_abs_diff_eq!(stats.recent_rate(), 1.0);
        for _ in 0..WINDOW / 2 {
            stats.record(family, Err(Rejection::Declined));
        }
        assert_abs_diff_eq!(stats.recent_rate(), 0.5);
        assert_abs_diff_eq!(stats.parameter(ParamField::Neg).rate(), 2.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn summary_quantiles() {
        let values = Array1::from_iter((1..=9).map(f64::from));
        let s = summarize(values.view()).unwrap();
        assert_abs_diff_eq!(s.mean, 5.0);
        assert_abs_diff_eq!(s.median, 5.0);
        assert_abs_diff_eq!(s.q25, 3.0);
        assert_abs_diff_eq!(s.q75, 7.0);
        assert_abs_diff_eq!(s.iqr(), 4.0);
        assert_abs_diff_eq!(s.min, 1.0);
        assert_abs_diff_eq!(s.max, 9.0);
        assert_abs_diff_eq!(s.sd, 7.5f64.sqrt(), epsilon = 1e-12);
        assert!(summarize(Array1::<f64>::zeros(0).view()).is_none());
    }

    #[test]
    fn quartiles_interpolate_between_values() {
        let s = summarize(array![4.0, 1.0, 3.0, 2.0].view()).unwrap();
        assert_abs_diff_eq!(s.q25, 1.75, epsilon = 1e-12);
        assert_abs_diff_eq!(s.median, 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(s.q75, 3.25, epsilon = 1e-12);
        assert!(summarize(array![1.0, f64::NAN].view()).is_none());
    }

    #[test]
    fn batch_means_error() {
        // batches [1, 3], [5, 7]: means 2 and 6, variance 8
        let values = array![9.0, 1.0, 3.0, 5.0, 7.0];
        assert_abs_diff_eq!(batch_means_se(values.view(), 2).unwrap(), 2.0, epsilon = 1e-12);
        let constant = Array1::from_elem(40, 0.5);
        assert_abs_diff_eq!(batch_means_se(constant.view(), 10).unwrap(), 0.0);
        assert!(batch_means_se(values.view(), 1).is_none());
        assert!(batch_means_se(values.view(), 3).is_none());
    }

    #[test]
    fn split_rhat_detects_drift() {
        let stationary = array![1.0, 2.0, 1.0, 2.0, 1.0, 2.0, 1.0, 2.0];
        let rhat = split_rhat(stationary.view()).unwrap();
        assert!(rhat < 1.0 + 1e-12);

        let drifting = array![1.0, 1.1, 0.9, 1.0, 5.0, 5.1, 4.9, 5.0];
        assert!(split_rhat(drifting.view()).unwrap() > 2.0);
        assert!(split_rhat(array![1.0, 2.0, 3.0].view()).is_none());
        assert!(split_rhat(array![3.0, 3.0, 3.0, 3.0].view()).is_none());
    }
}
