use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};

pub trait MarkovChain {
    type State;

    /// Does one iteration of the chain, returning the new current state.
    fn step(&mut self) -> &Self::State;

    /// Get the current state without stepping.
    fn current_state(&self) -> &Self::State;
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

/**
Steps `chain` up to `n_steps` times, handing every new state to `observe`
together with its 0-based step index. Stops early once `deadline` has
passed and returns the number of completed steps.
*/
pub fn run_chain<M, F>(chain: &mut M, n_steps: usize, deadline: Option<Instant>, mut observe: F) -> usize
where
    M: MarkovChain,
    F: FnMut(usize, &M::State),
{
    for i in 0..n_steps {
        if expired(deadline) {
            return i;
        }
        let state = chain.step();
        observe(i, state);
    }
    n_steps
}

/// Same as [`run_chain`], advancing `pb` by one per step.
pub fn run_chain_with_progress<M, F>(
    chain: &mut M,
    n_steps: usize,
    deadline: Option<Instant>,
    pb: &ProgressBar,
    mut observe: F,
) -> usize
where
    M: MarkovChain,
    F: FnMut(usize, &M::State),
{
    pb.set_length(n_steps as u64);
    pb.set_position(0);

    for i in 0..n_steps {
        if expired(deadline) {
            return i;
        }
        let state = chain.step();
        observe(i, state);

        // Update progress bar
        pb.inc(1);
    }

    n_steps
}

/// Style shared by all progress bars.
pub fn progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-")
}
