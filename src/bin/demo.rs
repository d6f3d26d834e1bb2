//! Simulates two outbreaks under the same parameters, runs the joint sampler
//! with `neg` and `pi` shared, and prints posterior summaries.
//!
//! Set `RUST_LOG=info` (or `debug`) for progress logs.

use std::error::Error;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use transtree_mcmc::joint::{JointConfig, JointSampler};
use transtree_mcmc::params::{FieldSet, ParamField, ParameterVector};
use transtree_mcmc::simulation::{simulate_outbreak, SimulationOptions};
use transtree_mcmc::stats::summarize;

fn main() -> Result<(), Box<dyn Error>> {
    const DATE_T: f64 = 2010.0;
    const N_DATASETS: usize = 2;
    const ITERATIONS: usize = 5_000;
    const BURNIN: usize = 1_000;
    const THINNING: usize = 10;
    const SEED: u64 = 42;

    env_logger::init();

    let truth = ParameterVector::default()
        .with(ParamField::OffR, 1.5)
        .with(ParamField::Pi, 0.8);
    let mut rng = SmallRng::seed_from_u64(SEED);
    let options = SimulationOptions::default();
    let mut phylogenies = Vec::with_capacity(N_DATASETS);
    for d in 0..N_DATASETS {
        let outbreak = simulate_outbreak(&truth, DATE_T, &options, &mut rng)?;
        println!(
            "Dataset {d}: {} sampled hosts, {} hosts in the true transmission tree, {} infections",
            outbreak.phylogeny.n_leaves(),
            outbreak.tree.n_hosts(),
            outbreak.n_infected
        );
        phylogenies.push(outbreak.phylogeny);
    }

    let config = JointConfig::new(DATE_T)
        .set_iterations(ITERATIONS)
        .set_burnin(BURNIN)
        .set_thinning(THINNING)
        .set_parallel(true);
    let share = FieldSet::parse(["neg", "pi"])?;
    let mut sampler =
        JointSampler::from_phylogenies(phylogenies, ParameterVector::default(), share, config)?
            .set_seed(SEED);
    let run = sampler.run_with_progress();

    println!("Shared: {}", run.share);
    for (d, recorder) in run.chains.iter().enumerate() {
        println!("Dataset {d} ({} samples)", recorder.len());
        for field in [ParamField::Neg, ParamField::OffR, ParamField::Pi] {
            if let Some(s) = summarize(recorder.trajectory(field).view()) {
                println!(
                    "  {field:>6}: mean {:.3}, median {:.3}, IQR [{:.3}, {:.3}] (true {:.3})",
                    s.mean,
                    s.median,
                    s.q25,
                    s.q75,
                    truth.get(field)
                );
            }
        }
        let unsampled = recorder.unsampled_counts();
        if !unsampled.is_empty() {
            let mean = unsampled.iter().sum::<usize>() as f64 / unsampled.len() as f64;
            println!("  mean number of unsampled hosts: {mean:.1}");
        }
        println!("  acceptance: {}", run.acceptance[d]);
    }

    Ok(())
}
