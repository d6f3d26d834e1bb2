/*!
Forward simulation of an outbreak, producing a dated phylogeny and the
colored tree that generated it.

The generative model matches [`crate::likelihood`]:

- the index case is infected `span` before `date_t`;
- a host infected at τ is sampled with probability `pi` at `τ + ws` (if that
  is not after `date_t`) and stops transmitting once sampled;
- it has a negative-binomial number of offspring, each infected a Gamma
  generation interval after τ, as long as that falls before its sampling
  time (or before `date_t` for hosts that are never sampled);
- within each host the lineages coalesce under a constant-size coalescent
  with pair rate `1 / neg`, and a single lineage reaches the infection time.

Hosts without sampled descendants leave no trace in the phylogeny and are
dropped; unsampled hosts on the path to a sample remain as transmission
events.
*/

use std::sync::Arc;

use rand::Rng;
use rand_distr::{Distribution, Exp};

use crate::colored_tree::ColoredTree;
use crate::distributions::{GammaInterval, NegBinomial};
use crate::error::{Error, Result};
use crate::params::ParameterVector;
use crate::phylogeny::{NodeId, PhylogenyBuilder, TimedPhylogeny};

/// Tuning of [`simulate_outbreak`].
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationOptions {
    /// Time between the index infection and `date_t`.
    pub span: f64,
    /// Outbreaks with fewer sampled hosts are discarded and redrawn.
    pub min_sampled: usize,
    /// Outbreaks that grow beyond this many hosts are discarded and redrawn.
    pub max_hosts: usize,
    /// Number of outbreaks drawn before giving up.
    pub max_attempts: usize,
    /// Prefix of the leaf labels; leaves are named `{prefix}{host}`.
    pub label_prefix: String,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            span: 6.0,
            min_sampled: 3,
            max_hosts: 200,
            max_attempts: 1000,
            label_prefix: "host".into(),
        }
    }
}

/// A simulated dataset.
#[derive(Debug, Clone)]
pub struct SimulatedOutbreak {
    pub phylogeny: Arc<TimedPhylogeny>,
    /// The coloring that generated the phylogeny.
    pub tree: ColoredTree,
    /// Number of infections, including those without sampled descendants.
    pub n_infected: usize,
}

#[derive(Debug, Clone)]
struct SimHost {
    infection: f64,
    sample: Option<f64>,
    infectees: Vec<usize>,
}

/// Simulates an outbreak ending at `date_t` under `params`.
pub fn simulate_outbreak<R: Rng + ?Sized>(
    params: &ParameterVector,
    date_t: f64,
    options: &SimulationOptions,
    rng: &mut R,
) -> Result<SimulatedOutbreak> {
    params.validate()?;
    if !(options.span > 0.0 && date_t.is_finite()) {
        return Err(Error::Simulation(format!(
            "span must be positive and date_t finite (span {}, date_t {date_t})",
            options.span
        )));
    }
    for _ in 0..options.max_attempts {
        let Some(hosts) = branching_process(params, date_t, options, rng) else {
            continue;
        };
        let sampled = hosts.iter().filter(|h| h.sample.is_some()).count();
        if sampled < options.min_sampled.max(1) {
            continue;
        }
        if let Some(outbreak) = genealogy(&hosts, params.neg, options, rng)? {
            return Ok(outbreak);
        }
    }
    Err(Error::Simulation(format!(
        "no outbreak with at least {} sampled hosts and at most {} hosts in {} attempts",
        options.min_sampled, options.max_hosts, options.max_attempts
    )))
}

fn branching_process<R: Rng + ?Sized>(
    params: &ParameterVector,
    date_t: f64,
    options: &SimulationOptions,
    rng: &mut R,
) -> Option<Vec<SimHost>> {
    let w = GammaInterval::new(params.w_shape, params.w_scale);
    let ws = GammaInterval::new(params.ws_shape, params.ws_scale);
    let offspring = NegBinomial::new(params.off_r, params.off_p);

    let mut hosts = vec![SimHost {
        infection: date_t - options.span,
        sample: None,
        infectees: Vec::new(),
    }];
    let mut next = 0;
    while next < hosts.len() {
        let tau = hosts[next].infection;
        let sample_time = tau + ws.sample(rng);
        let sampled = rng.gen::<f64>() < params.pi && sample_time <= date_t;
        let until = if sampled { sample_time } else { date_t };
        hosts[next].sample = sampled.then_some(sample_time);

        let mut times: Vec<f64> = (0..offspring.sample(rng))
            .map(|_| tau + w.sample(rng))
            .filter(|&t| t < until)
            .collect();
        times.sort_by(f64::total_cmp);
        for t in times {
            if hosts.len() >= options.max_hosts {
                return None;
            }
            let id = hosts.len();
            hosts.push(SimHost {
                infection: t,
                sample: None,
                infectees: Vec::new(),
            });
            hosts[next].infectees.push(id);
        }
        next += 1;
    }
    Some(hosts)
}

/// Merges of a within-host coalescent: `(time, slot, slot)`; merged lineages take the next free slot.
type Merges = Vec<(f64, usize, usize)>;

/**
Backwards coalescent of lineages entering at `entries` (descending times)
inside a host infected at `tau`. `None` if more than one lineage is left at
`tau`.
*/
fn coalescent<R: Rng + ?Sized>(entries: &[f64], tau: f64, neg: f64, rng: &mut R) -> Option<Merges> {
    let mut merges = Vec::new();
    let mut active: Vec<usize> = Vec::new();
    let mut next_slot = entries.len();
    let mut added = 0;
    let mut t = entries.first().copied()?;
    while active.len() + (entries.len() - added) > 1 {
        let k = active.len();
        let candidate = if k >= 2 {
            let rate = (k * (k - 1)) as f64 / 2.0 / neg;
            t - Exp::new(rate).ok()?.sample(rng)
        } else {
            f64::NEG_INFINITY
        };
        let floor = entries.get(added).copied().unwrap_or(tau);
        if candidate > floor {
            let i = rng.gen_range(0..k);
            let a = active.swap_remove(i);
            let j = rng.gen_range(0..k - 1);
            let b = active.swap_remove(j);
            merges.push((candidate, a, b));
            active.push(next_slot);
            next_slot += 1;
            t = candidate;
        } else if added < entries.len() {
            active.push(added);
            t = entries[added];
            added += 1;
        } else {
            return None;
        }
    }
    Some(merges)
}

fn genealogy<R: Rng + ?Sized>(
    hosts: &[SimHost],
    neg: f64,
    options: &SimulationOptions,
    rng: &mut R,
) -> Result<Option<SimulatedOutbreak>> {
    // Infectees always come after their infector, so one backward pass suffices.
    let mut kept = vec![false; hosts.len()];
    for h in (0..hosts.len()).rev() {
        kept[h] = hosts[h].sample.is_some() || hosts[h].infectees.iter().any(|&c| kept[c]);
    }

    let mut builder = PhylogenyBuilder::new();
    // Top node of each kept host's genealogy and the transmission events above it.
    let mut top: Vec<Option<NodeId>> = vec![None; hosts.len()];
    let mut events_above: Vec<(NodeId, f64)> = Vec::new();

    for h in (0..hosts.len()).rev().filter(|&h| kept[h]) {
        let host = &hosts[h];
        let mut lineages: Vec<(f64, NodeId)> = Vec::new();
        if let Some(s) = host.sample {
            lineages.push((s, builder.leaf(s, format!("{}{h}", options.label_prefix))));
        }
        for &c in &host.infectees {
            if let Some(node) = top[c] {
                events_above.push((node, hosts[c].infection));
                lineages.push((hosts[c].infection, node));
            }
        }
        lineages.sort_by(|a, b| b.0.total_cmp(&a.0));
        let entries: Vec<f64> = lineages.iter().map(|l| l.0).collect();

        let mut merges = None;
        for _ in 0..100 {
            merges = coalescent(&entries, host.infection, neg, rng);
            if merges.is_some() {
                break;
            }
        }
        let Some(merges) = merges else {
            return Ok(None);
        };
        let mut slots: Vec<NodeId> = lineages.iter().map(|l| l.1).collect();
        for (time, a, b) in merges {
            slots.push(builder.join(time, slots[a], slots[b]));
        }
        top[h] = slots.last().copied();
    }

    let root = top[0].ok_or_else(|| Error::Simulation("index case has no sampled descendant".into()))?;
    let phylogeny = Arc::new(builder.build(root)?);
    let mut events = vec![Vec::new(); phylogeny.len()];
    for (node, time) in events_above {
        events[node].push(time);
    }
    let tree = ColoredTree::from_parts(Arc::clone(&phylogeny), hosts[0].infection, events)
        .map_err(|e| Error::Simulation(format!("simulated coloring is inconsistent: {e}")))?;
    Ok(Some(SimulatedOutbreak {
        phylogeny,
        tree,
        n_infected: hosts.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamField;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn growing() -> ParameterVector {
        ParameterVector::default().with(ParamField::OffR, 2.0)
    }

    #[test]
    fn simulated_outbreaks_are_consistent() {
        let mut rng = SmallRng::seed_from_u64(2024);
        for _ in 0..20 {
            let outbreak =
                simulate_outbreak(&growing(), 2020.0, &SimulationOptions::default(), &mut rng)
                    .unwrap();
            let phy = &outbreak.phylogeny;
            assert!(phy.n_leaves() >= 3);
            assert!(phy.last_sample_time() <= 2020.0);
            assert!(outbreak.tree.validate().is_ok());
            assert_eq!(outbreak.tree.root_infection(), 2014.0);
            assert!(outbreak.n_infected >= outbreak.tree.n_hosts());
            let hosts = outbreak.tree.hosts().unwrap();
            assert_eq!(hosts.iter().filter(|h| h.is_sampled()).count(), phy.n_leaves());
        }
    }

    #[test]
    fn simulation_is_reproducible() {
        let draw = |seed| {
            let mut rng = SmallRng::seed_from_u64(seed);
            simulate_outbreak(&growing(), 10.0, &SimulationOptions::default(), &mut rng).unwrap()
        };
        let (a, b) = (draw(5), draw(5));
        assert_eq!(a.phylogeny, b.phylogeny);
        assert_eq!(a.tree, b.tree);
    }

    #[test]
    fn impossible_requirements_fail() {
        let mut rng = SmallRng::seed_from_u64(1);
        let options = SimulationOptions {
            min_sampled: 1000,
            max_attempts: 5,
            ..SimulationOptions::default()
        };
        assert!(matches!(
            simulate_outbreak(&growing(), 10.0, &options, &mut rng),
            Err(Error::Simulation(_))
        ));
    }

    #[test]
    fn coalescent_leaves_one_lineage() {
        let mut rng = SmallRng::seed_from_u64(9);
        let merges = coalescent(&[3.0, 2.9, 2.8], 0.0, 0.1, &mut rng).unwrap();
        assert_eq!(merges.len(), 2);
        assert!(merges.iter().all(|&(t, _, _)| t > 0.0 && t < 2.9));
        assert!(merges[0].0 > merges[1].0);
        // no lineage pair, no merge
        assert_eq!(coalescent(&[1.0], 0.0, 0.1, &mut rng), Some(Vec::new()));
    }
}
