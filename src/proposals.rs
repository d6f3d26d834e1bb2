/*!
# Proposals

Tree proposals draw a [`TreeMove`] for a [`ColoredTree`] together with the
log Hastings correction `ln q(current | proposed) − ln q(proposed | current)`.
Parameter proposals are symmetric Gaussian random walks
([`GaussianRandomWalk`]) with one step size per field.

| kind                 | move                                                   | log Hastings        |
|----------------------|--------------------------------------------------------|---------------------|
| `ShiftEvent`         | redraw one event uniformly between its neighbours      | 0                   |
| `ShiftRootInfection` | random walk on the first host's infection time         | 0                   |
| `AddHost`            | insert an event at a uniform point of the tree         | `ln L − ln(n + 1)`  |
| `RemoveHost`         | delete a uniformly chosen event                        | `ln n − ln L`       |
| `Reassign`           | move a uniformly chosen event to a uniform point       | 0                   |
| `PivotSiblings`      | swap the infection times of two infectees of one host  | 0                   |

`L` is the total branch length including the root stem, `n` the number of
events before the move. Add and remove share one weight so that they are
proposed equally often.
*/

use rand::Rng;

use crate::colored_tree::{ColoredTree, TreeMove};
use crate::distributions::{GaussianRandomWalk, Proposal};
use crate::params::ParamField;

/// The kinds of tree proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeMoveKind {
    ShiftEvent,
    ShiftRootInfection,
    AddHost,
    RemoveHost,
    Reassign,
    PivotSiblings,
}

impl TreeMoveKind {
    pub const ALL: [TreeMoveKind; 6] = [
        TreeMoveKind::ShiftEvent,
        TreeMoveKind::ShiftRootInfection,
        TreeMoveKind::AddHost,
        TreeMoveKind::RemoveHost,
        TreeMoveKind::Reassign,
        TreeMoveKind::PivotSiblings,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TreeMoveKind::ShiftEvent => "shift-event",
            TreeMoveKind::ShiftRootInfection => "shift-root",
            TreeMoveKind::AddHost => "add-host",
            TreeMoveKind::RemoveHost => "remove-host",
            TreeMoveKind::Reassign => "reassign",
            TreeMoveKind::PivotSiblings => "pivot-siblings",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Relative frequencies of the tree proposals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveWeights {
    pub shift_event: f64,
    pub shift_root_infection: f64,
    /// Split evenly between adding and removing a host.
    pub add_remove: f64,
    pub reassign: f64,
    pub pivot_siblings: f64,
}

impl Default for MoveWeights {
    fn default() -> Self {
        Self {
            shift_event: 4.0,
            shift_root_infection: 1.0,
            add_remove: 2.0,
            reassign: 1.0,
            pivot_siblings: 1.0,
        }
    }
}

impl MoveWeights {
    fn table(&self) -> [(TreeMoveKind, f64); 6] {
        [
            (TreeMoveKind::ShiftEvent, self.shift_event),
            (TreeMoveKind::ShiftRootInfection, self.shift_root_infection),
            (TreeMoveKind::AddHost, 0.5 * self.add_remove),
            (TreeMoveKind::RemoveHost, 0.5 * self.add_remove),
            (TreeMoveKind::Reassign, self.reassign),
            (TreeMoveKind::PivotSiblings, self.pivot_siblings),
        ]
    }

    /// True if all weights are finite and non-negative with a positive total.
    pub fn is_valid(&self) -> bool {
        let table = self.table();
        table.iter().all(|(_, w)| w.is_finite() && *w >= 0.0)
            && table.iter().map(|(_, w)| w).sum::<f64>() > 0.0
    }

    /// Draws a move kind proportionally to its weight.
    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> TreeMoveKind {
        let table = self.table();
        let total: f64 = table.iter().map(|(_, w)| w).sum();
        let mut u = rng.gen::<f64>() * total;
        for (kind, w) in table {
            if u < w {
                return kind;
            }
            u -= w;
        }
        TreeMoveKind::ShiftEvent
    }
}

/// Random-walk step sizes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProposalSteps {
    pub neg: f64,
    pub off_r: f64,
    pub off_p: f64,
    pub pi: f64,
    /// Step of the first host's infection time.
    pub root_infection: f64,
}

impl Default for ProposalSteps {
    fn default() -> Self {
        Self {
            neg: 0.1,
            off_r: 0.5,
            off_p: 0.1,
            pi: 0.1,
            root_infection: 0.5,
        }
    }
}

impl ProposalSteps {
    /// Random-walk kernel of an estimable field; `None` for fixed fields.
    pub fn kernel(&self, field: ParamField) -> Option<GaussianRandomWalk> {
        let std = match field {
            ParamField::Neg => self.neg,
            ParamField::OffR => self.off_r,
            ParamField::OffP => self.off_p,
            ParamField::Pi => self.pi,
            _ => return None,
        };
        Some(GaussianRandomWalk::new(std))
    }

    pub fn is_valid(&self) -> bool {
        [self.neg, self.off_r, self.off_p, self.pi, self.root_infection]
            .iter()
            .all(|s| s.is_finite() && *s > 0.0)
    }
}

/// Draws a new value for `field`, returning it with its log Hastings ratio.
pub fn propose_parameter<R: Rng + ?Sized>(
    steps: &ProposalSteps,
    field: ParamField,
    current: f64,
    rng: &mut R,
) -> Option<(f64, f64)> {
    let kernel = steps.kernel(field)?;
    let proposed = kernel.sample(current, rng);
    let log_hastings = kernel.log_prob(proposed, current) - kernel.log_prob(current, proposed);
    Some((proposed, log_hastings))
}

/// Metropolis–Hastings acceptance: accept iff `ln u <= log_ratio` for `u ~ U(0, 1)`.
pub fn accept<R: Rng + ?Sized>(log_ratio: f64, rng: &mut R) -> bool {
    let u: f64 = rng.gen();
    u.ln() <= log_ratio
}

/**
Draws a move of the given kind for `tree`.

Returns `None` when the tree offers no move of that kind (no events to
shift or remove, no host with two infectees). The move may still violate
the tree invariants; [`ColoredTree::apply_move`] decides.
*/
pub fn propose_tree_move<R: Rng + ?Sized>(
    tree: &ColoredTree,
    kind: TreeMoveKind,
    steps: &ProposalSteps,
    rng: &mut R,
) -> Option<(TreeMove, f64)> {
    let n = tree.n_events();
    match kind {
        TreeMoveKind::ShiftEvent => {
            if n == 0 {
                return None;
            }
            let event = tree.nth_event(rng.gen_range(0..n))?;
            let (lo, hi) = tree.event_window(event)?;
            let time = lo + (hi - lo) * rng.gen::<f64>();
            Some((TreeMove::ShiftEvent { event, time }, 0.0))
        }
        TreeMoveKind::ShiftRootInfection => {
            let kernel = GaussianRandomWalk::new(steps.root_infection);
            let time = kernel.sample(tree.root_infection(), rng);
            Some((TreeMove::ShiftRootInfection { time }, 0.0))
        }
        TreeMoveKind::AddHost => {
            let length = tree.total_length();
            let (node, time) = tree.locate(length * rng.gen::<f64>())?;
            let log_hastings = length.ln() - ((n + 1) as f64).ln();
            Some((TreeMove::AddEvent { node, time }, log_hastings))
        }
        TreeMoveKind::RemoveHost => {
            if n == 0 {
                return None;
            }
            let event = tree.nth_event(rng.gen_range(0..n))?;
            let log_hastings = (n as f64).ln() - tree.total_length().ln();
            Some((TreeMove::RemoveEvent { event }, log_hastings))
        }
        TreeMoveKind::Reassign => {
            if n == 0 {
                return None;
            }
            let event = tree.nth_event(rng.gen_range(0..n))?;
            let (node, time) = tree.locate(tree.total_length() * rng.gen::<f64>())?;
            Some((TreeMove::RelocateEvent { event, node, time }, 0.0))
        }
        TreeMoveKind::PivotSiblings => {
            let hosts = tree.hosts().ok()?;
            let parents: Vec<_> = hosts.iter().filter(|h| h.infectees.len() >= 2).collect();
            if parents.is_empty() {
                return None;
            }
            let host = parents[rng.gen_range(0..parents.len())];
            let k = host.infectees.len();
            let i = rng.gen_range(0..k);
            let j = (i + rng.gen_range(1..k)) % k;
            let a = hosts[host.infectees[i]].origin?;
            let b = hosts[host.infectees[j]].origin?;
            Some((TreeMove::SwapEvents { a, b }, 0.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colored_tree::tests::small_phylogeny;
    use crate::params::ParameterVector;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn tree() -> ColoredTree {
        ColoredTree::initialize(small_phylogeny(), &ParameterVector::default(), 4.0).unwrap()
    }

    #[test]
    fn rejected_moves_leave_the_tree_untouched() {
        let mut tree = tree();
        let steps = ProposalSteps::default();
        let mut rng = SmallRng::seed_from_u64(3);
        let mut applied = 0;
        for _ in 0..2_000 {
            let kind = MoveWeights::default().choose(&mut rng);
            let Some((mv, log_hastings)) = propose_tree_move(&tree, kind, &steps, &mut rng) else {
                continue;
            };
            assert!(log_hastings.is_finite());
            let before = tree.clone();
            match tree.apply_move(&mv) {
                Ok(()) => applied += 1,
                Err(_) => assert_eq!(tree, before),
            }
            assert!(tree.validate().is_ok());
        }
        assert!(applied > 100);
    }

    #[test]
    fn add_and_remove_hastings_ratios_are_reciprocal() {
        let tree = tree();
        let steps = ProposalSteps::default();
        let mut rng = SmallRng::seed_from_u64(11);
        let (mv, add) = propose_tree_move(&tree, TreeMoveKind::AddHost, &steps, &mut rng).unwrap();
        let n = tree.n_events();
        assert_abs_diff_eq!(
            add,
            tree.total_length().ln() - ((n + 1) as f64).ln(),
            epsilon = 1e-12
        );

        let mut grown = tree.clone();
        grown.apply_move(&mv).unwrap();
        let (_, remove) =
            propose_tree_move(&grown, TreeMoveKind::RemoveHost, &steps, &mut rng).unwrap();
        assert_abs_diff_eq!(add + remove, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn moves_that_need_events_are_unavailable_without_them() {
        let mut b = crate::phylogeny::PhylogenyBuilder::new();
        let leaf = b.leaf(1.0, "solo");
        let phy = std::sync::Arc::new(b.build(leaf).unwrap());
        let tree = ColoredTree::initialize(phy, &ParameterVector::default(), 1.0).unwrap();
        let steps = ProposalSteps::default();
        let mut rng = SmallRng::seed_from_u64(0);
        for kind in [
            TreeMoveKind::ShiftEvent,
            TreeMoveKind::RemoveHost,
            TreeMoveKind::Reassign,
            TreeMoveKind::PivotSiblings,
        ] {
            assert!(propose_tree_move(&tree, kind, &steps, &mut rng).is_none());
        }
        assert!(propose_tree_move(&tree, TreeMoveKind::AddHost, &steps, &mut rng).is_some());
    }

    #[test]
    fn pivot_swaps_two_infectees_of_one_host() {
        let tree = tree();
        let steps = ProposalSteps::default();
        let mut rng = SmallRng::seed_from_u64(5);
        let (mv, _) =
            propose_tree_move(&tree, TreeMoveKind::PivotSiblings, &steps, &mut rng).unwrap();
        let TreeMove::SwapEvents { a, b } = mv else {
            panic!("expected a swap, got {mv:?}");
        };
        assert_ne!(a, b);
        let hosts = tree.hosts().unwrap();
        let infector_of = |e| {
            hosts
                .iter()
                .find(|h| h.origin == Some(e))
                .and_then(|h| h.infector)
        };
        assert_eq!(infector_of(a), infector_of(b));
    }

    #[test]
    fn weights_choose_every_kind() {
        let weights = MoveWeights::default();
        assert!(weights.is_valid());
        let mut rng = SmallRng::seed_from_u64(1);
        let mut counts = HashMap::new();
        for _ in 0..9_000 {
            *counts.entry(weights.choose(&mut rng)).or_insert(0usize) += 1;
        }
        for kind in TreeMoveKind::ALL {
            assert!(counts.get(&kind).copied().unwrap_or(0) > 500, "{}", kind.name());
        }
        let add = counts[&TreeMoveKind::AddHost] as f64;
        let remove = counts[&TreeMoveKind::RemoveHost] as f64;
        assert!((add - remove).abs() / (add + remove) < 0.1);

        let none = MoveWeights {
            shift_event: 0.0,
            shift_root_infection: 0.0,
            add_remove: 0.0,
            reassign: 0.0,
            pivot_siblings: 0.0,
        };
        assert!(!none.is_valid());
    }

    #[test]
    fn parameter_proposals_are_symmetric() {
        let steps = ProposalSteps::default();
        let mut rng = SmallRng::seed_from_u64(2);
        let (value, log_hastings) =
            propose_parameter(&steps, ParamField::Pi, 0.5, &mut rng).unwrap();
        assert_ne!(value, 0.5);
        assert_abs_diff_eq!(log_hastings, 0.0, epsilon = 1e-12);
        assert!(propose_parameter(&steps, ParamField::WShape, 2.0, &mut rng).is_none());
    }

    #[test]
    fn acceptance_accepts_ties_and_rejects_nan() {
        let mut rng = SmallRng::seed_from_u64(4);
        assert!((0..100).all(|_| accept(0.0, &mut rng)));
        assert!(!(0..100).any(|_| accept(f64::NEG_INFINITY, &mut rng)));
        assert!(!accept(f64::NAN, &mut rng));
    }
}
