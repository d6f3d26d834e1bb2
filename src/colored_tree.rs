/*!
# Colored trees

A [`ColoredTree`] is the latent transmission state of one dataset: the
dataset's phylogeny together with the transmission events that partition
("color") its branches into hosts.

Every phylogeny node owns the branch above it; the root owns the *root
stem*, which reaches up to the infection time of the first host. Each branch
carries an ordered list of transmission event times. Cutting the tree at all
events leaves connected pieces, and each piece is one host:

- its infection time is the event at its top (the root infection for the
  first host);
- it is *sampled* if it contains a leaf, whose date is the host's sampling
  (removal) time, and *unsampled* otherwise;
- the events along its lower boundary are the infections it causes.

Because hosts are pieces of a tree, the coloring is acyclic by construction.
[`ColoredTree::validate`] checks the remaining invariants: events lie strictly
inside their branch and are strictly ordered along it, no host holds two
samples, and a sampled host infects others only before it is sampled.

Edits go through [`ColoredTree::apply_move`], which works on a copy and only
commits it when the copy is valid.
*/

use std::sync::Arc;

use crate::error::{InvalidMove, PhylogenyError};
use crate::params::ParameterVector;
use crate::phylogeny::{NodeId, TimedPhylogeny};

/// Index of a host in the list returned by [`ColoredTree::hosts`].
pub type HostId = usize;

/// Position of a transmission event: the `index`-th event (from the top) on the branch above `node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventRef {
    pub node: NodeId,
    pub index: usize,
}

/// A host derived from a colored tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    /// Infection time.
    pub infection: f64,
    /// The host that infected this one; `None` for the first host.
    pub infector: Option<HostId>,
    /// The event that infected this host; `None` for the first host.
    pub origin: Option<EventRef>,
    /// The phylogeny leaf sampled from this host, if any.
    pub leaf: Option<NodeId>,
    /// Sampling (removal) time, if sampled.
    pub sample_time: Option<f64>,
    /// Hosts infected by this one, in discovery order.
    pub infectees: Vec<HostId>,
    /// Times at which this host infected others, aligned with `infectees`.
    pub infectee_times: Vec<f64>,
    /// Dates of the phylogeny's internal nodes that fall inside this host.
    pub coalescences: Vec<f64>,
}

impl Host {
    fn new(infection: f64, infector: Option<HostId>, origin: Option<EventRef>) -> Self {
        Self {
            infection,
            infector,
            origin,
            leaf: None,
            sample_time: None,
            infectees: Vec::new(),
            infectee_times: Vec::new(),
            coalescences: Vec::new(),
        }
    }

    pub fn is_sampled(&self) -> bool {
        self.leaf.is_some()
    }
}

/// An edit of a colored tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TreeMove {
    /// Moves one event along its branch.
    ShiftEvent { event: EventRef, time: f64 },
    /// Changes the infection time of the first host.
    ShiftRootInfection { time: f64 },
    /// Inserts an event on the branch above `node`, creating a host.
    AddEvent { node: NodeId, time: f64 },
    /// Deletes an event, merging two hosts.
    RemoveEvent { event: EventRef },
    /// Deletes an event and re-inserts it elsewhere.
    RelocateEvent {
        event: EventRef,
        node: NodeId,
        time: f64,
    },
    /// Exchanges the times of two events.
    SwapEvents { a: EventRef, b: EventRef },
}

/// The latent transmission state of one dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct ColoredTree {
    phylogeny: Arc<TimedPhylogeny>,
    root_infection: f64,
    /// Per node, the event times on the branch above it in increasing time.
    events: Vec<Vec<f64>>,
}

impl ColoredTree {
    /**
    Builds a valid starting coloring: a transmission event halfway along every
    non-root branch, so that each internal node becomes its own unsampled host
    and each leaf its own sampled host. The first host is infected one mean
    generation interval before the phylogeny's root.

    Fails if a leaf is sampled after `date_t`.
    */
    pub fn initialize(
        phylogeny: Arc<TimedPhylogeny>,
        params: &ParameterVector,
        date_t: f64,
    ) -> Result<Self, PhylogenyError> {
        for &leaf in phylogeny.leaves() {
            let time = phylogeny.time(leaf);
            if time > date_t {
                return Err(PhylogenyError::LeafAfterHorizon {
                    label: phylogeny.label(leaf).unwrap_or_default().to_string(),
                    time,
                    date_t,
                });
            }
        }

        let root = phylogeny.root();
        let gap = params.mean_generation_time();
        let gap = if gap.is_finite() && gap > 0.0 { gap } else { 1.0 };
        let mut events = vec![Vec::new(); phylogeny.len()];
        for (node, slot) in events.iter_mut().enumerate() {
            if let Some(parent) = phylogeny.parent(node) {
                slot.push(0.5 * (phylogeny.time(parent) + phylogeny.time(node)));
            }
        }
        let tree = Self {
            root_infection: phylogeny.time(root) - gap,
            phylogeny,
            events,
        };
        debug_assert!(tree.validate().is_ok());
        Ok(tree)
    }

    /// Builds a tree from explicit parts, validating them.
    pub fn from_parts(
        phylogeny: Arc<TimedPhylogeny>,
        root_infection: f64,
        mut events: Vec<Vec<f64>>,
    ) -> Result<Self, InvalidMove> {
        if events.len() != phylogeny.len() {
            return Err(InvalidMove("one event list per phylogeny node is required"));
        }
        for list in events.iter_mut() {
            list.sort_by(f64::total_cmp);
        }
        let tree = Self {
            phylogeny,
            root_infection,
            events,
        };
        tree.validate()?;
        Ok(tree)
    }

    /// The underlying phylogeny.
    pub fn phylogeny(&self) -> &Arc<TimedPhylogeny> {
        &self.phylogeny
    }

    /// Infection time of the first host.
    pub fn root_infection(&self) -> f64 {
        self.root_infection
    }

    /// Event times on the branch above `node`, earliest first.
    pub fn events(&self, node: NodeId) -> &[f64] {
        &self.events[node]
    }

    /// Time of one event.
    pub fn event_time(&self, event: EventRef) -> Option<f64> {
        self.events.get(event.node)?.get(event.index).copied()
    }

    /// Total number of transmission events.
    pub fn n_events(&self) -> usize {
        self.events.iter().map(Vec::len).sum()
    }

    /// Number of hosts (one per event plus the first host).
    pub fn n_hosts(&self) -> usize {
        self.n_events() + 1
    }

    /// Number of hosts without a sample.
    pub fn n_unsampled(&self) -> usize {
        self.n_hosts() - self.phylogeny.n_leaves()
    }

    /// All events in arena order.
    pub fn event_refs(&self) -> Vec<EventRef> {
        self.events
            .iter()
            .enumerate()
            .flat_map(|(node, list)| (0..list.len()).map(move |index| EventRef { node, index }))
            .collect()
    }

    /// The `i`-th event in arena order.
    pub fn nth_event(&self, mut i: usize) -> Option<EventRef> {
        for (node, list) in self.events.iter().enumerate() {
            if i < list.len() {
                return Some(EventRef { node, index: i });
            }
            i -= list.len();
        }
        None
    }

    /// Start (earlier end) of the branch above `node`.
    pub fn branch_top(&self, node: NodeId) -> f64 {
        match self.phylogeny.parent(node) {
            Some(parent) => self.phylogeny.time(parent),
            None => self.root_infection,
        }
    }

    /// Length of the branch above `node`, the root stem for the root.
    pub fn branch_length(&self, node: NodeId) -> f64 {
        self.phylogeny.time(node) - self.branch_top(node)
    }

    /// Total branch length including the root stem.
    pub fn total_length(&self) -> f64 {
        (0..self.phylogeny.len()).map(|n| self.branch_length(n)).sum()
    }

    /// Maps `position` in `[0, total_length)` to a point `(node, time)` on the unrolled tree.
    pub fn locate(&self, position: f64) -> Option<(NodeId, f64)> {
        let mut remaining = position;
        for node in 0..self.phylogeny.len() {
            let len = self.branch_length(node);
            if remaining < len {
                return Some((node, self.branch_top(node) + remaining));
            }
            remaining -= len;
        }
        None
    }

    /// Free interval for an event: between its neighbours on the branch, or the branch ends.
    pub fn event_window(&self, event: EventRef) -> Option<(f64, f64)> {
        let list = self.events.get(event.node)?;
        if event.index >= list.len() {
            return None;
        }
        let lo = if event.index == 0 {
            self.branch_top(event.node)
        } else {
            list[event.index - 1]
        };
        let hi = list
            .get(event.index + 1)
            .copied()
            .unwrap_or_else(|| self.phylogeny.time(event.node));
        Some((lo, hi))
    }

    /// Latest admissible infection time of the first host.
    pub fn root_infection_limit(&self) -> f64 {
        let root = self.phylogeny.root();
        self.events[root]
            .first()
            .copied()
            .unwrap_or_else(|| self.phylogeny.time(root))
    }

    /**
    Derives the hosts. Host 0 is the first host; the others are discovered
    in pre-order of the phylogeny and, along each branch, from the top.
    */
    pub fn hosts(&self) -> Result<Vec<Host>, InvalidMove> {
        let phy = &self.phylogeny;
        let mut hosts = vec![Host::new(self.root_infection, None, None)];
        let mut host_at_node: Vec<HostId> = vec![0; phy.len()];

        for node in phy.preorder() {
            let mut current = match phy.parent(node) {
                Some(parent) => host_at_node[parent],
                None => 0,
            };
            for (index, &time) in self.events[node].iter().enumerate() {
                let id = hosts.len();
                hosts.push(Host::new(
                    time,
                    Some(current),
                    Some(EventRef { node, index }),
                ));
                hosts[current].infectees.push(id);
                hosts[current].infectee_times.push(time);
                current = id;
            }
            host_at_node[node] = current;
            let host = &mut hosts[current];
            if phy.is_leaf(node) {
                if host.leaf.is_some() {
                    return Err(InvalidMove("a host holds two samples"));
                }
                host.leaf = Some(node);
                host.sample_time = Some(phy.time(node));
            } else {
                host.coalescences.push(phy.time(node));
            }
        }
        Ok(hosts)
    }

    /// Checks every invariant of the coloring.
    pub fn validate(&self) -> Result<(), InvalidMove> {
        let phy = &self.phylogeny;
        if !self.root_infection.is_finite() {
            return Err(InvalidMove("non-finite root infection"));
        }
        for node in 0..phy.len() {
            let (top, bottom) = (self.branch_top(node), phy.time(node));
            if top >= bottom {
                return Err(InvalidMove("first host infected after the root"));
            }
            let mut previous = top;
            for &time in &self.events[node] {
                if !(time > previous) {
                    return Err(InvalidMove("events out of order on a branch"));
                }
                previous = time;
            }
            if previous >= bottom {
                return Err(InvalidMove("event outside its branch"));
            }
        }
        for host in self.hosts()? {
            if let Some(sampled) = host.sample_time {
                if host.infectee_times.iter().any(|&t| t >= sampled) {
                    return Err(InvalidMove("transmission after sampling"));
                }
            }
        }
        Ok(())
    }

    /**
    Applies an edit. The edit is made on a copy; the copy replaces `self`
    only when it satisfies every invariant, so on `Err` the tree is unchanged.
    */
    pub fn apply_move(&mut self, mv: &TreeMove) -> Result<(), InvalidMove> {
        let mut candidate = self.clone();
        candidate.edit(mv)?;
        candidate.validate()?;
        *self = candidate;
        Ok(())
    }

    fn edit(&mut self, mv: &TreeMove) -> Result<(), InvalidMove> {
        match *mv {
            TreeMove::ShiftEvent { event, time } => {
                *self.event_slot(event)? = time;
            }
            TreeMove::ShiftRootInfection { time } => {
                self.root_infection = time;
            }
            TreeMove::AddEvent { node, time } => {
                self.insert_event(node, time)?;
            }
            TreeMove::RemoveEvent { event } => {
                self.event_slot(event)?;
                self.events[event.node].remove(event.index);
            }
            TreeMove::RelocateEvent { event, node, time } => {
                self.event_slot(event)?;
                self.events[event.node].remove(event.index);
                self.insert_event(node, time)?;
            }
            TreeMove::SwapEvents { a, b } => {
                if a == b {
                    return Err(InvalidMove("swap of an event with itself"));
                }
                let ta = *self.event_slot(a)?;
                let tb = *self.event_slot(b)?;
                *self.event_slot(a)? = tb;
                *self.event_slot(b)? = ta;
            }
        }
        Ok(())
    }

    fn event_slot(&mut self, event: EventRef) -> Result<&mut f64, InvalidMove> {
        self.events
            .get_mut(event.node)
            .and_then(|list| list.get_mut(event.index))
            .ok_or(InvalidMove("no such event"))
    }

    fn insert_event(&mut self, node: NodeId, time: f64) -> Result<(), InvalidMove> {
        let list = self
            .events
            .get_mut(node)
            .ok_or(InvalidMove("no such branch"))?;
        let at = list.partition_point(|&t| t < time);
        list.insert(at, time);
        Ok(())
    }

    /// For every sampled host, its label and the label of its direct infector when that infector was sampled.
    pub fn who_infected_whom(&self) -> Result<Vec<(String, Option<String>)>, InvalidMove> {
        let hosts = self.hosts()?;
        let label = |host: &Host| {
            host.leaf
                .and_then(|leaf| self.phylogeny.label(leaf))
                .map(str::to_string)
        };
        Ok(hosts
            .iter()
            .filter_map(|host| {
                let name = label(host)?;
                let infector = host.infector.and_then(|i| label(&hosts[i]));
                Some((name, infector))
            })
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::phylogeny::PhylogenyBuilder;

    /// ((A:3.0, B:2.5):2.0, C:2.8):1.0
    pub(crate) fn small_phylogeny() -> Arc<TimedPhylogeny> {
        let mut b = PhylogenyBuilder::new();
        let a = b.leaf(3.0, "A");
        let c = b.leaf(2.5, "B");
        let d = b.leaf(2.8, "C");
        let inner = b.join(2.0, a, c);
        let root = b.join(1.0, inner, d);
        Arc::new(b.build(root).unwrap())
    }

    #[test]
    fn initial_coloring_is_valid() {
        let tree =
            ColoredTree::initialize(small_phylogeny(), &ParameterVector::default(), 4.0).unwrap();
        assert!(tree.validate().is_ok());
        // one event per non-root branch
        assert_eq!(tree.n_events(), 4);
        assert_eq!(tree.n_hosts(), 5);
        assert_eq!(tree.n_unsampled(), 2);
        assert!((tree.root_infection() - (1.0 - 2.0)).abs() < 1e-12);

        let hosts = tree.hosts().unwrap();
        assert_eq!(hosts.len(), 5);
        assert!(hosts[0].infector.is_none());
        assert!(!hosts[0].is_sampled());
        assert_eq!(hosts[0].coalescences, vec![1.0]);
        let sampled = hosts.iter().filter(|h| h.is_sampled()).count();
        assert_eq!(sampled, 3);
        for host in &hosts {
            // lineages entering a host = coalescences + 1
            let lineages = host.infectee_times.len() + host.leaf.map_or(0, |_| 1);
            assert_eq!(lineages, host.coalescences.len() + 1);
        }
    }

    #[test]
    fn leaf_after_horizon_is_rejected() {
        let err = ColoredTree::initialize(small_phylogeny(), &ParameterVector::default(), 2.9)
            .unwrap_err();
        assert!(matches!(err, PhylogenyError::LeafAfterHorizon { .. }));
    }

    #[test]
    fn single_leaf_tree() {
        let mut b = PhylogenyBuilder::new();
        let a = b.leaf(1.0, "solo");
        let phy = Arc::new(b.build(a).unwrap());
        let tree = ColoredTree::initialize(phy, &ParameterVector::default(), 1.0).unwrap();
        assert_eq!(tree.n_hosts(), 1);
        let hosts = tree.hosts().unwrap();
        assert_eq!(hosts[0].leaf, Some(0));
        assert!((tree.total_length() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn removing_an_event_that_merges_two_samples_is_invalid() {
        let mut tree =
            ColoredTree::initialize(small_phylogeny(), &ParameterVector::default(), 4.0).unwrap();
        // Remove the event above leaf A, then the one above B: A and B would share a host.
        tree.apply_move(&TreeMove::RemoveEvent {
            event: EventRef { node: 0, index: 0 },
        })
        .unwrap();
        let before = tree.clone();
        let result = tree.apply_move(&TreeMove::RemoveEvent {
            event: EventRef { node: 1, index: 0 },
        });
        assert!(result.is_err());
        assert_eq!(tree, before);
    }

    #[test]
    fn transmission_after_sampling_is_invalid() {
        let mut tree =
            ColoredTree::initialize(small_phylogeny(), &ParameterVector::default(), 4.0).unwrap();
        // Without the event above the inner node, A's event at 2.5 and B's at 2.25 belong to the root host.
        tree.apply_move(&TreeMove::RemoveEvent {
            event: EventRef { node: 3, index: 0 },
        })
        .unwrap();
        // Remove the event above C: the root host becomes sampled at 2.8 but still infects A's host at 2.5: fine.
        tree.apply_move(&TreeMove::RemoveEvent {
            event: EventRef { node: 2, index: 0 },
        })
        .unwrap();
        // Moving A's infection past C's sampling date must fail.
        let before = tree.clone();
        let err = tree.apply_move(&TreeMove::ShiftEvent {
            event: EventRef { node: 0, index: 0 },
            time: 2.9,
        });
        assert_eq!(err, Err(InvalidMove("transmission after sampling")));
        assert_eq!(tree, before);
    }

    #[test]
    fn events_cannot_leave_their_window() {
        let mut tree =
            ColoredTree::initialize(small_phylogeny(), &ParameterVector::default(), 4.0).unwrap();
        let event = EventRef { node: 0, index: 0 };
        assert_eq!(tree.event_window(event), Some((2.0, 3.0)));
        assert!(tree
            .apply_move(&TreeMove::ShiftEvent { event, time: 1.9 })
            .is_err());
        assert!(tree
            .apply_move(&TreeMove::ShiftRootInfection { time: 1.0 })
            .is_err());
        tree.apply_move(&TreeMove::ShiftEvent { event, time: 2.1 })
            .unwrap();
        assert_eq!(tree.events(0), &[2.1]);
    }

    #[test]
    fn add_relocate_and_swap() {
        let mut tree =
            ColoredTree::initialize(small_phylogeny(), &ParameterVector::default(), 4.0).unwrap();
        tree.apply_move(&TreeMove::AddEvent { node: 2, time: 1.2 })
            .unwrap();
        assert_eq!(tree.events(2), &[1.2, 1.9]);
        assert_eq!(tree.n_unsampled(), 3);

        tree.apply_move(&TreeMove::RelocateEvent {
            event: EventRef { node: 2, index: 0 },
            node: 4,
            time: 0.5,
        })
        .unwrap();
        assert_eq!(tree.events(2), &[1.9]);
        assert_eq!(tree.events(4), &[0.5]);

        // The root's two infectees on branches 3 (t=1.5) and 2 (t=1.9) swap times.
        let hosts = tree.hosts().unwrap();
        let (a, b) = (EventRef { node: 3, index: 0 }, EventRef { node: 2, index: 0 });
        let owner = hosts
            .iter()
            .position(|h| h.infectees.len() == 2 && h.coalescences == vec![1.0])
            .unwrap();
        assert_eq!(hosts[owner].infectee_times.len(), 2);
        tree.apply_move(&TreeMove::SwapEvents { a, b }).unwrap();
        assert_eq!(tree.events(3), &[1.9]);
        assert_eq!(tree.events(2), &[1.5]);
    }

    #[test]
    fn locate_walks_the_unrolled_tree() {
        let tree =
            ColoredTree::initialize(small_phylogeny(), &ParameterVector::default(), 4.0).unwrap();
        let total = tree.total_length();
        assert!((total - (4.3 + 2.0)).abs() < 1e-12);
        assert_eq!(tree.locate(0.25), Some((0, 2.25)));
        assert!(tree.locate(total + 1.0).is_none());
        let (node, time) = tree.locate(total - 1e-9).unwrap();
        assert_eq!(node, 4);
        assert!(time < tree.phylogeny().time(4));
    }

    #[test]
    fn who_infected_whom_reports_sampled_pairs() {
        let mut tree =
            ColoredTree::initialize(small_phylogeny(), &ParameterVector::default(), 4.0).unwrap();
        tree.apply_move(&TreeMove::RemoveEvent {
            event: EventRef { node: 3, index: 0 },
        })
        .unwrap();
        tree.apply_move(&TreeMove::RemoveEvent {
            event: EventRef { node: 2, index: 0 },
        })
        .unwrap();
        let pairs = tree.who_infected_whom().unwrap();
        assert!(pairs.contains(&("C".to_string(), None)));
        assert!(pairs.contains(&("A".to_string(), Some("C".to_string()))));
        assert!(pairs.contains(&("B".to_string(), Some("C".to_string()))));
    }
}
