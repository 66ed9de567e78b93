//! # Density Scorer
//!
//! Indexes a finished [`DensityGraph`] and owns the mutable potential of
//! every point for one labeling round.
//!
//! ## Selection
//!
//! Selecting a point (greedily via [`DensityScorer::select_next`] or for an
//! externally labeled row via [`DensityScorer::update_neighbors`]) does:
//!
//! 1. for every neighbor `n` of the point `s`, subtract
//!    `scaling(potential[s], policy(s, n))` from `potential[n]`, clamped at 0
//! 2. set `potential[s]` to 0 and mark `s` selected
//!
//! Greedy selection always takes the unselected point with the highest
//! potential; ties go to the lowest index, so the insertion order of the
//! graph fully determines the result. Potentials never go negative: a
//! potential is remaining representativeness, and nothing below zero can
//! win a later max-selection.
//!
//! ## Design
//!
//! - The scorer owns the graph, so topology cannot change once potentials
//!   have been initialized.
//! - Candidates live in a lazy max-heap. Potentials only decrease, so a heap
//!   entry whose value differs from the current potential is stale and is
//!   dropped when popped.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use smallvec::SmallVec;

use crate::engine::errors::{ScoreError, ScoreResult};
use crate::engine::graph::{DensityGraph, RowKey};
use crate::engine::policy::{DecrementPolicy, DecrementScaling};

/// Configuration for a [`DensityScorer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScorerConfig {
    /// Minimum number of points the scorer accepts. Default: 1
    pub min_rows: usize,
    /// Store neighborhoods in ascending index order instead of the
    /// registration order of the graph. Default: false
    pub sort_neighborhoods: bool,
    /// How policy values become potential decrements. Default: `Absolute`
    pub scaling: DecrementScaling,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            min_rows: 1,
            sort_neighborhoods: false,
            scaling: DecrementScaling::Absolute,
        }
    }
}

/// What to do with keys that are not part of the model in batch updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UnknownRows {
    /// Reject the whole batch before applying any update.
    #[default]
    Fail,
    /// Ignore unknown keys and count them.
    Skip,
}

/// One selected point, in the order emitted by the selection loop.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Selection {
    pub index: usize,
    pub key: RowKey,
    /// Potential of the point at the moment it was selected.
    pub potential: f64,
}

/// Outcome of [`DensityScorer::update_many`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    /// Keys whose neighborhood was updated.
    pub updated: usize,
    /// Known keys that had already been selected.
    pub already_selected: usize,
    /// Unknown keys ignored under [`UnknownRows::Skip`].
    pub skipped: usize,
}

/// Heap entry ordering: higher potential first, then lower index.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    potential: f64,
    index: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // potentials are validated finite, so partial_cmp never fails
        self.potential
            .partial_cmp(&other.potential)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.index.cmp(&self.index))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Potential model over a fixed set of points.
///
/// `P` is the decrement policy, see [`crate::engine::policy`].
#[derive(Debug, Clone)]
pub struct DensityScorer<P> {
    graph: DensityGraph,
    neighborhoods: Vec<Box<[usize]>>,
    potentials: Vec<f64>,
    selected: Vec<bool>,
    remaining: usize,
    queue: BinaryHeap<Candidate>,
    policy: P,
    config: ScorerConfig,
}

impl<P: DecrementPolicy> DensityScorer<P> {
    /// Builds a scorer with the default [`ScorerConfig`].
    pub fn new(graph: DensityGraph, policy: P) -> ScoreResult<Self> {
        Self::with_config(graph, policy, ScorerConfig::default())
    }

    /// Builds a scorer, initializing every potential from its node's density.
    ///
    /// # Errors
    ///
    /// * `Configuration` - fewer than `config.min_rows` points
    /// * `Numerical` - a node density is negative or not finite
    pub fn with_config(graph: DensityGraph, policy: P, config: ScorerConfig) -> ScoreResult<Self> {
        if graph.len() < config.min_rows {
            return Err(ScoreError::Configuration(format!(
                "at least {} data point(s) required, got {}",
                config.min_rows,
                graph.len()
            )));
        }

        let mut potentials = Vec::with_capacity(graph.len());
        let mut neighborhoods = Vec::with_capacity(graph.len());
        for node in graph.nodes() {
            let density = node.density();
            if !density.is_finite() || density < 0.0 {
                return Err(ScoreError::Numerical(format!(
                    "density of '{}' must be finite and >= 0, got {}",
                    node.key(),
                    density
                )));
            }
            potentials.push(density);

            let mut neighborhood: Box<[usize]> = node.neighbors().map(|n| n.index()).collect();
            if config.sort_neighborhoods {
                neighborhood.sort_unstable();
            }
            neighborhoods.push(neighborhood);
        }

        let queue = potentials
            .iter()
            .enumerate()
            .map(|(index, &potential)| Candidate { potential, index })
            .collect();

        #[cfg(feature = "tracing")]
        tracing::info!(
            rows = graph.len(),
            edges = graph.edge_count(),
            "density scorer initialized"
        );

        Ok(Self {
            selected: vec![false; graph.len()],
            remaining: graph.len(),
            graph,
            neighborhoods,
            potentials,
            queue,
            policy,
            config,
        })
    }

    /// Current potential of the row with `key`.
    pub fn potential_of(&self, key: &str) -> ScoreResult<f64> {
        Ok(self.potentials[self.index_of(key)?])
    }

    /// Current potential of the point at `index`.
    pub fn potential(&self, index: usize) -> ScoreResult<f64> {
        self.potentials
            .get(index)
            .copied()
            .ok_or_else(|| ScoreError::out_of_range(index, self.potentials.len()))
    }

    /// All potentials in index order.
    pub fn potentials(&self) -> &[f64] {
        &self.potentials
    }

    /// Index of the row with `key`.
    pub fn index_of(&self, key: &str) -> ScoreResult<usize> {
        self.graph.id_of(key).map(|id| id.index())
    }

    pub fn key_of(&self, index: usize) -> ScoreResult<&RowKey> {
        self.graph
            .nodes()
            .get(index)
            .map(|node| node.key())
            .ok_or_else(|| ScoreError::out_of_range(index, self.nr_rows()))
    }

    /// Neighbor indices of the point at `index`; empty for isolated points.
    pub fn neighbors(&self, index: usize) -> ScoreResult<&[usize]> {
        self.neighborhoods
            .get(index)
            .map(|n| &n[..])
            .ok_or_else(|| ScoreError::out_of_range(index, self.neighborhoods.len()))
    }

    /// Number of indexed points.
    pub fn nr_rows(&self) -> usize {
        self.potentials.len()
    }

    pub fn is_selected(&self, index: usize) -> ScoreResult<bool> {
        self.selected
            .get(index)
            .copied()
            .ok_or_else(|| ScoreError::out_of_range(index, self.selected.len()))
    }

    /// Number of points not yet selected.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn graph(&self) -> &DensityGraph {
        &self.graph
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    /// Policy value for a neighbor pair, validated.
    ///
    /// # Errors
    ///
    /// * `IndexOutOfRange` - `index` is not a valid point
    /// * `InvalidArgument` - `neighbor` is not a neighbor of `index`, or the
    ///   policy returned a negative value
    /// * `Numerical` - the policy returned NaN or infinity
    pub fn decrement_weight(&self, index: usize, neighbor: usize) -> ScoreResult<f64> {
        if !self.neighbors(index)?.contains(&neighbor) {
            return Err(ScoreError::InvalidArgument(format!(
                "point {neighbor} is not a neighbor of point {index}"
            )));
        }
        self.checked_weight(index, neighbor)
    }

    fn checked_weight(&self, index: usize, neighbor: usize) -> ScoreResult<f64> {
        let weight = self.policy.decrement_weight(index, neighbor);
        if !weight.is_finite() {
            return Err(ScoreError::Numerical(format!(
                "decrement weight for ({index}, {neighbor}) is not finite: {weight}"
            )));
        }
        if weight < 0.0 {
            return Err(ScoreError::InvalidArgument(format!(
                "decrement weight for ({index}, {neighbor}) must be >= 0 but was {weight}"
            )));
        }
        Ok(weight)
    }

    /// Selects the unselected point with the highest potential and
    /// decrements its neighbors.
    ///
    /// Returns `Ok(None)` once every point has been selected.
    pub fn select_next(&mut self) -> ScoreResult<Option<Selection>> {
        while let Some(candidate) = self.queue.peek().copied() {
            let index = candidate.index;
            if self.selected[index] || candidate.potential != self.potentials[index] {
                self.queue.pop();
                continue;
            }
            // the entry stays queued until the update succeeded
            let potential = self.consume(index)?;
            self.queue.pop();

            #[cfg(feature = "tracing")]
            tracing::debug!(index, potential, remaining = self.remaining, "selected point");

            return Ok(Some(Selection {
                index,
                key: self.graph.nodes()[index].key().clone(),
                potential,
            }));
        }
        Ok(None)
    }

    /// Runs the greedy loop until `budget` points were selected or no
    /// unselected point remains.
    pub fn select(&mut self, budget: usize) -> ScoreResult<Vec<Selection>> {
        let mut selections = Vec::with_capacity(budget.min(self.remaining));
        while selections.len() < budget {
            match self.select_next()? {
                Some(selection) => selections.push(selection),
                None => break,
            }
        }
        Ok(selections)
    }

    /// Applies the selection step for an externally labeled row.
    ///
    /// Returns `Ok(false)` without changing anything if the row was already
    /// selected.
    pub fn update_neighbors(&mut self, key: &str) -> ScoreResult<bool> {
        let index = self.index_of(key)?;
        if self.selected[index] {
            return Ok(false);
        }
        self.consume(index)?;
        Ok(true)
    }

    /// Applies [`update_neighbors`](Self::update_neighbors) to every key.
    ///
    /// All keys are resolved and every decrement of the batch is validated
    /// before the first update, so an unknown key (under
    /// [`UnknownRows::Fail`]) or a policy error leaves the scorer untouched.
    pub fn update_many<I, K>(&mut self, keys: I, unknown: UnknownRows) -> ScoreResult<UpdateSummary>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut summary = UpdateSummary::default();
        let mut indices = Vec::new();
        for key in keys {
            match self.index_of(key.as_ref()) {
                Ok(index) => indices.push(index),
                Err(err) if unknown == UnknownRows::Fail => return Err(err),
                Err(_) => summary.skipped += 1,
            }
        }

        #[cfg(feature = "tracing")]
        if summary.skipped > 0 {
            tracing::warn!(
                skipped = summary.skipped,
                "rows ignored during the update because they are unknown to the model"
            );
        }

        // potentials only decrease, so a decrement that is finite now stays
        // finite when its row is consumed later in the batch
        for &index in &indices {
            if !self.selected[index] {
                self.plan_decrements(index)?;
            }
        }

        for index in indices {
            if self.selected[index] {
                summary.already_selected += 1;
                continue;
            }
            self.consume(index)?;
            summary.updated += 1;
        }
        Ok(summary)
    }

    /// Decrements the neighborhood of `index`, zeroes its own potential and
    /// marks it selected. Returns the potential it had.
    ///
    /// All decrements are computed and validated before any is applied.
    fn consume(&mut self, index: usize) -> ScoreResult<f64> {
        let potential = self.potentials[index];
        let decrements = self.plan_decrements(index)?;
        for (neighbor, decrement) in decrements {
            self.decrease_potential(neighbor, decrement);
        }
        self.potentials[index] = 0.0;
        self.selected[index] = true;
        self.remaining -= 1;
        Ok(potential)
    }

    /// Validated `(neighbor, decrement)` pairs for selecting `index` now.
    fn plan_decrements(&self, index: usize) -> ScoreResult<SmallVec<[(usize, f64); 16]>> {
        let potential = self.potentials[index];
        let scaling = self.config.scaling;
        let mut decrements = SmallVec::new();
        for &neighbor in self.neighborhoods[index].iter() {
            let weight = self.checked_weight(index, neighbor)?;
            let decrement = scaling.apply(potential, weight);
            if !decrement.is_finite() {
                return Err(ScoreError::Numerical(format!(
                    "decrement of point {neighbor} by point {index} is not finite"
                )));
            }
            decrements.push((neighbor, decrement));
        }
        Ok(decrements)
    }

    fn decrease_potential(&mut self, index: usize, decrement: f64) {
        let current = self.potentials[index];
        let updated = (current - decrement).max(0.0);
        if updated == current {
            return;
        }
        self.potentials[index] = updated;
        if !self.selected[index] {
            self.queue.push(Candidate {
                potential: updated,
                index,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::graph::{GraphNode, NodeId};
    use crate::engine::policy::ConstantDecrement;

    /// p1 <-> p2 with densities 1.0 and 2.0, p3 isolated.
    fn three_points() -> DensityGraph {
        let mut p1 = GraphNode::new(NodeId(0), "p1", vec![0.0]);
        let mut p2 = GraphNode::new(NodeId(1), "p2", vec![1.0]);
        let p3 = GraphNode::new(NodeId(2), "p3", vec![5.0]);
        p1.register_neighbor(NodeId(1), 1.0).unwrap();
        p2.register_neighbor(NodeId(0), 2.0).unwrap();
        DensityGraph::from_nodes(vec![p1, p2, p3]).unwrap()
    }

    fn scorer(graph: DensityGraph) -> DensityScorer<ConstantDecrement> {
        DensityScorer::new(graph, ConstantDecrement(1.0)).unwrap()
    }

    #[test]
    fn potentials_start_at_density() {
        let s = scorer(three_points());
        assert_eq!(s.potential_of("p1").unwrap(), 1.0);
        assert_eq!(s.potential(1).unwrap(), 2.0);
        assert_eq!(s.potential_of("p3").unwrap(), 0.0);
        assert_eq!(s.index_of("p3").unwrap(), 2);
        assert_eq!(s.nr_rows(), 3);
    }

    #[test]
    fn neighbors_resolve_to_indices() {
        let s = scorer(three_points());
        assert_eq!(s.neighbors(0).unwrap(), &[1]);
        assert_eq!(s.neighbors(1).unwrap(), &[0]);
        assert!(s.neighbors(2).unwrap().is_empty());
    }

    #[test]
    fn lookups_fail_cleanly() {
        let s = scorer(three_points());
        assert!(matches!(s.potential_of("nope"), Err(ScoreError::UnknownRow(_))));
        assert!(matches!(s.index_of("nope"), Err(ScoreError::UnknownRow(_))));
        assert_eq!(s.potential(3), Err(ScoreError::IndexOutOfRange { index: 3, len: 3 }));
        assert!(s.neighbors(9).is_err());
        assert!(s.key_of(3).is_err());
        assert_eq!(s.key_of(0).unwrap().as_str(), "p1");
    }

    #[test]
    fn empty_graph_is_a_configuration_error() {
        let err = DensityScorer::new(DensityGraph::new(), ConstantDecrement(1.0)).unwrap_err();
        assert!(matches!(err, ScoreError::Configuration(_)));

        let config = ScorerConfig {
            min_rows: 0,
            ..ScorerConfig::default()
        };
        let mut s =
            DensityScorer::with_config(DensityGraph::new(), ConstantDecrement(1.0), config).unwrap();
        assert_eq!(s.select_next().unwrap(), None);
    }

    #[test]
    fn decrement_weight_requires_neighbors() {
        let s = scorer(three_points());
        assert_eq!(s.decrement_weight(0, 1).unwrap(), 1.0);
        assert!(matches!(s.decrement_weight(0, 2), Err(ScoreError::InvalidArgument(_))));
        assert!(matches!(s.decrement_weight(7, 0), Err(ScoreError::IndexOutOfRange { .. })));
    }

    #[test]
    fn select_next_takes_max_and_decrements_neighbors() {
        let mut s = scorer(three_points());
        let first = s.select_next().unwrap().unwrap();
        assert_eq!(first.index, 1);
        assert_eq!(first.key.as_str(), "p2");
        assert_eq!(first.potential, 2.0);

        // p1 lost the constant 1.0, p2 is consumed
        assert_eq!(s.potential(0).unwrap(), 0.0);
        assert_eq!(s.potential(1).unwrap(), 0.0);
        assert!(s.is_selected(1).unwrap());
        assert_eq!(s.remaining(), 2);
    }

    #[test]
    fn ties_go_to_lowest_index() {
        let mut s = scorer(three_points());
        s.select_next().unwrap();
        // p1 and p3 are both at 0.0 now
        let order: Vec<usize> = s.select(5).unwrap().iter().map(|sel| sel.index).collect();
        assert_eq!(order, vec![0, 2]);
        assert_eq!(s.select_next().unwrap(), None);
    }

    #[test]
    fn decrements_clamp_at_zero() {
        let mut s = DensityScorer::new(three_points(), ConstantDecrement(10.0)).unwrap();
        s.select_next().unwrap();
        assert_eq!(s.potential(0).unwrap(), 0.0);
    }

    #[test]
    fn selected_potential_scaling() {
        let config = ScorerConfig {
            scaling: DecrementScaling::SelectedPotential,
            ..ScorerConfig::default()
        };
        let mut s =
            DensityScorer::with_config(three_points(), |_: usize, _: usize| 0.25, config).unwrap();
        assert!(s.update_neighbors("p2").unwrap());
        // 1.0 - 2.0 * 0.25
        assert_eq!(s.potential_of("p1").unwrap(), 0.5);
        assert_eq!(s.potential_of("p2").unwrap(), 0.0);
    }

    #[test]
    fn update_neighbors_is_idempotent_per_row() {
        let mut s = scorer(three_points());
        assert!(s.update_neighbors("p1").unwrap());
        let after_first = s.potentials().to_vec();
        assert!(!s.update_neighbors("p1").unwrap());
        assert_eq!(s.potentials(), &after_first[..]);
        assert!(matches!(s.update_neighbors("zz"), Err(ScoreError::UnknownRow(_))));
    }

    #[test]
    fn negative_policy_values_are_rejected_without_mutation() {
        let mut s = DensityScorer::new(three_points(), |_: usize, _: usize| -1.0).unwrap();
        let before = s.potentials().to_vec();
        assert!(matches!(s.select_next(), Err(ScoreError::InvalidArgument(_))));
        assert_eq!(s.potentials(), &before[..]);
        assert_eq!(s.remaining(), 3);
    }

    #[test]
    fn negative_weights_never_reach_the_potentials() {
        let mut g = DensityGraph::new();
        let a = g.add_node("a", vec![0.0]).unwrap();
        let b = g.add_node("b", vec![1.0]).unwrap();
        let c = g.add_node("c", vec![2.0]).unwrap();
        assert!(matches!(g.connect(a, b, -1.0), Err(ScoreError::InvalidArgument(_))));
        g.connect(b, c, 3.0).unwrap();

        let mut s = DensityScorer::new(g.clone(), ConstantDecrement(0.5)).unwrap();
        assert_eq!(s.potentials(), &[0.0, 3.0, 3.0]);
        let mut previous = s.potentials().to_vec();
        while s.select_next().unwrap().is_some() {
            for (before, after) in previous.iter().zip(s.potentials()) {
                assert!(*after >= 0.0 && after <= before);
            }
            previous = s.potentials().to_vec();
        }

        g.node_mut(a).unwrap().set_density(-1.0);
        let err = DensityScorer::new(g, ConstantDecrement(0.5)).unwrap_err();
        assert!(matches!(err, ScoreError::Numerical(_)));
    }

    #[test]
    fn update_many_validates_the_whole_batch_first() {
        // p3's neighborhood has a negative policy value, p1's does not
        let mut g = DensityGraph::new();
        let ids: Vec<NodeId> = (0..4)
            .map(|i| g.add_node(format!("p{}", i + 1), vec![i as f64]).unwrap())
            .collect();
        g.connect(ids[0], ids[1], 1.0).unwrap();
        g.connect(ids[2], ids[3], 1.0).unwrap();
        let policy = |selected: usize, _: usize| if selected == 2 { -1.0 } else { 0.5 };
        let mut s = DensityScorer::new(g, policy).unwrap();
        let before = s.potentials().to_vec();

        let err = s.update_many(["p1", "p3"], UnknownRows::Fail).unwrap_err();
        assert!(matches!(err, ScoreError::InvalidArgument(_)));
        assert_eq!(s.potentials(), &before[..]);
        assert_eq!(s.remaining(), 4);
        assert!(!s.is_selected(0).unwrap());
    }

    #[test]
    fn update_many_handles_unknown_rows() {
        let mut s = scorer(three_points());
        assert!(s.update_many(["p1", "nope"], UnknownRows::Fail).is_err());
        assert_eq!(s.remaining(), 3);

        let summary = s.update_many(["p1", "nope", "p1"], UnknownRows::Skip).unwrap();
        assert_eq!(
            summary,
            UpdateSummary {
                updated: 1,
                already_selected: 1,
                skipped: 1
            }
        );
    }

    #[test]
    fn sorted_neighborhoods() {
        let mut g = DensityGraph::new();
        let ids: Vec<NodeId> = (0..4)
            .map(|i| g.add_node(format!("n{i}"), vec![i as f64]).unwrap())
            .collect();
        g.register_neighbor(ids[0], ids[3], 1.0).unwrap();
        g.register_neighbor(ids[0], ids[1], 1.0).unwrap();

        let unsorted = DensityScorer::new(g.clone(), ConstantDecrement(0.0)).unwrap();
        assert_eq!(unsorted.neighbors(0).unwrap(), &[3, 1]);

        let config = ScorerConfig {
            sort_neighborhoods: true,
            ..ScorerConfig::default()
        };
        let sorted = DensityScorer::with_config(g, ConstantDecrement(0.0), config).unwrap();
        assert_eq!(sorted.neighbors(0).unwrap(), &[1, 3]);
    }
}
