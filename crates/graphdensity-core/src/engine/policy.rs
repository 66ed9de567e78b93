//! Decrement policies: how much a selected point reduces its neighbors' potential.
//!
//! A policy is any value implementing [`DecrementPolicy`], including plain
//! closures `Fn(selected, neighbor) -> f64`. The scorer only calls it for
//! pairs that are neighbors and expects a finite, non-negative result.

use rustc_hash::FxHashMap;

use crate::engine::errors::{ScoreError, ScoreResult};
use crate::engine::graph::{squared_distance, DensityGraph};

/// Redundancy penalty applied to `neighbor` after `selected` was picked.
pub trait DecrementPolicy {
    fn decrement_weight(&self, selected: usize, neighbor: usize) -> f64;
}

impl<F> DecrementPolicy for F
where
    F: Fn(usize, usize) -> f64,
{
    fn decrement_weight(&self, selected: usize, neighbor: usize) -> f64 {
        self(selected, neighbor)
    }
}

/// How the policy value turns into the amount subtracted from a neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DecrementScaling {
    /// Subtract the policy value itself.
    #[default]
    Absolute,
    /// Subtract `potential(selected) * policy value`, the node-potential
    /// update rule. The policy then acts as a similarity in `[0, 1]`.
    SelectedPotential,
}

impl DecrementScaling {
    pub(crate) fn apply(self, selected_potential: f64, weight: f64) -> f64 {
        match self {
            DecrementScaling::Absolute => weight,
            DecrementScaling::SelectedPotential => selected_potential * weight,
        }
    }
}

/// The same penalty for every neighbor.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConstantDecrement(pub f64);

impl DecrementPolicy for ConstantDecrement {
    fn decrement_weight(&self, _selected: usize, _neighbor: usize) -> f64 {
        self.0
    }
}

fn check_parameter(name: &str, value: f64) -> ScoreResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ScoreError::Configuration(format!(
            "{name} must be finite and >= 0, got {value}"
        )))
    }
}

/// Penalty proportional to the weight of the edge between the two points.
///
/// The weight is the one the selected point registered for the neighbor;
/// for edges registered in one direction only the reverse entry is used.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EdgeWeightDecrement {
    weights: FxHashMap<(u32, u32), f64>,
    scale: f64,
}

impl EdgeWeightDecrement {
    pub fn from_graph(graph: &DensityGraph) -> Self {
        Self::collect(graph, 1.0)
    }

    pub fn with_scale(graph: &DensityGraph, scale: f64) -> ScoreResult<Self> {
        check_parameter("edge weight scale", scale)?;
        Ok(Self::collect(graph, scale))
    }

    fn collect(graph: &DensityGraph, scale: f64) -> Self {
        let mut weights =
            FxHashMap::with_capacity_and_hasher(graph.edge_count(), Default::default());
        for node in graph.nodes() {
            for edge in node.edges() {
                weights.insert((node.id().0, edge.target.0), edge.weight);
            }
        }
        Self { weights, scale }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }
}

impl DecrementPolicy for EdgeWeightDecrement {
    fn decrement_weight(&self, selected: usize, neighbor: usize) -> f64 {
        let (s, n) = (selected as u32, neighbor as u32);
        self.weights
            .get(&(s, n))
            .or_else(|| self.weights.get(&(n, s)))
            .map_or(0.0, |w| w * self.scale)
    }
}

/// Gaussian similarity `exp(-beta * |x_s - x_n|^2)` between the two points.
///
/// Squared distances are computed once per undirected neighbor pair when
/// the policy is built and stored under the ordered pair `(min, max)`.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GaussianDecrement {
    beta: f64,
    squared_distances: FxHashMap<(u32, u32), f64>,
}

impl GaussianDecrement {
    pub fn from_graph(graph: &DensityGraph, beta: f64) -> ScoreResult<Self> {
        check_parameter("beta", beta)?;
        let mut squared_distances =
            FxHashMap::with_capacity_and_hasher(graph.edge_count() / 2 + 1, Default::default());
        let nodes = graph.nodes();
        for node in nodes {
            for neighbor in node.neighbors() {
                let pair = ordered(node.id().0, neighbor.0);
                squared_distances.entry(pair).or_insert_with(|| {
                    squared_distance(node.coordinates(), nodes[neighbor.index()].coordinates())
                });
            }
        }
        Ok(Self {
            beta,
            squared_distances,
        })
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    /// Stored squared distance for a neighbor pair, in either order.
    pub fn squared_distance(&self, a: usize, b: usize) -> Option<f64> {
        self.squared_distances
            .get(&ordered(a as u32, b as u32))
            .copied()
    }
}

impl DecrementPolicy for GaussianDecrement {
    fn decrement_weight(&self, selected: usize, neighbor: usize) -> f64 {
        self.squared_distance(selected, neighbor)
            .map_or(0.0, |d2| (-self.beta * d2).exp())
    }
}

fn ordered(a: u32, b: u32) -> (u32, u32) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}
