//! # Density Graph
//!
//! Arena-backed proximity graph over the data points of one labeling round.
//!
//! ## Key Components
//!
//! - **RowKey**: opaque, cheaply clonable row identifier
//! - **NodeId**: position of a node in the arena; identical to the node's
//!   index in a [`DensityScorer`](crate::engine::scorer::DensityScorer)
//! - **GraphNode**: one data point, owning its density accumulator and its
//!   insertion-ordered neighbor set
//! - **DensityGraph**: the arena plus a key → id lookup
//!
//! ## Design
//!
//! Nodes never reference each other directly. An edge is a `(NodeId, weight)`
//! pair stored on the node that registered it, so neighbor de-duplication is
//! by id value rather than by object identity, and the whole graph is plain
//! data that can be cloned or serialized.
//!
//! ## Example
//!
//! ```rust
//! use graphdensity_core::engine::graph::DensityGraph;
//!
//! let mut graph = DensityGraph::new();
//! let a = graph.add_node("a", vec![0.0, 0.0]).unwrap();
//! let b = graph.add_node("b", vec![0.0, 1.0]).unwrap();
//! graph.connect(a, b, 0.5).unwrap();
//! assert_eq!(graph.node(a).unwrap().density(), 0.5);
//! ```

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::engine::errors::{ScoreError, ScoreResult};

/// Inline capacity of a node's neighbor list. k-NN graphs rarely exceed it.
const INLINE_NEIGHBORS: usize = 8;

/// Relative tolerance when checking a stored density against its edges.
const DENSITY_TOLERANCE: f64 = 1e-9;

/// Unique identifier of a data point (the row key of the source table).
///
/// Backed by `Arc<str>` so that keys can be shared between the graph, the
/// scorer and emitted selections without reallocating.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct RowKey(Arc<str>);

impl RowKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        RowKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RowKey {
    fn from(key: &str) -> Self {
        RowKey(Arc::from(key))
    }
}

impl From<String> for RowKey {
    fn from(key: String) -> Self {
        RowKey(Arc::from(key))
    }
}

impl Borrow<str> for RowKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for RowKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position of a node in a [`DensityGraph`].
///
/// NodeId implements Ord/PartialOrd for stable, deterministic iteration.
/// Uses u32 internally for compact neighbor lists.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(pub u32);

impl NodeId {
    /// The id as a position index.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(index: usize) -> ScoreResult<Self> {
        u32::try_from(index).map(NodeId).map_err(|_| {
            ScoreError::Configuration(format!("graph exceeds {} nodes", u32::MAX))
        })
    }
}

/// A directed half of a neighbor relation: the neighbor and the weight its
/// registration contributed to the owner's density.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Edge {
    pub target: NodeId,
    pub weight: f64,
}

/// One data point of the proximity graph.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GraphNode {
    id: NodeId,
    key: RowKey,
    /// Feature vector; only neighborhood builders and distance-based
    /// decrement policies read it.
    coordinates: Vec<f64>,
    density: f64,
    neighbors: SmallVec<[Edge; INLINE_NEIGHBORS]>,
    normalized: bool,
    /// Set once the owning graph min-max rescaled all densities.
    rescaled: bool,
}

impl GraphNode {
    /// Creates a node with zero density and no neighbors.
    pub fn new(id: NodeId, key: impl Into<RowKey>, coordinates: Vec<f64>) -> Self {
        Self {
            id,
            key: key.into(),
            coordinates,
            density: 0.0,
            neighbors: SmallVec::new(),
            normalized: false,
            rescaled: false,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn key(&self) -> &RowKey {
        &self.key
    }

    pub fn coordinates(&self) -> &[f64] {
        &self.coordinates
    }

    /// Accumulated edge weight, or the mean edge weight once normalized.
    pub fn density(&self) -> f64 {
        self.density
    }

    /// Distinct neighbors in registration order.
    pub fn neighbors(&self) -> impl ExactSizeIterator<Item = NodeId> + '_ {
        self.neighbors.iter().map(|e| e.target)
    }

    /// Distinct neighbor edges in registration order.
    pub fn edges(&self) -> &[Edge] {
        &self.neighbors
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbors.len()
    }

    pub fn has_neighbor(&self, other: NodeId) -> bool {
        self.neighbors.iter().any(|e| e.target == other)
    }

    /// Weight under which `other` was first registered.
    pub fn neighbor_weight(&self, other: NodeId) -> Option<f64> {
        self.neighbors
            .iter()
            .find(|e| e.target == other)
            .map(|e| e.weight)
    }

    pub fn is_normalized(&self) -> bool {
        self.normalized
    }

    pub fn is_rescaled(&self) -> bool {
        self.rescaled
    }

    /// Registers `other` as a neighbor and adds `weight` to the density.
    ///
    /// Re-registering a neighbor that is already present is a no-op: the
    /// first weight stands and the density is not incremented again.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - the neighbor was added
    /// * `Ok(false)` - the neighbor was already registered
    /// * `Err(ScoreError::InvalidArgument)` - `other` is this node, the
    ///   weight is negative or not finite, or the density was already
    ///   normalized or rescaled
    pub fn register_neighbor(&mut self, other: NodeId, weight: f64) -> ScoreResult<bool> {
        self.check_registration(other, weight)?;
        self.check_open()?;
        if self.has_neighbor(other) {
            return Ok(false);
        }
        self.neighbors.push(Edge {
            target: other,
            weight,
        });
        self.density += weight;
        Ok(true)
    }

    fn check_registration(&self, other: NodeId, weight: f64) -> ScoreResult<()> {
        if other == self.id {
            return Err(ScoreError::InvalidArgument(format!(
                "data point '{}' must not be its own neighbor",
                self.key
            )));
        }
        if !weight.is_finite() || weight < 0.0 {
            return Err(ScoreError::InvalidArgument(format!(
                "edge weight for '{}' must be finite and >= 0, got {}",
                self.key, weight
            )));
        }
        Ok(())
    }

    /// Densities are final once normalized or rescaled.
    fn check_open(&self) -> ScoreResult<()> {
        if self.normalized || self.rescaled {
            return Err(ScoreError::InvalidArgument(format!(
                "density of '{}' is final, no neighbors can be added",
                self.key
            )));
        }
        Ok(())
    }

    /// Checks that the stored density is the one its edges and flags imply.
    fn check_density(&self) -> ScoreResult<()> {
        let consistent = if self.rescaled {
            self.density.is_finite() && self.density >= 0.0
        } else {
            let sum = self.neighbors.iter().fold(0.0, |acc, e| acc + e.weight);
            let expected = if self.normalized && !self.neighbors.is_empty() {
                sum / self.neighbors.len() as f64
            } else {
                sum
            };
            (self.density - expected).abs() <= DENSITY_TOLERANCE * expected.abs().max(1.0)
        };
        if consistent {
            Ok(())
        } else {
            Err(ScoreError::Configuration(format!(
                "data point '{}' has density {} inconsistent with its edges",
                self.key, self.density
            )))
        }
    }

    /// Turns the weighted-degree density into a mean edge weight.
    ///
    /// Only the first call divides; later calls are no-ops. A node without
    /// neighbors keeps its density (zero by construction).
    pub fn normalize_density(&mut self) {
        if self.normalized {
            return;
        }
        if !self.neighbors.is_empty() {
            self.density /= self.neighbors.len() as f64;
        }
        self.normalized = true;
    }

    pub(crate) fn set_density(&mut self, density: f64) {
        self.density = density;
    }
}

/// Arena of [`GraphNode`]s addressed by [`NodeId`].
///
/// The arena order is the order in which nodes were added; it becomes the
/// index order of any scorer built on top of the graph.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(try_from = "Vec<GraphNode>", into = "Vec<GraphNode>")
)]
pub struct DensityGraph {
    nodes: Vec<GraphNode>,
    key_index: FxHashMap<RowKey, NodeId>,
    dimensions: Option<usize>,
    edge_count: usize,
}

impl DensityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            key_index: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
            dimensions: None,
            edge_count: 0,
        }
    }

    /// Builds a graph from already wired nodes.
    ///
    /// The nodes must be listed in id order (`nodes[i].id() == NodeId(i)`),
    /// keys must be unique, every neighbor must refer to a listed node at
    /// most once, and each density must match its edges (sum, or mean once
    /// normalized; any non-negative value once rescaled).
    pub fn from_nodes(nodes: Vec<GraphNode>) -> ScoreResult<Self> {
        let mut graph = Self::with_capacity(nodes.len());
        for (position, node) in nodes.iter().enumerate() {
            if node.id.index() != position {
                return Err(ScoreError::Configuration(format!(
                    "data point '{}' has id {} but is listed at position {}",
                    node.key, node.id.0, position
                )));
            }
            graph.check_dimensions(&node.key, &node.coordinates)?;
            if graph.key_index.insert(node.key.clone(), node.id).is_some() {
                return Err(ScoreError::Configuration(format!(
                    "duplicate row key '{}'",
                    node.key
                )));
            }
        }
        let mut targets = FxHashSet::default();
        for node in &nodes {
            targets.clear();
            for edge in node.edges() {
                if edge.target.index() >= nodes.len() {
                    return Err(ScoreError::Configuration(format!(
                        "data point '{}' has a neighbor ({}) that is not in the dataset",
                        node.key, edge.target.0
                    )));
                }
                if !targets.insert(edge.target) {
                    return Err(ScoreError::Configuration(format!(
                        "data point '{}' lists neighbor {} more than once",
                        node.key, edge.target.0
                    )));
                }
                node.check_registration(edge.target, edge.weight)?;
            }
            node.check_density()?;
            graph.edge_count += node.neighbor_count();
        }
        graph.nodes = nodes;
        Ok(graph)
    }

    /// Appends a node with zero density.
    ///
    /// # Errors
    ///
    /// * `Configuration` - the key is already present
    /// * `InvalidArgument` - the coordinate length differs from earlier nodes
    /// * `Numerical` - a coordinate is NaN or infinite
    pub fn add_node(
        &mut self,
        key: impl Into<RowKey>,
        coordinates: Vec<f64>,
    ) -> ScoreResult<NodeId> {
        let key = key.into();
        if self.key_index.contains_key(&key) {
            return Err(ScoreError::Configuration(format!(
                "duplicate row key '{}'",
                key
            )));
        }
        self.check_dimensions(&key, &coordinates)?;
        let id = NodeId::from_index(self.nodes.len())?;
        self.key_index.insert(key.clone(), id);
        self.nodes.push(GraphNode::new(id, key, coordinates));
        Ok(id)
    }

    fn check_dimensions(&mut self, key: &RowKey, coordinates: &[f64]) -> ScoreResult<()> {
        if let Some(bad) = coordinates.iter().find(|c| !c.is_finite()) {
            return Err(ScoreError::Numerical(format!(
                "data point '{}' has non-finite coordinate {}",
                key, bad
            )));
        }
        match self.dimensions {
            Some(dims) if dims != coordinates.len() => Err(ScoreError::InvalidArgument(format!(
                "data point '{}' has {} coordinates, expected {}",
                key,
                coordinates.len(),
                dims
            ))),
            Some(_) => Ok(()),
            None => {
                self.dimensions = Some(coordinates.len());
                Ok(())
            }
        }
    }

    /// Registers `other` as a neighbor of `node` (one direction).
    ///
    /// See [`GraphNode::register_neighbor`] for the de-duplication rule.
    pub fn register_neighbor(
        &mut self,
        node: NodeId,
        other: NodeId,
        weight: f64,
    ) -> ScoreResult<bool> {
        self.check_id(other)?;
        let len = self.nodes.len();
        let owner = self
            .nodes
            .get_mut(node.index())
            .ok_or_else(|| ScoreError::out_of_range(node.index(), len))?;
        let added = owner.register_neighbor(other, weight)?;
        if added {
            self.edge_count += 1;
        }
        Ok(added)
    }

    /// Registers the undirected edge `a - b` in both directions.
    ///
    /// Both registrations are validated before either is applied.
    pub fn connect(&mut self, a: NodeId, b: NodeId, weight: f64) -> ScoreResult<()> {
        self.check_id(a)?;
        self.check_id(b)?;
        self.nodes[a.index()].check_registration(b, weight)?;
        self.nodes[a.index()].check_open()?;
        self.nodes[b.index()].check_open()?;
        self.register_neighbor(a, b, weight)?;
        self.register_neighbor(b, a, weight)?;
        Ok(())
    }

    /// Normalizes the density of one node (first call only).
    pub fn normalize_density(&mut self, id: NodeId) -> ScoreResult<()> {
        self.check_id(id)?;
        self.nodes[id.index()].normalize_density();
        Ok(())
    }

    /// Normalizes every node's density (first call per node only).
    pub fn normalize_densities(&mut self) {
        for node in &mut self.nodes {
            node.normalize_density();
        }
    }

    /// Min-max rescales all densities into `[0, 1]`.
    ///
    /// When every density is equal the graph carries no density contrast
    /// and the values are left as they are. Either way every node is
    /// marked rescaled and accepts no further neighbors.
    pub fn rescale_densities(&mut self) {
        let Some((min, max)) = self.density_range() else {
            return;
        };
        #[cfg(feature = "tracing")]
        tracing::debug!(min, max, nodes = self.nodes.len(), "rescaling densities");
        let span = max - min;
        for node in &mut self.nodes {
            if span > 0.0 {
                node.set_density((node.density - min) / span);
            }
            node.rescaled = true;
        }
    }

    fn density_range(&self) -> Option<(f64, f64)> {
        let mut densities = self.nodes.iter().map(|n| n.density);
        let first = densities.next()?;
        Some(densities.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d))))
    }

    fn check_id(&self, id: NodeId) -> ScoreResult<()> {
        if id.index() < self.nodes.len() {
            Ok(())
        } else {
            Err(ScoreError::out_of_range(id.index(), self.nodes.len()))
        }
    }

    pub fn node(&self, id: NodeId) -> ScoreResult<&GraphNode> {
        self.nodes
            .get(id.index())
            .ok_or_else(|| ScoreError::out_of_range(id.index(), self.nodes.len()))
    }

    #[cfg(test)]
    pub(crate) fn node_mut(&mut self, id: NodeId) -> ScoreResult<&mut GraphNode> {
        let len = self.nodes.len();
        self.nodes
            .get_mut(id.index())
            .ok_or_else(|| ScoreError::out_of_range(id.index(), len))
    }

    pub fn node_by_key(&self, key: &str) -> ScoreResult<&GraphNode> {
        let id = self.id_of(key)?;
        Ok(&self.nodes[id.index()])
    }

    /// Resolves a row key to its node id.
    pub fn id_of(&self, key: &str) -> ScoreResult<NodeId> {
        self.key_index
            .get(key)
            .copied()
            .ok_or_else(|| ScoreError::UnknownRow(RowKey::from(key)))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.key_index.contains_key(key)
    }

    /// Nodes in id order.
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of registered (directed) neighbor entries.
    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// Coordinate length shared by all nodes, once the first node is added.
    pub fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }
}

impl TryFrom<Vec<GraphNode>> for DensityGraph {
    type Error = ScoreError;

    fn try_from(nodes: Vec<GraphNode>) -> ScoreResult<Self> {
        DensityGraph::from_nodes(nodes)
    }
}

impl From<DensityGraph> for Vec<GraphNode> {
    fn from(graph: DensityGraph) -> Self {
        graph.nodes
    }
}

/// Squared Euclidean distance between two coordinate vectors of equal length.
pub fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}
