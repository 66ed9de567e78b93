//! # Neighborhood Builders
//!
//! Reference neighbor builders that turn raw feature vectors into a wired
//! [`DensityGraph`] plus the decrement policy that belongs to it.
//!
//! - [`KnnDensityBuilder`]: graph density. Every point is connected to its
//!   `k` nearest neighbors with weight `exp(-d / (2 sigma^2))`; densities
//!   are normalized per node and then min-max rescaled.
//! - [`RadiusPotentialBuilder`]: node potential. Neighbors are all points
//!   within `rb = 1.25 * ra`, but only points within `ra` contribute
//!   `exp(-alpha d^2)` to the density; densities are min-max rescaled. The
//!   matching [`GaussianDecrement`] uses `beta = 4 / rb^2`.
//!
//! Distances are Euclidean and the search is brute force, O(n^2) in the
//! number of points. With the `parallel` feature the per-point searches run
//! on the rayon pool; wiring is always applied in index order, so the
//! resulting graph is identical either way.

use crate::engine::errors::{ScoreError, ScoreResult};
use crate::engine::graph::{squared_distance, DensityGraph, GraphNode, NodeId, RowKey};
use crate::engine::policy::{
    DecrementPolicy, DecrementScaling, EdgeWeightDecrement, GaussianDecrement,
};
use crate::engine::scorer::{DensityScorer, ScorerConfig};

/// Share of the dataset above which a radius neighborhood triggers a warning.
pub const NEIGHBORHOOD_WARNING_RATIO: f64 = 0.2;

const RADIUS_BETA_FACTOR: f64 = 1.25;

/// Handling of rows whose feature vector contains NaN or infinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MissingValues {
    /// Reject the row with a `Numerical` error.
    #[default]
    Fail,
    /// Drop the row and report it in [`BuildReport::warnings`].
    Ignore,
}

/// Configuration for [`KnnDensityBuilder`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KnnDensityConfig {
    /// Number of nearest neighbors per point.
    pub neighbors: usize,
    /// Width of the Gaussian edge kernel.
    pub sigma: f64,
    pub missing_values: MissingValues,
}

impl Default for KnnDensityConfig {
    fn default() -> Self {
        Self {
            neighbors: 5,
            sigma: 1.0,
            missing_values: MissingValues::Fail,
        }
    }
}

impl KnnDensityConfig {
    pub fn validate(&self) -> ScoreResult<()> {
        if self.neighbors == 0 {
            return Err(ScoreError::Configuration(
                "graph density: neighbors must be > 0".into(),
            ));
        }
        if self.sigma <= 0.0 || !self.sigma.is_finite() {
            return Err(ScoreError::Configuration(
                "graph density: sigma must be finite and > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for [`RadiusPotentialBuilder`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RadiusPotentialConfig {
    /// Radius `ra` inside which points contribute to each other's potential.
    pub radius_alpha: f64,
    pub missing_values: MissingValues,
}

impl Default for RadiusPotentialConfig {
    fn default() -> Self {
        Self {
            radius_alpha: 1.0,
            missing_values: MissingValues::Fail,
        }
    }
}

impl RadiusPotentialConfig {
    pub fn validate(&self) -> ScoreResult<()> {
        if self.radius_alpha <= 0.0 || !self.radius_alpha.is_finite() {
            return Err(ScoreError::Configuration(
                "node potential: radius_alpha must be finite and > 0".into(),
            ));
        }
        Ok(())
    }

    /// Neighborhood radius `rb = 1.25 * ra`.
    pub fn radius_beta(&self) -> f64 {
        self.radius_alpha * RADIUS_BETA_FACTOR
    }

    /// Density kernel coefficient `4 / ra^2`.
    pub fn alpha(&self) -> f64 {
        4.0 / (self.radius_alpha * self.radius_alpha)
    }

    /// Decrement kernel coefficient `4 / rb^2`.
    pub fn beta(&self) -> f64 {
        let rb = self.radius_beta();
        4.0 / (rb * rb)
    }
}

/// Result of a neighborhood build.
#[derive(Debug, Clone)]
pub struct BuildReport<P> {
    /// Wired graph with final (rescaled) densities.
    pub graph: DensityGraph,
    /// Decrement policy matching the build method.
    pub policy: P,
    /// Scaling the policy was built for: `Absolute` for graph density,
    /// `SelectedPotential` for node potential.
    pub scaling: DecrementScaling,
    /// Human-readable warnings collected during the build.
    pub warnings: Vec<String>,
    /// Rows dropped under [`MissingValues::Ignore`].
    pub ignored_rows: usize,
}

impl<P: DecrementPolicy> BuildReport<P> {
    /// Scorer configuration matching the build method.
    pub fn scorer_config(&self) -> ScorerConfig {
        ScorerConfig {
            scaling: self.scaling,
            ..ScorerConfig::default()
        }
    }

    /// Indexes the built graph with its policy and [`Self::scorer_config`].
    pub fn into_scorer(self) -> ScoreResult<DensityScorer<P>> {
        let config = self.scorer_config();
        self.into_scorer_with(config)
    }

    /// Indexes the built graph with an explicit configuration. The
    /// `scaling` in `config` overrides the one the policy was built for.
    pub fn into_scorer_with(self, config: ScorerConfig) -> ScoreResult<DensityScorer<P>> {
        DensityScorer::with_config(self.graph, self.policy, config)
    }
}

/// Rows collected by a builder before the neighbor search.
#[derive(Debug, Clone, Default)]
struct PointSet {
    graph: DensityGraph,
    ignored_rows: usize,
    missing_values: MissingValues,
}

impl PointSet {
    fn new(missing_values: MissingValues) -> Self {
        Self {
            missing_values,
            ..Self::default()
        }
    }

    fn add(&mut self, key: RowKey, coordinates: Vec<f64>) -> ScoreResult<bool> {
        if self.missing_values == MissingValues::Ignore
            && coordinates.iter().any(|c| !c.is_finite())
        {
            self.ignored_rows += 1;
            return Ok(false);
        }
        self.graph.add_node(key, coordinates)?;
        Ok(true)
    }

    fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.ignored_rows > 0 {
            let plural = if self.ignored_rows == 1 { " is" } else { "s are" };
            warnings.push(format!(
                "{} row{} ignored due to missing values.",
                self.ignored_rows, plural
            ));
        }
        warnings
    }
}

/// Runs `search` for every point, on the rayon pool if enabled.
fn search_all<T, F>(nodes: &[GraphNode], search: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        (0..nodes.len()).into_par_iter().map(search).collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        (0..nodes.len()).map(search).collect()
    }
}

/// `k` nearest other points of `index`, nearest first; equal distances are
/// ordered by index.
fn nearest_neighbors(nodes: &[GraphNode], index: usize, k: usize) -> Vec<(usize, f64)> {
    let origin = nodes[index].coordinates();
    let mut candidates: Vec<(usize, f64)> = nodes
        .iter()
        .enumerate()
        .filter(|(j, _)| *j != index)
        .map(|(j, node)| (j, squared_distance(origin, node.coordinates())))
        .collect();
    let by_distance =
        |a: &(usize, f64), b: &(usize, f64)| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0));
    if candidates.len() > k {
        candidates.select_nth_unstable_by(k, by_distance);
        candidates.truncate(k);
    }
    candidates.sort_unstable_by(by_distance);
    candidates
        .into_iter()
        .map(|(j, d2)| (j, d2.sqrt()))
        .collect()
}

/// All other points within `radius` of `index`, in index order.
fn points_within(nodes: &[GraphNode], index: usize, radius: f64) -> Vec<(usize, f64)> {
    let origin = nodes[index].coordinates();
    nodes
        .iter()
        .enumerate()
        .filter(|(j, _)| *j != index)
        .filter_map(|(j, node)| {
            let d = squared_distance(origin, node.coordinates()).sqrt();
            (d <= radius).then_some((j, d))
        })
        .collect()
}

fn node_id(index: usize) -> ScoreResult<NodeId> {
    NodeId::from_index(index)
}

#[cfg(feature = "tracing")]
fn log_warnings(method: &str, warnings: &[String]) {
    for warning in warnings {
        tracing::warn!(method, "{}", warning);
    }
}

/// Builds a k-nearest-neighbor density graph.
///
/// ```rust
/// use graphdensity_core::engine::builder::{KnnDensityBuilder, KnnDensityConfig};
///
/// let config = KnnDensityConfig { neighbors: 1, ..KnnDensityConfig::default() };
/// let mut builder = KnnDensityBuilder::new(config).unwrap();
/// builder.add_point("a", vec![0.0]).unwrap();
/// builder.add_point("b", vec![1.0]).unwrap();
/// let report = builder.build().unwrap();
/// assert_eq!(report.graph.edge_count(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct KnnDensityBuilder {
    config: KnnDensityConfig,
    points: PointSet,
}

impl KnnDensityBuilder {
    pub fn new(config: KnnDensityConfig) -> ScoreResult<Self> {
        config.validate()?;
        Ok(Self {
            points: PointSet::new(config.missing_values),
            config,
        })
    }

    /// Adds one row. Returns `Ok(false)` if the row was ignored.
    pub fn add_point(
        &mut self,
        key: impl Into<RowKey>,
        coordinates: Vec<f64>,
    ) -> ScoreResult<bool> {
        self.points.add(key.into(), coordinates)
    }

    /// Rows added so far (ignored rows excluded).
    pub fn len(&self) -> usize {
        self.points.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.graph.is_empty()
    }

    /// Wires the graph and computes final densities.
    ///
    /// # Errors
    ///
    /// * `Configuration` - not more rows than `neighbors`
    pub fn build(self) -> ScoreResult<BuildReport<EdgeWeightDecrement>> {
        let k = self.config.neighbors;
        let warnings = self.points.warnings();
        let PointSet {
            mut graph,
            ignored_rows,
            ..
        } = self.points;
        if graph.len() <= k {
            return Err(ScoreError::Configuration(format!(
                "graph density: {} neighbors need more than {} rows, got {}",
                k,
                k,
                graph.len()
            )));
        }

        let two_sigma_sq = 2.0 * self.config.sigma * self.config.sigma;
        let neighborhoods = search_all(graph.nodes(), |i| nearest_neighbors(graph.nodes(), i, k));
        for (i, neighborhood) in neighborhoods.into_iter().enumerate() {
            let a = node_id(i)?;
            for (j, d) in neighborhood {
                graph.connect(a, node_id(j)?, (-d / two_sigma_sq).exp())?;
            }
        }
        graph.normalize_densities();
        graph.rescale_densities();

        #[cfg(feature = "tracing")]
        {
            log_warnings("graph density", &warnings);
            tracing::debug!(
                rows = graph.len(),
                edges = graph.edge_count(),
                neighbors = k,
                "built graph density neighborhoods"
            );
        }

        let policy = EdgeWeightDecrement::from_graph(&graph);
        Ok(BuildReport {
            graph,
            policy,
            scaling: DecrementScaling::Absolute,
            warnings,
            ignored_rows,
        })
    }
}

/// Builds a radius neighborhood graph for the node potential method.
#[derive(Debug, Clone)]
pub struct RadiusPotentialBuilder {
    config: RadiusPotentialConfig,
    points: PointSet,
}

impl RadiusPotentialBuilder {
    pub fn new(config: RadiusPotentialConfig) -> ScoreResult<Self> {
        config.validate()?;
        Ok(Self {
            points: PointSet::new(config.missing_values),
            config,
        })
    }

    /// Adds one row. Returns `Ok(false)` if the row was ignored.
    pub fn add_point(
        &mut self,
        key: impl Into<RowKey>,
        coordinates: Vec<f64>,
    ) -> ScoreResult<bool> {
        self.points.add(key.into(), coordinates)
    }

    pub fn len(&self) -> usize {
        self.points.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.graph.is_empty()
    }

    /// Wires the graph and computes final potentials.
    ///
    /// Each point registers its own neighbors; the edge weight is the
    /// point's density contribution, zero for neighbors beyond `ra`.
    pub fn build(self) -> ScoreResult<BuildReport<GaussianDecrement>> {
        let mut warnings = self.points.warnings();
        let PointSet {
            mut graph,
            ignored_rows,
            ..
        } = self.points;

        let ra = self.config.radius_alpha;
        let rb = self.config.radius_beta();
        let alpha = self.config.alpha();
        let rows = graph.len() as f64;

        let neighborhoods = search_all(graph.nodes(), |i| points_within(graph.nodes(), i, rb));
        let mut crowded = false;
        for (i, neighborhood) in neighborhoods.into_iter().enumerate() {
            // the point itself counts towards its neighborhood
            crowded |= (neighborhood.len() + 1) as f64 / rows > NEIGHBORHOOD_WARNING_RATIO;
            let a = node_id(i)?;
            for (j, d) in neighborhood {
                let contribution = if d <= ra { (-alpha * d * d).exp() } else { 0.0 };
                graph.register_neighbor(a, node_id(j)?, contribution)?;
            }
        }
        graph.rescale_densities();

        if crowded {
            warnings.push(format!(
                "Some rows have more than {}% of the dataset in their neighborhood. \
                 Consider reducing the radius alpha.",
                NEIGHBORHOOD_WARNING_RATIO * 100.0
            ));
        }
        #[cfg(feature = "tracing")]
        {
            log_warnings("node potential", &warnings);
            tracing::debug!(
                rows = graph.len(),
                edges = graph.edge_count(),
                radius_alpha = ra,
                "built node potential neighborhoods"
            );
        }

        let policy = GaussianDecrement::from_graph(&graph, self.config.beta())?;
        Ok(BuildReport {
            graph,
            policy,
            scaling: DecrementScaling::SelectedPotential,
            warnings,
            ignored_rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn configs_are_validated() {
        let bad = KnnDensityConfig {
            neighbors: 0,
            ..KnnDensityConfig::default()
        };
        assert!(matches!(bad.validate(), Err(ScoreError::Configuration(_))));
        let bad = KnnDensityConfig {
            sigma: 0.0,
            ..KnnDensityConfig::default()
        };
        assert!(KnnDensityBuilder::new(bad).is_err());
        let bad = RadiusPotentialConfig {
            radius_alpha: f64::NAN,
            ..RadiusPotentialConfig::default()
        };
        assert!(RadiusPotentialBuilder::new(bad).is_err());
    }

    #[test]
    fn radius_coefficients() {
        let config = RadiusPotentialConfig {
            radius_alpha: 2.0,
            ..RadiusPotentialConfig::default()
        };
        assert!(close(config.radius_beta(), 2.5));
        assert!(close(config.alpha(), 1.0));
        assert!(close(config.beta(), 0.64));
    }

    #[test]
    fn nearest_neighbors_break_ties_by_index() {
        let mut g = DensityGraph::new();
        for (key, x) in [("a", 0.0), ("b", 1.0), ("c", -1.0), ("d", 5.0)] {
            g.add_node(key, vec![x]).unwrap();
        }
        let found = nearest_neighbors(g.nodes(), 0, 2);
        assert_eq!(found, vec![(1, 1.0), (2, 1.0)]);
        assert_eq!(nearest_neighbors(g.nodes(), 3, 1), vec![(1, 4.0)]);
    }

    #[test]
    fn knn_requires_more_rows_than_neighbors() {
        let config = KnnDensityConfig {
            neighbors: 2,
            ..KnnDensityConfig::default()
        };
        let mut builder = KnnDensityBuilder::new(config).unwrap();
        builder.add_point("a", vec![0.0]).unwrap();
        builder.add_point("b", vec![1.0]).unwrap();
        assert!(matches!(builder.build(), Err(ScoreError::Configuration(_))));
    }

    #[test]
    fn knn_weights_use_gaussian_kernel() {
        let config = KnnDensityConfig {
            neighbors: 1,
            sigma: 1.0,
            ..KnnDensityConfig::default()
        };
        let mut builder = KnnDensityBuilder::new(config).unwrap();
        builder.add_point("a", vec![0.0]).unwrap();
        builder.add_point("b", vec![2.0]).unwrap();
        builder.add_point("c", vec![10.0]).unwrap();
        let report = builder.build().unwrap();
        let g = &report.graph;

        // a <-> b at distance 2, c's nearest is b at distance 8
        let a = g.node_by_key("a").unwrap();
        assert!(close(a.neighbor_weight(NodeId(1)).unwrap(), (-1.0f64).exp()));
        let b = g.node_by_key("b").unwrap();
        assert_eq!(b.neighbor_count(), 2);
        let c = g.node_by_key("c").unwrap();
        assert!(close(c.neighbor_weight(NodeId(1)).unwrap(), (-4.0f64).exp()));

        // a has the single strongest edge, c the weakest
        assert!(close(a.density(), 1.0));
        assert!(close(c.density(), 0.0));
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn ignored_rows_are_reported() {
        let config = KnnDensityConfig {
            neighbors: 1,
            missing_values: MissingValues::Ignore,
            ..KnnDensityConfig::default()
        };
        let mut builder = KnnDensityBuilder::new(config).unwrap();
        assert!(builder.add_point("a", vec![0.0]).unwrap());
        assert!(!builder.add_point("x", vec![f64::NAN]).unwrap());
        assert!(builder.add_point("b", vec![1.0]).unwrap());
        assert_eq!(builder.len(), 2);

        let report = builder.build().unwrap();
        assert_eq!(report.ignored_rows, 1);
        assert_eq!(report.warnings, vec!["1 row is ignored due to missing values."]);
        assert!(!report.graph.contains_key("x"));
    }

    #[test]
    fn missing_values_fail_by_default() {
        let mut builder = RadiusPotentialBuilder::new(RadiusPotentialConfig::default()).unwrap();
        assert!(matches!(
            builder.add_point("x", vec![f64::INFINITY]),
            Err(ScoreError::Numerical(_))
        ));
        assert!(builder.is_empty());
    }

    #[test]
    fn radius_potential_contributions() {
        let config = RadiusPotentialConfig {
            radius_alpha: 2.0,
            ..RadiusPotentialConfig::default()
        };
        let mut builder = RadiusPotentialBuilder::new(config).unwrap();
        for (key, x) in [("a", 0.0), ("b", 1.0), ("c", 3.25), ("d", 20.0)] {
            builder.add_point(key, vec![x]).unwrap();
        }
        let report = builder.build().unwrap();
        let g = &report.graph;

        let b = g.node_by_key("b").unwrap();
        // c is at 2.25: a neighbor (<= 2.5) without contribution (> 2.0)
        assert_eq!(b.neighbors().collect::<Vec<_>>(), vec![NodeId(0), NodeId(2)]);
        assert_eq!(b.neighbor_weight(NodeId(2)), Some(0.0));
        assert!(close(b.neighbor_weight(NodeId(0)).unwrap(), (-1.0f64).exp()));

        // b holds the raw maximum, c and d have no contribution at all
        assert!(close(b.density(), 1.0));
        assert!(close(g.node_by_key("d").unwrap().density(), 0.0));

        assert!(close(report.policy.beta(), 0.64));
        assert_eq!(report.policy.squared_distance(1, 2), Some(2.25 * 2.25));
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn into_scorer_keeps_row_order() {
        let mut builder = RadiusPotentialBuilder::new(RadiusPotentialConfig::default()).unwrap();
        builder.add_point("first", vec![0.0, 0.0]).unwrap();
        builder.add_point("second", vec![0.5, 0.0]).unwrap();
        let scorer = builder.build().unwrap().into_scorer().unwrap();
        assert_eq!(scorer.index_of("second").unwrap(), 1);
        assert_eq!(scorer.neighbors(0).unwrap(), &[1]);
        assert_eq!(scorer.config().scaling, DecrementScaling::SelectedPotential);
    }
}
