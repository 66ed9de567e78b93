//! # Graph Density Core
//!
//! Density and potential scoring for selecting representative rows to label
//! in an active-learning loop.
//!
//! ```rust
//! use graphdensity_core::{ConstantDecrement, DensityGraph, DensityScorer};
//!
//! let mut graph = DensityGraph::new();
//! let a = graph.add_node("a", vec![0.0]).unwrap();
//! let b = graph.add_node("b", vec![1.0]).unwrap();
//! let c = graph.add_node("c", vec![2.0]).unwrap();
//! graph.connect(a, b, 1.0).unwrap();
//! graph.connect(b, c, 1.0).unwrap();
//!
//! let mut scorer = DensityScorer::new(graph, ConstantDecrement(1.0)).unwrap();
//! let picked: Vec<_> = scorer
//!     .select(2)
//!     .unwrap()
//!     .into_iter()
//!     .map(|s| s.key.to_string())
//!     .collect();
//! assert_eq!(picked, vec!["b", "a"]);
//! ```

#![forbid(unsafe_code)]

pub mod engine;

// Re-export commonly used types
pub use engine::builder::{
    BuildReport, KnnDensityBuilder, KnnDensityConfig, MissingValues, RadiusPotentialBuilder,
    RadiusPotentialConfig,
};
pub use engine::errors::{ScoreError, ScoreResult};
pub use engine::graph::{DensityGraph, Edge, GraphNode, NodeId, RowKey};
pub use engine::policy::{
    ConstantDecrement, DecrementPolicy, DecrementScaling, EdgeWeightDecrement, GaussianDecrement,
};
pub use engine::scorer::{DensityScorer, ScorerConfig, Selection, UnknownRows, UpdateSummary};
