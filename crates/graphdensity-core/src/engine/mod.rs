//! The scoring engine for density-based active learning.
//!
//! This module provides:
//! - **errors**: Error type shared by every fallible operation
//! - **graph**: Row keys, graph nodes and the node arena
//! - **policy**: Decrement policies applied to neighbors of a selected point
//! - **scorer**: Potential model and greedy selection
//! - **builder**: Reference neighbor builders (k-NN density, radius potential)
//! - **uncertainty**: Entropy, variance and least-confidence measures

pub mod builder;
pub mod errors;
pub mod graph;
pub mod policy;
pub mod scorer;
pub mod uncertainty;
