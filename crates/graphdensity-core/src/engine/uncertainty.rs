//! Uncertainty measures over class probability distributions.
//!
//! These complement density scores in an active-learning loop: a classifier's
//! predicted distribution for a row is turned into a scalar uncertainty.

use crate::engine::errors::{ScoreError, ScoreResult};

/// Tolerance on the total probability mass of a distribution.
pub const DISTRIBUTION_TOLERANCE: f64 = 1e-7;

/// Base-2 logarithm with `log2(0) = 0`, so that `0 * log2(0)` terms vanish.
#[inline]
pub fn log2(x: f64) -> f64 {
    if x == 0.0 {
        0.0
    } else {
        x.log2()
    }
}

/// Checks that `p` sums to 1 within [`DISTRIBUTION_TOLERANCE`].
pub fn check_distribution(p: &[f64]) -> ScoreResult<()> {
    let sum: f64 = p.iter().sum();
    if (sum - 1.0).abs() <= DISTRIBUTION_TOLERANCE {
        Ok(())
    } else {
        Err(ScoreError::Numerical(format!(
            "probabilities must sum to 1, got {sum}"
        )))
    }
}

/// Shannon entropy normalized to `[0, 1]` by `log2(p.len())`.
///
/// Degenerate results (a single class) are reported as 0.
pub fn entropy(p: &[f64]) -> ScoreResult<f64> {
    check_distribution(p)?;
    let raw: f64 = -p.iter().map(|&pi| pi * log2(pi)).sum::<f64>();
    let normalized = raw / log2(p.len() as f64);
    Ok(if normalized.is_nan() { 0.0 } else { normalized })
}

/// Sample variance (n - 1 denominator) of the class probabilities.
pub fn variance(p: &[f64]) -> ScoreResult<f64> {
    check_distribution(p)?;
    if p.len() < 2 {
        return Ok(0.0);
    }
    let n = p.len() as f64;
    let mean = p.iter().sum::<f64>() / n;
    let ss: f64 = p.iter().map(|&pi| (pi - mean) * (pi - mean)).sum();
    Ok(ss / (n - 1.0))
}

/// `1 - max(p)`; 1.0 for an empty slice.
pub fn least_confident(p: &[f64]) -> f64 {
    1.0 - p.iter().copied().fold(0.0, f64::max)
}
