//! Error types for density scoring.

use thiserror::Error;

use crate::engine::graph::RowKey;

/// Result alias used throughout the engine.
pub type ScoreResult<T> = Result<T, ScoreError>;

/// Errors raised by graph construction, scoring and selection.
///
/// All failures are local and synchronous. Single-row operations that return
/// an error have not mutated any state.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in the future without breaking changes.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScoreError {
    /// A caller passed an argument that violates an operation's precondition
    /// (self-registration, decrement for a non-neighbor pair, negative decrement).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Lookup by a row key that is not part of the model.
    #[error("unknown row '{0}'")]
    UnknownRow(RowKey),

    /// Index-based access outside `[0, len)`.
    #[error("index {index} out of range for {len} rows")]
    IndexOutOfRange { index: usize, len: usize },

    /// Invalid model or builder configuration (duplicate keys, too few rows,
    /// out-of-domain parameters).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Non-finite input or an invalid probability distribution.
    #[error("numerical error: {0}")]
    Numerical(String),
}

impl ScoreError {
    pub(crate) fn out_of_range(index: usize, len: usize) -> Self {
        ScoreError::IndexOutOfRange { index, len }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_value() {
        let err = ScoreError::UnknownRow(RowKey::from("row7"));
        assert_eq!(err.to_string(), "unknown row 'row7'");

        let err = ScoreError::out_of_range(4, 3);
        assert_eq!(err.to_string(), "index 4 out of range for 3 rows");
    }
}
