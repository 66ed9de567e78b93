//! Test-only crate. The suites live under `tests/`.
