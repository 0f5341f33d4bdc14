//! Domain types used throughout the fitting pipeline.
//!
//! This module defines:
//!
//! - configuration enums (`FitAlgorithm`, `CouplingMode`, `WeightingMode`)
//! - the acquisition geometry (`Acquisition`)
//! - run/outcome states and the cooperative `CancellationToken`

pub mod types;

pub use types::*;
