//! The fitting engine: variable projection over the separable model, the
//! Poisson maximum-likelihood alternative, and the per-unit fit driver.

pub mod mle;
pub mod projector;
pub mod region;

pub use mle::*;
pub use projector::*;
pub use region::*;
