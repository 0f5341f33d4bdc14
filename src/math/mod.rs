//! Mathematical utilities: the amplitude-fraction simplex transform,
//! smooth constraint penalties, rank-revealing least squares and the
//! Levenberg-Marquardt driver.

pub mod lm;
pub mod penalty;
pub mod simplex;
pub mod solve;

pub use lm::*;
pub use penalty::*;
pub use simplex::*;
pub use solve::*;
