//! `flim-fit` library crate.
//!
//! Global analysis of time-resolved fluorescence (FLIM) images: decay
//! models built from composable groups are fitted to many thousands of
//! pixel decays by separable nonlinear least squares, with the linear
//! intensity fractions eliminated analytically at every step and a
//! multi-threaded controller scheduling the work across pixels, regions
//! and images.
//!
//! The crate is UI- and storage-agnostic: callers feed it decay stacks
//! through the [`data::FitData`] trait and read plain result structs back.

pub mod control;
pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod irf;
pub mod math;
pub mod model;
