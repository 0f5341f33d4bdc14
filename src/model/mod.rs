//! Decay model composition.
//!
//! A [`DecayModel`] composes polymorphic [`DecayGroup`]s (multi-exponential,
//! FRET, fixed pattern) into the design matrix and Jacobian block consumed
//! by the fitting engine, with [`FittingParameter`] bookkeeping and the
//! [`IncMatrix`] separability structure.

pub mod decay_model;
pub mod fret;
pub mod group;
pub mod inc;
pub mod multi_exponential;
pub mod parameter;
pub mod pattern;

pub use decay_model::*;
pub use fret::*;
pub use group::*;
pub use inc::*;
pub use multi_exponential::*;
pub use parameter::*;
pub use pattern::*;
