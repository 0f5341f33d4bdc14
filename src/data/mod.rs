//! Data access: the pull-based [`FitData`] surface the scheduler consumes,
//! an in-memory [`ImageSet`] implementation, and seeded synthetic decay
//! generation for tests.

pub mod image_set;
pub mod sample;
pub mod source;

pub use image_set::*;
pub use sample::*;
pub use source::*;
