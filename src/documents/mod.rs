//! Documents: normalizes responses into the [`crate::graph::Graph`] and
//! materializes result trees back out of it (spec §4.5/§4.6).
pub mod materialize;
pub mod normalize;

pub use materialize::{Availability, MaterializeOptions, MaterializeResult, Materializer, Source};
pub use normalize::normalize;
