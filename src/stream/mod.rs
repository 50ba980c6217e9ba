//! Stream combinators used by the outbound side.

pub mod pace;

pub use pace::{Pace, PaceExt};
