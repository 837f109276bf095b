//! Domain models for the casesync system.

mod report;

pub use report::*;
