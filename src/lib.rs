//! Workspace facade over the plate recognition crates.

pub use common::plates;
pub use recognition;
pub use telemetry;
