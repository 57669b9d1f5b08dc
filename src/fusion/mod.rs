//! Hysteresis fusion of classification results into an attention state.

mod engine;
pub mod tracker;

pub use engine::{spawn_fusion, FusionContext, FusionHandle, FusionStats};
pub use tracker::{FocusTracker, RejectReason, RetainReason, UpdateOutcome};
