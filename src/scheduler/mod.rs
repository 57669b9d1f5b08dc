//! Wall-clock capture scheduling.

mod controller;
mod loop_worker;
mod source;

pub use controller::CaptureScheduler;
pub use loop_worker::{SchedulerContext, SchedulerStats};
pub use source::{FrameSource, SpoolFrameSource};
