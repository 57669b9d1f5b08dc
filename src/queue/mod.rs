pub mod bounded;

pub use bounded::{BoundedQueue, OverflowPolicy, PushOutcome, QueueClosed, QueueStats};
