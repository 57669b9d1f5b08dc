pub mod events;
pub mod samples;
pub mod segments;
pub mod sessions;
pub mod transitions;
