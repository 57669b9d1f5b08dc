//! Session lifecycle: starting, pausing and ending the pipeline, and the
//! startup pass over whatever an earlier crash left behind.

mod controller;
pub mod recovery;

pub use controller::SessionController;
pub use recovery::{recover, RecoveryPolicy, RecoveryReport, ResumeClassifier};
