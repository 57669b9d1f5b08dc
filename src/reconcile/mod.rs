pub mod algorithm;
pub mod config;
pub mod keywords;
pub mod scoring;

pub use algorithm::{reconcile, state_spans, ReconcileInput, StateSpan};
pub use config::ReconciliationConfig;
pub use keywords::{default_keyword_rules, extract_labels, KeywordRule};
