pub mod analysis;
pub mod classification;
pub mod event;
pub mod focus;
pub mod sample;
pub mod segment;
pub mod session;

pub use analysis::{EmotionSample, EmotionTimeline, PatternSegment, PatternSummary};
pub use classification::{ClassificationResult, SourceLabels, FALLBACK_LABEL};
pub use event::{AlertKind, DistractionEvent};
pub use focus::{AttentionState, FocusSnapshot, StateTransition, TransitionTrigger};
pub use sample::{DropStage, DroppedSample, ImageRef, SamplePair, SourceKind};
pub use segment::{AnalysisSourceKind, ReconciledSegment};
pub use session::{Session, SessionCounts, SessionInfo, SessionStatus};
