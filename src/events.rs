//! Typed events for the UI collaborator.
//!
//! Delivery is at-most-once: a slow subscriber loses the oldest messages and
//! publishing never fails or blocks, so a missing UI cannot affect fusion.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{AttentionState, DistractionEvent, StateTransition};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub session_id: String,
    pub processed: u64,
    pub fallbacks: u64,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "event", content = "payload")]
pub enum PipelineEvent {
    StateChanged {
        at: DateTime<Utc>,
        transition: StateTransition,
    },
    DistractionDetected {
        at: DateTime<Utc>,
        event: DistractionEvent,
    },
    FocusRestored {
        at: DateTime<Utc>,
        from_state: AttentionState,
        confidence: f64,
    },
    UploadProgress {
        at: DateTime<Utc>,
        progress: UploadProgress,
    },
}

impl PipelineEvent {
    /// Wire name, in the same style as the UI's other event channels.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::StateChanged { .. } => "state-changed",
            PipelineEvent::DistractionDetected { .. } => "distraction-detected",
            PipelineEvent::FocusRestored { .. } => "focus-restored",
            PipelineEvent::UploadProgress { .. } => "upload-progress",
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            PipelineEvent::StateChanged { at, .. }
            | PipelineEvent::DistractionDetected { at, .. }
            | PipelineEvent::FocusRestored { at, .. }
            | PipelineEvent::UploadProgress { at, .. } => *at,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Fire and forget. Having no subscribers is not an error.
    pub fn publish(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    /// Emits `state-changed`, plus `focus-restored` when returning to Focused.
    pub fn publish_transition(&self, transition: &StateTransition) {
        let at = transition.at;
        self.publish(PipelineEvent::StateChanged {
            at,
            transition: transition.clone(),
        });
        if transition.to_state == AttentionState::Focused
            && transition.from_state != AttentionState::Focused
        {
            self.publish(PipelineEvent::FocusRestored {
                at,
                from_state: transition.from_state,
                confidence: transition.confidence,
            });
        }
    }
}
