//! Recording debug sink and scripted approval handler.

use crate::debug_bus::DebugSink;
use async_trait::async_trait;
use smithers_proto::{ApprovalHandler, ApprovalPrompt, DebugEvent};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// Collects every debug event it receives. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<DebugEvent>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DebugEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn tags(&self) -> Vec<&'static str> {
        self.events().iter().map(DebugEvent::tag).collect()
    }

    /// Number of events with the given tag.
    pub fn count(&self, tag: &str) -> usize {
        self.tags().into_iter().filter(|t| *t == tag).count()
    }
}

impl DebugSink for CollectingSink {
    fn on_event(&self, event: &DebugEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Returns scripted decisions in order, then `default`.
#[derive(Debug, Clone)]
pub struct ScriptedApprover {
    decisions: Arc<Mutex<VecDeque<bool>>>,
    default: bool,
    prompts: Arc<Mutex<Vec<ApprovalPrompt>>>,
}

impl ScriptedApprover {
    pub fn new(decisions: impl IntoIterator<Item = bool>) -> Self {
        Self {
            decisions: Arc::new(Mutex::new(decisions.into_iter().collect())),
            default: true,
            prompts: Arc::default(),
        }
    }

    /// Decision once the script is exhausted.
    pub fn with_default(mut self, default: bool) -> Self {
        self.default = default;
        self
    }

    /// Every prompt received, in order.
    pub fn prompts(&self) -> Vec<ApprovalPrompt> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ApprovalHandler for ScriptedApprover {
    async fn decide(&self, prompt: &ApprovalPrompt) -> bool {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt.clone());
        self.decisions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(self.default)
    }
}
